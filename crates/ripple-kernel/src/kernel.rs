//! Kernel - the canonical store and its client endpoint
//!
//! One lock guards the store and the per-origin clock. Every verdict is
//! published on a broadcast channel while that lock is held, so a
//! subscriber that takes its snapshot under the same lock sees each
//! transaction either in the snapshot or on its stream, never both.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ripple_codec::{shared_snapshot, InstructionSet};
use ripple_core::{ClientClock, ClientId, RippleError, RippleResult};
use ripple_store::Db;
use ripple_transport::{BroadcastSender, RemoteKernel, Subscription, TransactionReceiver};
use ripple_wire::{Broadcast, DurableFact, Transaction};

use crate::KernelConfig;

/// Verdict on one transaction, as published to subscribers
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KernelEvent {
    Applied(Transaction),
    /// Failed to apply; the origin's clock still advanced
    Failed(Transaction),
    /// Stale reads; the origin's clock did not advance
    Rejected(Transaction),
    /// Every subscriber must reconnect
    Reset,
}

impl KernelEvent {
    /// What `client` is told about this event
    pub fn broadcast_for(&self, client: ClientId) -> Option<Broadcast> {
        match self {
            KernelEvent::Applied(tx) if tx.origin == client => Some(Broadcast::Ack(tx.id)),
            KernelEvent::Applied(tx) => Some(Broadcast::Tx(tx.without_validations())),
            KernelEvent::Failed(tx) => Some(Broadcast::Failure(tx.origin, tx.id)),
            KernelEvent::Rejected(tx) if tx.origin == client => Some(Broadcast::Rejection(tx.id)),
            KernelEvent::Rejected(_) => None,
            KernelEvent::Reset => Some(Broadcast::Reset),
        }
    }
}

pub(crate) struct KernelState {
    pub(crate) db: Db,
    pub(crate) clock: ClientClock,
}

/// Canonical kernel
pub struct Kernel {
    pub(crate) state: Mutex<KernelState>,
    pub(crate) set: Arc<InstructionSet>,
    pub(crate) events: broadcast::Sender<KernelEvent>,
    pub(crate) leader_id: ClientId,
    config: KernelConfig,
}

impl Kernel {
    pub fn new(set: Arc<InstructionSet>, config: KernelConfig) -> Self {
        Self::with_db(Db::new(), set, config)
    }

    /// Kernel over an existing store
    pub fn with_db(db: Db, set: Arc<InstructionSet>, config: KernelConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Kernel {
            state: Mutex::new(KernelState {
                db,
                clock: ClientClock::new(),
            }),
            set,
            events,
            leader_id: config.leader_id.unwrap_or_else(ClientId::generate),
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn leader_id(&self) -> ClientId {
        self.leader_id
    }

    /// Read the canonical store
    pub fn read<T>(&self, f: impl FnOnce(&Db) -> T) -> T {
        f(&self.state.lock().db)
    }

    pub fn clock(&self) -> ClientClock {
        self.state.lock().clock.clone()
    }

    /// Durable snapshot of the Shared partition
    pub fn snapshot(&self) -> RippleResult<Vec<DurableFact>> {
        shared_snapshot(&self.state.lock().db)
    }

    /// Live subscriber streams
    pub fn subscribers(&self) -> usize {
        self.events.receiver_count()
    }

    /// Order and apply one transaction
    ///
    /// Returns the published verdict, or `None` when the index is not the
    /// next one expected from the origin.
    pub fn apply(&self, tx: Transaction) -> Option<KernelEvent> {
        let mut state = self.state.lock();
        if !state.clock.expects(tx.origin, tx.index) {
            debug!(
                "Dropping {} from {}: index {}, expected {}",
                tx.id,
                tx.origin,
                tx.index,
                state.clock.next_index(tx.origin)
            );
            return None;
        }

        let event = match self.set.transact_wire(&mut state.db, &tx.instructions) {
            Ok(novelty) => {
                state.clock.tick(tx.origin);
                debug!("Applied {} from {} ({} facts)", tx.id, tx.origin, novelty.len());
                KernelEvent::Applied(tx)
            }
            Err(e) if e.is_conflict() => {
                info!("Rejected {} from {}: {}", tx.id, tx.origin, e);
                KernelEvent::Rejected(tx)
            }
            Err(e) => {
                state.clock.tick(tx.origin);
                warn!("Failed {} from {}: {}", tx.id, tx.origin, e);
                KernelEvent::Failed(tx)
            }
        };

        // no subscribers is fine
        let _ = self.events.send(event.clone());
        Some(event)
    }

    /// Force every connected client to reload from a fresh snapshot
    pub fn reset_subscribers(&self) {
        let _state = self.state.lock();
        info!("Resetting {} subscriber(s)", self.events.receiver_count());
        let _ = self.events.send(KernelEvent::Reset);
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("leader_id", &self.leader_id)
            .field("subscribers", &self.subscribers())
            .field("config", &self.config)
            .finish()
    }
}

/// Forward kernel events to one client until it goes away
async fn relay_events(client: ClientId, mut events: broadcast::Receiver<KernelEvent>, out: BroadcastSender) {
    loop {
        let broadcast = match events.recv().await {
            Ok(KernelEvent::Reset) | Err(RecvError::Closed) => {
                let _ = out.send(Broadcast::Reset).await;
                return;
            }
            Ok(event) => match event.broadcast_for(client) {
                Some(broadcast) => broadcast,
                None => continue,
            },
            Err(RecvError::Lagged(missed)) => {
                warn!("Subscriber {} lagged by {} events, resetting", client, missed);
                let _ = out.send(Broadcast::Reset).await;
                return;
            }
        };
        if out.send(broadcast).await.is_err() {
            debug!("Subscriber {} gone", client);
            return;
        }
    }
}

#[async_trait]
impl RemoteKernel for Kernel {
    async fn subscribe(&self, client: ClientId) -> RippleResult<Subscription> {
        let (snapshot, clock, events) = {
            let state = self.state.lock();
            let snapshot = shared_snapshot(&state.db)?;
            (snapshot, state.clock.clone(), self.events.subscribe())
        };
        info!("Client {} subscribed: {} facts", client, snapshot.len());

        let (out, broadcasts) = mpsc::channel(self.config.subscriber_buffer.max(1));
        tokio::spawn(relay_events(client, events, out));

        Ok(Subscription {
            snapshot,
            broadcasts,
            clock,
        })
    }

    async fn transact(&self, client: ClientId, mut transactions: TransactionReceiver) -> RippleResult<()> {
        while let Some(tx) = transactions.recv().await {
            if tx.origin != client {
                return Err(RippleError::ProtocolViolation(format!(
                    "client {} sent {} as {}",
                    client, tx.id, tx.origin
                )));
            }
            self.apply(tx);
        }
        debug!("Client {} transaction stream closed", client);
        Ok(())
    }
}
