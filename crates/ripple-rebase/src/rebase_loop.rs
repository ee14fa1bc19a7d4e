//! Rebase loop - one connection to the kernel
//!
//! ```text
//! commits ──┐                          ┌──▶ outgoing ──▶ kernel.transact
//!           ├──▶ RebaseLog ──(offers)──┤
//! kernel ───┘                          └──▶ OfferQueue ──▶ visible state
//! ```
//!
//! The loop owns the log. The offering task applies offers to the visible
//! state; the transact task forwards outgoing transactions. Both end with
//! the connection.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace};

use ripple_core::{RippleError, RippleResult};
use ripple_transport::{RemoteKernel, Subscription};
use ripple_wire::Broadcast;

use crate::{Offer, OfferQueue, RebaseConfig, RebaseLog, RebaseLogEntry, ReplicaDriver, SyncState};

/// How a connection ended
#[derive(Debug)]
pub struct ConnectionEnd {
    pub result: RippleResult<()>,
    /// Local entries without a verdict, for the next connection
    pub carried: Vec<RebaseLogEntry>,
    /// Whether a snapshot was loaded
    pub connected: bool,
}

/// Run one connection until shutdown, a fatal error or a closed stream
pub async fn run_connection<K>(
    kernel: Arc<K>,
    driver: &mut ReplicaDriver,
    config: &RebaseConfig,
    carried: Vec<RebaseLogEntry>,
    shutdown: &mut watch::Receiver<bool>,
) -> ConnectionEnd
where
    K: RemoteKernel + ?Sized + 'static,
{
    let me = driver.me;
    let Subscription {
        snapshot,
        mut broadcasts,
        clock,
    } = match kernel.subscribe(me).await {
        Ok(subscription) => subscription,
        Err(e) => {
            return ConnectionEnd {
                result: Err(e),
                carried,
                connected: false,
            }
        }
    };

    let loaded = RebaseLog::from_snapshot(me, &snapshot, clock.clone()).and_then(|log| {
        let mut visible = driver.visible.lock();
        let epoch = visible.load_snapshot(&snapshot, clock)?;
        // commits are sent under this lock; anything queued lost its pending entry just now
        let mut queued = Vec::new();
        while let Ok(commit) = driver.commits.try_recv() {
            queued.push(commit);
        }
        Ok((log, epoch, queued))
    });
    let (mut log, epoch, queued) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            return ConnectionEnd {
                result: Err(e),
                carried,
                connected: false,
            }
        }
    };
    driver.ready_tx.send_replace(true);
    info!("Client {} connected: {} facts, epoch {}", me, snapshot.len(), epoch);

    let settled = log.clock().get(me);
    for entry in carried {
        if entry.sent && entry.index <= settled {
            debug!("Carried {} was settled by the kernel", entry.id);
            continue;
        }
        log.append(entry.unsent());
    }
    for commit in queued {
        log.append(RebaseLogEntry::local(me, commit.id, commit.wire));
    }

    let (outgoing, outgoing_rx) = mpsc::channel(config.outgoing_buffer);
    let transact = {
        let kernel = kernel.clone();
        tokio::spawn(async move { kernel.transact(me, outgoing_rx).await })
    };

    let queue = Arc::new(OfferQueue::new());
    let offering = {
        let queue = queue.clone();
        let visible = driver.visible.clone();
        tokio::spawn(async move {
            loop {
                let offer = queue.take().await;
                let applied = visible.lock().apply_offer(offer);
                if let Err(e) = applied {
                    error!("Offer failed: {}", e);
                }
            }
        })
    };

    let set = driver.set.clone();
    let mut offered: Option<Offer> = None;
    let stopped = *shutdown.borrow();
    let result = if stopped {
        Ok(())
    } else {
        loop {
            if log.is_rebasing() {
                driver.state_tx.send_replace(SyncState::Rebasing);
            } else {
                offer_if_changed(&queue, &mut offered, log.take_offer(epoch));
            }

            tokio::select! {
                biased;

                _ = shutdown.changed() => break Ok(()),

                message = broadcasts.recv() => match message {
                    Some(broadcast) => {
                        if let Err(e) = handle_broadcast(&mut log, broadcast) {
                            break Err(e);
                        }
                    }
                    None => break Err(RippleError::StreamClosed),
                },

                commit = driver.commits.recv() => match commit {
                    Some(commit) => {
                        log.skip_local_changes(commit.id);
                        log.append(RebaseLogEntry::local(me, commit.id, commit.wire));
                    }
                    None => break Ok(()),
                },

                _ = std::future::ready(()), if log.is_rebasing() => {
                    match log.continue_rebase(&set) {
                        Ok(Some(tx)) => {
                            trace!("Sending {} (index {})", tx.id, tx.index);
                            if outgoing.send(tx).await.is_err() {
                                break Err(RippleError::ConnectionClosed);
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }
            }
        }
    };

    offering.abort();
    transact.abort();
    drop(outgoing);
    if !log.is_rebasing() {
        offer_if_changed(&queue, &mut offered, log.take_offer(epoch));
    }
    if let Some(offer) = queue.try_take() {
        let applied = driver.visible.lock().apply_offer(offer);
        if let Err(e) = applied {
            error!("Offer failed: {}", e);
        }
    }

    match &result {
        Ok(()) => info!("Client {} disconnected", me),
        Err(e) => error!("Client {} connection lost: {}", me, e),
    }

    ConnectionEnd {
        result,
        carried: log.into_carried(),
        connected: true,
    }
}

/// Queue `offer` unless it repeats the last one queued
fn offer_if_changed(queue: &OfferQueue, offered: &mut Option<Offer>, offer: Offer) {
    if !offer.changes_since(offered.as_ref()) {
        return;
    }
    *offered = Some(Offer {
        canonical: Vec::new(),
        ..offer.clone()
    });
    queue.push(offer);
}

fn handle_broadcast(log: &mut RebaseLog, broadcast: Broadcast) -> RippleResult<()> {
    trace!("Broadcast {}", broadcast.kind());
    match broadcast {
        Broadcast::Tx(tx) => log.consume_tx(tx),
        Broadcast::Ack(id) => log.ack(id, false),
        Broadcast::Failure(origin, id) if origin == log.me() => log.ack(id, true),
        Broadcast::Failure(origin, _) => {
            log.note_failure(origin);
            Ok(())
        }
        Broadcast::Rejection(id) => log.reject(id),
        Broadcast::Reset => Err(RippleError::Reset),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use ripple_codec::InstructionSet;
    use ripple_core::{AttributeSchema, ClientClock, ClientId, Partition, Value};
    use ripple_transport::{BroadcastSender, TransactionReceiver};
    use ripple_wire::Transaction;
    use std::time::Duration;

    use crate::Replica;

    /// Kernel stand-in: broadcasts are scripted, transactions recorded
    struct ScriptedKernel {
        broadcasts: Mutex<Vec<BroadcastSender>>,
        received: mpsc::UnboundedSender<Transaction>,
        clock: Mutex<ClientClock>,
    }

    #[async_trait]
    impl RemoteKernel for ScriptedKernel {
        async fn subscribe(&self, _client: ClientId) -> RippleResult<Subscription> {
            let (tx, rx) = mpsc::channel(16);
            self.broadcasts.lock().push(tx);
            Ok(Subscription {
                snapshot: Vec::new(),
                broadcasts: rx,
                clock: self.clock.lock().clone(),
            })
        }

        async fn transact(&self, _client: ClientId, mut transactions: TransactionReceiver) -> RippleResult<()> {
            while let Some(tx) = transactions.recv().await {
                let _ = self.received.send(tx);
            }
            Ok(())
        }
    }

    fn scripted() -> (Arc<ScriptedKernel>, mpsc::UnboundedReceiver<Transaction>) {
        let (received, rx) = mpsc::unbounded_channel();
        let kernel = Arc::new(ScriptedKernel {
            broadcasts: Mutex::new(Vec::new()),
            received,
            clock: Mutex::new(ClientClock::new()),
        });
        (kernel, rx)
    }

    fn create_todo(replica: &Replica) {
        replica
            .change(|c| {
                let name = c.attribute("todo/name", AttributeSchema::scalar())?;
                c.create_entity(Partition::Shared, "todo", vec![(name, Value::from("a"))])
            })
            .unwrap();
    }

    async fn next_tx(rx: &mut mpsc::UnboundedReceiver<Transaction>) -> Transaction {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[test]
    fn test_unchanged_log_queues_no_offer() {
        let me = ClientId::from_u128(1);
        let mut log = RebaseLog::empty(ripple_store::Db::new(), me, ClientClock::new());
        let queue = OfferQueue::new();
        let mut offered = None;

        offer_if_changed(&queue, &mut offered, log.take_offer(1));
        assert!(queue.try_take().is_some());

        offer_if_changed(&queue, &mut offered, log.take_offer(1));
        assert!(queue.try_take().is_none());

        log.note_failure(ClientId::from_u128(2));
        offer_if_changed(&queue, &mut offered, log.take_offer(1));
        let offer = queue.try_take().unwrap();
        assert_eq!(offer.clock.get(ClientId::from_u128(2)), 1);
    }

    #[tokio::test]
    async fn test_commit_sent_and_acked() {
        let (kernel, mut received) = scripted();
        let (replica, mut driver) = Replica::new(ClientId::from_u128(1), Arc::new(InstructionSet::standard()));
        let (stop, mut shutdown) = watch::channel(false);

        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                run_connection(kernel, &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await
            })
        };
        replica.ready().await.unwrap();

        create_todo(&replica);
        let tx = next_tx(&mut received).await;
        assert_eq!(tx.index, 1);
        assert_eq!(tx.origin, replica.me());

        let broadcaster = kernel.broadcasts.lock()[0].clone();
        broadcaster.send(Broadcast::Ack(tx.id)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), replica.wait_for_state(SyncState::InSync))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.clock().get(replica.me()), 1);

        stop.send(true).unwrap();
        let end = connection.await.unwrap();
        assert!(end.result.is_ok());
        assert!(end.carried.is_empty());
    }

    #[tokio::test]
    async fn test_ack_out_of_order_is_fatal() {
        let (kernel, mut received) = scripted();
        let (replica, mut driver) = Replica::new(ClientId::from_u128(1), Arc::new(InstructionSet::standard()));
        let (_stop, mut shutdown) = watch::channel(false);

        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                run_connection(kernel, &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await
            })
        };
        replica.ready().await.unwrap();

        create_todo(&replica);
        create_todo(&replica);
        next_tx(&mut received).await;
        let second = next_tx(&mut received).await;

        let broadcaster = kernel.broadcasts.lock()[0].clone();
        broadcaster.send(Broadcast::Ack(second.id)).await.unwrap();

        let end = connection.await.unwrap();
        assert!(matches!(end.result, Err(RippleError::ProtocolViolation(_))));
        assert_eq!(end.carried.len(), 2);
    }

    #[tokio::test]
    async fn test_rejection_resends_later_entries() {
        let (kernel, mut received) = scripted();
        let (replica, mut driver) = Replica::new(ClientId::from_u128(1), Arc::new(InstructionSet::standard()));
        let (stop, mut shutdown) = watch::channel(false);

        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                run_connection(kernel, &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await
            })
        };
        replica.ready().await.unwrap();

        create_todo(&replica);
        create_todo(&replica);
        let first = next_tx(&mut received).await;
        let second = next_tx(&mut received).await;
        assert_eq!(second.index, 2);

        let broadcaster = kernel.broadcasts.lock()[0].clone();
        broadcaster.send(Broadcast::Rejection(first.id)).await.unwrap();

        // the kernel dropped the second as out of order; it comes again as 1
        let resent = next_tx(&mut received).await;
        assert_eq!(resent.id, second.id);
        assert_eq!(resent.index, 1);

        broadcaster.send(Broadcast::Ack(second.id)).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), replica.wait_for_state(SyncState::InSync))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(replica.clock().get(replica.me()), 1);

        stop.send(true).unwrap();
        let end = connection.await.unwrap();
        assert!(end.result.is_ok());
        assert!(end.carried.is_empty());
    }

    #[tokio::test]
    async fn test_reset_and_closed_stream_are_fatal() {
        let (kernel, _received) = scripted();
        let (replica, mut driver) = Replica::new(ClientId::from_u128(1), Arc::new(InstructionSet::standard()));
        let (_stop, mut shutdown) = watch::channel(false);

        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                let first = run_connection(kernel.clone(), &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await;
                let second = run_connection(kernel, &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await;
                (first, second)
            })
        };
        replica.ready().await.unwrap();
        let first = kernel.broadcasts.lock()[0].clone();
        first.send(Broadcast::Reset).await.unwrap();

        // second connection: the kernel drops the stream
        let second = loop {
            if let Some(tx) = kernel.broadcasts.lock().get(1).cloned() {
                break tx;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        kernel.broadcasts.lock().clear();
        drop(second);

        let (first, second) = connection.await.unwrap();
        assert_eq!(first.result, Err(RippleError::Reset));
        assert_eq!(second.result, Err(RippleError::StreamClosed));
        assert!(second.connected);
    }

    #[tokio::test]
    async fn test_carried_entries_resent_after_kernel_clock() {
        let (kernel, mut received) = scripted();
        let (replica, mut driver) = Replica::new(ClientId::from_u128(1), Arc::new(InstructionSet::standard()));
        let (_stop, mut shutdown) = watch::channel(false);
        let me = replica.me();

        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                let end = run_connection(kernel, &mut driver, &RebaseConfig::testing(), Vec::new(), &mut shutdown).await;
                (end, driver, shutdown)
            })
        };
        replica.ready().await.unwrap();

        create_todo(&replica);
        create_todo(&replica);
        create_todo(&replica);
        let first = next_tx(&mut received).await;
        let second = next_tx(&mut received).await;
        let third = next_tx(&mut received).await;
        let broadcaster = kernel.broadcasts.lock()[0].clone();
        broadcaster.send(Broadcast::Reset).await.unwrap();

        let (end, mut driver, mut shutdown) = connection.await.unwrap();
        assert_eq!(end.result, Err(RippleError::Reset));
        assert_eq!(end.carried.len(), 3);

        // the kernel had applied the first before the reset
        kernel.clock.lock().set(me, first.index);
        let connection = {
            let kernel = kernel.clone();
            tokio::spawn(async move {
                run_connection(kernel, &mut driver, &RebaseConfig::testing(), end.carried, &mut shutdown).await
            })
        };

        let resent = next_tx(&mut received).await;
        assert_eq!(resent.id, second.id);
        assert_eq!(resent.index, 2);
        let resent = next_tx(&mut received).await;
        assert_eq!(resent.id, third.id);
        assert_eq!(resent.index, 3);
        connection.abort();
    }
}
