//! Remote kernel contract

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use ripple_core::{ClientClock, ClientId, RippleResult};
use ripple_wire::{Broadcast, DurableFact, Transaction};

/// Outgoing transaction channel
pub type TransactionSender = mpsc::Sender<Transaction>;

/// Incoming transaction channel (kernel side)
pub type TransactionReceiver = mpsc::Receiver<Transaction>;

/// Broadcast channel (kernel side)
pub type BroadcastSender = mpsc::Sender<Broadcast>;

/// Broadcast stream (client side)
pub type BroadcastReceiver = mpsc::Receiver<Broadcast>;

/// What a client receives on subscribing
#[derive(Debug)]
pub struct Subscription {
    /// Every Shared fact at subscription time
    pub snapshot: Vec<DurableFact>,
    /// Broadcasts from the snapshot onward
    pub broadcasts: BroadcastReceiver,
    /// Kernel clock matching the snapshot
    pub clock: ClientClock,
}

/// The canonical kernel as seen by a client
#[async_trait]
pub trait RemoteKernel: Send + Sync {
    /// Snapshot, live stream and clock, taken atomically
    async fn subscribe(&self, client: ClientId) -> RippleResult<Subscription>;

    /// Consume one connection's transactions until the sender is dropped
    async fn transact(&self, client: ClientId, transactions: TransactionReceiver) -> RippleResult<()>;
}

#[async_trait]
impl<K: RemoteKernel + ?Sized> RemoteKernel for Arc<K> {
    async fn subscribe(&self, client: ClientId) -> RippleResult<Subscription> {
        (**self).subscribe(client).await
    }

    async fn transact(&self, client: ClientId, transactions: TransactionReceiver) -> RippleResult<()> {
        (**self).transact(client, transactions).await
    }
}
