//! Framed in-process relays
//!
//! Messages are encoded into length-prefixed frames and decoded on the far
//! side, the way a byte transport would carry them. Anything that does not
//! survive the wire format fails here rather than in production.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

use ripple_core::{ClientId, RippleResult};
use ripple_wire::{decode_frame, encode_frame, DurableFact};

use crate::{RemoteKernel, Subscription, TransactionReceiver};

/// Default relay buffer
pub const DEFAULT_RELAY_BUFFER: usize = 256;

/// Relay every message from `rx` through the frame codec
///
/// The returned receiver closes when `rx` closes, when its own receiver is
/// dropped, or when a message fails to encode or decode.
pub fn framed_relay<T>(mut rx: mpsc::Receiver<T>, buffer: usize) -> mpsc::Receiver<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    let (tx, out) = mpsc::channel(buffer);

    tokio::spawn(async move {
        let mut wire = BytesMut::new();
        while let Some(message) = rx.recv().await {
            match encode_frame(&message) {
                Ok(frame) => wire.extend_from_slice(&frame),
                Err(e) => {
                    warn!("Relay encode error: {}", e);
                    break;
                }
            }

            loop {
                match decode_frame::<T>(&mut wire) {
                    Ok(Some(decoded)) => {
                        if tx.send(decoded).await.is_err() {
                            return; // Receiver dropped
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Relay decode error: {}", e);
                        return;
                    }
                }
            }
        }
    });

    out
}

/// Kernel wrapper that frames every message in both directions
pub struct FramedKernel<K: ?Sized> {
    inner: Arc<K>,
    buffer: usize,
}

impl<K: RemoteKernel + ?Sized> FramedKernel<K> {
    pub fn new(inner: Arc<K>) -> Self {
        Self::with_buffer(inner, DEFAULT_RELAY_BUFFER)
    }

    pub fn with_buffer(inner: Arc<K>, buffer: usize) -> Self {
        FramedKernel { inner, buffer }
    }

    /// Get the wrapped kernel
    pub fn inner(&self) -> &Arc<K> {
        &self.inner
    }
}

#[async_trait]
impl<K: RemoteKernel + ?Sized + 'static> RemoteKernel for FramedKernel<K> {
    async fn subscribe(&self, client: ClientId) -> RippleResult<Subscription> {
        let subscription = self.inner.subscribe(client).await?;

        let mut wire = BytesMut::from(&encode_frame(&subscription.snapshot)?[..]);
        let snapshot: Vec<DurableFact> = decode_frame(&mut wire)?.unwrap_or_default();

        Ok(Subscription {
            snapshot,
            broadcasts: framed_relay(subscription.broadcasts, self.buffer),
            clock: subscription.clock,
        })
    }

    async fn transact(&self, client: ClientId, transactions: TransactionReceiver) -> RippleResult<()> {
        let relayed = framed_relay(transactions, self.buffer);
        self.inner.transact(client, relayed).await
    }
}
