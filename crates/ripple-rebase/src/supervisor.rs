//! Supervisor - keeps a replica connected for the lifetime of a body

use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use ripple_codec::InstructionSet;
use ripple_core::{ClientId, RippleError, RippleResult};
use ripple_transport::RemoteKernel;

use crate::{run_connection, RebaseConfig, Replica, ReplicaDriver, SyncState};

/// Run `body` against a replica kept in sync with `kernel`
///
/// The rebase loop runs in the background for as long as `body` does and
/// is shut down when it returns. A connection failure the reconnect policy
/// does not cover is returned once `body` completes.
pub async fn with_rebase_loop<K, F, Fut, T>(
    kernel: Arc<K>,
    set: Arc<InstructionSet>,
    config: RebaseConfig,
    body: F,
) -> RippleResult<T>
where
    K: RemoteKernel + ?Sized + 'static,
    F: FnOnce(Replica) -> Fut,
    Fut: Future<Output = T>,
{
    let me = config.client_id.unwrap_or_else(ClientId::generate);
    let (replica, driver) = Replica::new(me, set);
    let (stop, shutdown) = watch::channel(false);

    let supervisor = tokio::spawn(supervise(kernel, driver, config, shutdown));
    let value = body(replica).await;

    let _ = stop.send(true);
    supervisor
        .await
        .map_err(|e| RippleError::TransportError(format!("rebase loop panicked: {}", e)))??;
    Ok(value)
}

/// Connect, and reconnect per policy, until shutdown
pub async fn supervise<K>(
    kernel: Arc<K>,
    mut driver: ReplicaDriver,
    config: RebaseConfig,
    mut shutdown: watch::Receiver<bool>,
) -> RippleResult<()>
where
    K: RemoteKernel + ?Sized + 'static,
{
    let mut carried = Vec::new();
    let mut attempt = 0u32;

    loop {
        let end = run_connection(kernel.clone(), &mut driver, &config, carried, &mut shutdown).await;
        driver.state_tx.send_replace(SyncState::Disconnected);
        carried = end.carried;

        let e = match end.result {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        if *shutdown.borrow() {
            return Ok(());
        }

        if end.connected {
            attempt = 0;
        }
        attempt += 1;
        if !config.reconnect.allows(attempt) {
            error!("Client {} giving up after {} attempt(s): {}", driver.me, attempt - 1, e);
            return Err(match config.reconnect.max_attempts {
                Some(0) => e,
                _ => RippleError::ReconnectExhausted(attempt - 1),
            });
        }

        warn!(
            "Client {} reconnecting (attempt {}, {} carried): {}",
            driver.me,
            attempt,
            carried.len(),
            e
        );
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tokio::time::sleep(config.reconnect.backoff()) => {}
        }
        info!("Client {} reconnecting now", driver.me);
    }
}
