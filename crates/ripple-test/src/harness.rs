//! Cluster harness - one kernel, many supervised replicas, in process
//!
//! Every client talks to the kernel through a [`GatedKernel`], which can
//! hold a client's outgoing transactions in flight. That is how tests
//! line up races deterministically: hold A, let B write, release A.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use ripple_codec::{shared_snapshot, InstructionSet};
use ripple_core::{ClientClock, ClientId, RippleError, RippleResult};
use ripple_kernel::{Kernel, KernelConfig, Leader};
use ripple_rebase::{supervise, RebaseConfig, Replica, ReplicaDriver, SyncState};
use ripple_store::Db;
use ripple_transport::{FramedKernel, RemoteKernel, Subscription, TransactionReceiver, DEFAULT_RELAY_BUFFER};

const SETTLE_POLL: Duration = Duration::from_millis(5);

/// Harness errors
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Clients did not settle: {0:?}")]
    Unsettled(Vec<ClientId>),

    #[error("Client {0} stopped")]
    ClientStopped(ClientId),

    #[error("Client task panicked: {0}")]
    Panicked(String),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Ripple(#[from] RippleError),
}

pub type HarnessResult<T> = Result<T, HarnessError>;

// ============================================================================
// GATED TRANSPORT
// ============================================================================

/// Kernel wrapper that can hold a client's transactions in flight
///
/// Gates start open. A held transaction is delivered in order on release,
/// or dropped if its connection ends first.
pub struct GatedKernel {
    inner: Arc<dyn RemoteKernel>,
    gates: Mutex<HashMap<ClientId, watch::Sender<bool>>>,
    connections: Mutex<HashMap<ClientId, usize>>,
}

impl GatedKernel {
    pub fn new(inner: Arc<dyn RemoteKernel>) -> Self {
        GatedKernel {
            inner,
            gates: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn set_gate(&self, client: ClientId, open: bool) {
        self.gates
            .lock()
            .entry(client)
            .or_insert_with(|| watch::channel(true).0)
            .send_replace(open);
    }

    fn gate(&self, client: ClientId) -> watch::Receiver<bool> {
        self.gates
            .lock()
            .entry(client)
            .or_insert_with(|| watch::channel(true).0)
            .subscribe()
    }

    /// Stop delivering `client`'s transactions
    pub fn hold(&self, client: ClientId) {
        self.set_gate(client, false);
    }

    /// Deliver everything held for `client`, and keep delivering
    pub fn release(&self, client: ClientId) {
        self.set_gate(client, true);
    }

    /// Subscriptions opened by `client` so far
    pub fn connections(&self, client: ClientId) -> usize {
        self.connections.lock().get(&client).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteKernel for GatedKernel {
    async fn subscribe(&self, client: ClientId) -> RippleResult<Subscription> {
        let subscription = self.inner.subscribe(client).await?;
        *self.connections.lock().entry(client).or_insert(0) += 1;
        Ok(subscription)
    }

    async fn transact(&self, client: ClientId, mut transactions: TransactionReceiver) -> RippleResult<()> {
        let mut gate = self.gate(client);
        let (tx, rx) = mpsc::channel(DEFAULT_RELAY_BUFFER);

        tokio::spawn(async move {
            while let Some(transaction) = transactions.recv().await {
                let open = gate.wait_for(|open| *open).await.is_ok();
                if !open || tx.send(transaction).await.is_err() {
                    return;
                }
            }
        });

        self.inner.transact(client, rx).await
    }
}

// ============================================================================
// CLUSTER
// ============================================================================

/// Cluster configuration
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// Clients connected by `Cluster::start`
    pub clients: usize,
    /// Carry every message through the frame codec
    pub framed: bool,
    pub rebase: RebaseConfig,
    pub kernel: KernelConfig,
    /// Upper bound for `settle`
    pub settle_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            clients: 2,
            framed: true,
            rebase: RebaseConfig::testing(),
            kernel: KernelConfig::testing(),
            settle_timeout_ms: 10_000,
        }
    }
}

impl ClusterConfig {
    /// Skip the frame codec; channels carry values directly
    pub fn direct() -> Self {
        ClusterConfig {
            framed: false,
            ..Self::default()
        }
    }

    pub fn with_clients(mut self, clients: usize) -> Self {
        self.clients = clients;
        self
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }
}

/// Convergence check result
#[derive(Debug, PartialEq, Eq)]
pub enum ConvergenceResult {
    Converged,
    /// Clients whose Shared state differs from the kernel's
    Diverged(Vec<ClientId>),
}

impl ConvergenceResult {
    pub fn is_converged(&self) -> bool {
        matches!(self, ConvergenceResult::Converged)
    }
}

/// One client of the cluster
pub struct ClientHandle {
    pub replica: Replica,
    driver: Option<ReplicaDriver>,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<RippleResult<()>>>,
}

impl ClientHandle {
    pub fn is_connected(&self) -> bool {
        self.task.is_some()
    }
}

/// In-process cluster
pub struct Cluster {
    pub kernel: Arc<Kernel>,
    transport: Arc<GatedKernel>,
    set: Arc<InstructionSet>,
    config: ClusterConfig,
    clients: Vec<ClientHandle>,
}

impl Cluster {
    /// A kernel with no clients yet
    pub fn new(config: ClusterConfig) -> Self {
        let set = Arc::new(InstructionSet::standard());
        let kernel = Arc::new(Kernel::new(set.clone(), config.kernel.clone()));

        let inner: Arc<dyn RemoteKernel> = if config.framed {
            Arc::new(FramedKernel::new(kernel.clone()))
        } else {
            kernel.clone()
        };

        Cluster {
            kernel,
            transport: Arc::new(GatedKernel::new(inner)),
            set,
            config,
            clients: Vec::new(),
        }
    }

    /// Start a cluster and connect `config.clients` clients
    pub async fn start(config: ClusterConfig) -> HarnessResult<Self> {
        let mut cluster = Cluster::new(config);
        for _ in 0..cluster.config.clients {
            cluster.add_client().await?;
        }
        info!("Cluster started with {} clients", cluster.clients.len());
        Ok(cluster)
    }

    /// Add a client that is not connected; it can write offline
    pub fn add_offline_client(&mut self) -> usize {
        let index = self.clients.len();
        let me = ClientId::from_u128(index as u128 + 1);
        let (replica, driver) = Replica::new(me, self.set.clone());
        let (stop, _) = watch::channel(false);

        self.clients.push(ClientHandle {
            replica,
            driver: Some(driver),
            stop,
            task: None,
        });
        index
    }

    /// Connect an offline client
    pub fn connect(&mut self, index: usize) {
        let transport = self.transport.clone();
        let config = self.config.rebase.clone();
        let client = &mut self.clients[index];

        if let Some(driver) = client.driver.take() {
            debug!("Connecting client {}", client.replica.me());
            let config = config.with_client_id(client.replica.me());
            let shutdown = client.stop.subscribe();
            client.task = Some(tokio::spawn(supervise(transport, driver, config, shutdown)));
        }
    }

    /// Add a client, connect it and wait for its first snapshot
    pub async fn add_client(&mut self) -> HarnessResult<usize> {
        let index = self.add_offline_client();
        self.connect(index);
        self.ready(index).await?;
        Ok(index)
    }

    /// Wait for a client's first snapshot
    pub async fn ready(&self, index: usize) -> HarnessResult<()> {
        let replica = &self.clients[index].replica;
        tokio::time::timeout(self.config.settle_timeout(), replica.ready())
            .await
            .map_err(|_| HarnessError::Timeout(format!("client {} to connect", replica.me())))??;
        Ok(())
    }

    pub fn client(&self, index: usize) -> &Replica {
        &self.clients[index].replica
    }

    pub fn id(&self, index: usize) -> ClientId {
        self.clients[index].replica.me()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn leader(&self) -> Leader<'_> {
        self.kernel.leader()
    }

    /// Hold a client's transactions in flight
    pub fn hold(&self, index: usize) {
        self.transport.hold(self.id(index));
    }

    pub fn release(&self, index: usize) {
        self.transport.release(self.id(index));
    }

    /// Subscriptions a client has opened, reconnects included
    pub fn connections(&self, index: usize) -> usize {
        self.transport.connections(self.id(index))
    }

    /// Wait until a client has opened at least `count` subscriptions
    pub async fn wait_for_connections(&self, index: usize, count: usize) -> HarnessResult<()> {
        let deadline = Instant::now() + self.config.settle_timeout();
        while self.connections(index) < count {
            if Instant::now() >= deadline {
                return Err(HarnessError::Timeout(format!(
                    "client {} connection {}",
                    self.id(index),
                    count
                )));
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        Ok(())
    }

    /// Wait until every connected client is in sync with the kernel clock
    pub async fn settle(&self) -> HarnessResult<()> {
        let deadline = Instant::now() + self.config.settle_timeout();

        loop {
            let clock = self.kernel.clock();
            let mut unsettled = Vec::new();

            for client in self.clients.iter().filter(|c| c.is_connected()) {
                let me = client.replica.me();
                if client.task.as_ref().map_or(false, |t| t.is_finished()) {
                    return Err(HarnessError::ClientStopped(me));
                }
                if client.replica.state() != SyncState::InSync || !same_clock(&client.replica.clock(), &clock) {
                    unsettled.push(me);
                }
            }

            if unsettled.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(HarnessError::Unsettled(unsettled));
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
    }

    /// Compare every connected client's Shared state with the kernel's
    pub fn check_convergence(&self) -> HarnessResult<ConvergenceResult> {
        let canonical = self.kernel.read(canonical_facts)?;

        let mut diverged = Vec::new();
        for client in self.clients.iter().filter(|c| c.is_connected()) {
            if client.replica.read(canonical_facts)? != canonical {
                diverged.push(client.replica.me());
            }
        }

        Ok(if diverged.is_empty() {
            ConvergenceResult::Converged
        } else {
            ConvergenceResult::Diverged(diverged)
        })
    }

    /// Settle, then check convergence
    pub async fn converge(&self) -> HarnessResult<ConvergenceResult> {
        self.settle().await?;
        self.check_convergence()
    }

    /// Stop every client; returns the first client error
    pub async fn shutdown(self) -> HarnessResult<()> {
        let mut result = Ok(());

        for client in self.clients {
            let _ = client.stop.send(true);
            let Some(task) = client.task else { continue };

            let outcome = match task.await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(HarnessError::Ripple(e)),
                Err(e) => Err(HarnessError::Panicked(e.to_string())),
            };
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    }
}

/// Shared facts in a form comparable across stores
pub fn canonical_facts(db: &Db) -> RippleResult<BTreeSet<String>> {
    shared_snapshot(db)?
        .iter()
        .map(|fact| serde_json::to_string(fact).map_err(RippleError::from))
        .collect()
}

/// Clocks agree on every origin with a non-zero count
pub fn same_clock(a: &ClientClock, b: &ClientClock) -> bool {
    let nonzero = |c: &ClientClock| c.iter().filter(|(_, n)| *n > 0).collect::<Vec<_>>();
    nonzero(a) == nonzero(b)
}
