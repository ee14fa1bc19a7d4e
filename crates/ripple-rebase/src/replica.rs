//! Replica - the visible local state and the handle applications use
//!
//! The visible state is what `read` and `change` see: canonical truth as
//! last offered, the speculative region on top, and commits made since the
//! last offer. It lives behind one lock, taken by local commits, snapshot
//! loading and offering.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use ripple_codec::{durable_novelty, shared_snapshot, Change, DeferredEffect, InstructionSet, Resolver};
use ripple_core::{ClientClock, ClientId, EntityId, Fact, Novelty, RippleError, RippleResult, TxId, Uid};
use ripple_store::{Db, IndexQuery, ENTITY_UID};
use ripple_wire::{DurableFact, WireInstruction};

use crate::{apply_effective, uid_facts, Offer, OfferHook, SyncState};

/// Speculative effect currently reflected in the visible state
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpeculationData {
    pub novelty: Vec<DurableFact>,
    /// Local ids of entities the speculation created
    pub ids: BTreeMap<Uid, EntityId>,
}

/// Local commit on its way to the rebase loop
#[derive(Clone, Debug, PartialEq)]
pub struct LocalCommit {
    pub id: TxId,
    pub wire: Vec<WireInstruction>,
}

#[derive(Clone, Debug)]
struct PendingCommit {
    id: TxId,
    novelty: Vec<DurableFact>,
}

pub(crate) struct VisibleState {
    db: Db,
    epoch: u64,
    speculation: SpeculationData,
    /// Committed here, not yet covered by an offer
    pending: VecDeque<PendingCommit>,
    clock: ClientClock,
    cache: HashMap<IndexQuery, Vec<Fact>>,
    deferred: Vec<DeferredEffect>,
    hooks: Vec<Arc<dyn OfferHook>>,
    state_tx: Arc<watch::Sender<SyncState>>,
}

impl VisibleState {
    fn new(state_tx: Arc<watch::Sender<SyncState>>) -> Self {
        VisibleState {
            db: Db::new(),
            epoch: 0,
            speculation: SpeculationData::default(),
            pending: VecDeque::new(),
            clock: ClientClock::new(),
            cache: HashMap::new(),
            deferred: Vec::new(),
            hooks: Vec::new(),
            state_tx,
        }
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }

    fn query(&mut self, query: &IndexQuery) -> Vec<Fact> {
        if let Some(hit) = self.cache.get(query) {
            return hit.clone();
        }
        let results = self.db.query(query);
        self.cache.insert(query.clone(), results.clone());
        results
    }

    fn invalidate(&mut self, novelty: &Novelty) {
        if novelty.is_empty() {
            return;
        }
        let touched = novelty.touched();
        self.cache.retain(|query, _| !is_affected(query, &touched));
    }

    /// Replace the visible Shared facts with a fresh snapshot
    ///
    /// Starts a new epoch; offers from earlier connections are ignored
    /// from here on. Entities created by speculation keep their local ids.
    pub(crate) fn load_snapshot(&mut self, snapshot: &[DurableFact], clock: ClientClock) -> RippleResult<u64> {
        self.epoch += 1;

        let mut effective: Vec<DurableFact> = shared_snapshot(&self.db)?.iter().map(DurableFact::inverse).collect();
        effective.extend_from_slice(snapshot);

        let spared: BTreeSet<Uid> = self.speculation.ids.keys().copied().collect();
        let mut resolver = Resolver::with_entities(self.speculation.ids.clone());
        let novelty = apply_effective(&mut self.db, effective, &mut resolver, &spared)?;

        self.invalidate(&novelty);
        self.speculation.novelty.clear();
        self.pending.clear();
        self.clock = clock;
        info!("Loaded snapshot: {} facts, epoch {}", snapshot.len(), self.epoch);

        self.run_effects(&novelty);
        Ok(self.epoch)
    }

    /// Merge an offer into the visible state
    ///
    /// Returns the novelty applied, or `None` for an offer from an older
    /// connection.
    pub(crate) fn apply_offer(&mut self, offer: Offer) -> RippleResult<Option<Novelty>> {
        if offer.epoch != self.epoch {
            debug!("Discarding offer from epoch {} (now {})", offer.epoch, self.epoch);
            return Ok(None);
        }

        let consumed = offer
            .upto
            .and_then(|id| self.pending.iter().position(|p| p.id == id))
            .map_or(0, |pos| pos + 1);

        // unwind everything speculative, then replay commits the log has not seen
        let mut undo: Vec<DurableFact> = self
            .speculation
            .novelty
            .iter()
            .chain(self.pending.iter().flat_map(|p| p.novelty.iter()))
            .cloned()
            .collect();
        undo.reverse();
        self.pending.drain(..consumed);
        let still_pending: Vec<DurableFact> = self.pending.iter().flat_map(|p| p.novelty.iter().cloned()).collect();

        let mut effective: Vec<DurableFact> = undo.iter().map(DurableFact::inverse).collect();
        effective.extend(offer.canonical);
        effective.extend(offer.speculative.iter().cloned());
        effective.extend(still_pending.iter().cloned());

        let mut resolver = Resolver::with_entities(self.speculation.ids.clone());
        let novelty = apply_effective(&mut self.db, effective, &mut resolver, &BTreeSet::new())?;
        self.invalidate(&novelty);

        let ids = uid_facts(&offer.speculative, true)
            .chain(uid_facts(&still_pending, true))
            .filter_map(|uid| self.db.entity_by_uid(uid).map(|e| (uid, e)))
            .collect();
        self.speculation = SpeculationData {
            novelty: offer.speculative,
            ids,
        };
        self.clock = offer.clock;

        let state = if self.pending.is_empty() {
            offer.state
        } else {
            SyncState::Speculating
        };
        self.state_tx.send_replace(state);

        self.run_effects(&novelty);
        Ok(Some(novelty))
    }

    /// Deferred effects, then hooks; failures are logged
    fn run_effects(&mut self, novelty: &Novelty) {
        for effect in self.deferred.drain(..) {
            if let Err(e) = effect() {
                warn!("Deferred effect failed: {}", e);
            }
        }
        if novelty.is_empty() {
            return;
        }
        for hook in &self.hooks {
            if let Err(e) = hook.on_offer(&self.db, novelty) {
                warn!("Offer hook failed: {}", e);
            }
        }
    }
}

fn is_affected(query: &IndexQuery, touched: &BTreeSet<(EntityId, EntityId)>) -> bool {
    match query {
        IndexQuery::Column { attribute }
        | IndexQuery::LookupMany { attribute, .. }
        | IndexQuery::LookupUnique { attribute, .. } => touched.iter().any(|(_, a)| a == attribute),
        IndexQuery::Contains { entity, attribute, .. }
        | IndexQuery::GetOne { entity, attribute }
        | IndexQuery::GetMany { entity, attribute } => touched.contains(&(*entity, *attribute)),
        IndexQuery::Entity { entity } => touched.iter().any(|(e, _)| e == entity),
        IndexQuery::RefsTo { .. } | IndexQuery::All => true,
    }
}

/// Handle to a replica
///
/// Cheap to clone. Writes apply to the visible state at once and are
/// handed to the rebase loop; reads see every write made through any
/// clone of the handle.
#[derive(Clone)]
pub struct Replica {
    me: ClientId,
    set: Arc<InstructionSet>,
    visible: Arc<Mutex<VisibleState>>,
    commits: mpsc::UnboundedSender<LocalCommit>,
    state: watch::Receiver<SyncState>,
    ready: watch::Receiver<bool>,
}

/// Connection-side half of a replica, owned by the supervisor
pub struct ReplicaDriver {
    pub(crate) me: ClientId,
    pub(crate) set: Arc<InstructionSet>,
    pub(crate) visible: Arc<Mutex<VisibleState>>,
    pub(crate) commits: mpsc::UnboundedReceiver<LocalCommit>,
    pub(crate) state_tx: Arc<watch::Sender<SyncState>>,
    pub(crate) ready_tx: watch::Sender<bool>,
}

impl Replica {
    pub fn new(me: ClientId, set: Arc<InstructionSet>) -> (Replica, ReplicaDriver) {
        let (state_tx, state) = watch::channel(SyncState::Disconnected);
        let (ready_tx, ready) = watch::channel(false);
        let (commits, commits_rx) = mpsc::unbounded_channel();
        let state_tx = Arc::new(state_tx);
        let visible = Arc::new(Mutex::new(VisibleState::new(state_tx.clone())));

        let replica = Replica {
            me,
            set: set.clone(),
            visible: visible.clone(),
            commits,
            state,
            ready,
        };
        let driver = ReplicaDriver {
            me,
            set,
            visible,
            commits: commits_rx,
            state_tx,
            ready_tx,
        };
        (replica, driver)
    }

    pub fn me(&self) -> ClientId {
        self.me
    }

    /// Run a local transaction
    ///
    /// On error every write made by `f` is undone and nothing is sent.
    /// Deferred effects run once the write is visible: immediately for a
    /// purely local change, with the next offer otherwise.
    pub fn change<T>(&self, f: impl FnOnce(&mut Change<'_>) -> RippleResult<T>) -> RippleResult<T> {
        let mut run_now = Vec::new();
        let value = {
            let mut guard = self.visible.lock();
            let visible = &mut *guard;

            let mut change = Change::new(&mut visible.db, &self.set);
            let value = match f(&mut change) {
                Ok(value) => value,
                Err(e) => {
                    change.rollback();
                    return Err(e);
                }
            };
            let outcome = change.finish();
            let novelty = outcome.novelty();
            visible.invalidate(&novelty);

            let wire = outcome.wire();
            if wire.is_empty() {
                run_now = outcome.deferred;
            } else {
                visible.deferred.extend(outcome.deferred);

                let id = TxId::generate();
                for fact in novelty.iter().filter(|f| f.added && f.attribute == ENTITY_UID) {
                    if let Some(uid) = fact.value.as_str().and_then(Uid::parse) {
                        visible.speculation.ids.insert(uid, fact.entity);
                    }
                }
                visible.pending.push_back(PendingCommit {
                    id,
                    novelty: durable_novelty(&visible.db, &novelty),
                });
                visible.state_tx.send_replace(SyncState::Speculating);

                if self.commits.send(LocalCommit { id, wire }).is_err() {
                    warn!("Commit {} not delivered: rebase loop gone", id);
                }
            }
            value
        };

        for effect in run_now {
            if let Err(e) = effect() {
                warn!("Deferred effect failed: {}", e);
            }
        }
        Ok(value)
    }

    /// Read the visible state
    pub fn read<T>(&self, f: impl FnOnce(&Db) -> T) -> T {
        f(&self.visible.lock().db)
    }

    /// Cached index query over the visible state
    pub fn query(&self, query: &IndexQuery) -> Vec<Fact> {
        self.visible.lock().query(query)
    }

    pub fn clock(&self) -> ClientClock {
        self.visible.lock().clock.clone()
    }

    pub fn state(&self) -> SyncState {
        *self.state.borrow()
    }

    /// Wait until the first snapshot is loaded
    pub async fn ready(&self) -> RippleResult<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|loaded| *loaded)
            .await
            .map(|_| ())
            .map_err(|_| RippleError::ConnectionClosed)
    }

    /// Wait until the replica reaches `state`
    pub async fn wait_for_state(&self, state: SyncState) -> RippleResult<()> {
        let mut rx = self.state.clone();
        rx.wait_for(|current| *current == state)
            .await
            .map(|_| ())
            .map_err(|_| RippleError::ConnectionClosed)
    }

    /// Subscribe to state changes
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.state.clone()
    }

    /// Call `hook` after each offer that changes the visible state
    ///
    /// Hooks run under the visible-state lock and must not write through
    /// the replica.
    pub fn register_hook(&self, hook: impl OfferHook + 'static) {
        self.visible.lock().hooks.push(Arc::new(hook));
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("me", &self.me)
            .field("state", &self.state())
            .finish()
    }
}
