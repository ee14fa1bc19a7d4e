//! Offering
//!
//! The rebase loop produces offers faster than the visible state may take
//! them. Offers conflate in a single slot: canonical effects accumulate,
//! while the speculative effect, clock and state are replaced by the newest.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use tokio::sync::Notify;

use ripple_codec::{apply_durable, Resolver};
use ripple_core::{ClientClock, EntityId, Novelty, RippleResult, TxId, Uid};
use ripple_store::{Db, ENTITY_UID_IDENT};
use ripple_wire::{DurableFact, DurableValue};

use crate::SyncState;

/// Changes since the last offer, ready to merge into the visible state
#[derive(Clone, Debug, PartialEq)]
pub struct Offer {
    /// Connection epoch the offer belongs to
    pub epoch: u64,
    /// Canonical effects applied to base, oldest first
    pub canonical: Vec<DurableFact>,
    /// Full effect of the speculative region
    pub speculative: Vec<DurableFact>,
    /// Newest local commit the log has taken in
    pub upto: Option<TxId>,
    pub clock: ClientClock,
    pub state: SyncState,
}

impl Offer {
    /// Fold a newer offer into this one
    pub fn absorb(&mut self, newer: Offer) {
        self.canonical.extend(newer.canonical);
        self.speculative = newer.speculative;
        self.upto = newer.upto.or(self.upto);
        self.clock = newer.clock;
        self.state = newer.state;
        self.epoch = newer.epoch;
    }

    /// Whether applying this offer after `previous` changes anything
    pub fn changes_since(&self, previous: Option<&Offer>) -> bool {
        let Some(previous) = previous else {
            return true;
        };
        !self.canonical.is_empty()
            || self.epoch != previous.epoch
            || self.upto != previous.upto
            || self.state != previous.state
            || self.clock != previous.clock
            || self.speculative != previous.speculative
    }
}

/// Single-slot conflating queue
#[derive(Debug, Default)]
pub struct OfferQueue {
    slot: Mutex<Option<Offer>>,
    notify: Notify,
}

impl OfferQueue {
    pub fn new() -> Self {
        OfferQueue::default()
    }

    /// Store an offer, conflating with one not yet taken
    pub fn push(&self, offer: Offer) {
        {
            let mut slot = self.slot.lock();
            match slot.as_mut() {
                Some(pending) if pending.epoch == offer.epoch => pending.absorb(offer),
                _ => *slot = Some(offer),
            }
        }
        self.notify.notify_one();
    }

    pub fn try_take(&self) -> Option<Offer> {
        self.slot.lock().take()
    }

    /// Wait for the next offer
    pub async fn take(&self) -> Offer {
        loop {
            if let Some(offer) = self.try_take() {
                return offer;
            }
            self.notify.notified().await;
        }
    }
}

/// Called after each offer that changed the visible state
///
/// Offers conflate, so a hook may see several commits' worth of novelty at
/// once, or never see an intermediate state.
pub trait OfferHook: Send + Sync {
    fn on_offer(&self, db: &Db, novelty: &Novelty) -> RippleResult<()>;
}

impl<F> OfferHook for F
where
    F: Fn(&Db, &Novelty) -> RippleResult<()> + Send + Sync,
{
    fn on_offer(&self, db: &Db, novelty: &Novelty) -> RippleResult<()> {
        self(db, novelty)
    }
}

/// Keep the last occurrence of each (entity, attribute, value)
pub fn net_facts(facts: Vec<DurableFact>) -> Vec<DurableFact> {
    let mut last: HashMap<(Uid, String, String), usize> = HashMap::new();
    for (i, fact) in facts.iter().enumerate() {
        let value = serde_json::to_string(&fact.value).unwrap_or_default();
        last.insert((fact.entity, fact.attribute.ident.clone(), value), i);
    }

    let keep: BTreeSet<usize> = last.into_values().collect();
    facts
        .into_iter()
        .enumerate()
        .filter(|(i, _)| keep.contains(i))
        .map(|(_, f)| f)
        .collect()
}

/// Uids named by the uid facts of one polarity
pub fn uid_facts(facts: &[DurableFact], added: bool) -> impl Iterator<Item = Uid> + '_ {
    facts
        .iter()
        .filter(move |f| f.added == added && f.attribute.ident == ENTITY_UID_IDENT)
        .filter_map(|f| match &f.value {
            DurableValue::Scalar(json) => json.as_str().and_then(Uid::parse),
            _ => None,
        })
}

/// Apply a sequence of durable effects to the visible store
///
/// Facts are netted first. Entities whose uid ends up retracted are removed
/// entirely, local facts included, unless listed in `spared`.
pub fn apply_effective(
    db: &mut Db,
    facts: Vec<DurableFact>,
    resolver: &mut Resolver,
    spared: &BTreeSet<Uid>,
) -> RippleResult<Novelty> {
    let facts = net_facts(facts);

    let doomed: Vec<EntityId> = uid_facts(&facts, false)
        .filter(|uid| !spared.contains(uid))
        .filter_map(|uid| resolver.entity(db, uid))
        .collect();

    let mut novelty = apply_durable(db, &facts, resolver)?;
    for entity in doomed {
        if db.uid_of(entity).is_some() {
            continue; // reasserted
        }
        let ops = db.retract_entity_ops(entity);
        novelty.extend(db.transact(&ops)?);
    }
    Ok(novelty)
}
