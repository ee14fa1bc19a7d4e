//! Rebase log
//!
//! Two regions over two stores:
//!
//! ```text
//! base ── rebasing (confirmed…, local…) ──▶ head ── speculation (sent, unacked)
//! ```
//!
//! `base` holds canonical truth as this client knows it; `head` is `base`
//! with the speculative entries replayed on top. Confirmed entries always
//! sit before local ones in `rebasing`. Nothing is offered while
//! `rebasing` is non-empty.

use std::collections::VecDeque;

use tracing::{debug, warn};

use ripple_codec::{apply_durable, durable_novelty, InstructionSet, Resolver};
use ripple_core::{ClientClock, ClientId, RippleError, RippleResult, TxId};
use ripple_store::Db;
use ripple_wire::{DurableFact, Transaction, WireInstruction};

use crate::Offer;

/// Where an entry came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Written here, not yet confirmed
    Local,
    /// Applied by the kernel
    Confirmed,
}

/// Replication state as seen by observers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// No connection, or not yet loaded
    Disconnected,
    /// Both regions empty
    InSync,
    /// Local entries await acknowledgement
    Speculating,
    /// Entries await replay; offering is blocked
    Rebasing,
}

/// One transaction tracked by the log
#[derive(Clone, Debug, PartialEq)]
pub struct RebaseLogEntry {
    pub id: TxId,
    pub origin: EntryOrigin,
    /// Client that wrote it
    pub author: ClientId,
    pub wire: Vec<WireInstruction>,
    /// Shared effect where the entry was last applied
    pub novelty: Vec<DurableFact>,
    pub transaction: Option<Transaction>,
    pub sent: bool,
    /// Per-origin index; assigned when sent
    pub index: u64,
}

impl RebaseLogEntry {
    /// Fresh local write
    pub fn local(author: ClientId, id: TxId, wire: Vec<WireInstruction>) -> Self {
        RebaseLogEntry {
            id,
            origin: EntryOrigin::Local,
            author,
            wire,
            novelty: Vec::new(),
            transaction: None,
            sent: false,
            index: 0,
        }
    }

    /// Transaction applied by the kernel
    pub fn confirmed(tx: Transaction) -> Self {
        RebaseLogEntry {
            id: tx.id,
            origin: EntryOrigin::Confirmed,
            author: tx.origin,
            wire: tx.instructions.clone(),
            novelty: Vec::new(),
            index: tx.index,
            sent: true,
            transaction: Some(tx),
        }
    }

    /// The same write, now known to be canonical
    pub fn confirm(self) -> Self {
        RebaseLogEntry {
            origin: EntryOrigin::Confirmed,
            wire: self
                .wire
                .iter()
                .filter_map(WireInstruction::without_validations)
                .collect(),
            novelty: Vec::new(),
            ..self
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == EntryOrigin::Local
    }

    /// Local entry in the state it had before it was first sent
    pub fn unsent(self) -> Self {
        RebaseLogEntry {
            novelty: Vec::new(),
            transaction: None,
            sent: false,
            index: 0,
            ..self
        }
    }
}

/// Two-region ledger for one connection
#[derive(Debug)]
pub struct RebaseLog {
    me: ClientId,
    base: Db,
    head: Db,
    rebasing: VecDeque<RebaseLogEntry>,
    speculation: VecDeque<RebaseLogEntry>,
    /// Canonical effects applied to `base` since the last offer
    canonical: Vec<DurableFact>,
    /// Last local commit taken into the log
    absorbed: Option<TxId>,
    clock: ClientClock,
    next_index: u64,
}

impl RebaseLog {
    pub fn empty(base: Db, me: ClientId, clock: ClientClock) -> Self {
        let next_index = clock.next_index(me);
        RebaseLog {
            me,
            head: base.clone(),
            base,
            rebasing: VecDeque::new(),
            speculation: VecDeque::new(),
            canonical: Vec::new(),
            absorbed: None,
            clock,
            next_index,
        }
    }

    /// Log over a base materialised from a kernel snapshot
    pub fn from_snapshot(me: ClientId, snapshot: &[DurableFact], clock: ClientClock) -> RippleResult<Self> {
        let mut base = Db::new();
        apply_durable(&mut base, snapshot, &mut Resolver::new())?;
        Ok(Self::empty(base, me, clock))
    }

    pub fn me(&self) -> ClientId {
        self.me
    }

    pub fn base(&self) -> &Db {
        &self.base
    }

    pub fn head(&self) -> &Db {
        &self.head
    }

    pub fn clock(&self) -> &ClientClock {
        &self.clock
    }

    pub fn rebasing(&self) -> &VecDeque<RebaseLogEntry> {
        &self.rebasing
    }

    pub fn speculation(&self) -> &VecDeque<RebaseLogEntry> {
        &self.speculation
    }

    #[inline]
    pub fn is_rebasing(&self) -> bool {
        !self.rebasing.is_empty()
    }

    pub fn state(&self) -> SyncState {
        if self.is_rebasing() {
            SyncState::Rebasing
        } else if !self.speculation.is_empty() {
            SyncState::Speculating
        } else {
            SyncState::InSync
        }
    }

    /// Queue an entry
    ///
    /// Local entries go to the end. A confirmed entry goes after the last
    /// confirmed one, replaces any local entry with its id, and sends the
    /// speculation back to be replayed on the new base.
    pub fn append(&mut self, entry: RebaseLogEntry) {
        match entry.origin {
            EntryOrigin::Local => {
                self.absorbed = Some(entry.id);
                self.rebasing.push_back(entry);
            }
            EntryOrigin::Confirmed => {
                self.skip_local_changes(entry.id);
                let at = self.leading_confirmed();
                self.rebasing.insert(at, entry);
                self.unwind_speculation();
            }
        }
    }

    /// Remove local entries with this id; true if one was found
    pub fn skip_local_changes(&mut self, id: TxId) -> bool {
        let before = self.rebasing.len() + self.speculation.len();
        self.rebasing.retain(|e| !(e.is_local() && e.id == id));
        self.speculation.retain(|e| !(e.is_local() && e.id == id));
        before != self.rebasing.len() + self.speculation.len()
    }

    /// Append a transaction another client got applied
    pub fn consume_tx(&mut self, tx: Transaction) -> RippleResult<()> {
        if tx.origin == self.me {
            return Err(RippleError::ProtocolViolation(format!(
                "own transaction {} relayed back as Tx",
                tx.id
            )));
        }
        if tx.index <= self.clock.get(tx.origin) {
            debug!("Skipping {} from {}: index {} already applied", tx.id, tx.origin, tx.index);
            return Ok(());
        }
        self.append(RebaseLogEntry::confirmed(tx));
        Ok(())
    }

    /// Replay the head of `rebasing`
    ///
    /// Returns the transaction to send when a local entry goes out for the
    /// first time.
    pub fn continue_rebase(&mut self, set: &InstructionSet) -> RippleResult<Option<Transaction>> {
        let Some(mut entry) = self.rebasing.pop_front() else {
            return Ok(None);
        };

        if !entry.is_local() {
            let novelty = set.transact_wire(&mut self.base, &entry.wire).map_err(|e| {
                RippleError::ProtocolViolation(format!("confirmed {} does not apply: {}", entry.id, e))
            })?;
            self.canonical.extend(durable_novelty(&self.base, &novelty));
            if entry.index > self.clock.get(entry.author) {
                self.clock.set(entry.author, entry.index);
            }
            self.head = self.base.clone();
            debug!("Rebased onto {} ({} facts)", entry.id, novelty.len());
            return Ok(None);
        }

        match set.transact_wire(&mut self.head, &entry.wire) {
            Ok(novelty) => entry.novelty = durable_novelty(&self.head, &novelty),
            Err(e) if !entry.sent => {
                warn!("Dropping local {}: {}", entry.id, e);
                return Ok(None);
            }
            Err(e) => {
                // the kernel's verdict decides; keep it without effect
                debug!("Sent {} no longer applies locally: {}", entry.id, e);
                entry.novelty.clear();
            }
        }

        let outgoing = if entry.sent {
            None
        } else {
            entry.index = self.next_index;
            self.next_index += 1;
            entry.sent = true;
            let tx = Transaction {
                id: entry.id,
                instructions: entry.wire.clone(),
                origin: self.me,
                index: entry.index,
            };
            entry.transaction = Some(tx.clone());
            Some(tx)
        };
        self.speculation.push_back(entry);
        Ok(outgoing)
    }

    /// Kernel verdict on the oldest unacknowledged local entry
    ///
    /// Success turns it into a confirmed entry; failure drops it and
    /// replays what is left.
    pub fn ack(&mut self, id: TxId, failed: bool) -> RippleResult<()> {
        let entry = self.take_head(id)?;
        self.clock.set(self.me, entry.index);
        if failed {
            warn!("Local {} failed at the kernel", entry.id);
            self.unwind_speculation();
        } else {
            self.append(entry.confirm());
        }
        Ok(())
    }

    /// Kernel rejected the oldest unacknowledged local entry on stale reads
    ///
    /// The entry is dropped. The kernel did not advance this origin and
    /// drops whatever was sent after it, so those entries take the freed
    /// indices and go out again.
    pub fn reject(&mut self, id: TxId) -> RippleResult<()> {
        let entry = self.take_head(id)?;
        warn!("Local {} rejected on stale reads", entry.id);
        self.next_index = entry.index;
        self.unwind_speculation();

        for queued in self.rebasing.iter_mut().filter(|e| e.is_local() && e.sent) {
            debug!("Resending {} (was index {})", queued.id, queued.index);
            queued.sent = false;
            queued.index = 0;
            queued.transaction = None;
            queued.novelty.clear();
        }
        Ok(())
    }

    /// Another origin's transaction failed; the kernel still advanced it
    pub fn note_failure(&mut self, origin: ClientId) {
        self.clock.tick(origin);
    }

    /// Drain canonical effects and snapshot the speculative effect
    pub fn take_offer(&mut self, epoch: u64) -> Offer {
        Offer {
            epoch,
            canonical: std::mem::take(&mut self.canonical),
            speculative: self
                .speculation
                .iter()
                .flat_map(|e| e.novelty.iter().cloned())
                .collect(),
            upto: self.absorbed,
            clock: self.clock.clone(),
            state: self.state(),
        }
    }

    /// Local entries still awaiting a verdict, oldest first
    ///
    /// Entries keep their old index so the next connection can tell which
    /// ones the kernel settled in the meantime.
    pub fn into_carried(self) -> Vec<RebaseLogEntry> {
        self.speculation
            .into_iter()
            .chain(self.rebasing)
            .filter(RebaseLogEntry::is_local)
            .collect()
    }

    fn leading_confirmed(&self) -> usize {
        self.rebasing.iter().take_while(|e| !e.is_local()).count()
    }

    /// Oldest sent local entry, which must be `id`
    fn take_head(&mut self, id: TxId) -> RippleResult<RebaseLogEntry> {
        let head = self
            .speculation
            .iter()
            .chain(self.rebasing.iter())
            .find(|e| e.is_local() && e.sent)
            .map(|e| e.id);
        if head != Some(id) {
            return Err(RippleError::ProtocolViolation(format!(
                "verdict for {} but log head is {:?}",
                id, head
            )));
        }

        if let Some(pos) = self.speculation.iter().position(|e| e.id == id) {
            if let Some(entry) = self.speculation.remove(pos) {
                return Ok(entry);
            }
        }
        let pos = self.rebasing.iter().position(|e| e.is_local() && e.id == id);
        pos.and_then(|p| self.rebasing.remove(p))
            .ok_or_else(|| RippleError::ProtocolViolation(format!("entry {} vanished", id)))
    }

    /// Move speculation back in front of queued local entries and reset head
    fn unwind_speculation(&mut self) {
        let at = self.leading_confirmed();
        for entry in self.speculation.drain(..).rev() {
            self.rebasing.insert(at, entry);
        }
        self.head = self.base.clone();
    }
}
