//! Read traces - hashed read-sets for optimistic validation
//!
//! Every index query issued while deriving an instruction is recorded in
//! durable form with its result. The trace folds into a single hash:
//!
//! ```text
//! hash = Σ (wrapping) first8(sha256(seed ‖ query ‖ sorted results))
//! ```
//!
//! Addition makes the fold independent of query order. Results are sorted
//! by their durable encoding, so two stores with different local ids hash
//! the same read-set identically.

use sha2::{Digest, Sha256};

use ripple_core::{EntityId, Fact, RippleError, RippleResult, Uid, Value};
use ripple_store::{Db, IndexQuery};
use ripple_wire::{DurableAttribute, DurableFact, DurableQuery, DurableValue};

use crate::{durable_attribute, durable_fact, durable_value};

/// Queries observed since the last instruction
#[derive(Clone, Debug, Default)]
pub struct ReadTrace {
    entries: Vec<(DurableQuery, Vec<DurableFact>)>,
}

impl ReadTrace {
    pub fn new() -> Self {
        ReadTrace::default()
    }

    /// Record one executed query with its results
    ///
    /// Queries that cannot be expressed durably (on Local entities, or with
    /// local values) are not recorded.
    ///
    /// # Panics
    ///
    /// On `IndexQuery::All`. An unbounded scan has no stable read-set.
    pub fn record(&mut self, db: &Db, query: &IndexQuery, results: &[Fact]) {
        assert!(query.is_traceable(), "unbounded scan cannot be traced");
        if let Some(durable) = durable_query(db, query) {
            self.entries.push((durable, durable_results(db, results)));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Take the recorded queries and their folded hash, leaving the trace empty
    pub fn finalize(&mut self, seed: u64) -> (Vec<DurableQuery>, u64) {
        let entries = std::mem::take(&mut self.entries);
        let hash = entries
            .iter()
            .fold(0u64, |acc, (q, r)| acc.wrapping_add(query_hash(seed, q, r)));
        (entries.into_iter().map(|(q, _)| q).collect(), hash)
    }
}

/// Hash of one query and its result set
pub fn query_hash(seed: u64, query: &DurableQuery, results: &[DurableFact]) -> u64 {
    let mut keys: Vec<Vec<u8>> = results
        .iter()
        .filter_map(|f| serde_json::to_vec(f).ok())
        .collect();
    keys.sort();

    let mut hasher = Sha256::new();
    hasher.update(seed.to_be_bytes());
    hasher.update(serde_json::to_vec(query).unwrap_or_default());
    for key in keys {
        hasher.update(&key);
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();

    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Re-run recorded queries and compare against the recorded hash
pub fn verify(db: &Db, seed: u64, queries: &[DurableQuery], expected: u64) -> RippleResult<()> {
    let actual = queries
        .iter()
        .fold(0u64, |acc, q| acc.wrapping_add(query_hash(seed, q, &execute(db, q))));
    if actual == expected {
        Ok(())
    } else {
        Err(RippleError::AssumptionsViolated { expected, actual })
    }
}

/// Execute a durable query; unknown identifiers yield no results
pub fn execute(db: &Db, query: &DurableQuery) -> Vec<DurableFact> {
    match to_index_query(db, query) {
        Some(q) => durable_results(db, &db.query(&q)),
        None => Vec::new(),
    }
}

fn durable_results(db: &Db, facts: &[Fact]) -> Vec<DurableFact> {
    facts
        .iter()
        .filter(|f| f.entity.is_shared())
        .filter_map(|f| durable_fact(db, f).ok())
        .collect()
}

/// Durable form of a bounded query
pub fn durable_query(db: &Db, query: &IndexQuery) -> Option<DurableQuery> {
    let uid = |e: EntityId| if e.is_shared() { db.uid_of(e) } else { None };
    let attr = |a: EntityId| durable_attribute(db, a).ok();
    let value = |v: &Value| durable_value(db, v).ok();

    Some(match query {
        IndexQuery::Column { attribute } => DurableQuery::Column {
            attribute: attr(*attribute)?,
        },
        IndexQuery::Contains {
            entity,
            attribute,
            value: v,
        } => DurableQuery::Contains {
            entity: uid(*entity)?,
            attribute: attr(*attribute)?,
            value: value(v)?,
        },
        IndexQuery::Entity { entity } => DurableQuery::Entity {
            entity: uid(*entity)?,
        },
        IndexQuery::GetOne { entity, attribute } => DurableQuery::GetOne {
            entity: uid(*entity)?,
            attribute: attr(*attribute)?,
        },
        IndexQuery::GetMany { entity, attribute } => DurableQuery::GetMany {
            entity: uid(*entity)?,
            attribute: attr(*attribute)?,
        },
        IndexQuery::LookupMany { attribute, value: v } => DurableQuery::LookupMany {
            attribute: attr(*attribute)?,
            value: value(v)?,
        },
        IndexQuery::LookupUnique { attribute, value: v } => DurableQuery::LookupUnique {
            attribute: attr(*attribute)?,
            value: value(v)?,
        },
        IndexQuery::RefsTo { target } => DurableQuery::RefsTo {
            target: uid(*target)?,
        },
        IndexQuery::All => return None,
    })
}

/// Local form of a durable query; `None` when an identifier is unknown here
pub fn to_index_query(db: &Db, query: &DurableQuery) -> Option<IndexQuery> {
    let entity = |uid: Uid| db.entity_by_uid(uid);
    let attr = |a: &DurableAttribute| db.schema().attribute_by_ident(&a.ident);
    let value = |v: &DurableValue| match v {
        DurableValue::EntityRef(uid) => db.entity_by_uid(*uid).map(Value::Ref),
        DurableValue::EntityTypeRef(ident) => db.schema().entity_type_by_ident(ident).map(Value::Ref),
        DurableValue::Scalar(json) => Value::from_json(json).ok(),
    };

    Some(match query {
        DurableQuery::Column { attribute } => IndexQuery::Column {
            attribute: attr(attribute)?,
        },
        DurableQuery::Contains {
            entity: e,
            attribute,
            value: v,
        } => IndexQuery::Contains {
            entity: entity(*e)?,
            attribute: attr(attribute)?,
            value: value(v)?,
        },
        DurableQuery::Entity { entity: e } => IndexQuery::Entity { entity: entity(*e)? },
        DurableQuery::GetOne { entity: e, attribute } => IndexQuery::GetOne {
            entity: entity(*e)?,
            attribute: attr(attribute)?,
        },
        DurableQuery::GetMany { entity: e, attribute } => IndexQuery::GetMany {
            entity: entity(*e)?,
            attribute: attr(attribute)?,
        },
        DurableQuery::LookupMany { attribute, value: v } => IndexQuery::LookupMany {
            attribute: attr(attribute)?,
            value: value(v)?,
        },
        DurableQuery::LookupUnique { attribute, value: v } => IndexQuery::LookupUnique {
            attribute: attr(attribute)?,
            value: value(v)?,
        },
        DurableQuery::RefsTo { target } => IndexQuery::RefsTo {
            target: entity(*target)?,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ripple_core::{AttributeSchema, Partition};
    use ripple_store::{Op, ENTITY_UID};

    fn setup() -> (Db, EntityId, EntityId) {
        let mut db = Db::new();
        let count = db
            .ensure_attribute("counter/value", AttributeSchema::scalar())
            .unwrap();
        let e = db.allocate(Partition::Shared);
        db.transact(&[
            Op::assert(e, ENTITY_UID, Uid::from_u128(1).to_string()),
            Op::assert(e, count, 1i64),
        ])
        .unwrap();
        (db, count, e)
    }

    fn traced(db: &Db, trace: &mut ReadTrace, query: IndexQuery) {
        let results = db.query(&query);
        trace.record(db, &query, &results);
    }

    #[test]
    fn test_verify_detects_changed_read() {
        let (mut db, count, e) = setup();
        let mut trace = ReadTrace::new();
        traced(&db, &mut trace, IndexQuery::GetOne { entity: e, attribute: count });
        let (queries, hash) = trace.finalize(42);
        assert!(trace.is_empty());

        assert_eq!(verify(&db, 42, &queries, hash), Ok(()));

        db.transact(&[Op::assert(e, count, 2i64)]).unwrap();
        assert!(matches!(
            verify(&db, 42, &queries, hash),
            Err(RippleError::AssumptionsViolated { expected, .. }) if expected == hash
        ));
    }

    #[test]
    fn test_seed_changes_hash() {
        let (db, count, e) = setup();
        let mut a = ReadTrace::new();
        traced(&db, &mut a, IndexQuery::GetOne { entity: e, attribute: count });
        let mut b = a.clone();

        assert_ne!(a.finalize(1).1, b.finalize(2).1);
    }

    #[test]
    fn test_hash_is_order_independent() {
        let (db, count, e) = setup();
        let q1 = IndexQuery::GetOne { entity: e, attribute: count };
        let q2 = IndexQuery::Entity { entity: e };

        let mut forward = ReadTrace::new();
        traced(&db, &mut forward, q1.clone());
        traced(&db, &mut forward, q2.clone());
        let mut backward = ReadTrace::new();
        traced(&db, &mut backward, q2);
        traced(&db, &mut backward, q1);

        assert_eq!(forward.finalize(5).1, backward.finalize(5).1);
    }

    #[test]
    fn test_hash_agrees_across_stores() {
        let (db, _, e) = setup();
        let mut trace = ReadTrace::new();
        traced(&db, &mut trace, IndexQuery::Entity { entity: e });
        let (queries, hash) = trace.finalize(9);

        // same durable content under different local ids
        let mut other = Db::new();
        other.allocate(Partition::Shared);
        let other_count = other
            .ensure_attribute("counter/value", AttributeSchema::scalar())
            .unwrap();
        let other_e = other.allocate(Partition::Shared);
        other
            .transact(&[
                Op::assert(other_e, ENTITY_UID, Uid::from_u128(1).to_string()),
                Op::assert(other_e, other_count, 1i64),
            ])
            .unwrap();

        assert_ne!(other_e, e);
        assert_eq!(verify(&other, 9, &queries, hash), Ok(()));
    }

    #[test]
    fn test_local_queries_not_traced() {
        let (mut db, count, _) = setup();
        let local = db.allocate(Partition::Local);
        db.transact(&[Op::assert(local, count, 3i64)]).unwrap();

        let mut trace = ReadTrace::new();
        traced(&db, &mut trace, IndexQuery::Entity { entity: local });
        assert!(trace.is_empty());

        // column reads are traced but only see Shared facts
        traced(&db, &mut trace, IndexQuery::Column { attribute: count });
        assert_eq!(trace.len(), 1);
    }

    #[test]
    #[should_panic(expected = "unbounded scan")]
    fn test_tracing_scan_panics() {
        let (db, _, _) = setup();
        let mut trace = ReadTrace::new();
        trace.record(&db, &IndexQuery::All, &[]);
    }
}
