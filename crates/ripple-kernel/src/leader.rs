//! Leader - writes made directly against the canonical store
//!
//! Leader writes skip ordering and validation: they run under the kernel
//! lock, so what they read is canonical by construction. Their Shared
//! effect is broadcast to every client as a transaction of the leader's
//! own origin.

use tracing::{debug, warn};

use ripple_codec::Change;
use ripple_core::{ClientId, RippleResult};
use ripple_wire::Transaction;

use crate::{Kernel, KernelEvent};

/// Write handle onto the canonical store
#[derive(Clone, Copy, Debug)]
pub struct Leader<'k> {
    kernel: &'k Kernel,
}

impl Kernel {
    pub fn leader(&self) -> Leader<'_> {
        Leader { kernel: self }
    }
}

impl<'k> Leader<'k> {
    pub fn id(&self) -> ClientId {
        self.kernel.leader_id
    }

    /// Run a change on the canonical store and broadcast its Shared effect
    ///
    /// Returns the broadcast transaction, if any, with `f`'s value. On
    /// error nothing is kept and nothing is sent.
    pub fn change<T>(&self, f: impl FnOnce(&mut Change<'_>) -> RippleResult<T>) -> RippleResult<(T, Option<Transaction>)> {
        let (value, tx, deferred) = {
            let mut guard = self.kernel.state.lock();
            let state = &mut *guard;

            let mut change = Change::new(&mut state.db, &self.kernel.set);
            let value = match f(&mut change) {
                Ok(value) => value,
                Err(e) => {
                    change.rollback();
                    return Err(e);
                }
            };
            let outcome = change.finish();

            let wire = outcome.shared_wire();
            let tx = if wire.is_empty() {
                None
            } else {
                let index = state.clock.tick(self.id());
                let tx = Transaction::new(self.id(), index, wire);
                debug!("Leader {} ({} instructions, index {})", tx.id, tx.instructions.len(), index);
                let _ = self.kernel.events.send(KernelEvent::Applied(tx.clone()));
                Some(tx)
            };
            (value, tx, outcome.deferred)
        };

        for effect in deferred {
            if let Err(e) = effect() {
                warn!("Leader deferred effect failed: {}", e);
            }
        }
        Ok((value, tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use ripple_codec::InstructionSet;
    use ripple_core::{AttributeSchema, Partition, RippleError, Value};
    use ripple_transport::RemoteKernel;
    use ripple_wire::Broadcast;

    use crate::KernelConfig;

    fn kernel() -> Kernel {
        Kernel::new(
            Arc::new(InstructionSet::standard()),
            KernelConfig::testing().with_leader_id(ClientId::from_u128(100)),
        )
    }

    #[test]
    fn test_shared_write_ticks_leader_clock() {
        let kernel = kernel();
        let (e, tx) = kernel
            .leader()
            .change(|c| {
                let name = c.attribute("todo/name", AttributeSchema::scalar())?;
                c.create_entity(Partition::Shared, "todo", vec![(name, Value::from("seed"))])
            })
            .unwrap();

        let tx = tx.unwrap();
        assert_eq!(tx.origin, ClientId::from_u128(100));
        assert_eq!(tx.index, 1);
        assert!(tx.instructions.iter().all(|w| !w.is_validate()));
        assert_eq!(kernel.clock().get(kernel.leader_id()), 1);
        assert!(kernel.read(|db| db.uid_of(e).is_some()));
    }

    #[test]
    fn test_local_write_stays_home() {
        let kernel = kernel();
        let (_, tx) = kernel
            .leader()
            .change(|c| {
                let open = c.attribute("ui/open", AttributeSchema::scalar())?;
                c.create_entity(Partition::Local, "panel", vec![(open, Value::from(true))])
            })
            .unwrap();

        assert!(tx.is_none());
        assert_eq!(kernel.clock().get(kernel.leader_id()), 0);
    }

    #[test]
    fn test_reads_leave_no_validations() {
        let kernel = kernel();
        let (e, _) = kernel
            .leader()
            .change(|c| {
                let name = c.attribute("todo/name", AttributeSchema::scalar())?;
                c.create_entity(Partition::Shared, "todo", vec![(name, Value::from("a"))])
            })
            .unwrap();
        let name = kernel.read(|db| db.schema().attribute_by_ident("todo/name").unwrap());

        let (_, tx) = kernel
            .leader()
            .change(|c| {
                let current = c.get_one(e, name).unwrap();
                c.add(e, name, format!("{}!", current.as_str().unwrap()))
            })
            .unwrap();
        let tx = tx.unwrap();
        assert_eq!(tx.instructions.len(), 1);
        assert_eq!(tx.index, 2);
    }

    #[test]
    fn test_failed_change_kept_nothing() {
        let kernel = kernel();
        let result = kernel.leader().change(|c| {
            let name = c.attribute("todo/name", AttributeSchema::scalar())?;
            c.create_entity(Partition::Shared, "todo", vec![(name, Value::from("x"))])?;
            Err::<(), _>(RippleError::Hook("abort".into()))
        });

        assert!(result.is_err());
        assert!(kernel.read(|db| db.entities_in(Partition::Shared).is_empty()));
        assert_eq!(kernel.clock().get(kernel.leader_id()), 0);
    }

    #[tokio::test]
    async fn test_leader_write_reaches_clients_as_tx() {
        let kernel = kernel();
        let mut sub = kernel.subscribe(ClientId::from_u128(1)).await.unwrap();
        let (_, tx) = kernel
            .leader()
            .change(|c| {
                let name = c.attribute("todo/name", AttributeSchema::scalar())?;
                c.create_entity(Partition::Shared, "todo", vec![(name, Value::from("x"))])
            })
            .unwrap();

        let received = tokio::time::timeout(std::time::Duration::from_secs(5), sub.broadcasts.recv())
            .await
            .unwrap();
        assert_eq!(received, Some(Broadcast::Tx(tx.unwrap())));
    }
}
