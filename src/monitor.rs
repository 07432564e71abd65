//! Seam to the external object-monitor service.
//!
//! The lock/monitor implementation lives in the hosted VM; the core only needs the handful
//! of operations used when a stale reference to a locked object is eliminated. Thin/fat lock
//! representation, wait queues and recursion bookkeeping stay behind this trait.

use crate::util::{ObjectReference, VMMutatorThread};

pub trait ObjectMonitor: Send + Sync {
    /// The mutator currently owning `object`'s monitor, if any. With a recursive nest the
    /// owner stays reported until every level has been released.
    fn owner_of(&self, object: ObjectReference) -> Option<VMMutatorThread>;

    /// Mark the lock associated with `object` as belonging to a dead object, so that late
    /// waiters fail fast instead of blocking forever.
    fn mark_object_dead(&self, object: ObjectReference);

    /// Make every thread waiting on `object`'s monitor runnable. Called while mutators are
    /// suspended; the wake-ups are delivered once the rendezvous finishes.
    fn notify_all(&self, object: ObjectReference, owner: VMMutatorThread);

    /// Release one nesting level of the monitor held by `owner`. The caller loops until
    /// `owner_of` no longer reports `owner`.
    fn release(&self, object: ObjectReference, owner: VMMutatorThread);
}
