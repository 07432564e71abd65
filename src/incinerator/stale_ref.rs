//! Elimination of queued stale references.
//!
//! Runs at the end of the collection trace, while every mutator is still suspended: the
//! stores below cannot race with user code, and the wake-ups queued by `notify_all` are
//! delivered once the rendezvous finishes.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::incinerator::{Incinerator, StaleRef};
use crate::util::Address;
use crate::vm::collector::{load_slot, Collector};
use crate::vm::VirtualMachine;

impl Incinerator {
    /// Driver hook: the trace (including the finalizable rescan) is complete. Act on the
    /// queue: every remaining entry is unreachable from any live, non-stale,
    /// non-finalizable path, so the slots can be reset.
    pub(crate) fn collector_phase_complete(&self, vm: &dyn VirtualMachine) {
        let drained: Vec<(Address, StaleRef)> =
            self.sync.lock().unwrap().stale_refs.drain().collect();
        for (slot, entry) in drained {
            self.eliminate_stale_ref(vm, slot, entry);
        }
        #[cfg(feature = "extreme_assertions")]
        debug_assert_eq!(self.pending_stale_refs(), 0);
    }

    /// Moving collectors must call this before elimination so the queue reflects the new
    /// object addresses. Reference slots themselves are fixed in this phase.
    pub fn forward_stale_refs(&self, collector: &dyn Collector) {
        let mut sync = self.sync.lock().unwrap();
        for entry in sync.stale_refs.values_mut() {
            entry.target = collector.get_forwarded_reference(entry.target);
            entry.source = entry.source.map(|s| collector.get_forwarded_reference(s));
        }
    }

    fn eliminate_stale_ref(&self, vm: &dyn VirtualMachine, slot: Address, entry: StaleRef) {
        // Re-load the slot; the queue records what it held at scan time.
        let Some(target) = load_slot(slot) else {
            return;
        };
        let Some(loader) = vm.class_loader_of(target) else {
            return;
        };
        if !loader.is_stale_references_correction_enabled() {
            warn!(
                "ignoring stale ref {} => {} ({}), correction disabled for {:?}",
                slot,
                target,
                vm.get_object_type_name(target),
                loader
            );
            return;
        }

        if let Some(monitors) = vm.object_monitor() {
            if let Some(owner) = monitors.owner_of(target) {
                monitors.mark_object_dead(target);
                // Notify all threads waiting on this object.
                monitors.notify_all(target, owner);
                // Release this object; the owner may hold a recursive nest.
                while monitors.owner_of(target) == Some(owner) {
                    monitors.release(target, owner);
                }
            }
        }

        // Reset the reference. Mutators are suspended, but another collector thread may
        // read the slot concurrently.
        unsafe { slot.atomic_store::<AtomicUsize>(0, Ordering::SeqCst) };
        match entry.source {
            Some(source) => debug!("reset stale ref {} => {} held by {}", slot, target, source),
            None => debug!("reset stale ref {} => {} held by a root", slot, target),
        }
    }
}
