//! The core-to-collector callback contracts.
//!
//! The core does not trace object fields itself; it drives a pluggable collector. The
//! collector provides the trace closure VMs report their roots into, answers liveness and
//! forwarding queries, and supplies the write barriers mutators funnel reference stores
//! through. In exchange it must filter every reference slot it visits through the per-VM
//! [`ScanHooks`], which implement stale-reference classification.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::function_map::MethodInfo;
use crate::incinerator::Incinerator;
use crate::util::{Address, ObjectReference};
use crate::vm::{VirtualMachine, VmId};

/// Decode the machine word held in a reference slot.
pub fn load_slot(slot: Address) -> Option<ObjectReference> {
    let raw = unsafe { slot.atomic_load::<AtomicUsize>(Ordering::Relaxed) };
    ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
}

/// Encode a nullable reference as the machine word stored in reference slots.
pub fn to_slot_word(target: Option<ObjectReference>) -> usize {
    target.map_or(0, |t| t.to_raw_address().as_usize())
}

/// The trace closure. Implemented by the collector; handed to
/// [`VirtualMachine::tracer`] and the reference-queue scans, which report reference slots
/// into it.
pub trait SlotVisitor {
    /// Report a heap or global reference slot. `source` is the object holding the slot, or
    /// `None` for roots.
    fn visit_slot(&mut self, source: Option<ObjectReference>, slot: Address);

    /// Report a stack slot, anchored at the method occupying the frame if known.
    fn visit_stack_slot(&mut self, method: Option<&MethodInfo>, slot: Address);
}

/// The per-VM scanning hooks. The collector must consult these for every reference slot
/// visited during tracing, and must not trace through a slot they reject.
pub struct ScanHooks<'a> {
    vm: &'a dyn VirtualMachine,
    incinerator: Option<&'a Incinerator>,
}

impl<'a> ScanHooks<'a> {
    pub fn new(vm: &'a dyn VirtualMachine, incinerator: Option<&'a Incinerator>) -> Self {
        ScanHooks { vm, incinerator }
    }

    /// Classify a heap/global slot. Returns whether to continue tracing through it.
    pub fn scan_ref(&self, source: Option<ObjectReference>, slot: Address) -> bool {
        match self.incinerator {
            Some(incinerator) => incinerator.scan_ref(self.vm, source, slot),
            None => true,
        }
    }

    /// Classify a stack slot. Returns whether to continue tracing through it.
    pub fn scan_stack_ref(&self, method: Option<&MethodInfo>, slot: Address) -> bool {
        match self.incinerator {
            Some(incinerator) => incinerator.scan_stack_ref(self.vm, method, slot),
            None => true,
        }
    }
}

/// Implemented by the pluggable collector; the core calls these over a collection cycle.
pub trait Collector: Send + Sync {
    /// Begin the transitive closure for one VM's part of the cycle. Roots reported to the
    /// returned closure are traced through transitively; every slot visited on the way must
    /// first pass the scanning hooks.
    fn begin_trace<'a>(&'a self, vm: VmId, hooks: ScanHooks<'a>) -> Box<dyn SlotVisitor + 'a>;

    /// Re-walk reachability from the given finalizable-queued objects, reporting each
    /// visited slot to `closure`. Runs between the finalizable and phantom queue scans;
    /// everything reached here stays alive until its finalizer has run.
    fn retrace_from(&self, closure: &mut dyn SlotVisitor, objects: &[ObjectReference]);

    /// Whether the object was reached during this cycle's trace.
    fn is_live(&self, object: ObjectReference) -> bool;

    // ---------------------------------------------------------------- //
    // Forwarding queries, used only by moving collectors.
    // ---------------------------------------------------------------- //

    fn get_forwarded_reference(&self, object: ObjectReference) -> ObjectReference {
        object
    }

    fn get_forwarded_referent(&self, object: ObjectReference) -> ObjectReference {
        object
    }

    fn get_forwarded_finalizable(&self, object: ObjectReference) -> ObjectReference {
        object
    }

    // ---------------------------------------------------------------- //
    // Write barriers. The defaults are plain stores; the signatures are fixed so a
    // generational or moving collector can observe every reference write.
    // ---------------------------------------------------------------- //

    /// A reference field of `_source` is written.
    fn object_ref_write(
        &self,
        _source: ObjectReference,
        slot: Address,
        target: Option<ObjectReference>,
    ) {
        unsafe { slot.store::<usize>(to_slot_word(target)) }
    }

    /// A reference array element of `_source` is written.
    fn object_ref_array_write(
        &self,
        _source: ObjectReference,
        slot: Address,
        target: Option<ObjectReference>,
    ) {
        unsafe { slot.store::<usize>(to_slot_word(target)) }
    }

    /// A reference slot outside the heap (a root, a handle) is written.
    fn object_ref_non_heap_write(&self, slot: Address, target: Option<ObjectReference>) {
        unsafe { slot.store::<usize>(to_slot_word(target)) }
    }

    /// Compare-and-swap on a reference field. Returns whether the swap took place.
    fn object_ref_try_cas(
        &self,
        _source: ObjectReference,
        slot: Address,
        old: Option<ObjectReference>,
        new: Option<ObjectReference>,
    ) -> bool {
        unsafe {
            slot.compare_exchange::<AtomicUsize>(
                to_slot_word(old),
                to_slot_word(new),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        }
    }
}
