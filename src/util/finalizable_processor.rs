use crate::util::ObjectReference;
use crate::vm::collector::Collector;
use crate::vm::VmId;

/// A special processor for finalizable objects.
///
/// Objects with finalizers are registered here when they are allocated. At the end of each
/// trace, candidates that were not reached become ready for finalization; they are kept alive
/// (together with everything they reference) until the finalizer thread pops them and invokes
/// the owning VM's `finalize_object`.
#[derive(Default)]
pub struct FinalizableProcessor {
    /// Candidate objects that have finalizers with them.
    candidates: Vec<(VmId, ObjectReference)>,
    /// Objects that can be finalized. They are actually dead, but we keep them alive
    /// until the finalizer thread pops them from the queue.
    ready_for_finalize: Vec<(VmId, ObjectReference)>,
}

impl FinalizableProcessor {
    pub fn new() -> Self {
        Self {
            candidates: vec![],
            ready_for_finalize: vec![],
        }
    }

    pub fn add(&mut self, vm: VmId, object: ObjectReference) {
        trace!("Add finalization candidate: {} (vm {})", object, vm);
        self.candidates.push((vm, object));
    }

    /// Move the given VM's dead candidates to the ready queue. Called after the transitive
    /// closure for that VM is complete.
    pub fn scan(&mut self, vm: VmId, collector: &dyn Collector) {
        let mut i = 0;
        while i < self.candidates.len() {
            let (owner, object) = self.candidates[i];
            if owner == vm && !collector.is_live(object) {
                trace!("{} is not live, ready to finalize", object);
                self.candidates.swap_remove(i);
                self.ready_for_finalize.push((owner, object));
            } else {
                i += 1;
            }
        }
        debug!(
            "Finalization scan for vm {}: {} candidates, {} ready to finalize",
            vm,
            self.candidates.len(),
            self.ready_for_finalize.len()
        );
    }

    /// Update the recorded references after a moving collection.
    pub fn forward(&mut self, collector: &dyn Collector) {
        for (_, object) in self
            .candidates
            .iter_mut()
            .chain(self.ready_for_finalize.iter_mut())
        {
            *object = collector.get_forwarded_finalizable(*object);
        }
    }

    /// The objects currently queued for finalization for the given VM. The collector re-walks
    /// reachability from these between the finalizable and phantom queue scans.
    pub fn ready_for(&self, vm: VmId) -> Vec<ObjectReference> {
        self.ready_for_finalize
            .iter()
            .filter(|(owner, _)| *owner == vm)
            .map(|(_, object)| *object)
            .collect()
    }

    pub fn get_ready_object(&mut self) -> Option<(VmId, ObjectReference)> {
        self.ready_for_finalize.pop()
    }

    pub fn has_ready_object(&self) -> bool {
        !self.ready_for_finalize.is_empty()
    }

    /// Drop every record owned by the given VM. Called when a VM is removed.
    pub fn retain_except(&mut self, vm: VmId) {
        self.candidates.retain(|(owner, _)| *owner != vm);
        self.ready_for_finalize.retain(|(owner, _)| *owner != vm);
    }
}
