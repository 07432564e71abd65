//! MRTK instance.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use delegate::delegate;
use probe::probe;

use crate::finalizer::FinalizerThread;
use crate::function_map::{FunctionMap, MethodInfo};
use crate::global_state::{GcStatus, GlobalState};
use crate::rendezvous::{CollectionRendezvous, RendezvousKind};
use crate::thread::{self, MutatorThread};
use crate::util::finalizable_processor::FinalizableProcessor;
use crate::util::options::{Options, RendezvousSelector};
use crate::util::{Address, ObjectReference, OpaquePointer, VMMutatorThread};
use crate::vm::collector::{Collector, ScanHooks};
use crate::vm::{VMThreadData, VirtualMachine, VmId};

/// MRTK builder. This is used to set options before actually creating an MRTK instance.
pub struct MRTKBuilder {
    /// The options for this instance.
    pub options: Options,
}

impl MRTKBuilder {
    /// Create an MRTK builder with options read from environment variables, or using
    /// built-in defaults if not overridden by environment variables.
    pub fn new() -> Self {
        let mut builder = Self::new_no_env_vars();
        builder.options.read_env_var_settings();
        builder
    }

    /// Create an MRTK builder with built-in default options, but without reading options
    /// from environment variables.
    pub fn new_no_env_vars() -> Self {
        MRTKBuilder {
            options: Options::default_values(),
        }
    }

    /// Build an MRTK instance from the builder, coordinating collections with the given
    /// collector.
    pub fn build(&self, collector: Arc<dyn Collector>) -> MRTK {
        MRTK::new(Arc::new(self.options.clone()), collector)
    }
}

impl Default for MRTKBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What a collection request accomplished.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CollectionResult {
    /// This thread performed the collection.
    Collected,
    /// Another collection was already in progress; this thread joined it instead.
    Skipped,
}

/// An MRTK instance: the state shared by every VM hosted in the process. There is normally
/// one instance per process, created once at start-up.
pub struct MRTK {
    pub(crate) options: Arc<Options>,
    pub(crate) state: Arc<GlobalState>,
    pub(crate) registry: Mutex<Registry>,
    pub(crate) rendezvous: CollectionRendezvous,
    pub(crate) function_map: FunctionMap,
    pub(crate) finalization: Mutex<FinalizableProcessor>,
    pub(crate) finalization_cond: Condvar,
    collector: Arc<dyn Collector>,
}

/// The VM slot array and the two mutator membership lists, all guarded by one registry
/// lock. The collection driver holds the lock for the whole collection, so no VM and no
/// thread can come or go mid-cycle.
pub(crate) struct Registry {
    /// VM handles indexed by `VmId`. Grows by doubling; freed slots are reused.
    vms: Vec<Option<Arc<dyn VirtualMachine>>>,
    /// Threads that are created but not yet running application code.
    pub(crate) prepared: Vec<Arc<MutatorThread>>,
    /// Threads currently running application code.
    pub(crate) running: Vec<Arc<MutatorThread>>,
}

impl Registry {
    pub(crate) fn vms(&self) -> impl Iterator<Item = (VmId, &Arc<dyn VirtualMachine>)> {
        self.vms
            .iter()
            .enumerate()
            .filter_map(|(i, vm)| vm.as_ref().map(|vm| (VmId(i), vm)))
    }

    fn mutators(&self) -> impl Iterator<Item = &Arc<MutatorThread>> {
        self.prepared.iter().chain(self.running.iter())
    }
}

impl MRTK {
    pub(crate) fn new(options: Arc<Options>, collector: Arc<dyn Collector>) -> Self {
        crate::util::logger::try_init(&options);
        let kind = match options.rendezvous {
            RendezvousSelector::Cooperative => RendezvousKind::Cooperative,
            RendezvousSelector::Uncooperative => RendezvousKind::Uncooperative,
        };
        let rendezvous = CollectionRendezvous::new(kind);
        rendezvous.prepare_for_join();
        MRTK {
            options,
            state: Arc::new(GlobalState::default()),
            registry: Mutex::new(Registry {
                vms: vec![],
                prepared: vec![],
                running: vec![],
            }),
            rendezvous,
            function_map: FunctionMap::new(),
            finalization: Mutex::new(FinalizableProcessor::new()),
            finalization_cond: Condvar::new(),
            collector,
        }
    }

    /// Get the run time options.
    pub fn get_options(&self) -> &Options {
        &self.options
    }

    /// The process-lifetime collection state.
    pub fn state(&self) -> &GlobalState {
        &self.state
    }

    /// Allow collections to run, and spawn the finalizer thread if the options ask for one.
    /// Must be called once, after the instance is created and before the first collection.
    pub fn initialize_collection(self: &Arc<Self>) -> Option<FinalizerThread> {
        debug_assert!(!self.state.is_initialized());
        self.state.initialized.store(true, Ordering::SeqCst);
        if self.options.finalizer_thread {
            Some(FinalizerThread::spawn(self))
        } else {
            None
        }
    }

    // ------------------------------------------------------------------ //
    // VM management
    // ------------------------------------------------------------------ //

    /// Register a VM and assign it the first free slot. If no slot is free the slot array
    /// doubles, and every registered mutator's per-VM data array is re-lengthened to match.
    /// A freed slot is only reused once no mutator holds per-VM data for it.
    pub fn add_vm(&self, vm: Arc<dyn VirtualMachine>) -> VmId {
        let registry = &mut *self.registry.lock().unwrap();

        let free_slot = (0..registry.vms.len()).find(|&i| {
            registry.vms[i].is_none()
                && registry.mutators().all(|m| m.vm_data_is_none(VmId(i)))
        });
        if let Some(i) = free_slot {
            registry.vms[i] = Some(vm);
            debug!("add vm: reused slot {}", i);
            return VmId(i);
        }

        let old_len = registry.vms.len();
        let new_len = std::cmp::max(1, old_len * 2);
        registry.vms.resize_with(new_len, || None);
        for mutator in registry.mutators() {
            mutator.grow_per_vm(new_len);
        }
        registry.vms[old_len] = Some(vm);
        debug!("add vm: grew slot array {} -> {}", old_len, new_len);
        VmId(old_len)
    }

    /// Remove a VM. Callers should have released every mutator's per-VM data for this id
    /// first; if any is still held, the slot is not reused until it is gone.
    pub fn remove_vm(&self, id: VmId) {
        let registry = &mut *self.registry.lock().unwrap();
        debug_assert!(registry.vms[id.0].is_some());
        if registry.mutators().any(|m| !m.vm_data_is_none(id)) {
            warn!(
                "removing vm {} while mutators still hold its per-thread data; \
                 slot reuse is deferred until the data is released",
                id
            );
        }
        self.finalization.lock().unwrap().retain_except(id);
        registry.vms[id.0] = None;
        debug!("remove vm: slot {}", id);
    }

    /// The VM registered at the given slot, if any.
    pub fn get_vm(&self, id: VmId) -> Option<Arc<dyn VirtualMachine>> {
        self.registry.lock().unwrap().vms.get(id.0).cloned().flatten()
    }

    // ------------------------------------------------------------------ //
    // Thread management
    // ------------------------------------------------------------------ //

    /// Register a new mutator in the prepared list: created, but not yet running
    /// application code.
    pub fn register_prepared_thread(&self, tls: VMMutatorThread) -> Arc<MutatorThread> {
        let mut registry = self.registry.lock().unwrap();
        let mutator = Arc::new(MutatorThread::new(tls));
        mutator.grow_per_vm(registry.vms.len());
        registry.prepared.push(mutator.clone());
        debug!("register prepared thread");
        mutator
    }

    /// Move a mutator from the prepared to the running list. Must be called by the mutator
    /// thread itself: the OS-level handle for rendezvous signalling is captured here. A
    /// thread registering while a rendezvous is active blocks here until it finishes.
    pub fn register_running_thread(&self, mutator: &Arc<MutatorThread>) {
        let mut registry = self.registry.lock().unwrap();
        mutator.capture_os_thread();
        thread::set_current_mutator(Some(mutator));
        registry.prepared.retain(|m| !Arc::ptr_eq(m, mutator));
        registry.running.push(mutator.clone());
        debug!("register running thread ({} running)", registry.running.len());
    }

    /// Move a mutator back from the running to the prepared list, before it terminates.
    /// Must be called by the mutator thread itself.
    pub fn unregister_running_thread(&self, mutator: &Arc<MutatorThread>) {
        let mut registry = self.registry.lock().unwrap();
        thread::set_current_mutator(None);
        registry.running.retain(|m| !Arc::ptr_eq(m, mutator));
        registry.prepared.push(mutator.clone());
        debug!("unregister running thread ({} running)", registry.running.len());
    }

    /// Destroy a prepared mutator: release its per-VM data and drop it from the registry.
    pub fn unregister_prepared_thread(&self, mutator: &Arc<MutatorThread>) {
        let mut registry = self.registry.lock().unwrap();
        registry.prepared.retain(|m| !Arc::ptr_eq(m, mutator));
        mutator.clear_all_vm_data();
        debug!("unregister prepared thread");
    }

    pub fn running_thread_count(&self) -> usize {
        self.registry.lock().unwrap().running.len()
    }

    pub fn prepared_thread_count(&self) -> usize {
        self.registry.lock().unwrap().prepared.len()
    }

    /// Run `f` on the mutator's per-VM data for the given VM, building the data through
    /// the VM first if this thread has never interacted with it.
    pub fn with_vm_thread_data<R>(
        &self,
        mutator: &Arc<MutatorThread>,
        id: VmId,
        f: impl FnOnce(&mut dyn VMThreadData) -> R,
    ) -> Option<R> {
        let vm = self.get_vm(id)?;
        mutator.ensure_vm_data(id, || vm.build_vm_thread_data(mutator));
        mutator.with_vm_data(id, f)
    }

    /// Release the mutator's per-VM data for one VM.
    pub fn release_vm_thread_data(&self, mutator: &Arc<MutatorThread>, id: VmId) {
        mutator.clear_vm_data(id);
    }

    // ------------------------------------------------------------------ //
    // Safe points and native-code transitions
    // ------------------------------------------------------------------ //

    /// Poll for a pending rendezvous. Mutators call this between bytecodes, at method
    /// entry/exit, and anywhere else a safe point is guaranteed.
    pub fn safe_point(&self, mutator: &Arc<MutatorThread>) {
        if mutator.yield_requested() {
            self.rendezvous.join(mutator);
        }
    }

    /// The mutator is about to call into non-VM code (blocking I/O, a native library).
    pub fn enter_uncooperative_code(&self, mutator: &Arc<MutatorThread>) {
        self.rendezvous.join_before_uncooperative(mutator);
    }

    /// The mutator has returned from non-VM code; `sp` anchors stack walking for the
    /// frames above the native region.
    pub fn leave_uncooperative_code(&self, mutator: &Arc<MutatorThread>, sp: Address) {
        self.rendezvous.join_after_uncooperative(mutator, sp);
    }

    // ------------------------------------------------------------------ //
    // Finalization
    // ------------------------------------------------------------------ //

    /// Register an object with a finalizer. The object is kept alive after it dies until
    /// the finalizer thread has invoked `finalize_object` on it.
    pub fn add_finalization_candidate(&self, vm: VmId, object: ObjectReference) {
        self.finalization.lock().unwrap().add(vm, object);
    }

    /// Pop an object that is ready to be finalized.
    pub fn get_ready_finalizable(&self) -> Option<(VmId, ObjectReference)> {
        self.finalization.lock().unwrap().get_ready_object()
    }

    // ------------------------------------------------------------------ //
    // Backtrace-related methods
    // ------------------------------------------------------------------ //

    delegate! {
        to self.function_map {
            /// Record a new compiled method in the function map.
            pub fn add_method_info(&self, info: Arc<MethodInfo>);
            /// Map an instruction pointer to the method occupying that code range.
            pub fn ip_to_method_info(&self, ip: Address) -> Option<Arc<MethodInfo>>;
            /// Remove every method record owned by the given code-generation unit.
            pub fn remove_method_infos(&self, owner: OpaquePointer);
        }
    }

    // ------------------------------------------------------------------ //
    // Collection driver
    // ------------------------------------------------------------------ //

    /// Run a collection on behalf of `initiator`, a registered mutator.
    ///
    /// If another collection is already in progress the request is cancelled, the initiator
    /// joins the running collection, and `Skipped` is returned.
    pub fn collect(&self, initiator: &Arc<MutatorThread>) -> CollectionResult {
        debug_assert!(self.state.is_initialized());
        probe!(mrtk, collection_requested);

        let mut rv = self.rendezvous.start(initiator);
        if initiator.yield_requested() || rv.collection_in_progress() {
            debug!("collection already in progress, joining it");
            self.rendezvous.cancel(rv, initiator);
            self.rendezvous.join(initiator);
            self.state.skipped_collections.fetch_add(1, Ordering::SeqCst);
            return CollectionResult::Skipped;
        }

        info!("Start collection");
        self.set_gc_status(GcStatus::GcPrepare);

        // No VM and no thread may come or go until the collection is over.
        let registry = self.registry.lock().unwrap();
        let mut finalization = self.finalization.lock().unwrap();

        // Call start_collection on each VM before suspending anything; a VM may still need
        // to execute applicative code in this hook.
        for (_, vm) in registry.vms() {
            vm.start_collection();
        }

        self.rendezvous.synchronize(&mut rv, &registry.running, initiator);
        self.set_gc_status(GcStatus::GcProper);
        probe!(mrtk, collection_synchronized);

        let collector = self.collector.as_ref();
        for (id, vm) in registry.vms() {
            if let Some(incinerator) = vm.incinerator() {
                incinerator.before_collection();
            }

            let hooks = ScanHooks::new(vm.as_ref(), vm.incinerator());
            let mut closure = collector.begin_trace(id, hooks);

            // The roots: VM-global ones, then per-thread ones.
            vm.tracer(closure.as_mut());
            for mutator in registry.mutators() {
                mutator.trace_vm_data(id, closure.as_mut());
            }

            // Reference queues, weakest-first up to the finalization queue.
            vm.scan_weak_references_queue(closure.as_mut());
            vm.scan_soft_references_queue(closure.as_mut());
            finalization.scan(id, collector);

            // Objects queued for finalization resurrect their whole subgraph; stale
            // references found on that walk must survive this cycle.
            if let Some(incinerator) = vm.incinerator() {
                incinerator.marking_finalizers_done();
            }
            let ready = finalization.ready_for(id);
            collector.retrace_from(closure.as_mut(), &ready);

            vm.scan_phantom_references_queue(closure.as_mut());
            drop(closure);

            if let Some(incinerator) = vm.incinerator() {
                incinerator.collector_phase_complete(vm.as_ref());
                incinerator.after_collection();
            }
        }
        finalization.forward(collector);

        for (_, vm) in registry.vms() {
            vm.end_collection();
        }

        drop(finalization);
        self.finalization_cond.notify_all();

        self.rendezvous.finish(rv, initiator, &registry.running);
        self.state.gc_count.fetch_add(1, Ordering::SeqCst);
        self.set_gc_status(GcStatus::NotInGC);
        drop(registry);

        info!("End collection");
        probe!(mrtk, collection_finished);
        CollectionResult::Collected
    }

    fn set_gc_status(&self, status: GcStatus) {
        let mut gc_status = self.state.gc_status.lock().unwrap();
        if *gc_status == GcStatus::NotInGC {
            *self.state.gc_start_time.borrow_mut() = Some(Instant::now());
        }
        *gc_status = status;
        if *gc_status == GcStatus::NotInGC {
            if let Some(start) = self.state.gc_start_time.borrow_mut().take() {
                debug!("collection took {:?}", start.elapsed());
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn last_rendezvous_expected(&self) -> usize {
        self.rendezvous.last_expected()
    }
}
