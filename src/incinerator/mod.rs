//! Stale-reference reclamation for unloadable code bundles.
//!
//! A bundle is a dynamically loadable unit of code with an associated class loader. When a
//! bundle is uninstalled or updated, objects of its classes may still be referenced from the
//! heap and from stacks; those references keep the old class loader (and all its class data)
//! alive indefinitely. The incinerator finds such references during a collection and resets
//! them, so the next cycle can reclaim the unloaded code.
//!
//! Classification happens while the collector traces the heap: every reference slot visited
//! is passed through [`Incinerator::scan_ref`]. Over a cycle the scanning mode moves through
//!
//! ```text
//! disabled --(needs_rescan or bundle-uninstall)--> inclusive
//! inclusive --(marking finalizers done)--> exclusive
//! exclusive --(collector phase complete)--> act on queue, then disabled
//! ```
//!
//! The inclusive policy queues every slot holding a stale reference and prunes the trace at
//! it, so stale objects keep nothing else alive. The exclusive policy runs while the
//! collector re-walks reachability from finalizable-queued objects: anything rediscovered
//! there must survive until its finalizer has run, so its entries are dropped from the queue
//! and another collection is requested. What remains in the queue is eliminated before the
//! mutators resume.

mod stale_ref;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomic::Atomic;
use bytemuck::NoUninit;
use itertools::Itertools;

use crate::function_map::MethodInfo;
use crate::mrtk::{CollectionResult, MRTK};
use crate::thread::MutatorThread;
use crate::util::{Address, ObjectReference};
use crate::vm::collector::{load_slot, to_slot_word};
use crate::vm::VirtualMachine;

/// Identifier of a dynamically loadable code bundle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct BundleId(pub u64);

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Errors surfaced by the bundle-facing operations.
#[derive(Debug, PartialEq, Eq)]
pub enum BundleError {
    /// The bundle id does not resolve to an installed bundle.
    InvalidBundle(BundleId),
}

impl fmt::Display for BundleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BundleError::InvalidBundle(bundle) => write!(f, "Invalid bundle ID: {}", bundle),
        }
    }
}

impl std::error::Error for BundleError {}

/// A class loader as seen by the core: the unit of staleness. The hosted VM owns the real
/// loader; the core tracks the two flags that drive stale-reference correction.
pub struct ClassLoader {
    name: String,
    /// Marked when the loader's bundle has been uninstalled or replaced.
    stale: AtomicBool,
    /// Whether stale references into this loader's classes are corrected. Propagates to the
    /// replacement loader across bundle updates.
    correction_enabled: AtomicBool,
}

impl ClassLoader {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(ClassLoader {
            name: name.into(),
            stale: AtomicBool::new(false),
            correction_enabled: AtomicBool::new(true),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::SeqCst)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::SeqCst);
    }

    pub fn is_stale_references_correction_enabled(&self) -> bool {
        self.correction_enabled.load(Ordering::SeqCst)
    }

    pub fn set_stale_references_correction_enabled(&self, enabled: bool) {
        self.correction_enabled.store(enabled, Ordering::SeqCst);
    }
}

impl fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ClassLoader({}{})",
            self.name,
            if self.is_stale() { ", stale" } else { "" }
        )
    }
}

/// The reference-scanning behaviour currently in effect, driven by the collection phase.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, NoUninit)]
pub enum ScanMode {
    /// Normal tracing; stale objects are not special.
    Disabled,
    /// Collect candidate stale references and prune the trace at them.
    Inclusive,
    /// Exclude references rediscovered through finalizable objects from the queue.
    Exclusive,
}

/// A queued stale reference: the slot's holder at enqueue time (`None` for roots and stack
/// slots) and the stale object it referred to.
#[derive(Copy, Clone, Debug)]
struct StaleRef {
    source: Option<ObjectReference>,
    target: ObjectReference,
}

/// A slot found referring to the object passed to
/// [`Incinerator::dump_references_to_object`].
#[derive(Copy, Clone, Debug)]
pub struct Referencer {
    pub slot: Address,
    pub source: Option<ObjectReference>,
}

/// Per-VM incinerator state. Owned by the hosted VM and exposed to the collection driver
/// through [`VirtualMachine::incinerator`].
pub struct Incinerator {
    scan_mode: Atomic<ScanMode>,
    /// Some stale references were ignored this cycle because finalizable stale objects
    /// still reach them; the next collection must scan again.
    needs_rescan: AtomicBool,
    /// Raw word of the object whose referencers are being collected, or 0.
    find_references_to: AtomicUsize,
    sync: Mutex<IncineratorSync>,
}

struct IncineratorSync {
    /// Live map: installed bundles to their current class loaders.
    bundle_class_loaders: HashMap<BundleId, Arc<ClassLoader>>,
    /// Uninstalled/replaced class loaders, most recent first, kept until the loader itself
    /// is reclaimed and `class_loader_unloaded` fires.
    stale_bundle_class_loaders: HashMap<BundleId, Vec<Arc<ClassLoader>>>,
    /// Stale references queued for elimination in this cycle.
    stale_refs: HashMap<Address, StaleRef>,
    /// Slots found referring to the dump target.
    found_referencers: Vec<Referencer>,
}

impl Incinerator {
    pub fn new() -> Self {
        Incinerator {
            scan_mode: Atomic::new(ScanMode::Disabled),
            needs_rescan: AtomicBool::new(false),
            find_references_to: AtomicUsize::new(0),
            sync: Mutex::new(IncineratorSync {
                bundle_class_loaders: HashMap::new(),
                stale_bundle_class_loaders: HashMap::new(),
                stale_refs: HashMap::new(),
                found_referencers: vec![],
            }),
        }
    }

    // ------------------------------------------------------------------ //
    // Bundle and class-loader boundary
    // ------------------------------------------------------------------ //

    /// Toggle stale-reference correction for an installed bundle.
    pub fn set_bundle_stale_reference_corrected(
        &self,
        bundle: BundleId,
        corrected: bool,
    ) -> Result<(), BundleError> {
        let sync = self.sync.lock().unwrap();
        let loader = sync
            .bundle_class_loaders
            .get(&bundle)
            .ok_or(BundleError::InvalidBundle(bundle))?;
        debug!(
            "Stale references to bundle {} are {} corrected",
            bundle,
            if corrected { "" } else { "no more" }
        );
        loader.set_stale_references_correction_enabled(corrected);
        Ok(())
    }

    pub fn is_bundle_stale_reference_corrected(&self, bundle: BundleId) -> Result<bool, BundleError> {
        let sync = self.sync.lock().unwrap();
        let loader = sync
            .bundle_class_loaders
            .get(&bundle)
            .ok_or(BundleError::InvalidBundle(bundle))?;
        Ok(loader.is_stale_references_correction_enabled())
    }

    pub fn get_bundle_class_loader(&self, bundle: BundleId) -> Option<Arc<ClassLoader>> {
        self.sync
            .lock()
            .unwrap()
            .bundle_class_loaders
            .get(&bundle)
            .cloned()
    }

    /// The bundle a class loader belongs to, consulting both the live and the stale maps.
    pub fn get_class_loader_bundle_id(&self, loader: &Arc<ClassLoader>) -> Option<BundleId> {
        let sync = self.sync.lock().unwrap();
        sync.bundle_class_loaders
            .iter()
            .find(|(_, live)| Arc::ptr_eq(live, loader))
            .map(|(bundle, _)| *bundle)
            .or_else(|| {
                sync.stale_bundle_class_loaders
                    .iter()
                    .find(|(_, loaders)| loaders.iter().any(|l| Arc::ptr_eq(l, loader)))
                    .map(|(bundle, _)| *bundle)
            })
    }

    /// Link a bundle to a class loader. Uninstalling (`None`) or replacing the loader marks
    /// the previous one stale and enables stale-reference scanning for the next collection;
    /// on an update the correction setting carries over to the new loader.
    pub fn set_bundle_class_loader(&self, bundle: BundleId, loader: Option<Arc<ClassLoader>>) {
        let mut sync = self.sync.lock().unwrap();
        let previous = sync.bundle_class_loaders.get(&bundle).cloned();

        let updated = match (&previous, &loader) {
            (Some(previous), Some(new)) => !Arc::ptr_eq(previous, new),
            _ => false,
        };

        if updated {
            loader.as_ref().unwrap().set_stale_references_correction_enabled(
                previous
                    .as_ref()
                    .unwrap()
                    .is_stale_references_correction_enabled(),
            );
        }

        // Either bundle uninstalled, or bundle updated with a different class loader.
        if updated || (previous.is_some() && loader.is_none()) {
            let stale = previous.unwrap();
            info!(
                "bundle {} {}: class loader {:?} is now stale",
                bundle,
                if updated { "updated" } else { "uninstalled" },
                stale
            );
            stale.mark_stale();
            sync.stale_bundle_class_loaders
                .entry(bundle)
                .or_default()
                .insert(0, stale);
            self.set_scanning_inclusive();
        }

        match loader {
            Some(loader) => {
                sync.bundle_class_loaders.insert(bundle, loader);
            }
            None => {
                sync.bundle_class_loaders.remove(&bundle);
            }
        }
    }

    /// Called from class-loader destruction, once no reference to the loader remains.
    pub fn class_loader_unloaded(&self, loader: &Arc<ClassLoader>) {
        let mut sync = self.sync.lock().unwrap();
        let bundle = sync
            .stale_bundle_class_loaders
            .iter()
            .find(|(_, loaders)| loaders.iter().any(|l| Arc::ptr_eq(l, loader)))
            .map(|(bundle, _)| *bundle);
        let Some(bundle) = bundle else {
            debug!("class loader unloaded: {:?}", loader);
            return;
        };
        let loaders = sync.stale_bundle_class_loaders.get_mut(&bundle).unwrap();
        loaders.retain(|l| !Arc::ptr_eq(l, loader));
        if loaders.is_empty() {
            sync.stale_bundle_class_loaders.remove(&bundle);
        }
        debug!("class loader unloaded: {:?} bundle {}", loader, bundle);
    }

    /// Log the stale-bundle index.
    pub fn dump_class_loader_bundles(&self) {
        let sync = self.sync.lock().unwrap();
        for (bundle, loaders) in &sync.stale_bundle_class_loaders {
            debug!(
                "stale bundle {} class loaders: {}",
                bundle,
                loaders.iter().map(|l| l.name()).join(", ")
            );
        }
    }

    // ------------------------------------------------------------------ //
    // Collection triggers
    // ------------------------------------------------------------------ //

    /// Enable stale-reference scanning and run a collection now.
    pub fn force_stale_reference_scanning(
        &self,
        mrtk: &MRTK,
        initiator: &Arc<MutatorThread>,
    ) -> CollectionResult {
        self.set_scanning_inclusive();
        mrtk.collect(initiator)
    }

    /// Run a collection that records every slot referring to `object`, and return the
    /// report. The report of a skipped collection is empty.
    pub fn dump_references_to_object(
        &self,
        mrtk: &MRTK,
        initiator: &Arc<MutatorThread>,
        object: ObjectReference,
    ) -> Vec<Referencer> {
        self.find_references_to
            .store(to_slot_word(Some(object)), Ordering::SeqCst);
        mrtk.collect(initiator);
        std::mem::take(&mut self.sync.lock().unwrap().found_referencers)
    }

    // ------------------------------------------------------------------ //
    // Scanning-mode state machine
    // ------------------------------------------------------------------ //

    pub fn scanning_mode(&self) -> ScanMode {
        self.scan_mode.load(Ordering::SeqCst)
    }

    pub fn needs_rescan(&self) -> bool {
        self.needs_rescan.load(Ordering::SeqCst)
    }

    /// Number of stale references currently queued for elimination.
    pub fn pending_stale_refs(&self) -> usize {
        self.sync.lock().unwrap().stale_refs.len()
    }

    fn is_scanning_enabled(&self) -> bool {
        self.scanning_mode() != ScanMode::Disabled
    }

    fn set_scanning_disabled(&self) {
        self.scan_mode.store(ScanMode::Disabled, Ordering::SeqCst);
        debug!("Looking for stale references done");
    }

    fn set_scanning_inclusive(&self) {
        self.scan_mode.store(ScanMode::Inclusive, Ordering::SeqCst);
        debug!("Looking for stale references");
    }

    fn set_scanning_exclusive(&self) {
        self.scan_mode.store(ScanMode::Exclusive, Ordering::SeqCst);
        debug!("Excluding stale references reachable from finalizable objects");
    }

    /// Driver hook: a collection is about to trace. A pending rescan re-arms inclusive
    /// scanning for this cycle.
    pub(crate) fn before_collection(&self) {
        if self.find_references_to.load(Ordering::SeqCst) != 0 {
            self.sync.lock().unwrap().found_referencers.clear();
        }
        if !self.needs_rescan() && !self.is_scanning_enabled() {
            return;
        }
        self.needs_rescan.store(false, Ordering::SeqCst);
        self.set_scanning_inclusive();
    }

    /// Driver hook: the finalizable queue has been marked; the collector will now re-walk
    /// reachability from finalizable-queued objects.
    pub(crate) fn marking_finalizers_done(&self) {
        if !self.is_scanning_enabled() {
            return;
        }
        self.set_scanning_exclusive();
    }

    /// Driver hook: the cycle is over; mutators are about to resume.
    pub(crate) fn after_collection(&self) {
        self.find_references_to.store(0, Ordering::SeqCst);
        if !self.is_scanning_enabled() {
            return;
        }
        if self.needs_rescan() {
            debug!(
                "Some stale references were ignored due to finalizable stale objects; \
                 another collection is needed"
            );
        }
        self.set_scanning_disabled();
    }

    // ------------------------------------------------------------------ //
    // Scanning policies
    // ------------------------------------------------------------------ //

    /// An object is stale when its class's class loader is both marked stale and has
    /// correction enabled. Bridge objects between the hosted object model and the core are
    /// never stale.
    fn is_stale_object(&self, vm: &dyn VirtualMachine, object: ObjectReference) -> bool {
        if vm.is_vm_internal_object(object) {
            return false;
        }
        match vm.class_loader_of(object) {
            Some(loader) => loader.is_stale() && loader.is_stale_references_correction_enabled(),
            None => false,
        }
    }

    /// Called by the collector for every reference slot visited during tracing. Returns
    /// whether the collector should trace through the slot.
    pub fn scan_ref(
        &self,
        vm: &dyn VirtualMachine,
        source: Option<ObjectReference>,
        slot: Address,
    ) -> bool {
        let target = load_slot(slot);
        self.record_referencer(target, source, slot);
        match self.scanning_mode() {
            ScanMode::Disabled => true,
            ScanMode::Inclusive => self.scan_ref_inclusive(vm, source, slot, target),
            ScanMode::Exclusive => self.scan_ref_exclusive(vm, target),
        }
    }

    /// Stack-slot variant of [`Incinerator::scan_ref`]; stack slots have no source object.
    pub fn scan_stack_ref(
        &self,
        vm: &dyn VirtualMachine,
        method: Option<&MethodInfo>,
        slot: Address,
    ) -> bool {
        if let Some(method) = method {
            trace!("scan stack ref in {}: {}", method, slot);
        }
        self.scan_ref(vm, None, slot)
    }

    fn scan_ref_inclusive(
        &self,
        vm: &dyn VirtualMachine,
        source: Option<ObjectReference>,
        slot: Address,
        target: Option<ObjectReference>,
    ) -> bool {
        let Some(target) = target else { return true };
        if !self.is_stale_object(vm, target) {
            return true;
        }
        trace!("stale ref {} => {}", slot, target);
        self.sync
            .lock()
            .unwrap()
            .stale_refs
            .insert(slot, StaleRef { source, target });
        // Skip this reference and don't trace through it.
        false
    }

    fn scan_ref_exclusive(&self, vm: &dyn VirtualMachine, target: Option<ObjectReference>) -> bool {
        if let Some(target) = target {
            if self.is_stale_object(vm, target) {
                // The object is reachable from a finalizable path; it must not be
                // eliminated this cycle.
                let mut sync = self.sync.lock().unwrap();
                let before = sync.stale_refs.len();
                sync.stale_refs.retain(|_, entry| entry.target != target);
                trace!(
                    "excluded stale object {} ({} queued refs dropped)",
                    target,
                    before - sync.stale_refs.len()
                );
                self.needs_rescan.store(true, Ordering::SeqCst);
            }
        }
        // Trace this reference.
        true
    }

    fn record_referencer(
        &self,
        target: Option<ObjectReference>,
        source: Option<ObjectReference>,
        slot: Address,
    ) {
        let wanted = self.find_references_to.load(Ordering::SeqCst);
        if wanted == 0 || to_slot_word(target) != wanted {
            return;
        }
        self.sync
            .lock()
            .unwrap()
            .found_referencers
            .push(Referencer { slot, source });
    }
}

impl Default for Incinerator {
    fn default() -> Self {
        Self::new()
    }
}
