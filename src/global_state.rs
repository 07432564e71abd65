use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// This stores some global states for an MRTK instance. Components that need the state keep
/// a reference to the struct instead of a reference to the whole instance.
pub struct GlobalState {
    /// Whether the instance is ready for collection. Set when `initialize_collection` is
    /// called; no collection may run before that, nor after shutdown.
    pub(crate) initialized: AtomicBool,
    /// The current GC status.
    pub(crate) gc_status: Mutex<GcStatus>,
    /// When did the current GC start? Only accessed by the initiator.
    pub(crate) gc_start_time: AtomicRefCell<Option<Instant>>,
    /// Number of completed collections.
    pub(crate) gc_count: AtomicUsize,
    /// Number of collection requests that joined an already running collection instead.
    pub(crate) skipped_collections: AtomicUsize,
}

impl GlobalState {
    /// Is the instance ready for collection?
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Return true if a collection is in progress.
    pub fn gc_in_progress(&self) -> bool {
        *self.gc_status.lock().unwrap() != GcStatus::NotInGC
    }

    /// Return true if a collection is in progress and past the preparatory stage.
    pub fn gc_in_progress_proper(&self) -> bool {
        *self.gc_status.lock().unwrap() == GcStatus::GcProper
    }

    /// Number of completed collections.
    pub fn gc_count(&self) -> usize {
        self.gc_count.load(Ordering::SeqCst)
    }

    /// Number of collection requests that found a collection already running.
    pub fn skipped_collections(&self) -> usize {
        self.skipped_collections.load(Ordering::SeqCst)
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            gc_status: Mutex::new(GcStatus::NotInGC),
            gc_start_time: AtomicRefCell::new(None),
            gc_count: AtomicUsize::new(0),
            skipped_collections: AtomicUsize::new(0),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GcStatus {
    NotInGC,
    GcPrepare,
    GcProper,
}
