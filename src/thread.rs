//! Mutator thread descriptors.
//!
//! Every thread that executes hosted application code is registered with the core and is
//! represented by a [`MutatorThread`]. The descriptor carries the rendezvous state of the
//! thread (yield flag, join bookkeeping, last known stack pointer) and one data slot per
//! registered VM, kept the same length as the VM slot array.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::util::{Address, VMMutatorThread};
use crate::vm::{VMThreadData, VmId};

pub struct MutatorThread {
    /// Opaque identity of the underlying VM thread.
    tls: VMMutatorThread,
    /// Set by the rendezvous; polled by the mutator at safe points.
    yield_requested: AtomicBool,
    /// The thread is initiating (or trying to initiate) a rendezvous.
    in_rendezvous: AtomicBool,
    /// The thread has checked in for the current rendezvous.
    joined_rv: AtomicBool,
    /// The thread is executing foreign code and cannot poll; its last recorded stack
    /// pointer anchors stack walking instead.
    uncooperative: AtomicBool,
    /// Last known stack pointer, recorded on every suspension.
    last_sp: AtomicUsize,
    /// OS-level handle used to deliver rendezvous signals, captured when the thread
    /// enters the running list.
    os_thread: AtomicUsize,
    /// Signal handshake: the yield handler has run and parked the thread.
    suspend_acked: AtomicBool,
    /// Signal handshake: the initiator has allowed the thread to resume.
    resume_pending: AtomicBool,
    /// Per-VM data, indexed by `VmId`. Same length as the VM slot array; resized under
    /// the registry lock.
    per_vm: Mutex<Vec<Option<Box<dyn VMThreadData>>>>,
}

impl MutatorThread {
    pub(crate) fn new(tls: VMMutatorThread) -> Self {
        MutatorThread {
            tls,
            yield_requested: AtomicBool::new(false),
            in_rendezvous: AtomicBool::new(false),
            joined_rv: AtomicBool::new(false),
            uncooperative: AtomicBool::new(false),
            last_sp: AtomicUsize::new(0),
            os_thread: AtomicUsize::new(0),
            suspend_acked: AtomicBool::new(false),
            resume_pending: AtomicBool::new(false),
            per_vm: Mutex::new(vec![]),
        }
    }

    pub fn tls(&self) -> VMMutatorThread {
        self.tls
    }

    pub fn yield_requested(&self) -> bool {
        self.yield_requested.load(Ordering::SeqCst)
    }

    pub(crate) fn set_yield_requested(&self, requested: bool) {
        self.yield_requested.store(requested, Ordering::SeqCst);
    }

    pub(crate) fn in_rendezvous(&self) -> bool {
        self.in_rendezvous.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_rendezvous(&self, in_rendezvous: bool) {
        self.in_rendezvous.store(in_rendezvous, Ordering::SeqCst);
    }

    pub(crate) fn joined_rv(&self) -> bool {
        self.joined_rv.load(Ordering::SeqCst)
    }

    pub(crate) fn set_joined_rv(&self, joined: bool) {
        self.joined_rv.store(joined, Ordering::SeqCst);
    }

    pub fn is_uncooperative(&self) -> bool {
        self.uncooperative.load(Ordering::SeqCst)
    }

    pub(crate) fn set_uncooperative(&self, uncooperative: bool) {
        self.uncooperative.store(uncooperative, Ordering::SeqCst);
    }

    /// The last stack pointer recorded for this thread, or zero if it has never been
    /// suspended.
    pub fn last_sp(&self) -> Address {
        unsafe { Address::from_usize(self.last_sp.load(Ordering::SeqCst)) }
    }

    pub(crate) fn record_last_sp(&self, sp: Address) {
        self.last_sp.store(sp.as_usize(), Ordering::SeqCst);
    }

    pub(crate) fn capture_os_thread(&self) {
        let handle = unsafe { libc::pthread_self() };
        self.os_thread.store(handle as usize, Ordering::SeqCst);
    }

    pub(crate) fn os_thread(&self) -> libc::pthread_t {
        self.os_thread.load(Ordering::SeqCst) as libc::pthread_t
    }

    pub(crate) fn suspend_acked(&self) -> bool {
        self.suspend_acked.load(Ordering::SeqCst)
    }

    pub(crate) fn set_suspend_acked(&self, acked: bool) {
        self.suspend_acked.store(acked, Ordering::SeqCst);
    }

    pub(crate) fn set_resume_pending(&self) {
        self.resume_pending.store(true, Ordering::SeqCst);
    }

    pub(crate) fn take_resume_pending(&self) -> bool {
        self.resume_pending.swap(false, Ordering::SeqCst)
    }

    /// Length of the per-VM data array. Equals the VM slot array length at all times.
    pub fn per_vm_len(&self) -> usize {
        self.per_vm.lock().unwrap().len()
    }

    pub(crate) fn grow_per_vm(&self, new_len: usize) {
        let mut per_vm = self.per_vm.lock().unwrap();
        debug_assert!(per_vm.len() <= new_len);
        per_vm.resize_with(new_len, || None);
    }

    pub(crate) fn vm_data_is_none(&self, id: VmId) -> bool {
        let per_vm = self.per_vm.lock().unwrap();
        per_vm.get(id.0).map_or(true, |data| data.is_none())
    }

    pub(crate) fn ensure_vm_data(&self, id: VmId, build: impl FnOnce() -> Box<dyn VMThreadData>) {
        let mut per_vm = self.per_vm.lock().unwrap();
        debug_assert!(id.0 < per_vm.len());
        if per_vm[id.0].is_none() {
            per_vm[id.0] = Some(build());
        }
    }

    /// Run `f` on this thread's data for the given VM, if any has been built.
    pub fn with_vm_data<R>(&self, id: VmId, f: impl FnOnce(&mut dyn VMThreadData) -> R) -> Option<R> {
        let mut per_vm = self.per_vm.lock().unwrap();
        match per_vm.get_mut(id.0) {
            Some(Some(data)) => Some(f(data.as_mut())),
            _ => None,
        }
    }

    pub(crate) fn clear_vm_data(&self, id: VmId) {
        let mut per_vm = self.per_vm.lock().unwrap();
        if let Some(slot) = per_vm.get_mut(id.0) {
            *slot = None;
        }
    }

    pub(crate) fn clear_all_vm_data(&self) {
        let mut per_vm = self.per_vm.lock().unwrap();
        for slot in per_vm.iter_mut() {
            *slot = None;
        }
    }

    pub(crate) fn trace_vm_data(&self, id: VmId, closure: &mut dyn crate::vm::collector::SlotVisitor) {
        let per_vm = self.per_vm.lock().unwrap();
        if let Some(Some(data)) = per_vm.get(id.0) {
            data.tracer(closure);
        }
    }
}

thread_local! {
    /// The descriptor of the mutator running on this OS thread, for the signal handler.
    /// Only set while the thread is in the running list, which also keeps the Arc alive.
    static CURRENT_MUTATOR: Cell<*const MutatorThread> = const { Cell::new(std::ptr::null()) };
}

pub(crate) fn set_current_mutator(mutator: Option<&Arc<MutatorThread>>) {
    let ptr = mutator.map_or(std::ptr::null(), |m| Arc::as_ptr(m));
    CURRENT_MUTATOR.with(|current| current.set(ptr));
}

pub(crate) fn current_mutator_ptr() -> *const MutatorThread {
    CURRENT_MUTATOR.with(|current| current.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::{OpaquePointer, VMThread};

    #[test]
    fn per_vm_array_growth() {
        let mutator = MutatorThread::new(VMMutatorThread(VMThread(OpaquePointer::UNINITIALIZED)));
        assert_eq!(mutator.per_vm_len(), 0);
        mutator.grow_per_vm(1);
        mutator.grow_per_vm(2);
        assert_eq!(mutator.per_vm_len(), 2);
        assert!(mutator.vm_data_is_none(VmId(0)));
        assert!(mutator.vm_data_is_none(VmId(1)));
    }
}
