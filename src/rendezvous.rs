//! Stop-the-world rendezvous for garbage collection.
//!
//! The rendezvous brings every running mutator to a safe state before the collector scans the
//! heap, and releases them afterwards. Two protocols are supported, chosen when the instance is
//! built:
//!
//! -   **Cooperative**: `synchronize` raises the yield flag on every running mutator; mutators
//!     poll the flag at safe points and block until the end of the rendezvous.
//! -   **Uncooperative**: `synchronize` additionally interrupts each mutator with a process
//!     signal. The handler records the thread's stack pointer, acknowledges the suspension and
//!     parks in `sigsuspend` until the resume signal. The handler performs only
//!     async-signal-safe work; all join accounting for signalled threads is done by the
//!     initiator.
//!
//! Mutators that are about to block in foreign code (native calls, blocking I/O) bracket the
//! region with [`CollectionRendezvous::join_before_uncooperative`] and
//! [`CollectionRendezvous::join_after_uncooperative`]; while inside such a region they count as
//! already joined, and their last recorded stack pointer anchors stack walking.
//!
//! The initiator keeps the rendezvous mutex from `start` to `finish` (it is released while
//! waiting on the initiator condition). A second would-be initiator therefore blocks in `start`
//! until the winner either waits or finishes, observes the rendezvous in progress, and cancels.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use crate::thread::MutatorThread;
use crate::util::Address;

/// The rendezvous protocol, picked at instance construction.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RendezvousKind {
    Cooperative,
    Uncooperative,
}

pub struct CollectionRendezvous {
    kind: RendezvousKind,
    /// Lock for synchronization; held by the initiator for the whole rendezvous.
    sync: Mutex<RendezvousSync>,
    /// Condition for unblocking the initiator once every expected mutator checked in.
    cond_initiator: Condvar,
    /// Condition for releasing the joined mutators at the end of the rendezvous.
    cond_end_rv: Condvar,
}

struct RendezvousSync {
    /// True between a successful `synchronize` arming and `finish`.
    in_progress: bool,
    /// Bumped on every `finish`; joined mutators wait for the epoch to move on so a
    /// spurious wake-up or an immediately following rendezvous cannot confuse them.
    epoch: u64,
    /// Number of mutators that must check in.
    expected: usize,
    /// Number of mutators that have checked in.
    joined: usize,
    /// `expected` of the most recently armed rendezvous; kept after `finish`.
    last_expected: usize,
}

/// RAII handle returned by [`CollectionRendezvous::start`]. Owns the rendezvous mutex guard
/// between the driver steps.
pub struct ActiveRendezvous<'rv> {
    guard: Option<MutexGuard<'rv, RendezvousSync>>,
}

impl ActiveRendezvous<'_> {
    /// True if another initiator already armed a rendezvous; the caller must cancel and join.
    pub fn collection_in_progress(&self) -> bool {
        self.guard.as_ref().unwrap().in_progress
    }
}

impl CollectionRendezvous {
    pub fn new(kind: RendezvousKind) -> Self {
        CollectionRendezvous {
            kind,
            sync: Mutex::new(RendezvousSync {
                in_progress: false,
                epoch: 0,
                expected: 0,
                joined: 0,
                last_expected: 0,
            }),
            cond_initiator: Condvar::new(),
            cond_end_rv: Condvar::new(),
        }
    }

    pub fn kind(&self) -> RendezvousKind {
        self.kind
    }

    /// For the uncooperative protocol, install the process-wide signal handlers.
    pub fn prepare_for_join(&self) {
        if self.kind == RendezvousKind::Uncooperative {
            signal::install_handlers();
        }
    }

    /// Begin a rendezvous attempt. Marks the initiator and takes the rendezvous lock; the
    /// caller must then check for an already active rendezvous (its own yield flag, or
    /// [`ActiveRendezvous::collection_in_progress`]) and either proceed to `synchronize` or
    /// `cancel`.
    pub fn start(&self, initiator: &MutatorThread) -> ActiveRendezvous<'_> {
        initiator.set_in_rendezvous(true);
        let guard = self.sync.lock().unwrap();
        ActiveRendezvous { guard: Some(guard) }
    }

    /// Abandon a started rendezvous because another initiator won the race. The caller
    /// joins the winner via [`CollectionRendezvous::join`] afterwards.
    pub fn cancel(&self, mut active: ActiveRendezvous, initiator: &MutatorThread) {
        drop(active.guard.take());
        initiator.set_in_rendezvous(false);
    }

    /// Bring every mutator in `running` (except the initiator) to a safe state. On return,
    /// no mutator counted here executes user code until `finish`.
    ///
    /// A thread that lost the initiation race is counted like any other: it is blocked on
    /// the rendezvous lock, acquires it while this initiator waits, observes its own yield
    /// flag, and checks in through the cancellation path. Threads inside uncooperative
    /// regions are already quiescent and count as joined immediately.
    pub fn synchronize(
        &self,
        active: &mut ActiveRendezvous,
        running: &[Arc<MutatorThread>],
        initiator: &MutatorThread,
    ) {
        let mut sync = active.guard.take().unwrap();
        debug_assert!(!sync.in_progress);
        sync.in_progress = true;
        sync.expected = 0;
        sync.joined = 0;

        for mutator in running {
            if std::ptr::eq(mutator.as_ref(), initiator) {
                continue;
            }
            mutator.set_yield_requested(true);
            sync.expected += 1;
            if mutator.is_uncooperative() {
                mutator.set_joined_rv(true);
                sync.joined += 1;
            } else if self.kind == RendezvousKind::Uncooperative {
                signal::deliver_yield(mutator);
            }
        }
        sync.last_expected = sync.expected;
        debug!(
            "Rendezvous armed: {}/{} mutators already quiescent",
            sync.joined, sync.expected
        );

        match self.kind {
            RendezvousKind::Cooperative => {
                sync = self.wait_rv(sync);
            }
            RendezvousKind::Uncooperative => {
                // The signal handlers cannot touch the rendezvous lock, so acknowledgements
                // are counted here rather than by another_mark.
                let joined_in_regions = sync.joined;
                loop {
                    let acked = running.iter().filter(|m| m.suspend_acked()).count();
                    sync.joined = joined_in_regions + acked;
                    if sync.joined >= sync.expected {
                        break;
                    }
                    std::thread::sleep(Duration::from_micros(50));
                }
            }
        }
        debug_assert_eq!(sync.joined, sync.expected);
        active.guard = Some(sync);
    }

    /// End the rendezvous: clear the yield state of every flagged mutator, resume suspended
    /// threads, and release the rendezvous lock.
    pub fn finish(
        &self,
        mut active: ActiveRendezvous,
        initiator: &MutatorThread,
        running: &[Arc<MutatorThread>],
    ) {
        let mut sync = active.guard.take().unwrap();
        debug_assert!(sync.in_progress);
        for mutator in running {
            if !mutator.yield_requested() {
                continue;
            }
            mutator.set_yield_requested(false);
            mutator.set_joined_rv(false);
            if self.kind == RendezvousKind::Uncooperative && mutator.suspend_acked() {
                signal::deliver_resume(mutator);
            }
        }
        sync.in_progress = false;
        sync.expected = 0;
        sync.joined = 0;
        sync.epoch = sync.epoch.wrapping_add(1);
        self.cond_end_rv.notify_all();
        drop(sync);
        initiator.set_in_rendezvous(false);
    }

    /// A mutator has reached a safe point and observed its yield flag (or cancelled its own
    /// rendezvous attempt): check in and block until the end of the rendezvous.
    pub fn join(&self, mutator: &MutatorThread) {
        debug_assert!(!mutator.in_rendezvous());
        let anchor = 0u8;
        mutator.record_last_sp(Address::from_ptr(&anchor));

        let mut sync = self.sync.lock().unwrap();
        if !sync.in_progress {
            return;
        }
        if mutator.yield_requested() && !mutator.joined_rv() {
            mutator.set_joined_rv(true);
            self.another_mark(&mut sync);
        }
        let epoch = sync.epoch;
        let _sync = self.wait_end_rv(sync, epoch);
    }

    /// The mutator is about to enter foreign code (a native call, blocking I/O). Record the
    /// quiescent state; if a rendezvous is waiting for this thread, check in on its behalf
    /// without blocking. The foreign region is scanned through the recorded stack pointer.
    pub fn join_before_uncooperative(&self, mutator: &MutatorThread) {
        let anchor = 0u8;
        let sp = Address::from_ptr(&anchor);
        let mut sync = self.sync.lock().unwrap();
        mutator.record_last_sp(sp);
        mutator.set_uncooperative(true);
        if sync.in_progress && mutator.yield_requested() && !mutator.joined_rv() {
            mutator.set_joined_rv(true);
            self.another_mark(&mut sync);
        }
    }

    /// The mutator has returned from foreign code. Re-enter cooperative mode, using `sp` as
    /// the stack-walking anchor; if a rendezvous is in progress the thread blocks here until
    /// it ends.
    pub fn join_after_uncooperative(&self, mutator: &MutatorThread, sp: Address) {
        let mut sync = self.sync.lock().unwrap();
        mutator.record_last_sp(sp);
        if sync.in_progress && mutator.yield_requested() {
            let epoch = sync.epoch;
            sync = self.wait_end_rv(sync, epoch);
        }
        mutator.set_uncooperative(false);
        drop(sync);
    }

    /// One more mutator is at a safe state. Wakes the initiator once everyone checked in.
    fn another_mark(&self, sync: &mut RendezvousSync) {
        sync.joined += 1;
        if sync.joined >= sync.expected {
            self.cond_initiator.notify_one();
        }
    }

    /// Initiator side: wait until every expected mutator has checked in.
    fn wait_rv<'a>(
        &self,
        mut sync: MutexGuard<'a, RendezvousSync>,
    ) -> MutexGuard<'a, RendezvousSync> {
        while sync.joined < sync.expected {
            sync = self.cond_initiator.wait(sync).unwrap();
        }
        sync
    }

    /// Mutator side: wait until the rendezvous of the given epoch has finished.
    fn wait_end_rv<'a>(
        &self,
        mut sync: MutexGuard<'a, RendezvousSync>,
        epoch: u64,
    ) -> MutexGuard<'a, RendezvousSync> {
        while sync.in_progress && sync.epoch == epoch {
            sync = self.cond_end_rv.wait(sync).unwrap();
        }
        sync
    }

    #[cfg(test)]
    pub(crate) fn last_expected(&self) -> usize {
        self.sync.lock().unwrap().last_expected
    }
}

/// Signal plumbing for the uncooperative protocol. Process-wide: one signal-driven
/// rendezvous per process.
mod signal {
    use super::*;
    use crate::thread;

    const YIELD_SIGNAL: libc::c_int = libc::SIGUSR1;
    const RESUME_SIGNAL: libc::c_int = libc::SIGUSR2;

    lazy_static! {
        static ref SIGNAL_HANDLERS: () = unsafe { install_handlers_raw() };
    }

    pub(super) fn install_handlers() {
        lazy_static::initialize(&SIGNAL_HANDLERS);
    }

    unsafe fn install_handlers_raw() {
        let yield_fn: extern "C" fn(libc::c_int) = yield_handler;
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = yield_fn as usize;
        libc::sigfillset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        libc::sigaction(YIELD_SIGNAL, &action, std::ptr::null_mut());

        let resume_fn: extern "C" fn(libc::c_int) = resume_handler;
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = resume_fn as usize;
        libc::sigemptyset(&mut action.sa_mask);
        action.sa_flags = libc::SA_RESTART;
        libc::sigaction(RESUME_SIGNAL, &action, std::ptr::null_mut());
    }

    pub(super) fn deliver_yield(mutator: &MutatorThread) {
        unsafe {
            libc::pthread_kill(mutator.os_thread(), YIELD_SIGNAL);
        }
    }

    pub(super) fn deliver_resume(mutator: &MutatorThread) {
        mutator.set_resume_pending();
        unsafe {
            libc::pthread_kill(mutator.os_thread(), RESUME_SIGNAL);
        }
    }

    /// Runs on the interrupted mutator. Only async-signal-safe operations: record the stack
    /// pointer, publish the acknowledgement, park in sigsuspend until resumed.
    extern "C" fn yield_handler(_signal: libc::c_int) {
        let mutator = thread::current_mutator_ptr();
        if mutator.is_null() {
            return;
        }
        let mutator = unsafe { &*mutator };
        let anchor = 0u8;
        mutator.record_last_sp(Address::from_ptr(&anchor));
        mutator.set_suspend_acked(true);
        unsafe {
            let mut mask = std::mem::MaybeUninit::<libc::sigset_t>::uninit();
            libc::sigfillset(mask.as_mut_ptr());
            libc::sigdelset(mask.as_mut_ptr(), RESUME_SIGNAL);
            let mask = mask.assume_init();
            while !mutator.take_resume_pending() {
                libc::sigsuspend(&mask);
            }
        }
        mutator.set_suspend_acked(false);
    }

    extern "C" fn resume_handler(_signal: libc::c_int) {
        // Nothing to do; its delivery wakes the sigsuspend in yield_handler.
    }
}
