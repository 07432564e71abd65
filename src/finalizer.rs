//! The finalizer thread.
//!
//! Sleeps on the finalization condition variable; each collection broadcasts it after
//! filling the ready queue. The thread is a registered mutator (finalizers are applicative
//! code), and it brackets its wait with the uncooperative join calls so that a rendezvous
//! never waits on it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::mrtk::MRTK;
use crate::util::{Address, OpaquePointer, VMMutatorThread, VMThread};

pub struct FinalizerThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FinalizerThread {
    pub(crate) fn spawn(mrtk: &Arc<MRTK>) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_mrtk = mrtk.clone();
        let thread_shutdown = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("mrtk-finalizer".to_string())
            .spawn(move || finalizer_loop(thread_mrtk, thread_shutdown))
            .unwrap();
        FinalizerThread {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Stop the finalizer thread and wait for it to exit. Pending ready objects are left in
    /// the queue.
    pub fn stop(&mut self, mrtk: &MRTK) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Take the queue lock so the wake-up cannot slip between the thread's shutdown
        // check and its wait.
        let queue = mrtk.finalization.lock().unwrap();
        mrtk.finalization_cond.notify_all();
        drop(queue);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn finalizer_loop(mrtk: Arc<MRTK>, shutdown: Arc<AtomicBool>) {
    let mutator =
        mrtk.register_prepared_thread(VMMutatorThread(VMThread(OpaquePointer::UNINITIALIZED)));
    mrtk.register_running_thread(&mutator);
    debug!("finalizer thread started");

    loop {
        // Quiescent while waiting for work and while contending for the queue lock, which
        // the collection driver holds for the whole collection. Taking the queue lock
        // while cooperative would deadlock against the driver, which already owns the
        // rendezvous lock when it acquires the queue lock.
        mrtk.rendezvous.join_before_uncooperative(&mutator);
        let ready = {
            let mut queue = mrtk.finalization.lock().unwrap();
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break None;
                }
                if let Some(ready) = queue.get_ready_object() {
                    break Some(ready);
                }
                queue = mrtk.finalization_cond.wait(queue).unwrap();
            }
        };
        let anchor = 0u8;
        mrtk.rendezvous
            .join_after_uncooperative(&mutator, Address::from_ptr(&anchor));

        let Some((vm_id, object)) = ready else { break };
        if let Some(vm) = mrtk.get_vm(vm_id) {
            debug!("finalizing {} (vm {})", object, vm_id);
            vm.finalize_object(object);
        }
        mrtk.safe_point(&mutator);
    }

    mrtk.unregister_running_thread(&mutator);
    mrtk.unregister_prepared_thread(&mutator);
    debug!("finalizer thread exiting");
}
