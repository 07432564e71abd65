use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// Watchdog for tests that exercise blocking paths (rendezvous waits, queue waits): run
/// `f` on its own thread and panic if it has not completed within `timeout`. A panic
/// inside `f` is resumed on the calling thread.
pub fn panic_after<T, F>(timeout: Duration, f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T,
    F: Send + 'static,
{
    let (done_tx, done_rx) = mpsc::channel();
    let subject = thread::Builder::new()
        .name("mrtk-test-subject".to_string())
        .spawn(move || {
            let val = f();
            let _ = done_tx.send(());
            val
        })
        .unwrap();

    match done_rx.recv_timeout(timeout) {
        // Completed, or panicked (which drops the sender): join either way, resuming
        // the subject's panic on this thread if there was one.
        Ok(()) | Err(RecvTimeoutError::Disconnected) => match subject.join() {
            Ok(val) => val,
            Err(panic) => std::panic::resume_unwind(panic),
        },
        Err(RecvTimeoutError::Timeout) => {
            panic!(
                "test did not finish within {:?}; a rendezvous or queue wait is stuck",
                timeout
            );
        }
    }
}

lazy_static! {
    // A global lock to make tests that register OS-level signal handlers or count
    // process-wide threads serial. If we do want more parallelism, we can allow each set
    // of tests to have their own locks. But it seems unnecessary for now.
    static ref SERIAL_TEST_LOCK: Mutex<()> = Mutex::default();
}

// force some tests to be executed serially
pub fn serial_test<F>(f: F)
where
    F: FnOnce(),
{
    // If one test fails, the lock will become poisoned. We want to continue for other tests
    // anyway.
    let lock = SERIAL_TEST_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    f();
    drop(lock);
}
