//! End-to-end collection scenarios: rendezvous behaviour, stale-reference elimination,
//! finalization interplay and monitor teardown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use super::mock::{MockClass, MockCollector, MockHeap, MockThreadData, MockVm};
use crate::incinerator::{BundleId, ClassLoader, ScanMode};
use crate::monitor::ObjectMonitor;
use crate::thread::MutatorThread;
use crate::util::options::RendezvousSelector;
use crate::util::test_util::{panic_after, serial_test};
use crate::util::{Address, ObjectReference, OpaquePointer, VMMutatorThread, VMThread};
use crate::vm::collector::{load_slot, SlotVisitor};
use crate::vm::{VMThreadData, VirtualMachine, VmId};
use crate::{CollectionResult, MRTKBuilder, MRTK};

fn tls() -> VMMutatorThread {
    VMMutatorThread(VMThread(OpaquePointer::UNINITIALIZED))
}

fn build_mrtk(heap: &Arc<MockHeap>, rendezvous: RendezvousSelector) -> Arc<MRTK> {
    let mut builder = MRTKBuilder::new_no_env_vars();
    builder.options.rendezvous = rendezvous;
    builder.options.finalizer_thread = false;
    Arc::new(builder.build(MockCollector::new(heap.clone())))
}

fn register_running(mrtk: &MRTK) -> Arc<MutatorThread> {
    let mutator = mrtk.register_prepared_thread(tls());
    mrtk.register_running_thread(&mutator);
    mutator
}

fn unregister(mrtk: &MRTK, mutator: &Arc<MutatorThread>) {
    mrtk.unregister_running_thread(mutator);
    mrtk.unregister_prepared_thread(mutator);
}

/// A VM populated with one bundle class ("XClass", bundle 7) and one core class.
struct BundleFixture {
    vm: Arc<MockVm>,
    vm_id: VmId,
    loader_x: Arc<ClassLoader>,
    class_x: Arc<MockClass>,
    class_core: Arc<MockClass>,
}

const BUNDLE_X: BundleId = BundleId(7);

impl BundleFixture {
    fn install(mrtk: &MRTK, heap: &Arc<MockHeap>) -> Self {
        let vm = MockVm::new(heap.clone());
        let vm_id = mrtk.add_vm(vm.clone());
        let loader_x = ClassLoader::new("bundle-x");
        let class_x = MockClass::new("XClass", &loader_x);
        let class_core = MockClass::new("CoreClass", &ClassLoader::new("core"));
        vm.incinerator
            .set_bundle_class_loader(BUNDLE_X, Some(loader_x.clone()));
        BundleFixture {
            vm,
            vm_id,
            loader_x,
            class_x,
            class_core,
        }
    }

    fn uninstall_bundle(&self) {
        self.vm.incinerator.set_bundle_class_loader(BUNDLE_X, None);
    }
}

#[test]
fn collection_with_no_vms_suspends_and_resumes_mutators() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();

            let stop = Arc::new(AtomicBool::new(false));
            std::thread::scope(|scope| {
                for _ in 0..2 {
                    let mrtk = mrtk.clone();
                    let stop = stop.clone();
                    scope.spawn(move || {
                        let mutator = register_running(&mrtk);
                        while !stop.load(Ordering::SeqCst) {
                            mrtk.safe_point(&mutator);
                            std::hint::spin_loop();
                        }
                        unregister(&mrtk, &mutator);
                    });
                }
                while mrtk.running_thread_count() < 2 {
                    std::thread::yield_now();
                }

                let initiator = register_running(&mrtk);
                assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);
                assert_eq!(mrtk.last_rendezvous_expected(), 2);
                assert_eq!(mrtk.state().gc_count(), 1);
                stop.store(true, Ordering::SeqCst);
                unregister(&mrtk, &initiator);
            });
        })
    });
}

#[test]
fn concurrent_collections_run_exactly_once() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();

            let barrier = Arc::new(Barrier::new(2));
            let results = Arc::new(Mutex::new(vec![]));
            std::thread::scope(|scope| {
                for _ in 0..2 {
                    let mrtk = mrtk.clone();
                    let barrier = barrier.clone();
                    let results = results.clone();
                    scope.spawn(move || {
                        let mutator = register_running(&mrtk);
                        barrier.wait();
                        let result = mrtk.collect(&mutator);
                        results.lock().unwrap().push(result);
                        unregister(&mrtk, &mutator);
                    });
                }
            });

            let mut results = results.lock().unwrap().clone();
            results.sort_by_key(|r| *r == CollectionResult::Skipped);
            assert_eq!(
                results,
                vec![CollectionResult::Collected, CollectionResult::Skipped]
            );
            assert_eq!(mrtk.state().gc_count(), 1);
            assert_eq!(mrtk.state().skipped_collections(), 1);
        })
    });
}

#[test]
fn bundle_uninstall_eliminates_stale_refs() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();
            let fixture = BundleFixture::install(&mrtk, &heap);

            let obj1 = heap.alloc(&fixture.class_x, 1);
            let obj2 = heap.alloc(&fixture.class_core, 1);
            let g1 = fixture.vm.add_global(Some(obj1));
            let g2 = fixture.vm.add_global(Some(obj2));

            fixture.uninstall_bundle();
            assert!(fixture.loader_x.is_stale());
            assert_eq!(fixture.vm.incinerator.scanning_mode(), ScanMode::Inclusive);

            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

            assert_eq!(load_slot(g1), None);
            assert_eq!(load_slot(g2), Some(obj2));
            // The correction setting survives for future loaders of the bundle.
            assert!(fixture.loader_x.is_stale_references_correction_enabled());
            assert_eq!(fixture.vm.incinerator.pending_stale_refs(), 0);
            assert_eq!(fixture.vm.incinerator.scanning_mode(), ScanMode::Disabled);
            unregister(&mrtk, &initiator);
        })
    });
}

#[test]
fn finalizable_object_keeps_stale_reference_for_one_cycle() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();
            let fixture = BundleFixture::install(&mrtk, &heap);

            let obj1 = heap.alloc(&fixture.class_x, 1);
            let g1 = fixture.vm.add_global(Some(obj1));
            // A dead finalizable object still referencing obj1.
            let finalizable = heap.alloc(&fixture.class_core, 1);
            heap.store_field(finalizable, 0, Some(obj1));
            mrtk.add_finalization_candidate(fixture.vm_id, finalizable);

            fixture.uninstall_bundle();
            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

            // The reference survives this cycle and another collection is requested.
            assert_eq!(load_slot(g1), Some(obj1));
            assert!(fixture.vm.incinerator.needs_rescan());
            assert_eq!(fixture.vm.incinerator.pending_stale_refs(), 0);

            // The finalizer runs between the cycles.
            let (owner, ready) = mrtk.get_ready_finalizable().unwrap();
            assert_eq!((owner, ready), (fixture.vm_id, finalizable));
            fixture.vm.finalize_object(finalizable);

            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);
            assert_eq!(load_slot(g1), None);
            assert!(!fixture.vm.incinerator.needs_rescan());
            heap.free(finalizable);
            unregister(&mrtk, &initiator);
        })
    });
}

#[test]
fn monitor_is_released_when_its_object_is_eliminated() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();
            let fixture = BundleFixture::install(&mrtk, &heap);

            let obj = heap.alloc(&fixture.class_x, 1);
            let g = fixture.vm.add_global(Some(obj));
            let owner = VMMutatorThread(VMThread(OpaquePointer::from_address(unsafe {
                Address::from_usize(0x1000)
            })));
            fixture.vm.monitors.lock_recursive(obj, owner, 3);
            fixture.vm.monitors.add_waiter(obj, owner);

            fixture.uninstall_bundle();
            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

            assert_eq!(load_slot(g), None);
            assert!(fixture.vm.monitors.is_dead(obj));
            assert_eq!(fixture.vm.monitors.owner_of(obj), None);
            assert!(fixture.vm.monitors.runnable().contains(&owner));
            unregister(&mrtk, &initiator);
        })
    });
}

#[test]
fn vm_internal_objects_are_not_classified_stale() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();
            let fixture = BundleFixture::install(&mrtk, &heap);

            let proxy = heap.alloc(&fixture.class_x, 1);
            heap.set_vm_internal(proxy);
            let g = fixture.vm.add_global(Some(proxy));

            fixture.uninstall_bundle();
            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

            assert_eq!(load_slot(g), Some(proxy));
            unregister(&mrtk, &initiator);
        })
    });
}

#[test]
fn finalizer_thread_runs_finalizers_after_collection() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mut builder = MRTKBuilder::new_no_env_vars();
            builder.options.rendezvous = RendezvousSelector::Cooperative;
            builder.options.finalizer_thread = true;
            let mrtk = Arc::new(builder.build(MockCollector::new(heap.clone())));
            let mut finalizer = mrtk.initialize_collection().unwrap();

            let fixture = BundleFixture::install(&mrtk, &heap);
            let dead = heap.alloc(&fixture.class_core, 1);
            mrtk.add_finalization_candidate(fixture.vm_id, dead);

            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

            while !fixture.vm.finalized().contains(&dead) {
                std::thread::sleep(Duration::from_millis(1));
            }
            finalizer.stop(&mrtk);
            unregister(&mrtk, &initiator);
        })
    });
}

#[test]
fn native_regions_count_as_quiescent() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Cooperative);
            mrtk.initialize_collection();

            let release = Arc::new(AtomicBool::new(false));
            std::thread::scope(|scope| {
                let thread_mrtk = mrtk.clone();
                let thread_release = release.clone();
                scope.spawn(move || {
                    let mutator = register_running(&thread_mrtk);
                    // Simulate a blocking native call: no safe-point polls inside.
                    thread_mrtk.enter_uncooperative_code(&mutator);
                    while !thread_release.load(Ordering::SeqCst) {
                        std::hint::spin_loop();
                    }
                    let anchor = 0u8;
                    thread_mrtk.leave_uncooperative_code(&mutator, Address::from_ptr(&anchor));
                    unregister(&thread_mrtk, &mutator);
                });

                while mrtk.running_thread_count() < 1 {
                    std::thread::yield_now();
                }
                let initiator = register_running(&mrtk);

                // The collection completes while the other thread sits in its native
                // region, never polling.
                assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);
                assert_eq!(mrtk.last_rendezvous_expected(), 1);

                release.store(true, Ordering::SeqCst);
                unregister(&mrtk, &initiator);
            });
        })
    });
}

/// A VM that snapshots the mutator counters at trace time and at end_collection, to verify
/// that no mutator makes progress while the world is stopped.
struct StopWatchVm {
    counters: Arc<Vec<AtomicUsize>>,
    at_trace: Mutex<Option<Vec<usize>>>,
    at_end: Mutex<Option<Vec<usize>>>,
}

impl StopWatchVm {
    fn read(&self) -> Vec<usize> {
        self.counters.iter().map(|c| c.load(Ordering::SeqCst)).collect()
    }
}

impl VirtualMachine for StopWatchVm {
    fn build_vm_thread_data(&self, _mutator: &MutatorThread) -> Box<dyn VMThreadData> {
        Box::new(MockThreadData::default())
    }

    fn tracer(&self, _closure: &mut dyn SlotVisitor) {
        *self.at_trace.lock().unwrap() = Some(self.read());
    }

    fn end_collection(&self) {
        *self.at_end.lock().unwrap() = Some(self.read());
    }

    fn get_object_size(&self, _object: ObjectReference) -> usize {
        0
    }
}

#[test]
fn uncooperative_rendezvous_stops_busy_mutators() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap, RendezvousSelector::Uncooperative);
            mrtk.initialize_collection();

            let counters = Arc::new(vec![AtomicUsize::new(0), AtomicUsize::new(0)]);
            let vm = Arc::new(StopWatchVm {
                counters: counters.clone(),
                at_trace: Mutex::new(None),
                at_end: Mutex::new(None),
            });
            mrtk.add_vm(vm.clone());

            let stop = Arc::new(AtomicBool::new(false));
            let mutators = Arc::new(Mutex::new(Vec::<Arc<MutatorThread>>::new()));
            std::thread::scope(|scope| {
                for i in 0..2 {
                    let mrtk = mrtk.clone();
                    let stop = stop.clone();
                    let counters = counters.clone();
                    let mutators = mutators.clone();
                    scope.spawn(move || {
                        let mutator = register_running(&mrtk);
                        mutators.lock().unwrap().push(mutator.clone());
                        // A busy loop with no safe-point polls; only the signal can stop it.
                        while !stop.load(Ordering::SeqCst) {
                            counters[i].fetch_add(1, Ordering::SeqCst);
                        }
                        unregister(&mrtk, &mutator);
                    });
                }
                while mrtk.running_thread_count() < 2 {
                    std::thread::yield_now();
                }

                let initiator = register_running(&mrtk);
                assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);

                // Between synchronize and finish, the counters did not move.
                let at_trace = vm.at_trace.lock().unwrap().clone().unwrap();
                let at_end = vm.at_end.lock().unwrap().clone().unwrap();
                assert_eq!(at_trace, at_end);

                // Each suspended thread recorded a stack pointer.
                for mutator in mutators.lock().unwrap().iter() {
                    assert!(!mutator.last_sp().is_zero());
                }

                // The mutators resume after the rendezvous finishes.
                let resumed_from = at_end;
                while counters
                    .iter()
                    .zip(resumed_from.iter())
                    .any(|(c, &snap)| c.load(Ordering::SeqCst) <= snap)
                {
                    std::thread::yield_now();
                }
                stop.store(true, Ordering::SeqCst);
                unregister(&mrtk, &initiator);
            });
        })
    });
}
