//! Incinerator operations that drive whole collections: forced scanning, referencer dumps,
//! and the correction toggle.

use std::sync::Arc;
use std::time::Duration;

use super::mock::{MockClass, MockCollector, MockHeap, MockVm};
use crate::incinerator::{BundleId, ClassLoader, ScanMode};
use crate::thread::MutatorThread;
use crate::util::options::RendezvousSelector;
use crate::util::test_util::{panic_after, serial_test};
use crate::util::{OpaquePointer, VMMutatorThread, VMThread};
use crate::vm::collector::load_slot;
use crate::{CollectionResult, MRTKBuilder, MRTK};

fn build_mrtk(heap: &Arc<MockHeap>) -> Arc<MRTK> {
    let mut builder = MRTKBuilder::new_no_env_vars();
    builder.options.rendezvous = RendezvousSelector::Cooperative;
    builder.options.finalizer_thread = false;
    Arc::new(builder.build(MockCollector::new(heap.clone())))
}

fn register_running(mrtk: &MRTK) -> Arc<MutatorThread> {
    let mutator =
        mrtk.register_prepared_thread(VMMutatorThread(VMThread(OpaquePointer::UNINITIALIZED)));
    mrtk.register_running_thread(&mutator);
    mutator
}

#[test]
fn disabled_correction_leaves_stale_references_in_place() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap);
            mrtk.initialize_collection();
            let vm = MockVm::new(heap.clone());
            mrtk.add_vm(vm.clone());

            let loader = ClassLoader::new("bundle-y");
            let class = MockClass::new("YClass", &loader);
            let obj = heap.alloc(&class, 1);
            let g = vm.add_global(Some(obj));

            vm.incinerator
                .set_bundle_class_loader(BundleId(9), Some(loader.clone()));
            vm.incinerator
                .set_bundle_stale_reference_corrected(BundleId(9), false)
                .unwrap();
            vm.incinerator.set_bundle_class_loader(BundleId(9), None);

            let initiator = register_running(&mrtk);
            assert_eq!(mrtk.collect(&initiator), CollectionResult::Collected);
            // Stale, but correction is off: the reference stays.
            assert_eq!(load_slot(g), Some(obj));

            // Re-enabling correction and forcing a scan reclaims it.
            loader.set_stale_references_correction_enabled(true);
            assert_eq!(
                vm.incinerator.force_stale_reference_scanning(&mrtk, &initiator),
                CollectionResult::Collected
            );
            assert_eq!(load_slot(g), None);
            assert_eq!(vm.incinerator.scanning_mode(), ScanMode::Disabled);

            mrtk.unregister_running_thread(&initiator);
            mrtk.unregister_prepared_thread(&initiator);
        })
    });
}

#[test]
fn dump_references_to_object_reports_every_referencer() {
    serial_test(|| {
        panic_after(Duration::from_secs(60), || {
            let heap = MockHeap::new();
            let mrtk = build_mrtk(&heap);
            mrtk.initialize_collection();
            let vm = MockVm::new(heap.clone());
            mrtk.add_vm(vm.clone());

            let class = MockClass::new("CoreClass", &ClassLoader::new("core"));
            let target = heap.alloc(&class, 1);
            let holder = heap.alloc(&class, 1);
            heap.store_field(holder, 0, Some(target));
            let g_target = vm.add_global(Some(target));
            let g_holder = vm.add_global(Some(holder));

            let initiator = register_running(&mrtk);
            let referencers =
                vm.incinerator
                    .dump_references_to_object(&mrtk, &initiator, target);

            let slots: Vec<_> = referencers.iter().map(|r| r.slot).collect();
            assert!(slots.contains(&g_target));
            assert!(slots.contains(&heap.field_slot(holder, 0)));
            assert!(!slots.contains(&g_holder));
            for referencer in &referencers {
                if referencer.slot == heap.field_slot(holder, 0) {
                    assert_eq!(referencer.source, Some(holder));
                } else {
                    assert_eq!(referencer.source, None);
                }
            }

            // The dump target is cleared once the collection is over.
            assert_eq!(mrtk.state().gc_count(), 1);
            mrtk.unregister_running_thread(&initiator);
            mrtk.unregister_prepared_thread(&initiator);
        })
    });
}
