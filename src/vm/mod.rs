//! The interface between the core and the hosted virtual machines.
//!
//! Every VM sharing the process implements [`VirtualMachine`] and registers an instance with
//! [`crate::MRTK::add_vm`], receiving a dense [`VmId`]. The trait is the VM-side capability
//! set the core invokes during collections; every hook has a default so a VM only implements
//! what it supports.

pub mod collector;
#[cfg(test)]
pub(crate) mod tests;

use std::fmt;
use std::sync::Arc;

use downcast_rs::{impl_downcast, Downcast};

use crate::incinerator::{ClassLoader, Incinerator};
use crate::monitor::ObjectMonitor;
use crate::thread::MutatorThread;
use crate::util::ObjectReference;
use crate::vm::collector::SlotVisitor;

/// Dense id of a registered VM, assigned by [`crate::MRTK::add_vm`] and stable for the VM's
/// lifetime. Used to index per-mutator data arrays.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VmId(pub usize);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-thread data owned by one VM, stored in the mutator's per-VM array. Built lazily for
/// threads attached from foreign code via [`VirtualMachine::build_vm_thread_data`].
pub trait VMThreadData: Downcast + Send {
    /// Trace the GC objects held in this thread-local data.
    fn tracer(&self, _closure: &mut dyn SlotVisitor) {}
}
impl_downcast!(VMThreadData);

/// This trait is the root of hosted virtual machines. It defines what a VM should provide to
/// the core.
pub trait VirtualMachine: Send + Sync {
    // ---------------------------------------------------------------- //
    // (1) thread-related methods
    // ---------------------------------------------------------------- //

    /// Allocate the VM-side thread data for the given mutator. Called lazily when a thread
    /// (possibly attached from foreign code) first interacts with this VM.
    fn build_vm_thread_data(&self, mutator: &MutatorThread) -> Box<dyn VMThreadData>;

    // ---------------------------------------------------------------- //
    // (2) GC-related methods
    // ---------------------------------------------------------------- //

    /// Invoke the finalizer of an object.
    fn finalize_object(&self, _object: ObjectReference) {}

    /// Preliminary code before starting a collection.
    fn start_collection(&self) {}

    /// Code after running a collection.
    fn end_collection(&self) {}

    /// Scan all weak references. Called before scanning the finalization queue.
    fn scan_weak_references_queue(&self, _closure: &mut dyn SlotVisitor) {}

    /// Scan all soft references. Called before scanning the finalization queue.
    fn scan_soft_references_queue(&self, _closure: &mut dyn SlotVisitor) {}

    /// Scan all phantom references. Called after the finalization queue.
    fn scan_phantom_references_queue(&self, _closure: &mut dyn SlotVisitor) {}

    /// Report every root of this VM (globals, VM-internal tables) to the closure. Roots
    /// held in per-thread data are reported through [`VMThreadData::tracer`] instead.
    fn tracer(&self, _closure: &mut dyn SlotVisitor) {}

    /// Get the size of this object. Used by copying collectors.
    fn get_object_size(&self, object: ObjectReference) -> usize;

    /// Get the type of this object. Used for debugging purposes.
    fn get_object_type_name(&self, _object: ObjectReference) -> String {
        "An object".to_string()
    }

    // ---------------------------------------------------------------- //
    // (3) bundle/class-loader boundary
    // ---------------------------------------------------------------- //

    /// The class loader of the object's defining class, if the object belongs to this VM's
    /// heap. Drives stale classification.
    fn class_loader_of(&self, _object: ObjectReference) -> Option<Arc<ClassLoader>> {
        None
    }

    /// Some hosted objects are not real application objects, but bridges between the hosted
    /// object model and the core (class-loader proxies, static-instance proxies). They are
    /// excluded from stale classification.
    fn is_vm_internal_object(&self, _object: ObjectReference) -> bool {
        false
    }

    /// This VM's incinerator, if it supports stale-reference correction.
    fn incinerator(&self) -> Option<&Incinerator> {
        None
    }

    /// This VM's object-monitor service, if it has one.
    fn object_monitor(&self) -> Option<&dyn ObjectMonitor> {
        None
    }
}
