use std::fmt;

use crate::util::Address;

/// An opaque handle into the hosted VM: a thread-local block, a code-generation unit, or
/// whatever the VM chooses to key its contexts by. The core stores and compares these and
/// hands them back through the VM-side traits; it never dereferences one, so the handle is
/// backed by the same word representation as [`Address`] rather than a raw pointer type.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct OpaquePointer(Address);

impl Default for OpaquePointer {
    fn default() -> Self {
        Self::UNINITIALIZED
    }
}

impl OpaquePointer {
    pub const UNINITIALIZED: Self = Self(Address::ZERO);

    pub fn from_address(addr: Address) -> Self {
        OpaquePointer(addr)
    }

    pub fn to_address(self) -> Address {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_zero()
    }
}

impl fmt::Debug for OpaquePointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OpaquePointer({})", self.0)
    }
}

/// Opaque identity of a thread in the hosted VM. A VM may use thread pointers or thread
/// IDs; the core makes no assumption. Passed in through the registration APIs and handed
/// back through the VM-side traits so the VM knows the context.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VMThread(pub OpaquePointer);

impl VMThread {
    pub const UNINITIALIZED: Self = Self(OpaquePointer::UNINITIALIZED);
}

/// A [`VMThread`] that runs hosted application code and mutates the heap. When it appears
/// as an argument or a field, the surrounding operation executes in (or on behalf of) that
/// thread's context.
#[repr(transparent)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct VMMutatorThread(pub VMThread);
