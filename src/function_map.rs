//! Map of compiled-code start addresses to method descriptors.
//!
//! Used when walking the stack of a suspended mutator so that the core knows which
//! applicative method is executing at a given return address, and by exception delivery to
//! locate handler tables.

use std::collections::BTreeMap;
use std::sync::Arc;

use spin::RwLock;

use crate::util::{Address, ByteSize, OpaquePointer};

/// A record sufficient to reconstruct a source-level frame from a compiled-code address.
#[derive(Debug)]
pub struct MethodInfo {
    /// Human-readable method name.
    pub name: String,
    /// Start address of the compiled code.
    pub code_start: Address,
    /// Size of the compiled code in bytes.
    pub code_size: ByteSize,
    /// The code-generation unit that owns the compiled code. The map holds non-owning
    /// records; the owner must drain the map (`remove_method_infos`) before freeing them.
    pub owner: OpaquePointer,
}

impl std::fmt::Display for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{} at {}", self.name, self.code_start)
    }
}

/// Map of applicative methods to compiled-code addresses. One writer or many readers; a spin
/// lock is adequate since insertions happen at compile time and lookups are short.
pub struct FunctionMap {
    functions: RwLock<BTreeMap<Address, Arc<MethodInfo>>>,
}

impl FunctionMap {
    pub fn new() -> Self {
        FunctionMap {
            functions: RwLock::new(BTreeMap::new()),
        }
    }

    /// Record a new compiled method, keyed by its code start address.
    pub fn add_method_info(&self, info: Arc<MethodInfo>) {
        debug_assert!(info.code_size > 0);
        trace!("add method info: {}", info);
        self.functions.write().insert(info.code_start, info);
    }

    /// Map an arbitrary instruction pointer to the method whose code range contains it:
    /// the greatest recorded start address no larger than `ip`, provided `ip` falls within
    /// that method's code size. The caller decides what a miss means (a foreign frame, or a
    /// leaf to be walked heuristically).
    pub fn ip_to_method_info(&self, ip: Address) -> Option<Arc<MethodInfo>> {
        let functions = self.functions.read();
        let (start, info) = functions.range(..=ip).next_back()?;
        if ip < *start + info.code_size {
            Some(info.clone())
        } else {
            None
        }
    }

    /// Remove every record owned by the given code-generation unit (bulk unload).
    pub fn remove_method_infos(&self, owner: OpaquePointer) {
        let mut functions = self.functions.write();
        let before = functions.len();
        functions.retain(|_, info| info.owner != owner);
        debug!("removed {} method infos", before - functions.len());
    }

    pub fn len(&self) -> usize {
        self.functions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.read().is_empty()
    }
}

impl Default for FunctionMap {
    fn default() -> Self {
        Self::new()
    }
}
