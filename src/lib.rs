//! Managed Runtime ToolKit (MRTk) is the coordination core for hosting multiple managed
//! virtual machines in a single process. It owns the state every hosted VM shares and the
//! protocols that tie them together:
//!
//! * Registries: every VM registers for a dense slot id ([`MRTK::add_vm`]), and every thread
//!   running hosted application code registers as a mutator, moving between a *prepared* and
//!   a *running* list ([`MRTK::register_running_thread`]).
//! * [Rendezvous](rendezvous/struct.CollectionRendezvous.html): the stop-the-world protocol
//!   that brings every mutator to a safe state before the collector scans the heap, with a
//!   cooperative (polled) and an uncooperative (signal-driven) variant.
//! * [Collection driver](mrtk/struct.MRTK.html#method.collect): orchestrates a collection
//!   across all hosted VMs, from the per-VM `start_collection` hooks through root tracing,
//!   the reference queues and finalization to the release of the mutators.
//! * [Function map](function_map/struct.FunctionMap.html): maps compiled-code addresses to
//!   method descriptors for stack walking and exception delivery.
//! * [Incinerator](incinerator/struct.Incinerator.html): finds and resets references into
//!   uninstalled code bundles during a collection, so their class loaders can be reclaimed.
//!
//! The core does not allocate and does not trace object fields itself; the concrete
//! collector plugs in through [`vm::collector::Collector`], and each hosted VM implements
//! [`vm::VirtualMachine`].

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate log;

pub mod util;

pub mod finalizer;
pub mod function_map;
pub mod global_state;
pub mod incinerator;
pub mod monitor;
mod mrtk;
pub mod rendezvous;
pub mod thread;
pub mod vm;

pub use crate::mrtk::{CollectionResult, MRTKBuilder, MRTK};
