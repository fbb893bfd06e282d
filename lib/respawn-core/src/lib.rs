//! Core primitives for respawning worker processes.
//!
//! Jobs arrive at a [`ProcessSupervisor`](runtime::ProcessSupervisor), which dispatches them to the handler bound to
//! their mode and, once each completes, consults a [`RebootStrategy`](reboot::RebootStrategy) to decide whether the
//! process should drain and exit so that a fresh one can take its place.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod job;
pub mod pool;
pub mod reboot;
pub mod registry;
pub mod runtime;
