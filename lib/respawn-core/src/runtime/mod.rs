//! Worker process runtime.
//!
//! A worker process runs a single [`ProcessSupervisor`], which pulls jobs from a job source, dispatches them through
//! the [`WorkerRegistry`](crate::registry::WorkerRegistry), and runs every worker pool. After each completed job, the
//! supervisor asks its [`RebootStrategy`](crate::reboot::RebootStrategy) whether the process should be replaced.
//!
//! A process moves through four states, never backwards:
//!
//! ```text
//! Idle -> Running -> Draining -> Terminated
//! ```
//!
//! While draining, no new jobs are accepted, but everything already in flight is allowed to finish, optionally bounded
//! by a drain timeout. An external manager is expected to start a replacement once the process exits.

mod shutdown;
pub use self::shutdown::{StopHandle, StopSignal};

mod supervisor;
pub use self::supervisor::{
    ProcessSupervisor, SupervisorConfiguration, SupervisorError, SupervisorState, Termination, TerminationReason,
    ABORTED,
};
