//! Pooled execution of the external code sniffer
//!
//! The sniffer is run as a short-lived child process per request. This
//! module coordinates a fixed number of execution slots so that a document
//! edited many times per second never floods the machine with processes.
//!
//! # Architecture
//!
//! - **Workers**: each worker runs at most one tool process at a time and
//!   reports when it becomes idle again
//! - **Pool**: hands out idle workers, queueing callers per key (FIFO) when
//!   all of them are busy
//! - **Registry**: keyed pending completions; a newer wait under the same
//!   key replaces the older one
//! - **Cancellation**: `CancellationToken`s withdraw queued waits and kill
//!   running processes
//!
//! # Modules
//!
//! - `command`: tool arguments, executable tokenizing and the input envelope
//! - `pool`: worker pool and leases
//! - `process`: worker state machine and process I/O
//! - `registry`: pending request registry
//! - `schema`: request/response types and output parsing

pub mod command;
pub mod pool;
pub mod process;
pub mod registry;
pub mod schema;

pub use command::{split_command_line, Invocation};
pub use pool::{WorkerLease, WorkerPool};
pub use process::{AvailabilityObserver, Worker};
pub use registry::{PendingRequestRegistry, RegistryError};
pub use schema::{
    Diagnostic, Position, Range, ReportKind, Request, RequestData, Response, Severity, Standard,
    ToolOptions, WorkerError,
};
