//! Master-side range-server failure recovery.
//!
//! When a range server dies, the master reconstructs the ranges it owned
//! by replaying its write-ahead-log fragments onto surviving servers and
//! flipping the resurrected ranges live. This crate implements the
//! master half of that protocol:
//!
//! - [`Context`]: the authoritative registry of range servers, the
//!   per-recovery synchronization trackers, and the durable master
//!   meta-log writer
//! - [`ops::RecoverServer`]: the top-level state machine per failed
//!   server (grace wait, exclusive lock, meta-log read, group fan-out)
//! - [`ops::RecoverRanges`]: the per-group four-phase replay protocol
//!   (replay, prepare, commit, acknowledge), including plan construction
//!   and repair across destination failures
//! - [`OperationProcessor`]: a minimal dependency-aware driver; the
//!   production scheduler is an external collaborator with the same
//!   contract (single in-flight invocation per operation id, dependency
//!   edges respected)
//!
//! The coordination service and the RPC transport are seams
//! ([`LockService`], [`RecoveryRpc`]); everything above them is the
//! recovery core.

pub mod context;
pub mod dependency;
pub mod lock;
pub mod ops;
pub mod processor;
pub mod rpc;
pub mod server;
pub mod tracker;

mod error;

pub use context::Context;
pub use error::{Error, Result};
pub use lock::{LocalLockService, LockHandle, LockService, LockStatus};
pub use processor::{Operation, OperationProcessor, OperationState, OperationStatus};
pub use rpc::RecoveryRpc;
pub use server::{RangeServerConnection, ServerList};
pub use tracker::{RangeTracker, ReplayTracker};
