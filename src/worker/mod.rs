//! Local execution: worker pools and the runtimes they drive.
//!
//! - [`WorkerPool`]: per-service slots, lazy loading, single-flight leases
//! - [`executor`]: the [`InferenceInvoker`]/[`ModelLoader`] seams and the
//!   container-backed runtime
//!
//! # Worker lifecycle
//!
//! 1. A slot starts `Uninitialized` and loads on first acquisition
//! 2. `Loading` ends in `Busy` (leased) or `Failed` (retried on the next acquire)
//! 3. Releasing the lease returns it to `Idle`, or `Terminated` after an
//!    unrecoverable error, a timeout or pool shutdown

pub mod executor;
pub mod pool;

pub use executor::{ContainerLoader, InferenceInvoker, InvokeError, ModelLoader};
pub use pool::{AcquireError, WorkerLease, WorkerPool, WorkerState};
