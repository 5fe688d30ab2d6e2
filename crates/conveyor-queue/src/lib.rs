//! Build queue and scheduling engine for the Conveyor CI control plane.
//!
//! [`QueueEngine`] is the authoritative scheduler: it admits builds,
//! leases runnable jobs to runners, enforces the status state machines,
//! feeds the fingerprint indirection index, and accepts dynamic job
//! insertion from running builds. [`EventBroker`] carries the per-build
//! event stream; [`RunnerRegistry`] holds connected runner sessions.

pub mod engine;
pub mod events;
pub mod fingerprint;
pub mod session;

pub use engine::{BuildGraph, EnqueueRequest, JobGraph, JobUpdate, QueueEngine, RunnableJob};
pub use events::{EventBroker, EventSubscription};
pub use session::{RunnerRegistry, RunnerSession};
