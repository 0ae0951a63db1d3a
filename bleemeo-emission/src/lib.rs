//! Metric point emission path.
//!
//! `emit(point)` is the narrow interface the out-of-scope metric
//! collectors call into: whitelist/Docker gating, pending-registration
//! tracking (so the reconciler knows what to register), a deferred queue
//! for identities not yet known to the cache, and outbound batching.

pub mod batch;
pub mod deferred;
pub mod emitter;
pub mod point;
pub mod registration;
pub mod render;
pub mod whitelist;

pub use batch::BatchBuffer;
pub use deferred::DeferredQueue;
pub use emitter::{EmitOutcome, Emitter};
pub use point::MetricPoint;
pub use registration::RegistrationTracker;
pub use render::{render, RenderedMessage, ServiceKillSignal};
