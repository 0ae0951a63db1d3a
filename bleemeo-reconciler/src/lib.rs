//! State reconciliation loop.
//!
//! The sub-modules are pure: each phase is a `plan_*`/`resolve_*` function
//! that takes a cache snapshot plus freshly-observed local state and
//! returns a plan (create/update/delete) without touching the network.
//! [`runner::ReconcilerLoop`] is the impure glue that executes those plans
//! against [`bleemeo_api::ApiClient`], publishes the result through
//! [`bleemeo_cache::ObjectCache`], and paces the whole thing with the
//! backoff/escalation policies in [`backoff`] and [`error_escalation`].

pub mod agent_sync;
pub mod backoff;
pub mod containers_sync;
pub mod duplicate;
pub mod error_escalation;
pub mod facts_sync;
pub mod metrics_sync;
pub mod priority;
pub mod provider;
pub mod runner;
pub mod services_sync;

pub use provider::LocalStateProvider;
pub use runner::{BrokerControl, ReconcilerConfig, ReconcilerHandle, ReconcilerLoop};
