//! Shared types for the Bleemeo connector: the remote data model, the
//! connector-wide error sum type, identity/credentials, and clock/
//! truncation/hashing helpers used by every other crate in the workspace.

pub mod clock;
pub mod datetime;
pub mod docker;
pub mod error;
pub mod identity;
pub mod model;
pub mod truncate;

pub use clock::{wall_time, Clock, SystemClock};
pub use error::{ConnectorError, Result};
pub use identity::AgentIdentity;
pub use model::{
    AgentConfig, AgentFact, Container, Metric, MetricIdentity, MetricRegistrationRequest,
    Service, Thresholds,
};
