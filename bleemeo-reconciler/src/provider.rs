//! Narrow interfaces the out-of-scope collectors populate: fact gathering, service discovery and
//! container inspection. The reconciler only consumes their output through
//! this trait.

use std::collections::HashMap;

use async_trait::async_trait;

use crate::containers_sync::DockerContainerInfo;
use crate::duplicate::IdentityFacts;
use crate::services_sync::ServiceInfo;

/// Snapshot of everything locally discovered since the last call, handed to
/// the reconciler at the start of each phase that needs it.
#[async_trait]
pub trait LocalStateProvider: Send + Sync {
    /// `key -> value` facts.
    async fn facts(&self) -> HashMap<String, String>;

    /// The subset of `facts()` compared for duplicate-agent detection.
    async fn identity_facts(&self) -> IdentityFacts;

    async fn services(&self) -> Vec<ServiceInfo>;

    async fn containers(&self) -> Vec<DockerContainerInfo>;
}
