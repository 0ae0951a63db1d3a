//! Stand-in for the excluded fact/service-discovery/Docker-inspection
//! collaborators. A real deployment plugs in an implementation that
//! actually reads `/proc`, inspects listening sockets and talks to the
//! Docker daemon; this one only supplies the identity facts the
//! duplicate-agent check needs from configuration, since those three are
//! the one input this binary can supply without those collectors.

use std::collections::HashMap;

use async_trait::async_trait;

use bleemeo_reconciler::duplicate::IdentityFacts;
use bleemeo_reconciler::provider::LocalStateProvider;
use bleemeo_reconciler::services_sync::ServiceInfo;
use bleemeo_reconciler::containers_sync::DockerContainerInfo;

/// Reports a fixed identity and nothing else. Facts, services and
/// containers are always empty: with no collector wired in, the
/// reconciler's facts/services/containers phases simply have nothing
/// local to reconcile against, which is a safe (if inert) default.
pub struct StaticStateProvider {
    identity_facts: IdentityFacts,
}

impl StaticStateProvider {
    pub fn new(fqdn: String) -> Self {
        Self { identity_facts: IdentityFacts { fqdn: Some(fqdn), primary_address: None, primary_mac_address: None } }
    }
}

#[async_trait]
impl LocalStateProvider for StaticStateProvider {
    async fn facts(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    async fn identity_facts(&self) -> IdentityFacts {
        self.identity_facts.clone()
    }

    async fn services(&self) -> Vec<ServiceInfo> {
        Vec::new()
    }

    async fn containers(&self) -> Vec<DockerContainerInfo> {
        Vec::new()
    }
}
