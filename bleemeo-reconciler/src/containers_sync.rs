//! Containers sync.
//!
//! Container inspection itself is out of scope; this module
//! diffs the locally observed `inspect_hash` against the cache and plans
//! create/update/delete. Deleting a container cascades to every metric
//! referencing it (applied by the caller against the cache, not here, since
//! this module only computes the plan).

use std::collections::{HashMap, HashSet};

use bleemeo_core::docker::inspect_hash;
use bleemeo_core::Container;
use serde_json::Value;

/// A locally observed docker container, as handed in by the (out-of-scope)
/// container inspection collaborator.
#[derive(Debug, Clone)]
pub struct DockerContainerInfo {
    pub name: String,
    pub docker_id: String,
    pub inspect: Value,
}

#[derive(Debug, Clone, Default)]
pub struct ContainersSyncPlan {
    pub to_create: Vec<DockerContainerInfo>,
    /// `(uuid, info, new_hash)` for containers whose inspect hash changed.
    pub to_update: Vec<(String, DockerContainerInfo, String)>,
    /// Cached containers no longer present locally: DELETE, cascading to
    /// their metrics.
    pub to_delete: Vec<Container>,
}

/// `cached`: `containers_by_name` from the current snapshot. `full` gates
/// deletion exactly as in [`crate::services_sync::plan_services_sync`].
pub fn plan_containers_sync(
    locals: &[DockerContainerInfo],
    cached: &HashMap<String, Container>,
    full: bool,
) -> ContainersSyncPlan {
    let mut plan = ContainersSyncPlan::default();
    let mut seen = HashSet::new();

    for info in locals {
        seen.insert(info.name.clone());
        let hash = inspect_hash(&info.inspect);
        match cached.get(&info.name) {
            None => plan.to_create.push(info.clone()),
            Some(existing) if existing.inspect_hash != hash => {
                plan.to_update.push((existing.uuid.clone(), info.clone(), hash));
            }
            Some(_) => {}
        }
    }

    if full {
        for (name, container) in cached {
            if !seen.contains(name) {
                plan.to_delete.push(container.clone());
            }
        }
    }

    plan
}
