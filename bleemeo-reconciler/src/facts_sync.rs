//! Facts sync.
//!
//! The agent has no PATCH rights on facts: a changed value is a new POST,
//! and the old remote fact is left to be superseded. Facts present remotely
//! but no longer produced locally are deleted. When `docker_integration` is
//! off, locally-produced `docker_*` facts are stripped before comparison so
//! they don't get re-created every loop.

use std::collections::HashMap;

use bleemeo_core::AgentFact;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FactsSyncPlan {
    /// `(key, value)` pairs to POST as new facts.
    pub to_create: Vec<(String, String)>,
    /// Remote facts (full object, for their uuid) to DELETE.
    pub to_delete: Vec<AgentFact>,
}

/// `local`: freshly gathered `key -> value` facts from the (out-of-scope)
/// fact collector. `cached`: `facts_by_key` from the current snapshot.
pub fn plan_facts_sync(
    local: &HashMap<String, String>,
    cached: &HashMap<String, AgentFact>,
    docker_integration: bool,
) -> FactsSyncPlan {
    let local: HashMap<&String, &String> = if docker_integration {
        local.iter().collect()
    } else {
        local.iter().filter(|(k, _)| !k.starts_with("docker_")).collect()
    };

    let mut plan = FactsSyncPlan::default();

    for (key, value) in &local {
        let changed = match cached.get(key.as_str()) {
            Some(fact) => &fact.value != *value,
            None => true,
        };
        if changed {
            plan.to_create.push(((*key).clone(), (*value).clone()));
        }
    }

    for (key, fact) in cached {
        if !local.contains_key(key) {
            plan.to_delete.push(fact.clone());
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact(uuid: &str, key: &str, value: &str) -> AgentFact {
        AgentFact { uuid: uuid.to_string(), key: key.to_string(), value: value.to_string() }
    }

    #[test]
    fn unchanged_fact_is_left_alone() {
        let local = HashMap::from([("fqdn".to_string(), "host.example".to_string())]);
        let cached = HashMap::from([("fqdn".to_string(), fact("f1", "fqdn", "host.example"))]);
        let plan = plan_facts_sync(&local, &cached, true);
        assert!(plan.to_create.is_empty());
        assert!(plan.to_delete.is_empty());
    }

    #[test]
    fn changed_value_is_posted_as_new() {
        let local = HashMap::from([("fqdn".to_string(), "host-new".to_string())]);
        let cached = HashMap::from([("fqdn".to_string(), fact("f1", "fqdn", "host-old"))]);
        let plan = plan_facts_sync(&local, &cached, true);
        assert_eq!(plan.to_create, vec![("fqdn".to_string(), "host-new".to_string())]);
    }

    #[test]
    fn fact_no_longer_produced_locally_is_deleted() {
        let local = HashMap::new();
        let cached = HashMap::from([("kernel".to_string(), fact("f1", "kernel", "5.10"))]);
        let plan = plan_facts_sync(&local, &cached, true);
        assert_eq!(plan.to_delete, vec![fact("f1", "kernel", "5.10")]);
    }

    #[test]
    fn docker_facts_are_stripped_when_docker_integration_is_off() {
        let local = HashMap::from([
            ("docker_version".to_string(), "24.0".to_string()),
            ("fqdn".to_string(), "host.example".to_string()),
        ]);
        let cached = HashMap::new();
        let plan = plan_facts_sync(&local, &cached, false);
        assert_eq!(plan.to_create, vec![("fqdn".to_string(), "host.example".to_string())]);
    }

    #[test]
    fn docker_facts_kept_when_docker_integration_is_on() {
        let local = HashMap::from([("docker_version".to_string(), "24.0".to_string())]);
        let cached = HashMap::new();
        let plan = plan_facts_sync(&local, &cached, true);
        assert_eq!(plan.to_create, vec![("docker_version".to_string(), "24.0".to_string())]);
    }
}
