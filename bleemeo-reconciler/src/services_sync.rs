//! Services sync.
//!
//! Service discovery itself is out of scope; this module
//! consumes its output (`ServiceInfo`, the narrow interface a discovery
//! collaborator would populate) and reconciles it against the cache.

use std::collections::{HashMap, HashSet};

use bleemeo_core::truncate::{truncate, API_SERVICE_INSTANCE_LENGTH};
use bleemeo_core::Service;

/// One port observed by a local `netstat`-equivalent probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetstatPort {
    pub port: u16,
    pub protocol: String,
    pub is_unix_socket: bool,
}

/// Locally discovered service, as handed in by the (out-of-scope) service
/// discovery collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceInfo {
    pub label: String,
    pub instance: Option<String>,
    pub address: Option<String>,
    pub netstat_ports: Vec<NetstatPort>,
    /// Statically declared `(port, protocol)` pairs, used only as a
    /// fallback when `netstat_ports` is empty.
    pub declared_ports: Vec<(u16, String)>,
    pub exe_path: String,
    pub stack: String,
    pub ignore_high_port: bool,
    pub ignore_check: bool,
    pub active: bool,
}

const HIGH_PORT_THRESHOLD: u16 = 32_000;

/// `resolve address, merge netstat ports minus unix sockets, filter ports
/// >32000 when ignore_high_port, fall back to (port, protocol) if netstat
/// empty`.
pub fn compute_listen_addresses(info: &ServiceInfo) -> HashSet<String> {
    let address = info.address.as_deref().unwrap_or("0.0.0.0");

    let mut ports: Vec<(u16, String)> = info
        .netstat_ports
        .iter()
        .filter(|p| !p.is_unix_socket)
        .map(|p| (p.port, p.protocol.clone()))
        .collect();

    if ports.is_empty() {
        ports = info.declared_ports.clone();
    }

    ports
        .into_iter()
        .filter(|(port, _)| !(info.ignore_high_port && *port > HIGH_PORT_THRESHOLD))
        .map(|(port, protocol)| format!("{address}:{port}/{protocol}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub enum ServiceFlip {
    /// The service became active: metrics' `deactivated_at` is cleared.
    Activated { service_uuid: String },
    /// The service became inactive: metrics' `deactivated_at` is set to now.
    Deactivated { service_uuid: String },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServicesSyncPlan {
    /// Locally known services absent from cache: POST.
    pub to_create: Vec<ServiceInfo>,
    /// Locally known services present but changed: PUT `(uuid, info)`.
    pub to_update: Vec<(String, ServiceInfo)>,
    /// Services present in cache but no longer discovered locally: DELETE.
    pub to_delete: Vec<Service>,
    /// Active-flag flips to propagate to referencing metrics.
    pub flips: Vec<ServiceFlip>,
}

fn service_changed(cached: &Service, info: &ServiceInfo, addresses: &HashSet<String>) -> bool {
    &cached.listen_addresses != addresses
        || cached.exe_path != info.exe_path
        || cached.stack != info.stack
        || cached.active != info.active
}

/// `cached`: `services_by_labelinstance` from the current snapshot. `full`
/// gates whether services present in the cache but outside `locals` are
/// considered for deletion at all — deletion is tied to a triggered full
/// listing, so a non-full pass never deletes.
pub fn plan_services_sync(
    locals: &[ServiceInfo],
    cached: &HashMap<(String, String), Service>,
    full: bool,
) -> ServicesSyncPlan {
    let mut plan = ServicesSyncPlan::default();
    let mut seen = HashSet::new();

    for info in locals {
        let instance = info.instance.clone().unwrap_or_default();
        let key = (info.label.clone(), truncate(&instance, API_SERVICE_INSTANCE_LENGTH));
        seen.insert(key.clone());

        let addresses = compute_listen_addresses(info);
        match cached.get(&key) {
            None => plan.to_create.push(info.clone()),
            Some(existing) => {
                if existing.active != info.active {
                    plan.flips.push(if info.active {
                        ServiceFlip::Activated { service_uuid: existing.uuid.clone() }
                    } else {
                        ServiceFlip::Deactivated { service_uuid: existing.uuid.clone() }
                    });
                }
                if service_changed(existing, info, &addresses) {
                    plan.to_update.push((existing.uuid.clone(), info.clone()));
                }
            }
        }
    }

    if full {
        for (key, service) in cached {
            if !seen.contains(key) {
                plan.to_delete.push(service.clone());
            }
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(label: &str, active: bool) -> ServiceInfo {
        ServiceInfo {
            label: label.to_string(),
            instance: None,
            address: Some("127.0.0.1".to_string()),
            netstat_ports: vec![NetstatPort { port: 80, protocol: "tcp".to_string(), is_unix_socket: false }],
            declared_ports: vec![],
            exe_path: "/usr/sbin/nginx".to_string(),
            stack: "web".to_string(),
            ignore_high_port: false,
            ignore_check: false,
            active,
        }
    }

    fn cached_service(uuid: &str, label: &str, active: bool, addresses: &[&str]) -> Service {
        Service {
            uuid: uuid.to_string(),
            label: label.to_string(),
            instance: None,
            listen_addresses: addresses.iter().map(|s| s.to_string()).collect(),
            exe_path: "/usr/sbin/nginx".to_string(),
            stack: "web".to_string(),
            active,
        }
    }

    #[test]
    fn unix_sockets_are_excluded() {
        let mut info = info("nginx", true);
        info.netstat_ports.push(NetstatPort { port: 0, protocol: "unix".to_string(), is_unix_socket: true });
        let addresses = compute_listen_addresses(&info);
        assert_eq!(addresses, HashSet::from(["127.0.0.1:80/tcp".to_string()]));
    }

    #[test]
    fn falls_back_to_declared_ports_when_netstat_empty() {
        let mut info = info("nginx", true);
        info.netstat_ports.clear();
        info.declared_ports = vec![(443, "tcp".to_string())];
        let addresses = compute_listen_addresses(&info);
        assert_eq!(addresses, HashSet::from(["127.0.0.1:443/tcp".to_string()]));
    }

    #[test]
    fn high_ports_filtered_when_requested() {
        let mut info = info("nginx", true);
        info.ignore_high_port = true;
        info.netstat_ports.push(NetstatPort { port: 40_000, protocol: "tcp".to_string(), is_unix_socket: false });
        let addresses = compute_listen_addresses(&info);
        assert_eq!(addresses, HashSet::from(["127.0.0.1:80/tcp".to_string()]));
    }

    #[test]
    fn new_local_service_is_created() {
        let plan = plan_services_sync(&[info("nginx", true)], &HashMap::new(), true);
        assert_eq!(plan.to_create.len(), 1);
    }

    #[test]
    fn active_flag_flip_is_reported() {
        let cached = HashMap::from([(
            ("nginx".to_string(), String::new()),
            cached_service("s1", "nginx", true, &["127.0.0.1:80/tcp"]),
        )]);
        let plan = plan_services_sync(&[info("nginx", false)], &cached, true);
        assert_eq!(plan.flips, vec![ServiceFlip::Deactivated { service_uuid: "s1".to_string() }]);
    }

    #[test]
    fn service_missing_locally_is_deleted_only_on_full_pass() {
        let cached = HashMap::from([(
            ("nginx".to_string(), String::new()),
            cached_service("s1", "nginx", true, &["127.0.0.1:80/tcp"]),
        )]);
        let plan = plan_services_sync(&[], &cached, false);
        assert!(plan.to_delete.is_empty());

        let plan = plan_services_sync(&[], &cached, true);
        assert_eq!(plan.to_delete.len(), 1);
    }
}
