//! Cross-stage bookkeeping read by the image finalizer.
//!
//! One [`ProvisioningState`] is created per environment build, passed by
//! `&mut` to the stages that need it, and read once after provisioning.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::graph::GraphState;

/// A long-running process the finalizer should start in the runtime image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub args: Vec<String>,
    pub working_dir: String,
}

/// Environment exports and writable directories for the runtime image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProvisioningState {
    pub environment_exports: BTreeMap<String, String>,
    pub writable_directories: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceSpec>,
}

impl ProvisioningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a directory the end user must own. Repeated paths are ignored.
    pub fn add_writable_dir(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.writable_directories.contains(&path) {
            self.writable_directories.push(path);
        }
    }

    /// Record a service. A service with the same name is replaced.
    pub fn add_service(&mut self, service: ServiceSpec) {
        match self.services.iter_mut().find(|s| s.name == service.name) {
            Some(existing) => *existing = service,
            None => self.services.push(service),
        }
    }

    /// Set `key` both on the build state and in the runtime exports.
    ///
    /// This is the only way stages export variables, so build-time and
    /// runtime values cannot diverge.
    pub fn export_env(&mut self, root: &GraphState, key: &str, value: &str) -> GraphState {
        self.environment_exports
            .insert(key.to_string(), value.to_string());
        root.add_env(key, value)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_writable_dir_dedups() {
        let mut state = ProvisioningState::new();
        state.add_writable_dir("/opt/a");
        state.add_writable_dir("/opt/b");
        state.add_writable_dir("/opt/a");

        assert_eq!(state.writable_directories, vec!["/opt/a", "/opt/b"]);
    }

    #[test]
    fn test_export_env_keeps_both_sides_in_sync() {
        let mut state = ProvisioningState::new();
        let root = GraphState::image("ubuntu:22.04");

        let next = state.export_env(&root, "DEPOT", "/opt/depot");

        assert_eq!(next.env("DEPOT"), Some("/opt/depot"));
        assert_eq!(
            state.environment_exports.get("DEPOT").map(String::as_str),
            Some("/opt/depot")
        );
        assert_eq!(root.env("DEPOT"), None);
    }

    #[test]
    fn test_add_service_replaces_by_name() {
        let mut state = ProvisioningState::new();
        let service = ServiceSpec {
            name: "mirror".into(),
            args: vec!["julia".into(), "server.jl".into()],
            working_dir: "/opt/julia/config".into(),
        };
        state.add_service(service.clone());
        state.add_service(ServiceSpec {
            working_dir: "/srv".into(),
            ..service
        });

        assert_eq!(state.services.len(), 1);
        assert_eq!(state.services[0].working_dir, "/srv");
    }

    #[test]
    fn test_json_omits_empty_services() {
        let mut state = ProvisioningState::new();
        state.add_writable_dir("/opt/a");
        let value: serde_json::Value = serde_json::from_str(&state.to_json().unwrap()).unwrap();

        assert!(value.get("services").is_none());
        assert_eq!(value["writable_directories"][0], "/opt/a");
    }
}
