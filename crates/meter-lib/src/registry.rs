//! Registry of tracked containers
//!
//! Holds the authoritative mapping from container name to its last-known
//! descriptor and decides which containers the meter may track.

use crate::models::ContainerInfo;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("the registry cannot track container {0}")]
    NotTrackable(String),
}

/// Admission policy: a container is trackable when it carries the tracking
/// label or the tracking environment variable
#[derive(Debug, Clone, Default)]
pub struct TrackingPolicy {
    label: String,
    env_key: String,
}

impl TrackingPolicy {
    pub fn new(label: impl Into<String>, env_key: impl AsRef<str>) -> Self {
        Self {
            label: label.into(),
            env_key: env_key.as_ref().to_ascii_lowercase(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn env_key(&self) -> &str {
        &self.env_key
    }

    pub fn is_trackable(&self, info: &ContainerInfo) -> bool {
        if !self.label.is_empty() && info.labels.contains_key(&self.label) {
            return true;
        }

        !self.env_key.is_empty()
            && info
                .env
                .keys()
                .any(|key| key.eq_ignore_ascii_case(&self.env_key))
    }
}

/// Registry of tracked containers on this host
pub struct ContainerRegistry {
    /// Map of container name -> descriptor
    containers: DashMap<String, Arc<ContainerInfo>>,
    policy: TrackingPolicy,
}

impl ContainerRegistry {
    pub fn new(policy: TrackingPolicy) -> Self {
        Self {
            containers: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &TrackingPolicy {
        &self.policy
    }

    pub fn is_trackable(&self, info: &ContainerInfo) -> bool {
        self.policy.is_trackable(info)
    }

    /// Register a container, returning whether it was newly inserted
    ///
    /// Registering a name that is already present keeps the existing entry.
    pub fn register(&self, info: Arc<ContainerInfo>) -> Result<bool, RegistryError> {
        if !self.is_trackable(&info) {
            return Err(RegistryError::NotTrackable(info.name.clone()));
        }

        match self.containers.entry(info.name.clone()) {
            Entry::Occupied(_) => {
                warn!(container.name = %info.name, "container already registered, ignoring");
                Ok(false)
            }
            Entry::Vacant(slot) => {
                slot.insert(info.clone());
                info!(container.name = %info.name, "container registered");
                Ok(true)
            }
        }
    }

    /// Remove a container; removing an unknown name is a no-op
    pub fn drop_container(&self, name: &str) -> Result<(), RegistryError> {
        match self.containers.remove(name) {
            Some(_) => info!(container.name = %name, "container dropped"),
            None => warn!(container.name = %name, "container not registered, ignoring"),
        }

        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ContainerInfo>> {
        self.containers.get(name).map(|r| r.value().clone())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.containers.contains_key(name)
    }

    /// All registered containers, in no particular order
    pub fn list(&self) -> Vec<Arc<ContainerInfo>> {
        self.containers.iter().map(|r| r.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.containers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.containers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ContainerRegistry {
        ContainerRegistry::new(TrackingPolicy::new("track", "METER_TRACK"))
    }

    fn tracked(name: &str) -> Arc<ContainerInfo> {
        Arc::new(ContainerInfo::new(name).with_label("track", "1"))
    }

    #[test]
    fn test_register_is_idempotent() {
        let registry = registry();
        let info = tracked("web-1");

        assert_eq!(registry.register(info.clone()), Ok(true));
        assert_eq!(registry.register(info), Ok(false));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_registered("web-1"));
    }

    #[test]
    fn test_register_keeps_first_descriptor() {
        let registry = registry();
        registry
            .register(Arc::new(
                ContainerInfo::new("web-1")
                    .with_label("track", "1")
                    .with_image("nginx", "1.25"),
            ))
            .unwrap();
        registry
            .register(Arc::new(
                ContainerInfo::new("web-1")
                    .with_label("track", "1")
                    .with_image("nginx", "1.26"),
            ))
            .unwrap();

        assert_eq!(registry.get("web-1").unwrap().image_tag, "1.25");
    }

    #[test]
    fn test_register_rejects_untrackable() {
        let registry = registry();
        let result = registry.register(Arc::new(ContainerInfo::new("db-1")));

        assert_eq!(
            result,
            Err(RegistryError::NotTrackable("db-1".to_string()))
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_trackable_by_env_key_is_case_insensitive() {
        let registry = registry();
        let info = Arc::new(ContainerInfo::new("job-1").with_env("Meter_Track", "yes"));

        assert!(registry.is_trackable(&info));
        assert_eq!(registry.register(info), Ok(true));
    }

    #[test]
    fn test_empty_policy_tracks_nothing() {
        let registry = ContainerRegistry::new(TrackingPolicy::default());
        let info = ContainerInfo::new("web-1").with_label("", "x");

        assert!(!registry.is_trackable(&info));
    }

    #[test]
    fn test_drop_unregistered_is_noop() {
        let registry = registry();
        registry.register(tracked("web-1")).unwrap();

        assert!(registry.drop_container("web-2").is_ok());
        assert_eq!(registry.len(), 1);

        assert!(registry.drop_container("web-1").is_ok());
        assert!(registry.is_empty());
        assert!(registry.get("web-1").is_none());
    }

    #[test]
    fn test_concurrent_register_inserts_once() {
        let registry = Arc::new(registry());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.register(tracked("web-1")).unwrap())
            })
            .collect();
        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|inserted| *inserted)
            .count();

        assert_eq!(inserted, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_returns_all_entries() {
        let registry = registry();
        registry.register(tracked("a")).unwrap();
        registry.register(tracked("b")).unwrap();

        let mut names: Vec<String> = registry.list().iter().map(|c| c.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
