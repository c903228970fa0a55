//! Target registry -- the fixed set of monitored service instances.
//!
//! A target is identified by its stable logical name (e.g. `ratings`). The
//! pod currently serving it is tracked separately as advisory metadata, so a
//! pod restart never requires reconfiguration.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// Percentage split of a route between the primary and standby subsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteWeights {
    pub primary: u32,
    pub standby: u32,
}

/// Route weights plus primary replica count: the part of the cluster the
/// orchestrator is allowed to change for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub weights: RouteWeights,
    pub replicas: u32,
}

/// A monitored service instance and the mesh objects that route to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    /// Stable logical name.
    pub name: String,
    /// VirtualService carrying the weighted route.
    pub route: String,
    /// Destination host inside the route.
    pub host: String,
    /// Subset normally receiving traffic.
    pub primary_subset: String,
    /// Replica subset that takes over during an incident.
    pub standby_subset: String,
    /// Deployment backing the primary subset.
    pub deployment: String,
    /// Pre-incident replica count of the primary deployment.
    pub replicas: u32,
    /// Replica floor the primary is scaled to while failed over.
    pub failover_replicas: u32,
    /// Proxy container whose access log is collected.
    pub container: String,
}

impl Target {
    /// Build a target with the conventional mesh naming used by the
    /// bookinfo-style deployments (`<name>-route`, `<name>-v1`, ...).
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            route: format!("{}-route", name),
            host: name.to_string(),
            primary_subset: "v1".to_string(),
            standby_subset: "v2".to_string(),
            deployment: format!("{}-v1", name),
            replicas: 1,
            failover_replicas: 0,
            container: "istio-proxy".to_string(),
        }
    }

    /// The configuration the target runs with outside of an incident.
    pub fn baseline(&self) -> RouteConfig {
        RouteConfig {
            weights: RouteWeights {
                primary: 100,
                standby: 0,
            },
            replicas: self.replicas,
        }
    }

    /// The configuration applied while the target is failed over.
    pub fn failover(&self) -> RouteConfig {
        RouteConfig {
            weights: RouteWeights {
                primary: 0,
                standby: 100,
            },
            replicas: self.failover_replicas,
        }
    }
}

/// Registry of all monitored targets keyed by logical name.
///
/// The set of targets is fixed for the lifetime of the process; only the
/// advisory physical identifiers change.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: BTreeMap<String, Arc<Target>>,
    physical: RwLock<HashMap<String, String>>,
}

impl TargetRegistry {
    pub fn new(targets: impl IntoIterator<Item = Target>) -> Self {
        let targets = targets
            .into_iter()
            .map(|t| (t.name.clone(), Arc::new(t)))
            .collect();
        Self {
            targets,
            physical: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Target>> {
        self.targets.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.targets.contains_key(name)
    }

    /// Targets in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Target>> {
        self.targets.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Last known pod (or other instance id) serving `name`.
    pub fn physical_id(&self, name: &str) -> Option<String> {
        self.physical
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Record the instance currently serving `name`. Unknown names are ignored.
    pub fn set_physical_id(&self, name: &str, id: &str) {
        if !self.contains(name) {
            return;
        }
        let mut physical = self.physical.write().unwrap_or_else(PoisonError::into_inner);
        let previous = physical.insert(name.to_string(), id.to_string());
        if previous.as_deref() != Some(id) {
            info!(service = %name, instance = %id, previous = ?previous, "Target instance changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conventional_names() {
        let t = Target::new("ratings");
        assert_eq!(t.route, "ratings-route");
        assert_eq!(t.deployment, "ratings-v1");
        assert_eq!(t.failover().weights, RouteWeights { primary: 0, standby: 100 });
        assert_eq!(t.baseline().replicas, 1);
    }

    #[test]
    fn test_physical_id_is_metadata_only() {
        let registry = TargetRegistry::new(vec![Target::new("ratings")]);
        assert!(registry.physical_id("ratings").is_none());

        registry.set_physical_id("ratings", "ratings-v1-856f65bcff-xb6kr");
        registry.set_physical_id("ratings", "ratings-v1-856f65bcff-q2n9z");
        assert_eq!(
            registry.physical_id("ratings").as_deref(),
            Some("ratings-v1-856f65bcff-q2n9z")
        );
        // Logical identity is untouched.
        assert_eq!(registry.get("ratings").unwrap().name, "ratings");

        registry.set_physical_id("unknown", "pod-1");
        assert!(registry.physical_id("unknown").is_none());
    }
}
