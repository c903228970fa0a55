//! Mutation intents -- idempotent requests to change a target's routing or
//! replica count.

use serde::{Deserialize, Serialize};

use crate::report::ReportId;
use crate::target::{RouteConfig, Target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntentKind {
    ReweightRoute,
    ScaleDeployment,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::ReweightRoute => "reweight-route",
            IntentKind::ScaleDeployment => "scale-deployment",
        }
    }
}

/// Why an intent was issued. Part of the idempotency key, so the failover,
/// its rollback and the later restore of one incident never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentPurpose {
    Failover,
    Rollback,
    Restore,
}

impl IntentPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentPurpose::Failover => "failover",
            IntentPurpose::Rollback => "rollback",
            IntentPurpose::Restore => "restore",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(report: &ReportId, target: &str, kind: IntentKind, purpose: IntentPurpose) -> Self {
        Self(format!(
            "{}/{}/{}/{}",
            report,
            target,
            kind.as_str(),
            purpose.as_str()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Report the key was derived from.
    pub fn report(&self) -> &str {
        self.0.split('/').next().unwrap_or_default()
    }

    pub fn target(&self) -> &str {
        self.0.split('/').nth(1).unwrap_or_default()
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetWeight {
    pub subset: String,
    pub weight: u32,
}

/// Desired state carried by an intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum IntentParams {
    ReweightRoute {
        route: String,
        host: String,
        weights: Vec<SubsetWeight>,
    },
    ScaleDeployment {
        deployment: String,
        replicas: u32,
    },
}

impl IntentParams {
    pub fn kind(&self) -> IntentKind {
        match self {
            IntentParams::ReweightRoute { .. } => IntentKind::ReweightRoute,
            IntentParams::ScaleDeployment { .. } => IntentKind::ScaleDeployment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationIntent {
    pub target: String,
    pub purpose: IntentPurpose,
    pub key: IdempotencyKey,
    pub params: IntentParams,
}

impl MutationIntent {
    pub fn kind(&self) -> IntentKind {
        self.params.kind()
    }
}

fn intents_for(
    target: &Target,
    report: &ReportId,
    purpose: IntentPurpose,
    desired: RouteConfig,
) -> Vec<MutationIntent> {
    let reweight = IntentParams::ReweightRoute {
        route: target.route.clone(),
        host: target.host.clone(),
        weights: vec![
            SubsetWeight {
                subset: target.primary_subset.clone(),
                weight: desired.weights.primary,
            },
            SubsetWeight {
                subset: target.standby_subset.clone(),
                weight: desired.weights.standby,
            },
        ],
    };
    let scale = IntentParams::ScaleDeployment {
        deployment: target.deployment.clone(),
        replicas: desired.replicas,
    };

    [reweight, scale]
        .into_iter()
        .map(|params| MutationIntent {
            target: target.name.clone(),
            purpose,
            key: IdempotencyKey::new(report, &target.name, params.kind(), purpose),
            params,
        })
        .collect()
}

/// Shift all traffic to the standby subset and scale the primary down.
pub fn failover_intents(target: &Target, report: &ReportId) -> Vec<MutationIntent> {
    intents_for(target, report, IntentPurpose::Failover, target.failover())
}

/// Put the pre-incident weights and replica count back.
pub fn restore_intents(
    target: &Target,
    report: &ReportId,
    purpose: IntentPurpose,
) -> Vec<MutationIntent> {
    intents_for(target, report, purpose, target.baseline())
}

/// Apply an acknowledged intent to the last known cluster configuration.
pub fn apply_to(config: &mut RouteConfig, target: &Target, params: &IntentParams) {
    match params {
        IntentParams::ReweightRoute { weights, .. } => {
            for w in weights {
                if w.subset == target.primary_subset {
                    config.weights.primary = w.weight;
                } else if w.subset == target.standby_subset {
                    config.weights.standby = w.weight;
                }
            }
        }
        IntentParams::ScaleDeployment { replicas, .. } => config.replicas = *replicas,
    }
}
