//! Cluster Custom Resource Definition
//!
//! A Cluster declares one or more database components. Each component spec
//! is the synthesized input of the component engine: replica count, volume
//! templates, workload type, probe and horizontal-scale configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ComponentStatus, Condition, ConsensusSetSpec, HScaleDataClonePolicy, HorizontalScalePolicy,
    PdbSpec, ProbeConfig, VolumeClaimTemplate, VolumeType, WorkloadType,
};
use crate::controller::quantity::parse_quantity;

/// Structured validation error for `ClusterSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
    pub how_to_fix: String,
}

impl SpecValidationError {
    pub fn new(
        field: impl Into<String>,
        message: impl Into<String>,
        how_to_fix: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            how_to_fix: how_to_fix.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.field, self.message, self.how_to_fix)
    }
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "apps.replicadb.io",
    version = "v1alpha1",
    kind = "Cluster",
    namespaced,
    status = "ClusterStatus",
    shortname = "rdb",
    printcolumn = r#"{"name":"Components","type":"integer","jsonPath":".spec.componentSpecs.length"}"#,
    printcolumn = r#"{"name":"Applied","type":"string","jsonPath":".status.conditions[?(@.type=='ApplyResources')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub component_specs: Vec<ClusterComponentSpec>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterComponentSpec {
    pub name: String,

    #[serde(default)]
    pub workload_type: WorkloadType,

    pub image: String,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub probes: Option<ProbeConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub horizontal_scale_policy: Option<HorizontalScalePolicy>,

    /// Role layout for Consensus components
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_spec: Option<ConsensusSetSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_disruption_budget: Option<PdbSpec>,

    /// Database engine served by the member agent (e.g. "mysql")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_port: Option<i32>,
}

fn default_replicas() -> i32 {
    1
}

impl ClusterComponentSpec {
    /// Role probe timeout, honouring the per-component override
    pub fn role_probe_timeout(&self, default: Duration) -> Duration {
        match self
            .probes
            .as_ref()
            .and_then(|p| p.role_probe_timeout_after_pods_ready)
        {
            Some(secs) if secs > 0 => Duration::from_secs(secs as u64),
            _ => default,
        }
    }

    /// Volume template whose data is cloned on scale-out: the one marked Data, else the first.
    pub fn backup_volume_template(&self) -> Option<&VolumeClaimTemplate> {
        if let Some(name) = self
            .horizontal_scale_policy
            .as_ref()
            .and_then(|p| p.volume_mounts_name.as_deref())
        {
            if let Some(vct) = self.volume_claim_templates.iter().find(|v| v.name == name) {
                return Some(vct);
            }
        }
        self.volume_claim_templates
            .iter()
            .find(|v| v.volume_type == Some(VolumeType::Data))
            .or_else(|| self.volume_claim_templates.first())
    }

    pub fn consensus_spec_or_default(&self) -> ConsensusSetSpec {
        self.consensus_spec.clone().unwrap_or_default()
    }
}

impl ClusterSpec {
    pub fn component(&self, name: &str) -> Option<&ClusterComponentSpec> {
        self.component_specs.iter().find(|c| c.name == name)
    }

    /// Validate the spec and return all problems found
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        if self.component_specs.is_empty() {
            errors.push(SpecValidationError::new(
                "spec.componentSpecs",
                "at least one component is required",
                "Add an entry to spec.componentSpecs.",
            ));
        }

        let mut seen = BTreeMap::new();
        for (i, comp) in self.component_specs.iter().enumerate() {
            let field = |f: &str| format!("spec.componentSpecs[{i}].{f}");

            if comp.name.is_empty() {
                errors.push(SpecValidationError::new(
                    field("name"),
                    "component name must not be empty",
                    "Give every component a unique name.",
                ));
            } else if seen.insert(comp.name.clone(), i).is_some() {
                errors.push(SpecValidationError::new(
                    field("name"),
                    format!("duplicate component name {}", comp.name),
                    "Give every component a unique name.",
                ));
            }

            if comp.replicas < 0 {
                errors.push(SpecValidationError::new(
                    field("replicas"),
                    "replicas must not be negative",
                    "Set replicas to 0 or more.",
                ));
            }

            if comp.workload_type == WorkloadType::Stateless
                && !comp.volume_claim_templates.is_empty()
            {
                errors.push(SpecValidationError::new(
                    field("volumeClaimTemplates"),
                    "Stateless components cannot declare volumes",
                    "Use workloadType Stateful, or remove volumeClaimTemplates.",
                ));
            }

            for (j, vct) in comp.volume_claim_templates.iter().enumerate() {
                if parse_quantity(&vct.storage).is_err() {
                    errors.push(SpecValidationError::new(
                        field(&format!("volumeClaimTemplates[{j}].storage")),
                        format!("invalid storage quantity {:?}", vct.storage),
                        "Use a Kubernetes quantity such as 20Gi.",
                    ));
                }
            }

            if let Some(pdb) = &comp.pod_disruption_budget {
                if pdb.min_available.is_none() {
                    errors.push(SpecValidationError::new(
                        field("podDisruptionBudget.minAvailable"),
                        "minAvailable is required when a PodDisruptionBudget is requested",
                        "Set podDisruptionBudget.minAvailable or remove podDisruptionBudget.",
                    ));
                }
            }

            if let Some(policy) = &comp.horizontal_scale_policy {
                if policy.type_ == HScaleDataClonePolicy::CloneVolume
                    && comp.volume_claim_templates.is_empty()
                {
                    errors.push(SpecValidationError::new(
                        field("horizontalScalePolicy.type"),
                        "CloneVolume requires at least one volume claim template",
                        "Add a volume claim template or set the policy type to None.",
                    ));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub components: BTreeMap<String, ComponentStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Cluster {
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// True when the latest spec has already been observed, so this pass only refreshes status.
    pub fn is_status_updating(&self) -> bool {
        !self.is_deleting()
            && self.status.as_ref().and_then(|s| s.observed_generation)
                == self.metadata.generation
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    pub fn component_status(&self, name: &str) -> Option<&ComponentStatus> {
        self.status.as_ref().and_then(|s| s.components.get(name))
    }

    /// Mutable component status, created lazily on first write
    pub fn component_status_mut(&mut self, name: &str) -> &mut ComponentStatus {
        self.status
            .get_or_insert_with(ClusterStatus::default)
            .components
            .entry(name.to_string())
            .or_default()
    }

    pub fn namespace_or_default(&self) -> String {
        self.namespace().unwrap_or_else(|| "default".to_string())
    }
}
