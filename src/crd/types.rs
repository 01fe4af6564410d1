//! Shared types for the ReplicaDB CRDs
//!
//! Component spec building blocks (workload type, volume templates, probes,
//! scale policy) and the per-component status persisted on the Cluster.

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Workload type of a component
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum WorkloadType {
    /// Deployment-backed, no stable identity or storage
    Stateless,
    /// StatefulSet-backed, no roles
    #[default]
    Stateful,
    /// StatefulSet-backed consensus group with a single leader
    Consensus,
    /// StatefulSet-backed primary/secondary replication
    Replication,
}

impl WorkloadType {
    /// Whether members carry a role label that must be probed
    pub fn has_roles(&self) -> bool {
        matches!(self, WorkloadType::Consensus | WorkloadType::Replication)
    }
}

impl fmt::Display for WorkloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadType::Stateless => write!(f, "Stateless"),
            WorkloadType::Stateful => write!(f, "Stateful"),
            WorkloadType::Consensus => write!(f, "Consensus"),
            WorkloadType::Replication => write!(f, "Replication"),
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeType {
    Data,
    Log,
}

/// Volume claim template of a component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,

    /// Requested storage size (e.g. "20Gi")
    pub storage: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<VolumeType>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProbeConfig {
    /// Seconds to wait for role labels after all pods are ready. Zero means the operator default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_probe_timeout_after_pods_ready: Option<u32>,
}

/// How data is cloned into the volumes of new replicas
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum HScaleDataClonePolicy {
    /// Create empty volumes
    #[default]
    None,
    /// Clone from a volume snapshot, falling back to a backup tool
    CloneVolume,
    /// Legacy snapshot policy, rejected at scale-out
    Snapshot,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HorizontalScalePolicy {
    #[serde(default, rename = "type")]
    pub type_: HScaleDataClonePolicy,

    /// Name of the backup policy template used to find backup policies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_policy_template: Option<String>,

    /// Volume claim template whose data is cloned. Defaults to the data volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mounts_name: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum AccessMode {
    #[default]
    None,
    Readonly,
    ReadWrite,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusMember {
    /// Role name, matched against the pod role label
    pub name: String,
    #[serde(default)]
    pub access_mode: AccessMode,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSetSpec {
    pub leader: ConsensusMember,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followers: Vec<ConsensusMember>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner: Option<ConsensusMember>,
}

impl Default for ConsensusSetSpec {
    fn default() -> Self {
        Self {
            leader: ConsensusMember {
                name: "leader".to_string(),
                access_mode: AccessMode::ReadWrite,
            },
            followers: vec![ConsensusMember {
                name: "follower".to_string(),
                access_mode: AccessMode::Readonly,
            }],
            learner: None,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PdbSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<serde_json::Value>")]
    pub min_available: Option<IntOrString>,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle phase of a component. An empty phase is `Option::None`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum ComponentPhase {
    Creating,
    Running,
    /// Spec changes are being reconciled
    Updating,
    Stopping,
    Stopped,
    Deleting,
    Abnormal,
    Failed,
}

impl ComponentPhase {
    /// Phases that mean the component was up at some point
    pub fn is_up_running(&self) -> bool {
        matches!(
            self,
            ComponentPhase::Running | ComponentPhase::Abnormal | ComponentPhase::Failed
        )
    }

    pub fn is_failed_or_abnormal(&self) -> bool {
        matches!(self, ComponentPhase::Abnormal | ComponentPhase::Failed)
    }
}

impl fmt::Display for ComponentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentPhase::Creating => "Creating",
            ComponentPhase::Running => "Running",
            ComponentPhase::Updating => "Updating",
            ComponentPhase::Stopping => "Stopping",
            ComponentPhase::Stopped => "Stopped",
            ComponentPhase::Deleting => "Deleting",
            ComponentPhase::Abnormal => "Abnormal",
            ComponentPhase::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

/// Messages keyed by `<Kind>/<name>` of the object that caused them
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct ComponentMessageMap(pub BTreeMap<String, String>);

impl ComponentMessageMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(kind: &str, name: &str) -> String {
        format!("{kind}/{name}")
    }

    pub fn set_object_message(&mut self, kind: &str, name: &str, message: impl Into<String>) {
        self.0.insert(Self::key(kind, name), message.into());
    }

    pub fn get_object_message(&self, kind: &str, name: &str) -> Option<&str> {
        self.0.get(&Self::key(kind, name)).map(String::as_str)
    }

    /// Union with `other`; entries of `other` replace entries with the same key.
    pub fn merge(&mut self, other: &ComponentMessageMap) {
        for (k, v) in &other.0 {
            self.0.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

pub const DEFAULT_POD_NAME: &str = "Unknown";

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusMemberStatus {
    pub name: String,
    pub access_mode: AccessMode,
    pub pod: String,
}

impl ConsensusMemberStatus {
    pub fn unknown(member: &ConsensusMember) -> Self {
        Self {
            name: member.name.clone(),
            access_mode: member.access_mode,
            pod: DEFAULT_POD_NAME.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusSetStatus {
    pub leader: ConsensusMemberStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub followers: Vec<ConsensusMemberStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learner: Option<ConsensusMemberStatus>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationMemberStatus {
    pub pod: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSetStatus {
    pub primary: ReplicationMemberStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secondaries: Vec<ReplicationMemberStatus>,
}

/// Status of one component, keyed by component name on the Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<ComponentPhase>,

    #[serde(default, skip_serializing_if = "ComponentMessageMap::is_empty")]
    pub message: ComponentMessageMap,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready: Option<bool>,

    /// RFC 3339 time at which all pods last became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods_ready_time: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_set_status: Option<ConsensusSetStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_set_status: Option<ReplicationSetStatus>,
}

impl ComponentStatus {
    pub fn is_up_running(&self) -> bool {
        self.phase.map(|p| p.is_up_running()).unwrap_or(false)
    }

    pub fn set_object_message(&mut self, kind: &str, name: &str, message: impl Into<String>) {
        self.message.set_object_message(kind, name, message);
    }

    /// Record pod readiness, keeping `podsReadyTime` in step with false→true transitions.
    pub fn set_pods_ready(&mut self, ready: Option<bool>, now: chrono::DateTime<chrono::Utc>) {
        if ready != Some(true) {
            self.pods_ready_time = None;
        } else if self.pods_ready != Some(true) {
            self.pods_ready_time = Some(now.to_rfc3339());
        }
        self.pods_ready = ready;
    }

    pub fn pods_ready_since(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        self.pods_ready_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&chrono::Utc))
    }
}

/// Condition for status reporting (Kubernetes convention)
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "ApplyResources")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Set the observed generation for this condition
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}
