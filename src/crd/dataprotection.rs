//! Data-protection CRDs used by horizontal scale-out
//!
//! `Backup` objects are created by the data-clone engine and completed by the
//! data-protection controller. `BackupPolicy` tells which tool and volume a
//! backup uses; `BackupTool` carries the image and restore commands.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackupType {
    #[default]
    Datafile,
    Snapshot,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum BackupPhase {
    New,
    InProgress,
    Completed,
    Failed,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "dataprotection.replicadb.io",
    version = "v1alpha1",
    kind = "Backup",
    namespaced,
    status = "BackupStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.backupType"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BackupSpec {
    pub backup_policy_name: String,
    #[serde(default)]
    pub backup_type: BackupType,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<BackupPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_tool_name: Option<String>,
    /// PVC holding the backup artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "dataprotection.replicadb.io",
    version = "v1alpha1",
    kind = "BackupPolicy",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BackupPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup_tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_name: Option<String>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "dataprotection.replicadb.io",
    version = "v1alpha1",
    kind = "BackupTool"
)]
#[serde(rename_all = "camelCase")]
pub struct BackupToolSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub restore_commands: Vec<String>,
}

impl Backup {
    pub fn phase(&self) -> Option<BackupPhase> {
        self.status.as_ref().and_then(|s| s.phase)
    }
}
