//! Operational events
//!
//! The engine reports human-readable events ("start horizontal scale ...",
//! "BackupJobCreate", phase transitions) through [`EventRecorder`]. Events
//! are best effort: a failed write is logged and never fails the pass.

use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, warn};

use crate::crd::Cluster;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

pub const REASON_HORIZONTAL_SCALE: &str = "HorizontalScale";
pub const REASON_BACKUP_JOB_CREATE: &str = "BackupJobCreate";
pub const REASON_BACKUP_JOB_DELETE: &str = "BackupJobDelete";
pub const REASON_PHASE_TRANSITION: &str = "ComponentPhaseTransition";
pub const REASON_VOLUME_EXPANSION_FAILED: &str = "VolumeExpansionFailed";
pub const REASON_MEMBER_LEAVE_FAILED: &str = "MemberLeaveFailed";
pub const REASON_APPLY_RESOURCES_FAILED: &str = "ApplyResourcesFailed";
pub const REASON_WAITING_FOR_PROBE: &str = "WaitingForProbeSuccess";
pub const REASON_RESTART_POD: &str = "RestartPod";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub type_: String,
    pub reason: String,
    pub message: String,
}

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, cluster: &Cluster, type_: &str, reason: &str, message: &str);

    async fn normal(&self, cluster: &Cluster, reason: &str, message: &str) {
        self.record(cluster, EVENT_TYPE_NORMAL, reason, message).await
    }

    async fn warning(&self, cluster: &Cluster, reason: &str, message: &str) {
        self.record(cluster, EVENT_TYPE_WARNING, reason, message).await
    }
}

/// Writes `core/v1` Events against the cluster object
pub struct KubeEventRecorder {
    client: Client,
}

impl KubeEventRecorder {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn build_event(cluster: &Cluster, type_: &str, reason: &str, message: &str) -> Event {
    let time = chrono::Utc::now();
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-event-", cluster.name_any())),
            namespace: Some(cluster.namespace_or_default()),
            ..Default::default()
        },
        type_: Some(type_.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: cluster.object_ref(&()),
        first_timestamp: Some(Time(time)),
        last_timestamp: Some(Time(time)),
        count: Some(1),
        ..Default::default()
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(&self, cluster: &Cluster, type_: &str, reason: &str, message: &str) {
        let events: Api<Event> = Api::namespaced(self.client.clone(), &cluster.namespace_or_default());
        let event = build_event(cluster, type_, reason, message);
        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!("Failed to emit {} event for {}: {:?}", reason, cluster.name_any(), e);
        }
    }
}

/// Keeps events in memory. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryEventRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[async_trait]
impl EventRecorder for MemoryEventRecorder {
    async fn record(&self, cluster: &Cluster, type_: &str, reason: &str, message: &str) {
        debug!("event {} on {}: {}", reason, cluster.name_any(), message);
        let event = RecordedEvent {
            type_: type_.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        };
        match self.events.lock() {
            Ok(mut events) => events.push(event),
            Err(poisoned) => poisoned.into_inner().push(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ClusterSpec;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("db", ClusterSpec::default());
        cluster.metadata.namespace = Some("prod".to_string());
        cluster
    }

    #[test]
    fn test_build_event_targets_cluster() {
        let event = build_event(&cluster(), EVENT_TYPE_NORMAL, REASON_HORIZONTAL_SCALE, "3 -> 5");
        assert_eq!(event.metadata.generate_name.as_deref(), Some("db-event-"));
        assert_eq!(event.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(event.involved_object.kind.as_deref(), Some("Cluster"));
        assert_eq!(event.count, Some(1));
    }

    #[tokio::test]
    async fn test_memory_recorder_keeps_order() {
        let recorder = MemoryEventRecorder::new();
        let cluster = cluster();
        recorder
            .normal(&cluster, REASON_HORIZONTAL_SCALE, "start")
            .await;
        recorder
            .warning(&cluster, REASON_VOLUME_EXPANSION_FAILED, "shrink")
            .await;
        assert_eq!(
            recorder.reasons(),
            vec![REASON_HORIZONTAL_SCALE, REASON_VOLUME_EXPANSION_FAILED]
        );
        assert_eq!(recorder.events()[1].type_, EVENT_TYPE_WARNING);
    }
}
