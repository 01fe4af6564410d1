//! Phase engine
//!
//! Derives the lifecycle phase of a component from workload readiness and
//! pod signals. Each workload type answers three questions differently:
//! is the workload running, which phase applies once every pod is ready
//! (role probe timeout), and which phase applies while pods are not ready.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;

use super::config::EngineConfig;
use super::object::ObjectKind;
use super::pod::{check_failed_pods, is_pod_ready, pod_role};
use super::workload::Workload;
use crate::crd::{
    Cluster, ClusterComponentSpec, ComponentMessageMap, ComponentPhase, ComponentStatus,
    ConsensusMemberStatus, ConsensusSetStatus, ReplicationMemberStatus, ReplicationSetStatus,
    WorkloadType,
};
use crate::error::{Error, Result};

pub const ROLE_PRIMARY: &str = "primary";
pub const ROLE_SECONDARY: &str = "secondary";

const ROLE_PROBE_TIMEOUT_MESSAGE: &str =
    "Role probe timeout, check whether the application is available";

/// Role a pod must carry to count as the group's writer
fn leader_role(comp: &ClusterComponentSpec) -> Option<String> {
    match comp.workload_type {
        WorkloadType::Consensus => Some(comp.consensus_spec_or_default().leader.name),
        WorkloadType::Replication => Some(ROLE_PRIMARY.to_string()),
        WorkloadType::Stateful | WorkloadType::Stateless => None,
    }
}

pub fn is_running(comp: &ClusterComponentSpec, workload: &Workload, pods: &[Pod]) -> bool {
    if !workload.is_ready(comp.replicas) {
        return false;
    }
    if comp.workload_type.has_roles() {
        return pods.len() as i32 == comp.replicas
            && pods.iter().all(|p| is_pod_ready(p) && pod_role(p).is_some());
    }
    true
}

/// `None` when the component declares no replicas
pub fn pods_ready(comp: &ClusterComponentSpec, workload: &Workload) -> Option<bool> {
    if comp.replicas == 0 {
        return None;
    }
    Some(workload.pods_ready(comp.replicas))
}

/// Phase once every pod is ready but the workload is not running yet.
///
/// Only role-carrying workloads can be stuck here; the phase stays empty
/// until the role probe timeout has elapsed since pods became ready.
pub fn phase_when_pods_ready(
    comp: &ClusterComponentSpec,
    pods: &[Pod],
    status: &ComponentStatus,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> (Option<ComponentPhase>, ComponentMessageMap) {
    let mut messages = ComponentMessageMap::new();
    let Some(leader) = leader_role(comp) else {
        return (None, messages);
    };

    let timeout = comp.role_probe_timeout(config.role_probe_timeout_after_pods_ready);
    let since = status.pods_ready_since().unwrap_or(now);
    let timed_out = match chrono::Duration::from_std(timeout) {
        Ok(timeout) => since + timeout <= now,
        Err(_) => false,
    };
    if !timed_out {
        return (None, messages);
    }

    let mut phase = None;
    for pod in pods {
        if pod_role(pod).is_none() {
            phase = Some(ComponentPhase::Abnormal);
            messages.set_object_message(
                ObjectKind::Pod.as_str(),
                &pod.name_any(),
                ROLE_PROBE_TIMEOUT_MESSAGE,
            );
        }
    }
    if !pods.iter().any(|p| pod_role(p) == Some(leader.as_str())) {
        phase = Some(ComponentPhase::Failed);
    }
    (phase, messages)
}

/// Phase while some pods are not ready
pub fn phase_when_pods_not_ready(
    comp: &ClusterComponentSpec,
    workload: &Workload,
    pods: &[Pod],
) -> Option<ComponentPhase> {
    let replicas = comp.replicas;
    let available = workload.available_replicas();
    if pods.is_empty() || available == 0 {
        return if replicas == 0 {
            None
        } else {
            Some(ComponentPhase::Failed)
        };
    }
    // a pod on its way out will be replaced; judge again afterwards
    if pods.iter().any(|p| p.metadata.deletion_timestamp.is_some()) {
        return None;
    }

    let has_failed_pod = pods
        .iter()
        .any(|p| !is_pod_ready(p) && workload.is_pod_of_latest_revision(p));
    if !has_failed_pod {
        return None;
    }

    let leader_ready = match leader_role(comp) {
        Some(leader) => pods
            .iter()
            .any(|p| is_pod_ready(p) && pod_role(p) == Some(leader.as_str())),
        None => true,
    };
    if !leader_ready {
        return Some(ComponentPhase::Failed);
    }

    let consistent = workload.replicas() == replicas
        && pods.len() as i32 == replicas
        && available == replicas;
    if consistent {
        None
    } else {
        Some(ComponentPhase::Abnormal)
    }
}

/// Rebuild the role sub-status of Consensus and Replication components
pub fn rebuild_role_status(
    comp: &ClusterComponentSpec,
    pods: &[Pod],
    status: &mut ComponentStatus,
) -> Result<()> {
    match comp.workload_type {
        WorkloadType::Consensus => {
            status.consensus_set_status = Some(consensus_status(comp, pods)?);
        }
        WorkloadType::Replication => {
            status.replication_set_status = Some(replication_status(comp, pods)?);
        }
        WorkloadType::Stateful | WorkloadType::Stateless => {}
    }
    Ok(())
}

fn consensus_status(comp: &ClusterComponentSpec, pods: &[Pod]) -> Result<ConsensusSetStatus> {
    let spec = comp.consensus_spec_or_default();
    let mut status = ConsensusSetStatus {
        leader: ConsensusMemberStatus::unknown(&spec.leader),
        followers: Vec::new(),
        learner: None,
    };
    let mut pods: Vec<&Pod> = pods.iter().collect();
    pods.sort_by_key(|p| p.name_any());

    for pod in pods {
        let Some(role) = pod_role(pod) else {
            continue;
        };
        if role == spec.leader.name {
            if status.leader.pod != crate::crd::DEFAULT_POD_NAME {
                return Err(Error::InvalidGraph(format!(
                    "component {} has more than one leader: {} and {}",
                    comp.name,
                    status.leader.pod,
                    pod.name_any()
                )));
            }
            status.leader.pod = pod.name_any();
        } else if let Some(follower) = spec.followers.iter().find(|f| f.name == role) {
            status.followers.push(ConsensusMemberStatus {
                name: follower.name.clone(),
                access_mode: follower.access_mode,
                pod: pod.name_any(),
            });
        } else if let Some(learner) = spec.learner.as_ref().filter(|l| l.name == role) {
            status.learner = Some(ConsensusMemberStatus {
                name: learner.name.clone(),
                access_mode: learner.access_mode,
                pod: pod.name_any(),
            });
        }
    }
    Ok(status)
}

fn replication_status(comp: &ClusterComponentSpec, pods: &[Pod]) -> Result<ReplicationSetStatus> {
    let mut status = ReplicationSetStatus {
        primary: ReplicationMemberStatus {
            pod: crate::crd::DEFAULT_POD_NAME.to_string(),
        },
        secondaries: Vec::new(),
    };
    let mut pods: Vec<&Pod> = pods.iter().collect();
    pods.sort_by_key(|p| p.name_any());

    for pod in pods {
        match pod_role(pod) {
            Some(ROLE_PRIMARY) => {
                if status.primary.pod != crate::crd::DEFAULT_POD_NAME {
                    return Err(Error::InvalidGraph(format!(
                        "component {} has more than one primary: {} and {}",
                        comp.name,
                        status.primary.pod,
                        pod.name_any()
                    )));
                }
                status.primary.pod = pod.name_any();
            }
            Some(ROLE_SECONDARY) => status.secondaries.push(ReplicationMemberStatus {
                pod: pod.name_any(),
            }),
            _ => {}
        }
    }
    Ok(status)
}

/// Outcome of evaluating the workload of one component
#[derive(Debug, Default)]
pub struct WorkloadPhase {
    pub is_running: bool,
    pub pods_ready: Option<bool>,
    pub has_failed_pod_timed_out: bool,
    /// `None` leaves the current phase untouched
    pub phase: Option<ComponentPhase>,
    pub messages: ComponentMessageMap,
    /// Pods are ready but the role probe has not timed out yet
    pub waiting_for_probe: bool,
    pub requeue: Option<Error>,
}

impl WorkloadPhase {
    pub fn transition_message(&self) -> String {
        let pods_ready = match self.pods_ready {
            Some(ready) => ready.to_string(),
            None => "nil".to_string(),
        };
        format!(
            "Running: {}, PodsReady: {}, PodsTimedout: {}",
            self.is_running, pods_ready, self.has_failed_pod_timed_out
        )
    }
}

/// Evaluate the phase a component's workload implies right now.
///
/// Pod failures are only inspected when the workload was built from the
/// cluster's current generation; a workload still catching up with a spec
/// change would otherwise flap the phase mid rollout.
pub fn evaluate_workload_phase(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    workload: &Workload,
    pods: &[Pod],
    previous: &ComponentStatus,
    config: &EngineConfig,
    now: DateTime<Utc>,
) -> WorkloadPhase {
    let mut result = WorkloadPhase {
        is_running: is_running(comp, workload, pods),
        pods_ready: pods_ready(comp, workload),
        ..Default::default()
    };

    if !result.is_running && result.pods_ready != Some(true) && workload.is_latest(cluster) {
        let failed = check_failed_pods(pods, config, now);
        result.has_failed_pod_timed_out = failed.has_timed_out;
        result.messages.merge(&failed.messages);
        result.requeue = failed.requeue;
    }

    if result.is_running {
        result.phase = Some(if comp.replicas == 0 {
            ComponentPhase::Stopped
        } else {
            ComponentPhase::Running
        });
    } else if result.pods_ready == Some(true) {
        let (phase, messages) = phase_when_pods_ready(comp, pods, previous, config, now);
        result.messages.merge(&messages);
        result.phase = phase;
        if phase.is_none() {
            result.waiting_for_probe = true;
            result.requeue = Some(Error::DelayedRequeue {
                after: config.probe_requeue_after,
                reason: format!("waiting for role probe of component {}", comp.name),
            });
        }
    } else if result.has_failed_pod_timed_out || previous.is_up_running() {
        result.phase = phase_when_pods_not_ready(comp, workload, pods);
    }
    result
}
