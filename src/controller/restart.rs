//! Serial restart of Consensus members
//!
//! Consensus StatefulSets use the `OnDelete` update strategy, so a new pod
//! template only reaches a replica when the operator deletes its pod. Pods
//! are restarted one at a time, lowest role priority first and the leader
//! last, and only after the previous one came back ready on the new revision.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::info;

use super::graph::{Action, ObjectGraph, Vertex, VertexId};
use super::pod::{is_pod_ready, pod_ordinal, pod_role};
use super::workload::Workload;
use crate::crd::{AccessMode, ClusterComponentSpec, ConsensusSetSpec, WorkloadType};

const LEADER_PRIORITY: u8 = 1 << 5;
const FOLLOWER_READ_WRITE_PRIORITY: u8 = 1 << 4;
const FOLLOWER_READONLY_PRIORITY: u8 = 1 << 3;
const FOLLOWER_NONE_PRIORITY: u8 = 1 << 2;
const LEARNER_PRIORITY: u8 = 1 << 1;
const EMPTY_PRIORITY: u8 = 1;
const UNKNOWN_PRIORITY: u8 = 0;

fn follower_priority(mode: AccessMode) -> u8 {
    match mode {
        AccessMode::None => FOLLOWER_NONE_PRIORITY,
        AccessMode::Readonly => FOLLOWER_READONLY_PRIORITY,
        AccessMode::ReadWrite => FOLLOWER_READ_WRITE_PRIORITY,
    }
}

/// Restart priority of a pod; lower restarts first
fn role_priority(spec: &ConsensusSetSpec, pod: &Pod) -> u8 {
    let Some(role) = pod_role(pod) else {
        return EMPTY_PRIORITY;
    };
    if role == spec.leader.name {
        return LEADER_PRIORITY;
    }
    if let Some(follower) = spec.followers.iter().find(|f| f.name == role) {
        return follower_priority(follower.access_mode);
    }
    if spec.learner.as_ref().is_some_and(|l| l.name == role) {
        return LEARNER_PRIORITY;
    }
    UNKNOWN_PRIORITY
}

/// Pods in restart order: unknown, empty, learner, followers, leader; ties by ordinal
pub fn restart_order<'p>(spec: &ConsensusSetSpec, pods: &'p [Pod]) -> Vec<&'p Pod> {
    let mut ordered: Vec<&Pod> = pods.iter().collect();
    ordered.sort_by_key(|p| (role_priority(spec, p), pod_ordinal(p).unwrap_or(i32::MAX)));
    ordered
}

/// The pod to delete next, if the restart can move on.
///
/// Waits while the workload controller has not observed the latest spec,
/// while a replica is missing or terminating, and while a restarted pod is
/// not ready yet.
pub fn next_pod_to_restart<'p>(
    comp: &ClusterComponentSpec,
    workload: &Workload,
    pods: &'p [Pod],
) -> Option<&'p Pod> {
    let Workload::StatefulSet(sts) = workload else {
        return None;
    };
    if comp.workload_type != WorkloadType::Consensus {
        return None;
    }
    let observed = sts.status.as_ref().and_then(|s| s.observed_generation);
    if sts.metadata.generation.is_none() || sts.metadata.generation != observed {
        return None;
    }
    if pods.len() != usize::try_from(workload.replicas()).unwrap_or_default() {
        return None;
    }

    let spec = comp.consensus_spec_or_default();
    for pod in restart_order(&spec, pods) {
        if pod.metadata.deletion_timestamp.is_some() {
            return None;
        }
        if workload.is_pod_of_latest_revision(pod) {
            if !is_pod_ready(pod) {
                return None;
            }
            continue;
        }
        return Some(pod);
    }
    None
}

/// Stage the deletion of the next stale pod below `workload`.
///
/// The pod is deleted as an orphan so the StatefulSet recreates it with its
/// claims untouched. Returns the name of the pod staged, if any.
pub fn stage_restart(
    graph: &mut ObjectGraph,
    workload: VertexId,
    comp: &ClusterComponentSpec,
    live: &Workload,
    pods: &[Pod],
) -> crate::error::Result<Option<String>> {
    let Some(pod) = next_pod_to_restart(comp, live, pods) else {
        return Ok(None);
    };
    info!(component = %comp.name, "Restarting pod {} on the new revision", pod.name_any());
    let mut vertex = Vertex::new(pod.clone().into(), Some(Action::Delete));
    vertex.orphan = true;
    graph.push_child(vertex, workload)?;
    Ok(Some(pod.name_any()))
}
