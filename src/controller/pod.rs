//! Pod inspection for the phase engine
//!
//! Readiness, role labels and failure detection. A pod is only reported as
//! failed once the relevant pod condition has been in place for longer than
//! the configured timeout; before that the engine just looks again later.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod, PodCondition};
use kube::ResourceExt;

use super::config::EngineConfig;
use super::object::ObjectKind;
use super::resources::{component_selector, LABEL_ROLE};
use super::store::{list_typed, Store};
use crate::crd::{Cluster, ClusterComponentSpec, ComponentMessageMap};
use crate::error::{Error, Result};

const CONDITION_POD_SCHEDULED: &str = "PodScheduled";
const CONDITION_INITIALIZED: &str = "Initialized";
const CONDITION_CONTAINERS_READY: &str = "ContainersReady";
const CONDITION_READY: &str = "Ready";

pub async fn list_component_pods(
    store: &dyn Store,
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
) -> Result<Vec<Pod>> {
    let namespace = cluster.namespace_or_default();
    list_typed::<Pod>(store, Some(&namespace), &component_selector(cluster, comp)).await
}

fn condition<'a>(pod: &'a Pod, type_: &str) -> Option<&'a PodCondition> {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == type_))
}

pub fn is_pod_ready(pod: &Pod) -> bool {
    condition(pod, CONDITION_READY).is_some_and(|c| c.status == "True")
}

/// Role label set by the role probe; `None` when absent or empty
pub fn pod_role(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_ROLE))
        .map(String::as_str)
        .filter(|r| !r.is_empty())
}

/// Ordinal parsed from the `-<n>` suffix of a StatefulSet pod name
pub fn pod_ordinal(pod: &Pod) -> Option<i32> {
    pod.metadata
        .name
        .as_deref()
        .and_then(|n| n.rsplit_once('-'))
        .and_then(|(_, ord)| ord.parse().ok())
}

/// Why a pod is failing and whether it has been failing long enough
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodFailure {
    pub message: String,
    pub timed_out: bool,
}

fn elapsed(condition: Option<&PodCondition>, timeout: std::time::Duration, now: DateTime<Utc>) -> bool {
    let Some(since) = condition.and_then(|c| c.last_transition_time.as_ref()) else {
        return false;
    };
    match chrono::Duration::from_std(timeout) {
        Ok(timeout) => since.0 + timeout < now,
        Err(_) => false,
    }
}

fn container_failure(statuses: Option<&Vec<ContainerStatus>>) -> Option<String> {
    statuses?.iter().find_map(|s| {
        let state = s.state.as_ref()?;
        let waiting = state.waiting.as_ref().and_then(|w| w.message.clone());
        let terminated = state.terminated.as_ref().and_then(|t| t.message.clone());
        waiting
            .or(terminated)
            .filter(|m| !m.is_empty())
    })
}

/// Failure of a single pod at `now`, checked in order: scheduling, init
/// containers, then containers.
pub fn pod_failure(pod: &Pod, config: &EngineConfig, now: DateTime<Utc>) -> Option<PodFailure> {
    let scheduled = condition(pod, CONDITION_POD_SCHEDULED);
    if let Some(c) = scheduled {
        if c.status != "True" {
            return Some(PodFailure {
                message: c.message.clone().unwrap_or_default(),
                timed_out: elapsed(scheduled, config.pod_scheduled_failed_timeout, now),
            });
        }
    }

    let status = pod.status.as_ref()?;
    if let Some(message) = container_failure(status.init_container_statuses.as_ref()) {
        return Some(PodFailure {
            message,
            timed_out: elapsed(
                condition(pod, CONDITION_INITIALIZED),
                config.pod_container_failed_timeout,
                now,
            ),
        });
    }
    if let Some(message) = container_failure(status.container_statuses.as_ref()) {
        return Some(PodFailure {
            message,
            timed_out: elapsed(
                condition(pod, CONDITION_CONTAINERS_READY),
                config.pod_container_failed_timeout,
                now,
            ),
        });
    }
    None
}

/// Result of scanning every pod of a component for failures
#[derive(Debug, Default)]
pub struct FailedPods {
    /// `Pod/<name>` messages of the pods that failed past their timeout
    pub messages: ComponentMessageMap,
    pub has_timed_out: bool,
    /// Set when pods are failing but none has timed out yet
    pub requeue: Option<Error>,
}

pub fn check_failed_pods(pods: &[Pod], config: &EngineConfig, now: DateTime<Utc>) -> FailedPods {
    let mut result = FailedPods::default();
    let mut failing = false;
    for pod in pods {
        let Some(failure) = pod_failure(pod, config, now) else {
            continue;
        };
        failing = true;
        if failure.timed_out {
            result.has_timed_out = true;
            result
                .messages
                .set_object_message(ObjectKind::Pod.as_str(), &pod.name_any(), failure.message);
        }
    }
    if failing && !result.has_timed_out {
        result.requeue = Some(Error::DelayedRequeue {
            after: config.failed_pod_requeue_after,
            reason: "pods are failing but have not timed out".to_string(),
        });
    }
    result
}
