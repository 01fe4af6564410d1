//! Cluster condition helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::{Cluster, ClusterStatus, ComponentPhase, Condition};

pub const CONDITION_TYPE_APPLY_RESOURCES: &str = "ApplyResources";
pub const CONDITION_TYPE_READY: &str = "Ready";
pub const CONDITION_TYPE_PROGRESSING: &str = "Progressing";
pub const CONDITION_TYPE_DEGRADED: &str = "Degraded";

pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

pub const REASON_APPLY_SUCCEEDED: &str = "ApplyResourcesSucceed";
pub const REASON_APPLY_FAILED: &str = "ApplyResourcesFailed";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status flips.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
    generation: Option<i64>,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status != status {
            existing.last_transition_time = now;
        }
        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();
        existing.observed_generation = generation;
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: generation,
        });
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Record the outcome of applying the object graph
pub fn set_apply_resources_condition(cluster: &mut Cluster, error: Option<&str>) {
    let generation = cluster.metadata.generation;
    let status = cluster.status.get_or_insert_with(ClusterStatus::default);
    match error {
        None => set_condition(
            &mut status.conditions,
            CONDITION_TYPE_APPLY_RESOURCES,
            CONDITION_STATUS_TRUE,
            REASON_APPLY_SUCCEEDED,
            "Successfully applied for resources",
            generation,
        ),
        Some(message) => set_condition(
            &mut status.conditions,
            CONDITION_TYPE_APPLY_RESOURCES,
            CONDITION_STATUS_FALSE,
            REASON_APPLY_FAILED,
            message,
            generation,
        ),
    }
}

/// Derive Ready/Progressing/Degraded from the component phases
pub fn refresh_summary_conditions(cluster: &mut Cluster) {
    let generation = cluster.metadata.generation;
    let Some(status) = cluster.status.as_mut() else {
        return;
    };
    let phases: Vec<Option<ComponentPhase>> = status.components.values().map(|c| c.phase).collect();
    if phases.is_empty() {
        return;
    }

    let ready = phases
        .iter()
        .all(|p| matches!(p, Some(ComponentPhase::Running) | Some(ComponentPhase::Stopped)));
    let progressing = phases
        .iter()
        .any(|p| matches!(p, None | Some(ComponentPhase::Creating) | Some(ComponentPhase::Updating)));
    let degraded: Vec<&str> = status
        .components
        .iter()
        .filter(|(_, c)| c.phase.is_some_and(|p| p.is_failed_or_abnormal()))
        .map(|(name, _)| name.as_str())
        .collect();
    let degraded_message = if degraded.is_empty() {
        "No degradation detected".to_string()
    } else {
        format!("Components not healthy: {}", degraded.join(", "))
    };

    let flag = |b: bool| if b { CONDITION_STATUS_TRUE } else { CONDITION_STATUS_FALSE };
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_READY,
        flag(ready),
        if ready { "AllComponentsRunning" } else { "ComponentsNotRunning" },
        "",
        generation,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_PROGRESSING,
        flag(progressing),
        if progressing { "ComponentsChanging" } else { "ComponentsSettled" },
        "",
        generation,
    );
    set_condition(
        &mut status.conditions,
        CONDITION_TYPE_DEGRADED,
        flag(!degraded.is_empty()),
        if degraded.is_empty() { "NoIssues" } else { "ComponentsUnhealthy" },
        &degraded_message,
        generation,
    );
}
