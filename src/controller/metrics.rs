//! Prometheus metrics for the ReplicaDB operator
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports:
//! - `replicadb_reconcile_duration_seconds` (histogram): pass duration labeled by controller.
//! - `replicadb_reconciles_total` (counter): passes labeled by controller.
//! - `replicadb_reconcile_errors_total` (counter): failed passes labeled by controller and kind.
//! - `replicadb_apply_failures_total` (counter): graphs the applier could not write, per cluster.
//! - `replicadb_component_phase` (gauge): 1 for the current phase of a component, 0 for the others.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

use crate::crd::ComponentPhase;
use crate::error::{Error, Result};

pub const CONTROLLER_CLUSTER: &str = "cluster";

const PHASES: [ComponentPhase; 8] = [
    ComponentPhase::Creating,
    ComponentPhase::Running,
    ComponentPhase::Updating,
    ComponentPhase::Stopping,
    ComponentPhase::Stopped,
    ComponentPhase::Deleting,
    ComponentPhase::Abnormal,
    ComponentPhase::Failed,
];

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub controller: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub controller: String,
    /// Error category, e.g. "kube", "conflict", "domain"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub namespace: String,
    pub cluster: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ComponentPhaseLabels {
    pub namespace: String,
    pub cluster: String,
    pub component: String,
    pub phase: String,
}

pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 1ms .. ~32s across 16 buckets.
        Histogram::new(exponential_buckets(0.001, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static RECONCILES_TOTAL: Lazy<Family<ReconcileLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static APPLY_FAILURES_TOTAL: Lazy<Family<ClusterLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static COMPONENT_PHASE: Lazy<Family<ComponentPhaseLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Global metrics registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();
    registry.register(
        "replicadb_reconcile_duration_seconds",
        "Duration of reconcile passes in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "replicadb_reconciles",
        "Total number of reconcile passes",
        RECONCILES_TOTAL.clone(),
    );
    registry.register(
        "replicadb_reconcile_errors",
        "Total number of failed reconcile passes",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "replicadb_apply_failures",
        "Total number of object graphs that could not be applied",
        APPLY_FAILURES_TOTAL.clone(),
    );
    registry.register(
        "replicadb_component_phase",
        "Current phase of each component (1 for the current phase)",
        COMPONENT_PHASE.clone(),
    );
    registry
});

/// Observe a reconcile duration in seconds.
pub fn observe_reconcile_duration_seconds(controller: &str, seconds: f64) {
    let labels = ReconcileLabels {
        controller: controller.to_string(),
    };
    RECONCILES_TOTAL.get_or_create(&labels).inc();
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Count a failed pass. Delayed requeues are not failures and are skipped.
pub fn inc_reconcile_error(controller: &str, error: &Error) {
    if error.requeue_after().is_some() {
        return;
    }
    let labels = ErrorLabels {
        controller: controller.to_string(),
        kind: error.kind().to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_apply_failure(namespace: &str, cluster: &str) {
    let labels = ClusterLabels {
        namespace: namespace.to_string(),
        cluster: cluster.to_string(),
    };
    APPLY_FAILURES_TOTAL.get_or_create(&labels).inc();
}

/// Set the phase gauge of one component; an empty phase zeroes every series
pub fn set_component_phase(
    namespace: &str,
    cluster: &str,
    component: &str,
    phase: Option<ComponentPhase>,
) {
    for candidate in PHASES {
        let labels = ComponentPhaseLabels {
            namespace: namespace.to_string(),
            cluster: cluster.to_string(),
            component: component.to_string(),
            phase: candidate.to_string(),
        };
        let value = i64::from(phase == Some(candidate));
        COMPONENT_PHASE.get_or_create(&labels).set(value);
    }
}

/// Text exposition of [`REGISTRY`]
pub fn encode_registry() -> Result<String> {
    let mut buffer = String::new();
    encode(&mut buffer, &REGISTRY)
        .map_err(|e| Error::ConfigError(format!("encode metrics: {e}")))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn phase_value(cluster: &str, phase: ComponentPhase) -> i64 {
        COMPONENT_PHASE
            .get_or_create(&ComponentPhaseLabels {
                namespace: "default".to_string(),
                cluster: cluster.to_string(),
                component: "mysql".to_string(),
                phase: phase.to_string(),
            })
            .get()
    }

    #[test]
    fn test_component_phase_is_one_hot() {
        set_component_phase("default", "gauge-db", "mysql", Some(ComponentPhase::Creating));
        set_component_phase("default", "gauge-db", "mysql", Some(ComponentPhase::Running));
        assert_eq!(phase_value("gauge-db", ComponentPhase::Running), 1);
        assert_eq!(phase_value("gauge-db", ComponentPhase::Creating), 0);

        set_component_phase("default", "gauge-db", "mysql", None);
        assert!(PHASES.iter().all(|p| phase_value("gauge-db", *p) == 0));
    }

    #[test]
    fn test_delayed_requeue_is_not_an_error() {
        let labels = ErrorLabels {
            controller: "requeue-test".to_string(),
            kind: "requeue".to_string(),
        };
        inc_reconcile_error(
            "requeue-test",
            &Error::DelayedRequeue {
                after: Duration::from_secs(10),
                reason: "roles pending".to_string(),
            },
        );
        assert_eq!(RECONCILE_ERRORS_TOTAL.get_or_create(&labels).get(), 0);

        inc_reconcile_error("requeue-test", &Error::InvalidGraph("cycle".to_string()));
        let labels = ErrorLabels {
            controller: "requeue-test".to_string(),
            kind: "graph".to_string(),
        };
        assert_eq!(RECONCILE_ERRORS_TOTAL.get_or_create(&labels).get(), 1);
    }

    #[test]
    fn test_registry_exports_every_family() {
        inc_apply_failure("default", "export-db");
        observe_reconcile_duration_seconds("export-test", 0.02);
        let text = encode_registry().unwrap();
        assert!(text.contains("replicadb_apply_failures_total{namespace=\"default\",cluster=\"export-db\"} 1"));
        assert!(text.contains("replicadb_reconcile_duration_seconds"));
        assert!(text.contains("replicadb_reconciles_total"));
        assert!(text.contains("replicadb_component_phase"));
    }
}
