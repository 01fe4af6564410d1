//! Main reconciler for Cluster resources
//!
//! Implements the controller pattern using kube-rs runtime. Each pass reads
//! a snapshot of the owned objects, lets the component engine stage one
//! graph for the whole cluster and hands it to the applier. The cluster's
//! own status is the root vertex, so it is written after everything else.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Service};
use kube::{
    api::Api,
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        watcher::Config,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use super::applier::{ApplySummary, DryRunApplier, GraphApplier, StoreApplier};
use super::component::ComponentEngine;
use super::conditions::{refresh_summary_conditions, set_apply_resources_condition};
use super::config::EngineConfig;
use super::events::{KubeEventRecorder, REASON_APPLY_RESOURCES_FAILED};
use super::finalizers::{cleanup_cluster, CLUSTER_FINALIZER};
use super::graph::{Action as GraphAction, ObjectGraph, VertexId};
use super::member::MemberAgent;
#[cfg(feature = "metrics")]
use super::metrics;
use super::object::{Object, ObjectKind};
use super::resources::LABEL_COMPONENT_NAME;
use super::snapshot::{read_snapshot, Snapshot};
use super::store::KubeStore;
use crate::crd::{Cluster, ClusterStatus};
use crate::error::{Error, Result};

const REQUEUE_STEADY: Duration = Duration::from_secs(300);
const REQUEUE_NOT_LEADER: Duration = Duration::from_secs(5);

/// Shared state for the controller
pub struct ControllerState {
    pub client: Client,
    pub config: EngineConfig,
    pub member_agent: Arc<dyn MemberAgent>,
    /// Plan and log graphs without writing them
    pub dry_run: bool,
    pub is_leader: Arc<AtomicBool>,
}

/// Main entry point to start the controller
pub async fn run_controller(state: Arc<ControllerState>, namespace: Option<String>) -> Result<()> {
    let client = state.client.clone();
    let clusters: Api<Cluster> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    info!("Starting Cluster controller");

    match clusters.list(&Default::default()).await {
        Ok(_) => info!("Cluster CRD is available"),
        Err(e) => {
            error!("Cluster CRD not found. Please install the CRD first: {:?}", e);
            return Err(Error::ConfigError("Cluster CRD not installed".to_string()));
        }
    }

    Controller::new(clusters, Config::default())
        .owns::<StatefulSet>(Api::all(client.clone()), Config::default())
        .owns::<Deployment>(Api::all(client.clone()), Config::default())
        .owns::<Service>(Api::all(client.clone()), Config::default())
        .owns::<ConfigMap>(Api::all(client.clone()), Config::default())
        .owns::<PersistentVolumeClaim>(Api::all(client.clone()), Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("Reconciled: {:?}", obj),
                Err(e) => warn!("Reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// The main reconciliation function
///
/// Called whenever a Cluster or one of its owned objects changes, and when
/// the requeue timer expires.
#[instrument(skip(ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<Cluster>, ctx: Arc<ControllerState>) -> Result<Action> {
    #[cfg(feature = "metrics")]
    let started = std::time::Instant::now();

    if !ctx.is_leader.load(Ordering::Relaxed) {
        debug!("Not the leader, skipping {}", obj.name_any());
        return Ok(Action::requeue(REQUEUE_NOT_LEADER));
    }

    let namespace = obj.namespace_or_default();
    let api: Api<Cluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let store = KubeStore::new(ctx.client.clone());
    let recorder = KubeEventRecorder::new(ctx.client.clone());
    let store_applier = StoreApplier::new(&store);
    let applier: &dyn GraphApplier = if ctx.dry_run {
        &DryRunApplier
    } else {
        &store_applier
    };
    let reconciler = ClusterReconciler {
        engine: ComponentEngine {
            store: &store,
            recorder: &recorder,
            member_agent: ctx.member_agent.as_ref(),
            config: &ctx.config,
        },
        applier,
    };

    let result = finalizer(&api, CLUSTER_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(cluster) => reconciler.reconcile(&cluster, Utc::now()).await,
            FinalizerEvent::Cleanup(cluster) => {
                cleanup_cluster(applier, &cluster).await?;
                Ok(Action::await_change())
            }
        }
    })
    .await
    .map_err(Error::from);

    #[cfg(feature = "metrics")]
    metrics::observe_reconcile_duration_seconds(
        metrics::CONTROLLER_CLUSTER,
        started.elapsed().as_secs_f64(),
    );
    result
}

/// Requeue policy: delayed requeues keep their delay, transport errors retry fast
fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<ControllerState>) -> Action {
    #[cfg(feature = "metrics")]
    metrics::inc_reconcile_error(metrics::CONTROLLER_CLUSTER, error);

    if let Some(after) = error.requeue_after() {
        debug!("Requeue {} in {:?}: {}", cluster.name_any(), after, error);
        return Action::requeue(after);
    }
    if error.is_retriable() {
        warn!("Reconciliation of {} failed, retrying: {}", cluster.name_any(), error);
        return Action::requeue(Duration::from_secs(15));
    }
    error!("Reconciliation error for {}: {:?}", cluster.name_any(), error);
    Action::requeue(Duration::from_secs(60))
}

/// Everything one pass stages for a cluster
#[derive(Debug)]
pub struct ClusterPlan {
    pub graph: ObjectGraph,
    /// Root vertex holding the cluster with its new status
    pub root: VertexId,
    pub requeue: Option<Error>,
}

impl ClusterPlan {
    pub fn cluster(&self) -> Option<&Cluster> {
        self.graph.vertex(self.root).and_then(|v| v.typed::<Cluster>())
    }
}

/// Drives one cluster pass: plan every component, apply, report
pub struct ClusterReconciler<'a> {
    pub engine: ComponentEngine<'a>,
    pub applier: &'a dyn GraphApplier,
}

impl ClusterReconciler<'_> {
    /// Stage the graph of every component under the cluster status vertex
    pub async fn plan(&self, cluster: &Cluster, now: DateTime<Utc>) -> Result<ClusterPlan> {
        let snapshot = read_snapshot(self.engine.store, cluster).await?;
        let spec_pass = !cluster.is_status_updating();
        debug!(
            spec_pass,
            generation = cluster.generation(),
            "Planning cluster {}",
            cluster.name_any()
        );

        let mut updated = cluster.clone();
        let mut graph = ObjectGraph::new();
        let root = graph.add_vertex(cluster.clone(), Some(GraphAction::Status));
        graph.set_root(root);

        let mut requeue: Option<Error> = None;
        let mut spec_pending = false;
        for comp in &cluster.spec.component_specs {
            let plan = self.engine.reconcile(&mut updated, comp, &snapshot, now).await?;
            spec_pending |= plan.spec_pending;
            graph.merge(plan.graph, root)?;
            if let Some(err) = plan.requeue {
                requeue = Some(match requeue {
                    Some(current) => current.prefer(err),
                    None => err,
                });
            }
        }
        stage_removed_components(&mut graph, root, cluster, &snapshot)?;

        let status = updated.status.get_or_insert_with(ClusterStatus::default);
        status
            .components
            .retain(|name, _| cluster.spec.component_specs.iter().any(|c| &c.name == name));
        if spec_pass && !spec_pending {
            status.observed_generation = cluster.metadata.generation;
        }
        refresh_summary_conditions(&mut updated);

        if let Some(vertex) = graph.vertex_mut(root) {
            vertex.object = updated.into();
            vertex.original = Some(cluster.clone().into());
        }
        Ok(ClusterPlan {
            graph,
            root,
            requeue,
        })
    }

    /// Plan and apply one pass. Returns the summary of store calls made.
    ///
    /// A pending requeue such as a role wait or a domain failure is
    /// returned as the error after the graph has been applied.
    #[instrument(skip_all, fields(name = %cluster.name_any(), namespace = cluster.namespace()))]
    pub async fn apply(&self, cluster: &Cluster, now: DateTime<Utc>) -> Result<ApplySummary> {
        if let Err(e) = cluster.spec.validate() {
            let message = e
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            warn!("Validation failed for {}: {}", cluster.name_any(), message);
            return Err(Error::ValidationError(message));
        }

        let mut plan = self.plan(cluster, now).await?;
        if let Some(vertex) = plan.graph.vertex_mut(plan.root) {
            if let Some(updated) = vertex.typed_mut::<Cluster>() {
                set_apply_resources_condition(updated, None);
            }
        }
        debug!("Object graph:\n{}", plan.graph);

        let summary = match self.applier.apply(&plan.graph).await {
            Ok(summary) => summary,
            Err(e) => {
                self.report_apply_failure(cluster, &e).await;
                return Err(e);
            }
        };
        #[cfg(feature = "metrics")]
        if let Some(updated) = plan.cluster() {
            record_component_phases(updated);
        }
        match plan.requeue {
            Some(err) => Err(err),
            None => Ok(summary),
        }
    }

    /// Controller entry: apply and translate the outcome into a requeue
    pub async fn reconcile(&self, cluster: &Cluster, now: DateTime<Utc>) -> Result<Action> {
        let summary = self.apply(cluster, now).await?;
        info!(
            mutations = summary.mutations(),
            "Reconciled Cluster {}/{}",
            cluster.namespace_or_default(),
            cluster.name_any()
        );
        Ok(Action::requeue(REQUEUE_STEADY))
    }

    /// Best effort: the original error is what the caller sees
    async fn report_apply_failure(&self, cluster: &Cluster, err: &Error) {
        #[cfg(feature = "metrics")]
        metrics::inc_apply_failure(&cluster.namespace_or_default(), &cluster.name_any());
        self.engine
            .recorder
            .warning(cluster, REASON_APPLY_RESOURCES_FAILED, &err.to_string())
            .await;
        let mut failed = cluster.clone();
        set_apply_resources_condition(&mut failed, Some(&err.to_string()));
        let mut graph = ObjectGraph::new();
        let root = graph.add_vertex(failed, Some(GraphAction::Status));
        if let Some(vertex) = graph.vertex_mut(root) {
            vertex.original = Some(cluster.clone().into());
        }
        graph.set_root(root);
        if let Err(e) = self.applier.apply(&graph).await {
            warn!("Could not record apply failure on {}: {}", cluster.name_any(), e);
        }
    }
}

#[cfg(feature = "metrics")]
fn record_component_phases(cluster: &Cluster) {
    let namespace = cluster.namespace_or_default();
    let name = cluster.name_any();
    for comp in &cluster.spec.component_specs {
        let phase = cluster.component_status(&comp.name).and_then(|s| s.phase);
        metrics::set_component_phase(&namespace, &name, &comp.name, phase);
    }
}

/// Delete the objects of components that left the spec. Claims are kept.
fn stage_removed_components(
    graph: &mut ObjectGraph,
    root: VertexId,
    cluster: &Cluster,
    snapshot: &Snapshot,
) -> Result<()> {
    let removable = [
        ObjectKind::StatefulSet,
        ObjectKind::Deployment,
        ObjectKind::Service,
        ObjectKind::ConfigMap,
        ObjectKind::PodDisruptionBudget,
    ];
    let stale: Vec<Object> = snapshot
        .iter()
        .filter(|(key, _)| removable.contains(&key.kind))
        .filter(|(_, obj)| {
            obj.meta()
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_COMPONENT_NAME))
                .is_some_and(|name| !cluster.spec.component_specs.iter().any(|c| &c.name == name))
        })
        .map(|(_, obj)| obj.clone())
        .collect();
    for obj in stale {
        info!("Deleting {} of a removed component", obj.key());
        graph.add_child(obj, Some(GraphAction::Delete), root)?;
    }
    Ok(())
}
