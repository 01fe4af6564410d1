//! Per-component engine
//!
//! One call stages every object of a component into a fresh graph and
//! decides its phase. Spec passes (the cluster generation moved) build the
//! desired objects, run horizontal scale and volume resize, and mark the
//! component Creating or Updating. Status passes re-derive the phase from
//! live state through a [`StatusTransaction`] and restart stale
//! Consensus pods one at a time.

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use super::config::EngineConfig;
use super::events::{EventRecorder, REASON_PHASE_TRANSITION, REASON_RESTART_POD, REASON_WAITING_FOR_PROBE};
use super::graph::{Action, ObjectGraph, VertexId};
use super::member::MemberAgent;
use super::object::{Object, ObjectKind};
use super::phase::{evaluate_workload_phase, rebuild_role_status};
use super::pod::list_component_pods;
use super::resources::{
    build_env_config_map, build_headless_service, build_pdb, build_service, LABEL_COMPONENT_NAME,
};
use super::restart::stage_restart;
use super::scale::ScaleContext;
use super::snapshot::{freeze_non_workload_vertices, resolve_actions, Snapshot};
use super::status::{set_status_phase, PhaseTransition, ProposalSource, StatusTransaction};
use super::store::Store;
use super::volume::VolumeContext;
use super::workload::Workload;
use crate::crd::{Cluster, ClusterComponentSpec, ComponentMessageMap, ComponentPhase, ComponentStatus, WorkloadType};
use crate::error::{Error, Result};

/// Graph staged for one component and the requeue it asks for, if any
#[derive(Debug, Default)]
pub struct ComponentPlan {
    pub graph: ObjectGraph,
    pub requeue: Option<Error>,
    /// Part of the spec was withheld; the generation must stay unobserved
    /// so the next pass is a spec pass again
    pub spec_pending: bool,
}

impl ComponentPlan {
    fn defer(&mut self, err: Error) {
        self.requeue = Some(match self.requeue.take() {
            Some(current) => current.prefer(err),
            None => err,
        });
    }
}

fn hold_replicas(graph: &mut ObjectGraph, workload: VertexId) {
    if let Some(vertex) = graph.vertex_mut(workload) {
        vertex.immutable = true;
    }
}

/// Shared collaborators of every component pass
pub struct ComponentEngine<'a> {
    pub store: &'a dyn Store,
    pub recorder: &'a dyn EventRecorder,
    pub member_agent: &'a dyn MemberAgent,
    pub config: &'a EngineConfig,
}

impl<'a> ComponentEngine<'a> {
    fn scale_context(&self, cluster: &'a Cluster, comp: &'a ClusterComponentSpec) -> ScaleContext<'a> {
        ScaleContext {
            store: self.store,
            recorder: self.recorder,
            member_agent: self.member_agent,
            config: self.config,
            cluster,
            comp,
        }
    }

    fn volume_context(&self, cluster: &'a Cluster, comp: &'a ClusterComponentSpec) -> VolumeContext<'a> {
        VolumeContext {
            store: self.store,
            recorder: self.recorder,
            config: self.config,
            cluster,
            comp,
        }
    }

    /// Stage the desired objects of a component; returns the workload vertex
    fn stage_desired(
        graph: &mut ObjectGraph,
        cluster: &Cluster,
        comp: &ClusterComponentSpec,
    ) -> Result<(VertexId, Workload)> {
        let proto = Workload::build(cluster, comp);
        let workload = graph.add_vertex(proto.clone().into_object(), None);
        graph.add_vertex(build_service(cluster, comp), None);
        if comp.workload_type != WorkloadType::Stateless {
            graph.add_vertex(build_headless_service(cluster, comp), None);
        }
        graph.add_vertex(build_env_config_map(cluster, comp), None);
        if let Some(pdb) = build_pdb(cluster, comp)? {
            graph.add_vertex(pdb, None);
        }
        Ok((workload, proto))
    }

    /// Services of the component that are no longer desired
    fn stage_stale_services(graph: &mut ObjectGraph, comp: &ClusterComponentSpec, snapshot: &Snapshot) {
        let stale: Vec<Object> = snapshot
            .iter()
            .filter(|(key, _)| key.kind == ObjectKind::Service)
            .filter(|(_, obj)| {
                obj.meta()
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_COMPONENT_NAME))
                    == Some(&comp.name)
            })
            .filter(|(key, _)| graph.find(key).is_none())
            .map(|(_, obj)| obj.clone())
            .collect();
        for svc in stale {
            debug!("Deleting stale service {}", svc.name());
            graph.add_vertex(svc, Some(Action::Delete));
        }
    }

    /// Point the workload vertex at the live object carrying the desired spec.
    ///
    /// Returns whether the workload spec itself changes.
    fn update_workload(graph: &mut ObjectGraph, workload: VertexId, live: &Workload, proto: &Workload) -> bool {
        let Some((updated, spec_changed)) = live.updated_from(proto) else {
            return false;
        };
        if let Some(vertex) = graph.vertex_mut(workload) {
            vertex.object = updated.into_object();
            vertex.original = Some(live.clone().into_object());
            vertex.action = Some(Action::Update);
        }
        spec_changed
    }

    fn live_workload(snapshot: &Snapshot, proto: &Workload) -> Option<Workload> {
        snapshot.get(&proto.key()).and_then(Workload::from_object)
    }

    /// Turn a domain failure into component messages; other errors abort the pass
    fn domain_failure_messages(
        comp: &ClusterComponentSpec,
        plan: &mut ComponentPlan,
        err: Error,
    ) -> Result<ComponentMessageMap> {
        let Error::DomainFailure { kind, name, message } = &err else {
            return Err(err);
        };
        warn!(component = %comp.name, "{} {} failed: {}", kind, name, message);
        let mut messages = ComponentMessageMap::new();
        messages.set_object_message(kind, name, message.clone());
        plan.defer(err);
        Ok(messages)
    }

    async fn record_transition(&self, cluster: &Cluster, transition: Option<PhaseTransition>, detail: &str) {
        if let Some(transition) = transition {
            info!(
                component = %transition.component,
                "Phase {:?} -> {}", transition.from, transition.to
            );
            self.recorder
                .normal(cluster, REASON_PHASE_TRANSITION, &transition.message(detail))
                .await;
        }
    }

    /// Run one pass for `comp` and return the staged graph.
    ///
    /// Component status is written into `cluster`; the caller owns the
    /// cluster status vertex.
    #[instrument(skip_all, fields(component = %comp.name))]
    pub async fn reconcile(
        &self,
        cluster: &mut Cluster,
        comp: &ClusterComponentSpec,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<ComponentPlan> {
        if cluster.is_status_updating() {
            self.status_pass(cluster, comp, snapshot, now).await
        } else {
            self.spec_pass(cluster, comp, snapshot).await
        }
    }

    async fn spec_pass(
        &self,
        cluster: &mut Cluster,
        comp: &ClusterComponentSpec,
        snapshot: &Snapshot,
    ) -> Result<ComponentPlan> {
        let mut plan = ComponentPlan::default();
        // sub-engines borrow an immutable view while `cluster` takes status writes
        let view = cluster.clone();
        let (workload, proto) = Self::stage_desired(&mut plan.graph, &view, comp)?;
        let live = Self::live_workload(snapshot, &proto);

        let mut transition = None;
        if let Some(live) = &live {
            if let Workload::StatefulSet(_) = live {
                self.volume_context(&view, comp)
                    .expand_volumes(&mut plan.graph, workload, &live.name(), live.replicas())
                    .await?;
            }
            match self
                .scale_context(&view, comp)
                .horizontal_scale(&mut plan.graph, workload, live)
                .await
            {
                Ok(None) => {}
                Ok(Some(requeue)) => {
                    plan.spec_pending = true;
                    plan.defer(requeue);
                }
                Err(e) => {
                    let messages = Self::domain_failure_messages(comp, &mut plan, e)?;
                    hold_replicas(&mut plan.graph, workload);
                    transition = set_status_phase(
                        cluster,
                        &comp.name,
                        ComponentPhase::Abnormal,
                        Some(&messages),
                    );
                }
            }
            Self::update_workload(&mut plan.graph, workload, live, &proto);
        }
        Self::stage_stale_services(&mut plan.graph, comp, snapshot);
        resolve_actions(&mut plan.graph, snapshot);

        if transition.is_none() {
            let changed = plan
                .graph
                .iter()
                .any(|(_, v)| !matches!(v.action, Some(Action::Noop) | None));
            let phase = match cluster.component_status(&comp.name).and_then(|s| s.phase) {
                None => Some(ComponentPhase::Creating),
                Some(_) if changed => Some(ComponentPhase::Updating),
                Some(_) => None,
            };
            if let Some(phase) = phase {
                transition = set_status_phase(cluster, &comp.name, phase, None);
            }
        }
        self.record_transition(cluster, transition, "spec changed").await;
        Ok(plan)
    }

    async fn status_pass(
        &self,
        cluster: &mut Cluster,
        comp: &ClusterComponentSpec,
        snapshot: &Snapshot,
        now: DateTime<Utc>,
    ) -> Result<ComponentPlan> {
        let mut plan = ComponentPlan::default();
        let view = cluster.clone();
        let (workload, proto) = Self::stage_desired(&mut plan.graph, &view, comp)?;
        let Some(live) = Self::live_workload(snapshot, &proto) else {
            debug!("Workload {} not created yet", proto.name());
            resolve_actions(&mut plan.graph, snapshot);
            freeze_non_workload_vertices(&mut plan.graph);
            return Ok(plan);
        };
        let previous: ComponentStatus = view.component_status(&comp.name).cloned().unwrap_or_default();
        let mut txn = StatusTransaction::new(comp.name.clone());

        if let Workload::StatefulSet(_) = &live {
            match self.volume_context(&view, comp).expansion_status(&live.name()).await? {
                Some((ComponentPhase::Abnormal, messages)) => {
                    txn.propose(ProposalSource::VolumeExpansion, Some(ComponentPhase::Abnormal), move |s| {
                        s.message.merge(&messages)
                    });
                }
                Some((phase, _)) if previous.is_up_running() => {
                    txn.propose(ProposalSource::VolumeExpansion, Some(phase), |_| {});
                }
                _ => {}
            }
        }

        match self
            .scale_context(&view, comp)
            .horizontal_scale_status(&mut plan.graph, workload, &live)
            .await
        {
            Ok(Some((phase, messages))) => {
                txn.propose(ProposalSource::HorizontalScale, Some(phase), move |s| {
                    s.message.merge(&messages)
                });
            }
            Ok(None) => {}
            Err(e) => {
                let messages = Self::domain_failure_messages(comp, &mut plan, e)?;
                hold_replicas(&mut plan.graph, workload);
                txn.propose(ProposalSource::HorizontalScale, Some(ComponentPhase::Abnormal), move |s| {
                    s.message.merge(&messages)
                });
            }
        }

        let pods = list_component_pods(self.store, &view, comp).await?;
        let evaluated = evaluate_workload_phase(&view, comp, &live, &pods, &previous, self.config, now);
        let mut roles = ComponentStatus::default();
        rebuild_role_status(comp, &pods, &mut roles)?;
        if let Some(pod) = stage_restart(&mut plan.graph, workload, comp, &live, &pods)? {
            self.recorder
                .normal(&view, REASON_RESTART_POD, &format!("Restarting pod {pod} on the new revision"))
                .await;
        }
        if evaluated.waiting_for_probe {
            self.recorder
                .normal(
                    &view,
                    REASON_WAITING_FOR_PROBE,
                    &format!("Waiting for the role probe of component {} to succeed", comp.name),
                )
                .await;
        }
        let phase = evaluated.phase;
        let messages = evaluated.messages.clone();
        txn.propose(ProposalSource::Workload, phase, move |s| match phase {
            Some(ComponentPhase::Running) | Some(ComponentPhase::Stopped) => {
                s.message = ComponentMessageMap::new();
            }
            _ => s.message.merge(&messages),
        });

        Self::update_workload(&mut plan.graph, workload, &live, &proto);
        resolve_actions(&mut plan.graph, snapshot);
        freeze_non_workload_vertices(&mut plan.graph);

        let transition = txn.commit(cluster);
        // readiness and roles are observations, kept whichever proposal won
        let status = cluster.component_status_mut(&comp.name);
        status.set_pods_ready(evaluated.pods_ready, now);
        if roles.consensus_set_status.is_some() {
            status.consensus_set_status = roles.consensus_set_status;
        }
        if roles.replication_set_status.is_some() {
            status.replication_set_status = roles.replication_set_status;
        }
        self.record_transition(cluster, transition, &evaluated.transition_message())
            .await;
        if let Some(requeue) = evaluated.requeue {
            plan.defer(requeue);
        }
        Ok(plan)
    }
}

#[cfg(test)]
#[path = "component_test.rs"]
mod component_test;
