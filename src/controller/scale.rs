//! Horizontal scaling of a component
//!
//! Scale-out withholds the new replica count (the workload vertex is made
//! immutable) until the data-clone engine reports every new replica's
//! volumes ready. Scale-in asks the leaving replicas to quit their group,
//! then deletes their claims ahead of the workload update. While any of
//! them refuses, the workload keeps its replicas and the pass is retried.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::data_clone::{job_failure, new_data_clone, CloneContext, DataClone};
use super::events::{EventRecorder, REASON_HORIZONTAL_SCALE, REASON_MEMBER_LEAVE_FAILED};
use super::graph::{Action, ObjectGraph, Vertex, VertexId};
use super::member::MemberAgent;
use super::object::{ObjectKey, ObjectKind};
use super::pod::{list_component_pods, pod_ordinal};
use super::resources::{
    data_clone_labels, env_config_map_name, pvc_name, ANNOTATION_COMPONENT_REPLICAS,
};
use super::store::{list_typed, Store};
use super::workload::Workload;
use crate::crd::{Cluster, ClusterComponentSpec, ComponentMessageMap, ComponentPhase, HScaleDataClonePolicy};
use crate::error::{Error, Result};

pub struct ScaleContext<'a> {
    pub store: &'a dyn Store,
    pub recorder: &'a dyn EventRecorder,
    pub member_agent: &'a dyn MemberAgent,
    pub config: &'a EngineConfig,
    pub cluster: &'a Cluster,
    pub comp: &'a ClusterComponentSpec,
}

impl<'a> ScaleContext<'a> {
    fn namespace(&self) -> String {
        self.cluster.namespace_or_default()
    }

    fn clone_context(&self, sts_name: &str, old_replicas: i32) -> CloneContext<'a> {
        CloneContext {
            store: self.store,
            recorder: self.recorder,
            cluster: self.cluster,
            comp: self.comp,
            sts_name: sts_name.to_string(),
            old_replicas,
            new_replicas: self.comp.replicas,
        }
    }

    fn set_immutable(graph: &mut ObjectGraph, workload: VertexId, immutable: bool) {
        if let Some(vertex) = graph.vertex_mut(workload) {
            vertex.immutable = immutable;
        }
    }

    /// Stage a replica change of the live workload. Spec passes only.
    ///
    /// Returns a delayed requeue when a leaving replica refused to quit its
    /// group; the workload vertex is then immutable.
    pub async fn horizontal_scale(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        live: &Workload,
    ) -> Result<Option<Error>> {
        let old = live.replicas();
        let new = self.comp.replicas;
        if old == new {
            return Ok(None);
        }
        self.recorder
            .normal(
                self.cluster,
                REASON_HORIZONTAL_SCALE,
                &format!(
                    "start horizontal scale component {} of cluster {} from {} to {}",
                    self.comp.name,
                    self.cluster.name_any(),
                    old,
                    new
                ),
            )
            .await;
        info!(
            component = %self.comp.name,
            "Horizontal scale from {} to {}", old, new
        );

        if let Workload::StatefulSet(_) = live {
            if new > old {
                self.scale_out(graph, workload, &live.name(), old).await?;
            } else if let Some(requeue) = self.scale_in(graph, workload, &live.name(), old).await? {
                return Ok(Some(requeue));
            }
        }

        self.annotate_pods(graph, workload).await?;
        self.update_env_config_map(graph).await?;
        Ok(None)
    }

    async fn scale_out(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        sts_name: &str,
        old: i32,
    ) -> Result<()> {
        let clone = new_data_clone(self.clone_context(sts_name, old), self.config).await?;
        if clone.succeed().await? {
            Self::set_immutable(graph, workload, false);
            return self.post_scale_out(graph, workload, clone.as_ref()).await;
        }

        Self::set_immutable(graph, workload, true);
        let objects = clone.clone_data().await?;
        debug!("Scale-out of {} stages {} objects", sts_name, objects.len());
        for obj in objects {
            graph.add_child(obj, Some(Action::Create), workload)?;
        }
        Ok(())
    }

    /// Delete the temporary clone objects after the workload update
    async fn post_scale_out(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        clone: &dyn DataClone,
    ) -> Result<()> {
        for obj in clone.clear_tmp_resources().await? {
            let id = graph.add_vertex(obj, Some(Action::Delete));
            graph.connect(id, workload)?;
        }
        Ok(())
    }

    async fn scale_in(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        sts_name: &str,
        old: i32,
    ) -> Result<Option<Error>> {
        let new = self.comp.replicas;
        if new == 0 {
            debug!("Scaling {} to zero keeps its PVCs", sts_name);
            return Ok(None);
        }

        let refused = self.leave_members().await?;
        if !refused.is_empty() {
            Self::set_immutable(graph, workload, true);
            return Ok(Some(Error::DelayedRequeue {
                after: self.config.member_leave_requeue_after,
                reason: format!("{} did not leave the group yet", refused.join(", ")),
            }));
        }

        let namespace = self.namespace();
        for vct in &self.comp.volume_claim_templates {
            for ordinal in new..old {
                let key = ObjectKey::of::<PersistentVolumeClaim>(
                    Some(&namespace),
                    pvc_name(&vct.name, sts_name, ordinal),
                );
                if let Some(pvc) = self.store.get(&key).await? {
                    graph.add_child(pvc, Some(Action::Delete), workload)?;
                }
            }
        }
        Ok(None)
    }

    /// Ask every leaving replica to quit its group. Returns the pods that refused.
    async fn leave_members(&self) -> Result<Vec<String>> {
        let Some(character_type) = self.comp.character_type.as_deref() else {
            return Ok(Vec::new());
        };
        let mut refused = Vec::new();
        let pods = list_component_pods(self.store, self.cluster, self.comp).await?;
        for pod in pods
            .iter()
            .filter(|p| pod_ordinal(p).is_some_and(|o| o >= self.comp.replicas))
        {
            if let Err(e) = self.member_agent.leave_member(pod, character_type).await {
                warn!("Pod {} did not leave its group: {}", pod.name_any(), e);
                self.recorder
                    .warning(
                        self.cluster,
                        REASON_MEMBER_LEAVE_FAILED,
                        &format!("pod {} failed to leave member: {}", pod.name_any(), e),
                    )
                    .await;
                refused.push(pod.name_any());
            }
        }
        Ok(refused)
    }

    async fn annotate_pods(&self, graph: &mut ObjectGraph, workload: VertexId) -> Result<()> {
        let replicas = self.comp.replicas.to_string();
        for pod in list_component_pods(self.store, self.cluster, self.comp).await? {
            if pod.annotations().get(ANNOTATION_COMPONENT_REPLICAS) == Some(&replicas) {
                continue;
            }
            let mut annotated = pod.clone();
            annotated
                .annotations_mut()
                .insert(ANNOTATION_COMPONENT_REPLICAS.to_string(), replicas.clone());
            let mut vertex = Vertex::new(annotated.into(), Some(Action::Update));
            vertex.original = Some(pod.into());
            graph.push_child(vertex, workload)?;
        }
        Ok(())
    }

    /// Replica-dependent env is rendered into the ConfigMap; force its update
    async fn update_env_config_map(&self, graph: &mut ObjectGraph) -> Result<()> {
        let key = ObjectKey::of::<ConfigMap>(
            Some(&self.namespace()),
            env_config_map_name(self.cluster, self.comp),
        );
        let Some(id) = graph.find(&key) else {
            return Ok(());
        };
        let Some(live) = self.store.get(&key).await? else {
            return Ok(());
        };
        if let Some(vertex) = graph.vertex_mut(id) {
            vertex.object.meta_mut().resource_version = live.meta().resource_version.clone();
            vertex.original = Some(live);
            vertex.action = Some(Action::Update);
        }
        Ok(())
    }

    /// Continue or finish a horizontal scale. Status passes only.
    ///
    /// Returns the phase to propose when a clone Job failed.
    pub async fn horizontal_scale_status(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        live: &Workload,
    ) -> Result<Option<(ComponentPhase, ComponentMessageMap)>> {
        let Workload::StatefulSet(_) = live else {
            return Ok(None);
        };
        let sts_name = live.name();
        let pending = self.comp.replicas - live.replicas();
        if pending > 0 {
            self.scale_out(graph, workload, &sts_name, live.replicas()).await?;
            return Ok(None);
        }
        if pending < 0 {
            return Ok(None);
        }

        let failed = self.failed_clone_jobs().await?;
        if !failed.is_empty() {
            return Ok(Some((ComponentPhase::Abnormal, failed)));
        }
        let clones_volumes = self
            .comp
            .horizontal_scale_policy
            .as_ref()
            .is_some_and(|p| p.type_ == HScaleDataClonePolicy::CloneVolume);
        if clones_volumes {
            let clone = new_data_clone(self.clone_context(&sts_name, live.replicas()), self.config).await?;
            self.post_scale_out(graph, workload, clone.as_ref()).await?;
        }
        Ok(None)
    }

    async fn failed_clone_jobs(&self) -> Result<ComponentMessageMap> {
        let jobs = list_typed::<Job>(
            self.store,
            Some(&self.namespace()),
            &data_clone_labels(self.cluster, self.comp),
        )
        .await?;
        let mut messages = ComponentMessageMap::new();
        for job in &jobs {
            if let Some(message) = job_failure(job) {
                messages.set_object_message(ObjectKind::Job.as_str(), &job.name_any(), message);
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
#[path = "scale_test.rs"]
mod scale_test;
