//! Workload variants of a component
//!
//! A component is materialized either by a StatefulSet or by a Deployment,
//! picked once from the workload type. Everything the engine needs from the
//! workload (replicas, pod template, readiness, revisions) goes through
//! [`Workload`] so callers never switch on the kind themselves.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use kube::ResourceExt;

use super::object::{Object, ObjectKey, ObjectKind};
use super::resources::{
    build_deployment, build_statefulset, ANNOTATION_GENERATION, LABEL_CONTROLLER_REVISION_HASH,
};
use crate::crd::{Cluster, ClusterComponentSpec, WorkloadType};

#[derive(Clone, Debug)]
pub enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
}

impl Workload {
    /// Desired workload of a component
    pub fn build(cluster: &Cluster, comp: &ClusterComponentSpec) -> Self {
        match comp.workload_type {
            WorkloadType::Stateless => Workload::Deployment(build_deployment(cluster, comp)),
            WorkloadType::Stateful | WorkloadType::Consensus | WorkloadType::Replication => {
                Workload::StatefulSet(build_statefulset(cluster, comp))
            }
        }
    }

    pub fn kind_for(workload_type: WorkloadType) -> ObjectKind {
        match workload_type {
            WorkloadType::Stateless => ObjectKind::Deployment,
            _ => ObjectKind::StatefulSet,
        }
    }

    pub fn from_object(obj: &Object) -> Option<Self> {
        match obj {
            Object::StatefulSet(sts) => Some(Workload::StatefulSet(sts.clone())),
            Object::Deployment(deploy) => Some(Workload::Deployment(deploy.clone())),
            _ => None,
        }
    }

    pub fn into_object(self) -> Object {
        match self {
            Workload::StatefulSet(sts) => Object::StatefulSet(sts),
            Workload::Deployment(deploy) => Object::Deployment(deploy),
        }
    }

    pub fn kind(&self) -> ObjectKind {
        match self {
            Workload::StatefulSet(_) => ObjectKind::StatefulSet,
            Workload::Deployment(_) => ObjectKind::Deployment,
        }
    }

    pub fn name(&self) -> String {
        match self {
            Workload::StatefulSet(sts) => sts.name_any(),
            Workload::Deployment(deploy) => deploy.name_any(),
        }
    }

    pub fn namespace(&self) -> Option<String> {
        match self {
            Workload::StatefulSet(sts) => sts.namespace(),
            Workload::Deployment(deploy) => deploy.namespace(),
        }
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.namespace().as_deref(), self.name())
    }

    /// Declared replica count; the API server defaults a missing value to 1
    pub fn replicas(&self) -> i32 {
        let replicas = match self {
            Workload::StatefulSet(sts) => sts.spec.as_ref().and_then(|s| s.replicas),
            Workload::Deployment(deploy) => deploy.spec.as_ref().and_then(|s| s.replicas),
        };
        replicas.unwrap_or(1)
    }

    pub fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match self {
            Workload::StatefulSet(sts) => sts.spec.as_ref().map(|s| &s.template),
            Workload::Deployment(deploy) => deploy.spec.as_ref().map(|s| &s.template),
        }
    }

    /// Names of the volume claim templates. Deployments have none.
    pub fn volume_claim_template_names(&self) -> Vec<String> {
        match self {
            Workload::StatefulSet(sts) => sts
                .spec
                .as_ref()
                .and_then(|s| s.volume_claim_templates.as_ref())
                .map(|vcts| vcts.iter().map(|v| v.name_any()).collect())
                .unwrap_or_default(),
            Workload::Deployment(_) => Vec::new(),
        }
    }

    pub fn generation_annotation(&self) -> Option<&str> {
        let annotations = match self {
            Workload::StatefulSet(sts) => sts.metadata.annotations.as_ref(),
            Workload::Deployment(deploy) => deploy.metadata.annotations.as_ref(),
        };
        annotations
            .and_then(|a| a.get(ANNOTATION_GENERATION))
            .map(String::as_str)
    }

    /// Whether the workload was last built from the cluster's current generation
    pub fn is_latest(&self, cluster: &Cluster) -> bool {
        self.generation_annotation() == Some(cluster.generation().to_string().as_str())
    }

    pub fn available_replicas(&self) -> i32 {
        match self {
            Workload::StatefulSet(sts) => sts
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
            Workload::Deployment(deploy) => deploy
                .status
                .as_ref()
                .and_then(|s| s.available_replicas)
                .unwrap_or(0),
        }
    }

    /// The workload controller has observed the latest spec and every
    /// replica is ready, available and on the current revision.
    pub fn is_ready(&self, replicas: i32) -> bool {
        match self {
            Workload::StatefulSet(sts) => statefulset_is_ready(sts, replicas),
            Workload::Deployment(deploy) => deployment_is_ready(deploy, replicas),
        }
    }

    /// Every replica is ready and available, regardless of revision
    pub fn pods_ready(&self, replicas: i32) -> bool {
        match self {
            Workload::StatefulSet(sts) => {
                let Some(status) = &sts.status else {
                    return false;
                };
                status.ready_replicas.unwrap_or(0) == replicas
                    && status.available_replicas.unwrap_or(0) == replicas
            }
            Workload::Deployment(deploy) => {
                let Some(status) = &deploy.status else {
                    return false;
                };
                status.available_replicas.unwrap_or(0) == replicas
            }
        }
    }

    /// Whether `pod` runs the revision the workload is rolling out.
    ///
    /// Deployments spread revisions over ReplicaSets, so every pod counts as
    /// current there.
    pub fn is_pod_of_latest_revision(&self, pod: &Pod) -> bool {
        match self {
            Workload::StatefulSet(sts) => {
                let Some(status) = &sts.status else {
                    return false;
                };
                let revision = pod
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_CONTROLLER_REVISION_HASH));
                revision.is_some()
                    && revision == status.update_revision.as_ref()
                    && observed_latest(sts.metadata.generation, status.observed_generation)
            }
            Workload::Deployment(_) => true,
        }
    }

    /// Live copy carrying the desired template, replica count and generation.
    ///
    /// Returns the copy and whether its spec differs from the live spec. The
    /// generation annotation alone changing still yields a copy so the
    /// stale-workload guard catches up.
    pub fn updated_from(&self, proto: &Workload) -> Option<(Workload, bool)> {
        let mut copy = self.clone();
        let spec_changed = match (&mut copy, proto) {
            (Workload::StatefulSet(live), Workload::StatefulSet(desired)) => {
                let (Some(spec), Some(want)) = (live.spec.as_mut(), desired.spec.as_ref()) else {
                    return None;
                };
                let before = serde_json::to_value(&*spec).ok();
                spec.template = want.template.clone();
                spec.replicas = want.replicas;
                spec.update_strategy = want.update_strategy.clone();
                before != serde_json::to_value(&*spec).ok()
            }
            (Workload::Deployment(live), Workload::Deployment(desired)) => {
                let (Some(spec), Some(want)) = (live.spec.as_mut(), desired.spec.as_ref()) else {
                    return None;
                };
                let before = serde_json::to_value(&*spec).ok();
                spec.template = want.template.clone();
                spec.replicas = want.replicas;
                spec.strategy = want.strategy.clone();
                before != serde_json::to_value(&*spec).ok()
            }
            _ => return None,
        };

        let annotation_changed = self.generation_annotation() != proto.generation_annotation();
        if let Some(generation) = proto.generation_annotation() {
            copy.meta_annotations_mut()
                .insert(ANNOTATION_GENERATION.to_string(), generation.to_string());
        }

        if spec_changed || annotation_changed {
            Some((copy, spec_changed))
        } else {
            None
        }
    }

    fn meta_annotations_mut(&mut self) -> &mut std::collections::BTreeMap<String, String> {
        let meta = match self {
            Workload::StatefulSet(sts) => &mut sts.metadata,
            Workload::Deployment(deploy) => &mut deploy.metadata,
        };
        meta.annotations.get_or_insert_with(Default::default)
    }
}

fn observed_latest(generation: Option<i64>, observed: Option<i64>) -> bool {
    match generation {
        Some(g) => observed == Some(g),
        None => true,
    }
}

fn statefulset_is_ready(sts: &StatefulSet, replicas: i32) -> bool {
    let Some(status) = &sts.status else {
        return false;
    };
    let spec_replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let revision_consistent = match (&status.current_revision, &status.update_revision) {
        (Some(current), Some(update)) => current == update,
        (None, None) => true,
        _ => false,
    };
    observed_latest(sts.metadata.generation, status.observed_generation)
        && spec_replicas == replicas
        && status.replicas == replicas
        && status.ready_replicas.unwrap_or(0) == replicas
        && status.available_replicas.unwrap_or(0) == replicas
        && revision_consistent
}

fn deployment_is_ready(deploy: &Deployment, replicas: i32) -> bool {
    let Some(status) = &deploy.status else {
        return false;
    };
    let spec_replicas = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let deadline_exceeded = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Progressing" && c.reason.as_deref() == Some("ProgressDeadlineExceeded"));
    observed_latest(deploy.metadata.generation, status.observed_generation)
        && !deadline_exceeded
        && spec_replicas == replicas
        && status.replicas.unwrap_or(0) == replicas
        && status.updated_replicas.unwrap_or(0) == replicas
        && status.ready_replicas.unwrap_or(0) == replicas
        && status.available_replicas.unwrap_or(0) == replicas
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::StatefulSetStatus;

    use super::*;
    use crate::crd::ClusterSpec;

    fn cluster() -> Cluster {
        let mut cluster = Cluster::new("db", ClusterSpec::default());
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.generation = Some(4);
        cluster
    }

    fn comp(workload_type: WorkloadType) -> ClusterComponentSpec {
        ClusterComponentSpec {
            name: "mysql".to_string(),
            workload_type,
            image: "mysql:8.0".to_string(),
            replicas: 3,
            ..Default::default()
        }
    }

    fn ready_status(replicas: i32) -> StatefulSetStatus {
        StatefulSetStatus {
            replicas,
            ready_replicas: Some(replicas),
            available_replicas: Some(replicas),
            current_revision: Some("rev-1".to_string()),
            update_revision: Some("rev-1".to_string()),
            observed_generation: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn test_workload_kind_follows_type() {
        let cluster = cluster();
        assert_eq!(
            Workload::build(&cluster, &comp(WorkloadType::Stateless)).kind(),
            ObjectKind::Deployment
        );
        assert_eq!(
            Workload::build(&cluster, &comp(WorkloadType::Consensus)).kind(),
            ObjectKind::StatefulSet
        );
    }

    #[test]
    fn test_built_workload_is_latest() {
        let cluster = cluster();
        let workload = Workload::build(&cluster, &comp(WorkloadType::Stateful));
        assert!(workload.is_latest(&cluster));
        assert_eq!(workload.replicas(), 3);
    }

    #[test]
    fn test_statefulset_readiness_requires_consistent_revision() {
        let cluster = cluster();
        let Workload::StatefulSet(mut sts) = Workload::build(&cluster, &comp(WorkloadType::Stateful))
        else {
            panic!("expected a StatefulSet");
        };
        sts.metadata.generation = Some(1);
        sts.status = Some(ready_status(3));
        let workload = Workload::StatefulSet(sts.clone());
        assert!(workload.is_ready(3));
        assert!(workload.pods_ready(3));

        sts.status.as_mut().unwrap().update_revision = Some("rev-2".to_string());
        let rolling = Workload::StatefulSet(sts);
        assert!(!rolling.is_ready(3));
        assert!(rolling.pods_ready(3));
    }

    #[test]
    fn test_updated_from_detects_replica_change() {
        let cluster = cluster();
        let live = Workload::build(&cluster, &comp(WorkloadType::Stateful));
        assert!(live.updated_from(&live).is_none());

        let mut scaled = comp(WorkloadType::Stateful);
        scaled.replicas = 5;
        let proto = Workload::build(&cluster, &scaled);
        let (copy, spec_changed) = live.updated_from(&proto).unwrap();
        assert!(spec_changed);
        assert_eq!(copy.replicas(), 5);
    }

    #[test]
    fn test_updated_from_bumps_generation_without_spec_change() {
        let mut cluster = cluster();
        let live = Workload::build(&cluster, &comp(WorkloadType::Stateful));
        cluster.metadata.generation = Some(5);
        let proto = Workload::build(&cluster, &comp(WorkloadType::Stateful));

        let (copy, spec_changed) = live.updated_from(&proto).unwrap();
        assert!(!spec_changed);
        assert!(copy.is_latest(&cluster));
    }
}
