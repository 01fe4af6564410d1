//! Volume resize tests against the in-memory store

use k8s_openapi::api::core::v1::{ObjectReference, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::*;
use crate::controller::applier::{GraphApplier, StoreApplier};
use crate::controller::events::MemoryEventRecorder;
use crate::controller::fixtures::{bound_pvc, cluster, component, ready_statefulset};
use crate::controller::memory_store::MemoryStore;
use crate::controller::object::ObjectKey;
use crate::crd::WorkloadType;

const STS: &str = "db-mysql";
const PVC: &str = "data-db-mysql-0";

fn resized_component(storage: &str) -> ClusterComponentSpec {
    let mut comp = component(WorkloadType::Consensus, 1);
    comp.volume_claim_templates[0].storage = storage.to_string();
    comp
}

fn pv(policy: &str) -> PersistentVolume {
    PersistentVolume {
        metadata: ObjectMeta {
            name: Some("pv-0".to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            claim_ref: Some(ObjectReference {
                name: Some(PVC.to_string()),
                namespace: Some("default".to_string()),
                uid: Some("pvc-uid".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            }),
            persistent_volume_reclaim_policy: Some(policy.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Claim whose earlier expansion to `requested` failed at 10Gi
fn failed_expansion_pvc(cluster: &Cluster, comp: &ClusterComponentSpec, requested: &str) -> PersistentVolumeClaim {
    let mut pvc = live_pvc(cluster, comp, "10Gi");
    pvc.metadata.finalizers = Some(vec!["kubernetes.io/pvc-protection".to_string()]);
    set_storage_request(&mut pvc, &Quantity(requested.to_string()));
    if let Some(status) = pvc.status.as_mut() {
        status.allocated_resource_statuses =
            Some([("storage".to_string(), "ControllerResizeFailed".to_string())].into());
    }
    pvc
}

/// Bound claim of replica 0 at `size`, whatever the template says
fn live_pvc(cluster: &Cluster, comp: &ClusterComponentSpec, size: &str) -> PersistentVolumeClaim {
    let mut pvc = bound_pvc(cluster, comp, 0, "pv-0");
    set_storage_request(&mut pvc, &Quantity(size.to_string()));
    if let Some(status) = pvc.status.as_mut() {
        status.capacity = Some([("storage".to_string(), Quantity(size.to_string()))].into());
    }
    pvc
}

struct Fixture {
    store: MemoryStore,
    recorder: MemoryEventRecorder,
    config: EngineConfig,
    cluster: Cluster,
    comp: ClusterComponentSpec,
}

impl Fixture {
    fn new(storage: &str, recover: bool) -> Self {
        let comp = resized_component(storage);
        Self {
            store: MemoryStore::new(),
            recorder: MemoryEventRecorder::new(),
            config: EngineConfig {
                recover_volume_expansion_failure: recover,
                ..Default::default()
            },
            cluster: cluster(vec![comp.clone()]),
            comp,
        }
    }

    fn ctx(&self) -> VolumeContext<'_> {
        VolumeContext {
            store: &self.store,
            recorder: &self.recorder,
            config: &self.config,
            cluster: &self.cluster,
            comp: &self.comp,
        }
    }

    /// Stage one resize pass under a Noop workload and apply it
    async fn pass(&self) -> (ResizePlan, ObjectGraph) {
        let mut graph = ObjectGraph::new();
        let sts = ready_statefulset(&self.cluster, &self.comp);
        let workload = graph.add_vertex(sts, Some(Action::Noop));
        let vct = self.comp.volume_claim_templates[0].clone();
        let plan = self
            .ctx()
            .update_pvc_size(&mut graph, workload, &vct, STS, 0)
            .await
            .unwrap();
        StoreApplier::new(&self.store).apply(&graph).await.unwrap();
        (plan, graph)
    }

    fn pvc(&self) -> Option<PersistentVolumeClaim> {
        self.store
            .get_now(&ObjectKey::of::<PersistentVolumeClaim>(Some("default"), PVC))
    }

    fn pv(&self) -> PersistentVolume {
        self.store
            .get_now(&ObjectKey::of::<PersistentVolume>(None, "pv-0"))
            .unwrap()
    }

    fn assert_recreated(&self, size: &str) {
        let pvc = self.pvc().unwrap();
        assert_eq!(storage_request(&pvc).unwrap().0, size);
        assert_eq!(pvc.spec.as_ref().unwrap().volume_name.as_deref(), Some("pv-0"));
        assert!(pvc.metadata.finalizers.is_none());

        let pv = self.pv();
        assert_eq!(reclaim_policy(&pv), Some("Delete"));
        assert!(!pv.annotations().contains_key(ANNOTATION_PV_LAST_CLAIM_POLICY));
        let claim = pv.spec.as_ref().unwrap().claim_ref.as_ref().unwrap();
        assert!(claim.uid.is_none());
        assert!(claim.resource_version.is_none());
    }
}

#[tokio::test]
async fn test_grow_is_an_update_below_the_workload() {
    let f = Fixture::new("20Gi", false);
    f.store.insert(live_pvc(&f.cluster, &f.comp, "10Gi")).unwrap();
    f.store.insert(pv("Delete")).unwrap();

    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Update);
    assert_eq!(graph.len(), 2);
    let workload = graph.vertex_ids().next().unwrap();
    let children = graph.children(workload);
    assert_eq!(children.len(), 1);
    assert_eq!(graph.vertex(children[0]).unwrap().action, Some(Action::Update));

    assert_eq!(storage_request(&f.pvc().unwrap()).unwrap().0, "20Gi");
    assert_eq!(reclaim_policy(&f.pv()), Some("Delete"));
}

#[tokio::test]
async fn test_shrink_without_recovery_changes_nothing() {
    let f = Fixture::new("5Gi", false);
    f.store.insert(live_pvc(&f.cluster, &f.comp, "10Gi")).unwrap();
    f.store.insert(pv("Delete")).unwrap();
    f.store.clear_operations();

    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Shrink);
    assert_eq!(graph.len(), 1);
    assert!(f.store.operations().is_empty());
    assert_eq!(storage_request(&f.pvc().unwrap()).unwrap().0, "10Gi");
    assert!(f.recorder.has_reason(REASON_VOLUME_EXPANSION_FAILED));
}

#[tokio::test]
async fn test_failed_expansion_without_recovery_is_left_alone() {
    let f = Fixture::new("15Gi", false);
    f.store.insert(failed_expansion_pvc(&f.cluster, &f.comp, "20Gi")).unwrap();
    f.store.insert(pv("Delete")).unwrap();

    let (plan, _) = f.pass().await;
    assert_eq!(plan, ResizePlan::Shrink);
    assert_eq!(storage_request(&f.pvc().unwrap()).unwrap().0, "20Gi");
}

#[tokio::test]
async fn test_recreate_from_first_step() {
    let f = Fixture::new("15Gi", true);
    f.store.insert(failed_expansion_pvc(&f.cluster, &f.comp, "20Gi")).unwrap();
    f.store.insert(pv("Delete")).unwrap();

    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Recreate(ResizeStep::RetainPolicy));
    // workload, retain, release, delete, unbind, recreate, restore
    assert_eq!(graph.len(), 7);
    f.assert_recreated("15Gi");

    // converged: a second pass stages nothing
    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Nothing);
    assert_eq!(graph.len(), 1);
}

#[tokio::test]
async fn test_recreate_steps_apply_in_order() {
    let f = Fixture::new("15Gi", true);
    let claim = failed_expansion_pvc(&f.cluster, &f.comp, "20Gi");
    let steps = recreate_steps(Some(&claim), &pv("Delete"), claim.clone(), ResizeStep::RetainPolicy);
    let order: Vec<ResizeStep> = steps.iter().map(|(s, _)| *s).collect();
    assert_eq!(order, ResizeStep::ALL.to_vec());

    let mut graph = ObjectGraph::new();
    let workload = graph.add_vertex(ready_statefulset(&f.cluster, &f.comp), Some(Action::Noop));
    chain_steps(&mut graph, workload, steps);
    let applied: Vec<(ObjectKind, Option<Action>)> = graph
        .reverse_topological_order()
        .unwrap()
        .into_iter()
        .map(|id| {
            let v = graph.vertex(id).unwrap();
            (v.object.kind(), v.action)
        })
        .collect();
    assert_eq!(
        applied,
        vec![
            (ObjectKind::PersistentVolume, Some(Action::Patch)),
            (ObjectKind::PersistentVolumeClaim, Some(Action::Patch)),
            (ObjectKind::PersistentVolumeClaim, Some(Action::Delete)),
            (ObjectKind::PersistentVolume, Some(Action::Patch)),
            (ObjectKind::PersistentVolumeClaim, Some(Action::Create)),
            (ObjectKind::PersistentVolume, Some(Action::Patch)),
            (ObjectKind::StatefulSet, Some(Action::Noop)),
        ]
    );
}

#[tokio::test]
async fn test_resume_after_claim_was_deleted() {
    let f = Fixture::new("15Gi", true);
    let mut retained = pv("Retain");
    retained.labels_mut().insert(LABEL_PVC_NAME.to_string(), PVC.to_string());
    retained
        .annotations_mut()
        .insert(ANNOTATION_PV_LAST_CLAIM_POLICY.to_string(), "Delete".to_string());
    f.store.insert(retained).unwrap();

    let (plan, _) = f.pass().await;
    assert_eq!(plan, ResizePlan::Recreate(ResizeStep::UnbindPv));
    f.assert_recreated("15Gi");
}

#[tokio::test]
async fn test_resume_at_restore_policy() {
    let f = Fixture::new("15Gi", true);
    let mut pvc = bound_pvc(&f.cluster, &f.comp, 0, "pv-0");
    set_storage_request(&mut pvc, &Quantity("15Gi".to_string()));
    f.store.insert(pvc).unwrap();
    let mut retained = pv("Retain");
    retained
        .annotations_mut()
        .insert(ANNOTATION_PV_LAST_CLAIM_POLICY.to_string(), "Delete".to_string());
    if let Some(claim) = retained.spec.as_mut().and_then(|s| s.claim_ref.as_mut()) {
        claim.uid = None;
        claim.resource_version = None;
    }
    f.store.insert(retained).unwrap();

    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Recreate(ResizeStep::RestorePolicy));
    assert_eq!(graph.len(), 2);
    f.assert_recreated("15Gi");
}

#[tokio::test]
async fn test_natively_retained_volume_is_not_touched() {
    let f = Fixture::new("10Gi", true);
    f.store.insert(bound_pvc(&f.cluster, &f.comp, 0, "pv-0")).unwrap();
    f.store.insert(pv("Retain")).unwrap();

    let (plan, _) = f.pass().await;
    assert_eq!(plan, ResizePlan::Nothing);
    assert_eq!(reclaim_policy(&f.pv()), Some("Retain"));
}

#[tokio::test]
async fn test_missing_claim_and_volume_is_complete() {
    let f = Fixture::new("15Gi", true);
    let (plan, graph) = f.pass().await;
    assert_eq!(plan, ResizePlan::Nothing);
    assert_eq!(graph.len(), 1);
}

#[tokio::test]
async fn test_claim_without_volume_grows_in_place() {
    let f = Fixture::new("20Gi", true);
    let mut pvc = live_pvc(&f.cluster, &f.comp, "10Gi");
    pvc.spec.as_mut().unwrap().volume_name = None;
    f.store.insert(pvc).unwrap();

    let (plan, _) = f.pass().await;
    assert_eq!(plan, ResizePlan::Update);
    assert_eq!(storage_request(&f.pvc().unwrap()).unwrap().0, "20Gi");
}

#[tokio::test]
async fn test_expand_volumes_visits_every_live_replica() {
    let comp = {
        let mut comp = component(WorkloadType::Stateful, 3);
        comp.volume_claim_templates[0].storage = "20Gi".to_string();
        comp
    };
    let cluster = cluster(vec![comp.clone()]);
    let store = MemoryStore::new();
    for i in 0..3 {
        let mut pvc = bound_pvc(&cluster, &comp, i, &format!("pv-{i}"));
        set_storage_request(&mut pvc, &Quantity("10Gi".to_string()));
        store.insert(pvc).unwrap();
    }
    let recorder = MemoryEventRecorder::new();
    let config = EngineConfig::default();
    let ctx = VolumeContext {
        store: &store,
        recorder: &recorder,
        config: &config,
        cluster: &cluster,
        comp: &comp,
    };

    let mut graph = ObjectGraph::new();
    let workload = graph.add_vertex(ready_statefulset(&cluster, &comp), Some(Action::Noop));
    ctx.expand_volumes(&mut graph, workload, STS, 2).await.unwrap();
    let names: Vec<String> = graph
        .children(workload)
        .into_iter()
        .map(|id| graph.vertex(id).unwrap().object.name())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.contains(&"data-db-mysql-0".to_string()));
    assert!(names.contains(&"data-db-mysql-1".to_string()));
}

#[tokio::test]
async fn test_expansion_status() {
    let f = Fixture::new("20Gi", false);
    assert!(f.ctx().expansion_status(STS).await.unwrap().is_none());

    let mut expanding = live_pvc(&f.cluster, &f.comp, "10Gi");
    set_storage_request(&mut expanding, &Quantity("20Gi".to_string()));
    f.store.insert(expanding).unwrap();
    let (phase, messages) = f.ctx().expansion_status(STS).await.unwrap().unwrap();
    assert_eq!(phase, ComponentPhase::Updating);
    assert!(messages.is_empty());

    f.store
        .insert(failed_expansion_pvc(&f.cluster, &f.comp, "20Gi"))
        .unwrap();
    let (phase, messages) = f.ctx().expansion_status(STS).await.unwrap().unwrap();
    assert_eq!(phase, ComponentPhase::Abnormal);
    assert!(messages
        .get_object_message("PersistentVolumeClaim", PVC)
        .unwrap()
        .starts_with("Volume Expansion failed"));
}

#[test]
fn test_plan_ignores_equal_sizes() {
    let comp = resized_component("10Gi");
    let cluster = cluster(vec![comp.clone()]);
    let pvc = bound_pvc(&cluster, &comp, 0, "pv-0");
    let plan = plan_resize(
        Some(&pvc),
        Some(&pv("Delete")),
        &Quantity("10Gi".to_string()),
        &EngineConfig::default(),
    )
    .unwrap();
    assert_eq!(plan, ResizePlan::Nothing);
}
