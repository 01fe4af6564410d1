//! Volume-resize sequencer and volume-expansion status
//!
//! Growing a claim is a plain update when the provisioner expands volumes
//! online. When a previous expansion failed and recovery is enabled, the
//! claim is recreated on its retained volume instead, in five steps:
//!
//! 1. RetainPolicy: PV reclaim policy to `Retain`, old policy stashed.
//! 2. DeletePvc: finalizers removed, claim deleted. The volume survives.
//! 3. UnbindPv: `claimRef` uid and resourceVersion cleared.
//! 4. RecreatePvc: claim created at the target size, bound to the PV.
//! 5. RestorePolicy: stashed reclaim policy put back.
//!
//! Each step is its own vertex hung below the previous one, so the applier
//! runs them in order before the workload vertex. The entry step is derived
//! from live state every pass, which makes the chain resumable.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::events::{EventRecorder, REASON_VOLUME_EXPANSION_FAILED};
use super::graph::{Action, ObjectGraph, Vertex, VertexId};
use super::object::{Object, ObjectKind};
use super::quantity::compare;
use super::resources::{
    build_pvc, pvc_name, ANNOTATION_BIND_COMPLETED, ANNOTATION_PV_LAST_CLAIM_POLICY, LABEL_PVC_NAME,
};
use super::store::{get_typed, list_typed, Store};
use crate::crd::{Cluster, ClusterComponentSpec, ComponentMessageMap, ComponentPhase, VolumeClaimTemplate};
use crate::error::Result;

const RECLAIM_RETAIN: &str = "Retain";
const RECLAIM_DELETE: &str = "Delete";

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ResizeStep {
    RetainPolicy,
    DeletePvc,
    UnbindPv,
    RecreatePvc,
    RestorePolicy,
}

impl ResizeStep {
    pub const ALL: [ResizeStep; 5] = [
        ResizeStep::RetainPolicy,
        ResizeStep::DeletePvc,
        ResizeStep::UnbindPv,
        ResizeStep::RecreatePvc,
        ResizeStep::RestorePolicy,
    ];
}

/// What a pass does with one claim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResizePlan {
    Nothing,
    /// In-place update of the claim's request
    Update,
    /// Recreate the claim, starting at the given step
    Recreate(ResizeStep),
    /// Requested shrink of a claim that cannot be recreated
    Shrink,
}

fn storage_request(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.spec
        .as_ref()
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get("storage"))
}

fn storage_capacity(pvc: &PersistentVolumeClaim) -> Option<&Quantity> {
    pvc.status
        .as_ref()
        .and_then(|s| s.capacity.as_ref())
        .and_then(|c| c.get("storage"))
}

fn reclaim_policy(pv: &PersistentVolume) -> Option<&str> {
    pv.spec
        .as_ref()
        .and_then(|s| s.persistent_volume_reclaim_policy.as_deref())
}

/// Pick the plan for one claim from live state
pub fn plan_resize(
    pvc: Option<&PersistentVolumeClaim>,
    pv: Option<&PersistentVolume>,
    target: &Quantity,
    config: &EngineConfig,
) -> Result<ResizePlan> {
    let Some(pvc) = pvc else {
        // claim gone but volume kept: the chain stopped after DeletePvc
        return Ok(match pv {
            Some(_) => ResizePlan::Recreate(ResizeStep::UnbindPv),
            None => ResizePlan::Nothing,
        });
    };
    let Some(request) = storage_request(pvc) else {
        return Ok(ResizePlan::Update);
    };
    let request_vs_target = compare(request, target)?;

    if let Some(pv) = pv {
        let stashed = pv.annotations().contains_key(ANNOTATION_PV_LAST_CLAIM_POLICY);
        if request_vs_target == Ordering::Equal && stashed && reclaim_policy(pv) == Some(RECLAIM_RETAIN) {
            return Ok(ResizePlan::Recreate(ResizeStep::RestorePolicy));
        }
        if config.recover_volume_expansion_failure && request_vs_target == Ordering::Greater {
            let covers_capacity = match storage_capacity(pvc) {
                Some(capacity) => compare(target, capacity)? != Ordering::Less,
                None => false,
            };
            if covers_capacity {
                return Ok(ResizePlan::Recreate(ResizeStep::RetainPolicy));
            }
        }
    }

    Ok(match request_vs_target {
        Ordering::Equal => ResizePlan::Nothing,
        Ordering::Less => ResizePlan::Update,
        Ordering::Greater => ResizePlan::Shrink,
    })
}

fn set_storage_request(pvc: &mut PersistentVolumeClaim, target: &Quantity) {
    let spec = pvc.spec.get_or_insert_with(Default::default);
    spec.resources
        .get_or_insert_with(Default::default)
        .requests
        .get_or_insert_with(BTreeMap::new)
        .insert("storage".to_string(), target.clone());
}

fn patch_vertex(original: &Object, object: Object) -> Vertex {
    let mut vertex = Vertex::new(object, Some(Action::Patch));
    vertex.original = Some(original.clone());
    vertex
}

/// PV as a later step of the same pass sees it. Only the first write of the
/// chain is pinned to the version that was read.
fn written(mut pv: PersistentVolume) -> PersistentVolume {
    pv.metadata.resource_version = None;
    pv
}

/// Vertices of every step, in apply order, starting at `from`
fn recreate_steps(
    pvc: Option<&PersistentVolumeClaim>,
    pv: &PersistentVolume,
    new_pvc: PersistentVolumeClaim,
    from: ResizeStep,
) -> Vec<(ResizeStep, Vec<Vertex>)> {
    let pvc_name = new_pvc.name_any();
    let mut steps = Vec::new();
    // PV as it will be after the steps applied so far
    let mut pv_state = pv.clone();

    for step in ResizeStep::ALL.into_iter().filter(|s| *s >= from) {
        let vertices = match step {
            ResizeStep::RetainPolicy => {
                let mut next = pv_state.clone();
                next.labels_mut().insert(LABEL_PVC_NAME.to_string(), pvc_name.clone());
                // an interrupted earlier attempt already stashed the real policy
                if !pv_state.annotations().contains_key(ANNOTATION_PV_LAST_CLAIM_POLICY) {
                    let current = reclaim_policy(&pv_state).unwrap_or(RECLAIM_DELETE).to_string();
                    next.annotations_mut()
                        .insert(ANNOTATION_PV_LAST_CLAIM_POLICY.to_string(), current);
                }
                next.spec.get_or_insert_with(Default::default).persistent_volume_reclaim_policy =
                    Some(RECLAIM_RETAIN.to_string());
                let vertex = patch_vertex(&pv_state.clone().into(), next.clone().into());
                pv_state = written(next);
                vec![vertex]
            }
            ResizeStep::DeletePvc => match pvc {
                Some(live) => {
                    let mut released = live.clone();
                    released.metadata.finalizers = None;
                    let release = patch_vertex(&live.clone().into(), released.into());
                    let delete = Vertex::new(live.clone().into(), Some(Action::Delete));
                    vec![release, delete]
                }
                None => Vec::new(),
            },
            ResizeStep::UnbindPv => {
                let mut next = pv_state.clone();
                if let Some(claim) = next.spec.as_mut().and_then(|s| s.claim_ref.as_mut()) {
                    claim.uid = None;
                    claim.resource_version = None;
                }
                let vertex = patch_vertex(&pv_state.clone().into(), next.clone().into());
                pv_state = written(next);
                vec![vertex]
            }
            ResizeStep::RecreatePvc => {
                vec![Vertex::new(new_pvc.clone().into(), Some(Action::Create))]
            }
            ResizeStep::RestorePolicy => {
                let mut next = pv_state.clone();
                let stashed = next
                    .annotations_mut()
                    .remove(ANNOTATION_PV_LAST_CLAIM_POLICY)
                    .unwrap_or_else(|| RECLAIM_DELETE.to_string());
                next.spec.get_or_insert_with(Default::default).persistent_volume_reclaim_policy =
                    Some(stashed);
                vec![patch_vertex(&pv_state.clone().into(), next.into())]
            }
        };
        steps.push((step, vertices));
    }
    steps
}

/// Hang `steps` below `parent` so the first step applies first
fn chain_steps(
    graph: &mut ObjectGraph,
    parent: VertexId,
    steps: Vec<(ResizeStep, Vec<Vertex>)>,
) -> Result<()> {
    let mut last = parent;
    for (_, vertices) in steps.into_iter().rev() {
        for vertex in vertices.into_iter().rev() {
            last = graph.push_child(vertex, last)?;
        }
    }
    Ok(())
}

/// Claim to recreate: the live one at the target size, or a fresh one from the template
#[allow(clippy::too_many_arguments)]
fn claim_to_recreate(
    live: Option<&PersistentVolumeClaim>,
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    vct: &VolumeClaimTemplate,
    sts_name: &str,
    ordinal: i32,
    pv_name: &str,
    target: &Quantity,
) -> PersistentVolumeClaim {
    let mut pvc = match live {
        Some(live) => {
            let mut pvc = live.clone();
            pvc.metadata.resource_version = None;
            pvc.metadata.uid = None;
            pvc.metadata.creation_timestamp = None;
            pvc.metadata.deletion_timestamp = None;
            pvc.metadata.managed_fields = None;
            pvc.metadata.finalizers = None;
            pvc.status = None;
            pvc
        }
        None => build_pvc(cluster, comp, vct, sts_name, ordinal, None),
    };
    if let Some(annotations) = pvc.metadata.annotations.as_mut() {
        annotations.remove(ANNOTATION_BIND_COMPLETED);
    }
    set_storage_request(&mut pvc, target);
    pvc.spec.get_or_insert_with(Default::default).volume_name = Some(pv_name.to_string());
    pvc
}

/// Inputs of the volume passes of one component
pub struct VolumeContext<'a> {
    pub store: &'a dyn Store,
    pub recorder: &'a dyn EventRecorder,
    pub config: &'a EngineConfig,
    pub cluster: &'a Cluster,
    pub comp: &'a ClusterComponentSpec,
}

impl VolumeContext<'_> {
    async fn find_pv(&self, pvc: Option<&PersistentVolumeClaim>, pvc_name: &str) -> Result<Option<PersistentVolume>> {
        if let Some(volume) = pvc.and_then(|p| p.spec.as_ref()).and_then(|s| s.volume_name.as_deref()) {
            return get_typed::<PersistentVolume>(self.store, None, volume).await;
        }
        let labels: BTreeMap<String, String> =
            [(LABEL_PVC_NAME.to_string(), pvc_name.to_string())].into();
        Ok(list_typed::<PersistentVolume>(self.store, None, &labels)
            .await?
            .into_iter()
            .find(|pv| {
                pv.spec
                    .as_ref()
                    .and_then(|s| s.claim_ref.as_ref())
                    .and_then(|c| c.name.as_deref())
                    == Some(pvc_name)
            }))
    }

    /// Stage the resize of one replica's claim below `workload`
    pub async fn update_pvc_size(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        vct: &VolumeClaimTemplate,
        sts_name: &str,
        ordinal: i32,
    ) -> Result<ResizePlan> {
        let namespace = self.cluster.namespace_or_default();
        let name = pvc_name(&vct.name, sts_name, ordinal);
        let target = Quantity(vct.storage.clone());

        let pvc = get_typed::<PersistentVolumeClaim>(self.store, Some(&namespace), &name).await?;
        let pv = self.find_pv(pvc.as_ref(), &name).await?;
        let plan = plan_resize(pvc.as_ref(), pv.as_ref(), &target, self.config)?;

        match plan {
            ResizePlan::Nothing => {}
            ResizePlan::Update => {
                if let Some(live) = &pvc {
                    let mut resized = live.clone();
                    set_storage_request(&mut resized, &target);
                    let mut vertex = Vertex::new(resized.into(), Some(Action::Update));
                    vertex.original = Some(live.clone().into());
                    graph.push_child(vertex, workload)?;
                    debug!("Expanding PVC {} to {}", name, target.0);
                }
            }
            ResizePlan::Shrink => {
                warn!("Refusing to shrink PVC {} to {}", name, target.0);
                self.recorder
                    .warning(
                        self.cluster,
                        REASON_VOLUME_EXPANSION_FAILED,
                        &format!("PVC {name} cannot be shrunk to {}", target.0),
                    )
                    .await;
            }
            ResizePlan::Recreate(from) => {
                // plan_resize only recreates when a volume exists
                let Some(pv) = pv else {
                    return Ok(ResizePlan::Nothing);
                };
                let new_pvc = claim_to_recreate(
                    pvc.as_ref(),
                    self.cluster,
                    self.comp,
                    vct,
                    sts_name,
                    ordinal,
                    &pv.name_any(),
                    &target,
                );
                info!("Recreating PVC {} on PV {} from step {:?}", name, pv.name_any(), from);
                let steps = recreate_steps(pvc.as_ref(), &pv, new_pvc, from);
                chain_steps(graph, workload, steps)?;
            }
        }
        Ok(plan)
    }

    /// Resize every claim of the live workload, highest ordinal first
    pub async fn expand_volumes(
        &self,
        graph: &mut ObjectGraph,
        workload: VertexId,
        sts_name: &str,
        live_replicas: i32,
    ) -> Result<()> {
        for vct in &self.comp.volume_claim_templates {
            for ordinal in (0..live_replicas).rev() {
                self.update_pvc_size(graph, workload, vct, sts_name, ordinal).await?;
            }
        }
        Ok(())
    }

    /// Phase implied by claims still expanding or failed to expand
    pub async fn expansion_status(
        &self,
        sts_name: &str,
    ) -> Result<Option<(ComponentPhase, ComponentMessageMap)>> {
        let namespace = self.cluster.namespace_or_default();
        let mut failed = ComponentMessageMap::new();
        let mut running = false;

        for vct in &self.comp.volume_claim_templates {
            for ordinal in 0..self.comp.replicas {
                let name = pvc_name(&vct.name, sts_name, ordinal);
                let Some(pvc) =
                    get_typed::<PersistentVolumeClaim>(self.store, Some(&namespace), &name).await?
                else {
                    continue;
                };
                let resize_failure = pvc
                    .status
                    .as_ref()
                    .and_then(|s| s.allocated_resource_statuses.as_ref())
                    .and_then(|s| s.values().find(|v| v.ends_with("ResizeFailed")).cloned());
                if let Some(status) = resize_failure {
                    failed.set_object_message(
                        ObjectKind::PersistentVolumeClaim.as_str(),
                        &name,
                        format!("Volume Expansion failed: {status}"),
                    );
                    continue;
                }
                if let (Some(request), Some(capacity)) = (storage_request(&pvc), storage_capacity(&pvc)) {
                    if compare(capacity, request)? == Ordering::Less {
                        running = true;
                    }
                }
            }
        }

        if !failed.is_empty() {
            return Ok(Some((ComponentPhase::Abnormal, failed)));
        }
        if running {
            return Ok(Some((ComponentPhase::Updating, ComponentMessageMap::new())));
        }
        Ok(None)
    }
}

#[cfg(test)]
#[path = "volume_test.rs"]
mod volume_test;
