//! Shared builders for controller tests

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use super::resources::{build_pvc, build_statefulset};
use crate::crd::{Cluster, ClusterComponentSpec, ClusterSpec, VolumeClaimTemplate, WorkloadType};

pub fn component(workload_type: WorkloadType, replicas: i32) -> ClusterComponentSpec {
    ClusterComponentSpec {
        name: "mysql".to_string(),
        workload_type,
        image: "mysql:8.0".to_string(),
        replicas,
        volume_claim_templates: vec![VolumeClaimTemplate {
            name: "data".to_string(),
            storage: "10Gi".to_string(),
            storage_class_name: Some("standard".to_string()),
            volume_type: None,
        }],
        ..Default::default()
    }
}

pub fn cluster(components: Vec<ClusterComponentSpec>) -> Cluster {
    let mut cluster = Cluster::new(
        "db",
        ClusterSpec {
            component_specs: components,
        },
    );
    cluster.metadata.namespace = Some("default".to_string());
    cluster.metadata.uid = Some("0b1c6d3e-uid".to_string());
    cluster.metadata.generation = Some(1);
    cluster
}

/// StatefulSet of `comp` reporting every replica ready on one revision
pub fn ready_statefulset(cluster: &Cluster, comp: &ClusterComponentSpec) -> StatefulSet {
    let mut sts = build_statefulset(cluster, comp);
    sts.metadata.generation = Some(1);
    sts.status = Some(StatefulSetStatus {
        replicas: comp.replicas,
        ready_replicas: Some(comp.replicas),
        available_replicas: Some(comp.replicas),
        current_revision: Some("rev-1".to_string()),
        update_revision: Some("rev-1".to_string()),
        observed_generation: Some(1),
        ..Default::default()
    });
    sts
}

/// Bound claim of one replica with capacity equal to its request
pub fn bound_pvc(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    ordinal: i32,
    volume_name: &str,
) -> PersistentVolumeClaim {
    let vct = &comp.volume_claim_templates[0];
    let sts_name = format!("{}-{}", cluster.metadata.name.as_deref().unwrap_or_default(), comp.name);
    let mut pvc = build_pvc(cluster, comp, vct, &sts_name, ordinal, None);
    if let Some(spec) = pvc.spec.as_mut() {
        spec.volume_name = Some(volume_name.to_string());
    }
    let mut capacity = BTreeMap::new();
    capacity.insert("storage".to_string(), Quantity(vct.storage.clone()));
    pvc.status = Some(PersistentVolumeClaimStatus {
        phase: Some("Bound".to_string()),
        capacity: Some(capacity),
        ..Default::default()
    });
    pvc
}
