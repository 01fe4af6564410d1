//! Kubernetes resource builders for Cluster components
//!
//! This module builds the desired objects of a component (workload, services,
//! env ConfigMap, PDB, volume claims) and the temporary objects of a
//! scale-out (Backup, restore Job). Builders are pure: the component engine
//! stages their output in the object graph and the resolver decides whether
//! each object is created or left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec, StatefulSetUpdateStrategy,
};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, TypedLocalObjectReference, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::crd::{
    Backup, BackupSpec, BackupTool, BackupType, Cluster, ClusterComponentSpec,
    VolumeClaimTemplate, VolumeSnapshot, WorkloadType,
};
use crate::error::{Error, Result};

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_APP_INSTANCE: &str = "app.kubernetes.io/instance";
pub const LABEL_APP_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const APP_NAME: &str = "replicadb";
pub const MANAGED_BY_VALUE: &str = "replicadb";

pub const LABEL_COMPONENT_NAME: &str = "apps.replicadb.io/component-name";
/// Set on temporary data-protection objects; value is the owning cluster
pub const LABEL_CLUSTER_MANAGED_BY: &str = "apps.replicadb.io/managed-by";
pub const LABEL_VOLUME_CLAIM_TEMPLATE: &str = "apps.replicadb.io/vct-name";
pub const LABEL_ROLE: &str = "replicadb.io/role";
/// Stamped on a retained PV so the recreated claim can find it
pub const LABEL_PVC_NAME: &str = "replicadb.io/pvc-name";
pub const LABEL_BACKUP_NAME: &str = "dataprotection.replicadb.io/backup-name";
pub const LABEL_CONTROLLER_REVISION_HASH: &str = "controller-revision-hash";

/// Cluster generation the workload was last built from
pub const ANNOTATION_GENERATION: &str = "replicadb.io/generation";
/// Replica count every pod of a component was last told about
pub const ANNOTATION_COMPONENT_REPLICAS: &str = "apps.replicadb.io/component-replicas";
/// Reclaim policy a PV had before the resize sequencer retained it
pub const ANNOTATION_PV_LAST_CLAIM_POLICY: &str = "replicadb.io/pv-last-claim-policy";
pub const ANNOTATION_BACKUP_POLICY_TEMPLATE: &str = "dataprotection.replicadb.io/backup-policy-template";
pub const ANNOTATION_BIND_COMPLETED: &str = "pv.kubernetes.io/bind-completed";

pub const DEFAULT_SERVICE_PORT: i32 = 3306;
pub const DATA_MOUNT_PATH: &str = "/data";
pub const BACKUP_MOUNT_PATH: &str = "/backupdata";
const RESTORE_BACKOFF_LIMIT: i32 = 3;

/// Labels shared by every object of a cluster
pub fn cluster_labels(cluster: &Cluster) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP_NAME.to_string(), APP_NAME.to_string());
    labels.insert(LABEL_APP_INSTANCE.to_string(), cluster.name_any());
    labels.insert(LABEL_APP_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels
}

/// Labels of the objects of one component
pub fn component_labels(cluster: &Cluster, comp: &ClusterComponentSpec) -> BTreeMap<String, String> {
    let mut labels = cluster_labels(cluster);
    labels.insert(LABEL_COMPONENT_NAME.to_string(), comp.name.clone());
    labels
}

/// Selector labels of a component's pods
pub fn component_selector(cluster: &Cluster, comp: &ClusterComponentSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP_INSTANCE.to_string(), cluster.name_any());
    labels.insert(LABEL_APP_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_COMPONENT_NAME.to_string(), comp.name.clone());
    labels
}

/// Labels of the temporary Backup and restore Job objects of a component
pub fn data_clone_labels(cluster: &Cluster, comp: &ClusterComponentSpec) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_APP_INSTANCE.to_string(), cluster.name_any());
    labels.insert(LABEL_COMPONENT_NAME.to_string(), comp.name.clone());
    labels.insert(LABEL_CLUSTER_MANAGED_BY.to_string(), cluster.name_any());
    labels
}

/// Create an OwnerReference for garbage collection
pub fn owner_reference(cluster: &Cluster) -> OwnerReference {
    OwnerReference {
        api_version: Cluster::api_version(&()).to_string(),
        kind: Cluster::kind(&()).to_string(),
        name: cluster.name_any(),
        uid: cluster.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// `<cluster>-<component>`, the name of the workload and its services
pub fn workload_name(cluster: &Cluster, comp: &ClusterComponentSpec) -> String {
    format!("{}-{}", cluster.name_any(), comp.name)
}

pub fn headless_service_name(cluster: &Cluster, comp: &ClusterComponentSpec) -> String {
    format!("{}-headless", workload_name(cluster, comp))
}

pub fn env_config_map_name(cluster: &Cluster, comp: &ClusterComponentSpec) -> String {
    format!("{}-env", workload_name(cluster, comp))
}

/// `<vct>-<sts>-<ordinal>`, the claim a StatefulSet creates for one replica
pub fn pvc_name(vct: &str, sts_name: &str, ordinal: i32) -> String {
    format!("{vct}-{sts_name}-{ordinal}")
}

pub fn pod_name(sts_name: &str, ordinal: i32) -> String {
    format!("{sts_name}-{ordinal}")
}

/// Backup taken from an existing replica to seed new ones
pub fn scaling_backup_name(sts_name: &str) -> String {
    format!("{sts_name}-scaling")
}

pub fn restore_job_name(pvc_name: &str) -> String {
    format!("restore-{pvc_name}")
}

fn object_meta(cluster: &Cluster, name: String, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace_or_default()),
        labels: Some(labels),
        owner_references: Some(vec![owner_reference(cluster)]),
        ..Default::default()
    }
}

fn storage_requests(storage: &str) -> VolumeResourceRequirements {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(storage.to_string()));
    VolumeResourceRequirements {
        requests: Some(requests),
        ..Default::default()
    }
}

// ============================================================================
// Workloads
// ============================================================================

fn build_pod_template(cluster: &Cluster, comp: &ClusterComponentSpec) -> PodTemplateSpec {
    let port = comp.service_port.unwrap_or(DEFAULT_SERVICE_PORT);

    let volume_mounts: Vec<VolumeMount> = comp
        .volume_claim_templates
        .iter()
        .map(|vct| VolumeMount {
            name: vct.name.clone(),
            mount_path: format!("{}/{}", DATA_MOUNT_PATH, vct.name),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: comp.name.clone(),
        image: Some(comp.image.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("db".to_string()),
            container_port: port,
            ..Default::default()
        }]),
        env_from: Some(vec![EnvFromSource {
            config_map_ref: Some(ConfigMapEnvSource {
                name: Some(env_config_map_name(cluster, comp)),
                optional: Some(false),
            }),
            ..Default::default()
        }]),
        volume_mounts: if volume_mounts.is_empty() {
            None
        } else {
            Some(volume_mounts)
        },
        ..Default::default()
    };

    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(component_labels(cluster, comp)),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![container],
            ..Default::default()
        }),
    }
}

/// Claim template of a StatefulSet. Claims made from it carry the component labels.
pub fn volume_claim_template(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    vct: &VolumeClaimTemplate,
) -> PersistentVolumeClaim {
    let mut labels = component_labels(cluster, comp);
    labels.insert(LABEL_VOLUME_CLAIM_TEMPLATE.to_string(), vct.name.clone());
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(vct.name.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: vct.storage_class_name.clone(),
            resources: Some(storage_requests(&vct.storage)),
            ..Default::default()
        }),
        status: None,
    }
}

fn workload_meta(cluster: &Cluster, comp: &ClusterComponentSpec) -> ObjectMeta {
    let mut meta = object_meta(
        cluster,
        workload_name(cluster, comp),
        component_labels(cluster, comp),
    );
    let mut annotations = BTreeMap::new();
    annotations.insert(
        ANNOTATION_GENERATION.to_string(),
        cluster.generation().to_string(),
    );
    meta.annotations = Some(annotations);
    meta
}

/// Consensus pods are restarted by the operator in role order
pub const UPDATE_STRATEGY_ON_DELETE: &str = "OnDelete";

fn statefulset_update_strategy(comp: &ClusterComponentSpec) -> Option<StatefulSetUpdateStrategy> {
    (comp.workload_type == WorkloadType::Consensus).then(|| StatefulSetUpdateStrategy {
        type_: Some(UPDATE_STRATEGY_ON_DELETE.to_string()),
        rolling_update: None,
    })
}

pub fn build_statefulset(cluster: &Cluster, comp: &ClusterComponentSpec) -> StatefulSet {
    let templates: Vec<PersistentVolumeClaim> = comp
        .volume_claim_templates
        .iter()
        .map(|vct| volume_claim_template(cluster, comp, vct))
        .collect();

    StatefulSet {
        metadata: workload_meta(cluster, comp),
        spec: Some(StatefulSetSpec {
            replicas: Some(comp.replicas),
            service_name: headless_service_name(cluster, comp),
            pod_management_policy: Some("Parallel".to_string()),
            selector: LabelSelector {
                match_labels: Some(component_selector(cluster, comp)),
                ..Default::default()
            },
            template: build_pod_template(cluster, comp),
            update_strategy: statefulset_update_strategy(comp),
            volume_claim_templates: if templates.is_empty() {
                None
            } else {
                Some(templates)
            },
            ..Default::default()
        }),
        status: None,
    }
}

pub fn build_deployment(cluster: &Cluster, comp: &ClusterComponentSpec) -> Deployment {
    Deployment {
        metadata: workload_meta(cluster, comp),
        spec: Some(DeploymentSpec {
            replicas: Some(comp.replicas),
            selector: LabelSelector {
                match_labels: Some(component_selector(cluster, comp)),
                ..Default::default()
            },
            template: build_pod_template(cluster, comp),
            ..Default::default()
        }),
        status: None,
    }
}

// ============================================================================
// Services and env
// ============================================================================

fn service_ports(comp: &ClusterComponentSpec) -> Vec<ServicePort> {
    let port = comp.service_port.unwrap_or(DEFAULT_SERVICE_PORT);
    vec![ServicePort {
        name: Some("db".to_string()),
        port,
        target_port: Some(IntOrString::String("db".to_string())),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}

pub fn build_service(cluster: &Cluster, comp: &ClusterComponentSpec) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            workload_name(cluster, comp),
            component_labels(cluster, comp),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(component_selector(cluster, comp)),
            ports: Some(service_ports(comp)),
            ..Default::default()
        }),
        status: None,
    }
}

/// Headless service giving each StatefulSet pod a stable DNS name
pub fn build_headless_service(cluster: &Cluster, comp: &ClusterComponentSpec) -> Service {
    Service {
        metadata: object_meta(
            cluster,
            headless_service_name(cluster, comp),
            component_labels(cluster, comp),
        ),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(component_selector(cluster, comp)),
            ports: Some(service_ports(comp)),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        status: None,
    }
}

/// Env ConfigMap read by every pod: replica count and peer host names
pub fn build_env_config_map(cluster: &Cluster, comp: &ClusterComponentSpec) -> ConfigMap {
    let sts_name = workload_name(cluster, comp);
    let headless = headless_service_name(cluster, comp);
    let namespace = cluster.namespace_or_default();

    let mut data = BTreeMap::new();
    data.insert(
        "REPLICADB_REPLICA_COUNT".to_string(),
        comp.replicas.to_string(),
    );
    data.insert("REPLICADB_CLUSTER_NAME".to_string(), cluster.name_any());
    data.insert("REPLICADB_COMP_NAME".to_string(), comp.name.clone());
    if comp.workload_type != WorkloadType::Stateless {
        for i in 0..comp.replicas {
            data.insert(
                format!("REPLICADB_{i}_HOSTNAME"),
                format!("{}.{}.{}.svc", pod_name(&sts_name, i), headless, namespace),
            );
        }
    }

    ConfigMap {
        metadata: object_meta(
            cluster,
            env_config_map_name(cluster, comp),
            component_labels(cluster, comp),
        ),
        data: Some(data),
        ..Default::default()
    }
}

/// PodDisruptionBudget of a component, when one is requested.
///
/// A budget without `minAvailable` never passes spec validation, so reaching
/// the builder with one is an engine bug.
pub fn build_pdb(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
) -> Result<Option<PodDisruptionBudget>> {
    let Some(pdb) = &comp.pod_disruption_budget else {
        return Ok(None);
    };
    let min_available = pdb.min_available.clone().ok_or_else(|| {
        Error::InvalidGraph(format!(
            "component {} requests a PodDisruptionBudget without minAvailable",
            comp.name
        ))
    })?;

    Ok(Some(PodDisruptionBudget {
        metadata: object_meta(
            cluster,
            workload_name(cluster, comp),
            component_labels(cluster, comp),
        ),
        spec: Some(PodDisruptionBudgetSpec {
            selector: Some(LabelSelector {
                match_labels: Some(component_selector(cluster, comp)),
                ..Default::default()
            }),
            min_available: Some(min_available),
            ..Default::default()
        }),
        status: None,
    }))
}

// ============================================================================
// Volumes
// ============================================================================

/// Claim for one replica, optionally restored from a volume snapshot.
///
/// The claim is named and labelled exactly as the StatefulSet controller
/// would name it, so the workload adopts it when the replica starts.
pub fn build_pvc(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    vct: &VolumeClaimTemplate,
    sts_name: &str,
    ordinal: i32,
    snapshot: Option<&str>,
) -> PersistentVolumeClaim {
    let mut pvc = volume_claim_template(cluster, comp, vct);
    pvc.metadata.name = Some(pvc_name(&vct.name, sts_name, ordinal));
    pvc.metadata.namespace = Some(cluster.namespace_or_default());
    if let (Some(spec), Some(snapshot)) = (pvc.spec.as_mut(), snapshot) {
        spec.data_source = Some(TypedLocalObjectReference {
            api_group: Some(VolumeSnapshot::group(&()).to_string()),
            kind: VolumeSnapshot::kind(&()).to_string(),
            name: snapshot.to_string(),
        });
    }
    pvc
}

// ============================================================================
// Data protection
// ============================================================================

pub fn build_backup(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    name: &str,
    policy_name: &str,
    backup_type: BackupType,
) -> Backup {
    let mut backup = Backup::new(
        name,
        BackupSpec {
            backup_policy_name: policy_name.to_string(),
            backup_type,
        },
    );
    backup.metadata.namespace = Some(cluster.namespace_or_default());
    backup.metadata.labels = Some(data_clone_labels(cluster, comp));
    backup
}

/// Job that fills `pvc_name` from the artifacts of a completed backup.
///
/// The backup's own claim is mounted read-only at `/backupdata`, the target
/// claim at `/data`, and the tool's restore commands run in order.
pub fn build_restore_job(
    cluster: &Cluster,
    comp: &ClusterComponentSpec,
    pvc_name: &str,
    backup: &Backup,
    tool: &BackupTool,
) -> Result<Job> {
    let backup_pvc = backup
        .status
        .as_ref()
        .and_then(|s| s.persistent_volume_claim_name.clone())
        .ok_or_else(|| Error::DomainFailure {
            kind: "Backup".to_string(),
            name: backup.name_any(),
            message: "completed backup does not name its volume claim".to_string(),
        })?;

    let mut env: Vec<EnvVar> = tool
        .spec
        .env
        .iter()
        .map(|(k, v)| EnvVar {
            name: k.clone(),
            value: Some(v.clone()),
            ..Default::default()
        })
        .collect();
    env.push(EnvVar {
        name: "BACKUP_NAME".to_string(),
        value: Some(backup.name_any()),
        ..Default::default()
    });
    env.push(EnvVar {
        name: "BACKUP_DIR".to_string(),
        value: Some(BACKUP_MOUNT_PATH.to_string()),
        ..Default::default()
    });

    let container = Container {
        name: "restore".to_string(),
        image: Some(tool.spec.image.clone()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(vec![tool.spec.restore_commands.join("\n")]),
        env: Some(env),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "backup-data".to_string(),
                mount_path: BACKUP_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            },
            VolumeMount {
                name: "data".to_string(),
                mount_path: DATA_MOUNT_PATH.to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    let volumes = vec![
        Volume {
            name: "backup-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: backup_pvc,
                read_only: Some(true),
            }),
            ..Default::default()
        },
        Volume {
            name: "data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        },
    ];

    Ok(Job {
        metadata: ObjectMeta {
            name: Some(restore_job_name(pvc_name)),
            namespace: Some(cluster.namespace_or_default()),
            labels: Some(data_clone_labels(cluster, comp)),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(RESTORE_BACKOFF_LIMIT),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(data_clone_labels(cluster, comp)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: Some(volumes),
                    restart_policy: Some("OnFailure".to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    })
}
