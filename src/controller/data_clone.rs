//! Data-clone engine
//!
//! Seeds the volumes of new replicas during a horizontal scale-out. A
//! strategy is picked once per pass from the component's scale policy and
//! the storage capabilities of the backup volume:
//!
//! - [`DummyClone`]: no policy, new replicas start from empty claims.
//! - [`SnapshotClone`]: a snapshot Backup of an existing replica, new
//!   claims are provisioned from the resulting volume snapshot.
//! - [`BackupToolClone`]: a datafile Backup, new claims are filled by a
//!   restore Job running the policy's backup tool.
//!
//! Every step returns the objects to create and never waits. A backup or
//! restore still in progress yields no objects; the next pass looks again.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::ResourceExt;
use tracing::{debug, info};

use super::config::EngineConfig;
use super::events::{
    EventRecorder, REASON_BACKUP_JOB_CREATE, REASON_BACKUP_JOB_DELETE, REASON_HORIZONTAL_SCALE,
};
use super::object::{Object, ObjectKey};
use super::resources::{
    build_backup, build_pvc, build_restore_job, data_clone_labels, pvc_name, restore_job_name,
    scaling_backup_name, ANNOTATION_BACKUP_POLICY_TEMPLATE, LABEL_APP_INSTANCE, LABEL_BACKUP_NAME,
};
use super::store::{get_typed, list_typed, Store};
use crate::crd::{
    Backup, BackupPhase, BackupPolicy, BackupTool, BackupType, Cluster, ClusterComponentSpec,
    HScaleDataClonePolicy, VolumeClaimTemplate, VolumeSnapshot, VolumeSnapshotClass,
};
use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataCloneState {
    NotCreated,
    Processing,
    ReadyToUse,
    Failed(String),
}

/// Claim of a new replica that must be restored from the backup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RestoreTarget {
    pub ordinal: i32,
    pub key: ObjectKey,
}

/// Everything a strategy needs for one scale-out
pub struct CloneContext<'a> {
    pub store: &'a dyn Store,
    pub recorder: &'a dyn EventRecorder,
    pub cluster: &'a Cluster,
    pub comp: &'a ClusterComponentSpec,
    pub sts_name: String,
    /// Replica count of the live workload
    pub old_replicas: i32,
    pub new_replicas: i32,
}

impl CloneContext<'_> {
    fn namespace(&self) -> String {
        self.cluster.namespace_or_default()
    }

    fn pvc_key(&self, vct: &str, ordinal: i32) -> ObjectKey {
        ObjectKey::of::<PersistentVolumeClaim>(
            Some(&self.namespace()),
            pvc_name(vct, &self.sts_name, ordinal),
        )
    }

    fn backup_name(&self) -> String {
        scaling_backup_name(&self.sts_name)
    }

    fn backup_vct(&self) -> Result<&VolumeClaimTemplate> {
        self.comp.backup_volume_template().ok_or_else(|| {
            Error::ValidationError(format!(
                "component {} has no volume claim template to clone",
                self.comp.name
            ))
        })
    }

    fn new_ordinals(&self) -> std::ops::Range<i32> {
        self.old_replicas..self.new_replicas
    }

    async fn pvc_exists(&self, key: &ObjectKey) -> Result<bool> {
        Ok(self.store.get(key).await?.is_some())
    }

    /// Whether every claim of every new replica exists
    async fn all_pvcs_exist(&self) -> Result<bool> {
        for vct in &self.comp.volume_claim_templates {
            for ordinal in self.new_ordinals() {
                if !self.pvc_exists(&self.pvc_key(&vct.name, ordinal)).await? {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    /// Empty claims for the new replicas that do not have one yet
    async fn missing_pvcs(&self, vcts: &[&VolumeClaimTemplate]) -> Result<Vec<Object>> {
        let mut objects = Vec::new();
        for vct in vcts.iter().copied() {
            for ordinal in self.new_ordinals() {
                if self.pvc_exists(&self.pvc_key(&vct.name, ordinal)).await? {
                    continue;
                }
                let pvc = build_pvc(self.cluster, self.comp, vct, &self.sts_name, ordinal, None);
                objects.push(pvc.into());
            }
        }
        Ok(objects)
    }

    async fn backup_policy(&self) -> Result<BackupPolicy> {
        let template = self
            .comp
            .horizontal_scale_policy
            .as_ref()
            .and_then(|p| p.backup_policy_template.as_deref())
            .ok_or_else(|| {
                Error::ValidationError(format!(
                    "component {} clones volumes but names no backup policy template",
                    self.comp.name
                ))
            })?;
        let labels: BTreeMap<String, String> =
            [(LABEL_APP_INSTANCE.to_string(), self.cluster.name_any())].into();
        let policies = list_typed::<BackupPolicy>(self.store, Some(&self.namespace()), &labels).await?;
        policies
            .into_iter()
            .find(|p| {
                p.annotations().get(ANNOTATION_BACKUP_POLICY_TEMPLATE).map(String::as_str)
                    == Some(template)
            })
            .ok_or_else(|| Error::NotFound {
                kind: "BackupPolicy".to_string(),
                name: format!("from template {template}"),
            })
    }

    async fn create_backup(&self, backup_type: BackupType) -> Result<Vec<Object>> {
        let policy = self.backup_policy().await?;
        let name = self.backup_name();
        let backup = build_backup(self.cluster, self.comp, &name, &policy.name_any(), backup_type);
        self.recorder
            .normal(self.cluster, REASON_BACKUP_JOB_CREATE, &format!("Create backupJob/{name}"))
            .await;
        info!("Staging {:?} backup {} for scale-out of {}", backup_type, name, self.sts_name);
        Ok(vec![backup.into()])
    }

    async fn scaling_backup_status(&self) -> Result<DataCloneState> {
        let Some(backup) = get_typed::<Backup>(self.store, Some(&self.namespace()), &self.backup_name()).await?
        else {
            return Ok(DataCloneState::NotCreated);
        };
        Ok(match backup.phase() {
            Some(BackupPhase::Failed) => DataCloneState::Failed(
                backup
                    .status
                    .and_then(|s| s.failure_reason)
                    .unwrap_or_else(|| "backup failed".to_string()),
            ),
            Some(BackupPhase::Completed) => DataCloneState::ReadyToUse,
            _ => DataCloneState::Processing,
        })
    }

    async fn data_clone_backups(&self) -> Result<Vec<Backup>> {
        list_typed::<Backup>(
            self.store,
            Some(&self.namespace()),
            &data_clone_labels(self.cluster, self.comp),
        )
        .await
    }
}

/// Failure message of a Job whose `Failed` condition is true
pub fn job_failure(job: &Job) -> Option<String> {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Failed" && c.status == "True"))
        .map(|c| {
            c.message
                .clone()
                .or_else(|| c.reason.clone())
                .unwrap_or_else(|| "job failed".to_string())
        })
}

#[async_trait]
pub trait DataClone: Send + Sync {
    fn base(&self) -> &CloneContext<'_>;

    /// Every new replica has its volumes, with data where cloning applies
    async fn succeed(&self) -> Result<bool>;

    /// Temporary objects to delete once the new replicas are settled
    async fn clear_tmp_resources(&self) -> Result<Vec<Object>>;

    async fn check_backup_status(&self) -> Result<DataCloneState>;

    async fn backup(&self) -> Result<Vec<Object>>;

    async fn pvc_keys_to_restore(&self) -> Result<Vec<RestoreTarget>> {
        let ctx = self.base();
        let vct = ctx.backup_vct()?;
        Ok(ctx
            .new_ordinals()
            .map(|ordinal| RestoreTarget {
                ordinal,
                key: ctx.pvc_key(&vct.name, ordinal),
            })
            .collect())
    }

    async fn check_restore_status(&self, target: &RestoreTarget) -> Result<DataCloneState>;

    async fn restore(&self, target: &RestoreTarget) -> Result<Vec<Object>>;

    /// Objects to create for the next step of the clone
    async fn clone_data(&self) -> Result<Vec<Object>> {
        let ctx = self.base();
        match self.check_backup_status().await? {
            DataCloneState::NotCreated => return self.backup().await,
            DataCloneState::Processing => {
                debug!("Backup {} still in progress", ctx.backup_name());
                return Ok(Vec::new());
            }
            DataCloneState::Failed(message) => {
                return Err(Error::DomainFailure {
                    kind: "Backup".to_string(),
                    name: ctx.backup_name(),
                    message,
                })
            }
            DataCloneState::ReadyToUse => {}
        }

        let mut objects = Vec::new();
        for target in self.pvc_keys_to_restore().await? {
            match self.check_restore_status(&target).await? {
                DataCloneState::NotCreated => objects.extend(self.restore(&target).await?),
                DataCloneState::Processing | DataCloneState::ReadyToUse => {}
                DataCloneState::Failed(message) => {
                    return Err(Error::DomainFailure {
                        kind: "Job".to_string(),
                        name: restore_job_name(&target.key.name),
                        message,
                    })
                }
            }
        }

        let backup_vct = ctx.backup_vct()?.name.clone();
        let others: Vec<&VolumeClaimTemplate> = ctx
            .comp
            .volume_claim_templates
            .iter()
            .filter(|v| v.name != backup_vct)
            .collect();
        objects.extend(ctx.missing_pvcs(&others).await?);
        Ok(objects)
    }
}

/// New replicas start from empty volumes
pub struct DummyClone<'a> {
    ctx: CloneContext<'a>,
}

#[async_trait]
impl DataClone for DummyClone<'_> {
    fn base(&self) -> &CloneContext<'_> {
        &self.ctx
    }

    async fn succeed(&self) -> Result<bool> {
        self.ctx.all_pvcs_exist().await
    }

    async fn clear_tmp_resources(&self) -> Result<Vec<Object>> {
        Ok(Vec::new())
    }

    async fn check_backup_status(&self) -> Result<DataCloneState> {
        Ok(DataCloneState::ReadyToUse)
    }

    async fn backup(&self) -> Result<Vec<Object>> {
        Ok(Vec::new())
    }

    async fn pvc_keys_to_restore(&self) -> Result<Vec<RestoreTarget>> {
        Ok(Vec::new())
    }

    async fn check_restore_status(&self, _target: &RestoreTarget) -> Result<DataCloneState> {
        Ok(DataCloneState::ReadyToUse)
    }

    async fn restore(&self, _target: &RestoreTarget) -> Result<Vec<Object>> {
        Ok(Vec::new())
    }

    async fn clone_data(&self) -> Result<Vec<Object>> {
        let vcts: Vec<&VolumeClaimTemplate> =
            self.ctx.comp.volume_claim_templates.iter().collect();
        self.ctx.missing_pvcs(&vcts).await
    }
}

/// Clone through a volume snapshot of an existing replica
pub struct SnapshotClone<'a> {
    ctx: CloneContext<'a>,
}

#[async_trait]
impl DataClone for SnapshotClone<'_> {
    fn base(&self) -> &CloneContext<'_> {
        &self.ctx
    }

    async fn succeed(&self) -> Result<bool> {
        if self.ctx.comp.volume_claim_templates.is_empty() {
            self.ctx
                .recorder
                .normal(
                    self.ctx.cluster,
                    REASON_HORIZONTAL_SCALE,
                    "no VolumeClaimTemplates, no need to do data clone.",
                )
                .await;
            return Ok(true);
        }
        self.ctx.all_pvcs_exist().await
    }

    /// The Backup backs the snapshot the new claims are provisioned from,
    /// so it is only removed once every claim of the component is bound.
    async fn clear_tmp_resources(&self) -> Result<Vec<Object>> {
        let ctx = &self.ctx;
        let vct = ctx.backup_vct()?;
        let namespace = ctx.namespace();
        for ordinal in 0..ctx.new_replicas {
            let name = pvc_name(&vct.name, &ctx.sts_name, ordinal);
            let bound = get_typed::<PersistentVolumeClaim>(ctx.store, Some(&namespace), &name)
                .await?
                .and_then(|pvc| pvc.status)
                .and_then(|s| s.phase)
                .is_some_and(|phase| phase == "Bound");
            if !bound {
                debug!("PVC {} not bound yet, keeping scale-out backup", name);
                return Ok(Vec::new());
            }
        }

        let backups = ctx.data_clone_backups().await?;
        for backup in &backups {
            ctx.recorder
                .normal(
                    ctx.cluster,
                    REASON_BACKUP_JOB_DELETE,
                    &format!("Delete backupJob/{}", backup.name_any()),
                )
                .await;
        }
        Ok(backups.into_iter().map(Object::from).collect())
    }

    async fn check_backup_status(&self) -> Result<DataCloneState> {
        self.ctx.scaling_backup_status().await
    }

    async fn backup(&self) -> Result<Vec<Object>> {
        self.ctx.create_backup(BackupType::Snapshot).await
    }

    async fn check_restore_status(&self, target: &RestoreTarget) -> Result<DataCloneState> {
        Ok(if self.ctx.pvc_exists(&target.key).await? {
            DataCloneState::ReadyToUse
        } else {
            DataCloneState::NotCreated
        })
    }

    async fn restore(&self, target: &RestoreTarget) -> Result<Vec<Object>> {
        let ctx = &self.ctx;
        let namespace = ctx.namespace();
        let backup = ctx
            .data_clone_backups()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::NotFound {
                kind: "Backup".to_string(),
                name: ctx.backup_name(),
            })?;
        let labels: BTreeMap<String, String> =
            [(LABEL_BACKUP_NAME.to_string(), backup.name_any())].into();
        let snapshot = list_typed::<VolumeSnapshot>(ctx.store, Some(&namespace), &labels)
            .await?
            .into_iter()
            .find(|s| s.metadata.deletion_timestamp.is_none())
            .ok_or_else(|| Error::NotFound {
                kind: "VolumeSnapshot".to_string(),
                name: format!("of backup {}", backup.name_any()),
            })?;

        let vct = ctx.backup_vct()?;
        let pvc = build_pvc(
            ctx.cluster,
            ctx.comp,
            vct,
            &ctx.sts_name,
            target.ordinal,
            Some(&snapshot.name_any()),
        );
        Ok(vec![pvc.into()])
    }
}

/// Clone through a datafile backup and per-claim restore Jobs
pub struct BackupToolClone<'a> {
    ctx: CloneContext<'a>,
}

impl BackupToolClone<'_> {
    async fn restore_job(&self, target: &RestoreTarget) -> Result<Option<Job>> {
        get_typed::<Job>(
            self.ctx.store,
            Some(&self.ctx.namespace()),
            &restore_job_name(&target.key.name),
        )
        .await
    }
}

#[async_trait]
impl DataClone for BackupToolClone<'_> {
    fn base(&self) -> &CloneContext<'_> {
        &self.ctx
    }

    async fn succeed(&self) -> Result<bool> {
        if !self.ctx.all_pvcs_exist().await? {
            return Ok(false);
        }
        for target in self.pvc_keys_to_restore().await? {
            if self.check_restore_status(&target).await? != DataCloneState::ReadyToUse {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn clear_tmp_resources(&self) -> Result<Vec<Object>> {
        let ctx = &self.ctx;
        let labels = data_clone_labels(ctx.cluster, ctx.comp);
        let mut objects: Vec<Object> = ctx
            .data_clone_backups()
            .await?
            .into_iter()
            .map(Object::from)
            .collect();
        objects.extend(
            list_typed::<Job>(ctx.store, Some(&ctx.namespace()), &labels)
                .await?
                .into_iter()
                .map(Object::from),
        );
        Ok(objects)
    }

    async fn check_backup_status(&self) -> Result<DataCloneState> {
        self.ctx.scaling_backup_status().await
    }

    async fn backup(&self) -> Result<Vec<Object>> {
        self.ctx.create_backup(BackupType::Datafile).await
    }

    async fn check_restore_status(&self, target: &RestoreTarget) -> Result<DataCloneState> {
        let Some(job) = self.restore_job(target).await? else {
            return Ok(DataCloneState::NotCreated);
        };
        if job.status.as_ref().and_then(|s| s.succeeded).unwrap_or(0) >= 1 {
            return Ok(DataCloneState::ReadyToUse);
        }
        Ok(match job_failure(&job) {
            Some(message) => DataCloneState::Failed(message),
            None => DataCloneState::Processing,
        })
    }

    async fn restore(&self, target: &RestoreTarget) -> Result<Vec<Object>> {
        let ctx = &self.ctx;
        let namespace = ctx.namespace();
        let backup = get_typed::<Backup>(ctx.store, Some(&namespace), &ctx.backup_name())
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "Backup".to_string(),
                name: ctx.backup_name(),
            })?;
        let tool_name = backup
            .status
            .as_ref()
            .and_then(|s| s.backup_tool_name.clone())
            .ok_or_else(|| Error::DomainFailure {
                kind: "Backup".to_string(),
                name: backup.name_any(),
                message: "completed backup does not name its backup tool".to_string(),
            })?;
        let tool = get_typed::<BackupTool>(ctx.store, None, &tool_name)
            .await?
            .ok_or_else(|| Error::NotFound {
                kind: "BackupTool".to_string(),
                name: tool_name.clone(),
            })?;

        let vct = ctx.backup_vct()?;
        let pvc = build_pvc(ctx.cluster, ctx.comp, vct, &ctx.sts_name, target.ordinal, None);
        let job = build_restore_job(ctx.cluster, ctx.comp, &target.key.name, &backup, &tool)?;
        Ok(vec![pvc.into(), job.into()])
    }
}

/// Whether the storage class of the backup volume is served by a CSI driver
/// that has a VolumeSnapshotClass
pub async fn is_volume_snapshot_enabled(ctx: &CloneContext<'_>) -> Result<bool> {
    let Some(vct) = ctx.comp.backup_volume_template() else {
        return Ok(false);
    };
    let namespace = ctx.namespace();
    let Some(pvc) = get_typed::<PersistentVolumeClaim>(
        ctx.store,
        Some(&namespace),
        &pvc_name(&vct.name, &ctx.sts_name, 0),
    )
    .await?
    else {
        return Ok(false);
    };
    let Some(class_name) = pvc.spec.and_then(|s| s.storage_class_name) else {
        return Ok(false);
    };
    let Some(class) = get_typed::<StorageClass>(ctx.store, None, &class_name).await? else {
        return Ok(false);
    };
    let snapshot_classes = list_typed::<VolumeSnapshotClass>(ctx.store, None, &BTreeMap::new()).await?;
    Ok(snapshot_classes.iter().any(|c| c.driver == class.provisioner))
}

/// Pick the clone strategy of a scale-out
pub async fn new_data_clone<'a>(
    ctx: CloneContext<'a>,
    config: &EngineConfig,
) -> Result<Box<dyn DataClone + 'a>> {
    let policy = ctx
        .comp
        .horizontal_scale_policy
        .as_ref()
        .map(|p| p.type_)
        .unwrap_or(HScaleDataClonePolicy::None);
    match policy {
        HScaleDataClonePolicy::None => Ok(Box::new(DummyClone { ctx })),
        HScaleDataClonePolicy::CloneVolume => {
            if config.volume_snapshot_enabled && is_volume_snapshot_enabled(&ctx).await? {
                debug!("Cloning {} through volume snapshots", ctx.sts_name);
                Ok(Box::new(SnapshotClone { ctx }))
            } else {
                debug!("Cloning {} through the backup tool", ctx.sts_name);
                Ok(Box::new(BackupToolClone { ctx }))
            }
        }
        HScaleDataClonePolicy::Snapshot => Err(Error::ValidationError(format!(
            "component {}: horizontal scale policy Snapshot is not supported, use CloneVolume",
            ctx.comp.name
        ))),
    }
}

#[cfg(test)]
#[path = "data_clone_test.rs"]
mod data_clone_test;
