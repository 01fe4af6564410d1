//! Unit tests for the desired-object builders.
//!
//! Run with: `cargo test -p replicadb-k8s resources_test`

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::controller::fixtures::{cluster, component};
    use crate::controller::resources::*;
    use crate::crd::{
        Backup, BackupSpec, BackupStatus, BackupTool, BackupToolSpec, BackupType, PdbSpec,
        WorkloadType,
    };
    use crate::error::Error;

    // -----------------------------------------------------------------------
    // Labels and names
    // -----------------------------------------------------------------------

    #[test]
    fn test_selector_is_subset_of_pod_labels() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let labels = component_labels(&db, &comp);
        for (k, v) in component_selector(&db, &comp) {
            assert_eq!(labels.get(&k), Some(&v), "selector label {k} missing");
        }
    }

    #[test]
    fn test_names() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        assert_eq!(workload_name(&db, &comp), "db-mysql");
        assert_eq!(headless_service_name(&db, &comp), "db-mysql-headless");
        assert_eq!(env_config_map_name(&db, &comp), "db-mysql-env");
        assert_eq!(pvc_name("data", "db-mysql", 2), "data-db-mysql-2");
        assert_eq!(restore_job_name("data-db-mysql-2"), "restore-data-db-mysql-2");
    }

    // -----------------------------------------------------------------------
    // Workloads and services
    // -----------------------------------------------------------------------

    #[test]
    fn test_statefulset_carries_generation_and_claims() {
        let comp = component(WorkloadType::Consensus, 3);
        let mut db = cluster(vec![comp.clone()]);
        db.metadata.generation = Some(7);
        let sts = build_statefulset(&db, &comp);

        let annotations = sts.metadata.annotations.unwrap();
        assert_eq!(annotations.get(ANNOTATION_GENERATION).map(String::as_str), Some("7"));
        let owner = &sts.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Cluster");
        assert_eq!(owner.controller, Some(true));

        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.service_name, "db-mysql-headless");
        let templates = spec.volume_claim_templates.unwrap();
        assert_eq!(templates.len(), 1);
        let labels = templates[0].metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_VOLUME_CLAIM_TEMPLATE).map(String::as_str), Some("data"));
    }

    #[test]
    fn test_only_consensus_sets_update_on_delete() {
        let consensus = component(WorkloadType::Consensus, 3);
        let stateful = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![consensus.clone()]);

        let strategy = build_statefulset(&db, &consensus).spec.unwrap().update_strategy.unwrap();
        assert_eq!(strategy.type_.as_deref(), Some(UPDATE_STRATEGY_ON_DELETE));
        assert!(build_statefulset(&db, &stateful).spec.unwrap().update_strategy.is_none());
    }

    #[test]
    fn test_headless_service_publishes_not_ready_addresses() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let svc = build_headless_service(&db, &comp);
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));
        assert_eq!(spec.publish_not_ready_addresses, Some(true));
        assert_eq!(spec.selector, Some(component_selector(&db, &comp)));
    }

    #[test]
    fn test_env_config_map_lists_peers() {
        let comp = component(WorkloadType::Replication, 2);
        let db = cluster(vec![comp.clone()]);
        let data = build_env_config_map(&db, &comp).data.unwrap();
        assert_eq!(data.get("REPLICADB_REPLICA_COUNT").map(String::as_str), Some("2"));
        assert_eq!(
            data.get("REPLICADB_1_HOSTNAME").map(String::as_str),
            Some("db-mysql-1.db-mysql-headless.default.svc")
        );

        let stateless = component(WorkloadType::Stateless, 2);
        let data = build_env_config_map(&db, &stateless).data.unwrap();
        assert!(!data.contains_key("REPLICADB_0_HOSTNAME"));
    }

    #[test]
    fn test_pdb_requires_min_available() {
        let mut comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        assert!(build_pdb(&db, &comp).unwrap().is_none());

        comp.pod_disruption_budget = Some(PdbSpec {
            min_available: Some(IntOrString::Int(2)),
        });
        let pdb = build_pdb(&db, &comp).unwrap().unwrap();
        assert_eq!(pdb.spec.unwrap().min_available, Some(IntOrString::Int(2)));

        comp.pod_disruption_budget = Some(PdbSpec { min_available: None });
        assert!(matches!(build_pdb(&db, &comp), Err(Error::InvalidGraph(_))));
    }

    // -----------------------------------------------------------------------
    // Volumes and data protection
    // -----------------------------------------------------------------------

    #[test]
    fn test_pvc_from_snapshot() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let vct = &comp.volume_claim_templates[0];

        let plain = build_pvc(&db, &comp, vct, "db-mysql", 3, None);
        assert_eq!(plain.metadata.name.as_deref(), Some("data-db-mysql-3"));
        assert!(plain.spec.unwrap().data_source.is_none());

        let restored = build_pvc(&db, &comp, vct, "db-mysql", 3, Some("db-mysql-scaling"));
        let source = restored.spec.unwrap().data_source.unwrap();
        assert_eq!(source.kind, "VolumeSnapshot");
        assert_eq!(source.api_group.as_deref(), Some("snapshot.storage.k8s.io"));
        assert_eq!(source.name, "db-mysql-scaling");
    }

    fn completed_backup(pvc: Option<&str>) -> Backup {
        let mut backup = Backup::new(
            "db-mysql-scaling",
            BackupSpec {
                backup_policy_name: "db-mysql-backup-policy".to_string(),
                backup_type: BackupType::Datafile,
            },
        );
        backup.status = Some(BackupStatus {
            persistent_volume_claim_name: pvc.map(str::to_string),
            ..Default::default()
        });
        backup
    }

    fn tool() -> BackupTool {
        BackupTool::new(
            "xtrabackup",
            BackupToolSpec {
                image: "registry/xtrabackup:8.0".to_string(),
                env: BTreeMap::from([("DATA_DIR".to_string(), "/data/mysql".to_string())]),
                restore_commands: vec!["xtrabackup --prepare".to_string(), "cp -r . /data".to_string()],
            },
        )
    }

    #[test]
    fn test_restore_job_mounts_backup_read_only() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let job = build_restore_job(&db, &comp, "data-db-mysql-3", &completed_backup(Some("backup-pvc")), &tool())
            .unwrap();

        assert_eq!(job.metadata.name.as_deref(), Some("restore-data-db-mysql-3"));
        assert_eq!(job.metadata.labels, Some(data_clone_labels(&db, &comp)));
        let spec = job.spec.unwrap();
        assert_eq!(spec.backoff_limit, Some(3));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));

        let container = &pod.containers[0];
        assert_eq!(container.image.as_deref(), Some("registry/xtrabackup:8.0"));
        assert_eq!(
            container.args.as_ref().unwrap()[0],
            "xtrabackup --prepare\ncp -r . /data"
        );
        let mounts = container.volume_mounts.as_ref().unwrap();
        let backup_mount = mounts.iter().find(|m| m.mount_path == BACKUP_MOUNT_PATH).unwrap();
        assert_eq!(backup_mount.read_only, Some(true));
        assert!(mounts.iter().any(|m| m.mount_path == DATA_MOUNT_PATH));

        let claims: Vec<_> = pod
            .volumes
            .unwrap()
            .into_iter()
            .filter_map(|v| v.persistent_volume_claim.map(|c| c.claim_name))
            .collect();
        assert_eq!(claims, vec!["backup-pvc".to_string(), "data-db-mysql-3".to_string()]);
    }

    #[test]
    fn test_restore_job_needs_backup_claim() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let err = build_restore_job(&db, &comp, "data-db-mysql-3", &completed_backup(None), &tool())
            .unwrap_err();
        assert!(matches!(err, Error::DomainFailure { .. }));
    }
}
