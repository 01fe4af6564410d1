//! Unit tests for the Cluster CRD and component status types
//!
//! Covers `ClusterSpec::validate()`, the message map merge rules and the
//! pods-ready timestamp bookkeeping on `ComponentStatus`.

#[cfg(test)]
mod cluster_spec_validation {
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    use crate::crd::{
        ClusterComponentSpec, ClusterSpec, HScaleDataClonePolicy, HorizontalScalePolicy, PdbSpec,
        VolumeClaimTemplate, WorkloadType,
    };

    /// Helper to create a minimal valid consensus component
    fn valid_component(name: &str) -> ClusterComponentSpec {
        ClusterComponentSpec {
            name: name.to_string(),
            workload_type: WorkloadType::Consensus,
            image: "mysql:8.0".to_string(),
            replicas: 3,
            volume_claim_templates: vec![VolumeClaimTemplate {
                name: "data".to_string(),
                storage: "20Gi".to_string(),
                storage_class_name: Some("standard".to_string()),
                volume_type: None,
            }],
            ..Default::default()
        }
    }

    fn spec_with(components: Vec<ClusterComponentSpec>) -> ClusterSpec {
        ClusterSpec {
            component_specs: components,
        }
    }

    fn fields(spec: &ClusterSpec) -> Vec<String> {
        spec.validate()
            .expect_err("expected validation errors")
            .into_iter()
            .map(|e| e.field)
            .collect()
    }

    #[test]
    fn test_valid_spec_passes() {
        let spec = spec_with(vec![valid_component("mysql")]);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn test_empty_components_rejected() {
        let spec = spec_with(vec![]);
        assert_eq!(fields(&spec), vec!["spec.componentSpecs".to_string()]);
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let spec = spec_with(vec![valid_component("mysql"), valid_component("mysql")]);
        assert_eq!(fields(&spec), vec!["spec.componentSpecs[1].name".to_string()]);
    }

    #[test]
    fn test_negative_replicas_rejected() {
        let mut comp = valid_component("mysql");
        comp.replicas = -1;
        let spec = spec_with(vec![comp]);
        assert_eq!(
            fields(&spec),
            vec!["spec.componentSpecs[0].replicas".to_string()]
        );
    }

    #[test]
    fn test_bad_storage_quantity_rejected() {
        let mut comp = valid_component("mysql");
        comp.volume_claim_templates[0].storage = "lots".to_string();
        let spec = spec_with(vec![comp]);
        assert_eq!(
            fields(&spec),
            vec!["spec.componentSpecs[0].volumeClaimTemplates[0].storage".to_string()]
        );
    }

    #[test]
    fn test_pdb_without_min_available_rejected() {
        let mut comp = valid_component("mysql");
        comp.pod_disruption_budget = Some(PdbSpec {
            min_available: None,
        });
        let spec = spec_with(vec![comp.clone()]);
        assert_eq!(
            fields(&spec),
            vec!["spec.componentSpecs[0].podDisruptionBudget.minAvailable".to_string()]
        );

        comp.pod_disruption_budget = Some(PdbSpec {
            min_available: Some(IntOrString::Int(2)),
        });
        assert!(spec_with(vec![comp]).validate().is_ok());
    }

    #[test]
    fn test_clone_volume_without_volumes_rejected() {
        let mut comp = valid_component("mysql");
        comp.volume_claim_templates.clear();
        comp.horizontal_scale_policy = Some(HorizontalScalePolicy {
            type_: HScaleDataClonePolicy::CloneVolume,
            ..Default::default()
        });
        let spec = spec_with(vec![comp]);
        assert_eq!(
            fields(&spec),
            vec!["spec.componentSpecs[0].horizontalScalePolicy.type".to_string()]
        );
    }

    #[test]
    fn test_stateless_with_volumes_rejected() {
        let mut comp = valid_component("proxy");
        comp.workload_type = WorkloadType::Stateless;
        let spec = spec_with(vec![comp]);
        assert_eq!(
            fields(&spec),
            vec!["spec.componentSpecs[0].volumeClaimTemplates".to_string()]
        );
    }

    #[test]
    fn test_spec_deserializes_from_yaml() {
        let yaml = r#"
componentSpecs:
  - name: mysql
    workloadType: Consensus
    image: mysql:8.0
    replicas: 3
    volumeClaimTemplates:
      - name: data
        storage: 20Gi
    horizontalScalePolicy:
      type: CloneVolume
      backupPolicyTemplate: mysql-backup-policy-template
"#;
        let spec: ClusterSpec = serde_yaml::from_str(yaml).unwrap();
        let comp = &spec.component_specs[0];
        assert_eq!(comp.workload_type, WorkloadType::Consensus);
        assert_eq!(
            comp.horizontal_scale_policy.as_ref().unwrap().type_,
            HScaleDataClonePolicy::CloneVolume
        );
        assert!(spec.validate().is_ok());
    }
}

#[cfg(test)]
mod component_status {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};

    use crate::crd::{
        ClusterComponentSpec, ComponentMessageMap, ComponentPhase, ComponentStatus, ProbeConfig,
        VolumeClaimTemplate, VolumeType,
    };

    #[test]
    fn test_message_map_merge_is_union() {
        let mut current = ComponentMessageMap::new();
        current.set_object_message("Pod", "db-mysql-0", "CrashLoopBackOff");

        let mut incoming = ComponentMessageMap::new();
        incoming.set_object_message("Pod", "db-mysql-1", "ImagePullBackOff");

        current.merge(&incoming);
        assert_eq!(current.len(), 2);
        assert_eq!(
            current.get_object_message("Pod", "db-mysql-0"),
            Some("CrashLoopBackOff")
        );
        assert_eq!(
            current.get_object_message("Pod", "db-mysql-1"),
            Some("ImagePullBackOff")
        );
    }

    #[test]
    fn test_message_map_serializes_sorted() {
        let mut map = ComponentMessageMap::new();
        map.set_object_message("Pod", "b", "2");
        map.set_object_message("Pod", "a", "1");
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"Pod/a":"1","Pod/b":"2"}"#);
    }

    #[test]
    fn test_pods_ready_time_set_once_on_transition() {
        let t0 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 1, 1, 0, 5, 0).unwrap();

        let mut status = ComponentStatus::default();
        status.set_pods_ready(Some(true), t0);
        assert_eq!(status.pods_ready_since(), Some(t0));

        // Still ready: the timestamp must not move
        status.set_pods_ready(Some(true), t1);
        assert_eq!(status.pods_ready_since(), Some(t0));

        status.set_pods_ready(Some(false), t1);
        assert_eq!(status.pods_ready_time, None);

        status.set_pods_ready(Some(true), t1);
        assert_eq!(status.pods_ready_since(), Some(t1));
    }

    #[test]
    fn test_up_running_phases() {
        assert!(ComponentPhase::Running.is_up_running());
        assert!(ComponentPhase::Abnormal.is_up_running());
        assert!(ComponentPhase::Failed.is_up_running());
        assert!(!ComponentPhase::Creating.is_up_running());
        assert!(!ComponentPhase::Updating.is_up_running());
        assert!(!ComponentStatus::default().is_up_running());
    }

    #[test]
    fn test_role_timeout_override() {
        let default = Duration::from_secs(60);
        let mut comp = ClusterComponentSpec::default();
        assert_eq!(comp.role_probe_timeout(default), default);

        comp.probes = Some(ProbeConfig {
            role_probe_timeout_after_pods_ready: Some(0),
        });
        assert_eq!(comp.role_probe_timeout(default), default);

        comp.probes = Some(ProbeConfig {
            role_probe_timeout_after_pods_ready: Some(120),
        });
        assert_eq!(comp.role_probe_timeout(default), Duration::from_secs(120));
    }

    #[test]
    fn test_backup_volume_prefers_data_volume() {
        let comp = ClusterComponentSpec {
            volume_claim_templates: vec![
                VolumeClaimTemplate {
                    name: "log".to_string(),
                    storage: "1Gi".to_string(),
                    storage_class_name: None,
                    volume_type: Some(VolumeType::Log),
                },
                VolumeClaimTemplate {
                    name: "data".to_string(),
                    storage: "10Gi".to_string(),
                    storage_class_name: None,
                    volume_type: Some(VolumeType::Data),
                },
            ],
            ..Default::default()
        };
        assert_eq!(comp.backup_volume_template().unwrap().name, "data");
    }
}
