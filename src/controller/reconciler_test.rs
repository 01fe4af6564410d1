//! Tests for the cluster reconciler
//!
//! These drive whole passes against the in-memory store:
//! - first pass creates every component object and records status
//! - status passes move components to Running
//! - removed components lose their objects and status
//! - apply failures surface on the ApplyResources condition

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::Utc;
    use k8s_openapi::api::apps::v1::{Deployment, StatefulSet, StatefulSetStatus};
    use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};

    use crate::controller::applier::{ApplySummary, GraphApplier, StoreApplier};
    use crate::controller::component::ComponentEngine;
    use crate::controller::conditions::{
        find_condition, is_condition_true, CONDITION_STATUS_FALSE, CONDITION_TYPE_APPLY_RESOURCES,
        CONDITION_TYPE_READY,
    };
    use crate::controller::config::EngineConfig;
    use crate::controller::events::{MemoryEventRecorder, REASON_APPLY_RESOURCES_FAILED};
    use crate::controller::fixtures::{cluster, component};
    use crate::controller::graph::ObjectGraph;
    use crate::controller::member::{MemberAgent, NoopMemberAgent};
    use crate::controller::memory_store::MemoryStore;
    use crate::controller::object::ObjectKey;
    use crate::controller::pod::fixtures::pod;
    use crate::controller::reconciler::ClusterReconciler;
    use crate::controller::resources::{component_selector, LABEL_CONTROLLER_REVISION_HASH};
    use crate::crd::{Cluster, ClusterComponentSpec, ComponentPhase, WorkloadType};
    use crate::error::{Error, Result};

    /// Fails every graph holding more than the cluster status vertex
    struct RejectingApplier<'a> {
        inner: StoreApplier<'a>,
    }

    #[async_trait]
    impl GraphApplier for RejectingApplier<'_> {
        async fn apply(&self, graph: &ObjectGraph) -> Result<ApplySummary> {
            if graph.len() > 1 {
                return Err(Error::Conflict {
                    kind: "StatefulSet".to_string(),
                    name: "db-mysql".to_string(),
                    message: "the object has been modified".to_string(),
                });
            }
            self.inner.apply(graph).await
        }
    }

    /// Refuses the first leave request, accepts the rest
    #[derive(Default)]
    struct RefuseOnceAgent {
        refused: AtomicBool,
    }

    #[async_trait]
    impl MemberAgent for RefuseOnceAgent {
        async fn leave_member(&self, pod: &Pod, _character_type: &str) -> Result<()> {
            if self.refused.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            Err(Error::MemberAgentError(format!(
                "{} is transferring leadership",
                pod.metadata.name.as_deref().unwrap_or_default()
            )))
        }
    }

    struct Harness {
        store: MemoryStore,
        recorder: MemoryEventRecorder,
        agent: NoopMemberAgent,
        config: EngineConfig,
    }

    impl Harness {
        fn new(components: Vec<ClusterComponentSpec>) -> Self {
            let harness = Self {
                store: MemoryStore::new(),
                recorder: MemoryEventRecorder::new(),
                agent: NoopMemberAgent,
                config: EngineConfig::default(),
            };
            harness.store.insert(cluster(components)).unwrap();
            harness
        }

        fn engine(&self) -> ComponentEngine<'_> {
            ComponentEngine {
                store: &self.store,
                recorder: &self.recorder,
                member_agent: &self.agent,
                config: &self.config,
            }
        }

        fn cluster(&self) -> Cluster {
            self.store
                .get_now(&ObjectKey::of::<Cluster>(Some("default"), "db"))
                .unwrap()
        }

        async fn pass(&self) -> Result<ApplySummary> {
            let applier = StoreApplier::new(&self.store);
            let reconciler = ClusterReconciler {
                engine: self.engine(),
                applier: &applier,
            };
            reconciler.apply(&self.cluster(), Utc::now()).await
        }

        fn phase(&self, component: &str) -> Option<ComponentPhase> {
            self.cluster().component_status(component).and_then(|s| s.phase)
        }

        /// Report the workload ready and start its pods, as the cluster would
        fn start_pods(&self, comp: &ClusterComponentSpec, role: Option<&str>) {
            let db = self.cluster();
            self.store
                .modify::<StatefulSet, _>(&ObjectKey::of::<StatefulSet>(Some("default"), "db-mysql"), |sts| {
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
                })
                .unwrap();
            for i in 0..comp.replicas {
                let mut p = pod(&format!("db-mysql-{i}"), true, role);
                let labels = p.metadata.labels.get_or_insert_with(Default::default);
                labels.extend(component_selector(&db, comp));
                labels.insert(LABEL_CONTROLLER_REVISION_HASH.to_string(), "rev-1".to_string());
                self.store.insert(p).unwrap();
            }
        }
    }

    fn key_of<K: crate::controller::object::TypedObject>(name: &str) -> ObjectKey {
        ObjectKey::of::<K>(Some("default"), name)
    }

    #[tokio::test]
    async fn test_first_pass_creates_objects_and_status() {
        let h = Harness::new(vec![component(WorkloadType::Stateful, 3)]);
        let summary = h.pass().await.unwrap();

        assert_eq!(summary.created, 4);
        assert_eq!(summary.status_patched, 1);
        assert!(h.store.contains(&key_of::<StatefulSet>("db-mysql")));
        assert!(h.store.contains(&key_of::<Service>("db-mysql")));
        assert!(h.store.contains(&key_of::<Service>("db-mysql-headless")));
        assert!(h.store.contains(&key_of::<ConfigMap>("db-mysql-env")));

        let db = h.cluster();
        let status = db.status.as_ref().unwrap();
        assert_eq!(status.observed_generation, Some(1));
        assert_eq!(h.phase("mysql"), Some(ComponentPhase::Creating));
        assert!(is_condition_true(&status.conditions, CONDITION_TYPE_APPLY_RESOURCES));
        assert!(!is_condition_true(&status.conditions, CONDITION_TYPE_READY));
    }

    #[tokio::test]
    async fn test_status_pass_reaches_running() {
        let comp = component(WorkloadType::Stateful, 3);
        let h = Harness::new(vec![comp.clone()]);
        h.pass().await.unwrap();
        h.start_pods(&comp, None);

        h.pass().await.unwrap();
        assert_eq!(h.phase("mysql"), Some(ComponentPhase::Running));
        let db = h.cluster();
        assert!(is_condition_true(
            &db.status.as_ref().unwrap().conditions,
            CONDITION_TYPE_READY
        ));

        // a settled cluster writes nothing
        let summary = h.pass().await.unwrap();
        assert_eq!(summary.mutations(), 0);
    }

    #[tokio::test]
    async fn test_role_wait_applies_then_requeues() {
        let comp = component(WorkloadType::Consensus, 3);
        let h = Harness::new(vec![comp.clone()]);
        h.pass().await.unwrap();
        h.start_pods(&comp, None);

        let err = h.pass().await.unwrap_err();
        assert!(err.requeue_after().is_some());
        let db = h.cluster();
        let status = db.component_status("mysql").unwrap();
        assert_eq!(status.pods_ready, Some(true));
        assert!(status.pods_ready_time.is_some());
    }

    #[tokio::test]
    async fn test_removed_component_is_cleaned_up() {
        let mysql = component(WorkloadType::Stateful, 3);
        let mut proxy = component(WorkloadType::Stateless, 2);
        proxy.name = "proxy".to_string();
        proxy.volume_claim_templates.clear();
        let h = Harness::new(vec![mysql.clone(), proxy]);
        h.pass().await.unwrap();
        assert!(h.store.contains(&key_of::<Deployment>("db-proxy")));

        let key = ObjectKey::of::<Cluster>(Some("default"), "db");
        h.store
            .modify::<Cluster, _>(&key, |db| {
                db.spec.component_specs = vec![mysql.clone()];
                db.metadata.generation = Some(2);
            })
            .unwrap();
        h.pass().await.unwrap();

        assert!(!h.store.contains(&key_of::<Deployment>("db-proxy")));
        assert!(!h.store.contains(&key_of::<Service>("db-proxy")));
        assert!(h.store.contains(&key_of::<StatefulSet>("db-mysql")));
        let db = h.cluster();
        assert!(db.component_status("proxy").is_none());
        assert_eq!(db.status.as_ref().unwrap().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_refused_leave_is_retried_by_the_next_spec_pass() {
        let mut comp = component(WorkloadType::Stateful, 5);
        comp.character_type = Some("mysql".to_string());
        let h = Harness::new(vec![comp.clone()]);
        h.pass().await.unwrap();
        h.start_pods(&comp, None);
        h.pass().await.unwrap();
        assert_eq!(h.phase("mysql"), Some(ComponentPhase::Running));

        let key = ObjectKey::of::<Cluster>(Some("default"), "db");
        h.store
            .modify::<Cluster, _>(&key, |db| {
                db.spec.component_specs[0].replicas = 3;
                db.metadata.generation = Some(2);
            })
            .unwrap();

        let agent = RefuseOnceAgent::default();
        let applier = StoreApplier::new(&h.store);
        let reconciler = ClusterReconciler {
            engine: ComponentEngine {
                store: &h.store,
                recorder: &h.recorder,
                member_agent: &agent,
                config: &h.config,
            },
            applier: &applier,
        };
        let replicas = || {
            h.store
                .get_now::<StatefulSet>(&key_of::<StatefulSet>("db-mysql"))
                .and_then(|sts| sts.spec)
                .and_then(|spec| spec.replicas)
        };

        let err = reconciler.apply(&h.cluster(), Utc::now()).await.unwrap_err();
        assert!(err.requeue_after().is_some());
        assert!(err.to_string().contains("db-mysql-4"), "{err}");
        assert_eq!(replicas(), Some(5));
        // the generation stays unobserved so the scale-in runs again
        assert_eq!(h.cluster().status.unwrap().observed_generation, Some(1));

        reconciler.apply(&h.cluster(), Utc::now()).await.unwrap();
        assert_eq!(replicas(), Some(3));
        assert_eq!(h.cluster().status.unwrap().observed_generation, Some(2));
    }

    #[tokio::test]
    async fn test_apply_failure_sets_condition() {
        let h = Harness::new(vec![component(WorkloadType::Stateful, 3)]);
        let applier = RejectingApplier {
            inner: StoreApplier::new(&h.store),
        };
        let reconciler = ClusterReconciler {
            engine: h.engine(),
            applier: &applier,
        };

        let err = reconciler.apply(&h.cluster(), Utc::now()).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
        assert!(h.recorder.has_reason(REASON_APPLY_RESOURCES_FAILED));

        let db = h.cluster();
        let conditions = &db.status.as_ref().unwrap().conditions;
        let cond = find_condition(conditions, CONDITION_TYPE_APPLY_RESOURCES).unwrap();
        assert_eq!(cond.status, CONDITION_STATUS_FALSE);
        assert!(cond.message.contains("db-mysql"));
        // nothing but the failure report reached the store
        assert!(!h.store.contains(&key_of::<StatefulSet>("db-mysql")));

        #[cfg(feature = "metrics")]
        {
            use crate::controller::metrics::{ClusterLabels, APPLY_FAILURES_TOTAL};
            let labels = ClusterLabels {
                namespace: "default".to_string(),
                cluster: "db".to_string(),
            };
            assert!(APPLY_FAILURES_TOTAL.get_or_create(&labels).get() >= 1);
        }
    }

    #[tokio::test]
    async fn test_invalid_spec_is_rejected() {
        let h = Harness::new(Vec::new());
        let err = h.pass().await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));
        assert!(h.store.keys_of(crate::controller::object::ObjectKind::StatefulSet).is_empty());
    }
}
