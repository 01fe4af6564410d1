//! Controller module for Cluster reconciliation
//!
//! The engine stages the objects of every component into an
//! [`ObjectGraph`], derives component phases from live state and hands the
//! graph to a [`GraphApplier`]. Everything below the reconciler talks to
//! the API server through the [`Store`] trait, so whole passes run against
//! [`MemoryStore`] in tests.

pub mod applier;
pub mod component;
pub mod conditions;
pub mod config;
pub mod data_clone;
pub mod events;
mod finalizers;
pub mod graph;
pub mod member;
pub mod memory_store;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod object;
pub mod patch;
pub mod phase;
pub mod pod;
pub mod quantity;
mod reconciler;
#[cfg(test)]
mod reconciler_test;
pub mod resources;
#[cfg(test)]
mod resources_test;
pub mod restart;
pub mod scale;
pub mod snapshot;
pub mod status;
pub mod store;
pub mod volume;
pub mod workload;

#[cfg(test)]
pub(crate) mod fixtures;

pub use applier::{ApplySummary, DryRunApplier, GraphApplier, StoreApplier};
pub use component::{ComponentEngine, ComponentPlan};
pub use config::EngineConfig;
pub use events::{EventRecorder, KubeEventRecorder, MemoryEventRecorder};
pub use finalizers::{cleanup_cluster, mark_deleting, CLUSTER_FINALIZER};
pub use graph::{Action, ObjectGraph, Vertex, VertexId};
pub use member::{HttpMemberAgent, MemberAgent, NoopMemberAgent};
pub use memory_store::MemoryStore;
pub use object::{Object, ObjectKey, ObjectKind};
pub use reconciler::{run_controller, ClusterPlan, ClusterReconciler, ControllerState};
pub use snapshot::{read_snapshot, resolve_actions, validate_graph, Snapshot};
pub use store::{KubeStore, Store};
