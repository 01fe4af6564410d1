//! Snapshot reader and action resolver
//!
//! A snapshot is the read-only index of the live objects a cluster owns,
//! taken once per pass. Vertices staged without an explicit action are
//! resolved against it: present objects become `Noop`, absent ones `Create`.

use std::collections::BTreeMap;

use kube::Resource;
use tracing::debug;

use super::graph::{Action, ObjectGraph};
use super::object::{Object, ObjectKey, ObjectKind};
use super::resources::{LABEL_APP_INSTANCE, LABEL_APP_MANAGED_BY, MANAGED_BY_VALUE};
use super::store::Store;
use crate::crd::Cluster;
use crate::error::{Error, Result};

/// Kinds listed when taking a snapshot
pub const OWNED_KINDS: &[ObjectKind] = &[
    ObjectKind::StatefulSet,
    ObjectKind::Deployment,
    ObjectKind::Service,
    ObjectKind::Secret,
    ObjectKind::ConfigMap,
    ObjectKind::PersistentVolumeClaim,
    ObjectKind::PodDisruptionBudget,
    ObjectKind::BackupPolicy,
];

#[derive(Clone, Debug, Default)]
pub struct Snapshot(BTreeMap<ObjectKey, Object>);

impl Snapshot {
    pub fn from_objects(objects: impl IntoIterator<Item = Object>) -> Self {
        Self(objects.into_iter().map(|o| (o.key(), o)).collect())
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Object> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Object)> {
        self.0.iter()
    }
}

/// Whether `obj` carries an owner reference to `cluster`.
///
/// Group, kind and name are compared; the version is not, so objects
/// survive a CRD version bump.
pub fn is_owned_by(cluster: &Cluster, obj: &Object) -> bool {
    let group = Cluster::group(&());
    let kind = Cluster::kind(&());
    let name = cluster.metadata.name.as_deref().unwrap_or_default();
    obj.meta()
        .owner_references
        .iter()
        .flatten()
        .any(|r| {
            let ref_group = r.api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
            ref_group == group && r.kind == kind && r.name == name
        })
}

/// List every owned kind in the cluster's namespace and keep what it owns.
///
/// Claims created from a StatefulSet's volume templates carry the cluster
/// labels but no owner reference, so PVCs are matched on labels alone.
pub async fn read_snapshot(store: &dyn Store, cluster: &Cluster) -> Result<Snapshot> {
    let namespace = cluster.namespace_or_default();
    let labels: BTreeMap<String, String> = [
        (
            LABEL_APP_INSTANCE.to_string(),
            cluster.metadata.name.clone().unwrap_or_default(),
        ),
        (LABEL_APP_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
    ]
    .into();

    let mut objects = Vec::new();
    for kind in OWNED_KINDS {
        for obj in store.list(*kind, Some(&namespace), &labels).await? {
            if *kind == ObjectKind::PersistentVolumeClaim || is_owned_by(cluster, &obj) {
                objects.push(obj);
            }
        }
    }
    let snapshot = Snapshot::from_objects(objects);
    debug!("Snapshot holds {} owned objects", snapshot.len());
    Ok(snapshot)
}

/// Fill in every unset action from the snapshot. Explicit actions are kept.
///
/// Vertices resolved here also pick up the live object as their original,
/// so later patches diff against what is actually stored.
pub fn resolve_actions(graph: &mut ObjectGraph, snapshot: &Snapshot) {
    let ids: Vec<_> = graph.vertex_ids().collect();
    for id in ids {
        let Some(vertex) = graph.vertex_mut(id) else {
            continue;
        };
        if vertex.action.is_some() {
            continue;
        }
        match snapshot.get(&vertex.key()) {
            Some(live) => {
                vertex.action = Some(Action::Noop);
                if vertex.original.is_none() {
                    vertex.original = Some(live.clone());
                }
            }
            None => vertex.action = Some(Action::Create),
        }
    }
}

/// Freeze every non-workload vertex below the root.
///
/// Workaround for status passes: a horizontal scale still in flight may
/// stage side effects that would race a spec update landing concurrently,
/// so only the workload itself stays mutable. This is not a general rule
/// of the graph.
pub fn freeze_non_workload_vertices(graph: &mut ObjectGraph) {
    let root = graph.root();
    let ids: Vec<_> = graph.vertex_ids().collect();
    for id in ids {
        if Some(id) == root {
            continue;
        }
        if let Some(vertex) = graph.vertex_mut(id) {
            if !vertex.object.kind().is_workload() {
                vertex.immutable = true;
            }
        }
    }
}

/// Every vertex must carry a resolved action and the graph must be acyclic
pub fn validate_graph(graph: &ObjectGraph) -> Result<()> {
    for (id, vertex) in graph.iter() {
        if vertex.action.is_none() {
            return Err(Error::InvalidGraph(format!(
                "vertex {id} ({}) has no action",
                vertex.key()
            )));
        }
        if vertex.object.name().is_empty() {
            return Err(Error::InvalidGraph(format!(
                "vertex {id} ({}) has an object without a name",
                vertex.object.kind()
            )));
        }
    }
    graph.reverse_topological_order().map(|_| ())
}
