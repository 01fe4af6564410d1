//! Finalizer handling for Cluster deletion
//!
//! Owned objects carry an owner reference to their cluster and are removed
//! by garbage collection. The finalizer only holds the cluster long enough
//! to report every component as `Deleting`.

use kube::ResourceExt;
use tracing::info;

use super::applier::GraphApplier;
use super::graph::{Action, ObjectGraph};
use crate::crd::{Cluster, ComponentPhase};
use crate::error::Result;

/// Finalizer protecting Cluster resources until cleanup has run
pub const CLUSTER_FINALIZER: &str = "cluster.apps.replicadb.io/finalizer";

/// Move every component of a deleting cluster to `Deleting`
pub fn mark_deleting(cluster: &mut Cluster) {
    let names: Vec<String> = cluster
        .spec
        .component_specs
        .iter()
        .map(|c| c.name.clone())
        .collect();
    for name in names {
        cluster.component_status_mut(&name).phase = Some(ComponentPhase::Deleting);
    }
}

/// Write the `Deleting` phases through `applier`
pub async fn cleanup_cluster(applier: &dyn GraphApplier, cluster: &Cluster) -> Result<()> {
    info!(
        "Cleaning up Cluster {}/{}",
        cluster.namespace_or_default(),
        cluster.name_any()
    );
    let mut deleting = cluster.clone();
    mark_deleting(&mut deleting);

    let mut graph = ObjectGraph::new();
    let root = graph.add_vertex(deleting, Some(Action::Status));
    if let Some(vertex) = graph.vertex_mut(root) {
        vertex.original = Some(cluster.clone().into());
    }
    graph.set_root(root);
    applier.apply(&graph).await?;
    Ok(())
}
