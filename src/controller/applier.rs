//! Graph applier
//!
//! Walks an [`ObjectGraph`] children first and turns every vertex into a
//! store call. Each call is idempotent against the live state: a create of
//! an existing object and a delete of a missing one both count as done.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::graph::{Action, ObjectGraph, Vertex};
use super::patch::{create_merge_patch, is_empty_patch};
use super::snapshot::validate_graph;
use super::store::{DeletePropagation, Store};
use crate::error::{Error, Result};

/// Counts of store calls made for one graph
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub patched: usize,
    pub deleted: usize,
    pub status_patched: usize,
    pub skipped: usize,
}

impl ApplySummary {
    pub fn mutations(&self) -> usize {
        self.created + self.updated + self.patched + self.deleted + self.status_patched
    }
}

#[async_trait]
pub trait GraphApplier: Send + Sync {
    async fn apply(&self, graph: &ObjectGraph) -> Result<ApplySummary>;
}

/// Applies graphs against a [`Store`]
pub struct StoreApplier<'a> {
    store: &'a dyn Store,
}

impl<'a> StoreApplier<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self { store }
    }

    async fn apply_vertex(&self, vertex: &Vertex, summary: &mut ApplySummary) -> Result<()> {
        let key = vertex.key();
        let action = vertex
            .action
            .ok_or_else(|| Error::InvalidGraph(format!("{key} reached the applier unresolved")))?;

        match action {
            Action::Noop => summary.skipped += 1,
            Action::Create => match self.store.create(&vertex.object).await {
                Ok(_) => summary.created += 1,
                Err(e) if e.is_already_exists() => {
                    debug!("{} already exists", key);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            },
            Action::Update if vertex.immutable => summary.skipped += 1,
            Action::Update => match self.store.update(&vertex.object).await {
                Ok(_) => summary.updated += 1,
                Err(e) if e.is_not_found() => {
                    debug!("{} vanished before update", key);
                    summary.skipped += 1;
                }
                Err(e) => return Err(e),
            },
            Action::Patch if vertex.immutable => summary.skipped += 1,
            Action::Patch => {
                let patch = object_patch(vertex)?;
                if is_empty_patch(&patch) {
                    summary.skipped += 1;
                    return Ok(());
                }
                match self.store.patch(&key, &patch).await {
                    Ok(_) => summary.patched += 1,
                    Err(e) if e.is_not_found() => {
                        debug!("{} vanished before patch", key);
                        summary.skipped += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
            Action::Delete => match self
                .store
                .delete(&key, DeletePropagation::for_orphan(vertex.orphan))
                .await
            {
                Ok(()) => summary.deleted += 1,
                Err(e) if e.is_not_found() => summary.skipped += 1,
                Err(e) => return Err(e),
            },
            Action::Status => {
                let patch = status_patch(vertex)?;
                if is_empty_patch(&patch) {
                    summary.skipped += 1;
                    return Ok(());
                }
                self.store.patch_status(&key, &patch).await?;
                summary.status_patched += 1;
            }
        }
        Ok(())
    }
}

/// Merge patch of everything but status between the original and staged object
fn object_patch(vertex: &Vertex) -> Result<Value> {
    let mut modified = vertex.object.to_value()?;
    strip_server_fields(&mut modified);
    let mut original = match &vertex.original {
        Some(o) => o.to_value()?,
        None => json!({}),
    };
    strip_server_fields(&mut original);
    let mut patch = create_merge_patch(&original, &modified);
    if !is_empty_patch(&patch) {
        guard_resource_version(&mut patch, vertex);
    }
    Ok(patch)
}

/// Merge patch of the status subresource
fn status_patch(vertex: &Vertex) -> Result<Value> {
    let modified = vertex.object.to_value()?;
    let original = match &vertex.original {
        Some(o) => o.to_value()?,
        None => json!({}),
    };
    let status = create_merge_patch(
        original.get("status").unwrap_or(&Value::Null),
        modified.get("status").unwrap_or(&Value::Null),
    );
    if is_empty_patch(&status) || status.is_null() {
        return Ok(json!({}));
    }
    let mut patch = json!({ "status": status });
    guard_resource_version(&mut patch, vertex);
    Ok(patch)
}

/// Pin the patch to the resourceVersion the vertex was staged from, so a
/// write made since the read conflicts instead of being overwritten
fn guard_resource_version(patch: &mut Value, vertex: &Vertex) {
    let Some(version) = vertex
        .original
        .as_ref()
        .and_then(|o| o.meta().resource_version.clone())
    else {
        return;
    };
    if let Value::Object(map) = patch {
        let meta = map.entry("metadata").or_insert_with(|| json!({}));
        meta["resourceVersion"] = Value::String(version);
    }
}

fn strip_server_fields(value: &mut Value) {
    if let Value::Object(map) = value {
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            for field in ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields"] {
                meta.remove(field);
            }
        }
    }
}

#[async_trait]
impl GraphApplier for StoreApplier<'_> {
    async fn apply(&self, graph: &ObjectGraph) -> Result<ApplySummary> {
        validate_graph(graph)?;
        let mut summary = ApplySummary::default();
        for id in graph.reverse_topological_order()? {
            if let Some(vertex) = graph.vertex(id) {
                self.apply_vertex(vertex, &mut summary).await?;
            }
        }
        info!(
            created = summary.created,
            updated = summary.updated,
            patched = summary.patched,
            deleted = summary.deleted,
            status = summary.status_patched,
            "Applied object graph"
        );
        Ok(summary)
    }
}

/// Logs the plan instead of writing it
#[derive(Default)]
pub struct DryRunApplier;

#[async_trait]
impl GraphApplier for DryRunApplier {
    async fn apply(&self, graph: &ObjectGraph) -> Result<ApplySummary> {
        validate_graph(graph)?;
        let mut summary = ApplySummary::default();
        for id in graph.reverse_topological_order()? {
            let Some(vertex) = graph.vertex(id) else {
                continue;
            };
            let skipped = vertex.immutable
                && matches!(vertex.action, Some(Action::Update) | Some(Action::Patch));
            match vertex.action {
                _ if skipped => summary.skipped += 1,
                Some(Action::Create) => summary.created += 1,
                Some(Action::Update) => summary.updated += 1,
                Some(Action::Patch) => summary.patched += 1,
                Some(Action::Delete) => summary.deleted += 1,
                Some(Action::Status) => summary.status_patched += 1,
                Some(Action::Noop) | None => summary.skipped += 1,
            }
            if !matches!(vertex.action, Some(Action::Noop)) {
                warn!(
                    "[dry-run] {} {}{}",
                    vertex.action.map(|a| a.to_string()).unwrap_or_default(),
                    vertex.key(),
                    if skipped { " (immutable, skipped)" } else { "" }
                );
            }
        }
        Ok(summary)
    }
}
