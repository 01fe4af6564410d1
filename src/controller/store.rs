//! Resource store client used by the component engine
//!
//! The engine reads live state and the applier writes staged mutations
//! through [`Store`]. [`KubeStore`] talks to the API server through
//! `Api<DynamicObject>`; tests and dry runs use
//! [`MemoryStore`](super::memory_store::MemoryStore).

use std::collections::BTreeMap;

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

use super::object::{Object, ObjectKey, ObjectKind, TypedObject};
use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "replicadb-operator";

/// How the garbage collector treats dependents of a deleted object
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeletePropagation {
    #[default]
    Background,
    /// Dependents lose their owner reference and stay
    Orphan,
}

impl DeletePropagation {
    pub fn for_orphan(orphan: bool) -> Self {
        if orphan {
            DeletePropagation::Orphan
        } else {
            DeletePropagation::Background
        }
    }
}

/// Merge patches are not server-side apply; only the manager name is set
fn merge_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// `Ok(None)` when the object does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<Object>>;

    /// Objects of `kind` whose labels contain every entry of `labels`
    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Object>>;

    /// Fails with `AlreadyExists` when the object is present
    async fn create(&self, obj: &Object) -> Result<Object>;

    /// Replace guarded by `metadata.resourceVersion`; a stale version is a `Conflict`
    async fn update(&self, obj: &Object) -> Result<Object>;

    /// JSON merge patch of everything except status. A `metadata.resourceVersion`
    /// in the patch is a precondition; a stale one is a `Conflict`.
    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object>;

    /// JSON merge patch of the status subresource, preconditioned like [`Store::patch`]
    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Object>;

    async fn delete(&self, key: &ObjectKey, propagation: DeletePropagation) -> Result<()>;
}

pub async fn get_typed<K: TypedObject>(
    store: &dyn Store,
    namespace: Option<&str>,
    name: &str,
) -> Result<Option<K>> {
    Ok(store
        .get(&ObjectKey::of::<K>(namespace, name))
        .await?
        .and_then(Object::into_typed))
}

pub async fn list_typed<K: TypedObject>(
    store: &dyn Store,
    namespace: Option<&str>,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<K>> {
    Ok(store
        .list(K::KIND, namespace, labels)
        .await?
        .into_iter()
        .filter_map(Object::into_typed)
        .collect())
}

/// Store backed by the Kubernetes API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, kind: ObjectKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }

    fn api_for(&self, key: &ObjectKey) -> Api<DynamicObject> {
        self.api(key.kind, key.namespace.as_deref())
    }
}

fn to_dynamic(obj: &Object) -> Result<DynamicObject> {
    Ok(serde_json::from_value(obj.to_value()?)?)
}

fn from_dynamic(kind: ObjectKind, obj: DynamicObject) -> Result<Object> {
    Object::from_value(kind, serde_json::to_value(obj)?)
}

fn map_write_error(err: kube::Error, key: &ObjectKey) -> Error {
    match &err {
        kube::Error::Api(e) if e.code == 404 => Error::NotFound {
            kind: key.kind.to_string(),
            name: key.name.clone(),
        },
        kube::Error::Api(e) if e.code == 409 && e.reason == "AlreadyExists" => {
            Error::AlreadyExists {
                kind: key.kind.to_string(),
                name: key.name.clone(),
            }
        }
        kube::Error::Api(e) if e.code == 409 => Error::Conflict {
            kind: key.kind.to_string(),
            name: key.name.clone(),
            message: e.message.clone(),
        },
        _ => Error::KubeError(err),
    }
}

fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl Store for KubeStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Object>> {
        match self.api_for(key).get(&key.name).await {
            Ok(obj) => Ok(Some(from_dynamic(key.kind, obj)?)),
            Err(kube::Error::Api(e)) if e.code == 404 => Ok(None),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Object>> {
        let mut params = ListParams::default();
        if !labels.is_empty() {
            params = params.labels(&label_selector(labels));
        }
        let list = self.api(kind, namespace).list(&params).await?;
        list.items
            .into_iter()
            .map(|obj| from_dynamic(kind, obj))
            .collect()
    }

    async fn create(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        debug!("Creating {}", key);
        let created = self
            .api_for(&key)
            .create(&PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_write_error(e, &key))?;
        from_dynamic(key.kind, created)
    }

    async fn update(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        debug!("Updating {}", key);
        let replaced = self
            .api_for(&key)
            .replace(&key.name, &PostParams::default(), &to_dynamic(obj)?)
            .await
            .map_err(|e| map_write_error(e, &key))?;
        from_dynamic(key.kind, replaced)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        debug!("Patching {}", key);
        let patched = self
            .api_for(key)
            .patch(&key.name, &merge_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, key))?;
        from_dynamic(key.kind, patched)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        debug!("Patching status of {}", key);
        let patched = self
            .api_for(key)
            .patch_status(&key.name, &merge_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| map_write_error(e, key))?;
        from_dynamic(key.kind, patched)
    }

    async fn delete(&self, key: &ObjectKey, propagation: DeletePropagation) -> Result<()> {
        debug!(?propagation, "Deleting {}", key);
        let params = match propagation {
            DeletePropagation::Background => DeleteParams::background(),
            DeletePropagation::Orphan => DeleteParams::orphan(),
        };
        self.api_for(key)
            .delete(&key.name, &params)
            .await
            .map_err(|e| map_write_error(e, key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patches_are_not_server_side_apply() {
        let params = merge_params();
        assert_eq!(params.field_manager.as_deref(), Some(FIELD_MANAGER));
        assert!(!params.force);
        assert!(!params.dry_run);
    }

    #[test]
    fn test_label_selector_is_sorted() {
        let labels: BTreeMap<String, String> = [
            ("app.kubernetes.io/instance".to_string(), "db".to_string()),
            ("apps.replicadb.io/component-name".to_string(), "mysql".to_string()),
        ]
        .into();
        assert_eq!(
            label_selector(&labels),
            "app.kubernetes.io/instance=db,apps.replicadb.io/component-name=mysql"
        );
    }
}
