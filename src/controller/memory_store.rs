//! In-memory [`Store`] with API-server-like write semantics
//!
//! Objects are held as JSON. Every write bumps a global resourceVersion,
//! updates are rejected when the caller's version is stale, and objects
//! with finalizers are only marked for deletion until their finalizers are
//! cleared. Owner-reference garbage collection is not emulated.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::{json, Value};

use super::object::{Object, ObjectKey, ObjectKind, TypedObject};
use super::patch::apply_merge_patch;
use super::store::{DeletePropagation, Store};
use crate::error::{Error, Result};

/// One write seen by the store, in order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOp {
    pub verb: &'static str,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    uid: u64,
    ops: Vec<StoreOp>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }

    fn stamp_new(&mut self, value: &mut Value) {
        self.uid += 1;
        let uid = format!("uid-{}", self.uid);
        let rv = self.next_version();
        set_meta(value, "uid", json!(uid));
        set_meta(value, "resourceVersion", json!(rv));
        if value["metadata"]["generation"].is_null() {
            set_meta(value, "generation", json!(1));
        }
        if value["metadata"]["creationTimestamp"].is_null() {
            set_meta(value, "creationTimestamp", json!(chrono::Utc::now().to_rfc3339()));
        }
    }

    fn record(&mut self, verb: &'static str, key: &ObjectKey) {
        self.ops.push(StoreOp {
            verb,
            key: key.clone(),
        });
    }

    /// Drop a deleting object once nothing holds it back
    fn finish_deletion(&mut self, key: &ObjectKey) {
        let done = self
            .objects
            .get(key)
            .map(|v| {
                let meta = &v["metadata"];
                !meta["deletionTimestamp"].is_null() && finalizers_empty(meta)
            })
            .unwrap_or(false);
        if done {
            self.objects.remove(key);
        }
    }
}

/// Set a metadata field; `value` must be a JSON object
fn set_meta(value: &mut Value, field: &str, v: Value) {
    if !value["metadata"].is_object() {
        value["metadata"] = json!({});
    }
    if v.is_null() {
        if let Some(meta) = value["metadata"].as_object_mut() {
            meta.remove(field);
        }
    } else {
        value["metadata"][field] = v;
    }
}

fn finalizers_empty(meta: &Value) -> bool {
    meta["finalizers"]
        .as_array()
        .map(|f| f.is_empty())
        .unwrap_or(true)
}

fn labels_match(value: &Value, selector: &BTreeMap<String, String>) -> bool {
    let labels = &value["metadata"]["labels"];
    selector
        .iter()
        .all(|(k, v)| labels[k.as_str()].as_str() == Some(v.as_str()))
}

/// A write carrying a resourceVersion must carry the current one
fn check_version(key: &ObjectKey, current: &Value, given: &Value) -> Result<()> {
    let Some(given_rv) = given["metadata"]["resourceVersion"].as_str() else {
        return Ok(());
    };
    let current_rv = current["metadata"]["resourceVersion"].as_str().unwrap_or_default();
    if given_rv == current_rv {
        return Ok(());
    }
    Err(Error::Conflict {
        kind: key.kind.to_string(),
        name: key.name.clone(),
        message: format!("resourceVersion {given_rv} is stale, current is {current_rv}"),
    })
}

fn not_found(key: &ObjectKey) -> Error {
    Error::NotFound {
        kind: key.kind.to_string(),
        name: key.name.clone(),
    }
}

/// Store used by tests and dry runs
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object as-is, status included. Replaces any existing object.
    pub fn insert(&self, obj: impl Into<Object>) -> Result<ObjectKey> {
        let obj = obj.into();
        let key = obj.key();
        let mut value = obj.to_value()?;
        let mut inner = self.lock();
        inner.stamp_new(&mut value);
        inner.objects.insert(key.clone(), value);
        Ok(key)
    }

    /// Seed a typed object and return it as stored
    pub fn seed<K: TypedObject>(&self, obj: K) -> Result<K> {
        let key = self.insert(obj.into_object())?;
        self.get_now::<K>(&key)
            .ok_or_else(|| not_found(&key))
    }

    /// Synchronous typed read for assertions
    pub fn get_now<K: TypedObject>(&self, key: &ObjectKey) -> Option<K> {
        let value = self.lock().objects.get(key).cloned()?;
        Object::from_value(key.kind, value)
            .ok()
            .and_then(Object::into_typed)
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.lock().objects.contains_key(key)
    }

    pub fn keys_of(&self, kind: ObjectKind) -> Vec<ObjectKey> {
        self.lock()
            .objects
            .keys()
            .filter(|k| k.kind == kind)
            .cloned()
            .collect()
    }

    pub fn operations(&self) -> Vec<StoreOp> {
        self.lock().ops.clone()
    }

    pub fn clear_operations(&self) {
        self.lock().ops.clear();
    }

    /// Mutate a stored object in place, as another controller would
    pub fn modify<K, F>(&self, key: &ObjectKey, f: F) -> Result<()>
    where
        K: TypedObject,
        F: FnOnce(&mut K),
    {
        let mut typed = self.get_now::<K>(key).ok_or_else(|| not_found(key))?;
        f(&mut typed);
        let mut value = typed.into_object().to_value()?;
        let mut inner = self.lock();
        let rv = inner.next_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        inner.objects.insert(key.clone(), value);
        Ok(())
    }

    pub fn remove(&self, key: &ObjectKey) -> bool {
        self.lock().objects.remove(key).is_some()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &ObjectKey) -> Result<Option<Object>> {
        let value = self.lock().objects.get(key).cloned();
        value.map(|v| Object::from_value(key.kind, v)).transpose()
    }

    async fn list(
        &self,
        kind: ObjectKind,
        namespace: Option<&str>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Object>> {
        let values: Vec<Value> = self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.kind == kind)
            .filter(|(k, _)| match (namespace, &k.namespace) {
                (Some(ns), Some(obj_ns)) => ns == obj_ns,
                _ => true,
            })
            .filter(|(_, v)| labels_match(v, labels))
            .map(|(_, v)| v.clone())
            .collect();
        values
            .into_iter()
            .map(|v| Object::from_value(kind, v))
            .collect()
    }

    async fn create(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        let mut value = obj.to_value()?;
        let mut inner = self.lock();
        if inner.objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                kind: key.kind.to_string(),
                name: key.name.clone(),
            });
        }
        inner.stamp_new(&mut value);
        inner.objects.insert(key.clone(), value.clone());
        inner.record("create", &key);
        Object::from_value(key.kind, value)
    }

    async fn update(&self, obj: &Object) -> Result<Object> {
        let key = obj.key();
        let mut value = obj.to_value()?;
        let mut inner = self.lock();
        let current = inner.objects.get(&key).cloned().ok_or_else(|| not_found(&key))?;

        check_version(&key, &current, &value)?;

        // status is only written through patch_status
        match current.get("status") {
            Some(status) => value["status"] = status.clone(),
            None => {
                if let Value::Object(map) = &mut value {
                    map.remove("status");
                }
            }
        }
        let rv = inner.next_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        for field in ["uid", "creationTimestamp", "deletionTimestamp"] {
            set_meta(&mut value, field, current["metadata"][field].clone());
        }

        inner.objects.insert(key.clone(), value.clone());
        inner.record("update", &key);
        inner.finish_deletion(&key);
        Object::from_value(key.kind, value)
    }

    async fn patch(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        let mut inner = self.lock();
        let mut value = inner.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        check_version(key, &value, patch)?;
        let mut patch = patch.clone();
        if let Value::Object(map) = &mut patch {
            map.remove("status");
        }
        apply_merge_patch(&mut value, &patch);
        let rv = inner.next_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        inner.objects.insert(key.clone(), value.clone());
        inner.record("patch", key);
        inner.finish_deletion(key);
        Object::from_value(key.kind, value)
    }

    async fn patch_status(&self, key: &ObjectKey, patch: &Value) -> Result<Object> {
        let mut inner = self.lock();
        let mut value = inner.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        check_version(key, &value, patch)?;
        if let Some(status) = patch.get("status") {
            let mut target = value.get("status").cloned().unwrap_or(Value::Null);
            apply_merge_patch(&mut target, status);
            value["status"] = target;
        }
        let rv = inner.next_version();
        set_meta(&mut value, "resourceVersion", json!(rv));
        inner.objects.insert(key.clone(), value.clone());
        inner.record("patch_status", key);
        Object::from_value(key.kind, value)
    }

    async fn delete(&self, key: &ObjectKey, propagation: DeletePropagation) -> Result<()> {
        let mut inner = self.lock();
        let mut value = inner.objects.get(key).cloned().ok_or_else(|| not_found(key))?;
        if finalizers_empty(&value["metadata"]) {
            inner.objects.remove(key);
        } else if value["metadata"]["deletionTimestamp"].is_null() {
            set_meta(
                &mut value,
                "deletionTimestamp",
                json!(chrono::Utc::now().to_rfc3339()),
            );
            inner.objects.insert(key.clone(), value);
        }
        let verb = match propagation {
            DeletePropagation::Background => "delete",
            DeletePropagation::Orphan => "delete-orphan",
        };
        inner.record(verb, key);
        Ok(())
    }
}
