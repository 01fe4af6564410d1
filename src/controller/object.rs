//! Closed set of object kinds the component engine stages and reads
//!
//! Every vertex of the object graph holds an [`Object`], a tagged union over
//! the typed resources the engine knows about. The store speaks in these
//! objects so that a single trait covers typed CRDs, `k8s-openapi` types and
//! the hand-written snapshot class alike.

use std::fmt;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{
    ConfigMap, PersistentVolume, PersistentVolumeClaim, Pod, Secret, Service,
};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::ApiResource;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::crd::{Backup, BackupPolicy, BackupTool, Cluster, VolumeSnapshot, VolumeSnapshotClass};
use crate::error::{Error, Result};

/// A typed resource that can live in an [`Object`]
pub trait TypedObject:
    Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: ObjectKind;

    fn into_object(self) -> Object;
    fn from_object(obj: Object) -> Option<Self>;
    fn as_typed(obj: &Object) -> Option<&Self>;
    fn as_typed_mut(obj: &mut Object) -> Option<&mut Self>;
}

macro_rules! object_kinds {
    ($($variant:ident => $ty:ty),+ $(,)?) => {
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum ObjectKind {
            $($variant),+
        }

        #[derive(Clone, Debug)]
        pub enum Object {
            $($variant($ty)),+
        }

        impl ObjectKind {
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ObjectKind::$variant => stringify!($variant)),+
                }
            }

            pub fn api_resource(&self) -> ApiResource {
                match self {
                    $(ObjectKind::$variant => ApiResource::erase::<$ty>(&())),+
                }
            }

            fn decode(&self, value: Value) -> Result<Object> {
                Ok(match self {
                    $(ObjectKind::$variant => Object::$variant(serde_json::from_value(value)?)),+
                })
            }
        }

        impl Object {
            pub fn kind(&self) -> ObjectKind {
                match self {
                    $(Object::$variant(_) => ObjectKind::$variant),+
                }
            }

            pub fn meta(&self) -> &ObjectMeta {
                match self {
                    $(Object::$variant(o) => o.meta()),+
                }
            }

            pub fn meta_mut(&mut self) -> &mut ObjectMeta {
                match self {
                    $(Object::$variant(o) => o.meta_mut()),+
                }
            }

            fn encode(&self) -> Result<Value> {
                Ok(match self {
                    $(Object::$variant(o) => serde_json::to_value(o)?),+
                })
            }
        }

        $(
            impl TypedObject for $ty {
                const KIND: ObjectKind = ObjectKind::$variant;

                fn into_object(self) -> Object {
                    Object::$variant(self)
                }

                fn from_object(obj: Object) -> Option<Self> {
                    match obj {
                        Object::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn as_typed(obj: &Object) -> Option<&Self> {
                    match obj {
                        Object::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }

                fn as_typed_mut(obj: &mut Object) -> Option<&mut Self> {
                    match obj {
                        Object::$variant(o) => Some(o),
                        #[allow(unreachable_patterns)]
                        _ => None,
                    }
                }
            }

            impl From<$ty> for Object {
                fn from(o: $ty) -> Self {
                    Object::$variant(o)
                }
            }
        )+
    };
}

object_kinds! {
    Cluster => Cluster,
    StatefulSet => StatefulSet,
    Deployment => Deployment,
    Service => Service,
    Secret => Secret,
    ConfigMap => ConfigMap,
    PersistentVolumeClaim => PersistentVolumeClaim,
    PersistentVolume => PersistentVolume,
    PodDisruptionBudget => PodDisruptionBudget,
    Pod => Pod,
    Job => Job,
    StorageClass => StorageClass,
    Backup => Backup,
    BackupPolicy => BackupPolicy,
    BackupTool => BackupTool,
    VolumeSnapshot => VolumeSnapshot,
    VolumeSnapshotClass => VolumeSnapshotClass,
}

impl ObjectKind {
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            ObjectKind::PersistentVolume
                | ObjectKind::StorageClass
                | ObjectKind::BackupTool
                | ObjectKind::VolumeSnapshotClass
        )
    }

    /// Kinds whose vertices stay mutable during a status-only pass
    pub fn is_workload(&self) -> bool {
        matches!(self, ObjectKind::StatefulSet | ObjectKind::Deployment)
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of an object in the store
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: if kind.is_namespaced() {
                namespace.map(str::to_string)
            } else {
                None
            },
            name: name.into(),
        }
    }

    pub fn of<K: TypedObject>(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new(K::KIND, namespace, name)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

impl Object {
    pub fn name(&self) -> String {
        self.meta().name.clone().unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<String> {
        self.meta().namespace.clone()
    }

    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.kind(), self.meta().namespace.as_deref(), self.name())
    }

    pub fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }

    pub fn as_typed<K: TypedObject>(&self) -> Option<&K> {
        K::as_typed(self)
    }

    pub fn as_typed_mut<K: TypedObject>(&mut self) -> Option<&mut K> {
        K::as_typed_mut(self)
    }

    pub fn into_typed<K: TypedObject>(self) -> Option<K> {
        K::from_object(self)
    }

    /// JSON form, always carrying `apiVersion` and `kind`
    pub fn to_value(&self) -> Result<Value> {
        let mut value = self.encode()?;
        let ar = self.kind().api_resource();
        if let Value::Object(map) = &mut value {
            map.entry("apiVersion")
                .or_insert_with(|| Value::String(ar.api_version.clone()));
            map.entry("kind")
                .or_insert_with(|| Value::String(ar.kind.clone()));
        }
        Ok(value)
    }

    pub fn from_value(kind: ObjectKind, value: Value) -> Result<Object> {
        if !value.is_object() {
            return Err(Error::ValidationError(format!(
                "expected a JSON object for {kind}"
            )));
        }
        kind.decode(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pvc(name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_key_drops_namespace_for_cluster_scoped_kinds() {
        let key = ObjectKey::new(ObjectKind::PersistentVolume, Some("default"), "pv-1");
        assert_eq!(key.namespace, None);

        let key = ObjectKey::new(ObjectKind::PersistentVolumeClaim, Some("default"), "data-0");
        assert_eq!(key.namespace.as_deref(), Some("default"));
    }

    #[test]
    fn test_value_roundtrip_keeps_type_meta() {
        let obj = Object::from(pvc("data-db-mysql-0"));
        let value = obj.to_value().unwrap();
        assert_eq!(value["kind"], "PersistentVolumeClaim");
        assert_eq!(value["apiVersion"], "v1");

        let back = Object::from_value(ObjectKind::PersistentVolumeClaim, value).unwrap();
        assert_eq!(back.key(), obj.key());
    }

    #[test]
    fn test_snapshot_class_gets_type_meta() {
        let class = VolumeSnapshotClass {
            metadata: ObjectMeta {
                name: Some("csi-hostpath".to_string()),
                ..Default::default()
            },
            driver: "hostpath.csi.k8s.io".to_string(),
            deletion_policy: "Delete".to_string(),
            parameters: None,
        };
        let value = Object::from(class).to_value().unwrap();
        assert_eq!(value["apiVersion"], "snapshot.storage.k8s.io/v1");
        assert_eq!(value["kind"], "VolumeSnapshotClass");
    }

    #[test]
    fn test_typed_access() {
        let mut obj = Object::from(pvc("data-db-mysql-0"));
        assert!(obj.as_typed::<Pod>().is_none());
        obj.as_typed_mut::<PersistentVolumeClaim>()
            .unwrap()
            .metadata
            .labels = Some([("a".to_string(), "b".to_string())].into());
        assert_eq!(obj.meta().labels.as_ref().unwrap()["a"], "b");
    }
}
