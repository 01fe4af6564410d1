//! ReplicaDB-K8s: Kubernetes operator for replicated database clusters
//!
//! A `Cluster` is made of components (a database, a proxy, ...). Each pass
//! stages every object a component needs into an object graph, derives the
//! component phase from live state and applies the graph children first.

pub mod controller;
pub mod crd;
pub mod error;

pub use crate::error::{Error, Result};
