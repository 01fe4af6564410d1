//! Object graph of staged mutations
//!
//! Each vertex is one object plus the action to take on it. An edge
//! `parent -> child` means the child is applied before the parent, so a
//! reverse-topological walk (children first) yields a safe apply order:
//! a PVC deletion hung below a workload update lands before the update, and
//! the cluster status vertex at the root is written last.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::object::{Object, ObjectKey, TypedObject};
use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexId(usize);

impl VertexId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Patch,
    Delete,
    Noop,
    Status,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Patch => "PATCH",
            Action::Delete => "DELETE",
            Action::Noop => "NOOP",
            Action::Status => "STATUS",
        };
        f.write_str(s)
    }
}

/// One staged mutation
#[derive(Clone, Debug)]
pub struct Vertex {
    pub object: Object,
    /// Object as read from the store, used to compute patches
    pub original: Option<Object>,
    /// `None` until resolved
    pub action: Option<Action>,
    /// Skip Update/Patch even if the action asks for it
    pub immutable: bool,
    /// Delete without cascading to dependents through owner references
    pub orphan: bool,
}

impl Vertex {
    pub fn new(object: Object, action: Option<Action>) -> Self {
        Self {
            object,
            original: None,
            action,
            immutable: false,
            orphan: false,
        }
    }

    pub fn key(&self) -> ObjectKey {
        self.object.key()
    }

    pub fn typed<K: TypedObject>(&self) -> Option<&K> {
        K::as_typed(&self.object)
    }

    pub fn typed_mut<K: TypedObject>(&mut self) -> Option<&mut K> {
        K::as_typed_mut(&mut self.object)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ObjectGraph {
    vertices: Vec<Vertex>,
    /// (parent, child)
    edges: BTreeSet<(VertexId, VertexId)>,
    root: Option<VertexId>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn root(&self) -> Option<VertexId> {
        self.root
    }

    pub fn set_root(&mut self, id: VertexId) {
        self.root = Some(id);
    }

    /// Add a parentless vertex
    pub fn add_vertex(&mut self, object: impl Into<Object>, action: Option<Action>) -> VertexId {
        self.push(Vertex::new(object.into(), action))
    }

    /// Add a vertex below `parent`
    pub fn add_child(
        &mut self,
        object: impl Into<Object>,
        action: Option<Action>,
        parent: VertexId,
    ) -> Result<VertexId> {
        self.push_child(Vertex::new(object.into(), action), parent)
    }

    /// Add a fully built parentless vertex
    pub fn push(&mut self, vertex: Vertex) -> VertexId {
        let id = VertexId(self.vertices.len());
        self.vertices.push(vertex);
        id
    }

    /// Add a fully built vertex below `parent`, which must already exist
    pub fn push_child(&mut self, vertex: Vertex, parent: VertexId) -> Result<VertexId> {
        if parent.0 >= self.vertices.len() {
            return Err(Error::InvalidGraph(format!(
                "parent {parent} of {} is not in the graph",
                vertex.key()
            )));
        }
        let id = self.push(vertex);
        self.edges.insert((parent, id));
        Ok(id)
    }

    pub fn connect(&mut self, parent: VertexId, child: VertexId) -> Result<()> {
        if parent == child {
            return Err(Error::InvalidGraph(format!("self edge on {parent}")));
        }
        if parent.0 >= self.vertices.len() || child.0 >= self.vertices.len() {
            return Err(Error::InvalidGraph(format!(
                "edge {parent} -> {child} references an unknown vertex"
            )));
        }
        self.edges.insert((parent, child));
        Ok(())
    }

    pub fn vertex(&self, id: VertexId) -> Option<&Vertex> {
        self.vertices.get(id.0)
    }

    pub fn vertex_mut(&mut self, id: VertexId) -> Option<&mut Vertex> {
        self.vertices.get_mut(id.0)
    }

    pub fn vertex_ids(&self) -> impl Iterator<Item = VertexId> + '_ {
        (0..self.vertices.len()).map(VertexId)
    }

    pub fn iter(&self) -> impl Iterator<Item = (VertexId, &Vertex)> {
        self.vertices
            .iter()
            .enumerate()
            .map(|(i, v)| (VertexId(i), v))
    }

    pub fn find_all<F>(&self, predicate: F) -> Vec<VertexId>
    where
        F: Fn(&Vertex) -> bool,
    {
        self.iter()
            .filter(|(_, v)| predicate(v))
            .map(|(id, _)| id)
            .collect()
    }

    pub fn find_all_of<K: TypedObject>(&self) -> Vec<VertexId> {
        self.find_all(|v| v.object.kind() == K::KIND)
    }

    pub fn find(&self, key: &ObjectKey) -> Option<VertexId> {
        self.iter().find(|(_, v)| &v.key() == key).map(|(id, _)| id)
    }

    pub fn children(&self, id: VertexId) -> Vec<VertexId> {
        self.edges
            .iter()
            .filter(|(p, _)| *p == id)
            .map(|(_, c)| *c)
            .collect()
    }

    pub fn parents(&self, id: VertexId) -> Vec<VertexId> {
        self.edges
            .iter()
            .filter(|(_, c)| *c == id)
            .map(|(p, _)| *p)
            .collect()
    }

    /// Vertices ordered children first; ties broken by insertion order.
    pub fn reverse_topological_order(&self) -> Result<Vec<VertexId>> {
        let mut pending_children: BTreeMap<VertexId, usize> =
            self.vertex_ids().map(|id| (id, 0)).collect();
        for (parent, _) in &self.edges {
            if let Some(n) = pending_children.get_mut(parent) {
                *n += 1;
            }
        }

        let mut ready: BTreeSet<VertexId> = pending_children
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.vertices.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            for parent in self.parents(id) {
                if let Some(n) = pending_children.get_mut(&parent) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(parent);
                    }
                }
            }
        }

        if order.len() != self.vertices.len() {
            return Err(Error::InvalidGraph("object graph contains a cycle".to_string()));
        }
        Ok(order)
    }

    /// Visit every vertex children first, stopping at the first error
    pub fn walk_reverse_topological<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(VertexId, &Vertex) -> Result<()>,
    {
        for id in self.reverse_topological_order()? {
            visit(id, &self.vertices[id.0])?;
        }
        Ok(())
    }

    /// Graft `other` under `parent`. Vertices of `other` without a parent
    /// become children of `parent`. Returns the new ids in `other`'s order.
    pub fn merge(&mut self, other: ObjectGraph, parent: VertexId) -> Result<Vec<VertexId>> {
        if parent.0 >= self.vertices.len() {
            return Err(Error::InvalidGraph(format!(
                "merge target {parent} does not exist"
            )));
        }
        let offset = self.vertices.len();
        let has_parent: BTreeSet<VertexId> = other.edges.iter().map(|(_, c)| *c).collect();

        let mut mapped = Vec::with_capacity(other.vertices.len());
        for (i, vertex) in other.vertices.into_iter().enumerate() {
            let new_id = VertexId(offset + i);
            self.vertices.push(vertex);
            if !has_parent.contains(&VertexId(i)) {
                self.edges.insert((parent, new_id));
            }
            mapped.push(new_id);
        }
        for (p, c) in other.edges {
            self.edges.insert((VertexId(p.0 + offset), VertexId(c.0 + offset)));
        }
        Ok(mapped)
    }
}

impl fmt::Display for ObjectGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, v) in self.iter() {
            let action = v.action.map(|a| a.to_string()).unwrap_or_else(|| "?".into());
            write!(f, "{id} {action} {}", v.key())?;
            if v.immutable {
                write!(f, " (immutable)")?;
            }
            if v.orphan {
                write!(f, " (orphan)")?;
            }
            let children = self.children(id);
            if !children.is_empty() {
                let list: Vec<String> = children.iter().map(|c| c.to_string()).collect();
                write!(f, " -> [{}]", list.join(", "))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};

    use super::*;
    use crate::controller::fixtures::{cluster, component, ready_statefulset};
    use crate::crd::WorkloadType;

    fn config_map(name: &str) -> ConfigMap {
        let mut cm = ConfigMap::default();
        cm.metadata.name = Some(name.to_string());
        cm.metadata.namespace = Some("default".to_string());
        cm
    }

    fn pvc(name: &str) -> PersistentVolumeClaim {
        let mut pvc = PersistentVolumeClaim::default();
        pvc.metadata.name = Some(name.to_string());
        pvc.metadata.namespace = Some("default".to_string());
        pvc
    }

    #[test]
    fn test_children_apply_before_parents() {
        let comp = component(WorkloadType::Stateful, 3);
        let db = cluster(vec![comp.clone()]);
        let mut graph = ObjectGraph::new();
        let workload = graph.add_vertex(ready_statefulset(&db, &comp), Some(Action::Update));
        let delete = graph.add_child(pvc("data-db-mysql-2"), Some(Action::Delete), workload).unwrap();
        let env = graph.add_vertex(config_map("db-mysql-env"), None);

        let order = graph.reverse_topological_order().unwrap();
        let position = |id: VertexId| order.iter().position(|x| *x == id).unwrap();
        assert!(position(delete) < position(workload));
        assert_eq!(order.len(), 3);
        assert!(order.contains(&env));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = ObjectGraph::new();
        let a = graph.add_vertex(config_map("a"), Some(Action::Noop));
        let b = graph.add_child(config_map("b"), Some(Action::Noop), a).unwrap();
        graph.connect(b, a).unwrap();
        assert!(matches!(graph.reverse_topological_order(), Err(Error::InvalidGraph(_))));
    }

    #[test]
    fn test_connect_checks_endpoints() {
        let mut graph = ObjectGraph::new();
        let a = graph.add_vertex(config_map("a"), None);
        assert!(graph.connect(a, a).is_err());
        assert!(graph.connect(a, VertexId(7)).is_err());
    }

    #[test]
    fn test_unknown_parent_is_rejected() {
        let mut graph = ObjectGraph::new();
        let err = graph
            .add_child(config_map("orphaned"), Some(Action::Create), VertexId(3))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidGraph(_)));
        assert!(graph.is_empty());
    }

    #[test]
    fn test_merge_grafts_parentless_vertices() {
        let mut root = ObjectGraph::new();
        let top = root.add_vertex(config_map("root"), Some(Action::Status));
        root.set_root(top);

        let mut component = ObjectGraph::new();
        let workload = component.add_vertex(config_map("workload"), None);
        component.add_child(config_map("below"), Some(Action::Delete), workload).unwrap();

        let mapped = root.merge(component, top).unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(root.children(top), vec![mapped[0]]);
        assert_eq!(root.children(mapped[0]), vec![mapped[1]]);
        assert_eq!(root.reverse_topological_order().unwrap().last(), Some(&top));
        assert!(root.merge(ObjectGraph::new(), VertexId(9)).is_err());
    }

    #[test]
    fn test_find_by_key_and_display() {
        let mut graph = ObjectGraph::new();
        let a = graph.add_vertex(config_map("a"), Some(Action::Create));
        let b = graph.add_child(config_map("b"), None, a).unwrap();
        graph.vertex_mut(b).unwrap().immutable = true;
        graph.vertex_mut(a).unwrap().orphan = true;

        assert_eq!(graph.find(&graph.vertex(b).unwrap().key()), Some(b));
        let text = graph.to_string();
        assert!(text.contains("CREATE"));
        assert!(text.contains("(immutable)"));
        assert!(text.contains("(orphan)"));
        assert!(text.contains("-> [v1]"));
    }
}
