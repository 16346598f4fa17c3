//! Entity trait, persistence states, and disconnected entity graphs.

use crate::errors::{Result, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persistent record type stored in one entity set.
pub trait Entity: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the entity set (table) holding this entity type.
    const SET: &'static str;

    /// Fields whose string values must be unique within the set. Rows where
    /// the field is missing or null are not indexed.
    const UNIQUE_FIELDS: &'static [&'static str] = &[];

    /// Primary key of the entity within its set.
    fn key(&self) -> String;
}

/// A unique constraint over one field of an entity set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniqueIndex {
    pub set: &'static str,
    pub field: &'static str,
}

impl UniqueIndex {
    /// Every unique index `E` declares.
    pub fn of<E: Entity>() -> impl Iterator<Item = UniqueIndex> {
        E::UNIQUE_FIELDS
            .iter()
            .map(|field| UniqueIndex { set: E::SET, field: *field })
    }
}

/// Persistence state of a tracked entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityState {
    Detached,
    Unchanged,
    Added,
    Modified,
    Deleted,
}

impl EntityState {
    /// Whether committing an entity in this state writes to the store.
    pub fn is_pending(self) -> bool {
        matches!(self, Self::Added | Self::Modified | Self::Deleted)
    }
}

pub(crate) fn to_value<E: Entity>(entity: &E) -> Result<Value> {
    serde_json::to_value(entity).map_err(|e| {
        StorageError::SerializationFailed(format!("{} {}: {}", E::SET, entity.key(), e))
    })
}

pub(crate) fn from_value<E: Entity>(value: Value) -> Result<E> {
    serde_json::from_value(value)
        .map_err(|e| StorageError::SerializationFailed(format!("{}: {}", E::SET, e)))
}

/// One node of a disconnected entity graph handed to `track_graph`.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub set: &'static str,
    pub key: String,
    pub value: Value,
    /// Distance from the graph root (the root itself is 0).
    pub depth: usize,
}

impl GraphNode {
    /// Whether this node holds an entity of type `E`.
    pub fn is<E: Entity>(&self) -> bool {
        self.set == E::SET
    }

    /// Deserialize the node back into its entity type.
    pub fn entity<E: Entity>(&self) -> Result<E> {
        if !self.is::<E>() {
            return Err(StorageError::InvalidData(format!(
                "graph node {}/{} is not a {}",
                self.set,
                self.key,
                E::SET
            )));
        }
        from_value(self.value.clone())
    }
}

/// A root entity together with the related entities that arrived with it,
/// e.g. a deserialized user and its role links.
#[derive(Debug, Clone)]
pub struct EntityGraph {
    nodes: Vec<GraphNode>,
}

impl EntityGraph {
    pub fn new<E: Entity>(root: &E) -> Result<Self> {
        Ok(Self {
            nodes: vec![GraphNode {
                set: E::SET,
                key: root.key(),
                value: to_value(root)?,
                depth: 0,
            }],
        })
    }

    /// Attach a child directly below the root.
    pub fn with<E: Entity>(self, child: &E) -> Result<Self> {
        self.with_at_depth(child, 1)
    }

    /// Attach a node at an explicit depth, for deeper graphs.
    pub fn with_at_depth<E: Entity>(mut self, node: &E, depth: usize) -> Result<Self> {
        self.nodes.push(GraphNode {
            set: E::SET,
            key: node.key(),
            value: to_value(node)?,
            depth,
        });
        Ok(self)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }
}
