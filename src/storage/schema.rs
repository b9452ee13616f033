//! Schema registry: secondary index and constraint definitions.
//!
//! Definitions persist under the `S:` keyspace and are cached in memory; the
//! planner consults the cache when choosing scan strategies.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::kv::KvStore;
use crate::model::{Node, NodeId};
use crate::{Error, Result};

use super::keys;

/// A property or composite index on (label, properties).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub label: String,
    pub properties: Vec<String>,
}

impl IndexDef {
    pub fn registry_name(&self) -> String {
        format!("{}:{}", self.label, self.properties.join(","))
    }

    pub fn is_composite(&self) -> bool {
        self.properties.len() > 1
    }
}

/// A uniqueness constraint on (label, property).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintDef {
    pub label: String,
    pub property: String,
}

/// Vector index backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorBackend {
    Brute,
    Hnsw,
}

/// A named cosine-similarity index over one (label, property).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorIndexDef {
    pub name: String,
    pub label: String,
    pub property: String,
    pub backend: VectorBackend,
    /// HNSW fan-out; unused by the brute-force backend.
    pub m: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

/// A named BM25 index; optional label restriction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulltextIndexDef {
    pub name: String,
    pub labels: Vec<String>,
}

/// In-memory schema cache.
#[derive(Debug, Default, Clone)]
pub struct Schema {
    /// Single-property indexes by (label, property).
    pub property_indexes: HashSet<(String, String)>,
    /// Composite indexes by label.
    pub composite_indexes: HashMap<String, Vec<IndexDef>>,
    /// Unique constraints by (label, property).
    pub constraints: HashSet<(String, String)>,
    pub vector_indexes: HashMap<String, VectorIndexDef>,
    pub fulltext_indexes: HashMap<String, FulltextIndexDef>,
}

impl Schema {
    /// Rebuild the cache from the persisted registry.
    pub fn load(kv: &KvStore) -> Result<Self> {
        let mut schema = Schema::default();
        for (_, value) in kv.scan_prefix(&keys::schema_prefix("index")) {
            let def: IndexDef = decode(&value)?;
            schema.insert_index(def);
        }
        for (_, value) in kv.scan_prefix(&keys::schema_prefix("constraint")) {
            let def: ConstraintDef = decode(&value)?;
            schema.constraints.insert((def.label, def.property));
        }
        for (_, value) in kv.scan_prefix(&keys::schema_prefix("vindex")) {
            let def: VectorIndexDef = decode(&value)?;
            schema.vector_indexes.insert(def.name.clone(), def);
        }
        for (_, value) in kv.scan_prefix(&keys::schema_prefix("ftindex")) {
            let def: FulltextIndexDef = decode(&value)?;
            schema.fulltext_indexes.insert(def.name.clone(), def);
        }
        Ok(schema)
    }

    pub fn insert_index(&mut self, def: IndexDef) {
        if def.is_composite() {
            self.composite_indexes
                .entry(def.label.clone())
                .or_default()
                .push(def);
        } else {
            self.property_indexes
                .insert((def.label.clone(), def.properties[0].clone()));
        }
    }

    pub fn has_property_index(&self, label: &str, property: &str) -> bool {
        self.property_indexes
            .contains(&(label.to_owned(), property.to_owned()))
    }

    pub fn has_constraint(&self, label: &str, property: &str) -> bool {
        self.constraints
            .contains(&(label.to_owned(), property.to_owned()))
    }

    /// Composite indexes on `label` whose leading properties are all bound.
    pub fn matching_composite<'a>(
        &'a self,
        label: &str,
        bound: &HashSet<&str>,
    ) -> Option<&'a IndexDef> {
        self.composite_indexes.get(label).and_then(|defs| {
            defs.iter()
                .filter(|def| def.properties.iter().all(|p| bound.contains(p.as_str())))
                .max_by_key(|def| def.properties.len())
        })
    }

    /// All secondary-index entries for a node under the current schema.
    /// The unique entries carry the owning node id as the KV value.
    pub fn index_entries(&self, node: &Node) -> IndexEntries {
        let mut entries = IndexEntries::default();
        for label in &node.labels {
            entries.keys.push(keys::label_key(label, node.id));

            for (idx_label, property) in &self.property_indexes {
                if idx_label == label {
                    if let Some(value) = node.properties.get(property) {
                        entries
                            .keys
                            .push(keys::prop_key(label, property, value, node.id));
                    }
                }
            }

            if let Some(defs) = self.composite_indexes.get(label) {
                for def in defs {
                    let values: Option<Vec<_>> = def
                        .properties
                        .iter()
                        .map(|p| node.properties.get(p).cloned())
                        .collect();
                    if let Some(values) = values {
                        entries.keys.push(keys::composite_key(
                            label,
                            &def.properties,
                            &values,
                            node.id,
                        ));
                    }
                }
            }

            for (c_label, property) in &self.constraints {
                if c_label == label {
                    if let Some(value) = node.properties.get(property) {
                        entries
                            .unique
                            .push((keys::unique_key(label, property, value), node.id));
                    }
                }
            }
        }
        entries
    }
}

/// Index keys derived from one node version.
#[derive(Debug, Default)]
pub struct IndexEntries {
    /// Marker entries (empty KV value).
    pub keys: Vec<Vec<u8>>,
    /// Unique-constraint entries: key → owning node id.
    pub unique: Vec<(Vec<u8>, NodeId)>,
}

pub fn encode<T: Serialize>(def: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(def).map_err(|e| Error::StorageError(format!("schema encode: {e}")))
}

pub fn decode<T: for<'de> Deserialize<'de>>(raw: &[u8]) -> Result<T> {
    serde_json::from_slice(raw).map_err(|e| Error::StorageError(format!("schema decode: {e}")))
}
