//! # Record store
//!
//! Encodes nodes, relationships, adjacency and secondary indexes into the KV
//! substrate (see [`keys`] for the layout). All mutations stage KV deltas
//! into the calling transaction's write-set; nothing here touches committed
//! state directly. The commit path (graph engine) validates unique
//! constraints, pushes the batch through the WAL, then applies node deltas to
//! the in-memory vector and full-text indexes.

pub mod encoding;
pub mod keys;
pub mod schema;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::info;

use crate::config::FulltextConfig;
use crate::index::{FulltextIndex, SimilarityAccelerator, VectorIndex};
use crate::kv::KvStore;
use crate::model::{Direction, Node, NodeId, PropertyMap, RelId, Relationship, Value};
use crate::tx::{NodeDelta, TxState};
use crate::{Error, Result};

use encoding::upper_bound;
use schema::{
    ConstraintDef, FulltextIndexDef, IndexDef, Schema, VectorBackend, VectorIndexDef,
};

/// Name of the engine-managed full-text index over the configured allowlist.
pub const DEFAULT_FULLTEXT_INDEX: &str = "search";
/// Name of the engine-managed vector index over node embeddings (any label).
pub const DEFAULT_VECTOR_INDEX: &str = "embeddings";

/// A schema mutation staged by a DDL statement, applied to the in-memory
/// caches after its transaction commits.
#[derive(Debug, Clone)]
pub enum SchemaChange {
    CreateIndex(IndexDef),
    DropIndex(IndexDef),
    CreateConstraint(ConstraintDef),
    DropConstraint(ConstraintDef),
    CreateVectorIndex(VectorIndexDef),
    DropVectorIndex(String),
    CreateFulltextIndex(FulltextIndexDef),
    DropFulltextIndex(String),
}

/// The record store. One per graph; cheap to share behind `Arc`.
pub struct RecordStore {
    kv: KvStore,
    schema: RwLock<Schema>,
    fulltext: RwLock<HashMap<String, FulltextIndex>>,
    vectors: RwLock<HashMap<String, VectorIndex>>,
    fulltext_config: FulltextConfig,
    accelerator: Arc<dyn SimilarityAccelerator>,
    accel_fallbacks: AtomicU64,
    next_node_id: AtomicU64,
    next_rel_id: AtomicU64,
}

impl RecordStore {
    /// Build over a recovered KV store: load the schema registry, restore id
    /// counters, and rebuild the in-memory search indexes from the records.
    pub fn open(
        kv: KvStore,
        fulltext_config: FulltextConfig,
        accelerator: Arc<dyn SimilarityAccelerator>,
    ) -> Result<Self> {
        let schema = Schema::load(&kv)?;
        let next_node_id = read_counter(&kv, keys::META_NEXT_NODE_ID);
        let next_rel_id = read_counter(&kv, keys::META_NEXT_REL_ID);

        let store = Self {
            kv,
            schema: RwLock::new(schema),
            fulltext: RwLock::new(HashMap::new()),
            vectors: RwLock::new(HashMap::new()),
            fulltext_config,
            accelerator,
            accel_fallbacks: AtomicU64::new(0),
            next_node_id: AtomicU64::new(next_node_id),
            next_rel_id: AtomicU64::new(next_rel_id),
        };
        store.ensure_default_indexes();
        store.rebuild_search_indexes()?;
        Ok(store)
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    pub fn schema(&self) -> Schema {
        self.schema.read().clone()
    }

    pub fn accelerator_fallbacks(&self) -> u64 {
        self.accel_fallbacks.load(Ordering::Relaxed)
    }

    fn ensure_default_indexes(&self) {
        let schema = self.schema.read();
        let mut vectors = self.vectors.write();
        let mut fulltext = self.fulltext.write();
        for def in schema.vector_indexes.values() {
            vectors.insert(def.name.clone(), VectorIndex::new(def.clone()));
        }
        for def in schema.fulltext_indexes.values() {
            fulltext.insert(def.name.clone(), self.new_fulltext(def));
        }
        drop(schema);

        if !vectors.contains_key(DEFAULT_VECTOR_INDEX) {
            let def = VectorIndexDef {
                name: DEFAULT_VECTOR_INDEX.to_owned(),
                label: String::new(),
                property: "embedding".to_owned(),
                backend: VectorBackend::Brute,
                m: 16,
                ef_construction: 200,
                ef_search: 100,
            };
            self.schema.write().vector_indexes.insert(def.name.clone(), def.clone());
            vectors.insert(def.name.clone(), VectorIndex::new(def));
        }
        if !fulltext.contains_key(DEFAULT_FULLTEXT_INDEX) {
            let def = FulltextIndexDef {
                name: DEFAULT_FULLTEXT_INDEX.to_owned(),
                labels: Vec::new(),
            };
            self.schema.write().fulltext_indexes.insert(def.name.clone(), def.clone());
            fulltext.insert(def.name.clone(), self.new_fulltext(&def));
        }
    }

    fn new_fulltext(&self, _def: &FulltextIndexDef) -> FulltextIndex {
        FulltextIndex::new(
            self.fulltext_config.properties.clone(),
            self.fulltext_config.ascii_folding,
        )
    }

    fn rebuild_search_indexes(&self) -> Result<()> {
        let mut count = 0usize;
        for (_, raw) in self.kv.scan_prefix(keys::NODE_PREFIX) {
            let node = decode_node(&raw)?;
            self.apply_delta_to_indexes(&NodeDelta { old: None, new: Some(node) })?;
            count += 1;
        }
        if count > 0 {
            info!(nodes = count, "search indexes rebuilt");
        }
        Ok(())
    }

    // ========================================================================
    // Node reads
    // ========================================================================

    pub fn get_node(&self, tx: &TxState, id: NodeId) -> Result<Option<Node>> {
        match tx.get(&keys::node_key(id)) {
            Some(raw) => Ok(Some(decode_node(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn require_node(&self, tx: &TxState, id: NodeId) -> Result<Node> {
        self.get_node(tx, id)?
            .ok_or_else(|| Error::NotFound(format!("node {id}")))
    }

    pub fn all_nodes(&self, tx: &TxState) -> Result<Vec<Node>> {
        tx.scan_prefix(keys::NODE_PREFIX)
            .iter()
            .map(|(_, raw)| decode_node(raw))
            .collect()
    }

    pub fn nodes_by_label(&self, tx: &TxState, label: &str) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for (key, _) in tx.scan_prefix(&keys::label_prefix(label)) {
            if let Some(id) = keys::trailing_id(&key) {
                if let Some(node) = self.get_node(tx, NodeId(id))? {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    /// Equality lookup, index-backed when an index exists for (label, key).
    pub fn nodes_by_property(
        &self,
        tx: &TxState,
        label: &str,
        key: &str,
        value: &Value,
    ) -> Result<Vec<Node>> {
        if self.schema.read().has_property_index(label, key) {
            let mut nodes = Vec::new();
            for (entry, _) in tx.scan_prefix(&keys::prop_value_prefix(label, key, value)) {
                if let Some(id) = keys::trailing_id(&entry) {
                    if let Some(node) = self.get_node(tx, NodeId(id))? {
                        nodes.push(node);
                    }
                }
            }
            return Ok(nodes);
        }
        if self.schema.read().has_constraint(label, key) {
            let unique = keys::unique_key(label, key, value);
            if let Some(raw) = tx.get(&unique) {
                let id = decode_node_id(&raw)?;
                return Ok(self.get_node(tx, id)?.into_iter().collect());
            }
            return Ok(Vec::new());
        }
        Ok(self
            .nodes_by_label(tx, label)?
            .into_iter()
            .filter(|n| n.get(key) == Some(value))
            .collect())
    }

    /// Equality lookup over a composite index: all indexed properties bound.
    pub fn nodes_by_composite(
        &self,
        tx: &TxState,
        label: &str,
        properties: &[String],
        values: &[Value],
    ) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        let prefix = keys::composite_value_prefix(label, properties, values);
        for (entry, _) in tx.scan_prefix(&prefix) {
            if let Some(id) = keys::trailing_id(&entry) {
                if let Some(node) = self.get_node(tx, NodeId(id))? {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    /// Bounded range scan over an existing property index.
    pub fn nodes_by_property_range(
        &self,
        tx: &TxState,
        label: &str,
        key: &str,
        low: Option<&Value>,
        high: Option<&Value>,
    ) -> Result<Vec<Node>> {
        let prefix = keys::prop_prefix(label, key);
        let start = match low {
            Some(v) => {
                let mut s = prefix.clone();
                s.extend_from_slice(&encoding::encode_value(v));
                s
            }
            None => prefix.clone(),
        };
        let end = match high {
            Some(v) => {
                let mut e = prefix.clone();
                e.extend_from_slice(&encoding::encode_value(v));
                upper_bound(e)
            }
            None => upper_bound(prefix),
        };
        let mut nodes = Vec::new();
        for (entry, _) in tx.scan_range(&start, &end) {
            if let Some(id) = keys::trailing_id(&entry) {
                if let Some(node) = self.get_node(tx, NodeId(id))? {
                    nodes.push(node);
                }
            }
        }
        Ok(nodes)
    }

    // ========================================================================
    // Relationship reads
    // ========================================================================

    pub fn get_relationship(&self, tx: &TxState, id: RelId) -> Result<Option<Relationship>> {
        match tx.get(&keys::rel_key(id)) {
            Some(raw) => Ok(Some(decode_rel(&raw)?)),
            None => Ok(None),
        }
    }

    /// Incident relationships, filtered by direction and (optionally) types.
    pub fn relationships(
        &self,
        tx: &TxState,
        node: NodeId,
        dir: Direction,
        rel_types: &[String],
    ) -> Result<Vec<Relationship>> {
        let mut rel_ids = BTreeSet::new();
        let scan_side = |prefix_all: Vec<u8>, typed: &dyn Fn(&str) -> Vec<u8>| -> Vec<Vec<u8>> {
            if rel_types.is_empty() {
                vec![prefix_all]
            } else {
                rel_types.iter().map(|t| typed(t)).collect()
            }
        };

        if matches!(dir, Direction::Outgoing | Direction::Both) {
            for prefix in scan_side(keys::adj_out_prefix(node), &|t| {
                keys::adj_out_type_prefix(node, t)
            }) {
                for (key, _) in tx.scan_prefix(&prefix) {
                    if let Some((_, _, _, edge)) = keys::parse_adjacency(&key) {
                        rel_ids.insert(edge);
                    }
                }
            }
        }
        if matches!(dir, Direction::Incoming | Direction::Both) {
            for prefix in scan_side(keys::adj_in_prefix(node), &|t| {
                keys::adj_in_type_prefix(node, t)
            }) {
                for (key, _) in tx.scan_prefix(&prefix) {
                    if let Some((_, _, _, edge)) = keys::parse_adjacency(&key) {
                        rel_ids.insert(edge);
                    }
                }
            }
        }

        let mut rels = Vec::new();
        for id in rel_ids {
            if let Some(rel) = self.get_relationship(tx, RelId(id))? {
                rels.push(rel);
            }
        }
        Ok(rels)
    }

    pub fn all_relationships(&self, tx: &TxState) -> Result<Vec<Relationship>> {
        tx.scan_prefix(keys::REL_PREFIX)
            .iter()
            .map(|(_, raw)| decode_rel(raw))
            .collect()
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn labels(&self, tx: &TxState) -> Result<Vec<String>> {
        let mut labels = BTreeSet::new();
        for node in self.all_nodes(tx)? {
            labels.extend(node.labels);
        }
        Ok(labels.into_iter().collect())
    }

    pub fn relationship_types(&self, tx: &TxState) -> Result<Vec<String>> {
        let mut types = BTreeSet::new();
        for rel in self.all_relationships(tx)? {
            types.insert(rel.rel_type);
        }
        Ok(types.into_iter().collect())
    }

    pub fn property_keys(&self, tx: &TxState) -> Result<Vec<String>> {
        let mut keys_set = BTreeSet::new();
        for node in self.all_nodes(tx)? {
            keys_set.extend(node.properties.into_keys());
        }
        for rel in self.all_relationships(tx)? {
            keys_set.extend(rel.properties.into_keys());
        }
        Ok(keys_set.into_iter().collect())
    }

    pub fn node_count(&self, tx: &TxState) -> Result<u64> {
        Ok(tx.scan_prefix(keys::NODE_PREFIX).len() as u64)
    }

    pub fn relationship_count(&self, tx: &TxState) -> Result<u64> {
        Ok(tx.scan_prefix(keys::REL_PREFIX).len() as u64)
    }

    // ========================================================================
    // Node writes (staging)
    // ========================================================================

    pub fn create_node(
        &self,
        tx: &mut TxState,
        labels: &[String],
        mut props: PropertyMap,
        mut embedding: Option<Vec<f32>>,
    ) -> Result<Node> {
        tx.require_writable()?;
        for label in labels {
            keys::validate_token("label", label)?;
        }
        // A literal `embedding` property is the embedding slot, not a stored
        // property.
        if embedding.is_none() {
            if let Some(value) = props.remove("embedding") {
                embedding = value.as_vector();
            }
        }

        let id = NodeId(self.next_node_id.fetch_add(1, Ordering::Relaxed));
        let node = Node {
            id,
            labels: labels.to_vec(),
            properties: props,
            embedding,
        };
        self.validate_vector_dimensions(&node)?;

        tx.put(
            keys::META_NEXT_NODE_ID.to_vec(),
            (id.0 + 1).to_le_bytes().to_vec(),
        );
        self.stage_node_indexes(tx, None, Some(&node))?;
        tx.put(keys::node_key(id), encode_node(&node)?);
        tx.record_effect(id, None, Some(node.clone()));
        Ok(node)
    }

    /// Read-modify-write helper: applies `mutate` to the current version of
    /// the node and restages records and index entries.
    pub fn update_node(
        &self,
        tx: &mut TxState,
        id: NodeId,
        mutate: impl FnOnce(&mut Node),
    ) -> Result<Node> {
        tx.require_writable()?;
        let old = self.require_node(tx, id)?;
        let mut node = old.clone();
        mutate(&mut node);
        node.id = id;

        // Property writes to `embedding` move into the embedding slot.
        if let Some(value) = node.properties.remove("embedding") {
            node.embedding = match value {
                Value::Null => None,
                other => other.as_vector(),
            };
        }
        for label in &node.labels {
            keys::validate_token("label", label)?;
        }
        self.validate_vector_dimensions(&node)?;

        self.stage_node_indexes(tx, Some(&old), Some(&node))?;
        tx.put(keys::node_key(id), encode_node(&node)?);
        tx.record_effect(id, Some(old), Some(node.clone()));
        Ok(node)
    }

    pub fn set_node_property(
        &self,
        tx: &mut TxState,
        id: NodeId,
        key: &str,
        value: Value,
    ) -> Result<()> {
        self.update_node(tx, id, |node| {
            if value.is_null() {
                node.properties.remove(key);
            } else {
                node.properties.insert(key.to_owned(), value);
            }
        })?;
        Ok(())
    }

    pub fn remove_node_property(&self, tx: &mut TxState, id: NodeId, key: &str) -> Result<()> {
        self.update_node(tx, id, |node| {
            node.properties.remove(key);
        })?;
        Ok(())
    }

    /// `SET n = {map}`: replace every property.
    pub fn replace_node_properties(
        &self,
        tx: &mut TxState,
        id: NodeId,
        props: PropertyMap,
    ) -> Result<()> {
        self.update_node(tx, id, |node| {
            node.properties = props;
        })?;
        Ok(())
    }

    /// `SET n += {map}`: merge; null values remove their key.
    pub fn merge_node_properties(
        &self,
        tx: &mut TxState,
        id: NodeId,
        props: PropertyMap,
    ) -> Result<()> {
        self.update_node(tx, id, |node| {
            for (key, value) in props {
                if value.is_null() {
                    node.properties.remove(&key);
                } else {
                    node.properties.insert(key, value);
                }
            }
        })?;
        Ok(())
    }

    pub fn add_label(&self, tx: &mut TxState, id: NodeId, label: &str) -> Result<()> {
        keys::validate_token("label", label)?;
        self.update_node(tx, id, |node| {
            if !node.labels.iter().any(|l| l == label) {
                node.labels.push(label.to_owned());
            }
        })?;
        Ok(())
    }

    pub fn remove_label(&self, tx: &mut TxState, id: NodeId, label: &str) -> Result<()> {
        self.update_node(tx, id, |node| {
            node.labels.retain(|l| l != label);
        })?;
        Ok(())
    }

    pub fn set_node_embedding(
        &self,
        tx: &mut TxState,
        id: NodeId,
        embedding: Option<Vec<f32>>,
    ) -> Result<()> {
        self.update_node(tx, id, |node| {
            node.embedding = embedding;
        })?;
        Ok(())
    }

    /// Delete a node. With `detach` the incident relationships go first;
    /// without it any incident relationship is a constraint violation.
    pub fn delete_node(&self, tx: &mut TxState, id: NodeId, detach: bool) -> Result<bool> {
        tx.require_writable()?;
        let Some(old) = self.get_node(tx, id)? else {
            return Ok(false);
        };

        let incident = self.relationships(tx, id, Direction::Both, &[])?;
        if !incident.is_empty() && !detach {
            return Err(Error::ConstraintViolation(format!(
                "cannot delete node {id}: it still has {} relationships (use DETACH DELETE)",
                incident.len()
            )));
        }
        for rel in incident {
            self.delete_relationship(tx, rel.id)?;
        }

        self.stage_node_indexes(tx, Some(&old), None)?;
        tx.delete(keys::node_key(id));
        tx.record_effect(id, Some(old), None);
        Ok(true)
    }

    // ========================================================================
    // Relationship writes (staging)
    // ========================================================================

    pub fn create_relationship(
        &self,
        tx: &mut TxState,
        src: NodeId,
        dst: NodeId,
        rel_type: &str,
        props: PropertyMap,
    ) -> Result<Relationship> {
        tx.require_writable()?;
        keys::validate_token("relationship type", rel_type)?;
        if self.get_node(tx, src)?.is_none() {
            return Err(Error::NotFound(format!("source node {src}")));
        }
        if self.get_node(tx, dst)?.is_none() {
            return Err(Error::NotFound(format!("target node {dst}")));
        }

        let id = RelId(self.next_rel_id.fetch_add(1, Ordering::Relaxed));
        let rel = Relationship {
            id,
            src,
            dst,
            rel_type: rel_type.to_owned(),
            properties: props,
        };
        tx.put(
            keys::META_NEXT_REL_ID.to_vec(),
            (id.0 + 1).to_le_bytes().to_vec(),
        );
        tx.put(keys::rel_key(id), encode_rel(&rel)?);
        tx.put(keys::adj_out_key(src, rel_type, dst, id), Vec::new());
        tx.put(keys::adj_in_key(dst, rel_type, src, id), Vec::new());
        Ok(rel)
    }

    pub fn update_relationship(
        &self,
        tx: &mut TxState,
        id: RelId,
        mutate: impl FnOnce(&mut Relationship),
    ) -> Result<Relationship> {
        tx.require_writable()?;
        let mut rel = self
            .get_relationship(tx, id)?
            .ok_or_else(|| Error::NotFound(format!("relationship {id}")))?;
        mutate(&mut rel);
        tx.put(keys::rel_key(id), encode_rel(&rel)?);
        Ok(rel)
    }

    pub fn set_relationship_property(
        &self,
        tx: &mut TxState,
        id: RelId,
        key: &str,
        value: Value,
    ) -> Result<()> {
        self.update_relationship(tx, id, |rel| {
            if value.is_null() {
                rel.properties.remove(key);
            } else {
                rel.properties.insert(key.to_owned(), value);
            }
        })?;
        Ok(())
    }

    pub fn delete_relationship(&self, tx: &mut TxState, id: RelId) -> Result<bool> {
        tx.require_writable()?;
        let Some(rel) = self.get_relationship(tx, id)? else {
            return Ok(false);
        };
        tx.delete(keys::rel_key(id));
        tx.delete(keys::adj_out_key(rel.src, &rel.rel_type, rel.dst, id));
        tx.delete(keys::adj_in_key(rel.dst, &rel.rel_type, rel.src, id));
        Ok(true)
    }

    // ========================================================================
    // Index maintenance
    // ========================================================================

    /// Swap the secondary-index entries for a node from its old version to
    /// its new one, all inside the same write-set as the record change.
    fn stage_node_indexes(
        &self,
        tx: &mut TxState,
        old: Option<&Node>,
        new: Option<&Node>,
    ) -> Result<()> {
        let schema = self.schema.read();
        let old_entries = old.map(|n| schema.index_entries(n)).unwrap_or_default();
        let new_entries = new.map(|n| schema.index_entries(n)).unwrap_or_default();

        for key in &old_entries.keys {
            if !new_entries.keys.contains(key) {
                tx.delete(key.clone());
            }
        }
        for key in &new_entries.keys {
            tx.put(key.clone(), Vec::new());
        }

        let new_unique_keys: Vec<&Vec<u8>> =
            new_entries.unique.iter().map(|(k, _)| k).collect();
        for (key, _) in &old_entries.unique {
            if !new_unique_keys.contains(&key) {
                tx.delete(key.clone());
            }
        }
        for (key, owner) in new_entries.unique {
            tx.put(key.clone(), encode_node_id(owner));
            tx.stage_unique(key, owner);
        }
        Ok(())
    }

    /// Dimension check against every vector index the node participates in.
    /// Runs at staging time so the statement (not the commit) fails.
    fn validate_vector_dimensions(&self, node: &Node) -> Result<()> {
        let vectors = self.vectors.read();
        for index in vectors.values() {
            let Some(vector) = vector_for(index.def(), node) else {
                continue;
            };
            if let Some(dim) = index.dimension() {
                if vector.len() != dim {
                    return Err(Error::ExecutionError(format!(
                        "vector index '{}' has dimension {dim}, got {}",
                        index.def().name,
                        vector.len()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Post-commit: fold a node delta into the in-memory search indexes.
    pub fn apply_delta_to_indexes(&self, delta: &NodeDelta) -> Result<()> {
        let mut fulltext = self.fulltext.write();
        let schema = self.schema.read();
        for def in schema.fulltext_indexes.values() {
            let Some(index) = fulltext.get_mut(&def.name) else {
                continue;
            };
            if let Some(old) = &delta.old {
                if fulltext_covers(def, old) {
                    index.remove_node(old.id);
                }
            }
            if let Some(new) = &delta.new {
                if fulltext_covers(def, new) {
                    index.index_node(new);
                }
            }
        }
        drop(fulltext);

        let mut vectors = self.vectors.write();
        for index in vectors.values_mut() {
            if let Some(old) = &delta.old {
                if vector_for(index.def(), old).is_some() {
                    index.remove(old.id);
                }
            }
            if let Some(new) = &delta.new {
                if let Some(vector) = vector_for(index.def(), new) {
                    index.insert(new.id, vector)?;
                }
            }
        }
        Ok(())
    }

    /// Commit-time unique validation against committed state. Runs under the
    /// engine's commit lock, after which the batch is appended atomically,
    /// so at most one of two racing transactions can win a unique key.
    pub fn validate_uniques(&self, tx: &TxState) -> Result<()> {
        let mut seen: HashMap<&[u8], NodeId> = HashMap::new();
        for (key, owner) in &tx.unique_puts {
            if let Some(first) = seen.insert(key.as_slice(), *owner) {
                if first != *owner {
                    return Err(Error::ConstraintViolation(
                        "two nodes in one transaction share a unique property value".into(),
                    ));
                }
            }
            if let Some(raw) = self.kv.get(key) {
                let current = decode_node_id(&raw)?;
                if current != *owner {
                    return Err(Error::Transient(format!(
                        "unique value already taken by node {current}"
                    )));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Vector / fulltext queries
    // ========================================================================

    pub fn vector_query(
        &self,
        index_name: &str,
        query: &[f32],
        k: usize,
        min_similarity: f32,
    ) -> Result<Vec<(NodeId, f32)>> {
        let vectors = self.vectors.read();
        let index = vectors
            .get(index_name)
            .ok_or_else(|| Error::NotFound(format!("vector index '{index_name}'")))?;
        index.query(
            query,
            k,
            min_similarity,
            self.accelerator.as_ref(),
            &self.accel_fallbacks,
        )
    }

    pub fn fulltext_query(
        &self,
        index_name: &str,
        query: &str,
        k: usize,
        label_filter: Option<&str>,
    ) -> Result<Vec<(NodeId, f64)>> {
        let fulltext = self.fulltext.read();
        let index = fulltext
            .get(index_name)
            .ok_or_else(|| Error::NotFound(format!("fulltext index '{index_name}'")))?;
        Ok(index.query(query, k, label_filter))
    }

    // ========================================================================
    // Schema DDL (staging + post-commit cache updates)
    // ========================================================================

    /// Stage index creation: registry entry plus backfilled entries for every
    /// existing node with the label.
    pub fn stage_create_index(&self, tx: &mut TxState, def: IndexDef) -> Result<SchemaChange> {
        tx.require_writable()?;
        keys::validate_token("label", &def.label)?;
        for p in &def.properties {
            keys::validate_token("property", p)?;
        }
        tx.put(
            keys::schema_key("index", &def.registry_name()),
            schema::encode(&def)?,
        );
        for node in self.nodes_by_label(tx, &def.label)? {
            if def.is_composite() {
                let values: Option<Vec<Value>> = def
                    .properties
                    .iter()
                    .map(|p| node.properties.get(p).cloned())
                    .collect();
                if let Some(values) = values {
                    tx.put(
                        keys::composite_key(&def.label, &def.properties, &values, node.id),
                        Vec::new(),
                    );
                }
            } else if let Some(value) = node.properties.get(&def.properties[0]) {
                tx.put(
                    keys::prop_key(&def.label, &def.properties[0], value, node.id),
                    Vec::new(),
                );
            }
        }
        Ok(SchemaChange::CreateIndex(def))
    }

    /// Stage a unique constraint: registry entry plus U: entries for existing
    /// nodes; existing duplicates fail the statement.
    pub fn stage_create_constraint(
        &self,
        tx: &mut TxState,
        def: ConstraintDef,
    ) -> Result<SchemaChange> {
        tx.require_writable()?;
        keys::validate_token("label", &def.label)?;
        keys::validate_token("property", &def.property)?;
        tx.put(
            keys::schema_key("constraint", &format!("{}:{}", def.label, def.property)),
            schema::encode(&def)?,
        );
        let mut seen: HashMap<Vec<u8>, NodeId> = HashMap::new();
        for node in self.nodes_by_label(tx, &def.label)? {
            if let Some(value) = node.properties.get(&def.property) {
                let key = keys::unique_key(&def.label, &def.property, value);
                if let Some(existing) = seen.insert(key.clone(), node.id) {
                    return Err(Error::ConstraintViolation(format!(
                        "cannot create constraint: nodes {existing} and {} share {}.{}",
                        node.id, def.label, def.property
                    )));
                }
                tx.put(key.clone(), encode_node_id(node.id));
                tx.stage_unique(key, node.id);
            }
        }
        Ok(SchemaChange::CreateConstraint(def))
    }

    pub fn stage_drop_index(&self, tx: &mut TxState, label: &str, property: &str) -> Result<SchemaChange> {
        tx.require_writable()?;
        let def = IndexDef { label: label.to_owned(), properties: vec![property.to_owned()] };
        tx.delete(keys::schema_key("index", &def.registry_name()));
        let prefix = keys::prop_prefix(label, property);
        for (key, _) in tx.scan_prefix(&prefix) {
            tx.delete(key);
        }
        Ok(SchemaChange::DropIndex(def))
    }

    pub fn stage_drop_constraint(
        &self,
        tx: &mut TxState,
        label: &str,
        property: &str,
    ) -> Result<SchemaChange> {
        tx.require_writable()?;
        let def = ConstraintDef { label: label.to_owned(), property: property.to_owned() };
        tx.delete(keys::schema_key(
            "constraint",
            &format!("{label}:{property}"),
        ));
        let prefix = format!("U:{label}:{property}:").into_bytes();
        for (key, _) in tx.scan_prefix(&prefix) {
            tx.delete(key);
        }
        Ok(SchemaChange::DropConstraint(def))
    }

    pub fn stage_create_vector_index(
        &self,
        tx: &mut TxState,
        def: VectorIndexDef,
    ) -> Result<SchemaChange> {
        tx.require_writable()?;
        if self.schema.read().vector_indexes.contains_key(&def.name) {
            return Err(Error::ConstraintViolation(format!(
                "vector index '{}' already exists",
                def.name
            )));
        }
        tx.put(keys::schema_key("vindex", &def.name), schema::encode(&def)?);
        Ok(SchemaChange::CreateVectorIndex(def))
    }

    pub fn stage_drop_vector_index(&self, tx: &mut TxState, name: &str) -> Result<SchemaChange> {
        tx.require_writable()?;
        tx.delete(keys::schema_key("vindex", name));
        Ok(SchemaChange::DropVectorIndex(name.to_owned()))
    }

    pub fn stage_create_fulltext_index(
        &self,
        tx: &mut TxState,
        def: FulltextIndexDef,
    ) -> Result<SchemaChange> {
        tx.require_writable()?;
        tx.put(keys::schema_key("ftindex", &def.name), schema::encode(&def)?);
        Ok(SchemaChange::CreateFulltextIndex(def))
    }

    /// Post-commit: fold a schema change into the caches and build or drop
    /// the in-memory structure behind it.
    pub fn apply_schema_change(&self, change: SchemaChange) -> Result<()> {
        match change {
            SchemaChange::CreateIndex(def) => {
                self.schema.write().insert_index(def);
            }
            SchemaChange::DropIndex(def) => {
                let mut schema = self.schema.write();
                schema
                    .property_indexes
                    .remove(&(def.label.clone(), def.properties[0].clone()));
            }
            SchemaChange::CreateConstraint(def) => {
                self.schema.write().constraints.insert((def.label, def.property));
            }
            SchemaChange::DropConstraint(def) => {
                self.schema.write().constraints.remove(&(def.label, def.property));
            }
            SchemaChange::CreateVectorIndex(def) => {
                self.schema
                    .write()
                    .vector_indexes
                    .insert(def.name.clone(), def.clone());
                let mut index = VectorIndex::new(def.clone());
                // Backfill from committed nodes.
                let snapshot = self.kv.snapshot();
                for (_, raw) in snapshot.scan_prefix(keys::NODE_PREFIX) {
                    let node = decode_node(&raw)?;
                    if let Some(vector) = vector_for(&def, &node) {
                        index.insert(node.id, vector)?;
                    }
                }
                self.vectors.write().insert(def.name, index);
            }
            SchemaChange::DropVectorIndex(name) => {
                self.schema.write().vector_indexes.remove(&name);
                self.vectors.write().remove(&name);
            }
            SchemaChange::CreateFulltextIndex(def) => {
                self.schema
                    .write()
                    .fulltext_indexes
                    .insert(def.name.clone(), def.clone());
                let mut index = self.new_fulltext(&def);
                let snapshot = self.kv.snapshot();
                for (_, raw) in snapshot.scan_prefix(keys::NODE_PREFIX) {
                    let node = decode_node(&raw)?;
                    if fulltext_covers(&def, &node) {
                        index.index_node(&node);
                    }
                }
                self.fulltext.write().insert(def.name, index);
            }
            SchemaChange::DropFulltextIndex(name) => {
                self.schema.write().fulltext_indexes.remove(&name);
                self.fulltext.write().remove(&name);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Record codecs
// ============================================================================

fn encode_node(node: &Node) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(node, bincode::config::standard())
        .map_err(|e| Error::StorageError(format!("node encode: {e}")))
}

fn decode_node(raw: &[u8]) -> Result<Node> {
    bincode::serde::decode_from_slice(raw, bincode::config::standard())
        .map(|(node, _)| node)
        .map_err(|e| Error::StorageError(format!("node decode: {e}")))
}

fn encode_rel(rel: &Relationship) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(rel, bincode::config::standard())
        .map_err(|e| Error::StorageError(format!("relationship encode: {e}")))
}

fn decode_rel(raw: &[u8]) -> Result<Relationship> {
    bincode::serde::decode_from_slice(raw, bincode::config::standard())
        .map(|(rel, _)| rel)
        .map_err(|e| Error::StorageError(format!("relationship decode: {e}")))
}

fn encode_node_id(id: NodeId) -> Vec<u8> {
    id.0.to_le_bytes().to_vec()
}

fn decode_node_id(raw: &[u8]) -> Result<NodeId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| Error::StorageError("malformed node id entry".into()))?;
    Ok(NodeId(u64::from_le_bytes(bytes)))
}

fn read_counter(kv: &KvStore, key: &[u8]) -> u64 {
    kv.get(key)
        .and_then(|raw| raw.try_into().ok().map(u64::from_le_bytes))
        .unwrap_or(1)
}

/// The vector an index sees for a node, if any. The conventional property
/// name `embedding` resolves to the node's embedding slot.
fn vector_for(def: &VectorIndexDef, node: &Node) -> Option<Vec<f32>> {
    if !def.label.is_empty() && !node.has_label(&def.label) {
        return None;
    }
    if def.property == "embedding" {
        node.embedding.clone()
    } else {
        node.properties.get(&def.property).and_then(Value::as_vector)
    }
}

fn fulltext_covers(def: &FulltextIndexDef, node: &Node) -> bool {
    def.labels.is_empty() || node.labels.iter().any(|l| def.labels.contains(l))
}
