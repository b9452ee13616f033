//! Built-in procedures, invoked via `CALL name(args) YIELD ...`.
//!
//! The procedure surface covers index-backed retrieval
//! (`db.index.vector.queryNodes`, `db.index.fulltext.queryNodes`),
//! read-only introspection (`db.labels`, `db.relationshipTypes`,
//! `db.propertyKeys`), subgraph expansion (`apoc.path.subgraphNodes`), and
//! topological link prediction over the loaded graph.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::model::{Direction, Node, NodeId, Value};
use crate::storage::RecordStore;
use crate::tx::TxState;
use crate::{Error, Result};

use super::ExecEnv;
use super::eval::Row;

/// Result of a procedure call: named columns, map-shaped rows.
#[derive(Debug, Clone, Default)]
pub struct ProcedureResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl ProcedureResult {
    fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| (*c).to_owned()).collect(),
            rows: Vec::new(),
        }
    }

    fn push(&mut self, values: Vec<(&str, Value)>) {
        self.rows
            .push(values.into_iter().map(|(k, v)| (k.to_owned(), v)).collect());
    }
}

pub async fn call(
    store: &RecordStore,
    tx: &TxState,
    env: &ExecEnv,
    name: &str,
    args: &[Value],
) -> Result<ProcedureResult> {
    match name {
        "db.index.vector.queryNodes" => vector_query_nodes(store, tx, env, args).await,
        "db.index.fulltext.queryNodes" => fulltext_query_nodes(store, tx, args),
        "db.labels" => {
            let mut result = ProcedureResult::new(&["label"]);
            for label in store.labels(tx)? {
                result.push(vec![("label", Value::String(label))]);
            }
            Ok(result)
        }
        "db.relationshipTypes" => {
            let mut result = ProcedureResult::new(&["relationshipType"]);
            for rel_type in store.relationship_types(tx)? {
                result.push(vec![("relationshipType", Value::String(rel_type))]);
            }
            Ok(result)
        }
        "db.propertyKeys" => {
            let mut result = ProcedureResult::new(&["propertyKey"]);
            for key in store.property_keys(tx)? {
                result.push(vec![("propertyKey", Value::String(key))]);
            }
            Ok(result)
        }
        "apoc.path.subgraphNodes" => subgraph_nodes(store, tx, env, args),
        "gds.linkprediction.commonNeighbors" => pairwise(store, tx, args, Topology::CommonNeighbors),
        "gds.linkprediction.jaccard" => pairwise(store, tx, args, Topology::Jaccard),
        "gds.linkprediction.adamicAdar" => pairwise(store, tx, args, Topology::AdamicAdar),
        "gds.linkprediction.resourceAllocation" => {
            pairwise(store, tx, args, Topology::ResourceAllocation)
        }
        "gds.linkprediction.preferentialAttachment" => {
            pairwise(store, tx, args, Topology::PreferentialAttachment)
        }
        "gds.linkprediction.hybrid" => hybrid_prediction(store, tx, args),
        "gds.linkprediction.suggestLinks" => suggest_links(store, tx, args),
        other => Err(Error::SemanticError(format!("Unknown procedure: {other}"))),
    }
}

// ============================================================================
// Index-backed retrieval
// ============================================================================

/// `db.index.vector.queryNodes(indexName, k, query)`: `query` is a vector
/// or a string; strings are translated through the external embedding
/// service (result cached by the embedder).
async fn vector_query_nodes(
    store: &RecordStore,
    tx: &TxState,
    env: &ExecEnv,
    args: &[Value],
) -> Result<ProcedureResult> {
    let index_name = string_arg(args, 0, "indexName")?;
    let k = int_arg(args, 1, "k")?.max(0) as usize;
    let query = match args.get(2) {
        Some(Value::String(text)) => env.embedder.embed(text).await?,
        Some(value) => value.as_vector().ok_or_else(|| Error::TypeError {
            expected: "vector or string query".into(),
            got: value.type_name().into(),
        })?,
        None => return Err(Error::SemanticError("queryNodes requires a query".into())),
    };

    let hits = store.vector_query(&index_name, &query, k, -1.0)?;
    let mut result = ProcedureResult::new(&["node", "score"]);
    for (id, score) in hits {
        // A node deleted inside this transaction may still sit in the
        // committed index; skip it.
        if let Some(node) = store.get_node(tx, id)? {
            result.push(vec![
                ("node", Value::Node(Box::new(node))),
                ("score", Value::Float(f64::from(score))),
            ]);
        }
    }
    Ok(result)
}

fn fulltext_query_nodes(
    store: &RecordStore,
    tx: &TxState,
    args: &[Value],
) -> Result<ProcedureResult> {
    let index_name = string_arg(args, 0, "indexName")?;
    let query = string_arg(args, 1, "query")?;
    let limit = match args.get(2) {
        Some(Value::Map(options)) => options
            .get("limit")
            .and_then(Value::as_int)
            .unwrap_or(100) as usize,
        _ => 100,
    };

    let hits = store.fulltext_query(&index_name, &query, limit, None)?;
    let mut result = ProcedureResult::new(&["node", "score"]);
    for (id, score) in hits {
        if let Some(node) = store.get_node(tx, id)? {
            result.push(vec![
                ("node", Value::Node(Box::new(node))),
                ("score", Value::Float(score)),
            ]);
        }
    }
    Ok(result)
}

// ============================================================================
// Subgraph expansion
// ============================================================================

/// `apoc.path.subgraphNodes(start, {maxLevel, relationshipFilter,
/// labelFilter})`: BFS from the start node under depth, type, and label
/// constraints.
fn subgraph_nodes(
    store: &RecordStore,
    tx: &TxState,
    env: &ExecEnv,
    args: &[Value],
) -> Result<ProcedureResult> {
    let start = node_arg(store, tx, args, 0)?;
    let config = match args.get(1) {
        Some(Value::Map(m)) => m.clone(),
        _ => HashMap::new(),
    };
    let max_level = config
        .get("maxLevel")
        .and_then(Value::as_int)
        .map_or(env.max_hops, |n| (n.max(0) as usize).min(env.max_hops));
    let rel_types: Vec<String> = config
        .get("relationshipFilter")
        .and_then(Value::as_str)
        .map(|s| {
            s.split('|')
                .map(|t| t.trim_matches(['<', '>']).to_owned())
                .filter(|t| !t.is_empty())
                .collect()
        })
        .unwrap_or_default();
    let label_filter: Vec<String> = config
        .get("labelFilter")
        .and_then(Value::as_str)
        .map(|s| {
            s.split(['|', ','])
                .map(|l| l.trim_start_matches(['+', '-']).to_owned())
                .filter(|l| !l.is_empty())
                .collect()
        })
        .unwrap_or_default();

    let mut visited: HashSet<u64> = HashSet::from([start.id.0]);
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::from([(start.id, 0)]);
    let mut found = vec![start];

    while let Some((current, depth)) = queue.pop_front() {
        if depth >= max_level {
            continue;
        }
        for rel in store.relationships(tx, current, Direction::Both, &rel_types)? {
            let Some(next) = rel.other_node(current) else { continue };
            if !visited.insert(next.0) {
                continue;
            }
            let Some(node) = store.get_node(tx, next)? else { continue };
            if !label_filter.is_empty()
                && !label_filter.iter().any(|l| node.has_label(l))
            {
                continue;
            }
            queue.push_back((next, depth + 1));
            found.push(node);
        }
    }

    let mut result = ProcedureResult::new(&["node"]);
    for node in found {
        result.push(vec![("node", Value::Node(Box::new(node)))]);
    }
    Ok(result)
}

// ============================================================================
// Link prediction
// ============================================================================

#[derive(Clone, Copy)]
enum Topology {
    CommonNeighbors,
    Jaccard,
    AdamicAdar,
    ResourceAllocation,
    PreferentialAttachment,
}

fn neighbor_ids(store: &RecordStore, tx: &TxState, node: NodeId) -> Result<HashSet<u64>> {
    let mut out = HashSet::new();
    for rel in store.relationships(tx, node, Direction::Both, &[])? {
        if let Some(other) = rel.other_node(node) {
            out.insert(other.0);
        }
    }
    Ok(out)
}

fn topology_score(
    store: &RecordStore,
    tx: &TxState,
    a: NodeId,
    b: NodeId,
    method: Topology,
) -> Result<f64> {
    let na = neighbor_ids(store, tx, a)?;
    let nb = neighbor_ids(store, tx, b)?;
    let common: Vec<u64> = na.intersection(&nb).copied().collect();

    let score = match method {
        Topology::CommonNeighbors => common.len() as f64,
        Topology::Jaccard => {
            let union = na.union(&nb).count();
            if union == 0 { 0.0 } else { common.len() as f64 / union as f64 }
        }
        Topology::AdamicAdar => {
            let mut sum = 0.0;
            for &c in &common {
                let degree = neighbor_ids(store, tx, NodeId(c))?.len();
                if degree > 1 {
                    sum += 1.0 / (degree as f64).ln();
                }
            }
            sum
        }
        Topology::ResourceAllocation => {
            let mut sum = 0.0;
            for &c in &common {
                let degree = neighbor_ids(store, tx, NodeId(c))?.len();
                if degree > 0 {
                    sum += 1.0 / degree as f64;
                }
            }
            sum
        }
        Topology::PreferentialAttachment => (na.len() * nb.len()) as f64,
    };
    Ok(score)
}

fn pairwise(
    store: &RecordStore,
    tx: &TxState,
    args: &[Value],
    method: Topology,
) -> Result<ProcedureResult> {
    let a = node_arg(store, tx, args, 0)?;
    let b = node_arg(store, tx, args, 1)?;
    let score = topology_score(store, tx, a.id, b.id, method)?;
    let mut result = ProcedureResult::new(&["score"]);
    result.push(vec![("score", Value::Float(score))]);
    Ok(result)
}

/// Linear combination of a topological score (Jaccard) and embedding cosine
/// similarity: `alpha * topology + (1 - alpha) * semantic`.
fn hybrid_prediction(
    store: &RecordStore,
    tx: &TxState,
    args: &[Value],
) -> Result<ProcedureResult> {
    let a = node_arg(store, tx, args, 0)?;
    let b = node_arg(store, tx, args, 1)?;
    let alpha = args
        .get(2)
        .and_then(Value::as_float)
        .unwrap_or(0.5)
        .clamp(0.0, 1.0);

    let topology = topology_score(store, tx, a.id, b.id, Topology::Jaccard)?;
    let semantic = match (&a.embedding, &b.embedding) {
        (Some(va), Some(vb)) if va.len() == vb.len() => {
            let dot: f32 = va.iter().zip(vb).map(|(x, y)| x * y).sum();
            let norm_a: f32 = va.iter().map(|x| x * x).sum::<f32>().sqrt();
            let norm_b: f32 = vb.iter().map(|x| x * x).sum::<f32>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                0.0
            } else {
                f64::from(dot / (norm_a * norm_b))
            }
        }
        _ => 0.0,
    };

    let mut result = ProcedureResult::new(&["score", "topologyScore", "semanticScore"]);
    result.push(vec![
        ("score", Value::Float(alpha * topology + (1.0 - alpha) * semantic)),
        ("topologyScore", Value::Float(topology)),
        ("semanticScore", Value::Float(semantic)),
    ]);
    Ok(result)
}

/// `gds.linkprediction.suggestLinks(label, topK [, method])`: rank
/// unconnected node pairs by topological score.
fn suggest_links(store: &RecordStore, tx: &TxState, args: &[Value]) -> Result<ProcedureResult> {
    let label = string_arg(args, 0, "label")?;
    let top_k = int_arg(args, 1, "topK")?.max(0) as usize;
    let method = match args.get(2).and_then(Value::as_str) {
        None | Some("jaccard") => Topology::Jaccard,
        Some("commonNeighbors") => Topology::CommonNeighbors,
        Some("adamicAdar") => Topology::AdamicAdar,
        Some("resourceAllocation") => Topology::ResourceAllocation,
        Some("preferentialAttachment") => Topology::PreferentialAttachment,
        Some(other) => {
            return Err(Error::SemanticError(format!(
                "unknown link prediction method '{other}'"
            )));
        }
    };

    let nodes = if label.is_empty() {
        store.all_nodes(tx)?
    } else {
        store.nodes_by_label(tx, &label)?
    };

    let mut scored: Vec<(NodeId, NodeId, f64)> = Vec::new();
    for (i, a) in nodes.iter().enumerate() {
        let neighbors = neighbor_ids(store, tx, a.id)?;
        for b in nodes.iter().skip(i + 1) {
            if neighbors.contains(&b.id.0) {
                continue; // already linked
            }
            let score = topology_score(store, tx, a.id, b.id, method)?;
            if score > 0.0 {
                scored.push((a.id, b.id, score));
            }
        }
    }
    scored.sort_by(|x, y| {
        y.2.partial_cmp(&x.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| (x.0, x.1).cmp(&(y.0, y.1)))
    });
    scored.truncate(top_k);

    let mut result = ProcedureResult::new(&["node1", "node2", "score"]);
    for (a, b, score) in scored {
        let (Some(n1), Some(n2)) = (store.get_node(tx, a)?, store.get_node(tx, b)?) else {
            continue;
        };
        result.push(vec![
            ("node1", Value::Node(Box::new(n1))),
            ("node2", Value::Node(Box::new(n2))),
            ("score", Value::Float(score)),
        ]);
    }
    Ok(result)
}

// ============================================================================
// Argument helpers
// ============================================================================

fn string_arg(args: &[Value], index: usize, name: &str) -> Result<String> {
    match args.get(index) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(Error::TypeError {
            expected: format!("String for '{name}'"),
            got: other.type_name().into(),
        }),
        None => Err(Error::SemanticError(format!("missing argument '{name}'"))),
    }
}

fn int_arg(args: &[Value], index: usize, name: &str) -> Result<i64> {
    args.get(index)
        .and_then(Value::as_int)
        .ok_or_else(|| Error::SemanticError(format!("missing integer argument '{name}'")))
}

fn node_arg(store: &RecordStore, tx: &TxState, args: &[Value], index: usize) -> Result<Node> {
    match args.get(index) {
        Some(Value::Node(node)) => Ok((**node).clone()),
        Some(Value::Int(id)) => store.require_node(tx, NodeId(*id as u64)),
        Some(other) => Err(Error::TypeError {
            expected: "Node or node id".into(),
            got: other.type_name().into(),
        }),
        None => Err(Error::SemanticError("missing node argument".into())),
    }
}
