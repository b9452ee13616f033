//! Query execution engine.
//!
//! Interprets logical plans against the record store through a transaction's
//! write-set. Operators pull their input rows, transform them, and hand the
//! result up the tree; write operators stage their effects in the transaction
//! and nothing becomes visible before commit.

pub mod eval;
pub mod functions;
pub mod matcher;
pub mod procedures;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::cypher::ast::{Expr, RemoveItem, SetItem};
use crate::embedding::Embedder;
use crate::model::{Node, Path, PropertyMap, Relationship, Value};
use crate::planner::LogicalPlan;
use crate::storage::RecordStore;
use crate::storage::schema::Schema;
use crate::tx::{MergeLocks, TxState};
use crate::{Error, Result};

use eval::{EvalCtx, GraphRef, Row, eval_expr};
use matcher::Matcher;

// ============================================================================
// Results
// ============================================================================

/// Query execution result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<ResultRow>,
    pub stats: ExecutionStats,
}

impl QueryResult {
    pub fn empty() -> Self {
        Self {
            columns: Vec::new(),
            rows: Vec::new(),
            stats: ExecutionStats::default(),
        }
    }
}

/// A single row in the result set. Preserves column order.
#[derive(Debug, Clone)]
pub struct ResultRow {
    pub values: Vec<(String, Value)>,
}

impl ResultRow {
    /// Get a typed value from the row by column name.
    pub fn get<T: FromValue>(&self, key: &str) -> Result<T> {
        let val = self
            .values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::NotFound(format!("Column '{key}'")))?;
        T::from_value(val)
    }

    /// Get a raw Value reference by column name.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.values.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Execution statistics, mirrored into client responses.
#[derive(Debug, Clone, Default)]
pub struct ExecutionStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
    pub properties_set: u64,
    pub labels_added: u64,
    pub labels_removed: u64,
    pub execution_time_ms: u64,
}

impl ExecutionStats {
    pub fn contains_updates(&self) -> bool {
        self.nodes_created
            + self.nodes_deleted
            + self.relationships_created
            + self.relationships_deleted
            + self.properties_set
            + self.labels_added
            + self.labels_removed
            > 0
    }
}

/// Convert from Value to concrete types.
pub trait FromValue: Sized {
    fn from_value(val: &Value) -> Result<Self>;
}

macro_rules! from_value_variant {
    ($ty:ty, $variant:ident, $expected:literal) => {
        impl FromValue for $ty {
            fn from_value(val: &Value) -> Result<Self> {
                match val {
                    Value::$variant(v) => Ok((**v).clone()),
                    _ => Err(Error::TypeError {
                        expected: $expected.into(),
                        got: val.type_name().into(),
                    }),
                }
            }
        }
    };
}

from_value_variant!(Node, Node, "Node");
from_value_variant!(Relationship, Relationship, "Relationship");
from_value_variant!(Path, Path, "Path");

impl FromValue for String {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::String(s) => Ok(s.clone()),
            _ => Err(Error::TypeError { expected: "String".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for i64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_int().ok_or_else(|| Error::TypeError {
            expected: "Integer".into(),
            got: val.type_name().into(),
        })
    }
}

impl FromValue for f64 {
    fn from_value(val: &Value) -> Result<Self> {
        val.as_float().ok_or_else(|| Error::TypeError {
            expected: "Float".into(),
            got: val.type_name().into(),
        })
    }
}

impl FromValue for bool {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::Bool(b) => Ok(*b),
            _ => Err(Error::TypeError { expected: "Bool".into(), got: val.type_name().into() }),
        }
    }
}

impl FromValue for Value {
    fn from_value(val: &Value) -> Result<Self> {
        Ok(val.clone())
    }
}

impl FromValue for Vec<Value> {
    fn from_value(val: &Value) -> Result<Self> {
        match val {
            Value::List(l) => Ok(l.clone()),
            _ => Err(Error::TypeError { expected: "List".into(), got: val.type_name().into() }),
        }
    }
}

// ============================================================================
// Environment
// ============================================================================

/// Per-statement execution environment.
pub struct ExecEnv {
    pub schema: Schema,
    pub embedder: Arc<dyn Embedder>,
    pub max_hops: usize,
    /// Statement deadline; loops check it between rows.
    pub deadline: Option<Instant>,
    /// Per-unique-tuple locks serializing concurrent MERGE on constrained
    /// properties. Guards stay alive until the enclosing commit.
    pub merge_locks: Arc<MergeLocks>,
    pub held_guards: Mutex<Vec<tokio::sync::OwnedMutexGuard<()>>>,
}

impl ExecEnv {
    fn check_deadline(&self) -> Result<()> {
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Err(Error::Timeout("query execution deadline exceeded".into()));
            }
        }
        Ok(())
    }
}

struct ExecContext<'e> {
    columns: Vec<String>,
    stats: ExecutionStats,
    params: PropertyMap,
    env: &'e ExecEnv,
}

impl ExecContext<'_> {
    fn add_column(&mut self, name: &str) {
        if !self.columns.iter().any(|c| c == name) {
            self.columns.push(name.to_owned());
        }
    }
}

/// Execute a logical plan. The transaction accumulates any writes; commit is
/// the caller's business.
pub async fn execute(
    store: &RecordStore,
    tx: &mut TxState,
    plan: &LogicalPlan,
    params: PropertyMap,
    env: &ExecEnv,
) -> Result<QueryResult> {
    let started = Instant::now();
    let mut ctx = ExecContext {
        columns: Vec::new(),
        stats: ExecutionStats::default(),
        params,
        env,
    };

    let rows = execute_plan(store, tx, plan, &mut ctx).await?;

    let columns = ctx.columns.clone();
    let result_rows: Vec<ResultRow> = rows
        .into_iter()
        .map(|row| {
            let values: Vec<(String, Value)> = columns
                .iter()
                .map(|col| (col.clone(), row.get(col).cloned().unwrap_or(Value::Null)))
                .collect();
            ResultRow { values }
        })
        .collect();

    let mut stats = ctx.stats;
    stats.execution_time_ms = started.elapsed().as_millis() as u64;
    Ok(QueryResult { columns, rows: result_rows, stats })
}

// ============================================================================
// Plan walk
// ============================================================================

fn execute_plan<'a, 'e: 'a>(
    store: &'a RecordStore,
    tx: &'a mut TxState,
    plan: &'a LogicalPlan,
    ctx: &'a mut ExecContext<'e>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Vec<Row>>> + Send + 'a>> {
    Box::pin(async move {
        ctx.env.check_deadline()?;
        match plan {
            LogicalPlan::Argument => Ok(vec![HashMap::new()]),

            LogicalPlan::Match { input, patterns, optional, where_clause } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                for pattern in patterns {
                    for alias in pattern_aliases(pattern) {
                        ctx.add_column(&alias);
                    }
                }

                let graph = GraphRef {
                    store,
                    tx,
                    schema: &ctx.env.schema,
                    max_hops: ctx.env.max_hops,
                };
                let matcher = Matcher::new(graph, &ctx.params);
                let mut rows = Vec::new();
                for row in input_rows {
                    ctx.env.check_deadline()?;
                    let matched =
                        matcher.match_patterns(row.clone(), patterns, where_clause.as_ref())?;
                    if matched.is_empty() && *optional {
                        // Left-outer semantics: keep the row, bind the
                        // pattern's new variables to NULL.
                        let mut padded = row;
                        for pattern in patterns {
                            for alias in pattern_aliases(pattern) {
                                padded.entry(alias).or_insert(Value::Null);
                            }
                        }
                        rows.push(padded);
                    } else {
                        rows.extend(matched);
                    }
                }
                Ok(rows)
            }

            LogicalPlan::Unwind { input, expr, alias } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                ctx.add_column(alias);
                let eval_ctx = EvalCtx::new(&ctx.params);
                let mut rows = Vec::new();
                for row in input_rows {
                    match eval_expr(expr, &row, &eval_ctx)? {
                        Value::List(items) => {
                            for item in items {
                                let mut new_row = row.clone();
                                new_row.insert(alias.clone(), item);
                                rows.push(new_row);
                            }
                        }
                        Value::Null => {}
                        single => {
                            let mut new_row = row.clone();
                            new_row.insert(alias.clone(), single);
                            rows.push(new_row);
                        }
                    }
                }
                Ok(rows)
            }

            LogicalPlan::Create { input, patterns } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                let mut rows = Vec::new();
                for mut row in input_rows {
                    for pattern in patterns {
                        create_pattern(store, tx, &mut row, pattern, ctx)?;
                    }
                    rows.push(row);
                }
                for pattern in patterns {
                    for alias in pattern_aliases(pattern) {
                        ctx.add_column(&alias);
                    }
                }
                Ok(rows)
            }

            LogicalPlan::Merge { input, pattern, on_create, on_match } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                for alias in pattern_aliases(pattern) {
                    ctx.add_column(&alias);
                }
                let mut rows = Vec::new();
                for row in input_rows {
                    let merged =
                        merge_pattern(store, tx, row, pattern, on_create, on_match, ctx).await?;
                    rows.extend(merged);
                }
                Ok(rows)
            }

            LogicalPlan::SetItems { input, items } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                let mut rows = Vec::new();
                for mut row in input_rows {
                    apply_set_items(store, tx, &mut row, items, ctx)?;
                    rows.push(row);
                }
                Ok(rows)
            }

            LogicalPlan::RemoveItems { input, items } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                let mut rows = Vec::new();
                for mut row in input_rows {
                    apply_remove_items(store, tx, &mut row, items, ctx)?;
                    rows.push(row);
                }
                Ok(rows)
            }

            LogicalPlan::Delete { input, variables, detach } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                for row in &input_rows {
                    for variable in variables {
                        match row.get(variable) {
                            Some(Value::Node(n)) => {
                                if store.delete_node(tx, n.id, *detach)? {
                                    ctx.stats.nodes_deleted += 1;
                                }
                            }
                            Some(Value::Relationship(r)) => {
                                if store.delete_relationship(tx, r.id)? {
                                    ctx.stats.relationships_deleted += 1;
                                }
                            }
                            Some(Value::Path(p)) => {
                                for rel in &p.relationships {
                                    if store.delete_relationship(tx, rel.id)? {
                                        ctx.stats.relationships_deleted += 1;
                                    }
                                }
                                for node in &p.nodes {
                                    if store.delete_node(tx, node.id, *detach)? {
                                        ctx.stats.nodes_deleted += 1;
                                    }
                                }
                            }
                            Some(Value::Null) | None => {}
                            Some(other) => {
                                return Err(Error::TypeError {
                                    expected: "Node, Relationship, or Path".into(),
                                    got: other.type_name().into(),
                                });
                            }
                        }
                    }
                }
                Ok(input_rows)
            }

            LogicalPlan::CallProcedure { input, name, args, yields, where_clause } => {
                let input_rows = execute_plan(store, tx, input, ctx).await?;
                let mut rows = Vec::new();
                let mut proc_columns: Vec<String> = Vec::new();

                for row in input_rows {
                    ctx.env.check_deadline()?;
                    let eval_ctx = EvalCtx::new(&ctx.params);
                    let arg_values: Vec<Value> = args
                        .iter()
                        .map(|a| eval_expr(a, &row, &eval_ctx))
                        .collect::<Result<_>>()?;

                    let result =
                        procedures::call(store, tx, ctx.env, name, &arg_values).await?;
                    proc_columns = result.columns.clone();

                    for proc_row in result.rows {
                        let mut new_row = row.clone();
                        if yields.is_empty() {
                            for (col, val) in proc_row {
                                new_row.insert(col, val);
                            }
                        } else {
                            for item in yields {
                                let value = proc_row
                                    .get(&item.column)
                                    .cloned()
                                    .ok_or_else(|| {
                                        Error::SemanticError(format!(
                                            "procedure {name} does not yield '{}'",
                                            item.column
                                        ))
                                    })?;
                                let bound = item.alias.clone().unwrap_or(item.column.clone());
                                new_row.insert(bound, value);
                            }
                        }
                        rows.push(new_row);
                    }
                }

                if yields.is_empty() {
                    for col in proc_columns {
                        ctx.add_column(&col);
                    }
                } else {
                    for item in yields {
                        ctx.add_column(item.alias.as_ref().unwrap_or(&item.column));
                    }
                }

                if let Some(predicate) = where_clause {
                    let eval_ctx = EvalCtx::new(&ctx.params);
                    let mut filtered = Vec::new();
                    for row in rows {
                        if eval_expr(predicate, &row, &eval_ctx)?.is_truthy() {
                            filtered.push(row);
                        }
                    }
                    rows = filtered;
                }
                Ok(rows)
            }

            LogicalPlan::Project { input, items } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let star = items.iter().any(|(expr, _)| matches!(expr, Expr::Star));

                let mut columns: Vec<String> = if star {
                    ctx.columns.clone()
                } else {
                    Vec::new()
                };
                for (expr, alias) in items {
                    if matches!(expr, Expr::Star) {
                        continue;
                    }
                    if !columns.contains(alias) {
                        columns.push(alias.clone());
                    }
                }

                ctx.columns = columns;
                let eval_ctx = EvalCtx::new(&ctx.params);
                let mut projected = Vec::new();
                for row in &rows {
                    // The source bindings stay in the row so ORDER BY can
                    // still reach them; the declared columns alone decide
                    // what the client sees.
                    let mut new_row = row.clone();
                    for (expr, alias) in items {
                        if matches!(expr, Expr::Star) {
                            continue;
                        }
                        new_row.insert(alias.clone(), eval_expr(expr, row, &eval_ctx)?);
                    }
                    projected.push(new_row);
                }
                Ok(projected)
            }

            LogicalPlan::Aggregate { input, group_by, aggregations } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let result = aggregate_rows(&rows, group_by, aggregations, &ctx.params)?;
                ctx.columns.clear();
                for (_, alias) in group_by {
                    ctx.columns.push(alias.clone());
                }
                for (_, alias) in aggregations {
                    ctx.columns.push(alias.clone());
                }
                Ok(result)
            }

            LogicalPlan::Filter { input, predicate } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let graph = GraphRef {
                    store,
                    tx,
                    schema: &ctx.env.schema,
                    max_hops: ctx.env.max_hops,
                };
                let eval_ctx = EvalCtx::with_graph(&ctx.params, graph);
                let mut filtered = Vec::new();
                for row in rows {
                    if eval_expr(predicate, &row, &eval_ctx)?.is_truthy() {
                        filtered.push(row);
                    }
                }
                Ok(filtered)
            }

            LogicalPlan::Distinct { input } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let columns = ctx.columns.clone();
                let mut seen: Vec<String> = Vec::new();
                let mut result = Vec::new();
                for row in rows {
                    let key: String = columns
                        .iter()
                        .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
                        .collect::<Vec<_>>()
                        .join("\u{1f}");
                    if !seen.contains(&key) {
                        seen.push(key);
                        result.push(row);
                    }
                }
                Ok(result)
            }

            LogicalPlan::Sort { input, keys } => {
                let mut rows = execute_plan(store, tx, input, ctx).await?;
                let params = ctx.params.clone();
                let eval_ctx = EvalCtx::new(&params);
                // Sort is best-effort: evaluation errors order as NULL.
                rows.sort_by(|a, b| {
                    for (expr, ascending) in keys {
                        let va = eval_expr(expr, a, &eval_ctx).unwrap_or(Value::Null);
                        let vb = eval_expr(expr, b, &eval_ctx).unwrap_or(Value::Null);
                        let ord = va.order_cmp(&vb);
                        let ord = if *ascending { ord } else { ord.reverse() };
                        if ord != std::cmp::Ordering::Equal {
                            return ord;
                        }
                    }
                    std::cmp::Ordering::Equal
                });
                Ok(rows)
            }

            LogicalPlan::Skip { input, count } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let n = paging_count(count, &ctx.params, "SKIP")?;
                Ok(rows.into_iter().skip(n).collect())
            }

            LogicalPlan::Limit { input, count } => {
                let rows = execute_plan(store, tx, input, ctx).await?;
                let n = paging_count(count, &ctx.params, "LIMIT")?;
                Ok(rows.into_iter().take(n).collect())
            }

            LogicalPlan::Union { branches, all } => {
                let mut rows = Vec::new();
                let mut columns: Option<Vec<String>> = None;
                for branch in branches {
                    ctx.columns.clear();
                    let branch_rows = execute_plan(store, tx, branch, ctx).await?;
                    if let Some(expected) = &columns {
                        if *expected != ctx.columns {
                            return Err(Error::SemanticError(
                                "UNION branches must return the same columns".into(),
                            ));
                        }
                    } else {
                        columns = Some(ctx.columns.clone());
                    }
                    rows.extend(branch_rows);
                }
                ctx.columns = columns.unwrap_or_default();

                if !all {
                    let columns = ctx.columns.clone();
                    let mut seen: Vec<String> = Vec::new();
                    rows.retain(|row| {
                        let key: String = columns
                            .iter()
                            .map(|c| row.get(c).map(|v| v.to_string()).unwrap_or_default())
                            .collect::<Vec<_>>()
                            .join("\u{1f}");
                        if seen.contains(&key) {
                            false
                        } else {
                            seen.push(key);
                            true
                        }
                    });
                }
                Ok(rows)
            }

            LogicalPlan::ShowIndexes => {
                ctx.columns = vec!["name".into(), "type".into(), "labelsOrTypes".into(), "properties".into()];
                let schema = &ctx.env.schema;
                let mut rows = Vec::new();
                for (label, property) in &schema.property_indexes {
                    rows.push(show_row(
                        &format!("{label}_{property}"),
                        "RANGE",
                        label,
                        std::slice::from_ref(property),
                    ));
                }
                for defs in schema.composite_indexes.values() {
                    for def in defs {
                        rows.push(show_row(
                            &def.registry_name(),
                            "RANGE",
                            &def.label,
                            &def.properties,
                        ));
                    }
                }
                for def in schema.vector_indexes.values() {
                    rows.push(show_row(
                        &def.name,
                        "VECTOR",
                        &def.label,
                        std::slice::from_ref(&def.property),
                    ));
                }
                for def in schema.fulltext_indexes.values() {
                    rows.push(show_row(&def.name, "FULLTEXT", &def.labels.join(","), &[]));
                }
                rows.sort_by_key(|r| r.get("name").map(|v| v.to_string()).unwrap_or_default());
                Ok(rows)
            }

            LogicalPlan::ShowConstraints => {
                ctx.columns = vec!["name".into(), "type".into(), "labelsOrTypes".into(), "properties".into()];
                let mut rows: Vec<Row> = ctx
                    .env
                    .schema
                    .constraints
                    .iter()
                    .map(|(label, property)| {
                        show_row(
                            &format!("{label}_{property}_unique"),
                            "UNIQUENESS",
                            label,
                            std::slice::from_ref(property),
                        )
                    })
                    .collect();
                rows.sort_by_key(|r| r.get("name").map(|v| v.to_string()).unwrap_or_default());
                Ok(rows)
            }
        }
    })
}

fn show_row(name: &str, kind: &str, label: &str, properties: &[String]) -> Row {
    HashMap::from([
        ("name".to_owned(), Value::String(name.to_owned())),
        ("type".to_owned(), Value::String(kind.to_owned())),
        ("labelsOrTypes".to_owned(), Value::String(label.to_owned())),
        (
            "properties".to_owned(),
            Value::List(properties.iter().map(|p| Value::String(p.clone())).collect()),
        ),
    ])
}

fn paging_count(expr: &Expr, params: &PropertyMap, clause: &str) -> Result<usize> {
    let ctx = EvalCtx::new(params);
    let value = eval_expr(expr, &HashMap::new(), &ctx)?;
    match value.as_int() {
        Some(n) if n >= 0 => Ok(n as usize),
        _ => Err(Error::SemanticError(format!(
            "{clause} requires a non-negative integer"
        ))),
    }
}

/// All variable names a pattern can bind: node aliases, relationship aliases,
/// and the path name.
fn pattern_aliases(pattern: &crate::cypher::ast::Pattern) -> Vec<String> {
    let mut aliases = Vec::new();
    if let Some(name) = &pattern.name {
        aliases.push(name.clone());
    }
    for element in &pattern.elements {
        match element {
            crate::cypher::ast::PatternElement::Node(n) => {
                if let Some(alias) = &n.alias {
                    aliases.push(alias.clone());
                }
            }
            crate::cypher::ast::PatternElement::Relationship(r) => {
                if let Some(alias) = &r.alias {
                    aliases.push(alias.clone());
                }
            }
        }
    }
    aliases
}

// ============================================================================
// Write operators
// ============================================================================

fn create_pattern(
    store: &RecordStore,
    tx: &mut TxState,
    row: &mut Row,
    pattern: &crate::cypher::ast::Pattern,
    ctx: &mut ExecContext<'_>,
) -> Result<()> {
    use crate::cypher::ast::{PatternDirection, PatternElement};

    if pattern.path_fn.is_some() {
        return Err(Error::SemanticError("cannot CREATE a shortestPath pattern".into()));
    }

    let mut current = resolve_or_create_node(store, tx, row, pattern.elements.first(), ctx)?;

    let mut rest = pattern.elements[1..].chunks_exact(2);
    for chunk in &mut rest {
        let (rel_pattern, node_pattern) = match chunk {
            [PatternElement::Relationship(r), PatternElement::Node(n)] => (r, n),
            _ => {
                return Err(Error::SemanticError(
                    "pattern must alternate nodes and relationships".into(),
                ));
            }
        };
        if rel_pattern.var_length.is_some() {
            return Err(Error::SemanticError(
                "variable-length relationships cannot be created".into(),
            ));
        }
        if rel_pattern.rel_types.len() != 1 {
            return Err(Error::SemanticError(
                "CREATE requires exactly one relationship type".into(),
            ));
        }

        let target =
            resolve_or_create_node(store, tx, row, Some(&PatternElement::Node(node_pattern.clone())), ctx)?;

        let (src, dst) = match rel_pattern.direction {
            PatternDirection::Right => (current.id, target.id),
            PatternDirection::Left => (target.id, current.id),
            PatternDirection::Both => {
                return Err(Error::SemanticError(
                    "CREATE requires a directed relationship".into(),
                ));
            }
        };

        let eval_ctx = EvalCtx::new(&ctx.params);
        let mut props = PropertyMap::new();
        for (key, expr) in &rel_pattern.properties {
            props.insert(key.clone(), eval_expr(expr, row, &eval_ctx)?);
        }

        let rel = store.create_relationship(tx, src, dst, &rel_pattern.rel_types[0], props)?;
        ctx.stats.relationships_created += 1;
        if let Some(alias) = &rel_pattern.alias {
            row.insert(alias.clone(), Value::Relationship(Box::new(rel)));
        }
        current = target;
    }
    Ok(())
}

fn resolve_or_create_node(
    store: &RecordStore,
    tx: &mut TxState,
    row: &mut Row,
    element: Option<&crate::cypher::ast::PatternElement>,
    ctx: &mut ExecContext<'_>,
) -> Result<Node> {
    use crate::cypher::ast::PatternElement;

    let Some(PatternElement::Node(pattern)) = element else {
        return Err(Error::SemanticError("pattern must start with a node".into()));
    };

    if let Some(alias) = &pattern.alias {
        if let Some(bound) = row.get(alias) {
            return match bound {
                Value::Node(node) => Ok((**node).clone()),
                other => Err(Error::TypeError {
                    expected: "Node".into(),
                    got: other.type_name().into(),
                }),
            };
        }
    }

    let eval_ctx = EvalCtx::new(&ctx.params);
    let mut props = PropertyMap::new();
    for (key, expr) in &pattern.properties {
        let value = eval_expr(expr, row, &eval_ctx)?;
        if !value.is_null() {
            props.insert(key.clone(), value);
        }
    }

    let node = store.create_node(tx, &pattern.labels, props, None)?;
    ctx.stats.nodes_created += 1;
    if let Some(alias) = &pattern.alias {
        row.insert(alias.clone(), Value::Node(Box::new(node.clone())));
    }
    Ok(node)
}

/// MERGE: match the pattern; on hits apply ON MATCH, otherwise create the
/// whole pattern and apply ON CREATE.
///
/// When the pattern's properties hit a unique constraint the merge takes a
/// write-lock on the constrained tuple, so two racing identical merges
/// serialize here and the loser sees the winner's node. Without a constraint
/// the merge is best-effort and concurrent identical merges may both create.
async fn merge_pattern(
    store: &RecordStore,
    tx: &mut TxState,
    mut row: Row,
    pattern: &crate::cypher::ast::Pattern,
    on_create: &[SetItem],
    on_match: &[SetItem],
    ctx: &mut ExecContext<'_>,
) -> Result<Vec<Row>> {
    use crate::cypher::ast::PatternElement;

    // Lock constrained (label, property, value) tuples named by the pattern.
    let eval_ctx = EvalCtx::new(&ctx.params);
    for element in &pattern.elements {
        if let PatternElement::Node(node) = element {
            for label in &node.labels {
                for (key, expr) in &node.properties {
                    if ctx.env.schema.has_constraint(label, key) {
                        let value = eval_expr(expr, &row, &eval_ctx)?;
                        let lock_key = crate::storage::keys::unique_key(label, key, &value);
                        let guard = ctx.env.merge_locks.acquire(lock_key).await;
                        ctx.env.held_guards.lock().push(guard);
                    }
                }
            }
        }
    }

    let matched = {
        let graph = GraphRef {
            store,
            tx,
            schema: &ctx.env.schema,
            max_hops: ctx.env.max_hops,
        };
        let matcher = Matcher::new(graph, &ctx.params);
        matcher.match_pattern(row.clone(), pattern)?
    };

    if !matched.is_empty() {
        let mut rows = Vec::new();
        for mut m in matched {
            apply_set_items(store, tx, &mut m, on_match, ctx)?;
            rows.push(m);
        }
        return Ok(rows);
    }

    create_pattern(store, tx, &mut row, pattern, ctx)?;
    apply_set_items(store, tx, &mut row, on_create, ctx)?;
    Ok(vec![row])
}

fn apply_set_items(
    store: &RecordStore,
    tx: &mut TxState,
    row: &mut Row,
    items: &[SetItem],
    ctx: &mut ExecContext<'_>,
) -> Result<()> {
    let params = ctx.params.clone();
    let eval_ctx = EvalCtx::new(&params);

    for item in items {
        match item {
            SetItem::Property { variable, key, value } => {
                let val = eval_expr(value, row, &eval_ctx)?;
                match row.get(variable).cloned() {
                    Some(Value::Node(n)) => {
                        store.set_node_property(tx, n.id, key, val)?;
                        ctx.stats.properties_set += 1;
                        rebind_node(store, tx, row, variable, n.id)?;
                    }
                    Some(Value::Relationship(r)) => {
                        store.set_relationship_property(tx, r.id, key, val)?;
                        ctx.stats.properties_set += 1;
                        rebind_rel(store, tx, row, variable, r.id)?;
                    }
                    Some(Value::Null) | None => {}
                    Some(other) => {
                        return Err(Error::TypeError {
                            expected: "Node or Relationship".into(),
                            got: other.type_name().into(),
                        });
                    }
                }
            }
            SetItem::AllProperties { variable, value }
            | SetItem::MergeProperties { variable, value } => {
                let replace = matches!(item, SetItem::AllProperties { .. });
                let val = eval_expr(value, row, &eval_ctx)?;
                let props = match val {
                    Value::Map(m) => m,
                    Value::Node(n) => n.properties,
                    Value::Null => continue,
                    other => {
                        return Err(Error::TypeError {
                            expected: "Map".into(),
                            got: other.type_name().into(),
                        });
                    }
                };
                match row.get(variable).cloned() {
                    Some(Value::Node(n)) => {
                        ctx.stats.properties_set += props.len() as u64;
                        if replace {
                            store.replace_node_properties(tx, n.id, props)?;
                        } else {
                            store.merge_node_properties(tx, n.id, props)?;
                        }
                        rebind_node(store, tx, row, variable, n.id)?;
                    }
                    Some(Value::Null) | None => {}
                    Some(other) => {
                        return Err(Error::TypeError {
                            expected: "Node".into(),
                            got: other.type_name().into(),
                        });
                    }
                }
            }
            SetItem::Label { variable, label } => match row.get(variable).cloned() {
                Some(Value::Node(n)) => {
                    store.add_label(tx, n.id, label)?;
                    ctx.stats.labels_added += 1;
                    rebind_node(store, tx, row, variable, n.id)?;
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(Error::TypeError {
                        expected: "Node".into(),
                        got: other.type_name().into(),
                    });
                }
            },
        }
    }
    Ok(())
}

fn apply_remove_items(
    store: &RecordStore,
    tx: &mut TxState,
    row: &mut Row,
    items: &[RemoveItem],
    ctx: &mut ExecContext<'_>,
) -> Result<()> {
    for item in items {
        match item {
            RemoveItem::Property { variable, key } => match row.get(variable).cloned() {
                Some(Value::Node(n)) => {
                    store.remove_node_property(tx, n.id, key)?;
                    ctx.stats.properties_set += 1;
                    rebind_node(store, tx, row, variable, n.id)?;
                }
                Some(Value::Relationship(r)) => {
                    store.set_relationship_property(tx, r.id, key, Value::Null)?;
                    ctx.stats.properties_set += 1;
                    rebind_rel(store, tx, row, variable, r.id)?;
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(Error::TypeError {
                        expected: "Node or Relationship".into(),
                        got: other.type_name().into(),
                    });
                }
            },
            RemoveItem::Label { variable, label } => match row.get(variable).cloned() {
                Some(Value::Node(n)) => {
                    store.remove_label(tx, n.id, label)?;
                    ctx.stats.labels_removed += 1;
                    rebind_node(store, tx, row, variable, n.id)?;
                }
                Some(Value::Null) | None => {}
                Some(other) => {
                    return Err(Error::TypeError {
                        expected: "Node".into(),
                        got: other.type_name().into(),
                    });
                }
            },
        }
    }
    Ok(())
}

/// Refresh a row binding after a mutation so later clauses see the new state.
fn rebind_node(
    store: &RecordStore,
    tx: &TxState,
    row: &mut Row,
    variable: &str,
    id: crate::model::NodeId,
) -> Result<()> {
    if let Some(node) = store.get_node(tx, id)? {
        row.insert(variable.to_owned(), Value::Node(Box::new(node)));
    }
    Ok(())
}

fn rebind_rel(
    store: &RecordStore,
    tx: &TxState,
    row: &mut Row,
    variable: &str,
    id: crate::model::RelId,
) -> Result<()> {
    if let Some(rel) = store.get_relationship(tx, id)? {
        row.insert(variable.to_owned(), Value::Relationship(Box::new(rel)));
    }
    Ok(())
}

// ============================================================================
// Aggregation
// ============================================================================

fn aggregate_rows(
    rows: &[Row],
    group_by: &[(Expr, String)],
    aggregations: &[(Expr, String)],
    params: &PropertyMap,
) -> Result<Vec<Row>> {
    let eval_ctx = EvalCtx::new(params);
    let mut groups: Vec<(Vec<Value>, Vec<&Row>)> = Vec::new();

    for row in rows {
        let key: Vec<Value> = group_by
            .iter()
            .map(|(expr, _)| eval_expr(expr, row, &eval_ctx).unwrap_or(Value::Null))
            .collect();
        if let Some(group) = groups.iter_mut().find(|(k, _)| *k == key) {
            group.1.push(row);
        } else {
            groups.push((key, vec![row]));
        }
    }

    // No rows and no grouping: one row of aggregate defaults (count = 0).
    if groups.is_empty() && group_by.is_empty() {
        let mut result_row = HashMap::new();
        for (expr, alias) in aggregations {
            result_row.insert(alias.clone(), compute_aggregate(expr, &[], params)?);
        }
        return Ok(vec![result_row]);
    }

    let mut result = Vec::new();
    for (key_vals, group_rows) in &groups {
        let mut row = HashMap::new();
        for (i, (_, alias)) in group_by.iter().enumerate() {
            row.insert(alias.clone(), key_vals[i].clone());
        }
        for (expr, alias) in aggregations {
            row.insert(alias.clone(), compute_aggregate(expr, group_rows, params)?);
        }
        result.push(row);
    }
    Ok(result)
}

fn compute_aggregate(expr: &Expr, rows: &[&Row], params: &PropertyMap) -> Result<Value> {
    let eval_ctx = EvalCtx::new(params);
    match expr {
        Expr::FunctionCall { name, args, distinct } => {
            let upper = name.to_uppercase();
            let vals: Vec<Value> = if args.is_empty() {
                Vec::new()
            } else {
                let mut v = Vec::new();
                for row in rows {
                    let val = eval_expr(&args[0], row, &eval_ctx)?;
                    if !val.is_null() {
                        v.push(val);
                    }
                }
                if *distinct {
                    let mut deduped = Vec::new();
                    for val in v {
                        if !deduped.contains(&val) {
                            deduped.push(val);
                        }
                    }
                    deduped
                } else {
                    v
                }
            };

            match upper.as_str() {
                "COUNT" => {
                    if args.is_empty() {
                        Ok(Value::Int(rows.len() as i64))
                    } else {
                        Ok(Value::Int(vals.len() as i64))
                    }
                }
                "SUM" => {
                    let mut sum_i: i64 = 0;
                    let mut sum_f: f64 = 0.0;
                    let mut has_float = false;
                    for val in &vals {
                        match val {
                            Value::Int(i) => sum_i += i,
                            Value::Float(f) => {
                                has_float = true;
                                sum_f += f;
                            }
                            _ => {}
                        }
                    }
                    if has_float {
                        Ok(Value::Float(sum_i as f64 + sum_f))
                    } else {
                        Ok(Value::Int(sum_i))
                    }
                }
                "AVG" => {
                    if vals.is_empty() {
                        return Ok(Value::Null);
                    }
                    let sum: f64 = vals.iter().filter_map(Value::as_float).sum();
                    Ok(Value::Float(sum / vals.len() as f64))
                }
                "MIN" => Ok(vals
                    .into_iter()
                    .reduce(|a, b| {
                        if a.neo4j_cmp(&b) == Some(std::cmp::Ordering::Less) { a } else { b }
                    })
                    .unwrap_or(Value::Null)),
                "MAX" => Ok(vals
                    .into_iter()
                    .reduce(|a, b| {
                        if a.neo4j_cmp(&b) == Some(std::cmp::Ordering::Greater) { a } else { b }
                    })
                    .unwrap_or(Value::Null)),
                "COLLECT" => Ok(Value::List(vals)),
                "STDEV" => {
                    let nums: Vec<f64> = vals.iter().filter_map(Value::as_float).collect();
                    if nums.len() < 2 {
                        return Ok(Value::Float(0.0));
                    }
                    let mean = nums.iter().sum::<f64>() / nums.len() as f64;
                    let variance = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>()
                        / (nums.len() - 1) as f64;
                    Ok(Value::Float(variance.sqrt()))
                }
                _ => Err(Error::ExecutionError(format!("Unknown aggregate: {name}"))),
            }
        }
        // Arithmetic over aggregates, e.g. `1 + count(*)`.
        Expr::BinaryOp { left, op, right } => {
            let lv = compute_aggregate(left, rows, params)?;
            let rv = compute_aggregate(right, rows, params)?;
            eval::eval_binary_op(&lv, *op, &rv)
        }
        other => {
            if let Some(row) = rows.first() {
                eval_expr(other, row, &eval_ctx)
            } else {
                Ok(Value::Null)
            }
        }
    }
}
