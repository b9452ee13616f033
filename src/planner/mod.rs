//! Query planner — folds the clause sequence into a logical operator
//! pipeline and picks scan strategies.
//!
//! The plan tree is interpreted by the execution module. Pattern matching
//! stays AST-shaped inside the `Match`/`Merge` operators; the planner's other
//! job — choosing the narrowest index for a pattern's starting point — is
//! exposed as [`select_scan`] and consulted by the pattern matcher per
//! pattern.

use std::collections::HashSet;

use crate::cypher::ast::{
    Clause, Expr, NodePattern, Pattern, Projection, Query, RemoveItem, SetItem, ShowTarget,
    Statement, YieldItem,
};
use crate::storage::schema::Schema;
use crate::{Error, Result};

/// Logical plan node. Operators own their input: the tree is a pipeline.
#[derive(Debug, Clone)]
pub enum LogicalPlan {
    /// Produce one empty row (seed for pipelines).
    Argument,
    /// Bind pattern variables for each input row. Left-outer when `optional`.
    Match {
        input: Box<LogicalPlan>,
        patterns: Vec<Pattern>,
        optional: bool,
        where_clause: Option<Expr>,
    },
    Unwind {
        input: Box<LogicalPlan>,
        expr: Expr,
        alias: String,
    },
    Create {
        input: Box<LogicalPlan>,
        patterns: Vec<Pattern>,
    },
    Merge {
        input: Box<LogicalPlan>,
        pattern: Pattern,
        on_create: Vec<SetItem>,
        on_match: Vec<SetItem>,
    },
    SetItems {
        input: Box<LogicalPlan>,
        items: Vec<SetItem>,
    },
    RemoveItems {
        input: Box<LogicalPlan>,
        items: Vec<RemoveItem>,
    },
    Delete {
        input: Box<LogicalPlan>,
        variables: Vec<String>,
        detach: bool,
    },
    CallProcedure {
        input: Box<LogicalPlan>,
        name: String,
        args: Vec<Expr>,
        yields: Vec<YieldItem>,
        where_clause: Option<Expr>,
    },
    /// Plain projection (no aggregates).
    Project {
        input: Box<LogicalPlan>,
        items: Vec<(Expr, String)>,
    },
    /// Projection with at least one aggregate: groups by the non-aggregate
    /// columns.
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<(Expr, String)>,
        aggregations: Vec<(Expr, String)>,
    },
    Filter {
        input: Box<LogicalPlan>,
        predicate: Expr,
    },
    Distinct {
        input: Box<LogicalPlan>,
    },
    Sort {
        input: Box<LogicalPlan>,
        keys: Vec<(Expr, bool)>,
    },
    Skip {
        input: Box<LogicalPlan>,
        count: Expr,
    },
    Limit {
        input: Box<LogicalPlan>,
        count: Expr,
    },
    Union {
        branches: Vec<LogicalPlan>,
        all: bool,
    },
    ShowIndexes,
    ShowConstraints,
}

/// Create a logical plan from a parsed statement.
pub fn plan(statement: &Statement) -> Result<LogicalPlan> {
    match statement {
        Statement::Query(query) => plan_query(query),
        Statement::Union { branches, all } => {
            let planned: Vec<LogicalPlan> =
                branches.iter().map(plan_query).collect::<Result<_>>()?;
            Ok(LogicalPlan::Union { branches: planned, all: *all })
        }
        Statement::Show(ShowTarget::Indexes) => Ok(LogicalPlan::ShowIndexes),
        Statement::Show(ShowTarget::Constraints) => Ok(LogicalPlan::ShowConstraints),
        Statement::Schema(_) => Err(Error::PlanError(
            "schema commands are executed directly, not planned".into(),
        )),
        Statement::Explain(_) => Err(Error::PlanError(
            "EXPLAIN is unwrapped before planning".into(),
        )),
    }
}

fn plan_query(query: &Query) -> Result<LogicalPlan> {
    let mut plan = LogicalPlan::Argument;

    for clause in &query.clauses {
        plan = match clause {
            Clause::Match { optional, patterns, where_clause } => LogicalPlan::Match {
                input: Box::new(plan),
                patterns: patterns.clone(),
                optional: *optional,
                where_clause: where_clause.clone(),
            },
            Clause::Unwind { expr, alias } => LogicalPlan::Unwind {
                input: Box::new(plan),
                expr: expr.clone(),
                alias: alias.clone(),
            },
            Clause::Create { patterns } => LogicalPlan::Create {
                input: Box::new(plan),
                patterns: patterns.clone(),
            },
            Clause::Merge { pattern, on_create, on_match } => LogicalPlan::Merge {
                input: Box::new(plan),
                pattern: pattern.clone(),
                on_create: on_create.clone(),
                on_match: on_match.clone(),
            },
            Clause::Set { items } => LogicalPlan::SetItems {
                input: Box::new(plan),
                items: items.clone(),
            },
            Clause::Remove { items } => LogicalPlan::RemoveItems {
                input: Box::new(plan),
                items: items.clone(),
            },
            Clause::Delete { variables, detach } => LogicalPlan::Delete {
                input: Box::new(plan),
                variables: variables.clone(),
                detach: *detach,
            },
            Clause::Call { procedure, args, yields, where_clause } => {
                LogicalPlan::CallProcedure {
                    input: Box::new(plan),
                    name: procedure.clone(),
                    args: args.clone(),
                    yields: yields.clone(),
                    where_clause: where_clause.clone(),
                }
            }
            Clause::With(projection) | Clause::Return(projection) => {
                plan_projection(plan, projection)?
            }
        };
    }

    Ok(plan)
}

/// WITH / RETURN: aggregation barrier + ordering + paging + optional filter.
fn plan_projection(input: LogicalPlan, projection: &Projection) -> Result<LogicalPlan> {
    let mut items: Vec<(Expr, String)> = Vec::new();
    for item in &projection.items {
        let alias = item
            .alias
            .clone()
            .unwrap_or_else(|| render_expr_name(&item.expr));
        items.push((item.expr.clone(), alias));
    }

    let has_aggregate = items.iter().any(|(expr, _)| contains_aggregate(expr));
    let mut plan = if has_aggregate {
        let (aggregations, group_by): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|(expr, _)| contains_aggregate(expr));
        LogicalPlan::Aggregate {
            input: Box::new(input),
            group_by,
            aggregations,
        }
    } else {
        LogicalPlan::Project {
            input: Box::new(input),
            items,
        }
    };

    if let Some(predicate) = &projection.where_clause {
        plan = LogicalPlan::Filter {
            input: Box::new(plan),
            predicate: predicate.clone(),
        };
    }
    if projection.distinct {
        plan = LogicalPlan::Distinct { input: Box::new(plan) };
    }
    if let Some(order_by) = &projection.order_by {
        plan = LogicalPlan::Sort {
            input: Box::new(plan),
            keys: order_by
                .iter()
                .map(|o| (o.expr.clone(), o.ascending))
                .collect(),
        };
    }
    if let Some(skip) = &projection.skip {
        plan = LogicalPlan::Skip { input: Box::new(plan), count: skip.clone() };
    }
    if let Some(limit) = &projection.limit {
        plan = LogicalPlan::Limit { input: Box::new(plan), count: limit.clone() };
    }
    Ok(plan)
}

/// Column name for an unaliased projection item, rendered like the source.
pub fn render_expr_name(expr: &Expr) -> String {
    match expr {
        Expr::Variable(name) => name.clone(),
        Expr::Property { expr, key } => format!("{}.{key}", render_expr_name(expr)),
        Expr::Parameter(name) => format!("${name}"),
        Expr::FunctionCall { name, args, .. } => {
            let rendered: Vec<String> = args.iter().map(render_expr_name).collect();
            format!("{name}({})", rendered.join(", "))
        }
        Expr::Literal(lit) => format!("{lit:?}"),
        Expr::Star => "*".into(),
        _ => "expression".into(),
    }
}

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max", "collect", "stdev"];

/// Does the expression contain an aggregate call anywhere?
pub fn contains_aggregate(expr: &Expr) -> bool {
    match expr {
        Expr::FunctionCall { name, args, .. } => {
            AGGREGATE_FUNCTIONS.contains(&name.to_lowercase().as_str())
                || args.iter().any(contains_aggregate)
        }
        Expr::BinaryOp { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        Expr::UnaryOp { expr, .. } => contains_aggregate(expr),
        Expr::Property { expr, .. } => contains_aggregate(expr),
        Expr::List(items) => items.iter().any(contains_aggregate),
        Expr::MapLiteral(entries) => entries.values().any(contains_aggregate),
        Expr::Index { expr, index } => contains_aggregate(expr) || contains_aggregate(index),
        Expr::Case { operand, whens, else_expr } => {
            operand.as_deref().is_some_and(contains_aggregate)
                || whens
                    .iter()
                    .any(|(w, t)| contains_aggregate(w) || contains_aggregate(t))
                || else_expr.as_deref().is_some_and(contains_aggregate)
        }
        Expr::In { expr, list } => contains_aggregate(expr) || contains_aggregate(list),
        Expr::IsNull { expr, .. } => contains_aggregate(expr),
        Expr::HasLabel { expr, .. } => contains_aggregate(expr),
        Expr::StringOp { left, right, .. } => {
            contains_aggregate(left) || contains_aggregate(right)
        }
        _ => false,
    }
}

// ============================================================================
// Scan selection
// ============================================================================

/// How the matcher should fetch candidates for a pattern's starting node.
/// Ordered by selectivity: unique equality beats composite, beats property
/// equality, beats label scan, beats a full scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanChoice {
    UniqueSeek { label: String, property: String },
    CompositeSeek { label: String, properties: Vec<String> },
    PropertySeek { label: String, property: String },
    LabelScan { label: String },
    AllNodes,
}

/// Pick the narrowest applicable index for a node pattern whose property
/// equalities are `bound_props`.
pub fn select_scan(schema: &Schema, node: &NodePattern, bound_props: &HashSet<&str>) -> ScanChoice {
    for label in &node.labels {
        for prop in bound_props {
            if schema.has_constraint(label, prop) {
                return ScanChoice::UniqueSeek {
                    label: label.clone(),
                    property: (*prop).to_owned(),
                };
            }
        }
        if let Some(def) = schema.matching_composite(label, bound_props) {
            return ScanChoice::CompositeSeek {
                label: label.clone(),
                properties: def.properties.clone(),
            };
        }
        for prop in bound_props {
            if schema.has_property_index(label, prop) {
                return ScanChoice::PropertySeek {
                    label: label.clone(),
                    property: (*prop).to_owned(),
                };
            }
        }
    }
    if let Some(label) = node.labels.first() {
        return ScanChoice::LabelScan { label: label.clone() };
    }
    ScanChoice::AllNodes
}

/// Render a plan tree for EXPLAIN output.
pub fn render_plan(plan: &LogicalPlan, depth: usize) -> Vec<String> {
    let indent = "  ".repeat(depth);
    let mut lines = Vec::new();
    let (label, children): (String, Vec<&LogicalPlan>) = match plan {
        LogicalPlan::Argument => ("Argument".into(), vec![]),
        LogicalPlan::Match { input, patterns, optional, .. } => (
            format!(
                "{}Match(patterns: {})",
                if *optional { "Optional" } else { "" },
                patterns.len()
            ),
            vec![input],
        ),
        LogicalPlan::Unwind { input, alias, .. } => (format!("Unwind({alias})"), vec![input]),
        LogicalPlan::Create { input, patterns } => {
            (format!("Create(patterns: {})", patterns.len()), vec![input])
        }
        LogicalPlan::Merge { input, .. } => ("Merge".into(), vec![input]),
        LogicalPlan::SetItems { input, items } => {
            (format!("Set(items: {})", items.len()), vec![input])
        }
        LogicalPlan::RemoveItems { input, items } => {
            (format!("Remove(items: {})", items.len()), vec![input])
        }
        LogicalPlan::Delete { input, detach, .. } => (
            if *detach { "DetachDelete".into() } else { "Delete".into() },
            vec![input],
        ),
        LogicalPlan::CallProcedure { input, name, .. } => {
            (format!("CallProcedure({name})"), vec![input])
        }
        LogicalPlan::Project { input, items } => {
            let cols: Vec<&str> = items.iter().map(|(_, a)| a.as_str()).collect();
            (format!("Project({})", cols.join(", ")), vec![input])
        }
        LogicalPlan::Aggregate { input, group_by, aggregations } => (
            format!(
                "Aggregate(group: {}, aggregates: {})",
                group_by.len(),
                aggregations.len()
            ),
            vec![input],
        ),
        LogicalPlan::Filter { input, .. } => ("Filter".into(), vec![input]),
        LogicalPlan::Distinct { input } => ("Distinct".into(), vec![input]),
        LogicalPlan::Sort { input, keys } => {
            (format!("Sort(keys: {})", keys.len()), vec![input])
        }
        LogicalPlan::Skip { input, .. } => ("Skip".into(), vec![input]),
        LogicalPlan::Limit { input, .. } => ("Limit".into(), vec![input]),
        LogicalPlan::Union { branches, all } => (
            format!("Union{}", if *all { "All" } else { "" }),
            branches.iter().collect(),
        ),
        LogicalPlan::ShowIndexes => ("ShowIndexes".into(), vec![]),
        LogicalPlan::ShowConstraints => ("ShowConstraints".into(), vec![]),
    };
    lines.push(format!("{indent}{label}"));
    for child in children {
        lines.extend(render_plan(child, depth + 1));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypher;
    use crate::storage::schema::IndexDef;

    fn plan_str(query: &str) -> LogicalPlan {
        plan(&cypher::parse(query).unwrap()).unwrap()
    }

    #[test]
    fn test_projection_without_aggregates() {
        let p = plan_str("MATCH (n:Person) RETURN n.name");
        assert!(matches!(p, LogicalPlan::Project { .. }));
    }

    #[test]
    fn test_aggregation_barrier_splits_columns() {
        let p = plan_str("MATCH (n:Person) RETURN n.city, count(n)");
        match p {
            LogicalPlan::Aggregate { group_by, aggregations, .. } => {
                assert_eq!(group_by.len(), 1);
                assert_eq!(aggregations.len(), 1);
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn test_order_skip_limit_nesting() {
        let p = plan_str("MATCH (n) RETURN n ORDER BY n.age SKIP 1 LIMIT 2");
        // Limit is outermost, then Skip, then Sort.
        match p {
            LogicalPlan::Limit { input, .. } => match *input {
                LogicalPlan::Skip { input, .. } => {
                    assert!(matches!(*input, LogicalPlan::Sort { .. }));
                }
                other => panic!("expected skip, got {other:?}"),
            },
            other => panic!("expected limit, got {other:?}"),
        }
    }

    #[test]
    fn test_select_scan_prefers_unique() {
        let mut schema = Schema::default();
        schema.constraints.insert(("User".into(), "email".into()));
        schema.insert_index(IndexDef {
            label: "User".into(),
            properties: vec!["email".into()],
        });

        let node = NodePattern {
            alias: Some("u".into()),
            labels: vec!["User".into()],
            properties: Default::default(),
        };
        let bound: HashSet<&str> = ["email"].into();
        assert_eq!(
            select_scan(&schema, &node, &bound),
            ScanChoice::UniqueSeek { label: "User".into(), property: "email".into() }
        );
    }

    #[test]
    fn test_select_scan_falls_back_to_label() {
        let schema = Schema::default();
        let node = NodePattern {
            alias: None,
            labels: vec!["Person".into()],
            properties: Default::default(),
        };
        assert_eq!(
            select_scan(&schema, &node, &HashSet::new()),
            ScanChoice::LabelScan { label: "Person".into() }
        );
    }

    #[test]
    fn test_select_scan_all_nodes() {
        let schema = Schema::default();
        let node = NodePattern::default();
        assert_eq!(select_scan(&schema, &node, &HashSet::new()), ScanChoice::AllNodes);
    }

    #[test]
    fn test_contains_aggregate_nested() {
        let stmt = cypher::parse("RETURN 1 + count(*) AS total").unwrap();
        match plan(&stmt).unwrap() {
            LogicalPlan::Aggregate { aggregations, .. } => {
                assert_eq!(aggregations[0].1, "total");
            }
            other => panic!("expected aggregate, got {other:?}"),
        }
    }
}
