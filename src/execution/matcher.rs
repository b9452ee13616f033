//! Pattern matching engine.
//!
//! Binds MATCH/MERGE/EXISTS patterns against the graph, one pattern element
//! at a time. The starting point of each pattern goes through the planner's
//! index selection ([`select_scan`]); expansion follows adjacency.
//! Variable-length hops are a breadth-first walk capped by the configured
//! hard limit; shortestPath / allShortestPaths run a level-order BFS with
//! predecessor tracking.
//!
//! Cypher relationship isomorphism applies: a relationship is traversed at
//! most once per pattern match.

use std::collections::{HashMap, HashSet};

use crate::cypher::ast::{
    Expr, NodePattern, PathFunction, Pattern, PatternDirection, PatternElement, RelPattern,
};
use crate::model::{Direction, Node, NodeId, Path, PropertyMap, Relationship, Value};
use crate::planner::{ScanChoice, select_scan};
use crate::{Error, Result};

use super::eval::{EvalCtx, GraphRef, Row, eval_expr};

pub struct Matcher<'a> {
    graph: GraphRef<'a>,
    params: &'a PropertyMap,
}

/// One in-progress binding of a pattern prefix.
struct Partial {
    row: Row,
    tip: Node,
    path: Path,
    used_rels: HashSet<u64>,
}

impl<'a> Matcher<'a> {
    pub fn new(graph: GraphRef<'a>, params: &'a PropertyMap) -> Self {
        Self { graph, params }
    }

    fn ctx(&self) -> EvalCtx<'a> {
        EvalCtx::with_graph(self.params, self.graph)
    }

    /// Match a list of comma-separated patterns, then apply the WHERE filter.
    /// Range predicates on the first pattern's start node are pushed into a
    /// bounded index scan when an index covers them.
    pub fn match_patterns(
        &self,
        seed: Row,
        patterns: &[Pattern],
        where_clause: Option<&Expr>,
    ) -> Result<Vec<Row>> {
        let mut rows = vec![seed];
        for (i, pattern) in patterns.iter().enumerate() {
            let hint = if i == 0 {
                where_clause.and_then(|w| self.range_hint_for(pattern, w))
            } else {
                None
            };
            let mut next = Vec::new();
            for row in rows {
                next.extend(self.match_pattern_inner(row, pattern, hint.as_ref())?);
            }
            rows = next;
        }
        if let Some(predicate) = where_clause {
            let ctx = self.ctx();
            let mut filtered = Vec::new();
            for row in rows {
                if eval_expr(predicate, &row, &ctx)?.is_truthy() {
                    filtered.push(row);
                }
            }
            rows = filtered;
        }
        Ok(rows)
    }

    pub fn match_pattern(&self, row: Row, pattern: &Pattern) -> Result<Vec<Row>> {
        self.match_pattern_inner(row, pattern, None)
    }

    fn match_pattern_inner(
        &self,
        row: Row,
        pattern: &Pattern,
        hint: Option<&RangeHint>,
    ) -> Result<Vec<Row>> {
        if pattern.path_fn.is_some() {
            return self.match_shortest(row, pattern);
        }

        let PatternElement::Node(first) = &pattern.elements[0] else {
            return Err(Error::SemanticError("pattern must start with a node".into()));
        };

        let track_path = pattern.name.is_some();
        let mut partials = Vec::new();
        for node in self.node_candidates(&row, first, hint)? {
            let mut new_row = row.clone();
            bind_node(&mut new_row, first, &node);
            partials.push(Partial {
                path: Path::single(node.clone()),
                row: new_row,
                tip: node,
                used_rels: HashSet::new(),
            });
        }

        let mut elements = pattern.elements[1..].chunks_exact(2);
        for chunk in &mut elements {
            let (rel_pattern, node_pattern) = match chunk {
                [PatternElement::Relationship(r), PatternElement::Node(n)] => (r, n),
                _ => {
                    return Err(Error::SemanticError(
                        "pattern must alternate nodes and relationships".into(),
                    ));
                }
            };

            let mut next = Vec::new();
            for partial in partials {
                next.extend(self.expand(partial, rel_pattern, node_pattern)?);
            }
            partials = next;
            if partials.is_empty() {
                break;
            }
        }

        Ok(partials
            .into_iter()
            .map(|mut partial| {
                if track_path {
                    if let Some(name) = &pattern.name {
                        partial
                            .row
                            .insert(name.clone(), Value::Path(Box::new(partial.path)));
                    }
                }
                partial.row
            })
            .collect())
    }

    // ========================================================================
    // Expansion
    // ========================================================================

    fn expand(
        &self,
        partial: Partial,
        rel_pattern: &RelPattern,
        node_pattern: &NodePattern,
    ) -> Result<Vec<Partial>> {
        match &rel_pattern.var_length {
            None => self.expand_single(partial, rel_pattern, node_pattern),
            Some(var) => {
                let min = var.min.unwrap_or(1);
                let max = var
                    .max
                    .unwrap_or(self.graph.max_hops)
                    .min(self.graph.max_hops);
                self.expand_var_length(partial, rel_pattern, node_pattern, min, max)
            }
        }
    }

    fn expand_single(
        &self,
        partial: Partial,
        rel_pattern: &RelPattern,
        node_pattern: &NodePattern,
    ) -> Result<Vec<Partial>> {
        let dir = pattern_direction(rel_pattern.direction);
        let rels = self.graph.store.relationships(
            self.graph.tx,
            partial.tip.id,
            dir,
            &rel_pattern.rel_types,
        )?;

        let mut out = Vec::new();
        for rel in rels {
            if partial.used_rels.contains(&rel.id.0) {
                continue;
            }
            if !self.rel_matches(&rel, rel_pattern, &partial.row)? {
                continue;
            }
            let target_id = traversal_target(partial.tip.id, &rel, dir);
            let Some(target) = self.graph.store.get_node(self.graph.tx, target_id)? else {
                continue;
            };
            if !self.node_matches(&target, node_pattern, &partial.row)? {
                continue;
            }

            let mut row = partial.row.clone();
            if let Some(alias) = &rel_pattern.alias {
                if let Some(bound) = row.get(alias) {
                    if !matches!(bound, Value::Relationship(r) if r.id == rel.id) {
                        continue;
                    }
                }
                row.insert(alias.clone(), Value::Relationship(Box::new(rel.clone())));
            }
            bind_node(&mut row, node_pattern, &target);

            let mut path = partial.path.clone();
            path.append(rel.clone(), target.clone());
            let mut used_rels = partial.used_rels.clone();
            used_rels.insert(rel.id.0);

            out.push(Partial { row, tip: target, path, used_rels });
        }
        Ok(out)
    }

    fn expand_var_length(
        &self,
        partial: Partial,
        rel_pattern: &RelPattern,
        node_pattern: &NodePattern,
        min: usize,
        max: usize,
    ) -> Result<Vec<Partial>> {
        let dir = pattern_direction(rel_pattern.direction);
        let mut out = Vec::new();

        // Zero-length hop: the tip itself is the target.
        if min == 0 && self.node_matches(&partial.tip, node_pattern, &partial.row)? {
            let mut row = partial.row.clone();
            if let Some(alias) = &rel_pattern.alias {
                row.insert(alias.clone(), Value::List(Vec::new()));
            }
            bind_node(&mut row, node_pattern, &partial.tip.clone());
            out.push(Partial {
                row,
                tip: partial.tip.clone(),
                path: partial.path.clone(),
                used_rels: partial.used_rels.clone(),
            });
        }

        // BFS over (node, hops-so-far); relationship uniqueness bounds cycles.
        struct Walk {
            tip: Node,
            hops: Vec<(Relationship, Node)>,
            used: HashSet<u64>,
        }
        let mut frontier = vec![Walk {
            tip: partial.tip.clone(),
            hops: Vec::new(),
            used: partial.used_rels.clone(),
        }];

        for depth in 1..=max {
            let mut next = Vec::new();
            for walk in &frontier {
                let rels = self.graph.store.relationships(
                    self.graph.tx,
                    walk.tip.id,
                    dir,
                    &rel_pattern.rel_types,
                )?;
                for rel in rels {
                    if walk.used.contains(&rel.id.0) {
                        continue;
                    }
                    if !self.rel_matches(&rel, rel_pattern, &partial.row)? {
                        continue;
                    }
                    let target_id = traversal_target(walk.tip.id, &rel, dir);
                    let Some(target) = self.graph.store.get_node(self.graph.tx, target_id)?
                    else {
                        continue;
                    };

                    let mut hops = walk.hops.clone();
                    hops.push((rel.clone(), target.clone()));
                    let mut used = walk.used.clone();
                    used.insert(rel.id.0);

                    if depth >= min && self.node_matches(&target, node_pattern, &partial.row)? {
                        let mut row = partial.row.clone();
                        if let Some(alias) = &rel_pattern.alias {
                            row.insert(
                                alias.clone(),
                                Value::List(
                                    hops.iter()
                                        .map(|(r, _)| Value::Relationship(Box::new(r.clone())))
                                        .collect(),
                                ),
                            );
                        }
                        bind_node(&mut row, node_pattern, &target);

                        let mut path = partial.path.clone();
                        for (r, n) in &hops {
                            path.append(r.clone(), n.clone());
                        }
                        out.push(Partial {
                            row,
                            tip: target.clone(),
                            path,
                            used_rels: used.clone(),
                        });
                    }

                    next.push(Walk { tip: target, hops, used });
                }
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        Ok(out)
    }

    // ========================================================================
    // Shortest path
    // ========================================================================

    fn match_shortest(&self, row: Row, pattern: &Pattern) -> Result<Vec<Row>> {
        let all = pattern.path_fn == Some(PathFunction::AllShortestPaths);
        let [
            PatternElement::Node(start_pattern),
            PatternElement::Relationship(rel_pattern),
            PatternElement::Node(end_pattern),
        ] = &pattern.elements[..]
        else {
            return Err(Error::SemanticError(
                "shortestPath takes a single relationship pattern".into(),
            ));
        };

        let dir = pattern_direction(rel_pattern.direction);
        let max = rel_pattern
            .var_length
            .as_ref()
            .and_then(|v| v.max)
            .unwrap_or(self.graph.max_hops)
            .min(self.graph.max_hops);

        let starts = self.node_candidates(&row, start_pattern, None)?;
        let ends = self.node_candidates(&row, end_pattern, None)?;

        let mut out = Vec::new();
        for start in &starts {
            for end in &ends {
                let paths = self.bfs_shortest(
                    start.id,
                    end.id,
                    dir,
                    &rel_pattern.rel_types,
                    max,
                    all,
                )?;
                for rels in paths {
                    let mut path = Path::single(start.clone());
                    let mut tip = start.id;
                    for rel in rels {
                        let next_id = traversal_target(tip, &rel, dir);
                        let node = self.graph.store.require_node(self.graph.tx, next_id)?;
                        tip = next_id;
                        path.append(rel, node);
                    }

                    let mut new_row = row.clone();
                    bind_node(&mut new_row, start_pattern, start);
                    bind_node(&mut new_row, end_pattern, end);
                    if let Some(alias) = &rel_pattern.alias {
                        new_row.insert(
                            alias.clone(),
                            Value::List(
                                path.relationships
                                    .iter()
                                    .map(|r| Value::Relationship(Box::new(r.clone())))
                                    .collect(),
                            ),
                        );
                    }
                    if let Some(name) = &pattern.name {
                        new_row.insert(name.clone(), Value::Path(Box::new(path)));
                    }
                    out.push(new_row);
                }
            }
        }
        Ok(out)
    }

    /// Level-order BFS with predecessor tracking. Returns the relationship
    /// sequences of the shortest path(s); an empty inner vec is the
    /// zero-length path (src == dst).
    fn bfs_shortest(
        &self,
        src: NodeId,
        dst: NodeId,
        dir: Direction,
        rel_types: &[String],
        max: usize,
        all: bool,
    ) -> Result<Vec<Vec<Relationship>>> {
        if src == dst {
            return Ok(vec![Vec::new()]);
        }

        let mut level: HashMap<u64, usize> = HashMap::from([(src.0, 0)]);
        let mut preds: HashMap<u64, Vec<(NodeId, Relationship)>> = HashMap::new();
        let mut frontier = vec![src];
        let mut found_at = None;

        for depth in 1..=max {
            let mut next = Vec::new();
            for &node in &frontier {
                let rels =
                    self.graph
                        .store
                        .relationships(self.graph.tx, node, dir, rel_types)?;
                for rel in rels {
                    let target = traversal_target(node, &rel, dir);
                    match level.get(&target.0) {
                        None => {
                            level.insert(target.0, depth);
                            preds.entry(target.0).or_default().push((node, rel));
                            next.push(target);
                        }
                        // Another shortest route into a node on this level.
                        Some(&l) if l == depth => {
                            preds.entry(target.0).or_default().push((node, rel));
                        }
                        Some(_) => {}
                    }
                    if target == dst {
                        found_at = Some(depth);
                    }
                }
            }
            if found_at.is_some() {
                break;
            }
            frontier = next;
            if frontier.is_empty() {
                break;
            }
        }

        if found_at.is_none() {
            return Ok(Vec::new());
        }

        // Walk predecessors back from the destination.
        let mut paths = Vec::new();
        let mut stack: Vec<(NodeId, Vec<Relationship>)> = vec![(dst, Vec::new())];
        while let Some((node, suffix)) = stack.pop() {
            if node == src {
                let mut path = suffix.clone();
                path.reverse();
                paths.push(path);
                if !all {
                    break;
                }
                continue;
            }
            if let Some(parents) = preds.get(&node.0) {
                for (parent, rel) in parents {
                    // Only follow edges that step exactly one level down.
                    if level.get(&parent.0).copied() == level.get(&node.0).map(|l| l - 1) {
                        let mut next_suffix = suffix.clone();
                        next_suffix.push(rel.clone());
                        stack.push((*parent, next_suffix));
                    }
                }
            }
        }
        Ok(paths)
    }

    // ========================================================================
    // Candidates and predicates
    // ========================================================================

    /// Candidate nodes for a node pattern: the bound variable if there is
    /// one, otherwise the narrowest applicable index scan.
    pub fn node_candidates(
        &self,
        row: &Row,
        pattern: &NodePattern,
        range_hint: Option<&RangeHint>,
    ) -> Result<Vec<Node>> {
        if let Some(alias) = &pattern.alias {
            if let Some(bound) = row.get(alias) {
                return match bound {
                    Value::Node(node) => {
                        if self.node_matches(node, pattern, row)? {
                            Ok(vec![(**node).clone()])
                        } else {
                            Ok(Vec::new())
                        }
                    }
                    Value::Null => Ok(Vec::new()),
                    other => Err(Error::TypeError {
                        expected: "Node".into(),
                        got: other.type_name().into(),
                    }),
                };
            }
        }

        let ctx = self.ctx();
        let mut bound_values: HashMap<&str, Value> = HashMap::new();
        for (key, expr) in &pattern.properties {
            bound_values.insert(key.as_str(), eval_expr(expr, row, &ctx)?);
        }
        let bound_props: HashSet<&str> = bound_values.keys().copied().collect();

        let store = self.graph.store;
        let tx = self.graph.tx;
        let candidates = match select_scan(self.graph.schema, pattern, &bound_props) {
            ScanChoice::UniqueSeek { label, property }
            | ScanChoice::PropertySeek { label, property } => {
                store.nodes_by_property(tx, &label, &property, &bound_values[property.as_str()])?
            }
            ScanChoice::CompositeSeek { label, properties } => {
                let values: Vec<Value> = properties
                    .iter()
                    .map(|p| bound_values[p.as_str()].clone())
                    .collect();
                store.nodes_by_composite(tx, &label, &properties, &values)?
            }
            ScanChoice::LabelScan { label } => match range_hint {
                Some(hint) if self.graph.schema.has_property_index(&label, &hint.property) => {
                    store.nodes_by_property_range(
                        tx,
                        &label,
                        &hint.property,
                        hint.low.as_ref(),
                        hint.high.as_ref(),
                    )?
                }
                _ => store.nodes_by_label(tx, &label)?,
            },
            ScanChoice::AllNodes => store.all_nodes(tx)?,
        };

        let mut matched = Vec::new();
        for node in candidates {
            if self.node_matches(&node, pattern, row)? {
                matched.push(node);
            }
        }
        Ok(matched)
    }

    pub fn node_matches(&self, node: &Node, pattern: &NodePattern, row: &Row) -> Result<bool> {
        if let Some(alias) = &pattern.alias {
            if let Some(Value::Node(bound)) = row.get(alias) {
                if bound.id != node.id {
                    return Ok(false);
                }
            }
        }
        if !pattern.labels.iter().all(|l| node.has_label(l)) {
            return Ok(false);
        }
        let ctx = self.ctx();
        for (key, expr) in &pattern.properties {
            let expected = eval_expr(expr, row, &ctx)?;
            if node.get(key) != Some(&expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn rel_matches(&self, rel: &Relationship, pattern: &RelPattern, row: &Row) -> Result<bool> {
        let ctx = self.ctx();
        for (key, expr) in &pattern.properties {
            let expected = eval_expr(expr, row, &ctx)?;
            if rel.properties.get(key) != Some(&expected) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// A `low < n.key < high` hint extracted from a WHERE clause, pushed into a
/// bounded index scan when one exists.
pub struct RangeHint {
    pub property: String,
    pub low: Option<Value>,
    pub high: Option<Value>,
}

impl<'a> Matcher<'a> {
    /// Extract a range hint for the first node of a pattern from the
    /// top-level AND chain of the WHERE clause. Only bounds that evaluate
    /// without row context (literals and parameters) qualify.
    fn range_hint_for(&self, pattern: &Pattern, where_clause: &Expr) -> Option<RangeHint> {
        let PatternElement::Node(first) = pattern.elements.first()? else {
            return None;
        };
        let alias = first.alias.as_ref()?;
        let mut hint: Option<RangeHint> = None;
        self.collect_bounds(where_clause, alias, &mut hint);
        hint
    }

    fn collect_bounds(&self, expr: &Expr, alias: &str, hint: &mut Option<RangeHint>) {
        use crate::cypher::ast::BinaryOp;
        match expr {
            Expr::BinaryOp { left, op: BinaryOp::And, right } => {
                self.collect_bounds(left, alias, hint);
                self.collect_bounds(right, alias, hint);
            }
            Expr::BinaryOp { left, op, right }
                if matches!(
                    op,
                    BinaryOp::Lt | BinaryOp::Lte | BinaryOp::Gt | BinaryOp::Gte
                ) =>
            {
                // `alias.key <op> bound` or the mirrored form.
                let (key, bound_expr, lower) = match (left.as_ref(), right.as_ref()) {
                    (Expr::Property { expr, key }, bound)
                        if matches!(expr.as_ref(), Expr::Variable(v) if v == alias) =>
                    {
                        (key, bound, matches!(op, BinaryOp::Gt | BinaryOp::Gte))
                    }
                    (bound, Expr::Property { expr, key })
                        if matches!(expr.as_ref(), Expr::Variable(v) if v == alias) =>
                    {
                        (key, bound, matches!(op, BinaryOp::Lt | BinaryOp::Lte))
                    }
                    _ => return,
                };
                let ctx = EvalCtx::new(self.params);
                let Ok(value) = eval_expr(bound_expr, &Row::new(), &ctx) else {
                    return;
                };
                let entry = hint.get_or_insert_with(|| RangeHint {
                    property: key.clone(),
                    low: None,
                    high: None,
                });
                if entry.property != *key {
                    return; // one property per hint
                }
                if lower {
                    entry.low = Some(value);
                } else {
                    entry.high = Some(value);
                }
            }
            _ => {}
        }
    }
}

fn pattern_direction(direction: PatternDirection) -> Direction {
    match direction {
        PatternDirection::Right => Direction::Outgoing,
        PatternDirection::Left => Direction::Incoming,
        PatternDirection::Both => Direction::Both,
    }
}

/// The far end of a relationship given the traversal direction from `from`.
fn traversal_target(from: NodeId, rel: &Relationship, dir: Direction) -> NodeId {
    match dir {
        Direction::Outgoing => rel.dst,
        Direction::Incoming => rel.src,
        Direction::Both => rel.other_node(from).unwrap_or(rel.dst),
    }
}

fn bind_node(row: &mut Row, pattern: &NodePattern, node: &Node) {
    if let Some(alias) = &pattern.alias {
        row.insert(alias.clone(), Value::Node(Box::new(node.clone())));
    }
}
