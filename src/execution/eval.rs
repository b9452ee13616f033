//! Expression evaluation.
//!
//! Expressions evaluate against a row of bound variables plus the statement
//! parameters. Three-valued logic follows Cypher: comparisons against NULL
//! yield NULL, and NULL is falsy in filter position.

use std::collections::HashMap;

use crate::cypher::ast::{BinaryOp, Expr, Literal, StringOp, UnaryOp};
use crate::model::{PropertyMap, Value};
use crate::storage::RecordStore;
use crate::storage::schema::Schema;
use crate::tx::TxState;
use crate::{Error, Result};

use super::functions;
use super::matcher::Matcher;

/// A row of bound variables.
pub type Row = HashMap<String, Value>;

/// Read access to the graph for sub-pattern predicates (EXISTS).
#[derive(Clone, Copy)]
pub struct GraphRef<'a> {
    pub store: &'a RecordStore,
    pub tx: &'a TxState,
    pub schema: &'a Schema,
    pub max_hops: usize,
}

/// Evaluation context: parameters plus (optionally) graph access.
#[derive(Clone, Copy)]
pub struct EvalCtx<'a> {
    pub params: &'a PropertyMap,
    pub graph: Option<GraphRef<'a>>,
}

impl<'a> EvalCtx<'a> {
    pub fn new(params: &'a PropertyMap) -> Self {
        Self { params, graph: None }
    }

    pub fn with_graph(params: &'a PropertyMap, graph: GraphRef<'a>) -> Self {
        Self { params, graph: Some(graph) }
    }
}

/// Evaluate a Cypher expression against a row of bound variables.
pub fn eval_expr(expr: &Expr, row: &Row, ctx: &EvalCtx) -> Result<Value> {
    match expr {
        Expr::Literal(lit) => Ok(match lit {
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Int(i) => Value::Int(*i),
            Literal::Float(f) => Value::Float(*f),
            Literal::String(s) => Value::String(s.clone()),
        }),

        Expr::Variable(name) => row
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SemanticError(format!("Unbound variable: {name}"))),

        Expr::Parameter(name) => ctx
            .params
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SemanticError(format!("Missing parameter: ${name}"))),

        Expr::Property { expr: inner, key } => {
            let val = eval_expr(inner, row, ctx)?;
            match val {
                Value::Node(n) => Ok(n.get(key).cloned().unwrap_or(Value::Null)),
                Value::Relationship(r) => {
                    Ok(r.properties.get(key).cloned().unwrap_or(Value::Null))
                }
                Value::Map(m) => Ok(m.get(key).cloned().unwrap_or(Value::Null)),
                Value::Null => Ok(Value::Null),
                _ => Err(Error::TypeError {
                    expected: "Node, Relationship, or Map".into(),
                    got: val.type_name().into(),
                }),
            }
        }

        Expr::FunctionCall { name, args, distinct: _ } => {
            functions::eval_function(name, args, row, ctx)
        }

        Expr::BinaryOp { left, op, right } => {
            let lv = eval_expr(left, row, ctx)?;
            // Short-circuit for AND/OR
            match op {
                BinaryOp::And => {
                    if lv.is_null() {
                        // NULL AND false is false; anything else is NULL.
                        let rv = eval_expr(right, row, ctx)?;
                        return Ok(if !rv.is_null() && !rv.is_truthy() {
                            Value::Bool(false)
                        } else {
                            Value::Null
                        });
                    }
                    if !lv.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    let rv = eval_expr(right, row, ctx)?;
                    return Ok(if rv.is_null() { Value::Null } else { Value::Bool(rv.is_truthy()) });
                }
                BinaryOp::Or => {
                    if lv.is_null() {
                        let rv = eval_expr(right, row, ctx)?;
                        return Ok(if !rv.is_null() && rv.is_truthy() {
                            Value::Bool(true)
                        } else {
                            Value::Null
                        });
                    }
                    if lv.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    let rv = eval_expr(right, row, ctx)?;
                    return Ok(if rv.is_null() { Value::Null } else { Value::Bool(rv.is_truthy()) });
                }
                _ => {}
            }
            let rv = eval_expr(right, row, ctx)?;
            eval_binary_op(&lv, *op, &rv)
        }

        Expr::UnaryOp { op, expr: inner } => {
            let val = eval_expr(inner, row, ctx)?;
            match op {
                UnaryOp::Not => match val {
                    Value::Null => Ok(Value::Null),
                    other => Ok(Value::Bool(!other.is_truthy())),
                },
                UnaryOp::Negate => match val {
                    Value::Int(i) => Ok(Value::Int(-i)),
                    Value::Float(f) => Ok(Value::Float(-f)),
                    Value::Null => Ok(Value::Null),
                    other => Err(Error::TypeError {
                        expected: "Numeric".into(),
                        got: other.type_name().into(),
                    }),
                },
            }
        }

        Expr::List(items) => {
            let vals: Vec<Value> = items
                .iter()
                .map(|e| eval_expr(e, row, ctx))
                .collect::<Result<_>>()?;
            Ok(Value::List(vals))
        }

        Expr::MapLiteral(entries) => {
            let mut map = HashMap::new();
            for (k, v) in entries {
                map.insert(k.clone(), eval_expr(v, row, ctx)?);
            }
            Ok(Value::Map(map))
        }

        Expr::Index { expr: inner, index } => {
            let target = eval_expr(inner, row, ctx)?;
            let idx = eval_expr(index, row, ctx)?;
            match (target, idx) {
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (Value::List(items), Value::Int(i)) => {
                    let len = items.len() as i64;
                    let i = if i < 0 { i + len } else { i };
                    if i < 0 || i >= len {
                        Ok(Value::Null)
                    } else {
                        Ok(items.into_iter().nth(i as usize).unwrap_or(Value::Null))
                    }
                }
                (Value::Map(m), Value::String(k)) => {
                    Ok(m.get(&k).cloned().unwrap_or(Value::Null))
                }
                (target, idx) => Err(Error::TypeError {
                    expected: "List[Int] or Map[String]".into(),
                    got: format!("{}[{}]", target.type_name(), idx.type_name()),
                }),
            }
        }

        Expr::IsNull { expr: inner, negated } => {
            let val = eval_expr(inner, row, ctx)?;
            let is_null = val.is_null();
            Ok(Value::Bool(if *negated { !is_null } else { is_null }))
        }

        Expr::In { expr: item, list } => {
            let item_val = eval_expr(item, row, ctx)?;
            let list_val = eval_expr(list, row, ctx)?;
            match list_val {
                Value::Null => Ok(Value::Null),
                Value::List(items) => {
                    if item_val.is_null() {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::Bool(items.iter().any(|v| *v == item_val)))
                    }
                }
                other => Err(Error::TypeError {
                    expected: "List".into(),
                    got: other.type_name().into(),
                }),
            }
        }

        Expr::HasLabel { expr: inner, label } => {
            let val = eval_expr(inner, row, ctx)?;
            match val {
                Value::Node(n) => Ok(Value::Bool(n.has_label(label))),
                Value::Null => Ok(Value::Null),
                other => Err(Error::TypeError {
                    expected: "Node".into(),
                    got: other.type_name().into(),
                }),
            }
        }

        Expr::StringOp { left, op, right } => {
            let lv = eval_expr(left, row, ctx)?;
            let rv = eval_expr(right, row, ctx)?;
            match (&lv, &rv) {
                (Value::String(a), Value::String(b)) => {
                    let result = match op {
                        StringOp::StartsWith => a.starts_with(b.as_str()),
                        StringOp::EndsWith => a.ends_with(b.as_str()),
                        StringOp::Contains => a.contains(b.as_str()),
                    };
                    Ok(Value::Bool(result))
                }
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                _ => Err(Error::TypeError {
                    expected: "String".into(),
                    got: format!("{}, {}", lv.type_name(), rv.type_name()),
                }),
            }
        }

        Expr::Exists { patterns, where_clause } => {
            let Some(graph) = &ctx.graph else {
                return Err(Error::ExecutionError(
                    "EXISTS pattern outside query context".into(),
                ));
            };
            let matcher = Matcher::new(*graph, ctx.params);
            let rows = matcher.match_patterns(
                row.clone(),
                patterns,
                where_clause.as_deref(),
            )?;
            Ok(Value::Bool(!rows.is_empty()))
        }

        Expr::Case { operand, whens, else_expr } => {
            if let Some(op) = operand {
                let op_val = eval_expr(op, row, ctx)?;
                for (when_expr, then_expr) in whens {
                    let when_val = eval_expr(when_expr, row, ctx)?;
                    if op_val == when_val {
                        return eval_expr(then_expr, row, ctx);
                    }
                }
            } else {
                for (when_expr, then_expr) in whens {
                    let when_val = eval_expr(when_expr, row, ctx)?;
                    if when_val.is_truthy() {
                        return eval_expr(then_expr, row, ctx);
                    }
                }
            }
            if let Some(else_e) = else_expr {
                eval_expr(else_e, row, ctx)
            } else {
                Ok(Value::Null)
            }
        }

        // RETURN * is expanded at the projection operator.
        Expr::Star => Ok(Value::Null),
    }
}

// ============================================================================
// Binary operator evaluation
// ============================================================================

pub fn eval_binary_op(left: &Value, op: BinaryOp, right: &Value) -> Result<Value> {
    // NULL propagates through every binary operator.
    if left.is_null() || right.is_null() {
        return Ok(Value::Null);
    }

    match op {
        BinaryOp::Eq => Ok(Value::Bool(left == right)),
        BinaryOp::Neq => Ok(Value::Bool(left != right)),
        BinaryOp::Lt => Ok(cmp_result(left, right, |o| o == std::cmp::Ordering::Less)),
        BinaryOp::Lte => Ok(cmp_result(left, right, |o| o != std::cmp::Ordering::Greater)),
        BinaryOp::Gt => Ok(cmp_result(left, right, |o| o == std::cmp::Ordering::Greater)),
        BinaryOp::Gte => Ok(cmp_result(left, right, |o| o != std::cmp::Ordering::Less)),

        BinaryOp::Add => eval_add(left, right),
        BinaryOp::Sub => eval_arith(left, right, i64::wrapping_sub, |a, b| a - b),
        BinaryOp::Mul => eval_arith(left, right, i64::wrapping_mul, |a, b| a * b),
        BinaryOp::Div => match right {
            Value::Int(0) => Err(Error::ExecutionError("Division by zero".into())),
            Value::Float(f) if *f == 0.0 => {
                Err(Error::ExecutionError("Division by zero".into()))
            }
            _ => eval_arith(left, right, i64::wrapping_div, |a, b| a / b),
        },
        BinaryOp::Mod => match right {
            Value::Int(0) => Err(Error::ExecutionError("Division by zero".into())),
            _ => eval_arith(left, right, i64::wrapping_rem, |a, b| a % b),
        },
        BinaryOp::Pow => {
            let l = left.as_float().ok_or_else(|| Error::TypeError {
                expected: "Numeric".into(),
                got: left.type_name().into(),
            })?;
            let r = right.as_float().ok_or_else(|| Error::TypeError {
                expected: "Numeric".into(),
                got: right.type_name().into(),
            })?;
            Ok(Value::Float(l.powf(r)))
        }

        // Non-short-circuit path; NULLs already handled above.
        BinaryOp::And => Ok(Value::Bool(left.is_truthy() && right.is_truthy())),
        BinaryOp::Or => Ok(Value::Bool(left.is_truthy() || right.is_truthy())),
        BinaryOp::Xor => Ok(Value::Bool(left.is_truthy() ^ right.is_truthy())),

        BinaryOp::RegexMatch => match (left, right) {
            (Value::String(s), Value::String(pattern)) => {
                Ok(Value::Bool(regex_lite_match(s, pattern)))
            }
            _ => Err(Error::TypeError {
                expected: "String".into(),
                got: format!("{}, {}", left.type_name(), right.type_name()),
            }),
        },
    }
}

fn cmp_result(left: &Value, right: &Value, test: impl Fn(std::cmp::Ordering) -> bool) -> Value {
    match left.neo4j_cmp(right) {
        Some(ord) => Value::Bool(test(ord)),
        None => Value::Null,
    }
}

fn eval_add(left: &Value, right: &Value) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(a.wrapping_add(*b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(a + b)),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(*a as f64 + b)),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(a + *b as f64)),
        (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
        (Value::String(a), b) if b.is_numeric() => Ok(Value::String(format!("{a}{b}"))),
        (a, Value::String(b)) if a.is_numeric() => Ok(Value::String(format!("{a}{b}"))),
        (Value::List(a), Value::List(b)) => {
            let mut result = a.clone();
            result.extend(b.clone());
            Ok(Value::List(result))
        }
        (Value::List(a), b) => {
            let mut result = a.clone();
            result.push(b.clone());
            Ok(Value::List(result))
        }
        _ => Err(Error::TypeError {
            expected: "compatible types for +".into(),
            got: format!("{}, {}", left.type_name(), right.type_name()),
        }),
    }
}

fn eval_arith(
    left: &Value,
    right: &Value,
    int_op: fn(i64, i64) -> i64,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value> {
    match (left, right) {
        (Value::Int(a), Value::Int(b)) => Ok(Value::Int(int_op(*a, *b))),
        (Value::Float(a), Value::Float(b)) => Ok(Value::Float(float_op(*a, *b))),
        (Value::Int(a), Value::Float(b)) => Ok(Value::Float(float_op(*a as f64, *b))),
        (Value::Float(a), Value::Int(b)) => Ok(Value::Float(float_op(*a, *b as f64))),
        _ => Err(Error::TypeError {
            expected: "Numeric".into(),
            got: format!("{}, {}", left.type_name(), right.type_name()),
        }),
    }
}

/// Minimal regex support for `=~`: `.*` wildcards, `(?i)` prefix for
/// case-insensitive, otherwise literal match. Covers the patterns the query
/// surface actually sees without pulling in a regex engine.
fn regex_lite_match(s: &str, pattern: &str) -> bool {
    let (pattern, insensitive) = match pattern.strip_prefix("(?i)") {
        Some(rest) => (rest, true),
        None => (pattern, false),
    };
    let (s, pattern) = if insensitive {
        (s.to_lowercase(), pattern.to_lowercase())
    } else {
        (s.to_owned(), pattern.to_owned())
    };

    let parts: Vec<&str> = pattern.split(".*").collect();
    if parts.len() == 1 {
        return s == pattern;
    }
    let mut remainder = s.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match remainder.find(part) {
            Some(pos) => {
                if i == 0 && pos != 0 {
                    return false;
                }
                remainder = &remainder[pos + part.len()..];
            }
            None => return false,
        }
    }
    parts.last().is_none_or(|last| last.is_empty() || remainder.is_empty())
}
