//! Built-in scalar function library.
//!
//! Case-insensitive lookup, Cypher NULL conventions: most functions map NULL
//! input to NULL output rather than erroring.

use chrono::Utc;

use crate::cypher::ast::Expr;
use crate::model::Value;
use crate::{Error, Result};

use super::eval::{EvalCtx, Row, eval_expr};

pub fn eval_function(name: &str, args: &[Expr], row: &Row, ctx: &EvalCtx) -> Result<Value> {
    let lower = name.to_lowercase();

    // Aggregates reaching scalar evaluation (e.g. inside a later filter) just
    // evaluate their argument; real aggregation happens at the barrier.
    if matches!(lower.as_str(), "count" | "sum" | "avg" | "min" | "max" | "collect" | "stdev") {
        return if args.is_empty() {
            Ok(Value::Int(1))
        } else {
            eval_expr(&args[0], row, ctx)
        };
    }

    // Nullary functions first.
    match lower.as_str() {
        "pi" => return Ok(Value::Float(std::f64::consts::PI)),
        "e" => return Ok(Value::Float(std::f64::consts::E)),
        "rand" => return Ok(Value::Float(rand::random::<f64>())),
        "randomuuid" => return Ok(Value::String(uuid::Uuid::new_v4().to_string())),
        "timestamp" => return Ok(Value::Int(Utc::now().timestamp_millis())),
        "date" if args.is_empty() => {
            return Ok(Value::String(Utc::now().format("%Y-%m-%d").to_string()));
        }
        "datetime" if args.is_empty() => {
            return Ok(Value::String(Utc::now().to_rfc3339()));
        }
        "time" if args.is_empty() => {
            return Ok(Value::String(Utc::now().format("%H:%M:%S%.3f").to_string()));
        }
        _ => {}
    }

    let arg = |i: usize| -> Result<Value> {
        args.get(i)
            .map(|e| eval_expr(e, row, ctx))
            .transpose()?
            .ok_or_else(|| {
                Error::SemanticError(format!("{name}() is missing argument {}", i + 1))
            })
    };

    match lower.as_str() {
        // ====================================================================
        // Entity accessors
        // ====================================================================
        "id" => match arg(0)? {
            Value::Node(n) => Ok(Value::Int(n.id.0 as i64)),
            Value::Relationship(r) => Ok(Value::Int(r.id.0 as i64)),
            Value::Null => Ok(Value::Null),
            other => type_err("Node or Relationship", &other),
        },
        "elementid" => match arg(0)? {
            Value::Node(n) => Ok(Value::String(n.element_id())),
            Value::Relationship(r) => Ok(Value::String(r.element_id())),
            Value::Null => Ok(Value::Null),
            other => type_err("Node or Relationship", &other),
        },
        "labels" => match arg(0)? {
            Value::Node(n) => Ok(Value::List(
                n.labels.iter().map(|l| Value::String(l.clone())).collect(),
            )),
            Value::Null => Ok(Value::Null),
            other => type_err("Node", &other),
        },
        "type" => match arg(0)? {
            Value::Relationship(r) => Ok(Value::String(r.rel_type.clone())),
            Value::Null => Ok(Value::Null),
            other => type_err("Relationship", &other),
        },
        "properties" => match arg(0)? {
            Value::Node(n) => Ok(Value::Map(n.properties.clone())),
            Value::Relationship(r) => Ok(Value::Map(r.properties.clone())),
            Value::Map(m) => Ok(Value::Map(m)),
            Value::Null => Ok(Value::Null),
            other => type_err("Node, Relationship, or Map", &other),
        },
        "keys" => match arg(0)? {
            Value::Node(n) => Ok(sorted_keys(n.properties.keys())),
            Value::Relationship(r) => Ok(sorted_keys(r.properties.keys())),
            Value::Map(m) => Ok(sorted_keys(m.keys())),
            Value::Null => Ok(Value::Null),
            other => type_err("Node, Relationship, or Map", &other),
        },
        "startnode" => match arg(0)? {
            Value::Relationship(r) => graph_node(ctx, r.src),
            Value::Null => Ok(Value::Null),
            other => type_err("Relationship", &other),
        },
        "endnode" => match arg(0)? {
            Value::Relationship(r) => graph_node(ctx, r.dst),
            Value::Null => Ok(Value::Null),
            other => type_err("Relationship", &other),
        },
        "exists" => Ok(Value::Bool(!arg(0)?.is_null())),

        // ====================================================================
        // Paths
        // ====================================================================
        "nodes" => match arg(0)? {
            Value::Path(p) => Ok(Value::List(
                p.nodes.into_iter().map(|n| Value::Node(Box::new(n))).collect(),
            )),
            Value::Null => Ok(Value::Null),
            other => type_err("Path", &other),
        },
        "relationships" | "rels" => match arg(0)? {
            Value::Path(p) => Ok(Value::List(
                p.relationships
                    .into_iter()
                    .map(|r| Value::Relationship(Box::new(r)))
                    .collect(),
            )),
            Value::Null => Ok(Value::Null),
            other => type_err("Path", &other),
        },
        "length" => match arg(0)? {
            Value::Path(p) => Ok(Value::Int(p.len() as i64)),
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            Value::Null => Ok(Value::Null),
            other => type_err("Path, String, or List", &other),
        },
        "size" => match arg(0)? {
            Value::String(s) => Ok(Value::Int(s.chars().count() as i64)),
            Value::List(l) => Ok(Value::Int(l.len() as i64)),
            Value::Map(m) => Ok(Value::Int(m.len() as i64)),
            Value::Null => Ok(Value::Null),
            other => type_err("String, List, or Map", &other),
        },

        // ====================================================================
        // Lists
        // ====================================================================
        "head" => match arg(0)? {
            Value::List(l) => Ok(l.into_iter().next().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => type_err("List", &other),
        },
        "last" => match arg(0)? {
            Value::List(l) => Ok(l.into_iter().next_back().unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => type_err("List", &other),
        },
        "tail" => match arg(0)? {
            Value::List(mut l) => {
                if !l.is_empty() {
                    l.remove(0);
                }
                Ok(Value::List(l))
            }
            Value::Null => Ok(Value::Null),
            other => type_err("List", &other),
        },
        "reverse" => match arg(0)? {
            Value::List(mut l) => {
                l.reverse();
                Ok(Value::List(l))
            }
            Value::String(s) => Ok(Value::String(s.chars().rev().collect())),
            Value::Null => Ok(Value::Null),
            other => type_err("List or String", &other),
        },
        "range" => {
            let start = int_arg(&arg(0)?, "range")?;
            let end = int_arg(&arg(1)?, "range")?;
            let step = if args.len() > 2 { int_arg(&arg(2)?, "range")? } else { 1 };
            if step == 0 {
                return Err(Error::ExecutionError("range() step must not be zero".into()));
            }
            let mut list = Vec::new();
            let mut i = start;
            while (step > 0 && i <= end) || (step < 0 && i >= end) {
                list.push(Value::Int(i));
                i += step;
            }
            Ok(Value::List(list))
        }
        "coalesce" => {
            for a in args {
                let val = eval_expr(a, row, ctx)?;
                if !val.is_null() {
                    return Ok(val);
                }
            }
            Ok(Value::Null)
        }

        // ====================================================================
        // Conversions
        // ====================================================================
        "tointeger" | "toint" => match arg(0)? {
            v @ Value::Int(_) => Ok(v),
            Value::Float(f) => Ok(Value::Int(f as i64)),
            Value::Bool(b) => Ok(Value::Int(i64::from(b))),
            Value::String(s) => Ok(s
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .or_else(|_| s.trim().parse::<f64>().map(|f| Value::Int(f as i64)))
                .unwrap_or(Value::Null)),
            Value::Null => Ok(Value::Null),
            other => type_err("convertible to Integer", &other),
        },
        "tofloat" => match arg(0)? {
            v @ Value::Float(_) => Ok(v),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::String(s) => {
                Ok(s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Null))
            }
            Value::Null => Ok(Value::Null),
            other => type_err("convertible to Float", &other),
        },
        "tostring" => match arg(0)? {
            Value::Null => Ok(Value::Null),
            Value::String(s) => Ok(Value::String(s)),
            other => Ok(Value::String(other.to_string())),
        },
        "toboolean" => match arg(0)? {
            v @ Value::Bool(_) => Ok(v),
            Value::String(s) => match s.to_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Ok(Value::Null),
            },
            Value::Null => Ok(Value::Null),
            other => type_err("convertible to Boolean", &other),
        },

        // ====================================================================
        // Strings
        // ====================================================================
        "tolower" | "lower" => string_fn(arg(0)?, |s| s.to_lowercase()),
        "toupper" | "upper" => string_fn(arg(0)?, |s| s.to_uppercase()),
        "trim" => string_fn(arg(0)?, |s| s.trim().to_owned()),
        "ltrim" => string_fn(arg(0)?, |s| s.trim_start().to_owned()),
        "rtrim" => string_fn(arg(0)?, |s| s.trim_end().to_owned()),
        "replace" => {
            let (s, from, to) = (arg(0)?, arg(1)?, arg(2)?);
            match (s, from, to) {
                (Value::String(s), Value::String(from), Value::String(to)) => {
                    Ok(Value::String(s.replace(&from, &to)))
                }
                (Value::Null, _, _) => Ok(Value::Null),
                (other, _, _) => type_err("String", &other),
            }
        }
        "split" => {
            let (s, sep) = (arg(0)?, arg(1)?);
            match (s, sep) {
                (Value::String(s), Value::String(sep)) => Ok(Value::List(
                    s.split(&sep).map(|p| Value::String(p.to_owned())).collect(),
                )),
                (Value::Null, _) => Ok(Value::Null),
                (other, _) => type_err("String", &other),
            }
        }
        "substring" => {
            let s = match arg(0)? {
                Value::String(s) => s,
                Value::Null => return Ok(Value::Null),
                other => return type_err("String", &other),
            };
            let start = int_arg(&arg(1)?, "substring")?.max(0) as usize;
            let chars: Vec<char> = s.chars().collect();
            let end = if args.len() > 2 {
                (start + int_arg(&arg(2)?, "substring")?.max(0) as usize).min(chars.len())
            } else {
                chars.len()
            };
            Ok(Value::String(
                chars[start.min(chars.len())..end].iter().collect(),
            ))
        }
        "left" => {
            let s = match arg(0)? {
                Value::String(s) => s,
                Value::Null => return Ok(Value::Null),
                other => return type_err("String", &other),
            };
            let n = int_arg(&arg(1)?, "left")?.max(0) as usize;
            Ok(Value::String(s.chars().take(n).collect()))
        }
        "right" => {
            let s = match arg(0)? {
                Value::String(s) => s,
                Value::Null => return Ok(Value::Null),
                other => return type_err("String", &other),
            };
            let n = int_arg(&arg(1)?, "right")?.max(0) as usize;
            let chars: Vec<char> = s.chars().collect();
            let start = chars.len().saturating_sub(n);
            Ok(Value::String(chars[start..].iter().collect()))
        }

        // ====================================================================
        // Math
        // ====================================================================
        "abs" => match arg(0)? {
            Value::Int(i) => Ok(Value::Int(i.abs())),
            Value::Float(f) => Ok(Value::Float(f.abs())),
            Value::Null => Ok(Value::Null),
            other => type_err("Numeric", &other),
        },
        "sign" => match arg(0)? {
            Value::Int(i) => Ok(Value::Int(i.signum())),
            Value::Float(f) => Ok(Value::Int(if f > 0.0 {
                1
            } else if f < 0.0 {
                -1
            } else {
                0
            })),
            Value::Null => Ok(Value::Null),
            other => type_err("Numeric", &other),
        },
        "ceil" => float_fn(arg(0)?, f64::ceil),
        "floor" => float_fn(arg(0)?, f64::floor),
        "round" => float_fn(arg(0)?, f64::round),
        "sqrt" => float_fn(arg(0)?, f64::sqrt),
        "exp" => float_fn(arg(0)?, f64::exp),
        "log" => float_fn(arg(0)?, f64::ln),
        "log10" => float_fn(arg(0)?, f64::log10),
        "sin" => float_fn(arg(0)?, f64::sin),
        "cos" => float_fn(arg(0)?, f64::cos),
        "tan" => float_fn(arg(0)?, f64::tan),
        "atan" => float_fn(arg(0)?, f64::atan),

        // ====================================================================
        // Temporal (string-based; parsed with chrono when given an argument)
        // ====================================================================
        "date" => match arg(0)? {
            Value::String(s) => {
                chrono::NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                    .map(|d| Value::String(d.to_string()))
                    .map_err(|_| Error::ExecutionError(format!("invalid date '{s}'")))
            }
            Value::Null => Ok(Value::Null),
            other => type_err("String", &other),
        },
        "datetime" => match arg(0)? {
            Value::String(s) => chrono::DateTime::parse_from_rfc3339(&s)
                .map(|d| Value::String(d.to_rfc3339()))
                .map_err(|_| Error::ExecutionError(format!("invalid datetime '{s}'"))),
            Value::Null => Ok(Value::Null),
            other => type_err("String", &other),
        },
        "duration.between" => {
            let (a, b) = (arg(0)?, arg(1)?);
            match (a, b) {
                (Value::String(a), Value::String(b)) => {
                    let start = chrono::DateTime::parse_from_rfc3339(&a)
                        .map_err(|_| Error::ExecutionError(format!("invalid datetime '{a}'")))?;
                    let end = chrono::DateTime::parse_from_rfc3339(&b)
                        .map_err(|_| Error::ExecutionError(format!("invalid datetime '{b}'")))?;
                    Ok(Value::Int((end - start).num_milliseconds()))
                }
                (Value::Null, _) | (_, Value::Null) => Ok(Value::Null),
                (other, _) => type_err("String", &other),
            }
        }

        // ====================================================================
        // Vectors
        // ====================================================================
        "vector.similarity.cosine" => {
            let (a, b) = (vec_arg(&arg(0)?)?, vec_arg(&arg(1)?)?);
            match (a, b) {
                (Some(a), Some(b)) => {
                    if a.len() != b.len() {
                        return Err(Error::ExecutionError(format!(
                            "vector dimensions differ: {} vs {}",
                            a.len(),
                            b.len()
                        )));
                    }
                    let dot: f32 = a.iter().zip(&b).map(|(x, y)| x * y).sum();
                    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                    if na == 0.0 || nb == 0.0 {
                        Ok(Value::Float(0.0))
                    } else {
                        Ok(Value::Float(f64::from(dot / (na * nb))))
                    }
                }
                _ => Ok(Value::Null),
            }
        }
        "vector.similarity.euclidean" => {
            let (a, b) = (vec_arg(&arg(0)?)?, vec_arg(&arg(1)?)?);
            match (a, b) {
                (Some(a), Some(b)) => {
                    if a.len() != b.len() {
                        return Err(Error::ExecutionError(format!(
                            "vector dimensions differ: {} vs {}",
                            a.len(),
                            b.len()
                        )));
                    }
                    let dist: f32 = a
                        .iter()
                        .zip(&b)
                        .map(|(x, y)| (x - y) * (x - y))
                        .sum::<f32>()
                        .sqrt();
                    Ok(Value::Float(1.0 / (1.0 + f64::from(dist))))
                }
                _ => Ok(Value::Null),
            }
        }

        _ => Err(Error::SemanticError(format!("Unknown function: {name}"))),
    }
}

fn type_err(expected: &str, got: &Value) -> Result<Value> {
    Err(Error::TypeError {
        expected: expected.into(),
        got: got.type_name().into(),
    })
}

fn int_arg(value: &Value, func: &str) -> Result<i64> {
    value.as_int().ok_or_else(|| Error::TypeError {
        expected: format!("Integer argument for {func}()"),
        got: value.type_name().into(),
    })
}

fn vec_arg(value: &Value) -> Result<Option<Vec<f32>>> {
    match value {
        Value::Null => Ok(None),
        other => other
            .as_vector()
            .map(Some)
            .ok_or_else(|| Error::TypeError {
                expected: "List of numbers".into(),
                got: other.type_name().into(),
            }),
    }
}

fn string_fn(value: Value, f: impl Fn(&str) -> String) -> Result<Value> {
    match value {
        Value::String(s) => Ok(Value::String(f(&s))),
        Value::Null => Ok(Value::Null),
        other => type_err("String", &other),
    }
}

fn float_fn(value: Value, f: impl Fn(f64) -> f64) -> Result<Value> {
    match value {
        Value::Int(i) => Ok(Value::Float(f(i as f64))),
        Value::Float(v) => Ok(Value::Float(f(v))),
        Value::Null => Ok(Value::Null),
        other => type_err("Numeric", &other),
    }
}

fn sorted_keys<'a>(keys: impl Iterator<Item = &'a String>) -> Value {
    let mut list: Vec<String> = keys.cloned().collect();
    list.sort();
    Value::List(list.into_iter().map(Value::String).collect())
}

/// Fetch a node by id for startNode()/endNode().
fn graph_node(ctx: &EvalCtx, id: crate::model::NodeId) -> Result<Value> {
    let Some(graph) = &ctx.graph else {
        return Ok(Value::Null);
    };
    Ok(graph
        .store
        .get_node(graph.tx, id)?
        .map(|n| Value::Node(Box::new(n)))
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cypher::ast::Literal;
    use crate::model::PropertyMap;

    fn call(name: &str, args: Vec<Expr>) -> Result<Value> {
        let params = PropertyMap::new();
        let ctx = EvalCtx::new(&params);
        eval_function(name, &args, &Row::new(), &ctx)
    }

    fn lit_str(s: &str) -> Expr {
        Expr::Literal(Literal::String(s.into()))
    }

    fn lit_int(i: i64) -> Expr {
        Expr::Literal(Literal::Int(i))
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call("toUpper", vec![lit_str("abc")]).unwrap(), Value::String("ABC".into()));
        assert_eq!(
            call("replace", vec![lit_str("a-b"), lit_str("-"), lit_str("+")]).unwrap(),
            Value::String("a+b".into())
        );
        assert_eq!(
            call("substring", vec![lit_str("hello"), lit_int(1), lit_int(3)]).unwrap(),
            Value::String("ell".into())
        );
        assert_eq!(call("left", vec![lit_str("hello"), lit_int(2)]).unwrap(), Value::String("he".into()));
        assert_eq!(call("reverse", vec![lit_str("abc")]).unwrap(), Value::String("cba".into()));
    }

    #[test]
    fn test_math_functions() {
        assert_eq!(call("abs", vec![lit_int(-5)]).unwrap(), Value::Int(5));
        assert_eq!(call("sqrt", vec![lit_int(9)]).unwrap(), Value::Float(3.0));
        assert_eq!(call("sign", vec![lit_int(-3)]).unwrap(), Value::Int(-1));
        assert_eq!(call("floor", vec![Expr::Literal(Literal::Float(1.7))]).unwrap(), Value::Float(1.0));
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call("toInteger", vec![lit_str("42")]).unwrap(), Value::Int(42));
        assert_eq!(call("toInteger", vec![lit_str("nope")]).unwrap(), Value::Null);
        assert_eq!(call("toFloat", vec![lit_str("2.5")]).unwrap(), Value::Float(2.5));
        assert_eq!(call("toBoolean", vec![lit_str("TRUE")]).unwrap(), Value::Bool(true));
        assert_eq!(call("toString", vec![lit_int(7)]).unwrap(), Value::String("7".into()));
    }

    #[test]
    fn test_range() {
        assert_eq!(
            call("range", vec![lit_int(1), lit_int(3)]).unwrap(),
            Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)])
        );
        assert_eq!(
            call("range", vec![lit_int(3), lit_int(1), lit_int(-1)]).unwrap(),
            Value::List(vec![Value::Int(3), Value::Int(2), Value::Int(1)])
        );
    }

    #[test]
    fn test_null_in_null_out() {
        let null = Expr::Literal(Literal::Null);
        assert_eq!(call("toUpper", vec![null.clone()]).unwrap(), Value::Null);
        assert_eq!(call("abs", vec![null.clone()]).unwrap(), Value::Null);
        assert_eq!(call("size", vec![null]).unwrap(), Value::Null);
    }

    #[test]
    fn test_cosine_similarity() {
        let a = Expr::List(vec![lit_int(1), lit_int(0)]);
        let b = Expr::List(vec![lit_int(0), lit_int(1)]);
        match call("vector.similarity.cosine", vec![a.clone(), b]).unwrap() {
            Value::Float(f) => assert!(f.abs() < 1e-6),
            other => panic!("expected float, got {other:?}"),
        }
        match call("vector.similarity.cosine", vec![a.clone(), a]).unwrap() {
            Value::Float(f) => assert!((f - 1.0).abs() < 1e-6),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_dimension_mismatch_errors() {
        let a = Expr::List(vec![lit_int(1), lit_int(0)]);
        let b = Expr::List(vec![lit_int(1)]);
        assert!(call("vector.similarity.cosine", vec![a, b]).is_err());
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            call("frobnicate", vec![]),
            Err(Error::SemanticError(_))
        ));
    }
}
