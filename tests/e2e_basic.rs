//! End-to-end tests for the core Cypher pipeline.
//!
//! Each test exercises: parse -> plan -> execute against an ephemeral graph
//! with an implicit transaction per statement.

use mnemograph::{Graph, Node, PropertyMap, Value};
use pretty_assertions::assert_eq;

// ============================================================================
// 1. CREATE a node, read it back
// ============================================================================

#[tokio::test]
async fn test_create_and_read() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let result = graph
        .execute(
            "CREATE (n:Person {name: 'Alice', age: 30}) RETURN n.name, n.age",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.columns, vec!["n.name", "n.age"]);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("n.name").unwrap(), "Alice");
    assert_eq!(result.rows[0].get::<i64>("n.age").unwrap(), 30);
    assert_eq!(result.stats.nodes_created, 1);

    let count = graph
        .execute("MATCH (n:Person) RETURN count(n)", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(count.rows[0].get::<i64>("count(n)").unwrap(), 1);
}

// ============================================================================
// 2. Parameters
// ============================================================================

#[tokio::test]
async fn test_parameters() {
    let graph = Graph::open_ephemeral().await.unwrap();

    let mut params = PropertyMap::new();
    params.insert("name".into(), Value::from("Ada"));
    params.insert("age".into(), Value::from(36i64));
    graph
        .execute("CREATE (n:Person {name: $name, age: $age})", params)
        .await
        .unwrap();

    let mut lookup = PropertyMap::new();
    lookup.insert("name".into(), Value::from("Ada"));
    let result = graph
        .execute("MATCH (n:Person {name: $name}) RETURN n", lookup)
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);

    let node: Node = result.rows[0].get("n").unwrap();
    assert!(node.has_label("Person"));
    assert_eq!(node.get("age"), Some(&Value::Int(36)));
}

#[tokio::test]
async fn test_missing_parameter_is_semantic_error() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let err = graph
        .execute("RETURN $nope", PropertyMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, mnemograph::Error::SemanticError(_)));
}

// ============================================================================
// 3. WHERE filters
// ============================================================================

#[tokio::test]
async fn test_where_filters() {
    let graph = Graph::open_ephemeral().await.unwrap();
    for (name, age) in [("Ada", 36i64), ("Bob", 25), ("Cy", 17)] {
        let mut params = PropertyMap::new();
        params.insert("name".into(), Value::from(name));
        params.insert("age".into(), Value::from(age));
        graph
            .execute("CREATE (n:Person {name: $name, age: $age})", params)
            .await
            .unwrap();
    }

    let result = graph
        .execute(
            "MATCH (n:Person) WHERE n.age >= 18 AND n.name <> 'Bob' RETURN n.name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("n.name").unwrap(), "Ada");
}

#[tokio::test]
async fn test_string_predicates() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE (n:Doc {title: 'authentication handbook'})",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    for (query, expected) in [
        ("MATCH (n:Doc) WHERE n.title STARTS WITH 'auth' RETURN n", 1),
        ("MATCH (n:Doc) WHERE n.title ENDS WITH 'book' RETURN n", 1),
        ("MATCH (n:Doc) WHERE n.title CONTAINS 'cation' RETURN n", 1),
        ("MATCH (n:Doc) WHERE n.title STARTS WITH 'zz' RETURN n", 0),
    ] {
        let result = graph.execute(query, PropertyMap::new()).await.unwrap();
        assert_eq!(result.rows.len(), expected, "{query}");
    }
}

// ============================================================================
// 4. ORDER BY / SKIP / LIMIT
// ============================================================================

#[tokio::test]
async fn test_order_skip_limit() {
    let graph = Graph::open_ephemeral().await.unwrap();
    for age in [30i64, 10, 20, 40] {
        let mut params = PropertyMap::new();
        params.insert("age".into(), Value::from(age));
        graph
            .execute("CREATE (n:Person {age: $age})", params)
            .await
            .unwrap();
    }

    let result = graph
        .execute(
            "MATCH (n:Person) RETURN n.age ORDER BY n.age DESC SKIP 1 LIMIT 2",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    let ages: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get::<i64>("n.age").unwrap())
        .collect();
    assert_eq!(ages, vec![30, 20]);
}

#[tokio::test]
async fn test_nulls_sort_last() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute("CREATE (:P {rank: 2}), (:P), (:P {rank: 1})", PropertyMap::new())
        .await
        .unwrap();

    let result = graph
        .execute("MATCH (n:P) RETURN n.rank ORDER BY n.rank", PropertyMap::new())
        .await
        .unwrap();
    let ranks: Vec<Value> = result
        .rows
        .iter()
        .map(|r| r.get_value("n.rank").cloned().unwrap())
        .collect();
    assert_eq!(ranks, vec![Value::Int(1), Value::Int(2), Value::Null]);
}

// ============================================================================
// 5. Keyword boundaries (labels embedding keywords)
// ============================================================================

#[tokio::test]
async fn test_keyword_boundary_label() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute("CREATE (n:RemoveReturn {ok: true})", PropertyMap::new())
        .await
        .unwrap();

    let result = graph
        .execute("MATCH (n:RemoveReturn) RETURN n", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    let node: Node = result.rows[0].get("n").unwrap();
    assert_eq!(node.labels, vec!["RemoveReturn"]);
}

// ============================================================================
// 6. Errors
// ============================================================================

#[tokio::test]
async fn test_syntax_error_has_position() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let err = graph
        .execute("MATCH (n RETURN n", PropertyMap::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "Neo.ClientError.Statement.SyntaxError");
    match err {
        mnemograph::Error::SyntaxError { message, .. } => {
            assert!(message.contains("line"), "{message}");
        }
        other => panic!("expected syntax error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_division_by_zero_is_runtime_error() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let err = graph
        .execute("RETURN 1 / 0", PropertyMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, mnemograph::Error::ExecutionError(_)));
}

// ============================================================================
// 7. RETURN shaping
// ============================================================================

#[tokio::test]
async fn test_return_alias_and_expressions() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute("CREATE (n:Person {age: 20})", PropertyMap::new())
        .await
        .unwrap();

    let result = graph
        .execute(
            "MATCH (n:Person) RETURN n.age * 2 AS doubled, toString(n.age) AS rendered",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["doubled", "rendered"]);
    assert_eq!(result.rows[0].get::<i64>("doubled").unwrap(), 40);
    assert_eq!(result.rows[0].get::<String>("rendered").unwrap(), "20");
}

#[tokio::test]
async fn test_explain_returns_plan() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let result = graph
        .execute("EXPLAIN MATCH (n:Person) RETURN n", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(result.columns, vec!["plan"]);
    assert!(!result.rows.is_empty());
    let first = result.rows[0].get::<String>("plan").unwrap();
    assert!(first.contains("Project"), "{first}");
}
