//! Aggregation, WITH pipelines, UNWIND, DISTINCT and UNION.

use mnemograph::{Graph, PropertyMap, Value};

async fn people_graph() -> Graph {
    let graph = Graph::open_ephemeral().await.unwrap();
    for (name, city, age) in [
        ("Ada", "London", 36i64),
        ("Bob", "London", 25),
        ("Cy", "Paris", 30),
        ("Dee", "Paris", 40),
        ("Eli", "Paris", 20),
    ] {
        let mut params = PropertyMap::new();
        params.insert("name".into(), Value::from(name));
        params.insert("city".into(), Value::from(city));
        params.insert("age".into(), Value::from(age));
        graph
            .execute(
                "CREATE (:Person {name: $name, city: $city, age: $age})",
                params,
            )
            .await
            .unwrap();
    }
    graph
}

// ============================================================================
// Grouped aggregation
// ============================================================================

#[tokio::test]
async fn test_group_by_city() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) \
             RETURN p.city AS city, count(p) AS people, avg(p.age) AS mean \
             ORDER BY city",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get::<String>("city").unwrap(), "London");
    assert_eq!(result.rows[0].get::<i64>("people").unwrap(), 2);
    assert_eq!(result.rows[0].get::<f64>("mean").unwrap(), 30.5);
    assert_eq!(result.rows[1].get::<String>("city").unwrap(), "Paris");
    assert_eq!(result.rows[1].get::<i64>("people").unwrap(), 3);
}

#[tokio::test]
async fn test_aggregate_functions() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) \
             RETURN sum(p.age) AS total, min(p.age) AS youngest, \
                    max(p.age) AS oldest, stdev(p.age) AS spread",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row.get::<i64>("total").unwrap(), 151);
    assert_eq!(row.get::<i64>("youngest").unwrap(), 20);
    assert_eq!(row.get::<i64>("oldest").unwrap(), 40);
    let spread = row.get::<f64>("spread").unwrap();
    assert!(spread > 7.0 && spread < 9.0, "sample stdev ≈ 8.0, got {spread}");
}

#[tokio::test]
async fn test_collect_and_count_distinct() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) \
             RETURN count(DISTINCT p.city) AS cities, collect(p.name) AS names",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    let row = &result.rows[0];
    assert_eq!(row.get::<i64>("cities").unwrap(), 2);
    let names: Vec<Value> = row.get("names").unwrap();
    assert_eq!(names.len(), 5);
}

#[tokio::test]
async fn test_count_on_empty_graph_is_zero() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let result = graph
        .execute("MATCH (n:Nothing) RETURN count(n) AS c", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(result.rows[0].get::<i64>("c").unwrap(), 0);
}

// ============================================================================
// WITH pipelines
// ============================================================================

#[tokio::test]
async fn test_with_pipeline_filters_aggregates() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) \
             WITH p.city AS city, count(p) AS people WHERE people > 2 \
             RETURN city",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("city").unwrap(), "Paris");
}

#[tokio::test]
async fn test_with_chains_into_match() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE (a:Team {name: 'core'}), (b:Dev {name: 'ada', team: 'core'})",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    let result = graph
        .execute(
            "MATCH (t:Team) WITH t.name AS team \
             MATCH (d:Dev {team: team}) RETURN d.name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("d.name").unwrap(), "ada");
}

// ============================================================================
// UNWIND
// ============================================================================

#[tokio::test]
async fn test_unwind_literal_list() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let result = graph
        .execute(
            "UNWIND [3, 1, 2] AS x RETURN x ORDER BY x",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    let values: Vec<i64> = result
        .rows
        .iter()
        .map(|r| r.get::<i64>("x").unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[tokio::test]
async fn test_unwind_parameter_creates_nodes() {
    let graph = Graph::open_ephemeral().await.unwrap();
    let mut params = PropertyMap::new();
    params.insert(
        "names".into(),
        Value::from(vec!["a", "b", "c"]),
    );
    let result = graph
        .execute(
            "UNWIND $names AS name CREATE (p:Person {name: name}) RETURN count(p) AS created",
            params,
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0].get::<i64>("created").unwrap(), 3);
    assert_eq!(result.stats.nodes_created, 3);
}

// ============================================================================
// DISTINCT
// ============================================================================

#[tokio::test]
async fn test_return_distinct() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) RETURN DISTINCT p.city ORDER BY p.city",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    let cities: Vec<String> = result
        .rows
        .iter()
        .map(|r| r.get::<String>("p.city").unwrap())
        .collect();
    assert_eq!(cities, vec!["London", "Paris"]);
}

// ============================================================================
// UNION
// ============================================================================

#[tokio::test]
async fn test_union_dedups_and_union_all_keeps() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE (:Cat {name: 'felix'}), (:Dog {name: 'rex'}), (:Dog {name: 'felix'})",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    let union = graph
        .execute(
            "MATCH (c:Cat) RETURN c.name AS name \
             UNION \
             MATCH (d:Dog) RETURN d.name AS name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(union.rows.len(), 2, "UNION removes the duplicate felix");

    let union_all = graph
        .execute(
            "MATCH (c:Cat) RETURN c.name AS name \
             UNION ALL \
             MATCH (d:Dog) RETURN d.name AS name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(union_all.rows.len(), 3);
}

// ============================================================================
// CASE
// ============================================================================

#[tokio::test]
async fn test_case_bucketing() {
    let graph = people_graph().await;
    let result = graph
        .execute(
            "MATCH (p:Person) \
             RETURN CASE WHEN p.age >= 30 THEN 'senior' ELSE 'junior' END AS bucket, \
                    count(p) AS people \
             ORDER BY bucket",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get::<String>("bucket").unwrap(), "junior");
    assert_eq!(result.rows[0].get::<i64>("people").unwrap(), 2);
    assert_eq!(result.rows[1].get::<String>("bucket").unwrap(), "senior");
    assert_eq!(result.rows[1].get::<i64>("people").unwrap(), 3);
}
