//! Vector, full-text, hybrid search and link-prediction procedures.

use mnemograph::search::SearchRequest;
use mnemograph::{Graph, Node, PropertyMap, Value};

fn embedding(values: &[f64]) -> Value {
    Value::List(values.iter().map(|v| Value::Float(*v)).collect())
}

async fn create_doc(graph: &Graph, name: &str, content: &str, vector: &[f64]) {
    let mut params = PropertyMap::new();
    params.insert("name".into(), Value::from(name));
    params.insert("content".into(), Value::from(content));
    params.insert("embedding".into(), embedding(vector));
    graph
        .execute(
            "CREATE (:Doc {name: $name, content: $content, embedding: $embedding})",
            params,
        )
        .await
        .unwrap();
}

// ============================================================================
// Vector index procedure
// ============================================================================

#[tokio::test]
async fn test_vector_query_nodes_scores() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE VECTOR INDEX Ei FOR (n:Doc) ON (n.embedding)",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    create_doc(&graph, "x", "first", &[1.0, 0.0, 0.0]).await;
    create_doc(&graph, "y", "second", &[0.0, 1.0, 0.0]).await;
    create_doc(&graph, "z", "third", &[0.7, 0.7, 0.0]).await;

    let result = graph
        .execute(
            "CALL db.index.vector.queryNodes('Ei', 2, [1.0, 0.0, 0.0]) \
             YIELD node, score RETURN node.name AS name, score",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.rows[0].get::<String>("name").unwrap(), "x");
    assert!((result.rows[0].get::<f64>("score").unwrap() - 1.0).abs() < 1e-6);
    assert_eq!(result.rows[1].get::<String>("name").unwrap(), "z");
    assert!((result.rows[1].get::<f64>("score").unwrap() - 0.7071).abs() < 1e-3);
}

#[tokio::test]
async fn test_vector_dimension_is_fixed() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "a", "three dims", &[1.0, 0.0, 0.0]).await;

    // The engine-managed index saw a 3-dimensional vector; a different
    // dimension must fail the statement.
    let mut params = PropertyMap::new();
    params.insert("embedding".into(), embedding(&[1.0, 0.0]));
    let err = graph
        .execute("CREATE (:Doc {embedding: $embedding})", params)
        .await
        .unwrap_err();
    assert!(matches!(err, mnemograph::Error::ExecutionError(_)), "{err:?}");
}

#[tokio::test]
async fn test_nodes_without_embedding_are_skipped() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "has", "text", &[1.0, 0.0]).await;
    graph
        .execute("CREATE (:Doc {name: 'hasnt', content: 'bare'})", PropertyMap::new())
        .await
        .unwrap();

    let result = graph
        .execute(
            "CALL db.index.vector.queryNodes('embeddings', 10, [1.0, 0.0]) \
             YIELD node RETURN node.name AS name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("name").unwrap(), "has");
}

// ============================================================================
// Full-text procedure
// ============================================================================

#[tokio::test]
async fn test_fulltext_query_nodes() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "auth", "authentication bug in the login flow", &[1.0, 0.0]).await;
    create_doc(&graph, "db", "storage engine compaction", &[0.0, 1.0]).await;

    let result = graph
        .execute(
            "CALL db.index.fulltext.queryNodes('search', 'authentication') \
             YIELD node, score RETURN node.name AS name, score",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].get::<String>("name").unwrap(), "auth");
    assert!(result.rows[0].get::<f64>("score").unwrap() > 0.0);
}

#[tokio::test]
async fn test_fulltext_prefix_matching() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "doc", "authentication layer", &[1.0]).await;

    let result = graph
        .execute(
            "CALL db.index.fulltext.queryNodes('search', 'auth') \
             YIELD node RETURN node.name AS name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows.len(), 1);
}

#[tokio::test]
async fn test_fulltext_index_follows_deletes() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "gone", "ephemeral text body", &[1.0]).await;
    graph
        .execute("MATCH (d:Doc {name: 'gone'}) DETACH DELETE d", PropertyMap::new())
        .await
        .unwrap();

    let result = graph
        .execute(
            "CALL db.index.fulltext.queryNodes('search', 'ephemeral') YIELD node RETURN node",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert!(result.rows.is_empty());
}

// ============================================================================
// Hybrid search (RRF)
// ============================================================================

/// A document matching both query terms whose embedding is also nearest must
/// outrank a keyword-only partial match.
#[tokio::test]
async fn test_hybrid_ranks_full_match_first() {
    let graph = Graph::open_ephemeral().await.unwrap();

    create_doc(
        &graph,
        "best",
        "authentication bug crashes the session layer",
        &[1.0, 0.0, 0.0],
    )
    .await;
    create_doc(&graph, "partial", "authentication handbook", &[0.0, 1.0, 0.0]).await;
    // Filler corpus.
    for i in 0..100 {
        create_doc(
            &graph,
            &format!("noise{i}"),
            "storage compaction release notes",
            &[0.0, 0.0, 1.0],
        )
        .await;
    }

    let hits = graph
        .search(&SearchRequest {
            text: "authentication bug".into(),
            vector: Some(vec![0.95, 0.05, 0.0]),
            label: None,
            k: 5,
            min_similarity: -1.0,
        })
        .unwrap();

    assert!(!hits.is_empty());
    let top = graph
        .execute(
            "MATCH (d) WHERE id(d) = $id RETURN d.name AS name",
            {
                let mut p = PropertyMap::new();
                p.insert("id".into(), Value::Int(hits[0].id.0 as i64));
                p
            },
        )
        .await
        .unwrap();
    assert_eq!(top.rows[0].get::<String>("name").unwrap(), "best");
}

#[tokio::test]
async fn test_hybrid_falls_back_to_bm25_without_vector() {
    let graph = Graph::open_ephemeral().await.unwrap();
    create_doc(&graph, "only", "unique sesquipedalian token", &[1.0]).await;

    let hits = graph
        .search(&SearchRequest {
            text: "sesquipedalian".into(),
            vector: None,
            label: None,
            k: 5,
            min_similarity: 0.0,
        })
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].bm25_rank.is_some());
    assert!(hits[0].vector_rank.is_none());
}

// ============================================================================
// Subgraph + link prediction procedures
// ============================================================================

async fn triangle_graph() -> Graph {
    // a and b share neighbor c; d hangs off b.
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE (a:P {name: 'a'}), (b:P {name: 'b'}), (c:P {name: 'c'}), (d:P {name: 'd'}) \
             WITH a, b, c, d \
             CREATE (a)-[:K]->(c), (b)-[:K]->(c), (b)-[:K]->(d)",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    graph
}

#[tokio::test]
async fn test_subgraph_nodes() {
    let graph = triangle_graph().await;
    let result = graph
        .execute(
            "MATCH (a:P {name: 'a'}) \
             CALL apoc.path.subgraphNodes(a, {maxLevel: 1}) YIELD node \
             RETURN node.name AS name ORDER BY name",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    let names: Vec<String> = result
        .rows
        .iter()
        .map(|r| r.get::<String>("name").unwrap())
        .collect();
    assert_eq!(names, vec!["a", "c"]);
}

#[tokio::test]
async fn test_common_neighbors_and_jaccard() {
    let graph = triangle_graph().await;
    let result = graph
        .execute(
            "MATCH (a:P {name: 'a'}), (b:P {name: 'b'}) \
             CALL gds.linkprediction.commonNeighbors(a, b) YIELD score \
             RETURN score",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(result.rows[0].get::<f64>("score").unwrap(), 1.0);

    let jaccard = graph
        .execute(
            "MATCH (a:P {name: 'a'}), (b:P {name: 'b'}) \
             CALL gds.linkprediction.jaccard(a, b) YIELD score \
             RETURN score",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    // Neighbors: a → {c}, b → {c, d}; intersection 1, union 2.
    assert_eq!(jaccard.rows[0].get::<f64>("score").unwrap(), 0.5);
}

#[tokio::test]
async fn test_suggest_links_ranks_unconnected_pairs() {
    let graph = triangle_graph().await;
    let result = graph
        .execute(
            "CALL gds.linkprediction.suggestLinks('P', 3) \
             YIELD node1, node2, score RETURN node1.name AS a, node2.name AS b, score",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert!(!result.rows.is_empty());
    // The top suggestion links the pair sharing a neighbor: a and b.
    let pair = (
        result.rows[0].get::<String>("a").unwrap(),
        result.rows[0].get::<String>("b").unwrap(),
    );
    assert_eq!(pair, ("a".to_owned(), "b".to_owned()));
}

// ============================================================================
// Introspection procedures
// ============================================================================

#[tokio::test]
async fn test_db_introspection() {
    let graph = triangle_graph().await;

    let labels = graph
        .execute("CALL db.labels() YIELD label RETURN label", PropertyMap::new())
        .await
        .unwrap();
    assert_eq!(labels.rows.len(), 1);
    assert_eq!(labels.rows[0].get::<String>("label").unwrap(), "P");

    let types = graph
        .execute(
            "CALL db.relationshipTypes() YIELD relationshipType RETURN relationshipType",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(types.rows[0].get::<String>("relationshipType").unwrap(), "K");

    let keys = graph
        .execute(
            "CALL db.propertyKeys() YIELD propertyKey RETURN propertyKey",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    assert_eq!(keys.rows.len(), 1);
    assert_eq!(keys.rows[0].get::<String>("propertyKey").unwrap(), "name");
}

// ============================================================================
// Hybrid link prediction over embeddings
// ============================================================================

#[tokio::test]
async fn test_hybrid_link_prediction() {
    let graph = Graph::open_ephemeral().await.unwrap();
    graph
        .execute(
            "CREATE (a:P {name: 'a', embedding: [1.0, 0.0]}), \
                    (b:P {name: 'b', embedding: [1.0, 0.0]})",
            PropertyMap::new(),
        )
        .await
        .unwrap();

    let result = graph
        .execute(
            "MATCH (a:P {name: 'a'}), (b:P {name: 'b'}) \
             CALL gds.linkprediction.hybrid(a, b, 0.0) \
             YIELD score, semanticScore RETURN score, semanticScore",
            PropertyMap::new(),
        )
        .await
        .unwrap();
    // alpha = 0: pure semantic, and the embeddings are identical.
    assert!((result.rows[0].get::<f64>("score").unwrap() - 1.0).abs() < 1e-6);
}
