//! HTTP transaction API and memory JSON-RPC, exercised over a real listener.

use std::sync::Arc;

use mnemograph::auth::AuthService;
use mnemograph::auth::audit::AuditLogger;
use mnemograph::config::Config;
use mnemograph::graph::Graph;
use mnemograph::server::Server;
use serde_json::{Value as Json, json};

/// Boot a server on ephemeral ports; returns the HTTP base URL.
async fn start_server(config: Config) -> (Server, String) {
    let mut config = config;
    config.server.bolt_port = 0;
    config.server.http_port = 0;
    let auth = Arc::new(AuthService::new(&config.auth));
    let graph = Graph::open_ephemeral_with(config).await.unwrap();
    let server = Server::new(graph, auth, AuditLogger::disabled());
    let (_bolt, http) = server.start().await.unwrap();
    (server, format!("http://{http}"))
}

async fn post(base: &str, path: &str, body: Json) -> (reqwest::StatusCode, Json) {
    let client = reqwest::Client::new();
    let response = client
        .post(format!("{base}{path}"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    let body = response.json().await.unwrap_or(Json::Null);
    (status, body)
}

fn statements(statement: &str) -> Json {
    json!({ "statements": [{ "statement": statement }] })
}

// ============================================================================
// Discovery + health
// ============================================================================

#[tokio::test]
async fn test_discovery_and_health() {
    let (server, base) = start_server(Config::default()).await;

    let discovery: Json = reqwest::get(&base).await.unwrap().json().await.unwrap();
    assert!(discovery["transaction"].as_str().unwrap().contains("/tx"));

    let health: Json = reqwest::get(format!("{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    server.stop();
}

// ============================================================================
// Implicit transactions
// ============================================================================

#[tokio::test]
async fn test_implicit_commit_roundtrip() {
    let (server, base) = start_server(Config::default()).await;

    let (status, body) = post(
        &base,
        "/db/neo4j/tx/commit",
        json!({ "statements": [{
            "statement": "CREATE (n:Person {name: $name}) RETURN n.name",
            "parameters": { "name": "Ada" },
            "includeStats": true
        }]}),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(body["errors"].as_array().unwrap().is_empty(), "{body}");
    assert_eq!(body["results"][0]["columns"][0], "n.name");
    assert_eq!(body["results"][0]["data"][0]["row"][0], "Ada");
    assert_eq!(body["results"][0]["stats"]["nodes_created"], 1);
    assert!(body["lastBookmarks"].as_array().unwrap().len() == 1);

    // Node results come back as maps with identity metadata.
    let (_, read) = post(
        &base,
        "/db/neo4j/tx/commit",
        statements("MATCH (n:Person) RETURN n"),
    )
    .await;
    let node = &read["results"][0]["data"][0]["row"][0];
    assert_eq!(node["properties"]["name"], "Ada");
    assert_eq!(node["labels"][0], "Person");
    let meta = &read["results"][0]["data"][0]["meta"][0];
    assert_eq!(meta["type"], "node");

    server.stop();
}

#[tokio::test]
async fn test_statement_errors_are_reported_not_committed() {
    let (server, base) = start_server(Config::default()).await;

    let (status, body) = post(
        &base,
        "/db/neo4j/tx/commit",
        json!({ "statements": [
            { "statement": "CREATE (:Person {name: 'x'})" },
            { "statement": "THIS IS NOT CYPHER" }
        ]}),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let errors = body["errors"].as_array().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0]["code"]
        .as_str()
        .unwrap()
        .contains("SyntaxError"));

    // The failing batch rolled back entirely.
    let (_, read) = post(
        &base,
        "/db/neo4j/tx/commit",
        statements("MATCH (n:Person) RETURN count(n) AS c"),
    )
    .await;
    assert_eq!(read["results"][0]["data"][0]["row"][0], 0);

    server.stop();
}

// ============================================================================
// Explicit transactions
// ============================================================================

#[tokio::test]
async fn test_explicit_transaction_flow() {
    let (server, base) = start_server(Config::default()).await;
    let client = reqwest::Client::new();

    // Begin, receiving the tx URL in Location.
    let begin = client
        .post(format!("{base}/db/neo4j/tx"))
        .json(&statements("CREATE (:Item {i: 1})"))
        .send()
        .await
        .unwrap();
    assert_eq!(begin.status(), reqwest::StatusCode::CREATED);
    let location = begin
        .headers()
        .get(reqwest::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let body: Json = begin.json().await.unwrap();
    let commit_url = body["commit"].as_str().unwrap().to_owned();
    assert!(body["transaction"]["expires"].is_string());

    // Before commit nothing is visible to other transactions.
    let (_, read) = post(
        &base,
        "/db/neo4j/tx/commit",
        statements("MATCH (n:Item) RETURN count(n) AS c"),
    )
    .await;
    assert_eq!(read["results"][0]["data"][0]["row"][0], 0);

    // Add one more statement through the tx URL, then commit.
    let (status, _) = post(&base, &location, statements("CREATE (:Item {i: 2})")).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let (status, commit_body) = post(&base, &commit_url, json!({ "statements": [] })).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(commit_body["lastBookmarks"].as_array().unwrap().len() == 1);

    let (_, read) = post(
        &base,
        "/db/neo4j/tx/commit",
        statements("MATCH (n:Item) RETURN count(n) AS c"),
    )
    .await;
    assert_eq!(read["results"][0]["data"][0]["row"][0], 2);

    server.stop();
}

#[tokio::test]
async fn test_explicit_transaction_rollback() {
    let (server, base) = start_server(Config::default()).await;
    let client = reqwest::Client::new();

    let begin = client
        .post(format!("{base}/db/neo4j/tx"))
        .json(&statements("CREATE (:Item)"))
        .send()
        .await
        .unwrap();
    let location = begin
        .headers()
        .get(reqwest::header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();

    let rollback = client
        .delete(format!("{base}{location}"))
        .send()
        .await
        .unwrap();
    assert_eq!(rollback.status(), reqwest::StatusCode::OK);

    let (_, read) = post(
        &base,
        "/db/neo4j/tx/commit",
        statements("MATCH (n:Item) RETURN count(n) AS c"),
    )
    .await;
    assert_eq!(read["results"][0]["data"][0]["row"][0], 0);

    server.stop();
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_auth_required_and_token_flow() {
    let mut config = Config::default();
    config.auth.enabled = true;
    let (server, base) = start_server(config).await;
    let client = reqwest::Client::new();

    // No credentials: 401 (but /health stays open).
    let denied = client
        .post(format!("{base}/db/neo4j/tx/commit"))
        .json(&statements("RETURN 1"))
        .send()
        .await
        .unwrap();
    assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);
    let health = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(health.status(), reqwest::StatusCode::OK);

    // Wrong password is rejected.
    let (status, _) = post(
        &base,
        "/auth/token",
        json!({ "username": "neo4j", "password": "wrong" }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::UNAUTHORIZED);

    // Token exchange, then bearer-authenticated query.
    let (status, token_body) = post(
        &base,
        "/auth/token",
        json!({ "username": "neo4j", "password": "password" }),
    )
    .await;
    assert_eq!(status, reqwest::StatusCode::OK);
    let token = token_body["token"].as_str().unwrap();

    let allowed = client
        .post(format!("{base}/db/neo4j/tx/commit"))
        .bearer_auth(token)
        .json(&statements("RETURN 1 AS one"))
        .send()
        .await
        .unwrap();
    assert_eq!(allowed.status(), reqwest::StatusCode::OK);
    let body: Json = allowed.json().await.unwrap();
    assert_eq!(body["results"][0]["data"][0]["row"][0], 1);

    server.stop();
}

// ============================================================================
// Memory JSON-RPC
// ============================================================================

async fn rpc(base: &str, method: &str, params: Json) -> Json {
    let (_status, body) = post(
        base,
        "/rpc",
        json!({ "jsonrpc": "2.0", "id": 1, "method": method, "params": params }),
    )
    .await;
    body
}

#[tokio::test]
async fn test_rpc_store_recall_link() {
    let (server, base) = start_server(Config::default()).await;

    let stored = rpc(
        &base,
        "store",
        json!({ "content": "vector indexes are rebuilt at startup", "type": "note", "title": "startup" }),
    )
    .await;
    let id = stored["result"]["id"].as_str().unwrap().to_owned();

    let other = rpc(&base, "store", json!({ "content": "the WAL fsyncs in groups", "type": "note" })).await;
    let other_id = other["result"]["id"].as_str().unwrap().to_owned();

    let recalled = rpc(&base, "recall", json!({ "id": id })).await;
    assert_eq!(recalled["result"]["title"], "startup");
    assert!(recalled["result"]["labels"]
        .as_array()
        .unwrap()
        .contains(&json!("Note")));

    let linked = rpc(
        &base,
        "link",
        json!({ "from": id, "to": other_id, "relation": "relates to" }),
    )
    .await;
    assert_eq!(linked["result"]["linked"], true);

    let listed = rpc(&base, "recall", json!({ "type": "note" })).await;
    assert_eq!(listed["result"]["memories"].as_array().unwrap().len(), 2);

    server.stop();
}

#[tokio::test]
async fn test_rpc_discover_keyword_fallback() {
    let (server, base) = start_server(Config::default()).await;

    rpc(&base, "store", json!({ "content": "authentication bug in the session layer" })).await;
    rpc(&base, "store", json!({ "content": "compaction strategy for the storage engine" })).await;

    // No embedding service configured: discover degrades to BM25.
    let found = rpc(&base, "discover", json!({ "query": "authentication" })).await;
    let results = found["result"]["results"].as_array().unwrap();
    assert_eq!(results.len(), 1);
    assert!(results[0]["content"]
        .as_str()
        .unwrap()
        .contains("authentication"));

    server.stop();
}

#[tokio::test]
async fn test_rpc_tasks() {
    let (server, base) = start_server(Config::default()).await;

    let created = rpc(
        &base,
        "task",
        json!({ "title": "write the recovery runbook", "priority": 1 }),
    )
    .await;
    let task_id = created["result"]["id"].as_str().unwrap().to_owned();
    assert_eq!(created["result"]["status"], "open");

    let updated = rpc(&base, "task", json!({ "id": task_id, "status": "done" })).await;
    assert_eq!(updated["result"]["status"], "done");

    let open = rpc(&base, "tasks", json!({ "status": "open" })).await;
    assert!(open["result"]["tasks"].as_array().unwrap().is_empty());
    let done = rpc(&base, "tasks", json!({ "status": "done" })).await;
    assert_eq!(done["result"]["tasks"].as_array().unwrap().len(), 1);

    server.stop();
}

#[tokio::test]
async fn test_rpc_unknown_method() {
    let (server, base) = start_server(Config::default()).await;
    let body = rpc(&base, "frobnicate", json!({})).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("unknown method"));
    server.stop();
}
