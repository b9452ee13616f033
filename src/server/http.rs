//! Neo4j-compatible HTTP transaction API.
//!
//! JSON over the standard endpoint layout: implicit transactions at
//! `/db/{name}/tx/commit`, explicit transactions with per-id URLs and idle
//! expiry, discovery and liveness endpoints, token exchange, admin and GDPR
//! operations. Statement errors never abort the whole response; they land
//! in the `errors` array, matching the upstream wire contract.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::{Value as Json_, json};

use crate::auth::audit::{AuditEvent, AuditEventType};
use crate::auth::{Identity, Permission};
use crate::execution::QueryResult;
use crate::model::{PropertyMap, Value};
use crate::tx::TxId;
use crate::tx::TxMode;
use crate::{Error, Result};

use super::ServerContext;

pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/", get(discovery))
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/db/{db}/tx/commit", post(tx_commit_implicit))
        .route("/db/{db}/tx", post(tx_begin))
        .route("/db/{db}/tx/{id}", post(tx_run).delete(tx_rollback))
        .route("/db/{db}/tx/{id}/commit", post(tx_commit))
        .route("/auth/token", post(auth_token))
        .route("/admin/stats", get(admin_stats))
        .route("/admin/backup", post(admin_backup))
        .route("/gdpr/export", post(gdpr_export))
        .route("/gdpr/delete", post(gdpr_delete))
        .route("/rpc", post(super::rpc::handle))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(ctx)
}

// ============================================================================
// Wire shapes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StatementsRequest {
    #[serde(default)]
    pub statements: Vec<StatementRequest>,
}

#[derive(Debug, Deserialize)]
pub struct StatementRequest {
    pub statement: String,
    #[serde(default)]
    pub parameters: HashMap<String, Json_>,
    #[serde(default, rename = "includeStats")]
    pub include_stats: bool,
}

#[derive(Debug, Serialize)]
struct StatementsResponse {
    results: Vec<Json_>,
    errors: Vec<Json_>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "lastBookmarks")]
    last_bookmarks: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    transaction: Option<Json_>,
}

/// Engine errors as HTTP responses with stable codes.
struct ApiError(Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::AuthnFailed(_) => StatusCode::UNAUTHORIZED,
            Error::AuthzDenied(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) | Error::TxError(_) => StatusCode::NOT_FOUND,
            Error::SyntaxError { .. }
            | Error::SemanticError(_)
            | Error::TypeError { .. }
            | Error::PlanError(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "errors": [error_json(&self.0)],
        });
        (status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn error_json(error: &Error) -> Json_ {
    json!({ "code": error.code(), "message": error.client_message() })
}

// ============================================================================
// Value <-> JSON
// ============================================================================

/// Render a result value as the transaction API does: nodes and
/// relationships become property maps, with a parallel `meta` entry carrying
/// identity and kind.
pub fn value_to_json(value: &Value) -> (Json_, Json_) {
    match value {
        Value::Node(node) => (
            json!({
                "id": node.id.0,
                "elementId": node.element_id(),
                "labels": node.labels,
                "properties": props_to_json(&node.properties),
            }),
            json!({ "id": node.id.0, "elementId": node.element_id(), "type": "node" }),
        ),
        Value::Relationship(rel) => (
            json!({
                "id": rel.id.0,
                "elementId": rel.element_id(),
                "type": rel.rel_type,
                "startNode": rel.src.0,
                "endNode": rel.dst.0,
                "properties": props_to_json(&rel.properties),
            }),
            json!({ "id": rel.id.0, "elementId": rel.element_id(), "type": "relationship" }),
        ),
        Value::Path(path) => {
            let nodes: Vec<Json_> = path.nodes.iter().map(|n| value_to_json(&Value::Node(Box::new(n.clone()))).0).collect();
            let rels: Vec<Json_> = path
                .relationships
                .iter()
                .map(|r| value_to_json(&Value::Relationship(Box::new(r.clone()))).0)
                .collect();
            (
                json!({ "nodes": nodes, "relationships": rels, "length": path.len() }),
                json!({ "type": "path" }),
            )
        }
        other => (plain_to_json(other), Json_::Null),
    }
}

pub fn plain_to_json(value: &Value) -> Json_ {
    match value {
        Value::Null => Json_::Null,
        Value::Bool(b) => json!(b),
        Value::Int(i) => json!(i),
        Value::Float(f) => json!(f),
        Value::String(s) => json!(s),
        Value::Bytes(b) => json!(b),
        Value::List(items) => Json_::Array(items.iter().map(plain_to_json).collect()),
        Value::Map(map) => {
            Json_::Object(map.iter().map(|(k, v)| (k.clone(), plain_to_json(v))).collect())
        }
        graph => value_to_json(graph).0,
    }
}

pub fn json_to_value(json: &Json_) -> Value {
    match json {
        Json_::Null => Value::Null,
        Json_::Bool(b) => Value::Bool(*b),
        Json_::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        Json_::String(s) => Value::String(s.clone()),
        Json_::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        Json_::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

fn props_to_json(props: &PropertyMap) -> Json_ {
    Json_::Object(
        props
            .iter()
            .map(|(k, v)| (k.clone(), plain_to_json(v)))
            .collect(),
    )
}

pub fn json_params(params: &HashMap<String, Json_>) -> PropertyMap {
    params
        .iter()
        .map(|(k, v)| (k.clone(), json_to_value(v)))
        .collect()
}

fn result_to_json(result: &QueryResult, include_stats: bool) -> Json_ {
    let data: Vec<Json_> = result
        .rows
        .iter()
        .map(|row| {
            let mut values = Vec::new();
            let mut meta = Vec::new();
            for (_, value) in &row.values {
                let (v, m) = value_to_json(value);
                values.push(v);
                meta.push(m);
            }
            json!({ "row": values, "meta": meta })
        })
        .collect();

    let mut body = json!({ "columns": result.columns, "data": data });
    if include_stats {
        body["stats"] = json!({
            "contains_updates": result.stats.contains_updates(),
            "nodes_created": result.stats.nodes_created,
            "nodes_deleted": result.stats.nodes_deleted,
            "relationships_created": result.stats.relationships_created,
            "relationships_deleted": result.stats.relationships_deleted,
            "properties_set": result.stats.properties_set,
            "labels_added": result.stats.labels_added,
            "labels_removed": result.stats.labels_removed,
        });
    }
    body
}

// ============================================================================
// Auth plumbing
// ============================================================================

fn authenticate(ctx: &ServerContext, headers: &HeaderMap) -> Result<Identity> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    ctx.auth.authenticate_header(header).inspect_err(|e| {
        ctx.audit.log(
            AuditEvent::new(AuditEventType::LoginFailed, false)
                .action("http")
                .reason(e.client_message()),
        );
    })
}

fn authorize(
    ctx: &ServerContext,
    identity: &Identity,
    permission: Permission,
    action: &str,
) -> Result<()> {
    ctx.auth.authorize(identity, permission).inspect_err(|_| {
        ctx.audit.log(
            AuditEvent::new(AuditEventType::AccessDenied, false)
                .username(&identity.username)
                .action(action),
        );
    })
}

// ============================================================================
// Discovery / status
// ============================================================================

async fn discovery(State(ctx): State<Arc<ServerContext>>) -> Json<Json_> {
    let config = ctx.graph.config();
    let base = format!(
        "http://{}:{}",
        config.server.bind_address, config.server.http_port
    );
    Json(json!({
        "bolt_direct": format!("bolt://{}:{}", config.server.bind_address, config.server.bolt_port),
        "transaction": format!("{base}/db/{{databaseName}}/tx"),
        "neo4j_version": "5.0-compatible",
        "server": format!("mnemograph/{}", env!("CARGO_PKG_VERSION")),
    }))
}

async fn health() -> Json<Json_> {
    Json(json!({ "status": "ok" }))
}

async fn status(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Read, "status")?;

    let counters = ctx.graph.counters();
    Ok(Json(json!({
        "uptime_seconds": ctx.graph.uptime().as_secs(),
        "queries": counters.queries.load(std::sync::atomic::Ordering::Relaxed),
        "commits": counters.commits.load(std::sync::atomic::Ordering::Relaxed),
        "open_transactions": ctx.graph.open_transactions(),
        "accelerator_fallbacks": ctx.graph.store().accelerator_fallbacks(),
        "last_bookmark": ctx.graph.current_bookmark().0,
    })))
}

// ============================================================================
// Transactions
// ============================================================================

/// POST /db/{db}/tx/commit: run all statements in one implicit transaction.
async fn tx_commit_implicit(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath(_db): UrlPath<String>,
    headers: HeaderMap,
    Json(request): Json<StatementsRequest>,
) -> ApiResult<Json<StatementsResponse>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Write, "tx.commit")?;

    let (id, _) = ctx.graph.begin_registered(TxMode::ReadWrite);
    let (results, errors) = run_statements(&ctx, id, &request).await;

    let mut bookmarks = None;
    if errors.is_empty() {
        match ctx.graph.commit_registered(id).await {
            Ok(bookmark) => bookmarks = Some(vec![bookmark.0]),
            Err(e) => {
                return Ok(Json(StatementsResponse {
                    results,
                    errors: vec![error_json(&e)],
                    commit: None,
                    last_bookmarks: None,
                    transaction: None,
                }));
            }
        }
    } else {
        let _ = ctx.graph.rollback_registered(id);
    }

    Ok(Json(StatementsResponse {
        results,
        errors,
        commit: None,
        last_bookmarks: bookmarks,
        transaction: None,
    }))
}

/// POST /db/{db}/tx: open an explicit transaction, optionally running the
/// first batch of statements.
async fn tx_begin(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath(db): UrlPath<String>,
    headers: HeaderMap,
    Json(request): Json<StatementsRequest>,
) -> ApiResult<Response> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Write, "tx.begin")?;

    let (id, expiry) = ctx.graph.begin_registered(TxMode::ReadWrite);
    let (results, errors) = run_statements(&ctx, id, &request).await;

    let commit_url = format!("/db/{db}/tx/{id}/commit");
    let body = StatementsResponse {
        results,
        errors,
        commit: Some(commit_url),
        last_bookmarks: None,
        transaction: Some(json!({
            "expires": (chrono::Utc::now() + chrono::Duration::from_std(expiry).unwrap_or_default()).to_rfc3339(),
        })),
    };
    let location = format!("/db/{db}/tx/{id}");
    Ok((
        StatusCode::CREATED,
        [(axum::http::header::LOCATION, location)],
        Json(body),
    )
        .into_response())
}

/// POST /db/{db}/tx/{id}: run statements inside the open transaction.
async fn tx_run(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath((db, id)): UrlPath<(String, u64)>,
    headers: HeaderMap,
    Json(request): Json<StatementsRequest>,
) -> ApiResult<Json<StatementsResponse>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Write, "tx.run")?;

    let tx = TxId(id);
    let (results, errors) = run_statements(&ctx, tx, &request).await;
    Ok(Json(StatementsResponse {
        results,
        errors,
        commit: Some(format!("/db/{db}/tx/{id}/commit")),
        last_bookmarks: None,
        transaction: None,
    }))
}

/// POST /db/{db}/tx/{id}/commit: run trailing statements, then commit.
async fn tx_commit(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath((_db, id)): UrlPath<(String, u64)>,
    headers: HeaderMap,
    Json(request): Json<StatementsRequest>,
) -> ApiResult<Json<StatementsResponse>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Write, "tx.commit")?;

    let tx = TxId(id);
    let (results, mut errors) = run_statements(&ctx, tx, &request).await;

    let mut bookmarks = None;
    if errors.is_empty() {
        match ctx.graph.commit_registered(tx).await {
            Ok(bookmark) => bookmarks = Some(vec![bookmark.0]),
            Err(e) => errors.push(error_json(&e)),
        }
    } else {
        let _ = ctx.graph.rollback_registered(tx);
    }

    Ok(Json(StatementsResponse {
        results,
        errors,
        commit: None,
        last_bookmarks: bookmarks,
        transaction: None,
    }))
}

/// DELETE /db/{db}/tx/{id}: roll back.
async fn tx_rollback(
    State(ctx): State<Arc<ServerContext>>,
    UrlPath((_db, id)): UrlPath<(String, u64)>,
    headers: HeaderMap,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Write, "tx.rollback")?;

    ctx.graph.rollback_registered(TxId(id))?;
    Ok(Json(json!({ "results": [], "errors": [] })))
}

async fn run_statements(
    ctx: &ServerContext,
    tx: TxId,
    request: &StatementsRequest,
) -> (Vec<Json_>, Vec<Json_>) {
    let mut results = Vec::new();
    let mut errors = Vec::new();
    for statement in &request.statements {
        let params = json_params(&statement.parameters);
        match ctx
            .graph
            .run_registered(tx, &statement.statement, params)
            .await
        {
            Ok(result) => results.push(result_to_json(&result, statement.include_stats)),
            Err(e) => {
                errors.push(error_json(&e));
                break; // the transaction is rollback-only from here
            }
        }
    }
    (results, errors)
}

// ============================================================================
// Auth token
// ============================================================================

#[derive(Deserialize)]
struct TokenRequest {
    username: String,
    password: String,
}

async fn auth_token(
    State(ctx): State<Arc<ServerContext>>,
    Json(request): Json<TokenRequest>,
) -> ApiResult<Json<Json_>> {
    match ctx.auth.issue_token(&request.username, &request.password) {
        Ok((token, ttl)) => {
            ctx.audit.log(
                AuditEvent::new(AuditEventType::Login, true)
                    .username(&request.username)
                    .action("auth.token"),
            );
            Ok(Json(json!({
                "token": token,
                "token_type": "Bearer",
                "expires_in": ttl.as_secs(),
            })))
        }
        Err(e) => {
            ctx.audit.log(
                AuditEvent::new(AuditEventType::LoginFailed, false)
                    .username(&request.username)
                    .reason(e.client_message()),
            );
            Err(e.into())
        }
    }
}

// ============================================================================
// Admin
// ============================================================================

async fn admin_stats(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Admin, "admin.stats")?;

    let result = ctx
        .graph
        .execute("MATCH (n) RETURN count(n) AS nodes", PropertyMap::new())
        .await?;
    let nodes = result.rows.first().and_then(|r| r.get::<i64>("nodes").ok()).unwrap_or(0);
    let rels = ctx
        .graph
        .execute("MATCH ()-[r]->() RETURN count(r) AS rels", PropertyMap::new())
        .await?
        .rows
        .first()
        .and_then(|r| r.get::<i64>("rels").ok())
        .unwrap_or(0);

    Ok(Json(json!({
        "nodes": nodes,
        "relationships": rels,
        "open_transactions": ctx.graph.open_transactions(),
        "uptime_seconds": ctx.graph.uptime().as_secs(),
    })))
}

async fn admin_backup(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Admin, "admin.backup")?;

    let path = ctx.graph.backup().await?;
    ctx.audit.log(
        AuditEvent::new(AuditEventType::Backup, true)
            .username(&identity.username)
            .resource("snapshot")
            .resource_id(path.display().to_string()),
    );
    Ok(Json(json!({ "snapshot": path.display().to_string() })))
}

// ============================================================================
// GDPR
// ============================================================================

#[derive(Deserialize)]
struct SubjectRequest {
    subject_id: String,
}

/// POST /gdpr/export: every node carrying the subject id, plus its
/// relationships.
async fn gdpr_export(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<SubjectRequest>,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Admin, "gdpr.export")?;

    let mut params = PropertyMap::new();
    params.insert("subject".into(), Value::String(request.subject_id.clone()));
    let nodes = ctx
        .graph
        .execute(
            "MATCH (n) WHERE n.subject_id = $subject OR n.id = $subject RETURN n",
            params.clone(),
        )
        .await?;
    let rels = ctx
        .graph
        .execute(
            "MATCH (n)-[r]-() WHERE n.subject_id = $subject OR n.id = $subject RETURN r",
            params,
        )
        .await?;

    ctx.audit.log(
        AuditEvent::new(AuditEventType::DataExport, true)
            .username(&identity.username)
            .resource("subject")
            .resource_id(&request.subject_id),
    );

    let node_json: Vec<Json_> = nodes
        .rows
        .iter()
        .filter_map(|r| r.get_value("n").map(|v| value_to_json(v).0))
        .collect();
    let rel_json: Vec<Json_> = rels
        .rows
        .iter()
        .filter_map(|r| r.get_value("r").map(|v| value_to_json(v).0))
        .collect();
    Ok(Json(json!({
        "subject_id": request.subject_id,
        "nodes": node_json,
        "relationships": rel_json,
    })))
}

/// POST /gdpr/delete: erase a subject's nodes (detach) and audit both ends
/// of the request.
async fn gdpr_delete(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<SubjectRequest>,
) -> ApiResult<Json<Json_>> {
    let identity = authenticate(&ctx, &headers)?;
    authorize(&ctx, &identity, Permission::Admin, "gdpr.delete")?;

    ctx.audit.log(
        AuditEvent::new(AuditEventType::ErasureRequest, true)
            .username(&identity.username)
            .resource("subject")
            .resource_id(&request.subject_id),
    );

    let mut params = PropertyMap::new();
    params.insert("subject".into(), Value::String(request.subject_id.clone()));
    let result = ctx
        .graph
        .execute(
            "MATCH (n) WHERE n.subject_id = $subject OR n.id = $subject DETACH DELETE n",
            params,
        )
        .await?;

    ctx.audit.log(
        AuditEvent::new(AuditEventType::ErasureComplete, true)
            .username(&identity.username)
            .resource("subject")
            .resource_id(&request.subject_id)
            .metadata(json!({ "nodes_deleted": result.stats.nodes_deleted })),
    );

    Ok(Json(json!({
        "subject_id": request.subject_id,
        "nodes_deleted": result.stats.nodes_deleted,
        "relationships_deleted": result.stats.relationships_deleted,
    })))
}
