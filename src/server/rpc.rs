//! Memory/tool JSON-RPC layer.
//!
//! Higher-level operations over the graph, mounted at `POST /rpc` as
//! JSON-RPC 2.0: `store` / `recall` / `discover` / `link` / `task` / `tasks`.
//! Memories are `Memory`-labeled nodes with a generated uuid in the `id`
//! property; `discover` runs the hybrid search service and can expand the
//! hit set by N hops of graph neighborhood.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::Utc;
use serde_json::{Value as Json_, json};

use crate::auth::Permission;
use crate::auth::audit::{AuditEvent, AuditEventType};
use crate::model::{PropertyMap, Value};
use crate::search::SearchRequest;
use crate::{Error, Result};

use super::ServerContext;
use super::http::{json_to_value, plain_to_json, value_to_json};

#[derive(serde::Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    jsonrpc: String,
    id: Option<Json_>,
    method: String,
    #[serde(default)]
    params: Json_,
}

pub async fn handle(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Json(request): Json<RpcRequest>,
) -> Json<Json_> {
    let id = request.id.clone().unwrap_or(Json_::Null);
    if !request.jsonrpc.is_empty() && request.jsonrpc != "2.0" {
        return Json(rpc_error(id, -32600, "unsupported jsonrpc version"));
    }

    let auth_header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let identity = match ctx.auth.authenticate_header(auth_header) {
        Ok(identity) => identity,
        Err(e) => return Json(rpc_error(id, -32001, &e.client_message())),
    };
    let permission = match request.method.as_str() {
        "recall" | "discover" | "tasks" => Permission::Read,
        _ => Permission::Write,
    };
    if ctx.auth.authorize(&identity, permission).is_err() {
        ctx.audit.log(
            AuditEvent::new(AuditEventType::AccessDenied, false)
                .username(&identity.username)
                .action(format!("rpc.{}", request.method)),
        );
        return Json(rpc_error(id, -32002, "permission denied"));
    }

    let outcome = dispatch(&ctx, &request.method, &request.params).await;
    match outcome {
        Ok(result) => Json(json!({ "jsonrpc": "2.0", "id": id, "result": result })),
        Err(e) => Json(rpc_error(id, error_code(&e), &e.client_message())),
    }
}

fn rpc_error(id: Json_, code: i64, message: &str) -> Json_ {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

fn error_code(error: &Error) -> i64 {
    match error {
        Error::NotFound(_) => -32004,
        Error::SemanticError(_) | Error::TypeError { .. } => -32602,
        _ => -32000,
    }
}

async fn dispatch(ctx: &ServerContext, method: &str, params: &Json_) -> Result<Json_> {
    match method {
        "store" => store(ctx, params).await,
        "recall" => recall(ctx, params).await,
        "discover" => discover(ctx, params).await,
        "link" => link(ctx, params).await,
        "task" => task(ctx, params).await,
        "tasks" => tasks(ctx, params).await,
        other => Err(Error::SemanticError(format!("unknown method '{other}'"))),
    }
}

// ============================================================================
// Parameter helpers
// ============================================================================

fn str_param(params: &Json_, key: &str) -> Option<String> {
    params.get(key).and_then(Json_::as_str).map(str::to_owned)
}

fn require_str(params: &Json_, key: &str) -> Result<String> {
    str_param(params, key)
        .ok_or_else(|| Error::SemanticError(format!("missing parameter '{key}'")))
}

/// Type names become an extra label: `note` → `Note`. Restricted to
/// alphanumerics so they stay valid label tokens.
fn type_label(type_name: &str) -> String {
    let cleaned: String = type_name
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    let mut chars = cleaned.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => "Memory".to_owned(),
    }
}

fn relation_type(relation: &str) -> String {
    let cleaned: String = relation
        .chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    if cleaned.is_empty() { "RELATED_TO".to_owned() } else { cleaned }
}

// ============================================================================
// Operations
// ============================================================================

/// `store(content, type, title?, tags?, metadata?)` → `{id}`
async fn store(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    let content = require_str(params, "content")?;
    let type_name = str_param(params, "type").unwrap_or_else(|| "memory".to_owned());
    let id = uuid::Uuid::new_v4().to_string();

    let mut props = PropertyMap::new();
    props.insert("id".into(), Value::String(id.clone()));
    props.insert("content".into(), Value::String(content));
    props.insert("type".into(), Value::String(type_name.clone()));
    props.insert("created".into(), Value::String(Utc::now().to_rfc3339()));
    if let Some(title) = str_param(params, "title") {
        props.insert("title".into(), Value::String(title));
    }
    if let Some(tags) = params.get("tags") {
        props.insert("tags".into(), json_to_value(tags));
    }
    if let Some(metadata) = params.get("metadata") {
        props.insert("metadata".into(), json_to_value(metadata));
    }

    let mut create_params = PropertyMap::new();
    create_params.insert("props".into(), Value::Map(props));
    let result = ctx
        .graph
        .execute(
            &format!(
                "CREATE (m:Memory:{}) SET m = $props RETURN m.id AS id",
                type_label(&type_name)
            ),
            create_params,
        )
        .await?;

    ctx.audit.log(
        AuditEvent::new(AuditEventType::DataCreate, true)
            .resource("memory")
            .resource_id(&id),
    );
    let stored_id = result
        .rows
        .first()
        .and_then(|r| r.get::<String>("id").ok())
        .unwrap_or(id);
    Ok(json!({ "id": stored_id }))
}

/// `recall(id | type+filters+limit)` → matching memories.
async fn recall(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    if let Some(id) = str_param(params, "id") {
        let mut cypher_params = PropertyMap::new();
        cypher_params.insert("id".into(), Value::String(id.clone()));
        let result = ctx
            .graph
            .execute("MATCH (m:Memory {id: $id}) RETURN m", cypher_params)
            .await?;
        let Some(row) = result.rows.first() else {
            return Err(Error::NotFound(format!("memory '{id}'")));
        };
        return Ok(memory_json(row.get_value("m")));
    }

    let limit = params.get("limit").and_then(Json_::as_i64).unwrap_or(20).clamp(1, 500);
    let query = match str_param(params, "type") {
        Some(type_name) => format!(
            "MATCH (m:Memory:{}) RETURN m ORDER BY m.created DESC LIMIT {limit}",
            type_label(&type_name)
        ),
        None => format!("MATCH (m:Memory) RETURN m ORDER BY m.created DESC LIMIT {limit}"),
    };
    let result = ctx.graph.execute(&query, PropertyMap::new()).await?;
    let memories: Vec<Json_> = result
        .rows
        .iter()
        .map(|row| memory_json(row.get_value("m")))
        .collect();
    Ok(json!({ "memories": memories }))
}

/// `discover(query, type?, limit?, min_similarity?, depth?)`: hybrid search
/// plus optional neighborhood expansion.
async fn discover(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    let query = require_str(params, "query")?;
    let limit = params.get("limit").and_then(Json_::as_i64).unwrap_or(10).clamp(1, 100) as usize;
    let min_similarity = params
        .get("min_similarity")
        .and_then(Json_::as_f64)
        .unwrap_or(0.0) as f32;
    let depth = params.get("depth").and_then(Json_::as_i64).unwrap_or(0).clamp(0, 5) as usize;

    // The vector branch needs an embedding for the query text; without a
    // configured embedding service the search degrades to BM25 only.
    let vector = ctx.graph.embedder().embed(&query).await.ok();

    let request = SearchRequest {
        text: query.clone(),
        vector,
        label: str_param(params, "type").map(|t| type_label(&t)),
        k: limit,
        min_similarity,
    };
    let hits = ctx.graph.search(&request)?;

    let mut results = Vec::new();
    for hit in &hits {
        let mut cypher_params = PropertyMap::new();
        cypher_params.insert("id".into(), Value::Int(hit.id.0 as i64));
        let found = ctx
            .graph
            .execute("MATCH (m) WHERE id(m) = $id RETURN m", cypher_params)
            .await?;
        if let Some(row) = found.rows.first() {
            let mut entry = memory_json(row.get_value("m"));
            entry["score"] = json!(hit.score);
            if depth > 0 {
                let related = expand_neighborhood(ctx, hit.id.0, depth).await?;
                entry["related"] = Json_::Array(related);
            }
            results.push(entry);
        }
    }

    ctx.audit.log(
        AuditEvent::new(AuditEventType::DataRead, true)
            .resource("search")
            .action("discover"),
    );
    Ok(json!({ "results": results }))
}

async fn expand_neighborhood(ctx: &ServerContext, id: u64, depth: usize) -> Result<Vec<Json_>> {
    let mut cypher_params = PropertyMap::new();
    cypher_params.insert("id".into(), Value::Int(id as i64));
    let result = ctx
        .graph
        .execute(
            &format!("MATCH (m)-[*1..{depth}]-(related) WHERE id(m) = $id RETURN DISTINCT related"),
            cypher_params,
        )
        .await?;
    Ok(result
        .rows
        .iter()
        .map(|row| memory_json(row.get_value("related")))
        .collect())
}

/// `link(from, to, relation, strength?, metadata?)`
async fn link(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    let from = require_str(params, "from")?;
    let to = require_str(params, "to")?;
    let relation = relation_type(&require_str(params, "relation")?);

    let mut cypher_params = PropertyMap::new();
    cypher_params.insert("from".into(), Value::String(from.clone()));
    cypher_params.insert("to".into(), Value::String(to.clone()));
    cypher_params.insert(
        "strength".into(),
        params
            .get("strength")
            .map(json_to_value)
            .unwrap_or(Value::Float(1.0)),
    );
    cypher_params.insert(
        "metadata".into(),
        params.get("metadata").map(json_to_value).unwrap_or(Value::Null),
    );

    let result = ctx
        .graph
        .execute(
            &format!(
                "MATCH (a {{id: $from}}), (b {{id: $to}}) \
                 CREATE (a)-[r:{relation} {{strength: $strength, metadata: $metadata}}]->(b) \
                 RETURN id(r) AS rel_id"
            ),
            cypher_params,
        )
        .await?;

    if result.rows.is_empty() {
        return Err(Error::NotFound(format!(
            "link endpoints '{from}' and/or '{to}'"
        )));
    }
    ctx.audit.log(
        AuditEvent::new(AuditEventType::DataCreate, true)
            .resource("link")
            .action(relation),
    );
    Ok(json!({ "linked": true }))
}

/// `task(id?, title?, status?, ...)`: create or update a Task node.
async fn task(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    match str_param(params, "id") {
        // Update path.
        Some(id) => {
            let mut updates = HashMap::new();
            for key in ["title", "status", "priority", "due", "notes"] {
                if let Some(value) = params.get(key) {
                    updates.insert(key.to_owned(), json_to_value(value));
                }
            }
            updates.insert("updated".into(), Value::String(Utc::now().to_rfc3339()));

            let mut cypher_params = PropertyMap::new();
            cypher_params.insert("id".into(), Value::String(id.clone()));
            cypher_params.insert("updates".into(), Value::Map(updates));
            let result = ctx
                .graph
                .execute(
                    "MATCH (t:Task {id: $id}) SET t += $updates RETURN t",
                    cypher_params,
                )
                .await?;
            let Some(row) = result.rows.first() else {
                return Err(Error::NotFound(format!("task '{id}'")));
            };
            Ok(memory_json(row.get_value("t")))
        }
        // Create path.
        None => {
            let title = require_str(params, "title")?;
            let id = uuid::Uuid::new_v4().to_string();
            let mut props = PropertyMap::new();
            props.insert("id".into(), Value::String(id.clone()));
            props.insert("title".into(), Value::String(title));
            props.insert(
                "status".into(),
                Value::String(str_param(params, "status").unwrap_or_else(|| "open".to_owned())),
            );
            if let Some(priority) = params.get("priority") {
                props.insert("priority".into(), json_to_value(priority));
            }
            if let Some(due) = str_param(params, "due") {
                props.insert("due".into(), Value::String(due));
            }
            props.insert("created".into(), Value::String(Utc::now().to_rfc3339()));

            let mut cypher_params = PropertyMap::new();
            cypher_params.insert("props".into(), Value::Map(props));
            let result = ctx
                .graph
                .execute("CREATE (t:Task) SET t = $props RETURN t", cypher_params)
                .await?;
            let row = result
                .rows
                .first()
                .ok_or_else(|| Error::ExecutionError("task creation returned no row".into()))?;
            Ok(memory_json(row.get_value("t")))
        }
    }
}

/// `tasks(status?, limit?)`: query Task nodes.
async fn tasks(ctx: &ServerContext, params: &Json_) -> Result<Json_> {
    let limit = params.get("limit").and_then(Json_::as_i64).unwrap_or(50).clamp(1, 500);
    let result = match str_param(params, "status") {
        Some(status) => {
            let mut cypher_params = PropertyMap::new();
            cypher_params.insert("status".into(), Value::String(status));
            ctx.graph
                .execute(
                    &format!(
                        "MATCH (t:Task {{status: $status}}) \
                         RETURN t ORDER BY t.created DESC LIMIT {limit}"
                    ),
                    cypher_params,
                )
                .await?
        }
        None => {
            ctx.graph
                .execute(
                    &format!("MATCH (t:Task) RETURN t ORDER BY t.created DESC LIMIT {limit}"),
                    PropertyMap::new(),
                )
                .await?
        }
    };
    let tasks: Vec<Json_> = result
        .rows
        .iter()
        .map(|row| memory_json(row.get_value("t")))
        .collect();
    Ok(json!({ "tasks": tasks }))
}

/// Render a node result as a flat JSON object (properties + labels).
fn memory_json(value: Option<&Value>) -> Json_ {
    match value {
        Some(Value::Node(node)) => {
            let mut body = match plain_to_json(&Value::Map(node.properties.clone())) {
                Json_::Object(map) => map,
                _ => Default::default(),
            };
            body.insert("labels".into(), json!(node.labels));
            body.insert("internal_id".into(), json!(node.id.0));
            Json_::Object(body)
        }
        Some(other) => value_to_json(other).0,
        None => Json_::Null,
    }
}
