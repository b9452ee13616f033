//! Bolt protocol server.
//!
//! Binary framed protocol: a 20-byte handshake (magic + four version
//! candidates, server picks one), then chunked PackStream messages. The
//! request surface is HELLO/LOGON (auth), BEGIN/COMMIT/ROLLBACK
//! (transactions), RUN/PULL/DISCARD (statements and streaming), RESET and
//! GOODBYE. Responses are SUCCESS, RECORD, FAILURE and IGNORED; after a
//! FAILURE the connection ignores everything until RESET.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::auth::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::auth::{AuthService, Identity, Permission};
use crate::execution::QueryResult;
use crate::graph::Graph;
use crate::model::{PropertyMap, Value};
use crate::tx::{Bookmark, TxId, TxMode};
use crate::{Error, Result};

use super::packstream;

const BOLT_MAGIC: u32 = 0x6060_B017;

/// Versions offered back to clients, newest first (major in the low byte).
const SUPPORTED_VERSIONS: &[(u8, u8)] = &[(5, 4), (5, 0), (4, 4)];

// Request message tags.
const MSG_HELLO: u8 = 0x01;
const MSG_GOODBYE: u8 = 0x02;
const MSG_RESET: u8 = 0x0F;
const MSG_RUN: u8 = 0x10;
const MSG_BEGIN: u8 = 0x11;
const MSG_COMMIT: u8 = 0x12;
const MSG_ROLLBACK: u8 = 0x13;
const MSG_DISCARD: u8 = 0x2F;
const MSG_PULL: u8 = 0x3F;
const MSG_LOGON: u8 = 0x6A;
const MSG_LOGOFF: u8 = 0x6B;

// Response message tags.
const MSG_SUCCESS: u8 = 0x70;
const MSG_RECORD: u8 = 0x71;
const MSG_IGNORED: u8 = 0x7E;
const MSG_FAILURE: u8 = 0x7F;

/// Accept loop. Runs until the shutdown signal flips.
pub async fn serve(
    graph: Graph,
    auth: Arc<AuthService>,
    audit: AuditLogger,
    listener: TcpListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(addr = ?listener.local_addr().ok(), "bolt listener started");
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        let graph = graph.clone();
                        let auth = auth.clone();
                        let audit = audit.clone();
                        tokio::spawn(async move {
                            let mut conn = Connection::new(graph, auth, audit, peer.to_string());
                            if let Err(e) = conn.run(socket).await {
                                debug!(peer = %peer, error = %e, "bolt connection closed");
                            }
                            conn.cleanup();
                        });
                    }
                    Err(e) => warn!(error = %e, "bolt accept failed"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Buffered result of a RUN, streamed out by PULL.
struct PendingResult {
    result: QueryResult,
    cursor: usize,
}

struct Connection {
    graph: Graph,
    auth: Arc<AuthService>,
    audit: AuditLogger,
    peer: String,
    identity: Option<Identity>,
    explicit_tx: Option<TxId>,
    pending: Option<PendingResult>,
    /// Bookmark of the last autocommit, reported on PULL completion.
    last_bookmark: Option<Bookmark>,
    failed: bool,
}

impl Connection {
    fn new(graph: Graph, auth: Arc<AuthService>, audit: AuditLogger, peer: String) -> Self {
        Self {
            graph,
            auth,
            audit,
            peer,
            identity: None,
            explicit_tx: None,
            pending: None,
            last_bookmark: None,
            failed: false,
        }
    }

    /// Roll back whatever the client abandoned.
    fn cleanup(&mut self) {
        if let Some(tx) = self.explicit_tx.take() {
            let _ = self.graph.rollback_registered(tx);
        }
    }

    async fn run(&mut self, mut socket: TcpStream) -> Result<()> {
        if !self.handshake(&mut socket).await? {
            return Ok(());
        }

        loop {
            let Some(mut message) = read_message(&mut socket).await? else {
                return Ok(()); // clean disconnect
            };
            let (tag, _fields) = packstream::decode_struct_header(&mut message)?;

            // Failure state machine: only RESET and GOODBYE get through.
            if self.failed && !matches!(tag, MSG_RESET | MSG_GOODBYE) {
                write_message(&mut socket, MSG_IGNORED, &[]).await?;
                continue;
            }

            match tag {
                MSG_HELLO | MSG_LOGON => {
                    let extra = packstream::decode_map(&mut message).unwrap_or_default();
                    match self.handle_hello(&extra) {
                        Ok(meta) => write_success(&mut socket, meta).await?,
                        Err(e) => {
                            self.fail(&mut socket, &e).await?;
                        }
                    }
                }
                MSG_LOGOFF => {
                    self.identity = None;
                    write_success(&mut socket, HashMap::new()).await?;
                }
                MSG_BEGIN => {
                    let extra = packstream::decode_map(&mut message).unwrap_or_default();
                    match self.handle_begin(&extra).await {
                        Ok(()) => write_success(&mut socket, HashMap::new()).await?,
                        Err(e) => self.fail(&mut socket, &e).await?,
                    }
                }
                MSG_RUN => {
                    match self.handle_run(&mut message).await {
                        Ok(columns) => {
                            let meta = HashMap::from([
                                (
                                    "fields".to_owned(),
                                    Value::List(
                                        columns.into_iter().map(Value::String).collect(),
                                    ),
                                ),
                                ("t_first".to_owned(), Value::Int(0)),
                            ]);
                            write_success(&mut socket, meta).await?;
                        }
                        Err(e) => self.fail(&mut socket, &e).await?,
                    }
                }
                MSG_PULL => {
                    let extra = packstream::decode_map(&mut message).unwrap_or_default();
                    let n = extra.get("n").and_then(Value::as_int).unwrap_or(-1);
                    self.handle_pull(&mut socket, n).await?;
                }
                MSG_DISCARD => {
                    self.pending = None;
                    write_success(
                        &mut socket,
                        HashMap::from([("has_more".to_owned(), Value::Bool(false))]),
                    )
                    .await?;
                }
                MSG_COMMIT => match self.handle_commit().await {
                    Ok(bookmark) => {
                        let meta = HashMap::from([(
                            "bookmark".to_owned(),
                            Value::String(bookmark.0),
                        )]);
                        write_success(&mut socket, meta).await?;
                    }
                    Err(e) => self.fail(&mut socket, &e).await?,
                },
                MSG_ROLLBACK => {
                    if let Some(tx) = self.explicit_tx.take() {
                        let _ = self.graph.rollback_registered(tx);
                    }
                    self.pending = None;
                    write_success(&mut socket, HashMap::new()).await?;
                }
                MSG_RESET => {
                    self.failed = false;
                    self.pending = None;
                    if let Some(tx) = self.explicit_tx.take() {
                        let _ = self.graph.rollback_registered(tx);
                    }
                    write_success(&mut socket, HashMap::new()).await?;
                }
                MSG_GOODBYE => return Ok(()),
                other => {
                    self.fail(
                        &mut socket,
                        &Error::ExecutionError(format!("unexpected message tag 0x{other:02X}")),
                    )
                    .await?;
                }
            }
        }
    }

    /// Version negotiation: 4 candidate u32s, best supported overlap wins.
    async fn handshake(&self, socket: &mut TcpStream) -> Result<bool> {
        let mut header = [0u8; 20];
        socket.read_exact(&mut header).await?;
        let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        if magic != BOLT_MAGIC {
            socket.write_all(&0u32.to_be_bytes()).await?;
            return Ok(false);
        }

        let mut offered = Vec::new();
        for chunk in header[4..].chunks_exact(4) {
            // Candidate layout: [range, 0, minor, major].
            let range = chunk[1];
            let minor = chunk[2];
            let major = chunk[3];
            for delta in 0..=range.min(minor) {
                offered.push((major, minor - delta));
            }
            offered.push((major, minor));
        }

        let chosen = SUPPORTED_VERSIONS
            .iter()
            .find(|candidate| offered.contains(candidate));

        match chosen {
            Some((major, minor)) => {
                let reply = [0u8, 0u8, *minor, *major];
                socket.write_all(&reply).await?;
                Ok(true)
            }
            None => {
                socket.write_all(&0u32.to_be_bytes()).await?;
                Ok(false)
            }
        }
    }

    fn handle_hello(&mut self, extra: &HashMap<String, Value>) -> Result<HashMap<String, Value>> {
        let scheme = extra.get("scheme").and_then(Value::as_str).unwrap_or("none");
        let identity = match scheme {
            "basic" => {
                let principal = extra
                    .get("principal")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let credentials = extra
                    .get("credentials")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.auth.authenticate_basic(principal, credentials)
            }
            "bearer" => {
                let token = extra
                    .get("credentials")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                self.auth.authenticate_bearer(token)
            }
            _ if !self.auth.enabled() => Ok(crate::auth::Identity {
                username: "anonymous".into(),
                roles: vec![crate::auth::Role::Admin],
                anonymous: true,
            }),
            _ => Err(Error::AuthnFailed("authentication required".into())),
        };

        match identity {
            Ok(identity) => {
                self.audit.log(
                    AuditEvent::new(AuditEventType::Login, true)
                        .username(&identity.username)
                        .ip_address(&self.peer)
                        .action("bolt.hello"),
                );
                self.identity = Some(identity);
                Ok(HashMap::from([
                    (
                        "server".to_owned(),
                        Value::String(format!("mnemograph/{}", env!("CARGO_PKG_VERSION"))),
                    ),
                    (
                        "connection_id".to_owned(),
                        Value::String(uuid::Uuid::new_v4().to_string()),
                    ),
                ]))
            }
            Err(e) => {
                self.audit.log(
                    AuditEvent::new(AuditEventType::LoginFailed, false)
                        .ip_address(&self.peer)
                        .reason(e.client_message()),
                );
                Err(e)
            }
        }
    }

    async fn handle_begin(&mut self, extra: &HashMap<String, Value>) -> Result<()> {
        self.require_identity(Permission::Read)?;
        if self.explicit_tx.is_some() {
            return Err(Error::TxError("transaction already open".into()));
        }
        // Causal chaining: wait for requested bookmarks first.
        if let Some(Value::List(bookmarks)) = extra.get("bookmarks") {
            for bookmark in bookmarks {
                if let Some(s) = bookmark.as_str() {
                    self.graph
                        .wait_for_bookmark(&Bookmark(s.to_owned()))
                        .await?;
                }
            }
        }
        let mode = match extra.get("mode").and_then(Value::as_str) {
            Some("r") => TxMode::ReadOnly,
            _ => TxMode::ReadWrite,
        };
        let (id, _expiry) = self.graph.begin_registered(mode);
        self.explicit_tx = Some(id);
        Ok(())
    }

    async fn handle_run(&mut self, message: &mut BytesMut) -> Result<Vec<String>> {
        let query = packstream::decode_string(message)?;
        let params: PropertyMap = packstream::decode_map(message).unwrap_or_default();
        let _extra = packstream::decode_map(message).unwrap_or_default();

        self.require_identity(Permission::Read)?;

        let result = match self.explicit_tx {
            Some(tx) => self.graph.run_registered(tx, &query, params).await?,
            None => {
                let (result, bookmark) =
                    self.graph.execute_with_bookmark(&query, params).await?;
                self.last_bookmark = Some(bookmark);
                result
            }
        };
        let columns = result.columns.clone();
        self.pending = Some(PendingResult { result, cursor: 0 });
        Ok(columns)
    }

    async fn handle_pull(&mut self, socket: &mut TcpStream, n: i64) -> Result<()> {
        let Some(pending) = &mut self.pending else {
            self.fail(socket, &Error::ExecutionError("no result to pull".into()))
                .await?;
            return Ok(());
        };

        let remaining = pending.result.rows.len() - pending.cursor;
        let take = if n < 0 { remaining } else { (n as usize).min(remaining) };

        for _ in 0..take {
            let row = pending.result.rows[pending.cursor].clone();
            pending.cursor += 1;
            let mut payload = BytesMut::new();
            packstream::encode_list_header(&mut payload, row.values.len());
            for (_, value) in &row.values {
                packstream::encode_value(&mut payload, value);
            }
            write_message(socket, MSG_RECORD, &payload).await?;
        }

        let has_more = pending.cursor < pending.result.rows.len();
        let mut meta = HashMap::from([("has_more".to_owned(), Value::Bool(has_more))]);
        if !has_more {
            meta.insert("t_last".to_owned(), Value::Int(0));
            meta.insert(
                "type".to_owned(),
                Value::String(
                    if pending.result.stats.contains_updates() { "w" } else { "r" }.to_owned(),
                ),
            );
            if self.explicit_tx.is_none() {
                if let Some(bookmark) = &self.last_bookmark {
                    meta.insert("bookmark".to_owned(), Value::String(bookmark.0.clone()));
                }
            }
            self.pending = None;
        }
        write_success(socket, meta).await
    }

    async fn handle_commit(&mut self) -> Result<Bookmark> {
        let tx = self
            .explicit_tx
            .take()
            .ok_or_else(|| Error::TxError("no open transaction".into()))?;
        self.graph.commit_registered(tx).await
    }

    fn require_identity(&self, permission: Permission) -> Result<()> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| Error::AuthnFailed("HELLO required before other messages".into()))?;
        self.auth.authorize(identity, permission)
    }

    async fn fail(&mut self, socket: &mut TcpStream, error: &Error) -> Result<()> {
        self.failed = true;
        self.pending = None;
        let mut payload = BytesMut::new();
        let meta = HashMap::from([
            ("code".to_owned(), Value::String(error.code().to_owned())),
            ("message".to_owned(), Value::String(error.client_message())),
        ]);
        packstream::encode_value(&mut payload, &Value::Map(meta));
        write_message(socket, MSG_FAILURE, &payload).await
    }
}

// ============================================================================
// Chunked framing
// ============================================================================

/// Read one message: chunks of `[u16 size][data]` terminated by a zero-size
/// chunk. Returns None on clean EOF between messages.
async fn read_message(socket: &mut TcpStream) -> Result<Option<BytesMut>> {
    let mut message = BytesMut::new();
    loop {
        let mut size_buf = [0u8; 2];
        match socket.read_exact(&mut size_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof && message.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        let size = u16::from_be_bytes(size_buf) as usize;
        if size == 0 {
            if message.is_empty() {
                continue; // keep-alive NOOP chunk
            }
            return Ok(Some(message));
        }
        let mut chunk = vec![0u8; size];
        socket.read_exact(&mut chunk).await?;
        message.extend_from_slice(&chunk);
    }
}

async fn write_message(socket: &mut TcpStream, tag: u8, payload: &[u8]) -> Result<()> {
    let mut body = BytesMut::new();
    // Every response carries exactly one metadata/payload field; empty
    // payloads get an empty map.
    packstream::encode_struct_header(&mut body, tag, 1);
    if payload.is_empty() {
        packstream::encode_map_header(&mut body, 0);
    } else {
        body.extend_from_slice(payload);
    }

    let mut framed = BytesMut::new();
    for chunk in body.chunks(0xFFFF) {
        framed.put_u16(chunk.len() as u16);
        framed.extend_from_slice(chunk);
    }
    framed.put_u16(0);
    socket.write_all(&framed).await?;
    Ok(())
}

async fn write_success(socket: &mut TcpStream, meta: HashMap<String, Value>) -> Result<()> {
    let mut payload = BytesMut::new();
    packstream::encode_value(&mut payload, &Value::Map(meta));
    write_message(socket, MSG_SUCCESS, &payload).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_preference() {
        // Client offers 5.4..5.0 (range form) and 4.4.
        let offered = vec![(5u8, 4u8), (5, 3), (5, 2), (5, 1), (5, 0), (4, 4)];
        let chosen = SUPPORTED_VERSIONS
            .iter()
            .find(|candidate| offered.contains(candidate));
        assert_eq!(chosen, Some(&(5, 4)));
    }

    #[test]
    fn test_no_version_overlap() {
        let offered = vec![(3u8, 0u8), (2, 0)];
        let chosen = SUPPORTED_VERSIONS
            .iter()
            .find(|candidate| offered.contains(candidate));
        assert!(chosen.is_none());
    }
}
