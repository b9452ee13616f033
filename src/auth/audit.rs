//! Append-only structured audit log.
//!
//! One JSON object per line in `{data_dir}/audit.log` (file mode 0640).
//! Producers send events over a bounded channel to a single owner task; the
//! owner writes and fsyncs with the same batched policy as the WAL, but on
//! its own file. The log is immutable from the engine's point of view —
//! there is no API to rewrite or truncate it.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::warn;

/// Audit event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Login,
    LoginFailed,
    Logout,
    AccessDenied,
    DataRead,
    DataCreate,
    DataUpdate,
    DataDelete,
    DataExport,
    ErasureRequest,
    ErasureComplete,
    ConsentGiven,
    ConsentRevoked,
    ConfigChange,
    Backup,
    Restore,
    SecurityAlert,
}

/// One audit record. Optional fields are omitted from the JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: uuid::Uuid,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_classification: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, success: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            timestamp: Utc::now(),
            event_type,
            user_id: None,
            username: None,
            ip_address: None,
            user_agent: None,
            resource: None,
            resource_id: None,
            action: None,
            success,
            reason: None,
            data_classification: None,
            session_id: None,
            metadata: None,
        }
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn ip_address(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn resource_id(mut self, id: impl Into<String>) -> Self {
        self.resource_id = Some(id.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

enum AuditMsg {
    Event(Box<AuditEvent>),
    Shutdown(tokio::sync::oneshot::Sender<()>),
}

/// Handle to the audit writer. Cheap to clone; dropping all handles stops
/// the writer after it drains.
#[derive(Clone)]
pub struct AuditLogger {
    tx: Option<mpsc::Sender<AuditMsg>>,
}

impl AuditLogger {
    /// No-op logger for ephemeral graphs and tests.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    /// Open (append) the audit log and start the writer task.
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o640);
            let _ = std::fs::set_permissions(&path, perms);
        }

        let (tx, rx) = mpsc::channel(1024);
        tokio::spawn(writer_task(file, rx));
        Ok(Self { tx: Some(tx) })
    }

    /// Record an event. Never blocks the caller; a saturated queue drops the
    /// event with a warning rather than stalling the request path.
    pub fn log(&self, event: AuditEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(AuditMsg::Event(Box::new(event))).is_err() {
                warn!("audit queue full; event dropped");
            }
        }
    }

    pub async fn shutdown(&self) {
        if let Some(tx) = &self.tx {
            let (ack, rx) = tokio::sync::oneshot::channel();
            if tx.send(AuditMsg::Shutdown(ack)).await.is_ok() {
                let _ = rx.await;
            }
        }
    }
}

/// Single-owner writer: batch lines while more events are queued, then one
/// flush + fsync for the group.
async fn writer_task(mut file: tokio::fs::File, mut rx: mpsc::Receiver<AuditMsg>) {
    while let Some(msg) = rx.recv().await {
        let mut shutdown_ack = None;
        let mut buffer = Vec::new();
        let push = |event: Box<AuditEvent>, buffer: &mut Vec<u8>| {
            match serde_json::to_vec(&event) {
                Ok(mut line) => {
                    line.push(b'\n');
                    buffer.extend_from_slice(&line);
                }
                Err(e) => warn!(error = %e, "audit event serialization failed"),
            }
        };

        match msg {
            AuditMsg::Event(event) => push(event, &mut buffer),
            AuditMsg::Shutdown(ack) => shutdown_ack = Some(ack),
        }
        // Drain whatever else is already queued into the same fsync.
        while shutdown_ack.is_none() {
            match rx.try_recv() {
                Ok(AuditMsg::Event(event)) => push(event, &mut buffer),
                Ok(AuditMsg::Shutdown(ack)) => shutdown_ack = Some(ack),
                Err(_) => break,
            }
        }

        if !buffer.is_empty() {
            if let Err(e) = file.write_all(&buffer).await {
                warn!(error = %e, "audit write failed");
            } else if let Err(e) = file.sync_data().await {
                warn!(error = %e, "audit fsync failed");
            }
        }
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = AuditEvent::new(AuditEventType::Login, true)
            .username("neo4j")
            .ip_address("127.0.0.1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "LOGIN");
        assert_eq!(json["username"], "neo4j");
        assert_eq!(json["success"], true);
        // Unset optional fields stay out of the line.
        assert!(json.get("resource").is_none());
    }

    #[tokio::test]
    async fn test_writer_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::open(path.clone()).await.unwrap();

        logger.log(AuditEvent::new(AuditEventType::DataCreate, true).resource("node"));
        logger.log(AuditEvent::new(AuditEventType::DataDelete, false).reason("denied"));
        logger.shutdown().await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "DATA_CREATE");
    }

    #[tokio::test]
    async fn test_disabled_logger_is_noop() {
        let logger = AuditLogger::disabled();
        logger.log(AuditEvent::new(AuditEventType::Backup, true));
        logger.shutdown().await;
    }
}
