//! # mnemograph — Property Graph Database with Hybrid Search
//!
//! A Neo4j-compatible graph engine: labeled nodes and typed relationships with
//! arbitrary properties, a Cypher subset, durable storage on an ordered KV
//! substrate with a write-ahead log, and integrated vector + BM25 retrieval
//! fused with Reciprocal Rank Fusion.
//!
//! ## Design Principles
//!
//! 1. **Layered ownership**: the KV substrate owns all persistent bytes; the
//!    record store is the only writer of record keyspaces; the transaction
//!    manager owns a live transaction's write-set until commit.
//! 2. **Clean DTOs**: `Node`, `Relationship`, `Value` cross all boundaries
//! 3. **Parser owns nothing**: Cypher → AST is a pure function
//! 4. **Traits at the seams that vary**: embedding provider, similarity
//!    accelerator, and rerank hooks are pluggable; the storage stack is not.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mnemograph::{Graph, Value, PropertyMap};
//!
//! # async fn example() -> mnemograph::Result<()> {
//! let graph = Graph::open_ephemeral().await?;
//!
//! let mut params = PropertyMap::new();
//! params.insert("name".into(), Value::from("Ada"));
//! let result = graph.execute("CREATE (n:Person {name: $name}) RETURN n", params).await?;
//!
//! for row in &result.rows {
//!     println!("{:?}", row.get_value("n"));
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod auth;
pub mod config;
pub mod cypher;
pub mod embedding;
pub mod execution;
pub mod graph;
pub mod index;
pub mod kv;
pub mod model;
pub mod planner;
pub mod search;
pub mod server;
pub mod storage;
pub mod tx;
pub mod wal;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::Config;
pub use execution::{QueryResult, ResultRow};
pub use graph::{ExplicitTx, Graph};
pub use model::{Direction, Node, NodeId, Path, PropertyMap, RelId, Relationship, Value};
pub use tx::{Bookmark, TxMode};

// ============================================================================
// Error Types
// ============================================================================

/// Engine-wide error taxonomy. Each kind maps to a stable Neo4j-style status
/// code via [`Error::code`], which is what clients see over Bolt and HTTP.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cypher syntax error at position {position}: {message}")]
    SyntaxError { position: usize, message: String },

    #[error("Semantic error: {0}")]
    SemanticError(String),

    #[error("Type error: expected {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("Planning error: {0}")]
    PlanError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Transaction error: {0}")]
    TxError(String),

    #[error("Authentication failed: {0}")]
    AuthnFailed(String),

    #[error("Permission denied: {0}")]
    AuthzDenied(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable status code surfaced to clients. Internal detail never leaks:
    /// `StorageError` and `Io` collapse to a generic database error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::SyntaxError { .. } => "Neo.ClientError.Statement.SyntaxError",
            Error::SemanticError(_) => "Neo.ClientError.Statement.SemanticError",
            Error::TypeError { .. } => "Neo.ClientError.Statement.TypeError",
            Error::PlanError(_) => "Neo.ClientError.Statement.SemanticError",
            Error::ExecutionError(_) => "Neo.ClientError.Statement.ExecutionFailed",
            Error::NotFound(_) => "Neo.ClientError.Statement.EntityNotFound",
            Error::ConstraintViolation(_) => {
                "Neo.ClientError.Schema.ConstraintValidationFailed"
            }
            Error::Transient(_) => "Neo.TransientError.Transaction.Outdated",
            Error::Timeout(_) => "Neo.ClientError.Transaction.TransactionTimedOut",
            Error::TxError(_) => "Neo.ClientError.Transaction.InvalidRequest",
            Error::AuthnFailed(_) => "Neo.ClientError.Security.Unauthorized",
            Error::AuthzDenied(_) => "Neo.ClientError.Security.Forbidden",
            Error::StorageError(_) | Error::Io(_) => "Neo.DatabaseError.General.UnknownError",
        }
    }

    /// True for errors a client may retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    /// Message safe to surface to clients. Internal errors are opaque.
    pub fn client_message(&self) -> String {
        match self {
            Error::StorageError(_) | Error::Io(_) => "internal database error".to_owned(),
            other => other.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
