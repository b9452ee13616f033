//! The top-level graph engine handle.
//!
//! A [`Graph`] wires the storage stack together — KV substrate, WAL, record
//! store, transaction registry, search service — and provides Cypher
//! execution. Implicit statements auto-commit; explicit transactions live in
//! a registry with idle expiry and return bookmarks on commit.
//!
//! The commit path: validate unique constraints (with in-flight reservations
//! so concurrent committers cannot both win a key), append to the WAL, apply
//! to the KV substrate, fold the node deltas into the search indexes, then
//! publish the commit sequence on the bookmark clock.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::cypher::ast::{IndexKind, SchemaCommand, Statement};
use crate::embedding::Embedder;
use crate::execution::{self, ExecEnv, QueryResult, ResultRow};
use crate::index::{CpuAccelerator, SimilarityAccelerator};
use crate::kv::KvStore;
use crate::model::{PropertyMap, Value};
use crate::planner::{self, LogicalPlan};
use crate::search::{SearchHit, SearchRequest, SearchService};
use crate::storage::schema::{
    ConstraintDef, FulltextIndexDef, IndexDef, VectorBackend, VectorIndexDef,
};
use crate::storage::{RecordStore, SchemaChange};
use crate::tx::{Bookmark, BookmarkClock, MergeLocks, TxId, TxMode, TxRegistry, TxState};
use crate::wal::WalManager;
use crate::{Error, Result};

/// Engine-wide counters surfaced on `/status`.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub queries: AtomicU64,
    pub commits: AtomicU64,
    pub panics: AtomicU64,
}

struct GraphInner {
    config: Config,
    kv: KvStore,
    store: Arc<RecordStore>,
    wal: WalManager,
    registry: Arc<TxRegistry>,
    clock: BookmarkClock,
    embedder: Arc<dyn Embedder>,
    search: SearchService,
    merge_locks: Arc<MergeLocks>,
    /// Unique keys reserved by commits that have validated but not yet
    /// applied. A second committer hitting a reserved key fails Transient.
    pending_uniques: Mutex<HashSet<Vec<u8>>>,
    counters: EngineCounters,
    started: Instant,
    shutdown: watch::Sender<bool>,
}

/// The primary entry point. Cheap to clone; all clones share the engine.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Graph {
    /// Open (or create) a durable graph at `config.data_dir`, running crash
    /// recovery first.
    pub async fn open(config: Config) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let kv = KvStore::new();
        let wal = WalManager::open(&config.data_dir, config.wal.clone(), kv.clone()).await?;
        Self::assemble(config, kv, wal, Arc::new(CpuAccelerator)).await
    }

    /// In-memory graph with no durability. The workhorse for tests and
    /// embedded use.
    pub async fn open_ephemeral() -> Result<Self> {
        Self::open_ephemeral_with(Config::default()).await
    }

    pub async fn open_ephemeral_with(config: Config) -> Result<Self> {
        let kv = KvStore::new();
        let wal = WalManager::ephemeral(kv.clone());
        Self::assemble(config, kv, wal, Arc::new(CpuAccelerator)).await
    }

    async fn assemble(
        config: Config,
        kv: KvStore,
        wal: WalManager,
        accelerator: Arc<dyn SimilarityAccelerator>,
    ) -> Result<Self> {
        let store = Arc::new(RecordStore::open(
            kv.clone(),
            config.fulltext.clone(),
            accelerator,
        )?);
        let registry = TxRegistry::new(config.limits.transaction_expiry());
        let clock = BookmarkClock::new();
        clock.advance(kv.version());
        let embedder: Arc<dyn Embedder> =
            Arc::from(crate::embedding::from_config(&config.embedding)?);
        let search = SearchService::new(config.search.clone());
        let (shutdown, _) = watch::channel(false);

        let graph = Self {
            inner: Arc::new(GraphInner {
                config,
                kv,
                store,
                wal,
                registry,
                clock,
                embedder,
                search,
                merge_locks: MergeLocks::new(),
                pending_uniques: Mutex::new(HashSet::new()),
                counters: EngineCounters::default(),
                started: Instant::now(),
                shutdown,
            }),
        };
        graph.spawn_background_tasks();
        Ok(graph)
    }

    /// Swap in a different embedding provider (tests, custom services).
    pub fn set_embedder(&mut self, embedder: Arc<dyn Embedder>) {
        // Only possible before the graph handle is shared.
        Arc::get_mut(&mut self.inner)
            .expect("set_embedder requires an unshared graph handle")
            .embedder = embedder;
    }

    fn spawn_background_tasks(&self) {
        // Explicit-transaction expiry sweeper.
        let registry = self.inner.registry.clone();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        for id in registry.sweep_expired() {
                            debug!(tx = %id, "transaction expired, rolled back");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        // Snapshot trigger: size or interval, whichever comes first.
        let wal = self.inner.wal.clone();
        let size_limit = self.inner.config.snapshot.size_bytes;
        let interval = self.inner.config.snapshot.interval();
        let mut shutdown_rx = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let mut last = Instant::now();
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        let due_by_size = wal.bytes_since_snapshot() >= size_limit;
                        let due_by_time =
                            last.elapsed() >= interval && wal.bytes_since_snapshot() > 0;
                        if due_by_size || due_by_time {
                            match wal.snapshot_now().await {
                                Ok(_) => last = Instant::now(),
                                Err(e) => warn!(error = %e, "snapshot failed"),
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
    }

    /// Flush and stop background work. Call before process exit.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.wal.shutdown().await;
        info!("graph engine stopped");
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &RecordStore {
        &self.inner.store
    }

    pub fn counters(&self) -> &EngineCounters {
        &self.inner.counters
    }

    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn open_transactions(&self) -> usize {
        self.inner.registry.open_count()
    }

    pub fn current_bookmark(&self) -> Bookmark {
        Bookmark::from_seq(self.inner.clock.current())
    }

    /// Block (bounded) until the engine has caught up with a bookmark.
    pub async fn wait_for_bookmark(&self, bookmark: &Bookmark) -> Result<()> {
        let Some(seq) = bookmark.seq() else {
            return Err(Error::TxError(format!("malformed bookmark '{}'", bookmark.0)));
        };
        self.inner
            .clock
            .wait_for(seq, Duration::from_secs(30))
            .await
    }

    /// Hybrid search over the default vector + full-text indexes.
    pub fn search(&self, request: &SearchRequest) -> Result<Vec<SearchHit>> {
        self.inner.search.search(&self.inner.store, request)
    }

    pub fn embedder(&self) -> Arc<dyn Embedder> {
        self.inner.embedder.clone()
    }

    /// Force a snapshot; returns its directory (empty for ephemeral graphs).
    pub async fn backup(&self) -> Result<std::path::PathBuf> {
        self.inner.wal.snapshot_now().await
    }

    // ========================================================================
    // Implicit execution
    // ========================================================================

    /// Execute a single statement as its own transaction.
    pub async fn execute<P>(&self, query: &str, params: P) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let mut state = self.begin_state(TxMode::ReadWrite);
        let result = self.run_statement(&mut state, query, params.into()).await?;
        self.commit_state(state).await?;
        Ok(result)
    }

    /// Execute and also return the commit bookmark.
    pub async fn execute_with_bookmark<P>(
        &self,
        query: &str,
        params: P,
    ) -> Result<(QueryResult, Bookmark)>
    where
        P: Into<PropertyMap>,
    {
        let mut state = self.begin_state(TxMode::ReadWrite);
        let result = self.run_statement(&mut state, query, params.into()).await?;
        let bookmark = self.commit_state(state).await?;
        Ok((result, bookmark))
    }

    // ========================================================================
    // Explicit transactions (library API)
    // ========================================================================

    pub fn begin(&self, mode: TxMode) -> ExplicitTx<'_> {
        ExplicitTx {
            graph: self,
            state: Some(self.begin_state(mode)),
        }
    }

    // ========================================================================
    // Explicit transactions (registry, used by the servers)
    // ========================================================================

    pub fn begin_registered(&self, mode: TxMode) -> (TxId, Duration) {
        let state = self.begin_state(mode);
        let id = state.id;
        self.inner.registry.insert(state);
        (id, self.inner.registry.expiry())
    }

    /// Run one statement inside a registered transaction. A failed statement
    /// marks the transaction rollback-only.
    pub async fn run_registered<P>(
        &self,
        id: TxId,
        query: &str,
        params: P,
    ) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let mut state = self.inner.registry.checkout(id)?;
        let result = self.run_statement(&mut state, query, params.into()).await;
        if result.is_err() {
            state.rollback_only = true;
        }
        self.inner.registry.checkin(state);
        result
    }

    pub async fn commit_registered(&self, id: TxId) -> Result<Bookmark> {
        let state = self.inner.registry.remove(id)?;
        if state.rollback_only {
            return Err(Error::TxError(
                "transaction can only be rolled back after a failed statement".into(),
            ));
        }
        self.commit_state(state).await
    }

    pub fn rollback_registered(&self, id: TxId) -> Result<()> {
        // Dropping the state discards the write-set and unpins the snapshot.
        self.inner.registry.remove(id).map(|_| ())
    }

    // ========================================================================
    // Statement pipeline
    // ========================================================================

    fn begin_state(&self, mode: TxMode) -> TxState {
        TxState::new(self.inner.registry.allocate_id(), mode, self.inner.kv.snapshot())
    }

    /// Parse → plan → execute one statement against a transaction state.
    pub async fn run_statement(
        &self,
        state: &mut TxState,
        query: &str,
        params: PropertyMap,
    ) -> Result<QueryResult> {
        self.inner.counters.queries.fetch_add(1, Ordering::Relaxed);
        let statement = crate::cypher::parse(query)?;
        self.run_parsed(state, &statement, params).await
    }

    async fn run_parsed(
        &self,
        state: &mut TxState,
        statement: &Statement,
        params: PropertyMap,
    ) -> Result<QueryResult> {
        match statement {
            Statement::Schema(command) => {
                self.stage_schema_command(state, command)?;
                Ok(QueryResult::empty())
            }
            Statement::Explain(inner) => {
                let rendered = match inner.as_ref() {
                    Statement::Schema(_) => vec!["SchemaCommand".to_owned()],
                    other => planner::render_plan(&planner::plan(other)?, 0),
                };
                Ok(QueryResult {
                    columns: vec!["plan".into()],
                    rows: rendered
                        .into_iter()
                        .map(|line| ResultRow {
                            values: vec![("plan".into(), Value::String(line))],
                        })
                        .collect(),
                    stats: Default::default(),
                })
            }
            other => {
                let plan = planner::plan(other)?;
                self.execute_plan(state, &plan, params).await
            }
        }
    }

    async fn execute_plan(
        &self,
        state: &mut TxState,
        plan: &LogicalPlan,
        params: PropertyMap,
    ) -> Result<QueryResult> {
        let env = ExecEnv {
            schema: self.inner.store.schema(),
            embedder: self.inner.embedder.clone(),
            max_hops: self.inner.config.limits.varlen_max_hops,
            deadline: Some(Instant::now() + self.inner.config.limits.query_timeout()),
            merge_locks: self.inner.merge_locks.clone(),
            held_guards: Mutex::new(Vec::new()),
        };
        execution::execute(&self.inner.store, state, plan, params, &env).await
        // `env` (and any merge-tuple guards it holds) drops here; for
        // implicit statements commit_state has not yet run, but the staged
        // unique entries are still validated under the commit reservation.
    }

    fn stage_schema_command(&self, state: &mut TxState, command: &SchemaCommand) -> Result<()> {
        let store = &self.inner.store;
        let change = match command {
            SchemaCommand::CreateIndex { name, kind, label, properties, options } => {
                match kind {
                    IndexKind::Range => store.stage_create_index(
                        state,
                        IndexDef { label: label.clone(), properties: properties.clone() },
                    )?,
                    IndexKind::Vector => {
                        let opts = eval_options(options)?;
                        let def = VectorIndexDef {
                            name: name
                                .clone()
                                .unwrap_or_else(|| format!("{label}_{}", properties[0])),
                            label: label.clone(),
                            property: properties[0].clone(),
                            backend: match opts.get("backend").and_then(Value::as_str) {
                                Some("hnsw") => VectorBackend::Hnsw,
                                _ => VectorBackend::Brute,
                            },
                            m: opt_usize(&opts, &["m", "M"], 16),
                            ef_construction: opt_usize(
                                &opts,
                                &["efConstruction", "ef_construction"],
                                200,
                            ),
                            ef_search: opt_usize(&opts, &["efSearch", "ef_search"], 100),
                        };
                        store.stage_create_vector_index(state, def)?
                    }
                    IndexKind::Fulltext => {
                        let def = FulltextIndexDef {
                            name: name
                                .clone()
                                .unwrap_or_else(|| format!("{label}_fulltext")),
                            labels: vec![label.clone()],
                        };
                        store.stage_create_fulltext_index(state, def)?
                    }
                }
            }
            SchemaCommand::CreateConstraint { label, property, .. } => store
                .stage_create_constraint(
                    state,
                    ConstraintDef { label: label.clone(), property: property.clone() },
                )?,
            SchemaCommand::DropIndex { name, label, property } => {
                if let (Some(label), Some(property)) = (label, property) {
                    store.stage_drop_index(state, label, property)?
                } else if let Some(name) = name {
                    let schema = store.schema();
                    if schema.vector_indexes.contains_key(name) {
                        store.stage_drop_vector_index(state, name)?
                    } else if schema.fulltext_indexes.contains_key(name) {
                        state.require_writable()?;
                        state.delete(crate::storage::keys::schema_key("ftindex", name));
                        SchemaChange::DropFulltextIndex(name.clone())
                    } else if let Some((label, property)) = name.split_once('_') {
                        store.stage_drop_index(state, label, property)?
                    } else {
                        return Err(Error::NotFound(format!("index '{name}'")));
                    }
                } else {
                    return Err(Error::SemanticError("DROP INDEX needs a target".into()));
                }
            }
            SchemaCommand::DropConstraint { name, label, property } => {
                if let (Some(label), Some(property)) = (label, property) {
                    store.stage_drop_constraint(state, label, property)?
                } else if let Some(name) = name {
                    let stripped = name.strip_suffix("_unique").unwrap_or(name);
                    let Some((label, property)) = stripped.split_once('_') else {
                        return Err(Error::NotFound(format!("constraint '{name}'")));
                    };
                    store.stage_drop_constraint(state, label, property)?
                } else {
                    return Err(Error::SemanticError("DROP CONSTRAINT needs a target".into()));
                }
            }
        };
        state.schema_changes.push(change);
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Commit a transaction state: unique validation (with in-flight
    /// reservations), WAL append + fsync, KV apply, search-index updates,
    /// bookmark publication.
    pub async fn commit_state(&self, state: TxState) -> Result<Bookmark> {
        if !state.has_writes() && state.schema_changes.is_empty() {
            return Ok(self.current_bookmark());
        }

        let reserved: Vec<Vec<u8>> = {
            let mut pending = self.inner.pending_uniques.lock();
            self.inner.store.validate_uniques(&state)?;
            let mut reserved = Vec::new();
            for (key, _) in &state.unique_puts {
                if !pending.insert(key.clone()) {
                    for key in &reserved {
                        pending.remove(key);
                    }
                    return Err(Error::Transient(
                        "concurrent commit holds the same unique value".into(),
                    ));
                }
                reserved.push(key.clone());
            }
            reserved
        };

        let release = |inner: &GraphInner| {
            let mut pending = inner.pending_uniques.lock();
            for key in &reserved {
                pending.remove(key);
            }
        };

        let batch = state.to_batch();
        let seq = match self.inner.wal.commit(batch).await {
            Ok(seq) => seq,
            Err(e) => {
                release(&self.inner);
                return Err(e);
            }
        };

        for delta in state.effects.values() {
            if let Err(e) = self.inner.store.apply_delta_to_indexes(delta) {
                warn!(error = %e, "search index update failed after commit");
            }
        }
        for change in state.schema_changes.clone() {
            if let Err(e) = self.inner.store.apply_schema_change(change) {
                warn!(error = %e, "schema cache update failed after commit");
            }
        }

        release(&self.inner);
        self.inner.clock.advance(seq);
        self.inner.counters.commits.fetch_add(1, Ordering::Relaxed);
        Ok(Bookmark::from_seq(seq))
    }
}

fn eval_options(
    options: &std::collections::HashMap<String, crate::cypher::ast::Expr>,
) -> Result<std::collections::HashMap<String, Value>> {
    let params = PropertyMap::new();
    let ctx = crate::execution::eval::EvalCtx::new(&params);
    let row = std::collections::HashMap::new();
    let mut out = std::collections::HashMap::new();
    for (key, expr) in options {
        out.insert(
            key.clone(),
            crate::execution::eval::eval_expr(expr, &row, &ctx)?,
        );
    }
    Ok(out)
}

fn opt_usize(
    opts: &std::collections::HashMap<String, Value>,
    names: &[&str],
    default: usize,
) -> usize {
    names
        .iter()
        .find_map(|n| opts.get(*n).and_then(Value::as_int))
        .map_or(default, |v| v.max(1) as usize)
}

/// Explicit transaction handle with rollback-on-drop.
pub struct ExplicitTx<'g> {
    graph: &'g Graph,
    state: Option<TxState>,
}

impl ExplicitTx<'_> {
    pub async fn execute<P>(&mut self, query: &str, params: P) -> Result<QueryResult>
    where
        P: Into<PropertyMap>,
    {
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| Error::TxError("transaction already finished".into()))?;
        let result = self
            .graph
            .run_statement(state, query, params.into())
            .await;
        if result.is_err() {
            state.rollback_only = true;
        }
        result
    }

    pub async fn commit(mut self) -> Result<Bookmark> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::TxError("transaction already finished".into()))?;
        if state.rollback_only {
            return Err(Error::TxError(
                "transaction can only be rolled back after a failed statement".into(),
            ));
        }
        self.graph.commit_state(state).await
    }

    pub fn rollback(mut self) {
        self.state.take();
    }
}
