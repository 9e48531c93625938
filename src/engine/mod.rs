//! The per-session protocol engine.
//!
//! One `Session` per client connection, driven by a single task: read a
//! frontend message, classify and route it, converse with the selected
//! backends, reconcile and forward the responses. Everything here is
//! sequential from the session's viewpoint; the only shared state is the
//! cluster status array, the cache, and the cancel map.

pub mod cancel;
pub mod command_complete;
pub mod extended;
pub mod simple;

use std::sync::Arc;

use ahash::AHashMap;
use bytes::BytesMut;
use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::{authenticate_frontend, AuthContext};
use crate::auth::passwords::StoredPassword;
use crate::backend::{BackendConnection, Cluster};
use crate::cache::{CacheKey, QueryCache};
use crate::config::{get_config, ClusterMode, Config};
use crate::context::query::{NodeMask, QueryContext};
use crate::context::session::SessionContext;
use crate::engine::cancel::{CancelMap, CancelTarget};
use crate::errors::{ClientIdentifier, Error};
use crate::interlock::Interlock;
use crate::messages::constants::*;
use crate::messages::{
    backend_key_data, error_message, error_message_severity, parse_startup_params,
    ready_for_query, server_parameter_message, PgErrorMsg, WireStream,
};
use crate::parser::ast::{IsolationLevel, Oid, Stmt, TableRef, TransactionVerb};
use crate::router::{relcache_lookup_query, relinfo_from_row, RelInfo, Relcache, RoutingEnv};

/// Process-wide collaborators handed to every session.
#[derive(Clone)]
pub struct SessionEnv {
    pub cluster: Arc<Cluster>,
    pub interlock: Arc<Interlock>,
    pub cache: Option<Arc<QueryCache>>,
    pub cancel_map: Arc<CancelMap>,
    pub auth: Arc<AuthContext>,
}

/// A cache insert waiting for COMMIT before it becomes visible.
pub(crate) struct PendingCacheCommit {
    pub key: CacheKey,
    pub data: BytesMut,
    pub table_oids: Vec<Oid>,
}

pub struct Session<S> {
    pub(crate) frontend: WireStream<S>,
    pub(crate) backends: Vec<Option<BackendConnection>>,
    pub(crate) ctx: SessionContext,
    pub(crate) env: SessionEnv,
    pub(crate) client: ClientIdentifier,
    pub(crate) user: String,
    pub(crate) database: String,
    pub(crate) database_oid: Oid,
    pub(crate) relcache: Relcache,
    /// The pooler-issued cancellation pair for this client.
    pub(crate) process_id: i32,
    pub(crate) secret_key: i32,
    /// Table oids written in the open transaction, invalidated at COMMIT.
    pub(crate) pending_invalidations: Vec<Oid>,
    /// Cache inserts held back until COMMIT.
    pub(crate) pending_cache_commits: Vec<PendingCacheCommit>,
    /// Backends that errored and discard messages until the next Sync.
    pub(crate) ignore_till_sync: NodeMask,
    /// Backends that received extended-protocol traffic since the last
    /// ReadyForQuery; Sync and Flush fan out to exactly these.
    pub(crate) extended_targets: NodeMask,
}

/// Outcome of the startup packet exchange.
enum Startup {
    Session { params: Vec<(String, String)> },
    Cancel { process_id: i32, secret_key: i32 },
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Drive the startup packet exchange, authenticate the client, connect
    /// the backends, and send the ready preamble. Returns `None` for a
    /// cancel connection (served and closed on the spot).
    pub async fn establish(
        stream: S,
        peer: &str,
        session_id: u64,
        env: SessionEnv,
    ) -> Result<Option<Session<S>>, Error> {
        let config = get_config();
        let mut frontend = WireStream::new(stream);

        let params = match read_startup(&mut frontend).await? {
            Startup::Cancel {
                process_id,
                secret_key,
            } => {
                env.cancel_map.cancel(process_id, secret_key).await;
                return Ok(None);
            }
            Startup::Session { params } => params,
        };

        let get = |key: &str| {
            params
                .iter()
                .find(|(name, _)| name == key)
                .map(|(_, value)| value.clone())
        };
        let user = get("user").unwrap_or_default();
        let database = get("database").unwrap_or_else(|| user.clone());
        let application_name =
            get("application_name").unwrap_or_else(|| config.general.application_name.clone());
        let client = ClientIdentifier::new(&application_name, &user, &database, peer);

        if config.general.log_client_connections {
            info!("client connected: {client}");
        }

        authenticate_frontend(&mut frontend, &user, &client, &env.auth).await?;

        let mut session = Session {
            frontend,
            backends: Vec::new(),
            ctx: SessionContext::new(
                session_id,
                env.cluster.num_backends(),
                env.cluster.select_load_balance_node(session_id),
            ),
            env,
            client,
            user,
            database,
            database_oid: 0,
            relcache: Relcache::new(256),
            process_id: session_id as i32 & 0x7fff_ffff,
            secret_key: rand::random::<i32>() & 0x7fff_ffff,
            pending_invalidations: Vec::new(),
            pending_cache_commits: Vec::new(),
            ignore_till_sync: NodeMask::empty(),
            extended_targets: NodeMask::empty(),
        };

        session.connect_backends(&config, &application_name).await?;
        session.register_cancel_targets();
        session.resolve_database_oid().await;
        session.send_ready_preamble().await?;
        Ok(Some(session))
    }

    async fn connect_backends(
        &mut self,
        config: &Config,
        application_name: &str,
    ) -> Result<(), Error> {
        let password = self.backend_password(config)?;
        let username = config
            .auth
            .server_username
            .clone()
            .unwrap_or_else(|| self.user.clone());

        for node_id in 0..self.env.cluster.num_backends() {
            if !self.env.cluster.is_up(node_id) {
                self.backends.push(None);
                continue;
            }
            let slot = self.env.cluster.slot(node_id);
            match BackendConnection::connect(
                node_id,
                slot,
                &username,
                &password,
                &self.database,
                application_name,
                config.general.connect_timeout,
            )
            .await
            {
                Ok(conn) => self.backends.push(Some(conn)),
                Err(err) => {
                    warn!("backend {node_id} connection failed: {err}");
                    self.backends.push(None);
                }
            }
        }

        if self.backends.iter().all(|b| b.is_none()) {
            return Err(Error::BackendDown(0));
        }
        Ok(())
    }

    /// The password presented to backends: the configured server password,
    /// or the client's stored plaintext when the store has one.
    fn backend_password(&self, config: &Config) -> Result<String, Error> {
        if let Some(password) = &config.auth.server_password {
            return Ok(password.clone());
        }
        match self.env.auth.store.lookup(&self.user) {
            Some(stored @ (StoredPassword::Plain(_) | StoredPassword::AesEncrypted(_))) => {
                self.env.auth.store.resolve_plaintext(stored)
            }
            _ => Ok(String::new()),
        }
    }

    fn register_cancel_targets(&self) {
        let targets: Vec<CancelTarget> = self
            .backends
            .iter()
            .flatten()
            .map(|conn| CancelTarget {
                host: conn.identifier.host.clone(),
                port: conn.identifier.port,
                pid: conn.pid,
                secret_key: conn.secret_key,
            })
            .collect();
        self.env
            .cancel_map
            .register(self.process_id, self.secret_key, targets);
    }

    async fn resolve_database_oid(&mut self) {
        if self.env.cache.is_none() {
            return;
        }
        let query = format!(
            "SELECT oid FROM pg_catalog.pg_database WHERE datname = '{}'",
            self.database.replace('\'', "''")
        );
        if let Ok(Some(node)) = self.primary_node() {
            if let Some(conn) = self.backends[node].as_mut() {
                match conn.do_query(&query).await {
                    Ok(result) => {
                        self.database_oid = result
                            .scalar()
                            .and_then(|oid| oid.parse().ok())
                            .unwrap_or(0);
                    }
                    Err(err) => warn!("could not resolve database oid: {err}"),
                }
            }
        }
    }

    /// AuthenticationOk was already queued; follow with parameters, the
    /// pooler's BackendKeyData, and ReadyForQuery.
    async fn send_ready_preamble(&mut self) -> Result<(), Error> {
        for (key, value) in [
            ("server_version", "15.0 (pg_relay)"),
            ("server_encoding", "UTF8"),
            ("client_encoding", "UTF8"),
            ("DateStyle", "ISO, MDY"),
            ("integer_datetimes", "on"),
            ("standard_conforming_strings", "on"),
        ] {
            self.frontend
                .write_raw(&server_parameter_message(key, value));
        }
        self.frontend
            .write_raw(&backend_key_data(self.process_id, self.secret_key));
        self.frontend.write_raw(&ready_for_query(b'I'));
        self.frontend.flush().await
    }

    /// The main statement loop.
    pub async fn run(&mut self) -> Result<(), Error> {
        loop {
            self.frontend.flush().await?;
            self.env.interlock.begin_statement().await?;

            let (kind, payload) = self.frontend.read_message().await?;
            let result = match kind {
                b'Q' => self.handle_simple_query(payload).await,
                b'P' | b'B' | b'D' | b'E' | b'C' | b'H' | b'S' => {
                    self.handle_extended_message(kind, payload).await
                }
                b'X' => {
                    debug!("client {} sent Terminate", self.client);
                    return Ok(());
                }
                b'p' => Err(Error::ProtocolViolation(
                    "password message outside authentication".into(),
                )),
                other => Err(Error::ProtocolViolation(format!(
                    "unexpected frontend message '{}'",
                    other as char
                ))),
            };

            match result {
                Ok(()) => {}
                Err(err) if err.is_fatal_for_session() => return Err(err),
                Err(err) => {
                    // Recoverable: report and keep the session alive. For
                    // extended-protocol messages the ReadyForQuery waits
                    // for the client's Sync.
                    warn!("statement failed for {}: {err}", self.client);
                    self.frontend
                        .write_raw(&error_message_severity(&err.to_string(), err.sqlstate(), "ERROR"));
                    if kind == b'Q' {
                        let status = self.main_tx_status();
                        self.frontend.write_raw(&ready_for_query(status));
                    }
                }
            }
        }
    }

    /// Best-effort teardown: cancel in-flight work, roll back open
    /// transactions, unregister from the cancel map.
    pub async fn teardown(&mut self) {
        // A client that vanished mid-statement leaves work running on the
        // backends; cancel it before rolling back.
        if self.ctx.in_progress().is_some() || self.ctx.has_pending() {
            self.env
                .cancel_map
                .cancel(self.process_id, self.secret_key)
                .await;
        }
        self.env
            .cancel_map
            .unregister(self.process_id, self.secret_key);

        let primary = self.primary_node().ok().flatten();
        if let Some(node) = primary {
            if self.ctx.in_transaction_on(node) {
                if let Some(conn) = self.backends[node].as_mut() {
                    if let Err(err) = conn.do_query("ROLLBACK").await {
                        debug!("rollback at teardown failed: {err}");
                    }
                }
            }
        }
    }

    // --- shared helpers ---

    /// The write node for the current mode, `Ok(None)` only in raw mode.
    pub(crate) fn primary_node(&self) -> Result<Option<usize>, Error> {
        match self.env.cluster.mode() {
            ClusterMode::Raw => Ok(self.env.cluster.main_node_id()),
            _ => self.env.cluster.primary_or_main().map(Some),
        }
    }

    pub(crate) fn main_tx_status(&self) -> u8 {
        match self.primary_node() {
            Ok(Some(node)) => self.ctx.tx_state(node),
            _ => b'I',
        }
    }

    /// Resolve relcache entries for the given tables, querying the primary
    /// on misses. Returns a snapshot for the router's closure.
    pub(crate) async fn resolve_relations(
        &mut self,
        tables: &[TableRef],
    ) -> AHashMap<String, RelInfo> {
        let mut snapshot = AHashMap::new();
        for table in tables {
            if let Some(info) = self.relcache.get(table) {
                snapshot.insert(table.qualified_name(), info);
                continue;
            }
            let Ok(Some(node)) = self.primary_node() else {
                continue;
            };
            let Some(conn) = self.backends[node].as_mut() else {
                continue;
            };
            match conn.do_query(&relcache_lookup_query(table)).await {
                Ok(result) => {
                    if let Some(row) = result.rows.first() {
                        if let (Some(Some(oid)), Some(Some(persistence))) =
                            (row.first(), row.get(1))
                        {
                            if let Some(info) = relinfo_from_row(oid, persistence) {
                                self.relcache.insert(table, info);
                                snapshot.insert(table.qualified_name(), info);
                            }
                        }
                    }
                }
                Err(err) => debug!("relcache lookup for {table} failed: {err}"),
            }
        }
        snapshot
    }

    /// Lazily resolve the transaction isolation level from the primary.
    pub(crate) async fn ensure_transaction_isolation(&mut self) {
        let Ok(Some(node)) = self.primary_node() else {
            return;
        };
        if !self.ctx.in_transaction_on(node) || self.ctx.transaction_isolation.is_some() {
            return;
        }
        if let Some(conn) = self.backends[node].as_mut() {
            if let Ok(result) = conn.do_query("SHOW transaction_isolation").await {
                self.ctx.transaction_isolation = Some(match result.scalar() {
                    Some("serializable") => IsolationLevel::Serializable,
                    Some("repeatable read") => IsolationLevel::RepeatableRead,
                    Some("read committed") => IsolationLevel::ReadCommitted,
                    _ => IsolationLevel::Default,
                });
            }
        }
    }

    /// Route a freshly parsed statement into its query context.
    pub(crate) async fn route_statement(&mut self, qc: &mut QueryContext) -> Result<(), Error> {
        let config = get_config();

        // Relation info the router may consult.
        let tables: Vec<TableRef> = match &qc.query.stmt {
            Stmt::Select(select) => select.tables.clone(),
            _ => Vec::new(),
        };
        let snapshot = self.resolve_relations(&tables).await;
        self.ensure_transaction_isolation().await;

        let backend_pids: Vec<i32> = self
            .backends
            .iter()
            .map(|conn| conn.as_ref().map(|c| c.pid).unwrap_or(0))
            .collect();

        let env = RoutingEnv {
            cluster: &self.env.cluster,
            routing: &config.routing,
            backend_pids: &backend_pids,
            rel_info: &|table: &TableRef| snapshot.get(&table.qualified_name()).copied(),
            lb_roll: rand::random(),
        };
        crate::router::where_to_send(&env, &mut self.ctx, qc)?;

        // Cache safety, decided once per statement.
        if let Some(cache) = &self.env.cache {
            if let Stmt::Select(select) = &qc.query.stmt {
                let session = &self.ctx;
                let table_is_volatile = |table: &TableRef| {
                    session.has_temp_table(&table.name)
                        || snapshot
                            .get(&table.qualified_name())
                            .is_some_and(|info| info.is_temp || info.is_unlogged)
                };
                qc.is_cache_safe = !qc.query.is_multi_statement
                    && crate::router::is_cacheable(
                        select,
                        &config.routing,
                        cache.settings(),
                        &table_is_volatile,
                    );
            }
        }
        Ok(())
    }

    /// Bookkeeping common to both query paths, applied before sending:
    /// temp-table intents, write latching, invalidation oids.
    pub(crate) async fn note_statement_intent(&mut self, stmt: &Stmt) {
        if stmt.is_write() {
            if let Ok(Some(node)) = self.primary_node() {
                if self.ctx.in_transaction_on(node) {
                    self.ctx.set_writing_transaction();
                }
            }
            // Oids for invalidation at commit, resolved while the relations
            // still exist.
            if self
                .env
                .cache
                .as_ref()
                .is_some_and(|c| c.settings().auto_invalidation)
            {
                let tables = crate::router::written_tables(stmt);
                let snapshot = self.resolve_relations(&tables).await;
                for table in &tables {
                    if let Some(info) = snapshot.get(&table.qualified_name()) {
                        self.pending_invalidations.push(info.oid);
                    }
                }
            }
        }

        match stmt {
            Stmt::CreateTable {
                table, temp: true, ..
            } => self.ctx.temp_table_creating(&table.name),
            Stmt::DropTable { tables } => {
                for table in tables {
                    self.ctx.temp_table_dropping(&table.name);
                    self.relcache.forget(table);
                }
            }
            Stmt::AlterTable { table } => self.relcache.forget(table),
            _ => {}
        }
    }

    /// ReadyForQuery observed on the session's main backend: settle
    /// transaction state, flush cache work, reset the pending queue.
    pub(crate) async fn handle_ready_for_query(&mut self, status: u8, stmt: Option<&Stmt>) {
        let ended = match stmt {
            Some(Stmt::Transaction(TransactionVerb::Commit)) => Some(true),
            Some(Stmt::Transaction(TransactionVerb::Rollback)) => Some(false),
            _ if status == b'I' => Some(true),
            _ => None,
        };

        match ended {
            Some(true) => {
                self.ctx.transaction_ended(true);
                self.commit_cache_work().await;
            }
            Some(false) => {
                self.ctx.transaction_ended(false);
                self.pending_invalidations.clear();
                self.pending_cache_commits.clear();
            }
            None => {}
        }

        self.ctx.reset_pending();
        self.ctx.unset_query_in_progress();
        self.ignore_till_sync.clear();
    }

    /// Apply held-back cache inserts and invalidations.
    async fn commit_cache_work(&mut self) {
        let Some(cache) = self.env.cache.clone() else {
            self.pending_invalidations.clear();
            self.pending_cache_commits.clear();
            return;
        };

        let invalidations = std::mem::take(&mut self.pending_invalidations);
        if !invalidations.is_empty() {
            cache
                .invalidate_tables(self.database_oid, &invalidations)
                .await;
        }

        for commit in std::mem::take(&mut self.pending_cache_commits) {
            if let Err(err) = cache
                .insert(
                    commit.key,
                    &commit.data,
                    self.database_oid,
                    &commit.table_oids,
                )
                .await
            {
                error!("cache commit failed: {err}");
            }
        }
    }

    /// Queue or apply one finished temp cache buffer.
    pub(crate) async fn finish_temp_cache(&mut self, handle: crate::context::Handle) {
        let Some(cache) = self.env.cache.clone() else {
            return;
        };

        let (temp, text, select_tables) = match self.ctx.queries.get_mut(handle) {
            Some(qc) => {
                let tables = match &qc.query.stmt {
                    Stmt::Select(select) => select.tables.clone(),
                    _ => return,
                };
                (qc.temp_cache.take(), qc.query.text.clone(), tables)
            }
            None => return,
        };
        let Some(temp) = temp else {
            return;
        };
        let Some(data) = temp.into_bytes() else {
            return;
        };

        let snapshot = self.resolve_relations(&select_tables).await;
        let table_oids: Vec<Oid> = select_tables
            .iter()
            .filter_map(|t| snapshot.get(&t.qualified_name()).map(|info| info.oid))
            .collect();

        let key = crate::cache::fingerprint(&self.user, &text, &self.database);
        let in_transaction = self
            .primary_node()
            .ok()
            .flatten()
            .map(|node| self.ctx.in_transaction_on(node))
            .unwrap_or(false);

        if in_transaction {
            self.pending_cache_commits.push(PendingCacheCommit {
                key,
                data,
                table_oids,
            });
        } else if let Err(err) = cache
            .insert(key, &data, self.database_oid, &table_oids)
            .await
        {
            error!("cache insert failed: {err}");
        }
    }

    /// Whether a cache lookup may serve this statement.
    pub(crate) fn may_use_cache(&self, qc: &QueryContext) -> bool {
        if !qc.is_cache_safe || self.ctx.failed_transaction {
            return false;
        }
        // Inside a transaction that already wrote, a hit could predate our
        // own writes.
        match self.primary_node() {
            Ok(Some(node)) => {
                !(self.ctx.in_transaction_on(node) && self.ctx.is_writing_transaction())
            }
            _ => true,
        }
    }

    /// Forward one backend error to the client and update failure latches.
    pub(crate) fn note_backend_error(&mut self, node_id: usize, payload: &BytesMut) {
        if let Ok(msg) = PgErrorMsg::parse(payload) {
            debug!(
                "backend {node_id} error {}: {}",
                msg.code, msg.message
            );
        }
        if let Ok(Some(primary)) = self.primary_node() {
            if node_id == primary && self.ctx.in_transaction_on(primary) {
                self.ctx.failed_transaction = true;
            }
        }
    }

    pub(crate) fn backend_mut(&mut self, node_id: usize) -> Result<&mut BackendConnection, Error> {
        self.backends
            .get_mut(node_id)
            .and_then(|conn| conn.as_mut())
            .ok_or(Error::BackendDown(node_id))
    }
}

/// Read startup packets until a real StartupMessage arrives: SSLRequest is
/// answered with `N`, CancelRequest short-circuits, protocol 2 is refused.
async fn read_startup<S>(frontend: &mut WireStream<S>) -> Result<Startup, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    use bytes::Buf;
    loop {
        let (version, mut body) = frontend.read_startup().await?;
        match version {
            SSL_REQUEST_CODE => {
                // No TLS; the client may retry in the clear.
                frontend.write_raw(b"N");
                frontend.flush().await?;
            }
            CANCEL_REQUEST_CODE => {
                if body.remaining() < 8 {
                    return Err(Error::ProtocolViolation(
                        "cancel request packet too short".into(),
                    ));
                }
                return Ok(Startup::Cancel {
                    process_id: body.get_i32(),
                    secret_key: body.get_i32(),
                });
            }
            PROTOCOL_VERSION_3 => {
                let params = parse_startup_params(&body)?;
                return Ok(Startup::Session { params });
            }
            PROTOCOL_VERSION_2 => {
                let err = error_message("protocol version 2 is not supported", "0A000");
                frontend.write_raw(&err);
                frontend.flush().await?;
                return Err(Error::FeatureNotSupported(
                    "protocol version 2 is not supported".into(),
                ));
            }
            other => {
                return Err(Error::ProtocolViolation(format!(
                    "unrecognized startup packet version {other}"
                )))
            }
        }
    }
}
