//! The simple-query ('Q') path.

use bytes::BytesMut;
use log::{debug, info};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cache::TempQueryCache;
use crate::config::get_config;
use crate::context::query::QueryContext;
use crate::context::session::{SentMessage, SentMessageKind, SentMessageState};
use crate::engine::command_complete::reconcile;
use crate::engine::Session;
use crate::errors::Error;
use crate::messages::{
    command_complete, empty_query_response, error_message_severity, frame, ready_for_query,
    simple_query, BytesMutReader,
};
use crate::parser::ast::Stmt;
use crate::parser::parse;

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_simple_query(&mut self, mut payload: BytesMut) -> Result<(), Error> {
        let (text, _) = payload.read_string()?;

        if text.trim().is_empty() {
            self.frontend.write_raw(&empty_query_response());
            self.frontend
                .write_raw(&ready_for_query(self.main_tx_status()));
            return Ok(());
        }

        let parsed = parse(&text)?;
        let mut qc = QueryContext::new(parsed, self.ctx.num_backends);
        self.route_statement(&mut qc).await?;
        let stmt = qc.query.stmt.clone();
        self.note_statement_intent(&stmt).await;

        // DROP DATABASE: the oid must be captured while the row still
        // exists; invalidation runs after the drop commits.
        let drop_db_oid = match &stmt {
            Stmt::DropDatabase { name } => self.lookup_database_oid(name).await,
            _ => None,
        };

        // A fingerprint hit answers the statement without touching any
        // backend.
        if qc.is_cache_safe && self.may_use_cache(&qc) {
            if let Some(cache) = self.env.cache.clone() {
                let key = crate::cache::fingerprint(&self.user, &qc.query.text, &self.database);
                if let Some(bytes) = cache.lookup(&key).await {
                    debug!("cache hit for {}", self.client);
                    self.frontend.write_raw(&bytes);
                    self.frontend
                        .write_raw(&ready_for_query(self.main_tx_status()));
                    return Ok(());
                }
            }
        }

        if qc.is_cache_safe {
            if let Some(cache) = &self.env.cache {
                qc.temp_cache = Some(TempQueryCache::new(cache.settings().maxcache));
            }
        }

        let targets: Vec<usize> = qc.where_to_send.iter().collect();
        if targets.is_empty() {
            return Err(Error::BackendDown(0));
        }
        let primary = self.primary_node()?;
        let handle = self.ctx.start_query(qc);

        // Send, honoring the standby rewrite.
        let config = get_config();
        for &node in &targets {
            let text_for_node = self
                .ctx
                .queries
                .get(handle)
                .map(|qc| qc.text_for_node(node, primary).to_string())
                .unwrap_or_else(|| text.clone());
            if config.general.log_per_node_statement {
                info!("node {node} statement: {text_for_node}");
            }
            let conn = self.backend_mut(node)?;
            conn.write_raw(&simple_query(&text_for_node));
            conn.flush().await?;
        }

        let error_seen = self.drain_simple(handle, &targets).await?;

        // Bookkeeping that depends on success.
        if !error_seen {
            match &stmt {
                Stmt::Prepare { name, .. } => {
                    self.ctx.add_sent_message(SentMessage {
                        kind: SentMessageKind::Query,
                        name: name.clone(),
                        bytes: simple_query(&text),
                        query_handle: handle,
                        state: SentMessageState::Created,
                    });
                }
                Stmt::Deallocate { name: Some(name) } => {
                    self.ctx.remove_sent_message(SentMessageKind::Query, name);
                    self.ctx.remove_sent_message(SentMessageKind::Parse, name);
                }
                Stmt::Deallocate { name: None } => self.ctx.remove_all_sent_messages(),
                Stmt::Discard { what } if what == "all" => self.ctx.remove_all_sent_messages(),
                Stmt::DropDatabase { .. } => {
                    if let (Some(cache), Some(oid)) = (self.env.cache.clone(), drop_db_oid) {
                        cache.invalidate_database(oid).await;
                    }
                }
                _ => {}
            }
            self.finish_temp_cache(handle).await;
        }

        let status = self.main_tx_status();
        self.handle_ready_for_query(status, Some(&stmt)).await;
        self.frontend.write_raw(&ready_for_query(status));
        Ok(())
    }

    /// Read every targeted backend to its ReadyForQuery, forwarding the
    /// virtual main node's frames and reconciling CommandComplete tags.
    /// Returns whether any backend reported an error.
    async fn drain_simple(
        &mut self,
        handle: crate::context::Handle,
        targets: &[usize],
    ) -> Result<bool, Error> {
        let fwd = self
            .ctx
            .queries
            .get(handle)
            .and_then(|qc| qc.virtual_main_node_id)
            .unwrap_or(targets[0]);
        let replicated = targets.len() > 1;

        let mut tags: Vec<(usize, String)> = Vec::new();
        let mut error_seen = false;

        // The forwarding backend first, then the rest.
        let mut order: Vec<usize> = vec![fwd];
        order.extend(targets.iter().copied().filter(|&n| n != fwd));

        for &node in &order {
            let forwarding = node == fwd;
            loop {
                let (kind, mut payload) = self.backend_mut(node)?.read_message().await?;
                match kind {
                    b'Z' => {
                        let status = payload.read_u8()?;
                        self.ctx.set_tx_state(node, status);
                        break;
                    }
                    b'C' => {
                        let (tag, _) = {
                            let mut copy = payload.clone();
                            copy.read_string()?
                        };
                        if replicated {
                            tags.push((node, tag));
                        } else if forwarding {
                            self.append_temp_cache(handle, kind, &payload);
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'E' => {
                        error_seen = true;
                        self.note_backend_error(node, &payload);
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        // Failed statements never populate the cache.
                        if let Some(qc) = self.ctx.queries.get_mut(handle) {
                            qc.temp_cache = None;
                        }
                    }
                    b'G' => {
                        // CopyInResponse: collect it from the other targets,
                        // then pump client data to everyone.
                        for &other in targets {
                            if other != node {
                                let (other_kind, _) =
                                    self.backend_mut(other)?.read_message().await?;
                                if other_kind != b'G' {
                                    debug!(
                                        "node {other} answered '{}' to COPY, expected CopyInResponse",
                                        other_kind as char
                                    );
                                }
                            }
                        }
                        self.frontend.write_raw(&frame(kind, &payload));
                        self.frontend.flush().await?;
                        self.copy_in(targets).await?;
                    }
                    b'H' | b'W' => {
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                            self.frontend.flush().await?;
                        }
                    }
                    b'd' | b'c' => {
                        // CopyOut data flows from the forwarding node only.
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'T' | b'D' => {
                        if forwarding {
                            self.append_temp_cache(handle, kind, &payload);
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'I' => {
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'N' | b'A' | b'S' => {
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    other => {
                        debug!("node {node}: unhandled response kind '{}'", other as char);
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                }
            }
        }

        // One CommandComplete for the client, and one divergence report if
        // the backends disagreed.
        if replicated && !tags.is_empty() {
            let reconciliation = reconcile(&tags);
            self.append_temp_cache_tag(handle, &reconciliation.tag);
            self.frontend
                .write_raw(&command_complete(&reconciliation.tag));
            if let Some(err) = reconciliation.mismatch {
                error_seen = true;
                self.frontend.write_raw(&error_message_severity(
                    &err.to_string(),
                    err.sqlstate(),
                    "ERROR",
                ));
            }
        }

        Ok(error_seen)
    }

    /// Pump CopyData from the client to every targeted backend until
    /// CopyDone or CopyFail.
    async fn copy_in(&mut self, targets: &[usize]) -> Result<(), Error> {
        loop {
            let (kind, payload) = self.frontend.read_message().await?;
            match kind {
                b'd' | b'c' | b'f' => {
                    for &node in targets {
                        let conn = self.backend_mut(node)?;
                        conn.write_message(kind, &payload);
                    }
                    if kind != b'd' {
                        for &node in targets {
                            self.backend_mut(node)?.flush().await?;
                        }
                        return Ok(());
                    }
                }
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected message '{}' during COPY",
                        other as char
                    )))
                }
            }
        }
    }

    pub(crate) fn append_temp_cache(
        &mut self,
        handle: crate::context::Handle,
        kind: u8,
        payload: &BytesMut,
    ) {
        if let Some(qc) = self.ctx.queries.get_mut(handle) {
            if let Some(temp) = qc.temp_cache.as_mut() {
                temp.append(kind, payload);
            }
        }
    }

    pub(crate) fn append_temp_cache_tag(&mut self, handle: crate::context::Handle, tag: &str) {
        if let Some(qc) = self.ctx.queries.get_mut(handle) {
            if let Some(temp) = qc.temp_cache.as_mut() {
                let mut payload = BytesMut::from(tag.as_bytes());
                payload.extend_from_slice(&[0]);
                temp.append(b'C', &payload);
            }
        }
    }

    async fn lookup_database_oid(&mut self, name: &str) -> Option<crate::parser::ast::Oid> {
        let node = self.primary_node().ok().flatten()?;
        let conn = self.backends[node].as_mut()?;
        let query = format!(
            "SELECT oid FROM pg_catalog.pg_database WHERE datname = '{}'",
            name.replace('\'', "''")
        );
        match conn.do_query(&query).await {
            Ok(result) => result.scalar().and_then(|oid| oid.parse().ok()),
            Err(_) => None,
        }
    }
}
