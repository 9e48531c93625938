//! The extended-query pipeline: Parse/Bind/Describe/Execute/Close/Sync.
//!
//! Client messages are forwarded to the routed backends and recorded in the
//! pending FIFO; responses are consumed strictly in that order. In
//! streaming-replication mode an internal Flush follows Parse, Execute and
//! Close so backend errors surface early; otherwise responses wait for the
//! client's own Flush or Sync.

use bytes::{BufMut, BytesMut};
use log::{debug, warn};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::cache::TempQueryCache;
use crate::config::ClusterMode;
use crate::context::query::{BackendStmtState, NodeMask, QueryContext};
use crate::context::session::{
    PendingKind, PendingMessage, SentMessage, SentMessageKind, SentMessageState,
};
use crate::context::Handle;
use crate::engine::command_complete::reconcile;
use crate::engine::Session;
use crate::errors::Error;
use crate::messages::{
    command_complete, error_message_severity, flush_message, frame, ready_for_query, sync_message,
    BytesMutReader,
};
use crate::parser::parse;

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) async fn handle_extended_message(
        &mut self,
        kind: u8,
        payload: BytesMut,
    ) -> Result<(), Error> {
        match kind {
            b'P' => self.handle_parse(payload).await,
            b'B' => self.handle_bind(payload).await,
            b'D' => self.handle_describe(payload).await,
            b'E' => self.handle_execute(payload).await,
            b'C' => self.handle_close(payload).await,
            b'H' => self.handle_flush().await,
            b'S' => self.handle_sync().await,
            _ => unreachable!("dispatched by the run loop"),
        }
    }

    /// True when Parse/Execute/Close are chased with an internal Flush for
    /// early error detection.
    fn early_flush(&self) -> bool {
        self.env.cluster.mode() == ClusterMode::StreamingReplication
    }

    async fn handle_parse(&mut self, payload: BytesMut) -> Result<(), Error> {
        let (name, query_text, tail) = split_parse_payload(&payload)?;

        let parsed = parse(&query_text)?;
        let mut qc = QueryContext::new(parsed, self.ctx.num_backends);
        self.route_statement(&mut qc).await?;

        let targets: Vec<usize> = qc.where_to_send.iter().collect();
        if targets.is_empty() {
            return Err(Error::BackendDown(0));
        }
        let primary = self.primary_node()?;
        let rewritten = qc.rewritten_query.clone();
        let handle = self.ctx.start_query(qc);

        // Named or not, the statement is retained so Bind/Describe find it;
        // the unnamed entry is implicitly overwritten by the next Parse.
        self.ctx.add_sent_message(SentMessage {
            kind: SentMessageKind::Parse,
            name: name.clone(),
            bytes: frame(b'P', &payload),
            query_handle: handle,
            state: SentMessageState::Created,
        });

        let early_flush = self.early_flush();
        for &node in &targets {
            let body = match (&rewritten, primary) {
                (Some(rewritten), Some(p)) if node != p => {
                    rebuild_parse_payload(&name, rewritten, &tail)
                }
                _ => payload.clone(),
            };
            let conn = self.backend_mut(node)?;
            conn.write_message(b'P', &body);
            if early_flush {
                conn.write_raw(&flush_message());
            }
            conn.flush().await?;
        }

        self.extended_targets_extend(&targets);
        self.ctx.push_pending(PendingMessage {
            kind: PendingKind::Parse,
            bytes: frame(b'P', &payload),
            query_text,
            statement_name: Some(name),
            portal_name: None,
            sent_to: NodeMask::from_iter(targets.iter().copied()),
            query_handle: Some(handle),
            flush_pending: early_flush,
            not_forward_to_frontend: false,
            from_cache: false,
        });

        if early_flush {
            self.drain_pending_queue().await?;
        }
        Ok(())
    }

    async fn handle_bind(&mut self, payload: BytesMut) -> Result<(), Error> {
        let (portal, statement) = split_bind_names(&payload)?;

        let (handle, stored_parse) = match self.ctx.get_sent_message(SentMessageKind::Parse, &statement)
        {
            Some(sent) => (sent.query_handle, sent.bytes.clone()),
            None => {
                return Err(Error::ClientError(format!(
                    "prepared statement \"{statement}\" does not exist"
                )))
            }
        };
        self.ctx.set_query_in_progress(handle);

        let targets: Vec<usize> = match self.ctx.queries.get(handle) {
            Some(qc) => qc.where_to_send.iter().collect(),
            None => return Err(Error::ClientError("statement context vanished".into())),
        };

        // A backend that never saw the Parse (down or re-elected at Parse
        // time) gets it re-issued now; its ParseComplete is swallowed so
        // the client sees exactly one.
        for &node in &targets {
            let state = self
                .ctx
                .queries
                .get(handle)
                .map(|qc| qc.backend_state(node))
                .unwrap_or(BackendStmtState::Unparsed);
            if state == BackendStmtState::Unparsed && !stored_parse.is_empty() {
                debug!("re-issuing Parse of \"{statement}\" on node {node} before Bind");
                let conn = self.backend_mut(node)?;
                conn.write_raw(&stored_parse);
                conn.write_raw(&flush_message());
                conn.flush().await?;
                self.ctx.push_pending(PendingMessage {
                    kind: PendingKind::Parse,
                    bytes: stored_parse.clone(),
                    query_text: String::new(),
                    statement_name: Some(statement.clone()),
                    portal_name: None,
                    sent_to: NodeMask::from_iter([node]),
                    query_handle: Some(handle),
                    flush_pending: true,
                    not_forward_to_frontend: true,
                    from_cache: false,
                });
            }
        }

        if !portal.is_empty() {
            self.ctx.add_sent_message(SentMessage {
                kind: SentMessageKind::Portal,
                name: portal.clone(),
                bytes: frame(b'B', &payload),
                query_handle: handle,
                state: SentMessageState::Created,
            });
        }

        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_message(b'B', &payload);
            conn.flush().await?;
        }

        self.extended_targets_extend(&targets);
        self.ctx.push_pending(PendingMessage {
            kind: PendingKind::Bind,
            bytes: frame(b'B', &payload),
            query_text: String::new(),
            statement_name: Some(statement),
            portal_name: Some(portal),
            sent_to: NodeMask::from_iter(targets.iter().copied()),
            query_handle: Some(handle),
            flush_pending: false,
            not_forward_to_frontend: false,
            from_cache: false,
        });

        Ok(())
    }

    async fn handle_describe(&mut self, payload: BytesMut) -> Result<(), Error> {
        let (target, name) = split_describe_payload(&payload)?;

        let handle = if target == b'S' {
            self.ctx
                .get_sent_message(SentMessageKind::Parse, &name)
                .map(|m| m.query_handle)
        } else {
            self.ctx
                .get_sent_message(SentMessageKind::Portal, &name)
                .map(|m| m.query_handle)
                .or_else(|| self.ctx.in_progress())
        };
        let handle = handle.ok_or_else(|| {
            Error::ClientError(format!(
                "{} \"{name}\" does not exist",
                if target == b'S' { "prepared statement" } else { "portal" }
            ))
        })?;
        self.ctx.set_query_in_progress(handle);

        let targets: Vec<usize> = match self.ctx.queries.get(handle) {
            Some(qc) => qc.where_to_send.iter().collect(),
            None => return Err(Error::ClientError("statement context vanished".into())),
        };

        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_message(b'D', &payload);
            conn.flush().await?;
        }

        self.extended_targets_extend(&targets);
        self.ctx.push_pending(PendingMessage {
            kind: PendingKind::Describe,
            bytes: frame(b'D', &payload),
            query_text: String::new(),
            statement_name: (target == b'S').then(|| name.clone()),
            portal_name: (target == b'P').then(|| name.clone()),
            sent_to: NodeMask::from_iter(targets.iter().copied()),
            query_handle: Some(handle),
            flush_pending: false,
            not_forward_to_frontend: false,
            from_cache: false,
        });
        Ok(())
    }

    async fn handle_execute(&mut self, payload: BytesMut) -> Result<(), Error> {
        let portal = split_execute_portal(&payload)?;

        let handle = if portal.is_empty() {
            self.ctx.in_progress()
        } else {
            self.ctx
                .get_sent_message(SentMessageKind::Portal, &portal)
                .map(|m| m.query_handle)
        };
        let handle = handle.ok_or_else(|| {
            Error::ClientError(format!("portal \"{portal}\" does not exist"))
        })?;
        self.ctx.set_query_in_progress(handle);

        let (targets, stmt, text, is_cache_safe) = match self.ctx.queries.get(handle) {
            Some(qc) => (
                qc.where_to_send.iter().collect::<Vec<usize>>(),
                qc.query.stmt.clone(),
                qc.query.text.clone(),
                qc.is_cache_safe,
            ),
            None => return Err(Error::ClientError("portal context vanished".into())),
        };
        self.note_statement_intent(&stmt).await;

        // Cache hit: inject the stored frames into the target backend's
        // read stream instead of executing. The pipeline then consumes them
        // exactly as if the backend had replied, preserving ordering.
        if is_cache_safe {
            let usable = self
                .ctx
                .queries
                .get(handle)
                .map(|qc| self.may_use_cache(qc))
                .unwrap_or(false);
            if usable {
                if let Some(cache) = self.env.cache.clone() {
                    let key = crate::cache::fingerprint(&self.user, &text, &self.database);
                    if let Some(bytes) = cache.lookup(&key).await {
                        debug!("extended-protocol cache hit for {}", self.client);
                        let node = targets.first().copied().ok_or(Error::BackendDown(0))?;
                        self.inject_cached_frames(node, &bytes)?;
                        self.extended_targets_extend(&targets);
                        self.ctx.push_pending(PendingMessage {
                            kind: PendingKind::Execute,
                            bytes: frame(b'E', &payload),
                            query_text: text,
                            statement_name: None,
                            portal_name: Some(portal),
                            sent_to: NodeMask::from_iter([node]),
                            query_handle: Some(handle),
                            flush_pending: true,
                            not_forward_to_frontend: false,
                            from_cache: true,
                        });
                        return self.drain_pending_queue().await;
                    }
                }
            }
            // Miss: start collecting for the commit at ReadyForQuery.
            if let Some(cache) = &self.env.cache {
                let maxcache = cache.settings().maxcache;
                if let Some(qc) = self.ctx.queries.get_mut(handle) {
                    if qc.temp_cache.is_none() {
                        qc.temp_cache = Some(TempQueryCache::new(maxcache));
                    }
                }
            }
        }

        let early_flush = self.early_flush();
        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_message(b'E', &payload);
            if early_flush {
                conn.write_raw(&flush_message());
            }
            conn.flush().await?;
        }

        self.extended_targets_extend(&targets);
        self.ctx.push_pending(PendingMessage {
            kind: PendingKind::Execute,
            bytes: frame(b'E', &payload),
            query_text: text,
            statement_name: None,
            portal_name: Some(portal),
            sent_to: NodeMask::from_iter(targets.iter().copied()),
            query_handle: Some(handle),
            flush_pending: early_flush,
            not_forward_to_frontend: false,
            from_cache: false,
        });

        if early_flush {
            self.drain_pending_queue().await?;
        }
        Ok(())
    }

    async fn handle_close(&mut self, payload: BytesMut) -> Result<(), Error> {
        let (target, name) = split_describe_payload(&payload)?;

        let kind = if target == b'S' {
            SentMessageKind::Parse
        } else {
            SentMessageKind::Portal
        };
        let handle = self.ctx.get_sent_message(kind, &name).map(|m| m.query_handle);

        // Close of an unknown name still goes to the backends; they answer
        // CloseComplete regardless.
        let targets: Vec<usize> = match handle.and_then(|h| self.ctx.queries.get(h)) {
            Some(qc) => qc.where_to_send.iter().collect(),
            None => (0..self.ctx.num_backends)
                .filter(|&n| self.env.cluster.is_up(n) && self.backends[n].is_some())
                .collect(),
        };

        let early_flush = self.early_flush();
        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_message(b'C', &payload);
            if early_flush {
                conn.write_raw(&flush_message());
            }
            conn.flush().await?;
        }

        self.extended_targets_extend(&targets);
        self.ctx.push_pending(PendingMessage {
            kind: PendingKind::Close,
            bytes: frame(b'C', &payload),
            query_text: String::new(),
            statement_name: (target == b'S').then(|| name.clone()),
            portal_name: (target == b'P').then(|| name.clone()),
            sent_to: NodeMask::from_iter(targets.iter().copied()),
            query_handle: handle,
            flush_pending: early_flush,
            not_forward_to_frontend: false,
            from_cache: false,
        });

        if early_flush {
            self.drain_pending_queue().await?;
        }
        Ok(())
    }

    /// Client Flush: force responses out of every involved backend, drain
    /// the queue, and pass the result on.
    async fn handle_flush(&mut self) -> Result<(), Error> {
        let targets: Vec<usize> = self.extended_targets.iter().collect();
        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_raw(&flush_message());
            conn.flush().await?;
        }
        self.drain_pending_queue().await?;
        self.frontend.flush().await
    }

    /// Client Sync: drain everything, collect ReadyForQuery from every
    /// involved backend, forward exactly one.
    async fn handle_sync(&mut self) -> Result<(), Error> {
        let targets: Vec<usize> = self.extended_targets.iter().collect();

        if targets.is_empty() {
            // Nothing was in flight; answer directly.
            self.frontend
                .write_raw(&ready_for_query(self.main_tx_status()));
            return self.frontend.flush().await;
        }

        for &node in &targets {
            let conn = self.backend_mut(node)?;
            conn.write_raw(&sync_message());
            conn.flush().await?;
        }

        self.drain_pending_queue().await?;

        // Now the ReadyForQuery barrier.
        for &node in &targets {
            loop {
                let (kind, mut payload) = self.backend_mut(node)?.read_message().await?;
                match kind {
                    b'Z' => {
                        let status = payload.read_u8()?;
                        self.ctx.set_tx_state(node, status);
                        break;
                    }
                    b'E' => {
                        self.note_backend_error(node, &payload);
                        // An error here was not yet forwarded (it raced the
                        // Sync); the first target reports it.
                        if Some(node) == targets.first().copied() {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    other => {
                        debug!(
                            "node {node}: discarding '{}' while waiting for ReadyForQuery",
                            other as char
                        );
                    }
                }
            }
        }

        let in_progress = self.ctx.in_progress();
        let failed = self.ctx.failed_transaction;
        if let Some(handle) = in_progress {
            if !failed {
                self.finish_temp_cache(handle).await;
            }
        }

        let status = self.main_tx_status();
        let stmt = self
            .ctx
            .current_query()
            .map(|qc| qc.query.stmt.clone());
        self.handle_ready_for_query(status, stmt.as_ref()).await;
        self.extended_targets.clear();

        self.frontend.write_raw(&ready_for_query(status));
        self.frontend.flush().await
    }

    fn extended_targets_extend(&mut self, targets: &[usize]) {
        for &node in targets {
            self.extended_targets.set(node);
        }
    }

    /// Split a cached buffer back into frames and push them onto the
    /// backend's read stream, first frame on top.
    fn inject_cached_frames(&mut self, node: usize, bytes: &[u8]) -> Result<(), Error> {
        let mut frames = Vec::new();
        let mut pos = 0;
        while pos + 5 <= bytes.len() {
            let kind = bytes[pos];
            let len = i32::from_be_bytes(bytes[pos + 1..pos + 5].try_into().unwrap()) as usize;
            if len < 4 || pos + 1 + len > bytes.len() {
                return Err(Error::CacheCorrupt(
                    "cached entry does not frame cleanly".into(),
                ));
            }
            frames.push((kind, BytesMut::from(&bytes[pos + 5..pos + 1 + len])));
            pos += 1 + len;
        }
        let conn = self.backend_mut(node)?;
        for (kind, payload) in frames.into_iter().rev() {
            conn.unread_message(kind, payload);
        }
        Ok(())
    }

    // --- response consumption ---

    pub(crate) async fn drain_pending_queue(&mut self) -> Result<(), Error> {
        while self.ctx.has_pending() {
            let entry = self.ctx.pop_pending().unwrap();
            self.consume_pending(&entry).await?;
        }
        Ok(())
    }

    async fn consume_pending(&mut self, entry: &PendingMessage) -> Result<(), Error> {
        let targets: Vec<usize> = entry
            .sent_to
            .iter()
            .filter(|&n| entry.from_cache || !self.ignore_till_sync.contains(n))
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        let fwd = targets[0];
        let replicated = targets.len() > 1;
        let mut terminals: Vec<(usize, u8)> = Vec::new();
        let mut tags: Vec<(usize, String)> = Vec::new();
        for &node in &targets {
            let forwarding = node == fwd && !entry.not_forward_to_frontend;
            let (terminal, tag) = self
                .consume_one_backend(node, entry, forwarding, replicated)
                .await?;
            terminals.push((node, terminal));
            if let Some(tag) = tag {
                tags.push((node, tag));
            }
        }

        // All backends must answer in the same way; on disagreement the
        // first (primary-most) backend's kind wins and the rest is logged.
        if terminals.windows(2).any(|w| w[0].1 != w[1].1) {
            warn!(
                "backends disagree on response kind for {:?}: {:?}",
                entry.kind, terminals
            );
        }

        // A replicated Execute held its CommandCompletes back; the client
        // gets one reconciled tag, plus one divergence report if the
        // backends disagreed on affected rows.
        if replicated && !tags.is_empty() && !entry.not_forward_to_frontend {
            let reconciliation = reconcile(&tags);
            if let Some(handle) = entry.query_handle {
                self.append_temp_cache_tag(handle, &reconciliation.tag);
            }
            self.frontend
                .write_raw(&command_complete(&reconciliation.tag));
            if let Some(err) = reconciliation.mismatch {
                self.frontend.write_raw(&error_message_severity(
                    &err.to_string(),
                    err.sqlstate(),
                    "ERROR",
                ));
            }
        }
        Ok(())
    }

    /// Read one backend's response for one pending message. Returns the
    /// terminal kind observed, plus the CommandComplete tag for Execute so
    /// the caller can reconcile replicated writes.
    async fn consume_one_backend(
        &mut self,
        node: usize,
        entry: &PendingMessage,
        forwarding: bool,
        replicated: bool,
    ) -> Result<(u8, Option<String>), Error> {
        loop {
            let (kind, mut payload) = self.backend_mut(node)?.read_message().await?;
            match kind {
                b'N' | b'A' | b'S' => {
                    if forwarding {
                        self.frontend.write_raw(&frame(kind, &payload));
                    }
                    continue;
                }
                b'E' => {
                    self.ignore_till_sync.set(node);
                    self.note_backend_error(node, &payload);
                    if forwarding {
                        self.frontend.write_raw(&frame(kind, &payload));
                    }
                    if let Some(handle) = entry.query_handle {
                        if let Some(qc) = self.ctx.queries.get_mut(handle) {
                            qc.temp_cache = None;
                        }
                    }
                    return Ok((b'E', None));
                }
                b'Z' => {
                    // A stray ReadyForQuery means the backend is already
                    // past this exchange; put it back for the Sync barrier.
                    let status = payload.clone();
                    self.backend_mut(node)?.unread_message(b'Z', status);
                    return Ok((b'Z', None));
                }
                _ => {}
            }

            match entry.kind {
                PendingKind::Parse => {
                    if kind == b'1' {
                        self.advance_state(entry.query_handle, node, BackendStmtState::ParseComplete);
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        return Ok((kind, None));
                    }
                    self.unexpected(node, entry, kind, &payload, forwarding);
                }
                PendingKind::Bind => {
                    if kind == b'2' {
                        self.advance_state(entry.query_handle, node, BackendStmtState::BindComplete);
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        return Ok((kind, None));
                    }
                    self.unexpected(node, entry, kind, &payload, forwarding);
                }
                PendingKind::Close => {
                    if kind == b'3' {
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        if let Some(name) = &entry.statement_name {
                            self.ctx.remove_sent_message(SentMessageKind::Parse, name);
                        }
                        if let Some(name) = &entry.portal_name {
                            self.ctx.remove_sent_message(SentMessageKind::Portal, name);
                        }
                        return Ok((kind, None));
                    }
                    self.unexpected(node, entry, kind, &payload, forwarding);
                }
                PendingKind::Describe => {
                    match kind {
                        b't' => {
                            if forwarding {
                                self.frontend.write_raw(&frame(kind, &payload));
                            }
                        }
                        b'T' | b'n' => {
                            if forwarding {
                                if kind == b'T' {
                                    self.append_extended_temp_cache(entry, kind, &payload);
                                }
                                self.frontend.write_raw(&frame(kind, &payload));
                            }
                            return Ok((kind, None));
                        }
                        _ => self.unexpected(node, entry, kind, &payload, forwarding),
                    }
                }
                PendingKind::Execute => match kind {
                    b'D' | b'd' => {
                        if forwarding {
                            if kind == b'D' && !entry.from_cache {
                                self.append_extended_temp_cache(entry, kind, &payload);
                            }
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'T' => {
                        // Only injected cache entries carry a RowDescription
                        // here; the client got the real one from Describe.
                        if !entry.from_cache && forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                    }
                    b'C' => {
                        self.advance_state(
                            entry.query_handle,
                            node,
                            BackendStmtState::ExecuteComplete,
                        );
                        let tag = {
                            let mut copy = payload.clone();
                            copy.read_string().map(|(tag, _)| tag).ok()
                        };
                        // Replicated writes hold the tag back; the caller
                        // reconciles the per-backend counts into one.
                        if replicated {
                            return Ok((kind, tag));
                        }
                        if forwarding {
                            if !entry.from_cache {
                                self.append_extended_temp_cache(entry, kind, &payload);
                            }
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        return Ok((kind, tag));
                    }
                    b's' | b'I' | b'c' | b'G' | b'H' | b'W' => {
                        if forwarding {
                            self.frontend.write_raw(&frame(kind, &payload));
                        }
                        if kind == b's' || kind == b'I' {
                            return Ok((kind, None));
                        }
                    }
                    _ => self.unexpected(node, entry, kind, &payload, forwarding),
                },
                PendingKind::Sync | PendingKind::Flush => {
                    // Handled at the barrier; nothing is queued under these.
                    let _ = payload.read_u8();
                    return Ok((kind, None));
                }
            }
        }
    }

    fn advance_state(&mut self, handle: Option<Handle>, node: usize, next: BackendStmtState) {
        if let Some(handle) = handle {
            if let Some(qc) = self.ctx.queries.get_mut(handle) {
                if !qc.advance_backend_state(node, next) {
                    debug!(
                        "node {node}: statement state would regress to {next:?}; keeping current"
                    );
                }
            }
        }
    }

    fn unexpected(
        &mut self,
        node: usize,
        entry: &PendingMessage,
        kind: u8,
        payload: &BytesMut,
        forwarding: bool,
    ) {
        debug!(
            "node {node}: unexpected '{}' while waiting for {:?} response",
            kind as char, entry.kind
        );
        if forwarding {
            self.frontend.write_raw(&frame(kind, payload));
        }
    }

    fn append_extended_temp_cache(&mut self, entry: &PendingMessage, kind: u8, payload: &BytesMut) {
        if let Some(handle) = entry.query_handle {
            if let Some(qc) = self.ctx.queries.get_mut(handle) {
                if let Some(temp) = qc.temp_cache.as_mut() {
                    temp.append(kind, payload);
                }
            }
        }
    }
}

/// `name \0 query \0 <param type data>` → (name, query, tail).
fn split_parse_payload(payload: &BytesMut) -> Result<(String, String, BytesMut), Error> {
    let mut buf = payload.clone();
    let (name, _) = buf.read_string()?;
    let (query, _) = buf.read_string()?;
    Ok((name, query, buf))
}

fn rebuild_parse_payload(name: &str, query: &str, tail: &BytesMut) -> BytesMut {
    let mut body = BytesMut::with_capacity(name.len() + query.len() + tail.len() + 2);
    body.put_slice(name.as_bytes());
    body.put_u8(0);
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    body.put_slice(tail);
    body
}

/// `portal \0 statement \0 ...` → (portal, statement).
fn split_bind_names(payload: &BytesMut) -> Result<(String, String), Error> {
    let mut buf = payload.clone();
    let (portal, _) = buf.read_string()?;
    let (statement, _) = buf.read_string()?;
    Ok((portal, statement))
}

/// `'S'|'P' name \0` → (target, name).
fn split_describe_payload(payload: &BytesMut) -> Result<(u8, String), Error> {
    let mut buf = payload.clone();
    let target = buf.read_u8()?;
    if target != b'S' && target != b'P' {
        return Err(Error::ProtocolViolation(format!(
            "describe/close target must be S or P, got '{}'",
            target as char
        )));
    }
    let (name, _) = buf.read_string()?;
    Ok((target, name))
}

/// `portal \0 max_rows` → portal.
fn split_execute_portal(payload: &BytesMut) -> Result<String, Error> {
    let mut buf = payload.clone();
    let (portal, _) = buf.read_string()?;
    Ok(portal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_payload_split_and_rebuild() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"stmt1\0SELECT * FROM t WHERE id = $1\0");
        payload.put_i16(1);
        payload.put_i32(23);

        let (name, query, tail) = split_parse_payload(&payload).unwrap();
        assert_eq!(name, "stmt1");
        assert_eq!(query, "SELECT * FROM t WHERE id = $1");
        assert_eq!(tail.len(), 6);

        let rebuilt = rebuild_parse_payload(&name, "SELECT 1", &tail);
        let (name2, query2, tail2) = split_parse_payload(&rebuilt).unwrap();
        assert_eq!(name2, "stmt1");
        assert_eq!(query2, "SELECT 1");
        assert_eq!(tail2, tail);
    }

    #[test]
    fn bind_names_split() {
        let mut payload = BytesMut::new();
        payload.put_slice(b"portal1\0stmt1\0");
        payload.put_i16(0);
        let (portal, statement) = split_bind_names(&payload).unwrap();
        assert_eq!(portal, "portal1");
        assert_eq!(statement, "stmt1");
    }

    #[test]
    fn describe_target_validation() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'S');
        payload.put_slice(b"stmt1\0");
        assert_eq!(
            split_describe_payload(&payload).unwrap(),
            (b'S', "stmt1".to_string())
        );

        let mut bad = BytesMut::new();
        bad.put_u8(b'X');
        bad.put_slice(b"stmt1\0");
        assert!(split_describe_payload(&bad).is_err());
    }
}
