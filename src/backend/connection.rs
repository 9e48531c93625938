//! One live connection to a backend database.

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, error};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

use crate::auth::scram_client::ScramSha256;
use crate::backend::status::BackendSlot;
use crate::errors::{BackendIdentifier, Error};
use crate::messages::constants::*;
use crate::messages::{
    cancel_request, md5_hash_password, simple_query, startup_message, BytesMutReader, PgErrorMsg,
    WireStream,
};

/// Rows of a pooler-issued simple query (relcache lookups, SHOW probes).
#[derive(Debug, Default)]
pub struct SimpleResult {
    pub rows: Vec<Vec<Option<String>>>,
    pub command_tag: String,
}

impl SimpleResult {
    /// First column of the first row, the common case.
    pub fn scalar(&self) -> Option<&str> {
        self.rows.first()?.first()?.as_deref()
    }
}

pub struct BackendConnection {
    pub node_id: usize,
    pub identifier: BackendIdentifier,
    stream: WireStream<TcpStream>,
    /// The backend's own cancellation pair from BackendKeyData.
    pub pid: i32,
    pub secret_key: i32,
}

impl BackendConnection {
    /// Open, run the startup exchange, authenticate, and wait for the
    /// first ReadyForQuery.
    pub async fn connect(
        node_id: usize,
        slot: &BackendSlot,
        username: &str,
        password: &str,
        database: &str,
        application_name: &str,
        connect_timeout_ms: u64,
    ) -> Result<Self, Error> {
        let identifier = slot.identifier(node_id);
        let tcp = timeout(
            Duration::from_millis(connect_timeout_ms),
            TcpStream::connect((slot.host.as_str(), slot.port)),
        )
        .await
        .map_err(|_| Error::ServerError(format!("connect timeout to {identifier}")))?
        .map_err(|err| Error::ServerError(format!("could not connect to {identifier}: {err}")))?;
        tcp.set_nodelay(true)
            .map_err(|err| Error::SocketError(format!("set_nodelay: {err}")))?;

        let mut stream = WireStream::new(tcp);
        stream.write_raw(&startup_message(username, database, application_name));
        stream.flush().await?;

        let mut conn = Self {
            node_id,
            identifier,
            stream,
            pid: 0,
            secret_key: 0,
        };
        conn.startup_exchange(username, password).await?;
        Ok(conn)
    }

    async fn startup_exchange(&mut self, username: &str, password: &str) -> Result<(), Error> {
        let mut scram: Option<ScramSha256> = None;
        loop {
            let (kind, mut payload) = self.stream.read_message().await?;
            match kind {
                b'R' => {
                    let code = payload.read_i32()?;
                    self.handle_auth_request(code, payload, username, password, &mut scram)
                        .await?;
                }
                b'S' => {} // ParameterStatus; the client gets its own set
                b'K' => {
                    self.pid = payload.read_i32()?;
                    self.secret_key = payload.read_i32()?;
                }
                b'Z' => {
                    debug!("backend {} ready, pid {}", self.identifier, self.pid);
                    return Ok(());
                }
                b'E' => {
                    let msg = PgErrorMsg::parse(&payload)?;
                    error!("backend {} refused startup: {}", self.identifier, msg.message);
                    return Err(Error::ServerError(format!(
                        "backend {} startup failed: {}",
                        self.identifier, msg.message
                    )));
                }
                b'N' => {} // NoticeResponse during startup
                other => {
                    return Err(Error::ProtocolViolation(format!(
                        "unexpected message '{}' during backend startup",
                        other as char
                    )))
                }
            }
        }
    }

    async fn handle_auth_request(
        &mut self,
        code: i32,
        mut payload: BytesMut,
        username: &str,
        password: &str,
        scram: &mut Option<ScramSha256>,
    ) -> Result<(), Error> {
        match code {
            AUTHENTICATION_SUCCESSFUL => Ok(()),

            AUTHENTICATION_CLEAR_PASSWORD => {
                let mut body = BytesMut::from(password.as_bytes());
                body.put_u8(0);
                self.stream.write_and_flush(b'p', &body).await
            }

            MD5_ENCRYPTED_PASSWORD => {
                if payload.remaining() < 4 {
                    return Err(Error::ProtocolViolation(
                        "md5 challenge carries no salt".into(),
                    ));
                }
                let salt = [
                    payload.get_u8(),
                    payload.get_u8(),
                    payload.get_u8(),
                    payload.get_u8(),
                ];
                let hashed = md5_hash_password(username, password, &salt);
                self.stream.write_and_flush(b'p', &hashed).await
            }

            SASL => {
                let mechanisms = String::from_utf8_lossy(&payload).to_string();
                if !mechanisms.contains(SCRAM_SHA_256) {
                    return Err(Error::FeatureNotSupported(format!(
                        "backend {} offers no supported SASL mechanism",
                        self.identifier
                    )));
                }
                let mut client = ScramSha256::new(password);
                let first = client.message();
                *scram = Some(client);

                let mut body = BytesMut::new();
                body.put_slice(SCRAM_SHA_256.as_bytes());
                body.put_u8(0);
                body.put_i32(first.len() as i32);
                body.put_slice(&first);
                self.stream.write_and_flush(b'p', &body).await
            }

            SASL_CONTINUE => {
                let client = scram.as_mut().ok_or_else(|| {
                    Error::ProtocolViolation("SASL continue without SASL start".into())
                })?;
                let response = client.update(&payload)?;
                self.stream.write_and_flush(b'p', &response).await
            }

            SASL_FINAL => {
                let client = scram.as_mut().ok_or_else(|| {
                    Error::ProtocolViolation("SASL final without SASL start".into())
                })?;
                client.finish(&payload)
            }

            other => Err(Error::FeatureNotSupported(format!(
                "backend {} wants unsupported auth method {other}",
                self.identifier
            ))),
        }
    }

    // --- framed I/O, used by the query engines ---

    pub async fn read_message(&mut self) -> Result<(u8, BytesMut), Error> {
        self.stream.read_message().await
    }

    pub fn unread_message(&mut self, kind: u8, payload: BytesMut) {
        self.stream.unread_message(kind, payload);
    }

    pub fn has_pushback(&self) -> bool {
        self.stream.has_pushback()
    }

    pub fn write_message(&mut self, kind: u8, payload: &[u8]) {
        self.stream.write_message(kind, payload);
    }

    pub fn write_raw(&mut self, bytes: &[u8]) {
        self.stream.write_raw(bytes);
    }

    pub async fn flush(&mut self) -> Result<(), Error> {
        self.stream.flush().await
    }

    /// Run one internal simple query and collect its text rows.
    pub async fn do_query(&mut self, sql: &str) -> Result<SimpleResult, Error> {
        self.stream.write_raw(&simple_query(sql));
        self.stream.flush().await?;

        let mut result = SimpleResult::default();
        loop {
            let (kind, mut payload) = self.stream.read_message().await?;
            match kind {
                b'T' => {} // field descriptions are not needed here
                b'D' => {
                    let ncols = payload.read_i16()?;
                    let mut row = Vec::with_capacity(ncols as usize);
                    for _ in 0..ncols {
                        let len = payload.read_i32()?;
                        if len < 0 {
                            row.push(None);
                        } else {
                            let len = len as usize;
                            if payload.remaining() < len {
                                return Err(Error::ProtocolViolation(
                                    "data row shorter than its length fields".into(),
                                ));
                            }
                            let value = payload.split_to(len);
                            row.push(Some(String::from_utf8_lossy(&value).to_string()));
                        }
                    }
                    result.rows.push(row);
                }
                b'C' => {
                    let (tag, _) = payload.read_string()?;
                    result.command_tag = tag;
                }
                b'E' => {
                    let msg = PgErrorMsg::parse(&payload)?;
                    // Drain to ReadyForQuery before reporting.
                    loop {
                        let (kind, _) = self.stream.read_message().await?;
                        if kind == b'Z' {
                            break;
                        }
                    }
                    return Err(Error::ServerError(format!(
                        "internal query failed on {}: {}",
                        self.identifier, msg.message
                    )));
                }
                b'Z' => return Ok(result),
                _ => {} // notices, parameter changes
            }
        }
    }

    /// Fire a CancelRequest for this backend's (pid, key) on a fresh
    /// connection, as the protocol requires.
    pub async fn send_cancel(host: &str, port: u16, pid: i32, secret_key: i32) {
        match TcpStream::connect((host, port)).await {
            Ok(mut tcp) => {
                use tokio::io::AsyncWriteExt;
                let packet = cancel_request(pid, secret_key);
                if let Err(err) = tcp.write_all(&packet).await {
                    debug!("cancel packet to {host}:{port} failed: {err}");
                }
            }
            Err(err) => debug!("cancel connection to {host}:{port} failed: {err}"),
        }
    }
}
