//! End-to-end session tests against scripted mock backends.
//!
//! Each mock backend is a real TCP listener speaking just enough of the v3
//! protocol: it answers startup with AuthenticationOk/BackendKeyData, logs
//! every query it receives, and produces scripted responses. The client
//! side drives a `Session` over an in-memory duplex stream.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use serial_test::serial;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};

use pg_relay::auth::passwords::PasswordStore;
use pg_relay::auth::AuthContext;
use pg_relay::backend::{BackendStatus, Cluster};
use pg_relay::cache::QueryCache;
use pg_relay::config::{
    set_config, BackendConfig, CacheSettings, ClusterMode, Config, FrontendAuthMethod, Routing,
};
use pg_relay::engine::cancel::CancelMap;
use pg_relay::engine::{Session, SessionEnv};
use pg_relay::interlock::Interlock;

// --- mock backend ---

#[derive(Clone)]
struct MockState {
    /// Every simple-query text this backend received, in order.
    queries: Arc<Mutex<Vec<String>>>,
    /// Shared row counter for `SELECT count(*) FROM t`.
    t_count: Arc<AtomicI64>,
    /// Tag this backend reports for UPDATE statements.
    update_tag: String,
    pid: i32,
}

impl MockState {
    fn new(pid: i32, t_count: Arc<AtomicI64>, update_tag: &str) -> Self {
        Self {
            queries: Arc::new(Mutex::new(Vec::new())),
            t_count,
            update_tag: update_tag.to_string(),
            pid,
        }
    }

    fn log(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

fn put_frame(buf: &mut BytesMut, kind: u8, body: &[u8]) {
    buf.put_u8(kind);
    buf.put_i32(body.len() as i32 + 4);
    buf.put_slice(body);
}

fn row_desc_frame(columns: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for name in columns {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0);
        body.put_i16(0);
        body.put_i32(25); // text
        body.put_i16(-1);
        body.put_i32(-1);
        body.put_i16(0);
    }
    let mut frame = BytesMut::new();
    put_frame(&mut frame, b'T', &body);
    frame
}

fn data_row_frame(values: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(values.len() as i16);
    for value in values {
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
    }
    let mut frame = BytesMut::new();
    put_frame(&mut frame, b'D', &body);
    frame
}

fn command_complete_frame(tag: &str) -> BytesMut {
    let mut body = BytesMut::from(tag.as_bytes());
    body.put_u8(0);
    let mut frame = BytesMut::new();
    put_frame(&mut frame, b'C', &body);
    frame
}

/// Scripted responses for one simple query; ReadyForQuery is appended by
/// the connection loop.
fn respond_simple(state: &MockState, query: &str) -> BytesMut {
    let mut out = BytesMut::new();
    let q = query.trim();

    if q.contains("pg_catalog.pg_database") {
        out.put(row_desc_frame(&["oid"]));
        out.put(data_row_frame(&["16001"]));
        out.put(command_complete_frame("SELECT 1"));
    } else if q.contains("pg_catalog.pg_class") {
        // Relcache lookup; every user relation is permanent with a fixed
        // oid derived from its name length (stable per name).
        let oid = if q.contains("'t'") { "20001" } else { "20777" };
        out.put(row_desc_frame(&["oid", "relpersistence"]));
        out.put(data_row_frame(&[oid, "p"]));
        out.put(command_complete_frame("SELECT 1"));
    } else if q.starts_with("SHOW transaction_isolation") {
        out.put(row_desc_frame(&["transaction_isolation"]));
        out.put(data_row_frame(&["read committed"]));
        out.put(command_complete_frame("SHOW"));
    } else if q.starts_with("SELECT count(*) FROM t") {
        let count = state.t_count.load(Ordering::SeqCst).to_string();
        out.put(row_desc_frame(&["count"]));
        out.put(data_row_frame(&[&count]));
        out.put(command_complete_frame("SELECT 1"));
    } else if q.starts_with("SELECT 1") {
        out.put(row_desc_frame(&["?column?"]));
        out.put(data_row_frame(&["1"]));
        out.put(command_complete_frame("SELECT 1"));
    } else if q.starts_with("INSERT") {
        state.t_count.fetch_add(1, Ordering::SeqCst);
        out.put(command_complete_frame("INSERT 0 1"));
    } else if q.starts_with("UPDATE") {
        out.put(command_complete_frame(&state.update_tag.clone()));
    } else if q.starts_with("BEGIN") {
        out.put(command_complete_frame("BEGIN"));
    } else if q.starts_with("COMMIT") || q.starts_with("END") {
        out.put(command_complete_frame("COMMIT"));
    } else if q.starts_with("ROLLBACK") {
        out.put(command_complete_frame("ROLLBACK"));
    } else {
        out.put(command_complete_frame("OK"));
    }
    out
}

async fn read_cstring(stream: &mut TcpStream, len: usize) -> String {
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.unwrap();
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).to_string()
}

/// Spawn one mock backend; returns its port and shared state.
async fn spawn_mock_backend(state: MockState) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            let state = state.clone();
            tokio::spawn(async move {
                // Startup packet.
                let len = stream.read_i32().await.unwrap();
                let version = stream.read_i32().await.unwrap();
                if version != 196608 {
                    return; // cancel request or ssl probe; drop it
                }
                let mut params = vec![0u8; len as usize - 8];
                stream.read_exact(&mut params).await.unwrap();

                let mut preamble = BytesMut::new();
                put_frame(&mut preamble, b'R', &0i32.to_be_bytes());
                let mut key = BytesMut::new();
                key.put_i32(state.pid);
                key.put_i32(5555);
                put_frame(&mut preamble, b'K', &key);
                put_frame(&mut preamble, b'Z', b"I");
                stream.write_all(&preamble).await.unwrap();

                let mut in_tx = false;
                let mut last_parse_is_update = false;
                loop {
                    let kind = match stream.read_u8().await {
                        Ok(kind) => kind,
                        Err(_) => return,
                    };
                    let len = stream.read_i32().await.unwrap() as usize - 4;
                    match kind {
                        b'Q' => {
                            let query = read_cstring(&mut stream, len).await;
                            state.queries.lock().push(query.clone());

                            let q = query.trim().to_uppercase();
                            if q.starts_with("BEGIN") || q.starts_with("START") {
                                in_tx = true;
                            } else if q.starts_with("COMMIT")
                                || q.starts_with("END")
                                || q.starts_with("ROLLBACK")
                                || q.starts_with("ABORT")
                            {
                                in_tx = false;
                            }

                            let mut out = respond_simple(&state, &query);
                            put_frame(&mut out, b'Z', if in_tx { b"T" } else { b"I" });
                            stream.write_all(&out).await.unwrap();
                        }
                        b'P' => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                            let query = {
                                let after_name =
                                    buf.iter().position(|&b| b == 0).unwrap() + 1;
                                let rest = &buf[after_name..];
                                let end = rest.iter().position(|&b| b == 0).unwrap();
                                String::from_utf8_lossy(&rest[..end]).to_string()
                            };
                            last_parse_is_update =
                                query.trim_start().to_uppercase().starts_with("UPDATE");
                            state.queries.lock().push(format!("PARSE:{query}"));
                            let mut out = BytesMut::new();
                            put_frame(&mut out, b'1', &[]);
                            stream.write_all(&out).await.unwrap();
                        }
                        b'B' => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                            let mut out = BytesMut::new();
                            put_frame(&mut out, b'2', &[]);
                            stream.write_all(&out).await.unwrap();
                        }
                        b'D' => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                            let mut out = BytesMut::new();
                            let mut params = BytesMut::new();
                            params.put_i16(1);
                            params.put_i32(23);
                            put_frame(&mut out, b't', &params);
                            out.put(row_desc_frame(&["v"]));
                            stream.write_all(&out).await.unwrap();
                        }
                        b'E' => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                            state.queries.lock().push("EXECUTE".to_string());
                            let mut out = BytesMut::new();
                            if last_parse_is_update {
                                out.put(command_complete_frame(&state.update_tag.clone()));
                            } else {
                                out.put(data_row_frame(&["42"]));
                                out.put(command_complete_frame("SELECT 1"));
                            }
                            stream.write_all(&out).await.unwrap();
                        }
                        b'C' => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                            let mut out = BytesMut::new();
                            put_frame(&mut out, b'3', &[]);
                            stream.write_all(&out).await.unwrap();
                        }
                        b'S' => {
                            let mut out = BytesMut::new();
                            put_frame(&mut out, b'Z', if in_tx { b"T" } else { b"I" });
                            stream.write_all(&out).await.unwrap();
                        }
                        b'H' => {} // responses are always eager here
                        b'X' => return,
                        _ => {
                            let mut buf = vec![0u8; len];
                            stream.read_exact(&mut buf).await.unwrap();
                        }
                    }
                }
            });
        }
    });
    port
}

// --- frontend client helper ---

struct FrontendClient {
    stream: DuplexStream,
}

impl FrontendClient {
    async fn connect(stream: DuplexStream) -> Self {
        let mut client = Self { stream };

        // StartupMessage.
        let mut params = BytesMut::new();
        params.put_i32(196608);
        params.put_slice(b"user\0tester\0database\0testdb\0\0");
        let mut packet = BytesMut::new();
        packet.put_i32(params.len() as i32 + 4);
        packet.put(params);
        client.stream.write_all(&packet).await.unwrap();

        // Trust auth: AuthenticationOk then parameters, key data, RFQ.
        loop {
            let (kind, _) = client.read_frame().await;
            if kind == b'Z' {
                break;
            }
        }
        client
    }

    async fn read_frame(&mut self) -> (u8, BytesMut) {
        let kind = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap();
        let mut payload = BytesMut::new();
        payload.resize(len as usize - 4, 0);
        self.stream.read_exact(&mut payload).await.unwrap();
        (kind, payload)
    }

    async fn simple_query(&mut self, query: &str) -> Vec<(u8, BytesMut)> {
        let mut body = BytesMut::from(query.as_bytes());
        body.put_u8(0);
        let mut msg = BytesMut::new();
        put_frame(&mut msg, b'Q', &body);
        self.stream.write_all(&msg).await.unwrap();

        let mut frames = Vec::new();
        loop {
            let (kind, payload) = self.read_frame().await;
            let done = kind == b'Z';
            frames.push((kind, payload));
            if done {
                break;
            }
        }
        frames
    }

    async fn send(&mut self, kind: u8, body: &[u8]) {
        let mut msg = BytesMut::new();
        put_frame(&mut msg, kind, body);
        self.stream.write_all(&msg).await.unwrap();
    }
}

fn frames_of_kind<'a>(frames: &'a [(u8, BytesMut)], kind: u8) -> Vec<&'a BytesMut> {
    frames
        .iter()
        .filter(|(k, _)| *k == kind)
        .map(|(_, p)| p)
        .collect()
}

fn tag_of(payload: &BytesMut) -> String {
    let end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).to_string()
}

/// First column of a DataRow payload.
fn row_value(payload: &BytesMut) -> String {
    let mut buf = payload.clone();
    let _ncols = buf.get_i16();
    let len = buf.get_i32() as usize;
    String::from_utf8_lossy(&buf[..len]).to_string()
}

// --- harness ---

struct Harness {
    client: FrontendClient,
    session: tokio::task::JoinHandle<()>,
    mocks: Vec<MockState>,
}

async fn start(mode: ClusterMode, cache_enabled: bool, update_tags: &[&str]) -> Harness {
    let t_count = Arc::new(AtomicI64::new(3));
    let mut mocks = Vec::new();
    let mut backends = Vec::new();
    for (i, tag) in update_tags.iter().enumerate() {
        let state = MockState::new(4000 + i as i32, t_count.clone(), tag);
        let port = spawn_mock_backend(state.clone()).await;
        mocks.push(state);
        backends.push(BackendConfig {
            host: "127.0.0.1".into(),
            port,
            weight: 1,
            primary: i == 0 && mode == ClusterMode::StreamingReplication,
            allow_to_failover: true,
        });
    }

    let oiddir = tempfile::tempdir().unwrap();
    let config = Config {
        backends,
        routing: Routing {
            mode,
            ..Default::default()
        },
        cache: CacheSettings {
            enabled: cache_enabled,
            total_size: 1024 * 1024,
            max_num_cache: 1024,
            oiddir: oiddir.path().to_string_lossy().to_string(),
            ..Default::default()
        },
        ..Default::default()
    };
    set_config(config.clone());
    // Keep the tempdir alive for the whole test run.
    std::mem::forget(oiddir);

    let cluster = Arc::new(Cluster::from_config(&config).unwrap());
    for i in 0..cluster.num_backends() {
        cluster.set_status(i, BackendStatus::Up);
    }

    let env = SessionEnv {
        cluster,
        interlock: Interlock::new(),
        cache: cache_enabled.then(|| Arc::new(QueryCache::new(config.cache.clone()))),
        cancel_map: CancelMap::new(),
        auth: AuthContext::new(PasswordStore::empty(), FrontendAuthMethod::Trust),
    };

    let (client_half, server_half) = tokio::io::duplex(1 << 20);

    // Session id 1 lands the load-balance pick on node 1 in two-node setups.
    let session = tokio::spawn(async move {
        if let Ok(Some(mut session)) = Session::establish(server_half, "127.0.0.1:9", 1, env).await
        {
            let _ = session.run().await;
            session.teardown().await;
        }
    });

    let client = FrontendClient::connect(client_half).await;
    Harness {
        client,
        session,
        mocks,
    }
}

// --- scenarios ---

#[tokio::test]
#[serial]
async fn select_is_served_from_cache_on_repeat() {
    let mut h = start(ClusterMode::StreamingReplication, true, &["UPDATE 1", "UPDATE 1"]).await;

    let first = h.client.simple_query("SELECT 1").await;
    let rows = frames_of_kind(&first, b'D');
    assert_eq!(rows.len(), 1);

    let standby_queries_before = h
        .mocks[1]
        .log()
        .iter()
        .filter(|q| q.starts_with("SELECT 1"))
        .count();
    assert_eq!(standby_queries_before, 1);

    // Identical bytes, no extra backend traffic.
    let second = h.client.simple_query("SELECT 1").await;
    let first_data: Vec<_> = frames_of_kind(&first, b'D');
    let second_data: Vec<_> = frames_of_kind(&second, b'D');
    assert_eq!(first_data, second_data);
    assert_eq!(
        frames_of_kind(&first, b'T'),
        frames_of_kind(&second, b'T')
    );

    let standby_queries_after = h
        .mocks[1]
        .log()
        .iter()
        .filter(|q| q.starts_with("SELECT 1"))
        .count();
    assert_eq!(standby_queries_after, 1, "second SELECT must not hit the backend");

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn committed_write_invalidates_cached_select() {
    let mut h = start(ClusterMode::StreamingReplication, true, &["UPDATE 1", "UPDATE 1"]).await;

    let first = h.client.simple_query("SELECT count(*) FROM t").await;
    let rows = frames_of_kind(&first, b'D');
    assert_eq!(row_value(rows[0]), "3", "seeded count is 3");

    // Autocommit write on the primary invalidates at ReadyForQuery.
    let _ = h.client.simple_query("INSERT INTO t VALUES (4)").await;

    let third = h.client.simple_query("SELECT count(*) FROM t").await;
    let rows = frames_of_kind(&third, b'D');
    assert_eq!(row_value(rows[0]), "4", "post-insert count is 4");

    // The second SELECT had to reach a backend again.
    let select_hits: usize = h
        .mocks
        .iter()
        .map(|m| {
            m.log()
                .iter()
                .filter(|q| q.starts_with("SELECT count(*) FROM t"))
                .count()
        })
        .sum();
    assert_eq!(select_hits, 2);

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn begin_read_write_is_rewritten_for_standbys() {
    let mut h = start(ClusterMode::StreamingReplication, false, &["UPDATE 1", "UPDATE 1"]).await;

    let frames = h.client.simple_query("BEGIN READ WRITE").await;
    let tags = frames_of_kind(&frames, b'C');
    assert_eq!(tags.len(), 1, "client sees exactly one CommandComplete");
    assert_eq!(tag_of(tags[0]), "BEGIN");
    // In-transaction status.
    assert_eq!(frames.last().unwrap().1[0], b'T');

    assert!(h.mocks[0].log().contains(&"BEGIN READ WRITE".to_string()));
    assert!(h.mocks[1].log().contains(&"BEGIN".to_string()));
    assert!(!h.mocks[1].log().contains(&"BEGIN READ WRITE".to_string()));

    let _ = h.client.simple_query("ROLLBACK").await;
    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn replicated_update_row_count_mismatch_is_reported() {
    let mut h = start(ClusterMode::NativeReplication, false, &["UPDATE 1", "UPDATE 0"]).await;

    let frames = h
        .client
        .simple_query("UPDATE t SET v = v + 1 WHERE k = 1")
        .await;

    // One CommandComplete, then one XX001 error, then ReadyForQuery.
    let tags = frames_of_kind(&frames, b'C');
    assert_eq!(tags.len(), 1);
    assert_eq!(tag_of(tags[0]), "UPDATE 1");

    let errors = frames_of_kind(&frames, b'E');
    assert_eq!(errors.len(), 1);
    let error_text = String::from_utf8_lossy(errors[0]).to_string();
    assert!(error_text.contains("XX001"), "sqlstate present: {error_text}");
    assert!(error_text.contains("node 0: 1"));
    assert!(error_text.contains("node 1: 0"));

    // The CommandComplete precedes the error.
    let c_pos = frames.iter().position(|(k, _)| *k == b'C').unwrap();
    let e_pos = frames.iter().position(|(k, _)| *k == b'E').unwrap();
    assert!(c_pos < e_pos);

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn both_backends_see_replicated_write_once() {
    let mut h = start(ClusterMode::NativeReplication, false, &["UPDATE 2", "UPDATE 2"]).await;

    let frames = h
        .client
        .simple_query("UPDATE t SET v = v + 1 WHERE k = 1")
        .await;
    assert!(frames_of_kind(&frames, b'E').is_empty());

    for mock in &h.mocks {
        assert_eq!(
            mock.log()
                .iter()
                .filter(|q| q.starts_with("UPDATE t"))
                .count(),
            1
        );
    }

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn extended_replicated_update_mismatch_is_reported() {
    let mut h = start(ClusterMode::NativeReplication, false, &["UPDATE 1", "UPDATE 0"]).await;

    // Parse/Bind/Execute/Sync of a write; native replication fans it out.
    let mut parse_body = BytesMut::new();
    parse_body.put_slice(b"\0UPDATE t SET v = v + 1 WHERE k = 1\0");
    parse_body.put_i16(0);
    h.client.send(b'P', &parse_body).await;

    let mut bind_body = BytesMut::new();
    bind_body.put_slice(b"\0\0");
    bind_body.put_i16(0);
    bind_body.put_i16(0);
    bind_body.put_i16(0);
    h.client.send(b'B', &bind_body).await;

    let mut execute_body = BytesMut::new();
    execute_body.put_slice(b"\0");
    execute_body.put_i32(0);
    h.client.send(b'E', &execute_body).await;
    h.client.send(b'S', &[]).await;

    let mut frames = Vec::new();
    loop {
        let (kind, payload) = h.client.read_frame().await;
        let done = kind == b'Z';
        frames.push((kind, payload));
        if done {
            break;
        }
    }

    // One ParseComplete, one BindComplete, one reconciled CommandComplete,
    // one XX001 error, one ReadyForQuery.
    let kinds: Vec<u8> = frames.iter().map(|(k, _)| *k).collect();
    assert_eq!(kinds, vec![b'1', b'2', b'C', b'E', b'Z']);

    let tags = frames_of_kind(&frames, b'C');
    assert_eq!(tag_of(tags[0]), "UPDATE 1");

    let errors = frames_of_kind(&frames, b'E');
    let error_text = String::from_utf8_lossy(errors[0]).to_string();
    assert!(error_text.contains("XX001"), "sqlstate present: {error_text}");
    assert!(error_text.contains("node 0: 1"));
    assert!(error_text.contains("node 1: 0"));

    // Both backends executed the statement exactly once.
    for mock in &h.mocks {
        assert_eq!(
            mock.log().iter().filter(|q| *q == "EXECUTE").count(),
            1
        );
    }

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}

#[tokio::test]
#[serial]
async fn extended_protocol_prepared_statement_round_trip() {
    let mut h = start(ClusterMode::StreamingReplication, false, &["UPDATE 1", "UPDATE 1"]).await;

    // Parse a named statement.
    let mut parse_body = BytesMut::new();
    parse_body.put_slice(b"stmt1\0SELECT * FROM accounts WHERE id = $1\0");
    parse_body.put_i16(0);
    h.client.send(b'P', &parse_body).await;

    // Bind with one parameter, describe, execute, sync.
    let mut bind_body = BytesMut::new();
    bind_body.put_slice(b"\0stmt1\0");
    bind_body.put_i16(0); // no format codes
    bind_body.put_i16(1); // one parameter
    bind_body.put_i32(2);
    bind_body.put_slice(b"42");
    bind_body.put_i16(0); // default result format
    h.client.send(b'B', &bind_body).await;

    let mut execute_body = BytesMut::new();
    execute_body.put_slice(b"\0");
    execute_body.put_i32(0);
    h.client.send(b'E', &execute_body).await;
    h.client.send(b'S', &[]).await;

    // ParseComplete, BindComplete, DataRow, CommandComplete, ReadyForQuery.
    let mut kinds = Vec::new();
    loop {
        let (kind, _) = h.client.read_frame().await;
        kinds.push(kind);
        if kind == b'Z' {
            break;
        }
    }
    assert_eq!(kinds, vec![b'1', b'2', b'D', b'C', b'Z']);

    // Exactly one backend was involved, and the statement went where the
    // session's load-balance pick says.
    let touched: Vec<usize> = h
        .mocks
        .iter()
        .enumerate()
        .filter(|(_, m)| m.log().iter().any(|q| q.starts_with("PARSE:")))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(touched.len(), 1);

    h.client.send(b'X', &[]).await;
    let _ = h.session.await;
}
