//! Errors.

use std::fmt;

/// Various errors.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Low-level socket failure while reading or writing.
    SocketError(String),
    /// The peer closed the connection cleanly.
    ConnectionLost(String),
    /// Malformed message, length mismatch, or unexpected message kind.
    ProtocolViolation(String),
    /// Authentication failed. The client never learns whether the user or
    /// the password was wrong; the cause is logged internally.
    AuthFailure(String),
    /// Channel binding, unknown SASL mechanism, protocol v2 extended-query.
    FeatureNotSupported(String),
    /// Routing targeted a backend slot that is not up.
    BackendDown(usize),
    /// A replicated write produced divergent affected-row counts.
    MismatchedTuples(String),
    /// Consistency failure inside the shared result cache.
    CacheCorrupt(String),
    /// The session was interrupted by failover; the client must reconnect.
    InternalFailover,
    /// The client startup packet was unusable.
    ClientBadStartup(String),
    /// Other per-client failure.
    ClientError(String),
    /// Backend-side failure outside the protocol itself.
    ServerError(String),
    /// Configuration problem detected at load time.
    BadConfig(String),
    ShuttingDown,
}

impl Error {
    /// The sqlstate reported to the client for this error kind.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::ProtocolViolation(_) => "08P01",
            Error::AuthFailure(_) => "28P01",
            Error::FeatureNotSupported(_) => "0A000",
            Error::MismatchedTuples(_) => "XX001",
            Error::BackendDown(_) => "08003",
            Error::InternalFailover => "57P01",
            Error::CacheCorrupt(_) => "XX000",
            Error::ClientBadStartup(_) => "08P01",
            _ => "58000",
        }
    }

    /// Protocol and auth errors terminate the session; everything else is
    /// recovered locally where possible.
    pub fn is_fatal_for_session(&self) -> bool {
        matches!(
            self,
            Error::ProtocolViolation(_)
                | Error::AuthFailure(_)
                | Error::ConnectionLost(_)
                | Error::ClientBadStartup(_)
                | Error::InternalFailover
                | Error::ShuttingDown
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::SocketError(msg) => write!(f, "socket error: {msg}"),
            Error::ConnectionLost(msg) => write!(f, "connection lost: {msg}"),
            Error::ProtocolViolation(msg) => write!(f, "protocol violation: {msg}"),
            Error::AuthFailure(msg) => write!(f, "authentication failed: {msg}"),
            Error::FeatureNotSupported(msg) => write!(f, "feature not supported: {msg}"),
            Error::BackendDown(id) => write!(f, "backend {id} is not up"),
            Error::MismatchedTuples(msg) => {
                write!(f, "affected tuples mismatch between backends: {msg}")
            }
            Error::CacheCorrupt(msg) => write!(f, "query cache corrupted: {msg}"),
            Error::InternalFailover => write!(f, "session interrupted by failover"),
            Error::ClientBadStartup(msg) => write!(f, "bad client startup: {msg}"),
            Error::ClientError(msg) => write!(f, "client error: {msg}"),
            Error::ServerError(msg) => write!(f, "server error: {msg}"),
            Error::BadConfig(msg) => write!(f, "configuration error: {msg}"),
            Error::ShuttingDown => write!(f, "shutting down"),
        }
    }
}

impl std::error::Error for Error {}

/// Identifies one client connection in log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub database: String,
}

impl ClientIdentifier {
    pub fn new(
        application_name: &str,
        username: &str,
        database: &str,
        addr: &str,
    ) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            database: database.into(),
        }
    }
}

impl fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            addr,
            application_name,
            username,
            database,
        } = self;
        write!(
            f,
            "{{ {username}@{addr}/{database}?application_name={application_name} }}",
        )
    }
}

/// Identifies one backend in log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIdentifier {
    pub node_id: usize,
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BackendIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let Self {
            node_id,
            host,
            port,
        } = self;
        write!(f, "{{ node {node_id}: {host}:{port} }}")
    }
}
