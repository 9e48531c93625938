//! Tests for the frontend authentication flow.

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use super::passwords::PasswordStore;
use super::scram_client::ScramSha256;
use super::*;
use crate::config::FrontendAuthMethod;
use crate::errors::ClientIdentifier;
use crate::messages::constants::{SASL, SASL_CONTINUE, SASL_FINAL};
use crate::messages::WireStream;

fn client_id(user: &str) -> ClientIdentifier {
    ClientIdentifier::new("test", user, "testdb", "127.0.0.1:1")
}

fn context(contents: &str) -> AuthContext {
    AuthContext {
        store: PasswordStore::from_contents(contents, None),
        method: FrontendAuthMethod::ScramSha256,
        process_nonce: [7; 32],
    }
}

/// Raw client half: reads typed server messages, tracks bytes and counts.
struct RawClient {
    stream: DuplexStream,
    pub server_bytes: usize,
    pub server_messages: usize,
}

impl RawClient {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream,
            server_bytes: 0,
            server_messages: 0,
        }
    }

    async fn read_frame(&mut self) -> (u8, BytesMut) {
        let kind = self.stream.read_u8().await.unwrap();
        let len = self.stream.read_i32().await.unwrap();
        let mut payload = BytesMut::new();
        payload.resize(len as usize - 4, 0);
        self.stream.read_exact(&mut payload).await.unwrap();
        self.server_bytes += 1 + len as usize;
        self.server_messages += 1;
        (kind, payload)
    }

    async fn send_password_message(&mut self, body: &[u8]) {
        let mut msg = BytesMut::with_capacity(body.len() + 5);
        msg.put_u8(b'p');
        msg.put_i32(body.len() as i32 + 4);
        msg.put_slice(body);
        self.stream.write_all(&msg).await.unwrap();
    }
}

/// Drive a full client-side SCRAM exchange; returns the client state and
/// the server's outcome frames.
async fn drive_scram(
    ctx: AuthContext,
    username: &str,
    password: &str,
) -> (RawClient, Result<(), Error>) {
    let (client_half, server_half) = tokio::io::duplex(4096);
    let username = username.to_string();
    let password = password.to_string();

    let server = tokio::spawn(async move {
        let mut stream = WireStream::new(server_half);
        let result =
            authenticate_frontend(&mut stream, &username, &client_id(&username), &ctx).await;
        stream.flush().await.unwrap();
        result
    });

    let mut client = RawClient::new(client_half);
    let mut scram = ScramSha256::new(&password);

    // AuthenticationSASL advertising the mechanism.
    let (kind, mut payload) = client.read_frame().await;
    assert_eq!(kind, b'R');
    assert_eq!(payload.get_i32(), SASL);

    // SASLInitialResponse.
    let first = scram.message();
    let mut body = BytesMut::new();
    body.put_slice(b"SCRAM-SHA-256\0");
    body.put_i32(first.len() as i32);
    body.put_slice(&first);
    client.send_password_message(&body).await;

    // AuthenticationSASLContinue.
    let (kind, mut payload) = client.read_frame().await;
    assert_eq!(kind, b'R');
    assert_eq!(payload.get_i32(), SASL_CONTINUE);
    let response = scram.update(&payload).unwrap();
    client.send_password_message(&response).await;

    // AuthenticationSASLFinal + AuthenticationOk, or ErrorResponse.
    let (kind, mut payload) = client.read_frame().await;
    match kind {
        b'R' => {
            assert_eq!(payload.get_i32(), SASL_FINAL);
            let (kind, mut ok) = client.read_frame().await;
            assert_eq!(kind, b'R');
            assert_eq!(ok.get_i32(), 0);
        }
        b'E' => {}
        other => panic!("unexpected auth outcome '{}'", other as char),
    }

    (client, server.await.unwrap())
}

#[tokio::test]
async fn scram_succeeds_against_stored_verifier() {
    let verifier = super::scram::ScramVerifier::derive("sekret", b"0123456789abcdef", 4096);
    let ctx = context(&format!("alice:{}\n", verifier.to_record()));
    let (_, result) = drive_scram(ctx, "alice", "sekret").await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn scram_succeeds_against_stored_plaintext() {
    let ctx = context("alice:TEXT sekret\n");
    let (_, result) = drive_scram(ctx, "alice", "sekret").await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn scram_wrong_password_fails() {
    let verifier = super::scram::ScramVerifier::derive("sekret", b"0123456789abcdef", 4096);
    let ctx = context(&format!("alice:{}\n", verifier.to_record()));
    let (_, result) = drive_scram(ctx, "alice", "wrong").await;
    assert!(matches!(result, Err(Error::AuthFailure(_))));
}

#[tokio::test]
async fn unknown_user_runs_full_mock_exchange() {
    let ctx = context("alice:TEXT sekret\n");
    let (client, result) = drive_scram(ctx, "ghost", "whatever").await;
    assert!(matches!(result, Err(Error::AuthFailure(_))));
    // The full three server messages happened before the failure: SASL
    // advertisement, salt, and the generic error.
    assert_eq!(client.server_messages, 3);
}

#[tokio::test]
async fn mock_exchange_is_indistinguishable_from_wrong_password() {
    // Same salt length (16 bytes), same iteration count, same nonce
    // lengths: the wire byte counts must match exactly.
    let verifier = super::scram::ScramVerifier::derive("sekret", b"0123456789abcdef", 4096);

    let ctx = context(&format!("alice:{}\n", verifier.to_record()));
    let (wrong_password, result) = drive_scram(ctx, "alice", "nope").await;
    assert!(result.is_err());

    let ctx = context(&format!("alice:{}\n", verifier.to_record()));
    let (unknown_user, result) = drive_scram(ctx, "ghost", "nope").await;
    assert!(result.is_err());

    assert_eq!(wrong_password.server_messages, unknown_user.server_messages);
    // The error message names the user; normalize for the length check.
    // Both usernames here are five characters, so the raw counts agree.
    assert_eq!(wrong_password.server_bytes, unknown_user.server_bytes);
}

#[tokio::test]
async fn md5_round_trip() {
    let ctx = AuthContext {
        store: PasswordStore::from_contents("bob:TEXT hunter2\n", None),
        method: FrontendAuthMethod::Md5,
        process_nonce: [7; 32],
    };
    let (client_half, server_half) = tokio::io::duplex(4096);

    let server = tokio::spawn(async move {
        let mut stream = WireStream::new(server_half);
        let result = authenticate_frontend(&mut stream, "bob", &client_id("bob"), &ctx).await;
        stream.flush().await.unwrap();
        result
    });

    let mut client = RawClient::new(client_half);
    let (kind, mut payload) = client.read_frame().await;
    assert_eq!(kind, b'R');
    assert_eq!(payload.get_i32(), 5);
    let mut salt = [0u8; 4];
    salt.copy_from_slice(&payload[..4]);

    let hashed = crate::messages::md5_hash_password("bob", "hunter2", &salt);
    client.send_password_message(&hashed).await;

    let (kind, mut payload) = client.read_frame().await;
    assert_eq!(kind, b'R');
    assert_eq!(payload.get_i32(), 0);
    assert!(server.await.unwrap().is_ok());
}

#[tokio::test]
async fn trust_skips_the_challenge() {
    let ctx = AuthContext {
        store: PasswordStore::from_contents("", None),
        method: FrontendAuthMethod::Trust,
        process_nonce: [7; 32],
    };
    let (client_half, server_half) = tokio::io::duplex(4096);

    let server = tokio::spawn(async move {
        let mut stream = WireStream::new(server_half);
        let result =
            authenticate_frontend(&mut stream, "anyone", &client_id("anyone"), &ctx).await;
        stream.flush().await.unwrap();
        result
    });

    let mut client = RawClient::new(client_half);
    let (kind, mut payload) = client.read_frame().await;
    assert_eq!(kind, b'R');
    assert_eq!(payload.get_i32(), 0);
    assert!(server.await.unwrap().is_ok());
}
