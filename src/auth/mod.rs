//! Client-facing authentication.

pub mod passwords;
pub mod scram;
pub mod scram_client;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use log::warn;
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::auth::passwords::{PasswordStore, StoredPassword};
use crate::auth::scram::{constant_time_eq, ScramServer, ScramVerifier};
use crate::config::FrontendAuthMethod;
use crate::errors::{ClientIdentifier, Error};
use crate::messages::constants::{SASL_CONTINUE, SASL_FINAL, SCRAM_SHA_256};
use crate::messages::{
    auth_ok, md5_challenge, md5_hash_password, md5_hash_second_pass, plain_password_challenge,
    read_password, scram_server_response, scram_start_challenge, vec_to_string, wrong_password,
    BytesMutReader, WireStream,
};

/// Process-wide authentication state shared by every session.
pub struct AuthContext {
    pub store: PasswordStore,
    pub method: FrontendAuthMethod,
    /// Seeds the mock SCRAM salt for unknown users; created once at startup.
    pub process_nonce: [u8; 32],
}

impl AuthContext {
    pub fn new(store: PasswordStore, method: FrontendAuthMethod) -> Arc<Self> {
        Arc::new(Self {
            store,
            method,
            process_nonce: rand::random(),
        })
    }
}

/// Run the configured challenge against a connecting client. On success the
/// AuthenticationOk is queued but not yet flushed; the caller follows up
/// with parameters and ReadyForQuery.
pub async fn authenticate_frontend<S>(
    stream: &mut WireStream<S>,
    username: &str,
    client: &ClientIdentifier,
    ctx: &AuthContext,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match ctx.method {
        FrontendAuthMethod::Trust => {
            stream.write_raw(&auth_ok());
            Ok(())
        }
        FrontendAuthMethod::ClearText => authenticate_clear_text(stream, username, client, ctx).await,
        FrontendAuthMethod::Md5 => authenticate_md5(stream, username, client, ctx).await,
        FrontendAuthMethod::ScramSha256 => authenticate_scram(stream, username, client, ctx).await,
    }
}

async fn authenticate_clear_text<S>(
    stream: &mut WireStream<S>,
    username: &str,
    client: &ClientIdentifier,
    ctx: &AuthContext,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_raw(&plain_password_challenge());
    stream.flush().await?;
    let password = vec_to_string(read_password(stream.get_mut()).await?)?;

    let ok = match ctx.store.lookup(username) {
        Some(StoredPassword::Plain(stored)) => constant_time_eq(stored.as_bytes(), password.as_bytes()),
        Some(stored @ StoredPassword::AesEncrypted(_)) => {
            let stored = ctx.store.resolve_plaintext(stored)?;
            constant_time_eq(stored.as_bytes(), password.as_bytes())
        }
        Some(StoredPassword::Md5(stored)) => {
            let mut md5 = Md5::new();
            md5.update(password.as_bytes());
            md5.update(username.as_bytes());
            let hashed = format!("md5{:x}", md5.finalize());
            constant_time_eq(hashed.as_bytes(), stored.as_bytes())
        }
        Some(StoredPassword::ScramVerifier(record)) => {
            verify_plaintext_against_verifier(record, &password)?
        }
        None => false,
    };

    finish_password_auth(stream, username, client, ok).await
}

async fn authenticate_md5<S>(
    stream: &mut WireStream<S>,
    username: &str,
    client: &ClientIdentifier,
    ctx: &AuthContext,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (salt, challenge) = md5_challenge();
    stream.write_raw(&challenge);
    stream.flush().await?;
    let response = read_password(stream.get_mut()).await?;

    let expected = match ctx.store.lookup(username) {
        Some(StoredPassword::Plain(stored)) => {
            Some(md5_hash_password(username, stored, &salt))
        }
        Some(stored @ StoredPassword::AesEncrypted(_)) => {
            let stored = ctx.store.resolve_plaintext(stored)?;
            Some(md5_hash_password(username, &stored, &salt))
        }
        Some(StoredPassword::Md5(stored)) => Some(md5_hash_second_pass(
            stored.strip_prefix("md5").unwrap_or(stored),
            &salt,
        )),
        Some(StoredPassword::ScramVerifier(_)) => {
            warn!("md5 auth requested for {client} but only a SCRAM verifier is stored");
            None
        }
        None => None,
    };

    let ok = expected
        .map(|expected| constant_time_eq(&expected, &response))
        .unwrap_or(false);
    finish_password_auth(stream, username, client, ok).await
}

async fn authenticate_scram<S>(
    stream: &mut WireStream<S>,
    username: &str,
    client: &ClientIdentifier,
    ctx: &AuthContext,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Resolve a verifier: stored directly, derived from a stored plaintext,
    // or mocked for an unknown user so the exchange length never betrays
    // user existence.
    let (verifier, doomed) = match ctx.store.lookup(username) {
        Some(StoredPassword::ScramVerifier(record)) => (ScramVerifier::parse(record)?, false),
        Some(StoredPassword::Plain(stored)) => (derive_session_verifier(stored), false),
        Some(stored @ StoredPassword::AesEncrypted(_)) => {
            let stored = ctx.store.resolve_plaintext(stored)?;
            (derive_session_verifier(&stored), false)
        }
        Some(StoredPassword::Md5(_)) => {
            warn!("SCRAM auth requested for {client} but only an md5 hash is stored");
            (ScramVerifier::mock(username, &ctx.process_nonce), true)
        }
        None => (ScramVerifier::mock(username, &ctx.process_nonce), true),
    };
    let mut server = ScramServer::new(verifier, doomed);

    stream.write_raw(&scram_start_challenge());
    stream.flush().await?;

    // SASLInitialResponse: mechanism name, then the length-prefixed
    // client-first message.
    let mut initial = bytes::BytesMut::from(&read_password(stream.get_mut()).await?[..]);
    let (mechanism, _) = initial.read_string()?;
    if mechanism != SCRAM_SHA_256 {
        return Err(Error::FeatureNotSupported(format!(
            "SASL mechanism {mechanism} is not supported"
        )));
    }
    let sasl_len = initial.read_i32()?;
    if sasl_len < 0 || sasl_len as usize != initial.len() {
        return Err(Error::ProtocolViolation(
            "SASLInitialResponse length mismatch".into(),
        ));
    }
    let client_first = String::from_utf8_lossy(&initial).to_string();

    let server_first = server.handle_client_first(&client_first)?;
    stream.write_raw(&scram_server_response(SASL_CONTINUE, &server_first));
    stream.flush().await?;

    let final_bytes = read_password(stream.get_mut()).await?;
    let client_final = String::from_utf8_lossy(&final_bytes).to_string();

    match server.handle_client_final(&client_final) {
        Ok(server_final) => {
            stream.write_raw(&scram_server_response(SASL_FINAL, &server_final));
            stream.write_raw(&auth_ok());
            Ok(())
        }
        Err(err @ Error::AuthFailure(_)) => {
            warn!("SCRAM authentication failed for {client}: {err}");
            wrong_password(stream.get_mut(), username).await?;
            Err(Error::AuthFailure(format!(
                "SCRAM authentication failed for {client}"
            )))
        }
        Err(err) => Err(err),
    }
}

/// A throwaway verifier derived from a stored plaintext password. The salt
/// is fresh per session, which is fine: the client never stores it.
fn derive_session_verifier(password: &str) -> ScramVerifier {
    ScramVerifier::from_password(password)
}

/// Check a clear-text password against a stored SCRAM verifier by deriving
/// the stored key with the verifier's own salt.
fn verify_plaintext_against_verifier(record: &str, password: &str) -> Result<bool, Error> {
    use base64::prelude::{Engine, BASE64_STANDARD};
    let verifier = ScramVerifier::parse(record)?;
    let salt = BASE64_STANDARD
        .decode(&verifier.salt_base64)
        .map_err(|_| Error::AuthFailure("malformed SCRAM verifier".into()))?;
    let derived = ScramVerifier::derive(password, &salt, verifier.iterations);
    Ok(constant_time_eq(&derived.stored_key, &verifier.stored_key))
}

async fn finish_password_auth<S>(
    stream: &mut WireStream<S>,
    username: &str,
    client: &ClientIdentifier,
    ok: bool,
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if !ok {
        warn!("password authentication failed for {client}");
        wrong_password(stream.get_mut(), username).await?;
        return Err(Error::AuthFailure(format!(
            "password authentication failed for {client}"
        )));
    }
    stream.write_raw(&auth_ok());
    Ok(())
}
