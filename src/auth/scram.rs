//! SCRAM-SHA-256 server-side exchange (RFCs 5802/7677).
//!
//! Deviations, all deliberate: the SASL-supplied username is ignored in
//! favor of the startup-packet username; a stored password that fails
//! SASLprep is used as raw bytes; channel binding is refused; and an unknown
//! user gets a mock verifier so the exchange runs to completion before
//! failing, leaking nothing about user existence.

use base64::prelude::{Engine, BASE64_STANDARD};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::errors::Error;
use crate::messages::constants::{SCRAM_DEFAULT_ITERATIONS, SCRAM_NONCE_LEN, SCRAM_SALT_LEN};

type HmacSha256 = Hmac<Sha256>;

/// Compare digests without leaking the position of the first difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// SASLprep the password; raw bytes when the input does not survive it.
pub fn normalize_password(password: &str) -> Vec<u8> {
    match stringprep::saslprep(password) {
        Ok(normalized) => normalized.into_owned().into_bytes(),
        Err(_) => password.as_bytes().to_vec(),
    }
}

/// Hi(): PBKDF2-HMAC-SHA256 with a single output block.
pub fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u: [u8; 32] = mac.finalize().into_bytes().into();
    let mut result = u;

    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(password).expect("hmac accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes().into();
        for (r, x) in result.iter_mut().zip(u.iter()) {
            *r ^= x;
        }
    }
    result
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn gen_nonce() -> String {
    let raw: Vec<u8> = (0..SCRAM_NONCE_LEN).map(|_| rand::rng().random()).collect();
    BASE64_STANDARD.encode(raw)
}

/// The stored quadruple from a `SCRAM-SHA-256$<i>:<salt>$<stored>:<server>`
/// verifier record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramVerifier {
    pub iterations: u32,
    pub salt_base64: String,
    pub stored_key: Vec<u8>,
    pub server_key: Vec<u8>,
}

impl ScramVerifier {
    pub fn parse(record: &str) -> Result<ScramVerifier, Error> {
        let bad = || Error::AuthFailure("malformed SCRAM verifier".into());

        let mut parts = record.split('$');
        if parts.next() != Some("SCRAM-SHA-256") {
            return Err(bad());
        }
        let (iterations, salt_base64) = parts
            .next()
            .and_then(|p| p.split_once(':'))
            .ok_or_else(bad)?;
        let (stored_b64, server_b64) = parts
            .next()
            .and_then(|p| p.split_once(':'))
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }

        let iterations: u32 = iterations.parse().map_err(|_| bad())?;
        BASE64_STANDARD.decode(salt_base64).map_err(|_| bad())?;
        let stored_key = BASE64_STANDARD.decode(stored_b64).map_err(|_| bad())?;
        let server_key = BASE64_STANDARD.decode(server_b64).map_err(|_| bad())?;
        if iterations == 0 || stored_key.len() != 32 || server_key.len() != 32 {
            return Err(bad());
        }

        Ok(ScramVerifier {
            iterations,
            salt_base64: salt_base64.to_string(),
            stored_key,
            server_key,
        })
    }

    /// Derive a verifier from a plaintext password with a fresh salt.
    pub fn from_password(password: &str) -> ScramVerifier {
        let salt: [u8; SCRAM_SALT_LEN] = rand::rng().random();
        Self::derive(password, &salt, SCRAM_DEFAULT_ITERATIONS)
    }

    pub fn derive(password: &str, salt: &[u8], iterations: u32) -> ScramVerifier {
        let salted = hi(&normalize_password(password), salt, iterations);
        ScramVerifier {
            iterations,
            salt_base64: BASE64_STANDARD.encode(salt),
            stored_key: sha256(&hmac(&salted, b"Client Key")).to_vec(),
            server_key: hmac(&salted, b"Server Key").to_vec(),
        }
    }

    /// Serialize back to the password-file record form.
    pub fn to_record(&self) -> String {
        format!(
            "SCRAM-SHA-256${}:{}${}:{}",
            self.iterations,
            self.salt_base64,
            BASE64_STANDARD.encode(&self.stored_key),
            BASE64_STANDARD.encode(&self.server_key),
        )
    }

    /// Verifier for a user we know nothing about. The salt is derived from
    /// the username and a process-wide nonce, so the same unknown user sees
    /// the same salt every time, exactly like a real one would.
    pub fn mock(username: &str, process_nonce: &[u8]) -> ScramVerifier {
        let mut hasher = Sha256::new();
        hasher.update(username.as_bytes());
        hasher.update(process_nonce);
        let digest: [u8; 32] = hasher.finalize().into();
        ScramVerifier {
            iterations: SCRAM_DEFAULT_ITERATIONS,
            salt_base64: BASE64_STANDARD.encode(&digest[..SCRAM_SALT_LEN]),
            // Never consulted: a mock exchange is doomed before verification.
            stored_key: vec![0; 32],
            server_key: vec![0; 32],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Init,
    SaltSent,
    Finished,
}

/// One server-side SCRAM exchange.
pub struct ScramServer {
    state: ServerState,
    verifier: ScramVerifier,
    /// Mock exchange for an unknown user; runs to completion, then fails.
    doomed: bool,
    client_first_bare: String,
    server_first: String,
    full_nonce: String,
}

impl ScramServer {
    pub fn new(verifier: ScramVerifier, doomed: bool) -> Self {
        Self {
            state: ServerState::Init,
            verifier,
            doomed,
            client_first_bare: String::new(),
            server_first: String::new(),
            full_nonce: String::new(),
        }
    }

    /// Consume the client-first message, produce the server-first reply.
    pub fn handle_client_first(&mut self, message: &str) -> Result<String, Error> {
        if self.state != ServerState::Init {
            return Err(Error::ProtocolViolation(
                "SCRAM message out of sequence".into(),
            ));
        }

        let bare = match message.split_once(',') {
            Some(("n", rest)) | Some(("y", rest)) => rest,
            Some((gs2, _)) if gs2.starts_with("p=") => {
                return Err(Error::FeatureNotSupported(
                    "channel binding is not supported".into(),
                ))
            }
            _ => {
                return Err(Error::ProtocolViolation(
                    "malformed SCRAM client-first message".into(),
                ))
            }
        };
        // Skip the authzid field.
        let bare = bare
            .split_once(',')
            .map(|(_, rest)| rest)
            .ok_or_else(|| Error::ProtocolViolation("malformed SCRAM client-first message".into()))?;

        let mut client_nonce = None;
        for attr in bare.split(',') {
            match attr.split_once('=') {
                // The username attribute is required to be present but its
                // value is ignored; the startup packet names the user.
                Some(("n", _)) => {}
                Some(("r", value)) => client_nonce = Some(value),
                Some(("m", _)) => {
                    return Err(Error::FeatureNotSupported(
                        "SCRAM mandatory extensions are not supported".into(),
                    ))
                }
                _ => {}
            }
        }
        let client_nonce = client_nonce.ok_or_else(|| {
            Error::ProtocolViolation("SCRAM client-first message carries no nonce".into())
        })?;

        self.client_first_bare = bare.to_string();
        self.full_nonce = format!("{client_nonce}{}", gen_nonce());
        self.server_first = format!(
            "r={},s={},i={}",
            self.full_nonce, self.verifier.salt_base64, self.verifier.iterations
        );
        self.state = ServerState::SaltSent;
        Ok(self.server_first.clone())
    }

    /// Consume the client-final message; produce the server-final reply or
    /// an authentication failure.
    pub fn handle_client_final(&mut self, message: &str) -> Result<String, Error> {
        if self.state != ServerState::SaltSent {
            return Err(Error::ProtocolViolation(
                "SCRAM message out of sequence".into(),
            ));
        }
        self.state = ServerState::Finished;

        let mut channel_binding = None;
        let mut nonce = None;
        let mut proof_b64 = None;
        for attr in message.split(',') {
            match attr.split_once('=') {
                Some(("c", value)) => channel_binding = Some(value),
                Some(("r", value)) => nonce = Some(value),
                Some(("p", value)) => proof_b64 = Some(value),
                _ => {}
            }
        }
        let (channel_binding, nonce, proof_b64) = match (channel_binding, nonce, proof_b64) {
            (Some(c), Some(r), Some(p)) => (c, r, p),
            _ => {
                return Err(Error::ProtocolViolation(
                    "malformed SCRAM client-final message".into(),
                ))
            }
        };

        // base64("n,,") or base64("y,,"); anything else smells of a
        // channel-binding downgrade.
        if channel_binding != "biws" && channel_binding != "eSws" {
            return Err(Error::ProtocolViolation(
                "unexpected SCRAM channel-binding data".into(),
            ));
        }
        if nonce != self.full_nonce {
            return Err(Error::ProtocolViolation("SCRAM nonce mismatch".into()));
        }
        let proof = BASE64_STANDARD
            .decode(proof_b64)
            .map_err(|_| Error::ProtocolViolation("undecodable SCRAM proof".into()))?;
        if proof.len() != 32 {
            return Err(Error::ProtocolViolation("undecodable SCRAM proof".into()));
        }

        let client_final_without_proof = format!("c={channel_binding},r={nonce}");
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare, self.server_first, client_final_without_proof
        );

        // Recover ClientKey from the proof, then check H(ClientKey) against
        // StoredKey. Done even for a doomed exchange so the timing of a
        // wrong password and an unknown user match.
        let client_signature = hmac(&self.verifier.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(client_signature.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        let ok = constant_time_eq(&sha256(&client_key), &self.verifier.stored_key);

        if !ok || self.doomed {
            return Err(Error::AuthFailure("SCRAM proof did not verify".into()));
        }

        let server_signature = hmac(&self.verifier.server_key, auth_message.as_bytes());
        Ok(format!("v={}", BASE64_STANDARD.encode(server_signature)))
    }
}
