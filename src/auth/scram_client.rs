//! SCRAM-SHA-256 client side, used when the backend demands SASL.

use base64::prelude::{Engine, BASE64_STANDARD};
use bytes::BytesMut;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::auth::scram::{constant_time_eq, hi, normalize_password};
use crate::errors::Error;
use crate::messages::constants::SCRAM_NONCE_LEN;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Init,
    NonceSent,
    ProofSent,
    Finished,
}

/// One client-side SCRAM exchange against a backend.
pub struct ScramSha256 {
    state: ClientState,
    password: String,
    nonce: String,
    client_first_bare: String,
    auth_message: String,
    salted_password: [u8; 32],
}

impl ScramSha256 {
    pub fn new(password: &str) -> Self {
        let raw: Vec<u8> = (0..SCRAM_NONCE_LEN)
            .map(|_| rand::rng().random::<u8>())
            .collect();
        Self::with_nonce(password, BASE64_STANDARD.encode(raw))
    }

    fn with_nonce(password: &str, nonce: String) -> Self {
        Self {
            state: ClientState::Init,
            password: password.to_string(),
            nonce,
            client_first_bare: String::new(),
            auth_message: String::new(),
            salted_password: [0; 32],
        }
    }

    /// The client-first message. The username attribute is empty; servers
    /// take the user from the startup packet.
    pub fn message(&mut self) -> BytesMut {
        assert_eq!(self.state, ClientState::Init);
        self.client_first_bare = format!("n=,r={}", self.nonce);
        self.state = ClientState::NonceSent;
        BytesMut::from(format!("n,,{}", self.client_first_bare).as_bytes())
    }

    /// Consume server-first, produce client-final.
    pub fn update(&mut self, message: &BytesMut) -> Result<BytesMut, Error> {
        if self.state != ClientState::NonceSent {
            return Err(Error::ProtocolViolation(
                "SCRAM message out of sequence".into(),
            ));
        }

        let server_first = String::from_utf8_lossy(message).to_string();
        let mut server_nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", value)) => server_nonce = Some(value.to_string()),
                Some(("s", value)) => {
                    salt = Some(BASE64_STANDARD.decode(value).map_err(|_| {
                        Error::ProtocolViolation("undecodable SCRAM salt".into())
                    })?)
                }
                Some(("i", value)) => iterations = value.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (server_nonce, salt, iterations) = match (server_nonce, salt, iterations) {
            (Some(r), Some(s), Some(i)) if i > 0 => (r, s, i),
            _ => {
                return Err(Error::ProtocolViolation(
                    "malformed SCRAM server-first message".into(),
                ))
            }
        };
        if !server_nonce.starts_with(&self.nonce) {
            return Err(Error::ProtocolViolation(
                "SCRAM server nonce does not extend ours".into(),
            ));
        }

        self.salted_password = hi(&normalize_password(&self.password), &salt, iterations);

        let without_proof = format!("c=biws,r={server_nonce}");
        self.auth_message = format!(
            "{},{server_first},{without_proof}",
            self.client_first_bare
        );

        let client_key = hmac(&self.salted_password, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();
        let client_signature = hmac(&stored_key, self.auth_message.as_bytes());
        let proof: Vec<u8> = client_key
            .iter()
            .zip(client_signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        self.state = ClientState::ProofSent;
        Ok(BytesMut::from(
            format!("{without_proof},p={}", BASE64_STANDARD.encode(proof)).as_bytes(),
        ))
    }

    /// Verify the server-final signature.
    pub fn finish(&mut self, message: &BytesMut) -> Result<(), Error> {
        if self.state != ClientState::ProofSent {
            return Err(Error::ProtocolViolation(
                "SCRAM message out of sequence".into(),
            ));
        }
        self.state = ClientState::Finished;

        let server_final = String::from_utf8_lossy(message).to_string();
        let signature_b64 = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
            .ok_or_else(|| {
                Error::ProtocolViolation("malformed SCRAM server-final message".into())
            })?;
        let signature = BASE64_STANDARD
            .decode(signature_b64)
            .map_err(|_| Error::ProtocolViolation("undecodable SCRAM server signature".into()))?;

        let server_key = hmac(&self.salted_password, b"Server Key");
        let expected = hmac(&server_key, self.auth_message.as_bytes());
        if !constant_time_eq(&expected, &signature) {
            return Err(Error::AuthFailure(
                "backend SCRAM signature did not verify".into(),
            ));
        }
        Ok(())
    }
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::scram::{ScramServer, ScramVerifier};

    #[test]
    fn client_and_server_complete_a_round_trip() {
        let verifier = ScramVerifier::derive("hunter2", b"0123456789abcdef", 4096);
        let mut server = ScramServer::new(verifier, false);
        let mut client = ScramSha256::new("hunter2");

        let client_first = client.message();
        let server_first = server
            .handle_client_first(&String::from_utf8_lossy(&client_first))
            .unwrap();
        let client_final = client
            .update(&BytesMut::from(server_first.as_bytes()))
            .unwrap();
        let server_final = server
            .handle_client_final(&String::from_utf8_lossy(&client_final))
            .unwrap();
        client
            .finish(&BytesMut::from(server_final.as_bytes()))
            .unwrap();
    }

    #[test]
    fn tampered_server_signature_is_rejected() {
        let verifier = ScramVerifier::derive("hunter2", b"0123456789abcdef", 4096);
        let mut server = ScramServer::new(verifier, false);
        let mut client = ScramSha256::new("hunter2");

        let client_first = client.message();
        let server_first = server
            .handle_client_first(&String::from_utf8_lossy(&client_first))
            .unwrap();
        let client_final = client
            .update(&BytesMut::from(server_first.as_bytes()))
            .unwrap();
        let _ = server
            .handle_client_final(&String::from_utf8_lossy(&client_final))
            .unwrap();

        let forged = BytesMut::from(&b"v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="[..]);
        assert!(matches!(
            client.finish(&forged),
            Err(Error::AuthFailure(_))
        ));
    }

    #[test]
    fn truncated_server_first_is_a_protocol_violation() {
        let mut client = ScramSha256::new("pw");
        let _ = client.message();
        let result = client.update(&BytesMut::from(&b"r=onlynonce"[..]));
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }
}
