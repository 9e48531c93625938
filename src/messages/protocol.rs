//! One-off protocol message constructors.
//!
//! Everything here builds complete frames into `BytesMut`; the session layer
//! decides when they hit the wire.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::Error;
use crate::messages::constants::*;
use crate::messages::socket::write_all_flush;
use crate::messages::types::DataType;

/// Frame `body` as one complete message of the given kind.
pub fn frame(kind: u8, body: &[u8]) -> BytesMut {
    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(kind);
    res.put_i32(body.len() as i32 + 4);
    res.put_slice(body);
    res
}

/// AuthenticationOk.
pub fn auth_ok() -> BytesMut {
    frame(b'R', &AUTHENTICATION_SUCCESSFUL.to_be_bytes())
}

/// AuthenticationMD5Password with a fresh four-byte salt.
pub fn md5_challenge() -> ([u8; 4], BytesMut) {
    let salt: [u8; 4] = rand::random();
    let mut body = BytesMut::with_capacity(8);
    body.put_i32(MD5_ENCRYPTED_PASSWORD);
    body.put_slice(&salt);
    (salt, frame(b'R', &body))
}

/// AuthenticationCleartextPassword.
pub fn plain_password_challenge() -> BytesMut {
    frame(b'R', &AUTHENTICATION_CLEAR_PASSWORD.to_be_bytes())
}

/// AuthenticationSASL advertising SCRAM-SHA-256 only.
pub fn scram_start_challenge() -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(SASL);
    body.put_slice(SCRAM_SHA_256.as_bytes());
    body.put_u8(0);
    body.put_u8(0);
    frame(b'R', &body)
}

/// AuthenticationSASLContinue / AuthenticationSASLFinal.
pub fn scram_server_response(code: i32, data: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(4 + data.len());
    body.put_i32(code);
    body.put_slice(data.as_bytes());
    frame(b'R', &body)
}

/// Read a password ('p') message and return its payload.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: AsyncReadExt + Unpin,
{
    let mut code = [0u8; 1];
    stream
        .read_exact(&mut code)
        .await
        .map_err(|err| Error::SocketError(format!("read password message kind: {err}")))?;

    if code[0] != b'p' {
        return Err(Error::ProtocolViolation(format!(
            "expected password message (p), received '{}'",
            code[0] as char
        )));
    }

    let len = stream
        .read_i32()
        .await
        .map_err(|err| Error::SocketError(format!("read password message length: {err}")))?;
    if !(4..=MAX_MESSAGE_SIZE).contains(&len) {
        return Err(Error::ProtocolViolation(format!(
            "invalid password message length {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    stream
        .read_exact(&mut password)
        .await
        .map_err(|err| Error::SocketError(format!("read password message content: {err}")))?;
    Ok(password)
}

/// Simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(query.len() + 1);
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    frame(b'Q', &body)
}

/// StartupMessage for a backend connection.
pub fn startup_message(user: &str, database: &str, application_name: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i32(PROTOCOL_VERSION_3);
    for (key, value) in [
        ("user", user),
        ("database", database),
        ("application_name", application_name),
    ] {
        body.put_slice(key.as_bytes());
        body.put_u8(0);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);

    let mut startup = BytesMut::with_capacity(body.len() + 4);
    startup.put_i32(body.len() as i32 + 4);
    startup.put(body);
    startup
}

/// CancelRequest packet sent on a fresh backend connection.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Parse the NUL-separated key/value parameter block of a startup packet.
pub fn parse_startup_params(bytes: &BytesMut) -> Result<Vec<(String, String)>, Error> {
    let mut fields = Vec::new();
    let mut start = 0usize;
    for (i, &b) in bytes.iter().enumerate() {
        if b == 0 {
            if i == start {
                break; // final terminator
            }
            fields.push(String::from_utf8_lossy(&bytes[start..i]).to_string());
            start = i + 1;
        }
    }

    if fields.len() % 2 != 0 || fields.is_empty() {
        return Err(Error::ClientBadStartup(format!(
            "expected key-value pairs, received {} parameters",
            fields.len()
        )));
    }

    let mut params = Vec::with_capacity(fields.len() / 2);
    let mut iter = fields.into_iter();
    while let (Some(name), Some(value)) = (iter.next(), iter.next()) {
        params.push((name, value));
    }

    if !params.iter().any(|(name, _)| name == "user") {
        return Err(Error::ClientBadStartup(
            "user parameter is not specified".into(),
        ));
    }
    Ok(params)
}

/// First md5 pass: md5(password + user), hex-encoded.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    let first = format!("{:x}", md5.finalize());
    md5_hash_second_pass(&first, salt)
}

/// Second md5 pass: "md5" + md5(first_pass_hex + salt), NUL-terminated.
pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);
    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);
    password
}

/// ErrorResponse with severity FATAL.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    error_message_severity(message, code, "FATAL")
}

/// ErrorResponse with an explicit severity.
pub fn error_message_severity(message: &str, code: &str, severity: &str) -> BytesMut {
    let mut body = BytesMut::new();
    for (field, value) in [
        (b'S', severity),
        (b'V', severity),
        (b'C', code),
        (b'M', message),
    ] {
        body.put_u8(field);
        body.put_slice(value.as_bytes());
        body.put_u8(0);
    }
    body.put_u8(0);
    frame(b'E', &body)
}

/// ErrorResponse followed by ReadyForQuery; the session continues.
pub async fn error_response<S>(stream: &mut S, message: &str, code: &str) -> Result<(), Error>
where
    S: AsyncWriteExt + Unpin,
{
    let mut buf = error_message(message, code);
    buf.put(ready_for_query(b'I'));
    write_all_flush(stream, &buf).await
}

/// ErrorResponse alone; the session is being torn down.
pub async fn error_response_terminal<S>(
    stream: &mut S,
    message: &str,
    code: &str,
) -> Result<(), Error>
where
    S: AsyncWriteExt + Unpin,
{
    let buf = error_message(message, code);
    write_all_flush(stream, &buf).await
}

/// The one auth failure message every failed attempt produces, so a client
/// cannot tell a bad user from a bad password.
pub async fn wrong_password<S>(stream: &mut S, user: &str) -> Result<(), Error>
where
    S: AsyncWriteExt + Unpin,
{
    let buf = error_message(
        &format!("password authentication failed for user \"{user}\""),
        "28P01",
    );
    write_all_flush(stream, &buf).await
}

/// RowDescription for a synthetic result set.
pub fn row_description(columns: &[(&str, DataType)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for (name, data_type) in columns {
        body.put_slice(name.as_bytes());
        body.put_u8(0);
        body.put_i32(0); // no table oid
        body.put_i16(0); // no column number
        body.put_i32(data_type.into());
        body.put_i16(match data_type {
            DataType::Int4 | DataType::Oid => 4,
            DataType::Text => -1,
        });
        body.put_i32(-1); // type modifier
        body.put_i16(0); // text format
    }
    frame(b'T', &body)
}

/// DataRow for a synthetic result set.
pub fn data_row(row: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(row.len() as i16);
    for value in row {
        body.put_i32(value.len() as i32);
        body.put_slice(value.as_bytes());
    }
    frame(b'D', &body)
}

/// CommandComplete with the given tag.
pub fn command_complete(tag: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(tag.len() + 1);
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    frame(b'C', &body)
}

/// BackendKeyData with the pooler-issued cancellation pair.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut body = BytesMut::with_capacity(8);
    body.put_i32(process_id);
    body.put_i32(secret_key);
    frame(b'K', &body)
}

/// Flush.
pub fn flush_message() -> BytesMut {
    frame(b'H', &[])
}

/// Sync.
pub fn sync_message() -> BytesMut {
    frame(b'S', &[])
}

/// ParseComplete.
pub fn parse_complete() -> BytesMut {
    frame(b'1', &[])
}

/// EmptyQueryResponse.
pub fn empty_query_response() -> BytesMut {
    frame(b'I', &[])
}

/// ReadyForQuery with the given transaction status byte.
pub fn ready_for_query(status: u8) -> BytesMut {
    frame(b'Z', &[status])
}

/// ParameterStatus.
pub fn server_parameter_message(key: &str, value: &str) -> BytesMut {
    let mut body = BytesMut::with_capacity(key.len() + value.len() + 2);
    body.put_slice(key.as_bytes());
    body.put_u8(0);
    body.put_slice(value.as_bytes());
    body.put_u8(0);
    frame(b'S', &body)
}
