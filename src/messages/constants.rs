//! Wire protocol constants shared by the frontend and backend sides.

/// Version 3.0 of the PostgreSQL protocol.
pub const PROTOCOL_VERSION_3: i32 = 196608;
/// Version 2.0, recognized only far enough to refuse it.
pub const PROTOCOL_VERSION_2: i32 = 131072;
/// Magic "version" of an SSLRequest packet.
pub const SSL_REQUEST_CODE: i32 = 80877103;
/// Magic "version" of a CancelRequest packet.
pub const CANCEL_REQUEST_CODE: i32 = 80877102;

// Authentication response codes ('R' messages).
pub const AUTHENTICATION_SUCCESSFUL: i32 = 0;
pub const AUTHENTICATION_CLEAR_PASSWORD: i32 = 3;
pub const MD5_ENCRYPTED_PASSWORD: i32 = 5;
pub const SASL: i32 = 10;
pub const SASL_CONTINUE: i32 = 11;
pub const SASL_FINAL: i32 = 12;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
/// Channel-binding variant; advertised by servers we talk to, refused by us.
pub const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

pub const SCRAM_DEFAULT_ITERATIONS: u32 = 4096;
pub const SCRAM_SALT_LEN: usize = 16;
pub const SCRAM_NONCE_LEN: usize = 18;

// Stored-password form markers (password file records).
pub const MD5_PASSWORD_PREFIX: &str = "md5";
pub const AES_PASSWORD_PREFIX: &str = "AES";
pub const TEXT_PASSWORD_PREFIX: &str = "TEXT ";
pub const SCRAM_VERIFIER_PREFIX: &str = "SCRAM-SHA-256$";

/// Hard cap on one protocol frame, body included.
pub const MAX_MESSAGE_SIZE: i32 = 256 * 1024 * 1024;
