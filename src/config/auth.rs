//! Authentication-related settings.

use serde_derive::{Deserialize, Serialize};

/// How clients are challenged.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FrontendAuthMethod {
    Trust,
    ClearText,
    Md5,
    #[default]
    ScramSha256,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AuthSettings {
    #[serde(default)]
    pub frontend_auth_method: FrontendAuthMethod,

    /// Path to the password file; one `username:verifier` record per line.
    #[serde(default = "AuthSettings::default_password_file")]
    pub password_file: String,

    /// Key file for AES-encrypted stored passwords; loaded lazily.
    #[serde(default)]
    pub aes_key_file: Option<String>,

    /// Credentials the pooler presents to backends.
    #[serde(default)]
    pub server_username: Option<String>,
    #[serde(default)]
    pub server_password: Option<String>,
}

impl AuthSettings {
    pub fn default_password_file() -> String {
        "/etc/pg_relay/pool_passwd".into()
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        toml::from_str("").unwrap()
    }
}
