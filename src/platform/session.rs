// ============================================================================
// File: packages/ovbackup/src/platform/session.rs
// ----------------------------------------------------------------------------
// Authenticated session handed to the REST adapter
// ============================================================================

use std::fmt;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

/// Engine credentials; the password never appears in Debug output
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Value of the `Authorization` header for HTTP basic auth
    pub fn basic_auth(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Basic {token}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Certificate checks for `https` endpoints
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Accept any certificate and host name
    pub insecure: bool,

    /// Extra PEM root certificate, usually the engine CA
    pub ca_file: Option<PathBuf>,
}

/// Endpoint and credentials of one engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// API root, e.g. `https://engine.example.com/ovirt-engine/api`
    pub endpoint: Url,

    pub credentials: Credentials,

    pub tls: TlsSettings,
}

impl Session {
    pub fn new(endpoint: Url, credentials: Credentials) -> Self {
        Self {
            endpoint,
            credentials,
            tls: TlsSettings::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Absolute URI for an API path relative to the endpoint
    pub fn resolve(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.endpoint.as_str().trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}
