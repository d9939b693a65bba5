// ============================================================================
// File: packages/ovbackup/src/config/mod.rs
// ----------------------------------------------------------------------------
// Engine connection settings and backup tunables from the shell rc file
// ============================================================================

mod ini;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use url::Url;

pub use ini::{IniDocument, IniSyntaxError};

use crate::orchestrator::BackupSettings;
use crate::platform::{Backoff, Credentials, Session, TlsSettings};

pub const DEFAULT_CONFIG_PATH: &str = "/root/.ovirtshellrc";

const SHELL_SECTION: &str = "ovirt-shell";
const BACKUP_SECTION: &str = "backup";

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("{}: {source}", path.display())]
    Syntax {
        path: PathBuf,
        source: IniSyntaxError,
    },

    #[error("{}: missing '{key}' in [{section}]", path.display())]
    Missing {
        path: PathBuf,
        section: &'static str,
        key: &'static str,
    },

    #[error("{}: invalid value for '{key}': {message}", path.display())]
    Invalid {
        path: PathBuf,
        key: &'static str,
        message: String,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Contents of the shell rc file
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub url: Url,
    pub credentials: Credentials,
    pub tls: TlsSettings,
    pub settings: BackupSettings,
}

impl ShellConfig {
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &text)
    }

    /// Parse `text` as if read from `path` (used in messages only)
    pub fn parse(path: &Path, text: &str) -> ConfigResult<Self> {
        let document = IniDocument::parse(text).map_err(|source| ConfigError::Syntax {
            path: path.to_path_buf(),
            source,
        })?;
        let reader = Reader { path, document };

        let url = reader.required("url")?;
        let url = Url::parse(url).map_err(|e| reader.invalid("url", e.to_string()))?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(reader.invalid("url", format!("unsupported scheme '{other}'"))),
        }

        let credentials = Credentials::new(
            reader.required("username")?,
            reader.required("password")?,
        );
        let tls = TlsSettings {
            insecure: reader.flag("insecure")?.unwrap_or(false),
            ca_file: reader
                .document
                .get(SHELL_SECTION, "ca_file")
                .filter(|value| !value.is_empty())
                .map(PathBuf::from),
        };
        let settings = reader.settings()?;

        Ok(Self {
            url,
            credentials,
            tls,
            settings,
        })
    }

    pub fn session(&self) -> Session {
        Session::new(self.url.clone(), self.credentials.clone()).with_tls(self.tls.clone())
    }
}

struct Reader<'a> {
    path: &'a Path,
    document: IniDocument,
}

impl Reader<'_> {
    fn invalid(&self, key: &'static str, message: String) -> ConfigError {
        ConfigError::Invalid {
            path: self.path.to_path_buf(),
            key,
            message,
        }
    }

    fn required(&self, key: &'static str) -> ConfigResult<&str> {
        self.document
            .get(SHELL_SECTION, key)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ConfigError::Missing {
                path: self.path.to_path_buf(),
                section: SHELL_SECTION,
                key,
            })
    }

    /// Boolean in `[ovirt-shell]`, spelled the way ovirt-shell accepts it
    fn flag(&self, key: &'static str) -> ConfigResult<Option<bool>> {
        let Some(value) = self.document.get(SHELL_SECTION, key) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(Some(true)),
            "false" | "no" | "off" | "0" | "" => Ok(Some(false)),
            _ => Err(self.invalid(key, format!("'{value}' is not a boolean"))),
        }
    }

    fn number<T>(&self, key: &'static str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.document
            .get(BACKUP_SECTION, key)
            .map(|value| value.parse::<T>().map_err(|e| self.invalid(key, e.to_string())))
            .transpose()
    }

    fn seconds(&self, key: &'static str) -> ConfigResult<Option<Duration>> {
        Ok(self.number::<u64>(key)?.map(Duration::from_secs))
    }

    fn millis(&self, key: &'static str) -> ConfigResult<Option<Duration>> {
        Ok(self.number::<u64>(key)?.map(Duration::from_millis))
    }

    fn settings(&self) -> ConfigResult<BackupSettings> {
        let mut settings = BackupSettings::new();

        if let Some(t) = self.seconds("snapshot_timeout_secs")? {
            settings = settings.with_snapshot_timeout(t);
        }
        if let Some(t) = self.seconds("disk_timeout_secs")? {
            settings = settings.with_disk_timeout(t);
        }
        if let Some(t) = self.seconds("attach_timeout_secs")? {
            settings = settings.with_attach_timeout(t);
        }
        if let Some(t) = self.seconds("device_timeout_secs")? {
            settings = settings.with_device_timeout(t);
        }
        if let Some(t) = self.seconds("migrate_timeout_secs")? {
            settings = settings.with_migrate_timeout(t);
        }
        if let Some(t) = self.seconds("cleanup_timeout_secs")? {
            settings = settings.with_cleanup_timeout(t);
        }
        if let Some(t) = self.seconds("cancel_cleanup_timeout_secs")? {
            settings = settings.with_cancel_cleanup_timeout(t);
        }
        if let Some(t) = self.seconds("request_timeout_secs")? {
            settings = settings.with_request_timeout(t);
        }

        let initial = self.millis("poll_initial_ms")?;
        let max = self.millis("poll_max_ms")?;
        if initial.is_some() || max.is_some() {
            let defaults = settings.backoff;
            let initial = initial.unwrap_or(defaults.initial);
            let max = max.unwrap_or(defaults.max).max(initial);
            settings = settings.with_backoff(Backoff::new(initial, max));
        }

        if let Some(attempts) = self.number::<u32>("retry_attempts")? {
            settings = settings.with_retry_attempts(attempts);
        }
        Ok(settings)
    }
}
