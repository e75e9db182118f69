use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use filelink_core::AssociationKinds;
use filelink_transport::FtpConfig;
use sqlx::postgres::PgConnectOptions;
use thiserror::Error;

pub const DEFAULT_SYNC_CRON: &str = "0 0 * * * *";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Clone)]
pub struct DatabaseConfig {
    /// Full connection string; takes precedence over the discrete fields.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

impl DatabaseConfig {
    pub fn connect_options(&self) -> Result<PgConnectOptions, ConfigError> {
        if let Some(url) = &self.url {
            return PgConnectOptions::from_str(url).map_err(|_| ConfigError::Invalid {
                key: "DATABASE_URL",
                value: "<redacted>".to_string(),
            });
        }
        Ok(PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.name)
            .username(&self.user)
            .password(&self.password))
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Process-wide settings, read once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub remote: FtpConfig,
    pub database: DatabaseConfig,
    pub kinds: AssociationKinds,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key/value source. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(key));

        let remote = FtpConfig {
            host: required("FTP_HOST")?,
            port: parse_or(&get, "FTP_PORT", 21)?,
            user: required("FTP_USER")?,
            password: required("FTP_PASSWD")?,
            directory: get("FTP_DIR"),
            timeout: Duration::from_secs(parse_or(&get, "FTP_TIMEOUT_SECS", 30)?),
        };

        let database = match get("DATABASE_URL") {
            Some(url) => DatabaseConfig {
                url: Some(url),
                host: String::new(),
                port: 5432,
                name: String::new(),
                user: String::new(),
                password: String::new(),
            },
            None => DatabaseConfig {
                url: None,
                host: required("DB_HOST")?,
                port: parse_or(&get, "DB_PORT", 5432)?,
                name: required("DB_NAME")?,
                user: required("DB_USER")?,
                password: required("DB_PASSWD")?,
            },
        };

        let defaults = AssociationKinds::default();
        let kinds = AssociationKinds {
            source_type: get("FILELINK_SOURCE_TYPE").unwrap_or(defaults.source_type),
            target_type: get("FILELINK_TARGET_TYPE").unwrap_or(defaults.target_type),
            purpose: get("FILELINK_PURPOSE").unwrap_or(defaults.purpose),
        };

        Ok(Self {
            remote,
            database,
            kinds,
            sync_cron: get("FILELINK_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        })
    }
}

fn parse_or<G, T>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    const BASE: &[(&str, &str)] = &[
        ("FTP_HOST", "ftp.example.test"),
        ("FTP_USER", "uploader"),
        ("FTP_PASSWD", "ftp-secret"),
        ("DB_HOST", "db.example.test"),
        ("DB_NAME", "erp"),
        ("DB_USER", "sync"),
        ("DB_PASSWD", "db-secret"),
    ];

    #[test]
    fn defaults_fill_optional_settings() {
        let config = SyncConfig::from_lookup(lookup(BASE)).expect("config");
        assert_eq!(config.remote.port, 21);
        assert_eq!(config.remote.directory, None);
        assert_eq!(config.remote.timeout, Duration::from_secs(30));
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.kinds, AssociationKinds::default());
        assert_eq!(config.sync_cron, DEFAULT_SYNC_CRON);
    }

    #[test]
    fn overrides_are_applied() {
        let mut pairs = BASE.to_vec();
        pairs.extend([
            ("FTP_PORT", "2121"),
            ("FTP_DIR", "/incoming"),
            ("DB_PORT", "6543"),
            ("FILELINK_SOURCE_TYPE", "LS"),
            ("FILELINK_TARGET_TYPE", "FILE"),
        ]);
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert_eq!(config.remote.port, 2121);
        assert_eq!(config.remote.directory.as_deref(), Some("/incoming"));
        assert_eq!(config.database.port, 6543);
        assert_eq!(config.kinds.source_type, "LS");
        assert_eq!(config.kinds.target_type, "FILE");
        assert_eq!(config.kinds.purpose, "S");
    }

    #[test]
    fn missing_credentials_are_reported_by_name() {
        let pairs: Vec<_> = BASE
            .iter()
            .copied()
            .filter(|(k, _)| *k != "FTP_PASSWD")
            .collect();
        let err = SyncConfig::from_lookup(lookup(&pairs)).expect_err("missing password");
        assert!(matches!(err, ConfigError::Missing("FTP_PASSWD")));
    }

    #[test]
    fn database_url_replaces_discrete_fields() {
        let pairs = [
            ("FTP_HOST", "ftp.example.test"),
            ("FTP_USER", "uploader"),
            ("FTP_PASSWD", "ftp-secret"),
            ("DATABASE_URL", "postgres://sync:pw@localhost:5432/erp"),
        ];
        let config = SyncConfig::from_lookup(lookup(&pairs)).expect("config");
        assert!(config.database.url.is_some());
        assert!(config.database.connect_options().is_ok());
    }

    #[test]
    fn bad_port_is_invalid() {
        let mut pairs = BASE.to_vec();
        pairs.push(("DB_PORT", "not-a-port"));
        let err = SyncConfig::from_lookup(lookup(&pairs)).expect_err("bad port");
        assert!(matches!(err, ConfigError::Invalid { key: "DB_PORT", .. }));
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let config = SyncConfig::from_lookup(lookup(BASE)).expect("config");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("ftp-secret"));
        assert!(!rendered.contains("db-secret"));
    }
}
