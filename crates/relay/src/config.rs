// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The database pool reads its own `MURMUR_RELAY_DB_*` knobs.

use std::{net::SocketAddr, time::Duration};

const DEV_ACCESS_TOKEN_SECRET: &str = "murmur_local_development_access_secret_32_chars";
const DEV_REFRESH_TOKEN_SECRET: &str = "murmur_local_development_refresh_secret_32_chars";
const DEV_INVITE_SECRET: &str = "murmur_local_development_invite_secret_32_chars";
const DEFAULT_PORT: u16 = 5000;
const DEFAULT_CREDENTIAL_PURGE_SECS: u64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listen_addr: SocketAddr,
    /// HS256 secret for access tokens.
    pub access_token_secret: String,
    /// Prefix of every refresh token's signing key; the credential salt is
    /// appended per token.
    pub refresh_token_secret: String,
    /// Mixed into every invite digest.
    pub invite_secret: String,
    /// PostgreSQL connection string. `None` selects the in-memory store.
    pub database_url: Option<String>,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub log_filter: String,
    pub log_format: LogFormat,
    pub credential_purge_interval: Duration,
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `MURMUR_RELAY_HOST` | `0.0.0.0` |
    /// | `MURMUR_RELAY_PORT` | `5000` |
    /// | `MURMUR_RELAY_ACCESS_TOKEN_SECRET` | dev-only placeholder |
    /// | `MURMUR_RELAY_REFRESH_TOKEN_SECRET` | dev-only placeholder |
    /// | `MURMUR_RELAY_INVITE_SECRET` | dev-only placeholder |
    /// | `MURMUR_RELAY_DATABASE_URL` | *(none: in-memory store)* |
    /// | `MURMUR_RELAY_CORS_ORIGINS` | *(none: cors.rs uses dev defaults)* |
    /// | `MURMUR_RELAY_LOG_FILTER` | `info` |
    /// | `MURMUR_RELAY_LOG_FORMAT` | `text` (`json` for JSON lines) |
    /// | `MURMUR_RELAY_CREDENTIAL_PURGE_SECS` | `3600` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("MURMUR_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 =
            env("MURMUR_RELAY_PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let access_token_secret = env("MURMUR_RELAY_ACCESS_TOKEN_SECRET")
            .unwrap_or_else(|_| DEV_ACCESS_TOKEN_SECRET.into());
        let refresh_token_secret = env("MURMUR_RELAY_REFRESH_TOKEN_SECRET")
            .unwrap_or_else(|_| DEV_REFRESH_TOKEN_SECRET.into());
        let invite_secret =
            env("MURMUR_RELAY_INVITE_SECRET").unwrap_or_else(|_| DEV_INVITE_SECRET.into());

        let database_url = env("MURMUR_RELAY_DATABASE_URL").ok().filter(|url| !url.is_empty());
        let cors_origins = env("MURMUR_RELAY_CORS_ORIGINS").ok();

        let log_filter = env("MURMUR_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("MURMUR_RELAY_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let purge_secs = env("MURMUR_RELAY_CREDENTIAL_PURGE_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_CREDENTIAL_PURGE_SECS);

        Self {
            listen_addr,
            access_token_secret,
            refresh_token_secret,
            invite_secret,
            database_url,
            cors_origins,
            log_filter,
            log_format,
            credential_purge_interval: Duration::from_secs(purge_secs),
        }
    }

    /// Returns true when any signing secret is still a development default.
    pub fn uses_dev_secrets(&self) -> bool {
        self.access_token_secret == DEV_ACCESS_TOKEN_SECRET
            || self.refresh_token_secret == DEV_REFRESH_TOKEN_SECRET
            || self.invite_secret == DEV_INVITE_SECRET
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| map.get(key).map(|v| v.to_string()).ok_or(std::env::VarError::NotPresent)
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RelayConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:5000");
        assert!(cfg.uses_dev_secrets());
        assert!(cfg.database_url.is_none());
        assert!(cfg.cors_origins.is_none());
        assert_eq!(cfg.log_filter, "info");
        assert_eq!(cfg.log_format, LogFormat::Text);
        assert_eq!(cfg.credential_purge_interval, Duration::from_secs(3600));
    }

    #[test]
    fn dev_secrets_are_long_enough_for_the_token_service() {
        for secret in [DEV_ACCESS_TOKEN_SECRET, DEV_REFRESH_TOKEN_SECRET, DEV_INVITE_SECRET] {
            assert!(secret.len() >= 32, "{secret} is too short");
        }
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_HOST", "127.0.0.1");
        m.insert("MURMUR_RELAY_PORT", "3000");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_PORT", "not_a_number");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 5000);
    }

    #[test]
    fn all_secrets_overridden_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_ACCESS_TOKEN_SECRET", "production_access_secret_at_least_32_chars");
        m.insert("MURMUR_RELAY_REFRESH_TOKEN_SECRET", "production_refresh_secret_at_least_32_chars");
        let partial = RelayConfig::from_env_fn(env_from_map(m.clone()));
        assert!(partial.uses_dev_secrets());

        m.insert("MURMUR_RELAY_INVITE_SECRET", "production_invite_secret_at_least_32_chars");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.uses_dev_secrets());
        assert_eq!(cfg.invite_secret, "production_invite_secret_at_least_32_chars");
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_DATABASE_URL", "postgres://u:p@host/db");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
    }

    #[test]
    fn empty_database_url_selects_memory_store() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_DATABASE_URL", "");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert!(cfg.database_url.is_none());
    }

    #[test]
    fn log_settings_override() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_LOG_FILTER", "debug,tower_http=trace");
        m.insert("MURMUR_RELAY_LOG_FORMAT", "JSON");
        let cfg = RelayConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn purge_interval_ignores_zero_and_garbage() {
        let mut m = HashMap::new();
        m.insert("MURMUR_RELAY_CREDENTIAL_PURGE_SECS", "0");
        assert_eq!(
            RelayConfig::from_env_fn(env_from_map(m.clone())).credential_purge_interval,
            Duration::from_secs(3600)
        );

        m.insert("MURMUR_RELAY_CREDENTIAL_PURGE_SECS", "120");
        assert_eq!(
            RelayConfig::from_env_fn(env_from_map(m)).credential_purge_interval,
            Duration::from_secs(120)
        );
    }
}
