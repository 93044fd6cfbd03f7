//! Settings loading.
//!
//! Loading flow:
//! 1. Start with compiled [`GatewaySettings::default()`]
//! 2. Merge the JSON file, when one is given and exists
//! 3. Merge `CLINIC_*` environment variables (`__` separates sections)
//! 4. Merge the flat legacy names (`JWT_SECRET`, `AGENT_ENDPOINT`, ...)
//! 5. [`GatewaySettings::validate`]

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized};
use tracing::debug;

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Environment variable naming the settings file.
pub const CONFIG_PATH_ENV: &str = "CLINIC_CONFIG";

/// Flat variable names and the setting each one feeds.
const LEGACY_ENV: [(&str, &str); 8] = [
    ("JWT_SECRET", "auth.jwt_secret"),
    ("AGENT_ENDPOINT", "agent.endpoint"),
    ("LOG_LEVEL", "logging.level"),
    ("LOG_FORMAT", "logging.format"),
    ("HOST", "server.host"),
    ("PORT", "server.port"),
    ("WS_MAX_CONNECTIONS", "server.max_connections"),
    ("WS_PING_INTERVAL", "connection.heartbeat_interval_secs"),
];

/// Settings file path from `CLINIC_CONFIG`, if set.
pub fn config_path_from_env() -> Option<PathBuf> {
    std::env::var_os(CONFIG_PATH_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

/// Build the layered figment without extracting it.
pub fn figment(path: Option<&Path>) -> Figment {
    let mut figment = Figment::from(Serialized::defaults(GatewaySettings::default()));

    if let Some(path) = path {
        if path.exists() {
            debug!(?path, "loading settings from file");
            figment = figment.merge(Json::file(path));
        } else {
            debug!(?path, "settings file not found, using defaults");
        }
    }

    figment
        .merge(Env::prefixed("CLINIC_").ignore(&["config"]).split("__"))
        .merge(legacy_env())
}

fn legacy_env() -> Env {
    Env::raw()
        .only(&LEGACY_ENV.map(|(name, _)| name))
        .map(|key| {
            LEGACY_ENV
                .iter()
                .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
                .map_or_else(|| key.into(), |(_, path)| (*path).into())
        })
}

/// Load, merge and validate settings.
pub fn load_settings(path: Option<&Path>) -> Result<GatewaySettings> {
    let settings: GatewaySettings = figment(path).extract()?;
    settings.validate()?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use figment::Jail;
    use secrecy::ExposeSecret;

    #[test]
    fn missing_file_returns_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("JWT_SECRET", "s3cret");
            let s = load_settings(Some(Path::new("/nonexistent/gateway.json"))).unwrap();
            assert_eq!(s.server.port, 8001);
            assert_eq!(s.auth.jwt_secret.expose_secret(), "s3cret");
            Ok(())
        });
    }

    #[test]
    fn file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.json",
                r#"{"auth": {"jwt_secret": "from-file"}, "rate_limit": {"requests_per_minute": 3}}"#,
            )?;
            let s = load_settings(Some(Path::new("gateway.json"))).unwrap();
            assert_eq!(s.auth.jwt_secret.expose_secret(), "from-file");
            assert_eq!(s.rate_limit.requests_per_minute, 3);
            assert_eq!(s.rate_limit.requests_per_hour, 1000);
            Ok(())
        });
    }

    #[test]
    fn prefixed_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "gateway.json",
                r#"{"auth": {"jwt_secret": "x"}, "agent": {"timeout_ms": 1000}}"#,
            )?;
            jail.set_env("CLINIC_AGENT__TIMEOUT_MS", "2500");
            jail.set_env("CLINIC_CACHE__ENABLED", "false");
            let s = load_settings(Some(Path::new("gateway.json"))).unwrap();
            assert_eq!(s.agent.timeout_ms, 2500);
            assert!(!s.cache.enabled);
            Ok(())
        });
    }

    #[test]
    fn legacy_names_are_honoured() {
        Jail::expect_with(|jail| {
            jail.set_env("JWT_SECRET", "legacy");
            jail.set_env("AGENT_ENDPOINT", "http://agent:9000");
            jail.set_env("WS_MAX_CONNECTIONS", "5");
            jail.set_env("LOG_FORMAT", "pretty");
            let s = load_settings(None).unwrap();
            assert_eq!(s.auth.jwt_secret.expose_secret(), "legacy");
            assert_eq!(s.agent.endpoint, "http://agent:9000");
            assert_eq!(s.server.max_connections, 5);
            assert_eq!(s.logging.format, clinic_core::logging::LogFormat::Pretty);
            Ok(())
        });
    }

    #[test]
    fn invalid_json_is_a_load_error() {
        Jail::expect_with(|jail| {
            jail.set_env("JWT_SECRET", "x");
            jail.create_file("gateway.json", "not json")?;
            let err = load_settings(Some(Path::new("gateway.json"))).unwrap_err();
            assert!(matches!(err, SettingsError::Load(_)));
            Ok(())
        });
    }

    #[test]
    fn validation_runs_after_merge() {
        Jail::expect_with(|_jail| {
            let err = load_settings(None).unwrap_err();
            assert!(matches!(err, SettingsError::InvalidValue(_)));
            Ok(())
        });
    }

    #[test]
    fn config_path_env() {
        Jail::expect_with(|jail| {
            assert!(config_path_from_env().is_none());
            jail.set_env(CONFIG_PATH_ENV, "/etc/clinic/gateway.json");
            assert_eq!(
                config_path_from_env(),
                Some(PathBuf::from("/etc/clinic/gateway.json"))
            );
            Ok(())
        });
    }
}
