//! # Configuration
//!
//! Layered, lowest to highest precedence:
//! 1. built-in defaults
//! 2. `config/default.toml` (optional)
//! 3. `config/{OFFER_ENGINE_ENV}.toml` (optional)
//! 4. `OFFER_ENGINE__SECTION__KEY` environment variables
//!
//! A `.env` file is read first so its variables take part in step 4.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tracing::debug;

pub const ENV_PREFIX: &str = "OFFER_ENGINE";
pub const ENV_SELECTOR: &str = "OFFER_ENGINE_ENV";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Postgres URL. Unset or empty selects the in-memory store.
    #[serde(default, deserialize_with = "optional_secret")]
    pub url: Option<SecretString>,
    pub max_connections: u32,
    /// JSON catalogue loaded into the in-memory store at startup.
    #[serde(default)]
    pub seed_file: Option<String>,
}

/// How `has`/`has-not` filters match, see `services::SubstringMatch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstringMatchMode {
    Legacy,
    Standard,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    pub pre_ping_timeout_secs: u64,
    pub lead_post_timeout_secs: u64,
    pub test_pre_ping_timeout_secs: u64,
    pub substring_match: SubstringMatchMode,
}

impl EngineConfig {
    pub fn pre_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.pre_ping_timeout_secs)
    }

    pub fn lead_post_timeout(&self) -> Duration {
        Duration::from_secs(self.lead_post_timeout_secs)
    }

    pub fn test_pre_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.test_pre_ping_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

fn optional_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.filter(|s| !s.trim().is_empty()).map(SecretString::from))
}

impl AppConfig {
    /// Reads `.env`, the TOML files and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenvy::dotenv() {
            debug!(path = %path.display(), "loaded .env");
        }
        let environment = std::env::var(ENV_SELECTOR).ok();
        Self::from_sources(environment.as_deref(), None, None)
    }

    /// `overlay` is extra TOML applied after the files; `env` replaces the
    /// process environment when given.
    pub fn from_sources(
        environment: Option<&str>,
        overlay: Option<&str>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("database.max_connections", 10)?
            .set_default("engine.pre_ping_timeout_secs", 30)?
            .set_default("engine.lead_post_timeout_secs", 15)?
            .set_default("engine.test_pre_ping_timeout_secs", 15)?
            .set_default("engine.substring_match", "legacy")?
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .add_source(File::with_name("config/default").required(false));

        if let Some(name) = environment.filter(|n| !n.is_empty()) {
            builder =
                builder.add_source(File::with_name(&format!("config/{name}")).required(false));
        }
        if let Some(toml) = overlay {
            builder = builder.add_source(File::from_str(toml, FileFormat::Toml));
        }

        let cfg: AppConfig = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server.port must be non-zero".into()));
        }
        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid("database.max_connections must be non-zero".into()));
        }
        for (name, secs) in [
            ("engine.pre_ping_timeout_secs", self.engine.pre_ping_timeout_secs),
            ("engine.lead_post_timeout_secs", self.engine.lead_post_timeout_secs),
            ("engine.test_pre_ping_timeout_secs", self.engine.test_pre_ping_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}
