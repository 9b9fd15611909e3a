use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::integration::InvokerSettings;
use crate::store::{DatabaseConfig, DatabaseType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub invoker: InvokerConfig,
    #[serde(default)]
    pub templates: TemplateConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerConfig {
    pub max_concurrency: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub default_max_retries: i32,
    pub esignature_timeout_secs: u64,
    pub document_timeout_secs: u64,
    /// Base URL of the integration gateway; without it no provider is wired
    /// and integration steps surface as exceptions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_base_url: Option<String>,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            default_max_retries: 3,
            esignature_timeout_secs: 30,
            document_timeout_secs: 20,
            provider_base_url: None,
        }
    }
}

impl InvokerConfig {
    pub fn settings(&self) -> InvokerSettings {
        InvokerSettings {
            max_concurrency: self.max_concurrency,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            default_max_retries: self.default_max_retries,
            esignature_timeout: Duration::from_secs(self.esignature_timeout_secs),
            document_timeout: Duration::from_secs(self.document_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateConfig {
    /// Directory of YAML workflow templates loaded at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> crate::Result<Self> {
        // Load environment variables from .env file if it exists
        let _ = dotenvy::dotenv();

        let invoker_defaults = InvokerConfig::default();
        let config = Config {
            server: ServerConfig {
                addr: std::env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            },
            database: DatabaseConfig {
                db_type: match std::env::var("DATABASE_TYPE")
                    .unwrap_or_else(|_| "sqlite".to_string())
                    .to_lowercase()
                    .as_str()
                {
                    "postgres" => DatabaseType::Postgres,
                    _ => DatabaseType::Sqlite,
                },
                sqlite_path: std::env::var("SQLITE_PATH")
                    .map(PathBuf::from)
                    .ok()
                    .or_else(|| Some(PathBuf::from("data/onboard.db"))),
                connection_string: std::env::var("DATABASE_URL").ok(),
                max_connections: env_parse("DATABASE_MAX_CONNECTIONS", 5),
            },
            invoker: InvokerConfig {
                max_concurrency: env_parse("INVOKER_MAX_CONCURRENCY", invoker_defaults.max_concurrency),
                base_delay_ms: env_parse("RETRY_BASE_DELAY_MS", invoker_defaults.base_delay_ms),
                max_delay_ms: env_parse("RETRY_MAX_DELAY_MS", invoker_defaults.max_delay_ms),
                default_max_retries: env_parse(
                    "DEFAULT_MAX_RETRIES",
                    invoker_defaults.default_max_retries,
                ),
                esignature_timeout_secs: env_parse(
                    "ESIGNATURE_TIMEOUT_SECS",
                    invoker_defaults.esignature_timeout_secs,
                ),
                document_timeout_secs: env_parse(
                    "DOCUMENT_TIMEOUT_SECS",
                    invoker_defaults.document_timeout_secs,
                ),
                provider_base_url: std::env::var("INTEGRATION_BASE_URL").ok(),
            },
            templates: TemplateConfig {
                dir: std::env::var("TEMPLATE_DIR").map(PathBuf::from).ok(),
            },
        };

        if config.invoker.provider_base_url.is_none() {
            tracing::warn!(
                "INTEGRATION_BASE_URL is not set; integration steps will raise exceptions instead of calling out"
            );
        }

        config
            .database
            .validate()
            .map_err(crate::Error::Config)?;

        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addr: "0.0.0.0:8080".to_string(),
            },
            database: DatabaseConfig::default(),
            invoker: InvokerConfig::default(),
            templates: TemplateConfig::default(),
        }
    }
}
