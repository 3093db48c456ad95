//! Configuration for pipelinectl

use pipeline_engine::{EngineSettings, RetryPolicy};
use pipeline_types::CompanyDirectory;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Storage backend
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tenant directory and number allocation
    #[serde(default)]
    pub numbering: NumberingConfig,

    /// Dashboard aggregate refresh
    #[serde(default)]
    pub aggregates: AggregatesConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (for development/testing)
    #[default]
    Memory,

    /// PostgreSQL storage
    Postgres {
        /// Connection URL
        url: String,

        /// Maximum connections in pool
        #[serde(default = "default_pool_size")]
        max_connections: u32,

        /// Connection timeout in seconds
        #[serde(default = "default_connection_timeout")]
        connect_timeout_secs: u64,

        /// How long a transaction waits for a row lock before giving up
        #[serde(default = "default_lock_timeout")]
        lock_timeout_ms: u64,
    },
}

/// A tenant and its document-number prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyConfig {
    pub id: String,
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NumberingConfig {
    /// Attempts per allocation, including the first
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Appended to the number of a won offer
    #[serde(default = "default_win_suffix")]
    pub win_suffix: String,

    #[serde(default)]
    pub companies: Vec<CompanyConfig>,

    /// Tenant whose members see every tenant's attachments
    #[serde(default)]
    pub group_company: Option<String>,
}

impl Default for NumberingConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            win_suffix: default_win_suffix(),
            companies: Vec::new(),
            group_company: None,
        }
    }
}

impl NumberingConfig {
    pub fn directory(&self) -> CompanyDirectory {
        let directory = self
            .companies
            .iter()
            .fold(CompanyDirectory::new(), |dir, c| {
                dir.with_company(c.id.clone(), c.prefix.clone())
            });
        match &self.group_company {
            Some(group) => directory.with_group(group.clone()),
            None => directory,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatesConfig {
    /// Seconds between refreshes of the stored pipeline aggregate; 0 disables
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for AggregatesConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

fn default_lock_timeout() -> u64 {
    5_000
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_base_delay() -> u64 {
    25
}

fn default_retry_max_delay() -> u64 {
    1_000
}

fn default_win_suffix() -> String {
    pipeline_types::DEFAULT_WIN_SUFFIX.to_string()
}

fn default_refresh_interval() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

impl PipelineConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `PIPELINE_`-prefixed environment variables (`__` between sections,
    /// e.g. `PIPELINE_LOGGING__LEVEL`).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&PipelineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("PIPELINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            directory: self.numbering.directory(),
            retry: self.numbering.retry_policy(),
            win_suffix: self.numbering.win_suffix.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_types::CompanyId;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert!(matches!(config.storage, StorageConfig::Memory));
        assert_eq!(config.aggregates.refresh_interval_secs, 300);
        assert_eq!(config.numbering.win_suffix, "O");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_directory_from_companies() {
        let numbering = NumberingConfig {
            companies: vec![
                CompanyConfig {
                    id: "gr".into(),
                    prefix: "GR".into(),
                },
                CompanyConfig {
                    id: "st".into(),
                    prefix: "ST".into(),
                },
            ],
            group_company: Some("gr".into()),
            ..Default::default()
        };
        let directory = numbering.directory();
        assert_eq!(directory.prefix(&CompanyId::new("st")), Some("ST"));
        assert!(directory.is_group(&CompanyId::new("gr")));
        assert!(!directory.contains(&CompanyId::new("xx")));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("pipelinectl-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[storage]
type = "postgres"
url = "postgres://localhost/pipeline"

[numbering]
retry_attempts = 2
companies = [{ id = "acme", prefix = "ACME" }]

[aggregates]
refresh_interval_secs = 0
"#,
        )
        .unwrap();

        let config = PipelineConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        match config.storage {
            StorageConfig::Postgres {
                url,
                max_connections,
                lock_timeout_ms,
                ..
            } => {
                assert_eq!(url, "postgres://localhost/pipeline");
                assert_eq!(max_connections, 10);
                assert_eq!(lock_timeout_ms, 5_000);
            }
            StorageConfig::Memory => panic!("expected postgres storage"),
        }
        assert_eq!(config.numbering.retry_policy().max_attempts, 2);
        assert_eq!(config.numbering.companies.len(), 1);
        assert_eq!(config.aggregates.refresh_interval_secs, 0);
    }
}
