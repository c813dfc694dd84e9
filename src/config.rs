//! Configuration for adharvest.
//!
//! One file (TOML, YAML or JSON, chosen by extension) holds every section;
//! a handful of environment variables override it after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::block::BlockConfig;
use crate::dedup::MergeConfig;
use crate::extract::ExtractConfig;
use crate::orchestrator::RunConfig;
use crate::retry::RetryConfig;
use crate::session::SessionConfig;
use crate::sink::SinkConfig;
use crate::source::SourceConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {format} config {path}: {message}")]
    Parse {
        path: PathBuf,
        format: &'static str,
        message: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Where results are read from and written to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub spreadsheet_id: Option<String>,
    /// OAuth bearer token for the Sheets API.
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    /// Overrides the Sheets API endpoint.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_store_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_store_timeout_secs() -> u64 {
    30
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            spreadsheet_id: None,
            access_token: None,
            base_url: None,
            timeout_secs: default_store_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

const CONFIG_NAMES: &[&str] = &[
    "adharvest.toml",
    "adharvest.yaml",
    "adharvest.yml",
    "adharvest.json",
];

/// First known config file name present in `dirs`, in order.
pub fn discover_in(dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter()
        .flat_map(|dir| CONFIG_NAMES.iter().map(move |name| dir.join(name)))
        .find(|path| path.is_file())
}

/// Look in the working directory, then the user config directory
/// (`~/.config/adharvest` on Linux).
pub fn discover() -> Option<PathBuf> {
    let mut search = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        search.push(cwd);
    }
    if let Some(config_dir) = dirs::config_dir() {
        search.push(config_dir.join("adharvest"));
    }
    discover_in(&search)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestConfig {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub extract: ExtractConfig,
    #[serde(default)]
    pub block: BlockConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub merge: MergeConfig,

    /// File this configuration was read from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl HarvestConfig {
    /// Load configuration from a specific file path.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let expanded = shellexpand::tilde(&path.to_string_lossy()).into_owned();
        let path = PathBuf::from(expanded);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
        let parse_error = |format: &'static str, message: String| ConfigError::Parse {
            path: path.clone(),
            format,
            message,
        };
        let mut config: HarvestConfig = match ext {
            "toml" => toml::from_str(&contents).map_err(|e| parse_error("TOML", e.to_string()))?,
            "yaml" | "yml" => {
                serde_yaml::from_str(&contents).map_err(|e| parse_error("YAML", e.to_string()))?
            }
            _ => serde_json::from_str(&contents).map_err(|e| parse_error("JSON", e.to_string()))?,
        };

        config.source_path = Some(path);
        Ok(config)
    }

    /// Load from `path` when given, else from a discovered file, else
    /// defaults; then apply environment overrides and validate.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let discovered = match path {
            Some(path) => Some(path.to_path_buf()),
            None => discover(),
        };
        let config = match discovered {
            Some(path) => Self::load_from_path(&path).await?,
            None => {
                tracing::debug!("No config file found, using defaults");
                Self::default()
            }
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup` (environment variable name to value).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(proxies) = get("ADHARVEST_PROXIES") {
            tracing::debug!("Using ADHARVEST_PROXIES from environment");
            self.session.proxies = proxies
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect();
        }
        if let Some(url) = get("BROWSER_URL") {
            tracing::debug!("Using BROWSER_URL from environment: {}", url);
            self.session.remote_url = Some(url);
        }
        if let Some(id) = get("SHEETS_SPREADSHEET_ID") {
            self.store.spreadsheet_id = Some(id);
        }
        if let Some(token) = get("SHEETS_ACCESS_TOKEN") {
            self.store.access_token = Some(token);
        }
        if let Some(concurrency) = get("ADHARVEST_CONCURRENCY") {
            match concurrency.parse::<usize>() {
                Ok(n) if n > 0 => self.run.concurrency = n,
                _ => tracing::warn!("Ignoring invalid ADHARVEST_CONCURRENCY={}", concurrency),
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source
            .layout
            .validate()
            .map_err(ConfigError::Invalid)?;
        if self.run.concurrency == 0 {
            return Err(ConfigError::Invalid("run.concurrency must be at least 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be at least 1".into()));
        }
        if self.source.batch_size == 0 || self.sink.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "batch and chunk sizes must be at least 1".into(),
            ));
        }
        if self.extract.required_fields.is_empty() {
            return Err(ConfigError::Invalid("extract.required_fields is empty".into()));
        }
        for layout in self.merge.sources.iter().chain(self.merge.destination.iter()) {
            layout.validate().map_err(ConfigError::Invalid)?;
        }
        Ok(())
    }

    /// Spreadsheet id and token, when both are configured.
    pub fn sheets_credentials(&self) -> Option<(&str, &str)> {
        Some((
            self.store.spreadsheet_id.as_deref()?,
            self.store.access_token.as_deref()?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Field;
    use crate::source::Traversal;
    use std::collections::HashMap;
    use std::io::Write;

    fn write_config(ext: &str, body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(&format!(".{}", ext))
            .tempfile()
            .unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn loads_toml_with_defaults_for_missing_sections() {
        let file = write_config(
            "toml",
            r#"
[source]
traversal = "bottom-up"
batch_size = 10

[source.layout]
sheet = "US Ads"
url_column = "F"
tagline_column = "H"

[extract]
required_fields = ["app_name"]

[run]
concurrency = 2
time_budget_secs = 3600
"#,
        );

        let config = HarvestConfig::load_from_path(file.path()).await.unwrap();

        assert_eq!(config.source.traversal, Traversal::BottomUp);
        assert_eq!(config.source.batch_size, 10);
        assert_eq!(config.source.layout.sheet, "US Ads");
        assert_eq!(config.source.layout.url_column, "F");
        assert_eq!(config.source.layout.link_column.as_deref(), Some("C"));
        assert_eq!(config.extract.required_set(), [Field::AppName].into_iter().collect());
        assert_eq!(config.run.concurrency, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.session.max_items_per_session, 20);
        assert!(config.source_path.is_some());
    }

    #[tokio::test]
    async fn loads_yaml_and_json() {
        let yaml = write_config(
            "yaml",
            "session:\n  max_items_per_session: 5\n  proxies:\n    - http://p1:8080\nretry:\n  max_attempts: 4\n",
        );
        let config = HarvestConfig::load_from_path(yaml.path()).await.unwrap();
        assert_eq!(config.session.max_items_per_session, 5);
        assert_eq!(config.session.proxies, vec!["http://p1:8080"]);
        assert_eq!(config.retry.max_attempts, 4);

        let json = write_config("json", r#"{"sink": {"chunk_size": 7}}"#);
        let config = HarvestConfig::load_from_path(json.path()).await.unwrap();
        assert_eq!(config.sink.chunk_size, 7);
    }

    #[tokio::test]
    async fn parse_errors_name_the_format() {
        let file = write_config("toml", "[run\nconcurrency = ");
        let err = HarvestConfig::load_from_path(file.path()).await.unwrap_err();
        assert!(matches!(err, ConfigError::Parse { format: "TOML", .. }));
    }

    #[tokio::test]
    async fn missing_file_is_a_read_error() {
        let err = HarvestConfig::load_from_path(Path::new("/nonexistent/adharvest.toml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn environment_overrides_file_values() {
        let env: HashMap<&str, &str> = [
            ("ADHARVEST_PROXIES", "http://a:1, http://b:2,,"),
            ("BROWSER_URL", "http://127.0.0.1:9222"),
            ("SHEETS_SPREADSHEET_ID", "sheet-xyz"),
            ("SHEETS_ACCESS_TOKEN", "tok"),
            ("ADHARVEST_CONCURRENCY", "5"),
        ]
        .into_iter()
        .collect();

        let config = HarvestConfig::default()
            .with_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.session.proxies, vec!["http://a:1", "http://b:2"]);
        assert_eq!(config.session.remote_url.as_deref(), Some("http://127.0.0.1:9222"));
        assert_eq!(config.sheets_credentials(), Some(("sheet-xyz", "tok")));
        assert_eq!(config.run.concurrency, 5);
    }

    #[test]
    fn invalid_concurrency_override_is_ignored() {
        let config = HarvestConfig::default().with_overrides(|key| {
            (key == "ADHARVEST_CONCURRENCY").then(|| "zero".to_string())
        });
        assert_eq!(config.run.concurrency, 3);
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        assert!(HarvestConfig::default().validate().is_ok());

        let mut config = HarvestConfig::default();
        config.run.concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = HarvestConfig::default();
        config.source.layout.url_column = "1B".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn discovery_prefers_earlier_directories() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        std::fs::write(second.path().join("adharvest.toml"), "").unwrap();
        let dirs = vec![first.path().to_path_buf(), second.path().to_path_buf()];
        assert_eq!(discover_in(&dirs), Some(second.path().join("adharvest.toml")));

        std::fs::write(first.path().join("adharvest.yaml"), "").unwrap();
        assert_eq!(discover_in(&dirs), Some(first.path().join("adharvest.yaml")));
        assert_eq!(discover_in(&[]), None);
    }

    #[test]
    fn access_token_is_never_serialized() {
        let mut config = HarvestConfig::default();
        config.store.access_token = Some("secret-token".into());
        let printed = serde_json::to_string(&config).unwrap();
        assert!(!printed.contains("secret-token"));
    }
}
