use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::semantic::DEFAULT_MODEL;

const CONFIG_FILE_NAME: &str = "config.yaml";

const DEFAULT_INDEX_NAME: &str = "review_index";
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
const DEFAULT_LIMIT: usize = 10;
const DEFAULT_MAX_LIMIT: usize = 100;
const DEFAULT_MAX_QUERY_LENGTH: usize = 500;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;

/// Configuration for the review index
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Snapshot base name inside the base directory
    #[serde(default = "default_index_name")]
    pub index_name: String,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Search result count when the request gives none
    #[serde(default = "default_limit")]
    pub default_limit: usize,

    /// Upper bound on requested search results
    #[serde(default = "default_max_limit")]
    pub max_limit: usize,

    /// Upper bound on search query length in characters
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            index_name: default_index_name(),
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            default_limit: DEFAULT_LIMIT,
            max_limit: DEFAULT_MAX_LIMIT,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
        }
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_index_name() -> String {
    DEFAULT_INDEX_NAME.to_string()
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn default_max_limit() -> usize {
    DEFAULT_MAX_LIMIT
}

fn default_max_query_length() -> usize {
    DEFAULT_MAX_QUERY_LENGTH
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
        }
    }
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        let index = &self.index;

        if index.model.trim().is_empty() {
            bail!("index.model must not be empty");
        }

        if index.index_name.trim().is_empty() {
            bail!("index.index_name must not be empty");
        }

        if index.download_timeout_secs == 0 {
            bail!("index.download_timeout_secs must be greater than 0");
        }

        if index.max_limit == 0 {
            bail!("index.max_limit must be greater than 0");
        }

        if !(1..=index.max_limit).contains(&index.default_limit) {
            bail!(
                "index.default_limit must be between 1 and {}, got {}",
                index.max_limit,
                index.default_limit
            );
        }

        if index.max_query_length == 0 {
            bail!("index.max_query_length must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if
    /// it does not exist.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;

        let config_path = base_path.join(CONFIG_FILE_NAME);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&config_path, defaults)
                .with_context(|| format!("failed to write {}", config_path.display()))?;
        }

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", config_path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = self.base_path.join(CONFIG_FILE_NAME);
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(&config_path, config_str)
            .with_context(|| format!("failed to write {}", config_path.display()))?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Base path of the snapshot artifacts, without extension.
    pub fn index_path(&self) -> PathBuf {
        self.base_path.join(&self.index.index_name)
    }
}
