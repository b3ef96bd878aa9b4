use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

/// Default listen address (the port the service has always used)
const DEFAULT_ADDR: &str = "127.0.0.1:5000";
/// Default embedding model, multilingual so room names in any language match
const DEFAULT_MODEL: &str = "paraphrase-multilingual-MiniLM-L12-v2";
const DEFAULT_HASHING_DIMENSIONS: usize = 256;
/// Default per-call embedding timeout in seconds
const DEFAULT_EMBED_TIMEOUT_SECS: u64 = 30;
const DEFAULT_K: usize = 20;
const DEFAULT_MAX_K: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local ONNX model through fastembed
    #[default]
    Fastembed,
    /// Deterministic token hashing, no model download
    Hashing,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

/// Configuration for the embedding provider
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,

    /// Model name for the fastembed provider (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_model")]
    pub model: String,

    /// Vector size for the hashing provider
    #[serde(default = "default_hashing_dimensions")]
    pub hashing_dimensions: usize,

    /// Timeout for a single embedding call in seconds
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_model(),
            hashing_dimensions: default_hashing_dimensions(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of results when a request does not ask for a specific k
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Upper bound applied to every requested k
    #[serde(default = "default_max_k")]
    pub max_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
        }
    }
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_hashing_dimensions() -> usize {
    DEFAULT_HASHING_DIMENSIONS
}

fn default_embed_timeout_secs() -> u64 {
    DEFAULT_EMBED_TIMEOUT_SECS
}

fn default_k() -> usize {
    DEFAULT_K
}

fn default_max_k() -> usize {
    DEFAULT_MAX_K
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    fn validate(&self) -> anyhow::Result<()> {
        if self.server.addr.trim().is_empty() {
            bail!("server.addr must not be empty");
        }

        let emb = &self.embedding;
        if emb.provider == EmbeddingProvider::Hashing
            && !(1..=u16::MAX as usize).contains(&emb.hashing_dimensions)
        {
            bail!(
                "embedding.hashing_dimensions must be between 1 and {}, got {}",
                u16::MAX,
                emb.hashing_dimensions
            );
        }
        if emb.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be greater than 0");
        }

        let search = &self.search;
        if search.default_k == 0 {
            bail!("search.default_k must be greater than 0");
        }
        if search.max_k < search.default_k {
            bail!(
                "search.max_k ({}) must be at least search.default_k ({})",
                search.max_k,
                search.default_k
            );
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if absent.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str).context("config is malformed")?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        if let Ok(addr) = std::env::var("ROOMSEARCH_ADDR") {
            config.server.addr = addr;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str)?;
        Ok(())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_default_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_with(dir.path()).unwrap();

        assert!(dir.path().join(CONFIG_FILE).exists());
        assert_eq!(config.embedding.provider, EmbeddingProvider::Fastembed);
        assert_eq!(config.search.default_k, 20);
        assert_eq!(config.base_path(), dir.path());
    }

    #[test]
    fn test_fills_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "embedding:\n  provider: hashing\n  hashing_dimensions: 64\n",
        )
        .unwrap();

        let config = Config::load_with(dir.path()).unwrap();
        assert_eq!(config.embedding.provider, EmbeddingProvider::Hashing);
        assert_eq!(config.embedding.hashing_dimensions, 64);
        assert_eq!(config.search.max_k, 1000);

        // defaults were written back
        let saved = std::fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap();
        assert!(saved.contains("max_k"));
    }

    #[test]
    fn test_rejects_zero_default_k() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "search:\n  default_k: 0\n").unwrap();

        assert!(Config::load_with(dir.path()).is_err());
    }

    #[test]
    fn test_rejects_max_k_below_default() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            "search:\n  default_k: 50\n  max_k: 10\n",
        )
        .unwrap();

        assert!(Config::load_with(dir.path()).is_err());
    }

    #[test]
    fn test_rejects_malformed_yaml() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "search: [unclosed").unwrap();

        assert!(Config::load_with(dir.path()).is_err());
    }
}
