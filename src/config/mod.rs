use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Node identity persistence
    pub identity: IdentityConfig,

    /// Certificate authority generation and persistence
    pub ca: CaConfig,

    /// Batch key generation
    pub batch_generate: BatchGenerateConfig,
}

/// Identity persistence paths
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Path to the certificate chain for this identity
    pub cert_path: PathBuf,

    /// Path to the private key for this identity
    pub key_path: PathBuf,

    /// If true, existing identity certs AND keys will be overwritten
    pub overwrite: bool,
}

/// Certificate authority configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaConfig {
    /// Path to the certificate chain for the CA
    pub cert_path: PathBuf,

    /// Path to the private key for the CA
    pub key_path: PathBuf,

    /// Path to the parent authority's certificate chain (optional nesting)
    pub parent_cert_path: Option<PathBuf>,

    /// Path to the parent authority's private key
    pub parent_key_path: Option<PathBuf>,

    /// Minimum difficulty for identity generation
    pub difficulty: u16,

    /// Number of concurrent workers for CA generation
    pub concurrency: usize,

    /// Timeout for CA generation in seconds (0 = no timeout)
    pub timeout_secs: u64,

    /// If true, existing CA certs AND keys will be overwritten
    pub overwrite: bool,
}

/// Batch key generation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchGenerateConfig {
    /// Minimum difficulty to output
    pub min_difficulty: u16,

    /// Worker concurrency
    pub concurrency: usize,

    /// Output directory to place keys
    pub output_dir: PathBuf,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("identity/identity.cert"),
            key_path: PathBuf::from("identity/identity.key"),
            overwrite: false,
        }
    }
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("identity/ca.cert"),
            key_path: PathBuf::from("identity/ca.key"),
            parent_cert_path: None,
            parent_key_path: None,
            difficulty: 30,
            concurrency: 4,
            timeout_secs: 0,
            overwrite: false,
        }
    }
}

impl Default for BatchGenerateConfig {
    fn default() -> Self {
        Self {
            min_difficulty: 30,
            concurrency: 4,
            output_dir: PathBuf::from("."),
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .context("Failed to read config file")?;

        let config: Config = toml::from_str(&content)
            .context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        fs::write(path.as_ref(), content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.ca.concurrency == 0 {
            anyhow::bail!("CA concurrency must be greater than 0");
        }

        if self.batch_generate.concurrency == 0 {
            anyhow::bail!("Batch generation concurrency must be greater than 0");
        }

        // Parent cert and key only make sense together
        if self.ca.parent_cert_path.is_some() != self.ca.parent_key_path.is_some() {
            anyhow::bail!("parent_cert_path and parent_key_path must be set together");
        }

        Ok(())
    }

    /// Ensure all necessary directories exist
    pub fn ensure_directories(&self) -> Result<()> {
        let parents = [
            self.identity.cert_path.parent(),
            self.identity.key_path.parent(),
            self.ca.cert_path.parent(),
            self.ca.key_path.parent(),
        ];

        for dir in parents.into_iter().flatten() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)
                    .context("Failed to create identity directory")?;
            }
        }

        fs::create_dir_all(&self.batch_generate.output_dir)
            .context("Failed to create batch output directory")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.ca.difficulty, 30);
        assert_eq!(config.ca.concurrency, 4);
        assert_eq!(config.batch_generate.min_difficulty, 30);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.ca.difficulty, parsed.ca.difficulty);
        assert_eq!(config.identity.cert_path, parsed.identity.cert_path);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str("[ca]\ndifficulty = 16\n").unwrap();
        assert_eq!(parsed.ca.difficulty, 16);
        assert_eq!(parsed.ca.concurrency, 4);
        assert_eq!(parsed.identity.cert_path, PathBuf::from("identity/identity.cert"));
    }

    #[test]
    fn test_unpaired_parent_paths_rejected() {
        let mut config = Config::default();
        config.ca.parent_cert_path = Some(PathBuf::from("parent.cert"));
        assert!(config.validate().is_err());
    }
}
