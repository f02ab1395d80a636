//! Layered configuration loading.
//!
//! Sources, lowest precedence first:
//!
//! ```text
//!   SnapvaultConfig::default()
//!   optional TOML file              (ConfigLoader::with_file)
//!   SNAPVAULT_<SECTION>__<KEY>      (process environment, or injected vars)
//! ```
//!
//! `SNAPVAULT_REPOSITORY__MAX_FINALIZE_RETRIES=3` sets
//! `repository.max_finalize_retries`.

use std::path::{Path, PathBuf};

use config::{Config, Environment, File, FileFormat, Map};

use crate::{ConfigError, SnapvaultConfig};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "SNAPVAULT";

/// Builds a [`SnapvaultConfig`] from defaults, a file, and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    file: Option<PathBuf>,
    env_prefix: String,
    /// Variables read instead of the process environment.
    environment: Option<Map<String, String>>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: ENV_PREFIX.to_string(),
            environment: None,
        }
    }

    /// Layers a TOML file over the defaults. The file must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Reads overrides from `vars` instead of the process environment.
    pub fn with_environment<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    pub fn load(self) -> Result<SnapvaultConfig, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&SnapvaultConfig::default())?);

        if let Some(path) = self.file {
            if !path.is_file() {
                return Err(ConfigError::MissingFile { path });
            }
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        builder = builder.add_source(
            Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(self.environment),
        );

        let config: SnapvaultConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
