//! Sources of the shared, versioned configuration
//!
//! The observer registry is built from a [`SharedConfig`]. Where that comes
//! from is up to the deployment: an in-process value for tests and embedded
//! use, or a TOML file edited by an operator. Sources are only read when
//! asked to (`Environment::refresh`), never on a timer.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::info;

use seep_core::{SeepError, SeepResult, SharedConfig};

/// Where shared configuration is read from
pub trait SharedConfigSource: Send + Sync {
    /// Current configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be read or parsed.
    fn load(&self) -> SeepResult<SharedConfig>;
}

/// In-memory configuration; every `publish` bumps the version
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    current: RwLock<SharedConfig>,
}

impl StaticConfigSource {
    /// Source holding `config` as given
    pub fn new(config: SharedConfig) -> Self {
        StaticConfigSource {
            current: RwLock::new(config),
        }
    }

    /// Replace the configuration; returns the new version
    pub fn publish(&self, mut config: SharedConfig) -> u64 {
        let mut current = self.current.write();
        config.version = current.version + 1;
        let version = config.version;
        *current = config;
        info!(version, "Shared configuration published");
        version
    }

    /// Version currently held
    pub fn version(&self) -> u64 {
        self.current.read().version
    }
}

impl SharedConfigSource for StaticConfigSource {
    fn load(&self) -> SeepResult<SharedConfig> {
        Ok(self.current.read().clone())
    }
}

/// TOML file holding a [`SharedConfig`]
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    /// Source reading `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileConfigSource { path: path.into() }
    }

    /// File being read
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the file with `config`
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn store(&self, config: &SharedConfig) -> SeepResult<()> {
        fs::write(&self.path, config.to_toml_string()?)?;
        Ok(())
    }
}

impl SharedConfigSource for FileConfigSource {
    fn load(&self) -> SeepResult<SharedConfig> {
        let content = fs::read_to_string(&self.path)?;
        SharedConfig::from_toml_str(&content).map_err(|e| {
            SeepError::configuration(format!("{}: {}", self.path.display(), e))
        })
    }
}
