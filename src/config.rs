use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::orchestration::{DEFAULT_CONCURRENCY, DEFAULT_GRACE_PERIOD};
use crate::{Error, Result};

/// Command line an agent role runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AgentCommand {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    pub concurrency: Option<usize>,
    pub grace_period_ms: Option<u64>,
    /// Directory every run report is written to.
    pub report_dir: Option<String>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentCommand>,
}

impl Config {
    pub fn maestro_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".maestro"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::maestro_dir()?.join("maestro.toml"))
    }

    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1)
    }

    pub fn effective_grace_period(&self) -> Duration {
        self.grace_period_ms
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_PERIOD)
    }

    pub fn report_dir(&self) -> Option<PathBuf> {
        self.report_dir.as_deref().map(expand_tilde)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        debug!(
            concurrency = ?config.concurrency,
            grace_period_ms = ?config.grace_period_ms,
            agents = config.agents.len(),
            "config loaded"
        );
        Ok(config)
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
