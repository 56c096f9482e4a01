//! Configuration
//!
//! Read from the TOML file named by `BMCFRONT_CONFIG` (all fields optional),
//! then `PORT` from the environment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::constants::{
    DEFAULT_RETRY_AFTER_SECS, DEFAULT_SESSION_TTL_SECS, DEFAULT_TASK_TIMEOUT_SECS, MAX_TASK_COUNT,
};
use crate::error::{Error, Result};
use crate::filter::ParserOptions;
use crate::task_registry::TaskLimits;

pub const CONFIG_ENV: &str = "BMCFRONT_CONFIG";
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_addr: String,
    pub port: u16,
    pub task: TaskConfig,
    pub filter: FilterConfig,
    pub session: SessionConfig,
    pub accounts: Vec<AccountConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            port: 3000,
            task: TaskConfig::default(),
            filter: FilterConfig::default(),
            session: SessionConfig::default(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub max_tasks: usize,
    pub default_timeout_secs: u64,
    pub retry_after_secs: u64,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            max_tasks: MAX_TASK_COUNT,
            default_timeout_secs: DEFAULT_TASK_TIMEOUT_SECS,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
        }
    }
}

impl TaskConfig {
    pub fn limits(&self) -> TaskLimits {
        TaskLimits {
            max_tasks: self.max_tasks,
            default_timeout: Duration::from_secs(self.default_timeout_secs),
            retry_after: self.retry_after_secs,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Enable the `not` prefix in `$filter`
    pub allow_not: bool,
}

impl FilterConfig {
    pub fn parser_options(&self) -> ParserOptions {
        ParserOptions {
            allow_not: self.allow_not,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Session lifetime; 0 = never expires
    pub ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AccountConfig {
    pub username: String,
    pub password: String,
    pub role: String,
    #[serde(default)]
    pub groups: Vec<String>,
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    /// File from `BMCFRONT_CONFIG` if set, defaults otherwise, then env overrides
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::load_from(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(port) = lookup(PORT_ENV) {
            self.port = port
                .trim()
                .parse()
                .map_err(|_| Error::Config(format!("invalid {PORT_ENV} '{port}'")))?;
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }
}
