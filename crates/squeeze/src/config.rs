//! Configuration for table rebuilds
//!
//! The options recognized here govern both the rebuild engine itself
//! (`max_exclusive_lock_duration`, `maintenance_work_mem`) and the background
//! driver that schedules rebuilds (`capture_idle_interval`,
//! `autostart_targets`, `autostart_role`).
//!
//! ```yaml
//! capture_idle_interval: 60
//! max_exclusive_lock_duration: ${SQUEEZE_LOCK_MS:-250}
//! autostart_targets: "sales inventory"
//! autostart_role: squeeze_worker
//! maintenance_work_mem: 67108864
//! ```

use crate::error::{Result, SqueezeError};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

/// Pre-compiled regex for environment variable expansion
/// Pattern: ${VAR} or ${VAR:-default}
static ENV_VAR_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\$\{([a-zA-Z_][a-zA-Z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var regex pattern is invalid - this is a bug")
});

/// Smallest accepted memory ceiling (1 MiB)
pub const MIN_MAINTENANCE_WORK_MEM: usize = 1024 * 1024;

/// Rebuild configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqueezeConfig {
    /// Seconds between passes of the background driver
    #[serde(default = "default_capture_idle_interval")]
    pub capture_idle_interval: u64,

    /// Maximum exclusive-lock hold time of one final-merge attempt in
    /// milliseconds, 0 = unbounded
    #[serde(default)]
    pub max_exclusive_lock_duration: u64,

    /// Databases for which the background driver starts automatically
    #[serde(default, deserialize_with = "deserialize_autostart")]
    pub autostart_targets: Option<Vec<String>>,

    /// Role the automatically started driver connects as
    #[serde(default)]
    pub autostart_role: Option<String>,

    /// Memory ceiling in bytes for load batches and buffered change events
    #[serde(default = "default_maintenance_work_mem")]
    pub maintenance_work_mem: usize,
}

fn default_capture_idle_interval() -> u64 {
    60
}

fn default_maintenance_work_mem() -> usize {
    64 * 1024 * 1024
}

impl Default for SqueezeConfig {
    fn default() -> Self {
        Self {
            capture_idle_interval: default_capture_idle_interval(),
            max_exclusive_lock_duration: 0,
            autostart_targets: None,
            autostart_role: None,
            maintenance_work_mem: default_maintenance_work_mem(),
        }
    }
}

/// Accepts either a YAML list or one whitespace-separated string.
fn deserialize_autostart<'de, D>(deserializer: D) -> std::result::Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Targets {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Targets>::deserialize(deserializer)? {
        None => None,
        Some(Targets::List(list)) => Some(
            list.iter()
                .flat_map(|s| s.split_whitespace())
                .map(str::to_string)
                .collect(),
        ),
        Some(Targets::Text(text)) => Some(parse_autostart(&text)),
    })
}

/// Split a whitespace-separated list of database names.
pub fn parse_autostart(text: &str) -> Vec<String> {
    text.split_whitespace().map(str::to_string).collect()
}

impl SqueezeConfig {
    /// Create a builder with default values
    pub fn builder() -> SqueezeConfigBuilder {
        SqueezeConfigBuilder::default()
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            SqueezeError::config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML text, expanding environment variables
    pub fn from_yaml(content: &str) -> Result<Self> {
        let expanded = Self::expand_env_vars(content);
        let config: Self = serde_yaml::from_str(&expanded)
            .map_err(|e| SqueezeError::config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Expand environment variables in the format ${VAR} or ${VAR:-default}
    fn expand_env_vars(content: &str) -> String {
        ENV_VAR_REGEX
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                let default = caps.get(2).map(|m| m.as_str());

                std::env::var(var_name).unwrap_or_else(|_| default.unwrap_or("").to_string())
            })
            .to_string()
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.capture_idle_interval < 1 {
            return Err(SqueezeError::config(
                "capture_idle_interval must be at least 1 second",
            ));
        }
        if self.maintenance_work_mem < MIN_MAINTENANCE_WORK_MEM {
            return Err(SqueezeError::config(format!(
                "maintenance_work_mem must be at least {} bytes",
                MIN_MAINTENANCE_WORK_MEM
            )));
        }
        if let Some(targets) = &self.autostart_targets {
            if targets.is_empty() {
                return Err(SqueezeError::config(
                    "autostart_targets is set but names no database",
                ));
            }
            if self.autostart_role.as_deref().map_or(true, str::is_empty) {
                return Err(SqueezeError::config(
                    "autostart_role must be set when autostart_targets is",
                ));
            }
        }
        Ok(())
    }

    pub fn capture_idle_interval(&self) -> Duration {
        Duration::from_secs(self.capture_idle_interval)
    }

    /// Lock budget of one final-merge attempt, `None` when unbounded.
    pub fn lock_budget(&self) -> Option<Duration> {
        (self.max_exclusive_lock_duration > 0)
            .then(|| Duration::from_millis(self.max_exclusive_lock_duration))
    }
}

/// Builder for [`SqueezeConfig`]
#[derive(Debug, Default)]
pub struct SqueezeConfigBuilder {
    config: SqueezeConfig,
}

impl SqueezeConfigBuilder {
    pub fn capture_idle_interval(mut self, interval: Duration) -> Self {
        self.config.capture_idle_interval = interval.as_secs();
        self
    }

    pub fn max_exclusive_lock_duration(mut self, budget: Duration) -> Self {
        self.config.max_exclusive_lock_duration = budget.as_millis() as u64;
        self
    }

    pub fn autostart(mut self, targets: Vec<String>, role: impl Into<String>) -> Self {
        self.config.autostart_targets = Some(targets);
        self.config.autostart_role = Some(role.into());
        self
    }

    pub fn maintenance_work_mem(mut self, bytes: usize) -> Self {
        self.config.maintenance_work_mem = bytes;
        self
    }

    pub fn build(self) -> Result<SqueezeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
