use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::closer::{CloserOptions, Signal};
use crate::error::Error;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Configuration {
    #[serde(default)]
    pub closer: CloserConfig,
    /// Simulated resources released on shutdown.
    #[serde(default)]
    pub steps: Vec<CloseStep>,
    /// Trigger shutdown on its own after this long.
    #[serde(default, with = "humantime_serde")]
    pub shutdown_after: Option<Duration>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CloserConfig {
    #[serde(default)]
    pub cancel_on_context: bool,
    #[serde(default)]
    pub signals: Vec<Signal>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct CloseStep {
    pub name: String,
    /// Time the step takes to release its resource.
    #[serde(default, with = "humantime_serde")]
    pub delay: Duration,
    /// When set, the step fails with this message.
    #[serde(default)]
    pub fail: Option<String>,
}

impl Configuration {
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(Error::InvalidConfig("step name must not be empty".into()));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(Error::InvalidConfig(format!("duplicate step name: {}", step.name)));
            }
        }
        if self.shutdown_after == Some(Duration::ZERO) {
            return Err(Error::InvalidConfig("shutdown-after must be greater than zero".into()));
        }
        Ok(())
    }
}

impl From<&CloserConfig> for CloserOptions {
    fn from(cfg: &CloserConfig) -> Self {
        let mut options = CloserOptions::new();
        if cfg.cancel_on_context {
            options = options.with_context_cancel();
        }
        if !cfg.signals.is_empty() {
            options = options.with_signals(cfg.signals.iter().copied());
        }
        options
    }
}

pub fn from_yaml_str(yaml: &str) -> Result<Configuration, Error> {
    Ok(serde_yaml::from_str(yaml)?)
}

pub fn from_yaml_file(path: &Path) -> Result<Configuration, Error> {
    let raw = std::fs::read_to_string(path)?;
    from_yaml_str(&raw)
}
