mod presets;

pub use presets::{Preset, PresetManager};

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::process::governor::{
    DEFAULT_MIN_LAUNCH_INTERVAL, DEFAULT_RETRY_INTERVAL, DEFAULT_SETTLE_INTERVAL, DEFAULT_TRY_COUNT,
};
use crate::process::{ProcessContext, SpawnRequest};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Downloader executable, a bare name is looked up on PATH
    pub binary: String,
    pub governor: GovernorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub min_launch_interval_ms: u64,
    pub try_count: u32,
    pub retry_interval_ms: u64,
    pub settle_interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            governor: GovernorConfig::default(),
        }
    }
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            min_launch_interval_ms: DEFAULT_MIN_LAUNCH_INTERVAL.as_millis() as u64,
            try_count: DEFAULT_TRY_COUNT,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            settle_interval_ms: DEFAULT_SETTLE_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let paths = [
            dirs::config_dir().map(|p| p.join("ytwrap/config.toml")),
            dirs::home_dir().map(|p| p.join(".ytwrap.toml")),
            Some(PathBuf::from("ytwrap.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                if let Ok(content) = std::fs::read_to_string(&path) {
                    match Self::from_toml_str(&content) {
                        Ok(config) => return config,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Ignoring invalid config")
                        }
                    }
                }
            }
        }

        Config::default()
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

impl GovernorConfig {
    pub fn min_launch_interval(&self) -> Duration {
        Duration::from_millis(self.min_launch_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn settle_interval(&self) -> Duration {
        Duration::from_millis(self.settle_interval_ms)
    }

    /// Context whose gate uses the configured launch spacing
    pub fn context(&self) -> ProcessContext {
        ProcessContext::new(self.min_launch_interval())
    }

    /// Apply the configured retry policy to a request
    pub fn apply<T>(&self, request: SpawnRequest<T>) -> SpawnRequest<T> {
        request
            .try_count(self.try_count)
            .retry_interval(self.retry_interval())
            .settle_interval(self.settle_interval())
    }
}
