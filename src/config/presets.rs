//! Named argument presets for common downloads

use anyhow::{Context, Result};
use fuzzy_matcher::skim::SkimMatcherV2;
use fuzzy_matcher::FuzzyMatcher;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// A named set of extra downloader arguments
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preset {
    /// Unique name for the preset
    pub name: String,
    /// Short alias (e.g., "a" for audio)
    pub shortcut: Option<String>,
    #[serde(default)]
    pub description: String,
    /// Arguments passed to the downloader before the URLs
    #[serde(default)]
    pub args: Vec<String>,
}

/// Configuration file structure
#[derive(Debug, Default, Serialize, Deserialize)]
struct PresetConfig {
    #[serde(default)]
    preset: Vec<Preset>,
}

const DEFAULT_PRESETS: &str = r#"# ytwrap presets
# Select one with `ytwrap --preset <name|shortcut> <url>`

# [[preset]]
# name = "playlist"
# shortcut = "pl"
# description = "Whole playlist, numbered"
# args = ["--yes-playlist", "-o", "%(playlist_index)s - %(title)s.%(ext)s"]

[[preset]]
name = "audio"
shortcut = "a"
description = "Best audio, converted to mp3"
args = ["-x", "--audio-format", "mp3"]

[[preset]]
name = "best"
shortcut = "b"
description = "Best video and audio, merged"
args = ["-f", "bv*+ba/b"]
"#;

/// Manager for loading and querying presets
pub struct PresetManager {
    presets: Vec<Preset>,
    config_path: PathBuf,
    matcher: SkimMatcherV2,
}

impl PresetManager {
    /// Load presets from ~/.config/ytwrap/presets.toml
    pub fn load() -> Result<Self> {
        Self::load_from(Self::config_path())
    }

    /// Load presets from a specific file, creating it with defaults if missing
    pub fn load_from(config_path: PathBuf) -> Result<Self> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !config_path.exists() {
            fs::write(&config_path, DEFAULT_PRESETS)
                .with_context(|| format!("Failed to write {}", config_path.display()))?;
        }

        let presets = Self::read(&config_path)?;

        Ok(Self {
            presets,
            config_path,
            matcher: SkimMatcherV2::default(),
        })
    }

    fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("ytwrap")
            .join("presets.toml")
    }

    fn read(path: &Path) -> Result<Vec<Preset>> {
        let content = fs::read_to_string(path).context("Failed to read presets.toml")?;
        let config: PresetConfig =
            toml::from_str(&content).context("Failed to parse presets.toml")?;
        Ok(config.preset)
    }

    /// Get all presets
    pub fn all(&self) -> &[Preset] {
        &self.presets
    }

    /// Find preset by exact name
    pub fn find_by_name(&self, name: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.name == name)
    }

    /// Find preset by shortcut
    pub fn find_by_shortcut(&self, shortcut: &str) -> Option<&Preset> {
        self.presets
            .iter()
            .find(|p| p.shortcut.as_deref() == Some(shortcut))
    }

    /// Name first, then shortcut
    pub fn resolve(&self, key: &str) -> Option<&Preset> {
        self.find_by_name(key).or_else(|| self.find_by_shortcut(key))
    }

    /// Fuzzy search presets by query (matches name and shortcut)
    pub fn fuzzy_search(&self, query: &str) -> Vec<(&Preset, i64)> {
        if query.is_empty() {
            return self.presets.iter().map(|p| (p, 0i64)).collect();
        }

        let mut results: Vec<(&Preset, i64)> = self
            .presets
            .iter()
            .filter_map(|preset| {
                let name_score = self.matcher.fuzzy_match(&preset.name, query);
                let shortcut_score = preset
                    .shortcut
                    .as_ref()
                    .and_then(|s| self.matcher.fuzzy_match(s, query));

                name_score.max(shortcut_score).map(|score| (preset, score))
            })
            .collect();

        // Sort by score descending
        results.sort_by(|a, b| b.1.cmp(&a.1));
        results
    }

    /// Reload configuration from disk
    pub fn reload(&mut self) -> Result<()> {
        self.presets = Self::read(&self.config_path)?;
        Ok(())
    }

    /// Get the config file path (for display/editing)
    pub fn get_config_path(&self) -> &PathBuf {
        &self.config_path
    }
}
