use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::{klog_debug, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub stall: StallSection,
    #[serde(default)]
    pub plateau: PlateauSection,
    #[serde(default)]
    pub chunker: ChunkerSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    pub avg_phase_duration_secs: u64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            avg_phase_duration_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    pub db_path: Option<String>,
    pub days_to_keep: u32,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            db_path: None,
            days_to_keep: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StallSection {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_missed: u32,
}

impl Default for StallSection {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 90_000,
            max_missed: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlateauSection {
    pub history_size: usize,
    pub plateau_threshold: f64,
    pub min_samples: usize,
}

impl Default for PlateauSection {
    fn default() -> Self {
        Self {
            history_size: 10,
            plateau_threshold: 0.005,
            min_samples: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkerSection {
    pub max_chunk_loc: usize,
    pub avg_loc_per_file: usize,
    pub max_items_per_chunk: usize,
}

impl Default for ChunkerSection {
    fn default() -> Self {
        Self {
            max_chunk_loc: 10_000,
            avg_loc_per_file: 100,
            max_items_per_chunk: 50,
        }
    }
}

impl Config {
    pub fn keel_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".keel"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::keel_dir()?.join("keel.toml"))
    }

    /// Resolved checkpoint database location.
    pub fn checkpoint_db_path(&self) -> Result<PathBuf> {
        match &self.checkpoint.db_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::keel_dir()?.join("checkpoints.db")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        klog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            klog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::parse(&fs::read_to_string(&path)?)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)?;
        klog_debug!(
            "Config loaded: stall={:?}, plateau={:?}, chunker={:?}",
            config.stall,
            config.plateau,
            config.chunker
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
