use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::pipeline::default_workers;

/// Persistent defaults, loadable from a JSON file and overridden by CLI flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub ledger_dir: Option<PathBuf>,
    pub originals_root: Option<PathBuf>,
    pub anonymized_root: Option<PathBuf>,
    pub workers: Option<usize>,
    pub strip_private_tags: Option<bool>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open settings file {}", path.display()))?;
        serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))
    }

    /// Settings from `path` if given, otherwise built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        path.map_or_else(|| Ok(Self::default()), Self::load)
    }

    pub fn ledger_dir(&self) -> PathBuf {
        self.ledger_dir.clone().unwrap_or_else(|| PathBuf::from("ledger"))
    }

    pub fn originals_root(&self) -> PathBuf {
        self.originals_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("originals"))
    }

    pub fn anonymized_root(&self) -> PathBuf {
        self.anonymized_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("anonymized"))
    }

    pub fn workers(&self) -> usize {
        self.workers.filter(|n| *n > 0).unwrap_or_else(default_workers)
    }

    pub fn strip_private_tags(&self) -> bool {
        self.strip_private_tags.unwrap_or(false)
    }
}
