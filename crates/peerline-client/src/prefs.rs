//! Display-name preference, kept in a small JSON file.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use peerline_common::helpers::{validate_display_name, DEFAULT_DISPLAY_NAME};
use peerline_common::Result;

#[derive(Debug, Serialize, Deserialize)]
struct StoredName {
    display_name: String,
}

#[derive(Debug, Clone)]
pub struct NamePreference {
    path: PathBuf,
}

impl NamePreference {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored name, or the default (saved right away) when the file is missing.
    /// A file holding an invalid name is treated like a missing one.
    pub fn load_or_init(&self) -> Result<String> {
        if self.path.exists() {
            let text = fs::read_to_string(&self.path)?;
            match serde_json::from_str::<StoredName>(&text)
                .map_err(Into::into)
                .and_then(|stored| validate_display_name(&stored.display_name))
            {
                Ok(name) => {
                    debug!("Loaded display name from {}", self.path.display());
                    return Ok(name);
                }
                Err(e) => warn!(
                    "Ignoring unusable name preference at {}: {}",
                    self.path.display(),
                    e
                ),
            }
        }

        info!("Using default display name \"{}\"", DEFAULT_DISPLAY_NAME);
        self.save(DEFAULT_DISPLAY_NAME)?;
        Ok(DEFAULT_DISPLAY_NAME.to_string())
    }

    pub fn save(&self, name: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let stored = StoredName {
            display_name: name.to_string(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&stored)?)?;
        Ok(())
    }
}
