//! Preset model registry.
//!
//! Maps preset names offered to users onto weight-file paths. Built once at
//! startup and shared read-only between jobs.

use crate::error::PresetError;
use crate::model::DEFAULT_PRESET;
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// File extension of weight files picked up from a models directory.
const WEIGHT_EXT: &str = "pth";

#[derive(Debug, Clone, Default)]
pub struct PresetRegistry {
    entries: BTreeMap<String, PathBuf>,
}

/// Listing entry for collaborators.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PresetInfo {
    pub name: String,
    pub path: PathBuf,
    pub available: bool,
}

impl PresetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding only the stock UNet preset relative to `root`.
    pub fn with_default(root: &Path) -> Self {
        let mut reg = Self::new();
        reg.insert(
            DEFAULT_PRESET,
            root.join("models").join("unet_best_weight.pth"),
        );
        reg
    }

    pub fn insert(&mut self, name: impl Into<String>, path: PathBuf) {
        self.entries.insert(name.into(), path);
    }

    /// Parse a `NAME=PATH` pair as given on the command line.
    pub fn parse_entry(entry: &str) -> Result<(String, PathBuf), String> {
        let (name, path) = entry
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=PATH, got '{entry}'"))?;
        let name = name.trim();
        if name.is_empty() || path.trim().is_empty() {
            return Err(format!("expected NAME=PATH, got '{entry}'"));
        }
        Ok((name.to_string(), PathBuf::from(path.trim())))
    }

    /// Register every `*.pth` file of `dir` under its file stem.
    pub fn load_dir(&mut self, dir: &Path) -> Result<usize> {
        let rd = std::fs::read_dir(dir)
            .with_context(|| format!("read models directory {}", dir.display()))?;
        let mut added = 0;
        for entry in rd {
            let path = entry?.path();
            let is_weight = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.eq_ignore_ascii_case(WEIGHT_EXT))
                .unwrap_or(false);
            if !is_weight || !path.is_file() {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                self.entries.insert(stem.to_string(), path.clone());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Resolve a preset name to an existing weight file.
    pub fn resolve(&self, name: &str) -> Result<&Path, PresetError> {
        let path = self
            .entries
            .get(name)
            .ok_or_else(|| PresetError::Unknown(name.to_string()))?;
        if !path.is_file() {
            return Err(PresetError::Missing {
                name: name.to_string(),
                path: path.clone(),
            });
        }
        Ok(path)
    }

    pub fn list(&self) -> Vec<PresetInfo> {
        self.entries
            .iter()
            .map(|(name, path)| PresetInfo {
                name: name.clone(),
                path: path.clone(),
                available: path.is_file(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_unknown_preset_is_typed_error() {
        let reg = PresetRegistry::new();
        assert_eq!(
            reg.resolve("nope").unwrap_err(),
            PresetError::Unknown("nope".into())
        );
    }

    #[test]
    fn resolve_reports_missing_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PresetRegistry::with_default(dir.path());
        let err = reg.resolve(DEFAULT_PRESET).unwrap_err();
        let expected = dir.path().join("models").join("unet_best_weight.pth");
        assert_eq!(
            err,
            PresetError::Missing {
                name: DEFAULT_PRESET.into(),
                path: expected.clone(),
            }
        );
        assert!(err.to_string().contains(&expected.display().to_string()));
    }

    #[test]
    fn load_dir_picks_up_weight_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("unet.pth"), b"w").unwrap();
        std::fs::write(dir.path().join("Other.PTH"), b"w").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut reg = PresetRegistry::new();
        assert_eq!(reg.load_dir(dir.path()).unwrap(), 2);
        assert_eq!(reg.resolve("unet").unwrap(), dir.path().join("unet.pth"));
        assert!(reg.resolve("Other").is_ok());
        assert!(reg.resolve("notes").is_err());
        assert!(reg.list().iter().all(|p| p.available));
    }

    #[test]
    fn parse_entry_splits_on_first_equals() {
        assert_eq!(
            PresetRegistry::parse_entry("big=/m/a=b.pth").unwrap(),
            ("big".to_string(), PathBuf::from("/m/a=b.pth"))
        );
        assert!(PresetRegistry::parse_entry("noequals").is_err());
        assert!(PresetRegistry::parse_entry("=/x").is_err());
    }
}
