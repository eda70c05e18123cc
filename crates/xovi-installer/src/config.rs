//! Installer configuration: per-architecture download sources and local
//! paths. Loaded from and saved to a JSON file next to the other state.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::models::DeviceArch;

/// One downloadable component.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSource {
    pub url: String,
    /// Local filename inside the downloads directory.
    pub filename: String,
    /// Hex-encoded SHA-256, verified after download when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl ComponentSource {
    fn new(url: &str, filename: &str) -> Self {
        Self { url: url.to_string(), filename: filename.to_string(), sha256: None }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentKind {
    XoviBinary,
    ExtensionsBundle,
    AppLoadBundle,
    KoreaderBundle,
}

/// Download sources for one device architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchComponents {
    pub xovi_binary: ComponentSource,
    pub extensions_bundle: ComponentSource,
    pub appload_bundle: ComponentSource,
    pub koreader_bundle: ComponentSource,
}

impl ArchComponents {
    pub fn get(&self, kind: ComponentKind) -> &ComponentSource {
        match kind {
            ComponentKind::XoviBinary => &self.xovi_binary,
            ComponentKind::ExtensionsBundle => &self.extensions_bundle,
            ComponentKind::AppLoadBundle => &self.appload_bundle,
            ComponentKind::KoreaderBundle => &self.koreader_bundle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub downloads_dir: PathBuf,
    pub state_file: PathBuf,
    pub local_backups_dir: PathBuf,
    pub logs_dir: PathBuf,
    /// Create a snapshot before any mutating installation step.
    pub backup_before_install: bool,
    /// Pull a compressed copy of each snapshot to the local machine.
    pub keep_local_backup_copy: bool,
    /// Snapshots retained on-device after automatic pruning.
    pub backups_keep_count: usize,
    pub components: BTreeMap<DeviceArch, ArchComponents>,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("xovi-installer");
        let mut components = BTreeMap::new();
        components.insert(
            DeviceArch::Aarch64,
            ArchComponents {
                xovi_binary: ComponentSource::new(
                    "https://github.com/asivery/xovi/releases/latest/download/xovi-aarch64.so",
                    "xovi-aarch64.so",
                ),
                extensions_bundle: ComponentSource::new(
                    "https://github.com/asivery/rm-xovi-extensions/releases/latest/download/extensions-aarch64.zip",
                    "extensions-aarch64.zip",
                ),
                appload_bundle: ComponentSource::new(
                    "https://github.com/asivery/rm-appload/releases/latest/download/appload-aarch64.zip",
                    "appload-aarch64.zip",
                ),
                koreader_bundle: ComponentSource::new(
                    "https://github.com/koreader/koreader/releases/latest/download/koreader-remarkable-aarch64.zip",
                    "koreader-remarkable-aarch64.zip",
                ),
            },
        );
        components.insert(
            DeviceArch::Armv7,
            ArchComponents {
                xovi_binary: ComponentSource::new(
                    "https://github.com/asivery/xovi/releases/latest/download/xovi-arm32.so",
                    "xovi-arm32.so",
                ),
                extensions_bundle: ComponentSource::new(
                    "https://github.com/asivery/rm-xovi-extensions/releases/latest/download/extensions-arm32.zip",
                    "extensions-arm32.zip",
                ),
                appload_bundle: ComponentSource::new(
                    "https://github.com/asivery/rm-appload/releases/latest/download/appload-arm32.zip",
                    "appload-arm32.zip",
                ),
                koreader_bundle: ComponentSource::new(
                    "https://github.com/koreader/koreader/releases/latest/download/koreader-remarkable.zip",
                    "koreader-remarkable.zip",
                ),
            },
        );
        Self {
            downloads_dir: data_dir.join("downloads"),
            state_file: data_dir.join("install-state.json"),
            local_backups_dir: data_dir.join("backups"),
            logs_dir: data_dir.join("logs"),
            backup_before_install: true,
            keep_local_backup_copy: false,
            backups_keep_count: 3,
            components,
        }
    }
}

impl InstallerConfig {
    /// Looks up a component source for an architecture.
    pub fn component(&self, arch: DeviceArch, kind: ComponentKind) -> Result<&ComponentSource> {
        self.components
            .get(&arch)
            .map(|entry| entry.get(kind))
            .with_context(|| format!("No components configured for architecture {arch}"))
    }

    /// Loads configuration from `path`. A missing file yields the defaults;
    /// a present-but-unparseable file is an error the user should see.
    #[instrument(err)]
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Loads configuration, falling back to defaults on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Failed to load config, using defaults");
            Self::default()
        })
    }

    #[instrument(skip(self), err)]
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn defaults_cover_every_architecture() {
        let config = InstallerConfig::default();
        for arch in [DeviceArch::Aarch64, DeviceArch::Armv7] {
            for kind in [
                ComponentKind::XoviBinary,
                ComponentKind::ExtensionsBundle,
                ComponentKind::AppLoadBundle,
                ComponentKind::KoreaderBundle,
            ] {
                let source = config.component(arch, kind).unwrap();
                assert!(source.url.starts_with("https://"));
                assert!(!source.filename.is_empty());
            }
        }
        assert_eq!(config.backups_keep_count, 3);
        assert!(config.backup_before_install);
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut config = InstallerConfig::default();
        config.backup_before_install = false;
        config.save(&path).unwrap();

        let loaded = InstallerConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempdir().unwrap();
        let loaded = InstallerConfig::load(&dir.path().join("missing.json")).unwrap();
        assert_eq!(loaded, InstallerConfig::default());
    }

    #[test]
    fn unparseable_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        assert!(InstallerConfig::load(&path).is_err());
        // But the forgiving entry point still produces something usable.
        let config = InstallerConfig::load_or_default(&path);
        assert_eq!(config, InstallerConfig::default());
    }
}
