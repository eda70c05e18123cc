use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::stage::InstallStage;

/// Device CPU architecture tag, used to pick the right component bundles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceArch {
    /// 64-bit devices (reMarkable Paper Pro).
    Aarch64,
    /// 32-bit devices (reMarkable 1 and 2).
    Armv7,
}

impl DeviceArch {
    /// Maps `uname -m` output to an architecture tag.
    pub fn from_uname(machine: &str) -> Option<Self> {
        match machine.trim() {
            "aarch64" | "arm64" => Some(Self::Aarch64),
            "armv7l" | "armv6l" | "armhf" => Some(Self::Armv7),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Aarch64 => "aarch64",
            Self::Armv7 => "arm32",
        }
    }
}

impl Display for DeviceArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Byte-level progress of a single HTTP download.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub filename: String,
    pub bytes: u64,
    /// Unknown until the transfer headers arrive.
    pub total_bytes: Option<u64>,
}

/// Byte-level progress of a single SFTP transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferProgress {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// Summarized installation progress, derived from the stage machine.
#[derive(Debug, Clone)]
pub struct InstallProgress {
    pub stage: InstallStage,
    /// Overall progress in percent (0-100).
    pub percent: f32,
    pub message: String,
    /// Name of the step currently running, if any.
    pub step: Option<String>,
}

/// Progress of a backup operation.
#[derive(Debug, Clone)]
pub struct BackupProgress {
    pub backup_name: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uname_mapping() {
        assert_eq!(DeviceArch::from_uname("aarch64\n"), Some(DeviceArch::Aarch64));
        assert_eq!(DeviceArch::from_uname("armv7l"), Some(DeviceArch::Armv7));
        assert_eq!(DeviceArch::from_uname("x86_64"), None);
    }

    #[test]
    fn arch_tags_are_injective() {
        assert_ne!(DeviceArch::Aarch64.as_tag(), DeviceArch::Armv7.as_tag());
    }
}
