//! Remote snapshot management: makes the installation reversible by
//! capturing the device's installed state and configuration before any
//! destructive step, and can replay a snapshot later.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, PrimitiveDateTime, macros::format_description};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, instrument, warn};

use crate::{
    models::{BackupProgress, DeviceArch},
    remote::{self, sh_quote},
    scripts::{self, RESTORE_COMPLETE_MARKER, RestoreScriptParams},
    session::{ExecOptions, RemoteRunner},
    stage::BackupRef,
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);
const COPY_TIMEOUT: Duration = Duration::from_secs(600);
const RESTORE_TIMEOUT: Duration = Duration::from_secs(300);

const BACKUP_NAME_PREFIX: &str = "backup_";

/// A component captured (or not) inside a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupComponent {
    Framework,
    Shims,
    Tripletap,
    DeviceConfig,
}

impl BackupComponent {
    /// Source path on the device.
    pub fn remote_source(self) -> &'static str {
        match self {
            Self::Framework => remote::XOVI_HOME,
            Self::Shims => remote::SHIMS_DIR,
            Self::Tripletap => remote::TRIPLETAP_DIR,
            Self::DeviceConfig => remote::XOCHITL_CONF,
        }
    }

    /// Name of the copy inside the snapshot directory.
    pub fn snapshot_name(self) -> &'static str {
        match self {
            Self::Framework => "xovi",
            Self::Shims => "shims",
            Self::Tripletap => "xovi-tripletap",
            Self::DeviceConfig => "xochitl.conf",
        }
    }
}

/// Metadata describing one snapshot. Serialized as `metadata.json` inside the
/// snapshot directory on the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSnapshot {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub device_ip: String,
    pub device_arch: DeviceArch,
    pub total_size_bytes: u64,
    /// Components that actually existed on the device and were captured.
    pub components: Vec<BackupComponent>,
    /// Whether the captured device config embeds the SSH credential.
    pub credential_captured: bool,
    /// Remote path of the generated restore script.
    pub restore_script: String,
    /// Local path of the compressed copy, when one was pulled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_archive: Option<PathBuf>,
}

impl BackupSnapshot {
    pub fn remote_dir(&self) -> String {
        format!("{}/{}", remote::BACKUPS_DIR, self.name)
    }

    pub fn as_ref_entry(&self) -> BackupRef {
        BackupRef {
            name: self.name.clone(),
            created_at: self.created_at,
            device_ip: self.device_ip.clone(),
            device_arch: self.device_arch,
            credential_captured: self.credential_captured,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    /// Snapshot name; auto-generated from the creation time when unset.
    pub name: Option<String>,
    /// Pull a compressed copy of the snapshot to the local machine.
    pub include_local_copy: bool,
}

/// Creates, validates, lists, restores and prunes on-device snapshots.
pub struct BackupManager {
    runner: Arc<dyn RemoteRunner>,
    local_backups_dir: PathBuf,
    device_ip: String,
    device_arch: DeviceArch,
    keep_count: usize,
    progress: Option<UnboundedSender<BackupProgress>>,
}

impl BackupManager {
    pub fn new(
        runner: Arc<dyn RemoteRunner>,
        local_backups_dir: impl Into<PathBuf>,
        device_ip: impl Into<String>,
        device_arch: DeviceArch,
        keep_count: usize,
    ) -> Self {
        Self {
            runner,
            local_backups_dir: local_backups_dir.into(),
            device_ip: device_ip.into(),
            device_arch,
            keep_count,
            progress: None,
        }
    }

    pub fn with_progress_sender(mut self, sender: UnboundedSender<BackupProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    fn report(&self, backup_name: &str, message: impl Into<String>) {
        if let Some(sink) = &self.progress {
            let _ = sink.send(BackupProgress {
                backup_name: backup_name.to_string(),
                message: message.into(),
            });
        }
    }

    /// Creates a snapshot of the device's current installed state.
    ///
    /// Captures whichever components exist, writes a self-contained restore
    /// script and a metadata document into the snapshot, then validates the
    /// result. A snapshot that fails validation is a creation failure, never
    /// partial success. Old snapshots beyond the retention count are pruned
    /// afterwards; pruning failures here are logged and swallowed.
    #[instrument(skip(self, options), err)]
    pub async fn create_backup(&self, options: &BackupOptions) -> Result<BackupSnapshot> {
        let created_at = OffsetDateTime::now_utc();
        let name = match &options.name {
            Some(name) => {
                let sanitized = sanitize_filename::sanitize(name);
                ensure!(!sanitized.is_empty(), "Backup name is empty after sanitizing");
                sanitized
            }
            None => generated_name(created_at)?,
        };
        let snapshot_dir = format!("{}/{}", remote::BACKUPS_DIR, name);
        info!(name = %name, "Creating backup");
        self.report(&name, "Creating snapshot directory");

        self.runner
            .execute_checked(&format!("mkdir -p {}", sh_quote(&snapshot_dir)), Some(COMMAND_TIMEOUT))
            .await
            .context("Failed to create snapshot directory")?;

        let mut components = Vec::new();
        for component in
            [BackupComponent::Framework, BackupComponent::Shims, BackupComponent::Tripletap]
        {
            let source = component.remote_source();
            if self.runner.remote_dir_exists(source).await {
                self.report(&name, format!("Capturing {}", component.snapshot_name()));
                self.runner
                    .execute_checked(
                        &format!(
                            "cp -a {} {}",
                            sh_quote(source),
                            sh_quote(&format!("{snapshot_dir}/{}", component.snapshot_name()))
                        ),
                        Some(COPY_TIMEOUT),
                    )
                    .await
                    .with_context(|| format!("Failed to capture {source}"))?;
                components.push(component);
            } else {
                debug!(source, "Component not present on device, not captured");
            }
        }

        let mut credential_captured = false;
        if self.runner.remote_file_exists(remote::XOCHITL_CONF).await {
            self.report(&name, "Capturing device configuration");
            self.runner
                .execute_checked(
                    &format!(
                        "cp {} {}",
                        sh_quote(remote::XOCHITL_CONF),
                        sh_quote(&format!(
                            "{snapshot_dir}/{}",
                            BackupComponent::DeviceConfig.snapshot_name()
                        ))
                    ),
                    Some(COMMAND_TIMEOUT),
                )
                .await
                .context("Failed to capture device configuration")?;
            credential_captured = self
                .runner
                .execute(
                    &format!("grep -q DeveloperPassword {}", sh_quote(remote::XOCHITL_CONF)),
                    ExecOptions::with_timeout(COMMAND_TIMEOUT),
                )
                .await
                .success();
            components.push(BackupComponent::DeviceConfig);
        }

        let total_size_bytes = self.snapshot_size(&snapshot_dir).await.unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Failed to measure snapshot size");
            0
        });

        let script = scripts::render_restore_script(&RestoreScriptParams {
            snapshot_dir: &snapshot_dir,
            components: &components,
        });
        let script_path = format!("{snapshot_dir}/restore.sh");
        self.runner.upload_bytes(script.as_bytes(), &script_path).await?;
        self.runner
            .execute_checked(&format!("chmod +x {}", sh_quote(&script_path)), Some(COMMAND_TIMEOUT))
            .await
            .context("Failed to mark restore script executable")?;

        let mut snapshot = BackupSnapshot {
            name: name.clone(),
            created_at,
            device_ip: self.device_ip.clone(),
            device_arch: self.device_arch,
            total_size_bytes,
            components,
            credential_captured,
            restore_script: script_path,
            local_archive: None,
        };
        let metadata =
            serde_json::to_vec_pretty(&snapshot).context("Failed to serialize metadata")?;
        self.runner.upload_bytes(&metadata, &format!("{snapshot_dir}/metadata.json")).await?;

        self.validate_snapshot(&name).await.context("Snapshot failed validation")?;

        if options.include_local_copy {
            self.report(&name, "Pulling compressed local copy");
            snapshot.local_archive = Some(self.pull_local_copy(&name).await?);
        }

        if let Err(e) = self.prune_backups(self.keep_count).await {
            warn!(error = %format!("{e:#}"), "Automatic snapshot pruning failed");
        }

        info!(name = %name, size = total_size_bytes, "Backup created");
        Ok(snapshot)
    }

    /// Checks that each required marker file exists and the restore script is
    /// executable. Anything less reads as "snapshot absent".
    #[instrument(skip(self), err)]
    pub async fn validate_snapshot(&self, name: &str) -> Result<()> {
        let snapshot_dir = format!("{}/{}", remote::BACKUPS_DIR, name);
        for marker in ["metadata.json", "restore.sh"] {
            let path = format!("{snapshot_dir}/{marker}");
            ensure!(
                self.runner.remote_file_exists(&path).await,
                "Snapshot {name} is missing required file {marker}"
            );
        }
        let script = format!("{snapshot_dir}/restore.sh");
        ensure!(
            self.runner
                .execute(
                    &format!("test -x {}", sh_quote(&script)),
                    ExecOptions::with_timeout(COMMAND_TIMEOUT)
                )
                .await
                .success(),
            "Snapshot {name} restore script is not executable"
        );
        Ok(())
    }

    async fn snapshot_size(&self, snapshot_dir: &str) -> Result<u64> {
        let output = self
            .runner
            .execute_checked(&format!("du -sk {}", sh_quote(snapshot_dir)), Some(COMMAND_TIMEOUT))
            .await?;
        let kib: u64 = output
            .split_whitespace()
            .next()
            .context("Empty du output")?
            .parse()
            .context("Unparseable du output")?;
        Ok(kib * 1024)
    }

    async fn pull_local_copy(&self, name: &str) -> Result<PathBuf> {
        let remote_archive = format!("{}/{name}.tar.gz", remote::BACKUPS_DIR);
        self.runner
            .execute_checked(
                &format!(
                    "tar czf {} -C {} {}",
                    sh_quote(&remote_archive),
                    sh_quote(remote::BACKUPS_DIR),
                    sh_quote(name)
                ),
                Some(COPY_TIMEOUT),
            )
            .await
            .context("Failed to compress snapshot on device")?;

        let local_path = self.local_backups_dir.join(format!("{name}.tar.gz"));
        let result = self.runner.download_file(&remote_archive, &local_path, None).await;
        // The uncompressed snapshot stays on the device either way; only the
        // temporary archive is removed.
        let _ = self
            .runner
            .execute(
                &format!("rm -f {}", sh_quote(&remote_archive)),
                ExecOptions::with_timeout(COMMAND_TIMEOUT),
            )
            .await;
        result.context("Failed to download snapshot archive")?;
        info!(path = %local_path.display(), "Local snapshot copy saved");
        Ok(local_path)
    }

    /// Enumerates snapshots on the device. Zero matching directories is an
    /// empty list, not an error.
    #[instrument(skip(self), err)]
    pub async fn list_backups(&self) -> Result<Vec<BackupSnapshot>> {
        let listing = self
            .runner
            .execute(
                &format!("ls -1 {}", sh_quote(remote::BACKUPS_DIR)),
                ExecOptions::with_timeout(COMMAND_TIMEOUT),
            )
            .await;
        if !listing.success() {
            debug!("Backups directory absent or unreadable, no snapshots");
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for name in listing.stdout.lines().map(str::trim).filter(|n| !n.is_empty()) {
            if !is_valid_backup_name(name) {
                continue;
            }
            let metadata = self
                .runner
                .execute(
                    &format!(
                        "cat {}",
                        sh_quote(&format!("{}/{name}/metadata.json", remote::BACKUPS_DIR))
                    ),
                    ExecOptions::with_timeout(COMMAND_TIMEOUT),
                )
                .await;
            if !metadata.success() {
                debug!(name, "Snapshot has no readable metadata, ignoring");
                continue;
            }
            match serde_json::from_str::<BackupSnapshot>(&metadata.stdout) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(name, error = %e, "Unparseable snapshot metadata, ignoring"),
            }
        }
        snapshots.sort_by_key(|s| std::cmp::Reverse(sort_timestamp(s)));
        debug!(count = snapshots.len(), "Snapshots listed");
        Ok(snapshots)
    }

    /// Re-validates a snapshot and executes its embedded restore script.
    ///
    /// The script restarts the device UI service, which may drop the
    /// connection; as long as the script reported success before the
    /// disconnect, that is a successful restore.
    #[instrument(skip(self, output), err)]
    pub async fn restore_from_backup(
        &self,
        name: &str,
        output: Option<UnboundedSender<String>>,
    ) -> Result<()> {
        ensure!(is_valid_backup_name(name), "Invalid backup name: {name}");
        self.validate_snapshot(name).await?;
        self.report(name, "Running restore script");

        let script = format!("{}/{name}/restore.sh", remote::BACKUPS_DIR);
        let result = self
            .runner
            .execute(
                &format!("sh {}", sh_quote(&script)),
                ExecOptions { timeout: Some(RESTORE_TIMEOUT), output },
            )
            .await;

        if result.success() {
            info!(name, "Restore finished");
            return Ok(());
        }
        let reported_success = result.stdout.contains(RESTORE_COMPLETE_MARKER);
        if reported_success && crate::installer::signatures::is_expected_disconnect(&result) {
            warn!(
                name,
                exit_code = result.exit_code,
                "Restore dropped the connection after reporting success; treating as complete"
            );
            return Ok(());
        }
        bail!(
            "Restore script failed with exit code {}: {}",
            result.exit_code,
            if result.stderr.is_empty() { result.stdout } else { result.stderr }
        );
    }

    /// Deletes one snapshot by name.
    #[instrument(skip(self), err)]
    pub async fn delete_backup(&self, name: &str) -> Result<()> {
        ensure!(is_valid_backup_name(name), "Invalid backup name: {name}");
        let snapshot_dir = format!("{}/{name}", remote::BACKUPS_DIR);
        self.runner
            .execute_checked(&format!("rm -rf {}", sh_quote(&snapshot_dir)), Some(COMMAND_TIMEOUT))
            .await
            .with_context(|| format!("Failed to delete snapshot {name}"))?;
        info!(name, "Snapshot deleted");
        Ok(())
    }

    /// Deletes the oldest snapshots beyond `keep_count`, ordered by the
    /// timestamp embedded in the snapshot name (creation time as fallback).
    /// Returns `(deleted, kept)`.
    #[instrument(skip(self), err, ret)]
    pub async fn prune_backups(&self, keep_count: usize) -> Result<(usize, usize)> {
        let mut snapshots = self.list_backups().await?;
        if snapshots.len() <= keep_count {
            return Ok((0, snapshots.len()));
        }
        let victims = snapshots.split_off(keep_count);
        let mut deleted = 0;
        for snapshot in &victims {
            self.delete_backup(&snapshot.name).await?;
            deleted += 1;
        }
        Ok((deleted, snapshots.len()))
    }
}

fn generated_name(created_at: OffsetDateTime) -> Result<String> {
    let fmt = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    let timestamp = created_at.format(&fmt).context("Failed to format timestamp")?;
    Ok(format!("{BACKUP_NAME_PREFIX}{timestamp}"))
}

/// Names are path components the manager itself generated or sanitized; any
/// separator means someone is pointing us outside the backups directory.
fn is_valid_backup_name(name: &str) -> bool {
    !name.is_empty() && !name.contains('/') && !name.contains("..") && name != "."
}

/// Ordering key for pruning: the timestamp embedded in the name, falling back
/// to the recorded creation time when the name does not parse.
fn sort_timestamp(snapshot: &BackupSnapshot) -> OffsetDateTime {
    parse_name_timestamp(&snapshot.name).unwrap_or(snapshot.created_at)
}

fn parse_name_timestamp(name: &str) -> Option<OffsetDateTime> {
    let raw = name.strip_prefix(BACKUP_NAME_PREFIX)?;
    let fmt = format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]");
    PrimitiveDateTime::parse(raw, &fmt).ok().map(|dt| dt.assume_utc())
}
