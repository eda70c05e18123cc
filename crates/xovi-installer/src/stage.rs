//! Canonical representation of "where the installation is": stages, per-step
//! status, timestamps and error history, serializable so an interrupted run
//! can resume after the managing process restarts.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use derive_more::Debug;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::{models::DeviceArch, utils::atomic_write};

/// Bumped whenever the persisted layout changes; older tools refuse newer
/// files by treating them as absent state.
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallationType {
    Full,
    LauncherOnly,
    Stage1Only,
    Stage2Only,
}

impl InstallationType {
    /// Ordered stages this installation type runs through.
    pub fn stage_sequence(self) -> &'static [InstallStage] {
        match self {
            Self::Full => &[InstallStage::Stage1, InstallStage::Stage2],
            Self::LauncherOnly => &[InstallStage::LauncherOnly],
            Self::Stage1Only => &[InstallStage::Stage1],
            Self::Stage2Only => &[InstallStage::Stage2],
        }
    }

    pub fn entry_stage(self) -> InstallStage {
        self.stage_sequence()[0]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStage {
    NotStarted,
    Stage1,
    Stage2,
    LauncherOnly,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl StepStatus {
    /// Completed and skipped steps both count towards stage completion.
    pub fn is_done(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

/// A single named step within a stage. Step names are stable across versions
/// so persisted state remains loadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepState {
    pub name: String,
    pub description: String,
    pub status: StepStatus,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub started_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub finished_at: Option<OffsetDateTime>,
    pub error: Option<String>,
}

impl StepState {
    fn from_template((name, description): (&str, &str)) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageSteps {
    pub stage: InstallStage,
    pub steps: Vec<StepState>,
}

/// Reference to the snapshot created at the start of an installation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRef {
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub device_ip: String,
    pub device_arch: DeviceArch,
    /// Whether the device's SSH credential was captured inside the snapshot.
    pub credential_captured: bool,
}

const STAGE1_STEPS: &[(&str, &str)] = &[
    ("device_setup", "Prepare the device and verify the connection"),
    ("device_detection", "Detect the device architecture"),
    ("backup_creation", "Snapshot the current installation state"),
    ("file_download", "Download framework, extension and launcher bundles"),
    ("xovi_installation", "Upload and install the XOVI framework"),
    ("extensions_installation", "Install bundled extensions"),
    ("shims_setup", "Install compatibility shims"),
    ("appload_configuration", "Configure the AppLoad launcher"),
    ("hashtable_rebuild", "Rebuild the qmldiff hashtable and restart the UI"),
];

const FINAL_ACTIVATION_STEP: (&str, &str) =
    ("final_activation", "Restart the UI service to activate the framework");

const STAGE2_STEPS: &[(&str, &str)] = &[
    ("koreader_download", "Download the KOReader bundle"),
    ("koreader_installation", "Upload and unpack KOReader into AppLoad"),
    ("archive_cleanup", "Remove uploaded archives from the device"),
    FINAL_ACTIVATION_STEP,
];

fn steps_for_stage(stage: InstallStage) -> Vec<StepState> {
    match stage {
        InstallStage::Stage1 => STAGE1_STEPS.iter().copied().map(StepState::from_template).collect(),
        InstallStage::Stage2 => STAGE2_STEPS.iter().copied().map(StepState::from_template).collect(),
        InstallStage::LauncherOnly => STAGE1_STEPS
            .iter()
            .copied()
            .chain(std::iter::once(FINAL_ACTIVATION_STEP))
            .map(StepState::from_template)
            .collect(),
        InstallStage::NotStarted | InstallStage::Completed | InstallStage::Failed => Vec::new(),
    }
}

/// The installation state machine.
///
/// The step list per stage is a fixed, ordered template: steps are never
/// reordered or removed at runtime, only their status mutates. Progress
/// counters are always recomputed from step statuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMachine {
    version: u32,
    pub installation_type: InstallationType,
    pub current_stage: InstallStage,
    pub device_ip: String,
    /// Stored so a resumed run does not require re-entering credentials. The
    /// same credential already sits in plaintext in the device's own config.
    #[debug(skip)]
    pub ssh_password: String,
    pub device_arch: DeviceArch,
    stages: Vec<StageSteps>,
    pub backup: Option<BackupRef>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl StageMachine {
    /// Creates a fresh machine for an installation run: all steps pending,
    /// current stage set to the type's entry stage.
    pub fn new(
        installation_type: InstallationType,
        device_ip: impl Into<String>,
        ssh_password: impl Into<String>,
        device_arch: DeviceArch,
    ) -> Self {
        let now = OffsetDateTime::now_utc();
        let stages = installation_type
            .stage_sequence()
            .iter()
            .map(|&stage| StageSteps { stage, steps: steps_for_stage(stage) })
            .collect();
        Self {
            version: STATE_FORMAT_VERSION,
            installation_type,
            current_stage: installation_type.entry_stage(),
            device_ip: device_ip.into(),
            ssh_password: ssh_password.into(),
            device_arch,
            stages,
            backup: None,
            started_at: now,
            updated_at: now,
        }
    }

    pub fn stages(&self) -> &[StageSteps] {
        &self.stages
    }

    /// Steps of the stage currently executing; empty for terminal stages.
    pub fn current_steps(&self) -> &[StepState] {
        self.stages
            .iter()
            .find(|entry| entry.stage == self.current_stage)
            .map(|entry| entry.steps.as_slice())
            .unwrap_or(&[])
    }

    pub fn steps_for(&self, stage: InstallStage) -> Option<&[StepState]> {
        self.stages.iter().find(|entry| entry.stage == stage).map(|entry| entry.steps.as_slice())
    }

    pub fn is_completed(&self) -> bool {
        self.current_stage == InstallStage::Completed
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc();
    }

    /// Step names are unique across a machine's stage sequence, so lookup
    /// spans all stages (a completed step from an earlier stage stays
    /// addressable after advancement).
    fn step_mut(&mut self, name: &str) -> Result<&mut StepState> {
        self.stages
            .iter_mut()
            .flat_map(|entry| entry.steps.iter_mut())
            .find(|step| step.name == name)
            .with_context(|| format!("Unknown step: {name}"))
    }

    pub fn start_step(&mut self, name: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        let step = self.step_mut(name)?;
        step.status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.finished_at = None;
        step.error = None;
        self.touch();
        Ok(())
    }

    /// Marks a step completed. When every step of the current stage is
    /// completed-or-skipped, advances to the next stage in the installation
    /// type's sequence (or to `Completed` after the last stage). Completing
    /// an already-completed step is a no-op and never re-triggers
    /// advancement.
    pub fn complete_step(&mut self, name: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        {
            let step = self.step_mut(name)?;
            if step.status == StepStatus::Completed {
                debug!(step = name, "Step already completed");
                return Ok(());
            }
            step.status = StepStatus::Completed;
            if step.started_at.is_none() {
                step.started_at = Some(now);
            }
            step.finished_at = Some(now);
            step.error = None;
        }
        self.touch();
        self.maybe_advance();
        Ok(())
    }

    pub fn skip_step(&mut self, name: &str, reason: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        {
            let step = self.step_mut(name)?;
            step.status = StepStatus::Skipped;
            step.finished_at = Some(now);
            step.error = Some(format!("skipped: {reason}"));
        }
        info!(step = name, reason, "Step skipped");
        self.touch();
        self.maybe_advance();
        Ok(())
    }

    /// Records a step failure. The stage moves to `Failed`; the per-stage
    /// step statuses keep enough information for a later resume.
    pub fn fail_step(&mut self, name: &str, error: &str) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        {
            let step = self.step_mut(name)?;
            step.status = StepStatus::Failed;
            step.finished_at = Some(now);
            step.error = Some(error.to_string());
        }
        warn!(step = name, error, "Step failed");
        self.current_stage = InstallStage::Failed;
        self.touch();
        Ok(())
    }

    fn position(&self, stage: InstallStage) -> Option<usize> {
        self.installation_type.stage_sequence().iter().position(|&s| s == stage)
    }

    fn maybe_advance(&mut self) {
        let all_done = self
            .stages
            .iter()
            .find(|entry| entry.stage == self.current_stage)
            .is_some_and(|entry| entry.steps.iter().all(|step| step.status.is_done()));
        if !all_done {
            return;
        }
        let next = self
            .position(self.current_stage)
            .and_then(|i| self.installation_type.stage_sequence().get(i + 1).copied());
        self.current_stage = next.unwrap_or(InstallStage::Completed);
        info!(stage = ?self.current_stage, "Stage complete, advancing");
    }

    /// Explicitly moves to a stage of this installation type's sequence,
    /// used when the orchestrator begins a stage.
    pub fn enter_stage(&mut self, stage: InstallStage) -> Result<()> {
        ensure!(
            self.position(stage).is_some(),
            "Stage {stage:?} is not part of a {:?} installation",
            self.installation_type
        );
        self.current_stage = stage;
        self.touch();
        Ok(())
    }

    /// First stage in the sequence that still has unfinished steps.
    pub fn first_unfinished_stage(&self) -> Option<InstallStage> {
        self.stages
            .iter()
            .find(|entry| entry.steps.iter().any(|step| !step.status.is_done()))
            .map(|entry| entry.stage)
    }

    /// Prepares a loaded machine for a resumed run: picks the stage to
    /// continue from, and resets interrupted (in-progress or failed) steps of
    /// that stage and later ones back to pending so they are retried rather
    /// than silently treated as complete.
    pub fn resume(&mut self, resume_from: Option<InstallStage>) -> Result<InstallStage> {
        let target = match resume_from {
            Some(stage) => {
                ensure!(
                    self.position(stage).is_some(),
                    "Stage {stage:?} is not part of a {:?} installation",
                    self.installation_type
                );
                stage
            }
            None => self
                .first_unfinished_stage()
                .context("Nothing to resume: every stage is already complete")?,
        };
        let target_pos =
            self.position(target).context("Resume stage missing from the stage sequence")?;
        let sequence = self.installation_type.stage_sequence();
        for entry in &mut self.stages {
            let Some(pos) = sequence.iter().position(|&s| s == entry.stage) else { continue };
            if pos < target_pos {
                continue;
            }
            for step in &mut entry.steps {
                if matches!(step.status, StepStatus::InProgress | StepStatus::Failed) {
                    step.status = StepStatus::Pending;
                    step.started_at = None;
                    step.finished_at = None;
                    step.error = None;
                }
            }
        }
        self.current_stage = target;
        self.touch();
        info!(stage = ?target, "Resuming installation");
        Ok(target)
    }

    /// Overall progress in percent, derived purely from step statuses.
    pub fn progress_percentage(&self) -> f32 {
        let total: usize = self.stages.iter().map(|entry| entry.steps.len()).sum();
        if total == 0 {
            return 0.0;
        }
        let done: usize = self
            .stages
            .iter()
            .flat_map(|entry| entry.steps.iter())
            .filter(|step| step.status.is_done())
            .count();
        done as f32 / total as f32 * 100.0
    }

    /// Progress of the current stage in percent.
    pub fn stage_progress_percentage(&self) -> f32 {
        let steps = self.current_steps();
        if steps.is_empty() {
            return if self.is_completed() { 100.0 } else { 0.0 };
        }
        let done = steps.iter().filter(|step| step.status.is_done()).count();
        done as f32 / steps.len() as f32 * 100.0
    }

    /// Serializes the machine to `path` atomically.
    #[instrument(skip(self), err)]
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self).context("Failed to serialize state")?;
        atomic_write(path, &json).await
    }

    /// Loads a machine from `path`. A missing file and an unparseable file
    /// both read as "no saved state" so the caller can simply start fresh.
    #[instrument]
    pub async fn load_from_file(path: &Path) -> Option<Self> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No saved state file");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Failed to read saved state, treating as absent");
                return None;
            }
        };
        match serde_json::from_str::<Self>(&contents) {
            Ok(machine) if machine.version == STATE_FORMAT_VERSION => {
                info!(stage = ?machine.current_stage, "Loaded saved installation state");
                Some(machine)
            }
            Ok(machine) => {
                warn!(
                    version = machine.version,
                    "Saved state has an unsupported format version, treating as absent"
                );
                None
            }
            Err(e) => {
                warn!(error = %e, "Failed to parse saved state, treating as absent");
                None
            }
        }
    }

    /// Validates that a loaded machine can serve a resume request.
    pub fn check_resumable(&self) -> Result<()> {
        if self.is_completed() {
            bail!("Saved installation already completed, nothing to resume");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn machine(installation_type: InstallationType) -> StageMachine {
        StageMachine::new(installation_type, "10.11.99.1", "secret", DeviceArch::Aarch64)
    }

    fn complete_stage(m: &mut StageMachine, stage: InstallStage) {
        let names: Vec<String> =
            m.steps_for(stage).unwrap().iter().map(|s| s.name.clone()).collect();
        for name in names {
            m.start_step(&name).unwrap();
            m.complete_step(&name).unwrap();
        }
    }

    #[test]
    fn complete_step_records_timestamps() {
        let mut m = machine(InstallationType::Full);
        m.start_step("device_setup").unwrap();
        m.complete_step("device_setup").unwrap();

        let step =
            m.current_steps().iter().find(|s| s.name == "device_setup").unwrap().clone();
        assert_eq!(step.status, StepStatus::Completed);
        assert!(step.finished_at.unwrap() >= step.started_at.unwrap());
    }

    #[test]
    fn stage1_steps_run_in_template_order() {
        let m = machine(InstallationType::Full);
        let names: Vec<&str> = m.current_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "device_setup",
                "device_detection",
                "backup_creation",
                "file_download",
                "xovi_installation",
                "extensions_installation",
                "shims_setup",
                "appload_configuration",
                "hashtable_rebuild",
            ]
        );
    }

    #[test]
    fn completing_all_steps_advances_exactly_once() {
        let mut m = machine(InstallationType::Full);
        complete_stage(&mut m, InstallStage::Stage1);
        assert_eq!(m.current_stage, InstallStage::Stage2);

        // Completing an already-completed step again must not re-trigger
        // advancement or disturb the current stage.
        m.complete_step("device_setup").unwrap();
        assert_eq!(m.current_stage, InstallStage::Stage2);

        complete_stage(&mut m, InstallStage::Stage2);
        assert_eq!(m.current_stage, InstallStage::Completed);
        assert!(m.is_completed());
    }

    #[test]
    fn launcher_only_advances_straight_to_completed() {
        let mut m = machine(InstallationType::LauncherOnly);
        assert_eq!(m.current_stage, InstallStage::LauncherOnly);
        let names: Vec<&str> = m.current_steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names.last(), Some(&"final_activation"));
        complete_stage(&mut m, InstallStage::LauncherOnly);
        assert!(m.is_completed());
    }

    #[test]
    fn skipped_steps_count_towards_advancement() {
        let mut m = machine(InstallationType::Stage1Only);
        m.skip_step("backup_creation", "disabled in configuration").unwrap();
        for name in [
            "device_setup",
            "device_detection",
            "file_download",
            "xovi_installation",
            "extensions_installation",
            "shims_setup",
            "appload_configuration",
            "hashtable_rebuild",
        ] {
            m.complete_step(name).unwrap();
        }
        assert!(m.is_completed());
    }

    #[test]
    fn fail_step_records_error_and_marks_failed() {
        let mut m = machine(InstallationType::Full);
        m.start_step("file_download").unwrap();
        m.fail_step("file_download", "checksum mismatch").unwrap();

        assert_eq!(m.current_stage, InstallStage::Failed);
        let step = m
            .steps_for(InstallStage::Stage1)
            .unwrap()
            .iter()
            .find(|s| s.name == "file_download")
            .unwrap();
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.error.as_deref(), Some("checksum mismatch"));
    }

    #[test]
    fn resume_resets_interrupted_steps() {
        let mut m = machine(InstallationType::Full);
        m.complete_step("device_setup").unwrap();
        m.start_step("device_detection").unwrap();
        m.fail_step("device_detection", "connection lost").unwrap();

        let stage = m.resume(None).unwrap();
        assert_eq!(stage, InstallStage::Stage1);
        let steps = m.current_steps();
        assert_eq!(steps[0].status, StepStatus::Completed);
        assert_eq!(steps[1].status, StepStatus::Pending);
        assert!(steps[1].error.is_none());
    }

    #[test]
    fn resume_rejects_foreign_stage() {
        let mut m = machine(InstallationType::LauncherOnly);
        assert!(m.resume(Some(InstallStage::Stage2)).is_err());
    }

    #[test]
    fn progress_is_derived_from_step_statuses() {
        let mut m = machine(InstallationType::Full);
        assert_eq!(m.progress_percentage(), 0.0);
        complete_stage(&mut m, InstallStage::Stage1);
        let expected = 9.0 / 13.0 * 100.0;
        assert!((m.progress_percentage() - expected).abs() < 0.01);
        complete_stage(&mut m, InstallStage::Stage2);
        assert_eq!(m.progress_percentage(), 100.0);
        assert_eq!(m.stage_progress_percentage(), 100.0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut m = machine(InstallationType::Full);
        m.complete_step("device_setup").unwrap();
        m.backup = Some(BackupRef {
            name: "backup_2025-01-02_03-04-05".into(),
            created_at: OffsetDateTime::now_utc(),
            device_ip: "10.11.99.1".into(),
            device_arch: DeviceArch::Aarch64,
            credential_captured: true,
        });
        m.save_to_file(&path).await.unwrap();

        let loaded = StageMachine::load_from_file(&path).await.expect("state should load");
        assert_eq!(loaded.current_stage, m.current_stage);
        assert_eq!(loaded.installation_type, m.installation_type);
        assert_eq!(loaded.ssh_password, "secret");
        assert_eq!(loaded.backup.as_ref().unwrap().name, "backup_2025-01-02_03-04-05");
        let statuses: Vec<StepStatus> =
            loaded.current_steps().iter().map(|s| s.status).collect();
        let expected: Vec<StepStatus> = m.current_steps().iter().map(|s| s.status).collect();
        assert_eq!(statuses, expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_from_missing_path_is_absent() {
        let dir = tempdir().unwrap();
        assert!(StageMachine::load_from_file(&dir.path().join("nope.json")).await.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn load_from_corrupt_file_is_absent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ this is not json").unwrap();
        assert!(StageMachine::load_from_file(&path).await.is_none());
    }

    #[test]
    fn password_is_not_in_debug_output() {
        let m = machine(InstallationType::Full);
        assert!(!format!("{m:?}").contains("secret"));
    }
}
