//! Top-level installation driver: sequences the concrete stages, updates the
//! stage machine after every step, persists it immediately, and emits
//! progress events.

pub mod signatures;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use derive_more::Debug;
use humansize::{DECIMAL, format_size};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{Instrument, Span, error, info, instrument, warn};

use crate::{
    artifacts::{ArtifactStore, DownloadRequest},
    backup::{BackupManager, BackupOptions},
    config::{ComponentKind, InstallerConfig},
    models::{DeviceArch, InstallProgress},
    remote::{self, sh_quote},
    scripts,
    session::{ExecOptions, RemoteRunner, upload_dir},
    stage::{InstallStage, InstallationType, StageMachine},
};

const STEP_TIMEOUT: Duration = Duration::from_secs(60);
const UNPACK_TIMEOUT: Duration = Duration::from_secs(600);
/// Restarts of the UI service either return quickly or hang while the
/// connection dies under us; the ceiling turns the hang into the expected
/// timeout signature.
const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(90);

/// Resolved connection details for the target device. How they were obtained
/// (CLI flags, environment, a GUI form) is the caller's business.
#[derive(Debug, Clone)]
pub struct DeviceTarget {
    pub ip: String,
    #[debug(skip)]
    pub password: String,
    pub arch: DeviceArch,
}

enum StepOutcome {
    Completed,
    Skipped(String),
}

/// Drives a full installation run. Exactly one orchestrator exists per run,
/// and all stage-machine mutation goes through it so the
/// persist-after-every-step invariant holds.
pub struct InstallOrchestrator {
    runner: Arc<dyn RemoteRunner>,
    artifacts: Arc<ArtifactStore>,
    backups: BackupManager,
    config: InstallerConfig,
    progress: Option<UnboundedSender<InstallProgress>>,
    output: Option<UnboundedSender<String>>,
    current_operation: Option<String>,
    last_state: Option<StageMachine>,
}

impl InstallOrchestrator {
    pub fn new(
        runner: Arc<dyn RemoteRunner>,
        artifacts: Arc<ArtifactStore>,
        backups: BackupManager,
        config: InstallerConfig,
    ) -> Self {
        Self {
            runner,
            artifacts,
            backups,
            config,
            progress: None,
            output: None,
            current_operation: None,
            last_state: None,
        }
    }

    /// Sink for summarized progress events.
    pub fn with_progress_sender(mut self, sender: UnboundedSender<InstallProgress>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Sink for verbatim remote command output. Separate from progress: this
    /// is a raw stream for log display, not derived state.
    pub fn with_output_sender(mut self, sender: UnboundedSender<String>) -> Self {
        self.output = Some(sender);
        self
    }

    /// Human-readable name of the operation currently running.
    pub fn current_operation(&self) -> Option<&str> {
        self.current_operation.as_deref()
    }

    /// Stage machine state after the last run, successful or not.
    pub fn state(&self) -> Option<&StageMachine> {
        self.last_state.as_ref()
    }

    /// Runs an installation of the given type, optionally resuming a
    /// previously interrupted run from `resume_from`.
    ///
    /// On failure the persisted state file keeps the failed step recorded so
    /// a later resume retries from the correct point. On success the state
    /// file is removed; there is nothing left to resume.
    #[instrument(skip(self, device), fields(ip = %device.ip), err)]
    pub async fn start_installation(
        &mut self,
        installation_type: InstallationType,
        device: &DeviceTarget,
        resume_from: Option<InstallStage>,
    ) -> Result<()> {
        let state_path = self.config.state_file.clone();

        let mut machine = if let Some(resume_stage) = resume_from {
            let mut loaded = StageMachine::load_from_file(&state_path)
                .await
                .context("No saved installation state to resume")?;
            loaded.check_resumable()?;
            ensure!(
                loaded.installation_type == installation_type,
                "Saved state belongs to a {:?} installation, not {:?}",
                loaded.installation_type,
                installation_type
            );
            loaded.resume(Some(resume_stage))?;
            loaded
        } else {
            StageMachine::new(installation_type, &device.ip, &device.password, device.arch)
        };

        info!(?installation_type, resume = ?resume_from, "Starting installation");
        self.runner
            .ensure_connected()
            .await
            .context("Failed to establish a device connection")?;

        machine.save_to_file(&state_path).await?;

        let sequence = installation_type.stage_sequence();
        let start_pos =
            sequence.iter().position(|&s| s == machine.current_stage).unwrap_or(0);
        let stages: Vec<InstallStage> = sequence[start_pos..].to_vec();

        let result = self.run_stages(&stages, &mut machine, &state_path).await;
        self.current_operation = None;

        match result {
            Ok(()) => {
                self.emit(&machine, None, "Installation complete");
                if let Err(e) = tokio::fs::remove_file(&state_path).await
                    && e.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(error = %e, "Failed to remove completed state file");
                }
                info!("Installation completed successfully");
                self.last_state = Some(machine);
                Ok(())
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "Installation failed");
                self.last_state = Some(machine);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &mut self,
        stages: &[InstallStage],
        machine: &mut StageMachine,
        state_path: &Path,
    ) -> Result<()> {
        for &stage in stages {
            machine.enter_stage(stage)?;
            machine.save_to_file(state_path).await?;
            self.emit(machine, None, format!("Starting {stage:?}"));

            let step_names: Vec<String> = machine
                .steps_for(stage)
                .unwrap_or(&[])
                .iter()
                .filter(|step| !step.status.is_done())
                .map(|step| step.name.clone())
                .collect();
            for name in step_names {
                self.run_persisted_step(stage, &name, machine, state_path).await?;
            }
        }
        Ok(())
    }

    /// Runs one step and persists the machine after every mutation, so a
    /// killed process can never leave a step recorded as complete that did
    /// not actually finish.
    async fn run_persisted_step(
        &mut self,
        stage: InstallStage,
        name: &str,
        machine: &mut StageMachine,
        state_path: &Path,
    ) -> Result<()> {
        let description = machine
            .steps_for(stage)
            .and_then(|steps| steps.iter().find(|step| step.name == name))
            .map(|step| step.description.clone())
            .unwrap_or_default();
        self.current_operation = Some(description.clone());

        machine.start_step(name)?;
        machine.save_to_file(state_path).await?;
        self.emit_at(stage, machine, Some(name), description);

        match self.run_step(stage, name, machine).await {
            Ok(StepOutcome::Completed) => machine.complete_step(name)?,
            Ok(StepOutcome::Skipped(reason)) => machine.skip_step(name, &reason)?,
            Err(e) => {
                machine.fail_step(name, &format!("{e:#}"))?;
                machine.save_to_file(state_path).await?;
                self.emit_at(stage, machine, Some(name), format!("Step {name} failed: {e:#}"));
                return Err(e.context(format!("Step {name} failed in stage {stage:?}")));
            }
        }
        machine.save_to_file(state_path).await?;
        self.emit_at(stage, machine, Some(name), format!("Finished {name}"));
        Ok(())
    }

    async fn run_step(
        &mut self,
        stage: InstallStage,
        name: &str,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        match name {
            "device_setup" => self.step_device_setup().await,
            "device_detection" => self.step_device_detection(machine).await,
            "backup_creation" => self.step_backup_creation(machine).await,
            "file_download" => self.step_file_download(stage, machine).await,
            "xovi_installation" => self.step_xovi_installation(machine).await,
            "extensions_installation" => self.step_extensions_installation(machine).await,
            "shims_setup" => self.step_shims_setup(machine).await,
            "appload_configuration" => self.step_appload_configuration(machine).await,
            "hashtable_rebuild" => self.step_hashtable_rebuild(stage, machine).await,
            "koreader_download" => self.step_koreader_download(stage, machine).await,
            "koreader_installation" => self.step_koreader_installation(stage, machine).await,
            "archive_cleanup" => self.step_archive_cleanup().await,
            "final_activation" => self.step_final_activation(stage, machine).await,
            other => bail!("Unknown step: {other}"),
        }
    }

    async fn step_device_setup(&mut self) -> Result<StepOutcome> {
        let echo = self
            .runner
            .execute_checked("echo xovi-installer-ready", Some(STEP_TIMEOUT))
            .await
            .context("Device did not answer the readiness check")?;
        ensure!(echo.contains("xovi-installer-ready"), "Unexpected echo response: {echo}");

        self.runner
            .execute_checked(&format!("mkdir -p {}", sh_quote(remote::STAGING_DIR)), Some(STEP_TIMEOUT))
            .await?;
        // A previously installed tripletap helper could restart the UI in
        // the middle of the installation.
        let _ = self
            .runner
            .execute(
                &format!("systemctl stop {} 2>/dev/null || true", remote::TRIPLETAP_UNIT),
                ExecOptions::with_timeout(STEP_TIMEOUT),
            )
            .await;
        Ok(StepOutcome::Completed)
    }

    async fn step_device_detection(&mut self, machine: &mut StageMachine) -> Result<StepOutcome> {
        let uname = self.runner.execute_checked("uname -m", Some(STEP_TIMEOUT)).await?;
        let detected = DeviceArch::from_uname(&uname)
            .with_context(|| format!("Unsupported device architecture: {}", uname.trim()))?;
        ensure!(
            detected == machine.device_arch,
            "Device reports {detected} but this installation was prepared for {}",
            machine.device_arch
        );

        let release = self
            .runner
            .execute("cat /etc/os-release", ExecOptions::with_timeout(STEP_TIMEOUT))
            .await;
        if release.success()
            && let Some(line) = release.stdout.lines().find(|l| l.starts_with("PRETTY_NAME="))
        {
            info!(firmware = line.trim_start_matches("PRETTY_NAME="), "Detected device firmware");
        }
        Ok(StepOutcome::Completed)
    }

    async fn step_backup_creation(&mut self, machine: &mut StageMachine) -> Result<StepOutcome> {
        if !self.config.backup_before_install {
            return Ok(StepOutcome::Skipped("disabled in configuration".to_string()));
        }
        let options = BackupOptions {
            name: None,
            include_local_copy: self.config.keep_local_backup_copy,
        };
        let snapshot =
            self.backups.create_backup(&options).await.context("Backup creation failed")?;
        machine.backup = Some(snapshot.as_ref_entry());
        Ok(StepOutcome::Completed)
    }

    async fn step_file_download(
        &mut self,
        stage: InstallStage,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        for kind in [
            ComponentKind::XoviBinary,
            ComponentKind::ExtensionsBundle,
            ComponentKind::AppLoadBundle,
        ] {
            let path = self
                .download_component(stage, machine, kind, "file_download")
                .await?;
            if kind != ComponentKind::XoviBinary {
                self.artifacts
                    .extract_archive(&path, self.artifacts.downloads_dir())
                    .await
                    .with_context(|| format!("Failed to extract {}", path.display()))?;
            }
        }
        Ok(StepOutcome::Completed)
    }

    async fn step_xovi_installation(&mut self, machine: &mut StageMachine) -> Result<StepOutcome> {
        let local = self.downloaded_file(machine.device_arch, ComponentKind::XoviBinary)?;
        self.runner
            .execute_checked(&format!("mkdir -p {}", sh_quote(remote::EXTENSIONS_DIR)), Some(STEP_TIMEOUT))
            .await?;
        self.runner
            .upload_file(&local, remote::XOVI_BINARY, None)
            .await
            .context("Failed to upload the framework binary")?;
        self.runner
            .execute_checked(&format!("chmod 755 {}", sh_quote(remote::XOVI_BINARY)), Some(STEP_TIMEOUT))
            .await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_extensions_installation(
        &mut self,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        let bundle_dir =
            self.extracted_bundle_dir(machine.device_arch, ComponentKind::ExtensionsBundle)?;
        // Bundles ship extensions under `extensions/`; older ones are flat.
        let extensions_dir = bundle_dir.join("extensions");
        let source = if extensions_dir.is_dir() { extensions_dir } else { bundle_dir };
        let uploaded = upload_dir(self.runner.as_ref(), &source, remote::EXTENSIONS_DIR).await?;
        ensure!(uploaded > 0, "Extension bundle {} contained no files", source.display());
        Ok(StepOutcome::Completed)
    }

    async fn step_shims_setup(&mut self, machine: &mut StageMachine) -> Result<StepOutcome> {
        let bundle_dir =
            self.extracted_bundle_dir(machine.device_arch, ComponentKind::ExtensionsBundle)?;
        let shims_dir = bundle_dir.join("shims");
        if !shims_dir.is_dir() {
            return Ok(StepOutcome::Skipped("bundle provides no shims".to_string()));
        }
        upload_dir(self.runner.as_ref(), &shims_dir, remote::SHIMS_DIR).await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_appload_configuration(
        &mut self,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        let bundle_dir =
            self.extracted_bundle_dir(machine.device_arch, ComponentKind::AppLoadBundle)?;
        upload_dir(self.runner.as_ref(), &bundle_dir, remote::EXTENSIONS_DIR).await?;
        self.runner
            .execute_checked(&format!("mkdir -p {}", sh_quote(remote::APPLOAD_DIR)), Some(STEP_TIMEOUT))
            .await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_hashtable_rebuild(
        &mut self,
        stage: InstallStage,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        let script = scripts::render_hashtable_rebuild_script();
        let script_path = format!("{}/rebuild-hashtable.sh", remote::XOVI_HOME);
        self.runner.upload_bytes(script.as_bytes(), &script_path).await?;
        self.runner
            .execute_checked(&format!("chmod +x {}", sh_quote(&script_path)), Some(STEP_TIMEOUT))
            .await?;

        self.emit_at(
            stage,
            machine,
            Some("hashtable_rebuild"),
            "Rebuilding the resource hashtable (this can take several minutes)",
        );
        // Deliberately no timeout: the rebuild legitimately runs for many
        // minutes, with its streamed output serving as the heartbeat.
        let result = self
            .runner
            .execute(
                &format!("sh {}", sh_quote(&script_path)),
                ExecOptions { timeout: None, output: self.output.clone() },
            )
            .await;
        ensure!(
            result.success(),
            "Hashtable rebuild failed with exit code {}: {}",
            result.exit_code,
            if result.stderr.is_empty() { &result.stdout } else { &result.stderr }
        );
        ensure!(
            result.stdout.contains(scripts::HASHTABLE_REBUILT_MARKER),
            "Hashtable rebuild finished without its completion marker"
        );

        // Bring the UI back up. The restart may drop the connection.
        let restart = self
            .runner
            .execute(
                remote::RESTART_UI_COMMAND,
                ExecOptions { timeout: Some(ACTIVATION_TIMEOUT), output: self.output.clone() },
            )
            .await;
        if !restart.success() {
            if signatures::is_expected_disconnect(&restart) {
                warn!(
                    exit_code = restart.exit_code,
                    "UI restart dropped the connection, continuing"
                );
            } else {
                bail!(
                    "UI restart failed with exit code {}: {}",
                    restart.exit_code,
                    restart.stderr
                );
            }
        }
        Ok(StepOutcome::Completed)
    }

    async fn step_koreader_download(
        &mut self,
        stage: InstallStage,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        self.download_component(stage, machine, ComponentKind::KoreaderBundle, "koreader_download")
            .await?;
        Ok(StepOutcome::Completed)
    }

    async fn step_koreader_installation(
        &mut self,
        stage: InstallStage,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        let local = self.downloaded_file(machine.device_arch, ComponentKind::KoreaderBundle)?;
        let filename = local
            .file_name()
            .and_then(|n| n.to_str())
            .context("KOReader archive has no usable file name")?;
        let remote_archive = format!("{}/{filename}", remote::STAGING_DIR);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut upload = Box::pin(self.runner.upload_file(&local, &remote_archive, Some(tx)));
        loop {
            tokio::select! {
                result = &mut upload => {
                    result.context("Failed to upload the KOReader archive")?;
                    break;
                }
                Some(progress) = rx.recv() => {
                    self.emit_at(stage, machine, Some("koreader_installation"), format!(
                        "Uploading KOReader - {} of {}",
                        format_size(progress.bytes_transferred, DECIMAL),
                        format_size(progress.total_bytes, DECIMAL),
                    ));
                }
            }
        }

        self.runner
            .execute_checked(&format!("mkdir -p {}", sh_quote(remote::APPLOAD_DIR)), Some(STEP_TIMEOUT))
            .await?;
        self.runner
            .execute_checked(
                &format!(
                    "unzip -o {} -d {}",
                    sh_quote(&remote_archive),
                    sh_quote(remote::APPLOAD_DIR)
                ),
                Some(UNPACK_TIMEOUT),
            )
            .await
            .context("Failed to unpack KOReader on the device")?;
        Ok(StepOutcome::Completed)
    }

    async fn step_archive_cleanup(&mut self) -> Result<StepOutcome> {
        self.runner
            .execute_checked(&format!("rm -rf {}", sh_quote(remote::STAGING_DIR)), Some(STEP_TIMEOUT))
            .await
            .context("Failed to remove uploaded archives")?;
        Ok(StepOutcome::Completed)
    }

    async fn step_final_activation(
        &mut self,
        stage: InstallStage,
        machine: &mut StageMachine,
    ) -> Result<StepOutcome> {
        let script = scripts::render_start_script();
        self.runner.upload_bytes(script.as_bytes(), remote::START_SCRIPT).await?;
        self.runner
            .execute_checked(&format!("chmod +x {}", sh_quote(remote::START_SCRIPT)), Some(STEP_TIMEOUT))
            .await?;

        self.emit_at(
            stage,
            machine,
            Some("final_activation"),
            "Activating the framework (the device UI will restart)",
        );
        let result = self
            .runner
            .execute(
                &format!("sh {}", sh_quote(remote::START_SCRIPT)),
                ExecOptions { timeout: Some(ACTIVATION_TIMEOUT), output: self.output.clone() },
            )
            .await;
        if result.success() {
            info!("Activation restart reported success");
            return Ok(StepOutcome::Completed);
        }
        if signatures::is_expected_disconnect(&result) {
            warn!(
                exit_code = result.exit_code,
                stderr = %result.stderr,
                "Activation dropped the connection; this is the expected signature"
            );
            return Ok(StepOutcome::Completed);
        }
        bail!(
            "Activation failed with exit code {}: {}",
            result.exit_code,
            if result.stderr.is_empty() { result.stdout } else { result.stderr }
        );
    }

    /// Downloads one component, forwarding byte progress as installer
    /// progress messages.
    async fn download_component(
        &self,
        stage: InstallStage,
        machine: &StageMachine,
        kind: ComponentKind,
        step_name: &str,
    ) -> Result<PathBuf> {
        let source = self.config.component(machine.device_arch, kind)?.clone();
        let request = DownloadRequest {
            url: source.url,
            filename: source.filename,
            expected_sha256: source.sha256,
        };
        let dest = self.artifacts.local_path(&request);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let artifacts = self.artifacts.clone();
        let request_task = request.clone();
        let mut task = tokio::spawn(
            async move { artifacts.download(&request_task, Some(tx), None).await }
                .instrument(Span::current()),
        );

        let percent = machine.progress_percentage();
        loop {
            tokio::select! {
                result = &mut task => {
                    result.context("Download task failed")??;
                    break;
                }
                Some(progress) = rx.recv() => {
                    let message = match progress.total_bytes {
                        Some(total) if total > 0 => format!(
                            "Downloading {} ({:.1}%) - {} of {}",
                            progress.filename,
                            progress.bytes as f32 / total as f32 * 100.0,
                            format_size(progress.bytes, DECIMAL),
                            format_size(total, DECIMAL),
                        ),
                        _ => format!(
                            "Downloading {} - {}",
                            progress.filename,
                            format_size(progress.bytes, DECIMAL),
                        ),
                    };
                    self.emit_raw(stage, percent, Some(step_name), message);
                }
            }
        }
        Ok(dest)
    }

    /// Deterministic location of a downloaded component, so a resumed run
    /// finds files fetched by an earlier invocation.
    fn downloaded_file(&self, arch: DeviceArch, kind: ComponentKind) -> Result<PathBuf> {
        let source = self.config.component(arch, kind)?;
        let path = self.artifacts.downloads_dir().join(&source.filename);
        ensure!(
            path.is_file(),
            "{} has not been downloaded (expected at {})",
            source.filename,
            path.display()
        );
        Ok(path)
    }

    /// Deterministic location of an extracted bundle.
    fn extracted_bundle_dir(&self, arch: DeviceArch, kind: ComponentKind) -> Result<PathBuf> {
        let source = self.config.component(arch, kind)?;
        let stem = Path::new(&source.filename)
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Bundle filename has no usable stem")?;
        let dir = self.artifacts.downloads_dir().join(stem);
        ensure!(
            dir.is_dir(),
            "Bundle {} has not been extracted (expected at {})",
            source.filename,
            dir.display()
        );
        Ok(dir)
    }

    fn emit(&self, machine: &StageMachine, step: Option<&str>, message: impl Into<String>) {
        self.emit_raw(machine.current_stage, machine.progress_percentage(), step, message);
    }

    fn emit_at(
        &self,
        stage: InstallStage,
        machine: &StageMachine,
        step: Option<&str>,
        message: impl Into<String>,
    ) {
        self.emit_raw(stage, machine.progress_percentage(), step, message);
    }

    fn emit_raw(
        &self,
        stage: InstallStage,
        percent: f32,
        step: Option<&str>,
        message: impl Into<String>,
    ) {
        if let Some(sink) = &self.progress {
            let _ = sink.send(InstallProgress {
                stage,
                percent,
                message: message.into(),
                step: step.map(String::from),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::{TempDir, tempdir};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::{config::ComponentSource, session::testing::ScriptedRunner, stage::StepStatus};

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        for (name, data) in entries {
            writer.start_file(*name, zip::write::SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn source(server: &MockServer, route: &str, filename: &str) -> ComponentSource {
        ComponentSource {
            url: format!("{}{route}", server.uri()),
            filename: filename.to_string(),
            sha256: None,
        }
    }

    fn test_config(dir: &TempDir, server: &MockServer) -> InstallerConfig {
        let mut config = InstallerConfig::default();
        config.downloads_dir = dir.path().join("downloads");
        config.state_file = dir.path().join("state.json");
        config.local_backups_dir = dir.path().join("backups");
        config.logs_dir = dir.path().join("logs");
        let arch = config.components.get_mut(&DeviceArch::Aarch64).unwrap();
        arch.xovi_binary = source(server, "/xovi-aarch64.so", "xovi-aarch64.so");
        arch.extensions_bundle = source(server, "/extensions.zip", "extensions-aarch64.zip");
        arch.appload_bundle = source(server, "/appload.zip", "appload-aarch64.zip");
        arch.koreader_bundle = source(server, "/koreader.zip", "koreader-remarkable.zip");
        config
    }

    async fn mount(server: &MockServer, route: &str, body: Vec<u8>) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(server)
            .await;
    }

    async fn mount_all_bundles(server: &MockServer) {
        mount(server, "/xovi-aarch64.so", b"framework".to_vec()).await;
        mount(
            server,
            "/extensions.zip",
            zip_bytes(&[("extensions/qmd.so", b"q"), ("shims/libshim.so", b"s")]),
        )
        .await;
        mount(server, "/appload.zip", zip_bytes(&[("appload.so", b"a"), ("appload.qmd", b"m")]))
            .await;
        mount(server, "/koreader.zip", zip_bytes(&[("koreader/reader.lua", b"k")])).await;
    }

    fn device() -> DeviceTarget {
        DeviceTarget {
            ip: "10.11.99.1".into(),
            password: "secret".into(),
            arch: DeviceArch::Aarch64,
        }
    }

    fn orchestrator(
        runner: ScriptedRunner,
        config: InstallerConfig,
    ) -> (InstallOrchestrator, Arc<ScriptedRunner>) {
        let runner = Arc::new(runner);
        let artifacts = Arc::new(ArtifactStore::new(&config.downloads_dir).unwrap());
        let backups = BackupManager::new(
            runner.clone(),
            &config.local_backups_dir,
            "10.11.99.1",
            DeviceArch::Aarch64,
            config.backups_keep_count,
        );
        let orchestrator =
            InstallOrchestrator::new(runner.clone(), artifacts, backups, config);
        (orchestrator, runner)
    }

    /// Rules shared by the happy-path tests: a fresh device that answers
    /// detection, has nothing installed yet, and drops the connection on the
    /// activation restart (the expected signature).
    fn fresh_device_rules() -> ScriptedRunner {
        ScriptedRunner::new()
            .rule("uname -m", 0, "aarch64\n", "")
            .rule("echo xovi-installer-ready", 0, "xovi-installer-ready\n", "")
            .rule("test -d", 1, "", "")
            .rule("du -sk", 0, "8\t/home/root/xovi-backups/x", "")
            .rule("ls -1", 2, "", "ls: no such file or directory")
            .rule(
                "sh '/home/root/xovi/rebuild-hashtable.sh'",
                0,
                "hashtable rebuild finished\n",
                "",
            )
            .rule("sh '/home/root/xovi/start'", -1, "", "command timed out after 90s")
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fresh_full_installation_completes_every_step() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        mount_all_bundles(&server).await;
        let config = test_config(&dir, &server);
        let state_path = config.state_file.clone();
        let (orchestrator, runner) = orchestrator(fresh_device_rules(), config);
        let mut orchestrator = orchestrator;

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        orchestrator = orchestrator.with_progress_sender(progress_tx);

        orchestrator
            .start_installation(InstallationType::Full, &device(), None)
            .await
            .expect("fresh installation should succeed");

        let machine = orchestrator.state().unwrap();
        assert!(machine.is_completed());
        assert!(machine.backup.is_some());
        for entry in machine.stages() {
            for step in &entry.steps {
                assert_eq!(step.status, StepStatus::Completed, "step {}", step.name);
            }
        }

        // A completed run leaves nothing to resume.
        assert!(!state_path.exists());

        let uploads = runner.uploaded();
        assert!(uploads.contains(&remote::XOVI_BINARY.to_string()));
        assert!(uploads.iter().any(|u| u.ends_with("exthome/qmd.so")));
        assert!(uploads.iter().any(|u| u.starts_with(remote::SHIMS_DIR)));
        assert!(uploads.iter().any(|u| u.ends_with("restore.sh")));
        assert!(uploads.contains(&remote::START_SCRIPT.to_string()));

        let executed = runner.executed();
        assert!(executed.iter().any(|c| c.starts_with("unzip -o")));
        assert!(executed.iter().any(|c| c.contains("rm -rf") && c.contains(".xovi-staging")));

        let mut last_message = String::new();
        while let Ok(event) = progress_rx.try_recv() {
            last_message = event.message;
        }
        assert_eq!(last_message, "Installation complete");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn resume_from_stage_two_does_not_rerun_stage_one() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        // Only the KOReader bundle is served; a stage-1 download would fail.
        mount(&server, "/koreader.zip", zip_bytes(&[("koreader/reader.lua", b"k")])).await;
        let config = test_config(&dir, &server);
        let state_path = config.state_file.clone();

        // Persisted state from an earlier run: stage 1 fully complete.
        let mut machine =
            StageMachine::new(InstallationType::Full, "10.11.99.1", "secret", DeviceArch::Aarch64);
        let stage1_steps: Vec<String> = machine
            .steps_for(InstallStage::Stage1)
            .unwrap()
            .iter()
            .map(|s| s.name.clone())
            .collect();
        for name in stage1_steps {
            machine.complete_step(&name).unwrap();
        }
        assert_eq!(machine.current_stage, InstallStage::Stage2);
        machine.save_to_file(&state_path).await.unwrap();

        let runner = ScriptedRunner::new().rule(
            "sh '/home/root/xovi/start'",
            -1,
            "",
            "Connection closed by remote host",
        );
        let (mut orchestrator, runner) = orchestrator(runner, config);

        orchestrator
            .start_installation(InstallationType::Full, &device(), Some(InstallStage::Stage2))
            .await
            .expect("resume should succeed");

        assert!(orchestrator.state().unwrap().is_completed());
        assert!(!state_path.exists());

        // No stage-1 work was repeated: no backup, no detection, no
        // framework upload.
        let executed = runner.executed();
        assert!(!executed.iter().any(|c| c.contains("xovi-backups")));
        assert!(!executed.iter().any(|c| c.contains("uname -m")));
        assert!(!runner.uploaded().contains(&remote::XOVI_BINARY.to_string()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_step_is_recorded_for_diagnosis_and_resume() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        mount(&server, "/koreader.zip", zip_bytes(&[("koreader/reader.lua", b"k")])).await;
        let config = test_config(&dir, &server);
        let state_path = config.state_file.clone();

        let runner =
            ScriptedRunner::new().rule("unzip -o", 127, "", "sh: unzip: not found");
        let (mut orchestrator, _) = orchestrator(runner, config);

        let err = orchestrator
            .start_installation(InstallationType::Stage2Only, &device(), None)
            .await
            .expect_err("unpack failure must fail the run");
        assert!(format!("{err:#}").contains("koreader_installation"));

        let loaded = StageMachine::load_from_file(&state_path)
            .await
            .expect("state must survive for resume");
        assert_eq!(loaded.current_stage, InstallStage::Failed);
        assert_eq!(loaded.first_unfinished_stage(), Some(InstallStage::Stage2));
        let step = loaded
            .steps_for(InstallStage::Stage2)
            .unwrap()
            .iter()
            .find(|s| s.name == "koreader_installation")
            .unwrap()
            .clone();
        assert_eq!(step.status, StepStatus::Failed);
        assert!(step.error.as_deref().unwrap_or_default().contains("unzip"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn architecture_mismatch_stops_before_any_mutation() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        let config = test_config(&dir, &server);

        let runner = ScriptedRunner::new()
            .rule("uname -m", 0, "armv7l\n", "")
            .rule("echo xovi-installer-ready", 0, "xovi-installer-ready\n", "");
        let (mut orchestrator, runner) = orchestrator(runner, config);

        let err = orchestrator
            .start_installation(InstallationType::Stage1Only, &device(), None)
            .await
            .expect_err("mismatched architecture must abort");
        assert!(format!("{err:#}").contains("prepared for"));

        // The run stopped before any backup or upload happened.
        assert!(runner.uploaded().is_empty());
        assert!(!runner.executed().iter().any(|c| c.contains("xovi-backups")));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn launcher_only_runs_activation_without_koreader() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        mount_all_bundles(&server).await;
        let config = test_config(&dir, &server);
        let (mut orchestrator, runner) = orchestrator(fresh_device_rules(), config);

        orchestrator
            .start_installation(InstallationType::LauncherOnly, &device(), None)
            .await
            .expect("launcher-only installation should succeed");

        assert!(orchestrator.state().unwrap().is_completed());
        let executed = runner.executed();
        assert!(executed.iter().any(|c| c.contains("sh '/home/root/xovi/start'")));
        assert!(!executed.iter().any(|c| c.starts_with("unzip -o")));
    }
}
