//! SSH session layer: single point of truth for device reachability and all
//! command/file I/O against it.

mod transfer;

use std::{
    error::Error,
    path::Path,
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Result, ensure};
use async_trait::async_trait;
use derive_more::Debug;
use russh::{
    Channel, ChannelMsg, Disconnect,
    client::{self, AuthResult, Handle, Msg},
};
use thiserror::Error as ThisError;
use tokio::{net::TcpStream, sync::Mutex, sync::mpsc::UnboundedSender};
use tracing::{debug, info, instrument, warn};

pub use transfer::upload_dir;

use crate::{models::TransferProgress, remote::sh_quote};

/// Failure taxonomy for session operations. The orchestrator branches on the
/// kind: network failures are worth retrying, the others are terminal.
#[derive(Debug, ThisError)]
pub enum SessionError {
    #[error("authentication failed for {user}@{host}")]
    Authentication { host: String, user: String },
    #[error("host key rejected for {host}: {reason}")]
    HostKey { host: String, reason: String },
    #[error("network error connecting to {host}:{port}: {reason}")]
    Network { host: String, port: u16, reason: String },
    #[error("ssh protocol error: {reason}")]
    Protocol { reason: String },
}

impl SessionError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }
}

/// Connection behavior knobs.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// Result of a remote command execution.
///
/// A connection failure is modeled as exit code `-1` with the reason in
/// `stderr`; callers never have to catch transport faults separately.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub(crate) fn connection_failure(
        command: &str,
        reason: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            command: command.to_string(),
            exit_code: -1,
            stdout: String::new(),
            stderr: reason.into(),
            duration,
        }
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// `None` runs the command with no artificial timeout; some remote
    /// operations (the hashtable rebuild) legitimately take many minutes.
    pub timeout: Option<Duration>,
    /// When set, each output line is forwarded as it arrives, in addition to
    /// being accumulated in the final result.
    pub output: Option<UnboundedSender<String>>,
}

impl ExecOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout: Some(timeout), output: None }
    }
}

/// Splits a remote output byte stream into lines for real-time forwarding,
/// carrying partial lines across chunk boundaries.
#[derive(Default)]
pub(crate) struct LineBuffer {
    carry: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, data: &[u8], sink: &UnboundedSender<String>) {
        self.carry.extend_from_slice(data);
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            let _ = sink.send(text.trim_end_matches('\r').to_string());
        }
    }

    pub(crate) fn flush(&mut self, sink: &UnboundedSender<String>) {
        if !self.carry.is_empty() {
            let text = String::from_utf8_lossy(&self.carry).to_string();
            let _ = sink.send(text);
            self.carry.clear();
        }
    }
}

/// Host key handler that accepts whatever identity the device presents.
///
/// The device regenerates its host key between reinstalls, so pinning a
/// previously seen identity would fail closed on exactly the devices this
/// tool targets.
struct AcceptingHandler;

impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Transport-agnostic view of the device used by the orchestrator and the
/// backup manager, so tests can substitute a scripted fake.
#[async_trait]
pub trait RemoteRunner: Send + Sync {
    /// Connects if not already connected. Fails with the typed taxonomy
    /// embedded in the error chain.
    async fn ensure_connected(&self) -> Result<()>;

    /// Executes a command. Transport failures surface as exit code `-1`.
    async fn execute(&self, command: &str, opts: ExecOptions) -> CommandOutput;

    /// Uploads a local file, creating remote parent directories as needed.
    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()>;

    /// Downloads a remote file, creating local parent directories as needed.
    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()>;

    /// Uploads an in-memory payload (rendered scripts, metadata documents).
    async fn upload_bytes(&self, bytes: &[u8], remote: &str) -> Result<()>;

    /// Executes a command and fails on non-zero exit, returning stdout.
    async fn execute_checked(&self, command: &str, timeout: Option<Duration>) -> Result<String> {
        let output = self.execute(command, ExecOptions { timeout, output: None }).await;
        ensure!(
            output.success(),
            "Command `{}` failed with exit code {}: {}",
            command,
            output.exit_code,
            if output.stderr.is_empty() { &output.stdout } else { &output.stderr }
        );
        Ok(output.stdout)
    }

    /// Returns true if `path` is a directory on the device. Transport errors
    /// read as "absent".
    async fn remote_dir_exists(&self, path: &str) -> bool {
        self.execute(
            &format!("test -d {}", sh_quote(path)),
            ExecOptions::with_timeout(Duration::from_secs(15)),
        )
        .await
        .success()
    }

    /// Returns true if `path` is a regular file on the device.
    async fn remote_file_exists(&self, path: &str) -> bool {
        self.execute(
            &format!("test -f {}", sh_quote(path)),
            ExecOptions::with_timeout(Duration::from_secs(15)),
        )
        .await
        .success()
    }
}

/// An authenticated SSH connection to the device.
#[derive(Debug)]
pub struct SshSession {
    host: String,
    port: u16,
    user: String,
    #[debug(skip)]
    password: String,
    options: ConnectOptions,
    #[debug(skip)]
    handle: Mutex<Option<Handle<AcceptingHandler>>>,
}

impl SshSession {
    /// The device exposes a single root account over SSH.
    pub const DEFAULT_USER: &'static str = "root";
    pub const DEFAULT_PORT: u16 = 22;

    pub fn new(
        host: impl Into<String>,
        password: impl Into<String>,
        port: u16,
        options: ConnectOptions,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: Self::DEFAULT_USER.to_string(),
            password: password.into(),
            options,
            handle: Mutex::new(None),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Connects and authenticates, retrying only network-level failures.
    /// Authentication and host-key failures are terminal and reported
    /// immediately with their distinct kinds.
    #[instrument(skip(self), fields(host = %self.host, port = self.port))]
    pub async fn connect(&self) -> Result<(), SessionError> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            debug!("Already connected");
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_connect().await {
                Ok(handle) => {
                    info!(attempt, "Connected and authenticated");
                    *guard = Some(handle);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < self.options.max_retries => {
                    warn!(
                        attempt,
                        error = &e as &dyn Error,
                        "Connection attempt failed, retrying"
                    );
                    tokio::time::sleep(self.options.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_connect(&self) -> Result<Handle<AcceptingHandler>, SessionError> {
        let socket = tokio::time::timeout(
            self.options.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| SessionError::Network {
            host: self.host.clone(),
            port: self.port,
            reason: "connection timed out".to_string(),
        })?
        .map_err(|e| SessionError::Network {
            host: self.host.clone(),
            port: self.port,
            reason: e.to_string(),
        })?;

        let config = Arc::new(client::Config {
            keepalive_interval: Some(Duration::from_secs(15)),
            ..Default::default()
        });
        let mut handle = client::connect_stream(config, socket, AcceptingHandler)
            .await
            .map_err(|e| self.classify_handshake_error(e))?;

        let auth = handle
            .authenticate_password(self.user.as_str(), self.password.as_str())
            .await
            .map_err(|e| SessionError::Protocol { reason: e.to_string() })?;
        match auth {
            AuthResult::Success => Ok(handle),
            AuthResult::Failure { .. } => Err(SessionError::Authentication {
                host: self.host.clone(),
                user: self.user.clone(),
            }),
        }
    }

    fn classify_handshake_error(&self, e: russh::Error) -> SessionError {
        let reason = e.to_string();
        if reason.to_ascii_lowercase().contains("key") {
            SessionError::HostKey { host: self.host.clone(), reason }
        } else {
            SessionError::Protocol { reason }
        }
    }

    /// Closes the connection. Idempotent.
    #[instrument(skip(self), fields(host = %self.host))]
    pub async fn disconnect(&self) {
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.take() {
            if let Err(e) = handle.disconnect(Disconnect::ByApplication, "", "en").await {
                debug!(error = &e as &dyn Error, "Disconnect message failed");
            }
            info!("Disconnected");
        }
    }

    /// Connect-if-needed, run a no-op command and verify the expected echo.
    /// Does not leave a persistent connection behind if none existed.
    #[instrument(skip(self), fields(host = %self.host), ret)]
    pub async fn test_connection(&self) -> bool {
        const SENTINEL: &str = "xovi-connection-check";
        let was_connected = self.handle.lock().await.is_some();
        if !was_connected && self.connect().await.is_err() {
            return false;
        }
        let output = self
            .execute_command(
                &format!("echo {SENTINEL}"),
                ExecOptions::with_timeout(Duration::from_secs(10)),
            )
            .await;
        let ok = output.success() && output.stdout.contains(SENTINEL);
        if !was_connected {
            self.disconnect().await;
        }
        ok
    }

    /// Executes a command on the device.
    #[instrument(skip(self, opts), fields(host = %self.host))]
    pub async fn execute_command(&self, command: &str, opts: ExecOptions) -> CommandOutput {
        let started = Instant::now();

        if let Err(e) = self.connect().await {
            return CommandOutput::connection_failure(
                command,
                format!("not connected: {e}"),
                started.elapsed(),
            );
        }

        let channel = {
            let mut guard = self.handle.lock().await;
            let Some(handle) = guard.as_mut() else {
                return CommandOutput::connection_failure(
                    command,
                    "connection closed",
                    started.elapsed(),
                );
            };
            match handle.channel_open_session().await {
                Ok(channel) => channel,
                Err(e) => {
                    // A channel-open failure means the transport is gone.
                    *guard = None;
                    return CommandOutput::connection_failure(
                        command,
                        format!("connection lost: {e}"),
                        started.elapsed(),
                    );
                }
            }
        };

        let run = run_channel(channel, command, opts.output.as_ref());
        let result = match opts.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command, timeout_secs = timeout.as_secs(), "Command timed out");
                    return CommandOutput::connection_failure(
                        command,
                        format!("command timed out after {}s", timeout.as_secs()),
                        started.elapsed(),
                    );
                }
            },
            None => run.await,
        };

        match result {
            Ok((exit_code, stdout, stderr)) => CommandOutput {
                command: command.to_string(),
                exit_code,
                stdout,
                stderr,
                duration: started.elapsed(),
            },
            Err(e) => {
                CommandOutput::connection_failure(
                    command,
                    format!("connection lost: {e}"),
                    started.elapsed(),
                )
            }
        }
    }

}

/// Drives a single exec channel to completion, accumulating output and
/// forwarding lines in real time.
async fn run_channel(
    mut channel: Channel<Msg>,
    command: &str,
    output: Option<&UnboundedSender<String>>,
) -> Result<(i32, String, String), russh::Error> {
    channel.exec(true, command).await?;

    let mut stdout: Vec<u8> = Vec::new();
    let mut stderr: Vec<u8> = Vec::new();
    let mut lines = LineBuffer::default();
    let mut exit_code: Option<i32> = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => {
                stdout.extend_from_slice(data);
                if let Some(sink) = output {
                    lines.push(data, sink);
                }
            }
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data);
                if let Some(sink) = output {
                    lines.push(data, sink);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                exit_code = Some(exit_status as i32);
            }
            _ => {}
        }
    }
    if let Some(sink) = output {
        lines.flush(sink);
    }

    let mut stderr = String::from_utf8_lossy(&stderr).into_owned();
    let exit_code = match exit_code {
        Some(code) => code,
        None => {
            if stderr.is_empty() {
                stderr = "channel closed before exit status was received".to_string();
            }
            -1
        }
    };
    Ok((exit_code, String::from_utf8_lossy(&stdout).into_owned(), stderr))
}

#[async_trait]
impl RemoteRunner for SshSession {
    async fn ensure_connected(&self) -> Result<()> {
        self.connect().await.map_err(Into::into)
    }

    async fn execute(&self, command: &str, opts: ExecOptions) -> CommandOutput {
        self.execute_command(command, opts).await
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()> {
        self.upload_file_impl(local, remote, progress).await
    }

    async fn download_file(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()> {
        self.download_file_impl(remote, local, progress).await
    }

    async fn upload_bytes(&self, bytes: &[u8], remote: &str) -> Result<()> {
        self.upload_bytes_impl(bytes, remote).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex as StdMutex;

    use super::*;

    struct Rule {
        needle: String,
        exit_code: i32,
        stdout: String,
        stderr: String,
    }

    /// Scripted [`RemoteRunner`] for tests: the first rule whose needle is a
    /// substring of the command wins; unmatched commands succeed silently.
    #[derive(Default)]
    pub(crate) struct ScriptedRunner {
        rules: Vec<Rule>,
        commands: StdMutex<Vec<String>>,
        uploads: StdMutex<Vec<String>>,
    }

    impl ScriptedRunner {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn rule(
            mut self,
            needle: &str,
            exit_code: i32,
            stdout: &str,
            stderr: &str,
        ) -> Self {
            self.rules.push(Rule {
                needle: needle.to_string(),
                exit_code,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            });
            self
        }

        pub(crate) fn executed(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }

        pub(crate) fn uploaded(&self) -> Vec<String> {
            self.uploads.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteRunner for ScriptedRunner {
        async fn ensure_connected(&self) -> Result<()> {
            Ok(())
        }

        async fn execute(&self, command: &str, opts: ExecOptions) -> CommandOutput {
            self.commands.lock().unwrap().push(command.to_string());
            for rule in &self.rules {
                if command.contains(&rule.needle) {
                    if let Some(sink) = &opts.output {
                        for line in rule.stdout.lines() {
                            let _ = sink.send(line.to_string());
                        }
                    }
                    return CommandOutput {
                        command: command.to_string(),
                        exit_code: rule.exit_code,
                        stdout: rule.stdout.clone(),
                        stderr: rule.stderr.clone(),
                        duration: Duration::from_millis(1),
                    };
                }
            }
            CommandOutput {
                command: command.to_string(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                duration: Duration::from_millis(1),
            }
        }

        async fn upload_file(
            &self,
            _local: &Path,
            remote: &str,
            _progress: Option<UnboundedSender<TransferProgress>>,
        ) -> Result<()> {
            self.uploads.lock().unwrap().push(remote.to_string());
            Ok(())
        }

        async fn download_file(
            &self,
            _remote: &str,
            local: &Path,
            _progress: Option<UnboundedSender<TransferProgress>>,
        ) -> Result<()> {
            tokio::fs::write(local, b"fake archive").await?;
            Ok(())
        }

        async fn upload_bytes(&self, _bytes: &[u8], remote: &str) -> Result<()> {
            self.uploads.lock().unwrap().push(remote.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn command_output_success_is_exit_code_zero() {
        let ok = CommandOutput {
            command: "true".into(),
            exit_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::from_millis(1),
        };
        assert!(ok.success());

        let lost = CommandOutput::connection_failure("true", "connection lost", ok.duration);
        assert_eq!(lost.exit_code, -1);
        assert!(!lost.success());
        assert_eq!(lost.stderr, "connection lost");
    }

    #[test]
    fn retryable_kinds() {
        let network = SessionError::Network {
            host: "10.11.99.1".into(),
            port: 22,
            reason: "refused".into(),
        };
        let auth =
            SessionError::Authentication { host: "10.11.99.1".into(), user: "root".into() };
        assert!(network.is_retryable());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn line_buffer_carries_partial_lines_across_chunks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut buffer = LineBuffer::default();

        buffer.push(b"first li", &tx);
        assert!(rx.try_recv().is_err());

        buffer.push(b"ne\r\nsecond\npartial", &tx);
        assert_eq!(rx.try_recv().unwrap(), "first line");
        assert_eq!(rx.try_recv().unwrap(), "second");
        assert!(rx.try_recv().is_err());

        buffer.flush(&tx);
        assert_eq!(rx.try_recv().unwrap(), "partial");
    }

    #[test]
    fn password_is_not_in_debug_output() {
        let session = SshSession::new(
            "10.11.99.1",
            "hunter2",
            SshSession::DEFAULT_PORT,
            ConnectOptions::default(),
        );
        let debug = format!("{session:?}");
        assert!(!debug.contains("hunter2"));
    }
}
