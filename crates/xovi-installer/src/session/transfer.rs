use std::{path::Path, time::Duration};

use anyhow::{Context, Result, ensure};
use russh_sftp::client::SftpSession;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc::UnboundedSender,
};
use tracing::{debug, instrument};

use super::{RemoteRunner, SshSession};
use crate::{models::TransferProgress, remote::sh_quote};

/// Chunk size for SFTP transfers; progress is reported once per chunk, which
/// is a cadence suitable for a progress bar without flooding the channel.
const TRANSFER_CHUNK: usize = 64 * 1024;

const MKDIR_TIMEOUT: Duration = Duration::from_secs(30);

fn remote_parent(remote: &str) -> Option<&str> {
    remote.rsplit_once('/').map(|(parent, _)| parent).filter(|p| !p.is_empty())
}

impl SshSession {
    /// Opens a fresh SFTP subsystem channel on the existing connection.
    async fn open_sftp(&self) -> Result<SftpSession> {
        let mut channel = {
            let mut guard = self.handle.lock().await;
            let handle = guard.as_mut().context("not connected")?;
            handle.channel_open_session().await.context("Failed to open SFTP channel")?
        };
        channel
            .request_subsystem(true, "sftp")
            .await
            .context("Failed to request SFTP subsystem")?;
        SftpSession::new(channel.into_stream()).await.context("Failed to start SFTP session")
    }

    async fn ensure_remote_parent(&self, remote: &str) -> Result<()> {
        if let Some(parent) = remote_parent(remote) {
            self.execute_checked(&format!("mkdir -p {}", sh_quote(parent)), Some(MKDIR_TIMEOUT))
                .await
                .with_context(|| format!("Failed to create remote directory {parent}"))?;
        }
        Ok(())
    }

    #[instrument(skip(self, progress), fields(local = %local.display()), err)]
    pub(super) async fn upload_file_impl(
        &self,
        local: &Path,
        remote: &str,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()> {
        ensure!(local.is_file(), "Path does not exist or is not a file: {}", local.display());
        self.connect().await?;
        self.ensure_remote_parent(remote).await?;

        let total_bytes = tokio::fs::metadata(local)
            .await
            .with_context(|| format!("Failed to stat {}", local.display()))?
            .len();
        let sftp = self.open_sftp().await?;
        let mut source = File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;
        let mut dest = sftp
            .create(remote)
            .await
            .with_context(|| format!("Failed to create remote file {remote}"))?;

        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut bytes_transferred = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n]).await.context("Failed to write remote file data")?;
            bytes_transferred += n as u64;
            if let Some(sink) = &progress {
                let _ = sink.send(TransferProgress { bytes_transferred, total_bytes });
            }
        }
        dest.shutdown().await.context("Failed to finalize remote file")?;
        let _ = sftp.close().await;
        debug!(bytes = bytes_transferred, "Upload finished");
        Ok(())
    }

    #[instrument(skip(self, progress), fields(local = %local.display()), err)]
    pub(super) async fn download_file_impl(
        &self,
        remote: &str,
        local: &Path,
        progress: Option<UnboundedSender<TransferProgress>>,
    ) -> Result<()> {
        self.connect().await?;
        if let Some(parent) = local.parent()
            && !parent.exists()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let sftp = self.open_sftp().await?;
        let total_bytes = sftp
            .metadata(remote)
            .await
            .with_context(|| format!("Failed to stat remote file {remote}"))?
            .size
            .unwrap_or(0);
        let mut source = sftp
            .open(remote)
            .await
            .with_context(|| format!("Failed to open remote file {remote}"))?;
        let mut dest = File::create(local)
            .await
            .with_context(|| format!("Failed to create {}", local.display()))?;

        let mut buf = vec![0u8; TRANSFER_CHUNK];
        let mut bytes_transferred = 0u64;
        loop {
            let n = source.read(&mut buf).await.context("Failed to read remote file data")?;
            if n == 0 {
                break;
            }
            dest.write_all(&buf[..n]).await?;
            bytes_transferred += n as u64;
            if let Some(sink) = &progress {
                let _ = sink.send(TransferProgress { bytes_transferred, total_bytes });
            }
        }
        dest.flush().await?;
        let _ = sftp.close().await;
        debug!(bytes = bytes_transferred, "Download finished");
        Ok(())
    }

    #[instrument(skip(self, bytes), fields(len = bytes.len()), err)]
    pub(super) async fn upload_bytes_impl(&self, bytes: &[u8], remote: &str) -> Result<()> {
        self.connect().await?;
        self.ensure_remote_parent(remote).await?;

        let sftp = self.open_sftp().await?;
        let mut dest = sftp
            .create(remote)
            .await
            .with_context(|| format!("Failed to create remote file {remote}"))?;
        dest.write_all(bytes).await.context("Failed to write remote file data")?;
        dest.shutdown().await.context("Failed to finalize remote file")?;
        let _ = sftp.close().await;
        Ok(())
    }
}

/// Uploads a local directory tree file by file. Returns the number of files
/// uploaded.
#[instrument(skip(runner, local_dir), fields(local = %local_dir.display()), err)]
pub async fn upload_dir(
    runner: &dyn RemoteRunner,
    local_dir: &Path,
    remote_dir: &str,
) -> Result<usize> {
    ensure!(
        local_dir.is_dir(),
        "Source path does not exist or is not a directory: {}",
        local_dir.display()
    );
    runner
        .execute_checked(&format!("mkdir -p {}", sh_quote(remote_dir)), Some(MKDIR_TIMEOUT))
        .await?;

    let mut uploaded = 0;
    let mut stack = vec![(local_dir.to_path_buf(), remote_dir.to_string())];
    while let Some((dir, remote)) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("Failed to read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_str().context("File name is not valid UTF-8")?;
            let remote_path = format!("{remote}/{name}");
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                stack.push((entry.path(), remote_path));
            } else if file_type.is_file() {
                runner.upload_file(&entry.path(), &remote_path, None).await?;
                uploaded += 1;
            }
        }
    }
    debug!(files = uploaded, "Directory upload finished");
    Ok(uploaded)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::session::testing::ScriptedRunner;

    #[test]
    fn remote_parent_handles_root_and_nested_paths() {
        assert_eq!(remote_parent("/home/root/xovi/xovi.so"), Some("/home/root/xovi"));
        assert_eq!(remote_parent("/file"), None);
        assert_eq!(remote_parent("relative"), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn upload_dir_walks_nested_tree() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("a.so"), b"a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub").join("b.qmd"), b"b").unwrap();

        let runner = ScriptedRunner::new();
        let uploaded = upload_dir(&runner, dir.path(), "/home/root/xovi/exthome").await.unwrap();

        assert_eq!(uploaded, 2);
        let uploads = runner.uploaded();
        assert!(uploads.contains(&"/home/root/xovi/exthome/a.so".to_string()));
        assert!(uploads.contains(&"/home/root/xovi/exthome/sub/b.qmd".to_string()));
        assert!(runner.executed().iter().any(|c| c.contains("mkdir -p '/home/root/xovi/exthome'")));
    }
}
