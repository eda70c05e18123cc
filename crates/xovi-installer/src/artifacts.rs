//! Local artifact management: downloads installer packages with retry and
//! checksum verification, extracts archives, and tracks scratch files.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt, sync::Mutex, sync::mpsc::UnboundedSender};
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::models::DownloadProgress;

const USER_AGENT: &str = concat!("xovi-installer/", env!("CARGO_PKG_VERSION"));

/// Status of a download. Transitions are monotonic: a terminal status is
/// never followed by `Downloading` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// A single download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub filename: String,
    /// Hex-encoded SHA-256 of the expected contents. When set, a mismatch
    /// deletes the file and fails the download.
    pub expected_sha256: Option<String>,
}

/// Record of a completed (or failed) download.
#[derive(Debug, Clone)]
pub struct DownloadArtifact {
    pub url: String,
    pub path: PathBuf,
    pub total_bytes: Option<u64>,
    pub bytes_downloaded: u64,
    pub status: DownloadStatus,
    pub started_at: OffsetDateTime,
    pub finished_at: Option<OffsetDateTime>,
}

/// Manages the local download/extraction/temp-file lifecycle.
pub struct ArtifactStore {
    downloads_dir: PathBuf,
    client: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
    temp_paths: Mutex<Vec<PathBuf>>,
}

impl ArtifactStore {
    pub fn new(downloads_dir: impl Into<PathBuf>) -> Result<Self> {
        let downloads_dir = downloads_dir.into();
        std::fs::create_dir_all(&downloads_dir)
            .with_context(|| format!("Failed to create {}", downloads_dir.display()))?;
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            downloads_dir,
            client,
            max_retries: 3,
            retry_delay: Duration::from_secs(3),
            temp_paths: Mutex::new(Vec::new()),
        })
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    /// Local path a request will be downloaded to. Deterministic so resumed
    /// runs can locate files downloaded by an earlier invocation.
    pub fn local_path(&self, request: &DownloadRequest) -> PathBuf {
        self.downloads_dir.join(&request.filename)
    }

    /// Downloads a file, retrying network errors with a fixed backoff.
    ///
    /// The body streams into a `.part` file which is renamed into place only
    /// after the (optional) checksum verifies, so a file at the destination
    /// path is always complete and verified.
    #[instrument(skip(self, progress, cancel), fields(url = %request.url), err)]
    pub async fn download(
        &self,
        request: &DownloadRequest,
        progress: Option<UnboundedSender<DownloadProgress>>,
        cancel: Option<CancellationToken>,
    ) -> Result<DownloadArtifact> {
        let dest = self.local_path(request);
        let part = dest.with_extension("part");
        let started_at = OffsetDateTime::now_utc();

        let mut attempt = 0;
        let artifact = loop {
            attempt += 1;
            match self.download_once(request, &part, progress.as_ref(), cancel.as_ref()).await {
                Ok((bytes, total)) => {
                    break DownloadArtifact {
                        url: request.url.clone(),
                        path: dest.clone(),
                        total_bytes: total,
                        bytes_downloaded: bytes,
                        status: DownloadStatus::Downloading,
                        started_at,
                        finished_at: None,
                    };
                }
                Err(e) => {
                    let _ = fs::remove_file(&part).await;
                    if cancel.as_ref().is_some_and(|token| token.is_cancelled()) {
                        warn!("Download cancelled");
                        return Err(e.context("download cancelled"));
                    }
                    if attempt < self.max_retries {
                        warn!(
                            attempt,
                            error = %format!("{e:#}"),
                            "Download attempt failed, retrying"
                        );
                        tokio::time::sleep(self.retry_delay).await;
                    } else {
                        return Err(e.context(format!(
                            "Download failed after {} attempts: {}",
                            self.max_retries, request.url
                        )));
                    }
                }
            }
        };

        if let Some(expected) = &request.expected_sha256 {
            let actual = sha256_file(&part).await?;
            if !actual.eq_ignore_ascii_case(expected) {
                let _ = fs::remove_file(&part).await;
                bail!(
                    "Checksum mismatch for {}: expected {}, got {}",
                    request.filename,
                    expected,
                    actual
                );
            }
            debug!(sha256 = %actual, "Checksum verified");
        }

        fs::rename(&part, &dest)
            .await
            .with_context(|| format!("Failed to move download into place at {}", dest.display()))?;

        info!(
            path = %dest.display(),
            bytes = artifact.bytes_downloaded,
            "Download completed"
        );
        Ok(DownloadArtifact {
            status: DownloadStatus::Completed,
            finished_at: Some(OffsetDateTime::now_utc()),
            ..artifact
        })
    }

    async fn download_once(
        &self,
        request: &DownloadRequest,
        part: &Path,
        progress: Option<&UnboundedSender<DownloadProgress>>,
        cancel: Option<&CancellationToken>,
    ) -> Result<(u64, Option<u64>)> {
        let response = self
            .client
            .get(&request.url)
            .send()
            .await
            .context("Request failed")?
            .error_for_status()
            .context("Server returned an error status")?;
        let total_bytes = response.content_length();

        let mut file = fs::File::create(part)
            .await
            .with_context(|| format!("Failed to create {}", part.display()))?;
        let mut downloaded = 0u64;
        let mut stream = response.bytes_stream();
        loop {
            let item = if let Some(token) = cancel {
                tokio::select! {
                    item = stream.next() => item,
                    _ = token.cancelled() => bail!("cancelled"),
                }
            } else {
                stream.next().await
            };
            let Some(item) = item else { break };
            let chunk = item.context("Failed to read response body")?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if let Some(sink) = progress {
                let _ = sink.send(DownloadProgress {
                    filename: request.filename.clone(),
                    bytes: downloaded,
                    total_bytes,
                });
            }
        }
        file.flush().await?;
        Ok((downloaded, total_bytes))
    }

    /// Extracts a zip archive into `dest_root/<archive stem>`, removing any
    /// pre-existing directory with that name first so a lingering tree from a
    /// failed attempt can never mix with the new contents.
    #[instrument(skip(self), fields(archive = %archive.display()), err)]
    pub async fn extract_archive(&self, archive: &Path, dest_root: &Path) -> Result<PathBuf> {
        let extension = archive.extension().and_then(|e| e.to_str()).unwrap_or_default();
        ensure!(
            extension.eq_ignore_ascii_case("zip"),
            "Unsupported archive format: {}",
            archive.display()
        );
        let stem = archive
            .file_stem()
            .and_then(|s| s.to_str())
            .context("Archive has no usable file stem")?;
        let dest = dest_root.join(stem);

        if dest.exists() {
            debug!(path = %dest.display(), "Removing stale extraction directory");
            fs::remove_dir_all(&dest)
                .await
                .with_context(|| format!("Failed to remove {}", dest.display()))?;
        }
        fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let archive = archive.to_path_buf();
        let dest_clone = dest.clone();
        tokio::task::spawn_blocking(move || unzip_into(&archive, &dest_clone))
            .await
            .context("Extraction task failed")??;

        info!(path = %dest.display(), "Archive extracted");
        Ok(dest)
    }

    /// Creates a tracked temp file inside the downloads directory.
    pub async fn create_temp_file(&self) -> Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("xovi-")
            .tempfile_in(&self.downloads_dir)
            .context("Failed to create temp file")?;
        let (_, path) = file.keep().context("Failed to persist temp file")?;
        self.temp_paths.lock().await.push(path.clone());
        Ok(path)
    }

    /// Creates a tracked temp directory inside the downloads directory.
    pub async fn create_temp_dir(&self) -> Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix("xovi-")
            .tempdir_in(&self.downloads_dir)
            .context("Failed to create temp directory")?;
        let path = dir.keep();
        self.temp_paths.lock().await.push(path.clone());
        Ok(path)
    }

    /// Removes every tracked temp path. Safe to call multiple times.
    #[instrument(skip(self))]
    pub async fn cleanup_all(&self) {
        let paths: Vec<PathBuf> = self.temp_paths.lock().await.drain(..).collect();
        for path in paths {
            let result = if path.is_dir() {
                fs::remove_dir_all(&path).await
            } else {
                fs::remove_file(&path).await
            };
            match result {
                Ok(()) => debug!(path = %path.display(), "Removed temp path"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp path"),
            }
        }
    }
}

fn unzip_into(zip_path: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)
        .with_context(|| format!("Failed to open {}", zip_path.display()))?;
    let mut zip = zip::ZipArchive::new(file).context("Invalid ZIP archive")?;
    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let outpath = dest.join(entry.mangled_name());
        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)
                .with_context(|| format!("Failed creating directory {}", outpath.display()))?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = std::fs::File::create(&outpath)
                .with_context(|| format!("Failed creating file {}", outpath.display()))?;
            std::io::copy(&mut entry, &mut outfile)
                .with_context(|| format!("Failed extracting {}", outpath.display()))?;
        }
    }
    Ok(())
}

async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher).context("Failed to hash file")?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .context("Hashing task failed")?
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use tempfile::tempdir;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;

    fn request(url: String, filename: &str, sha256: Option<&str>) -> DownloadRequest {
        DownloadRequest {
            url,
            filename: filename.to_string(),
            expected_sha256: sha256.map(|s| s.to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn download_reports_progress_and_completes() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xovi.so"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"framework".to_vec()))
            .mount(&server)
            .await;

        let store = ArtifactStore::new(dir.path()).unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let artifact = store
            .download(
                &request(format!("{}/xovi.so", server.uri()), "xovi.so", None),
                Some(tx),
                None,
            )
            .await
            .expect("download should succeed");

        assert_eq!(artifact.status, DownloadStatus::Completed);
        assert_eq!(artifact.bytes_downloaded, 9);
        assert!(artifact.finished_at.is_some());
        assert_eq!(std::fs::read(&artifact.path).unwrap(), b"framework");

        let update = rx.recv().await.expect("at least one progress update");
        assert_eq!(update.filename, "xovi.so");
        assert!(update.bytes > 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn checksum_mismatch_leaves_no_file_behind() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ext.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"not what you want".to_vec()))
            .mount(&server)
            .await;

        let store = ArtifactStore::new(dir.path()).unwrap();
        let bad = "0".repeat(64);
        let err = store
            .download(
                &request(format!("{}/ext.zip", server.uri()), "ext.zip", Some(&bad)),
                None,
                None,
            )
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("Checksum mismatch"));
        assert!(!dir.path().join("ext.zip").exists());
        assert!(!dir.path().join("ext.part").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn matching_checksum_is_accepted() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        let body = b"payload".to_vec();
        let sha = hex::encode(Sha256::digest(&body));
        Mock::given(method("GET"))
            .and(path("/appload.zip"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;

        let store = ArtifactStore::new(dir.path()).unwrap();
        let artifact = store
            .download(
                &request(format!("{}/appload.zip", server.uri()), "appload.zip", Some(&sha)),
                None,
                None,
            )
            .await
            .expect("verified download should succeed");
        assert_eq!(artifact.status, DownloadStatus::Completed);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn server_errors_are_retried() {
        let dir = tempdir().unwrap();
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky.bin"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/flaky.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let mut store = ArtifactStore::new(dir.path()).unwrap();
        store.retry_delay = Duration::from_millis(10);
        let artifact = store
            .download(&request(format!("{}/flaky.bin", server.uri()), "flaky.bin", None), None, None)
            .await
            .expect("second attempt should succeed");
        assert_eq!(artifact.bytes_downloaded, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extraction_replaces_stale_directory() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();

        let archive_path = dir.path().join("bundle.zip");
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("extensions/appload.so", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"ext").unwrap();
        writer.finish().unwrap();

        // A leftover tree from a previous failed attempt.
        let stale = dir.path().join("bundle").join("stale");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("junk.so"), b"junk").unwrap();

        let extracted = store.extract_archive(&archive_path, dir.path()).await.unwrap();
        assert_eq!(extracted, dir.path().join("bundle"));
        assert!(extracted.join("extensions").join("appload.so").exists());
        assert!(!extracted.join("stale").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unsupported_archive_format_fails_immediately() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let archive = dir.path().join("bundle.tar.gz");
        std::fs::write(&archive, b"not a zip").unwrap();
        let err = store.extract_archive(&archive, dir.path()).await.unwrap_err();
        assert!(format!("{err:#}").contains("Unsupported archive format"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_all_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path()).unwrap();
        let file = store.create_temp_file().await.unwrap();
        let temp_dir = store.create_temp_dir().await.unwrap();
        assert!(file.exists());
        assert!(temp_dir.exists());

        store.cleanup_all().await;
        assert!(!file.exists());
        assert!(!temp_dir.exists());

        // Second call has nothing left to do and must not fail.
        store.cleanup_all().await;
    }
}
