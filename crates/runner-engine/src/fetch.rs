use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use runner_common::{Result, RunnerError};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// What a completed download looks like on disk: a verified docker-save
/// archive plus the image reference parsed out of its manifest.
#[derive(Debug, Clone)]
pub struct FetchedArchive {
    pub size_bytes: u64,
    pub repo_tag: String,
}

/// Downloads an agent image archive to a local path. The production
/// implementation goes over HTTP; tests substitute their own.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: String, dest: PathBuf, deadline: Duration) -> Result<FetchedArchive>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ImageFetcher for HttpFetcher {
    async fn fetch(&self, url: String, dest: PathBuf, deadline: Duration) -> Result<FetchedArchive> {
        debug!(%url, "downloading agent image");
        let mut response = self
            .client
            .get(&url)
            .timeout(deadline)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RunnerError::deadline("image_resolve")
                } else {
                    RunnerError::ImageResolve(format!("download of {url} failed: {e}"))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::ImageResolve(format!(
                "download of {url} failed: HTTP {status}"
            )));
        }

        let mut file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| RunnerError::ImageResolve(format!("creating {}: {e}", dest.display())))?;
        let mut size_bytes: u64 = 0;
        loop {
            let chunk = response.chunk().await.map_err(|e| {
                if e.is_timeout() {
                    RunnerError::deadline("image_resolve")
                } else {
                    RunnerError::ImageResolve(format!("download of {url} failed: {e}"))
                }
            })?;
            let Some(chunk) = chunk else { break };
            size_bytes += chunk.len() as u64;
            file.write_all(&chunk)
                .await
                .map_err(|e| RunnerError::ImageResolve(format!("writing archive: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| RunnerError::ImageResolve(format!("writing archive: {e}")))?;
        drop(file);

        let verify_path = dest.clone();
        let repo_tag = tokio::task::spawn_blocking(move || verify_archive(&verify_path))
            .await
            .map_err(|e| RunnerError::Internal(format!("archive verification task: {e}")))??;

        info!(%url, size_bytes, %repo_tag, "image archive downloaded");
        Ok(FetchedArchive {
            size_bytes,
            repo_tag,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "RepoTags")]
    repo_tags: Option<Vec<String>>,
}

/// Checks that `path` is a docker-save archive (optionally gzipped) and
/// returns the image reference its manifest names. Anything else is a
/// resolve failure; the caller discards the file.
pub fn verify_archive(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| RunnerError::ImageResolve(format!("opening archive: {e}")))?;

    let mut magic = [0u8; 2];
    let gzipped = match file.read(&mut magic) {
        Ok(n) if n == 2 => magic == [0x1f, 0x8b],
        Ok(_) => return Err(RunnerError::ImageResolve("archive is empty".to_string())),
        Err(e) => return Err(RunnerError::ImageResolve(format!("reading archive: {e}"))),
    };

    let file = File::open(path)
        .map_err(|e| RunnerError::ImageResolve(format!("opening archive: {e}")))?;
    let manifest = if gzipped {
        read_manifest(tar::Archive::new(GzDecoder::new(file)))
    } else {
        read_manifest(tar::Archive::new(file))
    }?;

    let tag = manifest
        .into_iter()
        .flat_map(|entry| entry.repo_tags.unwrap_or_default())
        .next()
        .ok_or_else(|| {
            RunnerError::ImageResolve("archive manifest has no RepoTags".to_string())
        })?;
    Ok(tag)
}

fn read_manifest<R: Read>(mut archive: tar::Archive<R>) -> Result<Vec<ManifestEntry>> {
    let entries = archive
        .entries()
        .map_err(|e| RunnerError::ImageResolve(format!("not a tar archive: {e}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| RunnerError::ImageResolve(format!("corrupt tar archive: {e}")))?;
        let is_manifest = entry
            .path()
            .map(|p| p == Path::new("manifest.json"))
            .unwrap_or(false);
        if !is_manifest {
            continue;
        }
        let mut raw = String::new();
        entry
            .read_to_string(&mut raw)
            .map_err(|e| RunnerError::ImageResolve(format!("reading manifest.json: {e}")))?;
        return serde_json::from_str(&raw)
            .map_err(|e| RunnerError::ImageResolve(format!("parsing manifest.json: {e}")));
    }
    Err(RunnerError::ImageResolve(
        "archive has no manifest.json".to_string(),
    ))
}
