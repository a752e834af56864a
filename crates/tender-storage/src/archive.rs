//! Immutable, hash-addressed archive of raw upstream pages.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArchivedPage {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub byte_size: usize,
    /// An identical page was already archived for the same day and operation.
    pub already_present: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseArchive {
    root: PathBuf,
}

impl ResponseArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn content_hash(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    /// `{YYYYMMDD}/{operation}/{sha256}.json`
    pub fn page_path(fetched_at: DateTime<Utc>, operation: &str, content_hash: &str) -> PathBuf {
        let operation = operation.trim();
        let operation = if operation.is_empty() { "unknown" } else { operation };
        PathBuf::from(fetched_at.format("%Y%m%d").to_string())
            .join(operation)
            .join(format!("{content_hash}.json"))
    }

    pub async fn store_page(
        &self,
        fetched_at: DateTime<Utc>,
        operation: &str,
        body: &[u8],
    ) -> anyhow::Result<ArchivedPage> {
        let content_hash = Self::content_hash(body);
        let relative_path = Self::page_path(fetched_at, operation, &content_hash);
        let target = self.root.join(&relative_path);
        let already_present = write_once(&target, body).await?;

        Ok(ArchivedPage {
            content_hash,
            relative_path,
            byte_size: body.len(),
            already_present,
        })
    }
}

/// Write `bytes` to `target` through a temp file + rename. Returns `true`
/// when the target already existed and nothing was written.
async fn write_once(target: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let parent = target
        .parent()
        .with_context(|| format!("archive path {} has no parent", target.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating archive directory {}", parent.display()))?;

    if fs::try_exists(target)
        .await
        .with_context(|| format!("checking archive path {}", target.display()))?
    {
        return Ok(true);
    }

    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(false),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            if fs::try_exists(target).await.unwrap_or(false) {
                return Ok(true);
            }
            Err(err).with_context(|| format!("renaming into {}", target.display()))
        }
    }
}
