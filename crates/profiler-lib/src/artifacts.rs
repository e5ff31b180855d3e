//! Persisted profile artifacts
//!
//! Layout: `{dest_root}/{kind}/{host_name}-{timestamp}.pb.gz`. Written by
//! captures, listed for the dashboard, removed by the retention sweep.

use crate::models::ProfileKind;
use chrono::{DateTime, Local, Utc};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tracing::{debug, warn};

/// Suffix of every persisted artifact
pub const ARTIFACT_SUFFIX: &str = ".pb.gz";

/// Timestamp embedded in artifact file names
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Artifacts older than this are removed by the retention sweep
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// A persisted artifact as shown in listings
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Artifact {
    /// File name, e.g. `api-0:8080-2024-05-01_10:00:00.pb.gz`
    pub name: String,
    /// Profile kind directory the artifact lives in
    pub kind: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub modified: DateTime<Utc>,
}

/// Path prefix for captures of `kind` from `host_name`
pub fn artifact_prefix(dest_root: &Path, kind: ProfileKind, host_name: &str) -> PathBuf {
    dest_root.join(kind.as_str()).join(host_name)
}

/// Output file for a capture started at `at`
pub fn artifact_output_path(prefix: &Path, at: DateTime<Local>) -> PathBuf {
    let mut path = prefix.as_os_str().to_owned();
    path.push(format!("-{}{}", at.format(TIMESTAMP_FORMAT), ARTIFACT_SUFFIX));
    PathBuf::from(path)
}

/// Resolve an artifact name from a request to its path
///
/// Returns `None` for names that are not plain artifact file names.
pub fn resolve_artifact(dest_root: &Path, kind: ProfileKind, name: &str) -> Option<PathBuf> {
    let plain = !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.starts_with('.');
    (plain && name.ends_with(ARTIFACT_SUFFIX)).then(|| dest_root.join(kind.as_str()).join(name))
}

/// Every `*/*.pb.gz` file below `dest_root`
///
/// Only a failure to read `dest_root` itself is an error; unreadable
/// subdirectories are logged and skipped.
async fn artifact_files(dest_root: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut kinds = match fs::read_dir(dest_root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };

    while let Some(kind_dir) = kinds.next_entry().await? {
        let dir = kind_dir.path();
        match fs::metadata(&dir).await {
            Ok(metadata) if metadata.is_dir() => {}
            Ok(_) => continue,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to stat artifact directory");
                continue;
            }
        }
        if let Err(e) = collect_artifacts(&dir, &mut files).await {
            warn!(dir = %dir.display(), error = %e, "Failed to read artifact directory");
        }
    }
    Ok(files)
}

async fn collect_artifacts(dir: &Path, files: &mut Vec<PathBuf>) -> io::Result<()> {
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let is_artifact = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(ARTIFACT_SUFFIX));
        if is_artifact {
            files.push(entry.path());
        }
    }
    Ok(())
}

/// List persisted artifacts, newest first
pub async fn list_artifacts(dest_root: &Path) -> io::Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();
    for path in artifact_files(dest_root).await? {
        let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat artifact");
                continue;
            }
        };

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = path
            .parent()
            .and_then(Path::file_name)
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        artifacts.push(Artifact {
            name,
            kind,
            path,
            modified: modified.into(),
        });
    }

    artifacts.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(artifacts)
}

/// Delete artifacts last modified strictly before `now - retention`
///
/// An artifact exactly at the boundary is kept. Stat and delete errors are
/// logged and skipped. Returns the number of deleted files.
pub async fn sweep_expired(dest_root: &Path, retention: Duration, now: SystemTime) -> usize {
    let Some(cutoff) = now.checked_sub(retention) else {
        return 0;
    };

    let files = match artifact_files(dest_root).await {
        Ok(files) => files,
        Err(e) => {
            warn!(dest = %dest_root.display(), error = %e, "Failed to enumerate artifacts");
            return 0;
        }
    };

    let mut deleted = 0;
    for path in files {
        let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to stat artifact");
                continue;
            }
        };
        if modified >= cutoff {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = %path.display(), "Deleted expired artifact");
                deleted += 1;
            }
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to delete artifact"),
        }
    }
    deleted
}
