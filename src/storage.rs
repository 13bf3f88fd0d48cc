//! Artifact storage routing.
//!
//! [`StorageRouter`] maps a logical artifact (a finished report, a long-term
//! memory record) to exactly one file:
//!
//! ```text
//! root_for(category) / sanitize(logical_id) . extension_for(format)
//! ```
//!
//! Roots are absolute paths fixed at construction; nothing is resolved
//! against the process working directory at call time.
//!
//! Writes are atomic. Content is staged in a temporary file in the target
//! directory, flushed, then renamed over the final path, so readers see the
//! old or the new complete content and never a partial file. Writes to the
//! same path are additionally serialized in-process. All filesystem work
//! runs on tokio's blocking pool, never on a request-handling thread.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::telemetry;
use crate::{Result, TollgateError};

/// Maximum length of a sanitized logical id.
const MAX_ID_LEN: usize = 128;

/// Hex digits of the id digest appended to truncated ids.
const DIGEST_SUFFIX_LEN: usize = 8;

/// Artifact category; each has its own root directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Report,
    Memory,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Report => "report",
            Category::Memory => "memory",
        }
    }
}

/// Artifact format; determines the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Markdown,
    Json,
    Html,
}

impl Format {
    pub const ALL: [Format; 3] = [Format::Markdown, Format::Json, Format::Html];

    pub fn extension(&self) -> &'static str {
        match self {
            Format::Markdown => "md",
            Format::Json => "json",
            Format::Html => "html",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.extension() == ext)
    }
}

/// Metadata for a persisted artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageRecord {
    /// Sanitized logical id.
    pub logical_id: String,
    pub category: Category,
    pub format: Format,
    pub physical_path: PathBuf,
    pub written_at: DateTime<Utc>,
    pub bytes: usize,
}

/// Content read back from storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub format: Format,
    pub content: String,
}

/// Default long-term memory files, created only when absent.
const DEFAULT_MEMORIES: &[(&str, &str)] = &[
    (
        "user_preferences",
        "# User Preferences\n\nThis file stores user preferences and search history.\n\n\
         ## Search Preferences\n- Default location: None\n- Property types: None\n\
         - Price range: None\n- Bedrooms: None\n- Bathrooms: None\n\n## Preferences History\n",
    ),
    (
        "property_history",
        "# Property History\n\nThis file tracks previously viewed and analyzed properties.\n\n\
         ## Properties Analyzed\n",
    ),
    (
        "market_knowledge",
        "# Market Knowledge\n\nThis file stores learned market insights and trends.\n\n\
         ## Market Insights\n",
    ),
];

/// Routes artifacts to per-category roots and writes them atomically.
pub struct StorageRouter {
    reports_dir: PathBuf,
    memories_dir: PathBuf,
    write_locks: DashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>,
}

impl StorageRouter {
    /// Create a router over two absolute root directories.
    ///
    /// Performs no I/O; directories are created on first write.
    pub fn new(reports_dir: impl Into<PathBuf>, memories_dir: impl Into<PathBuf>) -> Result<Self> {
        let reports_dir = reports_dir.into();
        let memories_dir = memories_dir.into();
        for (name, dir) in [("reports", &reports_dir), ("memories", &memories_dir)] {
            if !dir.is_absolute() {
                return Err(TollgateError::Configuration(format!(
                    "{name} directory must be an absolute path, got {dir:?}"
                )));
            }
        }
        Ok(Self {
            reports_dir,
            memories_dir,
            write_locks: DashMap::new(),
        })
    }

    pub fn root_for(&self, category: Category) -> &Path {
        match category {
            Category::Report => &self.reports_dir,
            Category::Memory => &self.memories_dir,
        }
    }

    /// Physical path for an artifact. Pure; no filesystem access.
    pub fn path_for(&self, category: Category, logical_id: &str, format: Format) -> Result<PathBuf> {
        let id = sanitize(logical_id)?;
        Ok(file_for(&self.root_for(category).join(id), format))
    }

    /// Atomically write an artifact, replacing any previous content.
    ///
    /// A logical id has one file per category: copies of the same id in
    /// other formats are removed once the new file is in place.
    pub async fn persist(
        &self,
        category: Category,
        logical_id: &str,
        format: Format,
        content: impl Into<String>,
    ) -> Result<StorageRecord> {
        let id = sanitize(logical_id)?;
        let stem = self.root_for(category).join(&id);
        let path = file_for(&stem, format);
        let content = content.into();
        let bytes = content.len();

        let lock = self
            .write_locks
            .entry(stem.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let guard = lock.lock().await;

        let (target, target_stem) = (path.clone(), stem.clone());
        let written = tokio::task::spawn_blocking(move || {
            atomic_write(&target, content.as_bytes())?;
            remove_other_formats(&target_stem, format)
        })
        .await
        .map_err(|e| TollgateError::Storage(format!("write task failed: {e}")))
        .and_then(|r| r);

        drop(guard);
        drop(lock);
        self.write_locks
            .remove_if(&stem, |_, l| Arc::strong_count(l) == 1);

        let status = if written.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::STORAGE_WRITES_TOTAL,
            "category" => category.as_str(),
            "status" => status,
        )
        .increment(1);
        written?;

        debug!(category = category.as_str(), id = %id, bytes, path = ?path, "artifact persisted");
        Ok(StorageRecord {
            logical_id: id,
            category,
            format,
            physical_path: path,
            written_at: Utc::now(),
            bytes,
        })
    }

    /// Read an artifact in a specific format.
    pub async fn fetch_as(
        &self,
        category: Category,
        logical_id: &str,
        format: Format,
    ) -> Result<String> {
        let path = self.path_for(category, logical_id, format)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TollgateError::NotFound(
                format!("{}/{logical_id}", category.as_str()),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Read an artifact in whichever format it was last stored.
    pub async fn fetch(&self, category: Category, logical_id: &str) -> Result<StoredArtifact> {
        for format in Format::ALL {
            match self.fetch_as(category, logical_id, format).await {
                Ok(content) => return Ok(StoredArtifact { format, content }),
                Err(TollgateError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TollgateError::NotFound(format!(
            "{}/{logical_id}",
            category.as_str()
        )))
    }

    /// Logical ids stored under a category, sorted.
    pub async fn list(&self, category: Category) -> Result<Vec<String>> {
        let mut dir = match tokio::fs::read_dir(self.root_for(category)).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let (Some(stem), Some(ext)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.extension().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            // staged temp files start with '.'
            if stem.starts_with('.') || Format::from_extension(ext).is_none() {
                continue;
            }
            ids.push(stem.to_owned());
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Create the default memory files that do not exist yet.
    ///
    /// Existing files are left untouched. Returns records for created files.
    pub async fn seed_memories(&self) -> Result<Vec<StorageRecord>> {
        let mut created = Vec::new();
        for (id, content) in DEFAULT_MEMORIES {
            let path = self.path_for(Category::Memory, id, Format::Markdown)?;
            if tokio::fs::try_exists(&path).await? {
                continue;
            }
            let record = self
                .persist(Category::Memory, id, Format::Markdown, *content)
                .await?;
            info!(path = ?record.physical_path, "created memory file");
            created.push(record);
        }
        Ok(created)
    }
}

/// Stage `content` next to `path` and rename it into place.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TollgateError::Storage(format!("no parent directory for {path:?}")))?;
    std::fs::create_dir_all(dir)?;
    let mut staged = tempfile::Builder::new().prefix(".tmp-").tempfile_in(dir)?;
    staged.write_all(content)?;
    staged.as_file().sync_all()?;
    staged
        .persist(path)
        .map_err(|e| TollgateError::Storage(format!("rename into {path:?} failed: {}", e.error)))?;
    Ok(())
}

/// `stem.ext`, without treating dots inside the stem as an extension.
fn file_for(stem: &Path, format: Format) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(".");
    name.push(format.extension());
    PathBuf::from(name)
}

/// Delete the files holding `stem` in any format other than `keep`.
fn remove_other_formats(stem: &Path, keep: Format) -> Result<()> {
    for format in Format::ALL.into_iter().filter(|f| *f != keep) {
        match std::fs::remove_file(file_for(stem, format)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Reduce a logical id to a safe file stem.
///
/// Keeps ASCII alphanumerics, `-`, `_` and `.`; everything else becomes `_`.
/// Leading dots are stripped so ids cannot escape the root or become hidden
/// files.
///
/// The mapping is lossy: ids that differ only in replaced characters
/// (`"a/b"` and `"a_b"`) name the same artifact. Ids longer than
/// [`MAX_ID_LEN`] are cut and suffixed with a digest of the full id, so a
/// shared prefix does not collide.
pub fn sanitize(logical_id: &str) -> Result<String> {
    let trimmed = logical_id.trim();
    let replaced: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let mut stem: String = replaced.trim_start_matches('.').to_owned();
    if stem.len() > MAX_ID_LEN {
        let digest = hex::encode(Sha256::digest(trimmed.as_bytes()));
        stem.truncate(MAX_ID_LEN - DIGEST_SUFFIX_LEN - 1);
        stem.push('-');
        stem.push_str(&digest[..DIGEST_SUFFIX_LEN]);
    }
    if stem.is_empty() || stem.chars().all(|c| c == '_' || c == '.') {
        return Err(TollgateError::InvalidInput(format!(
            "logical id {logical_id:?} has no usable characters"
        )));
    }
    Ok(stem)
}
