use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

const METADATA_DIR: &str = ".metadata";

/// Correlation metadata stored alongside an artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArtifactMeta {
    /// Quota session the artifact belongs to.
    pub session_id: String,
    /// Authenticated username that produced it.
    pub username: String,
    /// Prompt excerpt (truncated).
    pub prompt: String,
    /// Creation time, ISO-8601 UTC.
    pub created_at: String,
    /// Originating job, when the artifact came through the queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Card sequence number, for card and print artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_number: Option<u32>,
    /// Print-queue position, for print artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub print_number: Option<u32>,
}

/// Filesystem-backed object store.
///
/// Keys are `<folder>/<name>` paths relative to the store root. Listing a
/// prefix is the primitive everything else builds on: artifact names are the
/// quota ledger, so `list` must never report metadata sidecars.
#[derive(Debug)]
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    /// Open a store rooted at `root` (created lazily on first write).
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        if key.is_empty()
            || key.starts_with('/')
            || key.contains('\\')
            || key.split('/').any(|part| part.is_empty() || part == "..")
        {
            anyhow::bail!("invalid object key: {key:?}");
        }
        Ok(self.root.join(key))
    }

    fn meta_path_for(&self, key: &str) -> anyhow::Result<PathBuf> {
        Ok(self.root.join(METADATA_DIR).join(format!("{key}.json")))
    }

    /// Write an object, replacing any existing one under the same key.
    pub async fn put(
        &self,
        key: &str,
        bytes: &[u8],
        meta: Option<&ArtifactMeta>,
    ) -> anyhow::Result<()> {
        let path = self.path_for(key)?;
        write_atomic(&path, bytes).await?;

        if let Some(meta) = meta {
            let meta_path = self.meta_path_for(key)?;
            let json = serde_json::to_vec_pretty(meta)?;
            write_atomic(&meta_path, &json).await?;
        }
        Ok(())
    }

    /// Read an object, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Whether an object exists.
    pub async fn exists(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    /// Delete an object; returns whether it existed.
    pub async fn delete(&self, key: &str) -> anyhow::Result<bool> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                if let Ok(meta_path) = self.meta_path_for(key) {
                    let _ = tokio::fs::remove_file(&meta_path).await;
                }
                Ok(true)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// List object keys under a prefix, sorted lexicographically.
    ///
    /// The prefix is interpreted as `<folder>/<name-prefix>`; an empty name
    /// prefix lists the whole folder.
    pub async fn list(&self, prefix: &str) -> anyhow::Result<Vec<String>> {
        let (dir, name_prefix) = prefix.rsplit_once('/').unwrap_or(("", prefix));
        if dir == METADATA_DIR {
            anyhow::bail!("metadata sidecars are not listable objects");
        }

        let dir_path = if dir.is_empty() {
            self.root.clone()
        } else {
            self.path_for(dir)?
        };

        let mut reader = match tokio::fs::read_dir(&dir_path).await {
            Ok(reader) => reader,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut keys = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name.ends_with(".tmp") || !name.starts_with(name_prefix) {
                continue;
            }
            if dir.is_empty() {
                keys.push(name);
            } else {
                keys.push(format!("{dir}/{name}"));
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Number of objects under a prefix.
    pub async fn count(&self, prefix: &str) -> anyhow::Result<u32> {
        Ok(self.list(prefix).await?.len() as u32)
    }

    /// Root directory backing this store.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid object path: {}", path.display()))?;
    tokio::fs::create_dir_all(dir).await?;

    // Append rather than replace the extension: keys like `1.2.3.4_pending`
    // contain dots that are not extensions.
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| anyhow::anyhow!("invalid object path: {}", path.display()))?;
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}
