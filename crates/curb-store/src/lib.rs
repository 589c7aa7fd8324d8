//! Blob namespace abstraction for curbstone plus a filesystem-backed store.
//!
//! Both pipeline stages talk to storage only through [`BlobStore`], so the
//! concrete client is an injected capability rather than process-global
//! state. [`FsBlobStore`] maps slash-separated object keys onto a local
//! directory tree and publishes every object with a temp-file rename, so a
//! reader never observes a partially written object.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use curb_core::{RunId, RUN_ID_LABEL};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "curb-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {key}")]
    NotFound { key: String },
    #[error("io failure on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object {key} is not valid utf-8")]
    NotText { key: String },
}

impl StoreError {
    fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        let key = key.into();
        if source.kind() == ErrorKind::NotFound {
            Self::NotFound { key }
        } else {
            Self::Io { key, source }
        }
    }
}

/// Minimal object-store surface the pipeline needs.
///
/// Keys are `/`-separated and never start with a slash. Listing a prefix
/// that holds nothing yields an empty vec, not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Names of the immediate sub-prefixes (delimiter-style listing) under
    /// `prefix`, e.g. the run directories under `scrapes/`.
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// All object keys under `prefix`, recursively, ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Full-object write, atomic from a reader's perspective.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}

/// Fetches an object and decodes it as UTF-8 text.
pub async fn get_text(store: &dyn BlobStore, key: &str) -> Result<String, StoreError> {
    let bytes = store.get(key).await?;
    String::from_utf8(bytes).map_err(|_| StoreError::NotText {
        key: key.to_string(),
    })
}

/// Discovers the run ids present under a namespace prefix.
///
/// Each immediate subdirectory is a candidate: an optional `run_id=` label
/// is stripped, anything that is not a valid run id is dropped without
/// complaint. The result is ascending by string value, which within one
/// encoding family is chronological order. An empty result means "no data".
pub async fn run_ids_under(
    store: &dyn BlobStore,
    prefix: &str,
) -> Result<Vec<RunId>, StoreError> {
    let mut runs = Vec::new();
    for segment in store.list_dirs(prefix).await? {
        match RunId::from_storage_segment(&segment) {
            Ok(run) => runs.push(run),
            Err(_) => debug!(prefix, %segment, "ignoring non-run directory"),
        }
    }
    runs.sort();
    Ok(runs)
}

/// Like [`run_ids_under`], but only `run_id=`-labeled directories count.
///
/// The structured namespace is always written with the label, so an
/// unlabeled directory there is not a run and must not be scanned.
pub async fn labeled_run_ids_under(
    store: &dyn BlobStore,
    prefix: &str,
) -> Result<Vec<RunId>, StoreError> {
    let mut runs = Vec::new();
    for segment in store.list_dirs(prefix).await? {
        let Some(tail) = segment.strip_prefix(RUN_ID_LABEL) else {
            debug!(prefix, %segment, "ignoring unlabeled directory");
            continue;
        };
        match RunId::parse(tail) {
            Ok(run) => runs.push(run),
            Err(_) => debug!(prefix, %segment, "ignoring non-run directory"),
        }
    }
    runs.sort();
    Ok(runs)
}

/// Local-filesystem [`BlobStore`].
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_matches('/'))
    }

    async fn collect_keys(
        &self,
        dir: PathBuf,
        out: &mut Vec<String>,
        prefix: &str,
    ) -> Result<(), StoreError> {
        let mut pending = vec![dir];
        while let Some(current) = pending.pop() {
            let mut entries = match fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::io(prefix, err)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|err| StoreError::io(prefix, err))?
            {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|err| StoreError::io(prefix, err))?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    out.push(rel.to_string_lossy().replace('\\', "/"));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn list_dirs(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let dir = self.path_for(prefix);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(prefix, err)),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| StoreError::io(prefix, err))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|err| StoreError::io(prefix, err))?;
            if file_type.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        self.collect_keys(self.path_for(prefix), &mut keys, prefix)
            .await?;
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        fs::read(self.path_for(key))
            .await
            .map_err(|err| StoreError::io(key, err))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let parent = match path.parent() {
            Some(parent) => parent.to_path_buf(),
            None => self.root.clone(),
        };
        fs::create_dir_all(&parent)
            .await
            .map_err(|err| StoreError::io(key, err))?;

        // Write to a uniquely named sibling, then rename over the target so
        // a concurrent reader sees the old object or the new one, never a
        // truncated one.
        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|err| StoreError::io(key, err))?;
        if let Err(err) = async {
            file.write_all(bytes).await?;
            file.flush().await?;
            drop(file);
            fs::rename(&temp_path, &path).await
        }
        .await
        {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(key, err));
        }
        debug!(key, bytes = bytes.len(), "stored object");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        fs::try_exists(self.path_for(key))
            .await
            .map_err(|err| StoreError::io(key, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn put_get_round_trip() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store
            .put("scrapes/20250101000000/abc.txt", b"1999 Ford Focus")
            .await
            .expect("put");
        let text = get_text(&store, "scrapes/20250101000000/abc.txt")
            .await
            .expect("get");
        assert_eq!(text, "1999 Ford Focus");
        assert!(store
            .exists("scrapes/20250101000000/abc.txt")
            .await
            .expect("exists"));
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        let err = store.get("nowhere/void.txt").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn listing_an_empty_prefix_is_empty_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert!(store.list("scrapes").await.expect("list").is_empty());
        assert!(store.list_dirs("scrapes").await.expect("dirs").is_empty());
    }

    #[tokio::test]
    async fn list_dirs_returns_immediate_subdirectories_sorted() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store.put("scrapes/b-run/x.txt", b"x").await.expect("put");
        store.put("scrapes/a-run/y.txt", b"y").await.expect("put");
        store
            .put("scrapes/a-run/txt/z.txt", b"z")
            .await
            .expect("put");
        assert_eq!(
            store.list_dirs("scrapes").await.expect("dirs"),
            vec!["a-run".to_string(), "b-run".to_string()]
        );
    }

    #[tokio::test]
    async fn list_is_recursive_and_sorted() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store.put("p/run/txt/2.txt", b"2").await.expect("put");
        store.put("p/run/1.txt", b"1").await.expect("put");
        assert_eq!(
            store.list("p").await.expect("list"),
            vec!["p/run/1.txt".to_string(), "p/run/txt/2.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn put_replaces_previous_object() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store.put("datasets/t.csv", b"old").await.expect("put old");
        store.put("datasets/t.csv", b"new").await.expect("put new");
        assert_eq!(store.get("datasets/t.csv").await.expect("get"), b"new");
        // No temp artifacts left behind next to the published object.
        let keys = store.list("datasets").await.expect("list");
        assert_eq!(keys, vec!["datasets/t.csv".to_string()]);
    }

    #[tokio::test]
    async fn run_discovery_accepts_both_label_styles_and_sorts() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store
            .put("scrapes/run_id=20251026T170002Z/a.txt", b"a")
            .await
            .expect("put");
        store
            .put("scrapes/20240101120000/b.txt", b"b")
            .await
            .expect("put");
        store
            .put("scrapes/not-a-run/c.txt", b"c")
            .await
            .expect("put");
        let runs = run_ids_under(&store, "scrapes").await.expect("runs");
        let names: Vec<&str> = runs.iter().map(RunId::as_str).collect();
        assert_eq!(names, vec!["20240101120000", "20251026T170002Z"]);
    }

    #[tokio::test]
    async fn labeled_discovery_ignores_bare_run_directories() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store
            .put("structured/run_id=20250101000000/jsonl/a.jsonl", b"{}")
            .await
            .expect("put");
        store
            .put("structured/20251026170002/jsonl/b.jsonl", b"{}")
            .await
            .expect("put");
        let runs = labeled_run_ids_under(&store, "structured")
            .await
            .expect("runs");
        let names: Vec<&str> = runs.iter().map(RunId::as_str).collect();
        assert_eq!(names, vec!["20250101000000"]);
    }

    #[tokio::test]
    async fn run_discovery_of_missing_prefix_is_empty() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        assert!(run_ids_under(&store, "scrapes")
            .await
            .expect("runs")
            .is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_surfaces_as_not_text() {
        let dir = tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path());
        store.put("raw/bad.txt", &[0xff, 0xfe]).await.expect("put");
        let err = get_text(&store, "raw/bad.txt").await.unwrap_err();
        assert!(matches!(err, StoreError::NotText { .. }));
    }
}
