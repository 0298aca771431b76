//! Directory-tree persistence for a single machine or a shared filesystem.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::{SchedError, SchedResult};
use crate::persistence::JobStore;
use crate::record::{CalculationRecord, RecordFilter};

type FileStamp = (SystemTime, u64);

/// Directory-tree job store.
///
/// Records live at `<root>/<style>/<name>.json` and archives at
/// `<root>/<style>/<name>.blob`. Several processes may share the tree: new
/// records are created exclusively and replacements go through a rename, so
/// readers never observe a partial document. Parsed records are cached by
/// file modification time and size.
pub struct LocalStore {
    /// Root directory of the tree.
    root: PathBuf,

    /// Parsed records keyed by path, with the file stamp they were read at.
    cache: RwLock<FxHashMap<PathBuf, (FileStamp, CalculationRecord)>>,
}

impl LocalStore {
    /// Open (creating if needed) a store rooted at the given path.
    pub async fn new(root: impl AsRef<Path>) -> SchedResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        Ok(Self {
            root,
            cache: RwLock::new(FxHashMap::default()),
        })
    }

    /// Create a new store in a temporary directory.
    pub async fn temp() -> SchedResult<Self> {
        let temp_dir = std::env::temp_dir().join(format!("atomrun-store-{}", uuid::Uuid::new_v4()));
        Self::new(temp_dir).await
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn style_dir(&self, style: &str) -> SchedResult<PathBuf> {
        check_key(style)?;
        Ok(self.root.join(style))
    }

    fn record_path(&self, style: &str, name: &str) -> SchedResult<PathBuf> {
        check_key(name)?;
        Ok(self.style_dir(style)?.join(format!("{name}.json")))
    }

    fn blob_path(&self, style: &str, name: &str) -> SchedResult<PathBuf> {
        check_key(name)?;
        Ok(self.style_dir(style)?.join(format!("{name}.blob")))
    }

    /// Read a record file, reusing the cached parse when unchanged.
    async fn read_record(&self, path: &Path) -> SchedResult<Option<CalculationRecord>> {
        let stamp = match fs::metadata(path).await {
            Ok(meta) => (meta.modified()?, meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.cache.write().await.remove(path);
                return Ok(None);
            }
            Err(e) => return Err(SchedError::IoError(e)),
        };

        if let Some((cached_at, record)) = self.cache.read().await.get(path) {
            if *cached_at == stamp {
                return Ok(Some(record.clone()));
            }
        }

        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SchedError::IoError(e)),
        };
        let record: CalculationRecord = serde_json::from_str(&content)?;

        self.cache
            .write()
            .await
            .insert(path.to_path_buf(), (stamp, record.clone()));
        Ok(Some(record))
    }
}

#[async_trait]
impl JobStore for LocalStore {
    async fn add_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        let path = self.record_path(&record.style, &record.name)?;
        fs::create_dir_all(self.style_dir(&record.style)?).await?;

        let json = serde_json::to_string_pretty(record)?;
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SchedError::duplicate(&record.style, &record.name));
            }
            Err(e) => return Err(SchedError::IoError(e)),
        };
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    async fn get_record(
        &self,
        style: &str,
        name: &str,
    ) -> SchedResult<Option<CalculationRecord>> {
        let path = self.record_path(style, name)?;
        self.read_record(&path).await
    }

    async fn update_record(&self, record: &CalculationRecord) -> SchedResult<()> {
        let path = self.record_path(&record.style, &record.name)?;
        if !fs::try_exists(&path).await? {
            return Err(SchedError::not_found(&record.style, &record.name));
        }

        let json = serde_json::to_string_pretty(record)?;
        replace_file(&path, json.as_bytes()).await?;
        self.cache.write().await.remove(&path);

        Ok(())
    }

    async fn get_records(
        &self,
        style: &str,
        filter: &RecordFilter,
    ) -> SchedResult<Vec<CalculationRecord>> {
        let dir = self.style_dir(style)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(SchedError::IoError(e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut records = Vec::new();
        for path in paths {
            match self.read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!("Failed to read record file {:?}: {}", path, e),
            }
        }

        Ok(filter.apply(records))
    }

    async fn delete_record(&self, style: &str, name: &str) -> SchedResult<bool> {
        let path = self.record_path(style, name)?;
        self.cache.write().await.remove(&path);

        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }

    async fn add_blob(&self, style: &str, name: &str, data: &[u8]) -> SchedResult<()> {
        let path = self.blob_path(style, name)?;
        fs::create_dir_all(self.style_dir(style)?).await?;
        replace_file(&path, data).await
    }

    async fn get_blob(&self, style: &str, name: &str) -> SchedResult<Option<Vec<u8>>> {
        let path = self.blob_path(style, name)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }

    async fn delete_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        let path = self.blob_path(style, name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(SchedError::IoError(e)),
        }
    }

    async fn has_blob(&self, style: &str, name: &str) -> SchedResult<bool> {
        Ok(fs::try_exists(self.blob_path(style, name)?).await?)
    }
}

/// Atomically replace `path` with `data` via a sibling temporary file.
async fn replace_file(path: &Path, data: &[u8]) -> SchedResult<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.{}", uuid::Uuid::new_v4()));

    fs::write(&tmp, data).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(SchedError::IoError(e));
    }
    Ok(())
}

/// Styles and names become file names; reject anything that is not a plain
/// path component.
fn check_key(key: &str) -> SchedResult<()> {
    if key.is_empty() || key.starts_with('.') || key.contains(['/', '\\']) {
        return Err(SchedError::ConfigError(format!(
            "invalid record key {key:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::conformance;

    #[tokio::test]
    async fn test_local_store_records() {
        let store = LocalStore::temp().await.unwrap();
        conformance::records(&store).await;
    }

    #[tokio::test]
    async fn test_local_store_queries() {
        let store = LocalStore::temp().await.unwrap();
        conformance::queries(&store).await;
    }

    #[tokio::test]
    async fn test_local_store_blobs() {
        let store = LocalStore::temp().await.unwrap();
        conformance::blobs(&store).await;
    }

    #[tokio::test]
    async fn test_local_store_save() {
        let store = LocalStore::temp().await.unwrap();
        conformance::save(&store).await;
    }

    #[tokio::test]
    async fn test_local_store_shared_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalStore::new(dir.path()).await.unwrap();
        let reader = LocalStore::new(dir.path()).await.unwrap();

        let mut rec = CalculationRecord::new("job-a", "calc", "E_vs_r_scan");
        writer.add_record(&rec).await.unwrap();
        assert!(reader.get_record("calc", "job-a").await.unwrap().is_some());

        rec.mark_error("lost contact").unwrap();
        writer.update_record(&rec).await.unwrap();
        let seen = reader.get_record("calc", "job-a").await.unwrap().unwrap();
        assert_eq!(seen.error.as_deref(), Some("lost contact"));

        assert!(dir.path().join("calc/job-a.json").exists());
    }

    #[tokio::test]
    async fn test_local_store_rejects_path_keys() {
        let store = LocalStore::temp().await.unwrap();
        assert!(store.get_record("calc", "../escape").await.is_err());
        assert!(store.get_blob("", "job").await.is_err());
    }
}
