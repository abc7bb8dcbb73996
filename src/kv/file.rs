use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use super::memory::{KvMap, now_secs};
use super::{KvPage, KvStore};
use crate::error::{Error, Result};

/// JSON file store shared between the server and the CLI.
///
/// Every operation re-reads the file under an `fs2` lock on a sibling
/// `.lock` file, so a `acpc login` running beside the server sees and
/// produces consistent state.
pub struct FileKv {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileKv {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "kv.json".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open_lock(&self) -> Result<File> {
        if let Some(parent) = self.lock_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        Ok(file)
    }

    fn load(&self) -> Result<KvMap> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(KvMap::default()),
            Ok(content) => serde_json::from_str(&content).map_err(|e| {
                Error::Kv(format!("corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(KvMap::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, map: &KvMap) -> Result<()> {
        let content = serde_json::to_string_pretty(map)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn read<R>(&self, f: impl FnOnce(&KvMap) -> R) -> Result<R> {
        let lock = self.open_lock()?;
        FileExt::lock_shared(&lock)?;
        let result = self.load().map(|map| f(&map));
        let _ = FileExt::unlock(&lock);
        result
    }

    fn write(&self, f: impl FnOnce(&mut KvMap)) -> Result<()> {
        let lock = self.open_lock()?;
        FileExt::lock_exclusive(&lock)?;
        let result = self.load().and_then(|mut map| {
            map.evict_expired(now_secs());
            f(&mut map);
            self.save(&map)
        });
        let _ = FileExt::unlock(&lock);
        result
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.read(|map| map.get(key, now_secs()))
    }

    async fn put(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        self.write(|map| map.put(key, value, ttl_secs, now_secs()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.write(|map| {
            map.delete(key);
        })
    }

    async fn list(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> Result<KvPage> {
        self.read(|map| map.list(prefix, limit, cursor, now_secs()))
    }
}
