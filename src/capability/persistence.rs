//! Pluggable capability persistence (spec §4.7, §6).
//!
//! Grounded on `ccos::storage_backends::file_archive::FileArchive`'s
//! atomic-write-with-lock pattern, adapted from content-addressed (keyed by
//! hash) to identity-addressed (keyed by capability id, since capabilities
//! are mutated in place by revocation) storage.

use super::model::Capability;
use async_trait::async_trait;
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait CapabilityPersistence: Send + Sync {
    async fn put(&self, cap: &Capability) -> std::io::Result<()>;
    async fn get(&self, id: &str) -> std::io::Result<Option<Capability>>;
    async fn delete(&self, id: &str) -> std::io::Result<()>;
    async fn list(&self) -> std::io::Result<Vec<Capability>>;
}

/// Default backend: nothing survives a restart. Suitable for tests and for
/// deployments that treat the kernel's in-memory index as authoritative.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    entries: DashMap<String, Capability>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CapabilityPersistence for InMemoryPersistence {
    async fn put(&self, cap: &Capability) -> std::io::Result<()> {
        self.entries.insert(cap.id.clone(), cap.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> std::io::Result<Option<Capability>> {
        Ok(self.entries.get(id).map(|e| e.clone()))
    }

    async fn delete(&self, id: &str) -> std::io::Result<()> {
        self.entries.remove(id);
        Ok(())
    }

    async fn list(&self) -> std::io::Result<Vec<Capability>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }
}

/// One JSON file per capability under `base_dir`, named `<id>.json`.
/// Writes go through a temp file + rename plus a directory-level lock file
/// so a crash mid-write can never leave a torn file behind.
#[derive(Debug, Clone)]
pub struct FilePersistence {
    base_dir: PathBuf,
}

impl FilePersistence {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> std::io::Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.base_dir.join(format!("{id}.json"))
    }

    fn acquire_lock(&self, timeout: Duration) -> std::io::Result<LockGuard> {
        let lock_path = self.base_dir.join(".capability_store.lock");
        let start = std::time::Instant::now();
        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(file) => return Ok(LockGuard { path: lock_path, _file: file }),
                Err(_) if start.elapsed() < timeout => std::thread::sleep(Duration::from_millis(10)),
                Err(e) => return Err(e),
            }
        }
    }

    fn atomic_write(&self, path: &Path, data: &[u8]) -> std::io::Result<()> {
        let _guard = self.acquire_lock(Duration::from_secs(5))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, data)?;
        std::fs::rename(&tmp, path)
    }
}

struct LockGuard {
    path: PathBuf,
    _file: std::fs::File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl CapabilityPersistence for FilePersistence {
    async fn put(&self, cap: &Capability) -> std::io::Result<()> {
        let path = self.path_for(&cap.id);
        let json = serde_json::to_vec_pretty(cap)?;
        self.atomic_write(&path, &json)
    }

    async fn get(&self, id: &str) -> std::io::Result<Option<Capability>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn delete(&self, id: &str) -> std::io::Result<()> {
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn list(&self) -> std::io::Result<Vec<Capability>> {
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = std::fs::read(&path)?;
            out.push(serde_json::from_slice(&bytes)?);
        }
        Ok(out)
    }
}
