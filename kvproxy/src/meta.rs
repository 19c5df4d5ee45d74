//! Durable cache-entry metadata.
//!
//! One small self-describing JSON record per cache entry, named
//! `{save_id}.meta.json` in the metadata directory. Writes are atomic
//! (temp file, fsync, rename) so a crash never leaves a half-written
//! record; anything unparseable at startup is moved aside, not fatal.

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

use crate::fingerprint::BlockSig;
use crate::Result;

const META_SUFFIX: &str = ".meta.json";
const TMP_SUFFIX: &str = ".meta.json.tmp";

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One persisted cache entry: a saved KV state plus the fingerprint that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Name the backend uses to address the saved KV file on disk.
    pub save_id: String,
    /// Model the entry was produced under; never shared across models.
    pub model: String,
    /// Full block-signature fingerprint of the cached prompt prefix.
    pub signatures: Vec<BlockSig>,
    pub word_count: usize,
    pub created_at: u64,
    pub last_used_at: u64,
    /// Best-effort size of the backend-side KV file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_on_disk: Option<u64>,
}

/// Filesystem store for cache-entry records.
#[derive(Debug, Clone)]
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, save_id: &str) -> PathBuf {
        self.dir.join(format!("{save_id}{META_SUFFIX}"))
    }

    /// Write a record atomically: temp file in the same directory, fsync,
    /// rename over the final name.
    pub fn write(&self, entry: &CacheEntry) -> Result<()> {
        let final_path = self.record_path(&entry.save_id);
        let tmp_path = self.dir.join(format!("{}{TMP_SUFFIX}", entry.save_id));

        let data = serde_json::to_vec_pretty(entry)?;
        let mut file = File::create(&tmp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;

        debug!(save_id = %entry.save_id, "metadata record written");
        Ok(())
    }

    /// Update `last_used_at` in an existing record. Missing records are a
    /// warning, not an error.
    pub fn touch(&self, save_id: &str, ts: u64) -> Result<()> {
        let path = self.record_path(save_id);
        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(save_id, "touch on missing metadata record");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let mut entry: CacheEntry = serde_json::from_slice(&data)?;
        entry.last_used_at = ts;
        self.write(&entry)
    }

    /// Delete a record; idempotent.
    pub fn remove(&self, save_id: &str) -> Result<()> {
        match fs::remove_file(self.record_path(save_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save ids of all records currently on disk.
    pub fn list_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        if !self.dir.exists() {
            return Ok(ids);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(META_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }

    /// Scan the directory at startup. Corrupt records are renamed aside to
    /// `{name}.corrupt` and logged; leftover temp files from interrupted
    /// writes are removed.
    pub fn load_all(&self) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        if !self.dir.exists() {
            return Ok(entries);
        }

        for dirent in fs::read_dir(&self.dir)? {
            let dirent = dirent?;
            let path = dirent.path();
            let name = dirent.file_name().to_string_lossy().to_string();

            if name.ends_with(TMP_SUFFIX) {
                warn!(file = %path.display(), "removing interrupted metadata write");
                let _ = fs::remove_file(&path);
                continue;
            }
            if !name.ends_with(META_SUFFIX) {
                continue;
            }

            match fs::read(&path).map_err(crate::Error::from).and_then(|data| {
                serde_json::from_slice::<CacheEntry>(&data).map_err(crate::Error::from)
            }) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    let aside = path.with_extension("corrupt");
                    warn!(file = %path.display(), error = %e, "quarantining corrupt metadata record");
                    if let Err(e) = fs::rename(&path, &aside) {
                        warn!(file = %path.display(), error = %e, "failed to move corrupt record aside");
                    }
                }
            }
        }

        debug!(count = entries.len(), "metadata scan complete");
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(save_id: &str) -> CacheEntry {
        CacheEntry {
            save_id: save_id.to_string(),
            model: "m".to_string(),
            signatures: vec![BlockSig(1), BlockSig(2)],
            word_count: 8,
            created_at: 100,
            last_used_at: 100,
            bytes_on_disk: Some(4096),
        }
    }

    #[test]
    fn test_write_and_load() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());

        store.write(&entry("abc")).unwrap();
        store.write(&entry("def")).unwrap();

        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|a, b| a.save_id.cmp(&b.save_id));
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], entry("abc"));
        assert_eq!(loaded[1], entry("def"));
    }

    #[test]
    fn test_touch_updates_last_used() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());

        store.write(&entry("abc")).unwrap();
        store.touch("abc", 999).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded[0].last_used_at, 999);
        assert_eq!(loaded[0].created_at, 100);
    }

    #[test]
    fn test_touch_missing_is_ok() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());
        store.touch("missing", 1).unwrap();
    }

    #[test]
    fn test_remove_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());

        store.write(&entry("abc")).unwrap();
        store.remove("abc").unwrap();
        store.remove("abc").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_record_quarantined() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());

        store.write(&entry("good")).unwrap();
        std::fs::write(temp.path().join("bad.meta.json"), b"{not json").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].save_id, "good");

        // Moved aside, and a re-scan no longer sees it.
        assert!(temp.path().join("bad.meta.corrupt").exists());
        assert_eq!(store.load_all().unwrap().len(), 1);
    }

    #[test]
    fn test_interrupted_write_cleaned() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());

        std::fs::write(temp.path().join("x.meta.json.tmp"), b"partial").unwrap();
        assert!(store.load_all().unwrap().is_empty());
        assert!(!temp.path().join("x.meta.json.tmp").exists());
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path().join("nope"));
        assert!(store.load_all().unwrap().is_empty());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_list_ids() {
        let temp = TempDir::new().unwrap();
        let store = MetaStore::new(temp.path());
        store.write(&entry("one")).unwrap();
        store.write(&entry("two")).unwrap();

        let mut ids = store.list_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["one", "two"]);
    }
}
