//! Background cache eviction.
//!
//! A fixed-interval loop bounding the on-disk KV cache by age and total
//! size, and reaping orphans in both directions (KV files with no
//! metadata, metadata with no KV file). Entries are detached from the
//! prefix index under its write lock first; file deletion happens outside
//! any lock. Per-file I/O errors are logged and skipped so one bad file
//! never stalls the pass.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::index::LcpIndex;
use crate::meta::{self, MetaStore};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Outcome of one cleanup cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupStats {
    pub deleted_by_age: usize,
    pub deleted_by_size: usize,
    pub deleted_orphans: usize,
    pub freed_bytes: u64,
}

/// One KV file on disk, as seen by a cleanup pass.
#[derive(Debug, Clone)]
struct KvFile {
    path: PathBuf,
    save_id: String,
    size: u64,
    mtime: u64,
}

pub struct Janitor {
    cache_dir: PathBuf,
    meta: Arc<MetaStore>,
    index: Arc<LcpIndex>,
    max_age_hours: u64,
    max_size_bytes: u64,
    period: Duration,
    pinned: HashSet<String>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Janitor {
    pub fn new(config: &Config, meta: Arc<MetaStore>, index: Arc<LcpIndex>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            cache_dir: config.cache_dir.clone(),
            meta,
            index,
            max_age_hours: config.cache_max_age_hours,
            max_size_bytes: (config.cache_max_size_gb * GIB) as u64,
            period: config.cleanup_interval(),
            pinned: config.pinned_keys.clone(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Run the cleanup loop until `stop` is called.
    pub async fn start(&self) {
        info!(period = ?self.period, "janitor started");

        let mut interval = interval(self.period);
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.run_cycle();
                    if stats != CleanupStats::default() {
                        info!(
                            deleted_by_age = stats.deleted_by_age,
                            deleted_by_size = stats.deleted_by_size,
                            deleted_orphans = stats.deleted_orphans,
                            freed_mb = stats.freed_bytes / (1024 * 1024),
                            "cleanup cycle done"
                        );
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("janitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Signal the loop to stop.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run a single cleanup cycle.
    pub fn run_cycle(&self) -> CleanupStats {
        let mut stats = CleanupStats::default();

        if !self.cache_dir.is_dir() {
            warn!(dir = %self.cache_dir.display(), "cache dir missing, skipping cleanup");
            return stats;
        }

        let mut kv_files = self.scan_kv_files();
        let last_used: HashMap<String, u64> = self
            .index
            .entries()
            .into_iter()
            .map(|e| (e.save_id, e.last_used_at))
            .collect();
        let now = meta::unix_now();

        // Age pass.
        if self.max_age_hours > 0 {
            let cutoff = now.saturating_sub(self.max_age_hours * 3600);
            kv_files.retain(|f| {
                if self.pinned.contains(&f.save_id) {
                    return true;
                }
                let used = last_used.get(&f.save_id).copied().unwrap_or(f.mtime);
                if used < cutoff {
                    debug!(save_id = %f.save_id, age_hours = (now - used) / 3600, "evicting by age");
                    self.evict(f, &mut stats);
                    stats.deleted_by_age += 1;
                    false
                } else {
                    true
                }
            });
        }

        // Size pass: oldest first until under the bound.
        let mut total: u64 = kv_files.iter().map(|f| f.size).sum();
        if total > self.max_size_bytes {
            kv_files.sort_by_key(|f| last_used.get(&f.save_id).copied().unwrap_or(f.mtime));
            let mut kept = Vec::new();
            for file in kv_files {
                if total > self.max_size_bytes && !self.pinned.contains(&file.save_id) {
                    total -= file.size;
                    debug!(save_id = %file.save_id, size = file.size, "evicting by size");
                    self.evict(&file, &mut stats);
                    stats.deleted_by_size += 1;
                } else {
                    kept.push(file);
                }
            }
            kv_files = kept;
        }

        // Orphan pass: KV files with no metadata, then metadata with no
        // KV file.
        let kv_ids: HashSet<String> = kv_files.iter().map(|f| f.save_id.clone()).collect();
        for file in &kv_files {
            // Re-check the live index: an admission may have landed since
            // the pass started.
            if self.pinned.contains(&file.save_id) || self.index.entry(&file.save_id).is_some() {
                continue;
            }
            debug!(save_id = %file.save_id, "removing orphan KV file");
            self.evict(file, &mut stats);
            stats.deleted_orphans += 1;
        }
        for save_id in self.known_save_ids() {
            if kv_ids.contains(&save_id) || self.pinned.contains(&save_id) {
                continue;
            }
            debug!(save_id = %save_id, "removing orphan metadata");
            self.index.remove(&save_id);
            if let Err(e) = self.meta.remove(&save_id) {
                warn!(save_id = %save_id, error = %e, "failed to remove orphan metadata");
            }
            stats.deleted_orphans += 1;
        }

        stats
    }

    /// Every save id the proxy knows about: indexed entries plus any stale
    /// records still on disk.
    fn known_save_ids(&self) -> HashSet<String> {
        let mut ids: HashSet<String> = self
            .index
            .entries()
            .into_iter()
            .map(|e| e.save_id)
            .collect();
        match self.meta.list_ids() {
            Ok(on_disk) => ids.extend(on_disk),
            Err(e) => warn!(error = %e, "metadata listing failed"),
        }
        ids
    }

    fn scan_kv_files(&self) -> Vec<KvFile> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.cache_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.cache_dir.display(), error = %e, "cache dir scan failed");
                return files;
            }
        };
        for dirent in entries.flatten() {
            let path = dirent.path();
            let Ok(metadata) = dirent.metadata() else {
                continue;
            };
            if !metadata.is_file() {
                continue;
            }
            // The backend names KV files by save id plus its own suffix.
            let Some(save_id) = path.file_stem().and_then(|s| s.to_str()).map(|s| s.to_string())
            else {
                continue;
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            files.push(KvFile {
                path,
                save_id,
                size: metadata.len(),
                mtime,
            });
        }
        files
    }

    /// Detach from the index, then delete the KV file and its record.
    fn evict(&self, file: &KvFile, stats: &mut CleanupStats) {
        self.index.remove(&file.save_id);
        match fs::remove_file(&file.path) {
            Ok(()) => stats.freed_bytes += file.size,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(file = %file.path.display(), error = %e, "KV file delete failed");
            }
        }
        if let Err(e) = self.meta.remove(&file.save_id) {
            warn!(save_id = %file.save_id, error = %e, "metadata delete failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use crate::meta::CacheEntry;
    use std::collections::HashSet;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        cache_dir: PathBuf,
        meta: Arc<MetaStore>,
        index: Arc<LcpIndex>,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let cache_dir = temp.path().join("cache");
        let meta_dir = temp.path().join("meta");
        fs::create_dir_all(&cache_dir).unwrap();
        fs::create_dir_all(&meta_dir).unwrap();
        Fixture {
            cache_dir,
            meta: Arc::new(MetaStore::new(meta_dir)),
            index: Arc::new(LcpIndex::new()),
            _temp: temp,
        }
    }

    fn janitor(fx: &Fixture, max_age_hours: u64, max_size_gb: f64) -> Janitor {
        janitor_pinned(fx, max_age_hours, max_size_gb, HashSet::new())
    }

    fn janitor_pinned(
        fx: &Fixture,
        max_age_hours: u64,
        max_size_gb: f64,
        pinned: HashSet<String>,
    ) -> Janitor {
        let config = Config {
            cache_dir: fx.cache_dir.clone(),
            meta_dir: fx.meta.dir().to_path_buf(),
            cache_max_age_hours: max_age_hours,
            cache_max_size_gb: max_size_gb,
            pinned_keys: pinned,
            ..Config::default()
        };
        Janitor::new(&config, fx.meta.clone(), fx.index.clone())
    }

    /// Admit an entry with a KV file of `size` bytes, last used at `ts`.
    fn admit(fx: &Fixture, save_id: &str, text: &str, ts: u64, size: usize) {
        let fp = fingerprint(text, 4);
        let entry = CacheEntry {
            save_id: save_id.to_string(),
            model: "m".to_string(),
            signatures: fp.signatures,
            word_count: fp.word_count,
            created_at: ts,
            last_used_at: ts,
            bytes_on_disk: Some(size as u64),
        };
        fx.meta.write(&entry).unwrap();
        fx.index.insert(entry);
        fs::write(fx.cache_dir.join(format!("{save_id}.bin")), vec![0u8; size]).unwrap();
    }

    #[test]
    fn test_age_pass() {
        let fx = fixture();
        let now = meta::unix_now();
        admit(&fx, "old", "a b c d", now - 10 * 3600, 10);
        admit(&fx, "fresh", "e f g h", now, 10);

        let stats = janitor(&fx, 1, 50.0).run_cycle();
        assert_eq!(stats.deleted_by_age, 1);
        assert_eq!(stats.freed_bytes, 10);

        assert!(fx.index.entry("old").is_none());
        assert!(fx.index.entry("fresh").is_some());
        assert!(!fx.cache_dir.join("old.bin").exists());
        assert!(fx.cache_dir.join("fresh.bin").exists());
    }

    #[test]
    fn test_age_pass_disabled() {
        let fx = fixture();
        admit(&fx, "ancient", "a b c d", 1, 10);

        let stats = janitor(&fx, 0, 50.0).run_cycle();
        assert_eq!(stats.deleted_by_age, 0);
        assert!(fx.index.entry("ancient").is_some());
    }

    #[test]
    fn test_size_pass_evicts_least_recently_used() {
        let fx = fixture();
        let now = meta::unix_now();
        // Bound just above one entry's size: two 1 KiB entries exceed it.
        let bound_gb = 1.5 * 1024.0 / GIB;
        admit(&fx, "first", "a b c d", now - 100, 1024);
        admit(&fx, "second", "e f g h", now, 1024);

        let stats = janitor(&fx, 0, bound_gb).run_cycle();
        assert_eq!(stats.deleted_by_size, 1);

        // The least recently used entry went; lookups for it now miss.
        assert!(fx.index.entry("first").is_none());
        assert!(fx.index.entry("second").is_some());
        let fp = fingerprint("a b c d", 4);
        assert!(fx.index.lookup("m", &fp, 0.5).is_none());
        assert!(!fx.cache_dir.join("first.bin").exists());
    }

    #[test]
    fn test_size_pass_touch_protects() {
        let fx = fixture();
        let now = meta::unix_now();
        let bound_gb = 1.5 * 1024.0 / GIB;
        admit(&fx, "first", "a b c d", now - 100, 1024);
        admit(&fx, "second", "e f g h", now - 50, 1024);

        // Touching the older entry makes the other one the LRU victim.
        fx.index.touch("first", now);

        let stats = janitor(&fx, 0, bound_gb).run_cycle();
        assert_eq!(stats.deleted_by_size, 1);
        assert!(fx.index.entry("first").is_some());
        assert!(fx.index.entry("second").is_none());
    }

    #[test]
    fn test_orphan_kv_file_removed() {
        let fx = fixture();
        let now = meta::unix_now();
        admit(&fx, "kept", "a b c d", now, 10);
        fs::write(fx.cache_dir.join("stray.bin"), b"xxxxx").unwrap();

        let stats = janitor(&fx, 0, 50.0).run_cycle();
        assert_eq!(stats.deleted_orphans, 1);
        assert!(!fx.cache_dir.join("stray.bin").exists());
        assert!(fx.cache_dir.join("kept.bin").exists());
    }

    #[test]
    fn test_orphan_metadata_removed() {
        let fx = fixture();
        let now = meta::unix_now();
        admit(&fx, "kept", "a b c d", now, 10);
        admit(&fx, "gone", "e f g h", now, 10);
        fs::remove_file(fx.cache_dir.join("gone.bin")).unwrap();

        let stats = janitor(&fx, 0, 50.0).run_cycle();
        assert_eq!(stats.deleted_orphans, 1);
        assert!(fx.index.entry("gone").is_none());
        assert!(!fx.meta.list_ids().unwrap().contains(&"gone".to_string()));
        assert!(fx.index.entry("kept").is_some());
    }

    #[test]
    fn test_pinned_exempt() {
        let fx = fixture();
        admit(&fx, "pinned", "a b c d", 1, 2048);
        admit(&fx, "plain", "e f g h", 1, 2048);

        let pinned = HashSet::from(["pinned".to_string()]);
        let stats = janitor_pinned(&fx, 1, 1024.0 / GIB, pinned).run_cycle();

        assert!(fx.index.entry("pinned").is_some());
        assert!(fx.cache_dir.join("pinned.bin").exists());
        assert!(fx.index.entry("plain").is_none());
        assert!(stats.deleted_by_age >= 1);
    }

    #[test]
    fn test_steady_state_converges() {
        let fx = fixture();
        let now = meta::unix_now();
        for i in 0..6 {
            admit(
                &fx,
                &format!("e{i}"),
                &format!("w{i} x{i} y{i} z{i}"),
                now - i as u64,
                1024,
            );
        }

        let bound_bytes = 3 * 1024 + 512;
        let j = janitor(&fx, 0, bound_bytes as f64 / GIB);
        j.run_cycle();

        let remaining: u64 = fs::read_dir(&fx.cache_dir)
            .unwrap()
            .flatten()
            .map(|d| d.metadata().unwrap().len())
            .sum();
        assert!(remaining <= bound_bytes as u64);

        // A second pass on the steady state is a no-op.
        assert_eq!(j.run_cycle(), CleanupStats::default());
    }

    #[test]
    fn test_missing_cache_dir_skips() {
        let fx = fixture();
        fs::remove_dir_all(&fx.cache_dir).unwrap();
        assert_eq!(janitor(&fx, 1, 1.0).run_cycle(), CleanupStats::default());
    }

    #[tokio::test]
    async fn test_stop_terminates_loop() {
        let fx = fixture();
        let j = Arc::new(janitor(&fx, 0, 50.0));
        let handle = {
            let j = j.clone();
            tokio::spawn(async move { j.start().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        j.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("janitor did not stop")
            .unwrap();
    }
}
