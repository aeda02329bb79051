//! Maps a (job, key) pair to a compressed archive of directory trees on a
//! filesystem cache root.
//!
//! Archives are `tar` + gzip (`flate2`). Per-job advisory locking for
//! `prune` uses `fs4`'s `FileExt` extension trait on a plain lock file.

use dashmap::DashSet;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use fs4::fs_std::FileExt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Present,
    Absent,
}

/// In-process coalescing: a `store` for a (job, key) already being written
/// by another task on this process is a no-op.
static IN_FLIGHT_STORES: LazyLock<DashSet<(String, String)>> = LazyLock::new(DashSet::new);

struct InFlightGuard<'a>(&'a (String, String));

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        IN_FLIGHT_STORES.remove(self.0);
    }
}

pub struct CacheStore {
    root: PathBuf,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct Meta {
    created_at: u128,
    size: u64,
    anchor: String,
}

impl CacheStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn job_dir(&self, job: &str) -> PathBuf {
        self.root.join(job)
    }

    fn archive_path(&self, job: &str, key: &str) -> PathBuf {
        self.job_dir(job).join(format!("{key}.tar.gz"))
    }

    fn meta_path(&self, job: &str, key: &str) -> PathBuf {
        self.job_dir(job).join(format!("{key}.meta"))
    }

    fn lock_path(&self, job: &str) -> PathBuf {
        self.job_dir(job).join(".lock")
    }

    /// Present iff the archive and its metadata both exist and pass a
    /// structural check. A failing entry is quarantined (renamed with a
    /// `.corrupt` suffix) so it neither serves nor reappears.
    pub fn lookup(&self, job: &str, key: &str) -> Lookup {
        let archive = self.archive_path(job, key);
        let meta = self.meta_path(job, key);
        if !archive.exists() || !meta.exists() {
            return Lookup::Absent;
        }
        match self.check_structural(&archive, &meta) {
            Ok(()) => Lookup::Present,
            Err(_) => {
                self.quarantine(&archive);
                self.quarantine(&meta);
                Lookup::Absent
            }
        }
    }

    fn check_structural(&self, archive: &Path, meta: &Path) -> Result<()> {
        let raw = fs::read_to_string(meta)?;
        let _meta: Meta = serde_json::from_str(&raw)?;
        let file = File::open(archive)?;
        let decoder = GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        for entry in tar.entries()? {
            entry?;
        }
        Ok(())
    }

    fn quarantine(&self, path: &Path) {
        if path.exists() {
            let dest = path.with_extension(format!(
                "{}.corrupt",
                path.extension().and_then(|e| e.to_str()).unwrap_or("")
            ));
            let _ = fs::rename(path, dest);
        }
    }

    /// Extracts the archive under `workspace`. Overwrites are confined to
    /// the directories originally captured, since the archive only ever
    /// contains entries rooted at those directories.
    pub fn restore(&self, job: &str, key: &str, workspace: &Path) -> Result<()> {
        let archive = self.archive_path(job, key);
        let file = File::open(&archive).map_err(|e| Error::CorruptEntry {
            job: job.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })?;
        let decoder = GzDecoder::new(file);
        let mut tar = tar::Archive::new(decoder);
        tar.unpack(workspace).map_err(|e| Error::CorruptEntry {
            job: job.to_string(),
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Creates the archive atomically (write to a temp path in the same
    /// directory, fsync, rename). A directory that does not exist is
    /// recorded as an empty placeholder so `restore` is total.
    pub fn store(&self, job: &str, key: &str, workspace: &Path, dirs: &[PathBuf]) -> Result<()> {
        let coalesce_key = (job.to_string(), key.to_string());
        if !IN_FLIGHT_STORES.insert(coalesce_key.clone()) {
            return Ok(()); // another task in this process is already storing this entry
        }
        // Removed via the guard even if store_inner panics, so a single bad
        // store never permanently wedges this (job, key) out of caching.
        let _guard = InFlightGuard(&coalesce_key);
        self.store_inner(job, key, workspace, dirs)
    }

    fn store_inner(&self, job: &str, key: &str, workspace: &Path, dirs: &[PathBuf]) -> Result<()> {
        if self.lookup(job, key) == Lookup::Present {
            return Ok(()); // same (job, key) already persisted by another process/run
        }
        let job_dir = self.job_dir(job);
        fs::create_dir_all(&job_dir)?;

        let tmp_archive = job_dir.join(format!(".{key}.tar.gz.tmp-{}", std::process::id()));
        {
            let file = File::create(&tmp_archive)?;
            let encoder = GzEncoder::new(file, Compression::default());
            let mut builder = tar::Builder::new(encoder);
            for dir in dirs {
                let abs = workspace.join(dir);
                if abs.is_dir() {
                    builder.append_dir_all(dir, &abs)?;
                } else {
                    // Missing directory: store an empty placeholder so restore is total.
                    builder.append_dir(dir, workspace)?;
                }
            }
            let encoder = builder.into_inner()?;
            let mut file = encoder.finish()?;
            file.flush()?;
            file.sync_all()?;
        }

        let size = fs::metadata(&tmp_archive)?.len();
        let created_at = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis();
        let meta = Meta { created_at, size, anchor: workspace.display().to_string() };
        let tmp_meta = job_dir.join(format!(".{key}.meta.tmp-{}", std::process::id()));
        fs::write(&tmp_meta, serde_json::to_string(&meta)?)?;

        fs::rename(&tmp_archive, self.archive_path(job, key))?;
        fs::rename(&tmp_meta, self.meta_path(job, key))?;
        Ok(())
    }

    /// Removes oldest entries by `created_at`, keeping the `n` newest, under
    /// a per-job advisory file lock so concurrent processes cannot corrupt
    /// the listing.
    pub fn prune(&self, job: &str, keep_last_n: u32) -> Result<()> {
        let job_dir = self.job_dir(job);
        if !job_dir.exists() {
            return Ok(());
        }
        fs::create_dir_all(&job_dir)?;
        let lock_path = self.lock_path(job);
        let lock_file = File::create(&lock_path)?;
        FileExt::lock_exclusive(&lock_file)?;

        let mut entries: Vec<(String, u128)> = Vec::new();
        for entry in fs::read_dir(&job_dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("meta") {
                continue;
            }
            let key = path.file_stem().and_then(|s| s.to_str()).unwrap_or("").to_string();
            let Ok(raw) = fs::read_to_string(&path) else { continue };
            let Ok(meta) = serde_json::from_str::<Meta>(&raw) else { continue };
            entries.push((key, meta.created_at));
        }
        entries.sort_by_key(|(_, created_at)| std::cmp::Reverse(*created_at));
        for (key, _) in entries.into_iter().skip(keep_last_n as usize) {
            let _ = fs::remove_file(self.archive_path(job, &key));
            let _ = fs::remove_file(self.meta_path(job, &key));
        }

        FileExt::unlock(&lock_file)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn store_then_restore_round_trips() {
        let cache_root = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir(workspace.path().join("out")).unwrap();
        fs::write(workspace.path().join("out/result.txt"), "hello").unwrap();

        let store = CacheStore::new(cache_root.path());
        store.store("build", "deadbeef", workspace.path(), &[PathBuf::from("out")]).unwrap();
        assert_eq!(store.lookup("build", "deadbeef"), Lookup::Present);

        let restore_into = tempdir().unwrap();
        store.restore("build", "deadbeef", restore_into.path()).unwrap();
        let restored = fs::read_to_string(restore_into.path().join("out/result.txt")).unwrap();
        assert_eq!(restored, "hello");
    }

    #[test]
    fn missing_cache_dir_restores_as_empty_placeholder() {
        let cache_root = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        // "out" does not exist in the workspace.

        let store = CacheStore::new(cache_root.path());
        store.store("build", "k", workspace.path(), &[PathBuf::from("out")]).unwrap();

        let restore_into = tempdir().unwrap();
        store.restore("build", "k", restore_into.path()).unwrap();
        assert!(restore_into.path().join("out").is_dir());
    }

    #[test]
    fn lookup_absent_when_not_stored() {
        let cache_root = tempdir().unwrap();
        let store = CacheStore::new(cache_root.path());
        assert_eq!(store.lookup("build", "nope"), Lookup::Absent);
    }

    #[test]
    fn corrupt_archive_is_quarantined_and_treated_as_miss() {
        let cache_root = tempdir().unwrap();
        let store = CacheStore::new(cache_root.path());
        let job_dir = cache_root.path().join("build");
        fs::create_dir_all(&job_dir).unwrap();
        fs::write(job_dir.join("bad.tar.gz"), b"not a real gzip").unwrap();
        fs::write(
            job_dir.join("bad.meta"),
            serde_json::to_string(&Meta { created_at: 1, size: 1, anchor: "x".into() }).unwrap(),
        )
        .unwrap();

        assert_eq!(store.lookup("build", "bad"), Lookup::Absent);
        assert!(job_dir.join("bad.tar.gz.corrupt").exists());
    }

    #[test]
    fn prune_keeps_only_the_newest_n() {
        let cache_root = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir(workspace.path().join("out")).unwrap();

        let store = CacheStore::new(cache_root.path());
        for i in 0..5 {
            store
                .store("build", &format!("key{i}"), workspace.path(), &[PathBuf::from("out")])
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        store.prune("build", 2).unwrap();

        let job_dir = cache_root.path().join("build");
        let remaining: usize = fs::read_dir(&job_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().and_then(|e| e.to_str()) == Some("meta"))
            .count();
        assert_eq!(remaining, 2);
        assert_eq!(store.lookup("build", "key4"), Lookup::Present);
        assert_eq!(store.lookup("build", "key3"), Lookup::Present);
        assert_eq!(store.lookup("build", "key0"), Lookup::Absent);
    }

    #[test]
    fn coalesces_concurrent_store_for_same_key() {
        let cache_root = tempdir().unwrap();
        let workspace = tempdir().unwrap();
        fs::create_dir(workspace.path().join("out")).unwrap();
        let store = std::sync::Arc::new(CacheStore::new(cache_root.path()));

        let mut handles = vec![];
        for _ in 0..4 {
            let store = store.clone();
            let ws = workspace.path().to_path_buf();
            handles.push(std::thread::spawn(move || {
                store.store("build", "same-key", &ws, &[PathBuf::from("out")]).unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.lookup("build", "same-key"), Lookup::Present);
    }
}
