//! Per-pool cache of ranges this node believes it owns.
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/<pool>/rangeset_cache   one "<start>-<end>" entry per line
//! <data_dir>/<pool>/.lock            advisory lock for rewrites
//! ```
//!
//! Every mutation rewrites the whole file to a temporary sibling, syncs it,
//! and renames it over the original while holding the pool's file lock, so a
//! crash leaves either the old or the new contents.

use super::lock::FileLock;
use crate::addr::AddressRange;
use crate::error::{IpamError, IpamResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Cache file name inside each pool directory.
pub const CACHE_FILE: &str = "rangeset_cache";

const LOCK_FILE: &str = ".lock";

/// On-disk cache of owned ranges, one file per pool.
#[derive(Debug, Clone)]
pub struct LocalCacheStore {
    data_dir: PathBuf,
}

impl LocalCacheStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn pool_dir(&self, pool: &str) -> PathBuf {
        self.data_dir.join(pool)
    }

    pub fn cache_path(&self, pool: &str) -> PathBuf {
        self.pool_dir(pool).join(CACHE_FILE)
    }

    /// Cached ranges of `pool` in file order. A missing file is empty.
    pub fn load(&self, pool: &str) -> IpamResult<Vec<AddressRange>> {
        let path = self.cache_path(pool);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IpamError::local(&path, e)),
        };
        Ok(parse_entries(&path, &content))
    }

    /// Add `range` to the cache. Fails if it overlaps a cached range.
    pub fn append(&self, pool: &str, range: AddressRange) -> IpamResult<()> {
        let _lock = self.lock_pool(pool)?;
        let mut entries = self.load(pool)?;
        if let Some(existing) = entries.iter().find(|e| e.overlaps(&range)) {
            return Err(IpamError::local(
                self.cache_path(pool),
                format!("{} overlaps cached range {}", range, existing),
            ));
        }
        entries.push(range);
        self.write_entries(pool, &entries)?;
        tracing::debug!(pool = %pool, range = %range, "cached range");
        Ok(())
    }

    /// Remove the first cached range overlapping `range`. Returns the removed
    /// entry, if any.
    pub fn delete(&self, pool: &str, range: AddressRange) -> IpamResult<Option<AddressRange>> {
        let _lock = self.lock_pool(pool)?;
        let mut entries = self.load(pool)?;
        let Some(index) = entries.iter().position(|e| e.overlaps(&range)) else {
            return Ok(None);
        };
        let removed = entries.remove(index);
        self.write_entries(pool, &entries)?;
        tracing::debug!(pool = %pool, range = %removed, "removed cached range");
        Ok(Some(removed))
    }

    /// Pools that have a cache file, sorted by name.
    pub fn pools(&self) -> IpamResult<Vec<String>> {
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IpamError::local(&self.data_dir, e)),
        };
        let mut pools = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| IpamError::local(&self.data_dir, e))?;
            if entry.path().join(CACHE_FILE).is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    pools.push(name.to_string());
                }
            }
        }
        pools.sort();
        Ok(pools)
    }

    /// Cached ranges of `pool` clipped to `bounds`.
    pub fn ranges_within(&self, pool: &str, bounds: AddressRange) -> IpamResult<Vec<AddressRange>> {
        Ok(self
            .load(pool)?
            .iter()
            .filter_map(|range| range.intersect(&bounds))
            .collect())
    }

    /// Last modification time of the pool's cache file.
    pub fn modified(&self, pool: &str) -> Option<SystemTime> {
        fs::metadata(self.cache_path(pool))
            .and_then(|m| m.modified())
            .ok()
    }

    fn lock_pool(&self, pool: &str) -> IpamResult<FileLock> {
        let dir = self.pool_dir(pool);
        fs::create_dir_all(&dir).map_err(|e| IpamError::local(&dir, e))?;
        let path = dir.join(LOCK_FILE);
        FileLock::acquire(&path).map_err(|e| IpamError::local(&path, e))
    }

    fn write_entries(&self, pool: &str, entries: &[AddressRange]) -> IpamResult<()> {
        let path = self.cache_path(pool);
        let temp_path = self.pool_dir(pool).join(format!("{}.tmp", CACHE_FILE));

        let mut content = String::new();
        for entry in entries {
            content.push_str(&entry.to_string());
            content.push('\n');
        }

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp_path, &path)
        };
        write().map_err(|e| IpamError::local(&path, e))
    }
}

fn parse_entries(path: &Path, content: &str) -> Vec<AddressRange> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<AddressRange>() {
            Ok(range) => Some(range),
            Err(e) => {
                tracing::warn!(path = %path.display(), line = %line, error = %e, "skipping malformed cache entry");
                None
            }
        })
        .collect()
}
