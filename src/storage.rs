//! Ephemeral artifact store
//!
//! Maps an opaque download identifier to a bundle on disk and its expiry.
//! Per identifier: `ABSENT → STORED → {DOWNLOADED | EXPIRED} → ABSENT`.
//!
//! - Identifiers are 32 bytes from the OpenSSL CSPRNG, hex encoded.
//! - [`ArtifactStore::take`] removes the index entry before reading the file,
//!   so an identifier yields at most one successful download.
//! - Expired entries are purged before every `put` and `take`, and by the
//!   optional reaper task; an expired entry is never served.
//! - Backing-file deletion is best effort and only logged on failure.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::IssuanceError;
use crate::work_area;

const ID_BYTES: usize = 32;
const ARTIFACT_EXTENSION: &str = "p12";
const WORK_DIR: &str = ".work";

/// Time source, replaceable in tests
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<SystemTime>,
}

impl ManualClock {
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

#[derive(Debug)]
struct IndexEntry {
    path: PathBuf,
    expires_at: SystemTime,
}

pub struct ArtifactStore {
    directory: PathBuf,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    index: Mutex<HashMap<String, IndexEntry>>,
}

impl ArtifactStore {
    /// Open the storage directory, removing bundles left by a previous process
    pub fn open(
        directory: &Path,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, IssuanceError> {
        fs::create_dir_all(directory.join(WORK_DIR)).map_err(|e| {
            IssuanceError::configuration(format!(
                "cannot create storage directory {}: {}",
                directory.display(),
                e
            ))
        })?;

        let store = Self {
            directory: directory.to_path_buf(),
            ttl,
            clock,
            index: Mutex::new(HashMap::new()),
        };
        let stale = store.remove_orphans();
        if stale > 0 {
            info!(count = stale, "Removed artifacts orphaned by a previous run");
        }
        let abandoned = work_area::purge_stale(&store.work_root());
        if abandoned > 0 {
            warn!(count = abandoned, "Scrubbed work areas abandoned by a previous run");
        }
        Ok(store)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Parent directory for per-request work areas, on the same filesystem
    /// as the artifacts so a finished bundle can be renamed into place
    pub fn work_root(&self) -> PathBuf {
        self.directory.join(WORK_DIR)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move a finished bundle into the store and return its download identifier
    pub fn put(&self, artifact: &Path) -> Result<String, IssuanceError> {
        let now = self.clock.now();
        let (download_id, path, expired) = {
            let mut index = self.index.lock();
            let expired = purge_expired(&mut index, now);
            let download_id = loop {
                let candidate = new_download_id()?;
                if !index.contains_key(&candidate) {
                    break candidate;
                }
            };
            let path = self.artifact_path(&download_id);
            index.insert(
                download_id.clone(),
                IndexEntry {
                    path: path.clone(),
                    expires_at: now + self.ttl,
                },
            );
            (download_id, path, expired)
        };
        remove_files(&expired);

        if let Err(e) = fs::rename(artifact, &path) {
            self.index.lock().remove(&download_id);
            return Err(IssuanceError::packaging(format!(
                "cannot store bundle: {}",
                e
            )));
        }
        debug!(ttl_secs = self.ttl.as_secs(), "Stored artifact");
        Ok(download_id)
    }

    /// Retrieve and consume an artifact
    ///
    /// The entry is gone once this returns, whatever the outcome of the read.
    pub fn take(&self, download_id: &str) -> Result<Vec<u8>, IssuanceError> {
        let now = self.clock.now();
        let (entry, expired) = {
            let mut index = self.index.lock();
            let expired = purge_expired(&mut index, now);
            let entry = if is_well_formed_id(download_id) {
                index.remove(download_id)
            } else {
                None
            };
            (entry, expired)
        };
        remove_files(&expired);

        let entry = entry.ok_or(IssuanceError::NotFound)?;
        let read = fs::read(&entry.path);
        remove_files(std::slice::from_ref(&entry.path));

        match read {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!(error = %e, "Artifact vanished from storage before download");
                Err(IssuanceError::NotFound)
            }
        }
    }

    /// Drop every expired entry and its file. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let expired = purge_expired(&mut self.index.lock(), self.clock.now());
        remove_files(&expired);
        expired.len()
    }

    /// Sweep periodically until the store is dropped
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep();
                if removed > 0 {
                    info!(count = removed, "Reaped expired artifacts");
                }
            }
        })
    }

    fn artifact_path(&self, download_id: &str) -> PathBuf {
        self.directory
            .join(format!("{}.{}", download_id, ARTIFACT_EXTENSION))
    }

    fn remove_orphans(&self) -> usize {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Cannot scan storage directory");
                return 0;
            }
        };
        let orphans: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && path.extension().and_then(|ext| ext.to_str()) == Some(ARTIFACT_EXTENSION)
            })
            .collect();
        remove_files(&orphans);
        orphans.len()
    }
}

fn purge_expired(index: &mut HashMap<String, IndexEntry>, now: SystemTime) -> Vec<PathBuf> {
    let expired: Vec<String> = index
        .iter()
        .filter(|(_, entry)| now >= entry.expires_at)
        .map(|(id, _)| id.clone())
        .collect();
    expired
        .into_iter()
        .filter_map(|id| index.remove(&id).map(|entry| entry.path))
        .collect()
}

fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), error = %e, "Failed to delete artifact");
            }
        }
    }
}

fn new_download_id() -> Result<String, IssuanceError> {
    let mut bytes = [0u8; ID_BYTES];
    openssl::rand::rand_bytes(&mut bytes)
        .map_err(|e| IssuanceError::packaging(format!("random source failed: {}", e)))?;
    Ok(hex::encode(bytes))
}

fn is_well_formed_id(download_id: &str) -> bool {
    download_id.len() == ID_BYTES * 2
        && download_id
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
