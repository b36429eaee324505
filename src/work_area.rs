//! Request-scoped scratch directory
//!
//! Each issuance gets its own [`WorkArea`]. The private key, CSR, signed
//! certificate and the bundle are written there. Dropping the work area
//! zero-fills the private key file and removes the directory, so the
//! cleanup runs on success, on error return, and on panic unwinding alike.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::warn;

const KEY_FILE: &str = "key.pem";
const CSR_FILE: &str = "req.csr";
const CERT_FILE: &str = "cert.pem";
const BUNDLE_FILE: &str = "bundle.p12";

pub struct WorkArea {
    dir: TempDir,
}

impl WorkArea {
    /// Create a private (0700) scratch directory under `root`
    pub fn create_in(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("issue-").tempdir_in(root)?;
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn key_path(&self) -> PathBuf {
        self.dir.path().join(KEY_FILE)
    }

    pub fn csr_path(&self) -> PathBuf {
        self.dir.path().join(CSR_FILE)
    }

    pub fn cert_path(&self) -> PathBuf {
        self.dir.path().join(CERT_FILE)
    }

    pub fn bundle_path(&self) -> PathBuf {
        self.dir.path().join(BUNDLE_FILE)
    }

}

impl Drop for WorkArea {
    fn drop(&mut self) {
        scrub_key(&self.key_path());
        // TempDir removes the directory once this returns
    }
}

/// Zero-fill a private key file in place; a missing file is fine
fn scrub_key(key_path: &Path) {
    let len = match fs::metadata(key_path) {
        Ok(meta) => meta.len(),
        Err(_) => return,
    };
    let result = OpenOptions::new()
        .write(true)
        .open(key_path)
        .and_then(|mut file| {
            file.write_all(&vec![0u8; len as usize])?;
            file.sync_all()
        });
    if let Err(e) = result {
        warn!(path = %key_path.display(), error = %e, "Failed to scrub private key file");
    }
}

/// Scrub and remove work areas a previous process left under `root`
///
/// Only called before any request runs, so every directory found is stale.
pub fn purge_stale(root: &Path) -> usize {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(path = %root.display(), error = %e, "Cannot scan work directory");
            return 0;
        }
    };
    let mut removed = 0;
    for dir in entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
    {
        scrub_key(&dir.join(KEY_FILE));
        match fs::remove_dir_all(&dir) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %dir.display(), error = %e, "Failed to remove stale work area"),
        }
    }
    removed
}

/// Write secret material readable by the owner only
pub fn write_secret_file(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
