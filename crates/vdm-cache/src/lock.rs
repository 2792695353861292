use crate::error::{CacheError, Result};
use crate::store::DiskCacheStore;
use fs2::FileExt as _;
use parking_lot::{const_mutex, Condvar, Mutex};
use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

pub(crate) const FILL_LOCK_FILE: &str = ".fill.lock";

/// VistA cache directories with a fill in progress in this process.
static FILLING: Mutex<BTreeSet<PathBuf>> = const_mutex(BTreeSet::new());
static FILL_DONE: Condvar = Condvar::new();

/// Held by a fill while it writes pages into one VistA's cache directory.
///
/// Two fills of the same VistA never overlap: other processes are kept out by an advisory lock
/// on `<label>/.fill.lock`, other threads of this process by a registry of directories being
/// filled (advisory locks do not exclude threads on every platform). Released on drop.
#[derive(Debug)]
pub struct FillLock {
    vista_label: String,
    vista_dir: PathBuf,
    file: File,
}

impl FillLock {
    /// Blocks until no other fill of `vista_label` under `store` is running.
    pub fn acquire(store: &DiskCacheStore, vista_label: &str) -> Result<Self> {
        let dir = store.ensure_vista_directory(vista_label)?;
        // The same cache reached through a relative and an absolute root is still one cache.
        let vista_dir = dir.canonicalize().unwrap_or(dir);

        claim_in_process(&vista_dir, vista_label);
        match lock_file(&vista_dir, vista_label) {
            Ok(file) => Ok(Self {
                vista_label: vista_label.to_owned(),
                vista_dir,
                file,
            }),
            Err(err) => {
                release_in_process(&vista_dir);
                Err(err)
            }
        }
    }

    pub fn vista_label(&self) -> &str {
        &self.vista_label
    }

    pub fn path(&self) -> PathBuf {
        self.vista_dir.join(FILL_LOCK_FILE)
    }
}

impl Drop for FillLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        release_in_process(&self.vista_dir);
    }
}

fn claim_in_process(vista_dir: &Path, vista_label: &str) {
    let mut filling = FILLING.lock();
    if filling.contains(vista_dir) {
        tracing::debug!(
            target = "vdm.cache",
            vista = %vista_label,
            "waiting for another fill of this vista"
        );
        while filling.contains(vista_dir) {
            FILL_DONE.wait(&mut filling);
        }
    }
    filling.insert(vista_dir.to_path_buf());
}

fn release_in_process(vista_dir: &Path) {
    FILLING.lock().remove(vista_dir);
    FILL_DONE.notify_all();
}

fn lock_file(vista_dir: &Path, vista_label: &str) -> Result<File> {
    let path = vista_dir.join(FILL_LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)
        .map_err(|err| CacheError::storage(&path, err))?;
    if file.try_lock_exclusive().is_err() {
        tracing::info!(
            target = "vdm.cache",
            vista = %vista_label,
            lock = %path.display(),
            "another process is filling this vista; waiting"
        );
        file.lock_exclusive()
            .map_err(|err| CacheError::storage(&path, err))?;
    }
    Ok(file)
}
