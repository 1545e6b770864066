//! Process-wide mutual exclusion via an exclusive advisory lock on a
//! well-known file under the cache dir (flock on Unix, LockFileEx on
//! Windows). A lock acquired here is parked for the life of the process and
//! never released on the success path.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::warn;

static HELD_LOCKS: OnceLock<Mutex<Vec<File>>> = OnceLock::new();

/// True iff another holder already owns the lock for `name`
pub fn is_another_instance_running(name: &str) -> bool {
    is_another_instance_running_at(&lemonade_catalog::paths::cache_dir(), name)
}

pub fn is_another_instance_running_at(lock_dir: &Path, name: &str) -> bool {
    if let Err(e) = std::fs::create_dir_all(lock_dir) {
        warn!("Could not create lock dir {}: {}", lock_dir.display(), e);
        return false;
    }
    let lock_path = lock_dir.join(format!("lemonade_{}.lock", name));

    let file = match OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
    {
        Ok(file) => file,
        Err(e) => {
            warn!("Could not open lock file {}: {}", lock_path.display(), e);
            return false;
        }
    };

    match file.try_lock_exclusive() {
        Ok(()) => {
            // Park the handle so the lock lives as long as the process
            HELD_LOCKS
                .get_or_init(|| Mutex::new(Vec::new()))
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .push(file);
            false
        }
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => true,
        Err(e) => {
            warn!("Lock acquisition on {} failed: {}", lock_path.display(), e);
            false
        }
    }
}
