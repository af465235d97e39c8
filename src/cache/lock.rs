//! Per-key advisory locks.
//!
//! A lock is an OS file lock on a small file next to the canonical location.
//! It only avoids duplicate computation; correctness rests on atomic publish.
//! The kernel drops the lock when its holder exits, so a crashed worker never
//! blocks later runs. Lock files are left in place: unlinking one while a
//! waiter holds it open would let two holders lock different inodes.

use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use fs2::FileExt;
use tracing::{debug, warn};

/// Held while computing one key. Unlocks on drop.
#[derive(Debug)]
pub(crate) struct KeyLock {
    file: File,
    path: PathBuf,
}

impl KeyLock {
    /// Blocks until the lock at `path` is ours.
    pub(crate) fn acquire(path: &Path) -> io::Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if file.try_lock_exclusive().is_err() {
            debug!(lock = %path.display(), "waiting for artifact lock");
            file.lock_exclusive()?;
        }

        // Holder pid.
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!(lock = %self.path.display(), error = %e, "failed to release artifact lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::{
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::{Duration, Instant},
    };

    use tempfile::TempDir;

    #[test]
    fn lock_file_records_the_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e1.seg.lock");

        let lock = KeyLock::acquire(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());
        drop(lock);
    }

    #[test]
    fn second_holder_waits_for_release() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e1.seg.lock");
        let released = Arc::new(AtomicBool::new(false));

        let first = KeyLock::acquire(&path).unwrap();
        let waiter = {
            let path = path.clone();
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let _second = KeyLock::acquire(&path).unwrap();
                released.load(Ordering::SeqCst)
            })
        };

        thread::sleep(Duration::from_millis(150));
        released.store(true, Ordering::SeqCst);
        drop(first);

        assert!(waiter.join().unwrap(), "acquired before release");
    }

    #[test]
    fn holders_never_overlap() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e1.seg.lock");
        let inside = Arc::new(AtomicBool::new(false));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let path = path.clone();
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    for _ in 0..5 {
                        let _lock = KeyLock::acquire(&path).unwrap();
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        thread::sleep(Duration::from_millis(5));
                        inside.store(false, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }

    #[test]
    fn lock_of_a_closed_handle_is_reacquired_at_once() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("e1.seg.lock");

        // A holder that goes away without unlocking, as a crashed worker does.
        let abandoned = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .unwrap();
        abandoned.lock_exclusive().unwrap();
        drop(abandoned);
        assert!(path.exists());

        let start = Instant::now();
        let _lock = KeyLock::acquire(&path).unwrap();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
