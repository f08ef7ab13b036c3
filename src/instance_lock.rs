use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Prevents two workers for the same durable consumer from running on one host.
///
/// Holds an exclusive `flock` on `<runtime dir>/<name>.lock` until dropped.
pub struct InstanceLock {
    lock_file: File,
    lock_path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock in the runtime directory (`XDG_RUNTIME_DIR`, else temp)
    pub fn new(name: &str) -> Result<Self> {
        Self::acquire_in(&Self::runtime_dir(), name)
    }

    /// Acquire the lock in an explicit directory
    pub fn acquire_in(dir: &Path, name: &str) -> Result<Self> {
        std::fs::create_dir_all(dir).context("Failed to create lock directory")?;
        let lock_path = dir.join(format!("{}.lock", name));

        let mut lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .context("Failed to open lock file")?;

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = lock_file.as_raw_fd();
            let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
            if result != 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    anyhow::bail!(
                        "Another message-log worker is already running. Lock file: {}",
                        lock_path.display()
                    );
                }
                return Err(err).context("Failed to acquire lock");
            }
        }

        // Only truncate once the lock is ours, so the holder's PID stays readable
        lock_file.set_len(0).context("Failed to truncate lock file")?;
        let pid = std::process::id();
        writeln!(lock_file, "{}", pid).context("Failed to write PID to lock file")?;

        info!("Acquired instance lock at {}", lock_path.display());
        debug!("Process ID: {}", pid);

        Ok(Self {
            lock_file,
            lock_path,
        })
    }

    fn runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir())
    }

    pub fn path(&self) -> &Path {
        &self.lock_path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        // Unlink while still holding the lock, so nobody can lock the old
        // inode after a newcomer has created a fresh file at the same path
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            warn!("Failed to remove lock file: {}", e);
        }

        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let fd = self.lock_file.as_raw_fd();
            unsafe {
                libc::flock(fd, libc::LOCK_UN);
            }
        }

        debug!("Released instance lock at {}", self.lock_path.display());
    }
}
