//! Single-instance lock on `<data_dir>/gateway.lock`.
//!
//! The lock is an advisory exclusive file lock (`fd-lock`); the file also
//! records the owner's PID so a second process can say who holds it. The
//! OS drops the lock when the file is closed, so a crashed gateway never
//! leaves a stale lock behind.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use {
    fd_lock::RwLock,
    tokio::time::Instant,
    tracing::{debug, info},
};

use crate::error::LockError;

/// Pause between attempts while waiting for a predecessor to exit.
const RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Held for as long as this process is the gateway.
pub struct InstanceLock {
    path: PathBuf,
    file: Option<RwLock<File>>,
}

impl std::fmt::Debug for InstanceLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceLock")
            .field("path", &self.path)
            .field("held", &self.file.is_some())
            .finish()
    }
}

impl InstanceLock {
    pub const FILE_NAME: &'static str = "gateway.lock";

    /// Take the lock in `dir`, retrying for up to `wait` while another
    /// process holds it. A zero `wait` fails on the first conflict.
    pub async fn acquire(dir: &Path, wait: Duration) -> Result<Self, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            match Self::try_acquire(dir) {
                Err(LockError::AlreadyRunning { pid, .. }) if Instant::now() < deadline => {
                    debug!(?pid, "instance lock busy, retrying");
                    tokio::time::sleep(RETRY_INTERVAL).await;
                },
                result => return result,
            }
        }
    }

    /// Single non-blocking attempt.
    pub fn try_acquire(dir: &Path) -> Result<Self, LockError> {
        let path = dir.join(Self::FILE_NAME);
        let io_err = |source: io::Error| LockError::Io {
            path: path.clone(),
            source,
        };

        std::fs::create_dir_all(dir).map_err(io_err)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(io_err)?;

        let mut lock = RwLock::new(file);
        match lock.try_write() {
            Ok(mut guard) => {
                write_pid(&mut guard).map_err(io_err)?;
                // The lock lives as long as the open file, not the guard.
                std::mem::forget(guard);
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                return Err(LockError::AlreadyRunning {
                    pid: read_pid(&path),
                    path,
                });
            },
            Err(e) => return Err(io_err(e)),
        }

        info!(path = %path.display(), pid = std::process::id(), "instance lock acquired");
        Ok(Self {
            path,
            file: Some(lock),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Give the lock up now instead of at drop.
    pub fn release(mut self) {
        self.unlock();
    }

    fn unlock(&mut self) {
        if let Some(file) = self.file.take() {
            drop(file);
            info!(path = %self.path.display(), "instance lock released");
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    write!(file, "{}", std::process::id())?;
    file.flush()
}

fn read_pid(path: &Path) -> Option<u32> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}
