//! Advisory lock guarding the check-then-append sequence of a batch cycle.
//!
//! SQLite's `BEGIN IMMEDIATE` already serializes writers inside one store,
//! but two `stitch ingest` processes would otherwise both stage the same
//! files before either merges. The ingest lock sits next to the store file
//! (`<store>.lock`) and is held for the whole cycle. While held, the file
//! names its holder (`pid=<pid> since=<rfc3339>`) so a contending process
//! can say who it waited for.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use crate::error::ErrorCode;

/// Polling interval while waiting for a held lock.
const RETRY_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Another process kept the lock past the caller's timeout.
    #[error("{}: ingest lock at {} still held after {waited:?}{}", ErrorCode::LockContention.code(), .path.display(), holder_suffix(.holder.as_deref()))]
    Timeout {
        path: PathBuf,
        waited: Duration,
        holder: Option<String>,
    },

    #[error("{}: {0}", ErrorCode::LockIoError.code())]
    Io(#[from] io::Error),
}

fn holder_suffix(holder: Option<&str>) -> String {
    holder.map_or_else(String::new, |h| format!(" (holder: {h})"))
}

impl LockError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::Io(_) => ErrorCode::LockIoError,
        }
    }

    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Lock file path for a store database: `<store>.lock` in the same directory.
#[must_use]
pub fn lock_path_for(store_path: &Path) -> PathBuf {
    let mut name = store_path
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".lock");
    store_path.with_file_name(name)
}

/// Exclusive ingest lock. Released (and its holder line cleared) on drop.
#[derive(Debug)]
pub struct IngestLock {
    file: File,
    path: PathBuf,
}

impl IngestLock {
    /// Take the lock at `path`, retrying until `timeout` elapses.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] if the lock stays held past `timeout`,
    /// [`LockError::Io`] if the lock file cannot be created or written.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self, LockError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;

        let deadline = Instant::now() + timeout;
        let started = Instant::now();
        while file.try_lock_exclusive().is_err() {
            if Instant::now() >= deadline {
                let holder = read_holder(&mut file);
                tracing::warn!(
                    path = %path.display(),
                    holder = holder.as_deref().unwrap_or("unknown"),
                    "ingest lock contention"
                );
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: started.elapsed(),
                    holder,
                });
            }
            thread::sleep(RETRY_INTERVAL);
        }

        write_holder(&mut file)?;
        tracing::debug!(path = %path.display(), "ingest lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IngestLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    let line = format!(
        "pid={} since={}\n",
        std::process::id(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(line.as_bytes())?;
    file.flush()
}

fn read_holder(file: &mut File) -> Option<String> {
    let mut text = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut text).ok()?;
    let line = text.trim();
    (!line.is_empty()).then(|| line.to_string())
}
