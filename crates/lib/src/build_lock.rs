//! Exclusive lock over an output directory.
//!
//! Two builds writing the same rootfs would corrupt each other, so a build
//! holds an advisory lock on `<output>/.lock` for its whole duration. The
//! lock file carries a [`LockHolder`] record so a blocked build can say who
//! is in the way.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const LOCK_FILENAME: &str = ".lock";

/// Who holds an output directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
  pub pid: u32,
  pub command: String,
  pub output: PathBuf,
  pub since_unix: u64,
}

impl fmt::Display for LockHolder {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "'{}' (PID {}, since unix time {})", self.command, self.pid, self.since_unix)
  }
}

#[derive(Debug, Error)]
pub enum BuildLockError {
  #[error(
    "output directory is in use by {}\nremove {} if no strata build is running",
    .holder.as_ref().map_or_else(|| "another build".to_string(), |h| h.to_string()),
    .lock_path.display()
  )]
  Busy {
    holder: Option<LockHolder>,
    lock_path: PathBuf,
  },

  #[error("failed to {action} {}: {source}", .path.display())]
  Io {
    action: &'static str,
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

fn io_err<'a>(action: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> BuildLockError + 'a {
  move |source| BuildLockError::Io {
    action,
    path: path.to_path_buf(),
    source,
  }
}

/// Held for the lifetime of a build; dropping it releases the lock.
pub struct BuildLock {
  file: File,
  lock_path: PathBuf,
}

impl BuildLock {
  /// Take the lock on `output`, creating the directory if needed. Fails
  /// immediately with [`BuildLockError::Busy`] if another build holds it.
  pub fn acquire(output: &Path, command: &str) -> Result<Self, BuildLockError> {
    std::fs::create_dir_all(output).map_err(io_err("create", output))?;

    let lock_path = output.join(LOCK_FILENAME);
    let file = OpenOptions::new()
      .read(true)
      .write(true)
      .create(true)
      .truncate(false)
      .open(&lock_path)
      .map_err(io_err("open", &lock_path))?;

    match try_lock_exclusive(&file) {
      Ok(()) => {}
      Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
        return Err(BuildLockError::Busy {
          holder: read_holder(&lock_path),
          lock_path,
        });
      }
      Err(e) => return Err(io_err("lock", &lock_path)(e)),
    }

    let holder = LockHolder {
      pid: std::process::id(),
      command: command.to_string(),
      output: output.to_path_buf(),
      since_unix: SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs(),
    };
    write_holder(&file, &holder).map_err(io_err("write", &lock_path))?;
    debug!(path = ?lock_path, "output lock acquired");

    Ok(BuildLock { file, lock_path })
  }

  /// The record this lock wrote. Read through the held handle because a
  /// second open fails on Windows, where the lock is mandatory.
  pub fn holder(&self) -> io::Result<LockHolder> {
    let mut file = &self.file;
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).map_err(io::Error::other)
  }

  pub fn lock_path(&self) -> &Path {
    &self.lock_path
  }
}

fn write_holder(mut file: &File, holder: &LockHolder) -> io::Result<()> {
  file.set_len(0)?;
  file.seek(SeekFrom::Start(0))?;
  let json = serde_json::to_vec_pretty(holder).map_err(io::Error::other)?;
  file.write_all(&json)?;
  file.flush()
}

fn read_holder(lock_path: &Path) -> Option<LockHolder> {
  let contents = std::fs::read_to_string(lock_path).ok()?;
  serde_json::from_str(&contents).ok()
}

#[cfg(unix)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use rustix::fs::{FlockOperation, flock};
  use std::os::unix::io::AsFd;

  flock(file.as_fd(), FlockOperation::NonBlockingLockExclusive)
    .map_err(|e| io::Error::from_raw_os_error(e.raw_os_error()))
}

#[cfg(windows)]
fn try_lock_exclusive(file: &File) -> io::Result<()> {
  use std::os::windows::io::AsRawHandle;
  use windows_sys::Win32::Foundation::HANDLE;
  use windows_sys::Win32::Storage::FileSystem::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY, LockFileEx};

  let handle = file.as_raw_handle() as HANDLE;

  // SAFETY: the handle is valid for the life of `file` and a zeroed
  // OVERLAPPED requests a lock starting at offset 0.
  let ok = unsafe {
    let mut overlapped = std::mem::zeroed();
    LockFileEx(
      handle,
      LOCKFILE_FAIL_IMMEDIATELY | LOCKFILE_EXCLUSIVE_LOCK,
      0,
      1,
      0,
      &mut overlapped,
    )
  };

  if ok == 0 {
    Err(io::Error::last_os_error())
  } else {
    Ok(())
  }
}
