//! Single-instance lock backed by a pid file

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("dockwall already running with pid {pid} (lock {})", path.display())]
    AlreadyRunning { pid: i32, path: PathBuf },

    #[error("pid file {}: {source}", path.display())]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("pid file {} does not hold a pid: {content:?}", path.display())]
    CorruptPidFile { path: PathBuf, content: String },

    #[error("failed to signal pid {pid}: {source}")]
    SignalDelivery {
        pid: i32,
        #[source]
        source: Errno,
    },
}

/// Read the pid recorded at `path`; `None` when there is no file.
pub fn read_pid(path: &Path) -> Result<Option<i32>, LifecycleError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(LifecycleError::PidFile {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    content
        .trim()
        .parse::<i32>()
        .map(Some)
        .map_err(|_| LifecycleError::CorruptPidFile {
            path: path.to_path_buf(),
            content,
        })
}

/// Whether `pid` names a live process. A process we may not signal
/// (EPERM) still counts as alive.
pub fn process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Held while the daemon owns the chain; the pid file is removed on drop.
#[derive(Debug)]
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    /// Record our pid at `path`, failing if another live process holds it.
    pub fn acquire(path: &Path) -> Result<Self, LifecycleError> {
        let own = std::process::id() as i32;
        match read_pid(path) {
            Ok(Some(pid)) if pid != own && process_alive(pid) => {
                return Err(LifecycleError::AlreadyRunning {
                    pid,
                    path: path.to_path_buf(),
                });
            }
            Ok(Some(pid)) => warn!("Removing stale pid file {} (pid {pid})", path.display()),
            Ok(None) => {}
            Err(LifecycleError::CorruptPidFile { content, .. }) => {
                warn!("Overwriting unreadable pid file {} ({content:?})", path.display())
            }
            Err(e) => return Err(e),
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|source| LifecycleError::PidFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            }
        }
        fs::write(path, own.to_string()).map_err(|source| LifecycleError::PidFile {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Wrote pid {own} to {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed pid file {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove pid file {}: {e}", self.path.display()),
        }
    }
}
