use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::SetupError;

/// Exclusive advisory lock over runtime environment creation. Released when
/// dropped, on success and failure paths alike.
#[derive(Debug)]
pub struct EnvLock {
    file: File,
    path: PathBuf,
}

impl EnvLock {
    /// Lock file that guards `<parent>/<env-name>`.
    pub fn path_for(env_path: &Path) -> Option<PathBuf> {
        let parent = env_path.parent()?;
        let name = env_path.file_name()?.to_string_lossy();
        Some(parent.join(format!(".{name}.lock")))
    }

    /// Never blocks: a lock held by another run is `EnvironmentBusy`.
    pub fn try_acquire(path: &Path) -> Result<Self, SetupError> {
        let file = open_lock_file(path).map_err(|err| {
            SetupError::EnvironmentCreation(format!(
                "cannot open lock file {}: {}",
                path.display(),
                err
            ))
        })?;
        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Err(SetupError::EnvironmentBusy(format!(
                    "another setup run is creating the runtime environment \
                     (lock {} is held); retry once it finishes",
                    path.display()
                )));
            }
            return Err(SetupError::EnvironmentCreation(format!(
                "cannot lock {}: {}",
                path.display(),
                err
            )));
        }
        // The holder's pid replaces whatever an earlier holder left behind.
        // A read-only handle cannot record it, which leaves the lock intact.
        let mut writer = &file;
        if file.set_len(0).is_ok()
            && writer
                .write_all(std::process::id().to_string().as_bytes())
                .is_ok()
        {
            let _ = writer.flush();
        }
        debug!(lock = %path.display(), "acquired environment lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
    {
        // A lock file left by another user can still be flocked read-only.
        Err(err) if err.kind() == io::ErrorKind::PermissionDenied && path.exists() => {
            OpenOptions::new().read(true).open(path)
        }
        other => other,
    }
}

impl Drop for EnvLock {
    fn drop(&mut self) {
        // SAFETY: the descriptor is still open; unlocking cannot violate memory safety.
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        debug!(lock = %self.path.display(), "released environment lock");
    }
}
