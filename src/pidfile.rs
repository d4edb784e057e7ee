//! Pid-file bookkeeping.
//!
//! The pid file exists purely for external process managers; nothing in
//! the supervisor consults it. It is removed on every exit path via the
//! drop guard.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

/// Create the pid file's directory and hand it to the unprivileged
/// identity. Must run before privileges are dropped.
pub fn prepare_runtime_dir(pid_file: &Path, uid: u32, gid: u32) -> io::Result<()> {
    if let Some(dir) = pid_file.parent() {
        fs::create_dir_all(dir)?;
        std::os::unix::fs::chown(dir, Some(uid), Some(gid))?;
    }
    Ok(())
}

/// Guard for the supervisor's pid file.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current pid. The file is removed when the guard drops.
    pub fn create(path: &Path) -> io::Result<Self> {
        fs::write(path, std::process::id().to_string())?;
        debug!(path = %path.display(), "wrote pid file");
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
