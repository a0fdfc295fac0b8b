//! Detaching from the terminal.
//!
//! Runs after the listeners are bound (so bind errors still reach the
//! terminal) and before the runtime exists: forking a multi-threaded
//! process is not safe.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;
use crate::error::ServeError;

/// Pid file removed when the daemon exits.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let mut file = File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fork; the parent exits at once and the child returns.
fn fork_and_exit_parent() -> std::io::Result<()> {
    match unsafe { libc::fork() } {
        -1 => Err(std::io::Error::last_os_error()),
        0 => Ok(()),
        _ => unsafe { libc::_exit(0) },
    }
}

fn redirect(from: &File, to: libc::c_int) -> std::io::Result<()> {
    if unsafe { libc::dup2(from.as_raw_fd(), to) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Double-fork into a new session with stdio redirected.
///
/// Returns in the daemon (grandchild) process; the original process exits
/// with status 0. The working directory is kept so relative paths in the
/// configuration still resolve for re-executed workers.
pub fn daemonize(config: &DaemonConfig) -> Result<Option<PidFile>, ServeError> {
    // Open everything first so failures are still reported on the terminal.
    let stdin = File::open("/dev/null").map_err(ServeError::Daemonize)?;
    let output = match &config.log_file {
        Some(path) => OpenOptions::new().create(true).append(true).open(path),
        None => OpenOptions::new().write(true).open("/dev/null"),
    }
    .map_err(ServeError::Daemonize)?;

    fork_and_exit_parent().map_err(ServeError::Daemonize)?;
    if unsafe { libc::setsid() } == -1 {
        return Err(ServeError::Daemonize(std::io::Error::last_os_error()));
    }
    fork_and_exit_parent().map_err(ServeError::Daemonize)?;
    unsafe {
        libc::umask(0o022);
    }

    redirect(&stdin, libc::STDIN_FILENO).map_err(ServeError::Daemonize)?;
    redirect(&output, libc::STDOUT_FILENO).map_err(ServeError::Daemonize)?;
    redirect(&output, libc::STDERR_FILENO).map_err(ServeError::Daemonize)?;

    config
        .pid_file
        .as_deref()
        .map(PidFile::create)
        .transpose()
        .map_err(ServeError::Daemonize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hx.pid");
        {
            let pid_file = PidFile::create(&path).unwrap();
            assert_eq!(pid_file.path(), path);
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents.trim(), std::process::id().to_string());
        }
        assert!(!path.exists());
    }
}
