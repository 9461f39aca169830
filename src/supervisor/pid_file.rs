//! PID file for the supervised `serve` process.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// A single pid stored as decimal text.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// The recorded pid.  A missing or unparsable file reads as `None`.
    pub fn read(&self) -> Option<u32> {
        let content = fs::read_to_string(&self.path).ok()?;
        match content.trim().parse() {
            Ok(pid) => Some(pid),
            Err(_) => {
                log::warn!("supervisor: ignoring malformed PID file {}", self.path.display());
                None
            }
        }
    }

    /// Record `pid`, creating parent directories as needed.
    pub fn write(&self, pid: u32) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, format!("{pid}\n"))
    }

    /// Remove the file.  Already gone is fine.
    pub fn remove(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_remove() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = PidFile::new(dir.path().join("run").join("serve.pid"));

        assert!(!pid_file.exists());
        assert_eq!(pid_file.read(), None);

        pid_file.write(4242).unwrap();
        assert!(pid_file.exists());
        assert_eq!(pid_file.read(), Some(4242));

        pid_file.remove().unwrap();
        assert!(!pid_file.exists());
        pid_file.remove().unwrap();
    }

    #[test]
    fn garbage_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("serve.pid");
        fs::write(&path, "not a pid").unwrap();
        assert_eq!(PidFile::new(path).read(), None);
    }
}
