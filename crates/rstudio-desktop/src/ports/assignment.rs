//! Per-user assignment record.
//!
//! A single decimal port in a file only the owner can read or write. It is the
//! durable memory of which port belongs to the user; nothing here deletes it
//! except an explicit `forget`.

use log::{debug, warn};
use std::fs;
use std::io::{ErrorKind, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{PortError, PortRange, PortResult};

/// File name of the assignment record inside the state directory.
pub const ASSIGNMENT_FILE: &str = "port";

#[derive(Debug, Clone)]
pub struct AssignmentStore {
    path: PathBuf,
}

impl AssignmentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store rooted in a state directory.
    pub fn in_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join(ASSIGNMENT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn error(&self, source: std::io::Error) -> PortError {
        PortError::Assignment {
            path: self.path.clone(),
            source,
        }
    }

    /// The persisted port, if there is a usable one.
    ///
    /// Unparsable content and ports outside `range` are reported and treated
    /// as no assignment.
    pub fn load(&self, range: PortRange) -> PortResult<Option<u16>> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                return Ok(None);
            }
            Err(e) => return Err(PortError::Io(e)),
        };

        let port = match text.trim().parse::<u16>() {
            Ok(port) => port,
            Err(_) => {
                warn!(
                    "Ignoring unreadable port assignment in {}: {:?}",
                    self.path.display(),
                    text.trim()
                );
                return Ok(None);
            }
        };

        if !range.contains(port) {
            warn!(
                "Persisted port {} is outside the range {}, allocating a new one",
                port, range
            );
            return Ok(None);
        }

        Ok(Some(port))
    }

    /// Persist `port`, replacing any previous record.
    ///
    /// Each call writes its own owner-only temp file next to the record and
    /// renames it into place, so concurrent saves never share a scratch file.
    pub fn save(&self, port: u16) -> PortResult<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)
            .map_err(|e| self.error(e))?;

        // NamedTempFile is created 0600 on unix.
        let mut tmp = NamedTempFile::with_prefix_in(".port", parent).map_err(|e| self.error(e))?;
        writeln!(tmp, "{port}").map_err(|e| self.error(e))?;
        tmp.as_file().sync_all().map_err(|e| self.error(e))?;
        tmp.persist(&self.path).map_err(|e| self.error(e.error))?;

        debug!("Persisted port {} to {}", port, self.path.display());
        Ok(())
    }

    /// Delete the record. Returns whether one existed.
    pub fn forget(&self) -> PortResult<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.error(e)),
        }
    }
}
