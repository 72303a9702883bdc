//! Shared reservation registry.
//!
//! One directory per claimed port under a world-writable root. `mkdir` is the
//! claim primitive: exactly one caller can create `<root>/<port>`, everyone
//! else gets `AlreadyExists`. Entries are never cleaned up automatically; they
//! live until their owner releases them.

use chrono::{DateTime, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use super::{Identity, PortError, PortResult};

const OWNER_FILE: &str = "owner.json";

/// Metadata stored inside a registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub user: String,
    pub uid: u32,
    pub hostname: String,
    pub claimed_at: DateTime<Utc>,
}

impl ClaimRecord {
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            user: identity.name.clone(),
            uid: identity.uid,
            hostname: identity.hostname.clone(),
            claimed_at: Utc::now(),
        }
    }

    pub fn is_owned_by(&self, identity: &Identity) -> bool {
        self.user == identity.name && self.uid == identity.uid
    }
}

/// Result of an exclusive claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// We created the entry.
    Claimed,
    /// The entry already existed.
    Taken,
}

/// A claimed port as seen in a listing.
#[derive(Debug, Clone, Serialize)]
pub struct RegistryEntry {
    pub port: u16,
    /// `None` when the entry has no readable metadata.
    pub record: Option<ClaimRecord>,
}

/// Handle to the registry root directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, port: u16) -> PathBuf {
        self.root.join(port.to_string())
    }

    fn registry_error(&self, source: std::io::Error) -> PortError {
        PortError::Registry {
            path: self.root.clone(),
            source,
        }
    }

    /// Create the registry root if needed, world-writable with the sticky bit.
    pub fn ensure(&self) -> PortResult<()> {
        match fs::create_dir(&self.root) {
            Ok(()) => {
                debug!("Created port registry {}", self.root.display());
                // umask strips the bits requested at creation time
                fs::set_permissions(&self.root, fs::Permissions::from_mode(0o1777))
                    .map_err(|e| self.registry_error(e))?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if self.root.is_dir() {
                    Ok(())
                } else {
                    Err(self.registry_error(std::io::Error::new(
                        ErrorKind::AlreadyExists,
                        "registry path exists and is not a directory",
                    )))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => match self.root.parent() {
                Some(parent) if !parent.as_os_str().is_empty() && !parent.exists() => {
                    fs::create_dir_all(parent).map_err(|e| self.registry_error(e))?;
                    self.ensure()
                }
                _ => Err(self.registry_error(e)),
            },
            Err(e) => Err(self.registry_error(e)),
        }
    }

    /// Atomically claim `port` for `record`.
    pub fn claim(&self, port: u16, record: &ClaimRecord) -> PortResult<ClaimOutcome> {
        let path = self.entry_path(port);
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(ClaimOutcome::Taken),
            Err(e) => return Err(self.registry_error(e)),
        }

        self.record_claim(port, &path, record)?;
        debug!("Claimed port {} for {}", port, record.user);
        Ok(ClaimOutcome::Claimed)
    }

    /// Write the owner of a freshly created entry, or undo the entry.
    ///
    /// An entry without an owner counts as foreign to everyone and could never
    /// be released.
    fn record_claim(&self, port: u16, entry: &Path, record: &ClaimRecord) -> PortResult<()> {
        let Err(source) = write_record(entry, record) else {
            return Ok(());
        };
        warn!("Could not record owner of port {}: {}", port, source);
        if let Err(e) = fs::remove_dir_all(entry) {
            warn!("Could not withdraw claim on port {}: {}", port, e);
        }
        Err(PortError::Registry {
            path: entry.to_path_buf(),
            source,
        })
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.entry_path(port).is_dir()
    }

    /// Owner metadata for `port`, if the entry exists and is readable.
    pub fn record(&self, port: u16) -> Option<ClaimRecord> {
        let file = self.entry_path(port).join(OWNER_FILE);
        let text = fs::read_to_string(&file).ok()?;
        match serde_json::from_str(&text) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("Ignoring malformed registry record {}: {}", file.display(), e);
                None
            }
        }
    }

    /// Whether the entry for `port` exists and belongs to `identity`.
    pub fn is_owned_by(&self, port: u16, identity: &Identity) -> bool {
        self.record(port)
            .is_some_and(|record| record.is_owned_by(identity))
    }

    /// Remove the entry for `port` if it belongs to `identity`.
    ///
    /// Returns whether an entry was removed. Entries of other users are left
    /// alone.
    pub fn release(&self, port: u16, identity: &Identity) -> PortResult<bool> {
        if !self.is_owned_by(port, identity) {
            return Ok(false);
        }

        let path = self.entry_path(port);
        match fs::remove_file(path.join(OWNER_FILE)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(self.registry_error(e)),
        }
        match fs::remove_dir(&path) {
            Ok(()) => {
                debug!("Released port {} for {}", port, identity.name);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(self.registry_error(e)),
        }
    }

    /// All entries, sorted by port. Non-numeric names are skipped.
    pub fn entries(&self) -> PortResult<Vec<RegistryEntry>> {
        let dir = match fs::read_dir(&self.root) {
            Ok(dir) => dir,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.registry_error(e)),
        };

        let mut entries: Vec<RegistryEntry> = dir
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u16>().ok())
            .map(|port| RegistryEntry {
                port,
                record: self.record(port),
            })
            .collect();
        entries.sort_by_key(|entry| entry.port);
        Ok(entries)
    }
}

/// Write the owner file via temp file + rename so readers never see a partial
/// record.
fn write_record(entry: &Path, record: &ClaimRecord) -> std::io::Result<()> {
    let body = serde_json::to_string_pretty(record).map_err(std::io::Error::other)?;
    let tmp = entry.join(format!(".{OWNER_FILE}.tmp"));
    fs::write(&tmp, body)?;
    fs::rename(&tmp, entry.join(OWNER_FILE))
}
