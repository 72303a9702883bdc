//! Shared-host port allocation.
//!
//! Every user on the host gets a stable TCP port for their RStudio Server
//! instance out of one shared range. There is no coordinating daemon: the
//! reservation registry is a world-writable directory where each port is
//! claimed with an exclusive `mkdir`, and each user remembers their port in a
//! private assignment file under their state directory.
//!
//! ## Allocation
//!
//! - An explicit override port is returned as-is.
//! - A persisted port is reused when nothing else holds it. If one of the
//!   caller's own stale servers is listening on it, that server is terminated
//!   and the port is kept.
//! - If another (or an unidentified) user holds the persisted port, the
//!   [`ConflictPolicy`] decides between re-allocating and failing.
//! - Otherwise the range is scanned upward and the first port that is neither
//!   listening nor claimed is taken.

mod allocator;
mod assignment;
mod error;
mod host;
mod identity;
mod registry;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub use allocator::{Allocation, AllocationSource, PortAllocator};
pub use assignment::AssignmentStore;
pub use error::{PortError, PortResult};
pub use host::{Host, Listener, SystemHost};
pub use identity::Identity;
pub use registry::{ClaimOutcome, ClaimRecord, Registry, RegistryEntry};

/// Lowest port handed out by default.
pub const DEFAULT_PORT_MIN: u16 = 8800;
/// Highest port handed out by default.
pub const DEFAULT_PORT_MAX: u16 = 8899;

/// Closed interval of allocatable ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub min: u16,
    pub max: u16,
}

impl PortRange {
    pub fn new(min: u16, max: u16) -> PortResult<Self> {
        if min == 0 || min > max {
            return Err(PortError::InvalidRange { min, max });
        }
        Ok(Self { min, max })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }

    /// Ports in scan order.
    pub fn ports(self) -> impl Iterator<Item = u16> {
        self.min..=self.max
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

/// What to do when the persisted port is held by someone else.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Drop the old port and allocate a new one.
    #[default]
    Reallocate,
    /// Fail and leave the assignment untouched for an operator to sort out.
    Strict,
}

/// Port allocation settings (`[ports]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    /// First port of the shared range.
    pub min: u16,
    /// Last port of the shared range (inclusive).
    pub max: u16,
    /// Behaviour when the persisted port belongs to another user.
    pub conflict_policy: ConflictPolicy,
    /// Connect timeout for the liveness probe, in milliseconds.
    pub probe_timeout_ms: u64,
    /// How long to wait for a terminated stale server to release its port.
    pub grace_period_ms: u64,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            min: DEFAULT_PORT_MIN,
            max: DEFAULT_PORT_MAX,
            conflict_policy: ConflictPolicy::default(),
            probe_timeout_ms: 200,
            grace_period_ms: 3000,
        }
    }
}

impl PortsConfig {
    pub fn range(&self) -> PortResult<PortRange> {
        PortRange::new(self.min, self.max)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}
