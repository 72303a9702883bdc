//! The allocation algorithm.

use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::thread;
use std::time::{Duration, Instant};

use super::{
    AssignmentStore, ClaimOutcome, ClaimRecord, ConflictPolicy, Host, Identity, Listener,
    PortError, PortRange, PortResult, Registry,
};

/// How often to re-probe while waiting for a stopped server to let go.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Where an allocated port came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocationSource {
    /// Supplied by the caller; no coordination took place.
    Override,
    /// The persisted assignment, reused as-is.
    Persisted,
    /// The persisted assignment, recovered by stopping our own stale server.
    Reclaimed,
    /// Newly allocated from the range.
    Fresh,
}

impl fmt::Display for AllocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Override => "override",
            Self::Persisted => "persisted",
            Self::Reclaimed => "reclaimed",
            Self::Fresh => "fresh",
        };
        f.write_str(name)
    }
}

/// A port handed to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub port: u16,
    pub source: AllocationSource,
}

/// Outcome of trying to keep the persisted port.
enum Reuse {
    Kept(AllocationSource),
    /// Someone else holds it; the string describes who.
    Lost(String),
}

/// Assigns one identity a stable port out of a shared range.
#[derive(Debug, Clone)]
pub struct PortAllocator<H> {
    identity: Identity,
    range: PortRange,
    registry: Registry,
    store: AssignmentStore,
    policy: ConflictPolicy,
    grace_period: Duration,
    host: H,
}

impl<H: Host> PortAllocator<H> {
    pub fn new(
        identity: Identity,
        range: PortRange,
        registry: Registry,
        store: AssignmentStore,
        host: H,
    ) -> Self {
        Self {
            identity,
            range,
            registry,
            store,
            policy: ConflictPolicy::default(),
            grace_period: Duration::from_secs(3),
            host,
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &AssignmentStore {
        &self.store
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    /// Return the port this identity's server should listen on.
    ///
    /// An `override_port` is returned unchanged and bypasses the registry and
    /// the assignment record entirely.
    pub fn allocate(&self, override_port: Option<u16>) -> PortResult<Allocation> {
        if let Some(port) = override_port {
            info!("Using explicit port {} for {}", port, self.identity.name);
            return Ok(Allocation {
                port,
                source: AllocationSource::Override,
            });
        }

        self.registry.ensure()?;

        if let Some(port) = self.store.load(self.range)? {
            match self.reuse(port)? {
                Reuse::Kept(source) => {
                    info!("Using {} port {} for {}", source, port, self.identity.name);
                    return Ok(Allocation { port, source });
                }
                Reuse::Lost(holder) => match self.policy {
                    ConflictPolicy::Strict => {
                        return Err(PortError::Conflict { port, holder });
                    }
                    ConflictPolicy::Reallocate => {
                        warn!(
                            "Assigned port {} is held by {}, allocating a new port for {}",
                            port, holder, self.identity.name
                        );
                        self.registry.release(port, &self.identity)?;
                    }
                },
            }
        }

        let (port, outcome) = self.scan()?;
        if let Err(e) = self.store.save(port) {
            // Only undo a claim this call made; an adopted entry may be in use.
            let undone = match outcome {
                ClaimOutcome::Claimed => self.registry.release(port, &self.identity),
                ClaimOutcome::Taken => Ok(false),
            };
            if let Err(release_err) = undone {
                warn!("Failed to release port {} after error: {}", port, release_err);
            }
            return Err(e);
        }

        info!("Allocated port {} for {}", port, self.identity.name);
        Ok(Allocation {
            port,
            source: AllocationSource::Fresh,
        })
    }

    fn record(&self) -> ClaimRecord {
        ClaimRecord::for_identity(&self.identity)
    }

    /// Try to keep the persisted `port`.
    fn reuse(&self, port: u16) -> PortResult<Reuse> {
        if self.registry.is_claimed(port) && !self.registry.is_owned_by(port, &self.identity) {
            return Ok(Reuse::Lost(self.describe_claim(port)));
        }

        if !self.host.is_listening(port) {
            return self.confirm(port, AllocationSource::Persisted);
        }

        let listeners = self.host.listeners(port);
        let ours = !listeners.is_empty()
            && listeners
                .iter()
                .all(|listener| listener.uid == Some(self.identity.uid));
        if !ours {
            return Ok(Reuse::Lost(describe_listeners(&listeners)));
        }

        warn!(
            "Port {} is held by a stale server of {}, stopping it",
            port, self.identity.name
        );
        let mut stopped = Vec::new();
        for listener in &listeners {
            let Some(pid) = listener.pid else { continue };
            if stopped.contains(&pid) {
                continue;
            }
            stopped.push(pid);
            if let Err(e) = self.host.terminate(listener, self.identity.uid) {
                warn!("Could not stop pid {}: {}", pid, e);
            }
        }

        if !self.wait_until_free(port) {
            return Err(PortError::StillOccupied { port });
        }
        self.confirm(port, AllocationSource::Reclaimed)
    }

    /// Make sure the registry entry for a port we are keeping is ours.
    fn confirm(&self, port: u16, source: AllocationSource) -> PortResult<Reuse> {
        match self.registry.claim(port, &self.record())? {
            ClaimOutcome::Claimed => debug!("Recreated registry entry for port {}", port),
            ClaimOutcome::Taken => {
                if !self.registry.is_owned_by(port, &self.identity) {
                    return Ok(Reuse::Lost(self.describe_claim(port)));
                }
            }
        }
        Ok(Reuse::Kept(source))
    }

    /// Scan the range upward for a port that is neither listening nor claimed
    /// by someone else. Also reports whether the entry was created here or
    /// adopted.
    fn scan(&self) -> PortResult<(u16, ClaimOutcome)> {
        let record = self.record();

        for port in self.range.ports() {
            if self.host.is_listening(port) {
                debug!("Port {} is in use, skipping", port);
                continue;
            }

            match self.registry.claim(port, &record)? {
                ClaimOutcome::Claimed => return Ok((port, ClaimOutcome::Claimed)),
                ClaimOutcome::Taken if self.registry.is_owned_by(port, &self.identity) => {
                    info!("Adopting existing claim on port {}", port);
                    return Ok((port, ClaimOutcome::Taken));
                }
                ClaimOutcome::Taken => debug!("Port {} is claimed, skipping", port),
            }
        }

        Err(PortError::Exhausted {
            min: self.range.min,
            max: self.range.max,
        })
    }

    fn wait_until_free(&self, port: u16) -> bool {
        let deadline = Instant::now() + self.grace_period;
        loop {
            if !self.host.is_listening(port) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(POLL_INTERVAL.min(self.grace_period));
        }
    }

    fn describe_claim(&self, port: u16) -> String {
        match self.registry.record(port) {
            Some(record) => format!("user '{}' (uid {})", record.user, record.uid),
            None => "an unidentified registry claim".to_string(),
        }
    }
}

fn describe_listeners(listeners: &[Listener]) -> String {
    let Some((listener, uid)) = listeners
        .iter()
        .find_map(|listener| listener.uid.map(|uid| (listener, uid)))
    else {
        return "an unidentified process".to_string();
    };
    match &listener.process {
        Some(process) => format!("{process} owned by uid {uid}"),
        None => format!("a process owned by uid {uid}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_listeners() {
        assert_eq!(describe_listeners(&[]), "an unidentified process");
        assert_eq!(
            describe_listeners(&[Listener::default()]),
            "an unidentified process"
        );
        assert_eq!(
            describe_listeners(&[Listener {
                pid: Some(4),
                uid: Some(1002),
                process: Some("rserver".to_string()),
            }]),
            "rserver owned by uid 1002"
        );
    }

    #[test]
    fn test_source_display() {
        assert_eq!(AllocationSource::Reclaimed.to_string(), "reclaimed");
        assert_eq!(
            serde_json::to_string(&AllocationSource::Fresh).unwrap(),
            "\"fresh\""
        );
    }
}
