//! Test utilities and common setup.

use rstudio_desktop::ports::{
    AssignmentStore, Host, Identity, Listener, PortAllocator, PortError, PortRange, PortResult,
    Registry,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// In-memory host: listeners are whatever the test says they are.
#[derive(Debug, Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<FakeHostState>>,
}

#[derive(Debug, Default)]
struct FakeHostState {
    listeners: HashMap<u16, Vec<Listener>>,
    /// Pids that ignore termination.
    stubborn: Vec<u32>,
    terminated: Vec<u32>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Put a listener on `port`.
    pub fn listen(&self, port: u16, pid: Option<u32>, uid: Option<u32>) {
        let mut state = self.state.lock().unwrap();
        state.listeners.entry(port).or_default().push(Listener {
            pid,
            uid,
            process: Some("rserver".to_string()),
        });
    }

    /// `pid` survives termination.
    pub fn make_stubborn(&self, pid: u32) {
        self.state.lock().unwrap().stubborn.push(pid);
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.state.lock().unwrap().terminated.clone()
    }
}

impl Host for FakeHost {
    fn is_listening(&self, port: u16) -> bool {
        self.state
            .lock()
            .unwrap()
            .listeners
            .get(&port)
            .is_some_and(|l| !l.is_empty())
    }

    fn listeners(&self, port: u16) -> Vec<Listener> {
        self.state
            .lock()
            .unwrap()
            .listeners
            .get(&port)
            .cloned()
            .unwrap_or_default()
    }

    fn terminate(&self, listener: &Listener, uid: u32) -> PortResult<()> {
        assert_eq!(
            listener.uid,
            Some(uid),
            "allocator tried to terminate a foreign process"
        );
        let pid = listener.pid.ok_or_else(|| {
            PortError::Io(std::io::Error::other("listener has no known pid"))
        })?;

        let mut state = self.state.lock().unwrap();
        state.terminated.push(pid);
        if !state.stubborn.contains(&pid) {
            for listeners in state.listeners.values_mut() {
                listeners.retain(|l| l.pid != Some(pid));
            }
        }
        Ok(())
    }
}

/// A scratch host: one shared registry plus a state directory per user.
pub struct TestHost {
    pub dir: TempDir,
    pub host: FakeHost,
    pub range: PortRange,
}

impl TestHost {
    pub fn new(min: u16, max: u16) -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            host: FakeHost::new(),
            range: PortRange::new(min, max).unwrap(),
        }
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.dir.path().join("registry")
    }

    pub fn registry(&self) -> Registry {
        Registry::new(self.registry_dir())
    }

    pub fn state_dir(&self, user: &str) -> PathBuf {
        self.dir.path().join("home").join(user).join(".local/state")
    }

    pub fn store(&self, identity: &Identity) -> AssignmentStore {
        AssignmentStore::in_dir(&self.state_dir(&identity.name))
    }

    pub fn allocator(&self, identity: &Identity) -> PortAllocator<FakeHost> {
        PortAllocator::new(
            identity.clone(),
            self.range,
            self.registry(),
            self.store(identity),
            self.host.clone(),
        )
        .with_grace_period(Duration::ZERO)
    }
}

/// Distinct users with distinct uids.
pub fn user(n: u32) -> Identity {
    Identity::new(format!("user{n}"), 2000 + n, "shared-desktop")
}
