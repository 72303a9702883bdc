//! Host inspection: who is listening on a port, and stopping our own stale
//! servers.

use log::{debug, info, warn};
use serde::Serialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::os::unix::fs::MetadataExt;
use std::process::Command;
use std::time::Duration;

use super::{PortError, PortResult};

/// A process (or at least a socket) listening on a port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Listener {
    /// Process id, if the OS let us see it.
    pub pid: Option<u32>,
    /// Socket owner uid, if known.
    pub uid: Option<u32>,
    /// Process name, if known.
    pub process: Option<String>,
}

/// Operations the allocator needs from the machine it runs on.
pub trait Host {
    /// Whether something accepts TCP connections on `port` locally.
    fn is_listening(&self, port: u16) -> bool;

    /// Best-effort list of listeners on `port`. Empty means unknown.
    fn listeners(&self, port: u16) -> Vec<Listener>;

    /// Terminate `listener`, which must belong to `uid`.
    ///
    /// Implementations must refuse to signal processes of any other user.
    fn terminate(&self, listener: &Listener, uid: u32) -> PortResult<()>;
}

/// The real host, inspected through sockets, `ss` and `/proc`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    probe_timeout: Duration,
}

impl SystemHost {
    pub fn new(probe_timeout: Duration) -> Self {
        // connect_timeout rejects a zero duration
        let probe_timeout = probe_timeout.max(Duration::from_millis(1));
        Self { probe_timeout }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new(Duration::from_millis(200))
    }
}

impl Host for SystemHost {
    fn is_listening(&self, port: u16) -> bool {
        let targets = [
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
            SocketAddr::from((Ipv6Addr::LOCALHOST, port)),
        ];
        targets
            .iter()
            .any(|addr| TcpStream::connect_timeout(addr, self.probe_timeout).is_ok())
    }

    fn listeners(&self, port: u16) -> Vec<Listener> {
        let output = match Command::new("ss")
            .args(["-H", "-tlnpe", &format!("sport = :{}", port)])
            .output()
        {
            Ok(output) => output,
            Err(e) => {
                warn!("Cannot run ss to identify the owner of port {}: {}", port, e);
                return Vec::new();
            }
        };

        if !output.status.success() {
            debug!("ss exited with {} for port {}", output.status, port);
            return Vec::new();
        }

        parse_ss_listeners(&String::from_utf8_lossy(&output.stdout))
    }

    fn terminate(&self, listener: &Listener, uid: u32) -> PortResult<()> {
        let Some(pid) = listener.pid else {
            return Err(PortError::Io(std::io::Error::other(
                "listener has no known pid",
            )));
        };

        let owner = std::fs::metadata(format!("/proc/{pid}"))
            .map(|meta| meta.uid())
            .map_err(PortError::Io)?;
        if owner != uid {
            return Err(PortError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("process {pid} belongs to uid {owner}, not {uid}"),
            )));
        }

        info!(
            "Stopping stale server {} (pid {})",
            listener.process.as_deref().unwrap_or("unknown"),
            pid
        );
        let pid = i32::try_from(pid).map_err(|_| {
            PortError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("pid {pid} out of range"),
            ))
        })?;
        if unsafe { libc::kill(pid, libc::SIGTERM) } != 0 {
            return Err(PortError::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

/// Parse `ss -H -tlnpe` output into listeners.
///
/// Line format:
/// `LISTEN 0 4096 0.0.0.0:8800 0.0.0.0:* users:(("rserver",pid=12345,fd=15)) uid:1001 ino:9 sk:1 <->`
fn parse_ss_listeners(output: &str) -> Vec<Listener> {
    let mut listeners = Vec::new();

    for line in output.lines().filter(|l| !l.trim().is_empty()) {
        let uid = line
            .split_whitespace()
            .find_map(|field| field.strip_prefix("uid:"))
            .and_then(|value| value.parse::<u32>().ok());

        let Some(users) = line.split("users:((").nth(1) else {
            listeners.push(Listener {
                pid: None,
                uid,
                process: None,
            });
            continue;
        };
        let users = users.split("))").next().unwrap_or(users);

        for entry in users.split("),(") {
            let process = entry.split('"').nth(1).map(str::to_string);
            let pid = entry
                .split("pid=")
                .nth(1)
                .and_then(|rest| rest.split(',').next())
                .and_then(|pid| pid.parse::<u32>().ok());
            listeners.push(Listener { pid, uid, process });
        }
    }

    listeners
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_single_listener() {
        let out = "LISTEN 0 4096 0.0.0.0:8800 0.0.0.0:* users:((\"rserver\",pid=12345,fd=15)) uid:1001 ino:99 sk:1 <->\n";
        let listeners = parse_ss_listeners(out);
        assert_eq!(
            listeners,
            vec![Listener {
                pid: Some(12345),
                uid: Some(1001),
                process: Some("rserver".to_string()),
            }]
        );
    }

    #[test]
    fn test_parse_shared_socket() {
        let out = "LISTEN 0 128 *:8801 *:* users:((\"rsession\",pid=20,fd=3),(\"rserver\",pid=10,fd=3)) uid:1002 ino:1 sk:2 <->";
        let listeners = parse_ss_listeners(out);
        assert_eq!(listeners.len(), 2);
        assert_eq!(listeners[0].pid, Some(20));
        assert_eq!(listeners[1].pid, Some(10));
        assert_eq!(listeners[1].process.as_deref(), Some("rserver"));
        assert!(listeners.iter().all(|l| l.uid == Some(1002)));
    }

    #[test]
    fn test_parse_foreign_listener_without_process_info() {
        // Root-owned sockets carry no uid field; other users' processes are hidden.
        let out = "LISTEN 0 4096 0.0.0.0:8802 0.0.0.0:* ino:5 sk:3 <->";
        assert_eq!(parse_ss_listeners(out), vec![Listener::default()]);
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_ss_listeners("").is_empty());
        assert!(parse_ss_listeners("\n\n").is_empty());
    }

    #[test]
    fn test_probe_sees_listener() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let host = SystemHost::default();

        assert!(host.is_listening(port));

        drop(listener);
        assert!(!host.is_listening(port));
    }

    #[test]
    fn test_terminate_requires_pid() {
        let host = SystemHost::default();
        let listener = Listener {
            pid: None,
            uid: Some(0),
            process: None,
        };
        assert!(host.terminate(&listener, 0).is_err());
    }

    #[test]
    fn test_terminate_refuses_foreign_uid() {
        let host = SystemHost::default();
        // pid 1 never belongs to this uid
        let listener = Listener {
            pid: Some(1),
            uid: None,
            process: Some("init".to_string()),
        };
        let bogus_uid = u32::MAX - 1;
        assert!(host.terminate(&listener, bogus_uid).is_err());
    }
}
