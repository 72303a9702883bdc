//! The user a port is allocated for.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::process::Command;

/// An account on whose behalf a server is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Login name.
    pub name: String,
    /// Numeric user id.
    pub uid: u32,
    /// Host the identity was resolved on.
    pub hostname: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, uid: u32, hostname: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid,
            hostname: hostname.into(),
        }
    }

    /// Resolve the invoking user.
    pub fn current() -> Self {
        let uid = unsafe { libc::getuid() };
        let name = current_username(uid);
        let hostname = current_hostname();
        debug!("Resolved identity {} (uid {}) on {}", name, uid, hostname);
        Self { name, uid, hostname }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (uid {})", self.name, self.uid)
    }
}

/// Login name for `uid`: the passwd database first, then `id -un`, then the
/// environment, then the bare uid. `USER` is not trusted over the uid.
fn current_username(uid: u32) -> String {
    if let Some(name) = passwd_name(uid) {
        return name;
    }

    if let Some(name) = command_output("id", &["-un"]) {
        return name;
    }

    for var in ["USER", "LOGNAME"] {
        if let Some(name) = env::var(var).ok().filter(|v| !v.trim().is_empty()) {
            return name;
        }
    }

    warn!("No login name for uid {}, using the uid instead", uid);
    uid.to_string()
}

/// Name field of the passwd entry for `uid`.
fn passwd_name(uid: u32) -> Option<String> {
    let line = command_output("getent", &["passwd", &uid.to_string()])?;
    parse_passwd_name(&line, uid)
}

fn parse_passwd_name(line: &str, uid: u32) -> Option<String> {
    let parts: Vec<&str> = line.lines().next()?.trim().split(':').collect();
    if parts.len() < 3 || parts[2].parse::<u32>().ok() != Some(uid) || parts[0].is_empty() {
        return None;
    }
    Some(parts[0].to_string())
}

/// Trimmed stdout of a successful command, if not empty.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|text| !text.is_empty())
}

fn current_hostname() -> String {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if rc != 0 {
        return "localhost".to_string();
    }
    let len = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).to_string();
    if name.is_empty() {
        "localhost".to_string()
    } else {
        name
    }
}
