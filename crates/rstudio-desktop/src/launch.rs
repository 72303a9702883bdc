//! Server launch.
//!
//! Takes an allocated port, prints the startup banner and runs the configured
//! server command with the port substituted in. The launcher does not bind the
//! port itself.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{debug, info};

use crate::ports::{Allocation, Identity};

/// Server launch configuration (`[launch]` in the config file).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    /// Command and arguments. `{port}`, `{user}` and `{uid}` are substituted.
    pub command: Vec<String>,
    /// Host name shown in the banner URL.
    pub url_host: String,
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            command: vec![
                "rserver".to_string(),
                "--www-port={port}".to_string(),
                "--server-user={user}".to_string(),
            ],
            url_host: "localhost".to_string(),
        }
    }
}

impl LaunchConfig {
    /// URL the user should open.
    pub fn url(&self, allocation: &Allocation) -> String {
        format!("http://{}:{}", self.url_host, allocation.port)
    }

    /// Human-readable startup banner.
    pub fn banner(&self, identity: &Identity, allocation: &Allocation) -> String {
        format!(
            "RStudio Server for {}\n  port:   {} ({})\n  url:    {}",
            identity.name,
            allocation.port,
            allocation.source,
            self.url(allocation)
        )
    }

    /// The command line to run, with placeholders filled in and `extra`
    /// appended.
    pub fn render(
        &self,
        identity: &Identity,
        allocation: &Allocation,
        extra: &[String],
    ) -> Vec<String> {
        let port = allocation.port.to_string();
        let uid = identity.uid.to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{port}", &port)
                    .replace("{user}", &identity.name)
                    .replace("{uid}", &uid)
            })
            .chain(extra.iter().cloned())
            .collect()
    }

    /// Run the server in the foreground and return its exit code.
    pub fn run(
        &self,
        identity: &Identity,
        allocation: &Allocation,
        extra: &[String],
    ) -> Result<i32> {
        let argv = self.render(identity, allocation, extra);
        let Some((program, args)) = argv.split_first() else {
            bail!("launch.command is empty; nothing to run");
        };

        info!(port = allocation.port, user = %identity.name, "starting {}", program);
        debug!(?args, "server arguments");

        let status = Command::new(program)
            .args(args)
            .env("RSTUDIO_PORT", allocation.port.to_string())
            .status()
            .with_context(|| format!("starting {program}"))?;

        // Killed by a signal: report it the way shells do.
        let code = status.code().unwrap_or_else(|| {
            use std::os::unix::process::ExitStatusExt;
            128 + status.signal().unwrap_or(0)
        });
        debug!(code, "server exited");
        Ok(code)
    }
}
