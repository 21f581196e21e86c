//! Kernel IP-set handle
//!
//! One logical set per group. A kernel `hash:ip` set is single-family, so
//! the handle owns two kernel sets: the base name for IPv4 and the base
//! name with a `6` suffix for IPv6. Both carry the configured table
//! prefix, so namespace-wide cleanup covers them. Entries carry per-entry
//! timeouts and are expired by the kernel, not by the daemon.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use tracing::trace;

use super::command::CommandRunner;
use crate::error::NetfilterError;

/// Handle for a pair of kernel `hash:ip` sets (v4 + v6)
#[derive(Debug)]
pub struct IpSet {
    runner: Arc<dyn CommandRunner>,
    name: String,
    name6: String,
}

impl IpSet {
    /// Create a handle for the named set (does not touch the kernel)
    pub fn new(runner: Arc<dyn CommandRunner>, name: impl Into<String>) -> Self {
        let name = name.into();
        let name6 = format!("{name}6");
        Self {
            runner,
            name,
            name6,
        }
    }

    /// The IPv4 kernel set name (the logical set name)
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The IPv6 kernel set name
    #[must_use]
    pub fn name_v6(&self) -> &str {
        &self.name6
    }

    fn set_for(&self, address: IpAddr) -> &str {
        match address {
            IpAddr::V4(_) => &self.name,
            IpAddr::V6(_) => &self.name6,
        }
    }

    /// Create both kernel sets with per-entry timeout support
    pub async fn create(&self) -> Result<(), NetfilterError> {
        self.run_ok(&[
            "-exist", "create", &self.name, "hash:ip", "family", "inet", "timeout", "0",
        ])
        .await?;
        self.run_ok(&[
            "-exist", "create", &self.name6, "hash:ip", "family", "inet6", "timeout", "0",
        ])
        .await
    }

    /// Add an address, optionally with a timeout in seconds
    ///
    /// Re-adding an existing address replaces its timeout.
    pub async fn add(&self, address: IpAddr, ttl: Option<u32>) -> Result<(), NetfilterError> {
        let set = self.set_for(address);
        let addr = address.to_string();
        trace!(set, address = %addr, ?ttl, "ipset add");
        match ttl {
            Some(ttl) => {
                let ttl = ttl.to_string();
                self.run_ok(&["-exist", "add", set, &addr, "timeout", &ttl])
                    .await
            }
            None => self.run_ok(&["-exist", "add", set, &addr]).await,
        }
    }

    /// Delete an address; a missing entry is not an error
    pub async fn del(&self, address: IpAddr) -> Result<(), NetfilterError> {
        let set = self.set_for(address);
        let addr = address.to_string();
        trace!(set, address = %addr, "ipset del");
        self.run_ok(&["-exist", "del", set, &addr]).await
    }

    /// List all entries with their remaining timeouts
    ///
    /// Entries without a timeout map to `None` (no expiry).
    pub async fn list(&self) -> Result<HashMap<IpAddr, Option<u32>>, NetfilterError> {
        let mut entries = HashMap::new();
        for set in [&self.name, &self.name6] {
            let out = self.runner.run("ipset", &["save", set]).await?;
            if !out.success() {
                if out.stderr.contains("does not exist") {
                    continue;
                }
                return Err(NetfilterError::command_failed(
                    "ipset",
                    &["save", set],
                    out.status,
                    out.stderr,
                ));
            }
            parse_save_output(&out.stdout, set, &mut entries)?;
        }
        Ok(entries)
    }

    /// Destroy both kernel sets; missing sets are not an error
    pub async fn destroy(&self) -> Result<(), NetfilterError> {
        for set in [&self.name, &self.name6] {
            let out = self.runner.run("ipset", &["destroy", set]).await?;
            if !out.success() && !out.stderr.contains("does not exist") {
                return Err(NetfilterError::command_failed(
                    "ipset",
                    &["destroy", set],
                    out.status,
                    out.stderr,
                ));
            }
        }
        Ok(())
    }

    async fn run_ok(&self, args: &[&str]) -> Result<(), NetfilterError> {
        let out = self.runner.run("ipset", args).await?;
        if out.success() {
            Ok(())
        } else {
            Err(NetfilterError::command_failed(
                "ipset",
                args,
                out.status,
                out.stderr,
            ))
        }
    }
}

/// Parse `ipset save` output lines of the form
/// `add <set> <addr> [timeout <secs>]`
fn parse_save_output(
    stdout: &str,
    set: &str,
    entries: &mut HashMap<IpAddr, Option<u32>>,
) -> Result<(), NetfilterError> {
    for line in stdout.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first() != Some(&"add") || tokens.get(1) != Some(&set) {
            continue;
        }
        let Some(addr_token) = tokens.get(2) else {
            continue;
        };
        let address: IpAddr = addr_token.parse().map_err(|e| {
            NetfilterError::parse_output("ipset", format!("bad address '{addr_token}': {e}"))
        })?;

        let timeout = match tokens.windows(2).find(|w| w[0] == "timeout") {
            Some(w) => Some(w[1].parse::<u32>().map_err(|e| {
                NetfilterError::parse_output("ipset", format!("bad timeout '{}': {e}", w[1]))
            })?),
            None => None,
        };

        entries.insert(address, timeout);
    }
    Ok(())
}
