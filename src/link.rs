//! Kernel link state monitoring and address enumeration
//!
//! Link up/down transitions are observed by reading `ip -o monitor link`
//! line by line; local addresses of the configured LAN links are listed
//! with `ip -o addr show` through the command runner so the port remap
//! knows which destinations to hijack.

use std::net::IpAddr;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::NetfilterError;
use crate::netfilter::CommandRunner;

/// A link state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Interface name
    pub name: String,
    /// Whether the link is administratively and operationally up
    pub up: bool,
}

/// Subscribe to kernel link updates
///
/// Spawns an `ip -o monitor link` reader whose parsed events arrive on
/// the returned channel. The child process is killed on cancellation.
///
/// # Errors
///
/// Returns an error if the monitor process cannot be spawned.
pub fn subscribe_link_updates(
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<LinkEvent>, NetfilterError> {
    let mut child = tokio::process::Command::new("ip")
        .args(["-o", "monitor", "link"])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| NetfilterError::Spawn {
            program: "ip".to_string(),
            source: e,
        })?;

    let stdout = child.stdout.take().ok_or_else(|| NetfilterError::Spawn {
        program: "ip".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "no stdout"),
    })?;

    let (tx, rx) = mpsc::channel(64);

    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let _ = child.kill().await;
                    break;
                }
                line = lines.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            trace!(line = %line, "link monitor");
                            if let Some(event) = parse_monitor_line(&line) {
                                debug!(interface = %event.name, up = event.up, "link event");
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(None) => {
                            warn!("link monitor closed its output");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "link monitor read failed");
                            break;
                        }
                    }
                }
            }
        }
        let _ = child.kill().await;
    });

    Ok(rx)
}

/// Parse one `ip -o monitor link` line into a link event
///
/// Lines look like
/// `3: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 ...`; deleted
/// links and lines without a flag set are ignored.
#[must_use]
pub fn parse_monitor_line(line: &str) -> Option<LinkEvent> {
    let line = line.trim();
    if line.is_empty() || line.starts_with("Deleted") {
        return None;
    }

    let mut parts = line.split_whitespace();
    let _index = parts.next()?;
    let name_token = parts.next()?;
    let name = name_token
        .trim_end_matches(':')
        .split('@')
        .next()?
        .to_string();
    if name.is_empty() {
        return None;
    }

    let flags_token = parts.find(|t| t.starts_with('<') && t.ends_with('>'))?;
    let flags = &flags_token[1..flags_token.len() - 1];
    let up = flags.split(',').any(|f| f == "UP");

    Some(LinkEvent { name, up })
}

/// List the local addresses assigned to a link
///
/// # Errors
///
/// Returns an error when `ip -o addr show` fails, e.g. for an unknown
/// link name.
pub async fn link_addresses(
    runner: &Arc<dyn CommandRunner>,
    link: &str,
) -> Result<Vec<IpAddr>, NetfilterError> {
    let args = ["-o", "addr", "show", "dev", link];
    let out = runner.run("ip", &args).await?;
    if !out.success() {
        return Err(NetfilterError::command_failed(
            "ip",
            &args,
            out.status,
            out.stderr,
        ));
    }

    let mut addresses = Vec::new();
    for line in out.stdout.lines() {
        let mut tokens = line.split_whitespace();
        while let Some(token) = tokens.next() {
            if token != "inet" && token != "inet6" {
                continue;
            }
            let Some(cidr) = tokens.next() else { break };
            let addr_part = cidr.split('/').next().unwrap_or(cidr);
            match addr_part.parse::<IpAddr>() {
                Ok(address) => addresses.push(address),
                Err(e) => {
                    warn!(link, token = %cidr, error = %e, "skipping unparseable address");
                }
            }
            break;
        }
    }

    Ok(addresses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::{CommandOutput, RecordingRunner};

    #[test]
    fn test_parse_monitor_line_up() {
        let event = parse_monitor_line(
            "3: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc fq state UP",
        )
        .unwrap();
        assert_eq!(event.name, "eth0");
        assert!(event.up);
    }

    #[test]
    fn test_parse_monitor_line_down() {
        let event = parse_monitor_line(
            "4: wg0: <POINTOPOINT,NOARP> mtu 1420 qdisc noqueue state DOWN",
        )
        .unwrap();
        assert_eq!(event.name, "wg0");
        assert!(!event.up);
    }

    #[test]
    fn test_parse_monitor_line_vlan_suffix() {
        let event = parse_monitor_line(
            "5: eth0.10@eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500",
        )
        .unwrap();
        assert_eq!(event.name, "eth0.10");
        assert!(event.up);
    }

    #[test]
    fn test_parse_monitor_line_ignores_noise() {
        assert!(parse_monitor_line("").is_none());
        assert!(parse_monitor_line("Deleted 7: veth1: <BROADCAST> mtu 1500").is_none());
        assert!(parse_monitor_line("not a link line").is_none());
    }

    #[tokio::test]
    async fn test_link_addresses() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub(
            "ip -o addr show dev br0",
            CommandOutput::with_stdout(
                "2: br0    inet 192.168.1.1/24 brd 192.168.1.255 scope global br0\\       valid_lft forever preferred_lft forever\n\
                 2: br0    inet6 fd00::1/64 scope global \\       valid_lft forever preferred_lft forever\n",
            ),
        );
        let runner: Arc<dyn CommandRunner> = runner;

        let addresses = link_addresses(&runner, "br0").await.unwrap();
        assert_eq!(
            addresses,
            vec![
                "192.168.1.1".parse::<IpAddr>().unwrap(),
                "fd00::1".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn test_link_addresses_unknown_link() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub(
            "ip -o addr show dev nope",
            CommandOutput::failed(1, "Device \"nope\" does not exist."),
        );
        let runner: Arc<dyn CommandRunner> = runner;

        assert!(link_addresses(&runner, "nope").await.is_err());
    }
}
