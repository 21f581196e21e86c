//! Transparent port remap
//!
//! Hijacks client DNS by redirecting traffic aimed at the router's own
//! addresses on port 53 into the local proxy port, via REDIRECT rules in
//! a prefix-owned NAT PREROUTING sub-chain.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::helper::{Family, NetfilterHelper};
use crate::error::NetfilterError;

/// Destination-NAT remap of one external port to a local port
#[derive(Debug)]
pub struct PortRemap {
    helper: Arc<NetfilterHelper>,
    chain: String,
    addresses: Vec<IpAddr>,
    from_port: u16,
    to_port: u16,
    enabled: AtomicBool,
}

impl PortRemap {
    /// Create a remap of `from_port` to `to_port` on the given local
    /// addresses; the sub-chain is named `<prefix><name>`
    pub fn new(
        helper: Arc<NetfilterHelper>,
        name: &str,
        from_port: u16,
        to_port: u16,
        addresses: Vec<IpAddr>,
    ) -> Self {
        let chain = helper.owned_chain(name);
        Self {
            helper,
            chain,
            addresses,
            from_port,
            to_port,
            enabled: AtomicBool::new(false),
        }
    }

    /// The owned sub-chain name
    #[must_use]
    pub fn chain(&self) -> &str {
        &self.chain
    }

    fn addresses_for(&self, family: Family) -> Vec<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .filter(|a| match family {
                Family::V4 => a.is_ipv4(),
                Family::V6 => a.is_ipv6(),
            })
            .collect()
    }

    async fn assert_family(&self, family: Family) -> Result<(), NetfilterError> {
        let addresses = self.addresses_for(family);
        if addresses.is_empty() {
            return Ok(());
        }

        self.helper.ensure_chain(family, "nat", &self.chain).await?;

        let from = self.from_port.to_string();
        let to = self.to_port.to_string();
        for address in &addresses {
            let dst = address.to_string();
            for proto in ["udp", "tcp"] {
                self.helper
                    .append_unique(
                        family,
                        "nat",
                        &self.chain,
                        &[
                            "-d", &dst, "-p", proto, "--dport", &from, "-j", "REDIRECT",
                            "--to-ports", &to,
                        ],
                    )
                    .await?;
            }
        }

        self.helper
            .append_unique(family, "nat", "PREROUTING", &["-j", &self.chain])
            .await
    }

    async fn retract_family(&self, family: Family) -> Result<(), NetfilterError> {
        if self.addresses_for(family).is_empty() {
            return Ok(());
        }
        self.helper
            .delete(family, "nat", "PREROUTING", &["-j", &self.chain])
            .await?;
        self.helper.flush_chain(family, "nat", &self.chain).await?;
        self.helper.delete_chain(family, "nat", &self.chain).await
    }

    /// Install the redirect rules for both families
    pub async fn enable(&self) -> Result<(), NetfilterError> {
        for family in Family::ALL {
            self.assert_family(family).await?;
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!(
            chain = %self.chain,
            from = self.from_port,
            to = self.to_port,
            addresses = self.addresses.len(),
            "port remap enabled"
        );
        Ok(())
    }

    /// Remove the redirect rules; missing rules are tolerated
    pub async fn disable(&self) -> Result<(), NetfilterError> {
        for family in Family::ALL {
            self.retract_family(family).await?;
        }
        self.enabled.store(false, Ordering::SeqCst);
        debug!(chain = %self.chain, "port remap disabled");
        Ok(())
    }

    /// Re-assert rules after an external firewall flush
    ///
    /// Only reacts to events touching the NAT table of a matching family.
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) || table != "nat" {
            return Ok(());
        }
        for family in Family::from_netfilterd_type(kind) {
            self.assert_family(*family).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::command::{CommandOutput, RecordingRunner};

    fn remap_with(runner: Arc<RecordingRunner>, addresses: Vec<IpAddr>) -> PortRemap {
        let helper = Arc::new(NetfilterHelper::new(runner, "MT_"));
        PortRemap::new(helper, "DNSOR", 53, 3553, addresses)
    }

    #[tokio::test]
    async fn test_enable_asserts_redirects() {
        let runner = Arc::new(RecordingRunner::new());
        // Nothing is present yet, so every check misses.
        runner.stub("iptables -t nat -C", CommandOutput::failed(1, "Bad rule"));
        let remap = remap_with(Arc::clone(&runner), vec!["192.168.1.1".parse().unwrap()]);

        remap.enable().await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t nat -N MT_DNSOR".to_string()));
        assert!(calls.contains(
            &"iptables -t nat -A MT_DNSOR -d 192.168.1.1 -p udp --dport 53 -j REDIRECT --to-ports 3553"
                .to_string()
        ));
        assert!(calls.contains(
            &"iptables -t nat -A MT_DNSOR -d 192.168.1.1 -p tcp --dport 53 -j REDIRECT --to-ports 3553"
                .to_string()
        ));
        assert!(calls.contains(&"iptables -t nat -A PREROUTING -j MT_DNSOR".to_string()));
        // No v6 addresses, so ip6tables is never touched.
        assert!(!calls.iter().any(|c| c.starts_with("ip6tables")));
    }

    #[tokio::test]
    async fn test_disable_retracts() {
        let runner = Arc::new(RecordingRunner::new());
        let remap = remap_with(
            Arc::clone(&runner),
            vec!["192.168.1.1".parse().unwrap(), "fd00::1".parse().unwrap()],
        );

        remap.enable().await.unwrap();
        runner.clear_calls();
        remap.disable().await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t nat -D PREROUTING -j MT_DNSOR".to_string()));
        assert!(calls.contains(&"iptables -t nat -F MT_DNSOR".to_string()));
        assert!(calls.contains(&"iptables -t nat -X MT_DNSOR".to_string()));
        assert!(calls.contains(&"ip6tables -t nat -D PREROUTING -j MT_DNSOR".to_string()));
    }

    #[tokio::test]
    async fn test_netfilterd_hook_filters_table_and_family() {
        let runner = Arc::new(RecordingRunner::new());
        let remap = remap_with(
            Arc::clone(&runner),
            vec!["192.168.1.1".parse().unwrap(), "fd00::1".parse().unwrap()],
        );
        remap.enable().await.unwrap();
        runner.clear_calls();

        // Wrong table: nothing happens.
        remap.netfilterd_hook("iptables", "mangle").await.unwrap();
        assert!(runner.calls().is_empty());

        // Matching family re-asserts only iptables.
        remap.netfilterd_hook("iptables", "nat").await.unwrap();
        assert!(!runner.calls_matching("iptables").is_empty());
        assert!(runner.calls_matching("ip6tables").is_empty());

        // Empty type re-asserts both.
        runner.clear_calls();
        remap.netfilterd_hook("", "nat").await.unwrap();
        assert!(!runner.calls_matching("iptables").is_empty());
        assert!(!runner.calls_matching("ip6tables").is_empty());
    }

    #[tokio::test]
    async fn test_netfilterd_hook_noop_when_disabled() {
        let runner = Arc::new(RecordingRunner::new());
        let remap = remap_with(Arc::clone(&runner), vec!["192.168.1.1".parse().unwrap()]);

        remap.netfilterd_hook("", "nat").await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
