//! IP-set to link binder
//!
//! Wires an IP-set to an egress interface: packets whose destination is
//! in the set get a firewall mark in the mangle table, and a policy rule
//! routes marked packets through a dedicated table whose default route
//! points at the interface.
//!
//! The mark and routing table id are derived deterministically from the
//! group id so they survive restarts without a registry; collisions are
//! detected at group creation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::command::CommandRunner;
use super::helper::{Family, NetfilterHelper};
use crate::config::GroupId;
use crate::error::NetfilterError;

/// High bits of every group firewall mark
pub const MARK_BASE: u32 = 0x004d_0000;

/// First routing table id used for groups
pub const TABLE_BASE: u32 = 30000;

/// Derive the 16-bit slot for a group id (never zero)
///
/// FNV-1a over the id bytes folded to 16 bits. The slot selects both the
/// firewall mark (`MARK_BASE | slot`) and the routing table
/// (`TABLE_BASE + slot`).
#[must_use]
pub fn derive_slot(id: GroupId) -> u16 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in id.0.to_be_bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    let folded = ((hash >> 16) ^ (hash & 0xffff)) as u16;
    if folded == 0 {
        1
    } else {
        folded
    }
}

/// Binds one IP-set to one egress link via mark + policy route
#[derive(Debug)]
pub struct LinkBinder {
    helper: Arc<NetfilterHelper>,
    runner: Arc<dyn CommandRunner>,
    chain_pre: String,
    chain_out: String,
    set_name: String,
    set_name6: String,
    interface: String,
    mark: u32,
    table: u32,
    enabled: AtomicBool,
}

impl LinkBinder {
    /// Create a binder for a group
    ///
    /// `set_name` is the IPv4 kernel set; the IPv6 sibling carries the
    /// `6` suffix. The mangle sub-chains are named from the group id
    /// inside the owned chain namespace.
    pub fn new(
        helper: Arc<NetfilterHelper>,
        group_id: GroupId,
        interface: impl Into<String>,
        set_name: impl Into<String>,
    ) -> Self {
        let slot = derive_slot(group_id);
        let set_name = set_name.into();
        let set_name6 = format!("{set_name}6");
        let chain_pre = helper.owned_chain(&format!("PRE_{group_id}"));
        let chain_out = helper.owned_chain(&format!("OUT_{group_id}"));
        let runner = helper.runner();
        Self {
            helper,
            runner,
            chain_pre,
            chain_out,
            set_name,
            set_name6,
            interface: interface.into(),
            mark: MARK_BASE | u32::from(slot),
            table: TABLE_BASE + u32::from(slot),
            enabled: AtomicBool::new(false),
        }
    }

    /// The firewall mark stamped on matching packets
    #[must_use]
    pub fn mark(&self) -> u32 {
        self.mark
    }

    /// The routing table holding the egress default route
    #[must_use]
    pub fn table(&self) -> u32 {
        self.table
    }

    /// The egress interface name
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    fn set_for(&self, family: Family) -> &str {
        match family {
            Family::V4 => &self.set_name,
            Family::V6 => &self.set_name6,
        }
    }

    /// Assert the mangle mark rules for one family
    async fn assert_mangle(&self, family: Family) -> Result<(), NetfilterError> {
        let mark = format!("0x{:x}", self.mark);
        let set = self.set_for(family);
        let rule = [
            "-m", "set", "--match-set", set, "dst", "-m", "mark", "--mark", "0x0", "-j", "MARK",
            "--set-mark", &mark,
        ];

        for (chain, hook) in [(&self.chain_pre, "PREROUTING"), (&self.chain_out, "OUTPUT")] {
            self.helper.ensure_chain(family, "mangle", chain).await?;
            self.helper
                .append_unique(family, "mangle", chain, &rule)
                .await?;
            self.helper
                .append_unique(family, "mangle", hook, &["-j", chain])
                .await?;
        }
        Ok(())
    }

    /// Retract the mangle mark rules for one family
    async fn retract_mangle(&self, family: Family) -> Result<(), NetfilterError> {
        for (chain, hook) in [(&self.chain_pre, "PREROUTING"), (&self.chain_out, "OUTPUT")] {
            self.helper
                .delete(family, "mangle", hook, &["-j", chain])
                .await?;
            self.helper.flush_chain(family, "mangle", chain).await?;
            self.helper.delete_chain(family, "mangle", chain).await?;
        }
        Ok(())
    }

    /// Assert the policy rule and default route for one family
    async fn assert_routing(&self, family: Family) -> Result<(), NetfilterError> {
        let mark = format!("0x{:x}", self.mark);
        let table = self.table.to_string();

        // `ip rule add` happily installs duplicates, so check first.
        let list = [family.ip_flag(), "rule", "list", "fwmark", &mark];
        let out = self.runner.run("ip", &list).await?;
        if !out.success() || out.stdout.trim().is_empty() {
            let add = [
                family.ip_flag(), "rule", "add", "fwmark", &mark, "lookup", &table,
            ];
            let out = self.runner.run("ip", &add).await?;
            if !out.success() && !out.stderr.contains("File exists") {
                return Err(NetfilterError::command_failed(
                    "ip", &add, out.status, out.stderr,
                ));
            }
        }

        // `route replace` is idempotent by itself.
        let route = [
            family.ip_flag(), "route", "replace", "default", "dev", &self.interface, "table",
            &table,
        ];
        let out = self.runner.run("ip", &route).await?;
        if !out.success() {
            return Err(NetfilterError::command_failed(
                "ip", &route, out.status, out.stderr,
            ));
        }
        Ok(())
    }

    /// Retract the policy rule and routing table for one family
    async fn retract_routing(&self, family: Family) -> Result<(), NetfilterError> {
        let mark = format!("0x{:x}", self.mark);
        let table = self.table.to_string();

        let del_rule = [
            family.ip_flag(), "rule", "del", "fwmark", &mark, "lookup", &table,
        ];
        let out = self.runner.run("ip", &del_rule).await?;
        if !out.success() && !is_missing_route(&out.stderr) {
            return Err(NetfilterError::command_failed(
                "ip", &del_rule, out.status, out.stderr,
            ));
        }

        let flush = [family.ip_flag(), "route", "flush", "table", &table];
        let out = self.runner.run("ip", &flush).await?;
        if !out.success() && !is_missing_route(&out.stderr) {
            return Err(NetfilterError::command_failed(
                "ip", &flush, out.status, out.stderr,
            ));
        }
        Ok(())
    }

    /// Install marks and policy routing for both families
    pub async fn enable(&self) -> Result<(), NetfilterError> {
        for family in Family::ALL {
            self.assert_mangle(family).await?;
            self.assert_routing(family).await?;
        }
        self.enabled.store(true, Ordering::SeqCst);
        info!(
            set = %self.set_name,
            interface = %self.interface,
            mark = format_args!("0x{:x}", self.mark),
            table = self.table,
            "link binder enabled"
        );
        Ok(())
    }

    /// Reverse every assertion from enable; missing state is tolerated
    pub async fn disable(&self) -> Result<(), NetfilterError> {
        for family in Family::ALL {
            self.retract_mangle(family).await?;
            self.retract_routing(family).await?;
        }
        self.enabled.store(false, Ordering::SeqCst);
        debug!(set = %self.set_name, "link binder disabled");
        Ok(())
    }

    /// Re-assert mangle rules after an external firewall flush
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), NetfilterError> {
        if !self.enabled.load(Ordering::SeqCst) || table != "mangle" {
            return Ok(());
        }
        for family in Family::from_netfilterd_type(kind) {
            self.assert_mangle(*family).await?;
        }
        Ok(())
    }

    /// Re-assert the default route after the link came back up
    ///
    /// The kernel drops routes through a link that went down, so the
    /// table needs its default route again.
    pub async fn link_update_hook(&self, up: bool) -> Result<(), NetfilterError> {
        if !up || !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        for family in Family::ALL {
            if let Err(e) = self.assert_routing(family).await {
                warn!(
                    interface = %self.interface,
                    family = family.program(),
                    error = %e,
                    "failed to restore route after link up"
                );
            }
        }
        Ok(())
    }
}

/// Whether stderr describes an already-absent rule/route
fn is_missing_route(stderr: &str) -> bool {
    stderr.contains("No such file or directory")
        || stderr.contains("No such process")
        || stderr.contains("does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::command::{CommandOutput, RecordingRunner};

    fn binder_with(runner: Arc<RecordingRunner>) -> LinkBinder {
        let helper = Arc::new(NetfilterHelper::new(runner, "MT_"));
        LinkBinder::new(helper, GroupId(0x2a), "wg0", "mt_0000002a")
    }

    #[test]
    fn test_derive_slot_is_deterministic_and_nonzero() {
        let a = derive_slot(GroupId(0x2a));
        let b = derive_slot(GroupId(0x2a));
        assert_eq!(a, b);
        assert_ne!(a, 0);

        // Different ids land on different slots for typical inputs.
        assert_ne!(derive_slot(GroupId(1)), derive_slot(GroupId(2)));
    }

    #[test]
    fn test_mark_and_table_derivation() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(runner);

        let slot = derive_slot(GroupId(0x2a));
        assert_eq!(binder.mark(), MARK_BASE | u32::from(slot));
        assert_eq!(binder.table(), TABLE_BASE + u32::from(slot));
    }

    #[tokio::test]
    async fn test_enable_asserts_marks_and_routes() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("iptables -t mangle -C", CommandOutput::failed(1, "Bad rule"));
        runner.stub("ip6tables -t mangle -C", CommandOutput::failed(1, "Bad rule"));
        let binder = binder_with(Arc::clone(&runner));
        let mark = format!("0x{:x}", binder.mark());
        let table = binder.table().to_string();

        binder.enable().await.unwrap();

        let calls = runner.calls();
        let expected_rule = format!(
            "iptables -t mangle -A MT_PRE_0000002a -m set --match-set mt_0000002a dst -m mark --mark 0x0 -j MARK --set-mark {mark}"
        );
        assert!(calls.contains(&expected_rule));
        assert!(calls.contains(&"iptables -t mangle -A PREROUTING -j MT_PRE_0000002a".to_string()));
        assert!(calls.contains(&"iptables -t mangle -A OUTPUT -j MT_OUT_0000002a".to_string()));
        // The v6 chain matches against the sibling set.
        assert!(calls.iter().any(|c| {
            c.starts_with("ip6tables -t mangle -A MT_PRE_0000002a")
                && c.contains("--match-set mt_0000002a6 dst")
        }));
        assert!(calls.contains(&format!("ip -4 rule add fwmark {mark} lookup {table}")));
        assert!(calls.contains(&format!(
            "ip -4 route replace default dev wg0 table {table}"
        )));
        assert!(calls.contains(&format!(
            "ip -6 route replace default dev wg0 table {table}"
        )));
    }

    #[tokio::test]
    async fn test_enable_skips_existing_policy_rule() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(Arc::clone(&runner));
        let mark = format!("0x{:x}", binder.mark());
        runner.stub(
            format!("ip -4 rule list fwmark {mark}"),
            CommandOutput::with_stdout(format!("32765: from all fwmark {mark} lookup 30001\n")),
        );

        binder.enable().await.unwrap();

        assert!(runner.calls_matching("ip -4 rule add").is_empty());
        assert!(!runner.calls_matching("ip -6 rule add").is_empty());
    }

    #[tokio::test]
    async fn test_disable_retracts_everything() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(Arc::clone(&runner));
        binder.enable().await.unwrap();
        runner.clear_calls();

        binder.disable().await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t mangle -D PREROUTING -j MT_PRE_0000002a".to_string()));
        assert!(calls.contains(&"iptables -t mangle -X MT_PRE_0000002a".to_string()));
        assert!(calls.contains(&"iptables -t mangle -X MT_OUT_0000002a".to_string()));
        let table = binder.table().to_string();
        assert!(calls.contains(&format!("ip -4 route flush table {table}")));
        assert!(calls.contains(&format!("ip -6 route flush table {table}")));
    }

    #[tokio::test]
    async fn test_netfilterd_hook_reasserts_mangle_only() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(Arc::clone(&runner));
        binder.enable().await.unwrap();
        runner.clear_calls();

        binder.netfilterd_hook("iptables", "nat").await.unwrap();
        assert!(runner.calls().is_empty());

        binder.netfilterd_hook("iptables", "mangle").await.unwrap();
        assert!(!runner.calls_matching("iptables -t mangle").is_empty());
        assert!(runner.calls_matching("ip6tables").is_empty());
        // Routing is not touched by the netfilter.d hook.
        assert!(runner.calls_matching("ip ").is_empty());
    }

    #[tokio::test]
    async fn test_link_update_reasserts_route() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(Arc::clone(&runner));
        binder.enable().await.unwrap();
        runner.clear_calls();

        // Down events are ignored.
        binder.link_update_hook(false).await.unwrap();
        assert!(runner.calls().is_empty());

        binder.link_update_hook(true).await.unwrap();
        let table = binder.table().to_string();
        assert!(runner
            .calls()
            .contains(&format!("ip -4 route replace default dev wg0 table {table}")));
    }

    #[tokio::test]
    async fn test_hooks_are_noop_while_disabled() {
        let runner = Arc::new(RecordingRunner::new());
        let binder = binder_with(Arc::clone(&runner));

        binder.netfilterd_hook("", "mangle").await.unwrap();
        binder.link_update_hook(true).await.unwrap();
        assert!(runner.calls().is_empty());
    }
}
