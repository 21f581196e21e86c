//! Packet-filter adapter
//!
//! Thin contract over iptables/ip6tables. All assertions are expressed as
//! "ensure present" or "ensure absent" so they tolerate concurrent
//! external modification, and every chain the daemon creates carries the
//! configured chain prefix so crashed instances can be cleaned up by
//! namespace alone.

use std::sync::Arc;

use tracing::{debug, warn};

use super::command::{CommandOutput, CommandRunner};
use crate::error::NetfilterError;

/// Packet-filter families the adapter drives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4 (`iptables`)
    V4,
    /// IPv6 (`ip6tables`)
    V6,
}

impl Family {
    /// Both families, in fixed order
    pub const ALL: [Family; 2] = [Family::V4, Family::V6];

    /// The control binary for this family
    #[must_use]
    pub const fn program(self) -> &'static str {
        match self {
            Self::V4 => "iptables",
            Self::V6 => "ip6tables",
        }
    }

    /// The `ip(8)` family flag for this family
    #[must_use]
    pub const fn ip_flag(self) -> &'static str {
        match self {
            Self::V4 => "-4",
            Self::V6 => "-6",
        }
    }

    /// Families selected by a `netfilter.d` event type
    ///
    /// An empty type means "both"; unknown types select nothing.
    #[must_use]
    pub fn from_netfilterd_type(kind: &str) -> &'static [Family] {
        match kind {
            "" => &Self::ALL,
            "iptables" => &[Self::V4],
            "ip6tables" => &[Self::V6],
            _ => &[],
        }
    }
}

/// Tables scanned by the startup cleanup
const CLEANUP_TABLES: [&str; 4] = ["filter", "nat", "mangle", "raw"];

/// iptables/ip6tables adapter with idempotent rule assertions
#[derive(Debug)]
pub struct NetfilterHelper {
    runner: Arc<dyn CommandRunner>,
    chain_prefix: String,
}

impl NetfilterHelper {
    /// Create an adapter owning the given chain prefix
    pub fn new(runner: Arc<dyn CommandRunner>, chain_prefix: impl Into<String>) -> Self {
        Self {
            runner,
            chain_prefix: chain_prefix.into(),
        }
    }

    /// The chain prefix this adapter owns
    #[must_use]
    pub fn chain_prefix(&self) -> &str {
        &self.chain_prefix
    }

    /// Prefix a chain name into the owned namespace
    #[must_use]
    pub fn owned_chain(&self, name: &str) -> String {
        format!("{}{}", self.chain_prefix, name)
    }

    /// The command runner backing this adapter
    #[must_use]
    pub fn runner(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    /// Append a rule only if it is not already present
    pub async fn append_unique(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<(), NetfilterError> {
        let mut check = vec!["-t", table, "-C", chain];
        check.extend_from_slice(rule);
        let out = self.runner.run(family.program(), &check).await?;
        if out.success() {
            return Ok(());
        }

        let mut append = vec!["-t", table, "-A", chain];
        append.extend_from_slice(rule);
        let out = self.runner.run(family.program(), &append).await?;
        require_success(family.program(), &append, &out)
    }

    /// Delete a rule; a missing rule is not an error
    pub async fn delete(
        &self,
        family: Family,
        table: &str,
        chain: &str,
        rule: &[&str],
    ) -> Result<(), NetfilterError> {
        let mut args = vec!["-t", table, "-D", chain];
        args.extend_from_slice(rule);
        let out = self.runner.run(family.program(), &args).await?;
        if out.success() || is_missing(&out.stderr) {
            return Ok(());
        }
        Err(NetfilterError::command_failed(
            family.program(),
            &args,
            out.status,
            out.stderr,
        ))
    }

    /// Create a chain; an existing chain is not an error
    pub async fn ensure_chain(
        &self,
        family: Family,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        let args = ["-t", table, "-N", chain];
        let out = self.runner.run(family.program(), &args).await?;
        if out.success() || out.stderr.contains("already exists") {
            return Ok(());
        }
        Err(NetfilterError::command_failed(
            family.program(),
            &args,
            out.status,
            out.stderr,
        ))
    }

    /// Flush a chain; a missing chain is not an error
    pub async fn flush_chain(
        &self,
        family: Family,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        let args = ["-t", table, "-F", chain];
        let out = self.runner.run(family.program(), &args).await?;
        if out.success() || is_missing(&out.stderr) {
            return Ok(());
        }
        Err(NetfilterError::command_failed(
            family.program(),
            &args,
            out.status,
            out.stderr,
        ))
    }

    /// Delete a chain; a missing chain is not an error
    pub async fn delete_chain(
        &self,
        family: Family,
        table: &str,
        chain: &str,
    ) -> Result<(), NetfilterError> {
        let args = ["-t", table, "-X", chain];
        let out = self.runner.run(family.program(), &args).await?;
        if out.success() || is_missing(&out.stderr) {
            return Ok(());
        }
        Err(NetfilterError::command_failed(
            family.program(),
            &args,
            out.status,
            out.stderr,
        ))
    }

    /// Remove every chain in the owned namespace (crash recovery)
    ///
    /// For each family and table: locate chains whose name starts with the
    /// chain prefix, delete jump references to them, flush and delete
    /// them. Individual failures are logged and do not stop the sweep.
    pub async fn clean_owned_chains(&self) -> Result<(), NetfilterError> {
        for family in Family::ALL {
            for table in CLEANUP_TABLES {
                if let Err(e) = self.clean_table(family, table).await {
                    warn!(
                        family = family.program(),
                        table,
                        error = %e,
                        "failed to clean owned chains"
                    );
                }
            }
        }
        Ok(())
    }

    async fn clean_table(&self, family: Family, table: &str) -> Result<(), NetfilterError> {
        let args = ["-t", table, "-S"];
        let out = self.runner.run(family.program(), &args).await?;
        if !out.success() {
            return Err(NetfilterError::command_failed(
                family.program(),
                &args,
                out.status,
                out.stderr,
            ));
        }

        let mut owned: Vec<String> = Vec::new();
        let mut references: Vec<(String, Vec<String>)> = Vec::new();

        for line in out.stdout.lines() {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            match tokens.first() {
                Some(&"-N") if tokens.len() == 2 => {
                    if tokens[1].starts_with(&self.chain_prefix) {
                        owned.push(tokens[1].to_string());
                    }
                }
                Some(&"-A") if tokens.len() >= 2 => {
                    let jumps_to_owned = tokens.windows(2).any(|w| {
                        w[0] == "-j" && w[1].starts_with(&self.chain_prefix)
                    });
                    if jumps_to_owned {
                        let chain = tokens[1].to_string();
                        let rule = tokens[2..].iter().map(|t| (*t).to_string()).collect();
                        references.push((chain, rule));
                    }
                }
                _ => {}
            }
        }

        if owned.is_empty() && references.is_empty() {
            return Ok(());
        }

        debug!(
            family = family.program(),
            table,
            chains = owned.len(),
            references = references.len(),
            "cleaning owned chains"
        );

        for (chain, rule) in &references {
            let rule_refs: Vec<&str> = rule.iter().map(String::as_str).collect();
            if let Err(e) = self.delete(family, table, chain, &rule_refs).await {
                warn!(chain, error = %e, "failed to delete chain reference");
            }
        }
        for chain in &owned {
            if let Err(e) = self.flush_chain(family, table, chain).await {
                warn!(chain, error = %e, "failed to flush owned chain");
            }
            if let Err(e) = self.delete_chain(family, table, chain).await {
                warn!(chain, error = %e, "failed to delete owned chain");
            }
        }

        Ok(())
    }
}

/// Whether stderr describes a missing rule/chain/target
fn is_missing(stderr: &str) -> bool {
    stderr.contains("does a matching rule exist")
        || stderr.contains("No chain/target/match by that name")
        || stderr.contains("does not exist")
}

fn require_success(
    program: &str,
    args: &[&str],
    out: &CommandOutput,
) -> Result<(), NetfilterError> {
    if out.success() {
        Ok(())
    } else {
        Err(NetfilterError::command_failed(
            program,
            args,
            out.status,
            out.stderr.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netfilter::command::RecordingRunner;

    fn helper_with(runner: Arc<RecordingRunner>) -> NetfilterHelper {
        NetfilterHelper::new(runner, "MT_")
    }

    #[tokio::test]
    async fn test_append_unique_appends_when_absent() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub("iptables -t nat -C", CommandOutput::failed(1, "Bad rule"));
        let helper = helper_with(Arc::clone(&runner));

        helper
            .append_unique(Family::V4, "nat", "PREROUTING", &["-j", "MT_DNSOR"])
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec![
                "iptables -t nat -C PREROUTING -j MT_DNSOR",
                "iptables -t nat -A PREROUTING -j MT_DNSOR",
            ]
        );
    }

    #[tokio::test]
    async fn test_append_unique_skips_when_present() {
        let runner = Arc::new(RecordingRunner::new());
        let helper = helper_with(Arc::clone(&runner));

        helper
            .append_unique(Family::V4, "nat", "PREROUTING", &["-j", "MT_DNSOR"])
            .await
            .unwrap();

        assert_eq!(
            runner.calls(),
            vec!["iptables -t nat -C PREROUTING -j MT_DNSOR"]
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_rule() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub(
            "ip6tables -t mangle -D",
            CommandOutput::failed(1, "iptables: Bad rule (does a matching rule exist in that chain?)."),
        );
        let helper = helper_with(runner);

        helper
            .delete(Family::V6, "mangle", "PREROUTING", &["-j", "MT_X"])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_delete_propagates_real_failures() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub(
            "iptables -t mangle -D",
            CommandOutput::failed(4, "resource temporarily unavailable"),
        );
        let helper = helper_with(runner);

        let err = helper
            .delete(Family::V4, "mangle", "PREROUTING", &["-j", "MT_X"])
            .await
            .unwrap_err();
        assert!(matches!(err, NetfilterError::CommandFailed { status: 4, .. }));
    }

    #[tokio::test]
    async fn test_ensure_chain_tolerates_existing() {
        let runner = Arc::new(RecordingRunner::new());
        runner.stub(
            "iptables -t nat -N",
            CommandOutput::failed(1, "iptables: Chain already exists."),
        );
        let helper = helper_with(runner);

        helper.ensure_chain(Family::V4, "nat", "MT_DNSOR").await.unwrap();
    }

    #[tokio::test]
    async fn test_clean_owned_chains() {
        let runner = Arc::new(RecordingRunner::new());
        // Only the v4 nat table carries leftovers from a crashed instance.
        runner.stub(
            "iptables -t nat -S",
            CommandOutput::with_stdout(
                "-P PREROUTING ACCEPT\n\
                 -N MT_DNSOR\n\
                 -N UNRELATED\n\
                 -A PREROUTING -j MT_DNSOR\n\
                 -A MT_DNSOR -d 10.0.0.1/32 -p udp -m udp --dport 53 -j REDIRECT --to-ports 3553\n",
            ),
        );
        let helper = helper_with(Arc::clone(&runner));

        helper.clean_owned_chains().await.unwrap();

        let calls = runner.calls();
        assert!(calls.contains(&"iptables -t nat -D PREROUTING -j MT_DNSOR".to_string()));
        assert!(calls.contains(&"iptables -t nat -F MT_DNSOR".to_string()));
        assert!(calls.contains(&"iptables -t nat -X MT_DNSOR".to_string()));
        // The unrelated chain is left alone.
        assert!(!calls.iter().any(|c| c.contains("UNRELATED")));
        // The owned rule inside the owned chain is handled by the flush,
        // not deleted one by one.
        assert!(!calls.iter().any(|c| c.starts_with("iptables -t nat -D MT_DNSOR")));
    }

    #[tokio::test]
    async fn test_netfilterd_family_selection() {
        assert_eq!(Family::from_netfilterd_type(""), Family::ALL.as_slice());
        assert_eq!(Family::from_netfilterd_type("iptables"), [Family::V4].as_slice());
        assert_eq!(Family::from_netfilterd_type("ip6tables"), [Family::V6].as_slice());
        assert!(Family::from_netfilterd_type("nftables").is_empty());
    }
}
