//! Steering group runtime
//!
//! A group couples an ordered set of compiled domain rules with one
//! kernel IP-set and one set-to-link binder. The group engine pushes
//! addresses into the set incrementally as answers arrive; `sync`
//! rebuilds the set from the record store when a group is added at
//! runtime.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, trace};

use crate::config::{GroupConfig, GroupId, RuleConfig, RuleId, RuleType};
use crate::error::{GroupError, NetfilterError};
use crate::netfilter::{Family, IpSet, LinkBinder, NetfilterHelper};
use crate::records::Records;

/// Vendor forwarding chain the protect jump is appended to
const NDM_FORWARD_CHAIN: &str = "_NDM_SL_FORWARD";

/// Vendor protect chain the jump targets
const NDM_PROTECT_CHAIN: &str = "_NDM_SL_PROTECT";

/// A domain rule compiled for matching
#[derive(Debug)]
pub struct CompiledRule {
    id: RuleId,
    name: String,
    enabled: bool,
    matcher: RuleMatcher,
}

#[derive(Debug)]
enum RuleMatcher {
    Exact(String),
    Suffix(String),
    Keyword(String),
    Regex(regex::Regex),
}

impl CompiledRule {
    /// Compile a rule definition
    ///
    /// # Errors
    ///
    /// Returns `GroupError::InvalidPattern` when a regex pattern does not
    /// compile.
    pub fn compile(config: &RuleConfig) -> Result<Self, GroupError> {
        let pattern = config.pattern.to_ascii_lowercase();
        let matcher = match config.rule_type {
            RuleType::Exact => RuleMatcher::Exact(pattern),
            RuleType::Suffix => RuleMatcher::Suffix(pattern),
            RuleType::Keyword => RuleMatcher::Keyword(pattern),
            RuleType::Regex => RuleMatcher::Regex(regex::Regex::new(&config.pattern).map_err(
                |e| GroupError::InvalidPattern {
                    pattern: config.pattern.clone(),
                    reason: e.to_string(),
                },
            )?),
        };
        Ok(Self {
            id: config.id,
            name: config.name.clone(),
            enabled: config.enable,
            matcher,
        })
    }

    /// The rule id
    #[must_use]
    pub fn id(&self) -> RuleId {
        self.id
    }

    /// The rule label
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Disabled rules never match
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether the rule matches a (normalized) DNS name
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Exact(pattern) => name == pattern,
            RuleMatcher::Suffix(pattern) => {
                name == pattern
                    || (name.len() > pattern.len()
                        && name.ends_with(pattern.as_str())
                        && name.as_bytes()[name.len() - pattern.len() - 1] == b'.')
            }
            RuleMatcher::Keyword(pattern) => name.contains(pattern.as_str()),
            RuleMatcher::Regex(regex) => regex.is_match(name),
        }
    }
}

/// A steering group bound to one egress link
pub struct Group {
    config: GroupConfig,
    rules: Vec<CompiledRule>,
    ipset: IpSet,
    binder: LinkBinder,
    helper: Arc<NetfilterHelper>,
    enabled: AtomicBool,
}

impl Group {
    /// Construct a group: compile its rules and create its IP-set
    ///
    /// # Errors
    ///
    /// Returns `GroupError::RuleIdConflict` for duplicate rule ids,
    /// `GroupError::InvalidPattern` for bad rules and netfilter errors
    /// from set creation.
    pub async fn new(
        config: GroupConfig,
        helper: Arc<NetfilterHelper>,
        table_prefix: &str,
    ) -> Result<Self, GroupError> {
        let mut seen = std::collections::HashSet::new();
        for rule in &config.rules {
            if !seen.insert(rule.id) {
                return Err(GroupError::RuleIdConflict);
            }
        }

        let rules = config
            .rules
            .iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>, _>>()?;

        let set_name = format!("{}{}", table_prefix, config.id);
        let ipset = IpSet::new(helper.runner(), set_name.clone());
        ipset.create().await?;

        let binder = LinkBinder::new(
            Arc::clone(&helper),
            config.id,
            config.interface.clone(),
            set_name,
        );

        debug!(id = %config.id, name = %config.name, "group constructed");

        Ok(Self {
            config,
            rules,
            ipset,
            binder,
            helper,
            enabled: AtomicBool::new(false),
        })
    }

    /// The stable group id
    #[must_use]
    pub fn id(&self) -> GroupId {
        self.config.id
    }

    /// The human label
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The egress interface
    #[must_use]
    pub fn interface(&self) -> &str {
        &self.config.interface
    }

    /// The configuration this group was built from
    #[must_use]
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// The firewall mark derived for this group
    #[must_use]
    pub fn mark(&self) -> u32 {
        self.binder.mark()
    }

    /// The routing table derived for this group
    #[must_use]
    pub fn routing_table(&self) -> u32 {
        self.binder.table()
    }

    /// Whether the group is currently enabled
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether any enabled rule matches any of the given names
    #[must_use]
    pub fn matches_any(&self, names: &[String]) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.is_enabled())
            .any(|rule| names.iter().any(|name| rule.matches(name)))
    }

    /// Whether any enabled rule matches the given name
    #[must_use]
    pub fn matches_domain(&self, name: &str) -> bool {
        self.rules
            .iter()
            .filter(|rule| rule.is_enabled())
            .any(|rule| rule.matches(name))
    }

    fn fix_protect_rule(family: Family, interface: &str) -> Vec<&str> {
        match family {
            Family::V4 => vec![
                "-o", interface, "-m", "state", "--state", "NEW", "-j", NDM_PROTECT_CHAIN,
            ],
            Family::V6 => vec!["-o", interface, "-j", NDM_PROTECT_CHAIN],
        }
    }

    async fn assert_fix_protect(&self, family: Family) -> Result<(), NetfilterError> {
        let rule = Self::fix_protect_rule(family, &self.config.interface);
        self.helper
            .append_unique(family, "filter", NDM_FORWARD_CHAIN, &rule)
            .await
    }

    /// Install the group's firewall state
    ///
    /// A failed enable rolls back with a best-effort retraction of
    /// whatever was already asserted.
    pub async fn enable(&self) -> Result<(), GroupError> {
        if self.is_enabled() {
            return Ok(());
        }

        let result = self.enable_inner().await;
        match &result {
            Ok(()) => {
                self.enabled.store(true, Ordering::SeqCst);
                info!(id = %self.id(), name = %self.name(), interface = %self.interface(), "group enabled");
            }
            Err(e) => {
                error!(id = %self.id(), error = %e, "group enable failed, rolling back");
                self.retract_rules().await;
            }
        }
        result
    }

    async fn enable_inner(&self) -> Result<(), GroupError> {
        if self.config.fix_protect {
            for family in Family::ALL {
                self.assert_fix_protect(family).await?;
            }
        }
        self.binder.enable().await?;
        Ok(())
    }

    /// Reverse every assertion from enable
    ///
    /// Removal is tolerant of missing entries; individual failures are
    /// logged and do not stop the teardown.
    pub async fn disable(&self) {
        if !self.is_enabled() {
            return;
        }
        self.retract_rules().await;
        self.enabled.store(false, Ordering::SeqCst);
        debug!(id = %self.id(), "group disabled");
    }

    async fn retract_rules(&self) {
        if self.config.fix_protect {
            for family in Family::ALL {
                let rule = Self::fix_protect_rule(family, &self.config.interface);
                if let Err(e) = self
                    .helper
                    .delete(family, "filter", NDM_FORWARD_CHAIN, &rule)
                    .await
                {
                    error!(id = %self.id(), error = %e, "failed to remove fix protect rule");
                }
            }
        }

        if let Err(e) = self.binder.disable().await {
            error!(id = %self.id(), error = %e, "failed to disable link binder");
        }
    }

    /// Disable and destroy the group's IP-set
    pub async fn destroy(&self) {
        self.disable().await;
        if let Err(e) = self.ipset.destroy().await {
            error!(id = %self.id(), error = %e, "failed to destroy ipset");
        }
    }

    /// Insert an address with a timeout in seconds
    pub async fn add_ip(&self, address: IpAddr, ttl: Option<u32>) -> Result<(), GroupError> {
        self.ipset.add(address, ttl).await.map_err(GroupError::from)
    }

    /// Remove an address
    pub async fn del_ip(&self, address: IpAddr) -> Result<(), GroupError> {
        self.ipset.del(address).await.map_err(GroupError::from)
    }

    /// Current set contents with remaining timeouts
    pub async fn list_ips(&self) -> Result<HashMap<IpAddr, Option<u32>>, GroupError> {
        self.ipset.list().await.map_err(GroupError::from)
    }

    /// Full reconciliation of the IP-set against the record store
    ///
    /// Builds the desired membership from every enabled rule and the
    /// store's known domains (keeping the later deadline on duplicates),
    /// then adds missing or shorter-lived entries and deletes the rest.
    /// Already-expired records are skipped. Running `sync` twice with
    /// unchanged inputs performs no set operations on the second run.
    pub async fn sync(&self, records: &Records) -> Result<(), GroupError> {
        let now = Instant::now();

        let mut desired: HashMap<IpAddr, u32> = HashMap::new();
        for domain in records.list_known_domains() {
            if !self.matches_domain(&domain) {
                continue;
            }
            for record in records.get_a(&domain) {
                let ttl = record.remaining_secs(now);
                if ttl == 0 {
                    continue;
                }
                let entry = desired.entry(record.address).or_insert(ttl);
                if ttl > *entry {
                    *entry = ttl;
                }
            }
        }

        let current = self.list_ips().await?;

        for (address, ttl) in &desired {
            match current.get(address) {
                // Entries without a timeout never expire; leave them.
                Some(None) => continue,
                Some(Some(remaining)) if ttl <= remaining => continue,
                _ => {}
            }
            if let Err(e) = self.add_ip(*address, Some(*ttl)).await {
                error!(id = %self.id(), address = %address, error = %e, "sync: failed to add address");
            } else {
                trace!(id = %self.id(), address = %address, ttl, "sync: added address");
            }
        }

        for address in current.keys() {
            if desired.contains_key(address) {
                continue;
            }
            if let Err(e) = self.del_ip(*address).await {
                error!(id = %self.id(), address = %address, error = %e, "sync: failed to delete address");
            } else {
                trace!(id = %self.id(), address = %address, "sync: deleted address");
            }
        }

        Ok(())
    }

    /// Re-assert firewall state after an external flush
    pub async fn netfilterd_hook(&self, kind: &str, table: &str) -> Result<(), GroupError> {
        if self.is_enabled() && self.config.fix_protect && table == "filter" {
            for family in Family::from_netfilterd_type(kind) {
                self.assert_fix_protect(*family).await?;
            }
        }
        self.binder
            .netfilterd_hook(kind, table)
            .await
            .map_err(GroupError::from)
    }

    /// React to a link state change for this group's interface
    pub async fn link_update_hook(&self, up: bool) -> Result<(), GroupError> {
        self.binder.link_update_hook(up).await.map_err(GroupError::from)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.config.id)
            .field("name", &self.config.name)
            .field("interface", &self.config.interface)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}
