//! Configuration types for magitrickle
//!
//! This module defines all configuration structures used by the daemon.
//! Configuration is loaded from JSON files and can be validated at startup.
//!
//! Group and rule ids are stable 32-bit identifiers serialized as
//! 8-hex-digit strings so they stay readable in config files and survive
//! restarts (set names, marks and routing tables are derived from them).

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

/// Version written by `export_config`
pub const EXPORT_CONFIG_VERSION: &str = "0.1.0";

/// Version prefix accepted by `import_config`
pub const SUPPORTED_CONFIG_VERSION_PREFIX: &str = "0.1.";

/// Stable 32-bit group identifier, serialized as 8 hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupId(pub u32);

/// Stable 32-bit rule identifier, serialized as 8 hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

macro_rules! hex_id_impls {
    ($ty:ident) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:08x}", self.0)
            }
        }

        impl FromStr for $ty {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                u32::from_str_radix(s, 16).map(Self)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(|e| {
                    D::Error::custom(format!("invalid 8-hex-digit id '{s}': {e}"))
                })
            }
        }
    };
}

hex_id_impls!(GroupId);
hex_id_impls!(RuleId);

/// Root configuration structure (the on-disk document)
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Config {
    /// Schema version; imports require the `0.1.` prefix
    pub config_version: String,

    /// Daemon-wide settings
    #[serde(default)]
    pub app: AppConfig,

    /// Configured steering groups
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.app.validate()?;

        let mut group_ids: HashSet<GroupId> = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !group_ids.insert(group.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate group id: {}",
                    group.id
                )));
            }
        }

        Ok(())
    }

    /// Create a configuration equal to the built-in defaults
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            config_version: EXPORT_CONFIG_VERSION.to_string(),
            app: AppConfig::default(),
            groups: Vec::new(),
        }
    }
}

/// Daemon-wide settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    /// DNS proxy settings
    #[serde(default)]
    pub dns_proxy: DnsProxyConfig,

    /// Netfilter namespace and TTL settings
    #[serde(default)]
    pub netfilter: NetfilterConfig,

    /// LAN links whose local addresses receive the :53 redirect
    #[serde(default = "default_links")]
    pub link: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl AppConfig {
    /// Validate daemon settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dns_proxy.validate()?;
        self.netfilter.validate()?;
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            dns_proxy: DnsProxyConfig::default(),
            netfilter: NetfilterConfig::default(),
            link: default_links(),
            log_level: default_log_level(),
        }
    }
}

/// DNS proxy listen/upstream settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DnsProxyConfig {
    /// Address the proxy listens on (UDP + TCP)
    #[serde(default = "default_host")]
    pub host: DnsServerAddr,

    /// Upstream recursive resolver
    #[serde(default = "default_upstream")]
    pub upstream: DnsServerAddr,

    /// Skip the transparent :53 redirect
    #[serde(default)]
    pub disable_remap_53: bool,

    /// Skip the PTR-suppression request hook
    #[serde(default)]
    pub disable_fake_ptr: bool,
}

impl DnsProxyConfig {
    /// Validate the proxy addresses
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.host.socket_addr().map_err(|e| {
            ConfigError::ValidationError(format!("dns_proxy.host: {e}"))
        })?;
        self.upstream.socket_addr().map_err(|e| {
            ConfigError::ValidationError(format!("dns_proxy.upstream: {e}"))
        })?;
        Ok(())
    }
}

impl Default for DnsProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            upstream: default_upstream(),
            disable_remap_53: false,
            disable_fake_ptr: false,
        }
    }
}

/// Address + port pair for the DNS proxy endpoints
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DnsServerAddr {
    /// Host part, e.g. `127.0.0.1` or `[::]`
    pub address: String,

    /// Port part
    pub port: u16,
}

impl DnsServerAddr {
    /// Create a new address
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Resolve into a `SocketAddr`
    ///
    /// Accepts plain IPv4 (`127.0.0.1`), bracketed IPv6 (`[::]`) and bare
    /// IPv6 (`::1`) host notations.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let host = self.address.trim();
        let candidate = if host.starts_with('[') || !host.contains(':') {
            format!("{}:{}", host, self.port)
        } else {
            format!("[{}]:{}", host, self.port)
        };
        candidate.parse().map_err(|e| {
            ConfigError::ValidationError(format!("invalid address '{host}': {e}"))
        })
    }
}

/// Netfilter namespace and TTL settings
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct NetfilterConfig {
    /// iptables chain namespace
    #[serde(default)]
    pub iptables: IptablesConfig,

    /// ipset namespace and TTL policy
    #[serde(default)]
    pub ipset: IpsetConfig,
}

impl NetfilterConfig {
    /// Validate the netfilter namespace settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.iptables.chain_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "netfilter.iptables.chain_prefix must not be empty".into(),
            ));
        }
        if self.ipset.table_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "netfilter.ipset.table_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NetfilterConfig {
    fn default() -> Self {
        Self {
            iptables: IptablesConfig::default(),
            ipset: IpsetConfig::default(),
        }
    }
}

/// iptables chain namespace
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IptablesConfig {
    /// Prefix owned by the daemon; prefixed chains are cleaned at startup
    #[serde(default = "default_chain_prefix")]
    pub chain_prefix: String,
}

impl Default for IptablesConfig {
    fn default() -> Self {
        Self {
            chain_prefix: default_chain_prefix(),
        }
    }
}

/// ipset namespace and TTL policy
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct IpsetConfig {
    /// Prefix for per-group set names
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,

    /// Seconds added to each learned DNS TTL before it becomes a set
    /// entry timeout
    #[serde(default = "default_additional_ttl")]
    pub additional_ttl: u32,
}

impl Default for IpsetConfig {
    fn default() -> Self {
        Self {
            table_prefix: default_table_prefix(),
            additional_ttl: default_additional_ttl(),
        }
    }
}

/// A steering group: a set of domain rules bound to an egress link
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct GroupConfig {
    /// Stable identifier; set name, mark and routing table derive from it
    pub id: GroupId,

    /// Human label
    pub name: String,

    /// Egress link name
    pub interface: String,

    /// Install the vendor protect forwarding jump while enabled
    #[serde(default)]
    pub fix_protect: bool,

    /// Ordered domain-matching rules
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl GroupConfig {
    /// Validate the group definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "group {} has an empty interface",
                self.id
            )));
        }

        let mut rule_ids: HashSet<RuleId> = HashSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !rule_ids.insert(rule.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate rule id {} in group {}",
                    rule.id, self.id
                )));
            }
        }

        Ok(())
    }
}

/// Domain-matching rule kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleType {
    /// Full name equality
    Exact,
    /// The name itself or any subdomain of the pattern
    Suffix,
    /// Substring anywhere in the name
    Keyword,
    /// Regular expression over the whole name
    Regex,
}

/// A single domain-matching rule inside a group
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RuleConfig {
    /// Stable identifier, unique within the group
    pub id: RuleId,

    /// Human label
    pub name: String,

    /// Match kind
    #[serde(rename = "type")]
    pub rule_type: RuleType,

    /// Pattern interpreted according to `rule_type`
    pub pattern: String,

    /// Disabled rules are kept in config but never match
    #[serde(default = "default_true")]
    pub enable: bool,
}

impl RuleConfig {
    /// Validate the rule definition
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pattern.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "rule {} has an empty pattern",
                self.id
            )));
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_links() -> Vec<String> {
    vec!["br0".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> DnsServerAddr {
    DnsServerAddr::new("[::]", 3553)
}

fn default_upstream() -> DnsServerAddr {
    DnsServerAddr::new("127.0.0.1", 53)
}

fn default_chain_prefix() -> String {
    "MT_".to_string()
}

fn default_table_prefix() -> String {
    "mt_".to_string()
}

fn default_additional_ttl() -> u32 {
    3600
}
