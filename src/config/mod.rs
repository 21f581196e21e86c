//! Configuration types and loading
//!
//! The configuration document carries a `config_version` (imports require
//! the `0.1.` prefix), the daemon-wide [`AppConfig`] and the list of
//! steering groups. See [`types`] for the schema and [`loader`] for file
//! handling.

pub mod loader;
pub mod types;

pub use loader::{config_to_string, create_default_config, load_config, load_config_str};
pub use types::{
    AppConfig, Config, DnsProxyConfig, DnsServerAddr, GroupConfig, GroupId, IpsetConfig,
    IptablesConfig, NetfilterConfig, RuleConfig, RuleId, RuleType, EXPORT_CONFIG_VERSION,
    SUPPORTED_CONFIG_VERSION_PREFIX,
};
