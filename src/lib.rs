//! magitrickle: policy-driven per-domain traffic steering for Linux routers
//!
//! The daemon transparently intercepts DNS crossing the router, observes
//! the answers, and for every address resolved under a configured domain
//! rule inserts that address into a kernel IP-set wired (via firewall
//! marks and policy routing) to a chosen egress link. Clients keep using
//! their usual resolver; their traffic to matching hosts simply leaves
//! through another interface.
//!
//! # Architecture
//!
//! ```text
//! client -> :53 redirect -> DNS MITM proxy -> upstream resolver
//!                               |
//!                          response hook
//!                               v
//!                         records store -> group engine -> IP-sets
//!                                                             |
//!                                          mangle marks + policy routes
//!                                                             v
//!                                                     egress interface
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration schema and JSON loading
//! - [`records`]: A/AAAA + CNAME cache with alias resolution
//! - [`netfilter`]: iptables/ipset/ip adapter (idempotent assertions)
//! - [`dns`]: DNS MITM proxy (UDP + TCP)
//! - [`group`]: steering groups and full reconciliation
//! - [`app`]: lifecycle controller and group engine
//! - [`control`]: `netfilter.d` control socket
//! - [`link`]: kernel link monitoring
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod app;
pub mod config;
pub mod control;
pub mod dns;
pub mod error;
pub mod group;
pub mod link;
pub mod netfilter;
pub mod records;

pub use app::{fake_ptr_hook, App, Engine};
pub use config::{
    load_config, load_config_str, AppConfig, Config, GroupConfig, GroupId, RuleConfig, RuleId,
    RuleType,
};
pub use control::CONTROL_SOCKET_PATH;
pub use dns::{DnsMitmProxy, Transport, UpstreamResolver};
pub use error::{
    ConfigError, ControlError, DnsProxyError, GroupError, MagitrickleError, NetfilterError, Result,
};
pub use group::{CompiledRule, Group};
pub use netfilter::{
    CommandOutput, CommandRunner, Family, IpSet, LinkBinder, NetfilterHelper, PortRemap,
    RecordingRunner, SystemCommandRunner,
};
pub use records::{ARecord, Records};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
