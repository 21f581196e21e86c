//! Netfilter orchestration layer
//!
//! Thin, idempotent contract over the kernel's packet-filter and IP-set
//! control planes, driven through the userland binaries behind the
//! [`CommandRunner`] seam:
//!
//! - [`NetfilterHelper`]: chain-prefix-owned iptables/ip6tables rules
//! - [`IpSet`]: per-group kernel sets with per-entry timeouts
//! - [`PortRemap`]: transparent :53 redirect into the DNS proxy
//! - [`LinkBinder`]: set membership -> firewall mark -> policy route
//!
//! Every assertion is "ensure present" or "ensure absent", never a
//! toggle, so external actors flushing or rebuilding the firewall only
//! cause drift that the `netfilter.d` hooks repair.

pub mod command;
pub mod helper;
pub mod ipset;
pub mod link_binder;
pub mod port_remap;

pub use command::{CommandOutput, CommandRunner, RecordingRunner, SystemCommandRunner};
pub use helper::{Family, NetfilterHelper};
pub use ipset::IpSet;
pub use link_binder::{derive_slot, LinkBinder, MARK_BASE, TABLE_BASE};
pub use port_remap::PortRemap;
