//! DNS MITM proxy
//!
//! A recursive forwarder that sits between LAN clients and the real
//! resolver. Each query passes through a request hook (which may answer
//! it synthetically), is forwarded upstream over the client's transport,
//! passes through a response hook (which observes answers for the group
//! engine), and is relayed back byte-for-byte unless a hook substituted
//! a message.
//!
//! The proxy is stateless: concurrency is per-datagram (UDP) and
//! per-connection (TCP), with no ordering between queries.

pub mod proxy;
pub mod tcp;
pub mod udp;
pub mod upstream;

pub use proxy::{
    nxdomain_response, servfail_response, DnsMitmProxy, RequestAction, RequestHook, ResponseHook,
};
pub use tcp::listen_tcp;
pub use udp::listen_udp;
pub use upstream::UpstreamResolver;

/// Transport a query arrived on (and is forwarded over)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Datagram transport
    Udp,
    /// Stream transport with 2-byte length prefixes
    Tcp,
}

impl Transport {
    /// Lowercase protocol name for logging
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "udp",
            Self::Tcp => "tcp",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
