//! Upstream DNS forwarding
//!
//! Sends serialized queries to the configured recursive resolver over
//! UDP or TCP, with a bounded deadline per attempt. The resolver address
//! and timeout are fixed at construction; each UDP query uses a fresh
//! ephemeral socket, each TCP query a fresh connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::trace;

use super::Transport;
use crate::error::DnsProxyError;

/// Default per-query deadline
const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Receive buffer for UDP responses (EDNS0-sized)
const UDP_RECV_BUFFER_SIZE: usize = 4096;

/// Forwards queries to one upstream resolver
#[derive(Debug, Clone)]
pub struct UpstreamResolver {
    addr: SocketAddr,
    timeout: Duration,
}

impl UpstreamResolver {
    /// Create a resolver client with the default timeout
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    /// Override the per-query deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The upstream resolver address
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Forward a serialized query and return the raw response bytes
    ///
    /// # Errors
    ///
    /// Returns `DnsProxyError::UpstreamTimeout` when the deadline passes
    /// and `DnsProxyError::NetworkError` for socket failures.
    pub async fn query(
        &self,
        query: &[u8],
        transport: Transport,
    ) -> Result<Vec<u8>, DnsProxyError> {
        trace!(upstream = %self.addr, transport = %transport, len = query.len(), "forwarding query");
        match transport {
            Transport::Udp => self.query_udp(query).await,
            Transport::Tcp => self.query_tcp(query).await,
        }
    }

    async fn query_udp(&self, query: &[u8]) -> Result<Vec<u8>, DnsProxyError> {
        let bind_addr: SocketAddr = if self.addr.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DnsProxyError::network_io("failed to bind upstream UDP socket", e))?;

        socket.send_to(query, self.addr).await.map_err(|e| {
            DnsProxyError::network_io(format!("failed to send query to {}", self.addr), e)
        })?;

        let mut buf = vec![0u8; UDP_RECV_BUFFER_SIZE];
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let (len, from) = timeout(remaining, socket.recv_from(&mut buf))
                .await
                .map_err(|_| DnsProxyError::UpstreamTimeout {
                    addr: self.addr,
                    timeout: self.timeout,
                })?
                .map_err(|e| DnsProxyError::network_io("upstream UDP recv failed", e))?;

            // Drop datagrams from anyone but the resolver we asked.
            if from != self.addr {
                continue;
            }
            buf.truncate(len);
            return Ok(buf);
        }
    }

    async fn query_tcp(&self, query: &[u8]) -> Result<Vec<u8>, DnsProxyError> {
        let len = u16::try_from(query.len()).map_err(|_| {
            DnsProxyError::serialize(format!("TCP query too large: {} bytes", query.len()))
        })?;

        let fut = async {
            let mut stream = TcpStream::connect(self.addr)
                .await
                .map_err(|e| {
                    DnsProxyError::network_io(format!("failed to connect to {}", self.addr), e)
                })?;

            stream
                .write_all(&len.to_be_bytes())
                .await
                .map_err(|e| DnsProxyError::network_io("upstream TCP write failed", e))?;
            stream
                .write_all(query)
                .await
                .map_err(|e| DnsProxyError::network_io("upstream TCP write failed", e))?;

            let mut len_buf = [0u8; 2];
            stream
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| DnsProxyError::network_io("upstream TCP read failed", e))?;
            let resp_len = usize::from(u16::from_be_bytes(len_buf));

            let mut resp = vec![0u8; resp_len];
            stream
                .read_exact(&mut resp)
                .await
                .map_err(|e| DnsProxyError::network_io("upstream TCP read failed", e))?;
            Ok(resp)
        };

        timeout(self.timeout, fut)
            .await
            .map_err(|_| DnsProxyError::UpstreamTimeout {
                addr: self.addr,
                timeout: self.timeout,
            })?
    }
}
