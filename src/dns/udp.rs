//! UDP listener for the DNS MITM proxy
//!
//! One socket, one receive loop; each datagram is handled in its own
//! task so slow upstreams never block the receive path.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::proxy::DnsMitmProxy;
use super::Transport;
use crate::error::DnsProxyError;

/// Maximum DNS message size over UDP (with EDNS0)
pub const MAX_UDP_MESSAGE_SIZE: usize = 4096;

/// Serve DNS over UDP until cancelled
///
/// # Errors
///
/// Returns an error if the socket cannot be bound or on a fatal socket
/// failure; transient receive errors are logged and skipped.
pub async fn listen_udp(
    proxy: Arc<DnsMitmProxy>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), DnsProxyError> {
    let socket = Arc::new(UdpSocket::bind(addr).await.map_err(|e| {
        DnsProxyError::BindError {
            addr,
            reason: e.to_string(),
        }
    })?);
    let local_addr = socket
        .local_addr()
        .map_err(|e| DnsProxyError::network_io("failed to get local address", e))?;

    info!(addr = %local_addr, "DNS UDP proxy listening");

    let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(addr = %local_addr, "DNS UDP proxy shutting down");
                return Ok(());
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, client)) => {
                        trace!(client = %client, len, "received UDP query");
                        let query = buf[..len].to_vec();
                        let proxy = Arc::clone(&proxy);
                        let socket = Arc::clone(&socket);
                        tokio::spawn(async move {
                            if let Some(response) =
                                proxy.process_query(client, &query, Transport::Udp).await
                            {
                                if let Err(e) = socket.send_to(&response, client).await {
                                    debug!(client = %client, error = %e, "failed to send UDP response");
                                }
                            }
                        });
                    }
                    Err(e) if is_fatal(&e) => {
                        return Err(DnsProxyError::network_io("fatal UDP receive error", e));
                    }
                    Err(e) => {
                        warn!(error = %e, "transient UDP receive error");
                    }
                }
            }
        }
    }
}

/// Whether a receive error means the socket is beyond recovery
fn is_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AddrInUse | io::ErrorKind::OutOfMemory
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::proxy::{nxdomain_response, RequestAction};
    use crate::dns::upstream::UpstreamResolver;
    use hickory_proto::op::{Message, Query, ResponseCode};
    use hickory_proto::rr::{Name, RecordType};
    use hickory_proto::serialize::binary::BinDecodable;
    use std::str::FromStr;
    use std::time::Duration;

    #[tokio::test]
    async fn test_listener_answers_and_cancels() {
        // Proxy that answers everything synthetically.
        let resolver = UpstreamResolver::new("127.0.0.1:1".parse().unwrap())
            .with_timeout(Duration::from_millis(50));
        let proxy = Arc::new(crate::dns::DnsMitmProxy::new(resolver).with_request_hook(
            Arc::new(|_client, request, _transport| {
                RequestAction::Respond(nxdomain_response(request))
            }),
        ));

        // Bind on an ephemeral port by probing a free one.
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen_udp(proxy, addr, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut query = Message::new();
        query.set_id(0x42);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        client
            .send_to(&query.to_vec().unwrap(), addr)
            .await
            .unwrap();

        let mut buf = vec![0u8; MAX_UDP_MESSAGE_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(1), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let response = Message::from_bytes(&buf[..len]).unwrap();
        assert_eq!(response.id(), 0x42);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let holder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = holder.local_addr().unwrap();

        let resolver = UpstreamResolver::new("127.0.0.1:1".parse().unwrap());
        let proxy = Arc::new(crate::dns::DnsMitmProxy::new(resolver));

        let err = listen_udp(proxy, addr, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DnsProxyError::BindError { .. }));
    }
}
