//! TCP listener for the DNS MITM proxy
//!
//! Accepts connections and handles each in its own task. Messages use
//! the RFC 1035 2-byte length prefix; a connection may carry multiple
//! queries back to back and is closed after an idle timeout.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::proxy::DnsMitmProxy;
use super::Transport;
use crate::error::DnsProxyError;

/// Maximum DNS message size over TCP (RFC 1035)
pub const MAX_TCP_MESSAGE_SIZE: usize = 65535;

/// Idle deadline for a client connection
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Serve DNS over TCP until cancelled
///
/// # Errors
///
/// Returns an error if the listener cannot be bound; accept errors are
/// logged and the loop continues.
pub async fn listen_tcp(
    proxy: Arc<DnsMitmProxy>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), DnsProxyError> {
    let listener = TcpListener::bind(addr).await.map_err(|e| {
        DnsProxyError::BindError {
            addr,
            reason: e.to_string(),
        }
    })?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| DnsProxyError::network_io("failed to get local address", e))?;

    info!(addr = %local_addr, "DNS TCP proxy listening");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!(addr = %local_addr, "DNS TCP proxy shutting down");
                return Ok(());
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, client)) => {
                        trace!(client = %client, "accepted TCP connection");
                        let proxy = Arc::clone(&proxy);
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(proxy, stream, client, cancel).await {
                                debug!(client = %client, error = %e, "TCP connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "TCP accept error");
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    proxy: Arc<DnsMitmProxy>,
    mut stream: TcpStream,
    client: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), DnsProxyError> {
    loop {
        let mut len_buf = [0u8; 2];
        let read = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            read = timeout(IDLE_TIMEOUT, stream.read_exact(&mut len_buf)) => read,
        };
        match read {
            Ok(Ok(_)) => {}
            // Idle timeout or clean EOF both end the connection quietly.
            Err(_) => return Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Ok(Err(e)) => return Err(DnsProxyError::network_io("TCP read failed", e)),
        }

        let msg_len = usize::from(u16::from_be_bytes(len_buf));
        if msg_len == 0 {
            return Ok(());
        }

        let mut query = vec![0u8; msg_len];
        timeout(IDLE_TIMEOUT, stream.read_exact(&mut query))
            .await
            .map_err(|_| DnsProxyError::network("TCP read deadline exceeded"))?
            .map_err(|e| DnsProxyError::network_io("TCP read failed", e))?;

        let Some(response) = proxy.process_query(client, &query, Transport::Tcp).await else {
            continue;
        };

        let response_len = u16::try_from(response.len()).map_err(|_| {
            DnsProxyError::serialize(format!("TCP response too large: {} bytes", response.len()))
        })?;
        stream
            .write_all(&response_len.to_be_bytes())
            .await
            .map_err(|e| DnsProxyError::network_io("TCP write failed", e))?;
        stream
            .write_all(&response)
            .await
            .map_err(|e| DnsProxyError::network_io("TCP write failed", e))?;
        stream
            .flush()
            .await
            .map_err(|e| DnsProxyError::network_io("TCP flush failed", e))?;
    }
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

    #[tokio::test]
    async fn test_tcp_listener_round_trip() {
        let resolver = UpstreamResolver::new("127.0.0.1:1".parse().unwrap())
            .with_timeout(Duration::from_millis(50));
        let proxy = Arc::new(crate::dns::DnsMitmProxy::new(resolver).with_request_hook(
            Arc::new(|_client, request, _transport| {
                RequestAction::Respond(nxdomain_response(request))
            }),
        ));

        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listen_tcp(proxy, addr, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut query = Message::new();
        query.set_id(0x77);
        query.add_query(Query::query(
            Name::from_str("example.com.").unwrap(),
            RecordType::A,
        ));
        let bytes = query.to_vec().unwrap();
        let len = u16::try_from(bytes.len()).unwrap();
        client.write_all(&len.to_be_bytes()).await.unwrap();
        client.write_all(&bytes).await.unwrap();

        let mut len_buf = [0u8; 2];
        client.read_exact(&mut len_buf).await.unwrap();
        let resp_len = usize::from(u16::from_be_bytes(len_buf));
        let mut resp = vec![0u8; resp_len];
        client.read_exact(&mut resp).await.unwrap();

        let response = Message::from_bytes(&resp).unwrap();
        assert_eq!(response.id(), 0x77);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
