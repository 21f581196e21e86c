//! Core MITM query pipeline
//!
//! [`DnsMitmProxy::process_query`] is the single path every query takes,
//! regardless of transport:
//!
//! 1. parse the client message,
//! 2. run the request hook (pass / replace request / synthesize answer),
//! 3. forward to the upstream resolver over the same transport,
//! 4. run the response hook,
//! 5. relay the upstream bytes verbatim unless a hook substituted a
//!    message.
//!
//! Upstream failures turn into SERVFAIL answers carrying the client's
//! query id; the request is not retried.

use std::net::SocketAddr;
use std::sync::Arc;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::BinDecodable;
use tracing::debug;

use super::upstream::UpstreamResolver;
use super::Transport;

/// Outcome of the request hook
pub enum RequestAction {
    /// Forward the original request unchanged
    Pass,
    /// Forward this request instead of the original
    Replace(Message),
    /// Answer the client immediately, no upstream call
    Respond(Message),
}

/// Hook invoked for every inbound query before forwarding
pub type RequestHook =
    Arc<dyn Fn(SocketAddr, &Message, Transport) -> RequestAction + Send + Sync>;

/// Hook invoked for every upstream response before relaying
///
/// Returning `Some` substitutes the response sent to the client.
pub type ResponseHook =
    Arc<dyn Fn(SocketAddr, &Message, &Message, Transport) -> Option<Message> + Send + Sync>;

/// Stateless DNS forwarder with request/response hooks
pub struct DnsMitmProxy {
    upstream: UpstreamResolver,
    request_hook: Option<RequestHook>,
    response_hook: Option<ResponseHook>,
}

impl DnsMitmProxy {
    /// Create a proxy forwarding to the given resolver
    #[must_use]
    pub fn new(upstream: UpstreamResolver) -> Self {
        Self {
            upstream,
            request_hook: None,
            response_hook: None,
        }
    }

    /// Install the request hook
    #[must_use]
    pub fn with_request_hook(mut self, hook: RequestHook) -> Self {
        self.request_hook = Some(hook);
        self
    }

    /// Install the response hook
    #[must_use]
    pub fn with_response_hook(mut self, hook: ResponseHook) -> Self {
        self.response_hook = Some(hook);
        self
    }

    /// The upstream resolver this proxy forwards to
    #[must_use]
    pub fn upstream(&self) -> &UpstreamResolver {
        &self.upstream
    }

    /// Process one query and produce the serialized response, if any
    ///
    /// Returns `None` when the query is unparseable or the response
    /// cannot be serialized; the caller drops the exchange.
    pub async fn process_query(
        &self,
        client: SocketAddr,
        query: &[u8],
        transport: Transport,
    ) -> Option<Vec<u8>> {
        let mut request = match Message::from_bytes(query) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(client = %client, transport = %transport, error = %e, "dropping unparseable query");
                return None;
            }
        };

        let mut forward: Option<Vec<u8>> = None;
        if let Some(hook) = &self.request_hook {
            match hook(client, &request, transport) {
                RequestAction::Pass => {}
                RequestAction::Replace(replacement) => {
                    match replacement.to_vec() {
                        Ok(bytes) => {
                            forward = Some(bytes);
                            request = replacement;
                        }
                        Err(e) => {
                            debug!(client = %client, error = %e, "failed to serialize replacement request");
                            return serialize(&servfail_response(&request));
                        }
                    }
                }
                RequestAction::Respond(response) => {
                    return serialize(&response);
                }
            }
        }

        let forward_bytes = forward.as_deref().unwrap_or(query);
        let response_bytes = match self.upstream.query(forward_bytes, transport).await {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!(
                    client = %client,
                    upstream = %self.upstream.addr(),
                    transport = %transport,
                    error = %e,
                    "upstream query failed"
                );
                return serialize(&servfail_response(&request));
            }
        };

        if let Some(hook) = &self.response_hook {
            match Message::from_bytes(&response_bytes) {
                Ok(response) => {
                    if let Some(modified) = hook(client, &request, &response, transport) {
                        return serialize(&modified);
                    }
                }
                Err(e) => {
                    debug!(client = %client, error = %e, "relaying unparseable upstream response verbatim");
                }
            }
        }

        Some(response_bytes)
    }
}

/// Build a SERVFAIL answer for a request
#[must_use]
pub fn servfail_response(request: &Message) -> Message {
    error_response(request, ResponseCode::ServFail)
}

/// Build an NXDOMAIN answer for a request
#[must_use]
pub fn nxdomain_response(request: &Message) -> Message {
    error_response(request, ResponseCode::NXDomain)
}

fn error_response(request: &Message, code: ResponseCode) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(code);
    response.add_queries(request.queries().to_vec());
    response
}

fn serialize(message: &Message) -> Option<Vec<u8>> {
    match message.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(error = %e, "failed to serialize DNS response");
            None
        }
    }
}
