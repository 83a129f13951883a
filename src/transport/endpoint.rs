use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use super::pending::{PendingGuard, PendingRequests};
use super::{message_types, TransportMessage, WeakTarget};
use crate::config::TransportConfig;
use crate::errors::{CeremonyErrorKind, TransportError, TransportResult};
use crate::utils::timeout;

/// What happened to an inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Wrong origin; nothing observable happened.
    Dropped,
    /// Malformed, stale, or unmatched; nothing observable happened.
    Ignored,
    /// Control message answered by the endpoint itself.
    Control,
    /// Delivered to the waiting `send`.
    Resolved,
    /// A request from the peer for the caller to handle and `respond` to.
    Request(TransportMessage),
}

/// One side of a page/iframe channel.
pub struct TransportEndpoint {
    peer: WeakTarget,
    pending: PendingRequests,
    config: TransportConfig,
}

impl TransportEndpoint {
    pub fn new(peer: WeakTarget, config: TransportConfig) -> Self {
        Self {
            peer,
            pending: PendingRequests::new(),
            config,
        }
    }

    pub fn expected_origin(&self) -> &str {
        self.peer.origin()
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    pub fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Post a request and wait for the correlated response, up to
    /// `timeout_ms` (the configured default when `None`).
    pub async fn send(
        &self,
        message_type: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> TransportResult<TransportMessage> {
        let timeout_ms = timeout_ms.unwrap_or(self.config.request_timeout_ms);
        let message = TransportMessage::request(message_type, payload);
        let request_id = message.request_id.clone();

        let receiver = self.pending.register(&request_id, self.peer.origin());
        let _guard = PendingGuard::new(&self.pending, &request_id);
        self.peer.post(&message)?;
        debug!("Sent {} request {}", message_type, request_id);

        match timeout(Duration::from_millis(timeout_ms), receiver).await {
            Some(Ok(response)) => Ok(response),
            Some(Err(_)) => Err(TransportError::Cancelled(request_id)),
            None => {
                warn!(
                    "{} request {} timed out after {}ms",
                    message_type, request_id, timeout_ms
                );
                Err(TransportError::Timeout {
                    request_id,
                    timeout_ms,
                })
            }
        }
    }

    /// Send and unwrap the response payload.
    pub async fn request(
        &self,
        message_type: &str,
        payload: Value,
        timeout_ms: Option<u64>,
    ) -> Result<Value, CeremonyErrorKind> {
        self.send(message_type, payload, timeout_ms)
            .await?
            .into_payload()
    }

    /// Route one inbound message. The origin is checked before the data is
    /// even parsed, and failures never produce a reply.
    pub fn handle_inbound(&self, origin: &str, data: &Value) -> Disposition {
        if let Err(e) = self.peer.check_origin(origin) {
            debug!("Dropping inbound message: {}", e);
            return Disposition::Dropped;
        }

        let message = match TransportMessage::parse(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring inbound message: {}", e);
                return Disposition::Ignored;
            }
        };

        if message.is_response() {
            let request_id = message.request_id.clone();
            if self.pending.resolve(message, origin) {
                return Disposition::Resolved;
            }
            debug!("Ignoring response for unknown or expired request {}", request_id);
            return Disposition::Ignored;
        }

        match message.message_type.as_str() {
            message_types::PING => match self.respond(&message, Ok(Value::Null)) {
                Ok(()) => Disposition::Control,
                Err(e) => {
                    debug!("PING reply failed: {}", e);
                    Disposition::Ignored
                }
            },
            t if message_types::response_type_for(t).is_some() => Disposition::Request(message),
            other => {
                debug!("Ignoring unknown message type {}", other);
                Disposition::Ignored
            }
        }
    }

    /// Answer a request received through `handle_inbound`.
    pub fn respond(
        &self,
        request: &TransportMessage,
        result: Result<Value, &CeremonyErrorKind>,
    ) -> TransportResult<()> {
        let response = TransportMessage::response_to(request, result)?;
        self.peer.post(&response)
    }
}
