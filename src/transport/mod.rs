//! Cross-origin transport between the hosting page and the wallet iframe.
//!
//! Messages are JSON envelopes correlated by `requestId`. Each endpoint talks
//! to exactly one peer origin and holds only a weak handle to the peer.

use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{scrub_error_message, CeremonyErrorKind, TransportError, TransportResult};

pub mod endpoint;
pub mod parent_bridge;
pub mod pending;

#[cfg(test)]
mod tests;

pub use endpoint::{Disposition, TransportEndpoint};
pub use parent_bridge::{BridgedWebAuthn, ParentBridgeHost};
pub use pending::{PendingGuard, PendingRequests, PendingTransportRequest};

// === MESSAGE TYPES ===

pub mod message_types {
    pub const WALLET_WEBAUTHN_CREATE: &str = "WALLET_WEBAUTHN_CREATE";
    pub const WALLET_WEBAUTHN_GET: &str = "WALLET_WEBAUTHN_GET";
    pub const WALLET_WEBAUTHN_RESULT: &str = "WALLET_WEBAUTHN_RESULT";
    pub const WALLET_REQUEST: &str = "WALLET_REQUEST";
    pub const WALLET_RESPONSE: &str = "WALLET_RESPONSE";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";

    pub fn is_response(message_type: &str) -> bool {
        matches!(message_type, WALLET_WEBAUTHN_RESULT | WALLET_RESPONSE | PONG)
    }

    /// Response type paired with a request type.
    pub fn response_type_for(request_type: &str) -> Option<&'static str> {
        match request_type {
            WALLET_WEBAUTHN_CREATE | WALLET_WEBAUTHN_GET => Some(WALLET_WEBAUTHN_RESULT),
            WALLET_REQUEST => Some(WALLET_RESPONSE),
            PING => Some(PONG),
            _ => None,
        }
    }
}

// === ENVELOPE ===

/// Error carried in a failed response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TransportFault {
    /// Machine-checkable tag, see `CeremonyErrorKind::tag`
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<CeremonyErrorKind>,
}

impl From<&CeremonyErrorKind> for TransportFault {
    fn from(kind: &CeremonyErrorKind) -> Self {
        Self {
            kind: kind.tag().to_string(),
            message: scrub_error_message(&kind.to_string()),
            detail: Some(kind.clone()),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub request_id: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ok: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TransportFault>,
}

impl TransportMessage {
    /// New request with a fresh v4 `requestId`.
    pub fn request(message_type: &str, payload: Value) -> Self {
        Self {
            message_type: message_type.to_string(),
            request_id: uuid::Uuid::new_v4().to_string(),
            payload,
            ok: None,
            error: None,
        }
    }

    pub fn response_to(
        request: &TransportMessage,
        result: Result<Value, &CeremonyErrorKind>,
    ) -> TransportResult<Self> {
        let response_type =
            message_types::response_type_for(&request.message_type).ok_or_else(|| {
                TransportError::MalformedMessage(format!(
                    "no response type for {}",
                    request.message_type
                ))
            })?;
        let (payload, ok, error) = match result {
            Ok(payload) => (payload, true, None),
            Err(kind) => (Value::Null, false, Some(TransportFault::from(kind))),
        };
        Ok(Self {
            message_type: response_type.to_string(),
            request_id: request.request_id.clone(),
            payload,
            ok: Some(ok),
            error,
        })
    }

    /// Parse an inbound `MessageEvent.data`.
    pub fn parse(data: &Value) -> TransportResult<Self> {
        if !data.is_object() {
            return Err(TransportError::MalformedMessage(
                "message data is not an object".to_string(),
            ));
        }
        let message: TransportMessage = serde_json::from_value(data.clone())
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        if message.request_id.is_empty() {
            return Err(TransportError::MalformedMessage(
                "empty requestId".to_string(),
            ));
        }
        Ok(message)
    }

    pub fn is_response(&self) -> bool {
        message_types::is_response(&self.message_type)
    }

    /// Payload of a response, or the error it carries.
    pub fn into_payload(self) -> Result<Value, CeremonyErrorKind> {
        if self.ok == Some(false) || self.error.is_some() {
            return Err(match self.error {
                Some(TransportFault {
                    detail: Some(kind), ..
                }) => kind,
                Some(fault) => TransportError::Remote(fault.message).into(),
                None => TransportError::Remote("request failed".to_string()).into(),
            });
        }
        Ok(self.payload)
    }
}

// === TARGETS ===

/// Something messages can be posted to: a parent window, an iframe's
/// `contentWindow`, or a `MessagePort`.
pub trait MessageTarget {
    fn post_message(&self, message: &TransportMessage, target_origin: &str) -> TransportResult<()>;
}

/// Non-owning handle to a peer context plus the origin it must have.
#[derive(Clone)]
pub struct WeakTarget {
    origin: String,
    handle: Weak<dyn MessageTarget>,
}

impl WeakTarget {
    pub fn new<T: MessageTarget + 'static>(origin: &str, target: &Rc<T>) -> Self {
        let target: Rc<dyn MessageTarget> = target.clone();
        let handle = Rc::downgrade(&target);
        Self {
            origin: origin.to_string(),
            handle,
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Reject messages that did not come from this peer's origin.
    pub fn check_origin(&self, origin: &str) -> TransportResult<()> {
        if origin == self.origin {
            return Ok(());
        }
        Err(TransportError::OriginMismatch {
            expected: self.origin.clone(),
            actual: origin.to_string(),
        })
    }

    pub fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }

    pub fn post(&self, message: &TransportMessage) -> TransportResult<()> {
        let target = self.handle.upgrade().ok_or(TransportError::Disconnected)?;
        target.post_message(message, &self.origin)
    }
}
