//! WebAuthn from inside the wallet iframe, with the parent-bridge fallback.
//!
//! The iframe tries the platform first. `AncestorBlocked` goes straight to the
//! parent page; `FocusBlocked` is retried locally after reclaiming focus, then
//! goes to the parent. Every other failure is returned as is.

use std::rc::Rc;
use std::time::Duration;

use log::{debug, info, warn};

use super::{message_types, Disposition, TransportEndpoint, TransportMessage};
use crate::errors::{CeremonyErrorKind, CredentialCeremonyError, TransportError};
use crate::types::{CeremonyKind, CeremonyOptions, WebAuthnCredential};
use crate::utils::sleep;
use crate::webauthn::{run_platform_ceremony, CredentialCeremony, WebAuthnPlatform};

fn request_type(kind: CeremonyKind) -> &'static str {
    match kind {
        CeremonyKind::Create => message_types::WALLET_WEBAUTHN_CREATE,
        CeremonyKind::Get => message_types::WALLET_WEBAUTHN_GET,
    }
}

// === IFRAME SIDE ===

pub struct BridgedWebAuthn<P> {
    platform: P,
    parent: Rc<TransportEndpoint>,
}

impl<P: WebAuthnPlatform> BridgedWebAuthn<P> {
    pub fn new(platform: P, parent: Rc<TransportEndpoint>) -> Self {
        Self { platform, parent }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    async fn retry_after_focus(
        &self,
        options: &CeremonyOptions,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        let attempts = self.parent.config().focus_retry_attempts;
        let backoff_ms = self.parent.config().focus_retry_backoff_ms;

        for attempt in 1..=attempts {
            sleep(Duration::from_millis(backoff_ms * u64::from(attempt))).await;
            let focused = self.platform.reclaim_focus().await;
            debug!("Focus retry {}/{} (focused: {})", attempt, attempts, focused);

            match run_platform_ceremony(&self.platform, options).await {
                Ok(credential) => return Ok(credential),
                Err(CredentialCeremonyError::FocusBlocked) => continue,
                Err(CredentialCeremonyError::AncestorBlocked) => {
                    return self.via_parent(options).await
                }
                Err(other) => return Err(other.into()),
            }
        }

        info!("Focus could not be reclaimed; using parent bridge");
        self.via_parent(options).await
    }

    /// Run the ceremony in the parent page.
    pub async fn via_parent(
        &self,
        options: &CeremonyOptions,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        let payload = serde_json::to_value(options)
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        let result = self
            .parent
            .request(request_type(options.kind()), payload, None)
            .await?;
        serde_json::from_value(result)
            .map_err(|e| TransportError::MalformedMessage(format!("bridged credential: {}", e)).into())
    }
}

impl<P: WebAuthnPlatform> CredentialCeremony for BridgedWebAuthn<P> {
    async fn perform(
        &self,
        options: &CeremonyOptions,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        match run_platform_ceremony(&self.platform, options).await {
            Ok(credential) => Ok(credential),
            Err(CredentialCeremonyError::AncestorBlocked) => {
                info!("WebAuthn blocked in cross-origin frame; using parent bridge");
                self.via_parent(options).await
            }
            Err(CredentialCeremonyError::FocusBlocked) => self.retry_after_focus(options).await,
            Err(other) => Err(other.into()),
        }
    }
}

// === PARENT SIDE ===

/// Runs bridged ceremonies at the top level on behalf of the wallet iframe.
pub struct ParentBridgeHost<P> {
    platform: P,
    iframe: Rc<TransportEndpoint>,
}

impl<P: WebAuthnPlatform> ParentBridgeHost<P> {
    pub fn new(platform: P, iframe: Rc<TransportEndpoint>) -> Self {
        Self { platform, iframe }
    }

    /// Feed one `message` event from the iframe. Returns the disposition;
    /// bridged ceremonies are answered before this returns.
    pub async fn on_message(&self, origin: &str, data: &serde_json::Value) -> Disposition {
        let disposition = self.iframe.handle_inbound(origin, data);
        if let Disposition::Request(request) = &disposition {
            let bridged = matches!(
                request.message_type.as_str(),
                message_types::WALLET_WEBAUTHN_CREATE | message_types::WALLET_WEBAUTHN_GET
            );
            if bridged {
                if let Err(e) = self.handle_request(request).await {
                    warn!("Bridged WebAuthn reply failed: {}", e);
                }
            }
        }
        disposition
    }

    pub async fn handle_request(&self, request: &TransportMessage) -> Result<(), TransportError> {
        let result = self.run(request).await;
        if let Err(kind) = &result {
            debug!("Bridged ceremony {} failed: {}", request.request_id, kind.tag());
        }
        match result {
            Ok(credential) => {
                let payload = serde_json::to_value(&credential)
                    .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
                self.iframe.respond(request, Ok(payload))
            }
            Err(kind) => self.iframe.respond(request, Err(&kind)),
        }
    }

    async fn run(&self, request: &TransportMessage) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        let options: CeremonyOptions = serde_json::from_value(request.payload.clone())
            .map_err(|e| TransportError::MalformedMessage(e.to_string()))?;
        if request_type(options.kind()) != request.message_type {
            return Err(TransportError::MalformedMessage(format!(
                "{} carries {:?} options",
                request.message_type,
                options.kind()
            ))
            .into());
        }
        Ok(run_platform_ceremony(&self.platform, &options).await?)
    }
}
