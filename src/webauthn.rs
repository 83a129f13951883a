//! Platform WebAuthn seam and rejection classification.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::errors::{CeremonyErrorKind, CredentialCeremonyError};
use crate::types::{
    CeremonyOptions, CredentialCreationOptions, CredentialRequestOptions, WebAuthnCredential,
};

/// Raw rejection from `navigator.credentials.create/get`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlatformRejection {
    /// DOMException name, e.g. `NotAllowedError`
    pub name: String,
    pub message: String,
    /// Structured reason when the platform (or host shim) provides one
    #[serde(default)]
    pub code: Option<String>,
}

impl PlatformRejection {
    pub fn new(name: &str, message: &str) -> Self {
        Self {
            name: name.to_string(),
            message: message.to_string(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &str) -> Self {
        self.code = Some(code.to_string());
        self
    }
}

/// Platform authenticator API as seen from one browsing context.
#[allow(async_fn_in_trait)]
pub trait WebAuthnPlatform {
    async fn create(
        &self,
        options: &CredentialCreationOptions,
    ) -> Result<WebAuthnCredential, PlatformRejection>;

    async fn get(
        &self,
        options: &CredentialRequestOptions,
    ) -> Result<WebAuthnCredential, PlatformRejection>;

    /// Try to give this document focus again; returns whether it has focus.
    async fn reclaim_focus(&self) -> bool {
        false
    }
}

/// Anything that can complete a credential ceremony: the platform directly, or
/// the platform with the parent-bridge fallback.
#[allow(async_fn_in_trait)]
pub trait CredentialCeremony {
    async fn perform(
        &self,
        options: &CeremonyOptions,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind>;
}

/// Run a ceremony on the platform and classify any rejection.
pub async fn run_platform_ceremony<P: WebAuthnPlatform>(
    platform: &P,
    options: &CeremonyOptions,
) -> Result<WebAuthnCredential, CredentialCeremonyError> {
    let result = match options {
        CeremonyOptions::Create(o) => platform.create(o).await,
        CeremonyOptions::Get(o) => platform.get(o).await,
    };
    result.map_err(|rejection| classify_rejection(&rejection))
}

/// Uses the platform in the current context with no fallback.
pub struct DirectWebAuthn<P>(pub P);

impl<P: WebAuthnPlatform> CredentialCeremony for DirectWebAuthn<P> {
    async fn perform(
        &self,
        options: &CeremonyOptions,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        Ok(run_platform_ceremony(&self.0, options).await?)
    }
}

// === REJECTION CLASSIFICATION ===

/// Structured codes a platform shim may attach to a rejection.
pub mod rejection_codes {
    pub const ANCESTOR_BLOCKED: &str = "ancestor-blocked";
    pub const FOCUS_BLOCKED: &str = "focus-blocked";
    pub const CANCELLED: &str = "cancelled";
}

const ANCESTOR_PATTERNS: [&str; 4] = [
    "same origin as its ancestors",
    "cross-origin",
    "publickey-credentials-create",
    "publickey-credentials-get",
];

const FOCUS_PATTERNS: [&str; 3] = ["not focused", "does not have focus", "document is not focused"];

/// Map a platform rejection onto `CredentialCeremonyError`.
///
/// Order: structured code, then exception name, then message text. When the
/// message matches both the ancestor and focus patterns the result is
/// `Ambiguous` rather than a guess.
pub fn classify_rejection(rejection: &PlatformRejection) -> CredentialCeremonyError {
    if let Some(code) = rejection.code.as_deref() {
        match code {
            rejection_codes::ANCESTOR_BLOCKED => return CredentialCeremonyError::AncestorBlocked,
            rejection_codes::FOCUS_BLOCKED => return CredentialCeremonyError::FocusBlocked,
            rejection_codes::CANCELLED => return CredentialCeremonyError::Cancelled,
            other => warn!("Unrecognized WebAuthn rejection code {}", other),
        }
    }

    match rejection.name.as_str() {
        "AbortError" => return CredentialCeremonyError::Cancelled,
        "NotAllowedError" | "SecurityError" => {}
        _ => {
            return CredentialCeremonyError::Platform {
                name: rejection.name.clone(),
                message: rejection.message.clone(),
            }
        }
    }

    let message = rejection.message.to_ascii_lowercase();
    let ancestor = ANCESTOR_PATTERNS.iter().any(|p| message.contains(p));
    let focus = FOCUS_PATTERNS.iter().any(|p| message.contains(p));
    match (ancestor, focus) {
        (true, true) => {
            warn!(
                "WebAuthn rejection matches both ancestor and focus restrictions: {}",
                rejection.message
            );
            CredentialCeremonyError::Ambiguous(rejection.message.clone())
        }
        (true, false) => CredentialCeremonyError::AncestorBlocked,
        (false, true) => CredentialCeremonyError::FocusBlocked,
        (false, false) if rejection.name == "SecurityError" => CredentialCeremonyError::Platform {
            name: rejection.name.clone(),
            message: rejection.message.clone(),
        },
        (false, false) => CredentialCeremonyError::NotAllowed(rejection.message.clone()),
    }
}
