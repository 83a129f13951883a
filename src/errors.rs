//! Error taxonomy for the wallet core.
//!
//! Each concern has its own enum; `CeremonyError` wraps any of them together with
//! the ceremony phase at which it occurred. All errors are `Clone + Serialize` so
//! they can cross the iframe transport as a `kind` tag plus a readable message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a rejected WebAuthn ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum CredentialCeremonyError {
    #[error("WebAuthn ceremony was cancelled")]
    Cancelled,
    #[error("WebAuthn ceremony not allowed: {0}")]
    NotAllowed(String),
    /// Cross-origin ancestor restriction: the iframe may not run WebAuthn itself.
    #[error("WebAuthn blocked in cross-origin frame")]
    AncestorBlocked,
    /// The document did not have focus when the ceremony started.
    #[error("WebAuthn blocked: document not focused")]
    FocusBlocked,
    /// The rejection matched more than one blocked classification.
    #[error("ambiguous WebAuthn rejection: {0}")]
    Ambiguous(String),
    #[error("WebAuthn platform error {name}: {message}")]
    Platform { name: String, message: String },
    #[error("credential is missing PRF results")]
    MissingPrfResults,
}

/// Problems with a VRF challenge presented for verification.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum ChallengeValidationError {
    #[error("malformed VRF challenge: {0}")]
    MalformedChallenge(String),
    #[error("VRF challenge is missing required field {0}")]
    MissingField(String),
    #[error("VRF challenge field {field} is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("random challenge presented where a verifiable challenge is required")]
    NotVerifiable,
    #[error("VRF proof did not verify")]
    ProofRejected,
}

/// Shamir 3-pass key-wrap failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum KeyWrapError {
    #[error("unknown server key id {0}")]
    UnknownKeyId(String),
    #[error("invalid Shamir prime: {0}")]
    InvalidPrime(String),
    #[error("Shamir prime too small: {bits} bits (minimum {min_bits})")]
    PrimeTooSmall { bits: usize, min_bits: usize },
    #[error("key set changed during rotation (expected current key {expected}, found {found})")]
    RotationConflict { expected: String, found: String },
    #[error("invalid server keypair: {0}")]
    InvalidKeypair(String),
    #[error("modular inverse not found")]
    ModularInverseNotFound,
    #[error("secure random generation failed")]
    RandomGenerationFailed,
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("KEK encryption failed: {0}")]
    EncryptionFailed(String),
    #[error("KEK decryption failed: {0}")]
    DecryptionFailed(String),
    #[error("grace key persistence failed: {0}")]
    Persistence(String),
    #[error("relay request failed: {0}")]
    Relay(String),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Cross-context transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum TransportError {
    #[error("request {request_id} timed out after {timeout_ms}ms")]
    Timeout { request_id: String, timeout_ms: u64 },
    #[error("origin mismatch: expected {expected}, got {actual}")]
    OriginMismatch { expected: String, actual: String },
    #[error("malformed transport message: {0}")]
    MalformedMessage(String),
    #[error("message target is no longer available")]
    Disconnected,
    #[error("request {0} was cancelled")]
    Cancelled(String),
    #[error("remote handler failed: {0}")]
    Remote(String),
}

/// VRF keypair, PRF and AEAD failures inside the derivation service.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum DerivationError {
    #[error("No VRF keypair in memory - please generate keypair first")]
    NoVrfKeypair,
    #[error("VRF keypair not unlocked - please login first")]
    VrfNotUnlocked,
    #[error("Invalid PRF output: {0}")]
    InvalidPrfOutput(String),
    #[error("HKDF derivation failed: {0}")]
    Hkdf(String),
    #[error("AEAD operation failed: {0}")]
    Aead(String),
    #[error("Invalid IV length: expected {expected} bytes, got {actual} bytes")]
    InvalidIvLength { expected: usize, actual: usize },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("VRF cryptographic error: {0}")]
    VrfCrypto(String),
    #[error("VRF public key mismatch - expected: {expected}, actual: {actual}")]
    PublicKeyMismatch { expected: String, actual: String },
    #[error("Invalid block height: {0}")]
    BlockHeight(String),
}

impl DerivationError {
    pub fn empty_prf_output() -> Self {
        DerivationError::InvalidPrfOutput("PRF output cannot be empty".to_string())
    }

    pub fn public_key_mismatch(expected: &str, actual: &str) -> Self {
        DerivationError::PublicKeyMismatch {
            expected: truncate(expected),
            actual: truncate(actual),
        }
    }
}

fn truncate(s: &str) -> String {
    let limit = crate::config::DISPLAY_TRUNCATE_LENGTH;
    match s.char_indices().nth(limit) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s.to_string(),
    }
}

impl From<bincode::Error> for DerivationError {
    fn from(err: bincode::Error) -> Self {
        DerivationError::Serialization(err.to_string())
    }
}

/// What went wrong inside a ceremony.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail")]
pub enum CeremonyErrorKind {
    #[error(transparent)]
    Credential(#[from] CredentialCeremonyError),
    #[error(transparent)]
    Challenge(#[from] ChallengeValidationError),
    #[error(transparent)]
    KeyWrap(#[from] KeyWrapError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Derivation(#[from] DerivationError),
    #[error("relay rejected request: {0}")]
    Relay(String),
    #[error("chain query failed: {0}")]
    Chain(String),
    #[error("wallet storage failed: {0}")]
    Storage(String),
    #[error("invalid ceremony input: {0}")]
    InvalidInput(String),
    #[error("a request is already in flight for this ceremony")]
    Reentrant,
    #[error("phase {next} emitted out of order after {current}")]
    PhaseOrder { current: String, next: String },
    #[error("ceremony was cancelled")]
    Cancelled,
}

impl CeremonyErrorKind {
    /// Stable machine-checkable tag.
    pub fn tag(&self) -> &'static str {
        match self {
            CeremonyErrorKind::Credential(e) => match e {
                CredentialCeremonyError::Cancelled => "Cancelled",
                CredentialCeremonyError::NotAllowed(_) => "NotAllowed",
                CredentialCeremonyError::AncestorBlocked => "AncestorBlocked",
                CredentialCeremonyError::FocusBlocked => "FocusBlocked",
                CredentialCeremonyError::Ambiguous(_) => "AmbiguousRejection",
                CredentialCeremonyError::Platform { .. } => "PlatformError",
                CredentialCeremonyError::MissingPrfResults => "MissingPrfResults",
            },
            CeremonyErrorKind::Challenge(_) => "MalformedChallenge",
            CeremonyErrorKind::KeyWrap(KeyWrapError::UnknownKeyId(_)) => "UnknownKeyId",
            CeremonyErrorKind::KeyWrap(_) => "KeyWrapError",
            CeremonyErrorKind::Transport(TransportError::Timeout { .. }) => "Timeout",
            CeremonyErrorKind::Transport(_) => "TransportError",
            CeremonyErrorKind::Derivation(_) => "DerivationError",
            CeremonyErrorKind::Relay(_) => "RelayError",
            CeremonyErrorKind::Chain(_) => "ChainError",
            CeremonyErrorKind::Storage(_) => "StorageError",
            CeremonyErrorKind::InvalidInput(_) => "InvalidInput",
            CeremonyErrorKind::Reentrant => "Reentrant",
            CeremonyErrorKind::PhaseOrder { .. } => "PhaseOrder",
            CeremonyErrorKind::Cancelled => "CeremonyCancelled",
        }
    }
}

/// A ceremony failure, tagged with the phase at which it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{ceremony} failed during {phase}: {kind}")]
pub struct CeremonyError {
    pub ceremony: String,
    pub phase: String,
    pub kind: CeremonyErrorKind,
}

pub type VrfResult<T> = Result<T, DerivationError>;
pub type KeyWrapResult<T> = Result<T, KeyWrapError>;
pub type TransportResult<T> = Result<T, TransportError>;

// === SECRET SCRUBBING ===

const REDACTED: &str = "[REDACTED]";
const SECRET_STRING_FIELDS: [&str; 10] = [
    "\"prfOutput\"",
    "\"prfFirst\"",
    "\"prfSecond\"",
    "\"first\"",
    "\"second\"",
    "\"kek\"",
    "\"d_s_b64u\"",
    "\"e_s_b64u\"",
    "\"near_private_key\"",
    "\"vrfSecretKey\"",
];

/// Redact secret-bearing JSON string fields from a message before it is logged
/// or returned across the transport.
pub fn scrub_error_message(message: &str) -> String {
    SECRET_STRING_FIELDS
        .iter()
        .fold(message.to_string(), |acc, key| scrub_json_string_field(&acc, key))
}

fn scrub_json_string_field(input: &str, key_pattern: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some((before_key, after_key)) = rest.split_once(key_pattern) {
        out.push_str(before_key);
        out.push_str(key_pattern);
        rest = after_key;

        let Some((before_colon, after_colon)) = rest.split_once(':') else {
            out.push_str(rest);
            return out;
        };
        out.push_str(before_colon);
        out.push(':');

        let trimmed = after_colon.trim_start();
        out.push_str(&after_colon[..after_colon.len() - trimmed.len()]);
        let Some(after_open) = trimmed.strip_prefix('"') else {
            rest = trimmed;
            continue;
        };
        out.push('"');
        out.push_str(REDACTED);
        out.push('"');

        rest = match skip_quoted_value(after_open) {
            Some(after_close) => after_close,
            None => return out,
        };
    }

    out.push_str(rest);
    out
}

fn skip_quoted_value(s: &str) -> Option<&str> {
    let mut escaped = false;
    for (idx, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        if ch == '\\' {
            escaped = true;
            continue;
        }
        if ch == '"' {
            return Some(&s[idx + ch.len_utf8()..]);
        }
    }
    None
}
