use serde::{Deserialize, Serialize};

use super::webauthn::WebAuthnCredential;
use super::VrfChallengeData;

// === Shamir 3-pass relay HTTP types ===

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShamirApplyServerLockHTTPRequest {
    pub kek_c_b64u: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShamirApplyServerLockHTTPResponse {
    pub kek_cs_b64u: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShamirRemoveServerLockHTTPRequest {
    pub kek_cs_b64u: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShamirRemoveServerLockHTTPResponse {
    pub kek_c_b64u: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShamirKeyInfoHTTPResponse {
    pub current_key_id: String,
    #[serde(rename = "p_b64u")]
    pub p_b64u: String,
    pub grace_key_ids: Vec<String>,
}

/// Freshly generated exponent pair; the operator persists it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ShamirServerKeypairHTTPResponse {
    pub e_s_b64u: String,
    pub d_s_b64u: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShamirRotateHTTPRequest {
    /// Current key id the caller observed; rotation fails if it changed
    #[serde(default)]
    pub expected_current_key_id: Option<String>,
    #[serde(default = "default_true")]
    pub keep_current_in_grace: bool,
    #[serde(default)]
    pub max_grace_entries: Option<usize>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShamirRotateHTTPResponse {
    pub new_key_id: String,
    pub previous_key_id: String,
    pub grace_key_ids: Vec<String>,
    #[serde(rename = "e_s_b64u")]
    pub e_s_b64u: String,
}

/// Error body returned by relay handlers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RelayErrorBody {
    pub error: String,
    pub code: String,
}

// === Account creation ===

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatorOptions {
    #[serde(default)]
    pub user_verification: Option<String>,
    #[serde(default)]
    pub origin_policy: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateAccountAndRegisterRequest {
    pub new_account_id: String,
    pub new_public_key: String,
    pub vrf_data: VrfChallengeData,
    pub webauthn_registration: WebAuthnCredential,
    pub deterministic_vrf_public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authenticator_options: Option<AuthenticatorOptions>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CreateAccountAndRegisterResponse {
    pub success: bool,
    #[serde(default, rename = "transactionHash")]
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}
