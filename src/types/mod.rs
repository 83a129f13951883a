use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::config::WEBAUTHN_CHALLENGE_SIZE;
use crate::errors::ChallengeValidationError;
use crate::utils::base64_url_encode;

pub mod http;
pub mod webauthn;

pub use webauthn::*;

// === VRF CHALLENGES ===

/// Public inputs bound into a verifiable VRF challenge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfInputData {
    pub user_id: String,
    pub rp_id: String,
    /// Block height as decimal text
    pub block_height: String,
    /// Base58-encoded block hash
    pub block_hash: String,
}

/// Wire form of a verifiable challenge; binary fields are base64url.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfChallengeData {
    pub vrf_input: String,
    pub vrf_output: String,
    pub vrf_proof: String,
    pub vrf_public_key: String,
    pub user_id: String,
    pub rp_id: String,
    pub block_height: String,
    pub block_hash: String,
}

/// A challenge with all eight fields populated, suitable for on-chain verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiableVrfChallenge {
    pub vrf_input: Vec<u8>,
    pub vrf_output: Vec<u8>,
    pub vrf_proof: Vec<u8>,
    pub vrf_public_key: Vec<u8>,
    pub user_id: String,
    pub rp_id: String,
    pub block_height: String,
    pub block_hash: Vec<u8>,
}

impl VerifiableVrfChallenge {
    pub fn to_wire(&self) -> VrfChallengeData {
        VrfChallengeData {
            vrf_input: base64_url_encode(&self.vrf_input),
            vrf_output: base64_url_encode(&self.vrf_output),
            vrf_proof: base64_url_encode(&self.vrf_proof),
            vrf_public_key: base64_url_encode(&self.vrf_public_key),
            user_id: self.user_id.clone(),
            rp_id: self.rp_id.clone(),
            block_height: self.block_height.clone(),
            block_hash: base64_url_encode(&self.block_hash),
        }
    }
}

/// A challenge carrying only random output; never accepted for verification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RandomVrfChallenge {
    pub vrf_output: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VrfChallenge {
    Verifiable(VerifiableVrfChallenge),
    Random(RandomVrfChallenge),
}

impl VrfChallenge {
    fn output(&self) -> &[u8] {
        match self {
            VrfChallenge::Verifiable(c) => &c.vrf_output,
            VrfChallenge::Random(c) => &c.vrf_output,
        }
    }

    /// Bytes handed to the authenticator: the first 32 bytes of the VRF output.
    pub fn webauthn_challenge(&self) -> &[u8] {
        let out = self.output();
        &out[..WEBAUTHN_CHALLENGE_SIZE.min(out.len())]
    }

    pub fn as_verifiable(&self) -> Result<&VerifiableVrfChallenge, ChallengeValidationError> {
        match self {
            VrfChallenge::Verifiable(c) => Ok(c),
            VrfChallenge::Random(_) => Err(ChallengeValidationError::NotVerifiable),
        }
    }

    pub fn is_verifiable(&self) -> bool {
        matches!(self, VrfChallenge::Verifiable(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            VrfChallenge::Verifiable(c) => {
                serde_json::to_value(c.to_wire()).unwrap_or(serde_json::Value::Null)
            }
            VrfChallenge::Random(c) => {
                serde_json::json!({ "vrfOutput": base64_url_encode(&c.vrf_output) })
            }
        }
    }
}

// === VRF KEYPAIRS ===

/// Opaque serialized VRF keypair produced by the crypto module.
pub struct VrfKeypairMaterial {
    pub keypair_bytes: Zeroizing<Vec<u8>>,
    pub public_key: Vec<u8>,
}

impl std::fmt::Debug for VrfKeypairMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VrfKeypairMaterial")
            .field("public_key", &base64_url_encode(&self.public_key))
            .finish_non_exhaustive()
    }
}

/// Plaintext payload sealed inside an `EncryptedVrfKeypair`.
#[derive(Serialize, Deserialize)]
pub struct VrfKeypairData {
    pub keypair_bytes: Vec<u8>,
    pub public_key_base64: String,
}

/// VRF keypair encrypted under a PRF-derived ChaCha20-Poly1305 key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedVrfKeypair {
    pub encrypted_vrf_data_b64u: String,
    pub chacha20_nonce_b64u: String,
}

/// VRF keypair wrapped under a Shamir 3-pass server lock.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerEncryptedVrfKeypair {
    #[serde(rename = "ciphertextVrfB64u")]
    pub ciphertext_vrf_b64u: String,
    #[serde(rename = "kek_s_b64u")]
    pub kek_s_b64u: String,
    #[serde(rename = "serverKeyId")]
    pub server_key_id: String,
}

/// Status reported by the derivation service's VRF session.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VrfStatus {
    pub active: bool,
    pub session_duration_ms: u64,
}

// === DERIVED KEYS ===

/// Encryption and signing material derived from PRF output.
pub struct DerivedKeys {
    pub encryption_key: Zeroizing<[u8; 32]>,
    pub signing_key: Zeroizing<[u8; 32]>,
    /// `ed25519:<base58>` public key of `signing_key`
    pub near_public_key: String,
}

impl std::fmt::Debug for DerivedKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("near_public_key", &self.near_public_key)
            .finish_non_exhaustive()
    }
}

// === CHAIN / STORAGE RECORDS ===

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BlockInfo {
    pub height: u64,
    /// Base58-encoded block hash
    pub hash: String,
}

/// An authenticator registered for an account, as stored on chain and locally.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredAuthenticator {
    pub credential_id: String,
    pub near_account_id: String,
    pub vrf_public_key: Option<String>,
    pub transports: Vec<String>,
    pub registered_at: u64,
}

/// Locally persisted per-account wallet state.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UserRecord {
    pub near_account_id: String,
    pub near_public_key: String,
    pub credential_id: String,
    pub encrypted_vrf_keypair: EncryptedVrfKeypair,
    pub server_encrypted_vrf_keypair: Option<ServerEncryptedVrfKeypair>,
    pub deterministic_vrf_public_key: String,
    pub registered_at: u64,
    pub last_login: Option<u64>,
}
