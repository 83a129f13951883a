//! WebAuthn ceremony options and serialized credentials.
//!
//! Credentials are kept in their JSON-serializable form (base64url binary
//! fields) because they travel between the wallet iframe and the parent page
//! during the parent-bridge fallback.

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::errors::CredentialCeremonyError;
use crate::utils::base64_url_decode;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum CeremonyKind {
    Create,
    Get,
}

/// PRF `eval.first` / `eval.second` inputs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PrfSalts {
    pub encryption_salt: Vec<u8>,
    pub signing_salt: Vec<u8>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AllowCredential {
    /// base64url credential id
    pub id: String,
    #[serde(default)]
    pub transports: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialCreationOptions {
    pub rp_id: String,
    pub user_id: String,
    pub user_name: String,
    pub challenge: Vec<u8>,
    pub prf: PrfSalts,
    #[serde(default)]
    pub exclude_credentials: Vec<AllowCredential>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRequestOptions {
    pub rp_id: String,
    pub challenge: Vec<u8>,
    #[serde(default)]
    pub allow_credentials: Vec<AllowCredential>,
    pub prf: PrfSalts,
    pub user_verification: String,
}

/// Options for either ceremony, as carried over the parent bridge.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "ceremony", content = "options")]
pub enum CeremonyOptions {
    Create(CredentialCreationOptions),
    Get(CredentialRequestOptions),
}

impl CeremonyOptions {
    pub fn kind(&self) -> CeremonyKind {
        match self {
            CeremonyOptions::Create(_) => CeremonyKind::Create,
            CeremonyOptions::Get(_) => CeremonyKind::Get,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrfResults {
    pub first: Option<String>,
    pub second: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrfExtensionResults {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub results: PrfResults,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientExtensionResults {
    #[serde(default)]
    pub prf: Option<PrfExtensionResults>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CredentialResponse {
    pub client_data_json: String,
    #[serde(default)]
    pub authenticator_data: Option<String>,
    #[serde(default)]
    pub attestation_object: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub user_handle: Option<String>,
    #[serde(default)]
    pub transports: Vec<String>,
}

/// Serialized `PublicKeyCredential` including PRF outputs.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WebAuthnCredential {
    pub id: String,
    pub raw_id: String,
    #[serde(rename = "type")]
    pub credential_type: String,
    #[serde(default)]
    pub authenticator_attachment: Option<String>,
    pub response: CredentialResponse,
    #[serde(default)]
    pub client_extension_results: ClientExtensionResults,
}

/// Decoded PRF outputs; zeroized on drop.
pub struct PrfOutputs {
    pub first: Zeroizing<Vec<u8>>,
    pub second: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for PrfOutputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrfOutputs([REDACTED])")
    }
}

impl WebAuthnCredential {
    pub fn prf_outputs(&self) -> Result<PrfOutputs, CredentialCeremonyError> {
        let results = self
            .client_extension_results
            .prf
            .as_ref()
            .map(|p| &p.results)
            .ok_or(CredentialCeremonyError::MissingPrfResults)?;
        let decode = |v: &Option<String>| -> Result<Zeroizing<Vec<u8>>, CredentialCeremonyError> {
            let raw = v
                .as_deref()
                .filter(|s| !s.is_empty())
                .ok_or(CredentialCeremonyError::MissingPrfResults)?;
            base64_url_decode(raw)
                .map(Zeroizing::new)
                .map_err(|_| CredentialCeremonyError::MissingPrfResults)
        };
        Ok(PrfOutputs {
            first: decode(&results.first)?,
            second: decode(&results.second)?,
        })
    }

    /// Copy without PRF outputs, for sending to the relay.
    pub fn without_prf(&self) -> Self {
        let mut stripped = self.clone();
        stripped.client_extension_results.prf = None;
        stripped
    }

    pub fn allow_credential(&self) -> AllowCredential {
        AllowCredential {
            id: self.raw_id.clone(),
            transports: self.response.transports.clone(),
        }
    }
}
