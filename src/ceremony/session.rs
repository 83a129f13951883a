use serde::{Deserialize, Serialize};

/// Who is logged in to this wallet context. Owned by `WalletContext`;
/// everything else gets a copy through `WalletContext::login_session`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoginSession {
    pub near_account_id: Option<String>,
    pub is_logged_in: bool,
    /// As reported by the derivation service at the time of the update
    pub vrf_active: bool,
    /// `ed25519:<base58>` key derived from the passkey PRF
    pub near_public_key: Option<String>,
}

impl LoginSession {
    pub fn logged_in(account_id: &str, near_public_key: &str, vrf_active: bool) -> Self {
        Self {
            near_account_id: Some(account_id.to_string()),
            is_logged_in: true,
            vrf_active,
            near_public_key: Some(near_public_key.to_string()),
        }
    }
}
