//! `WalletContext`: the one object a host constructs per wallet. It owns the
//! derivation service, the login session and the collaborators, and runs the
//! ceremonies against them.

use std::cell::RefCell;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::collaborators::{NearChainClient, WalletStore};
use super::session::LoginSession;
use super::CeremonyCancel;
use crate::config::WalletConfig;
use crate::crypto::VrfCryptoModule;
use crate::errors::{CeremonyErrorKind, KeyWrapResult};
use crate::http::RelayClient;
use crate::manager::VrfCredentialService;
use crate::shamir3pass::{KeyWrapClient, Shamir3Pass};
use crate::transport::{message_types, Disposition, TransportEndpoint};
use crate::types::{
    AllowCredential, ServerEncryptedVrfKeypair, VrfChallenge, VrfInputData, VrfKeypairMaterial,
};
use crate::webauthn::CredentialCeremony;

/// Requests the hosting page sends to the wallet iframe as `WALLET_REQUEST`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase", tag = "action")]
pub enum WalletRequest {
    #[serde(rename_all = "camelCase")]
    Register { near_account_id: String },
    #[serde(rename_all = "camelCase")]
    Login { near_account_id: String },
    #[serde(rename_all = "camelCase")]
    RecoverAccount { near_account_id: String },
    #[serde(rename_all = "camelCase")]
    AuthorizeDeviceLink { qr_data: String },
    Logout,
    GetLoginSession,
}

pub struct WalletContext<C: VrfCryptoModule, W, R, N, S> {
    pub(super) config: WalletConfig,
    pub(super) rp_id: String,
    pub(super) vrf: VrfCredentialService<C>,
    pub(super) shamir: Shamir3Pass,
    pub(super) webauthn: W,
    pub(super) relay: R,
    pub(super) chain: N,
    pub(super) store: S,
    session: RefCell<LoginSession>,
}

impl<C, W, R, N, S> WalletContext<C, W, R, N, S>
where
    C: VrfCryptoModule,
    W: CredentialCeremony,
    R: RelayClient,
    N: NearChainClient,
    S: WalletStore,
{
    pub fn new(
        config: WalletConfig,
        crypto: C,
        webauthn: W,
        relay: R,
        chain: N,
        store: S,
    ) -> KeyWrapResult<Self> {
        let shamir = Shamir3Pass::new(&config.shamir_p_b64u)?;
        let rp_id = config.rp_id();
        info!("Wallet context ready (rpId: {})", rp_id);
        Ok(Self {
            config,
            rp_id,
            vrf: VrfCredentialService::new(crypto),
            shamir,
            webauthn,
            relay,
            chain,
            store,
            session: RefCell::new(LoginSession::default()),
        })
    }

    pub fn config(&self) -> &WalletConfig {
        &self.config
    }

    pub fn rp_id(&self) -> &str {
        &self.rp_id
    }

    pub fn vrf_service(&self) -> &VrfCredentialService<C> {
        &self.vrf
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn chain(&self) -> &N {
        &self.chain
    }

    pub fn relay(&self) -> &R {
        &self.relay
    }

    pub fn login_session(&self) -> LoginSession {
        self.session.borrow().clone()
    }

    /// Drop VRF key material and the login session.
    pub fn logout(&self) {
        self.vrf.logout();
        *self.session.borrow_mut() = LoginSession::default();
        info!("Logged out");
    }

    /// Install the ceremony's keypair as the session keypair and record the
    /// login. `vrf_active` comes from the derivation service.
    pub(super) fn complete_login(
        &self,
        account_id: &str,
        near_public_key: &str,
        keypair: VrfKeypairMaterial,
    ) -> LoginSession {
        self.vrf.install_keypair(keypair);
        let vrf_active = self.vrf.vrf_status().active;
        let session = LoginSession::logged_in(account_id, near_public_key, vrf_active);
        *self.session.borrow_mut() = session.clone();
        info!("Logged in as {} (VRF active: {})", account_id, vrf_active);
        session
    }

    pub(super) fn key_wrap(&self) -> KeyWrapClient<'_, R> {
        KeyWrapClient::new(&self.shamir, &self.relay)
    }

    /// Seal `keypair` under the relay's current server key.
    pub(super) async fn wrap_vrf_keypair(
        &self,
        keypair: &VrfKeypairMaterial,
    ) -> Result<ServerEncryptedVrfKeypair, CeremonyErrorKind> {
        let bytes = self.vrf.keypair_bytes(keypair)?;
        Ok(self.key_wrap().wrap_vrf_keypair(&bytes).await?)
    }

    /// Best-effort wrap; the wallet still works through the passkey without it.
    pub(super) async fn try_wrap_vrf_keypair(
        &self,
        keypair: &VrfKeypairMaterial,
    ) -> Option<ServerEncryptedVrfKeypair> {
        match self.wrap_vrf_keypair(keypair).await {
            Ok(blob) => Some(blob),
            Err(e) => {
                warn!("Skipping relay key wrap: {}", e);
                None
            }
        }
    }

    /// Verifiable challenge from `keypair`, bound to the latest block.
    pub(super) async fn verifiable_challenge(
        &self,
        account_id: &str,
        keypair: &VrfKeypairMaterial,
    ) -> Result<VrfChallenge, CeremonyErrorKind> {
        let block = self
            .chain
            .latest_block()
            .await
            .map_err(CeremonyErrorKind::Chain)?;
        debug!("Challenge bound to block {}", block.height);
        let input = VrfInputData {
            user_id: account_id.to_string(),
            rp_id: self.rp_id.clone(),
            block_height: block.height.to_string(),
            block_hash: block.hash,
        };
        Ok(self.vrf.build_verifiable_challenge_with(keypair, &input)?)
    }

    pub(super) async fn stored_allow_credentials(
        &self,
        account_id: &str,
    ) -> Result<Vec<AllowCredential>, CeremonyErrorKind> {
        Ok(self
            .store
            .authenticators(account_id)
            .await
            .map_err(CeremonyErrorKind::Storage)?
            .into_iter()
            .map(|a| AllowCredential {
                id: a.credential_id,
                transports: a.transports,
            })
            .collect())
    }

    // === WALLET IFRAME REQUESTS ===

    /// Run one `WalletRequest` to completion. Progress events are not forwarded.
    pub async fn handle_request(&self, request: WalletRequest) -> Result<Value, CeremonyErrorKind> {
        let cancel = CeremonyCancel::new();
        let to_value =
            |v: Result<Value, serde_json::Error>| v.map_err(|e| CeremonyErrorKind::InvalidInput(e.to_string()));
        match request {
            WalletRequest::Register { near_account_id } => {
                let outcome = self
                    .register_passkey(&near_account_id, cancel, None)
                    .await
                    .map_err(|e| e.kind)?;
                to_value(serde_json::to_value(outcome))
            }
            WalletRequest::Login { near_account_id } => {
                let outcome = self
                    .login_passkey(&near_account_id, cancel, None)
                    .await
                    .map_err(|e| e.kind)?;
                to_value(serde_json::to_value(outcome))
            }
            WalletRequest::RecoverAccount { near_account_id } => {
                let outcome = self
                    .recover_account(&near_account_id, cancel, None)
                    .await
                    .map_err(|e| e.kind)?;
                to_value(serde_json::to_value(outcome))
            }
            WalletRequest::AuthorizeDeviceLink { qr_data } => {
                let tx = self
                    .authorize_device_link(&qr_data, cancel, None)
                    .await
                    .map_err(|e| e.kind)?;
                Ok(json!({ "transactionHash": tx }))
            }
            WalletRequest::Logout => {
                self.logout();
                Ok(Value::Null)
            }
            WalletRequest::GetLoginSession => to_value(serde_json::to_value(self.login_session())),
        }
    }

    /// Feed one `message` event from the hosting page into the wallet.
    pub async fn serve(&self, endpoint: &TransportEndpoint, origin: &str, data: &Value) -> Disposition {
        let disposition = endpoint.handle_inbound(origin, data);
        let Disposition::Request(request) = &disposition else {
            return disposition;
        };
        if request.message_type != message_types::WALLET_REQUEST {
            return disposition;
        }

        let result = match serde_json::from_value::<WalletRequest>(request.payload.clone()) {
            Ok(wallet_request) => self.handle_request(wallet_request).await,
            Err(e) => Err(CeremonyErrorKind::InvalidInput(format!(
                "unrecognized wallet request: {}",
                e
            ))),
        };
        let sent = match &result {
            Ok(payload) => endpoint.respond(request, Ok(payload.clone())),
            Err(kind) => endpoint.respond(request, Err(kind)),
        };
        if let Err(e) = sent {
            warn!("Could not answer wallet request {}: {}", request.request_id, e);
        }
        disposition
    }
}

/// NEAR account ids: 2-64 chars of `a-z 0-9 . _ -`, no leading or trailing separator.
pub fn validate_account_id(account_id: &str) -> Result<(), CeremonyErrorKind> {
    let valid_chars = account_id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
    let separators: &[char] = &['.', '_', '-'];
    let valid = (2..=64).contains(&account_id.len())
        && valid_chars
        && !account_id.starts_with(separators)
        && !account_id.ends_with(separators);
    if !valid {
        return Err(CeremonyErrorKind::InvalidInput(format!(
            "invalid NEAR account id: {:?}",
            account_id
        )));
    }
    Ok(())
}
