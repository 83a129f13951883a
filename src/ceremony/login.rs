use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::collaborators::{NearChainClient, WalletStore};
use super::orchestrator::{validate_account_id, WalletContext};
use super::phases::LoginPhase;
use super::session::LoginSession;
use super::{CeremonyCancel, CeremonyState, EventSink};
use crate::crypto::VrfCryptoModule;
use crate::errors::{CeremonyError, CeremonyErrorKind};
use crate::http::RelayClient;
use crate::types::{CeremonyKind, UserRecord, VrfKeypairMaterial};
use crate::utils::{base64_url_encode, now_ms};
use crate::webauthn::CredentialCeremony;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum UnlockMethod {
    /// Relay removed its server lock; no passkey prompt
    Shamir3Pass,
    /// Decrypted with passkey PRF output
    Passkey,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoginOutcome {
    pub near_account_id: String,
    pub vrf_public_key: String,
    pub unlocked_via: UnlockMethod,
    pub session: LoginSession,
}

impl<C, W, R, N, S> WalletContext<C, W, R, N, S>
where
    C: VrfCryptoModule,
    W: CredentialCeremony,
    R: RelayClient,
    N: NearChainClient,
    S: WalletStore,
{
    /// Unlock the stored VRF keypair, via the relay when a wrapped copy exists
    /// and with a passkey assertion otherwise.
    pub async fn login_passkey(
        &self,
        near_account_id: &str,
        cancel: CeremonyCancel,
        on_event: Option<EventSink<LoginPhase>>,
    ) -> Result<LoginOutcome, CeremonyError> {
        let state = CeremonyState::new(near_account_id, cancel, on_event);
        self.run_login(&state).await.map_err(|kind| state.fail(kind))
    }

    async fn run_login(
        &self,
        state: &CeremonyState<LoginPhase>,
    ) -> Result<LoginOutcome, CeremonyErrorKind> {
        let account_id = state.account_id();
        validate_account_id(account_id)?;

        let (mut record, unwrapped) = state
            .step(LoginPhase::Preparation, "Loading wallet data", async {
                let record = self
                    .store
                    .get_user(account_id)
                    .await
                    .map_err(CeremonyErrorKind::Storage)?
                    .ok_or_else(|| {
                        CeremonyErrorKind::InvalidInput(format!(
                            "no wallet data stored for {}",
                            account_id
                        ))
                    })?;
                let unwrapped = self.try_shamir_unwrap(&record).await;
                Ok::<_, CeremonyErrorKind>((record, unwrapped))
            })
            .await?;

        let (vrf_keypair, unlocked_via) = match unwrapped {
            Some(keypair_bytes) => {
                let keypair = state
                    .step(LoginPhase::VrfUnlock, "Unlocking VRF keypair via relay", async {
                        let keypair = self.vrf.parse_keypair(
                            &keypair_bytes,
                            Some(&record.deterministic_vrf_public_key),
                        )?;
                        Ok::<_, CeremonyErrorKind>(keypair)
                    })
                    .await?;
                (keypair, UnlockMethod::Shamir3Pass)
            }
            None => {
                let credential = state
                    .step(
                        LoginPhase::WebauthnAssertion,
                        "Requesting passkey assertion",
                        async {
                            let challenge = self.vrf.build_challenge(account_id, &self.rp_id)?;
                            let allow = self.stored_allow_credentials(account_id).await?;
                            self.vrf
                                .request_credential(
                                    &self.webauthn,
                                    CeremonyKind::Get,
                                    account_id,
                                    &self.rp_id,
                                    &challenge,
                                    allow,
                                )
                                .await
                        },
                    )
                    .await?;
                let keypair = state
                    .step(
                        LoginPhase::VrfUnlock,
                        "Unlocking VRF keypair with passkey PRF",
                        async {
                            let prf = credential.prf_outputs()?;
                            let keypair = self.vrf.open_keypair(
                                &record.encrypted_vrf_keypair,
                                &prf.first,
                                Some(&record.deterministic_vrf_public_key),
                            )?;
                            Ok::<_, CeremonyErrorKind>(keypair)
                        },
                    )
                    .await?;
                (keypair, UnlockMethod::Passkey)
            }
        };

        state.progress(LoginPhase::LoginComplete, "Finalizing login")?;
        self.refresh_server_wrap(&mut record, &vrf_keypair).await;
        record.last_login = Some(now_ms());
        if let Err(e) = self.store.put_user(&record).await {
            warn!("Could not update stored wallet data for {}: {}", account_id, e);
        }

        state.progress(LoginPhase::LoginComplete, "Updating login session")?;
        let vrf_public_key = base64_url_encode(&vrf_keypair.public_key);
        let session = self.complete_login(account_id, &record.near_public_key, vrf_keypair);
        let outcome = LoginOutcome {
            near_account_id: account_id.to_string(),
            vrf_public_key,
            unlocked_via,
            session,
        };
        state.success_with(
            LoginPhase::LoginComplete,
            "Login complete",
            serde_json::to_value(&outcome).unwrap_or_default(),
        )?;
        info!("{} logged in via {:?}", account_id, unlocked_via);
        Ok(outcome)
    }

    /// Unwrap the relay-wrapped VRF keypair, if there is one and the relay
    /// still holds its key. Any failure falls back to the passkey.
    async fn try_shamir_unwrap(&self, record: &UserRecord) -> Option<Zeroizing<Vec<u8>>> {
        let blob = record.server_encrypted_vrf_keypair.as_ref()?;
        match self.key_wrap().unwrap_vrf_keypair(blob).await {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(
                    "Relay unlock unavailable for {} (key {}): {}",
                    record.near_account_id, blob.server_key_id, e
                );
                None
            }
        }
    }

    /// Re-wrap the unlocked keypair when the stored blob is missing or was
    /// wrapped under a key that is no longer current.
    async fn refresh_server_wrap(&self, record: &mut UserRecord, keypair: &VrfKeypairMaterial) {
        let stale = match &record.server_encrypted_vrf_keypair {
            None => true,
            Some(blob) => match self.key_wrap().needs_refresh(blob).await {
                Ok(stale) => stale,
                Err(e) => {
                    debug!("Key-info lookup failed, keeping wrapped blob: {}", e);
                    false
                }
            },
        };
        if !stale {
            return;
        }
        if let Some(blob) = self.try_wrap_vrf_keypair(keypair).await {
            info!("Re-wrapped VRF keypair under server key {}", blob.server_key_id);
            record.server_encrypted_vrf_keypair = Some(blob);
        }
    }
}
