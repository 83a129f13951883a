use log::info;
use serde::{Deserialize, Serialize};

use super::collaborators::{NearChainClient, WalletStore};
use super::orchestrator::{validate_account_id, WalletContext};
use super::phases::RecoveryPhase;
use super::session::LoginSession;
use super::{CeremonyCancel, CeremonyState, EventSink};
use crate::crypto::VrfCryptoModule;
use crate::errors::{CeremonyError, CeremonyErrorKind};
use crate::http::RelayClient;
use crate::types::{AllowCredential, CeremonyKind, UserRecord};
use crate::utils::{base64_url_encode, now_ms};
use crate::webauthn::CredentialCeremony;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryOutcome {
    pub near_account_id: String,
    pub near_public_key: String,
    pub vrf_public_key: String,
    pub authenticators_synced: usize,
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
    /// Rebuild local wallet data on a device that already holds a passkey for
    /// `near_account_id` (synced passkey, or a cleared browser).
    pub async fn recover_account(
        &self,
        near_account_id: &str,
        cancel: CeremonyCancel,
        on_event: Option<EventSink<RecoveryPhase>>,
    ) -> Result<RecoveryOutcome, CeremonyError> {
        let state = CeremonyState::new(near_account_id, cancel, on_event);
        self.run_recovery(&state)
            .await
            .map_err(|kind| state.fail(kind))
    }

    async fn run_recovery(
        &self,
        state: &CeremonyState<RecoveryPhase>,
    ) -> Result<RecoveryOutcome, CeremonyErrorKind> {
        let account_id = state.account_id();
        validate_account_id(account_id)?;

        let onchain = state
            .step(
                RecoveryPhase::Preparation,
                "Looking up authenticators on chain",
                async {
                    let onchain = self
                        .chain
                        .authenticators(account_id)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?;
                    if onchain.is_empty() {
                        return Err(CeremonyErrorKind::InvalidInput(format!(
                            "no authenticators registered for {}",
                            account_id
                        )));
                    }
                    Ok::<_, CeremonyErrorKind>(onchain)
                },
            )
            .await?;

        let credential = state
            .step(
                RecoveryPhase::WebauthnAuthentication,
                "Requesting passkey assertion",
                async {
                    let challenge = self.vrf.build_challenge(account_id, &self.rp_id)?;
                    let allow = onchain
                        .iter()
                        .map(|a| AllowCredential {
                            id: a.credential_id.clone(),
                            transports: a.transports.clone(),
                        })
                        .collect();
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

        let keys = state
            .step(
                RecoveryPhase::SyncAuthenticatorsOnchain,
                "Checking passkey against account and syncing authenticators",
                async {
                    let keys = self.vrf.derive_keys(&credential, account_id)?;
                    let controls = self
                        .chain
                        .has_access_key(account_id, &keys.near_public_key)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?;
                    if !controls {
                        return Err(CeremonyErrorKind::InvalidInput(format!(
                            "passkey does not hold an access key on {}",
                            account_id
                        )));
                    }
                    self.store
                        .put_authenticators(account_id, &onchain)
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    Ok::<_, CeremonyErrorKind>(keys)
                },
            )
            .await?;

        let (vrf_keypair, vrf_public_key) = state
            .step(
                RecoveryPhase::AuthenticatorSaved,
                "Restoring encrypted VRF keypair",
                async {
                    let prf = credential.prf_outputs()?;
                    let vrf_keypair = self.vrf.derive_keypair(&prf, account_id)?;
                    let vrf_public_key = base64_url_encode(&vrf_keypair.public_key);
                    let encrypted_vrf_keypair = self.vrf.seal_keypair(&vrf_keypair, &prf.first)?;
                    let server_encrypted_vrf_keypair =
                        self.try_wrap_vrf_keypair(&vrf_keypair).await;
                    let now = now_ms();
                    let registered_at = onchain
                        .iter()
                        .find(|a| a.credential_id == credential.raw_id)
                        .map(|a| a.registered_at)
                        .unwrap_or(now);
                    let record = UserRecord {
                        near_account_id: account_id.to_string(),
                        near_public_key: keys.near_public_key.clone(),
                        credential_id: credential.raw_id.clone(),
                        encrypted_vrf_keypair,
                        server_encrypted_vrf_keypair,
                        deterministic_vrf_public_key: vrf_public_key.clone(),
                        registered_at,
                        last_login: Some(now),
                    };
                    self.store
                        .put_user(&record)
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    Ok::<_, CeremonyErrorKind>((vrf_keypair, vrf_public_key))
                },
            )
            .await?;

        state.progress(RecoveryPhase::RecoveryComplete, "Logging in")?;
        let session = self.complete_login(account_id, &keys.near_public_key, vrf_keypair);
        let outcome = RecoveryOutcome {
            near_account_id: account_id.to_string(),
            near_public_key: keys.near_public_key.clone(),
            vrf_public_key,
            authenticators_synced: onchain.len(),
            session,
        };
        state.success_with(
            RecoveryPhase::RecoveryComplete,
            "Account recovered",
            serde_json::to_value(&outcome).unwrap_or_default(),
        )?;
        info!("Recovered {} with {} authenticators", account_id, onchain.len());
        Ok(outcome)
    }
}
