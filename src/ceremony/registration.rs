use log::info;
use serde::{Deserialize, Serialize};

use super::collaborators::{NearChainClient, WalletStore};
use super::orchestrator::{validate_account_id, WalletContext};
use super::phases::RegistrationPhase;
use super::{CeremonyCancel, CeremonyState, EventSink};
use crate::crypto::VrfCryptoModule;
use crate::errors::{CeremonyError, CeremonyErrorKind};
use crate::http::RelayClient;
use crate::types::http::{AuthenticatorOptions, CreateAccountAndRegisterRequest};
use crate::types::{CeremonyKind, StoredAuthenticator, UserRecord};
use crate::utils::{base64_url_encode, now_ms};
use crate::webauthn::CredentialCeremony;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationOutcome {
    pub near_account_id: String,
    pub near_public_key: String,
    pub vrf_public_key: String,
    pub credential_id: String,
    pub transaction_hash: Option<String>,
}

impl<C, W, R, N, S> WalletContext<C, W, R, N, S>
where
    C: VrfCryptoModule,
    W: CredentialCeremony,
    R: RelayClient,
    N: NearChainClient,
    S: WalletStore,
{
    /// Create a passkey, create the NEAR account through the relay, and log in.
    pub async fn register_passkey(
        &self,
        near_account_id: &str,
        cancel: CeremonyCancel,
        on_event: Option<EventSink<RegistrationPhase>>,
    ) -> Result<RegistrationOutcome, CeremonyError> {
        let state = CeremonyState::new(near_account_id, cancel, on_event);
        self.run_registration(&state)
            .await
            .map_err(|kind| state.fail(kind))
    }

    async fn run_registration(
        &self,
        state: &CeremonyState<RegistrationPhase>,
    ) -> Result<RegistrationOutcome, CeremonyErrorKind> {
        let account_id = state.account_id();
        validate_account_id(account_id)?;

        let (challenge, credential) = state
            .step(
                RegistrationPhase::WebauthnVerification,
                "Creating passkey with a VRF challenge",
                async {
                    let bootstrap = self.vrf.new_bootstrap_keypair()?;
                    let challenge = self.verifiable_challenge(account_id, &bootstrap).await?;
                    let credential = self
                        .vrf
                        .request_credential(
                            &self.webauthn,
                            CeremonyKind::Create,
                            account_id,
                            &self.rp_id,
                            &challenge,
                            Vec::new(),
                        )
                        .await?;
                    self.vrf.verify_challenge(&challenge)?;
                    Ok::<_, CeremonyErrorKind>((challenge, credential))
                },
            )
            .await?;

        let (keys, vrf_keypair, vrf_public_key, encrypted_vrf_keypair) = state
            .step(
                RegistrationPhase::KeyGeneration,
                "Deriving NEAR and VRF keys from passkey PRF",
                async {
                    let keys = self.vrf.derive_keys(&credential, account_id)?;
                    let prf = credential.prf_outputs()?;
                    let vrf_keypair = self.vrf.derive_keypair(&prf, account_id)?;
                    let vrf_public_key = base64_url_encode(&vrf_keypair.public_key);
                    let encrypted = self.vrf.seal_keypair(&vrf_keypair, &prf.first)?;
                    Ok::<_, CeremonyErrorKind>((keys, vrf_keypair, vrf_public_key, encrypted))
                },
            )
            .await?;

        let transaction_hash = state
            .step(
                RegistrationPhase::AccessKeyAddition,
                "Creating account and access key via relay",
                async {
                    let request = CreateAccountAndRegisterRequest {
                        new_account_id: account_id.to_string(),
                        new_public_key: keys.near_public_key.clone(),
                        vrf_data: challenge.as_verifiable()?.to_wire(),
                        webauthn_registration: credential.without_prf(),
                        deterministic_vrf_public_key: vrf_public_key.clone(),
                        authenticator_options: Some(AuthenticatorOptions {
                            user_verification: Some("preferred".to_string()),
                            origin_policy: None,
                        }),
                    };
                    let response = self
                        .relay
                        .create_account_and_register_user(request)
                        .await
                        .map_err(CeremonyErrorKind::Relay)?;
                    if !response.success {
                        return Err(CeremonyErrorKind::Relay(
                            response
                                .error
                                .unwrap_or_else(|| "account creation rejected".to_string()),
                        ));
                    }
                    Ok::<_, CeremonyErrorKind>(response.transaction_hash)
                },
            )
            .await?;

        state
            .step(
                RegistrationPhase::AccountVerification,
                "Verifying access key on chain",
                async {
                    let found = self
                        .chain
                        .has_access_key(account_id, &keys.near_public_key)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?;
                    if !found {
                        return Err(CeremonyErrorKind::Chain(format!(
                            "access key {} not found on {}",
                            keys.near_public_key, account_id
                        )));
                    }
                    Ok::<_, CeremonyErrorKind>(())
                },
            )
            .await?;

        state
            .step(
                RegistrationPhase::DatabaseStorage,
                "Storing encrypted wallet data",
                async {
                    let server_encrypted_vrf_keypair =
                        self.try_wrap_vrf_keypair(&vrf_keypair).await;

                    let registered_at = now_ms();
                    let record = UserRecord {
                        near_account_id: account_id.to_string(),
                        near_public_key: keys.near_public_key.clone(),
                        credential_id: credential.raw_id.clone(),
                        encrypted_vrf_keypair: encrypted_vrf_keypair.clone(),
                        server_encrypted_vrf_keypair,
                        deterministic_vrf_public_key: vrf_public_key.clone(),
                        registered_at,
                        last_login: Some(registered_at),
                    };
                    let authenticator = StoredAuthenticator {
                        credential_id: credential.raw_id.clone(),
                        near_account_id: account_id.to_string(),
                        vrf_public_key: Some(vrf_public_key.clone()),
                        transports: credential.response.transports.clone(),
                        registered_at,
                    };
                    self.store
                        .put_user(&record)
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    self.store
                        .put_authenticators(account_id, &[authenticator])
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    Ok::<_, CeremonyErrorKind>(())
                },
            )
            .await?;

        state
            .step(
                RegistrationPhase::ContractRegistration,
                "Confirming authenticator in contract",
                async {
                    let registered = self
                        .chain
                        .authenticators(account_id)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?
                        .iter()
                        .any(|a| a.credential_id == credential.raw_id);
                    if !registered {
                        return Err(CeremonyErrorKind::Chain(format!(
                            "authenticator {} not registered for {}",
                            credential.raw_id, account_id
                        )));
                    }
                    Ok::<_, CeremonyErrorKind>(())
                },
            )
            .await?;

        state.progress(RegistrationPhase::RegistrationComplete, "Logging in")?;
        self.complete_login(account_id, &keys.near_public_key, vrf_keypair);
        let outcome = RegistrationOutcome {
            near_account_id: account_id.to_string(),
            near_public_key: keys.near_public_key.clone(),
            vrf_public_key,
            credential_id: credential.raw_id.clone(),
            transaction_hash,
        };
        info!("Registered {}", account_id);
        state.success_with(
            RegistrationPhase::RegistrationComplete,
            "Registration complete",
            serde_json::to_value(&outcome).unwrap_or_default(),
        )?;
        Ok(outcome)
    }
}
