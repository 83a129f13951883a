//! Device linking. Device 2 (the new device) shows a QR code carrying a
//! temporary public key and polls the chain; device 1 (already logged in)
//! scans it and adds that key to the account. Device 2 then swaps the
//! temporary key for its own passkey-derived key.

use std::time::Duration;

use ed25519_dalek::SigningKey;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::collaborators::{DeviceRegistration, NearChainClient, WalletStore};
use super::orchestrator::WalletContext;
use super::phases::DeviceLinkingPhase;
use super::session::LoginSession;
use super::{CeremonyCancel, CeremonyState, EventSink};
use crate::crypto::VrfCryptoModule;
use crate::errors::{CeremonyError, CeremonyErrorKind, DerivationError};
use crate::http::RelayClient;
use crate::types::{CeremonyKind, StoredAuthenticator, UserRecord};
use crate::utils::{base64_url_encode, near_public_key_string, now_ms, random_bytes, sleep};
use crate::webauthn::CredentialCeremony;

pub const DEVICE_LINK_QR_VERSION: &str = "1";

/// Payload encoded in the device-linking QR code.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceLinkQrData {
    pub device2_public_key: String,
    #[serde(default)]
    pub account_id: Option<String>,
    pub timestamp: u64,
    pub version: String,
}

impl DeviceLinkQrData {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn parse(qr: &str) -> Result<Self, CeremonyErrorKind> {
        let data: DeviceLinkQrData = serde_json::from_str(qr)
            .map_err(|e| CeremonyErrorKind::InvalidInput(format!("invalid QR data: {}", e)))?;
        if data.version != DEVICE_LINK_QR_VERSION {
            return Err(CeremonyErrorKind::InvalidInput(format!(
                "unsupported QR version {}",
                data.version
            )));
        }
        if !data.device2_public_key.starts_with("ed25519:") {
            return Err(CeremonyErrorKind::InvalidInput(
                "QR device key is not an ed25519 key".to_string(),
            ));
        }
        Ok(data)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LinkDeviceOutcome {
    pub near_account_id: String,
    pub near_public_key: String,
    pub vrf_public_key: String,
    pub transaction_hash: String,
    /// Set when auto-login ran
    pub session: Option<LoginSession>,
}

impl<C, W, R, N, S> WalletContext<C, W, R, N, S>
where
    C: VrfCryptoModule,
    W: CredentialCeremony,
    R: RelayClient,
    N: NearChainClient,
    S: WalletStore,
{
    /// Device 2: show a QR code, wait for device 1 to add the temporary key,
    /// then register this device's passkey on the account.
    pub async fn link_device(
        &self,
        account_hint: Option<&str>,
        cancel: CeremonyCancel,
        on_event: Option<EventSink<DeviceLinkingPhase>>,
    ) -> Result<LinkDeviceOutcome, CeremonyError> {
        let final_phase = if self.config.device_linking.auto_login {
            DeviceLinkingPhase::AutoLogin
        } else {
            DeviceLinkingPhase::LinkingComplete
        };
        let state = CeremonyState::with_final_phase(
            account_hint.unwrap_or_default(),
            final_phase,
            cancel,
            on_event,
        );
        self.run_link_device(&state, account_hint)
            .await
            .map_err(|kind| state.fail(kind))
    }

    async fn run_link_device(
        &self,
        state: &CeremonyState<DeviceLinkingPhase>,
        account_hint: Option<&str>,
    ) -> Result<LinkDeviceOutcome, CeremonyErrorKind> {
        state.progress(DeviceLinkingPhase::Idle, "Preparing device link")?;
        let temp_key = SigningKey::from_bytes(
            &random_bytes::<32>().map_err(DerivationError::VrfCrypto)?,
        );
        let temp_public_key = near_public_key_string(temp_key.verifying_key().as_bytes());
        state.success(DeviceLinkingPhase::Idle, "Temporary device key generated")?;

        state.progress(DeviceLinkingPhase::QrCodeGenerated, "Generating QR code")?;
        let qr = DeviceLinkQrData {
            device2_public_key: temp_public_key.clone(),
            account_id: account_hint.map(str::to_string),
            timestamp: now_ms(),
            version: DEVICE_LINK_QR_VERSION.to_string(),
        };
        state.success_with(
            DeviceLinkingPhase::QrCodeGenerated,
            "Scan this QR code with a logged-in device",
            json!({ "qrData": qr.to_json() }),
        )?;

        let account_id = state
            .step(
                DeviceLinkingPhase::Polling,
                "Waiting for the key to be added on chain",
                self.poll_for_device_key(&temp_public_key),
            )
            .await?;
        if let Some(hint) = account_hint {
            if hint != account_id {
                return Err(CeremonyErrorKind::InvalidInput(format!(
                    "device key was added to {} instead of {}",
                    account_id, hint
                )));
            }
        }

        state.progress(DeviceLinkingPhase::AddkeyDetected, "Device key found")?;
        state.success_with(
            DeviceLinkingPhase::AddkeyDetected,
            "Device key added on chain",
            json!({ "nearAccountId": account_id }),
        )?;

        let (keys, vrf_keypair, vrf_public_key, transaction_hash) = state
            .step(
                DeviceLinkingPhase::Registration,
                "Registering this device's passkey",
                async {
                    let bootstrap = self.vrf.new_bootstrap_keypair()?;
                    let challenge = self.verifiable_challenge(&account_id, &bootstrap).await?;
                    let credential = self
                        .vrf
                        .request_credential(
                            &self.webauthn,
                            CeremonyKind::Create,
                            &account_id,
                            &self.rp_id,
                            &challenge,
                            Vec::new(),
                        )
                        .await?;
                    let keys = self.vrf.derive_keys(&credential, &account_id)?;
                    let prf = credential.prf_outputs()?;
                    let vrf_keypair = self.vrf.derive_keypair(&prf, &account_id)?;
                    let vrf_public_key = base64_url_encode(&vrf_keypair.public_key);
                    let encrypted_vrf_keypair = self.vrf.seal_keypair(&vrf_keypair, &prf.first)?;

                    let registration = DeviceRegistration {
                        credential: credential.without_prf(),
                        vrf_data: challenge.as_verifiable()?.to_wire(),
                        deterministic_vrf_public_key: vrf_public_key.clone(),
                        new_public_key: keys.near_public_key.clone(),
                    };
                    let transaction_hash = self
                        .chain
                        .swap_device_key(&account_id, &temp_key, &registration)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?;

                    let server_encrypted_vrf_keypair =
                        self.try_wrap_vrf_keypair(&vrf_keypair).await;
                    let now = now_ms();
                    self.store
                        .put_user(&UserRecord {
                            near_account_id: account_id.clone(),
                            near_public_key: keys.near_public_key.clone(),
                            credential_id: credential.raw_id.clone(),
                            encrypted_vrf_keypair,
                            server_encrypted_vrf_keypair,
                            deterministic_vrf_public_key: vrf_public_key.clone(),
                            registered_at: now,
                            last_login: None,
                        })
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    self.store
                        .put_authenticators(
                            &account_id,
                            &[StoredAuthenticator {
                                credential_id: credential.raw_id.clone(),
                                near_account_id: account_id.clone(),
                                vrf_public_key: Some(vrf_public_key.clone()),
                                transports: credential.response.transports.clone(),
                                registered_at: now,
                            }],
                        )
                        .await
                        .map_err(CeremonyErrorKind::Storage)?;
                    Ok::<_, CeremonyErrorKind>((
                        keys,
                        vrf_keypair,
                        vrf_public_key,
                        transaction_hash,
                    ))
                },
            )
            .await?;

        state.progress(DeviceLinkingPhase::LinkingComplete, "Finishing device link")?;
        let mut outcome = LinkDeviceOutcome {
            near_account_id: account_id.clone(),
            near_public_key: keys.near_public_key.clone(),
            vrf_public_key,
            transaction_hash,
            session: None,
        };

        if !self.config.device_linking.auto_login {
            state.success_with(
                DeviceLinkingPhase::LinkingComplete,
                "Device linked",
                serde_json::to_value(&outcome).unwrap_or_default(),
            )?;
            info!("Linked device to {}", account_id);
            return Ok(outcome);
        }

        state.success(DeviceLinkingPhase::LinkingComplete, "Device linked")?;
        state.progress(DeviceLinkingPhase::AutoLogin, "Logging in")?;
        outcome.session = Some(self.complete_login(
            &account_id,
            &keys.near_public_key,
            vrf_keypair,
        ));
        state.success_with(
            DeviceLinkingPhase::AutoLogin,
            "Logged in on linked device",
            serde_json::to_value(&outcome).unwrap_or_default(),
        )?;
        info!("Linked device to {} and logged in", account_id);
        Ok(outcome)
    }

    async fn poll_for_device_key(&self, device_public_key: &str) -> Result<String, CeremonyErrorKind> {
        let settings = &self.config.device_linking;
        for attempt in 1..=settings.max_polls {
            match self.chain.account_for_public_key(device_public_key).await {
                Ok(Some(account_id)) => {
                    debug!("Device key found on {} after {} polls", account_id, attempt);
                    return Ok(account_id);
                }
                Ok(None) => {}
                Err(e) => debug!("Device key poll {} failed: {}", attempt, e),
            }
            if attempt < settings.max_polls {
                sleep(Duration::from_millis(settings.poll_interval_ms)).await;
            }
        }
        Err(CeremonyErrorKind::Chain(format!(
            "device key not added after {} polls",
            settings.max_polls
        )))
    }

    /// Device 1: authorize the device shown in `qr_data` with this account's passkey.
    pub async fn authorize_device_link(
        &self,
        qr_data: &str,
        cancel: CeremonyCancel,
        on_event: Option<EventSink<DeviceLinkingPhase>>,
    ) -> Result<String, CeremonyError> {
        let session = self.login_session();
        let account_id = session.near_account_id.clone().unwrap_or_default();
        let state = CeremonyState::new(&account_id, cancel, on_event);
        self.run_authorize_device_link(&state, &session, qr_data)
            .await
            .map_err(|kind| state.fail(kind))
    }

    async fn run_authorize_device_link(
        &self,
        state: &CeremonyState<DeviceLinkingPhase>,
        session: &LoginSession,
        qr_data: &str,
    ) -> Result<String, CeremonyErrorKind> {
        let account_id = state.account_id();

        let qr = state
            .step(DeviceLinkingPhase::Scanning, "Reading QR code", async {
                if !session.is_logged_in {
                    return Err(CeremonyErrorKind::InvalidInput(
                        "log in before linking another device".to_string(),
                    ));
                }
                let qr = DeviceLinkQrData::parse(qr_data)?;
                if let Some(target) = &qr.account_id {
                    if target != account_id {
                        return Err(CeremonyErrorKind::InvalidInput(format!(
                            "QR code is for {}, logged in as {}",
                            target, account_id
                        )));
                    }
                }
                Ok::<_, CeremonyErrorKind>(qr)
            })
            .await?;

        let transaction_hash = state
            .step(
                DeviceLinkingPhase::Authorization,
                "Authorizing the new device with your passkey",
                async {
                    let challenge = self.vrf.build_challenge(account_id, &self.rp_id)?;
                    let allow = self.stored_allow_credentials(account_id).await?;
                    let credential = self
                        .vrf
                        .request_credential(
                            &self.webauthn,
                            CeremonyKind::Get,
                            account_id,
                            &self.rp_id,
                            &challenge,
                            allow,
                        )
                        .await?;
                    let keys = self.vrf.derive_keys(&credential, account_id)?;
                    if session.near_public_key.as_deref() != Some(keys.near_public_key.as_str()) {
                        return Err(CeremonyErrorKind::InvalidInput(
                            "passkey does not match the logged-in account".to_string(),
                        ));
                    }
                    let signer = SigningKey::from_bytes(&keys.signing_key);
                    let tx = self
                        .chain
                        .add_device_key(account_id, &signer, &qr.device2_public_key)
                        .await
                        .map_err(CeremonyErrorKind::Chain)?;
                    Ok::<_, CeremonyErrorKind>(tx)
                },
            )
            .await?;

        state.progress(DeviceLinkingPhase::LinkingComplete, "Finishing")?;
        state.success_with(
            DeviceLinkingPhase::LinkingComplete,
            "New device authorized",
            json!({ "transactionHash": transaction_hash }),
        )?;
        info!("Authorized device {} for {}", qr.device2_public_key, account_id);
        Ok(transaction_hash)
    }
}
