//! Message endpoint for a background key-wrap worker.
//!
//! Envelopes are `{ type: <u32>, id, payload }`; replies are
//! `{ id, success, data, error }`. Anything that does not parse as a known
//! request (health checks, stale messages from an earlier worker instance) is
//! dropped before it reaches a cryptographic handler.

use std::cell::{Cell, RefCell};

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::crypto::VrfCryptoModule;
use crate::errors::scrub_error_message;
use crate::handlers::RelayKeyWrapHandlers;
use crate::http::RelayClient;
use crate::manager::VrfCredentialService;
use crate::shamir3pass::{KeyWrapClient, Shamir3Pass};
use crate::types::http::{ShamirApplyServerLockHTTPRequest, ShamirRemoveServerLockHTTPRequest};
use crate::types::{EncryptedVrfKeypair, PrfOutputs, ServerEncryptedVrfKeypair, VrfInputData};
use crate::utils::{base64_url_decode, now_ms};
use zeroize::Zeroizing;

// === REQUEST TYPES ===

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRequestType {
    Ping,
    GenerateVrfChallenge,
    GenerateVrfKeypairBootstrap,
    UnlockVrfKeypair,
    CheckVrfStatus,
    Logout,
    DeriveVrfKeypairFromPrf,
    Shamir3PassClientEncryptCurrentVrfKeypair,
    Shamir3PassClientDecryptVrfKeypair,
    Shamir3PassGenerateServerKeypair,
    Shamir3PassApplyServerLock,
    Shamir3PassRemoveServerLock,
    Shamir3PassConfigP,
}

impl TryFrom<u32> for WorkerRequestType {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => WorkerRequestType::Ping,
            1 => WorkerRequestType::GenerateVrfChallenge,
            2 => WorkerRequestType::GenerateVrfKeypairBootstrap,
            3 => WorkerRequestType::UnlockVrfKeypair,
            4 => WorkerRequestType::CheckVrfStatus,
            5 => WorkerRequestType::Logout,
            6 => WorkerRequestType::DeriveVrfKeypairFromPrf,
            7 => WorkerRequestType::Shamir3PassClientEncryptCurrentVrfKeypair,
            8 => WorkerRequestType::Shamir3PassClientDecryptVrfKeypair,
            9 => WorkerRequestType::Shamir3PassGenerateServerKeypair,
            10 => WorkerRequestType::Shamir3PassApplyServerLock,
            11 => WorkerRequestType::Shamir3PassRemoveServerLock,
            12 => WorkerRequestType::Shamir3PassConfigP,
            other => return Err(other),
        })
    }
}

impl From<WorkerRequestType> for u32 {
    fn from(value: WorkerRequestType) -> Self {
        match value {
            WorkerRequestType::Ping => 0,
            WorkerRequestType::GenerateVrfChallenge => 1,
            WorkerRequestType::GenerateVrfKeypairBootstrap => 2,
            WorkerRequestType::UnlockVrfKeypair => 3,
            WorkerRequestType::CheckVrfStatus => 4,
            WorkerRequestType::Logout => 5,
            WorkerRequestType::DeriveVrfKeypairFromPrf => 6,
            WorkerRequestType::Shamir3PassClientEncryptCurrentVrfKeypair => 7,
            WorkerRequestType::Shamir3PassClientDecryptVrfKeypair => 8,
            WorkerRequestType::Shamir3PassGenerateServerKeypair => 9,
            WorkerRequestType::Shamir3PassApplyServerLock => 10,
            WorkerRequestType::Shamir3PassRemoveServerLock => 11,
            WorkerRequestType::Shamir3PassConfigP => 12,
        }
    }
}

impl WorkerRequestType {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerRequestType::Ping => "PING",
            WorkerRequestType::GenerateVrfChallenge => "GENERATE_VRF_CHALLENGE",
            WorkerRequestType::GenerateVrfKeypairBootstrap => "GENERATE_VRF_KEYPAIR_BOOTSTRAP",
            WorkerRequestType::UnlockVrfKeypair => "UNLOCK_VRF_KEYPAIR",
            WorkerRequestType::CheckVrfStatus => "CHECK_VRF_STATUS",
            WorkerRequestType::Logout => "LOGOUT",
            WorkerRequestType::DeriveVrfKeypairFromPrf => "DERIVE_VRF_KEYPAIR_FROM_PRF",
            WorkerRequestType::Shamir3PassClientEncryptCurrentVrfKeypair => {
                "SHAMIR3PASS_CLIENT_ENCRYPT_CURRENT_VRF_KEYPAIR"
            }
            WorkerRequestType::Shamir3PassClientDecryptVrfKeypair => {
                "SHAMIR3PASS_CLIENT_DECRYPT_VRF_KEYPAIR"
            }
            WorkerRequestType::Shamir3PassGenerateServerKeypair => {
                "SHAMIR3PASS_GENERATE_SERVER_KEYPAIR"
            }
            WorkerRequestType::Shamir3PassApplyServerLock => "SHAMIR3PASS_APPLY_SERVER_LOCK_KEK",
            WorkerRequestType::Shamir3PassRemoveServerLock => "SHAMIR3PASS_REMOVE_SERVER_LOCK_KEK",
            WorkerRequestType::Shamir3PassConfigP => "SHAMIR3PASS_CONFIG_P",
        }
    }
}

// === PAYLOADS ===

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVrfChallengeRequest {
    pub vrf_input_data: VrfInputData,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateVrfKeypairBootstrapRequest {
    #[serde(default)]
    pub vrf_input_data: Option<VrfInputData>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UnlockVrfKeypairRequest {
    pub near_account_id: String,
    pub encrypted_vrf_keypair: EncryptedVrfKeypair,
    /// base64url PRF.first
    pub prf_key: String,
    #[serde(default)]
    pub expected_public_key: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct DeriveVrfKeypairFromPrfRequest {
    pub near_account_id: String,
    /// base64url PRF.first, encrypts the derived keypair
    pub prf_first: String,
    /// base64url PRF.second, seeds the derived keypair
    pub prf_second: String,
    #[serde(default = "default_true")]
    pub save_in_memory: bool,
    #[serde(default)]
    pub vrf_input_data: Option<VrfInputData>,
}

fn default_true() -> bool {
    true
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Shamir3PassClientDecryptVrfKeypairRequest {
    #[serde(rename = "nearAccountId")]
    pub near_account_id: String,
    #[serde(rename = "kek_s_b64u")]
    pub kek_s_b64u: String,
    #[serde(rename = "ciphertextVrfB64u")]
    pub ciphertext_vrf_b64u: String,
    #[serde(rename = "keyId")]
    pub key_id: String,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Shamir3PassConfigPRequest {
    pub p_b64u: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct EmptyPayload {}

enum WorkerRequest {
    GenerateVrfChallenge(GenerateVrfChallengeRequest),
    GenerateVrfKeypairBootstrap(GenerateVrfKeypairBootstrapRequest),
    UnlockVrfKeypair(UnlockVrfKeypairRequest),
    CheckVrfStatus,
    Logout,
    DeriveVrfKeypairFromPrf(DeriveVrfKeypairFromPrfRequest),
    EncryptCurrentVrfKeypair,
    DecryptVrfKeypair(Shamir3PassClientDecryptVrfKeypairRequest),
    GenerateServerKeypair,
    ApplyServerLock(ShamirApplyServerLockHTTPRequest),
    RemoveServerLock(ShamirRemoveServerLockHTTPRequest),
    ConfigP(Shamir3PassConfigPRequest),
}

impl WorkerRequest {
    fn parse(request_type: WorkerRequestType, payload: Value) -> Result<Self, String> {
        fn typed<T: DeserializeOwned>(
            request_type: WorkerRequestType,
            payload: Value,
        ) -> Result<T, String> {
            serde_json::from_value(payload)
                .map_err(|e| format!("invalid {} payload: {}", request_type.name(), e))
        }

        Ok(match request_type {
            // handled before payload parsing
            WorkerRequestType::Ping => return Err("PING carries no request".to_string()),
            WorkerRequestType::GenerateVrfChallenge => {
                WorkerRequest::GenerateVrfChallenge(typed(request_type, payload)?)
            }
            WorkerRequestType::GenerateVrfKeypairBootstrap => {
                WorkerRequest::GenerateVrfKeypairBootstrap(typed(request_type, payload)?)
            }
            WorkerRequestType::UnlockVrfKeypair => {
                WorkerRequest::UnlockVrfKeypair(typed(request_type, payload)?)
            }
            WorkerRequestType::CheckVrfStatus => {
                typed::<EmptyPayload>(request_type, payload)?;
                WorkerRequest::CheckVrfStatus
            }
            WorkerRequestType::Logout => {
                typed::<EmptyPayload>(request_type, payload)?;
                WorkerRequest::Logout
            }
            WorkerRequestType::DeriveVrfKeypairFromPrf => {
                WorkerRequest::DeriveVrfKeypairFromPrf(typed(request_type, payload)?)
            }
            WorkerRequestType::Shamir3PassClientEncryptCurrentVrfKeypair => {
                typed::<EmptyPayload>(request_type, payload)?;
                WorkerRequest::EncryptCurrentVrfKeypair
            }
            WorkerRequestType::Shamir3PassClientDecryptVrfKeypair => {
                WorkerRequest::DecryptVrfKeypair(typed(request_type, payload)?)
            }
            WorkerRequestType::Shamir3PassGenerateServerKeypair => {
                typed::<EmptyPayload>(request_type, payload)?;
                WorkerRequest::GenerateServerKeypair
            }
            WorkerRequestType::Shamir3PassApplyServerLock => {
                WorkerRequest::ApplyServerLock(typed(request_type, payload)?)
            }
            WorkerRequestType::Shamir3PassRemoveServerLock => {
                WorkerRequest::RemoveServerLock(typed(request_type, payload)?)
            }
            WorkerRequestType::Shamir3PassConfigP => {
                WorkerRequest::ConfigP(typed(request_type, payload)?)
            }
        })
    }
}

// === RESPONSES ===

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct WorkerResponse {
    pub id: Option<String>,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn success(id: Option<String>, data: Option<Value>) -> Self {
        Self {
            id,
            success: true,
            data,
            error: None,
        }
    }

    pub fn fail(id: Option<String>, error: impl std::fmt::Display) -> Self {
        Self {
            id,
            success: false,
            data: None,
            error: Some(scrub_error_message(&error.to_string())),
        }
    }
}

/// What the endpoint did with one inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkerDisposition {
    /// Not a request; no reply
    Ignored,
    /// Health check answered; does not count as a request
    Control(WorkerResponse),
    /// A real request ran; the reply may still carry a handler failure
    Handled(WorkerResponse),
    /// Well-formed envelope whose payload did not parse, or a one-shot
    /// endpoint that already served its request
    Rejected(WorkerResponse),
}

impl WorkerDisposition {
    pub fn response(&self) -> Option<&WorkerResponse> {
        match self {
            WorkerDisposition::Ignored => None,
            WorkerDisposition::Control(r)
            | WorkerDisposition::Handled(r)
            | WorkerDisposition::Rejected(r) => Some(r),
        }
    }
}

// === ENDPOINT ===

/// Key-wrap worker state: the VRF session, the Shamir prime, the relay used
/// for client-side wrapping, and optionally the relay-side key service.
pub struct WorkerEndpoint<C: VrfCryptoModule, R: RelayClient> {
    vrf: VrfCredentialService<C>,
    shamir: RefCell<Shamir3Pass>,
    relay: R,
    server: Option<RelayKeyWrapHandlers>,
    one_shot: bool,
    has_processed_request: Cell<bool>,
}

impl<C: VrfCryptoModule, R: RelayClient> WorkerEndpoint<C, R> {
    pub fn new(crypto: C, shamir: Shamir3Pass, relay: R) -> Self {
        Self {
            vrf: VrfCredentialService::new(crypto),
            shamir: RefCell::new(shamir),
            relay,
            server: None,
            one_shot: false,
            has_processed_request: Cell::new(false),
        }
    }

    /// Also answer the relay-side lock requests.
    pub fn with_server_handlers(mut self, server: RelayKeyWrapHandlers) -> Self {
        self.server = Some(server);
        self
    }

    /// Serve exactly one real request; later requests are rejected.
    pub fn one_shot(mut self) -> Self {
        self.one_shot = true;
        self
    }

    pub fn has_processed_request(&self) -> bool {
        self.has_processed_request.get()
    }

    pub fn vrf_service(&self) -> &VrfCredentialService<C> {
        &self.vrf
    }

    /// Text form of `handle_message`; unparseable text is ignored.
    pub async fn handle_json(&self, message: &str) -> WorkerDisposition {
        match serde_json::from_str::<Value>(message) {
            Ok(value) => self.handle_message(value).await,
            Err(e) => {
                debug!("Ignoring non-JSON worker message: {}", e);
                WorkerDisposition::Ignored
            }
        }
    }

    pub async fn handle_message(&self, message: Value) -> WorkerDisposition {
        let Value::Object(mut envelope) = message else {
            debug!("Ignoring non-object worker message");
            return WorkerDisposition::Ignored;
        };
        let Some(raw_type) = envelope
            .get("type")
            .and_then(Value::as_u64)
            .and_then(|t| u32::try_from(t).ok())
        else {
            debug!("Ignoring worker message without a numeric type");
            return WorkerDisposition::Ignored;
        };
        let Ok(request_type) = WorkerRequestType::try_from(raw_type) else {
            debug!("Ignoring unknown worker message type {}", raw_type);
            return WorkerDisposition::Ignored;
        };
        let id = envelope.get("id").and_then(Value::as_str).map(str::to_string);

        if request_type == WorkerRequestType::Ping {
            return WorkerDisposition::Control(WorkerResponse::success(
                id,
                Some(json!({ "status": "alive", "timestamp": now_ms() })),
            ));
        }

        let payload = match envelope.remove("payload") {
            Some(Value::Null) | None => {
                debug!("Ignoring {} without payload", request_type.name());
                return WorkerDisposition::Ignored;
            }
            Some(payload) => payload,
        };
        let request = match WorkerRequest::parse(request_type, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!("Rejecting worker message: {}", e);
                return WorkerDisposition::Rejected(WorkerResponse::fail(id, e));
            }
        };
        if self.one_shot && self.has_processed_request.get() {
            warn!("One-shot worker refused {}", request_type.name());
            return WorkerDisposition::Rejected(WorkerResponse::fail(
                id,
                "worker already processed its request",
            ));
        }
        self.has_processed_request.set(true);

        debug!("Worker handling {}", request_type.name());
        let response = match self.dispatch(request).await {
            Ok(data) => WorkerResponse::success(id, data),
            Err(e) => {
                warn!("{} failed: {}", request_type.name(), scrub_error_message(&e));
                WorkerResponse::fail(id, e)
            }
        };
        WorkerDisposition::Handled(response)
    }

    async fn dispatch(&self, request: WorkerRequest) -> Result<Option<Value>, String> {
        match request {
            WorkerRequest::GenerateVrfChallenge(req) => {
                let challenge = self
                    .vrf
                    .build_verifiable_challenge(&req.vrf_input_data)
                    .map_err(|e| e.to_string())?;
                Ok(Some(challenge.to_json()))
            }
            WorkerRequest::GenerateVrfKeypairBootstrap(req) => {
                let vrf_public_key = self
                    .vrf
                    .generate_bootstrap_keypair()
                    .map_err(|e| e.to_string())?;
                let vrf_challenge_data = match &req.vrf_input_data {
                    Some(input) => Some(
                        self.vrf
                            .build_verifiable_challenge(input)
                            .map_err(|e| e.to_string())?
                            .to_json(),
                    ),
                    None => None,
                };
                Ok(Some(json!({
                    "vrfPublicKey": vrf_public_key,
                    "vrfChallengeData": vrf_challenge_data,
                })))
            }
            WorkerRequest::UnlockVrfKeypair(req) => {
                let prf_first = Zeroizing::new(base64_url_decode(&req.prf_key)?);
                let vrf_public_key = self
                    .vrf
                    .unlock_with_prf(
                        &req.encrypted_vrf_keypair,
                        &prf_first,
                        req.expected_public_key.as_deref(),
                    )
                    .map_err(|e| e.to_string())?;
                info!("VRF keypair unlocked for {}", req.near_account_id);
                Ok(Some(json!({ "vrfPublicKey": vrf_public_key })))
            }
            WorkerRequest::CheckVrfStatus => {
                let status = serde_json::to_value(self.vrf.vrf_status())
                    .map_err(|e| e.to_string())?;
                Ok(Some(status))
            }
            WorkerRequest::Logout => {
                self.vrf.logout();
                Ok(None)
            }
            WorkerRequest::DeriveVrfKeypairFromPrf(req) => {
                let prf = PrfOutputs {
                    first: Zeroizing::new(base64_url_decode(&req.prf_first)?),
                    second: Zeroizing::new(base64_url_decode(&req.prf_second)?),
                };
                let (vrf_public_key, encrypted) = self
                    .vrf
                    .derive_deterministic_keypair(&prf, &req.near_account_id, req.save_in_memory)
                    .map_err(|e| e.to_string())?;
                let vrf_challenge_data = match (&req.vrf_input_data, req.save_in_memory) {
                    (Some(input), true) => Some(
                        self.vrf
                            .build_verifiable_challenge(input)
                            .map_err(|e| e.to_string())?
                            .to_json(),
                    ),
                    _ => None,
                };
                Ok(Some(json!({
                    "vrfPublicKey": vrf_public_key,
                    "encryptedVrfKeypair": encrypted,
                    "vrfChallengeData": vrf_challenge_data,
                })))
            }
            WorkerRequest::EncryptCurrentVrfKeypair => {
                let keypair_bytes = self.vrf.current_keypair_bytes().map_err(|e| e.to_string())?;
                let vrf_public_key = self.vrf.current_public_key();
                let shamir = self.shamir.borrow().clone();
                let blob = KeyWrapClient::new(&shamir, &self.relay)
                    .wrap_vrf_keypair(&keypair_bytes)
                    .await
                    .map_err(|e| e.to_string())?;
                let mut data = serde_json::to_value(&blob).map_err(|e| e.to_string())?;
                data["vrfPublicKey"] = json!(vrf_public_key);
                Ok(Some(data))
            }
            WorkerRequest::DecryptVrfKeypair(req) => {
                let blob = ServerEncryptedVrfKeypair {
                    ciphertext_vrf_b64u: req.ciphertext_vrf_b64u,
                    kek_s_b64u: req.kek_s_b64u,
                    server_key_id: req.key_id,
                };
                let shamir = self.shamir.borrow().clone();
                let keypair_bytes = KeyWrapClient::new(&shamir, &self.relay)
                    .unwrap_vrf_keypair(&blob)
                    .await
                    .map_err(|e| e.to_string())?;
                let vrf_public_key = self
                    .vrf
                    .load_plaintext_keypair(&keypair_bytes, None)
                    .map_err(|e| e.to_string())?;
                info!("VRF keypair unlocked via relay for {}", req.near_account_id);
                Ok(Some(json!({ "vrfPublicKey": vrf_public_key })))
            }
            WorkerRequest::GenerateServerKeypair => {
                let keypair = self
                    .server_handlers()?
                    .generate_server_keypair()
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(keypair).map(Some).map_err(|e| e.to_string())
            }
            WorkerRequest::ApplyServerLock(req) => {
                let resp = self
                    .server_handlers()?
                    .apply_server_lock(req)
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(resp).map(Some).map_err(|e| e.to_string())
            }
            WorkerRequest::RemoveServerLock(req) => {
                let resp = self
                    .server_handlers()?
                    .remove_server_lock(req)
                    .map_err(|e| e.to_string())?;
                serde_json::to_value(resp).map(Some).map_err(|e| e.to_string())
            }
            WorkerRequest::ConfigP(req) => {
                let shamir = Shamir3Pass::new(&req.p_b64u).map_err(|e| e.to_string())?;
                *self.shamir.borrow_mut() = shamir;
                info!("Shamir prime reconfigured");
                Ok(Some(json!({ "status": "ok", "p_b64u": req.p_b64u })))
            }
        }
    }

    fn server_handlers(&self) -> Result<&RelayKeyWrapHandlers, String> {
        self.server
            .as_ref()
            .ok_or_else(|| "no server key service in this worker".to_string())
    }
}
