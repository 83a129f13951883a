//! Test doubles: a fast stand-in VRF module, a scripted WebAuthn platform, an
//! in-memory chain, and a relay that runs the real key-wrap handlers in process.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::sync::Arc;

use ed25519_dalek::SigningKey;
use serde_json::json;

use crate::ceremony::{
    CeremonyEvent, DeviceRegistration, EventSink, MemoryWalletStore, NearChainClient,
    WalletContext,
};
use crate::config::{RpIdPolicy, WalletConfig, HKDF_VRF_KEYPAIR_INFO};
use crate::crypto::{hkdf_expand, vrf_input_bytes, EcvrfCryptoModule, VrfCryptoModule};
use crate::errors::{DerivationError, KeyWrapError, KeyWrapResult, TransportResult, VrfResult};
use crate::handlers::RelayKeyWrapHandlers;
use crate::http::RelayClient;
use crate::shamir3pass::{GraceKeySet, ServerKeypair, Shamir3Pass, ShamirKeyWrapService};
use crate::transport::{MessageTarget, TransportMessage};
use crate::types::http::{
    CreateAccountAndRegisterRequest, CreateAccountAndRegisterResponse,
    ShamirApplyServerLockHTTPRequest, ShamirApplyServerLockHTTPResponse,
    ShamirKeyInfoHTTPResponse, ShamirRemoveServerLockHTTPRequest,
    ShamirRemoveServerLockHTTPResponse,
};
use crate::types::*;
use crate::utils::{base64_url_encode, near_public_key_string, now_ms, random_bytes, sha256};
use crate::webauthn::{DirectWebAuthn, PlatformRejection, WebAuthnPlatform};

pub const APP_ORIGIN: &str = "https://app.example.com";
pub const WALLET_ORIGIN: &str = "https://wallet.example.com";

// === MOCK VRF ===

/// Hash-based VRF stand-in. Outputs and proofs are deterministic in the
/// keypair and input, and proofs verify from public data only.
#[derive(Default, Clone, Copy)]
pub struct MockCryptoModule;

fn mock_material(secret: &[u8]) -> VrfKeypairMaterial {
    VrfKeypairMaterial {
        keypair_bytes: zeroize::Zeroizing::new(secret.to_vec()),
        public_key: sha256(&[b"pk".as_slice(), secret].concat()).to_vec(),
    }
}

fn mock_proof(public_key: &[u8], input: &[u8], output: &[u8]) -> Vec<u8> {
    sha256(&[public_key, input, output].concat()).to_vec()
}

impl VrfCryptoModule for MockCryptoModule {
    fn generate_vrf_keypair(&self) -> VrfResult<VrfKeypairMaterial> {
        let secret = random_bytes::<32>().map_err(DerivationError::VrfCrypto)?;
        Ok(mock_material(&secret))
    }

    fn derive_vrf_keypair_from_seed(
        &self,
        prf_second: &[u8],
        account_id: &str,
    ) -> VrfResult<VrfKeypairMaterial> {
        let secret =
            hkdf_expand::<32>(Some(account_id.as_bytes()), prf_second, HKDF_VRF_KEYPAIR_INFO)?;
        Ok(mock_material(&secret[..]))
    }

    fn derive_vrf_challenge(
        &self,
        keypair: &VrfKeypairMaterial,
        input: &VrfInputData,
    ) -> VrfResult<VerifiableVrfChallenge> {
        let (vrf_input, block_hash) = vrf_input_bytes(input)?;
        let first = sha256(&[&keypair.keypair_bytes[..], &vrf_input[..]].concat());
        let second = sha256(&first);
        let vrf_output = [first, second].concat();
        Ok(VerifiableVrfChallenge {
            vrf_proof: mock_proof(&keypair.public_key, &vrf_input, &vrf_output),
            vrf_input,
            vrf_output,
            vrf_public_key: keypair.public_key.clone(),
            user_id: input.user_id.clone(),
            rp_id: input.rp_id.clone(),
            block_height: input.block_height.clone(),
            block_hash,
        })
    }

    fn verify_vrf_proof(&self, challenge: &VerifiableVrfChallenge) -> VrfResult<bool> {
        let expected = mock_proof(
            &challenge.vrf_public_key,
            &challenge.vrf_input,
            &challenge.vrf_output,
        );
        Ok(expected == challenge.vrf_proof)
    }

    fn derive_keys_from_prf(&self, prf: &PrfOutputs, salts: &PrfSalts) -> VrfResult<DerivedKeys> {
        EcvrfCryptoModule.derive_keys_from_prf(prf, salts)
    }
}

// === WEBAUTHN PLATFORM ===

/// Authenticator holding one passkey per seed. PRF outputs are
/// `sha256(seed ‖ salt)`, so the same seed always yields the same keys.
#[derive(Clone)]
pub struct FakePlatform {
    seed: Rc<Vec<u8>>,
    rejections: Rc<RefCell<VecDeque<PlatformRejection>>>,
    calls: Rc<Cell<u32>>,
    focus_requests: Rc<Cell<u32>>,
    last_options: Rc<RefCell<Option<CeremonyOptions>>>,
    on_call: Rc<RefCell<Option<Box<dyn Fn()>>>>,
}

impl FakePlatform {
    pub fn new(seed: &str) -> Self {
        Self {
            seed: Rc::new(seed.as_bytes().to_vec()),
            rejections: Rc::default(),
            calls: Rc::default(),
            focus_requests: Rc::default(),
            last_options: Rc::default(),
            on_call: Rc::default(),
        }
    }

    /// The next call fails with `rejection`; queued rejections are used in order.
    pub fn reject_next(&self, rejection: PlatformRejection) {
        self.rejections.borrow_mut().push_back(rejection);
    }

    /// Run `hook` at the start of every ceremony.
    pub fn on_call(&self, hook: impl Fn() + 'static) {
        *self.on_call.borrow_mut() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> u32 {
        self.calls.get()
    }

    pub fn focus_requests(&self) -> u32 {
        self.focus_requests.get()
    }

    pub fn last_options(&self) -> Option<CeremonyOptions> {
        self.last_options.borrow().clone()
    }

    pub fn credential_id(&self) -> String {
        base64_url_encode(&sha256(&[b"credential".as_slice(), self.seed.as_slice()].concat())[..16])
    }

    fn prf_output(&self, salt: &[u8]) -> String {
        base64_url_encode(&sha256(&[self.seed.as_slice(), salt].concat()))
    }

    fn ceremony(
        &self,
        options: CeremonyOptions,
        challenge: &[u8],
        salts: &PrfSalts,
    ) -> Result<WebAuthnCredential, PlatformRejection> {
        self.calls.set(self.calls.get() + 1);
        if let Some(hook) = self.on_call.borrow().as_ref() {
            hook();
        }
        let kind = options.kind();
        *self.last_options.borrow_mut() = Some(options);
        if let Some(rejection) = self.rejections.borrow_mut().pop_front() {
            return Err(rejection);
        }

        let client_data = json!({
            "type": if kind == CeremonyKind::Create { "webauthn.create" } else { "webauthn.get" },
            "challenge": base64_url_encode(challenge),
            "origin": WALLET_ORIGIN,
        });
        let id = self.credential_id();
        let mut response = CredentialResponse {
            client_data_json: base64_url_encode(client_data.to_string().as_bytes()),
            transports: vec!["internal".to_string()],
            ..CredentialResponse::default()
        };
        match kind {
            CeremonyKind::Create => {
                response.attestation_object = Some(base64_url_encode(b"attestation"));
            }
            CeremonyKind::Get => {
                response.authenticator_data = Some(base64_url_encode(b"authenticator-data"));
                response.signature = Some(base64_url_encode(b"signature"));
            }
        }
        Ok(WebAuthnCredential {
            id: id.clone(),
            raw_id: id,
            credential_type: "public-key".to_string(),
            authenticator_attachment: Some("platform".to_string()),
            response,
            client_extension_results: ClientExtensionResults {
                prf: Some(PrfExtensionResults {
                    enabled: Some(true),
                    results: PrfResults {
                        first: Some(self.prf_output(&salts.encryption_salt)),
                        second: Some(self.prf_output(&salts.signing_salt)),
                    },
                }),
            },
        })
    }
}

impl WebAuthnPlatform for FakePlatform {
    async fn create(
        &self,
        options: &CredentialCreationOptions,
    ) -> Result<WebAuthnCredential, PlatformRejection> {
        self.ceremony(
            CeremonyOptions::Create(options.clone()),
            &options.challenge,
            &options.prf,
        )
    }

    async fn get(
        &self,
        options: &CredentialRequestOptions,
    ) -> Result<WebAuthnCredential, PlatformRejection> {
        self.ceremony(
            CeremonyOptions::Get(options.clone()),
            &options.challenge,
            &options.prf,
        )
    }

    async fn reclaim_focus(&self) -> bool {
        self.focus_requests.set(self.focus_requests.get() + 1);
        true
    }
}

// === MESSAGE TARGET ===

/// Collects posted messages instead of delivering them.
#[derive(Default)]
pub struct RecordingTarget {
    posted: RefCell<Vec<(TransportMessage, String)>>,
}

impl RecordingTarget {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    pub fn posted(&self) -> Vec<TransportMessage> {
        self.posted.borrow().iter().map(|(m, _)| m.clone()).collect()
    }

    pub fn last(&self) -> Option<(TransportMessage, String)> {
        self.posted.borrow().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.posted.borrow().len()
    }
}

impl MessageTarget for RecordingTarget {
    fn post_message(&self, message: &TransportMessage, target_origin: &str) -> TransportResult<()> {
        self.posted
            .borrow_mut()
            .push((message.clone(), target_origin.to_string()));
        Ok(())
    }
}

// === CHAIN ===

/// Accounts, access keys and contract authenticators kept in memory.
#[derive(Default)]
pub struct FakeChain {
    height: Cell<u64>,
    access_keys: RefCell<HashMap<String, Vec<String>>>,
    authenticators: RefCell<HashMap<String, Vec<StoredAuthenticator>>>,
    transactions: Cell<u64>,
}

impl FakeChain {
    pub fn new() -> Rc<Self> {
        let chain = Self::default();
        chain.height.set(1_000);
        Rc::new(chain)
    }

    pub fn account_exists(&self, account_id: &str) -> bool {
        self.access_keys.borrow().contains_key(account_id)
    }

    pub fn access_keys(&self, account_id: &str) -> Vec<String> {
        self.access_keys
            .borrow()
            .get(account_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn add_access_key(&self, account_id: &str, public_key: &str) {
        self.access_keys
            .borrow_mut()
            .entry(account_id.to_string())
            .or_default()
            .push(public_key.to_string());
    }

    pub fn register_authenticator(&self, authenticator: StoredAuthenticator) {
        self.authenticators
            .borrow_mut()
            .entry(authenticator.near_account_id.clone())
            .or_default()
            .push(authenticator);
    }

    fn remove_access_key(&self, account_id: &str, public_key: &str) {
        if let Some(keys) = self.access_keys.borrow_mut().get_mut(account_id) {
            keys.retain(|k| k != public_key);
        }
    }

    fn require_signer(&self, account_id: &str, signer: &SigningKey) -> Result<(), String> {
        let public_key = near_public_key_string(signer.verifying_key().as_bytes());
        if self.access_keys(account_id).contains(&public_key) {
            Ok(())
        } else {
            Err(format!("{} is not an access key of {}", public_key, account_id))
        }
    }

    pub fn next_transaction(&self) -> String {
        let n = self.transactions.get() + 1;
        self.transactions.set(n);
        self.height.set(self.height.get() + 1);
        bs58::encode(sha256(format!("tx-{}", n).as_bytes())).into_string()
    }
}

impl NearChainClient for FakeChain {
    async fn latest_block(&self) -> Result<BlockInfo, String> {
        let height = self.height.get();
        Ok(BlockInfo {
            height,
            hash: bs58::encode(sha256(&height.to_le_bytes())).into_string(),
        })
    }

    async fn has_access_key(&self, account_id: &str, public_key: &str) -> Result<bool, String> {
        Ok(self.access_keys(account_id).iter().any(|k| k == public_key))
    }

    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String> {
        Ok(self
            .authenticators
            .borrow()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn account_for_public_key(&self, public_key: &str) -> Result<Option<String>, String> {
        Ok(self
            .access_keys
            .borrow()
            .iter()
            .find(|(_, keys)| keys.iter().any(|k| k == public_key))
            .map(|(account, _)| account.clone()))
    }

    async fn add_device_key(
        &self,
        account_id: &str,
        signer: &SigningKey,
        device_public_key: &str,
    ) -> Result<String, String> {
        self.require_signer(account_id, signer)?;
        self.add_access_key(account_id, device_public_key);
        Ok(self.next_transaction())
    }

    async fn swap_device_key(
        &self,
        account_id: &str,
        temp_signer: &SigningKey,
        registration: &DeviceRegistration,
    ) -> Result<String, String> {
        self.require_signer(account_id, temp_signer)?;
        let temp_key = near_public_key_string(temp_signer.verifying_key().as_bytes());
        self.remove_access_key(account_id, &temp_key);
        self.add_access_key(account_id, &registration.new_public_key);
        self.register_authenticator(StoredAuthenticator {
            credential_id: registration.credential.raw_id.clone(),
            near_account_id: account_id.to_string(),
            vrf_public_key: Some(registration.deterministic_vrf_public_key.clone()),
            transports: registration.credential.response.transports.clone(),
            registered_at: now_ms(),
        });
        Ok(self.next_transaction())
    }
}

// === RELAY ===

/// Relay backed by the real key-wrap handlers; account creation writes to a `FakeChain`.
pub struct InProcessRelay {
    handlers: RelayKeyWrapHandlers,
    chain: Rc<FakeChain>,
    created: RefCell<Vec<CreateAccountAndRegisterRequest>>,
    key_wrap_available: Cell<bool>,
}

impl InProcessRelay {
    pub fn new(chain: Rc<FakeChain>) -> Rc<Self> {
        let shamir = Shamir3Pass::new_default();
        let current = ServerKeypair::generate(&shamir).expect("server keypair");
        let service = ShamirKeyWrapService::new(shamir, current, GraceKeySet::new(5), None);
        Rc::new(Self {
            handlers: RelayKeyWrapHandlers::new(Arc::new(service)),
            chain,
            created: RefCell::default(),
            key_wrap_available: Cell::new(true),
        })
    }

    pub fn handlers(&self) -> &RelayKeyWrapHandlers {
        &self.handlers
    }

    pub fn service(&self) -> &ShamirKeyWrapService {
        self.handlers.service()
    }

    pub fn set_key_wrap_available(&self, available: bool) {
        self.key_wrap_available.set(available);
    }

    pub fn created_accounts(&self) -> Vec<CreateAccountAndRegisterRequest> {
        self.created.borrow().clone()
    }

    fn check_available(&self) -> KeyWrapResult<()> {
        if self.key_wrap_available.get() {
            Ok(())
        } else {
            Err(KeyWrapError::Relay("HTTP 503".to_string()))
        }
    }
}

impl RelayClient for InProcessRelay {
    async fn apply_server_lock(
        &self,
        request: ShamirApplyServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirApplyServerLockHTTPResponse> {
        self.check_available()?;
        self.handlers.apply_server_lock(request)
    }

    async fn remove_server_lock(
        &self,
        request: ShamirRemoveServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirRemoveServerLockHTTPResponse> {
        self.check_available()?;
        self.handlers.remove_server_lock(request)
    }

    async fn key_info(&self) -> KeyWrapResult<ShamirKeyInfoHTTPResponse> {
        self.check_available()?;
        Ok(self.handlers.key_info())
    }

    async fn create_account_and_register_user(
        &self,
        request: CreateAccountAndRegisterRequest,
    ) -> Result<CreateAccountAndRegisterResponse, String> {
        self.created.borrow_mut().push(request.clone());
        if self.chain.account_exists(&request.new_account_id) {
            return Ok(CreateAccountAndRegisterResponse {
                success: false,
                transaction_hash: None,
                error: Some(format!("account {} already exists", request.new_account_id)),
            });
        }
        self.chain
            .add_access_key(&request.new_account_id, &request.new_public_key);
        self.chain.register_authenticator(StoredAuthenticator {
            credential_id: request.webauthn_registration.raw_id.clone(),
            near_account_id: request.new_account_id.clone(),
            vrf_public_key: Some(request.deterministic_vrf_public_key.clone()),
            transports: request.webauthn_registration.response.transports.clone(),
            registered_at: now_ms(),
        });
        Ok(CreateAccountAndRegisterResponse {
            success: true,
            transaction_hash: Some(self.chain.next_transaction()),
            error: None,
        })
    }
}

// === WALLET FIXTURES ===

pub type TestWallet = WalletContext<
    MockCryptoModule,
    DirectWebAuthn<FakePlatform>,
    Rc<InProcessRelay>,
    Rc<FakeChain>,
    Rc<MemoryWalletStore>,
>;

pub fn test_config() -> WalletConfig {
    let mut config = WalletConfig {
        wallet_origin: WALLET_ORIGIN.to_string(),
        app_origin: APP_ORIGIN.to_string(),
        rp_id_policy: RpIdPolicy::ParentDomain,
        ..WalletConfig::default()
    };
    config.device_linking.poll_interval_ms = 50;
    config.device_linking.max_polls = 40;
    config
}

/// Chain and relay shared by every wallet (device) in a test.
pub struct TestNetwork {
    pub chain: Rc<FakeChain>,
    pub relay: Rc<InProcessRelay>,
}

pub struct TestDevice {
    pub wallet: TestWallet,
    pub platform: FakePlatform,
    pub store: Rc<MemoryWalletStore>,
}

impl TestNetwork {
    pub fn new() -> Self {
        let chain = FakeChain::new();
        let relay = InProcessRelay::new(Rc::clone(&chain));
        Self { chain, relay }
    }

    /// A wallet whose authenticator holds the passkey named by `seed`.
    pub fn device(&self, seed: &str) -> TestDevice {
        self.device_with_config(seed, test_config())
    }

    pub fn device_with_config(&self, seed: &str, config: WalletConfig) -> TestDevice {
        let platform = FakePlatform::new(seed);
        let store = Rc::new(MemoryWalletStore::new());
        let wallet = WalletContext::new(
            config,
            MockCryptoModule,
            DirectWebAuthn(platform.clone()),
            Rc::clone(&self.relay),
            Rc::clone(&self.chain),
            Rc::clone(&store),
        )
        .expect("wallet context");
        TestDevice {
            wallet,
            platform,
            store,
        }
    }
}

// === EVENTS ===

pub type EventLog<P> = Rc<RefCell<Vec<CeremonyEvent<P>>>>;

/// Sink that appends every event to the returned log.
pub fn recorder<P: Copy + 'static>() -> (EventLog<P>, Option<EventSink<P>>) {
    let log: EventLog<P> = Rc::default();
    let sink_log = Rc::clone(&log);
    let sink: EventSink<P> = Box::new(move |event: &CeremonyEvent<P>| {
        sink_log.borrow_mut().push(event.clone());
    });
    (log, Some(sink))
}
