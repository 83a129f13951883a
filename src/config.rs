/// Configuration for the wallet core
///
/// Compile-time constants live at the top of this module; runtime configuration
/// (`WalletConfig`, `ShamirServerConfig`) is deserialized from JSON or read from
/// the environment by the host.
use serde::{Deserialize, Serialize};

use crate::errors::KeyWrapError;

// === LOGGING CONFIGURATION ===

/// Log level used by `init_logging` on wasm32 targets
/// Available levels: Error, Warn, Info, Debug, Trace
pub const CURRENT_LOG_LEVEL: log::Level = log::Level::Info;

// === CRYPTOGRAPHIC CONSTANTS ===

/// Domain separator for VRF challenge generation
/// Used to ensure VRF challenges are domain-specific and cannot be replayed across different contexts
pub const VRF_DOMAIN_SEPARATOR: &[u8] = b"web3_authn_challenge_v4";

/// HKDF info string for ChaCha20 key derivation from PRF output
pub const HKDF_CHACHA20_KEY_INFO: &[u8] = b"vrf-chacha20-key";

/// HKDF info string for deriving VRF secret material from PRF.second
pub const HKDF_VRF_KEYPAIR_INFO: &[u8] = b"tatchi:v1:vrf-sk";

/// HKDF info string for the Ed25519 signing key derived from PRF.second
pub const ED25519_HKDF_KEY_INFO: &[u8] = b"ed25519-signing-key-dual-prf-v1";

/// Prefix of the PRF `eval.first` salt (encryption purpose)
pub const ENCRYPTION_SALT_PREFIX: &str = "chacha20-salt:";

/// Prefix of the PRF `eval.second` salt (signing purpose)
pub const SIGNING_SALT_PREFIX: &str = "ed25519-salt:";

// === ENCRYPTION PARAMETERS ===

/// ChaCha20Poly1305 key size in bytes (256 bits)
pub const CHACHA20_KEY_SIZE: usize = 32;

/// ChaCha20Poly1305 nonce/IV size in bytes (96 bits)
pub const CHACHA20_NONCE_SIZE: usize = 12;

/// VRF seed size in bytes for deterministic generation (256 bits)
pub const VRF_SEED_SIZE: usize = 32;

/// Number of challenge bytes handed to the platform authenticator
pub const WEBAUTHN_CHALLENGE_SIZE: usize = 32;

/// HKDF info string for deriving AEAD key from Shamir3Pass KEK (K)
pub const SHAMIR_AEAD_HKDF_INFO: &[u8] = b"web3authn-shamir3pass-kek-to-aead-key-v1";

// === SHAMIR 3-PASS CONFIGURATION ===

/// Minimum prime size in bits for Shamir 3-pass security validation
pub const SHAMIR_MIN_PRIME_BITS: usize = 256;

/// Maximum number of rejection sampling attempts for random key generation
pub const SHAMIR_REJECTION_SAMPLING_MAX_ATTEMPTS: u32 = 64;

/// Extra bytes to generate during rejection sampling for better distribution
pub const SHAMIR_RANDOM_BYTES_OVERHEAD: usize = 64;

/// Miller-Rabin rounds used by the safe-prime policy check
pub const SHAMIR_PRIMALITY_ROUNDS: usize = 32;

/// Default bound on retained grace keys
pub const DEFAULT_MAX_GRACE_KEYS: usize = 5;

// Default Shamir P (256-bit safe prime)
pub const DEFAULT_SHAMIR_P_B64U: &str = "3N5w46AIGjGT2v5Vua_TMD5Ywfa9U2F7-WzW8SNDsIM";

// === TRANSPORT DEFAULTS ===

pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_FOCUS_RETRY_ATTEMPTS: u32 = 2;
pub const DEFAULT_FOCUS_RETRY_BACKOFF_MS: u64 = 150;

// === DEVICE LINKING DEFAULTS ===

pub const DEFAULT_DEVICE_LINK_POLL_INTERVAL_MS: u64 = 3_000;
pub const DEFAULT_DEVICE_LINK_MAX_POLLS: u32 = 100;

/// Number of characters to show when displaying truncated keys/hashes in logs
pub const DISPLAY_TRUNCATE_LENGTH: usize = 20;

// === RELAY ROUTES ===

pub const APPLY_SERVER_LOCK_ROUTE: &str = "/vrf/apply-server-lock";
pub const REMOVE_SERVER_LOCK_ROUTE: &str = "/vrf/remove-server-lock";
pub const SHAMIR_KEY_INFO_ROUTE: &str = "/shamir/key-info";
pub const CREATE_ACCOUNT_ROUTE: &str = "/create_account_and_register_user";

/// JSON field names for VRF challenge data serialization
pub mod vrf_challenge_fields {
    pub const VRF_INPUT: &str = "vrfInput";
    pub const VRF_OUTPUT: &str = "vrfOutput";
    pub const VRF_PROOF: &str = "vrfProof";
    pub const VRF_PUBLIC_KEY: &str = "vrfPublicKey";
    pub const USER_ID: &str = "userId";
    pub const RP_ID: &str = "rpId";
    pub const BLOCK_HEIGHT: &str = "blockHeight";
    pub const BLOCK_HASH: &str = "blockHash";
}

// === RUNTIME CONFIGURATION ===

/// How the WebAuthn `rp.id` is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", tag = "mode")]
pub enum RpIdPolicy {
    /// Registrable parent domain shared by the app and wallet origins.
    #[default]
    ParentDomain,
    /// The wallet's own host; requires Related Origin Requests at `/.well-known/webauthn`.
    WalletScoped,
    /// Fixed value supplied by the integrator.
    Explicit { rp_id: String },
}

impl RpIdPolicy {
    pub fn resolve(&self, app_origin: &str, wallet_origin: &str) -> String {
        match self {
            RpIdPolicy::ParentDomain => parent_domain(&host_of(app_origin)),
            RpIdPolicy::WalletScoped => host_of(wallet_origin),
            RpIdPolicy::Explicit { rp_id } => rp_id.clone(),
        }
    }
}

fn host_of(origin: &str) -> String {
    let without_scheme = origin.split("://").nth(1).unwrap_or(origin);
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    host_port.split(':').next().unwrap_or(host_port).to_ascii_lowercase()
}

fn parent_domain(host: &str) -> String {
    if host == "localhost" || host.parse::<std::net::IpAddr>().is_ok() {
        return host.to_string();
    }
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[labels.len() - 2..].join(".")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub url: String,
    pub apply_lock_route: String,
    pub remove_lock_route: String,
    pub key_info_route: String,
    pub create_account_route: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            apply_lock_route: APPLY_SERVER_LOCK_ROUTE.to_string(),
            remove_lock_route: REMOVE_SERVER_LOCK_ROUTE.to_string(),
            key_info_route: SHAMIR_KEY_INFO_ROUTE.to_string(),
            create_account_route: CREATE_ACCOUNT_ROUTE.to_string(),
        }
    }
}

impl RelayConfig {
    /// Join a route onto the relay base URL; absolute routes are used as-is.
    pub fn endpoint(&self, route: &str) -> String {
        let route = route.trim();
        if route.starts_with("http://") || route.starts_with("https://") {
            return route.to_string();
        }
        format!(
            "{}/{}",
            self.url.trim().trim_end_matches('/'),
            route.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    pub request_timeout_ms: u64,
    pub focus_retry_attempts: u32,
    pub focus_retry_backoff_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            focus_retry_attempts: DEFAULT_FOCUS_RETRY_ATTEMPTS,
            focus_retry_backoff_ms: DEFAULT_FOCUS_RETRY_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceLinkingConfig {
    pub poll_interval_ms: u64,
    pub max_polls: u32,
    pub auto_login: bool,
}

impl Default for DeviceLinkingConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_DEVICE_LINK_POLL_INTERVAL_MS,
            max_polls: DEFAULT_DEVICE_LINK_MAX_POLLS,
            auto_login: true,
        }
    }
}

/// Runtime configuration of one wallet context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WalletConfig {
    pub wallet_origin: String,
    pub app_origin: String,
    pub rp_id_policy: RpIdPolicy,
    pub relay: RelayConfig,
    pub shamir_p_b64u: String,
    pub transport: TransportConfig,
    pub device_linking: DeviceLinkingConfig,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            wallet_origin: String::new(),
            app_origin: String::new(),
            rp_id_policy: RpIdPolicy::default(),
            relay: RelayConfig::default(),
            shamir_p_b64u: DEFAULT_SHAMIR_P_B64U.to_string(),
            transport: TransportConfig::default(),
            device_linking: DeviceLinkingConfig::default(),
        }
    }
}

impl WalletConfig {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn rp_id(&self) -> String {
        self.rp_id_policy
            .resolve(&self.app_origin, &self.wallet_origin)
    }
}

// === SERVER CONFIGURATION ===

pub mod env_keys {
    pub const SHAMIR_P_B64U: &str = "SHAMIR_P_B64U";
    pub const SHAMIR_E_S_B64U: &str = "SHAMIR_E_S_B64U";
    pub const SHAMIR_D_S_B64U: &str = "SHAMIR_D_S_B64U";
    pub const SHAMIR_GRACE_KEYS_FILE: &str = "SHAMIR_GRACE_KEYS_FILE";
    pub const SHAMIR_MAX_GRACE_KEYS: &str = "SHAMIR_MAX_GRACE_KEYS";
}

/// Relay-side key-wrap configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ShamirServerConfig {
    pub p_b64u: Option<String>,
    pub e_s_b64u: Option<String>,
    pub d_s_b64u: Option<String>,
    pub grace_keys_file: Option<String>,
    pub max_grace_keys: Option<usize>,
}

impl ShamirServerConfig {
    pub fn from_env() -> Result<Self, KeyWrapError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, KeyWrapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let max_grace_keys = match non_empty(env_keys::SHAMIR_MAX_GRACE_KEYS) {
            Some(raw) => Some(raw.trim().parse::<usize>().map_err(|_| {
                KeyWrapError::Config(format!(
                    "{} must be a non-negative integer, got {}",
                    env_keys::SHAMIR_MAX_GRACE_KEYS,
                    raw
                ))
            })?),
            None => None,
        };
        let config = Self {
            p_b64u: non_empty(env_keys::SHAMIR_P_B64U),
            e_s_b64u: non_empty(env_keys::SHAMIR_E_S_B64U),
            d_s_b64u: non_empty(env_keys::SHAMIR_D_S_B64U),
            grace_keys_file: non_empty(env_keys::SHAMIR_GRACE_KEYS_FILE),
            max_grace_keys,
        };
        if config.e_s_b64u.is_some() != config.d_s_b64u.is_some() {
            return Err(KeyWrapError::Config(
                "SHAMIR_E_S_B64U and SHAMIR_D_S_B64U must be set together".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn p_b64u_or_default(&self) -> &str {
        self.p_b64u.as_deref().unwrap_or(DEFAULT_SHAMIR_P_B64U)
    }

    pub fn max_grace_keys_or_default(&self) -> usize {
        self.max_grace_keys.unwrap_or(DEFAULT_MAX_GRACE_KEYS)
    }
}
