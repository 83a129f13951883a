//! Embedded-wallet authentication core.
//!
//! Turns a platform passkey with the PRF extension into verifiable VRF
//! challenges and reproducible key material, wraps the VRF keypair under a
//! rotating Shamir 3-pass server lock, and carries requests between a hosting
//! page and an isolated wallet context.

use log::debug;

pub mod ceremony;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod handlers;
pub mod http;
pub mod manager;
pub mod shamir3pass;
pub mod transport;
pub mod types;
pub mod utils;
pub mod webauthn;
pub mod worker;

#[cfg(target_arch = "wasm32")]
pub mod wasm;

#[cfg(test)]
mod test_support;

pub use ceremony::{
    CeremonyCancel, CeremonyEvent, CeremonyPhase, EventSink, EventStatus, WalletContext,
    WalletRequest,
};
pub use config::{RpIdPolicy, ShamirServerConfig, WalletConfig};
pub use crypto::{EcvrfCryptoModule, VrfCryptoModule};
pub use errors::{
    CeremonyError, CeremonyErrorKind, ChallengeValidationError, CredentialCeremonyError,
    DerivationError, KeyWrapError, TransportError,
};
pub use handlers::RelayKeyWrapHandlers;
pub use http::{HttpRelayClient, RelayClient};
pub use manager::VrfCredentialService;
pub use shamir3pass::{KeyWrapClient, Shamir3Pass, ShamirKeyWrapService};
pub use transport::{TransportEndpoint, TransportMessage};
pub use webauthn::{CredentialCeremony, DirectWebAuthn, WebAuthnPlatform};
pub use worker::{WorkerDisposition, WorkerEndpoint, WorkerRequestType, WorkerResponse};

/// Install the console logger and panic hook in the browser; native hosts
/// bring their own `log` backend.
pub fn init_logging() {
    #[cfg(target_arch = "wasm32")]
    {
        console_error_panic_hook::set_once();
        wasm_logger::init(wasm_logger::Config::new(config::CURRENT_LOG_LEVEL));
    }
    debug!(
        "Logging system initialized with level: {:?}",
        config::CURRENT_LOG_LEVEL
    );
}
