//! Phase enums, one per ceremony, in declared order.

use serde::{Deserialize, Serialize};

use super::CeremonyPhase;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RegistrationPhase {
    WebauthnVerification,
    KeyGeneration,
    AccessKeyAddition,
    AccountVerification,
    DatabaseStorage,
    ContractRegistration,
    RegistrationComplete,
    RegistrationError,
}

impl CeremonyPhase for RegistrationPhase {
    const CEREMONY: &'static str = "registration";
    const COMPLETE: Self = RegistrationPhase::RegistrationComplete;

    fn ordinal(self) -> u8 {
        match self {
            RegistrationPhase::WebauthnVerification => 1,
            RegistrationPhase::KeyGeneration => 2,
            RegistrationPhase::AccessKeyAddition => 3,
            RegistrationPhase::AccountVerification => 4,
            RegistrationPhase::DatabaseStorage => 5,
            RegistrationPhase::ContractRegistration => 6,
            RegistrationPhase::RegistrationComplete => 7,
            RegistrationPhase::RegistrationError => u8::MAX,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RegistrationPhase::WebauthnVerification => "WEBAUTHN_VERIFICATION",
            RegistrationPhase::KeyGeneration => "KEY_GENERATION",
            RegistrationPhase::AccessKeyAddition => "ACCESS_KEY_ADDITION",
            RegistrationPhase::AccountVerification => "ACCOUNT_VERIFICATION",
            RegistrationPhase::DatabaseStorage => "DATABASE_STORAGE",
            RegistrationPhase::ContractRegistration => "CONTRACT_REGISTRATION",
            RegistrationPhase::RegistrationComplete => "REGISTRATION_COMPLETE",
            RegistrationPhase::RegistrationError => "REGISTRATION_ERROR",
        }
    }

    fn is_error(self) -> bool {
        self == RegistrationPhase::RegistrationError
    }

    fn error_phase(_during: Option<Self>) -> Self {
        RegistrationPhase::RegistrationError
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoginPhase {
    Preparation,
    WebauthnAssertion,
    VrfUnlock,
    LoginComplete,
    LoginError,
}

impl CeremonyPhase for LoginPhase {
    const CEREMONY: &'static str = "login";
    const COMPLETE: Self = LoginPhase::LoginComplete;

    fn ordinal(self) -> u8 {
        match self {
            LoginPhase::Preparation => 1,
            LoginPhase::WebauthnAssertion => 2,
            LoginPhase::VrfUnlock => 3,
            LoginPhase::LoginComplete => 4,
            LoginPhase::LoginError => u8::MAX,
        }
    }

    fn name(self) -> &'static str {
        match self {
            LoginPhase::Preparation => "PREPARATION",
            LoginPhase::WebauthnAssertion => "WEBAUTHN_ASSERTION",
            LoginPhase::VrfUnlock => "VRF_UNLOCK",
            LoginPhase::LoginComplete => "LOGIN_COMPLETE",
            LoginPhase::LoginError => "LOGIN_ERROR",
        }
    }

    fn is_error(self) -> bool {
        self == LoginPhase::LoginError
    }

    fn error_phase(_during: Option<Self>) -> Self {
        LoginPhase::LoginError
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPhase {
    Preparation,
    WebauthnAuthentication,
    SyncAuthenticatorsOnchain,
    AuthenticatorSaved,
    RecoveryComplete,
    RecoveryError,
}

impl CeremonyPhase for RecoveryPhase {
    const CEREMONY: &'static str = "account_recovery";
    const COMPLETE: Self = RecoveryPhase::RecoveryComplete;

    fn ordinal(self) -> u8 {
        match self {
            RecoveryPhase::Preparation => 1,
            RecoveryPhase::WebauthnAuthentication => 2,
            RecoveryPhase::SyncAuthenticatorsOnchain => 3,
            RecoveryPhase::AuthenticatorSaved => 4,
            RecoveryPhase::RecoveryComplete => 5,
            RecoveryPhase::RecoveryError => u8::MAX,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RecoveryPhase::Preparation => "PREPARATION",
            RecoveryPhase::WebauthnAuthentication => "WEBAUTHN_AUTHENTICATION",
            RecoveryPhase::SyncAuthenticatorsOnchain => "SYNC_AUTHENTICATORS_ONCHAIN",
            RecoveryPhase::AuthenticatorSaved => "AUTHENTICATOR_SAVED",
            RecoveryPhase::RecoveryComplete => "RECOVERY_COMPLETE",
            RecoveryPhase::RecoveryError => "RECOVERY_ERROR",
        }
    }

    fn is_error(self) -> bool {
        self == RecoveryPhase::RecoveryError
    }

    fn error_phase(_during: Option<Self>) -> Self {
        RecoveryPhase::RecoveryError
    }
}

/// Shared by both linking roles: device 2 shows the QR code and registers,
/// device 1 scans it and authorizes.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceLinkingPhase {
    Idle,
    QrCodeGenerated,
    Scanning,
    Authorization,
    Polling,
    AddkeyDetected,
    Registration,
    LinkingComplete,
    AutoLogin,
    RegistrationError,
    LoginError,
    DeviceLinkingError,
}

impl CeremonyPhase for DeviceLinkingPhase {
    const CEREMONY: &'static str = "device_linking";
    const COMPLETE: Self = DeviceLinkingPhase::LinkingComplete;

    fn ordinal(self) -> u8 {
        match self {
            DeviceLinkingPhase::Idle => 0,
            DeviceLinkingPhase::QrCodeGenerated => 1,
            DeviceLinkingPhase::Scanning => 2,
            DeviceLinkingPhase::Authorization => 3,
            DeviceLinkingPhase::Polling => 4,
            DeviceLinkingPhase::AddkeyDetected => 5,
            DeviceLinkingPhase::Registration => 6,
            DeviceLinkingPhase::LinkingComplete => 7,
            DeviceLinkingPhase::AutoLogin => 8,
            DeviceLinkingPhase::RegistrationError
            | DeviceLinkingPhase::LoginError
            | DeviceLinkingPhase::DeviceLinkingError => u8::MAX,
        }
    }

    fn name(self) -> &'static str {
        match self {
            DeviceLinkingPhase::Idle => "IDLE",
            DeviceLinkingPhase::QrCodeGenerated => "QR_CODE_GENERATED",
            DeviceLinkingPhase::Scanning => "SCANNING",
            DeviceLinkingPhase::Authorization => "AUTHORIZATION",
            DeviceLinkingPhase::Polling => "POLLING",
            DeviceLinkingPhase::AddkeyDetected => "ADDKEY_DETECTED",
            DeviceLinkingPhase::Registration => "REGISTRATION",
            DeviceLinkingPhase::LinkingComplete => "LINKING_COMPLETE",
            DeviceLinkingPhase::AutoLogin => "AUTO_LOGIN",
            DeviceLinkingPhase::RegistrationError => "REGISTRATION_ERROR",
            DeviceLinkingPhase::LoginError => "LOGIN_ERROR",
            DeviceLinkingPhase::DeviceLinkingError => "DEVICE_LINKING_ERROR",
        }
    }

    fn is_error(self) -> bool {
        matches!(
            self,
            DeviceLinkingPhase::RegistrationError
                | DeviceLinkingPhase::LoginError
                | DeviceLinkingPhase::DeviceLinkingError
        )
    }

    fn error_phase(during: Option<Self>) -> Self {
        match during {
            Some(DeviceLinkingPhase::Registration) => DeviceLinkingPhase::RegistrationError,
            Some(DeviceLinkingPhase::AutoLogin) => DeviceLinkingPhase::LoginError,
            _ => DeviceLinkingPhase::DeviceLinkingError,
        }
    }
}
