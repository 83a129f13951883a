use std::cell::RefCell;

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use log::{debug, info};
use serde_json::Value;
use zeroize::Zeroizing;

use crate::config::vrf_challenge_fields as fields;
use crate::config::*;
use crate::crypto::{hkdf_expand, VrfCryptoModule};
use crate::errors::{CeremonyErrorKind, ChallengeValidationError, DerivationError, VrfResult};
use crate::types::*;
use crate::utils::{base64_url_decode, base64_url_encode, now_ms, random_bytes, sha256};
use crate::webauthn::CredentialCeremony;

/// Size of the random stand-in for a VRF output
const RANDOM_CHALLENGE_SIZE: usize = 64;

// === VRF SESSION ===

#[derive(Default)]
struct VrfSession {
    keypair: Option<VrfKeypairMaterial>,
    started_at_ms: u64,
}

// === VRF / CREDENTIAL DERIVATION SERVICE ===

/// Builds and validates VRF challenges, drives credential requests, derives
/// PRF key material, and holds the unlocked VRF keypair for one wallet context.
pub struct VrfCredentialService<C: VrfCryptoModule> {
    crypto: C,
    session: RefCell<VrfSession>,
}

impl<C: VrfCryptoModule> VrfCredentialService<C> {
    pub fn new(crypto: C) -> Self {
        Self {
            crypto,
            session: RefCell::new(VrfSession::default()),
        }
    }

    pub fn crypto(&self) -> &C {
        &self.crypto
    }

    // === CHALLENGES ===

    /// Random challenge for ceremonies that are never verified on chain.
    pub fn build_challenge(&self, account_id: &str, rp_id: &str) -> VrfResult<VrfChallenge> {
        let vrf_output = random_bytes::<RANDOM_CHALLENGE_SIZE>()
            .map_err(DerivationError::VrfCrypto)?
            .to_vec();
        debug!("Built random challenge for {} on {}", account_id, rp_id);
        Ok(VrfChallenge::Random(RandomVrfChallenge { vrf_output }))
    }

    /// Verifiable challenge from the unlocked VRF keypair.
    pub fn build_verifiable_challenge(&self, input: &VrfInputData) -> VrfResult<VrfChallenge> {
        let session = self.session.borrow();
        let keypair = session.keypair.as_ref().ok_or(DerivationError::VrfNotUnlocked)?;
        self.build_verifiable_challenge_with(keypair, input)
    }

    pub fn build_verifiable_challenge_with(
        &self,
        keypair: &VrfKeypairMaterial,
        input: &VrfInputData,
    ) -> VrfResult<VrfChallenge> {
        let challenge = self.crypto.derive_vrf_challenge(keypair, input)?;
        Ok(VrfChallenge::Verifiable(challenge))
    }

    /// Parse challenge JSON; every one of the eight fields must be present.
    pub fn validate_challenge(
        &self,
        data: &Value,
    ) -> Result<VerifiableVrfChallenge, ChallengeValidationError> {
        let obj = data.as_object().ok_or_else(|| {
            ChallengeValidationError::MalformedChallenge("challenge must be a JSON object".to_string())
        })?;

        let text = |field: &str| -> Result<String, ChallengeValidationError> {
            match obj.get(field) {
                None | Some(Value::Null) => {
                    Err(ChallengeValidationError::MissingField(field.to_string()))
                }
                Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
                Some(Value::String(_)) => Err(invalid(field, "must not be empty")),
                Some(_) => Err(invalid(field, "must be a string")),
            }
        };
        let bytes = |field: &str| -> Result<Vec<u8>, ChallengeValidationError> {
            let raw = text(field)?;
            base64_url_decode(&raw).map_err(|_| invalid(field, "must be base64url"))
        };

        let vrf_input = bytes(fields::VRF_INPUT)?;
        let vrf_output = bytes(fields::VRF_OUTPUT)?;
        let vrf_proof = bytes(fields::VRF_PROOF)?;
        let vrf_public_key = bytes(fields::VRF_PUBLIC_KEY)?;
        let user_id = text(fields::USER_ID)?;
        let rp_id = text(fields::RP_ID)?;
        let block_height = match obj.get(fields::BLOCK_HEIGHT) {
            Some(Value::Number(n)) if n.is_u64() => n.to_string(),
            Some(Value::Number(_)) => {
                return Err(invalid(fields::BLOCK_HEIGHT, "must be a non-negative integer"))
            }
            _ => text(fields::BLOCK_HEIGHT)?,
        };
        if block_height.parse::<u64>().is_err() {
            return Err(invalid(fields::BLOCK_HEIGHT, "must be an integer"));
        }
        let block_hash = bytes(fields::BLOCK_HASH)?;

        if vrf_output.len() < WEBAUTHN_CHALLENGE_SIZE {
            return Err(invalid(fields::VRF_OUTPUT, "shorter than a WebAuthn challenge"));
        }

        Ok(VerifiableVrfChallenge {
            vrf_input,
            vrf_output,
            vrf_proof,
            vrf_public_key,
            user_id,
            rp_id,
            block_height,
            block_hash,
        })
    }

    /// Check a challenge on a verification path: random challenges are refused
    /// outright, verifiable ones must carry a valid proof.
    pub fn verify_challenge(&self, challenge: &VrfChallenge) -> Result<(), CeremonyErrorKind> {
        let verifiable = challenge.as_verifiable()?;
        if !self.crypto.verify_vrf_proof(verifiable)? {
            return Err(ChallengeValidationError::ProofRejected.into());
        }
        Ok(())
    }

    // === CREDENTIALS ===

    /// PRF salts from fixed per-purpose prefixes and the account id.
    pub fn derive_salts(&self, account_id: &str) -> PrfSalts {
        PrfSalts {
            encryption_salt: sha256(format!("{}{}", ENCRYPTION_SALT_PREFIX, account_id).as_bytes())
                .to_vec(),
            signing_salt: sha256(format!("{}{}", SIGNING_SALT_PREFIX, account_id).as_bytes())
                .to_vec(),
        }
    }

    pub fn creation_options(
        &self,
        account_id: &str,
        rp_id: &str,
        challenge: &VrfChallenge,
    ) -> CredentialCreationOptions {
        CredentialCreationOptions {
            rp_id: rp_id.to_string(),
            user_id: account_id.to_string(),
            user_name: account_id.to_string(),
            challenge: challenge.webauthn_challenge().to_vec(),
            prf: self.derive_salts(account_id),
            exclude_credentials: Vec::new(),
        }
    }

    pub fn request_options(
        &self,
        account_id: &str,
        rp_id: &str,
        challenge: &VrfChallenge,
        allow_credentials: Vec<AllowCredential>,
    ) -> CredentialRequestOptions {
        CredentialRequestOptions {
            rp_id: rp_id.to_string(),
            challenge: challenge.webauthn_challenge().to_vec(),
            allow_credentials,
            prf: self.derive_salts(account_id),
            user_verification: "preferred".to_string(),
        }
    }

    /// Run a create or get ceremony with the challenge's first 32 bytes and the
    /// account's PRF salts. Rejections arrive already classified.
    pub async fn request_credential<W: CredentialCeremony>(
        &self,
        ceremony: &W,
        kind: CeremonyKind,
        account_id: &str,
        rp_id: &str,
        challenge: &VrfChallenge,
        allow_credentials: Vec<AllowCredential>,
    ) -> Result<WebAuthnCredential, CeremonyErrorKind> {
        let options = match kind {
            CeremonyKind::Create => {
                CeremonyOptions::Create(self.creation_options(account_id, rp_id, challenge))
            }
            CeremonyKind::Get => CeremonyOptions::Get(self.request_options(
                account_id,
                rp_id,
                challenge,
                allow_credentials,
            )),
        };
        let credential = ceremony.perform(&options).await?;
        credential.prf_outputs()?;
        Ok(credential)
    }

    pub fn derive_keys(
        &self,
        credential: &WebAuthnCredential,
        account_id: &str,
    ) -> Result<DerivedKeys, CeremonyErrorKind> {
        let prf = credential.prf_outputs()?;
        Ok(self
            .crypto
            .derive_keys_from_prf(&prf, &self.derive_salts(account_id))?)
    }

    // === VRF KEYPAIRS ===
    //
    // These return the keypair to the caller and leave the in-memory session
    // alone; ceremonies hold their keypair locally until login completes.

    /// Fresh random keypair for a registration challenge.
    pub fn new_bootstrap_keypair(&self) -> VrfResult<VrfKeypairMaterial> {
        self.crypto.generate_vrf_keypair()
    }

    /// Deterministic keypair from PRF.second and the account id.
    pub fn derive_keypair(
        &self,
        prf: &PrfOutputs,
        account_id: &str,
    ) -> VrfResult<VrfKeypairMaterial> {
        self.crypto.derive_vrf_keypair_from_seed(&prf.second, account_id)
    }

    /// Encrypt a keypair under PRF.first for storage at rest.
    pub fn seal_keypair(
        &self,
        keypair: &VrfKeypairMaterial,
        prf_first: &[u8],
    ) -> VrfResult<EncryptedVrfKeypair> {
        encrypt_keypair(keypair, prf_first)
    }

    /// Decrypt a PRF-encrypted keypair.
    pub fn open_keypair(
        &self,
        encrypted: &EncryptedVrfKeypair,
        prf_first: &[u8],
        expected_public_key: Option<&str>,
    ) -> VrfResult<VrfKeypairMaterial> {
        let plaintext = decrypt_keypair(encrypted, prf_first)?;
        self.parse_keypair(&plaintext, expected_public_key)
    }

    /// Parse serialized keypair data, e.g. from the Shamir unwrap.
    pub fn parse_keypair(
        &self,
        keypair_data: &[u8],
        expected_public_key: Option<&str>,
    ) -> VrfResult<VrfKeypairMaterial> {
        let data: VrfKeypairData = bincode::deserialize(keypair_data)?;
        let keypair_bytes = Zeroizing::new(data.keypair_bytes);
        if let Some(expected) = expected_public_key {
            if expected != data.public_key_base64 {
                return Err(DerivationError::public_key_mismatch(
                    expected,
                    &data.public_key_base64,
                ));
            }
        }
        let public_key =
            base64_url_decode(&data.public_key_base64).map_err(DerivationError::Serialization)?;
        Ok(VrfKeypairMaterial {
            keypair_bytes,
            public_key,
        })
    }

    /// Serialized keypair, for sealing under the Shamir key wrap.
    pub fn keypair_bytes(&self, keypair: &VrfKeypairMaterial) -> VrfResult<Zeroizing<Vec<u8>>> {
        keypair_data_bytes(keypair)
    }

    // === VRF KEYPAIR SESSION ===

    /// Hold `keypair` in memory as the unlocked session keypair.
    pub fn install_keypair(&self, keypair: VrfKeypairMaterial) -> String {
        let public_key = base64_url_encode(&keypair.public_key);
        self.store_keypair(keypair);
        public_key
    }

    /// Fresh random keypair held in memory for the registration challenge.
    pub fn generate_bootstrap_keypair(&self) -> VrfResult<String> {
        Ok(self.install_keypair(self.new_bootstrap_keypair()?))
    }

    /// Deterministic keypair from PRF.second; encrypted under PRF.first.
    pub fn derive_deterministic_keypair(
        &self,
        prf: &PrfOutputs,
        account_id: &str,
        save_in_memory: bool,
    ) -> VrfResult<(String, EncryptedVrfKeypair)> {
        let keypair = self.derive_keypair(prf, account_id)?;
        let public_key = base64_url_encode(&keypair.public_key);
        let encrypted = encrypt_keypair(&keypair, &prf.first)?;
        if save_in_memory {
            self.store_keypair(keypair);
        }
        Ok((public_key, encrypted))
    }

    /// Serialized in-memory keypair, for sealing under the Shamir key wrap.
    pub fn current_keypair_bytes(&self) -> VrfResult<Zeroizing<Vec<u8>>> {
        let session = self.session.borrow();
        let keypair = session.keypair.as_ref().ok_or(DerivationError::NoVrfKeypair)?;
        keypair_data_bytes(keypair)
    }

    pub fn current_public_key(&self) -> Option<String> {
        self.session
            .borrow()
            .keypair
            .as_ref()
            .map(|kp| base64_url_encode(&kp.public_key))
    }

    /// Decrypt a PRF-encrypted keypair and hold it in memory.
    pub fn unlock_with_prf(
        &self,
        encrypted: &EncryptedVrfKeypair,
        prf_first: &[u8],
        expected_public_key: Option<&str>,
    ) -> VrfResult<String> {
        let keypair = self.open_keypair(encrypted, prf_first, expected_public_key)?;
        Ok(self.install_keypair(keypair))
    }

    /// Hold a keypair recovered via the Shamir unwrap.
    pub fn load_plaintext_keypair(
        &self,
        keypair_data: &[u8],
        expected_public_key: Option<&str>,
    ) -> VrfResult<String> {
        let keypair = self.parse_keypair(keypair_data, expected_public_key)?;
        Ok(self.install_keypair(keypair))
    }

    pub fn vrf_status(&self) -> VrfStatus {
        let session = self.session.borrow();
        let active = session.keypair.is_some();
        VrfStatus {
            active,
            session_duration_ms: if active {
                now_ms().saturating_sub(session.started_at_ms)
            } else {
                0
            },
        }
    }

    /// Drop the in-memory keypair (zeroized on drop).
    pub fn logout(&self) {
        let mut session = self.session.borrow_mut();
        if session.keypair.take().is_some() {
            debug!("VRF keypair cleared with zeroization");
        }
        session.started_at_ms = 0;
    }

    fn store_keypair(&self, keypair: VrfKeypairMaterial) {
        let mut session = self.session.borrow_mut();
        if session.keypair.replace(keypair).is_some() {
            debug!("Replacing VRF keypair held in memory");
        }
        session.started_at_ms = now_ms();
        info!("VRF keypair stored in memory");
    }
}

fn invalid(field: &str, reason: &str) -> ChallengeValidationError {
    ChallengeValidationError::InvalidField {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// === PRF ENCRYPTION OF VRF KEYPAIRS ===

fn keypair_data_bytes(keypair: &VrfKeypairMaterial) -> VrfResult<Zeroizing<Vec<u8>>> {
    let data = VrfKeypairData {
        keypair_bytes: keypair.keypair_bytes.to_vec(),
        public_key_base64: base64_url_encode(&keypair.public_key),
    };
    let bytes = bincode::serialize(&data)?;
    drop(Zeroizing::new(data.keypair_bytes));
    Ok(Zeroizing::new(bytes))
}

fn prf_cipher(prf_first: &[u8]) -> VrfResult<ChaCha20Poly1305> {
    let key = hkdf_expand::<CHACHA20_KEY_SIZE>(None, prf_first, HKDF_CHACHA20_KEY_INFO)?;
    Ok(ChaCha20Poly1305::new(chacha20poly1305::Key::from_slice(&key[..])))
}

fn encrypt_keypair(keypair: &VrfKeypairMaterial, prf_first: &[u8]) -> VrfResult<EncryptedVrfKeypair> {
    let data = keypair_data_bytes(keypair)?;
    let cipher = prf_cipher(prf_first)?;

    let nonce_bytes =
        random_bytes::<CHACHA20_NONCE_SIZE>().map_err(DerivationError::Aead)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), data.as_slice())
        .map_err(|e| DerivationError::Aead(e.to_string()))?;

    Ok(EncryptedVrfKeypair {
        encrypted_vrf_data_b64u: base64_url_encode(&ciphertext),
        chacha20_nonce_b64u: base64_url_encode(&nonce_bytes),
    })
}

fn decrypt_keypair(
    encrypted: &EncryptedVrfKeypair,
    prf_first: &[u8],
) -> VrfResult<Zeroizing<Vec<u8>>> {
    let ciphertext = base64_url_decode(&encrypted.encrypted_vrf_data_b64u)
        .map_err(DerivationError::Serialization)?;
    let nonce = base64_url_decode(&encrypted.chacha20_nonce_b64u)
        .map_err(DerivationError::Serialization)?;
    if nonce.len() != CHACHA20_NONCE_SIZE {
        return Err(DerivationError::InvalidIvLength {
            expected: CHACHA20_NONCE_SIZE,
            actual: nonce.len(),
        });
    }
    let cipher = prf_cipher(prf_first)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map(Zeroizing::new)
        .map_err(|e| DerivationError::Aead(e.to_string()))
}
