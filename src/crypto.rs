//! VRF and PRF key-derivation primitives behind the `VrfCryptoModule` seam.
//!
//! `EcvrfCryptoModule` is the production module (vrf-wasm ECVRF, HKDF-SHA256,
//! Ed25519). Keypairs cross the seam as opaque bincode bytes so callers never
//! hold curve types directly.

use hkdf::Hkdf;
use log::debug;
use rand_core::SeedableRng;
use sha2::{Digest, Sha256};
use vrf_wasm::ecvrf::{ECVRFKeyPair, ECVRFProof, ECVRFPublicKey};
use vrf_wasm::traits::WasmRngFromSeed;
use vrf_wasm::vrf::{VRFKeyPair, VRFProof};
use zeroize::Zeroizing;

use crate::config::{
    CHACHA20_KEY_SIZE, ED25519_HKDF_KEY_INFO, HKDF_CHACHA20_KEY_INFO, HKDF_VRF_KEYPAIR_INFO,
    VRF_DOMAIN_SEPARATOR, VRF_SEED_SIZE,
};
use crate::errors::{DerivationError, VrfResult};
use crate::types::{
    DerivedKeys, PrfOutputs, PrfSalts, VerifiableVrfChallenge, VrfInputData, VrfKeypairMaterial,
};
use crate::utils::{near_public_key_string, parse_block_height};

/// Cryptographic operations the derivation service delegates.
pub trait VrfCryptoModule {
    fn generate_vrf_keypair(&self) -> VrfResult<VrfKeypairMaterial>;

    /// Deterministic keypair from PRF.second, reproducible on any device holding the passkey.
    fn derive_vrf_keypair_from_seed(
        &self,
        prf_second: &[u8],
        account_id: &str,
    ) -> VrfResult<VrfKeypairMaterial>;

    fn derive_vrf_challenge(
        &self,
        keypair: &VrfKeypairMaterial,
        input: &VrfInputData,
    ) -> VrfResult<VerifiableVrfChallenge>;

    fn verify_vrf_proof(&self, challenge: &VerifiableVrfChallenge) -> VrfResult<bool>;

    fn derive_keys_from_prf(&self, prf: &PrfOutputs, salts: &PrfSalts) -> VrfResult<DerivedKeys>;
}

/// VRF input: sha256(domain ‖ user_id ‖ rp_id ‖ height_le ‖ block_hash)
pub fn vrf_input_bytes(input: &VrfInputData) -> VrfResult<(Vec<u8>, Vec<u8>)> {
    let block_height = parse_block_height(&input.block_height)?;
    let block_hash = bs58::decode(&input.block_hash)
        .into_vec()
        .map_err(|e| DerivationError::Serialization(format!("invalid blockHash: {}", e)))?;

    let mut data = Vec::new();
    data.extend_from_slice(VRF_DOMAIN_SEPARATOR);
    data.extend_from_slice(input.user_id.as_bytes());
    data.extend_from_slice(input.rp_id.as_bytes());
    data.extend_from_slice(&block_height.to_le_bytes());
    data.extend_from_slice(&block_hash);

    Ok((Sha256::digest(&data).to_vec(), block_hash))
}

/// HKDF-SHA256 expand into a fixed-size key
pub fn hkdf_expand<const N: usize>(
    salt: Option<&[u8]>,
    ikm: &[u8],
    info: &[u8],
) -> VrfResult<Zeroizing<[u8; N]>> {
    if ikm.is_empty() {
        return Err(DerivationError::empty_prf_output());
    }
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    let mut okm = Zeroizing::new([0u8; N]);
    hk.expand(info, &mut okm[..])
        .map_err(|e| DerivationError::Hkdf(e.to_string()))?;
    Ok(okm)
}

#[derive(Default, Clone, Copy)]
pub struct EcvrfCryptoModule;

impl EcvrfCryptoModule {
    pub fn new() -> Self {
        Self
    }

    fn to_material(keypair: &ECVRFKeyPair) -> VrfResult<VrfKeypairMaterial> {
        Ok(VrfKeypairMaterial {
            keypair_bytes: Zeroizing::new(bincode::serialize(keypair)?),
            public_key: bincode::serialize(&keypair.pk)?,
        })
    }
}

impl VrfCryptoModule for EcvrfCryptoModule {
    fn generate_vrf_keypair(&self) -> VrfResult<VrfKeypairMaterial> {
        debug!("Generating VRF keypair with secure randomness");
        let mut rng = WasmRngFromSeed::from_entropy();
        let keypair = ECVRFKeyPair::generate(&mut rng);
        Self::to_material(&keypair)
    }

    fn derive_vrf_keypair_from_seed(
        &self,
        prf_second: &[u8],
        account_id: &str,
    ) -> VrfResult<VrfKeypairMaterial> {
        debug!("Generating deterministic VRF keypair for account: {}", account_id);
        let seed = hkdf_expand::<VRF_SEED_SIZE>(
            Some(account_id.as_bytes()),
            prf_second,
            HKDF_VRF_KEYPAIR_INFO,
        )?;
        let mut rng = WasmRngFromSeed::from_seed(*seed);
        let keypair = ECVRFKeyPair::generate(&mut rng);
        Self::to_material(&keypair)
    }

    fn derive_vrf_challenge(
        &self,
        keypair: &VrfKeypairMaterial,
        input: &VrfInputData,
    ) -> VrfResult<VerifiableVrfChallenge> {
        let vrf_keypair: ECVRFKeyPair = bincode::deserialize(&keypair.keypair_bytes)?;
        let (vrf_input, block_hash) = vrf_input_bytes(input)?;

        let proof = vrf_keypair.prove(&vrf_input);
        let vrf_output = proof.to_hash().to_vec();

        Ok(VerifiableVrfChallenge {
            vrf_input,
            vrf_output,
            vrf_proof: bincode::serialize(&proof)?,
            vrf_public_key: bincode::serialize(&vrf_keypair.pk)?,
            user_id: input.user_id.clone(),
            rp_id: input.rp_id.clone(),
            block_height: input.block_height.clone(),
            block_hash,
        })
    }

    fn verify_vrf_proof(&self, challenge: &VerifiableVrfChallenge) -> VrfResult<bool> {
        let proof: ECVRFProof = bincode::deserialize(&challenge.vrf_proof)?;
        let public_key: ECVRFPublicKey = bincode::deserialize(&challenge.vrf_public_key)?;
        if proof.verify(&challenge.vrf_input, &public_key).is_err() {
            return Ok(false);
        }
        Ok(proof.to_hash().as_slice() == challenge.vrf_output.as_slice())
    }

    fn derive_keys_from_prf(&self, prf: &PrfOutputs, salts: &PrfSalts) -> VrfResult<DerivedKeys> {
        let encryption_key = hkdf_expand::<CHACHA20_KEY_SIZE>(
            Some(salts.encryption_salt.as_slice()),
            &prf.first,
            HKDF_CHACHA20_KEY_INFO,
        )?;
        let signing_key = hkdf_expand::<32>(
            Some(salts.signing_salt.as_slice()),
            &prf.second,
            ED25519_HKDF_KEY_INFO,
        )?;
        let verifying_key = ed25519_dalek::SigningKey::from_bytes(&signing_key).verifying_key();

        Ok(DerivedKeys {
            encryption_key,
            signing_key,
            near_public_key: near_public_key_string(verifying_key.as_bytes()),
        })
    }
}
