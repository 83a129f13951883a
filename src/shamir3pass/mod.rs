//! Shamir 3-pass Protocol Implementation
//!
//! This module implements the Shamir 3-pass protocol for commutative encryption,
//! allowing a client and the relay to cooperatively wrap a key-encryption-key
//! (KEK) without the relay ever seeing it unblinded.
//!
//! # Protocol Overview
//!
//! Registration:
//! 1. Client generates random KEK, encrypts VRF key
//! 2. Client adds temporary lock to KEK → KEK_c
//! 3. Server adds its lock → KEK_cs (tagged with the current keyId)
//! 4. Client removes its lock → KEK_s (stored with the keyId)
//!
//! Login:
//! 1. Client adds new temporary lock to KEK_s → KEK_st
//! 2. Server removes the lock named by keyId (current or grace) → KEK_t
//! 3. Client removes its lock → KEK (original)
//! 4. Client decrypts VRF key with KEK

pub mod client;
pub mod persistence;
pub mod primality;
pub mod server_keys;

#[cfg(test)]
mod tests_rotation;
#[cfg(test)]
mod tests_unit;

pub use client::KeyWrapClient;
pub use persistence::{
    FileGraceKeyStore, GraceKeyStore, MemoryGraceKeyStore, PersistedCurrentKey, PersistedGraceKey,
};
pub use server_keys::{
    GraceKey, GraceKeySet, RotationOptions, RotationOutcome, ServerKeySet, ServerKeypair,
    ShamirKeyWrapService,
};

use crate::config::{
    CHACHA20_NONCE_SIZE, SHAMIR_AEAD_HKDF_INFO, SHAMIR_MIN_PRIME_BITS, SHAMIR_PRIMALITY_ROUNDS,
    SHAMIR_RANDOM_BYTES_OVERHEAD, SHAMIR_REJECTION_SAMPLING_MAX_ATTEMPTS,
};
use crate::errors::{KeyWrapError, KeyWrapResult};
use crate::utils::{base64_url_decode, base64_url_encode, sha256};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, Key},
    ChaCha20Poly1305, KeyInit,
};
use getrandom::getrandom;
use hkdf::Hkdf;
use num_bigint::{BigInt, BigUint, Sign};
use num_integer::Integer;
use num_traits::{One, Zero};
use sha2::Sha256;

/// Big-endian bytes of the built-in 256-bit safe prime (`DEFAULT_SHAMIR_P_B64U`).
const DEFAULT_SHAMIR_P_BYTES: [u8; 32] = [
    0xdc, 0xde, 0x70, 0xe3, 0xa0, 0x08, 0x1a, 0x31, 0x93, 0xda, 0xfe, 0x55, 0xb9, 0xaf, 0xd3,
    0x30, 0x3e, 0x58, 0xc1, 0xf6, 0xbd, 0x53, 0x61, 0x7b, 0xf9, 0x6c, 0xd6, 0xf1, 0x23, 0x43,
    0xb0, 0x83,
];

/// Lock keys for adding/removing a lock
#[derive(Clone)]
pub struct ClientLockKeys {
    pub e: BigUint, // Encryption exponent (add lock)
    pub d: BigUint, // Decryption exponent (remove lock)
}

impl std::fmt::Debug for ClientLockKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ClientLockKeys([REDACTED])")
    }
}

/// Shamir 3-pass protocol over a validated safe prime
#[derive(Clone, Debug)]
pub struct Shamir3Pass {
    p: BigUint,
    p_minus_1: BigUint, // Cached for efficiency
    min_k: BigUint,     // Minimum value for k (security bound)
    max_k: BigUint,     // Maximum value for k (p-2)
}

impl Shamir3Pass {
    /// Create a new instance with the given prime p.
    ///
    /// Rejects primes under `SHAMIR_MIN_PRIME_BITS` and anything that is not a
    /// safe prime (`p` and `(p-1)/2` both prime). The check runs once here, not
    /// per lock operation.
    pub fn new(p_b64u: &str) -> KeyWrapResult<Self> {
        let p = decode_biguint_b64u(p_b64u).map_err(|_| {
            KeyWrapError::InvalidPrime("Invalid base64url encoding".to_string())
        })?;
        Self::new_with_biguint(p)
    }

    /// Instance over the built-in safe prime
    pub fn new_default() -> Self {
        Self::new_with_biguint_unchecked(BigUint::from_bytes_be(&DEFAULT_SHAMIR_P_BYTES))
    }

    pub(crate) fn new_with_biguint(p: BigUint) -> KeyWrapResult<Self> {
        let bits = p.bits() as usize;
        if bits < SHAMIR_MIN_PRIME_BITS {
            return Err(KeyWrapError::PrimeTooSmall {
                bits,
                min_bits: SHAMIR_MIN_PRIME_BITS,
            });
        }
        if !primality::is_safe_prime(&p, SHAMIR_PRIMALITY_ROUNDS) {
            return Err(KeyWrapError::InvalidPrime(
                "p is not a safe prime".to_string(),
            ));
        }
        Ok(Self::new_with_biguint_unchecked(p))
    }

    fn new_with_biguint_unchecked(p: BigUint) -> Self {
        let one = BigUint::one();
        let two = &one + &one;
        let p_minus_1 = &p - &one;
        let p_minus_2 = &p - &two;

        // Security bound: k should be at least 2^64 for large primes, 2^32 for the 256-bit default
        let min_k = if p.bits() >= 1024 {
            BigUint::from(1u128 << 64)
        } else {
            BigUint::from(1u64 << 32)
        };

        Shamir3Pass {
            p,
            p_minus_1,
            min_k,
            max_k: p_minus_2,
        }
    }

    pub fn p(&self) -> &BigUint {
        &self.p
    }

    pub fn p_minus_1(&self) -> &BigUint {
        &self.p_minus_1
    }

    pub fn p_b64u(&self) -> String {
        encode_biguint_b64u(&self.p)
    }

    pub fn modexp(&self, base: &BigUint, exp: &BigUint) -> BigUint {
        base.modpow(exp, &self.p)
    }

    /// Inverse of `a` modulo p-1, via the extended Euclidean algorithm
    pub fn modinv(&self, a: &BigUint) -> Option<BigUint> {
        let a_bigint = BigInt::from_biguint(Sign::Plus, a.clone());
        let m_bigint = BigInt::from_biguint(Sign::Plus, self.p_minus_1.clone());

        let (gcd, x, _) = extended_gcd(a_bigint, m_bigint.clone());
        if gcd != BigInt::one() {
            return None;
        }

        let mut x_mod = x % &m_bigint;
        if x_mod.sign() == Sign::Minus {
            x_mod += &m_bigint;
        }
        x_mod.to_biguint()
    }

    /// Generate random k in range [min_k, p-2] with gcd(k, p-1) = 1, by rejection sampling
    pub fn random_k(&self) -> KeyWrapResult<BigUint> {
        let range = &self.max_k - &self.min_k;
        let bytes_needed = ((range.bits() + 7) / 8 + SHAMIR_RANDOM_BYTES_OVERHEAD as u64) as usize;

        for _ in 0..SHAMIR_REJECTION_SAMPLING_MAX_ATTEMPTS {
            let mut buf = vec![0u8; bytes_needed];
            getrandom(&mut buf).map_err(|_| KeyWrapError::RandomGenerationFailed)?;

            let candidate = BigUint::from_bytes_be(&buf) % &range;
            let k = &self.min_k + candidate;

            if k.gcd(&self.p_minus_1) == BigUint::one() {
                return Ok(k);
            }
        }

        Err(KeyWrapError::RandomGenerationFailed)
    }

    /// Generate lock keys (e, d) where e*d ≡ 1 (mod p-1)
    pub fn generate_lock_keys(&self) -> KeyWrapResult<ClientLockKeys> {
        let e = self.random_k()?;
        let d = self
            .modinv(&e)
            .ok_or(KeyWrapError::ModularInverseNotFound)?;
        Ok(ClientLockKeys { e, d })
    }

    /// Encrypt data under a fresh random KEK; returns (ciphertext, kek)
    pub fn encrypt_with_random_kek_key(
        &self,
        plaintext: &[u8],
    ) -> KeyWrapResult<(Vec<u8>, BigUint)> {
        let kek = self.random_k()?;
        let ciphertext = self.encrypt_with_kek(&kek, plaintext)?;
        Ok((ciphertext, kek))
    }

    pub fn decrypt_with_key(&self, ciphertext: &[u8], kek: &BigUint) -> KeyWrapResult<Vec<u8>> {
        self.decrypt_with_kek(kek, ciphertext)
    }

    /// Add a lock: base^exponent mod p
    pub fn add_lock(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        self.modexp(base, exponent)
    }

    /// Remove a lock: base^exponent mod p (same operation with the inverse exponent)
    pub fn remove_lock(&self, base: &BigUint, exponent: &BigUint) -> BigUint {
        self.modexp(base, exponent)
    }

    /// A blinded value must be a non-zero residue mod p.
    pub fn check_residue(&self, value: &BigUint, field: &str) -> KeyWrapResult<()> {
        if value.is_zero() || value >= &self.p {
            return Err(KeyWrapError::Encoding(format!(
                "{} is out of range for p",
                field
            )));
        }
        Ok(())
    }

    fn derive_aead_key(&self, kek_bytes: &[u8]) -> KeyWrapResult<[u8; 32]> {
        let hkdf = Hkdf::<Sha256>::new(None, kek_bytes);
        let mut key = [0u8; 32];
        hkdf.expand(SHAMIR_AEAD_HKDF_INFO, &mut key)
            .map_err(|_| KeyWrapError::EncryptionFailed("HKDF expansion failed".to_string()))?;
        Ok(key)
    }

    fn encrypt_with_kek(&self, kek: &BigUint, plaintext: &[u8]) -> KeyWrapResult<Vec<u8>> {
        let key_bytes = self.derive_aead_key(&kek.to_bytes_be())?;
        let cipher = ChaCha20Poly1305::new(Key::<ChaCha20Poly1305>::from_slice(&key_bytes));

        let mut nonce = [0u8; CHACHA20_NONCE_SIZE];
        getrandom(&mut nonce).map_err(|_| KeyWrapError::RandomGenerationFailed)?;
        let nonce_ga = GenericArray::from_slice(&nonce);

        let ciphertext = cipher
            .encrypt(nonce_ga, plaintext)
            .map_err(|e| KeyWrapError::EncryptionFailed(e.to_string()))?;

        // Prepend nonce to ciphertext
        let mut result = nonce.to_vec();
        result.extend_from_slice(&ciphertext);
        Ok(result)
    }

    fn decrypt_with_kek(&self, kek: &BigUint, ciphertext: &[u8]) -> KeyWrapResult<Vec<u8>> {
        if ciphertext.len() < CHACHA20_NONCE_SIZE {
            return Err(KeyWrapError::DecryptionFailed(
                "Ciphertext too short".to_string(),
            ));
        }
        let (nonce_bytes, ct) = ciphertext.split_at(CHACHA20_NONCE_SIZE);

        let key_bytes = self.derive_aead_key(&kek.to_bytes_be())?;
        let cipher = ChaCha20Poly1305::new(Key::<ChaCha20Poly1305>::from_slice(&key_bytes));
        let nonce_ga = GenericArray::from_slice(nonce_bytes);

        cipher
            .decrypt(nonce_ga, ct)
            .map_err(|e| KeyWrapError::DecryptionFailed(e.to_string()))
    }
}

fn extended_gcd(a: BigInt, b: BigInt) -> (BigInt, BigInt, BigInt) {
    if b.is_zero() {
        return (a, BigInt::one(), BigInt::zero());
    }

    let (gcd, x1, y1) = extended_gcd(b.clone(), &a % &b);
    let x = y1.clone();
    let y = x1 - (&a / &b) * y1;

    (gcd, x, y)
}

/// Key id of a server exponent: base64url(SHA-256(e_s big-endian bytes))
pub fn key_id_for_exponent(e_s: &BigUint) -> String {
    base64_url_encode(&sha256(&e_s.to_bytes_be()))
}

pub fn encode_biguint_b64u(x: &BigUint) -> String {
    base64_url_encode(&x.to_bytes_be())
}

pub fn decode_biguint_b64u(s: &str) -> KeyWrapResult<BigUint> {
    let bytes = base64_url_decode(s).map_err(KeyWrapError::Encoding)?;
    Ok(BigUint::from_bytes_be(&bytes))
}

/// Decode a named base64url field, rejecting empty input
pub(crate) fn decode_field(value: &str, field: &str) -> KeyWrapResult<BigUint> {
    if value.trim().is_empty() {
        return Err(KeyWrapError::Encoding(format!("{} is empty", field)));
    }
    decode_biguint_b64u(value).map_err(|_| KeyWrapError::Encoding(format!("invalid {}", field)))
}
