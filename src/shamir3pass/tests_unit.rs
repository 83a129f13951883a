//! Unit tests for Shamir 3-pass protocol

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::DEFAULT_SHAMIR_P_B64U;
    use num_bigint::BigUint;
    use num_traits::{One, Zero};

    // 2^255 + 95: prime, but (p-1)/2 is composite
    const NON_SAFE_PRIME_B64U: &str = "gAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAF8";
    // 2^255 + 3: composite
    const COMPOSITE_B64U: &str = "gAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAM";

    #[test]
    fn test_default_prime_matches_config() {
        let shamir = Shamir3Pass::new_default();
        assert_eq!(shamir.p_b64u(), DEFAULT_SHAMIR_P_B64U);
        assert_eq!(shamir.p().bits(), 256);
    }

    #[test]
    fn test_initialization_with_valid_safe_prime() {
        let shamir = Shamir3Pass::new(DEFAULT_SHAMIR_P_B64U).expect("default prime is safe");
        assert_eq!(shamir.p_b64u(), DEFAULT_SHAMIR_P_B64U);
    }

    #[test]
    fn test_rejects_prime_that_is_not_safe() {
        match Shamir3Pass::new(NON_SAFE_PRIME_B64U) {
            Err(KeyWrapError::InvalidPrime(_)) => (),
            other => panic!("expected InvalidPrime, got {:?}", other.map(|s| s.p_b64u())),
        }
    }

    #[test]
    fn test_rejects_composite() {
        assert!(matches!(
            Shamir3Pass::new(COMPOSITE_B64U),
            Err(KeyWrapError::InvalidPrime(_))
        ));
    }

    #[test]
    fn test_invalid_prime_size() {
        let small_prime = BigUint::from(65537u32);
        match Shamir3Pass::new_with_biguint(small_prime) {
            Err(KeyWrapError::PrimeTooSmall { bits, min_bits }) => {
                assert_eq!(bits, 17);
                assert_eq!(min_bits, 256);
            }
            _ => panic!("Expected PrimeTooSmall error"),
        }
    }

    #[test]
    fn test_invalid_base64_prime() {
        assert!(matches!(
            Shamir3Pass::new("not base64!!"),
            Err(KeyWrapError::InvalidPrime(_))
        ));
    }

    #[test]
    fn test_modular_inverse_properties() {
        let shamir = Shamir3Pass::new_default();
        for i in 2u32..40 {
            let a = BigUint::from(i);
            if a.gcd(shamir.p_minus_1()) != BigUint::one() {
                assert!(shamir.modinv(&a).is_none());
                continue;
            }
            let inv = shamir.modinv(&a).expect("Inverse should exist");
            let product = (&a * &inv) % shamir.p_minus_1();
            assert_eq!(product, BigUint::one(), "a * a^-1 ≡ 1 (mod p-1) failed for a={}", i);
        }
    }

    #[test]
    fn test_modular_exponentiation_edge_cases() {
        let shamir = Shamir3Pass::new_default();
        assert_eq!(shamir.modexp(&BigUint::zero(), &BigUint::from(5u32)), BigUint::zero());
        assert_eq!(shamir.modexp(&BigUint::from(5u32), &BigUint::zero()), BigUint::one());
        assert_eq!(shamir.modexp(&BigUint::one(), &BigUint::from(1000u32)), BigUint::one());
    }

    #[test]
    fn test_generate_lock_keys_validity() {
        let shamir = Shamir3Pass::new_default();
        for _ in 0..10 {
            let keys = shamir.generate_lock_keys().expect("Key generation failed");
            let product = (&keys.e * &keys.d) % shamir.p_minus_1();
            assert_eq!(product, BigUint::one());
            assert_eq!(keys.e.gcd(shamir.p_minus_1()), BigUint::one());
        }
    }

    #[test]
    fn test_random_k_in_range() {
        let shamir = Shamir3Pass::new_default();
        let values: Vec<BigUint> = (0..50).map(|_| shamir.random_k().unwrap()).collect();
        let unique = values.iter().collect::<std::collections::HashSet<_>>().len();
        assert_eq!(unique, values.len());
        for k in &values {
            assert!(k >= &shamir.min_k);
            assert!(k <= &shamir.max_k);
        }
    }

    #[test]
    fn test_kek_encryption_roundtrip() {
        let shamir = Shamir3Pass::new_default();
        let plaintext = b"test data for encryption";

        let (ciphertext, kek) = shamir.encrypt_with_random_kek_key(plaintext).unwrap();
        assert_eq!(ciphertext.len(), 12 + plaintext.len() + 16);
        let decrypted = shamir.decrypt_with_key(&ciphertext, &kek).unwrap();
        assert_eq!(decrypted, plaintext);

        let wrong = &kek + BigUint::one();
        assert!(matches!(
            shamir.decrypt_with_key(&ciphertext, &wrong),
            Err(KeyWrapError::DecryptionFailed(_))
        ));
        assert!(matches!(
            shamir.decrypt_with_key(&ciphertext[..5], &kek),
            Err(KeyWrapError::DecryptionFailed(_))
        ));
    }

    #[test]
    fn test_locks_commute() {
        let shamir = Shamir3Pass::new_default();
        let kek = shamir.random_k().unwrap();
        let client = shamir.generate_lock_keys().unwrap();
        let server = shamir.generate_lock_keys().unwrap();

        // Client lock, server lock, client unlock, server unlock
        let kek_c = shamir.add_lock(&kek, &client.e);
        let kek_cs = shamir.add_lock(&kek_c, &server.e);
        let kek_s = shamir.remove_lock(&kek_cs, &client.d);
        assert_eq!(kek_s, shamir.add_lock(&kek, &server.e));

        let kek_st = shamir.add_lock(&kek_s, &client.e);
        let kek_t = shamir.remove_lock(&kek_st, &server.d);
        let recovered = shamir.remove_lock(&kek_t, &client.d);
        assert_eq!(recovered, kek);
    }

    #[test]
    fn test_key_id_is_sha256_of_exponent() {
        let e = BigUint::from(0x010203u32);
        let expected = crate::utils::base64_url_encode(&crate::utils::sha256(&[1, 2, 3]));
        assert_eq!(key_id_for_exponent(&e), expected);
        assert_eq!(key_id_for_exponent(&e).len(), 43);
    }

    #[test]
    fn test_residue_check() {
        let shamir = Shamir3Pass::new_default();
        assert!(shamir.check_residue(&BigUint::zero(), "kek_c").is_err());
        assert!(shamir.check_residue(shamir.p(), "kek_c").is_err());
        assert!(shamir.check_residue(&BigUint::from(7u32), "kek_c").is_ok());
    }

    #[test]
    fn test_server_keypair_from_b64u_validates_pair() {
        let shamir = Shamir3Pass::new_default();
        let kp = ServerKeypair::generate(&shamir).unwrap();
        let parsed = ServerKeypair::from_b64u(&shamir, &kp.e_s_b64u(), &kp.d_s_b64u()).unwrap();
        assert_eq!(parsed, kp);

        let other = ServerKeypair::generate(&shamir).unwrap();
        assert!(matches!(
            ServerKeypair::from_b64u(&shamir, &kp.e_s_b64u(), &other.d_s_b64u()),
            Err(KeyWrapError::InvalidKeypair(_))
        ));
        assert!(matches!(
            ServerKeypair::from_b64u(&shamir, "", &kp.d_s_b64u()),
            Err(KeyWrapError::Encoding(_))
        ));
    }

    #[test]
    fn test_grace_key_without_public_exponent_recovers_key_id() {
        let shamir = Shamir3Pass::new_default();
        let kp = ServerKeypair::generate(&shamir).unwrap();
        let entry = PersistedGraceKey {
            e_s_b64u: None,
            d_s_b64u: kp.d_s_b64u(),
        };
        let grace = GraceKey::from_persisted(&shamir, &entry).unwrap();
        assert_eq!(grace.key_id, kp.key_id);
        assert_eq!(grace.e_s.as_ref(), Some(&kp.e_s));
    }

    #[test]
    fn test_grace_set_evicts_oldest_and_dedupes() {
        let shamir = Shamir3Pass::new_default();
        let keys: Vec<ServerKeypair> = (0..4)
            .map(|_| ServerKeypair::generate(&shamir).unwrap())
            .collect();
        let mut set = GraceKeySet::new(3);
        for kp in &keys {
            set.push(GraceKey::from(kp.clone()));
        }
        set.push(GraceKey::from(keys[3].clone()));

        assert_eq!(set.len(), 3);
        assert_eq!(
            set.key_ids(),
            keys[1..].iter().map(|k| k.key_id.clone()).collect::<Vec<_>>()
        );
        assert!(set.find(&keys[0].key_id).is_none());

        set.truncate(1);
        assert_eq!(set.key_ids(), vec![keys[3].key_id.clone()]);
    }
}
