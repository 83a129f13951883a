//! Key ring rotation tests for the relay-side key-wrap service

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::config::{env_keys, ShamirServerConfig};
    use crate::handlers::{error_response, RelayKeyWrapHandlers};
    use crate::types::http::{
        ShamirApplyServerLockHTTPRequest, ShamirRemoveServerLockHTTPRequest,
        ShamirRotateHTTPRequest,
    };
    use num_bigint::BigUint;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn service_with_store(store: Arc<MemoryGraceKeyStore>) -> ShamirKeyWrapService {
        let shamir = Shamir3Pass::new_default();
        let current = ServerKeypair::generate(&shamir).unwrap();
        ShamirKeyWrapService::new(shamir, current, GraceKeySet::new(5), Some(Box::new(store)))
    }

    fn service() -> ShamirKeyWrapService {
        service_with_store(Arc::new(MemoryGraceKeyStore::default()))
    }

    fn opts(keep: bool, max: usize) -> RotationOptions {
        RotationOptions {
            keep_current_in_grace: keep,
            max_grace_entries: max,
        }
    }

    /// Client-side view of one wrap: returns (kek, kek_s, keyId)
    fn wrap(svc: &ShamirKeyWrapService) -> (BigUint, BigUint, String) {
        let shamir = svc.shamir();
        let kek = shamir.random_k().unwrap();
        let client = shamir.generate_lock_keys().unwrap();
        let kek_c = shamir.add_lock(&kek, &client.e);
        let (kek_cs, key_id) = svc.apply_server_lock(&kek_c).unwrap();
        (kek, shamir.remove_lock(&kek_cs, &client.d), key_id)
    }

    fn unwrap(svc: &ShamirKeyWrapService, kek_s: &BigUint, key_id: &str) -> Result<BigUint, KeyWrapError> {
        let shamir = svc.shamir();
        let client = shamir.generate_lock_keys().unwrap();
        let kek_st = shamir.add_lock(kek_s, &client.e);
        let kek_t = svc.remove_server_lock(&kek_st, key_id)?;
        Ok(shamir.remove_lock(&kek_t, &client.d))
    }

    #[test]
    fn round_trip_under_current_key() {
        let svc = service();
        let kek = svc.shamir().random_k().unwrap();
        let (kek_cs, key_id) = svc.apply_server_lock(&kek).unwrap();
        assert_eq!(key_id, svc.current_key_id());
        assert_eq!(svc.remove_server_lock(&kek_cs, &key_id).unwrap(), kek);
    }

    #[test]
    fn apply_always_reports_current_key() {
        let svc = service();
        for _ in 0..3 {
            let (_, _, key_id) = wrap(&svc);
            assert_eq!(key_id, svc.current_key_id());
            assert!(!svc.grace_key_ids().contains(&key_id));
            svc.rotate(None, opts(true, 5)).unwrap();
        }
        assert_eq!(svc.grace_key_ids().len(), 3);
        let (_, _, key_id) = wrap(&svc);
        assert_eq!(key_id, svc.current_key_id());
    }

    #[test]
    fn remove_accepts_grace_key_after_rotation() {
        let svc = service();
        let (kek, kek_s, key_id) = wrap(&svc);
        let outcome = svc.rotate(None, opts(true, 5)).unwrap();
        assert_eq!(outcome.previous_key_id, key_id);
        assert_ne!(outcome.current.key_id, key_id);
        assert_eq!(unwrap(&svc, &kek_s, &key_id).unwrap(), kek);
    }

    #[test]
    fn unknown_key_id_is_rejected() {
        let svc = service();
        let (_, kek_s, _) = wrap(&svc);
        match unwrap(&svc, &kek_s, "bm90LWEta2V5") {
            Err(KeyWrapError::UnknownKeyId(id)) => assert_eq!(id, "bm90LWEta2V5"),
            other => panic!("expected UnknownKeyId, got {:?}", other),
        }
    }

    #[test]
    fn six_rotations_keep_five_grace_keys_oldest_evicted() {
        let store = Arc::new(MemoryGraceKeyStore::default());
        let svc = service_with_store(store.clone());
        let (_, oldest_kek_s, oldest_key_id) = wrap(&svc);

        let mut previous_ids = Vec::new();
        for _ in 0..6 {
            let outcome = svc.rotate(None, opts(true, 5)).unwrap();
            previous_ids.push(outcome.previous_key_id);
        }

        let grace = svc.grace_key_ids();
        assert_eq!(grace.len(), 5);
        assert_eq!(grace, previous_ids[1..].to_vec());
        assert!(!grace.contains(&oldest_key_id));
        assert!(matches!(
            unwrap(&svc, &oldest_kek_s, &oldest_key_id),
            Err(KeyWrapError::UnknownKeyId(_))
        ));

        // Persisted oldest first, in the same order
        let shamir = svc.shamir();
        let persisted: Vec<String> = store
            .entries()
            .iter()
            .map(|e| GraceKey::from_persisted(shamir, e).unwrap().key_id)
            .collect();
        assert_eq!(persisted, grace);
    }

    #[test]
    fn rotate_without_keeping_current_drops_previous_key() {
        let svc = service();
        let (_, kek_s, key_id) = wrap(&svc);
        let outcome = svc.rotate(None, opts(false, 5)).unwrap();
        assert_eq!(outcome.previous_key_id, key_id);
        assert!(outcome.grace_key_ids.is_empty());
        assert!(matches!(
            unwrap(&svc, &kek_s, &key_id),
            Err(KeyWrapError::UnknownKeyId(_))
        ));
    }

    #[test]
    fn key_from_two_rotations_ago_never_kept_is_unknown() {
        let svc = service();
        let (_, kek_s, key_id) = wrap(&svc);
        svc.rotate(None, opts(false, 5)).unwrap();
        svc.rotate(None, opts(true, 5)).unwrap();
        assert_eq!(svc.grace_key_ids().len(), 1);
        assert!(matches!(
            unwrap(&svc, &kek_s, &key_id),
            Err(KeyWrapError::UnknownKeyId(_))
        ));
    }

    #[test]
    fn rotation_conflict_leaves_ring_unchanged() {
        let svc = service();
        let before = svc.current_key_id();
        let err = svc.rotate(Some("stale"), opts(true, 5)).unwrap_err();
        assert_eq!(
            err,
            KeyWrapError::RotationConflict {
                expected: "stale".to_string(),
                found: before.clone(),
            }
        );
        assert_eq!(svc.current_key_id(), before);
        assert!(svc.grace_key_ids().is_empty());

        svc.rotate(Some(&before), opts(true, 5)).unwrap();
        assert_ne!(svc.current_key_id(), before);
    }

    #[test]
    fn readers_never_observe_half_applied_rotation() {
        let svc = Arc::new(service());
        let (kek, kek_s, key_id) = wrap(&svc);

        let writer = {
            let svc = Arc::clone(&svc);
            std::thread::spawn(move || {
                for _ in 0..20 {
                    svc.rotate(None, opts(true, 50)).unwrap();
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let svc = Arc::clone(&svc);
                let kek = kek.clone();
                let kek_s = kek_s.clone();
                let key_id = key_id.clone();
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let snapshot = svc.snapshot();
                        // The current key of a snapshot is never also in its grace set
                        assert!(snapshot.grace.find(&snapshot.current.key_id).is_none());
                        assert_eq!(unwrap(&svc, &kek_s, &key_id).unwrap(), kek);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(svc.grace_key_ids().len(), 20);
    }

    #[test]
    fn from_config_loads_exponents_and_grace_file() {
        let shamir = Shamir3Pass::new_default();
        let current = ServerKeypair::generate(&shamir).unwrap();
        let old = ServerKeypair::generate(&shamir).unwrap();

        let dir = std::env::temp_dir().join(format!("grace-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("grace.json");
        let file_store = FileGraceKeyStore::new(&path);
        file_store
            .save(&[PersistedGraceKey {
                e_s_b64u: None,
                d_s_b64u: old.d_s_b64u(),
            }])
            .unwrap();

        let mut env = HashMap::new();
        env.insert(env_keys::SHAMIR_E_S_B64U, current.e_s_b64u());
        env.insert(env_keys::SHAMIR_D_S_B64U, current.d_s_b64u());
        env.insert(env_keys::SHAMIR_GRACE_KEYS_FILE, path.display().to_string());
        env.insert(env_keys::SHAMIR_MAX_GRACE_KEYS, "2".to_string());
        let config = ShamirServerConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        let svc = ShamirKeyWrapService::from_config(&config).unwrap();
        assert_eq!(svc.current_key_id(), current.key_id);
        assert_eq!(svc.grace_key_ids(), vec![old.key_id.clone()]);

        // Rotation rewrites the file: bounded at 2, oldest first
        svc.rotate_current(true).unwrap();
        svc.rotate_current(true).unwrap();
        let reloaded = FileGraceKeyStore::new(&path).load().unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(
            GraceKey::from_persisted(&shamir, &reloaded[0]).unwrap().key_id,
            current.key_id
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rotated_key_survives_a_restart() {
        let shamir = Shamir3Pass::new_default();
        let configured = ServerKeypair::generate(&shamir).unwrap();
        let dir = std::env::temp_dir().join(format!("grace-keys-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("grace.json");

        let mut env = HashMap::new();
        env.insert(env_keys::SHAMIR_E_S_B64U, configured.e_s_b64u());
        env.insert(env_keys::SHAMIR_D_S_B64U, configured.d_s_b64u());
        env.insert(env_keys::SHAMIR_GRACE_KEYS_FILE, path.display().to_string());
        let config = ShamirServerConfig::from_lookup(|k| env.get(k).cloned()).unwrap();

        let svc = ShamirKeyWrapService::from_config(&config).unwrap();
        let rotated = svc.rotate_current(true).unwrap();
        let (kek, kek_s, key_id) = wrap(&svc);
        assert_eq!(key_id, rotated.current.key_id);
        drop(svc);

        // Same environment, so only the store knows about the rotation
        let restarted = ShamirKeyWrapService::from_config(&config).unwrap();
        assert_eq!(restarted.current_key_id(), rotated.current.key_id);
        assert_eq!(restarted.grace_key_ids(), vec![configured.key_id.clone()]);
        assert_eq!(unwrap(&restarted, &kek_s, &key_id).unwrap(), kek);

        let saved = FileGraceKeyStore::new(&path).load_current().unwrap().unwrap();
        assert_eq!(saved, rotated.current.to_persisted());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn rotate_response_withholds_the_private_exponent() {
        let store = Arc::new(MemoryGraceKeyStore::default());
        let handlers = RelayKeyWrapHandlers::new(Arc::new(service_with_store(store.clone())));

        let rotated = handlers
            .rotate(ShamirRotateHTTPRequest {
                expected_current_key_id: None,
                keep_current_in_grace: true,
                max_grace_entries: None,
            })
            .unwrap();

        let body = serde_json::to_value(&rotated).unwrap();
        assert!(body.get("d_s_b64u").is_none());
        assert_eq!(body["newKeyId"], rotated.new_key_id.as_str());
        let saved = store.current().unwrap();
        assert_eq!(saved.e_s_b64u, rotated.e_s_b64u);
        let shamir = handlers.service().shamir();
        let kp = ServerKeypair::from_b64u(shamir, &saved.e_s_b64u, &saved.d_s_b64u).unwrap();
        assert_eq!(kp.key_id, rotated.new_key_id);
    }

    #[test]
    fn file_store_missing_file_is_empty() {
        let path = std::env::temp_dir().join(format!("missing-{}.json", uuid::Uuid::new_v4()));
        assert!(FileGraceKeyStore::new(path).load().unwrap().is_empty());
    }

    #[test]
    fn handlers_map_http_bodies() {
        let handlers = RelayKeyWrapHandlers::new(Arc::new(service()));
        let shamir = handlers.service().shamir().clone();
        let kek = shamir.random_k().unwrap();

        let applied = handlers
            .apply_server_lock(ShamirApplyServerLockHTTPRequest {
                kek_c_b64u: encode_biguint_b64u(&kek),
            })
            .unwrap();
        let info = handlers.key_info();
        assert_eq!(applied.key_id, info.current_key_id);
        assert_eq!(info.p_b64u, shamir.p_b64u());

        let removed = handlers
            .remove_server_lock(ShamirRemoveServerLockHTTPRequest {
                kek_cs_b64u: applied.kek_cs_b64u.clone(),
                key_id: applied.key_id.clone(),
            })
            .unwrap();
        assert_eq!(decode_biguint_b64u(&removed.kek_c_b64u).unwrap(), kek);

        let rotated = handlers
            .rotate(ShamirRotateHTTPRequest {
                expected_current_key_id: Some(applied.key_id.clone()),
                keep_current_in_grace: true,
                max_grace_entries: None,
            })
            .unwrap();
        assert_eq!(rotated.previous_key_id, applied.key_id);
        assert_eq!(handlers.key_info().grace_key_ids, vec![applied.key_id.clone()]);

        let err = handlers
            .remove_server_lock(ShamirRemoveServerLockHTTPRequest {
                kek_cs_b64u: applied.kek_cs_b64u,
                key_id: String::new(),
            })
            .unwrap_err();
        let (status, body) = error_response(&err);
        assert_eq!(status, 400);
        assert_eq!(body.code, "UnknownKeyId");

        let err = handlers
            .apply_server_lock(ShamirApplyServerLockHTTPRequest {
                kek_c_b64u: "***".to_string(),
            })
            .unwrap_err();
        assert!(matches!(err, KeyWrapError::Encoding(_)));
    }

    #[test]
    fn generated_server_keypair_is_valid_and_not_installed() {
        let handlers = RelayKeyWrapHandlers::new(Arc::new(service()));
        let kp = handlers.generate_server_keypair().unwrap();
        let parsed =
            ServerKeypair::from_b64u(handlers.service().shamir(), &kp.e_s_b64u, &kp.d_s_b64u)
                .unwrap();
        assert_eq!(parsed.key_id, kp.key_id);
        assert_ne!(handlers.key_info().current_key_id, kp.key_id);
    }
}
