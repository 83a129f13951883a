//! Relay-side key ring: the current server exponent pair plus a bounded set of
//! grace keys kept for unwrapping blobs sealed before a rotation.

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use log::{debug, info, warn};
use num_bigint::BigUint;
use num_traits::One;

use super::persistence::{FileGraceKeyStore, GraceKeyStore, PersistedCurrentKey, PersistedGraceKey};
use super::{decode_field, encode_biguint_b64u, key_id_for_exponent, Shamir3Pass};
use crate::config::ShamirServerConfig;
use crate::errors::{KeyWrapError, KeyWrapResult};

/// A server exponent pair with `e_s * d_s ≡ 1 (mod p-1)`.
#[derive(Clone, PartialEq, Eq)]
pub struct ServerKeypair {
    pub e_s: BigUint,
    pub d_s: BigUint,
    pub key_id: String,
}

impl std::fmt::Debug for ServerKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKeypair")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl ServerKeypair {
    pub fn generate(shamir: &Shamir3Pass) -> KeyWrapResult<Self> {
        let keys = shamir.generate_lock_keys()?;
        Ok(Self {
            key_id: key_id_for_exponent(&keys.e),
            e_s: keys.e,
            d_s: keys.d,
        })
    }

    /// Validate a configured exponent pair against `p`.
    pub fn from_b64u(shamir: &Shamir3Pass, e_s_b64u: &str, d_s_b64u: &str) -> KeyWrapResult<Self> {
        let e_s = decode_field(e_s_b64u, "e_s_b64u")?;
        let d_s = decode_field(d_s_b64u, "d_s_b64u")?;
        if (&e_s * &d_s) % shamir.p_minus_1() != BigUint::one() {
            return Err(KeyWrapError::InvalidKeypair(
                "e_s * d_s is not 1 mod p-1".to_string(),
            ));
        }
        Ok(Self {
            key_id: key_id_for_exponent(&e_s),
            e_s,
            d_s,
        })
    }

    pub fn e_s_b64u(&self) -> String {
        encode_biguint_b64u(&self.e_s)
    }

    pub fn d_s_b64u(&self) -> String {
        encode_biguint_b64u(&self.d_s)
    }

    pub fn to_persisted(&self) -> PersistedCurrentKey {
        PersistedCurrentKey {
            e_s_b64u: self.e_s_b64u(),
            d_s_b64u: self.d_s_b64u(),
        }
    }
}

/// A previously current key, usable only to remove a server lock.
#[derive(Clone, PartialEq, Eq)]
pub struct GraceKey {
    pub key_id: String,
    pub d_s: BigUint,
    /// Withheld for entries loaded without their public exponent
    pub e_s: Option<BigUint>,
}

impl std::fmt::Debug for GraceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraceKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

impl From<ServerKeypair> for GraceKey {
    fn from(kp: ServerKeypair) -> Self {
        GraceKey {
            key_id: kp.key_id,
            d_s: kp.d_s,
            e_s: Some(kp.e_s),
        }
    }
}

impl GraceKey {
    /// Rebuild a grace key from its persisted form. Without `e_s` the public
    /// exponent is recomputed as `d_s⁻¹ mod p-1` to recover the key id.
    pub fn from_persisted(shamir: &Shamir3Pass, entry: &PersistedGraceKey) -> KeyWrapResult<Self> {
        let d_s = decode_field(&entry.d_s_b64u, "d_s_b64u")?;
        let e_s = match entry.e_s_b64u.as_deref() {
            Some(e) => {
                let kp = ServerKeypair::from_b64u(shamir, e, &entry.d_s_b64u)?;
                kp.e_s
            }
            None => shamir
                .modinv(&d_s)
                .ok_or(KeyWrapError::ModularInverseNotFound)?,
        };
        Ok(GraceKey {
            key_id: key_id_for_exponent(&e_s),
            d_s,
            e_s: Some(e_s),
        })
    }

    pub fn to_persisted(&self) -> PersistedGraceKey {
        PersistedGraceKey {
            e_s_b64u: self.e_s.as_ref().map(encode_biguint_b64u),
            d_s_b64u: encode_biguint_b64u(&self.d_s),
        }
    }
}

/// Grace keys, oldest first, bounded by `max_entries`.
#[derive(Clone, Debug, Default)]
pub struct GraceKeySet {
    entries: VecDeque<GraceKey>,
    max_entries: usize,
}

impl GraceKeySet {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries,
        }
    }

    pub fn from_keys(keys: Vec<GraceKey>, max_entries: usize) -> Self {
        let mut set = Self::new(max_entries);
        for key in keys {
            set.push(key);
        }
        set
    }

    /// Append a key and evict the oldest entries beyond the bound.
    pub fn push(&mut self, key: GraceKey) {
        if self.entries.iter().any(|k| k.key_id == key.key_id) {
            return;
        }
        self.entries.push_back(key);
        self.truncate(self.max_entries);
    }

    pub fn truncate(&mut self, max_entries: usize) {
        self.max_entries = max_entries;
        while self.entries.len() > max_entries {
            if let Some(evicted) = self.entries.pop_front() {
                debug!("Evicting grace key {}", evicted.key_id);
            }
        }
    }

    pub fn find(&self, key_id: &str) -> Option<&GraceKey> {
        self.entries.iter().find(|k| k.key_id == key_id)
    }

    pub fn key_ids(&self) -> Vec<String> {
        self.entries.iter().map(|k| k.key_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn to_persisted(&self) -> Vec<PersistedGraceKey> {
        self.entries.iter().map(GraceKey::to_persisted).collect()
    }
}

/// Immutable snapshot of the key ring. Rotation builds a new snapshot and
/// swaps it in, so readers always see one consistent set.
#[derive(Clone, Debug)]
pub struct ServerKeySet {
    pub current: ServerKeypair,
    pub grace: GraceKeySet,
}

impl ServerKeySet {
    /// Lock `kek_c` with the current exponent; grace keys are never used here.
    pub fn apply_server_lock(&self, shamir: &Shamir3Pass, kek_c: &BigUint) -> (BigUint, String) {
        (
            shamir.add_lock(kek_c, &self.current.e_s),
            self.current.key_id.clone(),
        )
    }

    /// Remove the lock named by `key_id`: current key first, then grace keys.
    pub fn remove_server_lock(
        &self,
        shamir: &Shamir3Pass,
        kek_cs: &BigUint,
        key_id: &str,
    ) -> KeyWrapResult<BigUint> {
        let d_s = if self.current.key_id == key_id {
            &self.current.d_s
        } else if let Some(grace) = self.grace.find(key_id) {
            &grace.d_s
        } else {
            return Err(KeyWrapError::UnknownKeyId(key_id.to_string()));
        };
        Ok(shamir.remove_lock(kek_cs, d_s))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RotationOptions {
    pub keep_current_in_grace: bool,
    pub max_grace_entries: usize,
}

/// Result of a rotation. With a store configured the new pair is already
/// persisted; otherwise it lives only in memory.
#[derive(Clone, Debug)]
pub struct RotationOutcome {
    pub previous_key_id: String,
    pub current: ServerKeypair,
    pub grace_key_ids: Vec<String>,
}

/// Owns the relay's key ring. Lock operations read a snapshot; `rotate` is the
/// single writer.
pub struct ShamirKeyWrapService {
    shamir: Shamir3Pass,
    keys: RwLock<Arc<ServerKeySet>>,
    store: Option<Box<dyn GraceKeyStore + Send + Sync>>,
}

impl ShamirKeyWrapService {
    pub fn new(
        shamir: Shamir3Pass,
        current: ServerKeypair,
        grace: GraceKeySet,
        store: Option<Box<dyn GraceKeyStore + Send + Sync>>,
    ) -> Self {
        Self {
            shamir,
            keys: RwLock::new(Arc::new(ServerKeySet { current, grace })),
            store,
        }
    }

    /// Build the service from environment-style configuration.
    ///
    /// A current pair persisted by an earlier rotation wins over the
    /// configured exponents. Without either an ephemeral pair is generated;
    /// blobs wrapped under it do not survive a restart.
    pub fn from_config(config: &ShamirServerConfig) -> KeyWrapResult<Self> {
        let shamir = Shamir3Pass::new(config.p_b64u_or_default())?;
        let store: Option<Box<dyn GraceKeyStore + Send + Sync>> = config
            .grace_keys_file
            .as_ref()
            .map(|path| Box::new(FileGraceKeyStore::new(path)) as Box<dyn GraceKeyStore + Send + Sync>);

        let rotated = match &store {
            Some(store) => store.load_current()?,
            None => None,
        };
        let current = match (rotated, &config.e_s_b64u, &config.d_s_b64u) {
            (Some(saved), _, _) => {
                let kp = ServerKeypair::from_b64u(&shamir, &saved.e_s_b64u, &saved.d_s_b64u)?;
                info!("Using Shamir server key {} from the last rotation", kp.key_id);
                kp
            }
            (None, Some(e), Some(d)) => ServerKeypair::from_b64u(&shamir, e, d)?,
            _ => {
                warn!("No Shamir server exponents configured; generating an ephemeral keypair");
                ServerKeypair::generate(&shamir)?
            }
        };

        let max = config.max_grace_keys_or_default();
        let mut grace_keys = Vec::new();
        if let Some(store) = &store {
            for entry in store.load()? {
                let key = GraceKey::from_persisted(&shamir, &entry)?;
                if key.key_id == current.key_id {
                    continue;
                }
                grace_keys.push(key);
            }
        }
        let grace = GraceKeySet::from_keys(grace_keys, max);
        info!(
            "Shamir key-wrap service ready: current key {}, {} grace keys",
            current.key_id,
            grace.len()
        );
        Ok(Self::new(shamir, current, grace, store))
    }

    pub fn shamir(&self) -> &Shamir3Pass {
        &self.shamir
    }

    /// Consistent snapshot of the key ring.
    pub fn snapshot(&self) -> Arc<ServerKeySet> {
        let guard = self.keys.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&guard)
    }

    pub fn current_key_id(&self) -> String {
        self.snapshot().current.key_id.clone()
    }

    pub fn grace_key_ids(&self) -> Vec<String> {
        self.snapshot().grace.key_ids()
    }

    pub fn apply_server_lock(&self, kek_c: &BigUint) -> KeyWrapResult<(BigUint, String)> {
        self.shamir.check_residue(kek_c, "kek_c")?;
        Ok(self.snapshot().apply_server_lock(&self.shamir, kek_c))
    }

    pub fn remove_server_lock(&self, kek_cs: &BigUint, key_id: &str) -> KeyWrapResult<BigUint> {
        self.shamir.check_residue(kek_cs, "kek_cs")?;
        self.snapshot()
            .remove_server_lock(&self.shamir, kek_cs, key_id)
    }

    /// Replace the current key with a fresh one.
    ///
    /// `expected_current_key_id`, when given, must still name the current key
    /// or the rotation fails with `RotationConflict` and nothing changes. The
    /// new grace set and current pair are persisted before they become visible.
    pub fn rotate(
        &self,
        expected_current_key_id: Option<&str>,
        options: RotationOptions,
    ) -> KeyWrapResult<RotationOutcome> {
        let fresh = ServerKeypair::generate(&self.shamir)?;

        let mut guard = self.keys.write().unwrap_or_else(|e| e.into_inner());
        let previous = Arc::clone(&guard);
        if let Some(expected) = expected_current_key_id {
            if expected != previous.current.key_id {
                return Err(KeyWrapError::RotationConflict {
                    expected: expected.to_string(),
                    found: previous.current.key_id.clone(),
                });
            }
        }

        let mut grace = previous.grace.clone();
        grace.truncate(options.max_grace_entries);
        if options.keep_current_in_grace {
            grace.push(GraceKey::from(previous.current.clone()));
        }

        if let Some(store) = &self.store {
            store.save(&grace.to_persisted())?;
            store.save_current(&fresh.to_persisted())?;
        }

        let next = ServerKeySet {
            current: fresh.clone(),
            grace,
        };
        let outcome = RotationOutcome {
            previous_key_id: previous.current.key_id.clone(),
            current: fresh,
            grace_key_ids: next.grace.key_ids(),
        };
        *guard = Arc::new(next);

        info!(
            "Rotated Shamir server key {} -> {} ({} grace keys)",
            outcome.previous_key_id,
            outcome.current.key_id,
            outcome.grace_key_ids.len()
        );
        Ok(outcome)
    }

    /// Rotate against whatever key is current, with the configured grace bound.
    pub fn rotate_current(&self, keep_current_in_grace: bool) -> KeyWrapResult<RotationOutcome> {
        let max_grace_entries = self.snapshot().grace.max_entries();
        self.rotate(
            None,
            RotationOptions {
                keep_current_in_grace,
                max_grace_entries,
            },
        )
    }
}
