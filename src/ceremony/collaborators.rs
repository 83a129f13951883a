//! External collaborators the ceremonies talk to: the NEAR chain and local
//! wallet storage.

use std::cell::RefCell;
use std::collections::HashMap;

use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::types::{BlockInfo, StoredAuthenticator, UserRecord, VrfChallengeData, WebAuthnCredential};

/// Registration material a linked device submits with its key swap.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    /// Credential with PRF outputs stripped
    pub credential: WebAuthnCredential,
    pub vrf_data: VrfChallengeData,
    pub deterministic_vrf_public_key: String,
    pub new_public_key: String,
}

/// NEAR RPC and contract calls. Transaction signing happens behind this
/// trait; callers hand over the signing key for the call.
#[allow(async_fn_in_trait)]
pub trait NearChainClient {
    async fn latest_block(&self) -> Result<BlockInfo, String>;

    async fn has_access_key(&self, account_id: &str, public_key: &str) -> Result<bool, String>;

    /// Authenticators registered for `account_id` in the contract.
    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String>;

    /// Account holding `public_key` as an access key, if any.
    async fn account_for_public_key(&self, public_key: &str) -> Result<Option<String>, String>;

    /// Device 1: add the new device's temporary key to `account_id`.
    async fn add_device_key(
        &self,
        account_id: &str,
        signer: &SigningKey,
        device_public_key: &str,
    ) -> Result<String, String>;

    /// Device 2: replace the temporary key with the passkey-derived key and
    /// register the new authenticator.
    async fn swap_device_key(
        &self,
        account_id: &str,
        temp_signer: &SigningKey,
        registration: &DeviceRegistration,
    ) -> Result<String, String>;
}

/// Local persistence of user records and authenticators (IndexedDB in the browser).
#[allow(async_fn_in_trait)]
pub trait WalletStore {
    async fn get_user(&self, account_id: &str) -> Result<Option<UserRecord>, String>;

    async fn put_user(&self, record: &UserRecord) -> Result<(), String>;

    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String>;

    /// Replace the stored authenticators of `account_id`.
    async fn put_authenticators(
        &self,
        account_id: &str,
        authenticators: &[StoredAuthenticator],
    ) -> Result<(), String>;
}

#[derive(Default)]
pub struct MemoryWalletStore {
    users: RefCell<HashMap<String, UserRecord>>,
    authenticators: RefCell<HashMap<String, Vec<StoredAuthenticator>>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn user(&self, account_id: &str) -> Option<UserRecord> {
        self.users.borrow().get(account_id).cloned()
    }

    pub fn account_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.users.borrow().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl WalletStore for MemoryWalletStore {
    async fn get_user(&self, account_id: &str) -> Result<Option<UserRecord>, String> {
        Ok(self.user(account_id))
    }

    async fn put_user(&self, record: &UserRecord) -> Result<(), String> {
        self.users
            .borrow_mut()
            .insert(record.near_account_id.clone(), record.clone());
        Ok(())
    }

    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String> {
        Ok(self
            .authenticators
            .borrow()
            .get(account_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn put_authenticators(
        &self,
        account_id: &str,
        authenticators: &[StoredAuthenticator],
    ) -> Result<(), String> {
        self.authenticators
            .borrow_mut()
            .insert(account_id.to_string(), authenticators.to_vec());
        Ok(())
    }
}

impl<T: WalletStore> WalletStore for std::rc::Rc<T> {
    async fn get_user(&self, account_id: &str) -> Result<Option<UserRecord>, String> {
        (**self).get_user(account_id).await
    }

    async fn put_user(&self, record: &UserRecord) -> Result<(), String> {
        (**self).put_user(record).await
    }

    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String> {
        (**self).authenticators(account_id).await
    }

    async fn put_authenticators(
        &self,
        account_id: &str,
        authenticators: &[StoredAuthenticator],
    ) -> Result<(), String> {
        (**self).put_authenticators(account_id, authenticators).await
    }
}

impl<T: NearChainClient> NearChainClient for std::rc::Rc<T> {
    async fn latest_block(&self) -> Result<BlockInfo, String> {
        (**self).latest_block().await
    }

    async fn has_access_key(&self, account_id: &str, public_key: &str) -> Result<bool, String> {
        (**self).has_access_key(account_id, public_key).await
    }

    async fn authenticators(&self, account_id: &str) -> Result<Vec<StoredAuthenticator>, String> {
        (**self).authenticators(account_id).await
    }

    async fn account_for_public_key(&self, public_key: &str) -> Result<Option<String>, String> {
        (**self).account_for_public_key(public_key).await
    }

    async fn add_device_key(
        &self,
        account_id: &str,
        signer: &SigningKey,
        device_public_key: &str,
    ) -> Result<String, String> {
        (**self)
            .add_device_key(account_id, signer, device_public_key)
            .await
    }

    async fn swap_device_key(
        &self,
        account_id: &str,
        temp_signer: &SigningKey,
        registration: &DeviceRegistration,
    ) -> Result<String, String> {
        (**self)
            .swap_device_key(account_id, temp_signer, registration)
            .await
    }
}
