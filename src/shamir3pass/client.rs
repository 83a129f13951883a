//! Client half of the key wrap: seals a VRF keypair under a random KEK and
//! blinds that KEK through the relay's server lock.

use log::{debug, info};
use zeroize::Zeroizing;

use super::{decode_field, encode_biguint_b64u, Shamir3Pass};
use crate::errors::{KeyWrapError, KeyWrapResult};
use crate::http::RelayClient;
use crate::types::http::{ShamirApplyServerLockHTTPRequest, ShamirRemoveServerLockHTTPRequest};
use crate::types::ServerEncryptedVrfKeypair;
use crate::utils::{base64_url_decode, base64_url_encode};

pub struct KeyWrapClient<'a, R: RelayClient> {
    shamir: &'a Shamir3Pass,
    relay: &'a R,
}

impl<'a, R: RelayClient> KeyWrapClient<'a, R> {
    pub fn new(shamir: &'a Shamir3Pass, relay: &'a R) -> Self {
        Self { shamir, relay }
    }

    /// Encrypt `keypair_bytes` under a fresh KEK and store only `KEK_s`.
    pub async fn wrap_vrf_keypair(
        &self,
        keypair_bytes: &[u8],
    ) -> KeyWrapResult<ServerEncryptedVrfKeypair> {
        let (ciphertext_vrf, kek) = self.shamir.encrypt_with_random_kek_key(keypair_bytes)?;

        // One-time client lock
        let client_keys = self.shamir.generate_lock_keys()?;
        let kek_c = self.shamir.add_lock(&kek, &client_keys.e);

        let resp = self
            .relay
            .apply_server_lock(ShamirApplyServerLockHTTPRequest {
                kek_c_b64u: encode_biguint_b64u(&kek_c),
            })
            .await?;
        let kek_cs = decode_field(&resp.kek_cs_b64u, "kek_cs_b64u")?;
        if resp.key_id.is_empty() {
            return Err(KeyWrapError::Relay(
                "apply-server-lock response is missing keyId".to_string(),
            ));
        }

        let kek_s = self.shamir.remove_lock(&kek_cs, &client_keys.d);
        info!("VRF keypair wrapped under server key {}", resp.key_id);

        Ok(ServerEncryptedVrfKeypair {
            ciphertext_vrf_b64u: base64_url_encode(&ciphertext_vrf),
            kek_s_b64u: encode_biguint_b64u(&kek_s),
            server_key_id: resp.key_id,
        })
    }

    /// Recover the VRF keypair bytes; the blob's key id selects the server key.
    pub async fn unwrap_vrf_keypair(
        &self,
        blob: &ServerEncryptedVrfKeypair,
    ) -> KeyWrapResult<Zeroizing<Vec<u8>>> {
        if blob.server_key_id.is_empty() {
            return Err(KeyWrapError::UnknownKeyId(String::new()));
        }
        let kek_s = decode_field(&blob.kek_s_b64u, "kek_s_b64u")?;
        let ciphertext_vrf =
            base64_url_decode(&blob.ciphertext_vrf_b64u).map_err(KeyWrapError::Encoding)?;

        let client_keys = self.shamir.generate_lock_keys()?;
        let kek_st = self.shamir.add_lock(&kek_s, &client_keys.e);

        let resp = self
            .relay
            .remove_server_lock(ShamirRemoveServerLockHTTPRequest {
                kek_cs_b64u: encode_biguint_b64u(&kek_st),
                key_id: blob.server_key_id.clone(),
            })
            .await?;
        let kek_t = decode_field(&resp.kek_c_b64u, "kek_c_b64u")?;
        let kek = self.shamir.remove_lock(&kek_t, &client_keys.d);

        let plaintext = self.shamir.decrypt_with_key(&ciphertext_vrf, &kek)?;
        debug!("VRF keypair unwrapped via server key {}", blob.server_key_id);
        Ok(Zeroizing::new(plaintext))
    }

    /// Whether the blob was wrapped under a key that is no longer current.
    pub async fn needs_refresh(&self, blob: &ServerEncryptedVrfKeypair) -> KeyWrapResult<bool> {
        let info = self.relay.key_info().await?;
        Ok(info.current_key_id != blob.server_key_id)
    }
}
