//! Relay-side Shamir 3-pass handlers: HTTP bodies in, HTTP bodies out.

use std::sync::Arc;

use log::{debug, warn};

use crate::errors::{KeyWrapError, KeyWrapResult};
use crate::shamir3pass::{
    decode_field, encode_biguint_b64u, RotationOptions, ServerKeypair, ShamirKeyWrapService,
};
use crate::types::http::{
    RelayErrorBody, ShamirApplyServerLockHTTPRequest, ShamirApplyServerLockHTTPResponse,
    ShamirKeyInfoHTTPResponse, ShamirRemoveServerLockHTTPRequest,
    ShamirRemoveServerLockHTTPResponse, ShamirRotateHTTPRequest, ShamirRotateHTTPResponse,
    ShamirServerKeypairHTTPResponse,
};

#[derive(Clone)]
pub struct RelayKeyWrapHandlers {
    service: Arc<ShamirKeyWrapService>,
}

impl RelayKeyWrapHandlers {
    pub fn new(service: Arc<ShamirKeyWrapService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &ShamirKeyWrapService {
        &self.service
    }

    pub fn apply_server_lock(
        &self,
        payload: ShamirApplyServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirApplyServerLockHTTPResponse> {
        let kek_c = decode_field(&payload.kek_c_b64u, "kek_c_b64u")?;
        let (kek_cs, key_id) = self.service.apply_server_lock(&kek_c)?;
        debug!("apply-server-lock with key {}", key_id);
        Ok(ShamirApplyServerLockHTTPResponse {
            kek_cs_b64u: encode_biguint_b64u(&kek_cs),
            key_id,
        })
    }

    pub fn remove_server_lock(
        &self,
        payload: ShamirRemoveServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirRemoveServerLockHTTPResponse> {
        if payload.key_id.trim().is_empty() {
            return Err(KeyWrapError::UnknownKeyId(String::new()));
        }
        let kek_cs = decode_field(&payload.kek_cs_b64u, "kek_cs_b64u")?;
        let kek_c = self
            .service
            .remove_server_lock(&kek_cs, &payload.key_id)
            .inspect_err(|e| warn!("remove-server-lock rejected: {}", e))?;
        Ok(ShamirRemoveServerLockHTTPResponse {
            kek_c_b64u: encode_biguint_b64u(&kek_c),
        })
    }

    pub fn key_info(&self) -> ShamirKeyInfoHTTPResponse {
        let snapshot = self.service.snapshot();
        ShamirKeyInfoHTTPResponse {
            current_key_id: snapshot.current.key_id.clone(),
            p_b64u: self.service.shamir().p_b64u(),
            grace_key_ids: snapshot.grace.key_ids(),
        }
    }

    /// Fresh exponent pair over the configured prime, for operators
    /// provisioning `SHAMIR_E_S_B64U`/`SHAMIR_D_S_B64U`. Does not touch the ring.
    pub fn generate_server_keypair(&self) -> KeyWrapResult<ShamirServerKeypairHTTPResponse> {
        let kp = ServerKeypair::generate(self.service.shamir())?;
        Ok(ShamirServerKeypairHTTPResponse {
            e_s_b64u: kp.e_s_b64u(),
            d_s_b64u: kp.d_s_b64u(),
            key_id: kp.key_id,
        })
    }

    pub fn rotate(&self, payload: ShamirRotateHTTPRequest) -> KeyWrapResult<ShamirRotateHTTPResponse> {
        let max_grace_entries = payload
            .max_grace_entries
            .unwrap_or_else(|| self.service.snapshot().grace.max_entries());
        let outcome = self.service.rotate(
            payload.expected_current_key_id.as_deref(),
            RotationOptions {
                keep_current_in_grace: payload.keep_current_in_grace,
                max_grace_entries,
            },
        )?;
        Ok(ShamirRotateHTTPResponse {
            new_key_id: outcome.current.key_id.clone(),
            previous_key_id: outcome.previous_key_id,
            grace_key_ids: outcome.grace_key_ids,
            e_s_b64u: outcome.current.e_s_b64u(),
        })
    }
}

/// HTTP status and body for a handler error.
pub fn error_response(err: &KeyWrapError) -> (u16, RelayErrorBody) {
    let (status, code) = match err {
        KeyWrapError::UnknownKeyId(_) => (400, "UnknownKeyId"),
        KeyWrapError::Encoding(_) => (400, "InvalidEncoding"),
        KeyWrapError::RotationConflict { .. } => (409, "RotationConflict"),
        _ => (500, "KeyWrapError"),
    };
    (
        status,
        RelayErrorBody {
            error: err.to_string(),
            code: code.to_string(),
        },
    )
}
