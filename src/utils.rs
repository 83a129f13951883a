use std::future::Future;
use std::time::Duration;

use crate::errors::DerivationError;
use base64ct::{Base64UrlUnpadded, Encoding};
use getrandom::getrandom;
use sha2::{Digest, Sha256};
#[cfg(target_arch = "wasm32")]
use wasm_bindgen::{closure::Closure, JsCast, JsValue};

// === BASE64 UTILITIES ===

/// Base64 URL encode bytes
pub fn base64_url_encode(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

/// Base64 URL decode string
pub fn base64_url_decode(s: &str) -> Result<Vec<u8>, String> {
    Base64UrlUnpadded::decode_vec(s).map_err(|e| format!("Base64 decode error: {}", e))
}

pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

pub fn random_bytes<const N: usize>() -> Result<[u8; N], String> {
    let mut bytes = [0u8; N];
    getrandom(&mut bytes).map_err(|e| format!("Secure random generation failed: {}", e))?;
    Ok(bytes)
}

pub fn parse_block_height(block_height: &str) -> Result<u64, DerivationError> {
    block_height
        .parse()
        .map_err(|_| DerivationError::BlockHeight(block_height.to_string()))
}

/// Milliseconds since the Unix epoch.
#[cfg(target_arch = "wasm32")]
pub fn now_ms() -> u64 {
    js_sys::Date::now() as u64
}

#[cfg(not(target_arch = "wasm32"))]
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// === TIMERS ===

/// Wait for `duration`. Uses `setTimeout` in the browser, where no Tokio
/// timer driver runs.
#[cfg(target_arch = "wasm32")]
pub async fn sleep(duration: Duration) {
    let ms = u32::try_from(duration.as_millis()).unwrap_or(u32::MAX);
    let _ = wasm_bindgen_futures::JsFuture::from(timeout_promise(ms)).await;
}

#[cfg(not(target_arch = "wasm32"))]
pub async fn sleep(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// `None` if `duration` elapses before `future` resolves.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        output = future => Some(output),
        _ = sleep(duration) => None,
    }
}

#[cfg(target_arch = "wasm32")]
fn timeout_promise(ms: u32) -> js_sys::Promise {
    js_sys::Promise::new(&mut |resolve, _reject| {
        let global = js_sys::global();
        let set_timeout = js_sys::Reflect::get(&global, &JsValue::from_str("setTimeout"))
            .ok()
            .and_then(|v| v.dyn_into::<js_sys::Function>().ok());
        let Some(set_timeout) = set_timeout else {
            let _ = resolve.call0(&JsValue::UNDEFINED);
            return;
        };

        // resolve right away if setTimeout throws so nothing waits forever
        let on_elapsed = resolve.clone();
        let callback = Closure::<dyn FnOnce()>::once(move || {
            let _ = on_elapsed.call0(&JsValue::UNDEFINED);
        });
        if set_timeout
            .call2(&global, callback.as_ref(), &JsValue::from_f64(f64::from(ms)))
            .is_ok()
        {
            callback.forget();
        } else {
            let _ = resolve.call0(&JsValue::UNDEFINED);
        }
    })
}

/// NEAR-style public key string for raw Ed25519 bytes.
pub fn near_public_key_string(public_key: &[u8]) -> String {
    format!("ed25519:{}", bs58::encode(public_key).into_string())
}
