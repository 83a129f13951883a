//! Browser bindings for the key-wrap worker.

use std::rc::Rc;

use log::debug;
use serde::Serialize;
use serde_json::Value;
use wasm_bindgen::prelude::*;
use wasm_bindgen_futures::future_to_promise;

use crate::config::WalletConfig;
use crate::crypto::EcvrfCryptoModule;
use crate::http::HttpRelayClient;
use crate::shamir3pass::Shamir3Pass;
use crate::worker::WorkerEndpoint;

#[wasm_bindgen(start)]
pub fn main() {
    crate::init_logging();
    debug!("Key-wrap worker starting up...");
}

fn to_js<T: Serialize>(value: &T) -> Result<JsValue, JsValue> {
    value
        .serialize(&serde_wasm_bindgen::Serializer::json_compatible())
        .map_err(|e| JsValue::from_str(&format!("Failed to serialize response: {}", e)))
}

#[wasm_bindgen]
pub struct KeyWrapWorker {
    inner: Rc<WorkerEndpoint<EcvrfCryptoModule, HttpRelayClient>>,
}

#[wasm_bindgen]
impl KeyWrapWorker {
    /// `config` is a `WalletConfig` object; `undefined` uses the defaults.
    #[wasm_bindgen(constructor)]
    pub fn new(config: JsValue, one_shot: bool) -> Result<KeyWrapWorker, JsValue> {
        let config: WalletConfig = if config.is_undefined() || config.is_null() {
            WalletConfig::default()
        } else {
            serde_wasm_bindgen::from_value(config)
                .map_err(|e| JsValue::from_str(&format!("Invalid wallet config: {}", e)))?
        };
        let shamir = Shamir3Pass::new(&config.shamir_p_b64u)
            .map_err(|e| JsValue::from_str(&format!("Failed to create Shamir3Pass: {}", e)))?;
        let endpoint = WorkerEndpoint::new(
            EcvrfCryptoModule::new(),
            shamir,
            HttpRelayClient::new(config.relay),
        );
        let endpoint = if one_shot { endpoint.one_shot() } else { endpoint };
        Ok(KeyWrapWorker {
            inner: Rc::new(endpoint),
        })
    }

    /// Resolves to the response object, or `null` for ignored messages.
    #[wasm_bindgen(js_name = handleMessage)]
    pub fn handle_message(&self, message: JsValue) -> js_sys::Promise {
        let inner = Rc::clone(&self.inner);
        future_to_promise(async move {
            let Ok(message) = serde_wasm_bindgen::from_value::<Value>(message) else {
                return Ok(JsValue::NULL);
            };
            match inner.handle_message(message).await.response() {
                Some(response) => to_js(response),
                None => Ok(JsValue::NULL),
            }
        })
    }

    #[wasm_bindgen(getter, js_name = hasProcessedRequest)]
    pub fn has_processed_request(&self) -> bool {
        self.inner.has_processed_request()
    }
}
