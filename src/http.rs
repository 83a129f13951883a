//! Relay server client.
//!
//! `RelayClient` is the seam used by the key-wrap client and the registration
//! ceremony; `HttpRelayClient` is the production implementation over reqwest.

use log::debug;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::RelayConfig;
use crate::errors::{KeyWrapError, KeyWrapResult};
use crate::types::http::{
    CreateAccountAndRegisterRequest, CreateAccountAndRegisterResponse, RelayErrorBody,
    ShamirApplyServerLockHTTPRequest, ShamirApplyServerLockHTTPResponse,
    ShamirKeyInfoHTTPResponse, ShamirRemoveServerLockHTTPRequest,
    ShamirRemoveServerLockHTTPResponse,
};

/// Relay endpoints consumed by the wallet.
#[allow(async_fn_in_trait)]
pub trait RelayClient {
    /// POST /vrf/apply-server-lock
    async fn apply_server_lock(
        &self,
        request: ShamirApplyServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirApplyServerLockHTTPResponse>;

    /// POST /vrf/remove-server-lock
    async fn remove_server_lock(
        &self,
        request: ShamirRemoveServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirRemoveServerLockHTTPResponse>;

    /// GET /shamir/key-info
    async fn key_info(&self) -> KeyWrapResult<ShamirKeyInfoHTTPResponse>;

    /// POST /create_account_and_register_user
    async fn create_account_and_register_user(
        &self,
        request: CreateAccountAndRegisterRequest,
    ) -> Result<CreateAccountAndRegisterResponse, String>;
}

pub struct HttpRelayClient {
    client: reqwest::Client,
    config: RelayConfig,
}

impl HttpRelayClient {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    async fn post_json<Req, Resp>(&self, route: &str, body: &Req) -> Result<Resp, RelayHttpError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let url = self.config.endpoint(route);
        debug!("POST endpoint: {}", url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RelayHttpError::Network(e.to_string()))?;
        read_json(resp).await
    }

    async fn get_json<Resp: DeserializeOwned>(&self, route: &str) -> Result<Resp, RelayHttpError> {
        let url = self.config.endpoint(route);
        debug!("GET endpoint: {}", url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RelayHttpError::Network(e.to_string()))?;
        read_json(resp).await
    }
}

enum RelayHttpError {
    Network(String),
    Status { status: u16, body: Option<RelayErrorBody> },
    Decode(String),
}

impl From<RelayHttpError> for KeyWrapError {
    fn from(err: RelayHttpError) -> Self {
        match err {
            RelayHttpError::Status {
                body: Some(body), ..
            } if body.code == "UnknownKeyId" => KeyWrapError::UnknownKeyId(body.error),
            other => KeyWrapError::Relay(other.to_string()),
        }
    }
}

impl std::fmt::Display for RelayHttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayHttpError::Network(e) => write!(f, "network error: {}", e),
            RelayHttpError::Status { status, body } => match body {
                Some(body) => write!(f, "HTTP {}: {} ({})", status, body.error, body.code),
                None => write!(f, "HTTP {}", status),
            },
            RelayHttpError::Decode(e) => write!(f, "invalid response body: {}", e),
        }
    }
}

async fn read_json<Resp: DeserializeOwned>(resp: reqwest::Response) -> Result<Resp, RelayHttpError> {
    let status = resp.status();
    let text = resp
        .text()
        .await
        .map_err(|e| RelayHttpError::Network(e.to_string()))?;
    if !status.is_success() {
        return Err(RelayHttpError::Status {
            status: status.as_u16(),
            body: serde_json::from_str(&text).ok(),
        });
    }
    serde_json::from_str(&text).map_err(|e| RelayHttpError::Decode(e.to_string()))
}

impl RelayClient for HttpRelayClient {
    async fn apply_server_lock(
        &self,
        request: ShamirApplyServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirApplyServerLockHTTPResponse> {
        Ok(self
            .post_json(&self.config.apply_lock_route, &request)
            .await?)
    }

    async fn remove_server_lock(
        &self,
        request: ShamirRemoveServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirRemoveServerLockHTTPResponse> {
        Ok(self
            .post_json(&self.config.remove_lock_route, &request)
            .await?)
    }

    async fn key_info(&self) -> KeyWrapResult<ShamirKeyInfoHTTPResponse> {
        Ok(self.get_json(&self.config.key_info_route).await?)
    }

    async fn create_account_and_register_user(
        &self,
        request: CreateAccountAndRegisterRequest,
    ) -> Result<CreateAccountAndRegisterResponse, String> {
        self.post_json(&self.config.create_account_route, &request)
            .await
            .map_err(|e| e.to_string())
    }
}

impl<T: RelayClient> RelayClient for std::rc::Rc<T> {
    async fn apply_server_lock(
        &self,
        request: ShamirApplyServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirApplyServerLockHTTPResponse> {
        (**self).apply_server_lock(request).await
    }

    async fn remove_server_lock(
        &self,
        request: ShamirRemoveServerLockHTTPRequest,
    ) -> KeyWrapResult<ShamirRemoveServerLockHTTPResponse> {
        (**self).remove_server_lock(request).await
    }

    async fn key_info(&self) -> KeyWrapResult<ShamirKeyInfoHTTPResponse> {
        (**self).key_info().await
    }

    async fn create_account_and_register_user(
        &self,
        request: CreateAccountAndRegisterRequest,
    ) -> Result<CreateAccountAndRegisterResponse, String> {
        (**self).create_account_and_register_user(request).await
    }
}
