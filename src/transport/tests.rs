use std::rc::Rc;
use std::time::Duration;

use serde_json::{json, Value};

use super::*;
use crate::config::TransportConfig;
use crate::errors::{CredentialCeremonyError, TransportError};
use crate::test_support::{FakePlatform, RecordingTarget, APP_ORIGIN, WALLET_ORIGIN};
use crate::types::{CeremonyOptions, CredentialRequestOptions, PrfSalts};
use crate::webauthn::{rejection_codes, CredentialCeremony, PlatformRejection};

fn endpoint_to(peer: &Rc<RecordingTarget>, origin: &str) -> TransportEndpoint {
    TransportEndpoint::new(WeakTarget::new(origin, peer), TransportConfig::default())
}

fn data(message: &TransportMessage) -> Value {
    serde_json::to_value(message).unwrap()
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_is_removed_and_late_reply_ignored() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    let err = endpoint
        .send(message_types::WALLET_REQUEST, json!({ "action": "logout" }), Some(500))
        .await
        .unwrap_err();
    let (request_id, timeout_ms) = match err {
        TransportError::Timeout {
            request_id,
            timeout_ms,
        } => (request_id, timeout_ms),
        other => panic!("expected timeout, got {other:?}"),
    };
    assert_eq!(timeout_ms, 500);
    assert!(!endpoint.pending().contains(&request_id));
    assert!(endpoint.pending().is_empty());

    let (sent, target_origin) = peer.last().unwrap();
    assert_eq!(target_origin, APP_ORIGIN);
    assert_eq!(sent.request_id, request_id);
    let late = TransportMessage::response_to(&sent, Ok(Value::Null)).unwrap();
    assert_eq!(
        endpoint.handle_inbound(APP_ORIGIN, &data(&late)),
        Disposition::Ignored
    );
}

#[tokio::test]
async fn reply_resolves_only_from_expected_origin() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    let send = endpoint.request(message_types::WALLET_REQUEST, json!({ "action": "getLoginSession" }), None);
    let deliver = async {
        let (sent, _) = peer.last().unwrap();
        let reply = data(&TransportMessage::response_to(&sent, Ok(json!({ "isLoggedIn": false }))).unwrap());

        assert_eq!(
            endpoint.handle_inbound("https://evil.example.org", &reply),
            Disposition::Dropped
        );
        assert!(endpoint.pending().contains(&sent.request_id));

        assert_eq!(endpoint.handle_inbound(APP_ORIGIN, &reply), Disposition::Resolved);
    };
    let (result, ()) = tokio::join!(send, deliver);

    assert_eq!(result.unwrap(), json!({ "isLoggedIn": false }));
    assert!(endpoint.pending().is_empty());
}

#[tokio::test]
async fn error_reply_carries_the_ceremony_error_kind() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    let send = endpoint.request(message_types::WALLET_REQUEST, json!({ "action": "logout" }), None);
    let deliver = async {
        let (sent, _) = peer.last().unwrap();
        let reply = TransportMessage::response_to(&sent, Err(&CeremonyErrorKind::Reentrant)).unwrap();
        assert_eq!(reply.ok, Some(false));
        assert_eq!(reply.error.as_ref().unwrap().kind, "Reentrant");
        endpoint.handle_inbound(APP_ORIGIN, &data(&reply))
    };
    let (result, disposition) = tokio::join!(send, deliver);

    assert_eq!(disposition, Disposition::Resolved);
    assert_eq!(result.unwrap_err(), CeremonyErrorKind::Reentrant);
}

#[test]
fn ping_is_answered_with_pong() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    let ping = TransportMessage::request(message_types::PING, Value::Null);
    assert_eq!(
        endpoint.handle_inbound(APP_ORIGIN, &data(&ping)),
        Disposition::Control
    );
    let (pong, origin) = peer.last().unwrap();
    assert_eq!(pong.message_type, message_types::PONG);
    assert_eq!(pong.request_id, ping.request_id);
    assert_eq!(origin, APP_ORIGIN);
}

#[test]
fn malformed_and_unknown_messages_get_no_reply() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    for junk in [
        json!("hello"),
        json!(42),
        json!({ "type": "WALLET_REQUEST" }),
        json!({ "type": "WALLET_REQUEST", "requestId": "" }),
        json!({ "type": "SOMETHING_ELSE", "requestId": "r1" }),
    ] {
        assert_eq!(endpoint.handle_inbound(APP_ORIGIN, &junk), Disposition::Ignored, "{junk}");
    }
    let ping = TransportMessage::request(message_types::PING, Value::Null);
    assert_eq!(
        endpoint.handle_inbound(WALLET_ORIGIN, &data(&ping)),
        Disposition::Dropped
    );
    assert_eq!(peer.len(), 0);
}

#[test]
fn requests_are_handed_to_the_caller() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);

    let request = TransportMessage::request(message_types::WALLET_REQUEST, json!({ "action": "logout" }));
    assert_eq!(
        endpoint.handle_inbound(APP_ORIGIN, &data(&request)),
        Disposition::Request(request.clone())
    );
    assert_eq!(peer.len(), 0);

    endpoint.respond(&request, Ok(Value::Null)).unwrap();
    let (reply, _) = peer.last().unwrap();
    assert_eq!(reply.message_type, message_types::WALLET_RESPONSE);
    assert_eq!(reply.ok, Some(true));
}

#[tokio::test]
async fn dropped_peer_fails_fast() {
    let peer = RecordingTarget::new();
    let endpoint = endpoint_to(&peer, APP_ORIGIN);
    drop(peer);

    let err = endpoint
        .send(message_types::WALLET_REQUEST, Value::Null, None)
        .await
        .unwrap_err();
    assert_eq!(err, TransportError::Disconnected);
    assert!(endpoint.pending().is_empty());
}

#[test]
fn weak_target_does_not_keep_its_peer_alive() {
    let peer = RecordingTarget::new();
    let target = WeakTarget::new(APP_ORIGIN, &peer);
    assert!(target.is_alive());
    target
        .post(&TransportMessage::request(message_types::PING, Value::Null))
        .unwrap();
    assert_eq!(peer.len(), 1);

    drop(peer);
    assert!(!target.is_alive());
    let err = target
        .post(&TransportMessage::request(message_types::PING, Value::Null))
        .unwrap_err();
    assert_eq!(err, TransportError::Disconnected);
}

#[test]
fn foreign_origin_is_reported_as_mismatch() {
    let peer = RecordingTarget::new();
    let target = WeakTarget::new(APP_ORIGIN, &peer);
    assert_eq!(target.check_origin(APP_ORIGIN), Ok(()));
    assert_eq!(
        target.check_origin(WALLET_ORIGIN),
        Err(TransportError::OriginMismatch {
            expected: APP_ORIGIN.to_string(),
            actual: WALLET_ORIGIN.to_string(),
        })
    );
    let endpoint = endpoint_to(&peer, APP_ORIGIN);
    let ping = data(&TransportMessage::request(message_types::PING, Value::Null));
    assert_eq!(endpoint.handle_inbound(WALLET_ORIGIN, &ping), Disposition::Dropped);
    assert_eq!(peer.len(), 0);
}

// === PARENT BRIDGE ===

struct Bridge {
    iframe_platform: FakePlatform,
    parent_platform: FakePlatform,
    to_parent: Rc<RecordingTarget>,
    to_iframe: Rc<RecordingTarget>,
    wallet_side: Rc<TransportEndpoint>,
    bridged: BridgedWebAuthn<FakePlatform>,
    host: ParentBridgeHost<FakePlatform>,
}

impl Bridge {
    fn new() -> Self {
        let iframe_platform = FakePlatform::new("wallet-frame");
        let parent_platform = FakePlatform::new("top-level");
        let to_parent = RecordingTarget::new();
        let to_iframe = RecordingTarget::new();
        let wallet_side = Rc::new(endpoint_to(&to_parent, APP_ORIGIN));
        let app_side = Rc::new(endpoint_to(&to_iframe, WALLET_ORIGIN));
        Self {
            bridged: BridgedWebAuthn::new(iframe_platform.clone(), Rc::clone(&wallet_side)),
            host: ParentBridgeHost::new(parent_platform.clone(), app_side),
            iframe_platform,
            parent_platform,
            to_parent,
            to_iframe,
            wallet_side,
        }
    }

    /// Carry one bridged request to the parent and its reply back.
    async fn relay_one(&self) {
        let request = loop {
            if let Some((request, _)) = self.to_parent.last() {
                break request;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let disposition = self.host.on_message(WALLET_ORIGIN, &data(&request)).await;
        assert!(matches!(disposition, Disposition::Request(_)));
        let (reply, origin) = self.to_iframe.last().unwrap();
        assert_eq!(origin, WALLET_ORIGIN);
        assert_eq!(
            self.wallet_side.handle_inbound(APP_ORIGIN, &data(&reply)),
            Disposition::Resolved
        );
    }
}

fn get_options() -> CeremonyOptions {
    CeremonyOptions::Get(CredentialRequestOptions {
        rp_id: "example.com".to_string(),
        challenge: vec![3u8; 32],
        allow_credentials: Vec::new(),
        prf: PrfSalts {
            encryption_salt: b"enc".to_vec(),
            signing_salt: b"sig".to_vec(),
        },
        user_verification: "preferred".to_string(),
    })
}

fn ancestor_blocked() -> PlatformRejection {
    PlatformRejection::new("NotAllowedError", "blocked").with_code(rejection_codes::ANCESTOR_BLOCKED)
}

fn focus_blocked() -> PlatformRejection {
    PlatformRejection::new("NotAllowedError", "The document is not focused.")
}

#[tokio::test(start_paused = true)]
async fn ancestor_blocked_runs_in_parent() {
    let bridge = Bridge::new();
    bridge.iframe_platform.reject_next(ancestor_blocked());

    let options = get_options();
    let (credential, ()) = tokio::join!(bridge.bridged.perform(&options), bridge.relay_one());

    let credential = credential.unwrap();
    assert_eq!(credential.raw_id, bridge.parent_platform.credential_id());
    assert_eq!(bridge.iframe_platform.calls(), 1);
    assert_eq!(bridge.iframe_platform.focus_requests(), 0);
    assert_eq!(bridge.parent_platform.calls(), 1);
    assert_eq!(bridge.parent_platform.last_options(), Some(options));
}

#[tokio::test(start_paused = true)]
async fn focus_blocked_retries_locally_first() {
    let bridge = Bridge::new();
    bridge.iframe_platform.reject_next(focus_blocked());

    let credential = bridge.bridged.perform(&get_options()).await.unwrap();

    assert_eq!(credential.raw_id, bridge.iframe_platform.credential_id());
    assert_eq!(bridge.iframe_platform.calls(), 2);
    assert_eq!(bridge.iframe_platform.focus_requests(), 1);
    assert_eq!(bridge.to_parent.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn focus_blocked_falls_back_to_parent_after_retries() {
    let bridge = Bridge::new();
    let attempts = TransportConfig::default().focus_retry_attempts;
    for _ in 0..=attempts {
        bridge.iframe_platform.reject_next(focus_blocked());
    }

    let options = get_options();
    let (credential, ()) = tokio::join!(bridge.bridged.perform(&options), bridge.relay_one());

    assert_eq!(credential.unwrap().raw_id, bridge.parent_platform.credential_id());
    assert_eq!(bridge.iframe_platform.calls(), attempts + 1);
    assert_eq!(bridge.iframe_platform.focus_requests(), attempts);
    assert_eq!(bridge.parent_platform.calls(), 1);
}

#[tokio::test]
async fn user_rejection_is_not_bridged() {
    let bridge = Bridge::new();
    bridge.iframe_platform.reject_next(PlatformRejection::new(
        "NotAllowedError",
        "The operation either timed out or was not allowed.",
    ));

    let err = bridge.bridged.perform(&get_options()).await.unwrap_err();

    assert!(matches!(
        err,
        CeremonyErrorKind::Credential(CredentialCeremonyError::NotAllowed(_))
    ));
    assert_eq!(bridge.iframe_platform.calls(), 1);
    assert_eq!(bridge.to_parent.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn parent_rejection_comes_back_classified() {
    let bridge = Bridge::new();
    bridge.iframe_platform.reject_next(ancestor_blocked());
    bridge
        .parent_platform
        .reject_next(PlatformRejection::new("AbortError", "user closed the sheet"));

    let options = get_options();
    let (result, ()) = tokio::join!(bridge.bridged.perform(&options), bridge.relay_one());

    assert_eq!(
        result.unwrap_err(),
        CeremonyErrorKind::Credential(CredentialCeremonyError::Cancelled)
    );
}

#[tokio::test]
async fn host_rejects_mismatched_ceremony_type() {
    let bridge = Bridge::new();
    let request = TransportMessage::request(
        message_types::WALLET_WEBAUTHN_CREATE,
        serde_json::to_value(get_options()).unwrap(),
    );

    bridge.host.on_message(WALLET_ORIGIN, &data(&request)).await;

    let (reply, _) = bridge.to_iframe.last().unwrap();
    assert_eq!(reply.message_type, message_types::WALLET_WEBAUTHN_RESULT);
    assert_eq!(reply.ok, Some(false));
    assert_eq!(reply.error.unwrap().kind, "TransportError");
    assert_eq!(bridge.parent_platform.calls(), 0);
}
