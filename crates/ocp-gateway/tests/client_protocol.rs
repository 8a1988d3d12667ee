use ocp_core::protocol::{decode_frame, Frame, RequestFrame, DEFAULT_MAX_FRAME_BYTES};
use ocp_gateway::{
    ClientConfig, ConnectionStatus, Gateway, GatewayClient, GatewayError, MemoryConnector,
    MemoryPeer, SessionListOptions,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn new_client() -> (GatewayClient, mpsc::UnboundedReceiver<MemoryPeer>) {
    let (connector, peers) = MemoryConnector::new();
    let config = ClientConfig::new("test-gw", "ws://gateway.test")
        .with_token(Some("secret".to_string()));
    (GatewayClient::new(config, Arc::new(connector)), peers)
}

async fn next_request(peer: &mut MemoryPeer) -> RequestFrame {
    let text = peer.recv().await.expect("client frame");
    match decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode client frame") {
        Frame::Req(request) => request,
        other => panic!("expected request, got {other:?}"),
    }
}

fn respond_ok(peer: &MemoryPeer, id: &str, payload: Value) {
    peer.send(json!({ "type": "res", "id": id, "ok": true, "payload": payload }).to_string());
}

fn respond_err(peer: &MemoryPeer, id: &str, message: &str, code: &str) {
    peer.send(
        json!({
            "type": "res",
            "id": id,
            "ok": false,
            "error": { "message": message, "code": code }
        })
        .to_string(),
    );
}

fn send_event(peer: &MemoryPeer, event: &str, payload: Value) {
    peer.send(json!({ "type": "event", "event": event, "payload": payload }).to_string());
}

fn assert_backoff(elapsed: Duration, expected: Duration) {
    assert!(
        elapsed >= expected && elapsed < expected + Duration::from_millis(50),
        "expected ~{expected:?}, waited {elapsed:?}"
    );
}

/// Completes a handshake including the post-connect health/presence refresh.
async fn connected_client() -> (GatewayClient, MemoryPeer, mpsc::UnboundedReceiver<MemoryPeer>) {
    let (client, mut peers) = new_client();
    client.connect();
    let mut peer = peers.recv().await.expect("connection");
    send_event(&peer, "connect.challenge", json!({ "nonce": "n-1", "ts": 1 }));
    let connect = next_request(&mut peer).await;
    assert_eq!(connect.method, "connect");
    respond_ok(&peer, &connect.id, json!({ "type": "hello-ok", "protocol": 3 }));

    let health = next_request(&mut peer).await;
    assert_eq!(health.method, "health");
    respond_ok(&peer, &health.id, json!({ "ok": true }));
    let presence = next_request(&mut peer).await;
    assert_eq!(presence.method, "system-presence");
    respond_ok(&peer, &presence.id, json!([{ "host": "box" }]));

    client
        .wait_connected(Duration::from_secs(1))
        .await
        .expect("connected");
    (client, peer, peers)
}

#[tokio::test(start_paused = true)]
async fn challenge_nonce_is_echoed_in_connect_request() {
    let (client, mut peers) = new_client();
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    client.connect();
    let mut peer = peers.recv().await.expect("connection");
    send_event(&peer, "connect.challenge", json!({ "nonce": "n-42" }));

    let connect = next_request(&mut peer).await;
    assert_eq!(connect.method, "connect");
    assert!(connect.id.starts_with("cp-"));
    assert_eq!(connect.params["device"]["nonce"], "n-42");
    assert_eq!(connect.params["minProtocol"], 3);
    assert_eq!(connect.params["maxProtocol"], 3);
    assert_eq!(connect.params["role"], "operator");
    assert_eq!(
        connect.params["scopes"],
        json!(["operator.read", "operator.write"])
    );
    assert_eq!(connect.params["auth"]["token"], "secret");
    assert_eq!(connect.params["client"]["id"], "gateway-client");
    assert_eq!(client.status(), ConnectionStatus::Connecting);

    respond_ok(&peer, &connect.id, json!({ "type": "hello-ok" }));
    client
        .wait_connected(Duration::from_secs(1))
        .await
        .expect("connected");
    assert_eq!(
        client.snapshot().hello,
        Some(json!({ "type": "hello-ok" }))
    );
}

#[tokio::test(start_paused = true)]
async fn fallback_sends_single_connect_without_nonce() {
    let (client, mut peers) = new_client();
    client.connect();
    let mut peer = peers.recv().await.expect("connection");

    let started = Instant::now();
    let connect = next_request(&mut peer).await;
    assert_eq!(connect.method, "connect");
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(connect.params.get("device").is_none());

    // A challenge after the fallback fired must not produce a second connect.
    send_event(&peer, "connect.challenge", json!({ "nonce": "late" }));
    respond_ok(&peer, &connect.id, json!({}));

    let health = next_request(&mut peer).await;
    let presence = next_request(&mut peer).await;
    assert_eq!(health.method, "health");
    assert_eq!(presence.method, "system-presence");
    let extra = tokio::time::timeout(Duration::from_secs(1), peer.recv()).await;
    assert!(extra.is_err(), "unexpected frame after handshake");
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn rejected_handshake_enters_error_and_reconnects() {
    let (client, mut peers) = new_client();
    let mut status = client.watch_status();
    client.connect();
    let mut peer = peers.recv().await.expect("connection");
    send_event(&peer, "connect.challenge", json!({}));
    let connect = next_request(&mut peer).await;
    respond_err(&peer, &connect.id, "bad token", "UNAUTHORIZED");

    status
        .wait_for(|status| *status == ConnectionStatus::Error)
        .await
        .expect("error status");
    assert!(peer.recv().await.is_none(), "socket should be closed");

    let before = Instant::now();
    let _retry = peers.recv().await.expect("reconnect attempt");
    assert!(before.elapsed() >= Duration::from_secs(1));
    assert_eq!(client.snapshot().reconnect_attempts, 1);
}

#[tokio::test(start_paused = true)]
async fn handshake_without_response_times_out() {
    let (client, mut peers) = new_client();
    let mut status = client.watch_status();
    client.connect();
    let mut peer = peers.recv().await.expect("connection");
    send_event(&peer, "connect.challenge", json!({}));
    let _connect = next_request(&mut peer).await;

    let started = Instant::now();
    status
        .wait_for(|status| *status == ConnectionStatus::Error)
        .await
        .expect("error status");
    assert!(started.elapsed() >= Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn responses_route_by_id_out_of_order() {
    let (client, mut peer, _peers) = connected_client().await;

    let mut calls = Vec::new();
    for method in ["status", "models.list", "cron.list"] {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            client.request(method, json!({})).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(next_request(&mut peer).await);
    }
    for request in requests.iter().rev() {
        respond_ok(&peer, &request.id, json!({ "method": request.method }));
    }

    let mut ids: Vec<&str> = requests.iter().map(|request| request.id.as_str()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 3, "correlation ids must be unique");

    for (call, method) in calls.into_iter().zip(["status", "models.list", "cron.list"]) {
        let payload = call.await.expect("join").expect("response");
        assert_eq!(payload["method"], method);
    }
}

#[tokio::test(start_paused = true)]
async fn timed_out_request_ignores_late_response() {
    let (client, mut peer, _peers) = connected_client().await;

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("status", json!({})).await })
    };
    let request = next_request(&mut peer).await;

    let err = pending.await.expect("join").expect_err("should time out");
    assert!(matches!(err, GatewayError::Timeout { ref method } if method == "status"));

    respond_ok(&peer, &request.id, json!({ "late": true }));

    let follow_up = {
        let client = client.clone();
        tokio::spawn(async move { client.request("health", json!({})).await })
    };
    let request = next_request(&mut peer).await;
    respond_ok(&peer, &request.id, json!({ "fresh": true }));
    let payload = follow_up.await.expect("join").expect("response");
    assert_eq!(payload, json!({ "fresh": true }));
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn remote_errors_surface_message_and_code() {
    let (client, mut peer, _peers) = connected_client().await;
    let call = {
        let client = client.clone();
        tokio::spawn(async move { client.request("agents.delete", json!({})).await })
    };
    let request = next_request(&mut peer).await;
    respond_err(&peer, &request.id, "agent not found", "NOT_FOUND");
    match call.await.expect("join") {
        Err(GatewayError::Remote { message, code }) => {
            assert_eq!(message, "agent not found");
            assert_eq!(code.as_deref(), Some("NOT_FOUND"));
        }
        other => panic!("expected remote error, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn request_without_socket_fails_fast() {
    let (client, _peers) = new_client();
    let err = client
        .request("health", json!({}))
        .await
        .expect_err("not connected");
    assert!(matches!(err, GatewayError::NotConnected));
}

#[tokio::test(start_paused = true)]
async fn disconnect_rejects_pending_and_stops_reconnecting() {
    let (client, mut peer, mut peers) = connected_client().await;
    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.request("status", json!({})).await })
    };
    let _request = next_request(&mut peer).await;

    client.disconnect();
    let err = pending.await.expect("join").expect_err("rejected");
    assert!(matches!(err, GatewayError::Closed));
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.snapshot().hello, None);
    assert_eq!(client.snapshot().health, None);

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(peers.try_recv().is_err(), "no reconnect after disconnect");

    client.reconnect();
    assert!(peers.recv().await.is_some());
}

#[tokio::test(start_paused = true)]
async fn connect_is_noop_while_connected() {
    let (client, _peer, mut peers) = connected_client().await;
    client.connect();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(peers.try_recv().is_err());
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn backoff_grows_until_a_handshake_succeeds() {
    let (client, peer, mut peers) = connected_client().await;
    let mut status = client.watch_status();

    drop(peer);
    status
        .wait_for(|status| *status == ConnectionStatus::Disconnected)
        .await
        .expect("disconnected");

    let before = Instant::now();
    let second = peers.recv().await.expect("first retry");
    assert_backoff(before.elapsed(), Duration::from_secs(1));

    drop(second);
    let before = Instant::now();
    let _third = peers.recv().await.expect("second retry");
    assert_backoff(before.elapsed(), Duration::from_secs(2));
    assert_eq!(client.snapshot().reconnect_attempts, 2);
}

#[tokio::test(start_paused = true)]
async fn events_fan_out_and_challenge_stays_internal() {
    let (client, mut peers) = new_client();
    let mut first = client.subscribe();
    let mut second = client.subscribe();
    client.connect();
    let mut peer = peers.recv().await.expect("connection");
    send_event(&peer, "connect.challenge", json!({ "nonce": "x" }));
    let connect = next_request(&mut peer).await;
    respond_ok(&peer, &connect.id, json!({}));

    send_event(&peer, "presence", json!([{ "host": "laptop" }]));
    peer.send(
        json!({ "type": "event", "event": "chat", "payload": { "state": "delta" }, "seq": 9 })
            .to_string(),
    );
    peer.send("{not json");

    for receiver in [&mut first, &mut second] {
        let presence = receiver.recv().await.expect("presence event");
        assert_eq!(presence.event, "presence");
        assert_eq!(presence.gateway_name, "test-gw");
        let chat = receiver.recv().await.expect("chat event");
        assert_eq!(chat.event, "chat");
        assert_eq!(chat.seq, Some(9));
    }
    assert_eq!(
        client.snapshot().presence,
        Some(json!([{ "host": "laptop" }]))
    );
    assert_eq!(client.status(), ConnectionStatus::Connected);
}

#[tokio::test(start_paused = true)]
async fn facade_reads_return_none_and_writes_propagate() {
    let (client, mut peer, _peers) = connected_client().await;
    let gateway = Gateway::new(client);

    let listing = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.list_sessions(SessionListOptions::default()).await })
    };
    let request = next_request(&mut peer).await;
    assert_eq!(request.method, "sessions.list");
    assert_eq!(request.params["limit"], 50);
    assert_eq!(request.params["includeDerivedTitles"], true);
    respond_err(&peer, &request.id, "boom", "INTERNAL");
    assert!(listing.await.expect("join").is_none());

    let dispatch = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.send_to_agent("Write changelog", "Writer").await })
    };
    let request = next_request(&mut peer).await;
    assert_eq!(request.method, "agent");
    assert_eq!(request.params["sessionKey"], "agent:writer:main");
    assert!(request.params.get("agentId").is_none());
    assert!(request.params["idempotencyKey"]
        .as_str()
        .is_some_and(|key| key.starts_with("cp-")));
    respond_ok(&peer, &request.id, json!({ "runId": "run-7", "status": "accepted" }));
    let accepted = dispatch.await.expect("join").expect("accepted");
    assert_eq!(accepted.run_id.as_deref(), Some("run-7"));

    let failing = {
        let gateway = gateway.clone();
        tokio::spawn(async move { gateway.cron_run("nightly", None).await })
    };
    let request = next_request(&mut peer).await;
    assert_eq!(request.params["mode"], "force");
    respond_err(&peer, &request.id, "no such job", "NOT_FOUND");
    assert!(failing.await.expect("join").is_err());
}
