use axum::body::Body;
use axum::extract::ws::{close_code, Message};
use axum::http::{Request, StatusCode};
use futures::channel::mpsc;
use futures::StreamExt;
use serde_json::{json, Value};
use signalhub::config::RelayConfig;
use signalhub::ratelimit::RateLimiter;
use signalhub::registry::ReplacePolicy;
use signalhub::routes;
use signalhub::session::{run_session, SessionState, DUPLICATE_ID_REASON};
use signalhub::state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tower::ServiceExt;

const WAIT: Duration = Duration::from_secs(2);

/// A client driving a session through in-memory channels instead of a socket
struct TestClient {
    to_server: Option<mpsc::UnboundedSender<Result<Message, std::io::Error>>>,
    from_server: mpsc::UnboundedReceiver<Message>,
    task: JoinHandle<SessionState>,
}

impl TestClient {
    fn connect(state: &Arc<AppState>, id: &str) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let task = tokio::spawn(run_session(id.to_string(), out_tx, in_rx, state.clone()));
        Self {
            to_server: Some(in_tx),
            from_server: out_rx,
            task,
        }
    }

    fn send_frame(&self, frame: Message) {
        self.to_server
            .as_ref()
            .expect("client already disconnected")
            .unbounded_send(Ok(frame))
            .expect("session stopped reading");
    }

    fn send_json(&self, value: Value) {
        self.send_frame(Message::Text(value.to_string().into()));
    }

    async fn recv_json(&mut self) -> Value {
        let frame = tokio::time::timeout(WAIT, self.from_server.next())
            .await
            .expect("timed out waiting for a message")
            .expect("connection closed");
        match frame {
            Message::Text(text) => serde_json::from_str(text.as_str()).expect("invalid JSON"),
            other => panic!("Expected text frame, got {:?}", other),
        }
    }

    async fn expect_users(&mut self, expected: &[&str]) {
        let msg = self.recv_json().await;
        assert_eq!(msg, json!({"type": "users", "data": expected}));
    }

    async fn expect_silence(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.from_server.next()).await;
        assert!(next.is_err(), "unexpected message: {:?}", next);
    }

    /// Send a close frame and wait for the session to finish
    async fn close(mut self) -> SessionState {
        self.send_frame(Message::Close(None));
        self.to_server = None;
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("session did not finish")
            .expect("session panicked")
    }
}

fn test_state(configure: impl FnOnce(&mut RelayConfig)) -> Arc<AppState> {
    let mut config = RelayConfig::default();
    configure(&mut config);
    Arc::new(AppState::new(&config))
}

#[tokio::test]
async fn test_connect_route_disconnect_flow() {
    let state = test_state(|_| {});

    let mut alice = TestClient::connect(&state, "alice");
    alice.expect_users(&["alice"]).await;

    let mut bob = TestClient::connect(&state, "bob");
    bob.expect_users(&["alice", "bob"]).await;
    alice.expect_users(&["alice", "bob"]).await;

    // Directed offer from alice to bob, with a forged sender
    alice.send_json(json!({"target": "bob", "type": "offer", "sdp": "v=0", "from": "eve"}));
    assert_eq!(
        bob.recv_json().await,
        json!({"target": "bob", "type": "offer", "sdp": "v=0", "from": "alice"})
    );
    alice.expect_silence().await;

    // And an answer back
    bob.send_json(json!({"target": "alice", "type": "answer", "sdp": "v=1"}));
    assert_eq!(
        alice.recv_json().await,
        json!({"target": "alice", "type": "answer", "sdp": "v=1", "from": "bob"})
    );

    assert_eq!(alice.close().await, SessionState::Closed);
    bob.expect_users(&["bob"]).await;
    assert_eq!(state.registry.snapshot().await, vec!["bob".to_string()]);

    bob.close().await;
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_bad_messages_do_not_end_session() {
    let state = test_state(|_| {});

    let mut alice = TestClient::connect(&state, "alice");
    alice.expect_users(&["alice"]).await;
    let mut bob = TestClient::connect(&state, "bob");
    bob.expect_users(&["alice", "bob"]).await;
    alice.expect_users(&["alice", "bob"]).await;

    alice.send_frame(Message::Text("{not json".to_string().into()));
    alice.send_frame(Message::Binary(vec![1, 2, 3].into()));
    alice.send_json(json!({"payload": "no target"}));
    alice.send_json(json!({"target": "nobody", "payload": "lost"}));
    alice.send_json(json!(["target", "bob"]));
    alice.send_json(json!({"target": "bob", "payload": "still here"}));

    assert_eq!(
        bob.recv_json().await,
        json!({"target": "bob", "payload": "still here", "from": "alice"})
    );
    bob.expect_silence().await;
    alice.expect_silence().await;

    assert!(!alice.task.is_finished());
    assert_eq!(state.registry.len().await, 2);
}

#[tokio::test]
async fn test_disconnect_broadcast_excludes_departed_client() {
    let state = test_state(|_| {});

    let mut a = TestClient::connect(&state, "a");
    a.expect_users(&["a"]).await;
    let mut b = TestClient::connect(&state, "b");
    b.expect_users(&["a", "b"]).await;
    a.expect_users(&["a", "b"]).await;
    let mut c = TestClient::connect(&state, "c");
    c.expect_users(&["a", "b", "c"]).await;
    a.expect_users(&["a", "b", "c"]).await;
    b.expect_users(&["a", "b", "c"]).await;

    c.close().await;

    // Exactly one membership update, and it no longer lists c
    a.expect_users(&["a", "b"]).await;
    b.expect_users(&["a", "b"]).await;
    a.expect_silence().await;
    b.expect_silence().await;
}

#[tokio::test]
async fn test_transport_error_ends_session() {
    let state = test_state(|_| {});

    let mut a = TestClient::connect(&state, "a");
    a.expect_users(&["a"]).await;
    let mut b = TestClient::connect(&state, "b");
    b.expect_users(&["a", "b"]).await;
    a.expect_users(&["a", "b"]).await;

    if let Some(tx) = &b.to_server {
        tx.unbounded_send(Err(std::io::Error::other("connection reset")))
            .unwrap();
    }
    let final_state = tokio::time::timeout(WAIT, b.task).await.unwrap().unwrap();
    assert_eq!(final_state, SessionState::Closed);

    a.expect_users(&["a"]).await;
    assert!(state.registry.lookup("b").await.is_none());
}

#[tokio::test]
async fn test_stream_end_ends_session() {
    let state = test_state(|_| {});

    let mut a = TestClient::connect(&state, "a");
    a.expect_users(&["a"]).await;

    a.to_server = None;
    let final_state = tokio::time::timeout(WAIT, a.task).await.unwrap().unwrap();
    assert_eq!(final_state, SessionState::Closed);
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_reconnect_replaces_previous_connection() {
    let state = test_state(|_| {});

    let mut first = TestClient::connect(&state, "alice");
    first.expect_users(&["alice"]).await;
    let mut bob = TestClient::connect(&state, "bob");
    bob.expect_users(&["alice", "bob"]).await;
    first.expect_users(&["alice", "bob"]).await;

    let mut second = TestClient::connect(&state, "alice");
    second.expect_users(&["alice", "bob"]).await;
    bob.expect_users(&["alice", "bob"]).await;
    assert_eq!(state.registry.len().await, 2);

    // The orphaned session ending must not remove the replacement
    first.close().await;
    assert_eq!(
        state.registry.snapshot().await,
        vec!["alice".to_string(), "bob".to_string()]
    );
    bob.expect_silence().await;

    bob.send_json(json!({"target": "alice", "n": 1}));
    assert_eq!(
        second.recv_json().await,
        json!({"target": "alice", "n": 1, "from": "bob"})
    );
}

#[tokio::test]
async fn test_reject_duplicate_policy_refuses_second_connection() {
    let state = test_state(|c| c.replace_policy = ReplacePolicy::RejectDuplicate);

    let mut first = TestClient::connect(&state, "alice");
    first.expect_users(&["alice"]).await;
    let original = state.registry.lookup("alice").await.unwrap();

    let mut second = TestClient::connect(&state, "alice");
    let final_state = tokio::time::timeout(WAIT, &mut second.task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(final_state, SessionState::Closed);

    // The refused connection only ever sees a policy close
    let next = tokio::time::timeout(WAIT, second.from_server.next()).await.unwrap();
    match next {
        Some(Message::Close(Some(frame))) => {
            assert_eq!(frame.code, close_code::POLICY);
            assert_eq!(frame.reason.as_str(), DUPLICATE_ID_REASON);
        }
        other => panic!("Expected a close frame, got {:?}", other),
    }
    let next = tokio::time::timeout(WAIT, second.from_server.next()).await.unwrap();
    assert!(next.is_none());

    let current = state.registry.lookup("alice").await.unwrap();
    assert!(current.is_same_connection(&original));
    first.expect_silence().await;
}

#[tokio::test]
async fn test_stalled_client_is_disconnected() {
    let state = test_state(|c| {
        c.outbound_buffer = 1;
        c.send_timeout = Duration::from_millis(50);
    });

    // A peer whose socket stops draining after the first frame
    let (stalled_tx, mut stalled_rx) = mpsc::channel::<Message>(0);
    let (_stalled_in_tx, stalled_in_rx) = mpsc::unbounded::<Result<Message, std::io::Error>>();
    let stalled = tokio::spawn(run_session(
        "stalled".to_string(),
        stalled_tx,
        stalled_in_rx,
        state.clone(),
    ));
    let first = tokio::time::timeout(WAIT, stalled_rx.next()).await.unwrap();
    assert!(matches!(first, Some(Message::Text(_))));

    let mut alice = TestClient::connect(&state, "alice");
    alice.expect_users(&["alice", "stalled"]).await;

    for n in 0..5 {
        alice.send_json(json!({"target": "stalled", "n": n}));
    }

    let final_state = tokio::time::timeout(WAIT, stalled).await.unwrap().unwrap();
    assert_eq!(final_state, SessionState::Closed);
    alice.expect_users(&["alice"]).await;
    assert!(state.registry.lookup("stalled").await.is_none());
    assert!(!alice.task.is_finished());
}

#[tokio::test]
async fn test_concurrent_clients_all_registered() {
    let state = test_state(|_| {});
    let ids: Vec<String> = (0..16).map(|i| format!("peer-{:02}", i)).collect();

    let mut clients: Vec<TestClient> = ids
        .iter()
        .map(|id| TestClient::connect(&state, id))
        .collect();

    // Every client eventually sees a membership list containing everyone
    for client in clients.iter_mut() {
        loop {
            let msg = client.recv_json().await;
            assert_eq!(msg["type"], "users");
            if msg["data"].as_array().map(|d| d.len()) == Some(ids.len()) {
                break;
            }
        }
    }
    assert_eq!(state.registry.snapshot().await, ids);

    let closes = clients.into_iter().map(|c| c.close());
    for final_state in futures::future::join_all(closes).await {
        assert_eq!(final_state, SessionState::Closed);
    }
    assert!(state.registry.is_empty().await);
}

#[tokio::test]
async fn test_health_endpoint() {
    let state = test_state(|_| {});
    let app = routes::app(state, None);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["message"], "WebRTC Signaling Server is running");
    assert_eq!(value["clients"], 0);
}

#[tokio::test]
async fn test_clients_endpoint_lists_membership() {
    let state = test_state(|_| {});
    let mut alice = TestClient::connect(&state, "alice");
    alice.expect_users(&["alice"]).await;

    let app = routes::app(state, None);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/clients")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value: Value = serde_json::from_slice(&body).unwrap();
    let clients = value["clients"].as_array().unwrap();
    assert_eq!(clients.len(), 1);
    assert_eq!(clients[0]["id"], "alice");
    assert!(clients[0]["connected_at"].is_string());
}

#[tokio::test]
async fn test_connect_attempts_are_rate_limited() {
    let state = test_state(|_| {});
    let app = routes::app(state, Some(RateLimiter::new(1, Duration::from_secs(10))));

    let request = || {
        Request::builder()
            .uri("/ws/alice")
            .body(Body::empty())
            .unwrap()
    };

    // First attempt passes the limiter (and fails the upgrade, which is fine)
    let first = app.clone().oneshot(request()).await.unwrap();
    assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);

    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(second.headers().contains_key("retry-after"));

    // The budget belongs to the decoded id, not the raw path
    let encoded = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/ws/%61lice")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(encoded.status(), StatusCode::TOO_MANY_REQUESTS);

    // Other client ids have their own budget
    let other = app
        .oneshot(Request::builder().uri("/ws/bob").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_ne!(other.status(), StatusCode::TOO_MANY_REQUESTS);
}

/// Send a raw WebSocket upgrade request and return the response status line
async fn upgrade_status(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "GET {} HTTP/1.1\r\n\
         Host: {}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        path, addr
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = vec![0u8; 1024];
    let n = tokio::time::timeout(WAIT, stream.read(&mut buf))
        .await
        .expect("timed out waiting for response")
        .unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).into_owned();
    response.lines().next().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_invalid_client_id_is_refused_before_upgrade() {
    let state = test_state(|_| {});
    let app = routes::app(state.clone(), None);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let status = upgrade_status(addr, "/ws/%20").await;
    assert!(status.starts_with("HTTP/1.1 400"), "got {:?}", status);

    let too_long = format!("/ws/{}", "a".repeat(200));
    let status = upgrade_status(addr, &too_long).await;
    assert!(status.starts_with("HTTP/1.1 400"), "got {:?}", status);

    // A valid id over the same path upgrades
    let status = upgrade_status(addr, "/ws/alice").await;
    assert!(status.starts_with("HTTP/1.1 101"), "got {:?}", status);

    assert!(state.registry.lookup(" ").await.is_none());
}
