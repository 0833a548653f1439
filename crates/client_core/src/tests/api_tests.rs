use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response as HttpResponse},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use shared::domain::MessageId;
use async_trait::async_trait;
use storage::MemoryCredentialStore;
use tokio::{net::TcpListener, sync::Notify};

const REFRESH_TOKEN: &str = "refresh-1";

#[derive(Clone)]
struct Backend {
    valid_token: Arc<Mutex<String>>,
    refresh_calls: Arc<AtomicUsize>,
    chat_calls: Arc<AtomicUsize>,
    locked_calls: Arc<AtomicUsize>,
    reject_refresh: Arc<AtomicBool>,
    login_headers: Arc<Mutex<Vec<Option<String>>>>,
}

impl Backend {
    fn new(valid_token: &str) -> Self {
        Self {
            valid_token: Arc::new(Mutex::new(valid_token.to_string())),
            refresh_calls: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            locked_calls: Arc::new(AtomicUsize::new(0)),
            reject_refresh: Arc::new(AtomicBool::new(false)),
            login_headers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    async fn authorized(&self, headers: &HeaderMap) -> bool {
        let expected = self.valid_token.lock().await.clone();
        bearer(headers).as_deref() == Some(expected.as_str())
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

fn unauthorized() -> HttpResponse {
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "message": "jwt expired" })),
    )
        .into_response()
}

fn user_json() -> serde_json::Value {
    json!({ "_id": "u1", "email": "ana@example.com", "name": "Ana", "role": "user" })
}

async fn handle_login(State(backend): State<Backend>, headers: HeaderMap) -> HttpResponse {
    backend
        .login_headers
        .lock()
        .await
        .push(headers.get(AUTHORIZATION).map(|v| v.to_str().unwrap_or_default().to_string()));
    Json(json!({
        "accessToken": "access-1",
        "refreshToken": REFRESH_TOKEN,
        "user": user_json(),
    }))
    .into_response()
}

async fn handle_refresh(
    State(backend): State<Backend>,
    Json(body): Json<RefreshRequest>,
) -> HttpResponse {
    backend.refresh_calls.fetch_add(1, Ordering::SeqCst);
    // Keep the refresh window open long enough for concurrent callers to pile up.
    tokio::time::sleep(Duration::from_millis(100)).await;
    if backend.reject_refresh.load(Ordering::SeqCst) || body.token != REFRESH_TOKEN {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "message": "refresh token revoked" })),
        )
            .into_response();
    }
    *backend.valid_token.lock().await = "access-2".to_string();
    Json(json!({ "accessToken": "access-2" })).into_response()
}

async fn handle_user_chats(State(backend): State<Backend>, headers: HeaderMap) -> HttpResponse {
    backend.chat_calls.fetch_add(1, Ordering::SeqCst);
    if !backend.authorized(&headers).await {
        return unauthorized();
    }
    Json(json!([{
        "_id": "c1",
        "participants": [
            { "_id": "u1", "name": "Ana" },
            { "_id": "u2", "name": "Ben", "avatar": "avatars/ben.png" }
        ],
        "item": { "_id": "item-9" },
        "latestMessage": { "content": "is it still available?" },
        "updatedAt": "2024-05-01T10:00:00Z"
    }]))
    .into_response()
}

async fn handle_history(
    State(backend): State<Backend>,
    Path(chat_id): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    if chat_id == "locked" {
        backend.locked_calls.fetch_add(1, Ordering::SeqCst);
        return unauthorized();
    }
    if !backend.authorized(&headers).await {
        return unauthorized();
    }
    Json(json!([{
        "_id": "m1",
        "chat": chat_id,
        "sender": { "_id": "u2", "name": "Ben" },
        "content": "hello",
        "createdAt": "2024-05-01T09:59:00Z"
    }]))
    .into_response()
}

async fn handle_send(
    State(backend): State<Backend>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> HttpResponse {
    if !backend.authorized(&headers).await {
        return unauthorized();
    }
    if body.content.trim().is_empty() {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "message": "content is required" })),
        )
            .into_response();
    }
    Json(json!({
        "_id": "m-new",
        "chat": { "_id": body.chat_id },
        "sender": "u1",
        "content": body.content,
        "createdAt": "2024-05-01T10:10:00Z"
    }))
    .into_response()
}

async fn spawn_backend(valid_token: &str) -> Result<(String, Backend)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let backend = Backend::new(valid_token);
    let app = Router::new()
        .route("/auth/login", post(handle_login))
        .route("/auth/refresh", post(handle_refresh))
        .route("/chat/user-chats", get(handle_user_chats))
        .route("/chat/message", post(handle_send))
        .route("/chat/:chat_id", get(handle_history))
        .with_state(backend.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), backend))
}

fn session(access_token: &str) -> Session {
    Session {
        access_token: access_token.to_string(),
        refresh_token: REFRESH_TOKEN.to_string(),
        identity: Identity {
            id: UserId::new("u1"),
            email: "ana@example.com".into(),
            display_name: "Ana".into(),
            roles: vec!["user".into()],
        },
    }
}

/// Credential store whose `clear` stalls, widening the window in which a
/// rejected refresh is still wiping the old session.
#[derive(Default)]
struct SlowClearStore {
    inner: MemoryCredentialStore,
    clear_started: Notify,
}

#[async_trait]
impl CredentialStore for SlowClearStore {
    async fn load(&self) -> anyhow::Result<Option<Session>> {
        self.inner.load().await
    }

    async fn save(&self, session: &Session) -> anyhow::Result<()> {
        self.inner.save(session).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.clear_started.notify_one();
        tokio::time::sleep(Duration::from_millis(300)).await;
        self.inner.clear().await
    }
}

async fn wait_for_refresh_call(backend: &Backend) {
    for _ in 0..100 {
        if backend.refresh_calls.load(Ordering::SeqCst) > 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("refresh never reached the backend");
}

async fn restored_client(
    base_url: &str,
    access_token: &str,
) -> (ApiClient, Arc<MemoryCredentialStore>) {
    let credentials = Arc::new(MemoryCredentialStore::with_session(session(access_token)));
    let client =
        ApiClient::new(ApiClientOptions::new(base_url), credentials.clone()).expect("client");
    client
        .restore()
        .await
        .expect("restore")
        .expect("persisted session");
    (client, credentials)
}

#[tokio::test]
async fn concurrent_expired_requests_share_one_refresh() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    let (client, credentials) = restored_client(&base_url, "access-1").await;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.user_chats().await })
        })
        .collect();
    for task in tasks {
        let chats = task.await.expect("join").expect("user chats");
        assert_eq!(chats.len(), 1);
        assert_eq!(chats[0].item_id, Some(ItemId::new("item-9")));
    }

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    let stored = credentials.load().await.expect("load").expect("session");
    assert_eq!(stored.access_token, "access-2");
    assert_eq!(stored.refresh_token, REFRESH_TOKEN);
    assert_eq!(
        client.session().await.map(|s| s.access_token),
        Some("access-2".to_string())
    );
}

#[tokio::test]
async fn renewed_token_is_used_without_another_refresh() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    let (client, _credentials) = restored_client(&base_url, "access-1").await;
    let mut events = client.subscribe_session_events();

    client.user_chats().await.expect("first call refreshes");
    client.user_chats().await.expect("second call uses renewed token");

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(backend.chat_calls.load(Ordering::SeqCst), 3);
    assert_eq!(events.recv().await.expect("event"), SessionEvent::Refreshed);
}

#[tokio::test]
async fn second_unauthorized_response_is_terminal() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    let (client, _credentials) = restored_client(&base_url, "access-1").await;

    let err = client
        .chat_history(&ConversationId::new("locked"))
        .await
        .expect_err("must fail");

    assert!(matches!(err, ClientError::AuthExpired), "unexpected error: {err:?}");
    assert_eq!(backend.locked_calls.load(Ordering::SeqCst), 2);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(client.session().await.is_some());
}

#[tokio::test]
async fn rejected_refresh_terminates_the_session() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    backend.reject_refresh.store(true, Ordering::SeqCst);
    let (client, credentials) = restored_client(&base_url, "access-1").await;
    let mut events = client.subscribe_session_events();

    let err = client.user_chats().await.expect_err("refresh rejected");
    assert!(err.is_session_terminated(), "unexpected error: {err:?}");
    assert!(credentials.load().await.expect("load").is_none());
    assert!(client.session().await.is_none());
    match events.recv().await.expect("event") {
        SessionEvent::Terminated { reason } => assert!(reason.contains("401"), "{reason}"),
        other => panic!("unexpected event: {other:?}"),
    }

    let chat_calls = backend.chat_calls.load(Ordering::SeqCst);
    let err = client.user_chats().await.expect_err("no session");
    assert!(matches!(err, ClientError::AuthRejected(_)));
    assert_eq!(backend.chat_calls.load(Ordering::SeqCst), chat_calls);
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn login_is_public_and_starts_a_session() {
    let (base_url, backend) = spawn_backend("access-1").await.expect("spawn backend");
    let credentials = Arc::new(MemoryCredentialStore::new());
    let client =
        ApiClient::new(ApiClientOptions::new(&base_url), credentials.clone()).expect("client");

    let identity = client
        .login("ana@example.com", "hunter2")
        .await
        .expect("login");

    assert_eq!(identity.id, UserId::new("u1"));
    assert_eq!(identity.roles, vec!["user".to_string()]);
    assert_eq!(*backend.login_headers.lock().await, vec![None]);
    let stored = credentials.load().await.expect("load").expect("session");
    assert_eq!(stored.access_token, "access-1");

    let chats = client.user_chats().await.expect("protected call");
    assert_eq!(chats[0].last_message_text, "is it still available?");
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn protected_request_without_session_never_hits_the_network() {
    let (base_url, backend) = spawn_backend("access-1").await.expect("spawn backend");
    let client = ApiClient::new(
        ApiClientOptions::new(&base_url),
        Arc::new(MemoryCredentialStore::new()),
    )
    .expect("client");

    let err = client.user_chats().await.expect_err("no session");

    assert!(matches!(err, ClientError::AuthRejected(_)));
    assert_eq!(backend.chat_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn validation_errors_pass_through_untouched() {
    let (base_url, backend) = spawn_backend("access-1").await.expect("spawn backend");
    let (client, _credentials) = restored_client(&base_url, "access-1").await;

    let err = client
        .send_message(&ConversationId::new("c1"), "   ")
        .await
        .expect_err("empty content");

    match err {
        ClientError::Validation { status, message } => {
            assert_eq!(status, 422);
            assert_eq!(message, "content is required");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn send_message_maps_wire_payload() {
    let (base_url, _backend) = spawn_backend("access-1").await.expect("spawn backend");
    let (client, _credentials) = restored_client(&base_url, "access-1").await;

    let message = client
        .send_message(&ConversationId::new("c42"), "Hello")
        .await
        .expect("send");

    assert_eq!(message.id, MessageId::new("m-new"));
    assert_eq!(message.conversation_id, ConversationId::new("c42"));
    assert_eq!(message.sender_id, UserId::new("u1"));
    assert_eq!(message.text, "Hello");
}

#[tokio::test]
async fn logout_clears_credentials() {
    let (base_url, _backend) = spawn_backend("access-1").await.expect("spawn backend");
    let (client, credentials) = restored_client(&base_url, "access-1").await;
    let mut events = client.subscribe_session_events();

    client.logout().await.expect("logout");

    assert!(client.session().await.is_none());
    assert!(credentials.load().await.expect("load").is_none());
    assert_eq!(events.recv().await.expect("event"), SessionEvent::LoggedOut);
}

#[tokio::test]
async fn login_while_rejected_refresh_clears_keeps_the_new_session() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    backend.reject_refresh.store(true, Ordering::SeqCst);
    let credentials = Arc::new(SlowClearStore::default());
    credentials.save(&session("stale")).await.expect("seed store");
    let client =
        ApiClient::new(ApiClientOptions::new(&base_url), credentials.clone()).expect("client");
    client.restore().await.expect("restore").expect("persisted session");
    let mut events = client.subscribe_session_events();

    let failing = {
        let client = client.clone();
        tokio::spawn(async move { client.user_chats().await })
    };
    credentials.clear_started.notified().await;
    let identity = client
        .login("ana@example.com", "hunter2")
        .await
        .expect("login");

    let err = failing.await.expect("join").expect_err("refresh rejected");
    assert!(err.is_session_terminated(), "unexpected error: {err:?}");
    assert_eq!(
        client.session().await.map(|s| s.access_token),
        Some("access-1".to_string())
    );
    let stored = credentials.load().await.expect("load").expect("durable session");
    assert_eq!(stored.access_token, "access-1");
    assert!(matches!(
        events.recv().await.expect("event"),
        SessionEvent::Terminated { .. }
    ));
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::Started(identity)
    );
}

#[tokio::test]
async fn rejected_refresh_for_a_replaced_session_is_ignored() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    backend.reject_refresh.store(true, Ordering::SeqCst);
    let (client, credentials) = restored_client(&base_url, "stale").await;
    let mut events = client.subscribe_session_events();

    let failing = {
        let client = client.clone();
        tokio::spawn(async move { client.user_chats().await })
    };
    wait_for_refresh_call(&backend).await;
    let identity = client
        .login("ana@example.com", "hunter2")
        .await
        .expect("login");

    failing.await.expect("join").expect_err("refresh rejected");
    assert_eq!(
        client.session().await.map(|s| s.access_token),
        Some("access-1".to_string())
    );
    let stored = credentials.load().await.expect("load").expect("durable session");
    assert_eq!(stored.access_token, "access-1");
    assert_eq!(
        events.recv().await.expect("event"),
        SessionEvent::Started(identity)
    );
    assert!(events.try_recv().is_err(), "old refresh leaked an event");
}

#[tokio::test]
async fn refresh_network_failure_keeps_the_session() {
    let (base_url, backend) = spawn_backend("access-2").await.expect("spawn backend");
    let credentials = Arc::new(MemoryCredentialStore::with_session(session("access-1")));
    let options = ApiClientOptions {
        request_timeout: Duration::from_millis(60),
        ..ApiClientOptions::new(&base_url)
    };
    let client = ApiClient::new(options, credentials.clone()).expect("client");
    client.restore().await.expect("restore").expect("persisted session");
    let mut events = client.subscribe_session_events();

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.user_chats().await })
        })
        .collect();
    for task in tasks {
        let err = task.await.expect("join").expect_err("refresh timed out");
        assert!(matches!(err, ClientError::Network(_)), "unexpected error: {err:?}");
    }

    assert_eq!(backend.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        client.session().await.map(|s| s.access_token),
        Some("access-1".to_string())
    );
    let stored = credentials.load().await.expect("load").expect("durable session");
    assert_eq!(stored.access_token, "access-1");
    assert!(events.try_recv().is_err(), "no session event expected");
}
