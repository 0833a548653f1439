//! Authenticated request client.
//!
//! Every protected call carries the current access token. A 401 triggers the
//! refresh protocol once per request: concurrent triggers share one in-flight
//! refresh, then each request is replayed exactly once with the renewed token.

use std::{sync::Arc, time::Duration};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use reqwest::{Client, Method, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{Conversation, ConversationId, Identity, ItemId, Message, Session, UserId},
    error::ApiError,
    protocol::{
        AuthResponse, ConversationPayload, LoginRequest, MessagePayload, OpenChatRequest,
        RefreshRequest, RefreshResponse, RegisterRequest, SendMessageRequest,
    },
};
use storage::CredentialStore;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{ClientError, ClientResult};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Auth {
    /// Login and registration; never carries a bearer token.
    Public,
    Protected,
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    auth: Auth,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            auth: Auth::Protected,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn public(mut self) -> Self {
        self.auth = Auth::Public;
        self
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> ClientResult<Self> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Started(Identity),
    Refreshed,
    /// Refresh was rejected; credentials are gone and the user must sign in again.
    Terminated { reason: String },
    LoggedOut,
}

#[derive(Debug, Clone)]
pub struct ApiClientOptions {
    pub base_url: String,
    pub request_timeout: Duration,
}

impl ApiClientOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
enum RefreshFailure {
    Rejected(String),
    Network(String),
}

impl From<RefreshFailure> for ClientError {
    fn from(value: RefreshFailure) -> Self {
        match value {
            RefreshFailure::Rejected(reason) => ClientError::AuthRejected(reason),
            RefreshFailure::Network(reason) => ClientError::Network(reason),
        }
    }
}

type SharedRefresh = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

struct SessionState {
    session: Option<Session>,
    /// Bumped whenever a session is installed or dropped; a refresh only
    /// applies to the generation it started in.
    generation: u64,
    inflight_refresh: Option<SharedRefresh>,
}

impl SessionState {
    fn replace(&mut self, session: Option<Session>) -> Option<Session> {
        self.generation += 1;
        self.inflight_refresh = None;
        std::mem::replace(&mut self.session, session)
    }
}

struct ApiInner {
    http: Client,
    base_url: String,
    credentials: Arc<dyn CredentialStore>,
    /// Held across every credential write; always taken before `state`.
    persist: Mutex<()>,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ApiInner>,
}

impl ApiClient {
    pub fn new(
        options: ApiClientOptions,
        credentials: Arc<dyn CredentialStore>,
    ) -> ClientResult<Self> {
        let http = Client::builder()
            .timeout(options.request_timeout)
            .build()
            .map_err(ClientError::from)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(ApiInner {
                http,
                base_url: options.base_url.trim_end_matches('/').to_string(),
                credentials,
                persist: Mutex::new(()),
                state: Mutex::new(SessionState {
                    session: None,
                    generation: 0,
                    inflight_refresh: None,
                }),
                events,
            }),
        })
    }

    pub fn subscribe_session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn session(&self) -> Option<Session> {
        self.inner.state.lock().await.session.clone()
    }

    pub async fn identity(&self) -> Option<Identity> {
        self.session().await.map(|session| session.identity)
    }

    /// Resume a session persisted by an earlier run.
    pub async fn restore(&self) -> ClientResult<Option<Identity>> {
        let _persist = self.inner.persist.lock().await;
        let stored = self
            .inner
            .credentials
            .load()
            .await
            .map_err(|source| ClientError::Storage { source })?;
        let Some(session) = stored else {
            debug!("auth: no persisted session");
            return Ok(None);
        };
        let identity = session.identity.clone();
        self.inner.state.lock().await.replace(Some(session));
        info!(user_id = %identity.id, "auth: session restored");
        let _ = self
            .inner
            .events
            .send(SessionEvent::Started(identity.clone()));
        Ok(Some(identity))
    }

    pub async fn login(&self, email: &str, password: &str) -> ClientResult<Identity> {
        let request = ApiRequest::post("/auth/login").public().json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;
        let response: AuthResponse = self.request(&request).await?;
        self.start_session(response).await
    }

    pub async fn register(
        &self,
        name: &str,
        email: &str,
        password: &str,
    ) -> ClientResult<Identity> {
        let request = ApiRequest::post("/auth/register")
            .public()
            .json(&RegisterRequest {
                name: name.to_string(),
                email: email.to_string(),
                password: password.to_string(),
            })?;
        let response: AuthResponse = self.request(&request).await?;
        self.start_session(response).await
    }

    pub async fn logout(&self) -> ClientResult<()> {
        let _persist = self.inner.persist.lock().await;
        let previous = self.inner.state.lock().await.replace(None);
        self.inner
            .credentials
            .clear()
            .await
            .map_err(|source| ClientError::Storage { source })?;
        if let Some(session) = previous {
            info!(user_id = %session.identity.id, "auth: logged out");
        }
        let _ = self.inner.events.send(SessionEvent::LoggedOut);
        Ok(())
    }

    async fn start_session(&self, response: AuthResponse) -> ClientResult<Identity> {
        let session = Session {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            identity: Identity::from(response.user),
        };
        let _persist = self.inner.persist.lock().await;
        self.inner
            .credentials
            .save(&session)
            .await
            .map_err(|source| ClientError::Storage { source })?;
        let identity = session.identity.clone();
        self.inner.state.lock().await.replace(Some(session));
        info!(user_id = %identity.id, "auth: session started");
        let _ = self
            .inner
            .events
            .send(SessionEvent::Started(identity.clone()));
        Ok(identity)
    }

    /// Run `request` and decode its JSON body.
    pub async fn request<T: DeserializeOwned>(&self, request: &ApiRequest) -> ClientResult<T> {
        let response = self.execute(request).await?;
        let body = response.bytes().await?;
        if body.is_empty() {
            return serde_json::from_slice(b"null").map_err(ClientError::from);
        }
        serde_json::from_slice(&body).map_err(ClientError::from)
    }

    /// Run `request`, applying the refresh-and-retry-once protocol for protected endpoints.
    pub async fn execute(&self, request: &ApiRequest) -> ClientResult<Response> {
        let mut retried = false;
        loop {
            let token = match request.auth {
                Auth::Public => None,
                Auth::Protected => Some(self.inner.current_access_token().await?),
            };
            let response = self.inner.send(request, token.as_deref()).await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }

            if let (StatusCode::UNAUTHORIZED, Some(stale)) = (status, token) {
                if retried {
                    warn!(
                        path = %request.path,
                        "auth: request rejected again after refresh; giving up"
                    );
                    return Err(ClientError::AuthExpired);
                }
                retried = true;
                debug!(path = %request.path, "auth: access token rejected; refreshing");
                self.inner.refresh_after(&stale).await?;
                continue;
            }

            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::from_status(status, &body));
        }
    }

    pub async fn user_chats(&self) -> ClientResult<Vec<Conversation>> {
        let payloads: Vec<ConversationPayload> =
            self.request(&ApiRequest::get("/chat/user-chats")).await?;
        Ok(payloads.into_iter().map(Conversation::from).collect())
    }

    pub async fn chat_history(&self, conversation_id: &ConversationId) -> ClientResult<Vec<Message>> {
        let payloads: Vec<MessagePayload> = self
            .request(&ApiRequest::get(format!("/chat/{conversation_id}")))
            .await?;
        Ok(payloads.into_iter().map(Message::from).collect())
    }

    /// Start a conversation about `item_id` with `user_id`, or get the existing one.
    pub async fn open_chat(&self, user_id: &UserId, item_id: &ItemId) -> ClientResult<Conversation> {
        let request = ApiRequest::post("/chat").json(&OpenChatRequest {
            user_id: user_id.clone(),
            item_id: item_id.clone(),
        })?;
        let payload: ConversationPayload = self.request(&request).await?;
        Ok(payload.into())
    }

    pub async fn send_message(
        &self,
        conversation_id: &ConversationId,
        content: &str,
    ) -> ClientResult<Message> {
        let request = ApiRequest::post("/chat/message").json(&SendMessageRequest {
            chat_id: conversation_id.clone(),
            content: content.to_string(),
        })?;
        let payload: MessagePayload = self.request(&request).await?;
        Ok(payload.into())
    }
}

impl ApiInner {
    async fn current_access_token(&self) -> ClientResult<String> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|session| session.access_token.clone())
            .ok_or_else(|| ClientError::AuthRejected("no active session".into()))
    }

    async fn send(&self, request: &ApiRequest, token: Option<&str>) -> ClientResult<Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = self.http.request(request.method.clone(), url);
        if let Some(token) = token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder
            .send()
            .await
            .map_err(|err| ClientError::Network(err.to_string()))
    }

    /// Wait until the token that just failed (`stale`) has been replaced.
    ///
    /// Joins the in-flight refresh when there is one; starts it otherwise.
    async fn refresh_after(self: &Arc<Self>, stale: &str) -> ClientResult<()> {
        let refresh = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.clone() else {
                return Err(ClientError::AuthRejected("no active session".into()));
            };
            if session.access_token != stale {
                debug!("auth: token already rotated by a concurrent refresh");
                return Ok(());
            }
            match &state.inflight_refresh {
                Some(inflight) => inflight.clone(),
                None => {
                    let refresh = self.spawn_refresh(session, state.generation);
                    state.inflight_refresh = Some(refresh.clone());
                    refresh
                }
            }
        };

        refresh.await.map(|_| ()).map_err(ClientError::from)
    }

    fn spawn_refresh(self: &Arc<Self>, session: Session, generation: u64) -> SharedRefresh {
        let inner = Arc::clone(self);
        // Own task so the refresh completes even if every waiter is cancelled.
        let task = tokio::spawn(async move { inner.run_refresh(session, generation).await });
        async move {
            task.await.unwrap_or_else(|err| {
                Err(RefreshFailure::Network(format!("refresh task failed: {err}")))
            })
        }
        .boxed()
        .shared()
    }

    async fn run_refresh(
        &self,
        session: Session,
        generation: u64,
    ) -> Result<String, RefreshFailure> {
        info!(user_id = %session.identity.id, "auth: refreshing access token");
        let outcome = self.call_refresh(&session).await;

        // Credential I/O happens under `persist`, never under `state`.
        let _persist = self.persist.lock().await;
        let still_current = {
            let mut state = self.state.lock().await;
            let still_current = state.generation == generation;
            if still_current {
                state.inflight_refresh = None;
                match &outcome {
                    Ok(access_token) => {
                        state.session = Some(session.with_access_token(access_token));
                    }
                    Err(RefreshFailure::Rejected(_)) => {
                        state.replace(None);
                    }
                    Err(RefreshFailure::Network(_)) => {}
                }
            }
            still_current
        };

        match outcome {
            Ok(access_token) => {
                if still_current {
                    let renewed = session.with_access_token(&access_token);
                    if let Err(err) = self.credentials.save(&renewed).await {
                        warn!("auth: failed to persist refreshed token: {err:#}");
                    }
                    let _ = self.events.send(SessionEvent::Refreshed);
                    info!(user_id = %session.identity.id, "auth: access token refreshed");
                }
                Ok(access_token)
            }
            Err(RefreshFailure::Rejected(reason)) => {
                if still_current {
                    if let Err(err) = self.credentials.clear().await {
                        warn!("auth: failed to clear credentials after rejected refresh: {err:#}");
                    }
                    warn!(user_id = %session.identity.id, %reason, "auth: refresh rejected; session terminated");
                    let _ = self.events.send(SessionEvent::Terminated {
                        reason: reason.clone(),
                    });
                } else {
                    debug!(%reason, "auth: refresh for a replaced session rejected; ignored");
                }
                Err(RefreshFailure::Rejected(reason))
            }
            Err(RefreshFailure::Network(reason)) => {
                warn!(%reason, "auth: refresh failed in transport; session kept");
                Err(RefreshFailure::Network(reason))
            }
        }
    }

    async fn call_refresh(&self, session: &Session) -> Result<String, RefreshFailure> {
        let response = self
            .http
            .post(format!("{}/auth/refresh", self.base_url))
            .bearer_auth(&session.access_token)
            .json(&RefreshRequest {
                token: session.refresh_token.clone(),
            })
            .send()
            .await
            .map_err(|err| RefreshFailure::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RefreshFailure::Rejected(format!(
                "refresh returned {}: {}",
                status.as_u16(),
                ApiError::from_body(&body).message
            )));
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|err| RefreshFailure::Rejected(format!("invalid refresh response: {err}")))?;
        if body.access_token.is_empty() {
            return Err(RefreshFailure::Rejected("refresh returned an empty token".into()));
        }
        Ok(body.access_token)
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
