//! Realtime transport: one websocket per session, conversation rooms, push listeners.

use std::{
    collections::HashSet,
    sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ConversationId, Identity, Message, UserId},
    protocol::{ClientFrame, MessagePayload, ServerFrame, UserPayload},
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    error::{ClientError, ClientResult},
    retry::RetryPolicy,
};

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub conversation_id: ConversationId,
    pub message: Message,
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub url: Url,
    pub handshake_timeout: Duration,
    pub retry: RetryPolicy,
}

impl TransportOptions {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

/// Derive the websocket endpoint from the REST base url (`http://host/api` → `ws://host/api/ws`).
pub fn websocket_url(server_url: &str) -> ClientResult<Url> {
    let mut url = Url::parse(server_url)
        .map_err(|err| ClientError::Decode(format!("invalid server url '{server_url}': {err}")))?;
    let scheme = match url.scheme() {
        "ws" | "wss" => return Ok(url),
        "https" => "wss",
        "http" => "ws",
        other => {
            return Err(ClientError::Decode(format!(
                "server url must use http(s) or ws(s), got '{other}'"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| ClientError::Decode(format!("cannot use scheme {scheme} for {server_url}")))?;
    let path = format!("{}/ws", url.path().trim_end_matches('/'));
    url.set_path(&path);
    Ok(url)
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    handlers: Vec<(u64, MessageHandler)>,
}

/// Keeps a message handler registered; dropping it removes exactly that handler.
#[must_use = "dropping the subscription unregisters the handler"]
pub struct MessageSubscription {
    id: u64,
    shared: Weak<TransportShared>,
}

impl MessageSubscription {
    pub fn unsubscribe(self) {}
}

impl Drop for MessageSubscription {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.upgrade() {
            lock(&shared.listeners)
                .handlers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

struct TransportShared {
    options: TransportOptions,
    state: watch::Sender<ConnectionState>,
    /// Bumped on every connect/disconnect; stale connection tasks may not publish state.
    epoch: StdMutex<u64>,
    listeners: StdMutex<ListenerRegistry>,
    rooms: Mutex<HashSet<ConversationId>>,
}

struct ActiveConnection {
    identity: UserId,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    task: JoinHandle<()>,
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct RealtimeTransport {
    shared: Arc<TransportShared>,
    connection: Mutex<Option<ActiveConnection>>,
}

enum ConnectionEnd {
    Closed,
    Lost(String),
}

impl RealtimeTransport {
    pub fn new(options: TransportOptions) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            shared: Arc::new(TransportShared {
                options,
                state,
                epoch: StdMutex::new(0),
                listeners: StdMutex::new(ListenerRegistry::default()),
                rooms: Mutex::new(HashSet::new()),
            }),
            connection: Mutex::new(None),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Open the socket and run the `setup` handshake for `identity`.
    ///
    /// No-op while a live connection for the same identity exists.
    pub async fn connect(&self, identity: &Identity) -> ClientResult<()> {
        let mut connection = self.connection.lock().await;
        if let Some(active) = connection.as_ref() {
            if active.identity == identity.id && !active.task.is_finished() {
                debug!(user_id = %identity.id, "realtime: already connected");
                return Ok(());
            }
            if active.identity != identity.id {
                self.shared.rooms.lock().await.clear();
            }
        }
        connection.take();

        let epoch = self.shared.begin_epoch(ConnectionState::Connecting);
        let socket = match establish(&self.shared, identity).await {
            Ok(socket) => socket,
            Err(err) => {
                self.shared
                    .publish_state(epoch, ConnectionState::Disconnected);
                warn!(user_id = %identity.id, "realtime: connect failed: {err}");
                return Err(err);
            }
        };
        self.shared.publish_state(epoch, ConnectionState::Connected);
        info!(user_id = %identity.id, url = %self.shared.options.url, "realtime: connected");

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.shared),
            epoch,
            identity.clone(),
            socket,
            outbound_rx,
        ));
        *connection = Some(ActiveConnection {
            identity: identity.id.clone(),
            outbound,
            task,
        });
        Ok(())
    }

    pub async fn disconnect(&self) {
        let previous = self.connection.lock().await.take();
        self.shared.begin_epoch(ConnectionState::Disconnected);
        self.shared.rooms.lock().await.clear();
        if let Some(active) = previous {
            info!(user_id = %active.identity, "realtime: disconnected");
        }
    }

    /// Subscribe to pushes for `conversation_id`. Returns false if already joined.
    pub async fn join(&self, conversation_id: &ConversationId) -> ClientResult<bool> {
        let newly_joined = self
            .shared
            .rooms
            .lock()
            .await
            .insert(conversation_id.clone());
        if !newly_joined {
            return Ok(false);
        }

        // Queued frames are flushed once a reconnect finishes; without a live
        // task the room is joined during the next handshake instead.
        if let Some(active) = self.connection.lock().await.as_ref() {
            let _ = active
                .outbound
                .send(ClientFrame::JoinChat(conversation_id.clone()));
        }
        debug!(%conversation_id, "realtime: joined room");
        Ok(true)
    }

    pub async fn joined_rooms(&self) -> Vec<ConversationId> {
        self.shared.rooms.lock().await.iter().cloned().collect()
    }

    /// Tell other participants about a message we just stored through REST.
    pub async fn broadcast_message(&self, message: &Message) -> ClientResult<()> {
        if self.state() != ConnectionState::Connected {
            return Err(ClientError::RealtimeDisconnected);
        }
        let connection = self.connection.lock().await;
        let active = connection
            .as_ref()
            .ok_or(ClientError::RealtimeDisconnected)?;
        active
            .outbound
            .send(ClientFrame::NewMessage(MessagePayload::from(message)))
            .map_err(|_| ClientError::RealtimeDisconnected)
    }

    pub fn on_message<F>(&self, handler: F) -> MessageSubscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let mut registry = lock(&self.shared.listeners);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.handlers.push((id, Arc::new(handler)));
        MessageSubscription {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).handlers.len()
    }
}

impl TransportShared {
    fn begin_epoch(&self, state: ConnectionState) -> u64 {
        let mut epoch = lock(&self.epoch);
        *epoch += 1;
        self.state.send_replace(state);
        *epoch
    }

    fn publish_state(&self, epoch: u64, state: ConnectionState) -> bool {
        let current = lock(&self.epoch);
        if *current != epoch {
            return false;
        }
        self.state.send_replace(state);
        true
    }

    fn handle_text(&self, text: &str) {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                debug!("realtime: ignoring unrecognized frame: {err}");
                return;
            }
        };
        let Some(payload) = frame.into_message() else {
            return;
        };
        let message = Message::from(payload);
        self.dispatch(&InboundMessage {
            conversation_id: message.conversation_id.clone(),
            message,
        });
    }

    fn dispatch(&self, inbound: &InboundMessage) {
        // Handlers run outside the lock so they may drop subscriptions.
        let handlers: Vec<MessageHandler> = lock(&self.listeners)
            .handlers
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(inbound);
        }
    }
}

async fn run_connection(
    shared: Arc<TransportShared>,
    epoch: u64,
    identity: Identity,
    socket: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
) {
    let mut socket = socket;
    loop {
        let reason = match pump(&shared, socket, &mut outbound).await {
            ConnectionEnd::Closed => return,
            ConnectionEnd::Lost(reason) => reason,
        };
        if !shared.publish_state(epoch, ConnectionState::Connecting) {
            return;
        }
        warn!(user_id = %identity.id, %reason, "realtime: connection lost; reconnecting");

        match reconnect(&shared, &identity).await {
            Some(next) => {
                if !shared.publish_state(epoch, ConnectionState::Connected) {
                    return;
                }
                info!(user_id = %identity.id, "realtime: reconnected");
                socket = next;
            }
            None => {
                shared.publish_state(epoch, ConnectionState::Disconnected);
                warn!(user_id = %identity.id, "realtime: giving up after reconnect attempts");
                return;
            }
        }
    }
}

async fn pump(
    shared: &TransportShared,
    socket: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientFrame>,
) -> ConnectionEnd {
    let (mut writer, mut reader) = socket.split();
    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    let _ = writer.send(WsMessage::Close(None)).await;
                    return ConnectionEnd::Closed;
                };
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("realtime: failed to encode outbound frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = writer.send(WsMessage::Text(text)).await {
                    return ConnectionEnd::Lost(format!("send failed: {err}"));
                }
            }
            incoming = reader.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => shared.handle_text(&text),
                Some(Ok(WsMessage::Close(_))) | None => {
                    return ConnectionEnd::Lost("closed by server".into());
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return ConnectionEnd::Lost(format!("receive failed: {err}")),
            }
        }
    }
}

async fn reconnect(shared: &TransportShared, identity: &Identity) -> Option<WsStream> {
    let policy = shared.options.retry;
    for attempt in 0..policy.max_attempts() {
        let delay = policy.delay_for_attempt(attempt);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "realtime: reconnect scheduled");
        tokio::time::sleep(delay).await;
        match establish(shared, identity).await {
            Ok(socket) => return Some(socket),
            Err(err) => warn!(attempt = attempt + 1, "realtime: reconnect attempt failed: {err}"),
        }
    }
    None
}

/// Open a socket, announce `identity`, wait for the ack and re-join known rooms.
async fn establish(shared: &TransportShared, identity: &Identity) -> ClientResult<WsStream> {
    let handshake = async {
        let (mut socket, _) = connect_async(shared.options.url.as_str()).await?;
        send_frame(&mut socket, &ClientFrame::Setup(UserPayload::from(identity))).await?;

        loop {
            match socket.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if matches!(
                        serde_json::from_str::<ServerFrame>(&text),
                        Ok(ServerFrame::Connected)
                    ) {
                        break;
                    }
                    shared.handle_text(&text);
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    return Err(ClientError::RealtimeDisconnected)
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return Err(err.into()),
            }
        }

        let rooms: Vec<ConversationId> = shared.rooms.lock().await.iter().cloned().collect();
        for room in rooms {
            send_frame(&mut socket, &ClientFrame::JoinChat(room)).await?;
        }
        Ok::<_, ClientError>(socket)
    };

    tokio::time::timeout(shared.options.handshake_timeout, handshake)
        .await
        .map_err(|_| ClientError::Network("realtime handshake timed out".into()))?
}

async fn send_frame(socket: &mut WsStream, frame: &ClientFrame) -> ClientResult<()> {
    let text = serde_json::to_string(frame)?;
    socket.send(WsMessage::Text(text)).await?;
    Ok(())
}

pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[path = "tests/realtime_tests.rs"]
mod tests;
