//! Conversation synchronizer.
//!
//! Reconciles REST history with realtime pushes. Both paths feed the same
//! [`ConversationStore`], which drops duplicates by message id, so a message
//! we sent and its echo from the server are cached once.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
};

use async_trait::async_trait;
use shared::domain::{Conversation, ConversationId, Identity, ItemId, Message, UserId};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    api::{ApiClient, SessionEvent},
    error::{ClientError, ClientResult},
    realtime::{lock, InboundMessage, MessageSubscription, RealtimeTransport},
    store::{AppendOutcome, ConversationStore},
};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    #[default]
    Idle,
    /// History for the conversation is still loading.
    Selecting(ConversationId),
    Active(ConversationId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    ConversationsUpdated,
    MessageAppended {
        conversation_id: ConversationId,
        message: Message,
    },
    SelectionChanged(Selection),
    SendFailed {
        conversation_id: ConversationId,
        error: String,
    },
    SessionTerminated {
        reason: String,
    },
}

/// Read/command surface for a UI layer.
#[async_trait]
pub trait ChatHandle: Send + Sync {
    async fn start(&self) -> ClientResult<()>;
    async fn load_conversations(&self) -> ClientResult<usize>;
    async fn select(&self, conversation_id: &ConversationId) -> ClientResult<()>;
    async fn open_conversation(
        &self,
        user_id: &UserId,
        item_id: &ItemId,
    ) -> ClientResult<Conversation>;
    async fn send(&self, conversation_id: &ConversationId, text: &str) -> ClientResult<Message>;
    async fn send_draft(&self, conversation_id: &ConversationId) -> ClientResult<Option<Message>>;
    async fn logout(&self) -> ClientResult<()>;
    fn set_draft(&self, conversation_id: &ConversationId, text: &str);
    fn draft(&self, conversation_id: &ConversationId) -> Option<String>;
    fn conversations(&self) -> Vec<Conversation>;
    fn messages(&self, conversation_id: &ConversationId) -> Vec<Message>;
    fn selection(&self) -> Selection;
    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent>;
}

#[derive(Default)]
struct SelectionState {
    current: Selection,
    epoch: u64,
}

struct SyncInner {
    api: ApiClient,
    transport: Arc<RealtimeTransport>,
    store: StdMutex<ConversationStore>,
    selection: StdMutex<SelectionState>,
    drafts: StdMutex<HashMap<ConversationId, String>>,
    history_gates: Mutex<HashMap<ConversationId, Arc<Mutex<()>>>>,
    /// Bumped on teardown; results of requests issued before it are discarded.
    generation: AtomicU64,
    reload_pending: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
}

pub struct ConversationSynchronizer {
    inner: Arc<SyncInner>,
    subscription: StdMutex<Option<MessageSubscription>>,
    session_watch: StdMutex<Option<JoinHandle<()>>>,
}

impl ConversationSynchronizer {
    pub fn new(api: ApiClient, transport: Arc<RealtimeTransport>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(SyncInner {
                api,
                transport,
                store: StdMutex::new(ConversationStore::new()),
                selection: StdMutex::new(SelectionState::default()),
                drafts: StdMutex::new(HashMap::new()),
                history_gates: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                reload_pending: AtomicBool::new(false),
                events,
            }),
            subscription: StdMutex::new(None),
            session_watch: StdMutex::new(None),
        }
    }

    pub fn api(&self) -> &ApiClient {
        &self.inner.api
    }

    pub fn transport(&self) -> &Arc<RealtimeTransport> {
        &self.inner.transport
    }

    pub fn has_history(&self, conversation_id: &ConversationId) -> bool {
        lock(&self.inner.store).has_history(conversation_id)
    }

    fn install_listener(&self) {
        let weak: Weak<SyncInner> = Arc::downgrade(&self.inner);
        let subscription = self.inner.transport.on_message(move |inbound| {
            if let Some(inner) = weak.upgrade() {
                inner.apply_push(inbound);
            }
        });
        // Replacing the old subscription drops it, which unregisters its handler.
        *lock(&self.subscription) = Some(subscription);
    }

    fn install_session_watch(&self) {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.api.subscribe_session_events();
        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Terminated { reason }) => {
                        let Some(inner) = weak.upgrade() else {
                            return;
                        };
                        inner.teardown().await;
                        let _ = inner.events.send(SyncEvent::SessionTerminated { reason });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: session events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        if let Some(previous) = lock(&self.session_watch).replace(task) {
            previous.abort();
        }
    }
}

impl Drop for ConversationSynchronizer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.session_watch).take() {
            task.abort();
        }
    }
}

#[async_trait]
impl ChatHandle for ConversationSynchronizer {
    /// Connect realtime for the signed-in identity and load the conversation list.
    ///
    /// A realtime failure is logged and start-up continues over REST only.
    async fn start(&self) -> ClientResult<()> {
        let identity: Identity = self
            .inner
            .api
            .identity()
            .await
            .ok_or_else(|| ClientError::AuthRejected("no active session".into()))?;

        self.install_session_watch();
        self.install_listener();
        if let Err(err) = self.inner.transport.connect(&identity).await {
            warn!(user_id = %identity.id, "sync: realtime unavailable, continuing without pushes: {err}");
        }

        let count = self.load_conversations().await?;
        info!(user_id = %identity.id, conversations = count, "sync: started");
        Ok(())
    }

    async fn load_conversations(&self) -> ClientResult<usize> {
        self.inner.reload().await
    }

    /// Make `conversation_id` the focused conversation, fetching its history once.
    async fn select(&self, conversation_id: &ConversationId) -> ClientResult<()> {
        let inner = &self.inner;
        let Some(epoch) = inner.begin_selection(conversation_id) else {
            return Ok(());
        };

        inner.transport.join(conversation_id).await?;

        match inner.ensure_history(conversation_id).await {
            Ok(()) => {
                if !inner.finish_selection(epoch, conversation_id) {
                    debug!(%conversation_id, "sync: selection moved on before history loaded");
                }
                Ok(())
            }
            Err(err) => {
                inner.abandon_selection(epoch);
                warn!(%conversation_id, "sync: failed to load history: {err}");
                Err(err)
            }
        }
    }

    async fn open_conversation(
        &self,
        user_id: &UserId,
        item_id: &ItemId,
    ) -> ClientResult<Conversation> {
        let generation = self.inner.generation();
        let conversation = self.inner.api.open_chat(user_id, item_id).await?;
        if self.inner.generation() == generation {
            lock(&self.inner.store).upsert_conversation(conversation.clone());
            let _ = self.inner.events.send(SyncEvent::ConversationsUpdated);
        }
        self.select(&conversation.id).await?;
        Ok(conversation)
    }

    async fn send(&self, conversation_id: &ConversationId, text: &str) -> ClientResult<Message> {
        let inner = &self.inner;
        let generation = inner.generation();
        let message = match inner.api.send_message(conversation_id, text).await {
            Ok(message) => message,
            Err(err) => {
                warn!(%conversation_id, "sync: send failed: {err}");
                let _ = inner.events.send(SyncEvent::SendFailed {
                    conversation_id: conversation_id.clone(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        if inner.generation() == generation && !inner.accept(conversation_id, message.clone()) {
            inner.request_reload();
        }
        if let Err(err) = inner.transport.broadcast_message(&message).await {
            warn!(%conversation_id, message_id = %message.id, "sync: realtime hint not sent: {err}");
        }
        Ok(message)
    }

    /// Send the buffered draft. It is cleared only after the backend accepted it.
    async fn send_draft(&self, conversation_id: &ConversationId) -> ClientResult<Option<Message>> {
        let Some(text) = self.draft(conversation_id) else {
            return Ok(None);
        };
        let message = self.send(conversation_id, &text).await?;

        let mut drafts = lock(&self.inner.drafts);
        if drafts.get(conversation_id) == Some(&text) {
            drafts.remove(conversation_id);
        }
        Ok(Some(message))
    }

    async fn logout(&self) -> ClientResult<()> {
        let result = self.inner.api.logout().await;
        self.inner.teardown().await;
        result
    }

    fn set_draft(&self, conversation_id: &ConversationId, text: &str) {
        let mut drafts = lock(&self.inner.drafts);
        if text.is_empty() {
            drafts.remove(conversation_id);
        } else {
            drafts.insert(conversation_id.clone(), text.to_string());
        }
    }

    fn draft(&self, conversation_id: &ConversationId) -> Option<String> {
        lock(&self.inner.drafts).get(conversation_id).cloned()
    }

    fn conversations(&self) -> Vec<Conversation> {
        lock(&self.inner.store).conversations().to_vec()
    }

    fn messages(&self, conversation_id: &ConversationId) -> Vec<Message> {
        lock(&self.inner.store).messages(conversation_id).to_vec()
    }

    fn selection(&self) -> Selection {
        lock(&self.inner.selection).current.clone()
    }

    fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }
}

impl SyncInner {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    async fn reload(&self) -> ClientResult<usize> {
        let generation = self.generation();
        self.reload_pending.store(false, Ordering::SeqCst);
        let conversations = self.api.user_chats().await?;
        let count = conversations.len();
        if self.generation() != generation {
            debug!("sync: discarding conversation list from a previous session");
            return Ok(count);
        }
        lock(&self.store).set_conversations(conversations);
        self.emit(SyncEvent::ConversationsUpdated);
        Ok(count)
    }

    /// Coalesces reload requests from the push path into one background fetch.
    fn request_reload(self: &Arc<Self>) {
        if self.reload_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = inner.reload().await {
                warn!("sync: conversation list reload failed: {err}");
            }
        });
    }

    fn apply_push(self: &Arc<Self>, inbound: &InboundMessage) {
        debug!(
            conversation_id = %inbound.conversation_id,
            message_id = %inbound.message.id,
            "sync: push received"
        );
        if !self.accept(&inbound.conversation_id, inbound.message.clone()) {
            self.request_reload();
        }
    }

    /// Append through the dedup path and bump recency. False if the conversation is unknown.
    fn accept(&self, conversation_id: &ConversationId, message: Message) -> bool {
        let mut store = lock(&self.store);
        let outcome = store.append_message(conversation_id, message.clone());
        let known = store.touch_conversation(conversation_id, &message.text, message.created_at);
        drop(store);

        if outcome == AppendOutcome::Duplicate {
            debug!(%conversation_id, message_id = %message.id, "sync: duplicate message ignored");
            return known;
        }
        if known {
            self.emit(SyncEvent::ConversationsUpdated);
        }
        self.emit(SyncEvent::MessageAppended {
            conversation_id: conversation_id.clone(),
            message,
        });
        known
    }

    /// Returns `None` when `conversation_id` is already the active selection.
    fn begin_selection(&self, conversation_id: &ConversationId) -> Option<u64> {
        let mut selection = lock(&self.selection);
        if selection.current == Selection::Active(conversation_id.clone()) {
            return None;
        }
        selection.epoch += 1;
        selection.current = Selection::Selecting(conversation_id.clone());
        self.emit(SyncEvent::SelectionChanged(selection.current.clone()));
        Some(selection.epoch)
    }

    fn finish_selection(&self, epoch: u64, conversation_id: &ConversationId) -> bool {
        let mut selection = lock(&self.selection);
        if selection.epoch != epoch {
            return false;
        }
        selection.current = Selection::Active(conversation_id.clone());
        self.emit(SyncEvent::SelectionChanged(selection.current.clone()));
        true
    }

    fn abandon_selection(&self, epoch: u64) {
        let mut selection = lock(&self.selection);
        if selection.epoch != epoch {
            return;
        }
        selection.current = Selection::Idle;
        self.emit(SyncEvent::SelectionChanged(Selection::Idle));
    }

    /// Fetch history for `conversation_id` unless it is cached.
    ///
    /// Concurrent callers for the same conversation wait on one gate, so only
    /// the first one hits the backend.
    async fn ensure_history(&self, conversation_id: &ConversationId) -> ClientResult<()> {
        if lock(&self.store).has_history(conversation_id) {
            return Ok(());
        }
        let gate = {
            let mut gates = self.history_gates.lock().await;
            Arc::clone(gates.entry(conversation_id.clone()).or_default())
        };
        let _guard = gate.lock().await;
        if lock(&self.store).has_history(conversation_id) {
            return Ok(());
        }

        let generation = self.generation();
        let messages = self.api.chat_history(conversation_id).await?;
        if self.generation() != generation {
            return Err(ClientError::AuthRejected("session ended while loading history".into()));
        }
        let count = messages.len();
        let seeded = lock(&self.store).set_history(conversation_id, messages);
        if seeded {
            debug!(%conversation_id, messages = count, "sync: history seeded");
            self.emit(SyncEvent::ConversationsUpdated);
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.transport.disconnect().await;
        lock(&self.store).clear();
        lock(&self.drafts).clear();
        self.history_gates.lock().await.clear();
        {
            let mut selection = lock(&self.selection);
            selection.epoch += 1;
            selection.current = Selection::Idle;
        }
        self.emit(SyncEvent::SelectionChanged(Selection::Idle));
        self.emit(SyncEvent::ConversationsUpdated);
        info!("sync: session state cleared");
    }
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
