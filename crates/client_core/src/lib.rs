pub mod api;
pub mod error;
pub mod realtime;
pub mod retry;
pub mod store;
pub mod sync;

pub use api::{ApiClient, ApiClientOptions, ApiRequest, Auth, SessionEvent};
pub use error::{ClientError, ClientResult};
pub use realtime::{
    websocket_url, ConnectionState, InboundMessage, MessageSubscription, RealtimeTransport,
    TransportOptions,
};
pub use retry::RetryPolicy;
pub use store::{AppendOutcome, ConversationStore};
pub use sync::{ChatHandle, ConversationSynchronizer, Selection, SyncEvent};
