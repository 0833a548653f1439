use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ApiClient, ChatHandle, ConversationSynchronizer, RealtimeTransport, SyncEvent};
use shared::domain::{Conversation, ConversationId, Identity, ItemId, Message, UserId};
use storage::SqliteCredentialStore;
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

#[derive(Parser, Debug)]
#[command(about = "Terminal client for marketplace conversations")]
struct Args {
    /// Config file; defaults to ./chat_cli.toml when present.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        #[arg(long, env = "CHAT_CLI_PASSWORD")]
        password: String,
    },
    Register {
        name: String,
        email: String,
        #[arg(long, env = "CHAT_CLI_PASSWORD")]
        password: String,
    },
    Logout,
    /// List conversations, most recent first.
    Chats,
    History {
        conversation_id: String,
    },
    /// Start (or reopen) the conversation about an item with its owner.
    Open {
        user_id: String,
        item_id: String,
    },
    Send {
        conversation_id: String,
        text: String,
    },
    /// Stream incoming messages until interrupted.
    Watch {
        conversation_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings(args.config.as_deref())?;
    if let Some(server_url) = args.server_url {
        settings.api_base_url = server_url;
    }
    let database_url = config::prepare_database_url(&settings.credentials_database_url)?;
    let credentials = SqliteCredentialStore::new(&database_url)
        .await
        .context("failed to open credential store")?;

    let api = ApiClient::new(settings.api_options(), Arc::new(credentials))?;
    let restored = api.restore().await?;
    let transport = RealtimeTransport::new(settings.transport_options()?);
    let chat: Arc<dyn ChatHandle> = Arc::new(ConversationSynchronizer::new(api.clone(), transport));

    match args.command {
        Command::Login { email, password } => {
            let identity = api.login(&email, &password).await?;
            println!("Logged in as {} <{}>", identity.display_name, identity.email);
        }
        Command::Register {
            name,
            email,
            password,
        } => {
            let identity = api.register(&name, &email, &password).await?;
            println!("Registered {} <{}>", identity.display_name, identity.email);
        }
        Command::Logout => {
            chat.logout().await?;
            println!("Logged out");
        }
        Command::Chats => {
            let me = require_session(restored)?;
            chat.load_conversations().await?;
            for conversation in chat.conversations() {
                print_conversation(&conversation, &me);
            }
        }
        Command::History { conversation_id } => {
            let me = require_session(restored)?;
            let conversation_id = ConversationId::new(conversation_id);
            chat.load_conversations().await?;
            chat.select(&conversation_id).await?;
            for message in chat.messages(&conversation_id) {
                print_message(&message, &me);
            }
        }
        Command::Open { user_id, item_id } => {
            let me = require_session(restored)?;
            chat.start().await?;
            let conversation = chat
                .open_conversation(&UserId::new(user_id), &ItemId::new(item_id))
                .await?;
            print_conversation(&conversation, &me);
        }
        Command::Send {
            conversation_id,
            text,
        } => {
            let me = require_session(restored)?;
            let conversation_id = ConversationId::new(conversation_id);
            chat.start().await?;
            chat.select(&conversation_id).await?;
            chat.set_draft(&conversation_id, &text);
            if let Some(message) = chat.send_draft(&conversation_id).await? {
                print_message(&message, &me);
            }
        }
        Command::Watch { conversation_id } => {
            let me = require_session(restored)?;
            chat.start().await?;
            if let Some(conversation_id) = conversation_id {
                chat.select(&ConversationId::new(conversation_id)).await?;
            }
            watch(chat.as_ref(), &me).await?;
        }
    }

    Ok(())
}

fn require_session(restored: Option<Identity>) -> Result<Identity> {
    match restored {
        Some(identity) => Ok(identity),
        None => bail!("not logged in; run `chat_cli login <email>` first"),
    }
}

async fn watch(chat: &dyn ChatHandle, me: &Identity) -> Result<()> {
    let mut events = BroadcastStream::new(chat.subscribe_events());
    info!(user_id = %me.id, "watching for messages; press ctrl-c to stop");
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.next() => match event {
                Some(Ok(SyncEvent::MessageAppended { message, .. })) => print_message(&message, me),
                Some(Ok(SyncEvent::SendFailed { conversation_id, error })) => {
                    warn!(%conversation_id, "send failed: {error}");
                }
                Some(Ok(SyncEvent::SessionTerminated { reason })) => {
                    bail!("session ended: {reason}");
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => warn!("dropped events: {err}"),
                None => return Ok(()),
            }
        }
    }
}

fn print_conversation(conversation: &Conversation, me: &Identity) {
    let title = conversation
        .counterpart(&me.id)
        .map(|p| p.display_name.as_str())
        .unwrap_or("(no counterpart)");
    println!(
        "{}  {}  [{}]  {}",
        conversation.id,
        title,
        conversation.last_activity_at.format("%Y-%m-%d %H:%M"),
        conversation.last_message_text
    );
}

fn print_message(message: &Message, me: &Identity) {
    let who = if message.sender_id == me.id {
        "me".to_string()
    } else {
        message.sender_id.to_string()
    };
    println!(
        "[{}] {}@{}: {}",
        message.created_at.format("%H:%M"),
        who,
        message.conversation_id,
        message.text
    );
}
