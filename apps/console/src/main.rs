use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use client_core::{ChatSyncClient, ClientEvent, DurableChatCache, HttpChatBackend, SendError};
use shared::domain::{MessageStatus, RoomId, RoomKind, RoomSummary, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::BroadcastStream, StreamExt};
use tracing::{info, warn};

mod config;

#[derive(Parser, Debug)]
#[command(about = "Console client for the room chat backend")]
struct Args {
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    room_id: Option<i64>,
    #[arg(long)]
    user_id: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    let args = Args::parse();

    let mut settings = config::load_settings();
    if let Some(v) = args.server_url {
        settings.server_url = v;
    }
    if let Some(v) = args.database_url {
        settings.database_url = v;
    }
    if let Some(v) = args.room_id {
        settings.room_id = v;
    }
    if let Some(v) = args.user_id {
        settings.user_id = Some(v);
    }

    let backend = Arc::new(HttpChatBackend::new(&settings.server_url)?);
    let cache = DurableChatCache::initialize(&settings.database_url).await?;
    let client = ChatSyncClient::new_with_persistence(backend, cache);
    client.load_persisted_state().await?;
    if let Some(user_id) = settings.user_id {
        client.set_user_id(UserId(user_id)).await;
    }
    if let Err(err) = client.refresh_ollama_models().await {
        warn!("ollama model discovery failed: {err}");
    }

    let events = BroadcastStream::new(client.subscribe_events());
    tokio::spawn({
        let client = Arc::clone(&client);
        async move { print_events(client, events).await }
    });

    let room_id = settings.room_id;
    client
        .select_room(RoomSummary {
            room_id: RoomId(room_id),
            slug: format!("room-{room_id}"),
            name: format!("Room {room_id}"),
            kind: RoomKind::Group,
            assistant_name: None,
            assistant_initials: None,
        })
        .await?;

    println!(
        "Connected to {} (room {room_id}). Type a message; /models, /count, /errors, /quit.",
        settings.server_url
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "/quit" => break,
            "/models" => match client.refresh_ollama_models().await {
                Ok(models) => println!("available models: {models:?}"),
                Err(err) => eprintln!("model discovery failed: {err}"),
            },
            "/count" => println!(
                "assistant requests so far: {}",
                client.ai_request_count().await
            ),
            "/errors" => {
                for error in client.recent_errors().await {
                    println!("{} {}", error.at.format("%H:%M:%S"), error.message);
                }
            }
            text => match client.send_message(text).await {
                Ok(()) => {}
                Err(SendError::Busy(room)) => {
                    eprintln!("room {room} still has a send in flight")
                }
                Err(err) => eprintln!("send failed: {err}"),
            },
        }
    }

    client.close_room().await;
    Ok(())
}

async fn print_events(client: Arc<ChatSyncClient>, mut events: BroadcastStream<ClientEvent>) {
    while let Some(event) = events.next().await {
        match event {
            Ok(ClientEvent::MessagesUpdated { .. }) => {
                if let Some(message) = client.snapshot().await.last() {
                    let marker = match message.status {
                        MessageStatus::Pending => "…",
                        MessageStatus::Confirmed => " ",
                    };
                    println!("[{}]{marker} {}", message.author_tag, message.text);
                }
            }
            Ok(ClientEvent::SyncPhaseChanged { room_id, phase }) => {
                info!(room_id = room_id.0, ?phase, "sync phase changed");
            }
            Ok(ClientEvent::ProviderModelsUpdated { models }) => {
                info!(?models, "ollama models updated");
            }
            Ok(ClientEvent::Error(message)) => eprintln!("error: {message}"),
            // Lagged behind the broadcast; the next update re-renders.
            Err(_) => {}
        }
    }
}
