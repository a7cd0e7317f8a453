//! Drives the sync client end to end against a scripted in-memory server:
//! handshake, ready snapshot, a burst of messages, heartbeats, clean stop.

mod logging;

use std::{env, error::Error, sync::Arc, time::Duration};

use sync_core::{
    Channel, ChannelKind, EventBus, EventKind, Guild, GuildSnapshot, Message, MessageQuery,
    OrderedId, OrderedIdGenerator, ReadyPayload, SyncConfig, SyncEvent, SyncStore, User,
};
use sync_gateway::{
    ConnectionSupervisor, InboundFrame, MemoryPeer, MemoryServer, OutboundFrame, memory,
};
use sync_platform::{CredentialVault, InMemoryPreferences, LastOpened, TokenProvider};
use tokio::time::timeout;
use tracing::{debug, info, warn};

const SMOKE_GUILD: OrderedId = OrderedId::new(1_000);
const SMOKE_CHANNEL: OrderedId = OrderedId::new(1_001);
const SMOKE_SERVICE: &str = "chatsync-smoke";
const HEARTBEAT_INTERVAL_MS: u64 = 1_000;
const RUN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(err) = run().await {
        eprintln!("Smoke run failed: {err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let config = SyncConfig::from_env()?;
    let message_count = env::var("CHATSYNC_SMOKE_MESSAGES")
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .unwrap_or(5);
    let token = env::var("CHATSYNC_SMOKE_TOKEN").unwrap_or_else(|_| "smoke-token".to_owned());

    let tokens = Arc::new(token_vault());
    tokens.set_token(&token)?;
    let preferences = Arc::new(InMemoryPreferences::new(LastOpened {
        guild_id: Some(SMOKE_GUILD),
        channel_id: Some(SMOKE_CHANNEL),
    }));

    let bus = EventBus::new();
    let (writer, reader) = SyncStore::new(config.channel_limit, config.window_capacity);
    let (connector, server) = memory::pair();
    let server_task = tokio::spawn(scripted_server(server, token, message_count));

    let supervisor = ConnectionSupervisor::new(
        connector,
        config.clone(),
        bus.clone(),
        writer,
        tokens.clone(),
        preferences,
    );

    let ready = bus.wait_for_next(EventKind::Ready);
    let last_id = message_id(message_count);
    let last_message = bus.wait_for(EventKind::MessageCreated, move |event| {
        matches!(event, SyncEvent::MessageCreated(message) if message.id == last_id)
    });

    supervisor.run().await?;
    timeout(RUN_TIMEOUT, ready).await??;
    info!(session_id = ?supervisor.session_id(), "session ready");
    if message_count > 0 {
        timeout(RUN_TIMEOUT, last_message).await??;
    }

    let window = reader.get_messages(SMOKE_CHANNEL, MessageQuery::Latest, config.window_capacity);
    println!(
        "Connected as {} in {} guild(s); #{} holds {} message(s):",
        reader
            .current_user()
            .map(|user| user.username)
            .unwrap_or_default(),
        reader.guilds().len(),
        SMOKE_CHANNEL,
        window.len()
    );
    for message in &window {
        println!(
            "  [{}] {}: {}",
            message.id,
            message.author.username,
            message.content.as_deref().unwrap_or("")
        );
    }
    println!("{}", serde_json::to_string_pretty(&reader.channels(SMOKE_GUILD))?);

    supervisor.stop().await;
    bus.close().await;
    match server_task.await {
        Ok(served) => debug!(served, "scripted server finished"),
        Err(err) => warn!(error = %err, "scripted server task failed"),
    }
    Ok(())
}

#[cfg(feature = "os-keyring")]
fn token_vault() -> CredentialVault<sync_platform::OsKeyringSecretStore> {
    CredentialVault::new(
        sync_platform::OsKeyringSecretStore,
        SMOKE_SERVICE,
        "smoke-user",
    )
}

#[cfg(not(feature = "os-keyring"))]
fn token_vault() -> CredentialVault<sync_platform::InMemorySecretStore> {
    CredentialVault::new(
        sync_platform::InMemorySecretStore::default(),
        SMOKE_SERVICE,
        "smoke-user",
    )
}

fn message_id(index: usize) -> OrderedId {
    OrderedId::new(SMOKE_CHANNEL.get() + index as u64)
}

fn smoke_user() -> User {
    User {
        id: OrderedId::new(42),
        username: "smoke-user".into(),
        avatar: None,
        bot: false,
    }
}

fn ready_payload() -> ReadyPayload {
    ReadyPayload {
        user: smoke_user(),
        guilds: vec![GuildSnapshot {
            guild: Guild {
                id: SMOKE_GUILD,
                name: "smoke".into(),
                icon: None,
                owner_id: OrderedId::new(42),
            },
            channels: vec![Channel {
                id: SMOKE_CHANNEL,
                guild_id: Some(SMOKE_GUILD),
                name: "general".into(),
                kind: ChannelKind::Text,
                position: 0,
            }],
            members: Vec::new(),
        }],
        session_id: format!("smoke-{}", OrderedIdGenerator::new(1).next_id()),
    }
}

/// Accepts one client, plays the handshake and a message burst, then acks
/// heartbeats until the client goes away. Returns the number of client
/// frames it handled.
async fn scripted_server(mut server: MemoryServer, token: String, message_count: usize) -> usize {
    let Some(mut peer) = server.accept().await else {
        return 0;
    };
    let mut served = 0;
    let mut sequence = 0_u64;
    peer.send_frame(
        &InboundFrame::Hello {
            heartbeat_interval_ms: HEARTBEAT_INTERVAL_MS,
        },
        None,
    );

    while let Some(frame) = peer.recv_frame().await {
        served += 1;
        match frame {
            Ok(OutboundFrame::Identify { token: offered, .. }) if offered == token => {
                sequence += 1;
                peer.send_frame(&InboundFrame::Ready(ready_payload()), Some(sequence));
                burst(&peer, &mut sequence, message_count);
            }
            Ok(OutboundFrame::Identify { .. }) => {
                peer.send_frame(
                    &InboundFrame::InvalidSession {
                        reason: "invalid_token".into(),
                    },
                    None,
                );
            }
            Ok(OutboundFrame::Heartbeat { seq }) => {
                debug!(?seq, "server acking heartbeat");
                peer.send_frame(&InboundFrame::HeartbeatAck, None);
            }
            Ok(other) => debug!(frame = other.discriminator(), "server ignoring frame"),
            Err(err) => warn!(error = %err, "server received undecodable frame"),
        }
    }
    served
}

fn burst(peer: &MemoryPeer, sequence: &mut u64, count: usize) {
    for index in 1..=count {
        *sequence += 1;
        let message = Message {
            id: message_id(index),
            channel_id: SMOKE_CHANNEL,
            guild_id: Some(SMOKE_GUILD),
            author: smoke_user(),
            content: Some(format!("smoke message {index}")),
            nonce: None,
            edited: false,
            attachments: Vec::new(),
        };
        peer.send_frame(&InboundFrame::MessageCreate(message), Some(*sequence));
    }
}
