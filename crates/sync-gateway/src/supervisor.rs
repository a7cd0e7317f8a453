//! Realtime connection supervisor.
//!
//! One actor task per supervisor owns the transport: it connects,
//! identifies, heartbeats, resumes and reconnects with backoff, and it is the
//! only code path that applies inbound frames to the store. Every cache or
//! directory mutation for a frame happens before the matching event is
//! dispatched on the bus.
//!
//! `run` and `stop` are idempotent. The outbound queue belongs to the
//! supervisor rather than to a connection, so frames queued while stopped or
//! reconnecting are written once the next session is connected.

use std::{
    fmt,
    ops::ControlFlow,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use sync_core::{
    EventBus, Message, OrderedId, ReadyPayload, ReconnectDecision, SessionInput, SessionPhase,
    SessionStateMachine, StoreReader, StoreWriter, SyncConfig, SyncError, SyncErrorCategory,
    SyncEvent, WakeAction,
};
use sync_platform::{LastOpened, PreferencesStore, TokenProvider};
use tokio::{
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
    time::{Instant, sleep, sleep_until},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{
    frame::{AUTH_FAILURE_REASONS, InboundFrame, OutboundFrame, ResumeRequest, SequencedFrame},
    outbound::{OutboundQueue, QueueError},
    transport::{Connector, Transport, TransportError},
};

struct Shared {
    config: SyncConfig,
    bus: EventBus,
    writer: StoreWriter,
    tokens: Arc<dyn TokenProvider>,
    preferences: Arc<dyn PreferencesStore>,
    outbound: OutboundQueue,
    outbound_rx: AsyncMutex<mpsc::Receiver<OutboundFrame>>,
    paused: watch::Sender<bool>,
    phase: watch::Sender<SessionPhase>,
    session: Mutex<SessionStateMachine>,
}

impl Shared {
    // The state machine is only touched through single synchronous calls.
    fn session<R>(&self, f: impl FnOnce(&mut SessionStateMachine) -> R) -> R {
        f(&mut self.session.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Apply `input` and publish the resulting events. Returns whether the
    /// input was accepted.
    fn apply(&self, input: SessionInput) -> bool {
        match self.session(|sm| sm.apply(&input)) {
            Ok(events) => {
                self.publish(events);
                true
            }
            Err(err) => {
                warn!(?input, error = %err, "session input rejected");
                false
            }
        }
    }

    fn publish(&self, events: Vec<SyncEvent>) {
        for event in events {
            if let SyncEvent::PhaseChanged { phase } = &event {
                info!(?phase, "session phase changed");
                self.phase.send_replace(*phase);
            }
            self.bus.dispatch(event);
        }
    }

    fn handle_ready(&self, ready: ReadyPayload) {
        let input = SessionInput::Ready {
            session_id: ready.session_id.clone(),
        };
        let events = match self.session(|sm| sm.apply(&input)) {
            Ok(events) => events,
            Err(err) => {
                warn!(error = %err, "dropping unexpected READY");
                return;
            }
        };

        let guild_count = ready.guilds.len();
        self.writer.with_directory(|directory| {
            directory.load_ready(ready.user.clone(), ready.guilds.clone())
        });
        self.restore_last_opened();
        debug!(guild_count, "ready snapshot loaded");

        self.publish(events);
        self.bus.dispatch(SyncEvent::Ready(ready));
    }

    fn restore_last_opened(&self) {
        match self.preferences.last_opened() {
            Ok(LastOpened {
                channel_id: Some(channel_id),
                ..
            }) => {
                self.writer.register_channel(channel_id);
                debug!(%channel_id, "registered last opened channel");
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "reading last opened channel failed"),
        }
    }

    /// Apply a domain frame to the store, then dispatch its event.
    fn apply_domain(&self, frame: InboundFrame) {
        let writer = &self.writer;
        let event = match frame {
            InboundFrame::MessageCreate(message) => {
                if !writer.add_message(message.clone()) {
                    trace!(
                        channel_id = %message.channel_id,
                        "message for unregistered channel not cached"
                    );
                }
                SyncEvent::MessageCreated(message)
            }
            InboundFrame::MessageUpdate(message) => {
                writer.update_message(message.clone());
                SyncEvent::MessageUpdated(message)
            }
            InboundFrame::MessageRemove(remove) => {
                writer.drop_message(remove.channel_id, remove.id);
                SyncEvent::MessageRemoved(remove)
            }
            InboundFrame::MessageAck(ack) => SyncEvent::MessageAcked(ack),
            InboundFrame::ChannelCreate(channel) => {
                writer.with_directory(|directory| directory.upsert_channel(channel.clone()));
                SyncEvent::ChannelCreated(channel)
            }
            InboundFrame::ChannelRemove(channel) => {
                writer.remove_channel(&channel);
                SyncEvent::ChannelRemoved(channel)
            }
            InboundFrame::GuildCreate(snapshot) => {
                writer.with_directory(|directory| directory.upsert_snapshot(snapshot.clone()));
                SyncEvent::GuildCreated(snapshot)
            }
            InboundFrame::GuildUpdate(guild) => {
                writer.with_directory(|directory| directory.update_guild(guild.clone()));
                SyncEvent::GuildUpdated(guild)
            }
            InboundFrame::GuildRemove(guild) => {
                writer.remove_guild(guild.id);
                SyncEvent::GuildRemoved(guild)
            }
            InboundFrame::MemberCreate(member) => {
                writer.with_directory(|directory| directory.upsert_member(member.clone()));
                SyncEvent::MemberCreated(member)
            }
            InboundFrame::MemberRemove(member) => {
                writer.with_directory(|directory| {
                    directory.remove_member(member.guild_id, member.user.id)
                });
                SyncEvent::MemberRemoved(member)
            }
            InboundFrame::PresenceUpdate(presence) => SyncEvent::PresenceUpdated(presence),
            InboundFrame::TypingStart(typing) => SyncEvent::TypingStarted(typing),
            InboundFrame::UserUpdate(user) => {
                writer.with_directory(|directory| directory.set_current_user(user.clone()));
                SyncEvent::UserUpdated(user)
            }
            control @ (InboundFrame::Hello { .. }
            | InboundFrame::Heartbeat
            | InboundFrame::HeartbeatAck
            | InboundFrame::InvalidSession { .. }
            | InboundFrame::Ready(_)
            | InboundFrame::Resumed) => {
                debug!(frame = control.discriminator(), "control frame has no domain event");
                return;
            }
        };
        self.bus.dispatch(event);
    }
}

#[derive(Debug)]
struct RunningSession {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the realtime session for one account.
pub struct ConnectionSupervisor<C: Connector> {
    connector: Arc<C>,
    shared: Arc<Shared>,
    running: AsyncMutex<Option<RunningSession>>,
}

impl<C: Connector> ConnectionSupervisor<C> {
    pub fn new(
        connector: C,
        config: SyncConfig,
        bus: EventBus,
        writer: StoreWriter,
        tokens: Arc<dyn TokenProvider>,
        preferences: Arc<dyn PreferencesStore>,
    ) -> Self {
        let (outbound, outbound_rx) = OutboundQueue::new(config.outbound_buffer);
        let (phase, _) = watch::channel(SessionPhase::Disconnected);
        let (paused, _) = watch::channel(false);
        let session = SessionStateMachine::new(config.backoff_policy());

        Self {
            connector: Arc::new(connector),
            shared: Arc::new(Shared {
                config,
                bus,
                writer,
                tokens,
                preferences,
                outbound,
                outbound_rx: AsyncMutex::new(outbound_rx),
                paused,
                phase,
                session: Mutex::new(session),
            }),
            running: AsyncMutex::new(None),
        }
    }

    /// Start the session actor. Does nothing if it is already running.
    pub async fn run(&self) -> Result<(), SyncError> {
        let mut guard = self.running.lock().await;
        if let Some(running) = guard.as_ref()
            && !running.task.is_finished()
        {
            debug!("session actor already running");
            return Ok(());
        }
        if guard.take().is_some() {
            // The previous actor ended on its own (auth failure or exhaustion).
            self.shared.apply(SessionInput::Stop);
        }

        let events = self
            .shared
            .session(|sm| sm.apply(&SessionInput::Connect))?;
        self.shared.publish(events);

        let stop = CancellationToken::new();
        let task = tokio::spawn(run_actor(
            Arc::clone(&self.connector),
            Arc::clone(&self.shared),
            stop.child_token(),
        ));
        *guard = Some(RunningSession { stop, task });
        Ok(())
    }

    /// Stop the session actor and cancel its timers. The session id and
    /// queued outbound frames are kept for the next `run`.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.stop.cancel();
            if let Err(err) = running.task.await
                && err.is_panic()
            {
                error!("session actor panicked");
            }
        }
        self.shared.apply(SessionInput::Stop);
    }

    /// Stop, forget the session and cached data, and clear the stored token.
    pub async fn logout(&self) -> Result<(), SyncError> {
        self.stop().await;
        self.shared.apply(SessionInput::Logout);
        self.shared.writer.clear();

        let mut outbound = self.shared.outbound_rx.lock().await;
        let mut discarded = 0_usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        drop(outbound);
        if discarded > 0 {
            debug!(discarded, "discarded queued outbound frames on logout");
        }

        self.shared.tokens.clear_token().map_err(|err| {
            SyncError::new(
                SyncErrorCategory::Storage,
                "token_clear_failed",
                err.to_string(),
            )
        })
    }

    /// App moved to the background: stop heartbeating, keep the session.
    pub fn pause(&self) {
        self.set_paused(true);
    }

    /// App is back. Heartbeats resume; a pause longer than the resume window
    /// reconnects and resumes the session.
    pub fn resume(&self) {
        self.set_paused(false);
    }

    fn set_paused(&self, value: bool) {
        self.shared.paused.send_if_modified(|paused| {
            let changed = *paused != value;
            *paused = value;
            changed
        });
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn phase(&self) -> SessionPhase {
        *self.shared.phase.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<SessionPhase> {
        self.shared.phase.subscribe()
    }

    pub fn session_id(&self) -> Option<String> {
        self.shared
            .session(|sm| sm.session_id().map(ToOwned::to_owned))
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.session(|sm| sm.reconnect_attempts())
    }

    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|running| !running.task.is_finished())
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }

    pub fn reader(&self) -> StoreReader {
        self.shared.writer.reader()
    }
}

impl<C: Connector> fmt::Debug for ConnectionSupervisor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Cloneable write path for collaborators (UI, REST loaders).
///
/// Cache writes go through the supervisor's single store writer; frames go
/// through its outbound queue.
#[derive(Clone)]
pub struct SupervisorHandle {
    shared: Arc<Shared>,
}

impl SupervisorHandle {
    pub async fn send_frame(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.shared.outbound.send(frame).await
    }

    pub fn try_send_frame(&self, frame: OutboundFrame) -> Result<(), QueueError> {
        self.shared.outbound.try_send(frame)
    }

    pub async fn send_typing(&self, channel_id: OrderedId) -> Result<(), QueueError> {
        self.send_frame(OutboundFrame::StartTyping { channel_id })
            .await
    }

    /// Register a channel window. Returns evicted channel ids.
    pub fn register_channel(&self, channel_id: OrderedId) -> Vec<OrderedId> {
        self.shared.writer.register_channel(channel_id)
    }

    /// Register a channel and remember it as the last opened one.
    pub fn open_channel(
        &self,
        guild_id: Option<OrderedId>,
        channel_id: OrderedId,
    ) -> Vec<OrderedId> {
        let evicted = self.register_channel(channel_id);
        let selection = LastOpened {
            guild_id,
            channel_id: Some(channel_id),
        };
        if let Err(err) = self.shared.preferences.set_last_opened(selection) {
            warn!(%channel_id, error = %err, "persisting last opened channel failed");
        }
        evicted
    }

    /// Insert history fetched outside the realtime connection.
    pub fn seed_messages(&self, channel_id: OrderedId, batch: Vec<Message>) -> usize {
        self.shared.writer.add_messages(channel_id, batch)
    }

    /// Show an optimistic message until the server echo with the same nonce arrives.
    pub fn local_echo(&self, message: Message) -> bool {
        self.shared.writer.add_message(message)
    }

    pub fn reader(&self) -> StoreReader {
        self.shared.writer.reader()
    }

    pub fn bus(&self) -> &EventBus {
        &self.shared.bus
    }
}

impl fmt::Debug for SupervisorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SupervisorHandle").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionEnd {
    Stopped,
    Lost,
    Invalidated,
    AuthFailed,
}

async fn run_actor<C: Connector>(connector: Arc<C>, shared: Arc<Shared>, stop: CancellationToken) {
    let mut outbound = shared.outbound_rx.lock().await;
    let mut paused = shared.paused.subscribe();
    if *paused.borrow_and_update() {
        shared.session(|sm| sm.suspend(Instant::now()));
    }

    loop {
        let connected = tokio::select! {
            _ = stop.cancelled() => break,
            result = connector.connect() => result,
        };

        let end = match connected {
            Ok(transport) => {
                debug!("transport connected");
                Connection::new(&shared, transport)
                    .drive(&stop, &mut outbound, &mut paused)
                    .await
            }
            Err(err) => {
                warn!(error = %err, "connect attempt failed");
                ConnectionEnd::Lost
            }
        };

        match end {
            ConnectionEnd::Stopped => break,
            ConnectionEnd::AuthFailed => {
                shared.apply(SessionInput::AuthenticationFailed);
                break;
            }
            ConnectionEnd::Lost => {
                shared.apply(SessionInput::ConnectionLost);
            }
            ConnectionEnd::Invalidated => {}
        }

        let decision = match shared.session(|sm| sm.schedule_reconnect()) {
            Ok((decision, events)) => {
                shared.publish(events);
                decision
            }
            Err(err) => {
                error!(error = %err, "cannot schedule reconnect");
                break;
            }
        };
        match decision {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting");
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
            ReconnectDecision::Exhausted => {
                warn!("reconnect attempts exhausted");
                break;
            }
        }
    }

    debug!("session actor exited");
}

enum Wake {
    Stop,
    AckMissed,
    Heartbeat,
    PauseChanged,
    Inbound(Option<Result<String, TransportError>>),
    Outbound(OutboundFrame),
}

/// State of one transport connection.
struct Connection<'a, T> {
    shared: &'a Shared,
    transport: T,
    heartbeat_interval: Option<Duration>,
    next_heartbeat: Option<Instant>,
    ack_deadline: Option<Instant>,
}

impl<'a, T: Transport> Connection<'a, T> {
    fn new(shared: &'a Shared, transport: T) -> Self {
        Self {
            shared,
            transport,
            heartbeat_interval: None,
            next_heartbeat: None,
            ack_deadline: None,
        }
    }

    async fn drive(
        mut self,
        stop: &CancellationToken,
        outbound: &mut mpsc::Receiver<OutboundFrame>,
        paused: &mut watch::Receiver<bool>,
    ) -> ConnectionEnd {
        loop {
            let is_paused = *paused.borrow();
            let connected = self.shared.session(|sm| sm.phase()) == SessionPhase::Connected;
            let now = Instant::now();
            let ack_at = self.ack_deadline.unwrap_or(now);
            let heartbeat_at = self.next_heartbeat.unwrap_or(now);

            let wake = tokio::select! {
                biased;
                _ = stop.cancelled() => Wake::Stop,
                _ = sleep_until(ack_at), if self.ack_deadline.is_some() && !is_paused => {
                    Wake::AckMissed
                }
                _ = sleep_until(heartbeat_at), if self.next_heartbeat.is_some() && !is_paused => {
                    Wake::Heartbeat
                }
                changed = paused.changed() => match changed {
                    Ok(()) => Wake::PauseChanged,
                    Err(_) => Wake::Stop,
                },
                inbound = self.transport.recv() => Wake::Inbound(inbound),
                Some(frame) = outbound.recv(), if connected => Wake::Outbound(frame),
            };

            let flow = match wake {
                Wake::Stop => return ConnectionEnd::Stopped,
                Wake::AckMissed => {
                    warn!("heartbeat ack missed; dropping connection");
                    return ConnectionEnd::Lost;
                }
                Wake::Heartbeat => self.heartbeat().await,
                Wake::PauseChanged => {
                    let now_paused = *paused.borrow_and_update();
                    self.pause_changed(now_paused).await
                }
                Wake::Inbound(None) => {
                    info!("connection closed by peer");
                    return ConnectionEnd::Lost;
                }
                Wake::Inbound(Some(Err(err))) => {
                    if err.category() == SyncErrorCategory::Auth {
                        warn!(error = %err, "connection closed: authentication failed");
                        return ConnectionEnd::AuthFailed;
                    }
                    warn!(error = %err, "connection failed");
                    return ConnectionEnd::Lost;
                }
                Wake::Inbound(Some(Ok(text))) => self.handle_text(&text).await,
                Wake::Outbound(frame) => self.send(&frame).await,
            };

            if let ControlFlow::Break(end) = flow {
                return end;
            }
        }
    }

    async fn handle_text(&mut self, text: &str) -> ControlFlow<ConnectionEnd> {
        let SequencedFrame { sequence, frame } = match InboundFrame::decode(text) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return ControlFlow::Continue(());
            }
        };
        if let Some(sequence) = sequence {
            self.shared.session(|sm| sm.record_sequence(sequence));
        }
        trace!(frame = frame.discriminator(), ?sequence, "frame received");

        match frame {
            InboundFrame::Hello {
                heartbeat_interval_ms,
            } => {
                if !self.shared.apply(SessionInput::Hello {
                    heartbeat_interval_ms,
                }) {
                    return ControlFlow::Continue(());
                }
                let interval = Duration::from_millis(heartbeat_interval_ms.max(1));
                self.heartbeat_interval = Some(interval);
                self.next_heartbeat = Some(Instant::now() + interval);
                self.ack_deadline = None;
                self.identify().await
            }
            InboundFrame::Heartbeat => self.heartbeat().await,
            InboundFrame::HeartbeatAck => {
                self.ack_deadline = None;
                self.shared
                    .session(|sm| sm.record_heartbeat_ack(Instant::now()));
                ControlFlow::Continue(())
            }
            InboundFrame::InvalidSession { reason } => {
                if AUTH_FAILURE_REASONS.contains(&reason.as_str()) {
                    warn!(%reason, "session rejected: authentication failed");
                    return ControlFlow::Break(ConnectionEnd::AuthFailed);
                }
                info!(%reason, "session invalidated by server");
                if self.shared.apply(SessionInput::InvalidSession) {
                    ControlFlow::Break(ConnectionEnd::Invalidated)
                } else {
                    ControlFlow::Continue(())
                }
            }
            InboundFrame::Ready(ready) => {
                self.shared.handle_ready(ready);
                ControlFlow::Continue(())
            }
            InboundFrame::Resumed => {
                self.shared.apply(SessionInput::Resumed);
                ControlFlow::Continue(())
            }
            domain => {
                self.shared.apply_domain(domain);
                ControlFlow::Continue(())
            }
        }
    }

    async fn identify(&mut self) -> ControlFlow<ConnectionEnd> {
        let token = match self.shared.tokens.get_token() {
            Ok(Some(token)) => token,
            Ok(None) => {
                warn!("no session token available; cannot identify");
                return ControlFlow::Break(ConnectionEnd::AuthFailed);
            }
            Err(err) => {
                error!(error = %err, "reading session token failed");
                return ControlFlow::Break(ConnectionEnd::Lost);
            }
        };
        let resume = self.shared.session(|sm| match (sm.phase(), sm.session_id()) {
            (SessionPhase::Resuming, Some(session_id)) => Some(ResumeRequest {
                session_id: session_id.to_owned(),
                seq: sm.last_sequence(),
            }),
            _ => None,
        });
        debug!(resume = resume.is_some(), "sending identify");
        self.send(&OutboundFrame::Identify { token, resume }).await
    }

    async fn heartbeat(&mut self) -> ControlFlow<ConnectionEnd> {
        let seq = self.shared.session(|sm| sm.last_sequence());
        self.send(&OutboundFrame::Heartbeat { seq }).await?;

        let now = Instant::now();
        if let Some(interval) = self.heartbeat_interval {
            self.next_heartbeat = Some(now + interval);
            if self.ack_deadline.is_none() {
                self.ack_deadline = Some(now + self.shared.config.heartbeat_ack_timeout(interval));
            }
        }
        ControlFlow::Continue(())
    }

    async fn pause_changed(&mut self, paused: bool) -> ControlFlow<ConnectionEnd> {
        let now = Instant::now();
        if paused {
            self.shared.session(|sm| sm.suspend(now));
            debug!("session suspended");
            return ControlFlow::Continue(());
        }

        let window = self.shared.config.resume_window();
        match self.shared.session(|sm| sm.wake(now, window)) {
            Some(WakeAction::Heartbeat) => {
                debug!("woke within resume window; heartbeating");
                self.ack_deadline = None;
                self.heartbeat().await
            }
            Some(WakeAction::Resume) => {
                info!("resume window exceeded while paused; resuming session");
                ControlFlow::Break(ConnectionEnd::Lost)
            }
            None => ControlFlow::Continue(()),
        }
    }

    async fn send(&mut self, frame: &OutboundFrame) -> ControlFlow<ConnectionEnd> {
        let text = match frame.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!(frame = frame.discriminator(), error = %err, "dropping unencodable frame");
                return ControlFlow::Continue(());
            }
        };
        match self.transport.send(text).await {
            Ok(()) => {
                trace!(frame = frame.discriminator(), "frame sent");
                ControlFlow::Continue(())
            }
            Err(err) => {
                warn!(frame = frame.discriminator(), error = %err, "send failed");
                ControlFlow::Break(ConnectionEnd::Lost)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use sync_core::{
        Channel, ChannelKind, EventKind, EventWaiter, Guild, GuildSnapshot, InvalidationReason,
        MessageQuery, MessageRemove, Subscriber, SyncStore, User,
    };
    use sync_platform::{CredentialVault, InMemoryPreferences, InMemorySecretStore};
    use tokio::time::timeout;

    use super::*;
    use crate::memory::{self, MemoryConnector, MemoryPeer, MemoryServer};

    const WAIT: Duration = Duration::from_secs(120);
    const HEARTBEAT_MS: u64 = 10_000;

    struct Harness {
        supervisor: ConnectionSupervisor<MemoryConnector>,
        connector: MemoryConnector,
        server: MemoryServer,
        bus: EventBus,
        reader: StoreReader,
        tokens: Arc<CredentialVault<InMemorySecretStore>>,
        preferences: Arc<InMemoryPreferences>,
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            max_reconnect_attempts: 3,
            resume_window_ms: 5_000,
            ..SyncConfig::default()
        }
    }

    fn harness(config: SyncConfig) -> Harness {
        let (connector, server) = memory::pair();
        let bus = EventBus::new();
        let (writer, reader) = SyncStore::new(config.channel_limit, config.window_capacity);
        let tokens = Arc::new(CredentialVault::new(
            InMemorySecretStore::default(),
            "chatsync-test",
            "alice",
        ));
        tokens.set_token("token-alice").expect("seed token");
        let preferences = Arc::new(InMemoryPreferences::default());

        let supervisor = ConnectionSupervisor::new(
            connector.clone(),
            config,
            bus.clone(),
            writer,
            tokens.clone(),
            preferences.clone(),
        );
        Harness {
            supervisor,
            connector,
            server,
            bus,
            reader,
            tokens,
            preferences,
        }
    }

    fn alice() -> User {
        User {
            id: OrderedId::new(1),
            username: "alice".into(),
            avatar: None,
            bot: false,
        }
    }

    fn ready(session_id: &str) -> InboundFrame {
        InboundFrame::Ready(ReadyPayload {
            user: alice(),
            guilds: vec![GuildSnapshot {
                guild: Guild {
                    id: OrderedId::new(100),
                    name: "rustaceans".into(),
                    icon: None,
                    owner_id: OrderedId::new(1),
                },
                channels: vec![Channel {
                    id: OrderedId::new(7),
                    guild_id: Some(OrderedId::new(100)),
                    name: "general".into(),
                    kind: ChannelKind::Text,
                    position: 0,
                }],
                members: Vec::new(),
            }],
            session_id: session_id.into(),
        })
    }

    fn hello() -> InboundFrame {
        InboundFrame::Hello {
            heartbeat_interval_ms: HEARTBEAT_MS,
        }
    }

    fn message(channel: u64, id: u64) -> Message {
        Message {
            id: OrderedId::new(id),
            channel_id: OrderedId::new(channel),
            guild_id: Some(OrderedId::new(100)),
            author: alice(),
            content: Some(format!("message {id}")),
            nonce: None,
            edited: false,
            attachments: Vec::new(),
        }
    }

    fn phase_is(expected: SessionPhase) -> impl Fn(&SyncEvent) -> bool + Send + Sync + 'static {
        move |event| matches!(event, SyncEvent::PhaseChanged { phase } if *phase == expected)
    }

    async fn accept(server: &mut MemoryServer) -> MemoryPeer {
        timeout(WAIT, server.accept())
            .await
            .expect("accept timed out")
            .expect("client should connect")
    }

    async fn next_frame(peer: &mut MemoryPeer) -> OutboundFrame {
        timeout(WAIT, peer.recv_frame())
            .await
            .expect("frame timed out")
            .expect("connection should be open")
            .expect("client frame should decode")
    }

    async fn expect_event(waiter: EventWaiter) -> SyncEvent {
        timeout(WAIT, waiter)
            .await
            .expect("event timed out")
            .expect("bus should be open")
    }

    async fn wait_until_stopped(supervisor: &ConnectionSupervisor<MemoryConnector>) {
        timeout(WAIT, async {
            while supervisor.is_running().await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("actor should exit");
    }

    /// Connect, identify and reach `Connected` with session `sess-1`.
    async fn handshake(h: &mut Harness) -> MemoryPeer {
        let connected = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Connected));
        h.supervisor.run().await.expect("run should start the actor");

        let mut peer = accept(&mut h.server).await;
        assert!(peer.send_frame(&hello(), None));
        assert_eq!(
            next_frame(&mut peer).await,
            OutboundFrame::Identify {
                token: "token-alice".into(),
                resume: None,
            }
        );
        assert!(peer.send_frame(&ready("sess-1"), Some(1)));
        expect_event(connected).await;
        peer
    }

    #[tokio::test(start_paused = true)]
    async fn connects_identifies_and_loads_ready_state() {
        let mut h = harness(test_config());
        h.preferences
            .set_last_opened(LastOpened {
                guild_id: Some(OrderedId::new(100)),
                channel_id: Some(OrderedId::new(7)),
            })
            .expect("seed preferences");
        let ready_event = h.bus.wait_for_next(EventKind::Ready);

        let _peer = handshake(&mut h).await;
        h.supervisor.run().await.expect("second run is a no-op");

        assert_eq!(h.supervisor.phase(), SessionPhase::Connected);
        assert_eq!(*h.supervisor.watch_phase().borrow(), SessionPhase::Connected);
        assert_eq!(h.supervisor.session_id().as_deref(), Some("sess-1"));
        assert_eq!(h.connector.attempts(), 1);
        assert!(matches!(expect_event(ready_event).await, SyncEvent::Ready(_)));
        assert_eq!(h.reader.current_user().map(|u| u.id), Some(OrderedId::new(1)));
        assert_eq!(h.reader.channels(OrderedId::new(100)).len(), 1);
        assert!(h.reader.is_registered(OrderedId::new(7)));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeats_at_the_server_interval() {
        let mut h = harness(test_config());
        let mut peer = handshake(&mut h).await;
        let started = Instant::now();

        assert_eq!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { seq: Some(1) }
        );
        assert!(started.elapsed() >= Duration::from_millis(HEARTBEAT_MS));
        assert!(peer.send_frame(&InboundFrame::HeartbeatAck, None));

        assert!(matches!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { .. }
        ));
        assert!(started.elapsed() >= Duration::from_millis(2 * HEARTBEAT_MS));
        assert_eq!(h.supervisor.phase(), SessionPhase::Connected);

        assert!(peer.send_frame(&InboundFrame::Heartbeat, Some(5)));
        assert_eq!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { seq: Some(5) }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn missed_ack_resumes_with_the_same_session() {
        let mut h = harness(test_config());
        let mut peer = handshake(&mut h).await;
        let resuming = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Resuming));
        let reconnected = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Connected));

        assert!(matches!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { .. }
        ));
        expect_event(resuming).await;

        let mut second = accept(&mut h.server).await;
        assert!(second.send_frame(&hello(), None));
        assert_eq!(
            next_frame(&mut second).await,
            OutboundFrame::Identify {
                token: "token-alice".into(),
                resume: Some(ResumeRequest {
                    session_id: "sess-1".into(),
                    seq: Some(1),
                }),
            }
        );
        assert!(second.send_frame(&InboundFrame::Resumed, None));
        expect_event(reconnected).await;

        assert_eq!(h.supervisor.session_id().as_deref(), Some("sess-1"));
        assert_eq!(h.supervisor.reconnect_attempts(), 0);
        assert_eq!(h.connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_resume_exhausts_reconnects_and_reports_once() {
        let config = SyncConfig {
            max_reconnect_attempts: 2,
            ..test_config()
        };
        let mut h = harness(config);
        let reasons = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reasons);
        h.bus.subscribe(
            EventKind::SessionInvalidated,
            Subscriber::from_fn(move |event| {
                if let SyncEvent::SessionInvalidated { reason } = event {
                    sink.lock().expect("reasons lock").push(reason);
                }
                Ok(())
            }),
        );

        let mut peer = handshake(&mut h).await;
        let invalidated = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Invalidated));
        let exhausted = h.bus.wait_for_next(EventKind::SessionInvalidated);

        // No ack: the connection is dropped and a resume is attempted.
        assert!(matches!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { .. }
        ));
        let mut second = accept(&mut h.server).await;
        assert!(second.send_frame(&hello(), None));
        assert!(matches!(
            next_frame(&mut second).await,
            OutboundFrame::Identify {
                resume: Some(_),
                ..
            }
        ));
        assert!(second.send_frame(
            &InboundFrame::InvalidSession {
                reason: "session_expired".into(),
            },
            None,
        ));
        expect_event(invalidated).await;

        // The fresh identify is rejected as well.
        let mut third = accept(&mut h.server).await;
        assert!(third.send_frame(&hello(), None));
        assert!(matches!(
            next_frame(&mut third).await,
            OutboundFrame::Identify { resume: None, .. }
        ));
        assert!(third.send_frame(
            &InboundFrame::InvalidSession {
                reason: "session_expired".into(),
            },
            None,
        ));

        assert_eq!(
            expect_event(exhausted).await,
            SyncEvent::SessionInvalidated {
                reason: InvalidationReason::ReconnectionExhausted,
            }
        );
        wait_until_stopped(&h.supervisor).await;
        h.bus.settle().await;

        assert_eq!(
            *reasons.lock().expect("reasons lock"),
            vec![InvalidationReason::ReconnectionExhausted]
        );
        assert_eq!(h.supervisor.phase(), SessionPhase::Disconnected);
        assert_eq!(h.supervisor.session_id(), None);
        assert_eq!(h.connector.attempts(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connections_back_off_and_retry() {
        let mut h = harness(test_config());
        h.connector.refuse_next(2);
        let reconnecting = h.bus.wait_for(EventKind::Reconnecting, |event| {
            matches!(event, SyncEvent::Reconnecting { attempt: 2, delay_ms: 200 })
        });

        let _peer = handshake(&mut h).await;
        assert!(matches!(
            expect_event(reconnecting).await,
            SyncEvent::Reconnecting { attempt: 2, .. }
        ));
        assert_eq!(h.connector.attempts(), 3);
        assert_eq!(h.supervisor.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_token_is_terminal() {
        let mut h = harness(test_config());
        let invalidated = h.bus.wait_for_next(EventKind::SessionInvalidated);
        h.supervisor.run().await.expect("run");

        let mut peer = accept(&mut h.server).await;
        assert!(peer.send_frame(&hello(), None));
        assert!(matches!(
            next_frame(&mut peer).await,
            OutboundFrame::Identify { .. }
        ));
        assert!(peer.send_frame(
            &InboundFrame::InvalidSession {
                reason: "authentication_failed".into(),
            },
            None,
        ));

        assert_eq!(
            expect_event(invalidated).await,
            SyncEvent::SessionInvalidated {
                reason: InvalidationReason::AuthenticationFailed,
            }
        );
        wait_until_stopped(&h.supervisor).await;
        assert_eq!(h.supervisor.phase(), SessionPhase::Disconnected);
        assert_eq!(h.connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_token_fails_authentication() {
        let mut h = harness(test_config());
        h.tokens.clear_token().expect("clear token");
        let invalidated = h.bus.wait_for_next(EventKind::SessionInvalidated);
        h.supervisor.run().await.expect("run");

        let mut peer = accept(&mut h.server).await;
        assert!(peer.send_frame(&hello(), None));
        assert_eq!(
            expect_event(invalidated).await,
            SyncEvent::SessionInvalidated {
                reason: InvalidationReason::AuthenticationFailed,
            }
        );
        assert_eq!(timeout(WAIT, peer.recv_text()).await.expect("recv"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn auth_close_code_is_terminal() {
        let mut h = harness(test_config());
        let peer = handshake(&mut h).await;
        let invalidated = h.bus.wait_for_next(EventKind::SessionInvalidated);

        peer.close(4004, "authentication failed");
        assert_eq!(
            expect_event(invalidated).await,
            SyncEvent::SessionInvalidated {
                reason: InvalidationReason::AuthenticationFailed,
            }
        );
        wait_until_stopped(&h.supervisor).await;
        assert_eq!(h.supervisor.session_id(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_is_updated_before_events_are_dispatched() {
        let mut h = harness(test_config());
        let channel = OrderedId::new(7);
        h.supervisor.handle().register_channel(channel);

        let observed = Arc::new(Mutex::new(Vec::new()));
        for kind in [
            EventKind::MessageCreated,
            EventKind::MessageUpdated,
            EventKind::MessageRemoved,
        ] {
            let reader = h.reader.clone();
            let observed = Arc::clone(&observed);
            h.bus.subscribe(
                kind,
                Subscriber::from_fn(move |event| {
                    let cached = match &event {
                        SyncEvent::MessageCreated(m) => {
                            reader.get_message(m.channel_id, m.id).is_some()
                        }
                        SyncEvent::MessageUpdated(m) => reader
                            .get_message(m.channel_id, m.id)
                            .is_some_and(|cached| cached.content == m.content),
                        SyncEvent::MessageRemoved(r) => {
                            reader.get_message(r.channel_id, r.id).is_some()
                        }
                        _ => return Ok(()),
                    };
                    observed.lock().expect("observed lock").push((event.kind(), cached));
                    Ok(())
                }),
            );
        }

        let peer = handshake(&mut h).await;
        let created = h.bus.wait_for_next(EventKind::MessageCreated);
        assert!(peer.send_text("{ this is not a frame"));
        assert!(peer.send_frame(&InboundFrame::MessageCreate(message(7, 42)), Some(2)));
        expect_event(created).await;
        assert!(h.reader.get_message(channel, OrderedId::new(42)).is_some());

        let updated = h.bus.wait_for_next(EventKind::MessageUpdated);
        let mut edited = message(7, 42);
        edited.content = Some("message 42, edited".to_owned());
        edited.edited = true;
        assert!(peer.send_frame(&InboundFrame::MessageUpdate(edited), Some(3)));
        expect_event(updated).await;

        let removed = h.bus.wait_for_next(EventKind::MessageRemoved);
        assert!(peer.send_frame(
            &InboundFrame::MessageRemove(MessageRemove {
                id: OrderedId::new(42),
                channel_id: channel,
                guild_id: Some(OrderedId::new(100)),
            }),
            Some(4),
        ));
        expect_event(removed).await;
        h.bus.settle().await;

        assert_eq!(
            *observed.lock().expect("observed lock"),
            vec![
                (EventKind::MessageCreated, true),
                (EventKind::MessageUpdated, true),
                (EventKind::MessageRemoved, false),
            ]
        );
        assert_eq!(h.supervisor.phase(), SessionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn server_echo_replaces_local_echo() {
        let mut h = harness(test_config());
        let handle = h.supervisor.handle();
        let channel = OrderedId::new(7);
        handle.open_channel(Some(OrderedId::new(100)), channel);
        assert_eq!(
            h.preferences.last_opened().expect("prefs").channel_id,
            Some(channel)
        );
        handle.seed_messages(channel, vec![message(7, 3), message(7, 1), message(7, 2)]);

        let pending = Message::pending(channel, alice(), "hello");
        let nonce = pending.nonce.clone();
        assert!(handle.local_echo(pending));
        assert_eq!(h.reader.pending_messages(channel).len(), 1);

        let peer = handshake(&mut h).await;
        let created = h.bus.wait_for_next(EventKind::MessageCreated);
        let mut confirmed = message(7, 10);
        confirmed.nonce = nonce;
        assert!(peer.send_frame(&InboundFrame::MessageCreate(confirmed), Some(2)));
        expect_event(created).await;

        assert!(h.reader.pending_messages(channel).is_empty());
        let ids: Vec<u64> = h
            .reader
            .get_messages(channel, MessageQuery::Latest, 10)
            .iter()
            .map(|m| m.id.get())
            .collect();
        assert_eq!(ids, vec![1, 2, 3, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_frames_survive_stop_and_flush_after_resume() {
        let mut h = harness(test_config());
        let peer = handshake(&mut h).await;

        h.supervisor.stop().await;
        h.supervisor.stop().await;
        assert_eq!(h.supervisor.phase(), SessionPhase::Disconnected);
        assert_eq!(h.supervisor.session_id().as_deref(), Some("sess-1"));
        drop(peer);

        let handle = h.supervisor.handle();
        handle
            .send_typing(OrderedId::new(7))
            .await
            .expect("typing should queue while stopped");

        let connected = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Connected));
        h.supervisor.run().await.expect("run again");
        assert_eq!(h.supervisor.phase(), SessionPhase::Resuming);

        let mut second = accept(&mut h.server).await;
        assert!(second.send_frame(&hello(), None));
        assert!(matches!(
            next_frame(&mut second).await,
            OutboundFrame::Identify {
                resume: Some(_),
                ..
            }
        ));
        assert!(second.send_frame(&InboundFrame::Resumed, None));
        expect_event(connected).await;

        assert_eq!(
            next_frame(&mut second).await,
            OutboundFrame::StartTyping {
                channel_id: OrderedId::new(7),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn short_pause_heartbeats_on_resume() {
        let mut h = harness(test_config());
        let mut peer = handshake(&mut h).await;
        let started = Instant::now();

        h.supervisor.pause();
        tokio::time::sleep(Duration::from_secs(2)).await;
        h.supervisor.resume();

        assert!(matches!(
            next_frame(&mut peer).await,
            OutboundFrame::Heartbeat { .. }
        ));
        assert!(started.elapsed() < Duration::from_millis(HEARTBEAT_MS));
        assert_eq!(h.supervisor.phase(), SessionPhase::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn long_pause_falls_back_to_resume() {
        let mut h = harness(test_config());
        let _peer = handshake(&mut h).await;

        h.supervisor.pause();
        // Longer than both the heartbeat interval and the resume window.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.supervisor.phase(), SessionPhase::Connected);

        let resuming = h
            .bus
            .wait_for(EventKind::PhaseChanged, phase_is(SessionPhase::Resuming));
        h.supervisor.resume();
        expect_event(resuming).await;

        let mut second = accept(&mut h.server).await;
        assert!(second.send_frame(&hello(), None));
        assert!(matches!(
            next_frame(&mut second).await,
            OutboundFrame::Identify {
                resume: Some(_),
                ..
            }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn logout_forgets_session_cache_and_token() {
        let mut h = harness(test_config());
        let _peer = handshake(&mut h).await;
        h.supervisor
            .handle()
            .try_send_frame(OutboundFrame::StartTyping {
                channel_id: OrderedId::new(7),
            })
            .expect("queue typing");

        h.supervisor.logout().await.expect("logout");

        assert_eq!(h.supervisor.phase(), SessionPhase::Disconnected);
        assert_eq!(h.supervisor.session_id(), None);
        assert_eq!(h.tokens.get_token(), Ok(None));
        assert!(h.reader.guilds().is_empty());
        assert!(h.reader.registered_channels().is_empty());
        assert!(!h.supervisor.is_running().await);
    }
}
