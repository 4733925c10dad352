//! Chat protocol client: drains the outbound queue over one MQTT session.
//!
//! The connection is opened lazily, when the first message arrives. Every
//! message is published with QoS 1 and stays in flight until its PUBACK.
//! When the transport drops, in-flight messages go back to the head of the
//! queue in their original order and the client reconnects with a fresh
//! negotiation token. Nothing is dropped because the connection was down.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use jobpilot_core::env;
use jobpilot_core::models::{Credentials, Identity, OutboundMessage};
use jobpilot_core::{
    AppError, CredentialStore, DeliveryTracker, OutboundQueue, RetryPolicy, SessionAuthority,
};
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::envelope::{build_envelope, encode_envelope};
use crate::inbound::{InboundEvent, InboundHandler, TracingInboundHandler, decode_inbound};
use crate::mqtt::{
    CONNACK_BAD_CREDENTIALS, CONNACK_NOT_AUTHORIZED, ConnAck, Connect, Packet, Publish, QoS,
    Subscribe,
};
use crate::transport::{ConnectRequest, Connection, Connector};

/// The backend addresses the sender by session, so envelopes carry uid 0.
const SENDER_UID: i64 = 0;
/// Publishes awaiting PUBACK before the client stops pulling from the queue.
const MAX_INFLIGHT: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub topic: String,
    pub keep_alive: Duration,
    /// Fixed wait between reconnect attempts.
    pub reconnect_interval: Duration,
    /// Bound on waiting for CONNACK.
    pub connect_timeout: Duration,
    /// A publish still unacknowledged after this long marks the link dead.
    pub ack_timeout: Duration,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            host: "ws.zhipin.com".into(),
            port: 443,
            path: "/chatws".into(),
            topic: "chat".into(),
            keep_alive: Duration::from_secs(5),
            reconnect_interval: Duration::from_secs(8),
            connect_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(30),
        }
    }
}

impl ChatConfig {
    pub fn with_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_reconnect_interval(mut self, interval: Duration) -> Self {
        self.reconnect_interval = interval;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    pub fn url(&self) -> String {
        format!("wss://{}:{}{}", self.host, self.port, self.path)
    }

    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(env::process_env)
    }

    pub fn from_lookup<L>(lookup: L) -> Result<Self, AppError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = env::parse_var(&lookup, "JOBPILOT_CHAT_HOST")? {
            config.host = host;
        }
        if let Some(port) = env::parse_var(&lookup, "JOBPILOT_CHAT_PORT")? {
            config.port = port;
        }
        if let Some(path) = env::parse_var(&lookup, "JOBPILOT_CHAT_PATH")? {
            config.path = path;
        }
        if let Some(topic) = env::parse_var(&lookup, "JOBPILOT_CHAT_TOPIC")? {
            config.topic = topic;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_CHAT_KEEPALIVE_SECS")? {
            config.keep_alive = t;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_CHAT_RECONNECT_SECS")? {
            config.reconnect_interval = t;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_CHAT_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = t;
        }
        if let Some(t) = env::parse_secs(&lookup, "JOBPILOT_CHAT_ACK_TIMEOUT_SECS")? {
            config.ack_timeout = t;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.host.trim().is_empty() {
            return Err(AppError::ConfigError("Chat host is empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(AppError::ConfigError(format!(
                "Chat path '{}' must start with '/'",
                self.path
            )));
        }
        if self.topic.is_empty() {
            return Err(AppError::ConfigError("Chat topic is empty".into()));
        }
        let secs = self.keep_alive.as_secs();
        if secs == 0 || secs > u64::from(u16::MAX) {
            return Err(AppError::ConfigError(format!(
                "Keep-alive must be between 1 and {} seconds",
                u16::MAX
            )));
        }
        if self.ack_timeout.is_zero() {
            return Err(AppError::ConfigError("Ack timeout must be positive".into()));
        }
        Ok(())
    }

    fn keep_alive_secs(&self) -> u16 {
        u16::try_from(self.keep_alive.as_secs()).unwrap_or(u16::MAX)
    }

    /// How long a PINGREQ may go unanswered.
    fn ping_timeout(&self) -> Duration {
        self.keep_alive * 3 / 2
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

struct InFlight {
    packet_id: u16,
    published_at: Instant,
    message: OutboundMessage,
}

/// One live MQTT session.
struct Session<C> {
    conn: C,
    client_id: String,
    /// Published, not yet acknowledged, in publish order.
    inflight: VecDeque<InFlight>,
    last_packet_id: u16,
    keep_alive: Interval,
    /// Set while a PINGREQ is waiting for its PINGRESP.
    ping_sent_at: Option<Instant>,
}

impl<C> Session<C> {
    fn new(conn: C, client_id: String, keep_alive: Duration) -> Self {
        let mut ticker = tokio::time::interval_at(Instant::now() + keep_alive, keep_alive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            conn,
            client_id,
            inflight: VecDeque::new(),
            last_packet_id: 0,
            keep_alive: ticker,
            ping_sent_at: None,
        }
    }

    /// Next packet id that is non-zero and not in flight.
    fn allocate_id(&mut self) -> u16 {
        loop {
            self.last_packet_id = self.last_packet_id.wrapping_add(1);
            let id = self.last_packet_id;
            if id != 0 && !self.inflight.iter().any(|f| f.packet_id == id) {
                return id;
            }
        }
    }

    fn acknowledge(&mut self, packet_id: u16) -> Option<OutboundMessage> {
        let index = self
            .inflight
            .iter()
            .position(|f| f.packet_id == packet_id)?;
        self.inflight.remove(index).map(|f| f.message)
    }

    /// Fails once a PINGREQ or the oldest publish has gone unanswered too long.
    fn check_liveness(
        &self,
        now: Instant,
        ping_timeout: Duration,
        ack_timeout: Duration,
    ) -> Result<(), AppError> {
        if self
            .ping_sent_at
            .is_some_and(|sent| now.duration_since(sent) >= ping_timeout)
        {
            return Err(AppError::Timeout(ping_timeout.as_secs()));
        }
        if self
            .inflight
            .front()
            .is_some_and(|oldest| now.duration_since(oldest.published_at) >= ack_timeout)
        {
            return Err(AppError::Timeout(ack_timeout.as_secs()));
        }
        Ok(())
    }
}

/// Tracks CONNECT refusals so a dead session is not retried forever.
#[derive(Debug, Default)]
struct AuthState {
    identity: Option<Identity>,
    refusals: u32,
    refused_generation: Option<u64>,
}

impl AuthState {
    /// Classify a refused CONNACK. Two credential refusals against the same
    /// credential generation mean the login session itself is gone.
    fn refused(&mut self, return_code: u8, generation: u64) -> AppError {
        if !matches!(
            return_code,
            CONNACK_BAD_CREDENTIALS | CONNACK_NOT_AUTHORIZED
        ) {
            return AppError::ProtocolError(format!("CONNECT refused with code {return_code}"));
        }
        // The token may have rotated; look it up again next time.
        self.identity = None;
        if self.refused_generation == Some(generation) {
            self.refusals += 1;
        } else {
            self.refused_generation = Some(generation);
            self.refusals = 1;
        }
        if self.refusals >= 2 {
            AppError::SessionExpired(format!(
                "CONNECT refused {} times with code {return_code} at credential generation {generation}",
                self.refusals
            ))
        } else {
            AppError::AuthError(format!("CONNECT refused with code {return_code}"))
        }
    }

    fn accepted(&mut self) {
        self.refusals = 0;
        self.refused_generation = None;
    }
}

/// Millisecond message ids, strictly increasing within one client.
#[derive(Debug, Default)]
struct MessageClock {
    last: i64,
}

impl MessageClock {
    fn next(&mut self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        self.last = now.max(self.last + 1);
        self.last
    }
}

enum Event {
    Stop,
    Packet(Result<Option<Packet>, AppError>),
    Outbound(Option<OutboundMessage>),
    KeepAlive,
}

pub struct ChatProtocolClient<A, K, H = TracingInboundHandler> {
    authority: A,
    connector: K,
    credentials: Arc<CredentialStore>,
    handler: H,
    config: ChatConfig,
    retry: RetryPolicy,
    state: watch::Sender<ConnectionState>,
}

impl<A, K> ChatProtocolClient<A, K, TracingInboundHandler>
where
    A: SessionAuthority,
    K: Connector,
{
    pub fn new(
        authority: A,
        connector: K,
        credentials: Arc<CredentialStore>,
        config: ChatConfig,
    ) -> Self {
        let retry = RetryPolicy::reconnect(config.reconnect_interval);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            authority,
            connector,
            credentials,
            handler: TracingInboundHandler,
            config,
            retry,
            state,
        }
    }
}

impl<A, K, H> ChatProtocolClient<A, K, H>
where
    A: SessionAuthority,
    K: Connector,
    H: InboundHandler,
{
    pub fn with_handler<H2: InboundHandler>(self, handler: H2) -> ChatProtocolClient<A, K, H2> {
        ChatProtocolClient {
            authority: self.authority,
            connector: self.connector,
            credentials: self.credentials,
            handler,
            config: self.config,
            retry: self.retry,
            state: self.state,
        }
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Run on a dedicated OS thread with its own single-threaded runtime.
    pub fn spawn(
        self,
        queue: OutboundQueue,
        cancel: CancellationToken,
    ) -> Result<ChatThread, AppError> {
        let state = self.state.subscribe();
        let token = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("chat-client".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| AppError::Generic(format!("Chat runtime failed to start: {e}")))?;
                runtime.block_on(self.run(queue, token))
            })
            .map_err(|e| AppError::Generic(format!("Chat thread failed to start: {e}")))?;

        Ok(ChatThread {
            handle: Some(handle),
            cancel,
            state,
        })
    }

    /// Deliver queued messages until the queue is closed and drained, or
    /// `cancel` fires. Returns an error only for failures no reconnect can fix.
    pub async fn run(
        &self,
        mut queue: OutboundQueue,
        cancel: CancellationToken,
    ) -> Result<(), AppError> {
        let tracker = queue.tracker();
        let mut auth = AuthState::default();
        let mut clock = MessageClock::default();
        let mut session: Option<Session<K::Conn>> = None;
        tracing::info!(url = %self.config.url(), topic = %self.config.topic, "Chat client started");

        let result = loop {
            let Some(active) = session.as_mut() else {
                let next = tokio::select! {
                    () = cancel.cancelled() => break Ok(()),
                    next = queue.next() => next,
                };
                let Some(message) = next else {
                    break Ok(());
                };
                queue.requeue_front(message);
                match self.establish(&mut auth, &cancel, false).await {
                    Ok(Some(s)) => session = Some(s),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
                continue;
            };

            if queue.is_finished() && active.inflight.is_empty() {
                tracing::info!(client_id = %active.client_id, "Outbound queue drained");
                break Ok(());
            }

            let can_publish = !queue.is_finished() && active.inflight.len() < MAX_INFLIGHT;
            let event = tokio::select! {
                () = cancel.cancelled() => Event::Stop,
                packet = active.conn.recv() => Event::Packet(packet),
                next = queue.next(), if can_publish => Event::Outbound(next),
                _ = active.keep_alive.tick() => Event::KeepAlive,
            };

            let own_uid = auth.identity.as_ref().map(|i| i.uid);
            let outcome = match event {
                Event::Stop => break Ok(()),
                Event::Outbound(None) => Ok(()),
                Event::Outbound(Some(message)) => {
                    self.publish(active, &mut queue, message, clock.next(), &tracker)
                        .await
                }
                Event::Packet(Ok(Some(packet))) => {
                    self.handle_packet(active, packet, own_uid, &tracker).await
                }
                Event::Packet(Ok(None)) => Err(AppError::NetworkError(
                    "Connection closed by broker".into(),
                )),
                Event::Packet(Err(e)) => Err(e),
                Event::KeepAlive => self.keep_alive(active).await,
            };

            if let Err(error) = outcome {
                tracing::warn!(error = %error, kind = ?error.kind(), "Chat connection lost");
                if let Some(lost) = session.take() {
                    self.recover(lost, &mut queue, &tracker).await;
                }
                match self.establish(&mut auth, &cancel, true).await {
                    Ok(Some(s)) => session = Some(s),
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        };

        if let Some(active) = session.take() {
            self.shutdown(active, &tracker).await;
        }
        self.set_state(ConnectionState::Disconnected);
        let counts = tracker.counts();
        tracing::info!(
            enqueued = counts.enqueued,
            sent = counts.sent,
            acknowledged = counts.acknowledged,
            "Chat client stopped"
        );
        result
    }

    /// Connect, retrying until success or cancellation. `Ok(None)` means
    /// cancelled.
    async fn establish(
        &self,
        auth: &mut AuthState,
        cancel: &CancellationToken,
        mut reconnecting: bool,
    ) -> Result<Option<Session<K::Conn>>, AppError> {
        let mut attempt = 0u32;
        loop {
            self.set_state(if reconnecting {
                ConnectionState::Reconnecting
            } else {
                ConnectionState::Connecting
            });
            reconnecting = true;

            let generation = self.credentials.generation();
            let result = tokio::select! {
                () = cancel.cancelled() => return Ok(None),
                result = self.connect_once(auth, generation) => result,
            };

            match result {
                Ok(session) => {
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(client_id = %session.client_id, generation, "Chat connected");
                    return Ok(Some(session));
                }
                Err(AppError::SessionExpired(reason)) => {
                    tracing::warn!(
                        reason = %reason,
                        generation,
                        "Chat session expired, waiting for fresh credentials"
                    );
                    if !self.wait_for_credentials(generation, cancel).await {
                        return Ok(None);
                    }
                    attempt = 0;
                }
                Err(e) if is_terminal(&e) => {
                    tracing::error!(error = %e, kind = ?e.kind(), "Chat connect failed permanently");
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        error = %e,
                        kind = ?e.kind(),
                        delay_ms = %delay.as_millis(),
                        "Chat connect failed, retrying"
                    );
                    tokio::select! {
                        () = cancel.cancelled() => return Ok(None),
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn connect_once(
        &self,
        auth: &mut AuthState,
        generation: u64,
    ) -> Result<Session<K::Conn>, AppError> {
        let identity = match &auth.identity {
            Some(identity) => identity.clone(),
            None => {
                let identity = self.authority.identity().await?;
                auth.identity = Some(identity.clone());
                identity
            }
        };
        // wt2 is single-use, so every attempt negotiates a new one.
        let wt2 = self.authority.negotiation_token().await?;
        let credentials = self.credentials.snapshot();

        let client_id = new_client_id();
        let request = ConnectRequest {
            url: self.config.url(),
            client_id: client_id.clone(),
            headers: handshake_headers(&credentials, &wt2),
        };
        tracing::debug!(client_id = %client_id, generation, "Opening chat transport");
        let mut conn = self.connector.connect(&request).await?;

        let connect = Connect {
            client_id: client_id.clone(),
            username: Some(format!("{}|0", identity.token)),
            password: Some(wt2),
            keep_alive_secs: self.config.keep_alive_secs(),
            clean_session: true,
        };
        let ack = match self.handshake(&mut conn, connect).await {
            Ok(ack) => ack,
            Err(e) => {
                conn.close().await;
                return Err(e);
            }
        };
        if !ack.is_accepted() {
            conn.close().await;
            return Err(auth.refused(ack.return_code, generation));
        }
        auth.accepted();

        let mut session = Session::new(conn, client_id, self.config.keep_alive);
        let packet_id = session.allocate_id();
        session
            .conn
            .send(&Packet::Subscribe(Subscribe {
                packet_id,
                filters: vec![(self.config.topic.clone(), QoS::AtMostOnce)],
            }))
            .await?;
        Ok(session)
    }

    async fn handshake(&self, conn: &mut K::Conn, connect: Connect) -> Result<ConnAck, AppError> {
        let timeout = self.config.connect_timeout;
        conn.send(&Packet::Connect(connect)).await?;
        let reply = tokio::time::timeout(timeout, conn.recv())
            .await
            .map_err(|_| AppError::Timeout(timeout.as_secs()))??;
        match reply {
            Some(Packet::ConnAck(ack)) => Ok(ack),
            Some(other) => Err(AppError::ProtocolError(format!(
                "Expected CONNACK, got {}",
                other.name()
            ))),
            None => Err(AppError::NetworkError(
                "Connection closed during MQTT handshake".into(),
            )),
        }
    }

    /// Wait until the credential generation moves past `seen`. Returns false
    /// if cancelled first.
    async fn wait_for_credentials(&self, seen: u64, cancel: &CancellationToken) -> bool {
        loop {
            if self.credentials.generation() > seen {
                return true;
            }
            tokio::select! {
                () = cancel.cancelled() => return false,
                () = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
        }
    }

    async fn publish(
        &self,
        session: &mut Session<K::Conn>,
        queue: &mut OutboundQueue,
        message: OutboundMessage,
        mid: i64,
        tracker: &DeliveryTracker,
    ) -> Result<(), AppError> {
        let envelope = build_envelope(&message, SENDER_UID, mid);
        let packet_id = session.allocate_id();
        let packet = Packet::Publish(Publish {
            topic: self.config.topic.clone(),
            qos: QoS::AtLeastOnce,
            packet_id: Some(packet_id),
            dup: false,
            retain: false,
            payload: encode_envelope(&envelope),
        });
        if let Err(e) = session.conn.send(&packet).await {
            queue.requeue_front(message);
            return Err(e);
        }
        tracing::debug!(
            packet_id,
            mid,
            recipient = %message.recipient_id(),
            kind = message.kind(),
            "Message published"
        );
        session.inflight.push_back(InFlight {
            packet_id,
            published_at: Instant::now(),
            message,
        });
        tracker.record_sent();
        Ok(())
    }

    async fn handle_packet(
        &self,
        session: &mut Session<K::Conn>,
        packet: Packet,
        own_uid: Option<i64>,
        tracker: &DeliveryTracker,
    ) -> Result<(), AppError> {
        match packet {
            Packet::PubAck { packet_id } => match session.acknowledge(packet_id) {
                Some(message) => {
                    tracker.record_acknowledged();
                    tracing::debug!(
                        packet_id,
                        recipient = %message.recipient_id(),
                        "Publish acknowledged"
                    );
                }
                None => tracing::debug!(packet_id, "PUBACK for unknown packet id"),
            },
            Packet::Publish(publish) => {
                if let Some(packet_id) = publish.packet_id {
                    session.conn.send(&Packet::PubAck { packet_id }).await?;
                }
                self.dispatch(&publish.payload, own_uid);
            }
            Packet::SubAck(ack) => {
                if ack.return_codes.contains(&0x80) {
                    tracing::warn!(packet_id = ack.packet_id, "Subscription refused");
                } else {
                    tracing::debug!(packet_id = ack.packet_id, "Subscribed");
                }
            }
            Packet::PingResp => {
                session.ping_sent_at = None;
                tracing::trace!("Ping answered");
            }
            other => tracing::warn!(packet = other.name(), "Unexpected packet from broker"),
        }
        Ok(())
    }

    /// Fail the session if the broker has gone quiet, otherwise ping it.
    async fn keep_alive(&self, session: &mut Session<K::Conn>) -> Result<(), AppError> {
        let now = Instant::now();
        session.check_liveness(now, self.config.ping_timeout(), self.config.ack_timeout)?;
        if session.ping_sent_at.is_none() {
            session.conn.send(&Packet::PingReq).await?;
            session.ping_sent_at = Some(now);
        }
        Ok(())
    }

    fn dispatch(&self, payload: &[u8], own_uid: Option<i64>) {
        match decode_inbound(payload) {
            Ok(event) => {
                if matches!(event, InboundEvent::ResumeRequest { .. })
                    && event.from_uid().is_some()
                    && event.from_uid() == own_uid
                {
                    tracing::debug!("Ignoring own resume request");
                    return;
                }
                self.handler.handle(&event);
            }
            Err(e) => tracing::warn!(error = %e, "Dropping undecodable inbound message"),
        }
    }

    /// Return in-flight messages to the queue head and drop the transport.
    async fn recover(
        &self,
        mut lost: Session<K::Conn>,
        queue: &mut OutboundQueue,
        tracker: &DeliveryTracker,
    ) {
        let unacked = lost.inflight.len();
        if unacked > 0 {
            queue.requeue_all_front(lost.inflight.drain(..).map(|f| f.message));
            tracker.record_requeued(unacked as u64);
            tracing::info!(
                client_id = %lost.client_id,
                unacked,
                "Requeued unacknowledged messages"
            );
        }
        lost.conn.close().await;
    }

    async fn shutdown(&self, mut session: Session<K::Conn>, tracker: &DeliveryTracker) {
        let unacked = session.inflight.len();
        if unacked > 0 {
            tracker.record_requeued(unacked as u64);
            tracing::warn!(unacked, "Stopping with unacknowledged messages");
        }
        if let Err(e) = session.conn.send(&Packet::Disconnect).await {
            tracing::debug!(error = %e, "DISCONNECT not sent");
        }
        session.conn.close().await;
        tracing::info!(client_id = %session.client_id, "Chat disconnected");
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "Chat connection state changed");
        }
    }
}

/// Failures that no later attempt can fix. Anything else, including HTTP
/// errors from the identity endpoints, ends only the current attempt.
fn is_terminal(error: &AppError) -> bool {
    matches!(error, AppError::ConfigError(_) | AppError::ChannelClosed(_))
}

/// `ws-` followed by 16 uppercase hex digits.
fn new_client_id() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("ws-{}", &hex[..16])
}

fn handshake_headers(credentials: &Credentials, wt2: &str) -> Vec<(String, String)> {
    let mut headers = vec![("Cookie".to_string(), credentials.cookie_header())];
    if let Some(agent) = credentials.header("User-Agent") {
        headers.push(("User-Agent".to_string(), agent.to_string()));
    }
    headers.push(("Sec-WebSocket-Protocol".to_string(), wt2.to_string()));
    headers
}

/// Handle to a client running on its own thread.
pub struct ChatThread {
    handle: Option<JoinHandle<Result<(), AppError>>>,
    cancel: CancellationToken,
    state: watch::Receiver<ConnectionState>,
}

impl ChatThread {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Block until the client exits on its own, once the queue is closed
    /// and every message acknowledged.
    pub fn join(mut self) -> Result<(), AppError> {
        self.join_inner()
    }

    /// Cancel the client and block until its thread has exited.
    pub fn stop(mut self) -> Result<(), AppError> {
        self.cancel.cancel();
        self.join_inner()
    }

    fn join_inner(&mut self) -> Result<(), AppError> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(AppError::Generic("Chat thread panicked".into()))),
            None => Ok(()),
        }
    }
}

impl Drop for ChatThread {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use jobpilot_core::outbound::DeliveryCounts;
    use jobpilot_core::outbound_channel;
    use jobpilot_core::testutil::MockSessionAuthority;

    use super::*;
    use crate::envelope::{ChatMessage, ChatProtocol, ChatUser, MessageBody, decode_envelope};
    use crate::testutil::{MockConnector, MockInboundHandler};

    type TestClient = ChatProtocolClient<MockSessionAuthority, MockConnector, MockInboundHandler>;

    fn credentials() -> Arc<CredentialStore> {
        Arc::new(CredentialStore::new(Credentials {
            cookies: BTreeMap::from([("sid".to_string(), "abc".to_string())]),
            headers: BTreeMap::from([("User-Agent".to_string(), "jobpilot-test".to_string())]),
            generation: 0,
        }))
    }

    fn client_with(
        connector: MockConnector,
        authority: MockSessionAuthority,
        credentials: Arc<CredentialStore>,
    ) -> (TestClient, MockInboundHandler) {
        let handler = MockInboundHandler::new();
        let client = ChatProtocolClient::new(authority, connector, credentials, ChatConfig::default())
            .with_handler(handler.clone());
        (client, handler)
    }

    fn sent_texts(connector: &MockConnector) -> Vec<String> {
        connector
            .log()
            .publishes
            .iter()
            .map(|p| {
                let envelope = decode_envelope(&p.payload).unwrap();
                envelope.messages[0].body.clone().unwrap().text
            })
            .collect()
    }

    fn inbound(kind: i32, from_uid: i64, text: &str) -> ChatProtocol {
        ChatProtocol {
            r#type: kind,
            messages: vec![ChatMessage {
                from: Some(ChatUser {
                    uid: from_uid,
                    name: String::new(),
                }),
                to: None,
                r#type: 1,
                mid: 1,
                time: 2,
                body: Some(MessageBody {
                    r#type: 1,
                    template_id: 1,
                    text: text.into(),
                    image: None,
                }),
                cmid: 1,
            }],
        }
    }

    fn in_flight(packet_id: u16, published_at: Instant) -> InFlight {
        InFlight {
            packet_id,
            published_at,
            message: OutboundMessage::text("b", "x"),
        }
    }

    fn inbound_publish(packet_id: u16, payload: bytes::Bytes) -> Packet {
        Packet::Publish(Publish {
            topic: "chat".into(),
            qos: QoS::AtLeastOnce,
            packet_id: Some(packet_id),
            dup: false,
            retain: false,
            payload,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn every_message_is_acknowledged() {
        let connector = MockConnector::new();
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        for i in 0..5 {
            outbox
                .enqueue(OutboundMessage::text(format!("boss-{i}"), format!("hello {i}")))
                .unwrap();
        }
        drop(outbox);

        client.run(queue, CancellationToken::new()).await.unwrap();

        assert_eq!(
            tracker.counts(),
            DeliveryCounts {
                enqueued: 5,
                sent: 5,
                acknowledged: 5,
            }
        );
        assert!(tracker.is_complete());
        assert_eq!(
            sent_texts(&connector),
            vec!["hello 0", "hello 1", "hello 2", "hello 3", "hello 4"]
        );
        let log = connector.log();
        assert_eq!(log.connects.len(), 1);
        assert_eq!(log.subscriptions, vec!["chat".to_string()]);
        assert!(log.publishes.iter().all(|p| p.qos == QoS::AtLeastOnce));
        assert_eq!(log.disconnects, 1);
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_transport_redelivers_unacknowledged() {
        let connector = MockConnector::new().drop_after_acks(2);
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        for i in 0..5 {
            outbox
                .enqueue(OutboundMessage::text("boss", format!("m{i}")))
                .unwrap();
        }
        drop(outbox);

        client.run(queue, CancellationToken::new()).await.unwrap();

        assert_eq!(tracker.acknowledged(), 5);
        assert_eq!(tracker.sent(), 5);
        let log = connector.log();
        assert_eq!(log.connects.len(), 2);
        assert_ne!(log.requests[0].client_id, log.requests[1].client_id);
        // The message that hit the dead connection went out twice.
        assert!(log.publishes.len() > 5);
        let texts = sent_texts(&connector);
        for i in 0..5 {
            assert!(texts.contains(&format!("m{i}")), "m{i} never sent");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refused_connect_negotiates_new_token() {
        let connector = MockConnector::new().refuse_connects(&[4]);
        let authority = MockSessionAuthority::new(7, "tok");
        let (client, _) = client_with(connector.clone(), authority.clone(), credentials());
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        drop(outbox);

        let started = Instant::now();
        client.run(queue, CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(8));
        assert_eq!(tracker.acknowledged(), 1);
        assert_eq!(authority.negotiation_calls(), 2);
        assert_eq!(authority.identity_calls(), 2);
        let passwords: Vec<_> = connector
            .log()
            .connects
            .iter()
            .map(|c| c.password.clone().unwrap())
            .collect();
        assert_eq!(passwords, vec!["wt2-1", "wt2-2"]);
        assert!(
            connector
                .log()
                .connects
                .iter()
                .all(|c| c.username.as_deref() == Some("tok|0") && c.clean_session)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_session_waits_for_new_credentials() {
        let connector = MockConnector::new().refuse_connects(&[4, 4]);
        let store = credentials();
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            store.clone(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        let state = client.subscribe_state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(queue, cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(connector.log().connects.len(), 2);
        assert_eq!(*state.borrow(), ConnectionState::Reconnecting);
        assert_eq!(tracker.acknowledged(), 0);

        store
            .update(
                BTreeMap::from([("sid".to_string(), "fresh".to_string())]),
                BTreeMap::new(),
            )
            .unwrap();
        tokio::time::timeout(Duration::from_secs(60), tracker.wait_complete())
            .await
            .unwrap();

        let log = connector.log();
        assert_eq!(log.connects.len(), 3);
        assert_eq!(log.requests[2].header("Cookie"), Some("sid=fresh"));

        cancel.cancel();
        task.await.unwrap().unwrap();
        drop(outbox);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_only_when_a_message_arrives() {
        let connector = MockConnector::new();
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        let state = client.subscribe_state();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(queue, cancel).await }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(connector.log().requests.is_empty());
        assert_eq!(*state.borrow(), ConnectionState::Disconnected);

        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        tokio::time::timeout(Duration::from_secs(10), tracker.wait_complete())
            .await
            .unwrap();
        assert_eq!(*state.borrow(), ConnectionState::Connected);

        let request = connector.log().requests[0].clone();
        assert_eq!(request.url, "wss://ws.zhipin.com:443/chatws");
        assert_eq!(request.client_id.len(), 19);
        assert!(request.client_id.starts_with("ws-"));
        assert!(
            request.client_id[3..]
                .chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase())
        );
        assert_eq!(request.header("Cookie"), Some("sid=abc"));
        assert_eq!(request.header("User-Agent"), Some("jobpilot-test"));
        assert_eq!(request.header("Sec-WebSocket-Protocol"), Some("wt2-1"));

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn transport_failures_are_retried() {
        let connector = MockConnector::new().fail_transports(2);
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        drop(outbox);

        client.run(queue, CancellationToken::new()).await.unwrap();

        assert_eq!(tracker.acknowledged(), 1);
        let log = connector.log();
        assert_eq!(log.refused_transports, 2);
        assert_eq!(log.connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn identity_failures_only_end_the_attempt() {
        let connector = MockConnector::new();
        let authority = MockSessionAuthority::new(7, "tok").with_identity_errors(vec![
            AppError::from_status(401, "unauthorized"),
            AppError::MissingField("user_info: zpData".into()),
        ]);
        let (client, _) = client_with(connector.clone(), authority.clone(), credentials());
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        drop(outbox);

        let started = Instant::now();
        client.run(queue, CancellationToken::new()).await.unwrap();

        assert!(started.elapsed() >= Duration::from_secs(16));
        assert_eq!(tracker.acknowledged(), 1);
        assert_eq!(authority.identity_calls(), 3);
        assert_eq!(authority.negotiation_calls(), 1);
        assert_eq!(connector.log().connects.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_broker_is_detected_and_messages_redelivered() {
        let connector = MockConnector::new().go_silent();
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        drop(outbox);

        let started = Instant::now();
        client.run(queue, CancellationToken::new()).await.unwrap();

        // One unanswered PINGREQ, then a second tick past the ping bound.
        assert!(started.elapsed() >= Duration::from_millis(7500));
        assert_eq!(tracker.acknowledged(), 1);
        let log = connector.log();
        assert_eq!(log.connects.len(), 2);
        assert_eq!(sent_texts(&connector), vec!["hi", "hi"]);
        assert!(log.pings >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn inbound_publishes_are_acked_and_dispatched() {
        let connector = MockConnector::new();
        let (client, handler) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(queue, cancel).await }
        });
        tracker.wait_complete().await;

        let chat = encode_envelope(&inbound(1, 99, "hello candidate"));
        let own_request = encode_envelope(&inbound(7, 7, ""));
        let request = encode_envelope(&inbound(7, 99, ""));
        let unknown = encode_envelope(&inbound(9, 99, ""));
        assert!(connector.inject(inbound_publish(21, chat)));
        assert!(connector.inject(inbound_publish(22, own_request)));
        assert!(connector.inject(inbound_publish(23, request)));
        assert!(connector.inject(inbound_publish(24, unknown)));
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(connector.log().client_acks, vec![21, 22, 23, 24]);
        assert_eq!(
            handler.events(),
            vec![
                InboundEvent::Chat {
                    from_uid: 99,
                    body_type: 1,
                    text: Some("hello candidate".into()),
                    time: 2,
                },
                InboundEvent::ResumeRequest { from_uid: 99, mid: 1 },
            ]
        );

        cancel.cancel();
        task.await.unwrap().unwrap();
        drop(outbox);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_pings_while_idle() {
        let connector = MockConnector::new();
        let (client, _) = client_with(
            connector.clone(),
            MockSessionAuthority::new(7, "tok"),
            credentials(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss", "hi")).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            async move { client.run(queue, cancel).await }
        });
        tracker.wait_complete().await;

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(connector.log().pings >= 3);
        assert_eq!(connector.log().connects.len(), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
        drop(outbox);
    }

    #[test]
    fn spawned_thread_drains_queue_and_exits() {
        let connector = MockConnector::new();
        let client = ChatProtocolClient::new(
            MockSessionAuthority::new(7, "tok"),
            connector.clone(),
            credentials(),
            ChatConfig::default(),
        );
        let (outbox, queue) = outbound_channel();
        let tracker = outbox.delivery();
        outbox.enqueue(OutboundMessage::text("boss-1", "one")).unwrap();
        outbox.enqueue(OutboundMessage::text("boss-2", "two")).unwrap();
        drop(outbox);

        let thread = client.spawn(queue, CancellationToken::new()).unwrap();
        thread.join().unwrap();

        assert!(tracker.is_complete());
        assert_eq!(connector.log().publishes.len(), 2);
    }

    #[test]
    fn stop_cancels_an_idle_client() {
        let client = ChatProtocolClient::new(
            MockSessionAuthority::new(7, "tok"),
            MockConnector::new(),
            credentials(),
            ChatConfig::default(),
        );
        let (_outbox, queue) = outbound_channel();
        let thread = client.spawn(queue, CancellationToken::new()).unwrap();
        thread.stop().unwrap();
    }

    #[test]
    fn refusal_classification() {
        let mut auth = AuthState::default();
        assert!(matches!(auth.refused(4, 0), AppError::AuthError(_)));
        assert!(matches!(auth.refused(5, 0), AppError::SessionExpired(_)));
        // A new credential generation starts the count again.
        assert!(matches!(auth.refused(4, 1), AppError::AuthError(_)));
        auth.accepted();
        assert!(matches!(auth.refused(4, 1), AppError::AuthError(_)));
        assert!(matches!(auth.refused(2, 1), AppError::ProtocolError(_)));
    }

    #[tokio::test]
    async fn packet_ids_skip_zero_and_inflight() {
        let mut session = Session::new((), "ws-test".into(), Duration::from_secs(5));
        session.last_packet_id = u16::MAX - 1;
        session.inflight.push_back(in_flight(u16::MAX, Instant::now()));
        session.inflight.push_back(in_flight(1, Instant::now()));
        assert_eq!(session.allocate_id(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn liveness_bounds_pings_and_acks() {
        let mut session = Session::new((), "ws-test".into(), Duration::from_secs(5));
        let start = Instant::now();
        let ping = Duration::from_millis(7500);
        let ack = Duration::from_secs(30);
        assert!(session.check_liveness(start, ping, ack).is_ok());

        session.ping_sent_at = Some(start);
        assert!(
            session
                .check_liveness(start + Duration::from_secs(7), ping, ack)
                .is_ok()
        );
        assert!(matches!(
            session.check_liveness(start + ping, ping, ack),
            Err(AppError::Timeout(7))
        ));

        session.ping_sent_at = None;
        session.inflight.push_back(in_flight(1, start));
        assert!(
            session
                .check_liveness(start + Duration::from_secs(29), ping, ack)
                .is_ok()
        );
        assert!(matches!(
            session.check_liveness(start + ack, ping, ack),
            Err(AppError::Timeout(30))
        ));
    }

    #[test]
    fn message_clock_is_strictly_increasing() {
        let mut clock = MessageClock::default();
        let a = clock.next();
        let b = clock.next();
        assert!(b > a);
    }

    #[test]
    fn config_from_lookup() {
        let config = ChatConfig::from_lookup(|name| match name {
            "JOBPILOT_CHAT_HOST" => Some("chat.example.com".into()),
            "JOBPILOT_CHAT_PORT" => Some("8443".into()),
            "JOBPILOT_CHAT_RECONNECT_SECS" => Some("3".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.url(), "wss://chat.example.com:8443/chatws");
        assert_eq!(config.reconnect_interval, Duration::from_secs(3));
        assert_eq!(config.keep_alive, Duration::from_secs(5));
        assert_eq!(config.ack_timeout, Duration::from_secs(30));

        let err = ChatConfig::from_lookup(|name| match name {
            "JOBPILOT_CHAT_PATH" => Some("chatws".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }
}
