#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use backoff::backoff::Backoff as _;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::Config;
use super::framing::{self, FrameDecoder};
use super::traits::{MessageParser, ReadySignal};
use super::transport::{BoxedSocket, Transport};

/// Broadcast channel capacity for channel events.
const BROADCAST_CAPACITY: usize = 1024;

/// Read buffer size for draining the socket.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Connection state tracking.
#[expect(
    clippy::exhaustive_enums,
    reason = "The five-state lifecycle is fixed; consumers match on it exhaustively"
)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// No socket and no attempt in flight
    Disconnected,
    /// Socket handshake in progress
    Connecting,
    /// Socket established, awaiting the worker's readiness handshake
    Connected,
    /// Worker announced readiness; sends are accepted
    Ready,
    /// Terminal: stopped by the caller, ceiling exhausted, or worker gone
    Stopped,
}

impl ConnectionState {
    /// Check if a socket is currently established.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected | Self::Ready)
    }

    /// Check if sends are currently accepted.
    #[must_use]
    pub const fn is_ready(self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Check if the channel is permanently down.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped)
    }
}

/// Channel lifecycle and payload events fanned out to subscribers.
///
/// The watch snapshot read by [`ConnectionManager::state`] is always
/// updated before the corresponding event is broadcast, so an observer that
/// reacts to an event never sees a stale snapshot.
#[expect(
    clippy::exhaustive_enums,
    reason = "The four event kinds are the protocol; consumers match on them exhaustively"
)]
#[derive(Debug, Clone)]
pub enum ChannelEvent<M> {
    /// A message arrived from the worker
    Message(M),
    /// The worker announced readiness; sends are accepted from now on
    Ready,
    /// The connection state changed
    StateChange(ConnectionState),
    /// Terminal failure: the retry ceiling is exhausted or the worker
    /// process is gone for good. Fires at most once.
    RetriesExhausted,
}

/// Why an established session ended.
enum SessionEnd {
    /// `stop()` observed mid-session
    Stopped,
    /// Socket error or orderly close by the worker
    Disconnected,
}

/// Manages the duplex channel to the sidecar worker: lifecycle, bounded
/// reconnection, readiness gating, and typed event fan-out.
///
/// One manager owns one transport and at most one live socket. The
/// connection is maintained by a background task spawned on the first
/// [`connect`](Self::connect); connection failures never surface as errors
/// to the caller, only as state transitions and events.
///
/// # Example
///
/// ```ignore
/// let manager = ConnectionManager::new(transport, config, LineParser);
/// let mut events = manager.subscribe();
/// manager.connect();
///
/// while let Ok(event) = events.recv().await {
///     match event {
///         ChannelEvent::Ready => manager.send(Message::command(args)),
///         ChannelEvent::Message(msg) => println!("worker: {msg:?}"),
///         ChannelEvent::StateChange(state) => println!("now {state}"),
///         ChannelEvent::RetriesExhausted => break,
///     }
/// }
/// ```
pub struct ConnectionManager<M, P>
where
    M: DeserializeOwned + Serialize + ReadySignal + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    config: Config,
    transport: Arc<dyn Transport>,
    parser: Arc<P>,
    /// Watch channel for state snapshots and change notifications
    state_tx: watch::Sender<ConnectionState>,
    /// Dedicated receiver for synchronous snapshot reads
    state_rx: watch::Receiver<ConnectionState>,
    /// Broadcast sender for channel events
    event_tx: broadcast::Sender<ChannelEvent<M>>,
    /// Queue of outbound messages accepted while ready
    sender_tx: mpsc::UnboundedSender<M>,
    /// Taken by the connection task on the first `connect()`
    sender_rx: Mutex<Option<mpsc::UnboundedReceiver<M>>>,
    /// Cancellation primitive observed by the connection task and timers
    shutdown: CancellationToken,
    /// Set (before the event is broadcast) when the channel fails
    /// terminally, so late subscribers can still observe the outcome
    exhausted: Arc<AtomicBool>,
}

impl<M, P> ConnectionManager<M, P>
where
    M: DeserializeOwned + Serialize + ReadySignal + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    /// Create a new manager in the `Disconnected` state.
    ///
    /// Nothing touches the socket until [`connect`](Self::connect) is
    /// called.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, config: Config, parser: P) -> Self {
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

        Self {
            config,
            transport,
            parser: Arc::new(parser),
            state_tx,
            state_rx,
            event_tx,
            sender_tx,
            sender_rx: Mutex::new(Some(sender_rx)),
            shutdown: CancellationToken::new(),
            exhausted: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start maintaining the connection in the background.
    ///
    /// A no-op unless the current state is `Disconnected`: repeated calls
    /// while connecting, connected, or stopped do nothing, so concurrent
    /// connection attempts are impossible. Once started, the background
    /// task owns reconnection until `stop()` or the retry ceiling ends it.
    pub fn connect(&self) {
        let mut guard = self
            .sender_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            debug!("connect() ignored: connection task already started");
            return;
        }

        let started = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !started {
            debug!(state = %self.state(), "connect() ignored: not disconnected");
            return;
        }
        _ = self
            .event_tx
            .send(ChannelEvent::StateChange(ConnectionState::Connecting));

        let Some(sender_rx) = guard.take() else {
            return;
        };
        drop(guard);

        let transport = Arc::clone(&self.transport);
        let config = self.config.clone();
        let parser = Arc::clone(&self.parser);
        let state_tx = self.state_tx.clone();
        let event_tx = self.event_tx.clone();
        let shutdown = self.shutdown.clone();
        let exhausted = Arc::clone(&self.exhausted);

        tokio::spawn(async move {
            connection_loop(
                transport, config, parser, sender_rx, state_tx, event_tx, shutdown, exhausted,
            )
            .await;
        });
    }

    /// Queue a message for the worker.
    ///
    /// Best-effort fire-and-forget: if the channel is not `Ready` the
    /// message is dropped with a warning and nothing reaches the socket.
    /// Callers that need delivery guarantees layer their own acknowledgment
    /// protocol on top of the message events.
    pub fn send(&self, message: M) {
        let state = self.state();
        if !state.is_ready() {
            warn!(%state, ?message, "dropping outbound message: channel not ready");
            return;
        }
        if self.sender_tx.send(message).is_err() {
            warn!("dropping outbound message: connection task has terminated");
        }
    }

    /// Get the current connection state.
    ///
    /// Pure snapshot read; never blocks.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Stop the channel permanently.
    ///
    /// Moves to `Stopped` from any state, cancels a pending reconnect
    /// timer, and releases the socket. Safe to call from any state and any
    /// number of times. A retry timer that was already pending observes
    /// `Stopped` when it fires and aborts.
    pub fn stop(&self) {
        if transition(&self.state_tx, &self.event_tx, ConnectionState::Stopped) {
            info!("worker channel stopped");
        }
        self.shutdown.cancel();
    }

    /// Record that the worker process itself has exited.
    ///
    /// The process supervisor calls this so the channel stops immediately
    /// instead of retrying against a socket that can never come back. Emits
    /// `RetriesExhausted` once, since this is a terminal failure rather
    /// than a caller-requested shutdown.
    pub fn notify_process_exited(&self) {
        if transition(&self.state_tx, &self.event_tx, ConnectionState::Stopped) {
            warn!("worker process exited; stopping channel");
            self.exhausted.store(true, Ordering::SeqCst);
            _ = self.event_tx.send(ChannelEvent::RetriesExhausted);
        }
        self.shutdown.cancel();
    }

    /// Whether the channel failed terminally (retry ceiling exhausted or
    /// worker process gone), as opposed to a deliberate `stop()`.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Subscribe to channel events.
    ///
    /// Each call returns a new independent receiver. Dropping the receiver
    /// unsubscribes, so a caller with a bounded lifetime (e.g. one pending
    /// request) detaches by drop without growing the listener registry.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent<M>> {
        self.event_tx.subscribe()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies on every state transition and
    /// always holds the latest state.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// Apply a state change unless the channel is already stopped.
///
/// `Stopped` is terminal: no transition leaves it, which makes `stop()`
/// authoritative over a racing connection task. The watch value is updated
/// before the event is broadcast so snapshot reads never lag the event
/// stream. Returns whether the state actually moved.
fn transition<M: Debug + Clone + Send + 'static>(
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &broadcast::Sender<ChannelEvent<M>>,
    next: ConnectionState,
) -> bool {
    let mut moved = false;
    state_tx.send_if_modified(|state| {
        if *state == ConnectionState::Stopped || *state == next {
            false
        } else {
            *state = next;
            moved = true;
            true
        }
    });
    if moved {
        _ = event_tx.send(ChannelEvent::StateChange(next));
    }
    moved
}

/// Main connection loop: attempt, session, bounded retry.
///
/// The attempt counter resets to zero on every successful connection and
/// increments on every failed attempt or unexpected disconnect; once it
/// reaches the ceiling the channel stops for good.
#[expect(
    clippy::too_many_arguments,
    reason = "The task owns every handle of the channel it drives"
)]
async fn connection_loop<M, P>(
    transport: Arc<dyn Transport>,
    config: Config,
    parser: Arc<P>,
    mut sender_rx: mpsc::UnboundedReceiver<M>,
    state_tx: watch::Sender<ConnectionState>,
    event_tx: broadcast::Sender<ChannelEvent<M>>,
    shutdown: CancellationToken,
    exhausted: Arc<AtomicBool>,
) where
    M: DeserializeOwned + Serialize + ReadySignal + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    let mut attempts = 0_u32;
    let mut backoff: backoff::ExponentialBackoff = config.reconnect.clone().into();

    loop {
        // State is Connecting here, set by connect() for the first pass and
        // by the retry arm below for every subsequent one.
        let attempt = tokio::select! {
            () = shutdown.cancelled() => break,
            result = timeout(config.connect_timeout, transport.connect()) => result,
        };
        let result = attempt.unwrap_or_else(|_elapsed| {
            Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connection attempt timed out",
            ))
        });

        match result {
            Ok(socket) => {
                attempts = 0;
                backoff.reset();
                info!("connected to worker socket");
                if !transition(&state_tx, &event_tx, ConnectionState::Connected) {
                    // stop() won the race during the handshake.
                    break;
                }
                discard_stale(&mut sender_rx);

                match run_session(
                    socket,
                    &config,
                    &*parser,
                    &mut sender_rx,
                    &state_tx,
                    &event_tx,
                    &shutdown,
                )
                .await
                {
                    SessionEnd::Stopped => break,
                    SessionEnd::Disconnected => {
                        attempts = attempts.saturating_add(1);
                        warn!(attempts, "lost connection to worker");
                        if !transition(&state_tx, &event_tx, ConnectionState::Disconnected) {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                attempts = attempts.saturating_add(1);
                warn!(error = %e, attempts, "connection attempt failed");
                if !transition(&state_tx, &event_tx, ConnectionState::Disconnected) {
                    break;
                }
            }
        }

        if let Some(max) = config.reconnect.max_attempts
            && attempts >= max
        {
            warn!(attempts, ceiling = max, "retry ceiling exhausted, giving up");
            if transition(&state_tx, &event_tx, ConnectionState::Stopped) {
                exhausted.store(true, Ordering::SeqCst);
                _ = event_tx.send(ChannelEvent::RetriesExhausted);
            }
            break;
        }

        let delay = backoff
            .next_backoff()
            .unwrap_or(config.reconnect.initial_delay);
        debug!(?delay, attempts, "scheduling reconnection attempt");
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = sleep(delay) => {}
        }
        if !transition(&state_tx, &event_tx, ConnectionState::Connecting) {
            // Stopped while the retry timer was pending.
            break;
        }
    }
}

/// Drive one established socket session until it ends.
async fn run_session<M, P>(
    mut socket: BoxedSocket,
    config: &Config,
    parser: &P,
    sender_rx: &mut mpsc::UnboundedReceiver<M>,
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &broadcast::Sender<ChannelEvent<M>>,
    shutdown: &CancellationToken,
) -> SessionEnd
where
    M: DeserializeOwned + Serialize + ReadySignal + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    let mut decoder = FrameDecoder::new(config.max_frame_bytes);
    let mut chunk = vec![0_u8; READ_CHUNK_BYTES];

    loop {
        tokio::select! {
            () = shutdown.cancelled() => return SessionEnd::Stopped,

            // Handle inbound bytes from the worker
            read = socket.read(&mut chunk) => match read {
                Ok(0) => {
                    info!("worker closed the connection");
                    return SessionEnd::Disconnected;
                }
                Ok(n) => {
                    for frame in decoder.feed(&chunk[..n]) {
                        dispatch_frame(&frame, parser, state_tx, event_tx);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "worker socket read failed");
                    return SessionEnd::Disconnected;
                }
            },

            // Handle outbound messages accepted while ready
            Some(message) = sender_rx.recv() => {
                match framing::encode(&message) {
                    Ok(bytes) => {
                        if let Err(e) = socket.write_all(&bytes).await {
                            warn!(error = %e, "worker socket write failed");
                            return SessionEnd::Disconnected;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, ?message, "failed to serialize outbound message");
                    }
                }
            }
        }
    }
}

/// Parse one frame and publish what it contains.
///
/// The worker's readiness announcement flips the state machine instead of
/// being republished; a frame that fails to parse is discarded without
/// touching the connection.
fn dispatch_frame<M, P>(
    frame: &[u8],
    parser: &P,
    state_tx: &watch::Sender<ConnectionState>,
    event_tx: &broadcast::Sender<ChannelEvent<M>>,
) where
    M: DeserializeOwned + Serialize + ReadySignal + Debug + Clone + Send + 'static,
    P: MessageParser<M>,
{
    match parser.parse(frame) {
        Ok(messages) => {
            for message in messages {
                if message.is_ready_signal() {
                    if transition(state_tx, event_tx, ConnectionState::Ready) {
                        info!("worker is ready");
                        _ = event_tx.send(ChannelEvent::Ready);
                    } else {
                        debug!("ignoring duplicate readiness announcement");
                    }
                } else {
                    _ = event_tx.send(ChannelEvent::Message(message));
                }
            }
        }
        Err(e) => {
            // Malformed single message, not a fatal channel error.
            warn!(error = %e, "discarding malformed frame");
        }
    }
}

/// Drop messages queued before this session attached.
///
/// Sends are only accepted while ready, so anything still queued here was
/// aimed at a previous session and must not leak into the new one.
fn discard_stale<M>(sender_rx: &mut mpsc::UnboundedReceiver<M>) {
    let mut dropped = 0_usize;
    while sender_rx.try_recv().is_ok() {
        dropped = dropped.saturating_add(1);
    }
    if dropped > 0 {
        debug!(dropped, "discarded outbound messages queued for a previous session");
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used, reason = "tests can panic on unwrap")]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde::Deserialize;
    use serde_json::{Value, json};
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, DuplexStream, duplex};

    use super::*;
    use crate::ipc::config::ReconnectConfig;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestMessage {
        #[serde(rename = "type")]
        msg_type: String,
        #[serde(default)]
        data: Value,
    }

    impl TestMessage {
        fn new(msg_type: &str, data: Value) -> Self {
            Self {
                msg_type: msg_type.to_owned(),
                data,
            }
        }
    }

    impl ReadySignal for TestMessage {
        fn is_ready_signal(&self) -> bool {
            self.msg_type == "ready"
        }
    }

    struct TestParser;

    impl MessageParser<TestMessage> for TestParser {
        fn parse(&self, bytes: &[u8]) -> crate::Result<Vec<TestMessage>> {
            let message: TestMessage =
                serde_json::from_slice(bytes).map_err(crate::error::Error::from)?;
            Ok(vec![message])
        }
    }

    /// One scripted outcome per connection attempt.
    enum Script {
        /// Fail the attempt with `ConnectionRefused`
        Refuse,
        /// Succeed with an in-memory duplex; the server half is handed to
        /// the test through the server channel
        Accept,
    }

    struct ScriptedTransport {
        script: Mutex<VecDeque<Script>>,
        server_tx: mpsc::UnboundedSender<DuplexStream>,
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> io::Result<BoxedSocket> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            match step {
                Some(Script::Accept) => {
                    let (client, server) = duplex(64 * 1024);
                    _ = self.server_tx.send(server);
                    Ok(Box::new(client))
                }
                Some(Script::Refuse) | None => Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "scripted refusal",
                )),
            }
        }
    }

    struct Harness {
        manager: ConnectionManager<TestMessage, TestParser>,
        transport: Arc<ScriptedTransport>,
        /// Yields the server half of each accepted connection
        server_rx: mpsc::UnboundedReceiver<DuplexStream>,
    }

    fn harness(script: Vec<Script>) -> Harness {
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ScriptedTransport {
            script: Mutex::new(script.into()),
            server_tx,
            attempts: AtomicU32::new(0),
        });
        let config = Config {
            socket_path: "scripted".to_owned(),
            connect_timeout: Duration::from_secs(1),
            max_frame_bytes: 64 * 1024,
            reconnect: ReconnectConfig {
                max_attempts: Some(3),
                initial_delay: Duration::from_millis(20),
                max_delay: Duration::from_millis(20),
                multiplier: 1.0,
            },
        };
        let manager = ConnectionManager::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            config,
            TestParser,
        );
        Harness {
            manager,
            transport,
            server_rx,
        }
    }

    async fn next_event(
        events: &mut broadcast::Receiver<ChannelEvent<TestMessage>>,
    ) -> ChannelEvent<TestMessage> {
        timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for channel event")
            .expect("event channel closed")
    }

    async fn next_server(harness: &mut Harness) -> DuplexStream {
        timeout(Duration::from_secs(2), harness.server_rx.recv())
            .await
            .expect("timed out waiting for accepted connection")
            .expect("transport dropped")
    }

    fn encoded(msg_type: &str, data: Value) -> Vec<u8> {
        framing::encode(&TestMessage::new(msg_type, data)).unwrap()
    }

    #[tokio::test]
    async fn ready_handshake_walks_full_state_sequence() {
        let mut harness = harness(vec![Script::Accept]);
        let mut events = harness.manager.subscribe();

        assert_eq!(harness.manager.state(), ConnectionState::Disconnected);
        harness.manager.connect();

        let mut server = next_server(&mut harness).await;

        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::StateChange(ConnectionState::Connecting)
        ));
        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::StateChange(ConnectionState::Connected)
        ));

        server.write_all(&encoded("ready", Value::Null)).await.unwrap();

        assert!(matches!(
            next_event(&mut events).await,
            ChannelEvent::StateChange(ConnectionState::Ready)
        ));
        assert!(matches!(next_event(&mut events).await, ChannelEvent::Ready));
        assert_eq!(harness.manager.state(), ConnectionState::Ready);

        // A duplicate readiness announcement is consumed silently: the next
        // observable event is the message that follows it.
        server.write_all(&encoded("ready", Value::Null)).await.unwrap();
        server
            .write_all(&encoded("notification", json!("hello")))
            .await
            .unwrap();

        match next_event(&mut events).await {
            ChannelEvent::Message(message) => assert_eq!(message.msg_type, "notification"),
            other => panic!("expected notification message, got {other:?}"),
        }

        harness.manager.stop();
    }

    #[tokio::test]
    async fn connect_while_active_is_noop() {
        let mut harness = harness(vec![Script::Accept]);
        harness.manager.connect();
        harness.manager.connect();

        let mut server = next_server(&mut harness).await;
        server.write_all(&encoded("ready", Value::Null)).await.unwrap();

        let mut state_rx = harness.manager.state_receiver();
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| state.is_ready()),
        )
        .await
        .expect("never became ready")
        .unwrap();

        // Connecting again while ready must not open a second socket.
        harness.manager.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.transport.attempts.load(Ordering::SeqCst), 1);

        harness.manager.stop();
    }

    #[tokio::test]
    async fn send_before_ready_never_reaches_socket() {
        let mut harness = harness(vec![Script::Accept]);
        let mut events = harness.manager.subscribe();

        // Not even connected yet.
        harness
            .manager
            .send(TestMessage::new("command", json!("too early")));

        harness.manager.connect();
        let mut server = next_server(&mut harness).await;

        // Connected but the worker has not announced readiness.
        loop {
            if let ChannelEvent::StateChange(ConnectionState::Connected) =
                next_event(&mut events).await
            {
                break;
            }
        }
        harness
            .manager
            .send(TestMessage::new("command", json!("still too early")));

        server.write_all(&encoded("ready", Value::Null)).await.unwrap();
        loop {
            if matches!(next_event(&mut events).await, ChannelEvent::Ready) {
                break;
            }
        }

        harness
            .manager
            .send(TestMessage::new("command", json!("on time")));

        let mut received = vec![0_u8; 4096];
        let n = timeout(Duration::from_secs(2), server.read(&mut received))
            .await
            .expect("timed out reading from client")
            .unwrap();
        let wire = String::from_utf8(received[..n].to_vec()).unwrap();

        assert!(wire.contains("on time"), "ready-gated send must arrive");
        assert!(
            !wire.contains("too early"),
            "messages sent before ready must never reach the socket"
        );

        harness.manager.stop();
    }

    #[tokio::test]
    async fn refused_attempts_hit_ceiling_and_stop() {
        let mut harness = harness(vec![Script::Refuse, Script::Refuse, Script::Refuse]);
        let mut events = harness.manager.subscribe();
        harness.manager.connect();

        let mut exhausted = 0_u32;
        let mut stopped = 0_u32;
        loop {
            match next_event(&mut events).await {
                ChannelEvent::RetriesExhausted => {
                    exhausted += 1;
                    break;
                }
                ChannelEvent::StateChange(ConnectionState::Stopped) => stopped += 1,
                _ => {}
            }
        }

        assert_eq!(exhausted, 1);
        assert_eq!(stopped, 1);
        assert_eq!(harness.manager.state(), ConnectionState::Stopped);
        assert!(harness.manager.is_exhausted());
        assert_eq!(harness.transport.attempts.load(Ordering::SeqCst), 3);

        // No timer left pending: attempt count must not move again.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.transport.attempts.load(Ordering::SeqCst), 3);
        assert!(harness.server_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn successful_session_resets_the_counter() {
        // Each successful session is followed by one refusal; with a
        // ceiling of 3, reaching Ready three times is only possible if the
        // counter resets on every successful connection.
        let mut harness = harness(vec![
            Script::Accept,
            Script::Refuse,
            Script::Accept,
            Script::Refuse,
            Script::Accept,
        ]);
        let mut events = harness.manager.subscribe();
        harness.manager.connect();

        for round in 0_u32..3 {
            let mut server = next_server(&mut harness).await;
            server.write_all(&encoded("ready", Value::Null)).await.unwrap();

            loop {
                match next_event(&mut events).await {
                    ChannelEvent::Ready => break,
                    ChannelEvent::RetriesExhausted => {
                        panic!("counter failed to reset before round {round}")
                    }
                    _ => {}
                }
            }

            if round < 2 {
                // Kill the session; the manager eats one refusal and then
                // reconnects.
                drop(server);
            }
        }

        assert_eq!(harness.manager.state(), ConnectionState::Ready);
        harness.manager.stop();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_cancels_pending_retry() {
        let mut harness = harness(vec![Script::Refuse]);
        let mut events = harness.manager.subscribe();
        harness.manager.connect();

        // Wait for the failed attempt; a retry timer is now pending.
        loop {
            if let ChannelEvent::StateChange(ConnectionState::Disconnected) =
                next_event(&mut events).await
            {
                break;
            }
        }

        harness.manager.stop();
        harness.manager.stop();
        assert_eq!(harness.manager.state(), ConnectionState::Stopped);
        assert!(!harness.manager.is_exhausted());

        // The pending retry must observe Stopped and abort.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(harness.transport.attempts.load(Ordering::SeqCst), 1);

        // Exactly one Stopped transition, and a user stop is not a
        // terminal failure.
        let mut stopped = 0_u32;
        while let Ok(event) = events.try_recv() {
            match event {
                ChannelEvent::StateChange(ConnectionState::Stopped) => stopped += 1,
                ChannelEvent::RetriesExhausted => {
                    panic!("stop() must not fire RetriesExhausted")
                }
                _ => {}
            }
        }
        assert_eq!(stopped, 1);
        drop(harness);
    }

    #[tokio::test]
    async fn notify_process_exited_is_terminal_and_fires_exhausted_once() {
        let mut harness = harness(vec![Script::Accept]);
        let mut events = harness.manager.subscribe();
        harness.manager.connect();

        let mut server = next_server(&mut harness).await;
        server.write_all(&encoded("ready", Value::Null)).await.unwrap();

        let mut state_rx = harness.manager.state_receiver();
        timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| state.is_ready()),
        )
        .await
        .expect("never became ready")
        .unwrap();

        harness.manager.notify_process_exited();
        harness.manager.notify_process_exited();

        assert_eq!(harness.manager.state(), ConnectionState::Stopped);

        let mut exhausted = 0_u32;
        tokio::time::sleep(Duration::from_millis(50)).await;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ChannelEvent::RetriesExhausted) {
                exhausted += 1;
            }
        }
        assert_eq!(exhausted, 1);

        // The channel is gone for good: connect() is a no-op from Stopped.
        let attempts = harness.transport.attempts.load(Ordering::SeqCst);
        harness.manager.connect();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.transport.attempts.load(Ordering::SeqCst), attempts);
    }

    #[tokio::test]
    async fn messages_are_emitted_in_arrival_order() {
        let mut harness = harness(vec![Script::Accept]);
        let mut events = harness.manager.subscribe();
        harness.manager.connect();

        let mut server = next_server(&mut harness).await;
        server.write_all(&encoded("ready", Value::Null)).await.unwrap();

        // Two messages in a single chunk, plus a malformed line between
        // them that must be dropped without killing the connection.
        server
            .write_all(b"{\"type\":\"a\",\"data\":1}\nnot json at all\n{\"type\":\"b\",\"data\":2}\n")
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            if let ChannelEvent::Message(message) = next_event(&mut events).await {
                seen.push(message);
            }
        }

        assert_eq!(seen[0], TestMessage::new("a", json!(1)));
        assert_eq!(seen[1], TestMessage::new("b", json!(2)));
        assert!(harness.manager.state().is_connected());

        harness.manager.stop();
    }
}
