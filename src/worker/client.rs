use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use futures::Stream;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::types::{LineParser, Message};
use crate::Result;
use crate::ipc::ConnectionManager;
use crate::ipc::config::Config;
use crate::ipc::connection::{ChannelEvent, ConnectionState};
use crate::ipc::error::IpcError;
use crate::ipc::transport::{LocalSocketTransport, Transport};

/// Client for the solver sidecar worker.
///
/// Owns the IPC channel to the worker process: call
/// [`connect`](Self::connect) once after the worker has been spawned, then
/// consume [`messages`](Self::messages) and issue [`send`](Self::send).
/// Connection failures are recovered automatically up to the configured
/// retry ceiling; terminal failure is announced through
/// [`retries_exhausted`](Self::retries_exhausted), after which the
/// application re-spawns the worker and constructs a fresh client.
///
/// Cheap to clone; all clones share the same connection.
///
/// # Example
///
/// ```rust,no_run
/// use solver_sidecar_client::ipc::config::Config;
/// use solver_sidecar_client::worker::{Client, Message, tag};
/// use std::time::Duration;
///
/// # async fn example() -> anyhow::Result<()> {
/// let client = Client::new(Config::default());
/// client.connect();
/// client.wait_until_ready(Duration::from_secs(10)).await?;
///
/// let verdict = client
///     .request(
///         Message::command(serde_json::json!({"action": "validate", "value": "AsKs"})),
///         tag::INPUT_VALIDATION,
///         Duration::from_secs(5),
///     )
///     .await?;
/// println!("validation: {:?}", verdict.data);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Configuration for the worker channel
    config: Config,
    /// Connection manager for the worker socket
    connection: ConnectionManager<Message, LineParser>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl Client {
    /// Create a client for the worker socket described by `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let transport = Arc::new(LocalSocketTransport::new(config.socket_path.clone()));
        Self::with_transport(config, transport)
    }

    /// Create a client over an injected transport.
    ///
    /// The transport seam exists for tests running against in-memory
    /// sockets; production code uses [`new`](Self::new).
    #[must_use]
    pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Self {
        let connection = ConnectionManager::new(transport, config.clone(), LineParser);
        Self {
            inner: Arc::new(ClientInner { config, connection }),
        }
    }

    /// Start maintaining the connection to the worker in the background.
    ///
    /// A no-op unless the channel is `Disconnected`; repeated calls never
    /// produce concurrent connection attempts.
    pub fn connect(&self) {
        self.inner.connection.connect();
    }

    /// Queue a message for the worker.
    ///
    /// Best-effort fire-and-forget: dropped with a warning unless the
    /// channel is `Ready`. Callers needing delivery confirmation layer an
    /// acknowledgment on the message stream (see [`request`](Self::request)).
    pub fn send(&self, message: Message) {
        self.inner.connection.send(message);
    }

    /// Get the current connection state. Never blocks.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Stop the channel permanently and release the socket.
    ///
    /// Idempotent and callable from any state.
    pub fn stop(&self) {
        self.inner.connection.stop();
    }

    /// Record that the worker process itself has exited.
    ///
    /// Called by whoever spawned the worker; stops the channel immediately
    /// instead of retrying against a socket that can never come back.
    pub fn notify_process_exited(&self) {
        self.inner.connection.notify_process_exited();
    }

    /// Configuration this client was built with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Subscribe to the raw channel event stream.
    ///
    /// Each call returns a new independent receiver; dropping it
    /// unsubscribes.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<ChannelEvent<Message>> {
        self.inner.connection.subscribe()
    }

    /// Subscribe to connection state changes.
    ///
    /// The receiver always holds the latest state; useful for reflecting
    /// connectivity in the UI.
    #[must_use]
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Stream of inbound worker messages, in arrival order.
    ///
    /// The readiness handshake is consumed by the channel and does not
    /// appear here. A subscriber that falls too far behind observes an
    /// [`IpcError::Lagged`] error item and the stream ends; create a fresh
    /// stream to resume from live traffic.
    #[must_use]
    pub fn messages(&self) -> impl Stream<Item = Result<Message>> {
        let mut events = self.inner.connection.subscribe();

        try_stream! {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Message(message)) => yield message,
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        warn!(count, "message subscription lagged");
                        Err(IpcError::Lagged { count })?;
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Resolves when the channel fails terminally.
    ///
    /// Completes after the single `RetriesExhausted` event (retry ceiling
    /// exhausted or worker process gone). A deliberate [`stop`](Self::stop)
    /// does not resolve this future.
    pub async fn retries_exhausted(&self) {
        if self.inner.connection.is_exhausted() {
            return;
        }
        let mut events = self.inner.connection.subscribe();
        // Re-check after subscribing: the flag is set before the event is
        // broadcast, so a false reading here guarantees the event is still
        // ahead of this receiver.
        if self.inner.connection.is_exhausted() {
            return;
        }
        loop {
            match events.recv().await {
                Ok(ChannelEvent::RetriesExhausted) | Err(RecvError::Closed) => return,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
            }
        }
    }

    /// Wait until the worker has announced readiness.
    ///
    /// # Errors
    ///
    /// [`IpcError::Timeout`] if the worker is not ready within `deadline`;
    /// [`IpcError::Stopped`] if the channel reaches its terminal state
    /// first.
    pub async fn wait_until_ready(&self, deadline: Duration) -> Result<()> {
        let mut state_rx = self.inner.connection.state_receiver();
        let outcome = timeout(
            deadline,
            state_rx.wait_for(|state| state.is_ready() || state.is_terminal()),
        )
        .await;

        match outcome {
            Err(_elapsed) => Err(IpcError::Timeout.into()),
            Ok(Err(_closed)) => Err(IpcError::Stopped.into()),
            Ok(Ok(state)) => {
                if state.is_terminal() {
                    Err(IpcError::Stopped.into())
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Send a message and await the first reply of the given type.
    ///
    /// The worker protocol has no required responses; request/response
    /// pairs are layered on the message stream by matching the reply's tag
    /// (e.g. [`tag::INPUT_VALIDATION`](super::tag::INPUT_VALIDATION)). The
    /// reply subscription lives only for the duration of this call and
    /// detaches when it returns.
    ///
    /// # Errors
    ///
    /// [`IpcError::NotReady`] if the channel is not ready,
    /// [`IpcError::Timeout`] if no matching reply arrives within
    /// `deadline`, [`IpcError::Stopped`] if the channel dies first.
    pub async fn request(
        &self,
        message: Message,
        reply_type: &str,
        deadline: Duration,
    ) -> Result<Message> {
        let state = self.state();
        if !state.is_ready() {
            return Err(IpcError::NotReady { state }.into());
        }

        // Subscribe before sending so a fast reply cannot slip past.
        let mut events = self.inner.connection.subscribe();
        self.inner.connection.send(message);

        let reply = timeout(deadline, async {
            loop {
                match events.recv().await {
                    Ok(ChannelEvent::Message(reply)) if reply.is_type(reply_type) => {
                        return Ok(reply);
                    }
                    Ok(
                        ChannelEvent::RetriesExhausted
                        | ChannelEvent::StateChange(ConnectionState::Stopped),
                    ) => return Err(IpcError::Stopped),
                    Ok(_) => {}
                    Err(RecvError::Lagged(count)) => {
                        debug!(count, "request subscription lagged; still waiting for reply");
                    }
                    Err(RecvError::Closed) => return Err(IpcError::ConnectionClosed),
                }
            }
        })
        .await;

        match reply {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => Err(e.into()),
            Err(_elapsed) => Err(IpcError::Timeout.into()),
        }
    }
}
