#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::{Arc, Mutex, PoisonError, RwLock};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{Instant, interval_at, sleep};
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue, header};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use url::Url;

use super::config::Config;
use super::traits::{ConnectionListener, Reconnect, Transmit};
use crate::Result;
use crate::error::Error;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const CLOSE_REASON: &str = "connection closed manually";

/// Connection lifecycle.
///
/// `Connecting -> Open -> Closing -> Closed`, and `Closed -> Connecting` when
/// the connection is opened again.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// WebSocket handshake in progress
    Connecting,
    /// Handshake completed, frames can be sent
    Open,
    /// Close handshake in progress
    Closing,
    /// No transport handle
    Closed,
}

impl ConnectionState {
    /// Check if the connection is currently open.
    #[must_use]
    pub const fn is_open(self) -> bool {
        matches!(self, Self::Open)
    }
}

/// Work for the connection's worker: caller requests and transport events.
///
/// Transport events carry the generation of the socket that produced them so
/// that events from a replaced socket are ignored.
enum Op {
    Open,
    Close,
    Reopen,
    Send(String),
    Opened { generation: u64, writer: WsWriter },
    Frame { generation: u64, text: String },
    Closing { generation: u64 },
    Closed { generation: u64 },
    Failed { generation: u64, error: Error },
    Ping { generation: u64 },
    CloseTimeout { generation: u64 },
}

struct ConnectionInner {
    endpoint: Url,
    config: Config,
    runtime: Handle,
    state_tx: watch::Sender<ConnectionState>,
    listener: RwLock<Option<Arc<dyn ConnectionListener>>>,
    /// Mailbox of the running worker, `None` while no worker runs.
    worker: Mutex<Option<mpsc::UnboundedSender<Op>>>,
}

/// One logical WebSocket connection with a serialized lifecycle.
///
/// All state transitions, writes and listener callbacks run on a single
/// worker task. The worker is spawned on demand and exits once the connection
/// is closed with nothing left to do; the next operation spawns a fresh one.
/// At most one transport handle exists at any time: a reopen requested while
/// a socket is still alive waits for its close handshake to finish. A close
/// handshake that takes longer than [`Config::close_timeout`] is abandoned and
/// the transport dropped.
///
/// # Example
///
/// ```no_run
/// use actioncable_client::ws::Connection;
/// use actioncable_client::ws::config::Config;
///
/// # async fn example() -> actioncable_client::Result<()> {
/// let connection = Connection::new("ws://localhost:3000/cable".parse()?, Config::default())?;
/// connection.open();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Create a closed connection to `endpoint`.
    ///
    /// Must be called within a Tokio runtime; the worker is spawned on it.
    pub fn new(endpoint: Url, config: Config) -> Result<Self> {
        let runtime = Handle::try_current()?;
        let (state_tx, _) = watch::channel(ConnectionState::Closed);

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                endpoint,
                config,
                runtime,
                state_tx,
                listener: RwLock::new(None),
                worker: Mutex::new(None),
            }),
        })
    }

    /// Register the listener that receives transport events.
    pub fn set_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self
            .inner
            .listener
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(listener);
    }

    /// Start connecting.
    ///
    /// Opening an open or connecting connection reports a failure to the
    /// listener instead of creating a second socket.
    pub fn open(&self) {
        self.dispatch(Op::Open);
    }

    /// Start the close handshake and cancel any pending reopen.
    ///
    /// Closing a closing or closed connection only cancels the pending reopen.
    pub fn close(&self) {
        self.dispatch(Op::Close);
    }

    /// Open now if closed, otherwise close and open once the close handshake completes.
    pub fn reopen(&self) {
        self.dispatch(Op::Reopen);
    }

    /// Send a text frame.
    ///
    /// Returns `true` only if the connection is open and the frame was handed
    /// to the worker. There is no outbound queue; a caller whose send fails
    /// must retry.
    pub fn send(&self, text: String) -> bool {
        if !self.is_open() {
            return false;
        }
        self.dispatch(Op::Send(text));
        true
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Queue `op` on the worker, spawning one if none is running.
    fn dispatch(&self, op: Op) {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let mailbox = match worker.as_ref() {
            Some(mailbox) if !mailbox.is_closed() => mailbox.clone(),
            _ => {
                let (mailbox, rx) = mpsc::unbounded_channel();
                let task = Worker::new(Arc::clone(&self.inner), mailbox.clone(), rx);
                self.inner.runtime.spawn(task.run());
                *worker = Some(mailbox.clone());
                mailbox
            }
        };

        // The worker only gives up its mailbox while holding this lock and
        // after checking it is empty, so nothing sent here is lost.
        _ = mailbox.send(op);
    }
}

impl Transmit for Connection {
    fn transmit(&self, text: String) -> bool {
        self.send(text)
    }
}

impl Reconnect for Connection {
    fn reopen(&self) {
        Connection::reopen(self);
    }
}

/// Owns the transport handle; runs every state transition in order.
struct Worker {
    inner: Arc<ConnectionInner>,
    mailbox: mpsc::UnboundedSender<Op>,
    rx: mpsc::UnboundedReceiver<Op>,
    writer: Option<WsWriter>,
    /// Task connecting and reading the live transport handle
    transport: Option<AbortHandle>,
    /// Timer abandoning a close handshake that never completes
    close_deadline: Option<AbortHandle>,
    /// Generation of the live transport handle, if any
    current: Option<u64>,
    next_generation: u64,
    reopening: bool,
}

impl Worker {
    fn new(
        inner: Arc<ConnectionInner>,
        mailbox: mpsc::UnboundedSender<Op>,
        rx: mpsc::UnboundedReceiver<Op>,
    ) -> Self {
        Self {
            inner,
            mailbox,
            rx,
            writer: None,
            transport: None,
            close_deadline: None,
            current: None,
            next_generation: 0,
            reopening: false,
        }
    }

    async fn run(mut self) {
        #[cfg(feature = "tracing")]
        tracing::trace!(endpoint = %self.inner.endpoint, "connection worker started");

        while let Some(op) = self.rx.recv().await {
            self.handle(op).await;

            if self.is_idle() && self.release() {
                break;
            }
        }

        #[cfg(feature = "tracing")]
        tracing::trace!(endpoint = %self.inner.endpoint, "connection worker stopped");
    }

    async fn handle(&mut self, op: Op) {
        match op {
            Op::Open => self.open(),
            Op::Close => {
                self.reopening = false;
                self.close().await;
            }
            Op::Reopen => {
                if self.state() == ConnectionState::Closed {
                    self.open();
                } else {
                    self.reopening = true;
                    self.close().await;
                }
            }
            Op::Send(text) => self.write(text).await,
            Op::Opened { generation, writer } => self.opened(generation, writer).await,
            Op::Frame { generation, text } => {
                if self.is_current(generation) {
                    #[cfg(feature = "tracing")]
                    tracing::trace!(%text, "Received WebSocket text message");
                    if let Some(listener) = self.listener() {
                        listener.on_message(&text);
                    }
                }
            }
            Op::Closing { generation } => self.closing(generation).await,
            Op::Closed { generation } => self.closed(generation),
            Op::Failed { generation, error } => self.failed(generation, error),
            Op::Ping { generation } => self.ping(generation).await,
            Op::CloseTimeout { generation } => self.close_timed_out(generation),
        }
    }

    fn open(&mut self) {
        match self.state() {
            ConnectionState::Open | ConnectionState::Connecting => {
                self.notify_failure(Error::state(
                    "must close existing connection before opening",
                ));
            }
            ConnectionState::Closing => {
                #[cfg(feature = "tracing")]
                tracing::debug!("open requested while closing, deferring until closed");
                self.reopening = true;
            }
            ConnectionState::Closed => self.connect(),
        }
    }

    fn connect(&mut self) {
        self.next_generation = self.next_generation.wrapping_add(1);
        let generation = self.next_generation;
        self.current = Some(generation);
        self.set_state(ConnectionState::Connecting);

        let request = build_request(&self.inner.endpoint, &self.inner.config);
        let config = self.inner.config.clone();
        let events = self.mailbox.clone();

        let transport = self
            .inner
            .runtime
            .spawn(run_transport(generation, request, config, events));
        self.transport = Some(transport.abort_handle());
    }

    async fn close(&mut self) {
        match self.state() {
            ConnectionState::Closing | ConnectionState::Closed => {}
            // The close frame goes out as soon as the handshake completes.
            ConnectionState::Connecting => self.begin_closing(),
            ConnectionState::Open => {
                self.begin_closing();
                self.send_close_frame().await;
            }
        }
    }

    /// Enter `Closing` and arm the deadline for the close handshake.
    fn begin_closing(&mut self) {
        self.set_state(ConnectionState::Closing);

        let Some(generation) = self.current else {
            return;
        };
        let timeout = self.inner.config.close_timeout;
        let events = self.mailbox.clone();
        let deadline = self.inner.runtime.spawn(async move {
            sleep(timeout).await;
            _ = events.send(Op::CloseTimeout { generation });
        });

        if let Some(previous) = self.close_deadline.replace(deadline.abort_handle()) {
            previous.abort();
        }
    }

    fn close_timed_out(&mut self, generation: u64) {
        if !self.is_current(generation) || self.state() != ConnectionState::Closing {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            endpoint = %self.inner.endpoint,
            timeout = ?self.inner.config.close_timeout,
            "close handshake timed out, dropping transport"
        );
        self.closed(generation);
    }

    async fn send_close_frame(&mut self) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: CLOSE_REASON.into(),
        };
        if let Err(e) = writer.send(Message::Close(Some(frame))).await {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Unable to start close handshake");
            if let Some(generation) = self.current {
                // No close handshake will complete on this socket.
                self.failed(generation, e.into());
            }
        }
    }

    async fn write(&mut self, text: String) {
        if self.state() != ConnectionState::Open {
            #[cfg(feature = "tracing")]
            tracing::debug!("dropping outbound frame, connection is no longer open");
            return;
        }
        let Some(writer) = self.writer.as_mut() else {
            return;
        };

        if let Err(e) = writer.send(Message::Text(text.into())).await {
            // The reader observes the broken socket and reports the failure.
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send WebSocket message");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    async fn ping(&mut self, generation: u64) {
        if !self.is_current(generation) || self.state() != ConnectionState::Open {
            return;
        }
        if let Some(writer) = self.writer.as_mut()
            && let Err(e) = writer.send(Message::Ping(Bytes::new())).await
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(error = %e, "Failed to send WebSocket ping");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    async fn opened(&mut self, generation: u64, mut writer: WsWriter) {
        if !self.is_current(generation) {
            _ = writer.close().await;
            return;
        }

        self.writer = Some(writer);
        match self.state() {
            ConnectionState::Connecting => {
                self.set_state(ConnectionState::Open);
                #[cfg(feature = "tracing")]
                tracing::debug!(endpoint = %self.inner.endpoint, "connection opened");
                if let Some(listener) = self.listener() {
                    listener.on_open();
                }
            }
            ConnectionState::Closing => self.send_close_frame().await,
            ConnectionState::Open | ConnectionState::Closed => {}
        }
    }

    async fn closing(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        // A close frame while open means the server started the handshake.
        if self.state() == ConnectionState::Open {
            self.begin_closing();
            #[cfg(feature = "tracing")]
            tracing::debug!("server started close handshake");
            if let Some(listener) = self.listener() {
                listener.on_closing();
            }
            if let Some(writer) = self.writer.as_mut() {
                _ = writer.close().await;
            }
        }
    }

    fn closed(&mut self, generation: u64) {
        if !self.is_current(generation) {
            return;
        }

        self.release_transport();
        #[cfg(feature = "tracing")]
        tracing::debug!(endpoint = %self.inner.endpoint, "connection closed");
        if let Some(listener) = self.listener() {
            listener.on_closed();
        }
        self.resume_reopen();
    }

    fn failed(&mut self, generation: u64, error: Error) {
        if !self.is_current(generation) {
            return;
        }

        self.release_transport();
        #[cfg(feature = "tracing")]
        tracing::warn!(endpoint = %self.inner.endpoint, error = %error, "connection failed");
        self.notify_failure(error);
        self.resume_reopen();
    }

    fn release_transport(&mut self) {
        for task in [self.transport.take(), self.close_deadline.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }
        self.writer = None;
        self.current = None;
        self.set_state(ConnectionState::Closed);
    }

    fn resume_reopen(&mut self) {
        if self.reopening {
            self.reopening = false;
            self.open();
        }
    }

    fn notify_failure(&self, error: Error) {
        if let Some(listener) = self.listener() {
            listener.on_failure(error);
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current == Some(generation)
    }

    fn is_idle(&self) -> bool {
        self.state() == ConnectionState::Closed && self.current.is_none() && !self.reopening
    }

    /// Give up the mailbox if nothing is pending. Returns `true` if the worker should exit.
    fn release(&self) -> bool {
        let mut worker = self
            .inner
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if self.rx.is_empty() {
            *worker = None;
            true
        } else {
            false
        }
    }

    fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state_tx.send_replace(state);
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.inner
            .listener
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Connect, then pump frames from the socket into the worker until it closes.
async fn run_transport(
    generation: u64,
    request: Result<Request>,
    config: Config,
    events: mpsc::UnboundedSender<Op>,
) {
    let connected = match request {
        Ok(request) => {
            connect_async_tls_with_config(request, None, false, config.connector.clone())
                .await
                .map_err(Error::from)
        }
        Err(e) => Err(e),
    };

    let (writer, reader) = match connected {
        Ok((ws_stream, _)) => ws_stream.split(),
        Err(error) => {
            _ = events.send(Op::Failed { generation, error });
            return;
        }
    };

    if events.send(Op::Opened { generation, writer }).is_err() {
        return;
    }

    read_frames(generation, reader, &config, &events).await;
}

async fn read_frames(
    generation: u64,
    mut reader: WsReader,
    config: &Config,
    events: &mpsc::UnboundedSender<Op>,
) {
    let mut pinger = config
        .ping_interval
        .map(|period| interval_at(Instant::now() + period, period));

    loop {
        let frame = match pinger.as_mut() {
            Some(pinger) => {
                tokio::select! {
                    frame = reader.next() => frame,
                    _ = pinger.tick() => {
                        if events.send(Op::Ping { generation }).is_err() {
                            return;
                        }
                        continue;
                    }
                }
            }
            None => reader.next().await,
        };

        let op = match frame {
            Some(Ok(Message::Text(text))) => Op::Frame {
                generation,
                text: text.as_str().to_owned(),
            },
            Some(Ok(Message::Close(_))) => Op::Closing { generation },
            Some(Ok(_)) => {
                // Ignore binary frames and ping/pong control frames.
                continue;
            }
            Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed))
            | None => {
                _ = events.send(Op::Closed { generation });
                return;
            }
            Some(Err(e)) => {
                _ = events.send(Op::Failed {
                    generation,
                    error: e.into(),
                });
                return;
            }
        };

        if events.send(op).is_err() {
            return;
        }
    }
}

/// Build the upgrade request: query pairs, headers and cookies from `config`.
pub(crate) fn build_request(endpoint: &Url, config: &Config) -> Result<Request> {
    let mut url = endpoint.clone();
    if !config.query.is_empty() {
        url.query_pairs_mut().extend_pairs(config.query.iter());
    }

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();

    for (name, value) in &config.headers {
        headers.append(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }

    if !config.cookies.is_empty() {
        let cookie = config
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        headers.insert(header::COOKIE, HeaderValue::from_str(&cookie)?);
    }

    Ok(request)
}
