#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Each test binary uses a different subset of the mock server"
)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// What the server pushes to every connected client.
#[derive(Clone, Debug)]
enum Push {
    Text(String),
    Close,
}

/// Upgrade request as seen by the server.
#[derive(Clone, Debug)]
pub struct Handshake {
    pub uri: String,
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    pings: AtomicUsize,
}

/// Mock cable server.
pub struct MockCableServer {
    addr: SocketAddr,
    /// Pushes to ALL connected clients
    push_tx: broadcast::Sender<Push>,
    /// Text frames received from clients
    frame_rx: mpsc::UnboundedReceiver<String>,
    handshakes: Arc<Mutex<Vec<Handshake>>>,
    counters: Arc<Counters>,
}

impl MockCableServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (push_tx, _) = broadcast::channel::<Push>(100);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel::<String>();
        let handshakes = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        let pushes = push_tx.clone();
        let recorded = Arc::clone(&handshakes);
        let stats = Arc::clone(&counters);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };

                let recorded = Arc::clone(&recorded);
                let callback = move |request: &Request, response: Response| {
                    let headers = request
                        .headers()
                        .iter()
                        .map(|(name, value)| {
                            (name.to_string(), value.to_str().unwrap_or_default().to_owned())
                        })
                        .collect();
                    recorded.lock().unwrap().push(Handshake {
                        uri: request.uri().to_string(),
                        headers,
                    });
                    Ok::<Response, ErrorResponse>(response)
                };

                let Ok(ws_stream) = tokio_tungstenite::accept_hdr_async(stream, callback).await
                else {
                    continue;
                };

                stats.accepted.fetch_add(1, Ordering::SeqCst);
                let active = stats.active.fetch_add(1, Ordering::SeqCst) + 1;
                stats.max_active.fetch_max(active, Ordering::SeqCst);

                let (mut write, mut read) = ws_stream.split();
                let frames = frame_tx.clone();
                let mut push_rx = pushes.subscribe();
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    loop {
                        tokio::select! {
                            msg = read.next() => {
                                match msg {
                                    Some(Ok(Message::Text(text))) => {
                                        drop(frames.send(text.to_string()));
                                    }
                                    Some(Ok(Message::Ping(_))) => {
                                        stats.pings.fetch_add(1, Ordering::SeqCst);
                                    }
                                    // Counted as gone before the close reply goes out.
                                    Some(Ok(Message::Close(_))) => break,
                                    Some(Ok(_)) => {}
                                    _ => break,
                                }
                            }
                            push = push_rx.recv() => {
                                let message = match push {
                                    Ok(Push::Text(text)) => Message::Text(text.into()),
                                    Ok(Push::Close) => Message::Close(None),
                                    Err(_) => break,
                                };
                                if write.send(message).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }

                    stats.active.fetch_sub(1, Ordering::SeqCst);

                    // Finish the close handshake, then let the socket drop.
                    while let Some(Ok(_)) = read.next().await {}
                    drop(write.close().await);
                });
            }
        });

        Self {
            addr,
            push_tx,
            frame_rx,
            handshakes,
            counters,
        }
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Send a text frame to all connected clients.
    pub fn send(&self, text: &str) {
        drop(self.push_tx.send(Push::Text(text.to_owned())));
    }

    pub fn send_json(&self, value: &Value) {
        self.send(&value.to_string());
    }

    /// Start the close handshake on every connection.
    pub fn close_all(&self) {
        drop(self.push_tx.send(Push::Close));
    }

    /// Next text frame sent by any client, decoded as JSON.
    pub async fn recv_frame(&mut self) -> Option<Value> {
        let text = timeout(TIMEOUT, self.frame_rx.recv()).await.ok().flatten()?;
        serde_json::from_str(&text).ok()
    }

    /// Assert no client frame arrives within `wait`.
    pub async fn assert_no_frame(&mut self, wait: Duration) {
        if let Ok(Some(text)) = timeout(wait, self.frame_rx.recv()).await {
            panic!("unexpected frame: {text}");
        }
    }

    #[must_use]
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.handshakes.lock().unwrap().clone()
    }

    #[must_use]
    pub fn accepted(&self) -> usize {
        self.counters.accepted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open connections seen so far.
    #[must_use]
    pub fn max_active(&self) -> usize {
        self.counters.max_active.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn pings(&self) -> usize {
        self.counters.pings.load(Ordering::SeqCst)
    }

    /// Poll `condition` until it holds or [`TIMEOUT`] elapses.
    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, condition: F) -> bool {
        timeout(TIMEOUT, async {
            while !condition(self) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }
}

/// Server that completes the WebSocket handshake and then never reads.
///
/// Close frames sent by a client are never answered.
pub struct SilentServer {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl SilentServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
                    continue;
                };
                count.fetch_add(1, Ordering::SeqCst);
                held.push(ws_stream);
            }
        });

        Self { addr, accepted }
    }

    #[must_use]
    pub fn url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    #[must_use]
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Frames in the wire format the server speaks.
pub mod frames {
    use serde_json::{Value, json};

    #[must_use]
    pub fn confirm(identifier: &str) -> Value {
        json!({"identifier": identifier, "type": "confirm_subscription"})
    }

    #[must_use]
    pub fn reject(identifier: &str) -> Value {
        json!({"identifier": identifier, "type": "reject_subscription"})
    }

    #[must_use]
    pub fn broadcast(identifier: &str, message: Value) -> Value {
        json!({"identifier": identifier, "message": message})
    }

    #[must_use]
    pub fn ping() -> Value {
        json!({"type": "ping", "message": 1_700_000_000})
    }

    #[must_use]
    pub fn welcome() -> Value {
        json!({"type": "welcome"})
    }

    #[must_use]
    pub fn subscribe(identifier: &str) -> Value {
        json!({"command": "subscribe", "identifier": identifier})
    }

    #[must_use]
    pub fn unsubscribe(identifier: &str) -> Value {
        json!({"command": "unsubscribe", "identifier": identifier})
    }
}
