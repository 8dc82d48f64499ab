//! Websocket transport with transparent reconnection.
//!
//! The transport owns the single socket. A writer task drains an outbound
//! channel into the socket and a reader task forwards text and binary messages
//! to the inbound channel handed out by [`Transport::new`]. When the reader sees
//! the socket go away without [`Transport::close`] having been called, it runs
//! the reconnect loop: exponential backoff, a fresh URL from the
//! [`EndpointProvider`] on every attempt, and a bounded number of attempts.

use crate::endpoint::EndpointProvider;
use crate::error::{Result, SpeakError};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::AsRefStr)]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionState {
    Connecting,
    Open,
    ReconnectPending,
    Closing,
    Closed,
}

impl ConnectionState {
    /// Status string reported to observers when entering this state.
    pub fn status_label(self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "connected",
            ConnectionState::ReconnectPending => "reconnecting",
            ConnectionState::Closing | ConnectionState::Closed => "disconnected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    State(ConnectionState),
    Error(String),
}

impl TransportEvent {
    pub fn status(&self) -> &'static str {
        match self {
            TransportEvent::State(state) => state.status_label(),
            TransportEvent::Error(_) => "error",
        }
    }
}

/// Message received from the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text(String),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 6,
            reconnect_base_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
        }
    }
}

impl TransportConfig {
    /// Backoff before reconnect attempt `attempt` (1-based).
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.reconnect_base_delay
            .saturating_mul(1u32 << exp)
            .min(self.reconnect_max_delay)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Link {
    outbound: mpsc::UnboundedSender<Message>,
    generation: u64,
}

struct Inner {
    provider: Arc<dyn EndpointProvider>,
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    inbound: mpsc::UnboundedSender<InboundMessage>,
    link: Mutex<Option<Link>>,
    shutdown: Mutex<CancellationToken>,
    generations: AtomicU64,
}

#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    pub fn new(
        provider: Arc<dyn EndpointProvider>,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<InboundMessage>) {
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(ConnectionState::Closed);

        let transport = Self {
            inner: Arc::new(Inner {
                provider,
                config,
                state,
                events,
                inbound,
                link: Mutex::new(None),
                shutdown: Mutex::new(CancellationToken::new()),
                generations: AtomicU64::new(0),
            }),
        };
        (transport, inbound_rx)
    }

    /// Fetches a fresh endpoint and opens the socket. Resolves once the socket is open.
    ///
    /// While a connect or reconnect is already in flight this waits for its outcome
    /// instead of opening a second socket.
    pub async fn connect(&self) -> Result<()> {
        let mut state = self.watch_state();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Open => return Ok(()),
                ConnectionState::Closing | ConnectionState::Closed => {
                    if self.inner.begin_connecting() {
                        break;
                    }
                }
                ConnectionState::Connecting | ConnectionState::ReconnectPending => {
                    log::debug!("Transport: connection attempt in progress, waiting for it");
                    if state.changed().await.is_err() {
                        return Err(SpeakError::NotConnected);
                    }
                }
            }
        }

        {
            let mut shutdown = lock(&self.inner.shutdown);
            if shutdown.is_cancelled() {
                *shutdown = CancellationToken::new();
            }
        }

        match self.inner.establish().await {
            Ok(ws) => {
                spawn_link(&self.inner, ws);
                self.inner.set_state(ConnectionState::Open);
                Ok(())
            }
            Err(e) => {
                self.inner.emit_error(e.to_string());
                self.inner.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    pub fn send(&self, message: Message) -> Result<()> {
        if self.state() != ConnectionState::Open {
            return Err(SpeakError::NotConnected);
        }
        let link = lock(&self.inner.link);
        let link = link.as_ref().ok_or(SpeakError::NotConnected)?;
        link.outbound
            .send(message)
            .map_err(|_| SpeakError::NotConnected)
    }

    pub fn send_text(&self, text: String) -> Result<()> {
        self.send(Message::Text(text.into()))
    }

    /// Closes the socket and suppresses any further reconnect attempts.
    pub fn close(&self) {
        lock(&self.inner.shutdown).cancel();
        // Closing and Closed report the same status; observers hear about Closed only.
        self.inner.state.send_if_modified(|state| {
            let open = *state != ConnectionState::Closed;
            if open {
                *state = ConnectionState::Closing;
            }
            open
        });
        // Dropping the outbound sender lets the writer send the close frame.
        if let Some(link) = lock(&self.inner.link).take() {
            log::info!("Transport: closing connection (generation {})", link.generation);
        }
        self.inner.set_state(ConnectionState::Closed);
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::info!("Transport: {} -> {}", previous, state);
            let _ = self.events.send(TransportEvent::State(state));
        }
    }

    /// Moves a closed transport to `Connecting`. Returns false if another caller got there first.
    fn begin_connecting(&self) -> bool {
        let started = self.state.send_if_modified(|state| {
            if matches!(*state, ConnectionState::Closing | ConnectionState::Closed) {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if started {
            log::info!("Transport: -> {}", ConnectionState::Connecting);
            let _ = self.events.send(TransportEvent::State(ConnectionState::Connecting));
        }
        started
    }

    fn emit_error(&self, message: String) {
        log::warn!("Transport: {}", message);
        let _ = self.events.send(TransportEvent::Error(message));
    }

    fn shutdown_token(&self) -> CancellationToken {
        lock(&self.shutdown).clone()
    }

    async fn establish(&self) -> Result<WsStream> {
        let url = self
            .provider
            .fetch_url()
            .await
            .map_err(|e| SpeakError::Connection(format!("endpoint fetch failed: {}", e)))?;

        let (ws, response) = connect_async(url.as_str())
            .await
            .map_err(|e| SpeakError::Connection(format!("handshake failed: {}", e)))?;

        log::debug!("Transport: handshake complete, status {}", response.status());
        Ok(ws)
    }

    async fn on_link_lost(self: Arc<Self>, generation: u64) {
        {
            let mut link = lock(&self.link);
            if link.as_ref().map(|current| current.generation) != Some(generation) {
                return;
            }
            *link = None;
        }

        if self.shutdown_token().is_cancelled() {
            return;
        }

        self.reconnect().await;
    }

    async fn reconnect(self: &Arc<Self>) {
        let shutdown = self.shutdown_token();
        let max_attempts = self.config.max_reconnect_attempts;

        for attempt in 1..=max_attempts {
            self.set_state(ConnectionState::ReconnectPending);
            let delay = self.config.reconnect_delay(attempt);
            log::info!(
                "Transport: reconnect attempt {}/{} in {:?}",
                attempt,
                max_attempts,
                delay
            );

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.establish().await {
                Ok(ws) => {
                    if shutdown.is_cancelled() {
                        return;
                    }
                    spawn_link(self, ws);
                    self.set_state(ConnectionState::Open);
                    return;
                }
                Err(e) => self.emit_error(format!("reconnect attempt {} failed: {}", attempt, e)),
            }
        }

        self.emit_error(format!(
            "giving up after {} reconnect attempts",
            max_attempts
        ));
        self.set_state(ConnectionState::Closed);
    }
}

/// Splits the socket into writer and reader tasks and installs it as the current link.
fn spawn_link(inner: &Arc<Inner>, ws: WsStream) {
    let (mut sink, mut stream) = ws.split();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let generation = inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
    *lock(&inner.link) = Some(Link {
        outbound,
        generation,
    });

    tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if let Err(e) = sink.send(message).await {
                log::warn!("Transport: send failed: {}", e);
                return;
            }
        }
        let _ = sink.close().await;
    });

    let shutdown = inner.shutdown_token();
    let inner = Arc::clone(inner);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => {
                        let _ = inner.inbound.send(InboundMessage::Text(text.to_string()));
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let _ = inner.inbound.send(InboundMessage::Binary(data.as_slice().to_vec()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Transport: server closed connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Transport: websocket error: {}", e);
                        break;
                    }
                    None => break,
                },
            }
        }
        inner.on_link_lost(generation).await;
    });
}
