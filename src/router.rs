//! Demultiplexes inbound frames into one ordered event stream per request.

use crate::error::{Result, SpeakError};
use crate::protocol::{AudioFrame, Frame, OutboundRequest, ProtocolError, StatusFrame};
use crate::reorder::{PartBoundary, ReorderBuffer};
use crate::transport::{ConnectionState, InboundMessage, Transport, TransportEvent};
use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Status(StatusFrame),
    Audio(AudioFrame),
}

/// Hands out request ids that are unique for one client instance.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed) + 1
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct StreamSlot {
    token: u64,
    events: mpsc::UnboundedSender<StreamEvent>,
    reorder: ReorderBuffer,
    status_done: bool,
}

impl StreamSlot {
    fn deliver(&self, event: StreamEvent) {
        // The consumer may already be gone; its registration guard cleans up.
        let _ = self.events.send(event);
    }

    fn is_complete(&self) -> bool {
        self.status_done && self.reorder.is_finished()
    }
}

#[derive(Default)]
struct Registry {
    streams: Mutex<HashMap<u64, StreamSlot>>,
    tokens: AtomicU64,
    boundary: Mutex<PartBoundary>,
}

impl Registry {
    fn register(&self, request_id: u64, events: mpsc::UnboundedSender<StreamEvent>) -> Result<u64> {
        let mut streams = lock(&self.streams);
        if streams.contains_key(&request_id) {
            return Err(SpeakError::DuplicateRequest(request_id));
        }
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        streams.insert(
            request_id,
            StreamSlot {
                token,
                events,
                reorder: ReorderBuffer::with_boundary(*lock(&self.boundary)),
                status_done: false,
            },
        );
        Ok(token)
    }

    fn unregister(&self, request_id: u64, token: u64) {
        let mut streams = lock(&self.streams);
        if streams.get(&request_id).is_some_and(|slot| slot.token == token) {
            streams.remove(&request_id);
            log::debug!("Router: request {} unregistered", request_id);
        }
    }

    fn terminate_all(&self) {
        let mut streams = lock(&self.streams);
        if !streams.is_empty() {
            log::warn!("Router: connection closed, ending {} open streams", streams.len());
            streams.clear();
        }
    }

    fn is_registered(&self, request_id: u64) -> bool {
        lock(&self.streams).contains_key(&request_id)
    }

    fn route(&self, message: InboundMessage) {
        let frame = match decode_message(&message) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Router: dropping frame: {}", e);
                return;
            }
        };

        let request_id = frame.request_id();
        let mut streams = lock(&self.streams);
        let Some(slot) = streams.get_mut(&request_id) else {
            log::debug!("Router: no stream for request {}, dropping frame", request_id);
            return;
        };

        match frame {
            Frame::Status(status) => {
                let terminal = status.is_terminal();
                let failed = status.is_failure();
                log::debug!("Router: request {} status {:?}", request_id, status.status);
                slot.deliver(StreamEvent::Status(status));
                if terminal {
                    slot.status_done = true;
                }
                if failed {
                    // No audio follows a failed request.
                    for audio in slot.reorder.finish() {
                        slot.deliver(StreamEvent::Audio(audio));
                    }
                }
            }
            Frame::Audio(audio) => {
                for ready in slot.reorder.push(audio) {
                    slot.deliver(StreamEvent::Audio(ready));
                }
            }
        }

        if slot.is_complete() {
            streams.remove(&request_id);
            log::debug!("Router: request {} complete", request_id);
        }
    }
}

/// Decodes one websocket message into a typed frame.
pub fn decode_message(message: &InboundMessage) -> std::result::Result<Frame, ProtocolError> {
    match message {
        InboundMessage::Text(text) => Frame::from_text(text),
        InboundMessage::Binary(bytes) => Frame::from_binary(bytes),
    }
}

/// Removes the stream's registration when dropped.
struct Registration {
    registry: Arc<Registry>,
    request_id: u64,
    token: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.unregister(self.request_id, self.token);
    }
}

/// Ordered events for one request. Ends once both the status and binary channels
/// have completed. Dropping it cancels the request locally.
pub struct ResponseStream {
    request_id: u64,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    _registration: Registration,
}

impl ResponseStream {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Waits for the next in-order event; `None` once the request is complete.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    pub fn cancel(self) {
        log::debug!("Router: request {} cancelled", self.request_id);
    }
}

impl Stream for ResponseStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

pub struct RequestRouter {
    transport: Transport,
    registry: Arc<Registry>,
    dispatcher: JoinHandle<()>,
}

impl RequestRouter {
    /// Starts routing the transport's inbound messages.
    pub fn new(transport: Transport, inbound: mpsc::UnboundedReceiver<InboundMessage>) -> Self {
        let registry = Arc::new(Registry::default());
        let dispatcher = tokio::spawn(dispatch(
            Arc::clone(&registry),
            inbound,
            transport.subscribe(),
        ));

        Self {
            transport,
            registry,
            dispatcher,
        }
    }

    /// Registers a stream for the request and sends it. Fails without touching the
    /// network when a stream for the same id is still open.
    pub fn open_stream(&self, request: &OutboundRequest) -> Result<ResponseStream> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let token = self.registry.register(request.request_id, events_tx)?;
        let registration = Registration {
            registry: Arc::clone(&self.registry),
            request_id: request.request_id,
            token,
        };

        let payload = request.to_json()?;
        self.transport.send_text(payload)?;
        log::debug!("Router: sent request {}", request.request_id);

        Ok(ResponseStream {
            request_id: request.request_id,
            events,
            _registration: registration,
        })
    }

    /// Part boundary rule for streams opened from now on.
    pub fn set_part_boundary(&self, boundary: PartBoundary) {
        *lock(&self.registry.boundary) = boundary;
    }

    pub fn is_open(&self, request_id: u64) -> bool {
        self.registry.is_registered(request_id)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }
}

impl Drop for RequestRouter {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

async fn dispatch(
    registry: Arc<Registry>,
    mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            biased;
            message = inbound.recv() => match message {
                Some(message) => registry.route(message),
                None => break,
            },
            event = events.recv() => match event {
                Ok(TransportEvent::State(ConnectionState::Closed)) => registry.terminate_all(),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Router: missed {} transport events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    log::debug!("Router: dispatcher stopped");
}
