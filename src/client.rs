//! High level client: one socket, many overlapping utterances, played in the
//! order they were requested.

use crate::audio_sink::AudioSink;
use crate::config::ClientConfig;
use crate::endpoint::EndpointProvider;
use crate::error::{Result, SpeakError};
use crate::protocol::{OutboundRequest, StatusFrame, StreamMode};
use crate::reorder::PartBoundary;
use crate::router::{RequestIdGenerator, RequestRouter, ResponseStream, StreamEvent};
use crate::sequencer::{Sequencer, SequencerConfig};
use crate::transport::{ConnectionState, Transport, TransportConfig, TransportEvent};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Marks the utterance complete in the sequencer however its pump task ends.
struct CompletionGuard {
    sequencer: Sequencer,
    global_id: u64,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.sequencer.mark_complete(self.global_id);
    }
}

/// One utterance in flight.
pub struct SpeechHandle {
    request_id: u64,
    global_id: u64,
    cancel: CancellationToken,
    done: oneshot::Receiver<Result<StatusFrame>>,
}

impl SpeechHandle {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn global_id(&self) -> u64 {
        self.global_id
    }

    /// Stops receiving this utterance. Audio already handed to the sequencer still plays.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Resolves with the terminal status once all of the utterance's audio has been
    /// received. A remote `error` or `timeout` resolves to [`SpeakError::Remote`].
    pub async fn finished(self) -> Result<StatusFrame> {
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(SpeakError::Cancelled(self.request_id)),
        }
    }
}

pub struct SpeechClient {
    router: RequestRouter,
    sequencer: Sequencer,
    sequencer_task: Mutex<Option<JoinHandle<()>>>,
    sink: Arc<dyn AudioSink>,
    ids: RequestIdGenerator,
    voice_id: Option<String>,
    stream_mode: Option<StreamMode>,
    cancel: Mutex<CancellationToken>,
}

impl SpeechClient {
    /// Builds the client. Must be called inside a tokio runtime.
    pub fn new(
        provider: Arc<dyn EndpointProvider>,
        sink: Arc<dyn AudioSink>,
        transport_config: TransportConfig,
        sequencer_config: SequencerConfig,
    ) -> Self {
        let (transport, inbound) = Transport::new(provider, transport_config);
        let router = RequestRouter::new(transport, inbound);
        let (sequencer, sequencer_task) = Sequencer::spawn(Arc::clone(&sink), sequencer_config);

        Self {
            router,
            sequencer,
            sequencer_task: Mutex::new(Some(sequencer_task)),
            sink,
            ids: RequestIdGenerator::new(),
            voice_id: None,
            stream_mode: None,
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn from_config(config: &ClientConfig, sink: Arc<dyn AudioSink>) -> Result<Self> {
        let provider = config.endpoint_provider()?;
        let client = Self::new(
            provider,
            sink,
            config.transport.clone(),
            config.sequencer.clone(),
        )
        .with_voice(config.voice_id.clone())
        .with_stream_mode(config.stream_mode)
        .with_part_boundary(config.part_boundary);
        Ok(client)
    }

    pub fn with_voice(mut self, voice_id: Option<String>) -> Self {
        self.voice_id = voice_id;
        self
    }

    pub fn with_stream_mode(mut self, stream_mode: Option<StreamMode>) -> Self {
        self.stream_mode = stream_mode;
        self
    }

    pub fn with_part_boundary(self, boundary: PartBoundary) -> Self {
        self.router.set_part_boundary(boundary);
        self
    }

    pub async fn connect(&self) -> Result<()> {
        self.router.transport().connect().await
    }

    /// Connection status notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.router.transport().subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.router.transport().state()
    }

    pub fn sequencer(&self) -> &Sequencer {
        &self.sequencer
    }

    /// Raw per-request event stream; bypasses the sequencer.
    pub fn open_stream(&self, request: &OutboundRequest) -> Result<ResponseStream> {
        self.router.open_stream(request)
    }

    /// Requests speech for `text` and queues its audio behind earlier utterances.
    pub fn speak(&self, text: &str) -> Result<SpeechHandle> {
        let request_id = self.ids.next_id();
        let request = OutboundRequest::generate(
            request_id,
            text,
            self.voice_id.as_deref(),
            self.stream_mode,
        );
        let stream = self.router.open_stream(&request)?;
        let global_id = self.sequencer.allocate_id();
        log::info!(
            "Client: speaking request {} as utterance {} ({} chars)",
            request_id,
            global_id,
            text.chars().count()
        );

        let cancel = lock(&self.cancel).child_token();
        let (done_tx, done) = oneshot::channel();
        let guard = CompletionGuard {
            sequencer: self.sequencer.clone(),
            global_id,
        };
        tokio::spawn(pump(stream, guard, cancel.clone(), done_tx));

        Ok(SpeechHandle {
            request_id,
            global_id,
            cancel,
            done,
        })
    }

    /// Drops all pending speech and anything queued for playback.
    pub fn reset(&self) {
        let previous = std::mem::replace(&mut *lock(&self.cancel), CancellationToken::new());
        previous.cancel();
        self.sequencer.reset();
        log::info!("Client: reset, pending speech dropped");
    }

    /// Resolves once every queued utterance has finished playing.
    pub async fn wait_idle(&self) {
        self.sequencer.idle().await;
    }

    /// Cancels pending speech, closes the socket and drains the sink.
    pub async fn shutdown(&self) -> Result<()> {
        lock(&self.cancel).cancel();
        self.router.transport().close();
        self.sequencer.shutdown().await;
        let task = lock(&self.sequencer_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("Client: sequencer task failed: {}", e);
            }
        }
        self.sink.end_stream().await?;
        log::info!("Client: shut down");
        Ok(())
    }
}

async fn pump(
    mut stream: ResponseStream,
    guard: CompletionGuard,
    cancel: CancellationToken,
    done: oneshot::Sender<Result<StatusFrame>>,
) {
    let request_id = stream.request_id();
    let mut terminal = None;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                log::debug!("Client: request {} cancelled", request_id);
                let _ = done.send(Err(SpeakError::Cancelled(request_id)));
                return;
            }
            event = stream.next_event() => event,
        };

        match event {
            Some(StreamEvent::Audio(frame)) => {
                guard
                    .sequencer
                    .add_chunk(frame.prefix, frame.payload, guard.global_id);
            }
            Some(StreamEvent::Status(status)) => {
                log::debug!("Client: request {} status {:?}", request_id, status.status);
                if status.is_terminal() {
                    terminal = Some(status);
                }
            }
            None => break,
        }
    }

    drop(guard);
    let result = match terminal {
        Some(status) => status.into_result(),
        None => Err(SpeakError::Incomplete(request_id)),
    };
    if let Err(e) = &result {
        log::warn!("Client: {}", e);
    }
    let _ = done.send(result);
}
