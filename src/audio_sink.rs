use crate::protocol::{parse_audio_header, AudioHeader, PrefixHeader, ProtocolError};
use crate::resampler::StreamResampler;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, DefaultStreamConfigError, DeviceNameError, DevicesError, PlayStreamError,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};

#[derive(Error, Debug, Clone)]
pub enum AudioError {
    #[error("Failed to write audio data: {0}")]
    WriteError(String),

    #[error("Failed to stop audio playback: {0}")]
    StopError(String),

    #[error("Audio device error: {0}")]
    DeviceError(String),
}

impl From<DefaultStreamConfigError> for AudioError {
    fn from(err: DefaultStreamConfigError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<BuildStreamError> for AudioError {
    fn from(err: BuildStreamError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<PlayStreamError> for AudioError {
    fn from(err: PlayStreamError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<DevicesError> for AudioError {
    fn from(err: DevicesError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

impl From<DeviceNameError> for AudioError {
    fn from(err: DeviceNameError) -> Self {
        AudioError::DeviceError(err.to_string())
    }
}

/// Destination for ordered audio fragments.
#[async_trait::async_trait]
pub trait AudioSink: Send + Sync {
    /// Queue one fragment. The first fragment of a part starts with its WAV header.
    async fn write_fragment(&self, prefix: &PrefixHeader, payload: &[u8])
        -> Result<(), AudioError>;

    /// The current utterance has no more fragments; anything held back for it
    /// must be queued now.
    async fn finish_utterance(&self) -> Result<(), AudioError> {
        Ok(())
    }

    /// Discard all queued, unplayed audio.
    async fn clear(&self) -> Result<(), AudioError>;

    /// Let queued audio play out, then release the output device.
    async fn end_stream(&self) -> Result<(), AudioError>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Mono samples decoded from one fragment.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedAudio {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

/// Tracks the header of the part currently being played and converts its
/// fragments to mono samples. Bytes of a frame split across fragments are
/// carried over to the next fragment.
#[derive(Debug, Default)]
pub struct PartDecoder {
    header: Option<AudioHeader>,
    carry: Vec<u8>,
}

impl PartDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn header(&self) -> Option<AudioHeader> {
        self.header
    }

    pub fn reset(&mut self) {
        self.header = None;
        self.carry.clear();
    }

    pub fn decode(
        &mut self,
        prefix: &PrefixHeader,
        payload: &[u8],
    ) -> Result<Option<DecodedAudio>, ProtocolError> {
        if payload.is_empty() {
            return Ok(None);
        }

        let body = if prefix.is_first_of_part() {
            self.reset();
            let header = parse_audio_header(payload)?;
            log::debug!(
                "AudioSink: part {} of request {}: {}Hz, {}ch, {} bits",
                prefix.part_id,
                prefix.request_id,
                header.sample_rate,
                header.channels,
                header.bits_per_sample
            );
            self.header = Some(header);
            &payload[header.data_offset..]
        } else {
            payload
        };

        let header = self.header.ok_or_else(|| {
            ProtocolError::InvalidAudioContainer(format!(
                "no header seen for part {} of request {}",
                prefix.part_id, prefix.request_id
            ))
        })?;

        let frame_len = header.bytes_per_frame();
        if frame_len == 0 {
            return Ok(None);
        }

        self.carry.extend_from_slice(body);
        let usable = self.carry.len() - self.carry.len() % frame_len;
        let pcm: Vec<u8> = self.carry.drain(..usable).collect();
        let interleaved = header.decode_samples(&pcm);

        Ok(Some(DecodedAudio {
            sample_rate: header.sample_rate,
            samples: downmix(&interleaved, header.channels as usize),
        }))
    }
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Growable queue of mono samples drained by the output callback.
#[derive(Debug, Default)]
pub struct PlaybackBuffer {
    samples: VecDeque<f32>,
}

impl PlaybackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, samples: &[f32]) {
        self.samples.extend(samples.iter().copied());
    }

    /// Fills one output buffer of interleaved frames, writing silence on underflow.
    /// Returns the number of queued samples consumed.
    pub fn fill(&mut self, output: &mut [f32], channels: usize) -> usize {
        let mut played = 0;
        for frame in output.chunks_mut(channels.max(1)) {
            let sample = match self.samples.pop_front() {
                Some(sample) => {
                    played += 1;
                    sample
                }
                None => 0.0,
            };
            frame.fill(sample);
        }
        played
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[derive(Debug, Clone)]
pub struct CpalConfig {
    /// Optional output device name
    pub device_name: Option<String>,
    /// Queue level at which the buffer counts as drained
    pub near_empty: Duration,
}

impl Default for CpalConfig {
    fn default() -> Self {
        Self {
            device_name: None,
            near_empty: Duration::from_millis(50),
        }
    }
}

struct SharedPlayback {
    buffer: Mutex<PlaybackBuffer>,
    drained: Notify,
    output_rate: AtomicU32,
    near_empty: Duration,
    alive: AtomicBool,
}

impl SharedPlayback {
    fn near_empty_samples(&self) -> usize {
        let rate = self.output_rate.load(Ordering::Acquire) as f64;
        (rate * self.near_empty.as_secs_f64()) as usize
    }

    fn buffered(&self) -> Duration {
        let rate = self.output_rate.load(Ordering::Acquire);
        if rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(lock(&self.buffer).len() as f64 / rate as f64)
    }

    fn is_drained(&self) -> bool {
        !self.alive.load(Ordering::Acquire)
            || lock(&self.buffer).len() <= self.near_empty_samples()
    }
}

enum SinkCommand {
    Configure {
        sample_rate: u32,
        reply: oneshot::Sender<u32>,
    },
    Stop,
}

/// Plays fragments through the default (or named) cpal output device.
pub struct CpalSink {
    commands: mpsc::Sender<SinkCommand>,
    shared: Arc<SharedPlayback>,
    decoder: Mutex<PartDecoder>,
    resampler: Mutex<Option<StreamResampler>>,
    source_rate: AtomicU32,
    is_stopped: AtomicBool,
    audio_thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl CpalSink {
    pub fn new(config: CpalConfig) -> Result<Self, AudioError> {
        log::debug!("AudioSink: Creating new CpalSink");
        let shared = Arc::new(SharedPlayback {
            buffer: Mutex::new(PlaybackBuffer::new()),
            drained: Notify::new(),
            output_rate: AtomicU32::new(0),
            near_empty: config.near_empty,
            alive: AtomicBool::new(true),
        });

        let (commands, command_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_shared = Arc::clone(&shared);

        let audio_thread = thread::spawn(move || {
            if let Err(e) = run_audio_thread(config, &thread_shared, command_rx, &ready_tx) {
                log::error!("AudioSink: audio thread failed: {}", e);
                let _ = ready_tx.send(Err(e));
            }
            thread_shared.alive.store(false, Ordering::Release);
            thread_shared.drained.notify_waiters();
            log::debug!("AudioSink: Audio thread exiting");
        });

        let output_rate = ready_rx
            .recv()
            .map_err(|_| AudioError::DeviceError("audio thread exited during setup".to_string()))??;
        log::debug!("AudioSink: output running at {}Hz", output_rate);

        Ok(Self {
            commands,
            shared,
            decoder: Mutex::new(PartDecoder::new()),
            resampler: Mutex::new(None),
            source_rate: AtomicU32::new(0),
            is_stopped: AtomicBool::new(false),
            audio_thread: Mutex::new(Some(audio_thread)),
        })
    }

    /// Duration of audio queued but not yet played.
    pub fn buffered(&self) -> Duration {
        self.shared.buffered()
    }

    async fn wait_for_drain(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.is_drained() {
                return;
            }
            drained.await;
        }
    }

    fn flush_resampler(&self) -> Result<(), AudioError> {
        let tail = match lock(&self.resampler).as_mut() {
            Some(resampler) => resampler.flush()?,
            None => return Ok(()),
        };
        lock(&self.shared.buffer).push(&tail);
        Ok(())
    }

    async fn switch_rate(&self, sample_rate: u32) -> Result<(), AudioError> {
        self.flush_resampler()?;
        // Audio queued at the previous rate must play out before the device changes.
        let limit = self.shared.buffered() + Duration::from_secs(1);
        if tokio::time::timeout(limit, self.wait_for_drain()).await.is_err() {
            log::warn!("AudioSink: drain before rate switch did not finish within {:?}", limit);
        }

        let (reply, reply_rx) = oneshot::channel();
        self.commands
            .send(SinkCommand::Configure { sample_rate, reply })
            .map_err(|_| AudioError::WriteError("Audio thread disconnected".to_string()))?;
        let output_rate = reply_rx
            .await
            .map_err(|_| AudioError::DeviceError("Audio thread did not reply".to_string()))?;

        let resampler = if output_rate != sample_rate {
            Some(StreamResampler::new(sample_rate, output_rate)?)
        } else {
            None
        };
        *lock(&self.resampler) = resampler;
        self.source_rate.store(sample_rate, Ordering::Release);
        Ok(())
    }
}

#[async_trait::async_trait]
impl AudioSink for CpalSink {
    async fn write_fragment(
        &self,
        prefix: &PrefixHeader,
        payload: &[u8],
    ) -> Result<(), AudioError> {
        if self.is_stopped.load(Ordering::Acquire) {
            log::warn!("AudioSink: Cannot write - sink is stopped");
            return Err(AudioError::WriteError("Sink is stopped".to_string()));
        }

        let decoded = lock(&self.decoder).decode(prefix, payload);
        let decoded = match decoded {
            Ok(Some(decoded)) => decoded,
            Ok(None) => return Ok(()),
            Err(e) => {
                log::warn!("AudioSink: dropping fragment {:?}: {}", prefix.key(), e);
                return Ok(());
            }
        };

        if decoded.sample_rate != self.source_rate.load(Ordering::Acquire) {
            self.switch_rate(decoded.sample_rate).await?;
        }

        let samples = match lock(&self.resampler).as_mut() {
            Some(resampler) => resampler.process(&decoded.samples)?,
            None => decoded.samples,
        };

        lock(&self.shared.buffer).push(&samples);
        log::debug!(
            "AudioSink: queued {} samples ({:?} buffered)",
            samples.len(),
            self.shared.buffered()
        );
        Ok(())
    }

    async fn finish_utterance(&self) -> Result<(), AudioError> {
        self.flush_resampler()
    }

    async fn clear(&self) -> Result<(), AudioError> {
        lock(&self.shared.buffer).clear();
        lock(&self.decoder).reset();
        *lock(&self.resampler) = None;
        self.source_rate.store(0, Ordering::Release);
        log::debug!("AudioSink: cleared queued audio");
        Ok(())
    }

    async fn end_stream(&self) -> Result<(), AudioError> {
        if self.is_stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flush_resampler()?;

        let queued = self.shared.buffered();
        log::debug!("AudioSink: draining {:?} of queued audio", queued);
        // A stalled device must not hold shutdown forever.
        let limit = queued + Duration::from_secs(1);
        if tokio::time::timeout(limit, self.wait_for_drain()).await.is_err() {
            log::warn!("AudioSink: drain did not finish within {:?}", limit);
        }

        self.commands
            .send(SinkCommand::Stop)
            .map_err(|e| AudioError::StopError(e.to_string()))?;
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        let _ = self.commands.send(SinkCommand::Stop);
        if let Some(thread) = lock(&self.audio_thread).take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
    }
}

fn run_audio_thread(
    config: CpalConfig,
    shared: &Arc<SharedPlayback>,
    commands: mpsc::Receiver<SinkCommand>,
    ready: &mpsc::Sender<Result<u32, AudioError>>,
) -> Result<(), AudioError> {
    let host = cpal::default_host();
    log::debug!("AudioSink: Using audio host: {:?}", host.id());

    let device = if let Some(name) = &config.device_name {
        let mut found_device = None;
        for device in host.output_devices()? {
            let device_name = device.name()?;
            log::info!("AudioSink: available output device: {}", device_name);
            if device_name == *name {
                found_device = Some(device);
            }
        }
        found_device
            .ok_or_else(|| AudioError::DeviceError(format!("Output device '{}' not found", name)))?
    } else {
        host.default_output_device()
            .ok_or_else(|| AudioError::DeviceError("No output device found".to_string()))?
    };
    log::info!("AudioSink: Using output device: {:?}", device.name());

    let default_config = device.default_output_config()?.config();
    let mut stream_config = default_config.clone();
    let mut stream = build_stream(&device, &stream_config, shared)?;
    shared
        .output_rate
        .store(stream_config.sample_rate.0, Ordering::Release);
    let _ = ready.send(Ok(stream_config.sample_rate.0));

    while let Ok(command) = commands.recv() {
        match command {
            SinkCommand::Configure { sample_rate, reply } => {
                if stream_config.sample_rate.0 != sample_rate {
                    drop(stream);
                    let requested = cpal::StreamConfig {
                        sample_rate: cpal::SampleRate(sample_rate),
                        ..default_config.clone()
                    };
                    stream = match build_stream(&device, &requested, shared) {
                        Ok(stream) => {
                            stream_config = requested;
                            stream
                        }
                        Err(e) => {
                            log::warn!(
                                "AudioSink: device refused {}Hz ({}), staying at {}Hz",
                                sample_rate,
                                e,
                                default_config.sample_rate.0
                            );
                            stream_config = default_config.clone();
                            build_stream(&device, &stream_config, shared)?
                        }
                    };
                    shared
                        .output_rate
                        .store(stream_config.sample_rate.0, Ordering::Release);
                    log::info!("AudioSink: output reconfigured to {:?}", stream_config);
                }
                let _ = reply.send(stream_config.sample_rate.0);
            }
            SinkCommand::Stop => {
                log::debug!("AudioSink: Received stop command");
                break;
            }
        }
    }

    drop(stream);
    Ok(())
}

fn build_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    shared: &Arc<SharedPlayback>,
) -> Result<cpal::Stream, AudioError> {
    let channels = config.channels as usize;
    let callback_shared = Arc::clone(shared);

    let stream = device.build_output_stream(
        config,
        move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
            let remaining = {
                let mut buffer = lock(&callback_shared.buffer);
                buffer.fill(data, channels);
                buffer.len()
            };
            if remaining <= callback_shared.near_empty_samples() {
                callback_shared.drained.notify_waiters();
            }
        },
        |err| log::error!("AudioSink: Stream error: {}", err),
        None,
    )?;
    stream.play()?;
    Ok(stream)
}
