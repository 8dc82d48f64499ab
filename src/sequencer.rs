//! Plays concurrently issued requests back in submission order.
//!
//! Every utterance gets a global sequence id when it is submitted. Responses
//! race over the network, so fragments are buffered here until the cursor
//! reaches their id. Every dispatched fragment extends the estimated end of
//! playback, starting no earlier than the moment it was dispatched. Once the
//! cursor id is complete, the cursor moves on at that estimated end plus a short
//! gap. All state lives in a single actor task; [`Sequencer`] handles only send
//! commands to it, except for reset, which also interrupts a sink write in flight.

use crate::audio_sink::AudioSink;
use crate::protocol::{parse_audio_header, AudioHeader, PrefixHeader};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SequencerConfig {
    /// Silence inserted between consecutive utterances
    pub inter_utterance_gap: Duration,
    /// Keep dispatched fragments so finished utterances can be replayed
    pub keep_history: bool,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            inter_utterance_gap: Duration::from_millis(400),
            keep_history: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Fragment {
    prefix: PrefixHeader,
    payload: Vec<u8>,
}

enum Command {
    AddChunk { global_id: u64, fragment: Fragment },
    MarkComplete(u64),
    Reset { cursor: u64 },
    Replay(u64),
    ClearSaved,
    Cursor(oneshot::Sender<u64>),
    WhenIdle(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to the sequencer actor. Cheap to clone.
#[derive(Clone)]
pub struct Sequencer {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicU64>,
    interrupt: Arc<Mutex<CancellationToken>>,
}

impl Sequencer {
    /// Starts the actor. It stops once every handle is dropped or on [`Sequencer::shutdown`].
    pub fn spawn(sink: Arc<dyn AudioSink>, config: SequencerConfig) -> (Self, JoinHandle<()>) {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let next_id = Arc::new(AtomicU64::new(0));
        let interrupt = Arc::new(Mutex::new(CancellationToken::new()));
        let actor = SequencerActor::new(
            sink,
            config,
            Arc::clone(&next_id),
            Arc::clone(&interrupt),
        );
        let task = tokio::spawn(actor.run(command_rx));
        (
            Self {
                commands,
                next_id,
                interrupt,
            },
            task,
        )
    }

    /// Reserves the next global sequence id. Ids are never reused.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn add_chunk(&self, prefix: PrefixHeader, payload: Vec<u8>, global_id: u64) {
        self.send(Command::AddChunk {
            global_id,
            fragment: Fragment { prefix, payload },
        });
    }

    /// No further fragments will arrive for `global_id`.
    pub fn mark_complete(&self, global_id: u64) {
        self.send(Command::MarkComplete(global_id));
    }

    /// Drops everything buffered and clears the sink. Ids allocated so far become
    /// stale; the cursor moves to the next unallocated id. A sink write in progress
    /// is abandoned rather than waited for.
    pub fn reset(&self) {
        let cursor = self.next_id.load(Ordering::Relaxed);
        lock(&self.interrupt).cancel();
        self.send(Command::Reset { cursor });
    }

    /// Plays the saved fragments of a finished utterance again.
    pub fn replay(&self, global_id: u64) {
        self.send(Command::Replay(global_id));
    }

    pub fn clear_saved(&self) {
        self.send(Command::ClearSaved);
    }

    /// Id currently allowed to play. Resolves after all earlier commands were handled.
    pub async fn cursor(&self) -> Option<u64> {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Cursor(reply));
        reply_rx.await.ok()
    }

    /// Resolves once every allocated id has been played out and its gap has passed.
    pub async fn idle(&self) {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::WhenIdle(reply));
        let _ = reply_rx.await;
    }

    /// Stops the actor after the commands queued before this call.
    pub async fn shutdown(&self) {
        let (reply, reply_rx) = oneshot::channel();
        self.send(Command::Shutdown(reply));
        let _ = reply_rx.await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            log::debug!("Sequencer: actor stopped, dropping command");
        }
    }
}

/// Playback bookkeeping for the id under the cursor.
#[derive(Debug, Default)]
struct Playback {
    /// Estimated moment the sink finishes playing what was dispatched so far
    end: Option<Instant>,
    seconds: f64,
    headers: HashMap<u32, AudioHeader>,
}

impl Playback {
    /// A fragment starts playing when the previous one ends, or on dispatch if
    /// the sink has already run dry.
    fn record(&mut self, fragment: &Fragment) {
        let seconds = self.fragment_seconds(fragment);
        let now = Instant::now();
        let start = self.end.map_or(now, |end| end.max(now));
        self.end = Some(start + Duration::from_secs_f64(seconds));
        self.seconds += seconds;
    }

    fn fragment_seconds(&mut self, fragment: &Fragment) -> f64 {
        let prefix = &fragment.prefix;
        if prefix.is_first_of_part() {
            match parse_audio_header(&fragment.payload) {
                Ok(header) => {
                    self.headers.insert(prefix.part_id, header);
                    let body = fragment.payload.len().saturating_sub(header.data_offset);
                    header.duration_secs(body)
                }
                Err(e) => {
                    log::debug!("Sequencer: no duration for part {}: {}", prefix.part_id, e);
                    0.0
                }
            }
        } else {
            self.headers
                .get(&prefix.part_id)
                .map_or(0.0, |header| header.duration_secs(fragment.payload.len()))
        }
    }

    fn deadline(&self, gap: Duration) -> Option<Instant> {
        self.end.map(|end| end + gap)
    }
}

struct SequencerActor {
    sink: Arc<dyn AudioSink>,
    config: SequencerConfig,
    cursor: u64,
    pending: BTreeMap<(u64, u32, u32), Fragment>,
    completed: HashSet<u64>,
    playback: Playback,
    gate: Option<Instant>,
    saved: HashMap<u64, Vec<Fragment>>,
    allocated: Arc<AtomicU64>,
    interrupt: Arc<Mutex<CancellationToken>>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl SequencerActor {
    fn new(
        sink: Arc<dyn AudioSink>,
        config: SequencerConfig,
        allocated: Arc<AtomicU64>,
        interrupt: Arc<Mutex<CancellationToken>>,
    ) -> Self {
        Self {
            sink,
            config,
            cursor: 0,
            pending: BTreeMap::new(),
            completed: HashSet::new(),
            playback: Playback::default(),
            gate: None,
            saved: HashMap::new(),
            allocated,
            interrupt,
            idle_waiters: Vec::new(),
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        loop {
            let gate = self.gate;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(reply)) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => break,
                },
                _ = sleep_until(gate.unwrap_or_else(Instant::now)), if gate.is_some() => {
                    self.gate = None;
                    self.advance();
                }
            }
            self.drain().await;
            if self.is_idle() {
                for waiter in self.idle_waiters.drain(..) {
                    let _ = waiter.send(());
                }
            }
        }
        log::debug!("Sequencer: stopped at id {}", self.cursor);
    }

    async fn handle(&mut self, command: Command) {
        match command {
            Command::AddChunk {
                global_id,
                fragment,
            } => {
                if global_id < self.cursor {
                    log::debug!("Sequencer: dropping late fragment for stale id {}", global_id);
                    return;
                }
                let (part, chunk) = fragment.prefix.key();
                self.pending.insert((global_id, part, chunk), fragment);
            }
            Command::MarkComplete(global_id) => {
                if global_id >= self.cursor {
                    self.completed.insert(global_id);
                }
            }
            Command::Reset { cursor } => {
                log::info!(
                    "Sequencer: reset, dropping {} buffered fragments, cursor {} -> {}",
                    self.pending.len(),
                    self.cursor,
                    cursor.max(self.cursor)
                );
                *lock(&self.interrupt) = CancellationToken::new();
                self.pending.clear();
                self.completed.clear();
                self.playback = Playback::default();
                self.gate = None;
                self.cursor = cursor.max(self.cursor);
                if let Err(e) = self.sink.clear().await {
                    log::warn!("Sequencer: failed to clear sink: {}", e);
                }
            }
            Command::Replay(global_id) => {
                let Some(fragments) = self.saved.get(&global_id) else {
                    log::debug!("Sequencer: nothing saved for id {}", global_id);
                    return;
                };
                log::info!("Sequencer: replaying id {} ({} fragments)", global_id, fragments.len());
                for fragment in fragments {
                    if !self.write(global_id, fragment).await {
                        return;
                    }
                }
                self.finish_utterance(global_id).await;
            }
            Command::ClearSaved => self.saved.clear(),
            Command::Cursor(reply) => {
                let _ = reply.send(self.cursor);
            }
            Command::WhenIdle(reply) => self.idle_waiters.push(reply),
            Command::Shutdown(_) => {}
        }
    }

    async fn drain(&mut self) {
        loop {
            let cursor = self.cursor;
            while let Some(entry) = self.pending.first_entry() {
                if entry.key().0 != cursor {
                    break;
                }
                let fragment = entry.remove();
                if !self.dispatch(cursor, fragment).await {
                    return;
                }
            }

            if self.gate.is_some() || !self.completed.contains(&cursor) {
                return;
            }

            if self.playback.end.is_some() {
                self.finish_utterance(cursor).await;
            }

            match self.playback.deadline(self.config.inter_utterance_gap) {
                Some(deadline) if deadline > Instant::now() => {
                    log::debug!(
                        "Sequencer: id {} plays for {:.2}s, holding cursor",
                        cursor,
                        self.playback.seconds
                    );
                    self.gate = Some(deadline);
                    return;
                }
                _ => self.advance(),
            }
        }
    }

    /// Returns false when a reset interrupted the write.
    async fn dispatch(&mut self, global_id: u64, fragment: Fragment) -> bool {
        self.playback.record(&fragment);
        if !self.write(global_id, &fragment).await {
            return false;
        }
        if self.config.keep_history {
            self.saved.entry(global_id).or_default().push(fragment);
        }
        true
    }

    /// Writes one fragment unless a reset is pending. Returns false if it was
    /// skipped or abandoned because of a reset.
    async fn write(&self, global_id: u64, fragment: &Fragment) -> bool {
        let interrupt = lock(&self.interrupt).clone();
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => {
                log::debug!("Sequencer: reset pending, abandoning write for id {}", global_id);
                false
            }
            result = self.sink.write_fragment(&fragment.prefix, &fragment.payload) => {
                if let Err(e) = result {
                    log::warn!("Sequencer: sink write failed for id {}: {}", global_id, e);
                }
                true
            }
        }
    }

    async fn finish_utterance(&self, global_id: u64) {
        if let Err(e) = self.sink.finish_utterance().await {
            log::warn!("Sequencer: failed to finish id {}: {}", global_id, e);
        }
    }

    fn is_idle(&self) -> bool {
        self.gate.is_none()
            && self.pending.is_empty()
            && self.cursor >= self.allocated.load(Ordering::Relaxed)
    }

    fn advance(&mut self) {
        self.completed.remove(&self.cursor);
        self.cursor += 1;
        self.playback = Playback::default();
        log::debug!("Sequencer: cursor advanced to {}", self.cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_sink::AudioError;
    use crate::protocol::WAV_HEADER_LEN;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Write { request_id: u64, part: u32, at: Instant },
        Finish,
        Clear,
    }

    struct RecordingSink {
        events: mpsc::UnboundedSender<SinkEvent>,
        write_delay: Duration,
    }

    #[async_trait::async_trait]
    impl AudioSink for RecordingSink {
        async fn write_fragment(&self, prefix: &PrefixHeader, _payload: &[u8]) -> Result<(), AudioError> {
            let _ = self.events.send(SinkEvent::Write {
                request_id: prefix.request_id,
                part: prefix.part_id,
                at: Instant::now(),
            });
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            Ok(())
        }

        async fn finish_utterance(&self) -> Result<(), AudioError> {
            let _ = self.events.send(SinkEvent::Finish);
            Ok(())
        }

        async fn clear(&self) -> Result<(), AudioError> {
            let _ = self.events.send(SinkEvent::Clear);
            Ok(())
        }

        async fn end_stream(&self) -> Result<(), AudioError> {
            Ok(())
        }
    }

    fn spawn_recording(config: SequencerConfig) -> (Sequencer, mpsc::UnboundedReceiver<SinkEvent>) {
        spawn_with_write_delay(config, Duration::ZERO)
    }

    fn spawn_with_write_delay(
        config: SequencerConfig,
        write_delay: Duration,
    ) -> (Sequencer, mpsc::UnboundedReceiver<SinkEvent>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let (events, rx) = mpsc::unbounded_channel();
        let sink = RecordingSink {
            events,
            write_delay,
        };
        let (sequencer, _task) = Sequencer::spawn(Arc::new(sink), config);
        (sequencer, rx)
    }

    /// 16-bit mono WAV fragment lasting `millis` at 1 kHz.
    fn wav(millis: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(WAV_HEADER_LEN + millis * 2);
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(b"WAVEfmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1000u32.to_le_bytes());
        bytes.extend_from_slice(&2000u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&((millis * 2) as u32).to_le_bytes());
        bytes.resize(WAV_HEADER_LEN + millis * 2, 0);
        bytes
    }

    async fn next_write(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> (u64, u32, Instant) {
        loop {
            match rx.recv().await.expect("sink closed") {
                SinkEvent::Write { request_id, part, at } => return (request_id, part, at),
                SinkEvent::Finish | SinkEvent::Clear => continue,
            }
        }
    }

    fn queued_writes(rx: &mut mpsc::UnboundedReceiver<SinkEvent>) -> usize {
        let mut writes = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, SinkEvent::Write { .. }) {
                writes += 1;
            }
        }
        writes
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_request_waits_for_earlier_playback() {
        let gap = Duration::from_millis(400);
        let (sequencer, mut rx) = spawn_recording(SequencerConfig {
            inter_utterance_gap: gap,
            keep_history: false,
        });
        let first = sequencer.allocate_id();
        let second = sequencer.allocate_id();

        // The second request's audio arrives and completes before the first's.
        sequencer.add_chunk(PrefixHeader::new(2, 0, None), wav(300), second);
        sequencer.mark_complete(second);
        assert_eq!(sequencer.cursor().await, Some(first));
        assert!(rx.try_recv().is_err());

        sequencer.add_chunk(PrefixHeader::new(1, 0, Some(0)), wav(500), first);
        sequencer.add_chunk(PrefixHeader::new(1, 0, Some(1)), vec![0; 1000], first);
        sequencer.mark_complete(first);

        let (id_a, _, started) = next_write(&mut rx).await;
        let (id_b, _, _) = next_write(&mut rx).await;
        let (id_c, _, second_at) = next_write(&mut rx).await;
        assert_eq!((id_a, id_b, id_c), (1, 1, 2));

        // 500 ms header fragment + 500 ms raw chunk + gap
        assert!(second_at - started >= Duration::from_millis(1000) + gap);
        assert_eq!(sequencer.cursor().await, Some(second));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parts_are_dispatched_in_order() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig::default());
        let current = sequencer.allocate_id();
        let queued = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(4, 2, None), wav(10), queued);
        sequencer.add_chunk(PrefixHeader::new(4, 0, None), wav(10), queued);
        sequencer.add_chunk(PrefixHeader::new(4, 1, None), wav(10), queued);
        sequencer.mark_complete(current);

        let mut parts = Vec::new();
        for _ in 0..3 {
            parts.push(next_write(&mut rx).await.1);
        }
        assert_eq!(parts, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_request_without_audio_advances_immediately() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig::default());
        let failed = sequencer.allocate_id();
        let next = sequencer.allocate_id();

        sequencer.add_chunk(PrefixHeader::new(8, 0, None), wav(100), next);
        let before = Instant::now();
        sequencer.mark_complete(failed);

        let (request_id, _, at) = next_write(&mut rx).await;
        assert_eq!(request_id, 8);
        assert_eq!(at, before);
        assert_eq!(sequencer.cursor().await, Some(next));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_fragments_for_passed_ids_are_dropped() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig::default());
        let id = sequencer.allocate_id();
        sequencer.mark_complete(id);
        assert_eq!(sequencer.cursor().await, Some(id + 1));

        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(10), id);
        assert_eq!(sequencer.cursor().await, Some(id + 1));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_behaves_like_fresh_sequencer() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig::default());
        let stale_a = sequencer.allocate_id();
        let stale_b = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(50), stale_b);
        sequencer.mark_complete(stale_b);

        sequencer.reset();
        sequencer.reset();
        assert_eq!(rx.recv().await, Some(SinkEvent::Clear));
        assert_eq!(rx.recv().await, Some(SinkEvent::Clear));

        // Stale ids no longer block or leak audio.
        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(50), stale_a);
        let fresh = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(3, 0, None), wav(50), fresh);
        sequencer.mark_complete(fresh);

        let (request_id, _, _) = next_write(&mut rx).await;
        assert_eq!(request_id, 3);
        assert!(sequencer.cursor().await.unwrap() >= fresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_and_clear_saved() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig {
            inter_utterance_gap: Duration::from_millis(10),
            keep_history: true,
        });
        let id = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(6, 0, None), wav(20), id);
        sequencer.mark_complete(id);
        assert_eq!(next_write(&mut rx).await.0, 6);

        sequencer.replay(id);
        assert_eq!(next_write(&mut rx).await.0, 6);

        sequencer.clear_saved();
        sequencer.replay(id);
        sequencer.cursor().await;
        assert_eq!(queued_writes(&mut rx), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gap_follows_late_final_fragment() {
        let gap = Duration::from_millis(400);
        let (sequencer, mut rx) = spawn_recording(SequencerConfig {
            inter_utterance_gap: gap,
            keep_history: false,
        });
        let first = sequencer.allocate_id();
        let second = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(2, 0, None), wav(100), second);
        sequencer.mark_complete(second);

        sequencer.add_chunk(PrefixHeader::new(1, 0, Some(0)), wav(100), first);
        assert_eq!(next_write(&mut rx).await.0, 1);

        // The rest of the utterance arrives long after the first chunk played out.
        tokio::time::sleep(Duration::from_secs(2)).await;
        sequencer.add_chunk(PrefixHeader::new(1, 0, Some(1)), vec![0; 200], first);
        sequencer.mark_complete(first);

        let (request_id, _, last_at) = next_write(&mut rx).await;
        assert_eq!(request_id, 1);
        let (request_id, _, second_at) = next_write(&mut rx).await;
        assert_eq!(request_id, 2);
        // 100 ms for the late chunk, then the gap
        assert!(second_at - last_at >= Duration::from_millis(100) + gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_utterance_is_finished_before_next_starts() {
        let (sequencer, mut rx) = spawn_recording(SequencerConfig {
            inter_utterance_gap: Duration::from_millis(10),
            keep_history: false,
        });
        let first = sequencer.allocate_id();
        let second = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(20), first);
        sequencer.add_chunk(PrefixHeader::new(2, 0, None), wav(20), second);
        sequencer.mark_complete(first);
        sequencer.mark_complete(second);

        let mut order = Vec::new();
        while order.len() < 4 {
            match rx.recv().await.expect("sink closed") {
                SinkEvent::Write { request_id, .. } => order.push(format!("write {}", request_id)),
                SinkEvent::Finish => order.push("finish".to_string()),
                SinkEvent::Clear => {}
            }
        }
        assert_eq!(order, vec!["write 1", "finish", "write 2", "finish"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_interrupts_slow_sink_write() {
        let (sequencer, mut rx) =
            spawn_with_write_delay(SequencerConfig::default(), Duration::from_secs(5));
        let id = sequencer.allocate_id();
        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(50), id);
        let (_, _, started) = next_write(&mut rx).await;

        sequencer.reset();
        assert_eq!(rx.recv().await, Some(SinkEvent::Clear));
        assert!(Instant::now() - started < Duration::from_secs(1));
        assert_eq!(sequencer.cursor().await, Some(id + 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_waits_for_gap_after_last_utterance() {
        let gap = Duration::from_millis(200);
        let (sequencer, _rx) = spawn_recording(SequencerConfig {
            inter_utterance_gap: gap,
            keep_history: false,
        });
        sequencer.idle().await;

        let id = sequencer.allocate_id();
        let start = Instant::now();
        sequencer.add_chunk(PrefixHeader::new(1, 0, None), wav(300), id);
        sequencer.mark_complete(id);
        sequencer.idle().await;
        assert!(Instant::now() - start >= Duration::from_millis(300) + gap);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_actor() {
        let (sequencer, _rx) = spawn_recording(SequencerConfig::default());
        sequencer.shutdown().await;
        assert_eq!(sequencer.cursor().await, None);
    }
}
