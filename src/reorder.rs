use crate::protocol::{AudioFrame, PrefixHeader};
use std::collections::BTreeMap;

/// How the end of a chunked part is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum PartBoundary {
    /// A chunked part ends at its zero-length part-end marker.
    #[default]
    Marker,
    /// The first chunk of the next part also ends the current part. Chunks of
    /// the earlier part that arrive after it are dropped.
    NextPart,
}

/// Position of the last fragment handed to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Start,
    InPart { part: u32, next_chunk: u32 },
    PartDone { part: u32 },
}

/// Per-request buffer that releases audio fragments in `(part_id, chunk_id)` order.
///
/// A fragment is released only once it is known to be the next one: the following
/// chunk of the current part, or the first fragment of the next part once the current
/// part is done. An unchunked part is done after its single fragment; a chunked part
/// is done when its part-end marker is reached. The end-of-stream sentinel releases
/// everything still pending in key order. With [`PartBoundary::NextPart`] the
/// first chunk of the next part also closes the current one.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<(u32, u32), AudioFrame>,
    position: Position,
    finished: bool,
    boundary: PartBoundary,
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::with_boundary(PartBoundary::default())
    }

    pub fn with_boundary(boundary: PartBoundary) -> Self {
        Self {
            pending: BTreeMap::new(),
            position: Position::Start,
            finished: false,
            boundary,
        }
    }

    /// Accepts one fragment and returns the fragments that became deliverable.
    pub fn push(&mut self, frame: AudioFrame) -> Vec<AudioFrame> {
        if self.finished {
            log::debug!(
                "Reorder: request {} already finished, dropping fragment {:?}",
                frame.prefix.request_id,
                frame.prefix.key()
            );
            return Vec::new();
        }

        if frame.is_end_of_stream() {
            return self.finish();
        }

        let key = frame.prefix.key();
        if self.is_behind(key) || self.pending.contains_key(&key) {
            log::warn!(
                "Reorder: duplicate fragment {:?} for request {}",
                key,
                frame.prefix.request_id
            );
            return Vec::new();
        }

        self.pending.insert(key, frame);
        self.release()
    }

    /// Marks the binary channel complete and flushes whatever is still pending.
    pub fn finish(&mut self) -> Vec<AudioFrame> {
        self.finished = true;
        std::mem::take(&mut self.pending)
            .into_values()
            .filter(|frame| !frame.is_part_end())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn release(&mut self) -> Vec<AudioFrame> {
        let mut ready = Vec::new();
        loop {
            let position = self.position;
            let Some(entry) = self.pending.first_entry() else {
                break;
            };
            if !follows(position, &entry.get().prefix, self.boundary) {
                break;
            }
            let frame = entry.remove();
            self.advance(&frame);
            if !frame.is_part_end() {
                ready.push(frame);
            }
        }
        ready
    }

    fn advance(&mut self, frame: &AudioFrame) {
        let part = frame.prefix.part_id;
        self.position = match frame.prefix.chunk_id {
            None => Position::PartDone { part },
            Some(_) if frame.is_part_end() => Position::PartDone { part },
            Some(chunk) => Position::InPart {
                part,
                next_chunk: chunk + 1,
            },
        };
    }

    fn is_behind(&self, key: (u32, u32)) -> bool {
        match self.position {
            Position::Start => false,
            Position::InPart { part, next_chunk } => key < (part, next_chunk),
            Position::PartDone { part } => key.0 <= part,
        }
    }
}

fn follows(position: Position, prefix: &PrefixHeader, boundary: PartBoundary) -> bool {
    match position {
        Position::Start => prefix.part_id == 0 && prefix.is_first_of_part(),
        Position::InPart { part, next_chunk } => {
            (prefix.part_id == part && prefix.chunk_id == Some(next_chunk))
                || (boundary == PartBoundary::NextPart
                    && prefix.part_id == part + 1
                    && prefix.is_first_of_part())
        }
        Position::PartDone { part } => prefix.part_id == part + 1 && prefix.is_first_of_part(),
    }
}
