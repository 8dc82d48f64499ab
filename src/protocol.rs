use crate::error::{Result, SpeakError};
use dasp_sample::{Sample, I24};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Invalid audio container: {0}")]
    InvalidAudioContainer(String),
}

/// Size of the little-endian header length that starts every binary frame.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Offset of the sample data in a canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Command verb used for speech generation requests.
pub const GENERATE_COMMAND: &str = "generate";

/// Status values that end a request's status channel.
pub const TERMINAL_STATUSES: [&str; 4] = ["ready", "error", "timeout", "done"];

fn default_on_null<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// JSON header carried in front of every binary audio payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrefixHeader {
    pub request_id: u64,
    #[serde(default, deserialize_with = "default_on_null")]
    pub part_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_id: Option<u32>,
}

impl PrefixHeader {
    pub fn new(request_id: u64, part_id: u32, chunk_id: Option<u32>) -> Self {
        Self {
            request_id,
            part_id,
            chunk_id,
        }
    }

    /// Ordering key within a request. An unchunked part sorts as chunk 0.
    pub fn key(&self) -> (u32, u32) {
        (self.part_id, self.chunk_id.unwrap_or(0))
    }

    /// The first fragment of a part carries the part's audio container header.
    pub fn is_first_of_part(&self) -> bool {
        matches!(self.chunk_id, None | Some(0))
    }
}

/// Decoded binary frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub prefix: PrefixHeader,
    pub payload: Vec<u8>,
}

impl AudioFrame {
    pub fn new(prefix: PrefixHeader, payload: Vec<u8>) -> Self {
        Self { prefix, payload }
    }

    /// Zero-length payload without a chunk id ends the request's binary channel.
    pub fn is_end_of_stream(&self) -> bool {
        self.payload.is_empty() && self.prefix.chunk_id.is_none()
    }

    /// Zero-length payload with a chunk id closes its part; the marker's chunk id
    /// is one past the part's last chunk.
    pub fn is_part_end(&self) -> bool {
        self.payload.is_empty() && self.prefix.chunk_id.is_some()
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, ProtocolError> {
        encode_binary_frame(&self.prefix, &self.payload)
    }
}

/// Status update for a request, received as a UTF-8 JSON frame.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusFrame {
    pub request_id: u64,
    pub status: Option<String>,
    pub data: Value,
}

impl StatusFrame {
    pub fn is_terminal(&self) -> bool {
        self.status
            .as_deref()
            .is_some_and(|status| TERMINAL_STATUSES.contains(&status))
    }

    /// Terminal failure statuses; no further audio will follow these.
    pub fn is_failure(&self) -> bool {
        matches!(self.status.as_deref(), Some("error") | Some("timeout"))
    }

    /// Converts a failure status into [`SpeakError::Remote`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_failure() {
            return Err(SpeakError::Remote {
                request_id: self.request_id,
                status: self.status.unwrap_or_default(),
            });
        }
        Ok(self)
    }
}

/// Inbound frame, validated on decode.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(StatusFrame),
    Audio(AudioFrame),
}

impl Frame {
    pub fn from_text(text: &str) -> std::result::Result<Self, ProtocolError> {
        decode_text_frame(text).map(Frame::Status)
    }

    pub fn from_binary(bytes: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let (prefix, payload) = decode_binary_frame(bytes)?;
        Ok(Frame::Audio(AudioFrame::new(prefix, payload.to_vec())))
    }

    pub fn request_id(&self) -> u64 {
        match self {
            Frame::Status(status) => status.request_id,
            Frame::Audio(audio) => audio.prefix.request_id,
        }
    }
}

/// Serializes `[u32 LE header length][JSON header][payload]`.
pub fn encode_binary_frame(
    prefix: &PrefixHeader,
    payload: &[u8],
) -> std::result::Result<Vec<u8>, ProtocolError> {
    let header = serde_json::to_vec(prefix)
        .map_err(|e| ProtocolError::MalformedFrame(format!("unencodable prefix: {}", e)))?;
    let header_len = u32::try_from(header.len())
        .map_err(|_| ProtocolError::MalformedFrame("prefix header too large".to_string()))?;

    let mut bytes = Vec::with_capacity(LENGTH_FIELD_SIZE + header.len() + payload.len());
    bytes.extend_from_slice(&header_len.to_le_bytes());
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Splits a binary frame into its prefix header and payload.
pub fn decode_binary_frame(bytes: &[u8]) -> std::result::Result<(PrefixHeader, &[u8]), ProtocolError> {
    if bytes.len() < LENGTH_FIELD_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "frame of {} bytes is shorter than its length field",
            bytes.len()
        )));
    }

    let mut len_bytes = [0u8; LENGTH_FIELD_SIZE];
    len_bytes.copy_from_slice(&bytes[..LENGTH_FIELD_SIZE]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_end = LENGTH_FIELD_SIZE
        .checked_add(header_len)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            ProtocolError::MalformedFrame(format!(
                "declared header length {} exceeds frame size {}",
                header_len,
                bytes.len()
            ))
        })?;

    let prefix: PrefixHeader = serde_json::from_slice(&bytes[LENGTH_FIELD_SIZE..header_end])
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid prefix header: {}", e)))?;

    Ok((prefix, &bytes[header_end..]))
}

/// Parses a status frame. The status lives in `data.status` or at the top level.
pub fn decode_text_frame(text: &str) -> std::result::Result<StatusFrame, ProtocolError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| ProtocolError::MalformedFrame(format!("invalid status JSON: {}", e)))?;

    let request_id = value
        .get("request_id")
        .and_then(Value::as_u64)
        .ok_or_else(|| {
            ProtocolError::MalformedFrame("status frame without integer request_id".to_string())
        })?;

    let status = value
        .pointer("/data/status")
        .and_then(Value::as_str)
        .or_else(|| value.get("status").and_then(Value::as_str))
        .map(str::to_string);

    let data = value.get("data").cloned().unwrap_or(Value::Null);

    Ok(StatusFrame {
        request_id,
        status,
        data,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StreamMode {
    /// Parts are split into chunks as soon as audio is available.
    #[default]
    Chunks,
    /// Each part arrives as one whole fragment.
    Parts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub mode: StreamMode,
}

/// Outbound command sent over the socket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundRequest {
    pub command: String,
    pub request_id: u64,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamOptions>,
}

impl OutboundRequest {
    pub fn generate(
        request_id: u64,
        text: &str,
        voice_id: Option<&str>,
        mode: Option<StreamMode>,
    ) -> Self {
        let mut data = json!({ "text": text });
        if let Some(voice_id) = voice_id {
            data["voice_id"] = Value::String(voice_id.to_string());
        }

        Self {
            command: GENERATE_COMMAND.to_string(),
            request_id,
            data,
            stream: mode.map(|mode| StreamOptions { mode }),
        }
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Int,
    Float,
}

/// Format of one part's audio, read from the WAV header in its first fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    pub encoding: SampleEncoding,
    /// Number of header bytes preceding the samples.
    pub data_offset: usize,
}

impl AudioHeader {
    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    /// Playback length of `byte_len` bytes of raw samples in this format.
    pub fn duration_secs(&self, byte_len: usize) -> f64 {
        let frame = self.bytes_per_frame();
        if frame == 0 || self.sample_rate == 0 {
            return 0.0;
        }
        (byte_len / frame) as f64 / self.sample_rate as f64
    }

    /// Interleaved samples in this header's encoding.
    pub fn decode_samples(&self, pcm: &[u8]) -> Vec<f32> {
        match (self.encoding, self.bits_per_sample) {
            (SampleEncoding::Int, 32) => pcm
                .chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]).to_sample::<f32>())
                .collect(),
            (SampleEncoding::Float, 32) => pcm_to_samples(pcm, 32),
            (SampleEncoding::Float, bits) => {
                log::warn!("Unsupported float sample depth: {} bits", bits);
                Vec::new()
            }
            (SampleEncoding::Int, bits) => pcm_to_samples(pcm, bits),
        }
    }
}

fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

/// Validates the RIFF/WAVE signature and reads the fmt block at its fixed offsets.
pub fn parse_audio_header(payload: &[u8]) -> std::result::Result<AudioHeader, ProtocolError> {
    if payload.len() < 36 {
        return Err(ProtocolError::InvalidAudioContainer(format!(
            "{} bytes is too short for a WAV header",
            payload.len()
        )));
    }
    if &payload[0..4] != b"RIFF" || &payload[8..12] != b"WAVE" || &payload[12..16] != b"fmt " {
        return Err(ProtocolError::InvalidAudioContainer(
            "missing RIFF/WAVE signature".to_string(),
        ));
    }

    let format_tag = read_u16(payload, 20);
    let channels = read_u16(payload, 22);
    let sample_rate = read_u32(payload, 24);
    let bits_per_sample = read_u16(payload, 34);

    if channels == 0 || sample_rate == 0 || bits_per_sample == 0 {
        return Err(ProtocolError::InvalidAudioContainer(format!(
            "degenerate format: {} Hz, {} channels, {} bits",
            sample_rate, channels, bits_per_sample
        )));
    }

    let encoding = if format_tag == 3 {
        SampleEncoding::Float
    } else {
        SampleEncoding::Int
    };

    Ok(AudioHeader {
        sample_rate,
        channels,
        bits_per_sample,
        encoding,
        data_offset: find_data_offset(payload),
    })
}

/// Walks the RIFF sub-chunks after the WAVE tag to find where samples begin.
fn find_data_offset(payload: &[u8]) -> usize {
    let mut pos = 12;
    while pos + 8 <= payload.len() {
        let size = read_u32(payload, pos + 4) as usize;
        if &payload[pos..pos + 4] == b"data" {
            return pos + 8;
        }
        pos = match pos.checked_add(8 + size + (size & 1)) {
            Some(next) => next,
            None => break,
        };
    }
    WAV_HEADER_LEN.min(payload.len())
}

/// Converts little-endian PCM into normalized samples. Supported depths are
/// 8-bit unsigned, 16 and 24-bit signed integer, and 32-bit float.
pub fn pcm_to_samples(payload: &[u8], bits_per_sample: u16) -> Vec<f32> {
    match bits_per_sample {
        8 => payload.iter().map(|&b| b.to_sample::<f32>()).collect(),
        16 => payload
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]).to_sample::<f32>())
            .collect(),
        24 => payload
            .chunks_exact(3)
            .map(|b| {
                let raw = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                I24::new_unchecked(raw).to_sample::<f32>()
            })
            .collect(),
        32 => payload
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        other => {
            log::warn!("Unsupported PCM bit depth: {}", other);
            Vec::new()
        }
    }
}
