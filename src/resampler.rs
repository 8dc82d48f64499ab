use crate::audio_sink::AudioError;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};

const CHUNK_SIZE: usize = 1024;

/// Mono resampler used when the output device cannot run at a part's sample rate.
pub struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    buffer: Vec<f32>,
}

impl StreamResampler {
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Self, AudioError> {
        let ratio = output_rate as f64 / input_rate as f64;
        let params = SincInterpolationParameters {
            sinc_len: 32,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };

        let resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, CHUNK_SIZE, 1)
            .map_err(|e| AudioError::WriteError(format!("Failed to create resampler: {}", e)))?;

        log::info!(
            "AudioSink: resampling {}Hz -> {}Hz (ratio {:.3})",
            input_rate,
            output_rate,
            ratio
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            buffer: Vec::new(),
        })
    }

    pub fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Resamples whole chunks; a partial chunk stays buffered until more input or `flush`.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>, AudioError> {
        self.buffer.extend_from_slice(input);

        let mut output = Vec::new();
        while self.buffer.len() >= CHUNK_SIZE {
            let chunk: Vec<f32> = self.buffer.drain(..CHUNK_SIZE).collect();
            let resampled = self
                .resampler
                .process(&[chunk], None)
                .map_err(|e| AudioError::WriteError(format!("Resampling failed: {}", e)))?;
            output.extend_from_slice(&resampled[0]);
        }
        Ok(output)
    }

    /// Pads the buffered remainder with silence and returns its resampled length.
    pub fn flush(&mut self) -> Result<Vec<f32>, AudioError> {
        if self.buffer.is_empty() {
            return Ok(Vec::new());
        }

        let remaining = self.buffer.len();
        let expected =
            (remaining as f64 * self.output_rate as f64 / self.input_rate as f64).ceil() as usize;
        self.buffer.resize(CHUNK_SIZE, 0.0);

        let mut output = self.process(&[])?;
        output.truncate(expected);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsampling_length() {
        let mut resampler = StreamResampler::new(16000, 48000).unwrap();
        let input = vec![0.1f32; CHUNK_SIZE * 4];

        let mut output = resampler.process(&input).unwrap();
        output.extend(resampler.flush().unwrap());

        let expected = input.len() * 3;
        let tolerance = CHUNK_SIZE * 3;
        assert!(
            output.len().abs_diff(expected) <= tolerance,
            "got {} samples, expected about {}",
            output.len(),
            expected
        );
    }

    #[test]
    fn test_partial_chunk_waits_for_flush() {
        let mut resampler = StreamResampler::new(24000, 48000).unwrap();
        assert!(resampler.process(&[0.0; 100]).unwrap().is_empty());
        assert_eq!(resampler.flush().unwrap().len(), 200);
        assert!(resampler.flush().unwrap().is_empty());
    }

    #[test]
    fn test_flush_releases_utterance_tail() {
        let mut resampler = StreamResampler::new(24000, 48000).unwrap();
        let head = resampler.process(&[0.5; 1500]).unwrap();
        assert!(!head.is_empty());

        // 476 samples were still held back after the whole chunk.
        let tail = resampler.flush().unwrap();
        assert_eq!(tail.len(), 952);

        // The next utterance starts from an empty buffer.
        assert!(resampler.process(&[0.5; 100]).unwrap().is_empty());
        assert_eq!(resampler.flush().unwrap().len(), 200);
    }
}
