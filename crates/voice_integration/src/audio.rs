use std::{
    fs::File,
    io::{BufReader, ErrorKind},
    path::Path,
    time::Duration,
};

use shared::error::AudioError;

pub const DEFAULT_FRAME_DURATION: Duration = Duration::from_millis(10);

/// Interleaved 16-bit PCM covering one frame interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFrame {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let per_channel = self.samples.len() as u64 / u64::from(self.channels);
        Duration::from_micros(per_channel * 1_000_000 / u64::from(self.sample_rate))
    }
}

/// Lazy and finite; reopen the source to play it again.
pub type DecodedFrameStream = Box<dyn Iterator<Item = Result<PcmFrame, AudioError>> + Send>;

pub trait AudioSourceOpener: Send + Sync {
    fn open_source(&self, source: &Path) -> Result<DecodedFrameStream, AudioError>;
}

#[derive(Debug, Clone)]
pub struct WavSourceOpener {
    frame_duration: Duration,
}

impl WavSourceOpener {
    pub fn new(frame_duration: Duration) -> Self {
        Self { frame_duration }
    }
}

impl Default for WavSourceOpener {
    fn default() -> Self {
        Self::new(DEFAULT_FRAME_DURATION)
    }
}

impl AudioSourceOpener for WavSourceOpener {
    fn open_source(&self, source: &Path) -> Result<DecodedFrameStream, AudioError> {
        let file = File::open(source).map_err(|err| match err.kind() {
            ErrorKind::NotFound => AudioError::SourceNotFound(source.display().to_string()),
            _ => AudioError::DecodeFailed(format!(
                "failed to open {}: {err}",
                source.display()
            )),
        })?;
        let reader = hound::WavReader::new(BufReader::new(file)).map_err(|err| {
            AudioError::DecodeFailed(format!("{}: {err}", source.display()))
        })?;

        let spec = reader.spec();
        if spec.channels == 0 || spec.sample_rate == 0 {
            return Err(AudioError::DecodeFailed(format!(
                "{}: unsupported wav layout",
                source.display()
            )));
        }

        let samples: Box<dyn Iterator<Item = hound::Result<i16>> + Send> = match spec.sample_format
        {
            hound::SampleFormat::Float => Box::new(
                reader
                    .into_samples::<f32>()
                    .map(|sample| sample.map(float_to_i16)),
            ),
            hound::SampleFormat::Int => {
                let bits = spec.bits_per_sample;
                Box::new(
                    reader
                        .into_samples::<i32>()
                        .map(move |sample| sample.map(|value| int_to_i16(value, bits))),
                )
            }
        };

        let per_channel =
            (u128::from(spec.sample_rate) * self.frame_duration.as_micros() / 1_000_000).max(1);
        let frame_len = per_channel as usize * usize::from(spec.channels);

        Ok(Box::new(WavFrames {
            samples,
            frame_len,
            sample_rate: spec.sample_rate,
            channels: spec.channels,
            done: false,
        }))
    }
}

struct WavFrames {
    samples: Box<dyn Iterator<Item = hound::Result<i16>> + Send>,
    frame_len: usize,
    sample_rate: u32,
    channels: u16,
    done: bool,
}

impl Iterator for WavFrames {
    type Item = Result<PcmFrame, AudioError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut frame = Vec::with_capacity(self.frame_len);
        while frame.len() < self.frame_len {
            match self.samples.next() {
                Some(Ok(sample)) => frame.push(sample),
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(AudioError::DecodeFailed(err.to_string())));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }

        if frame.is_empty() {
            return None;
        }
        // Encoders expect whole frames; pad the tail with silence.
        frame.resize(self.frame_len, 0);
        Some(Ok(PcmFrame {
            samples: frame,
            sample_rate: self.sample_rate,
            channels: self.channels,
        }))
    }
}

fn float_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

fn int_to_i16(value: i32, bits: u16) -> i16 {
    if bits > 16 {
        (value >> (bits - 16)) as i16
    } else {
        (value << (16 - bits)) as i16
    }
}

#[cfg(test)]
#[path = "tests/audio_tests.rs"]
mod tests;
