//! Audio normalisation to the working format
//!
//! Decoded audio arrives in whatever layout the decoder produced. The
//! converter unpacks it, remixes the channel count and resamples to the
//! working rate. It is configured from the first frame it actually sees, and
//! a later change of input format is handled as a state transition:
//! `Configured → Reconfiguring → Configured`, dropping the frame that carried
//! the change.

use std::fmt;

use crate::pipeline::types::{AudioBuffer, AudioFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConverterState {
    #[default]
    Unconfigured,
    Configured,
    Reconfiguring,
}

impl fmt::Display for ConverterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConverterState::Unconfigured => write!(f, "Unconfigured"),
            ConverterState::Configured => write!(f, "Configured"),
            ConverterState::Reconfiguring => write!(f, "Reconfiguring"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConvertError {
    /// The input format changed; the converter now follows `to`
    Reconfigured { from: AudioFormat, to: AudioFormat },
    /// The frame could not be read; the converter will follow the next frame
    Invalid(String),
}

impl fmt::Display for ConvertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConvertError::Reconfigured { from, to } => {
                write!(f, "input format changed from {} to {}", from, to)
            }
            ConvertError::Invalid(reason) => write!(f, "unreadable frame: {}", reason),
        }
    }
}

/// Streaming linear-interpolation resampler for one channel
///
/// The last input sample and the fractional read position carry over between
/// calls, so chunk boundaries do not introduce phase jumps.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    step: f64,
    pos: f64,
    prev: Option<f32>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            step: from_rate as f64 / to_rate.max(1) as f64,
            pos: 0.0,
            prev: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        if input.is_empty() {
            return Vec::new();
        }

        let mut ext = Vec::with_capacity(input.len() + 1);
        ext.extend(self.prev);
        ext.extend_from_slice(input);

        let mut out = Vec::with_capacity((input.len() as f64 / self.step) as usize + 1);
        while self.pos + 1.0 < ext.len() as f64 {
            let i = self.pos.floor() as usize;
            let frac = (self.pos - i as f64) as f32;
            out.push(ext[i] + (ext[i + 1] - ext[i]) * frac);
            self.pos += self.step;
        }

        // the last sample becomes index 0 of the next call
        self.pos -= (ext.len() - 1) as f64;
        self.prev = ext.last().copied();
        out
    }

    pub fn reset(&mut self) {
        self.pos = 0.0;
        self.prev = None;
    }
}

/// Map `input` channels onto `channels` output channels
pub fn remix(input: Vec<Vec<f32>>, channels: usize) -> Vec<Vec<f32>> {
    let src = input.len();
    if src == channels || src == 0 {
        return input;
    }
    let samples = input[0].len();

    if channels == 1 {
        let scale = 1.0 / src as f32;
        let mono = (0..samples)
            .map(|i| input.iter().map(|c| c.get(i).copied().unwrap_or(0.0)).sum::<f32>() * scale)
            .collect();
        return vec![mono];
    }

    (0..channels).map(|ch| input[ch % src].clone()).collect()
}

#[derive(Debug)]
pub struct AudioConverter {
    target: AudioFormat,
    source: Option<AudioFormat>,
    state: ConverterState,
    resamplers: Vec<LinearResampler>,
    reconfigurations: u64,
}

impl AudioConverter {
    pub fn new(target: AudioFormat) -> Self {
        Self {
            target,
            source: None,
            state: ConverterState::Unconfigured,
            resamplers: Vec::new(),
            reconfigurations: 0,
        }
    }

    pub fn target(&self) -> AudioFormat {
        self.target
    }

    /// Input format the converter is configured for
    pub fn source(&self) -> Option<AudioFormat> {
        self.source
    }

    pub fn state(&self) -> ConverterState {
        self.state
    }

    pub fn reconfigurations(&self) -> u64 {
        self.reconfigurations
    }

    fn configure(&mut self, source: AudioFormat) {
        self.resamplers = (0..self.target.channels)
            .map(|_| LinearResampler::new(source.sample_rate, self.target.sample_rate))
            .collect();
        self.source = Some(source);
        self.state = ConverterState::Configured;
    }

    /// Convert one buffer into per-channel samples of the target rate and
    /// channel count.
    pub fn convert(&mut self, buffer: &AudioBuffer) -> Result<Vec<Vec<f32>>, ConvertError> {
        let format = buffer.format;

        match self.source {
            None => self.configure(format),
            Some(source) if source != format => {
                self.state = ConverterState::Reconfiguring;
                self.reconfigurations += 1;
                self.configure(format);
                return Err(ConvertError::Reconfigured {
                    from: source,
                    to: format,
                });
            }
            Some(_) => {}
        }

        let planes = match buffer.to_f32_planes() {
            Ok(planes) => planes,
            Err(reason) => {
                // follow whatever the next frame carries
                self.state = ConverterState::Unconfigured;
                self.source = None;
                self.resamplers.clear();
                return Err(ConvertError::Invalid(reason));
            }
        };

        let mixed = remix(planes, self.target.channels as usize);
        Ok(mixed
            .iter()
            .zip(self.resamplers.iter_mut())
            .map(|(plane, resampler)| resampler.process(plane))
            .collect())
    }

    /// Forget the configured input format and the resampler phase
    pub fn reset(&mut self) {
        self.source = None;
        self.state = ConverterState::Unconfigured;
        self.resamplers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::SampleFormat;

    fn target() -> AudioFormat {
        AudioFormat::new(48_000, 1, SampleFormat::F32Planar)
    }

    #[test]
    fn test_configures_from_first_frame() {
        let mut converter = AudioConverter::new(target());
        assert_eq!(converter.state(), ConverterState::Unconfigured);

        let input = AudioBuffer::from_s16_interleaved(48_000, 2, &[1000, 3000, -1000, -3000]);
        let out = converter.convert(&input).unwrap();
        assert_eq!(converter.state(), ConverterState::Configured);
        assert_eq!(converter.source(), Some(input.format));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].len(), 2);
        assert!((out[0][0] - 2000.0 / i16::MAX as f32).abs() < 1e-4);
    }

    #[test]
    fn test_format_change_drops_frame_and_reconfigures() {
        let mut converter = AudioConverter::new(target());
        let stereo = AudioBuffer::from_f32_interleaved(48_000, 2, &[0.5; 8]);
        converter.convert(&stereo).unwrap();

        let mono = AudioBuffer::from_f32_interleaved(44_100, 1, &[0.25; 4]);
        let err = converter.convert(&mono).unwrap_err();
        assert!(matches!(err, ConvertError::Reconfigured { .. }));
        assert_eq!(converter.state(), ConverterState::Configured);
        assert_eq!(converter.source(), Some(mono.format));
        assert_eq!(converter.reconfigurations(), 1);

        assert!(converter.convert(&mono).is_ok());
    }

    #[test]
    fn test_invalid_frame_unconfigures() {
        let mut converter = AudioConverter::new(target());
        let good = AudioBuffer::from_f32_interleaved(48_000, 1, &[0.0; 4]);
        converter.convert(&good).unwrap();

        let mut bad = good.clone();
        bad.samples = 100;
        assert!(matches!(converter.convert(&bad), Err(ConvertError::Invalid(_))));
        assert_eq!(converter.state(), ConverterState::Unconfigured);
        assert!(converter.convert(&good).is_ok());
    }

    #[test]
    fn test_remix() {
        let up = remix(vec![vec![1.0, 2.0]], 2);
        assert_eq!(up, vec![vec![1.0, 2.0], vec![1.0, 2.0]]);
        let down = remix(vec![vec![1.0, 0.0], vec![0.0, 1.0]], 1);
        assert_eq!(down, vec![vec![0.5, 0.5]]);
    }

    #[test]
    fn test_resampler_halves_rate() {
        let mut rs = LinearResampler::new(48_000, 24_000);
        let input: Vec<f32> = (0..480).map(|i| i as f32).collect();
        let out = rs.process(&input);
        assert_eq!(out.len(), 240);
        assert_eq!(out[1], 2.0);
    }

    #[test]
    fn test_resampler_keeps_phase_across_chunks() {
        let ramp: Vec<f32> = (0..4410).map(|i| i as f32).collect();

        let mut whole = LinearResampler::new(44_100, 48_000);
        let expected = whole.process(&ramp);

        let mut chunked = LinearResampler::new(44_100, 48_000);
        let mut got = Vec::new();
        for chunk in ramp.chunks(441) {
            got.extend(chunked.process(chunk));
        }

        assert_eq!(got.len(), expected.len());
        for (a, b) in got.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-2);
        }
        // 4410 samples at 44.1 kHz are 100 ms, about 4800 samples at 48 kHz
        assert!((4798..=4800).contains(&got.len()));
    }
}
