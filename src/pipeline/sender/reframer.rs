//! Audio re-framing to encoder frame boundaries
//!
//! Decoders and capture devices hand out frames of whatever size they like
//! (480 samples for 10 ms Opus, 1024 for AAC, device-sized chunks ...). An
//! encoder accepts exactly `frame_size` samples per call. [`AudioReframer`]
//! keeps a per-channel FIFO in the working format between the two and stamps
//! every outgoing frame from `fifo_base_pts`, which is taken once from the
//! first timed input and then only ever advanced by the duration of the
//! frames drained. Timestamps therefore stay continuous no matter how the
//! input is chunked.

use std::collections::VecDeque;
use std::sync::Arc;

use super::convert::{AudioConverter, ConvertError, ConverterState};
use crate::config::AudioConfig;
use crate::error::{PipelineError, Result};
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::stage::PipelineStage;
use crate::pipeline::types::{AudioBuffer, AudioFormat, DecodedFrame, FrameData, Rational};
use crate::telemetry::SharedTelemetry;
use crate::{emit_debug, emit_info};

const STAGE: &str = "reframe";

#[derive(Debug)]
pub struct AudioReframer {
    format: AudioFormat,
    timebase: Rational,
    frame_size: usize,
    converter: AudioConverter,
    fifo: Vec<VecDeque<f32>>,
    fifo_base_pts: Option<i64>,
    frames_out: u64,
}

impl AudioReframer {
    pub fn new(config: &AudioConfig) -> Self {
        let format = AudioFormat::new(config.sample_rate, config.channels, config.sample_format);
        Self {
            format,
            timebase: config.timebase,
            frame_size: config.frame_size.max(1),
            converter: AudioConverter::new(format),
            fifo: vec![VecDeque::new(); config.channels as usize],
            fifo_base_pts: None,
            frames_out: 0,
        }
    }

    /// Use the frame size the encoder asks for instead of the configured one
    pub fn with_frame_size(mut self, frame_size: usize) -> Self {
        self.frame_size = frame_size.max(1);
        self
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn timebase(&self) -> Rational {
        self.timebase
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples per channel waiting in the FIFO
    pub fn fifo_len(&self) -> usize {
        self.fifo.first().map_or(0, VecDeque::len)
    }

    /// Timestamp the next emitted frame will carry, in the working timebase
    pub fn base_pts(&self) -> Option<i64> {
        self.fifo_base_pts
    }

    pub fn converter_state(&self) -> ConverterState {
        self.converter.state()
    }

    pub fn frames_out(&self) -> u64 {
        self.frames_out
    }

    /// Ticks of the working timebase covered by one output frame
    fn frame_duration(&self) -> i64 {
        Rational::per_second(self.format.sample_rate).rescale(self.frame_size as i64, self.timebase)
    }

    /// Add one decoded frame and return every full frame now available.
    ///
    /// A frame whose format differs from the previous one is dropped while
    /// the converter reconfigures; that is reported as a stream reset.
    pub fn push(&mut self, frame: &DecodedFrame) -> Result<Vec<DecodedFrame>> {
        let FrameData::Audio(buffer) = &frame.data else {
            return Err(PipelineError::dropped(STAGE, "non-audio frame"));
        };

        let planes = match self.converter.convert(buffer) {
            Ok(planes) => planes,
            Err(err @ ConvertError::Reconfigured { .. }) => {
                return Err(PipelineError::reset(STAGE, err.to_string()));
            }
            Err(err @ ConvertError::Invalid(_)) => {
                return Err(PipelineError::dropped(STAGE, err.to_string()));
            }
        };

        if self.fifo_base_pts.is_none()
            && self.fifo_len() == 0
            && let Some(pts) = frame.pts
        {
            self.fifo_base_pts = Some(frame.timebase.rescale(pts, self.timebase));
        }

        for (fifo, plane) in self.fifo.iter_mut().zip(planes) {
            fifo.extend(plane);
        }

        let mut out = Vec::new();
        while self.fifo_len() >= self.frame_size {
            out.push(self.drain_frame(self.frame_size));
        }
        Ok(out)
    }

    fn drain_frame(&mut self, take: usize) -> DecodedFrame {
        let size = self.frame_size;
        let planes: Vec<Vec<f32>> = self
            .fifo
            .iter_mut()
            .map(|fifo| {
                let mut plane: Vec<f32> = fifo.drain(..take.min(fifo.len())).collect();
                plane.resize(size, 0.0);
                plane
            })
            .collect();

        let pts = self.fifo_base_pts;
        let step = self.frame_duration();
        if let Some(base) = self.fifo_base_pts.as_mut() {
            *base += step;
        }
        self.frames_out += 1;
        DecodedFrame::audio(AudioBuffer::from_f32_planes(self.format, &planes), pts, self.timebase)
    }

    /// Emit what is left as one silence-padded frame
    pub fn flush(&mut self) -> Option<DecodedFrame> {
        let left = self.fifo_len();
        if left == 0 {
            return None;
        }
        Some(self.drain_frame(left))
    }

    /// Discard buffered samples and timing
    pub fn reset(&mut self) {
        for fifo in &mut self.fifo {
            fifo.clear();
        }
        self.fifo_base_pts = None;
        self.converter.reset();
    }
}

/// Pipeline stage driving an [`AudioReframer`]
pub struct ReframeStage {
    reframer: AudioReframer,
    output: Arc<BoundedQueue<DecodedFrame>>,
    telemetry: SharedTelemetry,
}

impl ReframeStage {
    pub fn new(
        reframer: AudioReframer,
        output: Arc<BoundedQueue<DecodedFrame>>,
        telemetry: SharedTelemetry,
    ) -> Self {
        Self {
            reframer,
            output,
            telemetry,
        }
    }

    pub fn reframer(&self) -> &AudioReframer {
        &self.reframer
    }

    fn forward(&self, frame: DecodedFrame) -> Result<()> {
        if !self.output.enqueue(frame) {
            return Err(PipelineError::dropped(STAGE, "frame, output queue cleared or closed"));
        }
        Ok(())
    }
}

impl PipelineStage for ReframeStage {
    type Input = DecodedFrame;

    fn name(&self) -> &'static str {
        STAGE
    }

    fn measure(&self, item: &DecodedFrame) -> (usize, bool) {
        (item.sample_count(), false)
    }

    fn on_start(&mut self) -> Result<()> {
        emit_info!(
            self.telemetry,
            STAGE,
            "working format {}, {} samples per frame",
            self.reframer.format(),
            self.reframer.frame_size()
        );
        Ok(())
    }

    fn process(&mut self, frame: DecodedFrame) -> Result<()> {
        for out in self.reframer.push(&frame)? {
            self.forward(out)?;
        }
        Ok(())
    }

    fn on_stop(&mut self) -> Result<()> {
        if let Some(last) = self.reframer.flush() {
            emit_debug!(self.telemetry, STAGE, "flushed padded frame pts={:?}", last.pts);
            self.forward(last)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::SampleFormat;

    fn config() -> AudioConfig {
        AudioConfig::default()
    }

    fn input(samples: usize, pts: Option<i64>) -> DecodedFrame {
        let format = AudioFormat::new(48_000, 1, SampleFormat::F32Planar);
        let data: Vec<f32> = (0..samples).map(|i| i as f32 / samples as f32).collect();
        DecodedFrame::audio(
            AudioBuffer::from_f32_planes(format, &[data]),
            pts,
            Rational::per_second(48_000),
        )
    }

    #[test]
    fn test_pts_continuity_480_to_960() {
        let mut reframer = AudioReframer::new(&config());
        assert_eq!(reframer.frame_size(), 960);

        assert!(reframer.push(&input(480, Some(1000))).unwrap().is_empty());
        assert_eq!(reframer.base_pts(), Some(1000));

        let out = reframer.push(&input(480, Some(1480))).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts, Some(1000));
        assert_eq!(out[0].sample_count(), 960);
        assert_eq!(reframer.base_pts(), Some(1960));

        // a pts jump on the input does not move the base once it is set
        assert!(reframer.push(&input(480, Some(5000))).unwrap().is_empty());
        assert_eq!(reframer.base_pts(), Some(1960));

        let out = reframer.push(&input(480, Some(5480))).unwrap();
        assert_eq!(out[0].pts, Some(1960));
        assert_eq!(reframer.fifo_len(), 0);
    }

    #[test]
    fn test_base_rescaled_into_working_timebase() {
        let mut reframer = AudioReframer::new(&config());
        let mut frame = input(960, Some(20));
        frame.timebase = Rational::new(1, 1000);
        let out = reframer.push(&frame).unwrap();
        assert_eq!(out[0].pts, Some(960));
        assert_eq!(out[0].timebase, Rational::per_second(48_000));
    }

    #[test]
    fn test_large_input_yields_several_frames() {
        let mut reframer = AudioReframer::new(&config()).with_frame_size(1024);
        let out = reframer.push(&input(2500, Some(0))).unwrap();
        let pts: Vec<_> = out.iter().map(|f| f.pts).collect();
        assert_eq!(pts, vec![Some(0), Some(1024)]);
        assert_eq!(reframer.fifo_len(), 2500 - 2048);
    }

    #[test]
    fn test_unknown_pts_until_timed_input_on_empty_fifo() {
        let mut reframer = AudioReframer::new(&config());
        let out = reframer.push(&input(960, None)).unwrap();
        assert_eq!(out[0].pts, None);
        assert_eq!(reframer.base_pts(), None);

        reframer.push(&input(960, Some(9600))).unwrap();
        assert_eq!(reframer.frames_out(), 2);
        assert_eq!(reframer.base_pts(), Some(9600 + 960));
    }

    #[test]
    fn test_flush_pads_with_silence() {
        let mut reframer = AudioReframer::new(&config());
        reframer.push(&input(300, Some(0))).unwrap();
        let last = reframer.flush().unwrap();
        assert_eq!(last.sample_count(), 960);
        assert_eq!(last.pts, Some(0));
        let FrameData::Audio(buffer) = &last.data else {
            panic!("expected audio");
        };
        let planes = buffer.to_f32_planes().unwrap();
        assert!(planes[0][300..].iter().all(|&s| s == 0.0));
        assert!(reframer.flush().is_none());
    }

    #[test]
    fn test_format_change_is_stream_reset() {
        let mut reframer = AudioReframer::new(&config());
        reframer.push(&input(480, Some(0))).unwrap();

        let other = DecodedFrame::audio(
            AudioBuffer::from_s16_interleaved(44_100, 2, &[0; 882]),
            Some(480),
            Rational::per_second(48_000),
        );
        let err = reframer.push(&other).unwrap_err();
        assert!(matches!(err, PipelineError::Reset { .. }));
        assert_eq!(reframer.converter_state(), ConverterState::Configured);
        // buffered samples and base survive the reconfiguration
        assert_eq!(reframer.fifo_len(), 480);
        assert_eq!(reframer.base_pts(), Some(0));
    }

    #[test]
    fn test_reset() {
        let mut reframer = AudioReframer::new(&config());
        reframer.push(&input(100, Some(0))).unwrap();
        reframer.reset();
        assert_eq!(reframer.fifo_len(), 0);
        assert_eq!(reframer.base_pts(), None);
    }
}
