//! Streaming STFT analysis and overlap-add synthesis.
//!
//! All memory is pre-allocated. [`Framer::push`] and [`Framer::pop`] perform zero
//! heap allocations.
//!
//! The analysis buffer always holds the most recent `frame_size` input samples.
//! The synthesis buffer is an overlap-add accumulator of the same length: each
//! [`pop`](Framer::pop) adds one windowed inverse frame, emits the oldest `hop_size`
//! samples and shifts, zero-filling the vacated tail. The end-to-end delay is
//! `frame_size - hop_size` samples; until the first full frame has passed, the
//! output contains the zero history the buffers were initialised with.

use num_complex::Complex32;

use crate::transform::{cola_gain, Transform, WindowType};
use crate::Result;

pub struct Framer {
    frame_size: usize,
    hop_size: usize,
    transform: Transform,
    analysis_window: Vec<f32>,
    /// Synthesis window with the overlap-add gain folded in.
    synthesis_window: Vec<f32>,
    /// Most recent `frame_size` input samples, oldest first.
    analysis_buf: Vec<f32>,
    /// Overlap-add accumulator.
    synthesis_buf: Vec<f32>,
    /// Windowed FFT input.
    fft_buf: Vec<f32>,
    /// Inverse FFT output.
    ifft_buf: Vec<f32>,
}

impl Framer {
    /// Create a framer, verifying the window pair satisfies constant overlap-add.
    pub fn new(
        frame_size: usize,
        hop_size: usize,
        analysis: WindowType,
        synthesis: WindowType,
    ) -> Result<Self> {
        let analysis_window = analysis.generate(frame_size);
        let synthesis_window = synthesis.generate(frame_size);
        let gain = cola_gain(&analysis_window, &synthesis_window, hop_size)?;
        log::debug!(
            "framer: frame {} hop {} windows {}/{} overlap-add gain {:.6}",
            frame_size,
            hop_size,
            analysis.name(),
            synthesis.name(),
            gain
        );

        Ok(Self {
            frame_size,
            hop_size,
            transform: Transform::new(frame_size),
            analysis_window,
            synthesis_window: synthesis_window.into_iter().map(|w| w * gain).collect(),
            analysis_buf: vec![0.0; frame_size],
            synthesis_buf: vec![0.0; frame_size],
            fft_buf: vec![0.0; frame_size],
            ifft_buf: vec![0.0; frame_size],
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Number of spectral bins per frame.
    pub fn bins(&self) -> usize {
        self.transform.bins()
    }

    /// Samples of delay between a sample entering [`push`](Self::push) and leaving
    /// [`pop`](Self::pop).
    pub fn latency(&self) -> usize {
        self.frame_size - self.hop_size
    }

    /// Advance the analysis window by one hop and transform it.
    ///
    /// - `block`: exactly `hop_size` new samples
    /// - `spectrum`: exactly `bins()` complex values
    pub fn push(&mut self, block: &[f32], spectrum: &mut [Complex32]) -> Result<()> {
        debug_assert_eq!(block.len(), self.hop_size);
        debug_assert_eq!(spectrum.len(), self.bins());

        let keep = self.frame_size - self.hop_size;
        self.analysis_buf.copy_within(self.hop_size.., 0);
        self.analysis_buf[keep..].copy_from_slice(block);

        for ((buf, &x), &w) in self
            .fft_buf
            .iter_mut()
            .zip(self.analysis_buf.iter())
            .zip(self.analysis_window.iter())
        {
            *buf = x * w;
        }

        self.transform.forward(&mut self.fft_buf, spectrum)
    }

    /// Synthesize one frame and emit the oldest hop of the overlap-add accumulator.
    ///
    /// - `spectrum`: exactly `bins()` complex values (used as scratch)
    /// - `block`: exactly `hop_size` output samples
    pub fn pop(&mut self, spectrum: &mut [Complex32], block: &mut [f32]) -> Result<()> {
        debug_assert_eq!(spectrum.len(), self.bins());
        debug_assert_eq!(block.len(), self.hop_size);

        self.transform.inverse(spectrum, &mut self.ifft_buf)?;

        for ((acc, &x), &w) in self
            .synthesis_buf
            .iter_mut()
            .zip(self.ifft_buf.iter())
            .zip(self.synthesis_window.iter())
        {
            *acc += x * w;
        }

        block.copy_from_slice(&self.synthesis_buf[..self.hop_size]);
        self.synthesis_buf.copy_within(self.hop_size.., 0);
        let tail = self.frame_size - self.hop_size;
        self.synthesis_buf[tail..].fill(0.0);
        Ok(())
    }

    /// Reset analysis and overlap-add memory.
    pub fn reset(&mut self) {
        self.analysis_buf.fill(0.0);
        self.synthesis_buf.fill(0.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(framer: &mut Framer, input: &[f32]) -> Vec<f32> {
        let hop = framer.hop_size();
        let mut spectrum = vec![Complex32::new(0.0, 0.0); framer.bins()];
        let mut output = Vec::with_capacity(input.len());
        let mut block = vec![0.0f32; hop];
        for chunk in input.chunks(hop) {
            framer.push(chunk, &mut spectrum).unwrap();
            framer.pop(&mut spectrum, &mut block).unwrap();
            output.extend_from_slice(&block);
        }
        output
    }

    fn sine(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin() * 0.5)
            .collect()
    }

    #[test]
    fn test_stft_istft_roundtrip() {
        let mut framer = Framer::new(1024, 512, WindowType::Vorbis, WindowType::Vorbis).unwrap();
        let input = sine(512 * 40);
        let output = roundtrip(&mut framer, &input);

        let delay = framer.latency();
        assert_eq!(delay, 512);
        let mut max_err = 0.0f32;
        for i in delay..output.len() {
            max_err = max_err.max((output[i] - input[i - delay]).abs());
        }
        assert!(max_err < 1e-4, "STFT/ISTFT roundtrip error too large: {}", max_err);
        // Warm-up block carries only the zero history
        assert!(output[..delay].iter().all(|&x| x.abs() < 1e-6));
    }

    #[test]
    fn test_roundtrip_quarter_hop_hann() {
        let mut framer = Framer::new(1024, 256, WindowType::Hann, WindowType::Hann).unwrap();
        let input = sine(256 * 64);
        let output = roundtrip(&mut framer, &input);

        let delay = framer.latency();
        assert_eq!(delay, 768);
        for i in delay..output.len() {
            let err = (output[i] - input[i - delay]).abs();
            assert!(err < 1e-4, "sample {}: error {}", i, err);
        }
    }

    #[test]
    fn test_rejects_non_cola_pair() {
        assert!(Framer::new(1024, 512, WindowType::Hann, WindowType::Hann).is_err());
    }

    #[test]
    fn test_reset_clears_history() {
        let mut framer = Framer::new(256, 128, WindowType::SqrtHann, WindowType::SqrtHann).unwrap();
        let input = sine(128 * 8);
        roundtrip(&mut framer, &input);
        framer.reset();

        let silence = vec![0.0f32; 128 * 4];
        let output = roundtrip(&mut framer, &silence);
        assert!(output.iter().all(|&x| x == 0.0));
    }
}
