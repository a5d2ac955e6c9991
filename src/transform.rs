//! Real FFT adapter and window functions.
//!
//! [`Transform`] wraps a pair of pre-planned `realfft` transforms of one fixed size.
//! The forward transform uses "forward" normalisation (scaled by `1/N`), so an
//! unscaled inverse reproduces the windowed frame exactly.
//!
//! [`cola_gain`] verifies that an analysis/synthesis window pair satisfies the
//! constant overlap-add condition for a given hop and returns the gain that makes
//! the overlap-add sum unity.

use std::f64::consts::PI;
use std::sync::Arc;

use num_complex::Complex32;
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};

use crate::{DfError, Result};

/// Relative tolerance for the constant overlap-add check.
const COLA_TOLERANCE: f32 = 1e-3;

/// Window function types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowType {
    /// `sin(π/2 · sin²(π(n+½)/N))`, the DeepFilterNet window. Power-complementary at 50% overlap.
    Vorbis,
    /// Square root of the periodic Hann window. Power-complementary at 50% overlap.
    SqrtHann,
    /// Periodic Hann window.
    Hann,
    /// All ones.
    Rectangular,
}

impl WindowType {
    /// Generates the periodic window of `size` samples.
    pub fn generate(self, size: usize) -> Vec<f32> {
        match self {
            WindowType::Vorbis => vorbis_window(size),
            WindowType::SqrtHann => hann_window(size).into_iter().map(f32::sqrt).collect(),
            WindowType::Hann => hann_window(size),
            WindowType::Rectangular => vec![1.0; size],
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            WindowType::Vorbis => "vorbis",
            WindowType::SqrtHann => "sqrt-hann",
            WindowType::Hann => "hann",
            WindowType::Rectangular => "rect",
        }
    }
}

/// Compute the Vorbis window: sin(π/2 · sin²(π·(n+½)/N))
fn vorbis_window(size: usize) -> Vec<f32> {
    if size == 0 {
        return Vec::new();
    }
    let half = size as f64 / 2.0;
    (0..size)
        .map(|i| {
            let sin_val = (0.5 * PI * (i as f64 + 0.5) / half).sin();
            (0.5 * PI * sin_val * sin_val).sin() as f32
        })
        .collect()
}

/// Periodic Hann window (`np.hanning(n + 1)[:-1]`).
fn hann_window(size: usize) -> Vec<f32> {
    let n = size as f64;
    (0..size)
        .map(|i| (0.5 * (1.0 - (2.0 * PI * i as f64 / n).cos())) as f32)
        .collect()
}

/// Verifies the constant overlap-add condition and returns the synthesis gain.
///
/// For every phase `n < hop`, sums `analysis[m] * synthesis[m]` over all positions
/// `m = n + k·hop` inside the frame. The sums must agree within a small relative
/// tolerance; the returned gain is the reciprocal of their mean.
pub fn cola_gain(analysis: &[f32], synthesis: &[f32], hop: usize) -> Result<f32> {
    let size = analysis.len();
    if synthesis.len() != size {
        return Err(DfError::Config(format!(
            "window length mismatch: analysis {} vs synthesis {}",
            size,
            synthesis.len()
        )));
    }
    if hop == 0 || hop > size || size % hop != 0 {
        return Err(DfError::Config(format!(
            "hop size {} must divide frame size {}",
            hop, size
        )));
    }

    let sums: Vec<f32> = (0..hop)
        .map(|n| {
            (n..size)
                .step_by(hop)
                .map(|m| analysis[m] * synthesis[m])
                .sum()
        })
        .collect();

    let max = sums.iter().copied().fold(f32::MIN, f32::max);
    let min = sums.iter().copied().fold(f32::MAX, f32::min);
    if max <= 0.0 {
        return Err(DfError::Config("window overlap-add sum is zero".to_string()));
    }
    if (max - min) / max > COLA_TOLERANCE {
        return Err(DfError::Config(format!(
            "window pair violates constant overlap-add at hop {}: sum ranges {:.6}..{:.6}",
            hop, min, max
        )));
    }

    let mean = sums.iter().sum::<f32>() / hop as f32;
    Ok(1.0 / mean)
}

/// Pre-planned forward/inverse real FFT of a fixed size.
pub struct Transform {
    size: usize,
    forward: Arc<dyn RealToComplex<f32>>,
    inverse: Arc<dyn ComplexToReal<f32>>,
    forward_scratch: Vec<Complex32>,
    inverse_scratch: Vec<Complex32>,
    /// Forward normalisation, `1/N`.
    scale: f32,
}

impl Transform {
    pub fn new(size: usize) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(size);
        let inverse = planner.plan_fft_inverse(size);
        let forward_scratch = forward.make_scratch_vec();
        let inverse_scratch = inverse.make_scratch_vec();

        Self {
            size,
            forward,
            inverse,
            forward_scratch,
            inverse_scratch,
            scale: 1.0 / size as f32,
        }
    }

    /// Frame length in samples.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of spectral bins, `size / 2 + 1`.
    pub fn bins(&self) -> usize {
        self.size / 2 + 1
    }

    /// Forward transform. `input` is used as scratch and left unspecified.
    pub fn forward(&mut self, input: &mut [f32], output: &mut [Complex32]) -> Result<()> {
        debug_assert_eq!(input.len(), self.size);
        debug_assert_eq!(output.len(), self.bins());

        self.forward
            .process_with_scratch(input, output, &mut self.forward_scratch)?;
        for x in output.iter_mut() {
            *x *= self.scale;
        }
        Ok(())
    }

    /// Inverse transform. `input` is used as scratch and left unspecified.
    ///
    /// DC and Nyquist bins of a real signal have no imaginary part; any residue
    /// left there by filtering is dropped before the transform.
    pub fn inverse(&mut self, input: &mut [Complex32], output: &mut [f32]) -> Result<()> {
        debug_assert_eq!(input.len(), self.bins());
        debug_assert_eq!(output.len(), self.size);

        let last = input.len() - 1;
        input[0].im = 0.0;
        input[last].im = 0.0;

        self.inverse
            .process_with_scratch(input, output, &mut self.inverse_scratch)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vorbis_window_symmetry() {
        let w = WindowType::Vorbis.generate(1024);
        assert_eq!(w.len(), 1024);
        for i in 0..512 {
            let diff = (w[i] - w[1023 - i]).abs();
            assert!(diff < 1e-6, "Window not symmetric at {}: {} vs {}", i, w[i], w[1023 - i]);
        }
    }

    #[test]
    fn test_power_complementary_windows_at_half_overlap() {
        for window in [WindowType::Vorbis, WindowType::SqrtHann] {
            let w = window.generate(1024);
            let gain = cola_gain(&w, &w, 512).unwrap();
            assert!((gain - 1.0).abs() < 1e-3, "{} gain {}", window.name(), gain);
        }
    }

    #[test]
    fn test_hann_squared_needs_quarter_hop() {
        let w = WindowType::Hann.generate(1024);
        assert!(matches!(cola_gain(&w, &w, 512), Err(DfError::Config(_))));

        // hann² at 75% overlap sums to 1.5
        let gain = cola_gain(&w, &w, 256).unwrap();
        assert!((gain - 1.0 / 1.5).abs() < 1e-3, "gain {}", gain);
    }

    #[test]
    fn test_hann_analysis_rect_synthesis() {
        let a = WindowType::Hann.generate(1024);
        let s = WindowType::Rectangular.generate(1024);
        let gain = cola_gain(&a, &s, 512).unwrap();
        assert!((gain - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_cola_rejects_bad_hop() {
        let w = WindowType::Vorbis.generate(1024);
        assert!(cola_gain(&w, &w, 0).is_err());
        assert!(cola_gain(&w, &w, 300).is_err());
        assert!(cola_gain(&w, &w, 2048).is_err());
        assert!(cola_gain(&w, &w[..512], 256).is_err());
    }

    #[test]
    fn test_forward_inverse_roundtrip() {
        let mut transform = Transform::new(64);
        let signal: Vec<f32> = (0..64).map(|i| ((i * 7) % 13) as f32 / 13.0 - 0.5).collect();

        let mut input = signal.clone();
        let mut spectrum = vec![Complex32::new(0.0, 0.0); transform.bins()];
        transform.forward(&mut input, &mut spectrum).unwrap();

        let mut output = vec![0.0f32; 64];
        transform.inverse(&mut spectrum, &mut output).unwrap();
        for (a, b) in signal.iter().zip(output.iter()) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_forward_normalisation() {
        // A DC signal of amplitude 1 lands entirely in bin 0 with magnitude 1.
        let mut transform = Transform::new(32);
        let mut input = vec![1.0f32; 32];
        let mut spectrum = vec![Complex32::new(0.0, 0.0); transform.bins()];
        transform.forward(&mut input, &mut spectrum).unwrap();
        assert!((spectrum[0].re - 1.0).abs() < 1e-6);
        for c in &spectrum[1..] {
            assert!(c.norm() < 1e-6);
        }
    }

    #[test]
    fn test_inverse_drops_dc_and_nyquist_imaginary() {
        let mut transform = Transform::new(16);
        let mut spectrum = vec![Complex32::new(0.0, 0.0); transform.bins()];
        spectrum[0] = Complex32::new(0.5, 0.25);
        spectrum[8] = Complex32::new(0.0, -0.3);
        let mut output = vec![0.0f32; 16];
        transform.inverse(&mut spectrum, &mut output).unwrap();
        for &x in &output {
            assert!((x - 0.5).abs() < 1e-6);
        }
    }
}
