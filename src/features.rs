//! Spectral features for the encoder.
//!
//! [`FeatureExtractor`] is a pure mapping from one spectral frame to the two input
//! tensors of the inference contract:
//!
//! - `feat_erb` `[1, 1, 1, nb_erb]`: mean band power in dB, one value per ERB band
//! - `feat_spec` `[1, 2, 1, nb_df]`: real (channel 0) and imaginary (channel 1) parts
//!   of the lowest `nb_df` bins
//!
//! [`FeatureNorm`] holds the exponential-moving-average state DeepFilterNet models
//! are trained with and normalises both tensors in place. It is kept separate so the
//! extraction itself stays stateless.

use ndarray::Array4;
use num_complex::Complex32;

use crate::erb::ErbBands;

/// Floor added to band power before taking the logarithm.
const POWER_EPSILON: f32 = 1e-10;
/// Lower bound of the unit-normalisation state; keeps long silences finite.
const UNIT_NORM_FLOOR: f32 = 1e-10;

/// Initial ERB mean-normalisation state, linearly spaced from first to last band (dB).
const MEAN_NORM_INIT: [f32; 2] = [-60.0, -90.0];
/// Initial unit-normalisation state, linearly spaced from first to last bin.
const UNIT_NORM_INIT: [f32; 2] = [0.001, 0.0001];

/// Encoder input tensors for one frame.
#[derive(Debug, Clone)]
pub struct Features {
    /// `[1, 1, 1, nb_erb]`
    pub erb: Array4<f32>,
    /// `[1, 2, 1, nb_df]`
    pub spec: Array4<f32>,
}

impl Features {
    pub fn zeros(nb_erb: usize, nb_df: usize) -> Self {
        Self {
            erb: Array4::zeros((1, 1, 1, nb_erb)),
            spec: Array4::zeros((1, 2, 1, nb_df)),
        }
    }

    pub fn nb_erb(&self) -> usize {
        self.erb.shape()[3]
    }

    pub fn nb_df(&self) -> usize {
        self.spec.shape()[3]
    }
}

/// Maps a spectral frame onto the fixed-shape encoder inputs.
#[derive(Debug, Clone)]
pub struct FeatureExtractor {
    bands: ErbBands,
    nb_df: usize,
}

impl FeatureExtractor {
    pub fn new(bands: ErbBands, nb_df: usize) -> Self {
        Self { bands, nb_df }
    }

    pub fn nb_erb(&self) -> usize {
        self.bands.len()
    }

    pub fn nb_df(&self) -> usize {
        self.nb_df
    }

    /// Allocate output tensors of the configured shapes.
    pub fn alloc(&self) -> Features {
        Features::zeros(self.nb_erb(), self.nb_df)
    }

    /// Compute both feature tensors for `spectrum` into `out`.
    pub fn extract(&self, spectrum: &[Complex32], out: &mut Features) {
        debug_assert_eq!(spectrum.len(), self.bands.bins());
        debug_assert_eq!(out.nb_erb(), self.nb_erb());
        debug_assert_eq!(out.nb_df(), self.nb_df);

        for (band, range) in self.bands.ranges().enumerate() {
            let k = 1.0 / range.len() as f32;
            let power: f32 = spectrum[range].iter().map(|c| c.norm_sqr() * k).sum();
            out.erb[[0, 0, 0, band]] = (power + POWER_EPSILON).log10() * 10.0;
        }

        for (f, c) in spectrum.iter().take(self.nb_df).enumerate() {
            out.spec[[0, 0, 0, f]] = c.re;
            out.spec[[0, 1, 0, f]] = c.im;
        }
    }
}

/// Running feature normalisation matching DeepFilterNet's `feat_erb` / `feat_cplx`.
pub struct FeatureNorm {
    alpha: f32,
    /// Running mean per ERB band (dB).
    mean_state: Vec<f32>,
    /// Running magnitude per DF bin.
    unit_state: Vec<f32>,
}

impl FeatureNorm {
    pub fn new(nb_erb: usize, nb_df: usize, alpha: f32) -> Self {
        Self {
            alpha,
            mean_state: linspace(MEAN_NORM_INIT, nb_erb),
            unit_state: linspace(UNIT_NORM_INIT, nb_df),
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Normalise `features` in place and advance the running state.
    pub fn normalize(&mut self, features: &mut Features) {
        let alpha = self.alpha;

        for (x, s) in features.erb.iter_mut().zip(self.mean_state.iter_mut()) {
            *s = *x * (1.0 - alpha) + *s * alpha;
            *x = (*x - *s) / 40.0;
        }

        for (f, s) in self.unit_state.iter_mut().enumerate() {
            let re = features.spec[[0, 0, 0, f]];
            let im = features.spec[[0, 1, 0, f]];
            let mag = (re * re + im * im).sqrt();
            *s = mag * (1.0 - alpha) + *s * alpha;
            let scale = 1.0 / s.max(UNIT_NORM_FLOOR).sqrt();
            features.spec[[0, 0, 0, f]] = re * scale;
            features.spec[[0, 1, 0, f]] = im * scale;
        }
    }

    /// Reset normalisation states to initial values.
    pub fn reset(&mut self) {
        self.mean_state = linspace(MEAN_NORM_INIT, self.mean_state.len());
        self.unit_state = linspace(UNIT_NORM_INIT, self.unit_state.len());
    }
}

fn linspace([start, end]: [f32; 2], n: usize) -> Vec<f32> {
    let step = if n > 1 { (end - start) / (n - 1) as f32 } else { 0.0 };
    (0..n).map(|i| start + i as f32 * step).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> FeatureExtractor {
        FeatureExtractor::new(ErbBands::from_widths(vec![2, 3, 5, 7], 17).unwrap(), 4)
    }

    #[test]
    fn test_feature_shapes() {
        let features = extractor().alloc();
        assert_eq!(features.erb.shape(), &[1, 1, 1, 4]);
        assert_eq!(features.spec.shape(), &[1, 2, 1, 4]);
    }

    #[test]
    fn test_band_power_in_db() {
        let ex = extractor();
        let mut spectrum = vec![Complex32::new(0.0, 0.0); 17];
        // Band 1 (bins 2..5): every bin has power 0.01 -> -20 dB
        for c in &mut spectrum[2..5] {
            *c = Complex32::new(0.06, 0.08);
        }
        let mut out = ex.alloc();
        ex.extract(&spectrum, &mut out);

        assert!((out.erb[[0, 0, 0, 1]] - -20.0).abs() < 1e-3, "{}", out.erb[[0, 0, 0, 1]]);
        // Empty bands sit at the floor
        assert!((out.erb[[0, 0, 0, 0]] - -100.0).abs() < 1e-3);
        assert!((out.erb[[0, 0, 0, 3]] - -100.0).abs() < 1e-3);
    }

    #[test]
    fn test_spec_channels_are_planar() {
        let ex = extractor();
        let spectrum: Vec<Complex32> = (0..17).map(|i| Complex32::new(i as f32, -(i as f32))).collect();
        let mut out = ex.alloc();
        ex.extract(&spectrum, &mut out);

        for f in 0..4 {
            assert_eq!(out.spec[[0, 0, 0, f]], f as f32);
            assert_eq!(out.spec[[0, 1, 0, f]], -(f as f32));
        }
    }

    #[test]
    fn test_extract_is_deterministic() {
        let ex = extractor();
        let spectrum: Vec<Complex32> = (0..17).map(|i| Complex32::new(0.1 * i as f32, 0.02)).collect();
        let mut a = ex.alloc();
        let mut b = ex.alloc();
        ex.extract(&spectrum, &mut a);
        ex.extract(&spectrum, &mut b);
        assert_eq!(a.erb, b.erb);
        assert_eq!(a.spec, b.spec);
    }

    #[test]
    fn test_norm_initial_state() {
        let norm = FeatureNorm::new(32, 96, 0.99);
        assert_eq!(norm.mean_state[0], -60.0);
        assert!((norm.mean_state[31] - -90.0).abs() < 1e-4);
        assert_eq!(norm.unit_state[0], 0.001);
        assert!((norm.unit_state[95] - 0.0001).abs() < 1e-8);
    }

    #[test]
    fn test_norm_converges_on_stationary_input() {
        let ex = extractor();
        let mut norm = FeatureNorm::new(4, 4, 0.9);
        let spectrum: Vec<Complex32> = (0..17).map(|i| Complex32::new(0.05 * (i + 1) as f32, 0.0)).collect();
        let mut out = ex.alloc();
        for _ in 0..500 {
            ex.extract(&spectrum, &mut out);
            norm.normalize(&mut out);
        }
        // Mean-normalised features of a stationary input approach zero
        for &x in out.erb.iter() {
            assert!(x.abs() < 1e-3, "{}", x);
        }
        // Unit-normalised bins approach sqrt(|x|)
        let expected = (0.05f32).sqrt();
        assert!((out.spec[[0, 0, 0, 0]] - expected).abs() < 1e-3);
    }

    #[test]
    fn test_norm_stays_finite_on_long_silence() {
        let ex = extractor();
        let mut norm = FeatureNorm::new(4, 4, 0.99);
        let spectrum = vec![Complex32::new(0.0, 0.0); 17];
        let mut out = ex.alloc();
        for _ in 0..20_000 {
            ex.extract(&spectrum, &mut out);
            norm.normalize(&mut out);
        }
        assert!(out.erb.iter().all(|x| x.is_finite()));
        assert!(out.spec.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_norm_reset() {
        let mut norm = FeatureNorm::new(4, 4, 0.5);
        let mut features = Features::zeros(4, 4);
        features.erb.fill(10.0);
        features.spec.fill(1.0);
        norm.normalize(&mut features);
        norm.reset();
        assert_eq!(norm.mean_state, linspace(MEAN_NORM_INIT, 4));
        assert_eq!(norm.unit_state, linspace(UNIT_NORM_INIT, 4));
    }
}
