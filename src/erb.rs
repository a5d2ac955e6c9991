//! ERB band layout shared by feature extraction and mask application.

use crate::{DfError, Result};

/// Glasberg-Moore ERB scale constants.
const ERB_A: f64 = 24.7;
const ERB_Q: f64 = 9.265;

/// Convert frequency in Hz to ERB scale.
fn freq2erb(freq_hz: f64) -> f64 {
    ERB_Q * (1.0 + freq_hz / (ERB_A * ERB_Q)).ln()
}

/// Convert ERB scale to frequency in Hz.
fn erb2freq(n_erb: f64) -> f64 {
    ERB_A * ERB_Q * ((n_erb / ERB_Q).exp() - 1.0)
}

/// Contiguous, non-overlapping grouping of spectral bins into ERB bands.
///
/// Computed once at construction and immutable afterwards. Band `b` covers
/// bins `offset(b) .. offset(b) + width(b)`; the widths sum to the bin count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErbBands {
    widths: Vec<usize>,
    offsets: Vec<usize>,
}

impl ErbBands {
    /// Build the band layout for a spectrum of `fft_size / 2 + 1` bins.
    ///
    /// Band edges are equally spaced on the ERB scale and rounded to bins. Bands
    /// narrower than `min_width` are widened and the excess is taken from the
    /// following band. The last band also absorbs the DC bin offset.
    pub fn new(sample_rate: usize, fft_size: usize, nb_bands: usize, min_width: usize) -> Result<Self> {
        if nb_bands == 0 || fft_size < 2 {
            return Err(DfError::Config(format!(
                "invalid ERB layout: {} bands over fft size {}",
                nb_bands, fft_size
            )));
        }
        let n_freqs = fft_size / 2 + 1;
        let nyquist = sample_rate as f64 / 2.0;
        let freq_width = sample_rate as f64 / fft_size as f64;

        let erb_low = freq2erb(0.0);
        let erb_high = freq2erb(nyquist);
        let step = (erb_high - erb_low) / nb_bands as f64;

        let mut widths = vec![0usize; nb_bands];
        let mut prev_freq_bin = 0i64;
        let mut freq_over = 0i64;
        for (i, width) in widths.iter_mut().enumerate() {
            let f = erb2freq(erb_low + (i + 1) as f64 * step);
            let fb = (f / freq_width).round() as i64;
            let mut nb_freqs = fb - prev_freq_bin - freq_over;
            if nb_freqs < min_width as i64 {
                freq_over = min_width as i64 - nb_freqs;
                nb_freqs = min_width as i64;
            } else {
                freq_over = 0;
            }
            *width = nb_freqs as usize;
            prev_freq_bin = fb;
        }
        widths[nb_bands - 1] += 1;

        Self::from_widths(widths, n_freqs)
    }

    /// Use an explicit band layout, e.g. one shipped with a model.
    pub fn from_widths(widths: Vec<usize>, n_freqs: usize) -> Result<Self> {
        if widths.iter().any(|&w| w == 0) {
            return Err(DfError::Config(format!("ERB layout has an empty band: {:?}", widths)));
        }
        let total: usize = widths.iter().sum();
        if total != n_freqs {
            return Err(DfError::Config(format!(
                "ERB widths cover {} bins, spectrum has {} (too many bands for this frame size?)",
                total, n_freqs
            )));
        }
        let offsets = widths
            .iter()
            .scan(0usize, |acc, &w| {
                let start = *acc;
                *acc += w;
                Some(start)
            })
            .collect();
        Ok(Self { widths, offsets })
    }

    /// Number of bands.
    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    /// Total number of bins covered.
    pub fn bins(&self) -> usize {
        self.widths.iter().sum()
    }

    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Bin range of each band, lowest band first.
    pub fn ranges(&self) -> impl Iterator<Item = std::ops::Range<usize>> + '_ {
        self.offsets
            .iter()
            .zip(self.widths.iter())
            .map(|(&start, &width)| start..start + width)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_erb_scale_conversion() {
        for hz in [0.0, 100.0, 1000.0, 8000.0, 24000.0] {
            let back = erb2freq(freq2erb(hz));
            assert!((back - hz).abs() < 1e-6 * hz.max(1.0));
        }
    }

    #[test]
    fn test_default_layout_covers_spectrum() {
        let bands = ErbBands::new(48000, 1024, 32, 2).unwrap();
        assert_eq!(bands.len(), 32);
        assert_eq!(bands.bins(), 513);
        assert!(bands.widths().iter().all(|&w| w >= 2));
        // Widths grow towards high frequencies
        assert!(bands.widths()[31] > bands.widths()[0]);
    }

    #[test]
    fn test_deepfilternet_layout() {
        // DeepFilterNet defaults: 960-point FFT, 32 bands, min 2 bins
        let bands = ErbBands::new(48000, 960, 32, 2).unwrap();
        assert_eq!(bands.bins(), 481);
    }

    #[test]
    fn test_ranges_are_contiguous() {
        let bands = ErbBands::new(48000, 1024, 32, 2).unwrap();
        let mut next = 0;
        for range in bands.ranges() {
            assert_eq!(range.start, next);
            assert!(range.end > range.start);
            next = range.end;
        }
        assert_eq!(next, 513);
    }

    #[test]
    fn test_too_many_bands_rejected() {
        // 64 bands of at least 4 bins cannot fit into 65 bins
        assert!(ErbBands::new(48000, 128, 64, 4).is_err());
    }

    #[test]
    fn test_from_widths_validates() {
        assert!(ErbBands::from_widths(vec![2, 3, 4], 9).is_ok());
        assert!(ErbBands::from_widths(vec![2, 3, 4], 10).is_err());
        assert!(ErbBands::from_widths(vec![2, 0, 7], 9).is_err());
    }
}
