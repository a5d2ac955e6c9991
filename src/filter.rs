//! Two-stage spectral filtering: ERB mask, then deep filtering over frame history.

use num_complex::Complex32;

use crate::erb::ErbBands;
use crate::inference::InferenceResult;
use crate::{DfError, Result, MAX_DB_DF_THRESH, MAX_DB_ERB_THRESH, MIN_DB_THRESH};

/// Bounded ring of the most recent spectral frames.
///
/// Storage is one flat buffer of `capacity * bins` values with a write cursor;
/// pushing beyond capacity overwrites the oldest frame. Slots that were never
/// written read as silence.
pub struct HistoryRing {
    bins: usize,
    capacity: usize,
    frames: Vec<Complex32>,
    /// Slot the next push writes to.
    cursor: usize,
    /// Frames written so far (saturates at capacity).
    len: usize,
}

impl HistoryRing {
    pub fn new(capacity: usize, bins: usize) -> Self {
        Self {
            bins,
            capacity,
            frames: vec![Complex32::new(0.0, 0.0); capacity * bins],
            cursor: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Store a copy of `frame` as the newest entry.
    pub fn push(&mut self, frame: &[Complex32]) {
        debug_assert_eq!(frame.len(), self.bins);
        if self.capacity == 0 {
            return;
        }
        let off = self.cursor * self.bins;
        self.frames[off..off + self.bins].copy_from_slice(frame);
        self.cursor = (self.cursor + 1) % self.capacity;
        self.len = (self.len + 1).min(self.capacity);
    }

    /// Frame pushed `age` steps ago (0 = newest), if it exists.
    pub fn get(&self, age: usize) -> Option<&[Complex32]> {
        if age >= self.len {
            return None;
        }
        let slot = (self.cursor + self.capacity - 1 - age) % self.capacity;
        let off = slot * self.bins;
        Some(&self.frames[off..off + self.bins])
    }

    /// Single bin of the frame pushed `age` steps ago, zero if missing.
    #[inline]
    pub fn bin(&self, age: usize, bin: usize) -> Complex32 {
        self.get(age)
            .map(|frame| frame[bin])
            .unwrap_or_else(|| Complex32::new(0.0, 0.0))
    }

    /// Stored frames, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &[Complex32]> + '_ {
        (0..self.len).filter_map(move |age| self.get(age))
    }

    pub fn clear(&mut self) {
        self.frames.fill(Complex32::new(0.0, 0.0));
        self.cursor = 0;
        self.len = 0;
    }
}

/// Local-SNR thresholds for skipping filter stages, as in DeepFilterNet's CLI.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LsnrGate {
    /// Below this the frame is treated as pure noise and zeroed.
    pub min_db: f32,
    /// Above this the ERB mask is skipped.
    pub max_db_erb: f32,
    /// Above this deep filtering is skipped.
    pub max_db_df: f32,
}

impl Default for LsnrGate {
    fn default() -> Self {
        Self {
            min_db: MIN_DB_THRESH,
            max_db_erb: MAX_DB_ERB_THRESH,
            max_db_df: MAX_DB_DF_THRESH,
        }
    }
}

/// Which stages run for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stages {
    mask: bool,
    zero_mask: bool,
    deep_filter: bool,
}

impl Stages {
    fn select(gate: Option<&LsnrGate>, lsnr: Option<f32>) -> Self {
        match (gate, lsnr) {
            (Some(gate), Some(lsnr)) => {
                let zero_mask = lsnr < gate.min_db;
                Self {
                    mask: lsnr <= gate.max_db_erb,
                    zero_mask,
                    deep_filter: lsnr <= gate.max_db_df && !zero_mask,
                }
            }
            _ => Self {
                mask: true,
                zero_mask: false,
                deep_filter: true,
            },
        }
    }
}

/// Applies an [`InferenceResult`] to a spectral frame.
///
/// Owns the [`HistoryRing`] of pre-filter frames used by the deep-filter taps.
/// Taps run oldest to newest: tap `o` applies to the frame `df_order - 1 - o`
/// hops old, so the last tap is the current frame.
pub struct SpectralFilter {
    bands: ErbBands,
    nb_df: usize,
    df_order: usize,
    gate: Option<LsnrGate>,
    history: HistoryRing,
}

impl SpectralFilter {
    pub fn new(bands: ErbBands, nb_df: usize, df_order: usize, gate: Option<LsnrGate>) -> Self {
        let bins = bands.bins();
        Self {
            bands,
            nb_df,
            df_order,
            gate,
            history: HistoryRing::new(df_order, bins),
        }
    }

    pub fn history(&self) -> &HistoryRing {
        &self.history
    }

    /// Expected mask shape `[1, 1, 1, nb_erb]`.
    pub fn mask_shape(&self) -> [usize; 4] {
        [1, 1, 1, self.bands.len()]
    }

    /// Expected coefficient shape `[1, 1, nb_df, 2 * df_order]`.
    pub fn coefs_shape(&self) -> [usize; 4] {
        [1, 1, self.nb_df, 2 * self.df_order]
    }

    /// Produce the enhanced frame for `spectrum` into `out`.
    ///
    /// Does not modify the history; call [`commit`](Self::commit) afterwards.
    pub fn apply(&self, spectrum: &[Complex32], result: &InferenceResult, out: &mut [Complex32]) -> Result<()> {
        debug_assert_eq!(spectrum.len(), self.bands.bins());
        debug_assert_eq!(out.len(), spectrum.len());
        check_shape("m", &self.mask_shape(), result.mask.shape())?;
        check_shape("coefs", &self.coefs_shape(), result.coefs.shape())?;

        let stages = Stages::select(self.gate.as_ref(), result.lsnr);
        out.copy_from_slice(spectrum);

        if stages.zero_mask {
            out.fill(Complex32::new(0.0, 0.0));
        } else if stages.mask {
            for (band, range) in self.bands.ranges().enumerate() {
                let gain = result.mask[[0, 0, 0, band]].clamp(0.0, 1.0);
                for c in &mut out[range] {
                    *c *= gain;
                }
            }
        }

        if stages.deep_filter {
            for (f, o) in out.iter_mut().enumerate().take(self.nb_df) {
                let mut acc = Complex32::new(0.0, 0.0);
                for tap in 0..self.df_order {
                    let age = self.df_order - 1 - tap;
                    let s = if age == 0 {
                        spectrum[f]
                    } else {
                        self.history.bin(age - 1, f)
                    };
                    let c = Complex32::new(
                        result.coefs[[0, 0, f, tap * 2]],
                        result.coefs[[0, 0, f, tap * 2 + 1]],
                    );
                    acc += s * c;
                }
                *o = acc;
            }
        }

        Ok(())
    }

    /// Record the pre-filter frame for the next frames' deep-filter taps.
    pub fn commit(&mut self, spectrum: &[Complex32]) {
        self.history.push(spectrum);
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }
}

pub(crate) fn check_shape(tensor: &str, expected: &[usize], actual: &[usize]) -> Result<()> {
    if expected != actual {
        return Err(DfError::Contract {
            tensor: tensor.to_string(),
            expected: expected.iter().map(|&d| d as i64).collect(),
            actual: actual.iter().map(|&d| d as i64).collect(),
        });
    }
    Ok(())
}
