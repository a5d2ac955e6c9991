//! # deepfilter-pipeline
//!
//! Real-time spectral speech enhancement around DeepFilterNet-style inference.
//!
//! The crate implements everything around the neural network: STFT framing with
//! overlap-add resynthesis, ERB and complex feature extraction, and the two-stage
//! filter (ERB gain mask, then deep filtering of the low-frequency bins over the
//! last few frames). The network itself sits behind the [`InferenceBackend`] trait;
//! [`OnnxInference`] runs the exported DeepFilterNet3 encoder and decoders with
//! ONNX Runtime.
//!
//! ## Quick Start
//!
//! Use [`DeepFilterStream`] for the simplest API - it handles buffering internally:
//!
//! ```ignore
//! use deepfilter_pipeline::DeepFilterStream;
//!
//! let mut stream = DeepFilterStream::from_model_dir(Path::new("models/dfn3"))?;
//! stream.warmup()?;
//!
//! // Process any length of audio (48kHz mono f32)
//! let enhanced = stream.process(&input_samples)?;
//! let tail = stream.flush()?;
//! ```
//!
//! ## API Levels
//!
//! - [`DeepFilterStream`] - Streaming API. Pass any number of samples.
//! - [`DeepFilterPipeline`] - Block API for audio callbacks. Exactly `hop_size`
//!   samples in, `hop_size` samples out, `frame_size - hop_size` samples of delay.
//! - [`Framer`], [`FeatureExtractor`], [`SpectralFilter`] - the individual stages.
//!
//! ## Processing
//!
//! ```text
//! audio ─► Framer::push ─► spectrum ─► FeatureExtractor ─► FeatureNorm ─► feat_erb, feat_spec
//!                             │                                               │
//!                             │                                  InferenceBackend (enc, erb_dec, df_dec)
//!                             ▼                                               │
//!                      SpectralFilter::apply ◄──────────── mask m, coefs ─────┘
//!                             │
//!                             ▼
//!                       Framer::pop ─► audio
//! ```
//!
//! Defaults: 48 kHz, 1024-sample Vorbis-windowed frames, 512-sample hop, 32 ERB
//! bands, 96 deep-filtered bins, 5 complex taps. A model's `config.ini` overrides
//! the band sizes ([`PipelineConfig::from_model_dir`]).
//!
//! ## Real-time Behaviour
//!
//! Inference is timed on every frame. A frame slower than one hop period counts as
//! a deadline miss in [`RealtimeStats`]; [`DeadlinePolicy`] decides whether the late
//! result is applied or the frame passes through unfiltered. Non-finite inference
//! results always pass through. Output blocks are never allowed to carry NaN.
//!
//! ## Hardware Acceleration
//!
//! Enable via Cargo features:
//!
//! ```toml
//! # iOS/macOS (CoreML)
//! deepfilter-pipeline = { path = "...", features = ["coreml"] }
//!
//! # NVIDIA GPU (CUDA)
//! deepfilter-pipeline = { path = "...", features = ["cuda"] }
//! ```
//!
//! ## Logging
//!
//! This crate uses the `log` crate for debug/info messages. Install any logger
//! in your application to see them.
//!
//! ## Thread Safety
//!
//! Each pipeline instance is independent and `Send`. Create separate instances
//! for parallel processing - they do not share state.

pub mod config;
pub mod erb;
pub mod features;
pub mod filter;
pub mod framer;
pub mod inference;
pub mod onnx;
pub mod pipeline;
pub mod transform;

use thiserror::Error;

pub use config::{DeadlinePolicy, PipelineConfig};
pub use erb::ErbBands;
pub use features::{FeatureExtractor, FeatureNorm, Features};
pub use filter::{HistoryRing, LsnrGate, SpectralFilter};
pub use framer::Framer;
pub use inference::{Encoded, InferenceBackend, InferenceResult, ModelContract, Passthrough, TensorSpec};
pub use onnx::OnnxInference;
pub use pipeline::{DeepFilterPipeline, DeepFilterStream, PipelineState, RealtimeStats};
pub use transform::{Transform, WindowType};

pub const SAMPLE_RATE: usize = 48000;
pub const FRAME_SIZE: usize = 1024;
pub const HOP_SIZE: usize = 512;
pub const NB_ERB: usize = 32;
pub const NB_DF: usize = 96;
pub const DF_ORDER: usize = 5;
pub const MIN_NB_ERB_FREQS: usize = 2;
pub const DEFAULT_NORM_ALPHA: f32 = 0.99;
// Match DeepFilterNet CLI defaults (enhance_wav.rs)
pub const MIN_DB_THRESH: f32 = -15.0;
pub const MAX_DB_ERB_THRESH: f32 = 35.0;
pub const MAX_DB_DF_THRESH: f32 = 35.0;

#[derive(Error, Debug)]
pub enum DfError {
    #[error("ONNX runtime error: {0}")]
    Onnx(#[from] ort::Error),
    #[error("Shape error: {0}")]
    Shape(#[from] ndarray::ShapeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("FFT error: {0}")]
    Fft(#[from] realfft::FftError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Tensor '{tensor}' has shape {actual:?}, contract declares {expected:?}")]
    Contract {
        tensor: String,
        expected: Vec<i64>,
        actual: Vec<i64>,
    },
    #[error("Block of {actual} samples, expected {expected}")]
    BlockSize { expected: usize, actual: usize },
    #[error("Output contains NaN or infinity")]
    NonFinite,
}

pub type Result<T> = std::result::Result<T, DfError>;

// Verify that pipelines can be sent between threads
// This is a compile-time check - if it compiles, the types are Send
fn _assert_send<T: Send>() {}
fn _assert_pipeline_is_send() {
    _assert_send::<DeepFilterPipeline<OnnxInference>>();
    _assert_send::<DeepFilterStream<OnnxInference>>();
    _assert_send::<DeepFilterPipeline<Passthrough>>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(FRAME_SIZE / 2 + 1, 513);
        assert_eq!(FRAME_SIZE % HOP_SIZE, 0);
        assert!(NB_DF < FRAME_SIZE / 2 + 1);
        assert_eq!(ModelContract::deepfilternet3(), ModelContract::with_sizes(NB_ERB, NB_DF, DF_ORDER));
    }

    #[test]
    fn test_error_messages() {
        let e = DfError::Contract {
            tensor: "coefs".to_string(),
            expected: vec![1, 1, 96, 10],
            actual: vec![1, 1, 96, 8],
        };
        assert_eq!(
            e.to_string(),
            "Tensor 'coefs' has shape [1, 1, 96, 8], contract declares [1, 1, 96, 10]"
        );
        let e = DfError::BlockSize { expected: 512, actual: 480 };
        assert_eq!(e.to_string(), "Block of 480 samples, expected 512");
    }
}
