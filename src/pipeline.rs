//! Frame-by-frame orchestration.
//!
//! For every hop of input, [`DeepFilterPipeline::process_block`] runs
//!
//! ```text
//! push ─► extract ─► normalize ─► encode ─► decode_mask ─► decode_coefs ─► apply ─► commit ─► pop
//! ```
//!
//! exactly once, and emits one hop of output delayed by `frame_size - hop_size` samples.

use std::path::Path;
use std::time::{Duration, Instant};

use num_complex::Complex32;

use crate::config::{DeadlinePolicy, PipelineConfig};
use crate::features::{FeatureExtractor, FeatureNorm, Features};
use crate::filter::{HistoryRing, SpectralFilter};
use crate::framer::Framer;
use crate::inference::{InferenceBackend, ModelContract};
use crate::onnx::OnnxInference;
use crate::{DfError, Result};

/// Silent blocks run by [`DeepFilterPipeline::warmup`].
const WARMUP_BLOCKS: usize = 3;

/// Lifecycle of a pipeline. Only moves forward until [`reset`](DeepFilterPipeline::reset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No block processed yet.
    Uninitialized,
    /// Output still contains the zero history the buffers started with.
    Warming { frames: usize },
    /// Every output sample depends only on real input.
    Steady,
}

/// Real-time accounting. Recoverable conditions are counted here, not returned.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RealtimeStats {
    pub frames: u64,
    /// Frames whose inference exceeded the deadline.
    pub deadline_misses: u64,
    /// Frames emitted unfiltered (late or non-finite inference).
    pub fallbacks: u64,
    /// Inference results containing NaN or infinity.
    pub non_finite_results: u64,
    pub max_inference: Duration,
    pub total_inference: Duration,
}

impl RealtimeStats {
    pub fn mean_inference(&self) -> Duration {
        if self.frames == 0 {
            Duration::ZERO
        } else {
            let nanos = self.total_inference.as_nanos() / u128::from(self.frames);
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

/// Streaming speech enhancement around an [`InferenceBackend`].
///
/// All per-frame buffers are allocated at construction; `process_block` does not
/// allocate unless the backend does.
pub struct DeepFilterPipeline<B: InferenceBackend> {
    config: PipelineConfig,
    backend: B,
    framer: Framer,
    extractor: FeatureExtractor,
    norm: Option<FeatureNorm>,
    filter: SpectralFilter,
    deadline: Duration,
    state: PipelineState,
    stats: RealtimeStats,
    features: Features,
    spectrum: Vec<Complex32>,
    enhanced: Vec<Complex32>,
}

impl<B: InferenceBackend> DeepFilterPipeline<B> {
    /// Build a pipeline, checking the configuration against the backend's contract.
    pub fn new(config: PipelineConfig, backend: B) -> Result<Self> {
        config.validate()?;
        let bands = config.erb_bands()?;
        let framer = Framer::new(
            config.frame_size,
            config.hop_size,
            config.analysis_window,
            config.synthesis_window,
        )?;

        let contract = backend.contract();
        check_contract(contract, "feat_erb", [1, 1, 1, config.nb_erb])?;
        check_contract(contract, "feat_spec", [1, 2, 1, config.nb_df])?;
        check_contract(contract, "m", [1, 1, 1, config.nb_erb])?;
        check_contract(contract, "coefs", [1, 1, config.nb_df, 2 * config.df_order])?;
        log::debug!("inference backend:\n{}", backend.describe());

        let extractor = FeatureExtractor::new(bands.clone(), config.nb_df);
        let norm = config
            .normalize_features
            .then(|| FeatureNorm::new(config.nb_erb, config.nb_df, config.norm_alpha));
        let filter = SpectralFilter::new(bands, config.nb_df, config.df_order, config.lsnr_gate);
        let bins = framer.bins();

        log::info!(
            "pipeline: {} Hz, frame {}, hop {}, {} ERB bands, {} DF bins x {} taps, latency {} samples",
            config.sample_rate,
            config.frame_size,
            config.hop_size,
            config.nb_erb,
            config.nb_df,
            config.df_order,
            framer.latency()
        );

        Ok(Self {
            deadline: config.deadline(),
            features: extractor.alloc(),
            spectrum: vec![Complex32::new(0.0, 0.0); bins],
            enhanced: vec![Complex32::new(0.0, 0.0); bins],
            config,
            backend,
            framer,
            extractor,
            norm,
            filter,
            state: PipelineState::Uninitialized,
            stats: RealtimeStats::default(),
        })
    }

    /// Process exactly one hop of input into one hop of output.
    ///
    /// On [`DfError::NonFinite`] the output block is zeroed and all signal history
    /// cleared; the pipeline can keep running.
    pub fn process_block(&mut self, input: &[f32], output: &mut [f32]) -> Result<()> {
        let hop = self.config.hop_size;
        if input.len() != hop {
            return Err(DfError::BlockSize { expected: hop, actual: input.len() });
        }
        if output.len() != hop {
            return Err(DfError::BlockSize { expected: hop, actual: output.len() });
        }

        self.framer.push(input, &mut self.spectrum)?;

        self.extractor.extract(&self.spectrum, &mut self.features);
        if let Some(norm) = self.norm.as_mut() {
            norm.normalize(&mut self.features);
        }

        let start = Instant::now();
        let result = self.backend.infer(&self.features.erb, &self.features.spec)?;
        let elapsed = start.elapsed();
        let late = self.record_inference(elapsed);

        let use_result = if !result.is_finite() {
            self.stats.non_finite_results += 1;
            self.stats.fallbacks += 1;
            if self.stats.non_finite_results == 1 {
                log::warn!("non-finite inference result, passing frame {} through", self.stats.frames);
            }
            false
        } else if late && self.config.deadline_policy == DeadlinePolicy::Passthrough {
            self.stats.fallbacks += 1;
            false
        } else {
            true
        };

        if use_result {
            self.filter.apply(&self.spectrum, &result, &mut self.enhanced)?;
        } else {
            self.enhanced.copy_from_slice(&self.spectrum);
        }
        self.filter.commit(&self.spectrum);

        self.framer.pop(&mut self.enhanced, output)?;
        self.advance();

        if output.iter().any(|x| !x.is_finite()) {
            output.fill(0.0);
            self.clear_history();
            return Err(DfError::NonFinite);
        }
        Ok(())
    }

    fn record_inference(&mut self, elapsed: Duration) -> bool {
        self.stats.frames += 1;
        self.stats.total_inference += elapsed;
        self.stats.max_inference = self.stats.max_inference.max(elapsed);

        let late = elapsed > self.deadline;
        if late {
            self.stats.deadline_misses += 1;
            if self.stats.deadline_misses == 1 {
                log::warn!(
                    "inference took {:?}, deadline is {:?} (frame {})",
                    elapsed,
                    self.deadline,
                    self.stats.frames
                );
            } else {
                log::debug!("deadline miss #{}: {:?}", self.stats.deadline_misses, elapsed);
            }
        }
        late
    }

    fn advance(&mut self) {
        let frames = match self.state {
            PipelineState::Uninitialized => 1,
            PipelineState::Warming { frames } => frames + 1,
            PipelineState::Steady => return,
        };
        self.state = if frames >= self.config.warmup_frames() {
            PipelineState::Steady
        } else {
            PipelineState::Warming { frames }
        };
    }

    /// Run a few silent blocks to wake up the backend, then reset.
    ///
    /// Accelerated backends often have significant first-inference latency.
    pub fn warmup(&mut self) -> Result<()> {
        let silence = vec![0.0f32; self.config.hop_size];
        let mut sink = vec![0.0f32; self.config.hop_size];
        for _ in 0..WARMUP_BLOCKS {
            self.process_block(&silence, &mut sink)?;
        }
        self.reset();
        Ok(())
    }

    /// Clear all signal history and statistics; the next block starts a new stream.
    pub fn reset(&mut self) {
        self.clear_history();
        self.state = PipelineState::Uninitialized;
        self.stats = RealtimeStats::default();
    }

    fn clear_history(&mut self) {
        self.framer.reset();
        self.filter.reset();
        if let Some(norm) = self.norm.as_mut() {
            norm.reset();
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stats(&self) -> &RealtimeStats {
        &self.stats
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Samples between input and output: `frame_size - hop_size`.
    pub fn latency_samples(&self) -> usize {
        self.framer.latency()
    }

    pub fn hop_size(&self) -> usize {
        self.config.hop_size
    }

    /// Pre-filter frames held for the deep-filter taps.
    pub fn history(&self) -> &HistoryRing {
        self.filter.history()
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }
}

impl DeepFilterPipeline<OnnxInference> {
    /// Load `enc.onnx`, `erb_dec.onnx`, `df_dec.onnx` and `config.ini` from `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let config = PipelineConfig::from_model_dir(model_dir)?;
        let contract = ModelContract::with_sizes(config.nb_erb, config.nb_df, config.df_order);
        let backend = OnnxInference::with_contract(model_dir, contract, Some(2))?;
        Self::new(config, backend)
    }
}

fn check_contract(contract: &ModelContract, name: &str, configured: [usize; 4]) -> Result<()> {
    let configured: Vec<i64> = configured.iter().map(|&d| d as i64).collect();
    match contract.tensor(name) {
        Some(spec) if spec.accepts(&configured) => Ok(()),
        Some(spec) => Err(DfError::Contract {
            tensor: name.to_string(),
            expected: spec.shape.clone(),
            actual: configured,
        }),
        None => Err(DfError::Config(format!("inference contract declares no '{}' tensor", name))),
    }
}

/// Streaming wrapper accepting any number of samples per call.
///
/// ```ignore
/// let mut stream = DeepFilterStream::from_model_dir(Path::new("models/dfn3"))?;
/// stream.warmup()?;
///
/// let enhanced = stream.process(&audio_chunk)?;
/// let remaining = stream.flush()?;
/// ```
pub struct DeepFilterStream<B: InferenceBackend> {
    pipeline: DeepFilterPipeline<B>,
    input_buffer: Vec<f32>,
    frame: Vec<f32>,
    block: Vec<f32>,
}

impl<B: InferenceBackend> DeepFilterStream<B> {
    pub fn new(pipeline: DeepFilterPipeline<B>) -> Self {
        let hop = pipeline.hop_size();
        Self {
            pipeline,
            input_buffer: Vec::with_capacity(hop * 2),
            frame: vec![0.0; hop],
            block: vec![0.0; hop],
        }
    }

    pub fn warmup(&mut self) -> Result<()> {
        self.pipeline.warmup()
    }

    /// Process samples. Output holds whole hops only; remaining input stays
    /// buffered until the next call or [`flush`](Self::flush).
    ///
    /// Each hop leaves the buffer before it is processed. After an error the
    /// failed hop is gone and any later hops are still buffered.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        let hop = self.pipeline.hop_size();
        self.input_buffer.extend_from_slice(input);
        let mut output = Vec::with_capacity(self.input_buffer.len() / hop * hop);

        while self.input_buffer.len() >= hop {
            self.frame.copy_from_slice(&self.input_buffer[..hop]);
            self.input_buffer.drain(..hop);
            self.pipeline.process_block(&self.frame, &mut self.block)?;
            output.extend_from_slice(&self.block);
        }

        Ok(output)
    }

    /// Zero-pad and process the buffered remainder, returning only its valid samples.
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let mut output = self.process(&[])?;
        if self.input_buffer.is_empty() {
            return Ok(output);
        }
        let valid_len = self.input_buffer.len();
        self.frame.fill(0.0);
        self.frame[..valid_len].copy_from_slice(&self.input_buffer);
        self.input_buffer.clear();
        self.pipeline.process_block(&self.frame, &mut self.block)?;
        output.extend_from_slice(&self.block[..valid_len]);
        Ok(output)
    }

    /// Reset pipeline state and clear buffers.
    pub fn reset(&mut self) {
        self.pipeline.reset();
        self.input_buffer.clear();
    }

    /// Algorithmic latency in milliseconds.
    pub fn latency_ms(&self) -> f32 {
        self.pipeline.latency_samples() as f32 / self.pipeline.config().sample_rate as f32 * 1000.0
    }

    pub fn pipeline(&self) -> &DeepFilterPipeline<B> {
        &self.pipeline
    }

    pub fn pipeline_mut(&mut self) -> &mut DeepFilterPipeline<B> {
        &mut self.pipeline
    }
}

impl DeepFilterStream<OnnxInference> {
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        Ok(Self::new(DeepFilterPipeline::from_model_dir(model_dir)?))
    }
}
