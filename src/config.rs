//! Pipeline configuration.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::erb::ErbBands;
use crate::filter::LsnrGate;
use crate::transform::WindowType;
use crate::{
    DfError, Result, DEFAULT_NORM_ALPHA, DF_ORDER, FRAME_SIZE, HOP_SIZE, MIN_NB_ERB_FREQS, NB_DF, NB_ERB,
    SAMPLE_RATE,
};

/// What to emit when inference overruns its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeadlinePolicy {
    /// Apply the late result anyway.
    #[default]
    UseLate,
    /// Emit the unfiltered frame.
    Passthrough,
}

/// Sizes and policies of a [`DeepFilterPipeline`](crate::DeepFilterPipeline).
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub sample_rate: usize,
    pub frame_size: usize,
    pub hop_size: usize,
    /// ERB bands (B).
    pub nb_erb: usize,
    /// Deep-filtered low-frequency bins (F).
    pub nb_df: usize,
    /// Complex deep-filter taps (K).
    pub df_order: usize,
    /// Minimum bins per ERB band.
    pub min_nb_erb_freqs: usize,
    pub analysis_window: WindowType,
    pub synthesis_window: WindowType,
    /// Run [`FeatureNorm`](crate::FeatureNorm) on extracted features.
    pub normalize_features: bool,
    pub norm_alpha: f32,
    pub lsnr_gate: Option<LsnrGate>,
    pub deadline_policy: DeadlinePolicy,
    /// Inference time budget per frame. `None` means one hop period.
    pub deadline: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            hop_size: HOP_SIZE,
            nb_erb: NB_ERB,
            nb_df: NB_DF,
            df_order: DF_ORDER,
            min_nb_erb_freqs: MIN_NB_ERB_FREQS,
            analysis_window: WindowType::Vorbis,
            synthesis_window: WindowType::Vorbis,
            normalize_features: true,
            norm_alpha: DEFAULT_NORM_ALPHA,
            lsnr_gate: None,
            deadline_policy: DeadlinePolicy::UseLate,
            deadline: None,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by the model's `config.ini`, if present.
    ///
    /// Recognised keys: `nb_erb`, `nb_df`, `df_order`, `min_nb_erb_freqs`, `norm_tau`.
    /// A missing file leaves the defaults; unparsable values are ignored.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let config_path = model_dir.join("config.ini");
        if !config_path.exists() {
            log::debug!("{} not found, using defaults", config_path.display());
            return Ok(Self::default());
        }
        let content = fs::read_to_string(&config_path)?;
        Ok(Self::default().with_ini(&content))
    }

    /// Apply `config.ini` content over this configuration.
    pub fn with_ini(mut self, content: &str) -> Self {
        let params = parse_ini(content);
        let get = |key: &str| params.get(key).and_then(|s| s.parse::<usize>().ok());

        if let Some(v) = get("nb_erb") {
            self.nb_erb = v;
        }
        if let Some(v) = get("nb_df") {
            self.nb_df = v;
        }
        if let Some(v) = get("df_order") {
            self.df_order = v;
        }
        if let Some(v) = get("min_nb_erb_freqs") {
            self.min_nb_erb_freqs = v;
        }
        if let Some(tau) = params.get("norm_tau").and_then(|s| s.parse::<f32>().ok()) {
            self.norm_alpha = norm_alpha(self.hop_size, self.sample_rate, tau);
        }
        self
    }

    pub fn with_frame(mut self, frame_size: usize, hop_size: usize) -> Self {
        self.frame_size = frame_size;
        self.hop_size = hop_size;
        self
    }

    pub fn with_sample_rate(mut self, sample_rate: usize) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn with_bands(mut self, nb_erb: usize, nb_df: usize, df_order: usize) -> Self {
        self.nb_erb = nb_erb;
        self.nb_df = nb_df;
        self.df_order = df_order;
        self
    }

    pub fn with_windows(mut self, analysis: WindowType, synthesis: WindowType) -> Self {
        self.analysis_window = analysis;
        self.synthesis_window = synthesis;
        self
    }

    pub fn with_normalization(mut self, enabled: bool) -> Self {
        self.normalize_features = enabled;
        self
    }

    pub fn with_lsnr_gate(mut self, gate: Option<LsnrGate>) -> Self {
        self.lsnr_gate = gate;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>, policy: DeadlinePolicy) -> Self {
        self.deadline = deadline;
        self.deadline_policy = policy;
        self
    }

    /// Number of spectral bins per frame.
    pub fn bins(&self) -> usize {
        self.frame_size / 2 + 1
    }

    /// Frames before the overlap-add output carries only real input.
    pub fn warmup_frames(&self) -> usize {
        self.frame_size / self.hop_size.max(1)
    }

    /// Duration of one hop, the default inference deadline.
    pub fn hop_duration(&self) -> Duration {
        Duration::from_secs_f64(self.hop_size as f64 / self.sample_rate as f64)
    }

    pub fn deadline(&self) -> Duration {
        self.deadline.unwrap_or_else(|| self.hop_duration())
    }

    /// Check sizes for consistency. Window overlap-add is checked by the framer.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(DfError::Config("sample rate must be positive".to_string()));
        }
        if self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(DfError::Config(format!(
                "hop size {} must be in 1..={}",
                self.hop_size, self.frame_size
            )));
        }
        if self.frame_size % self.hop_size != 0 {
            return Err(DfError::Config(format!(
                "frame size {} is not a multiple of hop size {}",
                self.frame_size, self.hop_size
            )));
        }
        if self.nb_erb == 0 || self.nb_erb > self.bins() {
            return Err(DfError::Config(format!(
                "{} ERB bands do not fit {} bins",
                self.nb_erb,
                self.bins()
            )));
        }
        if self.nb_df > self.bins() {
            return Err(DfError::Config(format!(
                "{} deep-filter bins exceed {} spectral bins",
                self.nb_df,
                self.bins()
            )));
        }
        if self.df_order == 0 {
            return Err(DfError::Config("df_order must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.norm_alpha) {
            return Err(DfError::Config(format!("norm_alpha {} not in [0, 1)", self.norm_alpha)));
        }
        Ok(())
    }

    /// Band layout for these sizes.
    pub fn erb_bands(&self) -> Result<ErbBands> {
        ErbBands::new(self.sample_rate, self.frame_size, self.nb_erb, self.min_nb_erb_freqs)
    }
}

/// Normalisation decay for time constant `tau` (seconds), rounded to the fewest
/// decimals (at least three) that keep it below one.
pub fn norm_alpha(hop_size: usize, sample_rate: usize, tau: f32) -> f32 {
    let dt = hop_size as f32 / sample_rate as f32;
    let a = f32::exp(-dt / tau);
    let mut precision: i32 = 3;
    let mut rounded = 1.0f32;
    while rounded >= 1.0 {
        let scale = 10f32.powi(precision);
        rounded = (a * scale).round() / scale;
        precision += 1;
    }
    rounded
}

/// Simple INI parser
fn parse_ini(content: &str) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') || line.starts_with('#') || line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            map.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    const DFN3_INI: &str = "\
[deepfilternet]
nb_erb = 32
nb_df = 96
df_order = 5
# comment
min_nb_erb_freqs = 2

[df]
norm_tau = 1
sr = 48000
";

    #[test]
    fn test_defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.bins(), 513);
        assert_eq!(config.warmup_frames(), 2);
        assert_eq!(config.deadline(), Duration::from_secs_f64(512.0 / 48000.0));
    }

    #[test]
    fn test_parse_ini_skips_sections_and_comments() {
        let params = parse_ini(DFN3_INI);
        assert_eq!(params.get("nb_df").map(String::as_str), Some("96"));
        assert_eq!(params.get("norm_tau").map(String::as_str), Some("1"));
        assert!(!params.contains_key("[df]"));
        assert!(!params.keys().any(|k| k.starts_with('#')));
    }

    #[test]
    fn test_with_ini_overrides() {
        let config = PipelineConfig::default()
            .with_bands(16, 48, 3)
            .with_ini("nb_erb = 24\nnb_df = oops\nnorm_tau = 1\n");
        assert_eq!(config.nb_erb, 24);
        assert_eq!(config.nb_df, 48);
        assert_eq!(config.df_order, 3);
        assert_eq!(config.norm_alpha, norm_alpha(512, 48000, 1.0));
    }

    #[test]
    fn test_norm_alpha_rounding() {
        // exp(-0.01) = 0.99005 -> 0.99
        assert_eq!(norm_alpha(480, 48000, 1.0), 0.99);
        // exp(-0.0001) rounds to 1.0 at three decimals, needs more precision
        let a = norm_alpha(48, 48000, 10.0);
        assert!(a < 1.0 && a > 0.9998, "{}", a);
    }

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = std::env::temp_dir().join("deepfilter-pipeline-no-config");
        let config = PipelineConfig::from_model_dir(&dir).unwrap();
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_sizes() {
        assert!(PipelineConfig::default().with_frame(1024, 0).validate().is_err());
        assert!(PipelineConfig::default().with_frame(1024, 384).validate().is_err());
        assert!(PipelineConfig::default().with_frame(512, 1024).validate().is_err());
        assert!(PipelineConfig::default().with_bands(32, 600, 5).validate().is_err());
        assert!(PipelineConfig::default().with_bands(32, 96, 0).validate().is_err());
        assert!(PipelineConfig::default().with_bands(0, 96, 5).validate().is_err());
    }
}
