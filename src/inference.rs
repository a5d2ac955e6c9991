//! Contract between the pipeline and the external inference stage.
//!
//! The model is three tensor transforms run in order once per frame:
//!
//! ```text
//! feat_erb, feat_spec ──► encoder ──► e0 e1 e2 e3 c0 emb [lsnr]
//!                 e0 e1 e2 e3 emb ──► mask decoder ──► m
//!                          c0 emb ──► coefficient decoder ──► coefs
//! ```
//!
//! Every tensor has a fixed declared shape ([`ModelContract`]). The pipeline checks
//! its own configuration against the contract once at construction and every
//! decoder result against it per frame.

use std::fmt;

use ndarray::{Array4, ArrayD, IxDyn};

use crate::Result;

/// Name and declared shape of one tensor. Negative dimensions are dynamic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub name: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    pub fn new(name: &str, shape: &[i64]) -> Self {
        Self {
            name: name.to_string(),
            shape: shape.to_vec(),
        }
    }

    /// Whether `dims` fits this declaration (dynamic axes match any size).
    pub fn accepts(&self, dims: &[i64]) -> bool {
        self.shape.len() == dims.len()
            && self
                .shape
                .iter()
                .zip(dims.iter())
                .all(|(&declared, &actual)| declared < 0 || actual < 0 || declared == actual)
    }

    /// Concrete dimensions, with dynamic axes resolved to 1.
    pub fn dims(&self) -> Vec<usize> {
        self.shape.iter().map(|&d| if d < 0 { 1 } else { d as usize }).collect()
    }
}

impl fmt::Display for TensorSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} float {}", self.name, format_shape(&self.shape))
    }
}

/// Formats a shape as `(1,2,*,96)`.
pub fn format_shape(shape: &[i64]) -> String {
    let dims: Vec<String> = shape
        .iter()
        .map(|&d| if d < 0 { "*".to_string() } else { d.to_string() })
        .collect();
    format!("({})", dims.join(","))
}

/// Declared inputs and outputs of one transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageContract {
    pub name: String,
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

impl StageContract {
    pub fn tensor(&self, name: &str) -> Option<&TensorSpec> {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .find(|t| t.name == name)
    }
}

impl fmt::Display for StageContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} inputs", self.name)?;
        for (i, t) in self.inputs.iter().enumerate() {
            writeln!(f, "{}) {}", i + 1, t)?;
        }
        writeln!(f, "{} outputs", self.name)?;
        for (i, t) in self.outputs.iter().enumerate() {
            writeln!(f, "{}) {}", i + 1, t)?;
        }
        Ok(())
    }
}

/// Declared tensor shapes of the three-stage model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelContract {
    pub encoder: StageContract,
    pub mask_decoder: StageContract,
    pub coefs_decoder: StageContract,
}

impl ModelContract {
    /// DeepFilterNet3 export: 32 ERB bands, 96 DF bins, 5 complex taps.
    pub fn deepfilternet3() -> Self {
        Self::with_sizes(32, 96, 5)
    }

    /// DeepFilterNet3 layer widths with custom feature sizes.
    pub fn with_sizes(nb_erb: usize, nb_df: usize, df_order: usize) -> Self {
        let nb_erb = nb_erb as i64;
        let nb_df = nb_df as i64;
        let df_order = df_order as i64;
        let e0 = TensorSpec::new("e0", &[1, 64, 1, nb_erb]);
        let e1 = TensorSpec::new("e1", &[1, 64, 1, nb_erb / 2]);
        let e2 = TensorSpec::new("e2", &[1, 64, 1, nb_erb / 4]);
        let e3 = TensorSpec::new("e3", &[1, 64, 1, nb_erb / 4]);
        let c0 = TensorSpec::new("c0", &[1, 64, 1, nb_df]);
        let emb = TensorSpec::new("emb", &[1, 1, 512]);

        Self {
            encoder: StageContract {
                name: "enc".to_string(),
                inputs: vec![
                    TensorSpec::new("feat_erb", &[1, 1, 1, nb_erb]),
                    TensorSpec::new("feat_spec", &[1, 2, 1, nb_df]),
                ],
                outputs: vec![
                    e0.clone(),
                    e1.clone(),
                    e2.clone(),
                    e3.clone(),
                    c0.clone(),
                    emb.clone(),
                ],
            },
            mask_decoder: StageContract {
                name: "erb_dec".to_string(),
                inputs: vec![e0, e1, e2, e3, emb.clone()],
                outputs: vec![TensorSpec::new("m", &[1, 1, 1, nb_erb])],
            },
            coefs_decoder: StageContract {
                name: "df_dec".to_string(),
                inputs: vec![c0, emb],
                outputs: vec![TensorSpec::new("coefs", &[1, 1, nb_df, 2 * df_order])],
            },
        }
    }

    /// Look up a tensor declaration by name across all stages.
    pub fn tensor(&self, name: &str) -> Option<&TensorSpec> {
        self.stages().into_iter().find_map(|s| s.tensor(name))
    }

    pub fn stages(&self) -> [&StageContract; 3] {
        [&self.encoder, &self.mask_decoder, &self.coefs_decoder]
    }
}

impl fmt::Display for ModelContract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for stage in self.stages() {
            write!(f, "{}", stage)?;
        }
        Ok(())
    }
}

/// Encoder outputs shared by both decoders.
#[derive(Debug, Clone)]
pub struct Encoded {
    /// Skip connections `e0..e3` for the mask decoder.
    pub e: [ArrayD<f32>; 4],
    /// Skip connection for the coefficient decoder.
    pub c0: ArrayD<f32>,
    /// Shared embedding.
    pub emb: ArrayD<f32>,
    /// Local SNR estimate in dB, if the model exports one.
    pub lsnr: Option<f32>,
}

impl Encoded {
    /// Zero tensors of the shapes the contract declares for the encoder outputs.
    pub fn zeros(contract: &ModelContract) -> Self {
        let zeros = |name: &str| -> ArrayD<f32> {
            let dims = contract.tensor(name).map(TensorSpec::dims).unwrap_or_default();
            ArrayD::zeros(IxDyn(&dims))
        };
        Self {
            e: [zeros("e0"), zeros("e1"), zeros("e2"), zeros("e3")],
            c0: zeros("c0"),
            emb: zeros("emb"),
            lsnr: None,
        }
    }
}

/// Decoder outputs for one frame.
#[derive(Debug, Clone)]
pub struct InferenceResult {
    /// ERB gains `[1, 1, 1, nb_erb]`.
    pub mask: Array4<f32>,
    /// Deep-filter coefficients `[1, 1, nb_df, 2 * df_order]`, (re, im) per tap, oldest frame first.
    pub coefs: Array4<f32>,
    /// Local SNR from the encoder.
    pub lsnr: Option<f32>,
}

impl InferenceResult {
    /// Whether every mask and coefficient value is finite.
    pub fn is_finite(&self) -> bool {
        self.mask.iter().chain(self.coefs.iter()).all(|x| x.is_finite())
    }
}

/// External inference stage.
///
/// Each call must complete within one hop period for real-time operation; the
/// pipeline measures but never interrupts it.
pub trait InferenceBackend {
    /// Declared tensor shapes.
    fn contract(&self) -> &ModelContract;

    /// Encoder: features to intermediate tensors and embedding.
    fn encode(&mut self, feat_erb: &Array4<f32>, feat_spec: &Array4<f32>) -> Result<Encoded>;

    /// Mask decoder: `e0..e3`, `emb` to the ERB mask `m`.
    fn decode_mask(&mut self, encoded: &Encoded) -> Result<Array4<f32>>;

    /// Coefficient decoder: `c0`, `emb` to deep-filter `coefs`.
    fn decode_coefs(&mut self, encoded: &Encoded) -> Result<Array4<f32>>;

    /// Human-readable listing of declared inputs and outputs.
    fn describe(&self) -> String {
        self.contract().to_string()
    }

    /// Run all three transforms in order.
    fn infer(&mut self, feat_erb: &Array4<f32>, feat_spec: &Array4<f32>) -> Result<InferenceResult> {
        let encoded = self.encode(feat_erb, feat_spec)?;
        let mask = self.decode_mask(&encoded)?;
        let coefs = self.decode_coefs(&encoded)?;
        Ok(InferenceResult {
            mask,
            coefs,
            lsnr: encoded.lsnr,
        })
    }
}

/// Backend that leaves the spectrum untouched: unit mask, identity on the current-frame tap.
///
/// Useful for bypass and for measuring the pipeline without a model.
pub struct Passthrough {
    contract: ModelContract,
}

impl Passthrough {
    pub fn new(contract: ModelContract) -> Self {
        Self { contract }
    }

    fn output_dims(&self, name: &str) -> [usize; 4] {
        let mut dims = [1usize; 4];
        if let Some(spec) = self.contract.tensor(name) {
            for (d, v) in dims.iter_mut().zip(spec.dims()) {
                *d = v;
            }
        }
        dims
    }
}

impl Default for Passthrough {
    fn default() -> Self {
        Self::new(ModelContract::deepfilternet3())
    }
}

impl InferenceBackend for Passthrough {
    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn encode(&mut self, _feat_erb: &Array4<f32>, _feat_spec: &Array4<f32>) -> Result<Encoded> {
        Ok(Encoded::zeros(&self.contract))
    }

    fn decode_mask(&mut self, _encoded: &Encoded) -> Result<Array4<f32>> {
        Ok(Array4::ones(self.output_dims("m")))
    }

    fn decode_coefs(&mut self, _encoded: &Encoded) -> Result<Array4<f32>> {
        let dims = self.output_dims("coefs");
        let mut coefs = Array4::zeros(dims);
        // Last (re, im) pair is the current frame
        let current = dims[3].saturating_sub(2);
        for f in 0..dims[2] {
            coefs[[0, 0, f, current]] = 1.0;
        }
        Ok(coefs)
    }
}
