//! [`InferenceBackend`] over three ONNX Runtime sessions.
//!
//! The model directory should contain `enc.onnx`, `erb_dec.onnx` and `df_dec.onnx`
//! and optionally `config.ini`. The ONNX Runtime shared library is loaded
//! dynamically on first use.

use std::path::Path;
use std::sync::OnceLock;

use ndarray::{Array4, ArrayD, IxDyn};
use ort::session::{builder::GraphOptimizationLevel, Session, SessionOutputs};
use ort::tensor::TensorElementType;
use ort::value::{DynValue, Tensor, ValueType};

use crate::config::PipelineConfig;
use crate::inference::{format_shape, Encoded, InferenceBackend, ModelContract, StageContract};
use crate::{DfError, Result};

pub const ENCODER_FILE: &str = "enc.onnx";
pub const MASK_DECODER_FILE: &str = "erb_dec.onnx";
pub const COEFS_DECODER_FILE: &str = "df_dec.onnx";

static ORT_INIT: OnceLock<std::result::Result<(), String>> = OnceLock::new();

fn init_ort() -> Result<()> {
    let status = ORT_INIT.get_or_init(|| {
        #[cfg(target_os = "android")]
        let lib_name = "libonnxruntime.so";

        #[cfg(target_os = "windows")]
        let lib_name = "onnxruntime";

        #[cfg(all(not(target_os = "android"), not(target_os = "windows")))]
        let lib_name = "libonnxruntime";

        match ort::init_from(lib_name) {
            Ok(builder) => {
                let _ = builder.with_name("deepfilter-pipeline").commit();
                Ok(())
            }
            Err(e) => Err(format!("Failed to load ONNX Runtime from '{}': {}", lib_name, e)),
        }
    });
    status.clone().map_err(DfError::Config)
}

/// DeepFilterNet encoder and decoders run with ONNX Runtime.
pub struct OnnxInference {
    encoder: Session,
    mask_decoder: Session,
    coefs_decoder: Session,
    contract: ModelContract,
    description: String,
}

impl OnnxInference {
    /// Load the sessions from `model_dir`, sizing the contract from its `config.ini`.
    pub fn new(model_dir: &Path) -> Result<Self> {
        let config = PipelineConfig::from_model_dir(model_dir)?;
        let contract = ModelContract::with_sizes(config.nb_erb, config.nb_df, config.df_order);
        Self::with_contract(model_dir, contract, Some(2))
    }

    /// Load with explicit intra-op thread count.
    ///
    /// - For real-time audio: use 1-2 to minimize latency variance
    /// - For batch/offline: use 4+ for throughput
    pub fn with_threads(model_dir: &Path, intra_threads: usize) -> Result<Self> {
        let config = PipelineConfig::from_model_dir(model_dir)?;
        let contract = ModelContract::with_sizes(config.nb_erb, config.nb_df, config.df_order);
        Self::with_contract(model_dir, contract, Some(intra_threads))
    }

    /// Load and validate every session against `contract`.
    pub fn with_contract(model_dir: &Path, contract: ModelContract, intra_threads: Option<usize>) -> Result<Self> {
        init_ort()?;

        let encoder = build_session(&model_dir.join(ENCODER_FILE), intra_threads)?;
        let mask_decoder = build_session(&model_dir.join(MASK_DECODER_FILE), intra_threads)?;
        let coefs_decoder = build_session(&model_dir.join(COEFS_DECODER_FILE), intra_threads)?;

        validate_session(&encoder, &contract.encoder)?;
        validate_session(&mask_decoder, &contract.mask_decoder)?;
        validate_session(&coefs_decoder, &contract.coefs_decoder)?;

        log::info!("loaded DeepFilterNet sessions from {}", model_dir.display());

        let mut backend = Self {
            encoder,
            mask_decoder,
            coefs_decoder,
            contract,
            description: String::new(),
        };
        backend.description = backend.run_once()?;
        log::debug!("tensors (declared -> inferred):\n{}", backend.description);
        Ok(backend)
    }

    /// Run every session once on zeros (dynamic dims as 1) and list each tensor's
    /// declared shape next to the shape actually seen.
    fn run_once(&mut self) -> Result<String> {
        let stages = [
            (&mut self.encoder, &self.contract.encoder),
            (&mut self.mask_decoder, &self.contract.mask_decoder),
            (&mut self.coefs_decoder, &self.contract.coefs_decoder),
        ];
        let mut text = String::new();
        for (session, stage) in stages {
            let inferred = infer_shapes(session, stage)?;
            text.push_str(&describe_session(&stage.name, session, &inferred));
        }
        Ok(text)
    }
}

impl InferenceBackend for OnnxInference {
    fn contract(&self) -> &ModelContract {
        &self.contract
    }

    fn encode(&mut self, feat_erb: &Array4<f32>, feat_spec: &Array4<f32>) -> Result<Encoded> {
        let (a, b, c, d) = feat_erb.dim();
        let erb = Tensor::from_array(([a, b, c, d], feat_erb.iter().copied().collect::<Vec<f32>>()))?;
        let (a, b, c, d) = feat_spec.dim();
        let spec = Tensor::from_array(([a, b, c, d], feat_spec.iter().copied().collect::<Vec<f32>>()))?;
        let outputs = self.encoder.run(ort::inputs![
            "feat_erb" => erb,
            "feat_spec" => spec,
        ])?;

        let lsnr = match outputs.get("lsnr") {
            Some(value) => {
                let (_shape, data) = value.try_extract_tensor::<f32>()?;
                data.first().copied()
            }
            None => None,
        };

        Ok(Encoded {
            e: [
                extract_dyn(&outputs, "e0")?,
                extract_dyn(&outputs, "e1")?,
                extract_dyn(&outputs, "e2")?,
                extract_dyn(&outputs, "e3")?,
            ],
            c0: extract_dyn(&outputs, "c0")?,
            emb: extract_dyn(&outputs, "emb")?,
            lsnr,
        })
    }

    fn decode_mask(&mut self, encoded: &Encoded) -> Result<Array4<f32>> {
        let inputs: Vec<(&str, DynValue)> = vec![
            ("emb", to_value(&encoded.emb)?),
            ("e3", to_value(&encoded.e[3])?),
            ("e2", to_value(&encoded.e[2])?),
            ("e1", to_value(&encoded.e[1])?),
            ("e0", to_value(&encoded.e[0])?),
        ];
        let outputs = self.mask_decoder.run(inputs)?;
        extract_4d(&outputs, "m")
    }

    fn decode_coefs(&mut self, encoded: &Encoded) -> Result<Array4<f32>> {
        let inputs: Vec<(&str, DynValue)> = vec![
            ("emb", to_value(&encoded.emb)?),
            ("c0", to_value(&encoded.c0)?),
        ];
        let outputs = self.coefs_decoder.run(inputs)?;
        extract_4d(&outputs, "coefs")
    }

    fn describe(&self) -> String {
        self.description.clone()
    }
}

fn build_session(path: &Path, intra_threads: Option<usize>) -> Result<Session> {
    if !path.exists() {
        return Err(DfError::Config(format!("model file not found: {}", path.display())));
    }

    let mut builder = Session::builder()?.with_optimization_level(GraphOptimizationLevel::Level3)?;

    if let Some(threads) = intra_threads {
        builder = builder.with_intra_threads(threads)?;
    }

    #[cfg(feature = "coreml")]
    {
        use ort::execution_providers::CoreMLExecutionProvider;
        builder = builder.with_execution_providers([CoreMLExecutionProvider::default().build()])?;
        log::info!("CoreML execution provider registered");
    }

    #[cfg(feature = "cuda")]
    {
        use ort::execution_providers::CUDAExecutionProvider;
        builder = builder.with_execution_providers([CUDAExecutionProvider::default().build()])?;
        log::info!("CUDA execution provider registered");
    }

    Ok(builder.commit_from_file(path)?)
}

/// Declared shape of a tensor input/output, `None` for non-tensor values.
fn declared_shape(dtype: &ValueType) -> Option<Vec<i64>> {
    match dtype {
        ValueType::Tensor { shape, .. } => Some(shape.iter().copied().collect()),
        _ => None,
    }
}

fn type_name(dtype: &ValueType) -> String {
    match dtype {
        ValueType::Tensor { ty: TensorElementType::Float32, .. } => "float".to_string(),
        ValueType::Tensor { ty, .. } => format!("{:?}", ty).to_lowercase(),
        other => format!("{:?}", other).to_lowercase(),
    }
}

/// Every tensor the contract names must be declared by the session with a
/// compatible shape. Extra session outputs (e.g. `lsnr`) are allowed.
fn validate_session(session: &Session, stage: &StageContract) -> Result<()> {
    let declared: Vec<(&str, Option<Vec<i64>>)> = session
        .inputs()
        .iter()
        .map(|i| (i.name(), declared_shape(i.dtype())))
        .chain(session.outputs().iter().map(|o| (o.name(), declared_shape(o.dtype()))))
        .collect();

    for spec in stage.inputs.iter().chain(stage.outputs.iter()) {
        let Some((_, shape)) = declared.iter().find(|(name, _)| *name == spec.name) else {
            return Err(DfError::Config(format!(
                "{} model missing expected tensor '{}'. Declared: {:?}",
                stage.name,
                spec.name,
                declared.iter().map(|(n, _)| *n).collect::<Vec<_>>()
            )));
        };
        if let Some(shape) = shape {
            if !spec.accepts(shape) {
                return Err(DfError::Contract {
                    tensor: spec.name.clone(),
                    expected: spec.shape.clone(),
                    actual: shape.clone(),
                });
            }
        }
    }
    log::debug!("{} matches contract", stage.name);
    Ok(())
}

/// Feed zeros to every contract input and record the shapes that come back.
fn infer_shapes(session: &mut Session, stage: &StageContract) -> Result<Vec<(String, Vec<i64>)>> {
    let mut shapes: Vec<(String, Vec<i64>)> = Vec::new();
    let mut inputs: Vec<(&str, DynValue)> = Vec::with_capacity(stage.inputs.len());
    for spec in &stage.inputs {
        let dims = spec.dims();
        shapes.push((spec.name.clone(), dims.iter().map(|&d| d as i64).collect()));
        inputs.push((spec.name.as_str(), to_value(&ArrayD::zeros(IxDyn(&dims)))?));
    }

    let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
    let outputs = session.run(inputs)?;
    for name in names {
        // Non-float outputs are listed without an inferred shape
        if let Some(Ok((shape, _))) = outputs.get(name.as_str()).map(|v| v.try_extract_tensor::<f32>()) {
            let dims: Vec<i64> = shape.iter().copied().collect();
            shapes.push((name, dims));
        }
    }
    log::debug!("{} ran once on zero input", stage.name);
    Ok(shapes)
}

fn describe_session(stage: &str, session: &Session, inferred: &[(String, Vec<i64>)]) -> String {
    let lookup = |name: &str| inferred.iter().find(|(n, _)| n == name).map(|(_, s)| s.as_slice());

    let mut text = format!("{} inputs\n", stage);
    for (i, input) in session.inputs().iter().enumerate() {
        let shape = declared_shape(input.dtype()).unwrap_or_default();
        text.push_str(&tensor_line(i, input.name(), &type_name(input.dtype()), &shape, lookup(input.name())));
    }
    text.push_str(&format!("{} outputs\n", stage));
    for (i, output) in session.outputs().iter().enumerate() {
        let shape = declared_shape(output.dtype()).unwrap_or_default();
        text.push_str(&tensor_line(i, output.name(), &type_name(output.dtype()), &shape, lookup(output.name())));
    }
    text
}

/// `1) e0 float (1,64,*,32) -> (1,64,1,32)`
fn tensor_line(index: usize, name: &str, ty: &str, declared: &[i64], inferred: Option<&[i64]>) -> String {
    match inferred {
        Some(inferred) => format!(
            "{}) {} {} {} -> {}\n",
            index + 1,
            name,
            ty,
            format_shape(declared),
            format_shape(inferred)
        ),
        None => format!("{}) {} {} {}\n", index + 1, name, ty, format_shape(declared)),
    }
}

/// Create an ORT value from a dynamic-rank array, preserving its shape.
fn to_value(array: &ArrayD<f32>) -> Result<DynValue> {
    let shape = array.shape();
    let data: Vec<f32> = array.iter().copied().collect();
    let value = match shape.len() {
        1 => Tensor::from_array(([shape[0]], data))?.into_dyn(),
        2 => Tensor::from_array(([shape[0], shape[1]], data))?.into_dyn(),
        3 => Tensor::from_array(([shape[0], shape[1], shape[2]], data))?.into_dyn(),
        4 => Tensor::from_array(([shape[0], shape[1], shape[2], shape[3]], data))?.into_dyn(),
        n => {
            return Err(DfError::Config(format!(
                "unsupported tensor rank {}: {:?}",
                n, shape
            )))
        }
    };
    Ok(value)
}

fn extract_dyn(outputs: &SessionOutputs, name: &str) -> Result<ArrayD<f32>> {
    let value = outputs
        .get(name)
        .ok_or_else(|| DfError::Config(format!("session produced no '{}' output", name)))?;
    let (shape, data) = value.try_extract_tensor::<f32>()?;
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&dims), data.to_vec())?)
}

fn extract_4d(outputs: &SessionOutputs, name: &str) -> Result<Array4<f32>> {
    let array = extract_dyn(outputs, name)?;
    let actual: Vec<i64> = array.shape().iter().map(|&d| d as i64).collect();
    array.into_dimensionality().map_err(|_| DfError::Contract {
        tensor: name.to_string(),
        expected: vec![1, 1, -1, -1],
        actual,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_line_shows_inferred_shape() {
        assert_eq!(
            tensor_line(0, "e0", "float", &[1, 64, -1, 32], Some(&[1, 64, 1, 32])),
            "1) e0 float (1,64,*,32) -> (1,64,1,32)\n"
        );
        assert_eq!(tensor_line(2, "lsnr", "int64", &[1, 1, 1], None), "3) lsnr int64 (1,1,1)\n");
    }

    #[test]
    fn test_missing_model_file_is_config_error() {
        match build_session(Path::new("/nonexistent/enc.onnx"), Some(1)) {
            Err(DfError::Config(msg)) => assert!(msg.contains("model file not found")),
            other => panic!("expected config error, got {:?}", other.err().map(|e| e.to_string())),
        }
    }
}
