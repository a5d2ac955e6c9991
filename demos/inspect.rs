//! Example: List the tensors a model directory declares and the shapes it produces
//!
//! Usage: cargo run --example inspect -- [model_dir]

use deepfilter_pipeline::{InferenceBackend, OnnxInference, PipelineConfig};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let model_dir = match std::env::args().nth(1) {
        Some(dir) => Path::new(&dir).to_path_buf(),
        None => Path::new(env!("CARGO_MANIFEST_DIR")).join("models/dfn3"),
    };

    let config = PipelineConfig::from_model_dir(&model_dir)?;
    println!(
        "{}: {} ERB bands, {} DF bins, {} taps, norm alpha {}",
        model_dir.display(),
        config.nb_erb,
        config.nb_df,
        config.df_order,
        config.norm_alpha
    );

    let backend = OnnxInference::new(&model_dir)?;
    print!("{}", backend.describe());
    Ok(())
}
