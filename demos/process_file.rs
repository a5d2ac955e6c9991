//! Example: Enhance a WAV file, simulating an audio callback with small chunks
//!
//! Usage: cargo run --example process_file -- input.wav output.wav [model_dir | --bypass]
//!
//! `--bypass` runs the full framing pipeline with a unit-gain backend, which is
//! handy for checking the resynthesis and the timing without a model.

use deepfilter_pipeline::{
    DeepFilterPipeline, DeepFilterStream, InferenceBackend, Passthrough, PipelineConfig, SAMPLE_RATE,
};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [model_dir | --bypass]", args[0]);
        std::process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];

    let mono = read_mono(input_path)?;
    println!("Processing {} samples ({:.2}s)...", mono.len(), mono.len() as f32 / SAMPLE_RATE as f32);

    let output = match args.get(3).map(String::as_str) {
        Some("--bypass") => {
            let pipeline = DeepFilterPipeline::new(PipelineConfig::default(), Passthrough::default())?;
            enhance(DeepFilterStream::new(pipeline), &mono)?
        }
        other => {
            let model_dir = match other {
                Some(dir) => Path::new(dir).to_path_buf(),
                None => Path::new(env!("CARGO_MANIFEST_DIR")).join("models/dfn3"),
            };
            println!("Loading models from {:?}...", model_dir);
            enhance(DeepFilterStream::from_model_dir(&model_dir)?, &mono)?
        }
    };

    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(output_path, out_spec)?;
    for sample in &output {
        let s = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
        writer.write_sample(s)?;
    }
    writer.finalize()?;

    println!("Saved to {}", output_path);
    Ok(())
}

fn enhance<B: InferenceBackend>(
    mut stream: DeepFilterStream<B>,
    mono: &[f32],
) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    // Warm up to avoid cold-start latency affecting timing
    stream.warmup()?;
    println!("Latency: {:.2}ms", stream.latency_ms());

    let chunk_size = stream.pipeline().hop_size() / 3;
    let mut output = Vec::with_capacity(mono.len());
    let start = std::time::Instant::now();

    for chunk in mono.chunks(chunk_size) {
        output.extend(stream.process(chunk)?);
    }
    output.extend(stream.flush()?);

    let elapsed = start.elapsed();
    let rtf = elapsed.as_secs_f32() / (mono.len() as f32 / SAMPLE_RATE as f32);
    let stats = stream.pipeline().stats();
    println!("Done in {:.2}s (RTF: {:.3}x realtime)", elapsed.as_secs_f32(), rtf);
    println!(
        "Frames: {}, inference avg: {:.2}ms, max: {:.2}ms, deadline misses: {}, fallbacks: {}",
        stats.frames,
        stats.mean_inference().as_secs_f64() * 1000.0,
        stats.max_inference.as_secs_f64() * 1000.0,
        stats.deadline_misses,
        stats.fallbacks
    );
    Ok(output)
}

fn read_mono(path: &str) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    println!("Input: {} Hz, {} channels, {:?}", spec.sample_rate, spec.channels, spec.sample_format);

    if spec.sample_rate != SAMPLE_RATE as u32 {
        eprintln!(
            "Warning: Input sample rate {} != expected {}. Resample first!",
            spec.sample_rate, SAMPLE_RATE
        );
    }

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => match spec.bits_per_sample {
            16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0))
                .collect::<Result<_, _>>()?,
            24 | 32 => {
                let scale = (1u64 << (spec.bits_per_sample - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()?
            }
            bits => return Err(format!("Unsupported bits per sample: {}", bits).into()),
        },
    };

    // Average channels down to mono
    let channels = spec.channels.max(1) as usize;
    Ok(samples
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect())
}
