//! FN-SSL CLI: run one forward pass of the localization network.
//!
//! Builds the network with freshly initialized weights (or loads them from
//! --weights), feeds it seeded synthetic spectral input of the requested
//! shape and prints a one-line JSON summary to stdout:
//!
//! ```json
//! {"input":[2,4,256,298],"output":[2,24,512],"parameters":537090,"causality":"offline","doa":false}
//! ```
//!
//! Exit code 0 on success, non-zero on error.

use std::path::PathBuf;

use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;
use fn_ssl_rs::{Causality, FnSslConfig, LocalizationNetwork};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Parser, Debug)]
#[command(
    name = "fn-ssl",
    about = "FN-SSL sound source localization network",
    long_about = "Run one forward pass of the full-band / narrow-band fusion network\n\
                  on synthetic input and report the output shape.\n\
                  A JSON summary line is printed to stdout."
)]
struct Args {
    /// JSON config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors file with learned weights. Omit for random weights.
    #[arg(long, short = 'w')]
    weights: Option<PathBuf>,

    /// Batch size.
    #[arg(long, short = 'b', default_value_t = 2)]
    batch: usize,

    /// Number of input frames.
    #[arg(long, short = 't', default_value_t = 298)]
    frames: usize,

    /// Causal (streaming) narrow-band modelling.
    #[arg(long)]
    online: bool,

    /// Project IPD features to DOA logits.
    #[arg(long)]
    doa: bool,

    /// Override the hidden width.
    #[arg(long)]
    hidden: Option<usize>,

    /// Random seed for the synthetic input. Omit for a random seed each run.
    #[arg(long, short = 's')]
    seed: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut cfg = match &args.config {
        Some(path) => FnSslConfig::load(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?,
        None => FnSslConfig::default(),
    };
    if args.online {
        cfg.causality = Causality::Online;
    }
    if args.doa {
        cfg.doa = true;
    }
    if let Some(hidden) = args.hidden {
        cfg.hidden_size = hidden;
    }
    cfg.verify()?;

    if args.frames < cfg.pool_window {
        anyhow::bail!(
            "need at least {} frames, got {}",
            cfg.pool_window,
            args.frames
        );
    }

    let device = Device::cuda_if_available(0)?;
    tracing::info!("Using device: {:?}", device);

    let net = match &args.weights {
        Some(path) => LocalizationNetwork::from_safetensors(path, &cfg, &device)
            .map_err(|e| anyhow::anyhow!("failed to load weights: {e}"))?,
        None => {
            let varmap = VarMap::new();
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            LocalizationNetwork::new(&cfg, vb)?
        }
    };

    let seed = args.seed.unwrap_or_else(|| rand::rng().random());
    tracing::info!("Synthetic input seed: {seed}");
    let shape = (args.batch, cfg.input_size, cfg.num_freqs, args.frames);
    let x = synthetic_input(shape, seed, &device)?;

    let started = std::time::Instant::now();
    let out = net.forward(&x, false)?;
    tracing::info!("Forward pass: {:.2}s", started.elapsed().as_secs_f64());

    let summary = serde_json::json!({
        "input": x.dims(),
        "output": out.dims(),
        "parameters": net.config().parameter_count(),
        "causality": net.config().causality,
        "doa": net.config().doa,
    });
    println!("{summary}");

    Ok(())
}

/// Uniform noise in [-1, 1) with the given `[B, C, F, T]` shape.
fn synthetic_input(
    shape: (usize, usize, usize, usize),
    seed: u64,
    device: &Device,
) -> anyhow::Result<Tensor> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let data: Vec<f32> = (0..len).map(|_| rng.random_range(-1.0..1.0)).collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}
