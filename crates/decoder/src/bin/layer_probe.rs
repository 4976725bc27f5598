use std::path::PathBuf;

use candle_core::{Device, Tensor};
use clap::Parser;
use decoder::{ActivationStats, DecoderConfig, DecoderError, DecoderStack, ModelMode};

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("layer probe failed: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a decoder stack on random inputs and report activation statistics", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "TOML or JSON decoder config; defaults are used when omitted")]
    config: Option<PathBuf>,

    #[arg(long, default_value_t = 2, help = "Batch size")]
    batch: usize,

    #[arg(long, default_value_t = 16, help = "Prompt length")]
    seq_len: usize,

    #[arg(long, default_value = "train", help = "train | prefill (prefill also runs decode steps)")]
    mode: String,

    #[arg(long, default_value_t = 0, help = "Number of decode steps after prefill")]
    decode_steps: usize,

    #[arg(long, help = "Override scan_layers from the config")]
    scan_layers: Option<bool>,
}

fn run() -> Result<(), DecoderError> {
    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => DecoderConfig::from_path(path)?,
        None => DecoderConfig::default(),
    };
    config.record_internal_nn_metrics = true;
    if let Some(scan) = args.scan_layers {
        config.scan_layers = scan;
    }
    let mode: ModelMode = args.mode.parse().map_err(DecoderError::config)?;
    if mode == ModelMode::Autoregressive {
        return Err(DecoderError::config("use --mode prefill with --decode-steps to decode"));
    }

    let device = Device::Cpu;
    let dtype = config.activation_dtype()?;
    let stack = DecoderStack::new(&config, &device)?;
    let inputs = Tensor::randn(0f32, 1.0, (args.batch, args.seq_len, config.emb_dim), &device)?.to_dtype(dtype)?;
    let positions = Tensor::arange(0u32, args.seq_len as u32, &device)?
        .unsqueeze(0)?
        .repeat((args.batch, 1))?;

    let mut caches = stack.new_caches();
    let cache_arg = match mode {
        ModelMode::Train => None,
        _ => Some(caches.as_mut_slice()),
    };
    let output = stack.forward(&inputs, None, &positions, true, mode, cache_arg)?;

    println!(
        "{} layers ({} dense), mode={}, output {:?} {:?}",
        stack.len(),
        config.first_num_dense_layers,
        mode,
        output.hidden.dims(),
        output.hidden.dtype()
    );
    for (name, values) in output.intermediates.scalars() {
        let rendered: Vec<String> = values.iter().map(|v| format!("{v:.5}")).collect();
        println!("  {name}: [{}]", rendered.join(", "));
    }
    for name in output.intermediates.checkpoint_names() {
        let saved = output.intermediates.checkpoint(name).map_or(0, <[Tensor]>::len);
        println!("  checkpoint {name}: {saved} saved");
    }

    if mode == ModelMode::Prefill {
        for step in 0..args.decode_steps {
            let position = (args.seq_len + step) as u32;
            let token = Tensor::randn(0f32, 1.0, (args.batch, 1, config.emb_dim), &device)?.to_dtype(dtype)?;
            let token_positions = Tensor::full(position, (args.batch, 1), &device)?;
            let out = stack.forward(
                &token,
                None,
                &token_positions,
                true,
                ModelMode::Autoregressive,
                Some(caches.as_mut_slice()),
            )?;
            let stats = ActivationStats::compute(&out.hidden)?;
            println!(
                "decode step {step} (position {position}): mean={:.5} stdev={:.5} zero={:.4}",
                stats.mean, stats.stdev, stats.fraction_zero
            );
        }
    }
    Ok(())
}
