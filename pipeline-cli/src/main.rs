//! This is the pipeline command line utility.

mod demo;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::Parser;
use futures_util::StreamExt;
use pipeline_core::{LoadProgress, Pipeline};

#[derive(Clone, Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory containing the fragment set (block chunks, cache updater,
    /// logit sampler).
    #[arg(long)]
    model: PathBuf,

    /// Restrict the block-chunk file set to names starting with this
    /// prefix.
    #[arg(long)]
    prefix: Option<String>,

    /// The initial prompt.
    #[arg(long, default_value = "")]
    prompt: String,

    /// The number of tokens to generate.
    #[arg(short = 'n', long, default_value_t = 256)]
    sample_len: usize,

    /// Per-step query length declared by the fragment set's embeddings
    /// input. Used only by the bundled demo backend (see `demo.rs`); a
    /// real backend declares this itself.
    #[arg(long, default_value_t = 64)]
    input_length: usize,

    /// Cache buffer row capacity. See `--input-length`.
    #[arg(long, default_value_t = 960)]
    cache_length: usize,

    /// Vocabulary size. See `--input-length`.
    #[arg(long, default_value_t = 32000)]
    vocab_size: usize,

    /// K/V width (head_dim * n_kv_heads). See `--input-length`.
    #[arg(long, default_value_t = 128)]
    kv_width: usize,

    /// Total transformer layer count spread across the block-chunk
    /// fragments. See `--input-length`.
    #[arg(long, default_value_t = 32)]
    num_layers: usize,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info,tokenizers=error");
    }
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_module_path(false)
        .format_target(false)
        .init();

    let device = if args.cpu { Device::Cpu } else { Device::new_cuda(0)? };

    let factory = demo::DemoModelFactory {
        config: demo::DemoConfig {
            input_length: args.input_length,
            cache_length: args.cache_length,
            vocab_size: args.vocab_size,
            kv_width: args.kv_width,
            total_layers: args.num_layers,
            device: device.clone(),
        },
    };

    log::info!("loading pipeline from {}", args.model.display());
    let mut pipeline = Pipeline::load(&args.model, args.prefix.as_deref(), &factory, device, |p: LoadProgress| {
        log::debug!("[{:>5.1}%] {}", p.fraction * 100.0, p.status);
    })
    .await?;

    log::info!(
        "pipeline ready: {} layers, vocab={}, input_length={}, cache_length={}",
        pipeline.config().num_layers,
        pipeline.config().vocab_size,
        pipeline.config().input_length,
        pipeline.config().cache_length,
    );

    // This demo backend has no real tokenizer behind it; treat the prompt
    // as a literal, whitespace-separated list of token ids for now.
    let prompt_ids: Vec<u32> = args
        .prompt
        .split_whitespace()
        .map(|tok| tok.parse::<u32>())
        .collect::<Result<_, _>>()
        .unwrap_or_default();

    log::info!(
        "starting the inference loop (mem={})",
        human_bytes::human_bytes(memory_stats::memory_stats().unwrap().physical_mem as f64)
    );

    let start = std::time::Instant::now();
    let mut stream = pipeline.predict(prompt_ids, args.sample_len);
    let mut generated = 0usize;

    while let Some(prediction) = stream.next().await {
        let prediction = prediction?;
        generated += 1;
        print!("{} ", prediction.new_token);
        io::stdout().flush().ok();
    }
    println!();

    let dt = start.elapsed();
    log::info!(
        "{generated} tokens generated ({:.2} token/s) - mem={}",
        generated as f64 / dt.as_secs_f64(),
        human_bytes::human_bytes(memory_stats::memory_stats().unwrap().physical_mem as f64)
    );

    Ok(())
}
