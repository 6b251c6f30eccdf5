use std::path::PathBuf;

use clap::Parser;
use nano_specdec::{logging, BigramBackend, Config, Error, LLMEngine, Result};

#[derive(Parser, Debug)]
#[command(name = "nano-specdec")]
#[command(about = "Speculative decoding over a paged KV cache")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt as comma-separated token ids; repeat for a batch
    #[arg(short, long)]
    prompt: Vec<String>,

    /// Vocabulary size of the reference bigram model
    #[arg(long, default_value = "64")]
    vocab_size: usize,

    /// Softmax temperature (0 = greedy)
    #[arg(long, default_value = "1.0")]
    temperature: f32,

    /// Maximum tokens to generate per prompt
    #[arg(long)]
    max_tokens: Option<usize>,

    /// Initial speculation depth
    #[arg(short = 'k', long)]
    num_speculative_tokens: Option<usize>,

    /// Stop token id
    #[arg(long)]
    stop_token: Option<u32>,

    /// RNG seed for the model tables and the samplers
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_prompt(raw: &str) -> Result<Vec<u32>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u32>()
                .map_err(|e| Error::Config(format!("bad token id {s:?}: {e}")))
        })
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.log_level)?;

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(n) = args.max_tokens {
        config.speculative.max_new_tokens = n;
    }
    if let Some(k) = args.num_speculative_tokens {
        config.speculative.num_speculative_tokens = k;
    }
    if let Some(stop) = args.stop_token {
        config.speculative.stop_token_id = Some(stop);
    }
    config.speculative.seed.get_or_insert(args.seed);

    let bytes = config.engine.kv_bytes_per_token;
    if bytes % std::mem::size_of::<f32>() != 0 {
        return Err(Error::Config(format!(
            "kv_bytes_per_token ({bytes}) must hold whole f32 values"
        )));
    }
    let backend = BigramBackend::new(
        args.vocab_size,
        config.engine.num_layers,
        bytes / std::mem::size_of::<f32>(),
        args.seed,
    )?
    .with_temperature(args.temperature);

    let prompts = if args.prompt.is_empty() {
        vec![vec![1, 2, 3], vec![4, 5, 6, 7, 8, 9, 10]]
    } else {
        args.prompt
            .iter()
            .map(|p| parse_prompt(p))
            .collect::<Result<Vec<_>>>()?
    };

    println!("nano-specdec v{}", env!("CARGO_PKG_VERSION"));
    let mut engine = LLMEngine::new(backend, config)?;
    let outputs = engine.generate_batch(prompts)?;

    for output in &outputs {
        println!(
            "\n[seq {}] prompt {:?}\n  output ({} tokens): {:?}",
            output.sequence_id,
            output.prompt_tokens,
            output.output_tokens.len(),
            output.output_tokens
        );
        println!(
            "  finish: {}  steps: {}  acceptance: {:.2}  tokens/step: {:.2}",
            output.finish_reason.map_or("none", |r| r.as_str()),
            output.stats.steps,
            output.stats.acceptance_rate(),
            output.stats.tokens_per_step()
        );
        if let Some(err) = &output.error {
            println!("  error: {err}");
        }
    }

    let stats = engine.cache_stats();
    println!(
        "\nKV cache: {}/{} blocks free, {} live sequences",
        stats.free_blocks, stats.num_blocks, stats.live_sequences
    );
    Ok(())
}
