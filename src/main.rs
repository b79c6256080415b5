//! paged-infer demo CLI.
//!
//! Drives the continuous-batching pipeline end to end with a built-in
//! deterministic stub executor (a byte-level "model" that always
//! predicts the successor token), so the scheduling, paging and
//! sampling machinery can be exercised without model weights.
//!
//! ## Usage
//!
//! ```bash
//! # Batch two prompts through the pipeline
//! paged-infer -p "hello" -p "paged attention" --max-tokens 16
//!
//! # Sampling parameters and a smaller cache
//! paged-infer -p "hi" --temperature 0.8 --top-k 40 --num-blocks 64
//! ```

use std::sync::Arc;
use std::time::Instant;

use candle_core::{Device, Tensor};
use clap::Parser;
use tracing::info;

use paged_infer::engine::batch::ModelInputs;
use paged_infer::executor::{Encoding, Executor, Tokenizer};
use paged_infer::{AdapterSpec, Pipeline, SamplingParams, SchedulerConfig};

/// paged-infer: a continuous-batching inference core demo
#[derive(Parser, Debug)]
#[command(name = "paged-infer")]
#[command(version, about, long_about = None)]
struct Args {
    /// Input prompt(s) - can be specified multiple times
    #[arg(short, long, required = true)]
    prompt: Vec<String>,

    /// Maximum tokens to generate per prompt
    #[arg(long, default_value = "32")]
    max_tokens: usize,

    /// Sampling temperature (0.0 = greedy)
    #[arg(short, long, default_value = "0.0")]
    temperature: f32,

    /// Top-k sampling (0 = disabled)
    #[arg(long, default_value = "0")]
    top_k: usize,

    /// Top-p (nucleus) sampling (1.0 = disabled)
    #[arg(long, default_value = "1.0")]
    top_p: f32,

    /// Tokens per KV cache block
    #[arg(long, default_value = "16")]
    block_size: usize,

    /// Number of KV cache blocks
    #[arg(long, default_value = "256")]
    num_blocks: usize,

    /// Maximum batched tokens per step
    #[arg(long, default_value = "256")]
    max_batched_tokens: usize,

    /// Random seed for reproducible sampling
    #[arg(long)]
    seed: Option<u64>,
}

/// Byte-level vocabulary size of the demo model.
const VOCAB: usize = 256;

/// Deterministic demo model: every token predicts its successor byte.
struct SuccessorExecutor {
    device: Device,
}

impl Executor for SuccessorExecutor {
    fn forward(&mut self, inputs: &ModelInputs) -> paged_infer::Result<Tensor> {
        let ids: Vec<Vec<i64>> = inputs.input_ids.to_vec2()?;
        let batch = ids.len();
        let mut logits = vec![0.0f32; batch * VOCAB];
        for (row, id) in ids.iter().enumerate() {
            let next = (id[0] as usize + 1) % VOCAB;
            logits[row * VOCAB + next] = 8.0;
        }
        Ok(Tensor::from_vec(logits, (batch, VOCAB), &self.device)?)
    }

    fn set_adapters(&mut self, _adapters: Option<&AdapterSpec>) -> paged_infer::Result<()> {
        Ok(())
    }

    fn reset_state(&mut self) {}

    fn device(&self) -> &Device {
        &self.device
    }

    fn hidden_size(&self) -> usize {
        64
    }
}

/// Byte-level tokenizer: one token per byte.
struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> paged_infer::Result<Encoding> {
        let ids: Vec<u32> = text.bytes().map(u32::from).collect();
        let attention_mask = vec![1; ids.len()];
        Ok(Encoding {
            ids,
            attention_mask,
        })
    }

    fn decode(&self, ids: &[u32]) -> paged_infer::Result<String> {
        let bytes: Vec<u8> = ids.iter().map(|&id| id as u8).collect();
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn eos_token_id(&self) -> Option<u32> {
        None
    }

    fn bos_token_id(&self) -> Option<u32> {
        None
    }

    fn pad_token_id(&self) -> Option<u32> {
        None
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    let config = SchedulerConfig {
        max_num_batched_tokens: args.max_batched_tokens,
        num_blocks: args.num_blocks,
        block_size: args.block_size,
        max_num_seqs: 64,
        dynamic_split_fuse: false,
        use_cache_eviction: false,
    };

    let tokenizer = Arc::new(ByteTokenizer);
    let executor = Box::new(SuccessorExecutor {
        device: Device::Cpu,
    });
    let tokenizer_dyn: Arc<dyn Tokenizer> = tokenizer.clone();
    let mut pipeline = Pipeline::new(executor, tokenizer_dyn, config)?;
    if let Some(seed) = args.seed {
        pipeline.seed_sampler(seed);
    }

    let params = SamplingParams {
        max_new_tokens: args.max_tokens,
        temperature: args.temperature,
        top_k: args.top_k,
        top_p: args.top_p,
        ..SamplingParams::greedy()
    };

    let prompts: Vec<Vec<u32>> = args
        .prompt
        .iter()
        .map(|prompt| tokenizer.encode(prompt).map(|e| e.ids))
        .collect::<paged_infer::Result<_>>()?;
    let all_params = vec![params; prompts.len()];

    info!(num_prompts = prompts.len(), "starting generation");
    let start = Instant::now();
    let outputs = pipeline.generate(&prompts, &all_params, None)?;
    let elapsed = start.elapsed();

    let mut total_tokens = 0usize;
    for (output, prompt) in outputs.iter().zip(&args.prompt) {
        for result in &output.results {
            total_tokens += result.token_ids.len();
            println!(
                "request {} | prompt {:?} | finish {:?}",
                output.request_id, prompt, result.finish_reason
            );
            println!("  tokens: {:?}", result.token_ids);
            println!("  text:   {:?}", tokenizer.decode(&result.token_ids)?);
        }
    }

    println!(
        "generated {} tokens in {:.2?} ({:.1} tok/s)",
        total_tokens,
        elapsed,
        total_tokens as f64 / elapsed.as_secs_f64()
    );
    Ok(())
}
