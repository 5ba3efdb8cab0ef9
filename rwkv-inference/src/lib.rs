//! RWKV inference: model file reader, parameter assembly, graph building and
//! evaluation with a constant-size recurrent state.
//!
//! ```no_run
//! use rwkv_inference::ContextBuilder;
//!
//! let mut ctx = ContextBuilder::new("model.bin").with_threads(4).build()?;
//! let mut state = vec![0.0; ctx.state_len()];
//! let mut logits = vec![0.0; ctx.logits_len()];
//! ctx.eval_sequence(&[510, 3158], None, &mut state, Some(&mut logits))?;
//! # Ok::<(), rwkv_inference::Error>(())
//! ```

pub mod context;
pub mod error;
pub mod format;
pub mod model;
pub mod quant;
pub mod state;
pub mod tensor;
pub mod wkv;

mod arena;
mod graph;
mod layers;
mod sequence;
mod serial;
mod utils;

use log::debug;
use std::time::{Duration, Instant};

pub use crate::arena::ArenaPlan;
pub use crate::context::{Context, ContextBuilder};
pub use crate::error::{Error, ErrorFlags, Result, ResultExt, last_error, print_errors, record_global, set_print_errors};
pub use crate::format::{FileHeader, StorageType, TensorHeader};
pub use crate::model::Model;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub model_path: String,
    pub prompt: String,
    pub threads: Option<usize>,
    pub chunk_size: usize,
    pub gpu_layers: usize,
    pub top_k: usize,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct RunConfigBuilder {
    model_path: Option<String>,
    prompt: Option<String>,
    threads: Option<usize>,
    chunk_size: Option<usize>,
    gpu_layers: Option<usize>,
    top_k: Option<usize>,
}

impl RunConfigBuilder {
    pub fn model_path(mut self, path: Option<&String>) -> Self {
        self.model_path = path.cloned();
        self
    }
    pub fn prompt(mut self, prompt: Option<&String>) -> Self {
        self.prompt = prompt.cloned();
        self
    }
    pub fn threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads;
        self
    }
    pub fn chunk_size(mut self, chunk_size: Option<usize>) -> Self {
        self.chunk_size = chunk_size;
        self
    }
    pub fn gpu_layers(mut self, gpu_layers: Option<usize>) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }
    pub fn top_k(mut self, top_k: Option<usize>) -> Self {
        self.top_k = top_k;
        self
    }
    pub fn build(self) -> std::result::Result<RunConfig, String> {
        Ok(RunConfig {
            model_path: self.model_path.ok_or("model_path is required")?,
            prompt: self.prompt.ok_or("prompt is required")?,
            threads: self.threads,
            chunk_size: self.chunk_size.unwrap_or(16),
            gpu_layers: self.gpu_layers.unwrap_or(0),
            top_k: self.top_k.unwrap_or(5),
        })
    }
}

/// Outcome of [`run_prompt`].
#[derive(Debug, Clone)]
pub struct RunReport {
    pub prompt_tokens: usize,
    pub load_time: Duration,
    pub eval_time: Duration,
    /// Highest-scoring next tokens, best first.
    pub top_tokens: Vec<(u32, f32)>,
}

impl RunReport {
    pub fn tokens_per_second(&self) -> f64 {
        self.prompt_tokens as f64 / self.eval_time.as_secs_f64().max(f64::EPSILON)
    }
}

/// Loads a model and feeds it a byte-level prompt, one token per byte.
pub fn run_prompt(config: RunConfig) -> anyhow::Result<RunReport> {
    debug!("{config:#?}");

    let start = Instant::now();
    let mut builder = ContextBuilder::new(&config.model_path).with_gpu_layers(config.gpu_layers);
    if let Some(threads) = config.threads {
        builder = builder.with_threads(threads);
    }
    let mut ctx = builder.build()?;
    let load_time = start.elapsed();

    debug!("{ctx:#?}");

    let tokens: Vec<u32> = config.prompt.bytes().map(u32::from).collect();
    if tokens.is_empty() {
        anyhow::bail!("Prompt is empty");
    }

    let mut state = vec![0.0; ctx.state_len()];
    let mut logits = vec![0.0; ctx.logits_len()];

    let start = Instant::now();
    ctx.eval_sequence_in_chunks(&tokens, config.chunk_size, None, &mut state, Some(&mut logits))?;
    let eval_time = start.elapsed();

    Ok(RunReport { prompt_tokens: tokens.len(), load_time, eval_time, top_tokens: top_k(&logits, config.top_k) })
}

/// The `k` largest logits with their token ids, best first.
pub fn top_k(logits: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut ranked: Vec<(u32, f32)> = logits.iter().enumerate().map(|(i, &v)| (i as u32, v)).collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}
