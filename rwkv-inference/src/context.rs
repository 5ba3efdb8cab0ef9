use crate::error::{self, Error, ErrorFlags, Result, ResultExt};
use crate::graph::Graph;
use crate::model::Model;
use crate::sequence::build_sequence_graph;
use crate::serial::build_serial_graph;
use crate::state::StateLayout;
use log::{debug, error, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Builder pattern for creating evaluation contexts.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    model_path: PathBuf,
    n_threads: Option<usize>,
    print_errors: Option<bool>,
    gpu_layers: usize,
}

impl ContextBuilder {
    pub fn new(model_path: impl AsRef<Path>) -> Self {
        Self { model_path: model_path.as_ref().to_path_buf(), n_threads: None, print_errors: None, gpu_layers: 0 }
    }

    /// Worker threads used inside one evaluation. Defaults to the available parallelism.
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = Some(n_threads);
        self
    }

    /// Overrides the process-wide print toggle for the new context.
    pub fn with_print_errors(mut self, enabled: bool) -> Self {
        self.print_errors = Some(enabled);
        self
    }

    /// Layers to offload right after loading.
    pub fn with_gpu_layers(mut self, n_layers: usize) -> Self {
        self.gpu_layers = n_layers;
        self
    }

    /// Loads the model and builds the context. Failures land in the process-wide error slot.
    pub fn build(self) -> Result<Context> {
        error::record_global(self.try_build())
    }

    fn try_build(self) -> Result<Context> {
        let n_threads = self.n_threads.unwrap_or_else(default_threads);
        validate_threads(n_threads)?;

        let model = Arc::new(Model::load(&self.model_path)?);
        let mut context = Context::with_model(model, n_threads, self.print_errors.unwrap_or_else(error::print_errors))?;

        if self.gpu_layers > 0 {
            context.gpu_offload_layers(self.gpu_layers)?;
        }
        Ok(context)
    }
}

fn validate_threads(n_threads: usize) -> Result<()> {
    if n_threads == 0 {
        return Error::fail(ErrorFlags::ARGS, "Thread count must be at least 1");
    }
    Ok(())
}

/// An evaluation context over a shared, immutable [`Model`].
///
/// **Owns:**
/// - the single-token graph, built on creation
/// - the chunk graph, built on first multi-token use and rebuilt when the chunk length changes
/// - a worker pool of `n_threads` threads
/// - the last-error flags and print toggle
///
/// A context is driven from one thread at a time. For parallel serving create one
/// context per worker with [`Context::clone_context`]; clones share the weights.
pub struct Context {
    model: Arc<Model>,
    layout: StateLayout,
    serial: Graph,
    sequence: Option<Graph>,
    pool: ThreadPool,
    n_threads: usize,
    last_error: ErrorFlags,
    print_errors: bool,
}

impl Context {
    /// Shortcut for [`ContextBuilder`] with a thread count.
    pub fn load(model_path: impl AsRef<Path>, n_threads: usize) -> Result<Self> {
        ContextBuilder::new(model_path).with_threads(n_threads).build()
    }

    fn with_model(model: Arc<Model>, n_threads: usize, print_errors: bool) -> Result<Self> {
        let layout = StateLayout::new(model.n_embed(), model.n_layer());
        let serial = build_serial_graph(&model).flag(ErrorFlags::CTX)?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .thread_name(|index| format!("rwkv-worker-{index}"))
            .build()
            .map_err(|e| Error::new(ErrorFlags::CTX | ErrorFlags::ALLOC, format!("Failed to start worker pool: {e}")))?;

        debug!("Context ready: {n_threads} threads, serial graph {:?}", serial.plan());

        Ok(Self { model, layout, serial, sequence: None, pool, n_threads, last_error: ErrorFlags::empty(), print_errors })
    }

    /// A new context over the same weights, with its own graphs and thread pool.
    ///
    /// The clone copies this context's print toggle and stays valid after this
    /// context is dropped.
    pub fn clone_context(&self, n_threads: usize) -> Result<Self> {
        let result = validate_threads(n_threads).and_then(|_| Self::with_model(Arc::clone(&self.model), n_threads, self.print_errors));
        error::record_global(result)
    }

    pub fn model(&self) -> &Arc<Model> {
        &self.model
    }

    pub fn n_vocab(&self) -> usize {
        self.model.n_vocab()
    }

    pub fn n_embed(&self) -> usize {
        self.model.n_embed()
    }

    pub fn n_layer(&self) -> usize {
        self.model.n_layer()
    }

    pub fn n_threads(&self) -> usize {
        self.n_threads
    }

    /// Floats in a state buffer.
    pub fn state_len(&self) -> usize {
        self.layout.len()
    }

    /// Floats in a logits buffer.
    pub fn logits_len(&self) -> usize {
        self.model.n_vocab()
    }

    pub fn state_layout(&self) -> StateLayout {
        self.layout
    }

    /// Fills `state` with the initial recurrent state.
    pub fn init_state(&mut self, state: &mut [f32]) -> Result<()> {
        let result = self.check_len("state", state.len(), self.state_len()).map(|_| self.layout.init(state));
        self.record(result)
    }

    /// Evaluates one token.
    ///
    /// `state_in == None` starts from the initial state. `logits_out == None` skips
    /// the vocabulary projection; the resulting state is identical either way.
    /// Nothing is written to the output buffers when the arguments are invalid.
    pub fn eval(
        &mut self,
        token: u32,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        let result = self.try_eval_sequence(&[token], state_in, state_out, logits_out);
        self.record(result)
    }

    /// Evaluates a chunk of tokens in one pass; the logits are those of the last token.
    ///
    /// The chunk graph is rebuilt whenever `tokens.len()` differs from the previous
    /// call. Final state is bit-identical to feeding the tokens one by one to [`Self::eval`].
    pub fn eval_sequence(
        &mut self,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        let result = self.try_eval_sequence(tokens, state_in, state_out, logits_out);
        self.record(result)
    }

    /// Evaluates a long prompt in chunks of at most `chunk_size` tokens.
    pub fn eval_sequence_in_chunks(
        &mut self,
        tokens: &[u32],
        chunk_size: usize,
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        mut logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        let result = (|| {
            if chunk_size == 0 {
                return Error::fail(ErrorFlags::ARGS, "Chunk size must be at least 1");
            }
            self.validate(tokens, state_in, state_out, logits_out.as_deref())?;

            let chunk_count = tokens.len().div_ceil(chunk_size);
            let mut carry = state_in.map(<[f32]>::to_vec);
            for (index, chunk) in tokens.chunks(chunk_size).enumerate() {
                let logits = if index + 1 == chunk_count { logits_out.take() } else { None };
                self.try_eval_sequence(chunk, carry.as_deref(), state_out, logits)?;
                if index + 1 < chunk_count {
                    carry = Some(state_out.to_vec());
                }
            }
            Ok(())
        })();
        self.record(result)
    }

    /// Moves the weights of up to `n_layers` layers to the GPU.
    ///
    /// Returns whether anything was offloaded. This build has no GPU backend, so a
    /// valid request always leaves every layer on the CPU.
    pub fn gpu_offload_layers(&mut self, n_layers: usize) -> Result<bool> {
        let result = if n_layers > self.n_layer() {
            Error::fail(ErrorFlags::ARGS, format!("Cannot offload {n_layers} layers, the model has {}", self.n_layer()))
        } else {
            if n_layers > 0 {
                warn!("Requested GPU offload of {n_layers} layers, but no GPU backend is available; running on CPU");
            }
            Ok(false)
        };
        self.record(result)
    }

    /// Returns and clears the flags of failures since the last call.
    pub fn last_error(&mut self) -> ErrorFlags {
        std::mem::take(&mut self.last_error)
    }

    pub fn print_errors(&self) -> bool {
        self.print_errors
    }

    pub fn set_print_errors(&mut self, enabled: bool) {
        self.print_errors = enabled;
    }

    fn record<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error |= e.flags();
            if self.print_errors {
                error!("{e}");
            }
        }
        result
    }

    fn check_len(&self, what: &str, actual: usize, expected: usize) -> Result<()> {
        if actual != expected {
            return Error::fail(
                ErrorFlags::ARGS | ErrorFlags::DIMENSION,
                format!("The {what} buffer holds {actual} floats, expected {expected}"),
            );
        }
        Ok(())
    }

    fn validate(&self, tokens: &[u32], state_in: Option<&[f32]>, state_out: &[f32], logits_out: Option<&[f32]>) -> Result<()> {
        if tokens.is_empty() {
            return Error::fail(ErrorFlags::ARGS, "Token sequence is empty");
        }
        if let Some(&token) = tokens.iter().find(|&&token| token as usize >= self.n_vocab()) {
            return Error::fail(ErrorFlags::ARGS, format!("Token {token} is out of range for vocabulary of {}", self.n_vocab()));
        }

        self.check_len("output state", state_out.len(), self.state_len())?;
        if let Some(state) = state_in {
            self.check_len("input state", state.len(), self.state_len())?;
        }
        if let Some(logits) = logits_out {
            self.check_len("logits", logits.len(), self.logits_len())?;
        }
        Ok(())
    }

    fn try_eval_sequence(
        &mut self,
        tokens: &[u32],
        state_in: Option<&[f32]>,
        state_out: &mut [f32],
        logits_out: Option<&mut [f32]>,
    ) -> Result<()> {
        self.validate(tokens, state_in, state_out, logits_out.as_deref())?;

        let graph = if tokens.len() == 1 {
            &mut self.serial
        } else {
            if self.sequence.as_ref().is_none_or(|graph| graph.token_count() != tokens.len()) {
                debug!("Building chunk graph for {} tokens", tokens.len());
                self.sequence = Some(build_sequence_graph(&self.model, tokens.len()).flag(ErrorFlags::CTX)?);
            }
            match self.sequence.as_mut() {
                Some(graph) => graph,
                None => return Error::fail(ErrorFlags::CTX | ErrorFlags::GRAPH, "Chunk graph is missing"),
            }
        };

        let (model, layout) = (&*self.model, &self.layout);
        self.pool.install(|| graph.evaluate(model, layout, tokens, state_in, state_out, logits_out));
        Ok(())
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("model", &self.model)
            .field("n_threads", &self.n_threads)
            .field("serial_plan", self.serial.plan())
            .field("sequence_tokens", &self.sequence.as_ref().map(Graph::token_count))
            .field("last_error", &self.last_error)
            .field("print_errors", &self.print_errors)
            .finish()
    }
}

#[cfg(test)]
#[path = "../tests/unit/context_test.rs"]
mod tests;
