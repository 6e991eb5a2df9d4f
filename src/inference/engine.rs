//! Inference engine implementation
//!
//! Owns the llama-cpp backend and model and runs generation sessions.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`)
//! contain raw pointers that are not `Send`, everything that touches them
//! runs on a dedicated worker thread. The main thread communicates via
//! channels; generated fragments cross back over a tokio channel so async
//! consumers can await them.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use thiserror::Error;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::inference::model::{locate_model_file, validate_gguf, ModelError};
use crate::inference::prompt::{format_prompt, DEFAULT_SYSTEM_PROMPT};
use crate::inference::session::{
    DecodeStream, GenerationSession, SessionConfig, SessionOutcome, TokenGenerator, TokenId,
};
use crate::inference::streaming::{GenerationError, StreamEvent};

/// Errors that can occur while initializing the engine or loading a model
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Backend not initialized")]
    BackendNotInitialized,

    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl From<ModelError> for EngineError {
    fn from(e: ModelError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Parameters for one generation request
#[derive(Debug, Clone)]
pub struct GenerationParams {
    /// Maximum total sequence length, prompt tokens included
    pub max_length: u32,
    /// Temperature for sampling (0.0 = greedy, higher = more random)
    pub temperature: f32,
    /// Top-k sampling parameter (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) sampling parameter
    pub top_p: f32,
    /// Random seed for sampling (0 = random)
    pub seed: u32,
    /// System message placed in the prompt template
    pub system_prompt: String,
    /// Sleep before each generation step; advisory scheduling courtesy
    pub step_yield: Duration,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_length: 2048,
            temperature: 0.7,
            top_k: 40,
            top_p: 0.95,
            seed: 0,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            step_yield: Duration::from_millis(10),
        }
    }
}

/// Model information after loading
#[derive(Debug, Clone)]
pub struct LoadedModelInfo {
    /// Path to the loaded weight file
    pub path: String,
    /// Vocabulary size
    pub vocab_size: i32,
    /// Embedding dimension
    pub embedding_dim: i32,
    /// Training context length
    pub context_length: u32,
    /// Total parameter count
    pub param_count: u64,
    /// Model size in bytes
    pub size_bytes: u64,
    /// Wall-clock time the load took
    pub load_time: Duration,
}

impl LoadedModelInfo {
    /// Human-readable load report shown to the user after initialization.
    pub fn load_report(&self) -> String {
        format!("Model loading took {} ms", self.load_time.as_millis())
    }
}

/// Commands sent to the worker thread
enum WorkerCommand {
    Init,
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        response_tx: Sender<Result<LoadedModelInfo, EngineError>>,
    },
    UnloadModel,
    Generate {
        prompt: String,
        params: GenerationParams,
        event_tx: UnboundedSender<StreamEvent>,
        stop_signal: Arc<AtomicBool>,
    },
    Shutdown,
}

/// The inference engine over llama-cpp-2
///
/// Uses a dedicated worker thread for all llama-cpp operations since
/// the underlying types are not Send.
pub struct InferenceEngine {
    /// Channel to send commands to the worker thread
    command_tx: Option<Sender<WorkerCommand>>,
    /// Handle to the worker thread
    worker_handle: Option<JoinHandle<()>>,
    /// Cached model info (updated after load)
    model_info: Option<LoadedModelInfo>,
    /// Whether backend is initialized
    initialized: bool,
    /// Whether a model is loaded
    model_loaded: bool,
}

impl InferenceEngine {
    /// Creates a new uninitialized engine
    pub fn new() -> Self {
        Self {
            command_tx: None,
            worker_handle: None,
            model_info: None,
            initialized: false,
            model_loaded: false,
        }
    }

    /// Initializes the llama.cpp backend
    ///
    /// Must be called before loading models or running inference.
    /// Spawns a dedicated worker thread for all llama-cpp operations.
    pub fn init(&mut self) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }

        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();

        // Spawn worker thread that owns the backend and model
        let handle = thread::spawn(move || {
            worker_thread_main(command_rx);
        });

        self.command_tx = Some(command_tx.clone());
        self.worker_handle = Some(handle);

        // Send init command to worker
        command_tx
            .send(WorkerCommand::Init)
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        self.initialized = true;
        tracing::info!("InferenceEngine worker thread started");
        Ok(())
    }

    /// Loads a model from a pre-exported package directory (or a direct
    /// `.gguf` path)
    ///
    /// # Arguments
    /// * `package` - Model package directory containing the GGUF file
    /// * `gpu_layers` - Number of layers to offload to GPU (0 = CPU only, high value = all to GPU)
    ///
    /// # Returns
    /// * `Ok(LoadedModelInfo)` - Information about the loaded model, with the elapsed load time
    /// * `Err(EngineError)` - If model resolution, validation, or loading fails
    pub fn load_model<P: AsRef<Path>>(
        &mut self,
        package: P,
        gpu_layers: u32,
    ) -> Result<LoadedModelInfo, EngineError> {
        let command_tx = self
            .command_tx
            .as_ref()
            .ok_or(EngineError::BackendNotInitialized)?;

        // Resolve and validate the GGUF payload first (on the calling
        // thread, just file I/O)
        let path = locate_model_file(package)?;
        let _metadata = validate_gguf(&path)?;
        tracing::debug!("GGUF validation passed for {:?}", path);

        // Create response channel
        let (response_tx, response_rx) = mpsc::channel();

        // Send load command to worker
        command_tx
            .send(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        // Wait for response
        let result = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        self.model_info = Some(result.clone());
        self.model_loaded = true;

        Ok(result)
    }

    /// Unloads the current model and frees its memory
    pub fn unload_model(&mut self) {
        if let Some(tx) = &self.command_tx {
            let _ = tx.send(WorkerCommand::UnloadModel);
        }
        self.model_info = None;
        self.model_loaded = false;
        tracing::info!("Model unload requested");
    }

    /// Returns information about the currently loaded model
    pub fn model_info(&self) -> Option<&LoadedModelInfo> {
        self.model_info.as_ref()
    }

    /// Returns true if a model is currently loaded
    pub fn is_model_loaded(&self) -> bool {
        self.model_loaded
    }

    /// Returns true if the backend is initialized
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Returns true if the engine can serve generation requests
    pub fn is_ready(&self) -> bool {
        self.initialized && self.model_loaded
    }

    /// Starts a streaming generation session for a raw user prompt
    ///
    /// The prompt is wrapped in the fixed chat template on the worker side.
    /// Fails fast with [`GenerationError::NotReady`] before touching the
    /// tokenizer or constructing a generator when no model is loaded.
    ///
    /// # Returns
    /// * `Ok((UnboundedReceiver<StreamEvent>, Arc<AtomicBool>))` - Event receiver and stop signal
    /// * `Err(GenerationError)` - If the engine is not ready or the worker is gone
    pub fn generate_stream(
        &self,
        prompt: &str,
        params: GenerationParams,
    ) -> Result<(UnboundedReceiver<StreamEvent>, Arc<AtomicBool>), GenerationError> {
        if !self.is_ready() {
            return Err(GenerationError::NotReady);
        }
        let command_tx = self.command_tx.as_ref().ok_or(GenerationError::NotReady)?;

        // Create channel for streaming events
        let (event_tx, event_rx) = unbounded_channel();

        // Create stop signal
        let stop_signal = Arc::new(AtomicBool::new(false));

        // Send generate command to worker
        command_tx
            .send(WorkerCommand::Generate {
                prompt: prompt.to_string(),
                params,
                event_tx,
                stop_signal: stop_signal.clone(),
            })
            .map_err(|e| {
                GenerationError::StepFailure(format!("inference worker unavailable: {e}"))
            })?;

        Ok((event_rx, stop_signal))
    }
}

impl Default for InferenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        // Send shutdown command
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(WorkerCommand::Shutdown);
        }
        // Wait for worker thread to finish
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and LlamaModel, processes commands from main thread.
fn worker_thread_main(command_rx: Receiver<WorkerCommand>) {
    let mut backend: Option<LlamaBackend> = None;
    let mut model: Option<LlamaModel> = None;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::Init) => match LlamaBackend::init() {
                Ok(b) => {
                    backend = Some(b);
                    tracing::info!("LlamaBackend initialized in worker thread");
                }
                Err(e) => {
                    tracing::error!("Failed to init backend: {}", e);
                }
            },
            Ok(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            }) => {
                let result = load_model_internal(&backend, &path, gpu_layers);
                match result {
                    Ok((m, info)) => {
                        tracing::info!("Model loaded: {} ({})", info.path, info.load_report());
                        model = Some(m);
                        let _ = response_tx.send(Ok(info));
                    }
                    Err(e) => {
                        let _ = response_tx.send(Err(e));
                    }
                }
            }
            Ok(WorkerCommand::UnloadModel) => {
                model = None;
                tracing::info!("Model unloaded in worker thread");
            }
            Ok(WorkerCommand::Generate {
                prompt,
                params,
                event_tx,
                stop_signal,
            }) => {
                if let (Some(ref b), Some(ref m)) = (&backend, &model) {
                    match run_generation(b, m, &prompt, &params, &event_tx, &stop_signal) {
                        Ok(outcome) => {
                            tracing::info!(
                                "Generation finished: {:?}, {} fragments",
                                outcome.end,
                                outcome.fragments_emitted
                            );
                        }
                        Err(e) => {
                            tracing::error!("Generation aborted: {}", e);
                            let _ = event_tx.send(StreamEvent::Error(e));
                        }
                    }
                } else {
                    let _ = event_tx.send(StreamEvent::Error(GenerationError::NotReady));
                }
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                // Channel closed, exit
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

/// Load a model and extract its info (helper for worker thread)
fn load_model_internal(
    backend: &Option<LlamaBackend>,
    path: &Path,
    gpu_layers: u32,
) -> Result<(LlamaModel, LoadedModelInfo), EngineError> {
    let backend = backend.as_ref().ok_or(EngineError::BackendNotInitialized)?;

    let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);

    let started = Instant::now();
    let model = LlamaModel::load_from_file(backend, path, &model_params)
        .map_err(|e| EngineError::ModelLoad(e.to_string()))?;
    let load_time = started.elapsed();

    let info = LoadedModelInfo {
        path: path.to_string_lossy().to_string(),
        vocab_size: model.n_vocab(),
        embedding_dim: model.n_embd(),
        context_length: model.n_ctx_train(),
        param_count: model.n_params() as u64,
        size_bytes: model.size() as u64,
        load_time,
    };

    tracing::info!(
        "Model info extracted: {} ({} params, {} vocab, {} ctx)",
        info.path,
        info.param_count,
        info.vocab_size,
        info.context_length
    );

    Ok((model, info))
}

/// Sets up one generation session and drives it to completion (worker side)
///
/// Errors returned here occur before the first step runs; everything after
/// that is handled inside the session loop.
fn run_generation(
    backend: &LlamaBackend,
    model: &LlamaModel,
    user_prompt: &str,
    params: &GenerationParams,
    event_tx: &UnboundedSender<StreamEvent>,
    stop_signal: &AtomicBool,
) -> Result<SessionOutcome, GenerationError> {
    let prompt = format_prompt(&params.system_prompt, user_prompt);

    // Encode the formatted prompt
    let tokens = model
        .str_to_token(&prompt, AddBos::Always)
        .map_err(|e| GenerationError::EncodingFailed(e.to_string()))?;
    tracing::debug!("Encoded prompt into {} tokens", tokens.len());

    // Context sized to the total-length budget, clamped to what the model
    // was trained for
    let n_ctx = std::cmp::min(params.max_length, model.n_ctx_train());
    let n_ctx = std::cmp::max(n_ctx, 512);
    let n_batch = std::cmp::max(tokens.len() as u32, 512);

    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(Some(NonZeroU32::new(n_ctx).unwrap()))
        .with_n_batch(n_batch);

    let ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| GenerationError::StepFailure(format!("failed to create context: {e}")))?;

    let sampler = build_sampler(params);
    let generator = LlamaGenerator::new(model, ctx, sampler, tokens, params.max_length as usize)
        .map_err(GenerationError::StepFailure)?;
    let decoder = LlamaDecodeStream::new(model);

    let config = SessionConfig {
        step_yield: params.step_yield,
        ..SessionConfig::default()
    };
    Ok(GenerationSession::new(generator, decoder, config).run(event_tx, stop_signal))
}

/// Builds the sampler chain for the given parameters
fn build_sampler(params: &GenerationParams) -> LlamaSampler {
    let seed = if params.seed == 0 {
        entropy_seed()
    } else {
        params.seed
    };

    if params.temperature < 0.01 {
        // Use greedy sampling for very low temperature
        LlamaSampler::greedy()
    } else {
        // Chain samplers for controlled randomness
        LlamaSampler::chain_simple([
            LlamaSampler::top_k(params.top_k as i32),
            LlamaSampler::top_p(params.top_p, 1),
            LlamaSampler::temp(params.temperature),
            LlamaSampler::dist(seed),
        ])
    }
}

/// llama-cpp-backed generator for one session
///
/// Owns the context, batch, and sampler; the batch is allocated for a single
/// concurrent sequence and the first `compute_scores` call processes the
/// whole prompt (the session's one-time setup cost).
struct LlamaGenerator<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    sampler: LlamaSampler,
    batch: LlamaBatch,
    /// Prompt tokens followed by every generated token
    sequence: Vec<LlamaToken>,
    /// Position of the next token to stage
    n_past: i32,
    /// Total-sequence budget, prompt included
    max_length: usize,
    done: bool,
}

impl<'m> LlamaGenerator<'m> {
    fn new(
        model: &'m LlamaModel,
        ctx: LlamaContext<'m>,
        sampler: LlamaSampler,
        prompt_tokens: Vec<LlamaToken>,
        max_length: usize,
    ) -> Result<Self, String> {
        if prompt_tokens.is_empty() {
            return Err("prompt encoded to an empty token sequence".to_string());
        }

        let mut batch = LlamaBatch::new(std::cmp::max(prompt_tokens.len(), 512), 1);
        let last_index = prompt_tokens.len() - 1;
        for (i, token) in prompt_tokens.iter().enumerate() {
            batch
                .add(*token, i as i32, &[0], i == last_index)
                .map_err(|e| format!("failed to add token to batch: {e}"))?;
        }

        let n_past = prompt_tokens.len() as i32;
        let done = prompt_tokens.len() >= max_length;
        Ok(Self {
            model,
            ctx,
            sampler,
            batch,
            sequence: prompt_tokens,
            n_past,
            max_length,
            done,
        })
    }
}

impl TokenGenerator for LlamaGenerator<'_> {
    fn is_done(&self) -> bool {
        self.done
    }

    fn compute_scores(&mut self) -> Result<(), String> {
        self.ctx
            .decode(&mut self.batch)
            .map_err(|e| format!("failed to decode batch: {e}"))
    }

    fn append_next_token(&mut self) -> Result<(), String> {
        let token = self.sampler.sample(&self.ctx, self.batch.n_tokens() - 1);
        self.sampler.accept(token);
        self.sequence.push(token);

        if self.model.is_eog_token(token) || self.sequence.len() >= self.max_length {
            self.done = true;
            return Ok(());
        }

        // Stage the new token for the next scoring pass
        self.batch.clear();
        self.batch
            .add(token, self.n_past, &[0], true)
            .map_err(|e| format!("failed to add token to batch: {e}"))?;
        self.n_past += 1;
        Ok(())
    }

    fn last_token(&self) -> Option<TokenId> {
        self.sequence.last().map(|t| t.0)
    }
}

/// Incremental token-to-text decoder over the model vocabulary
///
/// Token pieces are raw bytes; an incomplete trailing UTF-8 sequence is held
/// back until the bytes that finish it arrive, so a call may yield an empty
/// fragment.
struct LlamaDecodeStream<'m> {
    model: &'m LlamaModel,
    pending: Vec<u8>,
}

impl<'m> LlamaDecodeStream<'m> {
    fn new(model: &'m LlamaModel) -> Self {
        Self {
            model,
            pending: Vec::new(),
        }
    }
}

impl DecodeStream for LlamaDecodeStream<'_> {
    fn decode_next(&mut self, token: TokenId) -> Result<String, String> {
        let bytes = self
            .model
            .token_to_bytes(LlamaToken(token), Special::Tokenize)
            .map_err(|e| format!("failed to convert token to bytes: {e}"))?;
        self.pending.extend_from_slice(&bytes);

        match std::str::from_utf8(&self.pending) {
            Ok(s) => {
                let fragment = s.to_string();
                self.pending.clear();
                Ok(fragment)
            }
            Err(e) if e.error_len().is_none() => {
                // Incomplete trailing sequence; emit the valid prefix and
                // hold the rest back
                let valid = e.valid_up_to();
                let fragment = String::from_utf8(self.pending[..valid].to_vec())
                    .map_err(|e| format!("invalid UTF-8 prefix: {e}"))?;
                self.pending.drain(..valid);
                Ok(fragment)
            }
            Err(_) => {
                // Genuinely invalid bytes; replace rather than stall the stream
                let fragment = String::from_utf8_lossy(&self.pending).into_owned();
                self.pending.clear();
                Ok(fragment)
            }
        }
    }
}

/// Generates a random seed using system entropy
fn entropy_seed() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    RandomState::new().build_hasher().finish() as u32
}
