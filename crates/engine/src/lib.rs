//! Chat engine: a decoder runtime behind a streaming sampler.
//!
//! Every backend implements one contract — `info`, `load`, `unload`,
//! `reset_session`, `chat`, `embed` and `capabilities` — dispatched over a
//! tagged [`Engine`] variant.
//! One backend ships today; its chat loop tokenizes, prefills, then decodes
//! one token per step, pushing [`TokenEvent`]s to a synchronous callback
//! and to the process-wide subscriber list. Cancellation is a predicate
//! polled before each step.

#![deny(unsafe_code)]

pub mod sampler;
pub mod stream;
pub mod tokenizer;

pub use sampler::Sampling;
pub use stream::{add_stream_subscriber, clear_stream_subscribers, StreamSubscriber};
pub use tokenizer::{ByteTokenizer, Tokenizer};

use model::{ModelError, Runtime, Weights};
use rand::rngs::StdRng;
use rand::SeedableRng;
use sampler::TokenRate;
use std::collections::VecDeque;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Weight loading or decoding failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// The caller's predicate cancelled the stream. The terminal token
    /// event has already been emitted when this is returned.
    #[error("generation cancelled")]
    Cancelled,
    /// No backend with that name exists.
    #[error("unknown backend: {0}")]
    UnknownBackend(String),
    /// `chat`/`embed` called before a successful `load`.
    #[error("engine not loaded")]
    NotLoaded,
}

/// Static description of a loaded engine.
#[derive(Debug, Clone)]
pub struct EngineInfo {
    /// Engine name.
    pub name: String,
    /// Engine version.
    pub version: String,
    /// Backend identifier (see [`Engine::available_backends`]).
    pub backend: String,
    /// Context window (repetition-penalty scope).
    pub ctx_len: usize,
    /// Tokenizer vocabulary size.
    pub vocab_size: usize,
}

/// Options for loading a model into an engine.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Weight file path.
    pub model_path: PathBuf,
    /// Context window for the repetition-penalty scope.
    pub ctx_len: usize,
    /// Worker thread hint; 0 lets the backend decide.
    pub n_threads: usize,
    /// Optional prompt template name ("chat" is built in).
    pub template_name: Option<String>,
}

impl LoadOptions {
    /// Defaults matching the engine configuration contract.
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self { model_path: model_path.into(), ctx_len: 4096, n_threads: 0, template_name: None }
    }
}

/// One streamed piece of generated text.
#[derive(Debug, Clone)]
pub struct TokenEvent {
    /// Decoded text piece; empty on the terminal event.
    pub text: String,
    /// True exactly once, on the final event of a generation.
    pub is_final: bool,
    /// Tokens per second since generation started.
    pub tokens_per_sec: f64,
}

fn apply_template(template_name: Option<&str>, prompt: &str) -> String {
    match template_name {
        Some("chat") => format!("User: {prompt}\nAssistant:"),
        _ => prompt.to_string(),
    }
}

// Advisory begin/end lines through the process-wide log sink. Purely
// observational: the sink never influences generation.
struct RunScope {
    tag: &'static str,
    start: std::time::Instant,
}

impl RunScope {
    fn new(tag: &'static str, sample: &str) -> Self {
        let mut digest: String = sample.chars().take(120).collect();
        if digest.len() < sample.len() {
            digest.push_str("...");
        }
        telemetry::emit(&format!("{tag} start: {digest}"));
        Self { tag, start: std::time::Instant::now() }
    }
}

impl Drop for RunScope {
    fn drop(&mut self) {
        telemetry::emit(&format!("{} done: {}ms", self.tag, self.start.elapsed().as_millis()));
    }
}

fn emit_event(stream: bool, on_token: &mut dyn FnMut(&TokenEvent), ev: &TokenEvent) {
    if stream {
        if !ev.text.is_empty() {
            stream::notify_subscribers(&ev.text);
        }
        on_token(ev);
    }
}

/// The built-in backend: byte tokenizer + local decoder runtime.
pub struct LocalEngine {
    tokenizer: ByteTokenizer,
    runtime: Option<Runtime>,
    ctx_len: usize,
    template_name: Option<String>,
    recent_ids: VecDeque<u32>,
    rng: StdRng,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    /// A fresh, unloaded engine with OS-seeded sampling.
    pub fn new() -> Self {
        Self {
            tokenizer: ByteTokenizer,
            runtime: None,
            ctx_len: 4096,
            template_name: None,
            recent_ids: VecDeque::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// A fresh engine with a fixed sampling seed (reproducible streams).
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed), ..Self::new() }
    }

    /// Static engine description.
    pub fn info(&self) -> EngineInfo {
        EngineInfo {
            name: "local-transformer".into(),
            version: env!("CARGO_PKG_VERSION").into(),
            backend: "local".into(),
            ctx_len: self.ctx_len,
            vocab_size: self.tokenizer.vocab_size(),
        }
    }

    /// Load weights from disk and allocate a zeroed session.
    pub fn load(&mut self, opt: &LoadOptions) -> Result<(), EngineError> {
        let weights = Weights::load(&opt.model_path)?;
        self.runtime = Some(Runtime::new(weights)?);
        self.ctx_len = opt.ctx_len;
        self.template_name = opt.template_name.clone();
        self.recent_ids.clear();
        debug!(path = %opt.model_path.display(), ctx_len = self.ctx_len, "model loaded");
        Ok(())
    }

    /// Drop the runtime; the engine returns to the unloaded state.
    pub fn unload(&mut self) {
        self.runtime = None;
        self.recent_ids.clear();
    }

    /// Zero the KV cache and rewind the session.
    pub fn reset_session(&mut self) -> Result<(), EngineError> {
        let rt = self.runtime.as_mut().ok_or(EngineError::NotLoaded)?;
        rt.reset_session();
        self.recent_ids.clear();
        Ok(())
    }

    /// Generate a streamed completion for `prompt`.
    ///
    /// Tokenizes (optionally through the prompt template), prefills, then
    /// samples one token per step. Non-empty pieces are pushed to
    /// `on_token` and the global subscriber list when `sampling.stream` is
    /// set; a terminal event with `is_final = true` is always the last
    /// emission. `cancelled` is polled before each step.
    pub fn chat(
        &mut self,
        prompt: &str,
        sampling: &Sampling,
        on_token: &mut dyn FnMut(&TokenEvent),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError> {
        if self.runtime.is_none() {
            return Err(EngineError::NotLoaded);
        }
        let _scope = RunScope::new("chat", prompt);

        let rendered = apply_template(self.template_name.as_deref(), prompt);
        let ids = self.tokenizer.tokenize(&rendered);
        if ids.is_empty() {
            return Err(ModelError::EmptyInput.into());
        }

        let rt = self.runtime.as_mut().ok_or(EngineError::NotLoaded)?;
        let mut logits = rt.prefill(&ids)?;

        self.recent_ids.clear();
        self.recent_ids.extend(&ids);
        while self.recent_ids.len() > self.ctx_len {
            self.recent_ids.pop_front();
        }

        let mut rate = TokenRate::start();
        let terminal = |rate: &TokenRate| TokenEvent {
            text: String::new(),
            is_final: true,
            tokens_per_sec: rate.tps(),
        };

        for _ in 0..sampling.max_tokens {
            if cancelled() {
                emit_event(sampling.stream, on_token, &terminal(&rate));
                debug!("generation cancelled");
                return Err(EngineError::Cancelled);
            }

            let window = self.recent_ids.make_contiguous();
            let next = sampler::sample_from_logits(&logits, window, sampling, &mut self.rng);

            if self.tokenizer.is_eos(next) {
                emit_event(sampling.stream, on_token, &terminal(&rate));
                return Ok(());
            }

            let piece = self.tokenizer.decode(&[next]);
            if !piece.is_empty() {
                let ev = TokenEvent { text: piece, is_final: false, tokens_per_sec: rate.tps() };
                emit_event(sampling.stream, on_token, &ev);
            }
            rate.add(1);

            self.recent_ids.push_back(next);
            while self.recent_ids.len() > self.ctx_len {
                self.recent_ids.pop_front();
            }

            logits = rt.decode_step(next)?;
        }

        emit_event(sampling.stream, on_token, &terminal(&rate));
        Ok(())
    }

    /// Mean-pooled embedding of `text` over the token-embedding table.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        let rt = self.runtime.as_ref().ok_or(EngineError::NotLoaded)?;
        let _scope = RunScope::new("embed", text);
        let ids = self.tokenizer.tokenize(text);
        Ok(rt.embed_mean_pool(&ids)?)
    }

    /// Human-readable description of what this backend supports.
    pub fn capabilities(&self) -> String {
        format!(
            "prompt->completion chat with streaming output; sampling: temperature, top-k, \
             top-p, repetition penalty, min-prob; context up to {} tokens; embeddings: \
             mean-pooled",
            self.ctx_len
        )
    }
}

/// Engine backends, dispatched by match.
pub enum Engine {
    /// The built-in local transformer backend.
    Local(LocalEngine),
}

impl Engine {
    /// Construct an engine by backend name (case-insensitive).
    pub fn from_backend(name: &str) -> Result<Self, EngineError> {
        match name.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local(LocalEngine::new())),
            other => Err(EngineError::UnknownBackend(other.to_string())),
        }
    }

    /// Names accepted by [`Engine::from_backend`].
    pub fn available_backends() -> &'static [&'static str] {
        &["local"]
    }

    /// Static engine description.
    pub fn info(&self) -> EngineInfo {
        match self {
            Self::Local(e) => e.info(),
        }
    }

    /// Load weights.
    pub fn load(&mut self, opt: &LoadOptions) -> Result<(), EngineError> {
        match self {
            Self::Local(e) => e.load(opt),
        }
    }

    /// Return to the unloaded state.
    pub fn unload(&mut self) {
        match self {
            Self::Local(e) => e.unload(),
        }
    }

    /// Reset the decoding session.
    pub fn reset_session(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Local(e) => e.reset_session(),
        }
    }

    /// Streamed generation; see [`LocalEngine::chat`].
    pub fn chat(
        &mut self,
        prompt: &str,
        sampling: &Sampling,
        on_token: &mut dyn FnMut(&TokenEvent),
        cancelled: &dyn Fn() -> bool,
    ) -> Result<(), EngineError> {
        match self {
            Self::Local(e) => e.chat(prompt, sampling, on_token, cancelled),
        }
    }

    /// Text embedding; see [`LocalEngine::embed`].
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        match self {
            Self::Local(e) => e.embed(text),
        }
    }

    /// Backend capability description.
    pub fn capabilities(&self) -> String {
        match self {
            Self::Local(e) => e.capabilities(),
        }
    }
}
