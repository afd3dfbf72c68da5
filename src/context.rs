//! The inference context.
//!
//! A [`Context`] owns one loaded engine session and everything that belongs to
//! a single conversation with it: token history, sampler, stop flags, adapter
//! list and timings. It is driven through `&mut self` only, so at most one
//! request is in flight at a time.
//!
//! Lifecycle of a completion:
//!
//! ```text
//! Idle --load_prompt--> Ready --begin_completion--> Decoding --next_token--> Stopped(reason)
//!   ^                                                                            |
//!   +---------------------- load_prompt / rewind / embedding -------------------+
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, info_span};
use uuid::Uuid;

use cactus_engine::{AdapterHandle, Batch, ComputeEngine, ModelLoader, ModelMetadata, TokenId};
use cactus_runtime::{CompletionTimings, InferenceTimer, NoopTelemetry, TelemetryHook};
use cactus_sampling::{Sampler, SamplingConfig};
use cactus_tokenizer::StreamDecoder;

use crate::completion::StopReason;
use crate::error::{ContextError, Result};
use crate::lora::LoraAdapter;
use crate::params::ContextParams;
use crate::prompt::{common_prefix, TruncationPolicy};

/// Where the context is in the request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No request loaded.
    Idle,
    /// Prompt evaluated, decoding not started.
    Ready,
    /// Decoding; `next_token` produces tokens.
    Decoding,
    /// Decoding ended. Stays until the next request.
    Stopped(StopReason),
}

/// Cross-thread flag that ends the running completion at its next step.
#[derive(Debug, Clone, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of [`Context::load_prompt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptInfo {
    /// Prompt length after truncation.
    pub n_tokens: usize,
    /// Leading tokens reused from the previous request.
    pub n_reused: usize,
    /// Tokens evaluated for this request.
    pub n_evaluated: usize,
    pub truncated: bool,
}

/// A loaded model plus per-conversation state.
pub struct Context {
    pub(crate) id: Uuid,
    pub(crate) params: ContextParams,
    pub(crate) engine: Box<dyn ComputeEngine>,
    pub(crate) n_ctx: usize,
    pub(crate) policy: TruncationPolicy,
    pub(crate) state: ContextState,

    pub(crate) history: Vec<TokenId>,
    pub(crate) n_past: usize,
    pub(crate) truncated: bool,
    pub(crate) num_prompt_tokens: usize,
    pub(crate) num_tokens_predicted: usize,

    pub(crate) has_next_token: bool,
    pub(crate) stopped_eos: bool,
    pub(crate) stopped_limit: bool,
    pub(crate) stopped_word: bool,
    pub(crate) stopping_word: Option<String>,

    pub(crate) sampler: Option<Sampler>,
    pub(crate) decoder: StreamDecoder,
    pub(crate) generated_text: String,
    /// Bytes of `generated_text` already handed to the caller.
    pub(crate) sent: usize,

    pub(crate) interrupt: InterruptHandle,
    pub(crate) telemetry: Arc<dyn TelemetryHook>,
    pub(crate) timer: Option<InferenceTimer>,
    pub(crate) timings: CompletionTimings,

    pub(crate) lora: Vec<LoraAdapter>,
    pub(crate) adapter_handles: HashMap<PathBuf, AdapterHandle>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("n_ctx", &self.n_ctx)
            .field("state", &self.state)
            .field("n_past", &self.n_past)
            .field("lora", &self.lora)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Validate `params`, load the model and attach the configured adapters.
    pub fn load(params: ContextParams, loader: &dyn ModelLoader) -> Result<Self> {
        let id = Uuid::new_v4();
        let span = info_span!("context", id = %id);
        let _enter = span.enter();

        params.validate()?;
        let engine = loader.load(&params.to_model_spec())?;
        let n_ctx = engine.n_ctx();
        let policy = TruncationPolicy::new(n_ctx, params.n_keep);
        let adapters = params.lora.clone();

        let mut ctx = Self {
            id,
            params,
            engine,
            n_ctx,
            policy,
            state: ContextState::Idle,
            history: Vec::with_capacity(n_ctx),
            n_past: 0,
            truncated: false,
            num_prompt_tokens: 0,
            num_tokens_predicted: 0,
            has_next_token: false,
            stopped_eos: false,
            stopped_limit: false,
            stopped_word: false,
            stopping_word: None,
            sampler: None,
            decoder: StreamDecoder::new(),
            generated_text: String::new(),
            sent: 0,
            interrupt: InterruptHandle::default(),
            telemetry: Arc::new(NoopTelemetry),
            timer: None,
            timings: CompletionTimings::default(),
            lora: Vec::new(),
            adapter_handles: HashMap::new(),
        };
        if !adapters.is_empty() {
            ctx.apply_lora_adapters(&adapters)?;
        }

        let meta = ctx.engine.metadata();
        info!(
            model = %meta.description,
            n_ctx,
            n_embd = meta.n_embd,
            n_params = meta.n_params,
            "context loaded"
        );
        Ok(ctx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn params(&self) -> &ContextParams {
        &self.params
    }

    // -----------------------------------------------------------------------
    // Metadata
    // -----------------------------------------------------------------------

    pub fn metadata(&self) -> &ModelMetadata {
        self.engine.metadata()
    }

    pub fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    pub fn n_batch(&self) -> usize {
        self.params.n_batch
    }

    pub fn n_embd(&self) -> usize {
        self.engine.metadata().n_embd
    }

    pub fn n_vocab(&self) -> usize {
        self.engine.vocab().n_vocab()
    }

    pub fn model_desc(&self) -> &str {
        &self.engine.metadata().description
    }

    pub fn model_size(&self) -> u64 {
        self.engine.metadata().size_bytes
    }

    pub fn model_params(&self) -> u64 {
        self.engine.metadata().n_params
    }

    /// Chat template embedded in the model, if any.
    pub fn chat_template(&self) -> Option<&str> {
        self.engine.metadata().chat_template.as_deref()
    }

    pub fn truncation_policy(&self) -> &TruncationPolicy {
        &self.policy
    }

    // -----------------------------------------------------------------------
    // Tokenizer passthrough
    // -----------------------------------------------------------------------

    pub fn tokenize(&self, text: &str, add_special: bool) -> Result<Vec<TokenId>> {
        Ok(self.engine.vocab().tokenize(text, add_special, true)?)
    }

    pub fn detokenize(&self, tokens: &[TokenId]) -> Result<String> {
        Ok(self.engine.vocab().detokenize(tokens)?)
    }

    // -----------------------------------------------------------------------
    // Request state
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    /// Tokens currently held by the engine cache.
    pub fn n_past(&self) -> usize {
        self.n_past
    }

    pub fn has_next_token(&self) -> bool {
        self.has_next_token
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn stopped_eos(&self) -> bool {
        self.stopped_eos
    }

    pub fn stopped_limit(&self) -> bool {
        self.stopped_limit
    }

    pub fn stopped_word(&self) -> bool {
        self.stopped_word
    }

    pub fn stopping_word(&self) -> Option<&str> {
        self.stopping_word.as_deref()
    }

    pub fn num_prompt_tokens(&self) -> usize {
        self.num_prompt_tokens
    }

    pub fn num_tokens_predicted(&self) -> usize {
        self.num_tokens_predicted
    }

    /// Text generated so far, cut at a matched stop string.
    pub fn generated_text(&self) -> &str {
        &self.generated_text
    }

    /// Timings of the last finished completion.
    pub fn timings(&self) -> CompletionTimings {
        self.timings
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    pub fn set_telemetry(&mut self, hook: Arc<dyn TelemetryHook>) {
        self.telemetry = hook;
    }

    /// Active sampler, once [`init_sampling`](Self::init_sampling) succeeded.
    pub fn sampler(&self) -> Option<&Sampler> {
        self.sampler.as_ref()
    }

    // -----------------------------------------------------------------------
    // Request setup
    // -----------------------------------------------------------------------

    /// Build the sampler for the next request. A JSON schema without an
    /// explicit grammar is converted to one. On error the previous sampler
    /// stays in place.
    pub fn init_sampling(&mut self, mut config: SamplingConfig) -> Result<()> {
        if config.grammar.is_none() {
            if let Some(schema) = &config.json_schema {
                config.grammar = Some(cactus_chat::json_schema_to_grammar(schema)?);
            }
        }
        let sampler = Sampler::new(config)?;
        debug!(seed = sampler.seed(), grammar = sampler.has_grammar(), "sampler ready");
        self.sampler = Some(sampler);
        Ok(())
    }

    /// Tokenize, truncate and evaluate a prompt.
    ///
    /// Tokens shared with the previous request's history are kept in the
    /// cache; the last prompt token is always evaluated again so fresh logits
    /// exist. A tokenizer error fails this request only.
    pub fn load_prompt(&mut self, prompt: &str) -> Result<PromptInfo> {
        let span = info_span!("context", id = %self.id);
        let _enter = span.enter();

        if self.sampler.is_none() {
            return Err(ContextError::Misuse(
                "init_sampling must be called before load_prompt".to_string(),
            ));
        }
        let tokens = self.engine.vocab().tokenize(prompt, true, true)?;
        if tokens.is_empty() {
            return Err(ContextError::EmptyPrompt);
        }
        let prepared = self.policy.prepare(tokens);

        self.reset_request();
        self.state = ContextState::Idle;

        // The final token of a finished completion is in the history but was
        // never evaluated.
        let mut reused = common_prefix(&self.history, &prepared.tokens).min(self.n_past);
        if reused == prepared.tokens.len() {
            reused -= 1;
        }
        self.engine.truncate(0, reused)?;
        self.history.truncate(reused);
        self.n_past = reused;

        let n_evaluated = prepared.tokens.len() - reused;
        let mut timer = InferenceTimer::new(n_evaluated, Arc::clone(&self.telemetry));
        for chunk in prepared.tokens[reused..].chunks(self.params.n_batch) {
            let batch = Batch::from_tokens(chunk, self.n_past, 0);
            self.engine.evaluate(&batch)?;
            self.history.extend_from_slice(chunk);
            self.n_past += chunk.len();
        }
        timer.mark_prompt_evaluated();

        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
            sampler.accept_prompt(&prepared.tokens);
        }
        self.timer = Some(timer);
        self.truncated = prepared.truncated;
        self.num_prompt_tokens = prepared.tokens.len();
        self.state = ContextState::Ready;

        debug!(
            n_tokens = prepared.tokens.len(),
            n_reused = reused,
            n_evaluated,
            truncated = prepared.truncated,
            "prompt loaded"
        );
        Ok(PromptInfo {
            n_tokens: prepared.tokens.len(),
            n_reused: reused,
            n_evaluated,
            truncated: prepared.truncated,
        })
    }

    /// Start decoding the loaded prompt.
    pub fn begin_completion(&mut self) -> Result<()> {
        if self.state != ContextState::Ready {
            return Err(ContextError::Misuse(format!(
                "begin_completion needs a loaded prompt, context is {:?}",
                self.state
            )));
        }
        self.interrupt.clear();
        self.state = ContextState::Decoding;
        self.has_next_token = true;

        let n_predict = self.sampler.as_ref().and_then(|s| s.config().n_predict);
        if n_predict == Some(0) {
            self.stopped_limit = true;
            self.finish(StopReason::Limit);
        }
        Ok(())
    }

    /// Forget the conversation: history, flags and engine cache.
    pub fn rewind(&mut self) {
        self.reset_request();
        self.clear_cache();
        self.truncated = false;
        self.num_prompt_tokens = 0;
        self.state = ContextState::Idle;
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.reset();
        }
    }

    // -----------------------------------------------------------------------
    // Internal helpers
    // -----------------------------------------------------------------------

    pub(crate) fn reset_request(&mut self) {
        self.has_next_token = false;
        self.stopped_eos = false;
        self.stopped_limit = false;
        self.stopped_word = false;
        self.stopping_word = None;
        self.num_tokens_predicted = 0;
        self.generated_text.clear();
        self.sent = 0;
        self.decoder.clear();
        self.timer = None;
    }

    pub(crate) fn clear_cache(&mut self) {
        self.engine.clear();
        self.history.clear();
        self.n_past = 0;
    }

    /// Enter a terminal state and close the timings.
    pub(crate) fn finish(&mut self, reason: StopReason) {
        self.state = ContextState::Stopped(reason);
        self.has_next_token = false;
        if let Some(timer) = self.timer.take() {
            self.timings = timer.finish();
        }
        debug!(
            ?reason,
            n_predicted = self.num_tokens_predicted,
            stopping_word = self.stopping_word.as_deref(),
            "completion finished"
        );
    }

    /// Record an error that ends decoding.
    pub(crate) fn fail(&mut self, err: ContextError) -> ContextError {
        tracing::warn!(error = %err, "completion failed");
        self.finish(StopReason::Error);
        err
    }
}
