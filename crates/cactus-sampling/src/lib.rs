//! # cactus-sampling
//!
//! Sampling configuration and the token sampler used by the inference context.
//!
//! Supports:
//! - Greedy (argmax) when temperature <= 0
//! - Repetition, frequency and presence penalties over a recent-token window
//! - Logit bias and EOS suppression
//! - GBNF grammar-constrained decoding (see [`grammar`])
//! - Top-k, top-p (nucleus) and min-p filtering, then temperature
//! - Deterministic seeded RNG for reproducible generation
//! - Top-n probability reporting

pub mod grammar;

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use cactus_tokenizer::{TokenId, Vocabulary};

pub use grammar::{Grammar, GrammarError, GrammarMatcher};

/// Sampling error type.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,
    #[error("Temperature must be a number")]
    InvalidTemperature,
    #[error("Invalid sampling configuration: {0}")]
    InvalidConfig(String),
    #[error("No valid tokens after filtering")]
    NoValidTokens,
    #[error("Token {0} rejected by grammar")]
    GrammarRejected(TokenId),
    #[error(transparent)]
    Grammar(#[from] GrammarError),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Deterministic RNG for reproducible sampling.
///
/// Uses a simple xorshift64 algorithm for fast, reproducible random numbers.
#[derive(Debug, Clone)]
pub struct SeededRng {
    state: u64,
}

impl SeededRng {
    pub fn new(seed: u64) -> Self {
        // Avoid zero state which would produce all zeros
        Self {
            state: if seed == 0 { 1 } else { seed },
        }
    }

    /// Generate next random float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        // xorshift64
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 40) as f32 / (1u64 << 24) as f32
    }
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Sampling configuration for one completion.
///
/// Immutable once a [`Sampler`] has been built from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Softmax temperature. `<= 0.0` selects greedy decoding.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Keep the K most likely tokens. 0 = disabled.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Nucleus threshold. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Drop tokens below `min_p * p(best)`. 0.0 = disabled.
    #[serde(default = "default_min_p")]
    pub min_p: f32,

    /// Number of recent tokens the penalties look at. 0 = disabled.
    #[serde(default = "default_penalty_last_n")]
    pub penalty_last_n: usize,

    /// Repetition penalty (1.0 = none).
    #[serde(default = "default_penalty_repeat")]
    pub penalty_repeat: f32,

    #[serde(default)]
    pub penalty_freq: f32,

    #[serde(default)]
    pub penalty_present: f32,

    /// RNG seed. `None` draws a fresh seed per sampler.
    #[serde(default)]
    pub seed: Option<u64>,

    /// GBNF grammar constraining the output.
    #[serde(default)]
    pub grammar: Option<String>,

    /// JSON schema constraining the output. Converted to a grammar by the
    /// caller when `grammar` is unset.
    #[serde(default)]
    pub json_schema: Option<serde_json::Value>,

    /// Stop strings; generation ends when any appears in the output.
    #[serde(default)]
    pub stop: Vec<String>,

    /// Maximum number of tokens to predict. `None` = until EOS or context full.
    #[serde(default)]
    pub n_predict: Option<usize>,

    /// Report the N most likely tokens with each sampled token.
    #[serde(default)]
    pub n_probs: usize,

    /// Never sample end-of-generation tokens.
    #[serde(default)]
    pub ignore_eos: bool,

    /// Additive per-token bias. `f32::NEG_INFINITY` bans a token.
    #[serde(default)]
    pub logit_bias: Vec<(TokenId, f32)>,
}

fn default_temperature() -> f32 {
    0.8
}
fn default_top_k() -> usize {
    40
}
fn default_top_p() -> f32 {
    0.95
}
fn default_min_p() -> f32 {
    0.05
}
fn default_penalty_last_n() -> usize {
    64
}
fn default_penalty_repeat() -> f32 {
    1.0
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: default_min_p(),
            penalty_last_n: default_penalty_last_n(),
            penalty_repeat: default_penalty_repeat(),
            penalty_freq: 0.0,
            penalty_present: 0.0,
            seed: None,
            grammar: None,
            json_schema: None,
            stop: Vec::new(),
            n_predict: None,
            n_probs: 0,
            ignore_eos: false,
            logit_bias: Vec::new(),
        }
    }
}

impl SamplingConfig {
    /// Greedy sampling (temperature = 0).
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 0,
            top_p: 1.0,
            min_p: 0.0,
            ..Self::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_min_p(mut self, p: f32) -> Self {
        self.min_p = p;
        self
    }

    pub fn with_repeat_penalty(mut self, last_n: usize, penalty: f32) -> Self {
        self.penalty_last_n = last_n;
        self.penalty_repeat = penalty;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_grammar(mut self, grammar: impl Into<String>) -> Self {
        self.grammar = Some(grammar.into());
        self
    }

    pub fn with_json_schema(mut self, schema: serde_json::Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_stop(mut self, stop: impl Into<String>) -> Self {
        self.stop.push(stop.into());
        self
    }

    pub fn with_n_predict(mut self, n: usize) -> Self {
        self.n_predict = Some(n);
        self
    }

    pub fn with_n_probs(mut self, n: usize) -> Self {
        self.n_probs = n;
        self
    }

    pub fn with_logit_bias(mut self, token: TokenId, bias: f32) -> Self {
        self.logit_bias.push((token, bias));
        self
    }

    pub fn validate(&self) -> SamplingResult<()> {
        if self.temperature.is_nan() {
            return Err(SamplingError::InvalidTemperature);
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(SamplingError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }
        if !(0.0..=1.0).contains(&self.min_p) {
            return Err(SamplingError::InvalidConfig(format!(
                "min_p must be in [0, 1], got {}",
                self.min_p
            )));
        }
        if !(self.penalty_repeat.is_finite() && self.penalty_repeat > 0.0) {
            return Err(SamplingError::InvalidConfig(format!(
                "penalty_repeat must be positive, got {}",
                self.penalty_repeat
            )));
        }
        if !(self.penalty_freq.is_finite() && self.penalty_present.is_finite()) {
            return Err(SamplingError::InvalidConfig(
                "frequency and presence penalties must be finite".to_string(),
            ));
        }
        if self.stop.iter().any(String::is_empty) {
            return Err(SamplingError::InvalidConfig(
                "stop strings must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sampler
// ---------------------------------------------------------------------------

/// Probability reported for one candidate token.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub token: TokenId,
    pub prob: f32,
}

/// Outcome of one sampling step.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub token: TokenId,
    /// Top `n_probs` candidates of the final distribution, most likely first.
    pub top: Vec<Candidate>,
}

/// Stateful sampler built from a [`SamplingConfig`].
///
/// Chain order: penalties, logit bias, EOS suppression, grammar mask, then
/// either argmax (greedy) or top-k, top-p, min-p, temperature and a draw.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: SamplingConfig,
    rng: SeededRng,
    seed: u64,
    recent: VecDeque<TokenId>,
    grammar: Option<GrammarMatcher>,
}

impl Sampler {
    pub fn new(config: SamplingConfig) -> SamplingResult<Self> {
        config.validate()?;
        let grammar = match &config.grammar {
            Some(src) => Some(GrammarMatcher::new(Grammar::parse(src)?)),
            None => None,
        };
        let seed = config.seed.unwrap_or_else(rand::random);
        Ok(Self {
            rng: SeededRng::new(seed),
            seed,
            recent: VecDeque::with_capacity(config.penalty_last_n),
            grammar,
            config,
        })
    }

    pub fn config(&self) -> &SamplingConfig {
        &self.config
    }

    /// Seed in use (drawn at construction when unset).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn has_grammar(&self) -> bool {
        self.grammar.is_some()
    }

    /// Forget the penalty window and rewind the grammar. The RNG keeps advancing.
    pub fn reset(&mut self) {
        self.recent.clear();
        if let Some(grammar) = &mut self.grammar {
            grammar.reset();
        }
    }

    /// Feed prompt tokens into the penalty window only.
    pub fn accept_prompt(&mut self, tokens: &[TokenId]) {
        for &token in tokens {
            self.remember(token);
        }
    }

    /// Record a generated token: penalty window and grammar state.
    pub fn accept(&mut self, token: TokenId, vocab: &dyn Vocabulary) -> SamplingResult<()> {
        if let Some(grammar) = &mut self.grammar {
            if !vocab.is_eog(token) {
                let piece = vocab
                    .token_to_piece(token, false)
                    .map_err(|_| SamplingError::GrammarRejected(token))?;
                if !grammar.accept_bytes(&piece) {
                    return Err(SamplingError::GrammarRejected(token));
                }
            }
        }
        self.remember(token);
        Ok(())
    }

    fn remember(&mut self, token: TokenId) {
        if self.config.penalty_last_n == 0 {
            return;
        }
        if self.recent.len() == self.config.penalty_last_n {
            self.recent.pop_front();
        }
        self.recent.push_back(token);
    }

    /// Pick the next token from raw logits.
    pub fn sample(&mut self, logits: &[f32], vocab: &dyn Vocabulary) -> SamplingResult<Sample> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }

        let mut work = logits.to_vec();
        self.apply_penalties(&mut work);

        for &(token, bias) in &self.config.logit_bias {
            if let Some(logit) = usize::try_from(token).ok().and_then(|i| work.get_mut(i)) {
                *logit += bias;
            }
        }

        if self.config.ignore_eos {
            for (i, logit) in work.iter_mut().enumerate() {
                if vocab.is_eog(i as TokenId) {
                    *logit = f32::NEG_INFINITY;
                }
            }
        }

        if let Some(grammar) = &self.grammar {
            Self::apply_grammar(grammar, vocab, &mut work);
        }

        let mut candidates: Vec<(TokenId, f32)> = work
            .iter()
            .enumerate()
            .filter(|(_, l)| **l > f32::NEG_INFINITY)
            .map(|(i, &l)| (i as TokenId, l))
            .collect();
        if candidates.is_empty() {
            return Err(SamplingError::NoValidTokens);
        }
        candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        if self.config.temperature <= 0.0 {
            let token = candidates[0].0;
            let probs = softmax(&candidates);
            return Ok(Sample {
                token,
                top: self.top_n(&candidates, &probs),
            });
        }

        if self.config.top_k > 0 && self.config.top_k < candidates.len() {
            candidates.truncate(self.config.top_k);
        }

        let probs = softmax(&candidates);
        if self.config.top_p < 1.0 {
            let mut cumsum = 0.0;
            let mut keep = candidates.len();
            for (i, p) in probs.iter().enumerate() {
                cumsum += p;
                if cumsum >= self.config.top_p {
                    keep = i + 1;
                    break;
                }
            }
            candidates.truncate(keep);
        }

        if self.config.min_p > 0.0 {
            let probs = softmax(&candidates);
            let threshold = probs[0] * self.config.min_p;
            let keep = probs.iter().take_while(|&&p| p >= threshold).count().max(1);
            candidates.truncate(keep);
        }

        for candidate in &mut candidates {
            candidate.1 /= self.config.temperature;
        }
        let probs = softmax(&candidates);
        let token = self.draw(&candidates, &probs)?;
        Ok(Sample {
            token,
            top: self.top_n(&candidates, &probs),
        })
    }

    /// Each distinct token in the window is penalised once.
    fn apply_penalties(&self, logits: &mut [f32]) {
        if self.recent.is_empty() {
            return;
        }
        let cfg = &self.config;
        if cfg.penalty_repeat == 1.0 && cfg.penalty_freq == 0.0 && cfg.penalty_present == 0.0 {
            return;
        }

        let mut counts: HashMap<TokenId, usize> = HashMap::new();
        for &token in &self.recent {
            *counts.entry(token).or_default() += 1;
        }
        for (token, count) in counts {
            let Some(logit) = usize::try_from(token).ok().and_then(|i| logits.get_mut(i)) else {
                continue;
            };
            if *logit > 0.0 {
                *logit /= cfg.penalty_repeat;
            } else {
                *logit *= cfg.penalty_repeat;
            }
            *logit -= count as f32 * cfg.penalty_freq + cfg.penalty_present;
        }
    }

    fn apply_grammar(grammar: &GrammarMatcher, vocab: &dyn Vocabulary, logits: &mut [f32]) {
        let accepting = grammar.is_accepting();
        for (i, logit) in logits.iter_mut().enumerate() {
            if *logit == f32::NEG_INFINITY {
                continue;
            }
            let token = i as TokenId;
            let allowed = if vocab.is_eog(token) {
                accepting
            } else {
                match vocab.token_to_piece(token, false) {
                    Ok(piece) if !piece.is_empty() => grammar.accepts_bytes(&piece),
                    _ => false,
                }
            };
            if !allowed {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn draw(&mut self, candidates: &[(TokenId, f32)], probs: &[f32]) -> SamplingResult<TokenId> {
        let r = self.rng.next_f32();
        let mut cumsum = 0.0;
        for (candidate, &prob) in candidates.iter().zip(probs) {
            cumsum += prob;
            if r < cumsum {
                return Ok(candidate.0);
            }
        }

        // Fallback to last token with nonzero probability
        candidates
            .iter()
            .zip(probs)
            .rev()
            .find(|&(_, &p)| p > 0.0)
            .map(|(c, _)| c.0)
            .ok_or(SamplingError::NoValidTokens)
    }

    fn top_n(&self, candidates: &[(TokenId, f32)], probs: &[f32]) -> Vec<Candidate> {
        candidates
            .iter()
            .zip(probs)
            .take(self.config.n_probs)
            .map(|(c, &prob)| Candidate { token: c.0, prob })
            .collect()
    }
}

/// Softmax over candidate logits (already sorted, all finite).
fn softmax(candidates: &[(TokenId, f32)]) -> Vec<f32> {
    let max_logit = candidates
        .iter()
        .map(|c| c.1)
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = candidates.iter().map(|c| (c.1 - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();

    if sum > 0.0 && sum.is_finite() {
        exps.iter().map(|&e| e / sum).collect()
    } else {
        vec![1.0 / candidates.len() as f32; candidates.len()]
    }
}
