//! # cactus-engine
//!
//! The "narrow waist" of the cactus stack. Defines the [`ComputeEngine`] trait
//! and the types every other crate depends on. The inference context drives a
//! loaded model only through this boundary, so a llama.cpp FFI backend, a
//! reference CPU engine or a test mock can be swapped without changing the
//! session layer.
//!
//! ## Design Notes
//!
//! ### Exclusive Ownership
//! `ComputeEngine` methods that touch the KV cache take `&mut self`. An engine
//! session is owned by exactly one context and is never shared; independent
//! contexts load independent engines.
//!
//! ### Token Type
//! `TokenId` is re-exported from `cactus-tokenizer` (i32 for FFI compat).

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use cactus_tokenizer::{TokenId, TokenizerError, Vocabulary};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level error type for all engine operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(#[from] TokenizerError),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Adapter rejected: {0}")]
    Adapter(String),
    #[error("Unsupported cache type: {0}")]
    InvalidCacheType(String),
    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

// ---------------------------------------------------------------------------
// KV cache element type
// ---------------------------------------------------------------------------

/// Element type used for the key or value half of the attention cache.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KvCacheType {
    #[serde(rename = "f32")]
    F32,
    #[default]
    #[serde(rename = "f16")]
    F16,
    #[serde(rename = "bf16")]
    BF16,
    #[serde(rename = "q8_0")]
    Q8_0,
    #[serde(rename = "q4_0")]
    Q4_0,
    #[serde(rename = "q4_1")]
    Q4_1,
    #[serde(rename = "iq4_nl")]
    IQ4_NL,
    #[serde(rename = "q5_0")]
    Q5_0,
    #[serde(rename = "q5_1")]
    Q5_1,
}

impl KvCacheType {
    const NAMES: [(KvCacheType, &'static str); 9] = [
        (KvCacheType::F32, "f32"),
        (KvCacheType::F16, "f16"),
        (KvCacheType::BF16, "bf16"),
        (KvCacheType::Q8_0, "q8_0"),
        (KvCacheType::Q4_0, "q4_0"),
        (KvCacheType::Q4_1, "q4_1"),
        (KvCacheType::IQ4_NL, "iq4_nl"),
        (KvCacheType::Q5_0, "q5_0"),
        (KvCacheType::Q5_1, "q5_1"),
    ];

    pub fn as_str(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(ty, _)| ty == self)
            .map(|(_, name)| *name)
            .unwrap_or("f16")
    }

    /// Whether the type is block-quantized (needs flash attention for the V half).
    pub fn is_quantized(&self) -> bool {
        !matches!(self, Self::F32 | Self::F16 | Self::BF16)
    }
}

impl FromStr for KvCacheType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        Self::NAMES
            .iter()
            .find(|(_, name)| *name == s)
            .map(|(ty, _)| *ty)
            .ok_or_else(|| EngineError::InvalidCacheType(s.to_string()))
    }
}

impl fmt::Display for KvCacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Load specification and metadata
// ---------------------------------------------------------------------------

/// Specification for loading a model into a fresh engine session.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub n_ctx: usize,
    pub n_batch: usize,
    pub n_ubatch: usize,
    pub n_threads: usize,
    /// Maximum number of independent sequences in the KV cache.
    pub n_seq_max: usize,
    pub n_gpu_layers: i32,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub flash_attn: bool,
    /// Load in embedding mode (final hidden state is retrievable).
    pub embedding: bool,
    pub cache_type_k: KvCacheType,
    pub cache_type_v: KvCacheType,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            n_ctx: 512,
            n_batch: 512,
            n_ubatch: 512,
            n_threads: 4,
            n_seq_max: 1,
            n_gpu_layers: 0,
            use_mmap: true,
            use_mlock: false,
            flash_attn: false,
            embedding: false,
            cache_type_k: KvCacheType::F16,
            cache_type_v: KvCacheType::F16,
        }
    }
}

/// Static facts about a loaded model.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// Human-readable description (architecture, size, quantization).
    pub description: String,
    /// Model size in bytes.
    pub size_bytes: u64,
    /// Parameter count.
    pub n_params: u64,
    /// Embedding width.
    pub n_embd: usize,
    /// Context length the model was trained with.
    pub n_ctx_train: usize,
    /// Chat template embedded in the model file, if any.
    pub chat_template: Option<String>,
}

// ---------------------------------------------------------------------------
// Batches
// ---------------------------------------------------------------------------

/// One token placed at a position of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchEntry {
    pub token: TokenId,
    pub pos: usize,
    pub seq_id: usize,
    /// Request logits (or an embedding) for this entry.
    pub logits: bool,
}

/// Tokens submitted together for one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    entries: Vec<BatchEntry>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
        }
    }

    /// Contiguous tokens of one sequence starting at `start_pos`; only the last
    /// entry requests logits.
    pub fn from_tokens(tokens: &[TokenId], start_pos: usize, seq_id: usize) -> Self {
        let mut batch = Self::with_capacity(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            batch.push(token, start_pos + i, seq_id, i + 1 == tokens.len());
        }
        batch
    }

    pub fn push(&mut self, token: TokenId, pos: usize, seq_id: usize, logits: bool) {
        self.entries.push(BatchEntry {
            token,
            pos,
            seq_id,
            logits,
        });
    }

    pub fn entries(&self) -> &[BatchEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Opaque handle to an adapter loaded into an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AdapterHandle(pub usize);

// ---------------------------------------------------------------------------
// The boundary
// ---------------------------------------------------------------------------

/// The core engine trait. Everything else plugs into this.
///
/// One value is one loaded model plus its KV cache. Dropping it releases both.
pub trait ComputeEngine: Send {
    /// Vocabulary of the loaded model.
    fn vocab(&self) -> &dyn Vocabulary;

    /// Static model facts.
    fn metadata(&self) -> &ModelMetadata;

    /// Context window the session was created with.
    fn n_ctx(&self) -> usize;

    /// Number of independent sequences the cache can hold.
    fn max_sequences(&self) -> usize;

    /// Evaluate a batch, appending its entries to the cache.
    fn evaluate(&mut self, batch: &Batch) -> Result<()>;

    /// Logits of the last entry of the most recent batch that requested them.
    fn logits(&self) -> Result<&[f32]>;

    /// Final-state embedding of a sequence (embedding mode only).
    fn embedding(&self, seq_id: usize) -> Result<Vec<f32>>;

    /// Drop every cached position of every sequence.
    fn clear(&mut self);

    /// Drop cached positions `>= from_pos` of one sequence.
    fn truncate(&mut self, seq_id: usize, from_pos: usize) -> Result<()>;

    /// Load an adapter file. Incompatible adapters are rejected.
    fn load_adapter(&mut self, path: &Path) -> Result<AdapterHandle>;

    /// Replace the active adapter set. Order is application order.
    fn set_adapters(&mut self, adapters: &[(AdapterHandle, f32)]) -> Result<()>;
}

/// Creates engine sessions from a load specification.
pub trait ModelLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn ComputeEngine>>;
}
