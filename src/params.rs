//! Context configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use cactus_chat::TemplateKind;
use cactus_engine::{KvCacheType, ModelSpec};

use crate::embedding::EmbdNormalize;
use crate::error::{ContextError, Result};
use crate::lora::LoraAdapter;

/// Smallest window a context can be created with.
pub const MIN_CTX: usize = 8;

fn default_n_ctx() -> usize {
    512
}
fn default_n_batch() -> usize {
    512
}
fn default_n_ubatch() -> usize {
    512
}
fn default_n_threads() -> usize {
    4
}
fn default_n_parallel() -> usize {
    1
}
fn default_true() -> bool {
    true
}

/// Everything needed to load a [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextParams {
    pub model_path: PathBuf,
    #[serde(default = "default_n_ctx")]
    pub n_ctx: usize,
    #[serde(default = "default_n_batch")]
    pub n_batch: usize,
    #[serde(default = "default_n_ubatch")]
    pub n_ubatch: usize,
    #[serde(default = "default_n_threads")]
    pub n_threads: usize,
    /// Independent sequences in the cache (benchmark parallelism).
    #[serde(default = "default_n_parallel")]
    pub n_parallel: usize,
    #[serde(default = "default_true")]
    pub use_mmap: bool,
    #[serde(default)]
    pub use_mlock: bool,
    #[serde(default)]
    pub embedding: bool,
    #[serde(default)]
    pub n_gpu_layers: i32,
    #[serde(default)]
    pub flash_attn: bool,
    #[serde(default)]
    pub cache_type_k: KvCacheType,
    #[serde(default)]
    pub cache_type_v: KvCacheType,
    /// Template override; the model's embedded template otherwise.
    #[serde(default)]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub template_kind: TemplateKind,
    /// Prompt prefix preserved by truncation.
    #[serde(default)]
    pub n_keep: Option<usize>,
    #[serde(default)]
    pub embd_normalize: EmbdNormalize,
    /// Adapters attached at load, in application order.
    #[serde(default)]
    pub lora: Vec<LoraAdapter>,
}

impl ContextParams {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            n_ctx: default_n_ctx(),
            n_batch: default_n_batch(),
            n_ubatch: default_n_ubatch(),
            n_threads: default_n_threads(),
            n_parallel: default_n_parallel(),
            use_mmap: true,
            use_mlock: false,
            embedding: false,
            n_gpu_layers: 0,
            flash_attn: false,
            cache_type_k: KvCacheType::default(),
            cache_type_v: KvCacheType::default(),
            chat_template: None,
            template_kind: TemplateKind::default(),
            n_keep: None,
            embd_normalize: EmbdNormalize::default(),
            lora: Vec::new(),
        }
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| ContextError::InvalidConfig(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&text)
            .map_err(|e| ContextError::InvalidConfig(format!("{}: {e}", path.display())))
    }

    pub fn with_n_ctx(mut self, n_ctx: usize) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_n_batch(mut self, n_batch: usize) -> Self {
        self.n_batch = n_batch;
        self
    }

    pub fn with_n_parallel(mut self, n_parallel: usize) -> Self {
        self.n_parallel = n_parallel;
        self
    }

    pub fn with_embedding(mut self, embedding: bool) -> Self {
        self.embedding = embedding;
        self
    }

    pub fn with_n_keep(mut self, n_keep: usize) -> Self {
        self.n_keep = Some(n_keep);
        self
    }

    pub fn with_chat_template(mut self, template: impl Into<String>) -> Self {
        self.chat_template = Some(template.into());
        self
    }

    pub fn with_template_kind(mut self, kind: TemplateKind) -> Self {
        self.template_kind = kind;
        self
    }

    pub fn with_lora(mut self, path: impl Into<PathBuf>, scale: f32) -> Self {
        self.lora.push(LoraAdapter::new(path, scale));
        self
    }

    /// Set the key cache type by name. On error nothing changes.
    pub fn set_cache_type_k(&mut self, name: &str) -> Result<()> {
        self.cache_type_k = name.parse()?;
        Ok(())
    }

    /// Set the value cache type by name. On error nothing changes.
    pub fn set_cache_type_v(&mut self, name: &str) -> Result<()> {
        self.cache_type_v = name.parse()?;
        Ok(())
    }

    /// Reject values no engine could work with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ContextError::InvalidConfig(msg));
        if self.model_path.as_os_str().is_empty() {
            return invalid("model_path is empty".to_string());
        }
        if self.n_ctx < MIN_CTX {
            return invalid(format!("n_ctx must be at least {}, got {}", MIN_CTX, self.n_ctx));
        }
        if self.n_batch == 0 || self.n_ubatch == 0 {
            return invalid("n_batch and n_ubatch must be positive".to_string());
        }
        if self.n_threads == 0 {
            return invalid("n_threads must be positive".to_string());
        }
        if self.n_parallel == 0 {
            return invalid("n_parallel must be positive".to_string());
        }
        if self.cache_type_v.is_quantized() && !self.flash_attn {
            return invalid(format!(
                "cache_type_v {} requires flash_attn",
                self.cache_type_v
            ));
        }
        self.embd_normalize.validate()?;
        if let Some(adapter) = self.lora.iter().find(|a| !a.scale.is_finite()) {
            return invalid(format!(
                "adapter {} has a non-finite scale",
                adapter.path.display()
            ));
        }
        Ok(())
    }

    pub(crate) fn to_model_spec(&self) -> ModelSpec {
        ModelSpec {
            path: self.model_path.clone(),
            n_ctx: self.n_ctx,
            n_batch: self.n_batch,
            n_ubatch: self.n_ubatch.min(self.n_batch),
            n_threads: self.n_threads,
            n_seq_max: self.n_parallel,
            n_gpu_layers: self.n_gpu_layers,
            use_mmap: self.use_mmap,
            use_mlock: self.use_mlock,
            flash_attn: self.flash_attn,
            embedding: self.embedding,
            cache_type_k: self.cache_type_k,
            cache_type_v: self.cache_type_v,
        }
    }
}
