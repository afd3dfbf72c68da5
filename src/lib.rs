//! # cactus
//!
//! On-device LLM inference context.
//!
//! A [`Context`] wraps one loaded model behind the [`ComputeEngine`] boundary
//! and provides:
//! - Prompt truncation that keeps a prefix and the most recent tokens
//! - A pull-based generation loop with stop strings, EOS and limits
//! - Chat formatting with built-in and template-engine strategies
//! - Sentence embeddings
//! - A throughput benchmark
//! - LoRA adapter bookkeeping
//!
//! ```no_run
//! use cactus::{Context, ContextParams, ReferenceLoader, SamplingConfig};
//!
//! let params = ContextParams::new("model.bin").with_n_ctx(256);
//! let mut ctx = Context::load(params, &ReferenceLoader::new())?;
//! let out = ctx.complete("Hello", SamplingConfig::greedy().with_n_predict(16))?;
//! println!("{}", out.text);
//! # Ok::<(), cactus::ContextError>(())
//! ```

pub mod bench;
pub mod chat;
pub mod completion;
pub mod context;
pub mod embedding;
pub mod error;
pub mod lora;
pub mod params;
pub mod prompt;

pub use bench::BenchResult;
pub use completion::{Completion, CompletionOutput, GeneratedToken, StopReason, TokenProb};
pub use context::{Context, ContextState, InterruptHandle, PromptInfo};
pub use embedding::EmbdNormalize;
pub use error::{ContextError, ErrorKind, Result};
pub use lora::LoraAdapter;
pub use params::ContextParams;
pub use prompt::{PreparedPrompt, TruncationPolicy};

pub use cactus_chat::{
    parse_messages, parse_tools, ChatMessage, ChatOptions, ChatPrompt, TemplateKind, Tool, ToolChoice,
};
pub use cactus_engine::{ComputeEngine, KvCacheType, ModelLoader, ModelMetadata, TokenId, Vocabulary};
pub use cactus_runtime::{CompletionTimings, LogTelemetry, ReferenceLoader, TelemetryHook};
pub use cactus_sampling::SamplingConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
