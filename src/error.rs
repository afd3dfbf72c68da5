//! Error types for the cactus crate.

use thiserror::Error;

use cactus_chat::ChatError;
use cactus_engine::{EngineError, TokenizerError};
use cactus_sampling::SamplingError;

/// Coarse classification of a [`ContextError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameters, templates, schemas or adapters. Nothing was changed.
    Configuration,
    /// The model or another resource could not be loaded.
    Resource,
    /// The engine, tokenizer or sampler failed while working.
    Runtime,
    /// The caller used the context out of order.
    Misuse,
}

/// Top-level error type for context operations.
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("Sampling error: {0}")]
    Sampling(#[from] SamplingError),

    #[error("Chat formatting error: {0}")]
    Chat(#[from] ChatError),

    #[error("Prompt is empty")]
    EmptyPrompt,

    #[error("Context was not loaded in embedding mode")]
    EmbeddingDisabled,

    #[error("Invalid use: {0}")]
    Misuse(String),
}

impl ContextError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidConfig(_) | Self::Chat(_) | Self::EmbeddingDisabled => ErrorKind::Configuration,
            Self::Engine(e) => match e {
                EngineError::ModelLoad(_) => ErrorKind::Resource,
                EngineError::Adapter(_)
                | EngineError::InvalidCacheType(_)
                | EngineError::Unsupported(_) => ErrorKind::Configuration,
                EngineError::Inference(_) | EngineError::Tokenization(_) => ErrorKind::Runtime,
            },
            Self::Tokenizer(_) => ErrorKind::Runtime,
            Self::Sampling(e) => match e {
                SamplingError::InvalidTemperature
                | SamplingError::InvalidConfig(_)
                | SamplingError::Grammar(_) => ErrorKind::Configuration,
                SamplingError::InvalidLogits
                | SamplingError::NoValidTokens
                | SamplingError::GrammarRejected(_) => ErrorKind::Runtime,
            },
            Self::EmptyPrompt | Self::Misuse(_) => ErrorKind::Misuse,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContextError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds() {
        assert_eq!(
            ContextError::from(EngineError::ModelLoad("x".into())).kind(),
            ErrorKind::Resource
        );
        assert_eq!(
            ContextError::from(EngineError::Adapter("x".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(
            ContextError::from(EngineError::Inference("x".into())).kind(),
            ErrorKind::Runtime
        );
        assert_eq!(
            ContextError::from(SamplingError::InvalidConfig("x".into())).kind(),
            ErrorKind::Configuration
        );
        assert_eq!(ContextError::EmptyPrompt.kind(), ErrorKind::Misuse);
        assert_eq!(ContextError::EmbeddingDisabled.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn display_carries_context() {
        let err = ContextError::from(EngineError::Inference("context full".into()));
        assert!(err.to_string().contains("context full"));
    }
}
