//! # cactus-stt
//!
//! Speech-to-text session wrapper over an injectable transcription engine.
//!
//! The only policy shared with text generation is how a user vocabulary
//! becomes an initial-prompt bias: an empty vocabulary means no bias, anything
//! else is passed through verbatim.

use std::path::Path;

use tracing::{debug, warn};

pub type Result<T> = std::result::Result<T, SttError>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SttError {
    #[error("Transcription session is already initialized")]
    AlreadyInitialized,
    #[error("Transcription session is not initialized")]
    NotInitialized,
    #[error("Audio sample buffer is empty")]
    EmptyAudio,
    #[error("Failed to load transcription model: {0}")]
    Load(String),
    #[error("Transcription engine error: {0}")]
    Engine(String),
}

/// A transcribed span, timestamps in milliseconds.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Segment {
    pub text: String,
    pub t0_ms: i64,
    pub t1_ms: i64,
}

/// Per-call inputs handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscribeRequest<'a> {
    pub language: &'a str,
    /// Bias text, absent when no vocabulary is configured.
    pub initial_prompt: Option<&'a str>,
}

/// A loaded transcription model.
pub trait TranscriptionEngine: Send {
    /// Transcribe mono 16 kHz PCM samples.
    fn transcribe(&mut self, samples: &[f32], request: TranscribeRequest<'_>) -> Result<Vec<Segment>>;
}

/// Creates transcription engines from model files.
pub trait TranscriptionLoader {
    type Engine: TranscriptionEngine;

    fn load(&self, model: &Path, use_gpu: bool) -> Result<Self::Engine>;
}

/// Transcription session.
pub struct Stt<L: TranscriptionLoader> {
    loader: L,
    engine: Option<L::Engine>,
    language: String,
    user_vocabulary: String,
    segments: Vec<Segment>,
}

impl<L: TranscriptionLoader> Stt<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            engine: None,
            language: "en".to_string(),
            user_vocabulary: String::new(),
            segments: Vec::new(),
        }
    }

    /// Load the model. A second call without [`release`](Self::release) fails
    /// and leaves the session as it was.
    pub fn initialize(&mut self, model: impl AsRef<Path>, language: &str, use_gpu: bool) -> Result<()> {
        if self.engine.is_some() {
            warn!("transcription session already initialized");
            return Err(SttError::AlreadyInitialized);
        }
        let engine = self.loader.load(model.as_ref(), use_gpu)?;
        self.engine = Some(engine);
        self.language = language.to_string();
        debug!(model = %model.as_ref().display(), language, use_gpu, "transcription model loaded");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.engine.is_some()
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn set_user_vocabulary(&mut self, vocabulary: impl Into<String>) {
        self.user_vocabulary = vocabulary.into();
    }

    pub fn user_vocabulary(&self) -> &str {
        &self.user_vocabulary
    }

    /// Bias passed with the next call to [`process_audio`](Self::process_audio).
    pub fn initial_prompt(&self) -> Option<&str> {
        if self.user_vocabulary.is_empty() {
            None
        } else {
            Some(&self.user_vocabulary)
        }
    }

    pub fn process_audio(&mut self, samples: &[f32]) -> Result<()> {
        let engine = self.engine.as_mut().ok_or(SttError::NotInitialized)?;
        if samples.is_empty() {
            return Err(SttError::EmptyAudio);
        }
        let initial_prompt = if self.user_vocabulary.is_empty() {
            None
        } else {
            Some(self.user_vocabulary.as_str())
        };
        let request = TranscribeRequest {
            language: &self.language,
            initial_prompt,
        };
        self.segments = engine.transcribe(samples, request)?;
        debug!(
            n_samples = samples.len(),
            n_segments = self.segments.len(),
            biased = initial_prompt.is_some(),
            "transcribed audio"
        );
        Ok(())
    }

    /// Concatenated text of the last transcription.
    pub fn transcription(&self) -> Result<String> {
        if self.engine.is_none() {
            return Err(SttError::NotInitialized);
        }
        Ok(self.segments.iter().map(|s| s.text.as_str()).collect())
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Free the engine. The session can be initialized again afterwards.
    pub fn release(&mut self) {
        self.engine = None;
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl TranscriptionEngine for Echo {
        fn transcribe(&mut self, samples: &[f32], _: TranscribeRequest<'_>) -> Result<Vec<Segment>> {
            Ok(vec![Segment {
                text: format!("{} samples", samples.len()),
                t0_ms: 0,
                t1_ms: 10,
            }])
        }
    }

    struct EchoLoader;

    impl TranscriptionLoader for EchoLoader {
        type Engine = Echo;

        fn load(&self, _: &Path, _: bool) -> Result<Echo> {
            Ok(Echo)
        }
    }

    #[test]
    fn empty_vocabulary_means_no_bias() {
        let mut stt = Stt::new(EchoLoader);
        assert_eq!(stt.initial_prompt(), None);
        stt.set_user_vocabulary("Cactus, GGUF");
        assert_eq!(stt.initial_prompt(), Some("Cactus, GGUF"));
        stt.set_user_vocabulary("");
        assert_eq!(stt.initial_prompt(), None);
    }

    #[test]
    fn lifecycle_errors() {
        let mut stt = Stt::new(EchoLoader);
        assert_eq!(stt.process_audio(&[0.0]), Err(SttError::NotInitialized));
        assert_eq!(stt.transcription(), Err(SttError::NotInitialized));

        stt.initialize("model.bin", "de", false).unwrap();
        assert_eq!(stt.language(), "de");
        assert_eq!(
            stt.initialize("other.bin", "en", false),
            Err(SttError::AlreadyInitialized)
        );
        assert_eq!(stt.language(), "de");
        assert_eq!(stt.process_audio(&[]), Err(SttError::EmptyAudio));

        stt.process_audio(&[0.0; 3]).unwrap();
        assert_eq!(stt.transcription().unwrap(), "3 samples");

        stt.release();
        assert!(!stt.is_initialized());
        assert!(stt.segments().is_empty());
        stt.initialize("model.bin", "en", true).unwrap();
    }
}
