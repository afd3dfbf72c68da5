//! Integration tests for cactus-stt.
//!
//! Validates:
//! - The user vocabulary reaches the engine verbatim as the initial prompt
//! - An empty vocabulary reaches the engine as an absent prompt
//! - Load and engine failures surface as errors

use std::path::Path;
use std::sync::{Arc, Mutex};

use cactus_stt::*;

/// Records every request it receives.
#[derive(Clone, Default)]
struct Recorder {
    prompts: Arc<Mutex<Vec<Option<String>>>>,
    languages: Arc<Mutex<Vec<String>>>,
}

struct RecordingEngine {
    recorder: Recorder,
    fail: bool,
}

impl TranscriptionEngine for RecordingEngine {
    fn transcribe(&mut self, samples: &[f32], request: TranscribeRequest<'_>) -> Result<Vec<Segment>> {
        if self.fail {
            return Err(SttError::Engine("decoder crashed".to_string()));
        }
        self.recorder
            .prompts
            .lock()
            .unwrap()
            .push(request.initial_prompt.map(str::to_string));
        self.recorder
            .languages
            .lock()
            .unwrap()
            .push(request.language.to_string());
        Ok(vec![
            Segment {
                text: "hello".to_string(),
                t0_ms: 0,
                t1_ms: 500,
            },
            Segment {
                text: format!(" world ({})", samples.len()),
                t0_ms: 500,
                t1_ms: 1000,
            },
        ])
    }
}

struct RecordingLoader {
    recorder: Recorder,
    fail_engine: bool,
}

impl TranscriptionLoader for RecordingLoader {
    type Engine = RecordingEngine;

    fn load(&self, model: &Path, _use_gpu: bool) -> Result<RecordingEngine> {
        if model.extension().and_then(|e| e.to_str()) != Some("bin") {
            return Err(SttError::Load(format!("{} is not a model", model.display())));
        }
        Ok(RecordingEngine {
            recorder: self.recorder.clone(),
            fail: self.fail_engine,
        })
    }
}

fn session() -> (Stt<RecordingLoader>, Recorder) {
    let recorder = Recorder::default();
    let stt = Stt::new(RecordingLoader {
        recorder: recorder.clone(),
        fail_engine: false,
    });
    (stt, recorder)
}

// ===========================================================================
// Bias Policy
// ===========================================================================

#[test]
fn vocabulary_is_passed_verbatim() {
    let (mut stt, recorder) = session();
    stt.initialize("whisper.bin", "en", false).unwrap();
    stt.set_user_vocabulary("my custom prompt for STT");
    stt.process_audio(&vec![0.1; 1600]).unwrap();

    assert_eq!(
        recorder.prompts.lock().unwrap().as_slice(),
        &[Some("my custom prompt for STT".to_string())]
    );
}

#[test]
fn empty_vocabulary_is_absent() {
    let (mut stt, recorder) = session();
    stt.initialize("whisper.bin", "fr", true).unwrap();
    stt.process_audio(&[0.0; 16]).unwrap();
    stt.set_user_vocabulary("names");
    stt.process_audio(&[0.0; 16]).unwrap();
    stt.set_user_vocabulary(String::new());
    stt.process_audio(&[0.0; 16]).unwrap();

    assert_eq!(
        recorder.prompts.lock().unwrap().as_slice(),
        &[None, Some("names".to_string()), None]
    );
    assert!(recorder.languages.lock().unwrap().iter().all(|l| l == "fr"));
}

// ===========================================================================
// Results and Failures
// ===========================================================================

#[test]
fn transcription_joins_segments() {
    let (mut stt, _) = session();
    stt.initialize("whisper.bin", "en", false).unwrap();
    stt.process_audio(&[0.0; 4]).unwrap();
    assert_eq!(stt.transcription().unwrap(), "hello world (4)");
    assert_eq!(stt.segments().len(), 2);
    assert_eq!(stt.segments()[1].t1_ms, 1000);
}

#[test]
fn load_failure_leaves_session_uninitialized() {
    let (mut stt, _) = session();
    assert!(matches!(
        stt.initialize("whisper.txt", "en", false),
        Err(SttError::Load(_))
    ));
    assert!(!stt.is_initialized());
}

#[test]
fn engine_failure_is_reported() {
    let mut stt = Stt::new(RecordingLoader {
        recorder: Recorder::default(),
        fail_engine: true,
    });
    stt.initialize("whisper.bin", "en", false).unwrap();
    assert_eq!(
        stt.process_audio(&[0.0]),
        Err(SttError::Engine("decoder crashed".to_string()))
    );
}
