//! Integration tests for the reference engine.
//!
//! Validates:
//! - Loading from raw bytes and JSON descriptors (mmap and read paths)
//! - Deterministic logits and embeddings
//! - Position, capacity and batch-size checks leave the cache untouched
//! - Adapter compatibility and activation

use std::io::Write;

use cactus_engine::*;
use cactus_runtime::{ReferenceEngine, ReferenceLoader};
use cactus_tokenizer::ByteVocab;
use tempfile::NamedTempFile;

fn model_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn spec_for(file: &NamedTempFile) -> ModelSpec {
    let mut spec = ModelSpec::new(file.path());
    spec.n_ctx = 64;
    spec.n_batch = 16;
    spec.n_seq_max = 2;
    spec
}

fn argmax(logits: &[f32]) -> usize {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap()
}

// ===========================================================================
// Loading
// ===========================================================================

#[test]
fn loads_raw_bytes_with_defaults() {
    let file = model_file("not json at all");
    let engine = ReferenceLoader::new().load(&spec_for(&file)).unwrap();
    let meta = engine.metadata();
    assert_eq!(meta.n_embd, 16);
    assert_eq!(meta.size_bytes, 15);
    assert!(meta.chat_template.is_none());
    assert_eq!(engine.vocab().n_vocab(), ByteVocab::N_VOCAB);
    assert_eq!(engine.n_ctx(), 64);
    assert_eq!(engine.max_sequences(), 2);
}

#[test]
fn loads_descriptor_metadata() {
    let file = model_file(r#"{"arch":"reference","n_embd":8,"chat_template":"chatml","description":"tiny"}"#);
    let engine = ReferenceLoader::new().load(&spec_for(&file)).unwrap();
    assert_eq!(engine.metadata().n_embd, 8);
    assert_eq!(engine.metadata().description, "tiny");
    assert_eq!(engine.metadata().chat_template.as_deref(), Some("chatml"));
}

#[test]
fn rejects_missing_empty_and_foreign_models() {
    let spec = ModelSpec::new("/nonexistent/model.bin");
    assert!(matches!(ReferenceLoader::new().load(&spec).err(), Some(EngineError::ModelLoad(_))));

    let empty = model_file("");
    assert!(ReferenceLoader::new().load(&spec_for(&empty)).is_err());

    let foreign = model_file(r#"{"arch":"llama"}"#);
    assert!(ReferenceLoader::new().load(&spec_for(&foreign)).is_err());
}

#[test]
fn mmap_and_read_paths_agree() {
    let file = model_file("weights");
    let mut spec = spec_for(&file);
    let mut a = ReferenceEngine::load(&spec).unwrap();
    spec.use_mmap = false;
    let mut b = ReferenceEngine::load(&spec).unwrap();

    let batch = Batch::from_tokens(&[1, 2, 3], 0, 0);
    a.evaluate(&batch).unwrap();
    b.evaluate(&batch).unwrap();
    assert_eq!(a.logits().unwrap(), b.logits().unwrap());
}

// ===========================================================================
// Evaluation
// ===========================================================================

#[test]
fn logits_are_deterministic_and_model_dependent() {
    let f1 = model_file("model one");
    let f2 = model_file("model two");
    let batch = Batch::from_tokens(&[b'h' as TokenId, b'i' as TokenId], 0, 0);

    let mut a = ReferenceEngine::load(&spec_for(&f1)).unwrap();
    let mut b = ReferenceEngine::load(&spec_for(&f1)).unwrap();
    let mut c = ReferenceEngine::load(&spec_for(&f2)).unwrap();
    for engine in [&mut a, &mut b, &mut c] {
        engine.evaluate(&batch).unwrap();
    }
    assert_eq!(a.logits().unwrap(), b.logits().unwrap());
    assert_ne!(a.logits().unwrap(), c.logits().unwrap());
    assert_eq!(a.logits().unwrap().len(), ByteVocab::N_VOCAB);
}

#[test]
fn no_logits_before_evaluation() {
    let file = model_file("m");
    let engine = ReferenceEngine::load(&spec_for(&file)).unwrap();
    assert!(engine.logits().is_err());
}

#[test]
fn position_gap_is_rejected_without_side_effects() {
    let file = model_file("m");
    let mut engine = ReferenceEngine::load(&spec_for(&file)).unwrap();
    engine.evaluate(&Batch::from_tokens(&[1, 2], 0, 0)).unwrap();

    let err = engine.evaluate(&Batch::from_tokens(&[3], 5, 0)).unwrap_err();
    assert!(matches!(err, EngineError::Inference(_)));
    assert_eq!(engine.cached(0), &[1, 2]);
}

#[test]
fn oversized_batch_and_full_context_fail() {
    let file = model_file("m");
    let mut spec = spec_for(&file);
    spec.n_ctx = 4;
    spec.n_batch = 3;
    let mut engine = ReferenceEngine::load(&spec).unwrap();

    assert!(engine.evaluate(&Batch::from_tokens(&[1, 2, 3, 4], 0, 0)).is_err());
    engine.evaluate(&Batch::from_tokens(&[1, 2, 3], 0, 0)).unwrap();
    engine.evaluate(&Batch::from_tokens(&[4], 3, 0)).unwrap();
    assert!(engine.evaluate(&Batch::from_tokens(&[5], 4, 0)).is_err());
    assert_eq!(engine.cached(0).len(), 4);
}

#[test]
fn truncate_and_clear_reset_positions() {
    let file = model_file("m");
    let mut engine = ReferenceEngine::load(&spec_for(&file)).unwrap();
    engine.evaluate(&Batch::from_tokens(&[1, 2, 3], 0, 0)).unwrap();
    engine.evaluate(&Batch::from_tokens(&[9], 0, 1)).unwrap();

    engine.truncate(0, 1).unwrap();
    assert_eq!(engine.cached(0), &[1]);
    engine.evaluate(&Batch::from_tokens(&[7], 1, 0)).unwrap();

    engine.clear();
    assert!(engine.cached(0).is_empty());
    assert!(engine.cached(1).is_empty());
    assert!(engine.truncate(5, 0).is_err());
}

#[test]
fn embeddings_require_embedding_mode() {
    let file = model_file("m");
    let mut spec = spec_for(&file);
    let mut plain = ReferenceEngine::load(&spec).unwrap();
    plain.evaluate(&Batch::from_tokens(&[1], 0, 0)).unwrap();
    assert!(matches!(plain.embedding(0), Err(EngineError::Unsupported(_))));

    spec.embedding = true;
    let mut engine = ReferenceEngine::load(&spec).unwrap();
    assert!(engine.embedding(0).is_err());
    engine.evaluate(&Batch::from_tokens(&[1, 2, 3], 0, 0)).unwrap();
    let first = engine.embedding(0).unwrap();
    assert_eq!(first.len(), 16);
    assert!(first.iter().all(|v| v.is_finite() && v.abs() <= 1.0));

    engine.clear();
    engine.evaluate(&Batch::from_tokens(&[1, 2, 3], 0, 0)).unwrap();
    assert_eq!(engine.embedding(0).unwrap(), first);
}

// ===========================================================================
// Adapters
// ===========================================================================

#[test]
fn compatible_adapter_changes_logits() {
    let model = model_file("m");
    let adapter = model_file(r#"{"arch":"reference","rank":4,"n_embd":16}"#);
    let mut engine = ReferenceEngine::load(&spec_for(&model)).unwrap();

    engine.evaluate(&Batch::from_tokens(&[1], 0, 0)).unwrap();
    let base = engine.logits().unwrap().to_vec();

    let handle = engine.load_adapter(adapter.path()).unwrap();
    engine.set_adapters(&[(handle, 1.0)]).unwrap();
    engine.clear();
    engine.evaluate(&Batch::from_tokens(&[1], 0, 0)).unwrap();
    assert_ne!(engine.logits().unwrap(), base.as_slice());

    engine.set_adapters(&[]).unwrap();
    engine.clear();
    engine.evaluate(&Batch::from_tokens(&[1], 0, 0)).unwrap();
    assert_eq!(engine.logits().unwrap(), base.as_slice());
    assert_eq!(argmax(&base), argmax(engine.logits().unwrap()));
}

#[test]
fn incompatible_adapters_are_rejected() {
    let model = model_file("m");
    let mut engine = ReferenceEngine::load(&spec_for(&model)).unwrap();

    let wrong_width = model_file(r#"{"arch":"reference","rank":4,"n_embd":32}"#);
    let wrong_arch = model_file(r#"{"arch":"llama","rank":4,"n_embd":16}"#);
    let garbage = model_file("lora?");
    for file in [&wrong_width, &wrong_arch, &garbage] {
        assert!(matches!(
            engine.load_adapter(file.path()),
            Err(EngineError::Adapter(_))
        ));
    }
    assert!(engine.set_adapters(&[(AdapterHandle(0), 1.0)]).is_err());
}
