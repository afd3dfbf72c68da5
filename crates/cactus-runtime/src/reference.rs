//! Deterministic reference engine.
//!
//! Implements the engine boundary over [`ByteVocab`] without any tensor math.
//! Logits and embeddings are pseudo-random functions of the model file bytes,
//! the cached tokens and the active adapters, so identical inputs always give
//! identical outputs.
//!
//! A model file is either arbitrary bytes or a JSON descriptor:
//!
//! ```json
//! {"arch": "reference", "n_embd": 16, "chat_template": "chatml"}
//! ```
//!
//! An adapter file is a JSON descriptor `{"arch": "reference", "rank": 4,
//! "n_embd": 16}`; its `n_embd` must match the model.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use serde::Deserialize;
use tracing::{debug, info};

use cactus_engine::{
    AdapterHandle, Batch, ComputeEngine, EngineError, ModelLoader, ModelMetadata, ModelSpec, Result,
    TokenId, Vocabulary,
};
use cactus_tokenizer::ByteVocab;

const ARCH: &str = "reference";

fn default_n_embd() -> usize {
    16
}

fn default_n_ctx_train() -> usize {
    4096
}

#[derive(Debug, Deserialize)]
struct ModelDescriptor {
    arch: String,
    #[serde(default = "default_n_embd")]
    n_embd: usize,
    #[serde(default = "default_n_ctx_train")]
    n_ctx_train: usize,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    chat_template: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdapterDescriptor {
    arch: String,
    rank: usize,
    n_embd: usize,
}

#[derive(Debug, Clone)]
struct LoadedAdapter {
    key: u64,
}

/// SplitMix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn unit(z: u64) -> f32 {
    (z >> 40) as f32 / (1u64 << 24) as f32
}

/// FNV-1a over the file contents.
fn fingerprint(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325u64, |h, &b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01B3)
    })
}

fn read_model(spec: &ModelSpec) -> Result<(u64, u64, Option<ModelDescriptor>)> {
    let path = &spec.path;
    let file = File::open(path)
        .map_err(|e| EngineError::ModelLoad(format!("failed to open {}: {e}", path.display())))?;
    let size = file
        .metadata()
        .map_err(|e| EngineError::ModelLoad(format!("failed to stat {}: {e}", path.display())))?
        .len();
    if size == 0 {
        return Err(EngineError::ModelLoad(format!("{} is empty", path.display())));
    }

    let inspect = |bytes: &[u8]| (fingerprint(bytes), serde_json::from_slice::<ModelDescriptor>(bytes).ok());
    let (seed, descriptor) = if spec.use_mmap {
        // Safety: the mapping is read-only and dropped before this function returns.
        let mmap = unsafe {
            Mmap::map(&file)
                .map_err(|e| EngineError::ModelLoad(format!("failed to mmap {}: {e}", path.display())))?
        };
        inspect(&mmap[..])
    } else {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::ModelLoad(format!("failed to read {}: {e}", path.display())))?;
        inspect(&bytes)
    };
    Ok((seed, size, descriptor))
}

/// Loads [`ReferenceEngine`] sessions.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceLoader;

impl ReferenceLoader {
    pub fn new() -> Self {
        Self
    }
}

impl ModelLoader for ReferenceLoader {
    fn load(&self, spec: &ModelSpec) -> Result<Box<dyn ComputeEngine>> {
        Ok(Box::new(ReferenceEngine::load(spec)?))
    }
}

/// Engine session over the byte vocabulary.
#[derive(Debug)]
pub struct ReferenceEngine {
    vocab: ByteVocab,
    metadata: ModelMetadata,
    seed: u64,
    n_ctx: usize,
    n_batch: usize,
    embedding: bool,
    cells: Vec<Vec<TokenId>>,
    logits: Vec<f32>,
    adapters: Vec<LoadedAdapter>,
    active: Vec<(AdapterHandle, f32)>,
}

impl ReferenceEngine {
    pub fn load(spec: &ModelSpec) -> Result<Self> {
        if spec.n_ctx == 0 || spec.n_batch == 0 || spec.n_seq_max == 0 {
            return Err(EngineError::ModelLoad(
                "n_ctx, n_batch and n_seq_max must be positive".to_string(),
            ));
        }
        let (seed, size_bytes, descriptor) = read_model(spec)?;
        let (n_embd, n_ctx_train, description, chat_template) = match descriptor {
            Some(d) if d.arch != ARCH => {
                return Err(EngineError::ModelLoad(format!(
                    "unsupported architecture '{}'",
                    d.arch
                )))
            }
            Some(d) if d.n_embd == 0 => {
                return Err(EngineError::ModelLoad("n_embd must be positive".to_string()))
            }
            Some(d) => (d.n_embd, d.n_ctx_train, d.description, d.chat_template),
            None => (default_n_embd(), default_n_ctx_train(), None, None),
        };
        let n_params = (n_embd * ByteVocab::N_VOCAB * 2) as u64;
        let metadata = ModelMetadata {
            description: description.unwrap_or_else(|| format!("{} n_embd={}", ARCH, n_embd)),
            size_bytes,
            n_params,
            n_embd,
            n_ctx_train,
            chat_template,
        };
        info!(
            path = %spec.path.display(),
            n_ctx = spec.n_ctx,
            n_seq_max = spec.n_seq_max,
            cache_type_k = %spec.cache_type_k,
            cache_type_v = %spec.cache_type_v,
            "loaded reference model"
        );
        Ok(Self {
            vocab: ByteVocab::new(),
            metadata,
            seed,
            n_ctx: spec.n_ctx,
            n_batch: spec.n_batch,
            embedding: spec.embedding,
            cells: vec![Vec::new(); spec.n_seq_max],
            logits: Vec::new(),
            adapters: Vec::new(),
            active: Vec::new(),
        })
    }

    /// Cached tokens of a sequence.
    pub fn cached(&self, seq_id: usize) -> &[TokenId] {
        self.cells.get(seq_id).map(Vec::as_slice).unwrap_or(&[])
    }

    fn adapter_key(&self) -> u64 {
        self.active.iter().fold(0, |acc, (handle, scale)| {
            let key = self.adapters.get(handle.0).map(|a| a.key).unwrap_or(0);
            mix(acc ^ key ^ u64::from(scale.to_bits()))
        })
    }

    fn compute_logits(&self, token: TokenId, pos: usize) -> Vec<f32> {
        let key = mix(self.seed ^ self.adapter_key() ^ ((token as u64) << 1) ^ ((pos as u64) << 32));
        let mut logits: Vec<f32> = (0..ByteVocab::N_VOCAB)
            .map(|t| unit(mix(key ^ t as u64)))
            .collect();
        // Printable ASCII is preferred so decoded text stays readable.
        let preferred = 32 + (key % 95) as usize;
        logits[preferred] += 8.0;
        if key % 23 == 0 {
            logits[ByteVocab::EOS as usize] += 12.0;
        }
        logits
    }
}

impl ComputeEngine for ReferenceEngine {
    fn vocab(&self) -> &dyn Vocabulary {
        &self.vocab
    }

    fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    fn n_ctx(&self) -> usize {
        self.n_ctx
    }

    fn max_sequences(&self) -> usize {
        self.cells.len()
    }

    fn evaluate(&mut self, batch: &Batch) -> Result<()> {
        if batch.is_empty() {
            return Err(EngineError::Inference("empty batch".to_string()));
        }
        if batch.len() > self.n_batch {
            return Err(EngineError::Inference(format!(
                "batch of {} exceeds n_batch {}",
                batch.len(),
                self.n_batch
            )));
        }

        // Validate everything before touching the cache.
        let mut next_pos: Vec<usize> = self.cells.iter().map(Vec::len).collect();
        for entry in batch.entries() {
            let expected = next_pos
                .get_mut(entry.seq_id)
                .ok_or_else(|| EngineError::Inference(format!("invalid sequence {}", entry.seq_id)))?;
            if entry.token < 0 || entry.token as usize >= ByteVocab::N_VOCAB {
                return Err(EngineError::Inference(format!("invalid token {}", entry.token)));
            }
            if entry.pos != *expected {
                return Err(EngineError::Inference(format!(
                    "sequence {} expected position {}, got {}",
                    entry.seq_id, expected, entry.pos
                )));
            }
            if entry.pos >= self.n_ctx {
                return Err(EngineError::Inference(format!(
                    "context of {} tokens is full",
                    self.n_ctx
                )));
            }
            *expected += 1;
        }

        for entry in batch.entries() {
            self.cells[entry.seq_id].push(entry.token);
            if entry.logits {
                self.logits = self.compute_logits(entry.token, entry.pos);
            }
        }
        debug!(n_tokens = batch.len(), "evaluated batch");
        Ok(())
    }

    fn logits(&self) -> Result<&[f32]> {
        if self.logits.is_empty() {
            return Err(EngineError::Inference("no logits available".to_string()));
        }
        Ok(&self.logits)
    }

    fn embedding(&self, seq_id: usize) -> Result<Vec<f32>> {
        if !self.embedding {
            return Err(EngineError::Unsupported(
                "model was not loaded in embedding mode".to_string(),
            ));
        }
        let tokens = self
            .cells
            .get(seq_id)
            .ok_or_else(|| EngineError::Inference(format!("invalid sequence {}", seq_id)))?;
        if tokens.is_empty() {
            return Err(EngineError::Inference(format!("sequence {} is empty", seq_id)));
        }
        let n = tokens.len() as f32;
        Ok((0..self.metadata.n_embd)
            .map(|d| {
                tokens
                    .iter()
                    .map(|&t| unit(mix(self.seed ^ ((t as u64) << 16) ^ d as u64)) * 2.0 - 1.0)
                    .sum::<f32>()
                    / n
            })
            .collect())
    }

    fn clear(&mut self) {
        for cells in &mut self.cells {
            cells.clear();
        }
        self.logits.clear();
    }

    fn truncate(&mut self, seq_id: usize, from_pos: usize) -> Result<()> {
        let cells = self
            .cells
            .get_mut(seq_id)
            .ok_or_else(|| EngineError::Inference(format!("invalid sequence {}", seq_id)))?;
        cells.truncate(from_pos);
        Ok(())
    }

    fn load_adapter(&mut self, path: &Path) -> Result<AdapterHandle> {
        let bytes = std::fs::read(path)
            .map_err(|e| EngineError::Adapter(format!("failed to read {}: {e}", path.display())))?;
        let descriptor: AdapterDescriptor = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Adapter(format!("{}: {e}", path.display())))?;
        if descriptor.arch != ARCH {
            return Err(EngineError::Adapter(format!(
                "{}: adapter for '{}' cannot be applied to '{}'",
                path.display(),
                descriptor.arch,
                ARCH
            )));
        }
        if descriptor.n_embd != self.metadata.n_embd || descriptor.rank == 0 {
            return Err(EngineError::Adapter(format!(
                "{}: incompatible shape (rank {}, n_embd {}, model n_embd {})",
                path.display(),
                descriptor.rank,
                descriptor.n_embd,
                self.metadata.n_embd
            )));
        }
        self.adapters.push(LoadedAdapter {
            key: fingerprint(&bytes),
        });
        Ok(AdapterHandle(self.adapters.len() - 1))
    }

    fn set_adapters(&mut self, adapters: &[(AdapterHandle, f32)]) -> Result<()> {
        if let Some((handle, _)) = adapters.iter().find(|(h, _)| h.0 >= self.adapters.len()) {
            return Err(EngineError::Adapter(format!("unknown adapter handle {}", handle.0)));
        }
        self.active = adapters.to_vec();
        Ok(())
    }
}
