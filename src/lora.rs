//! LoRA adapter management.
//!
//! The context keeps the list of attached adapters in application order and
//! pushes the whole list to the engine on every change. An adapter file is
//! loaded once per context; later attaches reuse its handle.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use cactus_engine::AdapterHandle;

use crate::context::{Context, ContextState};
use crate::error::{ContextError, Result};

/// An adapter file and the scale it is applied with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraAdapter {
    pub path: PathBuf,
    #[serde(default = "default_scale")]
    pub scale: f32,
}

fn default_scale() -> f32 {
    1.0
}

impl LoraAdapter {
    pub fn new(path: impl Into<PathBuf>, scale: f32) -> Self {
        Self {
            path: path.into(),
            scale,
        }
    }
}

impl Context {
    /// Attached adapters in application order.
    pub fn lora_adapters(&self) -> &[LoraAdapter] {
        &self.lora
    }

    /// Attach one adapter, or change the scale of an attached one.
    pub fn attach_lora(&mut self, path: impl AsRef<Path>, scale: f32) -> Result<()> {
        let path = path.as_ref();
        let mut next = self.lora.clone();
        match next.iter_mut().find(|a| a.path == path) {
            Some(existing) => existing.scale = scale,
            None => next.push(LoraAdapter::new(path, scale)),
        }
        self.apply_lora_adapters(&next)
    }

    /// Replace the attached set. Either every adapter applies or nothing
    /// changes. A path listed twice keeps its first position and its last
    /// scale.
    pub fn apply_lora_adapters(&mut self, adapters: &[LoraAdapter]) -> Result<()> {
        let adapters = merge_by_path(adapters);
        if let Some(bad) = adapters.iter().find(|a| !a.scale.is_finite()) {
            return Err(ContextError::InvalidConfig(format!(
                "adapter {} has a non-finite scale",
                bad.path.display()
            )));
        }

        let mut resolved: Vec<(AdapterHandle, f32)> = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            let cached = self.adapter_handles.get(&adapter.path).copied();
            let handle = match cached {
                Some(handle) => handle,
                None => {
                    let handle = self.engine.load_adapter(&adapter.path)?;
                    self.adapter_handles.insert(adapter.path.clone(), handle);
                    handle
                }
            };
            resolved.push((handle, adapter.scale));
        }
        self.engine.set_adapters(&resolved)?;

        self.lora = adapters;
        self.invalidate_cache();
        info!(n_adapters = self.lora.len(), "adapters applied");
        Ok(())
    }

    /// Detach every adapter.
    pub fn detach_all_lora(&mut self) -> Result<()> {
        self.apply_lora_adapters(&[])
    }

    /// Cached activations were computed with the old weights.
    fn invalidate_cache(&mut self) {
        self.reset_request();
        self.clear_cache();
        self.truncated = false;
        self.num_prompt_tokens = 0;
        self.state = ContextState::Idle;
    }
}

fn merge_by_path(adapters: &[LoraAdapter]) -> Vec<LoraAdapter> {
    let mut merged: Vec<LoraAdapter> = Vec::with_capacity(adapters.len());
    for adapter in adapters {
        match merged.iter_mut().find(|a| a.path == adapter.path) {
            Some(existing) => existing.scale = adapter.scale,
            None => merged.push(adapter.clone()),
        }
    }
    merged
}
