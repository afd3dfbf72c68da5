//! Throughput benchmark.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, info_span};

use cactus_engine::{Batch, TokenId};

use crate::context::{Context, ContextState};
use crate::error::{ContextError, Result};

/// Token fed in both phases. Its content does not affect timing.
const BENCH_TOKEN: TokenId = 0;

/// Prompt-processing and generation speed over `nr` trials.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchResult {
    pub model_desc: String,
    pub model_size: u64,
    pub model_params: u64,
    /// Prompt tokens per second.
    pub pp_avg: f64,
    pub pp_std: f64,
    /// Generated tokens per second, summed over all sequences.
    pub tg_avg: f64,
    pub tg_std: f64,
    pub pp: usize,
    pub tg: usize,
    pub pl: usize,
    pub nr: usize,
}

impl BenchResult {
    /// Compact array form: `[desc, size, params, pp_avg, pp_std, tg_avg, tg_std]`.
    pub fn to_json_array(&self) -> serde_json::Value {
        serde_json::json!([
            self.model_desc,
            self.model_size,
            self.model_params,
            self.pp_avg,
            self.pp_std,
            self.tg_avg,
            self.tg_std,
        ])
    }
}

/// Population mean and standard deviation.
fn mean_std(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let var = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

impl Context {
    /// Measure prompt processing (`pp` tokens) and generation (`tg` steps on
    /// `pl` parallel sequences), `nr` times.
    ///
    /// Clears the conversation; the context is Idle afterwards, also on error.
    pub fn bench(&mut self, pp: usize, tg: usize, pl: usize, nr: usize) -> Result<BenchResult> {
        let span = info_span!("bench", id = %self.id);
        let _enter = span.enter();

        if pp == 0 || tg == 0 || pl == 0 || nr == 0 {
            return Err(ContextError::InvalidConfig(format!(
                "bench inputs must be positive: pp={pp} tg={tg} pl={pl} nr={nr}"
            )));
        }
        if pp + tg > self.n_ctx {
            return Err(ContextError::InvalidConfig(format!(
                "pp + tg = {} exceeds n_ctx {}",
                pp + tg,
                self.n_ctx
            )));
        }
        let max_seq = self.engine.max_sequences();
        if pl > max_seq || pl > self.params.n_batch {
            return Err(ContextError::InvalidConfig(format!(
                "pl = {pl} exceeds the {max_seq} sequences or n_batch {}",
                self.params.n_batch
            )));
        }

        self.reset_request();
        self.truncated = false;
        self.num_prompt_tokens = 0;
        self.state = ContextState::Idle;

        let result = self.run_trials(pp, tg, pl, nr);
        self.clear_cache();
        let (pp_speeds, tg_speeds) = result?;

        let (pp_avg, pp_std) = mean_std(&pp_speeds);
        let (tg_avg, tg_std) = mean_std(&tg_speeds);
        let meta = self.engine.metadata();
        let result = BenchResult {
            model_desc: meta.description.clone(),
            model_size: meta.size_bytes,
            model_params: meta.n_params,
            pp_avg,
            pp_std,
            tg_avg,
            tg_std,
            pp,
            tg,
            pl,
            nr,
        };
        info!(pp_avg, tg_avg, pp, tg, pl, nr, "bench finished");
        Ok(result)
    }

    fn run_trials(
        &mut self,
        pp: usize,
        tg: usize,
        pl: usize,
        nr: usize,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut pp_speeds = Vec::with_capacity(nr);
        let mut tg_speeds = Vec::with_capacity(nr);
        let prompt = vec![BENCH_TOKEN; pp];

        for _ in 0..nr {
            self.clear_cache();
            let start = Instant::now();
            for (i, chunk) in prompt.chunks(self.params.n_batch).enumerate() {
                let batch = Batch::from_tokens(chunk, i * self.params.n_batch, 0);
                self.engine.evaluate(&batch)?;
            }
            let t_pp = start.elapsed().as_secs_f64().max(1e-9);

            self.clear_cache();
            let start = Instant::now();
            let mut batch = Batch::with_capacity(pl);
            for pos in 0..tg {
                batch.clear();
                for seq in 0..pl {
                    batch.push(BENCH_TOKEN, pos, seq, true);
                }
                self.engine.evaluate(&batch)?;
            }
            let t_tg = start.elapsed().as_secs_f64().max(1e-9);

            pp_speeds.push(pp as f64 / t_pp);
            tg_speeds.push((pl * tg) as f64 / t_tg);
        }
        Ok((pp_speeds, tg_speeds))
    }
}
