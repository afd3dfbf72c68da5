//! Telemetry hooks for completion timing.
//!
//! Provides:
//! - [`CompletionTimings`]: prompt and decode throughput of one completion
//! - [`TelemetryHook`] trait: callback interface for real-time reporting
//! - [`InferenceTimer`]: records timestamps and computes timings
//! - [`NoopTelemetry`] / [`LogTelemetry`]: built-in hook implementations

use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Timings of a completion, split into prompt evaluation and decoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionTimings {
    /// Prompt tokens evaluated (reused prefix tokens are not counted).
    pub prompt_n: usize,
    pub prompt_ms: f64,
    pub prompt_per_token_ms: f64,
    pub prompt_per_second: f64,
    /// Tokens produced by the decode loop.
    pub predicted_n: usize,
    pub predicted_ms: f64,
    pub predicted_per_token_ms: f64,
    pub predicted_per_second: f64,
}

impl CompletionTimings {
    pub fn total_ms(&self) -> f64 {
        self.prompt_ms + self.predicted_ms
    }
}

/// Callback trait for completion telemetry.
///
/// All methods have default no-op implementations so hooks can be selective.
pub trait TelemetryHook: Send + Sync {
    /// Prompt evaluation finished after `ms` milliseconds.
    fn on_prompt_evaluated(&self, _n_tokens: usize, _ms: f64) {}

    /// A decode step produced a token.
    fn on_token_generated(&self, _token_idx: usize, _elapsed_ms: f64) {}

    /// The completion finished.
    fn on_completion(&self, _timings: &CompletionTimings) {}
}

/// No-op telemetry hook.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the last report and logs it at debug level.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    last_report: Arc<Mutex<Option<CompletionTimings>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timings of the last finished completion.
    pub fn last_timings(&self) -> Option<CompletionTimings> {
        self.last_report.lock().ok().and_then(|report| *report)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_completion(&self, timings: &CompletionTimings) {
        tracing::debug!(
            prompt_n = timings.prompt_n,
            prompt_ms = timings.prompt_ms,
            predicted_n = timings.predicted_n,
            predicted_per_second = timings.predicted_per_second,
            "completion timings"
        );
        if let Ok(mut report) = self.last_report.lock() {
            *report = Some(*timings);
        }
    }
}

fn per_token(ms: f64, n: usize) -> (f64, f64) {
    if n == 0 || ms <= 0.0 {
        return (0.0, 0.0);
    }
    (ms / n as f64, n as f64 * 1000.0 / ms)
}

/// Records timestamps during a completion to compute [`CompletionTimings`].
///
/// Usage:
/// 1. Call [`InferenceTimer::new`] when the request starts
/// 2. Call [`mark_prompt_evaluated`](Self::mark_prompt_evaluated) after prompt evaluation
/// 3. Call [`mark_token`](Self::mark_token) after each decode step
/// 4. Call [`finish`](Self::finish) to compute the timings
pub struct InferenceTimer {
    prompt_tokens: usize,
    start: Instant,
    prompt_end: Option<Instant>,
    token_count: usize,
    hook: Arc<dyn TelemetryHook>,
}

impl InferenceTimer {
    pub fn new(prompt_tokens: usize, hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            prompt_tokens,
            start: Instant::now(),
            prompt_end: None,
            token_count: 0,
            hook,
        }
    }

    pub fn mark_prompt_evaluated(&mut self) {
        let now = Instant::now();
        self.prompt_end = Some(now);
        let ms = now.duration_since(self.start).as_secs_f64() * 1000.0;
        self.hook.on_prompt_evaluated(self.prompt_tokens, ms);
    }

    pub fn mark_token(&mut self) {
        self.token_count += 1;
        let elapsed_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.hook.on_token_generated(self.token_count, elapsed_ms);
    }

    pub fn tokens(&self) -> usize {
        self.token_count
    }

    /// Timings so far without firing the completion hook.
    pub fn snapshot(&self) -> CompletionTimings {
        let total_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        let prompt_ms = self
            .prompt_end
            .map(|t| t.duration_since(self.start).as_secs_f64() * 1000.0)
            .unwrap_or(0.0);
        let predicted_ms = (total_ms - prompt_ms).max(0.0);
        let (prompt_per_token_ms, prompt_per_second) = per_token(prompt_ms, self.prompt_tokens);
        let (predicted_per_token_ms, predicted_per_second) = per_token(predicted_ms, self.token_count);
        CompletionTimings {
            prompt_n: self.prompt_tokens,
            prompt_ms,
            prompt_per_token_ms,
            prompt_per_second,
            predicted_n: self.token_count,
            predicted_ms,
            predicted_per_token_ms,
            predicted_per_second,
        }
    }

    /// Finalize the timings. Fires `on_completion`.
    pub fn finish(self) -> CompletionTimings {
        let timings = self.snapshot();
        self.hook.on_completion(&timings);
        timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_telemetry_captures_timings() {
        let hook = LogTelemetry::new();
        assert!(hook.last_timings().is_none());

        let timings = CompletionTimings {
            prompt_n: 4,
            prompt_ms: 12.5,
            predicted_n: 8,
            predicted_ms: 100.0,
            ..Default::default()
        };
        hook.on_completion(&timings);

        let captured = hook.last_timings().unwrap();
        assert_eq!(captured.prompt_ms, 12.5);
        assert_eq!(captured.predicted_n, 8);
        assert_eq!(captured.total_ms(), 112.5);
    }

    #[test]
    fn timer_basic_flow() {
        let mut timer = InferenceTimer::new(3, Arc::new(NoopTelemetry));
        timer.mark_prompt_evaluated();
        timer.mark_token();
        timer.mark_token();
        timer.mark_token();

        let timings = timer.finish();
        assert_eq!(timings.prompt_n, 3);
        assert_eq!(timings.predicted_n, 3);
        assert!(timings.prompt_ms >= 0.0);
        assert!(timings.predicted_ms >= 0.0);
        assert!(timings.predicted_per_second.is_finite());
    }

    #[test]
    fn timer_fires_completion_hook() {
        let log = LogTelemetry::new();
        let mut timer = InferenceTimer::new(2, Arc::new(log.clone()));
        timer.mark_prompt_evaluated();
        timer.mark_token();
        let timings = timer.finish();

        let captured = log.last_timings().unwrap();
        assert_eq!(captured.predicted_n, timings.predicted_n);
        assert_eq!(captured.prompt_n, 2);
    }

    #[test]
    fn timer_without_prompt_mark() {
        let timer = InferenceTimer::new(1, Arc::new(NoopTelemetry));
        let timings = timer.finish();
        assert_eq!(timings.prompt_ms, 0.0);
        assert_eq!(timings.predicted_n, 0);
        assert_eq!(timings.predicted_per_second, 0.0);
    }

    #[test]
    fn per_token_rates() {
        assert_eq!(per_token(0.0, 5), (0.0, 0.0));
        assert_eq!(per_token(10.0, 0), (0.0, 0.0));
        assert_eq!(per_token(500.0, 10), (50.0, 20.0));
    }

    #[test]
    fn timings_serialize_to_json() {
        let json = serde_json::to_value(CompletionTimings::default()).unwrap();
        assert!(json.get("predicted_per_second").is_some());
    }
}
