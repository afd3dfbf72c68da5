//! # cactus-runtime
//!
//! Runtime pieces shared by the session layer and its hosts: completion
//! telemetry (prompt and decode throughput) and a deterministic reference
//! engine that implements the `cactus-engine` boundary on the CPU.

pub mod reference;
pub mod telemetry;

pub use reference::{ReferenceEngine, ReferenceLoader};
pub use telemetry::{CompletionTimings, InferenceTimer, LogTelemetry, NoopTelemetry, TelemetryHook};
