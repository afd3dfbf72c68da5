//! Token-by-token generation.
//!
//! Each [`Context::next_token`] call samples one token, classifies it against
//! the stop conditions and, unless the step is terminal, feeds it back to the
//! engine. Text is released through a UTF-8 stream decoder and held back while
//! its tail could still turn into a stop string, so a caller never sees part
//! of a stop word.

use std::iter::FusedIterator;

use serde::Serialize;
use tracing::info_span;

use cactus_engine::{Batch, TokenId};
use cactus_runtime::CompletionTimings;
use cactus_sampling::{Candidate, Sample, SamplingConfig};

use crate::context::{Context, ContextState};
use crate::error::{ContextError, Result};

/// Why decoding ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Prediction limit or context window reached.
    Limit,
    /// The model produced an end-of-generation token.
    Eos,
    /// A stop string appeared in the output.
    Word,
    /// The caller interrupted decoding.
    Interrupted,
    /// Sampling or evaluation failed.
    Error,
}

/// One entry of a token's probability report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenProb {
    pub token: TokenId,
    pub piece: String,
    pub prob: f32,
}

/// Result of one decode step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedToken {
    pub token: TokenId,
    /// Text released by this step. May be empty while a multi-byte character
    /// or a possible stop string is pending.
    pub text: String,
    /// Top candidates when `n_probs > 0`.
    pub probs: Vec<TokenProb>,
}

/// Everything a finished completion reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionOutput {
    pub text: String,
    pub tokens: Vec<TokenId>,
    pub tokens_predicted: usize,
    pub tokens_evaluated: usize,
    pub truncated: bool,
    pub stop_reason: StopReason,
    pub stopping_word: Option<String>,
    pub timings: CompletionTimings,
}

/// Iterator over decode steps. Ends after a terminal step or the first error.
pub struct Completion<'a> {
    ctx: &'a mut Context,
    done: bool,
}

impl Completion<'_> {
    /// The context being decoded, for flag inspection between steps.
    pub fn context(&self) -> &Context {
        self.ctx
    }
}

impl Iterator for Completion<'_> {
    type Item = Result<GeneratedToken>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.ctx.next_token() {
            Ok(Some(step)) => Some(Ok(step)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Completion<'_> {}

impl Context {
    /// Why the last completion ended, once it has.
    pub fn stop_reason(&self) -> Option<StopReason> {
        match self.state {
            ContextState::Stopped(reason) => Some(reason),
            _ => None,
        }
    }

    /// Run one decode step.
    ///
    /// Returns `Ok(None)` once decoding has stopped. A sampling or evaluation
    /// failure ends decoding with [`StopReason::Error`]; the failed token is
    /// kept out of the history, the text and the sampler state.
    pub fn next_token(&mut self) -> Result<Option<GeneratedToken>> {
        match self.state {
            ContextState::Decoding => {}
            ContextState::Stopped(_) => return Ok(None),
            ContextState::Idle | ContextState::Ready => {
                return Err(ContextError::Misuse(
                    "next_token called before begin_completion".to_string(),
                ))
            }
        }

        if self.interrupt.is_interrupted() {
            self.interrupt.clear();
            self.finish(StopReason::Interrupted);
            return Ok(None);
        }

        let sample = match self.sample_next() {
            Ok(sample) => sample,
            Err(e) => return Err(self.fail(e)),
        };
        let token = sample.token;
        let (is_eog, piece, probs) = match self.describe(&sample) {
            Ok(described) => described,
            Err(e) => return Err(self.fail(e)),
        };

        let text_len = self.generated_text.len();
        let decoder = self.decoder.clone();
        let released = self.decoder.push(&piece);
        self.generated_text.push_str(&released);

        let n_predict = self.sampler.as_ref().and_then(|s| s.config().n_predict);
        if n_predict.is_some_and(|n| self.num_tokens_predicted + 1 >= n) {
            self.stopped_limit = true;
        }
        if is_eog {
            self.stopped_eos = true;
        } else {
            self.find_stop_word();
        }

        // A prompt that filled the window leaves no cell for the new token.
        let has_room = self.history.len() < self.n_ctx;
        if !has_room {
            self.stopped_limit = true;
        }
        if !self.is_stopping() {
            let batch = Batch::from_tokens(&[token], self.n_past, 0);
            if let Err(e) = self.engine.evaluate(&batch) {
                self.generated_text.truncate(text_len);
                self.decoder = decoder;
                return Err(self.fail(e.into()));
            }
            self.n_past += 1;
        }
        if let Err(e) = self.accept_sampled(token) {
            self.generated_text.truncate(text_len);
            self.decoder = decoder;
            return Err(self.fail(e));
        }

        self.num_tokens_predicted += 1;
        if let Some(timer) = self.timer.as_mut() {
            timer.mark_token();
        }
        if has_room {
            self.history.push(token);
        }
        if !self.is_stopping() && self.history.len() >= self.n_ctx {
            tracing::debug!(n_ctx = self.n_ctx, "context window exhausted");
            self.stopped_limit = true;
        }

        let stopping = self.is_stopping();
        let text = self.release_text(stopping);
        if stopping {
            let reason = if self.stopped_limit {
                StopReason::Limit
            } else if self.stopped_eos {
                StopReason::Eos
            } else {
                StopReason::Word
            };
            self.finish(reason);
        }

        Ok(Some(GeneratedToken { token, text, probs }))
    }

    /// Decode steps as an iterator. Starts decoding if a prompt is loaded.
    pub fn completion(&mut self) -> Result<Completion<'_>> {
        if self.state == ContextState::Ready {
            self.begin_completion()?;
        }
        Ok(Completion {
            ctx: self,
            done: false,
        })
    }

    /// Sample, load the prompt and decode until a stop condition.
    pub fn complete(&mut self, prompt: &str, sampling: SamplingConfig) -> Result<CompletionOutput> {
        let span = info_span!("completion", id = %self.id);
        let _enter = span.enter();

        self.init_sampling(sampling)?;
        let info = self.load_prompt(prompt)?;
        self.begin_completion()?;

        let mut tokens = Vec::new();
        while let Some(step) = self.next_token()? {
            tokens.push(step.token);
        }
        let stop_reason = self.stop_reason().ok_or_else(|| {
            ContextError::Misuse("decoding ended without a stop reason".to_string())
        })?;

        Ok(CompletionOutput {
            text: self.generated_text.clone(),
            tokens,
            tokens_predicted: self.num_tokens_predicted,
            tokens_evaluated: info.n_tokens,
            truncated: self.truncated,
            stop_reason,
            stopping_word: self.stopping_word.clone(),
            timings: self.timings,
        })
    }

    fn is_stopping(&self) -> bool {
        self.stopped_limit || self.stopped_eos || self.stopped_word
    }

    fn sample_next(&mut self) -> Result<Sample> {
        let sampler = self
            .sampler
            .as_mut()
            .ok_or_else(|| ContextError::Misuse("sampling is not initialized".to_string()))?;
        let logits = self.engine.logits()?;
        Ok(sampler.sample(logits, self.engine.vocab())?)
    }

    fn accept_sampled(&mut self, token: TokenId) -> Result<()> {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.accept(token, self.engine.vocab())?;
        }
        Ok(())
    }

    /// End-of-generation flag, text bytes and probability report for a sample.
    fn describe(&self, sample: &Sample) -> Result<(bool, Vec<u8>, Vec<TokenProb>)> {
        let vocab = self.engine.vocab();
        let is_eog = vocab.is_eog(sample.token);
        let piece = if is_eog {
            Vec::new()
        } else {
            vocab.token_to_piece(sample.token, false)?
        };
        let probs = sample
            .top
            .iter()
            .map(|&Candidate { token, prob }| -> Result<TokenProb> {
                let piece = vocab.token_to_piece(token, false)?;
                Ok(TokenProb {
                    token,
                    piece: String::from_utf8_lossy(&piece).into_owned(),
                    prob,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((is_eog, piece, probs))
    }

    /// Search unreleased text for a complete stop string and cut there.
    fn find_stop_word(&mut self) {
        let Some(sampler) = self.sampler.as_ref() else {
            return;
        };
        let window = &self.generated_text[self.sent..];
        let hit = sampler
            .config()
            .stop
            .iter()
            .filter(|s| !s.is_empty())
            .filter_map(|s| window.find(s.as_str()).map(|pos| (pos, s)))
            .min_by_key(|(pos, _)| *pos);
        if let Some((pos, word)) = hit {
            let word = word.clone();
            self.generated_text.truncate(self.sent + pos);
            self.stopped_word = true;
            self.stopping_word = Some(word);
        }
    }

    /// Bytes at the end of the text that could begin a stop string.
    fn partial_stop_len(&self) -> usize {
        let Some(sampler) = self.sampler.as_ref() else {
            return 0;
        };
        let text = &self.generated_text;
        let stops = &sampler.config().stop;
        let longest = stops.iter().map(String::len).max().unwrap_or(0);
        let from = text.len().saturating_sub(longest).max(self.sent);
        (from..text.len())
            .filter(|&i| text.is_char_boundary(i))
            .find(|&i| {
                let tail = &text[i..];
                stops
                    .iter()
                    .any(|s| s.len() > tail.len() && s.starts_with(tail))
            })
            .map(|i| text.len() - i)
            .unwrap_or(0)
    }

    /// Hand out newly releasable text. On the last step everything left is
    /// released, unless it was cut by a stop string.
    fn release_text(&mut self, last: bool) -> String {
        let end = if last {
            if !self.stopped_word {
                let tail = self.decoder.finish();
                self.generated_text.push_str(&tail);
            }
            self.generated_text.len()
        } else {
            self.generated_text.len() - self.partial_stop_len()
        };
        let end = end.max(self.sent);
        let text = self.generated_text[self.sent..end].to_string();
        self.sent = end;
        text
    }
}
