//! Sentence embeddings.

use serde::{Deserialize, Serialize};
use tracing::info_span;

use cactus_engine::{Batch, TokenId};

use crate::context::{Context, ContextState};
use crate::error::{ContextError, Result};

/// How an embedding vector is normalized before it is returned.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbdNormalize {
    None,
    /// Scale into the int16 range: divide by `max|x| / 32760`.
    MaxAbs,
    /// Sum of absolute values.
    Taxicab,
    #[default]
    Euclidean,
    /// p-norm for any `p > 0`.
    PNorm(f32),
}

impl EmbdNormalize {
    /// Map the conventional integer codes: -1 none, 0 max-abs, 1 taxicab,
    /// 2 euclidean, anything above is a p-norm.
    pub fn from_code(code: i32) -> Self {
        match code {
            i32::MIN..=-1 => Self::None,
            0 => Self::MaxAbs,
            1 => Self::Taxicab,
            2 => Self::Euclidean,
            p => Self::PNorm(p as f32),
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::PNorm(p) if !(p.is_finite() && p > 0.0) => Err(ContextError::InvalidConfig(
                format!("p-norm exponent must be positive, got {p}"),
            )),
            _ => Ok(()),
        }
    }

    /// Normalize in place. A zero vector stays zero.
    pub fn apply(&self, values: &mut [f32]) {
        let norm = match *self {
            Self::None => return,
            Self::MaxAbs => values.iter().fold(0.0f32, |m, v| m.max(v.abs())) / 32760.0,
            Self::Taxicab => values.iter().map(|v| v.abs()).sum(),
            Self::Euclidean => values.iter().map(|v| v * v).sum::<f32>().sqrt(),
            Self::PNorm(p) => values
                .iter()
                .map(|v| v.abs().powf(p))
                .sum::<f32>()
                .powf(1.0 / p),
        };
        if norm > 0.0 {
            values.iter_mut().for_each(|v| *v /= norm);
        } else {
            values.iter_mut().for_each(|v| *v = 0.0);
        }
    }
}

impl Context {
    /// Embed `text` with the configured normalization.
    pub fn embedding(&mut self, text: &str) -> Result<Vec<f32>> {
        self.embedding_with(text, self.params.embd_normalize)
    }

    /// Embed `text` with an explicit normalization.
    ///
    /// Clears the cache and conversation history, so the next completion
    /// starts from scratch.
    pub fn embedding_with(&mut self, text: &str, normalize: EmbdNormalize) -> Result<Vec<f32>> {
        let span = info_span!("embedding", id = %self.id);
        let _enter = span.enter();

        if !self.params.embedding {
            return Err(ContextError::EmbeddingDisabled);
        }
        normalize.validate()?;
        if text.is_empty() {
            return Err(ContextError::EmptyPrompt);
        }
        let tokens = self.engine.vocab().tokenize(text, true, true)?;
        if tokens.is_empty() {
            return Err(ContextError::EmptyPrompt);
        }
        let prepared = self.policy.prepare(tokens);
        if prepared.tokens.len() > self.params.n_batch {
            return Err(ContextError::InvalidConfig(format!(
                "input of {} tokens exceeds n_batch {}",
                prepared.tokens.len(),
                self.params.n_batch
            )));
        }

        self.reset_request();
        self.clear_cache();
        self.truncated = prepared.truncated;
        self.state = ContextState::Idle;

        let result = self.embed_tokens(&prepared.tokens);
        self.clear_cache();
        let mut values = result?;
        normalize.apply(&mut values);
        tracing::debug!(n_tokens = prepared.tokens.len(), n_embd = values.len(), "embedded");
        Ok(values)
    }

    fn embed_tokens(&mut self, tokens: &[TokenId]) -> Result<Vec<f32>> {
        let mut batch = Batch::with_capacity(tokens.len());
        for (pos, &token) in tokens.iter().enumerate() {
            batch.push(token, pos, 0, true);
        }
        self.engine.evaluate(&batch)?;
        Ok(self.engine.embedding(0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            let tolerance = 1e-5 * y.abs().max(1.0);
            assert!((x - y).abs() <= tolerance, "{:?} != {:?}", a, b);
        }
    }

    #[test]
    fn euclidean() {
        let mut v = [3.0, 4.0];
        EmbdNormalize::Euclidean.apply(&mut v);
        assert_close(&v, &[0.6, 0.8]);
    }

    #[test]
    fn taxicab() {
        let mut v = [1.0, -3.0];
        EmbdNormalize::Taxicab.apply(&mut v);
        assert_close(&v, &[0.25, -0.75]);
    }

    #[test]
    fn max_abs_scales_to_int16_range() {
        let mut v = [0.5, -1.0];
        EmbdNormalize::MaxAbs.apply(&mut v);
        assert_close(&v, &[16380.0, -32760.0]);
    }

    #[test]
    fn p_norm_matches_euclidean_for_two() {
        let mut a = [1.0, 2.0, 2.0];
        let mut b = a;
        EmbdNormalize::PNorm(2.0).apply(&mut a);
        EmbdNormalize::Euclidean.apply(&mut b);
        assert_close(&a, &b);
    }

    #[test]
    fn zero_vector_stays_zero() {
        let mut v = [0.0; 4];
        EmbdNormalize::Euclidean.apply(&mut v);
        assert_eq!(v, [0.0; 4]);
    }

    #[test]
    fn codes() {
        assert_eq!(EmbdNormalize::from_code(-1), EmbdNormalize::None);
        assert_eq!(EmbdNormalize::from_code(0), EmbdNormalize::MaxAbs);
        assert_eq!(EmbdNormalize::from_code(2), EmbdNormalize::Euclidean);
        assert_eq!(EmbdNormalize::from_code(3), EmbdNormalize::PNorm(3.0));
    }

    #[test]
    fn invalid_p() {
        assert!(EmbdNormalize::PNorm(0.0).validate().is_err());
        assert!(EmbdNormalize::PNorm(f32::NAN).validate().is_err());
        assert!(EmbdNormalize::PNorm(1.5).validate().is_ok());
    }

    #[test]
    fn serde_names() {
        let json = serde_json::to_string(&EmbdNormalize::MaxAbs).unwrap();
        assert_eq!(json, "\"max_abs\"");
        let p: EmbdNormalize = serde_json::from_str(r#"{"p_norm": 3.0}"#).unwrap();
        assert_eq!(p, EmbdNormalize::PNorm(3.0));
    }
}
