//! Prompt preparation: fitting a tokenized prompt into the window.
//!
//! A prompt that fits the window is used as is. An oversized prompt keeps a
//! leading prefix (usually the system prompt and BOS), drops whole blocks of
//! tokens right after it and keeps the remaining suffix, leaving part of the
//! window free for generation.

use cactus_engine::TokenId;

/// `n_ctx / RESERVED_GENERATION_DIVISOR` slots are kept free for generated tokens.
pub const RESERVED_GENERATION_DIVISOR: usize = 4;

/// Default prefix kept on truncation: `budget / PREFIX_KEEP_DIVISOR`.
pub const PREFIX_KEEP_DIVISOR: usize = 4;

/// Deterministic middle-erasure truncation for one window size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TruncationPolicy {
    n_ctx: usize,
    n_keep: Option<usize>,
}

/// A prompt ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedPrompt {
    pub tokens: Vec<TokenId>,
    pub truncated: bool,
    /// Tokens removed from the middle.
    pub n_erased: usize,
}

impl TruncationPolicy {
    pub fn new(n_ctx: usize, n_keep: Option<usize>) -> Self {
        Self { n_ctx, n_keep }
    }

    /// Slots reserved for generation.
    pub fn reserved(&self) -> usize {
        (self.n_ctx / RESERVED_GENERATION_DIVISOR).max(1)
    }

    /// Length an oversized prompt is cut down to.
    pub fn budget(&self) -> usize {
        self.n_ctx.saturating_sub(self.reserved()).max(1)
    }

    /// Prefix length preserved by truncation.
    pub fn keep(&self) -> usize {
        let budget = self.budget();
        self.n_keep
            .unwrap_or(budget / PREFIX_KEEP_DIVISOR)
            .min(budget / 2)
    }

    /// Size of one erased block.
    pub fn block_size(&self) -> usize {
        ((self.budget() - self.keep()) / 2).max(1)
    }

    pub fn prepare(&self, tokens: Vec<TokenId>) -> PreparedPrompt {
        if tokens.len() <= self.n_ctx {
            return PreparedPrompt {
                tokens,
                truncated: false,
                n_erased: 0,
            };
        }

        let budget = self.budget();
        let keep = self.keep();
        let block = self.block_size();
        let blocks = (tokens.len() - budget).div_ceil(block);
        let n_erased = (blocks * block).min(tokens.len() - keep);

        let mut out = Vec::with_capacity(tokens.len() - n_erased);
        out.extend_from_slice(&tokens[..keep]);
        out.extend_from_slice(&tokens[keep + n_erased..]);
        tracing::debug!(
            original = tokens.len(),
            kept = out.len(),
            n_keep = keep,
            n_erased,
            "truncated prompt"
        );
        PreparedPrompt {
            tokens: out,
            truncated: true,
            n_erased,
        }
    }
}

/// Length of the shared leading run of two token sequences.
pub fn common_prefix(a: &[TokenId], b: &[TokenId]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: usize) -> Vec<TokenId> {
        (0..n as TokenId).collect()
    }

    #[test]
    fn derived_sizes() {
        let p = TruncationPolicy::new(64, None);
        assert_eq!(p.reserved(), 16);
        assert_eq!(p.budget(), 48);
        assert_eq!(p.keep(), 12);
        assert_eq!(p.block_size(), 18);
    }

    #[test]
    fn short_prompt_untouched() {
        let p = TruncationPolicy::new(64, None);
        let prepared = p.prepare(seq(48));
        assert!(!prepared.truncated);
        assert_eq!(prepared.tokens, seq(48));
    }

    #[test]
    fn prompt_filling_the_window_untouched() {
        let p = TruncationPolicy::new(64, None);
        for len in [49, 51, 64] {
            let prepared = p.prepare(seq(len));
            assert!(!prepared.truncated, "len={}", len);
            assert_eq!(prepared.tokens, seq(len));
            assert_eq!(prepared.n_erased, 0);
        }
        let prepared = p.prepare(seq(65));
        assert!(prepared.truncated);
        assert!(prepared.tokens.len() <= p.budget());
    }

    #[test]
    fn long_prompt_keeps_prefix_and_suffix() {
        let p = TruncationPolicy::new(64, None);
        let prepared = p.prepare(seq(1000));
        assert!(prepared.truncated);
        assert!(prepared.tokens.len() <= p.budget());
        assert_eq!(&prepared.tokens[..12], &seq(12)[..]);
        assert_eq!(*prepared.tokens.last().unwrap(), 999);
        assert_eq!(prepared.tokens.len() + prepared.n_erased, 1000);
        // The suffix is contiguous.
        let suffix = &prepared.tokens[12..];
        assert!(suffix.windows(2).all(|w| w[1] == w[0] + 1));
    }

    #[test]
    fn configured_keep_is_clamped() {
        let p = TruncationPolicy::new(64, Some(1000));
        assert_eq!(p.keep(), 24);
        let p = TruncationPolicy::new(64, Some(1));
        assert_eq!(p.keep(), 1);
        let prepared = p.prepare(seq(200));
        assert_eq!(prepared.tokens[0], 0);
        assert!(prepared.tokens.len() <= p.budget());
    }

    #[test]
    fn deterministic() {
        let p = TruncationPolicy::new(32, None);
        assert_eq!(p.prepare(seq(333)), p.prepare(seq(333)));
    }

    #[test]
    fn every_length_fits() {
        for n_ctx in [8, 9, 17, 64, 100] {
            let p = TruncationPolicy::new(n_ctx, None);
            for len in 0..300 {
                let prepared = p.prepare(seq(len));
                assert_eq!(prepared.truncated, len > n_ctx, "n_ctx={} len={}", n_ctx, len);
                if prepared.truncated {
                    assert!(prepared.tokens.len() <= p.budget(), "n_ctx={} len={}", n_ctx, len);
                } else {
                    assert_eq!(prepared.tokens.len(), len);
                }
            }
        }
    }

    #[test]
    fn common_prefix_len() {
        assert_eq!(common_prefix(&[1, 2, 3], &[1, 2, 4]), 2);
        assert_eq!(common_prefix(&[1, 2], &[1, 2, 3]), 2);
        assert_eq!(common_prefix(&[], &[1]), 0);
    }
}
