//! # cactus-tokenizer
//!
//! Vocabulary access for the cactus inference context.
//!
//! This crate provides:
//! - A `Vocabulary` trait wrapping the compute engine's text <-> token conversion
//! - Streaming piece decoding that never splits a UTF-8 sequence
//! - A deterministic byte-level reference vocabulary for tests and demos

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Error type for tokenization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(TokenId),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Vocabulary of a loaded model. Implementations can be swapped without changing app code.
pub trait Vocabulary: Send + Sync {
    /// Encode text into token IDs.
    ///
    /// `add_special` prepends the BOS token when the model uses one.
    /// `parse_special` recognises the textual form of control tokens.
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> TokenizerResult<Vec<TokenId>>;

    /// Raw bytes of a single token. Control tokens render as empty unless `special` is set.
    ///
    /// A piece is not guaranteed to be valid UTF-8 on its own; use [`StreamDecoder`]
    /// to join pieces.
    fn token_to_piece(&self, token: TokenId, special: bool) -> TokenizerResult<Vec<u8>>;

    /// Beginning-of-sequence token.
    fn bos(&self) -> Option<TokenId>;

    /// End-of-sequence token.
    fn eos(&self) -> TokenId;

    /// Number of tokens in the vocabulary.
    fn n_vocab(&self) -> usize;

    /// Whether the token ends generation (EOS or another end-of-turn marker).
    fn is_eog(&self, token: TokenId) -> bool {
        token == self.eos()
    }

    /// Decode a complete token sequence. Invalid UTF-8 is replaced, never rejected.
    fn detokenize(&self, tokens: &[TokenId]) -> TokenizerResult<String> {
        let mut bytes = Vec::with_capacity(tokens.len());
        for &token in tokens {
            bytes.extend(self.token_to_piece(token, false)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

/// Streaming decoder for token pieces.
///
/// Pieces are pushed as raw bytes; only complete UTF-8 sequences are released.
/// A trailing partial multi-byte sequence is held back until the next piece
/// completes it. Invalid bytes are replaced with U+FFFD.
#[derive(Debug, Clone, Default)]
pub struct StreamDecoder {
    buffer: String,
    pending_utf8: Vec<u8>,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything released so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Bytes held back waiting for the rest of a UTF-8 sequence.
    pub fn pending(&self) -> &[u8] {
        &self.pending_utf8
    }

    /// Push a piece and return the newly released text (possibly empty).
    pub fn push(&mut self, piece: &[u8]) -> String {
        self.pending_utf8.extend_from_slice(piece);

        let mut released = String::new();
        let mut rest: &[u8] = &self.pending_utf8;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    released.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, tail) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    released.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            released.push(char::REPLACEMENT_CHARACTER);
                            rest = &tail[bad..];
                        }
                        None => {
                            rest = tail;
                            break;
                        }
                    }
                }
            }
        }

        self.pending_utf8 = rest.to_vec();
        self.buffer.push_str(&released);
        released
    }

    /// Release whatever is still pending, replacing an incomplete sequence.
    pub fn finish(&mut self) -> String {
        if self.pending_utf8.is_empty() {
            return String::new();
        }
        let tail = String::from_utf8_lossy(&self.pending_utf8).into_owned();
        self.pending_utf8.clear();
        self.buffer.push_str(&tail);
        tail
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_utf8.clear();
    }
}

/// Reference byte-level vocabulary.
///
/// - One token per byte (ids 0..=255)
/// - BOS, EOS and end-of-turn control tokens after the byte range
/// - Deterministic and bidirectional, used by the reference engine and tests
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteVocab;

impl ByteVocab {
    pub const BOS: TokenId = 256;
    pub const EOS: TokenId = 257;
    pub const EOT: TokenId = 258;
    pub const N_VOCAB: usize = 259;

    const SPECIALS: [(&'static str, TokenId); 3] = [
        ("<s>", Self::BOS),
        ("</s>", Self::EOS),
        ("<|eot|>", Self::EOT),
    ];

    pub fn new() -> Self {
        Self
    }

    fn special_text(token: TokenId) -> Option<&'static str> {
        Self::SPECIALS
            .iter()
            .find(|(_, id)| *id == token)
            .map(|(text, _)| *text)
    }
}

impl Vocabulary for ByteVocab {
    fn tokenize(
        &self,
        text: &str,
        add_special: bool,
        parse_special: bool,
    ) -> TokenizerResult<Vec<TokenId>> {
        let mut ids = Vec::with_capacity(text.len() + 1);
        if add_special {
            ids.push(Self::BOS);
        }

        let bytes = text.as_bytes();
        let mut i = 0;
        'outer: while i < bytes.len() {
            if parse_special {
                for (special, id) in Self::SPECIALS {
                    if bytes[i..].starts_with(special.as_bytes()) {
                        ids.push(id);
                        i += special.len();
                        continue 'outer;
                    }
                }
            }
            ids.push(TokenId::from(bytes[i]));
            i += 1;
        }

        Ok(ids)
    }

    fn token_to_piece(&self, token: TokenId, special: bool) -> TokenizerResult<Vec<u8>> {
        match token {
            0..=255 => Ok(vec![token as u8]),
            _ => match Self::special_text(token) {
                Some(text) if special => Ok(text.as_bytes().to_vec()),
                Some(_) => Ok(Vec::new()),
                None => Err(TokenizerError::InvalidToken(token)),
            },
        }
    }

    fn bos(&self) -> Option<TokenId> {
        Some(Self::BOS)
    }

    fn eos(&self) -> TokenId {
        Self::EOS
    }

    fn n_vocab(&self) -> usize {
        Self::N_VOCAB
    }

    fn is_eog(&self, token: TokenId) -> bool {
        token == Self::EOS || token == Self::EOT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_bytes_simple() {
        let vocab = ByteVocab::new();
        let ids = vocab.tokenize("hi", false, false).unwrap();
        assert_eq!(ids, vec![104, 105]);
    }

    #[test]
    fn tokenize_adds_bos() {
        let vocab = ByteVocab::new();
        let ids = vocab.tokenize("a", true, false).unwrap();
        assert_eq!(ids, vec![ByteVocab::BOS, 97]);
    }

    #[test]
    fn tokenize_empty_string() {
        let vocab = ByteVocab::new();
        assert!(vocab.tokenize("", false, false).unwrap().is_empty());
    }

    #[test]
    fn parse_special_recognises_control_text() {
        let vocab = ByteVocab::new();
        let ids = vocab.tokenize("a</s>", false, true).unwrap();
        assert_eq!(ids, vec![97, ByteVocab::EOS]);

        let literal = vocab.tokenize("a</s>", false, false).unwrap();
        assert_eq!(literal.len(), 5);
    }

    #[test]
    fn control_pieces_hidden_unless_special() {
        let vocab = ByteVocab::new();
        assert!(vocab.token_to_piece(ByteVocab::EOS, false).unwrap().is_empty());
        assert_eq!(vocab.token_to_piece(ByteVocab::EOS, true).unwrap(), b"</s>");
    }

    #[test]
    fn invalid_token_errors() {
        let vocab = ByteVocab::new();
        assert_eq!(
            vocab.token_to_piece(999, false).unwrap_err(),
            TokenizerError::InvalidToken(999)
        );
    }

    #[test]
    fn eog_includes_end_of_turn() {
        let vocab = ByteVocab::new();
        assert!(vocab.is_eog(ByteVocab::EOS));
        assert!(vocab.is_eog(ByteVocab::EOT));
        assert!(!vocab.is_eog(32));
    }

    #[test]
    fn stream_decoder_holds_partial_utf8() {
        let mut decoder = StreamDecoder::new();
        let euro = "€".as_bytes();
        assert_eq!(decoder.push(&euro[..1]), "");
        assert_eq!(decoder.push(&euro[1..2]), "");
        assert_eq!(decoder.pending().len(), 2);
        assert_eq!(decoder.push(&euro[2..]), "€");
        assert_eq!(decoder.buffer(), "€");
        assert!(decoder.pending().is_empty());
    }

    #[test]
    fn stream_decoder_replaces_invalid_bytes() {
        let mut decoder = StreamDecoder::new();
        assert_eq!(decoder.push(&[b'a', 0xFF, b'b']), "a\u{FFFD}b");
    }

    #[test]
    fn stream_decoder_finish_flushes_pending() {
        let mut decoder = StreamDecoder::new();
        decoder.push(&[0xE2]);
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(decoder.pending().is_empty());

        decoder.clear();
        assert_eq!(decoder.buffer(), "");
    }
}
