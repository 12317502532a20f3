//! Token vocabulary and tokenization.
//!
//! Vocabularies loaded from `tokenizer.json` encode and decode through the
//! `tokenizers` crate. Plain token lists fall back to greedy longest-match.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokenizers::Tokenizer;

use crate::{LlmError, TokenId};

/// Text used as end-of-sequence marker when the model does not name one.
pub const END_OF_TEXT: &str = "<|endoftext|>";

/// Bidirectional token mapping plus the set of special tokens.
///
/// Built once when a model loads and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    token_to_id: HashMap<String, TokenId>,
    /// Display text per id; decoded text when a tokenizer is attached
    id_to_token: HashMap<TokenId, String>,
    /// Special tokens present in the vocabulary, longest first
    special_tokens: Vec<String>,
    /// Byte length of the longest token
    max_token_len: usize,
    tokenizer: Option<Arc<Tokenizer>>,
}

impl Vocabulary {
    /// Build a vocabulary where each token's id is its position.
    ///
    /// Special tokens missing from `tokens` are ignored.
    pub fn new<I, S>(tokens: I, special_tokens: &[String]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_pairs(
            tokens
                .into_iter()
                .enumerate()
                .map(|(id, text)| (text.into(), id as TokenId)),
            special_tokens,
        )
    }

    /// Build a vocabulary from explicit `(text, id)` pairs.
    pub fn from_pairs<I>(pairs: I, special_tokens: &[String]) -> Self
    where
        I: IntoIterator<Item = (String, TokenId)>,
    {
        let mut token_to_id = HashMap::new();
        let mut id_to_token = HashMap::new();
        let mut max_token_len = 0;

        for (text, id) in pairs {
            max_token_len = max_token_len.max(text.len());
            token_to_id.insert(text.clone(), id);
            id_to_token.insert(id, text);
        }

        let mut special_tokens: Vec<String> = special_tokens
            .iter()
            .filter(|t| !t.is_empty() && token_to_id.contains_key(*t))
            .cloned()
            .collect();
        special_tokens.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        special_tokens.dedup();

        Self {
            token_to_id,
            id_to_token,
            special_tokens,
            max_token_len,
            tokenizer: None,
        }
    }

    /// Load the vocabulary of a `tokenizer.json` file.
    ///
    /// Added tokens flagged as special become special tokens. The tokenizer
    /// is kept: [`tokenize`](Self::tokenize) runs its full pipeline and
    /// [`token_text`](Self::token_text) returns each id decoded on its own.
    pub fn from_tokenizer_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let tokenizer = Tokenizer::from_file(path)
            .map_err(|e| LlmError::TokenizerError(format!("{}: {}", path.display(), e)))?;

        let special: Vec<String> = tokenizer
            .get_added_tokens_decoder()
            .values()
            .filter(|token| token.special)
            .map(|token| token.content.clone())
            .collect();

        let mut vocab = Self::from_pairs(tokenizer.get_vocab(true), &special);
        for (id, text) in vocab.id_to_token.iter_mut() {
            *text = tokenizer
                .decode(&[*id], false)
                .map_err(|e| LlmError::TokenizerError(format!("decode {}: {}", id, e)))?;
        }
        vocab.tokenizer = Some(Arc::new(tokenizer));

        tracing::debug!(
            "Loaded {} tokens ({} special) from {:?}",
            vocab.len(),
            vocab.special_tokens.len(),
            path
        );
        Ok(vocab)
    }

    /// Number of distinct token ids
    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn token_id(&self, text: &str) -> Option<TokenId> {
        self.token_to_id.get(text).copied()
    }

    pub fn token_text(&self, id: TokenId) -> Option<&str> {
        self.id_to_token.get(&id).map(String::as_str)
    }

    pub fn special_tokens(&self) -> &[String] {
        &self.special_tokens
    }

    pub fn has_special_tokens(&self) -> bool {
        !self.special_tokens.is_empty()
    }

    /// Id of `<|endoftext|>`, or 0 when the vocabulary has no such token
    pub fn eos_token(&self) -> TokenId {
        self.token_id(END_OF_TEXT).unwrap_or(0)
    }

    /// Split text into token ids.
    ///
    /// With a tokenizer attached this is its `encode` without added special
    /// tokens. Otherwise special tokens are matched first and everything else
    /// greedily by the longest vocabulary entry at the current position;
    /// characters no token covers are skipped.
    pub fn tokenize(&self, text: &str) -> crate::Result<Vec<TokenId>> {
        if let Some(tokenizer) = &self.tokenizer {
            let encoding = tokenizer
                .encode(text, false)
                .map_err(|e| LlmError::TokenizerError(e.to_string()))?;
            return Ok(encoding.get_ids().to_vec());
        }
        Ok(self.greedy_tokenize(text))
    }

    fn greedy_tokenize(&self, text: &str) -> Vec<TokenId> {
        let mut ids = Vec::new();
        let mut pos = 0;

        while pos < text.len() {
            let rest = &text[pos..];

            if let Some(special) = self.special_tokens.iter().find(|s| rest.starts_with(s.as_str())) {
                ids.push(self.token_to_id[special]);
                pos += special.len();
                continue;
            }

            match self.longest_match(rest) {
                Some((id, len)) => {
                    ids.push(id);
                    pos += len;
                }
                None => {
                    let skipped = rest.chars().next().map_or(1, char::len_utf8);
                    tracing::warn!("No token covers {:?}, skipping", &rest[..skipped]);
                    pos += skipped;
                }
            }
        }

        ids
    }

    /// Longest token that prefixes `text`, as `(id, byte length)`
    fn longest_match(&self, text: &str) -> Option<(TokenId, usize)> {
        let mut len = self.max_token_len.min(text.len());
        while len > 0 {
            if text.is_char_boundary(len) {
                if let Some(&id) = self.token_to_id.get(&text[..len]) {
                    return Some((id, len));
                }
            }
            len -= 1;
        }
        None
    }
}
