//! Bigram transition model.
//!
//! The smallest architecture that exercises the full backend contract: it
//! keeps a token cache that honours `n_past`, and its logits depend on the
//! last cached token. Model files are JSON:
//!
//! ```json
//! {
//!   "n_ctx": 64,
//!   "tokens": ["<|endoftext|>", "a", "b"],
//!   "special_tokens": [],
//!   "eos_token": "<|endoftext|>",
//!   "logits": [[0.0, 1.0, 0.5], [0.1, 0.0, 2.0], [1.5, 0.2, 0.0]]
//! }
//! ```
//!
//! Row `i` of `logits` scores every token as the successor of token `i`.
//! Instead of `tokens`, a file may name a `tokenizer` (a `tokenizer.json`
//! path relative to the model file) to take the vocabulary from.

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::base::{LoadedModel, ModelBackend, ModelParameters};
use super::Vocabulary;
use crate::{LlmError, TokenId};

/// On-disk representation of a bigram model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BigramFile {
    pub n_ctx: usize,
    #[serde(default)]
    pub tokens: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer: Option<String>,
    #[serde(default)]
    pub special_tokens: Vec<String>,
    #[serde(default)]
    pub eos_token: Option<String>,
    pub logits: Vec<Vec<f32>>,
}

/// Bigram model backend
#[derive(Debug, Default)]
pub struct BigramModel {
    /// Transition table, row-major `vocab_size x vocab_size`
    table: Vec<f32>,
    vocab_size: usize,
    n_ctx: usize,
    /// Tokens currently held as context
    cache: Vec<TokenId>,
    /// Bytes of working memory per cached token, measured on first evaluation
    mem_per_token: usize,
}

impl BigramModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tokens currently cached
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn mem_per_token(&self) -> usize {
        self.mem_per_token
    }

    fn parse(file: BigramFile, base_dir: &Path) -> crate::Result<(Self, LoadedModel)> {
        let vocab = match &file.tokenizer {
            Some(name) => Vocabulary::from_tokenizer_file(base_dir.join(name))
                .map_err(|e| LlmError::LoadFailure(e.to_string()))?,
            None => Vocabulary::new(file.tokens, &file.special_tokens),
        };

        let vocab_size = vocab.len();
        if vocab_size == 0 {
            return Err(LlmError::LoadFailure("model has no tokens".to_string()));
        }
        if file.n_ctx == 0 {
            return Err(LlmError::LoadFailure("n_ctx must be positive".to_string()));
        }
        if file.logits.len() != vocab_size {
            return Err(LlmError::LoadFailure(format!(
                "expected {} logit rows, found {}",
                vocab_size,
                file.logits.len()
            )));
        }

        let mut table = Vec::with_capacity(vocab_size * vocab_size);
        for (i, row) in file.logits.iter().enumerate() {
            if row.len() != vocab_size {
                return Err(LlmError::LoadFailure(format!(
                    "logit row {} has {} entries, expected {}",
                    i,
                    row.len(),
                    vocab_size
                )));
            }
            table.extend_from_slice(row);
        }

        let eos_token_id = match &file.eos_token {
            Some(text) => Some(vocab.token_id(text).ok_or_else(|| {
                LlmError::LoadFailure(format!("eos token {:?} is not in the vocabulary", text))
            })?),
            None => None,
        };

        let model = Self {
            table,
            vocab_size,
            n_ctx: file.n_ctx,
            cache: Vec::new(),
            mem_per_token: 0,
        };
        let loaded = LoadedModel {
            params: ModelParameters {
                n_ctx: file.n_ctx,
                eos_token_id,
            },
            vocab,
        };
        Ok((model, loaded))
    }
}

impl ModelBackend for BigramModel {
    fn name(&self) -> &str {
        "bigram"
    }

    fn load(&mut self, source: &Path) -> crate::Result<LoadedModel> {
        let content = std::fs::read_to_string(source)
            .map_err(|e| LlmError::LoadFailure(format!("{}: {}", source.display(), e)))?;
        let file: BigramFile = serde_json::from_str(&content)
            .map_err(|e| LlmError::LoadFailure(format!("{}: {}", source.display(), e)))?;

        let base_dir = source.parent().unwrap_or_else(|| Path::new("."));
        let (model, loaded) = Self::parse(file, base_dir)?;
        *self = model;

        tracing::info!(
            "Loaded bigram model from {:?} (vocab {}, n_ctx {})",
            source,
            self.vocab_size,
            self.n_ctx
        );
        Ok(loaded)
    }

    fn evaluate(&mut self, tokens: &[TokenId], threads: usize, n_past: usize) -> crate::Result<Vec<f32>> {
        if self.vocab_size == 0 {
            return Err(LlmError::EvaluationFailure("model is not loaded".to_string()));
        }
        let Some(&last) = tokens.last() else {
            return Err(LlmError::EvaluationFailure("empty batch".to_string()));
        };
        if n_past > self.cache.len() {
            return Err(LlmError::EvaluationFailure(format!(
                "n_past {} exceeds {} cached tokens",
                n_past,
                self.cache.len()
            )));
        }
        if n_past + tokens.len() > self.n_ctx {
            return Err(LlmError::EvaluationFailure(format!(
                "{} tokens exceed context length {}",
                n_past + tokens.len(),
                self.n_ctx
            )));
        }
        if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= self.vocab_size) {
            return Err(LlmError::EvaluationFailure(format!(
                "token {} is outside the vocabulary",
                bad
            )));
        }

        self.cache.truncate(n_past);
        self.cache.extend_from_slice(tokens);

        if self.mem_per_token == 0 {
            self.mem_per_token = std::mem::size_of::<TokenId>()
                + self.vocab_size * std::mem::size_of::<f32>() / tokens.len();
            tracing::debug!("bigram memory per token: {} bytes", self.mem_per_token);
        }
        tracing::trace!(
            "bigram eval: {} tokens, n_past {}, {} threads",
            tokens.len(),
            n_past,
            threads
        );

        let row = last as usize * self.vocab_size;
        Ok(self.table[row..row + self.vocab_size].to_vec())
    }
}
