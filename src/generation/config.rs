//! Generation configuration.

use serde::{Deserialize, Serialize};

use super::SamplingParams;

/// Configuration for text generation.
///
/// Negative `last_n_tokens`, `seed` and `threads` select the session
/// defaults (full context, a time-derived seed, and up to four threads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Top-k sampling
    pub top_k: i32,

    /// Top-p (nucleus) sampling threshold
    pub top_p: f32,

    /// Temperature for sampling (0 or below = greedy)
    pub temperature: f32,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Number of last tokens considered for the repetition penalty
    pub last_n_tokens: i32,

    /// Random seed for reproducibility
    pub seed: i64,

    /// Number of tokens evaluated per forward pass
    pub batch_size: usize,

    /// Number of evaluation threads
    pub threads: i32,

    /// Maximum number of new tokens to generate
    pub max_new_tokens: usize,

    /// Sequences that end generation when they appear in the output
    pub stop: Vec<String>,

    /// Whether to reset the session before generating
    pub reset: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.95,
            temperature: 0.8,
            repetition_penalty: 1.0,
            last_n_tokens: 64,
            seed: -1,
            batch_size: 8,
            threads: -1,
            max_new_tokens: 256,
            stop: Vec::new(),
            reset: true,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding configuration
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_k: 1,
            top_p: 1.0,
            ..Default::default()
        }
    }

    /// Sampler knobs of this configuration
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            top_k: self.top_k,
            top_p: self.top_p,
            temperature: self.temperature,
            repetition_penalty: self.repetition_penalty,
        }
    }

    /// Set max new tokens
    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_new_tokens = max_tokens;
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    /// Set seed
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    /// Set repetition penalty
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    /// Set stop sequences
    pub fn with_stop<I, S>(mut self, stop: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop = stop.into_iter().map(Into::into).collect();
        self
    }

    /// Set evaluation batch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}
