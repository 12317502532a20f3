//! # rs-llmcore
//!
//! Stateful generation core for autoregressive language models.
//!
//! ## Core Concept
//!
//! A [`GenerationSession`] wraps one model backend and keeps everything the
//! backend itself does not:
//! - **Context tracking**: a fixed-size ring of recently consumed tokens, used
//!   both to tell the backend how many cached tokens are still valid and to
//!   drive the repetition penalty
//! - **Batched evaluation**: prompts are fed to the backend in bounded chunks
//! - **Sampling**: repetition penalty, temperature, top-k and top-p over the
//!   last logits
//!
//! Forward passes and weight loading live behind the [`ModelBackend`] trait,
//! one implementation per architecture.
//!
//! ## Example
//!
//! ```ignore
//! use rs_llmcore::{AutoModel, GenerationConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let (mut session, config) = AutoModel::from_pretrained("models/tiny", Some("bigram"), None)?;
//!     let text = session.complete("the cat", &config.with_max_tokens(16))?;
//!     println!("{text}");
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod generation;
pub mod model;
pub mod utils;

// Re-exports for convenience
pub use config::{AutoConfig, ModelType};
pub use generation::{
    GenerationConfig, GenerationSession, Generate, RecencyBuffer, Sampler, SamplingParams,
    TextStream,
};
pub use model::{AutoModel, BigramModel, LoadedModel, ModelBackend, ModelBuilder, ModelParameters, Vocabulary};
pub use utils::{FixedSeed, SeedSource, TimeSeed};

/// Identifier of a token in the model vocabulary.
pub type TokenId = u32;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum LlmError {
    #[error("Session is already initialized")]
    AlreadyInitialized,

    #[error("Session is not initialized")]
    NotInitialized,

    #[error("Model load failed: {0}")]
    LoadFailure(String),

    #[error("Evaluation failed: {0}")]
    EvaluationFailure(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Unsupported model type: {0}")]
    UnsupportedModelType(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Tokenizer error: {0}")]
    TokenizerError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, LlmError>;
