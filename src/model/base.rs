//! Base trait for model backends.

use std::path::Path;

use super::Vocabulary;
use crate::TokenId;

/// Hyperparameters the session needs from a loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelParameters {
    /// Context length in tokens
    pub n_ctx: usize,
    /// End of sequence token ID, when the model format names one
    pub eos_token_id: Option<TokenId>,
}

/// Result of a successful [`ModelBackend::load`].
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub params: ModelParameters,
    pub vocab: Vocabulary,
}

/// Trait for per-architecture model implementations.
///
/// A backend owns its weights and whatever evaluation cache the architecture
/// needs. The session only ever calls [`load`](Self::load) once and then
/// feeds token batches through [`evaluate`](Self::evaluate).
pub trait ModelBackend: Send {
    /// Architecture name, used in logs
    fn name(&self) -> &str;

    /// Load weights and vocabulary from `source`
    fn load(&mut self, source: &Path) -> crate::Result<LoadedModel>;

    /// Run a forward pass over `tokens`.
    ///
    /// The first `n_past` tokens of the backend's cache stay valid context;
    /// anything cached beyond them is discarded before the batch is appended.
    ///
    /// # Returns
    /// Logits for the token following the batch. Only the trailing
    /// `vocab_size` entries are read by the sampler.
    fn evaluate(&mut self, tokens: &[TokenId], threads: usize, n_past: usize) -> crate::Result<Vec<f32>>;
}
