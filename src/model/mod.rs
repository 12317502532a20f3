//! Model backends and the vocabulary they load.

mod auto_model;
mod base;
pub mod bigram;
mod vocab;

pub use auto_model::{AutoModel, ModelBuilder};
pub use base::{LoadedModel, ModelBackend, ModelParameters};
pub use bigram::BigramModel;
pub use vocab::{Vocabulary, END_OF_TEXT};
