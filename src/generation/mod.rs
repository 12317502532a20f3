//! Text generation: recency tracking, sampling and the session that ties
//! them to a model backend.

mod config;
mod recency;
mod sampler;
mod session;
mod stream;

pub use config::GenerationConfig;
pub use recency::RecencyBuffer;
pub use sampler::{Sampler, SamplingParams};
pub use session::GenerationSession;
pub use stream::{Generate, TextStream};
