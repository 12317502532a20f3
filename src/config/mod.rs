//! Configuration module for model types and generation defaults.

mod auto_config;

pub use auto_config::{AutoConfig, ModelType};
