//! Auto model detection and loading.

use std::path::{Path, PathBuf};

use crate::config::{AutoConfig, ModelType};
use crate::generation::{GenerationConfig, GenerationSession};
use crate::utils::SeedSource;
use crate::LlmError;
use super::base::ModelBackend;
use super::bigram::BigramModel;

/// Automatic model loader that detects the model type and picks the backend.
pub struct AutoModel;

impl AutoModel {
    /// Load a model from a file or directory
    ///
    /// # Arguments
    /// * `model_path` - Model file, or a directory holding one (plus an optional `config.json`)
    /// * `model_type` - Model type name; detected from `config.json` when `None`
    /// * `config` - Generation defaults; read from `model_path` when `None`
    ///
    /// # Returns
    /// An initialized session and the generation defaults for it
    pub fn from_pretrained(
        model_path: impl AsRef<Path>,
        model_type: Option<&str>,
        config: Option<AutoConfig>,
    ) -> crate::Result<(GenerationSession, GenerationConfig)> {
        let mut builder = ModelBuilder::new(model_path.as_ref());
        if let Some(model_type) = model_type {
            builder = builder.model_type(model_type);
        }
        if let Some(config) = config {
            builder = builder.config(config);
        }
        builder.build()
    }

    /// Backend compiled into this crate for a model type
    pub fn backend_for(model_type: ModelType) -> crate::Result<Box<dyn ModelBackend>> {
        match model_type {
            ModelType::Bigram => Ok(Box::new(BigramModel::new())),
            other => Err(LlmError::UnsupportedModelType(format!(
                "no built-in backend for '{}'; supply one with ModelBuilder::backend",
                other
            ))),
        }
    }

    /// Get detected model type for a model directory
    pub fn detect_model_type(model_path: impl AsRef<Path>) -> crate::Result<Option<ModelType>> {
        AutoConfig::from_pretrained(model_path, None)?.detected_model_type()
    }
}

/// Builder for model loading with configuration options
pub struct ModelBuilder {
    model_path: PathBuf,
    model_type: Option<String>,
    model_file: Option<String>,
    config: Option<AutoConfig>,
    backend: Option<Box<dyn ModelBackend>>,
    seed_source: Option<Box<dyn SeedSource>>,
}

impl ModelBuilder {
    /// Create a new model builder
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            model_type: None,
            model_file: None,
            config: None,
            backend: None,
            seed_source: None,
        }
    }

    /// Set the model type
    pub fn model_type(mut self, model_type: impl Into<String>) -> Self {
        self.model_type = Some(model_type.into());
        self
    }

    /// Pick the model file when the directory holds several
    pub fn model_file(mut self, model_file: impl Into<String>) -> Self {
        self.model_file = Some(model_file.into());
        self
    }

    /// Use these defaults instead of reading `config.json`
    pub fn config(mut self, config: AutoConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Use a custom backend instead of the built-in one for the model type
    pub fn backend(mut self, backend: Box<dyn ModelBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the seed source for unseeded sampling
    pub fn seed_source(mut self, seed_source: Box<dyn SeedSource>) -> Self {
        self.seed_source = Some(seed_source);
        self
    }

    /// Build and initialize the session
    pub fn build(self) -> crate::Result<(GenerationSession, GenerationConfig)> {
        let auto_config = match self.config {
            Some(config) => config,
            None => AutoConfig::from_pretrained(&self.model_path, None)?,
        };

        let type_name = self
            .model_type
            .or_else(|| auto_config.model_type.clone())
            .ok_or_else(|| {
                LlmError::ConfigError(format!(
                    "Unable to detect model type for {:?}; specify one explicitly",
                    self.model_path
                ))
            })?;
        let model_type: ModelType = type_name.parse()?;
        tracing::info!("Model type: {}", model_type);

        let backend = match self.backend {
            Some(backend) => backend,
            None => AutoModel::backend_for(model_type)?,
        };

        let model_file = if self.model_path.is_dir() {
            AutoConfig::find_model_file(
                &self.model_path,
                self.model_file.as_deref(),
                model_type.model_file_extension(),
            )?
        } else {
            self.model_path
        };

        let mut session = GenerationSession::new(backend, model_type);
        if let Some(seed_source) = self.seed_source {
            session = session.with_seed_source(seed_source);
        }
        session.init(&model_file)?;

        Ok((session, auto_config.config))
    }
}
