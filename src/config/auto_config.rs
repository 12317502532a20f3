//! Model type detection and generation defaults from a model directory.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::generation::GenerationConfig;
use crate::LlmError;

/// Supported model architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelType {
    Gpt2,
    GptJ,
    GptNeoX,
    DollyV2,
    StarCoder,
    Mpt,
    Falcon,
    Llama,
    Bigram,
}

impl ModelType {
    /// Canonical name, accepted back by [`FromStr`]
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelType::Gpt2 => "gpt2",
            ModelType::GptJ => "gptj",
            ModelType::GptNeoX => "gpt_neox",
            ModelType::DollyV2 => "dolly-v2",
            ModelType::StarCoder => "starcoder",
            ModelType::Mpt => "mpt",
            ModelType::Falcon => "falcon",
            ModelType::Llama => "llama",
            ModelType::Bigram => "bigram",
        }
    }

    /// Extra end-of-sequence marker text for this architecture.
    ///
    /// Dolly V2 ends a response with the literal `### End` token instead of
    /// the canonical end-of-text id. The marker only applies when the loaded
    /// vocabulary registers special tokens.
    pub fn eos_marker(&self) -> Option<&'static str> {
        match self {
            ModelType::DollyV2 => Some("### End"),
            _ => None,
        }
    }

    /// File extension of model files for this architecture
    pub fn model_file_extension(&self) -> &'static str {
        match self {
            ModelType::Bigram => "json",
            _ => "bin",
        }
    }
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelType {
    type Err = LlmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        let model_type = match normalized.as_str() {
            "gpt2" => ModelType::Gpt2,
            "gptj" | "gpt_j" => ModelType::GptJ,
            "gpt_neox" | "gptneox" => ModelType::GptNeoX,
            "dolly_v2" | "dollyv2" => ModelType::DollyV2,
            "starcoder" | "gpt_bigcode" => ModelType::StarCoder,
            "mpt" => ModelType::Mpt,
            "falcon" | "refinedweb" | "refinedwebmodel" => ModelType::Falcon,
            "llama" => ModelType::Llama,
            "bigram" => ModelType::Bigram,
            _ => return Err(LlmError::UnsupportedModelType(s.to_string())),
        };
        Ok(model_type)
    }
}

/// Generation defaults plus the model type found next to a model.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AutoConfig {
    pub config: GenerationConfig,
    pub model_type: Option<String>,
}

/// Subset of `config.json` that affects generation
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(default)]
    model_type: Option<String>,
    #[serde(default)]
    task_specific_params: TaskSpecificParams,
}

#[derive(Debug, Default, Deserialize)]
struct TaskSpecificParams {
    #[serde(default, rename = "text-generation")]
    text_generation: TextGenerationParams,
}

#[derive(Debug, Default, Deserialize)]
struct TextGenerationParams {
    top_k: Option<i32>,
    top_p: Option<f32>,
    temperature: Option<f32>,
    repetition_penalty: Option<f32>,
    last_n_tokens: Option<i32>,
}

impl AutoConfig {
    /// Load defaults for a model file or directory.
    ///
    /// For a directory, `config.json` (when present) supplies the model type
    /// and overrides from `task_specific_params.text-generation`. Entries of
    /// `overrides` are applied last; each key must name a
    /// [`GenerationConfig`] field.
    pub fn from_pretrained(
        path: impl AsRef<Path>,
        overrides: Option<&Map<String, Value>>,
    ) -> crate::Result<Self> {
        let path = path.as_ref();
        let mut auto_config = AutoConfig::default();

        if path.is_dir() {
            let config_path = path.join("config.json");
            if config_path.is_file() {
                auto_config.update_from_file(&config_path)?;
            }
        } else if !path.is_file() {
            return Err(LlmError::ConfigError(format!(
                "Model path {:?} doesn't exist",
                path
            )));
        }

        if let Some(overrides) = overrides {
            auto_config.apply_overrides(overrides)?;
        }

        Ok(auto_config)
    }

    fn apply_overrides(&mut self, overrides: &Map<String, Value>) -> crate::Result<()> {
        let Value::Object(mut fields) = serde_json::to_value(&self.config)? else {
            return Err(LlmError::ConfigError("generation config is not an object".to_string()));
        };

        for (key, value) in overrides {
            if !fields.contains_key(key) {
                return Err(LlmError::ConfigError(format!(
                    "'{}' is not a generation config option",
                    key
                )));
            }
            fields.insert(key.clone(), value.clone());
        }

        self.config = serde_json::from_value(Value::Object(fields))
            .map_err(|e| LlmError::ConfigError(format!("Invalid config override: {}", e)))?;
        Ok(())
    }

    fn update_from_file(&mut self, path: &Path) -> crate::Result<()> {
        let content = std::fs::read_to_string(path)?;
        let raw: RawConfig = serde_json::from_str(&content)?;

        self.model_type = raw.model_type;

        let params = raw.task_specific_params.text_generation;
        let config = &mut self.config;
        if let Some(top_k) = params.top_k {
            config.top_k = top_k;
        }
        if let Some(top_p) = params.top_p {
            config.top_p = top_p;
        }
        if let Some(temperature) = params.temperature {
            config.temperature = temperature;
        }
        if let Some(penalty) = params.repetition_penalty {
            config.repetition_penalty = penalty;
        }
        if let Some(last_n) = params.last_n_tokens {
            config.last_n_tokens = last_n;
        }

        tracing::debug!("Read generation defaults from {:?}", path);
        Ok(())
    }

    /// Detected model type, if `config.json` named one
    pub fn detected_model_type(&self) -> crate::Result<Option<ModelType>> {
        self.model_type.as_deref().map(str::parse).transpose()
    }

    /// Locate the model file inside a directory.
    ///
    /// With `model_file` set, that file must exist. Otherwise exactly one
    /// file with the given extension must be present; `config.json` and
    /// `tokenizer.json` never count.
    pub fn find_model_file(
        dir: impl AsRef<Path>,
        model_file: Option<&str>,
        extension: &str,
    ) -> crate::Result<PathBuf> {
        let dir = dir.as_ref();

        if let Some(name) = model_file {
            let file = dir.join(name);
            if !file.is_file() {
                return Err(LlmError::ConfigError(format!(
                    "Model file '{}' not found in {:?}",
                    name, dir
                )));
            }
            return Ok(file);
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if !path.is_file() || name == "config.json" || name == "tokenizer.json" {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some(extension) {
                files.push(path);
            }
        }
        files.sort();

        match files.len() {
            0 => Err(LlmError::ConfigError(format!("No model files found in {:?}", dir))),
            1 => Ok(files.remove(0)),
            _ => {
                let names: Vec<String> = files
                    .iter()
                    .filter_map(|f| f.file_name().map(|n| n.to_string_lossy().into_owned()))
                    .collect();
                Err(LlmError::ConfigError(format!(
                    "Multiple model files found in {:?}: {}; pick one with model_file",
                    dir,
                    names.join(", ")
                )))
            }
        }
    }
}
