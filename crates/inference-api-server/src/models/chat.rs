use inference_engine::{LoadParams, SamplingOptions};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::path::PathBuf;
use validator::{Validate, ValidationError};

use crate::utils::error::ApiError;

// ===== REQUEST MODELS =====

/// Wire envelope: `{"data": {...}}`.
#[derive(Debug, Deserialize)]
pub struct ModelRequestSchema {
    pub data: ModelRequest,
}

#[derive(Debug, Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_source"))]
pub struct ModelRequest {
    #[serde(default)]
    #[validate(nested)]
    pub model_params: ModelParams,
    #[validate(length(min = 1, message = "prompt must not be empty"))]
    pub prompt: String,
    #[serde(default)]
    pub local: bool,
    #[serde(default)]
    pub model_path: String,
    #[serde(default)]
    pub repo_id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub stream: bool,
}

fn validate_source(request: &ModelRequest) -> Result<(), ValidationError> {
    if request.local {
        if request.model_path.trim().is_empty() {
            return Err(ValidationError::new("model_path")
                .with_message(Cow::Borrowed("model_path is required when local=true")));
        }
    } else if request.repo_id.trim().is_empty() || request.filename.trim().is_empty() {
        return Err(ValidationError::new("hosted_source")
            .with_message(Cow::Borrowed("repo_id and filename are required when local=false")));
    }
    Ok(())
}

/// Tuning parameters. Older clients send the llama.cpp names
/// (`n_gpu_layers`, `n_ctx`, `n_batch`), accepted as aliases.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ModelParams {
    #[serde(alias = "n_gpu_layers")]
    #[validate(range(min = -1, message = "gpu_layers must be -1 (all) or a layer count"))]
    pub gpu_layers: i32,

    #[serde(alias = "n_ctx")]
    #[validate(range(min = 1, message = "context_size must be positive"))]
    pub context_size: i32,

    #[serde(alias = "n_batch", alias = "N_batch")]
    #[validate(range(min = 1, message = "batch_size must be positive"))]
    pub batch_size: i32,

    #[validate(range(min = 0.0, message = "temperature must not be negative"))]
    pub temperature: f32,

    #[validate(range(min = 0.0, max = 1.0, message = "top_p must be within [0, 1]"))]
    pub top_p: f32,

    #[validate(range(min = 0, message = "top_k must not be negative"))]
    pub top_k: i32,

    #[validate(range(exclusive_min = 0.0, message = "repeat_penalty must be positive"))]
    pub repeat_penalty: f32,

    #[validate(range(min = 1, message = "max_tokens must be positive"))]
    pub max_tokens: i32,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            gpu_layers: -1,
            context_size: 512,
            batch_size: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 2048,
        }
    }
}

impl ModelParams {
    /// The subset that decides what ends up in memory. Call after validation.
    pub fn load_params(&self) -> LoadParams {
        LoadParams {
            gpu_layers: self.gpu_layers,
            context_size: self.context_size.max(1) as u32,
            batch_size: self.batch_size.max(1) as u32,
        }
    }

    pub fn sampling(&self) -> SamplingOptions {
        SamplingOptions {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            max_tokens: self.max_tokens.max(1) as u32,
            ..SamplingOptions::default()
        }
    }
}

// ===== DOMAIN =====

/// Where the model weights come from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModelSourceSpec {
    Local { path: PathBuf },
    Hosted { repo_id: String, filename: String },
}

impl std::fmt::Display for ModelSourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelSourceSpec::Local { path } => write!(f, "local:{}", path.display()),
            ModelSourceSpec::Hosted { repo_id, filename } => write!(f, "hub:{repo_id}/{filename}"),
        }
    }
}

/// A validated chat request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub source: ModelSourceSpec,
    pub params: ModelParams,
    pub prompt: String,
    pub stream: bool,
}

impl TryFrom<ModelRequest> for ChatRequest {
    type Error = ApiError;

    fn try_from(request: ModelRequest) -> Result<Self, Self::Error> {
        request.validate()?;

        let source = if request.local {
            ModelSourceSpec::Local {
                path: PathBuf::from(request.model_path),
            }
        } else {
            ModelSourceSpec::Hosted {
                repo_id: request.repo_id,
                filename: request.filename,
            }
        };

        Ok(Self {
            source,
            params: request.model_params,
            prompt: request.prompt,
            stream: request.stream,
        })
    }
}

// ===== RESPONSE MODELS =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionResult {
    pub content: Option<String>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
    pub time_taken_seconds: f64,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub response: ChatCompletionResult,
}

// ===== STREAM EVENT MODELS =====

/// One line of the streaming body. Serialized without a tag; the field set
/// tells the variants apart.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    PrefillSummary {
        num_input_tokens: usize,
        input_tokens_per_second: f64,
    },
    TokenDelta {
        content: String,
        num_generated_tokens: usize,
        tokens_per_second: f64,
        memory_delta_mb: f64,
        time_to_first_token_seconds: f64,
    },
    FinalSummary {
        total_time_seconds: f64,
        max_memory_delta_mb: f64,
        num_generated_tokens: usize,
        num_input_tokens: usize,
        input_tokens_per_second: f64,
        time_to_first_token_seconds: Option<f64>,
    },
}

impl StreamEvent {
    /// Newline-terminated JSON frame.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}
