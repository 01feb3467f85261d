use thiserror::Error;

/// Errors raised at the inference engine boundary.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("backend init failed: {0}")]
    Backend(String),

    #[error("model file not found: {0}")]
    NotFound(String),

    #[error("unrecognized model format: {0}")]
    Format(String),

    #[error("failed to load model: {0}")]
    Load(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("prompt of {prompt_tokens} tokens does not fit context of {context_size}")]
    ContextOverflow { prompt_tokens: usize, context_size: u32 },

    #[error("failed to create context: {0}")]
    Context(String),

    #[error("chat template error: {0}")]
    Template(String),

    #[error("decode failed: {0}")]
    Decode(String),
}

impl EngineError {
    /// True when the error happened while opening the model file, as opposed
    /// to running inference on an already loaded model.
    pub fn is_load_failure(&self) -> bool {
        matches!(
            self,
            EngineError::NotFound(_) | EngineError::Format(_) | EngineError::Load(_)
        )
    }
}
