//! Engine boundary: what a loaded model can do and the shapes it answers in.
//!
//! Aggregate results and streaming fragments follow the OpenAI chat
//! completion layout that llama.cpp servers emit. Fragment fields are all
//! optional because upstream payloads are loosely specified; consumers are
//! expected to narrow them once (see the server's fragment adapter).

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::error::EngineError;

/// Simple Chat Message struct for API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Parameters that change how the model is loaded into memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadParams {
    /// Layers to offload to the GPU. Negative means all of them.
    pub gpu_layers: i32,
    pub context_size: u32,
    pub batch_size: u32,
}

impl Default for LoadParams {
    fn default() -> Self {
        Self {
            gpu_layers: -1,
            context_size: 512,
            batch_size: 512,
        }
    }
}

/// Per-call sampling parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingOptions {
    /// 0.0 selects greedy decoding.
    pub temperature: f32,
    pub top_p: f32,
    /// 0 disables top-k filtering.
    pub top_k: i32,
    pub repeat_penalty: f32,
    pub max_tokens: u32,
    pub seed: u32,
}

impl Default for SamplingOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repeat_penalty: 1.1,
            max_tokens: 2048,
            seed: 1234,
        }
    }
}

// ===== AGGREGATE RESULT =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<CompletionChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    #[serde(default)]
    pub index: u32,
    pub message: AssistantMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

// ===== STREAMING FRAGMENTS =====

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub index: u32,
    #[serde(default)]
    pub delta: Option<ChunkDelta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

impl EngineChunk {
    /// Opening fragment announcing the assistant role, without content.
    pub fn role(id: &str, role: &str) -> Self {
        Self::single(
            id,
            ChunkDelta {
                role: Some(role.to_string()),
                content: None,
            },
            None,
        )
    }

    pub fn content(id: &str, content: impl Into<String>) -> Self {
        Self::single(
            id,
            ChunkDelta {
                role: None,
                content: Some(content.into()),
            },
            None,
        )
    }

    /// Closing fragment carrying only the finish reason.
    pub fn finish(id: &str, reason: &str) -> Self {
        Self::single(id, ChunkDelta::default(), Some(reason.to_string()))
    }

    fn single(id: &str, delta: ChunkDelta, finish_reason: Option<String>) -> Self {
        Self {
            id: Some(id.to_string()),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Some(delta),
                finish_reason,
            }],
        }
    }
}

/// Lazy fragment source. Pulling drives generation.
pub type FragmentIter<'a> = Box<dyn Iterator<Item = Result<EngineChunk, EngineError>> + 'a>;

/// What a chat completion call hands back.
pub enum CompletionOutput<'a> {
    Aggregate(ChatCompletion),
    Fragments(FragmentIter<'a>),
}

impl CompletionOutput<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            CompletionOutput::Aggregate(_) => "aggregate",
            CompletionOutput::Fragments(_) => "fragments",
        }
    }
}

/// A loaded model, ready for inference.
pub trait ChatModel: Send + Sync {
    /// Number of tokens the prompt encodes to, BOS included.
    fn token_count(&self, text: &str) -> Result<usize, EngineError>;

    /// Approximate resident size of the weights.
    fn size_bytes(&self) -> u64;

    /// Run a chat completion. With `stream` the model returns a lazy
    /// fragment iterator; otherwise it generates to completion first.
    fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
        stream: bool,
    ) -> Result<CompletionOutput<'_>, EngineError>;
}

/// Opens model files. Loading is blocking and may take seconds.
pub trait ModelLoader: Send + Sync {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Arc<dyn ChatModel>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_tolerates_missing_fields() {
        let chunk: EngineChunk = serde_json::from_str(r#"{"choices":[{}]}"#).unwrap();
        assert_eq!(chunk.choices.len(), 1);
        assert!(chunk.choices[0].delta.is_none());

        let chunk: EngineChunk = serde_json::from_str("{}").unwrap();
        assert!(chunk.choices.is_empty());
    }

    #[test]
    fn test_chunk_reads_openai_delta() {
        let raw = r#"{"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#;
        let chunk: EngineChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(chunk, EngineChunk::content("c1", "Hi"));
    }

    #[test]
    fn test_aggregate_without_usage() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"ok"}}]}"#;
        let completion: ChatCompletion = serde_json::from_str(raw).unwrap();
        assert!(completion.usage.is_none());
        assert_eq!(completion.choices[0].message.content.as_deref(), Some("ok"));
    }
}
