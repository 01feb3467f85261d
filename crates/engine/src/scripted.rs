//! Scripted in-memory engine.
//!
//! Replays a fixed reply through the same boundary the llama.cpp engine
//! implements. Used by tests to drive the server without model weights, and
//! to simulate misbehaving engines (malformed fragments, failures, panics,
//! wrong result shape). Keeps a count of live models so callers can check that
//! every handle was released.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::EngineError;
use crate::types::{
    AssistantMessage, ChatCompletion, ChatMessage, ChatModel, CompletionChoice, CompletionOutput,
    EngineChunk, LoadParams, ModelLoader, SamplingOptions, Usage,
};

/// One step of a scripted reply.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// A well-formed fragment carrying text.
    Content(String),
    /// A fragment with no choices at all.
    Malformed,
    /// A fragment whose delta carries an empty string.
    Blank,
    /// The engine fails at this point.
    Fail(String),
    /// The engine panics at this point.
    Panic(String),
}

/// Which result shape the model hands back, regardless of what was asked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    Honest,
    AlwaysAggregate,
    AlwaysFragments,
}

#[derive(Clone)]
pub struct ScriptedLoader {
    steps: Arc<Vec<ScriptStep>>,
    shape: ReplyShape,
    size_bytes: u64,
    live: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    /// Reply with `text`, split into word-sized fragments.
    pub fn new(text: &str) -> Self {
        Self::with_steps(split_words(text).into_iter().map(ScriptStep::Content).collect())
    }

    pub fn with_steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps: Arc::new(steps),
            shape: ReplyShape::Honest,
            size_bytes: 64 * 1024 * 1024,
            live: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_shape(mut self, shape: ReplyShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Models loaded by this loader that have not been dropped yet.
    pub fn live_models(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total successful loads.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, path: &Path, _params: &LoadParams) -> Result<Arc<dyn ChatModel>, EngineError> {
        if !path.is_file() {
            return Err(EngineError::NotFound(path.display().to_string()));
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedModel {
            steps: self.steps.clone(),
            shape: self.shape,
            size_bytes: self.size_bytes,
            live: self.live.clone(),
        }))
    }
}

pub struct ScriptedModel {
    steps: Arc<Vec<ScriptStep>>,
    shape: ReplyShape,
    size_bytes: u64,
    live: Arc<AtomicUsize>,
}

impl Drop for ScriptedModel {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedModel {
    fn aggregate(&self, messages: &[ChatMessage]) -> Result<ChatCompletion, EngineError> {
        let mut text = String::new();
        let mut completion_tokens = 0;
        for step in self.steps.iter() {
            match step {
                ScriptStep::Content(s) => {
                    text.push_str(s);
                    completion_tokens += 1;
                }
                ScriptStep::Fail(e) => return Err(EngineError::Decode(e.clone())),
                ScriptStep::Panic(msg) => panic!("{msg}"),
                ScriptStep::Malformed | ScriptStep::Blank => {}
            }
        }

        let prompt_tokens = messages
            .iter()
            .map(|m| self.token_count(&m.content))
            .sum::<Result<usize, _>>()? as u32;

        Ok(ChatCompletion {
            id: "chatcmpl-scripted".to_string(),
            model: "scripted".to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some(text),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }

    fn fragments(&self) -> impl Iterator<Item = Result<EngineChunk, EngineError>> + '_ {
        const ID: &str = "chatcmpl-scripted";
        let body = self.steps.iter().map(|step| match step {
            ScriptStep::Content(s) => Ok(EngineChunk::content(ID, s.clone())),
            ScriptStep::Blank => Ok(EngineChunk::content(ID, "")),
            ScriptStep::Malformed => Ok(EngineChunk::default()),
            ScriptStep::Fail(e) => Err(EngineError::Decode(e.clone())),
            ScriptStep::Panic(msg) => panic!("{msg}"),
        });
        std::iter::once(Ok(EngineChunk::role(ID, "assistant")))
            .chain(body)
            .chain(std::iter::once(Ok(EngineChunk::finish(ID, "stop"))))
    }
}

impl ChatModel for ScriptedModel {
    fn token_count(&self, text: &str) -> Result<usize, EngineError> {
        // BOS plus one token per word.
        Ok(text.split_whitespace().count() + 1)
    }

    fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        _options: &SamplingOptions,
        stream: bool,
    ) -> Result<CompletionOutput<'_>, EngineError> {
        let stream = match self.shape {
            ReplyShape::Honest => stream,
            ReplyShape::AlwaysAggregate => false,
            ReplyShape::AlwaysFragments => true,
        };
        if stream {
            Ok(CompletionOutput::Fragments(Box::new(self.fragments())))
        } else {
            self.aggregate(messages).map(CompletionOutput::Aggregate)
        }
    }
}

/// Split text into pieces that keep their leading whitespace, the way BPE
/// tokens usually do: "Hi there" -> ["Hi", " there"].
fn split_words(text: &str) -> Vec<String> {
    let mut pieces = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_whitespace() && !current.trim().is_empty() {
            pieces.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}
