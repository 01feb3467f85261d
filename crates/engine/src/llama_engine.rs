//! LlamaCpp Engine - llama.cpp bindings behind the `ChatModel` boundary

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use log::{debug, info, warn};
use std::fs::File;
use std::io::Read;
use std::num::NonZeroU32;
use std::path::Path;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::error::EngineError;
use crate::types::{
    AssistantMessage, ChatCompletion, ChatMessage, ChatModel, CompletionChoice, CompletionOutput,
    EngineChunk, LoadParams, ModelLoader, SamplingOptions, Usage,
};

const GGUF_MAGIC: &[u8; 4] = b"GGUF";

/// Tokens looked back for the repetition penalty.
const PENALTY_LAST_N: i32 = 64;

/// Opens GGUF files with llama.cpp.
///
/// The llama.cpp backend can only be initialized once per process, so one
/// loader should be created at startup and shared.
pub struct LlamaCppLoader {
    backend: Arc<LlamaBackend>,
    use_mlock: bool,
}

impl LlamaCppLoader {
    pub fn new() -> Result<Self, EngineError> {
        let backend = LlamaBackend::init().map_err(|e| EngineError::Backend(e.to_string()))?;
        info!("LlamaCpp backend initialized");
        Ok(Self {
            backend: Arc::new(backend),
            use_mlock: false,
        })
    }

    /// Lock loaded weights in RAM so they are never swapped out.
    pub fn with_mlock(mut self, use_mlock: bool) -> Self {
        self.use_mlock = use_mlock;
        self
    }
}

impl ModelLoader for LlamaCppLoader {
    fn load(&self, path: &Path, params: &LoadParams) -> Result<Arc<dyn ChatModel>, EngineError> {
        if !path.is_file() {
            return Err(EngineError::NotFound(path.display().to_string()));
        }
        check_gguf_magic(path)?;

        let t0 = Instant::now();
        info!("loading GGUF model: {}", path.display());

        // Negative means "offload everything"; llama.cpp clamps oversized counts.
        let gpu_layers = u32::try_from(params.gpu_layers).unwrap_or(u32::MAX);
        let mut model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
        if self.use_mlock {
            model_params = model_params.with_use_mlock(true);
        }
        let model_params = pin!(model_params);

        let model = LlamaModel::load_from_file(&self.backend, path, &model_params)
            .map_err(|e| EngineError::Load(format!("{}: {e}", path.display())))?;

        info!(
            "model loaded in {} ms ({} MB)",
            t0.elapsed().as_millis(),
            model.size() / (1024 * 1024)
        );

        Ok(Arc::new(LlamaCppModel {
            backend: self.backend.clone(),
            model,
            params: *params,
        }))
    }
}

fn check_gguf_magic(path: &Path) -> Result<(), EngineError> {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| EngineError::Format(format!("{}: {e}", path.display())))?;
    if &magic != GGUF_MAGIC {
        return Err(EngineError::Format(format!(
            "{} is not a GGUF file",
            path.display()
        )));
    }
    Ok(())
}

/// A GGUF model resident in memory.
pub struct LlamaCppModel {
    backend: Arc<LlamaBackend>,
    model: LlamaModel,
    params: LoadParams,
}

impl LlamaCppModel {
    /// Apply the model's chat template, falling back to a plain transcript
    /// when the GGUF metadata carries none.
    fn format_prompt(&self, messages: &[ChatMessage]) -> Result<String, EngineError> {
        let template = match self.model.chat_template(None) {
            Ok(t) => t,
            Err(e) => {
                warn!("no chat template in model ({e:?}), using plain transcript");
                return Ok(plain_transcript(messages));
            }
        };

        let chat_messages: Vec<LlamaChatMessage> = messages
            .iter()
            .map(|m| LlamaChatMessage::new(m.role.clone(), m.content.clone()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Template(format!("{e:?}")))?;

        self.model
            .apply_chat_template(&template, &chat_messages, true)
            .map_err(|e| EngineError::Template(format!("{e:?}")))
    }

    /// Create a context and run the prefill. The returned stream is
    /// positioned right before the first generated token.
    fn open(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
    ) -> Result<LlamaStream<'_>, EngineError> {
        let prompt = self.format_prompt(messages)?;
        let tokens = self
            .model
            .str_to_token(&prompt, AddBos::Always)
            .map_err(|e| EngineError::Tokenize(e.to_string()))?;

        let context_size = self.params.context_size;
        if tokens.is_empty() || tokens.len() >= context_size as usize {
            return Err(EngineError::ContextOverflow {
                prompt_tokens: tokens.len(),
                context_size,
            });
        }

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(NonZeroU32::new(context_size))
            .with_n_batch(self.params.batch_size);
        let mut ctx = self
            .model
            .new_context(&self.backend, ctx_params)
            .map_err(|e| EngineError::Context(e.to_string()))?;

        // Prefill in n_batch sized slices; only the final prompt token needs logits.
        let n_batch = self.params.batch_size.max(1) as usize;
        let last = tokens.len() - 1;
        let mut batch = LlamaBatch::new(n_batch, 1);
        let mut logits_index = 0;
        for (slice_no, slice) in tokens.chunks(n_batch).enumerate() {
            batch.clear();
            for (offset, token) in slice.iter().enumerate() {
                let pos = slice_no * n_batch + offset;
                batch
                    .add(*token, pos as i32, &[0], pos == last)
                    .map_err(|e| EngineError::Decode(e.to_string()))?;
            }
            ctx.decode(&mut batch)
                .map_err(|e| EngineError::Decode(format!("prefill: {e}")))?;
            logits_index = batch.n_tokens() - 1;
        }

        debug!("prefilled {} prompt tokens", tokens.len());

        let prompt_tokens = tokens.len() as i32;
        let n_len = generation_limit(prompt_tokens, options.max_tokens, context_size);

        Ok(LlamaStream {
            model: &self.model,
            ctx,
            sampler: build_sampler(options),
            decoder: encoding_rs::UTF_8.new_decoder(),
            id: completion_id(),
            logits_index,
            n_cur: prompt_tokens,
            n_len,
            prompt_tokens: prompt_tokens as u32,
            generated: 0,
            role_sent: false,
            done: false,
            closed: false,
            finish_reason: None,
        })
    }
}

impl ChatModel for LlamaCppModel {
    fn token_count(&self, text: &str) -> Result<usize, EngineError> {
        self.model
            .str_to_token(text, AddBos::Always)
            .map(|tokens| tokens.len())
            .map_err(|e| EngineError::Tokenize(e.to_string()))
    }

    fn size_bytes(&self) -> u64 {
        self.model.size()
    }

    fn create_chat_completion(
        &self,
        messages: &[ChatMessage],
        options: &SamplingOptions,
        stream: bool,
    ) -> Result<CompletionOutput<'_>, EngineError> {
        let stream_iter = self.open(messages, options)?;
        if stream {
            return Ok(CompletionOutput::Fragments(Box::new(stream_iter)));
        }
        stream_iter.collect_completion().map(CompletionOutput::Aggregate)
    }
}

/// Position where generation stops: prompt plus `max_tokens`, capped by the context.
fn generation_limit(prompt_tokens: i32, max_tokens: u32, context_size: u32) -> i32 {
    let max_tokens = i32::try_from(max_tokens).unwrap_or(i32::MAX);
    let context_size = i32::try_from(context_size).unwrap_or(i32::MAX);
    prompt_tokens.saturating_add(max_tokens).min(context_size)
}

/// Decode token bytes. Partial UTF-8 sequences stay buffered in the decoder
/// until the rest arrives, or until `last` flushes them as U+FFFD.
fn decode_piece(decoder: &mut encoding_rs::Decoder, bytes: &[u8], last: bool) -> String {
    let capacity = decoder.max_utf8_buffer_length(bytes.len()).unwrap_or(32);
    let mut piece = String::with_capacity(capacity);
    let _ = decoder.decode_to_string(bytes, &mut piece, last);
    piece
}

fn build_sampler(options: &SamplingOptions) -> LlamaSampler {
    let penalties = LlamaSampler::penalties(PENALTY_LAST_N, options.repeat_penalty, 0.0, 0.0);

    if options.temperature <= 0.0 {
        return LlamaSampler::chain_simple([penalties, LlamaSampler::greedy()]);
    }

    let mut chain = vec![penalties];
    if options.top_k > 0 {
        chain.push(LlamaSampler::top_k(options.top_k));
    }
    chain.push(LlamaSampler::top_p(options.top_p, 1));
    chain.push(LlamaSampler::temp(options.temperature));
    chain.push(LlamaSampler::dist(options.seed));
    LlamaSampler::chain_simple(chain)
}

fn plain_transcript(messages: &[ChatMessage]) -> String {
    let mut prompt = String::new();
    for m in messages {
        prompt.push_str(&m.role);
        prompt.push_str(": ");
        prompt.push_str(&m.content);
        prompt.push('\n');
    }
    prompt.push_str("assistant: ");
    prompt
}

fn completion_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("chatcmpl-{nanos:x}")
}

/// Token-by-token generation over a prefilled context.
///
/// Yields an opening role fragment, one content fragment per sampled token
/// and a closing fragment with the finish reason.
struct LlamaStream<'a> {
    model: &'a LlamaModel,
    ctx: LlamaContext<'a>,
    sampler: LlamaSampler,
    decoder: encoding_rs::Decoder,
    id: String,
    logits_index: i32,
    n_cur: i32,
    n_len: i32,
    prompt_tokens: u32,
    generated: u32,
    role_sent: bool,
    finish_reason: Option<&'static str>,
    /// No more tokens will be sampled.
    done: bool,
    /// The finish fragment has been yielded.
    closed: bool,
}

impl LlamaStream<'_> {
    fn step(&mut self) -> Result<Option<String>, EngineError> {
        if self.done {
            return Ok(None);
        }
        if self.n_cur >= self.n_len {
            return Ok(self.stop());
        }

        let token = self.sampler.sample(&self.ctx, self.logits_index);
        self.sampler.accept(token);

        if self.model.is_eog_token(token) {
            self.finish_reason = Some("stop");
            return Ok(self.stop());
        }

        let bytes = self
            .model
            .token_to_bytes(token, Special::Tokenize)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        let piece = decode_piece(&mut self.decoder, &bytes, false);

        let mut batch = LlamaBatch::new(1, 1);
        batch
            .add(token, self.n_cur, &[0], true)
            .map_err(|e| EngineError::Decode(e.to_string()))?;
        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Decode(e.to_string()))?;

        self.n_cur += 1;
        self.logits_index = batch.n_tokens() - 1;
        self.generated += 1;
        Ok(Some(piece))
    }

    /// Ends generation, returning whatever the decoder still buffers.
    fn stop(&mut self) -> Option<String> {
        self.done = true;
        let rest = decode_piece(&mut self.decoder, &[], true);
        (!rest.is_empty()).then_some(rest)
    }

    fn collect_completion(mut self) -> Result<ChatCompletion, EngineError> {
        let t0 = Instant::now();
        let mut output = String::new();
        while let Some(piece) = self.step()? {
            output.push_str(&piece);
        }
        debug!(
            "generated {} tokens in {} ms",
            self.generated,
            t0.elapsed().as_millis()
        );

        Ok(ChatCompletion {
            id: self.id.clone(),
            model: String::new(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: Some(output),
                },
                finish_reason: Some(self.finish_reason.unwrap_or("length").to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens: self.prompt_tokens,
                completion_tokens: self.generated,
                total_tokens: self.prompt_tokens + self.generated,
            }),
        })
    }
}

impl Iterator for LlamaStream<'_> {
    type Item = Result<EngineChunk, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if !self.role_sent {
            self.role_sent = true;
            return Some(Ok(EngineChunk::role(&self.id, "assistant")));
        }
        if self.closed {
            return None;
        }

        match self.step() {
            Ok(Some(piece)) => Some(Ok(EngineChunk::content(&self.id, piece))),
            Ok(None) => {
                self.closed = true;
                let reason = self.finish_reason.unwrap_or("length");
                Some(Ok(EngineChunk::finish(&self.id, reason)))
            }
            Err(e) => {
                self.closed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_gguf_magic_rejects_other_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PK\x03\x04not a model").unwrap();
        let err = check_gguf_magic(file.path()).unwrap_err();
        assert!(matches!(err, EngineError::Format(_)));
        assert!(err.is_load_failure());
    }

    #[test]
    fn test_gguf_magic_rejects_short_files() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GG").unwrap();
        assert!(matches!(
            check_gguf_magic(file.path()),
            Err(EngineError::Format(_))
        ));
    }

    #[test]
    fn test_gguf_magic_accepts_header() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"GGUF\x03\x00\x00\x00").unwrap();
        assert!(check_gguf_magic(file.path()).is_ok());
    }

    #[test]
    fn test_generation_limit_saturates() {
        assert_eq!(generation_limit(3, 2048, 512), 512);
        assert_eq!(generation_limit(3, 100, 512), 103);
        assert_eq!(generation_limit(3, i32::MAX as u32, 512), 512);
        assert_eq!(generation_limit(3, u32::MAX, u32::MAX), i32::MAX);
    }

    #[test]
    fn test_decode_piece_buffers_partial_utf8() {
        let euro = "€".as_bytes();
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        assert_eq!(decode_piece(&mut decoder, &euro[..2], false), "");
        assert_eq!(decode_piece(&mut decoder, &euro[2..], false), "€");
        assert_eq!(decode_piece(&mut decoder, &[], true), "");
    }

    #[test]
    fn test_decode_piece_flushes_truncated_sequence() {
        let mut decoder = encoding_rs::UTF_8.new_decoder();
        assert_eq!(decode_piece(&mut decoder, &"é€".as_bytes()[..3], false), "é");
        assert_eq!(decode_piece(&mut decoder, &[], true), "\u{FFFD}");
    }

    #[test]
    fn test_plain_transcript() {
        let prompt = plain_transcript(&[ChatMessage::user("Say hi")]);
        assert_eq!(prompt, "user: Say hi\nassistant: ");
    }
}
