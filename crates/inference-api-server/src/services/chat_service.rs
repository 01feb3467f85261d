use futures::stream::Stream;
use inference_engine::{ChatMessage, CompletionOutput};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, error, info};

use crate::models::chat::{ChatCompletionResult, ChatRequest, StreamEvent};
use crate::services::assembler::assemble;
use crate::services::metrics::{Clock, MemoryProbe, MetricsCollector, SystemClock};
use crate::services::model_cache::{ModelCache, ModelLease};
use crate::services::stream_emitter::StreamEmitter;
use crate::utils::error::ApiError;
use crate::utils::limiters::Limiters;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ApiError>> + Send>>;

pub enum ChatOutcome {
    Completion(ChatCompletionResult),
    /// Lazy, single pass. Dropping it cancels generation.
    Stream(EventStream),
}

/// Runs chat requests against cached models.
#[derive(Clone)]
pub struct ChatService {
    cache: Arc<ModelCache>,
    limiters: Limiters,
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    stream_buffer: usize,
}

impl ChatService {
    pub fn new(
        cache: Arc<ModelCache>,
        limiters: Limiters,
        memory: Arc<dyn MemoryProbe>,
        stream_buffer: usize,
    ) -> Self {
        Self {
            cache,
            limiters,
            clock: Arc::new(SystemClock),
            memory,
            stream_buffer: stream_buffer.max(1),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn complete(&self, request: ChatRequest) -> Result<ChatOutcome, ApiError> {
        let (permit, waited) = self.limiters.acquire_generation().await?;
        debug!("Generation slot acquired after {:?}", waited);

        // Streaming baseline memory is taken before the model is checked out.
        let metrics = request
            .stream
            .then(|| MetricsCollector::new(self.clock.clone(), self.memory.clone()));
        let lease = self
            .cache
            .checkout(&request.source, request.params.load_params())
            .await?;

        info!(
            "Chat request: source={}, stream={}, prompt_len={}",
            request.source,
            request.stream,
            request.prompt.len()
        );

        match metrics {
            Some(metrics) => self
                .stream(lease, metrics, request, permit)
                .await
                .map(ChatOutcome::Stream),
            None => self
                .batch(lease, request, permit)
                .await
                .map(ChatOutcome::Completion),
        }
    }

    async fn batch(
        &self,
        lease: ModelLease,
        request: ChatRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<ChatCompletionResult, ApiError> {
        let sampling = request.params.sampling();
        let messages = [ChatMessage::user(request.prompt)];
        let clock = self.clock.clone();

        let (completion, elapsed) = tokio::task::spawn_blocking(move || -> Result<_, ApiError> {
            let _permit = permit;
            let started = clock.now();
            let output = lease
                .model()
                .create_chat_completion(&messages, &sampling, false)?;
            match output {
                CompletionOutput::Aggregate(completion) => {
                    Ok((completion, clock.now().saturating_duration_since(started)))
                }
                other => Err(ApiError::EngineProtocol(format!(
                    "expected an aggregate completion, engine returned {}",
                    other.kind()
                ))),
            }
        })
        .await
        .map_err(|e| ApiError::Internal(format!("Generation task failed: {}", e)))??;

        let result = assemble(completion, elapsed);
        debug!(
            "Completion finished in {}s ({:?} tokens)",
            result.time_taken_seconds, result.total_tokens
        );
        Ok(result)
    }

    async fn stream(
        &self,
        lease: ModelLease,
        mut metrics: MetricsCollector,
        request: ChatRequest,
        permit: OwnedSemaphorePermit,
    ) -> Result<EventStream, ApiError> {
        let (tx, mut rx) = mpsc::channel::<Result<StreamEvent, ApiError>>(self.stream_buffer);
        let sampling = request.params.sampling();
        let prompt = request.prompt;
        let panic_tx = tx.clone();

        let worker = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let model = lease.model();
            let messages = [ChatMessage::user(prompt.clone())];

            metrics.handle_ready();
            let fragments = match model.create_chat_completion(&messages, &sampling, true) {
                Ok(CompletionOutput::Fragments(fragments)) => fragments,
                Ok(other) => {
                    let _ = tx.blocking_send(Err(ApiError::EngineProtocol(format!(
                        "expected fragments for a streaming request, engine returned {}",
                        other.kind()
                    ))));
                    return;
                }
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.into()));
                    return;
                }
            };
            metrics.fragments_ready();

            let num_input_tokens = match model.token_count(&prompt) {
                Ok(n) => n,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e.into()));
                    return;
                }
            };

            for event in StreamEmitter::new(metrics, fragments, num_input_tokens) {
                if tx.blocking_send(event).is_err() {
                    debug!("Stream consumer went away, stopping generation");
                    break;
                }
            }
        });

        tokio::spawn(async move {
            if let Err(e) = worker.await {
                error!("Generation worker failed: {}", e);
                let _ = panic_tx
                    .send(Err(ApiError::Internal(format!("Generation task failed: {}", e))))
                    .await;
            }
        });

        // Failures before the prefill summary surface as plain errors.
        match rx.recv().await {
            Some(Ok(first)) => {
                let stream = async_stream::stream! {
                    yield Ok(first);
                    while let Some(event) = rx.recv().await {
                        yield event;
                    }
                };
                Ok(Box::pin(stream))
            }
            Some(Err(e)) => Err(e),
            None => Err(ApiError::Internal(
                "generation worker exited before producing output".to_string(),
            )),
        }
    }
}
