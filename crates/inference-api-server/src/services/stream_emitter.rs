use inference_engine::{EngineChunk, FragmentIter};
use std::iter::FusedIterator;
use tracing::{debug, warn};

use crate::models::chat::StreamEvent;
use crate::services::metrics::MetricsCollector;
use crate::utils::error::ApiError;

/// Content of one engine fragment. The only place that looks inside
/// [`EngineChunk`]; anything missing along `choices[0].delta.content`
/// comes out as `None`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RawFragment {
    pub content: Option<String>,
}

impl From<EngineChunk> for RawFragment {
    fn from(chunk: EngineChunk) -> Self {
        let content = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content);
        Self { content }
    }
}

impl RawFragment {
    /// Non-empty content, if any.
    pub fn accepted(self) -> Option<String> {
        self.content.filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterState {
    Idle,
    PrefillEmitted,
    Generating,
    Completed,
}

/// Turns engine fragments into the ordered event sequence
/// `PrefillSummary, TokenDelta*, FinalSummary`.
///
/// An engine failure mid-generation ends the sequence with a single `Err`
/// in place of the final summary. The fragment source is dropped as soon as
/// the emitter completes.
pub struct StreamEmitter<'a> {
    state: EmitterState,
    metrics: MetricsCollector,
    fragments: Option<FragmentIter<'a>>,
    num_input_tokens: usize,
}

impl<'a> StreamEmitter<'a> {
    pub fn new(metrics: MetricsCollector, fragments: FragmentIter<'a>, num_input_tokens: usize) -> Self {
        Self {
            state: EmitterState::Idle,
            metrics,
            fragments: Some(fragments),
            num_input_tokens,
        }
    }

    pub fn state(&self) -> EmitterState {
        self.state
    }

    fn complete(&mut self) {
        self.state = EmitterState::Completed;
        self.fragments = None;
    }

    fn next_fragment(&mut self) -> Option<Result<EngineChunk, inference_engine::EngineError>> {
        self.fragments.as_mut().and_then(|fragments| fragments.next())
    }
}

impl Iterator for StreamEmitter<'_> {
    type Item = Result<StreamEvent, ApiError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.state {
            EmitterState::Idle => {
                self.state = EmitterState::PrefillEmitted;
                Some(Ok(self.metrics.prefill(self.num_input_tokens)))
            }
            EmitterState::PrefillEmitted | EmitterState::Generating => loop {
                match self.next_fragment() {
                    Some(Ok(chunk)) => {
                        if let Some(content) = RawFragment::from(chunk).accepted() {
                            self.state = EmitterState::Generating;
                            return Some(Ok(self.metrics.token(content)));
                        }
                    }
                    Some(Err(e)) => {
                        warn!("Engine failed mid-stream: {}", e);
                        self.complete();
                        return Some(Err(e.into()));
                    }
                    None => {
                        self.complete();
                        let summary = self.metrics.finish();
                        debug!("Stream completed: {:?}", summary);
                        return Some(Ok(summary));
                    }
                }
            },
            EmitterState::Completed => None,
        }
    }
}

impl FusedIterator for StreamEmitter<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metrics::fakes::{ManualClock, ScriptedMemory};
    use crate::services::metrics::SystemClock;
    use inference_engine::EngineError;
    use std::sync::Arc;

    fn emitter(chunks: Vec<Result<EngineChunk, EngineError>>) -> StreamEmitter<'static> {
        let metrics = MetricsCollector::new(Arc::new(SystemClock), ScriptedMemory::new(&[10.0]));
        StreamEmitter::new(metrics, Box::new(chunks.into_iter()), 3)
    }

    fn values(events: Vec<Result<StreamEvent, ApiError>>) -> Vec<serde_json::Value> {
        events
            .into_iter()
            .map(|e| serde_json::to_value(e.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_raw_fragment_shapes() {
        assert_eq!(RawFragment::from(EngineChunk::content("c", "Hi")).accepted(), Some("Hi".into()));
        assert_eq!(RawFragment::from(EngineChunk::role("c", "assistant")).accepted(), None);
        assert_eq!(RawFragment::from(EngineChunk::default()).accepted(), None);
        assert_eq!(RawFragment::from(EngineChunk::content("c", "")).accepted(), None);
    }

    #[test]
    fn test_event_order() {
        let mut emitter = emitter(vec![
            Ok(EngineChunk::role("c", "assistant")),
            Ok(EngineChunk::content("c", "Hello")),
            Ok(EngineChunk::content("c", " there")),
            Ok(EngineChunk::finish("c", "stop")),
        ]);
        assert_eq!(emitter.state(), EmitterState::Idle);

        let events = values(emitter.by_ref().collect());
        assert_eq!(events.len(), 4);
        assert_eq!(events[0]["num_input_tokens"], 3);
        assert!(events[0].get("content").is_none());
        assert_eq!(events[1]["content"], "Hello");
        assert_eq!(events[2]["content"], " there");
        assert!(events[3].get("total_time_seconds").is_some());
        assert_eq!(events[3]["num_generated_tokens"], 2);

        assert_eq!(emitter.state(), EmitterState::Completed);
        assert!(emitter.next().is_none());
        assert!(emitter.next().is_none());
    }

    #[test]
    fn test_counts_are_monotonic() {
        let chunks = (0..6).map(|i| Ok(EngineChunk::content("c", format!("w{i} ")))).collect();
        let events = values(emitter(chunks).collect());
        let counts: Vec<u64> = events[1..events.len() - 1]
            .iter()
            .map(|e| e["num_generated_tokens"].as_u64().unwrap())
            .collect();
        assert_eq!(counts, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_malformed_and_empty_fragments_are_skipped() {
        let events = values(
            emitter(vec![
                Ok(EngineChunk::default()),
                Ok(EngineChunk::content("c", "")),
                Ok(EngineChunk::content("c", "ok")),
                Ok(EngineChunk::default()),
            ])
            .collect(),
        );
        assert_eq!(events.len(), 3);
        assert_eq!(events[1]["content"], "ok");
        assert_eq!(events[1]["num_generated_tokens"], 1);
        assert_eq!(events[2]["num_generated_tokens"], 1);
    }

    #[test]
    fn test_empty_generation() {
        let events = values(emitter(vec![Ok(EngineChunk::finish("c", "stop"))]).collect());
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["num_generated_tokens"], 0);
        assert!(events[1]["time_to_first_token_seconds"].is_null());
    }

    #[test]
    fn test_engine_error_ends_stream() {
        let mut emitter = emitter(vec![
            Ok(EngineChunk::content("c", "Hi")),
            Err(EngineError::Decode("llama_decode returned -1".into())),
            Ok(EngineChunk::content("c", "never")),
        ]);

        assert!(emitter.next().unwrap().is_ok());
        assert!(emitter.next().unwrap().is_ok());
        let err = emitter.next().unwrap().unwrap_err();
        assert!(matches!(err, ApiError::Engine(_)));
        assert_eq!(emitter.state(), EmitterState::Completed);
        assert!(emitter.next().is_none());
    }

    #[test]
    fn test_memory_peak_bounds_every_delta() {
        let memory = ScriptedMemory::new(&[50.0, 70.0, 95.0, 60.0, 90.0]);
        let metrics = MetricsCollector::new(ManualClock::new(), memory);
        let chunks: Vec<_> = ["a", "b", "c", "d"]
            .iter()
            .map(|s| Ok(EngineChunk::content("c", *s)))
            .collect();
        let events = values(StreamEmitter::new(metrics, Box::new(chunks.into_iter()), 1).collect());

        let peak = events.last().unwrap()["max_memory_delta_mb"].as_f64().unwrap();
        assert_eq!(peak, 45.0);
        for event in &events[1..events.len() - 1] {
            assert!(event["memory_delta_mb"].as_f64().unwrap() <= peak);
        }
    }
}
