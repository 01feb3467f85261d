use inference_engine::metrics::ProcessMemory;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::models::chat::StreamEvent;

/// Time source for the collector.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Resident memory of the serving process, in MB.
pub trait MemoryProbe: Send + Sync {
    fn rss_mb(&self) -> f64;
}

impl MemoryProbe for ProcessMemory {
    fn rss_mb(&self) -> f64 {
        ProcessMemory::rss_mb(self)
    }
}

/// `count / elapsed`, or 0 when no time has passed.
pub fn per_second(count: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        count as f64 / secs
    } else {
        0.0
    }
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Per-request telemetry for a streamed completion.
///
/// Create it before the model is checked out so the memory baseline
/// excludes the load, then call [`handle_ready`](Self::handle_ready),
/// [`fragments_ready`](Self::fragments_ready) and [`prefill`](Self::prefill)
/// in that order before feeding tokens.
pub struct MetricsCollector {
    clock: Arc<dyn Clock>,
    memory: Arc<dyn MemoryProbe>,
    baseline_rss_mb: f64,
    prefill_start: Instant,
    prefill_end: Instant,
    generation_start: Instant,
    num_input_tokens: usize,
    input_tokens_per_second: f64,
    num_generated_tokens: usize,
    time_to_first_token: Option<f64>,
    max_memory_delta_mb: f64,
}

impl MetricsCollector {
    pub fn new(clock: Arc<dyn Clock>, memory: Arc<dyn MemoryProbe>) -> Self {
        let now = clock.now();
        let baseline_rss_mb = memory.rss_mb();
        Self {
            clock,
            memory,
            baseline_rss_mb,
            prefill_start: now,
            prefill_end: now,
            generation_start: now,
            num_input_tokens: 0,
            input_tokens_per_second: 0.0,
            num_generated_tokens: 0,
            time_to_first_token: None,
            max_memory_delta_mb: 0.0,
        }
    }

    pub fn baseline_rss_mb(&self) -> f64 {
        self.baseline_rss_mb
    }

    /// The model handle is usable.
    pub fn handle_ready(&mut self) {
        self.prefill_start = self.clock.now();
        self.prefill_end = self.prefill_start;
    }

    /// The engine handed back its fragment iterator.
    pub fn fragments_ready(&mut self) {
        self.prefill_end = self.clock.now();
    }

    /// Closes the prefill phase and starts the generation clock.
    pub fn prefill(&mut self, num_input_tokens: usize) -> StreamEvent {
        let t_prefill = self.prefill_end.saturating_duration_since(self.prefill_start);
        self.num_input_tokens = num_input_tokens;
        self.input_tokens_per_second = per_second(num_input_tokens, t_prefill);
        self.generation_start = self.clock.now();

        StreamEvent::PrefillSummary {
            num_input_tokens,
            input_tokens_per_second: round3(self.input_tokens_per_second),
        }
    }

    /// Records one accepted content fragment.
    pub fn token(&mut self, content: String) -> StreamEvent {
        let since_start = self
            .clock
            .now()
            .saturating_duration_since(self.generation_start);
        let ttft = *self
            .time_to_first_token
            .get_or_insert(since_start.as_secs_f64());

        self.num_generated_tokens += 1;

        let memory_delta_mb = self.memory.rss_mb() - self.baseline_rss_mb;
        self.max_memory_delta_mb = self.max_memory_delta_mb.max(memory_delta_mb);

        StreamEvent::TokenDelta {
            content,
            num_generated_tokens: self.num_generated_tokens,
            tokens_per_second: round3(per_second(self.num_generated_tokens, since_start)),
            memory_delta_mb: round3(memory_delta_mb),
            time_to_first_token_seconds: round3(ttft),
        }
    }

    pub fn finish(&self) -> StreamEvent {
        let total = self
            .clock
            .now()
            .saturating_duration_since(self.prefill_start);

        StreamEvent::FinalSummary {
            total_time_seconds: round3(total.as_secs_f64()),
            max_memory_delta_mb: round3(self.max_memory_delta_mb),
            num_generated_tokens: self.num_generated_tokens,
            num_input_tokens: self.num_input_tokens,
            input_tokens_per_second: round3(self.input_tokens_per_second),
            time_to_first_token_seconds: self.time_to_first_token.map(round3),
        }
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Clock that only moves when told to.
    pub struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            })
        }

        pub fn advance(&self, by: Duration) {
            *self.offset.lock() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock()
        }
    }

    /// Returns queued readings, repeating the last one once drained.
    pub struct ScriptedMemory {
        readings: Mutex<VecDeque<f64>>,
        last: Mutex<f64>,
        taken: Mutex<usize>,
    }

    impl ScriptedMemory {
        pub fn new(readings: &[f64]) -> Arc<Self> {
            Arc::new(Self {
                readings: Mutex::new(readings.iter().copied().collect()),
                last: Mutex::new(readings.first().copied().unwrap_or(0.0)),
                taken: Mutex::new(0),
            })
        }

        pub fn samples_taken(&self) -> usize {
            *self.taken.lock()
        }
    }

    impl MemoryProbe for ScriptedMemory {
        fn rss_mb(&self) -> f64 {
            *self.taken.lock() += 1;
            let mut last = self.last.lock();
            if let Some(next) = self.readings.lock().pop_front() {
                *last = next;
            }
            *last
        }
    }
}
