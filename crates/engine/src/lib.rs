//! Inference Engine - chat completion boundary over llama.cpp
//!
//! The server only talks to [`ModelLoader`] and [`ChatModel`]. The llama.cpp
//! binding implements them for GGUF files; [`scripted`] implements them for
//! tests.

mod error;
mod llama_engine;
pub mod scripted;
mod types;

pub use error::EngineError;
pub use llama_engine::{LlamaCppLoader, LlamaCppModel};
pub use types::{
    AssistantMessage, ChatCompletion, ChatMessage, ChatModel, ChunkChoice, ChunkDelta,
    CompletionChoice, CompletionOutput, EngineChunk, FragmentIter, LoadParams, ModelLoader,
    SamplingOptions, Usage,
};

// Metrics module for observability
pub mod metrics {
    use parking_lot::Mutex;
    use sysinfo::{Pid, ProcessesToUpdate, System};

    const MB: f64 = 1024.0 * 1024.0;

    /// Samples the resident set size of the current process.
    ///
    /// Only the current process is refreshed on each sample, which keeps a
    /// per-token call cheap.
    pub struct ProcessMemory {
        system: Mutex<System>,
        pid: Option<Pid>,
    }

    impl ProcessMemory {
        pub fn new() -> Self {
            Self {
                system: Mutex::new(System::new()),
                pid: sysinfo::get_current_pid().ok(),
            }
        }

        /// Current RSS in MB, or 0.0 when the process cannot be inspected.
        pub fn rss_mb(&self) -> f64 {
            let Some(pid) = self.pid else {
                return 0.0;
            };
            let mut sys = self.system.lock();
            sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
            sys.process(pid)
                .map(|p| p.memory() as f64 / MB)
                .unwrap_or(0.0)
        }
    }

    impl Default for ProcessMemory {
        fn default() -> Self {
            Self::new()
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct RuntimeMetrics {
        pub process_rss_mb: f64,
        pub total_mem_mb: f64,
    }

    impl RuntimeMetrics {
        pub fn capture() -> Self {
            let mut sys = System::new();
            sys.refresh_memory();
            Self {
                process_rss_mb: ProcessMemory::new().rss_mb(),
                total_mem_mb: sys.total_memory() as f64 / MB,
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_rss_is_positive() {
            let memory = ProcessMemory::new();
            assert!(memory.rss_mb() > 0.0);
        }

        #[test]
        fn test_capture() {
            let metrics = RuntimeMetrics::capture();
            assert!(metrics.total_mem_mb >= metrics.process_rss_mb);
        }
    }
}
