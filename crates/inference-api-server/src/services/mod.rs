pub mod assembler;
pub mod chat_service;
pub mod hub;
pub mod metrics;
pub mod model_cache;
pub mod model_resolver;
pub mod stream_emitter;

pub use chat_service::{ChatOutcome, ChatService, EventStream};
pub use hub::{HubFetcher, ModelFetcher};
pub use metrics::{Clock, MemoryProbe, MetricsCollector, SystemClock};
pub use model_cache::{ModelCache, ModelKey, ModelLease};
pub use model_resolver::ModelResolver;
pub use stream_emitter::{EmitterState, RawFragment, StreamEmitter};
