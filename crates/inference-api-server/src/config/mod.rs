pub mod settings;

pub use settings::{
    CacheConfig, LimitsConfig, LoggingConfig, ModelsConfig, ServerConfig, Settings,
};
