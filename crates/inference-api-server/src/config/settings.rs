use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Settings {
    pub server: ServerConfig,
    pub models: ModelsConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Returned by `GET /api/info`.
    pub info: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["http://localhost:3000".to_string()],
            info: "LLM Inference Server API".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ModelsConfig {
    /// Where hosted model files are downloaded to.
    pub cache_dir: PathBuf,
    pub hub_base_url: String,
    pub revision: String,
    pub hub_token: Option<String>,
    pub download_timeout_seconds: u64,
    pub use_mlock: bool,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("models"),
            hub_base_url: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            hub_token: None,
            download_timeout_seconds: 3600, // large models
            use_mlock: false,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    /// Loaded models kept between requests. 0 loads and frees per request.
    pub max_models: usize,
    /// Upper bound on the summed weight size of cached models. 0 = no bound.
    pub max_memory_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_models: 1,
            max_memory_mb: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_concurrent_generations: usize,
    pub acquire_timeout_ms: u64,
    /// Events buffered between the generation worker and the HTTP body.
    pub stream_buffer: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_generations: 2,
            acquire_timeout_ms: 30_000,
            stream_buffer: 1,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,inference_api_server=debug".to_string(),
            json: true,
        }
    }
}

impl Settings {
    pub const DEFAULT_PATH: &'static str = "config/settings";

    pub fn load() -> Result<Self> {
        Self::load_from(Self::DEFAULT_PATH)
    }

    /// File (optional) layered under `APP__SECTION__KEY` environment variables.
    pub fn load_from(path: &str) -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load_from("does/not/exist/settings").unwrap();
        assert_eq!(settings.server.port, 8000);
        assert_eq!(settings.cache.max_models, 1);
        assert_eq!(settings.models.revision, "main");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[server]\nport = 9100\ninfo = \"test\"\n\n[cache]\nmax_models = 0\n\n[limits]\nstream_buffer = 4"
        )
        .unwrap();

        let settings = Settings::load_from(file.path().to_str().unwrap()).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.info, "test");
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.cache.max_models, 0);
        assert_eq!(settings.limits.stream_buffer, 4);
        assert_eq!(settings.limits.max_concurrent_generations, 2);
    }
}
