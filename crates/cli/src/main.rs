use anyhow::{bail, Result};
use clap::Parser;
use futures::StreamExt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use inference_api_server::config::Settings;
use inference_api_server::models::chat::{
    ChatRequest, CompletionResponse, ModelParams, ModelRequest,
};
use inference_api_server::services::{ChatOutcome, HubFetcher};
use inference_api_server::AppState;
use inference_engine::{metrics, LlamaCppLoader};

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser, Debug)]
#[command(
    name = "inference-cli",
    version,
    about = "Run one prompt through the inference pipeline and print its output"
)]
struct Args {
    /// Path to a local GGUF model file
    #[arg(long, conflicts_with_all = ["repo_id", "filename"])]
    model: Option<PathBuf>,

    /// Hub repository, e.g. Qwen/Qwen2.5-1.5B-Instruct-GGUF
    #[arg(long, requires = "filename")]
    repo_id: Option<String>,

    /// File inside the hub repository
    #[arg(long, requires = "repo_id")]
    filename: Option<String>,

    /// Prompt text
    #[arg(long, default_value = "Say hi")]
    prompt: String,

    /// Print one JSON event per line instead of the final response
    #[arg(long)]
    stream: bool,

    /// Settings file for hub and cache options, without extension
    #[arg(long, default_value = Settings::DEFAULT_PATH)]
    config: String,

    /// Layers to offload to the GPU (-1 = all)
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    gpu_layers: i32,

    /// Context length (max tokens in context)
    #[arg(long, default_value_t = 512)]
    context_size: i32,

    /// Prefill batch size
    #[arg(long, default_value_t = 512)]
    batch_size: i32,

    /// Temperature, 0.0 = greedy
    #[arg(long, default_value_t = 0.7)]
    temperature: f32,

    #[arg(long, default_value_t = 0.9)]
    top_p: f32,

    /// 0 disables top-k
    #[arg(long, default_value_t = 40)]
    top_k: i32,

    /// Repeat penalty (1.0 = off)
    #[arg(long, default_value_t = 1.1)]
    repeat_penalty: f32,

    /// Maximum tokens to generate
    #[arg(long, default_value_t = 2048)]
    max_tokens: i32,

    /// Lock model in RAM (prevent swap)
    #[arg(long)]
    mlock: bool,
}

impl Args {
    fn to_request(&self) -> Result<ChatRequest> {
        let model_request = ModelRequest {
            model_params: ModelParams {
                gpu_layers: self.gpu_layers,
                context_size: self.context_size,
                batch_size: self.batch_size,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                repeat_penalty: self.repeat_penalty,
                max_tokens: self.max_tokens,
            },
            prompt: self.prompt.clone(),
            local: self.model.is_some(),
            model_path: self
                .model
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
            repo_id: self.repo_id.clone().unwrap_or_default(),
            filename: self.filename.clone().unwrap_or_default(),
            stream: self.stream,
        };
        Ok(ChatRequest::try_from(model_request)?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries the response.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .compact()
        .init();

    if args.model.is_none() && args.repo_id.is_none() {
        bail!("either --model or --repo-id/--filename is required");
    }
    let request = args.to_request()?;

    let mut settings = Settings::load_from(&args.config)?;
    // One request, nothing to keep around.
    settings.cache.max_models = 0;
    settings.limits.max_concurrent_generations = 1;

    let before = metrics::RuntimeMetrics::capture();

    let loader = LlamaCppLoader::new()?.with_mlock(args.mlock || settings.models.use_mlock);
    let fetcher = HubFetcher::new(&settings.models)?;
    let state = AppState::new(settings, Arc::new(loader), Arc::new(fetcher));

    info!("Generate: source={}, stream={}", request.source, request.stream);

    let mut stdout = std::io::stdout().lock();
    match state.chat_service.complete(request).await? {
        ChatOutcome::Completion(response) => {
            let body = serde_json::to_string_pretty(&CompletionResponse { response })?;
            writeln!(stdout, "{}", body)?;
        }
        ChatOutcome::Stream(mut events) => {
            while let Some(item) = events.next().await {
                write!(stdout, "{}", item?.to_line())?;
                stdout.flush()?;
            }
        }
    }

    let after = metrics::RuntimeMetrics::capture();
    eprintln!(
        "[memory] rss: {:.1} -> {:.1} MB (of {:.0} MB)",
        before.process_rss_mb, after.process_rss_mb, after.total_mem_mb
    );

    Ok(())
}
