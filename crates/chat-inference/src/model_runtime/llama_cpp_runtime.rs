//! llama.cpp adapter
//!
//! Quantized binary models (GGUF, GGML). Each model gets its own
//! llama-server process; tokens come back over `POST /completion` SSE.

use super::backend::{
    boxed_stream, wait_for_health, BackendLaunch, BackendRequest, BackendSession, InferenceBackend, ManagedServer,
    TokenStream,
};
use super::engine_adapter::AdapterCore;
use super::format_detector::ModelFormat;
use super::gguf_metadata;
use super::runtime_trait::*;
use super::sse;
use crate::chat_templates::{EngineKind, Template, TemplateRegistry};
use crate::config::Config;
use crate::error::InferenceError;
use crate::utils::TextUtils;
use anyhow::Context;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct LlamaServerBackend {
    bin: String,
    host: String,
    base_port: u16,
    next_port: AtomicU16,
    attach_url: Option<String>,
    client: reqwest::Client,
    health_timeout: Duration,
}

impl LlamaServerBackend {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bin: cfg.llama_bin.clone(),
            host: cfg.llama_host.clone(),
            base_port: cfg.llama_base_port,
            next_port: AtomicU16::new(0),
            attach_url: cfg.llama_server_url.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.request_timeout_seconds))
                .build()
                .unwrap_or_default(),
            health_timeout: Duration::from_secs(cfg.health_timeout_seconds),
        }
    }

    /// Backend bound to an already running llama-server.
    pub fn attached(url: impl Into<String>, health_timeout: Duration) -> Self {
        let cfg = Config {
            llama_server_url: Some(url.into()),
            health_timeout_seconds: health_timeout.as_secs().max(1),
            ..Config::default()
        };
        Self::from_config(&cfg)
    }

    fn spawn(&self, launch: &BackendLaunch) -> anyhow::Result<(String, ManagedServer)> {
        let port = self
            .base_port
            .wrapping_add(self.next_port.fetch_add(1, Ordering::Relaxed));

        info!("Starting llama-server for model: {}", launch.model_path.display());
        info!("  Binary: {}", self.bin);
        info!("  Port: {}", port);
        info!("  Context Size: {}", launch.context_size);
        info!("  GPU Layers: {}", launch.gpu_layers);

        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("--model").arg(&launch.model_path)
            .arg("--host").arg(&self.host)
            .arg("--port").arg(port.to_string())
            .arg("--ctx-size").arg(launch.context_size.to_string())
            .arg("--batch-size").arg(launch.batch_size.to_string())
            .arg("--threads").arg(launch.threads.to_string())
            .arg("--n-gpu-layers").arg(launch.gpu_layers.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn llama-server ({})", self.bin))?;

        Ok((format!("http://{}:{}", self.host, port), ManagedServer::new("llama-server", child)))
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerBackend {
    fn name(&self) -> &'static str {
        "llama-server"
    }

    async fn probe(&self) -> anyhow::Result<()> {
        if self.attach_url.is_some() {
            return Ok(());
        }
        which::which(&self.bin)
            .map(|path| debug!("llama-server found at {}", path.display()))
            .map_err(|e| anyhow::anyhow!("{} not found on PATH: {}", self.bin, e))
    }

    async fn launch(&self, launch: &BackendLaunch) -> anyhow::Result<Box<dyn BackendSession>> {
        let (base_url, mut process) = match &self.attach_url {
            Some(url) => (url.trim_end_matches('/').to_string(), None),
            None => {
                let (url, server) = self.spawn(launch)?;
                (url, Some(server))
            }
        };

        wait_for_health(&self.client, &base_url, process.as_mut(), self.health_timeout).await?;

        Ok(Box::new(LlamaServerSession {
            client: self.client.clone(),
            base_url,
            process,
        }))
    }
}

struct LlamaServerSession {
    client: reqwest::Client,
    base_url: String,
    process: Option<ManagedServer>,
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    content: String,
    #[serde(default)]
    stop: bool,
}

#[async_trait]
impl BackendSession for LlamaServerSession {
    async fn stream(&self, request: BackendRequest) -> anyhow::Result<TokenStream> {
        let url = format!("{}/completion", self.base_url);

        let payload = serde_json::json!({
            "prompt": request.prompt,
            "n_predict": request.max_tokens,
            "temperature": request.temperature,
            "top_p": request.top_p,
            "top_k": request.top_k,
            "repeat_penalty": request.repeat_penalty,
            "presence_penalty": request.presence_penalty,
            "frequency_penalty": request.frequency_penalty,
            "mirostat": request.mirostat,
            "mirostat_tau": request.mirostat_tau,
            "mirostat_eta": request.mirostat_eta,
            "stop": request.stop,
            "cache_prompt": true,
            "stream": true,
        });

        let resp = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Stream request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("Stream failed ({}): {}", status, body));
        }

        let mut events = sse::data_lines(resp);
        let tokens = async_stream::try_stream! {
            while let Some(data) = events.next().await {
                let data = data?;
                let chunk: CompletionChunk = serde_json::from_str(&data)
                    .with_context(|| format!("bad completion chunk: {}", data))?;
                if !chunk.content.is_empty() {
                    yield chunk.content;
                }
                if chunk.stop {
                    break;
                }
            }
        };

        Ok(boxed_stream(tokens))
    }

    async fn shutdown(&mut self) {
        info!("Shutting down llama-server session at {}", self.base_url);
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
    }
}

pub struct LlamaCppAdapter {
    core: AdapterCore,
    registry: Arc<TemplateRegistry>,
}

impl LlamaCppAdapter {
    pub fn new(registry: Arc<TemplateRegistry>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            core: AdapterCore::new(EngineKind::LlamaCpp, backend),
            registry,
        }
    }

    pub fn from_config(cfg: &Config, registry: Arc<TemplateRegistry>) -> Self {
        Self::new(registry, Arc::new(LlamaServerBackend::from_config(cfg)))
    }

    /// File name first, then the GGUF header's own name, then the fallback.
    fn pick_template(&self, path: &Path, metadata: Option<&gguf_metadata::GgufMetadata>) -> Arc<Template> {
        let file_name = TextUtils::model_id(path);
        if let Some(template) = self.registry.find(&file_name, EngineKind::LlamaCpp) {
            return template;
        }
        if let Some(hint) = metadata.and_then(|m| m.match_hint()) {
            if let Some(template) = self.registry.find(&hint, EngineKind::LlamaCpp) {
                info!("Template '{}' picked from GGUF metadata ({})", template.name, hint);
                return template;
            }
        }
        self.registry.resolve(&file_name, EngineKind::LlamaCpp)
    }
}

#[async_trait]
impl EngineAdapter for LlamaCppAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::LlamaCpp
    }

    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    async fn is_available(&self) -> bool {
        self.core.is_available().await
    }

    async fn load_model(&self, path: &Path, config: &LoadConfig) -> Result<ModelInfo, InferenceError> {
        if let Some(info) = self.core.cached(&TextUtils::model_id(path)) {
            return Ok(info);
        }

        let is_gguf = path
            .extension()
            .map_or(false, |e| e.eq_ignore_ascii_case("gguf"));
        let metadata = if is_gguf {
            match gguf_metadata::read(path) {
                Ok(meta) => Some(meta),
                Err(e) => {
                    warn!("Could not read GGUF header: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        let template = self.pick_template(path, metadata.as_ref());

        let mut config = config.clone();
        if let Some(trained) = metadata.as_ref().and_then(|m| m.context_length) {
            if u64::from(config.context_size) > trained {
                info!("Capping context size {} to trained length {}", config.context_size, trained);
                config.context_size = trained as u32;
            }
        }

        self.core.load(path, template, &config).await
    }

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<GenerateResult, InferenceError> {
        self.core.generate(model_id, prompt, options).await
    }

    async fn unload_model(&self, model_id: &str) {
        self.core.unload(model_id).await
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            streaming: true,
            batching: false,
            gpu: true,
            formats: vec![ModelFormat::Gguf, ModelFormat::Ggml],
        }
    }

    fn loaded_models(&self) -> Vec<ModelInfo> {
        self.core.loaded_models()
    }
}
