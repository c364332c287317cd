//! Transformers adapter
//!
//! Tensor checkpoints (ONNX, Safetensors, PyTorch) served by a
//! text-generation-inference launcher. Checkpoints usually live in a
//! directory named after the model, so template matching also looks at the
//! parent directory.

use super::backend::{
    boxed_stream, wait_for_health, BackendLaunch, BackendRequest, BackendSession, InferenceBackend, ManagedServer,
    TokenStream,
};
use super::engine_adapter::AdapterCore;
use super::format_detector::ModelFormat;
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
use tracing::{debug, info};

pub struct TextGenerationBackend {
    bin: String,
    host: String,
    base_port: u16,
    next_port: AtomicU16,
    attach_url: Option<String>,
    client: reqwest::Client,
    health_timeout: Duration,
}

impl TextGenerationBackend {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            bin: cfg.transformers_bin.clone(),
            host: cfg.transformers_host.clone(),
            base_port: cfg.transformers_base_port,
            next_port: AtomicU16::new(0),
            attach_url: cfg.transformers_server_url.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(cfg.request_timeout_seconds))
                .build()
                .unwrap_or_default(),
            health_timeout: Duration::from_secs(cfg.health_timeout_seconds),
        }
    }

    pub fn attached(url: impl Into<String>, health_timeout: Duration) -> Self {
        let cfg = Config {
            transformers_server_url: Some(url.into()),
            health_timeout_seconds: health_timeout.as_secs().max(1),
            ..Config::default()
        };
        Self::from_config(&cfg)
    }

    fn spawn(&self, launch: &BackendLaunch) -> anyhow::Result<(String, ManagedServer)> {
        let port = self
            .base_port
            .wrapping_add(self.next_port.fetch_add(1, Ordering::Relaxed));
        // The launcher takes the checkpoint directory, not a single file.
        let model_dir = match launch.model_path.parent() {
            Some(parent) if launch.model_path.is_file() && !parent.as_os_str().is_empty() => parent,
            _ => launch.model_path.as_path(),
        };

        info!("Starting {} for model: {}", self.bin, model_dir.display());
        info!("  Port: {}", port);
        info!("  Max total tokens: {}", launch.context_size);

        let mut cmd = tokio::process::Command::new(&self.bin);
        cmd.arg("--model-id").arg(model_dir)
            .arg("--hostname").arg(&self.host)
            .arg("--port").arg(port.to_string())
            .arg("--max-total-tokens").arg(launch.context_size.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.bin))?;

        Ok((format!("http://{}:{}", self.host, port), ManagedServer::new("text-generation-launcher", child)))
    }
}

#[async_trait]
impl InferenceBackend for TextGenerationBackend {
    fn name(&self) -> &'static str {
        "text-generation-launcher"
    }

    async fn probe(&self) -> anyhow::Result<()> {
        if self.attach_url.is_some() {
            return Ok(());
        }
        which::which(&self.bin)
            .map(|path| debug!("{} found at {}", self.bin, path.display()))
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

        Ok(Box::new(TextGenerationSession {
            client: self.client.clone(),
            base_url,
            process,
        }))
    }
}

struct TextGenerationSession {
    client: reqwest::Client,
    base_url: String,
    process: Option<ManagedServer>,
}

#[derive(Debug, Deserialize)]
struct StreamToken {
    #[serde(default)]
    text: String,
    #[serde(default)]
    special: bool,
}

#[derive(Debug, Deserialize)]
struct StreamEvent {
    token: Option<StreamToken>,
    error: Option<String>,
}

/// Request parameters in the launcher's shape. Values it rejects (zero
/// temperature, `top_p` of 1) are left out instead of sent.
fn generate_parameters(request: &BackendRequest) -> serde_json::Value {
    let do_sample = request.temperature > 0.0;
    let mut params = serde_json::json!({
        "max_new_tokens": request.max_tokens,
        "repetition_penalty": request.repeat_penalty,
        "stop": request.stop,
        "do_sample": do_sample,
    });
    // The launcher has no presence penalty or mirostat.
    if request.frequency_penalty != 0.0 {
        params["frequency_penalty"] = serde_json::json!(request.frequency_penalty);
    }
    if do_sample {
        params["temperature"] = serde_json::json!(request.temperature);
        if request.top_k > 0 {
            params["top_k"] = serde_json::json!(request.top_k);
        }
        if request.top_p > 0.0 && request.top_p < 1.0 {
            params["top_p"] = serde_json::json!(request.top_p);
        }
    }
    params
}

#[async_trait]
impl BackendSession for TextGenerationSession {
    async fn stream(&self, request: BackendRequest) -> anyhow::Result<TokenStream> {
        let url = format!("{}/generate_stream", self.base_url);
        let payload = serde_json::json!({
            "inputs": request.prompt,
            "parameters": generate_parameters(&request),
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
                let event: StreamEvent = serde_json::from_str(&data)
                    .with_context(|| format!("bad generate_stream event: {}", data))?;
                if let Some(error) = event.error {
                    Err::<(), _>(anyhow::anyhow!(error))?;
                }
                if let Some(token) = event.token {
                    if !token.special && !token.text.is_empty() {
                        yield token.text;
                    }
                }
            }
        };

        Ok(boxed_stream(tokens))
    }

    async fn shutdown(&mut self) {
        info!("Shutting down text-generation session at {}", self.base_url);
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
    }
}

pub struct TransformersAdapter {
    core: AdapterCore,
    registry: Arc<TemplateRegistry>,
}

impl TransformersAdapter {
    pub fn new(registry: Arc<TemplateRegistry>, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            core: AdapterCore::new(EngineKind::Transformers, backend),
            registry,
        }
    }

    pub fn from_config(cfg: &Config, registry: Arc<TemplateRegistry>) -> Self {
        Self::new(registry, Arc::new(TextGenerationBackend::from_config(cfg)))
    }

    /// `model.safetensors` says nothing; `mistral-7b-instruct/model.safetensors` does.
    fn pick_template(&self, path: &Path) -> Arc<Template> {
        let file_name = TextUtils::model_id(path);
        let qualified = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|dir| format!("{}/{}", dir.to_string_lossy(), file_name));

        match qualified {
            Some(name) => self.registry.resolve(&name, EngineKind::Transformers),
            None => self.registry.resolve(&file_name, EngineKind::Transformers),
        }
    }
}

#[async_trait]
impl EngineAdapter for TransformersAdapter {
    fn engine(&self) -> EngineKind {
        EngineKind::Transformers
    }

    fn name(&self) -> &'static str {
        "transformers"
    }

    async fn is_available(&self) -> bool {
        self.core.is_available().await
    }

    async fn load_model(&self, path: &Path, config: &LoadConfig) -> Result<ModelInfo, InferenceError> {
        if let Some(info) = self.core.cached(&TextUtils::model_id(path)) {
            return Ok(info);
        }
        let template = self.pick_template(path);
        self.core.load(path, template, config).await
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
            batching: true,
            gpu: true,
            formats: vec![ModelFormat::Onnx, ModelFormat::Safetensors, ModelFormat::Pytorch],
        }
    }

    fn loaded_models(&self) -> Vec<ModelInfo> {
        self.core.loaded_models()
    }
}
