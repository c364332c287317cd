use super::format_detector::ModelFormat;
use super::lifecycle::CancelToken;
use crate::chat_templates::EngineKind;
use crate::config::{Config, GenerationConfig};
use crate::error::InferenceError;
use crate::memory::Message;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Backend resources requested when a model is loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadConfig {
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl LoadConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            context_size: cfg.ctx_size,
            batch_size: cfg.batch_size,
            threads: cfg.threads,
            gpu_layers: cfg.gpu_layers,
        }
    }

    /// Per-request values win; `threads` only when explicitly set.
    pub fn with_generation(mut self, generation: &GenerationConfig) -> Self {
        self.context_size = generation.context_length;
        self.batch_size = generation.batch_size;
        self.gpu_layers = generation.gpu_layers;
        if let Some(threads) = generation.threads {
            self.threads = threads;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    pub path: PathBuf,
    pub template_name: String,
    pub context_size: u32,
    pub loaded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub streaming: bool,
    pub batching: bool,
    pub gpu: bool,
    pub formats: Vec<ModelFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    /// 0 off, 1 Mirostat, 2 Mirostat 2.0.
    pub mirostat: u32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for SamplingParams {
    fn from(cfg: &GenerationConfig) -> Self {
        Self {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            top_k: cfg.top_k,
            max_tokens: cfg.max_tokens,
            repeat_penalty: cfg.repetition_penalty,
            presence_penalty: cfg.presence_penalty,
            frequency_penalty: cfg.frequency_penalty,
            mirostat: cfg.mirostat,
            mirostat_tau: cfg.mirostat_tau,
            mirostat_eta: cfg.mirostat_eta,
        }
    }
}

pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Clone, Default)]
pub struct GenerateOptions {
    pub sampling: SamplingParams,
    pub stop_strings: Vec<String>,
    /// Prior turns, oldest first. The new prompt is appended as a user turn.
    pub history: Vec<Message>,
    pub on_token: Option<TokenCallback>,
    pub cancel: CancelToken,
}

impl fmt::Debug for GenerateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerateOptions")
            .field("sampling", &self.sampling)
            .field("stop_strings", &self.stop_strings)
            .field("history", &self.history.len())
            .field("on_token", &self.on_token.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    pub elapsed_ms: u64,
    pub tokens_per_second: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    pub tokens: usize,
    pub timings: Timings,
    /// Output failed validation; `text` is a placeholder.
    pub invalid: bool,
    /// Cancelled by the caller; `text` is a placeholder.
    pub stopped: bool,
    pub engine: EngineKind,
}

/// Uniform contract over one backend runtime family.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    fn engine(&self) -> EngineKind;

    fn name(&self) -> &'static str;

    /// Probes the runtime once and caches the answer. Never fails.
    async fn is_available(&self) -> bool;

    /// Loading the same path twice returns the cached info.
    async fn load_model(&self, path: &Path, config: &LoadConfig) -> Result<ModelInfo, InferenceError>;

    async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<GenerateResult, InferenceError>;

    /// No-op for unknown ids.
    async fn unload_model(&self, model_id: &str);

    fn capabilities(&self) -> Capabilities;

    fn loaded_models(&self) -> Vec<ModelInfo>;
}
