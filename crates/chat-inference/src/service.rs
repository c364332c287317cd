// chat-inference/src/service.rs

//! Service facade
//!
//! One [`InferenceService`] is built at startup and handed to whatever
//! drives it (CLI, IPC layer, tests). It owns the template registry, the
//! router and the generation lifecycle; nothing here is global.

use crate::chat_templates::{EngineKind, TemplateRegistry};
use crate::config::{Config, GenerationConfig};
use crate::error::InferenceError;
use crate::memory::{Message, Role};
use crate::metrics::{self, Outcome};
use crate::model_runtime::{
    EngineStatus, GenerateOptions, GenerationHandle, GenerationLifecycleManager, InferenceRouter, LoadConfig,
    ModelRecord, SamplingParams, StopResult, Timings, TokenCallback,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Everything a caller supplies for one generation besides the message.
#[derive(Clone, Default)]
pub struct GenerationRequest {
    pub config: GenerationConfig,
    /// Prior turns from the storage layer, oldest first.
    pub history: Vec<Message>,
    pub on_token: Option<TokenCallback>,
    /// Handle from [`InferenceService::begin_generation`], if the caller
    /// needed the id before the generation started.
    pub handle: Option<GenerationHandle>,
    /// Loaded with the request's context, batch, thread and GPU settings
    /// when the model is not loaded yet.
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub generation_id: String,
    pub text: String,
    pub tokens: usize,
    pub timings: Timings,
    pub engine: EngineKind,
    pub invalid: bool,
    pub stopped: bool,
}

pub struct InferenceService {
    config: Arc<Config>,
    registry: Arc<TemplateRegistry>,
    router: InferenceRouter,
    lifecycle: GenerationLifecycleManager,
}

impl InferenceService {
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(match &config.templates_dir {
            Some(dir) => TemplateRegistry::from_dir(dir),
            None => TemplateRegistry::embedded(),
        });
        let router = InferenceRouter::new(&config, registry.clone());
        Self::with_router(config, registry, router)
    }

    pub fn with_router(config: Config, registry: Arc<TemplateRegistry>, router: InferenceRouter) -> Self {
        let templates = registry.load_all();
        metrics::init_metrics();
        info!("Inference service ready with {} templates", templates);

        Self {
            config: Arc::new(config),
            registry,
            router,
            lifecycle: GenerationLifecycleManager::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &TemplateRegistry {
        &self.registry
    }

    pub async fn load_model(&self, path: &Path, config: &LoadConfig) -> Result<ModelRecord, InferenceError> {
        self.router.load_model(path, config).await
    }

    /// Registers a generation ahead of time so the caller can stop it by id
    /// while `generate` is still running.
    pub fn begin_generation(&self, model_id: &str) -> GenerationHandle {
        self.lifecycle.start(model_id)
    }

    pub async fn generate(
        &self,
        model_id: &str,
        message: &str,
        request: GenerationRequest,
    ) -> Result<GenerationOutcome, InferenceError> {
        let params = request.config.validated();
        let system_prompt = Some(params.system_prompt.trim())
            .filter(|s| !s.is_empty())
            .or(self.config.system_prompt.as_deref());
        let history = with_system_prompt(request.history, system_prompt);

        let handle = match request.handle {
            Some(handle) => handle,
            None => self.lifecycle.start(model_id),
        };
        let _active = ActiveGeneration::new(&self.lifecycle, handle.id.clone());

        let model_id = match (self.router.get(model_id), request.model_path) {
            (None, Some(path)) => {
                info!("{} not loaded, loading from {}", model_id, path.display());
                let load = LoadConfig::from_config(&self.config).with_generation(&params);
                self.router.load_model(&path, &load).await?.id
            }
            _ => model_id.to_string(),
        };
        let model_id = model_id.as_str();

        let options = GenerateOptions {
            sampling: SamplingParams::from(&params),
            stop_strings: params.stop_sequences,
            history,
            on_token: request.on_token,
            cancel: handle.token.clone(),
        };

        let started = Instant::now();
        let result = self.router.run_inference(model_id, message, options).await;

        let seconds = started.elapsed().as_secs_f64();
        match result {
            Ok(result) => {
                let outcome = if result.stopped {
                    Outcome::Stopped
                } else if result.invalid {
                    Outcome::Invalid
                } else {
                    Outcome::Ok
                };
                metrics::record_generation(result.engine.tag(), outcome, seconds);
                info!(
                    "Generation {} finished: {} tokens, {:.1} tok/s, {}",
                    handle.id,
                    result.tokens,
                    result.timings.tokens_per_second,
                    outcome.as_str()
                );

                Ok(GenerationOutcome {
                    generation_id: handle.id,
                    text: result.text,
                    tokens: result.tokens,
                    timings: result.timings,
                    engine: result.engine,
                    invalid: result.invalid,
                    stopped: result.stopped,
                })
            }
            Err(e) => {
                let engine = self.router.get(model_id).map(|r| r.engine.tag()).unwrap_or("unknown");
                metrics::record_generation(engine, Outcome::Error, seconds);
                warn!("Generation {} failed: {}", handle.id, e);
                Err(e)
            }
        }
    }

    pub fn stop_generation(&self, generation_id: &str) -> StopResult {
        StopResult {
            success: self.lifecycle.stop(generation_id),
        }
    }

    /// Stops anything still generating on the model, then unloads it.
    pub async fn unload_model(&self, model_id: &str) -> Result<(), InferenceError> {
        let stopped = self.lifecycle.stop_model(model_id);
        if stopped > 0 {
            info!("Stopped {} running generations on {}", stopped, model_id);
        }
        self.router.unload_model(model_id).await
    }

    pub fn loaded_models(&self) -> Vec<ModelRecord> {
        self.router.loaded_models()
    }

    pub async fn clear_all_models(&self) -> usize {
        for record in self.router.loaded_models() {
            self.lifecycle.stop_model(&record.id);
        }
        self.router.unload_all().await
    }

    pub async fn engine_status(&self) -> Vec<EngineStatus> {
        self.router.engine_status().await
    }
}

/// Keeps a generation registered and counted in `active_generations` for
/// exactly as long as it runs, including when the caller drops the future.
struct ActiveGeneration<'a> {
    lifecycle: &'a GenerationLifecycleManager,
    id: String,
}

impl<'a> ActiveGeneration<'a> {
    fn new(lifecycle: &'a GenerationLifecycleManager, id: String) -> Self {
        metrics::inc_active();
        Self { lifecycle, id }
    }
}

impl Drop for ActiveGeneration<'_> {
    fn drop(&mut self) {
        self.lifecycle.complete(&self.id);
        metrics::dec_active();
    }
}

/// Puts `system_prompt` at the head of the history, replacing a leading
/// system turn if there is one.
fn with_system_prompt(mut history: Vec<Message>, system_prompt: Option<&str>) -> Vec<Message> {
    let Some(prompt) = system_prompt else {
        return history;
    };
    if history.first().map_or(false, |m| m.role == Role::System) {
        history[0].content = prompt.to_string();
    } else {
        history.insert(0, Message::system(prompt));
    }
    history
}
