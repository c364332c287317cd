//! Shared adapter machinery
//!
//! Both concrete adapters are thin: they decide which template a model gets
//! and how big its context is. Everything else (the model table, the
//! availability probe, the format → stream → sanitize pipeline) lives here.

use super::backend::{BackendLaunch, BackendRequest, BackendSession, InferenceBackend};
use super::runtime_trait::{GenerateOptions, GenerateResult, LoadConfig, ModelInfo, Timings};
use crate::chat_templates::{EngineKind, PromptFormatter, ResponseSanitizer, Template, STOPPED_PLACEHOLDER};
use crate::error::InferenceError;
use crate::memory::Message;
use crate::utils::TextUtils;
use dashmap::DashMap;
use futures_util::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};

struct LoadedModel {
    info: ModelInfo,
    template: Arc<Template>,
    /// Held for the whole generation: one request per model at a time.
    session: Mutex<Box<dyn BackendSession>>,
}

pub struct AdapterCore {
    engine: EngineKind,
    backend: Arc<dyn InferenceBackend>,
    models: DashMap<String, Arc<LoadedModel>>,
    load_lock: Mutex<()>,
    available: OnceCell<bool>,
}

impl AdapterCore {
    pub fn new(engine: EngineKind, backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            engine,
            backend,
            models: DashMap::new(),
            load_lock: Mutex::new(()),
            available: OnceCell::new(),
        }
    }

    pub fn engine(&self) -> EngineKind {
        self.engine
    }

    pub async fn is_available(&self) -> bool {
        *self
            .available
            .get_or_init(|| async {
                match self.backend.probe().await {
                    Ok(()) => {
                        info!("{} backend {} is available", self.engine, self.backend.name());
                        true
                    }
                    Err(e) => {
                        warn!("{} backend {} unavailable: {:#}", self.engine, self.backend.name(), e);
                        false
                    }
                }
            })
            .await
    }

    pub fn cached(&self, model_id: &str) -> Option<ModelInfo> {
        self.models.get(model_id).map(|m| m.info.clone())
    }

    pub fn loaded_models(&self) -> Vec<ModelInfo> {
        let mut infos: Vec<ModelInfo> = self.models.iter().map(|m| m.info.clone()).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Launches a backend session for `path` unless one already exists.
    pub async fn load(
        &self,
        path: &Path,
        template: Arc<Template>,
        config: &LoadConfig,
    ) -> Result<ModelInfo, InferenceError> {
        let model_id = TextUtils::model_id(path);

        let _guard = self.load_lock.lock().await;
        if let Some(info) = self.cached(&model_id) {
            debug!("{} already loaded on {}", model_id, self.engine);
            return Ok(info);
        }

        if !self.is_available().await {
            return Err(InferenceError::unavailable(
                self.engine,
                format!("{} runtime not found", self.backend.name()),
            ));
        }

        let launch = BackendLaunch {
            model_id: model_id.clone(),
            model_path: path.to_path_buf(),
            context_size: config.context_size,
            batch_size: config.batch_size,
            threads: config.threads,
            gpu_layers: config.gpu_layers,
        };

        info!(
            "Loading {} on {} with template '{}' (ctx {})",
            model_id, self.engine, template.name, config.context_size
        );
        let session = self
            .backend
            .launch(&launch)
            .await
            .map_err(|e| InferenceError::unavailable(self.engine, format!("{:#}", e)))?;

        let info = ModelInfo {
            id: model_id.clone(),
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| model_id.clone()),
            path: path.to_path_buf(),
            template_name: template.name.clone(),
            context_size: config.context_size,
            loaded: true,
        };

        self.models.insert(
            model_id,
            Arc::new(LoadedModel {
                info: info.clone(),
                template,
                session: Mutex::new(session),
            }),
        );
        Ok(info)
    }

    pub async fn unload(&self, model_id: &str) {
        let Some((_, model)) = self.models.remove(model_id) else {
            debug!("Unload of {} on {}: not loaded", model_id, self.engine);
            return;
        };
        // Waits for a running generation on this model to finish first.
        model.session.lock().await.shutdown().await;
        info!("Unloaded {} from {}", model_id, self.engine);
    }

    pub async fn generate(
        &self,
        model_id: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<GenerateResult, InferenceError> {
        let model = self
            .models
            .get(model_id)
            .map(|m| Arc::clone(m.value()))
            .ok_or_else(|| InferenceError::ModelNotLoaded(model_id.to_string()))?;

        let started = Instant::now();

        let mut messages = ResponseSanitizer::filter_history(&options.history);
        messages.push(Message::user(prompt));
        let formatted = PromptFormatter::format(&messages, &model.template);
        let stops = PromptFormatter::merge_stop_tokens(&formatted.stop_tokens, &options.stop_strings);

        debug!(
            "Prompt for {} ({} messages, template '{}'): {}",
            model_id,
            messages.len(),
            model.template.name,
            TextUtils::preview(&formatted.prompt, 160)
        );

        let request = BackendRequest {
            prompt: formatted.prompt,
            max_tokens: options.sampling.max_tokens,
            temperature: options.sampling.temperature,
            top_p: options.sampling.top_p,
            top_k: options.sampling.top_k,
            repeat_penalty: options.sampling.repeat_penalty,
            presence_penalty: options.sampling.presence_penalty,
            frequency_penalty: options.sampling.frequency_penalty,
            mirostat: options.sampling.mirostat,
            mirostat_tau: options.sampling.mirostat_tau,
            mirostat_eta: options.sampling.mirostat_eta,
            stop: stops.clone(),
        };

        let session = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => return Ok(self.stopped(0, started)),
            session = model.session.lock() => session,
        };

        // The runtime may sit on prompt processing before the first byte.
        let mut stream = tokio::select! {
            biased;
            _ = options.cancel.cancelled() => return Ok(self.stopped(0, started)),
            stream = session.stream(request) => stream.map_err(|e| InferenceError::generation(model_id, &e))?,
        };

        let emit = |piece: &str| {
            if let Some(callback) = options.on_token.as_ref() {
                if !piece.is_empty() {
                    callback(piece);
                }
            }
        };

        let mut raw = String::new();
        let mut emitted = 0usize;
        let mut tokens = 0usize;
        let mut hit_stop = false;

        loop {
            let piece = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(piece) => piece,
                    None => break,
                },
            };
            let piece = piece.map_err(|e| InferenceError::generation(model_id, &e))?;
            tokens += 1;
            raw.push_str(&piece);

            if let Some(idx) = TextUtils::earliest_stop(&raw, &stops) {
                raw.truncate(idx);
                hit_stop = true;
            }
            let hold = if hit_stop { 0 } else { TextUtils::pending_stop_prefix(&raw, &stops) };
            let ready = raw.len() - hold;
            if ready > emitted {
                emit(&raw[emitted..ready]);
                emitted = ready;
            }
            if hit_stop {
                break;
            }
        }
        // Abandon the request before releasing the session.
        drop(stream);
        drop(session);

        if options.cancel.is_cancelled() {
            info!("Generation on {} stopped after {} tokens", model_id, tokens);
            return Ok(self.stopped(tokens, started));
        }
        if emitted < raw.len() {
            emit(&raw[emitted..]);
        }

        let cleaned = ResponseSanitizer::sanitize(&raw);
        let invalid = !ResponseSanitizer::validate(&cleaned);
        let text = if invalid {
            warn!(
                "Invalid response from {}: {:?}",
                model_id,
                TextUtils::preview(&raw, 120)
            );
            ResponseSanitizer::failure_message(&raw).to_string()
        } else {
            cleaned
        };

        Ok(GenerateResult {
            text,
            tokens,
            timings: timings(tokens, started),
            invalid,
            stopped: false,
            engine: self.engine,
        })
    }

    fn stopped(&self, tokens: usize, started: Instant) -> GenerateResult {
        GenerateResult {
            text: STOPPED_PLACEHOLDER.to_string(),
            tokens,
            timings: timings(tokens, started),
            invalid: false,
            stopped: true,
            engine: self.engine,
        }
    }
}

fn timings(tokens: usize, started: Instant) -> Timings {
    let elapsed = started.elapsed();
    let secs = elapsed.as_secs_f64();
    Timings {
        elapsed_ms: elapsed.as_millis() as u64,
        tokens_per_second: if secs > 0.0 { tokens as f64 / secs } else { 0.0 },
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedBackend;
    use super::*;
    use crate::chat_templates::TemplateRegistry;
    use crate::model_runtime::lifecycle::CancelToken;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn core(backend: &ScriptedBackend) -> AdapterCore {
        AdapterCore::new(EngineKind::LlamaCpp, Arc::new(backend.clone()))
    }

    fn chatml() -> Arc<Template> {
        TemplateRegistry::embedded().resolve("qwen", EngineKind::LlamaCpp)
    }

    fn path() -> PathBuf {
        PathBuf::from("/models/qwen-7b.gguf")
    }

    #[tokio::test]
    async fn loading_twice_launches_once() {
        let backend = ScriptedBackend::new(&["hi"]);
        let core = core(&backend);
        let a = core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();
        let b = core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id, "qwen-7b.gguf");
        assert_eq!(a.template_name, "chatml");
        assert_eq!(backend.launches(), 1);
    }

    #[tokio::test]
    async fn availability_is_probed_once() {
        let mut backend = ScriptedBackend::new(&[]);
        backend.available = false;
        let core = core(&backend);
        assert!(!core.is_available().await);
        assert!(!core.is_available().await);
        assert_eq!(backend.probes.load(Ordering::SeqCst), 1);

        let err = core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap_err();
        assert!(matches!(err, InferenceError::EngineUnavailable { .. }));
    }

    #[tokio::test]
    async fn generate_formats_streams_and_cleans() {
        let backend = ScriptedBackend::new(&["Hello", " there", "!<|im_end|>", "ignored"]);
        let core = core(&backend);
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = seen.clone();
        let options = GenerateOptions {
            history: vec![Message::system("Be brief"), Message::assistant("[ERROR] broken")],
            stop_strings: vec!["User:".into()],
            on_token: Some(Arc::new(move |t: &str| sink.lock().unwrap().push_str(t))),
            ..GenerateOptions::default()
        };
        let result = core.generate("qwen-7b.gguf", "Hi", options).await.unwrap();

        assert_eq!(result.text, "Hello there!");
        assert!(!result.invalid && !result.stopped);
        assert_eq!(result.tokens, 3);
        assert_eq!(*seen.lock().unwrap(), "Hello there!");

        let request = backend.last_request().unwrap();
        assert!(request.prompt.starts_with("<|im_start|>system\nBe brief<|im_end|>\n<|im_start|>user\nHi"));
        assert!(!request.prompt.contains("[ERROR]"));
        assert!(request.prompt.ends_with("<|im_start|>assistant\n"));
        assert!(request.stop.contains(&"User:".to_string()));
    }

    #[tokio::test]
    async fn stop_split_across_tokens_is_not_emitted() {
        let backend = ScriptedBackend::new(&["Answer", " <|im", "_end|> more"]);
        let core = core(&backend);
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();

        let seen = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        let options = GenerateOptions {
            on_token: Some(Arc::new(move |t: &str| sink.lock().unwrap().push(t.to_string()))),
            ..GenerateOptions::default()
        };
        let result = core.generate("qwen-7b.gguf", "Q", options).await.unwrap();
        assert_eq!(result.text, "Answer");
        assert_eq!(seen.lock().unwrap().concat(), "Answer ");
    }

    #[tokio::test]
    async fn garbage_becomes_placeholder() {
        let backend = ScriptedBackend::new(&["[INST]", "<<SYS>>"]);
        let core = core(&backend);
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();
        let result = core.generate("qwen-7b.gguf", "Q", GenerateOptions::default()).await.unwrap();
        assert!(result.invalid);
        assert!(result.text.starts_with("[Model generated"));
        assert!(!ResponseSanitizer::validate(&result.text));
    }

    #[tokio::test]
    async fn cancellation_mid_stream_returns_stopped_and_session_survives() {
        let backend = ScriptedBackend::new(&["a", "b", "c", "d", "e", "f"]).slow(Duration::from_millis(40));
        let core = Arc::new(core(&backend));
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();

        let cancel = CancelToken::new();
        let options = GenerateOptions {
            cancel: cancel.clone(),
            ..GenerateOptions::default()
        };
        let runner = {
            let core = core.clone();
            tokio::spawn(async move { core.generate("qwen-7b.gguf", "Q", options).await })
        };
        tokio::time::sleep(Duration::from_millis(90)).await;
        cancel.cancel();

        let result = runner.await.unwrap().unwrap();
        assert!(result.stopped);
        assert_eq!(result.text, STOPPED_PLACEHOLDER);
        assert!(result.tokens < 6);

        let again = core.generate("qwen-7b.gguf", "Q", GenerateOptions::default()).await.unwrap();
        assert_eq!(again.text, "abcdef");
    }

    #[tokio::test]
    async fn stop_interrupts_a_stalled_first_token() {
        let backend = ScriptedBackend::new(&["late"]).slow(Duration::from_millis(1500));
        let core = Arc::new(core(&backend));
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();

        let cancel = CancelToken::new();
        let options = GenerateOptions {
            cancel: cancel.clone(),
            ..GenerateOptions::default()
        };
        let runner = {
            let core = core.clone();
            tokio::spawn(async move { core.generate("qwen-7b.gguf", "Q", options).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let cancelled_at = Instant::now();
        cancel.cancel();

        let result = runner.await.unwrap().unwrap();
        assert!(result.stopped);
        assert_eq!(result.tokens, 0);
        assert!(cancelled_at.elapsed() < Duration::from_millis(500));

        // The session was released, so unloading does not wait on the stream.
        tokio::time::timeout(Duration::from_millis(500), core.unload("qwen-7b.gguf"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn backend_errors_carry_model_id() {
        let mut backend = ScriptedBackend::new(&[]);
        backend.fail_stream = true;
        let core = core(&backend);
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();
        let err = core.generate("qwen-7b.gguf", "Q", GenerateOptions::default()).await.unwrap_err();
        match err {
            InferenceError::Generation { model_id, message } => {
                assert_eq!(model_id, "qwen-7b.gguf");
                assert_eq!(message, "backend exploded");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_and_double_unload() {
        let backend = ScriptedBackend::new(&["x"]);
        let core = core(&backend);
        assert!(matches!(
            core.generate("nope", "Q", GenerateOptions::default()).await,
            Err(InferenceError::ModelNotLoaded(_))
        ));

        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();
        core.unload("qwen-7b.gguf").await;
        core.unload("qwen-7b.gguf").await;
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);
        assert!(core.loaded_models().is_empty());
    }

    #[tokio::test]
    async fn generations_on_one_model_are_serialized() {
        let backend = ScriptedBackend::new(&["x", "y"]).slow(Duration::from_millis(30));
        let core = Arc::new(core(&backend));
        core.load(&path(), chatml(), &LoadConfig::default()).await.unwrap();

        let started = Instant::now();
        let (a, b) = tokio::join!(
            core.generate("qwen-7b.gguf", "1", GenerateOptions::default()),
            core.generate("qwen-7b.gguf", "2", GenerateOptions::default()),
        );
        assert_eq!(a.unwrap().text, "xy");
        assert_eq!(b.unwrap().text, "xy");
        // Two streams of two 30ms pieces each, back to back.
        assert!(started.elapsed() >= Duration::from_millis(110));
    }
}
