//! Inference router
//!
//! Detects a model's format, hands it to the adapter that owns that format
//! and remembers which adapter holds which model id.

use super::format_detector::{FormatDetector, ModelFormat};
use super::llama_cpp_runtime::LlamaCppAdapter;
use super::runtime_trait::*;
use super::transformers_runtime::TransformersAdapter;
use crate::chat_templates::{EngineKind, TemplateRegistry};
use crate::config::Config;
use crate::error::InferenceError;
use crate::metrics;
use crate::utils::TextUtils;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRecord {
    pub id: String,
    pub path: PathBuf,
    pub format: ModelFormat,
    pub engine: EngineKind,
    pub template_name: String,
    pub context_size: u32,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub engine: EngineKind,
    pub name: &'static str,
    pub available: bool,
    pub capabilities: Capabilities,
}

/// Static format → engine table. `None` means no shipped adapter runs it.
pub fn engine_for(format: ModelFormat) -> Option<EngineKind> {
    match format {
        ModelFormat::Gguf | ModelFormat::Ggml => Some(EngineKind::LlamaCpp),
        ModelFormat::Onnx | ModelFormat::Safetensors | ModelFormat::Pytorch => Some(EngineKind::Transformers),
        ModelFormat::Rwkv => None,
    }
}

pub struct InferenceRouter {
    adapters: Vec<Arc<dyn EngineAdapter>>,
    models: DashMap<String, ModelRecord>,
    /// Serializes load/unload; readers go straight to `models`.
    writer: Mutex<()>,
}

impl InferenceRouter {
    pub fn new(cfg: &Config, registry: Arc<TemplateRegistry>) -> Self {
        Self::with_adapters(vec![
            Arc::new(LlamaCppAdapter::from_config(cfg, registry.clone())),
            Arc::new(TransformersAdapter::from_config(cfg, registry)),
        ])
    }

    pub fn with_adapters(adapters: Vec<Arc<dyn EngineAdapter>>) -> Self {
        Self {
            adapters,
            models: DashMap::new(),
            writer: Mutex::new(()),
        }
    }

    fn adapter(&self, engine: EngineKind) -> Option<&Arc<dyn EngineAdapter>> {
        self.adapters.iter().find(|a| a.engine() == engine)
    }

    pub async fn load_model(&self, path: &Path, config: &LoadConfig) -> Result<ModelRecord, InferenceError> {
        let format = FormatDetector::detect(path)?;
        info!("Detected format {} for {}", format, path.display());

        let engine = engine_for(format).ok_or_else(|| InferenceError::FormatUnsupported(path.to_path_buf()))?;
        let adapter = self
            .adapter(engine)
            .cloned()
            .ok_or_else(|| InferenceError::unavailable(engine, "no adapter registered"))?;

        let model_id = TextUtils::model_id(path);
        if let Some(record) = self.cached(&model_id, path) {
            return Ok(record);
        }

        let _writer = self.writer.lock().await;
        if let Some(record) = self.cached(&model_id, path) {
            return Ok(record);
        }

        let info = adapter.load_model(path, config).await?;
        let record = ModelRecord {
            id: info.id,
            path: info.path,
            format,
            engine,
            template_name: info.template_name,
            context_size: info.context_size,
            loaded_at: Utc::now(),
        };
        self.models.insert(record.id.clone(), record.clone());
        metrics::set_loaded_models(self.models.len());

        info!(
            "Model {} loaded on {} (template '{}', ctx {})",
            record.id, engine, record.template_name, record.context_size
        );
        Ok(record)
    }

    fn cached(&self, model_id: &str, path: &Path) -> Option<ModelRecord> {
        let record = self.models.get(model_id)?.clone();
        if record.path != path {
            warn!(
                "Model id {} already names {}; returning it for {}",
                model_id,
                record.path.display(),
                path.display()
            );
        }
        Some(record)
    }

    pub async fn run_inference(
        &self,
        model_id: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<GenerateResult, InferenceError> {
        let engine = self
            .models
            .get(model_id)
            .map(|r| r.engine)
            .ok_or_else(|| InferenceError::ModelNotLoaded(model_id.to_string()))?;
        let adapter = self
            .adapter(engine)
            .cloned()
            .ok_or_else(|| InferenceError::unavailable(engine, "no adapter registered"))?;

        adapter.generate(model_id, prompt, options).await
    }

    pub async fn unload_model(&self, model_id: &str) -> Result<(), InferenceError> {
        let _writer = self.writer.lock().await;
        let (_, record) = self
            .models
            .remove(model_id)
            .ok_or_else(|| InferenceError::ModelNotLoaded(model_id.to_string()))?;

        if let Some(adapter) = self.adapter(record.engine) {
            adapter.unload_model(model_id).await;
        }
        metrics::set_loaded_models(self.models.len());
        info!("Model {} unloaded", model_id);
        Ok(())
    }

    /// Unloads everything; returns how many models were dropped.
    pub async fn unload_all(&self) -> usize {
        let ids: Vec<String> = self.models.iter().map(|r| r.key().clone()).collect();
        let mut count = 0;
        for id in ids {
            if self.unload_model(&id).await.is_ok() {
                count += 1;
            }
        }
        count
    }

    pub fn get(&self, model_id: &str) -> Option<ModelRecord> {
        self.models.get(model_id).map(|r| r.clone())
    }

    pub fn loaded_models(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self.models.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn engine_status(&self) -> Vec<EngineStatus> {
        let mut status = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            status.push(EngineStatus {
                engine: adapter.engine(),
                name: adapter.name(),
                available: adapter.is_available().await,
                capabilities: adapter.capabilities(),
            });
        }
        status
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model_runtime::engine_adapter::testing::ScriptedBackend;
    use std::time::Duration;

    pub(crate) fn scripted_router(llama: &ScriptedBackend, transformers: &ScriptedBackend) -> InferenceRouter {
        let registry = Arc::new(TemplateRegistry::embedded());
        InferenceRouter::with_adapters(vec![
            Arc::new(LlamaCppAdapter::new(registry.clone(), Arc::new(llama.clone()))),
            Arc::new(TransformersAdapter::new(registry, Arc::new(transformers.clone()))),
        ])
    }

    fn model_file(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"not really weights").unwrap();
        path
    }

    #[test]
    fn format_table_covers_every_format() {
        assert_eq!(engine_for(ModelFormat::Gguf), Some(EngineKind::LlamaCpp));
        assert_eq!(engine_for(ModelFormat::Ggml), Some(EngineKind::LlamaCpp));
        assert_eq!(engine_for(ModelFormat::Safetensors), Some(EngineKind::Transformers));
        assert_eq!(engine_for(ModelFormat::Pytorch), Some(EngineKind::Transformers));
        assert_eq!(engine_for(ModelFormat::Onnx), Some(EngineKind::Transformers));
        assert_eq!(engine_for(ModelFormat::Rwkv), None);
    }

    #[tokio::test]
    async fn loading_twice_returns_the_cached_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "llama-2-7b-chat.Q4_K_M.gguf");
        let llama = ScriptedBackend::new(&["Hi"]);
        let router = scripted_router(&llama, &ScriptedBackend::new(&[]));

        let first = router.load_model(&path, &LoadConfig::default()).await.unwrap();
        let second = router.load_model(&path, &LoadConfig::default()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.id, "llama-2-7b-chat.Q4_K_M.gguf");
        assert_eq!(first.format, ModelFormat::Gguf);
        assert_eq!(first.engine, EngineKind::LlamaCpp);
        assert_eq!(first.template_name, "llama2");
        assert_eq!(llama.launches(), 1);
    }

    #[tokio::test]
    async fn concurrent_loads_launch_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "qwen2-7b.gguf");
        let llama = ScriptedBackend::new(&[]);
        let router = scripted_router(&llama, &ScriptedBackend::new(&[]));

        let config = LoadConfig::default();
        let (a, b, c) = tokio::join!(
            router.load_model(&path, &config),
            router.load_model(&path, &config),
            router.load_model(&path, &config),
        );
        assert_eq!(a.unwrap().id, b.unwrap().id);
        assert!(c.is_ok());
        assert_eq!(llama.launches(), 1);
        assert_eq!(router.loaded_models().len(), 1);
    }

    #[tokio::test]
    async fn tensor_checkpoints_go_to_transformers() {
        let dir = tempfile::tempdir().unwrap();
        let path = model_file(&dir, "gemma-2b.safetensors");
        let llama = ScriptedBackend::new(&[]);
        let transformers = ScriptedBackend::new(&["Bonjour"]);
        let router = scripted_router(&llama, &transformers);

        let record = router.load_model(&path, &LoadConfig::default()).await.unwrap();
        assert_eq!(record.engine, EngineKind::Transformers);
        assert_eq!(record.template_name, "gemma");
        assert_eq!(llama.launches(), 0);
        assert_eq!(transformers.launches(), 1);

        let result = router
            .run_inference(&record.id, "Translate hello", GenerateOptions::default())
            .await
            .unwrap();
        assert_eq!(result.text, "Bonjour");
        assert_eq!(result.engine, EngineKind::Transformers);
    }

    #[tokio::test]
    async fn unroutable_and_missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let rwkv = model_file(&dir, "rwkv-4-world.pth");
        let router = scripted_router(&ScriptedBackend::new(&[]), &ScriptedBackend::new(&[]));

        assert!(matches!(
            router.load_model(&rwkv, &LoadConfig::default()).await,
            Err(InferenceError::FormatUnsupported(_))
        ));
        assert!(matches!(
            router.load_model(&dir.path().join("gone.gguf"), &LoadConfig::default()).await,
            Err(InferenceError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn unknown_ids_are_caller_errors() {
        let router = scripted_router(&ScriptedBackend::new(&[]), &ScriptedBackend::new(&[]));
        assert!(matches!(
            router.run_inference("nope", "hi", GenerateOptions::default()).await,
            Err(InferenceError::ModelNotLoaded(_))
        ));
        assert!(matches!(router.unload_model("nope").await, Err(InferenceError::ModelNotLoaded(_))));
    }

    #[tokio::test]
    async fn unload_evicts_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(&dir, "mistral-7b.gguf");
        let b = model_file(&dir, "phi-2.Q8_0.gguf");
        let llama = ScriptedBackend::new(&[]);
        let router = scripted_router(&llama, &ScriptedBackend::new(&[]));

        router.load_model(&a, &LoadConfig::default()).await.unwrap();
        router.load_model(&b, &LoadConfig::default()).await.unwrap();
        router.unload_model("mistral-7b.gguf").await.unwrap();
        assert!(router.get("mistral-7b.gguf").is_none());
        assert_eq!(router.unload_all().await, 1);
        assert!(router.loaded_models().is_empty());
        assert_eq!(llama.shutdowns.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn different_models_generate_concurrently() {
        let dir = tempfile::tempdir().unwrap();
        let a = model_file(&dir, "mistral-7b.gguf");
        let b = model_file(&dir, "gemma-7b.gguf");
        let llama = ScriptedBackend::new(&["x", "y"]).slow(Duration::from_millis(50));
        let router = scripted_router(&llama, &ScriptedBackend::new(&[]));
        router.load_model(&a, &LoadConfig::default()).await.unwrap();
        router.load_model(&b, &LoadConfig::default()).await.unwrap();

        let started = std::time::Instant::now();
        let (ra, rb) = tokio::join!(
            router.run_inference("mistral-7b.gguf", "1", GenerateOptions::default()),
            router.run_inference("gemma-7b.gguf", "2", GenerateOptions::default()),
        );
        assert_eq!(ra.unwrap().text, "xy");
        assert_eq!(rb.unwrap().text, "xy");
        assert!(started.elapsed() < Duration::from_millis(190));
    }

    #[tokio::test]
    async fn engine_status_reports_each_adapter() {
        let mut missing = ScriptedBackend::new(&[]);
        missing.available = false;
        let router = scripted_router(&ScriptedBackend::new(&[]), &missing);

        let status = router.engine_status().await;
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].engine, EngineKind::LlamaCpp);
        assert!(status[0].available);
        assert_eq!(status[1].engine, EngineKind::Transformers);
        assert!(!status[1].available);
        assert!(status[1].capabilities.batching);
    }
}
