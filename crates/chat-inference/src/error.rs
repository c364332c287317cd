// chat-inference/src/error.rs

//! Errors surfaced to callers of the inference core.
//!
//! Cancelled and invalid generations are not errors; they come back as
//! flags on [`crate::model_runtime::GenerateResult`].

use std::path::PathBuf;
use thiserror::Error;

use crate::chat_templates::EngineKind;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("model file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("unsupported model format: {}", .0.display())]
    FormatUnsupported(PathBuf),

    #[error("{engine} engine unavailable: {reason}. {hint}")]
    EngineUnavailable {
        engine: EngineKind,
        reason: String,
        hint: String,
    },

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("template '{name}' not found for engine {engine}")]
    TemplateNotFound { name: String, engine: EngineKind },

    #[error("generation failed for model {model_id}: {message}")]
    Generation { model_id: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl InferenceError {
    pub fn unavailable(engine: EngineKind, reason: impl Into<String>) -> Self {
        InferenceError::EngineUnavailable {
            engine,
            reason: reason.into(),
            hint: remediation_hint(engine).to_string(),
        }
    }

    /// Wraps a backend failure with the model it happened on. The backend
    /// message is kept as-is, including its context chain.
    pub fn generation(model_id: impl Into<String>, err: &anyhow::Error) -> Self {
        InferenceError::Generation {
            model_id: model_id.into(),
            message: format!("{:#}", err),
        }
    }
}

fn remediation_hint(engine: EngineKind) -> &'static str {
    match engine {
        EngineKind::LlamaCpp => {
            "Install llama.cpp and point LLAMA_BIN at llama-server, or set LLAMA_SERVER_URL to a running server"
        }
        EngineKind::Transformers => {
            "Install text-generation-inference and point TRANSFORMERS_BIN at text-generation-launcher, or set TRANSFORMERS_SERVER_URL"
        }
    }
}

pub type InferenceResult<T> = Result<T, InferenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unavailable_carries_hint() {
        let err = InferenceError::unavailable(EngineKind::LlamaCpp, "binary not found");
        let text = err.to_string();
        assert!(text.starts_with("llama-cpp engine unavailable: binary not found."));
        assert!(text.contains("LLAMA_BIN"));
    }

    #[test]
    fn generation_keeps_backend_message() {
        let backend = anyhow::anyhow!("connection reset").context("stream read error");
        let err = InferenceError::generation("phi-2.gguf", &backend);
        assert_eq!(
            err.to_string(),
            "generation failed for model phi-2.gguf: stream read error: connection reset"
        );
    }
}
