// chat-inference/src/lib.rs

pub mod chat_templates;
pub mod config;
pub mod error;
pub mod memory;
pub mod metrics;
pub mod model_runtime;
pub mod service;
pub mod telemetry;
pub mod utils;

// Public API exports
pub use chat_templates::{EngineKind, PromptFormatter, ResponseSanitizer, Template, TemplateRegistry};
pub use config::{Config, GenerationConfig};
pub use error::{InferenceError, InferenceResult};
pub use memory::{append_with_retry, InMemoryMemoryStore, MemoryStore, Message, Role};
pub use model_runtime::{
    EngineAdapter, FormatDetector, GenerateOptions, GenerateResult, InferenceRouter, LoadConfig, ModelFormat,
    ModelRecord, StopResult,
};
pub use service::{GenerationOutcome, GenerationRequest, InferenceService};
