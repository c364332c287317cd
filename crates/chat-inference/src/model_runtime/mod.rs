//! Model runtime
//!
//! Format detection, the engine adapters and the router that picks between
//! them. Adapters never run models in-process: each loaded model is served
//! by a local runtime server reached over HTTP.
pub mod backend;
pub mod engine_adapter;
pub mod format_detector;
pub mod gguf_metadata;
pub mod lifecycle;
pub mod llama_cpp_runtime;
pub mod router;
pub mod runtime_trait;
pub mod sse;
pub mod transformers_runtime;

pub use backend::{BackendLaunch, BackendRequest, BackendSession, InferenceBackend, TokenStream};
pub use format_detector::{FormatDetector, ModelFormat};
pub use gguf_metadata::GgufMetadata;
pub use lifecycle::{CancelToken, GenerationHandle, GenerationLifecycleManager, StopResult};
pub use llama_cpp_runtime::{LlamaCppAdapter, LlamaServerBackend};
pub use router::{EngineStatus, InferenceRouter, ModelRecord};
pub use runtime_trait::{
    Capabilities, EngineAdapter, GenerateOptions, GenerateResult, LoadConfig, ModelInfo, SamplingParams, Timings,
    TokenCallback,
};
pub use transformers_runtime::{TextGenerationBackend, TransformersAdapter};
