//! Chat templates
//!
//! One registry of prompt dialects per engine, the formatter that renders a
//! conversation with a dialect, and the sanitizer that cleans what the model
//! sends back.

pub mod formatter;
pub mod registry;
pub mod sanitizer;
pub mod template;

pub use formatter::{normalize_messages, FormattedPrompt, PromptFormatter};
pub use registry::{TemplateRegistry, TemplateSource};
pub use sanitizer::{HistoryReport, ResponseSanitizer, STOPPED_PLACEHOLDER};
pub use template::{EngineKind, PromptSpec, SpecialHandling, Template, FALLBACK_TEMPLATE};
