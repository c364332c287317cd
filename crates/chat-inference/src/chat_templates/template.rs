//! Template data model
//!
//! A template is one prompt dialect: how each conversation turn is wrapped,
//! which name patterns select it, and which strings end generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Placeholder substituted with message content inside role format strings.
pub const CONTENT_PLACEHOLDER: &str = "{{content}}";
/// Placeholder substituted with the role name inside the generic `message` format.
pub const ROLE_PLACEHOLDER: &str = "{{role}}";

/// Name of the template every engine falls back to.
pub const FALLBACK_TEMPLATE: &str = "chatml";

/// Backend family a template (and an adapter) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineKind {
    /// Quantized binary formats served by llama.cpp.
    #[serde(rename = "llama-cpp")]
    LlamaCpp,
    /// Tensor checkpoints served by a transformers text-generation runtime.
    #[serde(rename = "transformers")]
    Transformers,
}

impl EngineKind {
    pub const ALL: [EngineKind; 2] = [EngineKind::LlamaCpp, EngineKind::Transformers];

    /// Directory / namespace tag used in template files.
    pub fn tag(&self) -> &'static str {
        match self {
            EngineKind::LlamaCpp => "llama-cpp",
            EngineKind::Transformers => "transformers",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl FromStr for EngineKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "llama-cpp" | "llama.cpp" | "llamacpp" => Ok(EngineKind::LlamaCpp),
            "transformers" | "transformers.js" => Ok(EngineKind::Transformers),
            other => Err(anyhow::anyhow!("unknown engine: {}", other)),
        }
    }
}

/// Non-default prompt assembly strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialHandling {
    #[default]
    None,
    /// System content folded into the first user turn (Llama 2 style).
    SystemFirstUserMerge,
    /// Instruction / input / response blocks without turn history.
    AlpacaFormat,
    /// Plain concatenation of user and system content (encoder-decoder models).
    #[serde(alias = "bart_concatenate")]
    T5Concatenate,
}

/// Format strings that assemble a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptSpec {
    pub prefix: String,
    pub suffix: String,
    pub system_message: String,
    pub user_message: String,
    pub assistant_message: String,
    /// Fallback format for roles without a dedicated one; may use `{{role}}`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub special_handling: SpecialHandling,
}

impl PromptSpec {
    /// ChatML, the most widely understood dialect.
    pub fn chatml() -> Self {
        Self {
            prefix: String::new(),
            suffix: "<|im_start|>assistant\n".to_string(),
            system_message: "<|im_start|>system\n{{content}}<|im_end|>\n".to_string(),
            user_message: "<|im_start|>user\n{{content}}<|im_end|>\n".to_string(),
            assistant_message: "<|im_start|>assistant\n{{content}}<|im_end|>\n".to_string(),
            message: None,
            special_handling: SpecialHandling::None,
        }
    }
}

/// A named prompt dialect within one engine namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    pub name: String,
    pub engine: EngineKind,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub stop_tokens: Vec<String>,
    #[serde(rename = "template", default = "PromptSpec::chatml")]
    pub prompt: PromptSpec,
}

impl Template {
    /// Minimal ChatML template used when an engine has no `chatml` definition.
    pub fn synthesized_fallback(engine: EngineKind) -> Self {
        Self {
            name: FALLBACK_TEMPLATE.to_string(),
            engine,
            patterns: Vec::new(),
            priority: 0,
            stop_tokens: vec!["<|im_end|>".to_string()],
            prompt: PromptSpec::chatml(),
        }
    }
}

/// On-disk shape of a template file. `engine` stays a raw string so a missing
/// or foreign namespace can be reported instead of failing deserialization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TemplateFile {
    pub name: String,
    pub engine: Option<String>,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub stop_tokens: Vec<String>,
    #[serde(rename = "template", default = "PromptSpec::chatml")]
    pub prompt: PromptSpec,
}

impl TemplateFile {
    pub(crate) fn into_template(self, engine: EngineKind) -> Template {
        Template {
            name: self.name,
            engine,
            patterns: self.patterns,
            priority: self.priority,
            stop_tokens: self.stop_tokens,
            prompt: self.prompt,
        }
    }
}
