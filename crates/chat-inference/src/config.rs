// chat-inference/src/config.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    /// Overrides the embedded template definitions when set.
    pub templates_dir: Option<PathBuf>,
    pub llama_bin: String,
    pub llama_host: String,
    pub llama_base_port: u16,
    /// Attach to an already running llama-server instead of spawning one.
    pub llama_server_url: Option<String>,
    pub transformers_bin: String,
    pub transformers_host: String,
    pub transformers_base_port: u16,
    pub transformers_server_url: Option<String>,
    pub health_timeout_seconds: u64,
    pub request_timeout_seconds: u64,
    pub ctx_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
    pub system_prompt: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            templates_dir: None,
            llama_bin: "llama-server".to_string(),
            llama_host: "127.0.0.1".to_string(),
            llama_base_port: 8081,
            llama_server_url: None,
            transformers_bin: "text-generation-launcher".to_string(),
            transformers_host: "127.0.0.1".to_string(),
            transformers_base_port: 8181,
            transformers_server_url: None,
            health_timeout_seconds: 60,
            request_timeout_seconds: 600,
            ctx_size: 2048,
            batch_size: 512,
            threads: Self::auto_detect_threads(),
            gpu_layers: 0,
            system_prompt: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let defaults = Self::default();

        let threads = match env::var("THREADS") {
            Ok(v) if v != "auto" => v.parse().context("THREADS must be a number or 'auto'")?,
            _ => defaults.threads,
        };

        let cfg = Self {
            templates_dir: optional_var("TEMPLATES_DIR").map(PathBuf::from),
            llama_bin: env::var("LLAMA_BIN").unwrap_or(defaults.llama_bin),
            llama_host: env::var("LLAMA_HOST").unwrap_or(defaults.llama_host),
            llama_base_port: parse_var("LLAMA_BASE_PORT", defaults.llama_base_port)?,
            llama_server_url: optional_var("LLAMA_SERVER_URL"),
            transformers_bin: env::var("TRANSFORMERS_BIN").unwrap_or(defaults.transformers_bin),
            transformers_host: env::var("TRANSFORMERS_HOST").unwrap_or(defaults.transformers_host),
            transformers_base_port: parse_var("TRANSFORMERS_BASE_PORT", defaults.transformers_base_port)?,
            transformers_server_url: optional_var("TRANSFORMERS_SERVER_URL"),
            health_timeout_seconds: parse_var("HEALTH_TIMEOUT_SECONDS", defaults.health_timeout_seconds)?,
            request_timeout_seconds: parse_var("REQUEST_TIMEOUT_SECONDS", defaults.request_timeout_seconds)?,
            ctx_size: parse_var("CTX_SIZE", defaults.ctx_size)?,
            batch_size: parse_var("BATCH_SIZE", defaults.batch_size)?,
            threads,
            gpu_layers: parse_var("GPU_LAYERS", defaults.gpu_layers)?,
            system_prompt: optional_var("SYSTEM_PROMPT"),
        };

        info!(
            "Resource Configuration: {} GPU layers, {} threads, batch size: {}, context: {}",
            cfg.gpu_layers, cfg.threads, cfg.batch_size, cfg.ctx_size
        );

        Ok(cfg)
    }

    fn auto_detect_threads() -> u32 {
        let num_cpus = num_cpus::get() as u32;

        match num_cpus {
            0..=2 => 1,
            3..=4 => (num_cpus * 2) / 3,
            5..=8 => (num_cpus * 3) / 5,
            9..=16 => num_cpus / 2,
            17..=32 => (num_cpus * 2) / 5,
            _ => 16,
        }
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_var<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_var(key) {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("{} has an invalid value: {}", key, raw)),
        None => Ok(default),
    }
}

/// Per-request generation parameters as they arrive from the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_tokens: u32,
    pub repetition_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: u32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    /// `None` lets the backend pick.
    pub threads: Option<u32>,
    pub context_length: u32,
    pub batch_size: u32,
    pub gpu_layers: u32,
    pub system_prompt: String,
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            max_tokens: 1000,
            repetition_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
            mirostat: 0,
            mirostat_tau: 5.0,
            mirostat_eta: 0.1,
            threads: None,
            context_length: 2048,
            batch_size: 512,
            gpu_layers: 0,
            system_prompt: String::new(),
            stop_sequences: Vec::new(),
        }
    }
}

/// Allowed range and default of one generation parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamConstraint {
    pub name: &'static str,
    pub min: f64,
    pub max: f64,
    /// `None` means auto-detected.
    pub default: Option<f64>,
}

const fn constraint(name: &'static str, min: f64, max: f64, default: Option<f64>) -> ParamConstraint {
    ParamConstraint { name, min, max, default }
}

impl GenerationConfig {
    /// Every parameter clamped into range. Non-finite floats fall back to the
    /// default; each adjustment is logged.
    pub fn validated(self) -> Self {
        let d = Self::default();

        let mut stop_sequences = self.stop_sequences;
        stop_sequences.retain(|s| !s.is_empty());

        Self {
            temperature: clamp_f32("temperature", self.temperature, 0.0, 2.0, d.temperature),
            top_p: clamp_f32("topP", self.top_p, 0.0, 1.0, d.top_p),
            top_k: clamp_u32("topK", self.top_k, 1, 100),
            max_tokens: clamp_u32("maxTokens", self.max_tokens, 1, 8192),
            repetition_penalty: clamp_f32("repetitionPenalty", self.repetition_penalty, 1.0, 2.0, d.repetition_penalty),
            presence_penalty: clamp_f32("presencePenalty", self.presence_penalty, -2.0, 2.0, d.presence_penalty),
            frequency_penalty: clamp_f32("frequencyPenalty", self.frequency_penalty, -2.0, 2.0, d.frequency_penalty),
            mirostat: clamp_u32("mirostat", self.mirostat, 0, 2),
            mirostat_tau: clamp_f32("mirostatTau", self.mirostat_tau, 0.0, 10.0, d.mirostat_tau),
            mirostat_eta: clamp_f32("mirostatEta", self.mirostat_eta, 0.0, 1.0, d.mirostat_eta),
            threads: self.threads.map(|t| clamp_u32("threads", t, 1, 128)),
            context_length: clamp_u32("contextLength", self.context_length, 128, 32768),
            batch_size: clamp_u32("batchSize", self.batch_size, 1, 2048),
            gpu_layers: clamp_u32("gpuLayers", self.gpu_layers, 0, 100),
            system_prompt: self.system_prompt,
            stop_sequences,
        }
    }

    pub fn constraints() -> Vec<ParamConstraint> {
        vec![
            constraint("temperature", 0.0, 2.0, Some(0.7)),
            constraint("topP", 0.0, 1.0, Some(0.9)),
            constraint("topK", 1.0, 100.0, Some(40.0)),
            constraint("maxTokens", 1.0, 8192.0, Some(1000.0)),
            constraint("repetitionPenalty", 1.0, 2.0, Some(1.1)),
            constraint("presencePenalty", -2.0, 2.0, Some(0.0)),
            constraint("frequencyPenalty", -2.0, 2.0, Some(0.0)),
            constraint("mirostat", 0.0, 2.0, Some(0.0)),
            constraint("mirostatTau", 0.0, 10.0, Some(5.0)),
            constraint("mirostatEta", 0.0, 1.0, Some(0.1)),
            constraint("threads", 1.0, 128.0, None),
            constraint("contextLength", 128.0, 32768.0, Some(2048.0)),
            constraint("batchSize", 1.0, 2048.0, Some(512.0)),
            constraint("gpuLayers", 0.0, 100.0, Some(0.0)),
        ]
    }
}

fn clamp_f32(name: &str, value: f32, min: f32, max: f32, default: f32) -> f32 {
    if !value.is_finite() {
        warn!("{} {} is not a number, using {}", name, value, default);
        return default;
    }
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} {} clamped to {}", name, value, clamped);
    }
    clamped
}

fn clamp_u32(name: &str, value: u32, min: u32, max: u32) -> u32 {
    let clamped = value.clamp(min, max);
    if clamped != value {
        warn!("{} {} clamped to {}", name, value, clamped);
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_already_valid() {
        let cfg = GenerationConfig::default();
        assert_eq!(cfg.clone().validated(), cfg);
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = GenerationConfig {
            temperature: 5.0,
            top_p: -1.0,
            top_k: 0,
            max_tokens: 100_000,
            repetition_penalty: 0.5,
            presence_penalty: -3.0,
            mirostat: 7,
            threads: Some(512),
            context_length: 64,
            batch_size: 0,
            gpu_layers: 300,
            ..GenerationConfig::default()
        }
        .validated();

        assert_eq!(cfg.temperature, 2.0);
        assert_eq!(cfg.top_p, 0.0);
        assert_eq!(cfg.top_k, 1);
        assert_eq!(cfg.max_tokens, 8192);
        assert_eq!(cfg.repetition_penalty, 1.0);
        assert_eq!(cfg.presence_penalty, -2.0);
        assert_eq!(cfg.mirostat, 2);
        assert_eq!(cfg.threads, Some(128));
        assert_eq!(cfg.context_length, 128);
        assert_eq!(cfg.batch_size, 1);
        assert_eq!(cfg.gpu_layers, 100);
    }

    #[test]
    fn nan_falls_back_to_default_and_empty_stops_are_dropped() {
        let cfg = GenerationConfig {
            temperature: f32::NAN,
            stop_sequences: vec!["".into(), "User:".into()],
            ..GenerationConfig::default()
        }
        .validated();
        assert_eq!(cfg.temperature, 0.7);
        assert_eq!(cfg.stop_sequences, vec!["User:"]);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let cfg: GenerationConfig = serde_json::from_str(r#"{"temperature":0.2,"maxTokens":64}"#).unwrap();
        assert_eq!(cfg.temperature, 0.2);
        assert_eq!(cfg.max_tokens, 64);
        assert_eq!(cfg.top_k, 40);
        assert!(cfg.threads.is_none());
    }

    #[test]
    fn constraint_table_matches_defaults() {
        let table = GenerationConfig::constraints();
        assert_eq!(table.len(), 14);
        let threads = table.iter().find(|c| c.name == "threads").unwrap();
        assert!(threads.default.is_none());
        let temp = table.iter().find(|c| c.name == "temperature").unwrap();
        assert_eq!((temp.min, temp.max), (0.0, 2.0));
    }

    #[test]
    fn parse_var_reports_bad_values() {
        std::env::set_var("CHAT_INFERENCE_TEST_PORT", "not-a-port");
        let err = parse_var::<u16>("CHAT_INFERENCE_TEST_PORT", 1).unwrap_err();
        assert!(err.to_string().contains("CHAT_INFERENCE_TEST_PORT"));
        assert_eq!(parse_var::<u16>("CHAT_INFERENCE_TEST_UNSET", 7).unwrap(), 7);
    }
}
