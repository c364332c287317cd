// chat-inference/src/metrics.rs

use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static GENERATIONS: OnceLock<IntCounterVec> = OnceLock::new();
static ACTIVE_GENERATIONS: OnceLock<IntGauge> = OnceLock::new();
static LOADED_MODELS: OnceLock<IntGauge> = OnceLock::new();
static GENERATION_SECONDS: OnceLock<Histogram> = OnceLock::new();

/// Terminal state of one generation, as recorded in `generations_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ok,
    Invalid,
    Stopped,
    Error,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::Invalid => "invalid",
            Outcome::Stopped => "stopped",
            Outcome::Error => "error",
        }
    }
}

/// Registers all collectors. Safe to call more than once.
pub fn init_metrics() {
    let generations = GENERATIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("generations_total", "Finished generations per engine and outcome"),
            &["engine", "outcome"],
        )
        .expect("generations_total metric")
    });

    let active = ACTIVE_GENERATIONS.get_or_init(|| {
        IntGauge::new("active_generations", "Generations currently running").expect("active_generations metric")
    });

    let loaded = LOADED_MODELS.get_or_init(|| {
        IntGauge::new("loaded_models", "Models held in the router cache").expect("loaded_models metric")
    });

    let seconds = GENERATION_SECONDS.get_or_init(|| {
        Histogram::with_opts(
            HistogramOpts::new("generation_seconds", "Wall time of a generation")
                .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 180.0]),
        )
        .expect("generation_seconds metric")
    });

    REGISTRY.register(Box::new(generations.clone())).ok();
    REGISTRY.register(Box::new(active.clone())).ok();
    REGISTRY.register(Box::new(loaded.clone())).ok();
    REGISTRY.register(Box::new(seconds.clone())).ok();
}

pub fn record_generation(engine: &str, outcome: Outcome, seconds: f64) {
    if let Some(counter) = GENERATIONS.get() {
        counter.with_label_values(&[engine, outcome.as_str()]).inc();
    }
    if let Some(histogram) = GENERATION_SECONDS.get() {
        histogram.observe(seconds);
    }
}

pub fn inc_active() {
    if let Some(gauge) = ACTIVE_GENERATIONS.get() {
        gauge.inc();
    }
}

pub fn dec_active() {
    if let Some(gauge) = ACTIVE_GENERATIONS.get() {
        gauge.dec();
    }
}

pub fn set_loaded_models(count: usize) {
    if let Some(gauge) = LOADED_MODELS.get() {
        gauge.set(count as i64);
    }
}

/// Text exposition of everything registered so far.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&REGISTRY.gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_generations_show_up_in_render() {
        init_metrics();
        init_metrics();
        record_generation("llama-cpp", Outcome::Stopped, 0.25);
        set_loaded_models(2);

        let text = render();
        assert!(text.contains("generations_total"));
        assert!(text.contains(r#"outcome="stopped""#));
        assert!(text.contains("generation_seconds_bucket"));
        assert!(text.contains("loaded_models"));
    }
}
