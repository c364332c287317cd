//! Backend runtime seam
//!
//! An adapter owns the template and cleanup logic; everything that actually
//! produces tokens sits behind [`InferenceBackend`] and the per-model
//! [`BackendSession`] it launches.

use async_trait::async_trait;
use futures::stream::{BoxStream, Stream};
use serde::Serialize;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::process::Child;
use tokio::time::sleep;
use tracing::{info, warn};

/// Streamed text pieces, in order.
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

pub fn boxed_stream<S>(stream: S) -> TokenStream
where
    S: Stream<Item = anyhow::Result<String>> + Send + 'static,
{
    Box::pin(stream)
}

#[derive(Debug, Clone)]
pub struct BackendLaunch {
    pub model_id: String,
    pub model_path: PathBuf,
    pub context_size: u32,
    pub batch_size: u32,
    pub threads: u32,
    pub gpu_layers: u32,
}

/// One completion request against an already formatted prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repeat_penalty: f32,
    pub presence_penalty: f32,
    pub frequency_penalty: f32,
    pub mirostat: u32,
    pub mirostat_tau: f32,
    pub mirostat_eta: f32,
    pub stop: Vec<String>,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Ok when the runtime can be launched or reached.
    async fn probe(&self) -> anyhow::Result<()>;

    async fn launch(&self, launch: &BackendLaunch) -> anyhow::Result<Box<dyn BackendSession>>;
}

#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Dropping the returned stream abandons the request; the session stays
    /// usable for the next one.
    async fn stream(&self, request: BackendRequest) -> anyhow::Result<TokenStream>;

    async fn shutdown(&mut self);
}

/// Child server process. `kill` reaps it; dropping only signals it.
pub struct ManagedServer {
    name: &'static str,
    child: Option<Child>,
}

impl ManagedServer {
    pub fn new(name: &'static str, child: Child) -> Self {
        Self {
            name,
            child: Some(child),
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            match child.kill().await {
                Ok(_) => info!("{} process killed successfully", self.name),
                Err(e) => warn!("Failed to kill {} process: {}", self.name, e),
            }
        }
    }

    /// True once the process has exited on its own.
    pub fn has_exited(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(Some(_))),
            None => true,
        }
    }
}

impl Drop for ManagedServer {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}

pub async fn is_healthy(client: &reqwest::Client, base_url: &str) -> bool {
    let health_url = format!("{}/health", base_url);
    match client.get(&health_url).send().await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}

/// Polls `GET /health` until it succeeds, the process dies, or `timeout`
/// passes.
pub async fn wait_for_health(
    client: &reqwest::Client,
    base_url: &str,
    mut process: Option<&mut ManagedServer>,
    timeout: Duration,
) -> anyhow::Result<()> {
    let started = Instant::now();
    let poll = Duration::from_millis(500);
    let mut attempt: u32 = 0;

    loop {
        if is_healthy(client, base_url).await {
            info!("Runtime at {} ready after {:.1}s", base_url, started.elapsed().as_secs_f32());
            return Ok(());
        }
        if let Some(server) = process.as_deref_mut() {
            if server.has_exited() {
                anyhow::bail!("{} exited before becoming healthy", server.name);
            }
        }
        if started.elapsed() >= timeout {
            anyhow::bail!("runtime at {} not healthy within {}s", base_url, timeout.as_secs());
        }

        attempt += 1;
        if attempt % 10 == 0 {
            info!("Still waiting for {} ({:.0}s)", base_url, started.elapsed().as_secs_f32());
        }
        sleep(poll).await;
    }
}
