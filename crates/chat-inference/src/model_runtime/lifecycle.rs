//! Generation lifecycle
//!
//! Every in-flight generation owns a [`CancelToken`]. Stopping flips the
//! token and wakes the adapter, which races it against the next token.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tracing::{debug, info};

#[derive(Debug, Default)]
struct CancelState {
    flag: AtomicBool,
    notify: Notify,
}

/// One-way cancellation flag shared between the caller and the backend loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<CancelState>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.flag.store(true, Ordering::SeqCst);
        self.0.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.flag.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        loop {
            // Registered before the flag check so a concurrent cancel is not missed.
            let notified = self.0.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationHandle {
    pub id: String,
    pub model_id: String,
    pub token: CancelToken,
}

impl GenerationHandle {
    pub fn cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub success: bool,
}

#[derive(Default)]
pub struct GenerationLifecycleManager {
    handles: DashMap<String, GenerationHandle>,
    seq: AtomicU64,
}

impl GenerationLifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new generation and returns its handle. Ids look like
    /// `{model_id}-{unix_millis}`, with a counter suffix when two starts
    /// land in the same millisecond.
    pub fn start(&self, model_id: &str) -> GenerationHandle {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or_default();
        let base = format!("{}-{}", model_id, millis);

        let mut id = base.clone();
        loop {
            if !self.handles.contains_key(&id) {
                if let Some(handle) = self.try_register(&id, model_id) {
                    return handle;
                }
            }
            let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
            id = format!("{}-{}", base, n);
        }
    }

    /// Registers a generation under a caller-chosen id. Returns `None` if the
    /// id is already active.
    pub fn start_with_id(&self, id: &str, model_id: &str) -> Option<GenerationHandle> {
        self.try_register(id, model_id)
    }

    fn try_register(&self, id: &str, model_id: &str) -> Option<GenerationHandle> {
        use dashmap::mapref::entry::Entry;

        match self.handles.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let handle = GenerationHandle {
                    id: id.to_string(),
                    model_id: model_id.to_string(),
                    token: CancelToken::new(),
                };
                slot.insert(handle.clone());
                debug!("Generation {} registered for {}", id, model_id);
                Some(handle)
            }
        }
    }

    /// Cancels a running generation. False when the id is unknown or the
    /// generation already finished or was already stopped.
    pub fn stop(&self, id: &str) -> bool {
        match self.handles.remove(id) {
            Some((_, handle)) => {
                handle.token.cancel();
                info!("Generation {} stopped", id);
                true
            }
            None => false,
        }
    }

    /// Unregisters a generation whatever its outcome.
    pub fn complete(&self, id: &str) {
        if self.handles.remove(id).is_some() {
            debug!("Generation {} completed", id);
        }
    }

    pub fn get(&self, id: &str) -> Option<GenerationHandle> {
        self.handles.get(id).map(|h| h.clone())
    }

    pub fn active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles.iter().map(|h| h.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Cancels everything running against `model_id`; returns how many.
    pub fn stop_model(&self, model_id: &str) -> usize {
        let ids: Vec<String> = self
            .handles
            .iter()
            .filter(|h| h.model_id == model_id)
            .map(|h| h.key().clone())
            .collect();
        ids.iter().filter(|id| self.stop(id)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_cancels_once() {
        let manager = GenerationLifecycleManager::new();
        let handle = manager.start("phi-2.gguf");
        assert!(handle.id.starts_with("phi-2.gguf-"));
        assert!(!handle.cancelled());

        assert!(manager.stop(&handle.id));
        assert!(handle.cancelled());
        assert!(!manager.stop(&handle.id));
        assert!(manager.get(&handle.id).is_none());
    }

    #[tokio::test]
    async fn cancelled_wakes_pending_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap();
        // Already cancelled: resolves immediately.
        token.cancelled().await;
    }

    #[test]
    fn ids_are_unique_within_a_millisecond() {
        let manager = GenerationLifecycleManager::new();
        let ids: Vec<String> = (0..50).map(|_| manager.start("m").id).collect();
        let mut deduped = ids.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), ids.len());
        assert_eq!(manager.active().len(), 50);
    }

    #[test]
    fn complete_is_idempotent_and_stop_after_complete_is_false() {
        let manager = GenerationLifecycleManager::new();
        let handle = manager.start("m");
        manager.complete(&handle.id);
        manager.complete(&handle.id);
        assert!(!manager.stop(&handle.id));
        assert!(!handle.cancelled());
        assert!(!manager.stop("never-started"));
    }

    #[test]
    fn caller_chosen_ids_do_not_collide() {
        let manager = GenerationLifecycleManager::new();
        assert!(manager.start_with_id("gen-1", "m").is_some());
        assert!(manager.start_with_id("gen-1", "m").is_none());
    }

    #[test]
    fn stop_model_only_touches_that_model() {
        let manager = GenerationLifecycleManager::new();
        let a = manager.start("a");
        let b = manager.start("b");
        assert_eq!(manager.stop_model("a"), 1);
        assert!(a.cancelled());
        assert!(!b.cancelled());
    }
}
