//! Cache-first execution of statistical code.
//!
//! [`ExecutionGateway::execute`] hashes the code body, answers from the
//! [`ContentCache`] when it can, and otherwise runs the body through the
//! configured [`StatRuntime`]. Concurrent requests for the same body wait on
//! a per-hash lock, so the runtime runs at most once per distinct body while
//! the first result is in flight. Failures are never cached.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cache::{content_hash, ContentCache};
use crate::error::ExecutionError;
use crate::models::{Artifact, CodeKind};
use crate::runtime::{ExecMode, StatRuntime};

pub struct ExecutionGateway {
    runtime: Arc<dyn StatRuntime>,
    cache: Arc<ContentCache>,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExecutionGateway {
    pub fn new(runtime: Arc<dyn StatRuntime>, cache: Arc<ContentCache>) -> Self {
        Self {
            runtime,
            cache,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// Execute `code` as `kind`, returning the cached artifact when present.
    ///
    /// The cache key is the code body alone. A cached artifact produced for
    /// a different kind counts as a miss; the fresh result replaces it.
    pub async fn execute(&self, code: &str, kind: CodeKind) -> Result<Artifact, ExecutionError> {
        let hash = content_hash(code);

        if let Some(artifact) = self.cached(&hash, kind) {
            info!(operation = "execute", hash = %hash, kind = %kind, outcome = "cache_hit");
            return Ok(artifact);
        }

        let slot = {
            let mut map = self.in_flight.lock().await;
            map.entry(hash.clone()).or_default().clone()
        };

        let result = {
            let _turn = slot.lock().await;
            match self.cached(&hash, kind) {
                Some(artifact) => {
                    info!(operation = "execute", hash = %hash, kind = %kind, outcome = "cache_hit_after_wait");
                    Ok(artifact)
                }
                None => self.run_and_store(&hash, code, kind).await,
            }
        };

        drop(slot);
        {
            let mut map = self.in_flight.lock().await;
            // Only the map's reference left: nobody is running or waiting.
            if map.get(&hash).is_some_and(|s| Arc::strong_count(s) == 1) {
                map.remove(&hash);
            }
        }

        result
    }

    fn cached(&self, hash: &str, kind: CodeKind) -> Option<Artifact> {
        let artifact = self.cache.get(hash)?;
        if artifact.mime_type == kind.mime_type() {
            Some(artifact)
        } else {
            info!(
                operation = "execute",
                hash,
                kind = %kind,
                cached_mime = artifact.mime_type.as_str(),
                outcome = "kind_mismatch"
            );
            None
        }
    }

    async fn run_and_store(
        &self,
        hash: &str,
        code: &str,
        kind: CodeKind,
    ) -> Result<Artifact, ExecutionError> {
        let output = match self.runtime.run(code, ExecMode::from(kind)).await {
            Ok(output) => output,
            Err(e) => {
                warn!(
                    operation = "execute",
                    hash,
                    kind = %kind,
                    runtime = self.runtime.name(),
                    outcome = "failed",
                    error = %e,
                    "Code execution failed"
                );
                return Err(e);
            }
        };

        let artifact = Artifact::new(hash, kind.mime_type(), output.into_bytes());
        info!(
            operation = "execute",
            hash,
            kind = %kind,
            runtime = self.runtime.name(),
            size_bytes = artifact.size_bytes,
            outcome = "executed"
        );

        if let Err(e) = self.cache.put(hash, artifact.clone()) {
            warn!(operation = "cache", hash, outcome = "rejected", error = %e, "Artifact not cached");
        }

        Ok(artifact)
    }

    /// Knit an R Markdown snippet to markdown. Not cached.
    pub async fn execute_document(&self, code: &str) -> Result<String, ExecutionError> {
        let hash = content_hash(code);
        let result = self.runtime.run(code, ExecMode::Document).await;
        match &result {
            Ok(text) => info!(
                operation = "execute_document",
                hash = %hash,
                chars = text.len(),
                outcome = "executed"
            ),
            Err(e) => warn!(
                operation = "execute_document",
                hash = %hash,
                outcome = "failed",
                error = %e
            ),
        }
        result
    }

    /// Number of hashes currently being executed or waited on.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
