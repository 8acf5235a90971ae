//! Thread-per-worker execution fabric
//!
//! Every worker is an OS thread draining its own request channel, so calls
//! to one worker queue behind each other while different workers run in
//! parallel. Replies travel back over oneshot channels, which lets the async
//! orchestrator await any number of workers at once.

use super::{WorkerRequest, WorkerResponse, WorkerRuntime};
use crate::{GridError, Result};
use crossbeam_channel::{unbounded, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

enum Envelope {
    Call {
        request: WorkerRequest,
        reply: oneshot::Sender<Result<WorkerResponse>>,
    },
    Shutdown,
}

/// Requested worker count capped by the available hardware parallelism
pub fn effective_worker_count(requested: usize) -> usize {
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    requested.clamp(1, available.max(1))
}

/// Pool of long-lived workers, each owning one `WorkerRuntime`
pub struct WorkerPool {
    senders: Vec<Sender<Envelope>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn one thread per runtime; worker indices follow vector order
    pub fn start(runtimes: Vec<WorkerRuntime>) -> Result<Self> {
        if runtimes.is_empty() {
            return Err(GridError::Config("worker pool needs at least one worker".into()));
        }

        let mut senders = Vec::with_capacity(runtimes.len());
        let mut threads = Vec::with_capacity(runtimes.len());
        for mut runtime in runtimes {
            let (tx, rx) = unbounded::<Envelope>();
            let index = runtime.index();
            let handle = std::thread::Builder::new()
                .name(format!("gridscale-worker-{}", index))
                .spawn(move || {
                    info!("Worker {} started", index);
                    while let Ok(envelope) = rx.recv() {
                        match envelope {
                            Envelope::Call { request, reply } => {
                                let result = runtime.handle(request);
                                if reply.send(result).is_err() {
                                    warn!("Worker {} reply dropped by caller", index);
                                }
                            }
                            Envelope::Shutdown => break,
                        }
                    }
                    if let Err(e) = runtime.dispose() {
                        error!("Worker {} failed to dispose: {}", index, e);
                    }
                    info!("Worker {} stopped", index);
                })?;
            senders.push(tx);
            threads.push(handle);
        }

        Ok(Self {
            senders,
            threads: Mutex::new(threads),
        })
    }

    /// Number of workers
    pub fn cardinality(&self) -> usize {
        self.senders.len()
    }

    /// Run a request on one worker
    pub async fn invoke(&self, index: usize, request: WorkerRequest) -> Result<WorkerResponse> {
        let sender = self.senders.get(index).ok_or_else(|| GridError::WorkerUnavailable {
            index,
            reason: format!("pool has {} workers", self.senders.len()),
        })?;

        let (reply, response) = oneshot::channel();
        sender
            .send(Envelope::Call { request, reply })
            .map_err(|_| GridError::WorkerUnavailable {
                index,
                reason: "worker stopped".into(),
            })?;

        response.await.map_err(|_| GridError::WorkerUnavailable {
            index,
            reason: "worker exited before replying".into(),
        })?
    }

    /// Run a method by name with JSON arguments
    pub async fn invoke_method(
        &self,
        method: &str,
        args: serde_json::Value,
        index: usize,
    ) -> Result<serde_json::Value> {
        if !WorkerRequest::METHODS.contains(&method) {
            warn!("Rejected unknown worker method {}", method);
            return Err(GridError::UnknownMethod(method.to_string()));
        }

        let mut envelope = serde_json::Map::new();
        envelope.insert("method".into(), serde_json::Value::String(method.to_string()));
        if !args.is_null() {
            envelope.insert("args".into(), args);
        }
        let request: WorkerRequest = serde_json::from_value(serde_json::Value::Object(envelope))?;

        let response = self.invoke(index, request).await?;
        Ok(serde_json::to_value(response)?)
    }

    /// Broadcast shutdown and wait for every worker thread to exit
    pub async fn shutdown(&self) -> Result<()> {
        for sender in &self.senders {
            let _ = sender.send(Envelope::Shutdown);
        }

        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        if threads.is_empty() {
            return Ok(());
        }
        let count = threads.len();
        let panicked = tokio::task::spawn_blocking(move || {
            threads.into_iter().map(|t| t.join()).filter(|r| r.is_err()).count()
        })
        .await
        .map_err(|e| GridError::Internal(e.to_string()))?;

        if panicked > 0 {
            return Err(GridError::Internal(format!("{} worker threads panicked", panicked)));
        }
        info!("Worker pool shut down ({} workers)", count);
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for sender in &self.senders {
            let _ = sender.send(Envelope::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{CacheSettings, CachedChunkFactory, MemoryBackend};
    use crate::worker::AggregatorRegistry;
    use std::sync::Arc;

    fn pool(workers: usize) -> WorkerPool {
        let backend = Arc::new(MemoryBackend::new());
        let runtimes = (0..workers)
            .map(|i| {
                let factory =
                    CachedChunkFactory::new(backend.clone(), CacheSettings::default()).unwrap();
                WorkerRuntime::new(i, Box::new(factory), AggregatorRegistry::default())
            })
            .collect();
        WorkerPool::start(runtimes).unwrap()
    }

    #[tokio::test]
    async fn test_invoke_each_worker() {
        let pool = pool(2);
        assert_eq!(pool.cardinality(), 2);
        for i in 0..2 {
            match pool.invoke(i, WorkerRequest::Stats).await.unwrap() {
                WorkerResponse::Stats(stats) => assert_eq!(stats.index, i),
                other => panic!("unexpected response {:?}", other),
            }
        }
        assert!(matches!(
            pool.invoke(5, WorkerRequest::Stats).await,
            Err(GridError::WorkerUnavailable { index: 5, .. })
        ));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_invoke_method_by_name() {
        let pool = pool(1);
        let cleared = pool
            .invoke_method("clearIteration", serde_json::json!({"query_id": "q"}), 0)
            .await
            .unwrap();
        assert_eq!(cleared["type"], "cleared");
        assert_eq!(cleared["value"]["released"], 0);

        assert!(matches!(
            pool.invoke_method("dropTables", serde_json::Value::Null, 0).await,
            Err(GridError::UnknownMethod(_))
        ));
        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let pool = pool(1);
        pool.shutdown().await.unwrap();
        assert!(matches!(
            pool.invoke(0, WorkerRequest::Stats).await,
            Err(GridError::WorkerUnavailable { .. })
        ));
        // a second shutdown is a no-op
        pool.shutdown().await.unwrap();
    }

    #[test]
    fn test_effective_worker_count() {
        assert_eq!(effective_worker_count(0), 1);
        assert!(effective_worker_count(10_000) >= 1);
        assert!(effective_worker_count(10_000) < 10_000);
    }
}
