pub mod http;
pub mod local;

use crate::config::StorageConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Bulk-write interface of the document store. The store driver itself is an
/// external collaborator; backends adapt to whatever is reachable.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()>;
    /// Whole-document replace keyed by `key` within `collection`.
    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<()>;
}

pub fn create_backend(config: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    match config {
        StorageConfig::Local { root, .. } => {
            local::LocalBackend::new(root.clone()).map(|b| Box::new(b) as Box<dyn StorageBackend>)
        }
        StorageConfig::Http { url, .. } => {
            http::HttpBackend::new(url.clone()).map(|b| Box::new(b) as Box<dyn StorageBackend>)
        }
    }
}

#[derive(Debug)]
pub enum StorageEvent {
    Insert {
        collection: String,
        document: Value,
    },
    Upsert {
        collection: String,
        key: String,
        document: Value,
    },
    /// Drain everything batched so far, then acknowledge.
    Flush(oneshot::Sender<()>),
}

pub type StorageSender = mpsc::UnboundedSender<StorageEvent>;

/// Owns the writer task: inserts are batched per collection and flushed by
/// count or by age, upserts go through immediately (they are low volume).
pub struct StorageManager {
    sender: StorageSender,
    cancel_token: CancellationToken,
}

impl StorageManager {
    pub fn new(config: &StorageConfig, cancel_token: CancellationToken) -> Result<Self> {
        let backend: Arc<dyn StorageBackend> = Arc::from(create_backend(config)?);
        let (sender, receiver) = mpsc::unbounded_channel();
        let flush_count = config.flush_count();
        let flush_interval = Duration::from_millis(config.flush_interval_ms().max(1));
        tokio::spawn(Self::run_writer(
            backend,
            receiver,
            flush_count,
            flush_interval,
            cancel_token.clone(),
        ));
        Ok(Self {
            sender,
            cancel_token,
        })
    }

    pub fn sender(&self) -> StorageSender {
        self.sender.clone()
    }

    /// Flush outstanding batches and wait for the acknowledgment; used on
    /// shutdown and by tests.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.sender.send(StorageEvent::Flush(tx)).is_ok() {
            rx.await.ok();
        }
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    async fn run_writer(
        backend: Arc<dyn StorageBackend>,
        mut receiver: mpsc::UnboundedReceiver<StorageEvent>,
        flush_count: usize,
        flush_interval: Duration,
        cancel_token: CancellationToken,
    ) {
        let mut batches: HashMap<String, Vec<Value>> = HashMap::new();
        let mut pending = 0usize;
        let mut interval = tokio::time::interval(flush_interval);
        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    Self::flush_batches(&backend, &mut batches, &mut pending).await;
                    info!("storage writer stopped");
                    break;
                }
                event = receiver.recv() => match event {
                    Some(StorageEvent::Insert { collection, document }) => {
                        batches.entry(collection).or_default().push(document);
                        pending += 1;
                        if pending >= flush_count {
                            Self::flush_batches(&backend, &mut batches, &mut pending).await;
                        }
                    }
                    Some(StorageEvent::Upsert { collection, key, document }) => {
                        if let Err(e) = backend.upsert(&collection, &key, document).await {
                            error!(collection = %collection, key = %key, "upsert failed: {}", e);
                        }
                    }
                    Some(StorageEvent::Flush(ack)) => {
                        Self::flush_batches(&backend, &mut batches, &mut pending).await;
                        ack.send(()).ok();
                    }
                    None => {
                        Self::flush_batches(&backend, &mut batches, &mut pending).await;
                        break;
                    }
                },
                _ = interval.tick() => {
                    Self::flush_batches(&backend, &mut batches, &mut pending).await;
                }
            }
        }
    }

    async fn flush_batches(
        backend: &Arc<dyn StorageBackend>,
        batches: &mut HashMap<String, Vec<Value>>,
        pending: &mut usize,
    ) {
        for (collection, documents) in batches.drain() {
            if documents.is_empty() {
                continue;
            }
            if let Err(e) = backend.insert_many(&collection, documents).await {
                // no retry, the next record carries fresh state
                error!(collection = %collection, "bulk insert failed: {}", e);
            }
        }
        *pending = 0;
    }
}

impl Drop for StorageManager {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
