use super::StorageBackend;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;

/// Forwards batches to a remote bulk-writer endpoint. The remote side owns
/// the actual document store and its upsert semantics.
pub struct HttpBackend {
    url: String,
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new(url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { url, client })
    }

    async fn post(&self, body: Value) -> Result<()> {
        let response = self.client.post(&self.url).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(anyhow!("bulk writer replied {}", response.status()));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for HttpBackend {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
        self.post(serde_json::json!({
            "op": "insert",
            "collection": collection,
            "documents": documents,
        }))
        .await
    }

    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<()> {
        self.post(serde_json::json!({
            "op": "upsert",
            "collection": collection,
            "key": key,
            "document": document,
        }))
        .await
    }
}
