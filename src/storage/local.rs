use super::StorageBackend;
use crate::utils::sanitize_id;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Filesystem backend: one append-only JSONL file per collection, upserts as
/// one JSON file per key. Meant for single-node deployments and tests; the
/// production document store sits behind the `http` backend.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: String) -> Result<Self> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: PathBuf::from(root),
        })
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    async fn insert_many(&self, collection: &str, documents: Vec<Value>) -> Result<()> {
        let path = self.root.join(format!("{}.jsonl", sanitize_id(collection)));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let mut buf = String::new();
        for document in documents {
            buf.push_str(&serde_json::to_string(&document)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn upsert(&self, collection: &str, key: &str, document: Value) -> Result<()> {
        let dir = self.root.join(sanitize_id(collection));
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.json", sanitize_id(key)));
        tokio::fs::write(&path, serde_json::to_vec_pretty(&document)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_many_appends_jsonl() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().to_string_lossy().to_string()).unwrap();
        backend
            .insert_many("rtpr_rtp_raw_20240101", vec![serde_json::json!({"a": 1})])
            .await
            .unwrap();
        backend
            .insert_many("rtpr_rtp_raw_20240101", vec![serde_json::json!({"a": 2})])
            .await
            .unwrap();
        let content =
            std::fs::read_to_string(dir.path().join("rtpr_rtp_raw_20240101.jsonl")).unwrap();
        assert_eq!(content.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_upsert_sanitizes_key() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().to_string_lossy().to_string()).unwrap();
        backend
            .upsert("hosts", "agent/one", serde_json::json!({"name": "agent/one"}))
            .await
            .unwrap();
        assert!(dir.path().join("hosts").join("agent_one.json").exists());
    }
}
