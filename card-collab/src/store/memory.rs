//! In-process key-value backend.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::KvBackend;
use crate::error::Result;

/// Map held in memory; contents vanish with the process.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_overwrites() {
        let backend = MemoryBackend::new();
        backend.set("k", vec![1]).await.unwrap();
        backend.set("k", vec![2]).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap(), Some(vec![2]));
        assert_eq!(backend.get("other").await.unwrap(), None);
    }
}
