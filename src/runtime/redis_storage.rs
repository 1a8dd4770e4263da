use async_trait::async_trait;
use redis::AsyncCommands;

use crate::error::Result;
use crate::runtime::storage::BlobStore;

pub struct RedisBlobStore {
    client: redis::Client,
    prefix: String,
}

impl RedisBlobStore {
    pub fn new(client: redis::Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    pub fn open(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        Ok(Self::new(client, "canceler:payload"))
    }

    fn blob_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn.set(self.blob_key(key), bytes).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let bytes: Option<Vec<u8>> = conn.get(self.blob_key(key)).await?;
        Ok(bytes)
    }
}
