//! Oversized-payload externalization.
//!
//! Payloads whose wire size exceeds the threshold are written to a
//! [`BlobStore`] under a fresh random key and replaced by a small reference
//! payload. Decoding reverses the substitution. Every encode of an oversized
//! payload allocates a new key, even for identical content.
//!
//! A host runtime applies the codec at its serialization boundary: `encode`
//! on every batch of arguments or results before it is sent, and `decode` on
//! every batch received, before handing values to workflow or activity code.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CancelerError, Result};
use crate::runtime::storage::BlobStore;

pub const DEFAULT_THRESHOLD_BYTES: usize = 1_000_000;

pub const METADATA_ENCODING: &str = "encoding";
pub const ENCODING_OVERSIZE: &[u8] = b"binary/oversize-payload-codec";
pub const METADATA_CODEC: &str = "canceler.io/oversize-payload-codec";
pub const CODEC_VERSION: &[u8] = b"v1";

/// A message crossing the orchestration boundary.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: BTreeMap<String, Vec<u8>>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl Payload {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            metadata: BTreeMap::new(),
            data: data.into(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Bytes the payload occupies on the wire: the data plus every metadata
    /// key and value. Framing overhead is not counted.
    pub fn wire_size(&self) -> usize {
        self.data.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }

    /// Form written to the blob store.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn is_externalized(&self) -> bool {
        self.metadata.get(METADATA_CODEC).map(Vec::as_slice) == Some(CODEC_VERSION)
    }
}

mod base64_bytes {
    use base64::{Engine as _, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}

/// Applied to every batch of payloads crossing the boundary; order is preserved.
#[async_trait]
pub trait PayloadCodec: Send + Sync {
    async fn encode(&self, payloads: &[Payload]) -> Result<Vec<Payload>>;
    async fn decode(&self, payloads: &[Payload]) -> Result<Vec<Payload>>;
}

pub struct OversizeCodec {
    store: Arc<dyn BlobStore>,
    threshold_bytes: usize,
}

impl OversizeCodec {
    pub fn new(store: Arc<dyn BlobStore>, threshold_bytes: usize) -> Self {
        Self {
            store,
            threshold_bytes,
        }
    }

    pub fn threshold_bytes(&self) -> usize {
        self.threshold_bytes
    }

    async fn encode_one(&self, payload: &Payload) -> Result<Payload> {
        let size = payload.wire_size();
        if size <= self.threshold_bytes {
            return Ok(payload.clone());
        }

        let key = Uuid::new_v4().to_string();
        self.store.put(&key, payload.to_bytes()?).await?;
        debug!(key = %key, size, "externalized oversized payload");

        Ok(Payload::new(key.into_bytes())
            .with_metadata(METADATA_ENCODING, ENCODING_OVERSIZE)
            .with_metadata(METADATA_CODEC, CODEC_VERSION))
    }

    async fn decode_one(&self, payload: &Payload) -> Result<Payload> {
        if !payload.is_externalized() {
            return Ok(payload.clone());
        }

        let key = String::from_utf8(payload.data.clone())
            .map_err(|e| CancelerError::Serialization(format!("payload reference is not utf-8: {e}")))?;
        // Keys are only ever minted by `encode_one`.
        Uuid::parse_str(&key)
            .map_err(|e| CancelerError::Serialization(format!("payload reference {key:?} is not a uuid: {e}")))?;
        let bytes = self
            .store
            .get(&key)
            .await?
            .ok_or(CancelerError::PayloadNotFound(key))?;
        Payload::from_bytes(&bytes)
    }
}

#[async_trait]
impl PayloadCodec for OversizeCodec {
    async fn encode(&self, payloads: &[Payload]) -> Result<Vec<Payload>> {
        let mut out = Vec::with_capacity(payloads.len());
        for p in payloads {
            out.push(self.encode_one(p).await?);
        }
        Ok(out)
    }

    async fn decode(&self, payloads: &[Payload]) -> Result<Vec<Payload>> {
        let mut out = Vec::with_capacity(payloads.len());
        for p in payloads {
            out.push(self.decode_one(p).await?);
        }
        Ok(out)
    }
}
