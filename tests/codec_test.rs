use canceler::codec::{
    CODEC_VERSION, DEFAULT_THRESHOLD_BYTES, ENCODING_OVERSIZE, METADATA_CODEC, METADATA_ENCODING, OversizeCodec,
    Payload, PayloadCodec,
};
use canceler::error::CancelerError;
use canceler::runtime::storage::{FileBlobStore, InMemoryBlobStore};
use std::sync::Arc;

fn payload(len: usize, seed: u8) -> Payload {
    let data: Vec<u8> = (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
    Payload::new(data).with_metadata("encoding", b"binary/plain".to_vec())
}

#[tokio::test]
async fn test_round_trip_across_threshold() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = OversizeCodec::new(store.clone(), 256);

    for len in [0, 1, 64, 150, 151, 1000, 10_000] {
        let original = payload(len, len as u8);
        let encoded = codec.encode(std::slice::from_ref(&original)).await?;
        let decoded = codec.decode(&encoded).await?;
        assert_eq!(decoded, vec![original], "len {len}");
    }
    Ok(())
}

#[tokio::test]
async fn test_payload_at_threshold_is_not_written() -> anyhow::Result<()> {
    let original = payload(100, 7);
    let size = original.wire_size();
    let store = Arc::new(InMemoryBlobStore::new());

    let at = OversizeCodec::new(store.clone(), size);
    let encoded = at.encode(std::slice::from_ref(&original)).await?;
    assert_eq!(encoded[0], original);
    assert_eq!(store.writes(), 0);

    let below = OversizeCodec::new(store.clone(), size - 1);
    let encoded = below.encode(std::slice::from_ref(&original)).await?;
    assert!(encoded[0].is_externalized());
    assert_eq!(encoded[0].metadata.get(METADATA_ENCODING).map(Vec::as_slice), Some(ENCODING_OVERSIZE));
    assert_eq!(encoded[0].metadata.get(METADATA_CODEC).map(Vec::as_slice), Some(CODEC_VERSION));
    assert_eq!(store.writes(), 1);
    Ok(())
}

#[tokio::test]
async fn test_threshold_applies_to_payload_bytes_not_blob_form() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = OversizeCodec::new(store.clone(), DEFAULT_THRESHOLD_BYTES);

    let under = Payload::new(vec![7u8; 999_000]);
    assert!(under.to_bytes()?.len() > DEFAULT_THRESHOLD_BYTES);
    let encoded = codec.encode(std::slice::from_ref(&under)).await?;
    assert!(!encoded[0].is_externalized());
    assert_eq!(store.writes(), 0);

    let over = Payload::new(vec![7u8; DEFAULT_THRESHOLD_BYTES + 1]);
    let encoded = codec.encode(std::slice::from_ref(&over)).await?;
    assert!(encoded[0].is_externalized());
    assert_eq!(store.writes(), 1);
    Ok(())
}

#[tokio::test]
async fn test_encoded_output_does_not_alias_input() -> anyhow::Result<()> {
    let codec = OversizeCodec::new(Arc::new(InMemoryBlobStore::new()), 1_000_000);
    let mut input = vec![payload(32, 1)];
    let snapshot = input.clone();

    let encoded = codec.encode(&input).await?;
    input[0].data.fill(0);
    input[0].metadata.clear();

    assert_eq!(encoded, snapshot);
    Ok(())
}

#[tokio::test]
async fn test_each_oversized_encode_allocates_a_new_key() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = OversizeCodec::new(store.clone(), 16);
    let big = payload(512, 3);

    let first = codec.encode(std::slice::from_ref(&big)).await?;
    let second = codec.encode(std::slice::from_ref(&big)).await?;

    assert_ne!(first[0].data, second[0].data);
    assert_eq!(store.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_batch_order_is_preserved() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = OversizeCodec::new(store.clone(), 200);
    let batch = vec![payload(10, 1), payload(5000, 2), payload(20, 3), payload(3000, 4)];

    let encoded = codec.encode(&batch).await?;
    let flags: Vec<bool> = encoded.iter().map(Payload::is_externalized).collect();
    assert_eq!(flags, vec![false, true, false, true]);
    assert_eq!(codec.decode(&encoded).await?, batch);
    Ok(())
}

#[tokio::test]
async fn test_missing_blob_is_fatal() -> anyhow::Result<()> {
    let store = Arc::new(InMemoryBlobStore::new());
    let codec = OversizeCodec::new(store.clone(), 16);
    let encoded = codec.encode(&[payload(1024, 9)]).await?;

    let key = String::from_utf8(encoded[0].data.clone())?;
    assert!(store.remove(&key).is_some());

    let err = codec.decode(&encoded).await.unwrap_err();
    assert!(matches!(&err, CancelerError::PayloadNotFound(k) if *k == key));
    assert!(!err.is_retryable());
    Ok(())
}

#[tokio::test]
async fn test_unknown_codec_version_passes_through() -> anyhow::Result<()> {
    let codec = OversizeCodec::new(Arc::new(InMemoryBlobStore::new()), 16);
    let foreign = Payload::new(b"not-a-key".to_vec()).with_metadata(METADATA_CODEC, b"v2".to_vec());
    assert_eq!(codec.decode(std::slice::from_ref(&foreign)).await?, vec![foreign]);
    Ok(())
}

fn reference(key: &str) -> Payload {
    Payload::new(key.as_bytes().to_vec())
        .with_metadata(METADATA_ENCODING, ENCODING_OVERSIZE)
        .with_metadata(METADATA_CODEC, CODEC_VERSION)
}

#[tokio::test]
async fn test_reference_outside_the_store_is_rejected() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::create_dir_all(dir.path().join("secret"))?;
    std::fs::write(dir.path().join("secret").join("leak.bin"), b"outside-the-store")?;
    let codec = OversizeCodec::new(Arc::new(FileBlobStore::new(dir.path().join("payloads"))), 64);

    for key in ["../secret/leak", "not-a-uuid"] {
        let err = codec.decode(&[reference(key)]).await.unwrap_err();
        assert!(matches!(err, CancelerError::Serialization(_)), "{key}: {err}");
        assert!(!err.is_retryable());
    }
    Ok(())
}

#[tokio::test]
async fn test_file_store_round_trip() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let codec = OversizeCodec::new(Arc::new(FileBlobStore::new(dir.path())), 64);
    let big = payload(4096, 5);

    let encoded = codec.encode(std::slice::from_ref(&big)).await?;
    let key = String::from_utf8(encoded[0].data.clone())?;
    assert!(dir.path().join(format!("{key}.bin")).exists());
    assert_eq!(codec.decode(&encoded).await?, vec![big]);
    Ok(())
}
