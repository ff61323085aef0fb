//! In-memory backing store, for tests and local development.
//!
//! One `RwLock<HashMap<...>>` per concern, guarded independently so KV
//! and object-container traffic never contend with each other.

use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::RwLock;

use super::{ObjectId, ObjectStoreClient};

#[derive(Default)]
pub struct MemoryObjectStore {
    /// `(index, key) -> value`.
    keyvals: RwLock<HashMap<(String, String), String>>,
    /// `oid -> container bytes`, growable, sparse writes zero-fill.
    objects: RwLock<HashMap<ObjectId, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStoreClient for MemoryObjectStore {
    fn get_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let index = index.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let map = self.keyvals.read().await;
            Ok(map.get(&(index, key)).cloned())
        })
    }

    fn put_keyval(
        &self,
        index: &str,
        key: &str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let index = index.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let mut map = self.keyvals.write().await;
            map.insert((index, key), value);
            Ok(())
        })
    }

    fn delete_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let index = index.to_string();
        let key = key.to_string();
        Box::pin(async move {
            let mut map = self.keyvals.write().await;
            map.remove(&(index, key));
            Ok(())
        })
    }

    fn create_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            objects.entry(oid).or_insert_with(Vec::new);
            Ok(())
        })
    }

    fn write_object(
        &self,
        oid: ObjectId,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            let buf = objects
                .get_mut(&oid)
                .ok_or_else(|| anyhow::anyhow!("write_object: no such object container {oid}"))?;
            let offset = offset as usize;
            let end = offset + data.len();
            if buf.len() < end {
                buf.resize(end, 0);
            }
            buf[offset..end].copy_from_slice(&data);
            Ok(())
        })
    }

    fn read_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let objects = self.objects.read().await;
            let buf = objects
                .get(&oid)
                .ok_or_else(|| anyhow::anyhow!("read_object: no such object container {oid}"))?;
            Ok(Bytes::from(buf.clone()))
        })
    }

    fn delete_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut objects = self.objects.write().await;
            objects.remove(&oid);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn keyval_roundtrip() {
        let store = MemoryObjectStore::new();
        assert!(store.get_keyval("BUCKET/x", "k").await.unwrap().is_none());
        store
            .put_keyval("BUCKET/x", "k", "{}".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.get_keyval("BUCKET/x", "k").await.unwrap(),
            Some("{}".to_string())
        );
        store.delete_keyval("BUCKET/x", "k").await.unwrap();
        assert!(store.get_keyval("BUCKET/x", "k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn write_object_at_offset_zero_fills_gap() {
        let store = MemoryObjectStore::new();
        let oid = ObjectId::new();
        store.create_object(oid).await.unwrap();
        store
            .write_object(oid, 5, Bytes::from_static(b"hi"))
            .await
            .unwrap();
        let data = store.read_object(oid).await.unwrap();
        assert_eq!(data.len(), 7);
        assert_eq!(&data[0..5], &[0, 0, 0, 0, 0]);
        assert_eq!(&data[5..7], b"hi");
    }

    #[tokio::test]
    async fn write_object_without_create_fails() {
        let store = MemoryObjectStore::new();
        let oid = ObjectId::new();
        let result = store.write_object(oid, 0, Bytes::from_static(b"x")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn second_write_does_not_clobber_earlier_bytes() {
        let store = MemoryObjectStore::new();
        let oid = ObjectId::new();
        store.create_object(oid).await.unwrap();
        store
            .write_object(oid, 0, Bytes::from_static(b"aaaa"))
            .await
            .unwrap();
        store
            .write_object(oid, 4, Bytes::from_static(b"bbbb"))
            .await
            .unwrap();
        let data = store.read_object(oid).await.unwrap();
        assert_eq!(&data[..], b"aaaabbbb");
    }

    #[tokio::test]
    async fn delete_object_is_idempotent() {
        let store = MemoryObjectStore::new();
        let oid = ObjectId::new();
        store.delete_object(oid).await.unwrap();
        store.create_object(oid).await.unwrap();
        store.delete_object(oid).await.unwrap();
        store.delete_object(oid).await.unwrap();
    }
}
