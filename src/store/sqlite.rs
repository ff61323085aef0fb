//! SQLite + local-file backing store, for a persistent single-node
//! deployment.
//!
//! Key-value rows live in one generic SQLite table, accessed through an
//! `Arc<Mutex<Connection>>` and `spawn_blocking` since
//! `rusqlite::Connection` is `!Send`. Object containers are local
//! files, one per oid, opened for positioned writes rather than
//! staged into a full replacement and renamed into place: a multipart
//! object is assembled by many out-of-order `write_object` calls at
//! independent offsets, so there's no single "whole file" to stage —
//! each write opens the existing container and syncs in place.

use bytes::Bytes;
use rusqlite::{params, Connection};
use std::future::Future;
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use super::{ObjectId, ObjectStoreClient};

pub struct SqliteObjectStore {
    conn: Arc<Mutex<Connection>>,
    objects_root: PathBuf,
}

impl SqliteObjectStore {
    /// Open (or create) the KV database at `db_path` and the object
    /// container directory at `objects_root`.
    pub fn new(db_path: &str, objects_root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA busy_timeout=5000;\
             PRAGMA synchronous=NORMAL;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS keyval (\
                 idx   TEXT NOT NULL,\
                 key   TEXT NOT NULL,\
                 value TEXT NOT NULL,\
                 PRIMARY KEY (idx, key)\
             );",
        )?;

        let objects_root = objects_root.into();
        std::fs::create_dir_all(&objects_root)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            objects_root,
        })
    }

    fn object_path(&self, oid: ObjectId) -> PathBuf {
        self.objects_root.join(oid.to_string())
    }
}

impl ObjectStoreClient for SqliteObjectStore {
    fn get_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>> {
        let index = index.to_string();
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                let mut stmt =
                    conn.prepare("SELECT value FROM keyval WHERE idx = ?1 AND key = ?2")?;
                let row = stmt.query_row(params![index, key], |row| row.get::<_, String>(0));
                match row {
                    Ok(value) => Ok(Some(value)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(anyhow::anyhow!(e)),
                }
            })
            .await?
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
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                conn.execute(
                    "INSERT INTO keyval (idx, key, value) VALUES (?1, ?2, ?3)\
                     ON CONFLICT (idx, key) DO UPDATE SET value = excluded.value",
                    params![index, key, value],
                )?;
                Ok::<(), anyhow::Error>(())
            })
            .await?
        })
    }

    fn delete_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let index = index.to_string();
        let key = key.to_string();
        let conn = Arc::clone(&self.conn);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = conn
                    .lock()
                    .map_err(|e| anyhow::anyhow!("Mutex poisoned: {e}"))?;
                conn.execute(
                    "DELETE FROM keyval WHERE idx = ?1 AND key = ?2",
                    params![index, key],
                )?;
                Ok::<(), anyhow::Error>(())
            })
            .await?
        })
    }

    fn create_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.object_path(oid);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                std::fs::File::create(&path)?;
                Ok::<(), anyhow::Error>(())
            })
            .await?
        })
    }

    fn write_object(
        &self,
        oid: ObjectId,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.object_path(oid);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let mut file = std::fs::OpenOptions::new().write(true).open(&path)?;
                file.seek(SeekFrom::Start(offset))?;
                file.write_all(&data)?;
                file.sync_all()?;
                Ok::<(), anyhow::Error>(())
            })
            .await?
        })
    }

    fn read_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>> {
        let path = self.object_path(oid);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let data = std::fs::read(&path)?;
                Ok::<Bytes, anyhow::Error>(Bytes::from(data))
            })
            .await?
        })
    }

    fn delete_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let path = self.object_path(oid);
        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                Ok::<(), anyhow::Error>(())
            })
            .await?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_store() -> (tempfile::TempDir, SqliteObjectStore) {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let db_path = dir.path().join("test.db");
        let objects_root = dir.path().join("objects");
        let store = SqliteObjectStore::new(db_path.to_str().unwrap(), objects_root)
            .expect("failed to create store");
        (dir, store)
    }

    #[tokio::test]
    async fn keyval_roundtrip() {
        let (_dir, store) = test_store();
        assert!(store
            .get_keyval("BUCKET/x", "k")
            .await
            .unwrap()
            .is_none());
        store
            .put_keyval("BUCKET/x", "k", "{\"a\":1}".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.get_keyval("BUCKET/x", "k").await.unwrap(),
            Some("{\"a\":1}".to_string())
        );
        store
            .put_keyval("BUCKET/x", "k", "{\"a\":2}".to_string())
            .await
            .unwrap();
        assert_eq!(
            store.get_keyval("BUCKET/x", "k").await.unwrap(),
            Some("{\"a\":2}".to_string())
        );
        store.delete_keyval("BUCKET/x", "k").await.unwrap();
        assert!(store
            .get_keyval("BUCKET/x", "k")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn object_write_at_offset_and_read_back() {
        let (_dir, store) = test_store();
        let oid = ObjectId::new();
        store.create_object(oid).await.unwrap();
        store
            .write_object(oid, 0, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        store
            .write_object(oid, 6, Bytes::from_static(b"world"))
            .await
            .unwrap();
        let data = store.read_object(oid).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn out_of_order_part_writes_land_at_correct_offsets() {
        let (_dir, store) = test_store();
        let oid = ObjectId::new();
        store.create_object(oid).await.unwrap();
        // Part 2 arrives before part 1.
        store
            .write_object(oid, 5, Bytes::from_static(b"BBBBB"))
            .await
            .unwrap();
        store
            .write_object(oid, 0, Bytes::from_static(b"AAAAA"))
            .await
            .unwrap();
        let data = store.read_object(oid).await.unwrap();
        assert_eq!(&data[..], b"AAAAABBBBB");
    }

    #[tokio::test]
    async fn delete_object_is_idempotent() {
        let (_dir, store) = test_store();
        let oid = ObjectId::new();
        store.delete_object(oid).await.unwrap();
        store.create_object(oid).await.unwrap();
        store.delete_object(oid).await.unwrap();
        store.delete_object(oid).await.unwrap();
    }
}
