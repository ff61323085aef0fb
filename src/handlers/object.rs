//! Object-level S3 API handlers.
//!
//! `GetObject` reads back the bytes written by a multipart upload's
//! parts. No flow assembles a completed object's own metadata record
//! here, so this handler looks up the upload's `MultipartUploadRecord`
//! by (bucket, key) and reads the backing object container its parts
//! were streamed into directly.

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::errors::S3Error;
use crate::records::{MultipartUploadRecord, RecordState};
use crate::AppState;

/// `GET /{bucket}/{key}` -- Read back the bytes written by PutPart.
pub async fn get_object(state: Arc<AppState>, bucket: &str, key: &str) -> Result<Response, S3Error> {
    let (record_state, record) = MultipartUploadRecord::load(&state.store, bucket, key).await?;
    if record_state != RecordState::Present {
        return Err(S3Error::NoSuchKey {
            key: key.to_string(),
        });
    }
    let record = record.expect("Present implies Some");

    let data = state.store.read_object(record.oid).await?;

    Ok((
        StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::memory::MemoryObjectStore;
    use crate::store::ObjectId;

    fn state() -> Arc<AppState> {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        Arc::new(AppState {
            config,
            store: Arc::new(MemoryObjectStore::new()),
            auth_cache: crate::auth::AuthCache::new(),
        })
    }

    #[tokio::test]
    async fn get_object_without_upload_record_is_no_such_key() {
        let state = state();
        let err = get_object(state, "b", "k").await.unwrap_err();
        assert!(matches!(err, S3Error::NoSuchKey { .. }));
    }

    #[tokio::test]
    async fn get_object_reads_back_bytes_written_to_the_multipart_oid() {
        let state = state();
        let oid = ObjectId::new();
        state.store.create_object(oid).await.unwrap();
        state
            .store
            .write_object(oid, 0, bytes::Bytes::from_static(b"hello world"))
            .await
            .unwrap();

        let record = MultipartUploadRecord {
            bucket_name: "b".to_string(),
            object_key: "k".to_string(),
            upload_id: "u".to_string(),
            oid,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            user_metadata: Default::default(),
        };
        record.save(&state.store).await.unwrap();

        let response = get_object(state, "b", "k").await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello world");
    }
}
