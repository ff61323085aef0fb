//! Multipart-upload S3 API handlers.
//!
//! `create_multipart_upload` starts an upload and allocates its backing
//! container; `upload_part` is a thin dispatcher that builds a
//! [`crate::request::AxumRequestContext`] from the axum request and
//! drives [`crate::actions::put_part::PutPartAction`] to completion,
//! translating the recorded response into an axum `Response`.
//! Completing, aborting, and listing multipart uploads are handled
//! elsewhere in the gateway and are not part of this module.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::errors::S3Error;
use crate::records::{BucketRecord, MultipartUploadRecord, RecordState};
use crate::request::AxumRequestContext;
use crate::store::ObjectId;
use crate::AppState;

/// Get current time as ISO-8601 string.
fn now_iso8601() -> String {
    crate::handlers::bucket::now_iso8601()
}

// -- Handlers -----------------------------------------------------------------

/// `POST /{bucket}/{key}?uploads` -- Initiate a multipart upload.
pub async fn create_multipart_upload(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    headers: &HeaderMap,
) -> Result<Response, S3Error> {
    let (bucket_state, _) = BucketRecord::load(&state.store, bucket).await?;
    if bucket_state != RecordState::Present {
        return Err(S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        });
    }

    let upload_id = uuid::Uuid::new_v4().to_string();
    let oid = ObjectId::new();
    state.store.create_object(oid).await?;

    let mut user_metadata: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers.iter() {
        let name_str = name.as_str().to_ascii_lowercase();
        if let Some(suffix) = name_str.strip_prefix("x-amz-meta-") {
            if let Ok(val) = value.to_str() {
                user_metadata.insert(suffix.to_string(), val.to_string());
            }
        }
    }

    let record = MultipartUploadRecord {
        bucket_name: bucket.to_string(),
        object_key: key.to_string(),
        upload_id: upload_id.clone(),
        oid,
        created_at: now_iso8601(),
        user_metadata,
    };
    record.save(&state.store).await?;

    let xml = crate::xml::render_initiate_multipart_upload_result(bucket, key, &upload_id);

    Ok((
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            HeaderValue::from_static("application/xml"),
        )],
        xml,
    )
        .into_response())
}

/// `PUT /{bucket}/{key}?partNumber={n}&uploadId={id}` -- Upload a single
/// part. Builds a streaming request context and hands it straight to
/// [`crate::actions::put_part::PutPartAction`]; the pipeline does
/// everything else, including picking the response.
pub async fn upload_part(
    state: Arc<AppState>,
    bucket: &str,
    key: &str,
    part_number: u32,
    upload_id: &str,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Body,
) -> Result<Response, S3Error> {
    if !(1..=10_000).contains(&part_number) {
        return Err(S3Error::InvalidArgument {
            message: "part number must be between 1 and 10000".to_string(),
        });
    }

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(n, v)| (n.as_str().to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    let content_length = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0);

    let object_uri = format!("/{bucket}/{key}");
    let request_id = crate::errors::generate_request_id();

    let ctx = AxumRequestContext::spawn(
        body,
        header_pairs,
        query,
        content_length,
        request_id,
        object_uri,
    );

    let action = crate::actions::put_part::PutPartAction::new(
        state.store.clone(),
        ctx.clone(),
        bucket.to_string(),
        key.to_string(),
        upload_id.to_string(),
        part_number,
        state.config.store.write_payload_threshold,
    );
    action.run().await;

    let (status, out_headers, body) = ctx.snapshot_response_parts();

    let mut response = (
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        body,
    )
        .into_response();
    for (name, value) in out_headers {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::try_from(name),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::memory::MemoryObjectStore;

    fn state() -> Arc<AppState> {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        Arc::new(AppState {
            config,
            store: Arc::new(MemoryObjectStore::new()),
            auth_cache: crate::auth::AuthCache::new(),
        })
    }

    #[tokio::test]
    async fn create_multipart_upload_requires_existing_bucket() {
        let state = state();
        let headers = HeaderMap::new();
        let err = create_multipart_upload(state, "nope", "key.txt", &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, S3Error::NoSuchBucket { .. }));
    }

    #[tokio::test]
    async fn create_multipart_upload_succeeds_for_existing_bucket() {
        let state = state();
        crate::handlers::bucket::create_bucket(state.clone(), "my-bucket")
            .await
            .unwrap();

        let headers = HeaderMap::new();
        let response = create_multipart_upload(state, "my-bucket", "key.txt", &headers)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn upload_part_rejects_part_number_zero() {
        let state = state();
        let response = upload_part(
            state,
            "my-bucket",
            "key.txt",
            0,
            "upload-1",
            HeaderMap::new(),
            HashMap::new(),
            Body::from(Vec::<u8>::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(response, S3Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn upload_part_rejects_part_number_above_ten_thousand() {
        let state = state();
        let response = upload_part(
            state,
            "my-bucket",
            "key.txt",
            10_001,
            "upload-1",
            HeaderMap::new(),
            HashMap::new(),
            Body::from(Vec::<u8>::new()),
        )
        .await
        .unwrap_err();
        assert!(matches!(response, S3Error::InvalidArgument { .. }));
    }

    #[tokio::test]
    async fn upload_part_against_missing_bucket_returns_404() {
        let state = state();
        let response = upload_part(
            state,
            "nope",
            "key.txt",
            1,
            "upload-1",
            HeaderMap::new(),
            HashMap::new(),
            Body::from(Vec::<u8>::new()),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn upload_part_end_to_end_via_dispatcher() {
        let state = state();
        crate::handlers::bucket::create_bucket(state.clone(), "my-bucket")
            .await
            .unwrap();
        create_multipart_upload(state.clone(), "my-bucket", "key.txt", &HeaderMap::new())
            .await
            .unwrap();

        let (_, loaded) = MultipartUploadRecord::load(&state.store, "my-bucket", "key.txt")
            .await
            .unwrap();
        let upload_id = loaded.unwrap().upload_id;

        let data = vec![0x42u8; 16];
        let mut headers = HeaderMap::new();
        headers.insert("content-length", HeaderValue::from_str(&data.len().to_string()).unwrap());

        let response = upload_part(
            state,
            "my-bucket",
            "key.txt",
            1,
            &upload_id,
            headers,
            HashMap::new(),
            Body::from(data),
        )
        .await
        .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("etag"));
    }
}
