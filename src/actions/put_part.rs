//! PutPart: write one multipart-upload part into its backing object.
//!
//! The pipeline is expressed as an explicit `Stage` enum driving a
//! plain loop: each stage runs, decides the next stage (or jumps
//! straight to the response stage on failure), and the loop drives it
//! to completion. `ActionBase` supplies the bookkeeping half of that
//! contract (stage-name logging, the done/teardown invariant); dispatch
//! itself lives here.
//!
//! Two points worth calling out:
//!
//! - `save_metadata` advances to `send_response_to_s3_client`
//!   regardless of whether the save succeeded or failed — that stage
//!   alone decides the reply by inspecting `part_state`.
//! - When part 1's record is missing for `part_number > 1`, the
//!   short-circuit happens entirely in `fetch_firstpart_info`, so
//!   `create_object` never runs on that path and there is no risk of a
//!   response being sent twice.

use std::collections::BTreeMap;
use std::sync::Arc;

use md5::{Digest, Md5};

use crate::action::ActionBase;
use crate::errors::S3Error;
use crate::records::{MultipartUploadRecord, PartRecord, RecordState};
use crate::request::RequestContext;
use crate::store::{ObjectId, ObjectStoreClient};
use crate::xml::render_error;

enum Stage {
    FetchBucketInfo,
    FetchMultipartMetadata,
    FetchFirstPartInfo,
    CreateObject,
    InitiateDataStreaming,
    SaveMetadata,
    SendResponse,
}

/// Writes a single part of an in-progress multipart upload.
///
/// `R` is the request-handle abstraction the pipeline is driven
/// against — `request::AxumRequestContext` in production,
/// `request::TestRequestContext` in tests.
pub struct PutPartAction<R: RequestContext> {
    base: ActionBase,
    store: Arc<dyn ObjectStoreClient>,
    request: Arc<R>,

    bucket_name: String,
    object_key: String,
    upload_id: String,
    part_number: u32,
    /// Byte threshold the streaming loop flushes a buffered-but-not-yet-frozen
    /// chunk at.
    write_payload_threshold: usize,

    bucket_state: RecordState,
    multipart_state: RecordState,
    multipart_record: Option<MultipartUploadRecord>,
    /// Only meaningful when `part_number != 1`; stays `Invalid` for
    /// part 1, whose `fetch_firstpart_info` stage never runs.
    first_part_state: RecordState,
    first_part_record: Option<PartRecord>,
    write_failed: bool,
    part_state: RecordState,
    part_md5: String,
    part_content_length: u64,
}

impl<R: RequestContext + 'static> PutPartAction<R> {
    pub fn new(
        store: Arc<dyn ObjectStoreClient>,
        request: Arc<R>,
        bucket_name: String,
        object_key: String,
        upload_id: String,
        part_number: u32,
        write_payload_threshold: usize,
    ) -> Self {
        // Pause ingestion before the first metadata lookup: a bucket or
        // upload that turns out to be missing should fail fast, without
        // first buffering a potentially large request body for nothing.
        request.pause();

        PutPartAction {
            base: ActionBase::new(
                "put_part",
                vec![
                    "fetch_bucket_info",
                    "fetch_multipart_metadata",
                    "fetch_firstpart_info",
                    "create_object",
                    "initiate_data_streaming",
                    "save_metadata",
                    "send_response_to_s3_client",
                ],
            ),
            store,
            request,
            bucket_name,
            object_key,
            upload_id,
            part_number,
            write_payload_threshold,
            bucket_state: RecordState::Empty,
            multipart_state: RecordState::Empty,
            multipart_record: None,
            first_part_state: RecordState::Invalid,
            first_part_record: None,
            write_failed: false,
            part_state: RecordState::Empty,
            part_md5: String::new(),
            part_content_length: 0,
        }
    }

    /// Drive the action to completion. Always ends in exactly one
    /// `send_response` call on the request handle.
    pub async fn run(mut self) {
        let mut stage = Stage::FetchBucketInfo;
        loop {
            self.base.next();
            stage = match stage {
                Stage::FetchBucketInfo => self.fetch_bucket_info().await,
                Stage::FetchMultipartMetadata => self.fetch_multipart_metadata().await,
                Stage::FetchFirstPartInfo => self.fetch_firstpart_info().await,
                Stage::CreateObject => self.create_object().await,
                Stage::InitiateDataStreaming => self.initiate_data_streaming().await,
                Stage::SaveMetadata => self.save_metadata().await,
                Stage::SendResponse => {
                    self.send_response_to_s3_client();
                    return;
                }
            };
        }
    }

    /// Stage 1. Both the present and missing/failed outcomes continue
    /// to the next stage; `send_response_to_s3_client` is the only
    /// place `bucket_state` is inspected.
    async fn fetch_bucket_info(&mut self) -> Stage {
        self.bucket_state = match crate::records::BucketRecord::load(&self.store, &self.bucket_name).await {
            Ok((state, _)) => state,
            Err(e) => {
                tracing::warn!(error = %e, "fetch_bucket_info: backend error");
                RecordState::Failed
            }
        };
        Stage::FetchMultipartMetadata
    }

    /// Stage 2. Short-circuits to stage 7 when the multipart upload
    /// descriptor is missing or the lookup itself failed.
    async fn fetch_multipart_metadata(&mut self) -> Stage {
        match MultipartUploadRecord::load(&self.store, &self.bucket_name, &self.object_key).await {
            Ok((RecordState::Present, Some(record))) => {
                self.multipart_state = RecordState::Present;
                self.multipart_record = Some(record);
                if self.part_number == 1 {
                    Stage::CreateObject
                } else {
                    Stage::FetchFirstPartInfo
                }
            }
            Ok((state, _)) => {
                self.multipart_state = state;
                Stage::SendResponse
            }
            Err(e) => {
                tracing::warn!(error = %e, "fetch_multipart_metadata: backend error");
                self.multipart_state = RecordState::Failed;
                Stage::SendResponse
            }
        }
    }

    /// Stage 3 (only when `part_number != 1`). Part 1's record carries
    /// the content length every later part's offset is computed from;
    /// without it there is nothing to compute against, so a missing
    /// record here short-circuits with a retryable 503 rather than an
    /// InternalError — the upload may simply not have part 1 yet.
    async fn fetch_firstpart_info(&mut self) -> Stage {
        match PartRecord::load(&self.store, &self.bucket_name, &self.object_key, &self.upload_id, 1).await {
            Ok((RecordState::Present, Some(record))) => {
                self.first_part_state = RecordState::Present;
                self.first_part_record = Some(record);
                Stage::CreateObject
            }
            Ok((state, _)) => {
                self.first_part_state = state;
                Stage::SendResponse
            }
            Err(e) => {
                tracing::warn!(error = %e, "fetch_firstpart_info: backend error");
                self.first_part_state = RecordState::Failed;
                Stage::SendResponse
            }
        }
    }

    /// Stage 4. Part 1 allocates the backing container; later parts
    /// write into one that must already exist. Recreating an existing
    /// container truncates it, which we treat as success — S3 overwrite
    /// semantics for a retried part 1.
    async fn create_object(&mut self) -> Stage {
        if self.bucket_state != RecordState::Present {
            // The multipart descriptor and part-1 lookups both succeeded,
            // but the bucket itself is missing or failed — an inconsistent
            // store. Guard the write rather than touch the container.
            return Stage::SendResponse;
        }
        if self.part_number == 1 {
            let oid = self.multipart_record.as_ref().expect("checked Present above").oid;
            if let Err(e) = self.store.create_object(oid).await {
                tracing::warn!(error = %e, "create_object failed");
                self.write_failed = true;
                return Stage::SendResponse;
            }
        }
        Stage::InitiateDataStreaming
    }

    /// Stage 5. Resumes ingestion, then branches on how much of the
    /// body is already available: nothing (skip to stage 6), all of it
    /// (one write), or a stream that needs the backpressured write
    /// loop. The write loop enforces "at most one write in flight" via
    /// pause/resume around each non-terminal write.
    async fn initiate_data_streaming(&mut self) -> Stage {
        self.request.resume();

        let oid = self.multipart_record.as_ref().expect("checked Present in stage 2").oid;
        let base_offset = if self.part_number == 1 {
            0
        } else {
            // Known hazard: this assumes every prior part is exactly
            // part 1's length. A part written out of order with a
            // different size silently lands at the wrong offset.
            let l1 = self
                .first_part_record
                .as_ref()
                .expect("checked Present in stage 3")
                .content_length;
            (self.part_number as u64 - 1) * l1
        };

        let total = self.request.content_length();
        let mut hasher = Md5::new();
        let mut bytes_written: u64 = 0;

        if total == 0 {
            self.part_md5 = format!("\"{:x}\"", hasher.finalize());
            self.part_content_length = 0;
            return Stage::SaveMetadata;
        }

        if self.request.has_all_body_content() {
            let chunk = self.request.buffered_input().take();
            if !chunk.is_empty() {
                if let Err(e) = self.store.write_object(oid, base_offset, chunk.clone()).await {
                    tracing::warn!(error = %e, "write_object failed");
                    self.write_failed = true;
                    return Stage::SendResponse;
                }
                hasher.update(&chunk);
                bytes_written += chunk.len() as u64;
            }
            self.part_md5 = format!("\"{:x}\"", hasher.finalize());
            self.part_content_length = bytes_written;
            return Stage::SaveMetadata;
        }

        let threshold = self.write_payload_threshold;
        let mut skip_wait = false;
        loop {
            if !skip_wait {
                self.request.buffered_input().wait_for_threshold(threshold).await;
            }
            skip_wait = false;

            let frozen = self.request.buffered_input().is_frozen();
            let chunk = self.request.buffered_input().take();

            if chunk.is_empty() {
                if frozen {
                    break;
                }
                continue;
            }

            if !frozen {
                // About to write: stop the producer so at most one
                // write is ever in flight for this part.
                self.request.pause();
                metrics::counter!(crate::metrics::PIPELINE_PAUSE_TOTAL).increment(1);
            }

            let offset = base_offset + bytes_written;
            metrics::gauge!(crate::metrics::PIPELINE_WRITE_INFLIGHT).increment(1.0);
            let write_result = self.store.write_object(oid, offset, chunk.clone()).await;
            metrics::gauge!(crate::metrics::PIPELINE_WRITE_INFLIGHT).decrement(1.0);
            if let Err(e) = write_result {
                tracing::warn!(error = %e, "write_object failed");
                self.write_failed = true;
                return Stage::SendResponse;
            }
            hasher.update(&chunk);
            bytes_written += chunk.len() as u64;

            if frozen {
                break;
            }

            if self.request.buffered_input().length() > 0 {
                // More arrived while we were writing — loop straight
                // back into another write instead of resuming only to
                // pause again immediately.
                skip_wait = true;
                continue;
            }
            self.request.resume();
            metrics::counter!(crate::metrics::PIPELINE_RESUME_TOTAL).increment(1);
        }

        self.part_md5 = format!("\"{:x}\"", hasher.finalize());
        self.part_content_length = bytes_written;
        Stage::SaveMetadata
    }

    /// Stage 6. Both save outcomes advance to stage 7, which decides
    /// the reply from `part_state` alone. Collects `x-amz-meta-*`
    /// headers by prefix match, so a name like `not-x-amz-meta-foo`
    /// is correctly left out of the user-attribute map.
    async fn save_metadata(&mut self) -> Stage {
        let mut user_metadata = BTreeMap::new();
        for (name, value) in self.request.headers_copy() {
            if let Some(meta_name) = name.to_ascii_lowercase().strip_prefix("x-amz-meta-") {
                user_metadata.insert(meta_name.to_string(), value);
            }
        }

        let record = PartRecord {
            upload_id: self.upload_id.clone(),
            part_number: self.part_number,
            content_length: self.part_content_length,
            md5: self.part_md5.clone(),
            user_metadata,
        };

        self.part_state = match record.save(&self.store, &self.bucket_name, &self.object_key).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(error = %e, "save_metadata failed");
                RecordState::Failed
            }
        };
        Stage::SendResponse
    }

    /// Stage 7. Exactly one of these branches fires, in this order of
    /// precedence, regardless of which earlier stage jumped here.
    /// Always resumes ingestion and tears the action down afterward,
    /// even on a short-circuited path where the body was never fully
    /// read.
    fn send_response_to_s3_client(&mut self) {
        if self.bucket_state == RecordState::Missing {
            self.emit_error(S3Error::NoSuchBucket {
                bucket: self.bucket_name.clone(),
            });
        } else if self.multipart_state == RecordState::Missing {
            self.emit_error(S3Error::NoSuchUpload {
                upload_id: self.upload_id.clone(),
            });
        } else if self.first_part_state == RecordState::Missing {
            self.emit_error(S3Error::ServiceUnavailable);
        } else if self.write_failed {
            self.emit_error(S3Error::InternalError(anyhow::anyhow!(
                "write_object failed while streaming part {}",
                self.part_number
            )));
        } else if self.part_state == RecordState::Saved {
            self.request.set_out_header("etag", self.part_md5.clone());
            self.request.send_response(200, String::new());
        } else {
            self.emit_error(S3Error::InternalError(anyhow::anyhow!(
                "part_metadata in unexpected state {:?} after save_metadata",
                self.part_state
            )));
        }

        self.request.resume();
        self.base.mark_done();
        self.base.mark_torn_down();
    }

    fn emit_error(&self, err: S3Error) {
        let status = err.status_code().as_u16();
        let body = render_error(
            err.code(),
            &err.to_string(),
            self.request.object_uri(),
            self.request.request_id(),
        );
        if matches!(err, S3Error::ServiceUnavailable) {
            self.request.set_out_header("retry-after", "1".to_string());
        }
        self.request.set_out_header("content-type", "application/xml".to_string());
        self.request.send_response(status, body);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::BucketRecord;
    use crate::request::TestRequestContext;
    use crate::store::memory::MemoryObjectStore;
    use bytes::Bytes;

    async fn seed_bucket(store: &Arc<dyn ObjectStoreClient>, bucket: &str) {
        BucketRecord {
            bucket_name: bucket.to_string(),
            creation_date: "2026-01-01T00:00:00.000Z".to_string(),
            acl: crate::records::Acl::full_control("owner", "owner"),
        }
        .save(store)
        .await
        .unwrap();
    }

    async fn seed_multipart(
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> ObjectId {
        let oid = ObjectId::new();
        MultipartUploadRecord {
            bucket_name: bucket.to_string(),
            object_key: key.to_string(),
            upload_id: upload_id.to_string(),
            oid,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
            user_metadata: Default::default(),
        }
        .save(store)
        .await
        .unwrap();
        oid
    }

    #[tokio::test]
    async fn part_one_frozen_body_writes_at_offset_zero_and_returns_etag() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let oid = seed_multipart(&store, "b", "k", "u").await;
        store.create_object(oid).await.unwrap();

        let data = Bytes::from(vec![b'x'; 5 * 1024 * 1024]);
        let request = Arc::new(TestRequestContext::new(data.len() as u64, "/b/k").with_full_body(data.clone()));

        let action = PutPartAction::new(store.clone(), request.clone(), "b".into(), "k".into(), "u".into(), 1, 4 * 1024 * 1024);
        action.run().await;

        let (status, _) = *request.response.lock().unwrap().as_ref().unwrap();
        assert_eq!(status, 200);
        let written = store.read_object(oid).await.unwrap();
        assert_eq!(written.len(), data.len());
        assert!(request
            .out_headers
            .lock()
            .unwrap()
            .iter()
            .any(|(k, _)| k == "etag"));
    }

    #[tokio::test]
    async fn part_three_offsets_by_twice_part_one_length() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let oid = seed_multipart(&store, "b", "k", "u").await;
        store.create_object(oid).await.unwrap();

        let l1 = 5 * 1024 * 1024u64;
        PartRecord {
            upload_id: "u".into(),
            part_number: 1,
            content_length: l1,
            md5: "\"deadbeef\"".into(),
            user_metadata: Default::default(),
        }
        .save(&store, "b", "k")
        .await
        .unwrap();

        let data = Bytes::from_static(b"part-three-bytes");
        let request = Arc::new(TestRequestContext::new(data.len() as u64, "/b/k").with_full_body(data.clone()));

        let action = PutPartAction::new(store.clone(), request.clone(), "b".into(), "k".into(), "u".into(), 3, 4 * 1024 * 1024);
        action.run().await;

        let (status, _) = *request.response.lock().unwrap().as_ref().unwrap();
        assert_eq!(status, 200);

        let written = store.read_object(oid).await.unwrap();
        let expected_offset = (3 - 1) * l1;
        assert_eq!(&written[expected_offset as usize..expected_offset as usize + data.len()], &data[..]);
    }

    #[tokio::test]
    async fn part_two_before_part_one_returns_service_unavailable_with_retry_after() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let oid = seed_multipart(&store, "b", "k", "u").await;
        store.create_object(oid).await.unwrap();

        let data = Bytes::from_static(b"whatever");
        let request = Arc::new(TestRequestContext::new(data.len() as u64, "/b/k").with_full_body(data));

        let action = PutPartAction::new(store.clone(), request.clone(), "b".into(), "k".into(), "u".into(), 2, 4 * 1024 * 1024);
        action.run().await;

        let (status, body) = request.response.lock().unwrap().clone().unwrap();
        assert_eq!(status, 503);
        assert!(body.contains("ServiceUnavailable"));
        assert!(request
            .out_headers
            .lock()
            .unwrap()
            .iter()
            .any(|(k, v)| k == "retry-after" && v == "1"));
    }

    #[tokio::test]
    async fn missing_bucket_returns_no_such_bucket_and_still_resumes() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        let data = Bytes::from_static(b"x");
        let request = Arc::new(TestRequestContext::new(data.len() as u64, "/b/k").with_full_body(data));

        let action = PutPartAction::new(store, request.clone(), "nope".into(), "k".into(), "u".into(), 1, 4096);
        action.run().await;

        let (status, body) = request.response.lock().unwrap().clone().unwrap();
        assert_eq!(status, 404);
        assert!(body.contains("NoSuchBucket"));
    }

    #[tokio::test]
    async fn missing_multipart_upload_returns_no_such_upload() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let data = Bytes::from_static(b"x");
        let request = Arc::new(TestRequestContext::new(data.len() as u64, "/b/k").with_full_body(data));

        let action = PutPartAction::new(store, request.clone(), "b".into(), "k".into(), "bogus-upload".into(), 1, 4096);
        action.run().await;

        let (status, body) = request.response.lock().unwrap().clone().unwrap();
        assert_eq!(status, 404);
        assert!(body.contains("NoSuchUpload"));
    }

    #[tokio::test]
    async fn zero_length_part_skips_writes_and_saves_empty_md5() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let oid = seed_multipart(&store, "b", "k", "u").await;
        store.create_object(oid).await.unwrap();

        let request = Arc::new(TestRequestContext::new(0, "/b/k").with_full_body(Bytes::new()));

        let action = PutPartAction::new(store.clone(), request.clone(), "b".into(), "k".into(), "u".into(), 1, 4096);
        action.run().await;

        let (status, _) = *request.response.lock().unwrap().as_ref().unwrap();
        assert_eq!(status, 200);
        let (_, loaded) = PartRecord::load(&store, "b", "k", "u", 1).await.unwrap();
        let loaded = loaded.unwrap();
        assert_eq!(loaded.content_length, 0);
        // MD5 of the empty string.
        assert_eq!(loaded.md5, format!("\"{:x}\"", Md5::new().finalize()));
    }

    #[tokio::test]
    async fn streamed_body_writes_in_threshold_sized_chunks_at_increasing_offsets() {
        let store: Arc<dyn ObjectStoreClient> = Arc::new(MemoryObjectStore::new());
        seed_bucket(&store, "b").await;
        let oid = seed_multipart(&store, "b", "k", "u").await;
        store.create_object(oid).await.unwrap();

        let total = 16 * 1024 * 1024usize;
        let request = Arc::new(TestRequestContext::new(total as u64, "/b/k"));

        let feeder_request = request.clone();
        let feeder = tokio::spawn(async move {
            let chunk = Bytes::from(vec![b'a'; 1024 * 1024]);
            for _ in 0..16 {
                feeder_request.feed_chunk(chunk.clone());
                tokio::task::yield_now().await;
            }
            feeder_request.freeze();
        });

        let action = PutPartAction::new(store.clone(), request.clone(), "b".into(), "k".into(), "u".into(), 1, 4 * 1024 * 1024);
        action.run().await;
        feeder.await.unwrap();

        let (status, _) = *request.response.lock().unwrap().as_ref().unwrap();
        assert_eq!(status, 200);
        let written = store.read_object(oid).await.unwrap();
        assert_eq!(written.len(), total);
    }
}
