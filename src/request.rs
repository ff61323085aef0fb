//! Request-handle abstraction consumed by the action pipeline.
//!
//! `RequestContext` is the surface the pipeline needs from the HTTP
//! front-end: pause/resume flow control, buffered-input access,
//! header/query accessors, and response emission. `BufferedInput` is
//! its streaming-body half — a growing byte buffer with a frozen flag,
//! drained by the consumer and replenished by a background producer
//! task. `BufferedInput::wait_for_threshold` is the suspension point
//! the streaming loop awaits once per iteration instead of registering
//! a callback.

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use http_body_util::BodyExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Streaming HTTP request body buffer with producer flow control.
///
/// A background task (spawned by [`AxumRequestContext::new`]) pulls
/// frames out of the axum body and appends them here; the consuming
/// action drains what has accumulated so far with [`BufferedInput::take`].
/// "Frozen" means the producer has seen the end of the body — no more
/// bytes are coming, whatever is buffered now is everything that is
/// left.
pub struct BufferedInput {
    buf: Mutex<BytesMut>,
    frozen: AtomicBool,
    /// Producer respects this before reading the next body frame —
    /// this is what `pause()`/`resume()` actually toggle.
    paused: AtomicBool,
    /// Signalled on: new bytes appended, frozen, or resumed. Consumers
    /// and the producer both wait on this.
    changed: Notify,
}

impl BufferedInput {
    fn new() -> Self {
        BufferedInput {
            buf: Mutex::new(BytesMut::new()),
            frozen: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            changed: Notify::new(),
        }
    }

    fn push(&self, chunk: Bytes) {
        self.buf.lock().expect("buffered input mutex poisoned").extend_from_slice(&chunk);
        self.changed.notify_waiters();
    }

    fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Bytes accumulated since the last [`take`](Self::take).
    pub fn length(&self) -> usize {
        self.buf.lock().expect("buffered input mutex poisoned").len()
    }

    /// True once the whole request body has been seen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Drain everything buffered so far, leaving the buffer empty.
    pub fn take(&self) -> Bytes {
        let mut buf = self.buf.lock().expect("buffered input mutex poisoned");
        std::mem::take(&mut *buf).freeze()
    }

    /// Suspend until either `threshold` bytes are buffered or the
    /// input is frozen, whichever comes first.
    pub async fn wait_for_threshold(&self, threshold: usize) {
        loop {
            if self.is_frozen() || self.length() >= threshold {
                return;
            }
            self.changed.notified().await;
        }
    }
}

/// The request-handle surface the PutPart pipeline is written against:
/// pause/resume, buffered-input access, header/query lookups, and
/// response emission.
pub trait RequestContext: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn buffered_input(&self) -> &BufferedInput;
    /// True when the entire body arrived before the pipeline even
    /// asked (small bodies axum has already buffered).
    fn has_all_body_content(&self) -> bool;
    fn header_value(&self, name: &str) -> Option<String>;
    fn headers_copy(&self) -> Vec<(String, String)>;
    fn query_value(&self, name: &str) -> Option<String>;
    fn content_length(&self) -> u64;
    fn request_id(&self) -> &str;
    fn object_uri(&self) -> &str;
    fn set_out_header(&self, name: &str, value: String);
    /// Record the final status/body. Idempotent-by-convention: the
    /// action base asserts this is called exactly once.
    fn send_response(&self, status: u16, body: String);
}

/// Concrete [`RequestContext`] backed by an axum request, with a
/// background task streaming its body into a [`BufferedInput`].
pub struct AxumRequestContext {
    headers: Vec<(String, String)>,
    query: HashMap<String, String>,
    content_length: u64,
    request_id: String,
    object_uri: String,
    out_headers: Mutex<Vec<(String, String)>>,
    response: Mutex<Option<(u16, String)>>,
    buffered: BufferedInput,
}

impl AxumRequestContext {
    /// Spawn the body-reading producer task and return the context
    /// immediately; the pipeline drives consumption from here on.
    pub fn spawn(
        body: Body,
        headers: Vec<(String, String)>,
        query: HashMap<String, String>,
        content_length: u64,
        request_id: String,
        object_uri: String,
    ) -> std::sync::Arc<Self> {
        let ctx = std::sync::Arc::new(AxumRequestContext {
            headers,
            query,
            content_length,
            request_id,
            object_uri,
            out_headers: Mutex::new(Vec::new()),
            response: Mutex::new(None),
            buffered: BufferedInput::new(),
        });

        let producer_ctx = std::sync::Arc::clone(&ctx);
        tokio::spawn(async move {
            let mut body = body;
            loop {
                while producer_ctx.buffered.paused.load(Ordering::SeqCst) {
                    producer_ctx.buffered.changed.notified().await;
                }
                match body.frame().await {
                    Some(Ok(frame)) => {
                        if let Ok(data) = frame.into_data() {
                            producer_ctx.buffered.push(data);
                        }
                    }
                    Some(Err(_)) | None => {
                        producer_ctx.buffered.freeze();
                        break;
                    }
                }
            }
        });

        ctx
    }
}

impl RequestContext for AxumRequestContext {
    fn pause(&self) {
        self.buffered.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.buffered.paused.store(false, Ordering::SeqCst);
        self.buffered.changed.notify_waiters();
    }

    fn buffered_input(&self) -> &BufferedInput {
        &self.buffered
    }

    fn has_all_body_content(&self) -> bool {
        self.buffered.is_frozen()
    }

    fn header_value(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.clone())
    }

    fn headers_copy(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn query_value(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn content_length(&self) -> u64 {
        self.content_length
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn object_uri(&self) -> &str {
        &self.object_uri
    }

    fn set_out_header(&self, name: &str, value: String) {
        self.out_headers
            .lock()
            .expect("out_headers mutex poisoned")
            .push((name.to_string(), value));
    }

    fn send_response(&self, status: u16, body: String) {
        *self.response.lock().expect("response mutex poisoned") = Some((status, body));
    }
}

impl AxumRequestContext {
    /// Clone out the recorded response without consuming `self` — the
    /// dispatcher that builds the action keeps its own `Arc` clone
    /// alongside the one handed to the action, so `self` is never
    /// uniquely owned by the time the pipeline finishes. Panics if
    /// called before `send_response`.
    pub fn snapshot_response_parts(&self) -> (u16, Vec<(String, String)>, String) {
        let (status, body) = self
            .response
            .lock()
            .expect("response mutex poisoned")
            .clone()
            .expect("send_response was never called");
        let headers = self.out_headers.lock().expect("out_headers mutex poisoned").clone();
        (status, headers, body)
    }
}

/// No-op context used by tests that drive a pipeline with pre-buffered
/// data and don't need a real streaming body.
#[cfg(test)]
pub struct TestRequestContext {
    pub headers: Vec<(String, String)>,
    pub query: HashMap<String, String>,
    pub content_length: u64,
    pub request_id: String,
    pub object_uri: String,
    pub out_headers: Mutex<Vec<(String, String)>>,
    pub response: Mutex<Option<(u16, String)>>,
    pub buffered: BufferedInput,
}

#[cfg(test)]
impl TestRequestContext {
    pub fn new(content_length: u64, object_uri: &str) -> Self {
        TestRequestContext {
            headers: Vec::new(),
            query: HashMap::new(),
            content_length,
            request_id: "TESTREQUESTID00".to_string(),
            object_uri: object_uri.to_string(),
            out_headers: Mutex::new(Vec::new()),
            response: Mutex::new(None),
            buffered: BufferedInput::new(),
        }
    }

    /// Push the whole body at once and freeze immediately — simulates
    /// a body axum already buffered in full.
    pub fn with_full_body(self, data: Bytes) -> Self {
        self.buffered.push(data);
        self.buffered.freeze();
        self
    }

    /// Push `chunks` one at a time as `feed_more` is called, freezing
    /// after the last one — simulates a streamed body.
    pub fn feed_chunk(&self, data: Bytes) {
        self.buffered.push(data);
    }

    pub fn freeze(&self) {
        self.buffered.freeze();
    }
}

#[cfg(test)]
impl RequestContext for TestRequestContext {
    fn pause(&self) {
        self.buffered.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.buffered.paused.store(false, Ordering::SeqCst);
    }

    fn buffered_input(&self) -> &BufferedInput {
        &self.buffered
    }

    fn has_all_body_content(&self) -> bool {
        self.buffered.is_frozen()
    }

    fn header_value(&self, name: &str) -> Option<String> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| k.to_ascii_lowercase() == name)
            .map(|(_, v)| v.clone())
    }

    fn headers_copy(&self) -> Vec<(String, String)> {
        self.headers.clone()
    }

    fn query_value(&self, name: &str) -> Option<String> {
        self.query.get(name).cloned()
    }

    fn content_length(&self) -> u64 {
        self.content_length
    }

    fn request_id(&self) -> &str {
        &self.request_id
    }

    fn object_uri(&self) -> &str {
        &self.object_uri
    }

    fn set_out_header(&self, name: &str, value: String) {
        self.out_headers.lock().unwrap().push((name.to_string(), value));
    }

    fn send_response(&self, status: u16, body: String) {
        *self.response.lock().unwrap() = Some((status, body));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_for_threshold_returns_once_enough_bytes_buffered() {
        let input = BufferedInput::new();
        input.push(Bytes::from_static(b"1234"));
        // Already enough, should not block.
        tokio::time::timeout(std::time::Duration::from_millis(100), input.wait_for_threshold(4))
            .await
            .expect("should not time out");
    }

    #[tokio::test]
    async fn wait_for_threshold_returns_on_freeze_even_if_under_threshold() {
        let input = BufferedInput::new();
        input.push(Bytes::from_static(b"12"));
        input.freeze();
        tokio::time::timeout(std::time::Duration::from_millis(100), input.wait_for_threshold(100))
            .await
            .expect("freeze should unblock a waiter under threshold");
    }

    #[tokio::test]
    async fn take_drains_buffer() {
        let input = BufferedInput::new();
        input.push(Bytes::from_static(b"hello"));
        assert_eq!(input.length(), 5);
        let drained = input.take();
        assert_eq!(&drained[..], b"hello");
        assert_eq!(input.length(), 0);
    }
}
