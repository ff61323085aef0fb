//! Axum router construction and S3 route mapping.
//!
//! The [`app`] function wires the supporting S3 surface to its handlers
//! and returns a ready-to-serve [`axum::Router`]. S3 distinguishes
//! operations by query parameters, not just path+method — `PUT
//! /:bucket/*key` is UploadPart with `?partNumber=&uploadId=` and
//! CreateMultipartUpload lives on `POST /:bucket/*key?uploads` — so one
//! handler per method+path dispatches internally on the query string.

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, RawQuery, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use sha2::Digest;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::auth;
use crate::errors::{generate_request_id, S3Error};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::AppState;

/// Build the axum [`Router`] with the supporting S3-compatible routes.
///
/// Routes are conditionally registered based on `config.observability`.
pub fn app(state: Arc<AppState>) -> Router {
    let metrics_enabled = state.config.observability.metrics;
    let health_check_enabled = state.config.observability.health_check;

    // Phase 1: build the stateful router (Router<Arc<AppState>>).
    let mut stateful = Router::new().route("/health", get(health_check));

    if metrics_enabled {
        stateful = stateful.route("/metrics", get(metrics_handler));
    }

    if health_check_enabled {
        stateful = stateful
            .route("/healthz", get(healthz_handler))
            .route("/readyz", get(readyz_handler));
    }

    stateful = stateful
        .route("/:bucket", put(handle_put_bucket))
        .route("/:bucket/*key", get(handle_get_object))
        .route("/:bucket/*key", put(handle_put_object))
        .route("/:bucket/*key", post(handle_post_object));

    // Phase 2: apply state and layers (converts to Router<()>).
    let mut router = stateful
        .with_state(state.clone())
        // Layer ordering: inner layers run first, outer layers wrap them.
        // auth_middleware is innermost (closest to handlers, after routing).
        .layer(middleware::from_fn_with_state(state, auth_middleware))
        // common_headers_middleware is next (adds standard S3 headers).
        .layer(middleware::from_fn(common_headers_middleware));

    // metrics_middleware is outer (captures full request lifecycle) -- conditional.
    if metrics_enabled {
        router = router.layer(middleware::from_fn(metrics_middleware));
    }

    // Disable the default 2MB body size limit (parts can be large).
    router.layer(DefaultBodyLimit::disable())
}

// -- Common headers middleware -----------------------------------------------

/// Tower middleware that adds common S3 response headers to every response:
/// - `x-amz-request-id`: 16-character uppercase hex string
/// - `x-amz-id-2`: Base64-encoded 24-byte random value (extended request ID)
/// - `Date`: RFC 7231 formatted timestamp
/// - `Server`: `ClovisGate`
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    if !headers.contains_key("x-amz-request-id") {
        let request_id = generate_request_id();
        headers.insert(
            "x-amz-request-id",
            HeaderValue::from_str(&request_id).unwrap(),
        );
    }

    if !headers.contains_key("x-amz-id-2") {
        let random_bytes: [u8; 24] = rand::random();
        let id2 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, random_bytes);
        headers.insert("x-amz-id-2", HeaderValue::from_str(&id2).unwrap());
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    headers.insert("date", HeaderValue::from_str(&date).unwrap());
    headers.insert("server", HeaderValue::from_static("ClovisGate"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that bypass authentication.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/healthz", "/readyz", "/metrics"];

/// SigV4 authentication middleware.
///
/// Runs before handlers. Detects auth type (header, presigned, or none),
/// looks up credentials in the unified store (via [`auth::AuthCache`]
/// first), and verifies the signature. Returns `AccessDenied`,
/// `InvalidAccessKeyId`, or `SignatureDoesNotMatch` on failure.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, S3Error> {
    let path = req.uri().path().to_string();

    if AUTH_SKIP_PATHS.iter().any(|skip| path == *skip) {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let query_string = req.uri().query().unwrap_or("").to_string();

    let auth_type = match auth::detect_auth_type(auth_header.as_deref(), &query_string) {
        Ok(t) => t,
        Err(msg) => {
            warn!("Auth detection error: {}", msg);
            return Err(S3Error::AccessDenied { message: msg });
        }
    };

    match auth_type {
        auth::AuthType::None => {
            return Err(S3Error::AccessDenied {
                message: "No authentication information provided".to_string(),
            });
        }
        auth::AuthType::Header(parsed) => {
            let credential = load_credential_cached(&state, &parsed.access_key_id).await?;

            let amz_date = req
                .headers()
                .get("x-amz-date")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if !amz_date.is_empty() && !auth::check_clock_skew(amz_date) {
                warn!(
                    "Clock skew too large for access key {}: {}",
                    parsed.access_key_id, amz_date
                );
                return Err(S3Error::RequestTimeTooSkewed);
            }

            if !amz_date.is_empty() && amz_date.len() >= 8 && parsed.date_stamp != amz_date[..8] {
                return Err(S3Error::AccessDenied {
                    message: "Credential date does not match x-amz-date".to_string(),
                });
            }

            let headers = auth::extract_headers_for_signing(req.headers());

            let has_content_sha256 = req.headers().contains_key("x-amz-content-sha256");
            let payload_hash = if has_content_sha256 {
                req.headers()
                    .get("x-amz-content-sha256")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("UNSIGNED-PAYLOAD")
                    .to_string()
            } else {
                // No content-sha256 header: read the body, compute SHA256,
                // and reconstruct the request with the same bytes so the
                // handler still sees them.
                let (parts, body) = req.into_parts();
                let body_bytes = axum::body::to_bytes(body, usize::MAX)
                    .await
                    .unwrap_or_default();
                let hash = hex::encode(sha2::Sha256::digest(&body_bytes));
                req = Request::from_parts(parts, axum::body::Body::from(body_bytes));
                hash
            };

            let signing_key = derive_signing_key_cached(&state, &credential, &parsed.date_stamp, &parsed.region, &parsed.service);

            let method = req.method().as_str().to_string();
            let uri = req.uri().path().to_string();

            let canonical_request = auth::build_canonical_request(
                &method,
                &uri,
                &query_string,
                &headers,
                &parsed.signed_headers,
                &payload_hash,
            );

            let timestamp = auth::find_header_value_pub(&headers, "x-amz-date")
                .or_else(|| auth::find_header_value_pub(&headers, "date"))
                .unwrap_or_default();

            let string_to_sign =
                auth::build_string_to_sign(timestamp, &parsed.credential_scope, &canonical_request);

            let computed = auth::compute_signature(&signing_key, &string_to_sign);
            let valid = auth::constant_time_eq(&computed, &parsed.signature);

            if !valid {
                debug!("Signature mismatch for access key {}", parsed.access_key_id);
                return Err(S3Error::SignatureDoesNotMatch);
            }

            debug!("Auth OK for access key {}", parsed.access_key_id);
        }
        auth::AuthType::Presigned(parsed) => {
            let credential = load_credential_cached(&state, &parsed.access_key_id).await?;

            if !auth::check_presigned_expiration(&parsed.amz_date, parsed.expires) {
                warn!(
                    "Presigned URL expired for access key {}",
                    parsed.access_key_id
                );
                return Err(S3Error::AccessDenied {
                    message: "Request has expired".to_string(),
                });
            }

            let signing_key = derive_signing_key_cached(&state, &credential, &parsed.date_stamp, &parsed.region, &parsed.service);

            let headers = auth::extract_headers_for_signing(req.headers());

            let method = req.method().as_str().to_string();
            let uri = req.uri().path().to_string();

            let canonical_request = auth::build_canonical_request(
                &method,
                &uri,
                &query_string,
                &headers,
                &parsed.signed_headers,
                "UNSIGNED-PAYLOAD",
            );

            let string_to_sign = auth::build_string_to_sign(
                &parsed.amz_date,
                &parsed.credential_scope,
                &canonical_request,
            );

            let computed = auth::compute_signature(&signing_key, &string_to_sign);
            let valid = auth::constant_time_eq(&computed, &parsed.signature);

            if !valid {
                debug!(
                    "Presigned signature mismatch for access key {}",
                    parsed.access_key_id
                );
                return Err(S3Error::SignatureDoesNotMatch);
            }

            debug!("Presigned auth OK for access key {}", parsed.access_key_id);
        }
    }

    Ok(next.run(req).await)
}

/// Resolve a credential by access key ID: cache first, then the
/// unified store, populating the cache on a miss.
async fn load_credential_cached(
    state: &Arc<AppState>,
    access_key_id: &str,
) -> Result<auth::Credential, S3Error> {
    if let Some(cached) = state.auth_cache.get_credential(access_key_id) {
        return Ok(cached);
    }
    let loaded = crate::records::load_credential(&state.store, access_key_id)
        .await
        .map_err(S3Error::InternalError)?;
    match loaded {
        Some(c) => {
            state.auth_cache.put_credential(access_key_id, c.clone());
            Ok(c)
        }
        None => {
            debug!("Unknown access key: {}", access_key_id);
            Err(S3Error::InvalidAccessKeyId)
        }
    }
}

/// Derive (or fetch from cache) the SigV4 signing key for a credential.
fn derive_signing_key_cached(
    state: &Arc<AppState>,
    credential: &auth::Credential,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    if let Some(cached) =
        state
            .auth_cache
            .get_signing_key(&credential.secret_key, date_stamp, region, service)
    {
        return cached;
    }
    let derived = auth::derive_signing_key(&credential.secret_key, date_stamp, region, service);
    state.auth_cache.put_signing_key(
        &credential.secret_key,
        date_stamp,
        region,
        service,
        derived.clone(),
    );
    derived
}

// -- Health check endpoints ---------------------------------------------------

/// `GET /health` -- Returns JSON health status with a backing-store probe.
///
/// When `observability.health_check` is enabled, performs a round-trip
/// keyval write+read against the backing store. When disabled, returns
/// a static `{"status":"ok"}` response. Returns 503 with
/// `"status":"degraded"` if the probe fails.
async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.config.observability.health_check {
        return (StatusCode::OK, Json(serde_json::json!({"status": "ok"})));
    }

    let start = Instant::now();
    let store_ok = probe_store(&state).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    let status_str = if store_ok { "ok" } else { "degraded" };
    let http_status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let store_check = if store_ok {
        serde_json::json!({"status": "ok", "latency_ms": latency_ms})
    } else {
        serde_json::json!({"status": "error", "latency_ms": latency_ms})
    };

    let body = serde_json::json!({
        "status": status_str,
        "checks": {"store": store_check},
    });

    (http_status, Json(body))
}

/// `GET /healthz` -- Kubernetes liveness probe.
///
/// Returns 200 with empty body. Confirms the process is running.
async fn healthz_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// `GET /readyz` -- Kubernetes readiness probe.
///
/// Probes the backing store. Returns 200 if the probe passes, 503
/// otherwise. Empty body in both cases.
async fn readyz_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if probe_store(&state).await {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Round-trip a keyval write+read against a fixed health-check index
/// to confirm the backing store is actually reachable, not just that
/// the process is up.
async fn probe_store(state: &Arc<AppState>) -> bool {
    state
        .store
        .put_keyval("__health__", "probe", "ok".to_string())
        .await
        .is_ok()
        && state.store.get_keyval("__health__", "probe").await.is_ok()
}

// -- Query parameter parsing helper ------------------------------------------

/// Parse raw query string into a HashMap.
fn parse_query(raw: Option<String>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(qs) = raw {
        for part in qs.split('&') {
            if let Some((k, v)) = part.split_once('=') {
                let decoded_k = percent_encoding::percent_decode_str(k)
                    .decode_utf8_lossy()
                    .into_owned();
                let decoded_v = percent_encoding::percent_decode_str(v)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded_k, decoded_v);
            } else if !part.is_empty() {
                let decoded = percent_encoding::percent_decode_str(part)
                    .decode_utf8_lossy()
                    .into_owned();
                map.insert(decoded, String::new());
            }
        }
    }
    map
}

// -- Bucket-level dispatch ---------------------------------------------------

/// `PUT /:bucket` -- CreateBucket.
async fn handle_put_bucket(
    State(state): State<Arc<AppState>>,
    Path(bucket): Path<String>,
) -> Result<Response, S3Error> {
    crate::handlers::bucket::create_bucket(state, &bucket).await
}

// -- Object-level dispatch ---------------------------------------------------

/// `GET /:bucket/*key` -- GetObject.
async fn handle_get_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
) -> Result<Response, S3Error> {
    crate::handlers::object::get_object(state, &bucket, &key).await
}

/// `PUT /:bucket/*key` -- dispatches based on query params:
/// - `?partNumber=...&uploadId=...` -> UploadPart
/// - anything else -> NotImplemented
async fn handle_put_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    let part_number = query.get("partNumber").and_then(|v| v.parse::<u32>().ok());
    let upload_id = query.get("uploadId").cloned();

    match (part_number, upload_id) {
        (Some(part_number), Some(upload_id)) => {
            crate::handlers::multipart::upload_part(
                state,
                &bucket,
                &key,
                part_number,
                &upload_id,
                headers,
                query,
                body,
            )
            .await
        }
        _ => Err(S3Error::NotImplemented),
    }
}

/// `POST /:bucket/*key` -- dispatches based on query params:
/// - `?uploads` -> CreateMultipartUpload
/// - anything else -> NotImplemented
async fn handle_post_object(
    State(state): State<Arc<AppState>>,
    Path((bucket, key)): Path<(String, String)>,
    RawQuery(raw_query): RawQuery,
    headers: HeaderMap,
) -> Result<Response, S3Error> {
    let query = parse_query(raw_query);

    if query.contains_key("uploads") {
        crate::handlers::multipart::create_multipart_upload(state, &bucket, &key, &headers).await
    } else {
        Err(S3Error::NotImplemented)
    }
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::memory::MemoryObjectStore;
    use axum::body::Body;
    use http::Request as HttpRequest;
    use tower::ServiceExt;

    /// Create a test `AppState` with an in-memory backing store.
    fn test_state(metrics: bool, health_check: bool) -> Arc<AppState> {
        let mut config: Config = serde_yaml::from_str("{}").expect("failed to parse empty config");
        config.observability.metrics = metrics;
        config.observability.health_check = health_check;

        Arc::new(AppState {
            config,
            store: Arc::new(MemoryObjectStore::new()),
            auth_cache: crate::auth::AuthCache::new(),
        })
    }

    #[tokio::test]
    async fn test_healthz_returns_200_empty_body() {
        let state = test_state(true, true);
        let router = app(state);

        let req = HttpRequest::builder()
            .uri("/healthz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_returns_200_when_store_is_up() {
        let state = test_state(true, true);
        let router = app(state);

        let req = HttpRequest::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readyz_route_absent_when_health_check_disabled() {
        let state = test_state(true, false);
        let router = app(state);

        let req = HttpRequest::builder()
            .uri("/readyz")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_returns_static_ok_when_health_check_disabled() {
        let state = test_state(true, false);
        let router = app(state);

        let req = HttpRequest::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_route_absent_when_disabled() {
        let state = test_state(false, true);
        let router = app(state);

        let req = HttpRequest::builder()
            .uri("/metrics")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unauthenticated_put_bucket_is_access_denied() {
        let state = test_state(true, true);
        let router = app(state);

        let req = HttpRequest::builder()
            .method("PUT")
            .uri("/my-bucket")
            .body(Body::empty())
            .unwrap();
        let response = router.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_parse_query_handles_valueless_and_valued_params() {
        let query = parse_query(Some("uploads&partNumber=3".to_string()));
        assert_eq!(query.get("uploads"), Some(&String::new()));
        assert_eq!(query.get("partNumber"), Some(&"3".to_string()));
    }
}
