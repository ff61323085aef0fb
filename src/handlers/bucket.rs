//! Bucket-level S3 API handlers.
//!
//! `CreateBucket` validates the requested name, creates the bucket
//! idempotently if it doesn't already exist, and grants the caller
//! full control over it.

use std::sync::Arc;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use garde::Validate;

use crate::errors::S3Error;
use crate::records::{Acl, BucketRecord, RecordState};
use crate::AppState;

// -- Bucket name validation ---------------------------------------------------

/// Declarative length/charset check, enforced via `garde` ahead of the
/// manual rules below (which cover what a regex can't: IP-literal
/// shapes, reserved suffixes).
#[derive(Debug, garde::Validate)]
pub struct BucketNameInput {
    #[garde(length(min = 3, max = 63), pattern(r"^[a-z0-9][a-z0-9.\-]*[a-z0-9]$"))]
    pub bucket_name: String,
}

/// Validate that a bucket name conforms to S3 naming rules.
///
/// Rules:
/// - 3-63 characters long
/// - Only lowercase letters, numbers, hyphens, and periods
/// - Must begin and end with a letter or number
/// - Cannot be formatted as an IP address (e.g., 192.168.5.4)
/// - Must not start with `xn--` or end with `-s3alias` or `--ol-s3`
pub fn validate_bucket_name(name: &str) -> Result<(), S3Error> {
    let input = BucketNameInput {
        bucket_name: name.to_string(),
    };
    if input.validate().is_err() {
        return Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        });
    }

    if looks_like_ip(name) {
        return Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        });
    }

    if name.starts_with("xn--") {
        return Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        });
    }

    if name.ends_with("-s3alias") || name.ends_with("--ol-s3") {
        return Err(S3Error::InvalidBucketName {
            name: name.to_string(),
        });
    }

    Ok(())
}

/// Check whether a string looks like an IPv4 address (e.g., "192.168.5.4").
fn looks_like_ip(s: &str) -> bool {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return false;
    }
    parts.iter().all(|p| p.parse::<u8>().is_ok())
}

/// RFC 3339 / S3-style millisecond timestamp, e.g.
/// `2026-01-01T00:00:00.000Z`.
pub fn now_iso8601() -> String {
    let now = std::time::SystemTime::now();
    let since_epoch = now
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = since_epoch.as_secs();
    let millis = since_epoch.subsec_millis();

    let days = secs / 86400;
    let day_secs = secs % 86400;
    let hours = day_secs / 3600;
    let minutes = (day_secs % 3600) / 60;
    let seconds = day_secs % 60;

    let (year, month, day) = days_to_ymd(days);

    format!("{year:04}-{month:02}-{day:02}T{hours:02}:{minutes:02}:{seconds:02}.{millis:03}Z")
}

/// Convert days since Unix epoch to (year, month, day).
fn days_to_ymd(days: u64) -> (i32, u32, u32) {
    let z = days as i64 + 719468;
    let era = if z >= 0 { z } else { z - 146096 } / 146097;
    let doe = (z - era * 146097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if m <= 2 { y + 1 } else { y };
    (year as i32, m as u32, d as u32)
}

// -- Handlers -----------------------------------------------------------------

/// `PUT /{bucket}` -- Create a new bucket.
///
/// us-east-1-style behavior: creating a bucket you already own returns
/// 200 with a `Location` header instead of an error.
pub async fn create_bucket(state: Arc<AppState>, bucket: &str) -> Result<Response, S3Error> {
    validate_bucket_name(bucket)?;

    let (existing_state, _) = BucketRecord::load(&state.store, bucket).await?;
    let location = format!("/{bucket}");

    if existing_state == RecordState::Present {
        let mut response = (StatusCode::OK, "").into_response();
        response
            .headers_mut()
            .insert("location", HeaderValue::from_str(&location).unwrap());
        return Ok(response);
    }

    let owner_id = state.config.auth.access_key.clone();
    let record = BucketRecord {
        bucket_name: bucket.to_string(),
        creation_date: now_iso8601(),
        acl: Acl::full_control(&owner_id, &owner_id),
    };
    record.save(&state.store).await?;

    let mut response = (StatusCode::OK, "").into_response();
    response
        .headers_mut()
        .insert("location", HeaderValue::from_str(&location).unwrap());
    Ok(response)
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_bucket_name_valid() {
        assert!(validate_bucket_name("valid-bucket").is_ok());
        assert!(validate_bucket_name("my.bucket.name").is_ok());
        assert!(validate_bucket_name("abc").is_ok());
    }

    #[test]
    fn test_validate_bucket_name_too_short() {
        assert!(validate_bucket_name("ab").is_err());
    }

    #[test]
    fn test_validate_bucket_name_too_long() {
        let name = "a".repeat(64);
        assert!(validate_bucket_name(&name).is_err());
    }

    #[test]
    fn test_validate_bucket_name_uppercase_rejected() {
        assert!(validate_bucket_name("MyBucket").is_err());
    }

    #[test]
    fn test_validate_bucket_name_starts_with_hyphen_rejected() {
        assert!(validate_bucket_name("-mybucket").is_err());
    }

    #[test]
    fn test_validate_bucket_name_ip_literal_rejected() {
        assert!(validate_bucket_name("192.168.5.4").is_err());
    }

    #[test]
    fn test_validate_bucket_name_xn_prefix_rejected() {
        assert!(validate_bucket_name("xn--bucket").is_err());
    }

    #[test]
    fn test_validate_bucket_name_s3alias_suffix_rejected() {
        assert!(validate_bucket_name("mybucket-s3alias").is_err());
    }

    #[tokio::test]
    async fn create_bucket_then_recreate_returns_ok_not_conflict() {
        use crate::config::Config;
        use crate::store::memory::MemoryObjectStore;

        let config: Config = serde_yaml::from_str("{}").unwrap();
        let state = Arc::new(AppState {
            config,
            store: Arc::new(MemoryObjectStore::new()),
            auth_cache: crate::auth::AuthCache::new(),
        });

        let first = create_bucket(state.clone(), "my-bucket").await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let second = create_bucket(state, "my-bucket").await.unwrap();
        assert_eq!(second.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn create_bucket_rejects_invalid_name() {
        use crate::config::Config;
        use crate::store::memory::MemoryObjectStore;

        let config: Config = serde_yaml::from_str("{}").unwrap();
        let state = Arc::new(AppState {
            config,
            store: Arc::new(MemoryObjectStore::new()),
            auth_cache: crate::auth::AuthCache::new(),
        });

        let err = create_bucket(state, "AB").await.unwrap_err();
        assert!(matches!(err, S3Error::InvalidBucketName { .. }));
    }
}
