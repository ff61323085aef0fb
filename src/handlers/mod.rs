//! HTTP handlers for the bucket, multipart-upload, and object S3 API surface.

pub mod bucket;
pub mod multipart;
pub mod object;
