//! Unified backing-store client.
//!
//! The backing object service offers two families of operation against
//! one service: named key-value indexes, and raw object containers
//! addressed by a 128-bit object id and written at an explicit byte
//! offset. `ObjectStoreClient` exposes both through a single client
//! every component above it (records, actions) is written against.

pub mod memory;
pub mod sqlite;

use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// 128-bit backing-store object identifier.
///
/// Represented as a UUID since both are 128 bits and the formatting
/// (hyphenated hex) is a reasonable stand-in for a Motr `struct m0_uint128`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(uuid::Uuid);

impl ObjectId {
    /// Allocate a fresh, random oid.
    pub fn new() -> Self {
        ObjectId(uuid::Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_hyphenated())
    }
}

impl std::str::FromStr for ObjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(ObjectId(uuid::Uuid::parse_str(s)?))
    }
}

impl serde::Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Async backing-store contract: one index/key/value namespace plus
/// one raw object-container namespace.
///
/// Every method returns `Pin<Box<dyn Future<...> + Send + '_>>` rather
/// than using `async fn` in the trait, so trait objects
/// (`Arc<dyn ObjectStoreClient>`) can be stored in `AppState` without an
/// extra allocation per call site beyond the one the method already
/// performs.
pub trait ObjectStoreClient: Send + Sync + 'static {
    /// Look up `key` inside the named `index`. `Ok(None)` means the key
    /// is absent, not an error — callers use this to distinguish
    /// "missing" from "failed" per the metadata-record state machine.
    fn get_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<String>>> + Send + '_>>;

    /// Insert or overwrite `key` in `index`.
    fn put_keyval(
        &self,
        index: &str,
        key: &str,
        value: String,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Remove `key` from `index`. Idempotent: deleting an absent key is
    /// not an error.
    fn delete_keyval(
        &self,
        index: &str,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Create an empty object container at `oid`. Must be called once
    /// before the first `write_object`.
    fn create_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Write `data` into the object container at `oid`, starting at byte
    /// `offset`. The container grows to fit if `offset + data.len()`
    /// exceeds its current size; no append semantics, the caller always
    /// supplies an absolute offset.
    fn write_object(
        &self,
        oid: ObjectId,
        offset: u64,
        data: Bytes,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;

    /// Read back the full contents of the object container at `oid`.
    fn read_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Bytes>> + Send + '_>>;

    /// Delete the object container at `oid`. Idempotent.
    fn delete_object(
        &self,
        oid: ObjectId,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oid_roundtrips_through_display_and_fromstr() {
        let oid = ObjectId::new();
        let s = oid.to_string();
        let parsed: ObjectId = s.parse().unwrap();
        assert_eq!(oid, parsed);
    }

    #[test]
    fn oid_default_is_random() {
        assert_ne!(ObjectId::default(), ObjectId::default());
    }
}
