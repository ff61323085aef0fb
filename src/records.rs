//! Metadata records and their JSON-backed persistence against the
//! unified object store.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::store::{ObjectId, ObjectStoreClient};

/// Every metadata record moves through this state machine on each
/// `load`/`save`/`remove` call, and the PutPart pipeline's final
/// response is chosen purely by inspecting these states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Initial state, no lookup performed yet.
    Empty,
    /// Loaded successfully and present in the store.
    Present,
    /// Looked up, but absent from the store.
    Missing,
    /// Written successfully.
    Saved,
    /// Removed successfully.
    Deleted,
    /// The store operation itself errored (not just "not found").
    Failed,
    /// Placeholder state: no operation should be performed on this
    /// record (e.g. a part record constructed but never needed,
    /// because part_number == 1 skips `fetch_firstpart_info`).
    Invalid,
}

/// Fixed index all bucket records live under.
pub const BUCKETS_INDEX: &str = "Buckets";

/// Fixed index SigV4 credentials live under, keyed by access key ID.
pub const CREDENTIALS_INDEX: &str = "Credentials";

pub fn bucket_object_index_name(bucket: &str) -> String {
    format!("BUCKET/{bucket}")
}

pub fn multipart_index_name(bucket: &str) -> String {
    format!("BUCKET/{bucket}/Multipart")
}

/// The key a part record is stored under within a bucket's multipart
/// index, alongside the upload's own descriptor (which is keyed by
/// object name alone).
pub fn part_record_key(object_key: &str, upload_id: &str, part_number: u32) -> String {
    format!("{object_key}/{upload_id}/{part_number}")
}

// ── ACL types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalUser {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AclGrantee {
    CanonicalUser(CanonicalUser),
    Group { uri: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclGrant {
    pub grantee: AclGrantee,
    pub permission: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AclOwner {
    pub id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Acl {
    pub owner: AclOwner,
    pub grants: Vec<AclGrant>,
}

impl Acl {
    /// A single `FULL_CONTROL` grant back to the owner, the default ACL
    /// every freshly created bucket/object/part starts with.
    pub fn full_control(owner_id: &str, owner_display_name: &str) -> Self {
        Acl {
            owner: AclOwner {
                id: owner_id.to_string(),
                display_name: owner_display_name.to_string(),
            },
            grants: vec![AclGrant {
                grantee: AclGrantee::CanonicalUser(CanonicalUser {
                    id: owner_id.to_string(),
                    display_name: owner_display_name.to_string(),
                }),
                permission: "FULL_CONTROL".to_string(),
            }],
        }
    }
}

/// Builds the default ACL JSON string for a freshly created record:
/// sole ownership, full control, no other grants.
pub fn create_default_acl(owner_id: &str, owner_display_name: &str) -> String {
    serde_json::to_string(&Acl::full_control(owner_id, owner_display_name))
        .expect("Acl serializes infallibly")
}

// ── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRecord {
    pub bucket_name: String,
    pub creation_date: String,
    pub acl: Acl,
}

impl BucketRecord {
    pub async fn load(
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
    ) -> anyhow::Result<(RecordState, Option<BucketRecord>)> {
        match store.get_keyval(BUCKETS_INDEX, bucket).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Ok((RecordState::Present, Some(record))),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Ok((RecordState::Missing, None)),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, store: &Arc<dyn ObjectStoreClient>) -> anyhow::Result<RecordState> {
        let json = serde_json::to_string(self)?;
        store.put_keyval(BUCKETS_INDEX, &self.bucket_name, json).await?;
        Ok(RecordState::Saved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUploadRecord {
    pub bucket_name: String,
    pub object_key: String,
    pub upload_id: String,
    /// Backing-store object id that part-write data is streamed into.
    pub oid: ObjectId,
    pub created_at: String,
    pub user_metadata: std::collections::BTreeMap<String, String>,
}

impl MultipartUploadRecord {
    /// Load the multipart descriptor keyed by `object_key` from
    /// `bucket`'s multipart index.
    pub async fn load(
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
        object_key: &str,
    ) -> anyhow::Result<(RecordState, Option<MultipartUploadRecord>)> {
        let index = multipart_index_name(bucket);
        match store.get_keyval(&index, object_key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Ok((RecordState::Present, Some(record))),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Ok((RecordState::Missing, None)),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, store: &Arc<dyn ObjectStoreClient>) -> anyhow::Result<RecordState> {
        let index = multipart_index_name(&self.bucket_name);
        let json = serde_json::to_string(self)?;
        store.put_keyval(&index, &self.object_key, json).await?;
        Ok(RecordState::Saved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartRecord {
    pub upload_id: String,
    pub part_number: u32,
    pub content_length: u64,
    /// Quoted hex MD5, used directly as the response ETag.
    pub md5: String,
    pub user_metadata: std::collections::BTreeMap<String, String>,
}

impl PartRecord {
    /// Load the record for `part_number` (used by `fetch_firstpart_info`
    /// to look up part 1's record when writing part k > 1).
    pub async fn load(
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
        object_key: &str,
        upload_id: &str,
        part_number: u32,
    ) -> anyhow::Result<(RecordState, Option<PartRecord>)> {
        let index = multipart_index_name(bucket);
        let key = part_record_key(object_key, upload_id, part_number);
        match store.get_keyval(&index, &key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Ok((RecordState::Present, Some(record))),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Ok((RecordState::Missing, None)),
            Err(e) => Err(e),
        }
    }

    pub async fn save(
        &self,
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
        object_key: &str,
    ) -> anyhow::Result<RecordState> {
        let index = multipart_index_name(bucket);
        let key = part_record_key(object_key, &self.upload_id, self.part_number);
        let json = serde_json::to_string(self)?;
        store.put_keyval(&index, &key, json).await?;
        Ok(RecordState::Saved)
    }
}

/// A completed object, written by the (non-core) GetObject/assembly
/// supporting surface so integration tests can read back what PutPart
/// wrote. Not part of the core action pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub bucket_name: String,
    pub object_key: String,
    pub oid: ObjectId,
    pub size: u64,
    pub etag: String,
    pub last_modified: String,
    pub acl: Acl,
}

impl ObjectRecord {
    pub async fn load(
        store: &Arc<dyn ObjectStoreClient>,
        bucket: &str,
        object_key: &str,
    ) -> anyhow::Result<(RecordState, Option<ObjectRecord>)> {
        let index = bucket_object_index_name(bucket);
        match store.get_keyval(&index, object_key).await {
            Ok(Some(json)) => match serde_json::from_str(&json) {
                Ok(record) => Ok((RecordState::Present, Some(record))),
                Err(e) => Err(e.into()),
            },
            Ok(None) => Ok((RecordState::Missing, None)),
            Err(e) => Err(e),
        }
    }

    pub async fn save(&self, store: &Arc<dyn ObjectStoreClient>) -> anyhow::Result<RecordState> {
        let index = bucket_object_index_name(&self.bucket_name);
        let json = serde_json::to_string(self)?;
        store.put_keyval(&index, &self.object_key, json).await?;
        Ok(RecordState::Saved)
    }
}

/// Load a credential by access key ID from [`CREDENTIALS_INDEX`].
pub async fn load_credential(
    store: &Arc<dyn ObjectStoreClient>,
    access_key_id: &str,
) -> anyhow::Result<Option<crate::auth::Credential>> {
    match store.get_keyval(CREDENTIALS_INDEX, access_key_id).await? {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}

/// Insert or update a credential, keyed by its access key ID.
pub async fn save_credential(
    store: &Arc<dyn ObjectStoreClient>,
    credential: &crate::auth::Credential,
) -> anyhow::Result<()> {
    let json = serde_json::to_string(credential)?;
    store
        .put_keyval(CREDENTIALS_INDEX, &credential.access_key_id, json)
        .await
}
