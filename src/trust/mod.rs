pub mod file_store;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::errors::Result;

/// Lifecycle of a trust relationship between two identities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Requested,
    Accepted,
    Revoked,
    Expired,
}

/// Durable evidence that `receiver_id` has granted (or is deciding whether
/// to grant) `sender_id` the right to send it artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecord {
    /// Deterministic id; see [`trust_record_id`].
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub status: TrustStatus,
    /// RFC 3339 moment the request was first seen.
    pub issued_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    /// Receiver-defined policy attached to the grant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Map<String, Value>>,
}

/// A record as handed to [`TrustStore::create`], before an id is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTrustRecord {
    pub sender_id: String,
    pub receiver_id: String,
    pub status: TrustStatus,
    pub issued_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Map<String, Value>>,
}

impl NewTrustRecord {
    pub fn into_record(self, id: String) -> TrustRecord {
        TrustRecord {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            status: self.status,
            issued_at: self.issued_at,
            decided_at: self.decided_at,
            expires_at: self.expires_at,
            policy: self.policy,
        }
    }
}

/// Partial update merged over an existing record by [`TrustStore::update`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustRecordPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TrustStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Map<String, Value>>,
}

impl TrustRecordPatch {
    pub fn apply(self, record: &mut TrustRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(decided_at) = self.decided_at {
            record.decided_at = Some(decided_at);
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = Some(expires_at);
        }
        if let Some(policy) = self.policy {
            record.policy = Some(policy);
        }
    }
}

/// Deterministic record id: lowercase hex SHA-256 over
/// `sender_id → receiver_id` (literal U+2192 separator). The same pair
/// yields the same id in every process.
pub fn trust_record_id(sender_id: &str, receiver_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(sender_id.as_bytes());
    hasher.update("→".as_bytes());
    hasher.update(receiver_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistence contract for trust records.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<TrustRecord>>;

    /// Insert a new record. The id defaults to [`trust_record_id`] of the
    /// pair; fails with `TrustStoreConflict` when that id already exists.
    async fn create(&self, record: NewTrustRecord, id: Option<String>) -> Result<TrustRecord>;

    /// Merge `patch` over the existing record; fails with
    /// `TrustStoreNotFound` when the id is unknown.
    async fn update(&self, id: &str, patch: TrustRecordPatch) -> Result<TrustRecord>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// All records, optionally filtered to one receiver.
    async fn get_all(&self, receiver_id: Option<&str>) -> Result<Vec<TrustRecord>>;

    /// Force any pending write to disk now.
    async fn flush_now(&self) -> Result<()>;

    /// Flush, then re-read the backing file, picking up external changes.
    async fn flush_and_reload(&self) -> Result<()>;
}
