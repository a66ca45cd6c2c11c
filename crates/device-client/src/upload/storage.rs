//! Blob storage collaborator.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// Errors reported by blob storage, either synchronously or through
/// [`StorageEvent::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The hub refused to hand out upload credentials.
    #[error("Upload not authorized: {0}")]
    NotAuthorized(String),

    #[error("Block {index} rejected: {reason}")]
    BlockRejected { index: u32, reason: String },

    #[error("Commit failed: {0}")]
    CommitFailed(String),

    /// The data source produced more blocks than a blob may hold.
    #[error("Blob exceeds {0} blocks")]
    TooManyBlocks(u32),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Describes the blob a session writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub session_id: Uuid,
    pub destination: String,
}

/// Asynchronous outcomes reported by [`BlobStorage::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageEvent {
    UploadAuthorized,
    BlockStored(u32),
    Committed,
    Failed(StorageError),
}

/// Non-blocking access to blob storage. Each request returns at once and its
/// completion is reported later through `poll`.
pub trait BlobStorage: Send {
    /// Obtains credentials for writing `request.destination`.
    fn request_upload(&mut self, request: &UploadRequest) -> Result<(), StorageError>;

    fn put_block(&mut self, index: u32, block: Bytes) -> Result<(), StorageError>;

    /// Finishes the blob. `success == false` tells the hub the upload failed.
    fn commit(&mut self, success: bool, block_count: u32) -> Result<(), StorageError>;

    /// Drops the current session without committing.
    fn abort(&mut self);

    fn poll(&mut self) -> Option<StorageEvent>;
}
