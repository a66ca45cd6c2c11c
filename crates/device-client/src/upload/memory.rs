//! In-memory blob storage that records what it receives.
//!
//! Requests are answered immediately by queueing the matching event. Failures
//! can be injected per stage. Clones share state, so a test keeps one handle
//! and gives another to the client.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use bytes::{Bytes, BytesMut};

use super::storage::{BlobStorage, StorageError, StorageEvent, UploadRequest};

/// A blob as it was committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedBlob {
    pub destination: String,
    pub data: Bytes,
    pub block_count: u32,
    pub success: bool,
}

#[derive(Debug, Default)]
struct Store {
    current: Option<UploadRequest>,
    blocks: Vec<(u32, Bytes)>,
    events: VecDeque<StorageEvent>,
    committed: Vec<CommittedBlob>,
    aborted: u32,
    refuse_authorization: Option<String>,
    reject_block: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStorage {
    store: Arc<Mutex<Store>>,
}

impl MemoryBlobStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes the next authorization request fail with `reason`.
    pub fn refuse_authorization(&self, reason: impl Into<String>) {
        self.store().refuse_authorization = Some(reason.into());
    }

    /// Makes the block with this index fail.
    pub fn reject_block(&self, index: u32) {
        self.store().reject_block = Some(index);
    }

    pub fn committed(&self) -> Vec<CommittedBlob> {
        self.store().committed.clone()
    }

    pub fn aborted(&self) -> u32 {
        self.store().aborted
    }

    /// Blocks received for the session in progress.
    pub fn staged_blocks(&self) -> usize {
        self.store().blocks.len()
    }
}

impl BlobStorage for MemoryBlobStorage {
    fn request_upload(&mut self, request: &UploadRequest) -> Result<(), StorageError> {
        let mut store = self.store();
        store.blocks.clear();
        store.current = Some(request.clone());
        let event = match store.refuse_authorization.take() {
            Some(reason) => StorageEvent::Failed(StorageError::NotAuthorized(reason)),
            None => StorageEvent::UploadAuthorized,
        };
        store.events.push_back(event);
        Ok(())
    }

    fn put_block(&mut self, index: u32, block: Bytes) -> Result<(), StorageError> {
        let mut store = self.store();
        if store.current.is_none() {
            return Err(StorageError::Unavailable("no upload in progress".into()));
        }
        if store.reject_block == Some(index) {
            store.events.push_back(StorageEvent::Failed(StorageError::BlockRejected {
                index,
                reason: "injected failure".into(),
            }));
            return Ok(());
        }
        store.blocks.push((index, block));
        store.events.push_back(StorageEvent::BlockStored(index));
        Ok(())
    }

    fn commit(&mut self, success: bool, block_count: u32) -> Result<(), StorageError> {
        let mut store = self.store();
        let request = store
            .current
            .take()
            .ok_or_else(|| StorageError::CommitFailed("no upload in progress".into()))?;

        let mut blocks = std::mem::take(&mut store.blocks);
        blocks.sort_by_key(|(index, _)| *index);
        let mut data = BytesMut::new();
        for (_, block) in &blocks {
            data.extend_from_slice(block);
        }

        store.committed.push(CommittedBlob {
            destination: request.destination,
            data: data.freeze(),
            block_count,
            success,
        });
        store.events.push_back(StorageEvent::Committed);
        Ok(())
    }

    fn abort(&mut self) {
        let mut store = self.store();
        store.current = None;
        store.blocks.clear();
        store.events.clear();
        store.aborted += 1;
    }

    fn poll(&mut self) -> Option<StorageEvent> {
        self.store().events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn request(name: &str) -> UploadRequest {
        UploadRequest {
            session_id: Uuid::new_v4(),
            destination: name.to_string(),
        }
    }

    #[test]
    fn test_full_session_is_recorded() {
        let handle = MemoryBlobStorage::new();
        let mut storage = handle.clone();

        storage.request_upload(&request("logs/a.txt")).unwrap();
        assert_eq!(storage.poll(), Some(StorageEvent::UploadAuthorized));

        storage.put_block(1, Bytes::from_static(b"world")).unwrap();
        storage.put_block(0, Bytes::from_static(b"hello ")).unwrap();
        storage.commit(true, 2).unwrap();

        let committed = handle.committed();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].data.as_ref(), b"hello world");
        assert_eq!(committed[0].destination, "logs/a.txt");
        assert!(committed[0].success);
    }

    #[test]
    fn test_injected_authorization_failure() {
        let handle = MemoryBlobStorage::new();
        handle.refuse_authorization("quota exceeded");
        let mut storage = handle.clone();

        storage.request_upload(&request("x")).unwrap();
        assert!(matches!(
            storage.poll(),
            Some(StorageEvent::Failed(StorageError::NotAuthorized(_)))
        ));
    }

    #[test]
    fn test_put_block_without_session() {
        let mut storage = MemoryBlobStorage::new();
        assert!(storage.put_block(0, Bytes::from_static(b"x")).is_err());
    }

    #[test]
    fn test_abort_discards_session() {
        let handle = MemoryBlobStorage::new();
        let mut storage = handle.clone();
        storage.request_upload(&request("x")).unwrap();
        storage.put_block(0, Bytes::from_static(b"x")).unwrap();

        storage.abort();
        assert_eq!(handle.aborted(), 1);
        assert_eq!(handle.staged_blocks(), 0);
        assert_eq!(storage.poll(), None);
        assert!(storage.commit(true, 1).is_err());
    }
}
