//! Chunked blob upload.
//!
//! An upload session walks a small state machine, one step per dispatch:
//!
//! ```text
//! Init ──authorized──► Uploading ──end of data──► Committing ──committed──► Done
//!   │                      │                           │
//!   └──────────────────────┴──── error / cancel ───────┴──► Aborted
//! ```
//!
//! Blocks are pulled from a caller-supplied data source by index. A
//! zero-length block or [`BlockSource::End`] ends the data; [`BlockSource::Abort`]
//! ends it too but commits the blob as failed. Storage errors and
//! [`cancel`](UploadOrchestrator::cancel) abort the session; there is no
//! resume. Only one session runs at a time.

pub mod memory;
pub mod storage;

use std::fmt;

use bytes::Bytes;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ClientError;

pub use memory::{CommittedBlob, MemoryBlobStorage};
pub use storage::{BlobStorage, StorageError, StorageEvent, UploadRequest};

/// Most blocks a single blob may consist of.
pub const MAX_BLOCKS: u32 = 50_000;

/// What the data source returns for a block index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSource {
    Data(Bytes),
    End,
    Abort,
}

/// Final outcome of an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadResult {
    Ok,
    /// The data source aborted; the blob was committed as failed.
    Aborted,
    Cancelled,
    Failed(StorageError),
    ShuttingDown,
}

impl UploadResult {
    pub fn is_ok(&self) -> bool {
        matches!(self, UploadResult::Ok)
    }
}

impl fmt::Display for UploadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadResult::Ok => f.write_str("OK"),
            UploadResult::Aborted => f.write_str("ABORTED"),
            UploadResult::Cancelled => f.write_str("CANCELLED"),
            UploadResult::Failed(e) => write!(f, "FAILED ({e})"),
            UploadResult::ShuttingDown => f.write_str("SHUTTING_DOWN"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Init,
    Uploading,
    Committing,
    Done,
    Aborted,
}

pub type BlockSourceFn = Box<dyn FnMut(u32) -> BlockSource + Send>;
pub type UploadCallback = Box<dyn FnOnce(UploadResult) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Awaiting {
    Nothing,
    Authorization,
    Block(u32),
    Commit,
}

struct UploadSession {
    id: Uuid,
    destination: String,
    source: BlockSourceFn,
    completion: Option<UploadCallback>,
    state: UploadState,
    awaiting: Awaiting,
    next_block: u32,
    bytes_sent: u64,
    success: bool,
    cancelled: bool,
}

impl UploadSession {
    fn fail(&mut self, storage: &mut dyn BlobStorage, error: StorageError) -> Option<UploadResult> {
        warn!(session = %self.id, destination = %self.destination, %error, "upload aborted");
        storage.abort();
        self.state = UploadState::Aborted;
        Some(UploadResult::Failed(error))
    }

    /// Handles at most one storage event and issues at most one request.
    /// Returns the final result once the session is over.
    fn advance(&mut self, storage: &mut dyn BlobStorage) -> Option<UploadResult> {
        if self.cancelled {
            info!(session = %self.id, "upload cancelled");
            storage.abort();
            self.state = UploadState::Aborted;
            return Some(UploadResult::Cancelled);
        }

        if let Some(event) = storage.poll() {
            match event {
                StorageEvent::Failed(error) => return self.fail(storage, error),
                StorageEvent::UploadAuthorized if self.awaiting == Awaiting::Authorization => {
                    self.state = UploadState::Uploading;
                    self.awaiting = Awaiting::Nothing;
                }
                StorageEvent::BlockStored(index) if self.awaiting == Awaiting::Block(index) => {
                    self.awaiting = Awaiting::Nothing;
                }
                StorageEvent::Committed if self.awaiting == Awaiting::Commit => {
                    self.state = UploadState::Done;
                    info!(
                        session = %self.id,
                        destination = %self.destination,
                        blocks = self.next_block,
                        bytes = self.bytes_sent,
                        success = self.success,
                        "upload committed"
                    );
                    return Some(if self.success {
                        UploadResult::Ok
                    } else {
                        UploadResult::Aborted
                    });
                }
                other => {
                    return self.fail(
                        storage,
                        StorageError::Unavailable(format!(
                            "unexpected {other:?} while awaiting {:?}",
                            self.awaiting
                        )),
                    );
                }
            }
        }

        if self.awaiting != Awaiting::Nothing {
            return None;
        }

        match self.state {
            UploadState::Init => {
                let request = UploadRequest {
                    session_id: self.id,
                    destination: self.destination.clone(),
                };
                if let Err(error) = storage.request_upload(&request) {
                    return self.fail(storage, error);
                }
                self.awaiting = Awaiting::Authorization;
            }
            UploadState::Uploading => match (self.source)(self.next_block) {
                BlockSource::Data(block) if !block.is_empty() => {
                    if self.next_block >= MAX_BLOCKS {
                        return self.fail(storage, StorageError::TooManyBlocks(MAX_BLOCKS));
                    }
                    let index = self.next_block;
                    let len = block.len() as u64;
                    if let Err(error) = storage.put_block(index, block) {
                        return self.fail(storage, error);
                    }
                    debug!(session = %self.id, index, bytes = len, "block sent");
                    self.awaiting = Awaiting::Block(index);
                    self.next_block += 1;
                    self.bytes_sent += len;
                }
                BlockSource::Data(_) | BlockSource::End => {
                    self.state = UploadState::Committing;
                    self.success = true;
                }
                BlockSource::Abort => {
                    debug!(session = %self.id, "data source aborted upload");
                    self.state = UploadState::Committing;
                    self.success = false;
                }
            },
            UploadState::Committing => {
                if let Err(error) = storage.commit(self.success, self.next_block) {
                    return self.fail(storage, error);
                }
                self.awaiting = Awaiting::Commit;
            }
            UploadState::Done | UploadState::Aborted => {}
        }
        None
    }
}

/// Owns the storage collaborator and at most one session.
#[derive(Default)]
pub struct UploadOrchestrator {
    storage: Option<Box<dyn BlobStorage>>,
    session: Option<UploadSession>,
}

impl UploadOrchestrator {
    pub fn new(storage: Option<Box<dyn BlobStorage>>) -> Self {
        Self {
            storage,
            session: None,
        }
    }

    pub fn set_storage(&mut self, storage: Box<dyn BlobStorage>) {
        self.storage = Some(storage);
    }

    /// Starts a session. Fails while another session is active.
    pub fn start(
        &mut self,
        destination: &str,
        source: BlockSourceFn,
        completion: UploadCallback,
    ) -> Result<Uuid, ClientError> {
        if destination.trim().is_empty() {
            return Err(ClientError::InvalidArgument(
                "destination file name must not be empty".into(),
            ));
        }
        if self.storage.is_none() {
            return Err(ClientError::InvalidState(
                "no blob storage configured".into(),
            ));
        }
        if let Some(active) = &self.session {
            return Err(ClientError::InvalidState(format!(
                "upload busy with '{}'",
                active.destination
            )));
        }

        let id = Uuid::new_v4();
        info!(session = %id, destination, "upload started");
        self.session = Some(UploadSession {
            id,
            destination: destination.to_string(),
            source,
            completion: Some(completion),
            state: UploadState::Init,
            awaiting: Awaiting::Nothing,
            next_block: 0,
            bytes_sent: 0,
            success: false,
            cancelled: false,
        });
        Ok(id)
    }

    /// Marks the active session for cancellation; its callback runs on the
    /// next step. Returns false when nothing is active.
    pub fn cancel(&mut self) -> bool {
        match self.session.as_mut() {
            Some(session) => {
                session.cancelled = true;
                true
            }
            None => false,
        }
    }

    /// Advances the active session by one step.
    pub fn step(&mut self) {
        let (Some(session), Some(storage)) = (self.session.as_mut(), self.storage.as_mut()) else {
            return;
        };
        if let Some(result) = session.advance(storage.as_mut()) {
            self.finish(result);
        }
    }

    /// Aborts the active session with `ShuttingDown`.
    pub fn shutdown(&mut self) {
        if self.session.is_none() {
            return;
        }
        if let Some(storage) = self.storage.as_mut() {
            storage.abort();
        }
        self.finish(UploadResult::ShuttingDown);
    }

    fn finish(&mut self, result: UploadResult) {
        if let Some(mut session) = self.session.take() {
            if let Some(completion) = session.completion.take() {
                completion(result);
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn state(&self) -> Option<UploadState> {
        self.session.as_ref().map(|session| session.state)
    }
}

impl fmt::Debug for UploadOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadOrchestrator")
            .field("storage", &self.storage.is_some())
            .field("state", &self.state())
            .finish()
    }
}

/// Splits `data` into blocks of at most `block_size` bytes without copying.
pub fn split_blocks(data: &Bytes, block_size: usize) -> Result<Vec<Bytes>, ClientError> {
    if block_size == 0 {
        return Err(ClientError::InvalidArgument(
            "upload block size must be greater than zero".into(),
        ));
    }
    let count = data.len().div_ceil(block_size);
    if count > MAX_BLOCKS as usize {
        return Err(ClientError::InvalidArgument(format!(
            "{} bytes need {count} blocks, more than {MAX_BLOCKS}",
            data.len()
        )));
    }
    Ok((0..count)
        .map(|i| {
            let start = i * block_size;
            let end = (start + block_size).min(data.len());
            data.slice(start..end)
        })
        .collect())
}

/// A data source serving pre-split blocks.
pub fn buffer_source(blocks: Vec<Bytes>) -> BlockSourceFn {
    Box::new(move |index| match blocks.get(index as usize) {
        Some(block) => BlockSource::Data(block.clone()),
        None => BlockSource::End,
    })
}
