//! Direct method dispatch.
//!
//! An invocation from the hub is handed to the registered callback together
//! with a [`ResponseHandle`]. The application answers through
//! `DeviceClient::device_method_response`, immediately or on a later dispatch;
//! each handle is good for exactly one response.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{error::ClientError, transport::MethodRequestId};

/// Status sent for methods nobody handles.
pub const METHOD_NOT_FOUND: i32 = 404;

/// Body sent with [`METHOD_NOT_FOUND`].
pub const METHOD_NOT_FOUND_BODY: &[u8] = b"{\"message\":\"method not found\"}";

/// Opaque token for answering one method invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseHandle(u64);

impl fmt::Display for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct MethodInvocation {
    pub name: String,
    pub payload: Bytes,
    pub handle: ResponseHandle,
}

pub type MethodCallback = Box<dyn FnMut(MethodInvocation) + Send>;

#[derive(Debug, Clone, PartialEq)]
pub struct MethodResponse {
    pub request_id: MethodRequestId,
    pub status: i32,
    pub payload: Bytes,
}

#[derive(Default)]
pub struct MethodDispatcher {
    last_handle: u64,
    awaiting: HashMap<ResponseHandle, MethodRequestId>,
    responses: VecDeque<MethodResponse>,
    callback: Option<MethodCallback>,
}

impl MethodDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_callback(&mut self, callback: MethodCallback) {
        self.callback = Some(callback);
    }

    pub fn clear_callback(&mut self) {
        self.callback = None;
    }

    /// Runs the callback for an inbound invocation. Returns false when no
    /// callback is registered; the caller then answers with
    /// [`METHOD_NOT_FOUND`].
    pub fn invoke(&mut self, request_id: MethodRequestId, name: String, payload: Bytes) -> bool {
        let Some(callback) = self.callback.as_mut() else {
            warn!(method = %name, "no method callback registered");
            return false;
        };

        self.last_handle += 1;
        let handle = ResponseHandle(self.last_handle);
        self.awaiting.insert(handle, request_id);
        debug!(method = %name, %handle, "method invoked");

        callback(MethodInvocation {
            name,
            payload,
            handle,
        });
        true
    }

    /// Records the answer for `handle`. A handle that was already answered or
    /// never issued is rejected.
    pub fn respond(
        &mut self,
        handle: ResponseHandle,
        status: i32,
        payload: Bytes,
    ) -> Result<(), ClientError> {
        let request_id = self.awaiting.remove(&handle).ok_or_else(|| {
            ClientError::InvalidState(format!("{handle} is unknown or already answered"))
        })?;
        self.responses.push_back(MethodResponse {
            request_id,
            status,
            payload,
        });
        Ok(())
    }

    /// Queues a response that was not tied to a handle.
    pub fn push_response(&mut self, response: MethodResponse) {
        self.responses.push_back(response);
    }

    pub fn front(&self) -> Option<&MethodResponse> {
        self.responses.front()
    }

    pub fn pop_front(&mut self) -> Option<MethodResponse> {
        self.responses.pop_front()
    }

    /// Forgets every open invocation and unsent response.
    pub fn shutdown(&mut self) {
        if !self.awaiting.is_empty() || !self.responses.is_empty() {
            debug!(
                awaiting = self.awaiting.len(),
                unsent = self.responses.len(),
                "discarding method state"
            );
        }
        self.awaiting.clear();
        self.responses.clear();
    }
}

impl fmt::Debug for MethodDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDispatcher")
            .field("awaiting", &self.awaiting.len())
            .field("responses", &self.responses.len())
            .field("callback", &self.callback.is_some())
            .finish()
    }
}
