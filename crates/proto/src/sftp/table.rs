//! Outstanding-request table.
//!
//! One live slot per outstanding request id. The reader task is the only
//! producer; the operation caller awaiting the oneshot receiver is the
//! only consumer. Completion removes the slot, so a slot is fulfilled at
//! most once.

use crate::sftp::message::Response;
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

/// Why every outstanding request was failed.
///
/// Latched into the table so requests registered after the failure are
/// rejected with the same cause instead of hanging.
#[derive(Debug, Clone)]
pub(crate) enum FailureCause {
    /// The underlying stream failed or closed
    Transport(String),
    /// The peer violated the protocol
    Protocol(String),
    /// The engine was closed locally
    Closed,
}

impl FailureCause {
    fn to_error(&self) -> SkiffError {
        match self {
            FailureCause::Transport(msg) => SkiffError::Transport(msg.clone()),
            FailureCause::Protocol(msg) => SkiffError::Protocol(msg.clone()),
            FailureCause::Closed => SkiffError::Closed,
        }
    }
}

struct Inner {
    slots: HashMap<u32, oneshot::Sender<SkiffResult<Response>>>,
    failure: Option<FailureCause>,
}

/// Thread-safe map from request id to its single-assignment response slot.
pub(crate) struct RequestTable {
    inner: Mutex<Inner>,
}

impl RequestTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: HashMap::new(),
                failure: None,
            }),
        }
    }

    /// Inserts a fresh pending slot for `id`.
    ///
    /// Fails if the table has latched a failure, or if `id` collides with
    /// a live slot (the id counter wrapped into an outstanding request).
    pub(crate) fn register(&self, id: u32) -> SkiffResult<oneshot::Receiver<SkiffResult<Response>>> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(cause) = &inner.failure {
            return Err(cause.to_error());
        }
        if inner.slots.contains_key(&id) {
            return Err(SkiffError::Protocol(format!(
                "request id {} collides with an outstanding request",
                id
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.slots.insert(id, tx);
        Ok(rx)
    }

    /// Removes and fulfills the slot for `id`.
    ///
    /// A response with no matching slot is discarded; it is either late
    /// (its caller timed out) or spurious.
    pub(crate) fn complete(&self, id: u32, response: Response) {
        let sender = self.inner.lock().unwrap().slots.remove(&id);
        match sender {
            Some(tx) => {
                // Receiver dropped means the caller gave up; nothing to do.
                let _ = tx.send(Ok(response));
            }
            None => {
                warn!(id, "discarding response for unknown request id");
            }
        }
    }

    /// Removes the slot for `id` without fulfilling it.
    ///
    /// Used when a caller times out, so the eventual response is dropped
    /// silently by [`RequestTable::complete`].
    pub(crate) fn discard(&self, id: u32) {
        self.inner.lock().unwrap().slots.remove(&id);
    }

    /// Fails every outstanding slot with `cause` and latches it.
    pub(crate) fn fail_all(&self, cause: FailureCause) {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock().unwrap();
            // First failure wins; close after a transport error keeps the
            // original cause.
            if inner.failure.is_none() {
                inner.failure = Some(cause.clone());
            }
            inner.slots.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(cause.to_error()));
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }
}
