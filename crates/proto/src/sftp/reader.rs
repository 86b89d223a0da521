//! Background packet reader.
//!
//! Exactly one reader task owns the read half of the subsystem stream for
//! the engine's lifetime. It drains the transport aggressively so a large
//! response cannot block unrelated outstanding requests, and routes each
//! response to its slot by request id.

use crate::sftp::message::{read_frame, Response};
use crate::sftp::table::{FailureCause, RequestTable};
use skiff_platform::SkiffError;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawns the reader task.
///
/// The task runs until the stream fails, the peer violates the protocol,
/// or it is aborted by `close()`. On any terminal error it fails every
/// outstanding request with the cause and exits.
pub(crate) fn spawn(
    mut read_half: Box<dyn AsyncRead + Send + Unpin>,
    table: Arc<RequestTable>,
    max_packet_length: usize,
    label: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(session = %label, "packet reader started");

        let cause = loop {
            let frame = match read_frame(&mut *read_half, max_packet_length).await {
                Ok(frame) => frame,
                Err(SkiffError::Transport(msg)) => break FailureCause::Transport(msg),
                Err(e) => break FailureCause::Protocol(e.to_string()),
            };

            // Anything that is not an id-carrying response (a second
            // VERSION included) is fatal.
            match Response::parse(frame) {
                Ok(response) => {
                    debug!(
                        id = response.request_id(),
                        packet_type = ?response.packet_type(),
                        "received response"
                    );
                    table.complete(response.request_id(), response);
                }
                Err(e) => break FailureCause::Protocol(e.to_string()),
            }
        };

        warn!(session = %label, cause = ?cause, "packet reader terminating");
        table.fail_all(cause);
    })
}
