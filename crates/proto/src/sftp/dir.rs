//! Remote directory handle.

use crate::sftp::engine::Requester;
use crate::sftp::message::PacketType;
use crate::sftp::types::{FileAttributes, StatusCode};
use bytes::Bytes;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;

/// One directory entry from a READDIR batch.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Bare file name
    pub name: String,
    /// Server-formatted long listing line (ls -l style)
    pub long_name: String,
    /// Entry attributes
    pub attributes: FileAttributes,
}

/// An open remote directory, addressed by a server-assigned opaque handle.
pub struct RemoteDirectory {
    requester: Arc<dyn Requester>,
    path: String,
    handle: Bytes,
}

impl RemoteDirectory {
    pub(crate) fn new(requester: Arc<dyn Requester>, path: &str, handle: Bytes) -> Self {
        Self {
            requester,
            path: path.to_string(),
            handle,
        }
    }

    /// Path this directory was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Reads the whole directory, issuing READDIR until the server
    /// reports EOF.
    ///
    /// The `.` and `..` entries are filtered out.
    ///
    /// # Errors
    ///
    /// Any status other than EOF, and any unexpected packet type.
    pub async fn scan(&self) -> SkiffResult<Vec<DirEntry>> {
        let charset = self.requester.remote_charset();
        let mut entries = Vec::new();

        loop {
            let mut request = self.requester.new_request(PacketType::ReadDir);
            request.put_bytes(&self.handle);
            let response = self.requester.request(request).await?;

            match response.packet_type() {
                PacketType::Name => {
                    let mut body = response.into_body();
                    let count = body.try_get_u32()?;
                    for _ in 0..count {
                        let name = body.try_get_string(charset)?;
                        let long_name = body.try_get_string(charset)?;
                        let attributes = FileAttributes::decode(&mut body)?;
                        if name != "." && name != ".." {
                            entries.push(DirEntry {
                                name,
                                long_name,
                                attributes,
                            });
                        }
                    }
                }
                PacketType::Status => {
                    let status = response.read_status(charset)?;
                    match status.status() {
                        Some(StatusCode::Eof) => break,
                        _ => return Err(status.into_error()),
                    }
                }
                other => {
                    return Err(SkiffError::Protocol(format!(
                        "expected NAME packet, received: {:?}",
                        other
                    )));
                }
            }
        }

        Ok(entries)
    }

    /// Releases the handle on the server.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn close(&self) -> SkiffResult<()> {
        let mut request = self.requester.new_request(PacketType::Close);
        request.put_bytes(&self.handle);
        self.requester
            .request(request)
            .await?
            .ensure_status_ok(self.requester.remote_charset())
    }
}

impl std::fmt::Debug for RemoteDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteDirectory")
            .field("path", &self.path)
            .field("handle_len", &self.handle.len())
            .finish_non_exhaustive()
    }
}
