//! Remote file handle.

use crate::sftp::engine::Requester;
use crate::sftp::message::PacketType;
use crate::sftp::types::{FileAttributes, StatusCode};
use bytes::Bytes;
use skiff_platform::{SkiffError, SkiffResult};
use std::sync::Arc;

/// An open remote file, addressed by a server-assigned opaque handle.
///
/// All operations are offset-based; the file keeps no cursor of its own,
/// so concurrent reads and writes through one handle do not race on
/// position.
pub struct RemoteFile {
    requester: Arc<dyn Requester>,
    path: String,
    handle: Bytes,
}

impl RemoteFile {
    pub(crate) fn new(requester: Arc<dyn Requester>, path: &str, handle: Bytes) -> Self {
        Self {
            requester,
            path: path.to_string(),
            handle,
        }
    }

    /// Path this file was opened with.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The server-assigned handle bytes.
    pub fn handle(&self) -> &[u8] {
        &self.handle
    }

    /// Reads up to `len` bytes at `offset`.
    ///
    /// Returns `None` at end of file. A short (but non-empty) result is
    /// normal and does not indicate EOF.
    ///
    /// # Errors
    ///
    /// Any status other than EOF, and any unexpected packet type.
    pub async fn read(&self, offset: u64, len: u32) -> SkiffResult<Option<Vec<u8>>> {
        let mut request = self.requester.new_request(PacketType::Read);
        request
            .put_bytes(&self.handle)
            .put_u64(offset)
            .put_u32(len);
        let response = self.requester.request(request).await?;

        match response.packet_type() {
            PacketType::Data => {
                let data = response.into_body().try_get_bytes()?;
                Ok(Some(data.to_vec()))
            }
            PacketType::Status => {
                let status = response.read_status(self.requester.remote_charset())?;
                match status.status() {
                    Some(StatusCode::Eof) => Ok(None),
                    _ => Err(status.into_error()),
                }
            }
            other => Err(SkiffError::Protocol(format!(
                "expected DATA packet, received: {:?}",
                other
            ))),
        }
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn write(&self, offset: u64, data: &[u8]) -> SkiffResult<()> {
        let mut request = self.requester.new_request(PacketType::Write);
        request
            .put_bytes(&self.handle)
            .put_u64(offset)
            .put_bytes(data);
        self.requester
            .request(request)
            .await?
            .ensure_status_ok(self.requester.remote_charset())
    }

    /// Retrieves this file's attributes by handle (FSTAT).
    ///
    /// # Errors
    ///
    /// Non-ATTRS responses surface as status or protocol errors.
    pub async fn fetch_attributes(&self) -> SkiffResult<FileAttributes> {
        let mut request = self.requester.new_request(PacketType::FStat);
        request.put_bytes(&self.handle);
        let mut body = self
            .requester
            .request(request)
            .await?
            .ensure_packet_type_is(PacketType::Attrs, self.requester.remote_charset())?
            .into_body();
        FileAttributes::decode(&mut body)
    }

    /// Sets this file's attributes by handle (FSETSTAT).
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn set_attributes(&self, attrs: &FileAttributes) -> SkiffResult<()> {
        let mut request = self.requester.new_request(PacketType::FSetStat);
        request.put_bytes(&self.handle).put_attributes(attrs);
        self.requester
            .request(request)
            .await?
            .ensure_status_ok(self.requester.remote_charset())
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

impl std::fmt::Debug for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteFile")
            .field("path", &self.path)
            .field("handle_len", &self.handle.len())
            .finish_non_exhaustive()
    }
}
