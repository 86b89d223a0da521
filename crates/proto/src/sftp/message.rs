//! SFTP packet framing and the request/response wire types.
//!
//! On the wire each packet is:
//!
//! ```text
//! uint32    length
//! byte      type
//! byte[n]   payload
//! ```
//!
//! Every request except INIT carries a `u32` request id directly after the
//! type byte; every response except VERSION echoes the id of the request
//! it answers.

use crate::sftp::codec::{PacketDecoder, PacketEncoder};
use crate::sftp::types::{FileAttributes, StatusCode};
use bytes::{BufMut, Bytes, BytesMut};
use skiff_platform::{RemoteCharset, SkiffError, SkiffResult};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Default bound on a single packet: a 256 KiB data block plus header and
/// attribute slack. A declared length beyond the configured bound is a
/// fatal framing error.
pub const DEFAULT_MAX_PACKET_LENGTH: usize = 256 * 1024 + 4096;

/// SFTP packet type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// SSH_FXP_INIT - Initialize SFTP session
    Init = 1,
    /// SSH_FXP_VERSION - Version response
    Version = 2,
    /// SSH_FXP_OPEN - Open file
    Open = 3,
    /// SSH_FXP_CLOSE - Close file/directory handle
    Close = 4,
    /// SSH_FXP_READ - Read from file
    Read = 5,
    /// SSH_FXP_WRITE - Write to file
    Write = 6,
    /// SSH_FXP_LSTAT - Get attributes without following symlinks
    LStat = 7,
    /// SSH_FXP_FSTAT - Get attributes by handle
    FStat = 8,
    /// SSH_FXP_SETSTAT - Set attributes by path
    SetStat = 9,
    /// SSH_FXP_FSETSTAT - Set attributes by handle
    FSetStat = 10,
    /// SSH_FXP_OPENDIR - Open directory
    OpenDir = 11,
    /// SSH_FXP_READDIR - Read directory entries
    ReadDir = 12,
    /// SSH_FXP_REMOVE - Remove file
    Remove = 13,
    /// SSH_FXP_MKDIR - Create directory
    MkDir = 14,
    /// SSH_FXP_RMDIR - Remove directory
    RmDir = 15,
    /// SSH_FXP_REALPATH - Canonicalize path
    RealPath = 16,
    /// SSH_FXP_STAT - Get attributes following symlinks
    Stat = 17,
    /// SSH_FXP_RENAME - Rename file or directory
    Rename = 18,
    /// SSH_FXP_READLINK - Read symbolic link target
    ReadLink = 19,
    /// SSH_FXP_SYMLINK - Create symbolic link
    Symlink = 20,

    /// SSH_FXP_STATUS - Status response
    Status = 101,
    /// SSH_FXP_HANDLE - Handle response
    Handle = 102,
    /// SSH_FXP_DATA - Data response
    Data = 103,
    /// SSH_FXP_NAME - Name-list response
    Name = 104,
    /// SSH_FXP_ATTRS - Attributes response
    Attrs = 105,

    /// SSH_FXP_EXTENDED - Extended request
    Extended = 200,
    /// SSH_FXP_EXTENDED_REPLY - Extended response
    ExtendedReply = 201,
}

impl PacketType {
    /// Convert from u8.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::LStat),
            8 => Some(Self::FStat),
            9 => Some(Self::SetStat),
            10 => Some(Self::FSetStat),
            11 => Some(Self::OpenDir),
            12 => Some(Self::ReadDir),
            13 => Some(Self::Remove),
            14 => Some(Self::MkDir),
            15 => Some(Self::RmDir),
            16 => Some(Self::RealPath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::ReadLink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }

    /// True for packet types the server sends in answer to a request id.
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Self::Status | Self::Handle | Self::Data | Self::Name | Self::Attrs | Self::ExtendedReply
        )
    }
}

/// Builds a complete frame: length prefix, type byte, payload.
pub fn encode_frame(packet_type: PacketType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u32((payload.len() + 1) as u32);
    buf.put_u8(packet_type as u8);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reads one frame: 4-byte length, then exactly that many bytes.
///
/// The returned buffer starts at the type byte.
///
/// # Errors
///
/// I/O failures surface as [`SkiffError::Transport`]; a zero or oversize
/// declared length is a [`SkiffError::Protocol`] framing error.
pub async fn read_frame<R>(reader: &mut R, max_packet_length: usize) -> SkiffResult<Bytes>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| SkiffError::Transport(e.to_string()))?;

    let length = u32::from_be_bytes(len_buf) as usize;
    if length == 0 {
        return Err(SkiffError::Protocol("zero-length packet".to_string()));
    }
    if length > max_packet_length {
        return Err(SkiffError::Protocol(format!(
            "packet length {} exceeds limit {}",
            length, max_packet_length
        )));
    }

    let mut frame = vec![0u8; length];
    reader
        .read_exact(&mut frame)
        .await
        .map_err(|e| SkiffError::Transport(e.to_string()))?;
    Ok(Bytes::from(frame))
}

/// An outbound request: packet type, request id, typed payload.
#[derive(Debug)]
pub struct Request {
    packet_type: PacketType,
    id: u32,
    body: PacketEncoder,
}

impl Request {
    /// Creates a request with an already-allocated id.
    pub fn new(packet_type: PacketType, id: u32) -> Self {
        Self {
            packet_type,
            id,
            body: PacketEncoder::new(),
        }
    }

    /// Packet type of this request.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Request id the response will echo.
    pub fn request_id(&self) -> u32 {
        self.id
    }

    /// Appends a big-endian `u32` field.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.body.put_u32(value);
        self
    }

    /// Appends a big-endian `u64` field.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.body.put_u64(value);
        self
    }

    /// Appends a length-prefixed byte string field.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.body.put_bytes(value);
        self
    }

    /// Appends a length-prefixed text string field.
    pub fn put_string(&mut self, value: &str, charset: RemoteCharset) -> &mut Self {
        self.body.put_string(value, charset);
        self
    }

    /// Appends file attributes in wire form.
    pub fn put_attributes(&mut self, attrs: &FileAttributes) -> &mut Self {
        attrs.encode(&mut self.body);
        self
    }

    /// Serializes the whole frame: `length | type | id | body`.
    pub fn to_wire(&self) -> Bytes {
        let body = self.body.as_slice();
        let mut buf = BytesMut::with_capacity(body.len() + 9);
        buf.put_u32((body.len() + 5) as u32);
        buf.put_u8(self.packet_type as u8);
        buf.put_u32(self.id);
        buf.put_slice(body);
        buf.freeze()
    }
}

/// Decoded STATUS payload.
#[derive(Debug, Clone)]
pub struct StatusPayload {
    /// Raw SSH_FX_* code
    pub code: u32,
    /// Server-supplied message, empty if the server sent none
    pub message: String,
    /// Language tag, empty if the server sent none
    pub language_tag: String,
}

impl StatusPayload {
    /// Interprets the raw code.
    pub fn status(&self) -> Option<StatusCode> {
        StatusCode::from_u32(self.code)
    }

    /// Converts into the error this status represents.
    pub fn into_error(self) -> SkiffError {
        let message = if self.message.is_empty() {
            self.status()
                .map(|s| s.message().to_string())
                .unwrap_or_default()
        } else {
            self.message
        };
        SkiffError::Status {
            code: self.code,
            message,
            language_tag: self.language_tag,
        }
    }
}

/// An inbound response: packet type, echoed request id, undecoded payload.
#[derive(Debug)]
pub struct Response {
    packet_type: PacketType,
    id: u32,
    body: PacketDecoder,
}

impl Response {
    /// Parses a frame (starting at the type byte) into a response.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unknown types, for types that are not
    /// responses (a second VERSION included), and for truncated payloads.
    pub fn parse(frame: Bytes) -> SkiffResult<Self> {
        let mut body = PacketDecoder::new(frame);
        let raw_type = body.try_get_u8()?;
        let packet_type = PacketType::from_u8(raw_type)
            .ok_or_else(|| SkiffError::Protocol(format!("unknown packet type: {}", raw_type)))?;
        if !packet_type.is_response() {
            return Err(SkiffError::Protocol(format!(
                "unexpected packet type: {:?}",
                packet_type
            )));
        }
        let id = body.try_get_u32()?;
        Ok(Self {
            packet_type,
            id,
            body,
        })
    }

    /// Packet type of this response.
    pub fn packet_type(&self) -> PacketType {
        self.packet_type
    }

    /// Request id this response answers.
    pub fn request_id(&self) -> u32 {
        self.id
    }

    /// Consumes the response, yielding the payload decoder positioned
    /// after the request id.
    pub fn into_body(self) -> PacketDecoder {
        self.body
    }

    /// Decodes this response as a STATUS payload.
    ///
    /// Tolerates servers that send a bare code with no message or
    /// language tag.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if this is not a STATUS packet.
    pub fn read_status(self, charset: RemoteCharset) -> SkiffResult<StatusPayload> {
        if self.packet_type != PacketType::Status {
            return Err(SkiffError::Protocol(format!(
                "expected STATUS packet, received: {:?}",
                self.packet_type
            )));
        }
        let mut body = self.body;
        let code = body.try_get_u32()?;
        let message = if body.remaining() > 0 {
            body.try_get_string(charset)?
        } else {
            String::new()
        };
        let language_tag = if body.remaining() > 0 {
            body.try_get_string(RemoteCharset::Utf8)?
        } else {
            String::new()
        };
        Ok(StatusPayload {
            code,
            message,
            language_tag,
        })
    }

    /// Asserts this response has the expected type.
    ///
    /// A STATUS response is decoded and surfaced as the error it carries
    /// instead; any other mismatch is a protocol error.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_packet_type_is(
        self,
        expected: PacketType,
        charset: RemoteCharset,
    ) -> SkiffResult<Self> {
        if self.packet_type == expected {
            Ok(self)
        } else if self.packet_type == PacketType::Status {
            Err(self.read_status(charset)?.into_error())
        } else {
            Err(SkiffError::Protocol(format!(
                "expected {:?} packet, received: {:?}",
                expected, self.packet_type
            )))
        }
    }

    /// Asserts this is a STATUS response with the given code.
    ///
    /// # Errors
    ///
    /// Surfaces any other status as a status error, any other type as a
    /// protocol error.
    pub fn ensure_status_is(self, expected: StatusCode, charset: RemoteCharset) -> SkiffResult<()> {
        let status = self.read_status(charset)?;
        if status.code == expected as u32 {
            Ok(())
        } else {
            Err(status.into_error())
        }
    }

    /// Asserts this is a STATUS(OK) response.
    ///
    /// # Errors
    ///
    /// See [`Response::ensure_status_is`].
    pub fn ensure_status_ok(self, charset: RemoteCharset) -> SkiffResult<()> {
        self.ensure_status_is(StatusCode::Ok, charset)
    }

    /// Reads a NAME payload that must contain exactly one entry, returning
    /// its filename.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the entry count differs from one.
    pub fn read_single_name(self, charset: RemoteCharset) -> SkiffResult<String> {
        let response = self.ensure_packet_type_is(PacketType::Name, charset)?;
        let mut body = response.into_body();
        let count = body.try_get_u32()?;
        if count != 1 {
            return Err(SkiffError::Protocol(format!(
                "unexpected entry count in NAME packet: {}",
                count
            )));
        }
        body.try_get_string(charset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn status_frame(id: u32, code: u32, message: &str) -> Bytes {
        let mut payload = PacketEncoder::new();
        payload
            .put_u32(id)
            .put_u32(code)
            .put_string(message, RemoteCharset::Utf8)
            .put_string("en", RemoteCharset::Utf8);
        encode_frame(PacketType::Status, payload.as_slice())
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::from_u8(1), Some(PacketType::Init));
        assert_eq!(PacketType::from_u8(101), Some(PacketType::Status));
        assert_eq!(PacketType::from_u8(201), Some(PacketType::ExtendedReply));
        assert_eq!(PacketType::from_u8(255), None);
    }

    #[test]
    fn test_response_type_classification() {
        assert!(PacketType::Status.is_response());
        assert!(PacketType::ExtendedReply.is_response());
        assert!(!PacketType::Version.is_response());
        assert!(!PacketType::Open.is_response());
    }

    #[test]
    fn test_request_wire_layout() {
        let mut req = Request::new(PacketType::Stat, 7);
        req.put_string("/a", RemoteCharset::Utf8);
        let wire = req.to_wire();

        // length = type(1) + id(4) + string(4 + 2)
        assert_eq!(&wire[0..4], &[0, 0, 0, 11]);
        assert_eq!(wire[4], 17);
        assert_eq!(&wire[5..9], &[0, 0, 0, 7]);
        assert_eq!(&wire[9..13], &[0, 0, 0, 2]);
        assert_eq!(&wire[13..], b"/a");
    }

    #[test]
    fn test_response_parse_round_trip() {
        let frame = status_frame(42, 0, "ok then");
        let response = Response::parse(frame.slice(4..)).unwrap();
        assert_eq!(response.packet_type(), PacketType::Status);
        assert_eq!(response.request_id(), 42);

        let status = response.read_status(RemoteCharset::Utf8).unwrap();
        assert_eq!(status.status(), Some(StatusCode::Ok));
        assert_eq!(status.message, "ok then");
        assert_eq!(status.language_tag, "en");
    }

    #[test]
    fn test_non_response_types_rejected() {
        let frame = encode_frame(PacketType::Version, &[0, 0, 0, 3]);
        assert!(matches!(
            Response::parse(frame.slice(4..)),
            Err(SkiffError::Protocol(_))
        ));
    }

    #[test]
    fn test_ensure_packet_type_surfaces_status() {
        let frame = status_frame(1, 2, "gone");
        let response = Response::parse(frame.slice(4..)).unwrap();
        let err = response
            .ensure_packet_type_is(PacketType::Handle, RemoteCharset::Utf8)
            .unwrap_err();
        assert!(matches!(err, SkiffError::Status { code: 2, .. }));
    }

    #[test]
    fn test_bare_status_gets_canonical_message() {
        let mut payload = PacketEncoder::new();
        payload.put_u32(9).put_u32(3);
        let frame = encode_frame(PacketType::Status, payload.as_slice());
        let status = Response::parse(frame.slice(4..))
            .unwrap()
            .read_status(RemoteCharset::Utf8)
            .unwrap();
        assert_eq!(status.message, "");
        let err = status.into_error();
        assert!(matches!(
            err,
            SkiffError::Status { code: 3, ref message, .. } if message == "Permission denied"
        ));
    }

    #[test]
    fn test_single_name_requires_one_entry() {
        let mut payload = PacketEncoder::new();
        payload.put_u32(5).put_u32(2);
        let frame = encode_frame(PacketType::Name, payload.as_slice());
        let err = Response::parse(frame.slice(4..))
            .unwrap()
            .read_single_name(RemoteCharset::Utf8)
            .unwrap_err();
        assert!(matches!(err, SkiffError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let frame = status_frame(3, 0, "");
        server.write_all(&frame).await.unwrap();

        let read = read_frame(&mut client, DEFAULT_MAX_PACKET_LENGTH)
            .await
            .unwrap();
        assert_eq!(read, frame.slice(4..));
    }

    #[tokio::test]
    async fn test_read_frame_length_bound() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        // Exactly at the bound: accepted.
        let payload = vec![0u8; 15];
        let frame = encode_frame(PacketType::Data, &payload);
        server.write_all(&frame).await.unwrap();
        assert!(read_frame(&mut client, 16).await.is_ok());

        // One past the bound: framing error.
        let payload = vec![0u8; 16];
        let frame = encode_frame(PacketType::Data, &payload);
        server.write_all(&frame).await.unwrap();
        assert!(matches!(
            read_frame(&mut client, 16).await,
            Err(SkiffError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_read_frame_eof_is_transport_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        drop(server);
        assert!(matches!(
            read_frame(&mut client, DEFAULT_MAX_PACKET_LENGTH).await,
            Err(SkiffError::Transport(_))
        ));
    }
}
