//! SFTP data types and structures.

use crate::sftp::codec::{PacketDecoder, PacketEncoder};
use skiff_platform::{RemoteCharset, SkiffError, SkiffResult};

/// SFTP status codes (SSH_FX_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    /// SSH_FX_OK - Success
    Ok = 0,
    /// SSH_FX_EOF - End of file
    Eof = 1,
    /// SSH_FX_NO_SUCH_FILE - No such file
    NoSuchFile = 2,
    /// SSH_FX_PERMISSION_DENIED - Permission denied
    PermissionDenied = 3,
    /// SSH_FX_FAILURE - General failure
    Failure = 4,
    /// SSH_FX_BAD_MESSAGE - Bad message
    BadMessage = 5,
    /// SSH_FX_NO_CONNECTION - No connection
    NoConnection = 6,
    /// SSH_FX_CONNECTION_LOST - Connection lost
    ConnectionLost = 7,
    /// SSH_FX_OP_UNSUPPORTED - Operation not supported
    OpUnsupported = 8,
}

impl StatusCode {
    /// Convert from u32.
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Returns the canonical message for this code.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file or directory",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation not supported",
        }
    }
}

/// File open modes (SSH_FXF_*).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum OpenMode {
    /// SSH_FXF_READ - Open for reading
    Read = 0x0000_0001,
    /// SSH_FXF_WRITE - Open for writing
    Write = 0x0000_0002,
    /// SSH_FXF_APPEND - Force writes to append
    Append = 0x0000_0004,
    /// SSH_FXF_CREAT - Create if the file does not exist
    Creat = 0x0000_0008,
    /// SSH_FXF_TRUNC - Truncate to zero length
    Trunc = 0x0000_0010,
    /// SSH_FXF_EXCL - Fail if the file exists
    Excl = 0x0000_0020,
    /// SSH_FXF_TEXT - Text-mode translation by the server
    Text = 0x0000_0040,
}

impl OpenMode {
    /// ORs a set of modes into the wire mask.
    pub fn mask(modes: &[OpenMode]) -> u32 {
        modes.iter().fold(0, |acc, m| acc | *m as u32)
    }
}

/// Rename flags (SSH_FXP_RENAME_*), meaningful on protocol version 5 and up.
///
/// On a version 3 server they drive extension fallback instead of going on
/// the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RenameFlag {
    /// SSH_FXP_RENAME_OVERWRITE - Overwrite an existing target
    Overwrite = 0x0000_0001,
    /// SSH_FXP_RENAME_ATOMIC - Require an atomic rename
    Atomic = 0x0000_0002,
    /// SSH_FXP_RENAME_NATIVE - Rename however the server sees fit
    Native = 0x0000_0004,
}

impl RenameFlag {
    /// ORs a set of flags into the wire mask.
    pub fn mask(flags: &[RenameFlag]) -> u32 {
        flags.iter().fold(0, |acc, f| acc | *f as u32)
    }
}

/// File mode (permission and type bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileMode(pub u32);

impl FileMode {
    /// Type bit mask
    pub const TYPE_MASK: u32 = 0o170000;
    /// Directory
    pub const TYPE_DIRECTORY: u32 = 0o040000;
    /// Regular file
    pub const TYPE_REGULAR: u32 = 0o100000;
    /// Symbolic link
    pub const TYPE_SYMLINK: u32 = 0o120000;

    /// Default file permissions (0644 = rw-r--r--)
    pub const DEFAULT_FILE: u32 = 0o644;
    /// Default directory permissions (0755 = rwxr-xr-x)
    pub const DEFAULT_DIR: u32 = 0o755;

    /// Permission bits with the type bits stripped.
    pub fn permissions(&self) -> u32 {
        self.0 & !Self::TYPE_MASK
    }

    /// File type encoded in the mode word.
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.0)
    }
}

/// File type derived from the mode word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file
    Regular,
    /// Directory
    Directory,
    /// Symbolic link
    Symlink,
    /// Anything else (socket, device, fifo)
    Special,
    /// Type bits absent or unrecognized
    Unknown,
}

impl FileType {
    /// Derives the type from a mode word.
    pub fn from_mode(mode: u32) -> Self {
        match mode & FileMode::TYPE_MASK {
            FileMode::TYPE_REGULAR => FileType::Regular,
            FileMode::TYPE_DIRECTORY => FileType::Directory,
            FileMode::TYPE_SYMLINK => FileType::Symlink,
            0 => FileType::Unknown,
            _ => FileType::Special,
        }
    }
}

/// File attribute flags (SSH_FILEXFER_ATTR_*).
#[derive(Debug, Clone, Copy)]
pub struct AttrFlags;

impl AttrFlags {
    /// SSH_FILEXFER_ATTR_SIZE
    pub const SIZE: u32 = 0x0000_0001;
    /// SSH_FILEXFER_ATTR_UIDGID
    pub const UIDGID: u32 = 0x0000_0002;
    /// SSH_FILEXFER_ATTR_PERMISSIONS
    pub const PERMISSIONS: u32 = 0x0000_0004;
    /// SSH_FILEXFER_ATTR_ACMODTIME
    pub const ACMODTIME: u32 = 0x0000_0008;
    /// SSH_FILEXFER_ATTR_EXTENDED
    pub const EXTENDED: u32 = 0x8000_0000;

    const KNOWN: u32 =
        Self::SIZE | Self::UIDGID | Self::PERMISSIONS | Self::ACMODTIME | Self::EXTENDED;
}

/// Sparse file attributes.
///
/// The wire form is a flag word followed by the fields the flags announce,
/// in canonical order: size, uid/gid, permissions, atime/mtime, extension
/// pairs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttributes {
    /// File size in bytes
    pub size: Option<u64>,
    /// User ID
    pub uid: Option<u32>,
    /// Group ID
    pub gid: Option<u32>,
    /// Permission and type bits
    pub permissions: Option<FileMode>,
    /// Access time (Unix timestamp)
    pub atime: Option<u32>,
    /// Modification time (Unix timestamp)
    pub mtime: Option<u32>,
    /// Extension pairs; unknown names are retained, not rejected
    pub extended: Vec<(String, String)>,
}

impl FileAttributes {
    /// Creates empty attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// File type, when permission bits are present.
    pub fn file_type(&self) -> FileType {
        self.permissions
            .map(|m| m.file_type())
            .unwrap_or(FileType::Unknown)
    }

    fn flags(&self) -> u32 {
        let mut flags = 0u32;
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= AttrFlags::EXTENDED;
        }
        flags
    }

    /// Appends the wire form to an encoder.
    pub fn encode(&self, enc: &mut PacketEncoder) {
        enc.put_u32(self.flags());

        if let Some(size) = self.size {
            enc.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            enc.put_u32(uid).put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            enc.put_u32(permissions.0);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            enc.put_u32(atime).put_u32(mtime);
        }
        if !self.extended.is_empty() {
            enc.put_u32(self.extended.len() as u32);
            for (name, data) in &self.extended {
                enc.put_string(name, RemoteCharset::Utf8);
                enc.put_string(data, RemoteCharset::Utf8);
            }
        }
    }

    /// Decodes the wire form, advancing the decoder past it.
    ///
    /// # Errors
    ///
    /// Returns a protocol error on a truncated payload or a flag word with
    /// bits this version does not define.
    pub fn decode(dec: &mut PacketDecoder) -> SkiffResult<Self> {
        let flags = dec.try_get_u32()?;
        if flags & !AttrFlags::KNOWN != 0 {
            return Err(SkiffError::Protocol(format!(
                "unknown attribute flag bits: {:#010x}",
                flags & !AttrFlags::KNOWN
            )));
        }

        let mut attrs = Self::new();
        if flags & AttrFlags::SIZE != 0 {
            attrs.size = Some(dec.try_get_u64()?);
        }
        if flags & AttrFlags::UIDGID != 0 {
            attrs.uid = Some(dec.try_get_u32()?);
            attrs.gid = Some(dec.try_get_u32()?);
        }
        if flags & AttrFlags::PERMISSIONS != 0 {
            attrs.permissions = Some(FileMode(dec.try_get_u32()?));
        }
        if flags & AttrFlags::ACMODTIME != 0 {
            attrs.atime = Some(dec.try_get_u32()?);
            attrs.mtime = Some(dec.try_get_u32()?);
        }
        if flags & AttrFlags::EXTENDED != 0 {
            let count = dec.try_get_u32()?;
            for _ in 0..count {
                let name = dec.try_get_string(RemoteCharset::Utf8)?;
                let data = dec.try_get_string(RemoteCharset::Utf8)?;
                attrs.extended.push((name, data));
            }
        }
        Ok(attrs)
    }
}
