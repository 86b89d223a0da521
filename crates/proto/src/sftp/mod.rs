//! SFTP (SSH File Transfer Protocol) client engine.
//!
//! This module implements the client side of SFTP v3, the most widely
//! supported version, as a concurrent request/response multiplexer over a
//! single subsystem stream.
//!
//! # Architecture
//!
//! The engine sits on top of an already-secured byte channel provided
//! through the [`skiff_platform::SubsystemSession`] capability:
//!
//! 1. The session opens the `"sftp"` subsystem channel
//! 2. [`SftpEngine::init`] exchanges INIT/VERSION and collects server
//!    extensions
//! 3. A background reader task routes every response to the request id it
//!    echoes, while any number of callers issue operations concurrently
//!
//! # Protocol Flow
//!
//! ```text
//! Client                          Server
//!   |                               |
//!   |-- SSH_FXP_INIT -------------->|
//!   |<- SSH_FXP_VERSION ------------|  (+ extension pairs)
//!   |                               |
//!   |-- SSH_FXP_OPEN (id=1) ------->|
//!   |-- SSH_FXP_STAT (id=2) ------->|
//!   |<- SSH_FXP_ATTRS (id=2) -------|  responses may arrive
//!   |<- SSH_FXP_HANDLE (id=1) ------|  out of request order
//!   |                               |
//!   |-- SSH_FXP_CLOSE (id=3) ------>|
//!   |<- SSH_FXP_STATUS (id=3) ------|
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use skiff_proto::sftp::SftpEngine;
//! use skiff_platform::SubsystemSession;
//!
//! # async fn example(session: Box<dyn SubsystemSession>) -> Result<(), Box<dyn std::error::Error>> {
//! let engine = SftpEngine::new(session).await?;
//! engine.init().await?;
//!
//! let attrs = engine.stat("/etc/hostname").await?;
//! println!("{:?} bytes: {:?}", attrs.size, attrs.file_type());
//!
//! let file = engine.open_read("/etc/hostname").await?;
//! let _data = file.read(0, 4096).await?;
//! file.close().await?;
//!
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # References
//!
//! - [SFTP Draft v3](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-02) - Most common version
//! - [SFTP Draft v6](https://datatracker.ietf.org/doc/html/draft-ietf-secsh-filexfer-13) - Rename flag semantics

pub mod codec;
pub mod dir;
pub mod engine;
pub mod file;
pub mod message;
pub mod path;
mod reader;
mod table;
pub mod types;

pub use dir::{DirEntry, RemoteDirectory};
pub use engine::{
    EngineConfig, Requester, SftpEngine, DEFAULT_SUBSYSTEM_NAME, DEFAULT_TIMEOUT_MS,
    MAX_SUPPORTED_VERSION,
};
pub use file::RemoteFile;
pub use message::{PacketType, Request, Response, DEFAULT_MAX_PACKET_LENGTH};
pub use path::{Canonicalizer, PathComponents, PathHelper, DEFAULT_PATH_SEPARATOR};
pub use types::{
    FileAttributes, FileMode, FileType, OpenMode, RenameFlag, StatusCode,
};
