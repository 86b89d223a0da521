//! Core traits for the Skiff transport boundary
//!
//! The SFTP engine does not perform key exchange, encryption, or
//! authentication itself. It consumes an already-secured byte channel
//! through the [`SubsystemSession`] capability, which a transport
//! implementation (an SSH client, a test harness) provides.

use crate::SkiffResult;
use tokio::io::{AsyncRead, AsyncWrite};

/// Character set used for text strings on the wire.
///
/// SFTP carries paths and file names as raw byte strings; which character
/// set they are in is a property of the remote server. UTF-8 is the
/// practical default, Latin-1 covers legacy servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemoteCharset {
    /// UTF-8 (the default)
    #[default]
    Utf8,
    /// ISO 8859-1
    Latin1,
}

impl RemoteCharset {
    /// Canonical name of the character set.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteCharset::Utf8 => "UTF-8",
            RemoteCharset::Latin1 => "ISO-8859-1",
        }
    }

    /// Decodes wire bytes into a string.
    ///
    /// UTF-8 decoding replaces invalid sequences rather than failing;
    /// file names are not worth killing a session over.
    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            RemoteCharset::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            RemoteCharset::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }

    /// Encodes a string into wire bytes.
    ///
    /// Latin-1 encoding substitutes `?` for characters outside U+00FF.
    pub fn encode(&self, text: &str) -> Vec<u8> {
        match self {
            RemoteCharset::Utf8 => text.as_bytes().to_vec(),
            RemoteCharset::Latin1 => text
                .chars()
                .map(|c| if (c as u32) <= 0xff { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// The two halves of an open subsystem channel.
///
/// Bytes written to `writer` reach the remote subsystem; bytes the remote
/// subsystem emits arrive on `reader`. Confidentiality and integrity are
/// the transport's problem, not the consumer's.
pub struct SubsystemStream {
    /// Read half of the channel
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    /// Write half of the channel
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl std::fmt::Debug for SubsystemStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubsystemStream").finish_non_exhaustive()
    }
}

/// A secure session capable of starting named subsystems.
///
/// This is the engine's entire downward interface: one call to open the
/// subsystem channel, session-scoped metadata, and a close hook.
#[async_trait::async_trait]
pub trait SubsystemSession: Send {
    /// Opens the named subsystem and returns its byte channel.
    ///
    /// # Arguments
    ///
    /// * `name` - Subsystem name (for SFTP: `"sftp"`)
    ///
    /// # Errors
    ///
    /// Returns an error if the channel cannot be opened or the subsystem
    /// request is rejected by the server.
    async fn start_subsystem(&mut self, name: &str) -> SkiffResult<SubsystemStream>;

    /// Character set the remote server uses for paths and file names.
    fn remote_charset(&self) -> RemoteCharset {
        RemoteCharset::Utf8
    }

    /// Short label identifying this session in logs and task names.
    fn session_label(&self) -> String {
        "skiff".to_string()
    }

    /// Closes the session.
    ///
    /// # Errors
    ///
    /// Returns an error if teardown fails; the session is unusable either way.
    async fn close(&mut self) -> SkiffResult<()>;
}
