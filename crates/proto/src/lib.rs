//! Protocol implementations for the Skiff file-transfer client.
//!
//! This crate provides the client side of SFTP version 3: a concurrent
//! request/response engine that multiplexes many callers over one secure
//! subsystem stream. The secure transport itself (key exchange, ciphers,
//! authentication) is not implemented here; it is consumed through the
//! [`skiff_platform::SubsystemSession`] capability.
//!
//! # Features
//!
//! - `sftp` (default) - SFTP client engine
//!
//! # Example
//!
//! ```rust
//! use skiff_proto::sftp::{PacketType, Request};
//! use skiff_platform::RemoteCharset;
//!
//! // Build a STAT request and serialize it to wire format.
//! let mut request = Request::new(PacketType::Stat, 1);
//! request.put_string("/etc/hostname", RemoteCharset::Utf8);
//! let wire = request.to_wire();
//! assert_eq!(wire[4], PacketType::Stat as u8);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

#[cfg(feature = "sftp")]
pub mod sftp;
