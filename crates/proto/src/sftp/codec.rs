//! Typed field encoding and decoding for SFTP packets.
//!
//! All integers are big-endian. Byte strings and text strings are
//! length-prefixed with a `u32`. Text strings are encoded in an explicit
//! character set because the remote server, not this client, decides what
//! its paths are made of.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use skiff_platform::{RemoteCharset, SkiffError, SkiffResult};

/// Builds a packet payload field by field.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    buf: BytesMut,
}

impl PacketEncoder {
    /// Creates an empty encoder.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    /// Creates an encoder with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Appends a single byte.
    pub fn put_u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    /// Appends a big-endian `u32`.
    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    /// Appends a big-endian `u64`.
    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    /// Appends a length-prefixed byte string.
    pub fn put_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_u32(value.len() as u32);
        self.buf.put_slice(value);
        self
    }

    /// Appends a length-prefixed text string in the given character set.
    pub fn put_string(&mut self, value: &str, charset: RemoteCharset) -> &mut Self {
        self.put_bytes(&charset.encode(value))
    }

    /// Appends raw bytes with no length prefix.
    pub fn put_raw(&mut self, value: &[u8]) -> &mut Self {
        self.buf.put_slice(value);
        self
    }

    /// Number of bytes encoded so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Encoded bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Freezes the encoder into an immutable buffer.
    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Reads a packet payload field by field, owning its cursor.
///
/// Every read is bounds-checked; running off the end of the payload is a
/// protocol error, never a panic.
#[derive(Debug)]
pub struct PacketDecoder {
    buf: Bytes,
}

impl PacketDecoder {
    /// Creates a decoder over an immutable payload.
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    /// Bytes left to decode.
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize, what: &str) -> SkiffResult<()> {
        if self.buf.remaining() < needed {
            return Err(SkiffError::Protocol(format!(
                "packet truncated reading {}: need {} bytes, have {}",
                what,
                needed,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    /// Reads a single byte.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the payload is exhausted.
    pub fn try_get_u8(&mut self) -> SkiffResult<u8> {
        self.ensure(1, "u8")?;
        Ok(self.buf.get_u8())
    }

    /// Reads a big-endian `u32`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if fewer than 4 bytes remain.
    pub fn try_get_u32(&mut self) -> SkiffResult<u32> {
        self.ensure(4, "u32")?;
        Ok(self.buf.get_u32())
    }

    /// Reads a big-endian `u64`.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if fewer than 8 bytes remain.
    pub fn try_get_u64(&mut self) -> SkiffResult<u64> {
        self.ensure(8, "u64")?;
        Ok(self.buf.get_u64())
    }

    /// Reads a length-prefixed byte string.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the declared length overruns the payload.
    pub fn try_get_bytes(&mut self) -> SkiffResult<Bytes> {
        let len = self.try_get_u32()? as usize;
        self.ensure(len, "byte string")?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Reads a length-prefixed text string in the given character set.
    ///
    /// # Errors
    ///
    /// Returns a protocol error if the declared length overruns the payload.
    pub fn try_get_string(&mut self, charset: RemoteCharset) -> SkiffResult<String> {
        let bytes = self.try_get_bytes()?;
        Ok(charset.decode(&bytes))
    }
}
