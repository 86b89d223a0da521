//! The SFTP engine: a concurrent request/response multiplexer.
//!
//! Many callers share one engine over one subsystem stream. Each
//! operation allocates a request id, registers a response slot, transmits
//! the framed request, and awaits its slot; the background reader routes
//! every inbound response to the slot its id names. Outbound packets are
//! serialized by a writer lock, so frames never interleave on the wire.

use crate::sftp::codec::PacketDecoder;
use crate::sftp::dir::RemoteDirectory;
use crate::sftp::file::RemoteFile;
use crate::sftp::message::{
    encode_frame, read_frame, PacketType, Request, Response, DEFAULT_MAX_PACKET_LENGTH,
};
use crate::sftp::path::{Canonicalizer, PathHelper, DEFAULT_PATH_SEPARATOR};
use crate::sftp::reader;
use crate::sftp::table::{FailureCause, RequestTable};
use crate::sftp::types::{FileAttributes, OpenMode, RenameFlag};
use skiff_platform::{RemoteCharset, SkiffError, SkiffResult, SubsystemSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Highest protocol version this engine speaks.
pub const MAX_SUPPORTED_VERSION: u32 = 3;

/// Default per-operation timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Default subsystem name.
pub const DEFAULT_SUBSYSTEM_NAME: &str = "sftp";

/// Name of the OpenSSH rename extension used for flag fallback on v3.
const POSIX_RENAME_EXTENSION: &str = "posix-rename@openssh.com";

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Subsystem to request from the session (default `"sftp"`)
    pub subsystem_name: String,
    /// Path separator the server uses (default `/`)
    pub path_separator: String,
    /// Per-operation timeout in milliseconds (default 30 000)
    pub timeout_ms: u64,
    /// Upper bound on a single inbound packet
    pub max_packet_length: usize,
    /// Protocol version to request during init
    pub requested_version: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            subsystem_name: DEFAULT_SUBSYSTEM_NAME.to_string(),
            path_separator: DEFAULT_PATH_SEPARATOR.to_string(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_packet_length: DEFAULT_MAX_PACKET_LENGTH,
            requested_version: MAX_SUPPORTED_VERSION,
        }
    }
}

/// The request/response capability handle objects operate through.
///
/// [`RemoteFile`] and [`RemoteDirectory`] hold this instead of the
/// concrete engine, so they depend only on the ability to allocate a
/// request and exchange it for a response.
#[async_trait::async_trait]
pub trait Requester: Send + Sync {
    /// Allocates a request id and builds an empty request of `packet_type`.
    fn new_request(&self, packet_type: PacketType) -> Request;

    /// Transmits `request` and awaits its response, subject to the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Timeout, transport, protocol, and closed-engine errors, per the
    /// engine's error taxonomy.
    async fn request(&self, request: Request) -> SkiffResult<Response>;

    /// Character set the server uses for paths and names.
    fn remote_charset(&self) -> RemoteCharset;
}

/// State established by version negotiation, immutable afterwards.
struct Negotiated {
    version: u32,
    extensions: HashMap<String, String>,
}

/// How a rename request will go on the wire.
#[derive(Debug, PartialEq, Eq)]
enum RenamePlan {
    /// Plain RENAME, no mask
    Plain,
    /// RENAME with a v5+ flag mask appended
    WithMask(u32),
    /// EXTENDED posix-rename@openssh.com
    PosixExtension,
}

/// Decides how to honor rename flags, first matching rule wins.
fn plan_rename(
    flags: &[RenameFlag],
    version: u32,
    has_posix_rename: bool,
) -> SkiffResult<RenamePlan> {
    if flags.is_empty() {
        return Ok(RenamePlan::Plain);
    }
    if version >= 5 {
        return Ok(RenamePlan::WithMask(RenameFlag::mask(flags)));
    }

    let overwrite = flags.contains(&RenameFlag::Overwrite);
    let atomic = flags.contains(&RenameFlag::Atomic);
    let native = flags.contains(&RenameFlag::Native);

    // posix-rename gives ATOMIC and OVERWRITE behaviour, but overwriting
    // must have been explicitly requested before we substitute it.
    if overwrite && has_posix_rename {
        return Ok(RenamePlan::PosixExtension);
    }
    if atomic && !overwrite && !native && has_posix_rename {
        return Err(SkiffError::Unsupported(format!(
            "rename flags are not supported in SFTPv{} but the \"{}\" extension could be used \
             as fallback if OVERWRITE behaviour is acceptable (request it via RenameFlag::Overwrite)",
            version, POSIX_RENAME_EXTENSION
        )));
    }
    // NATIVE lets the server rename however it wants; other flags are
    // hints it is free to ignore.
    if native {
        return Ok(RenamePlan::Plain);
    }
    Err(SkiffError::Unsupported(format!(
        "rename flags are not supported in SFTPv{} and no supported server extension could \
         be found to achieve a similar result",
        version
    )))
}

struct EngineInner {
    session: tokio::sync::Mutex<Box<dyn SubsystemSession>>,
    /// Read half, held until `init` hands it to the reader task
    read_half: std::sync::Mutex<Option<Box<dyn AsyncRead + Send + Unpin>>>,
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    table: Arc<RequestTable>,
    reader_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
    next_request_id: AtomicU32,
    timeout_ms: AtomicU64,
    negotiated: OnceLock<Negotiated>,
    remote_charset: RemoteCharset,
    label: String,
    config: EngineConfig,
    closed: AtomicBool,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        if let Some(handle) = self.reader_handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Client-side SFTP engine over an established subsystem stream.
///
/// Construct with [`SftpEngine::new`], negotiate with
/// [`SftpEngine::init`], then clone freely; clones share one session, and
/// every operation takes `&self` and may run concurrently with any other.
#[derive(Clone)]
pub struct SftpEngine {
    inner: Arc<EngineInner>,
}

impl SftpEngine {
    /// Opens the subsystem channel with default configuration.
    ///
    /// # Errors
    ///
    /// Propagates the session's failure to open the subsystem.
    pub async fn new(session: Box<dyn SubsystemSession>) -> SkiffResult<Self> {
        Self::with_config(session, EngineConfig::default()).await
    }

    /// Opens the subsystem channel with explicit configuration.
    ///
    /// # Errors
    ///
    /// Propagates the session's failure to open the subsystem.
    pub async fn with_config(
        mut session: Box<dyn SubsystemSession>,
        config: EngineConfig,
    ) -> SkiffResult<Self> {
        info!(subsystem = %config.subsystem_name, "opening subsystem channel");
        let stream = session.start_subsystem(&config.subsystem_name).await?;
        let remote_charset = session.remote_charset();
        let label = session.session_label();

        Ok(Self {
            inner: Arc::new(EngineInner {
                session: tokio::sync::Mutex::new(session),
                read_half: std::sync::Mutex::new(Some(stream.reader)),
                writer: tokio::sync::Mutex::new(stream.writer),
                table: Arc::new(RequestTable::new()),
                reader_handle: std::sync::Mutex::new(None),
                next_request_id: AtomicU32::new(1),
                timeout_ms: AtomicU64::new(config.timeout_ms),
                negotiated: OnceLock::new(),
                remote_charset,
                label,
                config,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Negotiates the protocol version configured for this engine.
    ///
    /// # Errors
    ///
    /// See [`SftpEngine::init_version`].
    pub async fn init(&self) -> SkiffResult<()> {
        self.init_version(self.inner.config.requested_version).await
    }

    /// Exchanges INIT/VERSION, then starts the background reader.
    ///
    /// The reader is started only after successful negotiation, so the
    /// VERSION packet is read directly here.
    ///
    /// # Errors
    ///
    /// Fails if `requested` exceeds [`MAX_SUPPORTED_VERSION`], if the
    /// server's first packet is not VERSION, or if the server reports a
    /// version greater than requested.
    pub async fn init_version(&self, requested: u32) -> SkiffResult<()> {
        if requested > MAX_SUPPORTED_VERSION {
            return Err(SkiffError::Unsupported(format!(
                "requested protocol version {} exceeds the supported maximum {}",
                requested, MAX_SUPPORTED_VERSION
            )));
        }
        if requested < MAX_SUPPORTED_VERSION {
            debug!(
                requested,
                supported = MAX_SUPPORTED_VERSION,
                "requesting a version below the supported maximum"
            );
        }

        let mut read_half = self
            .inner
            .read_half
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| {
                SkiffError::Protocol("version negotiation already performed".to_string())
            })?;

        self.transmit(encode_frame(PacketType::Init, &requested.to_be_bytes()))
            .await?;

        let frame = read_frame(&mut *read_half, self.inner.config.max_packet_length).await?;
        let mut dec = PacketDecoder::new(frame);
        let raw_type = dec.try_get_u8()?;
        match PacketType::from_u8(raw_type) {
            Some(PacketType::Version) => {}
            other => {
                return Err(SkiffError::Protocol(format!(
                    "expected VERSION packet, received: {}",
                    other.map_or_else(|| raw_type.to_string(), |t| format!("{:?}", t))
                )));
            }
        }

        let version = dec.try_get_u32()?;
        debug!(server_version = version);
        if requested < version {
            return Err(SkiffError::Protocol(format!(
                "server reported incompatible protocol version: {}",
                version
            )));
        }

        let mut extensions = HashMap::new();
        while dec.remaining() > 0 {
            let name = dec.try_get_string(RemoteCharset::Utf8)?;
            let data = dec.try_get_string(RemoteCharset::Utf8)?;
            extensions.insert(name, data);
        }

        info!(
            version,
            extensions = extensions.len(),
            "SFTP session negotiated"
        );
        let _ = self.inner.negotiated.set(Negotiated {
            version,
            extensions,
        });

        let handle = reader::spawn(
            read_half,
            Arc::clone(&self.inner.table),
            self.inner.config.max_packet_length,
            self.inner.label.clone(),
        );
        *self.inner.reader_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn negotiated(&self) -> SkiffResult<&Negotiated> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SkiffError::Closed);
        }
        self.inner.negotiated.get().ok_or_else(|| {
            SkiffError::Protocol("version negotiation has not been performed".to_string())
        })
    }

    /// Effective protocol version; zero until `init` completes.
    pub fn operative_protocol_version(&self) -> u32 {
        self.inner.negotiated.get().map_or(0, |n| n.version)
    }

    /// True if the server advertised the extension keyed `name@domain`.
    pub fn supports_server_extension(&self, name: &str, domain: &str) -> bool {
        self.server_extension_data(name, domain).is_some()
    }

    /// Data the server advertised for the extension keyed `name@domain`.
    pub fn server_extension_data(&self, name: &str, domain: &str) -> Option<&str> {
        self.inner
            .negotiated
            .get()
            .and_then(|n| n.extensions.get(&format!("{}@{}", name, domain)))
            .map(String::as_str)
    }

    /// Sets the per-operation timeout.
    pub fn set_timeout_ms(&self, timeout_ms: u64) {
        self.inner.timeout_ms.store(timeout_ms, Ordering::SeqCst);
    }

    /// Current per-operation timeout.
    pub fn timeout_ms(&self) -> u64 {
        self.inner.timeout_ms.load(Ordering::SeqCst)
    }

    /// Path helper bound to this engine's separator and REALPATH.
    pub fn path_helper(&self) -> PathHelper {
        PathHelper::new(
            Arc::new(self.clone()) as Arc<dyn Canonicalizer>,
            self.inner.config.path_separator.clone(),
        )
    }

    fn requester(&self) -> Arc<dyn Requester> {
        Arc::new(self.clone())
    }

    /// Writes a complete frame under the writer lock.
    async fn transmit(&self, frame: bytes::Bytes) -> SkiffResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(SkiffError::Closed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer
            .write_all(&frame)
            .await
            .map_err(|e| SkiffError::Transport(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| SkiffError::Transport(e.to_string()))
    }

    /// Builds an EXTENDED request whose first field is the extension name.
    pub fn new_extended_request(&self, name: &str) -> Request {
        let mut request = self.new_request(PacketType::Extended);
        request.put_string(name, RemoteCharset::Utf8);
        request
    }

    /// Opens a remote file.
    ///
    /// # Errors
    ///
    /// Any response other than HANDLE is an error.
    pub async fn open(
        &self,
        path: &str,
        modes: &[OpenMode],
        attrs: &FileAttributes,
    ) -> SkiffResult<RemoteFile> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::Open);
        request
            .put_string(path, charset)
            .put_u32(OpenMode::mask(modes))
            .put_attributes(attrs);
        let handle = self
            .request(request)
            .await?
            .ensure_packet_type_is(PacketType::Handle, charset)?
            .into_body()
            .try_get_bytes()?;
        Ok(RemoteFile::new(self.requester(), path, handle))
    }

    /// Opens a remote file read-only with empty attributes.
    ///
    /// # Errors
    ///
    /// See [`SftpEngine::open`].
    pub async fn open_read(&self, path: &str) -> SkiffResult<RemoteFile> {
        self.open(path, &[OpenMode::Read], &FileAttributes::new())
            .await
    }

    /// Opens a remote directory for scanning.
    ///
    /// # Errors
    ///
    /// Any response other than HANDLE is an error.
    pub async fn open_dir(&self, path: &str) -> SkiffResult<RemoteDirectory> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::OpenDir);
        request.put_string(path, charset);
        let handle = self
            .request(request)
            .await?
            .ensure_packet_type_is(PacketType::Handle, charset)?
            .into_body()
            .try_get_bytes()?;
        Ok(RemoteDirectory::new(self.requester(), path, handle))
    }

    async fn stat_with(&self, packet_type: PacketType, path: &str) -> SkiffResult<FileAttributes> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(packet_type);
        request.put_string(path, charset);
        let mut body = self
            .request(request)
            .await?
            .ensure_packet_type_is(PacketType::Attrs, charset)?
            .into_body();
        FileAttributes::decode(&mut body)
    }

    /// Retrieves attributes, following symlinks.
    ///
    /// # Errors
    ///
    /// Non-ATTRS responses surface as status or protocol errors.
    pub async fn stat(&self, path: &str) -> SkiffResult<FileAttributes> {
        self.stat_with(PacketType::Stat, path).await
    }

    /// Retrieves attributes without following symlinks.
    ///
    /// # Errors
    ///
    /// Non-ATTRS responses surface as status or protocol errors.
    pub async fn lstat(&self, path: &str) -> SkiffResult<FileAttributes> {
        self.stat_with(PacketType::LStat, path).await
    }

    /// Sets attributes on a path.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn set_attributes(&self, path: &str, attrs: &FileAttributes) -> SkiffResult<()> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::SetStat);
        request.put_string(path, charset).put_attributes(attrs);
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Creates a directory with the given attributes.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn make_dir(&self, path: &str, attrs: &FileAttributes) -> SkiffResult<()> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::MkDir);
        request.put_string(path, charset).put_attributes(attrs);
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Removes a file.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn remove(&self, path: &str) -> SkiffResult<()> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::Remove);
        request.put_string(path, charset);
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Removes a directory.
    ///
    /// # Errors
    ///
    /// Any status other than OK is an error.
    pub async fn remove_dir(&self, path: &str) -> SkiffResult<()> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::RmDir);
        request.put_string(path, charset);
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Creates a symbolic link at `link_path` pointing to `target_path`.
    ///
    /// Arguments go on the wire in draft order `(linkpath, targetpath)`;
    /// OpenSSH servers historically expect them swapped, and no
    /// compensation is attempted here.
    ///
    /// # Errors
    ///
    /// Unsupported below protocol version 3; otherwise any status other
    /// than OK is an error.
    pub async fn symlink(&self, link_path: &str, target_path: &str) -> SkiffResult<()> {
        let version = self.negotiated()?.version;
        if version < 3 {
            return Err(SkiffError::Unsupported(format!(
                "SYMLINK is not supported in SFTPv{}",
                version
            )));
        }
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::Symlink);
        request
            .put_string(link_path, charset)
            .put_string(target_path, charset);
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Reads the target of a symbolic link.
    ///
    /// # Errors
    ///
    /// Unsupported below protocol version 3; otherwise the response must
    /// be a NAME with exactly one entry.
    pub async fn read_link(&self, path: &str) -> SkiffResult<String> {
        let version = self.negotiated()?.version;
        if version < 3 {
            return Err(SkiffError::Unsupported(format!(
                "READLINK is not supported in SFTPv{}",
                version
            )));
        }
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::ReadLink);
        request.put_string(path, charset);
        self.request(request).await?.read_single_name(charset)
    }

    /// Canonicalizes a path on the server.
    ///
    /// # Errors
    ///
    /// The response must be a NAME with exactly one entry.
    pub async fn canonicalize(&self, path: &str) -> SkiffResult<String> {
        self.negotiated()?;
        let charset = self.inner.remote_charset;
        let mut request = self.new_request(PacketType::RealPath);
        request.put_string(path, charset);
        self.request(request).await?.read_single_name(charset)
    }

    /// Renames `old_path` to `new_path`, honoring `flags` where the
    /// negotiated version allows.
    ///
    /// On protocol 5 and up the flags go on the wire as a mask. On
    /// protocol 3, OVERWRITE falls back to the posix-rename extension
    /// when the server offers it, NATIVE permits dropping the flags, and
    /// anything else is refused before a packet is sent.
    ///
    /// # Errors
    ///
    /// Unsupported flag combinations fail without touching the wire; the
    /// request itself fails on any status other than OK.
    pub async fn rename(
        &self,
        old_path: &str,
        new_path: &str,
        flags: &[RenameFlag],
    ) -> SkiffResult<()> {
        let version = self.negotiated()?.version;
        if version < 1 {
            return Err(SkiffError::Unsupported(format!(
                "RENAME is not supported in SFTPv{}",
                version
            )));
        }

        let plan = plan_rename(
            flags,
            version,
            self.supports_server_extension("posix-rename", "openssh.com"),
        )?;
        if plan == RenamePlan::Plain && !flags.is_empty() {
            debug!(
                ?flags,
                "server cannot honor rename flags; NATIVE allows ignoring them"
            );
        }

        let charset = self.inner.remote_charset;
        let mut request = match &plan {
            RenamePlan::PosixExtension => self.new_extended_request(POSIX_RENAME_EXTENSION),
            _ => self.new_request(PacketType::Rename),
        };
        request
            .put_string(old_path, charset)
            .put_string(new_path, charset);
        if let RenamePlan::WithMask(mask) = plan {
            request.put_u32(mask);
        }
        self.request(request).await?.ensure_status_ok(charset)
    }

    /// Closes the engine: stops the reader, fails outstanding requests,
    /// shuts the stream, closes the session.
    ///
    /// Idempotent; operations after close fail with a closed-engine error.
    ///
    /// # Errors
    ///
    /// Propagates the session's teardown failure.
    pub async fn close(&self) -> SkiffResult<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(session = %self.inner.label, "closing SFTP engine");

        if let Some(handle) = self.inner.reader_handle.lock().unwrap().take() {
            handle.abort();
        }
        self.inner.table.fail_all(FailureCause::Closed);

        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(e) = writer.shutdown().await {
                debug!(error = %e, "write half shutdown failed");
            }
        }

        self.inner.session.lock().await.close().await
    }
}

#[async_trait::async_trait]
impl Requester for SftpEngine {
    fn new_request(&self, packet_type: PacketType) -> Request {
        // Wraps modulo 2^32; the table rejects the (theoretical) collision
        // with a still-outstanding id.
        Request::new(
            packet_type,
            self.inner.next_request_id.fetch_add(1, Ordering::SeqCst),
        )
    }

    async fn request(&self, request: Request) -> SkiffResult<Response> {
        self.negotiated()?;
        let id = request.request_id();
        let rx = self.inner.table.register(id)?;

        debug!(id, packet_type = ?request.packet_type(), "sending request");
        if let Err(e) = self.transmit(request.to_wire()).await {
            self.inner.table.discard(id);
            return Err(e);
        }

        let window = Duration::from_millis(self.inner.timeout_ms.load(Ordering::SeqCst));
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value: the slot was discarded
            // underneath us, which only close() or a timeout race does.
            Ok(Err(_)) => Err(SkiffError::Closed),
            Err(_) => {
                self.inner.table.discard(id);
                let timeout_ms = window.as_millis() as u64;
                warn!(id, timeout_ms, "request timed out");
                Err(SkiffError::Timeout)
            }
        }
    }

    fn remote_charset(&self) -> RemoteCharset {
        self.inner.remote_charset
    }
}

#[async_trait::async_trait]
impl Canonicalizer for SftpEngine {
    async fn canonicalize(&self, path: &str) -> SkiffResult<String> {
        SftpEngine::canonicalize(self, path).await
    }
}

impl std::fmt::Debug for SftpEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpEngine")
            .field("label", &self.inner.label)
            .field("version", &self.operative_protocol_version())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}
