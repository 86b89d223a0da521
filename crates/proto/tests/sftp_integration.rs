//! Integration tests for the SFTP engine against a scripted in-memory
//! server.
//!
//! These tests validate the complete protocol flow including:
//! - Version negotiation and extension discovery
//! - Concurrent request multiplexing with out-of-order responses
//! - Rename flag fallback
//! - Timeouts, transport failure, and shutdown

use bytes::{Buf, BufMut, Bytes, BytesMut};
use skiff_platform::{SkiffError, SkiffResult, SubsystemSession, SubsystemStream};
use skiff_proto::sftp::{OpenMode, RenameFlag, Requester, SftpEngine};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{timeout, Duration};

/// Session backed by one end of an in-memory duplex stream.
struct TestSession {
    stream: Option<DuplexStream>,
}

impl TestSession {
    fn new(stream: DuplexStream) -> Self {
        Self {
            stream: Some(stream),
        }
    }
}

#[async_trait::async_trait]
impl SubsystemSession for TestSession {
    async fn start_subsystem(&mut self, name: &str) -> SkiffResult<SubsystemStream> {
        assert_eq!(name, "sftp");
        let stream = self.stream.take().ok_or(SkiffError::Closed)?;
        let (reader, writer) = tokio::io::split(stream);
        Ok(SubsystemStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    async fn close(&mut self) -> SkiffResult<()> {
        Ok(())
    }
}

// Server-side wire helpers. These speak raw bytes on purpose, so the
// engine's framing is checked against an independent implementation.

async fn read_packet(stream: &mut DuplexStream) -> (u8, Bytes) {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.unwrap();
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut frame = vec![0u8; len];
    stream.read_exact(&mut frame).await.unwrap();
    let mut payload = Bytes::from(frame);
    let packet_type = payload.get_u8();
    (packet_type, payload)
}

/// Reads a request frame, splitting off the request id.
async fn read_request(stream: &mut DuplexStream) -> (u8, u32, Bytes) {
    let (packet_type, mut payload) = read_packet(stream).await;
    let id = payload.get_u32();
    (packet_type, id, payload)
}

fn get_string(payload: &mut Bytes) -> String {
    let len = payload.get_u32() as usize;
    String::from_utf8(payload.copy_to_bytes(len).to_vec()).unwrap()
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

async fn write_packet(stream: &mut DuplexStream, packet_type: u8, payload: &[u8]) {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u32(payload.len() as u32 + 1);
    buf.put_u8(packet_type);
    buf.put_slice(payload);
    stream.write_all(&buf).await.unwrap();
}

async fn send_status(stream: &mut DuplexStream, id: u32, code: u32) {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(code);
    put_string(&mut buf, "");
    put_string(&mut buf, "");
    write_packet(stream, 101, &buf).await;
}

async fn send_handle(stream: &mut DuplexStream, id: u32, handle: &[u8]) {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(handle.len() as u32);
    buf.put_slice(handle);
    write_packet(stream, 102, &buf).await;
}

async fn send_data(stream: &mut DuplexStream, id: u32, data: &[u8]) {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
    write_packet(stream, 103, &buf).await;
}

async fn send_attrs_size(stream: &mut DuplexStream, id: u32, size: u64) {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(0x0000_0001); // SIZE
    buf.put_u64(size);
    write_packet(stream, 105, &buf).await;
}

async fn send_name(stream: &mut DuplexStream, id: u32, entries: &[(&str, &str)]) {
    let mut buf = BytesMut::new();
    buf.put_u32(id);
    buf.put_u32(entries.len() as u32);
    for (name, long_name) in entries {
        put_string(&mut buf, name);
        put_string(&mut buf, long_name);
        buf.put_u32(0); // empty attrs
    }
    write_packet(stream, 104, &buf).await;
}

/// Answers the INIT packet with a VERSION carrying extension pairs.
async fn negotiate(stream: &mut DuplexStream, version: u32, extensions: &[(&str, &str)]) {
    let (packet_type, mut payload) = read_packet(stream).await;
    assert_eq!(packet_type, 1, "first packet must be INIT");
    assert_eq!(payload.get_u32(), 3, "client must request version 3");

    let mut buf = BytesMut::new();
    buf.put_u32(version);
    for (name, data) in extensions {
        put_string(&mut buf, name);
        put_string(&mut buf, data);
    }
    write_packet(stream, 2, &buf).await;
}

/// Brings up an initialized engine talking to the returned server stream.
async fn connect(version: u32, extensions: &[(&str, &str)]) -> (SftpEngine, DuplexStream) {
    let (client_end, mut server_end) = tokio::io::duplex(1 << 16);
    let session: Box<dyn SubsystemSession> = Box::new(TestSession::new(client_end));
    let engine = SftpEngine::new(session).await.unwrap();

    let (init_result, ()) = tokio::join!(
        engine.init(),
        negotiate(&mut server_end, version, extensions)
    );
    init_result.unwrap();
    (engine, server_end)
}

const POSIX_RENAME: (&str, &str) = ("posix-rename@openssh.com", "");

#[tokio::test]
async fn test_init_negotiates_version_and_extensions() {
    let (engine, _server) = connect(3, &[POSIX_RENAME]).await;

    assert_eq!(engine.operative_protocol_version(), 3);
    assert!(engine.supports_server_extension("posix-rename", "openssh.com"));
    assert_eq!(
        engine.server_extension_data("posix-rename", "openssh.com"),
        Some("")
    );
    assert!(!engine.supports_server_extension("statvfs", "openssh.com"));
}

#[tokio::test]
async fn test_init_rejects_higher_server_version() {
    let (client_end, mut server_end) = tokio::io::duplex(1 << 16);
    let session: Box<dyn SubsystemSession> = Box::new(TestSession::new(client_end));
    let engine = SftpEngine::new(session).await.unwrap();

    let (init_result, ()) = tokio::join!(engine.init(), negotiate(&mut server_end, 4, &[]));

    match init_result.unwrap_err() {
        SkiffError::Protocol(msg) => assert!(msg.contains("incompatible protocol version")),
        other => panic!("expected Protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_init_rejects_unsupported_requested_version() {
    let (client_end, _server_end) = tokio::io::duplex(1 << 16);
    let session: Box<dyn SubsystemSession> = Box::new(TestSession::new(client_end));
    let engine = SftpEngine::new(session).await.unwrap();

    assert!(matches!(
        engine.init_version(4).await,
        Err(SkiffError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_init_accepts_lower_server_version() {
    let (engine, _server) = connect(2, &[]).await;
    assert_eq!(engine.operative_protocol_version(), 2);

    // v2 has neither READLINK nor SYMLINK; both are refused before any
    // packet is built.
    assert!(matches!(
        engine.read_link("/x").await,
        Err(SkiffError::Unsupported(_))
    ));
    assert!(matches!(
        engine.symlink("/l", "/t").await,
        Err(SkiffError::Unsupported(_))
    ));
}

#[tokio::test]
async fn test_operations_before_init_fail() {
    let (client_end, _server_end) = tokio::io::duplex(1 << 16);
    let session: Box<dyn SubsystemSession> = Box::new(TestSession::new(client_end));
    let engine = SftpEngine::new(session).await.unwrap();

    assert!(matches!(
        engine.stat("/x").await,
        Err(SkiffError::Protocol(_))
    ));
}

#[tokio::test]
async fn test_out_of_order_responses() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let first = read_request(&mut server).await;
        let second = read_request(&mut server).await;

        // One OPEN, one STAT, in whatever order they hit the wire.
        let (open_id, stat_id) = if first.0 == 3 {
            assert_eq!(second.0, 17);
            (first.1, second.1)
        } else {
            assert_eq!(first.0, 17);
            assert_eq!(second.0, 3);
            (second.1, first.1)
        };

        // Answer the STAT before the OPEN.
        send_attrs_size(&mut server, stat_id, 42).await;
        send_handle(&mut server, open_id, b"\x01").await;
        server
    });

    let (file, attrs) = tokio::join!(engine.open_read("/a"), engine.stat("/b"));
    let file = file.unwrap();
    let attrs = attrs.unwrap();

    assert_eq!(file.handle(), b"\x01");
    assert_eq!(attrs.size, Some(42));
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_concurrent_requests_each_get_their_response() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let mut pending = Vec::new();
        for _ in 0..8 {
            let (packet_type, id, mut payload) = read_request(&mut server).await;
            assert_eq!(packet_type, 17);
            let path = get_string(&mut payload);
            let index: u64 = path.trim_start_matches("/f").parse().unwrap();
            pending.push((id, index));
        }
        // Reverse arrival order to force the table to do the matching.
        for (id, index) in pending.into_iter().rev() {
            send_attrs_size(&mut server, id, index).await;
        }
    });

    let stats = spawn_concurrent_stats(&engine).await;
    for (index, attrs) in stats.into_iter().enumerate() {
        assert_eq!(attrs.unwrap().size, Some(index as u64));
    }
    server_task.await.unwrap();
}

/// Issues stat("/f0") .. stat("/f7") concurrently.
async fn spawn_concurrent_stats(
    engine: &SftpEngine,
) -> Vec<SkiffResult<skiff_proto::sftp::FileAttributes>> {
    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.stat(&format!("/f{}", i)).await })
        })
        .collect();
    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap());
    }
    results
}

#[tokio::test]
async fn test_file_read_write_lifecycle() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        // OPEN
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 3);
        assert_eq!(get_string(&mut payload), "/data.bin");
        assert_eq!(payload.get_u32(), 0x02 | 0x08 | 0x10); // WRITE|CREAT|TRUNC
        send_handle(&mut server, id, b"h0").await;

        // WRITE
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 6);
        assert_eq!(get_string(&mut payload), "h0");
        assert_eq!(payload.get_u64(), 0);
        assert_eq!(get_string(&mut payload), "hello");
        send_status(&mut server, id, 0).await;

        // READ -> DATA
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 5);
        assert_eq!(get_string(&mut payload), "h0");
        assert_eq!(payload.get_u64(), 0);
        assert_eq!(payload.get_u32(), 4096);
        send_data(&mut server, id, b"hello").await;

        // READ past the end -> STATUS(EOF)
        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 5);
        send_status(&mut server, id, 1).await;

        // FSTAT
        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 8);
        send_attrs_size(&mut server, id, 5).await;

        // CLOSE
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 4);
        assert_eq!(get_string(&mut payload), "h0");
        send_status(&mut server, id, 0).await;
    });

    let file = engine
        .open(
            "/data.bin",
            &[OpenMode::Write, OpenMode::Creat, OpenMode::Trunc],
            &Default::default(),
        )
        .await
        .unwrap();
    file.write(0, b"hello").await.unwrap();
    assert_eq!(file.read(0, 4096).await.unwrap(), Some(b"hello".to_vec()));
    assert_eq!(file.read(5, 4096).await.unwrap(), None);
    assert_eq!(file.fetch_attributes().await.unwrap().size, Some(5));
    file.close().await.unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_directory_scan_filters_dot_entries() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 11);
        assert_eq!(get_string(&mut payload), "/logs");
        send_handle(&mut server, id, b"d0").await;

        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 12);
        send_name(
            &mut server,
            id,
            &[
                (".", "drwxr-xr-x ."),
                ("..", "drwxr-xr-x .."),
                ("auth.log", "-rw-r--r-- auth.log"),
                ("kern.log", "-rw-r--r-- kern.log"),
            ],
        )
        .await;

        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 12);
        send_status(&mut server, id, 1).await; // EOF

        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 4);
        send_status(&mut server, id, 0).await;
    });

    let dir = engine.open_dir("/logs").await.unwrap();
    let entries = dir.scan().await.unwrap();
    assert_eq!(
        entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>(),
        vec!["auth.log", "kern.log"]
    );
    dir.close().await.unwrap();

    server_task.await.unwrap();
}

#[tokio::test]
async fn test_readlink_and_canonicalize() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 19);
        assert_eq!(get_string(&mut payload), "/link");
        send_name(&mut server, id, &[("/target", "/target")]).await;

        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 16);
        assert_eq!(get_string(&mut payload), "/a/../b");
        send_name(&mut server, id, &[("/b", "/b")]).await;
    });

    assert_eq!(engine.read_link("/link").await.unwrap(), "/target");
    assert_eq!(engine.canonicalize("/a/../b").await.unwrap(), "/b");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_status_error_carries_code_and_message() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 17);

        let mut buf = BytesMut::new();
        buf.put_u32(id);
        buf.put_u32(2); // NO_SUCH_FILE
        put_string(&mut buf, "no such file: /ghost");
        put_string(&mut buf, "en");
        write_packet(&mut server, 101, &buf).await;
    });

    match engine.stat("/ghost").await.unwrap_err() {
        SkiffError::Status {
            code,
            message,
            language_tag,
        } => {
            assert_eq!(code, 2);
            assert_eq!(message, "no such file: /ghost");
            assert_eq!(language_tag, "en");
        }
        other => panic!("expected Status error, got {:?}", other),
    }
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_rename_overwrite_uses_posix_extension() {
    let (engine, mut server) = connect(3, &[POSIX_RENAME]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 200);
        assert_eq!(get_string(&mut payload), "posix-rename@openssh.com");
        assert_eq!(get_string(&mut payload), "/x");
        assert_eq!(get_string(&mut payload), "/y");
        assert_eq!(payload.remaining(), 0);
        send_status(&mut server, id, 0).await;
    });

    engine
        .rename("/x", "/y", &[RenameFlag::Overwrite])
        .await
        .unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_rename_empty_flags_is_plain() {
    let (engine, mut server) = connect(3, &[POSIX_RENAME]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 18);
        assert_eq!(get_string(&mut payload), "/x");
        assert_eq!(get_string(&mut payload), "/y");
        assert_eq!(payload.remaining(), 0); // no flag mask on v3
        send_status(&mut server, id, 0).await;
    });

    engine.rename("/x", "/y", &[]).await.unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_rename_unsupported_flags_send_nothing() {
    let (engine, mut server) = connect(3, &[]).await;

    assert!(matches!(
        engine.rename("/x", "/y", &[RenameFlag::Atomic]).await,
        Err(SkiffError::Unsupported(_))
    ));

    // The next frame the server sees must be the REALPATH below, proving
    // the refused rename never touched the wire.
    let server_task = tokio::spawn(async move {
        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 16);
        send_name(&mut server, id, &[("/ok", "/ok")]).await;
    });

    assert_eq!(engine.canonicalize("/anything").await.unwrap(), "/ok");
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_atomic_with_extension_demands_explicit_overwrite() {
    let (engine, _server) = connect(3, &[POSIX_RENAME]).await;

    match engine
        .rename("/x", "/y", &[RenameFlag::Atomic])
        .await
        .unwrap_err()
    {
        SkiffError::Unsupported(msg) => {
            assert!(msg.contains("posix-rename@openssh.com"));
        }
        other => panic!("expected Unsupported, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_then_late_response_is_dropped() {
    let (engine, mut server) = connect(3, &[]).await;
    engine.set_timeout_ms(50);

    // The server reads the STAT but stays silent past the deadline.
    let (packet_type, stat_id, _) = {
        let stat = engine.stat("/slow");
        let read = read_request(&mut server);
        let (stat_result, request) = tokio::join!(stat, read);
        assert!(matches!(stat_result, Err(SkiffError::Timeout)));
        request
    };
    assert_eq!(packet_type, 17);

    // The answer arrives long after the caller gave up; the engine must
    // drop it silently and keep serving.
    send_attrs_size(&mut server, stat_id, 7).await;

    engine.set_timeout_ms(5_000);
    let server_task = tokio::spawn(async move {
        let (packet_type, id, _) = read_request(&mut server).await;
        assert_eq!(packet_type, 16);
        send_name(&mut server, id, &[("/still-alive", "/still-alive")]).await;
    });

    assert_eq!(
        engine.canonicalize("/probe").await.unwrap(),
        "/still-alive"
    );
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_transport_failure_fails_all_outstanding() {
    let (engine, mut server) = connect(3, &[]).await;

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stat("/one").await })
    };
    let second = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stat("/two").await })
    };

    // Swallow both requests, then die mid-conversation.
    read_request(&mut server).await;
    read_request(&mut server).await;
    drop(server);

    let first = timeout(Duration::from_secs(5), first).await.unwrap().unwrap();
    let second = timeout(Duration::from_secs(5), second).await.unwrap().unwrap();
    assert!(matches!(first, Err(SkiffError::Transport(_))));
    assert!(matches!(second, Err(SkiffError::Transport(_))));

    // The cause is latched: later operations fail the same way.
    assert!(matches!(
        engine.stat("/three").await,
        Err(SkiffError::Transport(_))
    ));
}

#[tokio::test]
async fn test_close_fails_pending_and_rejects_new_operations() {
    let (engine, mut server) = connect(3, &[]).await;

    let pending = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stat("/pending").await })
    };
    // Let the request reach the wire before closing.
    read_request(&mut server).await;

    engine.close().await.unwrap();

    let pending = timeout(Duration::from_secs(5), pending)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(pending, Err(SkiffError::Closed)));
    assert!(matches!(engine.stat("/after").await, Err(SkiffError::Closed)));

    // Closing again is a no-op.
    engine.close().await.unwrap();
}

#[tokio::test]
async fn test_extended_request_round_trip() {
    let (engine, mut server) = connect(3, &[("hardlink@openssh.com", "1")]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 200);
        assert_eq!(get_string(&mut payload), "hardlink@openssh.com");
        assert_eq!(get_string(&mut payload), "/from");
        assert_eq!(get_string(&mut payload), "/to");
        send_status(&mut server, id, 0).await;
    });

    let mut request = engine.new_extended_request("hardlink@openssh.com");
    request
        .put_string("/from", engine.remote_charset())
        .put_string("/to", engine.remote_charset());
    engine
        .request(request)
        .await
        .unwrap()
        .ensure_status_ok(engine.remote_charset())
        .unwrap();
    server_task.await.unwrap();
}

#[tokio::test]
async fn test_path_helper_uses_engine_realpath() {
    let (engine, mut server) = connect(3, &[]).await;

    let server_task = tokio::spawn(async move {
        let (packet_type, id, mut payload) = read_request(&mut server).await;
        assert_eq!(packet_type, 16);
        assert_eq!(get_string(&mut payload), "relative/./spot");
        send_name(&mut server, id, &[("/home/user/relative/spot", "")]).await;
    });

    let helper = engine.path_helper();
    assert_eq!(helper.leaf("/a/b/c"), "c");
    assert_eq!(
        helper.canonical("relative/./spot").await.unwrap(),
        "/home/user/relative/spot"
    );
    server_task.await.unwrap();
}
