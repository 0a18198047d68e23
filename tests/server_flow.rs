use facegate::audit::{AuditSink, JsonlAuditSink, NoopAuditSink};
use facegate::config::{LivenessConfig, StoreConfig};
use facegate::credentials::StaticCredentials;
use facegate::crypto::ServerKeypair;
use facegate::dispatch::{DispatchContext, MatchDispatcher};
use facegate::error::GateError;
use facegate::face::dev::DevFaceEngine;
use facegate::face::{EmbeddingExtractor, LandmarkDetector};
use facegate::service::protocol::{
    self, ClientEvent, ResultStatus, ServerEvent, MAX_EVENT_BYTES,
};
use facegate::service::{serve, GateClient, GateResponse, ServerContext};
use facegate::session::SessionRegistry;
use facegate::storage::VectorIndexStore;
use image::{ImageBuffer, ImageOutputFormat, Luma};
use std::io::{BufReader, Cursor, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CREDENTIAL: &str = "secret-key";

struct TestServer {
    addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    _dir: tempfile::TempDir,
}

fn spawn_server(
    liveness_required: bool,
    max_event_bytes: usize,
    audit_log: Option<PathBuf>,
) -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(
        VectorIndexStore::open(&StoreConfig {
            index_path: dir.path().join("faces.index"),
            key_path: dir.path().join("store.key"),
            dimension: 128,
            match_threshold: 0.2,
            create_if_missing: true,
        })
        .unwrap(),
    );
    let engine = Arc::new(DevFaceEngine::new());
    let registry = Arc::new(SessionRegistry::new());
    let audit: Arc<dyn AuditSink> = match audit_log {
        Some(path) => Arc::new(JsonlAuditSink::open(&path).unwrap()),
        None => Arc::new(NoopAuditSink),
    };
    let dispatcher = MatchDispatcher::start(
        2,
        DispatchContext {
            extractor: Arc::clone(&engine) as Arc<dyn EmbeddingExtractor>,
            store,
            registry: Arc::clone(&registry),
            audit,
        },
    );
    let context = Arc::new(ServerContext {
        keypair: ServerKeypair::generate().unwrap(),
        registry: Arc::clone(&registry),
        dispatcher,
        credentials: Arc::new(StaticCredentials::new([CREDENTIAL.to_string()], true)),
        landmarks: Arc::clone(&engine) as Arc<dyn LandmarkDetector>,
        liveness: LivenessConfig {
            required: liveness_required,
            ..LivenessConfig::default()
        },
        idle_timeout: Duration::from_secs(300),
        max_event_bytes,
    });

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let _ = serve(listener, context);
    });
    TestServer {
        addr,
        registry,
        _dir: dir,
    }
}

fn png_bytes(img: ImageBuffer<Luma<u8>, Vec<u8>>) -> Vec<u8> {
    let mut bytes = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)
        .unwrap();
    bytes
}

/// Distinct "identities": a bright band in a different position per
/// seed, so embeddings of different seeds land far apart.
fn person_frame(seed: u32) -> Vec<u8> {
    let band = (seed % 4) * 8;
    png_bytes(ImageBuffer::from_fn(32, 32, |x, _| {
        if x >= band && x < band + 8 {
            Luma([240u8])
        } else {
            Luma([10u8])
        }
    }))
}

/// Bright frame reads as open eyes, dark as closed.
fn eye_frame(brightness: u8) -> Vec<u8> {
    png_bytes(ImageBuffer::from_fn(32, 32, |x, _| {
        Luma([brightness.saturating_add((x % 2) as u8 * 2)])
    }))
}

fn uniform_frame() -> Vec<u8> {
    png_bytes(ImageBuffer::from_pixel(32, 32, Luma([128u8])))
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(25));
    }
    panic!("timed out waiting for {}", what);
}

#[test]
fn enroll_then_identify_round_trip() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);
    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();

    let enrolled = client
        .enroll(&[person_frame(1)], "alice", |_| {})
        .unwrap();
    assert_eq!(enrolled.status, ResultStatus::Enrolled);
    assert_eq!(enrolled.message, "Added to index");
    assert_eq!(enrolled.uid.as_deref(), Some("alice"));

    let found = client.identify(&[person_frame(1)], |_| {}).unwrap();
    assert_eq!(found.status, ResultStatus::Found);
    assert_eq!(found.message, "User found");
    assert_eq!(found.uid.as_deref(), Some("alice"));

    let missed = client.identify(&[person_frame(2)], |_| {}).unwrap();
    assert_eq!(missed.status, ResultStatus::NoMatch);
    assert_eq!(missed.message, "No match found");
    assert!(missed.uid.is_none());

    client.close();
}

#[test]
fn duplicate_uid_and_duplicate_face_are_rejected() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);
    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();

    let first = client.enroll(&[person_frame(1)], "alice", |_| {}).unwrap();
    assert_eq!(first.status, ResultStatus::Enrolled);

    // Same uid, different face.
    let second = client.enroll(&[person_frame(2)], "alice", |_| {}).unwrap();
    assert_eq!(second.status, ResultStatus::DuplicateUid);
    assert_eq!(second.message, "User with this uid already exists");

    // Different uid, same face.
    let third = client.enroll(&[person_frame(1)], "bob", |_| {}).unwrap();
    assert_eq!(third.status, ResultStatus::DuplicateFace);
    assert_eq!(third.uid.as_deref(), Some("alice"));
    assert!(third.message.contains("alice"));

    client.close();
}

#[test]
fn unknown_credential_is_rejected_per_frame() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);

    // Handshake succeeds; rejection happens on the frame.
    let mut client = GateClient::connect(server.addr, "wrong-key").unwrap();
    let err = client.identify(&[person_frame(1)], |_| {}).unwrap_err();
    assert!(matches!(err, GateError::Validation(_)), "got {:?}", err);
    client.close();

    // The same session stays usable with the right credential, so a
    // fresh client with the right key is unaffected.
    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();
    let outcome = client.identify(&[person_frame(1)], |_| {}).unwrap();
    assert_eq!(outcome.status, ResultStatus::NoMatch);
    client.close();
}

#[test]
fn frame_before_key_exchange_is_a_protocol_error() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);
    let stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let line = protocol::read_line_capped(&mut reader, MAX_EVENT_BYTES)
        .unwrap()
        .unwrap();
    let event: ServerEvent = protocol::parse_event(&line).unwrap();
    assert!(matches!(event, ServerEvent::ServerPublicKey { .. }));

    protocol::write_event(
        &mut writer,
        &ClientEvent::Frame {
            data: "AAAA".to_string(),
            iv: "AAAA".to_string(),
        },
    )
    .unwrap();

    let line = protocol::read_line_capped(&mut reader, MAX_EVENT_BYTES)
        .unwrap()
        .unwrap();
    match protocol::parse_event::<ServerEvent>(&line).unwrap() {
        ServerEvent::Error { code, .. } => assert_eq!(code, "protocol_error"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[test]
fn oversize_event_is_rejected_and_connection_closed() {
    let server = spawn_server(false, 4096, None);
    let stream = TcpStream::connect(server.addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();
    let mut reader = BufReader::new(stream.try_clone().unwrap());
    let mut writer = stream;

    let line = protocol::read_line_capped(&mut reader, MAX_EVENT_BYTES)
        .unwrap()
        .unwrap();
    assert!(matches!(
        protocol::parse_event::<ServerEvent>(&line).unwrap(),
        ServerEvent::ServerPublicKey { .. }
    ));

    writer.write_all(&vec![b'x'; 5000]).unwrap();
    writer.write_all(b"\n").unwrap();
    writer.flush().unwrap();

    let line = protocol::read_line_capped(&mut reader, MAX_EVENT_BYTES)
        .unwrap()
        .unwrap();
    match protocol::parse_event::<ServerEvent>(&line).unwrap() {
        ServerEvent::Error { code, .. } => assert_eq!(code, "protocol_error"),
        other => panic!("unexpected event: {:?}", other),
    }
    // Server hangs up after the oversize report.
    assert!(protocol::read_line_capped(&mut reader, MAX_EVENT_BYTES)
        .unwrap()
        .is_none());
}

#[test]
fn liveness_challenge_gates_enroll_and_identify() {
    let server = spawn_server(true, MAX_EVENT_BYTES, None);
    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();

    // Five open-eye frames build the baseline, a dark frame blinks,
    // then the actual enrollment frame goes through.
    let mut frames = vec![eye_frame(220); 5];
    frames.push(eye_frame(40));
    frames.push(person_frame(1));

    let mut progress: Vec<GateResponse> = Vec::new();
    let outcome = client
        .enroll(&frames, "alice", |step| progress.push(step.clone()))
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::Enrolled);

    let pending = progress
        .iter()
        .filter(|p| p.status == ResultStatus::LivenessPending)
        .count();
    assert!(pending >= 5, "expected pending frames, saw {:?}", progress);
    let confirmed = progress
        .iter()
        .filter(|p| p.status == ResultStatus::LivenessConfirmed)
        .count();
    assert_eq!(confirmed, 1);
    assert!(progress
        .iter()
        .any(|p| p.message.starts_with("Please blink! Time remaining:")));
    assert!(progress
        .iter()
        .any(|p| p.message == "Blink detected! Original human confirmed."));

    // The clearance was consumed; identify faces a fresh challenge.
    let outcome = client
        .identify(&frames, |_| {})
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::Found);
    assert_eq!(outcome.uid.as_deref(), Some("alice"));

    client.close();
}

#[test]
fn faceless_and_undecodable_images_map_to_statuses() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);
    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();

    let outcome = client.identify(&[uniform_frame()], |_| {}).unwrap();
    assert_eq!(outcome.status, ResultStatus::NoFace);
    assert_eq!(outcome.message, "Face not found");

    let outcome = client
        .identify(&[b"definitely not a png".to_vec()], |_| {})
        .unwrap();
    assert_eq!(outcome.status, ResultStatus::DecodeError);
    assert_eq!(outcome.message, "Failed to decode image");

    client.close();
}

#[test]
fn sessions_are_torn_down_on_disconnect() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);

    let client = GateClient::connect(server.addr, CREDENTIAL).unwrap();
    let registry = Arc::clone(&server.registry);
    wait_until("session registration", || registry.active_sessions() == 1);

    client.close();
    wait_until("session teardown", || registry.active_sessions() == 0);
}

#[test]
fn concurrent_enrollments_from_separate_connections_all_land() {
    let server = spawn_server(false, MAX_EVENT_BYTES, None);
    let addr = server.addr;

    let handles: Vec<_> = [("alice", 1u32), ("bob", 2u32)]
        .into_iter()
        .map(|(uid, seed)| {
            thread::spawn(move || {
                let mut client = GateClient::connect(addr, CREDENTIAL).unwrap();
                let outcome = client.enroll(&[person_frame(seed)], uid, |_| {}).unwrap();
                client.close();
                outcome.status
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), ResultStatus::Enrolled);
    }

    let mut client = GateClient::connect(addr, CREDENTIAL).unwrap();
    let alice = client.identify(&[person_frame(1)], |_| {}).unwrap();
    assert_eq!(alice.uid.as_deref(), Some("alice"));
    let bob = client.identify(&[person_frame(2)], |_| {}).unwrap();
    assert_eq!(bob.uid.as_deref(), Some("bob"));
    client.close();
}

#[test]
fn audit_log_records_enroll_and_identify() {
    let audit_dir = tempfile::tempdir().unwrap();
    let log_path = audit_dir.path().join("audit.jsonl");
    let server = spawn_server(false, MAX_EVENT_BYTES, Some(log_path.clone()));

    let mut client = GateClient::connect(server.addr, CREDENTIAL).unwrap();
    client.enroll(&[person_frame(1)], "alice", |_| {}).unwrap();
    client.identify(&[person_frame(1)], |_| {}).unwrap();
    client.close();

    wait_until("audit records", || {
        std::fs::read_to_string(&log_path)
            .map(|s| s.lines().count() == 2)
            .unwrap_or(false)
    });
    let contents = std::fs::read_to_string(&log_path).unwrap();
    let records: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records[0]["operation"], "enroll");
    assert_eq!(records[0]["uid"], "alice");
    assert_eq!(records[0]["credential"], CREDENTIAL);
    assert_eq!(records[1]["operation"], "identify");
    assert_eq!(records[1]["uid"], "alice");
}
