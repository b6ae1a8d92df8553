use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::io::{duplex, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use crate::appendlog::AppendLog;
use crate::error::Error;
use crate::follower::FollowerNode;
use crate::leader::LeaderNode;
use crate::message::{self, ResponseCode, UpdateRequest, UpdateResponse, VersionUpdate};
use crate::store::{Datastore, MemoryStore};
use crate::supervisor::Supervisor;

fn mem() -> Arc<MemoryStore> {
    Arc::new(MemoryStore::new())
}

fn socket_dir() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("test.sock");
    (dir, socket)
}

#[test]
fn update_request_round_trip() {
    let msg = UpdateRequest {
        request_id: 7,
        version: 3,
        data: b"payload".to_vec(),
    };
    assert_eq!(UpdateRequest::decode(&msg.encode()).unwrap(), msg);
}

#[test]
fn update_response_round_trip() {
    let msg = UpdateResponse {
        request_id: 42,
        code: ResponseCode::MismatchedVersion as u16,
        version: 9,
        data: Vec::new(),
    };
    assert_eq!(UpdateResponse::decode(&msg.encode()).unwrap(), msg);
}

#[test]
fn version_update_round_trip() {
    let msg = VersionUpdate {
        version: u64::MAX,
        data: vec![0, 1, 2, 255],
    };
    assert_eq!(VersionUpdate::decode(&msg.encode()).unwrap(), msg);

    let empty = VersionUpdate {
        version: 0,
        data: Vec::new(),
    };
    assert_eq!(VersionUpdate::decode(&empty.encode()).unwrap(), empty);
}

#[test]
fn decode_rejects_wrong_message_type() {
    let body = VersionUpdate {
        version: 1,
        data: vec![],
    }
    .encode();
    assert!(matches!(
        UpdateRequest::decode(&body),
        Err(Error::UnexpectedMessageType(4))
    ));
    assert!(matches!(
        UpdateResponse::decode(&body),
        Err(Error::UnexpectedMessageType(4))
    ));
}

#[test]
fn decode_rejects_truncated_body() {
    let mut body = UpdateRequest {
        request_id: 1,
        version: 1,
        data: b"data".to_vec(),
    }
    .encode();
    body.truncate(10);
    assert!(matches!(
        UpdateRequest::decode(&body),
        Err(Error::TruncatedMessage)
    ));

    assert!(matches!(
        UpdateResponse::decode(&[3]),
        Err(Error::TruncatedMessage)
    ));
    assert!(matches!(
        VersionUpdate::decode(&[0, 4, 1]),
        Err(Error::TruncatedMessage)
    ));
}

#[tokio::test]
async fn frames_round_trip() {
    let (mut tx, rx) = duplex(1024);
    let mut rx = BufReader::new(rx);

    let first = VersionUpdate {
        version: 9,
        data: b"abc".to_vec(),
    }
    .encode();
    let second = UpdateRequest {
        request_id: 1,
        version: 9,
        data: Vec::new(),
    }
    .encode();

    message::write_frame(&mut tx, &first).await.unwrap();
    message::write_frame(&mut tx, &second).await.unwrap();
    drop(tx);

    assert_eq!(message::read_frame(&mut rx).await.unwrap().unwrap(), first);
    assert_eq!(message::read_frame(&mut rx).await.unwrap().unwrap(), second);
    // Clean close at a frame boundary.
    assert!(message::read_frame(&mut rx).await.unwrap().is_none());
}

#[tokio::test]
async fn truncated_frame_is_an_error() {
    // EOF inside the body.
    let (mut tx, mut rx) = duplex(1024);
    tx.write_all(&20u64.to_be_bytes()).await.unwrap();
    tx.write_all(b"short").await.unwrap();
    drop(tx);
    assert!(message::read_frame(&mut rx).await.is_err());

    // EOF inside the length prefix.
    let (mut tx, mut rx) = duplex(1024);
    tx.write_all(&[0, 0, 0]).await.unwrap();
    drop(tx);
    assert!(message::read_frame(&mut rx).await.is_err());
}

#[tokio::test]
async fn oversized_frame_is_rejected() {
    let (mut tx, mut rx) = duplex(64);
    tx.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
    assert!(message::read_frame(&mut rx).await.is_err());
}

#[test]
fn memory_store_round_trip() {
    let store = MemoryStore::new();
    store.open().unwrap();
    assert_eq!(store.get().unwrap(), (0, Vec::new()));

    store.put(3, b"value").unwrap();
    assert_eq!(store.get().unwrap(), (3, b"value".to_vec()));
    store.close().unwrap();
}

#[test]
fn append_log_round_trip_across_reopen() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.log");

    let log = AppendLog::new(&path);
    log.open().unwrap();
    log.put(1, b"first").unwrap();
    log.put(2, b"second").unwrap();
    assert_eq!(log.get().unwrap(), (2, b"second".to_vec()));
    log.close().unwrap();

    let log = AppendLog::new(&path);
    log.open().unwrap();
    assert_eq!(log.get().unwrap(), (2, b"second".to_vec()));
}

#[test]
fn append_log_keeps_superseded_bytes() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.log");

    let log = AppendLog::new(&path);
    log.open().unwrap();
    log.put(1, b"first").unwrap();
    log.put(2, b"second").unwrap();

    // Old values stay in the data region; only the header moves.
    let size = fs_err::metadata(&path).unwrap().len();
    assert_eq!(size, 26 + 5 + 6);
}

#[test]
fn append_log_reads_empty_store() {
    let dir = TempDir::new().unwrap();
    let log = AppendLog::new(dir.path().join("state.log"));
    log.open().unwrap();
    assert_eq!(log.get().unwrap(), (0, Vec::new()));
}

#[test]
fn append_log_requires_open() {
    let dir = TempDir::new().unwrap();
    let log = AppendLog::new(dir.path().join("state.log"));

    assert!(matches!(log.put(1, b"x"), Err(Error::FileNotOpen)));
    assert!(matches!(log.get(), Err(Error::FileNotOpen)));

    log.open().unwrap();
    log.put(1, b"x").unwrap();
    log.close().unwrap();
    assert!(matches!(log.get(), Err(Error::FileNotOpen)));
}

#[test]
fn append_log_rejects_unknown_file_version() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.log");
    fs_err::write(&path, 5u16.to_be_bytes()).unwrap();

    let log = AppendLog::new(&path);
    assert!(matches!(log.open(), Err(Error::UnexpectedFileVersion)));
}

#[test]
fn append_log_rejects_offset_past_next_offset() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.log");

    let mut header = Vec::new();
    header.extend_from_slice(&1u16.to_be_bytes());
    header.extend_from_slice(&2u64.to_be_bytes());
    header.extend_from_slice(&1u64.to_be_bytes());
    fs_err::write(&path, &header).unwrap();

    let log = AppendLog::new(&path);
    assert!(matches!(log.open(), Err(Error::NextOffsetOutOfRange)));
}

#[test]
fn append_log_rejects_offset_past_file_size() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.log");

    let mut header = Vec::new();
    header.extend_from_slice(&1u16.to_be_bytes());
    header.extend_from_slice(&100u64.to_be_bytes());
    header.extend_from_slice(&200u64.to_be_bytes());
    fs_err::write(&path, &header).unwrap();

    let log = AppendLog::new(&path);
    assert!(matches!(log.open(), Err(Error::OffsetOutOfRange)));
}

#[tokio::test]
async fn leader_write_advances_version() {
    let (_dir, socket) = socket_dir();
    let leader = LeaderNode::new(&socket, mem()).unwrap();

    leader.write(0, b"a").await.unwrap();
    assert_eq!(leader.version().unwrap(), 1);
    assert_eq!(leader.data().unwrap(), b"a");

    leader.close().await.unwrap();
}

#[tokio::test]
async fn leader_rejects_stale_version() {
    let (_dir, socket) = socket_dir();
    let leader = LeaderNode::new(&socket, mem()).unwrap();

    let err = leader.write(5, b"a").await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch));
    assert_eq!(leader.version().unwrap(), 0);

    leader.close().await.unwrap();
}

#[tokio::test]
async fn accepted_writes_advance_the_version_by_one_each() {
    let (_dir, socket) = socket_dir();
    let leader = LeaderNode::new(&socket, mem()).unwrap();

    for i in 0..10 {
        leader.write(i, format!("v{i}").into_bytes()).await.unwrap();
    }
    assert_eq!(leader.version().unwrap(), 10);

    leader.close().await.unwrap();
}

#[tokio::test]
async fn second_leader_on_same_socket_is_rejected() {
    let (_dir, socket) = socket_dir();
    let _leader = LeaderNode::new(&socket, mem()).unwrap();

    assert!(matches!(
        LeaderNode::new(&socket, mem()),
        Err(Error::LeaderAlreadyExists)
    ));
}

#[tokio::test]
async fn leader_rejects_directory_at_socket_path() {
    let (_dir, socket) = socket_dir();
    fs_err::create_dir(&socket).unwrap();

    assert!(matches!(
        LeaderNode::new(&socket, mem()),
        Err(Error::InvalidSocket)
    ));
}

#[tokio::test]
async fn leader_releases_socket_on_close() {
    let (_dir, socket) = socket_dir();
    let leader = LeaderNode::new(&socket, mem()).unwrap();
    leader.close().await.unwrap();
    assert!(fs_err::metadata(&socket).is_err());

    // The path is free for the next leader.
    let leader = LeaderNode::new(&socket, mem()).unwrap();
    leader.close().await.unwrap();
}

#[tokio::test]
async fn follower_bootstraps_from_leader() {
    let (_dir, socket) = socket_dir();
    let leader_ds = mem();
    leader_ds.put(7, b"s").unwrap();
    let _leader = LeaderNode::new(&socket, leader_ds).unwrap();

    let follower_ds = mem();
    let (follower, _close_rx) = FollowerNode::new(&socket, follower_ds.clone()).await.unwrap();

    // The constructor does not return before the snapshot is applied.
    assert_eq!(follower.version().unwrap(), 7);
    assert_eq!(follower.data().unwrap(), b"s");
    assert_eq!(follower_ds.get().unwrap(), (7, b"s".to_vec()));
}

#[tokio::test]
async fn follower_write_forwards_to_leader() {
    let (_dir, socket) = socket_dir();
    let leader_ds = mem();
    leader_ds.put(7, b"s").unwrap();
    let leader = LeaderNode::new(&socket, leader_ds).unwrap();

    let (follower, _close_rx) = FollowerNode::new(&socket, mem()).await.unwrap();
    follower.write(7, b"t").await.unwrap();

    assert_eq!(leader.version().unwrap(), 8);
    assert_eq!(leader.data().unwrap(), b"t");
    // The follower persisted the leader-assigned version without waiting on
    // the broadcast.
    assert_eq!(follower.version().unwrap(), 8);

    // A follower attached afterwards bootstraps with the new state.
    let late_ds = mem();
    let (_late, _close_rx) = FollowerNode::new(&socket, late_ds.clone()).await.unwrap();
    assert_eq!(late_ds.get().unwrap(), (8, b"t".to_vec()));
}

#[tokio::test]
async fn follower_rejects_stale_write_locally() {
    let (_dir, socket) = socket_dir();
    let leader_ds = mem();
    leader_ds.put(7, b"s").unwrap();
    let _leader = LeaderNode::new(&socket, leader_ds).unwrap();

    let (follower, _close_rx) = FollowerNode::new(&socket, mem()).await.unwrap();
    let err = follower.write(3, b"t").await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch));
    assert_eq!(follower.version().unwrap(), 7);
}

#[tokio::test]
async fn concurrent_followers_race_on_the_same_version() {
    let (_dir, socket) = socket_dir();
    let _leader = LeaderNode::new(&socket, mem()).unwrap();

    let (a, _ca) = FollowerNode::new(&socket, mem()).await.unwrap();
    let (b, _cb) = FollowerNode::new(&socket, mem()).await.unwrap();

    a.write(0, b"x").await.unwrap();

    // Whether the check fires locally or at the leader depends on whether
    // the broadcast landed yet; the verdict is the same either way.
    let err = b.write(0, b"y").await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch));
}

#[tokio::test]
async fn broadcast_skips_the_originating_follower() {
    let (_dir, socket) = socket_dir();
    let _leader = LeaderNode::new(&socket, mem()).unwrap();

    let (a, _ca) = FollowerNode::new(&socket, mem()).await.unwrap();
    let (b, _cb) = FollowerNode::new(&socket, mem()).await.unwrap();

    let (a_tx, mut a_rx) = mpsc::unbounded_channel();
    a.watch(a_tx);
    let (b_tx, mut b_rx) = mpsc::unbounded_channel();
    b.watch(b_tx);

    a.write(0, b"x").await.unwrap();

    let update = timeout(Duration::from_secs(1), b_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.version(), 1);
    assert_eq!(update.bytes(), b"x");

    // The originator already got the result in its response and must not
    // see the broadcast for its own write.
    assert!(timeout(Duration::from_millis(200), a_rx.recv()).await.is_err());
}

#[tokio::test]
async fn unknown_frames_are_dropped_by_the_leader() {
    let (_dir, socket) = socket_dir();
    let _leader = LeaderNode::new(&socket, mem()).unwrap();

    let stream = UnixStream::connect(&socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let bootstrap = message::read_frame(&mut reader).await.unwrap().unwrap();
    let bootstrap = VersionUpdate::decode(&bootstrap).unwrap();
    assert_eq!(bootstrap.version, 0);

    // An unknown tag is dropped; the connection and the next request
    // survive it.
    message::write_frame(&mut write_half, &[0, 9, 1, 2, 3])
        .await
        .unwrap();
    let req = UpdateRequest {
        request_id: 1,
        version: 0,
        data: b"v".to_vec(),
    };
    message::write_frame(&mut write_half, &req.encode())
        .await
        .unwrap();

    let res = message::read_frame(&mut reader).await.unwrap().unwrap();
    let res = UpdateResponse::decode(&res).unwrap();
    assert_eq!(res.request_id, 1);
    assert_eq!(res.code, ResponseCode::Ok as u16);
    assert_eq!(res.version, 1);
    assert_eq!(res.data, b"v");
}

#[tokio::test]
async fn follower_write_fails_after_leader_close() {
    let (_dir, socket) = socket_dir();
    let leader = LeaderNode::new(&socket, mem()).unwrap();
    let (follower, _close_rx) = FollowerNode::new(&socket, mem()).await.unwrap();

    leader.close().await.unwrap();
    sleep(Duration::from_millis(100)).await;

    let err = follower.write(0, b"x").await.unwrap_err();
    assert!(matches!(err, Error::LeaderClosed));
}

#[tokio::test]
async fn follower_gets_invalid_socket_for_plain_file() {
    let (_dir, socket) = socket_dir();
    fs_err::write(&socket, b"not a socket").unwrap();

    let err = FollowerNode::new(&socket, mem()).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSocket));
}

#[tokio::test]
async fn follower_gets_leader_closed_for_dead_socket() {
    let (_dir, socket) = socket_dir();
    let listener = UnixListener::bind(&socket).unwrap();
    drop(listener);

    let err = FollowerNode::new(&socket, mem()).await.unwrap_err();
    assert!(matches!(err, Error::LeaderClosed));
}

#[tokio::test]
async fn supervisor_serves_reads_and_writes() {
    let dir = TempDir::new().unwrap();
    let store = mem();
    let state = Supervisor::new(dir.path(), store.clone(), store);
    state.open().await.unwrap();
    assert!(state.is_leader());

    let v0 = state.current().unwrap();
    assert_eq!(v0.version(), 0);
    v0.update(b"x").await.unwrap();

    let v1 = state.current().unwrap();
    assert_eq!(v1.version(), 1);
    assert_eq!(v1.bytes(), b"x");

    // The old handle is stale now.
    let err = v0.update(b"y").await.unwrap_err();
    assert!(matches!(err, Error::VersionMismatch));

    state.close().await.unwrap();
}

#[tokio::test]
async fn version_handle_fails_after_supervisor_close() {
    let dir = TempDir::new().unwrap();
    let state = Supervisor::new(dir.path(), mem(), mem());
    state.open().await.unwrap();

    let handle = state.current().unwrap();
    state.close().await.unwrap();

    let err = handle.update(b"z").await.unwrap_err();
    assert!(matches!(err, Error::NodeClosed));
}

#[tokio::test]
async fn supervisor_recovers_from_stale_socket() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("interstate.sock");
    // A listener that goes away without unlinking leaves a dead socket, the
    // same footprint as a crashed leader.
    let listener = UnixListener::bind(&socket).unwrap();
    drop(listener);

    let state = Supervisor::new(dir.path(), mem(), mem());
    state.open().await.unwrap();
    assert!(state.is_leader());

    state.close().await.unwrap();
}

#[tokio::test]
async fn open_can_be_retried_after_exhausting_retries() {
    let dir = TempDir::new().unwrap();
    // Binding inside a directory that does not exist fails every attempt.
    let missing = dir.path().join("later");

    let state = Supervisor::new(&missing, mem(), mem());
    let err = state.open().await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted));

    // A failed open leaves the supervisor unopened; once the directory
    // exists the same instance can acquire a role for real.
    fs_err::create_dir(&missing).unwrap();
    state.open().await.unwrap();
    assert!(state.is_leader());
    state.write(0, b"x").await.unwrap();

    state.close().await.unwrap();
}

#[tokio::test]
async fn leader_watchers_observe_rejected_client_writes() {
    let (_dir, socket) = socket_dir();
    let leader_ds = mem();
    leader_ds.put(4, b"now").unwrap();
    let leader = LeaderNode::new(&socket, leader_ds).unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    leader.watch(tx);

    let stream = UnixStream::connect(&socket).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let _bootstrap = message::read_frame(&mut reader).await.unwrap().unwrap();

    let req = UpdateRequest {
        request_id: 1,
        version: 9,
        data: b"stale".to_vec(),
    };
    message::write_frame(&mut write_half, &req.encode())
        .await
        .unwrap();

    let res = message::read_frame(&mut reader).await.unwrap().unwrap();
    let res = UpdateResponse::decode(&res).unwrap();
    assert_eq!(res.code, ResponseCode::MismatchedVersion as u16);
    assert_eq!(res.version, 4);

    // The rejection reaches watchers too, carrying the unchanged version
    // and no data.
    let v = timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v.version(), 4);
    assert!(v.bytes().is_empty());

    leader.close().await.unwrap();
}

#[tokio::test]
async fn failover_promotes_follower() {
    let dir = TempDir::new().unwrap();

    let s1 = Supervisor::new(dir.path(), mem(), mem());
    s1.open().await.unwrap();
    assert!(s1.is_leader());
    s1.write(0, b"seed").await.unwrap();

    let s2 = Supervisor::new(dir.path(), mem(), mem());
    s2.open().await.unwrap();
    assert!(!s2.is_leader());
    assert_eq!(s2.current().unwrap().version(), 1);

    s1.close().await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !s2.is_leader() {
        assert!(
            Instant::now() < deadline,
            "follower did not take over within two seconds"
        );
        sleep(Duration::from_millis(50)).await;
    }

    // The new leader serves writes against its own datastore.
    let current = s2.current().unwrap();
    current.update(b"after").await.unwrap();
    assert_eq!(s2.current().unwrap().version(), current.version() + 1);
    assert_eq!(s2.current().unwrap().bytes(), b"after");

    s2.close().await.unwrap();
}

#[tokio::test]
async fn watch_survives_role_transition() {
    let dir = TempDir::new().unwrap();

    let s1 = Supervisor::new(dir.path(), mem(), mem());
    s1.open().await.unwrap();
    let s2 = Supervisor::new(dir.path(), mem(), mem());
    s2.open().await.unwrap();
    assert!(!s2.is_leader());

    let mut updates = s2.watch();

    // As a follower, s2 sees the leader's broadcasts.
    s1.write(0, b"one").await.unwrap();
    let v = timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v.version(), 1);
    assert_eq!(v.bytes(), b"one");

    s1.close().await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while !s2.is_leader() {
        assert!(Instant::now() < deadline, "follower did not take over");
        sleep(Duration::from_millis(50)).await;
    }

    // As a leader, the same subscription sees writes forwarded by a fresh
    // follower.
    let s3 = Supervisor::new(dir.path(), mem(), mem());
    s3.open().await.unwrap();
    s3.current().unwrap().update(b"two").await.unwrap();

    let v = timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(v.bytes(), b"two");

    s2.close().await.unwrap();
    s3.close().await.unwrap();
}

#[tokio::test]
async fn leader_backed_by_append_log_survives_restart() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("test.sock");
    let log_path = dir.path().join("state.log");

    {
        let leader = LeaderNode::new(&socket, Arc::new(AppendLog::new(&log_path))).unwrap();
        leader.write(0, b"durable").await.unwrap();
        leader.close().await.unwrap();
    }

    let leader = LeaderNode::new(&socket, Arc::new(AppendLog::new(&log_path))).unwrap();
    assert_eq!(leader.version().unwrap(), 1);
    assert_eq!(leader.data().unwrap(), b"durable");
    leader.close().await.unwrap();
}
