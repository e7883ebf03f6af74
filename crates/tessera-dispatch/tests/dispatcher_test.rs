//! End-to-end tests: a real dispatcher on a Unix socket, blocking clients.

#![allow(clippy::expect_used)]

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tempfile::tempdir;
use tessera_blocks::{BlockStore, FileNames, StoreConfig};
use tessera_dispatch::client::DispatcherClient;
use tessera_dispatch::coordinator::{Footprint, ShadowFiles};
use tessera_dispatch::{DispatchError, DispatchServer, DispatcherConfig, RetryPolicy};

fn config(dir: &Path, test: &str) -> DispatcherConfig {
    let shared_name = format!("/tessera_it_{}_{test}", std::process::id());
    let mut config = DispatcherConfig::new(dir, shared_name);
    config.controlled_files = vec!["nodes".to_string()];
    config.space = 1 << 30;
    config.time = 1 << 20;
    config.purge_interval_ms = 50;
    config
}

fn start(config: DispatcherConfig) -> (PathBuf, thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("runtime");
        runtime.block_on(async move {
            let server = DispatchServer::bind(config).expect("bind");
            tx.send(server.socket_path().to_path_buf())
                .expect("send socket path");
            server.run().await.expect("run");
        });
    });
    (rx.recv().expect("socket path"), handle)
}

fn stop(socket: &Path, handle: thread::JoinHandle<()>) {
    DispatcherClient::connect_as(socket, 1)
        .expect("connect")
        .terminate()
        .expect("terminate");
    handle.join().expect("server thread");
}

fn seed(dir: &Path, keys: &[u32]) {
    let mut store = BlockStore::<u32>::open(dir, "nodes", StoreConfig::new(256)).expect("open");
    for &key in keys {
        store.insert_block(key, b"node", 0).expect("insert");
    }
    store.persist().expect("persist");
}

fn main_len(dir: &Path) -> usize {
    BlockStore::<u32>::open(dir, "nodes", StoreConfig::new(256))
        .expect("open")
        .index()
        .len()
}

fn open_shadow(dir: &Path) -> BlockStore<u32> {
    BlockStore::open_shadow(dir, "nodes", StoreConfig::new(256)).expect("open shadow")
}

fn fast() -> RetryPolicy {
    RetryPolicy::new(40, Duration::from_millis(50))
}

#[test]
fn commit_waits_for_reader_to_release_index() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), &[1, 2]);
    let (socket, server) = start(config(dir.path(), "commit"));
    let names = FileNames::new(dir.path(), "nodes");

    let mut writer = DispatcherClient::connect_as(&socket, 1001).expect("writer");
    writer.write_start(&fast()).expect("write_start");
    assert!(names.shadow_index().exists());

    let mut reader = DispatcherClient::connect_as(&socket, 1002).expect("reader");
    reader
        .request_read_and_idx(30, 1 << 20, 0, &fast())
        .expect("admitted");

    let mut store = open_shadow(dir.path());
    store.insert_block(3, b"node", 0).expect("insert");
    store.persist().expect("persist");

    let committer = thread::spawn(move || {
        writer
            .set_read_timeout(Duration::from_millis(100))
            .expect("timeout");
        writer.write_commit(&fast())
    });

    thread::sleep(Duration::from_millis(300));
    assert!(names.shadow_index().exists(), "commit must wait for the reader");
    assert_eq!(main_len(dir.path()), 2);

    reader.read_idx_finished().expect("read_idx_finished");
    committer
        .join()
        .expect("committer thread")
        .expect("commit");

    assert!(!names.shadow_index().exists());
    assert_eq!(main_len(dir.path()), 3);
    reader.read_finished().expect("read_finished");

    stop(&socket, server);
}

#[test]
fn reader_blocks_stay_intact_across_two_commits() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), &[1]);
    let (socket, server) = start(config(dir.path(), "pinned"));

    let mut reader = DispatcherClient::connect_as(&socket, 5001).expect("reader");
    reader
        .request_read_and_idx(30, 1 << 20, 0, &fast())
        .expect("admitted");
    let reader_store =
        BlockStore::<u32>::open(dir.path(), "nodes", StoreConfig::new(256)).expect("open");
    let held = reader_store.index().find(&1).cloned().expect("key 1");
    reader.read_idx_finished().expect("read_idx_finished");

    let mut writer = DispatcherClient::connect_as(&socket, 5002).expect("writer");
    writer.write_start(&fast()).expect("first write_start");
    let mut store = open_shadow(dir.path());
    let id = store.index().find(&1).expect("key 1").id();
    store.erase_block(&id).expect("erase");
    store.persist().expect("persist");
    drop(store);
    writer.write_commit(&fast()).expect("first commit");

    writer.write_start(&fast()).expect("second write_start");
    let mut store = open_shadow(dir.path());
    for key in 2..5 {
        let entry = store.write(key, b"fresh", 0).expect("write");
        assert_ne!(entry.position, held.position, "key {key} reused a held block");
    }
    store.persist().expect("persist");
    drop(store);
    writer.write_commit(&fast()).expect("second commit");

    assert_eq!(reader_store.read(&held).expect("reader block"), b"node");
    reader.read_finished().expect("read_finished");

    stop(&socket, server);
}

#[test]
fn second_writer_polls_until_lock_released() {
    let dir = tempdir().expect("tempdir");
    let (socket, server) = start(config(dir.path(), "writers"));

    let mut first = DispatcherClient::connect_as(&socket, 2001).expect("first");
    first.write_start(&fast()).expect("first lock");

    let mut second = DispatcherClient::connect_as(&socket, 2002).expect("second");
    assert!(matches!(
        second.write_start(&RetryPolicy::new(3, Duration::from_millis(10))),
        Err(DispatchError::Timeout { attempts: 3 })
    ));

    first.write_rollback().expect("rollback");
    second.write_start(&fast()).expect("second lock");
    second.write_commit(&fast()).expect("commit");

    stop(&socket, server);
}

#[test]
fn disconnect_releases_reservation() {
    let dir = tempdir().expect("tempdir");
    let (socket, server) = start(config(dir.path(), "hangup"));

    let mut reader = DispatcherClient::connect_as(&socket, 3001).expect("reader");
    reader
        .request_read_and_idx(30, 1 << 20, 9, &fast())
        .expect("admitted");

    let mut observer = DispatcherClient::connect_as(&socket, 3002).expect("observer");
    assert_eq!(observer.query_by_token(9).expect("query"), Some(3001));
    let status = observer.query_my_status(9).expect("status");
    assert_eq!(status.readers.len(), 1);

    drop(reader);
    let mut released = false;
    for _ in 0..40 {
        if observer.query_by_token(9).expect("query").is_none() {
            released = true;
            break;
        }
        thread::sleep(Duration::from_millis(25));
    }
    assert!(released, "reader reservation survived its connection");

    observer.output_status().expect("status dump");
    let status_file = format!("tessera_it_{}_hangup.shadow.status", std::process::id());
    assert!(dir.path().join(status_file).exists());

    stop(&socket, server);
}

#[test]
fn restart_finishes_interrupted_commit() {
    let dir = tempdir().expect("tempdir");
    seed(dir.path(), &[1]);
    let config = config(dir.path(), "recovery");

    // A writer got as far as the commit marker, then the dispatcher died.
    let files = ShadowFiles::new(dir.path(), config.shadow_name(), &config.controlled_files);
    files.lock(4001).expect("lock");
    files.snapshot(&Footprint::default()).expect("snapshot");
    let mut store = open_shadow(dir.path());
    store.insert_block(2, b"node", 0).expect("insert");
    store.persist().expect("persist");
    drop(store);
    File::create(files.barrier_path()).expect("barrier");
    assert_eq!(main_len(dir.path()), 1);

    let (socket, server) = start(config);
    // Recovery ran before the socket was handed out.
    assert_eq!(main_len(dir.path()), 2);
    assert!(!files.barrier_path().exists());
    assert!(!files.lock_path().exists());

    let mut writer = DispatcherClient::connect_as(&socket, 4002).expect("writer");
    writer.write_start(&fast()).expect("lock is free again");
    writer.write_rollback().expect("rollback");

    stop(&socket, server);
}
