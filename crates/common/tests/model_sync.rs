//! End-to-end model behavior over an in-memory mock transport: index
//! reconciliation, the read path, pull coalescing, and pinning.

mod support;

use std::sync::Arc;
use std::time::Duration;

use driftfs_common::protocol::{ClusterConfig, FileKind, RequestError};
use driftfs_common::{Config, Database, Model, ModelError};

use support::*;

async fn new_model(dir: &std::path::Path, config: Config) -> Model {
    let db = Database::open(dir).await.unwrap();
    Model::new(db, config, None).await.unwrap()
}

#[tokio::test]
async fn basic_index_and_lookup() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    model
        .index(
            &bob,
            "F",
            &[
                file_entry("f1", vec![(1, 1)], &[b"11111111"]),
                file_entry("f2", vec![(1, 1)], &[b"22222222"]),
                dir_entry("dir1", vec![(1, 1)]),
                file_entry("dir1/g1", vec![(1, 1)], &[b"33333333"]),
                file_entry("dir1/g2", vec![(1, 1)], &[b"44444444"]),
            ],
        )
        .await
        .unwrap();

    let mut root: Vec<String> = model
        .get_children("F", "")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    root.sort();
    assert_eq!(root, vec!["dir1", "f1", "f2"]);

    let mut sub: Vec<String> = model
        .get_children("F", "dir1")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    sub.sort();
    assert_eq!(sub, vec!["dir1/g1", "dir1/g2"]);

    let entry = model.get_entry("F", "dir1").await.unwrap().unwrap();
    assert_eq!(entry.kind, FileKind::Directory);
}

#[tokio::test]
async fn unauthorized_peer_is_ignored() {
    let bob = device(1);
    let carol = device(2);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    model
        .index(&carol, "F", &[file_entry("f1", vec![(1, 1)], &[b"xxxxxxxx"])])
        .await
        .unwrap();

    assert!(model.get_entry("F", "f1").await.unwrap().is_none());
    assert!(model.get_children("F", "").await.unwrap().is_empty());
}

#[tokio::test]
async fn index_is_idempotent() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let files = vec![
        dir_entry("d", vec![(1, 1)]),
        file_entry("d/child", vec![(1, 2)], &[b"zzzzzzzz"]),
    ];
    model.index(&bob, "F", &files).await.unwrap();
    let before = model.get_entry("F", "d/child").await.unwrap().unwrap();
    let children_before = model.get_children("F", "").await.unwrap().len();

    model.index(&bob, "F", &files).await.unwrap();
    let after = model.get_entry("F", "d/child").await.unwrap().unwrap();

    assert_eq!(before, after);
    assert_eq!(model.get_children("F", "").await.unwrap().len(), children_before);
}

#[tokio::test]
async fn deleted_invalid_and_symlink_entries_are_masked() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let mut deleted = file_entry("deleted", vec![(1, 1)], &[]);
    deleted.deleted = true;
    let mut invalid = file_entry("invalid", vec![(1, 1)], &[]);
    invalid.invalid = true;
    let mut symlink = file_entry("symlink", vec![(1, 1)], &[]);
    symlink.kind = FileKind::Symlink;

    model.index(&bob, "F", &[deleted, invalid, symlink]).await.unwrap();

    assert!(model.get_entry("F", "deleted").await.unwrap().is_none());
    assert!(model.get_entry("F", "invalid").await.unwrap().is_none());
    assert!(model.get_entry("F", "symlink").await.unwrap().is_none());
}

#[tokio::test]
async fn newer_version_replaces_entry() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    model
        .index(&bob, "F", &[file_entry("file2dir", vec![(1, 0)], &[b"datadata"])])
        .await
        .unwrap();
    assert_eq!(
        model.get_entry("F", "file2dir").await.unwrap().unwrap().kind,
        FileKind::File
    );

    model
        .index_update(&bob, "F", &[dir_entry("file2dir", vec![(1, 1)])])
        .await
        .unwrap();
    assert_eq!(
        model.get_entry("F", "file2dir").await.unwrap().unwrap().kind,
        FileKind::Directory
    );
}

#[tokio::test]
async fn concurrent_conflict_winner_is_commutative() {
    let bob = device(1);
    let carol = device(2);

    let version_a = file_entry("f", vec![(1, 2), (2, 0)], &[b"aaaaaaaa"]);
    let version_b = file_entry("f", vec![(1, 0), (2, 3)], &[b"bbbbbbbb"]);

    let dir1 = tempfile::tempdir().unwrap();
    let first = new_model(
        dir1.path(),
        test_config(vec![folder_config("F", &[bob, carol], &[])], vec![]),
    )
    .await;
    first.index(&bob, "F", std::slice::from_ref(&version_a)).await.unwrap();
    first.index(&carol, "F", std::slice::from_ref(&version_b)).await.unwrap();

    let dir2 = tempfile::tempdir().unwrap();
    let second = new_model(
        dir2.path(),
        test_config(vec![folder_config("F", &[bob, carol], &[])], vec![]),
    )
    .await;
    second.index(&carol, "F", std::slice::from_ref(&version_b)).await.unwrap();
    second.index(&bob, "F", std::slice::from_ref(&version_a)).await.unwrap();

    let winner_first = first.get_entry("F", "f").await.unwrap().unwrap();
    let winner_second = second.get_entry("F", "f").await.unwrap().unwrap();
    assert_eq!(winner_first.version, winner_second.version);
    assert_eq!(winner_first.blocks, winner_second.blocks);
}

#[tokio::test]
async fn read_assembles_across_blocks() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let p1 = b"ABCDEFGH";
    let p2 = b"IJKLMNOP";
    let p3 = b"QRSTU";
    let conn = MockConnection::new(bob);
    conn.program("F", "file", 0, p1);
    conn.program("F", "file", 8, p2);
    conn.program("F", "file", 16, p3);
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("file", vec![(1, 1)], &[p1, p2, p3])])
        .await
        .unwrap();

    // window [6, 12): last two bytes of block 0, first four of block 1
    let data = model.read("F", "file", 6, 6).await.unwrap();
    assert_eq!(&data, b"GHIJKL");

    // the whole file, now mostly from cache
    let data = model.read("F", "file", 0, 21).await.unwrap();
    assert_eq!(&data, b"ABCDEFGHIJKLMNOPQRSTU");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_reads_coalesce_into_one_fetch() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let payload = b"ABCDEFGH";
    let conn = MockConnection::new(bob);
    conn.program_with_delay("F", "one", 0, payload, Duration::from_millis(50));
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("one", vec![(1, 1)], &[payload])])
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let model = model.clone();
        handles.push(tokio::spawn(async move {
            model.read("F", "one", 0, 8).await.unwrap()
        }));
    }
    for handle in handles {
        assert_eq!(handle.await.unwrap(), payload);
    }

    assert_eq!(conn.request_count(), 1);
}

#[tokio::test]
async fn sequential_read_prefetches_next_block() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let p1 = b"ABCDEFGH";
    let p2 = b"IJKLM";
    let conn = MockConnection::new(bob);
    conn.program("F", "file", 0, p1);
    conn.program("F", "file", 8, p2);
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("file", vec![(1, 1)], &[p1, p2])])
        .await
        .unwrap();

    let data = model.read("F", "file", 0, 4).await.unwrap();
    assert_eq!(&data, b"ABCD");

    // the block past the read end gets pulled in the background
    let conn_for_wait = conn.clone();
    assert!(wait_until(move || {
        let conn = conn_for_wait.clone();
        async move { conn.request_count() == 2 }
    })
    .await);

    // and the follow-up read is served from the cache
    let data = model.read("F", "file", 8, 5).await.unwrap();
    assert_eq!(&data, b"IJKLM");
    assert_eq!(conn.request_count(), 2);
}

#[tokio::test]
async fn read_of_unknown_path_is_no_such_file() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    match model.read("F", "missing", 0, 4).await {
        Err(ModelError::NoSuchFile) => {}
        other => panic!("expected NoSuchFile, got {other:?}"),
    }
    match model.read("nofolder", "missing", 0, 4).await {
        Err(ModelError::NoSuchFile) => {}
        other => panic!("expected NoSuchFile, got {other:?}"),
    }
}

#[tokio::test]
async fn fetch_failure_surfaces_after_all_peers_fail() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let payload = b"ABCDEFGH";
    let conn = MockConnection::new(bob);
    conn.program_error(
        "F",
        "file",
        0,
        RequestError::Transport("connection reset".to_string()),
    );
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("file", vec![(1, 1)], &[payload])])
        .await
        .unwrap();

    match model.read("F", "file", 0, 8).await {
        Err(ModelError::FetchFailed(_)) => {}
        other => panic!("expected FetchFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn corrupt_payload_falls_back_to_next_peer() {
    let bob = device(1);
    let carol = device(2);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob, carol], &[])], vec![]),
    )
    .await;

    let payload = b"ABCDEFGH";
    let bad = MockConnection::new(bob);
    bad.program("F", "file", 0, b"tampered");
    let good = MockConnection::new(carol);
    good.program("F", "file", 0, payload);
    model.add_connection(bad.clone()).await;
    model.add_connection(good.clone()).await;

    let entry = file_entry("file", vec![(1, 1)], &[payload]);
    model.index(&bob, "F", std::slice::from_ref(&entry)).await.unwrap();
    model.index(&carol, "F", std::slice::from_ref(&entry)).await.unwrap();

    // whatever order the peers are tried in, only the verified payload
    // is returned
    let data = model.read("F", "file", 0, 8).await.unwrap();
    assert_eq!(&data, payload);
}

#[tokio::test]
async fn corrupt_payload_from_only_peer_fails_the_read() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    let payload = b"ABCDEFGH";
    let conn = MockConnection::new(bob);
    conn.program("F", "file", 0, b"tampered");
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("file", vec![(1, 1)], &[payload])])
        .await
        .unwrap();

    match model.read("F", "file", 0, 8).await {
        Err(ModelError::FetchFailed(_)) => {}
        other => panic!("expected FetchFailed, got {other:?}"),
    }
    assert_eq!(conn.request_count(), 1);
}

#[tokio::test]
async fn pinned_file_is_downloaded_in_background() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &["pin.txt"])], vec![]),
    )
    .await;

    let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(());
    model.spawn_pinner_workers(shutdown_rx);

    let p1 = b"ABCDEFGH";
    let p2 = b"IJKLM";
    let conn = MockConnection::new(bob);
    conn.program("F", "pin.txt", 0, p1);
    conn.program("F", "pin.txt", 8, p2);
    model.add_connection(conn.clone()).await;

    model
        .index(&bob, "F", &[file_entry("pin.txt", vec![(1, 1)], &[p1, p2])])
        .await
        .unwrap();

    let model_for_wait = model.clone();
    assert!(wait_until(move || {
        let model = model_for_wait.clone();
        async move {
            let status = model.pin_status().await.unwrap();
            status.get("F").map(|s| s.pinned_files) == Some(1)
        }
    })
    .await);

    let status = model.pin_status().await.unwrap();
    assert_eq!(status["F"].pinned_bytes, 13);
    assert_eq!(status["F"].pending_files, 0);

    // the peer can go away; pinned content stays readable
    model.close(&bob, None).await;
    let data = model.read("F", "pin.txt", 0, 13).await.unwrap();
    assert_eq!(&data, b"ABCDEFGHIJKLM");
}

#[tokio::test]
async fn index_survives_restart() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(vec![folder_config("F", &[bob], &[])], vec![]);

    {
        let model = new_model(dir.path(), config.clone()).await;
        model
            .index(
                &bob,
                "F",
                &[
                    dir_entry("docs", vec![(1, 1)]),
                    file_entry("docs/a.txt", vec![(1, 2)], &[b"aaaaaaaa"]),
                ],
            )
            .await
            .unwrap();
    }

    let model = new_model(dir.path(), config).await;
    let entry = model.get_entry("F", "docs/a.txt").await.unwrap().unwrap();
    assert_eq!(entry.size, 8);
    let children: Vec<String> = model
        .get_children("F", "docs")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(children, vec!["docs/a.txt"]);
}

#[tokio::test]
async fn unconfigured_folder_state_is_removed_on_startup() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();

    {
        let model = new_model(
            dir.path(),
            test_config(vec![folder_config("old", &[bob], &[])], vec![]),
        )
        .await;
        model
            .index(&bob, "old", &[file_entry("f", vec![(1, 1)], &[b"xxxxxxxx"])])
            .await
            .unwrap();
    }

    // a run without the folder wipes its state
    {
        let model = new_model(
            dir.path(),
            test_config(vec![folder_config("other", &[bob], &[])], vec![]),
        )
        .await;
        assert!(!model.has_folder("old").await);
    }

    // re-adding the folder starts from an empty index
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("old", &[bob], &[])], vec![]),
    )
    .await;
    assert!(model.get_entry("old", "f").await.unwrap().is_none());
}

#[tokio::test]
async fn connect_advertises_cluster_config() {
    let bob = device(1);
    let carol = device(2);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(
            vec![
                folder_config("shared", &[bob, carol], &[]),
                folder_config("private", &[carol], &[]),
            ],
            vec![],
        ),
    )
    .await;

    let conn = MockConnection::new(bob);
    model.add_connection(conn.clone()).await;

    assert!(conn.was_started());
    let configs = conn.received_cluster_configs();
    assert_eq!(configs.len(), 1);
    let config = &configs[0];
    assert_eq!(config.device_name, "local");
    assert_eq!(config.folders.len(), 1);
    assert_eq!(config.folders[0].id, "shared");
    assert_eq!(config.folders[0].devices.len(), 2);

    // registering the same peer again is rejected without killing anything
    let duplicate = MockConnection::new(bob);
    model.add_connection(duplicate.clone()).await;
    assert!(!duplicate.was_started());
    assert_eq!(model.connections().await.len(), 1);

    model.close(&bob, Some("test over".to_string())).await;
    assert!(model.connections().await.is_empty());
}

#[tokio::test]
async fn peer_name_is_adopted_once() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path()).await.unwrap();

    let mut config = test_config(vec![folder_config("F", &[bob], &[])], vec![]);
    config.devices.push(driftfs_common::DeviceConfig {
        device_id: bob,
        name: String::new(),
        addresses: vec!["dynamic".to_string()],
        compression: false,
        cert_name: String::new(),
    });

    let persister = Arc::new(RecordingPersister::default());
    let model = Model::new(
        db,
        config,
        Some(persister.clone() as Arc<dyn driftfs_common::ConfigPersister>),
    )
    .await
    .unwrap();

    let announcement = ClusterConfig {
        device_name: "Bobby".to_string(),
        client_name: "other".to_string(),
        client_version: "0.0.0".to_string(),
        folders: vec![],
    };
    model.cluster_config(&bob, &announcement);

    {
        let saved = persister.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].device(&bob).unwrap().name, "Bobby");
    }

    // an already-known name is not overwritten
    let second = ClusterConfig {
        device_name: "Impostor".to_string(),
        ..announcement
    };
    model.cluster_config(&bob, &second);
    assert_eq!(persister.saved.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn inbound_requests_are_refused() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(vec![folder_config("F", &[bob], &[])], vec![]),
    )
    .await;

    match model.request(&bob, "F", "anything", 0, 8) {
        Err(ModelError::NoSuchFile) => {}
        other => panic!("expected NoSuchFile, got {other:?}"),
    }
}

#[tokio::test]
async fn folder_listing_and_prefix_completion() {
    let bob = device(1);
    let dir = tempfile::tempdir().unwrap();
    let model = new_model(
        dir.path(),
        test_config(
            vec![folder_config("alpha", &[bob], &[]), folder_config("beta", &[bob], &[])],
            vec![],
        ),
    )
    .await;

    assert_eq!(model.list_folders().await, vec!["alpha", "beta"]);
    assert!(model.has_folder("alpha").await);
    assert!(!model.has_folder("gamma").await);

    model
        .index(
            &bob,
            "alpha",
            &[
                file_entry("report.txt", vec![(1, 1)], &[b"xxxxxxxx"]),
                file_entry("readme.md", vec![(1, 1)], &[b"yyyyyyyy"]),
            ],
        )
        .await
        .unwrap();

    let mut hits = model.paths_matching_prefix("alpha", "re").await.unwrap();
    hits.sort();
    assert_eq!(hits, vec!["readme.md", "report.txt"]);
    assert!(model.paths_matching_prefix("gamma", "re").await.unwrap().is_empty());
}
