use futures::TryStreamExt;
use hyperdrive::{Drive, DriveOptions, Error, Event, ReadOptions, Storage, WriteOptions};

async fn new_drive() -> Drive {
    Drive::open(Storage::memory(), DriveOptions::default())
        .await
        .unwrap()
}

async fn write(drive: &Drive, path: &str, data: &[u8]) {
    drive
        .write_file(path, data.to_vec(), WriteOptions::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn write_then_read_round_trips() {
    let drive = new_drive().await;
    write(&drive, "/a.txt", b"hello").await;

    let data = drive.read_file("/a.txt").await.unwrap();
    assert_eq!(&data[..], b"hello");
    assert_eq!(drive.read_file_to_string("/a.txt").await.unwrap(), "hello");
}

#[tokio::test]
async fn readdir_lists_bare_names() {
    let drive = new_drive().await;
    write(&drive, "/a.txt", b"hello").await;
    write(&drive, "/b.txt", b"world").await;

    let mut names = drive.readdir("/").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt"]);

    write(&drive, "/dir/nested.txt", b"x").await;
    assert_eq!(drive.readdir("/dir").await.unwrap(), vec!["nested.txt"]);

    // The directory shows up once at the root, not per descendant.
    let mut names = drive.readdir("/").await.unwrap();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "dir"]);
}

#[tokio::test]
async fn checkout_reads_history_from_before_an_unlink() {
    let drive = new_drive().await;
    write(&drive, "/a.txt", b"hello").await;
    write(&drive, "/b.txt", b"world").await;
    let version = drive.version();

    drive.unlink("/a.txt").await.unwrap();
    assert!(matches!(
        drive.stat("/a.txt").await,
        Err(Error::FileNotFound(_))
    ));

    let snapshot = drive.checkout(version).unwrap();
    assert_eq!(snapshot.version(), version);
    let data = snapshot.read_file("/a.txt").await.unwrap();
    assert_eq!(&data[..], b"hello");

    // The checkout never observes writes made after its version.
    write(&drive, "/c.txt", b"later").await;
    assert!(matches!(
        snapshot.stat("/c.txt").await,
        Err(Error::FileNotFound(_))
    ));
}

#[tokio::test]
async fn rmdir_of_a_populated_root_fails() {
    let drive = new_drive().await;
    write(&drive, "/a.txt", b"hello").await;
    write(&drive, "/b.txt", b"world").await;

    assert!(matches!(
        drive.rmdir("/").await,
        Err(Error::DirectoryNotEmpty(_))
    ));
    assert!(drive.exists("/a.txt").await.unwrap());
}

#[tokio::test]
async fn reopening_the_same_storage_by_key_reads_large_files() {
    let dir = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();

    let drive = Drive::open(Storage::dir(dir.path()), DriveOptions::default())
        .await
        .unwrap();
    let stat = drive
        .write_file("/x", payload.clone(), WriteOptions::default())
        .await
        .unwrap();
    // 200 KB split into four blocks of at most 64 KiB.
    assert_eq!(stat.blocks, 4);
    assert_eq!(stat.size, 200_000);
    let key = drive.key();
    drive.close().unwrap();
    drop(drive);

    let reopened = Drive::open(
        Storage::dir(dir.path()),
        DriveOptions {
            key: Some(key),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(reopened.key(), key);

    let data = reopened.read_file("/x").await.unwrap();
    assert_eq!(data.len(), 200_000);
    assert_eq!(&data[..], &payload[..]);
}

#[tokio::test]
async fn stat_of_a_missing_path_fails() {
    let drive = new_drive().await;
    match drive.stat("/missing").await {
        Err(Error::FileNotFound(path)) => assert_eq!(path, "missing"),
        other => panic!("expected FileNotFound, got {other:?}"),
    }
    assert!(!drive.exists("/missing").await.unwrap());
}

#[tokio::test]
async fn empty_files_round_trip() {
    let drive = new_drive().await;
    let stat = drive
        .write_file("/empty", Vec::new(), WriteOptions::default())
        .await
        .unwrap();
    assert_eq!((stat.size, stat.blocks), (0, 0));

    let data = drive.read_file("/empty").await.unwrap();
    assert!(data.is_empty());
}

#[tokio::test]
async fn unlink_keeps_content_bytes() {
    let drive = new_drive().await;
    write(&drive, "/doomed", b"ghost bytes").await;

    let version_before = drive.version();
    drive.unlink("/doomed").await.unwrap();

    assert!(matches!(
        drive.stat("/doomed").await,
        Err(Error::FileNotFound(_))
    ));
    // The unlink appended a tombstone; nothing was reclaimed.
    assert!(drive.version() > version_before);
    let checkout = drive.checkout(version_before).unwrap();
    assert_eq!(&checkout.read_file("/doomed").await.unwrap()[..], b"ghost bytes");

    assert!(matches!(
        drive.unlink("/doomed").await,
        Err(Error::FileNotFound(_))
    ));
}

#[tokio::test]
async fn mkdir_and_rmdir_life_cycle() {
    let drive = new_drive().await;
    drive.mkdir("/logs", Some(0o700)).await.unwrap();

    let stat = drive.stat("/logs").await.unwrap();
    assert!(stat.is_directory());
    assert_eq!(stat.mode & 0o777, 0o700);

    write(&drive, "/logs/today", b"entry").await;
    assert!(matches!(
        drive.rmdir("/logs").await,
        Err(Error::DirectoryNotEmpty(_))
    ));
    assert!(drive.exists("/logs/today").await.unwrap());

    drive.unlink("/logs/today").await.unwrap();
    drive.rmdir("/logs").await.unwrap();
    assert!(matches!(
        drive.stat("/logs").await,
        Err(Error::FileNotFound(_))
    ));
}

#[tokio::test]
async fn implicit_directories_synthesize_stats() {
    let drive = new_drive().await;
    write(&drive, "/deep/nested/file", b"x").await;

    let stat = drive.stat("/deep/nested").await.unwrap();
    assert!(stat.is_directory());
    let stat = drive.stat("/deep").await.unwrap();
    assert!(stat.is_directory());
}

#[tokio::test]
async fn concurrent_writes_produce_disjoint_ranges() {
    let drive = new_drive().await;

    let (first, second) = tokio::join!(
        drive.write_file("/one", vec![1u8; 100_000], WriteOptions::default()),
        drive.write_file("/two", vec![2u8; 100_000], WriteOptions::default()),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    // The append mutex serializes them; whichever ran second starts at
    // or past the end of the other.
    let (lo, hi) = if first.byte_offset < second.byte_offset {
        (&first, &second)
    } else {
        (&second, &first)
    };
    assert!(lo.byte_offset + lo.size <= hi.byte_offset);
    assert!(lo.offset + lo.blocks <= hi.offset);

    assert_eq!(&drive.read_file("/one").await.unwrap()[..], &[1u8; 100_000][..]);
    assert_eq!(&drive.read_file("/two").await.unwrap()[..], &[2u8; 100_000][..]);
}

#[tokio::test]
async fn read_stream_honors_start_and_length() {
    let drive = new_drive().await;
    write(&drive, "/abc", b"abcdefghij").await;

    let stream = drive
        .read_stream(
            "/abc",
            ReadOptions {
                start: 3,
                length: Some(4),
            },
        )
        .await
        .unwrap();
    let chunks: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"defg");

    // Reading past the end clamps instead of failing.
    let stream = drive
        .read_stream(
            "/abc",
            ReadOptions {
                start: 8,
                length: Some(100),
            },
        )
        .await
        .unwrap();
    let chunks: Vec<_> = stream.try_collect().await.unwrap();
    assert_eq!(chunks.concat(), b"ij");
}

#[tokio::test]
async fn watch_reports_changes_under_a_prefix() {
    let drive = new_drive().await;
    let mut watcher = drive.watch("/logs");

    write(&drive, "/logs/a", b"1").await;
    write(&drive, "/other", b"2").await;
    write(&drive, "/logs/b", b"3").await;

    assert_eq!(watcher.changed().await.unwrap(), "logs/a");
    assert_eq!(watcher.changed().await.unwrap(), "logs/b");
}

#[tokio::test]
async fn write_events_fire_in_order() {
    let drive = new_drive().await;
    let mut events = drive.subscribe();

    write(&drive, "/evt", b"payload").await;

    let mut saw_appending = false;
    let mut saw_append = false;
    let mut saw_update = false;
    let deadline = tokio::time::Duration::from_secs(5);
    while !(saw_appending && saw_append && saw_update) {
        let event = tokio::time::timeout(deadline, events.recv())
            .await
            .expect("events arrive promptly")
            .unwrap();
        match event {
            Event::Appending { path } => {
                assert!(!saw_append, "appending precedes append");
                assert_eq!(path, "evt");
                saw_appending = true;
            }
            Event::Append { path } => {
                assert!(saw_appending);
                assert_eq!(path, "evt");
                saw_append = true;
            }
            Event::Update => saw_update = true,
            Event::Content => {}
        }
    }
}

#[tokio::test]
async fn drive_identity_is_stable() {
    let drive = new_drive().await;
    assert!(drive.writable());
    assert_ne!(drive.key(), drive.discovery_key());

    // Version starts at 1: the metadata header block.
    assert_eq!(drive.version(), 1);
    write(&drive, "/f", b"x").await;
    assert_eq!(drive.version(), 2);
}
