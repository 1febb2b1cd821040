//! Rotation and resumption scenarios for the file follower.

use std::fs;
use std::io::Write;
use std::time::Duration;

use tokio::time::timeout;

use siphon::follower::{FollowMode, Follower, RawLine};

const WAIT: Duration = Duration::from_secs(10);

async fn next(rx: &mut tokio::sync::mpsc::Receiver<RawLine>) -> RawLine {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("follower channel closed")
}

#[tokio::test]
async fn test_rotation_rename_and_recreate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.json");
    let rotated = dir.path().join("access.json.1");

    let mut f = fs::File::create(&path).unwrap();
    writeln!(f, "line A").unwrap();
    f.flush().unwrap();

    let follower =
        Follower::new(&path, FollowMode::FromStart).with_teardown(Duration::from_millis(300));
    let (mut rx, shutdown, handle) = follower.spawn(16);

    let a = next(&mut rx).await;
    assert_eq!(a.line, "line A\n");
    assert_eq!(a.offset, 0);

    // classic logrotate: rename the file, recreate the same name, write on
    fs::rename(&path, &rotated).unwrap();
    let mut newf = fs::File::create(&path).unwrap();
    writeln!(newf, "line B").unwrap();
    newf.flush().unwrap();

    let b = next(&mut rx).await;
    assert_eq!(b.line, "line B\n");
    assert_eq!(b.offset, 0);
    assert_ne!(a.inode, b.inode, "rotation must yield a fresh file instance");

    let _ = shutdown.send(true);
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_lines_flushed_into_old_handle_during_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.json");
    let rotated = dir.path().join("access.json.1");

    let mut f = fs::File::create(&path).unwrap();
    writeln!(f, "before").unwrap();
    f.flush().unwrap();

    let follower =
        Follower::new(&path, FollowMode::FromStart).with_teardown(Duration::from_secs(2));
    let (mut rx, shutdown, handle) = follower.spawn(16);

    let before = next(&mut rx).await;
    assert_eq!(before.line, "before\n");

    // rename, then keep writing through the old handle during the linger
    fs::rename(&path, &rotated).unwrap();
    writeln!(f, "straggler").unwrap();
    f.flush().unwrap();
    fs::File::create(&path).unwrap();

    let straggler = next(&mut rx).await;
    assert_eq!(straggler.line, "straggler\n");
    assert_eq!(straggler.inode, before.inode);
    assert_eq!(straggler.offset, before.line.len() as u64);

    let _ = shutdown.send(true);
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_no_duplicates_across_rotation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("access.json");
    let rotated = dir.path().join("access.json.1");

    let mut f = fs::File::create(&path).unwrap();
    for i in 0..5 {
        writeln!(f, "old {}", i).unwrap();
    }
    f.flush().unwrap();

    let follower =
        Follower::new(&path, FollowMode::FromStart).with_teardown(Duration::from_millis(300));
    let (mut rx, shutdown, handle) = follower.spawn(64);

    for i in 0..5 {
        let raw = next(&mut rx).await;
        assert_eq!(raw.line, format!("old {}\n", i));
    }

    fs::rename(&path, &rotated).unwrap();
    let mut newf = fs::File::create(&path).unwrap();
    for i in 0..5 {
        writeln!(newf, "new {}", i).unwrap();
    }
    newf.flush().unwrap();

    let mut seen = Vec::new();
    for _ in 0..5 {
        let raw = next(&mut rx).await;
        seen.push((raw.inode, raw.offset, raw.line.clone()));
    }
    for (i, (_, _, line)) in seen.iter().enumerate() {
        assert_eq!(line, &format!("new {}\n", i));
    }
    // no gaps, no repeats: offsets are the running sum of line lengths
    let mut expected = 0u64;
    for (_, offset, line) in &seen {
        assert_eq!(*offset, expected);
        expected += line.len() as u64;
    }

    let _ = shutdown.send(true);
    timeout(WAIT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_missing_file_is_a_startup_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("never-created.json");

    let follower = Follower::new(&path, FollowMode::Tail);
    let (_rx, _shutdown, handle) = follower.spawn(16);

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(result.is_err());
}
