//! Integration tests for log stream tailing.
//!
//! Every test drives read cycles with a `TestWaker`, so a stream only reads
//! when the test wakes it. Lines are received from the same channel the
//! program workers consume in production.

use herakles_log_exporter::logline::LogLine;
use herakles_log_exporter::tailer::{Tailer, TailerOptions};
use herakles_log_exporter::telemetry::EngineMetrics;
use herakles_log_exporter::waker::{TestWaker, Waker};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

struct Harness {
    tailer: Tailer,
    lines: mpsc::Receiver<LogLine>,
    waker: Arc<TestWaker>,
}

fn harness(options: TailerOptions) -> Harness {
    let (tx, rx) = mpsc::channel(1024);
    let (waker, handle) = Waker::test();
    let tailer = Tailer::new(tx, waker, EngineMetrics::unregistered(), options);
    Harness {
        tailer,
        lines: rx,
        waker: handle,
    }
}

async fn next_line(rx: &mut mpsc::Receiver<LogLine>) -> LogLine {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("line channel closed")
}

async fn next_text(rx: &mut mpsc::Receiver<LogLine>) -> String {
    let line = next_line(rx).await;
    assert!(!line.eof, "unexpected end of stream for {}", line.filename);
    line.line
}

fn append(path: &Path, data: &str) {
    let mut f = OpenOptions::new().append(true).create(true).open(path).unwrap();
    f.write_all(data.as_bytes()).unwrap();
}

#[tokio::test]
async fn test_existing_file_is_read_from_end() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "old line\n").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    assert_eq!(h.tailer.poll().await, 1);

    append(&log, "new line\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "new line");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_read_from_start() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "first\nsecond\n").unwrap();

    let mut h = harness(TailerOptions {
        read_from_start: true,
        ..TailerOptions::default()
    });
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;

    assert_eq!(next_text(&mut h.lines).await, "first");
    assert_eq!(next_text(&mut h.lines).await, "second");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_partial_line_waits_for_newline() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;

    append(&log, "half a ");
    h.waker.wake(1).await;
    // Parked again means the cycle that saw the partial line is over.
    h.waker.parked(1).await;
    assert!(matches!(h.lines.try_recv(), Err(TryRecvError::Empty)));

    append(&log, "line\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "half a line");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_truncated_file_is_reread() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;

    append(&log, "line 1\nline 2\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "line 1");
    assert_eq!(next_text(&mut h.lines).await, "line 2");

    fs::write(&log, "line 3\n").unwrap();
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "line 3");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_rotation_completes_old_stream_and_reads_new_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let source = log.display().to_string();
    fs::write(&log, "").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer
        .add_pattern(&format!("{}/*.log", dir.path().display()))
        .unwrap();
    h.tailer.poll().await;

    append(&log, "before\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "before");

    fs::rename(&log, dir.path().join("app.log.1")).unwrap();
    fs::write(&log, "after\n").unwrap();
    h.waker.wake(1).await;

    let eof = next_line(&mut h.lines).await;
    assert!(eof.eof);
    assert_eq!(&*eof.filename, source);
    assert!(h.tailer.lookup(&source).await.unwrap().is_complete());

    // The new file is found by the next discovery pass and read from 0.
    assert_eq!(h.tailer.poll().await, 1);
    assert_eq!(next_text(&mut h.lines).await, "after");
    assert!(!h.tailer.lookup(&source).await.unwrap().is_complete());
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_deleted_file_completes_and_is_collected() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    let source = log.display().to_string();
    fs::write(&log, "").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&source).unwrap();
    h.tailer.poll().await;

    append(&log, "last words\n");
    fs::remove_file(&log).unwrap();
    h.waker.wake(1).await;

    // Data written before the delete is still delivered.
    assert_eq!(next_text(&mut h.lines).await, "last words");
    assert!(next_line(&mut h.lines).await.eof);
    assert!(h.tailer.all_complete().await);
    assert_eq!(h.tailer.gc().await, 1);
    assert!(h.tailer.sources().await.is_empty());
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_glob_picks_up_new_files() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.log"), "").unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer
        .add_pattern(&format!("{}/*.log", dir.path().display()))
        .unwrap();
    assert_eq!(h.tailer.poll().await, 1);

    let b = dir.path().join("b.log");
    fs::write(&b, "from b\n").unwrap();
    fs::write(dir.path().join("c.txt"), "not matched\n").unwrap();
    assert_eq!(h.tailer.poll().await, 1);
    assert_eq!(next_text(&mut h.lines).await, "from b");

    let sources = h.tailer.sources().await;
    assert_eq!(sources.len(), 2);
    assert!(sources[1].ends_with("b.log"));
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_one_shot_reads_to_eof_and_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "1\n2\nno newline").unwrap();

    let mut h = harness(TailerOptions {
        one_shot: true,
        ..TailerOptions::default()
    });
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;
    h.tailer.join().await;

    assert_eq!(next_text(&mut h.lines).await, "1");
    assert_eq!(next_text(&mut h.lines).await, "2");
    assert_eq!(next_text(&mut h.lines).await, "no newline");
    assert!(next_line(&mut h.lines).await.eof);
    assert!(h.tailer.all_complete().await);
}

#[tokio::test]
async fn test_named_pipe() {
    let dir = tempfile::tempdir().unwrap();
    let fifo = dir.path().join("app.pipe");
    nix::unistd::mkfifo(&fifo, nix::sys::stat::Mode::S_IRWXU).unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&fifo.display().to_string()).unwrap();
    assert_eq!(h.tailer.poll().await, 1);

    {
        let mut writer = OpenOptions::new().write(true).open(&fifo).unwrap();
        writer.write_all(b"through\nthe pipe\n").unwrap();
    }
    assert_eq!(next_text(&mut h.lines).await, "through");
    assert_eq!(next_text(&mut h.lines).await, "the pipe");

    // A writer going away is not the end of the pipe.
    let handle = h.tailer.lookup(&fifo.display().to_string()).await.unwrap();
    assert!(!handle.is_complete());
    h.tailer.shutdown().await;
    assert!(handle.is_complete());
}

#[tokio::test]
async fn test_unix_stream_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.sock");

    let mut h = harness(TailerOptions {
        read_timeout: Duration::from_secs(5),
        ..TailerOptions::default()
    });
    h.tailer
        .add_pattern(&format!("unix://{}", path.display()))
        .unwrap();
    assert_eq!(h.tailer.poll().await, 1);
    // Bound once; later passes do not rebind.
    assert_eq!(h.tailer.poll().await, 0);

    {
        use tokio::io::AsyncWriteExt;
        let mut conn = tokio::net::UnixStream::connect(&path).await.unwrap();
        conn.write_all(b"hello\nunterminated").await.unwrap();
        conn.shutdown().await.unwrap();
    }
    assert_eq!(next_text(&mut h.lines).await, "hello");
    // The peer closing flushes the partial line.
    assert_eq!(next_text(&mut h.lines).await, "unterminated");

    h.tailer.shutdown().await;
    assert!(!path.exists());
}

#[tokio::test]
async fn test_unix_datagram_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("in.dgram");

    let mut h = harness(TailerOptions::default());
    h.tailer
        .add_pattern(&format!("unixgram://{}", path.display()))
        .unwrap();
    assert_eq!(h.tailer.poll().await, 1);

    let client = tokio::net::UnixDatagram::unbound().unwrap();
    client.send_to(b"one\ntwo", &path).await.unwrap();
    client.send_to(b"three", &path).await.unwrap();

    // Each datagram ends its last line.
    assert_eq!(next_text(&mut h.lines).await, "one");
    assert_eq!(next_text(&mut h.lines).await, "two");
    assert_eq!(next_text(&mut h.lines).await, "three");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_stale_stream_is_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("quiet.log");
    fs::write(&log, "").unwrap();

    let mut h = harness(TailerOptions {
        stale_timeout: Duration::ZERO,
        ..TailerOptions::default()
    });
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;
    h.waker.parked(1).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(h.tailer.gc().await, 0);
    assert!(next_line(&mut h.lines).await.eof);
    assert!(h.tailer.all_complete().await);
    assert_eq!(h.tailer.gc().await, 1);
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_restarted_stale_stream_resumes_where_it_stopped() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("quiet.log");
    fs::write(&log, "old1\nold2\n").unwrap();

    let mut h = harness(TailerOptions {
        stale_timeout: Duration::ZERO,
        read_from_start: true,
        ..TailerOptions::default()
    });
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;
    assert_eq!(next_text(&mut h.lines).await, "old1");
    assert_eq!(next_text(&mut h.lines).await, "old2");
    h.waker.parked(1).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.tailer.gc().await;
    assert!(next_line(&mut h.lines).await.eof);
    assert_eq!(h.tailer.gc().await, 1);

    // The file is unchanged, so the new stream starts after "old2".
    assert_eq!(h.tailer.poll().await, 1);
    append(&log, "new\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "new");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_restarted_stream_on_replaced_file_reads_from_start() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("quiet.log");
    fs::write(&log, "old\n").unwrap();

    let mut h = harness(TailerOptions {
        stale_timeout: Duration::ZERO,
        ..TailerOptions::default()
    });
    h.tailer.add_pattern(&log.display().to_string()).unwrap();
    h.tailer.poll().await;
    h.waker.parked(1).await;

    tokio::time::sleep(Duration::from_millis(10)).await;
    h.tailer.gc().await;
    assert!(next_line(&mut h.lines).await.eof);
    assert_eq!(h.tailer.gc().await, 1);

    // A different file now sits at the path; all of it is new.
    let tmp = dir.path().join("quiet.log.new");
    fs::write(&tmp, "fresh\n").unwrap();
    fs::rename(&tmp, &log).unwrap();
    assert_eq!(h.tailer.poll().await, 1);
    assert_eq!(next_text(&mut h.lines).await, "fresh");
    h.tailer.shutdown().await;
}

#[tokio::test]
async fn test_symlink_retarget_drains_old_target_first() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.log");
    let b = dir.path().join("b.log");
    let link = dir.path().join("current.log");
    let source = link.display().to_string();
    fs::write(&a, "").unwrap();
    fs::write(&b, "").unwrap();
    std::os::unix::fs::symlink(&a, &link).unwrap();

    let mut h = harness(TailerOptions::default());
    h.tailer.add_pattern(&source).unwrap();
    assert_eq!(h.tailer.poll().await, 1);

    append(&a, "a1\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "a1");

    // Written to the old target just before the switch.
    append(&a, "a2\n");
    append(&b, "b1\n");
    let tmp = dir.path().join("current.log.tmp");
    std::os::unix::fs::symlink(&b, &tmp).unwrap();
    fs::rename(&tmp, &link).unwrap();
    h.waker.wake(1).await;

    assert_eq!(next_text(&mut h.lines).await, "a2");
    let eof = next_line(&mut h.lines).await;
    assert!(eof.eof);
    assert_eq!(&*eof.filename, source);
    assert!(h.tailer.lookup(&source).await.unwrap().is_complete());

    assert_eq!(h.tailer.poll().await, 1);
    assert_eq!(next_text(&mut h.lines).await, "b1");
    append(&b, "b2\n");
    h.waker.wake(1).await;
    assert_eq!(next_text(&mut h.lines).await, "b2");

    h.waker.parked(1).await;
    assert!(matches!(h.lines.try_recv(), Err(TryRecvError::Empty)));
    assert!(!h.tailer.lookup(&source).await.unwrap().is_complete());
    h.tailer.shutdown().await;
}
