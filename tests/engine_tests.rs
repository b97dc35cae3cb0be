//! Integration tests for the engine in follow mode.
//!
//! Streams are driven by a `TestWaker`; the assertions poll the rendered
//! metrics because lines reach the program workers asynchronously.

use herakles_log_exporter::engine::{Engine, EngineOptions};
use herakles_log_exporter::exporter::{ExporterOptions, Format};
use herakles_log_exporter::runtime::RuntimeOptions;
use herakles_log_exporter::waker::Waker;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::Duration;

const COUNT_PROGRAM: &str = "counter lines by file\n/./ {\n  lines[getfilename()]++\n}\n";

fn options(progs: &Path, logs: &str) -> EngineOptions {
    EngineOptions {
        logs: vec![logs.to_string()],
        runtime: RuntimeOptions {
            program_path: Some(progs.to_path_buf()),
            workers: 2,
            ..RuntimeOptions::default()
        },
        exporter: ExporterOptions {
            hostname: "testhost".into(),
            ..ExporterOptions::default()
        },
        poll_interval: Duration::from_millis(10),
        ..EngineOptions::default()
    }
}

fn append(path: &Path, data: &str) {
    let mut f = OpenOptions::new().append(true).create(true).open(path).unwrap();
    f.write_all(data.as_bytes()).unwrap();
}

/// Waits until the varz rendering contains `needle`.
async fn wait_for(engine: &Engine, needle: &str) {
    for _ in 0..500 {
        let out = engine.render(Format::Varz).unwrap();
        if out.contains(needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "timed out waiting for {:?}, last rendering:\n{}",
        needle,
        engine.render(Format::Varz).unwrap()
    );
}

#[tokio::test]
async fn test_follow_counts_appended_lines() {
    let dir = tempfile::tempdir().unwrap();
    let progs = dir.path().join("progs");
    fs::create_dir(&progs).unwrap();
    fs::write(progs.join("count.lpm"), COUNT_PROGRAM).unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "written before startup\n").unwrap();

    let (waker, handle) = Waker::test();
    let engine = Engine::with_waker(options(&progs, &log.display().to_string()), waker).unwrap();
    engine.load_programs().unwrap();
    assert_eq!(engine.poll_logs().await, 1);

    append(&log, "one\ntwo\n");
    handle.wake(1).await;
    let label = format!("lines{{file={},prog=count.lpm,instance=testhost}}", log.display());
    wait_for(&engine, &format!("{} 2\n", label)).await;

    append(&log, "three\n");
    handle.wake(1).await;
    wait_for(&engine, &format!("{} 3\n", label)).await;

    let telemetry = engine.render_metrics().unwrap();
    assert!(telemetry.contains("herakles_log_lines_total 3\n"), "{}", telemetry);
    assert!(telemetry.contains("herakles_log_log_count 1\n"), "{}", telemetry);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_background_discovery_finds_new_files() {
    let dir = tempfile::tempdir().unwrap();
    let progs = dir.path().join("progs");
    fs::create_dir(&progs).unwrap();
    fs::write(progs.join("count.lpm"), COUNT_PROGRAM).unwrap();

    let (waker, _handle) = Waker::test();
    let pattern = format!("{}/*.log", dir.path().display());
    let engine = Engine::with_waker(options(&progs, &pattern), waker).unwrap();
    engine.load_programs().unwrap();
    engine.poll_logs().await;
    engine.start();

    // Files appearing after the first discovery pass are read from the start.
    let log = dir.path().join("late.log");
    fs::write(&log, "a\nb\nc\n").unwrap();
    wait_for(
        &engine,
        &format!("lines{{file={},prog=count.lpm,instance=testhost}} 3\n", log.display()),
    )
    .await;
    assert_eq!(engine.tailer().sources().await, vec![log.display().to_string()]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_program_reload_keeps_metrics() {
    let dir = tempfile::tempdir().unwrap();
    let progs = dir.path().join("progs");
    fs::create_dir(&progs).unwrap();
    let prog = progs.join("words.lpm");
    fs::write(&prog, "counter words\n/word/ {\n  words++\n}\n").unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "").unwrap();

    let (waker, handle) = Waker::test();
    let engine = Engine::with_waker(options(&progs, &log.display().to_string()), waker).unwrap();
    engine.load_programs().unwrap();
    engine.poll_logs().await;

    append(&log, "word\n");
    handle.wake(1).await;
    wait_for(&engine, "words{prog=words.lpm,instance=testhost} 1\n").await;

    // Same metric, new pattern: the count carries over.
    fs::write(&prog, "counter words\n/(word|term)/ {\n  words++\n}\n").unwrap();
    let summary = engine.load_programs().unwrap();
    assert_eq!(summary.loaded, 1);
    assert_eq!(engine.load_programs().unwrap().unchanged, 1);

    append(&log, "term\n");
    handle.wake(1).await;
    wait_for(&engine, "words{prog=words.lpm,instance=testhost} 2\n").await;

    // A broken edit keeps the previous version running.
    fs::write(&prog, "counter words\n/(/ {\n  words++\n}\n").unwrap();
    let summary = engine.load_programs().unwrap();
    assert_eq!(summary.failed, 1);
    assert!(engine.runtime().load_errors().contains_key("words.lpm"));
    assert_eq!(engine.runtime().programs().len(), 1);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_drains_pending_lines() {
    let dir = tempfile::tempdir().unwrap();
    let progs = dir.path().join("progs");
    fs::create_dir(&progs).unwrap();
    fs::write(progs.join("count.lpm"), COUNT_PROGRAM).unwrap();
    let log = dir.path().join("app.log");
    fs::write(&log, "").unwrap();

    let (waker, handle) = Waker::test();
    let engine = Engine::with_waker(options(&progs, &log.display().to_string()), waker).unwrap();
    engine.load_programs().unwrap();
    engine.poll_logs().await;

    let body: String = (0..200).map(|i| format!("line {}\n", i)).collect();
    append(&log, &body);
    handle.wake(1).await;
    handle.parked(1).await;
    engine.shutdown().await;

    // Every line the stream read was processed before shutdown returned.
    let out = engine.render(Format::Varz).unwrap();
    assert!(
        out.contains(&format!(
            "lines{{file={},prog=count.lpm,instance=testhost}} 200\n",
            log.display()
        )),
        "{}",
        out
    );
}
