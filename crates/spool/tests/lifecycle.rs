//! Registry lifecycle against a live in-memory stream.

use spool::playback;
use spool::{
    EndReason, Location, MemoryStream, Registry, RecordingStore, SessionSpec, SessionState,
    SourceRef, SpoolError, StopCondition,
};
use spoolconf::{CaptureConfig, EmptyBatchPolicy};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn capture_config() -> CaptureConfig {
    CaptureConfig {
        poll_interval_ms: 2,
        block_timeout_ms: 50,
        max_batch: 4,
        default_duration_secs: 1,
        empty_batch: EmptyBatchPolicy::Retry,
    }
}

fn setup(dir: &TempDir) -> (Arc<Registry>, Arc<MemoryStream>) {
    let stream = Arc::new(MemoryStream::new());
    let store = RecordingStore::new(dir.path().join("tmp"), dir.path().join("perm"), ".spool");
    let registry = Arc::new(Registry::new(store, stream.clone(), capture_config()));
    (registry, stream)
}

/// Appends an entry every couple of milliseconds until dropped.
struct Producer {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Producer {
    fn spawn(stream: Arc<MemoryStream>) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread = thread::spawn(move || {
            let mut i: u32 = 0;
            while flag.load(Ordering::Relaxed) {
                stream.add("imu", "accel", [("seq", i.to_le_bytes().to_vec())]);
                i += 1;
                thread::sleep(Duration::from_millis(2));
            }
        });
        Self {
            running,
            thread: Some(thread),
        }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn settle(registry: &Registry, name: &str) {
    match registry.wait(name) {
        Ok(_) | Err(SpoolError::NotActive(_)) => {}
        Err(e) => panic!("wait failed: {}", e),
    }
}

fn accel() -> SourceRef {
    SourceRef::new("imu", "accel")
}

#[test]
fn test_entry_budget_is_exact() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    let _producer = Producer::spawn(stream);

    registry
        .start(SessionSpec::new("budget", accel(), StopCondition::MaxEntries(10)))
        .unwrap();
    settle(&registry, "budget");

    let status = registry.status("budget").unwrap();
    assert_eq!(status.state, SessionState::Finished);
    assert_eq!(status.ended_by, Some(EndReason::EntryBudget));
    assert_eq!(status.entries_read, 10);

    let entries = playback::read(registry.store(), "budget", 0, None, false).unwrap();
    assert_eq!(entries.len(), 10);
    assert!(registry.active().is_empty());
}

#[test]
fn test_name_in_use_until_stopped() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    let _producer = Producer::spawn(stream);

    let long = StopCondition::MaxDuration(Duration::from_secs(30));
    registry.start(SessionSpec::new("dup", accel(), long)).unwrap();

    let err = registry.start(SessionSpec::new("dup", accel(), long)).unwrap_err();
    assert!(matches!(err, SpoolError::NameInUse(ref n) if n == "dup"));
    assert_eq!(registry.active(), vec!["dup".to_string()]);

    let snapshot = registry.stop("dup").unwrap();
    assert_eq!(snapshot.ended_by, Some(EndReason::Stopped));
    assert!(!snapshot.state.is_active());
    assert!(registry.active().is_empty());

    // the name is free again and the old file is replaced
    registry
        .start(SessionSpec::new("dup", accel(), StopCondition::MaxEntries(2)))
        .unwrap();
    settle(&registry, "dup");
    let entries = playback::read(registry.store(), "dup", 0, None, false).unwrap();
    assert_eq!(entries.len(), 2);
}

#[test]
fn test_stop_releases_waiter() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    let _producer = Producer::spawn(stream);

    registry
        .start(SessionSpec::new(
            "x",
            accel(),
            StopCondition::MaxDuration(Duration::from_secs(30)),
        ))
        .unwrap();

    let waiter = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.wait("x"))
    };
    thread::sleep(Duration::from_millis(50));

    let stopper = {
        let registry = Arc::clone(&registry);
        thread::spawn(move || registry.stop("x"))
    };

    let snapshot = stopper.join().unwrap().unwrap();
    let waited = waiter.join().unwrap().unwrap();

    assert!(waited < Duration::from_secs(10), "waiter held for {:?}", waited);
    assert_eq!(snapshot.ended_by, Some(EndReason::Stopped));
    assert_eq!(registry.status("x").unwrap().ended_by, Some(EndReason::Stopped));
}

#[test]
fn test_stop_after_completion_is_not_active() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    for i in 0..3u8 {
        stream.add("imu", "accel", [("seq", vec![i])]);
    }

    let spec = SessionSpec::new("done", accel(), StopCondition::MaxEntries(3)).from_cursor("0-0");
    registry.start(spec).unwrap();
    settle(&registry, "done");

    let err = registry.stop("done").unwrap_err();
    assert!(matches!(err, SpoolError::NotActive(_)));
    assert_eq!(err.code(), "not_active");

    // still reported after it ended
    let status = registry.status("done").unwrap();
    assert_eq!(status.entries_read, 3);
}

#[test]
fn test_duration_bound() {
    let dir = TempDir::new().unwrap();
    let (registry, _stream) = setup(&dir);

    let started = Instant::now();
    registry
        .start(SessionSpec::new(
            "quiet",
            accel(),
            StopCondition::MaxDuration(Duration::from_millis(200)),
        ))
        .unwrap();
    settle(&registry, "quiet");
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(150), "ended early: {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "ran long: {:?}", elapsed);

    let status = registry.status("quiet").unwrap();
    assert_eq!(status.ended_by, Some(EndReason::Deadline));
    assert_eq!(status.entries_read, 0);

    // an empty recording still exists on disk
    let entries = playback::read(registry.store(), "quiet", 0, None, false).unwrap();
    assert!(entries.is_empty());
}

#[test]
fn test_read_during_capture_is_prefix() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    let _producer = Producer::spawn(stream);

    registry
        .start(SessionSpec::new(
            "live",
            accel(),
            StopCondition::MaxDuration(Duration::from_secs(30)),
        ))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while registry.status("live").unwrap().entries_read < 5 {
        assert!(Instant::now() < deadline, "capture made no progress");
        thread::sleep(Duration::from_millis(5));
    }

    let early = playback::read(registry.store(), "live", 0, None, false).unwrap();
    assert!(!early.is_empty());

    registry.stop("live").unwrap();
    let full = playback::read(registry.store(), "live", 0, None, false).unwrap();

    assert!(full.len() >= early.len());
    for (a, b) in early.iter().zip(&full) {
        assert_eq!(a.index, b.index);
        assert_eq!(a.id, b.id);
    }
}

#[test]
fn test_permanent_recording_lands_under_mount() {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("perm")).unwrap();
    let (registry, stream) = setup(&dir);
    for i in 0..2u8 {
        stream.add("imu", "accel", [("seq", vec![i])]);
    }

    let spec = SessionSpec::new("keep", accel(), StopCondition::MaxEntries(2))
        .permanent()
        .from_cursor("0-0");
    registry.start(spec).unwrap();
    settle(&registry, "keep");

    let files = registry.list().unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "keep");
    assert_eq!(files[0].location, Location::Permanent);
    assert!(files[0].path.starts_with(dir.path().join("perm")));
}

#[test]
fn test_shutdown_stops_everything() {
    let dir = TempDir::new().unwrap();
    let (registry, stream) = setup(&dir);
    let _producer = Producer::spawn(stream);

    let long = StopCondition::MaxDuration(Duration::from_secs(30));
    registry.start(SessionSpec::new("a", accel(), long)).unwrap();
    registry.start(SessionSpec::new("b", accel(), long)).unwrap();
    assert_eq!(registry.active().len(), 2);

    registry.shutdown();
    assert!(registry.active().is_empty());
    for name in ["a", "b"] {
        assert_eq!(registry.status(name).unwrap().ended_by, Some(EndReason::Stopped));
    }
}
