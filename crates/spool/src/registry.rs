//! Recording registry: one active capture per name.
//!
//! The registry map is the only shared mutable state. A session is "active"
//! exactly while its name maps to its handle; removing the entry is how a
//! stop request cancels the capture loop, which polls membership between
//! reads. Blocking waits happen on the per-session completion latch, never
//! while holding the registry lock.

use crate::capture;
use crate::error::{Result, SpoolError};
use crate::session::{
    validate_name, EndReason, SessionSnapshot, SessionSpec, SessionState,
};
use crate::source::StreamSource;
use crate::store::{RecordingInfo, RecordingStore};
use chrono::{DateTime, Utc};
use spoolconf::CaptureConfig;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fields the capture loop updates as it runs.
struct Progress {
    state: SessionState,
    cursor: String,
    entries_read: u64,
    finished_at: Option<DateTime<Utc>>,
    ended_by: Option<EndReason>,
    last_error: Option<String>,
}

/// Shared between the registry, the capture thread, and waiters.
pub(crate) struct SessionHandle {
    pub(crate) id: Uuid,
    pub(crate) spec: SessionSpec,
    path: PathBuf,
    started_at: DateTime<Utc>,
    progress: Mutex<Progress>,
    done: Mutex<bool>,
    done_cv: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SessionHandle {
    fn new(spec: SessionSpec, path: PathBuf) -> Self {
        let cursor = spec.initial_cursor();
        Self {
            id: Uuid::new_v4(),
            spec,
            path,
            started_at: Utc::now(),
            progress: Mutex::new(Progress {
                state: SessionState::Running,
                cursor,
                entries_read: 0,
                finished_at: None,
                ended_by: None,
                last_error: None,
            }),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let progress = lock(&self.progress);
        SessionSnapshot {
            id: self.id,
            name: self.spec.name.clone(),
            source: self.spec.source.clone(),
            stop: self.spec.stop,
            location: self.spec.location,
            path: self.path.clone(),
            state: progress.state,
            cursor: progress.cursor.clone(),
            entries_read: progress.entries_read,
            started_at: self.started_at,
            finished_at: progress.finished_at,
            ended_by: progress.ended_by,
            last_error: progress.last_error.clone(),
        }
    }

    /// Record entries that are appended and flushed.
    pub(crate) fn advance(&self, cursor: &str, appended: u64) {
        let mut progress = lock(&self.progress);
        progress.cursor = cursor.to_string();
        progress.entries_read += appended;
    }

    pub(crate) fn end(&self, reason: EndReason, error: Option<String>) {
        let mut progress = lock(&self.progress);
        progress.ended_by.get_or_insert(reason);
        if error.is_some() {
            progress.last_error = error;
        }
    }

    fn request_stop(&self) {
        let mut progress = lock(&self.progress);
        if progress.state == SessionState::Running {
            progress.state = SessionState::Stopping;
        }
    }

    fn finalize(&self) {
        let mut progress = lock(&self.progress);
        progress.state = SessionState::Finished;
        progress.finished_at = Some(Utc::now());
    }

    fn is_done(&self) -> bool {
        *lock(&self.done)
    }

    fn mark_done(&self) {
        *lock(&self.done) = true;
        self.done_cv.notify_all();
    }

    fn wait_done(&self) {
        let mut done = lock(&self.done);
        while !*done {
            done = self
                .done_cv
                .wait(done)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Registry of active recording sessions.
pub struct Registry {
    store: RecordingStore,
    source: Arc<dyn StreamSource>,
    capture: CaptureConfig,
    active: Mutex<HashMap<String, Arc<SessionHandle>>>,
    retired: Mutex<HashMap<String, SessionSnapshot>>,
}

impl Registry {
    pub fn new(store: RecordingStore, source: Arc<dyn StreamSource>, capture: CaptureConfig) -> Self {
        Self {
            store,
            source,
            capture,
            active: Mutex::new(HashMap::new()),
            retired: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &RecordingStore {
        &self.store
    }

    pub fn capture_config(&self) -> &CaptureConfig {
        &self.capture
    }

    pub(crate) fn source(&self) -> &dyn StreamSource {
        self.source.as_ref()
    }

    /// Start a capture and return a human-readable summary.
    ///
    /// The name check, the mount check and the file truncation all happen
    /// under the registry lock, so an active recording is never truncated.
    pub fn start(self: &Arc<Self>, spec: SessionSpec) -> Result<String> {
        validate_name(&spec.name)?;
        spec.validate_cursor()?;
        if spec.source.element.is_empty() || spec.source.stream.is_empty() {
            return Err(SpoolError::Validation(
                "element and stream must both be given".to_string(),
            ));
        }

        let mut active = lock(&self.active);
        if active.contains_key(&spec.name) {
            return Err(SpoolError::NameInUse(spec.name));
        }

        let writer = match self.store.open(spec.location, &spec.name) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(recording.name = %spec.name, error = %e, "recording failed to open");
                self.retire_failed(spec, &e);
                return Err(e);
            }
        };

        let handle = Arc::new(SessionHandle::new(spec, writer.path().to_path_buf()));
        let name = handle.spec.name.clone();
        active.insert(name.clone(), Arc::clone(&handle));

        let registry = Arc::clone(self);
        let worker = Arc::clone(&handle);
        let spawned = thread::Builder::new()
            .name(format!("spool-{}", name))
            .spawn(move || capture::run(registry, worker, writer));

        match spawned {
            Ok(join) => *lock(&handle.thread) = Some(join),
            Err(e) => {
                active.remove(&name);
                error!(recording.name = %name, error = %e, "failed to spawn capture thread");
                return Err(e.into());
            }
        }
        drop(active);

        let spec = &handle.spec;
        info!(
            recording.name = %name,
            session.id = %handle.id,
            source = %spec.source,
            location = %spec.location,
            stop = %spec.stop,
            "recording started"
        );

        Ok(format!(
            "Recording {} from {} into {} ({} storage, until {})",
            name,
            spec.source,
            handle.path.display(),
            spec.location,
            spec.stop
        ))
    }

    /// Cancel a capture and block until its file is closed.
    pub fn stop(&self, name: &str) -> Result<SessionSnapshot> {
        let handle = lock(&self.active)
            .remove(name)
            .ok_or_else(|| SpoolError::NotActive(name.to_string()))?;

        handle.request_stop();
        info!(recording.name = %name, session.id = %handle.id, "stop requested");

        handle.wait_done();
        let join = lock(&handle.thread).take();
        if let Some(join) = join {
            if join.join().is_err() {
                error!(recording.name = %name, "capture thread panicked");
            }
        }

        Ok(handle.snapshot())
    }

    /// Block until a capture ends on its own or is stopped by someone else.
    pub fn wait(&self, name: &str) -> Result<Duration> {
        let handle = lock(&self.active)
            .get(name)
            .cloned()
            .ok_or_else(|| SpoolError::NotActive(name.to_string()))?;

        let started = Instant::now();
        handle.wait_done();
        Ok(started.elapsed())
    }

    /// Live snapshot of an active session, or the last retained one.
    pub fn status(&self, name: &str) -> Option<SessionSnapshot> {
        if let Some(handle) = lock(&self.active).get(name) {
            return Some(handle.snapshot());
        }
        lock(&self.retired).get(name).cloned()
    }

    /// Names of currently active sessions, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.active).keys().cloned().collect();
        names.sort();
        names
    }

    /// Recording files on disk, independent of registry state.
    pub fn list(&self) -> Result<Vec<RecordingInfo>> {
        self.store.list()
    }

    /// Stop every active session.
    pub fn shutdown(&self) {
        for name in self.active() {
            match self.stop(&name) {
                Ok(snapshot) => info!(
                    recording.name = %name,
                    entries = snapshot.entries_read,
                    "recording stopped at shutdown"
                ),
                // finished on its own meanwhile
                Err(SpoolError::NotActive(_)) => {}
                Err(e) => warn!(recording.name = %name, error = %e, "stop at shutdown failed"),
            }
        }
    }

    pub(crate) fn is_current(&self, name: &str, id: Uuid) -> bool {
        lock(&self.active).get(name).is_some_and(|h| h.id == id)
    }

    /// Final bookkeeping for a capture loop. The file must already be closed.
    pub(crate) fn retire(&self, handle: &SessionHandle) {
        if handle.is_done() {
            return;
        }
        handle.finalize();
        let snapshot = handle.snapshot();

        {
            // Swap active for retired in one step so status never sees a gap.
            let mut active = lock(&self.active);
            if active.get(&snapshot.name).is_some_and(|h| h.id == handle.id) {
                active.remove(&snapshot.name);
            }
            lock(&self.retired).insert(snapshot.name.clone(), snapshot.clone());
        }

        info!(
            recording.name = %snapshot.name,
            session.id = %snapshot.id,
            entries = snapshot.entries_read,
            ended_by = ?snapshot.ended_by,
            "recording finished"
        );
        handle.mark_done();
    }

    fn retire_failed(&self, spec: SessionSpec, err: &SpoolError) {
        let path = self.store.path_for(spec.location, &spec.name);
        let handle = SessionHandle::new(spec, path);
        {
            let mut progress = lock(&handle.progress);
            progress.state = SessionState::Failed;
            progress.finished_at = Some(Utc::now());
            progress.ended_by = Some(EndReason::Error);
            progress.last_error = Some(err.to_string());
        }
        let snapshot = handle.snapshot();
        lock(&self.retired).insert(snapshot.name.clone(), snapshot);
    }
}
