//! Capture loop: one thread per recording session.
//!
//! Each pass reads the next batch after the cursor, appends it, flushes, and
//! only then advances the cursor. The loop ends when a budget runs out, when
//! the source goes quiet (unless configured to keep retrying), when the
//! session is no longer registered, or on the first append or source error.

use crate::error::{Result, SpoolError};
use crate::registry::{Registry, SessionHandle};
use crate::session::{EndReason, StopCondition};
use crate::store::RecordingWriter;
use spoolconf::EmptyBatchPolicy;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info_span, warn};

/// Retires the session however the thread exits, including by panic.
struct Retire {
    registry: Arc<Registry>,
    handle: Arc<SessionHandle>,
}

impl Drop for Retire {
    fn drop(&mut self) {
        if thread::panicking() {
            self.handle
                .end(EndReason::Error, Some("capture thread panicked".to_string()));
        }
        self.registry.retire(&self.handle);
    }
}

/// Thread entry point.
pub(crate) fn run(registry: Arc<Registry>, handle: Arc<SessionHandle>, writer: RecordingWriter) {
    let _retire = Retire {
        registry: Arc::clone(&registry),
        handle: Arc::clone(&handle),
    };
    // Declared after the guard so the file is released before retirement.
    let mut writer = writer;

    let span = info_span!("capture", recording.name = %handle.spec.name, session.id = %handle.id);
    let _entered = span.enter();

    let outcome = capture(&registry, &handle, &mut writer);
    let persisted = writer.records();
    let closed = writer.close();

    match outcome {
        Ok(reason) => handle.end(reason, None),
        Err(e) => {
            error!(entries = persisted, error = %e, "capture failed");
            handle.end(EndReason::Error, Some(e.to_string()));
        }
    }
    if let Err(e) = closed {
        error!(error = %e, "failed to close recording");
        handle.end(EndReason::Error, Some(e.to_string()));
    }
}

fn capture(registry: &Registry, handle: &SessionHandle, writer: &mut RecordingWriter) -> Result<EndReason> {
    let config = registry.capture_config();
    let spec = &handle.spec;
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let block_timeout = Duration::from_millis(config.block_timeout_ms);
    let max_batch = config.max_batch.max(1);

    let mut cursor = spec.initial_cursor();
    let (mut remaining, budget) = match spec.stop {
        StopCondition::MaxEntries(n) => (Some(n), None),
        StopCondition::MaxDuration(d) => (None, Some(d)),
    };
    let started = Instant::now();
    let out_of_time = || budget.is_some_and(|d| started.elapsed() >= d);

    loop {
        if !registry.is_current(&spec.name, handle.id) {
            return Ok(EndReason::Stopped);
        }

        let max_count = remaining.map_or(max_batch, |r| r.min(max_batch as u64) as usize);
        let timeout = match budget {
            Some(d) => block_timeout.min(d.saturating_sub(started.elapsed())),
            None => block_timeout,
        };

        let mut batch = registry
            .source()
            .read_since(&spec.source.element, &spec.source.stream, &cursor, Some(max_count), timeout)
            .map_err(|e| match e {
                SpoolError::Source(_) => e,
                other => SpoolError::Source(other.to_string()),
            })?;
        batch.truncate(max_count);

        if batch.is_empty() {
            if out_of_time() {
                return Ok(EndReason::Deadline);
            }
            match config.empty_batch {
                EmptyBatchPolicy::Stop => {
                    warn!(cursor = %cursor, "stream returned no entries, ending capture");
                    return Ok(EndReason::EndOfStream);
                }
                EmptyBatchPolicy::Retry => debug!(cursor = %cursor, "empty batch, retrying"),
            }
        } else {
            let mut appended = 0usize;
            let mut failure = None;
            for entry in &batch {
                if let Err(e) = writer.append(entry) {
                    failure = Some(e);
                    break;
                }
                appended += 1;
            }
            writer.flush()?;

            if appended > 0 {
                cursor = batch[appended - 1].id.clone();
                handle.advance(&cursor, appended as u64);
                debug!(entries = appended, cursor = %cursor, "batch appended");
            }
            if let Some(e) = failure {
                return Err(e);
            }

            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(appended as u64);
                if *r == 0 {
                    return Ok(EndReason::EntryBudget);
                }
            }
        }

        if out_of_time() {
            return Ok(EndReason::Deadline);
        }
        thread::sleep(poll_interval);
    }
}
