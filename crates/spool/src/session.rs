//! Recording session types shared by the registry, capture loop and dispatcher.

use crate::error::{Result, SpoolError};
use crate::source::StreamPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Cursor value meaning "only entries newer than the first read".
pub const LATEST: &str = "$";

/// Which storage root a recording lives under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Temporary,
    Permanent,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Temporary => write!(f, "temporary"),
            Location::Permanent => write!(f, "permanent"),
        }
    }
}

/// The (element, stream) pair a session reads from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub element: String,
    pub stream: String,
}

impl SourceRef {
    pub fn new(element: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            element: element.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.element, self.stream)
    }
}

/// When a session ends on its own.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCondition {
    MaxEntries(u64),
    MaxDuration(Duration),
}

impl StopCondition {
    /// Resolve the request's count and duration. A count wins when both are
    /// given; `default` applies when neither is.
    pub fn resolve(entries: Option<u64>, seconds: Option<f64>, default: Duration) -> Result<Self> {
        if let Some(n) = entries {
            if n == 0 {
                return Err(SpoolError::Validation("entry count must be positive".to_string()));
            }
            return Ok(StopCondition::MaxEntries(n));
        }

        match seconds {
            Some(t) if !t.is_finite() || t <= 0.0 => Err(SpoolError::Validation(format!(
                "duration must be a positive number of seconds, got {}",
                t
            ))),
            Some(t) => Duration::try_from_secs_f64(t)
                .map(StopCondition::MaxDuration)
                .map_err(|_| {
                    SpoolError::Validation(format!("duration of {} seconds is out of range", t))
                }),
            None => Ok(StopCondition::MaxDuration(default)),
        }
    }
}

impl fmt::Display for StopCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopCondition::MaxEntries(n) => write!(f, "{} entries", n),
            StopCondition::MaxDuration(d) => write!(f, "{:.3}s", d.as_secs_f64()),
        }
    }
}

/// Everything needed to start a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSpec {
    pub name: String,
    pub source: SourceRef,
    pub stop: StopCondition,
    pub location: Location,
    /// Initial cursor; [`LATEST`] when unset.
    pub from: Option<String>,
}

impl SessionSpec {
    pub fn new(name: impl Into<String>, source: SourceRef, stop: StopCondition) -> Self {
        Self {
            name: name.into(),
            source,
            stop,
            location: Location::Temporary,
            from: None,
        }
    }

    pub fn permanent(mut self) -> Self {
        self.location = Location::Permanent;
        self
    }

    pub fn from_cursor(mut self, cursor: impl Into<String>) -> Self {
        self.from = Some(cursor.into());
        self
    }

    pub fn initial_cursor(&self) -> String {
        self.from.clone().unwrap_or_else(|| LATEST.to_string())
    }

    /// Reject a start cursor that is neither [`LATEST`] nor a stream position.
    pub fn validate_cursor(&self) -> Result<()> {
        match self.from.as_deref() {
            None | Some(LATEST) => Ok(()),
            Some(cursor) => cursor.parse::<StreamPosition>().map(|_| ()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Running,
    Stopping,
    Finished,
    /// The file could not be opened; the session never ran.
    Failed,
}

impl SessionState {
    pub fn is_active(self) -> bool {
        matches!(self, SessionState::Running | SessionState::Stopping)
    }
}

/// Why a capture loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The entry budget was used up.
    EntryBudget,
    /// The duration budget elapsed.
    Deadline,
    /// A read returned nothing and the empty-batch policy is `stop`.
    EndOfStream,
    /// Removed from the registry by a stop request.
    Stopped,
    /// Append, flush or source failure; see `last_error`.
    Error,
}

/// Point-in-time view of a session, live or retained after it ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub name: String,
    pub source: SourceRef,
    pub stop: StopCondition,
    pub location: Location,
    pub path: PathBuf,
    pub state: SessionState,
    pub cursor: String,
    pub entries_read: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub ended_by: Option<EndReason>,
    pub last_error: Option<String>,
}

/// Names must be usable as a single file-name component.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SpoolError::Validation("recording name must not be empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(SpoolError::Validation(format!("invalid recording name: {}", name)));
    }
    if name.contains(['/', '\\', '\0']) {
        return Err(SpoolError::Validation(format!(
            "recording name must not contain path separators: {:?}",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_takes_precedence() {
        let stop = StopCondition::resolve(Some(5), Some(2.0), Duration::from_secs(10)).unwrap();
        assert_eq!(stop, StopCondition::MaxEntries(5));
    }

    #[test]
    fn test_default_duration_applies() {
        let stop = StopCondition::resolve(None, None, Duration::from_secs(10)).unwrap();
        assert_eq!(stop, StopCondition::MaxDuration(Duration::from_secs(10)));
    }

    #[test]
    fn test_rejects_nonpositive_budgets() {
        let default = Duration::from_secs(1);
        assert!(StopCondition::resolve(Some(0), None, default).is_err());
        assert!(StopCondition::resolve(None, Some(0.0), default).is_err());
        assert!(StopCondition::resolve(None, Some(f64::NAN), default).is_err());
        assert!(StopCondition::resolve(None, Some(-1.0), default).is_err());
    }

    #[test]
    fn test_huge_duration_is_validation_error() {
        let err = StopCondition::resolve(None, Some(1e300), Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("imu_run_3").is_ok());
        assert!(validate_name("with space.v2").is_ok());
        for bad in ["", ".", "..", "a/b", "a\\b", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{:?} should be rejected", bad);
        }
    }

    #[test]
    fn test_spec_defaults_to_latest() {
        let spec = SessionSpec::new("r", SourceRef::new("imu", "accel"), StopCondition::MaxEntries(1));
        assert_eq!(spec.initial_cursor(), LATEST);
        assert_eq!(spec.from_cursor("0-0").initial_cursor(), "0-0");
    }

    #[test]
    fn test_validate_cursor() {
        let spec = SessionSpec::new("r", SourceRef::new("imu", "accel"), StopCondition::MaxEntries(1));
        assert!(spec.validate_cursor().is_ok());
        assert!(spec.clone().from_cursor(LATEST).validate_cursor().is_ok());
        assert!(spec.clone().from_cursor("1700000000000-3").validate_cursor().is_ok());
        let err = spec.from_cursor("garbage").validate_cursor().unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }
}
