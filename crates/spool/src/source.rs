//! Stream sources.
//!
//! The capture loop only needs one primitive from the outside world: "give me
//! entries after cursor X, waiting at most T for some to arrive". Anything
//! that can answer that implements [`StreamSource`]. [`MemoryStream`] is an
//! in-process broker used by the `record` command, by embedders, and by tests.

use crate::codec::Record;
use crate::error::{Result, SpoolError};
use crate::session::LATEST;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// An entry as delivered by a stream source.
pub type StreamEntry = Record;

/// Blocking cursor reads against a named stream.
pub trait StreamSource: Send + Sync {
    /// Entries strictly after `cursor`, oldest first. Returns an empty batch
    /// if nothing arrives within `block_timeout`.
    fn read_since(
        &self,
        element: &str,
        stream: &str,
        cursor: &str,
        max_count: Option<usize>,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>>;
}

/// Totally ordered stream position, rendered as `<millis>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct StreamPosition {
    pub millis: u64,
    pub seq: u64,
}

impl StreamPosition {
    pub const ZERO: StreamPosition = StreamPosition { millis: 0, seq: 0 };

    /// The next position at or after `now_millis`.
    fn successor(self, now_millis: u64) -> Self {
        if now_millis > self.millis {
            StreamPosition {
                millis: now_millis,
                seq: 0,
            }
        } else {
            StreamPosition {
                millis: self.millis,
                seq: self.seq + 1,
            }
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for StreamPosition {
    type Err = SpoolError;

    /// Accepts `<millis>-<seq>` or a bare `<millis>` (sequence 0).
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SpoolError::Validation(format!("invalid stream position: {:?}", s));
        let (millis, seq) = match s.split_once('-') {
            Some((m, q)) => (m, q),
            None => (s, "0"),
        };
        Ok(StreamPosition {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

struct StreamBuffer {
    entries: VecDeque<(StreamPosition, StreamEntry)>,
    last: StreamPosition,
}

impl StreamBuffer {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            last: StreamPosition::ZERO,
        }
    }

    fn after(&self, cursor: StreamPosition, max_count: Option<usize>) -> Vec<StreamEntry> {
        let limit = max_count.unwrap_or(usize::MAX);
        self.entries
            .iter()
            .filter(|(pos, _)| *pos > cursor)
            .take(limit)
            .map(|(_, entry)| entry.clone())
            .collect()
    }
}

/// Bounded in-memory streams keyed by (element, stream).
pub struct MemoryStream {
    capacity: usize,
    streams: Mutex<HashMap<(String, String), StreamBuffer>>,
    arrivals: Condvar,
}

impl MemoryStream {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Each stream keeps at most `capacity` entries; the oldest are dropped.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Mutex::new(HashMap::new()),
            arrivals: Condvar::new(),
        }
    }

    /// Append an entry and wake blocked readers. Returns its position.
    pub fn add<I, K, V>(&self, element: &str, stream: &str, fields: I) -> StreamPosition
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let buffer = streams
            .entry((element.to_string(), stream.to_string()))
            .or_insert_with(StreamBuffer::new);

        let pos = buffer.last.successor(unix_millis());
        buffer.last = pos;

        let mut entry = Record::new(pos.to_string());
        for (k, v) in fields {
            entry = entry.with_field(k, v);
        }
        buffer.entries.push_back((pos, entry));
        while buffer.entries.len() > self.capacity {
            buffer.entries.pop_front();
        }

        drop(streams);
        self.arrivals.notify_all();

        tracing::trace!(element, stream, position = %pos, "entry added");
        pos
    }

    /// Number of entries currently retained for a stream.
    pub fn len(&self, element: &str, stream: &str) -> usize {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        streams
            .get(&(element.to_string(), stream.to_string()))
            .map(|b| b.entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, element: &str, stream: &str) -> bool {
        self.len(element, stream) == 0
    }
}

impl Default for MemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamSource for MemoryStream {
    fn read_since(
        &self,
        element: &str,
        stream: &str,
        cursor: &str,
        max_count: Option<usize>,
        block_timeout: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let key = (element.to_string(), stream.to_string());
        let deadline = Instant::now() + block_timeout;
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);

        let after = if cursor == LATEST {
            streams
                .get(&key)
                .map(|b| b.last)
                .unwrap_or(StreamPosition::ZERO)
        } else {
            cursor.parse()?
        };

        loop {
            if let Some(buffer) = streams.get(&key) {
                let batch = buffer.after(after, max_count);
                if !batch.is_empty() {
                    return Ok(batch);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let (guard, _) = self
                .arrivals
                .wait_timeout(streams, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            streams = guard;
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn fields(n: u8) -> Vec<(&'static str, Vec<u8>)> {
        vec![("n", vec![n])]
    }

    #[test]
    fn test_position_ordering_is_numeric() {
        let a: StreamPosition = "9-5".parse().unwrap();
        let b: StreamPosition = "10-0".parse().unwrap();
        assert!(a < b);
        assert_eq!("42".parse::<StreamPosition>().unwrap(), StreamPosition { millis: 42, seq: 0 });
        assert!("x-1".parse::<StreamPosition>().is_err());
    }

    #[test]
    fn test_ids_are_strictly_increasing() {
        let stream = MemoryStream::new();
        let mut last = StreamPosition::ZERO;
        for i in 0..100 {
            let pos = stream.add("e", "s", fields(i));
            assert!(pos > last);
            last = pos;
        }
    }

    #[test]
    fn test_read_since_cursor_and_limit() {
        let stream = MemoryStream::new();
        let first = stream.add("e", "s", fields(1));
        stream.add("e", "s", fields(2));
        stream.add("e", "s", fields(3));

        let batch = stream
            .read_since("e", "s", &first.to_string(), Some(1), Duration::ZERO)
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["n"].as_slice(), &[2]);

        let all = stream.read_since("e", "s", "0-0", None, Duration::ZERO).unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_latest_skips_existing_entries() {
        let stream = MemoryStream::new();
        stream.add("e", "s", fields(1));
        let batch = stream
            .read_since("e", "s", LATEST, None, Duration::from_millis(20))
            .unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let stream = MemoryStream::with_capacity(2);
        for i in 0..5 {
            stream.add("e", "s", fields(i));
        }
        assert_eq!(stream.len("e", "s"), 2);
        let all = stream.read_since("e", "s", "0-0", None, Duration::ZERO).unwrap();
        assert_eq!(all[0].fields["n"].as_slice(), &[3]);
    }

    #[test]
    fn test_blocked_reader_wakes_on_add() {
        let stream = Arc::new(MemoryStream::new());
        let seen = stream.add("e", "s", fields(1)).to_string();
        let reader = {
            let stream = Arc::clone(&stream);
            thread::spawn(move || {
                stream.read_since("e", "s", &seen, None, Duration::from_secs(5))
            })
        };

        thread::sleep(Duration::from_millis(50));
        stream.add("e", "s", fields(7));

        let batch = reader.join().unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].fields["n"].as_slice(), &[7]);
    }

    #[test]
    fn test_unknown_stream_times_out_empty() {
        let stream = MemoryStream::new();
        let batch = stream
            .read_since("nope", "none", "0-0", None, Duration::from_millis(10))
            .unwrap();
        assert!(batch.is_empty());
    }
}
