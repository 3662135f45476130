//! RecordingStore: recording files across the temporary and permanent roots.
//!
//! Layout:
//! ```text
//! {temp_dir}/
//! ├── imu_run.spool        # created on demand
//! └── imu_run-csv/         # default CSV export directory
//! {perm_dir}/              # must already exist (mounted volume)
//! └── calibration.spool
//! ```
//!
//! Writers truncate on open and append frames; readers may open the same file
//! at any time and see a prefix of complete records.

use crate::codec::{self, Record, RecordReader};
use crate::error::{Result, SpoolError};
use crate::session::Location;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use spoolconf::PathsConfig;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Summary of one recording file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub name: String,
    pub location: Location,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct RecordingStore {
    temp_root: PathBuf,
    perm_root: PathBuf,
    extension: String,
}

impl RecordingStore {
    pub fn new(
        temp_root: impl Into<PathBuf>,
        perm_root: impl Into<PathBuf>,
        extension: impl Into<String>,
    ) -> Self {
        let extension = extension.into();
        let extension = if extension.starts_with('.') {
            extension
        } else {
            format!(".{}", extension)
        };
        Self {
            temp_root: temp_root.into(),
            perm_root: perm_root.into(),
            extension,
        }
    }

    pub fn from_config(paths: &PathsConfig) -> Self {
        Self::new(&paths.temp_dir, &paths.perm_dir, paths.extension.clone())
    }

    pub fn root(&self, location: Location) -> &Path {
        match location {
            Location::Temporary => &self.temp_root,
            Location::Permanent => &self.perm_root,
        }
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn path_for(&self, location: Location, name: &str) -> PathBuf {
        self.root(location).join(format!("{}{}", name, self.extension))
    }

    /// The permanent root counts as mounted only if it already exists.
    pub fn is_mounted(&self) -> bool {
        self.perm_root.is_dir()
    }

    /// Open a fresh writer, truncating any previous recording of that name.
    pub fn open(&self, location: Location, name: &str) -> Result<RecordingWriter> {
        match location {
            Location::Temporary => {
                fs::create_dir_all(&self.temp_root).map_err(|source| SpoolError::FileOpen {
                    path: self.temp_root.clone(),
                    source,
                })?;
            }
            Location::Permanent => {
                if !self.is_mounted() {
                    return Err(SpoolError::MissingMount(self.perm_root.clone()));
                }
            }
        }

        let path = self.path_for(location, name);
        let file = File::create(&path).map_err(|source| SpoolError::FileOpen {
            path: path.clone(),
            source,
        })?;

        tracing::debug!(recording.name = %name, path = %path.display(), "opened recording for write");

        Ok(RecordingWriter {
            path,
            out: BufWriter::new(file),
            records: 0,
            bytes: 0,
        })
    }

    /// Find a recording, preferring the permanent root.
    pub fn locate(&self, name: &str) -> Result<(Location, PathBuf)> {
        for location in [Location::Permanent, Location::Temporary] {
            let path = self.path_for(location, name);
            if path.is_file() {
                return Ok((location, path));
            }
        }
        Err(SpoolError::NotFound(name.to_string()))
    }

    /// Stream records from a recording, from the start of the file.
    pub fn open_reader(&self, name: &str) -> Result<RecordReader<BufReader<File>>> {
        let (_, path) = self.locate(name)?;
        let file = File::open(&path).map_err(|source| SpoolError::FileOpen { path, source })?;
        Ok(RecordReader::new(BufReader::new(file)))
    }

    /// Every recording under both roots. Missing roots contribute nothing.
    pub fn list(&self) -> Result<Vec<RecordingInfo>> {
        let mut infos = Vec::new();
        for location in [Location::Permanent, Location::Temporary] {
            let root = self.root(location);
            let entries = match fs::read_dir(root) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(name) = file_name.strip_suffix(self.extension.as_str()) else {
                    continue;
                };
                if name.is_empty() {
                    continue;
                }

                let meta = entry.metadata()?;
                if !meta.is_file() {
                    continue;
                }

                infos.push(RecordingInfo {
                    name: name.to_string(),
                    location,
                    path: path.clone(),
                    size_bytes: meta.len(),
                    modified: meta.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        // by name, permanent copy first
        let rank = |l: Location| l != Location::Permanent;
        infos.sort_by(|a, b| {
            a.name
                .cmp(&b.name)
                .then_with(|| rank(a.location).cmp(&rank(b.location)))
        });
        Ok(infos)
    }
}

/// Append-only writer owned by one capture session.
pub struct RecordingWriter {
    path: PathBuf,
    out: BufWriter<File>,
    records: u64,
    bytes: u64,
}

impl RecordingWriter {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records appended so far.
    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn append(&mut self, record: &Record) -> Result<()> {
        let frame = codec::encode(record)?;
        self.out.write_all(&frame)?;
        self.records += 1;
        self.bytes += frame.len() as u64;
        Ok(())
    }

    /// Push buffered frames to the OS so concurrent readers see them.
    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Flush, sync and release the file. Returns the record count.
    pub fn close(mut self) -> Result<u64> {
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(self.records)
    }
}
