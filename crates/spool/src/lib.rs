//! spool: record live event streams into append-only files and read them back.
//!
//! The pieces, leaves first:
//!
//! - [`codec`]: length-prefixed MessagePack record frames.
//! - [`store`]: recording files under a temporary and a permanent root.
//! - [`source`]: the [`StreamSource`] seam and the in-process [`MemoryStream`].
//! - [`registry`] and its capture threads: one writer per recording name.
//! - [`playback`], [`transform`], [`export`]: range reads, CSV and plot data.
//! - [`dispatch`]: verb requests in, [`Payload`]s out.

mod capture;
pub mod codec;
pub mod dispatch;
pub mod error;
pub mod export;
pub mod playback;
pub mod registry;
pub mod session;
pub mod source;
pub mod store;
pub mod telemetry;
pub mod transform;

pub use codec::{FieldData, Record};
pub use dispatch::{Dispatcher, Payload};
pub use error::{Result, SpoolError};
pub use export::{CsvExport, ExportOptions, PlotSeries, PlotSpec};
pub use playback::{Entry, FieldValue};
pub use registry::Registry;
pub use session::{
    EndReason, Location, SessionSnapshot, SessionSpec, SessionState, SourceRef, StopCondition,
};
pub use source::{MemoryStream, StreamEntry, StreamPosition, StreamSource};
pub use store::{RecordingInfo, RecordingStore};
pub use transform::{Transform, XSelector};

use spoolconf::SpoolConfig;
use std::sync::Arc;

/// Build a registry from loaded configuration.
pub fn registry_from_config(config: &SpoolConfig, source: Arc<dyn StreamSource>) -> Arc<Registry> {
    let store = RecordingStore::from_config(&config.infra.paths);
    Arc::new(Registry::new(store, source, config.capture.clone()))
}
