//! Dispatch command requests to registry and playback operations.
//!
//! Requests arrive already deserialized as JSON objects; each verb pulls the
//! keys it needs (`name`, `e`, `s`, `n`, `t`, `perm`, ...) and answers with a
//! [`Payload`]. Anything that blocks runs on tokio's blocking pool.

use crate::error::{Result, SpoolError};
use crate::export::{self, ExportOptions, PlotSpec};
use crate::playback;
use crate::registry::Registry;
use crate::session::{SessionSpec, SourceRef, StopCondition};
use crate::transform::{Transform, XSelector};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Success {
        result: Value,
    },
    Error {
        code: String,
        message: String,
        details: Option<Value>,
    },
}

impl Payload {
    pub fn is_success(&self) -> bool {
        matches!(self, Payload::Success { .. })
    }
}

impl From<SpoolError> for Payload {
    fn from(err: SpoolError) -> Self {
        let details = match &err {
            SpoolError::Corrupt { offset, .. } => Some(json!({ "offset": offset })),
            SpoolError::FileOpen { path, .. } | SpoolError::MissingMount(path) => {
                Some(json!({ "path": path }))
            }
            _ => None,
        };
        Payload::Error {
            code: err.code().to_string(),
            message: err.to_string(),
            details,
        }
    }
}

fn respond<T: Serialize>(result: Result<T>) -> Payload {
    match result.and_then(|v| {
        serde_json::to_value(v)
            .map_err(|e| SpoolError::Validation(format!("response not serializable: {}", e)))
    }) {
        Ok(result) => Payload::Success { result },
        Err(e) => e.into(),
    }
}

fn parse<T: DeserializeOwned>(verb: &str, request: Value) -> Result<T> {
    serde_json::from_value(request)
        .map_err(|e| SpoolError::Validation(format!("bad {} request: {}", verb, e)))
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    name: String,
    e: String,
    s: String,
    n: Option<u64>,
    t: Option<f64>,
    #[serde(default)]
    perm: bool,
    from: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NameRequest {
    name: String,
}

#[derive(Debug, Deserialize)]
struct GetRequest {
    name: String,
    #[serde(default)]
    start: u64,
    stop: Option<u64>,
    #[serde(default)]
    msgpack: bool,
}

fn decode_by_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct CsvRequest {
    name: String,
    #[serde(default)]
    start: u64,
    stop: Option<u64>,
    #[serde(default = "decode_by_default")]
    msgpack: bool,
    #[serde(default)]
    x: Value,
    #[serde(default)]
    transforms: HashMap<String, Value>,
    out_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PlotRequest {
    name: String,
    #[serde(default)]
    start: u64,
    stop: Option<u64>,
    #[serde(default = "decode_by_default")]
    msgpack: bool,
    #[serde(default)]
    x: Value,
    plots: Vec<Value>,
}

/// Dispatcher handles verb requests against one registry.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Route a verb to its handler.
    pub async fn handle(&self, verb: &str, request: Value) -> Payload {
        debug!(verb, "dispatching");
        match verb {
            "start" => self.start(request).await,
            "stop" => self.stop(request).await,
            "wait" => self.wait(request).await,
            "status" => self.status(request).await,
            "list" => self.list().await,
            "get" => self.get(request).await,
            "csv" => self.csv(request).await,
            "plot" => self.plot(request).await,
            other => SpoolError::Validation(format!("unknown verb: {}", other)).into(),
        }
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Registry>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let registry = Arc::clone(&self.registry);
        tokio::task::spawn_blocking(move || f(registry))
            .await
            .map_err(|e| SpoolError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?
    }

    /// Begin a capture.
    #[instrument(skip(self, request))]
    pub async fn start(&self, request: Value) -> Payload {
        let result: Result<Value> = async {
            let req: StartRequest = parse("start", request)?;
            let default = Duration::from_secs(self.registry.capture_config().default_duration_secs);
            let stop = StopCondition::resolve(req.n, req.t, default)?;

            let mut spec = SessionSpec::new(req.name.clone(), SourceRef::new(req.e, req.s), stop);
            if req.perm {
                spec = spec.permanent();
            }
            if let Some(from) = req.from {
                spec = spec.from_cursor(from);
            }

            let message = self.blocking(move |registry| registry.start(spec)).await?;
            Ok(json!({ "name": req.name, "message": message }))
        }
        .await;
        respond(result)
    }

    /// Cancel a capture and wait for its file to close.
    #[instrument(skip(self, request))]
    pub async fn stop(&self, request: Value) -> Payload {
        let result: Result<_> = async {
            let req: NameRequest = parse("stop", request)?;
            self.blocking(move |registry| registry.stop(&req.name)).await
        }
        .await;
        respond(result)
    }

    /// Block until a capture ends, without cancelling it.
    #[instrument(skip(self, request))]
    pub async fn wait(&self, request: Value) -> Payload {
        let result: Result<Value> = async {
            let req: NameRequest = parse("wait", request)?;
            let name = req.name.clone();
            let waited = self.blocking(move |registry| registry.wait(&req.name)).await?;
            Ok(json!({ "name": name, "waited_ms": waited.as_millis() as u64 }))
        }
        .await;
        respond(result)
    }

    /// Snapshot of an active or recently finished session.
    #[instrument(skip(self, request))]
    pub async fn status(&self, request: Value) -> Payload {
        let result = parse::<NameRequest>("status", request).and_then(|req| {
            self.registry
                .status(&req.name)
                .ok_or(SpoolError::NotFound(req.name))
        });
        respond(result)
    }

    /// Recording files under both roots, plus active session names.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Payload {
        let result: Result<Value> = self
            .blocking(|registry| {
                let files = registry.list()?;
                let names: BTreeSet<_> = files.iter().map(|f| f.name.clone()).collect();
                Ok(json!({
                    "recordings": names,
                    "files": files,
                    "active": registry.active(),
                }))
            })
            .await;
        respond(result)
    }

    /// Entries `start..=stop` of a recording.
    #[instrument(skip(self, request))]
    pub async fn get(&self, request: Value) -> Payload {
        let result: Result<Value> = async {
            let req: GetRequest = parse("get", request)?;
            self.blocking(move |registry| {
                let entries =
                    playback::read(registry.store(), &req.name, req.start, req.stop, req.msgpack)?;
                Ok(json!({ "name": req.name, "entries": entries }))
            })
            .await
        }
        .await;
        respond(result)
    }

    /// Export a recording to per-key CSV files.
    #[instrument(skip(self, request))]
    pub async fn csv(&self, request: Value) -> Payload {
        let result: Result<_> = async {
            let req: CsvRequest = parse("csv", request)?;
            let x = XSelector::from_value(&req.x)?;
            let transforms = req
                .transforms
                .iter()
                .map(|(key, spec)| -> Result<(String, Transform)> {
                    Ok((key.clone(), Transform::from_value(spec)?))
                })
                .collect::<Result<HashMap<_, _>>>()?;
            let options = ExportOptions {
                start: req.start,
                stop: req.stop,
                decode: req.msgpack,
            };

            self.blocking(move |registry| {
                export::export_csv(
                    registry.store(),
                    &req.name,
                    &transforms,
                    &x,
                    &options,
                    req.out_dir.as_deref(),
                )
            })
            .await
        }
        .await;
        respond(result)
    }

    /// Extract numeric plot series.
    #[instrument(skip(self, request))]
    pub async fn plot(&self, request: Value) -> Payload {
        let result: Result<Value> = async {
            let req: PlotRequest = parse("plot", request)?;
            let x = XSelector::from_value(&req.x)?;
            let plots = req
                .plots
                .iter()
                .map(PlotSpec::from_value)
                .collect::<Result<Vec<_>>>()?;
            let options = ExportOptions {
                start: req.start,
                stop: req.stop,
                decode: req.msgpack,
            };

            self.blocking(move |registry| {
                let series =
                    export::extract_plot_series(registry.store(), &req.name, &plots, &x, &options)?;
                Ok(json!({ "name": req.name, "plots": series }))
            })
            .await
        }
        .await;
        respond(result)
    }
}
