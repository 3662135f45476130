//! CSV export and plot-series extraction.
//!
//! Both walk a range of decoded entries, pick an x coordinate per entry, and
//! turn field values into numbers through [`Transform`]s. Rendering the
//! series is left to the caller.

use crate::error::{Result, SpoolError};
use crate::playback::{self, Entry};
use crate::session::{validate_name, Location};
use crate::store::RecordingStore;
use crate::transform::{Transform, XSelector};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Range and decoding shared by CSV and plot extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub start: u64,
    pub stop: Option<u64>,
    /// Decode fields before transforming. Raw fields are treated as byte
    /// arrays.
    pub decode: bool,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            start: 0,
            stop: None,
            decode: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CsvExport {
    pub out_dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub entries: u64,
}

/// Default CSV directory for a recording.
pub fn default_csv_dir(store: &RecordingStore, name: &str) -> PathBuf {
    store.root(Location::Temporary).join(format!("{}-csv", name))
}

/// Re-scope a transform failure to the key and entry it happened on.
fn at(err: SpoolError, key: &str, index: u64) -> SpoolError {
    match err {
        SpoolError::Transform(msg) => {
            SpoolError::Transform(format!("key {:?}, entry {}: {}", key, index, msg))
        }
        other => other,
    }
}

/// Write one `<key>.csv` per field key, rows of `x,v0,v1,...`.
///
/// Keys without a transform use `values`. Files already written are left
/// in place if a later entry fails.
pub fn export_csv(
    store: &RecordingStore,
    name: &str,
    transforms: &HashMap<String, Transform>,
    x: &XSelector,
    options: &ExportOptions,
    out_dir: Option<&Path>,
) -> Result<CsvExport> {
    let entries = playback::read(store, name, options.start, options.stop, options.decode)?;
    let out_dir = out_dir
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default_csv_dir(store, name));
    fs::create_dir_all(&out_dir).map_err(|source| SpoolError::FileOpen {
        path: out_dir.clone(),
        source,
    })?;

    let fallback = Transform::default();
    let mut writers: BTreeMap<String, (PathBuf, BufWriter<File>)> = BTreeMap::new();

    for entry in &entries {
        let xv = x.x_for(entry)?;
        for (key, field) in &entry.fields {
            let transform = transforms.get(key).unwrap_or(&fallback);
            let values = transform
                .apply(&field.to_value())
                .map_err(|e| at(e, key, entry.index))?;

            if !writers.contains_key(key) {
                validate_name(key).map_err(|_| {
                    SpoolError::Transform(format!("key {:?} is not usable as a file name", key))
                })?;
                let path = out_dir.join(format!("{}.csv", key));
                let file = File::create(&path).map_err(|source| SpoolError::FileOpen {
                    path: path.clone(),
                    source,
                })?;
                writers.insert(key.clone(), (path, BufWriter::new(file)));
            }
            if let Some((_, out)) = writers.get_mut(key) {
                write_row(out, xv, &values)?;
            }
        }
    }

    let mut files = Vec::with_capacity(writers.len());
    for (_, (path, mut out)) in writers {
        out.flush()?;
        files.push(path);
    }

    info!(
        recording.name = %name,
        out_dir = %out_dir.display(),
        files = files.len(),
        entries = entries.len(),
        "csv export complete"
    );

    Ok(CsvExport {
        out_dir,
        files,
        entries: entries.len() as u64,
    })
}

fn write_row<W: Write>(out: &mut W, x: f64, values: &[f64]) -> std::io::Result<()> {
    write!(out, "{}", x)?;
    for v in values {
        write!(out, ",{}", v)?;
    }
    writeln!(out)
}

/// One plotted line: a transform applied to one or more keys.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotLine {
    pub transform: Transform,
    pub keys: Vec<String>,
    pub label: Option<String>,
}

impl PlotLine {
    /// `{ "transform": ..., "keys": [...], "label": ... }` or the positional
    /// form `[transform, keys, label?]`. `keys` may be a single string.
    pub fn from_value(spec: &Value) -> Result<Self> {
        let (transform, keys, label) = match spec {
            Value::Object(map) => (map.get("transform"), map.get("keys"), map.get("label")),
            Value::Array(items) if (2..=3).contains(&items.len()) => {
                (items.first(), items.get(1), items.get(2))
            }
            other => {
                return Err(SpoolError::Validation(format!("invalid plot line: {}", other)))
            }
        };

        let transform = match transform {
            None | Some(Value::Null) => Transform::default(),
            Some(t) => Transform::from_value(t)?,
        };

        let keys = match keys {
            Some(Value::String(k)) => vec![k.clone()],
            Some(Value::Array(ks)) => ks
                .iter()
                .map(|k| {
                    k.as_str().map(str::to_string).ok_or_else(|| {
                        SpoolError::Validation(format!("plot key must be a string: {}", k))
                    })
                })
                .collect::<Result<Vec<_>>>()?,
            _ => return Err(SpoolError::Validation("plot line needs keys".to_string())),
        };
        if keys.is_empty() {
            return Err(SpoolError::Validation("plot line needs keys".to_string()));
        }

        let label = match label {
            None | Some(Value::Null) => None,
            Some(Value::String(l)) => Some(l.clone()),
            Some(other) => {
                return Err(SpoolError::Validation(format!("plot label must be a string: {}", other)))
            }
        };

        Ok(Self {
            transform,
            keys,
            label,
        })
    }
}

/// One plot: a list of lines, optionally titled.
#[derive(Debug, Clone, PartialEq)]
pub struct PlotSpec {
    pub title: Option<String>,
    pub lines: Vec<PlotLine>,
}

impl PlotSpec {
    /// A bare list of lines, or `{ "title": ..., "lines": [...] }`.
    pub fn from_value(spec: &Value) -> Result<Self> {
        let (title, lines) = match spec {
            Value::Array(lines) => (None, lines),
            Value::Object(map) => match map.get("lines") {
                Some(Value::Array(lines)) => {
                    (map.get("title").and_then(Value::as_str).map(str::to_string), lines)
                }
                _ => return Err(SpoolError::Validation("plot needs a lines list".to_string())),
            },
            other => return Err(SpoolError::Validation(format!("invalid plot: {}", other))),
        };

        Ok(Self {
            title,
            lines: lines.iter().map(PlotLine::from_value).collect::<Result<_>>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotRow {
    pub label: String,
    pub key: String,
    pub values: Vec<f64>,
}

/// Numeric matrix for one plot: one row per (line, key), one column per entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotSeries {
    pub title: Option<String>,
    pub x: Vec<f64>,
    pub rows: Vec<PlotRow>,
}

pub fn extract_plot_series(
    store: &RecordingStore,
    name: &str,
    plots: &[PlotSpec],
    x: &XSelector,
    options: &ExportOptions,
) -> Result<Vec<PlotSeries>> {
    let entries = playback::read(store, name, options.start, options.stop, options.decode)?;
    let Some(first) = entries.first() else {
        return Err(SpoolError::Validation(format!(
            "recording {} has no entries in the requested range",
            name
        )));
    };

    for key in plots.iter().flat_map(|p| &p.lines).flat_map(|l| &l.keys) {
        if !first.fields.contains_key(key) {
            return Err(SpoolError::Transform(format!(
                "key {:?} not present in recording {}",
                key, name
            )));
        }
    }

    let xs = entries.iter().map(|e| x.x_for(e)).collect::<Result<Vec<_>>>()?;

    let mut series = Vec::with_capacity(plots.len());
    for plot in plots {
        let mut rows = Vec::new();
        for line in &plot.lines {
            for key in &line.keys {
                let values = entries
                    .iter()
                    .map(|e| scalar(&line.transform, e, key))
                    .collect::<Result<Vec<_>>>()?;
                let label = match &line.label {
                    Some(l) if line.keys.len() > 1 => format!("{} {}", l, key),
                    Some(l) => l.clone(),
                    None => key.clone(),
                };
                rows.push(PlotRow {
                    label,
                    key: key.clone(),
                    values,
                });
            }
        }
        series.push(PlotSeries {
            title: plot.title.clone(),
            x: xs.clone(),
            rows,
        });
    }

    Ok(series)
}

/// A plot row needs exactly one number per entry.
fn scalar(transform: &Transform, entry: &Entry, key: &str) -> Result<f64> {
    let field = entry.fields.get(key).ok_or_else(|| {
        SpoolError::Transform(format!("key {:?} missing from entry {}", key, entry.index))
    })?;
    let values = transform
        .apply(&field.to_value())
        .map_err(|e| at(e, key, entry.index))?;
    match values.as_slice() {
        [v] => Ok(*v),
        _ => Err(SpoolError::Transform(format!(
            "key {:?}, entry {}: transform yields {} numbers, plots need exactly one",
            key,
            entry.index,
            values.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{encode_field, Record};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> RecordingStore {
        let store = RecordingStore::new(dir.path().join("tmp"), dir.path().join("perm"), ".spool");
        let mut writer = store.open(Location::Temporary, "imu").unwrap();
        for i in 0..3u64 {
            let record = Record::new(format!("{}-0", 100 + i))
                .with_field("accel", encode_field(&json!([i, i + 1, i + 2])).unwrap())
                .with_field("temp", encode_field(&json!(20 + i)).unwrap());
            writer.append(&record).unwrap();
        }
        writer.close().unwrap();
        store
    }

    #[test]
    fn test_csv_one_file_per_key() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir);

        let mut transforms = HashMap::new();
        transforms.insert("accel".to_string(), Transform::from_value(&json!("sum")).unwrap());

        let export = export_csv(
            &store,
            "imu",
            &transforms,
            &XSelector::Id,
            &ExportOptions::default(),
            None,
        )
        .unwrap();

        assert_eq!(export.entries, 3);
        assert_eq!(export.out_dir, dir.path().join("tmp/imu-csv"));
        assert_eq!(export.files.len(), 2);

        let accel = fs::read_to_string(export.out_dir.join("accel.csv")).unwrap();
        assert_eq!(accel, "100,3\n101,6\n102,9\n");
        let temp = fs::read_to_string(export.out_dir.join("temp.csv")).unwrap();
        assert_eq!(temp, "100,20\n101,21\n102,22\n");
    }

    #[test]
    fn test_csv_without_transform_flattens() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir);
        let out = dir.path().join("out");

        let options = ExportOptions {
            start: 1,
            stop: Some(1),
            ..ExportOptions::default()
        };
        export_csv(&store, "imu", &HashMap::new(), &XSelector::Index, &options, Some(&out)).unwrap();

        let accel = fs::read_to_string(out.join("accel.csv")).unwrap();
        assert_eq!(accel, "1,1,2,3\n");
    }

    #[test]
    fn test_csv_names_failing_key() {
        let dir = TempDir::new().unwrap();
        let store = RecordingStore::new(dir.path().join("tmp"), dir.path().join("perm"), ".spool");
        let mut writer = store.open(Location::Temporary, "txt").unwrap();
        writer
            .append(&Record::new("1-0").with_field("note", encode_field(&json!("hi")).unwrap()))
            .unwrap();
        writer.close().unwrap();

        let err = export_csv(
            &store,
            "txt",
            &HashMap::new(),
            &XSelector::Id,
            &ExportOptions::default(),
            None,
        )
        .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("\"note\""), "{}", message);
        assert!(message.contains("entry 0"), "{}", message);
    }

    #[test]
    fn test_csv_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = RecordingStore::new(dir.path().join("tmp"), dir.path().join("perm"), ".spool");
        let mut writer = store.open(Location::Temporary, "sneaky").unwrap();
        writer
            .append(&Record::new("1-0").with_field("../../escaped", encode_field(&json!(1)).unwrap()))
            .unwrap();
        writer.close().unwrap();

        let out = dir.path().join("a/b/out");
        let err = export_csv(
            &store,
            "sneaky",
            &HashMap::new(),
            &XSelector::Id,
            &ExportOptions::default(),
            Some(&out),
        )
        .unwrap_err();

        assert_eq!(err.code(), "transform_error");
        assert!(!dir.path().join("a/escaped.csv").exists());
        assert!(!dir.path().join("escaped.csv").exists());
    }

    #[test]
    fn test_plot_rows_per_key() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir);

        let plot = PlotSpec::from_value(&json!({
            "title": "imu",
            "lines": [
                {"transform": "mean", "keys": ["accel"], "label": "avg"},
                ["max", "temp"]
            ]
        }))
        .unwrap();

        let series =
            extract_plot_series(&store, "imu", &[plot], &XSelector::Index, &ExportOptions::default())
                .unwrap();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].x, vec![0.0, 1.0, 2.0]);
        assert_eq!(series[0].rows[0].label, "avg");
        assert_eq!(series[0].rows[0].values, vec![1.0, 2.0, 3.0]);
        assert_eq!(series[0].rows[1].label, "temp");
        assert_eq!(series[0].rows[1].values, vec![20.0, 21.0, 22.0]);
    }

    #[test]
    fn test_plot_validates_keys_and_arity() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir);

        let missing = PlotSpec::from_value(&json!([["mean", ["gyro"]]])).unwrap();
        let err = extract_plot_series(&store, "imu", &[missing], &XSelector::Id, &ExportOptions::default())
            .unwrap_err();
        assert!(matches!(err, SpoolError::Transform(_)));
        assert!(err.to_string().contains("\"gyro\""));

        let vector = PlotSpec::from_value(&json!([["values", "accel"]])).unwrap();
        let err = extract_plot_series(&store, "imu", &[vector], &XSelector::Id, &ExportOptions::default())
            .unwrap_err();
        assert!(matches!(err, SpoolError::Transform(_)));
    }
}
