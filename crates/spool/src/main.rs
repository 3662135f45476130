use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use spool::{codec, telemetry, Dispatcher, MemoryStream, Payload};
use spoolconf::SpoolConfig;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// spool - record event streams to disk and read them back
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file used in place of ./spool.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List recordings under both roots
    List,

    /// Print entries of a recording
    Get {
        name: String,

        /// First entry index
        #[arg(long, default_value = "0")]
        start: u64,

        /// Last entry index, inclusive
        #[arg(long)]
        stop: Option<u64>,

        /// Decode MessagePack field values
        #[arg(long)]
        decode: bool,
    },

    /// Export a recording as per-key CSV files
    Csv {
        name: String,

        /// Output directory (defaults to <temp root>/<name>-csv)
        #[arg(long)]
        out_dir: Option<PathBuf>,

        /// JSON object mapping field key to transform
        #[arg(long)]
        transforms: Option<String>,

        /// X column: "id", "index" or a JSON field selector
        #[arg(long)]
        x: Option<String>,

        /// Leave field values undecoded
        #[arg(long)]
        raw: bool,
    },

    /// Extract plot series as JSON
    Plot {
        name: String,

        /// JSON array of plot definitions
        #[arg(long)]
        plots: String,

        /// X column: "id", "index" or a JSON field selector
        #[arg(long)]
        x: Option<String>,
    },

    /// Capture newline-delimited JSON events from a file
    Record {
        name: String,

        /// NDJSON file, one object of fields per line
        #[arg(short, long)]
        input: PathBuf,

        /// Source element name
        #[arg(short, long, default_value = "file")]
        element: String,

        /// Source stream name
        #[arg(short, long, default_value = "events")]
        stream: String,

        /// Stop after this many entries
        #[arg(short = 'n', long)]
        entries: Option<u64>,

        /// Stop after this many seconds
        #[arg(short = 't', long)]
        seconds: Option<f64>,

        /// Write under the permanent root
        #[arg(long)]
        perm: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = SpoolConfig::load_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    telemetry::init(&config.infra.telemetry.log_level)?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml());
            Ok(())
        }
        Commands::List => {
            let dispatcher = dispatcher(&config, Arc::new(MemoryStream::new()));
            emit(dispatcher.handle("list", json!({})).await)
        }
        Commands::Get { name, start, stop, decode } => {
            let dispatcher = dispatcher(&config, Arc::new(MemoryStream::new()));
            let request = json!({ "name": name, "start": start, "stop": stop, "msgpack": decode });
            emit(dispatcher.handle("get", request).await)
        }
        Commands::Csv { name, out_dir, transforms, x, raw } => {
            let dispatcher = dispatcher(&config, Arc::new(MemoryStream::new()));
            let transforms = match transforms {
                Some(text) => parse_json("--transforms", &text)?,
                None => json!({}),
            };
            let request = json!({
                "name": name,
                "out_dir": out_dir,
                "transforms": transforms,
                "x": x_selector(x.as_deref())?,
                "msgpack": !raw,
            });
            emit(dispatcher.handle("csv", request).await)
        }
        Commands::Plot { name, plots, x } => {
            let dispatcher = dispatcher(&config, Arc::new(MemoryStream::new()));
            let request = json!({
                "name": name,
                "plots": parse_json("--plots", &plots)?,
                "x": x_selector(x.as_deref())?,
            });
            emit(dispatcher.handle("plot", request).await)
        }
        Commands::Record { name, input, element, stream, entries, seconds, perm } => {
            let source = load_ndjson(&input, &element, &stream)?;
            let dispatcher = dispatcher(&config, source);
            record(&dispatcher, name, element, stream, entries, seconds, perm).await
        }
    }
}

fn dispatcher(config: &SpoolConfig, source: Arc<MemoryStream>) -> Dispatcher {
    Dispatcher::new(spool::registry_from_config(config, source))
}

async fn record(
    dispatcher: &Dispatcher,
    name: String,
    element: String,
    stream: String,
    entries: Option<u64>,
    seconds: Option<f64>,
    perm: bool,
) -> Result<()> {
    let request = json!({
        "name": name,
        "e": element,
        "s": stream,
        "n": entries,
        "t": seconds,
        "perm": perm,
        "from": "0-0",
    });
    check(dispatcher.handle("start", request).await)?;

    tokio::select! {
        payload = dispatcher.handle("wait", json!({ "name": name })) => {
            // not_active: the capture ended between start and wait
            if let Payload::Error { code, .. } = &payload {
                if code != "not_active" {
                    return emit(payload);
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, stopping recording...");
            let registry = Arc::clone(dispatcher.registry());
            tokio::task::spawn_blocking(move || registry.shutdown()).await?;
        }
    }

    emit(dispatcher.handle("status", json!({ "name": name })).await)
}

/// Preload an in-memory stream with one entry per non-blank line.
fn load_ndjson(path: &Path, element: &str, stream: &str) -> Result<Arc<MemoryStream>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let lines: Vec<(usize, &str)> = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .collect();

    let source = MemoryStream::with_capacity(lines.len().max(1));
    for (lineno, line) in lines {
        let value: Value = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: invalid JSON", path.display(), lineno + 1))?;
        let Value::Object(map) = value else {
            bail!("{}:{}: expected a JSON object", path.display(), lineno + 1);
        };
        let fields = map
            .iter()
            .map(|(key, value)| -> Result<(String, Vec<u8>)> {
                Ok((key.clone(), codec::encode_field(value)?))
            })
            .collect::<Result<Vec<_>>>()?;
        source.add(element, stream, fields);
    }

    tracing::info!(path = %path.display(), entries = source.len(element, stream), "input loaded");
    Ok(Arc::new(source))
}

fn parse_json(flag: &str, text: &str) -> Result<Value> {
    serde_json::from_str(text).with_context(|| format!("{} is not valid JSON", flag))
}

/// `id` and `index` pass through as strings; anything else must be JSON.
fn x_selector(x: Option<&str>) -> Result<Value> {
    match x {
        None => Ok(Value::Null),
        Some(word @ ("id" | "index")) => Ok(Value::String(word.to_string())),
        Some(text) => parse_json("--x", text),
    }
}

fn check(payload: Payload) -> Result<Value> {
    match payload {
        Payload::Success { result } => Ok(result),
        Payload::Error { code, message, .. } => bail!("{}: {}", code, message),
    }
}

fn emit(payload: Payload) -> Result<()> {
    let result = check(payload)?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
