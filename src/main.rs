//! CLI entry point for gtfsrt2lc.
//!
//! Converts a GTFS Realtime trip-updates feed, joined with its static GTFS
//! schedule, into a stream of Linked Connections written to stdout.

use anyhow::Result;
use clap::Parser;
use gtfsrt2lc::{
    config::{load_templates, parse_headers},
    output::OutputFormat,
    pipeline::{ConvertOptions, convert},
    store::Backend,
};
use std::ffi::OsStr;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfsrt2lc")]
#[command(
    about = "Converts GTFS Realtime trip updates into Linked Connections",
    long_about = None
)]
struct Cli {
    /// URL or path of the GTFS Realtime feed
    #[arg(short = 'r', long = "real-time", value_name = "FILE_OR_URL")]
    real_time: String,

    /// URL or path of the GTFS zip, or a directory holding the extracted files
    #[arg(short = 's', long = "static", value_name = "FILE_OR_URL")]
    static_source: String,

    /// Extra HTTP headers as a JSON object, e.g. '{"apikey": "..."}'
    #[arg(short = 'H', long, default_value = "{}")]
    headers: String,

    /// JSON file with the stop, route, trip and connection URI templates
    #[arg(short = 't', long = "uris-template", value_name = "FILE")]
    uris_template: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,

    /// Index store: memory or disk
    #[arg(short = 'S', long, default_value = "memory")]
    store: Backend,

    /// Index every trip of the static feed instead of only those referenced
    #[arg(long, default_value_t = false)]
    full: bool,

    /// Deduce missing start dates from the service calendar and resolve
    /// trips identified only by route
    #[arg(long, default_value_t = false)]
    deduce: bool,

    /// Connections buffered between the merge tasks and the writer
    #[arg(long, default_value_t = 1024)]
    channel_capacity: usize,

    /// Rows per in-memory run when sorting stop_times.txt
    #[arg(long, default_value_t = 500_000)]
    sort_chunk_rows: usize,

    /// Parent directory for the per-run working directory
    #[arg(long, value_name = "DIR")]
    work_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    // Logging setup: colored stderr + JSON rolling log file. Stdout carries the data.
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfsrt2lc.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfsrt2lc.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, _file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let cli = Cli::parse();

    // Configuration errors end the run before any download starts.
    let headers = parse_headers(&cli.headers)?;
    let templates = load_templates(&cli.uris_template)?;

    let options = ConvertOptions {
        real_time: cli.real_time,
        static_source: cli.static_source,
        headers,
        templates,
        format: cli.format,
        backend: cli.store,
        full: cli.full,
        deduce: cli.deduce,
        channel_capacity: cli.channel_capacity,
        sort_chunk_rows: cli.sort_chunk_rows,
        work_dir: cli.work_dir,
    };

    convert(options, BufWriter::new(std::io::stdout())).await?;
    Ok(())
}
