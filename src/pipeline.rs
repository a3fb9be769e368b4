//! End-to-end conversion: fetch both feeds, index the schedule, merge, serialize.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::archive::prepare_static;
use crate::fetch::fetch_source;
use crate::merge::{MergeEngine, MergeReport, TripDelays, UriTemplates};
use crate::output::{OutputFormat, connection_writer};
use crate::parser::{parse_feed, referenced_trip_ids, trip_updates};
use crate::schedule::{IndexOptions, build_indexes};
use crate::store::Backend;
use crate::workdir::WorkDir;

pub struct ConvertOptions {
    pub real_time: String,
    pub static_source: String,
    pub headers: BTreeMap<String, String>,
    pub templates: UriTemplates,
    pub format: OutputFormat,
    pub backend: Backend,
    /// Index the whole static feed instead of only the trips the updates name.
    pub full: bool,
    pub deduce: bool,
    pub channel_capacity: usize,
    pub sort_chunk_rows: usize,
    /// Parent of the per-run working directory; the system temp dir if `None`.
    pub work_dir: Option<PathBuf>,
}

/// Trip ids to extract, or `None` when the whole feed has to be indexed.
///
/// Updates that identify their trip only by route can match any trip of that
/// route, so with deduction enabled they force a full build.
fn extraction_scope(
    updates: &[TripDelays],
    full: bool,
    deduce: bool,
) -> Option<std::collections::BTreeSet<String>> {
    if full {
        return None;
    }
    if deduce && updates.iter().any(|u| u.trip_id.is_none()) {
        info!("Updates without trip id present, indexing the full schedule");
        return None;
    }
    Some(referenced_trip_ids(updates))
}

fn reference_time(header_timestamp: Option<u64>) -> DateTime<Utc> {
    header_timestamp
        .and_then(|ts| i64::try_from(ts).ok())
        .and_then(|ts| DateTime::from_timestamp(ts, 0))
        .unwrap_or_else(Utc::now)
}

/// Runs one conversion and writes the connections to `out`.
#[tracing::instrument(
    skip_all,
    fields(real_time = %options.real_time, static_source = %options.static_source, format = ?options.format)
)]
pub async fn convert<W>(options: ConvertOptions, out: W) -> Result<MergeReport>
where
    W: Write + Send + 'static,
{
    let work = WorkDir::create(options.work_dir.as_deref())?;

    // Both sides run to completion, so no extraction is still writing into
    // the work dir when an error drops it.
    let (rt_bytes, static_dir) = tokio::join!(
        fetch_source(&options.real_time, &options.headers),
        prepare_static(&options.static_source, &options.headers, work.path()),
    );
    let (rt_bytes, static_dir) = (rt_bytes?, static_dir?);

    let feed = parse_feed(&rt_bytes)?;
    let reference = reference_time(feed.header.timestamp);
    let updates = trip_updates(&feed);
    info!(
        entities = feed.entity.len(),
        trip_updates = updates.len(),
        reference = %reference,
        "Real-time feed decoded"
    );

    let index_options = IndexOptions {
        backend: options.backend,
        scope: extraction_scope(&updates, options.full, options.deduce),
        deduce: options.deduce,
        sort_chunk_rows: options.sort_chunk_rows,
    };
    let indexes = build_indexes(&static_dir, work.path(), &index_options).await?;

    let engine = MergeEngine::new(Arc::new(indexes), Arc::new(options.templates));
    let (mut rx, handle) = engine.spawn(updates, reference, options.channel_capacity);

    let mut writer = connection_writer(options.format, out);
    while let Some(connection) = rx.recv().await {
        if let Err(e) = writer.write(&connection) {
            handle.abort();
            return Err(e.context("failed to write connection"));
        }
    }
    let report = handle
        .await
        .map_err(|e| anyhow!("merge task failed: {e}"))??;
    writer.finish()?;

    if report.failed_hops > 0 {
        warn!(failed_hops = report.failed_hops, "Some hops could not be converted");
    }
    info!(
        trip_updates = report.trip_updates,
        processed = report.processed,
        skipped = report.skipped,
        connections = report.connections,
        failed_hops = report.failed_hops,
        "Conversion finished"
    );

    // Close the on-disk stores before their directory goes away.
    drop(engine);
    work.close();
    Ok(report)
}
