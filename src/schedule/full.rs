//! Whole-feed index builds: every row of every table.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use tracing::{debug, warn};

use super::calendar::{CalendarDateRow, CalendarRow, ServiceCalendar, ServiceExceptions};
use super::records::{Record, StopTime, check_sequence, required};
use super::sort::sort_stop_times;
use crate::store::SharedStore;

const BATCH_SIZE: usize = 10_000;

pub fn open_csv(path: &Path) -> Result<csv::Reader<File>> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("failed to open {}", path.display()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// Indexes every row of a table by `key_column`.
pub fn index_table(path: &Path, key_column: &str, store: &SharedStore<Record>) -> Result<usize> {
    index_table_with(path, key_column, store, |_, _| {})
}

/// Indexes `trips.txt`, optionally grouping trip ids by route on the way.
pub fn index_trips(
    path: &Path,
    trips: &SharedStore<Record>,
    trips_by_route: Option<&SharedStore<Vec<String>>>,
) -> Result<usize> {
    let mut by_route: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let count = index_table_with(path, "trip_id", trips, |trip_id, row| {
        if trips_by_route.is_some() {
            if let Some(route_id) = row.get("route_id") {
                by_route
                    .entry(route_id.clone())
                    .or_default()
                    .push(trip_id.to_string());
            }
        }
    })?;

    if let Some(store) = trips_by_route {
        store.put_batch(by_route.into_iter().collect())?;
    }
    Ok(count)
}

fn index_table_with(
    path: &Path,
    key_column: &str,
    store: &SharedStore<Record>,
    mut visit: impl FnMut(&str, &Record),
) -> Result<usize> {
    let name = file_name(path);
    let mut reader = open_csv(path)?;
    let mut batch = Vec::with_capacity(BATCH_SIZE);
    let mut count = 0;

    for (line, row) in reader.deserialize::<Record>().enumerate() {
        let row = row.with_context(|| format!("malformed {name} row {}", line + 2))?;
        let key = required(&row, key_column)
            .with_context(|| format!("{name} row {}", line + 2))?
            .to_string();
        visit(&key, &row);
        batch.push((key, row));

        if batch.len() >= BATCH_SIZE {
            count += batch.len();
            store.put_batch(std::mem::take(&mut batch))?;
        }
    }
    count += batch.len();
    store.put_batch(batch)?;

    debug!(file = %name, rows = count, "Table indexed");
    Ok(count)
}

/// Sorts `stop_times.txt` externally, then stores each trip's rows as one
/// ordered list. Returns the number of trips written.
pub fn index_stop_times(
    path: &Path,
    scratch_dir: &Path,
    chunk_rows: usize,
    stop_times: &SharedStore<Vec<StopTime>>,
    first_stop_times: Option<&SharedStore<StopTime>>,
) -> Result<usize> {
    let mut reader = open_csv(path)?;
    let sorted = sort_stop_times(&mut reader, scratch_dir, chunk_rows)?;

    let mut trips = 0;
    let mut flush = |group: Vec<StopTime>| -> Result<()> {
        check_sequence(&group)?;
        let trip_id = group[0].trip_id.clone();
        if let Some(first) = first_stop_times {
            first.put(&trip_id, group[0].clone())?;
        }
        stop_times.put(&trip_id, group)?;
        trips += 1;
        Ok(())
    };

    let mut current: Vec<StopTime> = Vec::new();
    for stop_time in sorted {
        let stop_time = stop_time?;
        if current
            .last()
            .is_some_and(|last| last.trip_id != stop_time.trip_id)
        {
            flush(std::mem::take(&mut current))?;
        }
        current.push(stop_time);
    }
    if !current.is_empty() {
        flush(current)?;
    }

    Ok(trips)
}

pub fn index_calendar(path: &Path, store: &SharedStore<ServiceCalendar>) -> Result<usize> {
    let mut reader = open_csv(path)?;
    let mut batch = Vec::new();
    for (line, row) in reader.deserialize::<CalendarRow>().enumerate() {
        let row = row.with_context(|| format!("malformed calendar.txt row {}", line + 2))?;
        let calendar = ServiceCalendar::try_from(row)?;
        batch.push((calendar.service_id.clone(), calendar));
    }
    let count = batch.len();
    store.put_batch(batch)?;
    Ok(count)
}

pub fn index_calendar_dates(path: &Path, store: &SharedStore<ServiceExceptions>) -> Result<usize> {
    let mut reader = open_csv(path)?;
    let mut by_service: BTreeMap<String, ServiceExceptions> = BTreeMap::new();
    for (line, row) in reader.deserialize::<CalendarDateRow>().enumerate() {
        let row = row.with_context(|| format!("malformed calendar_dates.txt row {}", line + 2))?;
        let (date, kind) = row.parse()?;
        by_service.entry(row.service_id).or_default().insert(date, kind);
    }
    let count = by_service.len();
    store.put_batch(by_service.into_iter().collect())?;
    Ok(count)
}

/// Time zone of the first agency, UTC when `agency.txt` is absent or the zone
/// is not recognised.
pub fn read_agency_timezone(path: &Path) -> Result<Tz> {
    if !path.is_file() {
        return Ok(Tz::UTC);
    }
    let mut reader = open_csv(path)?;
    let Some(row) = reader.deserialize::<Record>().next() else {
        return Ok(Tz::UTC);
    };
    let row = row.context("malformed agency.txt row 2")?;

    match row.get("agency_timezone").map(|tz| tz.parse::<Tz>()) {
        Some(Ok(tz)) => Ok(tz),
        Some(Err(e)) => {
            warn!(error = %e, "Unknown agency_timezone, falling back to UTC");
            Ok(Tz::UTC)
        }
        None => Ok(Tz::UTC),
    }
}
