//! Targeted extraction of a handful of trips.
//!
//! Instead of indexing a whole feed, each scoped trip id is searched for as
//! plain text in `trips.txt` and `stop_times.txt`; only matching lines are
//! parsed, using the file's header row as schema. Lines are matched one at a
//! time, so quoted fields spanning several lines are not supported here.

use anyhow::{Context, Result};
use csv::StringRecord;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::records::{Record, StopTime, StopTimeRow, check_sequence};
use crate::store::SharedStore;

/// A table file searched line by line for one key value.
pub struct GrepTable {
    path: PathBuf,
    headers: StringRecord,
    key_index: usize,
}

fn parse_line(line: &str) -> Result<StringRecord> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .trim(csv::Trim::All)
        .from_reader(line.as_bytes());
    let mut record = StringRecord::new();
    reader.read_record(&mut record)?;
    Ok(record)
}

impl GrepTable {
    pub fn open(path: &Path, key_column: &str) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut header = String::new();
        BufReader::new(file).read_line(&mut header)?;
        let header = header.trim_start_matches('\u{feff}').trim_end();
        let headers = parse_line(header)?;
        let key_index = headers
            .iter()
            .position(|h| h == key_column)
            .with_context(|| format!("{} has no '{key_column}' column", path.display()))?;

        Ok(Self {
            path: path.to_path_buf(),
            headers,
            key_index,
        })
    }

    pub fn headers(&self) -> &StringRecord {
        &self.headers
    }

    /// All rows whose key column equals `key`, in file order.
    pub fn rows_matching(&self, key: &str) -> Result<Vec<StringRecord>> {
        let file = File::open(&self.path)?;
        let mut rows = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate().skip(1) {
            let line = line?;
            if !line.contains(key) {
                continue;
            }
            let record = parse_line(line.trim_end_matches('\r')).with_context(|| {
                format!("malformed line {} in {}", line_no + 1, self.path.display())
            })?;
            if record.get(self.key_index) == Some(key) {
                rows.push(record);
            }
        }
        Ok(rows)
    }
}

/// Pulls one trip and its stop times into the stores. Returns the number of
/// stop times written; a trip absent from `trips.txt` writes nothing.
pub fn extract_trip(
    trip_id: &str,
    trips_table: &GrepTable,
    stop_times_table: &GrepTable,
    trips: &SharedStore<Record>,
    stop_times: &SharedStore<Vec<StopTime>>,
    first_stop_times: Option<&SharedStore<StopTime>>,
) -> Result<usize> {
    let Some(trip_row) = trips_table.rows_matching(trip_id)?.into_iter().next() else {
        tracing::debug!(trip_id, "Scoped trip not present in trips.txt");
        return Ok(0);
    };
    let trip: Record = trip_row
        .deserialize(Some(trips_table.headers()))
        .with_context(|| format!("malformed trips.txt row for trip '{trip_id}'"))?;
    trips.put(trip_id, trip)?;

    let mut list = stop_times_table
        .rows_matching(trip_id)?
        .into_iter()
        .map(|row| {
            let row: StopTimeRow = row
                .deserialize(Some(stop_times_table.headers()))
                .with_context(|| format!("malformed stop_times.txt row for trip '{trip_id}'"))?;
            StopTime::try_from(row)
        })
        .collect::<Result<Vec<_>>>()?;
    list.sort_by_key(|st| st.stop_sequence);
    check_sequence(&list)?;

    let count = list.len();
    if let (Some(first), Some(head)) = (first_stop_times, list.first()) {
        first.put(trip_id, head.clone())?;
    }
    if !list.is_empty() {
        stop_times.put(trip_id, list)?;
    }
    Ok(count)
}
