//! Row types read from the static GTFS tables.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::time::parse_seconds;

/// A generic table row keyed by column name.
///
/// Stops, routes and trips are kept in this shape so URI templates can refer
/// to any column the feed carries.
pub type Record = BTreeMap<String, String>;

/// Returns the value of `column`, failing when the row has no such column or
/// leaves it empty.
pub fn required<'a>(record: &'a Record, column: &str) -> Result<&'a str> {
    match record.get(column).map(|s| s.trim()) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => bail!("row is missing required column '{column}'"),
    }
}

/// A `stop_times.txt` row as it appears in the file.
#[derive(Debug, Deserialize)]
pub struct StopTimeRow {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
}

/// One scheduled call of a trip at a stop. Times are seconds past the start of
/// the service day and are absent for untimed stops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: Option<u32>,
    pub departure_time: Option<u32>,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
}

impl TryFrom<StopTimeRow> for StopTime {
    type Error = anyhow::Error;

    fn try_from(row: StopTimeRow) -> Result<Self> {
        let time = |value: Option<String>, column: &str| -> Result<Option<u32>> {
            match value.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(v) => parse_seconds(v).map(Some).with_context(|| {
                    format!(
                        "bad {column} for trip '{}' sequence {}",
                        row.trip_id, row.stop_sequence
                    )
                }),
            }
        };
        let arrival_time = time(row.arrival_time.clone(), "arrival_time")?;
        let departure_time = time(row.departure_time.clone(), "departure_time")?;

        Ok(StopTime {
            trip_id: row.trip_id,
            stop_id: row.stop_id,
            stop_sequence: row.stop_sequence,
            arrival_time,
            departure_time,
            pickup_type: row.pickup_type,
            drop_off_type: row.drop_off_type,
        })
    }
}

impl StopTime {
    /// Departure when given, otherwise arrival.
    pub fn departure_or_arrival(&self) -> Option<u32> {
        self.departure_time.or(self.arrival_time)
    }

    /// Arrival when given, otherwise departure.
    pub fn arrival_or_departure(&self) -> Option<u32> {
        self.arrival_time.or(self.departure_time)
    }
}

/// Checks that a trip's stop times are sorted by strictly increasing sequence.
pub fn check_sequence(stop_times: &[StopTime]) -> Result<()> {
    for pair in stop_times.windows(2) {
        if pair[1].stop_sequence <= pair[0].stop_sequence {
            bail!(
                "trip '{}' has non-increasing stop_sequence {} after {}",
                pair[1].trip_id,
                pair[1].stop_sequence,
                pair[0].stop_sequence
            );
        }
    }
    Ok(())
}
