//! Real-time input of the merge engine, independent of the wire format.

use chrono::{DateTime, TimeDelta};
use chrono_tz::Tz;
use tracing::debug;

use super::walk::StopDelay;
use crate::schedule::StopTime;

/// The real-time state of one trip.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TripDelays {
    pub entity_id: String,
    pub trip_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<u32>,
    /// `YYYYMMDD`.
    pub start_date: Option<String>,
    /// `HH:MM[:SS]`, may exceed 24h.
    pub start_time: Option<String>,
    pub canceled: bool,
    /// POSIX seconds at which the update was measured.
    pub timestamp: Option<i64>,
    /// Ordered by position along the trip, possibly sparse.
    pub observations: Vec<Observation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Observation {
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival: Option<StopEvent>,
    pub departure: Option<StopEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Seconds relative to the schedule.
    Delay(i64),
    /// Absolute POSIX time.
    Time(i64),
}

impl StopEvent {
    fn delay(self, scheduled: Option<u32>, midnight: &DateTime<Tz>) -> Option<i64> {
        match self {
            StopEvent::Delay(delay) => Some(delay),
            StopEvent::Time(time) => {
                let scheduled = midnight
                    .checked_add_signed(TimeDelta::seconds(i64::from(scheduled?)))?
                    .timestamp();
                time.checked_sub(scheduled)
            }
        }
    }
}

/// Ties each observation to a stop of the trip and turns absolute times into
/// delays. Observations are matched by `stop_sequence` when present and by
/// stop id when the sequence is absent or unknown, searching forward from the
/// previous match; those that match no remaining stop are dropped.
pub fn resolve_observations(
    stop_times: &[StopTime],
    observations: &[Observation],
    midnight: &DateTime<Tz>,
) -> Vec<StopDelay> {
    let mut from = 0;
    let mut resolved = Vec::with_capacity(observations.len());

    for observation in observations {
        let remaining = &stop_times[from..];
        let by_stop_id = |stop_id: &str| remaining.iter().position(|st| st.stop_id == stop_id);
        let found = match (observation.stop_sequence, observation.stop_id.as_deref()) {
            (Some(seq), stop_id) => remaining
                .iter()
                .position(|st| st.stop_sequence == seq)
                .or_else(|| stop_id.and_then(by_stop_id)),
            (None, Some(stop_id)) => by_stop_id(stop_id),
            (None, None) => None,
        };
        let Some(offset) = found else {
            debug!(
                stop_id = observation.stop_id.as_deref(),
                stop_sequence = observation.stop_sequence,
                "Observation matches no remaining stop of the trip"
            );
            continue;
        };

        let stop_time = &stop_times[from + offset];
        from += offset + 1;
        resolved.push(StopDelay {
            stop_id: stop_time.stop_id.clone(),
            departure_delay: observation
                .departure
                .and_then(|e| e.delay(stop_time.departure_or_arrival(), midnight)),
            arrival_delay: observation
                .arrival
                .and_then(|e| e.delay(stop_time.arrival_or_departure(), midnight)),
        });
    }

    resolved
}
