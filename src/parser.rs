//! Protobuf parser for GTFS Realtime feeds.

use anyhow::Result;
use prost::Message;
use std::collections::BTreeSet;

use crate::gtfs_rt::trip_update::{StopTimeEvent, StopTimeUpdate, stop_time_update};
use crate::gtfs_rt::{FeedMessage, trip_descriptor};
use crate::merge::{Observation, StopEvent, TripDelays};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage> {
    Ok(FeedMessage::decode(bytes)?)
}

fn stop_event(event: &StopTimeEvent) -> Option<StopEvent> {
    match (event.delay, event.time) {
        (Some(delay), _) => Some(StopEvent::Delay(i64::from(delay))),
        (None, Some(time)) => Some(StopEvent::Time(time)),
        (None, None) => None,
    }
}

fn observation(update: &StopTimeUpdate) -> Option<Observation> {
    if update.schedule_relationship() == stop_time_update::ScheduleRelationship::NoData {
        return None;
    }
    Some(Observation {
        stop_id: update.stop_id.clone(),
        stop_sequence: update.stop_sequence,
        arrival: update.arrival.as_ref().and_then(stop_event),
        departure: update.departure.as_ref().and_then(stop_event),
    })
}

/// Extracts the trip updates of a feed. Entities of any other kind are ignored.
pub fn trip_updates(feed: &FeedMessage) -> Vec<TripDelays> {
    feed.entity
        .iter()
        .filter_map(|entity| {
            let update = entity.trip_update.as_ref()?;
            let trip = &update.trip;
            let canceled = entity.is_deleted()
                || matches!(
                    trip.schedule_relationship(),
                    trip_descriptor::ScheduleRelationship::Canceled
                        | trip_descriptor::ScheduleRelationship::Deleted
                );

            Some(TripDelays {
                entity_id: entity.id.clone(),
                trip_id: trip.trip_id.clone().filter(|id| !id.is_empty()),
                route_id: trip.route_id.clone(),
                direction_id: trip.direction_id,
                start_date: trip.start_date.clone().filter(|d| !d.is_empty()),
                start_time: trip.start_time.clone().filter(|t| !t.is_empty()),
                canceled,
                timestamp: update
                    .timestamp
                    .or(feed.header.timestamp)
                    .and_then(|ts| i64::try_from(ts).ok()),
                observations: update.stop_time_update.iter().filter_map(observation).collect(),
            })
        })
        .collect()
}

/// Trip ids named by the updates, used to scope static index extraction.
pub fn referenced_trip_ids(updates: &[TripDelays]) -> BTreeSet<String> {
    updates
        .iter()
        .filter_map(|u| u.trip_id.clone())
        .collect()
}
