//! Delay merge engine.
//!
//! Each trip update is processed in its own task: the trip is looked up in the
//! static indexes, its service day resolved, and [`walk::DelayWalk`] turns the
//! stop-time list plus the sparse observations into one [`Connection`] per
//! hop. Connections go out through a bounded channel, so a slow consumer slows
//! the producers down instead of buffering the whole output.

pub mod connection;
pub mod template;
pub mod update;
pub mod walk;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{Instrument, debug, info, warn};

pub use connection::{Connection, ConnectionType, PickupType};
pub use template::{TemplateError, UriTemplates};
pub use update::{Observation, StopEvent, TripDelays};

use crate::schedule::calendar::parse_date;
use crate::schedule::records::required;
use crate::schedule::time::parse_seconds;
use crate::schedule::{Record, ScheduleIndexes, StopTime, parse_duration};
use template::{ConnectionValues, TemplateContext};
use walk::{DelayWalk, Hop};

/// Totals of one merge run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub trip_updates: usize,
    pub processed: usize,
    pub skipped: usize,
    pub connections: usize,
    pub failed_hops: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TripOutcome {
    Processed { connections: usize, failed_hops: usize },
    Skipped,
    /// The consumer hung up.
    Closed { connections: usize },
}

/// Template errors are configuration errors and end the run; anything else
/// only affects the trip or hop at hand.
fn is_configuration_error(e: &anyhow::Error) -> bool {
    e.downcast_ref::<TemplateError>().is_some()
}

/// Start of the service day: local midnight in the agency time zone. Where a
/// transition makes midnight ambiguous the earlier instant is used.
pub fn service_day_start(day: NaiveDate, tz: Tz) -> Result<DateTime<Tz>> {
    let midnight = day.and_hms_opt(0, 0, 0).context("invalid service day")?;
    tz.from_local_datetime(&midnight)
        .earliest()
        .with_context(|| format!("midnight of {day} does not exist in {tz}"))
}

/// `scheduled` seconds plus `delay` after `day_start`. Delays come straight
/// from the feed, so the sum may not be a representable instant.
fn shifted(day_start: DateTime<Tz>, scheduled: u32, delay: i64) -> Result<DateTime<Tz>> {
    i64::from(scheduled)
        .checked_add(delay)
        .and_then(TimeDelta::try_seconds)
        .and_then(|offset| day_start.checked_add_signed(offset))
        .with_context(|| format!("scheduled time {scheduled}s with delay {delay}s is out of range"))
}

#[derive(Clone)]
pub struct MergeEngine {
    indexes: Arc<ScheduleIndexes>,
    templates: Arc<UriTemplates>,
}

struct PreparedTrip {
    trip: Record,
    route: Record,
    stop_times: Vec<StopTime>,
    day_start: DateTime<Tz>,
    start: DateTime<Tz>,
    kind: ConnectionType,
    trip_uri: String,
    route_uri: String,
    direction: Option<String>,
}

impl MergeEngine {
    pub fn new(indexes: Arc<ScheduleIndexes>, templates: Arc<UriTemplates>) -> Self {
        Self { indexes, templates }
    }

    /// Starts merging `updates`. Connections arrive on the returned receiver;
    /// the handle resolves once every update has been attempted, or with the
    /// first configuration error.
    ///
    /// `reference` stands in for the measurement time of updates that carry
    /// none; it anchors service-day deduction.
    pub fn spawn(
        &self,
        updates: Vec<TripDelays>,
        reference: DateTime<Utc>,
        capacity: usize,
    ) -> (mpsc::Receiver<Connection>, JoinHandle<Result<MergeReport>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run(updates, reference, tx).await });
        (rx, handle)
    }

    /// Merges everything into a vector. Meant for small feeds and tests.
    pub async fn collect(
        &self,
        updates: Vec<TripDelays>,
        reference: DateTime<Utc>,
    ) -> Result<(Vec<Connection>, MergeReport)> {
        let (mut rx, handle) = self.spawn(updates, reference, 64);
        let mut connections = Vec::new();
        while let Some(connection) = rx.recv().await {
            connections.push(connection);
        }
        let report = handle.await.map_err(|e| anyhow!("merge task failed: {e}"))??;
        Ok((connections, report))
    }

    #[tracing::instrument(skip_all, fields(trip_updates = updates.len()))]
    async fn run(
        self,
        updates: Vec<TripDelays>,
        reference: DateTime<Utc>,
        tx: mpsc::Sender<Connection>,
    ) -> Result<MergeReport> {
        let mut report = MergeReport {
            trip_updates: updates.len(),
            ..Default::default()
        };

        let mut tasks = JoinSet::new();
        for update in updates {
            let span = tracing::info_span!(
                "process_trip",
                entity_id = %update.entity_id,
                trip_id = update.trip_id.as_deref().unwrap_or_default(),
            );
            let engine = self.clone();
            let tx = tx.clone();
            tasks.spawn(async move { engine.process(update, reference, &tx).await }.instrument(span));
        }
        drop(tx);

        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| anyhow!("trip task failed: {e}"))
                .and_then(|r| r);
            match outcome {
                Ok(TripOutcome::Processed {
                    connections,
                    failed_hops,
                }) => {
                    report.processed += 1;
                    report.connections += connections;
                    report.failed_hops += failed_hops;
                }
                Ok(TripOutcome::Closed { connections }) => {
                    report.processed += 1;
                    report.connections += connections;
                }
                Ok(TripOutcome::Skipped) => report.skipped += 1,
                Err(e) if failure.is_none() => {
                    tasks.abort_all();
                    failure = Some(e);
                }
                Err(e) => debug!(error = %e, "Further trip failure"),
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        info!(
            processed = report.processed,
            skipped = report.skipped,
            connections = report.connections,
            failed_hops = report.failed_hops,
            "Merge finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        update: TripDelays,
        reference: DateTime<Utc>,
        tx: &mpsc::Sender<Connection>,
    ) -> Result<TripOutcome> {
        let reference = update
            .timestamp
            .and_then(|ts| DateTime::from_timestamp(ts, 0))
            .unwrap_or(reference);

        let trip = match self.prepare(&update, reference) {
            Ok(Some(trip)) => trip,
            Ok(None) => return Ok(TripOutcome::Skipped),
            Err(e) if is_configuration_error(&e) => return Err(e),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Skipping trip update");
                return Ok(TripOutcome::Skipped);
            }
        };

        let observations =
            update::resolve_observations(&trip.stop_times, &update.observations, &trip.day_start);

        let mut connections = 0;
        let mut failed_hops = 0;
        for hop in DelayWalk::new(&trip.stop_times, &observations) {
            match self.build_connection(&trip, &hop) {
                Ok(connection) => {
                    if tx.send(connection).await.is_err() {
                        debug!("Connection receiver dropped, stopping trip");
                        return Ok(TripOutcome::Closed { connections });
                    }
                    connections += 1;
                }
                Err(e) if is_configuration_error(&e) => return Err(e),
                Err(e) => {
                    failed_hops += 1;
                    warn!(
                        departure_stop = %hop.departure.stop_id,
                        arrival_stop = %hop.arrival.stop_id,
                        error = %format!("{e:#}"),
                        "Skipping connection"
                    );
                }
            }
        }

        Ok(TripOutcome::Processed {
            connections,
            failed_hops,
        })
    }

    /// Resolves everything shared by the hops of a trip. `Ok(None)` means the
    /// update has no static counterpart.
    fn prepare(&self, update: &TripDelays, reference: DateTime<Utc>) -> Result<Option<PreparedTrip>> {
        let indexes = &self.indexes;

        let trip_id = match &update.trip_id {
            Some(id) => id.clone(),
            None => match self.find_trip_by_route(update)? {
                Some(id) => id,
                None => {
                    warn!(route_id = update.route_id.as_deref(), "Trip update names no resolvable trip");
                    return Ok(None);
                }
            },
        };
        let Some(trip) = indexes.trips.get(&trip_id)? else {
            warn!(%trip_id, "Trip not found in static schedule");
            return Ok(None);
        };
        let stop_times = match indexes.stop_times.get(&trip_id)? {
            Some(list) if !list.is_empty() => list,
            _ => {
                warn!(%trip_id, "Trip has no stop times");
                return Ok(None);
            }
        };

        let tz = indexes.timezone;
        let day = match update.start_date.as_deref() {
            Some(date) => parse_date(date)?,
            None => match self.deduce_service_day(&trip, &stop_times, reference)? {
                Some(day) => day,
                None => reference.with_timezone(&tz).date_naive(),
            },
        };
        let day_start = service_day_start(day, tz)?;
        let offset = match update.start_time.as_deref() {
            Some(time) => parse_duration(time)?,
            None => TimeDelta::seconds(i64::from(
                stop_times[0].departure_or_arrival().unwrap_or(0),
            )),
        };
        let start = day_start
            .checked_add_signed(offset)
            .with_context(|| format!("start time of trip '{trip_id}' is out of range"))?;

        let kind = if update.canceled {
            ConnectionType::CanceledConnection
        } else {
            ConnectionType::Connection
        };

        let route_id = required(&trip, "route_id")?;
        let route = indexes
            .routes
            .get(route_id)?
            .with_context(|| format!("route '{route_id}' not found in static schedule"))?;

        let trip_uri = self.templates.trip.expand(&TemplateContext {
            trip: Some(&trip),
            route: Some(&route),
            trip_start: Some(&start),
            ..Default::default()
        })?;
        let route_uri = self.templates.route.expand(&TemplateContext {
            route: Some(&route),
            ..Default::default()
        })?;
        let direction = trip
            .get("trip_headsign")
            .filter(|h| !h.is_empty())
            .cloned();

        debug!(%trip_id, service_day = %day, start = %start, ?kind, "Trip resolved");

        Ok(Some(PreparedTrip {
            trip,
            route,
            stop_times,
            day_start,
            start,
            kind,
            trip_uri,
            route_uri,
            direction,
        }))
    }

    fn build_connection(&self, trip: &PreparedTrip, hop: &Hop<'_>) -> Result<Connection> {
        let departure_secs = hop
            .departure
            .departure_or_arrival()
            .with_context(|| format!("stop '{}' has no scheduled time", hop.departure.stop_id))?;
        let arrival_secs = hop
            .arrival
            .arrival_or_departure()
            .with_context(|| format!("stop '{}' has no scheduled time", hop.arrival.stop_id))?;
        let departure_time = shifted(trip.day_start, departure_secs, hop.departure_delay)?;
        let arrival_time = shifted(trip.day_start, arrival_secs, hop.arrival_delay)?;

        let stops = &self.indexes.stops;
        let departure_stop = stops
            .get(&hop.departure.stop_id)?
            .with_context(|| format!("stop '{}' not found", hop.departure.stop_id))?;
        let arrival_stop = stops
            .get(&hop.arrival.stop_id)?
            .with_context(|| format!("stop '{}' not found", hop.arrival.stop_id))?;
        let departure_uri = self.templates.stop.expand(&TemplateContext {
            stop: Some(&departure_stop),
            ..Default::default()
        })?;
        let arrival_uri = self.templates.stop.expand(&TemplateContext {
            stop: Some(&arrival_stop),
            ..Default::default()
        })?;

        let values = ConnectionValues {
            departure_stop: &hop.departure.stop_id,
            arrival_stop: &hop.arrival.stop_id,
            departure_time,
            arrival_time,
            departure_delay: hop.departure_delay,
            arrival_delay: hop.arrival_delay,
        };
        let id = self.templates.connection.expand(&TemplateContext {
            trip: Some(&trip.trip),
            route: Some(&trip.route),
            trip_start: Some(&trip.start),
            connection: Some(&values),
            ..Default::default()
        })?;

        Ok(Connection {
            id,
            kind: trip.kind,
            departure_stop: departure_uri,
            arrival_stop: arrival_uri,
            departure_time: departure_time.fixed_offset(),
            arrival_time: arrival_time.fixed_offset(),
            departure_delay: hop.departure_delay,
            arrival_delay: hop.arrival_delay,
            direction: trip.direction.clone(),
            trip: trip.trip_uri.clone(),
            route: trip.route_uri.clone(),
            pickup_type: PickupType::from_gtfs(hop.departure.pickup_type),
            drop_off_type: PickupType::from_gtfs(hop.arrival.drop_off_type),
        })
    }

    /// Picks the service day, among the reference day and the one before,
    /// on which the trip's service runs and whose scheduled start lies
    /// closest to `reference`.
    fn deduce_service_day(
        &self,
        trip: &Record,
        stop_times: &[StopTime],
        reference: DateTime<Utc>,
    ) -> Result<Option<NaiveDate>> {
        let Some(service_id) = trip.get("service_id") else {
            return Ok(None);
        };
        let tz = self.indexes.timezone;
        let today = reference.with_timezone(&tz).date_naive();
        let first = i64::from(stop_times[0].departure_or_arrival().unwrap_or(0));

        let mut best: Option<(i64, NaiveDate)> = None;
        for day in [Some(today), today.pred_opt()].into_iter().flatten() {
            if self.indexes.service_runs_on(service_id, day)? != Some(true) {
                continue;
            }
            let Some(start) =
                service_day_start(day, tz)?.checked_add_signed(TimeDelta::seconds(first))
            else {
                continue;
            };
            let distance = (start.with_timezone(&Utc) - reference).num_seconds().abs();
            if best.is_none_or(|(d, _)| distance < d) {
                best = Some((distance, day));
            }
        }
        Ok(best.map(|(_, day)| day))
    }

    /// Finds the trip of `route_id` (and `direction_id`, when given) whose first
    /// stop time matches the update's start time and whose service runs on its
    /// start date. Needs the deduction indexes and a start time.
    fn find_trip_by_route(&self, update: &TripDelays) -> Result<Option<String>> {
        let indexes = &self.indexes;
        let (Some(by_route), Some(first_stop_times), Some(route_id), Some(start_time)) = (
            &indexes.trips_by_route,
            &indexes.first_stop_times,
            &update.route_id,
            &update.start_time,
        ) else {
            return Ok(None);
        };
        let Some(candidates) = by_route.get(route_id)? else {
            return Ok(None);
        };
        let start_secs = parse_seconds(start_time)?;
        let day = update.start_date.as_deref().map(parse_date).transpose()?;

        for trip_id in candidates {
            let Some(trip) = indexes.trips.get(&trip_id)? else {
                continue;
            };
            if let Some(direction) = update.direction_id {
                if trip.get("direction_id").map(String::as_str) != Some(direction.to_string().as_str()) {
                    continue;
                }
            }
            let first = first_stop_times.get(&trip_id)?;
            if first.and_then(|st| st.departure_or_arrival()) != Some(start_secs) {
                continue;
            }
            if let (Some(day), Some(service_id)) = (day, trip.get("service_id")) {
                if indexes.service_runs_on(service_id, day)? == Some(false) {
                    continue;
                }
            }
            debug!(%trip_id, %route_id, "Trip resolved from route and start time");
            return Ok(Some(trip_id));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Backend;
    use template::test_definitions as template_defs;
    use chrono::TimeZone;
    use std::path::Path;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn stop_time(stop_id: &str, seq: u32, secs: u32, pickup: Option<u8>, drop_off: Option<u8>) -> StopTime {
        StopTime {
            trip_id: "T1".into(),
            stop_id: stop_id.into(),
            stop_sequence: seq,
            arrival_time: Some(secs),
            departure_time: Some(secs),
            pickup_type: pickup,
            drop_off_type: drop_off,
        }
    }

    fn indexes(with_stop_c: bool) -> ScheduleIndexes {
        let dir = Path::new(".");
        let memory = Backend::Memory;
        let indexes = ScheduleIndexes {
            stops: memory.open("stops", dir).unwrap(),
            routes: memory.open("routes", dir).unwrap(),
            trips: memory.open("trips", dir).unwrap(),
            stop_times: memory.open("stop_times", dir).unwrap(),
            trips_by_route: Some(memory.open("trips_by_route", dir).unwrap()),
            first_stop_times: Some(memory.open("first_stop_times", dir).unwrap()),
            calendar: None,
            calendar_dates: None,
            timezone: Tz::UTC,
        };
        for id in ["A", "B", "C"] {
            if id != "C" || with_stop_c {
                indexes
                    .stops
                    .put(id, record(&[("stop_id", id), ("stop_name", id)]))
                    .unwrap();
            }
        }
        indexes
            .routes
            .put("R1", record(&[("route_id", "R1"), ("route_short_name", "1")]))
            .unwrap();
        indexes
            .trips
            .put(
                "T1",
                record(&[
                    ("trip_id", "T1"),
                    ("route_id", "R1"),
                    ("service_id", "WK"),
                    ("trip_headsign", "Charlie"),
                    ("direction_id", "0"),
                ]),
            )
            .unwrap();
        let list = vec![
            stop_time("A", 1, 8 * 3600, Some(0), Some(1)),
            stop_time("B", 2, 8 * 3600 + 600, Some(1), None),
            stop_time("C", 3, 8 * 3600 + 1200, None, Some(1)),
        ];
        if let Some(first) = &indexes.first_stop_times {
            first.put("T1", list[0].clone()).unwrap();
        }
        if let Some(by_route) = &indexes.trips_by_route {
            by_route.put("R1", vec!["T1".to_string()]).unwrap();
        }
        indexes.stop_times.put("T1", list).unwrap();
        indexes
    }

    fn engine_with(indexes: ScheduleIndexes, connection_template: &str) -> MergeEngine {
        let mut defs = template_defs();
        defs.connection = connection_template.to_string();
        MergeEngine::new(
            Arc::new(indexes),
            Arc::new(UriTemplates::try_from(defs).unwrap()),
        )
    }

    fn engine() -> MergeEngine {
        engine_with(indexes(true), &template_defs().connection)
    }

    fn reference() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap()
    }

    fn update_b_departure() -> TripDelays {
        TripDelays {
            entity_id: "e1".into(),
            trip_id: Some("T1".into()),
            start_date: Some("20240304".into()),
            start_time: Some("08:00:00".into()),
            observations: vec![Observation {
                stop_id: Some("B".into()),
                departure: Some(StopEvent::Delay(120)),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn at(h: u32, m: u32) -> DateTime<chrono::FixedOffset> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0)
            .unwrap()
            .fixed_offset()
    }

    #[tokio::test]
    async fn test_departure_delay_at_middle_stop() {
        let (connections, report) = engine()
            .collect(vec![update_b_departure()], reference())
            .await
            .unwrap();

        assert_eq!(connections.len(), 2);
        let (ab, bc) = (&connections[0], &connections[1]);
        assert_eq!(ab.departure_stop, "http://example.org/stops/A");
        assert_eq!(ab.arrival_stop, "http://example.org/stops/B");
        assert_eq!((ab.departure_delay, ab.arrival_delay), (0, 120));
        assert_eq!(ab.departure_time, at(8, 0));
        assert_eq!(ab.arrival_time, at(8, 12));
        assert_eq!((bc.departure_delay, bc.arrival_delay), (120, 0));
        assert_eq!(bc.departure_time, at(8, 12));
        assert_eq!(bc.arrival_time, at(8, 20));

        assert_eq!(ab.kind, ConnectionType::Connection);
        assert_eq!(ab.direction.as_deref(), Some("Charlie"));
        assert_eq!(ab.trip, "http://example.org/trips/T1/20240304");
        assert_eq!(ab.route, "http://example.org/routes/1");
        assert_eq!(
            ab.id,
            "http://example.org/connections/20240304/A/T1"
        );
        // pickup from the departure stop, drop-off from the arrival stop
        assert_eq!(ab.pickup_type, Some(PickupType::Regular));
        assert_eq!(ab.drop_off_type, None);
        assert_eq!(bc.pickup_type, Some(PickupType::NotAvailable));
        assert_eq!(bc.drop_off_type, Some(PickupType::NotAvailable));

        assert_eq!(
            report,
            MergeReport {
                trip_updates: 1,
                processed: 1,
                skipped: 0,
                connections: 2,
                failed_hops: 0,
            }
        );
    }

    #[tokio::test]
    async fn test_canceled_trip() {
        let mut update = update_b_departure();
        update.canceled = true;
        let (connections, _) = engine().collect(vec![update], reference()).await.unwrap();
        assert_eq!(connections.len(), 2);
        assert!(
            connections
                .iter()
                .all(|c| c.kind == ConnectionType::CanceledConnection)
        );
    }

    #[tokio::test]
    async fn test_unknown_trip_is_skipped() {
        let mut unknown = update_b_departure();
        unknown.trip_id = Some("T404".into());
        let (connections, report) = engine()
            .collect(vec![unknown, update_b_departure()], reference())
            .await
            .unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_broken_hop_is_skipped() {
        let engine = engine_with(indexes(false), &template_defs().connection);
        let (connections, report) = engine
            .collect(vec![update_b_departure()], reference())
            .await
            .unwrap();
        assert_eq!(connections.len(), 1);
        assert_eq!(connections[0].arrival_stop, "http://example.org/stops/B");
        assert_eq!(report.failed_hops, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_start_time_skips_only_that_trip() {
        let mut bad = update_b_departure();
        bad.entity_id = "bad".into();
        bad.start_time = Some("999999999999999:00:00".into());
        let (connections, report) = engine()
            .collect(vec![bad, update_b_departure()], reference())
            .await
            .unwrap();
        assert_eq!(connections.len(), 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 1);
    }

    fn update_b_departure_at(time: i64) -> TripDelays {
        let mut update = update_b_departure();
        update.entity_id = "bad".into();
        update.observations[0].departure = Some(StopEvent::Time(time));
        update
    }

    #[tokio::test]
    async fn test_out_of_range_delay_fails_only_its_hops() {
        // i64::MAX overflows the delay itself, a microsecond timestamp the
        // resulting instant
        for time in [i64::MAX, 1_709_536_200_000_000] {
            let (connections, report) = engine()
                .collect(vec![update_b_departure_at(time), update_b_departure()], reference())
                .await
                .unwrap();
            assert_eq!(connections.len(), 2, "time {time}");
            assert!(connections.iter().all(|c| c.departure_delay <= 120));
            assert_eq!(report.processed, 2);
            assert_eq!(report.failed_hops, 2);
        }
    }

    #[test]
    fn test_shifted_reports_overflow() {
        let start = service_day_start(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(), Tz::UTC).unwrap();
        assert_eq!(
            shifted(start, 3600, 60).unwrap(),
            Tz::UTC.with_ymd_and_hms(2024, 3, 4, 1, 1, 0).unwrap()
        );
        assert!(shifted(start, 3600, i64::MAX).is_err());
        assert!(shifted(start, 0, i64::MAX / 1000).is_err());
    }

    #[tokio::test]
    async fn test_unknown_template_column_aborts_run() {
        let engine = engine_with(indexes(true), "http://example.org/{trips.platform}");
        let err = engine
            .collect(vec![update_b_departure()], reference())
            .await
            .err()
            .unwrap();
        assert!(err.downcast_ref::<TemplateError>().is_some());
    }

    #[tokio::test]
    async fn test_connection_ids_are_deterministic() {
        let first = engine()
            .collect(vec![update_b_departure()], reference())
            .await
            .unwrap()
            .0;
        let second = engine()
            .collect(vec![update_b_departure()], reference())
            .await
            .unwrap()
            .0;
        let ids = |c: &[Connection]| c.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_trip_resolved_from_route_and_start_time() {
        let update = TripDelays {
            entity_id: "e2".into(),
            route_id: Some("R1".into()),
            direction_id: Some(0),
            start_time: Some("08:00".into()),
            ..Default::default()
        };
        let (connections, report) = engine().collect(vec![update], reference()).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(connections.len(), 2);
        // no start date and no calendar: the reference day is used
        assert_eq!(connections[0].departure_time, at(8, 0));

        let wrong_direction = TripDelays {
            entity_id: "e3".into(),
            route_id: Some("R1".into()),
            direction_id: Some(1),
            start_time: Some("08:00".into()),
            ..Default::default()
        };
        let (_, report) = engine()
            .collect(vec![wrong_direction], reference())
            .await
            .unwrap();
        assert_eq!(report.skipped, 1);
    }

    #[tokio::test]
    async fn test_service_day_deduced_from_calendar() {
        use crate::schedule::ServiceCalendar;

        let mut idx = indexes(true);
        let calendar = Backend::Memory.open("calendar", Path::new(".")).unwrap();
        // 2024-03-04 is a Monday; the service runs on Sundays only
        calendar
            .put(
                "WK",
                ServiceCalendar {
                    service_id: "WK".into(),
                    days: [false, false, false, false, false, false, true],
                    start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                    end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
                },
            )
            .unwrap();
        idx.calendar = Some(calendar);

        let mut update = update_b_departure();
        update.start_date = None;
        let engine = engine_with(idx, &template_defs().connection);
        let (connections, _) = engine.collect(vec![update], reference()).await.unwrap();
        assert_eq!(
            connections[0].departure_time,
            Utc.with_ymd_and_hms(2024, 3, 3, 8, 0, 0).unwrap().fixed_offset()
        );
    }

    #[test]
    fn test_service_day_start_on_dst_change() {
        // Clocks go forward at 02:00 on 2024-03-31 in Brussels; midnight is still CET
        let day = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let start = service_day_start(day, chrono_tz::Europe::Brussels).unwrap();
        assert_eq!(
            start.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 30, 23, 0, 0).unwrap()
        );
        // eight hours after midnight, one of them skipped by the clock change
        let departure = start.checked_add_signed(TimeDelta::hours(8)).unwrap();
        assert_eq!(
            departure.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 3, 31, 7, 0, 0).unwrap()
        );
    }
}
