//! Static schedule indexes.
//!
//! [`build_indexes`] reads an extracted GTFS directory into [`ScheduleIndexes`],
//! either the whole feed or only the trips named by a scoping set. Per-file and
//! per-trip builds run as blocking tasks in one [`JoinSet`]; the first failure
//! wins, and the remaining tasks are waited for before it is returned so no
//! task still touches the working directory afterwards.

pub mod calendar;
mod full;
pub mod records;
mod scoped;
mod sort;
pub mod time;

use anyhow::{Context, Result, anyhow, bail};
use chrono::NaiveDate;
use chrono_tz::Tz;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info};

pub use calendar::{ServiceCalendar, ServiceExceptions, service_active};
pub use records::{Record, StopTime};
pub use time::parse_duration;

use crate::store::{Backend, SharedStore};
use scoped::GrepTable;

pub const AGENCY: &str = "agency.txt";
pub const STOPS: &str = "stops.txt";
pub const ROUTES: &str = "routes.txt";
pub const TRIPS: &str = "trips.txt";
pub const STOP_TIMES: &str = "stop_times.txt";
pub const CALENDAR: &str = "calendar.txt";
pub const CALENDAR_DATES: &str = "calendar_dates.txt";

const MANDATORY_FILES: [&str; 4] = [STOPS, ROUTES, TRIPS, STOP_TIMES];

#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub backend: Backend,
    /// Trip ids to extract; `None` indexes the whole feed.
    pub scope: Option<BTreeSet<String>>,
    /// Also build the indexes used to deduce service days and resolve trips
    /// that real-time updates identify only by route.
    pub deduce: bool,
    /// Rows per in-memory run of the external stop-times sort.
    pub sort_chunk_rows: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            backend: Backend::Memory,
            scope: None,
            deduce: false,
            sort_chunk_rows: 500_000,
        }
    }
}

pub struct ScheduleIndexes {
    pub stops: SharedStore<Record>,
    pub routes: SharedStore<Record>,
    pub trips: SharedStore<Record>,
    pub stop_times: SharedStore<Vec<StopTime>>,
    pub trips_by_route: Option<SharedStore<Vec<String>>>,
    pub first_stop_times: Option<SharedStore<StopTime>>,
    pub calendar: Option<SharedStore<ServiceCalendar>>,
    pub calendar_dates: Option<SharedStore<ServiceExceptions>>,
    pub timezone: Tz,
}

impl ScheduleIndexes {
    /// Whether any service calendar was indexed.
    pub fn has_service_calendar(&self) -> bool {
        self.calendar.is_some() || self.calendar_dates.is_some()
    }

    /// Whether `service_id` operates on `day`; `None` without calendar indexes.
    pub fn service_runs_on(&self, service_id: &str, day: NaiveDate) -> Result<Option<bool>> {
        if !self.has_service_calendar() {
            return Ok(None);
        }
        let calendar = match &self.calendar {
            Some(store) => store.get(service_id)?,
            None => None,
        };
        let exceptions = match &self.calendar_dates {
            Some(store) => store.get(service_id)?,
            None => None,
        };
        Ok(Some(service_active(
            calendar.as_ref(),
            exceptions.as_ref(),
            day,
        )))
    }
}

type BuildTasks = JoinSet<Result<(&'static str, usize)>>;

fn spawn_index<F>(tasks: &mut BuildTasks, name: &'static str, build: F)
where
    F: FnOnce() -> Result<usize> + Send + 'static,
{
    tasks.spawn_blocking(move || {
        build()
            .map(|count| (name, count))
            .with_context(|| format!("failed to build {name} index"))
    });
}

/// Builds the indexes for the GTFS files in `source_dir`. Disk-backed stores
/// and sort scratch files are created under `work_dir`.
#[tracing::instrument(
    skip(options),
    fields(
        source = %source_dir.display(),
        backend = ?options.backend,
        scoped = options.scope.as_ref().map(|s| s.len()),
        deduce = options.deduce,
    )
)]
pub async fn build_indexes(
    source_dir: &Path,
    work_dir: &Path,
    options: &IndexOptions,
) -> Result<ScheduleIndexes> {
    for name in MANDATORY_FILES {
        if !source_dir.join(name).is_file() {
            bail!("static archive is missing mandatory file {name}");
        }
    }

    let store_dir = work_dir.join("indexes");
    std::fs::create_dir_all(&store_dir)
        .with_context(|| format!("failed to create {}", store_dir.display()))?;

    let backend = options.backend;
    let deduce = options.deduce;
    let optional = |name: &str| deduce && source_dir.join(name).is_file();

    let indexes = ScheduleIndexes {
        stops: backend.open("stops", &store_dir)?,
        routes: backend.open("routes", &store_dir)?,
        trips: backend.open("trips", &store_dir)?,
        stop_times: backend.open("stop_times", &store_dir)?,
        trips_by_route: deduce
            .then(|| backend.open("trips_by_route", &store_dir))
            .transpose()?,
        first_stop_times: deduce
            .then(|| backend.open("first_stop_times", &store_dir))
            .transpose()?,
        calendar: optional(CALENDAR)
            .then(|| backend.open("calendar", &store_dir))
            .transpose()?,
        calendar_dates: optional(CALENDAR_DATES)
            .then(|| backend.open("calendar_dates", &store_dir))
            .transpose()?,
        timezone: full::read_agency_timezone(&source_dir.join(AGENCY))?,
    };
    debug!(timezone = %indexes.timezone, "Agency time zone resolved");

    let mut tasks = BuildTasks::new();

    let (path, store) = (source_dir.join(STOPS), indexes.stops.clone());
    spawn_index(&mut tasks, "stops", move || {
        full::index_table(&path, "stop_id", &store)
    });
    let (path, store) = (source_dir.join(ROUTES), indexes.routes.clone());
    spawn_index(&mut tasks, "routes", move || {
        full::index_table(&path, "route_id", &store)
    });

    if let Some(store) = indexes.calendar.clone() {
        let path = source_dir.join(CALENDAR);
        spawn_index(&mut tasks, "calendar", move || {
            full::index_calendar(&path, &store)
        });
    }
    if let Some(store) = indexes.calendar_dates.clone() {
        let path = source_dir.join(CALENDAR_DATES);
        spawn_index(&mut tasks, "calendar_dates", move || {
            full::index_calendar_dates(&path, &store)
        });
    }

    match &options.scope {
        None => spawn_full_trips(&mut tasks, source_dir, work_dir, options, &indexes),
        Some(scope) => spawn_scoped_trips(&mut tasks, source_dir, scope, &indexes)?,
    }

    wait_all(tasks).await?;

    if let (Some(scope), Some(by_route)) = (&options.scope, &indexes.trips_by_route) {
        group_scoped_trips_by_route(scope, &indexes.trips, by_route)?;
    }

    info!(
        stops = indexes.stops.len()?,
        routes = indexes.routes.len()?,
        trips = indexes.trips.len()?,
        "Static indexes ready"
    );
    Ok(indexes)
}

fn spawn_full_trips(
    tasks: &mut BuildTasks,
    source_dir: &Path,
    work_dir: &Path,
    options: &IndexOptions,
    indexes: &ScheduleIndexes,
) {
    let path = source_dir.join(TRIPS);
    let trips = indexes.trips.clone();
    let by_route = indexes.trips_by_route.clone();
    spawn_index(tasks, "trips", move || {
        full::index_trips(&path, &trips, by_route.as_ref())
    });

    let path = source_dir.join(STOP_TIMES);
    let scratch = work_dir.to_path_buf();
    let chunk_rows = options.sort_chunk_rows;
    let stop_times = indexes.stop_times.clone();
    let first = indexes.first_stop_times.clone();
    spawn_index(tasks, "stop_times", move || {
        full::index_stop_times(&path, &scratch, chunk_rows, &stop_times, first.as_ref())
    });
}

fn spawn_scoped_trips(
    tasks: &mut BuildTasks,
    source_dir: &Path,
    scope: &BTreeSet<String>,
    indexes: &ScheduleIndexes,
) -> Result<()> {
    let trips_table = Arc::new(GrepTable::open(&source_dir.join(TRIPS), "trip_id")?);
    let stop_times_table = Arc::new(GrepTable::open(&source_dir.join(STOP_TIMES), "trip_id")?);

    for trip_id in scope {
        let trip_id = trip_id.clone();
        let trips_table = trips_table.clone();
        let stop_times_table = stop_times_table.clone();
        let trips = indexes.trips.clone();
        let stop_times = indexes.stop_times.clone();
        let first = indexes.first_stop_times.clone();
        spawn_index(tasks, "scoped_trip", move || {
            scoped::extract_trip(
                &trip_id,
                &trips_table,
                &stop_times_table,
                &trips,
                &stop_times,
                first.as_ref(),
            )
            .with_context(|| format!("trip '{trip_id}'"))
        });
    }
    Ok(())
}

fn group_scoped_trips_by_route(
    scope: &BTreeSet<String>,
    trips: &SharedStore<Record>,
    by_route: &SharedStore<Vec<String>>,
) -> Result<()> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for trip_id in scope {
        if let Some(route_id) = trips.get(trip_id)?.and_then(|t| t.get("route_id").cloned()) {
            grouped.entry(route_id).or_default().push(trip_id.clone());
        }
    }
    by_route.put_batch(grouped.into_iter().collect())
}

async fn wait_all(mut tasks: BuildTasks) -> Result<()> {
    let mut failure = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| anyhow!("index build task failed: {e}"))
            .and_then(|r| r);
        match outcome {
            Ok((name, count)) => debug!(index = name, entries = count, "Index build finished"),
            Err(e) if failure.is_none() => {
                // Blocking tasks cannot be interrupted; let them drain.
                tasks.abort_all();
                failure = Some(e);
            }
            Err(e) => debug!(error = %e, "Further index build failure"),
        }
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const STOP_TIMES_TXT: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence,pickup_type,drop_off_type
T2,09:10:00,09:10:00,B,2,,
T1,08:10:00,08:10:00,B,2,0,0
T1,08:20:00,08:20:00,C,3,1,1
T2,09:00:00,09:00:00,A,1,,
T1,08:00:00,08:00:00,A,1,0,1
";

    fn write_feed(dir: &Path) {
        fs::write(
            dir.join(AGENCY),
            "agency_id,agency_name,agency_url,agency_timezone\nA,Agency,http://a,Europe/Brussels\n",
        )
        .unwrap();
        fs::write(
            dir.join(STOPS),
            "stop_id,stop_name,stop_lat,stop_lon\nA,Alpha,50.0,4.0\nB,Bravo,50.1,4.1\nC,Charlie,50.2,4.2\n",
        )
        .unwrap();
        fs::write(
            dir.join(ROUTES),
            "route_id,route_short_name,route_long_name,route_type\nR1,1,One,3\n",
        )
        .unwrap();
        fs::write(
            dir.join(TRIPS),
            "route_id,service_id,trip_id,trip_headsign\nR1,WK,T1,Charlie\nR1,WK,T2,Bravo\n",
        )
        .unwrap();
        fs::write(dir.join(STOP_TIMES), STOP_TIMES_TXT).unwrap();
        fs::write(
            dir.join(CALENDAR),
            "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date\nWK,1,1,1,1,1,0,0,20240101,20241231\n",
        )
        .unwrap();
    }

    fn sequences(indexes: &ScheduleIndexes, trip: &str) -> Vec<u32> {
        indexes
            .stop_times
            .get(trip)
            .unwrap()
            .unwrap()
            .iter()
            .map(|st| st.stop_sequence)
            .collect()
    }

    #[tokio::test]
    async fn test_full_build_groups_and_sorts() {
        let feed = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_feed(feed.path());

        let options = IndexOptions {
            sort_chunk_rows: 2,
            ..Default::default()
        };
        let indexes = build_indexes(feed.path(), work.path(), &options)
            .await
            .unwrap();

        assert_eq!(sequences(&indexes, "T1"), vec![1, 2, 3]);
        assert_eq!(sequences(&indexes, "T2"), vec![1, 2]);
        assert_eq!(indexes.timezone, chrono_tz::Europe::Brussels);
        assert!(indexes.trips_by_route.is_none());
        assert!(indexes.calendar.is_none());

        // every trip referenced by a stop time resolves
        for trip in ["T1", "T2"] {
            assert!(indexes.trips.get(trip).unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_scoped_matches_full_build() {
        let feed = tempfile::tempdir().unwrap();
        write_feed(feed.path());

        for backend in [Backend::Memory, Backend::Disk] {
            let work_full = tempfile::tempdir().unwrap();
            let work_scoped = tempfile::tempdir().unwrap();
            let full = build_indexes(
                feed.path(),
                work_full.path(),
                &IndexOptions {
                    backend,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
            let scoped = build_indexes(
                feed.path(),
                work_scoped.path(),
                &IndexOptions {
                    backend,
                    scope: Some(BTreeSet::from(["T1".to_string(), "T9".to_string()])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

            assert_eq!(
                full.stop_times.get("T1").unwrap(),
                scoped.stop_times.get("T1").unwrap()
            );
            assert_eq!(
                full.trips.get("T1").unwrap(),
                scoped.trips.get("T1").unwrap()
            );
            assert!(scoped.stop_times.get("T2").unwrap().is_none());
            assert!(scoped.trips.get("T9").unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_deduction_indexes() {
        let feed = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_feed(feed.path());

        let options = IndexOptions {
            deduce: true,
            ..Default::default()
        };
        let indexes = build_indexes(feed.path(), work.path(), &options)
            .await
            .unwrap();

        let by_route = indexes.trips_by_route.as_ref().unwrap();
        assert_eq!(
            by_route.get("R1").unwrap(),
            Some(vec!["T1".to_string(), "T2".to_string()])
        );
        let first = indexes.first_stop_times.as_ref().unwrap();
        assert_eq!(first.get("T2").unwrap().unwrap().stop_id, "A");
        // calendar_dates.txt is absent: no index, not an error
        assert!(indexes.calendar_dates.is_none());

        let monday = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let sunday = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        assert_eq!(indexes.service_runs_on("WK", monday).unwrap(), Some(true));
        assert_eq!(indexes.service_runs_on("WK", sunday).unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_missing_mandatory_file() {
        let feed = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_feed(feed.path());
        fs::remove_file(feed.path().join(ROUTES)).unwrap();

        let err = build_indexes(feed.path(), work.path(), &IndexOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("routes.txt"));
    }

    #[tokio::test]
    async fn test_malformed_row_fails_build() {
        let feed = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_feed(feed.path());
        fs::write(
            feed.path().join(STOP_TIMES),
            format!("{STOP_TIMES_TXT}T3,bad,09:00:00,A,1,,\n"),
        )
        .unwrap();

        let result = build_indexes(feed.path(), work.path(), &IndexOptions::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_sequence_fails_build() {
        let feed = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        write_feed(feed.path());
        fs::write(
            feed.path().join(STOP_TIMES),
            format!("{STOP_TIMES_TXT}T1,08:30:00,08:30:00,D,3,,\n"),
        )
        .unwrap();

        let result = build_indexes(feed.path(), work.path(), &IndexOptions::default()).await;
        assert!(result.is_err());
    }
}
