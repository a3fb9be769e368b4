//! External merge sort of `stop_times.txt` by `(trip_id, stop_sequence)`.
//!
//! Rows are read in runs of at most `chunk_rows`, each run sorted in memory and
//! spilled to a JSON-lines file in a scratch directory. The runs are then
//! merged lazily through a min-heap so only one row per run is resident.

use anyhow::{Context, Result};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;
use tempfile::TempDir;
use tracing::debug;

use super::records::{StopTime, StopTimeRow};

fn compare(a: &StopTime, b: &StopTime) -> Ordering {
    a.trip_id
        .cmp(&b.trip_id)
        .then(a.stop_sequence.cmp(&b.stop_sequence))
}

/// Sorted stream of stop times.
pub enum SortedStopTimes {
    /// Input fit in a single run; no files were written.
    Memory(std::vec::IntoIter<StopTime>),
    Merge(RunMerger),
}

impl Iterator for SortedStopTimes {
    type Item = Result<StopTime>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            SortedStopTimes::Memory(rows) => rows.next().map(Ok),
            SortedStopTimes::Merge(merger) => merger.next(),
        }
    }
}

pub fn sort_stop_times<R: std::io::Read>(
    reader: &mut csv::Reader<R>,
    scratch_parent: &Path,
    chunk_rows: usize,
) -> Result<SortedStopTimes> {
    let chunk_rows = chunk_rows.max(1);
    let mut chunk: Vec<StopTime> = Vec::with_capacity(chunk_rows.min(1 << 16));
    let mut scratch: Option<TempDir> = None;
    let mut runs = Vec::new();

    for (line, row) in reader.deserialize::<StopTimeRow>().enumerate() {
        let row = row.with_context(|| format!("malformed stop_times.txt row {}", line + 2))?;
        chunk.push(StopTime::try_from(row)?);

        if chunk.len() >= chunk_rows {
            if scratch.is_none() {
                scratch = Some(
                    tempfile::Builder::new()
                        .prefix("stop-times-sort")
                        .tempdir_in(scratch_parent)?,
                );
            }
            if let Some(dir) = &scratch {
                runs.push(spill(&mut chunk, dir.path(), runs.len())?);
            }
        }
    }

    let Some(scratch) = scratch else {
        chunk.sort_by(compare);
        return Ok(SortedStopTimes::Memory(chunk.into_iter()));
    };
    if !chunk.is_empty() {
        runs.push(spill(&mut chunk, scratch.path(), runs.len())?);
    }

    debug!(runs = runs.len(), "Merging sorted stop_times runs");
    Ok(SortedStopTimes::Merge(RunMerger::new(runs, scratch)?))
}

fn spill(chunk: &mut Vec<StopTime>, dir: &Path, index: usize) -> Result<std::path::PathBuf> {
    chunk.sort_by(compare);
    let path = dir.join(format!("run-{index:05}.jsonl"));
    let mut out = BufWriter::new(File::create(&path)?);
    for st in chunk.drain(..) {
        serde_json::to_writer(&mut out, &st)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(path)
}

struct Head {
    stop_time: StopTime,
    run: usize,
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        compare(&self.stop_time, &other.stop_time).then(self.run.cmp(&other.run))
    }
}

pub struct RunMerger {
    runs: Vec<Lines<BufReader<File>>>,
    heap: BinaryHeap<Reverse<Head>>,
    // Keeps the run files alive until the merge is dropped.
    _scratch: TempDir,
}

impl RunMerger {
    fn new(paths: Vec<std::path::PathBuf>, scratch: TempDir) -> Result<Self> {
        let mut merger = RunMerger {
            runs: Vec::with_capacity(paths.len()),
            heap: BinaryHeap::with_capacity(paths.len()),
            _scratch: scratch,
        };
        for path in paths {
            merger.runs.push(BufReader::new(File::open(path)?).lines());
        }
        for run in 0..merger.runs.len() {
            merger.refill(run)?;
        }
        Ok(merger)
    }

    fn refill(&mut self, run: usize) -> Result<()> {
        if let Some(line) = self.runs[run].next() {
            let stop_time: StopTime = serde_json::from_str(&line?)?;
            self.heap.push(Reverse(Head { stop_time, run }));
        }
        Ok(())
    }
}

impl Iterator for RunMerger {
    type Item = Result<StopTime>;

    fn next(&mut self) -> Option<Self::Item> {
        let Reverse(head) = self.heap.pop()?;
        if let Err(e) = self.refill(head.run) {
            return Some(Err(e));
        }
        Some(Ok(head.stop_time))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP_TIMES: &str = "trip_id,arrival_time,departure_time,stop_id,stop_sequence
T2,09:10:00,09:10:00,B,2
T1,08:10:00,08:10:00,B,2
T2,09:00:00,09:00:00,A,1
T1,08:20:00,08:20:00,C,10
T1,08:00:00,08:00:00,A,1
T3,10:00:00,10:00:00,A,1
";

    fn keys(chunk_rows: usize) -> Vec<(String, u32)> {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = csv::Reader::from_reader(STOP_TIMES.as_bytes());
        sort_stop_times(&mut reader, dir.path(), chunk_rows)
            .unwrap()
            .map(|st| {
                let st = st.unwrap();
                (st.trip_id, st.stop_sequence)
            })
            .collect()
    }

    fn expected() -> Vec<(String, u32)> {
        vec![
            ("T1".into(), 1),
            ("T1".into(), 2),
            ("T1".into(), 10),
            ("T2".into(), 1),
            ("T2".into(), 2),
            ("T3".into(), 1),
        ]
    }

    #[test]
    fn test_single_run_sorts_in_memory() {
        assert_eq!(keys(1000), expected());
    }

    #[test]
    fn test_spilled_runs_merge_in_order() {
        // sequence 10 must sort numerically after 2
        assert_eq!(keys(2), expected());
        assert_eq!(keys(1), expected());
    }

    #[test]
    fn test_scratch_files_removed_after_merge() {
        let dir = tempfile::tempdir().unwrap();
        let mut reader = csv::Reader::from_reader(STOP_TIMES.as_bytes());
        let sorted = sort_stop_times(&mut reader, dir.path(), 2).unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
        drop(sorted);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_malformed_row_fails() {
        let dir = tempfile::tempdir().unwrap();
        let data = "trip_id,arrival_time,departure_time,stop_id,stop_sequence\nT1,08:00,08:00,A,first\n";
        let mut reader = csv::Reader::from_reader(data.as_bytes());
        assert!(sort_stop_times(&mut reader, dir.path(), 10).is_err());
    }
}
