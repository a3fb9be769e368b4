//! Delay propagation along a trip.
//!
//! [`DelayWalk`] visits the hops `(stop[j], stop[j+1])` of a trip in order and
//! keeps a cursor into the sparse list of delay observations. The running
//! departure and arrival delays change only when the cursor reaches an
//! observation; once observations run out the last values are held.

use crate::schedule::StopTime;

/// A delay observation reduced to the stop it applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopDelay {
    pub stop_id: String,
    pub departure_delay: Option<i64>,
    pub arrival_delay: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hop<'a> {
    pub departure: &'a StopTime,
    pub arrival: &'a StopTime,
    pub departure_delay: i64,
    pub arrival_delay: i64,
}

pub struct DelayWalk<'a> {
    stop_times: &'a [StopTime],
    observations: &'a [StopDelay],
    hop: usize,
    cursor: usize,
    departure_delay: i64,
    arrival_delay: i64,
}

impl<'a> DelayWalk<'a> {
    pub fn new(stop_times: &'a [StopTime], observations: &'a [StopDelay]) -> Self {
        Self {
            stop_times,
            observations,
            hop: 0,
            cursor: 0,
            departure_delay: 0,
            arrival_delay: 0,
        }
    }

    fn current(&self) -> Option<&'a StopDelay> {
        self.observations.get(self.cursor)
    }

    fn apply(&mut self, observation: &StopDelay) {
        match (observation.departure_delay, observation.arrival_delay) {
            (Some(departure), Some(arrival)) => {
                self.departure_delay = departure;
                self.arrival_delay = arrival;
            }
            (Some(departure), None) => {
                self.departure_delay = departure;
                self.arrival_delay = 0;
            }
            (None, Some(arrival)) => {
                self.departure_delay = 0;
                self.arrival_delay = arrival;
            }
            (None, None) => {}
        }
    }
}

impl<'a> Iterator for DelayWalk<'a> {
    type Item = Hop<'a>;

    fn next(&mut self) -> Option<Hop<'a>> {
        let departure = self.stop_times.get(self.hop)?;
        let arrival = self.stop_times.get(self.hop + 1)?;
        self.hop += 1;

        while let Some(observation) = self.current() {
            if observation.stop_id != departure.stop_id {
                break;
            }
            self.apply(observation);
            self.cursor += 1;
        }

        // The hop ending at the next observed stop already carries its delay.
        if let Some(next) = self.current() {
            if next.stop_id == arrival.stop_id {
                if let Some(delay) = next.arrival_delay.or(next.departure_delay) {
                    self.arrival_delay = delay;
                }
            }
        }

        Some(Hop {
            departure,
            arrival,
            departure_delay: self.departure_delay,
            arrival_delay: self.arrival_delay,
        })
    }
}
