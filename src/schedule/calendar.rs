//! Service calendars, used to work out which service day a trip runs on.

use anyhow::{Context, Result, bail};
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const GTFS_DATE_FORMAT: &str = "%Y%m%d";

/// A `calendar.txt` row: a weekly pattern valid between two dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: String,
    /// Monday first.
    pub days: [bool; 7],
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Deserialize)]
pub struct CalendarRow {
    service_id: String,
    monday: u8,
    tuesday: u8,
    wednesday: u8,
    thursday: u8,
    friday: u8,
    saturday: u8,
    sunday: u8,
    start_date: String,
    end_date: String,
}

impl TryFrom<CalendarRow> for ServiceCalendar {
    type Error = anyhow::Error;

    fn try_from(rec: CalendarRow) -> Result<Self> {
        Ok(ServiceCalendar {
            days: [
                rec.monday == 1,
                rec.tuesday == 1,
                rec.wednesday == 1,
                rec.thursday == 1,
                rec.friday == 1,
                rec.saturday == 1,
                rec.sunday == 1,
            ],
            start_date: parse_date(&rec.start_date)
                .with_context(|| format!("calendar for service '{}'", rec.service_id))?,
            end_date: parse_date(&rec.end_date)
                .with_context(|| format!("calendar for service '{}'", rec.service_id))?,
            service_id: rec.service_id,
        })
    }
}

impl ServiceCalendar {
    pub fn runs_on(&self, day: NaiveDate) -> bool {
        day >= self.start_date
            && day <= self.end_date
            && self.days[day.weekday().num_days_from_monday() as usize]
    }
}

/// `calendar_dates.txt` exception types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExceptionType {
    Added,
    Removed,
}

impl TryFrom<u8> for ExceptionType {
    type Error = anyhow::Error;

    fn try_from(code: u8) -> Result<Self> {
        match code {
            1 => Ok(ExceptionType::Added),
            2 => Ok(ExceptionType::Removed),
            other => bail!("unknown exception_type {other}"),
        }
    }
}

/// Exception dates of one service.
pub type ServiceExceptions = BTreeMap<NaiveDate, ExceptionType>;

#[derive(Debug, Deserialize)]
pub struct CalendarDateRow {
    pub service_id: String,
    pub date: String,
    pub exception_type: u8,
}

impl CalendarDateRow {
    pub fn parse(&self) -> Result<(NaiveDate, ExceptionType)> {
        let date = parse_date(&self.date)
            .with_context(|| format!("calendar_dates for service '{}'", self.service_id))?;
        let kind = ExceptionType::try_from(self.exception_type)
            .with_context(|| format!("calendar_dates for service '{}'", self.service_id))?;
        Ok((date, kind))
    }
}

pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), GTFS_DATE_FORMAT)
        .with_context(|| format!("invalid GTFS date '{value}'"))
}

/// Whether a service operates on `day`. Exceptions win over the weekly pattern.
pub fn service_active(
    calendar: Option<&ServiceCalendar>,
    exceptions: Option<&ServiceExceptions>,
    day: NaiveDate,
) -> bool {
    match exceptions.and_then(|e| e.get(&day)) {
        Some(ExceptionType::Added) => true,
        Some(ExceptionType::Removed) => false,
        None => calendar.is_some_and(|c| c.runs_on(day)),
    }
}
