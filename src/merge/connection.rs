use chrono::{DateTime, FixedOffset};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionType {
    Connection,
    CanceledConnection,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::Connection => "Connection",
            ConnectionType::CanceledConnection => "CanceledConnection",
        }
    }
}

/// Boarding or alighting availability at a stop, from GTFS `pickup_type` and
/// `drop_off_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PickupType {
    Regular,
    NotAvailable,
}

impl PickupType {
    /// `0` is regular and `1` not available; other codes (phone or driver
    /// arrangement) and unset values have no counterpart.
    pub fn from_gtfs(code: Option<u8>) -> Option<Self> {
        match code {
            Some(0) => Some(PickupType::Regular),
            Some(1) => Some(PickupType::NotAvailable),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PickupType::Regular => "Regular",
            PickupType::NotAvailable => "NotAvailable",
        }
    }
}

/// One hop between two consecutive stops of a trip, with observed delays.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub kind: ConnectionType,
    pub departure_stop: String,
    pub arrival_stop: String,
    pub departure_time: DateTime<FixedOffset>,
    pub arrival_time: DateTime<FixedOffset>,
    /// Seconds.
    pub departure_delay: i64,
    /// Seconds.
    pub arrival_delay: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    #[serde(rename = "gtfs:trip")]
    pub trip: String,
    #[serde(rename = "gtfs:route")]
    pub route: String,
    #[serde(rename = "gtfs:pickupType", skip_serializing_if = "Option::is_none")]
    pub pickup_type: Option<PickupType>,
    #[serde(rename = "gtfs:dropOffType", skip_serializing_if = "Option::is_none")]
    pub drop_off_type: Option<PickupType>,
}
