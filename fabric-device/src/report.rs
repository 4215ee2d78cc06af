//! Report payloads delivered to delegates.

use serde::{Deserialize, Serialize};

use fabric_data::{AttributePath, DataValue, EventPath, Status};

/// One attribute entry of a reporting batch, as handed to the delegate.
///
/// Exactly one of `value` and `error` is set. `previous` carries the value
/// that was cached before this report, when one existed; for synthetic
/// expected-value reports it carries the value the client last observed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeReport {
    pub path: AttributePath,
    pub value: Option<DataValue>,
    pub previous: Option<DataValue>,
    pub error: Option<Status>,
}

impl AttributeReport {
    pub fn value(path: AttributePath, value: DataValue, previous: Option<DataValue>) -> Self {
        Self {
            path,
            value: Some(value),
            previous,
            error: None,
        }
    }

    pub fn error(path: AttributePath, status: Status, previous: Option<DataValue>) -> Self {
        Self {
            path,
            value: None,
            previous,
            error: Some(status),
        }
    }

    /// A correction emitted when an expected value lapses: the report
    /// carries whatever the cache holds (possibly nothing).
    pub fn correction(path: AttributePath, cached: Option<DataValue>, expected: DataValue) -> Self {
        Self {
            path,
            value: cached,
            previous: Some(expected),
            error: None,
        }
    }
}

/// Importance assigned by the node to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventPriority {
    Debug,
    Info,
    Critical,
}

/// Which clock the event timestamp was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventTimeType {
    /// Microseconds since the node booted.
    SystemUptime,
    /// Microseconds since the UTC epoch.
    Utc,
}

/// One event entry of a reporting batch, as handed to the delegate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventReport {
    pub path: EventPath,
    pub event_number: u64,
    pub priority: EventPriority,
    pub timestamp_us: u64,
    pub time_type: EventTimeType,
    pub payload: DataValue,
    /// True when the event arrived inside a priming report, i.e. it may
    /// predate the current session rather than describe a live change.
    pub is_historical: bool,
}
