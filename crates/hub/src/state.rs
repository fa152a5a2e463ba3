use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::payload::TelemetryFields;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

time::serde::format_description!(
    local_timestamp,
    PrimitiveDateTime,
    "[year]-[month]-[day]T[hour]:[minute]:[second]"
);

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<HubState>;

// ---------------------------------------------------------------------------
// Telemetry record
// ---------------------------------------------------------------------------

/// Canonical telemetry field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Field {
    Temperature,
    Humidity,
    Light,
    Rain,
}

/// One complete reading from the rack's sensor node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryRecord {
    /// °C
    pub temperature: f64,
    /// %RH
    pub humidity: f64,
    /// Raw LDR intensity, nominally 0..=4095 (higher is darker).
    pub light: i64,
    pub rain: bool,
    #[serde(rename = "last_update", with = "local_timestamp")]
    pub timestamp: PrimitiveDateTime,
    pub hour: u8,
    /// `timestamp` came from the hub clock, not the device.
    pub clock_fallback: bool,
    /// Fields absent from the payload; their values above are zero/false.
    pub missing: Vec<Field>,
}

impl TelemetryRecord {
    pub fn new(fields: &TelemetryFields, timestamp: PrimitiveDateTime, clock_fallback: bool) -> Self {
        Self {
            temperature: fields.temperature.unwrap_or(0.0),
            humidity: fields.humidity.unwrap_or(0.0),
            light: fields.light.unwrap_or(0),
            rain: fields.rain.unwrap_or(false),
            timestamp,
            hour: timestamp.hour(),
            clock_fallback,
            missing: fields.missing(),
        }
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Telemetry,
    Control,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// Hub state
// ---------------------------------------------------------------------------

/// State shared between the link's dispatch task and outside callers.
///
/// The telemetry cell is replaced wholesale under its lock and the lock is
/// never held across I/O, so readers always see one complete record.
pub struct HubState {
    pub started_at: Instant,
    telemetry: Mutex<Option<Arc<TelemetryRecord>>>,
    events: Mutex<VecDeque<SystemEvent>>,
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            telemetry: Mutex::new(None),
            events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    /// Most recent successfully parsed record, if any.
    pub fn latest_telemetry(&self) -> Option<Arc<TelemetryRecord>> {
        lock(&self.telemetry).clone()
    }

    /// Replace the current record. Last write wins.
    pub fn replace_telemetry(&self, record: TelemetryRecord) {
        let detail = format!(
            "temp={} hum={} light={} rain={} at {}",
            record.temperature, record.humidity, record.light, record.rain, record.timestamp
        );
        *lock(&self.telemetry) = Some(Arc::new(record));
        self.push_event(EventKind::Telemetry, detail);
    }

    /// Record a control command event.
    pub fn record_control(&self, detail: String) {
        self.push_event(EventKind::Control, detail);
    }

    /// Record an error event.
    pub fn record_error(&self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Newest first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        lock(&self.events).iter().rev().cloned().collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    fn push_event(&self, kind: EventKind, detail: String) {
        let mut events = lock(&self.events);
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

/// A poisoned lock still holds a whole value: cells are only ever replaced.
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use time::macros::datetime;

    fn record(temperature: f64, humidity: f64) -> TelemetryRecord {
        let fields = TelemetryFields {
            temperature: Some(temperature),
            humidity: Some(humidity),
            light: Some(1000),
            rain: Some(false),
        };
        TelemetryRecord::new(&fields, datetime!(2025-06-24 13:00:00), false)
    }

    #[test]
    fn starts_empty() {
        let st = HubState::new();
        assert!(st.latest_telemetry().is_none());
        assert!(st.recent_events().is_empty());
    }

    #[test]
    fn replace_is_last_write_wins() {
        let st = HubState::new();
        st.replace_telemetry(record(20.0, 50.0));
        st.replace_telemetry(record(30.0, 40.0));
        let latest = st.latest_telemetry().unwrap();
        assert_eq!(latest.temperature, 30.0);
        assert_eq!(latest.humidity, 40.0);
    }

    #[test]
    fn record_derives_hour_and_defaults() {
        let fields = TelemetryFields {
            temperature: Some(21.0),
            ..Default::default()
        };
        let r = TelemetryRecord::new(&fields, datetime!(2025-06-24 05:59:59), true);
        assert_eq!(r.hour, 5);
        assert_eq!(r.light, 0);
        assert!(!r.rain);
        assert!(!r.missing.contains(&Field::Temperature));
        assert!(r.missing.contains(&Field::Light));
        assert_eq!(r.missing, vec![Field::Humidity, Field::Light, Field::Rain]);
    }

    #[test]
    fn concurrent_readers_never_see_mixed_records() {
        // Writer alternates between two records whose fields move together.
        let st = Arc::new(HubState::new());
        st.replace_telemetry(record(10.0, 10.0));

        let writer = {
            let st = Arc::clone(&st);
            thread::spawn(move || {
                for i in 0..2000 {
                    let v = if i % 2 == 0 { 20.0 } else { 10.0 };
                    st.replace_telemetry(record(v, v));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let st = Arc::clone(&st);
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let r = st.latest_telemetry().unwrap();
                        assert_eq!(r.temperature, r.humidity);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn events_ring_buffer_is_bounded_and_newest_first() {
        let st = HubState::new();
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("event {i}"));
        }
        let events = st.recent_events();
        assert_eq!(events.len(), MAX_EVENTS);
        assert_eq!(events[0].detail, format!("event {}", MAX_EVENTS + 9));
    }

    #[test]
    fn replace_records_telemetry_event() {
        let st = HubState::new();
        st.replace_telemetry(record(25.0, 60.0));
        let events = st.recent_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Telemetry);
    }

    #[test]
    fn record_serializes_local_timestamp() {
        let json = serde_json::to_value(record(25.0, 60.0)).unwrap();
        assert_eq!(json["last_update"], "2025-06-24T13:00:00");
        assert_eq!(json["hour"], 13);
        assert_eq!(json["missing"].as_array().unwrap().len(), 0);
    }
}
