//! Alarm records and the sink they are published to.
//!
//! Alarms are produced, never consumed, by the availability core. Raised
//! alarms are kept in a bounded arena keyed by (alarm id, entity) so a
//! repeated raise updates the record instead of duplicating it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::arena::{Arena, Key};
use crate::error::AvailResult;

pub const DEFAULT_ALARM_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmId {
    ServiceGroupState,
    ServiceGroupRedundancy,
    NodeFailover,
    InterfaceDown,
}

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            AlarmId::ServiceGroupState => "400.001",
            AlarmId::ServiceGroupRedundancy => "400.002",
            AlarmId::NodeFailover => "400.005",
            AlarmId::InterfaceDown => "400.004",
        };
        f.write_str(code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmEventType {
    Communication,
    ProcessingError,
    Equipment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProbableCause {
    LossOfRedundancy,
    UnderlyingResourceUnavailable,
    CommunicationSubsystemFailure,
    SoftwareError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmSeverity {
    Clear,
    Warning,
    Minor,
    Major,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlarmTrend {
    Less,
    NoChange,
    More,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: AlarmId,
    pub entity: String,
    pub event_type: AlarmEventType,
    pub probable_cause: ProbableCause,
    pub severity: AlarmSeverity,
    pub trend: AlarmTrend,
    pub text: String,
}

/// Destination for alarm records. Calls are fire-and-forget.
pub trait AlarmSink: Send + Sync {
    fn raise(&self, alarm: &Alarm);
    fn clear(&self, id: AlarmId, entity: &str);
}

/// Emits alarms as structured log records.
#[derive(Debug, Default, Clone)]
pub struct TracingAlarmSink;

impl AlarmSink for TracingAlarmSink {
    fn raise(&self, alarm: &Alarm) {
        warn!(
            alarm_id = %alarm.id,
            entity = %alarm.entity,
            event_type = ?alarm.event_type,
            probable_cause = ?alarm.probable_cause,
            severity = ?alarm.severity,
            trend = ?alarm.trend,
            "alarm raised: {}",
            alarm.text
        );
    }

    fn clear(&self, id: AlarmId, entity: &str) {
        info!(alarm_id = %id, %entity, "alarm cleared");
    }
}

pub struct AlarmManager {
    raised: Arena<Alarm>,
    index: HashMap<(AlarmId, String), Key>,
    sink: Arc<dyn AlarmSink>,
}

impl AlarmManager {
    pub fn new(sink: Arc<dyn AlarmSink>) -> Self {
        Self::with_capacity(sink, DEFAULT_ALARM_CAPACITY)
    }

    pub fn with_capacity(sink: Arc<dyn AlarmSink>, capacity: usize) -> Self {
        Self {
            raised: Arena::with_capacity("alarm", capacity),
            index: HashMap::new(),
            sink,
        }
    }

    /// Raise (or re-raise with new severity/text) an alarm.
    ///
    /// Re-raising an identical alarm is a no-op toward the sink.
    pub fn raise(&mut self, alarm: Alarm) -> AvailResult<()> {
        let index_key = (alarm.id, alarm.entity.clone());
        if let Some(key) = self.index.get(&index_key).copied() {
            if let Some(existing) = self.raised.get_mut(key) {
                if *existing == alarm {
                    return Ok(());
                }
                *existing = alarm.clone();
                self.sink.raise(&alarm);
                return Ok(());
            }
        }
        let key = self.raised.insert(alarm.clone())?;
        self.index.insert(index_key, key);
        self.sink.raise(&alarm);
        Ok(())
    }

    pub fn clear(&mut self, id: AlarmId, entity: &str) {
        if let Some(key) = self.index.remove(&(id, entity.to_string())) {
            self.raised.remove(key);
            self.sink.clear(id, entity);
        }
    }

    pub fn is_raised(&self, id: AlarmId, entity: &str) -> bool {
        self.index.contains_key(&(id, entity.to_string()))
    }

    pub fn raised(&self) -> impl Iterator<Item = &Alarm> {
        self.raised.iter().map(|(_, a)| a)
    }

    pub fn len(&self) -> usize {
        self.raised.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raised.is_empty()
    }
}
