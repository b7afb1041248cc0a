//! Strong type definitions for the ELIS Sync Core.
//!
//! Identifiers are newtypes to prevent mixing up event ids, sequence numbers
//! and domain ids at compile time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// Store-assigned identity of a failed event.
///
/// Assigned once on creation and never reused, even after the event is
/// deleted. Distinct from the FIFO sequence number.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

impl EventId {
    /// Create from a raw value.
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw value.
    pub const fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventId({})", self.0)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// The kind of record a sync event carries to the LIS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Patient demographics.
    Patient,
    /// A confirmed order containing lab tests.
    TestOrder,
    /// A lab-test catalog entry.
    LabTest,
}

impl EventType {
    /// All event types, in declaration order.
    pub const ALL: [EventType; 3] = [EventType::Patient, EventType::TestOrder, EventType::LabTest];

    /// Stable string form used for persistence.
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Patient => "patient",
            EventType::TestOrder => "test_order",
            EventType::LabTest => "lab_test",
        }
    }

    /// Human label used in operator listings.
    pub fn label(self) -> &'static str {
        match self {
            EventType::Patient => "Patient Sync",
            EventType::TestOrder => "Test Order",
            EventType::LabTest => "Lab Test",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "patient" => Ok(EventType::Patient),
            "test_order" => Ok(EventType::TestOrder),
            "lab_test" => Ok(EventType::LabTest),
            other => Err(CoreError::UnknownEventType(other.to_string())),
        }
    }
}

/// The identity under which at most one unresolved event may exist per
/// event type.
///
/// Keys are namespaced (`ref:`, `patient:`, `order:`, `product:`) so a patient
/// reference can never collide with a numeric id.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey(String);

impl DedupKey {
    /// Key a patient by its external reference.
    pub fn patient_ref(reference: &str) -> Self {
        Self(format!("ref:{}", reference))
    }

    /// Key a patient by its internal id (used when it has no reference).
    pub fn patient_id(id: i64) -> Self {
        Self(format!("patient:{}", id))
    }

    /// Key a test order by its id.
    pub fn order(id: i64) -> Self {
        Self(format!("order:{}", id))
    }

    /// Key a lab-test catalog entry by its product id.
    pub fn product(id: i64) -> Self {
        Self(format!("product:{}", id))
    }

    /// The persisted form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DedupKey({})", self.0)
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_roundtrip() {
        for ty in EventType::ALL {
            assert_eq!(ty.as_str().parse::<EventType>().unwrap(), ty);
        }
        assert!("radiology".parse::<EventType>().is_err());
    }

    #[test]
    fn test_dedup_key_namespaces_do_not_collide() {
        assert_ne!(DedupKey::patient_ref("42"), DedupKey::patient_id(42));
        assert_ne!(DedupKey::order(7), DedupKey::product(7));
    }

    #[test]
    fn test_event_id_display() {
        assert_eq!(EventId::new(12).to_string(), "#12");
        assert_eq!(format!("{:?}", EventId::new(12)), "EventId(12)");
    }
}
