//! Subject: the domain object a failed event belongs to.
//!
//! The subject decides the event type, the dedup key, and which resolver
//! strategy rebuilds context on retry. Matching on it is exhaustive, so a new
//! subject kind cannot be added without handling it everywhere.

use serde::{Deserialize, Serialize};

use crate::types::{DedupKey, EventType};

/// Loose reference to the owning domain object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SubjectRef {
    /// A patient, optionally carrying its external reference.
    Patient {
        patient_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        patient_ref: Option<String>,
    },
    /// A confirmed test order.
    TestOrder {
        order_id: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        order_name: Option<String>,
    },
    /// A lab-test catalog entry.
    LabTest { product_id: i64 },
}

impl SubjectRef {
    /// Reference a patient. A blank reference counts as absent.
    pub fn patient(patient_id: i64, patient_ref: Option<&str>) -> Self {
        let patient_ref = patient_ref
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(String::from);
        SubjectRef::Patient {
            patient_id,
            patient_ref,
        }
    }

    /// Reference a test order.
    pub fn test_order(order_id: i64, order_name: Option<&str>) -> Self {
        SubjectRef::TestOrder {
            order_id,
            order_name: order_name.filter(|n| !n.is_empty()).map(String::from),
        }
    }

    /// Reference a lab-test catalog entry.
    pub fn lab_test(product_id: i64) -> Self {
        SubjectRef::LabTest { product_id }
    }

    /// The event type implied by this subject.
    pub fn event_type(&self) -> EventType {
        match self {
            SubjectRef::Patient { .. } => EventType::Patient,
            SubjectRef::TestOrder { .. } => EventType::TestOrder,
            SubjectRef::LabTest { .. } => EventType::LabTest,
        }
    }

    /// The dedup key: patient reference (or id when absent), order id, or
    /// product id.
    pub fn dedup_key(&self) -> DedupKey {
        match self {
            SubjectRef::Patient {
                patient_ref: Some(reference),
                ..
            } => DedupKey::patient_ref(reference),
            SubjectRef::Patient { patient_id, .. } => DedupKey::patient_id(*patient_id),
            SubjectRef::TestOrder { order_id, .. } => DedupKey::order(*order_id),
            SubjectRef::LabTest { product_id } => DedupKey::product(*product_id),
        }
    }

    /// The id of the owning domain object, used for cascade deletion.
    pub fn owner_id(&self) -> i64 {
        match self {
            SubjectRef::Patient { patient_id, .. } => *patient_id,
            SubjectRef::TestOrder { order_id, .. } => *order_id,
            SubjectRef::LabTest { product_id } => *product_id,
        }
    }

    /// Whether `other` is the same domain object (same type and owner id).
    pub fn same_owner(&self, other: &SubjectRef) -> bool {
        self.event_type() == other.event_type() && self.owner_id() == other.owner_id()
    }

    /// Short label for operator listings.
    pub fn label(&self) -> String {
        match self {
            SubjectRef::Patient {
                patient_ref: Some(reference),
                ..
            } => reference.clone(),
            SubjectRef::Patient { patient_id, .. } => format!("patient {}", patient_id),
            SubjectRef::TestOrder {
                order_name: Some(name),
                ..
            } => name.clone(),
            SubjectRef::TestOrder { order_id, .. } => format!("order {}", order_id),
            SubjectRef::LabTest { product_id } => format!("product {}", product_id),
        }
    }
}
