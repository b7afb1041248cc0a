//! Proptest generators for property-based testing.
//!
//! Subject ids are drawn from small ranges so generated admissions collide
//! on their dedup keys often.

use proptest::prelude::*;
use serde_json::{json, Value};

use elis_sync_core::{Admission, ErrorKind, SubjectRef};

/// Generate a retryable ErrorKind.
pub fn retryable_error_kind() -> impl Strategy<Value = ErrorKind> {
    prop_oneof![
        Just(ErrorKind::ConnectionFailure),
        Just(ErrorKind::Timeout),
        (400u16..600).prop_map(ErrorKind::HttpError),
        Just(ErrorKind::Unclassified),
    ]
}

/// Generate a patient reference from a small pool.
pub fn patient_ref() -> impl Strategy<Value = Option<String>> {
    prop::option::of((1u8..=4).prop_map(|n| format!("P-{:03}", n)))
}

/// Generate a SubjectRef.
pub fn subject() -> impl Strategy<Value = SubjectRef> {
    prop_oneof![
        (1i64..=4, patient_ref())
            .prop_map(|(id, reference)| SubjectRef::patient(id, reference.as_deref())),
        (1i64..=4).prop_map(|id| SubjectRef::test_order(id, None)),
        (1i64..=4).prop_map(SubjectRef::lab_test),
    ]
}

/// Generate a small JSON payload.
pub fn payload() -> impl Strategy<Value = Value> {
    (any::<u32>(), "[a-z]{0,8}").prop_map(|(n, s)| json!({ "n": n, "s": s }))
}

/// Generate an Admission with a retryable error.
pub fn admission() -> impl Strategy<Value = Admission> {
    (subject(), payload(), retryable_error_kind())
        .prop_map(|(subject, payload, kind)| Admission::new(subject, payload, kind.to_string(), kind))
}

/// Generate up to `max` admissions.
pub fn admissions(max: usize) -> impl Strategy<Value = Vec<Admission>> {
    prop::collection::vec(admission(), 1..=max)
}
