//! Subject resolution before a retry.
//!
//! Before re-sending, the queue asks the resolver whether the domain object
//! behind an event still exists, and lets it rebuild the payload from the
//! live object. Dispatch is by [`SubjectRef`] variant, so adding a subject
//! kind is a compile error until every resolver handles it.

use async_trait::async_trait;
use serde_json::Value;

use elis_sync_core::SubjectRef;

use crate::error::Result;

/// What the resolver found for an event's subject.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The subject exists; send the stored payload unchanged.
    Live,
    /// The subject exists and the payload was rebuilt from it.
    Rebuilt(Value),
    /// The subject was deleted. The retry is not attempted.
    NotFound,
}

/// Subject resolver trait, one lookup per subject kind.
///
/// Each method receives the stored payload so a resolver can rebuild from
/// it (for example, lab tests are located by the `id` in their payload).
/// A lookup that cannot complete returns a [`crate::DeliveryFailure`], which
/// is recorded like a failed delivery.
#[async_trait]
pub trait SubjectResolver: Send + Sync {
    async fn resolve_patient(
        &self,
        patient_id: i64,
        patient_ref: Option<&str>,
        payload: &Value,
    ) -> Result<Resolution>;

    async fn resolve_test_order(
        &self,
        order_id: i64,
        order_name: Option<&str>,
        payload: &Value,
    ) -> Result<Resolution>;

    async fn resolve_lab_test(&self, product_id: i64, payload: &Value) -> Result<Resolution>;
}

#[async_trait]
impl<T: SubjectResolver + ?Sized> SubjectResolver for std::sync::Arc<T> {
    async fn resolve_patient(
        &self,
        patient_id: i64,
        patient_ref: Option<&str>,
        payload: &Value,
    ) -> Result<Resolution> {
        (**self)
            .resolve_patient(patient_id, patient_ref, payload)
            .await
    }

    async fn resolve_test_order(
        &self,
        order_id: i64,
        order_name: Option<&str>,
        payload: &Value,
    ) -> Result<Resolution> {
        (**self)
            .resolve_test_order(order_id, order_name, payload)
            .await
    }

    async fn resolve_lab_test(&self, product_id: i64, payload: &Value) -> Result<Resolution> {
        (**self).resolve_lab_test(product_id, payload).await
    }
}

/// Route a subject to the matching resolver method.
pub async fn resolve<R>(resolver: &R, subject: &SubjectRef, payload: &Value) -> Result<Resolution>
where
    R: SubjectResolver + ?Sized,
{
    let resolution = match subject {
        SubjectRef::Patient {
            patient_id,
            patient_ref,
        } => {
            resolver
                .resolve_patient(*patient_id, patient_ref.as_deref(), payload)
                .await?
        }
        SubjectRef::TestOrder {
            order_id,
            order_name,
        } => {
            resolver
                .resolve_test_order(*order_id, order_name.as_deref(), payload)
                .await?
        }
        SubjectRef::LabTest { product_id } => {
            resolver.resolve_lab_test(*product_id, payload).await?
        }
    };

    tracing::trace!(subject = %subject.label(), ?resolution, "resolved subject");
    Ok(resolution)
}

/// Resolver for deployments where every subject is assumed live and
/// payloads are resent exactly as stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl SubjectResolver for PassthroughResolver {
    async fn resolve_patient(
        &self,
        _patient_id: i64,
        _patient_ref: Option<&str>,
        _payload: &Value,
    ) -> Result<Resolution> {
        Ok(Resolution::Live)
    }

    async fn resolve_test_order(
        &self,
        _order_id: i64,
        _order_name: Option<&str>,
        _payload: &Value,
    ) -> Result<Resolution> {
        Ok(Resolution::Live)
    }

    async fn resolve_lab_test(&self, _product_id: i64, _payload: &Value) -> Result<Resolution> {
        Ok(Resolution::Live)
    }
}
