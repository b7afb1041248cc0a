//! Delivery attempter abstraction.
//!
//! The attempter performs exactly one network call to the LIS for an event's
//! payload. It owns its transport and any per-call timeout; the queue only
//! consumes the classified result.

use async_trait::async_trait;
use serde_json::Value;

use elis_sync_core::EventType;

use crate::error::Result;

/// A successful delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivered {
    /// HTTP status returned by the LIS, when the transport has one.
    pub status: Option<u16>,
}

impl Delivered {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_status(status: u16) -> Self {
        Self {
            status: Some(status),
        }
    }
}

/// Delivery attempter trait for pushing one payload to the LIS.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait DeliveryAttempter: Send + Sync {
    /// Send `payload` for an event of `event_type`.
    async fn attempt(&self, event_type: EventType, payload: &Value) -> Result<Delivered>;
}

#[async_trait]
impl<T: DeliveryAttempter + ?Sized> DeliveryAttempter for std::sync::Arc<T> {
    async fn attempt(&self, event_type: EventType, payload: &Value) -> Result<Delivered> {
        (**self).attempt(event_type, payload).await
    }
}
