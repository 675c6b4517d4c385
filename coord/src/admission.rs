//! Bounded concurrency for inbound queries.
//!
//! Capacity is fixed when the gate is built. A request that cannot get a
//! token right away is turned away with `503 Service Unavailable`; nothing
//! is queued.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone)]
pub struct AdmissionGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

/// One unit of in-flight capacity, returned to the gate on drop.
#[derive(Debug)]
pub struct InFlightToken {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn try_admit(&self) -> Option<InFlightToken> {
        match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => Some(InFlightToken { _permit: permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }
}

/// Axum middleware: `.layer(middleware::from_fn_with_state(gate, admit))`.
///
/// The token lives across `next.run`, so it is released however the
/// handler finishes, including a panic unwinding through this frame.
pub async fn admit(State(gate): State<AdmissionGate>, request: Request, next: Next) -> Response {
    let Some(_token) = gate.try_admit() else {
        tracing::debug!(
            capacity = gate.capacity(),
            path = %request.uri().path(),
            "admission.rejected"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    next.run(request).await
}
