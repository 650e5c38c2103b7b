//! Polling a service until it reports itself available.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use testnet_common::ServiceId;

use crate::services::Service;

#[derive(Debug, Error)]
#[error("service '{service_id}' did not become available after {polls} poll(s) over {waited:?}")]
pub struct AvailabilityError {
    pub service_id: ServiceId,
    pub polls: u32,
    pub waited: Duration,
}

/// Bound to one service handle; returned alongside it by the network context.
pub struct AvailabilityChecker<S: ?Sized> {
    service: Arc<S>,
}

impl<S: Service + ?Sized> std::fmt::Debug for AvailabilityChecker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AvailabilityChecker")
            .field("service_id", self.service.service_id())
            .finish()
    }
}

impl<S: Service + ?Sized> AvailabilityChecker<S> {
    pub fn new(service: Arc<S>) -> Self {
        Self { service }
    }

    /// Polls up to `max_num_polls` times, sleeping `time_between_polls`
    /// between polls, until the service reports itself available.
    pub async fn wait_for_startup(
        &self,
        time_between_polls: Duration,
        max_num_polls: u32,
    ) -> Result<(), AvailabilityError> {
        let started = tokio::time::Instant::now();
        for poll in 1..=max_num_polls {
            if self.service.is_available().await {
                tracing::debug!(
                    service_id = %self.service.service_id(),
                    polls = poll,
                    "service is available"
                );
                return Ok(());
            }
            tracing::trace!(service_id = %self.service.service_id(), poll, "service not yet available");
            if poll < max_num_polls {
                tokio::time::sleep(time_between_polls).await;
            }
        }

        Err(AvailabilityError {
            service_id: self.service.service_id().clone(),
            polls: max_num_polls,
            waited: started.elapsed(),
        })
    }
}
