use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::LimitsConfig;
use crate::utils::error::ApiError;

#[derive(Clone)]
pub struct Limiters {
    pub generation: Arc<Semaphore>,
    pub acquire_timeout: Duration,
}

impl Limiters {
    pub fn new(cfg: &LimitsConfig) -> Self {
        Self {
            generation: Arc::new(Semaphore::new(cfg.max_concurrent_generations.max(1))),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms.max(1)),
        }
    }

    /// Slot for one engine call; held until the response is fully produced.
    pub async fn acquire_generation(&self) -> Result<(OwnedSemaphorePermit, Duration), ApiError> {
        Self::acquire_timed(self.generation.clone(), self.acquire_timeout, "generation").await
    }

    pub async fn acquire_timed(
        sem: Arc<Semaphore>,
        acquire_timeout: Duration,
        op: &'static str,
    ) -> Result<(OwnedSemaphorePermit, Duration), ApiError> {
        let start = Instant::now();

        let permit = tokio::time::timeout(acquire_timeout, sem.acquire_owned())
            .await
            .map_err(|_| ApiError::Busy(format!("limiter acquire timeout for op={}", op)))?
            .map_err(|_| ApiError::Internal(format!("limiter closed for op={}", op)))?;

        Ok((permit, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_times_out_when_full() {
        let limiters = Limiters::new(&LimitsConfig {
            max_concurrent_generations: 1,
            acquire_timeout_ms: 20,
            stream_buffer: 1,
        });

        let (held, _) = limiters.acquire_generation().await.unwrap();
        let err = limiters.acquire_generation().await.unwrap_err();
        assert!(matches!(err, ApiError::Busy(_)));

        drop(held);
        assert!(limiters.acquire_generation().await.is_ok());
    }
}
