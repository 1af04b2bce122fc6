use crate::error::{RelayError, RelayResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Политика повторов: фиксированная пауза и необязательный предел попыток
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub const fn unbounded(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub const fn capped(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: Some(max_attempts),
        }
    }

    /// Можно ли делать попытку с этим номером (нумерация с 1)
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }

    pub async fn pause(&self) {
        sleep(self.interval).await;
    }

    pub fn exhausted(&self, what: &str, attempts: u32) -> RelayError {
        RelayError::RetriesExhausted {
            what: what.to_string(),
            attempts,
        }
    }

    /// Повторяет `op` до первого успеха. Фатальные ошибки возвращаются сразу.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> RelayResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = RelayResult<T>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("while {what} (attempt {attempt}): {e}");
                    if !self.allows(attempt + 1) {
                        return Err(self.exhausted(what, attempt));
                    }
                    attempt += 1;
                    self.pause().await;
                }
            }
        }
    }
}
