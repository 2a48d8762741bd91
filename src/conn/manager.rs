// src/conn/manager.rs

//! Owns the reconnect policy shared by every component that holds a
//! long-lived connection to a source or target: exponential backoff with
//! jitter, capped at a maximum delay and a maximum attempt count.

use crate::config::EndpointConfig;
use crate::conn::client::RedisClient;
use crate::errors::ReplError;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

/// Exponential backoff with jitter, `delay = min(initial * factor^(n-1), max_delay)`
/// plus up to 20% random jitter added on top.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.factor.powi(attempt as i32 - 1);
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter: f64 = rand::thread_rng().gen_range(0.0..0.2);
        Duration::from_secs_f64(capped * (1.0 + jitter))
    }
}

/// Connects to a single endpoint and transparently reconnects on transient
/// network failures, following [`RetryPolicy`].
pub struct ConnectionManager {
    endpoint: EndpointConfig,
    policy: RetryPolicy,
    client: Option<RedisClient>,
}

impl ConnectionManager {
    pub fn new(endpoint: EndpointConfig, policy: RetryPolicy) -> Self {
        Self {
            endpoint,
            policy,
            client: None,
        }
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Connects if not already connected, retrying per the configured policy.
    pub async fn connect(&mut self) -> Result<(), ReplError> {
        if self.client.is_some() {
            return Ok(());
        }
        self.reconnect().await
    }

    /// Drops any existing connection and establishes a fresh one, retrying
    /// up to `policy.max_attempts` times with exponential backoff.
    pub async fn reconnect(&mut self) -> Result<(), ReplError> {
        self.client = None;
        let mut last_err = None;
        for attempt in 1..=self.policy.max_attempts {
            match RedisClient::connect(&self.endpoint).await {
                Ok(client) => {
                    self.client = Some(client);
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        target = %self.endpoint.host,
                        attempt,
                        error = %e,
                        "connection attempt failed"
                    );
                    last_err = Some(e);
                    if attempt < self.policy.max_attempts {
                        tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }
        Err(ReplError::ConnectFailed {
            addr: format!("{}:{}", self.endpoint.host, self.endpoint.port),
            attempts: self.policy.max_attempts,
            reason: last_err.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    /// Runs `f` against the current connection, transparently reconnecting
    /// and retrying on transient errors up to `policy.max_attempts` times.
    pub async fn execute_with_retry<F, Fut, T>(&mut self, mut f: F) -> Result<T, ReplError>
    where
        F: FnMut(&mut RedisClient) -> Fut,
        Fut: std::future::Future<Output = Result<T, ReplError>>,
    {
        self.connect().await?;
        let mut last_err = None;
        for attempt in 1..=self.policy.max_attempts {
            let client = self.client.as_mut().expect("connected above");
            match f(client).await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient_network() => {
                    warn!(attempt, error = %e, "transient error, reconnecting");
                    last_err = Some(e.to_string());
                    if attempt < self.policy.max_attempts {
                        self.reconnect().await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(ReplError::ConnectFailed {
            addr: format!("{}:{}", self.endpoint.host, self.endpoint.port),
            attempts: self.policy.max_attempts,
            reason: last_err.unwrap_or_default(),
        })
    }

    pub fn client_mut(&mut self) -> Option<&mut RedisClient> {
        self.client.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_is_capped() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_attempts: 10,
        };
        let d1 = policy.delay_for_attempt(1).as_secs_f64();
        let d2 = policy.delay_for_attempt(2).as_secs_f64();
        assert!(d1 >= 0.1 && d1 < 0.12);
        assert!(d2 >= 0.2 && d2 < 0.24);
        let d_large = policy.delay_for_attempt(20).as_secs_f64();
        assert!(d_large <= 1.2);
    }
}
