//! Exponential-backoff reconnection for the push channel.
//!
//! When the socket drops, [`connect_with_backoff`] keeps retrying with
//! increasing delays until a connection is made or the
//! [`CancellationToken`] fires.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIConnection};

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay sequence for consecutive failed attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: ReconnectConfig,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait after the latest failure; grows for the next call.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        let next_ms = (self.current.as_millis() as f64 * self.config.multiplier) as u64;
        self.current = Duration::from_millis(next_ms).min(self.config.max_delay);
        self.attempts += 1;
        delay
    }

    /// Start over after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(ReconnectConfig::default())
    }
}

/// Connect, retrying with backoff.
///
/// Returns `Some(connection)` once a connection succeeds, or `None` if
/// `cancel` fires first. The backoff is reset on success.
pub async fn connect_with_backoff(
    client: &ComfyUIClient,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Option<ComfyUIConnection> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(ws_url = %client.ws_url(), "Connect cancelled");
                return None;
            }
            result = client.connect() => {
                match result {
                    Ok(conn) => {
                        if backoff.attempts() > 0 {
                            tracing::info!(
                                attempts = backoff.attempts(),
                                "Reconnected to ComfyUI",
                            );
                        }
                        backoff.reset();
                        return Some(conn);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt = backoff.attempts() + 1, "Connect attempt failed");
                    }
                }
            }
        }

        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
