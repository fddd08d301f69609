use crate::error::{ModbusError, Result};
use crate::types::Config;
use std::time::Duration;
use tracing::{trace, warn};

/// What `send_frame` reports once the retry budget is used up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Exhausted {
    /// Return `ModbusError::Timeout`
    #[default]
    Fail,
    /// Log the failure and report success
    Ignore,
}

/// Bounded retry with a fixed delay between attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
    pub on_exhausted: Exhausted,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1000,
            delay: Duration::from_millis(5),
            on_exhausted: Exhausted::Fail,
        }
    }
}

impl Config for RetryPolicy {
    fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(ModbusError::InvalidArgument);
        }
        Ok(())
    }
}

impl RetryPolicy {
    /// Runs `op` until it succeeds or `attempts` calls have failed, sleeping
    /// `delay` between two attempts. Blocks the calling thread for at most
    /// `(attempts - 1) * delay` plus the time spent in `op`.
    pub fn run<T, F>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        for attempt in 1..=self.attempts {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    trace!("Attempt {}/{} failed: {}", attempt, self.attempts, e);
                    if attempt < self.attempts {
                        std::thread::sleep(self.delay);
                    } else {
                        warn!("Giving up after {} attempts: {}", self.attempts, e);
                    }
                }
            }
        }
        Err(ModbusError::Timeout)
    }
}
