//! Error backoff handling

use std::time::Duration;

/// Configuration for how to manage backoff when an error is encountered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErrorBackoffConfig {
    initial_error_delay: Duration,
    max_error_delay: Duration,
    multiplier: u32,
}

impl Default for ErrorBackoffConfig {
    /// Default backoff configuration
    ///
    /// Uses an initial error delay of 1 second with a multiplier of 2, so the
    /// n-th consecutive error waits `2^n` seconds. Maximum delay is capped at
    /// 5 minutes.
    fn default() -> Self {
        Self {
            initial_error_delay: Duration::from_secs(1),
            max_error_delay: Duration::from_secs(300),
            multiplier: 2,
        }
    }
}

impl ErrorBackoffConfig {
    /// Constructs a new backoff configuration
    ///
    /// When encountering an error for the first time, the backoff will be `initial_error_delay`.
    /// On subsequent errors, the backoff should be multiplied by `multiplier`, with a cap of
    /// `max_error_delay`.
    pub fn new(initial_error_delay: Duration, max_error_delay: Duration, multiplier: u32) -> Self {
        Self {
            initial_error_delay,
            max_error_delay,
            multiplier,
        }
    }

    /// The delay to apply after the `attempt`-th consecutive error (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.saturating_pow(attempt);
        self.initial_error_delay
            .checked_mul(factor)
            .unwrap_or(self.max_error_delay)
            .min(self.max_error_delay)
    }
}

/// Utility trait for extending types with a backoff handler
pub trait WithBackoff {
    /// The output of providing backoff
    type Output;

    /// Applies backoff to the current value
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output;
}

impl<T, E> WithBackoff for Result<T, E> {
    type Output = Result<T, (E, Duration)>;
    fn with_backoff(self, handler: &mut ErrorBackoffHandler) -> Self::Output {
        match self {
            Ok(ok) => {
                handler.success();
                Ok(ok)
            }
            Err(err) => Err((err, handler.error())),
        }
    }
}

/// A stateful handler that manages error backoff state
#[derive(Debug)]
pub struct ErrorBackoffHandler {
    config: ErrorBackoffConfig,
    consecutive_errors: u32,
}

impl ErrorBackoffHandler {
    /// Constructs a new handler from an [`ErrorBackoffConfig`].
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            consecutive_errors: 0,
        }
    }

    /// Reports a success
    ///
    /// This resets the internal delay state.
    pub fn success(&mut self) {
        self.consecutive_errors = 0;
    }

    /// Reports a failure and returns the expected backoff delay
    ///
    /// This will apply the values in the backoff configuration, increasing the backoff delay
    /// if required, and then report the expected next delay.
    pub fn error(&mut self) -> Duration {
        let delay = self.config.delay_for(self.consecutive_errors);
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        delay
    }

    /// The number of errors reported since the last success
    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }
}

impl From<ErrorBackoffConfig> for ErrorBackoffHandler {
    fn from(config: ErrorBackoffConfig) -> Self {
        Self::new(config)
    }
}

/// Bounds how many times a retryable operation is attempted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: ErrorBackoffConfig,
}

impl Default for RetryPolicy {
    /// Three attempts with the default exponential backoff between them
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: ErrorBackoffConfig::default(),
        }
    }
}

impl RetryPolicy {
    /// Constructs a new retry policy
    ///
    /// At least one attempt is always made, even if `max_attempts` is zero.
    pub fn new(max_attempts: u32, backoff: ErrorBackoffConfig) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
        }
    }

    /// The total number of attempts permitted
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// A fresh backoff handler for one retried operation
    pub fn handler(&self) -> ErrorBackoffHandler {
        ErrorBackoffHandler::new(self.backoff)
    }
}
