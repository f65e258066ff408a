//! Utilities for adding a bit of jitter to reduce stampeding
//!
//! When several processes poll the same identity provider on the same
//! interval, jittering each scheduler's sleep keeps their checks from lining
//! up. Jitter only ever shortens a sleep, so it can never push a refresh past
//! its window.

use std::{fmt, time::Duration};

/// A type that provides some jittering of a delay
pub trait JitterSource: Send + Sync {
    /// Jitters a given delay, returning a value no longer than `delay`
    fn jitter(&self, delay: Duration) -> Duration;
}

/// A jitter source that does not do any jittering of time
#[derive(Debug, Default, Clone, Copy)]
pub struct NullJitter;

impl JitterSource for NullJitter {
    #[inline]
    fn jitter(&self, delay: Duration) -> Duration {
        delay
    }
}

impl fmt::Debug for dyn JitterSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("JitterSource")
    }
}

#[cfg(feature = "rand")]
mod random {
    use std::time::Duration;

    use rand::Rng;

    /// Jitters a delay earlier by a random amount
    ///
    /// Delays jittered by this type will have a value with a uniform distribution
    /// in the interval `(delay - max_jitter, delay]`, floored at zero.
    #[derive(Debug, Clone, Copy)]
    pub struct RandomEarlyJitter {
        max_jitter: Duration,
    }

    impl RandomEarlyJitter {
        /// Constructs a new instance that will jitter delays early up to `max_jitter`.
        pub fn new(max_jitter: Duration) -> Self {
            Self { max_jitter }
        }
    }

    impl super::JitterSource for RandomEarlyJitter {
        fn jitter(&self, delay: Duration) -> Duration {
            let max_millis = self.max_jitter.as_millis() as u64;
            if max_millis == 0 {
                return delay;
            }

            let jitter = rand::thread_rng().gen_range(0..max_millis);
            delay.saturating_sub(Duration::from_millis(jitter))
        }
    }

}

#[cfg(feature = "rand")]
pub use random::RandomEarlyJitter;
