//! "Remember me" handling
//!
//! An extended session overrides the provider-issued expiry for scheduling
//! purposes without losing it: the pre-extension expiry is kept aside in
//! `original_expires_at` and restored when the extension is withdrawn.

use tokenward_clock::{DurationSecs, UnixTime};

use crate::record::ExtendedSession;

/// A request to change a record's extended session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionCommand {
    /// Extend the session to `days` from now
    Enable {
        /// Length of the extension in days
        days: u32,
    },
    /// Withdraw any extension
    Disable,
}

/// The result of evaluating a [`SessionCommand`] against a record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The command does not change anything
    Unchanged,
    /// The record should be updated to these values
    Updated {
        /// The base expiry
        expires_at: UnixTime,
        /// The extended session state
        session: ExtendedSession,
    },
}

/// Computes extended-session transitions
///
/// This is a pure function of its inputs; persisting the outcome is the
/// caller's business.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExtendedSessionPolicy;

impl ExtendedSessionPolicy {
    /// Evaluates `command` against a record's base expiry and session state
    ///
    /// Enabling is a no-op when an extension already reaches at least as far
    /// as the requested one, or when zero days are requested. Disabling is a
    /// no-op when no extension is in force.
    pub fn evaluate(
        &self,
        expires_at: UnixTime,
        session: &ExtendedSession,
        command: SessionCommand,
        now: UnixTime,
    ) -> SessionOutcome {
        match command {
            SessionCommand::Enable { days } => {
                if days == 0 {
                    return SessionOutcome::Unchanged;
                }

                let target = now + DurationSecs::from_days(u64::from(days));
                if session.is_extended_session
                    && session.extended_expires_at.map_or(false, |e| e >= target)
                {
                    return SessionOutcome::Unchanged;
                }

                let original = if session.is_extended_session {
                    session.original_expires_at.or(Some(expires_at))
                } else {
                    Some(expires_at)
                };

                SessionOutcome::Updated {
                    expires_at,
                    session: ExtendedSession {
                        is_extended_session: true,
                        original_expires_at: original,
                        extended_expires_at: Some(target),
                    },
                }
            }
            SessionCommand::Disable => {
                if !session.is_extended_session {
                    return SessionOutcome::Unchanged;
                }

                SessionOutcome::Updated {
                    expires_at: session.original_expires_at.unwrap_or(expires_at),
                    session: ExtendedSession::default(),
                }
            }
        }
    }

    /// Adjusts session state after the base expiry moved due to a refresh
    ///
    /// While extended, the newest provider expiry becomes the value restored
    /// on disable.
    pub fn track_refresh(&self, session: &mut ExtendedSession, new_expires_at: UnixTime) {
        if session.is_extended_session {
            session.original_expires_at = Some(new_expires_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: UnixTime = UnixTime(1_700_000_000);
    const DAY: u64 = 86_400;

    fn enable(days: u32) -> SessionCommand {
        SessionCommand::Enable { days }
    }

    #[test]
    fn enable_preserves_original_expiry() {
        let base = NOW + DurationSecs(3_600);
        let out = ExtendedSessionPolicy.evaluate(base, &ExtendedSession::default(), enable(30), NOW);
        assert_eq!(
            out,
            SessionOutcome::Updated {
                expires_at: base,
                session: ExtendedSession {
                    is_extended_session: true,
                    original_expires_at: Some(base),
                    extended_expires_at: Some(NOW + DurationSecs(30 * DAY)),
                }
            }
        );
    }

    #[test]
    fn enable_with_shorter_or_equal_duration_is_noop() {
        let session = ExtendedSession {
            is_extended_session: true,
            original_expires_at: Some(NOW),
            extended_expires_at: Some(NOW + DurationSecs(30 * DAY)),
        };
        assert_eq!(
            ExtendedSessionPolicy.evaluate(NOW, &session, enable(30), NOW),
            SessionOutcome::Unchanged
        );
        assert_eq!(
            ExtendedSessionPolicy.evaluate(NOW, &session, enable(7), NOW),
            SessionOutcome::Unchanged
        );
    }

    #[test]
    fn enable_with_longer_duration_keeps_first_original() {
        let session = ExtendedSession {
            is_extended_session: true,
            original_expires_at: Some(UnixTime(42)),
            extended_expires_at: Some(NOW + DurationSecs(DAY)),
        };
        match ExtendedSessionPolicy.evaluate(NOW, &session, enable(10), NOW) {
            SessionOutcome::Updated { session, .. } => {
                assert_eq!(session.original_expires_at, Some(UnixTime(42)));
                assert_eq!(session.extended_expires_at, Some(NOW + DurationSecs(10 * DAY)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn zero_days_is_noop() {
        assert_eq!(
            ExtendedSessionPolicy.evaluate(NOW, &ExtendedSession::default(), enable(0), NOW),
            SessionOutcome::Unchanged
        );
    }

    #[test]
    fn disable_restores_original() {
        let original = NOW - DurationSecs(100);
        let session = ExtendedSession {
            is_extended_session: true,
            original_expires_at: Some(original),
            extended_expires_at: Some(NOW + DurationSecs(1_000_000)),
        };
        let out = ExtendedSessionPolicy.evaluate(NOW, &session, SessionCommand::Disable, NOW);
        assert_eq!(
            out,
            SessionOutcome::Updated {
                expires_at: original,
                session: ExtendedSession::default(),
            }
        );
    }

    #[test]
    fn disable_when_not_extended_is_noop() {
        assert_eq!(
            ExtendedSessionPolicy.evaluate(
                NOW,
                &ExtendedSession::default(),
                SessionCommand::Disable,
                NOW
            ),
            SessionOutcome::Unchanged
        );
    }

    #[test]
    fn refresh_moves_original_only_while_extended() {
        let mut session = ExtendedSession::default();
        ExtendedSessionPolicy.track_refresh(&mut session, UnixTime(9));
        assert_eq!(session, ExtendedSession::default());

        let mut session = ExtendedSession {
            is_extended_session: true,
            original_expires_at: Some(UnixTime(1)),
            extended_expires_at: Some(UnixTime(100)),
        };
        ExtendedSessionPolicy.track_refresh(&mut session, UnixTime(9));
        assert_eq!(session.original_expires_at, Some(UnixTime(9)));
    }
}
