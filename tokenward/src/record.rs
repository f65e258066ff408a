//! The persisted unit of token state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokenward_clock::{DurationSecs, UnixTime};

use crate::{
    crypto::SealedSecret, AccessToken, ProviderId, ProviderIdRef, RefreshToken, SubjectId,
    SubjectIdRef,
};

/// The token type assumed when the provider does not name one
pub const DEFAULT_TOKEN_TYPE: &str = "Bearer";

/// Identifies one token record: a subject as seen by one provider
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    /// The end user
    pub subject_id: SubjectId,
    /// The identity source
    pub provider: ProviderId,
}

impl RecordKey {
    /// Constructs a new record key
    pub fn new(subject_id: &SubjectIdRef, provider: &ProviderIdRef) -> Self {
        Self {
            subject_id: subject_id.to_owned(),
            provider: provider.to_owned(),
        }
    }
}

/// "Remember me" state layered over the provider-issued expiry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtendedSession {
    /// Whether the extension is in force
    pub is_extended_session: bool,
    /// The base expiry as it stood before the extension was applied
    pub original_expires_at: Option<UnixTime>,
    /// The expiry that overrides the base expiry while extended
    pub extended_expires_at: Option<UnixTime>,
}

impl ExtendedSession {
    /// The expiry to schedule against, given the base expiry
    #[inline]
    pub fn effective_expiry(&self, expires_at: UnixTime) -> UnixTime {
        match (self.is_extended_session, self.extended_expires_at) {
            (true, Some(extended)) => extended,
            _ => expires_at,
        }
    }
}

const MAX_EXTRA_ENTRIES: usize = 16;
const MAX_EXTRA_KEY_LEN: usize = 64;
const MAX_EXTRA_VALUE_LEN: usize = 1024;

/// The bounded extension map rejected an entry
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtraFieldError {
    /// Too many entries
    #[error("at most 16 extra fields may be stored")]
    TooManyEntries,
    /// The key is empty or too long
    #[error("extra field key must be 1 to 64 bytes")]
    InvalidKey,
    /// The value is too long
    #[error("extra field `{key}` exceeds 1024 bytes")]
    ValueTooLong {
        /// The offending key
        key: String,
    },
}

/// Provider-specific fields carried alongside a token, bounded in size
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtraFields(BTreeMap<String, String>);

impl ExtraFields {
    /// Constructs an empty map
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an entry, replacing any previous value for the key
    pub fn insert(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ExtraFieldError> {
        let key = key.into();
        let value = value.into();
        if key.is_empty() || key.len() > MAX_EXTRA_KEY_LEN {
            return Err(ExtraFieldError::InvalidKey);
        }
        if value.len() > MAX_EXTRA_VALUE_LEN {
            return Err(ExtraFieldError::ValueTooLong { key });
        }
        if !self.0.contains_key(&key) && self.0.len() >= MAX_EXTRA_ENTRIES {
            return Err(ExtraFieldError::TooManyEntries);
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Merges `other` over `self`; on error `self` is left untouched
    pub fn merge(&mut self, other: &ExtraFields) -> Result<(), ExtraFieldError> {
        let mut merged = self.clone();
        for (k, v) in &other.0 {
            merged.insert(k.clone(), v.clone())?;
        }
        *self = merged;
        Ok(())
    }

    /// Gets a value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// The number of entries
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A decrypted token record, as handed to consumers
///
/// Records are snapshots: mutating one does not change the store. All
/// changes go through [`TokenStore`](crate::TokenStore).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    /// Which subject and provider this record belongs to
    pub key: RecordKey,
    /// The bearer credential presented to resource servers
    pub access_token: AccessToken,
    /// The credential used to obtain new access tokens, if one was issued
    pub refresh_token: Option<RefreshToken>,
    /// The token type, usually `Bearer`
    pub token_type: String,
    /// The provider-issued expiry
    pub expires_at: UnixTime,
    /// When the record was first stored
    pub created_at: UnixTime,
    /// When a consumer last fetched the token
    pub last_used_at: Option<UnixTime>,
    /// When the token was last refreshed or updated
    pub last_refreshed_at: Option<UnixTime>,
    /// The space-delimited granted scope
    pub scope: Option<String>,
    /// Extended session state
    pub session: ExtendedSession,
    /// Whether the record is usable; cleared when the provider rejects the refresh token
    pub is_active: bool,
    /// Provider-specific extras
    pub extra: ExtraFields,
}

impl TokenRecord {
    /// The expiry used for scheduling, honoring any extended session
    #[inline]
    pub fn effective_expires_at(&self) -> UnixTime {
        self.session.effective_expiry(self.expires_at)
    }

    /// How long until the effective expiry, saturating at zero
    #[inline]
    pub fn remaining_at(&self, now: UnixTime) -> DurationSecs {
        self.effective_expires_at() - now
    }

    /// Whether the token is within `threshold` of its effective expiry
    #[inline]
    pub fn needs_refresh_at(&self, now: UnixTime, threshold: DurationSecs) -> bool {
        self.effective_expires_at() <= now + threshold
    }

    /// Whether the record can be refreshed without re-authorization
    #[inline]
    pub fn is_refreshable(&self) -> bool {
        self.is_active && self.refresh_token.is_some()
    }

    /// The subject this record belongs to
    pub fn subject_id(&self) -> &SubjectIdRef {
        &self.key.subject_id
    }

    /// The provider that issued this record
    pub fn provider(&self) -> &ProviderIdRef {
        &self.key.provider
    }
}

/// The at-rest shape of a token record
///
/// Credentials are sealed; every other field is stored in the clear so that
/// scheduling decisions never require decryption.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// Which subject and provider this record belongs to
    pub key: RecordKey,
    /// The sealed access token
    pub access_token: SealedSecret,
    /// The sealed refresh token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<SealedSecret>,
    /// The token type
    pub token_type: String,
    /// The provider-issued expiry
    pub expires_at: UnixTime,
    /// When the record was first stored
    pub created_at: UnixTime,
    /// When a consumer last fetched the token
    #[serde(default)]
    pub last_used_at: Option<UnixTime>,
    /// When the token was last refreshed or updated
    #[serde(default)]
    pub last_refreshed_at: Option<UnixTime>,
    /// The granted scope
    #[serde(default)]
    pub scope: Option<String>,
    /// Extended session state
    #[serde(default)]
    pub session: ExtendedSession,
    /// Whether the record is usable
    pub is_active: bool,
    /// Provider-specific extras
    #[serde(default, skip_serializing_if = "ExtraFields::is_empty")]
    pub extra: ExtraFields,
}

impl StoredRecord {
    /// The expiry used for scheduling, honoring any extended session
    #[inline]
    pub fn effective_expires_at(&self) -> UnixTime {
        self.session.effective_expiry(self.expires_at)
    }

    /// Whether this record should be picked up by a refresh pass
    #[inline]
    pub fn is_due_for_refresh(&self, now: UnixTime, threshold: DurationSecs) -> bool {
        self.is_active
            && self.refresh_token.is_some()
            && self.effective_expires_at() <= now + threshold
    }
}

/// A set of token fields, any of which may be absent
///
/// Used both for consumer-supplied upserts and for the result of a refresh
/// exchange. When applied to an existing record, only the present fields
/// are changed.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TokenFields {
    /// A new access token
    pub access_token: Option<AccessToken>,
    /// A new refresh token
    pub refresh_token: Option<RefreshToken>,
    /// The token type
    pub token_type: Option<String>,
    /// An absolute expiry; takes precedence over `expires_in`
    pub expires_at: Option<UnixTime>,
    /// A lifetime relative to the time the fields are applied
    pub expires_in: Option<DurationSecs>,
    /// The granted scope
    pub scope: Option<String>,
    /// Provider-specific extras to merge
    pub extra: ExtraFields,
}

impl TokenFields {
    /// Fields carrying only an access token
    pub fn new(access_token: AccessToken) -> Self {
        Self {
            access_token: Some(access_token),
            ..Self::default()
        }
    }

    /// Sets the refresh token
    pub fn with_refresh_token(mut self, refresh_token: RefreshToken) -> Self {
        self.refresh_token = Some(refresh_token);
        self
    }

    /// Sets an absolute expiry
    pub fn with_expires_at(mut self, expires_at: UnixTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Sets a relative lifetime
    pub fn with_expires_in(mut self, expires_in: DurationSecs) -> Self {
        self.expires_in = Some(expires_in);
        self
    }

    /// Sets the token type
    pub fn with_token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    /// Sets the scope
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the extras
    pub fn with_extra(mut self, extra: ExtraFields) -> Self {
        self.extra = extra;
        self
    }

    /// The absolute expiry these fields imply when applied at `now`
    pub fn resolve_expires_at(&self, now: UnixTime) -> Option<UnixTime> {
        self.expires_at
            .or_else(|| self.expires_in.map(|lifetime| now + lifetime))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_at: u64) -> TokenRecord {
        TokenRecord {
            key: RecordKey::new(&SubjectId::from_static("alice"), &ProviderId::default()),
            access_token: AccessToken::from_static("access"),
            refresh_token: Some(RefreshToken::from_static("refresh")),
            token_type: DEFAULT_TOKEN_TYPE.to_owned(),
            expires_at: UnixTime(expires_at),
            created_at: UnixTime(0),
            last_used_at: None,
            last_refreshed_at: None,
            scope: None,
            session: ExtendedSession::default(),
            is_active: true,
            extra: ExtraFields::new(),
        }
    }

    #[test]
    fn effective_expiry_is_base_without_extension() {
        let r = record(1_000);
        assert_eq!(r.effective_expires_at(), UnixTime(1_000));
    }

    #[test]
    fn extended_expiry_overrides_base() {
        let mut r = record(100);
        r.session = ExtendedSession {
            is_extended_session: true,
            original_expires_at: Some(UnixTime(100)),
            extended_expires_at: Some(UnixTime(1_000_000)),
        };
        assert_eq!(r.effective_expires_at(), UnixTime(1_000_000));
        r.expires_at = UnixTime(5);
        assert_eq!(r.effective_expires_at(), UnixTime(1_000_000));
    }

    #[test]
    fn refresh_threshold_is_inclusive() {
        let r = record(1_600);
        assert!(r.needs_refresh_at(UnixTime(1_000), DurationSecs(600)));
        assert!(!r.needs_refresh_at(UnixTime(999), DurationSecs(600)));
    }

    #[test]
    fn remaining_saturates_after_expiry() {
        let r = record(10);
        assert_eq!(r.remaining_at(UnixTime(20)), DurationSecs(0));
        assert_eq!(r.remaining_at(UnixTime(4)), DurationSecs(6));
    }

    #[test]
    fn expires_at_wins_over_expires_in() {
        let fields = TokenFields::new(AccessToken::from_static("a"))
            .with_expires_in(DurationSecs(60))
            .with_expires_at(UnixTime(500));
        assert_eq!(fields.resolve_expires_at(UnixTime(100)), Some(UnixTime(500)));

        let fields = TokenFields::new(AccessToken::from_static("a"))
            .with_expires_in(DurationSecs(60));
        assert_eq!(fields.resolve_expires_at(UnixTime(100)), Some(UnixTime(160)));
    }

    #[test]
    fn extra_fields_are_bounded() {
        let mut extra = ExtraFields::new();
        for i in 0..MAX_EXTRA_ENTRIES {
            extra.insert(format!("k{i}"), "v").unwrap();
        }
        assert_eq!(
            extra.insert("one-too-many", "v"),
            Err(ExtraFieldError::TooManyEntries)
        );
        // replacing an existing key is still allowed at capacity
        extra.insert("k0", "updated").unwrap();
        assert_eq!(extra.get("k0"), Some("updated"));

        assert_eq!(
            ExtraFields::new().insert("", "v"),
            Err(ExtraFieldError::InvalidKey)
        );
        assert!(matches!(
            ExtraFields::new().insert("big", "x".repeat(MAX_EXTRA_VALUE_LEN + 1)),
            Err(ExtraFieldError::ValueTooLong { .. })
        ));
    }

    #[test]
    fn failed_merge_leaves_map_untouched() {
        let mut base = ExtraFields::new();
        base.insert("keep", "me").unwrap();
        let mut incoming = ExtraFields::new();
        for i in 0..MAX_EXTRA_ENTRIES {
            incoming.insert(format!("k{i}"), "v").unwrap();
        }
        assert!(base.merge(&incoming).is_err());
        assert_eq!(base.len(), 1);
    }
}
