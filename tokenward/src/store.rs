//! Encrypted, per-record atomic storage of token records

use std::{error, fmt, sync::Arc};

use thiserror::Error;
use tokenward_clock::{Clock, DurationSecs, System, UnixTime};

use crate::{
    backends::{BackendError, RecordBackend},
    crypto::{CryptoError, SealedSecret, TokenCipher},
    record::{
        ExtendedSession, ExtraFieldError, ExtraFields, RecordKey, StoredRecord, TokenFields,
        TokenRecord, DEFAULT_TOKEN_TYPE,
    },
    session::{ExtendedSessionPolicy, SessionCommand, SessionOutcome},
    AccessToken, ProviderIdRef, RefreshToken, RefreshTokenRef, SubjectIdRef,
};

/// An error from the token store
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persistence backend failed
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// A credential could not be sealed or opened
    #[error("credential encryption failed")]
    Crypto(#[from] CryptoError),
    /// A new record was missing a required field
    #[error("cannot create a token record without `{0}`")]
    IncompleteRecord(&'static str),
    /// A new record would already be expired
    #[error("token expiry {expires_at} must be after creation time {created_at}")]
    InvalidExpiry {
        /// The requested expiry
        expires_at: UnixTime,
        /// The creation time
        created_at: UnixTime,
    },
    /// The extension map rejected the supplied fields
    #[error("invalid extra fields")]
    Extra(#[from] ExtraFieldError),
}

impl StoreError {
    fn from_backend(err: BackendError) -> Self {
        match err {
            BackendError::Rejected(inner) => match inner.downcast::<StoreError>() {
                Ok(err) => *err,
                Err(other) => Self::Backend(BackendError::Rejected(other)),
            },
            other => Self::Backend(other),
        }
    }
}

#[derive(Clone, Copy)]
enum Field {
    Access,
    Refresh,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Access => "access",
            Self::Refresh => "refresh",
        })
    }
}

/// CRUD over token records, with credentials sealed at rest
///
/// Every mutation goes through a single atomic backend edit, so a
/// background refresh and a consumer action on the same record never
/// interleave partially. Records handed out are decrypted snapshots.
pub struct TokenStore<C = System> {
    backend: Arc<dyn RecordBackend>,
    cipher: Arc<TokenCipher>,
    clock: C,
    sessions: ExtendedSessionPolicy,
}

impl<C> fmt::Debug for TokenStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenStore")
            .field("cipher", &self.cipher)
            .finish_non_exhaustive()
    }
}

impl TokenStore {
    /// Constructs a new token store using the system clock
    pub fn new(backend: Arc<dyn RecordBackend>, cipher: Arc<TokenCipher>) -> Self {
        Self::with_clock(backend, cipher, System)
    }
}

impl<C> TokenStore<C>
where
    C: Clock,
{
    /// Constructs a new token store using the given clock
    pub fn with_clock(backend: Arc<dyn RecordBackend>, cipher: Arc<TokenCipher>, clock: C) -> Self {
        Self {
            backend,
            cipher,
            clock,
            sessions: ExtendedSessionPolicy,
        }
    }

    /// The clock used to stamp records
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The current time as seen by this store
    pub fn now(&self) -> UnixTime {
        self.clock.now()
    }

    fn context(key: &RecordKey, field: Field) -> String {
        let subject = key.subject_id.as_str();
        let provider = key.provider.as_str();
        format!(
            "{}:{}:{}:{}:{}",
            subject.len(),
            subject,
            provider.len(),
            provider,
            field
        )
    }

    fn seal(&self, key: &RecordKey, field: Field, value: &str) -> Result<SealedSecret, CryptoError> {
        self.cipher.seal(value, &Self::context(key, field))
    }

    fn open(&self, stored: StoredRecord) -> Result<TokenRecord, StoreError> {
        let access_token = self
            .cipher
            .open(&stored.access_token, &Self::context(&stored.key, Field::Access))?;
        let refresh_token = stored
            .refresh_token
            .as_ref()
            .map(|sealed| {
                self.cipher
                    .open(sealed, &Self::context(&stored.key, Field::Refresh))
            })
            .transpose()?;

        Ok(TokenRecord {
            key: stored.key,
            access_token: AccessToken::new(access_token),
            refresh_token: refresh_token.map(RefreshToken::new),
            token_type: stored.token_type,
            expires_at: stored.expires_at,
            created_at: stored.created_at,
            last_used_at: stored.last_used_at,
            last_refreshed_at: stored.last_refreshed_at,
            scope: stored.scope,
            session: stored.session,
            is_active: stored.is_active,
            extra: stored.extra,
        })
    }

    fn open_optional(&self, stored: Option<StoredRecord>) -> Result<Option<TokenRecord>, StoreError> {
        stored.map(|s| self.open(s)).transpose()
    }

    fn open_all(&self, stored: Vec<StoredRecord>) -> Vec<TokenRecord> {
        stored
            .into_iter()
            .filter_map(|s| {
                let subject = s.key.subject_id.clone();
                let provider = s.key.provider.clone();
                match self.open(s) {
                    Ok(record) => Some(record),
                    Err(error) => {
                        tracing::error!(
                            subject = %subject,
                            provider = %provider,
                            error = (&error as &dyn error::Error),
                            "skipping token record that could not be opened"
                        );
                        None
                    }
                }
            })
            .collect()
    }

    /// Loads a record
    pub async fn get(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
    ) -> Result<Option<TokenRecord>, StoreError> {
        let key = RecordKey::new(subject_id, provider);
        let stored = self.backend.fetch(&key).await?;
        self.open_optional(stored)
    }

    /// Creates or partially updates a record
    ///
    /// When the record exists, only the fields present in `fields` are
    /// applied and `last_refreshed_at` is stamped. Supplying a new access
    /// token reactivates a record that had been marked inactive. When the
    /// record does not exist, `fields` must carry an access token and an
    /// expiry later than now.
    pub async fn store(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, StoreError> {
        let now = self.clock.now();
        let key = RecordKey::new(subject_id, provider);

        let access = fields
            .access_token
            .as_deref()
            .map(|t| self.seal(&key, Field::Access, t.as_str()))
            .transpose()?;
        let refresh = fields
            .refresh_token
            .as_deref()
            .map(|t| self.seal(&key, Field::Refresh, t.as_str()))
            .transpose()?;
        let expires_at = fields.resolve_expires_at(now);
        let sessions = self.sessions;
        let record_key = key.clone();

        let stored = self
            .backend
            .modify(
                &key,
                Box::new(move |current| {
                    let next = match current {
                        Some(existing) => {
                            let mut next = existing.clone();
                            if let Some(access) = access {
                                next.access_token = access;
                                next.is_active = true;
                            }
                            if let Some(refresh) = refresh {
                                next.refresh_token = Some(refresh);
                            }
                            if let Some(token_type) = fields.token_type {
                                next.token_type = token_type;
                            }
                            if let Some(expires_at) = expires_at {
                                next.expires_at = expires_at;
                                sessions.track_refresh(&mut next.session, expires_at);
                            }
                            if let Some(scope) = fields.scope {
                                next.scope = Some(scope);
                            }
                            next.extra.merge(&fields.extra).map_err(StoreError::from)?;
                            next.last_refreshed_at = Some(now);
                            next
                        }
                        None => {
                            let access_token =
                                access.ok_or(StoreError::IncompleteRecord("access_token"))?;
                            let expires_at =
                                expires_at.ok_or(StoreError::IncompleteRecord("expires_at"))?;
                            if expires_at <= now {
                                return Err(StoreError::InvalidExpiry {
                                    expires_at,
                                    created_at: now,
                                }
                                .into());
                            }

                            let mut extra = ExtraFields::new();
                            extra.merge(&fields.extra).map_err(StoreError::from)?;

                            StoredRecord {
                                key: record_key,
                                access_token,
                                refresh_token: refresh,
                                token_type: fields
                                    .token_type
                                    .unwrap_or_else(|| DEFAULT_TOKEN_TYPE.to_owned()),
                                expires_at,
                                created_at: now,
                                last_used_at: None,
                                last_refreshed_at: None,
                                scope: fields.scope,
                                session: ExtendedSession::default(),
                                is_active: true,
                                extra,
                            }
                        }
                    };
                    Ok(Some(next))
                }),
            )
            .await
            .map_err(StoreError::from_backend)?;

        match stored.current() {
            Some(stored) => self.open(stored),
            None => Err(StoreError::IncompleteRecord("access_token")),
        }
    }

    /// Removes a record outright, reporting whether one existed
    pub async fn delete(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
    ) -> Result<bool, StoreError> {
        let key = RecordKey::new(subject_id, provider);
        Ok(self.backend.remove(&key).await?)
    }

    /// Lists every active record issued by `provider`
    pub async fn list_active(&self, provider: &ProviderIdRef) -> Result<Vec<TokenRecord>, StoreError> {
        let mut stored = self.backend.scan().await?;
        stored.retain(|s| s.is_active && s.key.provider.as_str() == provider.as_str());
        Ok(self.open_all(stored))
    }

    /// Lists every active, refreshable record whose effective expiry is
    /// within `threshold` of now, most urgent first
    ///
    /// Records without a refresh token are never returned; they can only be
    /// renewed by a fresh authorization.
    pub async fn list_needing_refresh(
        &self,
        threshold: DurationSecs,
    ) -> Result<Vec<TokenRecord>, StoreError> {
        let now = self.clock.now();
        let mut stored = self.backend.scan().await?;
        stored.retain(|s| s.is_due_for_refresh(now, threshold));
        stored.sort_by_key(StoredRecord::effective_expires_at);
        Ok(self.open_all(stored))
    }

    /// Soft-deletes a record, reporting whether one existed
    pub async fn mark_inactive(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
    ) -> Result<bool, StoreError> {
        let key = RecordKey::new(subject_id, provider);
        let stored = self
            .backend
            .modify(
                &key,
                Box::new(|current| {
                    Ok(current.filter(|c| c.is_active).map(|c| StoredRecord {
                        is_active: false,
                        ..c.clone()
                    }))
                }),
            )
            .await
            .map_err(StoreError::from_backend)?;
        Ok(stored.current().is_some())
    }

    /// Extends the record's session to `days` from now
    ///
    /// Returns the record as it stands afterwards, or `None` if there is no
    /// such record.
    pub async fn enable_extended_session(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
        days: u32,
    ) -> Result<Option<TokenRecord>, StoreError> {
        self.apply_session_command(subject_id, provider, SessionCommand::Enable { days })
            .await
    }

    /// Withdraws any session extension, restoring the original expiry
    ///
    /// Returns the record as it stands afterwards, or `None` if there is no
    /// such record.
    pub async fn disable_extended_session(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
    ) -> Result<Option<TokenRecord>, StoreError> {
        self.apply_session_command(subject_id, provider, SessionCommand::Disable)
            .await
    }

    async fn apply_session_command(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
        command: SessionCommand,
    ) -> Result<Option<TokenRecord>, StoreError> {
        let now = self.clock.now();
        let key = RecordKey::new(subject_id, provider);
        let sessions = self.sessions;

        let stored = self
            .backend
            .modify(
                &key,
                Box::new(move |current| {
                    let Some(current) = current else {
                        return Ok(None);
                    };

                    match sessions.evaluate(current.expires_at, &current.session, command, now) {
                        SessionOutcome::Unchanged => Ok(None),
                        SessionOutcome::Updated {
                            expires_at,
                            session,
                        } => Ok(Some(StoredRecord {
                            expires_at,
                            session,
                            ..current.clone()
                        })),
                    }
                }),
            )
            .await
            .map_err(StoreError::from_backend)?;

        self.open_optional(stored.current())
    }

    /// Applies the result of a refresh exchange to an existing record
    ///
    /// `exchanged` is the refresh token that was traded for `fields`. If the
    /// stored refresh token is no longer that one, another writer got there
    /// first and the result is stale. A record that has since been deleted is
    /// not recreated, and one that has been marked inactive is not
    /// reactivated.
    ///
    /// Returns the updated record, or `None` if the result was discarded.
    pub async fn apply_refresh(
        &self,
        key: &RecordKey,
        exchanged: &RefreshTokenRef,
        fields: TokenFields,
    ) -> Result<Option<TokenRecord>, StoreError> {
        let now = self.clock.now();
        let expires_at = fields
            .resolve_expires_at(now)
            .ok_or(StoreError::IncompleteRecord("expires_at"))?;
        let access = fields
            .access_token
            .as_deref()
            .map(|t| self.seal(key, Field::Access, t.as_str()))
            .transpose()?
            .ok_or(StoreError::IncompleteRecord("access_token"))?;
        let refresh = fields
            .refresh_token
            .as_deref()
            .map(|t| self.seal(key, Field::Refresh, t.as_str()))
            .transpose()?;
        let sessions = self.sessions;
        let cipher = Arc::clone(&self.cipher);
        let refresh_context = Self::context(key, Field::Refresh);
        let exchanged = exchanged.to_owned();

        let stored = self
            .backend
            .modify(
                key,
                Box::new(move |current| {
                    let Some(current) = current else {
                        return Ok(None);
                    };
                    if !current.is_active {
                        return Ok(None);
                    }
                    let still_current = match &current.refresh_token {
                        Some(sealed) => {
                            cipher.open(sealed, &refresh_context).map_err(StoreError::from)?
                                == exchanged.as_str()
                        }
                        None => false,
                    };
                    if !still_current {
                        tracing::debug!(
                            subject = %current.key.subject_id,
                            provider = %current.key.provider,
                            "discarding stale refresh result"
                        );
                        return Ok(None);
                    }

                    let mut next = current.clone();
                    next.access_token = access;
                    if let Some(refresh) = refresh {
                        next.refresh_token = Some(refresh);
                    }
                    if let Some(token_type) = fields.token_type {
                        next.token_type = token_type;
                    }
                    if let Some(scope) = fields.scope {
                        next.scope = Some(scope);
                    }
                    next.extra.merge(&fields.extra).map_err(StoreError::from)?;
                    next.expires_at = expires_at;
                    sessions.track_refresh(&mut next.session, expires_at);
                    next.last_refreshed_at = Some(now);
                    Ok(Some(next))
                }),
            )
            .await
            .map_err(StoreError::from_backend)?;

        self.open_optional(stored.written())
    }

    /// Stamps `last_used_at` on an active record
    ///
    /// Returns the stamped record, or `None` if there is no active record.
    pub async fn touch(
        &self,
        subject_id: &SubjectIdRef,
        provider: &ProviderIdRef,
    ) -> Result<Option<TokenRecord>, StoreError> {
        let now = self.clock.now();
        let key = RecordKey::new(subject_id, provider);
        let stored = self
            .backend
            .modify(
                &key,
                Box::new(move |current| {
                    Ok(current.filter(|c| c.is_active).map(|c| StoredRecord {
                        last_used_at: Some(now),
                        ..c.clone()
                    }))
                }),
            )
            .await
            .map_err(StoreError::from_backend)?;
        self.open_optional(stored.written())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backends::MemoryBackend, ProviderId, SubjectId};
    use tokenward_clock::TestClock;

    const NOW: UnixTime = UnixTime(1_700_000_000);

    fn store() -> (TokenStore<TestClock>, TestClock) {
        let clock = TestClock::new(NOW);
        let cipher = TokenCipher::from_key_bytes(&[9u8; 32]).unwrap();
        let store = TokenStore::with_clock(
            Arc::new(MemoryBackend::new()),
            Arc::new(cipher),
            clock.clone(),
        );
        (store, clock)
    }

    fn alice() -> SubjectId {
        SubjectId::from_static("alice")
    }

    fn default_provider() -> ProviderId {
        ProviderId::default()
    }

    fn fields(access: &'static str, refresh: Option<&'static str>, lifetime: u64) -> TokenFields {
        let fields = TokenFields::new(AccessToken::from_static(access))
            .with_expires_in(DurationSecs(lifetime));
        match refresh {
            Some(r) => fields.with_refresh_token(RefreshToken::from_static(r)),
            None => fields,
        }
    }

    #[tokio::test]
    async fn create_stamps_and_defaults() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 3_600))
            .await
            .unwrap();

        assert_eq!(record.created_at, NOW);
        assert_eq!(record.expires_at, NOW + DurationSecs(3_600));
        assert_eq!(record.token_type, "Bearer");
        assert!(record.is_active);
        assert!(!record.session.is_extended_session);
        assert_eq!(record.last_refreshed_at, None);
        assert_eq!(record.access_token.as_str(), "at-1");
    }

    #[tokio::test]
    async fn create_requires_access_token_and_future_expiry() {
        let (store, _) = store();
        let no_access = TokenFields::default().with_expires_in(DurationSecs(60));
        assert!(matches!(
            store.store(&alice(), &default_provider(), no_access).await,
            Err(StoreError::IncompleteRecord("access_token"))
        ));

        let no_expiry = TokenFields::new(AccessToken::from_static("at"));
        assert!(matches!(
            store.store(&alice(), &default_provider(), no_expiry).await,
            Err(StoreError::IncompleteRecord("expires_at"))
        ));

        let expired = TokenFields::new(AccessToken::from_static("at")).with_expires_at(NOW);
        assert!(matches!(
            store.store(&alice(), &default_provider(), expired).await,
            Err(StoreError::InvalidExpiry { .. })
        ));

        assert!(store.get(&alice(), &default_provider()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn partial_update_keeps_absent_fields() {
        let (store, clock) = store();
        store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 3_600))
            .await
            .unwrap();

        clock.inc(10);
        let updated = store
            .store(
                &alice(),
                &default_provider(),
                TokenFields::default().with_scope("read write"),
            )
            .await
            .unwrap();

        assert_eq!(updated.access_token.as_str(), "at-1");
        assert_eq!(updated.refresh_token.as_deref().map(|r| r.as_str()), Some("rt-1"));
        assert_eq!(updated.scope.as_deref(), Some("read write"));
        assert_eq!(updated.created_at, NOW);
        assert_eq!(updated.last_refreshed_at, Some(NOW + DurationSecs(10)));
    }

    #[tokio::test]
    async fn needing_refresh_requires_refresh_token() {
        let (store, _) = store();
        let bob = SubjectId::from_static("bob");
        store
            .store(&alice(), &default_provider(), fields("at-a", None, 10))
            .await
            .unwrap();
        store
            .store(&bob, &default_provider(), fields("at-b", Some("rt-b"), 10))
            .await
            .unwrap();

        let due = store.list_needing_refresh(DurationSecs(600)).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].subject_id(), &*bob);
    }

    #[tokio::test]
    async fn inactive_records_are_not_listed() {
        let (store, _) = store();
        store
            .store(&alice(), &default_provider(), fields("at", Some("rt"), 10))
            .await
            .unwrap();

        assert!(store.mark_inactive(&alice(), &default_provider()).await.unwrap());
        assert!(store
            .list_needing_refresh(DurationSecs(600))
            .await
            .unwrap()
            .is_empty());
        assert!(store.list_active(&default_provider()).await.unwrap().is_empty());
        assert!(!store
            .mark_inactive(&SubjectId::from_static("nobody"), &default_provider())
            .await
            .unwrap());
    }

    fn rt(value: &'static str) -> RefreshToken {
        RefreshToken::from_static(value)
    }

    #[tokio::test]
    async fn refresh_from_superseded_token_is_discarded() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 3_600))
            .await
            .unwrap();

        let stale = TokenFields::new(AccessToken::from_static("at-old"))
            .with_refresh_token(rt("rt-old-rotated"))
            .with_expires_at(NOW + DurationSecs(7_200));
        assert!(store
            .apply_refresh(&record.key, &rt("rt-0"), stale)
            .await
            .unwrap()
            .is_none());

        let unchanged = store.get(&alice(), &default_provider()).await.unwrap().unwrap();
        assert_eq!(unchanged.access_token.as_str(), "at-1");
        assert_eq!(unchanged.refresh_token.as_deref().map(|r| r.as_str()), Some("rt-1"));
        assert_eq!(unchanged.last_refreshed_at, None);
    }

    #[tokio::test]
    async fn shorter_lifetime_refresh_is_applied() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 86_400))
            .await
            .unwrap();

        let shorter = TokenFields::new(AccessToken::from_static("at-2"))
            .with_refresh_token(rt("rt-2"))
            .with_expires_in(DurationSecs(3_600));
        let after = store
            .apply_refresh(&record.key, &rt("rt-1"), shorter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.access_token.as_str(), "at-2");
        assert_eq!(after.refresh_token.as_deref().map(|r| r.as_str()), Some("rt-2"));
        assert_eq!(after.expires_at, NOW + DurationSecs(3_600));
        assert_eq!(after.last_refreshed_at, Some(NOW));

        let kept = TokenFields::new(AccessToken::from_static("at-3"))
            .with_expires_in(DurationSecs(7_200));
        let after = store
            .apply_refresh(&record.key, &rt("rt-2"), kept)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.access_token.as_str(), "at-3");
        assert_eq!(after.refresh_token.as_deref().map(|r| r.as_str()), Some("rt-2"));
    }

    #[tokio::test]
    async fn refresh_does_not_reactivate_inactive_record() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 60))
            .await
            .unwrap();
        assert!(store.mark_inactive(&alice(), &default_provider()).await.unwrap());

        let fresh = TokenFields::new(AccessToken::from_static("at-2"))
            .with_expires_in(DurationSecs(3_600));
        assert!(store
            .apply_refresh(&record.key, &rt("rt-1"), fresh)
            .await
            .unwrap()
            .is_none());

        let stored = store.get(&alice(), &default_provider()).await.unwrap().unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.access_token.as_str(), "at-1");
    }

    #[tokio::test]
    async fn refresh_does_not_resurrect_deleted_record() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 60))
            .await
            .unwrap();
        assert!(store.delete(&alice(), &default_provider()).await.unwrap());

        let fresh = TokenFields::new(AccessToken::from_static("at-2"))
            .with_expires_in(DurationSecs(3_600));
        assert!(store
            .apply_refresh(&record.key, &rt("rt-1"), fresh)
            .await
            .unwrap()
            .is_none());
        assert!(store.get(&alice(), &default_provider()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extended_session_round_trip_restores_newest_expiry() {
        let (store, _) = store();
        let record = store
            .store(&alice(), &default_provider(), fields("at-1", Some("rt-1"), 60))
            .await
            .unwrap();

        let extended = store
            .enable_extended_session(&alice(), &default_provider(), 30)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            extended.effective_expires_at(),
            NOW + DurationSecs::from_days(30)
        );

        let refreshed_expiry = NOW + DurationSecs(7_200);
        store
            .apply_refresh(
                &record.key,
                &rt("rt-1"),
                TokenFields::new(AccessToken::from_static("at-2")).with_expires_at(refreshed_expiry),
            )
            .await
            .unwrap()
            .unwrap();

        let disabled = store
            .disable_extended_session(&alice(), &default_provider())
            .await
            .unwrap()
            .unwrap();
        assert!(!disabled.session.is_extended_session);
        assert_eq!(disabled.effective_expires_at(), refreshed_expiry);
    }

    #[tokio::test]
    async fn extended_session_on_missing_record_is_none() {
        let (store, _) = store();
        assert!(store
            .enable_extended_session(&alice(), &default_provider(), 30)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn touch_stamps_last_used() {
        let (store, clock) = store();
        store
            .store(&alice(), &default_provider(), fields("at", Some("rt"), 3_600))
            .await
            .unwrap();
        clock.inc(5);
        let touched = store.touch(&alice(), &default_provider()).await.unwrap().unwrap();
        assert_eq!(touched.last_used_at, Some(NOW + DurationSecs(5)));
    }

    #[tokio::test]
    async fn touch_skips_inactive_and_missing_records() {
        let (store, clock) = store();
        store
            .store(&alice(), &default_provider(), fields("at", Some("rt"), 3_600))
            .await
            .unwrap();
        assert!(store.mark_inactive(&alice(), &default_provider()).await.unwrap());

        clock.inc(5);
        assert!(store.touch(&alice(), &default_provider()).await.unwrap().is_none());
        assert_eq!(
            store
                .get(&alice(), &default_provider())
                .await
                .unwrap()
                .unwrap()
                .last_used_at,
            None
        );
        assert!(store
            .touch(&SubjectId::from_static("nobody"), &default_provider())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn oversized_extras_are_rejected_without_writing() {
        let (store, _) = store();
        store
            .store(&alice(), &default_provider(), fields("at", Some("rt"), 3_600))
            .await
            .unwrap();

        let mut first = ExtraFields::new();
        for i in 0..16 {
            first.insert(format!("a{i}"), "v").unwrap();
        }
        store
            .store(
                &alice(),
                &default_provider(),
                TokenFields::default().with_extra(first),
            )
            .await
            .unwrap();

        let mut second = ExtraFields::new();
        second.insert("overflow", "v").unwrap();
        assert!(matches!(
            store
                .store(
                    &alice(),
                    &default_provider(),
                    TokenFields::default().with_extra(second)
                )
                .await,
            Err(StoreError::Extra(ExtraFieldError::TooManyEntries))
        ));
    }
}
