//! The consumer-facing token service

use std::sync::Arc;

use thiserror::Error;
use tokenward_clock::{Clock, System};

use crate::{
    events::{Event, EventBus, EventHandler, EventKind},
    record::{RecordKey, TokenFields, TokenRecord},
    refresh::{RefreshError, TokenRefresher},
    scheduler::{RefreshOutcome, RefreshScheduler, ScheduleMode},
    stats::StatsSnapshot,
    store::{StoreError, TokenStore},
    ProviderIdRef, SubjectIdRef,
};

/// An error surfaced to consumers of the token service
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No active token exists; the user must re-authorize
    #[error("not authenticated")]
    NotAuthenticated,
    /// The token store failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Refreshing the token failed
    #[error(transparent)]
    Refresh(#[from] RefreshError),
}

/// Storage, background refresh and lifecycle events for bearer tokens
///
/// Consumers fetch tokens with [`get_token`](Self::get_token) and never need
/// to know when they were last refreshed. Clones share the same store,
/// background loop and event history.
#[derive(Debug)]
pub struct TokenService<C = System> {
    scheduler: RefreshScheduler<C>,
}

impl<C> Clone for TokenService<C> {
    fn clone(&self) -> Self {
        Self {
            scheduler: self.scheduler.clone(),
        }
    }
}

impl<C> TokenService<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Constructs a service around a configured scheduler
    pub fn new(scheduler: RefreshScheduler<C>) -> Self {
        Self { scheduler }
    }

    /// Constructs a service with default scheduler settings
    pub fn with_defaults(store: Arc<TokenStore<C>>, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self::new(RefreshScheduler::builder(store, refresher).build())
    }

    /// The background scheduler
    pub fn scheduler(&self) -> &RefreshScheduler<C> {
        &self.scheduler
    }

    /// The underlying token store
    pub fn store(&self) -> &Arc<TokenStore<C>> {
        self.scheduler.store()
    }

    fn provider(&self) -> &ProviderIdRef {
        &self.scheduler.settings().provider
    }

    /// The subject tracked in single-identity mode
    pub fn single_subject(&self) -> Option<&SubjectIdRef> {
        match &self.scheduler.settings().mode {
            ScheduleMode::SingleIdentity(subject) => Some(subject),
            ScheduleMode::MultiIdentity => None,
        }
    }

    /// Fetches the current token for `subject_id`
    ///
    /// Returns [`ServiceError::NotAuthenticated`] if there is no token or it
    /// has been deactivated. Stamps the record as used.
    pub async fn get_token(&self, subject_id: &SubjectIdRef) -> Result<TokenRecord, ServiceError> {
        match self.store().touch(subject_id, self.provider()).await? {
            Some(record) => Ok(record),
            None => Err(ServiceError::NotAuthenticated),
        }
    }

    /// Refreshes the token for `subject_id` now, regardless of its expiry
    ///
    /// Serializes with any background refresh of the same record.
    #[tracing::instrument(skip(self, subject_id), fields(subject = %subject_id))]
    pub async fn force_refresh(&self, subject_id: &SubjectIdRef) -> Result<TokenRecord, ServiceError> {
        let key = RecordKey::new(subject_id, self.provider());
        match self.scheduler.refresh_record(&key, true).await? {
            RefreshOutcome::Refreshed(record)
            | RefreshOutcome::NotDue(record)
            | RefreshOutcome::Superseded(record) => Ok(record),
        }
    }

    /// Saves tokens obtained by an authorization flow
    ///
    /// Creates the record if needed, otherwise updates the given fields.
    pub async fn save_token(
        &self,
        subject_id: &SubjectIdRef,
        fields: TokenFields,
    ) -> Result<TokenRecord, ServiceError> {
        let record = self.store().store(subject_id, self.provider(), fields).await?;
        tracing::info!(subject = %subject_id, expires_at = %record.expires_at, "token saved");
        self.scheduler
            .events()
            .publish(EventKind::Info, "token saved", Some(subject_id), None);
        Ok(record)
    }

    /// Deletes the token for `subject_id`
    ///
    /// Returns whether a token existed.
    pub async fn logout(&self, subject_id: &SubjectIdRef) -> Result<bool, ServiceError> {
        let existed = self.store().delete(subject_id, self.provider()).await?;
        if existed {
            tracing::info!(subject = %subject_id, "token deleted");
            self.scheduler
                .events()
                .publish(EventKind::Info, "logged out", Some(subject_id), None);
        }
        Ok(existed)
    }

    /// Extends the effective lifetime of the token for `subject_id` by `days`
    pub async fn enable_extended_session(
        &self,
        subject_id: &SubjectIdRef,
        days: u32,
    ) -> Result<TokenRecord, ServiceError> {
        let record = self
            .store()
            .enable_extended_session(subject_id, self.provider(), days)
            .await?
            .ok_or(ServiceError::NotAuthenticated)?;

        tracing::info!(
            subject = %subject_id,
            days,
            effective_expires_at = %record.effective_expires_at(),
            "extended session enabled"
        );
        self.scheduler.events().publish(
            EventKind::Info,
            format!("extended session enabled for {days} days"),
            Some(subject_id),
            None,
        );
        Ok(record)
    }

    /// Restores the provider-issued expiry of the token for `subject_id`
    pub async fn disable_extended_session(&self, subject_id: &SubjectIdRef) -> Result<TokenRecord, ServiceError> {
        let record = self
            .store()
            .disable_extended_session(subject_id, self.provider())
            .await?
            .ok_or(ServiceError::NotAuthenticated)?;

        tracing::info!(subject = %subject_id, "extended session disabled");
        self.scheduler.events().publish(
            EventKind::Info,
            "extended session disabled",
            Some(subject_id),
            None,
        );
        Ok(record)
    }

    /// A snapshot of refresh activity
    pub fn stats(&self) -> StatsSnapshot {
        self.scheduler.stats()
    }

    /// The most recent events, oldest first
    pub fn events(&self, limit: Option<usize>) -> Vec<Event> {
        self.scheduler.events().events(limit)
    }

    /// The event bus, for subscribing handlers
    pub fn event_bus(&self) -> &EventBus {
        self.scheduler.events()
    }

    /// Registers a handler for subsequently published events
    pub fn subscribe(&self, handler: impl EventHandler + 'static) {
        self.scheduler.events().subscribe(handler);
    }

    /// Starts background refresh; see [`RefreshScheduler::start`]
    pub fn start(&self) -> bool {
        self.scheduler.start()
    }

    /// Stops background refresh; see [`RefreshScheduler::stop`]
    pub async fn stop(&self) -> bool {
        self.scheduler.stop().await
    }

    /// Whether background refresh is running
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }
}

#[cfg(feature = "oauth2")]
mod from_config {
    use std::{sync::Arc, time::Duration};

    use super::TokenService;
    use crate::{
        backends::{MemoryBackend, RecordBackend},
        backoff::{ErrorBackoffConfig, RetryPolicy},
        config::{Config, ConfigError},
        crypto::TokenCipher,
        events::EventBus,
        refresh::{
            oauth2::{build_client, dto::ClientCredentials, HttpRefreshExecutor},
            TokenRefresher,
        },
        scheduler::RefreshScheduler,
        store::TokenStore,
    };

    impl TokenService {
        /// Constructs a service backed by an OAuth2 token endpoint
        ///
        /// Fails fast on any configuration problem. The background loop is
        /// not started.
        pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
            config.validate()?;

            let cipher = match &config.encryption_key {
                Some(key) => TokenCipher::from_base64_key(key)?,
                None => TokenCipher::ephemeral()?,
            };

            let backend: Arc<dyn RecordBackend> = match &config.store_path {
                #[cfg(feature = "file")]
                Some(path) => Arc::new(crate::backends::FileBackend::new(path.clone())),
                #[cfg(not(feature = "file"))]
                Some(_) => return Err(ConfigError::FileBackendUnavailable),
                None => Arc::new(MemoryBackend::new()),
            };

            let store = Arc::new(TokenStore::new(backend, Arc::new(cipher)));

            let client = build_client(Duration::from(config.request_timeout))?;
            let retry = RetryPolicy::new(config.max_retries, ErrorBackoffConfig::default());
            let executor = HttpRefreshExecutor::new(
                client,
                config.token_url()?,
                ClientCredentials::new(config.client_id.clone(), config.client_secret.clone()),
                retry,
            );
            let refresher: Arc<dyn TokenRefresher> = if config.json_body {
                Arc::new(executor.using_json_body())
            } else {
                Arc::new(executor)
            };

            let builder = RefreshScheduler::builder(store, refresher)
                .settings(config.scheduler_settings())
                .events(EventBus::new(config.event_history()));

            #[cfg(feature = "rand")]
            let builder = if config.max_jitter > tokenward_clock::DurationSecs::ZERO {
                builder.jitter(crate::jitter::RandomEarlyJitter::new(Duration::from(
                    config.max_jitter,
                )))
            } else {
                builder
            };

            tracing::debug!(?config, "token service configured");
            Ok(Self::new(builder.build()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokenward_clock::{DurationSecs, TestClock, UnixTime};

    use super::*;
    use crate::{
        backends::MemoryBackend, crypto::TokenCipher, guard::SingletonGuard,
        scheduler::SchedulerSettings, AccessToken, RefreshToken, RefreshTokenRef, SubjectId,
    };

    const NOW: UnixTime = UnixTime(1_700_000_000);

    struct CountingRefresher {
        clock: TestClock,
        calls: AtomicU32,
        reject: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, _: &RefreshTokenRef) -> Result<TokenFields, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(RefreshError::InvalidGrant {
                    status: 401,
                    body: String::new(),
                });
            }
            Ok(TokenFields::new(AccessToken::from_static("forced-access-token"))
                .with_expires_at(self.clock.now() + DurationSecs(7_200)))
        }
    }

    fn service(reject: bool) -> (TokenService<TestClock>, Arc<CountingRefresher>, TestClock) {
        let clock = TestClock::new(NOW);
        let cipher = TokenCipher::from_key_bytes(&[9u8; 32]).unwrap();
        let store = Arc::new(TokenStore::with_clock(
            Arc::new(MemoryBackend::new()),
            Arc::new(cipher),
            clock.clone(),
        ));
        let refresher = Arc::new(CountingRefresher {
            clock: clock.clone(),
            calls: AtomicU32::new(0),
            reject,
        });
        let scheduler = RefreshScheduler::builder(store, refresher.clone())
            .events(EventBus::with_clock(20, clock.clone()))
            .settings(SchedulerSettings {
                mode: ScheduleMode::single(),
                ..SchedulerSettings::default()
            })
            .guard(SingletonGuard::isolated())
            .build();
        (TokenService::new(scheduler), refresher, clock)
    }

    fn initial_fields() -> TokenFields {
        TokenFields::new(AccessToken::from_static("initial-access-token"))
            .with_refresh_token(RefreshToken::from_static("initial-refresh-token"))
            .with_expires_in(DurationSecs(3_600))
    }

    #[tokio::test]
    async fn saved_tokens_are_returned_and_stamped() {
        let (service, _, clock) = service(false);
        let subject = service.single_subject().unwrap().to_owned();

        assert!(matches!(
            service.get_token(&subject).await,
            Err(ServiceError::NotAuthenticated)
        ));

        service.save_token(&subject, initial_fields()).await.unwrap();
        clock.inc(30);

        let record = service.get_token(&subject).await.unwrap();
        assert_eq!(record.access_token.as_str(), "initial-access-token");
        assert_eq!(record.last_used_at, Some(NOW + DurationSecs(30)));
    }

    #[tokio::test]
    async fn force_refresh_runs_immediately() {
        let (service, refresher, _) = service(false);
        let subject = SubjectId::from_static("alice");
        service.save_token(&subject, initial_fields()).await.unwrap();

        let record = service.force_refresh(&subject).await.unwrap();

        assert_eq!(record.access_token.as_str(), "forced-access-token");
        assert_eq!(record.refresh_token.as_deref().map(|r| r.as_str()), Some("initial-refresh-token"));
        assert_eq!(record.expires_at, NOW + DurationSecs(7_200));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.stats().succeeded, 1);
    }

    #[tokio::test]
    async fn rejected_force_refresh_requires_reauthorization() {
        let (service, refresher, _) = service(true);
        let subject = SubjectId::from_static("alice");
        service.save_token(&subject, initial_fields()).await.unwrap();

        let error = service.force_refresh(&subject).await.unwrap_err();
        assert!(matches!(error, ServiceError::Refresh(RefreshError::InvalidGrant { status: 401, .. })));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            service.get_token(&subject).await,
            Err(ServiceError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn deactivated_token_is_not_returned() {
        let (service, _, clock) = service(false);
        let subject = SubjectId::from_static("alice");
        service.save_token(&subject, initial_fields()).await.unwrap();
        assert!(service
            .store()
            .mark_inactive(&subject, service.provider())
            .await
            .unwrap());

        clock.inc(30);
        assert!(matches!(
            service.get_token(&subject).await,
            Err(ServiceError::NotAuthenticated)
        ));
        let stored = service
            .store()
            .get(&subject, service.provider())
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.last_used_at, None);
    }

    #[tokio::test]
    async fn force_refresh_without_token_is_unauthenticated() {
        let (service, refresher, _) = service(false);
        assert!(matches!(
            service.force_refresh(&SubjectId::from_static("nobody")).await,
            Err(ServiceError::NotAuthenticated)
        ));
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn logout_deletes() {
        let (service, _, _) = service(false);
        let subject = SubjectId::from_static("alice");
        service.save_token(&subject, initial_fields()).await.unwrap();

        assert!(service.logout(&subject).await.unwrap());
        assert!(!service.logout(&subject).await.unwrap());
        assert!(matches!(
            service.get_token(&subject).await,
            Err(ServiceError::NotAuthenticated)
        ));
    }

    #[tokio::test]
    async fn extended_session_round_trip() {
        let (service, _, _) = service(false);
        let subject = SubjectId::from_static("alice");
        let saved = service.save_token(&subject, initial_fields()).await.unwrap();

        let extended = service.enable_extended_session(&subject, 30).await.unwrap();
        assert_eq!(extended.effective_expires_at(), NOW + DurationSecs::from_days(30));

        let restored = service.disable_extended_session(&subject).await.unwrap();
        assert_eq!(restored.effective_expires_at(), saved.expires_at);

        assert!(matches!(
            service
                .enable_extended_session(&SubjectId::from_static("nobody"), 30)
                .await,
            Err(ServiceError::NotAuthenticated)
        ));

        let messages: Vec<_> = service.events(None).into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"extended session enabled for 30 days".to_owned()));
        assert!(messages.contains(&"extended session disabled".to_owned()));
    }
}
