//! The background refresh loop
//!
//! A scheduler periodically looks for tokens whose effective expiry is
//! within the refresh threshold and exchanges their refresh tokens for new
//! ones. It runs in one of two modes:
//!
//! * **single identity**: one fixed subject is tracked. Because its exact
//!   expiry is known, the loop sleeps only until the token is about to enter
//!   its refresh window, bounded above by the check interval and below by a
//!   minimum sleep.
//! * **multi identity**: every stored record for the provider is scanned on
//!   each tick and due records are refreshed one at a time. The loop sleeps
//!   for the fixed check interval.
//!
//! Both modes share a single tick implementation. Only one loop runs per
//! [`SingletonGuard`]; a second `start` is declined with a warning.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError, Weak},
    time::Duration,
};

use tokenward_clock::{Clock, DurationSecs, System};
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    events::{EventBus, EventKind, MaskedTokens},
    guard::{GuardLease, SingletonGuard},
    jitter::{JitterSource, NullJitter},
    record::{RecordKey, TokenRecord},
    refresh::{RefreshError, TokenRefresher},
    service::ServiceError,
    stats::{RefreshStats, StatsSnapshot},
    store::{StoreError, TokenStore},
    ProviderId, SubjectId, SubjectIdRef,
};

/// Which identities a scheduler tracks
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Track one subject, with adaptive sleep
    SingleIdentity(SubjectId),
    /// Track every stored subject, with a fixed check interval
    MultiIdentity,
}

impl ScheduleMode {
    /// The single-identity mode using the conventional sentinel subject
    pub fn single() -> Self {
        Self::SingleIdentity(SubjectId::single_identity())
    }

    /// The default size of the event history for this mode
    pub fn default_event_history(&self) -> usize {
        match self {
            Self::SingleIdentity(_) => 100,
            Self::MultiIdentity => 500,
        }
    }
}

impl Default for ScheduleMode {
    fn default() -> Self {
        Self::MultiIdentity
    }
}

/// Timing and scope of a scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    /// Which identities to track
    pub mode: ScheduleMode,
    /// The provider whose records are refreshed
    pub provider: ProviderId,
    /// How long before the effective expiry a token becomes due
    pub refresh_threshold: DurationSecs,
    /// The longest the loop sleeps between ticks
    pub check_interval: DurationSecs,
    /// The shortest adaptive sleep in single-identity mode
    pub min_sleep: DurationSecs,
    /// How long `stop` waits for the loop to finish
    pub join_timeout: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            mode: ScheduleMode::default(),
            provider: ProviderId::default(),
            refresh_threshold: DurationSecs(600),
            check_interval: DurationSecs(300),
            min_sleep: DurationSecs(60),
            join_timeout: Duration::from_secs(10),
        }
    }
}

/// What happened to one record when a refresh was requested
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// New tokens were obtained and stored
    Refreshed(TokenRecord),
    /// The record was not yet due, typically because another caller refreshed it first
    NotDue(TokenRecord),
    /// The tokens were replaced while the exchange was in flight, so its
    /// result was discarded; holds the record as it now stands
    Superseded(TokenRecord),
}

/// A summary of one pass of the refresh loop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Refresh exchanges started
    pub attempted: usize,
    /// Records refreshed successfully
    pub refreshed: usize,
    /// Records marked inactive after their refresh token was rejected
    pub deactivated: usize,
    /// Records left untouched after transient failures
    pub deferred: usize,
    /// How long the loop will sleep before the next pass
    pub sleep: Duration,
}

struct RunningLoop {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    generation: u64,
}

struct SchedulerInner<C> {
    store: Arc<TokenStore<C>>,
    refresher: Arc<dyn TokenRefresher>,
    events: EventBus,
    stats: RefreshStats,
    settings: SchedulerSettings,
    guard: SingletonGuard,
    jitter: Box<dyn JitterSource>,
    locks: Mutex<HashMap<RecordKey, Arc<tokio::sync::Mutex<()>>>>,
    running: Mutex<Option<RunningLoop>>,
}

/// Keeps stored tokens fresh in the background
///
/// Clones share the same loop, counters and event history.
pub struct RefreshScheduler<C = System> {
    inner: Arc<SchedulerInner<C>>,
}

impl<C> Clone for RefreshScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for RefreshScheduler<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RefreshScheduler")
            .field("settings", &self.inner.settings)
            .field("guard", &self.inner.guard)
            .finish_non_exhaustive()
    }
}

/// Builds a [`RefreshScheduler`]
pub struct SchedulerBuilder<C = System> {
    store: Arc<TokenStore<C>>,
    refresher: Arc<dyn TokenRefresher>,
    events: Option<EventBus>,
    settings: SchedulerSettings,
    guard: Option<SingletonGuard>,
    jitter: Box<dyn JitterSource>,
}

impl<C> fmt::Debug for SchedulerBuilder<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl<C> SchedulerBuilder<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Sets the event bus; by default a new bus sized for the mode is used
    pub fn events(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Sets the scheduler's timing and scope
    pub fn settings(mut self, settings: SchedulerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the guard to compete for; by default the process-wide guard
    pub fn guard(mut self, guard: SingletonGuard) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Sets the jitter applied to each sleep; by default no jitter
    pub fn jitter(mut self, jitter: impl JitterSource + 'static) -> Self {
        self.jitter = Box::new(jitter);
        self
    }

    /// Builds the scheduler, which starts out stopped
    pub fn build(self) -> RefreshScheduler<C> {
        let events = self
            .events
            .unwrap_or_else(|| EventBus::new(self.settings.mode.default_event_history()));

        RefreshScheduler {
            inner: Arc::new(SchedulerInner {
                store: self.store,
                refresher: self.refresher,
                events,
                stats: RefreshStats::default(),
                settings: self.settings,
                guard: self.guard.unwrap_or_else(SingletonGuard::process),
                jitter: self.jitter,
                locks: Mutex::new(HashMap::new()),
                running: Mutex::new(None),
            }),
        }
    }
}

impl<C> RefreshScheduler<C>
where
    C: Clock + Send + Sync + 'static,
{
    /// Begins building a scheduler over `store` that refreshes through `refresher`
    pub fn builder(store: Arc<TokenStore<C>>, refresher: Arc<dyn TokenRefresher>) -> SchedulerBuilder<C> {
        SchedulerBuilder {
            store,
            refresher,
            events: None,
            settings: SchedulerSettings::default(),
            guard: None,
            jitter: Box::new(NullJitter),
        }
    }

    /// The scheduler's timing and scope
    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// The event bus this scheduler publishes to
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// The store this scheduler keeps fresh
    pub fn store(&self) -> &Arc<TokenStore<C>> {
        &self.inner.store
    }

    /// A snapshot of refresh activity
    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Starts the background loop
    ///
    /// Returns `false`, with a logged warning, if this scheduler is already
    /// running or another loop holds the guard. Must be called from within
    /// a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if running.as_ref().map_or(false, |r| !r.handle.is_finished()) {
            drop(running);
            tracing::warn!("refresh loop already running; ignoring start");
            self.inner.events.publish(
                EventKind::Warning,
                "background refresh already running",
                None,
                None,
            );
            return false;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::error!(
                    error = (&error as &dyn std::error::Error),
                    "cannot start refresh loop outside of a Tokio runtime"
                );
                return false;
            }
        };

        let Some(lease) = self.inner.guard.try_acquire() else {
            drop(running);
            tracing::warn!("another refresh loop is already running in this process; not starting");
            self.inner.events.publish(
                EventKind::Warning,
                "background refresh already running elsewhere in this process",
                None,
                None,
            );
            return false;
        };

        let generation = lease.generation();
        let (cancel, cancelled) = watch::channel(false);
        let handle = runtime.spawn(run_loop(Arc::downgrade(&self.inner), cancelled, lease));

        *running = Some(RunningLoop {
            cancel,
            handle,
            generation,
        });
        drop(running);

        tracing::info!(
            mode = ?self.inner.settings.mode,
            provider = %self.inner.settings.provider,
            check_interval = %self.inner.settings.check_interval,
            refresh_threshold = %self.inner.settings.refresh_threshold,
            "refresh loop started"
        );
        self.inner
            .events
            .publish(EventKind::Info, "background refresh started", None, None);
        true
    }

    /// Stops the background loop
    ///
    /// Signals cancellation and waits up to the join timeout for the loop to
    /// finish its current pass. The guard is released whether or not the loop
    /// finished in time. Returns whether a loop was running.
    pub async fn stop(&self) -> bool {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let Some(RunningLoop {
            cancel,
            handle,
            generation,
        }) = running
        else {
            tracing::debug!("refresh loop not running; nothing to stop");
            return false;
        };

        // the loop may already have exited, closing the channel
        let _ = cancel.send(true);

        let timeout = self.inner.settings.join_timeout;
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::error!(
                    panicked = error.is_panic(),
                    "refresh loop terminated abnormally"
                );
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = timeout.as_millis() as u64,
                    "refresh loop did not stop in time; releasing guard anyway"
                );
            }
        }

        self.inner.guard.release(generation);
        self.inner
            .events
            .publish(EventKind::Info, "background refresh stopped", None, None);
        true
    }

    /// Whether the background loop is running
    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(false, |r| !r.handle.is_finished())
    }

    /// Runs one pass of the refresh loop immediately
    pub async fn tick(&self) -> TickReport {
        self.inner.tick().await
    }

    /// Refreshes one record, serialized with any other refresh of the same record
    ///
    /// Unless `force` is set, the record is re-read under the lock and left
    /// alone if it is no longer due.
    pub async fn refresh_record(&self, key: &RecordKey, force: bool) -> Result<RefreshOutcome, ServiceError> {
        self.inner.refresh_record(key, force).await
    }
}

impl<C> SchedulerInner<C>
where
    C: Clock + Send + Sync + 'static,
{
    async fn tick(&self) -> TickReport {
        let mut report = TickReport::default();

        let sleep = match &self.settings.mode {
            ScheduleMode::SingleIdentity(subject) => self.tick_single(subject, &mut report).await,
            ScheduleMode::MultiIdentity => self.tick_multi(&mut report).await,
        };

        report.sleep = self.jitter.jitter(Duration::from(sleep));
        self.stats
            .schedule_next(Some(self.store.now() + DurationSecs::from(report.sleep)));

        tracing::debug!(
            attempted = report.attempted,
            refreshed = report.refreshed,
            deactivated = report.deactivated,
            deferred = report.deferred,
            sleep_ms = report.sleep.as_millis() as u64,
            "refresh pass complete"
        );
        report
    }

    async fn tick_single(&self, subject: &SubjectIdRef, report: &mut TickReport) -> DurationSecs {
        let settings = &self.settings;

        let record = match self.store.get(subject, &settings.provider).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                tracing::trace!(subject = %subject, "no token stored; nothing to refresh");
                return settings.check_interval;
            }
            Err(error) => {
                self.report_store_error(Some(subject), &error);
                return settings.check_interval;
            }
        };

        if !record.is_refreshable() {
            tracing::trace!(subject = %subject, "token cannot be refreshed in the background");
            return settings.check_interval;
        }

        let now = self.store.now();
        if record.needs_refresh_at(now, settings.refresh_threshold) {
            self.refresh_and_report(&record.key, report).await;
            return settings.check_interval;
        }

        let until_due = record.remaining_at(now) - settings.refresh_threshold;
        let floor = settings.min_sleep.min(settings.check_interval);
        let sleep = settings.check_interval.min(until_due).max(floor);
        tracing::trace!(
            subject = %subject,
            until_due = %until_due,
            sleep = %sleep,
            "token not yet due"
        );
        sleep
    }

    async fn tick_multi(&self, report: &mut TickReport) -> DurationSecs {
        let settings = &self.settings;

        let due = match self.store.list_needing_refresh(settings.refresh_threshold).await {
            Ok(due) => due,
            Err(error) => {
                self.report_store_error(None, &error);
                return settings.check_interval;
            }
        };

        let provider = settings.provider.as_str();
        let due: Vec<_> = due
            .into_iter()
            .filter(|r| r.provider().as_str() == provider)
            .collect();
        tracing::trace!(due = due.len(), "scanned for due tokens");

        for record in &due {
            self.refresh_and_report(&record.key, report).await;
        }

        settings.check_interval
    }

    async fn refresh_and_report(&self, key: &RecordKey, report: &mut TickReport) {
        let mut attempted = false;
        let outcome = self.refresh_locked(key, false, &mut attempted).await;
        if attempted {
            report.attempted += 1;
        }

        match outcome {
            Ok(RefreshOutcome::Refreshed(_)) => report.refreshed += 1,
            Ok(RefreshOutcome::NotDue(_) | RefreshOutcome::Superseded(_))
            | Err(ServiceError::NotAuthenticated) => {}
            // a record is only deactivated when the provider saw the exchange
            Err(ServiceError::Refresh(error)) if error.is_terminal() => {
                if attempted {
                    report.deactivated += 1;
                }
            }
            Err(_) => report.deferred += 1,
        }
    }

    fn lock_for(&self, key: &RecordKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if locks.len() > 256 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    async fn refresh_record(&self, key: &RecordKey, force: bool) -> Result<RefreshOutcome, ServiceError> {
        self.refresh_locked(key, force, &mut false).await
    }

    async fn refresh_locked(
        &self,
        key: &RecordKey,
        force: bool,
        attempted: &mut bool,
    ) -> Result<RefreshOutcome, ServiceError> {
        let lock = self.lock_for(key);
        let _held = lock.lock().await;

        let subject = &*key.subject_id;
        let record = match self.store.get(subject, &key.provider).await {
            Ok(Some(record)) if record.is_active => record,
            Ok(_) => return Err(ServiceError::NotAuthenticated),
            Err(error) => {
                self.report_store_error(Some(subject), &error);
                return Err(error.into());
            }
        };

        if !force && !record.needs_refresh_at(self.store.now(), self.settings.refresh_threshold) {
            tracing::debug!(subject = %subject, "token no longer due; skipping refresh");
            return Ok(RefreshOutcome::NotDue(record));
        }

        let Some(refresh_token) = record.refresh_token.as_deref() else {
            return Err(RefreshError::MissingRefreshToken.into());
        };

        self.stats.record_attempt();
        *attempted = true;
        tracing::debug!(subject = %subject, force, "refreshing token");

        match self.refresher.refresh(refresh_token).await {
            Ok(fields) => match self.store.apply_refresh(key, refresh_token, fields).await {
                Ok(Some(updated)) => {
                    self.stats.record_success(self.store.now());
                    tracing::info!(
                        subject = %subject,
                        expires_at = %updated.effective_expires_at(),
                        "token refreshed"
                    );
                    self.events.publish(
                        EventKind::Refresh,
                        "token refreshed",
                        Some(subject),
                        Some(MaskedTokens::new(
                            Some(&updated.access_token),
                            updated.refresh_token.as_deref(),
                        )),
                    );
                    Ok(RefreshOutcome::Refreshed(updated))
                }
                Ok(None) => self.settle_discarded(key).await,
                Err(error) => {
                    self.stats.record_failure();
                    self.report_store_error(Some(subject), &error);
                    Err(error.into())
                }
            },
            Err(error) if error.is_terminal() => {
                self.stats.record_failure();
                tracing::error!(
                    subject = %subject,
                    error = (&error as &dyn std::error::Error),
                    "refresh token rejected; re-authorization required"
                );
                if let Err(store_error) = self.store.mark_inactive(subject, &key.provider).await {
                    self.report_store_error(Some(subject), &store_error);
                }
                self.events.publish(
                    EventKind::Error,
                    format!("refresh token rejected; re-authorization required ({error})"),
                    Some(subject),
                    None,
                );
                Err(error.into())
            }
            Err(error) => {
                self.stats.record_failure();
                tracing::warn!(
                    subject = %subject,
                    error = (&error as &dyn std::error::Error),
                    "token refresh failed; will retry on the next pass"
                );
                self.events.publish(
                    EventKind::Warning,
                    format!("token refresh failed; will retry ({error})"),
                    Some(subject),
                    None,
                );
                Err(error.into())
            }
        }
    }

    async fn settle_discarded(&self, key: &RecordKey) -> Result<RefreshOutcome, ServiceError> {
        let subject = &*key.subject_id;
        match self.store.get(subject, &key.provider).await {
            Ok(Some(current)) if current.is_active => {
                tracing::info!(subject = %subject, "tokens replaced while refreshing; discarding result");
                Ok(RefreshOutcome::Superseded(current))
            }
            Ok(_) => {
                tracing::info!(
                    subject = %subject,
                    "token removed or deactivated while refreshing; discarding result"
                );
                Err(ServiceError::NotAuthenticated)
            }
            Err(error) => {
                self.report_store_error(Some(subject), &error);
                Err(error.into())
            }
        }
    }

    fn report_store_error(&self, subject: Option<&SubjectIdRef>, error: &StoreError) {
        tracing::error!(
            subject = subject.map(SubjectIdRef::as_str).unwrap_or_default(),
            error = (error as &dyn std::error::Error),
            "token store error"
        );
        self.events.publish(
            EventKind::Error,
            format!("token store error: {error}"),
            subject,
            None,
        );
    }
}

async fn run_loop<C>(
    inner: Weak<SchedulerInner<C>>,
    mut cancelled: watch::Receiver<bool>,
    lease: GuardLease,
) where
    C: Clock + Send + Sync + 'static,
{
    // held for the life of the loop; dropping it, even by unwinding, frees the guard
    let _lease = lease;

    loop {
        if *cancelled.borrow() {
            break;
        }

        let Some(this) = inner.upgrade() else {
            tracing::debug!("scheduler dropped; halting refresh loop");
            break;
        };
        let report = this.tick().await;
        drop(this);

        tracing::trace!(sleep_ms = report.sleep.as_millis() as u64, "refresh loop sleeping");
        tokio::select! {
            _ = tokio::time::sleep(report.sleep) => {}
            // only ever set to true, and a closed channel means the scheduler is gone
            _ = cancelled.changed() => break,
        }
    }

    tracing::info!("refresh loop stopped");
}
