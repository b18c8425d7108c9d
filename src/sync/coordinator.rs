use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::connectivity::Connectivity;
use crate::cache::ArticleCache;
use crate::clock::Clock;
use crate::storage::ArticleKind;

// ============================================================================
// Types
// ============================================================================

/// Error reported by a sync pass; its message lands in `SyncStatus::last_error`.
#[derive(Debug, Error)]
#[error("Sync failed: {0}")]
pub struct SyncError(pub String);

impl SyncError {
    fn cancelled() -> Self {
        SyncError("cancelled".to_string())
    }
}

/// Snapshot of connectivity and sync state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_sync_count: u64,
    pub sync_in_progress: bool,
    pub last_error: Option<String>,
}

/// An article handed to [`SyncCoordinator::prefetch_articles`].
#[derive(Debug, Clone)]
pub struct PrefetchItem {
    pub id: String,
    pub kind: ArticleKind,
    pub payload: serde_json::Value,
}

type StatusCallback = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

/// The body of a sync pass. The default pass has nothing to push and always succeeds.
pub type SyncPass = Arc<dyn Fn() -> BoxFuture<'static, Result<(), SyncError>> + Send + Sync>;

struct Subscriber {
    id: u64,
    callback: StatusCallback,
    /// Has received at least one status
    replayed: bool,
}

struct State {
    status: SyncStatus,
    /// Bumped on every status change
    version: u64,
    /// Newest version handed to every subscriber
    delivered: u64,
    /// Some caller is running the delivery loop
    dispatching: bool,
    subscribers: Vec<Subscriber>,
}

struct Inner {
    articles: ArticleCache,
    clock: Arc<dyn Clock>,
    connectivity: watch::Receiver<Connectivity>,
    sync_pass: Option<SyncPass>,
    state: Mutex<State>,
    next_subscriber: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases the delivery loop if a subscriber callback panics.
struct DispatchReset<'a>(&'a Inner);

impl Drop for DispatchReset<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            lock(&self.0.state).dispatching = false;
        }
    }
}

/// Ends a sync pass when dropped, so an abandoned `sync()` future still clears
/// `sync_in_progress` and sends the closing notification.
struct PassGuard<'a> {
    coordinator: &'a SyncCoordinator,
    outcome: Option<Result<(), SyncError>>,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let outcome = self.outcome.take();
        let now = self.coordinator.inner.clock.now();
        self.coordinator.update(|status| {
            match outcome {
                Some(Ok(())) => {
                    status.last_sync_at = Some(now);
                    status.pending_sync_count = 0;
                    status.last_error = None;
                    tracing::info!("Sync completed");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Sync failed");
                    status.last_error = Some(e.to_string());
                }
                None => {
                    tracing::warn!("Sync pass abandoned before it finished");
                    status.last_error = Some(SyncError::cancelled().to_string());
                }
            }
            status.sync_in_progress = false;
        });
    }
}

// ============================================================================
// Coordinator
// ============================================================================

/// Tracks online/offline transitions, publishes [`SyncStatus`] to subscribers,
/// runs sync passes and prefetches articles into the cache.
///
/// Create one per process at startup and clone the handle to share it.
/// `init()` starts following the connectivity channel; `shutdown()` stops it.
#[derive(Clone)]
pub struct SyncCoordinator {
    inner: Arc<Inner>,
}

impl SyncCoordinator {
    /// The initial online state is read from `connectivity` right away.
    pub fn new(
        articles: ArticleCache,
        connectivity: watch::Receiver<Connectivity>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::build(articles, connectivity, clock, None)
    }

    /// Like [`new`](Self::new), with a custom sync pass body.
    pub fn with_sync_pass(
        articles: ArticleCache,
        connectivity: watch::Receiver<Connectivity>,
        clock: Arc<dyn Clock>,
        sync_pass: SyncPass,
    ) -> Self {
        Self::build(articles, connectivity, clock, Some(sync_pass))
    }

    fn build(
        articles: ArticleCache,
        connectivity: watch::Receiver<Connectivity>,
        clock: Arc<dyn Clock>,
        sync_pass: Option<SyncPass>,
    ) -> Self {
        let is_online = connectivity.borrow().is_online();
        Self {
            inner: Arc::new(Inner {
                articles,
                clock,
                connectivity,
                sync_pass,
                state: Mutex::new(State {
                    status: SyncStatus {
                        is_online,
                        ..SyncStatus::default()
                    },
                    version: 0,
                    delivered: 0,
                    dispatching: false,
                    subscribers: Vec::new(),
                }),
                next_subscriber: AtomicU64::new(0),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Start following the connectivity channel on the current tokio runtime.
    ///
    /// Calling it again while the listener runs does nothing.
    pub fn init(&self) {
        let mut listener = lock(&self.inner.listener);
        if listener.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let mut rx = self.inner.connectivity.clone();
        let weak = Arc::downgrade(&self.inner);
        *listener = Some(tokio::spawn(async move {
            // Catch up with anything reported between construction and init.
            let mut state = *rx.borrow_and_update();
            loop {
                let Some(inner) = weak.upgrade() else { break };
                SyncCoordinator { inner }.set_connectivity(state).await;

                if rx.changed().await.is_err() {
                    tracing::debug!("Connectivity source closed");
                    break;
                }
                state = *rx.borrow_and_update();
            }
        }));
        tracing::debug!("Sync coordinator listening for connectivity changes");
    }

    /// Stop following the connectivity channel.
    ///
    /// A sync pass the listener was running is abandoned and reported as such.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.inner.listener).take() {
            handle.abort();
            tracing::debug!("Sync coordinator stopped");
        }
    }

    pub fn status(&self) -> SyncStatus {
        lock(&self.inner.state).status.clone()
    }

    /// Apply `change` to the status and deliver the result.
    fn update(&self, change: impl FnOnce(&mut SyncStatus)) {
        let mut state = lock(&self.inner.state);
        change(&mut state.status);
        state.version += 1;
        self.deliver(state);
    }

    /// Run the delivery loop unless some caller already is.
    ///
    /// One loop runs at a time and keeps going until every subscriber has seen
    /// the newest status, so each subscriber's last callback always carries the
    /// current status. Changes made meanwhile, from a callback or another
    /// thread, are delivered by the running loop. Callbacks run unlocked.
    fn deliver<'a>(&'a self, mut state: MutexGuard<'a, State>) {
        if state.dispatching {
            return;
        }
        state.dispatching = true;
        let _reset = DispatchReset(&self.inner);

        loop {
            let everyone = state.delivered != state.version;
            let callbacks: Vec<StatusCallback> = state
                .subscribers
                .iter_mut()
                .filter(|subscriber| everyone || !subscriber.replayed)
                .map(|subscriber| {
                    subscriber.replayed = true;
                    Arc::clone(&subscriber.callback)
                })
                .collect();
            if !everyone && callbacks.is_empty() {
                state.dispatching = false;
                return;
            }
            state.delivered = state.version;
            let status = state.status.clone();
            drop(state);

            for callback in callbacks {
                callback(&status);
            }
            state = lock(&self.inner.state);
        }
    }

    /// Register `callback` for every future status change.
    ///
    /// The callback first receives the current status: before `subscribe`
    /// returns, or, if a delivery is already running (on another thread or in
    /// an enclosing callback), from that delivery ahead of any later status.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut state = lock(&self.inner.state);
        state.subscribers.push(Subscriber {
            id,
            callback: Arc::new(callback),
            replayed: false,
        });
        self.deliver(state);

        Subscription {
            id,
            coordinator: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }

    /// Apply a connectivity transition.
    ///
    /// Subscribers hear about real transitions only. Coming online starts a sync.
    pub async fn set_connectivity(&self, state: Connectivity) {
        let came_online = {
            let mut guard = lock(&self.inner.state);
            let was_online = guard.status.is_online;
            if was_online == state.is_online() {
                return;
            }
            guard.status.is_online = state.is_online();
            guard.version += 1;
            tracing::info!(online = !was_online, "Connectivity changed");
            self.deliver(guard);
            !was_online
        };

        if came_online {
            self.sync().await;
        }
    }

    /// Run a sync pass.
    ///
    /// Does nothing while offline or while another pass is running. Otherwise
    /// subscribers are notified exactly twice: when the pass starts and when it
    /// ends, even if the returned future is dropped early. A failure is
    /// recorded in `last_error`, never returned.
    pub async fn sync(&self) {
        {
            let mut state = lock(&self.inner.state);
            if state.status.sync_in_progress || !state.status.is_online {
                tracing::debug!(
                    online = state.status.is_online,
                    in_progress = state.status.sync_in_progress,
                    "Skipping sync"
                );
                return;
            }
            state.status.sync_in_progress = true;
            state.version += 1;
            self.deliver(state);
        }

        let mut pass = PassGuard {
            coordinator: self,
            outcome: None,
        };
        let result = match &self.inner.sync_pass {
            Some(body) => body().await,
            None => Ok(()),
        };
        pass.outcome = Some(result);
    }

    /// Count a local change for the next sync pass to clear.
    pub fn record_pending_change(&self) {
        self.update(|status| status.pending_sync_count += 1);
    }

    /// Cache a batch of articles ahead of demand. Skipped entirely while offline.
    ///
    /// Each item is attempted even if earlier ones fail; failures are logged only.
    pub async fn prefetch_articles(&self, items: &[PrefetchItem]) {
        if !self.status().is_online {
            tracing::debug!(count = items.len(), "Offline, skipping prefetch");
            return;
        }

        let mut failed = 0usize;
        for item in items {
            if let Err(e) = self
                .inner
                .articles
                .cache_article(&item.id, item.kind, &item.payload)
                .await
            {
                failed += 1;
                tracing::debug!(id = %item.id, error = %e, "Prefetch of article failed");
            }
        }

        if failed > 0 {
            tracing::warn!(failed, total = items.len(), "Some articles could not be prefetched");
        } else {
            tracing::debug!(total = items.len(), "Prefetched articles");
        }
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Handle returned by [`SyncCoordinator::subscribe`].
///
/// Dropping it leaves the callback registered; call [`unsubscribe`](Self::unsubscribe).
pub struct Subscription {
    id: u64,
    coordinator: Weak<Inner>,
    active: AtomicBool,
}

impl Subscription {
    /// Stop receiving status updates. Calling it again is a no-op.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(inner) = self.coordinator.upgrade() {
            lock(&inner.state)
                .subscribers
                .retain(|subscriber| subscriber.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheLimits;
    use crate::clock::ManualClock;
    use crate::storage::Store;
    use crate::sync::ConnectivityHandle;
    use chrono::TimeZone;
    use futures::FutureExt;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 5, 10, 0, 0).unwrap()
    }

    fn coordinator(initial: Connectivity) -> (SyncCoordinator, ConnectivityHandle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let articles = ArticleCache::new(
            Arc::new(Store::in_memory()),
            CacheLimits::default(),
            clock.clone(),
        );
        let handle = ConnectivityHandle::new(initial);
        let coordinator = SyncCoordinator::new(articles, handle.subscribe(), clock.clone());
        (coordinator, handle, clock)
    }

    fn recorder(coordinator: &SyncCoordinator) -> (Subscription, Arc<Mutex<Vec<SyncStatus>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscription = coordinator.subscribe(move |status| {
            sink.lock().unwrap().push(status.clone());
        });
        (subscription, seen)
    }

    #[test]
    fn test_initial_state_from_connectivity() {
        let (online, _h1, _c1) = coordinator(Connectivity::Online);
        let (offline, _h2, _c2) = coordinator(Connectivity::Offline);
        assert!(online.status().is_online);
        assert!(!offline.status().is_online);
        assert_eq!(online.status().last_sync_at, None);
    }

    #[test]
    fn test_subscribe_replays_current_status() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let (_sub, seen) = recorder(&coordinator);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].is_online);
    }

    #[tokio::test]
    async fn test_sync_notifies_twice_and_records_time() {
        let (coordinator, _handle, clock) = coordinator(Connectivity::Online);
        coordinator.record_pending_change();
        let (_sub, seen) = recorder(&coordinator);

        coordinator.sync().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].pending_sync_count, 1);
        assert!(seen[1].sync_in_progress);
        assert!(!seen[2].sync_in_progress);
        assert_eq!(seen[2].last_sync_at, Some(clock.now()));
        assert_eq!(seen[2].pending_sync_count, 0);
    }

    #[tokio::test]
    async fn test_sync_offline_is_noop() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Offline);
        let (_sub, seen) = recorder(&coordinator);

        coordinator.sync().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(coordinator.status().last_sync_at, None);
    }

    #[tokio::test]
    async fn test_failed_sync_sets_last_error_and_notifies_twice() {
        let clock = Arc::new(ManualClock::new(t0()));
        let articles = ArticleCache::new(
            Arc::new(Store::in_memory()),
            CacheLimits::default(),
            clock.clone(),
        );
        let handle = ConnectivityHandle::new(Connectivity::Online);
        let pass: SyncPass =
            Arc::new(|| async { Err(SyncError("server unreachable".to_string())) }.boxed());
        let coordinator =
            SyncCoordinator::with_sync_pass(articles, handle.subscribe(), clock, pass);
        let (_sub, seen) = recorder(&coordinator);

        coordinator.sync().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(
            seen[2].last_error.as_deref(),
            Some("Sync failed: server unreachable")
        );
        assert!(!seen[2].sync_in_progress);
        assert_eq!(seen[2].last_sync_at, None);
    }

    #[tokio::test]
    async fn test_unsubscribe_twice_is_noop() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let (sub, seen) = recorder(&coordinator);
        let (_other, other_seen) = recorder(&coordinator);

        sub.unsubscribe();
        sub.unsubscribe();
        coordinator.record_pending_change();

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(other_seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_going_online_triggers_sync() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Offline);
        let (_sub, seen) = recorder(&coordinator);

        coordinator.set_connectivity(Connectivity::Online).await;

        let seen = seen.lock().unwrap();
        // replay, online, sync start, sync end
        assert_eq!(seen.len(), 4);
        assert!(seen[1].is_online && !seen[1].sync_in_progress);
        assert!(seen[2].sync_in_progress);
        assert!(seen[3].last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_repeated_connectivity_is_not_a_transition() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let (_sub, seen) = recorder(&coordinator);

        coordinator.set_connectivity(Connectivity::Online).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    fn slow_pass() -> SyncPass {
        Arc::new(|| {
            async {
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                Ok(())
            }
            .boxed()
        })
    }

    fn slow_coordinator(initial: Connectivity) -> (SyncCoordinator, ConnectivityHandle) {
        let clock = Arc::new(ManualClock::new(t0()));
        let articles = ArticleCache::new(
            Arc::new(Store::in_memory()),
            CacheLimits::default(),
            clock.clone(),
        );
        let handle = ConnectivityHandle::new(initial);
        let coordinator =
            SyncCoordinator::with_sync_pass(articles, handle.subscribe(), clock, slow_pass());
        (coordinator, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sync_future_still_ends_the_pass() {
        let (coordinator, _handle) = slow_coordinator(Connectivity::Online);
        let (_sub, seen) = recorder(&coordinator);

        let abandoned =
            tokio::time::timeout(std::time::Duration::from_millis(10), coordinator.sync()).await;
        assert!(abandoned.is_err());

        let status = coordinator.status();
        assert!(!status.sync_in_progress);
        assert_eq!(status.last_error.as_deref(), Some("Sync failed: cancelled"));
        assert_eq!(status.last_sync_at, None);
        // replay, start, end
        assert_eq!(seen.lock().unwrap().len(), 3);

        coordinator.sync().await;

        let status = coordinator.status();
        assert!(status.last_sync_at.is_some());
        assert_eq!(status.last_error, None);
        assert_eq!(seen.lock().unwrap().len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_listener_sync_ends_the_pass() {
        let (coordinator, handle) = slow_coordinator(Connectivity::Offline);
        coordinator.init();

        handle.set(Connectivity::Online);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(coordinator.status().sync_in_progress);

        coordinator.shutdown();
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        let status = coordinator.status();
        assert!(!status.sync_in_progress);
        assert!(status.last_error.is_some());

        coordinator.sync().await;
        assert!(coordinator.status().last_sync_at.is_some());
    }

    #[test]
    fn test_change_made_inside_callback_is_delivered_after_it() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let nested = coordinator.clone();
        let _sub = coordinator.subscribe(move |status| {
            sink.lock().unwrap().push(status.pending_sync_count);
            if status.pending_sync_count == 1 {
                nested.record_pending_change();
            }
        });

        coordinator.record_pending_change();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_subscribe_inside_callback_gets_replay() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let late_seen = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let nested = coordinator.clone();
        let sink = Arc::clone(&late_seen);
        let inner_slot = Arc::clone(&slot);
        let _outer = coordinator.subscribe(move |status| {
            if status.pending_sync_count == 1 && inner_slot.lock().unwrap().is_none() {
                let sink = Arc::clone(&sink);
                let late = nested.subscribe(move |status| {
                    sink.lock().unwrap().push(status.pending_sync_count);
                });
                *inner_slot.lock().unwrap() = Some(late);
            }
        });

        coordinator.record_pending_change();
        assert_eq!(*late_seen.lock().unwrap(), vec![1]);

        coordinator.record_pending_change();
        assert_eq!(*late_seen.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_last_delivery_matches_status_under_contention() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let (_sub, seen) = recorder(&coordinator);

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..200 {
                        coordinator.record_pending_change();
                    }
                });
            }
        });

        let current = coordinator.status();
        assert_eq!(current.pending_sync_count, 1_600);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&current));
        assert!(seen
            .windows(2)
            .all(|pair| pair[0].pending_sync_count < pair[1].pending_sync_count));
    }

    #[tokio::test]
    async fn test_unsubscribe_inside_callback_does_not_deadlock() {
        let (coordinator, _handle, _clock) = coordinator(Connectivity::Online);
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));
        let inner_slot = Arc::clone(&slot);
        let sub = coordinator.subscribe(move |status| {
            if status.pending_sync_count > 0 {
                if let Some(sub) = inner_slot.lock().unwrap().as_ref() {
                    sub.unsubscribe();
                }
            }
        });
        *slot.lock().unwrap() = Some(sub);

        coordinator.record_pending_change();
        coordinator.record_pending_change();

        assert_eq!(coordinator.status().pending_sync_count, 2);
    }
}
