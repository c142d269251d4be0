use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use strum::{AsRefStr, Display};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::AutoSaveConfig;
use crate::network::NetworkStatus;

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(2000);
pub const SAVED_COOLDOWN: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum SaveStatus {
    Idle,
    Saving,
    Saved,
    Error,
}

/// Published view of an auto-save session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveState {
    pub status: SaveStatus,
    pub last_saved_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    /// Revision of the most recently issued save request (0 before the first).
    pub revision: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaveRequest<T> {
    pub revision: u64,
    pub snapshot: T,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SaveError {
    #[error("save rejected: {0}")]
    Rejected(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
    #[error("stale revision {attempted}, remote already holds {current}")]
    Stale { attempted: u64, current: u64 },
}

/// Remote destination of auto-saved snapshots.
///
/// The controller makes no assumption about retries or idempotency on the
/// sink's side. `revision` increases with every issued request, so a sink
/// that cares about ordering can drop writes older than what it holds.
#[async_trait]
pub trait SaveSink<T>: Send + Sync {
    async fn save(&self, request: SaveRequest<T>) -> Result<(), SaveError>;
}

#[derive(Debug, Clone)]
pub struct AutoSaveOptions {
    pub enabled: bool,
    pub debounce: Duration,
    pub saved_cooldown: Duration,
}

impl Default for AutoSaveOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce: DEFAULT_DEBOUNCE,
            saved_cooldown: SAVED_COOLDOWN,
        }
    }
}

impl From<&AutoSaveConfig> for AutoSaveOptions {
    fn from(config: &AutoSaveConfig) -> Self {
        Self {
            enabled: config.enabled,
            debounce: config.debounce_duration(),
            saved_cooldown: config.saved_cooldown_duration(),
        }
    }
}

type Equivalence<T> = Arc<dyn Fn(&T, &T) -> bool + Send + Sync>;

/// Debounced auto-save of a changing snapshot.
///
/// Every [`update`](Self::update) that differs from the baseline captured at
/// construction restarts the debounce timer; when it finally fires the latest
/// snapshot is handed to the sink. Must be used from within a Tokio runtime.
pub struct AutoSaveController<T> {
    shared: Arc<Shared<T>>,
    network: Mutex<Option<JoinHandle<()>>>,
}

struct Shared<T> {
    sink: Arc<dyn SaveSink<T>>,
    equivalent: Equivalence<T>,
    debounce: Duration,
    saved_cooldown: Duration,
    session: Mutex<Session<T>>,
    state_tx: watch::Sender<SaveState>,
}

struct Session<T> {
    baseline: T,
    latest: T,
    enabled: bool,
    online: bool,
    closed: bool,
    status: SaveStatus,
    // Bumped on every status change; a cooldown only reverts the `saved` it was armed for.
    transition: u64,
    issued: u64,
    last_saved_at: Option<OffsetDateTime>,
    last_error: Option<String>,
    in_flight: Option<T>,
    saved: Option<(u64, T)>,
    timer_seq: u64,
    timer: Option<JoinHandle<()>>,
    cooldown: Option<JoinHandle<()>>,
}

impl<T> AutoSaveController<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(sink: Arc<dyn SaveSink<T>>, initial: T, options: AutoSaveOptions) -> Self {
        Self::with_equivalence(sink, initial, options, |a: &T, b: &T| a == b)
    }
}

impl<T> AutoSaveController<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Builds a controller that detects changes with `equivalent` instead of `PartialEq`.
    pub fn with_equivalence<F>(
        sink: Arc<dyn SaveSink<T>>,
        initial: T,
        options: AutoSaveOptions,
        equivalent: F,
    ) -> Self
    where
        F: Fn(&T, &T) -> bool + Send + Sync + 'static,
    {
        let session = Session::new(initial, options.enabled);
        let (state_tx, _) = watch::channel(session.state());
        Self {
            shared: Arc::new(Shared {
                sink,
                equivalent: Arc::new(equivalent),
                debounce: options.debounce,
                saved_cooldown: options.saved_cooldown,
                session: Mutex::new(session),
                state_tx,
            }),
            network: Mutex::new(None),
        }
    }

    /// Records a new snapshot and (re)starts the debounce window when it
    /// differs from the baseline.
    pub fn update(&self, snapshot: T) {
        let mut session = self.shared.session.lock();
        session.latest = snapshot;
        self.shared.schedule(&mut session);
    }

    pub fn set_enabled(&self, enabled: bool) {
        let mut session = self.shared.session.lock();
        if session.enabled == enabled {
            return;
        }
        session.enabled = enabled;
        if enabled {
            self.shared.schedule(&mut session);
        } else {
            tracing::debug!("auto-save suspended");
            session.cancel_timer();
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.session.lock().enabled
    }

    /// Saves the latest snapshot immediately, cancelling any pending debounce.
    ///
    /// This is the only way out of [`SaveStatus::Error`]. When the latest
    /// snapshot matches the baseline nothing is sent and an error is cleared
    /// back to idle.
    pub async fn retry(&self) -> Result<(), SaveError> {
        let request = {
            let mut session = self.shared.session.lock();
            session.cancel_timer();
            if (self.shared.equivalent)(&session.latest, &session.baseline) {
                if session.status == SaveStatus::Error {
                    session.last_error = None;
                    session.set_status(SaveStatus::Idle);
                    self.shared.publish(&session);
                }
                tracing::debug!("retry skipped, snapshot matches baseline");
                return Ok(());
            }
            self.shared.begin(&mut session)
        };
        let revision = request.revision;
        let outcome = self.shared.sink.save(request).await;
        self.shared.finish(revision, &outcome);
        outcome
    }

    pub fn status(&self) -> SaveState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SaveState> {
        self.shared.state_tx.subscribe()
    }

    pub fn latest(&self) -> T {
        self.shared.session.lock().latest.clone()
    }

    pub fn baseline(&self) -> T {
        self.shared.session.lock().baseline.clone()
    }

    /// Revision of the newest request the sink accepted, 0 if none.
    pub fn saved_revision(&self) -> u64 {
        self.shared
            .session
            .lock()
            .saved
            .as_ref()
            .map_or(0, |(revision, _)| *revision)
    }

    /// True while the latest snapshot differs from what the sink last
    /// accepted (or from the baseline when nothing was saved yet).
    pub fn has_unsaved_changes(&self) -> bool {
        let session = self.shared.session.lock();
        let reference = session
            .saved
            .as_ref()
            .map_or(&session.baseline, |(_, snapshot)| snapshot);
        !(self.shared.equivalent)(&session.latest, reference)
    }

    /// Treats the controller as disabled whenever `network` reports offline.
    pub fn follow_network(&self, mut network: watch::Receiver<NetworkStatus>) {
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            loop {
                let online = network.borrow_and_update().online;
                shared.set_online(online);
                if network.changed().await.is_err() {
                    break;
                }
            }
        });
        if let Some(previous) = self.network.lock().replace(handle) {
            previous.abort();
        }
    }
}

impl<T> Drop for AutoSaveController<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.network.lock().take() {
            handle.abort();
        }
        let mut session = self.shared.session.lock();
        session.closed = true;
        session.cancel_timer();
        if let Some(handle) = session.cooldown.take() {
            handle.abort();
        }
    }
}

impl<T> Shared<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn schedule(self: &Arc<Self>, session: &mut Session<T>) {
        session.cancel_timer();
        if !session.accepting() || session.status == SaveStatus::Error {
            return;
        }
        if (self.equivalent)(&session.latest, &session.baseline) {
            return;
        }
        let seq = session.timer_seq;
        let delay = self.debounce;
        let shared = Arc::clone(self);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "auto-save scheduled");
        session.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            shared.fire(seq).await;
        }));
    }

    async fn fire(self: Arc<Self>, seq: u64) {
        let request = {
            let mut session = self.session.lock();
            if session.timer_seq != seq {
                return;
            }
            // Past this point the save is in flight and can no longer be cancelled.
            session.timer = None;
            self.begin(&mut session)
        };
        let revision = request.revision;
        let outcome = self.sink.save(request).await;
        self.finish(revision, &outcome);
    }

    fn begin(&self, session: &mut Session<T>) -> SaveRequest<T> {
        session.issued += 1;
        session.last_error = None;
        if let Some(handle) = session.cooldown.take() {
            handle.abort();
        }
        session.set_status(SaveStatus::Saving);
        self.publish(session);
        tracing::debug!(revision = session.issued, "auto-save started");
        session.in_flight = Some(session.latest.clone());
        SaveRequest {
            revision: session.issued,
            snapshot: session.latest.clone(),
        }
    }

    fn finish(self: &Arc<Self>, revision: u64, outcome: &Result<(), SaveError>) {
        let mut session = self.session.lock();
        if revision != session.issued {
            tracing::warn!(
                revision,
                latest = session.issued,
                ok = outcome.is_ok(),
                "dropping outcome of superseded save"
            );
            return;
        }
        match outcome {
            Ok(()) => {
                if let Some(snapshot) = session.in_flight.take() {
                    session.saved = Some((revision, snapshot));
                }
                session.set_status(SaveStatus::Saved);
                session.last_saved_at = Some(OffsetDateTime::now_utc());
                tracing::info!(revision, "auto-save completed");
                if !session.closed {
                    let armed = session.transition;
                    let cooldown = self.saved_cooldown;
                    let shared = Arc::clone(self);
                    session.cooldown = Some(tokio::spawn(async move {
                        tokio::time::sleep(cooldown).await;
                        shared.revert_to_idle(armed);
                    }));
                }
            }
            Err(err) => {
                session.in_flight = None;
                session.set_status(SaveStatus::Error);
                session.last_error = Some(err.to_string());
                session.cancel_timer();
                tracing::warn!(revision, error = %err, "auto-save failed");
            }
        }
        self.publish(&session);
    }

    fn revert_to_idle(&self, armed: u64) {
        let mut session = self.session.lock();
        if session.status != SaveStatus::Saved || session.transition != armed {
            return;
        }
        session.cooldown = None;
        session.set_status(SaveStatus::Idle);
        self.publish(&session);
    }

    fn set_online(self: &Arc<Self>, online: bool) {
        let mut session = self.session.lock();
        if session.online == online {
            return;
        }
        session.online = online;
        tracing::debug!(online, "auto-save connectivity changed");
        if online {
            self.schedule(&mut session);
        } else {
            session.cancel_timer();
        }
    }

    fn publish(&self, session: &Session<T>) {
        self.state_tx.send_replace(session.state());
    }
}

impl<T: Clone> Session<T> {
    fn new(initial: T, enabled: bool) -> Self {
        Self {
            baseline: initial.clone(),
            latest: initial,
            enabled,
            online: true,
            closed: false,
            status: SaveStatus::Idle,
            transition: 0,
            issued: 0,
            last_saved_at: None,
            last_error: None,
            in_flight: None,
            saved: None,
            timer_seq: 0,
            timer: None,
            cooldown: None,
        }
    }
}

impl<T> Session<T> {
    fn accepting(&self) -> bool {
        self.enabled && self.online && !self.closed
    }

    fn cancel_timer(&mut self) {
        self.timer_seq += 1;
        if let Some(handle) = self.timer.take() {
            handle.abort();
        }
    }

    fn set_status(&mut self, status: SaveStatus) {
        self.status = status;
        self.transition += 1;
    }

    fn state(&self) -> SaveState {
        SaveState {
            status: self.status,
            last_saved_at: self.last_saved_at,
            last_error: self.last_error.clone(),
            revision: self.issued,
        }
    }
}
