//! Two concurrent translation sessions (A→B and B→A) over one credential
//! source.
//!
//! Each direction has its own [`TransportManager`], forwarder task and
//! supervisor. A failure in one direction never touches the other.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::direction::{
    CredentialPolicy, DirectionalEvent, LanguagePair, SessionDirection, SessionEvent,
    SessionState, SessionStatus,
};
use crate::core::backoff::BackoffPolicy;
use crate::core::credentials::{Credential, CredentialError, CredentialResult, CredentialSource};
use crate::core::realtime::{ClientEvent, RealtimeVoice, SessionConfig};
use crate::core::transport::{
    DEFAULT_CLOSE_TIMEOUT, EVENT_CHANNEL_CAPACITY, FailoverCredential, ManagerEvent,
    ManagerOptions, TransportError, TransportFactory, TransportManager, TransportState,
    TransportStatus,
};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Clone, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Sessions are not ready: both directions must be connected")]
    NotReady,

    #[error("No active translation session")]
    NoActiveSession,

    #[error("Direction {0} is not the active translation direction")]
    NotActive(SessionDirection),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Reconnection of {direction} exhausted after {attempts} attempts")]
    ReconnectExhausted {
        direction: SessionDirection,
        attempts: u32,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Coordinator is closed")]
    Closed,
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

// =============================================================================
// Configuration
// =============================================================================

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Language code A (forward source, reverse target).
    pub language_a: String,
    /// Language code B (forward target, reverse source).
    pub language_b: String,
    pub voice: RealtimeVoice,
    /// Input transcription model; the protocol default when `None`.
    pub transcription_model: Option<String>,
    /// Try the stream transport first instead of the peer transport.
    pub prefer_stream: bool,
    pub credential_policy: CredentialPolicy,
    /// Used for initial connects and for reconnection.
    pub backoff: BackoffPolicy,
    pub close_timeout: Duration,
}

impl CoordinatorConfig {
    pub fn new(language_a: impl Into<String>, language_b: impl Into<String>) -> Self {
        Self {
            language_a: language_a.into(),
            language_b: language_b.into(),
            voice: RealtimeVoice::default(),
            transcription_model: None,
            prefer_stream: false,
            credential_policy: CredentialPolicy::default(),
            backoff: BackoffPolicy::default(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }

    /// `session.update` payload for one direction.
    pub fn session_config(&self, direction: SessionDirection) -> SessionConfig {
        let pair = LanguagePair::for_direction(&self.language_a, &self.language_b, direction);
        SessionConfig::translation(
            pair.instructions(),
            self.voice,
            self.transcription_model.as_deref(),
        )
    }
}

// =============================================================================
// Coordinator
// =============================================================================

type InitFuture = Shared<BoxFuture<'static, CoordinatorResult<()>>>;

struct DirectionSlot {
    direction: SessionDirection,
    manager: TransportManager,
    reconnecting: AtomicBool,
    /// Set when automatic reconnection gave up; cleared by `reconnect`.
    terminal: AtomicBool,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    credentials: Arc<dyn CredentialSource>,
    slots: [DirectionSlot; 2],
    active: tokio::sync::Mutex<Option<SessionDirection>>,
    init: Mutex<Option<InitFuture>>,
    initialized: AtomicBool,
    closed: AtomicBool,
    forwarders: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<DirectionalEvent>,
    status: broadcast::Sender<SessionStatus>,
}

/// Owns the forward and reverse sessions.
#[derive(Clone)]
pub struct DualSessionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DualSessionCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        credentials: Arc<dyn CredentialSource>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        let failover_credential = match config.credential_policy {
            CredentialPolicy::PerDirection => FailoverCredential::Issue,
            CredentialPolicy::Shared => FailoverCredential::Refresh,
        };
        let slot = |direction: SessionDirection| DirectionSlot {
            direction,
            manager: TransportManager::new(
                factory.clone(),
                credentials.clone(),
                ManagerOptions {
                    label: direction.as_str().to_string(),
                    close_timeout: config.close_timeout,
                    failover_credential,
                },
            ),
            reconnecting: AtomicBool::new(false),
            terminal: AtomicBool::new(false),
        };
        let slots = [slot(SessionDirection::Forward), slot(SessionDirection::Reverse)];
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                credentials,
                slots,
                active: tokio::sync::Mutex::new(None),
                init: Mutex::new(None),
                initialized: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                forwarders: Mutex::new(None),
                events,
                status,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    /// Connect and configure both directions.
    ///
    /// Concurrent callers share one attempt. Success is remembered; a failure
    /// lets the next call try again.
    pub async fn initialize(&self) -> CoordinatorResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        if self.inner.initialized.load(Ordering::SeqCst) {
            return Ok(());
        }

        let init = {
            let mut slot = self.inner.init.lock();
            match slot.as_ref() {
                Some(existing) => {
                    debug!("Initialization already in progress, awaiting it");
                    existing.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let fut = async move { inner.run_initialize().await }.boxed().shared();
                    *slot = Some(fut.clone());
                    fut
                }
            }
        };

        let result = init.clone().await;
        if result.is_err() {
            let mut slot = self.inner.init.lock();
            if slot.as_ref().is_some_and(|current| current.ptr_eq(&init)) {
                *slot = None;
            }
        }
        result
    }

    /// Both directions connected.
    pub fn is_ready(&self) -> bool {
        SessionDirection::ALL
            .iter()
            .all(|d| self.session_state(*d) == SessionState::Connected)
    }

    pub fn session_state(&self, direction: SessionDirection) -> SessionState {
        SessionState::from(self.inner.slot(direction).manager.state())
    }

    pub fn status(&self, direction: SessionDirection) -> SessionStatus {
        let slot = self.inner.slot(direction);
        session_status(direction, &slot.manager.status())
    }

    pub async fn active_direction(&self) -> Option<SessionDirection> {
        *self.inner.active.lock().await
    }

    /// Re-establish one direction with backoff. Clears the terminal flag left
    /// by exhausted automatic reconnection.
    pub async fn reconnect(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        self.inner.ensure_forwarders();
        self.inner.slot(direction).terminal.store(false, Ordering::SeqCst);
        self.inner.reconnect_direction(direction).await
    }

    /// Arm capture on `direction`. Capture on the other direction is stopped
    /// first.
    pub async fn start_translation(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        if !self.is_ready() {
            return Err(CoordinatorError::NotReady);
        }

        let mut active = self.inner.active.lock().await;
        match *active {
            Some(current) if current == direction => return Ok(()),
            Some(current) => {
                if let Err(e) = self.inner.slot(current).manager.stop_capture().await {
                    warn!("[{}] Failed to stop capture: {}", current, e);
                }
                *active = None;
            }
            None => {}
        }

        self.inner.slot(direction).manager.start_capture().await?;
        *active = Some(direction);
        info!("[{}] Translation started", direction);
        Ok(())
    }

    /// Disarm the active direction.
    pub async fn stop_translation(&self) -> CoordinatorResult<SessionDirection> {
        let mut active = self.inner.active.lock().await;
        let direction = active.take().ok_or(CoordinatorError::NoActiveSession)?;
        self.inner.slot(direction).manager.stop_capture().await?;
        info!("[{}] Translation stopped", direction);
        Ok(direction)
    }

    /// Push PCM16 audio into the active direction.
    pub async fn send_audio(&self, direction: SessionDirection, pcm: Bytes) -> CoordinatorResult<()> {
        if *self.inner.active.lock().await != Some(direction) {
            return Err(CoordinatorError::NotActive(direction));
        }
        self.inner.slot(direction).manager.send_audio(pcm).await?;
        Ok(())
    }

    /// Mark the end of the user's turn on `direction`.
    pub async fn commit_turn(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        self.inner.slot(direction).manager.commit_turn().await?;
        Ok(())
    }

    /// Ask `direction` for its translation of the committed turn.
    pub async fn request_response(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        self.inner
            .slot(direction)
            .manager
            .send_message(ClientEvent::response_create())
            .await?;
        Ok(())
    }

    /// Stop the response `direction` is producing, if any.
    pub async fn cancel_response(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        self.inner
            .slot(direction)
            .manager
            .send_message(ClientEvent::ResponseCancel)
            .await?;
        Ok(())
    }

    /// Drop audio appended on `direction` since the last commit.
    pub async fn clear_input(&self, direction: SessionDirection) -> CoordinatorResult<()> {
        self.inner
            .slot(direction)
            .manager
            .send_message(ClientEvent::InputAudioBufferClear)
            .await?;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectionalEvent> {
        self.inner.events.subscribe()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Stop translation, close both directions and clear the credential
    /// cache. Idempotent.
    pub async fn close(&self) -> CoordinatorResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let close_timeout = inner.config.close_timeout;
        info!("Closing dual session coordinator");

        let active = inner.active.lock().await.take();
        if let Some(direction) = active {
            match timeout(close_timeout, inner.slot(direction).manager.stop_capture()).await {
                Ok(Err(e)) => warn!("[{}] Failed to stop capture on close: {}", direction, e),
                Err(_) => warn!("[{}] Stopping capture timed out", direction),
                Ok(Ok(())) => {}
            }
        }

        if let Some(cancel) = inner.forwarders.lock().take() {
            cancel.cancel();
        }

        let close_one = |direction: SessionDirection| {
            let manager = inner.slot(direction).manager.clone();
            async move {
                if timeout(close_timeout, manager.close()).await.is_err() {
                    warn!("[{}] Manager close timed out", direction);
                }
            }
        };
        tokio::join!(
            close_one(SessionDirection::Forward),
            close_one(SessionDirection::Reverse)
        );

        inner.credentials.clear().await;
        inner.init.lock().take();
        inner.initialized.store(false, Ordering::SeqCst);
        Ok(())
    }
}

impl CoordinatorInner {
    fn slot(&self, direction: SessionDirection) -> &DirectionSlot {
        &self.slots[direction.index()]
    }

    async fn run_initialize(self: Arc<Self>) -> CoordinatorResult<()> {
        info!(
            "Initializing sessions {} <-> {} ({:?} credentials)",
            self.config.language_a, self.config.language_b, self.config.credential_policy
        );
        self.ensure_forwarders();

        for direction in SessionDirection::ALL {
            let config = self.config.session_config(direction);
            self.slot(direction).manager.set_session_config(config).await?;
        }

        let (forward, reverse) = tokio::join!(
            self.connect_with_backoff(SessionDirection::Forward, false),
            self.connect_with_backoff(SessionDirection::Reverse, false)
        );

        let failures: Vec<String> = [forward, reverse]
            .into_iter()
            .zip(SessionDirection::ALL)
            .filter_map(|(result, direction)| result.err().map(|e| format!("{direction}: {e}")))
            .collect();

        if self.closed.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Closed);
        }
        if !failures.is_empty() {
            let reason = failures.join("; ");
            error!("Session initialization failed: {}", reason);
            return Err(CoordinatorError::Initialization(reason));
        }

        self.initialized.store(true, Ordering::SeqCst);
        info!("Both translation sessions connected");
        Ok(())
    }

    fn ensure_forwarders(self: &Arc<Self>) {
        let cancel = {
            let mut forwarders = self.forwarders.lock();
            if forwarders.is_some() || self.closed.load(Ordering::SeqCst) {
                return;
            }
            let cancel = CancellationToken::new();
            *forwarders = Some(cancel.clone());
            cancel
        };
        for direction in SessionDirection::ALL {
            self.spawn_forwarder(direction, cancel.clone());
        }
    }

    fn spawn_forwarder(self: &Arc<Self>, direction: SessionDirection, cancel: CancellationToken) {
        let inner = Arc::clone(self);
        let mut rx = self.slot(direction).manager.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(ManagerEvent::Message(message)) => {
                        let _ = inner.events.send(DirectionalEvent {
                            direction,
                            event: SessionEvent::Message(message),
                        });
                    }
                    Ok(ManagerEvent::Audio(chunk)) => {
                        let _ = inner.events.send(DirectionalEvent {
                            direction,
                            event: SessionEvent::Audio(chunk),
                        });
                    }
                    Ok(ManagerEvent::Status(status)) => {
                        inner.on_status(direction, status);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[{}] Session forwarder lagged, skipped {} events", direction, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("[{}] Session forwarder stopped", direction);
        });
    }

    fn on_status(self: &Arc<Self>, direction: SessionDirection, status: TransportStatus) {
        let _ = self.status.send(session_status(direction, &status));

        let lost = matches!(
            status.state,
            TransportState::Failed | TransportState::Disconnected
        );
        if !lost
            || self.closed.load(Ordering::SeqCst)
            || !self.initialized.load(Ordering::SeqCst)
        {
            return;
        }

        let slot = self.slot(direction);
        if slot.terminal.load(Ordering::SeqCst) || slot.reconnecting.load(Ordering::SeqCst) {
            return;
        }
        // Stale report from an attempt that has since been superseded
        if slot.manager.state() == TransportState::Connected {
            return;
        }

        warn!("[{}] Session lost ({}), reconnecting", direction, status.state);
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.reconnect_direction(direction).await {
                error!("[{}] Automatic reconnection failed: {}", direction, e);
            }
        });
    }

    /// Guarded reconnection of one direction.
    async fn reconnect_direction(self: &Arc<Self>, direction: SessionDirection) -> CoordinatorResult<()> {
        let slot = self.slot(direction);
        if slot
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[{}] Reconnection already in progress", direction);
            return Ok(());
        }

        let result = self.connect_with_backoff(direction, true).await;
        if let Err(e) = &result
            && !matches!(e, CoordinatorError::Closed)
        {
            slot.terminal.store(true, Ordering::SeqCst);
            slot.manager.mark_failed(e.to_string()).await;
        }
        slot.reconnecting.store(false, Ordering::SeqCst);
        result
    }

    /// Fetch a credential and connect one direction, retrying per the backoff
    /// policy.
    async fn connect_with_backoff(
        &self,
        direction: SessionDirection,
        fresh_credential: bool,
    ) -> CoordinatorResult<()> {
        let slot = self.slot(direction);
        let backoff = &self.config.backoff;
        let mut attempts = 0u32;

        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Err(CoordinatorError::Closed);
            }
            attempts += 1;

            let attempt = match self.credential_for(fresh_credential).await {
                Ok(credential) => slot
                    .manager
                    .connect(&credential, self.config.prefer_stream)
                    .await
                    .map_err(CoordinatorError::from),
                Err(e) => Err(CoordinatorError::from(e)),
            };

            // A close that raced the attempt wins over its result
            if self.closed.load(Ordering::SeqCst) {
                if attempt.is_ok()
                    && timeout(self.config.close_timeout, slot.manager.close())
                        .await
                        .is_err()
                {
                    warn!("[{}] Manager close timed out", direction);
                }
                return Err(CoordinatorError::Closed);
            }

            match attempt {
                Ok(kind) => {
                    info!(
                        "[{}] Session connected via {} after {} attempt(s)",
                        slot.direction, kind, attempts
                    );
                    return Ok(());
                }
                Err(e) if backoff.should_retry(attempts) => {
                    let delay = backoff.delay_for(attempts);
                    warn!(
                        "[{}] Connect attempt {} failed: {}, retrying in {:?}",
                        direction, attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        "[{}] Giving up after {} attempts: {}",
                        direction, attempts, e
                    );
                    return Err(CoordinatorError::ReconnectExhausted {
                        direction,
                        attempts,
                    });
                }
            }
        }
    }

    async fn credential_for(&self, fresh: bool) -> CredentialResult<Credential> {
        match self.config.credential_policy {
            CredentialPolicy::PerDirection => self.credentials.issue().await,
            CredentialPolicy::Shared if fresh => self.credentials.refresh().await,
            CredentialPolicy::Shared => self.credentials.get_credential().await,
        }
    }
}

fn session_status(direction: SessionDirection, status: &TransportStatus) -> SessionStatus {
    SessionStatus {
        direction,
        state: SessionState::from(status.state),
        transport: status.transport,
        failed_over: status.failed_over,
        error: status.error.clone(),
    }
}
