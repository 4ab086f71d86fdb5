//! Primary/fallback transport management with one-shot failover.
//!
//! A manager owns at most one active transport. Every event the transport
//! publishes goes through a single forwarder task, which also watches for
//! connection loss:
//!
//! - peer loss → failover to the stream transport, at most once per
//!   connection sequence
//! - stream loss → terminal `failed` state; recovery belongs to the owner

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::base::{
    AudioChunk, DEFAULT_CLOSE_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport, TransportError,
    TransportEvent, TransportResult, TransportState, TransportType,
};
use super::factory::TransportFactory;
use crate::core::credentials::{Credential, CredentialResult, CredentialSource};
use crate::core::realtime::{ClientEvent, ServerEvent, SessionConfig};

// =============================================================================
// Types
// =============================================================================

/// How the manager obtains the fresh credential used for failover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailoverCredential {
    /// Mint a private credential (`CredentialSource::issue`).
    #[default]
    Issue,
    /// Refresh the shared cached credential (`CredentialSource::refresh`).
    Refresh,
}

/// Snapshot of a manager's connection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransportStatus {
    pub state: TransportState,
    pub transport: TransportType,
    pub failed_over: bool,
    pub error: Option<String>,
}

/// Unified event stream of a manager.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    Message(ServerEvent),
    Audio(AudioChunk),
    Status(TransportStatus),
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Label used in logs (e.g. the session direction).
    pub label: String,
    pub close_timeout: Duration,
    pub failover_credential: FailoverCredential,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            label: "session".to_string(),
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            failover_credential: FailoverCredential::default(),
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

struct ManagerInner {
    factory: Arc<dyn TransportFactory>,
    credentials: Arc<dyn CredentialSource>,
    options: ManagerOptions,
    active: RwLock<Option<Arc<dyn Transport>>>,
    status: RwLock<TransportStatus>,
    session_config: RwLock<Option<SessionConfig>>,
    forwarder: Mutex<Option<CancellationToken>>,
    failover_in_flight: AtomicBool,
    closed: AtomicBool,
    events: broadcast::Sender<ManagerEvent>,
}

/// Connects one logical session over the peer or stream transport.
///
/// Cheap to clone; clones share the same connection.
#[derive(Clone)]
pub struct TransportManager {
    inner: Arc<ManagerInner>,
}

impl TransportManager {
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        credentials: Arc<dyn CredentialSource>,
        options: ManagerOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ManagerInner {
                factory,
                credentials,
                options,
                active: RwLock::new(None),
                status: RwLock::new(TransportStatus::default()),
                session_config: RwLock::new(None),
                forwarder: Mutex::new(None),
                failover_in_flight: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Connect the preferred transport, falling back to the other one.
    ///
    /// Any existing transport is torn down first. Returns the kind that
    /// connected.
    pub async fn connect(
        &self,
        credential: &Credential,
        prefer_stream: bool,
    ) -> TransportResult<TransportType> {
        let inner = &self.inner;
        inner.closed.store(false, Ordering::SeqCst);
        inner.teardown().await;

        {
            let mut status = inner.status.write();
            status.failed_over = false;
        }
        inner.set_status(TransportState::Connecting, TransportType::None, None);

        let primary = if prefer_stream {
            TransportType::Stream
        } else {
            TransportType::Peer
        };
        let fallback = primary.alternate();

        let primary_error = match inner.try_connect(primary, credential).await {
            Ok((transport, rx)) => return inner.activate(transport, rx).await,
            Err(e) => e,
        };
        if inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        warn!(
            "[{}] {} transport failed ({}), trying {}",
            inner.options.label, primary, primary_error, fallback
        );

        match inner.try_connect(fallback, credential).await {
            Ok((transport, rx)) => inner.activate(transport, rx).await,
            Err(fallback_error) => {
                let err = TransportError::CompoundFailure {
                    primary,
                    primary_error: primary_error.to_string(),
                    fallback,
                    fallback_error: fallback_error.to_string(),
                };
                error!("[{}] {}", inner.options.label, err);
                inner.set_status(
                    TransportState::Failed,
                    TransportType::None,
                    Some(err.to_string()),
                );
                Err(err)
            }
        }
    }

    /// Store the direction's session configuration and push it to the active
    /// transport. It is re-sent after every (re)connection.
    pub async fn set_session_config(&self, config: SessionConfig) -> TransportResult<()> {
        *self.inner.session_config.write() = Some(config.clone());
        match self.inner.active_transport() {
            Some(transport) if transport.state() == TransportState::Connected => {
                transport
                    .send_message(ClientEvent::SessionUpdate { session: config })
                    .await
            }
            _ => Ok(()),
        }
    }

    pub fn session_config(&self) -> Option<SessionConfig> {
        self.inner.session_config.read().clone()
    }

    pub async fn send_message(&self, event: ClientEvent) -> TransportResult<()> {
        self.inner.require_active()?.send_message(event).await
    }

    pub async fn send_audio(&self, pcm: Bytes) -> TransportResult<()> {
        self.inner.require_active()?.send_audio(pcm).await
    }

    pub async fn commit_turn(&self) -> TransportResult<()> {
        self.inner.require_active()?.commit_turn().await
    }

    pub async fn start_capture(&self) -> TransportResult<()> {
        self.inner.require_active()?.start_capture().await
    }

    pub async fn stop_capture(&self) -> TransportResult<()> {
        self.inner.require_active()?.stop_capture().await
    }

    /// Manual transport switching.
    pub async fn switch_transport(&self, kind: TransportType) -> TransportResult<()> {
        debug!(
            "[{}] switch_transport({}) requested",
            self.inner.options.label, kind
        );
        Err(TransportError::Unsupported(
            "Manual transport switching".to_string(),
        ))
    }

    /// Fail over from the peer transport to the stream transport.
    ///
    /// Runs at most once at a time; triggers while one is in flight, or when
    /// the active transport is not the peer transport, are no-ops.
    pub async fn fail_over(&self) -> TransportResult<()> {
        self.inner.fail_over("requested").await
    }

    /// Put the manager into the terminal `failed` state without reconnecting.
    pub async fn mark_failed(&self, reason: impl Into<String>) {
        self.inner.teardown().await;
        self.inner
            .set_status(TransportState::Failed, TransportType::None, Some(reason.into()));
    }

    /// Close the active transport. Idempotent.
    pub async fn close(&self) -> TransportResult<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) && inner.active_transport().is_none() {
            return Ok(());
        }
        inner.teardown().await;
        inner.set_status(TransportState::Disconnected, TransportType::None, None);
        info!("[{}] Transport manager closed", inner.options.label);
        Ok(())
    }

    pub fn state(&self) -> TransportState {
        self.inner.status.read().state
    }

    pub fn status(&self) -> TransportStatus {
        self.inner.status.read().clone()
    }

    pub fn active_transport(&self) -> TransportType {
        self.inner.status.read().transport
    }

    pub fn failed_over(&self) -> bool {
        self.inner.status.read().failed_over
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }
}

impl ManagerInner {
    fn active_transport(&self) -> Option<Arc<dyn Transport>> {
        self.active.read().clone()
    }

    fn require_active(&self) -> TransportResult<Arc<dyn Transport>> {
        self.active_transport().ok_or(TransportError::NotConnected)
    }

    fn set_status(&self, state: TransportState, transport: TransportType, error: Option<String>) {
        let snapshot = {
            let mut status = self.status.write();
            if status.state == state && status.transport == transport && status.error == error {
                return;
            }
            status.state = state;
            status.transport = transport;
            status.error = error;
            status.clone()
        };
        debug!(
            "[{}] status: {} via {} (failed_over={})",
            self.options.label, snapshot.state, snapshot.transport, snapshot.failed_over
        );
        let _ = self.events.send(ManagerEvent::Status(snapshot));
    }

    /// Create and connect one transport. The event receiver is taken before
    /// connecting so nothing published during the handshake is missed.
    async fn try_connect(
        &self,
        kind: TransportType,
        credential: &Credential,
    ) -> TransportResult<(Arc<dyn Transport>, broadcast::Receiver<TransportEvent>)> {
        let transport = self.factory.create(kind)?;
        let rx = transport.subscribe();
        match transport.connect(credential).await {
            Ok(()) => Ok((transport, rx)),
            Err(e) => {
                let _ = timeout(self.options.close_timeout, transport.close()).await;
                Err(e)
            }
        }
    }

    /// Install a freshly connected transport unless the manager was closed
    /// while it was connecting.
    async fn activate(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        rx: broadcast::Receiver<TransportEvent>,
    ) -> TransportResult<TransportType> {
        let kind = transport.transport_type();
        if self.closed.load(Ordering::SeqCst) {
            debug!(
                "[{}] Closed while connecting, dropping {} transport",
                self.options.label, kind
            );
            let _ = timeout(self.options.close_timeout, transport.close()).await;
            return Err(TransportError::Closed);
        }

        self.install(transport, rx).await;

        // close() may have torn down before this transport became active
        if self.closed.load(Ordering::SeqCst) {
            self.teardown().await;
            self.set_status(TransportState::Disconnected, TransportType::None, None);
            return Err(TransportError::Closed);
        }
        Ok(kind)
    }

    /// Make `transport` active, start its forwarder and push the session config.
    async fn install(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        rx: broadcast::Receiver<TransportEvent>,
    ) {
        let kind = transport.transport_type();
        let cancel = CancellationToken::new();
        if let Some(previous) = self.forwarder.lock().replace(cancel.clone()) {
            previous.cancel();
        }
        *self.active.write() = Some(transport.clone());
        self.spawn_forwarder(kind, rx, cancel);

        let config = self.session_config.read().clone();
        if let Some(session) = config
            && let Err(e) = transport
                .send_message(ClientEvent::SessionUpdate { session })
                .await
        {
            warn!(
                "[{}] Failed to send session.update after connect: {}",
                self.options.label, e
            );
        }

        self.set_status(TransportState::Connected, kind, None);
        info!("[{}] Connected via {} transport", self.options.label, kind);
    }

    fn spawn_forwarder(
        self: &Arc<Self>,
        kind: TransportType,
        mut rx: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => event,
                };
                match event {
                    Ok(TransportEvent::Message(message)) => {
                        let _ = inner.events.send(ManagerEvent::Message(message));
                    }
                    Ok(TransportEvent::Audio(chunk)) => {
                        let _ = inner.events.send(ManagerEvent::Audio(chunk));
                    }
                    Ok(TransportEvent::State(state)) if state.is_loss() => {
                        if !cancel.is_cancelled() {
                            inner.on_transport_lost(kind, state).await;
                        }
                        break;
                    }
                    Ok(TransportEvent::State(_)) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            "[{}] Forwarder lagged, skipped {} events",
                            inner.options.label, skipped
                        );
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    async fn on_transport_lost(self: &Arc<Self>, kind: TransportType, state: TransportState) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match kind {
            TransportType::Peer => {
                warn!(
                    "[{}] Peer transport lost ({}), failing over",
                    self.options.label, state
                );
                let _ = self.fail_over("peer transport lost").await;
            }
            _ => {
                error!(
                    "[{}] {} transport lost ({}), no further automatic recovery",
                    self.options.label, kind, state
                );
                self.teardown().await;
                self.set_status(
                    TransportState::Failed,
                    TransportType::None,
                    Some(format!("{kind} transport {state}")),
                );
            }
        }
    }

    async fn fail_over(self: &Arc<Self>, reason: &str) -> TransportResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let is_peer = self
            .active_transport()
            .is_some_and(|t| t.transport_type() == TransportType::Peer);
        if !is_peer {
            debug!(
                "[{}] Failover ignored, peer transport is not active",
                self.options.label
            );
            return Ok(());
        }
        if self
            .failover_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("[{}] Failover already in progress", self.options.label);
            return Ok(());
        }

        info!("[{}] Failing over to stream transport: {}", self.options.label, reason);
        let result = self.run_failover().await;
        self.failover_in_flight.store(false, Ordering::SeqCst);

        if let Err(e) = &result
            && !matches!(e, TransportError::Closed)
        {
            error!("[{}] Failover failed: {}", self.options.label, e);
            self.teardown().await;
            self.set_status(TransportState::Failed, TransportType::None, Some(e.to_string()));
        }
        result
    }

    async fn run_failover(self: &Arc<Self>) -> TransportResult<()> {
        self.set_status(TransportState::Connecting, TransportType::Peer, None);

        let credential = self.fresh_credential().await?;
        let (stream, rx) = self.try_connect(TransportType::Stream, &credential).await?;

        // Only now release the failed peer transport
        if let Some(previous) = self.forwarder.lock().take() {
            previous.cancel();
        }
        let old = self.active.write().take();
        if let Some(old) = old {
            let _ = timeout(self.options.close_timeout, old.close()).await;
        }

        self.status.write().failed_over = true;
        self.activate(stream, rx).await.map(|_| ())
    }

    async fn fresh_credential(&self) -> CredentialResult<Credential> {
        match self.options.failover_credential {
            FailoverCredential::Issue => self.credentials.issue().await,
            FailoverCredential::Refresh => self.credentials.refresh().await,
        }
    }

    /// Cancel the forwarder and close the active transport, bounded.
    async fn teardown(&self) {
        if let Some(cancel) = self.forwarder.lock().take() {
            cancel.cancel();
        }
        let active = self.active.write().take();
        if let Some(transport) = active {
            match timeout(self.options.close_timeout, transport.close()).await {
                Ok(Err(e)) => warn!("[{}] Error closing transport: {}", self.options.label, e),
                Err(_) => warn!("[{}] Transport close timed out", self.options.label),
                Ok(Ok(())) => {}
            }
        }
    }
}
