//! Scripted transports and credential sources
//!
//! The manager, coordinator and turn tests drive these instead of real
//! network connections:
//! - `MockFactory` hands out `MockTransport`s and decides per kind whether
//!   their `connect` succeeds, fails or stalls
//! - `MockTransport` records everything sent through it and lets tests inject
//!   inbound events and connection loss
//! - `MockCredentials` counts issue/refresh calls and can be told to fail

// Not every test binary uses every helper
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use time::OffsetDateTime;
use tokio::sync::broadcast;

use parli_realtime::core::credentials::{
    Credential, CredentialError, CredentialResult, CredentialSource,
};
use parli_realtime::core::realtime::{ClientEvent, ResponseInfo, ServerEvent, SessionInfo};
use parli_realtime::core::transport::{
    AudioChunk, Transport, TransportError, TransportEvent, TransportEventHub, TransportFactory,
    TransportResult, TransportState, TransportType,
};

// =============================================================================
// Transport
// =============================================================================

/// What a transport does when asked to connect.
#[derive(Debug, Clone)]
pub enum ConnectPlan {
    Succeed,
    Fail(String),
    /// Wait, then succeed.
    Delay(Duration),
}

pub struct MockTransport {
    kind: TransportType,
    plan: ConnectPlan,
    hub: TransportEventHub,
    pub tokens: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<ClientEvent>>,
    pub audio_bytes: AtomicUsize,
    pub commits: AtomicUsize,
    pub capture_starts: AtomicUsize,
    pub capture_stops: AtomicUsize,
    pub closes: AtomicUsize,
    /// Holds `commit_turn` open for this long before it completes.
    pub commit_delay: Mutex<Option<Duration>>,
}

impl MockTransport {
    pub fn new(kind: TransportType, plan: ConnectPlan) -> Self {
        Self {
            kind,
            plan,
            hub: TransportEventHub::new(),
            tokens: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            audio_bytes: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            capture_starts: AtomicUsize::new(0),
            capture_stops: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            commit_delay: Mutex::new(None),
        }
    }

    /// Simulate the connection dropping.
    pub fn lose(&self, state: TransportState) {
        self.hub.set_state(state);
    }

    /// Publish an inbound protocol event.
    pub fn inject(&self, event: ServerEvent) {
        self.hub.publish(TransportEvent::Message(event));
    }

    /// Publish a decoded audio chunk.
    pub fn inject_audio(&self, len: usize) {
        self.hub.publish(TransportEvent::Audio(AudioChunk {
            data: Bytes::from(vec![0u8; len]),
            sample_rate: 16_000,
            response_id: Some("resp_1".to_string()),
        }));
    }

    pub fn inject_response_done(&self) {
        self.inject(ServerEvent::ResponseDone {
            response: ResponseInfo {
                id: "resp_1".to_string(),
                status: "completed".to_string(),
            },
        });
    }

    /// Event types sent so far, in order.
    pub fn sent_types(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|e| e.event_type()).collect()
    }

    pub fn count_sent(&self, event_type: &str) -> usize {
        self.sent_types().iter().filter(|t| **t == event_type).count()
    }

    fn require_connected(&self) -> TransportResult<()> {
        if self.hub.state() == TransportState::Connected {
            Ok(())
        } else {
            Err(TransportError::NotConnected)
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn transport_type(&self) -> TransportType {
        self.kind
    }

    async fn connect(&self, credential: &Credential) -> TransportResult<()> {
        self.tokens.lock().push(credential.token().to_string());
        self.hub.set_state(TransportState::Connecting);
        match &self.plan {
            ConnectPlan::Fail(reason) => {
                self.hub.set_state(TransportState::Failed);
                return Err(TransportError::connect(self.kind, reason));
            }
            ConnectPlan::Delay(delay) => tokio::time::sleep(*delay).await,
            ConnectPlan::Succeed => {}
        }
        self.inject(ServerEvent::SessionCreated {
            session: SessionInfo {
                id: format!("sess_{}", self.kind),
                ..SessionInfo::default()
            },
        });
        self.hub.set_state(TransportState::Connected);
        Ok(())
    }

    async fn send_message(&self, event: ClientEvent) -> TransportResult<()> {
        self.require_connected()?;
        self.sent.lock().push(event);
        Ok(())
    }

    async fn send_audio(&self, pcm: Bytes) -> TransportResult<()> {
        self.require_connected()?;
        self.audio_bytes.fetch_add(pcm.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn commit_turn(&self) -> TransportResult<()> {
        self.require_connected()?;
        let delay = *self.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start_capture(&self) -> TransportResult<()> {
        self.require_connected()?;
        self.capture_starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop_capture(&self) -> TransportResult<()> {
        self.capture_stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.hub.set_state(TransportState::Disconnected);
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.hub.state()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.hub.subscribe()
    }
}

// =============================================================================
// Factory
// =============================================================================

/// Hands out scripted transports and keeps every one it created.
#[derive(Default)]
pub struct MockFactory {
    default_plans: Mutex<HashMap<TransportType, ConnectPlan>>,
    queued_plans: Mutex<HashMap<TransportType, VecDeque<ConnectPlan>>>,
    created: Mutex<Vec<Arc<MockTransport>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Both kinds connect successfully.
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Plan used for every transport of `kind` unless one is queued.
    pub fn set_plan(&self, kind: TransportType, plan: ConnectPlan) {
        self.default_plans.lock().insert(kind, plan);
    }

    /// Plan for the next transport of `kind` only.
    pub fn queue_plan(&self, kind: TransportType, plan: ConnectPlan) {
        self.queued_plans
            .lock()
            .entry(kind)
            .or_default()
            .push_back(plan);
    }

    pub fn created(&self, kind: TransportType) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.kind == kind)
            .cloned()
            .collect()
    }

    pub fn created_count(&self, kind: TransportType) -> usize {
        self.created(kind).len()
    }

    pub fn total_created(&self) -> usize {
        self.created.lock().len()
    }

    /// Most recently created transport of `kind`.
    pub fn last(&self, kind: TransportType) -> Option<Arc<MockTransport>> {
        self.created(kind).pop()
    }

    /// Transport created most recently whose connect succeeded.
    pub fn last_connected(&self, kind: TransportType) -> Option<Arc<MockTransport>> {
        self.created(kind)
            .into_iter()
            .rev()
            .find(|t| t.state() == TransportState::Connected)
    }
}

impl TransportFactory for MockFactory {
    fn create(&self, kind: TransportType) -> TransportResult<Arc<dyn Transport>> {
        if kind == TransportType::None {
            return Err(TransportError::Unsupported("none".to_string()));
        }
        let queued = self
            .queued_plans
            .lock()
            .get_mut(&kind)
            .and_then(|q| q.pop_front());
        let plan = queued
            .or_else(|| self.default_plans.lock().get(&kind).cloned())
            .unwrap_or(ConnectPlan::Succeed);

        let transport = Arc::new(MockTransport::new(kind, plan));
        self.created.lock().push(transport.clone());
        Ok(transport)
    }
}

// =============================================================================
// Credentials
// =============================================================================

#[derive(Default)]
pub struct MockCredentials {
    pub issued: AtomicUsize,
    pub refreshed: AtomicUsize,
    pub fetched: AtomicUsize,
    pub cleared: AtomicUsize,
    pub fail: AtomicBool,
}

impl MockCredentials {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn mint(&self, label: &str, n: usize) -> CredentialResult<Credential> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CredentialError::server("token service unavailable"));
        }
        Ok(Credential::new(
            format!("{label}-{n}"),
            "ephemeral",
            OffsetDateTime::now_utc() + time::Duration::minutes(5),
        ))
    }
}

#[async_trait]
impl CredentialSource for MockCredentials {
    async fn get_credential(&self) -> CredentialResult<Credential> {
        let n = self.fetched.fetch_add(1, Ordering::SeqCst) + 1;
        self.mint("shared", n)
    }

    async fn refresh(&self) -> CredentialResult<Credential> {
        let n = self.refreshed.fetch_add(1, Ordering::SeqCst) + 1;
        self.mint("refreshed", n)
    }

    async fn issue(&self) -> CredentialResult<Credential> {
        let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        self.mint("issued", n)
    }

    async fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

// =============================================================================
// Helpers
// =============================================================================

pub fn test_credential(token: &str) -> Credential {
    Credential::new(
        token,
        "ephemeral",
        OffsetDateTime::now_utc() + time::Duration::minutes(5),
    )
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
