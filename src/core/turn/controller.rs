use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::realtime::ServerEvent;
use crate::core::session::{
    CoordinatorError, DirectionalEvent, DualSessionCoordinator, SessionDirection, SessionEvent,
    SessionState, SessionStatus,
};
use crate::core::transport::EVENT_CHANNEL_CAPACITY;

/// Default press duration after which a press counts as a hold.
pub const DEFAULT_HOLD_THRESHOLD: Duration = Duration::from_millis(250);

// =============================================================================
// Types
// =============================================================================

/// Push-to-talk turn state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TurnState {
    #[default]
    Idle,
    Capturing,
    Committed,
    Translating,
    Playing,
}

impl TurnState {
    /// A turn has been committed and not yet finished.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            TurnState::Committed | TurnState::Translating | TurnState::Playing
        )
    }
}

impl std::fmt::Display for TurnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TurnState::Idle => "idle",
            TurnState::Capturing => "capturing",
            TurnState::Committed => "committed",
            TurnState::Translating => "translating",
            TurnState::Playing => "playing",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TurnError {
    #[error("Release without an active capture")]
    CommitWithoutCapture,

    #[error("Turn already committed (state: {0})")]
    DuplicateCommit(TurnState),

    #[error("Provider error during turn: {0}")]
    ProviderErrorMidTurn(String),

    #[error("A turn is already in progress (state: {0})")]
    Busy(TurnState),

    #[error("Not capturing")]
    NotCapturing,

    #[error("Turn cancelled")]
    Cancelled,

    #[error("Session error: {0}")]
    Session(#[from] CoordinatorError),
}

pub type TurnResult<T> = Result<T, TurnError>;

/// Notifications for the UI or whoever drives playback.
#[derive(Debug, Clone)]
pub enum TurnSignal {
    State(TurnState),
    /// The press lasted past the hold threshold.
    Hold(SessionDirection),
    /// The service finished the response; playback may still be running.
    ResponseDone(SessionDirection),
    Error {
        direction: SessionDirection,
        error: TurnError,
    },
}

#[derive(Debug, Clone)]
pub struct TurnOptions {
    pub hold_threshold: Duration,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            hold_threshold: DEFAULT_HOLD_THRESHOLD,
        }
    }
}

// =============================================================================
// Controller
// =============================================================================

#[derive(Debug, Default)]
struct TurnCell {
    state: TurnState,
    direction: Option<SessionDirection>,
    /// Incremented on every press; stale timers and tasks compare against it.
    turn_id: u64,
    /// Why the current turn was abandoned, for a release still in progress.
    failure: Option<TurnError>,
}

struct TurnInner {
    coordinator: DualSessionCoordinator,
    options: TurnOptions,
    cell: Mutex<TurnCell>,
    signals: broadcast::Sender<TurnSignal>,
    listener: Mutex<Option<CancellationToken>>,
}

/// Half-duplex push-to-talk state machine on top of the coordinator.
///
/// ```text
/// idle -press-> capturing -release-> committed -commit sent-> translating
///   ^                                                              |
///   +---- playback complete <---- playing <---- first audio -------+
/// ```
///
/// Only one turn exists at a time, whichever direction it uses.
#[derive(Clone)]
pub struct TurnController {
    inner: Arc<TurnInner>,
}

impl TurnController {
    pub fn new(coordinator: DualSessionCoordinator, options: TurnOptions) -> Self {
        let (signals, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TurnInner {
                coordinator,
                options,
                cell: Mutex::new(TurnCell::default()),
                signals,
                listener: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> TurnState {
        self.inner.cell.lock().state
    }

    /// Direction of the current turn, if any.
    pub fn direction(&self) -> Option<SessionDirection> {
        let cell = self.inner.cell.lock();
        match cell.state {
            TurnState::Idle => None,
            _ => cell.direction,
        }
    }

    pub fn signals(&self) -> broadcast::Receiver<TurnSignal> {
        self.inner.signals.subscribe()
    }

    /// Start listening to the coordinator's events. Called implicitly by
    /// [`press`](Self::press).
    pub fn start(&self) {
        let cancel = {
            let mut listener = self.inner.listener.lock();
            if listener.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            *listener = Some(cancel.clone());
            cancel
        };
        let events = self.inner.coordinator.subscribe();
        let status = self.inner.coordinator.subscribe_status();
        tokio::spawn(Arc::clone(&self.inner).listen(events, status, cancel));
    }

    /// Stop the event listener. The turn state is left as is.
    pub fn shutdown(&self) {
        if let Some(cancel) = self.inner.listener.lock().take() {
            cancel.cancel();
        }
    }

    /// Begin capturing on `direction`.
    pub async fn press(&self, direction: SessionDirection) -> TurnResult<()> {
        self.start();

        let turn_id = {
            let mut cell = self.inner.cell.lock();
            if cell.state != TurnState::Idle {
                return Err(TurnError::Busy(cell.state));
            }
            cell.state = TurnState::Capturing;
            cell.direction = Some(direction);
            cell.turn_id += 1;
            cell.failure = None;
            cell.turn_id
        };

        if let Err(e) = self.inner.coordinator.start_translation(direction).await {
            warn!("[{}] Failed to start capture: {}", direction, e);
            self.inner.reset_to_idle(turn_id);
            return Err(e.into());
        }

        info!("[{}] Turn {} capturing", direction, turn_id);
        self.inner.emit(TurnSignal::State(TurnState::Capturing));
        self.inner.schedule_hold(direction, turn_id);
        Ok(())
    }

    /// Feed captured PCM16 audio into the current turn.
    pub async fn push_audio(&self, pcm: Bytes) -> TurnResult<()> {
        let direction = {
            let cell = self.inner.cell.lock();
            match (cell.state, cell.direction) {
                (TurnState::Capturing, Some(direction)) => direction,
                _ => return Err(TurnError::NotCapturing),
            }
        };
        self.inner.coordinator.send_audio(direction, pcm).await?;
        Ok(())
    }

    /// End capture, commit the turn and request exactly one response.
    pub async fn release(&self) -> TurnResult<()> {
        let (direction, turn_id) = {
            let mut cell = self.inner.cell.lock();
            match cell.state {
                TurnState::Idle => return Err(TurnError::CommitWithoutCapture),
                TurnState::Capturing => {}
                state => {
                    debug!("Release ignored, turn already {}", state);
                    return Err(TurnError::DuplicateCommit(state));
                }
            }
            let Some(direction) = cell.direction else {
                return Err(TurnError::CommitWithoutCapture);
            };
            cell.state = TurnState::Committed;
            (direction, cell.turn_id)
        };
        self.inner.emit(TurnSignal::State(TurnState::Committed));

        let coordinator = &self.inner.coordinator;
        match coordinator.stop_translation().await {
            Ok(_) | Err(CoordinatorError::NoActiveSession) => {}
            Err(e) => warn!("[{}] Failed to stop capture: {}", direction, e),
        }

        if let Err(e) = coordinator.commit_turn(direction).await {
            self.inner.reset_to_idle(turn_id);
            return Err(e.into());
        }

        if !self
            .inner
            .advance(turn_id, TurnState::Committed, TurnState::Translating)
        {
            debug!("[{}] Turn {} ended before translation started", direction, turn_id);
            return Err(self.inner.take_failure(turn_id));
        }

        if let Err(e) = coordinator.request_response(direction).await {
            self.inner.reset_to_idle(turn_id);
            return Err(e.into());
        }
        info!("[{}] Turn {} committed, awaiting translation", direction, turn_id);
        Ok(())
    }

    /// The collaborator finished playing the translated audio.
    ///
    /// Returns whether a playing turn ended.
    pub fn playback_complete(&self) -> bool {
        let turn_id = self.inner.cell.lock().turn_id;
        self.inner
            .advance(turn_id, TurnState::Playing, TurnState::Idle)
    }

    /// Abandon the current turn, whatever its state.
    ///
    /// Audio captured so far is discarded and a pending or playing response
    /// is cancelled on the service. A `release` still in progress returns
    /// [`TurnError::Cancelled`]. Returns whether a turn was abandoned.
    pub async fn cancel(&self) -> bool {
        let (direction, state) = {
            let mut cell = self.inner.cell.lock();
            let state = cell.state;
            let Some(direction) = cell.direction.filter(|_| state != TurnState::Idle) else {
                return false;
            };
            cell.state = TurnState::Idle;
            cell.failure = Some(TurnError::Cancelled);
            (direction, state)
        };
        info!("[{}] Turn cancelled while {}", direction, state);
        self.inner.emit(TurnSignal::State(TurnState::Idle));

        let coordinator = &self.inner.coordinator;
        let result = if state == TurnState::Capturing {
            match coordinator.stop_translation().await {
                Ok(_) | Err(CoordinatorError::NoActiveSession) => {}
                Err(e) => warn!("[{}] Failed to stop capture: {}", direction, e),
            }
            coordinator.clear_input(direction).await
        } else {
            coordinator.cancel_response(direction).await
        };
        if let Err(e) = result {
            warn!("[{}] Cancel not delivered to the service: {}", direction, e);
        }
        true
    }
}

impl TurnInner {
    fn emit(&self, signal: TurnSignal) {
        let _ = self.signals.send(signal);
    }

    /// Move from `from` to `to` if the turn is still `turn_id`.
    fn advance(&self, turn_id: u64, from: TurnState, to: TurnState) -> bool {
        {
            let mut cell = self.cell.lock();
            if cell.turn_id != turn_id || cell.state != from {
                return false;
            }
            cell.state = to;
        }
        debug!("Turn {}: {} -> {}", turn_id, from, to);
        self.emit(TurnSignal::State(to));
        true
    }

    fn reset_to_idle(&self, turn_id: u64) {
        {
            let mut cell = self.cell.lock();
            if cell.turn_id != turn_id || cell.state == TurnState::Idle {
                return;
            }
            cell.state = TurnState::Idle;
        }
        self.emit(TurnSignal::State(TurnState::Idle));
    }

    fn schedule_hold(self: &Arc<Self>, direction: SessionDirection, turn_id: u64) {
        let inner = Arc::clone(self);
        let threshold = self.options.hold_threshold;
        tokio::spawn(async move {
            tokio::time::sleep(threshold).await;
            let still_held = {
                let cell = inner.cell.lock();
                cell.turn_id == turn_id && cell.state == TurnState::Capturing
            };
            if still_held {
                inner.emit(TurnSignal::Hold(direction));
            }
        });
    }

    /// The current turn if it runs on `direction`.
    fn turn_on(&self, direction: SessionDirection) -> Option<(u64, TurnState)> {
        let cell = self.cell.lock();
        (cell.direction == Some(direction) && cell.state != TurnState::Idle)
            .then_some((cell.turn_id, cell.state))
    }

    async fn listen(
        self: Arc<Self>,
        mut events: broadcast::Receiver<DirectionalEvent>,
        mut status: broadcast::Receiver<SessionStatus>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Ok(event) => self.on_event(event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Turn listener lagged, skipped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                update = status.recv() => match update {
                    Ok(update) => self.on_status(update),
                    Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Turn listener stopped");
    }

    fn on_event(&self, event: DirectionalEvent) {
        let Some((turn_id, state)) = self.turn_on(event.direction) else {
            return;
        };

        match event.event {
            SessionEvent::Audio(_) => {
                if state == TurnState::Translating {
                    self.advance(turn_id, TurnState::Translating, TurnState::Playing);
                }
            }
            SessionEvent::Message(ServerEvent::Error { error }) if state.is_in_flight() => {
                warn!("[{}] Provider error mid-turn: {}", event.direction, error);
                self.fail_turn(
                    turn_id,
                    event.direction,
                    TurnError::ProviderErrorMidTurn(error.to_string()),
                );
            }
            SessionEvent::Message(ServerEvent::ResponseDone { .. }) => match state {
                TurnState::Translating => {
                    info!("[{}] Empty translation, turn finished", event.direction);
                    self.advance(turn_id, TurnState::Translating, TurnState::Idle);
                }
                TurnState::Playing => self.emit(TurnSignal::ResponseDone(event.direction)),
                _ => {}
            },
            _ => {}
        }
    }

    /// An in-flight turn cannot survive its session changing underneath it:
    /// the committed audio and pending response live on the old transport.
    fn on_status(&self, status: SessionStatus) {
        if status.state == SessionState::Connected && !status.failed_over {
            return;
        }
        let Some((turn_id, state)) = self.turn_on(status.direction) else {
            return;
        };
        if state.is_in_flight() {
            let reason = match (status.error, status.state) {
                (Some(error), _) => error,
                (None, SessionState::Connected) => {
                    format!("session moved to {} transport", status.transport)
                }
                (None, state) => format!("session {}", state),
            };
            warn!("[{}] Session lost mid-turn: {}", status.direction, reason);
            self.fail_turn(
                turn_id,
                status.direction,
                TurnError::ProviderErrorMidTurn(reason),
            );
        }
    }

    fn fail_turn(&self, turn_id: u64, direction: SessionDirection, error: TurnError) {
        {
            let mut cell = self.cell.lock();
            if cell.turn_id != turn_id || cell.state == TurnState::Idle {
                return;
            }
            cell.state = TurnState::Idle;
            cell.failure = Some(error.clone());
        }
        self.emit(TurnSignal::Error { direction, error });
        self.emit(TurnSignal::State(TurnState::Idle));
    }

    fn take_failure(&self, turn_id: u64) -> TurnError {
        let mut cell = self.cell.lock();
        let failure = if cell.turn_id == turn_id {
            cell.failure.take()
        } else {
            None
        };
        failure.unwrap_or_else(|| {
            TurnError::ProviderErrorMidTurn("turn ended before translation started".to_string())
        })
    }
}
