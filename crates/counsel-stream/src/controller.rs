use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures::StreamExt as _;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::StreamConfig;
use crate::errors::StreamError;
use crate::model::{StreamState, TelemetryId};
use crate::session::StreamSession;
use crate::stream::{RenderSnapshot, StreamOutcome};
use crate::transport::{HttpTransport, StreamRequest, StreamTransport, delta_stream};

/// Callback invoked once per session that ends in an error.
pub type ErrorCallback = Arc<dyn Fn(&StreamError, &TelemetryId) + Send + Sync>;

/// Handle used to cancel one streaming session.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    /// Requests cancellation.
    ///
    /// The session observes it at its next await point and ends with
    /// `aborted = true`.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

struct ActiveSession {
    telemetry_id: TelemetryId,
    abort: AbortHandle,
}

enum Termination {
    Completed,
    Aborted,
    Failed(StreamError),
}

/// Runs streaming sessions one at a time and publishes what to render.
///
/// Each `stream()` call is a new session with a fresh telemetry id; starting
/// one cancels the session that was in flight. Render state is published as
/// `RenderSnapshot`s, see `subscribe()`.
pub struct StreamController {
    transport: Arc<dyn StreamTransport>,
    config: StreamConfig,
    on_error: Option<ErrorCallback>,
    active: Mutex<Option<ActiveSession>>,
    snapshots: watch::Sender<RenderSnapshot>,
}

impl StreamController {
    /// Creates a controller that streams over HTTP.
    pub fn new(config: StreamConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let transport = HttpTransport::new(&config)?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Creates a controller over a custom transport.
    pub fn with_transport(
        config: StreamConfig,
        transport: Arc<dyn StreamTransport>,
    ) -> Result<Self, StreamError> {
        config.validate()?;
        let (snapshots, _) = watch::channel(RenderSnapshot::default());
        Ok(Self {
            transport,
            config,
            on_error: None,
            active: Mutex::new(None),
            snapshots,
        })
    }

    /// Registers the callback invoked with each terminal error.
    pub fn on_error(
        mut self,
        callback: impl Fn(&StreamError, &TelemetryId) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Receiver that changes after every buffer update and state transition.
    pub fn subscribe(&self) -> watch::Receiver<RenderSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn state(&self) -> StreamState {
        self.snapshots.borrow().state
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Abort handle of the in-flight session, if any.
    pub fn abort_handle(&self) -> Option<AbortHandle> {
        self.lock_active().as_ref().map(|active| active.abort.clone())
    }

    /// Cancels the in-flight session. Returns false if nothing was streaming.
    pub fn cancel(&self) -> bool {
        match self.lock_active().as_ref() {
            Some(active) => {
                debug!(telemetry_id = %active.telemetry_id, "cancel requested");
                active.abort.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels anything in flight and returns to an empty `Idle` snapshot.
    pub fn reset(&self) {
        if let Some(active) = self.lock_active().take() {
            debug!(telemetry_id = %active.telemetry_id, "reset while streaming");
            active.abort.abort();
        }
        self.snapshots.send_replace(RenderSnapshot::default());
    }

    /// Streams one response to its end and returns what was rendered.
    ///
    /// Network, HTTP and framing failures are reported in
    /// `StreamOutcome::error`; cancellation in `StreamOutcome::aborted`. In
    /// both cases `content` holds the partial answer.
    pub async fn stream(&self, request: StreamRequest) -> StreamOutcome {
        let telemetry_id = TelemetryId::generate();
        let (abort, mut abort_rx) = AbortHandle::new();
        self.activate(&telemetry_id, abort.clone());

        let mut session = StreamSession::start(telemetry_id, &self.config);
        self.snapshots.send_replace(session.snapshot());
        debug!(
            telemetry_id = %session.telemetry_id(),
            url = %request.url,
            "starting response stream"
        );

        let failure = match self.drive(&mut session, &request, &mut abort_rx).await {
            Termination::Completed => {
                session.complete();
                debug!(
                    telemetry_id = %session.telemetry_id(),
                    chars = session.content().chars().count(),
                    tokens = session.progress().tokens_streamed,
                    "response stream completed"
                );
                None
            }
            Termination::Aborted => {
                let discarded = session.cancel();
                debug!(
                    telemetry_id = %session.telemetry_id(),
                    discarded,
                    "response stream cancelled"
                );
                None
            }
            Termination::Failed(error) => {
                warn!(
                    telemetry_id = %session.telemetry_id(),
                    error = %error,
                    "response stream failed"
                );
                session.fail(error.clone());
                Some(error)
            }
        };
        self.publish(&session);
        self.deactivate(session.telemetry_id());
        if let (Some(error), Some(callback)) = (&failure, &self.on_error) {
            callback(error, session.telemetry_id());
        }
        drop(abort);
        session.into_outcome()
    }

    async fn drive(
        &self,
        session: &mut StreamSession,
        request: &StreamRequest,
        abort_rx: &mut watch::Receiver<bool>,
    ) -> Termination {
        let open = self.transport.open(request, session.telemetry_id());
        // A server that accepts the connection but never answers counts as idle.
        let open = async {
            match self.config.idle_timeout {
                Some(limit) => tokio::time::timeout(limit, open)
                    .await
                    .unwrap_or_else(|_| Err(StreamError::idle_timeout(limit))),
                None => open.await,
            }
        };
        let bytes = tokio::select! {
            biased;
            _ = aborted(abort_rx) => return Termination::Aborted,
            opened = open => match opened {
                Ok(bytes) => bytes,
                Err(error) => return Termination::Failed(error),
            },
        };

        let mut deltas = std::pin::pin!(delta_stream(
            bytes,
            self.config.idle_timeout,
            self.config.max_line_bytes,
        ));
        let mut frames = tokio::time::interval(self.config.frame_interval);
        frames.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut body_done = false;

        loop {
            // Completion waits for the queue, so nothing received is left unrendered.
            if body_done && !session.has_pending() {
                return Termination::Completed;
            }
            tokio::select! {
                biased;
                _ = aborted(abort_rx) => return Termination::Aborted,
                _ = frames.tick(), if session.tick_scheduled() => {
                    if session.apply_tick(Instant::now()) {
                        self.publish(session);
                    }
                }
                next = deltas.next(), if !body_done => match next {
                    Some(Ok(text)) => session.add_chunk(&text),
                    Some(Err(error)) => return Termination::Failed(error),
                    None => {
                        body_done = true;
                        debug!(
                            telemetry_id = %session.telemetry_id(),
                            pending = session.has_pending(),
                            "response body finished"
                        );
                    }
                },
            }
        }
    }

    /// Publishes `session` unless a newer session or a reset replaced it.
    fn publish(&self, session: &StreamSession) -> bool {
        self.snapshots.send_if_modified(|current| {
            if current.telemetry_id.as_ref() != Some(session.telemetry_id()) {
                return false;
            }
            session.write_snapshot(current);
            true
        })
    }

    fn activate(&self, telemetry_id: &TelemetryId, abort: AbortHandle) {
        let previous = self.lock_active().replace(ActiveSession {
            telemetry_id: telemetry_id.clone(),
            abort,
        });
        if let Some(previous) = previous {
            debug!(
                telemetry_id = %telemetry_id,
                superseded = %previous.telemetry_id,
                "cancelling in-flight stream"
            );
            previous.abort.abort();
        }
    }

    fn deactivate(&self, telemetry_id: &TelemetryId) {
        let mut active = self.lock_active();
        if active
            .as_ref()
            .is_some_and(|current| &current.telemetry_id == telemetry_id)
        {
            *active = None;
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveSession>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Resolves once the session's abort flag is set.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|aborted| *aborted).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}
