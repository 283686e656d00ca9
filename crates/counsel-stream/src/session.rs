use std::time::Instant;

use tracing::trace;

use crate::buffer::RenderBuffer;
use crate::config::StreamConfig;
use crate::errors::StreamError;
use crate::model::{StreamState, TelemetryId};
use crate::progress::{Progress, ProgressTracker};
use crate::scheduler::ChunkScheduler;
use crate::stream::{RenderSnapshot, StreamOutcome};

/// State owned by one `stream()` call: buffer, pending queue, progress and
/// the terminal result.
///
/// All mutators are no-ops once the session reached a terminal state.
#[derive(Debug)]
pub(crate) struct StreamSession {
    telemetry_id: TelemetryId,
    state: StreamState,
    buffer: RenderBuffer,
    scheduler: ChunkScheduler,
    progress: ProgressTracker,
    error: Option<StreamError>,
}

impl StreamSession {
    pub fn start(telemetry_id: TelemetryId, config: &StreamConfig) -> Self {
        Self {
            telemetry_id,
            state: StreamState::Streaming,
            buffer: RenderBuffer::new(config.max_buffer_size),
            scheduler: ChunkScheduler::new(config.chunk_size, config.batch_size),
            progress: ProgressTracker::new(config.estimated_total_tokens),
            error: None,
        }
    }

    pub fn telemetry_id(&self) -> &TelemetryId {
        &self.telemetry_id
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Queues one delta from the transport.
    pub fn add_chunk(&mut self, text: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.progress.record_fragment();
        self.scheduler.add_chunk(text);
    }

    pub fn tick_scheduled(&self) -> bool {
        !self.state.is_terminal() && self.scheduler.tick_scheduled()
    }

    pub fn has_pending(&self) -> bool {
        !self.scheduler.is_idle()
    }

    /// Applies one batch to the buffer and refreshes progress.
    ///
    /// Returns false if nothing was applied.
    pub fn apply_tick(&mut self, now: Instant) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        let Some(batch) = self.scheduler.tick() else {
            return false;
        };
        let dropped = self.buffer.append(&batch);
        let progress = self.progress.recompute(now);
        trace!(
            telemetry_id = %self.telemetry_id,
            applied_chars = batch.len(),
            dropped_chars = dropped,
            pending = self.scheduler.pending(),
            tokens = progress.tokens_streamed,
            "applied render batch"
        );
        true
    }

    pub fn complete(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        self.progress.complete();
        self.state = StreamState::Completed;
    }

    /// Stops at once; queued but unapplied fragments are discarded.
    pub fn cancel(&mut self) -> usize {
        if self.state.is_terminal() {
            return 0;
        }
        self.state = StreamState::Cancelled;
        self.scheduler.halt()
    }

    /// Records a terminal error. Fragments already received are applied
    /// first so the partial answer is not lost.
    pub fn fail(&mut self, error: StreamError) {
        if self.state.is_terminal() {
            return;
        }
        while let Some(batch) = self.scheduler.tick() {
            self.buffer.append(&batch);
        }
        self.progress.recompute(Instant::now());
        self.error = Some(error);
        self.state = StreamState::Errored;
    }

    pub fn progress(&self) -> Progress {
        self.progress.current()
    }

    pub fn content(&self) -> &str {
        self.buffer.as_str()
    }

    pub fn snapshot(&self) -> RenderSnapshot {
        RenderSnapshot {
            telemetry_id: Some(self.telemetry_id.clone()),
            state: self.state,
            content: self.buffer.as_str().to_string(),
            progress: self.progress.current(),
            error: self.error.clone(),
        }
    }

    /// Writes the session into `snapshot`, reusing its content allocation.
    pub fn write_snapshot(&self, snapshot: &mut RenderSnapshot) {
        if snapshot.telemetry_id.as_ref() != Some(&self.telemetry_id) {
            snapshot.telemetry_id = Some(self.telemetry_id.clone());
        }
        snapshot.state = self.state;
        snapshot.content.clear();
        snapshot.content.push_str(self.buffer.as_str());
        snapshot.progress = self.progress.current();
        snapshot.error.clone_from(&self.error);
    }

    pub fn into_outcome(self) -> StreamOutcome {
        StreamOutcome {
            aborted: self.state == StreamState::Cancelled,
            content: self.buffer.into_string(),
            telemetry_id: self.telemetry_id,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(config: StreamConfig) -> StreamSession {
        StreamSession::start(TelemetryId::generate(), &config)
    }

    fn drain(session: &mut StreamSession) {
        while session.tick_scheduled() {
            session.apply_tick(Instant::now());
        }
    }

    #[test]
    fn applied_content_is_fifo_concatenation() {
        let mut s = session(StreamConfig::default().chunk_size(2).batch_size(3));
        for delta in ["Hello", " ", "world"] {
            s.add_chunk(delta);
        }
        drain(&mut s);
        s.complete();
        assert_eq!(s.content(), "Hello world");
        assert_eq!(s.progress().tokens_streamed, 3);
        assert!((s.progress().percent - 100.0).abs() < f64::EPSILON);
        let outcome = s.into_outcome();
        assert!(outcome.is_success());
    }

    #[test]
    fn cancel_keeps_only_drained_content() {
        let mut s = session(StreamConfig::default().batch_size(1));
        s.add_chunk("kept");
        s.add_chunk("lost");
        assert!(s.apply_tick(Instant::now()));
        assert_eq!(s.cancel(), 1);
        assert!(!s.apply_tick(Instant::now()));
        s.add_chunk("ignored");
        let outcome = s.into_outcome();
        assert!(outcome.aborted);
        assert_eq!(outcome.content, "kept");
    }

    #[test]
    fn terminal_state_is_sticky() {
        let mut s = session(StreamConfig::default());
        s.fail(StreamError::NoResponseBody);
        s.complete();
        s.cancel();
        assert_eq!(s.state(), StreamState::Errored);
        let snapshot = s.snapshot();
        assert_eq!(snapshot.error, Some(StreamError::NoResponseBody));
        let outcome = s.into_outcome();
        assert!(!outcome.aborted);
        assert_eq!(outcome.error, Some(StreamError::NoResponseBody));
    }

    #[test]
    fn percent_stays_below_full_until_complete() {
        let mut s = session(StreamConfig::default().estimated_total_tokens(2));
        let mut last = 0.0;
        for _ in 0..10 {
            s.add_chunk("x");
            drain(&mut s);
            let percent = s.progress().percent;
            assert!(percent >= last);
            assert!(percent <= 95.0);
            last = percent;
        }
        s.complete();
        assert!((s.progress().percent - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn fail_flushes_received_fragments() {
        let mut s = session(StreamConfig::default().batch_size(1));
        s.add_chunk("first ");
        s.add_chunk("second");
        s.fail(StreamError::transport("connection reset"));
        assert_eq!(s.content(), "first second");
        assert_eq!(s.state(), StreamState::Errored);
        assert!(!s.has_pending());
    }

    #[test]
    fn write_snapshot_matches_snapshot() {
        let mut s = session(StreamConfig::default());
        s.add_chunk("abc");
        drain(&mut s);
        let mut published = RenderSnapshot::default();
        s.write_snapshot(&mut published);
        assert_eq!(published, s.snapshot());
    }
}
