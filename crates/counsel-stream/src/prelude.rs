//! Common imports for driving a stream from UI code.
pub use crate::{
    AbortHandle, Progress, RenderSnapshot, ResponseDepth, StreamConfig, StreamController,
    StreamError, StreamOutcome, StreamRequest, StreamState, TelemetryId,
};
