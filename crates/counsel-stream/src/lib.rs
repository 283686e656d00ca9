//! Incremental rendering of streamed chat answers.
//!
//! A `StreamController` posts a request to an SSE endpoint that speaks the
//! OpenAI chat-completion streaming format, queues each content delta, and
//! applies the queue to a capped text buffer a few fragments per frame tick.
//! UIs watch `RenderSnapshot`s; the final `StreamOutcome` always carries the
//! content rendered so far, even after an error or a cancel.
//!
//! ```no_run
//! use counsel_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let controller = StreamController::new(StreamConfig::for_depth(ResponseDepth::Quick))?
//!     .on_error(|error, telemetry_id| eprintln!("[{telemetry_id}] {error}"));
//!
//! let request = StreamRequest::new("https://example.invalid/functions/v1/chat")
//!     .json_body(serde_json::json!({"messages": [{"role": "user", "content": "Hi"}]}))?
//!     .bearer_auth("token");
//!
//! let outcome = controller.stream(request).await;
//! println!("{}", outcome.content);
//! # Ok(())
//! # }
//! ```

/// Capped text buffer.
pub mod buffer;
/// Controller configuration and response depth presets.
pub mod config;
/// Session lifecycle, cancellation and snapshot publishing.
pub mod controller;
/// Error type shared by every stage.
pub mod errors;
/// Session identifiers and states.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Percent and ETA estimates.
pub mod progress;
/// Frame-paced fragment queue.
pub mod scheduler;
mod session;
/// Snapshot and outcome types handed to the UI.
pub mod stream;
/// HTTP request, byte stream and SSE decoding.
pub mod transport;

pub use buffer::RenderBuffer;
pub use config::{ResponseDepth, StreamConfig};
pub use controller::{AbortHandle, ErrorCallback, StreamController};
pub use errors::StreamError;
pub use model::{StreamState, TelemetryId};
pub use observability::init_observability;
pub use progress::Progress;
pub use scheduler::ChunkScheduler;
pub use stream::{RenderSnapshot, StreamOutcome};
pub use transport::{ByteStream, HttpTransport, StreamRequest, StreamTransport};
