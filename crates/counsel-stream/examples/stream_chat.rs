use std::io::Write as _;

use counsel_stream::prelude::*;

/// Streams one answer from `COUNSEL_STREAM_URL` and prints it as it renders.
///
/// `COUNSEL_STREAM_TOKEN` is sent as a bearer token when set; the prompt is
/// taken from the command line.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), StreamError> {
    counsel_stream::init_observability();

    let url = std::env::var("COUNSEL_STREAM_URL")
        .map_err(|_| StreamError::Config("missing COUNSEL_STREAM_URL".into()))?;
    let prompt = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let prompt = if prompt.trim().is_empty() {
        "What is a statute of limitations?".to_string()
    } else {
        prompt
    };

    let config = StreamConfig::from_env()?;
    let controller = StreamController::new(config)?
        .on_error(|error, telemetry_id| eprintln!("\nstream failed: {error} (ref {telemetry_id})"));

    let mut request = StreamRequest::new(url).json_body(serde_json::json!({
        "messages": [{ "role": "user", "content": prompt }],
    }))?;
    if let Ok(token) = std::env::var("COUNSEL_STREAM_TOKEN") {
        request = request.bearer_auth(token);
    }

    let mut snapshots = controller.subscribe();
    let printer = async {
        let mut printed = 0;
        while snapshots.changed().await.is_ok() {
            let snapshot = snapshots.borrow_and_update().clone();
            // Prints growth only; once the cap trims the head the length stops changing.
            let chars = snapshot.content.chars().count();
            if chars > printed {
                let fresh: String = snapshot.content.chars().skip(printed).collect();
                print!("{fresh}");
                let _ = std::io::stdout().flush();
            }
            printed = chars;
            if snapshot.state.is_terminal() {
                break;
            }
        }
    };

    let (outcome, ()) = tokio::join!(controller.stream(request), printer);
    println!();
    if outcome.aborted {
        eprintln!("stream cancelled");
    }
    let progress = controller.snapshot().progress;
    eprintln!(
        "{} fragments, {:.0}% (ref {})",
        progress.tokens_streamed, progress.percent, outcome.telemetry_id
    );
    Ok(())
}
