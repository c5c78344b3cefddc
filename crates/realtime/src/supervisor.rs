//! Reconnection supervisor: runs sessions back to back until asked to stop.

use std::sync::Arc;
use std::time::Duration;

use crate::device::AudioSystem;
use crate::notify::Notifier;
use crate::session::{self, SessionOutcome};
use crate::state::SharedState;
use crate::transport::Connector;

const PEER_CLOSED_DELAY: Duration = Duration::from_secs(3);
const FAILURE_DELAY: Duration = Duration::from_secs(5);
const CLEAN_DELAY: Duration = Duration::from_millis(300);

fn retry_delay(outcome: SessionOutcome) -> Duration {
    match outcome {
        SessionOutcome::PeerClosed => PEER_CLOSED_DELAY,
        SessionOutcome::Failed => FAILURE_DELAY,
        SessionOutcome::Clean => CLEAN_DELAY,
    }
}

/// Drives session attempts until the stop flag is raised. Every wait races
/// the stop signal, so `stop()` is observed promptly even mid-backoff.
pub(crate) async fn run(
    shared: Arc<SharedState>,
    notifier: Notifier,
    connector: Arc<dyn Connector>,
    audio: Arc<dyn AudioSystem>,
) {
    let mut stop_rx = shared.stop_rx();
    while !shared.stop_requested() {
        let outcome = session::run_session(&shared, &notifier, &connector, &audio).await;
        if shared.stop_requested() {
            break;
        }

        match outcome {
            SessionOutcome::PeerClosed => {
                notifier.status("Connection closed by server. Reconnecting in 3 s...");
            }
            SessionOutcome::Failed => {
                tracing::warn!("session failed; retrying in 5 s");
            }
            SessionOutcome::Clean => {}
        }

        tokio::select! {
            () = tokio::time::sleep(retry_delay(outcome)) => {}
            _ = stop_rx.changed() => {}
        }
    }
    tracing::info!("supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_follow_outcome_classification() {
        assert_eq!(retry_delay(SessionOutcome::PeerClosed), PEER_CLOSED_DELAY);
        assert_eq!(retry_delay(SessionOutcome::Failed), FAILURE_DELAY);
        assert_eq!(retry_delay(SessionOutcome::Clean), CLEAN_DELAY);
    }
}
