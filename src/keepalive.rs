use crate::signaling::SignalingChannel;
use callcore::types::SignalingMessage;
use log::{debug, warn};
use std::sync::Arc;

impl SignalingChannel {
    /// Sends a single keepalive ping. Returns false if it could not be sent.
    async fn send_keepalive(&self) -> bool {
        if !self.is_open() {
            return false;
        }

        debug!(target: "Signaling/Keepalive", "Sending keepalive ping");
        match self.send(&SignalingMessage::Ping).await {
            Ok(()) => {
                let mut state = self.keepalive.lock().await;
                if state.awaiting_pong_since.is_none() {
                    state.awaiting_pong_since = Some(chrono::Utc::now());
                }
                true
            }
            Err(e) => {
                warn!(target: "Signaling/Keepalive", "Keepalive ping failed: {e}");
                false
            }
        }
    }

    /// Whether the oldest unanswered ping is older than `pong_timeout`.
    async fn pong_overdue(&self) -> bool {
        let Some(timeout) = self.options.pong_timeout else {
            return false;
        };
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return false;
        };
        let state = self.keepalive.lock().await;
        state
            .awaiting_pong_since
            .is_some_and(|since| chrono::Utc::now().signed_duration_since(since) > timeout)
    }

    /// Runs for the lifetime of one connection; the run loop aborts it when
    /// the connection ends.
    pub(crate) async fn keepalive_loop(self: Arc<Self>) {
        let interval = self.options.keepalive_interval;
        loop {
            tokio::time::sleep(interval).await;
            if !self.is_open() {
                debug!(target: "Signaling/Keepalive", "Not connected, exiting keepalive loop.");
                return;
            }

            if self.pong_overdue().await {
                warn!(
                    target: "Signaling/Keepalive",
                    "No pong for session {} within {:?}, forcing reconnect.",
                    self.session_id(),
                    self.options.pong_timeout
                );
                self.force_reconnect();
                return;
            }

            self.send_keepalive().await;
        }
    }
}
