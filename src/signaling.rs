//! Auto-reconnecting signaling channel for one session.
//!
//! A channel is opened for a single session id and is never reused: after
//! [`SignalingChannel::close`] or a spent reconnect budget it stays dead and
//! the controller opens a new one for the next session.

use crate::auth::CredentialProvider;
use callcore::backoff::{Backoff, ReconnectConfig};
use callcore::net::{Transport, TransportEvent, TransportFactory};
use callcore::types::SignalingMessage;
use chrono::{DateTime, Utc};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, mpsc};

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Everything the channel reports to its owner, in receipt order.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Open,
    Message(SignalingMessage),
    Closed { code: Option<u16> },
    Error(String),
    /// The reconnect budget is spent; the channel has stopped.
    RetriesExhausted,
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling channel is not connected")]
    NotConnected,
    #[error("signaling channel is closed")]
    Closed,
    #[error("no access token for signaling")]
    MissingToken,
    #[error("connection attempt timed out")]
    Timeout,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone)]
pub struct SignalingOptions {
    pub reconnect: ReconnectConfig,
    pub keepalive_interval: Duration,
    pub pong_timeout: Option<Duration>,
}

impl Default for SignalingOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectConfig::default(),
            keepalive_interval: Duration::from_secs(25),
            pong_timeout: None,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct KeepaliveState {
    pub(crate) last_pong: Option<DateTime<Utc>>,
    /// Set when a ping goes out with no pong outstanding, cleared by a pong.
    pub(crate) awaiting_pong_since: Option<DateTime<Utc>>,
}

/// Builds `<ws-base>/signaling/<sessionId>/?token=<token>`.
pub fn signaling_url(ws_base: &str, session_id: &str, token: &str) -> String {
    format!(
        "{}/signaling/{}/?token={}",
        ws_base.trim_end_matches('/'),
        urlencoding::encode(session_id),
        urlencoding::encode(token)
    )
}

pub struct SignalingChannel {
    session_id: String,
    ws_base: String,
    credentials: Arc<dyn CredentialProvider>,
    factory: Arc<dyn TransportFactory>,
    pub(crate) options: SignalingOptions,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    is_open: AtomicBool,
    is_closed: AtomicBool,
    /// Bumped on every successful dial.
    generation: AtomicU64,
    /// Generation a forced reconnect was requested for; 0 when none.
    reconnect_target: AtomicU64,
    shutdown_notifier: Notify,
    reconnect_notifier: Notify,
    pub(crate) keepalive: Mutex<KeepaliveState>,
}

impl SignalingChannel {
    /// Creates the channel and starts connecting in the background.
    pub fn open(
        session_id: impl Into<String>,
        ws_base: impl Into<String>,
        credentials: Arc<dyn CredentialProvider>,
        factory: Arc<dyn TransportFactory>,
        options: SignalingOptions,
    ) -> (Arc<Self>, mpsc::Receiver<SignalingEvent>) {
        let channel = Arc::new(Self {
            session_id: session_id.into(),
            ws_base: ws_base.into(),
            credentials,
            factory,
            options,
            transport: Mutex::new(None),
            is_open: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            reconnect_target: AtomicU64::new(0),
            shutdown_notifier: Notify::new(),
            reconnect_notifier: Notify::new(),
            keepalive: Mutex::new(KeepaliveState::default()),
        });
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(channel.clone().run(events_tx));
        (channel, events_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_open(&self) -> bool {
        self.is_open.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub async fn last_pong(&self) -> Option<DateTime<Utc>> {
        self.keepalive.lock().await.last_pong
    }

    pub async fn send(&self, message: &SignalingMessage) -> Result<(), SignalingError> {
        if self.is_closed() {
            return Err(SignalingError::Closed);
        }
        if !self.is_open() {
            return Err(SignalingError::NotConnected);
        }
        let text = message.encode()?;
        let transport = self
            .transport
            .lock()
            .await
            .clone()
            .ok_or(SignalingError::NotConnected)?;
        trace!(target: "Signaling/Send", "--> {}", message.kind());
        transport
            .send(&text)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }

    /// Stops the channel for good. Safe to call more than once.
    pub async fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing signaling channel for session {}", self.session_id);
        self.shutdown_notifier.notify_one();
        self.drop_transport().await;
    }

    /// Drops the live connection and dials again. A request that outlives
    /// its connection is ignored by the next one.
    pub fn force_reconnect(&self) {
        if self.is_open() {
            self.reconnect_target
                .store(self.generation.load(Ordering::Acquire), Ordering::Release);
            self.reconnect_notifier.notify_one();
        }
    }

    async fn drop_transport(&self) {
        self.is_open.store(false, Ordering::Release);
        if let Some(transport) = self.transport.lock().await.take() {
            transport.disconnect().await;
        }
    }

    async fn connect(&self) -> Result<mpsc::Receiver<TransportEvent>, SignalingError> {
        let token = self
            .credentials
            .access_token()
            .ok_or(SignalingError::MissingToken)?;
        let url = signaling_url(&self.ws_base, &self.session_id, &token);

        let (transport, events) = tokio::time::timeout(
            self.options.reconnect.connection_timeout,
            self.factory.create_transport(&url),
        )
        .await
        .map_err(|_| SignalingError::Timeout)?
        .map_err(|e| SignalingError::Transport(e.to_string()))?;

        *self.transport.lock().await = Some(transport);
        *self.keepalive.lock().await = KeepaliveState::default();
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.is_open.store(true, Ordering::Release);
        Ok(events)
    }

    async fn run(self: Arc<Self>, events: mpsc::Sender<SignalingEvent>) {
        let mut backoff = Backoff::new(self.options.reconnect.clone());

        while !self.is_closed() && !events.is_closed() {
            let delay = match self.connect().await {
                Ok(transport_events) => {
                    if self.is_closed() {
                        self.drop_transport().await;
                        break;
                    }
                    info!("Signaling channel open for session {}", self.session_id);
                    let opened_at = tokio::time::Instant::now();
                    let _ = events.send(SignalingEvent::Open).await;

                    let keepalive = tokio::spawn(self.clone().keepalive_loop());
                    let code = self.pump(transport_events, &events).await;
                    keepalive.abort();
                    self.drop_transport().await;

                    if self.is_closed() {
                        break;
                    }
                    let uptime = opened_at.elapsed();
                    info!("Signaling connection lost after {uptime:?} (code {code:?})");
                    let _ = events.send(SignalingEvent::Closed { code }).await;
                    match backoff.record_uptime(uptime) {
                        Some(delay) => delay,
                        None => {
                            self.give_up(&backoff, &events).await;
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "Signaling connect attempt {} failed: {e}",
                        backoff.failures() + 1
                    );
                    let _ = events.send(SignalingEvent::Error(e.to_string())).await;
                    match backoff.record_failure() {
                        Some(delay) => delay,
                        None => {
                            self.give_up(&backoff, &events).await;
                            break;
                        }
                    }
                }
            };

            debug!("Next signaling attempt in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {},
                _ = self.shutdown_notifier.notified() => break,
            }
        }

        self.drop_transport().await;
        debug!("Signaling loop for session {} exited", self.session_id);
    }

    async fn give_up(&self, backoff: &Backoff, events: &mpsc::Sender<SignalingEvent>) {
        warn!(
            "Signaling gave up after {} attempts for session {}",
            backoff.failures(),
            self.session_id
        );
        let _ = events.send(SignalingEvent::RetriesExhausted).await;
    }

    /// Forwards inbound frames until the connection drops. Returns the close
    /// code, if any.
    async fn pump(
        &self,
        mut transport_events: mpsc::Receiver<TransportEvent>,
        events: &mpsc::Sender<SignalingEvent>,
    ) -> Option<u16> {
        let generation = self.generation.load(Ordering::Acquire);
        loop {
            tokio::select! {
                event = transport_events.recv() => match event {
                    Some(TransportEvent::Connected) => {}
                    Some(TransportEvent::MessageReceived(text)) => {
                        if !self.handle_frame(&text, events).await {
                            return None;
                        }
                    }
                    Some(TransportEvent::Disconnected { code }) => return code,
                    None => return None,
                },
                _ = self.shutdown_notifier.notified() => return None,
                _ = self.reconnect_notifier.notified() => {
                    if self.reconnect_target.load(Ordering::Acquire) != generation {
                        debug!("Ignoring reconnect request for an earlier connection");
                        continue;
                    }
                    info!("Forcing signaling reconnect for session {}", self.session_id);
                    return None;
                }
            }
        }
    }

    /// Returns `false` once the owner stopped listening.
    async fn handle_frame(&self, text: &str, events: &mpsc::Sender<SignalingEvent>) -> bool {
        let message = match SignalingMessage::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping malformed signaling frame: {e}");
                return true;
            }
        };
        trace!(target: "Signaling/Recv", "<-- {}", message.kind());

        if message == SignalingMessage::Pong {
            let mut keepalive = self.keepalive.lock().await;
            keepalive.last_pong = Some(Utc::now());
            keepalive.awaiting_pong_since = None;
            return true;
        }
        events.send(SignalingEvent::Message(message)).await.is_ok()
    }
}
