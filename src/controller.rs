//! The call-session controller.
//!
//! Public operations and inbound events all funnel into
//! [`callcore::session::transition`]; this module executes the resulting
//! effects. Session state lives behind one async mutex and every signaling
//! or peer event flows through one ordered queue drained by a single pump
//! task, so each handler runs to completion before the next one starts.

use crate::auth::CredentialProvider;
use crate::config::ClientConfig;
use crate::error::BuildError;
use crate::location::{LocationProvider, NoLocation};
use crate::matching::MatchClient;
use crate::media::{LocalMedia, MediaSource, RemoteMedia};
use crate::negotiator::{ConnectionNegotiator, NegotiatorEvent, PeerConnector, PeerOutcome};
use crate::signaling::{SignalingChannel, SignalingEvent, SignalingOptions};
use crate::types::events::{EventBus, RemoteMediaChanged};
use callcore::error::CallError;
use callcore::net::{HttpClient, TransportFactory};
use callcore::session::{
    CallSessionState, Effect, Notice, SessionEvent, SessionPhase, SessionView, Transition,
    transition,
};
use callcore::types::{Gender, Location, MatchCriteria, SignalingMessage};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

const PEER_EVENT_CAPACITY: usize = 100;

/// Inbound events, tagged with the session they belong to.
#[derive(Debug)]
enum ControllerInput {
    Signaling {
        session_id: String,
        event: SignalingEvent,
    },
    Peer {
        session_id: String,
        event: NegotiatorEvent,
    },
    /// Raised by the executor; handled after the current input so the
    /// teardown runs as its own transition.
    NegotiationFailed {
        session_id: String,
        error: CallError,
    },
}

/// Per-session resources, created on match assignment and disposed on
/// teardown. Never reused.
struct ActiveSession {
    session_id: String,
    channel: Arc<SignalingChannel>,
    negotiator: ConnectionNegotiator,
    forwarders: Vec<JoinHandle<()>>,
}

impl ActiveSession {
    async fn send_best_effort(&self, message: &SignalingMessage) {
        if let Err(e) = self.channel.send(message).await {
            debug!(
                "Could not send {} for session {}: {e}",
                message.kind(),
                self.session_id
            );
        }
    }

    async fn dispose(mut self) {
        self.negotiator.close().await;
        self.channel.close().await;
        for forwarder in self.forwarders.drain(..) {
            forwarder.abort();
        }
    }
}

#[derive(Default)]
struct Inner {
    state: CallSessionState,
    last_error: Option<CallError>,
    last_notice: Option<Notice>,
    session: Option<ActiveSession>,
}

pub struct CallSessionController {
    config: ClientConfig,
    match_client: MatchClient,
    transport_factory: Arc<dyn TransportFactory>,
    peer_connector: Arc<dyn PeerConnector>,
    media_source: Arc<dyn MediaSource>,
    credentials: Arc<dyn CredentialProvider>,
    location: Arc<dyn LocationProvider>,

    inner: Mutex<Inner>,
    /// Held across acquisition so concurrent starts share one capture.
    local_media: Mutex<Option<LocalMedia>>,
    next_attempt: AtomicU64,
    input_tx: mpsc::UnboundedSender<ControllerInput>,
    input_pump: std::sync::Mutex<Option<JoinHandle<()>>>,

    pub event_bus: Arc<EventBus>,
}

impl CallSessionController {
    pub fn builder() -> CallSessionControllerBuilder {
        CallSessionControllerBuilder::new()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// For requests the UI makes itself, such as friend requests.
    pub fn match_client(&self) -> &MatchClient {
        &self.match_client
    }

    /// Acquires local media if needed, requests a match and opens the
    /// session's signaling channel. Failures are reported via
    /// [`last_error`](Self::last_error). A no-op while a session is active.
    pub async fn start_matching(&self, target_gender: Gender, include_location: bool) {
        if !self.inner.lock().await.state.is_idle() {
            info!("start_matching ignored: a session is already active");
            return;
        }

        let Some(token) = self.credentials.access_token() else {
            warn!("start_matching: no access token");
            self.report_error(CallError::MissingToken).await;
            return;
        };

        if let Err(e) = self.ensure_local_media().await {
            warn!("start_matching: {e}");
            self.report_error(e).await;
            return;
        }

        let attempt = self.next_attempt.fetch_add(1, Ordering::Relaxed) + 1;
        {
            let mut inner = self.inner.lock().await;
            self.dispatch(&mut inner, SessionEvent::MatchRequested { attempt })
                .await;
            if inner.state.phase != (SessionPhase::Requesting { attempt }) {
                debug!("Match attempt {attempt} superseded before the request");
                return;
            }
        }

        let location = if include_location {
            self.current_location().await
        } else {
            None
        };
        let criteria = MatchCriteria::new(target_gender).with_location(location);
        info!("Requesting match (attempt {attempt}, gender {target_gender})");

        let event = match self.match_client.request_match(&criteria, &token).await {
            Ok(response) => {
                info!(
                    "Matched into session {} with peer {}",
                    response.session_id, response.peer_user_id
                );
                SessionEvent::MatchAssigned { attempt, response }
            }
            Err(e) => {
                warn!("Match request failed: {e}");
                SessionEvent::MatchFailed {
                    attempt,
                    error: e.into(),
                }
            }
        };

        let mut inner = self.inner.lock().await;
        self.dispatch(&mut inner, event).await;
    }

    /// Withdraws a pending match. Tolerated in any phase.
    pub async fn cancel_matching(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.state.matching() {
            debug!("cancel_matching ignored in phase {:?}", inner.state.phase);
            return;
        }
        info!("Cancelling matching");
        self.dispatch(&mut inner, SessionEvent::CancelRequested)
            .await;
    }

    /// Hangs up. Local media is kept for the next call. Idempotent.
    pub async fn end_call(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.state.is_idle() {
            info!("Ending call");
        }
        self.dispatch(&mut inner, SessionEvent::EndRequested).await;
    }

    pub async fn state(&self) -> CallSessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn view(&self) -> SessionView {
        self.inner.lock().await.state.view()
    }

    pub async fn last_error(&self) -> Option<CallError> {
        self.inner.lock().await.last_error.clone()
    }

    pub async fn clear_error(&self) {
        self.inner.lock().await.last_error = None;
    }

    pub async fn last_notice(&self) -> Option<Notice> {
        self.inner.lock().await.last_notice
    }

    pub async fn clear_notice(&self) {
        self.inner.lock().await.last_notice = None;
    }

    pub async fn local_media(&self) -> Option<LocalMedia> {
        self.local_media.lock().await.clone()
    }

    pub async fn remote_media(&self) -> Option<RemoteMedia> {
        self.inner
            .lock()
            .await
            .session
            .as_ref()
            .and_then(|s| s.negotiator.remote_media())
    }

    /// Ends any call, releases local media and stops the input pump.
    pub async fn shutdown(&self) {
        self.end_call().await;
        if let Some(media) = self.local_media.lock().await.take() {
            media.stop();
        }
        let pump = self.input_pump.lock().ok().and_then(|mut p| p.take());
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("Call session controller shut down");
    }

    async fn ensure_local_media(&self) -> Result<LocalMedia, CallError> {
        let mut guard = self.local_media.lock().await;
        if let Some(media) = guard.as_ref() {
            return Ok(media.clone());
        }
        let media = self.media_source.acquire().await?;
        info!("Local media {} acquired", media.id());
        *guard = Some(media.clone());
        Ok(media)
    }

    async fn current_location(&self) -> Option<Location> {
        match tokio::time::timeout(
            self.config.location_timeout,
            self.location.current_location(),
        )
        .await
        {
            Ok(Ok(location)) => Some(location),
            Ok(Err(e)) => {
                debug!("Location unavailable: {e:#}");
                None
            }
            Err(_) => {
                debug!("Location lookup timed out");
                None
            }
        }
    }

    async fn report_error(&self, error: CallError) {
        let mut inner = self.inner.lock().await;
        self.record_error(&mut inner, error);
    }

    fn record_error(&self, inner: &mut Inner, error: CallError) {
        let _ = self.event_bus.error.send(Arc::new(error.clone()));
        inner.last_error = Some(error);
    }

    fn publish_remote_media(&self, media: Option<RemoteMedia>) {
        let _ = self
            .event_bus
            .remote_media
            .send(Arc::new(RemoteMediaChanged { media }));
    }

    /// Runs one transition and its effects while holding the state lock.
    async fn dispatch(&self, inner: &mut Inner, event: SessionEvent) {
        let Transition { state, effects } = transition(&inner.state, event);
        if state != inner.state {
            debug!("Session phase {:?} -> {:?}", inner.state.phase, state.phase);
            inner.state = state;
            let _ = self.event_bus.state.send(Arc::new(inner.state.view()));
        }
        for effect in effects {
            self.execute(inner, effect).await;
        }
    }

    async fn execute(&self, inner: &mut Inner, effect: Effect) {
        match effect {
            Effect::ConnectSignaling { session_id } => {
                if let Some(previous) = inner.session.take() {
                    previous.dispose().await;
                }
                match self.open_session(&session_id).await {
                    Some(session) => inner.session = Some(session),
                    None => {
                        // Local media was released by a concurrent shutdown.
                        inner.state = CallSessionState::new();
                        let _ = self.event_bus.state.send(Arc::new(inner.state.view()));
                        self.spawn_session_release(session_id, false);
                        self.record_error(
                            inner,
                            CallError::MediaUnavailable {
                                reason: "local media was released".into(),
                            },
                        );
                    }
                }
            }
            Effect::CloseSignaling => {
                if let Some(session) = inner.session.take() {
                    session.dispose().await;
                }
            }
            Effect::Send(message) => {
                if let Some(session) = inner.session.as_ref() {
                    session.send_best_effort(&message).await;
                }
            }
            Effect::CancelMatch { session_id } => self.spawn_session_release(session_id, true),
            Effect::EndSession { session_id } => self.spawn_session_release(session_id, false),
            Effect::StartOffer => {
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                let offer = session.negotiator.start_offer().await;
                match offer {
                    Ok(offer) => {
                        session
                            .send_best_effort(&SignalingMessage::Offer { offer })
                            .await
                    }
                    Err(e) => {
                        warn!("Failed to create offer: {e}");
                        self.fail_negotiation(&session.session_id, e.to_string());
                    }
                }
            }
            Effect::AcceptOffer(offer) => {
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                self.publish_remote_media(None);
                let answer = session.negotiator.accept_offer(&offer).await;
                match answer {
                    Ok(answer) => {
                        session
                            .send_best_effort(&SignalingMessage::Answer { answer })
                            .await
                    }
                    Err(e) => {
                        warn!("Failed to answer offer: {e}");
                        self.fail_negotiation(&session.session_id, e.to_string());
                    }
                }
            }
            Effect::ApplyAnswer(answer) => {
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                if let Err(e) = session.negotiator.apply_answer(&answer).await {
                    warn!("Dropping answer: {e}");
                }
            }
            Effect::ApplyCandidate(candidate) => {
                if let Some(session) = inner.session.as_mut() {
                    session.negotiator.add_remote_candidate(&candidate).await;
                }
            }
            Effect::TeardownNegotiation => {
                if let Some(session) = inner.session.as_mut() {
                    session.negotiator.close().await;
                }
                self.publish_remote_media(None);
            }
            Effect::Notify(notice) => {
                info!("Notice: {notice:?}");
                inner.last_notice = Some(notice);
                let _ = self.event_bus.notice.send(Arc::new(notice));
            }
            Effect::Fail(error) => {
                warn!("Session error: {error}");
                self.record_error(inner, error);
            }
        }
    }

    async fn open_session(&self, session_id: &str) -> Option<ActiveSession> {
        let local_media = self.local_media.lock().await.clone()?;

        let (channel, mut signaling_rx) = SignalingChannel::open(
            session_id,
            self.config.ws_base_url.clone(),
            self.credentials.clone(),
            self.transport_factory.clone(),
            SignalingOptions {
                reconnect: self.config.reconnect.clone(),
                keepalive_interval: self.config.keepalive_interval,
                pong_timeout: self.config.pong_timeout,
            },
        );

        let (peer_tx, mut peer_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let negotiator = ConnectionNegotiator::new(self.peer_connector.clone(), local_media, peer_tx);

        let input = self.input_tx.clone();
        let sid = session_id.to_string();
        let signaling_forwarder = tokio::spawn(async move {
            while let Some(event) = signaling_rx.recv().await {
                let tagged = ControllerInput::Signaling {
                    session_id: sid.clone(),
                    event,
                };
                if input.send(tagged).is_err() {
                    break;
                }
            }
        });

        let input = self.input_tx.clone();
        let sid = session_id.to_string();
        let peer_forwarder = tokio::spawn(async move {
            while let Some(event) = peer_rx.recv().await {
                let tagged = ControllerInput::Peer {
                    session_id: sid.clone(),
                    event,
                };
                if input.send(tagged).is_err() {
                    break;
                }
            }
        });

        Some(ActiveSession {
            session_id: session_id.to_string(),
            channel,
            negotiator,
            forwarders: vec![signaling_forwarder, peer_forwarder],
        })
    }

    fn fail_negotiation(&self, session_id: &str, reason: String) {
        let input = ControllerInput::NegotiationFailed {
            session_id: session_id.to_string(),
            error: CallError::NegotiationFailed { reason },
        };
        if self.input_tx.send(input).is_err() {
            debug!("Controller input closed; dropping negotiation failure");
        }
    }

    /// Best-effort `/match/end`; runs detached so teardown never waits on HTTP.
    fn spawn_session_release(&self, session_id: String, cancelling: bool) {
        let Some(token) = self.credentials.access_token() else {
            warn!("No access token; cannot release session {session_id} on the server");
            return;
        };
        let client = self.match_client.clone();
        tokio::spawn(async move {
            let result = if cancelling {
                client.cancel_match(&session_id, &token).await
            } else {
                client.end_session(&session_id, &token).await
            };
            match result {
                Ok(()) => debug!("Released session {session_id}"),
                Err(e) => warn!("Failed to release session {session_id}: {e}"),
            }
        });
    }

    async fn handle_input(&self, input: ControllerInput) {
        let mut inner = self.inner.lock().await;
        match input {
            ControllerInput::Signaling { session_id, event } => match event {
                SignalingEvent::Open => debug!("Signaling open for session {session_id}"),
                SignalingEvent::Closed { code } => {
                    debug!("Signaling for session {session_id} closed with {code:?}")
                }
                SignalingEvent::Error(e) => debug!("Signaling error for {session_id}: {e}"),
                SignalingEvent::Message(message) => {
                    self.dispatch(
                        &mut inner,
                        SessionEvent::Signal {
                            session_id,
                            message,
                        },
                    )
                    .await
                }
                SignalingEvent::RetriesExhausted => {
                    self.dispatch(&mut inner, SessionEvent::SignalingExhausted { session_id })
                        .await
                }
            },
            ControllerInput::Peer { session_id, event } => {
                if !inner.state.is_current_session(&session_id) {
                    return;
                }
                let Some(session) = inner.session.as_mut() else {
                    return;
                };
                let outcome = session.negotiator.on_peer_event(event).await;
                match outcome {
                    PeerOutcome::Ignored => {}
                    PeerOutcome::SendCandidate(candidate) => {
                        session
                            .send_best_effort(&SignalingMessage::IceCandidate { candidate })
                            .await
                    }
                    PeerOutcome::MediaUpdated(media) => self.publish_remote_media(Some(media)),
                    PeerOutcome::MediaLive(media) => {
                        self.publish_remote_media(Some(media));
                        self.dispatch(&mut inner, SessionEvent::MediaConnected { session_id })
                            .await;
                    }
                    PeerOutcome::TransportLost => {
                        self.dispatch(&mut inner, SessionEvent::PeerTransportLost { session_id })
                            .await;
                    }
                }
            }
            ControllerInput::NegotiationFailed { session_id, error } => {
                self.dispatch(&mut inner, SessionEvent::NegotiationFailed { session_id, error })
                    .await
            }
        }
    }
}

async fn input_pump(
    controller: Weak<CallSessionController>,
    mut input_rx: mpsc::UnboundedReceiver<ControllerInput>,
) {
    while let Some(input) = input_rx.recv().await {
        let Some(controller) = controller.upgrade() else {
            break;
        };
        controller.handle_input(input).await;
    }
    debug!("Controller input pump exited");
}

pub struct CallSessionControllerBuilder {
    config: Option<ClientConfig>,
    http_client: Option<Arc<dyn HttpClient>>,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    peer_connector: Option<Arc<dyn PeerConnector>>,
    media_source: Option<Arc<dyn MediaSource>>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    location: Option<Arc<dyn LocationProvider>>,
}

impl CallSessionControllerBuilder {
    fn new() -> Self {
        Self {
            config: None,
            http_client: None,
            transport_factory: None,
            peer_connector: None,
            media_source: None,
            credentials: None,
            location: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_http_client<C: HttpClient + 'static>(mut self, client: C) -> Self {
        self.http_client = Some(Arc::new(client));
        self
    }

    pub fn with_transport_factory<F: TransportFactory + 'static>(mut self, factory: F) -> Self {
        self.transport_factory = Some(Arc::new(factory));
        self
    }

    pub fn with_peer_connector<P: PeerConnector + 'static>(mut self, connector: P) -> Self {
        self.peer_connector = Some(Arc::new(connector));
        self
    }

    pub fn with_media_source<M: MediaSource + 'static>(mut self, source: M) -> Self {
        self.media_source = Some(Arc::new(source));
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Defaults to [`NoLocation`].
    pub fn with_location_provider<L: LocationProvider + 'static>(mut self, provider: L) -> Self {
        self.location = Some(Arc::new(provider));
        self
    }

    /// Builds the controller and starts its input pump. Must be called from
    /// within a Tokio runtime.
    pub fn build(self) -> Result<Arc<CallSessionController>, BuildError> {
        let config = self.config.unwrap_or_default();
        let http_client = self
            .http_client
            .ok_or(BuildError::MissingComponent("an HTTP client"))?;
        let transport_factory = self
            .transport_factory
            .ok_or(BuildError::MissingComponent("a transport factory"))?;
        let peer_connector = self
            .peer_connector
            .ok_or(BuildError::MissingComponent("a peer connector"))?;
        let media_source = self
            .media_source
            .ok_or(BuildError::MissingComponent("a media source"))?;
        let credentials = self
            .credentials
            .ok_or(BuildError::MissingComponent("a credential provider"))?;
        let location = self.location.unwrap_or_else(|| Arc::new(NoLocation));

        let match_client = MatchClient::new(
            http_client,
            config.api_base_url.clone(),
            config.request_timeout,
        );
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let controller = Arc::new(CallSessionController {
            config,
            match_client,
            transport_factory,
            peer_connector,
            media_source,
            credentials,
            location,
            inner: Mutex::new(Inner::default()),
            local_media: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
            input_tx,
            input_pump: std::sync::Mutex::new(None),
            event_bus: Arc::new(EventBus::new()),
        });

        let pump = tokio::spawn(input_pump(Arc::downgrade(&controller), input_rx));
        if let Ok(mut slot) = controller.input_pump.lock() {
            *slot = Some(pump);
        }
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentials;
    use crate::media::MediaError;
    use crate::negotiator::{PeerEventSink, PeerTransport};
    use crate::test_utils::MockHttpClient;
    use crate::transport::mock::UnreachableTransportFactory;
    use async_trait::async_trait;

    struct NoPeers;

    #[async_trait]
    impl PeerConnector for NoPeers {
        async fn connect(
            &self,
            _local_media: &LocalMedia,
            _events: PeerEventSink,
        ) -> anyhow::Result<Arc<dyn PeerTransport>> {
            Err(anyhow::anyhow!("no peers in unit tests"))
        }
    }

    struct DeniedMedia;

    #[async_trait]
    impl MediaSource for DeniedMedia {
        async fn acquire(&self) -> Result<LocalMedia, MediaError> {
            Err(MediaError::PermissionDenied("camera".into()))
        }
    }

    struct EmptyMedia;

    #[async_trait]
    impl MediaSource for EmptyMedia {
        async fn acquire(&self) -> Result<LocalMedia, MediaError> {
            Ok(LocalMedia::new(Vec::new()))
        }
    }

    fn builder(http: &MockHttpClient) -> CallSessionControllerBuilder {
        CallSessionController::builder()
            .with_http_client(http.clone())
            .with_transport_factory(UnreachableTransportFactory::default())
            .with_peer_connector(NoPeers)
            .with_media_source(EmptyMedia)
            .with_credentials(Arc::new(StaticCredentials::new("tok")))
    }

    #[tokio::test]
    async fn test_build_requires_components() {
        let result = CallSessionController::builder()
            .with_http_client(MockHttpClient::new())
            .build();
        assert!(matches!(result, Err(BuildError::MissingComponent(_))));
    }

    #[tokio::test]
    async fn test_missing_token_fails_fast() {
        let http = MockHttpClient::new();
        let controller = builder(&http)
            .with_credentials(Arc::new(StaticCredentials::none()))
            .build()
            .unwrap();

        controller.start_matching(Gender::Female, false).await;
        assert_eq!(controller.last_error().await, Some(CallError::MissingToken));
        assert!(controller.local_media().await.is_none());
        assert!(http.requests().is_empty());
        assert_eq!(controller.view().await, SessionView::default());
    }

    #[tokio::test]
    async fn test_media_failure_blocks_matching() {
        let http = MockHttpClient::new();
        let controller = builder(&http).with_media_source(DeniedMedia).build().unwrap();

        controller.start_matching(Gender::Male, false).await;
        assert!(matches!(
            controller.last_error().await,
            Some(CallError::MediaUnavailable { .. })
        ));
        assert!(http.requests().is_empty());
        assert!(!controller.view().await.matching);

        controller.clear_error().await;
        assert!(controller.last_error().await.is_none());
    }

    #[tokio::test]
    async fn test_end_call_when_idle_is_harmless() {
        let http = MockHttpClient::new();
        let controller = builder(&http).build().unwrap();
        controller.end_call().await;
        controller.end_call().await;
        controller.cancel_matching().await;
        assert_eq!(controller.state().await, CallSessionState::new());
        assert!(controller.last_error().await.is_none());
        assert!(http.requests().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_releases_local_media() {
        let http = MockHttpClient::new();
        http.push_json(500, serde_json::json!({}));
        let controller = builder(&http).build().unwrap();
        controller.start_matching(Gender::Male, false).await;
        let media = controller.local_media().await.unwrap();

        controller.shutdown().await;
        assert!(media.is_stopped());
        assert!(controller.local_media().await.is_none());
    }
}
