#![allow(dead_code)]

use async_trait::async_trait;
use callcore::backoff::ReconnectConfig;
use callcore::net::{HttpClient, HttpRequest, HttpResponse, Transport, TransportEvent, TransportFactory};
use callcore::types::{IceCandidate, SessionDescription, SignalingMessage};
use matchcall::media::{LocalMedia, MediaError, MediaSource, RemoteTrack, TrackKind};
use matchcall::negotiator::{PeerConnector, PeerEvent, PeerEventSink, PeerState, PeerTransport};
use matchcall::location::LocationProvider;
use matchcall::{CallSessionController, CallSessionControllerBuilder, ClientConfig, StaticCredentials};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

pub const API_BASE: &str = "http://api.test";
pub const WS_BASE: &str = "ws://signal.test/ws";
pub const TOKEN: &str = "tok";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Polls `check` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn fast_reconnect(max_retries: u32) -> ReconnectConfig {
    ReconnectConfig {
        min_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
        growth_factor: 1.5,
        max_retries,
        connection_timeout: Duration::from_millis(100),
        min_uptime: Duration::ZERO,
    }
}

pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::default()
        .with_api_base_url(API_BASE)
        .with_ws_base_url(WS_BASE);
    config.request_timeout = Duration::from_secs(1);
    config.location_timeout = Duration::from_millis(100);
    config.reconnect = fast_reconnect(3);
    config.keepalive_interval = Duration::from_secs(60);
    config.ice_servers = Vec::new();
    config
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct MockHttpClient {
    responses: Arc<Mutex<VecDeque<HttpResponse>>>,
    requests: Arc<Mutex<Vec<HttpRequest>>>,
    delay: Option<Duration>,
}

impl MockHttpClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_match(&self, session_id: &str, peer_user_id: i64) {
        self.push_json(
            200,
            serde_json::json!({ "sessionId": session_id, "peerUserId": peer_user_id }),
        );
    }

    pub fn push_json(&self, status: u16, body: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .push_back(HttpResponse::json(status, &body));
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Bodies of every request posted to `path`.
    pub fn bodies_for(&self, path: &str) -> Vec<serde_json::Value> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(path))
            .map(|r| serde_json::from_slice(r.body.as_deref().unwrap_or(&b"null"[..])).unwrap())
            .collect()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, anyhow::Error> {
        self.requests.lock().unwrap().push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self.responses.lock().unwrap().pop_front();
        Ok(next.unwrap_or_else(|| HttpResponse::empty(200)))
    }
}

// ---------------------------------------------------------------------------
// Signaling transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dial {
    Accept,
    Fail,
    /// Never completes; the caller's connection timeout fires.
    Hang,
}

/// The server side of one accepted mock connection.
#[derive(Debug)]
pub struct MockConnection {
    pub url: String,
    sent: Mutex<Vec<String>>,
    events_tx: mpsc::Sender<TransportEvent>,
    disconnected: AtomicBool,
}

impl MockConnection {
    pub async fn push(&self, message: &SignalingMessage) {
        self.push_text(&message.encode().unwrap()).await;
    }

    pub async fn push_text(&self, text: &str) {
        let _ = self
            .events_tx
            .send(TransportEvent::MessageReceived(text.to_string()))
            .await;
    }

    /// Simulates the server dropping the socket.
    pub async fn drop_with(&self, code: Option<u16>) {
        let _ = self
            .events_tx
            .send(TransportEvent::Disconnected { code })
            .await;
    }

    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|text| SignalingMessage::decode(text).unwrap())
            .collect()
    }

    pub fn sent_kinds(&self) -> Vec<&'static str> {
        self.sent().iter().map(|m| m.kind()).collect()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

struct MockTransport {
    connection: Arc<MockConnection>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        if self.connection.is_disconnected() {
            anyhow::bail!("socket closed");
        }
        self.connection.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn disconnect(&self) {
        self.connection.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Replays a script of dial outcomes; once the script runs out every dial
/// is accepted.
#[derive(Debug, Clone, Default)]
pub struct MockTransportFactory {
    script: Arc<Mutex<VecDeque<Dial>>>,
    dialed: Arc<Mutex<Vec<String>>>,
    connections: Arc<Mutex<Vec<Arc<MockConnection>>>>,
}

impl MockTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(self, dials: impl IntoIterator<Item = Dial>) -> Self {
        self.script.lock().unwrap().extend(dials);
        self
    }

    pub fn push_script(&self, dials: impl IntoIterator<Item = Dial>) {
        self.script.lock().unwrap().extend(dials);
    }

    pub fn dialed(&self) -> Vec<String> {
        self.dialed.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<MockConnection>> {
        self.connections.lock().unwrap().get(index).cloned()
    }

    pub async fn wait_for_connection(&self, index: usize) -> Arc<MockConnection> {
        eventually("signaling connection", move || async move {
            self.connection(index).is_some()
        })
        .await;
        self.connection(index).unwrap()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        self.dialed.lock().unwrap().push(url.to_string());
        let dial = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Dial::Accept);
        match dial {
            Dial::Fail => anyhow::bail!("connection refused"),
            Dial::Hang => std::future::pending().await,
            Dial::Accept => {
                let (events_tx, events_rx) = mpsc::channel(64);
                let _ = events_tx.send(TransportEvent::Connected).await;
                let connection = Arc::new(MockConnection {
                    url: url.to_string(),
                    sent: Mutex::new(Vec::new()),
                    events_tx,
                    disconnected: AtomicBool::new(false),
                });
                self.connections.lock().unwrap().push(connection.clone());
                Ok((Arc::new(MockTransport { connection }), events_rx))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Peer connections
// ---------------------------------------------------------------------------

/// A scripted peer transport. Tests drive its callbacks through the sink.
pub struct FakePeer {
    pub index: usize,
    sink: PeerEventSink,
    remote: Mutex<Vec<SessionDescription>>,
    candidates: Mutex<Vec<IceCandidate>>,
    closed: AtomicBool,
}

impl FakePeer {
    pub fn remote_descriptions(&self) -> Vec<SessionDescription> {
        self.remote.lock().unwrap().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.candidates
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.candidate.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn emit_track(&self, kind: TrackKind) {
        let track = RemoteTrack::new(kind, format!("{kind:?}-{}", self.index), "remote");
        self.sink.emit(PeerEvent::TrackAdded(track)).await;
    }

    pub async fn emit_state(&self, state: PeerState) {
        self.sink.emit(PeerEvent::StateChanged(state)).await;
    }

    pub async fn emit_candidate(&self, candidate: &str) {
        self.sink
            .emit(PeerEvent::LocalCandidate(candidate_named(candidate)))
            .await;
    }
}

struct FakePeerHandle(Arc<FakePeer>);

#[async_trait]
impl PeerTransport for FakePeerHandle {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer(format!("offer-{}", self.0.index)))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer(format!("answer-{}", self.0.index)))
    }

    async fn set_remote_description(
        &self,
        description: &SessionDescription,
    ) -> anyhow::Result<()> {
        self.0.remote.lock().unwrap().push(description.clone());
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()> {
        self.0.candidates.lock().unwrap().push(candidate.clone());
        Ok(())
    }

    async fn close(&self) {
        self.0.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Clone, Default)]
pub struct FakePeerConnector {
    peers: Arc<Mutex<Vec<Arc<FakePeer>>>>,
}

impl FakePeerConnector {
    pub fn peer(&self, index: usize) -> Option<Arc<FakePeer>> {
        self.peers.lock().unwrap().get(index).cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub async fn wait_for_peer(&self, index: usize) -> Arc<FakePeer> {
        eventually("peer transport", move || async move { self.peer(index).is_some() }).await;
        self.peer(index).unwrap()
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn connect(
        &self,
        _local_media: &LocalMedia,
        events: PeerEventSink,
    ) -> anyhow::Result<Arc<dyn PeerTransport>> {
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            index: peers.len(),
            sink: events,
            remote: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        peers.push(peer.clone());
        Ok(Arc::new(FakePeerHandle(peer)))
    }
}

// ---------------------------------------------------------------------------
// Media
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
pub struct CountingMediaSource {
    acquired: Arc<AtomicUsize>,
}

impl CountingMediaSource {
    pub fn acquisitions(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for CountingMediaSource {
    async fn acquire(&self) -> Result<LocalMedia, MediaError> {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(LocalMedia::new(Vec::new()))
    }
}

// ---------------------------------------------------------------------------
// Controller harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub controller: Arc<CallSessionController>,
    pub http: MockHttpClient,
    pub signaling: MockTransportFactory,
    pub peers: FakePeerConnector,
    pub media: CountingMediaSource,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_parts(MockHttpClient::new(), MockTransportFactory::new())
    }

    pub fn with_parts(http: MockHttpClient, signaling: MockTransportFactory) -> Self {
        Self::custom(http, signaling, |builder| builder)
    }

    /// A harness whose controller looks up its position through `provider`,
    /// giving up after `timeout`.
    pub fn with_location<L: LocationProvider + 'static>(provider: L, timeout: Duration) -> Self {
        Self::custom(MockHttpClient::new(), MockTransportFactory::new(), move |builder| {
            let mut config = test_config();
            config.location_timeout = timeout;
            builder.with_config(config).with_location_provider(provider)
        })
    }

    /// Builds the controller from the mocks, letting `customize` replace
    /// any of them before `build`.
    pub fn custom(
        http: MockHttpClient,
        signaling: MockTransportFactory,
        customize: impl FnOnce(CallSessionControllerBuilder) -> CallSessionControllerBuilder,
    ) -> Self {
        init_logging();
        let peers = FakePeerConnector::default();
        let media = CountingMediaSource::default();
        let builder = CallSessionController::builder()
            .with_config(test_config())
            .with_http_client(http.clone())
            .with_transport_factory(signaling.clone())
            .with_peer_connector(peers.clone())
            .with_media_source(media.clone())
            .with_credentials(Arc::new(StaticCredentials::new(TOKEN)));
        let controller = customize(builder).build().unwrap();
        Self {
            controller,
            http,
            signaling,
            peers,
            media,
        }
    }

    /// Runs `start_matching` against a queued match response and waits for
    /// the session's signaling connection.
    pub async fn matched(&self, session_id: &str, peer_user_id: i64) -> Arc<MockConnection> {
        self.http.push_match(session_id, peer_user_id);
        let index = self.signaling.connection_count();
        self.controller
            .start_matching(callcore::types::Gender::Female, false)
            .await;
        self.signaling.wait_for_connection(index).await
    }

    pub async fn wait_for_sent(&self, connection: &MockConnection, kind: &str) -> SignalingMessage {
        eventually(kind, move || async move {
            connection.sent().iter().any(|m| m.kind() == kind)
        })
        .await;
        connection
            .sent()
            .into_iter()
            .find(|m| m.kind() == kind)
            .unwrap()
    }

    pub async fn wait_for_phase_idle(&self) {
        eventually("idle session", move || async move { self.controller.state().await.is_idle() }).await;
    }

    pub async fn wait_for_connected(&self) {
        eventually("connected session", move || async move {
            self.controller.view().await.connected
        })
        .await;
    }
}

pub fn candidate_named(name: &str) -> IceCandidate {
    IceCandidate {
        candidate: name.to_string(),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn match_found(session_id: &str, initiator: Option<bool>) -> SignalingMessage {
    SignalingMessage::MatchFound {
        room_id: Some(format!("room-{session_id}")),
        peer_id: Some(42),
        session_id: Some(session_id.to_string()),
        initiator,
    }
}
