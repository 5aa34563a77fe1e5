//! Offer/answer/candidate exchange for one session.
//!
//! Every offer or answer cycle builds a fresh [`PeerTransport`] through the
//! [`PeerConnector`] and discards the previous one outright. Events raised by
//! a transport carry the id of the negotiation that created it, so late
//! events from a discarded attempt are recognised and ignored.

use crate::media::{LocalMedia, RemoteMedia, RemoteTrack};
use async_trait::async_trait;
use callcore::negotiation::{InvalidTransition, NegotiationPhase, NegotiationStep};
use callcore::types::{IceCandidate, SessionDescription};
use log::{debug, info, warn};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Connection state reported by a peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// States after which the media path is gone for good.
    pub fn is_lost(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A local ICE candidate to trickle to the peer.
    LocalCandidate(IceCandidate),
    TrackAdded(RemoteTrack),
    StateChanged(PeerState),
}

#[derive(Debug, Clone)]
pub struct NegotiatorEvent {
    pub negotiation_id: u64,
    pub event: PeerEvent,
}

/// Handed to a [`PeerConnector`]; tags every event with its negotiation.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    negotiation_id: u64,
    tx: mpsc::Sender<NegotiatorEvent>,
}

impl PeerEventSink {
    pub fn new(negotiation_id: u64, tx: mpsc::Sender<NegotiatorEvent>) -> Self {
        Self { negotiation_id, tx }
    }

    pub fn negotiation_id(&self) -> u64 {
        self.negotiation_id
    }

    /// Returns `false` once nobody is listening any more.
    pub async fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(NegotiatorEvent {
                negotiation_id: self.negotiation_id,
                event,
            })
            .await
            .is_ok()
    }
}

/// One media connection to the peer.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Creates an offer and applies it as the local description.
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    /// Creates an answer to the applied remote offer and applies it locally.
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_remote_description(&self, description: &SessionDescription)
    -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> anyhow::Result<()>;
    async fn close(&self);
}

/// Creates peer transports carrying the local media.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        local_media: &LocalMedia,
        events: PeerEventSink,
    ) -> anyhow::Result<Arc<dyn PeerTransport>>;
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("peer transport error: {0}")]
    Transport(String),
    #[error("no active negotiation")]
    NoNegotiation,
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),
}

impl NegotiationError {
    fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{err:#}"))
    }
}

/// What the controller must do after a peer event.
#[derive(Debug, Clone)]
pub enum PeerOutcome {
    Ignored,
    SendCandidate(IceCandidate),
    /// First inbound track of the negotiation: the call is live.
    MediaLive(RemoteMedia),
    /// Another track joined already-live media.
    MediaUpdated(RemoteMedia),
    /// The media path of the current negotiation is gone.
    TransportLost,
}

struct Negotiation {
    id: u64,
    phase: NegotiationPhase,
    transport: Arc<dyn PeerTransport>,
    remote_media: Option<RemoteMedia>,
    /// Candidates received while waiting for the answer.
    pending_candidates: Vec<IceCandidate>,
}

impl Negotiation {
    fn advance(&mut self, step: NegotiationStep) -> Result<(), InvalidTransition> {
        self.phase = self.phase.advance(step)?;
        Ok(())
    }
}

pub struct ConnectionNegotiator {
    connector: Arc<dyn PeerConnector>,
    local_media: LocalMedia,
    events_tx: mpsc::Sender<NegotiatorEvent>,
    last_id: u64,
    current: Option<Negotiation>,
}

impl ConnectionNegotiator {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        local_media: LocalMedia,
        events_tx: mpsc::Sender<NegotiatorEvent>,
    ) -> Self {
        Self {
            connector,
            local_media,
            events_tx,
            last_id: 0,
            current: None,
        }
    }

    pub fn phase(&self) -> Option<NegotiationPhase> {
        self.current.as_ref().map(|n| n.phase)
    }

    pub fn current_id(&self) -> Option<u64> {
        self.current.as_ref().map(|n| n.id)
    }

    pub fn is_current(&self, negotiation_id: u64) -> bool {
        self.current_id() == Some(negotiation_id)
    }

    pub fn remote_media(&self) -> Option<RemoteMedia> {
        self.current.as_ref().and_then(|n| n.remote_media.clone())
    }

    /// Discards any existing negotiation and dials a new transport.
    async fn fresh(&mut self) -> Result<&mut Negotiation, NegotiationError> {
        self.close().await;
        self.last_id += 1;
        let id = self.last_id;
        let sink = PeerEventSink::new(id, self.events_tx.clone());
        let transport = self
            .connector
            .connect(&self.local_media, sink)
            .await
            .map_err(NegotiationError::transport)?;
        debug!("Negotiation {id} created");
        Ok(self.current.insert(Negotiation {
            id,
            phase: NegotiationPhase::Idle,
            transport,
            remote_media: None,
            pending_candidates: Vec::new(),
        }))
    }

    /// Starts a negotiation as the offering side and returns the offer to send.
    pub async fn start_offer(&mut self) -> Result<SessionDescription, NegotiationError> {
        let negotiation = self.fresh().await?;
        negotiation.advance(NegotiationStep::BeginOffer)?;
        let offer = negotiation
            .transport
            .create_offer()
            .await
            .map_err(NegotiationError::transport)?;
        negotiation.advance(NegotiationStep::OfferSent)?;
        info!("Negotiation {} offering", negotiation.id);
        Ok(offer)
    }

    /// Answers a remote offer on a fresh negotiation and returns the answer
    /// to send.
    pub async fn accept_offer(
        &mut self,
        offer: &SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        let negotiation = self.fresh().await?;
        negotiation
            .transport
            .set_remote_description(offer)
            .await
            .map_err(NegotiationError::transport)?;
        negotiation.advance(NegotiationStep::BeginAnswer)?;
        let answer = negotiation
            .transport
            .create_answer()
            .await
            .map_err(NegotiationError::transport)?;
        negotiation.advance(NegotiationStep::AnswerSent)?;
        info!("Negotiation {} answered remote offer", negotiation.id);
        Ok(answer)
    }

    /// Applies the peer's answer to the outstanding offer, then any
    /// candidates that arrived ahead of it.
    pub async fn apply_answer(
        &mut self,
        answer: &SessionDescription,
    ) -> Result<(), NegotiationError> {
        let negotiation = self
            .current
            .as_mut()
            .ok_or(NegotiationError::NoNegotiation)?;
        let next = negotiation.phase.advance(NegotiationStep::AnswerReceived)?;
        negotiation
            .transport
            .set_remote_description(answer)
            .await
            .map_err(NegotiationError::transport)?;
        negotiation.phase = next;

        for candidate in std::mem::take(&mut negotiation.pending_candidates) {
            if let Err(e) = negotiation.transport.add_ice_candidate(&candidate).await {
                warn!("Failed to apply queued ICE candidate: {e:#}");
            }
        }
        Ok(())
    }

    /// Applies a remote candidate. Returns whether it was applied or queued;
    /// candidates with nothing to attach to are dropped.
    pub async fn add_remote_candidate(&mut self, candidate: &IceCandidate) -> bool {
        let Some(negotiation) = self.current.as_mut() else {
            debug!("Dropping ICE candidate: no active negotiation");
            return false;
        };
        if negotiation.phase == NegotiationPhase::AwaitingAnswer {
            negotiation.pending_candidates.push(candidate.clone());
            return true;
        }
        if !negotiation.phase.has_remote_description() {
            debug!(
                "Dropping ICE candidate: negotiation {} is {:?}",
                negotiation.id, negotiation.phase
            );
            return false;
        }
        match negotiation.transport.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to apply ICE candidate: {e:#}");
                false
            }
        }
    }

    pub async fn on_peer_event(&mut self, event: NegotiatorEvent) -> PeerOutcome {
        if !self.is_current(event.negotiation_id) {
            debug!(
                "Ignoring event from stale negotiation {}",
                event.negotiation_id
            );
            return PeerOutcome::Ignored;
        }
        match event.event {
            PeerEvent::LocalCandidate(candidate) => PeerOutcome::SendCandidate(candidate),
            PeerEvent::TrackAdded(track) => {
                let live = self.on_remote_track(event.negotiation_id, track);
                match (live, self.remote_media()) {
                    (true, Some(media)) => PeerOutcome::MediaLive(media),
                    (false, Some(media)) => PeerOutcome::MediaUpdated(media),
                    _ => PeerOutcome::Ignored,
                }
            }
            PeerEvent::StateChanged(state) if state.is_lost() => {
                info!("Peer transport {state:?}");
                if self.on_transport_lost(event.negotiation_id).await {
                    PeerOutcome::TransportLost
                } else {
                    PeerOutcome::Ignored
                }
            }
            PeerEvent::StateChanged(state) => {
                debug!("Peer transport {state:?}");
                PeerOutcome::Ignored
            }
        }
    }

    /// Records an inbound track. Returns `true` when this track made the
    /// media live.
    pub fn on_remote_track(&mut self, negotiation_id: u64, track: RemoteTrack) -> bool {
        let Some(negotiation) = self.current.as_mut().filter(|n| n.id == negotiation_id) else {
            return false;
        };
        if negotiation.phase.is_closed() {
            return false;
        }
        debug!(
            "Negotiation {} received {:?} track {}",
            negotiation.id, track.kind, track.track_id
        );
        negotiation
            .remote_media
            .get_or_insert_with(|| RemoteMedia::new(negotiation_id))
            .tracks
            .push(track);

        match negotiation.advance(NegotiationStep::MediaLive) {
            Ok(()) => {
                info!("Negotiation {} media live", negotiation.id);
                true
            }
            Err(_) => false,
        }
    }

    /// Closes the current negotiation when its transport reports loss.
    /// Returns `true` when the controller must run its disconnect path.
    pub async fn on_transport_lost(&mut self, negotiation_id: u64) -> bool {
        if !self.is_current(negotiation_id) {
            return false;
        }
        self.close().await;
        true
    }

    /// Tears down the current negotiation and its remote media.
    pub async fn close(&mut self) {
        if let Some(mut negotiation) = self.current.take() {
            let _ = negotiation.advance(NegotiationStep::Close);
            negotiation.transport.close().await;
            debug!("Negotiation {} closed", negotiation.id);
        }
    }
}
