//! Call-session state machine.
//!
//! [`transition`] is a pure function from the current [`CallSessionState`]
//! and one [`SessionEvent`] to the next state plus the [`Effect`]s the owner
//! must execute, in order. It performs no I/O, so every path through a
//! session (cancel, hang-up, peer loss, stale messages) can be checked
//! without a network or media stack.

use serde::Serialize;

use crate::error::CallError;
use crate::types::{IceCandidate, MatchResponse, SessionDescription, SignalingMessage};

/// Controller-level phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum SessionPhase {
    #[default]
    Idle,
    /// Match request in flight. `attempt` identifies the request so a late
    /// completion of a cancelled request can be recognised.
    Requesting { attempt: u64 },
    /// Session assigned, waiting on the signaling channel for `match-found`.
    Matching,
    /// Peer found, offer/answer exchange running.
    Negotiating,
    /// Inbound media is live.
    Connected,
}

/// The single session record owned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct CallSessionState {
    pub phase: SessionPhase,
    pub session_id: Option<String>,
    pub peer_id: Option<i64>,
    pub room_id: Option<String>,
}

impl CallSessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn matching(&self) -> bool {
        matches!(
            self.phase,
            SessionPhase::Requesting { .. } | SessionPhase::Matching
        )
    }

    pub fn connected(&self) -> bool {
        self.phase == SessionPhase::Connected
    }

    pub fn is_idle(&self) -> bool {
        self.phase == SessionPhase::Idle
    }

    /// Whether `session_id` names the session this state is tracking.
    pub fn is_current_session(&self, session_id: &str) -> bool {
        self.session_id.as_deref() == Some(session_id)
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            matching: self.matching(),
            connected: self.connected(),
            session_id: self.session_id.clone(),
            room_id: self.room_id.clone(),
            peer_id: self.peer_id,
        }
    }
}

/// What the UI renders from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub matching: bool,
    pub connected: bool,
    pub session_id: Option<String>,
    pub room_id: Option<String>,
    pub peer_id: Option<i64>,
}

/// Informational outcomes that are not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Notice {
    /// The peer hung up or the media path to it was lost.
    PeerDisconnected,
    /// The server cancelled matching.
    MatchCancelled,
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    MatchRequested { attempt: u64 },
    MatchAssigned { attempt: u64, response: MatchResponse },
    MatchFailed { attempt: u64, error: CallError },
    CancelRequested,
    EndRequested,
    /// A message received on the signaling channel of `session_id`.
    Signal {
        session_id: String,
        message: SignalingMessage,
    },
    SignalingExhausted { session_id: String },
    MediaConnected { session_id: String },
    PeerTransportLost { session_id: String },
    /// Creating or answering an offer failed locally.
    NegotiationFailed { session_id: String, error: CallError },
}

/// Side effects requested by a transition, executed in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    ConnectSignaling { session_id: String },
    CloseSignaling,
    Send(SignalingMessage),
    CancelMatch { session_id: String },
    EndSession { session_id: String },
    StartOffer,
    AcceptOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    ApplyCandidate(IceCandidate),
    /// Dispose the negotiation and its remote media.
    TeardownNegotiation,
    Notify(Notice),
    Fail(CallError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub state: CallSessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn unchanged(state: &CallSessionState) -> Self {
        Self {
            state: state.clone(),
            effects: Vec::new(),
        }
    }

    fn to(state: CallSessionState, effects: Vec<Effect>) -> Self {
        Self { state, effects }
    }

    fn reset(effects: Vec<Effect>) -> Self {
        Self::to(CallSessionState::new(), effects)
    }
}

/// Computes the next state and the effects to run for `event`.
pub fn transition(state: &CallSessionState, event: SessionEvent) -> Transition {
    use SessionPhase as P;

    match event {
        SessionEvent::MatchRequested { attempt } => match state.phase {
            P::Idle => Transition::to(
                CallSessionState {
                    phase: P::Requesting { attempt },
                    ..CallSessionState::new()
                },
                Vec::new(),
            ),
            _ => Transition::unchanged(state),
        },

        SessionEvent::MatchAssigned { attempt, response } => {
            if state.phase == (P::Requesting { attempt }) {
                let session_id = response.session_id;
                Transition::to(
                    CallSessionState {
                        phase: P::Matching,
                        session_id: Some(session_id.clone()),
                        peer_id: Some(response.peer_user_id),
                        room_id: None,
                    },
                    vec![Effect::ConnectSignaling { session_id }],
                )
            } else {
                // The request was cancelled or superseded while in flight;
                // release the orphaned session on the backend.
                let mut t = Transition::unchanged(state);
                t.effects.push(Effect::EndSession {
                    session_id: response.session_id,
                });
                t
            }
        }

        SessionEvent::MatchFailed { attempt, error } => {
            if state.phase == (P::Requesting { attempt }) {
                Transition::reset(vec![Effect::Fail(error)])
            } else {
                Transition::unchanged(state)
            }
        }

        SessionEvent::CancelRequested => match (&state.phase, &state.session_id) {
            (P::Requesting { .. }, _) => Transition::reset(Vec::new()),
            (P::Matching, Some(session_id)) => Transition::reset(vec![
                Effect::Send(SignalingMessage::MatchCancelled),
                Effect::CancelMatch {
                    session_id: session_id.clone(),
                },
                Effect::CloseSignaling,
            ]),
            _ => Transition::unchanged(state),
        },

        SessionEvent::EndRequested => match state.phase {
            P::Idle => Transition::unchanged(state),
            P::Requesting { .. } => Transition::reset(Vec::new()),
            P::Matching | P::Negotiating | P::Connected => {
                let mut effects = vec![
                    Effect::TeardownNegotiation,
                    Effect::Send(SignalingMessage::UserDisconnected),
                ];
                if let Some(session_id) = &state.session_id {
                    effects.push(Effect::EndSession {
                        session_id: session_id.clone(),
                    });
                }
                effects.push(Effect::CloseSignaling);
                Transition::reset(effects)
            }
        },

        SessionEvent::Signal {
            session_id,
            message,
        } => {
            if !state.is_current_session(&session_id) {
                return Transition::unchanged(state);
            }
            on_signal(state, session_id, message)
        }

        SessionEvent::SignalingExhausted { session_id } => {
            if !state.is_current_session(&session_id) {
                return Transition::unchanged(state);
            }
            match state.phase {
                P::Matching | P::Negotiating => Transition::reset(vec![
                    Effect::TeardownNegotiation,
                    Effect::EndSession { session_id },
                    Effect::CloseSignaling,
                    Effect::Fail(CallError::SignalingUnavailable),
                ]),
                P::Connected => {
                    let mut t = Transition::unchanged(state);
                    t.effects.push(Effect::Fail(CallError::SignalingUnavailable));
                    t
                }
                _ => Transition::unchanged(state),
            }
        }

        SessionEvent::MediaConnected { session_id } => {
            if state.is_current_session(&session_id) && state.phase == P::Negotiating {
                Transition::to(
                    CallSessionState {
                        phase: P::Connected,
                        ..state.clone()
                    },
                    Vec::new(),
                )
            } else {
                Transition::unchanged(state)
            }
        }

        SessionEvent::PeerTransportLost { session_id } => {
            if state.is_current_session(&session_id)
                && matches!(state.phase, P::Negotiating | P::Connected)
            {
                Transition::reset(vec![
                    Effect::TeardownNegotiation,
                    Effect::Send(SignalingMessage::UserDisconnected),
                    Effect::EndSession { session_id },
                    Effect::CloseSignaling,
                    Effect::Notify(Notice::PeerDisconnected),
                ])
            } else {
                Transition::unchanged(state)
            }
        }

        SessionEvent::NegotiationFailed { session_id, error } => {
            if state.is_current_session(&session_id)
                && matches!(state.phase, P::Negotiating | P::Connected)
            {
                Transition::reset(vec![
                    Effect::TeardownNegotiation,
                    Effect::Send(SignalingMessage::UserDisconnected),
                    Effect::EndSession { session_id },
                    Effect::CloseSignaling,
                    Effect::Fail(error),
                ])
            } else {
                Transition::unchanged(state)
            }
        }
    }
}

fn on_signal(
    state: &CallSessionState,
    session_id: String,
    message: SignalingMessage,
) -> Transition {
    use SessionPhase as P;

    match message {
        SignalingMessage::MatchFound {
            room_id,
            peer_id,
            session_id: announced,
            initiator,
        } => {
            if announced.is_some_and(|announced| announced != session_id) {
                return Transition::unchanged(state);
            }
            if state.phase != P::Matching {
                return Transition::unchanged(state);
            }
            let effects = if initiator == Some(false) {
                Vec::new()
            } else {
                vec![Effect::StartOffer]
            };
            Transition::to(
                CallSessionState {
                    phase: P::Negotiating,
                    session_id: Some(session_id),
                    peer_id: state.peer_id.or(peer_id),
                    room_id,
                },
                effects,
            )
        }

        SignalingMessage::Offer { offer } => match state.phase {
            P::Matching | P::Negotiating | P::Connected => Transition::to(
                CallSessionState {
                    phase: P::Negotiating,
                    ..state.clone()
                },
                vec![Effect::AcceptOffer(offer)],
            ),
            _ => Transition::unchanged(state),
        },

        SignalingMessage::Answer { answer } => match state.phase {
            P::Negotiating => {
                let mut t = Transition::unchanged(state);
                t.effects.push(Effect::ApplyAnswer(answer));
                t
            }
            _ => Transition::unchanged(state),
        },

        SignalingMessage::IceCandidate { candidate } => match state.phase {
            P::Matching | P::Negotiating | P::Connected => {
                let mut t = Transition::unchanged(state);
                t.effects.push(Effect::ApplyCandidate(candidate));
                t
            }
            _ => Transition::unchanged(state),
        },

        SignalingMessage::UserDisconnected => match state.phase {
            P::Matching | P::Negotiating | P::Connected => Transition::reset(vec![
                Effect::TeardownNegotiation,
                Effect::EndSession { session_id },
                Effect::CloseSignaling,
                Effect::Notify(Notice::PeerDisconnected),
            ]),
            _ => Transition::unchanged(state),
        },

        SignalingMessage::MatchCancelled => match state.phase {
            P::Matching => Transition::reset(vec![
                Effect::CloseSignaling,
                Effect::Notify(Notice::MatchCancelled),
            ]),
            _ => Transition::unchanged(state),
        },

        SignalingMessage::Ping => {
            let mut t = Transition::unchanged(state);
            t.effects.push(Effect::Send(SignalingMessage::Pong));
            t
        }

        SignalingMessage::Pong => Transition::unchanged(state),
    }
}
