//! Negotiation phase machine.
//!
//! One [`NegotiationPhase`] exists per negotiation attempt. A new offer or
//! answer cycle never rewinds an existing phase: the owner discards the
//! attempt and starts a fresh one from [`NegotiationPhase::Idle`].

use serde::Serialize;

/// Current phase of a single offer/answer negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum NegotiationPhase {
    /// Transport created, nothing exchanged yet.
    #[default]
    Idle,
    /// Creating and applying the local offer.
    Offering,
    /// Offer sent, waiting for the peer's answer.
    AwaitingAnswer,
    /// Remote offer applied, creating the local answer.
    Answering,
    /// Both descriptions set; waiting for inbound media.
    ConnectedPending,
    /// Inbound media is live.
    Connected,
    /// Torn down. Terminal.
    Closed,
}

impl NegotiationPhase {
    /// Whether the remote description has been applied, which is the
    /// precondition for adding remote ICE candidates.
    pub fn has_remote_description(&self) -> bool {
        matches!(
            self,
            Self::Answering | Self::ConnectedPending | Self::Connected
        )
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Inputs that move a negotiation forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStep {
    BeginOffer,
    OfferSent,
    BeginAnswer,
    AnswerSent,
    AnswerReceived,
    MediaLive,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub current_phase: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in phase {}",
            self.attempted, self.current_phase
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl NegotiationPhase {
    /// Returns the phase reached by applying `step`, or an error if the step
    /// is not allowed from the current phase.
    pub fn advance(self, step: NegotiationStep) -> Result<Self, InvalidTransition> {
        use NegotiationPhase as P;
        use NegotiationStep as S;

        let next = match (self, step) {
            (P::Closed, _) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", self),
                    attempted: format!("{:?}", step),
                });
            }
            (_, S::Close) => P::Closed,
            (P::Idle, S::BeginOffer) => P::Offering,
            (P::Offering, S::OfferSent) => P::AwaitingAnswer,
            (P::Idle, S::BeginAnswer) => P::Answering,
            (P::Answering, S::AnswerSent) => P::ConnectedPending,
            (P::AwaitingAnswer, S::AnswerReceived) => P::ConnectedPending,
            (P::ConnectedPending, S::MediaLive) => P::Connected,
            (current, attempted) => {
                return Err(InvalidTransition {
                    current_phase: format!("{:?}", current),
                    attempted: format!("{:?}", attempted),
                });
            }
        };
        Ok(next)
    }
}
