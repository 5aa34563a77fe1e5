pub mod matching;
pub mod signaling;

pub use matching::{Gender, Location, MatchCriteria, MatchResponse};
pub use signaling::{IceCandidate, SdpType, SessionDescription, SignalingMessage};
