pub use callcore;

pub mod types {
    pub mod events;
    pub use callcore::types::*;
}

pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod keepalive;
pub mod location;
pub mod matching;
pub mod media;
pub mod negotiator;
pub mod signaling;
pub mod transport;
pub mod webrtc;

#[cfg(test)]
mod test_utils;

pub use auth::{CredentialProvider, SharedCredentials, StaticCredentials};
pub use callcore::session::{CallSessionState, Notice, SessionPhase, SessionView};
pub use config::ClientConfig;
pub use controller::{CallSessionController, CallSessionControllerBuilder};
pub use error::{BuildError, CallError};
