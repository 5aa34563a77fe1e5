pub mod backoff;
pub mod error;
pub mod negotiation;
pub mod net;
pub mod session;
pub mod types;
