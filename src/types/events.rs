use crate::media::RemoteMedia;
use callcore::error::CallError;
use callcore::session::{Notice, SessionView};
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Published whenever the negotiator's inbound media changes. `None` means
/// remote media was cleared.
#[derive(Debug, Clone)]
pub struct RemoteMediaChanged {
    pub media: Option<RemoteMedia>,
}

macro_rules! define_event_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed event bus with one broadcast channel per event type.
        #[derive(Debug)]
        pub struct EventBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl EventBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_event_bus! {
    (state, Arc<SessionView>),
    (notice, Arc<Notice>),
    (error, Arc<CallError>),
    (remote_media, Arc<RemoteMediaChanged>),
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
