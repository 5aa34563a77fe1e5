pub use callcore::net::{Transport, TransportEvent, TransportFactory};
pub use matchcall_tokio_transport::TokioWebSocketTransportFactory;
