//! Tokio-based WebSocket transport for the signaling channel.
//!
//! Provides a concrete implementation of [`callcore::net::Transport`] using
//! tokio-tungstenite. Text frames are passed through untouched; the
//! signaling layer owns the message format.

use async_trait::async_trait;
use callcore::net::{Transport, TransportEvent, TransportFactory};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, trace, warn};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type RawWs = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<RawWs, Message>;
type WsStream = SplitStream<RawWs>;

const EVENT_CHANNEL_CAPACITY: usize = 100;

/// One signaling connection. The sink is taken on disconnect so late sends fail.
pub struct TokioWebSocketTransport {
    outbound: Mutex<Option<WsSink>>,
}

#[async_trait]
impl Transport for TokioWebSocketTransport {
    async fn send(&self, text: &str) -> Result<(), anyhow::Error> {
        let mut outbound = self.outbound.lock().await;
        let Some(sink) = outbound.as_mut() else {
            anyhow::bail!("signaling socket already closed");
        };
        trace!("--> {} byte text frame", text.len());
        sink.send(Message::text(text.to_owned()))
            .await
            .map_err(|e| anyhow::anyhow!("signaling send failed: {e}"))
    }

    async fn disconnect(&self) {
        let Some(mut sink) = self.outbound.lock().await.take() else {
            return;
        };
        if let Err(e) = sink.close().await {
            debug!("closing signaling socket: {e}");
        }
    }
}

/// Dials `ws://` and `wss://` signaling endpoints.
#[derive(Debug, Clone, Default)]
pub struct TokioWebSocketTransportFactory;

impl TokioWebSocketTransportFactory {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TransportFactory for TokioWebSocketTransportFactory {
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error> {
        let target = redact_query(url);
        info!("Opening signaling socket to {target}");
        let (ws, _) = connect_async(url)
            .await
            .map_err(|e| anyhow::anyhow!("could not reach {target}: {e}"))?;

        let (sink, stream) = ws.split();
        let (events, receiver) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        // Connected must be first in the queue.
        events
            .send(TransportEvent::Connected)
            .await
            .map_err(|_| anyhow::anyhow!("event receiver dropped"))?;
        tokio::spawn(forward_frames(stream, events));

        let transport: Arc<dyn Transport> = Arc::new(TokioWebSocketTransport {
            outbound: Mutex::new(Some(sink)),
        });
        Ok((transport, receiver))
    }
}

/// Strips the query string so access tokens never reach the logs.
fn redact_query(url: &str) -> &str {
    url.split_once('?').map_or(url, |(base, _)| base)
}

/// What the reader does with one inbound frame.
enum Inbound {
    Deliver(String),
    Skip,
    Closed(Option<u16>),
}

fn classify(frame: Message) -> Inbound {
    match frame {
        Message::Text(text) => Inbound::Deliver(text.as_str().to_owned()),
        Message::Close(frame) => Inbound::Closed(frame.map(|f| u16::from(f.code))),
        Message::Binary(data) => {
            debug!("dropping {} byte binary frame", data.len());
            Inbound::Skip
        }
        _ => Inbound::Skip,
    }
}

async fn forward_frames(mut stream: WsStream, events: mpsc::Sender<TransportEvent>) {
    let code = loop {
        let frame = match stream.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!("signaling socket read failed: {e}");
                break None;
            }
            None => break None,
        };
        match classify(frame) {
            Inbound::Deliver(text) => {
                trace!("<-- {} byte text frame", text.len());
                if events.send(TransportEvent::MessageReceived(text)).await.is_err() {
                    break None;
                }
            }
            Inbound::Skip => {}
            Inbound::Closed(code) => {
                debug!("signaling socket closed by server ({code:?})");
                break code;
            }
        }
    };
    let _ = events.send(TransportEvent::Disconnected { code }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

    #[test]
    fn test_redact_query() {
        assert_eq!(
            redact_query("ws://h/ws/signaling/s1/?token=secret"),
            "ws://h/ws/signaling/s1/"
        );
        assert_eq!(redact_query("ws://h/ws"), "ws://h/ws");
    }

    #[tokio::test]
    async fn test_text_frames_and_close_code_are_reported() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let echoed = ws.next().await.unwrap().unwrap();
            ws.send(echoed).await.unwrap();
            ws.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Away,
                reason: "bye".into(),
            })))
            .await
            .unwrap();
        });

        let factory = TokioWebSocketTransportFactory::new();
        let (transport, mut events) = factory
            .create_transport(&format!("ws://{addr}/"))
            .await
            .unwrap();

        assert_eq!(events.recv().await, Some(TransportEvent::Connected));
        transport.send(r#"{"type":"ping"}"#).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::MessageReceived(r#"{"type":"ping"}"#.into()))
        );
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Disconnected { code: Some(1001) })
        );

        server.await.unwrap();
        transport.disconnect().await;
        assert!(transport.send("late").await.is_err());
    }
}
