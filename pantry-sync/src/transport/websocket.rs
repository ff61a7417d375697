//! WebSocket data channels.
//!
//! Each frame travels as one binary WebSocket message. A bridge task pair
//! per socket turns the socket into [`ChannelHalves`]:
//!
//! ```text
//! outbound mpsc ──► writer task ──► ws sink
//! ws stream     ──► reader task ──► inbound mpsc
//! ```

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::TransportError;
use crate::transport::{ChannelHalves, Endpoint, Listener, Transport};

/// Dials `ws://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }

    /// Listen on `bind_addr` (e.g. `127.0.0.1:0`) and accept channels.
    pub async fn bind(bind_addr: &str) -> Result<Listener, TransportError> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local = listener.local_addr()?;
        let endpoint = Endpoint::WebSocket(format!("ws://{local}"));
        log::info!("Data channel listener on {endpoint}");

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let (stream, addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        log::error!("Accept failed on {local}: {e}");
                        continue;
                    }
                };
                if incoming_tx.is_closed() {
                    break;
                }
                let incoming_tx = incoming_tx.clone();
                tokio::spawn(async move {
                    match tokio_tungstenite::accept_async(stream).await {
                        Ok(ws) => {
                            log::debug!("Data channel accepted from {addr}");
                            let _ = incoming_tx.send(bridge(ws));
                        }
                        Err(e) => log::warn!("WebSocket handshake from {addr} failed: {e}"),
                    }
                });
            }
            log::debug!("Data channel listener on {local} stopped");
        });

        Ok(Listener {
            endpoint,
            incoming: incoming_rx,
        })
    }
}

impl Transport for WebSocketTransport {
    fn dial(&self, endpoint: &Endpoint) -> BoxFuture<'static, Result<ChannelHalves, TransportError>> {
        let target = endpoint.clone();
        Box::pin(async move {
            let url = match target {
                Endpoint::WebSocket(url) => url,
                other => return Err(TransportError::BadEndpoint(other.to_string())),
            };
            let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .map_err(|e| TransportError::DialFailed(format!("{url}: {e}")))?;
            log::debug!("Data channel dialed {url}");
            Ok(bridge(ws))
        })
    }
}

/// Spawn the reader/writer pair for one socket.
fn bridge<S>(ws: WebSocketStream<S>) -> ChannelHalves
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                log::debug!("WebSocket write failed: {e}");
                return;
            }
        }
        let _ = sink.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    if in_tx.send(data.into()).is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    log::debug!("WebSocket read failed: {e}");
                    break;
                }
            }
        }
    });

    ChannelHalves {
        outbound: out_tx,
        inbound: in_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_dial_exchange() {
        let mut listener = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let mut dialed = WebSocketTransport::new()
            .dial(&listener.endpoint)
            .await
            .unwrap();
        let mut accepted = listener.incoming.recv().await.unwrap();

        dialed.outbound.send(vec![1, 2, 3]).unwrap();
        assert_eq!(accepted.inbound.recv().await, Some(vec![1, 2, 3]));
        accepted.outbound.send(vec![4]).unwrap();
        assert_eq!(dialed.inbound.recv().await, Some(vec![4]));
    }

    #[tokio::test]
    async fn test_close_propagates() {
        let mut listener = WebSocketTransport::bind("127.0.0.1:0").await.unwrap();
        let dialed = WebSocketTransport::new()
            .dial(&listener.endpoint)
            .await
            .unwrap();
        let mut accepted = listener.incoming.recv().await.unwrap();

        drop(dialed);
        assert_eq!(accepted.inbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_memory_endpoint_rejected() {
        let err = WebSocketTransport::new()
            .dial(&Endpoint::Memory(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::BadEndpoint(_)));
    }
}
