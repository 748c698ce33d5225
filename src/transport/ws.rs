//! WebSocket connector backed by tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Command, Connector, Endpoint, Frame, Link, StompCodec, TransportError};

/// Opens STOMP sessions over a real WebSocket
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Link, TransportError> {
        info!("Opening broker socket: {}", endpoint.url);

        let (socket, _response) = connect_async(endpoint.url.as_str())
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;
        let (mut sink, mut stream) = socket.split();

        let connect = Frame::connect(&endpoint.host, endpoint.token.as_deref());
        sink.send(Message::Text(StompCodec::encode(&connect)))
            .await
            .map_err(|e| TransportError::WebSocket(e.to_string()))?;

        // Wait for the broker's answer, skipping heart-beats
        loop {
            let msg = match stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => return Err(TransportError::WebSocket(e.to_string())),
                None => return Err(TransportError::Closed),
            };

            let text = match msg {
                Message::Text(text) => text,
                Message::Close(_) => return Err(TransportError::Closed),
                _ => continue,
            };

            let Some(frame) = StompCodec::decode(&text)? else {
                continue;
            };

            match frame.command {
                Command::Connected => {
                    debug!(
                        "Broker session established (version {})",
                        frame.header("version").unwrap_or("unknown")
                    );
                    break;
                }
                Command::Error => {
                    let reason = frame
                        .header("message")
                        .map(str::to_string)
                        .or_else(|| frame.body_text().ok().map(str::to_string))
                        .unwrap_or_default();
                    return Err(TransportError::Rejected(reason));
                }
                other => {
                    return Err(TransportError::Handshake(format!(
                        "expected CONNECTED, got {}",
                        other
                    )));
                }
            }
        }

        let (link, mut peer) = Link::pair();

        // Forward outbound frames to the socket
        tokio::spawn(async move {
            while let Some(frame) = peer.outbound_rx.recv().await {
                let disconnect = frame.command == Command::Disconnect;
                if sink
                    .send(Message::Text(StompCodec::encode(&frame)))
                    .await
                    .is_err()
                {
                    break;
                }
                if disconnect {
                    break;
                }
            }
            let _ = sink.close().await;
            debug!("Broker writer ended");
        });

        // Forward decoded socket frames to the link
        let inbound_tx = peer.inbound_tx;
        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                match msg {
                    Ok(Message::Text(text)) => match StompCodec::decode(&text) {
                        Ok(Some(frame)) => {
                            if inbound_tx.send(frame).is_err() {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping undecodable frame: {}", e),
                    },
                    Ok(Message::Close(_)) => {
                        info!("Broker closed the socket");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Broker socket error: {}", e);
                        break;
                    }
                }
            }
            debug!("Broker reader ended");
        });

        Ok(link)
    }
}
