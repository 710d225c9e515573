//! Socket seam between the transport channel and the platform connection
//!
//! The channel actor talks to a [`Connection`]: an outbound frame sender and
//! an inbound frame receiver. The production [`WsConnector`] dials the
//! backend over WebSocket and pumps frames between the socket and the pipes;
//! tests substitute an in-memory connector.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use crate::{Error, Result};

/// Depth of the per-connection frame pipes
const PIPE_DEPTH: usize = 64;

/// A raw frame on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

/// A live full-duplex connection
///
/// Frames pushed into `outgoing` are written to the peer in order. Frames
/// read from the peer arrive on `incoming`; `incoming` closing is the
/// platform-level close signal.
pub struct Connection {
    pub outgoing: mpsc::Sender<WireFrame>,
    pub incoming: mpsc::Receiver<WireFrame>,
}

/// Dials one connection per call
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a connection to `url`
    ///
    /// # Errors
    ///
    /// Returns an error when the dial fails.
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// Production connector over tokio-tungstenite
#[derive(Debug, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let (stream, _response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| Error::Transport(format!("connect to {url} failed: {e}")))?;
        let (mut sink, mut source) = stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<WireFrame>(PIPE_DEPTH);
        let (in_tx, in_rx) = mpsc::channel::<WireFrame>(PIPE_DEPTH);

        // Writer: drain outbound frames into the socket until the channel
        // or the socket closes
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let message = match frame {
                    WireFrame::Text(text) => Message::Text(text.into()),
                    WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
                };
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "socket write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        // Reader: surface text and binary frames until close or error
        tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if in_tx.send(WireFrame::Text(text.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Binary(bytes)) => {
                        if in_tx.send(WireFrame::Binary(bytes.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(frame = ?frame, "socket closed by peer");
                        break;
                    }
                    // Ping/pong control frames are answered by the library
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
        });

        Ok(Connection {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
