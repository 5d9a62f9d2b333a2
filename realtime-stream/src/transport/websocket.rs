//! WebSocket transport over tokio-tungstenite

use std::borrow::Cow;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

use super::{
    Connector, TransportCommand, TransportEvent, TransportHandle, CLOSE_ABNORMAL, CLOSE_NO_STATUS,
};
use crate::error::{StreamError, StreamResult};

/// Connects to `ws://` and `wss://` endpoints.
///
/// Each connection gets a pump task that owns the socket, forwarding
/// commands to the sink and stream messages to the event channel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> StreamResult<TransportHandle> {
        let (socket, response) = connect_async(url.as_str())
            .await
            .map_err(|e| StreamError::Transport(e.to_string()))?;
        debug!(status = %response.status(), "WebSocket handshake complete");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(socket, command_rx, event_tx));

        Ok(TransportHandle {
            sender: command_tx,
            events: event_rx,
        })
    }
}

async fn pump<S>(
    socket: WebSocketStream<S>,
    mut commands: mpsc::UnboundedReceiver<TransportCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();

    let closed = |code: u16, reason: String| {
        let _ = events.send(TransportEvent::Closed { code, reason });
    };

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(TransportCommand::Text(text)) => {
                    if let Err(e) = sink.send(Message::Text(text)).await {
                        let _ = events.send(TransportEvent::Error(e.to_string()));
                        closed(CLOSE_ABNORMAL, e.to_string());
                        return;
                    }
                }
                Some(TransportCommand::Close { code, reason }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Owned(reason),
                    };
                    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                        debug!("Close frame not delivered: {}", e);
                    }
                    return;
                }
                // client dropped the handle without closing
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                }
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    let _ = events.send(TransportEvent::Message(text));
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        let _ = events.send(TransportEvent::Message(text));
                    }
                    Err(_) => debug!("Ignoring non-UTF-8 binary message"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((CLOSE_NO_STATUS, String::new()));
                    closed(code, reason);
                    return;
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(other)) => trace!("Ignoring control message: {:?}", other),
                Some(Err(e)) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                    closed(CLOSE_ABNORMAL, e.to_string());
                    return;
                }
                None => {
                    closed(CLOSE_ABNORMAL, "stream ended".to_string());
                    return;
                }
            }
        }
    }
}
