//! WebSocket transport.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use super::{Channel, ChannelEvent, CloseCode, Connector, TransportError};

/// Opens WebSocket channels with `tokio_tungstenite::connect_async`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

impl Connector for WsConnector {
    type Channel = WsChannel;

    async fn connect(&self, url: &Url) -> Result<WsChannel, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        log::debug!("WebSocket handshake with {} complete", url);
        Ok(WsChannel::new(stream))
    }
}

pub struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    failed: bool,
    finished: bool,
}

impl WsChannel {
    fn new(stream: WebSocketStream<MaybeTlsStream<TcpStream>>) -> Self {
        Self {
            stream,
            failed: false,
            finished: false,
        }
    }

    fn finish(&mut self, code: CloseCode, reason: String) -> Option<ChannelEvent> {
        self.finished = true;
        Some(ChannelEvent::Closed { code, reason })
    }
}

impl Channel for WsChannel {
    async fn send(&mut self, frame: String) -> Result<(), TransportError> {
        if self.finished {
            return Err(TransportError::Closed);
        }
        self.stream
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.finished {
            return None;
        }
        // tungstenite errors are fatal to the stream.
        if self.failed {
            return self.finish(CloseCode::ABNORMAL, "stream failed".into());
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(ChannelEvent::Frame(text.to_string())),
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => return Some(ChannelEvent::Frame(text)),
                    Err(_) => log::debug!("Ignoring non-UTF-8 binary frame ({} bytes)", data.len()),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (CloseCode(frame.code.into()), frame.reason.to_string()),
                        None => (CloseCode::NO_STATUS, String::new()),
                    };
                    return self.finish(code, reason);
                }
                // Ping/pong replies are written by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    return self.finish(CloseCode::ABNORMAL, "connection dropped".into());
                }
                Some(Err(e)) => {
                    self.failed = true;
                    return Some(ChannelEvent::Error(e.to_string()));
                }
            }
        }
    }

    async fn close(&mut self, code: CloseCode, reason: String) -> Result<(), TransportError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        let frame = CloseFrame {
            code: code.0.into(),
            reason: reason.into(),
        };
        match self.stream.close(Some(frame)).await {
            Ok(()) | Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }
}
