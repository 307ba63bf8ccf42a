//! WebSocket framing for envelopes, plus the TCP reachability probe.
//!
//! The curator link, outbound peer links and inbound peer connections all
//! exchange one JSON envelope per text frame through these helpers.

use futures::{Sink, SinkExt, Stream, StreamExt};
use mesh_core::{Envelope, ProtocolError};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, warn};

/// A client-side WebSocket (curator link and outbound peer links).
pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{addr} is not available by TCP: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Connection closed")]
    Closed,

    #[error("Binary frame is not UTF-8")]
    NotUtf8,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// `ws://<host:port><path>`
pub fn ws_url(addr: &str, path: &str) -> String {
    format!("ws://{}{}", addr, path)
}

/// Check that `addr` accepts a TCP connection within `timeout`.
///
/// The probe connection is closed immediately.
pub async fn probe(addr: &str, timeout: Duration) -> Result<(), TransportError> {
    let reason = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(_) => format!("timed out after {:?}", timeout),
    };
    warn!("{} is not available by TCP: {}", addr, reason);
    Err(TransportError::Unreachable {
        addr: addr.to_string(),
        reason,
    })
}

/// Open a client WebSocket to `url`.
pub async fn connect(url: &str) -> Result<ClientStream, TransportError> {
    let (ws, _response) = connect_async(url).await?;
    debug!("WebSocket connected to {}", url);
    Ok(ws)
}

/// Send one envelope as a text frame.
pub async fn send_envelope<S>(sink: &mut S, envelope: &Envelope) -> Result<(), TransportError>
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(envelope.to_json().into())).await?;
    Ok(())
}

/// Receive the next envelope, skipping control frames.
///
/// A close frame or end of stream is [`TransportError::Closed`]; a frame that
/// does not decode is an error too, since the peer is not speaking the protocol.
pub async fn recv_envelope<S>(stream: &mut S) -> Result<Envelope, TransportError>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(Envelope::from_json(text.as_str())?),
            Some(Ok(Message::Binary(data))) => {
                let text = std::str::from_utf8(&data).map_err(|_| TransportError::NotUtf8)?;
                return Ok(Envelope::from_json(text)?);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(Message::Frame(_))) => continue,
            Some(Ok(Message::Close(_))) => return Err(TransportError::Closed),
            Some(Err(WsError::ConnectionClosed)) | Some(Err(WsError::AlreadyClosed)) => {
                return Err(TransportError::Closed);
            }
            Some(Err(e)) => return Err(e.into()),
            None => return Err(TransportError::Closed),
        }
    }
}
