//! Pluggable transport for the telemetry stream.
//!
//! The connection state machine only sees a sink of outgoing text frames and
//! a stream of incoming ones; the default [`WsConnector`] backs both with a
//! WebSocket.

use crate::error::TransportError;
use async_trait::async_trait;
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use log::debug;
use std::pin::Pin;

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = BoxStream<'static, Result<String, TransportError>>;

/// An open full-duplex text channel.
pub struct Channel {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &str) -> Result<Channel, TransportError>;
}

/// WebSocket connector.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Channel, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        let sink = ws_sender
            .with(|text: String| async move { Ok::<_, async_tungstenite::tungstenite::Error>(Message::Text(text.into())) })
            .sink_map_err(TransportError::from);

        let stream = ws_receiver.filter_map(|frame| async move {
            match frame {
                Ok(Message::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(Message::Binary(data)) => match String::from_utf8(data.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("Dropping non-UTF-8 binary frame ({} bytes)", data.len());
                        None
                    }
                },
                Ok(Message::Close(_)) => Some(Err(TransportError::Closed)),
                Ok(_) => None,
                Err(e) => Some(Err(e.into())),
            }
        });

        Ok(Channel {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        })
    }
}
