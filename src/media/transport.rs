use crate::error::MediaError;
use async_trait::async_trait;
use async_tungstenite::tokio::connect_async;
use async_tungstenite::tungstenite::Message;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{Sink, SinkExt, StreamExt};
use log::debug;
use std::pin::Pin;
use std::time::Duration;

/// Body of a pulled media stream.
pub type ByteStream = BoxStream<'static, Result<Bytes, MediaError>>;

/// Outbound binary channel; dropping or closing it releases the connection.
pub type ChunkSink = Pin<Box<dyn Sink<Bytes, Error = MediaError> + Send>>;

/// Network access of the media layer.
#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// True when `url` answers 2xx within `timeout`.
    async fn probe(&self, url: &str, timeout: Duration) -> bool;

    async fn open_pull(&self, url: &str) -> Result<ByteStream, MediaError>;

    async fn open_push(&self, url: &str) -> Result<ChunkSink, MediaError>;
}

/// reqwest for pulls and probes, WebSocket for push-to-talk.
#[derive(Debug, Clone, Default)]
pub struct HttpMediaTransport {
    client: reqwest::Client,
}

impl HttpMediaTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaTransport for HttpMediaTransport {
    async fn probe(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe of {} failed: {}", url, e);
                false
            }
        }
    }

    async fn open_pull(&self, url: &str) -> Result<ByteStream, MediaError> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        debug!(
            "Pulling {} ({})",
            url,
            response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown type")
        );
        Ok(response.bytes_stream().map(|chunk| chunk.map_err(MediaError::from)).boxed())
    }

    async fn open_push(&self, url: &str) -> Result<ChunkSink, MediaError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| MediaError::Channel(e.to_string()))?;
        let (ws_sender, ws_receiver) = ws_stream.split();

        // keep reading so control frames get answered; ends with the socket
        tokio::spawn(ws_receiver.for_each(|_| async {}));

        let sink = ws_sender
            .sink_map_err(|e| MediaError::Channel(e.to_string()))
            .with(|chunk: Bytes| async move { Ok::<_, MediaError>(Message::Binary(chunk)) });
        Ok(Box::pin(sink))
    }
}
