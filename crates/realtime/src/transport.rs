//! Transport connection to the remote speech service.
//!
//! The session engine depends on the [`Connector`] trait, which yields a
//! split sink/stream pair so the send and receive pipelines can run
//! concurrently. The production implementation speaks JSON event frames over
//! a tokio-tungstenite WebSocket.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::error::{Error, Result};
use crate::protocol::{ClientEvent, ServerEvent};

/// Endpoint of the realtime service; the model is appended as a query
/// parameter.
pub const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Outbound half of a transport connection.
#[async_trait]
pub trait EventSink: Send {
    async fn send(&mut self, event: &ClientEvent) -> Result<()>;
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a transport connection.
#[async_trait]
pub trait EventStream: Send {
    /// Next inbound event. `None` once the connection is closed.
    async fn next_event(&mut self) -> Option<Result<ServerEvent>>;
}

/// Establishes one transport connection per session attempt.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        model: &str,
        api_key: &SecretString,
    ) -> Result<(Box<dyn EventSink>, Box<dyn EventStream>)>;
}

/// WebSocket connector for the realtime service.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    #[must_use]
    pub fn new() -> Self {
        Self {
            url: REALTIME_URL.to_string(),
        }
    }

    /// Overrides the endpoint, for gateways and test servers.
    #[must_use]
    pub fn with_url(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        model: &str,
        api_key: &SecretString,
    ) -> Result<(Box<dyn EventSink>, Box<dyn EventStream>)> {
        let url = format!("{}?model={}", self.url, model);
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", api_key.expose_secret()).parse()?,
        );
        request
            .headers_mut()
            .insert("OpenAI-Beta", "realtime=v1".parse()?);

        let (ws_stream, _) = connect_async(request).await?;
        tracing::info!(model, "connected to realtime service");

        let (sink, stream) = ws_stream.split();
        Ok((
            Box::new(WsEventSink { sink }),
            Box::new(WsEventStream { stream }),
        ))
    }
}

struct WsEventSink {
    sink: SplitSink<WsStream, WsMessage>,
}

#[async_trait]
impl EventSink for WsEventSink {
    async fn send(&mut self, event: &ClientEvent) -> Result<()> {
        let payload = serde_json::to_string(event)?;
        self.sink.send(WsMessage::Text(payload)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        match self.sink.close().await {
            Ok(()) | Err(WsError::ConnectionClosed) | Err(WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

struct WsEventStream {
    stream: SplitStream<WsStream>,
}

#[async_trait]
impl EventStream for WsEventStream {
    async fn next_event(&mut self) -> Option<Result<ServerEvent>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(serde_json::from_str::<ServerEvent>(&text).map_err(Error::from));
                }
                // Control frames carry no events for us.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Binary(_)
                    | WsMessage::Frame(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return None,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return None,
                Some(Err(e)) => return Some(Err(e.into())),
            }
        }
    }
}
