pub mod websocket;

use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

pub use websocket::WsConnector;

#[derive(Debug, Error)]
pub enum LiveError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("invalid WebSocket url: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid session cookie header: {0}")]
    Header(#[from] tungstenite::http::header::InvalidHeaderValue),
}

pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String, LiveError>> + Send>>;

/// An open push connection for one room.
///
/// Text frames queued on `sender` are written to the socket; `frames` yields inbound text
/// frames and ends when the peer closes. Dropping both halves closes the connection.
pub struct LiveLink {
    pub sender: mpsc::Sender<String>,
    pub frames: FrameStream,
}

impl LiveLink {
    pub fn new(sender: mpsc::Sender<String>, frames: FrameStream) -> Self {
        Self { sender, frames }
    }
}

#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, room: &str) -> Result<LiveLink, LiveError>;
}
