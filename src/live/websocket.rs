use async_trait::async_trait;
use futures::{ SinkExt, StreamExt };
use log::{ debug, error, info, warn };
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{ self, client::IntoClientRequest, protocol::Message };
use tokio_tungstenite::tungstenite::http::{ header::COOKIE, HeaderValue };
use url::Url;

use super::{ LiveConnector, LiveError, LiveLink };

const OUTBOUND_BUFFER: usize = 32;
const INBOUND_BUFFER: usize = 64;
const MAX_MESSAGE_SIZE: usize = 1 * 1024 * 1024;

/// Dials `{ws_base}/chat/{room}/`, presenting the REST session cookie on the handshake.
#[derive(Debug, Clone)]
pub struct WsConnector {
    ws_base: String,
    cookie: Option<String>,
}

impl WsConnector {
    pub fn new(ws_base: &str, cookie: Option<String>) -> Result<Self, LiveError> {
        let ws_base = ws_base.trim().trim_end_matches('/').to_string();
        Url::parse(&ws_base)?;
        Ok(Self {
            ws_base,
            cookie: cookie.filter(|c| !c.trim().is_empty()),
        })
    }

    pub fn room_url(&self, room: &str) -> Result<Url, LiveError> {
        Ok(Url::parse(&format!("{}/chat/{}/", self.ws_base, room))?)
    }
}

#[async_trait]
impl LiveConnector for WsConnector {
    async fn connect(&self, room: &str) -> Result<LiveLink, LiveError> {
        let url = self.room_url(room)?;
        let mut request = url.as_str().into_client_request()?;
        if let Some(cookie) = &self.cookie {
            request.headers_mut().insert(COOKIE, HeaderValue::from_str(cookie)?);
        }

        let (socket, response) = connect_async(request).await?;
        info!("Live channel connected: {} ({})", url, response.status());

        let (mut sink, mut stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<Result<String, LiveError>>(INBOUND_BUFFER);

        let writer_url = url.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    error!("Error sending frame to {}: {}", writer_url, e);
                    break;
                }
            }
            debug!("Outbound queue for {} closed, closing socket", writer_url);
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(msg) = stream.next().await {
                let forwarded = match msg {
                    Ok(Message::Text(text)) => {
                        if text.len() > MAX_MESSAGE_SIZE {
                            warn!(
                                "Frame from {} exceeds size limit ({} > {}), dropping",
                                url,
                                text.len(),
                                MAX_MESSAGE_SIZE
                            );
                            continue;
                        }
                        in_tx.send(Ok(text)).await
                    }
                    Ok(Message::Close(frame)) => {
                        info!("Received close frame from {}: {:?}", url, frame);
                        break;
                    }
                    // tungstenite queues the pong reply itself
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {
                        continue;
                    }
                    Ok(Message::Binary(_)) => {
                        warn!("Ignoring binary frame from {}", url);
                        continue;
                    }
                    Err(tungstenite::Error::ConnectionClosed) => {
                        info!("Live channel {} closed", url);
                        break;
                    }
                    Err(e) => {
                        let _ = in_tx.send(Err(LiveError::WebSocket(e))).await;
                        break;
                    }
                };
                if forwarded.is_err() {
                    debug!("Live channel {} no longer observed", url);
                    break;
                }
            }
        });

        Ok(LiveLink::new(out_tx, Box::pin(ReceiverStream::new(in_rx))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{ ErrorResponse, Request, Response };

    #[test]
    fn room_url_joins_base_and_room() {
        let connector = WsConnector::new("ws://localhost:8000/ws/", None).unwrap();
        assert_eq!(
            connector.room_url("alice_bob").unwrap().as_str(),
            "ws://localhost:8000/ws/chat/alice_bob/"
        );
    }

    #[test]
    fn rejects_invalid_base() {
        assert!(WsConnector::new("not a url", None).is_err());
    }

    #[tokio::test]
    async fn exchanges_frames_with_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut seen_path = String::new();
            let mut seen_cookie = String::new();
            let callback = |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
                seen_path = req.uri().path().to_string();
                seen_cookie = req
                    .headers()
                    .get("cookie")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Ok(response)
            };
            let mut ws = accept_hdr_async(stream, callback).await.unwrap();
            ws.send(Message::Text(r#"{"id":"1","sender":"alice","text":"hi"}"#.into())).await.unwrap();
            let received = loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => break text,
                    Some(Ok(_)) => continue,
                    other => panic!("unexpected {:?}", other),
                }
            };
            ws.close(None).await.unwrap();
            (seen_path, seen_cookie, received)
        });

        let connector = WsConnector::new(
            &format!("ws://{}/ws", addr),
            Some("sessionid=abc".to_string())
        ).unwrap();
        let LiveLink { sender, mut frames } = connector.connect("alice_bob").await.unwrap();

        let first = frames.next().await.unwrap().unwrap();
        assert!(first.contains("\"hi\""));

        sender.send(r#"{"text":"yo","sender":"bob"}"#.to_string()).await.unwrap();
        assert!(frames.next().await.is_none());

        let (path, cookie, received) = server.await.unwrap();
        assert_eq!(path, "/ws/chat/alice_bob/");
        assert_eq!(cookie, "sessionid=abc");
        assert_eq!(received, r#"{"text":"yo","sender":"bob"}"#);
    }
}
