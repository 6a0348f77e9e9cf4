//! Websocket-backed [`RealtimeProvider`].
//!
//! Each listener opens one websocket to `<base_url>/<path>`, authenticated
//! with the current identity token, and forwards text and binary frames as
//! raw bytes. A close frame (or EOF) ends the listener; cancelling the
//! listener closes the socket.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{stream, SinkExt, StreamExt};
use reqwest::Url;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async_with_config;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::provider::{Listener, ListenerGuard, RealtimeProvider};
use crate::error::{RealtimeError, TokenError};
use crate::token::TokenProvider;

const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
const LISTENER_BUFFER: usize = 64;

/// Opens one websocket per listener.
#[derive(Clone)]
pub struct WebsocketProvider {
    base_url: String,
    tokens: Arc<dyn TokenProvider>,
}

impl std::fmt::Debug for WebsocketProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketProvider")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl WebsocketProvider {
    pub fn new(base_url: impl Into<String>, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            base_url: base_url.into(),
            tokens,
        }
    }

    /// Resolves the websocket URL for `path`, mapping http(s) to ws(s).
    pub fn listener_url(&self, path: &str) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|_| RealtimeError::Provider(format!("invalid realtime url {}", self.base_url)))?;
        let scheme = match url.scheme() {
            "https" | "wss" => "wss",
            "http" | "ws" => "ws",
            other => {
                return Err(RealtimeError::Provider(format!(
                    "unsupported realtime scheme {other}"
                )))
            }
        };
        if url.scheme() != scheme {
            url.set_scheme(scheme)
                .map_err(|_| RealtimeError::Provider("cannot switch to websocket scheme".into()))?;
        }
        let joined = format!(
            "{}/{}",
            url.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

impl RealtimeProvider for WebsocketProvider {
    fn add_listener(&self, path: &str) -> Result<Listener, RealtimeError> {
        let url = self.listener_url(path)?;
        let (tx, rx) = mpsc::channel(LISTENER_BUFFER);
        let cancel = CancellationToken::new();

        tokio::spawn(run_listener(
            url,
            self.tokens.clone(),
            tx,
            cancel.clone(),
        ));

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Listener::new(
            Box::pin(stream),
            ListenerGuard::new(move || cancel.cancel()),
        ))
    }
}

type Forward = mpsc::Sender<Result<Bytes, RealtimeError>>;

async fn run_listener(
    url: Url,
    tokens: Arc<dyn TokenProvider>,
    tx: Forward,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {
            debug!(url = %url, "websocket listener cancelled before connecting");
        }
        result = session(&url, tokens, &tx, &cancel) => {
            if let Err(err) = result {
                warn!(url = %url, error = %err, "websocket listener failed");
                let _ = tx.send(Err(err)).await;
            }
        }
    }
}

async fn handshake_request(
    url: &Url,
    tokens: Arc<dyn TokenProvider>,
) -> Result<Request<()>, RealtimeError> {
    let token = tokens.id_token().await.map_err(|err| match err {
        TokenError::Unauthenticated => RealtimeError::PermissionDenied(err.to_string()),
        TokenError::Resolver(cause) => RealtimeError::Provider(cause),
    })?;
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| RealtimeError::Provider(err.to_string()))?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|_| RealtimeError::Provider("token is not a valid header value".into()))?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

async fn session(
    url: &Url,
    tokens: Arc<dyn TokenProvider>,
    tx: &Forward,
    cancel: &CancellationToken,
) -> Result<(), RealtimeError> {
    let request = handshake_request(url, tokens).await?;

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let (mut socket, _) = connect_async_with_config(request, Some(config), false)
        .await
        .map_err(|err| RealtimeError::Provider(err.to_string()))?;
    debug!(url = %url, "websocket listener connected");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = socket.close(None).await;
                return Ok(());
            }
            frame = socket.next() => frame,
        };
        let payload = match frame {
            Some(Ok(WsMessage::Text(text))) => Bytes::from(text),
            Some(Ok(WsMessage::Binary(bytes))) => Bytes::from(bytes),
            Some(Ok(WsMessage::Ping(payload))) => {
                socket
                    .send(WsMessage::Pong(payload))
                    .await
                    .map_err(|err| RealtimeError::Provider(err.to_string()))?;
                continue;
            }
            Some(Ok(WsMessage::Pong(_))) | Some(Ok(WsMessage::Frame(_))) => continue,
            Some(Ok(WsMessage::Close(_))) | None => {
                debug!(url = %url, "websocket listener closed by peer");
                return Ok(());
            }
            Some(Err(err)) => return Err(RealtimeError::Provider(err.to_string())),
        };
        if tx.send(Ok(payload)).await.is_err() {
            // Nobody reads the listener anymore.
            let _ = socket.close(None).await;
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::TokenFactory;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;
    use tokio::time::timeout;
    use tokio_tungstenite::accept_hdr_async;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as ServerRequest, Response as ServerResponse,
    };

    fn provider(base_url: &str, tokens: TokenFactory) -> WebsocketProvider {
        WebsocketProvider::new(base_url, Arc::new(tokens))
    }

    #[test]
    fn listener_url_switches_scheme_and_joins_path() {
        let tokens = TokenFactory::new_from_static_token("t");
        let url = provider("https://rt.example.com/v1/", tokens.clone())
            .listener_url("/rooms/1")
            .unwrap();
        assert_eq!(url.as_str(), "wss://rt.example.com/v1/rooms/1");

        let url = provider("http://127.0.0.1:8080", tokens.clone())
            .listener_url("rooms/1")
            .unwrap();
        assert_eq!(url.as_str(), "ws://127.0.0.1:8080/rooms/1");

        assert!(provider("ftp://example.com", tokens)
            .listener_url("rooms/1")
            .is_err());
    }

    #[tokio::test]
    async fn forwards_frames_until_close() {
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (auth_tx, auth_rx) = oneshot::channel();

        tokio::spawn(async move {
            let (tcp, _) = server.accept().await.unwrap();
            let callback = |request: &ServerRequest, response: ServerResponse| {
                let header = request
                    .headers()
                    .get("authorization")
                    .and_then(|value| value.to_str().ok())
                    .map(str::to_string);
                let _ = auth_tx.send((request.uri().path().to_string(), header));
                Ok::<_, ErrorResponse>(response)
            };
            let mut socket = accept_hdr_async(tcp, callback).await.unwrap();
            socket.send(WsMessage::Text("hello".into())).await.unwrap();
            socket
                .send(WsMessage::Binary(vec![1, 2, 3]))
                .await
                .unwrap();
            socket.close(None).await.unwrap();
        });

        let listener = provider(
            &format!("http://{addr}"),
            TokenFactory::new_from_static_token("id-1"),
        )
        .add_listener("rooms/1")
        .unwrap();
        let items: Vec<_> = timeout(Duration::from_secs(5), listener.stream.collect::<Vec<_>>())
            .await
            .unwrap();

        assert_eq!(
            items,
            vec![
                Ok(Bytes::from_static(b"hello")),
                Ok(Bytes::from_static(&[1, 2, 3]))
            ]
        );
        let (path, header) = auth_rx.await.unwrap();
        assert_eq!(path, "/rooms/1");
        assert_eq!(header.as_deref(), Some("Bearer id-1"));
    }

    #[tokio::test]
    async fn signed_out_listener_reports_permission_denied() {
        let listener = provider("http://127.0.0.1:9", TokenFactory::SignedOut)
            .add_listener("rooms/1")
            .unwrap();
        let items: Vec<_> = timeout(Duration::from_secs(5), listener.stream.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(matches!(
            items.as_slice(),
            [Err(RealtimeError::PermissionDenied(_))]
        ));
    }

    #[tokio::test]
    async fn unreachable_server_reports_provider_error() {
        let listener = provider("http://127.0.0.1:9", TokenFactory::new_from_static_token("t"))
            .add_listener("rooms/1")
            .unwrap();
        let items: Vec<_> = timeout(Duration::from_secs(5), listener.stream.collect::<Vec<_>>())
            .await
            .unwrap();
        assert!(matches!(items.as_slice(), [Err(RealtimeError::Provider(_))]));
    }
}
