use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::warn;

use rally_types::events::ClientFrame;

use crate::error::RealtimeError;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open the transport, authenticating with a bearer token on the handshake
/// request. The server validates it at the HTTP upgrade layer.
pub(crate) async fn open(url: &str, token: &str) -> Result<WsStream, RealtimeError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    request.headers_mut().insert("Authorization", value);

    let (stream, _) = connect_async(request)
        .await
        .map_err(|e| RealtimeError::Connect(e.to_string()))?;
    Ok(stream)
}

/// Drive one established connection: forward outbound frames to the sink
/// and hand inbound text to `on_text`. Returns when the socket closes, the
/// peer errors, or shutdown is signalled.
pub(crate) async fn pump(
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientFrame>,
    mut shutdown: watch::Receiver<bool>,
    on_text: impl Fn(&str),
) {
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    let text = match serde_json::to_string(&frame) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("unserializable outbound frame: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Text(text))) => on_text(&text),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("realtime read error: {e}");
                    break;
                }
            },
        }
    }
}
