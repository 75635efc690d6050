//! Frame-for-frame bridge between a client WebSocket and a second gateway.
//!
//! No header semantics here: binary and text frames cross unchanged in both
//! directions until either side closes or fails, then both are closed once.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Error as WsError, Message,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("failed to upgrade connection to {target}")]
    Upgrade {
        target: String,
        #[source]
        source: WsError,
    },
}

pub type Upstream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Completes the WebSocket handshake with the upstream gateway at `target`.
#[tracing::instrument]
pub async fn dial(target: &str) -> Result<Upstream, ChainError> {
    let (upstream, response) = connect_async(target)
        .await
        .map_err(|source| ChainError::Upgrade {
            target: target.to_string(),
            source,
        })?;
    info!(status = %response.status(), "Upstream WebSocket connected");
    Ok(upstream)
}

/// Relays frames between two established WebSockets until one side stops.
pub async fn splice<A, B>(a: WebSocketStream<A>, b: WebSocketStream<B>)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut a_tx, mut a_rx) = a.split();
    let (mut b_tx, mut b_rx) = b.split();

    tokio::select! {
        () = forward(&mut a_rx, &mut b_tx, "client") => {},
        () = forward(&mut b_rx, &mut a_tx, "upstream") => {},
    }

    close_normally(&mut a_tx).await;
    close_normally(&mut b_tx).await;
    info!("Chained connection closed");
}

async fn forward<St, Si>(from: &mut St, to: &mut Si, side: &'static str)
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    Si: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(msg) = from.next().await {
        let msg = match msg {
            Ok(msg @ (Message::Binary(_) | Message::Text(_))) => msg,
            Ok(Message::Close(_)) => {
                debug!(side, "Close received");
                return;
            }
            // Control frames are answered by each connection on its own.
            Ok(_) => continue,
            Err(e) => {
                debug!(side, error = %e, "WebSocket read failed");
                return;
            }
        };
        if let Err(e) = to.send(msg).await {
            debug!(side, error = %e, "WebSocket send failed");
            return;
        }
    }
}

async fn close_normally<Si>(sink: &mut Si)
where
    Si: Sink<Message, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    };
    if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Close frame not sent");
    }
}
