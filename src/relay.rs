//! Byte pump between a client WebSocket and a remote byte stream.

use std::io;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tracing::{debug, info, warn};

pub const BUFFER_SIZE: usize = 8192;

/// Which side stopped the relay first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    RemoteClosed { received: u64 },
}

impl RelayEnd {
    /// The remote hung up (or failed) before sending a single byte.
    #[must_use]
    pub const fn remote_was_silent(self) -> bool {
        matches!(self, Self::RemoteClosed { received: 0 })
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to write client data to remote")]
    RemoteWrite(#[source] io::Error),
    #[error("failed to send remote data to client")]
    ClientSend(#[source] WsError),
}

/// Pumps bytes both ways until either side stops.
///
/// Client binary messages are written verbatim to `remote`; every chunk read
/// from `remote` goes out as one binary message. The remote is dropped (and
/// with it the connection) when this returns, while the client halves stay
/// with the caller.
pub async fn relay<Si, St, R>(
    client_tx: &mut Si,
    client_rx: &mut St,
    remote: R,
) -> Result<RelayEnd, RelayError>
where
    Si: Sink<Message, Error = WsError> + Unpin,
    St: Stream<Item = Result<Message, WsError>> + Unpin,
    R: AsyncRead + AsyncWrite,
{
    let (mut remote_reader, mut remote_writer) = tokio::io::split(remote);

    let client_to_remote = async {
        while let Some(msg) = client_rx.next().await {
            match msg {
                Ok(Message::Binary(data)) => {
                    debug!(bytes = data.len(), "Forwarding data from WebSocket to remote");
                    remote_writer
                        .write_all(&data)
                        .await
                        .map_err(RelayError::RemoteWrite)?;
                }
                Ok(Message::Text(_)) => {
                    warn!("Dropping text message (binary only)");
                }
                Ok(Message::Close(_)) => {
                    info!("WebSocket connection closed");
                    break;
                }
                Err(e) => {
                    log_client_error(&e);
                    break;
                }
                Ok(_) => {}
            }
        }
        Ok::<_, RelayError>(RelayEnd::ClientClosed)
    };

    let remote_to_client = async {
        let mut buffer = [0u8; BUFFER_SIZE];
        let mut received = 0u64;

        loop {
            match remote_reader.read(&mut buffer).await {
                Ok(0) => {
                    info!(received, "Remote connection closed");
                    break;
                }
                Ok(n) => {
                    received += n as u64;
                    debug!(bytes = n, "Forwarding data from remote to WebSocket");
                    match client_tx
                        .send(Message::Binary(buffer[..n].to_vec().into()))
                        .await
                    {
                        Ok(()) => {}
                        Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                            debug!("WebSocket already closed, dropping remote data");
                            return Ok(RelayEnd::ClientClosed);
                        }
                        Err(e) => return Err(RelayError::ClientSend(e)),
                    }
                }
                Err(e) => {
                    warn!(error = %e, received, "Failed to read from remote");
                    break;
                }
            }
        }
        Ok(RelayEnd::RemoteClosed { received })
    };

    tokio::select! {
        result = client_to_remote => result,
        result = remote_to_client => result,
    }
}

fn log_client_error(e: &WsError) {
    match e {
        WsError::ConnectionClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
            debug!("Client disconnected: {e}");
        }
        _ => {
            warn!("WebSocket error: {e}");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::{io::DuplexStream, time::timeout};
    use tokio_test::io::Builder;
    use tokio_tungstenite::{WebSocketStream, tungstenite::protocol::Role};

    const TEST_TIMEOUT: Duration = Duration::from_secs(1);

    /// Server and client ends of an in-memory WebSocket.
    pub(crate) async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>)
    {
        let (server, client) = tokio::io::duplex(64 * 1024);
        (
            WebSocketStream::from_raw_socket(server, Role::Server, None).await,
            WebSocketStream::from_raw_socket(client, Role::Client, None).await,
        )
    }

    async fn next_binary(ws: &mut WebSocketStream<DuplexStream>) -> Vec<u8> {
        match timeout(TEST_TIMEOUT, ws.next()).await.unwrap() {
            Some(Ok(Message::Binary(data))) => data.to_vec(),
            other => panic!("expected binary message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn forwards_remote_chunks_and_counts_bytes() {
        let (server, mut client) = ws_pair().await;
        let (mut tx, mut rx) = server.split();
        let remote = Builder::new().read(b"hello").read(b" world").build();

        let end = timeout(TEST_TIMEOUT, relay(&mut tx, &mut rx, remote))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(end, RelayEnd::RemoteClosed { received: 11 });
        assert!(!end.remote_was_silent());
        assert_eq!(next_binary(&mut client).await, b"hello");
        assert_eq!(next_binary(&mut client).await, b" world");
    }

    #[tokio::test]
    async fn silent_remote_is_reported() {
        let (server, _client) = ws_pair().await;
        let (mut tx, mut rx) = server.split();

        let end = relay(&mut tx, &mut rx, Builder::new().build()).await.unwrap();
        assert!(end.remote_was_silent());
    }

    #[tokio::test]
    async fn forwards_client_binary_and_drops_text() {
        let (server, mut client) = ws_pair().await;
        let (mut tx, mut rx) = server.split();
        client.send(Message::Text("ignored".into())).await.unwrap();
        client
            .send(Message::Binary(b"ping".to_vec().into()))
            .await
            .unwrap();

        // The mock only reaches EOF once the expected write has happened.
        let remote = Builder::new().write(b"ping").build();
        let end = timeout(TEST_TIMEOUT, relay(&mut tx, &mut rx, remote))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, RelayEnd::RemoteClosed { received: 0 });
    }

    #[tokio::test]
    async fn client_close_ends_relay() {
        let (server, mut client) = ws_pair().await;
        let (mut tx, mut rx) = server.split();
        client.close(None).await.unwrap();

        let remote = Builder::new().wait(Duration::from_secs(30)).build();
        let end = timeout(TEST_TIMEOUT, relay(&mut tx, &mut rx, remote))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(end, RelayEnd::ClientClosed);
    }
}
