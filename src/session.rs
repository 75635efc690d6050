//! Per-connection state machine for tunneling mode.
//!
//! `AwaitingHeader -> Relaying -> Closed`, with `Closed` reachable from
//! either earlier state. The first binary message (or the early data carried
//! in the upgrade request) is parsed and authorized; on success the client
//! gets a two-byte acknowledgement before any connection attempt, then the
//! session relays through the primary destination and, at most once, the
//! fallback egress.

use std::sync::Arc;

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info};

use crate::{
    codec::ClientId,
    config::TunnelSettings,
    connector::{ConnectError, Connector},
    header::{ConnectionRequest, ParseError, parse_header},
    relay::{RelayError, relay},
};

/// Base64url, padding optional.
const EARLY_DATA: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHeader,
    Relaying,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("malformed header")]
    Header(#[from] ParseError),
    #[error("identity token {0} is not authorized")]
    Unauthorized(ClientId),
    #[error("early data is not valid base64url")]
    EarlyData(#[from] base64::DecodeError),
    #[error("header sent as a text message")]
    TextHeader,
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("client transport error")]
    Transport(#[source] WsError),
    #[error("relay failed")]
    Relay(#[from] RelayError),
}

impl SessionError {
    /// Rejections of the client's request, as opposed to failures after acceptance.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::Header(_) | Self::Unauthorized(_) | Self::EarlyData(_) | Self::TextHeader
        )
    }
}

pub struct Session<S> {
    state: SessionState,
    client_tx: SplitSink<WebSocketStream<S>, Message>,
    client_rx: SplitStream<WebSocketStream<S>>,
    settings: Arc<TunnelSettings>,
    fallback: Option<String>,
    early_data: Option<String>,
    ack_sent: bool,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    #[must_use]
    pub fn new(
        websocket: WebSocketStream<S>,
        settings: Arc<TunnelSettings>,
        fallback: Option<String>,
    ) -> Self {
        let (client_tx, client_rx) = websocket.split();
        Self {
            state: SessionState::AwaitingHeader,
            client_tx,
            client_rx,
            settings,
            fallback,
            early_data: None,
            ack_sent: false,
        }
    }

    /// Early data from the upgrade request, processed before any live frame.
    #[must_use]
    pub fn with_early_data(mut self, raw: Option<String>) -> Self {
        self.early_data = raw.filter(|raw| !raw.is_empty());
        self
    }

    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the session to completion. Teardown runs exactly once, whatever
    /// the outcome; rejected requests get a bare close and nothing else.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.drive().await;
        self.close().await;
        result
    }

    /// Moves to `Closed` and closes the client transport.
    ///
    /// Returns `false` if the session was already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == SessionState::Closed {
            return false;
        }
        let from = self.state;
        self.state = SessionState::Closed;

        if let Err(e) = self.client_tx.close().await {
            debug!(error = %e, "WebSocket close failed");
        }
        debug!(from = ?from, ack_sent = self.ack_sent, "Session closed");
        true
    }

    async fn drive(&mut self) -> Result<(), SessionError> {
        let Some(first) = self.first_message().await? else {
            debug!("Client left before sending a header");
            return Ok(());
        };

        let request = self.authorize(&first)?;
        info!(
            client_id = %request.client_id,
            destination = %request.destination,
            payload_bytes = request.initial_payload.len(),
            "Tunnel requested"
        );

        self.acknowledge(request.version).await?;
        self.state = SessionState::Relaying;
        self.connect_and_relay(&request).await
    }

    async fn first_message(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        if let Some(raw) = self.early_data.take() {
            return Ok(Some(decode_early_data(&raw)?));
        }

        while let Some(msg) = self.client_rx.next().await {
            match msg {
                Ok(Message::Binary(data)) => return Ok(Some(data.to_vec())),
                Ok(Message::Text(_)) => return Err(SessionError::TextHeader),
                Ok(Message::Close(_)) => return Ok(None),
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "WebSocket failed before header");
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn authorize(&self, first: &[u8]) -> Result<ConnectionRequest, SessionError> {
        let request = parse_header(first)?;
        if !self.settings.allow_list.is_authorized(&request.client_id) {
            return Err(SessionError::Unauthorized(request.client_id));
        }
        Ok(request)
    }

    async fn acknowledge(&mut self, version: u8) -> Result<(), SessionError> {
        if self.ack_sent {
            return Ok(());
        }
        self.client_tx
            .send(Message::Binary(vec![version, 0].into()))
            .await
            .map_err(SessionError::Transport)?;
        self.ack_sent = true;
        Ok(())
    }

    /// Primary destination, then at most one fallback.
    ///
    /// The fallback is used when the primary cannot be reached, or when it
    /// closes before sending a single byte. An empty answer and a filtered
    /// destination look the same here and are treated the same.
    async fn connect_and_relay(&mut self, request: &ConnectionRequest) -> Result<(), SessionError> {
        let connector = Connector::new(
            &request.destination,
            &request.initial_payload,
            self.fallback.as_deref(),
        );

        let mut failure = None;
        for target in connector.plan() {
            let remote = match connector.open(&target).await {
                Ok(remote) => remote,
                Err(e) => {
                    info!(error = %e, "Remote connection failed");
                    failure = Some(e);
                    continue;
                }
            };
            failure = None;
            info!(attempt = %target.attempt, authority = %target.authority, "Connected to remote");

            let end = relay(&mut self.client_tx, &mut self.client_rx, remote).await?;
            if !end.remote_was_silent() {
                return Ok(());
            }
            info!(attempt = %target.attempt, "Remote closed without sending data");
        }

        failure.map_or(Ok(()), |e| Err(e.into()))
    }
}

fn decode_early_data(raw: &str) -> Result<Vec<u8>, base64::DecodeError> {
    // Accept the standard alphabet too; some clients send it unmodified.
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '+' => '-',
            '/' => '_',
            c => c,
        })
        .collect();
    EARLY_DATA.decode(normalized)
}
