use anyhow::{Context, Result, anyhow};
use std::{
    net::SocketAddr,
    sync::{Arc, OnceLock},
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::{
    WebSocketStream, accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::header::SEC_WEBSOCKET_PROTOCOL,
    },
};
use tracing::{debug, info};

use crate::chain;
use crate::config::TunnelSettings;
use crate::security::original_client_ip;
use crate::session::Session;
use crate::stream::{Rewind, read_request_head, request_path};

/// Path prefix carrying either a fallback override or a chained gateway URL.
const PROXY_PATH_MARKER: &str = "/proxyip=";

const BAD_GATEWAY_RESPONSE: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Tunnel { fallback: Option<String> },
    Chain { target: String },
}

impl Route {
    /// `/proxyip=ws://…` and `/proxyip=wss://…` chain to another gateway;
    /// any other `/proxyip=<host>` overrides the fallback egress.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        let tunnel = |fallback| Self::Tunnel { fallback };

        let Some(prefix) = path.get(..PROXY_PATH_MARKER.len()) else {
            return tunnel(None);
        };
        if !prefix.eq_ignore_ascii_case(PROXY_PATH_MARKER) {
            return tunnel(None);
        }

        let rest = path.get(PROXY_PATH_MARKER.len()..).unwrap_or_default().trim();
        let lower = rest.to_ascii_lowercase();
        if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Self::Chain {
                target: rest.to_string(),
            }
        } else if rest.is_empty() {
            tunnel(None)
        } else {
            tunnel(Some(rest.to_string()))
        }
    }
}

/// Headers the upgrade request carried for the tunnel.
#[derive(Clone, Debug)]
struct Handshake {
    early_data: Option<String>,
    client_ip: Option<String>,
}

fn capture_handshake(
    req: &Request,
    mut response: Response,
    slot: &OnceLock<Handshake>,
) -> Result<Response, ErrorResponse> {
    let protocol = req.headers().get(SEC_WEBSOCKET_PROTOCOL).cloned();
    if let Some(value) = &protocol {
        // Early data rides in this header; echo it so clients accept the upgrade.
        response
            .headers_mut()
            .insert(SEC_WEBSOCKET_PROTOCOL, value.clone());
    }

    let _ = slot.set(Handshake {
        early_data: protocol.and_then(|v| v.to_str().ok().map(ToString::to_string)),
        client_ip: req
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(original_client_ip),
    });

    Ok(response)
}

/// Refuses the upgrade with a bare `502 Bad Gateway`.
async fn reject_upgrade<S>(stream: &mut S)
where
    S: AsyncWrite + Unpin,
{
    let written = async {
        stream.write_all(BAD_GATEWAY_RESPONSE).await?;
        stream.shutdown().await
    };
    if let Err(e) = written.await {
        debug!(error = %e, "Failed to send 502 response");
    }
}

/// Answers the upgrade, replaying `head` to the handshake.
async fn upgrade<S>(
    head: Vec<u8>,
    stream: S,
    peer: SocketAddr,
) -> Result<(WebSocketStream<Rewind<S>>, Handshake, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let captured: Arc<OnceLock<Handshake>> = Arc::new(OnceLock::new());
    let captured_clone = captured.clone();

    let callback =
        move |req: &Request, response: Response| capture_handshake(req, response, &captured_clone);

    let websocket = accept_hdr_async(Rewind::new(head, stream), callback)
        .await
        .context("Failed to perform WebSocket handshake")?;

    let handshake = captured
        .get()
        .cloned()
        .ok_or_else(|| anyhow!("Upgrade request was not captured"))?;
    let client_ip = handshake
        .client_ip
        .clone()
        .unwrap_or_else(|| peer.ip().to_string());

    Ok((websocket, handshake, client_ip))
}

#[tracing::instrument(skip(stream, settings), fields(client_addr = %peer))]
pub async fn handle_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    settings: Arc<TunnelSettings>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let head = read_request_head(&mut stream)
        .await
        .context("Failed to read upgrade request")?;
    let route = request_path(&head).map_or(Route::Tunnel { fallback: None }, |path| {
        Route::from_path(&path)
    });

    match route {
        Route::Chain { target } => {
            // The client only gets its 101 once the upstream has given one.
            let upstream = match chain::dial(&target).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    reject_upgrade(&mut stream).await;
                    return Err(e).context("Chained relay failed");
                }
            };
            let (websocket, _, client_ip) = upgrade(head, stream, peer).await?;
            info!(client_ip = %client_ip, target = %target, "Chaining to upstream gateway");
            chain::splice(websocket, upstream).await;
        }
        Route::Tunnel { fallback } => {
            let (websocket, handshake, client_ip) = upgrade(head, stream, peer).await?;
            let fallback = settings.fallback_for(fallback.as_deref());
            info!(
                client_ip = %client_ip,
                fallback = fallback.as_deref().unwrap_or("none"),
                early_data = handshake.early_data.is_some(),
                "Starting tunnel session"
            );
            let session = Session::new(websocket, settings, fallback)
                .with_early_data(handshake.early_data);
            match session.run().await {
                Ok(()) => info!(client_ip = %client_ip, "Tunnel closed"),
                Err(e) if e.is_rejection() => {
                    debug!(client_ip = %client_ip, error = %e, "Rejected tunnel request");
                }
                Err(e) => info!(client_ip = %client_ip, error = %e, "Tunnel ended with error"),
            }
        }
    }
    Ok(())
}
