use anyhow::{Context, Result, anyhow};
use futures_util::{Stream, StreamExt, stream};
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use std::{
    fs::File,
    io::{self, BufReader},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    time::sleep,
};
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, warn};

use crate::config::{ListenConfig, TlsConfig, TunnelSettings};
use crate::security::ProxyAllowList;
use crate::server::handle_connection;

/// Pause after a failed accept, so descriptor exhaustion does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Accepting side of the gateway: plain TCP or TLS, filtered by peer address.
pub struct Listener {
    tcp: TcpListener,
    tls: Option<TlsAcceptor>,
    allowed_peers: ProxyAllowList,
}

impl Listener {
    pub async fn bind(config: &ListenConfig) -> Result<Self> {
        let allowed_peers = ProxyAllowList::parse(config.allowed_proxy_ips.as_deref())?;
        let tls = config.tls.as_ref().map(load_tls_acceptor).transpose()?;

        let addr = format!("{}:{}", config.ip, config.port);
        let tcp = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to address {addr}"))?;

        Ok(Self {
            tcp,
            tls,
            allowed_peers,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.tcp
            .local_addr()
            .context("Failed to get listener local address")
    }

    /// Accepts connections forever, one task per connection.
    pub async fn serve(self, settings: Arc<TunnelSettings>) -> Result<()> {
        info!(
            listen_addr = %self.local_addr()?,
            tls = self.tls.is_some(),
            "WebSocket gateway listening"
        );

        let Self {
            tcp,
            tls,
            allowed_peers,
        } = self;
        accept_loop(incoming(tcp), tls, allowed_peers, settings).await;
        Ok(())
    }
}

/// Accept results from `tcp`, errors included.
fn incoming(tcp: TcpListener) -> impl Stream<Item = io::Result<(TcpStream, SocketAddr)>> {
    stream::unfold(tcp, |tcp| async move {
        let next = tcp.accept().await;
        Some((next, tcp))
    })
}

/// Dispatches accepted connections until `incoming` ends.
///
/// A failed accept (descriptor exhaustion, an aborted handshake) only costs
/// that connection; the loop backs off briefly and carries on.
async fn accept_loop<I>(
    incoming: I,
    tls: Option<TlsAcceptor>,
    allowed_peers: ProxyAllowList,
    settings: Arc<TunnelSettings>,
) where
    I: Stream<Item = io::Result<(TcpStream, SocketAddr)>>,
{
    tokio::pin!(incoming);

    while let Some(accepted) = incoming.next().await {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        if !allowed_peers.allows(peer.ip()) {
            warn!(client_addr = %peer, "Rejecting connection from address not in allowed_proxy_ips");
            continue;
        }

        let tls = tls.clone();
        let settings = settings.clone();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => handle_connection(tls_stream, peer, settings).await,
                    Err(e) => Err(e).context("TLS handshake failed"),
                },
                None => handle_connection(stream, peer, settings).await,
            };
            if let Err(e) = result {
                error!(client_addr = %peer, error = %format!("{e:#}"), "Connection failed");
            }
        });
    }
}

pub fn load_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor> {
    let open = |path: &str, what: &str| {
        File::open(path)
            .map(BufReader::new)
            .with_context(|| format!("Failed to open {what} file: {path}"))
    };

    let cert_chain = certs(&mut open(&tls_config.cert_file, "certificate")?)
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to parse certificate file")?;
    if cert_chain.is_empty() {
        return Err(anyhow!("No certificates found in certificate file"));
    }

    let key = private_key(&mut open(&tls_config.key_file, "private key")?)
        .context("Failed to parse private key file")?
        .ok_or_else(|| anyhow!("No private key found in key file"))?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, key)
        .context("Failed to create TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
