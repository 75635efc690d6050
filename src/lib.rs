//! WebSocket Tunnel Gateway
//!
//! Carries TCP streams inside WebSocket connections. A client's first message
//! names an identity token and a destination; the gateway checks the token,
//! dials the destination (retrying once through a fallback egress when the
//! destination is unreachable or silent) and relays bytes both ways. A second
//! mode chains two WebSocket endpoints frame-for-frame.

pub mod auth;
pub mod chain;
pub mod codec;
pub mod config;
pub mod connector;
pub mod header;
pub mod listener;
pub mod relay;
pub mod security;
pub mod server;
pub mod session;
pub mod stream;

// Re-export commonly used types and functions
pub use auth::AllowList;
pub use codec::ClientId;
pub use config::{
    Config, DEFAULT_CONFIG_PATH, ListenConfig, TlsConfig, TunnelConfig, TunnelSettings,
    load_config,
};
pub use connector::{Attempt, ConnectError, Connector};
pub use header::{Address, ConnectionRequest, Destination, ParseError, parse_header};
pub use listener::{Listener, load_tls_acceptor};
pub use relay::{BUFFER_SIZE, RelayEnd, relay};
pub use security::{ProxyAllowList, original_client_ip};
pub use server::{Route, handle_connection};
pub use session::{Session, SessionError, SessionState};
