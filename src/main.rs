use anyhow::Result;
use std::{env, path::PathBuf, sync::Arc};
use tracing::info;

use ws_tunnel_gateway::{DEFAULT_CONFIG_PATH, Listener, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config_path = env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), PathBuf::from);
    let config = load_config(&config_path)?;
    let settings = Arc::new(config.tunnel.build()?);

    info!(
        config_file = %config_path.display(),
        listen_ip = %config.listen.ip,
        listen_port = config.listen.port,
        tls = config.listen.tls.is_some(),
        users = settings.allow_list.len(),
        fallback = settings.fallback.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );

    let listener = Listener::bind(&config.listen).await?;
    listener.serve(settings).await
}
