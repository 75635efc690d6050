use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::{fs, path::Path};

use crate::auth::AllowList;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Deserialize)]
pub struct Config {
    pub listen: ListenConfig,
    pub tunnel: TunnelConfig,
}

#[derive(Deserialize)]
pub struct ListenConfig {
    pub ip: String,
    pub port: u16,
    pub allowed_proxy_ips: Option<Vec<String>>,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize)]
pub struct TlsConfig {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Deserialize)]
pub struct TunnelConfig {
    /// Comma-separated identity tokens.
    pub users: String,
    pub fallback: Option<String>,
}

/// Read-only settings every tunneling session is started with.
#[derive(Debug)]
pub struct TunnelSettings {
    pub allow_list: AllowList,
    pub fallback: Option<String>,
}

impl TunnelConfig {
    pub fn build(&self) -> Result<TunnelSettings> {
        let allow_list =
            AllowList::parse(&self.users).context("Failed to parse tunnel.users token list")?;
        if allow_list.is_empty() {
            bail!("tunnel.users must list at least one identity token");
        }
        Ok(TunnelSettings {
            allow_list,
            fallback: non_blank(self.fallback.as_deref()),
        })
    }
}

impl TunnelSettings {
    /// Fallback for one session: a non-blank override wins over the configured address.
    #[must_use]
    pub fn fallback_for(&self, override_addr: Option<&str>) -> Option<String> {
        non_blank(override_addr).or_else(|| self.fallback.clone())
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&content)
        .with_context(|| format!("Failed to load config file {}", path.display()))
}

pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).context("Failed to parse config as valid TOML")
}
