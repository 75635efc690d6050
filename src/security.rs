use anyhow::{Result, anyhow};
use ipnet::IpNet;
use std::net::IpAddr;

/// Addresses allowed to connect to the listener, as single IPs or CIDR blocks.
///
/// An absent list admits every peer.
#[derive(Clone, Debug, Default)]
pub struct ProxyAllowList {
    nets: Option<Vec<IpNet>>,
}

impl ProxyAllowList {
    pub fn parse(entries: Option<&[String]>) -> Result<Self> {
        let Some(entries) = entries else {
            return Ok(Self::default());
        };

        let nets = entries
            .iter()
            .map(|entry| {
                let entry = entry.trim();
                entry
                    .parse::<IpAddr>()
                    .map(IpNet::from)
                    .or_else(|_| entry.parse::<IpNet>())
                    .map_err(|_| {
                        anyhow!("Invalid IP address or CIDR in allowed_proxy_ips: {entry}")
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { nets: Some(nets) })
    }

    #[must_use]
    pub fn allows(&self, peer: IpAddr) -> bool {
        self.nets
            .as_ref()
            .is_none_or(|nets| nets.iter().any(|net| net.contains(&peer)))
    }
}

/// Leftmost entry of an X-Forwarded-For header ("client, proxy1, proxy2").
#[must_use]
pub fn original_client_ip(xff_header: &str) -> Option<String> {
    xff_header
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(entries: &[&str]) -> ProxyAllowList {
        let owned: Vec<String> = entries.iter().map(ToString::to_string).collect();
        ProxyAllowList::parse(Some(owned.as_slice())).unwrap()
    }

    #[test]
    fn missing_list_allows_everyone() {
        let allow = ProxyAllowList::parse(None).unwrap();
        assert!(allow.allows("203.0.113.9".parse().unwrap()));
    }

    #[test]
    fn matches_single_addresses_and_subnets() {
        let allow = list(&["192.0.2.1", "10.0.0.0/8", "2001:db8::/32"]);
        assert!(allow.allows("192.0.2.1".parse().unwrap()));
        assert!(allow.allows("10.20.30.40".parse().unwrap()));
        assert!(allow.allows("2001:db8::5".parse().unwrap()));
        assert!(!allow.allows("192.0.2.2".parse().unwrap()));
        assert!(!allow.allows("::1".parse().unwrap()));
    }

    #[test]
    fn empty_list_allows_nobody() {
        assert!(!list(&[]).allows("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn rejects_garbage_entries() {
        let entries = vec!["not-an-ip".to_string()];
        assert!(ProxyAllowList::parse(Some(entries.as_slice())).is_err());
    }

    #[test]
    fn takes_leftmost_forwarded_address() {
        assert_eq!(
            original_client_ip("198.51.100.4, 10.0.0.1"),
            Some("198.51.100.4".to_string())
        );
        assert_eq!(original_client_ip("  "), None);
    }
}
