//! Server location per RFC 3263.
//!
//! The transport layer consumes the [`Resolver`] trait to turn a
//! request-URI into an ordered candidate list. The default
//! implementation queries SRV records first and falls back to plain
//! address resolution; NAPTR is approximated by deriving the SRV
//! service names from the URI scheme and transport parameter.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use util::DnsResolver as DnsLookup;

use crate::error::Result;
use crate::message::{Host, SipUri, TransportKind};

/// One candidate server, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerEntry {
    /// The transport to dial with.
    pub kind: TransportKind,
    /// The resolved socket address.
    pub addr: SocketAddr,
}

/// Maps a request-URI to an ordered list of servers to try.
#[async_trait::async_trait]
pub trait Resolver: Sync + Send + 'static {
    /// Resolves the URI per RFC 3263. The returned list is ordered by
    /// preference; an empty list means the target does not exist.
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<ServerEntry>>;
}

fn srv_service(kind: TransportKind) -> Option<&'static str> {
    match kind {
        TransportKind::Udp => Some("_sip._udp"),
        TransportKind::Tcp => Some("_sip._tcp"),
        TransportKind::Tls => Some("_sips._tcp"),
        TransportKind::Ws => Some("_sip._ws"),
        TransportKind::Wss => Some("_sips._ws"),
        TransportKind::Unknown => None,
    }
}

/// The transports RFC 3263 allows for the URI, most preferred first.
fn candidate_kinds(uri: &SipUri) -> Vec<TransportKind> {
    match uri.transport_param {
        Some(kind) => vec![kind],
        None if uri.secure => vec![TransportKind::Tls],
        None => vec![TransportKind::Udp, TransportKind::Tcp],
    }
}

/// DNS-backed resolver.
pub struct DnsResolver {
    dns: DnsLookup,
}

impl DnsResolver {
    /// Creates a resolver from the system DNS configuration.
    pub fn new() -> Self {
        Self {
            dns: DnsLookup::default(),
        }
    }
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Resolver for DnsResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<ServerEntry>> {
        let kinds = candidate_kinds(uri);
        let preferred = kinds[0];

        // Literal address: nothing to look up.
        if let Host::IpAddr(ip) = uri.host_port.host {
            let port = uri.host_port.port_or(preferred);
            return Ok(vec![ServerEntry {
                kind: preferred,
                addr: SocketAddr::new(ip, port),
            }]);
        }

        let Host::DomainName(ref domain) = uri.host_port.host else {
            unreachable!();
        };

        // An explicit port disables SRV (RFC 3263 section 4.2).
        if let Some(port) = uri.host_port.port {
            let mut entries = Vec::new();
            for ip in self.dns.resolve_all(domain).await? {
                entries.push(ServerEntry {
                    kind: preferred,
                    addr: SocketAddr::new(ip, port),
                });
            }
            return Ok(entries);
        }

        let mut entries = Vec::new();

        for kind in &kinds {
            let Some(service) = srv_service(*kind) else {
                continue;
            };
            let name = format!("{}.{}", service, domain);

            for target in self.dns.resolve_srv(&name).await? {
                for ip in self.dns.resolve_all(&target.host).await? {
                    entries.push(ServerEntry {
                        kind: *kind,
                        addr: SocketAddr::new(ip, target.port),
                    });
                }
            }
        }

        if entries.is_empty() {
            // No SRV records at all: plain A/AAAA with default ports.
            for ip in self.dns.resolve_all(domain).await? {
                for kind in &kinds {
                    entries.push(ServerEntry {
                        kind: *kind,
                        addr: SocketAddr::new(ip, kind.default_port()),
                    });
                }
            }
        }

        Ok(entries)
    }
}

/// A fixed host table, used in tests and closed deployments.
#[derive(Debug, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<ServerEntry>>,
}

impl StaticResolver {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a host name to a candidate list.
    pub fn insert(&mut self, host: &str, entries: Vec<ServerEntry>) {
        self.hosts.insert(host.to_string(), entries);
    }
}

#[async_trait::async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, uri: &SipUri) -> Result<Vec<ServerEntry>> {
        match &uri.host_port.host {
            Host::IpAddr(ip) => {
                let kind = candidate_kinds(uri)[0];
                let port = uri.host_port.port_or(kind);
                Ok(vec![ServerEntry {
                    kind,
                    addr: SocketAddr::new(*ip, port),
                }])
            }
            Host::DomainName(domain) => Ok(self
                .hosts
                .get(domain.as_ref())
                .cloned()
                .unwrap_or_default()),
        }
    }
}

/// Resolves a bare host to one IP, used for `maddr` response routing.
pub(crate) async fn resolve_host(host: &Host) -> Result<IpAddr> {
    match host {
        Host::IpAddr(ip) => Ok(*ip),
        Host::DomainName(domain) => Ok(DnsLookup::default().resolve(domain).await?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_literal_address() {
        let resolver = StaticResolver::new();
        let uri = SipUri::parse("sip:10.0.0.5").unwrap();

        let entries = resolver.resolve(&uri).await.unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, TransportKind::Udp);
        assert_eq!(entries[0].addr, "10.0.0.5:5060".parse().unwrap());
    }

    #[tokio::test]
    async fn test_sips_prefers_tls() {
        let resolver = StaticResolver::new();
        let uri = SipUri::parse("sips:10.0.0.5").unwrap();

        let entries = resolver.resolve(&uri).await.unwrap();

        assert_eq!(entries[0].kind, TransportKind::Tls);
        assert_eq!(entries[0].addr.port(), 5061);
    }

    #[tokio::test]
    async fn test_transport_param_wins() {
        let resolver = StaticResolver::new();
        let uri = SipUri::parse("sip:10.0.0.5;transport=tcp").unwrap();

        let entries = resolver.resolve(&uri).await.unwrap();

        assert_eq!(entries[0].kind, TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_static_table() {
        let mut resolver = StaticResolver::new();
        resolver.insert(
            "proxy.example.com",
            vec![
                ServerEntry {
                    kind: TransportKind::Udp,
                    addr: "192.0.2.1:5060".parse().unwrap(),
                },
                ServerEntry {
                    kind: TransportKind::Tcp,
                    addr: "192.0.2.1:5060".parse().unwrap(),
                },
            ],
        );

        let uri = SipUri::parse("sip:alice@proxy.example.com").unwrap();
        let entries = resolver.resolve(&uri).await.unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, TransportKind::Udp);
    }
}
