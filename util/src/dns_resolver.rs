//! DNS resolve with the `DnsResolver` type.

use std::io;
use std::net::IpAddr;

use hickory_resolver::error::ResolveError;
use hickory_resolver::lookup_ip::LookupIp;

/// A single SRV record target, in server-preferred order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvTarget {
    /// The target host name.
    pub host: String,
    /// The port the service listens on.
    pub port: u16,
    /// SRV priority (lower wins).
    pub priority: u16,
    /// SRV weight within the same priority.
    pub weight: u16,
}

/// A DNS resolver backed by [hickory-dns](https://github.com/hickory-dns/hickory-dns).
pub struct DnsResolver {
    dns_resolver: hickory_resolver::TokioAsyncResolver,
}

impl DnsResolver {
    async fn lookup(&self, host: &str) -> std::result::Result<LookupIp, ResolveError> {
        self.dns_resolver.lookup_ip(host).await
    }

    /// Resolve a single.
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, io::Error> {
        self.lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup DNS: {}", err)))?
            .iter()
            .next()
            .ok_or_else(|| io::Error::other(format!("No address records for {}", host)))
    }

    /// Resolve a all.
    pub async fn resolve_all(&self, host: &str) -> Result<Vec<IpAddr>, io::Error> {
        let result = self
            .lookup(host)
            .await
            .map_err(|err| io::Error::other(format!("Failed to lookup dns: {}", err)))?;

        let addresses = result.iter().collect();

        Ok(addresses)
    }

    /// Look up SRV records for a service name such as
    /// `_sip._udp.example.com`, sorted by priority then descending weight.
    ///
    /// An empty list means the name has no SRV records and the caller
    /// should fall back to plain address resolution.
    pub async fn resolve_srv(&self, name: &str) -> Result<Vec<SrvTarget>, io::Error> {
        let lookup = match self.dns_resolver.srv_lookup(name).await {
            Ok(lookup) => lookup,
            Err(err) if is_no_records(&err) => return Ok(vec![]),
            Err(err) => return Err(io::Error::other(format!("Failed to lookup SRV: {}", err))),
        };

        let mut targets: Vec<SrvTarget> = lookup
            .iter()
            .map(|srv| SrvTarget {
                host: srv.target().to_utf8(),
                port: srv.port(),
                priority: srv.priority(),
                weight: srv.weight(),
            })
            .collect();

        targets.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(b.weight.cmp(&a.weight))
        });

        Ok(targets)
    }
}

fn is_no_records(err: &ResolveError) -> bool {
    use hickory_resolver::error::ResolveErrorKind;

    matches!(err.kind(), ResolveErrorKind::NoRecordsFound { .. })
}

impl Default for DnsResolver {
    fn default() -> Self {
        Self {
            dns_resolver: hickory_resolver::AsyncResolver::tokio_from_system_conf()
                .expect("Failed to get DNS resolver"),
        }
    }
}
