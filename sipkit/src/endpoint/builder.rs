#![deny(missing_docs)]
//! SIP Endpoint Builder
//!

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use itertools::Itertools;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

use crate::config::Settings;
use crate::endpoint::{Endpoint, Inner};
use crate::resolver::{DnsResolver, Resolver};
use crate::transaction::TransactionLayer;
use crate::transport::tcp::TcpStartup;
use crate::transport::tls::TlsStartup;
use crate::transport::udp::UdpStartup;
use crate::transport::ws::WsStartup;
use crate::transport::{TransportLayer, TransportStartup};
use crate::SipService;

/// Builder for creating a new SIP `Endpoint`.
pub struct Builder {
    name: String,
    settings: Settings,
    resolver: Option<Arc<dyn Resolver>>,
    services: Vec<Box<dyn SipService>>,
    transport_start: Vec<Box<dyn TransportStartup>>,
    tls_server: Option<Arc<ServerConfig>>,
    tls_client: Option<Arc<ClientConfig>>,
}

impl Builder {
    /// Creates a new default instance of `Builder` to construct a `Endpoint`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sipkit::*;
    /// let builder = endpoint::Builder::new().with_name("My Endpoint");
    /// ```
    pub fn new() -> Self {
        Builder {
            name: String::new(),
            settings: Settings::default(),
            resolver: None,
            services: vec![],
            transport_start: vec![],
            tls_server: None,
            tls_client: None,
        }
    }

    /// Sets the endpoint name.
    pub fn with_name<T: AsRef<str>>(mut self, s: T) -> Self {
        self.name = s.as_ref().to_string();

        self
    }

    /// Overrides the default configuration.
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;

        self
    }

    /// Sets the RFC 3263 resolver. Defaults to the system DNS.
    pub fn with_resolver(mut self, resolver: impl Resolver) -> Self {
        self.resolver = Some(Arc::new(resolver));

        self
    }

    /// Add a new builder for UDP transport on specified address.
    pub fn with_udp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(UdpStartup::new(addr)));
        self
    }

    /// Add a new builder for TCP transport on specified address.
    pub fn with_tcp(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(TcpStartup::new(addr)));
        self
    }

    /// Provides the TLS material used by `with_tls`, `with_wss` and
    /// outbound TLS dials.
    pub fn with_tls_config(mut self, server: Arc<ServerConfig>, client: Option<Arc<ClientConfig>>) -> Self {
        self.tls_server = Some(server);
        self.tls_client = client;
        self
    }

    /// Add a new builder for TLS transport on specified address.
    /// Requires `with_tls_config`.
    pub fn with_tls(mut self, addr: SocketAddr) -> Self {
        let server = self.tls_server.clone().expect("with_tls requires with_tls_config");
        self.transport_start
            .push(Box::new(TlsStartup::new(addr, server, self.tls_client.clone())));
        self
    }

    /// Add a new builder for WebSocket transport on specified address.
    pub fn with_ws(mut self, addr: SocketAddr) -> Self {
        self.transport_start.push(Box::new(WsStartup::new(addr, None)));
        self
    }

    /// Add a new builder for secure WebSocket transport on specified
    /// address. Requires `with_tls_config`.
    pub fn with_wss(mut self, addr: SocketAddr) -> Self {
        let server = self.tls_server.clone().expect("with_wss requires with_tls_config");
        self.transport_start.push(Box::new(WsStartup::new(addr, Some(server))));
        self
    }

    /// Adds a service to the endpoint.
    ///
    /// This function can be called multiple times to add additional services.
    /// If a service with the same name already exists, the new service will not
    /// be added.
    pub fn with_service(mut self, service: impl SipService) -> Self {
        if self.service_exists(service.name()) {
            return self;
        }
        self.services.push(Box::new(service));

        self
    }

    /// Add a collection of services to the endpoint.
    ///
    /// Similar to [`Builder::with_service`], but allows adding multiple
    /// services at once. Unlike `with_service`, this method expects the
    /// services to be passed as trait objects (`Box<dyn SipService>`)
    /// instead of concrete types.
    pub fn with_services<I>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = Box<dyn SipService>>,
    {
        for service in services {
            if self.service_exists(service.name()) {
                continue;
            }
            self.services.push(service);
        }

        self
    }

    fn service_exists(&self, name: &str) -> bool {
        let exists = self.services.iter().any(|s| s.name() == name);
        if exists {
            log::warn!("Service with name '{}' already exists", name);
        }
        exists
    }

    /// Finalize the builder into a `Endpoint`.
    ///
    /// Listeners queued with `with_udp` and friends are bound when the
    /// endpoint is `run`, so that bind failures surface as
    /// `Error::Listen` from there.
    pub async fn build(self) -> Endpoint {
        log::trace!("Creating endpoint...");
        log::debug!(
            "Services registered {}",
            format_args!("({})", self.services.iter().map(|s| s.name()).join(", "))
        );

        let transport = TransportLayer::new(self.settings.connection_ttl);
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(DnsResolver::new()));

        Endpoint::from_inner(Inner {
            transport,
            transaction: TransactionLayer::default(),
            settings: self.settings,
            name: self.name,
            resolver,
            services: self.services.into_boxed_slice(),
            transport_start: Mutex::new(self.transport_start),
            tls_server: self.tls_server,
            tls_client: self.tls_client,
        })
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NamedService(&'static str);

    #[async_trait::async_trait]
    impl SipService for NamedService {
        fn name(&self) -> &str {
            self.0
        }
    }

    #[tokio::test]
    async fn test_duplicate_services_rejected() {
        let endpoint = Builder::new()
            .with_name("test")
            .with_service(NamedService("a"))
            .with_service(NamedService("a"))
            .build()
            .await;

        assert_eq!(endpoint.get_name(), "test");
    }
}
