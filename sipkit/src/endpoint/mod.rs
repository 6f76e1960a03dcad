#![deny(missing_docs)]
//! SIP Endpoint
//!
//! The endpoint glues the transport and transaction layers together:
//! it routes outbound requests per RFC 3263 with the 18.1.1 size
//! upgrade, routes responses per 18.2.2 / RFC 3581, creates server
//! transactions for unmatched requests and hands leftover messages to
//! the registered services.

pub mod builder;

pub use builder::Builder;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::headers::{Header, SipHeaderParse, Via};
use crate::message::{Host, HostPort, Method, Request, Response, SipUri, StatusCode, StatusLine, TransportKind};
use crate::resolver::{resolve_host, Resolver, ServerEntry};
use crate::transaction::{
    key, ClientTsx, InvClientTransaction, InvServerTransaction, ServerTransaction, ServerTsx, TransactionLayer,
    TsxHandle, TsxSnapshot,
};
use crate::transport::{
    tcp::TcpStartup, tls::TlsStartup, udp::UdpStartup, ws::WsStartup, IncomingRequest, IncomingResponse, OutgoingAddr,
    OutgoingRequest, OutgoingResponse, ToBytes, Transport, TransportLayer, TransportStartup,
};
use crate::SipService;

use bytes::Bytes;
use tokio_rustls::rustls::{ClientConfig, ServerConfig};

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) struct Inner {
    /// The transport layer for the endpoint.
    transport: TransportLayer,
    /// The transaction layer for the endpoint.
    transaction: TransactionLayer,
    /// Recognized configuration options.
    settings: Settings,
    /// The name of the endpoint.
    name: String,
    /// The resolver for RFC 3263 server location.
    resolver: Arc<dyn Resolver>,
    /// The list of services registered.
    services: Box<[Box<dyn SipService>]>,
    /// Listeners queued by the builder, started by `run`.
    transport_start: Mutex<Vec<Box<dyn TransportStartup>>>,
    /// TLS material for `listen` on tls/wss networks.
    tls_server: Option<Arc<ServerConfig>>,
    tls_client: Option<Arc<ClientConfig>>,
}

/// The SIP endpoint.
///
/// An endpoint is a logical entity that can send and receive SIP messages,
/// manage transactions, and interact with various SIP services. The endpoint is
/// responsible for handling incoming requests and responses, as well as sending
/// outgoing messages.
#[derive(Clone)]
pub struct Endpoint(Arc<Inner>);

impl Endpoint {
    /// Returns a builder to create an `Endpoint`.
    ///
    /// # Examples
    ///
    /// ```
    /// # use sipkit::*;
    /// let endpoint = endpoint::Builder::new()
    ///     .with_name("My Endpoint");
    /// ```
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub(crate) fn from_inner(inner: Inner) -> Self {
        Self(Arc::new(inner))
    }

    /// Run with timeout
    pub async fn run_with_timeout(self, timeout: Duration) -> Result<()> {
        self.start_listeners().await?;
        let _ = tokio::time::timeout(timeout, self.receive_message()).await;

        Ok(())
    }

    /// Runs the endpoint: starts every queued listener and processes
    /// messages from the transport layer until shutdown.
    pub async fn run(self) -> Result<()> {
        self.start_listeners().await?;
        self.receive_message().await
    }

    async fn start_listeners(&self) -> Result<()> {
        let startups: Vec<Box<dyn TransportStartup>> = {
            let mut queued = self.0.transport_start.lock().expect("Lock failed");
            queued.drain(..).collect()
        };

        for startup in startups {
            startup.start(self.0.transport.ctx()).await?;
        }

        Ok(())
    }

    async fn receive_message(self) -> Result<()> {
        self.0.transport.handle_events(&self).await
    }

    /// Registers a listener on `network`/`addr`. TLS and WSS networks
    /// require the TLS configuration given to the builder.
    pub async fn listen(&self, network: TransportKind, addr: SocketAddr) -> Result<()> {
        let startup: Box<dyn TransportStartup> = match network {
            TransportKind::Udp => Box::new(UdpStartup::new(addr)),
            TransportKind::Tcp => Box::new(TcpStartup::new(addr)),
            TransportKind::Tls => {
                let server = self.0.tls_server.clone().ok_or(Error::Listen {
                    addr,
                    cause: "No TLS configuration".into(),
                })?;
                Box::new(TlsStartup::new(addr, server, self.0.tls_client.clone()))
            }
            TransportKind::Ws => Box::new(WsStartup::new(addr, None)),
            TransportKind::Wss => {
                let server = self.0.tls_server.clone().ok_or(Error::Listen {
                    addr,
                    cause: "No TLS configuration".into(),
                })?;
                Box::new(WsStartup::new(addr, Some(server)))
            }
            TransportKind::Unknown => {
                return Err(Error::Listen {
                    addr,
                    cause: "Unknown network".into(),
                })
            }
        };

        startup.start(self.0.transport.ctx()).await
    }

    /// Stops all listeners, closes all connections, terminates every
    /// live transaction with an abort error and waits for the worker
    /// tasks to finish.
    pub async fn shutdown(&self) {
        self.0.transaction.shutdown();
        self.0.transport.shutdown().await;
    }

    /// Get the endpoint name.
    pub fn get_name(&self) -> &str {
        &self.0.name
    }

    /// The endpoint configuration.
    pub fn settings(&self) -> &Settings {
        &self.0.settings
    }

    /// Creates a new User Agent Client (UAC) transaction around an
    /// already prepared non-INVITE request and sends it.
    pub async fn new_uac_tsx(&self, request: OutgoingRequest) -> Result<crate::transaction::ClientTransaction> {
        crate::transaction::ClientTransaction::send(request, self).await
    }

    /// Creates a new User Agent Client (UAC) INVITE transaction around
    /// an already prepared request and sends it.
    pub async fn new_uac_inv_tsx(&self, request: OutgoingRequest) -> Result<InvClientTransaction> {
        InvClientTransaction::send(request, self).await
    }

    /// Creates a new User Agent Server (UAS) transaction.
    ///
    /// This method initializes an [`ServerTransaction`] instance, which represents
    /// the server transaction for handling incoming SIP requests that
    /// are not `INVITE` requests.
    pub fn new_uas_tsx(&self, request: &mut IncomingRequest) -> Result<ServerTransaction> {
        ServerTransaction::new(self, request)
    }

    /// Creates a new User Agent Server (UAS) Invite transaction.
    ///
    /// This method initializes an [`InvServerTransaction`] instance, which represents
    /// the server transaction for handling an incoming `INVITE` request.
    pub fn new_uas_inv_tsx(&self, request: &mut IncomingRequest) -> Result<InvServerTransaction> {
        InvServerTransaction::new(self, request)
    }

    /// Sends a request through a new client transaction of the
    /// appropriate variant, selecting the transport per RFC 3263 and
    /// 18.1.1.
    pub async fn send_request(&self, request: Request) -> Result<ClientTsx> {
        let is_invite = matches!(request.method(), Method::Invite);
        let outgoing = self.prepare_request(request).await?;

        if is_invite {
            Ok(ClientTsx::Invite(InvClientTransaction::send(outgoing, self).await?))
        } else {
            Ok(ClientTsx::NonInvite(
                crate::transaction::ClientTransaction::send(outgoing, self).await?,
            ))
        }
    }

    /// Sends a request outside any transaction, e.g. the ACK for a
    /// 2xx response.
    pub async fn send_request_stateless(&self, request: Request) -> Result<()> {
        let mut outgoing = self.prepare_request(request).await?;
        let buf = outgoing.to_bytes()?;

        log::debug!("<= Request {} to /{}", outgoing.msg.req_line.method, outgoing.addr);
        outgoing.transport.send(&buf, &outgoing.addr).await?;

        Ok(())
    }

    /// Resolves the request target and binds the request to a
    /// transport, applying the 18.1.1 upgrade: a UDP request larger
    /// than the configured MTU threshold moves to the first reliable
    /// candidate the resolver offered, and the top Via is rewritten
    /// accordingly.
    pub async fn prepare_request(&self, mut request: Request) -> Result<OutgoingRequest> {
        self.fill_request_defaults(&mut request);

        let targets = self.0.resolver.resolve(&request.req_line.uri).await?;
        if targets.is_empty() {
            return Err(Error::Transport(format!(
                "No servers found for {}",
                request.req_line.uri
            )));
        }

        let mut selected = targets[0];

        if selected.kind == TransportKind::Udp {
            let size = self.serialized_size(&request)?;
            if size > self.0.settings.udp_mtu_threshold {
                // 18.1.1: a request this close to the MTU goes over a
                // congestion controlled transport instead.
                if let Some(reliable) = targets.iter().find(|t| t.kind.reliable()) {
                    log::debug!(
                        "Upgrading {} byte request from UDP to {} for {}",
                        size,
                        reliable.kind,
                        reliable.addr
                    );
                    selected = *reliable;
                }
            }
        }

        let transport = self.obtain_transport(selected).await?;

        // The top Via names the transport actually chosen and our
        // local identity on it.
        if let Some(via) = request.headers.via() {
            let branch = via.branch().map(str::to_string);
            let mut via = Via::new(
                selected.kind,
                local_sent_by(&*transport),
                branch.as_deref(),
            );
            if branch.is_none() {
                via.set_branch(&key::generate_branch());
            }
            replace_top_via(&mut request, via);
        } else {
            let mut via = Via::new(selected.kind, local_sent_by(&*transport), None);
            via.set_branch(&key::generate_branch());
            request.headers.push(Header::Via(via));
        }

        Ok(OutgoingRequest {
            msg: request,
            addr: selected.addr,
            buf: None,
            transport,
        })
    }

    fn serialized_size(&self, request: &Request) -> Result<usize> {
        let probe = OutgoingRequest {
            msg: request.clone(),
            addr: "0.0.0.0:0".parse().expect("Valid address"),
            buf: None,
            transport: Arc::new(NullTransport),
        };

        Ok(probe.to_bytes()?.len())
    }

    async fn obtain_transport(&self, target: ServerEntry) -> Result<Arc<dyn Transport>> {
        match target.kind {
            TransportKind::Udp => self
                .0
                .transport
                .find(target.addr, TransportKind::Udp)
                .ok_or_else(|| Error::Transport("No bound UDP socket".into())),
            kind => self.0.transport.obtain(target.addr, kind).await,
        }
    }

    fn fill_request_defaults(&self, request: &mut Request) {
        let settings = &self.0.settings;
        let headers = &mut request.headers;

        if headers.call_id().is_none() {
            let id = uuid::Uuid::new_v4().to_string();
            headers.push(Header::CallId(crate::headers::CallId::new(&id)));
        }

        if !headers.contains(crate::headers::MaxForwards::NAME) {
            headers.push(Header::MaxForwards(crate::headers::MaxForwards::new(
                settings.max_forwards,
            )));
        }

        if let Some(user_agent) = &settings.user_agent {
            if !headers.contains("User-Agent") {
                headers.push(Header::Other {
                    name: "User-Agent".into(),
                    value: user_agent.as_str().into(),
                });
            }
        }
    }

    /// Respond statelessly an request.
    ///
    /// This method create an response from the incoming request and
    /// sent statelessly, meaning that no `UAS` transaction must be
    /// created for this request.
    pub async fn respond(&self, request: &IncomingRequest, code: StatusCode) -> Result<()> {
        assert!(request.transaction.is_none(), "Request already has a transaction");

        let mut msg = self.new_response(request, code);

        self.send_response(&mut msg).await
    }

    /// Creates a new SIP response based on an incoming request.
    ///
    /// This method generates a response message with the code's default
    /// reason phrase. It also sets the necessary headers from request,
    /// including `Call-ID`, `From`, `To`, `CSeq`, `Via` and `Record-Route` headers.
    pub fn new_response(&self, req: &IncomingRequest, code: StatusCode) -> OutgoingResponse {
        // Copy the necessary headers from the request.
        let mut headers = crate::headers::Headers::with_capacity(8);
        let msg_headers = &req.request.headers;

        // `Via` headers, the topmost one with its received/rport
        // normalization applied.
        let topmost_via = req.request_headers.via.clone();
        let via = msg_headers.iter().filter(|h| matches!(h, Header::Via(_))).skip(1);
        headers.push(Header::Via(topmost_via));
        headers.extend(via.cloned());

        // `Record-Route` headers.
        let rr = msg_headers
            .iter()
            .filter(|h| h.name().eq_ignore_ascii_case("Record-Route"));
        headers.extend(rr.cloned());

        // `Call-ID` header.
        headers.push(Header::CallId(req.request_headers.call_id.clone()));

        // `From` header.
        headers.push(Header::From(req.request_headers.from.clone()));

        // `To` header.
        let mut to = req.request_headers.to.clone();
        // 8.2.6.2 Headers and Tags
        // The UAS MUST add a tag to the To header field in
        // the response (with the exception of the 100 (Trying)
        // response, in which a tag MAY be present).
        if to.tag().is_none() && code.code() > 100 {
            to.set_tag(req.request_headers.via.branch());
        }
        headers.push(Header::To(to));

        // `CSeq` header.
        headers.push(Header::CSeq(req.request_headers.cseq.clone()));

        if let Some(server) = &self.0.settings.server {
            headers.push(Header::Other {
                name: "Server".into(),
                value: server.as_str().into(),
            });
        }

        let addr = get_outbound_addr(&req.request_headers.via, &req.transport);
        let status_line = StatusLine::new(code, code.reason());

        // Done.
        OutgoingResponse {
            response: Response {
                status_line,
                headers,
                body: None,
            },
            addr,
            buf: None,
        }
    }

    /// Sends a SIP response to the address selected per 18.2.2.
    pub async fn send_response(&self, response: &mut OutgoingResponse) -> Result<()> {
        self.dispatch_response(response).await?;
        Ok(())
    }

    /// Encodes and writes a response, returning the bytes and the
    /// connection used so a server transaction can retransmit them.
    pub(crate) async fn dispatch_response(
        &self,
        response: &mut OutgoingResponse,
    ) -> Result<(Bytes, Arc<dyn Transport>, SocketAddr)> {
        log::debug!("=> Response {} {}", response.status_code().code(), response.reason());

        let encoded_buf = match response.buf.take() {
            Some(buf) => buf,
            None => response.to_bytes()?,
        };

        match &response.addr {
            OutgoingAddr::HostPort {
                host: HostPort { host, port },
                kind,
            } => {
                let ip = resolve_host(host).await?;
                let port = port.unwrap_or(kind.default_port());
                let addr = SocketAddr::new(ip, port);

                // Find the transport for the given address and protocol.
                let transport = match self.0.transport.find(addr, *kind) {
                    Some(transport) => transport,
                    None => self.0.transport.obtain(addr, *kind).await?,
                };
                transport.send(&encoded_buf, &addr).await?;

                Ok((encoded_buf, transport, addr))
            }
            OutgoingAddr::Addr { addr, transport } => {
                transport.send(&encoded_buf, addr).await?;

                Ok((encoded_buf, transport.clone(), *addr))
            }
        }
    }

    /// Feeds a received request into the endpoint, as the transport
    /// layer does. Exposed for hosts that drive their own I/O.
    pub async fn recv_request(&self, request: IncomingRequest) -> Result<()> {
        self.process_request(&mut Some(request)).await
    }

    /// Feeds a received response into the endpoint.
    pub async fn recv_response(&self, response: IncomingResponse) -> Result<()> {
        self.process_response(&mut Some(response)).await
    }

    /// Rebuilds a transaction from a snapshot onto `transport`.
    pub async fn restore_snapshot(&self, snapshot: TsxSnapshot, transport: Arc<dyn Transport>) -> Result<TsxHandle> {
        crate::transaction::snapshot::restore(self, snapshot, transport).await
    }

    pub(crate) async fn process_response(&self, msg: &mut Option<IncomingResponse>) -> Result<()> {
        {
            let msg = msg.as_ref().expect("Response is present");
            log::debug!(
                "<= Response ({} {})",
                msg.response.status_line.code.code(),
                msg.response.status_line.reason
            );
        }

        let handled_by_transaction_layer = self.0.transaction.handle_response(msg).await?;

        if handled_by_transaction_layer || msg.is_none() {
            return Ok(());
        }

        for service in self.0.services.iter() {
            service.on_incoming_response(self, msg).await?;

            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg {
            log::debug!(
                "Response ({} {}) from /{} was unhandled by any service",
                msg.response.status_line.code.code(),
                msg.response.status_line.reason,
                msg.packet.addr
            );
        }

        Ok(())
    }

    pub(crate) async fn process_request(&self, msg: &mut Option<IncomingRequest>) -> Result<()> {
        {
            let msg = msg.as_ref().expect("Request is present");
            log::debug!("<= Request {} from /{}", msg.method(), msg.addr());
        }

        let handled_by_transaction_layer = self.0.transaction.handle_request(msg).await?;

        if handled_by_transaction_layer || msg.is_none() {
            return Ok(());
        }

        // Unmatched and not an ACK: this request opens a new server
        // transaction (17.2).
        let created: Option<ServerTsx> = {
            let request = msg.as_mut().expect("Request is present");
            if request.is_method(&Method::Ack) {
                None
            } else {
                let created = if request.is_method(&Method::Invite) {
                    self.new_uas_inv_tsx(request).map(ServerTsx::Invite)
                } else {
                    self.new_uas_tsx(request).map(ServerTsx::NonInvite)
                };

                match created {
                    Ok(tsx) => Some(tsx),
                    Err(Error::Unexpected(_)) => {
                        // Lost the creation race against a concurrent
                        // copy of the same request; the winner's
                        // transaction absorbs this one.
                        self.0.transaction.handle_request(msg).await?;
                        return Ok(());
                    }
                    Err(err) => return Err(err),
                }
            }
        };

        // If the request was not handled by the transaction layer, we
        // pass it to the services.
        for service in self.0.services.iter() {
            service.on_incoming_request(self, msg).await?;
            if msg.is_none() {
                break;
            }
        }

        if let Some(msg) = msg.take() {
            log::debug!(
                "Request ({}, cseq={}) from /{} was unhandled by any service",
                msg.method(),
                msg.cseq().cseq(),
                msg.addr()
            );

            // Nobody owns the transaction we just opened; drop it so
            // the store does not accumulate orphans.
            if let Some(tsx) = created {
                tsx.inner().on_terminated();
            }
        }

        Ok(())
    }

    pub(crate) fn transactions(&self) -> &TransactionLayer {
        &self.0.transaction
    }

    pub(crate) fn transport(&self) -> &TransportLayer {
        &self.0.transport
    }
}

/// The sent-by identity to advertise in a Via on this transport.
fn local_sent_by(transport: &dyn Transport) -> HostPort {
    let local = transport.local_addr();

    HostPort {
        host: Host::IpAddr(local.ip()),
        port: Some(local.port()),
    }
}

fn replace_top_via(request: &mut Request, via: Via) {
    for header in request.headers.iter_mut() {
        if let Header::Via(existing) = header {
            *existing = via;
            return;
        }
    }
}

// https://datatracker.ietf.org/doc/html/rfc3261#section-18.2.2
// https://datatracker.ietf.org/doc/html/rfc3581
fn get_outbound_addr(via: &Via, transport: &Arc<dyn Transport>) -> OutgoingAddr {
    if transport.reliable() {
        // Respond over the connection the request arrived on.
        let addr = transport.remote_addr().unwrap_or_else(|| transport.local_addr());
        return OutgoingAddr::Addr {
            addr,
            transport: transport.clone(),
        };
    }

    if let Some(maddr) = via.maddr() {
        let port = via.sent_by().port.unwrap_or(5060);

        OutgoingAddr::HostPort {
            host: HostPort {
                host: maddr.clone(),
                port: Some(port),
            },
            kind: via.transport(),
        }
    } else if let Some(rport) = via.rport().port() {
        let Some(ip) = via.received() else {
            return fallback_sent_by(via, transport);
        };
        let addr = SocketAddr::new(ip, rport);

        OutgoingAddr::Addr {
            addr,
            transport: transport.clone(),
        }
    } else {
        fallback_sent_by(via, transport)
    }
}

fn fallback_sent_by(via: &Via, transport: &Arc<dyn Transport>) -> OutgoingAddr {
    let port = via.sent_by().port.unwrap_or(5060);

    match via.received() {
        Some(ip) => OutgoingAddr::Addr {
            addr: SocketAddr::new(ip, port),
            transport: transport.clone(),
        },
        None => OutgoingAddr::HostPort {
            host: HostPort {
                host: via.sent_by().host.clone(),
                port: Some(port),
            },
            kind: via.transport(),
        },
    }
}

#[derive(Debug)]
struct NullTransport;

#[async_trait::async_trait]
impl Transport for NullTransport {
    async fn send(&self, _buf: &[u8], _addr: &SocketAddr) -> Result<usize> {
        Err(Error::Transport("Null transport".into()))
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Unknown
    }

    fn local_addr(&self) -> SocketAddr {
        "0.0.0.0:0".parse().expect("Valid address")
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_name(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed("null")
    }
}
