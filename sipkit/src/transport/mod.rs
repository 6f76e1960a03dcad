#![warn(missing_docs)]
//! SIP Transport Layer.
//!
//! Owns listeners and per-peer connections, routes outbound messages
//! and dispatches inbound packets up to the endpoint. Stream
//! connections are pooled by `(transport, remote address)` with a TTL
//! refreshed on every read and write; datagram sockets are pooled by
//! local address and never expire.

use std::{
    borrow::Cow,
    collections::HashMap,
    io::Write,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{
    endpoint::Endpoint,
    error::{Error, Result},
    headers::{CSeq, CallId, ContentLength, From as FromHdr, Header, Headers, SipHeaderParse, To, Via},
    message::{Host, HostPort, Method, Request, Response, SipMsg, StatusCode, TransportKind},
    parser,
    transaction::{ClientTsx, ServerTsx},
};

pub mod decoder;
pub mod tcp;
pub mod tls;
pub mod udp;
pub mod ws;

/// This trait represents a abstraction over a SIP transport implementation.
#[async_trait::async_trait]
pub trait Transport: Sync + Send + std::fmt::Debug + 'static {
    /// Sends a buffer to the specified remote socket address.
    ///
    /// Returns the number of bytes sent or an I/O error. Stream
    /// transports ignore `addr` and write to their fixed peer.
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize>;

    /// Returns the transport kind (e.g., UDP, TCP, TLS).
    fn kind(&self) -> TransportKind;

    /// Returns the local socket address bound to this transport.
    fn local_addr(&self) -> SocketAddr;

    /// The fixed peer of a stream connection; `None` for datagram
    /// sockets.
    fn remote_addr(&self) -> Option<SocketAddr>;

    /// Checks if the provided address belongs to the same IP address family
    /// (IPv4 vs IPv6) as the local socket address.
    fn is_same_af(&self, addr: &SocketAddr) -> bool {
        let our_addr = self.local_addr();

        (addr.is_ipv4() && our_addr.is_ipv4()) || (addr.is_ipv6() && our_addr.is_ipv6())
    }

    /// Returns the local transport name.
    fn local_name(&self) -> Cow<'_, str>;

    /// Returns `true` if the transport is reliable (e.g., TCP or TLS).
    fn reliable(&self) -> bool {
        self.kind().reliable()
    }

    /// Returns `true` if the transport is secure (e.g., TLS).
    fn secure(&self) -> bool {
        self.kind().secure()
    }

    /// Refreshes the idle deadline. Called by the pool on reads and by
    /// implementations after writes.
    fn touch(&self) {}

    /// `true` once the idle TTL has run out.
    fn is_expired(&self, _now: Instant) -> bool {
        false
    }

    /// Tears the connection down. The read loop observes this and
    /// exits.
    fn close(&self) {}

    /// Returns the key that uniquely identifies this transport connection.
    fn key(&self) -> TransportKey {
        match self.remote_addr() {
            Some(remote) => TransportKey::stream(self.kind(), remote),
            None => TransportKey::datagram(self.kind(), self.local_addr()),
        }
    }
}

/// Pool identity of a transport.
///
/// Stream connections are identified by their peer, datagram sockets by
/// the local address they are bound to.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransportKey {
    /// A bound datagram socket.
    Datagram {
        /// The transport kind.
        kind: TransportKind,
        /// The bound local address.
        local: SocketAddr,
    },
    /// A stream connection.
    Stream {
        /// The transport kind.
        kind: TransportKind,
        /// The remote peer.
        remote: SocketAddr,
    },
}

impl TransportKey {
    /// Key for a bound datagram socket.
    pub fn datagram(kind: TransportKind, local: SocketAddr) -> Self {
        TransportKey::Datagram { kind, local }
    }

    /// Key for a stream connection.
    pub fn stream(kind: TransportKind, remote: SocketAddr) -> Self {
        TransportKey::Stream { kind, remote }
    }

    /// The transport kind of the keyed connection.
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportKey::Datagram { kind, .. } | TransportKey::Stream { kind, .. } => *kind,
        }
    }
}

/// Shared idle-TTL state for pooled stream connections.
#[derive(Debug)]
pub(crate) struct IdleTimeout {
    ttl: Option<Duration>,
    expires_at: Mutex<Instant>,
}

impl IdleTimeout {
    pub(crate) fn new(ttl: Option<Duration>) -> Self {
        Self {
            ttl,
            expires_at: Mutex::new(Instant::now() + ttl.unwrap_or(Duration::ZERO)),
        }
    }

    pub(crate) fn touch(&self) {
        if let Some(ttl) = self.ttl {
            *self.expires_at.lock().expect("Lock failed") = Instant::now() + ttl;
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_some() && *self.expires_at.lock().expect("Lock failed") <= now
    }
}

/// This trait represents a factory for creating SIP transports.
///
/// Used by connection oriented transports (TCP, TLS, WS, WSS) to dial
/// out when no pooled connection to the peer exists.
#[async_trait::async_trait]
pub trait Factory: Sync + Send {
    /// Dials the remote address, registers the read loop on `events`
    /// and returns the new transport.
    async fn dial(&self, addr: SocketAddr, ctx: TransportCtx) -> Result<Arc<dyn Transport>>;

    /// Returns the transport protocol this factory creates.
    fn kind(&self) -> TransportKind;
}

/// Shared context handed to listeners, dialers and read loops.
#[derive(Clone)]
pub struct TransportCtx {
    /// Event channel into the transport layer.
    pub(crate) tx: TransportTx,
    /// Layer-wide shutdown token.
    pub(crate) cancel: CancellationToken,
    /// Tracker the read loops register with.
    pub(crate) tasks: TaskTracker,
    /// Idle TTL for pooled stream connections.
    pub(crate) connection_ttl: Option<Duration>,
}

impl TransportCtx {
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tasks.spawn(future);
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum Direction {
    Outgoing,
    Incoming,
}

/// Represents the raw binary content of a message or data block.
#[derive(Clone)]
pub struct Payload(pub(crate) Bytes);

impl Payload {
    /// Creates a new `Payload`.
    #[inline]
    pub fn new(bytes: Bytes) -> Self {
        Payload(bytes)
    }

    /// Returns the raw byte buffer of this payload.
    pub fn buf(&self) -> &[u8] {
        &self.0
    }
}

/// This type represents a SIP packet.
#[derive(Clone)]
pub struct Packet {
    /// The packet payload.
    pub payload: Payload,
    /// The address of the sender.
    pub addr: SocketAddr,
    /// The time the packet was received.
    pub time: SystemTime,
}

/// Represents the address of an outbound message.
pub enum OutgoingAddr {
    /// Routing by host and port, resolved when the message is sent.
    HostPort {
        /// The host and port of the address.
        host: HostPort,
        /// The transport protocol used.
        kind: TransportKind,
    },
    /// A fully resolved address with a connection to use.
    Addr {
        /// The socket address.
        addr: SocketAddr,
        /// The transport to use.
        transport: Arc<dyn Transport>,
    },
}

/// This trait is used to convert a type into a byte buffer.
pub trait ToBytes: Sized {
    /// Converts the type into a byte buffer.
    fn to_bytes(&self) -> Result<Bytes>;
}

fn render_into(
    buf_writer: &mut impl Write,
    headers: &Headers,
    body: Option<&Bytes>,
) -> Result<()> {
    // Headers, minus any stale Content-Length.
    for header in headers.iter() {
        if matches!(header, Header::ContentLength(_)) {
            continue;
        }
        write!(buf_writer, "{header}\r\n")?;
    }

    let body_len = body.map(|b| b.len()).unwrap_or(0);
    write!(buf_writer, "{}: {}\r\n", ContentLength::NAME, body_len)?;
    write!(buf_writer, "\r\n")?;

    if let Some(body) = body {
        buf_writer.write_all(body)?;
    }

    Ok(())
}

/// This type represents an outgoing SIP response.
pub struct OutgoingResponse {
    /// The SIP response message.
    pub response: Response,
    /// The address to send the response to.
    pub addr: OutgoingAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
}

impl OutgoingResponse {
    /// Returns the message status code.
    pub fn status_code(&self) -> StatusCode {
        self.response.status_line.code
    }

    /// Append headers to the message.
    pub fn append_headers(&mut self, other: &mut Headers) {
        self.response.append_headers(other);
    }

    /// Returns the message reason text.
    pub fn reason(&self) -> &str {
        &self.response.status_line.reason
    }

    /// Returns `true` if this is a provisional response.
    pub fn is_provisional(&self) -> bool {
        self.response.status_line.code.is_provisional()
    }

    /// Set the message body.
    pub fn set_body(&mut self, body: Bytes) {
        self.response.body = Some(body);
    }

    /// Returns the message headers mutably.
    pub fn headers_mut(&mut self) -> &mut Headers {
        &mut self.response.headers
    }
}

impl ToBytes for OutgoingResponse {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.response.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);

        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.response.status_line)?;
        render_into(&mut buf_writer, &self.response.headers, self.response.body.as_ref())?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// This type represents an outbound SIP request.
#[derive(Debug)]
pub struct OutgoingRequest {
    /// The SIP request message.
    pub msg: Request,
    /// The addr to send the request to.
    pub addr: SocketAddr,
    /// The message raw buffer.
    pub buf: Option<Bytes>,
    /// The transport to use for sending the request.
    pub transport: Arc<dyn Transport>,
}

impl ToBytes for OutgoingRequest {
    fn to_bytes(&self) -> Result<Bytes> {
        let estimated_message_size = if self.msg.body.is_none() { 800 } else { 1500 };
        let buf = BytesMut::with_capacity(estimated_message_size);

        let mut buf_writer = buf.writer();

        write!(buf_writer, "{}", &self.msg.req_line)?;
        render_into(&mut buf_writer, &self.msg.headers, self.msg.body.as_ref())?;

        Ok(buf_writer.into_inner().freeze())
    }
}

/// The routing-critical headers of an incoming message, extracted once
/// on receipt.
#[derive(Clone)]
pub struct RequestHeaders {
    /// The topmost Via header as found in the message.
    pub via: Via,
    /// The From header found in the message.
    pub from: FromHdr,
    /// The CSeq header as found in the message.
    pub cseq: CSeq,
    /// The Call-ID header found in the message.
    pub call_id: CallId,
    /// The To header found in the message.
    pub to: To,
}

/// This type represents an received SIP request.
pub struct IncomingRequest {
    /// The SIP request message.
    pub(crate) request: Request,
    /// The transport used to receive the request.
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the request.
    pub(crate) packet: Packet,
    /// The server transaction associated with this request, if any.
    pub(crate) transaction: Option<ServerTsx>,
    /// The request headers extracted from the request.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingRequest {
    /// Returns the topmost `To` header of the request.
    pub fn to(&self) -> &To {
        &self.request_headers.to
    }

    /// Returns the `From` header of the request.
    pub fn from(&self) -> &FromHdr {
        &self.request_headers.from
    }

    /// Returns the `Call-ID` header of the request.
    pub fn call_id(&self) -> &CallId {
        &self.request_headers.call_id
    }

    /// Returns the `CSeq` header of the request.
    pub fn cseq(&self) -> &CSeq {
        &self.request_headers.cseq
    }

    /// Returns the topmost `Via` header of the request.
    pub fn via(&self) -> &Via {
        &self.request_headers.via
    }

    /// Returns the request message.
    pub fn message(&self) -> &Request {
        &self.request
    }

    /// Returns `true` if the message method matches the given `Method`.
    #[inline(always)]
    pub fn is_method(&self, method: &Method) -> bool {
        self.request.method() == method
    }

    /// Returns the message method.
    pub fn method(&self) -> &Method {
        self.request.method()
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }

    /// The server transaction handling this request, if one was
    /// created.
    pub fn transaction(&self) -> Option<&ServerTsx> {
        self.transaction.as_ref()
    }

    #[inline]
    pub(crate) fn set_tsx(&mut self, tsx: ServerTsx) {
        self.transaction = Some(tsx);
    }
}

/// Represents an received SIP response.
pub struct IncomingResponse {
    /// The SIP response message.
    pub(crate) response: Response,
    /// The transport used to receive the response.
    pub(crate) transport: Arc<dyn Transport>,
    /// The packet that contains the response.
    pub(crate) packet: Packet,
    /// The transaction associated with this response, if any.
    pub(crate) transaction: Option<ClientTsx>,
    /// The request headers extracted from the response.
    pub(crate) request_headers: RequestHeaders,
}

impl IncomingResponse {
    /// Returns the response message.
    pub fn message(&self) -> &Response {
        &self.response
    }

    /// Returns the response status code.
    pub fn code(&self) -> StatusCode {
        self.response.code()
    }

    /// Returns the `CSeq` of the transaction the response answers.
    pub fn cseq(&self) -> &CSeq {
        &self.request_headers.cseq
    }

    /// Returns the `To` header of the response.
    pub fn to(&self) -> &To {
        &self.request_headers.to
    }

    /// Gets the source socket address of the packet.
    pub fn addr(&self) -> &SocketAddr {
        &self.packet.addr
    }
}

/// Events flowing from sockets into the transport layer.
pub(crate) enum TransportEvent {
    /// A packet was received from the transport layer.
    Packet {
        transport: Arc<dyn Transport>,
        packet: Packet,
    },
    /// A new transport was created.
    Created(Arc<dyn Transport>),
    /// A transport was closed.
    Closed(TransportKey),
    /// A factory was created.
    Factory(Box<dyn Factory>),
    /// A listener failed fatally.
    ListenerError { addr: SocketAddr, cause: String },
}

pub(crate) type TransportTx = mpsc::Sender<TransportEvent>;
pub(crate) type TransportRx = mpsc::Receiver<TransportEvent>;

/// Transport Layer for SIP messages.
pub struct TransportLayer {
    /// A map of transports indexed by their unique keys.
    transports: Mutex<HashMap<TransportKey, Arc<dyn Transport>>>,
    /// A list of transport factories.
    factorys: Mutex<Vec<Arc<dyn Factory>>>,
    /// In-flight dials, for coalescing concurrent sends to one peer.
    dials: tokio::sync::Mutex<HashMap<TransportKey, watch::Receiver<bool>>>,
    /// The transport sender used to send events to the transport layer.
    transport_tx: TransportTx,
    /// A receiver for transport events.
    transport_rx: Mutex<Option<TransportRx>>,
    /// Layer-wide shutdown token.
    cancel: CancellationToken,
    /// All read loops, listeners and the reaper.
    tasks: TaskTracker,
    /// Idle TTL applied to pooled stream connections.
    connection_ttl: Option<Duration>,
}

impl Default for TransportLayer {
    fn default() -> Self {
        Self::new(Some(Duration::from_secs(32)))
    }
}

impl TransportLayer {
    pub(crate) fn new(connection_ttl: Option<Duration>) -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(1_000);
        let transport_rx = Mutex::new(Some(transport_rx));

        Self {
            transport_tx,
            transport_rx,
            transports: Default::default(),
            factorys: Default::default(),
            dials: Default::default(),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            connection_ttl,
        }
    }

    pub(crate) fn ctx(&self) -> TransportCtx {
        TransportCtx {
            tx: self.transport_tx.clone(),
            cancel: self.cancel.clone(),
            tasks: self.tasks.clone(),
            connection_ttl: self.connection_ttl,
        }
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.lock().expect("Lock failed").len()
    }

    pub(crate) fn add_transport(&self, transport: Arc<dyn Transport>) {
        self.transports
            .lock()
            .expect("Lock failed")
            .insert(transport.key(), transport);
    }

    pub(crate) fn remove_transport(&self, key: TransportKey) -> Option<Arc<dyn Transport>> {
        self.transports.lock().expect("Lock failed").remove(&key)
    }

    pub(crate) fn add_factory(&self, factory: Box<dyn Factory>) {
        self.factorys.lock().expect("Lock failed").push(Arc::from(factory));
    }

    fn find_factory(&self, kind: TransportKind) -> Option<Arc<dyn Factory>> {
        self.factorys
            .lock()
            .expect("Lock failed")
            .iter()
            .find(|f| f.kind() == kind)
            .cloned()
    }

    /// Finds a suitable pooled transport for the given destination
    /// address and transport type, without dialing.
    pub fn find(&self, dst: SocketAddr, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        let transports = self.transports.lock().expect("Lock failed");

        // Stream connection to this exact peer.
        if let Some(transport) = transports.get(&TransportKey::stream(kind, dst)) {
            return Some(transport.clone());
        }

        // A bound datagram socket (or listener-side identity) of the
        // right kind and address family.
        transports
            .values()
            .filter(|handle| handle.kind() == kind && handle.is_same_af(&dst))
            .filter(|handle| handle.remote_addr().is_none() || handle.remote_addr() == Some(dst))
            .min_by(|a, b| Arc::strong_count(a).cmp(&Arc::strong_count(b)))
            .cloned()
    }

    /// Finds or dials a transport to the destination. A second caller
    /// for the same peer while a dial is in flight waits for that dial
    /// instead of opening another connection.
    pub(crate) async fn obtain(&self, dst: SocketAddr, kind: TransportKind) -> Result<Arc<dyn Transport>> {
        loop {
            if let Some(transport) = self.find(dst, kind) {
                return Ok(transport);
            }

            let key = TransportKey::stream(kind, dst);
            let pending = {
                let dials = self.dials.lock().await;
                dials.get(&key).cloned()
            };

            if let Some(mut rx) = pending {
                // Someone else is dialing this peer; wait and re-check
                // the pool.
                let _ = rx.changed().await;
                continue;
            }

            let factory = self
                .find_factory(kind)
                .ok_or_else(|| Error::Transport(format!("No {} factory registered", kind)))?;

            let (done_tx, done_rx) = watch::channel(false);
            self.dials.lock().await.insert(key, done_rx);

            log::debug!("Dialing {} {}", kind, dst);
            let dialed = factory.dial(dst, self.ctx()).await;

            self.dials.lock().await.remove(&key);
            let _ = done_tx.send(true);

            match dialed {
                Ok(transport) => {
                    self.add_transport(transport.clone());
                    return Ok(transport);
                }
                Err(err) => {
                    log::warn!("Dial {} {} failed: {}", kind, dst, err);
                    return Err(err);
                }
            }
        }
    }

    /// All local listening identities, used to validate the top Via of
    /// incoming responses.
    fn is_local_sent_by(&self, sent_by: &HostPort, kind: TransportKind) -> bool {
        let port = sent_by.port_or(kind);
        let transports = self.transports.lock().expect("Lock failed");

        transports
            .values()
            .filter(|t| t.kind() == kind && t.local_addr().port() == port)
            .any(|t| match &sent_by.host {
                Host::IpAddr(ip) => {
                    let local = t.local_addr().ip();
                    *ip == local || local.is_unspecified()
                }
                // A domain sent-by cannot be checked against bound
                // addresses without a lookup; accept it on port match.
                Host::DomainName(_) => true,
            })
    }

    /// Drives the layer: receives socket events until shutdown.
    pub(crate) async fn handle_events(&self, endpoint: &Endpoint) -> Result<()> {
        let mut rx = self
            .transport_rx
            .lock()
            .expect("Lock failed")
            .take()
            .ok_or(Error::ChannelClosed)?;

        self.tasks.spawn(Self::reap_idle(endpoint.clone()));

        loop {
            let evt = tokio::select! {
                evt = rx.recv() => evt,
                _ = self.cancel.cancelled() => None,
            };
            let Some(evt) = evt else { break };

            match evt {
                TransportEvent::Packet { transport, packet } => {
                    transport.touch();
                    let endpoint = endpoint.clone();
                    self.tasks.spawn(async move {
                        if let Err(err) = Self::on_received_packet(transport, packet, endpoint).await {
                            log::debug!("Inbound packet dropped: {}", err);
                        }
                    });
                }
                TransportEvent::Created(transport) => {
                    self.add_transport(transport);
                }
                TransportEvent::Closed(key) => {
                    self.remove_transport(key);
                    endpoint.transactions().on_transport_closed(key);
                }
                TransportEvent::Factory(factory) => {
                    self.add_factory(factory);
                }
                TransportEvent::ListenerError { addr, cause } => {
                    log::error!("Listener on {} broken: {}", addr, cause);
                }
            }
        }

        Ok(())
    }

    /// Periodically evicts idle stream connections.
    async fn reap_idle(endpoint: Endpoint) {
        let cancel = endpoint.transport().cancel.clone();
        let mut interval = tokio::time::interval(Duration::from_millis(500));

        loop {
            tokio::select! {
                _ = interval.tick() => (),
                _ = cancel.cancelled() => break,
            }

            let now = Instant::now();
            let expired: Vec<Arc<dyn Transport>> = {
                let transports = endpoint.transport().transports.lock().expect("Lock failed");
                transports
                    .values()
                    .filter(|t| t.is_expired(now))
                    .cloned()
                    .collect()
            };

            for transport in expired {
                log::debug!("Closing idle {} connection {:?}", transport.kind(), transport.key());
                transport.close();
                endpoint.transport().remove_transport(transport.key());
            }
        }
    }

    /// Closes every listener and connection and waits for all worker
    /// tasks to finish.
    pub(crate) async fn shutdown(&self) {
        self.cancel.cancel();

        let transports: Vec<Arc<dyn Transport>> = {
            let mut map = self.transports.lock().expect("Lock failed");
            map.drain().map(|(_, t)| t).collect()
        };
        for transport in transports {
            transport.close();
        }

        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn on_received_packet(transport: Arc<dyn Transport>, packet: Packet, endpoint: Endpoint) -> Result<()> {
        let payload = packet.payload.clone();
        let bytes = payload.buf();

        // Keep-Alive Request packet.
        if bytes == b"\r\n\r\n" {
            transport.send(b"\r\n", &packet.addr).await?;
            return Ok(());
        } else if bytes == b"\r\n" {
            // Keep-Alive Response packet, nothing to do.
            return Ok(());
        }

        // Stream frames are already exact; datagram and WebSocket
        // payloads carry one whole message each.
        let framed = matches!(transport.kind(), TransportKind::Tcp | TransportKind::Tls);
        let parsed = if framed {
            parser::parse_framed(bytes)
        } else {
            parser::parse_datagram(bytes)
        };

        let mut msg = match parsed {
            Ok(parsed_msg) => parsed_msg,
            Err(err) => {
                log::warn!(
                    "Ignoring {} bytes packet from {} {} : {}",
                    bytes.len(),
                    transport.kind(),
                    packet.addr,
                    err,
                );
                if !err.is_recoverable() && transport.reliable() {
                    // Malformed framing poisons the stream.
                    transport.close();
                    endpoint.transport().remove_transport(transport.key());
                }
                return Err(err);
            }
        };

        let request_headers = extract_request_headers(&mut msg)?;

        match msg {
            SipMsg::Request(request) => {
                let mut request_headers = request_headers;

                // 4. Server Behavior (RFC 3581)
                // The server MUST insert a "received" parameter containing
                // the source IP address that the request came from even if
                // it is identical to the value of the "sent-by" component.
                request_headers.via.set_received(packet.addr.ip());
                if request_headers.via.rport().is_present() {
                    request_headers.via.set_rport(packet.addr.port());
                }

                let mut request = Some(IncomingRequest {
                    request,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });
                endpoint.process_request(&mut request).await?;
            }
            SipMsg::Response(response) => {
                // 18.1.2: a response whose top Via does not name one of
                // our identities was not ours to receive.
                let sent_by = request_headers.via.sent_by();
                let kind = request_headers.via.transport();
                if !endpoint.transport().is_local_sent_by(sent_by, kind) {
                    log::warn!(
                        "Discarding response from {}: Via sent-by {} is not a local identity",
                        packet.addr,
                        sent_by,
                    );
                    return Ok(());
                }

                let mut response = Some(IncomingResponse {
                    response,
                    transport,
                    packet,
                    transaction: None,
                    request_headers,
                });
                endpoint.process_response(&mut response).await?;
            }
        }

        Ok(())
    }
}

fn extract_request_headers(msg: &mut SipMsg) -> Result<RequestHeaders> {
    let mut via: Option<Via> = None;
    let mut cseq: Option<CSeq> = None;
    let mut from: Option<FromHdr> = None;
    let mut call_id: Option<CallId> = None;
    let mut to: Option<To> = None;

    for header in msg.headers().iter() {
        match header {
            Header::Via(v) if via.is_none() => via = Some(v.clone()),
            Header::From(f) => from = Some(f.clone()),
            Header::To(t) => to = Some(t.clone()),
            Header::CallId(c) => call_id = Some(c.clone()),
            Header::CSeq(c) => cseq = Some(c.clone()),
            _ => (),
        }
    }

    let via = via.ok_or(Error::MissingRequiredHeader(Via::NAME))?;
    let from = from.ok_or(Error::MissingRequiredHeader(FromHdr::NAME))?;
    let to = to.ok_or(Error::MissingRequiredHeader(To::NAME))?;
    let call_id = call_id.ok_or(Error::MissingRequiredHeader(CallId::NAME))?;
    let cseq = cseq.ok_or(Error::MissingRequiredHeader(CSeq::NAME))?;

    Ok(RequestHeaders {
        via,
        cseq,
        call_id,
        from,
        to,
    })
}

/// A trait to start a new transport listener.
#[async_trait::async_trait]
pub(crate) trait TransportStartup: Sync + Send {
    async fn start(&self, ctx: TransportCtx) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::udp::mock::MockUdpTransport;

    #[tokio::test]
    async fn test_add_transport() {
        let transports = TransportLayer::default();
        let addr = "127.0.0.1:8080".parse().unwrap();

        transports.add_transport(Arc::new(MockUdpTransport));

        assert!(transports.find(addr, TransportKind::Udp).is_some());
        assert!(transports.transport_count() == 1);
    }

    #[tokio::test]
    async fn test_remove_transport() {
        let transports = TransportLayer::default();
        let udp_tp = Arc::new(MockUdpTransport);
        let addr = "127.0.0.1:8080".parse().unwrap();
        let key = udp_tp.key();

        transports.add_transport(udp_tp);
        assert!(transports.find(addr, TransportKind::Udp).is_some());

        transports.remove_transport(key);
        assert!(transports.find(addr, TransportKind::Udp).is_none());
        assert!(transports.transport_count() == 0);
    }

    #[tokio::test]
    async fn test_obtain_without_factory_fails() {
        let transports = TransportLayer::default();
        let addr = "127.0.0.1:5062".parse().unwrap();

        let err = transports.obtain(addr, TransportKind::Tcp).await.unwrap_err();
        assert_matches!(err, Error::Transport(_));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_timeout() {
        let idle = IdleTimeout::new(Some(Duration::from_secs(32)));

        assert!(!idle.is_expired(Instant::now()));

        tokio::time::sleep(Duration::from_secs(33)).await;
        assert!(idle.is_expired(Instant::now()));

        idle.touch();
        assert!(!idle.is_expired(Instant::now()));
    }

    #[test]
    fn test_keys() {
        let local = "127.0.0.1:5060".parse().unwrap();
        let remote = "192.0.2.9:5060".parse().unwrap();

        assert_ne!(
            TransportKey::datagram(TransportKind::Udp, local),
            TransportKey::stream(TransportKind::Tcp, remote)
        );
        assert_eq!(TransportKey::stream(TransportKind::Tcp, remote).kind(), TransportKind::Tcp);
    }
}
