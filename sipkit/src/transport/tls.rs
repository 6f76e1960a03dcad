//! SIP TLS Transport.
//!
//! TCP wrapped in rustls. The stream framing and read-loop behavior
//! are identical to the TCP transport; only connection establishment
//! differs.

use std::{borrow::Cow, net::SocketAddr, sync::Arc};

use tokio::{
    io::{split, AsyncWriteExt, WriteHalf},
    net::{TcpListener, TcpStream},
    sync::Mutex,
    time::Duration,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{
    decoder::StreamDecoder,
    tcp::{is_temporary_accept_error, stream_read_loop},
    Direction, Factory, IdleTimeout, Transport, TransportCtx, TransportEvent, TransportStartup,
};
use crate::{
    error::{Error, Result},
    message::TransportKind,
};

type TlsWrite = Arc<Mutex<WriteHalf<TlsStream<TcpStream>>>>;

/// TLS transport implementation.
#[derive(Debug)]
pub struct TlsTransport {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    write: TlsWrite,
    #[allow(dead_code)]
    dir: Direction,
    idle: IdleTimeout,
    closed: CancellationToken,
}

impl TlsTransport {
    fn new(
        stream: TlsStream<TcpStream>,
        addr: SocketAddr,
        remote_addr: SocketAddr,
        dir: Direction,
        ttl: Option<Duration>,
    ) -> (Arc<Self>, FramedRead<tokio::io::ReadHalf<TlsStream<TcpStream>>, StreamDecoder>) {
        let (read, write) = split(stream);

        let transport = Arc::new(TlsTransport {
            addr,
            remote_addr,
            write: Arc::new(Mutex::new(write)),
            dir,
            idle: IdleTimeout::new(ttl),
            closed: CancellationToken::new(),
        });

        (transport, FramedRead::new(read, StreamDecoder))
    }
}

#[async_trait::async_trait]
impl Transport for TlsTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.write.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;
        self.idle.touch();

        Ok(buf.len())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        Some(self.remote_addr)
    }

    fn local_name(&self) -> Cow<'_, str> {
        Cow::Owned(self.addr.to_string())
    }

    fn touch(&self) {
        self.idle.touch();
    }

    fn is_expired(&self, now: tokio::time::Instant) -> bool {
        self.idle.is_expired(now)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Loads a PEM certificate chain and private key into a rustls server
/// configuration.
pub fn server_config_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig> {
    let certs: std::result::Result<Vec<CertificateDer<'static>>, _> =
        rustls_pemfile::certs(&mut &cert_pem[..]).collect();
    let certs = certs.map_err(|err| Error::Transport(format!("Invalid certificate PEM: {}", err)))?;

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|err| Error::Transport(format!("Invalid key PEM: {}", err)))?
        .ok_or_else(|| Error::Transport("No private key in PEM".into()))?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| Error::Transport(format!("TLS config rejected: {}", err)))
}

/// A TLS server for accept incoming connections.
pub struct TlsServer {
    sock: TcpListener,
    addr: SocketAddr,
    local_name: String,
    acceptor: TlsAcceptor,
}

impl TlsServer {
    /// Creates a new TLS server with the given rustls configuration.
    pub async fn create(addr: SocketAddr, config: Arc<ServerConfig>) -> Result<Self> {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self {
            sock,
            addr,
            local_name,
            acceptor: TlsAcceptor::from(config),
        })
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub(crate) async fn handle_incoming(self, ctx: TransportCtx) -> Result<()> {
        loop {
            let accepted = tokio::select! {
                accepted = self.sock.accept() => accepted,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };

            let (stream, addr) = match accepted {
                Ok(ok) => ok,
                Err(err) if is_temporary_accept_error(&err) => {
                    log::warn!("Failed to accept connection: {:#}", err);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(err) => {
                    ctx.tx
                        .send(TransportEvent::ListenerError {
                            addr: self.addr,
                            cause: err.to_string(),
                        })
                        .await?;
                    return Err(Error::Listen {
                        addr: self.addr,
                        cause: err.to_string(),
                    });
                }
            };

            log::debug!("Got incoming TLS connection from {}", addr);
            let acceptor = self.acceptor.clone();
            let ctx_accept = ctx.clone();
            ctx.spawn(async move {
                let local = match stream.local_addr() {
                    Ok(local) => local,
                    Err(err) => {
                        log::warn!("TLS connection from {} lost: {}", addr, err);
                        return;
                    }
                };
                let stream = match acceptor.accept(stream).await {
                    Ok(stream) => TlsStream::Server(stream),
                    Err(err) => {
                        log::warn!("TLS handshake with {} failed: {}", addr, err);
                        return;
                    }
                };
                if let Err(err) = register_connection(stream, local, addr, Direction::Incoming, ctx_accept).await {
                    log::warn!("An error occured; error = {:#}", err);
                }
            });
        }
    }
}

async fn register_connection(
    stream: TlsStream<TcpStream>,
    local: SocketAddr,
    addr: SocketAddr,
    dir: Direction,
    ctx: TransportCtx,
) -> Result<Arc<dyn Transport>> {
    let (transport, reader) = TlsTransport::new(stream, local, addr, dir, ctx.connection_ttl);
    let closed = transport.closed.clone();
    let transport: Arc<dyn Transport> = transport;

    ctx.tx.send(TransportEvent::Created(transport.clone())).await?;

    let read_transport = transport.clone();
    let loop_ctx = ctx.clone();
    ctx.spawn(async move {
        if let Err(err) = stream_read_loop(reader, addr, read_transport, closed, loop_ctx).await {
            log::debug!("TLS read loop from {} ended: {}", addr, err);
        }
    });

    Ok(transport)
}

/// Factory for create tls transports.
pub struct TlsFactory {
    connector: TlsConnector,
}

impl TlsFactory {
    /// Creates a factory dialing with the given client configuration.
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            connector: TlsConnector::from(config),
        }
    }
}

#[async_trait::async_trait]
impl Factory for TlsFactory {
    async fn dial(&self, addr: SocketAddr, ctx: TransportCtx) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::Transport(format!("TLS dial {} failed: {}", addr, err)))?;
        let local = stream.local_addr()?;

        let server_name = ServerName::IpAddress(addr.ip().into());
        let stream = self
            .connector
            .connect(server_name, stream)
            .await
            .map_err(|err| Error::Transport(format!("TLS handshake with {} failed: {}", addr, err)))?;

        register_connection(TlsStream::Client(stream), local, addr, Direction::Outgoing, ctx).await
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tls
    }
}

pub(crate) struct TlsStartup {
    addr: SocketAddr,
    server: Arc<ServerConfig>,
    client: Option<Arc<ClientConfig>>,
}

impl TlsStartup {
    pub fn new(addr: SocketAddr, server: Arc<ServerConfig>, client: Option<Arc<ClientConfig>>) -> Self {
        Self { addr, server, client }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TlsStartup {
    async fn start(&self, ctx: TransportCtx) -> Result<()> {
        let server = TlsServer::create(self.addr, self.server.clone())
            .await
            .map_err(|err| Error::Listen {
                addr: self.addr,
                cause: err.to_string(),
            })?;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tls,
            server.local_name
        );

        if let Some(client) = &self.client {
            ctx.tx
                .send(TransportEvent::Factory(Box::new(TlsFactory::new(client.clone()))))
                .await?;
        }

        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = server.handle_incoming(loop_ctx).await {
                log::error!("TLS listener ended: {}", err);
            }
        });

        Ok(())
    }
}
