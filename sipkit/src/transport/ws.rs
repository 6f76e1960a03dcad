//! SIP WebSocket Transport, RFC 7118.
//!
//! Each WebSocket text or binary message carries exactly one SIP
//! message, so inbound payloads take the datagram parsing path even
//! though the connection itself is reliable and pooled like a stream.

use std::{borrow::Cow, net::SocketAddr, sync::Arc, time::SystemTime};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Duration;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::{
    tcp::is_temporary_accept_error, Direction, Factory, IdleTimeout, Packet, Payload, Transport, TransportCtx,
    TransportEvent, TransportStartup,
};
use crate::{
    error::{Error, Result},
    message::TransportKind,
};

const SIP_SUBPROTOCOL: &str = "sip";

type WsWrite<S> = Arc<Mutex<SplitSink<WebSocketStream<S>, Message>>>;

/// WebSocket transport implementation, shared by WS and WSS.
pub struct WsTransport<S> {
    addr: SocketAddr,
    remote_addr: SocketAddr,
    kind: TransportKind,
    write: WsWrite<S>,
    #[allow(dead_code)]
    dir: Direction,
    idle: IdleTimeout,
    closed: CancellationToken,
}

#[async_trait::async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let message = Message::Binary(buf.to_vec().into());

        let mut writer = self.write.lock().await;
        writer
            .send(message)
            .await
            .map_err(|err| Error::Transport(format!("WebSocket send failed: {}", err)))?;
        self.idle.touch();

        Ok(buf.len())
    }

    fn kind(&self) -> TransportKind {
        self.kind
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

fn negotiate_subprotocol(request: &Request, mut response: Response) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if offered.split(',').any(|p| p.trim().eq_ignore_ascii_case(SIP_SUBPROTOCOL)) {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", SIP_SUBPROTOCOL.parse().expect("Valid header"));
    }

    Ok(response)
}

async fn register_connection<S>(
    ws_stream: WebSocketStream<S>,
    kind: TransportKind,
    local: SocketAddr,
    addr: SocketAddr,
    dir: Direction,
    ctx: TransportCtx,
) -> Result<Arc<dyn Transport>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (write, read) = ws_stream.split();

    let transport = Arc::new(WsTransport {
        addr: local,
        remote_addr: addr,
        kind,
        write: Arc::new(Mutex::new(write)),
        dir,
        idle: IdleTimeout::new(ctx.connection_ttl),
        closed: CancellationToken::new(),
    });
    let closed = transport.closed.clone();
    let transport: Arc<dyn Transport> = transport;

    ctx.tx.send(TransportEvent::Created(transport.clone())).await?;

    let read_transport = transport.clone();
    let loop_ctx = ctx.clone();
    ctx.spawn(async move {
        if let Err(err) = ws_read_loop(read, addr, read_transport, closed, loop_ctx).await {
            log::debug!("WebSocket read loop from {} ended: {}", addr, err);
        }
    });

    Ok(transport)
}

async fn ws_read_loop<S>(
    mut read: SplitStream<WebSocketStream<S>>,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    closed: CancellationToken,
    ctx: TransportCtx,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let key = transport.key();

    loop {
        let message = tokio::select! {
            message = read.next() => message,
            _ = closed.cancelled() => None,
            _ = ctx.cancel.cancelled() => None,
        };

        let payload = match message {
            Some(Ok(Message::Text(text))) => bytes::Bytes::from(text.as_str().to_owned()),
            Some(Ok(Message::Binary(data))) => bytes::Bytes::from(data),
            Some(Ok(Message::Close(_))) | None => {
                ctx.tx.send(TransportEvent::Closed(key)).await?;
                return Ok(());
            }
            // Ping/Pong are answered by the protocol stack.
            Some(Ok(_)) => continue,
            Some(Err(err)) => {
                log::warn!("WebSocket from {} dropped: {}", addr, err);
                ctx.tx.send(TransportEvent::Closed(key)).await?;
                return Err(Error::Transport(err.to_string()));
            }
        };

        let packet = Packet {
            payload: Payload::new(payload),
            addr,
            time: SystemTime::now(),
        };
        ctx.tx
            .send(TransportEvent::Packet {
                transport: transport.clone(),
                packet,
            })
            .await?;
    }
}

/// A WebSocket server for accept incoming connections.
///
/// With a TLS configuration the server speaks WSS, without one plain
/// WS.
pub struct WsServer {
    sock: TcpListener,
    addr: SocketAddr,
    local_name: String,
    acceptor: Option<TlsAcceptor>,
}

impl WsServer {
    /// Creates a new WebSocket server.
    pub async fn create(addr: SocketAddr, tls: Option<Arc<ServerConfig>>) -> Result<Self> {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self {
            sock,
            addr,
            local_name,
            acceptor: tls.map(TlsAcceptor::from),
        })
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn kind(&self) -> TransportKind {
        if self.acceptor.is_some() {
            TransportKind::Wss
        } else {
            TransportKind::Ws
        }
    }

    pub(crate) async fn handle_incoming(self, ctx: TransportCtx) -> Result<()> {
        let kind = self.kind();

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

            log::debug!("Got incoming {} connection from {}", kind, addr);
            let acceptor = self.acceptor.clone();
            let ctx_accept = ctx.clone();
            ctx.spawn(async move {
                if let Err(err) = Self::on_accept(stream, addr, kind, acceptor, ctx_accept).await {
                    log::warn!("WebSocket handshake with {} failed: {}", addr, err);
                }
            });
        }
    }

    async fn on_accept(
        stream: TcpStream,
        addr: SocketAddr,
        kind: TransportKind,
        acceptor: Option<TlsAcceptor>,
        ctx: TransportCtx,
    ) -> Result<()> {
        let local = stream.local_addr()?;

        match acceptor {
            Some(acceptor) => {
                let stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|err| Error::Transport(format!("TLS handshake failed: {}", err)))?;
                let ws_stream = accept_hdr_async(stream, negotiate_subprotocol)
                    .await
                    .map_err(|err| Error::Transport(err.to_string()))?;

                register_connection(ws_stream, kind, local, addr, Direction::Incoming, ctx).await?;
            }
            None => {
                let ws_stream = accept_hdr_async(stream, negotiate_subprotocol)
                    .await
                    .map_err(|err| Error::Transport(err.to_string()))?;

                register_connection(ws_stream, kind, local, addr, Direction::Incoming, ctx).await?;
            }
        }

        Ok(())
    }
}

/// Factory for create WebSocket transports.
pub struct WsFactory {
    kind: TransportKind,
}

impl WsFactory {
    /// A factory dialing plain `ws://` peers.
    pub fn plaintext() -> Self {
        Self {
            kind: TransportKind::Ws,
        }
    }

    /// A factory dialing `wss://` peers.
    pub fn secure() -> Self {
        Self {
            kind: TransportKind::Wss,
        }
    }
}

#[async_trait::async_trait]
impl Factory for WsFactory {
    async fn dial(&self, addr: SocketAddr, ctx: TransportCtx) -> Result<Arc<dyn Transport>> {
        let scheme = if self.kind == TransportKind::Wss { "wss" } else { "ws" };
        let url = format!("{}://{}", scheme, addr);

        let (ws_stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|err| Error::Transport(format!("{} dial {} failed: {}", scheme, addr, err)))?;

        // The local address is not observable through the WebSocket
        // client API; the unspecified address keeps the pool keyed by
        // peer.
        let local = match addr {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().expect("Valid address"),
            SocketAddr::V6(_) => "[::]:0".parse().expect("Valid address"),
        };

        register_connection(ws_stream, self.kind, local, addr, Direction::Outgoing, ctx).await
    }

    fn kind(&self) -> TransportKind {
        self.kind
    }
}

pub(crate) struct WsStartup {
    addr: SocketAddr,
    tls: Option<Arc<ServerConfig>>,
}

impl WsStartup {
    pub fn new(addr: SocketAddr, tls: Option<Arc<ServerConfig>>) -> Self {
        Self { addr, tls }
    }
}

#[async_trait::async_trait]
impl TransportStartup for WsStartup {
    async fn start(&self, ctx: TransportCtx) -> Result<()> {
        let server = WsServer::create(self.addr, self.tls.clone())
            .await
            .map_err(|err| Error::Listen {
                addr: self.addr,
                cause: err.to_string(),
            })?;
        let kind = server.kind();

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            kind,
            server.local_name
        );

        let factory = if kind == TransportKind::Wss {
            WsFactory::secure()
        } else {
            WsFactory::plaintext()
        };
        ctx.tx.send(TransportEvent::Factory(Box::new(factory))).await?;

        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = server.handle_incoming(loop_ctx).await {
                log::error!("{} listener ended: {}", kind, err);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::task::TaskTracker;

    use super::*;

    const MSG_TEST: &[u8] = b"OPTIONS sip:bob@biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/WS pc33.atlanta.example.com;branch=z9hG4bK77e\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        From: Alice <sip:alice@atlanta.example.com>;tag=88\r\n\
        Call-ID: ws-1\r\n\
        CSeq: 1 OPTIONS\r\n\
        Content-Length: 0\r\n\r\n";

    fn test_ctx() -> (TransportCtx, mpsc::Receiver<TransportEvent>) {
        let (tx, rx) = mpsc::channel(8);
        let ctx = TransportCtx {
            tx,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            connection_ttl: None,
        };
        (ctx, rx)
    }

    #[tokio::test]
    async fn test_ws_roundtrip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (ctx, mut rx) = test_ctx();

        let server = WsServer::create(addr, None).await.unwrap();
        let server_addr = server.addr();
        tokio::spawn(server.handle_incoming(ctx.clone()));

        let dialer_transport = WsFactory::plaintext()
            .dial(server_addr, ctx)
            .await
            .unwrap();

        // Server side registers its end of the connection.
        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));
        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        dialer_transport.send(MSG_TEST, &server_addr).await.unwrap();

        let TransportEvent::Packet { packet, transport } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);
        assert_eq!(transport.kind(), TransportKind::Ws);
    }
}
