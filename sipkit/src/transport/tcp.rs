//! SIP TCP Transport.

use std::{borrow::Cow, io, net::SocketAddr, sync::Arc, time::SystemTime};

use tokio::{
    io::{split, AsyncRead, AsyncWriteExt, WriteHalf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::Mutex,
    time::Duration,
};
use tokio_stream::StreamExt;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use super::{
    decoder::StreamDecoder, Direction, Factory, IdleTimeout, Packet, Transport, TransportCtx, TransportEvent,
    TransportStartup,
};
use crate::{
    error::{Error, Result},
    message::TransportKind,
};

type TcpWrite = Arc<Mutex<WriteHalf<TcpStream>>>;

// Accept errors the OS reports for a single lost connection; the
// listener itself is still healthy.
pub(crate) fn is_temporary_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// TCP transport implementation.
///
/// One instance per established connection; the pool keys it by the
/// remote peer.
#[derive(Debug)]
pub struct TcpTransport {
    /// The transport local addr.
    addr: SocketAddr,
    /// The transport remote addr.
    remote_addr: SocketAddr,
    /// The tcp writer.
    write: TcpWrite,
    /// Transport direction.
    #[allow(dead_code)]
    dir: Direction,
    /// Idle TTL shared with the pool reaper.
    idle: IdleTimeout,
    /// Per-connection close signal observed by the read loop.
    closed: CancellationToken,
}

impl TcpTransport {
    fn new(stream: TcpStream, dir: Direction, ttl: Option<Duration>) -> Result<(Arc<Self>, FramedRead<tokio::io::ReadHalf<TcpStream>, StreamDecoder>)> {
        let addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (read, write) = split(stream);

        let transport = Arc::new(TcpTransport {
            addr,
            remote_addr,
            write: Arc::new(Mutex::new(write)),
            dir,
            idle: IdleTimeout::new(ttl),
            closed: CancellationToken::new(),
        });

        Ok((transport, FramedRead::new(read, StreamDecoder)))
    }
}

#[async_trait::async_trait]
impl Transport for TcpTransport {
    async fn send(&self, buf: &[u8], _: &SocketAddr) -> Result<usize> {
        let mut writer = self.write.lock().await;

        writer.write_all(buf).await?;
        writer.flush().await?;
        self.idle.touch();

        Ok(buf.len())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
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

/// Reads framed messages from a stream connection until it drops.
///
/// Shared by the TCP and TLS transports; `close()` on the transport or
/// layer shutdown stops the loop, a read error or EOF reports the
/// connection closed so waiting transactions can be failed over.
pub(crate) async fn stream_read_loop<R>(
    mut reader: FramedRead<R, StreamDecoder>,
    addr: SocketAddr,
    transport: Arc<dyn Transport>,
    closed: CancellationToken,
    ctx: TransportCtx,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let key = transport.key();

    loop {
        let frame = tokio::select! {
            frame = reader.next() => frame,
            _ = closed.cancelled() => None,
            _ = ctx.cancel.cancelled() => None,
        };

        match frame {
            Some(Ok(payload)) => {
                let packet = Packet {
                    payload,
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
            Some(Err(err)) => {
                log::warn!("Stream from {} dropped: {}", addr, err);
                ctx.tx.send(TransportEvent::Closed(key)).await?;
                return Err(Error::Io(err));
            }
            None => {
                ctx.tx.send(TransportEvent::Closed(key)).await?;
                return Ok(());
            }
        };
    }
}

/// A TCP server for accept incoming connections.
pub struct TcpServer {
    // Main socket for accept tcp connections.
    sock: TcpListener,
    // Where this server is bind to.
    addr: SocketAddr,
    // The server local name addres.
    local_name: String,
}

impl TcpServer {
    /// Creates a new TCP server.
    pub async fn create<A>(addr: A) -> Result<Self>
    where
        A: ToSocketAddrs,
    {
        let sock = TcpListener::bind(addr).await?;
        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self { sock, local_name, addr })
    }

    /// The bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serves incoming TCP connections by accepting and handling them.
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
                    // The listener is broken.
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

            log::debug!("Got incoming TCP connection from {}", addr);
            let ctx = ctx.clone();
            ctx.clone().spawn(async move {
                if let Err(err) = Self::on_accept(stream, addr, ctx).await {
                    log::warn!("An error occured; error = {:#}", err);
                }
            });
        }
    }

    // Handle incoming connection.
    async fn on_accept(stream: TcpStream, addr: SocketAddr, ctx: TransportCtx) -> Result<()> {
        let (transport, reader) = TcpTransport::new(stream, Direction::Incoming, ctx.connection_ttl)?;
        let closed = transport.closed.clone();
        let transport: Arc<dyn Transport> = transport;

        // Register the new transport.
        ctx.tx.send(TransportEvent::Created(transport.clone())).await?;

        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = stream_read_loop(reader, addr, transport, closed, loop_ctx).await {
                log::debug!("TCP read loop from {} ended: {}", addr, err);
            }
        });

        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
/// Factory for create tcp transports.
pub struct TcpFactory;

#[async_trait::async_trait]
impl Factory for TcpFactory {
    async fn dial(&self, addr: SocketAddr, ctx: TransportCtx) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|err| Error::Transport(format!("TCP dial {} failed: {}", addr, err)))?;

        let (transport, reader) = TcpTransport::new(stream, Direction::Outgoing, ctx.connection_ttl)?;
        let closed = transport.closed.clone();
        let transport: Arc<dyn Transport> = transport;

        let remote = transport.remote_addr().expect("Stream transport has a peer");
        let read_transport = transport.clone();
        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = stream_read_loop(reader, remote, read_transport, closed, loop_ctx).await {
                log::debug!("TCP read loop from {} ended: {}", remote, err);
            }
        });

        Ok(transport)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Tcp
    }
}

pub(crate) struct TcpStartup {
    addr: SocketAddr,
}

impl TcpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for TcpStartup {
    async fn start(&self, ctx: TransportCtx) -> Result<()> {
        let tcp_server = TcpServer::create(self.addr).await.map_err(|err| Error::Listen {
            addr: self.addr,
            cause: err.to_string(),
        })?;

        log::debug!(
            "SIP {} transport ready for incoming connections at {}",
            TransportKind::Tcp,
            tcp_server.local_name
        );

        ctx.tx.send(TransportEvent::Factory(Box::new(TcpFactory))).await?;

        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = tcp_server.handle_incoming(loop_ctx).await {
                log::error!("TCP listener ended: {}", err);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpSocket;
    use tokio::sync::mpsc;
    use tokio_util::task::TaskTracker;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.example.com SIP/2.0\r\n\
    Via: SIP/2.0/TCP bobspc.biloxi.example.com:5060;branch=z9hG4bKnashds7\r\n\
    Max-Forwards: 70\r\n\
    To: Bob <sip:bob@biloxi.example.com>\r\n\
    From: Bob <sip:bob@biloxi.example.com>;tag=456248\r\n\
    Call-ID: 843817637684230@998sdasdh09\r\n\
    CSeq: 1826 REGISTER\r\n\
    Contact: <sip:bob@192.0.2.4>\r\n\
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
    async fn smoke() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (ctx, mut rx) = test_ctx();

        let server = TcpServer::create(addr).await.unwrap();
        let socket = TcpSocket::new_v4().unwrap();
        let server_addr = server.addr;

        tokio::spawn(server.handle_incoming(ctx));

        let mut client = socket.connect(server_addr).await.unwrap();

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        client.write_all(MSG_TEST).await.unwrap();
        client.flush().await.unwrap();

        let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);
    }

    #[tokio::test]
    async fn test_dial_and_send() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (ctx, _rx) = test_ctx();

        let listener = TcpListener::bind(addr).await.unwrap();
        let server_addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let transport = TcpFactory.dial(server_addr, ctx).await.unwrap();
        let (mut peer, _) = accept.await.unwrap();

        transport.send(MSG_TEST, &server_addr).await.unwrap();

        let mut buf = vec![0u8; MSG_TEST.len()];
        tokio::io::AsyncReadExt::read_exact(&mut peer, &mut buf).await.unwrap();
        assert_eq!(&buf, MSG_TEST);

        assert_eq!(transport.remote_addr(), Some(server_addr));
        assert_eq!(transport.kind(), TransportKind::Tcp);
    }

    #[tokio::test]
    async fn test_eof_reports_closed() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (ctx, mut rx) = test_ctx();

        let server = TcpServer::create(addr).await.unwrap();
        let server_addr = server.addr;
        tokio::spawn(server.handle_incoming(ctx));

        let client = TcpSocket::new_v4().unwrap().connect(server_addr).await.unwrap();
        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Created(_)));

        drop(client);

        assert!(matches!(rx.recv().await.unwrap(), TransportEvent::Closed(_)));
    }
}
