//! SIP UDP Transport.
//! This module provides the implementation of the SIP
//! transport layer over UDP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use tokio::net::{ToSocketAddrs, UdpSocket};

use super::{Packet, Payload, Transport, TransportCtx, TransportEvent, TransportStartup};
use crate::error::{Error, Result};
use crate::message::TransportKind;

#[derive(Debug)]
struct Inner {
    sock: UdpSocket,
    addr: SocketAddr,
    local_name: String,
}

#[derive(Debug, Clone)]
/// UDP transport implementation.
///
/// One bound socket serves every peer; the packet source address is
/// recorded per datagram.
pub struct UdpTransport(Arc<Inner>);

impl UdpTransport {
    /// Binds a UDP transport to the specified address.
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let sock = UdpSocket::bind(addr).await?;

        let addr = sock.local_addr()?;
        let local_name = crate::get_local_name(&addr);

        Ok(Self(Arc::new(Inner {
            sock,
            addr,
            local_name,
        })))
    }

    async fn recv_loop(self, ctx: TransportCtx) -> Result<()> {
        let transport = Arc::new(self.clone());
        // Buffer to recv packet.
        let mut buf = vec![0u8; 4000];

        loop {
            let received = tokio::select! {
                received = self.0.sock.recv_from(&mut buf) => received,
                _ = ctx.cancel.cancelled() => return Ok(()),
            };

            let (len, addr) = match received {
                Ok(ok) => ok,
                Err(err) => {
                    // Transient datagram errors (including ICMP-driven
                    // connection-refused on some platforms) are retried
                    // silently.
                    log::trace!("UDP recv error on {}: {}", self.0.addr, err);
                    continue;
                }
            };

            let packet = Packet {
                payload: Payload::new(bytes::Bytes::copy_from_slice(&buf[..len])),
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
}

#[async_trait::async_trait]
impl Transport for UdpTransport {
    async fn send(&self, buf: &[u8], addr: &SocketAddr) -> Result<usize> {
        Ok(self.0.sock.send_to(buf, addr).await?)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Udp
    }

    fn local_addr(&self) -> SocketAddr {
        self.0.addr
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn local_name(&self) -> std::borrow::Cow<'_, str> {
        std::borrow::Cow::Borrowed(&self.0.local_name)
    }
}

pub(crate) struct UdpStartup {
    addr: SocketAddr,
}

impl UdpStartup {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

#[async_trait::async_trait]
impl TransportStartup for UdpStartup {
    async fn start(&self, ctx: TransportCtx) -> Result<()> {
        let udp = UdpTransport::bind(self.addr).await.map_err(|err| Error::Listen {
            addr: self.addr,
            cause: err.to_string(),
        })?;

        log::debug!(
            "SIP {} transport started, listening on {}",
            TransportKind::Udp,
            udp.local_name()
        );

        ctx.tx
            .send(TransportEvent::Created(Arc::new(udp.clone())))
            .await?;

        let loop_ctx = ctx.clone();
        ctx.spawn(async move {
            if let Err(err) = udp.recv_loop(loop_ctx).await {
                log::warn!("UDP receive loop ended: {}", err);
            }
        });

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    #[derive(Debug)]
    pub struct MockUdpTransport;

    #[async_trait::async_trait]
    impl Transport for MockUdpTransport {
        async fn send(&self, buf: &[u8], _addr: &SocketAddr) -> Result<usize> {
            Ok(buf.len())
        }

        fn kind(&self) -> TransportKind {
            TransportKind::Udp
        }

        fn local_addr(&self) -> SocketAddr {
            "127.0.0.1:5060".parse().unwrap()
        }

        fn remote_addr(&self) -> Option<SocketAddr> {
            None
        }

        fn local_name(&self) -> std::borrow::Cow<'_, str> {
            std::borrow::Cow::Borrowed("127.0.0.1:5060")
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    use super::*;

    const MSG_TEST: &[u8] = b"REGISTER sip:registrar.biloxi.example.com SIP/2.0\r\n\
        Via: SIP/2.0/UDP bobspc.biloxi.example.com:5060;branch=z9hG4bKnashds7\r\n\
        Max-Forwards: 70\r\n\
        To: Bob <sip:bob@biloxi.example.com>\r\n\
        From: Bob <sip:bob@biloxi.example.com>;tag=456248\r\n\
        Call-ID: 843817637684230@998sdasdh09\r\n\
        CSeq: 1826 REGISTER\r\n\
        Contact: <sip:bob@192.0.2.4>\r\n\
        Expires: 7200\r\n\
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
    async fn test_recv_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (ctx, mut rx) = test_ctx();

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        tokio::spawn(udp.clone().recv_loop(ctx));

        client.send_to(MSG_TEST, udp.local_addr()).await.unwrap();

        let TransportEvent::Packet { packet, .. } = rx.recv().await.unwrap() else {
            unreachable!();
        };

        assert_eq!(packet.payload.buf(), MSG_TEST);

        let client_addr = client.local_addr().unwrap();
        assert_eq!(packet.addr, client_addr);
    }

    #[tokio::test]
    async fn test_send_msg() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();

        let udp = UdpTransport::bind(addr).await.unwrap();
        let client = UdpSocket::bind(addr).await.unwrap();

        let client_addr = client.local_addr().unwrap();

        udp.send(MSG_TEST, &client_addr).await.unwrap();

        let mut buf = [0; MSG_TEST.len()];
        let len = client.recv(&mut buf).await.unwrap();

        assert!(len == MSG_TEST.len());
        assert_eq!(&buf[..len], MSG_TEST);
    }
}
