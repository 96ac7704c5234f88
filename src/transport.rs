use log::{debug, error, info};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};

use crate::peer::{Peer, TcpPeer};

/// Tag byte announcing a length-prefixed control frame.
pub const INCOMING_MESSAGE: u8 = 0x1;
/// Tag byte announcing a raw stream whose length the application layer
/// already knows.
pub const INCOMING_STREAM: u8 = 0x2;
/// Upper bound on a control frame payload; anything larger is a protocol
/// violation.
pub const MAX_CONTROL_PAYLOAD: usize = 1028;

const RPC_CHANNEL_CAPACITY: usize = 1024;

/// A control frame delivered to the transport consumer, stamped with the
/// sender's remote address.
#[derive(Debug, Clone)]
pub struct Rpc {
    pub from: SocketAddr,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// One decoded unit of wire traffic, before the remote address is stamped on.
struct Frame {
    payload: Vec<u8>,
    stream: bool,
}

/// Runs once per connection immediately after establishment; an error drops
/// the connection before any frame delivery.
pub type HandshakeFn = fn(&TcpPeer) -> io::Result<()>;

/// Handshake that accepts any peer.
pub fn nop_handshake(_: &TcpPeer) -> io::Result<()> {
    Ok(())
}

/// Called with each freshly connected peer; an error drops the connection.
pub type OnPeer =
    Arc<dyn Fn(TcpPeer) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send>> + Send + Sync>;

/// Called with the remote address of a dropped connection.
pub type OnPeerDrop = Arc<dyn Fn(SocketAddr) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct TransportConfig {
    pub listen_addr: SocketAddr,
    pub handshake: HandshakeFn,
    pub on_peer: Option<OnPeer>,
    pub on_peer_drop: Option<OnPeerDrop>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            handshake: nop_handshake,
            on_peer: None,
            on_peer_drop: None,
        }
    }
}

/// Everything a per-connection task needs, independent of the transport's
/// own lifetime.
#[derive(Clone)]
struct ConnContext {
    rpc_tx: mpsc::Sender<Rpc>,
    handshake: HandshakeFn,
    on_peer: Option<OnPeer>,
    on_peer_drop: Option<OnPeerDrop>,
}

/// Framed duplex transport over TCP. A single connection multiplexes control
/// frames and raw byte streams, distinguished by the leading tag byte.
pub struct TcpTransport {
    listen_addr: SocketAddr,
    ctx: ConnContext,
    rpc_rx: Option<mpsc::Receiver<Rpc>>,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl TcpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let (rpc_tx, rpc_rx) = mpsc::channel(RPC_CHANNEL_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        Self {
            listen_addr: config.listen_addr,
            ctx: ConnContext {
                rpc_tx,
                handshake: config.handshake,
                on_peer: config.on_peer,
                on_peer_drop: config.on_peer_drop,
            },
            rpc_rx: Some(rpc_rx),
            local_addr: None,
            shutdown,
        }
    }

    /// The bound listen address, available once `listen_and_accept` returns.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Takes the inbound frame channel. Yields each control frame in the
    /// order its connection delivered it; may only be taken once.
    pub fn consume(&mut self) -> Option<mpsc::Receiver<Rpc>> {
        self.rpc_rx.take()
    }

    /// Binds the listener and spawns the accept loop.
    pub async fn listen_and_accept(&mut self) -> io::Result<()> {
        let listener = TcpListener::bind(self.listen_addr).await?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);

        info!("transport listening on {}", local_addr);
        tokio::spawn(accept_loop(
            listener,
            self.ctx.clone(),
            self.shutdown.subscribe(),
        ));

        Ok(())
    }

    /// Dials a remote node without blocking the caller; failures are logged.
    pub fn dial(&self, addr: SocketAddr) {
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            debug!("attempting to connect with remote: {}", addr);
            match TcpStream::connect(addr).await {
                Ok(stream) => handle_conn(stream, true, ctx).await,
                Err(e) => error!("dial error for {}: {}", addr, e),
            }
        });
    }

    /// Stops accepting connections. Connections already established keep
    /// running until they hit EOF or an error.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnContext,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("transport listener closed");
                return;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_conn(stream, false, ctx.clone()));
                }
                Err(e) => error!("tcp accept error: {}", e),
            }
        }
    }
}

/// Per-connection read loop: handshake, register the peer, then decode
/// frames until the connection dies. Stream markers park the loop on the
/// peer's gate so the application can consume the raw bytes off the socket.
async fn handle_conn(stream: TcpStream, outbound: bool, ctx: ConnContext) {
    let peer = match TcpPeer::new(stream, outbound) {
        Ok(peer) => peer,
        Err(e) => {
            error!("peer setup error: {}", e);
            return;
        }
    };
    let remote = peer.remote_addr();

    if let Err(e) = (ctx.handshake)(&peer) {
        error!("handshake with {} failed: {}", remote, e);
        return;
    }

    if let Some(on_peer) = &ctx.on_peer {
        if let Err(e) = on_peer(peer.clone()).await {
            error!("dropping connection to {}: {}", remote, e);
            return;
        }
    }

    let reader = peer.reader();
    let gate = peer.gate();

    loop {
        let frame = {
            let mut reader = reader.lock().await;
            decode_frame(&mut reader).await
        };

        match frame {
            Ok(frame) if frame.stream => {
                debug!("incoming stream from {}, pausing decode loop", remote);
                gate.open();
                gate.wait_close().await;
                debug!("stream from {} done, resuming decode loop", remote);
            }
            Ok(frame) => {
                let rpc = Rpc {
                    from: remote,
                    payload: frame.payload,
                    stream: false,
                };
                if ctx.rpc_tx.send(rpc).await.is_err() {
                    // consumer is gone, nothing left to deliver to
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    error!("tcp read error from {}: {}", remote, e);
                }
                break;
            }
        }
    }

    if let Some(on_peer_drop) = &ctx.on_peer_drop {
        on_peer_drop(remote).await;
    }
    debug!("dropping peer connection: {}", remote);
}

/// Reads one frame off the wire: a tag byte, then for control frames a
/// big-endian length prefix and that many payload bytes. Stream frames carry
/// nothing further; the announced bytes stay on the socket for the
/// application layer.
async fn decode_frame(reader: &mut OwnedReadHalf) -> io::Result<Frame> {
    let tag = reader.read_u8().await?;

    match tag {
        INCOMING_STREAM => Ok(Frame {
            payload: Vec::new(),
            stream: true,
        }),
        INCOMING_MESSAGE => {
            let len = reader.read_u32().await? as usize;
            if len > MAX_CONTROL_PAYLOAD {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("control payload of {} bytes exceeds the {} byte cap", len, MAX_CONTROL_PAYLOAD),
                ));
            }

            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).await?;
            Ok(Frame {
                payload,
                stream: false,
            })
        }
        tag => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unknown frame tag: {:#04x}", tag),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let mut transport = TcpTransport::new(TransportConfig::default());
        assert!(transport.addr().is_none());

        transport
            .listen_and_accept()
            .await
            .expect("listen should succeed");

        let addr = transport.addr().expect("bound address should be known");
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_consume_is_single_shot() {
        let mut transport = TcpTransport::new(TransportConfig::default());
        assert!(transport.consume().is_some());
        assert!(transport.consume().is_none());
    }
}
