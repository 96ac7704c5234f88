use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWriteExt, ReadBuf};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};

use crate::transport::INCOMING_STREAM;

/// Gate the per-connection decode loop parks on while the application layer
/// consumes a raw stream straight off the socket.
///
/// Two phases: the decoder *opens* the gate when it observes a stream marker
/// (so a consumer can wait for the announcement instead of sleeping), then
/// parks until the consumer *closes* it after reading the announced number of
/// bytes. The decoder never reads past the marker while the gate is open.
#[derive(Default)]
pub struct StreamGate {
    opened: Notify,
    closed: Notify,
}

impl StreamGate {
    pub fn open(&self) {
        self.opened.notify_one();
    }

    pub async fn wait_open(&self) {
        self.opened.notified().await;
    }

    pub fn close(&self) {
        self.closed.notify_one();
    }

    pub async fn wait_close(&self) {
        self.closed.notified().await;
    }
}

/// A live connection to another node.
#[async_trait]
pub trait Peer: Send + Sync {
    /// Remote address of the connection; used as the peer-set key.
    fn remote_addr(&self) -> SocketAddr;

    /// True if we dialed this peer, false if we accepted it.
    fn is_outbound(&self) -> bool;

    /// Writes bytes to the peer verbatim.
    async fn send(&self, payload: &[u8]) -> io::Result<()>;

    /// Writes a stream announcement (marker byte plus little-endian size),
    /// then copies `src` to the peer verbatim. The writer is held for the
    /// whole transfer so no other frame can interleave mid-stream.
    async fn send_stream(
        &self,
        size: u64,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64>;

    /// Waits until the decode loop has observed a stream marker from this
    /// peer and parked.
    async fn wait_stream(&self);

    /// Exclusive access to the raw inbound byte stream. The decode loop stays
    /// parked until `close_stream` is called; drop the reader first.
    async fn stream_reader(&self) -> StreamReader;

    /// Signals that the in-flight stream has been fully consumed, resuming
    /// the decode loop.
    fn close_stream(&self);
}

/// TCP implementation of `Peer`: a split socket plus the stream gate.
///
/// Cloning is cheap; clones share the underlying connection.
#[derive(Clone)]
pub struct TcpPeer {
    remote_addr: SocketAddr,
    outbound: bool,
    reader: Arc<Mutex<OwnedReadHalf>>,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    gate: Arc<StreamGate>,
}

impl TcpPeer {
    pub fn new(stream: TcpStream, outbound: bool) -> io::Result<Self> {
        let remote_addr = stream.peer_addr()?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            remote_addr,
            outbound,
            reader: Arc::new(Mutex::new(reader)),
            writer: Arc::new(Mutex::new(writer)),
            gate: Arc::new(StreamGate::default()),
        })
    }

    pub(crate) fn reader(&self) -> Arc<Mutex<OwnedReadHalf>> {
        self.reader.clone()
    }

    pub(crate) fn gate(&self) -> Arc<StreamGate> {
        self.gate.clone()
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        writer.flush().await
    }

    async fn send_stream(
        &self,
        size: u64,
        src: &mut (dyn AsyncRead + Send + Unpin),
    ) -> io::Result<u64> {
        let mut writer = self.writer.lock().await;

        let mut header = [0u8; 9];
        header[0] = INCOMING_STREAM;
        header[1..].copy_from_slice(&size.to_le_bytes());
        writer.write_all(&header).await?;

        let n = tokio::io::copy(src, &mut *writer).await?;
        writer.flush().await?;
        Ok(n)
    }

    async fn wait_stream(&self) {
        self.gate.wait_open().await;
    }

    async fn stream_reader(&self) -> StreamReader {
        StreamReader(self.reader.clone().lock_owned().await)
    }

    fn close_stream(&self) {
        self.gate.close();
    }
}

/// Exclusive handle over a peer's inbound socket, held while consuming the
/// raw bytes of a stream.
pub struct StreamReader(OwnedMutexGuard<OwnedReadHalf>);

impl AsyncRead for StreamReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().0).poll_read(cx, buf)
    }
}
