use log::{debug, error, info};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

use crate::cryptography;
use crate::message::{Message, MessageError};
use crate::pathkey::{cas_path_transform, PathTransform};
use crate::peer::{Peer, TcpPeer};
use crate::store::{self, Store, StoreConfig, StoreError};
use crate::transport::{
    nop_handshake, OnPeer, OnPeerDrop, Rpc, TcpTransport, TransportConfig, INCOMING_STREAM,
};
use crate::{IV_SIZE, KEY_SIZE};

/// How long `get` waits for each peer to announce a response stream. Peers
/// that do not hold the file never announce one.
const STREAM_ANNOUNCE_WAIT: Duration = Duration::from_millis(500);
/// How long a replica waits for the stream bytes behind a StoreFile message.
const REPLICA_STREAM_WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("peer ({0}) could not be found in the peer set")]
    UnknownPeer(SocketAddr),
    #[error("need to serve file ({0}) but it does not exist on disk")]
    NotOnDisk(String),
    #[error("file ({0}) is not available locally or from any connected peer")]
    Unavailable(String),
    #[error("peer ({0}) announced no stream in time")]
    StreamTimeout(SocketAddr),
}

pub struct ServerConfig {
    pub id: String,
    pub encrypt_key: [u8; KEY_SIZE],
    pub listen_addr: SocketAddr,
    pub storage_root: PathBuf,
    pub path_transform: PathTransform,
    pub bootstrap_nodes: Vec<SocketAddr>,
}

impl ServerConfig {
    /// A config with a fresh identity and key, the CAS transform and the
    /// default storage root. Override fields as needed.
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            id: cryptography::generate_id(),
            encrypt_key: cryptography::generate_encryption_key(),
            listen_addr,
            storage_root: PathBuf::from(store::DEFAULT_ROOT),
            path_transform: cas_path_transform,
            bootstrap_nodes: Vec::new(),
        }
    }
}

/// A storage node: owns the peer set and the local store, and drives the
/// store-broadcast-then-stream and get-broadcast-then-receive protocols.
pub struct FileServer {
    id: String,
    encrypt_key: [u8; KEY_SIZE],
    listen_addr: SocketAddr,
    bootstrap_nodes: Vec<SocketAddr>,
    peers: Mutex<HashMap<SocketAddr, Arc<dyn Peer>>>,
    storage: Store,
    local_addr: OnceLock<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl FileServer {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let storage = Store::new(StoreConfig {
            root: config.storage_root,
            path_transform: config.path_transform,
        });
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            id: config.id,
            encrypt_key: config.encrypt_key,
            listen_addr: config.listen_addr,
            bootstrap_nodes: config.bootstrap_nodes,
            peers: Mutex::new(HashMap::new()),
            storage,
            local_addr: OnceLock::new(),
            shutdown,
        })
    }

    /// Starts the transport, dials the bootstrap nodes and runs the dispatch
    /// loop until `stop` is called. Spawn this onto the runtime.
    pub async fn start(self: Arc<Self>) -> Result<(), ServerError> {
        let mut transport = self.build_transport();
        transport.listen_and_accept().await?;

        if let Some(addr) = transport.addr() {
            let _ = self.local_addr.set(addr);
        }
        let mut rpc_rx = transport.consume().ok_or_else(|| {
            io::Error::new(io::ErrorKind::Other, "transport frame channel already taken")
        })?;

        for addr in &self.bootstrap_nodes {
            transport.dial(*addr);
        }

        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                rpc = rpc_rx.recv() => match rpc {
                    Some(rpc) => self.handle_rpc(rpc).await,
                    None => break,
                }
            }
        }

        info!("[{}] file server stopped", self.label());
        transport.close();
        self.peers.lock().await.clear();
        Ok(())
    }

    /// Signals the dispatch loop to shut down.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The bound listen address, available once `start` is up.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn storage(&self) -> &Store {
        &self.storage
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Stores `src` under `key` on the local disk and replicates it,
    /// encrypted, to every connected peer.
    pub async fn store<R>(&self, key: &str, src: &mut R) -> Result<(), ServerError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        // plaintext lands on the local disk; a copy stays buffered for the
        // encrypted fan-out
        let mut file_buffer = Vec::new();
        src.read_to_end(&mut file_buffer).await?;
        let size = self
            .storage
            .write(&self.id, key, &mut file_buffer.as_slice())
            .await?;

        let msg = Message::StoreFile {
            id: self.id.clone(),
            key: cryptography::hash_key(key),
            size: size + IV_SIZE as u64,
        };
        self.broadcast(&msg).await?;

        // one encryption pass, the same marker-plus-ciphertext frame fanned
        // out to every peer
        let mut stream_frame = Vec::with_capacity(1 + IV_SIZE + file_buffer.len());
        stream_frame.push(INCOMING_STREAM);
        cryptography::copy_encrypt(
            &self.encrypt_key,
            &mut file_buffer.as_slice(),
            &mut stream_frame,
        )
        .await?;

        let peers = self.peer_snapshot().await;
        for peer in &peers {
            if let Err(e) = peer.send(&stream_frame).await {
                error!(
                    "[{}] stream write to {} failed: {}",
                    self.label(),
                    peer.remote_addr(),
                    e
                );
            }
        }

        info!(
            "[{}] stored ({}) locally, replicated {} bytes to {} peers",
            self.label(),
            key,
            size,
            peers.len()
        );
        Ok(())
    }

    /// Returns a reader over the file for `key`, fetching it from the
    /// network into the local store first if it is not already on disk.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if self.storage.has(&self.id, key).await {
            info!("[{}] serving file ({}) from local disk", self.label(), key);
            return Ok(self.storage.read(&self.id, key).await?);
        }

        info!(
            "[{}] file ({}) not found locally, fetching from the network",
            self.label(),
            key
        );

        let msg = Message::GetFile {
            id: self.id.clone(),
            key: cryptography::hash_key(key),
        };
        self.broadcast(&msg).await?;

        let mut received = false;
        for peer in self.peer_snapshot().await {
            // a peer without the file never announces a stream
            if timeout(STREAM_ANNOUNCE_WAIT, peer.wait_stream()).await.is_err() {
                debug!(
                    "[{}] no stream from {} within {:?}",
                    self.label(),
                    peer.remote_addr(),
                    STREAM_ANNOUNCE_WAIT
                );
                continue;
            }

            let mut reader = peer.stream_reader().await;
            let file_size = reader.read_u64_le().await?;
            let mut src = reader.take(file_size);
            let result = self
                .storage
                .write_decrypt(&self.encrypt_key, &self.id, key, &mut src)
                .await;
            drop(src);
            peer.close_stream();
            let n = result?;

            info!(
                "[{}] received {} bytes over the network from {}",
                self.label(),
                n,
                peer.remote_addr()
            );
            received = true;
        }

        if !received {
            return Err(ServerError::Unavailable(key.to_string()));
        }

        Ok(self.storage.read(&self.id, key).await?)
    }

    fn build_transport(self: &Arc<Self>) -> TcpTransport {
        let on_peer: OnPeer = {
            let server = Arc::clone(self);
            Arc::new(move |peer: TcpPeer| {
                let server = server.clone();
                Box::pin(async move { server.on_peer(peer).await })
                    as Pin<Box<dyn Future<Output = io::Result<()>> + Send>>
            })
        };
        let on_peer_drop: OnPeerDrop = {
            let server = Arc::clone(self);
            Arc::new(move |addr: SocketAddr| {
                let server = server.clone();
                Box::pin(async move { server.on_peer_drop(addr).await })
                    as Pin<Box<dyn Future<Output = ()> + Send>>
            })
        };

        TcpTransport::new(TransportConfig {
            listen_addr: self.listen_addr,
            handshake: nop_handshake,
            on_peer: Some(on_peer),
            on_peer_drop: Some(on_peer_drop),
        })
    }

    async fn on_peer(&self, peer: TcpPeer) -> io::Result<()> {
        let remote = peer.remote_addr();
        let outbound = peer.is_outbound();
        self.peers.lock().await.insert(remote, Arc::new(peer));

        info!(
            "[{}] connected with remote: {} (outbound: {})",
            self.label(),
            remote,
            outbound
        );
        Ok(())
    }

    async fn on_peer_drop(&self, addr: SocketAddr) {
        if self.peers.lock().await.remove(&addr).is_some() {
            info!("[{}] removed peer: {}", self.label(), addr);
        }
    }

    async fn handle_rpc(&self, rpc: Rpc) {
        let msg = match Message::from_payload(&rpc.payload) {
            Ok(msg) => msg,
            Err(e) => {
                error!(
                    "[{}] control frame decode error from {}: {}",
                    self.label(),
                    rpc.from,
                    e
                );
                return;
            }
        };

        let result = match msg {
            Message::StoreFile { id, key, size } => {
                self.handle_store_file(rpc.from, &id, &key, size).await
            }
            Message::GetFile { id, key } => self.handle_get_file(rpc.from, &id, &key).await,
        };

        if let Err(e) = result {
            error!(
                "[{}] message handler error from {}: {}",
                self.label(),
                rpc.from,
                e
            );
        }
    }

    async fn handle_store_file(
        &self,
        from: SocketAddr,
        id: &str,
        key: &str,
        size: u64,
    ) -> Result<(), ServerError> {
        let peer = self.peer(from).await?;

        if timeout(REPLICA_STREAM_WAIT, peer.wait_stream()).await.is_err() {
            return Err(ServerError::StreamTimeout(from));
        }

        // the ciphertext is persisted as-is; decryption happens on the get path
        let reader = peer.stream_reader().await;
        let mut src = reader.take(size);
        let result = self.storage.write(id, key, &mut src).await;
        drop(src);
        peer.close_stream();
        let n = result?;

        info!("[{}] written {} bytes to disk", self.label(), n);
        Ok(())
    }

    async fn handle_get_file(
        &self,
        from: SocketAddr,
        id: &str,
        key: &str,
    ) -> Result<(), ServerError> {
        if !self.storage.has(id, key).await {
            return Err(ServerError::NotOnDisk(key.to_string()));
        }

        info!("[{}] serving file ({}) over the network", self.label(), key);

        let (size, mut file) = self.storage.read(id, key).await?;
        let peer = self.peer(from).await?;
        let n = peer.send_stream(size, &mut file).await?;

        info!(
            "[{}] written {} bytes over the network to {}",
            self.label(),
            n,
            from
        );
        Ok(())
    }

    async fn broadcast(&self, msg: &Message) -> Result<(), ServerError> {
        let frame = msg.to_frame()?;

        for peer in self.peer_snapshot().await {
            if let Err(e) = peer.send(&frame).await {
                error!(
                    "[{}] broadcast to {} failed: {}",
                    self.label(),
                    peer.remote_addr(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn peer(&self, addr: SocketAddr) -> Result<Arc<dyn Peer>, ServerError> {
        self.peers
            .lock()
            .await
            .get(&addr)
            .cloned()
            .ok_or(ServerError::UnknownPeer(addr))
    }

    async fn peer_snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers.lock().await.values().cloned().collect()
    }

    fn label(&self) -> SocketAddr {
        self.local_addr.get().copied().unwrap_or(self.listen_addr)
    }
}
