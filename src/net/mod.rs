//! TCP transport: frames are JSON, each prefixed with its length as a
//! big-endian `u32`.
//!
//! Every node listens on one address and dials peers lazily. One writer task
//! per peer keeps frames to that peer in send order; a writer that loses its
//! connection drops queued frames, which the correlation channel reports as
//! timeouts.

use crate::channel::fabric::Transport;
use crate::channel::wire::Frame;
use crate::error::TransportError;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(payload.len()));
    }
    writer
        .write_all(&(payload.len() as u32).to_be_bytes())
        .await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Frame>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

pub struct TcpTransport {
    address: String,
    inbox: mpsc::UnboundedSender<Frame>,
    peers: Mutex<HashMap<String, mpsc::UnboundedSender<Frame>>>,
}

pub struct TcpTransportHandle {
    local_addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl TcpTransportHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl TcpTransport {
    /// Listens on `bind`. The transport's address is the bound socket
    /// address, so binding port 0 yields a usable ephemeral address.
    pub async fn bind(
        bind: SocketAddr,
    ) -> Result<
        (
            Arc<Self>,
            mpsc::UnboundedReceiver<Frame>,
            TcpTransportHandle,
        ),
        TransportError,
    > {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let (inbox_tx, inbox) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            address: local_addr.to_string(),
            inbox: inbox_tx.clone(),
            peers: Mutex::new(HashMap::new()),
        });
        info!("event=tcp_transport_listen addr={}", local_addr);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut readers: Vec<JoinHandle<()>> = Vec::new();
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    accept = listener.accept() => match accept {
                        Ok((stream, peer)) => {
                            readers.retain(|reader| !reader.is_finished());
                            readers.push(tokio::spawn(read_connection(stream, peer, inbox_tx.clone())));
                        }
                        Err(err) => {
                            warn!("event=tcp_accept_error addr={} error={}", local_addr, err);
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    },
                }
            }
            for reader in readers {
                reader.abort();
            }
            info!("event=tcp_transport_stopped addr={}", local_addr);
        });
        Ok((
            transport,
            inbox,
            TcpTransportHandle {
                local_addr,
                shutdown: Some(shutdown_tx),
                join: Some(join),
            },
        ))
    }

    fn writer(&self, peer: &str) -> mpsc::UnboundedSender<Frame> {
        let mut peers = self.peers.lock();
        if let Some(writer) = peers.get(peer) {
            if !writer.is_closed() {
                return writer.clone();
            }
        }
        let (writer, frames) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(peer.to_string(), frames));
        peers.insert(peer.to_string(), writer.clone());
        writer
    }
}

impl Transport for TcpTransport {
    fn local_address(&self) -> &str {
        &self.address
    }

    fn send(&self, to: &str, frame: Frame) -> Result<(), TransportError> {
        if to == self.address {
            return self
                .inbox
                .send(frame)
                .map_err(|_| TransportError::Closed(to.to_string()));
        }
        match self.writer(to).send(frame) {
            Ok(()) => Ok(()),
            // The writer died between lookup and send; dial again once.
            Err(mpsc::error::SendError(frame)) => self
                .writer(to)
                .send(frame)
                .map_err(|_| TransportError::Closed(to.to_string())),
        }
    }
}

async fn run_writer(peer: String, mut frames: mpsc::UnboundedReceiver<Frame>) {
    let mut stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&peer)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => {
            warn!("event=tcp_connect_failed peer={} error={}", peer, err);
            return;
        }
        Err(_) => {
            warn!(
                "event=tcp_connect_timeout peer={} timeout_ms={}",
                peer,
                CONNECT_TIMEOUT.as_millis()
            );
            return;
        }
    };
    if let Err(err) = stream.set_nodelay(true) {
        debug!("event=tcp_nodelay_failed peer={} error={}", peer, err);
    }
    debug!("event=tcp_peer_connected peer={}", peer);
    while let Some(frame) = frames.recv().await {
        if let Err(err) = write_frame(&mut stream, &frame).await {
            warn!("event=tcp_write_failed peer={} error={}", peer, err);
            return;
        }
    }
}

async fn read_connection(mut stream: TcpStream, peer: SocketAddr, inbox: mpsc::UnboundedSender<Frame>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Some(frame)) => {
                if inbox.send(frame).is_err() {
                    return;
                }
            }
            Ok(None) => {
                debug!("event=tcp_connection_closed peer={}", peer);
                return;
            }
            Err(err) => {
                warn!("event=tcp_read_failed peer={} error={}", peer, err);
                return;
            }
        }
    }
}
