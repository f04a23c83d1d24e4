//! Shared handle over a framed peer connection

use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_net::{AsyncToSocketAddrs, TcpStream};
use futures::lock::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::framing::{read_packet, write_packet};
use crate::packet::Packet;

/// Cloneable handle over one TCP connection speaking framed packets.
///
/// Any number of tasks may `send` concurrently; writes are serialized by an
/// internal lock so frames never interleave. Exactly one task may drive
/// `recv`. Any I/O failure trips the connected flag, which the send path
/// checks before queueing work against a dead peer.
#[derive(Clone)]
pub struct Connection {
    stream: TcpStream,
    send_lock: Arc<Mutex<()>>,
    connected: Arc<AtomicBool>,
}

impl Connection {
    /// Wrap an accepted or connected stream.
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            send_lock: Arc::new(Mutex::new(())),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Open a connection to `addr`.
    pub async fn connect<A: AsyncToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::new(stream))
    }

    /// Send one packet, serialized against concurrent senders.
    pub async fn send(&self, packet: &Packet) -> Result<()> {
        let _guard = self.send_lock.lock().await;
        let mut stream = self.stream.clone();
        match write_packet(&mut stream, packet).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Receive the next packet. Single-reader: only the connection's driver
    /// task may call this.
    pub async fn recv(&self) -> Result<Packet> {
        let mut stream = self.stream.clone();
        match read_packet(&mut stream).await {
            Ok(packet) => Ok(packet),
            Err(err) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Whether the link has seen no I/O failure and has not been closed.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Shut the socket down in both directions.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Err(err) = self.stream.shutdown(Shutdown::Both) {
            debug!("shutdown on closed socket: {}", err);
        }
    }

    /// Remote address of the link.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Local address of the link.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.local_addr()?)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.stream.peer_addr().ok())
            .field("connected", &self.is_connected())
            .finish()
    }
}
