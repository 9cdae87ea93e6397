//! UDP host: one datagram per message, one `Handle` per remote socket address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use postwire_core::{
    encode_message, Handle, HandleId, Message, Peer, Transport, TransportError, Window,
    WindowError,
};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65507;
/// Addresses remembered at once; the least recently seen one goes first.
pub const DEFAULT_PEER_LIMIT: usize = 1024;

/// Origin the channel reports for datagrams from `addr`.
pub fn origin(addr: SocketAddr) -> String {
    format!("udp://{addr}")
}

/// A remote UDP peer seen as a window. Only liveness is meaningful.
#[derive(Debug)]
pub struct UdpWindow {
    addr: SocketAddr,
    closed: AtomicBool,
}

impl Window for UdpWindow {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop talking to this address. It gets a fresh handle if it writes again.
    fn close(&self) -> Result<(), WindowError> {
        debug!(addr = %self.addr, "closing udp peer");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn focus(&self) -> Result<(), WindowError> {
        Err(WindowError::Unsupported { operation: "focus" })
    }

    fn is_same_domain(&self) -> bool {
        false
    }

    fn assign_location(&self, _href: &str) -> Result<(), WindowError> {
        Err(WindowError::Unsupported {
            operation: "set location",
        })
    }

    fn set_name(&self, _name: &str) -> Result<(), WindowError> {
        Err(WindowError::Unsupported {
            operation: "set name",
        })
    }
}

struct Seen {
    handle: Handle,
    last_seen: Instant,
}

#[derive(Default)]
struct Peers {
    by_addr: HashMap<SocketAddr, Seen>,
    by_id: HashMap<HandleId, SocketAddr>,
}

impl Peers {
    fn forget(&mut self, addr: &SocketAddr) {
        if let Some(seen) = self.by_addr.remove(addr) {
            self.by_id.remove(&seen.handle.id());
        }
    }

    /// Drop closed handles, then close and drop the stalest ones until a new
    /// entry fits under `limit`.
    fn make_room(&mut self, limit: usize) {
        let closed: Vec<SocketAddr> = self
            .by_addr
            .iter()
            .filter(|(_, seen)| seen.handle.is_closed())
            .map(|(addr, _)| *addr)
            .collect();
        for addr in &closed {
            self.forget(addr);
        }
        while self.by_addr.len() >= limit.max(1) {
            let Some(stalest) = self
                .by_addr
                .iter()
                .min_by_key(|(_, seen)| seen.last_seen)
                .map(|(addr, _)| *addr)
            else {
                break;
            };
            if let Some(seen) = self.by_addr.get(&stalest) {
                let _ = seen.handle.window().close();
            }
            self.forget(&stalest);
        }
    }
}

pub struct UdpTransport {
    socket: UdpSocket,
    max_message_bytes: usize,
    peer_limit: usize,
    peers: Mutex<Peers>,
}

impl UdpTransport {
    pub fn new(socket: UdpSocket, max_message_bytes: usize) -> Self {
        Self {
            socket,
            max_message_bytes: max_message_bytes.min(MAX_DATAGRAM),
            peer_limit: DEFAULT_PEER_LIMIT,
            peers: Mutex::new(Peers::default()),
        }
    }

    pub fn with_peer_limit(mut self, limit: usize) -> Self {
        self.peer_limit = limit;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The handle for `addr`; the same one until its window is closed or it
    /// is evicted to make room for other addresses.
    pub fn handle_for(&self, addr: SocketAddr) -> Handle {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(seen) = peers.by_addr.get_mut(&addr) {
            if !seen.handle.is_closed() {
                seen.last_seen = now;
                return seen.handle.clone();
            }
        }
        peers.forget(&addr);
        peers.make_room(self.peer_limit);
        let handle = Handle::new(UdpWindow {
            addr,
            closed: AtomicBool::new(false),
        });
        peers.by_id.insert(handle.id(), addr);
        peers.by_addr.insert(
            addr,
            Seen {
                handle: handle.clone(),
                last_seen: now,
            },
        );
        handle
    }

    pub fn known_peers(&self) -> usize {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_addr
            .len()
    }

    fn addr_of(&self, handle: &Handle) -> Option<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&handle.id())
            .copied()
    }

    /// Receive datagrams forever, handing each to `peer` on its own task.
    pub async fn run(self: Arc<Self>, peer: Arc<Peer>) -> std::io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let source = self.handle_for(from);
            let bytes = buf[..n].to_vec();
            let peer = peer.clone();
            tokio::spawn(async move {
                let origin = origin(from);
                if let Err(err) = peer.receive_bytes(&source, &origin, &bytes).await {
                    warn!(%origin, error = %err, "inbound message failed");
                }
            });
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn send_message(
        &self,
        destination: &Handle,
        target_origin: &str,
        message: Message,
    ) -> Result<(), TransportError> {
        if destination.is_closed() {
            return Err(TransportError::Closed);
        }
        let addr = self
            .addr_of(destination)
            .ok_or_else(|| TransportError::Rejected("unknown destination".into()))?;
        if target_origin != "*" && target_origin != origin(addr) {
            debug!(%addr, target_origin, "destination origin differs, dropping");
            return Ok(());
        }
        let bytes = encode_message(&message, self.max_message_bytes)?;
        self.socket.send_to(&bytes, addr).await?;
        Ok(())
    }
}
