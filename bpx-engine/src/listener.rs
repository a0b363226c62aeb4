//! Socket pairing.
//!
//! Each side both dials the peer and accepts from it; the first header on
//! every fresh socket declares whether it is the data or the meta socket.
//! Listeners are shared between connections that bind the same local
//! address, and accepted sockets are dispatched to the connection whose
//! peer address matches. Crossed initial packets (both sides dialed the
//! same role at once) are resolved by dropping the newer socket and
//! retrying after a coin flip, which is what eventually breaks the tie.

use bpx_core::{PlexError, Result};
use bpx_wire::{decode_header, encode_header, header_size, Command};
use rand::Rng;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// First-packet protocol dialect, before any negotiation.
const SETUP_VERSION: u32 = bpx_wire::PROTOCOL_MIN;

pub struct SocketPair {
    pub data: TcpStream,
    pub meta: TcpStream,
    /// This side received INITIAL_META last and owns conflict tie-breaks.
    pub resolve_conflicts: bool,
}

struct SharedListener {
    waiters: Arc<Mutex<HashMap<IpAddr, mpsc::UnboundedSender<TcpStream>>>>,
    accept_task: tokio::task::JoinHandle<()>,
    refs: usize,
}

impl Drop for SharedListener {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

/// Listeners keyed by local bind address, shared among connections that
/// differ only by peer address.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: Mutex<HashMap<SocketAddr, SharedListener>>,
}

/// One connection's slot on a shared listener. Dropping it releases the
/// listener once the last waiter is gone.
#[derive(Debug)]
pub struct Waiter {
    registry: Arc<ListenerRegistry>,
    bind: SocketAddr,
    peer_ip: IpAddr,
    rx: mpsc::UnboundedReceiver<TcpStream>,
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.registry.release(self.bind, self.peer_ip);
    }
}

impl ListenerRegistry {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register interest in accepts from `peer` on `bind`, creating the
    /// shared listener on first use.
    pub async fn register(self: &Arc<Self>, bind: SocketAddr, peer: SocketAddr) -> Result<Waiter> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(shared) = listeners.get_mut(&bind) {
                let mut waiters = shared.waiters.lock().unwrap_or_else(|e| e.into_inner());
                if waiters.contains_key(&peer.ip()) {
                    return Err(PlexError::Config(format!(
                        "peer {peer} already has a connection on {bind}"
                    )));
                }
                waiters.insert(peer.ip(), tx);
                shared.refs += 1;
                return Ok(Waiter {
                    registry: self.clone(),
                    bind,
                    peer_ip: peer.ip(),
                    rx,
                });
            }
        }

        let listener = TcpListener::bind(bind).await?;
        let waiters: Arc<Mutex<HashMap<IpAddr, mpsc::UnboundedSender<TcpStream>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.ip(), tx);

        let accept_waiters = waiters.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        let target = accept_waiters
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .get(&from.ip())
                            .cloned();
                        match target {
                            Some(tx) => {
                                if tx.send(stream).is_err() {
                                    debug!(target: "bpx::listen", %from, "waiter gone, dropping accepted socket");
                                }
                            }
                            None => {
                                warn!(target: "bpx::listen", %from, "rejecting connection from unknown peer");
                            }
                        }
                    }
                    Err(e) => {
                        warn!(target: "bpx::listen", error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.insert(
            bind,
            SharedListener {
                waiters,
                accept_task,
                refs: 1,
            },
        );
        Ok(Waiter {
            registry: self.clone(),
            bind,
            peer_ip: peer.ip(),
            rx,
        })
    }

    fn release(&self, bind: SocketAddr, peer_ip: IpAddr) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(shared) = listeners.get_mut(&bind) {
            shared
                .waiters
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&peer_ip);
            shared.refs -= 1;
            if shared.refs == 0 {
                listeners.remove(&bind);
            }
        }
    }
}

async fn send_first_packet(stream: &mut TcpStream, cmd: Command) -> Result<()> {
    let header = encode_header(cmd, 0, 0, SETUP_VERSION);
    stream.write_all(&header).await?;
    stream.flush().await?;
    Ok(())
}

async fn receive_first_packet(stream: &mut TcpStream) -> Result<Command> {
    let mut buf = vec![0u8; header_size(SETUP_VERSION)];
    stream.read_exact(&mut buf).await?;
    let pi = decode_header(&buf, SETUP_VERSION)?;
    Ok(pi.cmd)
}

/// Non-destructive liveness probe: peek without consuming. Pending data
/// and not-ready both mean alive; EOF or an error frees the socket.
async fn socket_okay(sock: &mut Option<TcpStream>) -> bool {
    let Some(s) = sock.as_ref() else { return false };
    let mut probe = [0u8; 4];
    match tokio::time::timeout(Duration::from_millis(1), s.peek(&mut probe)).await {
        Ok(Ok(0)) | Ok(Err(_)) => {
            *sock = None;
            false
        }
        Ok(Ok(_)) | Err(_) => true,
    }
}

async fn try_connect(peer: SocketAddr, timeout: Duration) -> Option<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(peer)).await {
        Ok(Ok(s)) => {
            let _ = s.set_nodelay(true);
            Some(s)
        }
        Ok(Err(e)) => {
            debug!(target: "bpx::listen", error = %e, "outbound connect failed");
            None
        }
        Err(_) => None,
    }
}

/// Build the ordered data + meta socket pair with the peer.
///
/// Transient failures keep looping until `deadline`; a pairing is done
/// when both roles are bound and both sockets still pass the liveness
/// check.
pub async fn establish_pair(
    waiter: &mut Waiter,
    peer: SocketAddr,
    connect_timeout: Duration,
    deadline: std::time::Instant,
) -> Result<SocketPair> {
    let mut sock: Option<TcpStream> = None;
    let mut msock: Option<TcpStream> = None;
    let mut resolve_conflicts = false;
    // After a crossed initial packet, a coin flip sends us straight back
    // to the accept wait instead of settling; this breaks the livelock of
    // two sides dialing the same role in lockstep.
    let mut force_wait = false;

    loop {
        if std::time::Instant::now() > deadline {
            return Err(PlexError::NetworkTransient(
                "could not establish the socket pair in time".into(),
            ));
        }

        if !force_wait {
            if sock.is_none() || msock.is_none() {
                if let Some(mut s) = try_connect(peer, connect_timeout).await {
                    if sock.is_none() {
                        send_first_packet(&mut s, Command::InitialData).await?;
                        sock = Some(s);
                    } else if msock.is_none() {
                        resolve_conflicts = false;
                        send_first_packet(&mut s, Command::InitialMeta).await?;
                        msock = Some(s);
                    }
                }
            }

            if sock.is_some() && msock.is_some() {
                if socket_okay(&mut sock).await && socket_okay(&mut msock).await {
                    break;
                }
                continue;
            }
        }
        force_wait = false;

        // Give the peer a chance to dial us for the missing role.
        match tokio::time::timeout(connect_timeout, waiter.rx.recv()).await {
            Ok(Some(mut accepted)) => {
                let _ = accepted.set_nodelay(true);
                match receive_first_packet(&mut accepted).await {
                    Ok(Command::InitialData) => {
                        if sock.is_some() {
                            warn!(target: "bpx::listen", "initial data packet crossed");
                            force_wait = rand::thread_rng().gen::<bool>();
                        }
                        sock = Some(accepted);
                    }
                    Ok(Command::InitialMeta) => {
                        resolve_conflicts = true;
                        if msock.is_some() {
                            warn!(target: "bpx::listen", "initial meta packet crossed");
                            force_wait = rand::thread_rng().gen::<bool>();
                        }
                        msock = Some(accepted);
                    }
                    Ok(other) => {
                        warn!(target: "bpx::listen", cmd = %other, "error receiving initial packet");
                        force_wait = rand::thread_rng().gen::<bool>();
                    }
                    Err(e) => {
                        debug!(target: "bpx::listen", error = %e, "broken socket during pairing");
                    }
                }
            }
            Ok(None) => {
                return Err(PlexError::NetworkFatal("listener closed".into()));
            }
            Err(_) => {}
        }
    }

    let (Some(data), Some(meta)) = (sock, msock) else {
        return Err(PlexError::NetworkTransient("pairing fell apart".into()));
    };
    info!(
        target: "bpx::listen",
        %peer,
        resolve_conflicts,
        "socket pair established"
    );
    Ok(SocketPair {
        data,
        meta,
        resolve_conflicts,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_rejects_duplicate_peer() {
        let registry = ListenerRegistry::new();
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        // Bind to an ephemeral port, then reuse the actual address.
        let probe = TcpListener::bind(bind).await.unwrap();
        let bound = probe.local_addr().unwrap();
        drop(probe);

        let peer: SocketAddr = "127.0.0.2:7000".parse().unwrap();
        let w1 = registry.register(bound, peer).await.unwrap();
        let err = registry.register(bound, peer).await.unwrap_err();
        assert!(matches!(err, PlexError::Config(_)));
        drop(w1);

        // After the waiter is gone, the peer slot is free again.
        let w2 = registry.register(bound, peer).await.unwrap();
        drop(w2);
    }

    #[tokio::test]
    async fn test_pairing_over_loopback() {
        // Two registries, each dialing the other, must end with one data
        // and one meta socket on both sides and exactly one side owning
        // conflict resolution.
        let reg_a = ListenerRegistry::new();
        let reg_b = ListenerRegistry::new();

        let bind_a: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let la = TcpListener::bind(bind_a).await.unwrap();
        let addr_a = la.local_addr().unwrap();
        drop(la);
        let lb = TcpListener::bind(bind_a).await.unwrap();
        let addr_b = lb.local_addr().unwrap();
        drop(lb);

        let mut wa = reg_a.register(addr_a, addr_b).await.unwrap();
        let mut wb = reg_b.register(addr_b, addr_a).await.unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        let t = Duration::from_millis(250);
        let (ra, rb) = tokio::join!(
            establish_pair(&mut wa, addr_b, t, deadline),
            establish_pair(&mut wb, addr_a, t, deadline),
        );
        let pa = ra.unwrap();
        let pb = rb.unwrap();
        assert_ne!(pa.resolve_conflicts, pb.resolve_conflicts);
    }
}
