//! Process-wide RTP port pool
//!
//! Every call binds one UDP socket out of a configured port range. The pool
//! tracks which ports are free; a port is in the pool exactly when no live
//! call owns it. Allocation walks the free set until a bind succeeds, so
//! ports grabbed by other processes are skipped (and returned to the set for
//! a later retry).

use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Configuration for the RTP port range
#[derive(Debug, Clone)]
pub struct PortPoolConfig {
    /// Lowest usable RTP port
    pub min_port: u16,
    /// Highest usable RTP port (inclusive)
    pub max_port: u16,
}

impl Default for PortPoolConfig {
    fn default() -> Self {
        Self { min_port: 35000, max_port: 65000 }
    }
}

/// The shared pool of free RTP ports
#[derive(Debug, Clone)]
pub struct PortPool {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    available: Mutex<BTreeSet<u16>>,
    min_port: u16,
    max_port: u16,
}

/// A bound RTP socket together with the pool slot it occupies.
///
/// Dropping the binding without calling [`PortPool::release`] leaks the pool
/// slot, so the call teardown path must release explicitly.
#[derive(Debug)]
pub struct BoundPort {
    /// The bound UDP socket
    pub socket: Arc<UdpSocket>,
    /// The local port the socket is bound to
    pub port: u16,
}

impl PortPool {
    /// Create a pool covering `[min_port, max_port]`
    pub fn new(config: PortPoolConfig) -> Self {
        let available: BTreeSet<u16> = (config.min_port..=config.max_port).collect();
        info!(
            min_port = config.min_port,
            max_port = config.max_port,
            size = available.len(),
            "RTP port pool initialized"
        );
        Self {
            inner: Arc::new(Inner {
                available: Mutex::new(available),
                min_port: config.min_port,
                max_port: config.max_port,
            }),
        }
    }

    /// Bind a UDP socket on the first free port that accepts the bind.
    ///
    /// The chosen port is removed from the pool. Ports where the bind fails
    /// (taken by another process) are skipped but kept out of the pool only
    /// for this attempt.
    pub fn acquire(&self, bind_ip: IpAddr) -> Result<BoundPort> {
        loop {
            let candidate = {
                let mut available = self.inner.available.lock();
                match available.iter().next().copied() {
                    Some(port) => {
                        available.remove(&port);
                        port
                    }
                    None => {
                        return Err(Error::NoAvailablePorts {
                            min: self.inner.min_port,
                            max: self.inner.max_port,
                        })
                    }
                }
            };

            match std::net::UdpSocket::bind(SocketAddr::new(bind_ip, candidate)) {
                Ok(socket) => {
                    socket.set_nonblocking(true)?;
                    let socket = UdpSocket::from_std(socket)?;
                    debug!(port = candidate, "bound RTP port");
                    return Ok(BoundPort { socket: Arc::new(socket), port: candidate });
                }
                Err(e) => {
                    // Something outside the pool holds this port; try the next
                    // one and let release() reclaim it later.
                    debug!(port = candidate, error = %e, "RTP port bind failed, trying next");
                }
            }
        }
    }

    /// Return a port to the pool
    pub fn release(&self, port: u16) {
        if port < self.inner.min_port || port > self.inner.max_port {
            return;
        }
        let mut available = self.inner.available.lock();
        if !available.insert(port) {
            debug!(port, "port released twice, ignoring");
        }
    }

    /// Number of free ports
    pub fn available(&self) -> usize {
        self.inner.available.lock().len()
    }
}
