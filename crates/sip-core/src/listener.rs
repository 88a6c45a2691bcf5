//! Switch event listener task
//!
//! Binds the configured event address and turns each datagram into a
//! [`SwitchEvent`] on the engine's event channel. Malformed datagrams are
//! logged at WARN and dropped; nothing the switch sends can take the
//! listener down.

use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::events::{parse_event, SwitchEvent};

/// Configuration for the event listener socket
#[derive(Debug, Clone)]
pub struct EventListenerConfig {
    /// Address the switch sends event datagrams to
    pub bind_addr: SocketAddr,
    /// Datagram buffer size
    pub buffer_size: usize,
}

impl Default for EventListenerConfig {
    fn default() -> Self {
        Self { bind_addr: "0.0.0.0:8090".parse().expect("static addr"), buffer_size: 16384 }
    }
}

/// The UDP task feeding switch events into the engine
pub struct EventListener {
    socket: UdpSocket,
    config: EventListenerConfig,
    events_tx: mpsc::Sender<SwitchEvent>,
    stop: watch::Receiver<bool>,
}

impl EventListener {
    /// Bind the event socket
    pub async fn bind(
        config: EventListenerConfig,
        events_tx: mpsc::Sender<SwitchEvent>,
        stop: watch::Receiver<bool>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(config.bind_addr).await?;
        info!(addr = %config.bind_addr, "switch event listener bound");
        Ok(Self { socket, config, events_tx, stop })
    }

    /// Local address actually bound (useful with port 0 in tests)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Spawn the receive loop
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        let mut buf = vec![0u8; self.config.buffer_size];
        loop {
            let (len, src) = tokio::select! {
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "event socket receive failed");
                        continue;
                    }
                },
            };

            let datagram = match std::str::from_utf8(&buf[..len]) {
                Ok(s) => s,
                Err(_) => {
                    warn!(from = %src, len, "dropping non-UTF8 event datagram");
                    continue;
                }
            };

            match parse_event(datagram) {
                Ok(event) => {
                    debug!(from = %src, ?event, "switch event");
                    if let SwitchEvent::CallAnswered { call_id } = &event {
                        // Answered is informational; nothing downstream acts on it.
                        info!(call_id = %call_id, "call answered");
                        continue;
                    }
                    if self.events_tx.send(event).await.is_err() {
                        debug!("event channel closed, stopping listener");
                        break;
                    }
                }
                Err(e) => {
                    warn!(from = %src, error = %e, "dropping unparseable event datagram");
                }
            }
        }
        debug!("switch event listener finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start_listener() -> (SocketAddr, mpsc::Receiver<SwitchEvent>, watch::Sender<bool>) {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (stop_tx, stop_rx) = watch::channel(false);
        let config = EventListenerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        let listener = EventListener::bind(config, events_tx, stop_rx).await.unwrap();
        let addr = listener.local_addr().unwrap();
        listener.spawn();
        (addr, events_rx, stop_tx)
    }

    #[tokio::test]
    async fn delivers_parsed_events() {
        let (addr, mut events_rx, _stop_tx) = start_listener().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(br#"{"event_type":"E_CALL_SETUP","call_id":"t1","sdp":"v=0"}"#, addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SwitchEvent::CallStart { ref call_id, .. } if call_id == "t1"));
    }

    #[tokio::test]
    async fn survives_garbage_between_events() {
        let (addr, mut events_rx, _stop_tx) = start_listener().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender.send_to(&[0xFF, 0xFE, 0x00], addr).await.unwrap();
        sender.send_to(b"complete nonsense", addr).await.unwrap();
        sender
            .send_to(b"Event=E_CALL_TERMINATED\ncallid=t2\n", addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SwitchEvent::CallEnd { call_id: "t2".into(), reason: None });
    }

    #[tokio::test]
    async fn answered_events_are_not_forwarded() {
        let (addr, mut events_rx, _stop_tx) = start_listener().await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        sender
            .send_to(br#"{"Event":"E_CALL_ANSWERED","call_id":"t3"}"#, addr)
            .await
            .unwrap();
        sender
            .send_to(br#"{"Event":"E_CALL_TERMINATED","call_id":"t3"}"#, addr)
            .await
            .unwrap();

        // Only the terminate comes through; answered is logged and swallowed
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, SwitchEvent::CallEnd { .. }));
    }
}
