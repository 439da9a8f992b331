//! Sockets: one node/domain UDP socket and one heartbeat UDP socket per
//! messaging interface, plus the local control and notify datagram sockets.
//!
//! Receive loops only forward raw bytes or parsed requests to the engine;
//! authentication and sequencing happen there.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use avail_core::{AvailConfig, InterfaceKind};
use avail_msg::{parse_auth_key, ControlRequest, NotifyEvent};
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, Output};

const MAX_DATAGRAM: usize = 8192;

struct Link {
    name: String,
    kind: InterfaceKind,
    key: Vec<u8>,
    messages: Arc<UdpSocket>,
    heartbeats: Arc<UdpSocket>,
    peer_messages: SocketAddr,
    peer_heartbeats: SocketAddr,
}

pub struct Transport {
    links: Vec<Link>,
    control: Arc<UnixDatagram>,
    control_client: PathBuf,
}

impl Transport {
    /// Bind every socket and start the receive loops.
    pub async fn bind(
        config: &AvailConfig,
        events: mpsc::UnboundedSender<EngineEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let mut links = Vec::new();
        for iface in &config.messaging.interfaces {
            let bind: IpAddr = iface
                .bind
                .parse()
                .with_context(|| format!("interface {}: bad bind address '{}'", iface.name, iface.bind))?;
            let peer: IpAddr = iface
                .peer
                .parse()
                .with_context(|| format!("interface {}: bad peer address '{}'", iface.name, iface.peer))?;

            let messages = Arc::new(
                UdpSocket::bind(SocketAddr::new(bind, config.messaging.port))
                    .await
                    .with_context(|| format!("binding {} messaging socket", iface.name))?,
            );
            let heartbeats = Arc::new(
                UdpSocket::bind(SocketAddr::new(bind, config.heartbeat.port))
                    .await
                    .with_context(|| format!("binding {} heartbeat socket", iface.name))?,
            );
            info!(interface = %iface.name, kind = %iface.kind, %bind, %peer, "messaging interface bound");

            spawn_udp_loop(iface.name.clone(), Arc::clone(&messages), events.clone(), shutdown.clone(), false);
            spawn_udp_loop(iface.name.clone(), Arc::clone(&heartbeats), events.clone(), shutdown.clone(), true);

            links.push(Link {
                name: iface.name.clone(),
                kind: iface.kind,
                key: parse_auth_key(&iface.auth_key)?,
                messages,
                heartbeats,
                peer_messages: SocketAddr::new(peer, config.messaging.port),
                peer_heartbeats: SocketAddr::new(peer, config.heartbeat.port),
            });
        }

        let control = Arc::new(bind_unix(&config.paths.control_socket)?);
        spawn_control_loop(Arc::clone(&control), events.clone(), shutdown.clone());
        let notify = bind_unix(&config.paths.notify_socket)?;
        spawn_notify_loop(notify, events, shutdown);

        Ok(Self {
            links,
            control,
            control_client: config.paths.control_client_socket.clone(),
        })
    }

    /// Interface kinds with a bound socket pair.
    pub fn kinds(&self) -> Vec<InterfaceKind> {
        let mut kinds: Vec<InterfaceKind> = self.links.iter().map(|l| l.kind).collect();
        kinds.sort();
        kinds.dedup();
        kinds
    }

    pub async fn send(&self, outputs: Vec<Output>) {
        for output in outputs {
            match output {
                Output::Peer { to, envelope } => {
                    for link in &self.links {
                        let bytes = match avail_msg::encode(&envelope, &link.key) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(interface = %link.name, error = %e, "encode failed");
                                continue;
                            }
                        };
                        if let Err(e) = link.messages.send_to(&bytes, link.peer_messages).await {
                            debug!(interface = %link.name, to = ?to, error = %e, "message send failed");
                        }
                    }
                }
                Output::Heartbeat(msg) => {
                    for link in &self.links {
                        let bytes = match msg.encode(&link.key) {
                            Ok(bytes) => bytes,
                            Err(e) => {
                                warn!(interface = %link.name, error = %e, "heartbeat encode failed");
                                continue;
                            }
                        };
                        if let Err(e) = link.heartbeats.send_to(&bytes, link.peer_heartbeats).await {
                            debug!(interface = %link.name, error = %e, "heartbeat send failed");
                        }
                    }
                }
                Output::ControlReply(reply) => {
                    let text = reply.to_string();
                    if let Err(e) = self.control.send_to(text.as_bytes(), &self.control_client).await {
                        debug!(path = ?self.control_client, error = %e, "control reply not delivered");
                    }
                }
            }
        }
    }
}

/// Bind a datagram socket at `path`, replacing a stale socket file.
fn bind_unix(path: &Path) -> anyhow::Result<UnixDatagram> {
    if path.exists() {
        std::fs::remove_file(path).with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let socket = UnixDatagram::bind(path).with_context(|| format!("binding {}", path.display()))?;
    info!(path = %path.display(), "local socket bound");
    Ok(socket)
}

fn spawn_udp_loop(
    interface: String,
    socket: Arc<UdpSocket>,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
    heartbeat: bool,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        let bytes = buf[..len].to_vec();
                        let event = if heartbeat {
                            EngineEvent::Heartbeat { interface: interface.clone(), bytes }
                        } else {
                            EngineEvent::Datagram { interface: interface.clone(), bytes }
                        };
                        if events.send(event).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%interface, error = %e, "receive failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
        debug!(%interface, heartbeat, "receive loop stopped");
    });
}

fn spawn_control_loop(
    socket: Arc<UnixDatagram>,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        let text = String::from_utf8_lossy(&buf[..len]);
                        match ControlRequest::parse(&text) {
                            Ok(request) => {
                                if events.send(EngineEvent::Control(request)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, request = %text, "bad control request"),
                        }
                    }
                    Err(e) => warn!(error = %e, "control receive failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
    });
}

fn spawn_notify_loop(
    socket: UnixDatagram,
    events: mpsc::UnboundedSender<EngineEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                received = socket.recv(&mut buf) => match received {
                    Ok(len) => {
                        let text = String::from_utf8_lossy(&buf[..len]);
                        match NotifyEvent::parse(&text) {
                            Ok(notify) => {
                                if events.send(EngineEvent::Notify(notify)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, message = %text, "bad notify message"),
                        }
                    }
                    Err(e) => warn!(error = %e, "notify receive failed"),
                },
                _ = shutdown.changed() => break,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use avail_msg::SetNode;
    use avail_core::{AdminState, AvailStatus, NodeSetAction, OperState};

    use super::*;

    fn config(dir: &Path) -> AvailConfig {
        let mut config = AvailConfig::scaffold("controller-0");
        config.paths.control_socket = dir.join("server.sock");
        config.paths.control_client_socket = dir.join("client.sock");
        config.paths.notify_socket = dir.join("notify.sock");
        config
    }

    #[tokio::test]
    async fn control_requests_reach_the_engine_and_replies_return() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let transport = Transport::bind(&config, tx, shutdown_rx).await.unwrap();

        let client = UnixDatagram::bind(&config.paths.control_client_socket).unwrap();
        let set = SetNode {
            seqno: 1,
            origin: "test".into(),
            node: "controller-0".into(),
            action: NodeSetAction::Unlock,
            admin: AdminState::Unlocked,
            oper: OperState::Enabled,
            avail: AvailStatus::Available,
        };
        let request = ControlRequest::SetNode(set.clone());
        client
            .send_to(request.to_string().as_bytes(), &config.paths.control_socket)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, EngineEvent::Control(ref r) if *r == request));

        transport
            .send(vec![Output::ControlReply(ControlRequest::ack(&set))])
            .await;
        let mut buf = [0u8; 512];
        let len = tokio::time::timeout(Duration::from_secs(5), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let reply = ControlRequest::parse(std::str::from_utf8(&buf[..len]).unwrap()).unwrap();
        assert_eq!(reply, ControlRequest::SetNodeAck(set));
    }

    #[tokio::test]
    async fn malformed_notify_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let _transport = Transport::bind(&config, tx, shutdown_rx).await.unwrap();

        let client = UnixDatagram::unbound().unwrap();
        client
            .send_to(b"not a notify message", &config.paths.notify_socket)
            .await
            .unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(waited.is_err());
    }
}
