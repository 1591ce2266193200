//! LAN peer discovery over UDP multicast.
//!
//! Every instance periodically multicasts `LINKNET_DISCOVERY:<port>` and
//! listens for the same beacon from others. Discovery only reports `(ip,
//! port)` hints through a callback; whether to dial is the owner's policy.
//! Peers that stay silent past the timeout are forgotten, so a later beacon
//! from them fires the callback again.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use socket2::Domain;
use socket2::Protocol;
use socket2::Socket;
use socket2::Type;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

/// Multicast group every instance joins.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 0, 1);

/// UDP port the discovery beacons use.
pub const MULTICAST_PORT: u16 = 30001;

const DISCOVERY_PREFIX: &str = "LINKNET_DISCOVERY";
const BEACON_INTERVAL_IN_SECONDS: u64 = 5;
const PEER_TIMEOUT_IN_SECONDS: u64 = 30;

/// Inbound beacons are tiny; anything larger is not ours.
const MAX_DATAGRAM_LENGTH: usize = 256;

/// Invoked once per newly sighted `(ip, port)` pair.
pub type PeerDiscoveredCallback = Arc<dyn Fn(IpAddr, u16) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery is already running")]
    AlreadyRunning,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunables, overridable in tests. The defaults are the protocol values.
#[derive(Clone, Debug)]
pub struct DiscoveryConfig {
    pub multicast_group: Ipv4Addr,
    pub multicast_port: u16,
    pub beacon_interval: Duration,
    pub peer_timeout: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            multicast_group: MULTICAST_GROUP,
            multicast_port: MULTICAST_PORT,
            beacon_interval: Duration::from_secs(BEACON_INTERVAL_IN_SECONDS),
            peer_timeout: Duration::from_secs(PEER_TIMEOUT_IN_SECONDS),
        }
    }
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    running: AtomicBool,
    local_port: AtomicU16,
    /// `"<ip>:<port>"` of every live peer mapped to when it was last heard.
    peers: Mutex<HashMap<String, Instant>>,
    discovered_callback: Mutex<Option<PeerDiscoveredCallback>>,
    shutdown: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to the discovery state.
#[derive(Clone)]
pub struct PeerDiscovery {
    inner: Arc<DiscoveryInner>,
}

impl Default for PeerDiscovery {
    fn default() -> Self {
        Self::new(DiscoveryConfig::default())
    }
}

impl PeerDiscovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                running: AtomicBool::new(false),
                local_port: AtomicU16::new(0),
                peers: Mutex::new(HashMap::new()),
                discovered_callback: Mutex::new(None),
                shutdown: Notify::new(),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn set_discovered_callback(&self, callback: PeerDiscoveredCallback) {
        *self.inner.discovered_callback.lock().unwrap() = Some(callback);
    }

    /// Currently known peers as `"<ip>:<port>"` keys.
    pub fn known_peers(&self) -> Vec<String> {
        self.inner.peers.lock().unwrap().keys().cloned().collect()
    }

    /// Join the multicast group and start the beacon and listen loops.
    /// `local_port` is the TCP port announced in our beacons; beacons
    /// declaring the same port are treated as self-echo and dropped.
    pub fn start(&self, local_port: u16) -> Result<(), DiscoveryError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(DiscoveryError::AlreadyRunning);
        }
        self.inner.local_port.store(local_port, Ordering::SeqCst);

        let (listen_socket, beacon_socket) = match self.open_sockets() {
            Ok(sockets) => sockets,
            Err(e) => {
                self.inner.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        let listener = self.clone();
        let listen_task = tokio::spawn(async move {
            listener.run_listen_loop(listen_socket).await;
        });
        let beaconer = self.clone();
        let beacon_task = tokio::spawn(async move {
            beaconer.run_beacon_loop(beacon_socket).await;
        });
        *self.inner.tasks.lock().unwrap() = vec![listen_task, beacon_task];

        info!(
            "peer discovery started, announcing port {local_port} to {}:{}",
            self.inner.config.multicast_group, self.inner.config.multicast_port
        );
        Ok(())
    }

    /// Stop both loops and join them. Idempotent.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.notify_waiters();
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("peer discovery stopped");
    }

    /// Listen socket: bound to the multicast port with address reuse so
    /// several local processes can coexist, joined to the group on all
    /// interfaces. Beacon socket: plain ephemeral UDP, TTL 1 keeps beacons
    /// on the local subnet.
    fn open_sockets(&self) -> std::io::Result<(UdpSocket, UdpSocket)> {
        let config = &self.inner.config;

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.multicast_port));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&config.multicast_group, &Ipv4Addr::UNSPECIFIED)?;
        socket.set_nonblocking(true)?;
        let listen_socket = UdpSocket::from_std(socket.into())?;

        let beacon_socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        beacon_socket.set_nonblocking(true)?;
        let beacon_socket = UdpSocket::from_std(beacon_socket)?;
        beacon_socket.set_multicast_ttl_v4(1)?;

        Ok((listen_socket, beacon_socket))
    }

    async fn run_beacon_loop(self, socket: UdpSocket) {
        let config = self.inner.config.clone();
        let local_port = self.inner.local_port.load(Ordering::SeqCst);
        let beacon = format!("{DISCOVERY_PREFIX}:{local_port}");
        let destination = SocketAddr::from((config.multicast_group, config.multicast_port));

        'outer: while self.is_running() {
            if let Err(e) = socket.send_to(beacon.as_bytes(), destination).await {
                warn!("failed to send discovery beacon: {e}");
            }

            // Sleep the interval in one-second ticks so stop() is prompt.
            let ticks = config.beacon_interval.as_secs().max(1);
            for _ in 0..ticks {
                if !self.is_running() {
                    break 'outer;
                }
                tokio::select! {
                    _ = self.inner.shutdown.notified() => break 'outer,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }

            self.evict_expired(Instant::now());
        }
        debug!("discovery beacon loop terminated");
    }

    async fn run_listen_loop(self, socket: UdpSocket) {
        let mut buf = [0u8; MAX_DATAGRAM_LENGTH];
        while self.is_running() {
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                // Re-check the running flag at least once a second in case
                // the shutdown notification raced past us.
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                result = socket.recv_from(&mut buf) => match result {
                    Ok((received, from)) => self.handle_packet(&buf[..received], from.ip()),
                    Err(e) => {
                        if self.is_running() {
                            warn!("failed to receive discovery packet: {e}");
                        }
                        break;
                    }
                },
            }
        }
        debug!("discovery listen loop terminated");
    }

    /// Parse one inbound datagram and update the peer table. First sighting
    /// of an `"<ip>:<port>"` key fires the discovered callback; later ones
    /// only refresh the timestamp.
    fn handle_packet(&self, payload: &[u8], sender_ip: IpAddr) {
        let Some(port) = parse_beacon(payload) else {
            return;
        };

        if port == self.inner.local_port.load(Ordering::SeqCst) {
            // Same announced port means it is our own beacon echoed back.
            trace!("ignoring own discovery beacon from {sender_ip}:{port}");
            return;
        }

        let key = format!("{sender_ip}:{port}");
        let is_new = {
            let mut peers = self.inner.peers.lock().unwrap();
            peers.insert(key.clone(), Instant::now()).is_none()
        };

        if is_new {
            info!("discovered peer at {key}");
            let callback = self.inner.discovered_callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(sender_ip, port);
            }
        }
    }

    /// Drop peers not heard from within the timeout. Runs every beacon tick.
    fn evict_expired(&self, now: Instant) {
        let timeout = self.inner.config.peer_timeout;
        let mut peers = self.inner.peers.lock().unwrap();
        peers.retain(|key, last_seen| {
            let alive = now.duration_since(*last_seen) <= timeout;
            if !alive {
                info!("discovery peer {key} expired");
            }
            alive
        });
    }
}

/// Extract the announced TCP port from a `LINKNET_DISCOVERY:<port>` payload.
fn parse_beacon(payload: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(payload).ok()?;
    let port_text = text.strip_prefix(DISCOVERY_PREFIX)?.strip_prefix(':')?;
    port_text.trim().parse().ok()
}
