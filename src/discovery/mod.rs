pub mod model;

use std::{
    collections::{hash_map::Entry, HashMap},
    net::Ipv4Addr,
    sync::{Arc, RwLock},
    time::Duration,
};

use chrono::Utc;
use if_addrs::IfAddr;
use tokio::net::UdpSocket;

use crate::{
    config::ConfigStore,
    host::{EventBus, HostEvent},
    security::identity,
};
use model::{Os, Peer, PresencePacket, RouteState};

pub const DISCOVERY_PORT: u16 = 9988;

const BROADCAST_RATE: Duration = Duration::from_secs(1);
const SWEEP_RATE: Duration = Duration::from_secs(2);
const ROUTE_TIMEOUT_SECS: i64 = 2;
const MAX_PACKET_BYTES: usize = 1024;

#[derive(Default)]
struct PeerTable {
    peers: HashMap<String, Peer>,
    /// Trusted key recorded when a peer was flagged. A later announcement
    /// only clears the flag once the trust list entry has moved away from
    /// this value (the user re-trusted the peer).
    mismatch_baseline: HashMap<String, String>,
}

/// Presence service: signed UDP announcements out, peer table in. Three
/// independent loops share the table behind one read-write lock; events are
/// emitted after the lock is released.
pub struct Service {
    id: String,
    config: Arc<ConfigStore>,
    events: EventBus,
    /// Port of the transfer service, advertised in every announcement.
    port: u16,
    table: RwLock<PeerTable>,
}

impl Service {
    pub fn new(config: Arc<ConfigStore>, events: EventBus, port: u16) -> Arc<Self> {
        Arc::new(Self {
            id: config.id(),
            config,
            events,
            port,
            table: RwLock::new(PeerTable::default()),
        })
    }

    pub fn start(self: &Arc<Self>) {
        tokio::spawn(Arc::clone(self).run_broadcaster());
        tokio::spawn(Arc::clone(self).run_listener());
        tokio::spawn(Arc::clone(self).run_sweeper());
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn run_broadcaster(self: Arc<Self>) {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(socket) => socket,
            Err(err) => {
                log::error!("failed to bind broadcast socket: {err}");
                return;
            }
        };
        if let Err(err) = socket.set_broadcast(true) {
            log::error!("failed to enable udp broadcast: {err}");
            return;
        }

        let mut ticker = tokio::time::interval(BROADCAST_RATE);
        loop {
            ticker.tick().await;
            // Host name is re-read every tick so a rename shows up live.
            let packet = match self.build_packet() {
                Ok(packet) => packet,
                Err(err) => {
                    log::error!("failed to sign presence packet: {err}");
                    continue;
                }
            };
            let data = match serde_json::to_vec(&packet) {
                Ok(data) => data,
                Err(err) => {
                    log::error!("failed to encode presence packet: {err}");
                    continue;
                }
            };
            for addr in broadcast_addresses() {
                if let Err(err) = socket.send_to(&data, (addr, DISCOVERY_PORT)).await {
                    log::error!("failed to send presence packet to {addr}: {err}");
                }
            }
        }
    }

    fn build_packet(&self) -> Result<PresencePacket, identity::IdentityError> {
        let mut packet = PresencePacket {
            id: self.id.clone(),
            name: self.config.host_name(),
            port: self.port,
            os: Os::current(),
            public_key: self.config.public_key(),
            signature: String::new(),
        };
        packet.signature = identity::sign(&self.config.private_key(), &packet.signing_payload())?;
        Ok(packet)
    }

    async fn run_listener(self: Arc<Self>) {
        let socket = match UdpSocket::bind(("0.0.0.0", DISCOVERY_PORT)).await {
            Ok(socket) => socket,
            Err(err) => {
                log::error!("failed to bind discovery listener on :{DISCOVERY_PORT}: {err}");
                return;
            }
        };

        let mut buf = [0u8; MAX_PACKET_BYTES];
        loop {
            let (len, remote) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(_) => continue,
            };
            let Ok(packet) = serde_json::from_slice::<PresencePacket>(&buf[..len]) else {
                continue;
            };
            if packet.id == self.id {
                continue;
            }
            match identity::verify(&packet.public_key, &packet.signing_payload(), &packet.signature)
            {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    log::warn!(
                        "dropping presence packet with invalid signature from {}",
                        remote.ip()
                    );
                    continue;
                }
            }
            self.handle_announcement(packet, remote.ip().to_string());
        }
    }

    /// Trust check plus table update for one verified announcement.
    fn handle_announcement(&self, packet: PresencePacket, ip: String) {
        let mut trust_mismatch = false;
        if let Some(stored) = self.config.trusted_key(&packet.id) {
            if stored != packet.public_key {
                trust_mismatch = true;
                log::warn!(
                    "security: peer {} ({}) announced a public key that does not match the trust list",
                    packet.name,
                    packet.id
                );
            } else if let Ok(mut table) = self.table.write() {
                let retrusted = table
                    .mismatch_baseline
                    .get(&packet.id)
                    .is_some_and(|baseline| baseline != &stored);
                if retrusted {
                    table.mismatch_baseline.remove(&packet.id);
                    if let Some(peer) = table.peers.get_mut(&packet.id) {
                        peer.trust_mismatch = false;
                    }
                }
            }
        }
        self.apply_heartbeat(packet, ip, trust_mismatch);
    }

    fn apply_heartbeat(&self, packet: PresencePacket, ip: String, trust_mismatch: bool) {
        {
            let Ok(mut table) = self.table.write() else {
                return;
            };
            let now = Utc::now();
            if trust_mismatch {
                let stored = self.config.trusted_key(&packet.id).unwrap_or_default();
                table
                    .mismatch_baseline
                    .entry(packet.id.clone())
                    .or_insert(stored);
            }
            match table.peers.entry(packet.id.clone()) {
                Entry::Vacant(entry) => {
                    log::info!("new device found: {} at {}", packet.name, ip);
                    let mut routes = HashMap::new();
                    routes.insert(
                        ip.clone(),
                        RouteState { ip, last_seen: now },
                    );
                    entry.insert(Peer {
                        id: packet.id,
                        name: packet.name,
                        routes,
                        port: packet.port,
                        os: packet.os,
                        public_key: packet.public_key,
                        trust_mismatch,
                    });
                }
                Entry::Occupied(mut entry) => {
                    let peer = entry.get_mut();
                    let flagged = peer.trust_mismatch || trust_mismatch;
                    // Metadata stays frozen once the peer is flagged so a
                    // spoofer cannot overwrite what the user sees.
                    if !flagged {
                        peer.name = packet.name;
                        peer.os = packet.os;
                        peer.public_key = packet.public_key;
                    }
                    peer.port = packet.port;
                    peer.routes.insert(
                        ip.clone(),
                        RouteState { ip, last_seen: now },
                    );
                    peer.trust_mismatch = flagged;
                }
            }
        }
        self.events.emit(HostEvent::PeersUpdate(self.get_peers()));
    }

    async fn run_sweeper(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(SWEEP_RATE);
        loop {
            ticker.tick().await;
            self.sweep_expired();
        }
    }

    /// Drop routes that went quiet and peers that lost their last route.
    /// Returns whether anything was removed.
    fn sweep_expired(&self) -> bool {
        let changed = {
            let Ok(mut table) = self.table.write() else {
                return false;
            };
            let now = Utc::now();
            let timeout = chrono::TimeDelta::seconds(ROUTE_TIMEOUT_SECS);
            let mut changed = false;
            table.peers.retain(|_, peer| {
                let before = peer.routes.len();
                peer.routes
                    .retain(|_, route| now - route.last_seen <= timeout);
                if peer.routes.len() != before {
                    changed = true;
                }
                if peer.routes.is_empty() {
                    log::info!("device offline: {}", peer.name);
                    return false;
                }
                true
            });
            let live: Vec<String> = table.peers.keys().cloned().collect();
            table
                .mismatch_baseline
                .retain(|id, _| live.iter().any(|peer_id| peer_id == id));
            changed
        };
        if changed {
            self.events.emit(HostEvent::PeersUpdate(self.get_peers()));
        }
        changed
    }

    /// Called when the user explicitly re-trusts a peer; lifts the sticky
    /// flag so the next announcement can refresh metadata again.
    pub fn clear_trust_mismatch(&self, peer_id: &str) {
        let cleared = {
            let Ok(mut table) = self.table.write() else {
                return;
            };
            table.mismatch_baseline.remove(peer_id);
            match table.peers.get_mut(peer_id) {
                Some(peer) if peer.trust_mismatch => {
                    peer.trust_mismatch = false;
                    true
                }
                _ => false,
            }
        };
        if cleared {
            self.events.emit(HostEvent::PeersUpdate(self.get_peers()));
        }
    }

    pub fn get_peers(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self
            .table
            .read()
            .map(|table| table.peers.values().cloned().collect())
            .unwrap_or_default();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        peers
    }

    pub fn get_peer_by_id(&self, peer_id: &str) -> Option<Peer> {
        self.table
            .read()
            .ok()
            .and_then(|table| table.peers.get(peer_id).cloned())
    }

    pub fn get_peer_by_ip(&self, ip: &str) -> Option<Peer> {
        self.table.read().ok().and_then(|table| {
            table
                .peers
                .values()
                .find(|peer| peer.routes.contains_key(ip))
                .cloned()
        })
    }

    /// This device as a peer record, with every non-loopback IPv4 as a route.
    pub fn get_self(&self) -> Peer {
        let mut peer = self.local_identity();
        let now = Utc::now();
        for (ip, _) in local_ipv4_addresses() {
            peer.routes.insert(
                ip.to_string(),
                RouteState {
                    ip: ip.to_string(),
                    last_seen: now,
                },
            );
        }
        peer
    }

    /// Sender identity embedded in outgoing asks: self, with the single route
    /// the receiver can reach us on.
    pub fn sender_identity(&self, receiver_ip: &str) -> Peer {
        let mut peer = self.local_identity();
        if let Some(ip) = self.get_local_ip_in_same_subnet(receiver_ip) {
            peer.routes.insert(
                ip.to_string(),
                RouteState {
                    ip: ip.to_string(),
                    last_seen: Utc::now(),
                },
            );
        }
        peer
    }

    /// The local IPv4 whose subnet contains `receiver_ip`, if any.
    pub fn get_local_ip_in_same_subnet(&self, receiver_ip: &str) -> Option<Ipv4Addr> {
        let receiver: Ipv4Addr = receiver_ip.parse().ok()?;
        local_ipv4_addresses()
            .into_iter()
            .find(|(ip, netmask)| {
                let mask = u32::from(*netmask);
                u32::from(*ip) & mask == u32::from(receiver) & mask
            })
            .map(|(ip, _)| ip)
    }

    fn local_identity(&self) -> Peer {
        Peer {
            id: self.id.clone(),
            name: self.config.host_name(),
            routes: HashMap::new(),
            port: self.port,
            os: Os::current(),
            public_key: self.config.public_key(),
            trust_mismatch: false,
        }
    }
}

/// Directed broadcast address of every usable IPv4 interface.
fn broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addrs: Vec<Ipv4Addr> = local_ipv4_interfaces()
        .into_iter()
        .map(|v4| {
            v4.broadcast
                .unwrap_or_else(|| Ipv4Addr::from(u32::from(v4.ip) | !u32::from(v4.netmask)))
        })
        .collect();
    addrs.sort();
    addrs.dedup();
    addrs
}

fn local_ipv4_addresses() -> Vec<(Ipv4Addr, Ipv4Addr)> {
    local_ipv4_interfaces()
        .into_iter()
        .map(|v4| (v4.ip, v4.netmask))
        .collect()
}

fn local_ipv4_interfaces() -> Vec<if_addrs::Ifv4Addr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.addr {
            IfAddr::V4(v4) => Some(v4),
            IfAddr::V6(_) => None,
        })
        .collect()
}
