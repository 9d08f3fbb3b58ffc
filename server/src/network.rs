//! Server network layer: UDP transport around the authority session

use crate::broadcaster::Subscription;
use crate::client_manager::ClientManager;
use crate::config::ServerConfig;
use crate::session::{AuthoritySession, SessionEvent};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{ChangeNotification, Packet, ParticipantId, MAX_DATAGRAM_SIZE, PROTOCOL_VERSION};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

/// Fields per snapshot datagram
const SNAPSHOT_CHUNK: usize = 64;

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived {
        packet: Packet,
        addr: SocketAddr,
    },
    ClientTimeout {
        client_id: ParticipantId,
    },
    #[allow(dead_code)]
    Shutdown,
}

/// Messages sent from the authority loop to the sender task
#[derive(Debug)]
pub enum GameMessage {
    SendPacket {
        packet: Packet,
        addr: SocketAddr,
    },
    BroadcastPacket {
        packet: Packet,
        exclude: Option<ParticipantId>,
    },
}

/// Splits a snapshot into datagram-sized packets, all tagged with `tick`
///
/// Each packet carries its index and the total, so observers can tell when
/// they hold the complete set.
pub fn snapshot_packets(tick: u32, fields: Vec<ChangeNotification>) -> Vec<Packet> {
    if fields.is_empty() {
        return vec![Packet::Snapshot {
            tick,
            chunk: 0,
            chunks: 1,
            fields: Vec::new(),
        }];
    }
    let chunks = fields.len().div_ceil(SNAPSHOT_CHUNK).min(u16::MAX as usize) as u16;
    fields
        .chunks(SNAPSHOT_CHUNK)
        .take(chunks as usize)
        .enumerate()
        .map(|(index, chunk)| Packet::Snapshot {
            tick,
            chunk: index as u16,
            chunks,
            fields: chunk.to_vec(),
        })
        .collect()
}

/// UDP host owning the single authority session
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    session: AuthoritySession,
    subscriptions: HashMap<ParticipantId, Subscription>,
    local_observer: Subscription,
    config: ServerConfig,
    tick: u32,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        let mut session = AuthoritySession::new(config.rules.clone());
        let local_observer = session.register_observer(ParticipantId::AUTHORITY);

        Ok(Server {
            socket,
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.client_timeout,
            ))),
            session,
            subscriptions: HashMap::new(),
            local_observer,
            config,
            tick: 0,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn session(&self) -> &AuthoritySession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut AuthoritySession {
        &mut self.session
    }

    /// Spawns task that continuously listens for incoming packets
    async fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        if let Ok(packet) = deserialize::<Packet>(&buffer[0..len]) {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        } else {
                            warn!("Failed to deserialize packet from {}", addr);
                        }
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    async fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::SendPacket { packet, addr } => {
                        if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                            error!("Failed to send packet to {}: {}", addr, e);
                        }
                    }
                    GameMessage::BroadcastPacket { packet, exclude } => {
                        let client_addrs = {
                            let clients_guard = clients.read().await;
                            clients_guard.get_client_addrs()
                        };

                        for (client_id, addr) in client_addrs {
                            if Some(client_id) == exclude {
                                continue;
                            }
                            if let Err(e) = Self::send_packet_impl(&socket, &packet, addr).await {
                                error!("Failed to send to client {}: {}", client_id, e);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    async fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        break;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn broadcast_packet(&self, packet: Packet, exclude: Option<ParticipantId>) {
        if let Err(e) = self
            .game_tx
            .send(GameMessage::BroadcastPacket { packet, exclude })
        {
            error!("Failed to queue broadcast packet: {}", e);
        }
    }

    fn send_snapshot(&self, addr: SocketAddr) {
        for packet in snapshot_packets(self.tick, self.session.snapshot()) {
            self.send_packet(packet, addr);
        }
    }

    async fn client_for(&self, addr: SocketAddr) -> Option<ParticipantId> {
        let clients = self.clients.read().await;
        clients.find_client_by_addr(addr)
    }

    /// Processes one incoming datagram
    async fn handle_packet(&mut self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect { client_version } => {
                info!(
                    "Client connecting from {} (version: {})",
                    addr, client_version
                );
                if client_version != PROTOCOL_VERSION {
                    warn!(
                        "Protocol mismatch from {}: {} != {}",
                        addr, client_version, PROTOCOL_VERSION
                    );
                    self.send_packet(
                        Packet::Disconnected {
                            reason: format!("Protocol version {} required", PROTOCOL_VERSION),
                        },
                        addr,
                    );
                    return;
                }

                if let Some(existing_id) = self.client_for(addr).await {
                    info!("Removing existing client {} from {}", existing_id, addr);
                    self.disconnect_participant(existing_id).await;
                }

                let client_id = {
                    let mut clients = self.clients.write().await;
                    clients.add_client(addr)
                };

                match client_id {
                    Some(client_id) => {
                        let subscription = self.session.register_observer(client_id);
                        self.subscriptions.insert(client_id, subscription);
                        self.session.join(client_id);
                        self.send_packet(
                            Packet::Connected {
                                client_id: client_id.0,
                            },
                            addr,
                        );
                        self.send_snapshot(addr);
                    }
                    None => {
                        self.send_packet(
                            Packet::Disconnected {
                                reason: "Server full".to_string(),
                            },
                            addr,
                        );
                    }
                }
            }

            Packet::Mutate(request) => {
                if let Some(client_id) = self.client_for(addr).await {
                    let mut clients = self.clients.write().await;
                    clients.add_request(client_id, request);
                }
            }

            Packet::SpawnProjectile { direction } => {
                if let Some(client_id) = self.touch(addr).await {
                    if let Err(reason) = self.session.spawn_projectile(client_id, direction) {
                        warn!("Projectile from {} rejected: {}", client_id, reason);
                    }
                }
            }

            Packet::StartBuild { cell } => {
                if let Some(client_id) = self.touch(addr).await {
                    if let Err(reason) = self.session.start_build(client_id, cell) {
                        warn!("Build from {} rejected: {}", client_id, reason);
                    }
                }
            }

            Packet::CancelBuild { cell } => {
                if let Some(client_id) = self.touch(addr).await {
                    if let Err(reason) = self.session.cancel_build(client_id, cell) {
                        warn!("Build cancel from {} rejected: {}", client_id, reason);
                    }
                }
            }

            Packet::ResyncRequest => {
                if self.touch(addr).await.is_some() {
                    self.send_snapshot(addr);
                }
            }

            Packet::Heartbeat { timestamp } => {
                if self.touch(addr).await.is_some() {
                    self.send_packet(Packet::Heartbeat { timestamp }, addr);
                }
            }

            Packet::Disconnect => {
                if let Some(client_id) = self.client_for(addr).await {
                    self.disconnect_participant(client_id).await;
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    async fn touch(&self, addr: SocketAddr) -> Option<ParticipantId> {
        let mut clients = self.clients.write().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients.touch(client_id);
        Some(client_id)
    }

    async fn disconnect_participant(&mut self, client_id: ParticipantId) {
        {
            let mut clients = self.clients.write().await;
            clients.remove_client(&client_id);
        }
        self.subscriptions.remove(&client_id);
        self.session.leave(client_id);
    }

    /// Hands buffered requests to the session in receipt order
    async fn process_requests(&mut self) {
        let requests = {
            let clients = self.clients.read().await;
            clients.get_chronological_requests()
        };
        if requests.is_empty() {
            return;
        }

        let mut clients = self.clients.write().await;
        for (client_id, request) in requests {
            let sequence = request.sequence;
            // Rejections are logged by the router
            let _ = self.session.request_mutation(request);
            clients.mark_request_processed(client_id, sequence);
        }
        clients.cleanup_processed_requests();
    }

    /// Sends every queued notification to its observer
    async fn flush_subscriptions(&mut self) {
        let addrs: HashMap<ParticipantId, SocketAddr> = {
            let clients = self.clients.read().await;
            clients.get_client_addrs().into_iter().collect()
        };

        let mut outgoing = Vec::new();
        for (client_id, subscription) in self.subscriptions.iter_mut() {
            let Some(addr) = addrs.get(client_id) else {
                continue;
            };
            for notification in subscription.drain() {
                outgoing.push((Packet::Change(notification), *addr));
            }
        }
        for (packet, addr) in outgoing {
            self.send_packet(packet, addr);
        }

        let local = self.local_observer.drain();
        if !local.is_empty() {
            debug!("Tick {}: {} field changes applied", self.tick, local.len());
        }
    }

    fn log_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::CountdownFired(id) => info!("Countdown {:?} fired", id),
            SessionEvent::GameStarted => info!("Game started"),
            SessionEvent::SpawnPlayers(roster) => {
                for (participant, class) in roster {
                    info!("Spawning {} as {:?}", participant, class);
                }
            }
            SessionEvent::BuildCommitted {
                cell,
                group,
                builder,
            } => info!("{} built group {} at {:?}", builder, group, cell),
        }
    }

    async fn step(&mut self, dt: Duration) {
        self.process_requests().await;
        for event in self.session.tick(dt) {
            self.log_event(&event);
        }
        self.tick = self.tick.wrapping_add(1);
        self.flush_subscriptions().await;

        if self.config.resync_every_ticks > 0 && self.tick % self.config.resync_every_ticks == 0 {
            for packet in snapshot_packets(self.tick, self.session.snapshot()) {
                self.broadcast_packet(packet, None);
            }
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver().await;
        self.spawn_network_sender().await;
        self.spawn_timeout_checker().await;

        let mut tick_interval = interval(self.config.tick_duration);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            warn!("Client {} timed out", client_id);
                            self.subscriptions.remove(&client_id);
                            self.session.leave(client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick);
                    last_tick = now;

                    self.step(dt).await;

                    if self.tick % 60 == 0 {
                        let client_count = {
                            let clients = self.clients.read().await;
                            clients.len()
                        };
                        if client_count > 0 {
                            debug!(
                                "Tick {}: {} clients, {:.1}Hz, {} fields, phase {:?}",
                                self.tick,
                                client_count,
                                1.0 / dt.as_secs_f32().max(f32::EPSILON),
                                self.session.store().len(),
                                self.session.game_phase()
                            );
                        }
                    }
                },
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{FieldSelector, FieldValue, Mutation, MutationRequest, PlayerClass, SlotKey};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        }
    }

    fn client_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), port)
    }

    fn drain_outgoing(server: &mut Server) -> Vec<(Packet, Option<SocketAddr>)> {
        let mut sent = Vec::new();
        while let Ok(message) = server.game_rx.try_recv() {
            match message {
                GameMessage::SendPacket { packet, addr } => sent.push((packet, Some(addr))),
                GameMessage::BroadcastPacket { packet, .. } => sent.push((packet, None)),
            }
        }
        sent
    }

    #[test]
    fn test_snapshot_chunking() {
        let fields: Vec<ChangeNotification> = (0..150)
            .map(|i| ChangeNotification {
                field: FieldSelector::Health(i),
                new_value: FieldValue::Int(0),
                originator: ParticipantId::AUTHORITY,
                revision: 1,
            })
            .collect();
        let packets = snapshot_packets(7, fields);
        assert_eq!(packets.len(), 3);
        for (index, packet) in packets.iter().enumerate() {
            let data = serialize(packet).unwrap();
            assert!(data.len() < MAX_DATAGRAM_SIZE);
            match packet {
                Packet::Snapshot { tick, chunk, chunks, .. } => {
                    assert_eq!((*tick, *chunk as usize, *chunks), (7, index, 3));
                }
                _ => panic!("Expected a snapshot chunk"),
            }
        }

        assert_eq!(snapshot_packets(1, Vec::new()).len(), 1);
    }

    #[test]
    fn test_channel_communication() {
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
        let addr = client_addr(8080);

        assert!(tx
            .send(ServerMessage::PacketReceived {
                packet: Packet::Connect { client_version: 1 },
                addr,
            })
            .is_ok());

        match rx.try_recv().unwrap() {
            ServerMessage::PacketReceived { packet, addr: a } => {
                assert_eq!(a, addr);
                assert!(matches!(packet, Packet::Connect { client_version: 1 }));
            }
            _ => panic!("Unexpected message type"),
        }
    }

    #[tokio::test]
    async fn test_connect_sends_id_and_snapshot() {
        let mut server = Server::new(test_config()).await.unwrap();
        let addr = client_addr(40001);

        server
            .handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr)
            .await;

        assert_eq!(server.session().participant_count(), 1);
        let sent = drain_outgoing(&mut server);
        assert!(matches!(sent[0].0, Packet::Connected { client_id: 1 }));
        assert!(sent
            .iter()
            .any(|(packet, to)| matches!(packet, Packet::Snapshot { .. }) && *to == Some(addr)));
    }

    #[tokio::test]
    async fn test_version_mismatch_refused() {
        let mut server = Server::new(test_config()).await.unwrap();
        server
            .handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION + 1 }, client_addr(40002))
            .await;

        assert_eq!(server.session().participant_count(), 0);
        let sent = drain_outgoing(&mut server);
        assert!(matches!(sent[0].0, Packet::Disconnected { .. }));
    }

    #[tokio::test]
    async fn test_requests_applied_on_step_and_flushed() {
        let mut server = Server::new(test_config()).await.unwrap();
        let first = client_addr(40003);
        let second = client_addr(40004);
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, first).await;
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, second).await;
        server.step(Duration::from_millis(16)).await;
        drain_outgoing(&mut server);

        let slot = FieldSelector::Slot(SlotKey::Class(PlayerClass::Shooter));
        let request = MutationRequest::new(ParticipantId(1), 1, slot, Mutation::Claim);
        server.handle_packet(Packet::Mutate(request), first).await;
        server.step(Duration::from_millis(16)).await;

        assert_eq!(
            server.session().store().read(&slot),
            Some(&FieldValue::Holder(Some(ParticipantId(1))))
        );
        let changes: Vec<SocketAddr> = drain_outgoing(&mut server)
            .into_iter()
            .filter(|(packet, _)| matches!(packet, Packet::Change(n) if n.field == slot))
            .filter_map(|(_, to)| to)
            .collect();
        assert_eq!(changes.len(), 2);
        assert!(changes.contains(&first) && changes.contains(&second));
    }

    #[tokio::test]
    async fn test_disconnect_leaves_session() {
        let mut server = Server::new(test_config()).await.unwrap();
        let addr = client_addr(40005);
        server.handle_packet(Packet::Connect { client_version: PROTOCOL_VERSION }, addr).await;
        server.handle_packet(Packet::Disconnect, addr).await;

        assert_eq!(server.session().participant_count(), 0);
        assert!(server.subscriptions.is_empty());
    }
}
