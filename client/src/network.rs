use crate::actions::{AttackLoop, BuildAction};
use crate::lobby::LobbyView;
use crate::replica::{FieldFilter, ReplicaState};
use bincode::{deserialize, serialize};
use log::{debug, error, info, warn};
use shared::{
    timestamp_ms, ChangeNotification, FieldFamily, FieldSelector, FieldValue, GamePhase, GridPos,
    Mutation, Packet, ParticipantId, PlayerClass, SlotKey, Vec2, ATTACK_INTERVAL, BUILD_DURATION,
    MAX_DATAGRAM_SIZE, PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::interval;

const TICK_INTERVAL: Duration = Duration::from_millis(16);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
const RESYNC_COOLDOWN: Duration = Duration::from_secs(1);

/// Cells a builder works through, left to right along the ground row
const BUILD_ROW_WIDTH: i32 = 16;

/// What this participant does once connected
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub desired_class: Option<PlayerClass>,
    pub auto_ready: bool,
    pub aim: Vec2,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            desired_class: None,
            auto_ready: false,
            aim: Vec2::new(1.0, 0.0),
        }
    }
}

/// Chunks of one snapshot tick collected so far
struct SnapshotAssembly {
    tick: u32,
    chunks: u16,
    received: HashSet<u16>,
    fields: HashSet<FieldSelector>,
    mark: u64,
}

/// Headless participant: mirrors the authority's fields and acts on them
pub struct Client {
    socket: UdpSocket,
    server_addr: SocketAddr,
    client_id: Option<ParticipantId>,
    connected: bool,

    replica: ReplicaState,
    snapshot: Option<SnapshotAssembly>,
    since_resync: Duration,
    lobby: LobbyView,
    attack: AttackLoop,
    build: BuildAction,
    build_target: Option<GridPos>,
    build_cursor: i32,
    options: ClientOptions,

    ping_ms: u64,
    last_update: Instant,
}

impl Client {
    pub async fn new(
        server_addr: &str,
        options: ClientOptions,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        let server_addr = server_addr.parse()?;

        let mut replica = ReplicaState::new();
        replica.subscribe(FieldFilter::Field(FieldSelector::GamePhase), |change| {
            if let Some(phase) = change.new_value.as_phase() {
                info!("Game phase is now {:?}", phase);
            }
        });
        replica.subscribe(FieldFilter::Field(FieldSelector::TimerCount), |change| {
            if let Some(value) = change.new_value.as_int() {
                info!("Countdown: {}", value);
            }
        });
        replica.subscribe(FieldFilter::Family(FieldFamily::ExclusiveSlot), |change| {
            debug!("{:?} -> {:?}", change.field, change.new_value);
        });

        Ok(Client {
            socket,
            server_addr,
            client_id: None,
            connected: false,
            replica,
            snapshot: None,
            since_resync: RESYNC_COOLDOWN,
            lobby: LobbyView::new(ParticipantId::AUTHORITY),
            attack: AttackLoop::new(ATTACK_INTERVAL),
            build: BuildAction::new(BUILD_DURATION),
            build_target: None,
            build_cursor: 0,
            options,
            ping_ms: 0,
            last_update: Instant::now(),
        })
    }

    pub fn replica(&self) -> &ReplicaState {
        &self.replica
    }

    pub fn client_id(&self) -> Option<ParticipantId> {
        self.client_id
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let data = serialize(packet)?;
        self.socket.send_to(&data, self.server_addr).await?;
        Ok(())
    }

    async fn send_all(&self, packets: Vec<Packet>) {
        for packet in packets {
            if let Err(e) = self.send_packet(&packet).await {
                error!("Error sending packet: {}", e);
            }
        }
    }

    /// Applies one packet from the authority
    pub fn handle_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Connected { client_id } => {
                let id = ParticipantId(client_id);
                info!("Connected! Client ID: {}", id);
                self.client_id = Some(id);
                self.connected = true;
                self.lobby.rebind(id);
            }

            Packet::Change(notification) => {
                self.replica.reconcile(notification);
            }

            Packet::Snapshot {
                tick,
                chunk,
                chunks,
                fields,
            } => self.handle_snapshot(tick, chunk, chunks, fields),

            Packet::Heartbeat { timestamp } => {
                self.ping_ms = timestamp_ms().saturating_sub(timestamp);
            }

            Packet::Disconnected { reason } => {
                warn!("Disconnected: {}", reason);
                self.connected = false;
                self.client_id = None;
                self.replica.clear();
                self.snapshot = None;
                self.attack.end();
                self.build.cancel();
                self.build_target = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
    }

    /// Merges one snapshot chunk; once every chunk of a tick has arrived,
    /// fields the authority no longer has are pruned
    fn handle_snapshot(
        &mut self,
        tick: u32,
        chunk: u16,
        chunks: u16,
        fields: Vec<ChangeNotification>,
    ) {
        let restart = self
            .snapshot
            .as_ref()
            .map_or(true, |assembly| assembly.tick != tick || assembly.chunks != chunks);
        if restart {
            self.snapshot = Some(SnapshotAssembly {
                tick,
                chunks,
                received: HashSet::new(),
                fields: HashSet::new(),
                mark: self.replica.mark(),
            });
        }
        let Some(assembly) = self.snapshot.as_mut() else {
            return;
        };
        assembly.received.insert(chunk);
        assembly.fields.extend(fields.iter().map(|n| n.field));
        let complete = assembly.received.len() >= chunks as usize;

        let applied = self.replica.apply_snapshot(fields);
        // The snapshot repairs whatever gap it reveals
        self.replica.take_gap();
        debug!(
            "Snapshot {} chunk {}/{} applied {} fields",
            tick,
            chunk + 1,
            chunks,
            applied
        );

        if complete {
            if let Some(assembly) = self.snapshot.take() {
                let pruned = self.replica.prune_missing(&assembly.fields, assembly.mark);
                if pruned > 0 {
                    debug!("Snapshot {} pruned {} retired fields", tick, pruned);
                }
            }
        }
    }

    /// Runs local action loops and decides what to request this tick
    pub fn update(&mut self, dt: Duration) -> Vec<Packet> {
        let Some(me) = self.client_id.filter(|_| self.connected) else {
            return Vec::new();
        };

        let mut packets = Vec::new();
        self.since_resync = self.since_resync.saturating_add(dt);
        if self.since_resync >= RESYNC_COOLDOWN && self.replica.take_gap() {
            info!("Missed updates detected, requesting resync");
            self.since_resync = Duration::ZERO;
            packets.push(Packet::ResyncRequest);
        }

        packets.extend(match self.replica.phase() {
            GamePhase::Lobby => self.update_lobby(me),
            GamePhase::Starting => Vec::new(),
            GamePhase::InGame => {
                let class = self
                    .replica
                    .value(&FieldSelector::PlayerClass(me))
                    .and_then(FieldValue::as_class);
                match class {
                    Some(PlayerClass::Shooter) => self.update_shooter(dt),
                    Some(PlayerClass::Builder) => self.update_builder(me, dt),
                    _ => Vec::new(),
                }
            }
        });
        packets
    }

    fn update_lobby(&mut self, me: ParticipantId) -> Vec<Packet> {
        let Some(class) = self.options.desired_class else {
            return Vec::new();
        };
        let slot = FieldSelector::Slot(SlotKey::Class(class));

        if self.lobby.selected_class(&self.replica).is_none() {
            if self.replica.has_prediction(&slot) || !self.lobby.can_select(&self.replica, class) {
                return Vec::new();
            }
            return self
                .lobby
                .select_class(&mut self.replica, class)
                .map(Packet::Mutate)
                .into_iter()
                .collect();
        }

        let confirmed = self.replica.confirmed(&slot) == Some(&FieldValue::Holder(Some(me)));
        if self.options.auto_ready && confirmed && !self.lobby.is_ready() {
            return self
                .lobby
                .ready(&mut self.replica)
                .into_iter()
                .map(Packet::Mutate)
                .collect();
        }
        Vec::new()
    }

    fn update_shooter(&mut self, dt: Duration) -> Vec<Packet> {
        if !self.attack.is_active() {
            self.attack.begin();
        }
        if self.attack.tick(dt) {
            vec![Packet::SpawnProjectile {
                direction: self.options.aim,
            }]
        } else {
            Vec::new()
        }
    }

    fn update_builder(&mut self, me: ParticipantId, dt: Duration) -> Vec<Packet> {
        if let Some(cell) = self.build.tick(dt) {
            debug!("Finished building at {:?}", cell);
            self.build_target = None;
            self.build_cursor += 1;
            return Vec::new();
        }

        let Some(cell) = self.build_target else {
            return self.claim_next_cell().into_iter().collect();
        };
        if self.build.is_building() {
            return Vec::new();
        }

        let slot = FieldSelector::Slot(SlotKey::BuildCell(cell));
        match self.replica.confirmed(&slot).and_then(FieldValue::as_holder) {
            Some(Some(holder)) if holder == me => {
                self.build.start(cell);
                vec![Packet::StartBuild { cell }]
            }
            Some(Some(_)) => {
                debug!("Lost {:?} to another builder", cell);
                self.build_target = None;
                self.build_cursor += 1;
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    fn claim_next_cell(&mut self) -> Option<Packet> {
        for _ in 0..BUILD_ROW_WIDTH {
            let cell = GridPos::new(self.build_cursor.rem_euclid(BUILD_ROW_WIDTH), 0);
            let taken = self.replica.tiles().is_occupied(&cell)
                || self.replica.holder(SlotKey::BuildCell(cell)).is_some();
            if !taken {
                let slot = FieldSelector::Slot(SlotKey::BuildCell(cell));
                self.replica
                    .predict(slot, FieldValue::Holder(Some(self.lobby.participant())));
                self.build_target = Some(cell);
                let request = self.lobby.sequencer().request(slot, Mutation::Claim);
                return Some(Packet::Mutate(request));
            }
            self.build_cursor += 1;
        }
        None
    }

    async fn connect(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        info!("Connecting to server...");
        self.send_packet(&Packet::Connect {
            client_version: PROTOCOL_VERSION,
        })
        .await
    }

    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.connect().await?;

        let mut tick_interval = interval(TICK_INTERVAL);
        let mut heartbeat_interval = interval(HEARTBEAT_INTERVAL);
        let mut buffer = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            tokio::select! {
                result = self.socket.recv_from(&mut buffer) => {
                    match result {
                        Ok((len, _)) => match deserialize::<Packet>(&buffer[0..len]) {
                            Ok(packet) => self.handle_packet(packet),
                            Err(e) => warn!("Dropping malformed packet: {}", e),
                        },
                        Err(e) => error!("Error receiving packet: {}", e),
                    }
                },

                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(self.last_update);
                    self.last_update = now;
                    let packets = self.update(dt);
                    self.send_all(packets).await;
                },

                _ = heartbeat_interval.tick() => {
                    if self.connected {
                        self.send_all(vec![Packet::Heartbeat { timestamp: timestamp_ms() }]).await;
                    }
                },

                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, leaving");
                    break;
                }
            }
        }

        if self.connected {
            let _ = self.send_packet(&Packet::Disconnect).await;
        }

        Ok(())
    }
}
