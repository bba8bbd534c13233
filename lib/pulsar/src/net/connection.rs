use crate::logging;
use crate::net::config::ConnectionConfig;
use crate::net::frame::{Frame, JoinError, PacketKind};
use crate::net::roster::PlayerSet;
use crate::net::support::{PeerAddress, PeerHandle};
use crate::net::transport::{IncomingPacket, Signal, Transport};
use hashbrown::HashSet;
use std::collections::VecDeque;
use std::time::Instant;

/// Observable connection state.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum NetStatus {
    /// Manual teardown, or the reconnect deadline elapsed.
    Disconnected,
    /// Host: waiting on a room id from the rendezvous server. Client:
    /// waiting on a player slot from the host.
    Pending,
    /// Host: room open, accepting connections. Client: joined the room.
    Connected,
    /// Client only: lost the host, retrying through the rendezvous server.
    Reconnecting,
    /// The room id is unknown to the server, or its host is not listening.
    RoomNotFound,
    /// API versions differ between this peer and the host or server.
    ApiMismatch,
    /// Unrecoverable failure: lobby full, game already started, or a
    /// transport error.
    GenericError,
}

impl NetStatus {
    /// Terminal statuses are absorbing; no packet or call moves the
    /// connection out of one.
    #[inline]
    pub fn is_terminal(self) -> bool {
        match self {
            NetStatus::Disconnected
            | NetStatus::RoomNotFound
            | NetStatus::ApiMismatch
            | NetStatus::GenericError => true,
            NetStatus::Pending | NetStatus::Connected | NetStatus::Reconnecting => false,
        }
    }
}

/// Occupancy of a single client slot on the host.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum Slot {
    /// Free; assignable to the next join.
    Vacant,
    Occupied(PeerHandle),
    /// Reserved for reconnection: occupied when the game started, transport
    /// dropped since.
    Dropped,
}

struct HostState {
    started: bool,
    /// Index `i` holds player slot `i + 1`; slot 0 is the host itself.
    slots: Vec<Slot>,
    /// Peers refused on version grounds; their connections are torn down on
    /// sight once the game has started.
    reject: HashSet<PeerAddress>,
    /// Punched addresses with an outstanding direct connect.
    expected: HashSet<PeerAddress>,
}

impl HostState {
    fn new(lobby_capacity: u32) -> HostState {
        HostState {
            started: false,
            slots: vec![Slot::Vacant; lobby_capacity.saturating_sub(1) as usize],
            reject: HashSet::new(),
            expected: HashSet::new(),
        }
    }

    /// Player slot currently bound to the handle.
    fn slot_of(&self, handle: PeerHandle) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| *slot == Slot::Occupied(handle))
            .map(|index| (index + 1) as u8)
    }

    /// Lowest free slot, scanning from 1 upward.
    fn vacant_slot(&self) -> Option<u8> {
        self.slots
            .iter()
            .position(|slot| *slot == Slot::Vacant)
            .map(|index| (index + 1) as u8)
    }
}

struct ClientState {
    room: String,
    host: Option<PeerHandle>,
    /// Address of the punched host, recorded before the direct connect
    /// completes.
    host_addr: Option<PeerAddress>,
}

/// Per-role connection state, pattern-matched in every handler.
enum Role {
    Host(HostState),
    Client(ClientState),
}

/// Network connection to the other players of one game session, presenting a
/// peer-to-peer interface over an ad-hoc star topology.
///
/// The host opens a room on the punchthrough rendezvous server and relays
/// every broadcast; clients locate the host by room id. Call
/// `receive` every network tick, even before the connection is established,
/// and drive payloads out with `send`. All methods are synchronous and the
/// object must stay on one thread.
pub struct Connection<T: Transport> {
    transport: T,
    config: ConnectionConfig,

    status: NetStatus,
    role: Role,

    player_id: Option<u8>,
    room_id: String,
    connected: PlayerSet,
    max_players: u8,

    server_addr: PeerAddress,
    server_handle: Option<PeerHandle>,

    // Reconnection clock
    disconnect_time: Option<Instant>,
    last_reconnect_attempt: Option<Instant>,

    /// Own sends, echoed to the application on the next `receive`.
    local_echo: VecDeque<Vec<u8>>,

    log: logging::Logger,
}

impl<T: Transport> Connection<T> {
    /// Start a new connection as the lobby host.
    ///
    /// Connects to the rendezvous server and requests a room id. The process
    /// is not instantaneous: call `receive` every tick and wait for
    /// `status()` to report `Connected`, after which `room_id()` holds the
    /// id to hand to clients.
    pub fn host<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ConnectionConfig,
        transport: T,
        log: L,
    ) -> Connection<T> {
        let capacity = config.lobby_capacity;
        let mut conn = Connection::startup(config, transport, Role::Host(HostState::new(capacity)), log);

        // The host occupies slot 0 unconditionally.
        conn.player_id = Some(0);
        conn.connected.set(0);

        conn
    }

    /// Start a new connection as a client of the named room.
    ///
    /// Connects to the rendezvous server and punches through to the room's
    /// host. Call `receive` every tick and wait for `status()` to report
    /// `Connected`, after which `player_id()` holds the assigned slot.
    pub fn client<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ConnectionConfig,
        room_id: String,
        transport: T,
        log: L,
    ) -> Connection<T> {
        let role = Role::Client(ClientState {
            room: room_id.clone(),
            host: None,
            host_addr: None,
        });

        let mut conn = Connection::startup(config, transport, role, log);
        conn.room_id = room_id;

        conn
    }

    fn startup<'a, L: Into<Option<&'a logging::Logger>>>(
        config: ConnectionConfig,
        transport: T,
        role: Role,
        log: L,
    ) -> Connection<T> {
        let conn_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        let mut conn = Connection {
            server_addr: config.server_addr(),
            max_players: config.lobby_capacity as u8,
            transport,
            config,
            status: NetStatus::Pending,
            role,
            player_id: None,
            room_id: String::new(),
            connected: PlayerSet::new(),
            server_handle: None,
            disconnect_time: None,
            last_reconnect_attempt: None,
            local_echo: VecDeque::new(),
            log: conn_log,
        };

        logging::debug!(conn.log, "connecting to rendezvous";
                        "context" => "startup",
                        "server" => &conn.server_addr);

        let password = conn.config.api_version;
        let server = conn.server_addr.clone();
        conn.transport.connect(&server, password);

        conn
    }
}

impl<T: Transport> Connection<T> {
    #[inline]
    pub fn status(&self) -> NetStatus {
        self.status
    }

    /// The assigned player slot. Guaranteed `Some(0)` on a live host; on a
    /// client, empty until the host assigns a slot.
    #[inline]
    pub fn player_id(&self) -> Option<u8> {
        self.player_id
    }

    /// The room id: empty on a host until the server assigns one, the
    /// construction-time id on a client.
    #[inline]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Returns true if the given player slot is currently connected. On a
    /// client that lost its host, slot 0 reads as disconnected.
    #[inline]
    pub fn is_player_active(&self, player_id: u8) -> bool {
        self.connected.test(player_id)
    }

    /// Number of players currently connected to the game.
    #[inline]
    pub fn num_players(&self) -> u8 {
        self.connected.count() as u8
    }

    /// Number of players present when the game started, including any that
    /// dropped since. Before the game starts this is the lobby capacity.
    #[inline]
    pub fn total_players(&self) -> u8 {
        self.max_players
    }
}

impl<T: Transport> Connection<T> {
    /// Sends a byte payload to all other players. The other players observe
    /// it through their `receive` dispatch a few network ticks later, and
    /// this connection echoes it to its own dispatch on the next `receive`.
    /// Dropped silently unless the connection is established.
    pub fn send(&mut self, msg: &[u8]) {
        if self.status != NetStatus::Connected {
            return;
        }

        match &self.role {
            Role::Host(state) => {
                for slot in &state.slots {
                    if let Slot::Occupied(handle) = slot {
                        self.transport.send(*handle, PacketKind::Standard.tag(), msg);
                    }
                }
            }
            Role::Client(state) => {
                if let Some(handle) = state.host {
                    self.transport.send(handle, PacketKind::Standard.tag(), msg);
                }
            }
        }

        self.local_echo.push_back(msg.to_vec());
    }

    /// Sends a byte payload to the host alone; it is never relayed to the
    /// other players. On the host this is equivalent to delivering the
    /// payload locally on the next `receive`.
    pub fn send_to_host(&mut self, msg: &[u8]) {
        if self.status != NetStatus::Connected {
            return;
        }

        match &self.role {
            Role::Host(_) => self.local_echo.push_back(msg.to_vec()),
            Role::Client(state) => {
                if let Some(handle) = state.host {
                    self.transport
                        .send(handle, PacketKind::DirectToHost.tag(), msg);
                }
            }
        }
    }

    /// Drains the transport, advancing the handshake or delivering payloads.
    /// `dispatch` is invoked once per application payload received since the
    /// previous call, own sends included.
    ///
    /// Call every network tick, even before a connection is established;
    /// punchthrough coordination happens here.
    pub fn receive<F: FnMut(&[u8])>(&mut self, mut dispatch: F) {
        if self.status.is_terminal() {
            return;
        }

        let now = Instant::now();

        while let Some(payload) = self.local_echo.pop_front() {
            dispatch(&payload);
        }

        while let Some(packet) = self.transport.poll() {
            self.handle_packet(packet, now, &mut dispatch);

            if self.status.is_terminal() {
                return;
            }
        }

        if self.status == NetStatus::Reconnecting {
            self.drive_reconnect(now);
        }
    }

    /// Closes the lobby: no further joins are accepted except reconnects,
    /// and the player count is frozen. Host only; a no-op elsewhere.
    pub fn start_game(&mut self) {
        if self.status != NetStatus::Connected {
            return;
        }

        match &mut self.role {
            Role::Host(state) => {
                if state.started {
                    return;
                }
                state.started = true;
            }
            Role::Client(_) => return,
        }

        self.max_players = self.num_players();
        self.relay_to_slots(&Frame::StartGame, None);

        logging::info!(self.log, "game started";
                       "context" => "membership",
                       "players" => self.max_players);
    }

    /// Tears down every transport link and parks the connection in the
    /// terminal `Disconnected` state. Subsequent `send` and `receive` calls
    /// are no-ops.
    pub fn manual_disconnect(&mut self) {
        if self.status.is_terminal() {
            return;
        }

        self.teardown(NetStatus::Disconnected);
    }
}

impl<T: Transport> Connection<T> {
    fn handle_packet<F: FnMut(&[u8])>(
        &mut self,
        packet: IncomingPacket,
        now: Instant,
        dispatch: &mut F,
    ) {
        if let Some(signal) = Signal::from_tag(packet.tag) {
            match self.role {
                Role::Host(_) => self.host_signal(signal, packet.source, packet.addr),
                Role::Client(_) => self.client_signal(signal, packet.source, packet.addr, now),
            }
            return;
        }

        let kind = match PacketKind::from_tag(packet.tag) {
            Ok(kind) => kind,
            Err(error) => {
                logging::warn!(self.log, "dropping unknown packet";
                               "context" => "receive",
                               "error" => ?error);
                return;
            }
        };

        let decoded = match self.role {
            Role::Host(_) => Frame::read_host_bound(kind, &packet.payload),
            Role::Client(_) => Frame::read_client_bound(kind, &packet.payload),
        };

        match decoded {
            Ok(frame) => match self.role {
                Role::Host(_) => self.host_frame(frame, packet.source, packet.addr, dispatch),
                Role::Client(_) => self.client_frame(frame, packet.source, dispatch),
            },
            Err(error) => {
                logging::warn!(self.log, "dropping malformed packet";
                               "context" => "receive",
                               "kind" => ?kind,
                               "error" => ?error);
            }
        }
    }

    /// Flags the connection with a terminal failure status.
    fn fail(&mut self, status: NetStatus) {
        logging::warn!(self.log, "connection failed";
                       "context" => "status",
                       "status" => ?status);
        self.teardown(status);
    }

    fn teardown(&mut self, status: NetStatus) {
        let mut handles: Vec<PeerHandle> = Vec::new();

        if let Some(handle) = self.server_handle.take() {
            handles.push(handle);
        }

        match &mut self.role {
            Role::Host(state) => {
                for slot in state.slots.iter_mut() {
                    if let Slot::Occupied(handle) = *slot {
                        handles.push(handle);
                    }
                    *slot = Slot::Vacant;
                }
                state.expected.clear();
            }
            Role::Client(state) => {
                if let Some(handle) = state.host.take() {
                    handles.push(handle);
                }
                state.host_addr = None;
            }
        }

        for handle in handles {
            self.transport.disconnect(handle);
        }

        self.connected.clear_all();
        self.local_echo.clear();
        self.player_id = None;
        self.disconnect_time = None;
        self.last_reconnect_attempt = None;
        self.status = status;

        logging::info!(self.log, "connection closed";
                       "context" => "teardown",
                       "status" => ?status);
    }

    /// Encode and send one control frame to a single peer.
    fn send_frame(&mut self, dest: PeerHandle, frame: &Frame) {
        let (tag, payload) = frame.encode().expect("Error encoding control frame");
        self.transport.send(dest, tag, &payload);
    }

    /// Send a control frame to every occupied slot, optionally skipping one.
    fn relay_to_slots(&mut self, frame: &Frame, skip: Option<u8>) {
        let (tag, payload) = frame.encode().expect("Error encoding control frame");
        self.relay_raw(tag, &payload, skip);
    }

    fn relay_raw(&mut self, tag: u8, payload: &[u8], skip: Option<u8>) {
        let targets: Vec<PeerHandle> = match &self.role {
            Role::Host(state) => state
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| match slot {
                    Slot::Occupied(handle) if skip != Some((index + 1) as u8) => Some(*handle),
                    _ => None,
                })
                .collect(),
            Role::Client(_) => Vec::new(),
        };

        for handle in targets {
            self.transport.send(handle, tag, payload);
        }
    }
}

// Host trajectory.
impl<T: Transport> Connection<T> {
    fn host_signal(&mut self, signal: Signal, source: PeerHandle, addr: PeerAddress) {
        match signal {
            Signal::ConnectionAccepted | Signal::AlreadyConnected => {
                if addr == self.server_addr {
                    self.server_handle = Some(source);

                    if self.room_id.is_empty() {
                        logging::debug!(self.log, "requesting room";
                                        "context" => "handshake");
                        self.transport.request_room(&self.server_addr);
                    }
                    return;
                }

                // Direct link to a punched client. Slots are assigned only
                // once the peer delivers its join request. After the game
                // has started, only punched peers get that far; banned and
                // unsolicited addresses are cut at the transport level.
                let refuse = match &self.role {
                    Role::Host(state) => {
                        state.started
                            && (state.reject.contains(&addr) || !state.expected.contains(&addr))
                    }
                    Role::Client(_) => false,
                };

                if refuse {
                    logging::debug!(self.log, "refusing rejected peer";
                                    "context" => "handshake",
                                    "addr" => &addr);
                    self.transport.disconnect(source);
                }
            }
            Signal::NatPunchthroughSucceeded => {
                let skip = match &self.role {
                    Role::Host(state) => state.started && state.reject.contains(&addr),
                    Role::Client(_) => true,
                };

                if skip {
                    return;
                }

                if let Role::Host(state) = &mut self.role {
                    state.expected.insert(addr.clone());
                }

                logging::debug!(self.log, "client punched through";
                                "context" => "handshake",
                                "addr" => &addr);

                let password = self.config.api_version;
                self.transport.connect(&addr, password);
            }
            Signal::DisconnectionNotification | Signal::ConnectionLost => {
                if Some(source) == self.server_handle {
                    self.server_handle = None;

                    if self.status == NetStatus::Pending {
                        // Lost the rendezvous before a room was assigned.
                        self.fail(NetStatus::GenericError);
                    } else {
                        logging::warn!(self.log, "rendezvous session lost";
                                       "context" => "signal");
                    }
                    return;
                }

                self.host_drop_peer(source, &addr);
            }
            Signal::ConnectionAttemptFailed
            | Signal::NoFreeIncomingConnections
            | Signal::InvalidPassword
            | Signal::NatTargetNotConnected
            | Signal::NatTargetUnresponsive => {
                if addr == self.server_addr && self.status == NetStatus::Pending {
                    // The rendezvous server is unreachable.
                    self.fail(NetStatus::GenericError);
                    return;
                }

                if let Role::Host(state) = &mut self.role {
                    state.expected.remove(&addr);
                }

                logging::debug!(self.log, "client connect failed";
                                "context" => "signal",
                                "addr" => &addr,
                                "signal" => ?signal);
            }
        }
    }

    fn host_frame<F: FnMut(&[u8])>(
        &mut self,
        frame: Frame,
        source: PeerHandle,
        addr: PeerAddress,
        dispatch: &mut F,
    ) {
        match frame {
            Frame::AssignedRoom(room) => {
                if Some(source) != self.server_handle || !self.room_id.is_empty() {
                    return;
                }

                logging::info!(self.log, "room open";
                               "context" => "handshake",
                               "room" => &room);

                self.room_id = room;
                self.status = NetStatus::Connected;
            }
            Frame::JoinRequest { api_version, room } => {
                self.host_join(source, addr, api_version, room)
            }
            Frame::ReconnectRequest {
                api_version,
                slot,
                room,
            } => self.host_reconnect(source, addr, api_version, slot, room),
            Frame::Standard(payload) => {
                let slot = match &self.role {
                    Role::Host(state) => state.slot_of(source),
                    Role::Client(_) => None,
                };

                if let Some(slot) = slot {
                    // Relay to everyone but the origin, then deliver locally.
                    self.relay_raw(PacketKind::Standard.tag(), &payload, Some(slot));
                    dispatch(&payload);
                }
            }
            Frame::DirectToHost(payload) => {
                let known = match &self.role {
                    Role::Host(state) => state.slot_of(source).is_some(),
                    Role::Client(_) => false,
                };

                if known {
                    dispatch(&payload);
                }
            }
            _ => (),
        }
    }

    fn host_join(&mut self, source: PeerHandle, addr: PeerAddress, api_version: u8, room: String) {
        if let Role::Host(state) = &mut self.role {
            state.expected.remove(&addr);
        }

        if api_version != self.config.api_version {
            logging::info!(self.log, "join refused";
                           "context" => "handshake",
                           "reason" => "api mismatch",
                           "addr" => &addr,
                           "peer_version" => api_version);

            if let Role::Host(state) = &mut self.role {
                state.reject.insert(addr);
            }

            self.refuse(source, JoinError::ApiMismatch);
            return;
        }

        if room != self.room_id {
            logging::warn!(self.log, "join with foreign room id";
                           "context" => "handshake",
                           "room" => &room,
                           "addr" => &addr);
            self.transport.disconnect(source);
            return;
        }

        let (started, vacant) = match &self.role {
            Role::Host(state) => (state.started, state.vacant_slot()),
            Role::Client(_) => return,
        };

        if started {
            logging::info!(self.log, "join refused";
                           "context" => "handshake",
                           "reason" => "game started",
                           "addr" => &addr);
            self.refuse(source, JoinError::GameStarted);
            return;
        }

        let slot = match vacant {
            Some(slot) => slot,
            None => {
                logging::info!(self.log, "join refused";
                               "context" => "handshake",
                               "reason" => "room full",
                               "addr" => &addr);
                self.refuse(source, JoinError::RoomFull);
                return;
            }
        };

        if let Role::Host(state) = &mut self.role {
            state.slots[slot as usize - 1] = Slot::Occupied(source);
        }
        self.connected.set(slot);

        let reply = Frame::JoinReply {
            api_version: self.config.api_version,
            slot,
            capacity: self.config.lobby_capacity as u8,
        };
        self.send_frame(source, &reply);

        // Catch the newcomer up on the players already present, then
        // announce it to everyone else.
        let present: Vec<u8> = match &self.role {
            Role::Host(state) => state
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, entry)| match entry {
                    Slot::Occupied(_) if (index + 1) as u8 != slot => Some((index + 1) as u8),
                    _ => None,
                })
                .collect(),
            Role::Client(_) => Vec::new(),
        };

        for other in present {
            self.send_frame(source, &Frame::PlayerJoined(other));
        }

        self.relay_to_slots(&Frame::PlayerJoined(slot), Some(slot));

        logging::info!(self.log, "player joined";
                       "context" => "membership",
                       "slot" => slot,
                       "addr" => &addr,
                       "players" => self.num_players());
    }

    fn host_reconnect(
        &mut self,
        source: PeerHandle,
        addr: PeerAddress,
        api_version: u8,
        slot: u8,
        room: String,
    ) {
        if let Role::Host(state) = &mut self.role {
            state.expected.remove(&addr);
        }

        let eligible = match &self.role {
            Role::Host(state) => {
                api_version == self.config.api_version
                    && room == self.room_id
                    && state.started
                    && slot >= 1
                    && (slot as usize) <= state.slots.len()
                    && match state.slots[slot as usize - 1] {
                        Slot::Dropped => true,
                        // A repeated request from the peer already holding
                        // the slot is answered again.
                        Slot::Occupied(handle) => handle == source,
                        Slot::Vacant => false,
                    }
            }
            Role::Client(_) => false,
        };

        if !eligible {
            logging::info!(self.log, "reconnect refused";
                           "context" => "handshake",
                           "slot" => slot);
            self.refuse(source, JoinError::GameStarted);
            return;
        }

        let rejoined = match &mut self.role {
            Role::Host(state) => {
                let rejoined = state.slots[slot as usize - 1] == Slot::Dropped;
                state.slots[slot as usize - 1] = Slot::Occupied(source);
                rejoined
            }
            Role::Client(_) => false,
        };

        self.connected.set(slot);

        let reply = Frame::ReconnectReply {
            api_version: self.config.api_version,
            slot,
            capacity: self.config.lobby_capacity as u8,
            active: self.connected,
        };
        self.send_frame(source, &reply);

        if rejoined {
            self.relay_to_slots(&Frame::PlayerJoined(slot), Some(slot));

            logging::info!(self.log, "player reconnected";
                           "context" => "membership",
                           "slot" => slot,
                           "players" => self.num_players());
        }
    }

    fn host_drop_peer(&mut self, source: PeerHandle, addr: &str) {
        let dropped = match &mut self.role {
            Role::Host(state) => {
                state.expected.remove(addr);

                match state.slot_of(source) {
                    Some(slot) => {
                        // Lobby-phase slots become reusable; in-game slots
                        // stay reserved for the reconnecting player.
                        state.slots[slot as usize - 1] = match state.started {
                            true => Slot::Dropped,
                            false => Slot::Vacant,
                        };
                        Some(slot)
                    }
                    None => None,
                }
            }
            Role::Client(_) => None,
        };

        if let Some(slot) = dropped {
            self.connected.clear(slot);

            logging::info!(self.log, "player left";
                           "context" => "membership",
                           "slot" => slot,
                           "players" => self.num_players());

            self.relay_to_slots(&Frame::PlayerLeft(slot), None);
        }
    }

    fn refuse(&mut self, source: PeerHandle, reason: JoinError) {
        self.send_frame(source, &Frame::JoinFail(reason));
        self.transport.disconnect(source);
    }
}

// Client trajectory.
impl<T: Transport> Connection<T> {
    fn client_signal(&mut self, signal: Signal, source: PeerHandle, addr: PeerAddress, now: Instant) {
        match signal {
            Signal::ConnectionAccepted | Signal::AlreadyConnected => {
                if addr == self.server_addr {
                    self.server_handle = Some(source);

                    let room = match &self.role {
                        Role::Client(state) => state.room.clone(),
                        Role::Host(_) => return,
                    };

                    logging::debug!(self.log, "requesting punchthrough";
                                    "context" => "handshake",
                                    "room" => &room);
                    self.transport.request_punch(&self.server_addr, &room);
                    return;
                }

                let expected = match &self.role {
                    Role::Client(state) => {
                        state.host.is_none() && state.host_addr.as_deref() == Some(addr.as_str())
                    }
                    Role::Host(_) => false,
                };

                if !expected {
                    return;
                }

                if let Role::Client(state) = &mut self.role {
                    state.host = Some(source);
                }

                let room = match &self.role {
                    Role::Client(state) => state.room.clone(),
                    Role::Host(_) => return,
                };

                match self.status {
                    NetStatus::Pending => {
                        logging::debug!(self.log, "joining room";
                                        "context" => "handshake",
                                        "room" => &room);

                        let request = Frame::JoinRequest {
                            api_version: self.config.api_version,
                            room,
                        };
                        self.send_frame(source, &request);
                    }
                    NetStatus::Reconnecting => {
                        let slot = match self.player_id {
                            Some(slot) => slot,
                            None => return,
                        };

                        logging::debug!(self.log, "reclaiming slot";
                                        "context" => "handshake",
                                        "slot" => slot);

                        let request = Frame::ReconnectRequest {
                            api_version: self.config.api_version,
                            slot,
                            room,
                        };
                        self.send_frame(source, &request);
                    }
                    _ => (),
                }
            }
            Signal::NatPunchthroughSucceeded => {
                if let Role::Client(state) = &mut self.role {
                    state.host_addr = Some(addr.clone());
                    state.host = None;
                }

                logging::debug!(self.log, "host punched through";
                                "context" => "handshake",
                                "addr" => &addr);

                let password = self.config.api_version;
                self.transport.connect(&addr, password);
            }
            Signal::InvalidPassword => {
                // The rendezvous password is the API version byte.
                self.fail(NetStatus::ApiMismatch);
            }
            Signal::NatTargetNotConnected => {
                if self.status == NetStatus::Pending {
                    self.fail(NetStatus::RoomNotFound);
                }
                // While reconnecting this is one failed attempt; the retry
                // loop keeps going until the deadline.
            }
            Signal::ConnectionAttemptFailed
            | Signal::NoFreeIncomingConnections
            | Signal::NatTargetUnresponsive => {
                if self.status == NetStatus::Pending {
                    self.fail(NetStatus::GenericError);
                }
            }
            Signal::DisconnectionNotification | Signal::ConnectionLost => {
                if addr == self.server_addr {
                    self.server_handle = None;
                    return;
                }

                let from_host = match &self.role {
                    Role::Client(state) => {
                        state.host == Some(source)
                            || state.host_addr.as_deref() == Some(addr.as_str())
                    }
                    Role::Host(_) => false,
                };

                if !from_host {
                    return;
                }

                match self.status {
                    NetStatus::Connected => {
                        logging::warn!(self.log, "host connection lost";
                                       "context" => "signal");

                        if let Role::Client(state) = &mut self.role {
                            state.host = None;
                            state.host_addr = None;
                        }

                        self.connected.clear(0);
                        self.status = NetStatus::Reconnecting;
                        self.disconnect_time = Some(now);
                        self.last_reconnect_attempt = None;
                    }
                    NetStatus::Pending => self.fail(NetStatus::GenericError),
                    _ => (),
                }
            }
        }
    }

    fn client_frame<F: FnMut(&[u8])>(&mut self, frame: Frame, source: PeerHandle, dispatch: &mut F) {
        let from_host = match &self.role {
            Role::Client(state) => state.host == Some(source),
            Role::Host(_) => false,
        };

        match frame {
            Frame::Standard(payload) => {
                if from_host && self.status == NetStatus::Connected {
                    dispatch(&payload);
                }
            }
            Frame::JoinReply { slot, capacity, .. } => {
                if !from_host || self.status != NetStatus::Pending {
                    return;
                }

                self.player_id = Some(slot);
                self.max_players = capacity;
                self.connected.set(0);
                self.connected.set(slot);
                self.status = NetStatus::Connected;

                logging::info!(self.log, "joined room";
                               "context" => "handshake",
                               "slot" => slot,
                               "capacity" => capacity);
            }
            Frame::JoinFail(reason) => {
                if !from_host {
                    return;
                }

                logging::info!(self.log, "join refused by host";
                               "context" => "handshake",
                               "reason" => ?reason);

                let status = match reason {
                    JoinError::ApiMismatch => NetStatus::ApiMismatch,
                    JoinError::RoomFull | JoinError::GameStarted => NetStatus::GenericError,
                };
                self.fail(status);
            }
            Frame::ReconnectReply { slot, active, .. } => {
                if self.status != NetStatus::Reconnecting {
                    return;
                }

                if let Role::Client(state) = &mut self.role {
                    state.host = Some(source);
                }

                self.player_id = Some(slot);
                self.connected = active;
                self.status = NetStatus::Connected;
                self.disconnect_time = None;
                self.last_reconnect_attempt = None;

                logging::info!(self.log, "rejoined room";
                               "context" => "handshake",
                               "slot" => slot,
                               "players" => self.num_players());
            }
            Frame::PlayerJoined(slot) => {
                if from_host {
                    self.connected.set(slot);
                }
            }
            Frame::PlayerLeft(slot) => {
                if from_host {
                    self.connected.clear(slot);
                }
            }
            Frame::StartGame => {
                if from_host {
                    self.max_players = self.num_players();

                    logging::info!(self.log, "game started";
                                   "context" => "membership",
                                   "players" => self.max_players);
                }
            }
            _ => (),
        }
    }

    fn drive_reconnect(&mut self, now: Instant) {
        let since_drop = match self.disconnect_time {
            Some(time) => now.duration_since(time),
            None => return,
        };

        if since_drop >= self.config.reconnect_window() {
            logging::warn!(self.log, "reconnect deadline elapsed";
                           "context" => "reconnect");
            self.teardown(NetStatus::Disconnected);
            return;
        }

        let due = match self.last_reconnect_attempt {
            Some(time) => now.duration_since(time) >= self.config.reconnect_retry(),
            None => true,
        };

        if !due {
            return;
        }

        self.last_reconnect_attempt = Some(now);

        logging::debug!(self.log, "reconnect attempt"; "context" => "reconnect");

        // Restart the punch cycle, re-opening the rendezvous session first
        // if that link dropped as well.
        match self.server_handle {
            Some(_) => {
                let room = match &self.role {
                    Role::Client(state) => state.room.clone(),
                    Role::Host(_) => return,
                };
                self.transport.request_punch(&self.server_addr, &room);
            }
            None => {
                let password = self.config.api_version;
                let server = self.server_addr.clone();
                self.transport.connect(&server, password);
            }
        }
    }
}

impl<T: Transport> Drop for Connection<T> {
    fn drop(&mut self) {
        if !self.status.is_terminal() {
            self.teardown(NetStatus::Disconnected);
        }
    }
}
