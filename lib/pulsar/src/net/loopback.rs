//! In-process transport backed by a simulated rendezvous hub. Every endpoint
//! shares one `Hub`, which plays both the punchthrough server and the
//! datagram mesh. Single-threaded by design; endpoints hold the hub through
//! `Rc` and must stay on one thread.

use crate::logging;
use crate::net::frame::PacketKind;
use crate::net::support::{PeerAddress, PeerHandle, ROOM_ID_LEN};
use crate::net::transport::{IncomingPacket, Signal, Transport};
use hashbrown::{HashMap, HashSet};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

const ROOM_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const ROOM_SPACE: u64 = 36 * 36 * 36 * 36 * 36;

/// Simulated rendezvous server plus datagram mesh.
pub struct Hub {
    inner: Rc<RefCell<HubInner>>,
}

impl Hub {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(server_addr: &str, log: L) -> Hub {
        let hub_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::null(),
        };

        Hub {
            inner: Rc::new(RefCell::new(HubInner {
                server_addr: server_addr.to_string(),
                endpoints: HashMap::new(),
                rooms: HashMap::new(),
                room_sequence: 0,
                log: hub_log,
            })),
        }
    }

    /// Address of the simulated rendezvous server.
    pub fn server_addr(&self) -> PeerAddress {
        self.inner.borrow().server_addr.clone()
    }

    /// Registers a new endpoint on the hub and returns its transport.
    pub fn endpoint(&self, addr: &str) -> LoopbackTransport {
        let mut inner = self.inner.borrow_mut();

        if addr == inner.server_addr || inner.endpoints.contains_key(addr) {
            panic!("Address {} is already taken on the hub", addr);
        }

        inner.endpoints.insert(addr.to_string(), Endpoint::new());

        logging::debug!(inner.log, "endpoint registered"; "context" => "endpoint", "addr" => addr);

        LoopbackTransport {
            inner: self.inner.clone(),
            addr: addr.to_string(),
        }
    }

    /// Simulates losing every link of the endpoint at once (a NAT mapping
    /// expiry or route flap). Both sides of each link observe
    /// `ConnectionLost`; the endpoint itself stays registered and may
    /// connect again.
    pub fn sever(&self, addr: &str) {
        self.inner.borrow_mut().sever(addr);
    }
}

/// `Transport` implementation bound to one address on a `Hub`.
pub struct LoopbackTransport {
    inner: Rc<RefCell<HubInner>>,
    addr: PeerAddress,
}

impl Transport for LoopbackTransport {
    fn poll(&mut self) -> Option<IncomingPacket> {
        let mut inner = self.inner.borrow_mut();
        let endpoint = inner.endpoints.get_mut(&self.addr)?;

        endpoint.queue.pop_front()
    }

    fn send(&mut self, dest: PeerHandle, tag: u8, payload: &[u8]) {
        self.inner.borrow_mut().send(&self.addr, dest, tag, payload);
    }

    fn broadcast(&mut self, tag: u8, payload: &[u8], except: Option<PeerHandle>) {
        self.inner
            .borrow_mut()
            .broadcast(&self.addr, tag, payload, except);
    }

    fn connect(&mut self, addr: &str, password: u8) {
        self.inner.borrow_mut().connect(&self.addr, addr, password);
    }

    fn disconnect(&mut self, handle: PeerHandle) {
        self.inner.borrow_mut().disconnect(&self.addr, handle);
    }

    fn request_room(&mut self, via: &str) {
        self.inner.borrow_mut().request_room(&self.addr, via);
    }

    fn request_punch(&mut self, via: &str, room: &str) {
        self.inner.borrow_mut().request_punch(&self.addr, via, room);
    }
}

struct Endpoint {
    queue: VecDeque<IncomingPacket>,
    handles: HashMap<PeerAddress, PeerHandle>,
    addrs: Vec<PeerAddress>,
    links: HashSet<PeerAddress>,
    server_password: Option<u8>,
}

impl Endpoint {
    fn new() -> Endpoint {
        Endpoint {
            queue: VecDeque::new(),
            handles: HashMap::new(),
            addrs: Vec::new(),
            links: HashSet::new(),
            server_password: None,
        }
    }

    /// Returns the local handle for the address, allocating on first use.
    fn handle_for(&mut self, addr: &str) -> PeerHandle {
        if let Some(&handle) = self.handles.get(addr) {
            return handle;
        }

        let handle = self.addrs.len();
        self.handles.insert(addr.to_string(), handle);
        self.addrs.push(addr.to_string());

        handle
    }

    fn addr_of(&self, handle: PeerHandle) -> Option<PeerAddress> {
        self.addrs.get(handle).cloned()
    }
}

struct HubInner {
    server_addr: PeerAddress,
    endpoints: HashMap<PeerAddress, Endpoint>,
    rooms: HashMap<String, PeerAddress>,
    room_sequence: u64,
    log: logging::Logger,
}

impl HubInner {
    /// Queues a packet at `to`, attributed to `from`.
    fn deliver(&mut self, to: &str, from: &str, tag: u8, payload: Vec<u8>) {
        let endpoint = match self.endpoints.get_mut(to) {
            Some(endpoint) => endpoint,
            None => return,
        };

        let source = endpoint.handle_for(from);

        endpoint.queue.push_back(IncomingPacket {
            source,
            addr: from.to_string(),
            tag,
            payload,
        });
    }

    fn signal(&mut self, to: &str, about: &str, signal: Signal) {
        self.deliver(to, about, signal.tag(), Vec::new());
    }

    fn connect(&mut self, from: &str, to: &str, password: u8) {
        logging::trace!(self.log, "connect"; "context" => "connect", "from" => from, "to" => to);

        if to == self.server_addr {
            let endpoint = match self.endpoints.get_mut(from) {
                Some(endpoint) => endpoint,
                None => return,
            };

            if endpoint.links.contains(to) {
                let server = self.server_addr.clone();
                self.signal(from, &server, Signal::AlreadyConnected);
                return;
            }

            endpoint.links.insert(to.to_string());
            endpoint.server_password = Some(password);

            let server = self.server_addr.clone();
            self.signal(from, &server, Signal::ConnectionAccepted);
            return;
        }

        if !self.endpoints.contains_key(to) {
            self.signal(from, to, Signal::ConnectionAttemptFailed);
            return;
        }

        let initiator = match self.endpoints.get_mut(from) {
            Some(endpoint) => endpoint,
            None => return,
        };

        if initiator.links.contains(to) {
            self.signal(from, to, Signal::AlreadyConnected);
            return;
        }

        initiator.links.insert(to.to_string());
        self.endpoints
            .get_mut(to)
            .expect("Link target must be registered")
            .links
            .insert(from.to_string());

        self.signal(from, to, Signal::ConnectionAccepted);
    }

    fn disconnect(&mut self, from: &str, handle: PeerHandle) {
        let addr = match self.endpoints.get(from).and_then(|ep| ep.addr_of(handle)) {
            Some(addr) => addr,
            None => return,
        };

        logging::trace!(self.log, "disconnect"; "context" => "disconnect", "from" => from, "to" => &addr);

        let had_link = match self.endpoints.get_mut(from) {
            Some(endpoint) => {
                let had = endpoint.links.remove(&addr);
                if addr == self.server_addr {
                    endpoint.server_password = None;
                }
                had
            }
            None => false,
        };

        if !had_link || addr == self.server_addr {
            return;
        }

        if let Some(target) = self.endpoints.get_mut(&addr) {
            target.links.remove(from);
        }

        self.signal(&addr, from, Signal::DisconnectionNotification);
    }

    fn send(&mut self, from: &str, dest: PeerHandle, tag: u8, payload: &[u8]) {
        let addr = match self.endpoints.get(from).and_then(|ep| ep.addr_of(dest)) {
            Some(addr) => addr,
            None => return,
        };

        // Sends to torn-down links are dropped silently.
        let linked = self
            .endpoints
            .get(from)
            .map_or(false, |ep| ep.links.contains(&addr));

        if !linked || addr == self.server_addr {
            return;
        }

        self.deliver(&addr, from, tag, payload.to_vec());
    }

    fn broadcast(&mut self, from: &str, tag: u8, payload: &[u8], except: Option<PeerHandle>) {
        let endpoint = match self.endpoints.get(from) {
            Some(endpoint) => endpoint,
            None => return,
        };

        let skip = except.and_then(|handle| endpoint.addr_of(handle));
        let targets: Vec<PeerAddress> = endpoint
            .links
            .iter()
            .filter(|addr| **addr != self.server_addr && Some(*addr) != skip.as_ref())
            .cloned()
            .collect();

        for addr in targets {
            self.deliver(&addr, from, tag, payload.to_vec());
        }
    }

    fn request_room(&mut self, from: &str, via: &str) {
        if !self.server_linked(from, via) {
            logging::warn!(self.log, "room request without server session";
                           "context" => "request_room",
                           "from" => from);
            return;
        }

        let room = loop {
            let candidate = encode_room_id(self.room_sequence % ROOM_SPACE);
            self.room_sequence += 1;

            if !self.rooms.contains_key(&candidate) {
                break candidate;
            }
        };

        self.rooms.insert(room.clone(), from.to_string());

        logging::debug!(self.log, "room allocated";
                        "context" => "request_room",
                        "room" => &room,
                        "host" => from);

        let server = self.server_addr.clone();
        self.deliver(
            from,
            &server,
            PacketKind::AssignedRoom.tag(),
            room.into_bytes(),
        );
    }

    fn request_punch(&mut self, from: &str, via: &str, room: &str) {
        if !self.server_linked(from, via) {
            logging::warn!(self.log, "punch request without server session";
                           "context" => "request_punch",
                           "from" => from);
            return;
        }

        let server = self.server_addr.clone();

        let host_addr = match self.rooms.get(room) {
            Some(addr) => addr.clone(),
            None => {
                logging::debug!(self.log, "punch target unknown";
                                "context" => "request_punch",
                                "room" => room,
                                "from" => from);
                self.signal(from, &server, Signal::NatTargetNotConnected);
                return;
            }
        };

        let host_online = self
            .endpoints
            .get(&host_addr)
            .map_or(false, |ep| ep.links.contains(&server));

        if !host_online {
            self.signal(from, &server, Signal::NatTargetNotConnected);
            return;
        }

        let host_password = self
            .endpoints
            .get(&host_addr)
            .and_then(|ep| ep.server_password);
        let client_password = self.endpoints.get(from).and_then(|ep| ep.server_password);

        if host_password != client_password {
            logging::debug!(self.log, "punch password mismatch";
                            "context" => "request_punch",
                            "room" => room,
                            "from" => from);
            self.signal(from, &server, Signal::InvalidPassword);
            return;
        }

        logging::debug!(self.log, "punch paired";
                        "context" => "request_punch",
                        "room" => room,
                        "host" => &host_addr,
                        "client" => from);

        self.signal(from, &host_addr, Signal::NatPunchthroughSucceeded);
        self.signal(&host_addr, from, Signal::NatPunchthroughSucceeded);
    }

    fn sever(&mut self, addr: &str) {
        let links: Vec<PeerAddress> = match self.endpoints.get_mut(addr) {
            Some(endpoint) => {
                endpoint.server_password = None;
                endpoint.links.drain().collect()
            }
            None => return,
        };

        logging::debug!(self.log, "endpoint severed";
                        "context" => "sever",
                        "addr" => addr,
                        "links" => links.len());

        for peer in links {
            self.signal(addr, &peer, Signal::ConnectionLost);

            if peer == self.server_addr {
                continue;
            }

            if let Some(endpoint) = self.endpoints.get_mut(&peer) {
                endpoint.links.remove(addr);
            }

            self.signal(&peer, addr, Signal::ConnectionLost);
        }
    }

    fn server_linked(&self, from: &str, via: &str) -> bool {
        via == self.server_addr
            && self
                .endpoints
                .get(from)
                .map_or(false, |ep| ep.links.contains(via))
    }
}

fn encode_room_id(sequence: u64) -> String {
    let mut id = [0u8; ROOM_ID_LEN];
    let mut value = sequence;

    for slot in id.iter_mut().rev() {
        *slot = ROOM_CHARSET[(value % ROOM_CHARSET.len() as u64) as usize];
        value /= ROOM_CHARSET.len() as u64;
    }

    String::from_utf8(id.to_vec()).expect("Room charset must be ASCII")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::support::valid_room_id;

    const SERVER: &str = "rendezvous.local:28008";
    const HOST: &str = "host.local:40000";
    const CLIENT: &str = "client.local:40001";

    fn expect_signal(transport: &mut LoopbackTransport, signal: Signal) -> IncomingPacket {
        let packet = transport.poll().expect("Expected a queued packet");
        assert_eq!(packet.tag, signal.tag());
        packet
    }

    #[test]
    fn test_connect_accept() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let _b = hub.endpoint(CLIENT);

        a.connect(CLIENT, 0);

        let packet = expect_signal(&mut a, Signal::ConnectionAccepted);
        assert_eq!(packet.addr, CLIENT);
        assert!(a.poll().is_none());
    }

    #[test]
    fn test_connect_unknown_target_fails() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);

        a.connect("nowhere.local:1", 0);

        expect_signal(&mut a, Signal::ConnectionAttemptFailed);
    }

    #[test]
    fn test_connect_twice_reports_already_connected() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);

        a.connect(CLIENT, 0);
        expect_signal(&mut a, Signal::ConnectionAccepted);

        // The link is duplex; the other side connecting back is idempotent.
        b.connect(HOST, 0);
        expect_signal(&mut b, Signal::AlreadyConnected);
    }

    #[test]
    fn test_send_roundtrip() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);

        a.connect(CLIENT, 0);
        let accepted = expect_signal(&mut a, Signal::ConnectionAccepted);

        a.send(accepted.source, 200, &[1, 2, 3]);

        let packet = b.poll().unwrap();
        assert_eq!(packet.addr, HOST);
        assert_eq!(packet.tag, 200);
        assert_eq!(packet.payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_send_without_link_dropped() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);

        a.send(0, 200, &[1]);

        assert!(b.poll().is_none());
    }

    #[test]
    fn test_room_allocation() {
        let hub = Hub::new(SERVER, None);
        let mut host = hub.endpoint(HOST);

        host.connect(SERVER, 7);
        expect_signal(&mut host, Signal::ConnectionAccepted);

        host.request_room(SERVER);

        let packet = host.poll().unwrap();
        assert_eq!(packet.tag, PacketKind::AssignedRoom.tag());

        let room = String::from_utf8(packet.payload).unwrap();
        assert!(valid_room_id(&room));
    }

    #[test]
    fn test_punch_pairing() {
        let hub = Hub::new(SERVER, None);
        let mut host = hub.endpoint(HOST);
        let mut client = hub.endpoint(CLIENT);

        host.connect(SERVER, 7);
        expect_signal(&mut host, Signal::ConnectionAccepted);
        host.request_room(SERVER);
        let room = String::from_utf8(host.poll().unwrap().payload).unwrap();

        client.connect(SERVER, 7);
        expect_signal(&mut client, Signal::ConnectionAccepted);
        client.request_punch(SERVER, &room);

        let punched = expect_signal(&mut client, Signal::NatPunchthroughSucceeded);
        assert_eq!(punched.addr, HOST);

        let punched = expect_signal(&mut host, Signal::NatPunchthroughSucceeded);
        assert_eq!(punched.addr, CLIENT);
    }

    #[test]
    fn test_punch_unknown_room() {
        let hub = Hub::new(SERVER, None);
        let mut client = hub.endpoint(CLIENT);

        client.connect(SERVER, 7);
        expect_signal(&mut client, Signal::ConnectionAccepted);
        client.request_punch(SERVER, "ZZZZZ");

        expect_signal(&mut client, Signal::NatTargetNotConnected);
    }

    #[test]
    fn test_punch_password_mismatch() {
        let hub = Hub::new(SERVER, None);
        let mut host = hub.endpoint(HOST);
        let mut client = hub.endpoint(CLIENT);

        host.connect(SERVER, 3);
        expect_signal(&mut host, Signal::ConnectionAccepted);
        host.request_room(SERVER);
        let room = String::from_utf8(host.poll().unwrap().payload).unwrap();

        client.connect(SERVER, 4);
        expect_signal(&mut client, Signal::ConnectionAccepted);
        client.request_punch(SERVER, &room);

        expect_signal(&mut client, Signal::InvalidPassword);
        assert!(host.poll().is_none());
    }

    #[test]
    fn test_disconnect_notifies_peer() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);

        a.connect(CLIENT, 0);
        let accepted = expect_signal(&mut a, Signal::ConnectionAccepted);

        a.disconnect(accepted.source);

        let packet = expect_signal(&mut b, Signal::DisconnectionNotification);
        assert_eq!(packet.addr, HOST);
    }

    #[test]
    fn test_sever_drops_all_links() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);

        a.connect(SERVER, 0);
        expect_signal(&mut a, Signal::ConnectionAccepted);
        a.connect(CLIENT, 0);
        let accepted = expect_signal(&mut a, Signal::ConnectionAccepted);

        hub.sever(HOST);

        let mut lost = vec![
            expect_signal(&mut a, Signal::ConnectionLost).addr,
            expect_signal(&mut a, Signal::ConnectionLost).addr,
        ];
        lost.sort();

        let mut expected = vec![SERVER.to_string(), CLIENT.to_string()];
        expected.sort();

        assert_eq!(lost, expected);

        expect_signal(&mut b, Signal::ConnectionLost);

        // Severed links drop data on the floor.
        a.send(accepted.source, 200, &[1]);
        assert!(b.poll().is_none());
    }

    #[test]
    fn test_broadcast_except() {
        let hub = Hub::new(SERVER, None);
        let mut a = hub.endpoint(HOST);
        let mut b = hub.endpoint(CLIENT);
        let mut c = hub.endpoint("client2.local:40002");

        a.connect(SERVER, 0);
        expect_signal(&mut a, Signal::ConnectionAccepted);
        a.connect(CLIENT, 0);
        let b_handle = expect_signal(&mut a, Signal::ConnectionAccepted).source;
        a.connect("client2.local:40002", 0);
        expect_signal(&mut a, Signal::ConnectionAccepted);

        a.broadcast(210, &[9], Some(b_handle));

        assert!(b.poll().is_none());

        let packet = c.poll().unwrap();
        assert_eq!(packet.tag, 210);
        assert_eq!(packet.payload, vec![9]);
    }

    #[test]
    fn test_room_id_encoding() {
        assert_eq!(encode_room_id(0), "AAAAA");
        assert_eq!(encode_room_id(1), "AAAAB");
        assert_eq!(encode_room_id(36), "AAABA");
        assert_eq!(encode_room_id(ROOM_SPACE - 1), "99999");
    }
}
