use crate::net::support::{PeerAddress, PeerHandle};

/// Transport-reserved signal tags. These occupy the tag range below
/// `net::frame::APP_TAG_BASE` and describe connectivity events rather than
/// application payloads. The transport never panics; every failure mode
/// surfaces as one of these.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Signal {
    ConnectionAccepted = 16,
    ConnectionAttemptFailed = 17,
    AlreadyConnected = 18,
    NoFreeIncomingConnections = 20,
    DisconnectionNotification = 21,
    ConnectionLost = 22,
    /// The rendezvous server refused the session password. The connection
    /// core treats this as an API version mismatch.
    InvalidPassword = 23,
    NatTargetNotConnected = 57,
    NatTargetUnresponsive = 58,
    NatPunchthroughSucceeded = 61,
}

impl Signal {
    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    /// Maps a raw tag to a signal; application tags return `None`.
    #[inline]
    pub fn from_tag(tag: u8) -> Option<Signal> {
        match tag {
            16 => Some(Signal::ConnectionAccepted),
            17 => Some(Signal::ConnectionAttemptFailed),
            18 => Some(Signal::AlreadyConnected),
            20 => Some(Signal::NoFreeIncomingConnections),
            21 => Some(Signal::DisconnectionNotification),
            22 => Some(Signal::ConnectionLost),
            23 => Some(Signal::InvalidPassword),
            57 => Some(Signal::NatTargetNotConnected),
            58 => Some(Signal::NatTargetUnresponsive),
            61 => Some(Signal::NatPunchthroughSucceeded),
            _ => None,
        }
    }
}

/// A packet pulled off the transport.
#[derive(Debug)]
pub struct IncomingPacket {
    /// Handle of the peer the packet relates to.
    pub source: PeerHandle,
    /// For most packets the sender's address. For `NatPunchthroughSucceeded`
    /// this is the address of the punched remote peer instead.
    pub addr: PeerAddress,
    /// Raw tag byte: a `Signal` value or an application tag.
    pub tag: u8,
    pub payload: Vec<u8>,
}

/// The underlying reliable-ordered datagram peer with punchthrough support.
/// The connection core is written exclusively against this contract so that
/// alternative backends slot in without touching the handshake or relay
/// logic.
pub trait Transport {
    /// Next packet that arrived since the previous call, in transport
    /// arrival order. Non-blocking; call in a loop until `None`.
    fn poll(&mut self) -> Option<IncomingPacket>;

    /// Reliable-ordered send. Failure is silent when the destination has
    /// already torn down; a later `poll` surfaces the disconnection.
    fn send(&mut self, dest: PeerHandle, tag: u8, payload: &[u8]);

    /// Send to every connected peer, optionally excluding one. May be
    /// implemented as repeated `send`.
    fn broadcast(&mut self, tag: u8, payload: &[u8], except: Option<PeerHandle>);

    /// Initiate a connection. `password` is the session password submitted
    /// to the remote end; the rendezvous server uses it to gate cross-version
    /// matches. Success appears as `ConnectionAccepted` in a later `poll`.
    fn connect(&mut self, addr: &str, password: u8);

    /// Graceful tear-down of one peer link.
    fn disconnect(&mut self, handle: PeerHandle);

    /// Ask the rendezvous server for a fresh room id. The reply arrives as
    /// an `AssignedRoom` application packet.
    fn request_room(&mut self, via: &str);

    /// Ask the rendezvous server to pair this peer with the host of the
    /// named room.
    fn request_punch(&mut self, via: &str, room: &str);
}
