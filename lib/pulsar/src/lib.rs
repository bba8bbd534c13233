//! `pulsar` is a networking library for small session-based real-time games.
//! One participant hosts a room through a NAT punchthrough rendezvous server;
//! the other players locate it by a five-character room id. Every payload
//! handed to [`send`](net::connection::Connection::send) reaches every player
//! through their `receive` dispatch a few network ticks later, with the host
//! silently relaying on its star topology so the interface reads as
//! peer-to-peer.
//!
//! The datagram peer itself sits behind the
//! [`Transport`](net::transport::Transport) trait; `net::loopback` ships an
//! in-process implementation driving the test suite and the lobby simulator.

pub mod logging;
pub mod net;
