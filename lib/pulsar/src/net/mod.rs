//! Session networking over an ad-hoc star topology: connection establishment
//! through a NAT punchthrough rendezvous, room membership with deterministic
//! slot assignment, host-side broadcast relay, and reconnection recovery.

pub mod config;
pub mod connection;
pub mod frame;
pub mod loopback;
pub mod roster;
pub mod support;
pub mod transport;
