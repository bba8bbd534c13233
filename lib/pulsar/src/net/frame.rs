use crate::net::roster::PlayerSet;
use crate::net::support::{valid_room_id, NetworkError, NetworkResult, ROOM_ID_LEN};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read, Write};
use std::str;

/// First tag value available to the application layer. Tags below this belong
/// to the transport's reserved range (see `net::transport::Signal`).
pub const APP_TAG_BASE: u8 = 134;

/// Application packet kinds layered on top of the transport's reserved tags.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PacketKind {
    Standard = 0,
    AssignedRoom = 1,
    JoinRoom = 2,
    JoinRoomFail = 3,
    Reconnect = 4,
    PlayerJoined = 5,
    PlayerLeft = 6,
    StartGame = 7,
    DirectToHost = 8,
}

impl PacketKind {
    /// Raw on-wire tag, offset past the transport's reserved range.
    #[inline]
    pub fn tag(self) -> u8 {
        APP_TAG_BASE + self as u8
    }

    /// Maps a raw tag back to a packet kind.
    #[inline]
    pub fn from_tag(tag: u8) -> NetworkResult<PacketKind> {
        match tag.checked_sub(APP_TAG_BASE) {
            Some(0) => Ok(PacketKind::Standard),
            Some(1) => Ok(PacketKind::AssignedRoom),
            Some(2) => Ok(PacketKind::JoinRoom),
            Some(3) => Ok(PacketKind::JoinRoomFail),
            Some(4) => Ok(PacketKind::Reconnect),
            Some(5) => Ok(PacketKind::PlayerJoined),
            Some(6) => Ok(PacketKind::PlayerLeft),
            Some(7) => Ok(PacketKind::StartGame),
            Some(8) => Ok(PacketKind::DirectToHost),
            _ => Err(NetworkError::UnknownKind(tag)),
        }
    }
}

/// Reason codes carried by `JoinRoomFail`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum JoinError {
    RoomFull = 0,
    ApiMismatch = 1,
    GameStarted = 2,
}

impl JoinError {
    #[inline]
    fn from_code(code: u8) -> NetworkResult<JoinError> {
        match code {
            0 => Ok(JoinError::RoomFull),
            1 => Ok(JoinError::ApiMismatch),
            2 => Ok(JoinError::GameStarted),
            _ => Err(NetworkError::UnknownReason(code)),
        }
    }
}

/// A decoded application packet. `JoinRoom` and `Reconnect` carry different
/// payloads depending on direction, so requests and replies decode into
/// distinct variants and the caller picks the decoder matching its role.
#[derive(Debug, Eq, PartialEq)]
pub enum Frame {
    /// Application broadcast payload, relayed by the host to all others.
    Standard(Vec<u8>),
    /// Rendezvous server to host: the allocated room id.
    AssignedRoom(String),
    /// Client to host: request to join the named room.
    JoinRequest { api_version: u8, room: String },
    /// Host to client: join granted.
    JoinReply {
        api_version: u8,
        slot: u8,
        capacity: u8,
    },
    /// Host to client: join refused.
    JoinFail(JoinError),
    /// Client to host: request to reclaim a slot after a transport drop.
    ReconnectRequest {
        api_version: u8,
        slot: u8,
        room: String,
    },
    /// Host to client: reconnection granted, with the active-slot bitmap.
    ReconnectReply {
        api_version: u8,
        slot: u8,
        capacity: u8,
        active: PlayerSet,
    },
    /// Host to all others: a player now occupies the slot.
    PlayerJoined(u8),
    /// Host to all others: the slot's transport dropped.
    PlayerLeft(u8),
    /// Host to all: lobby is closed, the match is underway.
    StartGame,
    /// Client to host: payload for the host alone, never relayed.
    DirectToHost(Vec<u8>),
}

impl Frame {
    #[inline]
    pub fn kind(&self) -> PacketKind {
        match self {
            Frame::Standard(_) => PacketKind::Standard,
            Frame::AssignedRoom(_) => PacketKind::AssignedRoom,
            Frame::JoinRequest { .. } | Frame::JoinReply { .. } => PacketKind::JoinRoom,
            Frame::JoinFail(_) => PacketKind::JoinRoomFail,
            Frame::ReconnectRequest { .. } | Frame::ReconnectReply { .. } => PacketKind::Reconnect,
            Frame::PlayerJoined(_) => PacketKind::PlayerJoined,
            Frame::PlayerLeft(_) => PacketKind::PlayerLeft,
            Frame::StartGame => PacketKind::StartGame,
            Frame::DirectToHost(_) => PacketKind::DirectToHost,
        }
    }

    /// Write the payload bytes (everything past the tag byte).
    pub fn write<W: Write>(&self, stream: &mut W) -> NetworkResult<()> {
        match self {
            Frame::Standard(data) | Frame::DirectToHost(data) => stream.write_all(data)?,
            Frame::AssignedRoom(room) => write_room_id(stream, room)?,
            Frame::JoinRequest { api_version, room } => {
                stream.write_u8(*api_version)?;
                write_room_id(stream, room)?;
            }
            Frame::JoinReply {
                api_version,
                slot,
                capacity,
            } => {
                stream.write_u8(*api_version)?;
                stream.write_u8(*slot)?;
                stream.write_u8(*capacity)?;
            }
            Frame::JoinFail(reason) => stream.write_u8(*reason as u8)?,
            Frame::ReconnectRequest {
                api_version,
                slot,
                room,
            } => {
                stream.write_u8(*api_version)?;
                stream.write_u8(*slot)?;
                write_room_id(stream, room)?;
            }
            Frame::ReconnectReply {
                api_version,
                slot,
                capacity,
                active,
            } => {
                stream.write_u8(*api_version)?;
                stream.write_u8(*slot)?;
                stream.write_u8(*capacity)?;
                active.write_bitmap(*capacity, stream)?;
            }
            Frame::PlayerJoined(slot) | Frame::PlayerLeft(slot) => stream.write_u8(*slot)?,
            Frame::StartGame => (),
        }

        Ok(())
    }

    /// Encode into the `(tag, payload)` pair handed to the transport.
    pub fn encode(&self) -> NetworkResult<(u8, Vec<u8>)> {
        let mut payload = Vec::new();
        self.write(&mut payload)?;
        Ok((self.kind().tag(), payload))
    }

    /// Decode a packet arriving at the host.
    pub fn read_host_bound(kind: PacketKind, payload: &[u8]) -> NetworkResult<Frame> {
        let mut stream = Cursor::new(payload);

        let frame = match kind {
            PacketKind::Standard => Frame::Standard(payload.to_vec()),
            PacketKind::DirectToHost => Frame::DirectToHost(payload.to_vec()),
            PacketKind::AssignedRoom => Frame::AssignedRoom(read_room_id(&mut stream)?),
            PacketKind::JoinRoom => Frame::JoinRequest {
                api_version: stream.read_u8()?,
                room: read_room_id(&mut stream)?,
            },
            PacketKind::Reconnect => Frame::ReconnectRequest {
                api_version: stream.read_u8()?,
                slot: stream.read_u8()?,
                room: read_room_id(&mut stream)?,
            },
            _ => return Err(NetworkError::WrongDirection(kind.tag())),
        };

        Ok(frame)
    }

    /// Decode a packet arriving at a client.
    pub fn read_client_bound(kind: PacketKind, payload: &[u8]) -> NetworkResult<Frame> {
        let mut stream = Cursor::new(payload);

        let frame = match kind {
            PacketKind::Standard => Frame::Standard(payload.to_vec()),
            PacketKind::JoinRoom => Frame::JoinReply {
                api_version: stream.read_u8()?,
                slot: stream.read_u8()?,
                capacity: stream.read_u8()?,
            },
            PacketKind::JoinRoomFail => Frame::JoinFail(JoinError::from_code(stream.read_u8()?)?),
            PacketKind::Reconnect => {
                let api_version = stream.read_u8()?;
                let slot = stream.read_u8()?;
                let capacity = stream.read_u8()?;
                let active = PlayerSet::read_bitmap(capacity, &mut stream)?;
                Frame::ReconnectReply {
                    api_version,
                    slot,
                    capacity,
                    active,
                }
            }
            PacketKind::PlayerJoined => Frame::PlayerJoined(stream.read_u8()?),
            PacketKind::PlayerLeft => Frame::PlayerLeft(stream.read_u8()?),
            PacketKind::StartGame => Frame::StartGame,
            _ => return Err(NetworkError::WrongDirection(kind.tag())),
        };

        Ok(frame)
    }
}

fn write_room_id<W: Write>(stream: &mut W, room: &str) -> NetworkResult<()> {
    if !valid_room_id(room) {
        return Err(NetworkError::BadRoomId);
    }

    stream.write_all(room.as_bytes()).map_err(Into::into)
}

fn read_room_id<R: Read>(stream: &mut R) -> NetworkResult<String> {
    let mut raw = [0u8; ROOM_ID_LEN];
    stream.read_exact(&mut raw)?;

    let room = str::from_utf8(&raw).map_err(|_| NetworkError::BadRoomId)?;

    if !valid_room_id(room) {
        return Err(NetworkError::BadRoomId);
    }

    Ok(room.to_string())
}
