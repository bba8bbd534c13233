use std::io;

/// Handle identifying a connected remote peer. Handles are assigned by the
/// transport and unique within one transport instance.
pub type PeerHandle = usize;

/// Network address of a peer in `host:port` form.
pub type PeerAddress = String;

/// Length of a rendezvous-issued room id.
pub const ROOM_ID_LEN: usize = 5;

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Eq, PartialEq)]
pub enum NetworkError {
    /// The payload ended before all advertised fields could be read.
    Truncated,
    /// The tag byte does not name a known application packet kind.
    UnknownKind(u8),
    /// The packet kind is valid but never travels in this direction.
    WrongDirection(u8),
    /// The join-failure reason code is out of range.
    UnknownReason(u8),
    /// The room id field is not upper-case alphanumeric ASCII of the fixed
    /// length.
    BadRoomId,
    Io(io::ErrorKind),
}

impl From<io::Error> for NetworkError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::UnexpectedEof => NetworkError::Truncated,
            kind => NetworkError::Io(kind),
        }
    }
}

/// Returns true if the supplied room id is well formed.
#[inline]
pub fn valid_room_id(room: &str) -> bool {
    room.len() == ROOM_ID_LEN
        && room
            .bytes()
            .all(|byte| byte.is_ascii_uppercase() || byte.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_room_id() {
        assert!(valid_room_id("ABCDE"));
        assert!(valid_room_id("A1B2C"));
        assert!(valid_room_id("00000"));
    }

    #[test]
    fn test_invalid_room_id() {
        assert!(!valid_room_id("ABCD"));
        assert!(!valid_room_id("ABCDEF"));
        assert!(!valid_room_id("abcde"));
        assert!(!valid_room_id("AB DE"));
        assert!(!valid_room_id(""));
    }

    #[test]
    fn test_io_error_conversion() {
        let eof: NetworkError = io::Error::from(io::ErrorKind::UnexpectedEof).into();
        assert_eq!(eof, NetworkError::Truncated);

        let refused: NetworkError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused, NetworkError::Io(io::ErrorKind::ConnectionRefused));
    }
}
