use serde_derive::{Deserialize, Serialize};
use serdeconv;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 61111;
pub const DEFAULT_LOBBY_CAPACITY: u32 = 6;

const DEFAULT_RECONNECT_WINDOW_SECS: u64 = 10;
const DEFAULT_RECONNECT_RETRY_SECS: u64 = 1;

/// Connection setup shared by the host and every client of one lobby.
#[derive(Serialize, Deserialize, Clone)]
pub struct ConnectionConfig {
    /// Host name or address of the punchthrough rendezvous server.
    pub server_host: String,
    pub server_port: u16,
    /// Maximum number of players in the lobby, host included.
    pub lobby_capacity: u32,
    /// Version gate: peers with mismatched versions are refused. Start at 0
    /// and bump on every backwards incompatible protocol change.
    pub api_version: u8,
    /// Hard deadline on client reconnection attempts, in seconds.
    #[serde(default = "default_reconnect_window")]
    pub reconnect_window_secs: u64,
    /// Pause between reconnection attempts, in seconds. The first attempt
    /// fires immediately.
    #[serde(default = "default_reconnect_retry")]
    pub reconnect_retry_secs: u64,
}

fn default_reconnect_window() -> u64 {
    DEFAULT_RECONNECT_WINDOW_SECS
}

fn default_reconnect_retry() -> u64 {
    DEFAULT_RECONNECT_RETRY_SECS
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            server_host: "localhost".to_string(),
            server_port: DEFAULT_PORT,
            lobby_capacity: DEFAULT_LOBBY_CAPACITY,
            api_version: 0,
            reconnect_window_secs: DEFAULT_RECONNECT_WINDOW_SECS,
            reconnect_retry_secs: DEFAULT_RECONNECT_RETRY_SECS,
        }
    }
}

impl ConnectionConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ConnectionConfig {
        serdeconv::from_toml_file(path).expect("Error loading connection configuration file")
    }

    /// Rendezvous server address in `host:port` form.
    #[inline]
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    #[inline]
    pub fn reconnect_window(&self) -> Duration {
        Duration::from_secs(self.reconnect_window_secs)
    }

    #[inline]
    pub fn reconnect_retry(&self) -> Duration {
        Duration::from_secs(self.reconnect_retry_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml() {
        let config: ConnectionConfig = serdeconv::from_toml_str(
            r#"
server_host = "punch.example.com"
server_port = 28008
lobby_capacity = 4
api_version = 7
"#,
        )
        .unwrap();

        assert_eq!(config.server_host, "punch.example.com");
        assert_eq!(config.server_addr(), "punch.example.com:28008");
        assert_eq!(config.lobby_capacity, 4);
        assert_eq!(config.api_version, 7);

        // Reconnect tuning falls back to the defaults when omitted.
        assert_eq!(config.reconnect_window(), Duration::from_secs(10));
        assert_eq!(config.reconnect_retry(), Duration::from_secs(1));
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::default();

        assert_eq!(config.server_addr(), format!("localhost:{}", DEFAULT_PORT));
        assert_eq!(config.lobby_capacity, DEFAULT_LOBBY_CAPACITY);
        assert_eq!(config.api_version, 0);
    }
}
