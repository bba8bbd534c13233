use clap::{App, Arg};
use pulsar::logging;
use pulsar::net::config::ConnectionConfig;
use pulsar::net::connection::{Connection, NetStatus};
use pulsar::net::loopback::{Hub, LoopbackTransport};

const SETTLE_TICKS: usize = 60;

fn main() {
    let matches = App::new("Lobby Simulator")
        .version("1.0")
        .author("Bush Hammer Industries")
        .about("Drives a host and several clients through the lobby, relay and reconnection flows on the loopback hub.")
        .arg(
            Arg::with_name("CLIENTS")
                .help("Number of clients joining the room")
                .default_value("3"),
        )
        .arg(
            Arg::with_name("API_VERSION")
                .help("API version announced by every peer")
                .default_value("0"),
        )
        .get_matches();

    let clients: u32 = matches
        .value_of("CLIENTS")
        .unwrap()
        .parse()
        .expect("CLIENTS must be a number");
    let api_version: u8 = matches
        .value_of("API_VERSION")
        .unwrap()
        .parse()
        .expect("API_VERSION must be a byte");

    let log = logging::init();

    let config = ConnectionConfig {
        lobby_capacity: clients + 1,
        api_version,
        ..ConnectionConfig::default()
    };

    let hub = Hub::new(&config.server_addr(), &log);

    logging::info!(log, "opening room"; "capacity" => config.lobby_capacity);

    let mut host = Connection::host(config.clone(), hub.endpoint("host.local:40000"), &log);
    settle(&mut host, None);

    let room = host.room_id().to_string();
    logging::info!(log, "room open"; "room" => &room);

    let mut peers: Vec<Connection<LoopbackTransport>> = (0..clients)
        .map(|index| {
            let addr = format!("client{}.local:{}", index, 41000 + index);
            let mut client =
                Connection::client(config.clone(), room.clone(), hub.endpoint(&addr), &log);
            settle(&mut client, Some(&mut host));
            client
        })
        .collect();

    logging::info!(log, "lobby filled"; "players" => host.num_players());

    host.start_game();
    tick_all(&mut host, &mut peers);

    // One broadcast from everyone, one whisper to the host.
    host.send(b"hello from the host");
    for client in peers.iter_mut() {
        client.send(b"hello from a client");
        client.send_to_host(b"for your eyes only");
    }

    let mut host_dispatches = 0usize;
    let mut client_dispatches = 0usize;

    for _ in 0..SETTLE_TICKS {
        host.receive(|_| host_dispatches += 1);

        for client in peers.iter_mut() {
            client.receive(|_| client_dispatches += 1);
        }
    }

    logging::info!(log, "simulation finished";
                   "host_status" => ?host.status(),
                   "players" => host.num_players(),
                   "total_players" => host.total_players(),
                   "host_dispatches" => host_dispatches,
                   "client_dispatches" => client_dispatches);
}

/// Ticks the connection (and optionally the host) until it leaves `Pending`.
fn settle(conn: &mut Connection<LoopbackTransport>, mut host: Option<&mut Connection<LoopbackTransport>>) {
    for _ in 0..SETTLE_TICKS {
        conn.receive(|_| ());

        if let Some(host) = host.as_mut() {
            host.receive(|_| ());
        }

        if conn.status() != NetStatus::Pending {
            return;
        }
    }

    panic!("Connection failed to settle: {:?}", conn.status());
}

fn tick_all(host: &mut Connection<LoopbackTransport>, peers: &mut [Connection<LoopbackTransport>]) {
    host.receive(|_| ());

    for client in peers.iter_mut() {
        client.receive(|_| ());
    }
}
