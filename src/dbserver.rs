//! `ConnectionManager` — discovers each player's DBServer TCP port and
//! brokers short-lived client sessions into it (spec §4.2).

use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use thiserror::Error;

use crate::announcement::{DeviceAnnouncement, DeviceNumber};
use crate::config::Config;
use crate::device_finder::{DeviceFinder, DeviceFinderListener};
use crate::error::{ProDjLinkError, Result};
use crate::virtual_cdj::{NullVirtualCdj, VirtualCdj};

/// A request/response frame name recognized by every Pro DJ Link DBServer.
const DB_SERVER_QUERY_NAME: &[u8] = b"RemoteDBServer";

/// Device numbers below this are real CDJs, which only answer metadata
/// queries from device numbers in `1..=4`.
const RESERVED_PLAYER_RANGE_END: DeviceNumber = 4;

/// Build the 19-byte DBServer port-query request frame:
/// 4-byte BE length (15) + ASCII "RemoteDBServer" + one trailing zero byte.
fn build_port_query_frame() -> [u8; 19] {
    let mut buf = [0u8; 19];
    buf[0..4].copy_from_slice(&(DB_SERVER_QUERY_NAME.len() as u32 + 1).to_be_bytes());
    buf[4..4 + DB_SERVER_QUERY_NAME.len()].copy_from_slice(DB_SERVER_QUERY_NAME);
    buf[18] = 0;
    buf
}

/// An open, single-use connection into a player's DBServer. Request framing
/// and transaction semantics over this stream are outside this crate's
/// scope; callers treat the stream as an opaque transport and speak
/// whatever metadata-query protocol they need.
pub struct ClientSession {
    pub stream: TcpStream,
    pub target_player: DeviceNumber,
    pub source_player: DeviceNumber,
}

/// Error returned by `invoke_with_client_session`: either this crate
/// failing to set up the session, or the caller's task failing once it had
/// one.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    ProDjLink(#[from] ProDjLinkError),
    #[error("session task failed: {0}")]
    Task(Box<dyn std::error::Error + Send + Sync>),
}

struct State {
    running: bool,
    ports: std::collections::HashMap<DeviceNumber, u16>,
    listener: Option<Arc<dyn DeviceFinderListener>>,
}

impl State {
    fn new() -> Self {
        State {
            running: false,
            ports: std::collections::HashMap::new(),
            listener: None,
        }
    }
}

/// Adapter registered with `DeviceFinder` so `ConnectionManager` hears
/// found/lost events without the two types owning each other strongly.
struct CmListener(Weak<ConnectionManager>);

impl DeviceFinderListener for CmListener {
    fn device_found(&self, announcement: &DeviceAnnouncement) {
        if let Some(cm) = self.0.upgrade() {
            cm.on_device_found(announcement);
        }
    }

    fn device_lost(&self, announcement: &DeviceAnnouncement) {
        if let Some(cm) = self.0.upgrade() {
            cm.on_device_lost(announcement);
        }
    }
}

pub struct ConnectionManager {
    config: Config,
    virtual_cdj: Arc<dyn VirtualCdj>,
    device_finder: Arc<DeviceFinder>,
    socket_timeout: Mutex<Duration>,
    state: Mutex<State>,
}

impl ConnectionManager {
    pub fn new(config: Config, virtual_cdj: Arc<dyn VirtualCdj>, device_finder: Arc<DeviceFinder>) -> Arc<Self> {
        let socket_timeout = config.socket_timeout;
        Arc::new(ConnectionManager {
            config,
            virtual_cdj,
            device_finder,
            socket_timeout: Mutex::new(socket_timeout),
            state: Mutex::new(State::new()),
        })
    }

    /// The process-wide singleton, per spec §9, backed by `DeviceFinder::global()`
    /// and a `NullVirtualCdj`. Callers that need a real `VirtualCdj` should
    /// construct their own instance via `new` instead.
    pub fn global() -> &'static Arc<ConnectionManager> {
        static INSTANCE: Lazy<Arc<ConnectionManager>> = Lazy::new(|| {
            ConnectionManager::new(Config::default(), Arc::new(NullVirtualCdj), Arc::clone(DeviceFinder::global()))
        });
        &INSTANCE
    }

    /// Idempotent. Ensures `DeviceFinder` is running, subscribes to its
    /// presence events, and enqueues a port probe for every device already
    /// known.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        self.device_finder.start()?;

        let listener: Arc<dyn DeviceFinderListener> = Arc::new(CmListener(Arc::downgrade(self)));
        self.device_finder.add_listener(Arc::clone(&listener));
        self.state.lock().unwrap().listener = Some(listener);

        if let Ok(devices) = self.device_finder.current_devices() {
            for device in devices {
                self.on_device_found(&device);
            }
        }

        Ok(())
    }

    /// Idempotent. Unregisters from `DeviceFinder` and clears the port
    /// table. Does not stop `DeviceFinder` itself.
    pub fn stop(&self) {
        let listener = {
            let mut state = self.state.lock().unwrap();
            if !state.running {
                return;
            }
            state.running = false;
            state.ports.clear();
            state.listener.take()
        };
        if let Some(listener) = listener {
            self.device_finder.remove_listener(&listener);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }

    /// The known DBServer TCP port for `device_number`, or `None` if it has
    /// never been probed or its probe found no DBServer.
    pub fn player_dbserver_port(&self, device_number: DeviceNumber) -> Option<u16> {
        self.state.lock().unwrap().ports.get(&device_number).copied()
    }

    pub fn set_socket_timeout(&self, timeout: Duration) {
        *self.socket_timeout.lock().unwrap() = timeout;
    }

    pub fn socket_timeout(&self) -> Duration {
        *self.socket_timeout.lock().unwrap()
    }

    /// Opens a single-use TCP session to `target_player`'s DBServer, hands
    /// it to `task` along with a chosen posing-as device number, and
    /// guarantees the socket is closed on every exit path. The task's
    /// result is surfaced unchanged.
    pub fn invoke_with_client_session<F, R>(
        &self,
        target_player: DeviceNumber,
        description: &str,
        task: F,
    ) -> std::result::Result<R, SessionError>
    where
        F: FnOnce(&mut ClientSession) -> std::result::Result<R, Box<dyn std::error::Error + Send + Sync>>,
    {
        let announcement = self
            .device_finder
            .latest_announcement_from(target_player)?
            .ok_or(ProDjLinkError::NoSuchPlayer(target_player))?;
        let port = self
            .player_dbserver_port(target_player)
            .ok_or(ProDjLinkError::NoSuchPlayer(target_player))?;
        let source_player = self.choose_asking_player_number(target_player)?;

        let addr = SocketAddr::new(IpAddr::V4(announcement.address), port);
        let timeout = self.socket_timeout();
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(ProDjLinkError::Io)?;
        stream.set_read_timeout(Some(timeout)).map_err(ProDjLinkError::Io)?;
        stream.set_write_timeout(Some(timeout)).map_err(ProDjLinkError::Io)?;

        debug!("opened DBServer session to player {target_player} at {addr} posing as {source_player} ({description})");

        let mut session = ClientSession {
            stream,
            target_player,
            source_player,
        };
        let result = task(&mut session);

        if let Err(e) = session.stream.shutdown(std::net::Shutdown::Both) {
            debug!("error closing DBServer session socket: {e}");
        }

        result.map_err(SessionError::Task)
    }

    /// Selection policy for the device number to pose as when querying
    /// `target_player` (spec §4.2 `chooseAskingPlayerNumber`).
    fn choose_asking_player_number(&self, target_player: DeviceNumber) -> Result<DeviceNumber> {
        let v = self.virtual_cdj.device_number();
        let virtual_is_safe_range = (1..=RESERVED_PLAYER_RANGE_END).contains(&v);

        if target_player > 15 || virtual_is_safe_range {
            return Ok(v);
        }

        let devices = self.device_finder.current_devices().unwrap_or_default();
        for candidate in devices {
            if candidate.number == target_player || !(1..=RESERVED_PLAYER_RANGE_END).contains(&candidate.number) {
                continue;
            }
            if let Some(status) = self.virtual_cdj.latest_status_for(candidate.number) {
                if status.is_cdj() && status.track_source_player() != Some(target_player) {
                    return Ok(candidate.number);
                }
            }
        }

        Err(ProDjLinkError::NoAvailableSourceNumber(target_player))
    }

    fn on_device_found(self: &Arc<Self>, announcement: &DeviceAnnouncement) {
        if !self.is_running() {
            return;
        }
        let cm = Arc::clone(self);
        let announcement = announcement.clone();
        thread::Builder::new()
            .name("prodjlink-port-probe".into())
            .spawn(move || cm.probe_port(announcement))
            .expect("failed to spawn DBServer port probe thread");
    }

    fn on_device_lost(&self, announcement: &DeviceAnnouncement) {
        self.state.lock().unwrap().ports.remove(&announcement.number);
    }

    fn probe_port(&self, announcement: DeviceAnnouncement) {
        let addr = SocketAddr::new(IpAddr::V4(announcement.address), self.config.db_server_query_port);
        let timeout = self.socket_timeout();

        let mut stream = match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => stream,
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                info!(
                    "player {} at {} is not a DBServer participant (connection refused)",
                    announcement.number, announcement.address
                );
                return;
            }
            Err(e) => {
                warn!("DBServer port probe to {addr} failed: {e}");
                return;
            }
        };

        if let Err(e) = stream.set_read_timeout(Some(timeout)) {
            warn!("failed to set DBServer probe read timeout for {addr}: {e}");
        }

        if let Err(e) = stream.write_all(&build_port_query_frame()) {
            warn!("failed to send DBServer port query to {addr}: {e}");
            return;
        }

        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(n) if n >= 2 => {
                if n != 2 {
                    warn!("unexpected DBServer port-query response length {n} from {addr}, using first 2 bytes");
                }
                let port = crate::util::read_u16_be(&buf, 0);
                self.state.lock().unwrap().ports.insert(announcement.number, port);
                info!("DBServer port for player {} is {}", announcement.number, port);
            }
            Ok(n) => {
                warn!("DBServer port-query response from {addr} was only {n} bytes, discarding");
            }
            Err(e) => {
                warn!("failed to read DBServer port-query response from {addr}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, SystemClock};
    use crate::dispatch::InlineDispatcher;
    use crate::testing::{FakeCdjStatus, FakeVirtualCdj};
    use std::net::{Ipv4Addr, TcpListener};

    #[test]
    fn port_query_frame_is_byte_exact() {
        let expected: [u8; 19] = [
            0x00, 0x00, 0x00, 0x0F, 0x52, 0x65, 0x6D, 0x6F, 0x74, 0x65, 0x44, 0x42, 0x53, 0x65,
            0x72, 0x76, 0x65, 0x72, 0x00,
        ];
        assert_eq!(build_port_query_frame(), expected);
    }

    fn fresh_device_finder() -> Arc<DeviceFinder> {
        let (fake_socket, _tx) = crate::testing::FakeAnnouncementSocket::new();
        DeviceFinder::with_collaborators(
            Config::default(),
            Arc::new(SystemClock) as Arc<dyn Clock>,
            Arc::new(NullVirtualCdj),
            Arc::new(InlineDispatcher),
            Box::new(move |_port| Ok(fake_socket.clone() as Arc<dyn crate::device_finder::AnnouncementSocket>)),
        )
    }

    #[test]
    fn probe_success_records_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 19];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(buf, build_port_query_frame());
            stream.write_all(&[0x04, 0xD2]).unwrap();
        });

        let df = fresh_device_finder();
        let config = Config {
            db_server_query_port: port,
            ..Config::default()
        };
        let cm = ConnectionManager::new(config, Arc::new(NullVirtualCdj), df);

        let announcement = DeviceAnnouncement {
            name: "CDJ-3000".into(),
            number: 3,
            address: Ipv4Addr::LOCALHOST,
            mac: crate::announcement::MacAddress([0; 6]),
            timestamp: 0,
        };
        cm.probe_port(announcement);
        handle.join().unwrap();

        assert_eq!(cm.player_dbserver_port(3), Some(1234));
    }

    #[test]
    fn probe_connection_refused_leaves_port_unknown() {
        // Bind then immediately drop to get a port nothing is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let df = fresh_device_finder();
        let config = Config {
            db_server_query_port: port,
            ..Config::default()
        };
        let cm = ConnectionManager::new(config, Arc::new(NullVirtualCdj), df);

        let announcement = DeviceAnnouncement {
            name: "DJM-900".into(),
            number: 5,
            address: Ipv4Addr::LOCALHOST,
            mac: crate::announcement::MacAddress([0; 6]),
            timestamp: 0,
        };
        cm.probe_port(announcement);
        assert_eq!(cm.player_dbserver_port(5), None);
    }

    #[test]
    fn choose_asking_player_number_rekordbox_target_returns_virtual_number() {
        let df = fresh_device_finder();
        df.start().unwrap();
        let vcdj = FakeVirtualCdj::new(5);
        let cm = ConnectionManager::new(Config::default(), vcdj, df);
        assert_eq!(cm.choose_asking_player_number(17).unwrap(), 5);
    }

    #[test]
    fn choose_asking_player_number_steals_non_conflicting_player() {
        let (fake_socket, tx) = crate::testing::FakeAnnouncementSocket::new();
        let df = DeviceFinder::with_collaborators(
            Config::default(),
            Arc::new(SystemClock) as Arc<dyn Clock>,
            Arc::new(NullVirtualCdj),
            Arc::new(InlineDispatcher),
            Box::new(move |_port| Ok(fake_socket.clone() as Arc<dyn crate::device_finder::AnnouncementSocket>)),
        );
        df.start().unwrap();

        for (number, addr) in [(1u8, "10.0.0.1:50000"), (3u8, "10.0.0.3:50000")] {
            let mut buf = vec![0u8; crate::util::ANNOUNCEMENT_PACKET_LENGTH];
            buf[crate::util::PACKET_TYPE_OFFSET] = crate::util::PACKET_TYPE_DEVICE_ANNOUNCEMENT;
            buf[crate::util::DEVICE_NUMBER_OFFSET] = number;
            tx.send((buf, addr.parse().unwrap())).unwrap();
        }
        for _ in 0..200 {
            if df.current_devices().unwrap().len() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let vcdj = FakeVirtualCdj::new(8);
        vcdj.set_status(
            1,
            Arc::new(FakeCdjStatus {
                is_cdj: true,
                track_source_player: Some(2),
            }),
        );
        vcdj.set_status(
            3,
            Arc::new(FakeCdjStatus {
                is_cdj: true,
                track_source_player: Some(1),
            }),
        );

        let cm = ConnectionManager::new(Config::default(), vcdj.clone(), df);
        assert_eq!(cm.choose_asking_player_number(2).unwrap(), 3);

        // If player 3 is also playing from the target, nobody qualifies.
        vcdj.set_status(
            3,
            Arc::new(FakeCdjStatus {
                is_cdj: true,
                track_source_player: Some(2),
            }),
        );
        assert!(matches!(
            cm.choose_asking_player_number(2),
            Err(ProDjLinkError::NoAvailableSourceNumber(2))
        ));
    }

    #[test]
    fn device_lost_clears_port_table_entry() {
        let df = fresh_device_finder();
        let cm = ConnectionManager::new(Config::default(), Arc::new(NullVirtualCdj), df);
        cm.state.lock().unwrap().ports.insert(4, 6789);
        assert_eq!(cm.player_dbserver_port(4), Some(6789));

        let announcement = DeviceAnnouncement {
            name: "CDJ-2000".into(),
            number: 4,
            address: Ipv4Addr::LOCALHOST,
            mac: crate::announcement::MacAddress([0; 6]),
            timestamp: 0,
        };
        cm.on_device_lost(&announcement);
        assert_eq!(cm.player_dbserver_port(4), None);
    }
}
