//! `DeviceFinder` — the passive UDP listener that discovers Pro DJ Link
//! devices and maintains an expiring directory of the ones currently on the
//! network (spec §4.1).

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use socket2::{Domain, Socket, Type};

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::dispatch::{EventDispatcher, ThreadDispatcher};
use crate::error::{ProDjLinkError, Result};
use crate::util;
use crate::{announcement::DeviceAnnouncement, announcement::DeviceNumber};
use crate::virtual_cdj::{NullVirtualCdj, VirtualCdj};

/// Keepalive window used by the receiver loop once at least one device is
/// known, so stale entries are noticed even without new traffic.
const EXPIRATION_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// Abstraction over the announcement UDP socket, so the receive loop can be
/// driven by a deterministic fake in tests.
pub trait AnnouncementSocket: Send + Sync {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
    /// Unblock a thread currently parked in `recv_from`. Used by `stop()`.
    fn wake(&self) -> io::Result<()>;
}

pub type SocketFactory = dyn Fn(u16) -> io::Result<Arc<dyn AnnouncementSocket>> + Send + Sync;

/// Production socket: a broadcast-enabled UDP socket bound to
/// `0.0.0.0:<port>`, with `SO_REUSEADDR` set before bind so this process can
/// coexist with other Pro DJ Link listeners on the same host.
pub struct UdpAnnouncementSocket(std::net::UdpSocket);

impl UdpAnnouncementSocket {
    pub fn bind(port: u16) -> io::Result<Arc<dyn AnnouncementSocket>> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        let addr: SocketAddr = (Ipv4Addr::UNSPECIFIED, port).into();
        socket.bind(&addr.into())?;
        let std_socket: std::net::UdpSocket = socket.into();
        Ok(Arc::new(UdpAnnouncementSocket(std_socket)))
    }
}

impl AnnouncementSocket for UdpAnnouncementSocket {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.0.set_read_timeout(timeout)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.0.recv_from(buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.0.local_addr()
    }

    fn wake(&self) -> io::Result<()> {
        let port = self.0.local_addr()?.port();
        self.0
            .send_to(&[0u8], SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
            .map(|_| ())
    }
}

/// Subscriber to device presence changes. Identity for dedup/removal is
/// `Arc` pointer identity, not `PartialEq` on the listener's contents.
pub trait DeviceFinderListener: Send + Sync {
    fn device_found(&self, announcement: &DeviceAnnouncement);
    fn device_lost(&self, announcement: &DeviceAnnouncement);
}

#[derive(Clone, Copy)]
enum NotificationKind {
    Found,
    Lost,
}

struct State {
    active: bool,
    start_time: Option<u64>,
    socket: Option<Arc<dyn AnnouncementSocket>>,
    directory: HashMap<Ipv4Addr, DeviceAnnouncement>,
    listeners: Vec<Arc<dyn DeviceFinderListener>>,
}

impl State {
    fn new() -> Self {
        State {
            active: false,
            start_time: None,
            socket: None,
            directory: HashMap::new(),
            listeners: Vec::new(),
        }
    }
}

/// The UDP presence tracker. Must be held behind an `Arc` to call `start()`,
/// since the receiver thread keeps its own strong reference for as long as
/// it runs.
pub struct DeviceFinder {
    config: Config,
    clock: Arc<dyn Clock>,
    virtual_cdj: Arc<dyn VirtualCdj>,
    dispatcher: Arc<dyn EventDispatcher>,
    socket_factory: Box<SocketFactory>,
    state: Mutex<State>,
}

impl DeviceFinder {
    pub fn new(config: Config) -> Arc<Self> {
        Self::with_collaborators(
            config,
            Arc::new(SystemClock),
            Arc::new(NullVirtualCdj),
            Arc::new(ThreadDispatcher::new()),
            Box::new(UdpAnnouncementSocket::bind),
        )
    }

    pub fn with_collaborators(
        config: Config,
        clock: Arc<dyn Clock>,
        virtual_cdj: Arc<dyn VirtualCdj>,
        dispatcher: Arc<dyn EventDispatcher>,
        socket_factory: Box<SocketFactory>,
    ) -> Arc<Self> {
        Arc::new(DeviceFinder {
            config,
            clock,
            virtual_cdj,
            dispatcher,
            socket_factory,
            state: Mutex::new(State::new()),
        })
    }

    /// The process-wide singleton, per spec §9. Most callers should prefer
    /// constructing their own instance via `new`; this exists for hosts that
    /// want the source library's global-facade ergonomics.
    pub fn global() -> &'static Arc<DeviceFinder> {
        static INSTANCE: Lazy<Arc<DeviceFinder>> = Lazy::new(|| DeviceFinder::new(Config::default()));
        &INSTANCE
    }

    /// Idempotent. Binds the announcement socket and spawns the receiver
    /// thread; returns once the socket is bound.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            if state.active {
                return Ok(());
            }
        }

        let socket = (self.socket_factory)(self.config.announcement_port)
            .map_err(ProDjLinkError::NetworkBind)?;

        {
            let mut state = self.state.lock().unwrap();
            if state.active {
                return Ok(());
            }
            state.socket = Some(Arc::clone(&socket));
            state.active = true;
            state.start_time = Some(self.clock.now_ms());
            state.directory.clear();
        }

        let finder = Arc::clone(self);
        thread::Builder::new()
            .name("prodjlink-device-finder".into())
            .spawn(move || finder.receive_loop(socket))
            .expect("failed to spawn device finder receiver thread");

        Ok(())
    }

    /// Idempotent. Closes the socket, drains the directory, and delivers a
    /// device-lost notification for each entry present at stop time.
    pub fn stop(&self) {
        let (socket, drained) = {
            let mut state = self.state.lock().unwrap();
            if !state.active {
                return;
            }
            state.active = false;
            let socket = state.socket.take();
            let drained: Vec<DeviceAnnouncement> = state.directory.drain().map(|(_, v)| v).collect();
            (socket, drained)
        };

        for announcement in drained {
            info!(
                "device lost (stop): {} ({}) at {}",
                announcement.name, announcement.number, announcement.address
            );
            self.notify(NotificationKind::Lost, announcement);
        }

        if let Some(socket) = socket {
            if let Err(e) = socket.wake() {
                warn!("failed to wake device finder receiver: {e}");
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().unwrap().active
    }

    pub fn start_time(&self) -> Result<u64> {
        let state = self.state.lock().unwrap();
        if !state.active {
            return Err(ProDjLinkError::NotActive);
        }
        state.start_time.ok_or(ProDjLinkError::NotActive)
    }

    /// A snapshot of currently-live devices, after applying expiration.
    pub fn current_devices(&self) -> Result<Vec<DeviceAnnouncement>> {
        if !self.is_active() {
            return Err(ProDjLinkError::NotActive);
        }
        self.expire();
        let state = self.state.lock().unwrap();
        if !state.active {
            return Err(ProDjLinkError::NotActive);
        }
        Ok(state.directory.values().cloned().collect())
    }

    /// Linear search over `current_devices()`. The directory is small
    /// enough (≤ ~8 entries) that this is simpler than a secondary index.
    pub fn latest_announcement_from(
        &self,
        device_number: DeviceNumber,
    ) -> Result<Option<DeviceAnnouncement>> {
        Ok(self
            .current_devices()?
            .into_iter()
            .find(|a| a.number == device_number))
    }

    pub fn add_listener(&self, listener: Arc<dyn DeviceFinderListener>) {
        let mut state = self.state.lock().unwrap();
        if !state.listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            state.listeners.push(listener);
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn DeviceFinderListener>) {
        let mut state = self.state.lock().unwrap();
        state.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn receive_loop(self: Arc<Self>, socket: Arc<dyn AnnouncementSocket>) {
        let mut buf = [0u8; 2048];

        loop {
            if !self.is_active() {
                break;
            }

            let empty = self.state.lock().unwrap().directory.is_empty();
            let timeout = if empty { None } else { Some(EXPIRATION_POLL_INTERVAL) };
            if let Err(e) = socket.set_read_timeout(timeout) {
                warn!("failed to set announcement socket read timeout: {e}");
            }

            match socket.recv_from(&mut buf) {
                Ok((n, SocketAddr::V4(src))) => {
                    self.handle_datagram(&buf[..n], *src.ip());
                }
                Ok((_n, SocketAddr::V6(_))) => {
                    // Not expected on an IPv4 socket; ignore.
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    self.expire();
                }
                Err(e) => {
                    if self.is_active() {
                        warn!("device finder receive error: {e}; stopping");
                        self.stop();
                    }
                    break;
                }
            }
        }
    }

    fn handle_datagram(&self, data: &[u8], source: Ipv4Addr) {
        if !util::is_device_announcement(data) {
            debug!("rejected {}-byte datagram from {source}: not a device announcement", data.len());
            return;
        }

        if self.virtual_cdj.is_active() {
            if let Some(local) = self.virtual_cdj.local_address() {
                if local == source {
                    debug!("ignoring self-echo announcement from {source}");
                    return;
                }
            }
        }

        let announcement = DeviceAnnouncement::parse(data, source, self.clock.now_ms());

        let is_new = {
            let mut state = self.state.lock().unwrap();
            let is_new = !state.directory.contains_key(&source);
            state.directory.insert(source, announcement.clone());
            is_new
        };

        if is_new {
            info!(
                "device found: {} ({}) at {}",
                announcement.name, announcement.number, announcement.address
            );
            self.notify(NotificationKind::Found, announcement);
        }

        self.expire();
    }

    fn expire(&self) {
        let now = self.clock.now_ms();
        let max_age = self.config.max_age.as_millis() as u64;

        let expired: Vec<DeviceAnnouncement> = {
            let mut state = self.state.lock().unwrap();
            let stale: Vec<Ipv4Addr> = state
                .directory
                .iter()
                .filter(|(_, a)| now.saturating_sub(a.timestamp) > max_age)
                .map(|(addr, _)| *addr)
                .collect();
            stale
                .into_iter()
                .filter_map(|addr| state.directory.remove(&addr))
                .collect()
        };

        for announcement in expired {
            info!(
                "device lost: {} ({}) at {}",
                announcement.name, announcement.number, announcement.address
            );
            self.notify(NotificationKind::Lost, announcement);
        }
    }

    fn notify(&self, kind: NotificationKind, announcement: DeviceAnnouncement) {
        let listeners: Vec<Arc<dyn DeviceFinderListener>> =
            self.state.lock().unwrap().listeners.clone();

        for listener in listeners {
            let announcement = announcement.clone();
            self.dispatcher.submit(Box::new(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match kind {
                    NotificationKind::Found => listener.device_found(&announcement),
                    NotificationKind::Lost => listener.device_lost(&announcement),
                }));
                if outcome.is_err() {
                    log::error!("device finder listener panicked");
                }
            }));
        }
    }
}
