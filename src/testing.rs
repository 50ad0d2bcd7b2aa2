//! Deterministic test doubles for the socket and collaborator interfaces,
//! shared between this crate's unit tests and its `tests/` integration
//! suite (spec §8 "End-to-end scenarios").

use std::collections::HashMap;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::announcement::DeviceNumber;
use crate::device_finder::AnnouncementSocket;
use crate::virtual_cdj::{CdjStatus, VirtualCdj};

/// A channel-backed stand-in for the announcement UDP socket. Tests push
/// datagrams through the returned `Sender`; `wake()` pushes a one-byte
/// datagram that the acceptance policy rejects, exactly mirroring how the
/// production socket's self-addressed wake packet is rejected as malformed.
pub struct FakeAnnouncementSocket {
    rx: Mutex<Receiver<(Vec<u8>, SocketAddr)>>,
    tx: Sender<(Vec<u8>, SocketAddr)>,
    timeout: Mutex<Option<Duration>>,
    local: SocketAddr,
}

impl FakeAnnouncementSocket {
    pub fn new() -> (Arc<Self>, Sender<(Vec<u8>, SocketAddr)>) {
        let (tx, rx) = mpsc::channel();
        let socket = Arc::new(FakeAnnouncementSocket {
            rx: Mutex::new(rx),
            tx: tx.clone(),
            timeout: Mutex::new(None),
            local: SocketAddr::from(([127, 0, 0, 1], 0)),
        });
        (socket, tx)
    }
}

impl AnnouncementSocket for FakeAnnouncementSocket {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *self.timeout.lock().unwrap() = timeout;
        Ok(())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let timeout = *self.timeout.lock().unwrap();
        let rx = self.rx.lock().unwrap();
        let (data, addr) = match timeout {
            None => rx
                .recv()
                .map_err(|_| io::Error::new(io::ErrorKind::Other, "fake socket closed"))?,
            Some(d) => rx.recv_timeout(d).map_err(|e| match e {
                mpsc::RecvTimeoutError::Timeout => {
                    io::Error::new(io::ErrorKind::TimedOut, "fake socket read timed out")
                }
                mpsc::RecvTimeoutError::Disconnected => {
                    io::Error::new(io::ErrorKind::Other, "fake socket closed")
                }
            })?,
        };
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    fn wake(&self) -> io::Result<()> {
        let _ = self.tx.send((vec![0u8], self.local));
        Ok(())
    }
}

/// A controllable `VirtualCdj` fake: active/inactive, a fixed device
/// number, and an explicit per-player status table set up by the test.
pub struct FakeVirtualCdj {
    active: Mutex<bool>,
    local_address: Mutex<Option<Ipv4Addr>>,
    device_number: Mutex<DeviceNumber>,
    statuses: Mutex<HashMap<DeviceNumber, Arc<dyn CdjStatus>>>,
}

impl FakeVirtualCdj {
    pub fn new(device_number: DeviceNumber) -> Arc<Self> {
        Arc::new(FakeVirtualCdj {
            active: Mutex::new(true),
            local_address: Mutex::new(None),
            device_number: Mutex::new(device_number),
            statuses: Mutex::new(HashMap::new()),
        })
    }

    pub fn set_active(&self, active: bool) {
        *self.active.lock().unwrap() = active;
    }

    pub fn set_local_address(&self, addr: Ipv4Addr) {
        *self.local_address.lock().unwrap() = Some(addr);
    }

    pub fn set_status(&self, device_number: DeviceNumber, status: Arc<dyn CdjStatus>) {
        self.statuses.lock().unwrap().insert(device_number, status);
    }
}

impl VirtualCdj for FakeVirtualCdj {
    fn is_active(&self) -> bool {
        *self.active.lock().unwrap()
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        *self.local_address.lock().unwrap()
    }

    fn device_number(&self) -> DeviceNumber {
        *self.device_number.lock().unwrap()
    }

    fn latest_status_for(&self, device_number: DeviceNumber) -> Option<Arc<dyn CdjStatus>> {
        self.statuses.lock().unwrap().get(&device_number).cloned()
    }
}

/// A fixed `CdjStatus` fake.
pub struct FakeCdjStatus {
    pub is_cdj: bool,
    pub track_source_player: Option<DeviceNumber>,
}

impl CdjStatus for FakeCdjStatus {
    fn is_cdj(&self) -> bool {
        self.is_cdj
    }

    fn track_source_player(&self) -> Option<DeviceNumber> {
        self.track_source_player
    }
}
