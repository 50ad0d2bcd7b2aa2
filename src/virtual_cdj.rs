//! The narrow interface this crate consumes from the external VirtualCdj
//! collaborator (spec §6). The real VirtualCdj — status beacons, per-player
//! status tracking — lives outside this crate entirely; we only need enough
//! of it to decide a safe source device number (spec §4.2).

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::announcement::DeviceNumber;

/// A snapshot of a CDJ's currently-playing track, as far as this crate
/// cares: whether the reporting device is a CDJ at all, and if so which
/// player number its track is currently sourced from.
pub trait CdjStatus: Send + Sync {
    fn is_cdj(&self) -> bool;
    fn track_source_player(&self) -> Option<DeviceNumber>;
}

/// The subset of VirtualCdj that `ConnectionManager` depends on.
pub trait VirtualCdj: Send + Sync {
    fn is_active(&self) -> bool;
    fn local_address(&self) -> Option<Ipv4Addr>;
    fn device_number(&self) -> DeviceNumber;
    fn latest_status_for(&self, device_number: DeviceNumber) -> Option<Arc<dyn CdjStatus>>;
}

/// Default VirtualCdj used when a caller hasn't wired up a real one: always
/// inactive, device number 0 (never qualifies under any selection rule),
/// and reports no status for anyone.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullVirtualCdj;

impl VirtualCdj for NullVirtualCdj {
    fn is_active(&self) -> bool {
        false
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        None
    }

    fn device_number(&self) -> DeviceNumber {
        0
    }

    fn latest_status_for(&self, _device_number: DeviceNumber) -> Option<Arc<dyn CdjStatus>> {
        None
    }
}
