//! Client library for Pioneer Pro DJ Link device discovery and DBServer
//! session brokering.
//!
//! Two collaborators make up the public surface:
//!
//! - [`DeviceFinder`] passively listens for UDP presence announcements and
//!   maintains an expiring directory of devices currently on the network.
//! - [`ConnectionManager`] discovers each device's DBServer TCP port and
//!   brokers short-lived client sessions into it, including the device
//!   number a caller should pose as when asking a CDJ a metadata question.
//!
//! Everything else — VirtualCdj status beacons, metadata decoding, a UI —
//! is an external collaborator this crate only reaches through the narrow
//! [`VirtualCdj`]/[`CdjStatus`] traits.

pub mod announcement;
pub mod clock;
pub mod config;
pub mod dbserver;
pub mod device_finder;
pub mod dispatch;
pub mod error;
pub mod testing;
pub mod util;
pub mod virtual_cdj;

pub use announcement::{DeviceAnnouncement, DeviceNumber, MacAddress};
pub use clock::{Clock, SystemClock};
pub use config::Config;
pub use dbserver::{ClientSession, ConnectionManager, SessionError};
pub use device_finder::{AnnouncementSocket, DeviceFinder, DeviceFinderListener};
pub use dispatch::{EventDispatcher, InlineDispatcher, ThreadDispatcher};
pub use error::{ProDjLinkError, Result};
pub use virtual_cdj::{CdjStatus, NullVirtualCdj, VirtualCdj};
