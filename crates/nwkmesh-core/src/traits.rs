//! Collaborator traits
//!
//! The network layer never talks to hardware or storage directly. The MAC,
//! the security service and the persistent store are consumed through
//! these narrow traits, and indications leave through [`IndicationSink`].

use std::time::Instant;

use bytes::Bytes;
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::address::{Capability, DeviceType, ExtAddr, ExtPanId, PanId, ShortAddr};
use crate::error::{MacError, SecurityError, StorageError};
use crate::event::NwkIndication;
use crate::frame::NwkHeader;
use crate::status::NwkStatus;

/// Handle the MAC returns for a queued transmission, echoed back in the
/// send confirmation
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("mac#{_0}")]
pub struct MacHandle(pub u32);

/// Parameters the network layer pushes into the MAC after forming,
/// joining or changing state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacNetworkParams {
    pub short_addr: ShortAddr,
    pub pan_id: PanId,
    pub ext_pan_id: ExtPanId,
    pub channel: u8,
    pub device_type: DeviceType,
    pub depth: u8,
    pub permit_joining: bool,
    pub router_capacity: bool,
    pub end_device_capacity: bool,
    pub update_id: u8,
    pub rx_on_when_idle: bool,
}

/// Association request towards a chosen parent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociateRequest {
    pub parent: ShortAddr,
    pub parent_ext: ExtAddr,
    pub pan_id: PanId,
    pub channel: u8,
    pub capability: Capability,
}

/// MAC/radio collaborator
///
/// Transmissions are asynchronous: `send_frame` only queues the frame and
/// the outcome arrives later as [`crate::NwkEvent::SendConfirmed`].
pub trait MacService: Send {
    /// Queue a frame for the one-hop MAC destination
    fn send_frame(&mut self, dst: ShortAddr, payload: Bytes) -> Result<MacHandle, MacError>;

    /// Start an active scan; beacons arrive as events
    fn start_active_scan(&mut self, channels: u32, duration: u8) -> Result<(), MacError>;

    /// Associate with a parent; the outcome arrives as an event
    fn associate(&mut self, request: AssociateRequest) -> Result<(), MacError>;

    /// Answer an association indication from a joining device
    fn associate_response(
        &mut self,
        device: ExtAddr,
        short_addr: ShortAddr,
        status: NwkStatus,
    ) -> Result<(), MacError>;

    /// Apply network parameters (address, PAN, channel, beacon contents)
    fn configure(&mut self, params: &MacNetworkParams) -> Result<(), MacError>;

    /// Return the MAC to its power-on state
    fn reset(&mut self);
}

/// Frame protection collaborator
pub trait SecurityService: Send {
    /// Encrypt and authenticate `payload`, advancing the outgoing frame
    /// counter
    fn protect(&mut self, header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError>;

    /// Authenticate and decrypt `payload`, validating the sender's frame
    /// counter
    fn unprotect(&mut self, header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError>;

    /// Current outgoing frame counter
    fn frame_counter(&self) -> u32;
}

/// Persistent storage for table snapshots
pub trait PersistentStore: Send {
    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError>;

    /// `Ok(None)` on a cold start
    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError>;

    fn clear(&mut self) -> Result<(), StorageError>;
}

/// Time source
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Receiver of indications and confirms produced by the network layer
pub trait IndicationSink: Send {
    fn deliver(&mut self, indication: NwkIndication);
}

impl IndicationSink for Vec<NwkIndication> {
    fn deliver(&mut self, indication: NwkIndication) {
        self.push(indication);
    }
}

impl IndicationSink for tokio::sync::mpsc::UnboundedSender<NwkIndication> {
    fn deliver(&mut self, indication: NwkIndication) {
        // A closed receiver means nobody is listening any more
        let _ = self.send(indication);
    }
}

/// Security disabled: frames pass through untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct NoSecurity;

impl SecurityService for NoSecurity {
    fn protect(&mut self, _header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError> {
        Ok(payload)
    }

    fn unprotect(&mut self, _header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError> {
        Ok(payload)
    }

    fn frame_counter(&self) -> u32 {
        0
    }
}
