//! Network-layer addressing
//!
//! Devices carry two identities: a 16-bit short address assigned when they
//! join a network, and a globally unique 64-bit extended (IEEE) address.
//! The short address space reserves `0xFFF8..=0xFFFF` for broadcasts.

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// 16-bit network (short) address
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[display("{_0:#06x}")]
pub struct ShortAddr(pub u16);

impl ShortAddr {
    /// The coordinator always owns address zero
    pub const COORDINATOR: ShortAddr = ShortAddr(0x0000);
    /// All devices in the PAN
    pub const BROADCAST_ALL: ShortAddr = ShortAddr(0xFFFF);
    /// Reserved, also used as "no address assigned"
    pub const UNASSIGNED: ShortAddr = ShortAddr(0xFFFE);
    /// Devices with `macRxOnWhenIdle = true`
    pub const BROADCAST_RX_ON_WHEN_IDLE: ShortAddr = ShortAddr(0xFFFD);
    /// Routers and the coordinator
    pub const BROADCAST_ROUTERS: ShortAddr = ShortAddr(0xFFFC);
    /// Low-power routers only
    pub const BROADCAST_LOW_POWER_ROUTERS: ShortAddr = ShortAddr(0xFFFB);

    /// Highest address that may be handed to a device
    pub const MAX_UNICAST: u16 = 0xFFF7;

    /// True for any address in the broadcast range
    pub fn is_broadcast(self) -> bool {
        self.0 >= 0xFFF8 && self != Self::UNASSIGNED
    }

    /// True when the address can identify a single device
    pub fn is_unicast(self) -> bool {
        self.0 <= Self::MAX_UNICAST
    }

    /// Broadcast class of this address, if it is one
    pub fn broadcast_class(self) -> Option<BroadcastClass> {
        match self.0 {
            0xFFFF => Some(BroadcastClass::AllDevices),
            0xFFFD => Some(BroadcastClass::RxOnWhenIdle),
            0xFFFC => Some(BroadcastClass::RoutersAndCoordinator),
            0xFFFB => Some(BroadcastClass::LowPowerRouters),
            _ => None,
        }
    }

    pub fn to_le_bytes(self) -> [u8; 2] {
        self.0.to_le_bytes()
    }
}

impl From<u16> for ShortAddr {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

/// 64-bit IEEE extended address
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ExtAddr(pub u64);

impl ExtAddr {
    /// All-zero address, treated as unknown
    pub const UNKNOWN: ExtAddr = ExtAddr(0);

    pub fn is_unknown(self) -> bool {
        self.0 == 0 || self.0 == u64::MAX
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_le_bytes(bytes))
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }
}

impl std::fmt::Display for ExtAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0.to_be_bytes();
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

impl From<u64> for ExtAddr {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// 16-bit PAN identifier
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[display("{_0:#06x}")]
pub struct PanId(pub u16);

/// 64-bit extended PAN identifier
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[display("{_0:#018x}")]
pub struct ExtPanId(pub u64);

/// Which devices a broadcast is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastClass {
    AllDevices,
    RxOnWhenIdle,
    RoutersAndCoordinator,
    LowPowerRouters,
}

impl BroadcastClass {
    /// Whether a device with the given properties should accept the broadcast
    pub fn includes(self, device_type: DeviceType, rx_on_when_idle: bool) -> bool {
        match self {
            Self::AllDevices => true,
            Self::RxOnWhenIdle => rx_on_when_idle,
            Self::RoutersAndCoordinator | Self::LowPowerRouters => {
                device_type != DeviceType::EndDevice
            }
        }
    }
}

/// Role of a device in the network
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    #[display("coordinator")]
    Coordinator,
    #[display("router")]
    Router,
    #[display("end-device")]
    EndDevice,
}

impl DeviceType {
    pub fn is_router_capable(self) -> bool {
        !matches!(self, Self::EndDevice)
    }
}

/// MAC capability information byte sent during association and rejoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capability(pub u8);

impl Capability {
    const DEVICE_TYPE_FFD: u8 = 0x02;
    const MAINS_POWERED: u8 = 0x04;
    const RX_ON_WHEN_IDLE: u8 = 0x08;
    const SECURITY: u8 = 0x40;
    const ALLOCATE_ADDRESS: u8 = 0x80;

    /// Capability for a device of the given type
    pub fn for_device(device_type: DeviceType, rx_on_when_idle: bool) -> Self {
        let mut bits = Self::ALLOCATE_ADDRESS;
        if device_type.is_router_capable() {
            bits |= Self::DEVICE_TYPE_FFD | Self::MAINS_POWERED;
        }
        if rx_on_when_idle || device_type.is_router_capable() {
            bits |= Self::RX_ON_WHEN_IDLE;
        }
        Self(bits)
    }

    pub fn is_router(self) -> bool {
        self.0 & Self::DEVICE_TYPE_FFD != 0
    }

    pub fn rx_on_when_idle(self) -> bool {
        self.0 & Self::RX_ON_WHEN_IDLE != 0
    }

    pub fn mains_powered(self) -> bool {
        self.0 & Self::MAINS_POWERED != 0
    }

    pub fn security_capable(self) -> bool {
        self.0 & Self::SECURITY != 0
    }

    pub fn device_type(self) -> DeviceType {
        if self.is_router() {
            DeviceType::Router
        } else {
            DeviceType::EndDevice
        }
    }
}
