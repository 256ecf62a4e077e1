//! Network information base attribute identifiers and values

use serde::{Deserialize, Serialize};

use crate::address::{ExtAddr, ExtPanId, PanId, ShortAddr};
use crate::error::NibError;

/// NIB attribute identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NibAttribute {
    PanId = 0x80,
    SequenceNumber = 0x81,
    PassiveAckTimeout = 0x82,
    MaxBroadcastRetries = 0x83,
    MaxChildren = 0x84,
    MaxDepth = 0x85,
    MaxRouters = 0x86,
    BroadcastDeliveryTime = 0x88,
    ReportConstantCost = 0x89,
    RouteDiscoveryRetriesPermitted = 0x8A,
    SymLink = 0x8E,
    AddrAlloc = 0x90,
    UseTreeRouting = 0x91,
    ManagerAddr = 0x92,
    MaxSourceRoute = 0x93,
    UpdateId = 0x94,
    TransactionPersistenceTime = 0x95,
    NetworkAddress = 0x96,
    StackProfile = 0x97,
    ExtendedPanId = 0x9A,
    UseMulticast = 0x9B,
    IsConcentrator = 0x9D,
    ConcentratorRadius = 0x9E,
    ConcentratorDiscoveryTime = 0x9F,
    SecurityLevel = 0xA0,
    AllFresh = 0xA3,
    SecureAllFrames = 0xA5,
    LinkStatusPeriod = 0xA6,
    RouterAgeLimit = 0xA7,
    UniqueAddr = 0xA8,
    LeaveRequestAllowed = 0xAA,
    EndDeviceTimeoutDefault = 0xAC,
    IeeeAddress = 0xAE,
}

impl NibAttribute {
    /// Attributes that only the stack itself may change
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::NetworkAddress | Self::IeeeAddress)
    }
}

impl TryFrom<u8> for NibAttribute {
    type Error = NibError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x80 => Self::PanId,
            0x81 => Self::SequenceNumber,
            0x82 => Self::PassiveAckTimeout,
            0x83 => Self::MaxBroadcastRetries,
            0x84 => Self::MaxChildren,
            0x85 => Self::MaxDepth,
            0x86 => Self::MaxRouters,
            0x88 => Self::BroadcastDeliveryTime,
            0x89 => Self::ReportConstantCost,
            0x8A => Self::RouteDiscoveryRetriesPermitted,
            0x8E => Self::SymLink,
            0x90 => Self::AddrAlloc,
            0x91 => Self::UseTreeRouting,
            0x92 => Self::ManagerAddr,
            0x93 => Self::MaxSourceRoute,
            0x94 => Self::UpdateId,
            0x95 => Self::TransactionPersistenceTime,
            0x96 => Self::NetworkAddress,
            0x97 => Self::StackProfile,
            0x9A => Self::ExtendedPanId,
            0x9B => Self::UseMulticast,
            0x9D => Self::IsConcentrator,
            0x9E => Self::ConcentratorRadius,
            0x9F => Self::ConcentratorDiscoveryTime,
            0xA0 => Self::SecurityLevel,
            0xA3 => Self::AllFresh,
            0xA5 => Self::SecureAllFrames,
            0xA6 => Self::LinkStatusPeriod,
            0xA7 => Self::RouterAgeLimit,
            0xA8 => Self::UniqueAddr,
            0xAA => Self::LeaveRequestAllowed,
            0xAC => Self::EndDeviceTimeoutDefault,
            0xAE => Self::IeeeAddress,
            other => return Err(NibError::UnsupportedAttribute(other)),
        })
    }
}

/// Value of a NIB attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NibValue {
    Bool(bool),
    U8(u8),
    U16(u16),
    U32(u32),
    Short(ShortAddr),
    Pan(PanId),
    ExtPan(ExtPanId),
    Ext(ExtAddr),
}

impl NibValue {
    pub fn as_bool(self) -> Option<bool> {
        match self {
            Self::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_u8(self) -> Option<u8> {
        match self {
            Self::U8(v) => Some(v),
            _ => None,
        }
    }

    /// Widening read of any integer value
    pub fn as_u32(self) -> Option<u32> {
        match self {
            Self::U8(v) => Some(v as u32),
            Self::U16(v) => Some(v as u32),
            Self::U32(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_ids() {
        assert_eq!(NibAttribute::try_from(0x82).unwrap(), NibAttribute::PassiveAckTimeout);
        assert_eq!(NibAttribute::LinkStatusPeriod as u8, 0xA6);
        assert_eq!(
            NibAttribute::try_from(0x87).unwrap_err(),
            NibError::UnsupportedAttribute(0x87)
        );
    }

    #[test]
    fn test_value_widening() {
        assert_eq!(NibValue::U8(3).as_u32(), Some(3));
        assert_eq!(NibValue::U16(500).as_u32(), Some(500));
        assert_eq!(NibValue::Bool(true).as_u32(), None);
    }
}
