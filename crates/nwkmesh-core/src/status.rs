//! Status codes surfaced to upper layers and carried in network-status
//! command frames

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Result status of a network-layer primitive
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NwkStatus {
    #[display("success")]
    Success = 0x00,
    #[display("address conflict")]
    AddressConflict = 0x01,
    #[display("invalid parameter")]
    InvalidParameter = 0xC1,
    #[display("invalid request")]
    InvalidRequest = 0xC2,
    #[display("not permitted")]
    NotPermitted = 0xC3,
    #[display("startup failure")]
    StartupFailure = 0xC4,
    #[display("already present")]
    AlreadyPresent = 0xC5,
    #[display("sync failure")]
    SyncFailure = 0xC6,
    #[display("neighbor table full")]
    NeighborTableFull = 0xC7,
    #[display("unknown device")]
    UnknownDevice = 0xC8,
    #[display("unsupported attribute")]
    UnsupportedAttribute = 0xC9,
    #[display("no networks")]
    NoNetworks = 0xCA,
    #[display("max frame counter")]
    MaxFrameCounter = 0xCC,
    #[display("no key")]
    NoKey = 0xCD,
    #[display("bad CCM output")]
    BadCcmOutput = 0xCE,
    #[display("no routing capacity")]
    NoRoutingCapacity = 0xCF,
    #[display("route discovery failed")]
    RouteDiscoveryFailed = 0xD0,
    #[display("route error")]
    RouteError = 0xD1,
    #[display("broadcast table full")]
    BroadcastTableFull = 0xD2,
    #[display("frame not buffered")]
    FrameNotBuffered = 0xD3,
    #[display("decrypt error")]
    DecryptError = 0xD4,
}

impl NwkStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl TryFrom<u8> for NwkStatus {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Success,
            0x01 => Self::AddressConflict,
            0xC1 => Self::InvalidParameter,
            0xC2 => Self::InvalidRequest,
            0xC3 => Self::NotPermitted,
            0xC4 => Self::StartupFailure,
            0xC5 => Self::AlreadyPresent,
            0xC6 => Self::SyncFailure,
            0xC7 => Self::NeighborTableFull,
            0xC8 => Self::UnknownDevice,
            0xC9 => Self::UnsupportedAttribute,
            0xCA => Self::NoNetworks,
            0xCC => Self::MaxFrameCounter,
            0xCD => Self::NoKey,
            0xCE => Self::BadCcmOutput,
            0xCF => Self::NoRoutingCapacity,
            0xD0 => Self::RouteDiscoveryFailed,
            0xD1 => Self::RouteError,
            0xD2 => Self::BroadcastTableFull,
            0xD3 => Self::FrameNotBuffered,
            0xD4 => Self::DecryptError,
            other => return Err(CodecError::InvalidField("nwk status", other)),
        })
    }
}

/// Status code carried by the network-status command
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum NetworkStatusCode {
    NoRouteAvailable = 0x00,
    TreeLinkFailure = 0x01,
    NonTreeLinkFailure = 0x02,
    LowBatteryLevel = 0x03,
    NoRoutingCapacity = 0x04,
    NoIndirectCapacity = 0x05,
    IndirectTransactionExpiry = 0x06,
    TargetDeviceUnavailable = 0x07,
    TargetAddressUnallocated = 0x08,
    ParentLinkFailure = 0x09,
    ValidateRoute = 0x0A,
    SourceRouteFailure = 0x0B,
    ManyToOneRouteFailure = 0x0C,
    AddressConflict = 0x0D,
    VerifyAddress = 0x0E,
    PanIdentifierUpdate = 0x0F,
    NetworkAddressUpdate = 0x10,
    BadFrameCounter = 0x11,
    BadKeySequenceNumber = 0x12,
}

impl NetworkStatusCode {
    /// Codes that mean the reported destination can no longer be reached
    /// through the current next hop
    pub fn is_route_failure(self) -> bool {
        matches!(
            self,
            Self::NoRouteAvailable
                | Self::TreeLinkFailure
                | Self::NonTreeLinkFailure
                | Self::SourceRouteFailure
                | Self::ManyToOneRouteFailure
                | Self::TargetDeviceUnavailable
        )
    }
}

impl TryFrom<u8> for NetworkStatusCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::NoRouteAvailable,
            0x01 => Self::TreeLinkFailure,
            0x02 => Self::NonTreeLinkFailure,
            0x03 => Self::LowBatteryLevel,
            0x04 => Self::NoRoutingCapacity,
            0x05 => Self::NoIndirectCapacity,
            0x06 => Self::IndirectTransactionExpiry,
            0x07 => Self::TargetDeviceUnavailable,
            0x08 => Self::TargetAddressUnallocated,
            0x09 => Self::ParentLinkFailure,
            0x0A => Self::ValidateRoute,
            0x0B => Self::SourceRouteFailure,
            0x0C => Self::ManyToOneRouteFailure,
            0x0D => Self::AddressConflict,
            0x0E => Self::VerifyAddress,
            0x0F => Self::PanIdentifierUpdate,
            0x10 => Self::NetworkAddressUpdate,
            0x11 => Self::BadFrameCounter,
            0x12 => Self::BadKeySequenceNumber,
            other => return Err(CodecError::InvalidField("network status code", other)),
        })
    }
}

/// Status reported by the MAC collaborator for a transmission
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MacStatus {
    #[display("success")]
    Success,
    #[display("no ack")]
    NoAck,
    #[display("channel access failure")]
    ChannelAccessFailure,
    #[display("transaction expired")]
    TransactionExpired,
    #[display("transaction overflow")]
    TransactionOverflow,
}

impl MacStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_byte_values() {
        assert_eq!(NwkStatus::RouteDiscoveryFailed as u8, 0xD0);
        assert_eq!(NwkStatus::try_from(0xD2).unwrap(), NwkStatus::BroadcastTableFull);
        assert!(NwkStatus::try_from(0xCB).is_err());
    }

    #[test]
    fn test_network_status_codes() {
        assert_eq!(
            NetworkStatusCode::try_from(0x0D).unwrap(),
            NetworkStatusCode::AddressConflict
        );
        assert!(NetworkStatusCode::NoRouteAvailable.is_route_failure());
        assert!(!NetworkStatusCode::AddressConflict.is_route_failure());
        assert!(NetworkStatusCode::try_from(0x13).is_err());
    }
}
