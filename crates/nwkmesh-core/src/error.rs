//! Error types for the network layer

use derive_more::Display;
use thiserror::Error;

use crate::status::NwkStatus;

/// Top-level error type for network-layer operations
#[derive(Debug, Error)]
pub enum NwkError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Table error: {0}")]
    Table(#[from] TableError),

    #[error("MAC error: {0}")]
    Mac(#[from] MacError),

    #[error("Security error: {0}")]
    Security(#[from] SecurityError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("NIB error: {0}")]
    Nib(#[from] NibError),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    #[error("Request not valid in current state: {0}")]
    InvalidRequest(&'static str),

    #[error("Operation not permitted: {0}")]
    NotPermitted(&'static str),

    #[error("Unknown device")]
    UnknownDevice,

    #[error("No networks found")]
    NoNetworks,

    #[error("Route discovery failed")]
    RouteDiscoveryFailed,

    #[error("Route error")]
    RouteError,

    #[error("Frame not buffered")]
    FrameNotBuffered,
}

impl NwkError {
    /// Map the error onto the status code reported to upper layers
    pub fn status(&self) -> NwkStatus {
        match self {
            Self::Codec(_) => NwkStatus::InvalidParameter,
            Self::Table(e) => e.status(),
            Self::Mac(_) => NwkStatus::RouteError,
            Self::Security(e) => e.status(),
            Self::Storage(_) => NwkStatus::StartupFailure,
            Self::Nib(e) => e.status(),
            Self::InvalidParameter(_) => NwkStatus::InvalidParameter,
            Self::InvalidRequest(_) => NwkStatus::InvalidRequest,
            Self::NotPermitted(_) => NwkStatus::NotPermitted,
            Self::UnknownDevice => NwkStatus::UnknownDevice,
            Self::NoNetworks => NwkStatus::NoNetworks,
            Self::RouteDiscoveryFailed => NwkStatus::RouteDiscoveryFailed,
            Self::RouteError => NwkStatus::RouteError,
            Self::FrameNotBuffered => NwkStatus::FrameNotBuffered,
        }
    }
}

/// Errors raised while encoding or decoding frames
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Frame truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    #[error("Unknown command id: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Invalid {0}: {1:#04x}")]
    InvalidField(&'static str, u8),

    #[error("Malformed {command} command: {reason}")]
    MalformedCommand {
        command: &'static str,
        reason: &'static str,
    },

    #[error("Frame too long: {0} bytes")]
    TooLong(usize),
}

/// The fixed-capacity table an error concerns
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    #[display("neighbor")]
    Neighbor,
    #[display("routing")]
    Routing,
    #[display("route discovery")]
    RouteDiscovery,
    #[display("route record")]
    RouteRecord,
    #[display("broadcast")]
    Broadcast,
    #[display("address map")]
    AddressMap,
    /// The pool of short addresses a parent hands out
    #[display("address")]
    AddressPool,
}

/// Errors from the fixed-capacity tables
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TableError {
    #[error("{table} table is full")]
    NoCapacity { table: TableKind },

    #[error("Entry not found in {table} table")]
    NotFound { table: TableKind },

    #[error("Link quality {lqi} below admission threshold {threshold}")]
    InsufficientLqi { lqi: u8, threshold: u8 },

    #[error("Entry already present")]
    AlreadyPresent,

    #[error("Stale handle")]
    StaleHandle,
}

impl TableError {
    pub fn status(&self) -> NwkStatus {
        match self {
            Self::NoCapacity { table } => match table {
                TableKind::Neighbor => NwkStatus::NeighborTableFull,
                TableKind::Broadcast => NwkStatus::BroadcastTableFull,
                TableKind::Routing
                | TableKind::RouteDiscovery
                | TableKind::RouteRecord
                | TableKind::AddressMap
                | TableKind::AddressPool => NwkStatus::NoRoutingCapacity,
            },
            Self::NotFound { .. } => NwkStatus::UnknownDevice,
            Self::InsufficientLqi { .. } => NwkStatus::NotPermitted,
            Self::AlreadyPresent => NwkStatus::AlreadyPresent,
            Self::StaleHandle => NwkStatus::InvalidParameter,
        }
    }
}

/// Errors reported by the MAC collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacError {
    #[error("MAC transmit queue full")]
    QueueFull,

    #[error("MAC not ready: {0}")]
    NotReady(String),

    #[error("Frame too long for MAC: {0} bytes")]
    FrameTooLong(usize),
}

/// Errors reported by the security collaborator
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("Frame authentication failed")]
    AuthFailure,

    #[error("Outgoing frame counter exhausted")]
    MaxFrameCounter,

    #[error("No key available")]
    NoKey,

    #[error("Bad CCM output")]
    BadCcmOutput,

    #[error("Replayed frame counter {0}")]
    Replay(u32),
}

impl SecurityError {
    pub fn status(&self) -> NwkStatus {
        match self {
            Self::AuthFailure | Self::Replay(_) => NwkStatus::DecryptError,
            Self::MaxFrameCounter => NwkStatus::MaxFrameCounter,
            Self::NoKey => NwkStatus::NoKey,
            Self::BadCcmOutput => NwkStatus::BadCcmOutput,
        }
    }
}

/// Errors related to persistent storage
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Errors from NIB get/set
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NibError {
    #[error("Unsupported attribute {0:#04x}")]
    UnsupportedAttribute(u8),

    #[error("Attribute {0:#04x} is read-only")]
    ReadOnly(u8),

    #[error("Invalid value for attribute {0:#04x}")]
    InvalidValue(u8),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

impl NibError {
    pub fn status(&self) -> NwkStatus {
        match self {
            Self::UnsupportedAttribute(_) => NwkStatus::UnsupportedAttribute,
            Self::ReadOnly(_) => NwkStatus::InvalidRequest,
            Self::InvalidValue(_) | Self::InvalidConfig(_) => NwkStatus::InvalidParameter,
        }
    }
}

/// Result type for network-layer operations
pub type NwkResult<T> = Result<T, NwkError>;

/// Result type for codec operations
pub type CodecResult<T> = Result<T, CodecError>;
