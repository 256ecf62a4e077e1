//! # nwkmesh core
//!
//! Shared building blocks of the mesh network layer.
//!
//! - [`address`]: short/extended addresses, broadcast classes, capability
//! - [`status`]: status codes reported to upper layers and peers
//! - [`error`]: error taxonomy with status mapping
//! - [`arena`]: generation-checked fixed-capacity slot arena
//! - [`frame`]: NWK header codec
//! - [`command`]: NWK command codec
//! - [`nib`]: NIB attribute ids and values
//! - [`event`]: events consumed and indications produced by the layer
//! - [`traits`]: MAC, security, storage, clock and indication collaborators
//! - [`mock`]: in-memory collaborators for tests and simulation

pub mod address;
pub mod arena;
pub mod command;
pub mod error;
pub mod event;
pub mod frame;
pub mod mock;
pub mod nib;
pub mod status;
pub mod traits;

pub use address::{
    BroadcastClass, Capability, DeviceType, ExtAddr, ExtPanId, PanId, ShortAddr,
};
pub use arena::{Handle, SlotArena};
pub use command::{
    CommandId, EndDeviceTimeoutRequest, EndDeviceTimeoutResponse, Leave, LinkStatus,
    LinkStatusEntry, ManyToOne, NetworkReport, NetworkStatus, NetworkUpdate, NwkCommand,
    RejoinRequest, RejoinResponse, RouteRecord, RouteReply, RouteRequest,
    end_device_timeout_secs,
};
pub use error::{
    CodecError, CodecResult, MacError, NibError, NwkError, NwkResult, SecurityError,
    StorageError, TableError, TableKind,
};
pub use event::{
    AddrMode, BeaconInfo, DataIndication, DataRequest, JoinMethod, LeaveRequest,
    NetworkDescriptor, NwkEvent, NwkIndication, NwkRequest, ReceivedFrame, RouteDiscoveryMode,
};
pub use frame::{FrameType, MulticastControl, NwkFrame, NwkHeader, SourceRoute};
pub use mock::{MemoryStore, MockClock, MockMac, MockSecurity, SentFrame};
pub use nib::{NibAttribute, NibValue};
pub use status::{MacStatus, NetworkStatusCode, NwkStatus};
pub use traits::{
    AssociateRequest, Clock, IndicationSink, MacHandle, MacNetworkParams, MacService,
    NoSecurity, PersistentStore, SecurityService, SystemClock,
};
