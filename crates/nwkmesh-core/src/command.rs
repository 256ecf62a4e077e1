//! # NWK Command Codec
//!
//! Every command frame payload starts with a one-byte command identifier
//! followed by a fixed layout per command. Decoding checks the minimum
//! length of each variant and rejects anything that does not fit with
//! [`CodecError::MalformedCommand`], so a corrupt frame is dropped rather
//! than partially applied.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::address::{Capability, ExtAddr, ExtPanId, PanId, ShortAddr};
use crate::error::{CodecError, CodecResult};
use crate::status::{NetworkStatusCode, NwkStatus};

/// Largest requested-timeout enumeration an end device may ask for
pub const MAX_REQUESTED_TIMEOUT: u8 = 14;

/// Upper bound of link status entries in one command
pub const MAX_LINK_STATUS_ENTRIES: usize = 31;

/// NWK command identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CommandId {
    RouteRequest = 0x01,
    RouteReply = 0x02,
    NetworkStatus = 0x03,
    Leave = 0x04,
    RouteRecord = 0x05,
    RejoinRequest = 0x06,
    RejoinResponse = 0x07,
    LinkStatus = 0x08,
    NetworkReport = 0x09,
    NetworkUpdate = 0x0A,
    EndDeviceTimeoutRequest = 0x0B,
    EndDeviceTimeoutResponse = 0x0C,
}

impl CommandId {
    pub fn name(self) -> &'static str {
        match self {
            Self::RouteRequest => "route-request",
            Self::RouteReply => "route-reply",
            Self::NetworkStatus => "network-status",
            Self::Leave => "leave",
            Self::RouteRecord => "route-record",
            Self::RejoinRequest => "rejoin-request",
            Self::RejoinResponse => "rejoin-response",
            Self::LinkStatus => "link-status",
            Self::NetworkReport => "network-report",
            Self::NetworkUpdate => "network-update",
            Self::EndDeviceTimeoutRequest => "end-device-timeout-request",
            Self::EndDeviceTimeoutResponse => "end-device-timeout-response",
        }
    }
}

impl TryFrom<u8> for CommandId {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::RouteRequest,
            0x02 => Self::RouteReply,
            0x03 => Self::NetworkStatus,
            0x04 => Self::Leave,
            0x05 => Self::RouteRecord,
            0x06 => Self::RejoinRequest,
            0x07 => Self::RejoinResponse,
            0x08 => Self::LinkStatus,
            0x09 => Self::NetworkReport,
            0x0A => Self::NetworkUpdate,
            0x0B => Self::EndDeviceTimeoutRequest,
            0x0C => Self::EndDeviceTimeoutResponse,
            other => return Err(CodecError::UnknownCommand(other)),
        })
    }
}

/// Many-to-one sub-field of a route request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ManyToOne {
    #[default]
    No,
    /// Concentrator keeps a route record table
    WithRouteRecord,
    /// Concentrator has no route record table
    WithoutRouteRecord,
}

impl ManyToOne {
    pub fn is_many_to_one(self) -> bool {
        self != Self::No
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub many_to_one: ManyToOne,
    pub multicast: bool,
    pub rreq_id: u8,
    pub dst: ShortAddr,
    pub path_cost: u8,
    pub dst_ieee: Option<ExtAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteReply {
    pub multicast: bool,
    pub rreq_id: u8,
    pub originator: ShortAddr,
    pub responder: ShortAddr,
    pub path_cost: u8,
    pub originator_ieee: Option<ExtAddr>,
    pub responder_ieee: Option<ExtAddr>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkStatus {
    pub code: NetworkStatusCode,
    pub dst: ShortAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Leave {
    pub rejoin: bool,
    /// Set when the frame asks the receiver to leave; clear when the
    /// sender announces its own departure
    pub request: bool,
    pub remove_children: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub relays: Vec<ShortAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinRequest {
    pub capability: Capability,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RejoinResponse {
    pub short_addr: ShortAddr,
    pub status: NwkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatusEntry {
    pub addr: ShortAddr,
    pub incoming_cost: u8,
    pub outgoing_cost: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub first_frame: bool,
    pub last_frame: bool,
    pub entries: Vec<LinkStatusEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkReport {
    /// 0 = PAN identifier conflict
    pub report_type: u8,
    pub ext_pan_id: ExtPanId,
    pub pan_ids: Vec<PanId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkUpdate {
    /// 0 = PAN identifier update
    pub update_type: u8,
    pub ext_pan_id: ExtPanId,
    pub update_id: u8,
    pub pan_ids: Vec<PanId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndDeviceTimeoutRequest {
    pub requested_timeout: u8,
    pub end_device_config: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndDeviceTimeoutResponse {
    /// 0 success, 1 incorrect value
    pub status: u8,
    pub parent_info: u8,
}

/// Timeout in seconds for a requested-timeout enumeration value
///
/// 0 means 10 seconds, any other `n` means `2^n` minutes.
pub fn end_device_timeout_secs(requested: u8) -> u32 {
    if requested == 0 {
        10
    } else {
        (1u32 << requested.min(MAX_REQUESTED_TIMEOUT)) * 60
    }
}

/// The closed set of NWK commands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NwkCommand {
    RouteRequest(RouteRequest),
    RouteReply(RouteReply),
    NetworkStatus(NetworkStatus),
    Leave(Leave),
    RouteRecord(RouteRecord),
    RejoinRequest(RejoinRequest),
    RejoinResponse(RejoinResponse),
    LinkStatus(LinkStatus),
    NetworkReport(NetworkReport),
    NetworkUpdate(NetworkUpdate),
    EndDeviceTimeoutRequest(EndDeviceTimeoutRequest),
    EndDeviceTimeoutResponse(EndDeviceTimeoutResponse),
}

impl NwkCommand {
    pub fn id(&self) -> CommandId {
        match self {
            Self::RouteRequest(_) => CommandId::RouteRequest,
            Self::RouteReply(_) => CommandId::RouteReply,
            Self::NetworkStatus(_) => CommandId::NetworkStatus,
            Self::Leave(_) => CommandId::Leave,
            Self::RouteRecord(_) => CommandId::RouteRecord,
            Self::RejoinRequest(_) => CommandId::RejoinRequest,
            Self::RejoinResponse(_) => CommandId::RejoinResponse,
            Self::LinkStatus(_) => CommandId::LinkStatus,
            Self::NetworkReport(_) => CommandId::NetworkReport,
            Self::NetworkUpdate(_) => CommandId::NetworkUpdate,
            Self::EndDeviceTimeoutRequest(_) => CommandId::EndDeviceTimeoutRequest,
            Self::EndDeviceTimeoutResponse(_) => CommandId::EndDeviceTimeoutResponse,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(24);
        buf.put_u8(self.id() as u8);

        match self {
            Self::RouteRequest(cmd) => {
                let m2o: u8 = match cmd.many_to_one {
                    ManyToOne::No => 0,
                    ManyToOne::WithRouteRecord => 1,
                    ManyToOne::WithoutRouteRecord => 2,
                };
                let mut options = m2o << 3;
                if cmd.dst_ieee.is_some() {
                    options |= 1 << 5;
                }
                if cmd.multicast {
                    options |= 1 << 6;
                }
                buf.put_u8(options);
                buf.put_u8(cmd.rreq_id);
                buf.put_u16_le(cmd.dst.0);
                buf.put_u8(cmd.path_cost);
                if let Some(ieee) = cmd.dst_ieee {
                    buf.put_u64_le(ieee.0);
                }
            }
            Self::RouteReply(cmd) => {
                let mut options = 0u8;
                if cmd.originator_ieee.is_some() {
                    options |= 1 << 4;
                }
                if cmd.responder_ieee.is_some() {
                    options |= 1 << 5;
                }
                if cmd.multicast {
                    options |= 1 << 6;
                }
                buf.put_u8(options);
                buf.put_u8(cmd.rreq_id);
                buf.put_u16_le(cmd.originator.0);
                buf.put_u16_le(cmd.responder.0);
                buf.put_u8(cmd.path_cost);
                if let Some(ieee) = cmd.originator_ieee {
                    buf.put_u64_le(ieee.0);
                }
                if let Some(ieee) = cmd.responder_ieee {
                    buf.put_u64_le(ieee.0);
                }
            }
            Self::NetworkStatus(cmd) => {
                buf.put_u8(cmd.code as u8);
                buf.put_u16_le(cmd.dst.0);
            }
            Self::Leave(cmd) => {
                let mut options = 0u8;
                if cmd.rejoin {
                    options |= 1 << 5;
                }
                if cmd.request {
                    options |= 1 << 6;
                }
                if cmd.remove_children {
                    options |= 1 << 7;
                }
                buf.put_u8(options);
            }
            Self::RouteRecord(cmd) => {
                buf.put_u8(cmd.relays.len() as u8);
                for relay in &cmd.relays {
                    buf.put_u16_le(relay.0);
                }
            }
            Self::RejoinRequest(cmd) => buf.put_u8(cmd.capability.0),
            Self::RejoinResponse(cmd) => {
                buf.put_u16_le(cmd.short_addr.0);
                buf.put_u8(cmd.status as u8);
            }
            Self::LinkStatus(cmd) => {
                let mut options = cmd.entries.len().min(MAX_LINK_STATUS_ENTRIES) as u8;
                if cmd.first_frame {
                    options |= 1 << 5;
                }
                if cmd.last_frame {
                    options |= 1 << 6;
                }
                buf.put_u8(options);
                for entry in cmd.entries.iter().take(MAX_LINK_STATUS_ENTRIES) {
                    buf.put_u16_le(entry.addr.0);
                    buf.put_u8((entry.incoming_cost & 0x07) | ((entry.outgoing_cost & 0x07) << 4));
                }
            }
            Self::NetworkReport(cmd) => {
                buf.put_u8(((cmd.report_type & 0x07) << 5) | (cmd.pan_ids.len() as u8 & 0x1F));
                buf.put_u64_le(cmd.ext_pan_id.0);
                for pan in cmd.pan_ids.iter().take(0x1F) {
                    buf.put_u16_le(pan.0);
                }
            }
            Self::NetworkUpdate(cmd) => {
                buf.put_u8(((cmd.update_type & 0x07) << 5) | (cmd.pan_ids.len() as u8 & 0x1F));
                buf.put_u64_le(cmd.ext_pan_id.0);
                buf.put_u8(cmd.update_id);
                for pan in cmd.pan_ids.iter().take(0x1F) {
                    buf.put_u16_le(pan.0);
                }
            }
            Self::EndDeviceTimeoutRequest(cmd) => {
                buf.put_u8(cmd.requested_timeout);
                buf.put_u8(cmd.end_device_config);
            }
            Self::EndDeviceTimeoutResponse(cmd) => {
                buf.put_u8(cmd.status);
                buf.put_u8(cmd.parent_info);
            }
        }

        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> CodecResult<Self> {
        if buf.is_empty() {
            return Err(CodecError::Truncated {
                needed: 1,
                available: 0,
            });
        }
        let id = CommandId::try_from(buf.get_u8())?;
        let mut r = Reader { buf: &mut buf, id };

        let cmd = match id {
            CommandId::RouteRequest => {
                let options = r.u8()?;
                let many_to_one = match (options >> 3) & 0x03 {
                    0 => ManyToOne::No,
                    1 => ManyToOne::WithRouteRecord,
                    2 => ManyToOne::WithoutRouteRecord,
                    _ => return Err(r.malformed("reserved many-to-one value")),
                };
                let rreq_id = r.u8()?;
                let dst = r.addr()?;
                let path_cost = r.u8()?;
                let dst_ieee = if options & (1 << 5) != 0 {
                    Some(r.ieee()?)
                } else {
                    None
                };
                Self::RouteRequest(RouteRequest {
                    many_to_one,
                    multicast: options & (1 << 6) != 0,
                    rreq_id,
                    dst,
                    path_cost,
                    dst_ieee,
                })
            }
            CommandId::RouteReply => {
                let options = r.u8()?;
                let rreq_id = r.u8()?;
                let originator = r.addr()?;
                let responder = r.addr()?;
                let path_cost = r.u8()?;
                let originator_ieee = if options & (1 << 4) != 0 {
                    Some(r.ieee()?)
                } else {
                    None
                };
                let responder_ieee = if options & (1 << 5) != 0 {
                    Some(r.ieee()?)
                } else {
                    None
                };
                Self::RouteReply(RouteReply {
                    multicast: options & (1 << 6) != 0,
                    rreq_id,
                    originator,
                    responder,
                    path_cost,
                    originator_ieee,
                    responder_ieee,
                })
            }
            CommandId::NetworkStatus => {
                let code = NetworkStatusCode::try_from(r.u8()?)
                    .map_err(|_| r.malformed("unknown status code"))?;
                let dst = r.addr()?;
                Self::NetworkStatus(NetworkStatus { code, dst })
            }
            CommandId::Leave => {
                let options = r.u8()?;
                Self::Leave(Leave {
                    rejoin: options & (1 << 5) != 0,
                    request: options & (1 << 6) != 0,
                    remove_children: options & (1 << 7) != 0,
                })
            }
            CommandId::RouteRecord => {
                let count = r.u8()? as usize;
                let relays = (0..count).map(|_| r.addr()).collect::<CodecResult<_>>()?;
                Self::RouteRecord(RouteRecord { relays })
            }
            CommandId::RejoinRequest => Self::RejoinRequest(RejoinRequest {
                capability: Capability(r.u8()?),
            }),
            CommandId::RejoinResponse => {
                let short_addr = r.addr()?;
                let status =
                    NwkStatus::try_from(r.u8()?).map_err(|_| r.malformed("unknown status"))?;
                Self::RejoinResponse(RejoinResponse { short_addr, status })
            }
            CommandId::LinkStatus => {
                let options = r.u8()?;
                let count = (options & 0x1F) as usize;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let addr = r.addr()?;
                    let costs = r.u8()?;
                    entries.push(LinkStatusEntry {
                        addr,
                        incoming_cost: costs & 0x07,
                        outgoing_cost: (costs >> 4) & 0x07,
                    });
                }
                Self::LinkStatus(LinkStatus {
                    first_frame: options & (1 << 5) != 0,
                    last_frame: options & (1 << 6) != 0,
                    entries,
                })
            }
            CommandId::NetworkReport => {
                let options = r.u8()?;
                let ext_pan_id = ExtPanId(r.u64()?);
                let pan_ids = (0..(options & 0x1F))
                    .map(|_| r.u16().map(PanId))
                    .collect::<CodecResult<_>>()?;
                Self::NetworkReport(NetworkReport {
                    report_type: options >> 5,
                    ext_pan_id,
                    pan_ids,
                })
            }
            CommandId::NetworkUpdate => {
                let options = r.u8()?;
                let ext_pan_id = ExtPanId(r.u64()?);
                let update_id = r.u8()?;
                let pan_ids = (0..(options & 0x1F))
                    .map(|_| r.u16().map(PanId))
                    .collect::<CodecResult<_>>()?;
                Self::NetworkUpdate(NetworkUpdate {
                    update_type: options >> 5,
                    ext_pan_id,
                    update_id,
                    pan_ids,
                })
            }
            CommandId::EndDeviceTimeoutRequest => {
                let requested_timeout = r.u8()?;
                if requested_timeout > MAX_REQUESTED_TIMEOUT {
                    return Err(r.malformed("requested timeout out of range"));
                }
                Self::EndDeviceTimeoutRequest(EndDeviceTimeoutRequest {
                    requested_timeout,
                    end_device_config: r.u8()?,
                })
            }
            CommandId::EndDeviceTimeoutResponse => {
                Self::EndDeviceTimeoutResponse(EndDeviceTimeoutResponse {
                    status: r.u8()?,
                    parent_info: r.u8()?,
                })
            }
        };

        Ok(cmd)
    }
}

/// Length-checked reader producing `MalformedCommand` on short input
struct Reader<'a> {
    buf: &'a mut Bytes,
    id: CommandId,
}

impl Reader<'_> {
    fn malformed(&self, reason: &'static str) -> CodecError {
        CodecError::MalformedCommand {
            command: self.id.name(),
            reason,
        }
    }

    fn need(&self, n: usize) -> CodecResult<()> {
        if self.buf.remaining() < n {
            Err(self.malformed("payload too short"))
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> CodecResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> CodecResult<u16> {
        self.need(2)?;
        Ok(self.buf.get_u16_le())
    }

    fn u64(&mut self) -> CodecResult<u64> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn addr(&mut self) -> CodecResult<ShortAddr> {
        self.u16().map(ShortAddr)
    }

    fn ieee(&mut self) -> CodecResult<ExtAddr> {
        self.u64().map(ExtAddr)
    }
}
