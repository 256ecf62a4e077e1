//! # NWK Frame Header
//!
//! Over-the-air layout of the network header, little-endian:
//!
//! ```text
//! [frame control:2][dst:2][src:2][radius:1][seq:1]
//! [dst ieee:8]?  [src ieee:8]?  [multicast control:1]?
//! [relay count:1][relay index:1][relay list:2*n]?
//! ```
//!
//! Frame control bits:
//!
//! - bits 0-1: frame type (0 data, 1 command, 3 inter-PAN)
//! - bits 2-5: protocol version
//! - bits 6-7: discover route
//! - bit 8: multicast
//! - bit 9: security
//! - bit 10: source route present
//! - bit 11: destination IEEE present
//! - bit 12: source IEEE present
//! - bit 13: end-device initiator

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::address::{ExtAddr, ShortAddr};
use crate::error::{CodecError, CodecResult};

/// Protocol version written into outgoing frames
pub const PROTOCOL_VERSION: u8 = 2;

/// Fixed part of the header
pub const MIN_HEADER_LEN: usize = 8;

/// Largest NWK frame the MAC will carry
pub const MAX_FRAME_LEN: usize = 116;

const FC_SECURITY: u16 = 1 << 9;
const FC_MULTICAST: u16 = 1 << 8;
const FC_SOURCE_ROUTE: u16 = 1 << 10;
const FC_DST_IEEE: u16 = 1 << 11;
const FC_SRC_IEEE: u16 = 1 << 12;
const FC_END_DEVICE_INITIATOR: u16 = 1 << 13;

/// NWK frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Command = 1,
    InterPan = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Data),
            1 => Ok(Self::Command),
            3 => Ok(Self::InterPan),
            _ => Err(CodecError::UnknownFrameType(value)),
        }
    }
}

/// Multicast control octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MulticastControl {
    /// 0 non-member mode, 1 member mode
    pub mode: u8,
    pub nonmember_radius: u8,
    pub max_nonmember_radius: u8,
}

impl MulticastControl {
    fn to_byte(self) -> u8 {
        (self.mode & 0x03)
            | ((self.nonmember_radius & 0x07) << 2)
            | ((self.max_nonmember_radius & 0x07) << 5)
    }

    fn from_byte(b: u8) -> Self {
        Self {
            mode: b & 0x03,
            nonmember_radius: (b >> 2) & 0x07,
            max_nonmember_radius: (b >> 5) & 0x07,
        }
    }
}

/// Source-route subframe
///
/// `relays[0]` is the relay closest to the destination; the originator
/// starts with `relay_index = relays.len() - 1` and each hop decrements it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRoute {
    pub relay_index: u8,
    pub relays: Vec<ShortAddr>,
}

impl SourceRoute {
    /// Build a source route from the relay list in forward order (first
    /// relay after the originator first)
    pub fn from_forward_path(path: &[ShortAddr]) -> Self {
        let relays: Vec<ShortAddr> = path.iter().rev().copied().collect();
        Self {
            relay_index: relays.len().saturating_sub(1) as u8,
            relays,
        }
    }

    /// Relay that should receive the frame next
    pub fn current_relay(&self) -> Option<ShortAddr> {
        self.relays.get(self.relay_index as usize).copied()
    }
}

/// Decoded network header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NwkHeader {
    pub frame_type: FrameType,
    pub protocol_version: u8,
    pub discover_route: bool,
    pub security: bool,
    pub end_device_initiator: bool,
    pub dst: ShortAddr,
    pub src: ShortAddr,
    pub radius: u8,
    pub seq: u8,
    pub dst_ieee: Option<ExtAddr>,
    pub src_ieee: Option<ExtAddr>,
    pub multicast: Option<MulticastControl>,
    pub source_route: Option<SourceRoute>,
}

impl NwkHeader {
    /// Header for a data frame
    pub fn data(dst: ShortAddr, src: ShortAddr, radius: u8, seq: u8) -> Self {
        Self {
            frame_type: FrameType::Data,
            protocol_version: PROTOCOL_VERSION,
            discover_route: true,
            security: false,
            end_device_initiator: false,
            dst,
            src,
            radius,
            seq,
            dst_ieee: None,
            src_ieee: None,
            multicast: None,
            source_route: None,
        }
    }

    /// Header for a command frame
    pub fn command(dst: ShortAddr, src: ShortAddr, radius: u8, seq: u8) -> Self {
        Self {
            frame_type: FrameType::Command,
            ..Self::data(dst, src, radius, seq)
        }
    }

    pub fn with_src_ieee(mut self, ieee: ExtAddr) -> Self {
        self.src_ieee = Some(ieee);
        self
    }

    pub fn with_dst_ieee(mut self, ieee: ExtAddr) -> Self {
        self.dst_ieee = Some(ieee);
        self
    }

    pub fn with_source_route(mut self, route: SourceRoute) -> Self {
        self.source_route = Some(route);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst.is_broadcast()
    }

    fn frame_control(&self) -> u16 {
        let mut fc = (self.frame_type as u16 & 0x03)
            | ((self.protocol_version as u16 & 0x0F) << 2)
            | ((self.discover_route as u16) << 6);
        if self.multicast.is_some() {
            fc |= FC_MULTICAST;
        }
        if self.security {
            fc |= FC_SECURITY;
        }
        if self.source_route.is_some() {
            fc |= FC_SOURCE_ROUTE;
        }
        if self.dst_ieee.is_some() {
            fc |= FC_DST_IEEE;
        }
        if self.src_ieee.is_some() {
            fc |= FC_SRC_IEEE;
        }
        if self.end_device_initiator {
            fc |= FC_END_DEVICE_INITIATOR;
        }
        fc
    }

    /// Encoded length of the header
    pub fn encoded_len(&self) -> usize {
        MIN_HEADER_LEN
            + self.dst_ieee.map_or(0, |_| 8)
            + self.src_ieee.map_or(0, |_| 8)
            + self.multicast.map_or(0, |_| 1)
            + self
                .source_route
                .as_ref()
                .map_or(0, |r| 2 + 2 * r.relays.len())
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16_le(self.frame_control());
        buf.put_u16_le(self.dst.0);
        buf.put_u16_le(self.src.0);
        buf.put_u8(self.radius);
        buf.put_u8(self.seq);
        if let Some(ieee) = self.dst_ieee {
            buf.put_u64_le(ieee.0);
        }
        if let Some(ieee) = self.src_ieee {
            buf.put_u64_le(ieee.0);
        }
        if let Some(mcast) = self.multicast {
            buf.put_u8(mcast.to_byte());
        }
        if let Some(route) = &self.source_route {
            buf.put_u8(route.relays.len() as u8);
            buf.put_u8(route.relay_index);
            for relay in &route.relays {
                buf.put_u16_le(relay.0);
            }
        }
    }

    pub fn decode(buf: &mut impl Buf) -> CodecResult<Self> {
        ensure(buf, MIN_HEADER_LEN)?;
        let fc = buf.get_u16_le();
        let frame_type = FrameType::try_from((fc & 0x03) as u8)?;
        let protocol_version = ((fc >> 2) & 0x0F) as u8;
        let discover_route = (fc >> 6) & 0x03 != 0;

        let dst = ShortAddr(buf.get_u16_le());
        let src = ShortAddr(buf.get_u16_le());
        let radius = buf.get_u8();
        let seq = buf.get_u8();

        let dst_ieee = if fc & FC_DST_IEEE != 0 {
            ensure(buf, 8)?;
            Some(ExtAddr(buf.get_u64_le()))
        } else {
            None
        };
        let src_ieee = if fc & FC_SRC_IEEE != 0 {
            ensure(buf, 8)?;
            Some(ExtAddr(buf.get_u64_le()))
        } else {
            None
        };
        let multicast = if fc & FC_MULTICAST != 0 {
            ensure(buf, 1)?;
            Some(MulticastControl::from_byte(buf.get_u8()))
        } else {
            None
        };
        let source_route = if fc & FC_SOURCE_ROUTE != 0 {
            ensure(buf, 2)?;
            let count = buf.get_u8() as usize;
            let relay_index = buf.get_u8();
            ensure(buf, 2 * count)?;
            let relays = (0..count).map(|_| ShortAddr(buf.get_u16_le())).collect();
            if count > 0 && relay_index as usize >= count {
                return Err(CodecError::InvalidField("relay index", relay_index));
            }
            Some(SourceRoute {
                relay_index,
                relays,
            })
        } else {
            None
        };

        Ok(Self {
            frame_type,
            protocol_version,
            discover_route,
            security: fc & FC_SECURITY != 0,
            end_device_initiator: fc & FC_END_DEVICE_INITIATOR != 0,
            dst,
            src,
            radius,
            seq,
            dst_ieee,
            src_ieee,
            multicast,
            source_route,
        })
    }
}

/// A complete NWK frame: header plus (possibly protected) payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NwkFrame {
    pub header: NwkHeader,
    pub payload: Bytes,
}

impl NwkFrame {
    pub fn new(header: NwkHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.encoded_len() + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> CodecResult<Self> {
        let header = NwkHeader::decode(&mut bytes)?;
        Ok(Self {
            header,
            payload: bytes,
        })
    }
}

pub(crate) fn ensure(buf: &impl Buf, needed: usize) -> CodecResult<()> {
    if buf.remaining() < needed {
        Err(CodecError::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}
