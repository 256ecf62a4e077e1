//! Network information base
//!
//! Run-time state of the layer plus the configuration it was started
//! with. NLME-GET/SET read and write through [`Nib::get`] and [`Nib::set`].

use std::time::Duration;

use nwkmesh_core::{ExtAddr, ExtPanId, NibAttribute, NibError, NibValue, PanId, ShortAddr};
use serde::{Deserialize, Serialize};

use crate::config::{AddrAllocMethod, NwkConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nib {
    pub config: NwkConfig,
    pub pan_id: PanId,
    pub ext_pan_id: ExtPanId,
    pub short_addr: ShortAddr,
    pub ieee_addr: ExtAddr,
    pub channel: u8,
    pub depth: u8,
    pub update_id: u8,
    pub seq: u8,
    pub manager_addr: ShortAddr,
    pub use_tree_routing: bool,
    pub all_fresh: bool,
    pub unique_addr: bool,
}

impl Nib {
    pub fn new(config: NwkConfig, ieee_addr: ExtAddr) -> Self {
        let use_tree_routing = config.addr_alloc == AddrAllocMethod::Distributed;
        Self {
            config,
            pan_id: PanId(0xFFFF),
            ext_pan_id: ExtPanId(0),
            short_addr: ShortAddr::UNASSIGNED,
            ieee_addr,
            channel: 0,
            depth: 0,
            update_id: 0,
            seq: 0,
            manager_addr: ShortAddr::COORDINATOR,
            use_tree_routing,
            all_fresh: true,
            unique_addr: false,
        }
    }

    /// Next NWK sequence number
    pub fn next_seq(&mut self) -> u8 {
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);
        seq
    }

    pub fn is_joined(&self) -> bool {
        self.short_addr != ShortAddr::UNASSIGNED
    }

    /// Forget the network but keep configuration and identity
    pub fn leave_network(&mut self) {
        self.pan_id = PanId(0xFFFF);
        self.ext_pan_id = ExtPanId(0);
        self.short_addr = ShortAddr::UNASSIGNED;
        self.channel = 0;
        self.depth = 0;
        self.update_id = 0;
    }

    pub fn get(&self, attribute: NibAttribute) -> NibValue {
        use NibAttribute as A;
        let c = &self.config;
        match attribute {
            A::PanId => NibValue::Pan(self.pan_id),
            A::SequenceNumber => NibValue::U8(self.seq),
            A::PassiveAckTimeout => NibValue::U32(millis(c.passive_ack_timeout)),
            A::MaxBroadcastRetries => NibValue::U8(c.max_broadcast_retries),
            A::MaxChildren => NibValue::U8(c.max_children),
            A::MaxDepth => NibValue::U8(c.max_depth),
            A::MaxRouters => NibValue::U8(c.max_routers),
            A::BroadcastDeliveryTime => NibValue::U32(millis(c.broadcast_delivery_time)),
            A::ReportConstantCost => NibValue::Bool(c.report_constant_cost),
            A::RouteDiscoveryRetriesPermitted => NibValue::U8(c.initial_rreq_retries),
            A::SymLink => NibValue::Bool(c.sym_link),
            A::AddrAlloc => NibValue::U8(match c.addr_alloc {
                AddrAllocMethod::Distributed => 0,
                AddrAllocMethod::Stochastic => 2,
            }),
            A::UseTreeRouting => NibValue::Bool(self.use_tree_routing),
            A::ManagerAddr => NibValue::Short(self.manager_addr),
            A::MaxSourceRoute => NibValue::U8(c.max_source_route),
            A::UpdateId => NibValue::U8(self.update_id),
            A::TransactionPersistenceTime => NibValue::U16(c.transaction_persistence_time),
            A::NetworkAddress => NibValue::Short(self.short_addr),
            A::StackProfile => NibValue::U8(c.stack_profile),
            A::ExtendedPanId => NibValue::ExtPan(self.ext_pan_id),
            A::UseMulticast => NibValue::Bool(c.use_multicast),
            A::IsConcentrator => NibValue::Bool(c.is_concentrator),
            A::ConcentratorRadius => NibValue::U8(c.concentrator_radius),
            A::ConcentratorDiscoveryTime => NibValue::U16(c.concentrator_discovery_time),
            A::SecurityLevel => NibValue::U8(c.security_level),
            A::AllFresh => NibValue::Bool(self.all_fresh),
            A::SecureAllFrames => NibValue::Bool(c.secure_all_frames),
            A::LinkStatusPeriod => NibValue::U8(c.link_status_period.as_secs().min(255) as u8),
            A::RouterAgeLimit => NibValue::U8(c.router_age_limit),
            A::UniqueAddr => NibValue::Bool(self.unique_addr),
            A::LeaveRequestAllowed => NibValue::Bool(c.leave_request_allowed),
            A::EndDeviceTimeoutDefault => NibValue::U8(c.end_device_timeout_default),
            A::IeeeAddress => NibValue::Ext(self.ieee_addr),
        }
    }

    pub fn set(&mut self, attribute: NibAttribute, value: NibValue) -> Result<(), NibError> {
        use NibAttribute as A;
        if attribute.is_read_only() {
            return Err(NibError::ReadOnly(attribute as u8));
        }
        let invalid = || NibError::InvalidValue(attribute as u8);
        let byte = || value.as_u8().ok_or_else(invalid);
        let flag = || value.as_bool().ok_or_else(invalid);
        let wide = || value.as_u32().ok_or_else(invalid);

        let c = &mut self.config;
        match attribute {
            A::PanId => match value {
                NibValue::Pan(pan) => self.pan_id = pan,
                _ => return Err(invalid()),
            },
            A::SequenceNumber => self.seq = byte()?,
            A::PassiveAckTimeout => c.passive_ack_timeout = non_zero_millis(wide()?).ok_or_else(invalid)?,
            A::MaxBroadcastRetries => c.max_broadcast_retries = byte()?,
            A::MaxChildren => c.max_children = byte()?,
            A::MaxDepth => {
                let depth = byte()?;
                if depth == 0 || depth > 15 {
                    return Err(invalid());
                }
                c.max_depth = depth;
            }
            A::MaxRouters => c.max_routers = byte()?,
            A::BroadcastDeliveryTime => {
                c.broadcast_delivery_time = non_zero_millis(wide()?).ok_or_else(invalid)?
            }
            A::ReportConstantCost => c.report_constant_cost = flag()?,
            A::RouteDiscoveryRetriesPermitted => c.initial_rreq_retries = byte()?,
            A::SymLink => c.sym_link = flag()?,
            A::AddrAlloc => {
                c.addr_alloc = match byte()? {
                    0 => AddrAllocMethod::Distributed,
                    2 => AddrAllocMethod::Stochastic,
                    _ => return Err(invalid()),
                }
            }
            A::UseTreeRouting => self.use_tree_routing = flag()?,
            A::ManagerAddr => match value {
                NibValue::Short(addr) => self.manager_addr = addr,
                _ => return Err(invalid()),
            },
            A::MaxSourceRoute => {
                let hops = byte()?;
                if hops > 0x1F {
                    return Err(invalid());
                }
                c.max_source_route = hops;
            }
            A::UpdateId => self.update_id = byte()?,
            A::TransactionPersistenceTime => {
                c.transaction_persistence_time = u16::try_from(wide()?).map_err(|_| invalid())?
            }
            A::StackProfile => c.stack_profile = byte()?,
            A::ExtendedPanId => match value {
                NibValue::ExtPan(pan) => self.ext_pan_id = pan,
                _ => return Err(invalid()),
            },
            A::UseMulticast => c.use_multicast = flag()?,
            A::IsConcentrator => c.is_concentrator = flag()?,
            A::ConcentratorRadius => c.concentrator_radius = byte()?,
            A::ConcentratorDiscoveryTime => {
                c.concentrator_discovery_time = u16::try_from(wide()?).map_err(|_| invalid())?
            }
            A::SecurityLevel => {
                let level = byte()?;
                if level > 7 {
                    return Err(invalid());
                }
                c.security_level = level;
            }
            A::AllFresh => self.all_fresh = flag()?,
            A::SecureAllFrames => c.secure_all_frames = flag()?,
            A::LinkStatusPeriod => {
                let secs = byte()?;
                if secs == 0 {
                    return Err(invalid());
                }
                c.link_status_period = Duration::from_secs(secs as u64);
            }
            A::RouterAgeLimit => c.router_age_limit = byte()?,
            A::UniqueAddr => self.unique_addr = flag()?,
            A::LeaveRequestAllowed => c.leave_request_allowed = flag()?,
            A::EndDeviceTimeoutDefault => {
                let timeout = byte()?;
                if timeout > nwkmesh_core::command::MAX_REQUESTED_TIMEOUT {
                    return Err(invalid());
                }
                c.end_device_timeout_default = timeout;
            }
            A::NetworkAddress | A::IeeeAddress => return Err(NibError::ReadOnly(attribute as u8)),
        }
        Ok(())
    }
}

fn millis(d: Duration) -> u32 {
    d.as_millis().min(u32::MAX as u128) as u32
}

fn non_zero_millis(ms: u32) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}
