//! Node context injection for multi-node logging
//!
//! Several simulated nodes can share one thread. A [`NodeContextGuard`]
//! marks which node the current code runs on behalf of, so every span
//! created in its scope carries that node's addresses.

use std::cell::RefCell;

use nwkmesh_core::{DeviceType, ExtAddr, ShortAddr};
use uuid::Uuid;

/// Node context data stored in thread-local storage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeContextData {
    pub short_addr: ShortAddr,
    pub ieee_addr: ExtAddr,
    pub device_type: DeviceType,
    /// Unique instance ID for this node session
    pub instance_id: Uuid,
}

thread_local! {
    static NODE_CONTEXT: RefCell<Option<NodeContextData>> = const { RefCell::new(None) };
}

/// RAII guard for node context
///
/// Sets the node context for the current thread on creation and restores
/// the previous one (if any) on drop, so guards nest.
///
/// ```ignore
/// use nwkmesh_logging::NodeContextGuard;
///
/// let _guard = NodeContextGuard::new(layer.short_addr(), layer.ieee_addr(), DeviceType::Router);
/// tracing::info!("joined");
/// ```
pub struct NodeContextGuard {
    previous: Option<NodeContextData>,
}

impl NodeContextGuard {
    pub fn new(short_addr: ShortAddr, ieee_addr: ExtAddr, device_type: DeviceType) -> Self {
        Self::with_instance_id(short_addr, ieee_addr, device_type, Uuid::new_v4())
    }

    /// Create a guard with a specific instance ID
    ///
    /// Lets a simulation keep one instance ID per node across steps.
    pub fn with_instance_id(
        short_addr: ShortAddr,
        ieee_addr: ExtAddr,
        device_type: DeviceType,
        instance_id: Uuid,
    ) -> Self {
        let context = NodeContextData {
            short_addr,
            ieee_addr,
            device_type,
            instance_id,
        };
        let previous = NODE_CONTEXT.with(|ctx| ctx.borrow_mut().replace(context));
        Self { previous }
    }

    /// Get the current node context (if any)
    pub fn current() -> Option<NodeContextData> {
        NODE_CONTEXT.with(|ctx| ctx.borrow().clone())
    }

    pub fn current_short_addr() -> Option<ShortAddr> {
        Self::current().map(|ctx| ctx.short_addr)
    }

    pub fn current_instance_id() -> Option<Uuid> {
        Self::current().map(|ctx| ctx.instance_id)
    }
}

impl Drop for NodeContextGuard {
    fn drop(&mut self) {
        NODE_CONTEXT.with(|ctx| *ctx.borrow_mut() = self.previous.take());
    }
}

/// Run a block with a node context set
///
/// ```ignore
/// with_node_context!(short, ieee, DeviceType::Router, {
///     tracing::info!("processing frame");
/// });
/// ```
#[macro_export]
macro_rules! with_node_context {
    ($short:expr, $ieee:expr, $device_type:expr, $body:block) => {{
        let _guard = $crate::context::NodeContextGuard::new($short, $ieee, $device_type);
        $body
    }};
}
