//! Simulated MAC
//!
//! [`SimMac`] implements [`MacService`] by queueing every request in an
//! outbox. The [`Simulation`](crate::Simulation) drains the outboxes each
//! pass and turns the actions into events at the nodes in radio range.

use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use nwkmesh_core::{
    AssociateRequest, ExtAddr, MacError, MacHandle, MacNetworkParams, MacService, NwkStatus,
    ShortAddr,
};

/// A MAC request waiting for the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacAction {
    Send {
        handle: MacHandle,
        dst: ShortAddr,
        payload: Bytes,
    },
    Scan {
        channels: u32,
        duration: u8,
    },
    Associate(AssociateRequest),
    AssociateResponse {
        device: ExtAddr,
        short_addr: ShortAddr,
        status: NwkStatus,
    },
}

#[derive(Debug, Default)]
struct SimMacState {
    next_handle: u32,
    outbox: Vec<MacAction>,
    params: Option<MacNetworkParams>,
    resets: usize,
}

/// Outbox-backed MAC; clones share one outbox
#[derive(Debug, Clone, Default)]
pub struct SimMac {
    state: Arc<Mutex<SimMacState>>,
}

impl SimMac {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SimMacState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drain queued actions in the order they were requested
    pub fn take_actions(&self) -> Vec<MacAction> {
        std::mem::take(&mut self.state().outbox)
    }

    pub fn pending(&self) -> usize {
        self.state().outbox.len()
    }

    /// Parameters from the last `configure`, cleared by `reset`
    pub fn params(&self) -> Option<MacNetworkParams> {
        self.state().params.clone()
    }

    pub fn resets(&self) -> usize {
        self.state().resets
    }
}

impl MacService for SimMac {
    fn send_frame(&mut self, dst: ShortAddr, payload: Bytes) -> Result<MacHandle, MacError> {
        let mut state = self.state();
        state.next_handle = state.next_handle.wrapping_add(1);
        let handle = MacHandle(state.next_handle);
        state.outbox.push(MacAction::Send {
            handle,
            dst,
            payload,
        });
        Ok(handle)
    }

    fn start_active_scan(&mut self, channels: u32, duration: u8) -> Result<(), MacError> {
        self.state()
            .outbox
            .push(MacAction::Scan { channels, duration });
        Ok(())
    }

    fn associate(&mut self, request: AssociateRequest) -> Result<(), MacError> {
        self.state().outbox.push(MacAction::Associate(request));
        Ok(())
    }

    fn associate_response(
        &mut self,
        device: ExtAddr,
        short_addr: ShortAddr,
        status: NwkStatus,
    ) -> Result<(), MacError> {
        self.state().outbox.push(MacAction::AssociateResponse {
            device,
            short_addr,
            status,
        });
        Ok(())
    }

    fn configure(&mut self, params: &MacNetworkParams) -> Result<(), MacError> {
        self.state().params = Some(params.clone());
        Ok(())
    }

    fn reset(&mut self) {
        let mut state = self.state();
        state.params = None;
        state.outbox.clear();
        state.resets += 1;
    }
}
