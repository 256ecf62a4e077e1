//! In-memory collaborators for tests and simulation
//!
//! Every mock shares its state behind an `Arc`, so a test can keep a clone
//! for inspection while the network layer owns the other one.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use nwkmesh_core::{MockMac, ShortAddr};
//!
//! let mac = MockMac::new();
//! let observer = mac.clone();
//! // hand `mac` to the network layer, then:
//! let frames = observer.take_sent();
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::address::{ExtAddr, ShortAddr};
use crate::error::{MacError, SecurityError, StorageError};
use crate::frame::NwkHeader;
use crate::status::NwkStatus;
use crate::traits::{
    AssociateRequest, Clock, MacHandle, MacNetworkParams, MacService, PersistentStore,
    SecurityService,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A frame handed to the mock MAC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentFrame {
    pub handle: MacHandle,
    pub dst: ShortAddr,
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct MockMacState {
    next_handle: u32,
    sent: Vec<SentFrame>,
    scans: Vec<(u32, u8)>,
    associations: Vec<AssociateRequest>,
    associate_responses: Vec<(ExtAddr, ShortAddr, NwkStatus)>,
    params: Option<MacNetworkParams>,
    fail_sends: bool,
    resets: usize,
}

/// Recording MAC that never touches a radio
#[derive(Debug, Clone, Default)]
pub struct MockMac {
    state: Arc<Mutex<MockMacState>>,
}

impl MockMac {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain the frames queued since the last call
    pub fn take_sent(&self) -> Vec<SentFrame> {
        std::mem::take(&mut lock(&self.state).sent)
    }

    pub fn sent_count(&self) -> usize {
        lock(&self.state).sent.len()
    }

    pub fn scans(&self) -> Vec<(u32, u8)> {
        lock(&self.state).scans.clone()
    }

    pub fn take_associations(&self) -> Vec<AssociateRequest> {
        std::mem::take(&mut lock(&self.state).associations)
    }

    pub fn take_associate_responses(&self) -> Vec<(ExtAddr, ShortAddr, NwkStatus)> {
        std::mem::take(&mut lock(&self.state).associate_responses)
    }

    pub fn params(&self) -> Option<MacNetworkParams> {
        lock(&self.state).params.clone()
    }

    pub fn resets(&self) -> usize {
        lock(&self.state).resets
    }

    /// Make every following `send_frame` fail with a full queue
    pub fn set_fail_sends(&self, fail: bool) {
        lock(&self.state).fail_sends = fail;
    }
}

impl MacService for MockMac {
    fn send_frame(&mut self, dst: ShortAddr, payload: Bytes) -> Result<MacHandle, MacError> {
        let mut state = lock(&self.state);
        if state.fail_sends {
            return Err(MacError::QueueFull);
        }
        state.next_handle = state.next_handle.wrapping_add(1);
        let handle = MacHandle(state.next_handle);
        state.sent.push(SentFrame {
            handle,
            dst,
            payload,
        });
        Ok(handle)
    }

    fn start_active_scan(&mut self, channels: u32, duration: u8) -> Result<(), MacError> {
        lock(&self.state).scans.push((channels, duration));
        Ok(())
    }

    fn associate(&mut self, request: AssociateRequest) -> Result<(), MacError> {
        lock(&self.state).associations.push(request);
        Ok(())
    }

    fn associate_response(
        &mut self,
        device: ExtAddr,
        short_addr: ShortAddr,
        status: NwkStatus,
    ) -> Result<(), MacError> {
        lock(&self.state)
            .associate_responses
            .push((device, short_addr, status));
        Ok(())
    }

    fn configure(&mut self, params: &MacNetworkParams) -> Result<(), MacError> {
        lock(&self.state).params = Some(params.clone());
        Ok(())
    }

    fn reset(&mut self) {
        let mut state = lock(&self.state);
        state.params = None;
        state.resets += 1;
    }
}

/// Manually advanced clock
#[derive(Debug, Clone)]
pub struct MockClock {
    now: Arc<Mutex<Instant>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self {
            now: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        *lock(&self.now)
    }
}

/// Store that keeps the latest snapshot in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    blob: Arc<Mutex<Option<Vec<u8>>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a blob, e.g. to simulate corrupted flash
    pub fn with_blob(blob: Vec<u8>) -> Self {
        let store = Self::default();
        *lock(&store.blob) = Some(blob);
        store
    }

    pub fn saves(&self) -> usize {
        *lock(&self.saves)
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        lock(&self.blob).clone()
    }
}

impl PersistentStore for MemoryStore {
    fn save(&mut self, snapshot: &[u8]) -> Result<(), StorageError> {
        *lock(&self.blob) = Some(snapshot.to_vec());
        *lock(&self.saves) += 1;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(lock(&self.blob).clone())
    }

    fn clear(&mut self) -> Result<(), StorageError> {
        *lock(&self.blob) = None;
        Ok(())
    }
}

/// Toy frame protection with a real frame counter
///
/// Layout: `[frame counter:4][payload ^ key][tag:1]`. Not cryptography; it
/// only exercises counter and authentication paths.
#[derive(Debug, Clone)]
pub struct MockSecurity {
    key: u8,
    outgoing: u32,
    incoming: HashMap<ShortAddr, u32>,
}

impl MockSecurity {
    pub fn new(key: u8) -> Self {
        Self {
            key,
            outgoing: 0,
            incoming: HashMap::new(),
        }
    }

    /// Start the outgoing counter somewhere other than zero
    pub fn with_frame_counter(mut self, counter: u32) -> Self {
        self.outgoing = counter;
        self
    }

    fn tag(&self, plain: &[u8]) -> u8 {
        plain.iter().fold(self.key, |acc, b| acc.rotate_left(1) ^ b)
    }
}

impl SecurityService for MockSecurity {
    fn protect(&mut self, _header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError> {
        if self.outgoing == u32::MAX {
            return Err(SecurityError::MaxFrameCounter);
        }
        let mut out = BytesMut::with_capacity(payload.len() + 5);
        out.put_u32_le(self.outgoing);
        out.extend(payload.iter().map(|b| b ^ self.key));
        out.put_u8(self.tag(&payload));
        self.outgoing += 1;
        Ok(out.freeze())
    }

    fn unprotect(&mut self, header: &NwkHeader, payload: Bytes) -> Result<Bytes, SecurityError> {
        if payload.len() < 5 {
            return Err(SecurityError::BadCcmOutput);
        }
        let mut buf = payload.clone();
        let counter = buf.get_u32_le();
        if let Some(&last) = self.incoming.get(&header.src) {
            if counter <= last {
                return Err(SecurityError::Replay(counter));
            }
        }
        let body_len = buf.remaining() - 1;
        let plain: Vec<u8> = buf[..body_len].iter().map(|b| b ^ self.key).collect();
        if buf[body_len] != self.tag(&plain) {
            return Err(SecurityError::AuthFailure);
        }
        self.incoming.insert(header.src, counter);
        Ok(Bytes::from(plain))
    }

    fn frame_counter(&self) -> u32 {
        self.outgoing
    }
}
